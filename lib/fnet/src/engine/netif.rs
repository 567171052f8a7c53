// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Network interfaces.
//!
//! A [`Netif`] is the IP core's view of a link: its addresses, its MTU
//! and the [`NetifDriver`] that frames and transmits packets. Address
//! resolution (ARP, Neighbor Discovery) is the driver's business.

use super::queue::InputHandle;
use crate::sys::netbuf::NetBuf;
use alloc::boxed::Box;
use alloc::string::String;
use alloc::vec::Vec;
use core::fmt;
use core::fmt::Display;
use fnet_api::Error;
use fnet_api::Ipv4Addr;
use fnet_api::Ipv6Addr;
use serde::Deserialize;
use serde::Serialize;

/// The maximum number of IPv6 addresses on one interface.
pub const IP6_IF_ADDR_MAX: usize = 8;

/// The IPv6 minimum link MTU (RFC 8200 §5).
pub const IP6_MIN_MTU: u16 = 1280;

/// The IPv4 minimum datagram every host must accept unfragmented.
pub const IP4_MIN_MTU: u16 = 68;

/// A handle on an interface of one [`Stack`].
///
/// The value is the interface index as a socket API sees it: the first
/// interface is 1, and 0 is reserved to mean "the default interface".
///
/// [`Stack`]: crate::engine::stack::Stack
#[derive(
    Clone,
    Copy,
    Debug,
    Deserialize,
    Eq,
    Hash,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
)]
pub struct NetifId(u16);

impl NetifId {
    pub const fn new(id: u16) -> Self {
        Self(id)
    }

    pub fn index(&self) -> u32 {
        u32::from(self.0)
    }

    /// The position in the stack's interface list.
    pub(crate) fn slot(&self) -> Option<usize> {
        usize::from(self.0).checked_sub(1)
    }

    pub(crate) fn from_slot(slot: usize) -> Option<Self> {
        u16::try_from(slot + 1).ok().map(Self)
    }
}

impl Display for NetifId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "if{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum Ip6AddrState {
    /// Duplicate address detection has not finished. The address is
    /// neither a valid source nor a valid destination.
    Tentative,
    Preferred,
    /// Still valid, but avoided as a source for new traffic.
    Deprecated,
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Ip6IfAddr {
    pub addr: Ipv6Addr,
    pub prefix_len: u8,
    pub state: Ip6AddrState,
}

impl Ip6IfAddr {
    pub fn preferred(addr: Ipv6Addr, prefix_len: u8) -> Self {
        Self { addr, prefix_len, state: Ip6AddrState::Preferred }
    }

    pub fn is_usable(&self) -> bool {
        self.state != Ip6AddrState::Tentative
    }
}

/// Interface configuration.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default)]
pub struct NetifCfg {
    pub name: String,
    pub mtu: u16,
    pub ip4_addr: Option<Ipv4Addr>,
    pub ip4_netmask: Ipv4Addr,
    pub ip4_gateway: Option<Ipv4Addr>,
    pub ip6_addrs: Vec<Ip6IfAddr>,
    /// Zero means use the stack default.
    pub hop_limit: u8,
}

impl Default for NetifCfg {
    fn default() -> Self {
        Self {
            name: String::from("eth0"),
            mtu: 1500,
            ip4_addr: None,
            ip4_netmask: Ipv4Addr::ANY_ADDR,
            ip4_gateway: None,
            ip6_addrs: Vec::new(),
            hop_limit: 0,
        }
    }
}

/// The link layer below an interface.
///
/// Both output methods take ownership of the packet, which starts
/// with the IP header.
pub trait NetifDriver: Send {
    /// Transmit an IPv4 datagram to the link neighbour `next_hop`.
    fn output_ip4(
        &mut self,
        next_hop: Ipv4Addr,
        pkt: NetBuf,
    ) -> Result<(), Error>;

    /// Transmit an IPv6 packet to `dst`; neighbour resolution is up to
    /// the driver.
    fn output_ip6(&mut self, dst: Ipv6Addr, pkt: NetBuf) -> Result<(), Error>;

    fn multicast_join4(&mut self, _group: Ipv4Addr) {}
    fn multicast_leave4(&mut self, _group: Ipv4Addr) {}
    fn multicast_join6(&mut self, _group: Ipv6Addr) {}
    fn multicast_leave6(&mut self, _group: Ipv6Addr) {}
}

/// The software loopback link: everything sent is received again
/// through the input queues.
pub struct Loopback {
    id: NetifId,
    input: InputHandle,
}

impl Loopback {
    pub fn new(id: NetifId, input: InputHandle) -> Self {
        Self { id, input }
    }
}

impl NetifDriver for Loopback {
    fn output_ip4(&mut self, _: Ipv4Addr, pkt: NetBuf) -> Result<(), Error> {
        self.input.ip4_input(self.id, pkt);
        Ok(())
    }

    fn output_ip6(&mut self, _: Ipv6Addr, pkt: NetBuf) -> Result<(), Error> {
        self.input.ip6_input(self.id, pkt);
        Ok(())
    }
}

pub struct Netif {
    id: NetifId,
    name: String,
    mtu: u16,
    pmtu6: u16,
    ip4_addr: Option<Ipv4Addr>,
    ip4_netmask: Ipv4Addr,
    ip4_gateway: Option<Ipv4Addr>,
    ip6_addrs: heapless::Vec<Ip6IfAddr, IP6_IF_ADDR_MAX>,
    hop_limit: u8,
    ip4_disabled: bool,
    ip6_disabled: bool,
    loopback: bool,
    /// An IGMPv1 querier has been heard on this link.
    pub(crate) igmp_v1_querier: bool,
    driver: Box<dyn NetifDriver>,
}

impl fmt::Debug for Netif {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Netif")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("mtu", &self.mtu)
            .field("ip4_addr", &self.ip4_addr)
            .field("ip6_addrs", &self.ip6_addrs)
            .finish_non_exhaustive()
    }
}

impl Netif {
    pub(crate) fn new(
        id: NetifId,
        cfg: NetifCfg,
        driver: Box<dyn NetifDriver>,
        loopback: bool,
    ) -> Result<Self, Error> {
        if cfg.mtu < IP4_MIN_MTU {
            return Err(Error::Inval);
        }

        let mut ip6_addrs = heapless::Vec::new();
        for a in cfg.ip6_addrs {
            if a.prefix_len > 128 || a.addr.is_multicast() {
                return Err(Error::Inval);
            }
            ip6_addrs.push(a).map_err(|_| Error::NoMem)?;
        }

        Ok(Self {
            id,
            name: cfg.name,
            mtu: cfg.mtu,
            pmtu6: cfg.mtu.max(IP6_MIN_MTU),
            ip4_addr: cfg.ip4_addr,
            ip4_netmask: cfg.ip4_netmask,
            ip4_gateway: cfg.ip4_gateway,
            ip6_addrs,
            hop_limit: cfg.hop_limit,
            ip4_disabled: false,
            ip6_disabled: false,
            loopback,
            igmp_v1_querier: false,
            driver,
        })
    }

    pub fn id(&self) -> NetifId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mtu(&self) -> u16 {
        self.mtu
    }

    /// The IPv6 path MTU learned from Packet Too Big messages.
    pub fn pmtu6(&self) -> u16 {
        self.pmtu6
    }

    /// Record a Packet Too Big report. The value is clamped to the
    /// IPv6 minimum and never grows past the link MTU.
    pub fn set_pmtu6(&mut self, mtu: u32) {
        let mtu = u16::try_from(mtu).unwrap_or(u16::MAX);
        self.pmtu6 = mtu.clamp(IP6_MIN_MTU, self.mtu.max(IP6_MIN_MTU));
    }

    pub fn is_loopback(&self) -> bool {
        self.loopback
    }

    /// Zero when the interface defers to the stack default.
    pub fn hop_limit(&self) -> u8 {
        self.hop_limit
    }

    pub fn ip4_addr(&self) -> Option<Ipv4Addr> {
        self.ip4_addr
    }

    pub fn ip4_netmask(&self) -> Ipv4Addr {
        self.ip4_netmask
    }

    pub fn ip4_gateway(&self) -> Option<Ipv4Addr> {
        self.ip4_gateway
    }

    pub fn set_ip4_addr(&mut self, addr: Ipv4Addr, netmask: Ipv4Addr) {
        self.ip4_addr = Some(addr);
        self.ip4_netmask = netmask;
    }

    pub fn set_ip4_gateway(&mut self, gw: Option<Ipv4Addr>) {
        self.ip4_gateway = gw;
    }

    /// Is `dst` on this interface's IPv4 subnet?
    pub fn ip4_subnet_match(&self, dst: Ipv4Addr) -> bool {
        let Some(addr) = self.ip4_addr else {
            return false;
        };
        dst.same_subnet(addr, self.ip4_netmask)
    }

    /// Is `addr` a broadcast address from this interface's point of
    /// view: limited broadcast, the all-zeros address, or the subnet's
    /// directed broadcast or network address.
    pub fn ip4_is_broadcast(&self, addr: Ipv4Addr) -> bool {
        if addr.is_limited_broadcast() || addr.is_unspecified() {
            return true;
        }

        let Some(own) = self.ip4_addr else {
            return false;
        };
        let mask = self.ip4_netmask;
        if mask.is_limited_broadcast() {
            return false;
        }

        addr == own.masked(mask) || addr == own.directed_broadcast(mask)
    }

    /// The link neighbour to hand a datagram for `dst` to.
    pub fn ip4_next_hop(&self, dst: Ipv4Addr) -> Ipv4Addr {
        if dst.is_multicast() || self.ip4_is_broadcast(dst) {
            return dst;
        }

        if self.ip4_subnet_match(dst) {
            return dst;
        }

        self.ip4_gateway.unwrap_or(dst)
    }

    pub fn ip6_addrs(&self) -> &[Ip6IfAddr] {
        &self.ip6_addrs
    }

    pub fn add_ip6_addr(&mut self, a: Ip6IfAddr) -> Result<(), Error> {
        if a.prefix_len > 128 || a.addr.is_multicast() {
            return Err(Error::Inval);
        }

        if self.ip6_addrs.iter().any(|x| x.addr == a.addr) {
            return Err(Error::AddrInUse);
        }

        self.ip6_addrs.push(a).map_err(|_| Error::NoMem)
    }

    pub fn remove_ip6_addr(&mut self, addr: Ipv6Addr) -> Result<(), Error> {
        let idx = self
            .ip6_addrs
            .iter()
            .position(|x| x.addr == addr)
            .ok_or(Error::AddrNotAvail)?;
        self.ip6_addrs.remove(idx);
        Ok(())
    }

    pub fn set_ip6_addr_state(
        &mut self,
        addr: Ipv6Addr,
        state: Ip6AddrState,
    ) -> Result<(), Error> {
        let a = self
            .ip6_addrs
            .iter_mut()
            .find(|x| x.addr == addr)
            .ok_or(Error::AddrNotAvail)?;
        a.state = state;
        Ok(())
    }

    /// Is `addr` one of this interface's (non-tentative) unicast
    /// addresses?
    pub fn ip6_is_own(&self, addr: Ipv6Addr) -> bool {
        self.ip6_addrs.iter().any(|a| a.is_usable() && a.addr == addr)
    }

    /// Is `addr` reachable without a router? Link-local destinations
    /// always are.
    pub fn ip6_on_link(&self, addr: Ipv6Addr) -> bool {
        if addr.is_link_local() {
            return !self.ip6_addrs.is_empty();
        }

        self.ip6_addrs.iter().any(|a| {
            a.is_usable()
                && a.prefix_len < 128
                && addr.has_prefix(&a.addr, a.prefix_len)
        })
    }

    pub fn ip4_disabled(&self) -> bool {
        self.ip4_disabled
    }

    pub fn ip6_disabled(&self) -> bool {
        self.ip6_disabled
    }

    pub fn set_ip4_disabled(&mut self, disabled: bool) {
        self.ip4_disabled = disabled;
    }

    pub fn set_ip6_disabled(&mut self, disabled: bool) {
        self.ip6_disabled = disabled;
    }

    pub(crate) fn driver_mut(&mut self) -> &mut dyn NetifDriver {
        &mut *self.driver
    }
}
