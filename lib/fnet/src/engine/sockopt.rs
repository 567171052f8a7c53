// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! IP- and IPv6-level socket options.
//!
//! The socket layer keeps one [`IpSockOpts`] per socket and routes
//! `IPPROTO_IP`/`IPPROTO_IPV6` option calls through the stack, which
//! owns the multicast tables. Values use the C ABI layouts: an `int`
//! in native byte order, `struct ip_mreq` or `struct ipv6_mreq`.

use super::mcast::McastHandle;
use super::netif::NetifId;
use super::stack::Stack;
use fnet_api::Error;
use fnet_api::Ip6Opt;
use fnet_api::IpMreq;
use fnet_api::IpOpt;
use fnet_api::Ipv4Addr;
use fnet_api::Ipv6Addr;
use fnet_api::Ipv6Mreq;
use fnet_api::opt_int;

/// Multicast memberships one socket may hold per IP version.
pub const SOCK_MCAST_MAX: usize = 4;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
struct Membership<A> {
    group: A,
    netif: NetifId,
    handle: McastHandle,
}

/// Per-socket IP state. A TTL or hop limit of zero means the stack
/// default.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct IpSockOpts {
    pub tos: u8,
    pub ttl: u8,
    pub mcast_ttl: u8,
    pub hops_unicast: u8,
    pub hops_mcast: u8,
    mships4: heapless::Vec<Membership<Ipv4Addr>, SOCK_MCAST_MAX>,
    mships6: heapless::Vec<Membership<Ipv6Addr>, SOCK_MCAST_MAX>,
}

impl IpSockOpts {
    /// The TTL to put in [`Ip4Out`] for a datagram to `dst`.
    ///
    /// [`Ip4Out`]: crate::engine::ip::Ip4Out
    pub fn ttl_for(&self, dst: Ipv4Addr) -> u8 {
        if dst.is_multicast() { self.mcast_ttl } else { self.ttl }
    }

    /// The hop limit to put in [`Ip6Out`] for a packet to `dst`.
    ///
    /// [`Ip6Out`]: crate::engine::ip::Ip6Out
    pub fn hops_for(&self, dst: Ipv6Addr) -> u8 {
        if dst.is_multicast() { self.hops_mcast } else { self.hops_unicast }
    }

    /// The IPv4 groups this socket has joined, with their interfaces.
    pub fn memberships4(&self) -> impl Iterator<Item = (Ipv4Addr, NetifId)> + '_ {
        self.mships4.iter().map(|m| (m.group, m.netif))
    }

    pub fn memberships6(&self) -> impl Iterator<Item = (Ipv6Addr, NetifId)> + '_ {
        self.mships6.iter().map(|m| (m.group, m.netif))
    }
}

/// A TTL or hop-limit value: 1 to 255, or -1 for the default.
fn hops_opt(val: &[u8]) -> Result<u8, Error> {
    match opt_int(val)? {
        -1 => Ok(0),
        v @ 1..=255 => Ok(v as u8),
        _ => Err(Error::Inval),
    }
}

fn put_int(out: &mut [u8], val: i32) -> Result<usize, Error> {
    let dst = out.get_mut(..4).ok_or(Error::Inval)?;
    dst.copy_from_slice(&val.to_ne_bytes());
    Ok(4)
}

impl Stack {
    /// Resolve a membership request's interface index; zero means the
    /// default interface.
    fn mreq_netif(&self, index: u32) -> Result<NetifId, Error> {
        if index == 0 {
            return self.default_netif().ok_or(Error::Inval);
        }

        let id = NetifId::new(u16::try_from(index).map_err(|_| Error::Inval)?);
        self.netif(id).map(|n| n.id()).ok_or(Error::Inval)
    }

    /// Set an `IPPROTO_IP` option on `opts`.
    pub fn ip_setsockopt(
        &mut self,
        opts: &mut IpSockOpts,
        name: i32,
        val: &[u8],
    ) -> Result<(), Error> {
        match IpOpt::try_from(name)? {
            IpOpt::Tos => {
                let v = opt_int(val)?;
                opts.tos = u8::try_from(v).map_err(|_| Error::Inval)?;
            }

            IpOpt::Ttl => opts.ttl = hops_opt(val)?,
            IpOpt::MulticastTtl => opts.mcast_ttl = hops_opt(val)?,

            IpOpt::AddMembership => {
                let mreq = IpMreq::from_bytes(val)?;
                if !mreq.multiaddr.is_multicast() {
                    return Err(Error::Inval);
                }

                let netif = self.mreq_netif(mreq.interface)?;
                let dup = opts
                    .mships4
                    .iter()
                    .any(|m| m.group == mreq.multiaddr && m.netif == netif);
                if dup || opts.mships4.is_full() {
                    return Err(Error::AddrInUse);
                }

                let handle = self.mcast_join4(netif, mreq.multiaddr)?;
                let m = Membership { group: mreq.multiaddr, netif, handle };
                if opts.mships4.push(m).is_err() {
                    self.mcast_leave4(handle)?;
                    return Err(Error::AddrInUse);
                }
            }

            IpOpt::DropMembership => {
                let mreq = IpMreq::from_bytes(val)?;
                let netif = self.mreq_netif(mreq.interface)?;
                let idx = opts
                    .mships4
                    .iter()
                    .position(|m| m.group == mreq.multiaddr && m.netif == netif)
                    .ok_or(Error::AddrNotAvail)?;
                let m = opts.mships4.swap_remove(idx);
                self.mcast_leave4(m.handle)?;
            }
        }

        Ok(())
    }

    /// Read an `IPPROTO_IP` option into `out`, returning the length
    /// written.
    pub fn ip_getsockopt(
        &self,
        opts: &IpSockOpts,
        name: i32,
        out: &mut [u8],
    ) -> Result<usize, Error> {
        let val = match IpOpt::try_from(name)? {
            IpOpt::Tos => opts.tos,
            IpOpt::Ttl => match opts.ttl {
                0 => self.cfg.ip4_default_ttl,
                t => t,
            },
            IpOpt::MulticastTtl => match opts.mcast_ttl {
                0 => self.cfg.ip4_multicast_ttl,
                t => t,
            },
            IpOpt::AddMembership | IpOpt::DropMembership => {
                return Err(Error::NoProtoOpt);
            }
        };

        put_int(out, i32::from(val))
    }

    /// Set an `IPPROTO_IPV6` option on `opts`.
    pub fn ip6_setsockopt(
        &mut self,
        opts: &mut IpSockOpts,
        name: i32,
        val: &[u8],
    ) -> Result<(), Error> {
        match Ip6Opt::try_from(name)? {
            Ip6Opt::UnicastHops => opts.hops_unicast = hops_opt(val)?,
            Ip6Opt::MulticastHops => opts.hops_mcast = hops_opt(val)?,

            Ip6Opt::JoinGroup => {
                let mreq = Ipv6Mreq::from_bytes(val)?;
                if !mreq.multiaddr.is_multicast() {
                    return Err(Error::Inval);
                }

                let netif = self.mreq_netif(mreq.interface)?;
                let dup = opts
                    .mships6
                    .iter()
                    .any(|m| m.group == mreq.multiaddr && m.netif == netif);
                if dup || opts.mships6.is_full() {
                    return Err(Error::AddrInUse);
                }

                let handle = self.mcast_join6(netif, mreq.multiaddr)?;
                let m = Membership { group: mreq.multiaddr, netif, handle };
                if opts.mships6.push(m).is_err() {
                    self.mcast_leave6(handle)?;
                    return Err(Error::AddrInUse);
                }
            }

            Ip6Opt::LeaveGroup => {
                let mreq = Ipv6Mreq::from_bytes(val)?;
                let netif = self.mreq_netif(mreq.interface)?;
                let idx = opts
                    .mships6
                    .iter()
                    .position(|m| m.group == mreq.multiaddr && m.netif == netif)
                    .ok_or(Error::AddrNotAvail)?;
                let m = opts.mships6.swap_remove(idx);
                self.mcast_leave6(m.handle)?;
            }
        }

        Ok(())
    }

    pub fn ip6_getsockopt(
        &self,
        opts: &IpSockOpts,
        name: i32,
        out: &mut [u8],
    ) -> Result<usize, Error> {
        let val = match Ip6Opt::try_from(name)? {
            Ip6Opt::UnicastHops => match opts.hops_unicast {
                0 => self.cfg.ip6_default_hop_limit,
                h => h,
            },
            Ip6Opt::MulticastHops => match opts.hops_mcast {
                0 => 1,
                h => h,
            },
            Ip6Opt::JoinGroup | Ip6Opt::LeaveGroup => {
                return Err(Error::NoProtoOpt);
            }
        };

        put_int(out, i32::from(val))
    }

    /// Leave every group `opts` joined, as when its socket closes.
    pub fn sockopts_release(&mut self, opts: &mut IpSockOpts) {
        for m in core::mem::take(&mut opts.mships4) {
            if let Err(e) = self.mcast_leave4(m.handle) {
                crate::engine::dbg!("release {}: {}", m.group, e);
            }
        }

        for m in core::mem::take(&mut opts.mships6) {
            if let Err(e) = self.mcast_leave6(m.handle) {
                crate::engine::dbg!("release {}: {}", m.group, e);
            }
        }
    }
}
