// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The stack context.
//!
//! A [`Stack`] owns everything the IP core needs: the netbuf pool,
//! the interfaces, both input queues, the reassembly tables, the
//! multicast tables and the protocol registry. It is driven from one
//! deferred context; link drivers only ever touch it through the
//! [`InputHandle`] it hands out.

use super::icmp::v4::Icmp4Err;
use super::icmp::v4::icmp4_error;
use super::icmp::v6::ICMP6_QUOTE_MAX;
use super::icmp::v6::Icmp6Err;
use super::icmp::v6::icmp6_error;
use super::igmp;
use super::ip::FragHdr;
use super::ip::IP_HEADROOM;
use super::ip::Ipv6Hdr;
use super::ip::v4::Ip4FragKey;
use super::ip::v4::Ip4FragMeta;
use super::ip::v4::ip4_quote;
use super::ip::v6::Ip6FragKey;
use super::ip::v6::Ip6FragMeta;
use super::mcast::MCAST_MAX;
use super::mcast::McastHandle;
use super::mcast::McastTable;
use super::netif::Ip6IfAddr;
use super::netif::Loopback;
use super::netif::Netif;
use super::netif::NetifCfg;
use super::netif::NetifDriver;
use super::netif::NetifId;
use super::prot::ProtoRegistry;
use super::queue::EventSignal;
use super::queue::InputHandle;
use super::queue::InputQueue;
use super::queue::SoftIrq;
use super::reasm::Expired;
use super::reasm::ReasmTable;
use crate::sys::netbuf::NetBuf;
use crate::sys::netbuf::NetBufError;
use crate::sys::netbuf::NetBufPool;
use crate::sys::stat::StatProvider;
use crate::sys::stat::StatU64;
use crate::sys::sync::IrqControl;
use crate::sys::time::Moment;
use crate::sys::time::Periodic;
use alloc::boxed::Box;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use fnet_api::Error;
use fnet_api::Ipv4Addr;
use fnet_api::Ipv6Addr;
use fnet_api::PROTO_FRAGMENT;
use serde::Deserialize;
use serde::Serialize;
use stat_macro::StatProvider;

/// The loopback interface's MTU.
pub const LOOPBACK_MTU: u16 = 1576;

/// Datagrams that may be under reassembly at once, per IP version.
pub const REASM_MAX: usize = 16;

/// Every host must accept datagrams of this size.
const IP4_MIN_REASM: usize = 576;

/// Stack-wide configuration.
///
/// TTLs for reassembly are counted in timer ticks of
/// `timer_period_ms`.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default)]
pub struct StackCfg {
    pub pool_bytes: usize,
    pub input_queue_bytes: usize,
    pub max_packet: usize,
    pub timer_period_ms: u64,
    pub ip4_frag_ttl: u32,
    pub ip6_frag_ttl: u32,
    pub ip4_default_ttl: u8,
    pub ip4_multicast_ttl: u8,
    pub ip6_default_hop_limit: u8,
    pub fragmentation: bool,
    pub loopback: bool,
    pub igmp_version: u8,
    pub echo_reply: bool,
}

impl Default for StackCfg {
    fn default() -> Self {
        Self {
            pool_bytes: 65536,
            input_queue_bytes: 12288,
            max_packet: 10000,
            timer_period_ms: 500,
            ip4_frag_ttl: 30,
            ip6_frag_ttl: 120,
            ip4_default_ttl: 64,
            ip4_multicast_ttl: 1,
            ip6_default_hop_limit: 64,
            fragmentation: true,
            loopback: true,
            igmp_version: 2,
            echo_reply: true,
        }
    }
}

impl StackCfg {
    pub fn validate(&self) -> Result<(), Error> {
        let ok = self.pool_bytes > 0
            && self.input_queue_bytes > 0
            && self.max_packet >= IP4_MIN_REASM
            && self.timer_period_ms > 0
            && self.ip4_frag_ttl > 0
            && self.ip6_frag_ttl > 0
            && self.ip4_default_ttl > 0
            && self.ip6_default_hop_limit > 0
            && (1..=2).contains(&self.igmp_version);

        if ok { Ok(()) } else { Err(Error::Inval) }
    }
}

/// IP layer counters.
#[derive(Debug, StatProvider)]
pub struct IpStats {
    pub rx_ip4: StatU64,
    pub rx_ip6: StatU64,
    pub tx_ip4: StatU64,
    pub tx_ip6: StatU64,
    pub drop_bad_hdr: StatU64,
    pub drop_bad_csum: StatU64,
    pub drop_not_for_us: StatU64,
    pub drop_too_big: StatU64,
    pub drop_disabled: StatU64,
    pub drop_nomem: StatU64,
    pub drop_ext_hdr: StatU64,
    pub drop_no_proto: StatU64,
    pub frag_in: StatU64,
    pub frag_out: StatU64,
    pub reasm_ok: StatU64,
    pub reasm_fail: StatU64,
    pub reasm_timeout: StatU64,
    pub icmp_in: StatU64,
    pub icmp_echo_replies: StatU64,
    pub icmp_err_sent: StatU64,
    pub icmp_err_suppressed: StatU64,
    pub igmp_in: StatU64,
    pub igmp_out: StatU64,
    pub queue_drops: StatU64,
}

pub struct Stack {
    pub(crate) cfg: StackCfg,
    pub(crate) pool: NetBufPool,
    pub(crate) netifs: Vec<Netif>,
    default_id: Option<NetifId>,
    pub(crate) loopback: Option<NetifId>,
    ip4_q: Arc<InputQueue>,
    ip6_q: Arc<InputQueue>,
    soft: Arc<SoftIrq>,
    input: InputHandle,
    pub(crate) ip4_reasm: ReasmTable<Ip4FragKey, Ip4FragMeta>,
    pub(crate) ip6_reasm: ReasmTable<Ip6FragKey, Ip6FragMeta>,
    pub(crate) ip4_ident: u16,
    pub(crate) ip6_ident: u32,
    pub(crate) mcast4: McastTable<Ipv4Addr, MCAST_MAX>,
    pub(crate) mcast6: McastTable<Ipv6Addr, MCAST_MAX>,
    pub(crate) protos: ProtoRegistry,
    pub(crate) stats: IpStats,
    timer: Option<Periodic>,
}

impl core::fmt::Debug for Stack {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        f.debug_struct("Stack")
            .field("cfg", &self.cfg)
            .field("netifs", &self.netifs)
            .field("protos", &self.protos.len())
            .finish_non_exhaustive()
    }
}

impl Stack {
    /// Create a stack with the builtin protocols and, if configured,
    /// the loopback interface.
    ///
    /// `irq` masks the receive interrupt around queue access. `event`,
    /// if given, is raised whenever a driver queues a packet.
    pub fn new(
        cfg: StackCfg,
        irq: Arc<dyn IrqControl>,
        event: Option<Arc<dyn EventSignal>>,
    ) -> Result<Self, Error> {
        cfg.validate()?;

        let ip4_q = Arc::new(InputQueue::new(irq.clone(), cfg.input_queue_bytes));
        let ip6_q = Arc::new(InputQueue::new(irq, cfg.input_queue_bytes));
        let soft = Arc::new(SoftIrq::new());
        let input =
            InputHandle::new(ip4_q.clone(), ip6_q.clone(), soft.clone(), event);

        let mut stack = Self {
            pool: NetBufPool::new(cfg.pool_bytes),
            netifs: Vec::new(),
            default_id: None,
            loopback: None,
            ip4_q,
            ip6_q,
            soft,
            input,
            ip4_reasm: ReasmTable::new(cfg.ip4_frag_ttl, cfg.max_packet, REASM_MAX),
            ip6_reasm: ReasmTable::new(cfg.ip6_frag_ttl, cfg.max_packet, REASM_MAX),
            ip4_ident: 0,
            ip6_ident: 0,
            mcast4: McastTable::new(),
            mcast6: McastTable::new(),
            protos: ProtoRegistry::with_builtins(),
            stats: IpStats::new(),
            timer: None,
            cfg,
        };

        if stack.cfg.loopback {
            let id = stack.next_netif_id()?;
            let lo_cfg = NetifCfg {
                name: String::from("lo"),
                mtu: LOOPBACK_MTU,
                ip4_addr: Some(Ipv4Addr::LOOPBACK),
                ip4_netmask: Ipv4Addr::from([255, 0, 0, 0]),
                ip4_gateway: None,
                ip6_addrs: vec![Ip6IfAddr::preferred(Ipv6Addr::LOOPBACK, 128)],
                hop_limit: 0,
            };
            let driver = Box::new(Loopback::new(id, stack.input.clone()));
            stack.netifs.push(Netif::new(id, lo_cfg, driver, true)?);
            stack.loopback = Some(id);
        }

        crate::engine::dbg!("stack up: {:?}", stack.cfg);
        Ok(stack)
    }

    fn next_netif_id(&self) -> Result<NetifId, Error> {
        NetifId::from_slot(self.netifs.len()).ok_or(Error::NoMem)
    }

    /// Attach an interface driven by `driver`.
    pub fn add_netif(
        &mut self,
        cfg: NetifCfg,
        driver: Box<dyn NetifDriver>,
    ) -> Result<NetifId, Error> {
        let id = self.next_netif_id()?;
        let netif = Netif::new(id, cfg, driver, false)?;
        crate::engine::dbg!("netif {} up: {:?}", id, netif);
        self.netifs.push(netif);
        Ok(id)
    }

    pub fn netif(&self, id: NetifId) -> Option<&Netif> {
        self.netifs.get(id.slot()?)
    }

    pub fn netif_mut(&mut self, id: NetifId) -> Option<&mut Netif> {
        self.netifs.get_mut(id.slot()?)
    }

    pub fn netifs(&self) -> &[Netif] {
        &self.netifs
    }

    pub fn set_default_netif(&mut self, id: NetifId) -> Result<(), Error> {
        match self.netif(id) {
            Some(n) if !n.is_loopback() => {
                self.default_id = Some(id);
                Ok(())
            }
            _ => Err(Error::Inval),
        }
    }

    /// The interface used when nothing more specific matches: the one
    /// set with [`Stack::set_default_netif()`], else the first
    /// non-loopback interface.
    pub fn default_netif(&self) -> Option<NetifId> {
        self.default_id.or_else(|| {
            self.netifs.iter().find(|n| !n.is_loopback()).map(Netif::id)
        })
    }

    pub fn loopback_netif(&self) -> Option<NetifId> {
        self.loopback
    }

    /// The handle drivers use to queue received packets.
    pub fn input_handle(&self) -> InputHandle {
        self.input.clone()
    }

    pub fn pool(&self) -> &NetBufPool {
        &self.pool
    }

    pub fn cfg(&self) -> &StackCfg {
        &self.cfg
    }

    pub fn stats(&self) -> IpStatsSnap {
        self.stats.snapshot()
    }

    /// Run the deferred input work if a driver has signalled any.
    /// Returns the number of packets processed.
    pub fn poll(&mut self) -> usize {
        if self.soft.take() { self.run_deferred() } else { 0 }
    }

    /// Process queued input until both queues are empty, including
    /// anything queued along the way by the loopback interface.
    pub fn run_deferred(&mut self) -> usize {
        let mut n = 0;

        loop {
            let mut busy = false;

            if let Some((id, pkt)) = self.ip4_q.dequeue() {
                self.ip4_input_low(id, pkt);
                busy = true;
                n += 1;
            }

            if let Some((id, pkt)) = self.ip6_q.dequeue() {
                self.ip6_input_low(id, pkt);
                busy = true;
                n += 1;
            }

            if !busy {
                break;
            }
        }

        self.stats.queue_drops.set(self.ip4_q.drops() + self.ip6_q.drops());
        n
    }

    /// Advance the reassembly clocks by one period. A datagram whose
    /// first fragment had arrived is reported with a reassembly
    /// time-exceeded error.
    pub fn timer_tick(&mut self) {
        for e in self.ip4_reasm.tick() {
            self.stats.reasm_timeout += 1;
            self.ip4_reasm_expired(e);
        }

        for e in self.ip6_reasm.tick() {
            self.stats.reasm_timeout += 1;
            self.ip6_reasm_expired(e);
        }
    }

    fn ip4_reasm_expired(&mut self, e: Expired<Ip4FragKey, Ip4FragMeta>) {
        crate::engine::dbg!("ip4: reassembly timeout, ident {}", e.key.ident);
        let Some(first) = e.first else {
            return;
        };

        match ip4_quote(&e.meta.hdr, &first) {
            Ok(quote) => icmp4_error(
                self,
                e.meta.netif,
                e.meta.flags,
                &quote,
                Icmp4Err::ReassTimeout,
            ),
            Err(_) => self.stats.drop_nomem += 1,
        }
    }

    fn ip6_reasm_expired(&mut self, e: Expired<Ip6FragKey, Ip6FragMeta>) {
        crate::engine::dbg!("ip6: reassembly timeout, ident {}", e.key.ident);
        let Some(first) = e.first else {
            return;
        };

        match ip6_frag_quote(&e.key, e.meta.hdr.clone(), &first) {
            Ok(quote) => icmp6_error(
                self,
                e.meta.netif,
                e.meta.flags,
                &quote,
                Icmp6Err::ReassTimeout,
            ),
            Err(_) => self.stats.drop_nomem += 1,
        }
    }

    /// Run as many timer ticks as have elapsed by `now`.
    pub fn poll_timers(&mut self, now: Moment) {
        let period = self.cfg.timer_period_ms;
        let timer = self.timer.get_or_insert_with(|| Periodic::new(period, now));

        for _ in 0..timer.advance(now) {
            self.timer_tick();
        }
    }

    /// Join `group` on `netif`. The first join programs the link layer
    /// and sends an IGMP report.
    pub fn mcast_join4(
        &mut self,
        netif: NetifId,
        group: Ipv4Addr,
    ) -> Result<McastHandle, Error> {
        if !group.is_multicast() {
            return Err(Error::Inval);
        }
        self.netif(netif).ok_or(Error::Inval)?;

        let (h, first) = self.mcast4.join(group, netif)?;
        if first {
            if let Some(n) = self.netif_mut(netif) {
                n.driver_mut().multicast_join4(group);
            }
            if let Err(e) = igmp::send_report(self, netif, group) {
                crate::engine::dbg!("igmp: report for {}: {}", group, e);
            }
        }

        Ok(h)
    }

    pub fn mcast_leave4(&mut self, h: McastHandle) -> Result<(), Error> {
        let Some((group, netif)) = self.mcast4.leave(h)? else {
            return Ok(());
        };

        if let Err(e) = igmp::send_leave(self, netif, group) {
            crate::engine::dbg!("igmp: leave for {}: {}", group, e);
        }
        if let Some(n) = self.netif_mut(netif) {
            n.driver_mut().multicast_leave4(group);
        }
        Ok(())
    }

    /// Join `group` on `netif`. Only the link layer is programmed; no
    /// MLD report is sent.
    pub fn mcast_join6(
        &mut self,
        netif: NetifId,
        group: Ipv6Addr,
    ) -> Result<McastHandle, Error> {
        if !group.is_multicast() {
            return Err(Error::Inval);
        }
        self.netif(netif).ok_or(Error::Inval)?;

        let (h, first) = self.mcast6.join(group, netif)?;
        if first {
            if let Some(n) = self.netif_mut(netif) {
                n.driver_mut().multicast_join6(group);
            }
        }

        Ok(h)
    }

    pub fn mcast_leave6(&mut self, h: McastHandle) -> Result<(), Error> {
        if let Some((group, netif)) = self.mcast6.leave(h)? {
            if let Some(n) = self.netif_mut(netif) {
                n.driver_mut().multicast_leave6(group);
            }
        }
        Ok(())
    }

    /// Every IPv4 membership as (group, interface, reference count).
    pub fn mcast4_groups(&self) -> impl Iterator<Item = (Ipv4Addr, NetifId, u32)> + '_ {
        self.mcast4.iter()
    }

    pub fn mcast6_groups(&self) -> impl Iterator<Item = (Ipv6Addr, NetifId, u32)> + '_ {
        self.mcast6.iter()
    }

    /// Drop all queued input, reassembly state and memberships.
    pub fn shutdown(&mut self) {
        let queued = self.ip4_q.drain() + self.ip6_q.drain();
        self.ip4_reasm.clear();
        self.ip6_reasm.clear();

        for (group, netif) in self.mcast4.clear() {
            if let Some(n) = self.netif_mut(netif) {
                n.driver_mut().multicast_leave4(group);
            }
        }
        for (group, netif) in self.mcast6.clear() {
            if let Some(n) = self.netif_mut(netif) {
                n.driver_mut().multicast_leave6(group);
            }
        }

        crate::engine::dbg!("stack down, {} queued packets freed", queued);
    }

    /// Datagrams currently under reassembly, IPv4 then IPv6.
    #[cfg(any(feature = "test-help", test))]
    pub fn reasm_pending(&self) -> (usize, usize) {
        (self.ip4_reasm.len(), self.ip6_reasm.len())
    }

    /// Packets waiting in the input queues, IPv4 then IPv6.
    #[cfg(any(feature = "test-help", test))]
    pub fn queued(&self) -> (usize, usize) {
        (self.ip4_q.len(), self.ip6_q.len())
    }
}

/// Rebuild what the zero-offset fragment of an IPv6 datagram looked
/// like on the wire: base header, Fragment header and payload.
fn ip6_frag_quote(
    key: &Ip6FragKey,
    mut hdr: Ipv6Hdr,
    first: &NetBuf,
) -> Result<NetBuf, NetBufError> {
    let room = Ipv6Hdr::SIZE + FragHdr::SIZE;
    let n = first.len().min(ICMP6_QUOTE_MAX.saturating_sub(room));
    let mut quote = first.copy_range(IP_HEADROOM + room, 0, n)?;

    let fh = FragHdr { next_hdr: key.nh, frag_off: 0, more: true, ident: key.ident };
    fh.emit(quote.prepend(FragHdr::SIZE)?);

    hdr.next_hdr = PROTO_FRAGMENT;
    hdr.payload_len = (FragHdr::SIZE + first.len()) as u16;
    hdr.emit(quote.prepend(Ipv6Hdr::SIZE)?);
    Ok(quote)
}
