// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! A stack with one Ethernet-like interface behind a [`MockDriver`].

use crate::driver::MockDriver;
use crate::logger;
use fnet::api::AddrFamily;
use fnet::api::Ipv4Addr;
use fnet::api::Ipv6Addr;
use fnet::api::ProtNotify;
use fnet::api::SockType;
use fnet::engine::NetifId;
use fnet::engine::Stack;
use fnet::engine::StackCfg;
use fnet::engine::ip::Ip4Rx;
use fnet::engine::ip::Ip6Rx;
use fnet::engine::netif::Ip6IfAddr;
use fnet::engine::netif::NetifCfg;
use fnet::engine::prot::CtlMsg;
use fnet::engine::prot::ProtoHandler;
use fnet::engine::stack::IpStatsSnap;
use fnet::sys::netbuf::NetBuf;
use fnet::sys::netbuf::NetBufFlags;
use fnet::sys::sync::NoIrq;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;

pub const ETH0_IP4: Ipv4Addr = Ipv4Addr::from_const([192, 168, 1, 10]);
pub const ETH0_NETMASK: Ipv4Addr = Ipv4Addr::from_const([255, 255, 255, 0]);
pub const ETH0_GW: Ipv4Addr = Ipv4Addr::from_const([192, 168, 1, 1]);
pub const ETH0_BCAST: Ipv4Addr = Ipv4Addr::from_const([192, 168, 1, 255]);
pub const PEER_IP4: Ipv4Addr = Ipv4Addr::from_const([192, 168, 1, 20]);
pub const REMOTE_IP4: Ipv4Addr = Ipv4Addr::from_const([8, 8, 8, 8]);

pub const ETH0_LL: Ipv6Addr =
    Ipv6Addr::from_const([0xfe80, 0, 0, 0, 0, 0, 0, 0x10]);
pub const ETH0_GLOBAL: Ipv6Addr =
    Ipv6Addr::from_const([0x2001, 0xdb8, 0, 0, 0, 0, 0, 0x10]);
pub const PEER_LL: Ipv6Addr =
    Ipv6Addr::from_const([0xfe80, 0, 0, 0, 0, 0, 0, 0x20]);
pub const PEER_GLOBAL: Ipv6Addr =
    Ipv6Addr::from_const([0x2001, 0xdb8, 0, 0, 0, 0, 0, 0x20]);

pub fn eth0_cfg() -> NetifCfg {
    NetifCfg {
        name: "eth0".to_string(),
        mtu: 1500,
        ip4_addr: Some(ETH0_IP4),
        ip4_netmask: ETH0_NETMASK,
        ip4_gateway: Some(ETH0_GW),
        ip6_addrs: vec![
            Ip6IfAddr::preferred(ETH0_LL, 64),
            Ip6IfAddr::preferred(ETH0_GLOBAL, 64),
        ],
        hop_limit: 0,
    }
}

pub struct TestStack {
    pub stack: Stack,
    pub eth0: NetifId,
    pub drv: MockDriver,
}

impl Default for TestStack {
    fn default() -> Self {
        Self::new()
    }
}

impl TestStack {
    pub fn new() -> Self {
        Self::with_cfg(StackCfg::default())
    }

    pub fn with_cfg(cfg: StackCfg) -> Self {
        Self::with_netif(cfg, eth0_cfg())
    }

    pub fn with_netif(cfg: StackCfg, netif: NetifCfg) -> Self {
        logger::init();
        let mut stack = Stack::new(cfg, Arc::new(NoIrq), None).unwrap();
        let drv = MockDriver::new();
        let eth0 = stack.add_netif(netif, Box::new(drv.clone())).unwrap();
        Self { stack, eth0, drv }
    }

    /// Receive an IPv4 datagram on eth0 and run the deferred work.
    pub fn rx4(&mut self, bytes: &[u8]) {
        self.rx4_flags(bytes, NetBufFlags::empty());
    }

    pub fn rx4_flags(&mut self, bytes: &[u8], flags: NetBufFlags) {
        let mut pkt = self.stack.pool().from_slice(bytes).unwrap();
        pkt.set_flags(flags);
        self.stack.input_handle().ip4_input(self.eth0, pkt);
        self.stack.poll();
    }

    /// Receive an IPv6 packet on eth0 and run the deferred work.
    pub fn rx6(&mut self, bytes: &[u8]) {
        self.rx6_flags(bytes, NetBufFlags::empty());
    }

    pub fn rx6_flags(&mut self, bytes: &[u8], flags: NetBufFlags) {
        let mut pkt = self.stack.pool().from_slice(bytes).unwrap();
        pkt.set_flags(flags);
        self.stack.input_handle().ip6_input(self.eth0, pkt);
        self.stack.poll();
    }

    /// Everything eth0 transmitted since the last call.
    pub fn sent4(&self) -> Vec<(Ipv4Addr, Vec<u8>)> {
        self.drv.take_ip4()
    }

    pub fn sent6(&self) -> Vec<(Ipv6Addr, Vec<u8>)> {
        self.drv.take_ip6()
    }

    pub fn stats(&self) -> IpStatsSnap {
        self.stack.stats()
    }

    /// A netbuf holding `bytes` with room for the IP header in front.
    pub fn payload(&self, bytes: &[u8]) -> NetBuf {
        self.stack
            .pool()
            .from_slice_with_headroom(fnet::engine::ip::IP_HEADROOM, bytes)
            .unwrap()
    }

    /// Every queued packet has been processed and every netbuf freed.
    pub fn assert_quiet(&mut self) {
        self.stack.run_deferred();
        assert_eq!(self.stack.queued(), (0, 0));
        assert_eq!(self.stack.pool().in_use(), 0, "netbuf leak");
    }
}

/// What a [`Recorder`] has been handed.
#[derive(Debug, Default)]
pub struct Heard {
    pub ip4: Vec<(Ipv4Addr, Vec<u8>)>,
    pub ip6: Vec<(Ipv6Addr, Vec<u8>)>,
    pub raw: Vec<Vec<u8>>,
    pub ctl: Vec<(ProtNotify, u8, Option<u32>)>,
}

/// An upper-layer protocol that records its input. Clones share the
/// record.
#[derive(Clone, Debug)]
pub struct Recorder {
    family: AddrFamily,
    sock_type: SockType,
    proto: u8,
    heard: Arc<Mutex<Heard>>,
}

impl Recorder {
    pub fn new(family: AddrFamily, sock_type: SockType, proto: u8) -> Self {
        Self { family, sock_type, proto, heard: Default::default() }
    }

    pub fn heard(&self) -> MutexGuard<'_, Heard> {
        self.heard.lock().unwrap()
    }
}

impl ProtoHandler for Recorder {
    fn family(&self) -> AddrFamily {
        self.family
    }

    fn sock_type(&self) -> SockType {
        self.sock_type
    }

    fn protocol(&self) -> u8 {
        self.proto
    }

    fn name(&self) -> &'static str {
        "recorder"
    }

    fn input_ip4(&mut self, _stack: &mut Stack, rx: &Ip4Rx, pkt: NetBuf) {
        self.heard().ip4.push((rx.src, pkt.to_vec()));
    }

    fn input_ip6(&mut self, _stack: &mut Stack, rx: &Ip6Rx, pkt: NetBuf) {
        self.heard().ip6.push((rx.src, pkt.to_vec()));
    }

    fn raw_input_ip4(&mut self, _rx: &Ip4Rx, pkt: &NetBuf) {
        self.heard().raw.push(pkt.to_vec());
    }

    fn raw_input_ip6(&mut self, _rx: &Ip6Rx, pkt: &NetBuf) {
        self.heard().raw.push(pkt.to_vec());
    }

    fn control_input(&mut self, msg: &CtlMsg<'_>) {
        self.heard().ctl.push((msg.notify, msg.proto, msg.mtu));
    }
}
