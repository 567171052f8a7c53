// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! IP-level socket options through the stack.

use fnet::api::IP_ADD_MEMBERSHIP;
use fnet::api::IP_DROP_MEMBERSHIP;
use fnet::api::IP_MULTICAST_TTL;
use fnet::api::IP_TOS;
use fnet::api::IP_TTL;
use fnet::api::IPV6_JOIN_GROUP;
use fnet::api::IPV6_LEAVE_GROUP;
use fnet::api::IPV6_MULTICAST_HOPS;
use fnet::api::IPV6_UNICAST_HOPS;
use fnet::api::IpMreq;
use fnet::api::Ipv6Mreq;
use fnet::engine::sockopt::IpSockOpts;
use fnet::engine::sockopt::SOCK_MCAST_MAX;
use fnet_test_utils::*;

const G1: Ipv4Addr = Ipv4Addr::from_const([239, 1, 1, 1]);

fn int(v: i32) -> [u8; 4] {
    v.to_ne_bytes()
}

fn get4(ts: &TestStack, opts: &IpSockOpts, name: i32) -> i32 {
    let mut out = [0u8; 4];
    assert_eq!(ts.stack.ip_getsockopt(opts, name, &mut out), Ok(4));
    i32::from_ne_bytes(out)
}

fn get6(ts: &TestStack, opts: &IpSockOpts, name: i32) -> i32 {
    let mut out = [0u8; 4];
    assert_eq!(ts.stack.ip6_getsockopt(opts, name, &mut out), Ok(4));
    i32::from_ne_bytes(out)
}

fn mreq(group: Ipv4Addr, interface: u32) -> [u8; IpMreq::SIZE] {
    IpMreq { multiaddr: group, interface }.to_bytes()
}

fn mreq6(group: Ipv6Addr, interface: u32) -> [u8; Ipv6Mreq::SIZE] {
    Ipv6Mreq { multiaddr: group, interface }.to_bytes()
}

#[test]
fn defaults() {
    let ts = TestStack::new();
    let opts = IpSockOpts::default();

    assert_eq!(get4(&ts, &opts, IP_TOS), 0);
    assert_eq!(get4(&ts, &opts, IP_TTL), 64);
    assert_eq!(get4(&ts, &opts, IP_MULTICAST_TTL), 1);
    assert_eq!(get6(&ts, &opts, IPV6_UNICAST_HOPS), 64);
    assert_eq!(get6(&ts, &opts, IPV6_MULTICAST_HOPS), 1);

    let cfg = StackCfg { ip4_default_ttl: 128, ip6_default_hop_limit: 255, ..Default::default() };
    let ts = TestStack::with_cfg(cfg);
    assert_eq!(get4(&ts, &opts, IP_TTL), 128);
    assert_eq!(get6(&ts, &opts, IPV6_UNICAST_HOPS), 255);
}

#[test]
fn set_and_get() {
    let mut ts = TestStack::new();
    let mut opts = IpSockOpts::default();

    ts.stack.ip_setsockopt(&mut opts, IP_TOS, &int(0x10)).unwrap();
    ts.stack.ip_setsockopt(&mut opts, IP_TTL, &int(17)).unwrap();
    ts.stack.ip_setsockopt(&mut opts, IP_MULTICAST_TTL, &int(5)).unwrap();
    ts.stack.ip6_setsockopt(&mut opts, IPV6_UNICAST_HOPS, &int(33)).unwrap();
    ts.stack.ip6_setsockopt(&mut opts, IPV6_MULTICAST_HOPS, &int(3)).unwrap();

    assert_eq!(get4(&ts, &opts, IP_TOS), 0x10);
    assert_eq!(get4(&ts, &opts, IP_TTL), 17);
    assert_eq!(get4(&ts, &opts, IP_MULTICAST_TTL), 5);
    assert_eq!(get6(&ts, &opts, IPV6_UNICAST_HOPS), 33);
    assert_eq!(get6(&ts, &opts, IPV6_MULTICAST_HOPS), 3);

    assert_eq!(opts.ttl_for(PEER_IP4), 17);
    assert_eq!(opts.ttl_for(G1), 5);
    assert_eq!(opts.hops_for(PEER_GLOBAL), 33);
    assert_eq!(opts.hops_for(Ipv6Addr::ALL_NODES), 3);

    // -1 restores the default.
    ts.stack.ip_setsockopt(&mut opts, IP_TTL, &int(-1)).unwrap();
    assert_eq!(opts.ttl, 0);
    assert_eq!(get4(&ts, &opts, IP_TTL), 64);
    ts.stack.ip6_setsockopt(&mut opts, IPV6_MULTICAST_HOPS, &int(-1)).unwrap();
    assert_eq!(get6(&ts, &opts, IPV6_MULTICAST_HOPS), 1);
}

// The per-socket values end up in the headers the stack writes.
#[test]
fn values_reach_the_wire() {
    let mut ts = TestStack::new();
    let mut opts = IpSockOpts::default();
    ts.stack.ip_setsockopt(&mut opts, IP_TOS, &int(0x28)).unwrap();
    ts.stack.ip_setsockopt(&mut opts, IP_TTL, &int(9)).unwrap();
    ts.stack.ip6_setsockopt(&mut opts, IPV6_UNICAST_HOPS, &int(7)).unwrap();

    let out = Ip4Out {
        tos: opts.tos,
        ttl: opts.ttl_for(PEER_IP4),
        ..Ip4Out::new(PEER_IP4, PROTO_UDP)
    };
    let pkt = ts.payload(b"v4");
    ts.stack.ip4_output(&out, pkt).unwrap();
    let ip = parse_ip4(&ts.sent4()[0].1);
    assert_eq!((ip.tos, ip.ttl), (0x28, 9));

    let out = Ip6Out {
        hop_limit: opts.hops_for(PEER_GLOBAL),
        ..Ip6Out::new(PEER_GLOBAL, PROTO_UDP)
    };
    let pkt = ts.payload(b"v6");
    ts.stack.ip6_output(&out, pkt).unwrap();
    assert_eq!(parse_ip6(&ts.sent6()[0].1).hop_limit, 7);
    ts.assert_quiet();
}

#[test]
fn bad_values() {
    let mut ts = TestStack::new();
    let mut opts = IpSockOpts::default();
    let s = &mut ts.stack;

    assert_eq!(s.ip_setsockopt(&mut opts, IP_TTL, &int(0)), Err(Error::Inval));
    assert_eq!(s.ip_setsockopt(&mut opts, IP_TTL, &int(256)), Err(Error::Inval));
    assert_eq!(s.ip_setsockopt(&mut opts, IP_TTL, &[1, 0]), Err(Error::Inval));
    assert_eq!(s.ip_setsockopt(&mut opts, IP_TOS, &int(300)), Err(Error::Inval));
    assert_eq!(s.ip_setsockopt(&mut opts, IP_TOS, &int(-1)), Err(Error::Inval));
    assert_eq!(s.ip6_setsockopt(&mut opts, IPV6_UNICAST_HOPS, &int(-2)), Err(Error::Inval));
    assert_eq!(s.ip_setsockopt(&mut opts, 99, &int(1)), Err(Error::NoProtoOpt));
    assert_eq!(s.ip6_setsockopt(&mut opts, 99, &int(1)), Err(Error::NoProtoOpt));
    assert_eq!(opts, IpSockOpts::default());

    let mut out = [0u8; 4];
    assert_eq!(s.ip_getsockopt(&opts, 99, &mut out), Err(Error::NoProtoOpt));
    assert_eq!(s.ip_getsockopt(&opts, IP_ADD_MEMBERSHIP, &mut out), Err(Error::NoProtoOpt));
    assert_eq!(s.ip6_getsockopt(&opts, IPV6_JOIN_GROUP, &mut out), Err(Error::NoProtoOpt));
    assert_eq!(s.ip_getsockopt(&opts, IP_TTL, &mut [0u8; 2]), Err(Error::Inval));
}

#[test]
fn membership() {
    let mut ts = TestStack::new();
    let mut opts = IpSockOpts::default();
    let eth0 = ts.eth0;

    // Interface zero is the default interface.
    ts.stack.ip_setsockopt(&mut opts, IP_ADD_MEMBERSHIP, &mreq(G1, 0)).unwrap();
    assert_eq!(opts.memberships4().collect::<Vec<_>>(), vec![(G1, eth0)]);
    assert_eq!(ts.drv.joins4(), vec![G1]);

    assert_eq!(
        ts.stack.ip_setsockopt(&mut opts, IP_ADD_MEMBERSHIP, &mreq(G1, eth0.index())),
        Err(Error::AddrInUse)
    );

    // A second socket shares the membership.
    let mut other = IpSockOpts::default();
    ts.stack.ip_setsockopt(&mut other, IP_ADD_MEMBERSHIP, &mreq(G1, 0)).unwrap();
    assert_eq!(ts.stack.mcast4_groups().collect::<Vec<_>>(), vec![(G1, eth0, 2)]);

    ts.stack.ip_setsockopt(&mut opts, IP_DROP_MEMBERSHIP, &mreq(G1, 0)).unwrap();
    assert!(ts.drv.leaves4().is_empty());
    assert_eq!(opts.memberships4().count(), 0);
    assert_eq!(
        ts.stack.ip_setsockopt(&mut opts, IP_DROP_MEMBERSHIP, &mreq(G1, 0)),
        Err(Error::AddrNotAvail)
    );

    ts.stack.ip_setsockopt(&mut other, IP_DROP_MEMBERSHIP, &mreq(G1, 0)).unwrap();
    assert_eq!(ts.drv.leaves4(), vec![G1]);
    ts.sent4();
    ts.assert_quiet();
}

#[test]
fn membership_errors() {
    let mut ts = TestStack::new();
    let mut opts = IpSockOpts::default();
    let s = &mut ts.stack;

    assert_eq!(
        s.ip_setsockopt(&mut opts, IP_ADD_MEMBERSHIP, &mreq(PEER_IP4, 0)),
        Err(Error::Inval)
    );
    assert_eq!(
        s.ip_setsockopt(&mut opts, IP_ADD_MEMBERSHIP, &mreq(G1, 42)),
        Err(Error::Inval)
    );
    assert_eq!(
        s.ip_setsockopt(&mut opts, IP_ADD_MEMBERSHIP, &mreq(G1, 0)[..6]),
        Err(Error::Inval)
    );
    assert_eq!(
        s.ip6_setsockopt(&mut opts, IPV6_JOIN_GROUP, &mreq6(PEER_GLOBAL, 0)),
        Err(Error::Inval)
    );

    for i in 0..SOCK_MCAST_MAX {
        let g = Ipv4Addr::from([239, 3, 0, i as u8]);
        s.ip_setsockopt(&mut opts, IP_ADD_MEMBERSHIP, &mreq(g, 0)).unwrap();
    }
    assert_eq!(
        s.ip_setsockopt(&mut opts, IP_ADD_MEMBERSHIP, &mreq(G1, 0)),
        Err(Error::AddrInUse)
    );
    assert_eq!(opts.memberships4().count(), SOCK_MCAST_MAX);
    assert!(!s.mcast4_groups().any(|(g, _, _)| g == G1));
}

#[test]
fn ip6_membership() {
    let mut ts = TestStack::new();
    let mut opts = IpSockOpts::default();
    let group: Ipv6Addr = "ff02::1:3".parse().unwrap();

    let req = mreq6(group, ts.eth0.index());
    ts.stack.ip6_setsockopt(&mut opts, IPV6_JOIN_GROUP, &req).unwrap();
    assert_eq!(opts.memberships6().collect::<Vec<_>>(), vec![(group, ts.eth0)]);
    assert_eq!(ts.drv.joins6(), vec![group]);
    assert_eq!(
        ts.stack.ip6_setsockopt(&mut opts, IPV6_JOIN_GROUP, &req),
        Err(Error::AddrInUse)
    );

    ts.stack.ip6_setsockopt(&mut opts, IPV6_LEAVE_GROUP, &req).unwrap();
    assert_eq!(ts.drv.leaves6(), vec![group]);
    assert_eq!(
        ts.stack.ip6_setsockopt(&mut opts, IPV6_LEAVE_GROUP, &req),
        Err(Error::AddrNotAvail)
    );
}

// Closing a socket gives back every group it still holds.
#[test]
fn release() {
    let mut ts = TestStack::new();
    let mut opts = IpSockOpts::default();
    let group6: Ipv6Addr = "ff02::1:3".parse().unwrap();
    let g2 = Ipv4Addr::from([239, 1, 1, 2]);

    ts.stack.ip_setsockopt(&mut opts, IP_ADD_MEMBERSHIP, &mreq(G1, 0)).unwrap();
    ts.stack.ip_setsockopt(&mut opts, IP_ADD_MEMBERSHIP, &mreq(g2, 0)).unwrap();
    ts.stack.ip6_setsockopt(&mut opts, IPV6_JOIN_GROUP, &mreq6(group6, 0)).unwrap();
    ts.sent4();

    ts.stack.sockopts_release(&mut opts);
    assert_eq!(opts.memberships4().count(), 0);
    assert_eq!(opts.memberships6().count(), 0);
    assert_eq!(ts.drv.leaves4(), vec![G1, g2]);
    assert_eq!(ts.drv.leaves6(), vec![group6]);
    assert_eq!(ts.stack.mcast4_groups().count(), 0);

    // IGMPv2 leaves went to all-routers.
    let sent = ts.sent4();
    assert_eq!(sent.len(), 2);
    assert!(sent.iter().all(|(hop, _)| *hop == Ipv4Addr::ALL_ROUTERS));
    ts.assert_quiet();
}
