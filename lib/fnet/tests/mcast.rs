// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Group membership and the IGMP host side.

use fnet::engine::mcast::MCAST_MAX;
use fnet_test_utils::*;

const PROTO_TEST: u8 = 253;
const G1: Ipv4Addr = Ipv4Addr::from_const([239, 1, 1, 1]);
const G2: Ipv4Addr = Ipv4Addr::from_const([239, 1, 1, 2]);

/// A query from the gateway: general when `group` is unspecified.
fn query(max_resp: u8, group: Ipv4Addr) -> Vec<u8> {
    let params = Ip4Params { ttl: 1, ..Ip4Params::new(ETH0_GW, Ipv4Addr::ALL_HOSTS, PROTO_IGMP) };
    ip4_datagram(&params, &igmp_msg(0x11, max_resp, group))
}

/// Every IGMP message eth0 sent, as (IP destination, type, group).
fn igmp_sent(ts: &TestStack) -> Vec<(Ipv4Addr, u8, Ipv4Addr)> {
    ts.sent4()
        .into_iter()
        .map(|(next_hop, bytes)| {
            let ip = parse_ip4(&bytes);
            assert_eq!(next_hop, ip.dst);
            assert_eq!(ip.proto, PROTO_IGMP);
            assert_eq!(ip.ttl, 1);
            assert_eq!(ip.tos, 0xC0);
            assert_eq!(inet_csum(&ip.payload), 0);
            let group = Ipv4Addr::from([
                ip.payload[4],
                ip.payload[5],
                ip.payload[6],
                ip.payload[7],
            ]);
            (ip.dst, ip.payload[0], group)
        })
        .collect()
}

#[test]
fn join_reports() {
    let mut ts = TestStack::new();
    ts.stack.mcast_join4(ts.eth0, G1).unwrap();

    assert_eq!(ts.drv.joins4(), vec![G1]);
    assert_eq!(igmp_sent(&ts), vec![(G1, 0x16, G1)]);
    assert_eq!(ts.stats().igmp_out, 1);
    assert_eq!(ts.stack.mcast4_groups().collect::<Vec<_>>(), vec![(G1, ts.eth0, 1)]);
    ts.assert_quiet();
}

#[test]
fn refcounted_leave() {
    let mut ts = TestStack::new();
    let h1 = ts.stack.mcast_join4(ts.eth0, G1).unwrap();
    let h2 = ts.stack.mcast_join4(ts.eth0, G1).unwrap();
    assert_eq!(igmp_sent(&ts).len(), 1);
    assert_eq!(ts.drv.joins4(), vec![G1]);
    assert_eq!(ts.stack.mcast4_groups().collect::<Vec<_>>(), vec![(G1, ts.eth0, 2)]);

    ts.stack.mcast_leave4(h1).unwrap();
    assert!(igmp_sent(&ts).is_empty());
    assert!(ts.drv.leaves4().is_empty());

    ts.stack.mcast_leave4(h2).unwrap();
    assert_eq!(igmp_sent(&ts), vec![(Ipv4Addr::ALL_ROUTERS, 0x17, G1)]);
    assert_eq!(ts.drv.leaves4(), vec![G1]);
    assert_eq!(ts.stack.mcast4_groups().count(), 0);

    // The membership is gone; its handles are stale.
    assert_eq!(ts.stack.mcast_leave4(h2), Err(Error::AddrNotAvail));
    ts.assert_quiet();
}

#[test]
fn queries() {
    let mut ts = TestStack::new();
    ts.stack.mcast_join4(ts.eth0, G1).unwrap();
    ts.stack.mcast_join4(ts.eth0, G2).unwrap();
    ts.sent4();

    ts.rx4(&query(100, Ipv4Addr::ANY_ADDR));
    assert_eq!(igmp_sent(&ts), vec![(G1, 0x16, G1), (G2, 0x16, G2)]);

    ts.rx4(&query(100, G2));
    assert_eq!(igmp_sent(&ts), vec![(G2, 0x16, G2)]);

    // Nobody here is in this one.
    ts.rx4(&query(100, Ipv4Addr::from([239, 9, 9, 9])));
    assert!(igmp_sent(&ts).is_empty());

    assert_eq!(ts.stats().igmp_in, 3);
    assert_eq!(ts.stats().igmp_out, 5);
    ts.assert_quiet();
}

// A zero max-response time means an IGMPv1 querier is on the link:
// reports switch to v1 and leaves stop until a v2 query is heard.
#[test]
fn v1_querier() {
    let mut ts = TestStack::new();
    let h = ts.stack.mcast_join4(ts.eth0, G1).unwrap();
    ts.sent4();

    ts.rx4(&query(0, Ipv4Addr::ANY_ADDR));
    assert_eq!(igmp_sent(&ts), vec![(G1, 0x12, G1)]);

    ts.stack.mcast_leave4(h).unwrap();
    assert!(igmp_sent(&ts).is_empty());
    assert_eq!(ts.drv.leaves4(), vec![G1]);

    ts.stack.mcast_join4(ts.eth0, G2).unwrap();
    assert_eq!(igmp_sent(&ts), vec![(G2, 0x12, G2)]);

    ts.rx4(&query(100, Ipv4Addr::ANY_ADDR));
    assert_eq!(igmp_sent(&ts), vec![(G2, 0x16, G2)]);
    ts.assert_quiet();
}

#[test]
fn configured_v1() {
    let cfg = StackCfg { igmp_version: 1, ..Default::default() };
    let mut ts = TestStack::with_cfg(cfg);
    let h = ts.stack.mcast_join4(ts.eth0, G1).unwrap();
    assert_eq!(igmp_sent(&ts), vec![(G1, 0x12, G1)]);

    ts.stack.mcast_leave4(h).unwrap();
    assert!(igmp_sent(&ts).is_empty());
    ts.assert_quiet();
}

#[test]
fn all_hosts_never_reported() {
    let mut ts = TestStack::new();
    let h = ts.stack.mcast_join4(ts.eth0, Ipv4Addr::ALL_HOSTS).unwrap();
    assert_eq!(ts.drv.joins4(), vec![Ipv4Addr::ALL_HOSTS]);

    ts.rx4(&query(100, Ipv4Addr::ANY_ADDR));
    ts.stack.mcast_leave4(h).unwrap();
    assert!(igmp_sent(&ts).is_empty());
    assert_eq!(ts.stats().igmp_out, 0);
    ts.assert_quiet();
}

// Reports and leaves from other members need no action.
#[test]
fn other_reports_ignored() {
    let mut ts = TestStack::new();
    ts.stack.mcast_join4(ts.eth0, G1).unwrap();
    ts.sent4();

    let params = Ip4Params { ttl: 1, ..Ip4Params::new(PEER_IP4, G1, PROTO_IGMP) };
    ts.rx4(&ip4_datagram(&params, &igmp_msg(0x16, 0, G1)));
    assert!(igmp_sent(&ts).is_empty());

    // A corrupt query is counted and dropped.
    let mut bad = query(100, Ipv4Addr::ANY_ADDR);
    let last = bad.len() - 1;
    bad[last] ^= 0xFF;
    ts.rx4(&bad);
    assert!(igmp_sent(&ts).is_empty());
    assert_eq!(ts.stats().drop_bad_csum, 1);
    ts.assert_quiet();
}

#[test]
fn group_traffic_delivered() {
    let mut ts = TestStack::new();
    let rec = Recorder::new(AddrFamily::Inet, SockType::Dgram, PROTO_TEST);
    ts.stack.register_proto(Box::new(rec.clone())).unwrap();
    let dgram = ip4_datagram(&Ip4Params::new(PEER_IP4, G1, PROTO_TEST), b"group");

    ts.rx4(&dgram);
    assert_eq!(ts.stats().drop_not_for_us, 1);

    let h = ts.stack.mcast_join4(ts.eth0, G1).unwrap();
    ts.rx4(&dgram);
    assert_eq!(rec.heard().ip4, vec![(PEER_IP4, b"group".to_vec())]);

    ts.stack.mcast_leave4(h).unwrap();
    ts.rx4(&dgram);
    assert_eq!(rec.heard().ip4.len(), 1);
    assert_eq!(ts.stats().drop_not_for_us, 2);
    ts.assert_quiet();
}

// IPv6 memberships only program the link layer.
#[test]
fn ip6_membership() {
    let mut ts = TestStack::new();
    let rec = Recorder::new(AddrFamily::Inet6, SockType::Dgram, PROTO_TEST);
    ts.stack.register_proto(Box::new(rec.clone())).unwrap();
    let group: Ipv6Addr = "ff05::1:3".parse().unwrap();
    let pkt = ip6_packet(PEER_GLOBAL, group, PROTO_TEST, 8, b"six");

    ts.rx6(&pkt);
    assert_eq!(ts.stats().drop_not_for_us, 1);

    let h = ts.stack.mcast_join6(ts.eth0, group).unwrap();
    assert_eq!(ts.drv.joins6(), vec![group]);
    assert!(ts.sent6().is_empty());

    ts.rx6(&pkt);
    assert_eq!(rec.heard().ip6, vec![(PEER_GLOBAL, b"six".to_vec())]);
    assert_eq!(ts.stack.mcast6_groups().collect::<Vec<_>>(), vec![(group, ts.eth0, 1)]);

    ts.stack.mcast_leave6(h).unwrap();
    assert_eq!(ts.drv.leaves6(), vec![group]);
    assert_eq!(ts.stack.mcast_leave6(h), Err(Error::AddrNotAvail));
    ts.assert_quiet();
}

#[test]
fn join_errors() {
    let mut ts = TestStack::new();
    let eth0 = ts.eth0;

    assert_eq!(ts.stack.mcast_join4(eth0, PEER_IP4), Err(Error::Inval));
    assert_eq!(ts.stack.mcast_join6(eth0, PEER_GLOBAL), Err(Error::Inval));
    assert_eq!(ts.stack.mcast_join4(NetifId::new(99), G1), Err(Error::Inval));

    for i in 0..MCAST_MAX {
        let g = Ipv4Addr::from([239, 2, 0, i as u8]);
        ts.stack.mcast_join4(eth0, g).unwrap();
    }
    assert_eq!(ts.stack.mcast_join4(eth0, G1), Err(Error::AddrInUse));
    // Another reference to an existing membership still fits.
    assert!(ts.stack.mcast_join4(eth0, Ipv4Addr::from([239, 2, 0, 0])).is_ok());
    assert_eq!(ts.stack.mcast4_groups().count(), MCAST_MAX);
    ts.sent4();
    ts.assert_quiet();
}

#[test]
fn shutdown_leaves_groups() {
    let mut ts = TestStack::new();
    let group6: Ipv6Addr = "ff02::1:2".parse().unwrap();
    ts.stack.mcast_join4(ts.eth0, G1).unwrap();
    ts.stack.mcast_join4(ts.eth0, G1).unwrap();
    ts.stack.mcast_join6(ts.eth0, group6).unwrap();
    ts.sent4();

    ts.stack.shutdown();
    assert_eq!(ts.drv.leaves4(), vec![G1]);
    assert_eq!(ts.drv.leaves6(), vec![group6]);
    assert_eq!(ts.stack.mcast4_groups().count(), 0);
    assert_eq!(ts.stack.mcast6_groups().count(), 0);
    // Shutdown is silent on the wire.
    assert!(ts.sent4().is_empty());
    ts.assert_quiet();
}
