// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! IPv6 input, the extension header pipeline, source address
//! selection and output.

use fnet::api::PROTO_DSTOPTS;
use fnet::api::PROTO_ROUTING;
use fnet_test_utils::*;

const PROTO_TEST: u8 = 253;

fn listener(ts: &mut TestStack) -> Recorder {
    let rec = Recorder::new(AddrFamily::Inet6, SockType::Dgram, PROTO_TEST);
    ts.stack.register_proto(Box::new(rec.clone())).unwrap();
    rec
}

fn echo6(dst: Ipv6Addr) -> Vec<u8> {
    let echo = icmp6_echo_req(PEER_LL, dst, 3, 4, b"six");
    ip6_packet(PEER_LL, dst, PROTO_ICMPV6, 64, &echo)
}

/// A packet from `PEER_LL` to `dst` whose payload is `ext` followed by
/// a few bytes of test-protocol data.
fn with_ext(dst: Ipv6Addr, first: u8, ext: &[u8]) -> Vec<u8> {
    let mut payload = ext.to_vec();
    payload.extend_from_slice(b"data");
    ip6_packet(PEER_LL, dst, first, 64, &payload)
}

/// The single Parameter Problem sent in response, as (code, pointer).
fn param_problem(ts: &TestStack) -> (u8, u32) {
    let sent = ts.sent6();
    assert_eq!(sent.len(), 1);
    let ip = parse_ip6(&sent[0].1);
    assert_eq!(ip.dst, PEER_LL);
    let icmp = parse_icmp6(&ip);
    assert_eq!(icmp.msg_type, 4);
    (icmp.code, icmp.rest_u32())
}

#[test]
fn echo_reply() {
    let mut ts = TestStack::new();
    ts.rx6(&echo6(ETH0_LL));

    let sent = ts.sent6();
    assert_eq!(sent.len(), 1);
    let (dst, bytes) = &sent[0];
    assert_eq!(*dst, PEER_LL);

    let ip = parse_ip6(bytes);
    assert_eq!(ip.src, ETH0_LL);
    assert_eq!(ip.hop_limit, 64);

    let icmp = parse_icmp6(&ip);
    assert_eq!(icmp.msg_type, 129);
    assert_eq!(icmp.rest, [0, 3, 0, 4]);
    assert_eq!(icmp.body, b"six");
    assert_eq!(ts.stats().icmp_echo_replies, 1);
    ts.assert_quiet();
}

// A request to all-nodes is answered from a unicast address of the
// right scope.
#[test]
fn multicast_echo_reply() {
    let mut ts = TestStack::new();
    ts.rx6(&echo6(Ipv6Addr::ALL_NODES));

    let sent = ts.sent6();
    assert_eq!(sent.len(), 1);
    let ip = parse_ip6(&sent[0].1);
    assert_eq!(ip.src, ETH0_LL);
    assert_eq!(ip.dst, PEER_LL);
    assert_eq!(parse_icmp6(&ip).msg_type, 129);
    ts.assert_quiet();
}

#[test]
fn echo_reply_disabled() {
    let cfg = StackCfg { echo_reply: false, ..Default::default() };
    let mut ts = TestStack::with_cfg(cfg);
    ts.rx6(&echo6(ETH0_GLOBAL));
    assert!(ts.sent6().is_empty());
    assert_eq!(ts.stats().icmp_in, 1);
    ts.assert_quiet();
}

#[test]
fn bad_packets() {
    let mut ts = TestStack::new();

    // Multicast source.
    let echo = icmp6_echo_req(Ipv6Addr::ALL_NODES, ETH0_LL, 1, 1, b"");
    ts.rx6(&ip6_packet(Ipv6Addr::ALL_NODES, ETH0_LL, PROTO_ICMPV6, 64, &echo));

    // Payload length past the end of the buffer.
    let mut long = echo6(ETH0_LL);
    long[5] += 10;
    ts.rx6(&long);

    // Not IPv6 at all.
    let mut v4 = echo6(ETH0_LL);
    v4[0] = 0x45;
    ts.rx6(&v4);

    // Too short for the fixed header.
    ts.rx6(&echo6(ETH0_LL)[..30]);

    assert!(ts.sent6().is_empty());
    assert_eq!(ts.stats().drop_bad_hdr, 4);
    ts.assert_quiet();
}

#[test]
fn not_for_us() {
    let mut ts = TestStack::new();
    ts.rx6(&echo6("2001:db8::99".parse().unwrap()));
    // A group nobody joined.
    ts.rx6(&echo6("ff02::1:2".parse().unwrap()));

    assert!(ts.sent6().is_empty());
    assert_eq!(ts.stats().drop_not_for_us, 2);
    ts.assert_quiet();
}

// A tentative address is not ours yet, but its solicited-node group
// is already listened to.
#[test]
fn tentative_address() {
    let mut ts = TestStack::new();
    let tent: Ipv6Addr = "2001:db8::77".parse().unwrap();
    let eth0 = ts.eth0;
    let netif = ts.stack.netif_mut(eth0).unwrap();
    netif
        .add_ip6_addr(Ip6IfAddr {
            state: Ip6AddrState::Tentative,
            ..Ip6IfAddr::preferred(tent, 64)
        })
        .unwrap();

    ts.rx6(&echo6(tent));
    assert_eq!(ts.stats().drop_not_for_us, 1);

    let rec = listener(&mut ts);
    let snm = tent.solicited_node_multicast();
    ts.rx6(&ip6_packet(PEER_LL, snm, PROTO_TEST, 255, b"ns"));
    assert_eq!(rec.heard().ip6, vec![(PEER_LL, b"ns".to_vec())]);

    let netif = ts.stack.netif_mut(eth0).unwrap();
    netif.set_ip6_addr_state(tent, Ip6AddrState::Preferred).unwrap();
    ts.rx6(&echo6(tent));
    assert_eq!(ts.sent6().len(), 1);
    ts.assert_quiet();
}

#[test]
fn disabled_interface() {
    let mut ts = TestStack::new();
    let eth0 = ts.eth0;
    ts.stack.netif_mut(eth0).unwrap().set_ip6_disabled(true);

    ts.rx6(&echo6(ETH0_LL));
    assert!(ts.sent6().is_empty());
    assert_eq!(ts.stats().drop_disabled, 1);

    let pkt = ts.payload(b"hello");
    let res = ts.stack.ip6_output(&Ip6Out::new(PEER_GLOBAL, PROTO_TEST), pkt);
    assert_eq!(res, Err(Error::IpDisabled));
    ts.assert_quiet();
}

#[test]
fn hop_by_hop_first() {
    let mut ts = TestStack::new();
    let rec = listener(&mut ts);
    // Router alert, which every host recognizes.
    let hbh = ext_opts(PROTO_TEST, &[0x05, 2, 0, 0]);
    ts.rx6(&with_ext(ETH0_LL, PROTO_HOPOPTS, &hbh));

    assert_eq!(rec.heard().ip6, vec![(PEER_LL, b"data".to_vec())]);
    assert!(ts.sent6().is_empty());
    ts.assert_quiet();
}

#[test]
fn hop_by_hop_not_first() {
    let mut ts = TestStack::new();
    let rec = listener(&mut ts);
    let mut ext = ext_opts(PROTO_HOPOPTS, &[]);
    ext.extend_from_slice(&ext_opts(PROTO_TEST, &[]));
    ts.rx6(&with_ext(ETH0_LL, PROTO_DSTOPTS, &ext));

    // Points at the Next Header byte of the destination options.
    assert_eq!(param_problem(&ts), (1, 40));
    assert!(rec.heard().ip6.is_empty());
    assert_eq!(ts.stats().drop_ext_hdr, 1);
    ts.assert_quiet();
}

#[test]
fn unknown_options() {
    let mut ts = TestStack::new();
    let rec = listener(&mut ts);
    let opt = |typ: u8| ext_opts(PROTO_TEST, &[typ, 0]);

    // 00: skipped.
    ts.rx6(&with_ext(ETH0_LL, PROTO_DSTOPTS, &opt(0x3E)));
    assert_eq!(rec.heard().ip6.len(), 1);
    assert!(ts.sent6().is_empty());

    // 01: dropped without a word.
    ts.rx6(&with_ext(ETH0_LL, PROTO_DSTOPTS, &opt(0x7E)));
    assert!(ts.sent6().is_empty());

    // 10: dropped with a Parameter Problem at the option.
    ts.rx6(&with_ext(ETH0_LL, PROTO_DSTOPTS, &opt(0xBE)));
    assert_eq!(param_problem(&ts), (2, 42));

    // 11: the same, to a unicast destination.
    ts.rx6(&with_ext(ETH0_LL, PROTO_DSTOPTS, &opt(0xFE)));
    assert_eq!(param_problem(&ts), (2, 42));

    // 11 to a group: silent.
    ts.rx6(&with_ext(Ipv6Addr::ALL_NODES, PROTO_DSTOPTS, &opt(0xFE)));
    assert!(ts.sent6().is_empty());

    // 10 to a group still gets its error.
    ts.rx6(&with_ext(Ipv6Addr::ALL_NODES, PROTO_DSTOPTS, &opt(0xBE)));
    assert_eq!(param_problem(&ts), (2, 42));

    assert_eq!(rec.heard().ip6.len(), 1);
    assert_eq!(ts.stats().drop_ext_hdr, 5);
    ts.assert_quiet();
}

#[test]
fn unknown_next_header() {
    let mut ts = TestStack::new();
    let pkt = ip6_packet(PEER_LL, ETH0_LL, 200, 64, b"whatever");
    ts.rx6(&pkt);

    let sent = ts.sent6();
    assert_eq!(sent.len(), 1);
    let ip = parse_ip6(&sent[0].1);
    assert_eq!(ip.src, ETH0_LL);
    let icmp = parse_icmp6(&ip);
    assert_eq!((icmp.msg_type, icmp.code, icmp.rest_u32()), (4, 1, 6));
    assert_eq!(icmp.body, pkt);
    assert_eq!(ts.stats().drop_no_proto, 1);
    ts.assert_quiet();
}

#[test]
fn routing_header() {
    let mut ts = TestStack::new();
    let rec = listener(&mut ts);

    // Type 0, no segments left: processed.
    let done = [PROTO_TEST, 0, 0, 0, 0, 0, 0, 0];
    ts.rx6(&with_ext(ETH0_LL, PROTO_ROUTING, &done));
    assert_eq!(rec.heard().ip6.len(), 1);
    assert!(ts.sent6().is_empty());

    // Segments left: hosts do not forward.
    let left = [PROTO_TEST, 0, 0, 1, 0, 0, 0, 0];
    ts.rx6(&with_ext(ETH0_LL, PROTO_ROUTING, &left));
    assert_eq!(param_problem(&ts), (0, 42));
    assert_eq!(rec.heard().ip6.len(), 1);
    ts.assert_quiet();
}

#[test]
fn no_next_header() {
    let mut ts = TestStack::new();
    let rec = listener(&mut ts);
    let dst = ext_opts(PROTO_NONE, &[]);
    ts.rx6(&with_ext(ETH0_LL, PROTO_DSTOPTS, &dst));

    assert!(rec.heard().ip6.is_empty());
    assert!(ts.sent6().is_empty());
    assert_eq!(ts.stats().drop_no_proto, 0);
    ts.assert_quiet();
}

#[test]
fn bad_fragment_length() {
    let mut ts = TestStack::new();
    let mut body = frag6_hdr(PROTO_TEST, 0, true, 7).to_vec();
    body.extend_from_slice(&[0u8; 20]);
    ts.rx6(&ip6_packet(PEER_LL, ETH0_LL, PROTO_FRAGMENT, 64, &body));

    // Points at the Payload Length field.
    assert_eq!(param_problem(&ts), (0, 4));
    assert_eq!(ts.stack.reasm_pending(), (0, 0));
    ts.assert_quiet();
}

#[test]
fn output_header_fields() {
    let mut ts = TestStack::new();
    let pkt = ts.payload(b"out");
    let out = Ip6Out { hop_limit: 9, ..Ip6Out::new(PEER_GLOBAL, PROTO_TEST) };
    ts.stack.ip6_output(&out, pkt).unwrap();

    let sent = ts.sent6();
    assert_eq!(sent.len(), 1);
    let ip = parse_ip6(&sent[0].1);
    assert_eq!(ip.src, ETH0_GLOBAL);
    assert_eq!(ip.dst, PEER_GLOBAL);
    assert_eq!(ip.nh, PROTO_TEST);
    assert_eq!(ip.hop_limit, 9);
    assert_eq!(ip.payload, b"out");

    // Multicast defaults to one hop.
    let pkt = ts.payload(b"all");
    let out = Ip6Out { netif: Some(ts.eth0), ..Ip6Out::new(Ipv6Addr::ALL_NODES, PROTO_TEST) };
    ts.stack.ip6_output(&out, pkt).unwrap();
    let sent = ts.sent6();
    let ip = parse_ip6(&sent[0].1);
    assert_eq!(ip.hop_limit, 1);
    assert_eq!(ip.src, ETH0_LL);
    assert_eq!(ts.stats().tx_ip6, 2);
    ts.assert_quiet();
}

#[test]
fn output_errors() {
    let mut ts = TestStack::new();

    let pkt = ts.payload(b"x");
    let res = ts.stack.ip6_output(&Ip6Out::new(Ipv6Addr::ANY_ADDR, PROTO_TEST), pkt);
    assert_eq!(res, Err(Error::DestAddrReq));

    let pkt = ts.payload(&vec![0u8; 10_000]);
    let res = ts.stack.ip6_output(&Ip6Out::new(PEER_GLOBAL, PROTO_TEST), pkt);
    assert_eq!(res, Err(Error::MsgSize));

    ts.drv.set_fail(Some(Error::HostUnreach));
    let pkt = ts.payload(b"x");
    let res = ts.stack.ip6_output(&Ip6Out::new(PEER_GLOBAL, PROTO_TEST), pkt);
    assert_eq!(res, Err(Error::HostUnreach));
    ts.drv.set_fail(None);
    ts.assert_quiet();
}

#[test]
fn fragmentation_out() {
    let mut ts = TestStack::new();
    let data: Vec<u8> = (0..3000).map(|i| (i % 251) as u8).collect();
    let pkt = ts.payload(&data);
    ts.stack.ip6_output(&Ip6Out::new(PEER_GLOBAL, PROTO_TEST), pkt).unwrap();

    let sent = ts.sent6();
    assert_eq!(sent.len(), 3);

    let mut rebuilt = Vec::new();
    let mut idents = Vec::new();
    for (i, (_, bytes)) in sent.iter().enumerate() {
        assert!(bytes.len() <= 1500);
        let ip = parse_ip6(bytes);
        assert_eq!(ip.nh, PROTO_FRAGMENT);

        let fh = &ip.payload[..FRAG6_HDR_LEN];
        assert_eq!(fh[0], PROTO_TEST);
        let of = u16::from_be_bytes([fh[2], fh[3]]);
        assert_eq!(usize::from(of & 0xFFF8), rebuilt.len());
        assert_eq!(of & 1 == 1, i < 2);
        idents.push(fh[4..8].to_vec());

        rebuilt.extend_from_slice(&ip.payload[FRAG6_HDR_LEN..]);
    }

    let sizes: Vec<usize> =
        sent.iter().map(|(_, b)| b.len() - IPV6_HDR_LEN - FRAG6_HDR_LEN).collect();
    assert_eq!(sizes, vec![1448, 1448, 104]);
    assert!(idents.iter().all(|id| *id == idents[0]));
    assert_eq!(rebuilt, data);
    assert_eq!(ts.stats().frag_out, 3);
    ts.assert_quiet();
}

#[test]
fn fragmentation_disabled() {
    let cfg = StackCfg { fragmentation: false, ..Default::default() };
    let mut ts = TestStack::with_cfg(cfg);
    let pkt = ts.payload(&vec![0u8; 2000]);
    let res = ts.stack.ip6_output(&Ip6Out::new(PEER_GLOBAL, PROTO_TEST), pkt);
    assert_eq!(res, Err(Error::MsgSize));
    assert!(ts.sent6().is_empty());
    ts.assert_quiet();
}

// A Packet Too Big lowers the path MTU, never below the IPv6 minimum,
// and is passed to the protocol that sent the quoted packet.
#[test]
fn packet_too_big() {
    let mut ts = TestStack::new();
    let rec = Recorder::new(AddrFamily::Supported, SockType::Dgram, PROTO_TEST);
    ts.stack.register_proto(Box::new(rec.clone())).unwrap();
    let router: Ipv6Addr = "2001:db8::1".parse().unwrap();
    let quoted = ip6_packet(ETH0_GLOBAL, PEER_GLOBAL, PROTO_TEST, 64, &[0u8; 32]);

    let ptb = |mtu: u32| {
        let icmp = icmp6_msg(router, ETH0_GLOBAL, 2, 0, mtu.to_be_bytes(), &quoted);
        ip6_packet(router, ETH0_GLOBAL, PROTO_ICMPV6, 64, &icmp)
    };

    assert_eq!(ts.stack.ip6_mtu(PEER_GLOBAL), Some(1500));
    ts.rx6(&ptb(1300));
    assert_eq!(ts.stack.ip6_mtu(PEER_GLOBAL), Some(1300));
    ts.rx6(&ptb(1000));
    assert_eq!(ts.stack.ip6_mtu(PEER_GLOBAL), Some(1280));

    assert_eq!(
        rec.heard().ctl,
        vec![
            (ProtNotify::MsgSize, PROTO_TEST, Some(1300)),
            (ProtNotify::MsgSize, PROTO_TEST, Some(1000)),
        ]
    );

    // Later output honors the smaller path MTU.
    let pkt = ts.payload(&vec![0u8; 1400]);
    ts.stack.ip6_output(&Ip6Out::new(PEER_GLOBAL, PROTO_TEST), pkt).unwrap();
    let sent = ts.sent6();
    assert_eq!(sent.len(), 2);
    assert!(sent.iter().all(|(_, b)| b.len() <= 1280));
    ts.assert_quiet();
}

#[test]
fn unreachable_notifies() {
    let mut ts = TestStack::new();
    let rec = listener(&mut ts);
    let quoted = ip6_packet(ETH0_GLOBAL, PEER_GLOBAL, PROTO_TEST, 64, &[0u8; 8]);
    let icmp = icmp6_msg(PEER_GLOBAL, ETH0_GLOBAL, 1, 4, [0; 4], &quoted);
    ts.rx6(&ip6_packet(PEER_GLOBAL, ETH0_GLOBAL, PROTO_ICMPV6, 64, &icmp));

    assert_eq!(rec.heard().ctl, vec![(ProtNotify::PortUnreach, PROTO_TEST, None)]);
    // Never an error about an error.
    assert!(ts.sent6().is_empty());
    ts.assert_quiet();
}

#[test]
fn source_selection() {
    let mut ts = TestStack::new();
    let eth0 = Some(ts.eth0);
    let s = &ts.stack;

    assert_eq!(s.select_src_addr(eth0, PEER_LL), Some(ETH0_LL));
    assert_eq!(s.select_src_addr(eth0, PEER_GLOBAL), Some(ETH0_GLOBAL));
    assert_eq!(s.select_src_addr(eth0, Ipv6Addr::ALL_NODES), Some(ETH0_LL));
    assert_eq!(s.select_src_addr(None, ETH0_GLOBAL), Some(ETH0_GLOBAL));
    assert_eq!(s.select_src_addr(None, Ipv6Addr::LOOPBACK), Some(Ipv6Addr::LOOPBACK));

    // A deprecated address loses to a preferred one.
    let second: Ipv6Addr = "2001:db8::11".parse().unwrap();
    let netif = ts.stack.netif_mut(ts.eth0).unwrap();
    netif.add_ip6_addr(Ip6IfAddr::preferred(second, 64)).unwrap();
    netif.set_ip6_addr_state(ETH0_GLOBAL, Ip6AddrState::Deprecated).unwrap();
    assert_eq!(ts.stack.select_src_addr(eth0, PEER_GLOBAL), Some(second));

    let netif = ts.stack.netif_mut(ts.eth0).unwrap();
    netif.remove_ip6_addr(second).unwrap();
    assert_eq!(netif.remove_ip6_addr(second), Err(Error::AddrNotAvail));
    assert_eq!(ts.stack.select_src_addr(eth0, PEER_GLOBAL), Some(ETH0_GLOBAL));
}

#[test]
fn routes() {
    let ts = TestStack::new();
    let lo = ts.stack.loopback_netif();

    assert_eq!(ts.stack.ip6_route(PEER_GLOBAL), Some(ts.eth0));
    assert_eq!(ts.stack.ip6_route(PEER_LL), Some(ts.eth0));
    assert_eq!(ts.stack.ip6_route(Ipv6Addr::LOOPBACK), lo);
    assert_eq!(ts.stack.ip6_route(ETH0_GLOBAL), lo);
    // Off-link goes to the default interface.
    assert_eq!(ts.stack.ip6_route("2001:db9::1".parse().unwrap()), Some(ts.eth0));
    assert!(ts.stack.ip6_is_own(ETH0_LL));
    assert!(!ts.stack.ip6_is_own(PEER_LL));
}

#[test]
fn loopback_delivery() {
    let mut ts = TestStack::new();
    let rec = listener(&mut ts);

    let pkt = ts.payload(b"to lo");
    ts.stack.ip6_output(&Ip6Out::new(Ipv6Addr::LOOPBACK, PROTO_TEST), pkt).unwrap();
    let pkt = ts.payload(b"to self");
    ts.stack.ip6_output(&Ip6Out::new(ETH0_GLOBAL, PROTO_TEST), pkt).unwrap();
    ts.stack.poll();

    assert!(ts.sent6().is_empty());
    assert_eq!(
        rec.heard().ip6,
        vec![
            (Ipv6Addr::LOOPBACK, b"to lo".to_vec()),
            (ETH0_GLOBAL, b"to self".to_vec()),
        ]
    );
    ts.assert_quiet();
}
