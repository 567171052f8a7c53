// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Routines for building and checking datagrams.
//!
//! Headers are built and parsed with `smoltcp::wire` so that the tests
//! never judge the engine's header code by itself.

use fnet::api::Ipv4Addr;
use fnet::api::Ipv6Addr;
use fnet::api::PROTO_FRAGMENT;
use fnet::api::PROTO_ICMPV6;
use smoltcp::phy::ChecksumCapabilities as CsumCapab;
use smoltcp::wire::Icmpv4Packet;
use smoltcp::wire::Icmpv4Repr;
use smoltcp::wire::IpProtocol;
use smoltcp::wire::Ipv4Packet;
use smoltcp::wire::Ipv6Packet;

pub const IPV4_HDR_LEN: usize = 20;
pub const IPV6_HDR_LEN: usize = 40;
pub const FRAG6_HDR_LEN: usize = 8;

/// The Internet checksum of `bytes`. Over a message that carries its
/// own checksum the result is zero.
pub fn inet_csum(bytes: &[u8]) -> u16 {
    let mut sum: u32 = bytes
        .chunks(2)
        .map(|c| match *c {
            [hi, lo] => u32::from(u16::from_be_bytes([hi, lo])),
            [hi] => u32::from(u16::from_be_bytes([hi, 0])),
            _ => 0,
        })
        .sum();

    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }

    !(sum as u16)
}

fn pseudo6(src: Ipv6Addr, dst: Ipv6Addr, len: usize, nh: u8) -> Vec<u8> {
    let mut p = Vec::with_capacity(40);
    p.extend_from_slice(&src.bytes());
    p.extend_from_slice(&dst.bytes());
    p.extend_from_slice(&(len as u32).to_be_bytes());
    p.extend_from_slice(&[0, 0, 0, nh]);
    p
}

/// The fields of an IPv4 header to build.
#[derive(Clone, Copy, Debug)]
pub struct Ip4Params {
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub proto: u8,
    pub ttl: u8,
    pub tos: u8,
    pub ident: u16,
    pub df: bool,
    pub more: bool,
    /// In bytes.
    pub frag_off: usize,
}

impl Ip4Params {
    pub fn new(src: Ipv4Addr, dst: Ipv4Addr, proto: u8) -> Self {
        Self {
            src,
            dst,
            proto,
            ttl: 64,
            tos: 0,
            ident: 0x1234,
            df: false,
            more: false,
            frag_off: 0,
        }
    }
}

/// Build an IPv4 datagram around `payload`.
pub fn ip4_datagram(params: &Ip4Params, payload: &[u8]) -> Vec<u8> {
    let total = IPV4_HDR_LEN + payload.len();
    let mut buf = vec![0u8; total];
    let mut ip = Ipv4Packet::new_unchecked(&mut buf[..]);
    ip.set_version(4);
    ip.set_header_len(IPV4_HDR_LEN as u8);
    ip.set_dscp(params.tos >> 2);
    ip.set_ecn(params.tos & 0x3);
    ip.set_total_len(total as u16);
    ip.set_ident(params.ident);
    ip.clear_flags();
    ip.set_dont_frag(params.df);
    ip.set_more_frags(params.more);
    ip.set_frag_offset(params.frag_off as u16);
    ip.set_hop_limit(params.ttl);
    ip.set_next_header(IpProtocol::from(params.proto));
    ip.set_src_addr(params.src.into());
    ip.set_dst_addr(params.dst.into());
    ip.payload_mut().copy_from_slice(payload);
    ip.fill_checksum();
    buf
}

/// Split `payload` into IPv4 fragments carrying `unit` bytes each
/// (the last may be shorter), in ascending offset order.
pub fn ip4_fragments(params: &Ip4Params, payload: &[u8], unit: usize) -> Vec<Vec<u8>> {
    assert!(unit > 0 && unit % 8 == 0, "fragment unit must be a multiple of 8");

    let n = payload.chunks(unit).count();
    payload
        .chunks(unit)
        .enumerate()
        .map(|(i, chunk)| {
            let s = Ip4Params { more: i + 1 < n, frag_off: i * unit, ..*params };
            ip4_datagram(&s, chunk)
        })
        .collect()
}

/// An ICMP echo request.
pub fn icmp4_echo_req(ident: u16, seq_no: u16, data: &[u8]) -> Vec<u8> {
    let icmp = Icmpv4Repr::EchoRequest { ident, seq_no, data };
    let mut bytes = vec![0u8; icmp.buffer_len()];
    let mut pkt = Icmpv4Packet::new_unchecked(&mut bytes);
    icmp.emit(&mut pkt, &CsumCapab::default());
    bytes
}

/// An IGMP message, checksum included.
pub fn igmp_msg(msg_type: u8, max_resp: u8, group: Ipv4Addr) -> Vec<u8> {
    let mut bytes = vec![msg_type, max_resp, 0, 0];
    bytes.extend_from_slice(&group.bytes());
    let csum = inet_csum(&bytes);
    bytes[2..4].copy_from_slice(&csum.to_be_bytes());
    bytes
}

/// Build an IPv6 packet. `payload` holds any extension headers followed
/// by the upper-layer message, and `nh` names the first of them.
pub fn ip6_packet(
    src: Ipv6Addr,
    dst: Ipv6Addr,
    nh: u8,
    hop_limit: u8,
    payload: &[u8],
) -> Vec<u8> {
    let mut buf = vec![0u8; IPV6_HDR_LEN + payload.len()];
    let mut ip = Ipv6Packet::new_unchecked(&mut buf[..]);
    ip.set_version(6);
    ip.set_traffic_class(0);
    ip.set_flow_label(0);
    ip.set_payload_len(payload.len() as u16);
    ip.set_next_header(IpProtocol::from(nh));
    ip.set_hop_limit(hop_limit);
    ip.set_src_addr(src.into());
    ip.set_dst_addr(dst.into());
    ip.payload_mut().copy_from_slice(payload);
    buf
}

/// An ICMP message of any type, checksum included.
pub fn icmp4_msg(msg_type: u8, code: u8, rest: [u8; 4], body: &[u8]) -> Vec<u8> {
    let mut bytes = vec![msg_type, code, 0, 0];
    bytes.extend_from_slice(&rest);
    bytes.extend_from_slice(body);
    let csum = inet_csum(&bytes);
    bytes[2..4].copy_from_slice(&csum.to_be_bytes());
    bytes
}

/// An ICMPv6 message of any type from `src` to `dst`, checksum
/// included.
pub fn icmp6_msg(
    src: Ipv6Addr,
    dst: Ipv6Addr,
    msg_type: u8,
    code: u8,
    rest: [u8; 4],
    body: &[u8],
) -> Vec<u8> {
    let mut bytes = vec![msg_type, code, 0, 0];
    bytes.extend_from_slice(&rest);
    bytes.extend_from_slice(body);

    let mut sum = pseudo6(src, dst, bytes.len(), PROTO_ICMPV6);
    sum.extend_from_slice(&bytes);
    let csum = inet_csum(&sum);
    bytes[2..4].copy_from_slice(&csum.to_be_bytes());
    bytes
}

/// An ICMPv6 echo request from `src` to `dst`.
pub fn icmp6_echo_req(
    src: Ipv6Addr,
    dst: Ipv6Addr,
    ident: u16,
    seq_no: u16,
    data: &[u8],
) -> Vec<u8> {
    let mut rest = [0u8; 4];
    rest[..2].copy_from_slice(&ident.to_be_bytes());
    rest[2..].copy_from_slice(&seq_no.to_be_bytes());
    icmp6_msg(src, dst, 128, 0, rest, data)
}

/// Does the UDP datagram `seg`, sent from `src` to `dst`, carry a
/// valid checksum?
pub fn udp4_csum_ok(src: Ipv4Addr, dst: Ipv4Addr, seg: &[u8]) -> bool {
    let mut sum = Vec::with_capacity(12 + seg.len());
    sum.extend_from_slice(&src.bytes());
    sum.extend_from_slice(&dst.bytes());
    sum.extend_from_slice(&[0, fnet::api::PROTO_UDP]);
    sum.extend_from_slice(&(seg.len() as u16).to_be_bytes());
    sum.extend_from_slice(seg);
    inet_csum(&sum) == 0
}

/// A Hop-by-Hop or Destination Options header holding `opts`, padded
/// out to a multiple of 8 bytes.
pub fn ext_opts(nh: u8, opts: &[u8]) -> Vec<u8> {
    let mut hdr = vec![nh, 0];
    hdr.extend_from_slice(opts);

    match (8 - hdr.len() % 8) % 8 {
        0 => {}
        1 => hdr.push(0),
        n => {
            hdr.extend_from_slice(&[1, (n - 2) as u8]);
            hdr.resize(hdr.len() + n - 2, 0);
        }
    }

    hdr[1] = (hdr.len() / 8 - 1) as u8;
    hdr
}

/// An IPv6 Fragment header; `offset` is in bytes.
pub fn frag6_hdr(nh: u8, offset: usize, more: bool, ident: u32) -> [u8; FRAG6_HDR_LEN] {
    let off = (offset as u16 & 0xFFF8) | u16::from(more);
    let mut hdr = [0u8; FRAG6_HDR_LEN];
    hdr[0] = nh;
    hdr[2..4].copy_from_slice(&off.to_be_bytes());
    hdr[4..].copy_from_slice(&ident.to_be_bytes());
    hdr
}

/// Split `payload`, whose upper-layer protocol is `nh`, into IPv6
/// fragments of `unit` bytes.
pub fn ip6_fragments(
    src: Ipv6Addr,
    dst: Ipv6Addr,
    nh: u8,
    ident: u32,
    payload: &[u8],
    unit: usize,
) -> Vec<Vec<u8>> {
    assert!(unit > 0 && unit % 8 == 0, "fragment unit must be a multiple of 8");

    let n = payload.chunks(unit).count();
    payload
        .chunks(unit)
        .enumerate()
        .map(|(i, chunk)| {
            let mut body = frag6_hdr(nh, i * unit, i + 1 < n, ident).to_vec();
            body.extend_from_slice(chunk);
            ip6_packet(src, dst, PROTO_FRAGMENT, 64, &body)
        })
        .collect()
}

/// A parsed IPv4 datagram.
#[derive(Clone, Debug)]
pub struct Ip4View {
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub proto: u8,
    pub ttl: u8,
    pub tos: u8,
    pub ident: u16,
    pub df: bool,
    pub more: bool,
    pub frag_off: usize,
    pub payload: Vec<u8>,
}

/// Parse an IPv4 datagram, insisting on a valid header checksum.
pub fn parse_ip4(bytes: &[u8]) -> Ip4View {
    let ip = Ipv4Packet::new_checked(bytes).unwrap();
    assert!(ip.verify_checksum(), "bad IPv4 header checksum");

    Ip4View {
        src: Ipv4Addr::from(ip.src_addr()),
        dst: Ipv4Addr::from(ip.dst_addr()),
        proto: u8::from(ip.next_header()),
        ttl: ip.hop_limit(),
        tos: (ip.dscp() << 2) | ip.ecn(),
        ident: ip.ident(),
        df: ip.dont_frag(),
        more: ip.more_frags(),
        frag_off: usize::from(ip.frag_offset()),
        payload: ip.payload().to_vec(),
    }
}

/// A parsed IPv6 packet.
#[derive(Clone, Debug)]
pub struct Ip6View {
    pub src: Ipv6Addr,
    pub dst: Ipv6Addr,
    pub nh: u8,
    pub hop_limit: u8,
    pub payload: Vec<u8>,
}

pub fn parse_ip6(bytes: &[u8]) -> Ip6View {
    let ip = Ipv6Packet::new_checked(bytes).unwrap();

    Ip6View {
        src: Ipv6Addr::from(ip.src_addr()),
        dst: Ipv6Addr::from(ip.dst_addr()),
        nh: u8::from(ip.next_header()),
        hop_limit: ip.hop_limit(),
        payload: ip.payload().to_vec(),
    }
}

/// A parsed ICMP or ICMPv6 message.
#[derive(Clone, Debug)]
pub struct IcmpView {
    pub msg_type: u8,
    pub code: u8,
    pub rest: [u8; 4],
    pub body: Vec<u8>,
}

impl IcmpView {
    fn new(bytes: &[u8]) -> Self {
        assert!(bytes.len() >= 8, "ICMP message too short");
        let mut rest = [0u8; 4];
        rest.copy_from_slice(&bytes[4..8]);
        Self {
            msg_type: bytes[0],
            code: bytes[1],
            rest,
            body: bytes[8..].to_vec(),
        }
    }

    pub fn rest_u32(&self) -> u32 {
        u32::from_be_bytes(self.rest)
    }
}

/// Parse an ICMP message, insisting on a valid checksum.
pub fn parse_icmp4(bytes: &[u8]) -> IcmpView {
    let icmp = Icmpv4Packet::new_checked(bytes).unwrap();
    assert!(icmp.verify_checksum(), "bad ICMP checksum");
    IcmpView::new(bytes)
}

/// Parse the ICMPv6 message carried in `ip`, insisting on a valid
/// checksum.
pub fn parse_icmp6(ip: &Ip6View) -> IcmpView {
    assert_eq!(ip.nh, PROTO_ICMPV6);
    let mut sum = pseudo6(ip.src, ip.dst, ip.payload.len(), PROTO_ICMPV6);
    sum.extend_from_slice(&ip.payload);
    assert_eq!(inet_csum(&sum), 0, "bad ICMPv6 checksum");
    IcmpView::new(&ip.payload)
}

#[cfg(test)]
mod test {
    use super::*;
    use fnet::api::PROTO_ICMP;

    #[test]
    fn built_datagrams_parse() {
        let src = Ipv4Addr::from([10, 0, 0, 1]);
        let dst = Ipv4Addr::from([10, 0, 0, 2]);
        let echo = icmp4_echo_req(7, 1, b"ping");
        let bytes = ip4_datagram(&Ip4Params::new(src, dst, PROTO_ICMP), &echo);

        let ip = parse_ip4(&bytes);
        assert_eq!(ip.src, src);
        assert_eq!(ip.dst, dst);
        assert_eq!(ip.proto, PROTO_ICMP);
        let icmp = parse_icmp4(&ip.payload);
        assert_eq!(icmp.msg_type, 8);
        assert_eq!(icmp.body, b"ping");
    }

    #[test]
    fn fragments_cover_payload() {
        let src = Ipv4Addr::from([10, 0, 0, 1]);
        let dst = Ipv4Addr::from([10, 0, 0, 2]);
        let payload: Vec<u8> = (0..100u8).collect();
        let frags = ip4_fragments(&Ip4Params::new(src, dst, 253), &payload, 40);
        assert_eq!(frags.len(), 3);

        let views: Vec<Ip4View> = frags.iter().map(|f| parse_ip4(f)).collect();
        assert_eq!(views.iter().map(|v| v.frag_off).collect::<Vec<_>>(), [0, 40, 80]);
        assert_eq!(views.iter().map(|v| v.more).collect::<Vec<_>>(), [true, true, false]);
        assert_eq!(views[2].payload.len(), 20);
    }

    #[test]
    fn options_padding() {
        assert_eq!(ext_opts(58, &[]), vec![58, 0, 1, 4, 0, 0, 0, 0]);
        assert_eq!(ext_opts(58, &[0x05, 0x02, 0, 0]), vec![58, 0, 5, 2, 0, 0, 1, 0]);
        assert_eq!(ext_opts(58, &[0x05, 0x02, 0, 0, 0]), vec![58, 0, 5, 2, 0, 0, 0, 0]);
        assert_eq!(ext_opts(58, &[0x05, 0x02, 0, 0, 0, 0]).len(), 8);
    }

    #[test]
    fn icmp6_checksum() {
        let src = Ipv6Addr::from_const([0xfe80, 0, 0, 0, 0, 0, 0, 1]);
        let dst = Ipv6Addr::from_const([0xfe80, 0, 0, 0, 0, 0, 0, 2]);
        let echo = icmp6_echo_req(src, dst, 1, 2, b"abc");
        let ip = parse_ip6(&ip6_packet(src, dst, PROTO_ICMPV6, 64, &echo));
        let icmp = parse_icmp6(&ip);
        assert_eq!(icmp.msg_type, 128);
        assert_eq!(icmp.body, b"abc");
    }
}
