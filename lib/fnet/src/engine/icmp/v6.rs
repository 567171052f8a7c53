// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! ICMPv6 (RFC 4443): echo, error generation and error input.
//!
//! Neighbor Discovery and MLD messages are accepted here and passed to
//! raw taps like any other message, but the stack does not act on
//! them.

use super::IcmpHdr;
use super::IcmpHdrRaw;
use super::build_msg;
use crate::engine::checksum::pseudo_v6;
use crate::engine::checksum::verify_netbuf;
use crate::engine::ip::CsumFinish;
use crate::engine::ip::Ip6Out;
use crate::engine::ip::Ip6Rx;
use crate::engine::ip::Ipv6Hdr;
use crate::engine::ip::ext::PARAM_UNRECOGNIZED_OPT;
use crate::engine::ip::ext::upper_layer;
use crate::engine::ip::prepare_csum;
use crate::engine::netif::NetifId;
use crate::engine::prot::CtlMsg;
use crate::engine::stack::Stack;
use crate::sys::netbuf::NetBuf;
use crate::sys::netbuf::NetBufFlags;
use fnet_api::AddrFamily;
use fnet_api::Error;
use fnet_api::IpAddr;
use fnet_api::Ipv6Addr;
use fnet_api::PROTO_ICMPV6;
use fnet_api::ProtNotify;

pub const ICMP6_DST_UNREACH: u8 = 1;
pub const ICMP6_PACKET_TOO_BIG: u8 = 2;
pub const ICMP6_TIME_EXCEEDED: u8 = 3;
pub const ICMP6_PARAM_PROB: u8 = 4;
pub const ICMP6_ECHO_REQUEST: u8 = 128;
pub const ICMP6_ECHO_REPLY: u8 = 129;
pub const MLD_QUERY: u8 = 130;
pub const MLD_REPORT: u8 = 131;
pub const MLD_DONE: u8 = 132;
pub const ND_ROUTER_SOLICIT: u8 = 133;
pub const ND_ROUTER_ADVERT: u8 = 134;
pub const ND_NEIGHBOR_SOLICIT: u8 = 135;
pub const ND_NEIGHBOR_ADVERT: u8 = 136;
pub const ND_REDIRECT: u8 = 137;
pub const MLD2_REPORT: u8 = 143;

pub const DST_UNREACH_NOROUTE: u8 = 0;
pub const DST_UNREACH_ADMIN: u8 = 1;
pub const DST_UNREACH_BEYONDSCOPE: u8 = 2;
pub const DST_UNREACH_ADDR: u8 = 3;
pub const DST_UNREACH_NOPORT: u8 = 4;

pub const TIME_EXCEED_TRANSIT: u8 = 0;
pub const TIME_EXCEED_REASSEMBLY: u8 = 1;

/// The most an ICMPv6 error may quote: the minimum MTU less the IPv6
/// and ICMPv6 headers.
pub const ICMP6_QUOTE_MAX: usize = 1280 - Ipv6Hdr::SIZE - IcmpHdrRaw::SIZE;

/// Error messages have the high bit of the type clear.
pub fn is_error_type(msg_type: u8) -> bool {
    msg_type < 128
}

/// An ICMPv6 error this host sends.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Icmp6Err {
    NoRoute,
    AdminProhibited,
    AddrUnreach,
    PortUnreach,
    PacketTooBig { mtu: u32 },
    HopLimitExceeded,
    ReassTimeout,
    ParamProblem { code: u8, pointer: u32 },
}

impl Icmp6Err {
    pub fn type_code(&self) -> (u8, u8) {
        match self {
            Self::NoRoute => (ICMP6_DST_UNREACH, DST_UNREACH_NOROUTE),
            Self::AdminProhibited => (ICMP6_DST_UNREACH, DST_UNREACH_ADMIN),
            Self::AddrUnreach => (ICMP6_DST_UNREACH, DST_UNREACH_ADDR),
            Self::PortUnreach => (ICMP6_DST_UNREACH, DST_UNREACH_NOPORT),
            Self::PacketTooBig { .. } => (ICMP6_PACKET_TOO_BIG, 0),
            Self::HopLimitExceeded => (ICMP6_TIME_EXCEEDED, TIME_EXCEED_TRANSIT),
            Self::ReassTimeout => (ICMP6_TIME_EXCEEDED, TIME_EXCEED_REASSEMBLY),
            Self::ParamProblem { code, .. } => (ICMP6_PARAM_PROB, *code),
        }
    }

    fn rest(&self) -> [u8; 4] {
        match self {
            Self::PacketTooBig { mtu } => mtu.to_be_bytes(),
            Self::ParamProblem { pointer, .. } => pointer.to_be_bytes(),
            _ => [0; 4],
        }
    }

    /// RFC 4443 §2.4 (e.3): these may answer a multicast packet.
    fn multicast_ok(&self) -> bool {
        matches!(
            self,
            Self::PacketTooBig { .. }
                | Self::ParamProblem { code: PARAM_UNRECOGNIZED_OPT, .. }
        )
    }
}

pub fn notify_for(msg_type: u8, code: u8) -> Option<ProtNotify> {
    let n = match (msg_type, code) {
        (ICMP6_DST_UNREACH, DST_UNREACH_NOROUTE) => ProtNotify::NetUnreach,
        (ICMP6_DST_UNREACH, DST_UNREACH_NOPORT) => ProtNotify::PortUnreach,
        (ICMP6_DST_UNREACH, _) => ProtNotify::HostUnreach,
        (ICMP6_PACKET_TOO_BIG, _) => ProtNotify::MsgSize,
        (ICMP6_TIME_EXCEEDED, TIME_EXCEED_TRANSIT) => ProtNotify::TimxceedIntrans,
        (ICMP6_TIME_EXCEEDED, TIME_EXCEED_REASSEMBLY) => ProtNotify::TimxceedReass,
        (ICMP6_PARAM_PROB, 1) => ProtNotify::ProtoUnreach,
        (ICMP6_PARAM_PROB, _) => ProtNotify::ParamProb,
        _ => return None,
    };

    Some(n)
}

/// Handle an ICMPv6 message addressed to us. `pkt` starts at the
/// ICMPv6 header.
pub fn input(stack: &mut Stack, rx: Ip6Rx, pkt: NetBuf) {
    stack.stats.icmp_in += 1;

    let Some(hdr) = IcmpHdr::from_netbuf(&pkt) else {
        crate::engine::dbg!("icmp6: runt from {}", rx.src);
        stack.stats.drop_bad_hdr += 1;
        return;
    };

    let pseudo = pseudo_v6(rx.src, rx.dst, pkt.len() as u32, PROTO_ICMPV6);
    if !verify_netbuf(&pkt, pseudo) {
        crate::engine::dbg!("icmp6: bad checksum from {}", rx.src);
        stack.stats.drop_bad_csum += 1;
        return;
    }

    match hdr.msg_type {
        ICMP6_ECHO_REQUEST => echo(stack, &rx, pkt),
        t if is_error_type(t) => error_input(stack, &rx, &hdr, &pkt),
        _ => {}
    }
}

fn echo(stack: &mut Stack, rx: &Ip6Rx, mut pkt: NetBuf) {
    if !stack.cfg.echo_reply {
        return;
    }

    let res = pkt
        .copy_in(0, &[ICMP6_ECHO_REPLY])
        .map_err(Error::from)
        .and_then(|_| prepare_csum(&mut pkt, 2));
    if let Err(e) = res {
        crate::engine::err!("icmp6: echo reply: {}", e);
        return;
    }

    // A multicast request is answered from a unicast address.
    let src = if rx.dst.is_multicast() { Ipv6Addr::ANY_ADDR } else { rx.dst };
    let out = Ip6Out {
        netif: Some(rx.netif),
        src,
        csum: Some(CsumFinish { offset: 2 }),
        ..Ip6Out::new(rx.src, PROTO_ICMPV6)
    };

    match stack.ip6_output(&out, pkt) {
        Ok(()) => stack.stats.icmp_echo_replies += 1,
        Err(e) => crate::engine::dbg!("icmp6: echo reply to {}: {}", rx.src, e),
    }
}

fn error_input(stack: &mut Stack, rx: &Ip6Rx, hdr: &IcmpHdr, pkt: &NetBuf) {
    let Some(notify) = notify_for(hdr.msg_type, hdr.code) else {
        return;
    };

    let bytes = pkt.to_vec();
    let Some(inner_bytes) = bytes.get(IcmpHdrRaw::SIZE..) else {
        return;
    };
    let inner = match Ipv6Hdr::parse(inner_bytes) {
        Ok(inner) => inner,
        Err(e) => {
            crate::engine::dbg!("icmp6: bad quoted header: {}", e);
            return;
        }
    };

    let mtu = if hdr.msg_type == ICMP6_PACKET_TOO_BIG {
        let mtu = hdr.rest_u32();
        if let Some(n) = stack.netif_mut(rx.netif) {
            n.set_pmtu6(mtu);
        }
        Some(mtu)
    } else {
        None
    };

    let Some((proto, off)) = upper_layer(inner_bytes) else {
        return;
    };

    let msg = CtlMsg {
        notify,
        src: IpAddr::Ip6(inner.src),
        dst: IpAddr::Ip6(inner.dst),
        proto,
        mtu,
        quoted: inner_bytes.get(off..).unwrap_or(&[]),
    };
    stack.notify_control(AddrFamily::Inet6, &msg);
}

fn suppress(flags: NetBufFlags, hdr: &Ipv6Hdr, invoking: &[u8], err: &Icmp6Err) -> bool {
    if hdr.src.is_unspecified() || hdr.src.is_multicast() {
        return true;
    }

    let mcast = hdr.dst.is_multicast()
        || flags.intersects(NetBufFlags::BROADCAST | NetBufFlags::MULTICAST);
    if mcast && !err.multicast_ok() {
        return true;
    }

    match upper_layer(invoking) {
        Some((PROTO_ICMPV6, off)) => {
            invoking.get(off).copied().is_some_and(is_error_type)
        }
        _ => false,
    }
}

/// Send an ICMPv6 error about `invoking`, a packet received on
/// `netif` with `flags`, headers included.
pub fn icmp6_error(
    stack: &mut Stack,
    netif: NetifId,
    flags: NetBufFlags,
    invoking: &NetBuf,
    err: Icmp6Err,
) {
    let len = invoking.len().min(ICMP6_QUOTE_MAX);
    let mut head = vec![0u8; len];
    if invoking.copy_out(0, &mut head).is_err() {
        return;
    }

    let Ok(hdr) = Ipv6Hdr::parse(&head) else {
        return;
    };

    if suppress(flags, &hdr, &head, &err) {
        crate::engine::dbg!("icmp6: suppressed {:?} to {}", err, hdr.src);
        stack.stats.icmp_err_suppressed += 1;
        return;
    }

    let (msg_type, code) = err.type_code();
    let mut msg = match build_msg(msg_type, code, err.rest(), invoking, len) {
        Ok(msg) => msg,
        Err(e) => {
            crate::engine::dbg!("icmp6: no buffer for error: {}", e);
            stack.stats.drop_nomem += 1;
            return;
        }
    };

    if let Err(e) = prepare_csum(&mut msg, 2) {
        crate::engine::err!("icmp6: error checksum: {}", e);
        return;
    }

    let src = if stack.ip6_is_own(hdr.dst) { hdr.dst } else { Ipv6Addr::ANY_ADDR };
    let out = Ip6Out {
        netif: Some(netif),
        src,
        csum: Some(CsumFinish { offset: 2 }),
        ..Ip6Out::new(hdr.src, PROTO_ICMPV6)
    };

    match stack.ip6_output(&out, msg) {
        Ok(()) => stack.stats.icmp_err_sent += 1,
        Err(e) => crate::engine::dbg!("icmp6: error to {}: {}", hdr.src, e),
    }
}
