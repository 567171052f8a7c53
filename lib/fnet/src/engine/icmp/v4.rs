// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! ICMPv4: echo, error generation and error input.

use super::IcmpHdr;
use super::IcmpHdrRaw;
use super::build_msg;
use crate::engine::checksum::Checksum;
use crate::engine::checksum::HeaderChecksum;
use crate::engine::checksum::verify_netbuf;
use crate::engine::ip::Ip4Out;
use crate::engine::ip::Ip4Rx;
use crate::engine::ip::Ipv4Hdr;
use crate::engine::ip::v4::IP4_QUOTE_PAYLOAD;
use crate::engine::ip::v4::IPV4_HDR_MAX;
use crate::engine::netif::NetifId;
use crate::engine::prot::CtlMsg;
use crate::engine::stack::Stack;
use crate::sys::netbuf::NetBuf;
use crate::sys::netbuf::NetBufFlags;
use fnet_api::AddrFamily;
use fnet_api::Error;
use fnet_api::IpAddr;
use fnet_api::Ipv4Addr;
use fnet_api::PROTO_ICMP;
use fnet_api::ProtNotify;

pub const ICMP_ECHO_REPLY: u8 = 0;
pub const ICMP_UNREACH: u8 = 3;
pub const ICMP_SOURCE_QUENCH: u8 = 4;
pub const ICMP_REDIRECT: u8 = 5;
pub const ICMP_ECHO: u8 = 8;
pub const ICMP_TIME_EXCEEDED: u8 = 11;
pub const ICMP_PARAM_PROB: u8 = 12;

pub const UNREACH_NET: u8 = 0;
pub const UNREACH_HOST: u8 = 1;
pub const UNREACH_PROTOCOL: u8 = 2;
pub const UNREACH_PORT: u8 = 3;
pub const UNREACH_NEEDFRAG: u8 = 4;
pub const UNREACH_SRCFAIL: u8 = 5;
pub const UNREACH_NET_UNKNOWN: u8 = 6;
pub const UNREACH_HOST_UNKNOWN: u8 = 7;
pub const UNREACH_ISOLATED: u8 = 8;
pub const UNREACH_NET_PROHIB: u8 = 9;
pub const UNREACH_HOST_PROHIB: u8 = 10;
pub const UNREACH_TOSNET: u8 = 11;
pub const UNREACH_TOSHOST: u8 = 12;

pub const TIMXCEED_INTRANS: u8 = 0;
pub const TIMXCEED_REASS: u8 = 1;

/// Is `msg_type` one of the ICMP error messages?
pub fn is_error_type(msg_type: u8) -> bool {
    matches!(
        msg_type,
        ICMP_UNREACH
            | ICMP_SOURCE_QUENCH
            | ICMP_REDIRECT
            | ICMP_TIME_EXCEEDED
            | ICMP_PARAM_PROB
    )
}

/// An ICMPv4 error this host sends.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Icmp4Err {
    NetUnreach,
    HostUnreach,
    ProtoUnreach,
    PortUnreach,
    FragNeeded { mtu: u16 },
    TtlExceeded,
    ReassTimeout,
    ParamProblem { pointer: u8 },
}

impl Icmp4Err {
    pub fn type_code(&self) -> (u8, u8) {
        match self {
            Self::NetUnreach => (ICMP_UNREACH, UNREACH_NET),
            Self::HostUnreach => (ICMP_UNREACH, UNREACH_HOST),
            Self::ProtoUnreach => (ICMP_UNREACH, UNREACH_PROTOCOL),
            Self::PortUnreach => (ICMP_UNREACH, UNREACH_PORT),
            Self::FragNeeded { .. } => (ICMP_UNREACH, UNREACH_NEEDFRAG),
            Self::TtlExceeded => (ICMP_TIME_EXCEEDED, TIMXCEED_INTRANS),
            Self::ReassTimeout => (ICMP_TIME_EXCEEDED, TIMXCEED_REASS),
            Self::ParamProblem { .. } => (ICMP_PARAM_PROB, 0),
        }
    }

    fn rest(&self) -> [u8; 4] {
        match self {
            Self::FragNeeded { mtu } => {
                let m = mtu.to_be_bytes();
                [0, 0, m[0], m[1]]
            }
            Self::ParamProblem { pointer } => [*pointer, 0, 0, 0],
            _ => [0; 4],
        }
    }
}

/// Map a received error to what the owning protocol is told.
pub fn notify_for(msg_type: u8, code: u8) -> Option<ProtNotify> {
    let n = match (msg_type, code) {
        (
            ICMP_UNREACH,
            UNREACH_NET | UNREACH_NET_UNKNOWN | UNREACH_NET_PROHIB
            | UNREACH_TOSNET,
        ) => ProtNotify::NetUnreach,
        (ICMP_UNREACH, UNREACH_PROTOCOL) => ProtNotify::ProtoUnreach,
        (ICMP_UNREACH, UNREACH_PORT) => ProtNotify::PortUnreach,
        (ICMP_UNREACH, UNREACH_NEEDFRAG) => ProtNotify::MsgSize,
        (ICMP_UNREACH, UNREACH_SRCFAIL) => ProtNotify::SrcFail,
        (
            ICMP_UNREACH,
            UNREACH_HOST | UNREACH_HOST_UNKNOWN | UNREACH_ISOLATED
            | UNREACH_HOST_PROHIB | UNREACH_TOSHOST,
        ) => ProtNotify::HostUnreach,
        (ICMP_SOURCE_QUENCH, _) => ProtNotify::Quench,
        (ICMP_TIME_EXCEEDED, TIMXCEED_INTRANS) => ProtNotify::TimxceedIntrans,
        (ICMP_TIME_EXCEEDED, TIMXCEED_REASS) => ProtNotify::TimxceedReass,
        (ICMP_PARAM_PROB, _) => ProtNotify::ParamProb,
        _ => return None,
    };

    Some(n)
}

fn set_csum(msg: &mut NetBuf) -> Result<(), Error> {
    msg.copy_in(2, &[0, 0])?;
    let csum = HeaderChecksum::from(Checksum::of_netbuf(msg)).bytes();
    msg.copy_in(2, &csum)?;
    Ok(())
}

/// Handle an ICMP message addressed to us. `pkt` starts at the ICMP
/// header.
pub fn input(stack: &mut Stack, rx: Ip4Rx, pkt: NetBuf) {
    stack.stats.icmp_in += 1;

    let Some(hdr) = IcmpHdr::from_netbuf(&pkt) else {
        crate::engine::dbg!("icmp: runt from {}", rx.src);
        stack.stats.drop_bad_hdr += 1;
        return;
    };

    if !verify_netbuf(&pkt, Checksum::new()) {
        crate::engine::dbg!("icmp: bad checksum from {}", rx.src);
        stack.stats.drop_bad_csum += 1;
        return;
    }

    match hdr.msg_type {
        ICMP_ECHO => echo(stack, &rx, pkt),
        t if is_error_type(t) => error_input(stack, &hdr, &pkt),
        // Anything else has already been seen by any raw taps.
        _ => {}
    }
}

fn echo(stack: &mut Stack, rx: &Ip4Rx, mut pkt: NetBuf) {
    if !stack.cfg.echo_reply {
        return;
    }

    // No replies to broadcast or multicast requests.
    if rx.flags.intersects(NetBufFlags::BROADCAST | NetBufFlags::MULTICAST)
        || rx.dst.is_multicast()
        || rx.dst.is_limited_broadcast()
    {
        crate::engine::dbg!("icmp: ignoring echo to {}", rx.dst);
        return;
    }

    let res = pkt
        .copy_in(0, &[ICMP_ECHO_REPLY])
        .map_err(Error::from)
        .and_then(|_| set_csum(&mut pkt));
    if let Err(e) = res {
        crate::engine::err!("icmp: echo reply: {}", e);
        return;
    }

    let out = Ip4Out {
        netif: Some(rx.netif),
        src: rx.dst,
        tos: rx.tos,
        ..Ip4Out::new(rx.src, PROTO_ICMP)
    };

    match stack.ip4_output(&out, pkt) {
        Ok(()) => stack.stats.icmp_echo_replies += 1,
        Err(e) => crate::engine::dbg!("icmp: echo reply to {}: {}", rx.src, e),
    }
}

fn error_input(stack: &mut Stack, hdr: &IcmpHdr, pkt: &NetBuf) {
    let Some(notify) = notify_for(hdr.msg_type, hdr.code) else {
        return;
    };

    // The quoted header plus the start of its payload.
    let mut buf = [0u8; IPV4_HDR_MAX + IP4_QUOTE_PAYLOAD];
    let n = pkt.len().saturating_sub(IcmpHdrRaw::SIZE).min(buf.len());
    if pkt.copy_out(IcmpHdrRaw::SIZE, &mut buf[..n]).is_err() {
        return;
    }

    let inner = match Ipv4Hdr::parse(&buf[..n]) {
        Ok(inner) => inner,
        Err(e) => {
            crate::engine::dbg!("icmp: bad quoted header: {}", e);
            return;
        }
    };

    let mtu = match notify {
        ProtNotify::MsgSize => Some(hdr.rest_u32() & 0xFFFF),
        _ => None,
    };

    let msg = CtlMsg {
        notify,
        src: IpAddr::Ip4(inner.src),
        dst: IpAddr::Ip4(inner.dst),
        proto: inner.proto,
        mtu,
        quoted: &buf[inner.hdr_len()..n],
    };
    stack.notify_control(AddrFamily::Inet, &msg);
}

/// Should no error be sent about this datagram?
///
/// Nothing goes back about an ICMP error, a non-initial fragment,
/// or anything sent to or from a broadcast, multicast or otherwise
/// unusable address.
fn suppress(
    stack: &Stack,
    netif: NetifId,
    flags: NetBufFlags,
    hdr: &Ipv4Hdr,
    quote: &NetBuf,
) -> bool {
    if flags.intersects(NetBufFlags::BROADCAST | NetBufFlags::MULTICAST) {
        return true;
    }

    if hdr.frag_off != 0 {
        return true;
    }

    let nif = stack.netif(netif);
    let bcast = |a: Ipv4Addr| {
        a.is_limited_broadcast() || nif.is_some_and(|n| n.ip4_is_broadcast(a))
    };

    if hdr.dst.is_multicast() || bcast(hdr.dst) {
        return true;
    }

    if hdr.src.is_unspecified()
        || hdr.src.is_multicast()
        || hdr.src.is_reserved()
        || bcast(hdr.src)
    {
        return true;
    }

    hdr.proto == PROTO_ICMP
        && quote.byte_at(hdr.hdr_len()).is_some_and(is_error_type)
}

/// Send an ICMP error about the datagram quoted in `quote`, which
/// arrived on `netif` with `flags`.
pub fn icmp4_error(
    stack: &mut Stack,
    netif: NetifId,
    flags: NetBufFlags,
    quote: &NetBuf,
    err: Icmp4Err,
) {
    let mut hb = [0u8; IPV4_HDR_MAX];
    let n = quote.len().min(IPV4_HDR_MAX);
    if quote.copy_out(0, &mut hb[..n]).is_err() {
        return;
    }

    let Ok(hdr) = Ipv4Hdr::parse(&hb[..n]) else {
        return;
    };

    if suppress(stack, netif, flags, &hdr, quote) {
        crate::engine::dbg!("icmp: suppressed {:?} to {}", err, hdr.src);
        stack.stats.icmp_err_suppressed += 1;
        return;
    }

    let (msg_type, code) = err.type_code();
    let len = quote.len().min(hdr.hdr_len() + IP4_QUOTE_PAYLOAD);
    let mut msg = match build_msg(msg_type, code, err.rest(), quote, len) {
        Ok(msg) => msg,
        Err(e) => {
            crate::engine::dbg!("icmp: no buffer for error: {}", e);
            stack.stats.drop_nomem += 1;
            return;
        }
    };

    if let Err(e) = set_csum(&mut msg) {
        crate::engine::err!("icmp: error checksum: {}", e);
        return;
    }

    let src = if stack.ip4_is_own(hdr.dst) {
        hdr.dst
    } else {
        Ipv4Addr::ANY_ADDR
    };
    let out = Ip4Out { netif: Some(netif), src, ..Ip4Out::new(hdr.src, PROTO_ICMP) };

    match stack.ip4_output(&out, msg) {
        Ok(()) => stack.stats.icmp_err_sent += 1,
        Err(e) => crate::engine::dbg!("icmp: error to {}: {}", hdr.src, e),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn notify_mapping() {
        assert_eq!(notify_for(ICMP_UNREACH, UNREACH_PORT), Some(ProtNotify::PortUnreach));
        assert_eq!(notify_for(ICMP_UNREACH, UNREACH_NEEDFRAG), Some(ProtNotify::MsgSize));
        assert_eq!(notify_for(ICMP_UNREACH, UNREACH_NET_PROHIB), Some(ProtNotify::NetUnreach));
        assert_eq!(notify_for(ICMP_UNREACH, UNREACH_HOST_UNKNOWN), Some(ProtNotify::HostUnreach));
        assert_eq!(notify_for(ICMP_UNREACH, 99), None);
        assert_eq!(notify_for(ICMP_TIME_EXCEEDED, TIMXCEED_REASS), Some(ProtNotify::TimxceedReass));
        assert_eq!(notify_for(ICMP_SOURCE_QUENCH, 0), Some(ProtNotify::Quench));
        assert_eq!(notify_for(ICMP_PARAM_PROB, 1), Some(ProtNotify::ParamProb));
        assert_eq!(notify_for(ICMP_REDIRECT, 0), None);
        assert_eq!(notify_for(ICMP_ECHO, 0), None);
    }

    #[test]
    fn error_encoding() {
        assert_eq!(Icmp4Err::ProtoUnreach.type_code(), (3, 2));
        assert_eq!(Icmp4Err::ReassTimeout.type_code(), (11, 1));
        assert_eq!(Icmp4Err::FragNeeded { mtu: 576 }.rest(), [0, 0, 0x02, 0x40]);
        assert_eq!(Icmp4Err::ParamProblem { pointer: 9 }.rest(), [9, 0, 0, 0]);
        assert!(is_error_type(ICMP_UNREACH));
        assert!(!is_error_type(ICMP_ECHO_REPLY));
    }
}
