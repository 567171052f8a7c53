// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The host side of IGMPv1 and IGMPv2 (RFC 1112, RFC 2236).
//!
//! Reports go out as soon as a query arrives; there is no random
//! response delay and hence no report suppression. A query with a
//! zero max-response time marks the link as having an IGMPv1 querier,
//! after which reports are sent in v1 format and leaves are not sent.

use super::checksum::Checksum;
use super::checksum::HeaderChecksum;
use super::checksum::verify_netbuf;
use super::ip::IP_HEADROOM;
use super::ip::Ip4Out;
use super::ip::Ip4Rx;
use super::netif::NetifId;
use super::stack::Stack;
use crate::sys::netbuf::NetBuf;
use fnet_api::Error;
use fnet_api::Ipv4Addr;
use fnet_api::PROTO_IGMP;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;
use zerocopy::Unaligned;

pub const IGMP_MEMBERSHIP_QUERY: u8 = 0x11;
pub const IGMP_V1_MEMBERSHIP_REPORT: u8 = 0x12;
pub const IGMP_V2_MEMBERSHIP_REPORT: u8 = 0x16;
pub const IGMP_LEAVE_GROUP: u8 = 0x17;

/// Internetwork control precedence.
const IGMP_TOS: u8 = 0xC0;
const IGMP_TTL: u8 = 1;

#[repr(C)]
#[derive(
    Clone, Debug, FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned,
)]
pub struct IgmpHdrRaw {
    pub msg_type: u8,
    pub max_resp: u8,
    pub csum: [u8; 2],
    pub group: [u8; 4],
}

impl IgmpHdrRaw {
    pub const SIZE: usize = core::mem::size_of::<Self>();
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct IgmpMsg {
    pub msg_type: u8,
    /// In tenths of a second. Zero in a query means an IGMPv1 querier.
    pub max_resp: u8,
    pub group: Ipv4Addr,
}

impl IgmpMsg {
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        let (raw, _) = IgmpHdrRaw::ref_from_prefix(bytes).ok()?;
        Some(Self {
            msg_type: raw.msg_type,
            max_resp: raw.max_resp,
            group: Ipv4Addr::from(raw.group),
        })
    }

    /// Emit the message, checksum included.
    pub fn emit(&self) -> [u8; IgmpHdrRaw::SIZE] {
        let mut raw = IgmpHdrRaw {
            msg_type: self.msg_type,
            max_resp: self.max_resp,
            csum: [0; 2],
            group: self.group.bytes(),
        };
        raw.csum = HeaderChecksum::from(Checksum::compute(raw.as_bytes())).bytes();

        let mut out = [0u8; IgmpHdrRaw::SIZE];
        out.copy_from_slice(raw.as_bytes());
        out
    }
}

/// Handle an IGMP message. `pkt` starts at the IGMP header.
pub fn input(stack: &mut Stack, rx: Ip4Rx, pkt: NetBuf) {
    stack.stats.igmp_in += 1;

    let mut buf = [0u8; IgmpHdrRaw::SIZE];
    if pkt.copy_out(0, &mut buf).is_err() {
        crate::engine::dbg!("igmp: runt from {}", rx.src);
        stack.stats.drop_bad_hdr += 1;
        return;
    }

    if !verify_netbuf(&pkt, Checksum::new()) {
        crate::engine::dbg!("igmp: bad checksum from {}", rx.src);
        stack.stats.drop_bad_csum += 1;
        return;
    }

    let Some(msg) = IgmpMsg::parse(&buf) else {
        return;
    };

    // Reports and leaves from other members need no action without
    // report suppression.
    if msg.msg_type != IGMP_MEMBERSHIP_QUERY {
        return;
    }

    if let Some(n) = stack.netif_mut(rx.netif) {
        n.igmp_v1_querier = msg.max_resp == 0;
    }

    let groups: alloc::vec::Vec<Ipv4Addr> = stack
        .mcast4
        .iter()
        .filter(|(g, n, _)| {
            *n == rx.netif
                && (msg.group.is_unspecified() || msg.group == *g)
        })
        .map(|(g, _, _)| g)
        .collect();

    for g in groups {
        if let Err(e) = send_report(stack, rx.netif, g) {
            crate::engine::dbg!("igmp: report for {}: {}", g, e);
        }
    }
}

fn use_v1(stack: &Stack, netif: NetifId) -> bool {
    stack.cfg.igmp_version < 2
        || stack.netif(netif).is_some_and(|n| n.igmp_v1_querier)
}

fn send(
    stack: &mut Stack,
    netif: NetifId,
    msg_type: u8,
    group: Ipv4Addr,
    dst: Ipv4Addr,
) -> Result<(), Error> {
    let msg = IgmpMsg { msg_type, max_resp: 0, group };
    let pkt = stack.pool.from_slice_with_headroom(IP_HEADROOM, &msg.emit())?;
    let out = Ip4Out {
        netif: Some(netif),
        tos: IGMP_TOS,
        ttl: IGMP_TTL,
        ..Ip4Out::new(dst, PROTO_IGMP)
    };

    stack.ip4_output(&out, pkt)?;
    stack.stats.igmp_out += 1;
    Ok(())
}

/// Announce membership of `group` on `netif`. The all-hosts group is
/// never reported.
pub fn send_report(
    stack: &mut Stack,
    netif: NetifId,
    group: Ipv4Addr,
) -> Result<(), Error> {
    if group == Ipv4Addr::ALL_HOSTS {
        return Ok(());
    }

    let msg_type = if use_v1(stack, netif) {
        IGMP_V1_MEMBERSHIP_REPORT
    } else {
        IGMP_V2_MEMBERSHIP_REPORT
    };
    send(stack, netif, msg_type, group, group)
}

/// Tell the routers that the last member of `group` on `netif` left.
/// IGMPv1 has no leave message.
pub fn send_leave(
    stack: &mut Stack,
    netif: NetifId,
    group: Ipv4Addr,
) -> Result<(), Error> {
    if group == Ipv4Addr::ALL_HOSTS || use_v1(stack, netif) {
        return Ok(());
    }

    send(stack, netif, IGMP_LEAVE_GROUP, group, Ipv4Addr::ALL_ROUTERS)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::engine::checksum::verify;

    #[rustfmt::skip]
    const GENERAL_QUERY: [u8; 8] = [
        // type, max resp time (10s)
        0x11, 0x64,
        // checksum
        0xee, 0x9b,
        // group
        0x00, 0x00, 0x00, 0x00,
    ];

    #[test]
    fn parse_query() {
        assert!(verify(&GENERAL_QUERY));
        let msg = IgmpMsg::parse(&GENERAL_QUERY).unwrap();
        assert_eq!(msg.msg_type, IGMP_MEMBERSHIP_QUERY);
        assert_eq!(msg.max_resp, 100);
        assert!(msg.group.is_unspecified());
        assert!(IgmpMsg::parse(&GENERAL_QUERY[..7]).is_none());
    }

    #[test]
    fn emit_report() {
        let group = Ipv4Addr::from([239, 1, 2, 3]);
        let msg = IgmpMsg {
            msg_type: IGMP_V2_MEMBERSHIP_REPORT,
            max_resp: 0,
            group,
        };
        let bytes = msg.emit();
        assert!(verify(&bytes));
        assert_eq!(&bytes[4..], &[239, 1, 2, 3]);
        assert_eq!(IgmpMsg::parse(&bytes), Some(msg));
    }
}
