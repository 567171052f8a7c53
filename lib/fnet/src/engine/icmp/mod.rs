// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! ICMP for IPv4 and IPv6.
//!
//! Both versions share the 8-byte header layout: type, code,
//! checksum and 4 type-specific bytes. Everything after that is the
//! message body, which for errors is the quoted invoking packet.

pub mod v4;
pub mod v6;

use super::ip::IP_HEADROOM;
use crate::sys::netbuf::NetBuf;
use fnet_api::Error;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;
use zerocopy::Unaligned;

#[repr(C)]
#[derive(
    Clone, Copy, Debug, FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned,
)]
pub struct IcmpHdrRaw {
    pub msg_type: u8,
    pub code: u8,
    pub csum: [u8; 2],
    pub rest: [u8; 4],
}

impl IcmpHdrRaw {
    pub const SIZE: usize = core::mem::size_of::<Self>();
}

/// The decoded fixed part of an ICMP message.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct IcmpHdr {
    pub msg_type: u8,
    pub code: u8,
    pub csum: [u8; 2],
    pub rest: [u8; 4],
}

impl IcmpHdr {
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        let (raw, _) = IcmpHdrRaw::ref_from_prefix(bytes).ok()?;
        Some(Self {
            msg_type: raw.msg_type,
            code: raw.code,
            csum: raw.csum,
            rest: raw.rest,
        })
    }

    /// The type-specific word, as used by Fragmentation Needed,
    /// Packet Too Big and Parameter Problem.
    pub fn rest_u32(&self) -> u32 {
        u32::from_be_bytes(self.rest)
    }

    /// Read the header from the front of `pkt`.
    pub fn from_netbuf(pkt: &NetBuf) -> Option<Self> {
        let mut buf = [0u8; IcmpHdrRaw::SIZE];
        pkt.copy_out(0, &mut buf).ok()?;
        Self::parse(&buf)
    }
}

/// Build an ICMP message quoting the first `len` bytes of `body`. The
/// checksum field is left zeroed.
pub(crate) fn build_msg(
    msg_type: u8,
    code: u8,
    rest: [u8; 4],
    body: &NetBuf,
    len: usize,
) -> Result<NetBuf, Error> {
    let mut msg = body.copy_range(IP_HEADROOM + IcmpHdrRaw::SIZE, 0, len)?;
    let raw = IcmpHdrRaw { msg_type, code, csum: [0; 2], rest };
    msg.prepend_bytes(raw.as_bytes())?;
    Ok(msg)
}
