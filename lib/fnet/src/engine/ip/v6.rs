// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! IPv6 headers, input, routing and output.

use super::CsumFinish;
use super::Ip6Rx;
use super::addrsel;
use super::ext;
use super::ext::ExtAction;
use super::ext::ExtCtx;
use super::finish_csum;
use crate::engine::checksum::pseudo_v6;
use crate::engine::icmp::v6::ICMP6_QUOTE_MAX;
use crate::engine::netif::Netif;
use crate::engine::netif::NetifId;
use crate::engine::stack::Stack;
use crate::sys::netbuf::NetBuf;
use crate::sys::netbuf::NetBufFlags;
use alloc::vec::Vec;
use core::fmt;
use core::fmt::Display;
use fnet_api::Error;
use fnet_api::Ipv6Addr;
use fnet_api::PROTO_FRAGMENT;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;
use zerocopy::Unaligned;

pub const IPV6_VERSION: u8 = 6;

/// Offset of the Payload Length field in the fixed header.
pub const IPV6_PAYLOAD_LEN_OFF: usize = 4;

/// Offset of the Next Header field in the fixed header.
pub const IPV6_NEXT_HDR_OFF: usize = 6;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Ipv6HdrError {
    BadVersion { vsn: u8 },
    TooShort { len: usize },
}

impl Display for Ipv6HdrError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::BadVersion { vsn } => write!(f, "bad version: {vsn}"),
            Self::TooShort { len } => write!(f, "too short: {len}"),
        }
    }
}

#[repr(C)]
#[derive(
    Clone, Debug, FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned,
)]
pub struct Ipv6HdrRaw {
    pub vsn_class_flow: [u8; 4],
    pub payload_len: [u8; 2],
    pub next_hdr: u8,
    pub hop_limit: u8,
    pub src: [u8; 16],
    pub dst: [u8; 16],
}

impl Ipv6HdrRaw {
    pub const SIZE: usize = core::mem::size_of::<Self>();
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Ipv6Hdr {
    pub traffic_class: u8,
    pub flow_label: u32,
    pub payload_len: u16,
    pub next_hdr: u8,
    pub hop_limit: u8,
    pub src: Ipv6Addr,
    pub dst: Ipv6Addr,
}

impl Ipv6Hdr {
    pub const SIZE: usize = Ipv6HdrRaw::SIZE;

    pub fn parse(bytes: &[u8]) -> Result<Self, Ipv6HdrError> {
        let (raw, _) = Ipv6HdrRaw::ref_from_prefix(bytes)
            .map_err(|_| Ipv6HdrError::TooShort { len: bytes.len() })?;
        let word = u32::from_be_bytes(raw.vsn_class_flow);

        match (word >> 28) as u8 {
            IPV6_VERSION => {}
            vsn => return Err(Ipv6HdrError::BadVersion { vsn }),
        }

        Ok(Self {
            traffic_class: (word >> 20) as u8,
            flow_label: word & 0x000F_FFFF,
            payload_len: u16::from_be_bytes(raw.payload_len),
            next_hdr: raw.next_hdr,
            hop_limit: raw.hop_limit,
            src: Ipv6Addr::from(raw.src),
            dst: Ipv6Addr::from(raw.dst),
        })
    }

    pub fn emit(&self, dst: &mut [u8]) {
        let word = (u32::from(IPV6_VERSION) << 28)
            | (u32::from(self.traffic_class) << 20)
            | (self.flow_label & 0x000F_FFFF);
        let raw = Ipv6HdrRaw {
            vsn_class_flow: word.to_be_bytes(),
            payload_len: self.payload_len.to_be_bytes(),
            next_hdr: self.next_hdr,
            hop_limit: self.hop_limit,
            src: self.src.bytes(),
            dst: self.dst.bytes(),
        };
        dst[..Self::SIZE].copy_from_slice(raw.as_bytes());
    }
}

#[repr(C)]
#[derive(
    Clone, Debug, FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned,
)]
pub struct FragHdrRaw {
    pub next_hdr: u8,
    pub reserved: u8,
    pub offset_flags: [u8; 2],
    pub ident: [u8; 4],
}

/// The Fragment extension header.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FragHdr {
    pub next_hdr: u8,
    /// Fragment offset in 8-byte units.
    pub frag_off: u16,
    pub more: bool,
    pub ident: u32,
}

impl FragHdr {
    pub const SIZE: usize = core::mem::size_of::<FragHdrRaw>();

    pub fn parse(bytes: &[u8]) -> Result<Self, Ipv6HdrError> {
        let (raw, _) = FragHdrRaw::ref_from_prefix(bytes)
            .map_err(|_| Ipv6HdrError::TooShort { len: bytes.len() })?;
        let of = u16::from_be_bytes(raw.offset_flags);

        Ok(Self {
            next_hdr: raw.next_hdr,
            frag_off: of >> 3,
            more: of & 0x1 != 0,
            ident: u32::from_be_bytes(raw.ident),
        })
    }

    pub fn emit(&self, dst: &mut [u8]) {
        let of = (self.frag_off << 3) | u16::from(self.more);
        let raw = FragHdrRaw {
            next_hdr: self.next_hdr,
            reserved: 0,
            offset_flags: of.to_be_bytes(),
            ident: self.ident.to_be_bytes(),
        };
        dst[..Self::SIZE].copy_from_slice(raw.as_bytes());
    }

    pub fn offset_bytes(&self) -> usize {
        usize::from(self.frag_off) * 8
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct Ip6FragKey {
    pub ident: u32,
    pub nh: u8,
    pub src: Ipv6Addr,
    pub dst: Ipv6Addr,
}

#[derive(Debug)]
pub(crate) struct Ip6FragMeta {
    pub hdr: Ipv6Hdr,
    pub netif: NetifId,
    pub flags: NetBufFlags,
}

/// Arguments to [`Stack::ip6_output()`].
#[derive(Clone, Copy, Debug)]
pub struct Ip6Out {
    pub netif: Option<NetifId>,
    /// The unspecified address means "select one".
    pub src: Ipv6Addr,
    pub dst: Ipv6Addr,
    pub proto: u8,
    /// Zero means the interface or stack default.
    pub hop_limit: u8,
    pub csum: Option<CsumFinish>,
}

impl Ip6Out {
    pub fn new(dst: Ipv6Addr, proto: u8) -> Self {
        Self {
            netif: None,
            src: Ipv6Addr::ANY_ADDR,
            dst,
            proto,
            hop_limit: 0,
            csum: None,
        }
    }
}

impl Stack {
    /// Process one IPv6 packet taken off the input queue.
    pub fn ip6_input_low(&mut self, id: NetifId, mut pkt: NetBuf) {
        self.stats.rx_ip6 += 1;

        let Some(netif) = self.netif(id) else {
            crate::engine::dbg!("ip6: no netif {}", id);
            self.stats.drop_bad_hdr += 1;
            return;
        };

        if netif.ip6_disabled() {
            self.stats.drop_disabled += 1;
            return;
        }

        let len = pkt.len();
        let parsed = match pkt.pullup(Ipv6Hdr::SIZE) {
            Ok(bytes) => Ipv6Hdr::parse(bytes),
            Err(_) => Err(Ipv6HdrError::TooShort { len }),
        };
        let hdr = match parsed {
            Ok(hdr) => hdr,
            Err(e) => {
                crate::engine::dbg!("ip6: bad header: {}", e);
                self.stats.drop_bad_hdr += 1;
                return;
            }
        };

        let total = Ipv6Hdr::SIZE + usize::from(hdr.payload_len);
        if total > len {
            crate::engine::dbg!(
                "ip6: payload length {} exceeds {} bytes",
                hdr.payload_len,
                len
            );
            self.stats.drop_bad_hdr += 1;
            return;
        }

        if hdr.src.is_multicast() {
            crate::engine::dbg!("ip6: multicast source {}", hdr.src);
            self.stats.drop_bad_hdr += 1;
            return;
        }

        let mut flags = pkt.flags();
        match self.ip6_accepts(id, hdr.dst) {
            Some(extra) => flags |= extra,
            None => {
                crate::engine::dbg!("ip6: {} is not for us", hdr.dst);
                self.stats.drop_not_for_us += 1;
                return;
            }
        }

        pkt.truncate(total);
        let mut ctx = ExtCtx::new(id, flags, hdr, pkt);

        match ext::process(self, &mut ctx) {
            ExtAction::Transport => self.ip6_deliver(ctx),
            ExtAction::Continue | ExtAction::Stop => {}
        }
    }

    fn ip6_accepts(&self, id: NetifId, dst: Ipv6Addr) -> Option<NetBufFlags> {
        let netif = self.netif(id)?;

        if dst.is_multicast() {
            let joined = dst == Ipv6Addr::ALL_NODES
                || dst == Ipv6Addr::ALL_NODES_IF_LOCAL
                || self.mcast6.contains(dst, id)
                // Tentative addresses too, for duplicate detection.
                || netif
                    .ip6_addrs()
                    .iter()
                    .any(|a| a.addr.solicited_node_multicast() == dst);

            return joined.then_some(NetBufFlags::MULTICAST);
        }

        if netif.is_loopback() || netif.ip6_is_own(dst) {
            return Some(NetBufFlags::empty());
        }

        None
    }

    /// Hand the packet in `ctx`, positioned at its upper-layer header,
    /// to the protocol registry.
    fn ip6_deliver(&mut self, ctx: ExtCtx) {
        let ExtCtx { netif, flags, hdr, mut pkt, off, nh, nh_off, .. } = ctx;

        let qlen = pkt.len().min(ICMP6_QUOTE_MAX);
        let quote = match pkt.copy_range(0, 0, qlen) {
            Ok(q) => q,
            Err(_) => {
                self.stats.drop_nomem += 1;
                return;
            }
        };

        if pkt.trim_front(off).is_err() {
            self.stats.drop_bad_hdr += 1;
            return;
        }

        let rx = Ip6Rx {
            netif,
            src: hdr.src,
            dst: hdr.dst,
            nh,
            hop_limit: hdr.hop_limit,
            traffic_class: hdr.traffic_class,
            flags,
            nh_offset: nh_off,
            quote,
        };

        self.ip6_dispatch(rx, pkt);
    }

    /// Is `addr` assigned to any interface?
    pub fn ip6_is_own(&self, addr: Ipv6Addr) -> bool {
        self.netifs.iter().any(|n| n.ip6_is_own(addr))
    }

    /// Choose the interface for `dst`.
    ///
    /// Our own addresses go to the loopback, then the first interface
    /// on whose link `dst` lies, then the default interface.
    pub fn ip6_route(&self, dst: Ipv6Addr) -> Option<NetifId> {
        if dst.is_loopback() {
            return self.loopback;
        }

        let candidates = || {
            self.netifs.iter().filter(|n| !n.is_loopback() && !n.ip6_disabled())
        };

        if let Some(n) = candidates().find(|n| n.ip6_is_own(dst)) {
            return self.loopback.or(Some(n.id()));
        }

        if !dst.is_multicast() {
            if let Some(n) = candidates().find(|n| n.ip6_on_link(dst)) {
                return Some(n.id());
            }
        }

        self.default_netif()
    }

    /// The path MTU towards `dst`.
    pub fn ip6_mtu(&self, dst: Ipv6Addr) -> Option<u16> {
        let id = self.ip6_route(dst)?;
        self.netif(id).map(Netif::pmtu6)
    }

    /// Pick a source address for `dst` from every usable interface
    /// address, preferring those of `netif`.
    pub fn select_src_addr(
        &self,
        netif: Option<NetifId>,
        dst: Ipv6Addr,
    ) -> Option<Ipv6Addr> {
        let cands: Vec<addrsel::Candidate> = self
            .netifs
            .iter()
            .filter(|n| !n.ip6_disabled())
            .flat_map(|n| {
                n.ip6_addrs().iter().filter(|a| a.is_usable()).map(|a| {
                    addrsel::Candidate { addr: *a, netif: n.id() }
                })
            })
            .collect();

        addrsel::select_src_addr(&cands, netif, dst)
    }

    fn next_ip6_ident(&mut self) -> u32 {
        self.ip6_ident = self.ip6_ident.wrapping_add(1);
        self.ip6_ident
    }

    /// Send `pkt` (the upper-layer message) as one or more IPv6
    /// packets, adding a Fragment header when the path MTU requires.
    pub fn ip6_output(&mut self, out: &Ip6Out, mut pkt: NetBuf) -> Result<(), Error> {
        if out.dst.is_unspecified() {
            return Err(Error::DestAddrReq);
        }

        let mut id = match out.netif {
            Some(id) => id,
            None => self.ip6_route(out.dst).ok_or(Error::NetUnreach)?,
        };

        let netif = self.netif(id).ok_or(Error::NetUnreach)?;
        if netif.ip6_disabled() {
            return Err(Error::IpDisabled);
        }

        let if_hops = netif.hop_limit();
        if !netif.is_loopback() && netif.ip6_is_own(out.dst) {
            if let Some(lo) = self.loopback {
                id = lo;
            }
        }

        let src = match out.src {
            s if s.is_unspecified() => self
                .select_src_addr(Some(id), out.dst)
                .unwrap_or(Ipv6Addr::ANY_ADDR),
            s => s,
        };

        let payload_len = pkt.len();
        if Ipv6Hdr::SIZE + payload_len > self.cfg.max_packet
            || payload_len > usize::from(u16::MAX)
        {
            return Err(Error::MsgSize);
        }

        if let Some(fin) = out.csum {
            let pseudo = pseudo_v6(src, out.dst, payload_len as u32, out.proto);
            finish_csum(&mut pkt, fin, pseudo, out.proto)?;
        }

        let hop_limit = match out.hop_limit {
            0 if out.dst.is_multicast() => 1,
            0 if if_hops != 0 => if_hops,
            0 => self.cfg.ip6_default_hop_limit,
            h => h,
        };

        let mut hdr = Ipv6Hdr {
            traffic_class: 0,
            flow_label: 0,
            payload_len: payload_len as u16,
            next_hdr: out.proto,
            hop_limit,
            src,
            dst: out.dst,
        };

        let fragmentation = self.cfg.fragmentation;
        let ident = self.next_ip6_ident();
        let slot = id.slot().ok_or(Error::NetUnreach)?;
        let netif = self.netifs.get_mut(slot).ok_or(Error::NetUnreach)?;
        let mtu = usize::from(netif.pmtu6());

        if Ipv6Hdr::SIZE + payload_len <= mtu {
            hdr.emit(pkt.prepend(Ipv6Hdr::SIZE)?);
            netif.driver_mut().output_ip6(out.dst, pkt)?;
            self.stats.tx_ip6 += 1;
            return Ok(());
        }

        if !fragmentation {
            return Err(Error::MsgSize);
        }

        let unit = ((mtu - Ipv6Hdr::SIZE - FragHdr::SIZE) / 8) * 8;
        if unit < 8 {
            return Err(Error::MsgSize);
        }

        hdr.next_hdr = PROTO_FRAGMENT;
        let mut fh = FragHdr { next_hdr: out.proto, frag_off: 0, more: false, ident };
        let mut off = 0;
        let mut rest = pkt;
        loop {
            let more = rest.len() > unit;
            let tail = if more { Some(rest.split_off(unit)?) } else { None };
            let mut piece = rest;

            fh.frag_off = (off / 8) as u16;
            fh.more = more;
            fh.emit(piece.prepend(FragHdr::SIZE)?);
            hdr.payload_len = piece.len() as u16;
            hdr.emit(piece.prepend(Ipv6Hdr::SIZE)?);
            netif.driver_mut().output_ip6(out.dst, piece)?;
            self.stats.frag_out += 1;

            off += unit;
            match tail {
                Some(t) => rest = t,
                None => break,
            }
        }

        self.stats.tx_ip6 += 1;
        Ok(())
    }
}
