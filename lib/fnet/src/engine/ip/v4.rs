// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! IPv4 headers, input, routing and output.

use super::CsumFinish;
use super::Ip4Rx;
use super::finish_csum;
use crate::engine::checksum::Checksum;
use crate::engine::checksum::HeaderChecksum;
use crate::engine::checksum::pseudo_v4;
use crate::engine::checksum::verify;
use crate::engine::netif::Netif;
use crate::engine::netif::NetifId;
use crate::engine::reasm::Fragment;
use crate::engine::reasm::ReasmError;
use crate::engine::stack::Stack;
use crate::sys::netbuf::NetBuf;
use crate::sys::netbuf::NetBufFlags;
use core::fmt;
use core::fmt::Display;
use fnet_api::Error;
use fnet_api::Ipv4Addr;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;
use zerocopy::Unaligned;

pub const IPV4_HDR_LEN_MASK: u8 = 0x0F;
pub const IPV4_HDR_VER_SHIFT: u8 = 4;
pub const IPV4_VERSION: u8 = 4;

/// The largest IPv4 header: 15 words.
pub const IPV4_HDR_MAX: usize = 60;

/// Payload bytes quoted after the header in an ICMP error.
pub const IP4_QUOTE_PAYLOAD: usize = 8;

const FRAG_OFF_MASK: u16 = 0x1FFF;
const FLAGS_SHIFT: u16 = 13;

bitflags::bitflags! {
    /// The flag bits of the IPv4 flags/fragment-offset word.
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    pub struct Ipv4Flags: u8 {
        const DONT_FRAGMENT = 0x2;
        const MORE_FRAGMENTS = 0x1;
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Ipv4HdrError {
    BadTotalLen { total_len: u16 },
    BadVersion { vsn: u8 },
    HeaderTruncated { hdr_len: u16 },
    TooShort { len: usize },
}

impl Display for Ipv4HdrError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::BadTotalLen { total_len } => {
                write!(f, "bad total length: {total_len}")
            }
            Self::BadVersion { vsn } => write!(f, "bad version: {vsn}"),
            Self::HeaderTruncated { hdr_len } => {
                write!(f, "header truncated: {hdr_len}")
            }
            Self::TooShort { len } => write!(f, "too short: {len}"),
        }
    }
}

#[repr(C)]
#[derive(
    Clone, Debug, FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned,
)]
pub struct Ipv4HdrRaw {
    pub ver_hdr_len: u8,
    pub tos: u8,
    pub total_len: [u8; 2],
    pub ident: [u8; 2],
    pub frag_and_flags: [u8; 2],
    pub ttl: u8,
    pub proto: u8,
    pub csum: [u8; 2],
    pub src: [u8; 4],
    pub dst: [u8; 4],
}

impl Ipv4HdrRaw {
    pub const SIZE: usize = core::mem::size_of::<Self>();
}

/// An owned IPv4 header, options included.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Ipv4Hdr {
    pub tos: u8,
    pub total_len: u16,
    pub ident: u16,
    pub flags: Ipv4Flags,
    /// Fragment offset in 8-byte units.
    pub frag_off: u16,
    pub ttl: u8,
    pub proto: u8,
    pub csum: [u8; 2],
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub opts: heapless::Vec<u8, 40>,
}

impl Ipv4Hdr {
    pub const BASE_SIZE: usize = Ipv4HdrRaw::SIZE;
    pub const CSUM_BEGIN: usize = 10;
    pub const CSUM_END: usize = 12;

    /// A header with no options for a datagram of `payload_len` bytes.
    pub fn new(
        src: Ipv4Addr,
        dst: Ipv4Addr,
        proto: u8,
        ttl: u8,
        payload_len: u16,
    ) -> Self {
        Self {
            tos: 0,
            total_len: Self::BASE_SIZE as u16 + payload_len,
            ident: 0,
            flags: Ipv4Flags::empty(),
            frag_off: 0,
            ttl,
            proto,
            csum: [0; 2],
            src,
            dst,
            opts: heapless::Vec::new(),
        }
    }

    /// Parse the header at the front of `bytes`, which must hold the
    /// whole header, options included.
    pub fn parse(bytes: &[u8]) -> Result<Self, Ipv4HdrError> {
        let (raw, _) = Ipv4HdrRaw::ref_from_prefix(bytes)
            .map_err(|_| Ipv4HdrError::TooShort { len: bytes.len() })?;

        match raw.ver_hdr_len >> IPV4_HDR_VER_SHIFT {
            IPV4_VERSION => {}
            vsn => return Err(Ipv4HdrError::BadVersion { vsn }),
        }

        let hdr_len = u16::from(raw.ver_hdr_len & IPV4_HDR_LEN_MASK) * 4;
        if usize::from(hdr_len) < Self::BASE_SIZE
            || usize::from(hdr_len) > bytes.len()
        {
            return Err(Ipv4HdrError::HeaderTruncated { hdr_len });
        }

        let total_len = u16::from_be_bytes(raw.total_len);
        if total_len < hdr_len {
            return Err(Ipv4HdrError::BadTotalLen { total_len });
        }

        let ff = u16::from_be_bytes(raw.frag_and_flags);
        let mut opts = heapless::Vec::new();
        // Cannot fail: at most 40 option bytes fit in 15 words.
        let _ = opts
            .extend_from_slice(&bytes[Self::BASE_SIZE..usize::from(hdr_len)]);

        Ok(Self {
            tos: raw.tos,
            total_len,
            ident: u16::from_be_bytes(raw.ident),
            flags: Ipv4Flags::from_bits_truncate((ff >> FLAGS_SHIFT) as u8),
            frag_off: ff & FRAG_OFF_MASK,
            ttl: raw.ttl,
            proto: raw.proto,
            csum: raw.csum,
            src: Ipv4Addr::from(raw.src),
            dst: Ipv4Addr::from(raw.dst),
            opts,
        })
    }

    /// Return the header length, in bytes.
    pub fn hdr_len(&self) -> usize {
        Self::BASE_SIZE + self.opts.len()
    }

    pub fn payload_len(&self) -> usize {
        usize::from(self.total_len).saturating_sub(self.hdr_len())
    }

    pub fn is_fragment(&self) -> bool {
        self.flags.contains(Ipv4Flags::MORE_FRAGMENTS) || self.frag_off != 0
    }

    pub fn more_frags(&self) -> bool {
        self.flags.contains(Ipv4Flags::MORE_FRAGMENTS)
    }

    /// The fragment offset in bytes.
    pub fn frag_offset_bytes(&self) -> usize {
        usize::from(self.frag_off) * 8
    }

    /// Write the header, exactly as held, to the front of `dst`.
    pub fn emit(&self, dst: &mut [u8]) {
        debug_assert!(dst.len() >= self.hdr_len());
        let ff = (u16::from(self.flags.bits()) << FLAGS_SHIFT)
            | (self.frag_off & FRAG_OFF_MASK);
        let raw = Ipv4HdrRaw {
            ver_hdr_len: (IPV4_VERSION << IPV4_HDR_VER_SHIFT)
                | (self.hdr_len() / 4) as u8,
            tos: self.tos,
            total_len: self.total_len.to_be_bytes(),
            ident: self.ident.to_be_bytes(),
            frag_and_flags: ff.to_be_bytes(),
            ttl: self.ttl,
            proto: self.proto,
            csum: self.csum,
            src: self.src.bytes(),
            dst: self.dst.bytes(),
        };
        dst[..Self::BASE_SIZE].copy_from_slice(raw.as_bytes());
        dst[Self::BASE_SIZE..self.hdr_len()].copy_from_slice(&self.opts);
    }

    /// Recompute the header checksum from the other fields.
    pub fn compute_hdr_csum(&mut self) {
        let mut buf = [0u8; IPV4_HDR_MAX];
        self.csum = [0; 2];
        self.emit(&mut buf);
        let csum = Checksum::compute(&buf[..self.hdr_len()]);
        self.csum = HeaderChecksum::from(csum).bytes();
    }

    /// Return a [`Checksum`] of the pseudo header.
    pub fn pseudo_csum(&self) -> Checksum {
        pseudo_v4(self.src, self.dst, self.proto, self.payload_len() as u16)
    }
}

/// Identifies one datagram under reassembly.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct Ip4FragKey {
    pub ident: u16,
    pub proto: u8,
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
}

#[derive(Debug)]
pub(crate) struct Ip4FragMeta {
    pub hdr: Ipv4Hdr,
    pub netif: NetifId,
    pub flags: NetBufFlags,
}

/// Arguments to [`Stack::ip4_output()`].
#[derive(Clone, Copy, Debug)]
pub struct Ip4Out {
    /// Send on this interface instead of routing.
    pub netif: Option<NetifId>,
    /// The unspecified address means "the outgoing interface's".
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub proto: u8,
    pub tos: u8,
    /// Zero means the configured default.
    pub ttl: u8,
    pub df: bool,
    /// Hand the datagram straight to `dst` on the link, ignoring any
    /// gateway.
    pub dont_route: bool,
    pub csum: Option<CsumFinish>,
}

impl Ip4Out {
    pub fn new(dst: Ipv4Addr, proto: u8) -> Self {
        Self {
            netif: None,
            src: Ipv4Addr::ANY_ADDR,
            dst,
            proto,
            tos: 0,
            ttl: 0,
            df: false,
            dont_route: false,
            csum: None,
        }
    }
}

impl Stack {
    /// Process one IPv4 datagram taken off the input queue.
    ///
    /// Never fails: whatever cannot be delivered is counted, logged
    /// and freed.
    pub fn ip4_input_low(&mut self, id: NetifId, mut pkt: NetBuf) {
        self.stats.rx_ip4 += 1;

        let Some(netif) = self.netif(id) else {
            crate::engine::dbg!("ip4: no netif {}", id);
            self.stats.drop_bad_hdr += 1;
            return;
        };

        if netif.ip4_disabled() {
            self.stats.drop_disabled += 1;
            return;
        }

        let hdr = match pullup_ip4_hdr(&mut pkt) {
            Ok(hdr) => hdr,
            Err(e) => {
                crate::engine::dbg!("ip4: bad header: {}", e);
                self.stats.drop_bad_hdr += 1;
                return;
            }
        };
        let hdr_len = hdr.hdr_len();

        if usize::from(hdr.total_len) > pkt.len() {
            crate::engine::dbg!(
                "ip4: total length {} exceeds {} bytes",
                hdr.total_len,
                pkt.len()
            );
            self.stats.drop_bad_hdr += 1;
            return;
        }

        let mut flags = pkt.flags();
        if !flags.contains(NetBufFlags::IP4_CSUM_OK)
            && !pkt.front().get(..hdr_len).is_some_and(verify)
        {
            crate::engine::dbg!("ip4: bad header checksum from {}", hdr.src);
            self.stats.drop_bad_csum += 1;
            return;
        }

        match self.ip4_accepts(id, hdr.dst) {
            Some(extra) => flags |= extra,
            None => {
                crate::engine::dbg!("ip4: {} is not for us", hdr.dst);
                self.stats.drop_not_for_us += 1;
                return;
            }
        }

        pkt.truncate(usize::from(hdr.total_len));

        // Cannot fail: the pullup above covered the header.
        if pkt.trim_front(hdr_len).is_err() {
            return;
        }

        let (hdr, payload, flags) = if hdr.is_fragment() {
            match self.ip4_reassemble(id, hdr, flags, pkt) {
                Some(done) => done,
                None => return,
            }
        } else {
            (hdr, pkt, flags)
        };

        if hdr.hdr_len() + payload.len() > self.cfg.max_packet {
            crate::engine::dbg!("ip4: datagram too big from {}", hdr.src);
            self.stats.drop_too_big += 1;
            return;
        }

        let quote = match ip4_quote(&hdr, &payload) {
            Ok(q) => q,
            Err(_) => {
                self.stats.drop_nomem += 1;
                return;
            }
        };

        let rx = Ip4Rx {
            netif: id,
            src: hdr.src,
            dst: hdr.dst,
            proto: hdr.proto,
            tos: hdr.tos,
            ttl: hdr.ttl,
            flags,
            quote,
        };

        self.ip4_dispatch(rx, payload);
    }

    /// Is `dst` addressed to this host on `id`? Returns the extra
    /// packet flags to apply if so.
    fn ip4_accepts(&self, id: NetifId, dst: Ipv4Addr) -> Option<NetBufFlags> {
        let netif = self.netif(id)?;

        if dst.is_multicast() {
            if dst == Ipv4Addr::ALL_HOSTS || self.mcast4.contains(dst, id) {
                return Some(NetBufFlags::MULTICAST);
            }
            return None;
        }

        if netif.ip4_is_broadcast(dst) {
            return Some(NetBufFlags::BROADCAST);
        }

        // An unconfigured interface takes everything; a loopback
        // carries datagrams for any local address.
        match netif.ip4_addr() {
            _ if netif.is_loopback() => Some(NetBufFlags::empty()),
            None => Some(NetBufFlags::empty()),
            Some(addr) if addr == dst => Some(NetBufFlags::empty()),
            Some(_) => None,
        }
    }

    fn ip4_reassemble(
        &mut self,
        id: NetifId,
        hdr: Ipv4Hdr,
        flags: NetBufFlags,
        data: NetBuf,
    ) -> Option<(Ipv4Hdr, NetBuf, NetBufFlags)> {
        if !self.cfg.fragmentation {
            crate::engine::dbg!("ip4: fragment dropped, reassembly disabled");
            self.stats.drop_too_big += 1;
            return None;
        }

        self.stats.frag_in += 1;
        let key = Ip4FragKey {
            ident: hdr.ident,
            proto: hdr.proto,
            src: hdr.src,
            dst: hdr.dst,
        };
        let frag = Fragment {
            offset: hdr.frag_offset_bytes(),
            more: hdr.more_frags(),
            data,
        };
        let meta = Ip4FragMeta { hdr, netif: id, flags };

        match self.ip4_reasm.insert(key, meta, frag) {
            Ok(None) => None,

            Ok(Some(done)) => {
                self.stats.reasm_ok += 1;
                let mut hdr = done.meta.hdr;
                let total = hdr.hdr_len() + done.data.len();
                hdr.total_len = u16::try_from(total).ok()?;
                hdr.flags.remove(Ipv4Flags::MORE_FRAGMENTS);
                hdr.frag_off = 0;
                hdr.compute_hdr_csum();
                Some((hdr, done.data, done.meta.flags))
            }

            Err(ReasmError::TooBig) => {
                crate::engine::dbg!("ip4: reassembly too big, ident {}", key.ident);
                self.stats.drop_too_big += 1;
                self.stats.reasm_fail += 1;
                None
            }

            Err(e) => {
                crate::engine::dbg!("ip4: reassembly failed: {}", e);
                self.stats.reasm_fail += 1;
                None
            }
        }
    }

    /// Choose the interface for `dst`.
    ///
    /// The first interface whose subnet holds `dst` wins, then the
    /// default interface. Destinations in 127/8, or equal to the
    /// chosen interface's own address, go to the loopback when it is
    /// enabled.
    pub fn ip4_route(&self, dst: Ipv4Addr) -> Option<NetifId> {
        if dst.is_loopback() {
            return self.loopback;
        }

        let chosen = self
            .netifs
            .iter()
            .find(|n| !n.is_loopback() && n.ip4_subnet_match(dst))
            .map(Netif::id)
            .or_else(|| self.default_netif())?;

        if self.ip4_is_own_on(chosen, dst) {
            if let Some(lo) = self.loopback {
                return Some(lo);
            }
        }

        Some(chosen)
    }

    fn ip4_is_own_on(&self, id: NetifId, addr: Ipv4Addr) -> bool {
        self.netif(id).is_some_and(|n| n.ip4_addr() == Some(addr))
    }

    /// Is `addr` assigned to any interface?
    pub fn ip4_is_own(&self, addr: Ipv4Addr) -> bool {
        self.netifs.iter().any(|n| n.ip4_addr() == Some(addr))
    }

    /// The MTU of the interface `dst` routes to.
    pub fn ip4_mtu(&self, dst: Ipv4Addr) -> Option<u16> {
        let id = self.ip4_route(dst)?;
        self.netif(id).map(Netif::mtu)
    }

    fn next_ip4_ident(&mut self) -> u16 {
        self.ip4_ident = self.ip4_ident.wrapping_add(1);
        self.ip4_ident
    }

    /// Send `pkt` (the upper-layer message) as one or more IPv4
    /// datagrams.
    ///
    /// Fragments leave in ascending offset order within this call.
    pub fn ip4_output(&mut self, out: &Ip4Out, mut pkt: NetBuf) -> Result<(), Error> {
        if out.dst.is_unspecified() {
            return Err(Error::DestAddrReq);
        }

        let mut id = match out.netif {
            Some(id) => id,
            None => self.ip4_route(out.dst).ok_or(Error::NetUnreach)?,
        };

        let netif = self.netif(id).ok_or(Error::NetUnreach)?;
        if netif.ip4_disabled() {
            return Err(Error::IpDisabled);
        }

        let src = match out.src {
            s if s.is_unspecified() => {
                netif.ip4_addr().unwrap_or(Ipv4Addr::ANY_ADDR)
            }
            s => s,
        };

        // A datagram for one of our own addresses never reaches the
        // wire.
        if !netif.is_loopback() && netif.ip4_addr() == Some(out.dst) {
            if let Some(lo) = self.loopback {
                id = lo;
            }
        }

        let payload_len = pkt.len();
        let total = Ipv4Hdr::BASE_SIZE + payload_len;
        if total > self.cfg.max_packet || total > usize::from(u16::MAX) {
            return Err(Error::MsgSize);
        }

        if let Some(fin) = out.csum {
            let pseudo = pseudo_v4(src, out.dst, out.proto, payload_len as u16);
            finish_csum(&mut pkt, fin, pseudo, out.proto)?;
        }

        let ttl = match out.ttl {
            0 if out.dst.is_multicast() => self.cfg.ip4_multicast_ttl,
            0 => self.cfg.ip4_default_ttl,
            ttl => ttl,
        };

        let mut hdr = Ipv4Hdr::new(src, out.dst, out.proto, ttl, payload_len as u16);
        hdr.tos = out.tos;
        hdr.ident = self.next_ip4_ident();
        if out.df {
            hdr.flags |= Ipv4Flags::DONT_FRAGMENT;
        }

        let fragmentation = self.cfg.fragmentation;
        let slot = id.slot().ok_or(Error::NetUnreach)?;
        let netif = self.netifs.get_mut(slot).ok_or(Error::NetUnreach)?;
        let mtu = usize::from(netif.mtu());
        let next_hop = if out.dont_route {
            out.dst
        } else {
            netif.ip4_next_hop(out.dst)
        };

        if total <= mtu {
            hdr.compute_hdr_csum();
            hdr.emit(pkt.prepend(Ipv4Hdr::BASE_SIZE)?);
            netif.driver_mut().output_ip4(next_hop, pkt)?;
            self.stats.tx_ip4 += 1;
            return Ok(());
        }

        if out.df || !fragmentation {
            return Err(Error::MsgSize);
        }

        let unit = ((mtu - Ipv4Hdr::BASE_SIZE) / 8) * 8;
        if unit < 8 {
            return Err(Error::MsgSize);
        }

        let mut off = 0;
        let mut rest = pkt;
        loop {
            let more = rest.len() > unit;
            let tail = if more { Some(rest.split_off(unit)?) } else { None };
            let mut piece = rest;

            hdr.total_len = (Ipv4Hdr::BASE_SIZE + piece.len()) as u16;
            hdr.frag_off = (off / 8) as u16;
            hdr.flags.set(Ipv4Flags::MORE_FRAGMENTS, more);
            hdr.compute_hdr_csum();
            hdr.emit(piece.prepend(Ipv4Hdr::BASE_SIZE)?);
            netif.driver_mut().output_ip4(next_hop, piece)?;
            self.stats.frag_out += 1;

            off += unit;
            match tail {
                Some(t) => rest = t,
                None => break,
            }
        }

        self.stats.tx_ip4 += 1;
        Ok(())
    }
}

/// Make the whole header contiguous and parse it.
fn pullup_ip4_hdr(pkt: &mut NetBuf) -> Result<Ipv4Hdr, Ipv4HdrError> {
    let len = pkt.len();
    let first = pkt
        .pullup(Ipv4Hdr::BASE_SIZE)
        .map_err(|_| Ipv4HdrError::TooShort { len })?;
    let hdr_len = usize::from(first[0] & IPV4_HDR_LEN_MASK) * 4;

    if hdr_len < Ipv4Hdr::BASE_SIZE {
        return Ipv4Hdr::parse(first);
    }

    let bytes = pkt.pullup(hdr_len).map_err(|_| {
        Ipv4HdrError::HeaderTruncated { hdr_len: hdr_len as u16 }
    })?;
    Ipv4Hdr::parse(bytes)
}

/// Copy the header and the start of the payload aside for ICMP.
pub(crate) fn ip4_quote(
    hdr: &Ipv4Hdr,
    payload: &NetBuf,
) -> Result<NetBuf, crate::sys::netbuf::NetBufError> {
    let n = payload.len().min(IP4_QUOTE_PAYLOAD);
    let mut quote = payload.copy_range(0, 0, n)?;
    let mut buf = [0u8; IPV4_HDR_MAX];
    hdr.emit(&mut buf);
    quote.prepend_bytes(&buf[..hdr.hdr_len()])?;
    Ok(quote)
}
