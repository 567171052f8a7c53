// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The Internet checksum.
//!
//! [`Checksum`] is a rolling one's complement sum; [`HeaderChecksum`]
//! is its finalised, complemented form as stored in a header.
//!
//! # Byte order
//!
//! The checksum is a pair of bytes, not a number. Each pair of bytes
//! being summed is read as a native-endian `u16` and the result is
//! written back native-endian, which leaves it in network order no
//! matter what the host is (RFC 1071 §1.B). Never byte-swap a
//! checksum value.
//!
//! # Relevant RFCs
//!
//! * 1071 Computing the Internet Checksum
//!
//! * 1624 Computation of the Internet Checksum via Incremental Update

use crate::sys::netbuf::NetBuf;
use fnet_api::Ipv4Addr;
use fnet_api::Ipv6Addr;

/// A finished checksum in the two bytes a header carries.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct HeaderChecksum {
    inner: [u8; 2],
}

impl HeaderChecksum {
    pub fn bytes(&self) -> [u8; 2] {
        self.inner
    }

    /// Wrap checksum bytes read out of a header.
    pub fn wrap(hc: [u8; 2]) -> Self {
        Self { inner: hc }
    }
}

impl From<Checksum> for HeaderChecksum {
    fn from(mut csum: Checksum) -> HeaderChecksum {
        Self { inner: (!csum.finalize()).to_ne_bytes() }
    }
}

/// A rolling one's complement checksum calculation.
///
/// Carries are accumulated in the upper half and only folded when the
/// sum is finalised.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Checksum {
    inner: u32,
}

impl Checksum {
    pub fn new() -> Self {
        Self::from(0)
    }

    /// The sum of `bytes`, open for further updates.
    pub fn compute(bytes: &[u8]) -> Self {
        Self { inner: sum_words(0, bytes, false) }
    }

    pub fn add_bytes(&mut self, bytes: &[u8]) {
        self.inner = sum_words(self.inner, bytes, false);
    }

    /// Take `bytes` back out of the sum (RFC 1624 eqn. 3).
    pub fn sub_bytes(&mut self, bytes: &[u8]) {
        self.inner = sum_words(self.inner, bytes, true);
    }

    /// Add `len` bytes of `nb` starting at `off`.
    ///
    /// Segment boundaries may fall on odd offsets; a dangling byte is
    /// paired with the first byte of the next segment so the result
    /// equals the sum over the flattened data.
    pub fn add_netbuf(&mut self, nb: &NetBuf, off: usize, len: usize) {
        let mut skip = off;
        let mut left = len;
        let mut carry: Option<u8> = None;

        for seg in nb.segs() {
            if left == 0 {
                break;
            }

            if skip >= seg.len() {
                skip -= seg.len();
                continue;
            }

            let mut data = &seg[skip..];
            skip = 0;
            if data.len() > left {
                data = &data[..left];
            }
            left -= data.len();

            if let Some(b) = carry.take() {
                match data.split_first() {
                    Some((&first, rest)) => {
                        self.add_bytes(&[b, first]);
                        data = rest;
                    }

                    None => {
                        carry = Some(b);
                        continue;
                    }
                }
            }

            let even = data.len() & !1;
            self.add_bytes(&data[..even]);
            if data.len() > even {
                carry = Some(data[even]);
            }
        }

        if let Some(b) = carry {
            self.add_bytes(&[b]);
        }
    }

    /// Sum an entire packet.
    pub fn of_netbuf(nb: &NetBuf) -> Self {
        let mut csum = Self::new();
        csum.add_netbuf(nb, 0, nb.len());
        csum
    }

    /// Fold the carries back in and return the 16-bit sum. The
    /// accumulator keeps the folded value.
    pub fn finalize(&mut self) -> u16 {
        while self.inner > 0xFFFF {
            self.inner = (self.inner >> 16) + (self.inner & 0xFFFF);
        }

        self.inner as u16
    }
}

impl From<HeaderChecksum> for Checksum {
    fn from(hc: HeaderChecksum) -> Self {
        Self { inner: u32::from(!u16::from_ne_bytes(hc.inner)) }
    }
}

impl From<u32> for Checksum {
    fn from(csum: u32) -> Self {
        Self { inner: csum }
    }
}

impl core::ops::Add for Checksum {
    type Output = Self;

    fn add(mut self, mut rhs: Self) -> Self {
        Self { inner: u32::from(self.finalize()) + u32::from(rhs.finalize()) }
    }
}

impl core::ops::AddAssign for Checksum {
    fn add_assign(&mut self, other: Self) {
        *self = *self + other;
    }
}

/// Does `bytes` (checksum field included) sum to all-ones?
pub fn verify(bytes: &[u8]) -> bool {
    Checksum::compute(bytes).finalize() == 0xFFFF
}

/// Does the packet (checksum field included) sum to all-ones once
/// `pseudo` is added?
pub fn verify_netbuf(nb: &NetBuf, pseudo: Checksum) -> bool {
    let mut csum = pseudo + Checksum::of_netbuf(nb);
    csum.finalize() == 0xFFFF
}

/// The IPv4 pseudo header used by transport checksums.
pub fn pseudo_v4(src: Ipv4Addr, dst: Ipv4Addr, proto: u8, len: u16) -> Checksum {
    let mut csum = Checksum::compute(&src.bytes());
    csum.add_bytes(&dst.bytes());
    csum.add_bytes(&[0, proto]);
    csum.add_bytes(&len.to_be_bytes());
    csum
}

/// The IPv6 pseudo header (RFC 8200 §8.1).
pub fn pseudo_v6(src: Ipv6Addr, dst: Ipv6Addr, len: u32, nh: u8) -> Checksum {
    let mut csum = Checksum::compute(&src.bytes());
    csum.add_bytes(&dst.bytes());
    csum.add_bytes(&len.to_be_bytes());
    csum.add_bytes(&[0, 0, 0, nh]);
    csum
}

/// Accumulate `bytes` as 16-bit words, each complemented first when
/// `negate` is set. Folds early so the upper half never overflows.
fn sum_words(mut csum: u32, bytes: &[u8], negate: bool) -> u32 {
    let word = |w: u16| u32::from(if negate { !w } else { w });
    let mut pairs = bytes.chunks_exact(2);

    for p in &mut pairs {
        csum += word(u16::from_ne_bytes([p[0], p[1]]));
        if csum >= 0x8000_0000 {
            csum = (csum >> 16) + (csum & 0xFFFF);
        }
    }

    // Pad an odd tail on the right.
    if let [b] = pairs.remainder() {
        csum += word(u16::from_ne_bytes([*b, 0]));
    }

    csum
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::sys::netbuf::NetBufPool;

    #[rustfmt::skip]
    const IP4_HDR: [u8; 20] = [
        0x45, 0x00, 0x00, 0x73, 0x00, 0x00, 0x40, 0x00,
        0x40, 0x11, 0xb8, 0x61, 0xc0, 0xa8, 0x00, 0x01,
        0xc0, 0xa8, 0x00, 0xc7,
    ];

    #[test]
    fn known_ipv4_header() {
        assert!(verify(&IP4_HDR));

        let mut zeroed = IP4_HDR;
        zeroed[10..12].fill(0);
        let hc = HeaderChecksum::from(Checksum::compute(&zeroed));
        assert_eq!(hc.bytes(), [0xb8, 0x61]);
    }

    #[test]
    fn round_trip_any_buffer() {
        for len in [2usize, 3, 10, 33, 64, 1499] {
            let mut buf: Vec<u8> =
                (0..len).map(|i| (i * 7 + 3) as u8).collect();
            buf[0..2].fill(0);
            let hc = HeaderChecksum::from(Checksum::compute(&buf));
            buf[0..2].copy_from_slice(&hc.bytes());
            assert!(verify(&buf), "len {len}");
        }
    }

    #[test]
    fn netbuf_odd_boundaries() {
        let data: Vec<u8> = (0u8..=40).collect();
        let pool = NetBufPool::new(1024);
        let mut nb = pool.empty();
        nb.extend_from_slice(&data[..3]).unwrap();
        nb.extend_from_slice(&data[3..4]).unwrap();
        nb.extend_from_slice(&data[4..17]).unwrap();
        nb.extend_from_slice(&data[17..]).unwrap();

        let mut flat = Checksum::compute(&data);
        let mut chained = Checksum::of_netbuf(&nb);
        assert_eq!(flat.finalize(), chained.finalize());

        let mut flat = Checksum::compute(&data[5..30]);
        let mut part = Checksum::new();
        part.add_netbuf(&nb, 5, 25);
        assert_eq!(flat.finalize(), part.finalize());
    }

    #[test]
    fn incremental_update() {
        let mut buf = IP4_HDR;
        let mut csum = Checksum::from(HeaderChecksum::wrap([0xb8, 0x61]));
        // Decrement TTL.
        csum.sub_bytes(&buf[8..10]);
        buf[8] -= 1;
        csum.add_bytes(&buf[8..10]);
        buf[10..12].copy_from_slice(&HeaderChecksum::from(csum).bytes());
        assert!(verify(&buf));
    }

    #[test]
    fn pseudo_headers() {
        let src = Ipv4Addr::from([10, 0, 0, 1]);
        let dst = Ipv4Addr::from([10, 0, 0, 2]);
        let mut a = pseudo_v4(src, dst, 17, 12);
        #[rustfmt::skip]
        let mut b = Checksum::compute(&[
            10, 0, 0, 1, 10, 0, 0, 2, 0, 17, 0, 12,
        ]);
        assert_eq!(a.finalize(), b.finalize());

        let mut c = pseudo_v6(Ipv6Addr::LOOPBACK, Ipv6Addr::LOOPBACK, 8, 58);
        let mut raw = [0u8; 40];
        raw[15] = 1;
        raw[31] = 1;
        raw[35] = 8;
        raw[39] = 58;
        assert_eq!(c.finalize(), Checksum::compute(&raw).finalize());
    }
}
