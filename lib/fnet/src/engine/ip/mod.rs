// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! IPv4 and IPv6.

pub mod addrsel;
pub mod ext;
pub mod v4;
pub mod v6;

use super::checksum::Checksum;
use super::checksum::HeaderChecksum;
use super::netif::NetifId;
use crate::sys::netbuf::NetBuf;
use crate::sys::netbuf::NetBufFlags;
use fnet_api::Error;
use fnet_api::Ipv4Addr;
use fnet_api::Ipv6Addr;
use fnet_api::PROTO_UDP;

pub use v4::Ip4Out;
pub use v4::Ipv4Hdr;
pub use v6::FragHdr;
pub use v6::Ip6Out;
pub use v6::Ipv6Hdr;

/// Bytes reserved in front of locally generated packets so that the
/// IP and link headers can be prepended in place.
pub const IP_HEADROOM: usize = 64;

/// Finish an upper-layer checksum on output.
///
/// The caller stores the one's complement sum of its message (with the
/// checksum field zeroed) in the checksum field at `offset`, as
/// produced by [`prepare_csum()`]. The output path adds the pseudo
/// header, which only it can build, and stores the complement.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct CsumFinish {
    pub offset: usize,
}

/// Store the partial checksum of `pkt` in the 2-byte field at
/// `offset`, ready for [`CsumFinish`].
pub fn prepare_csum(pkt: &mut NetBuf, offset: usize) -> Result<(), Error> {
    pkt.copy_in(offset, &[0, 0])?;
    let partial = Checksum::of_netbuf(pkt).finalize();
    pkt.copy_in(offset, &partial.to_ne_bytes())?;
    Ok(())
}

pub(crate) fn finish_csum(
    pkt: &mut NetBuf,
    fin: CsumFinish,
    pseudo: Checksum,
    proto: u8,
) -> Result<(), Error> {
    let mut field = [0u8; 2];
    pkt.copy_out(fin.offset, &mut field)?;
    let partial = Checksum::from(u32::from(u16::from_ne_bytes(field)));
    let mut csum = HeaderChecksum::from(partial + pseudo).bytes();

    // In UDP an all-zero field means "no checksum".
    if proto == PROTO_UDP && csum == [0, 0] {
        csum = [0xFF, 0xFF];
    }

    pkt.copy_in(fin.offset, &csum)?;
    Ok(())
}

/// What the IPv4 layer tells an upper-layer protocol about a received
/// datagram.
#[derive(Debug)]
pub struct Ip4Rx {
    pub netif: NetifId,
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub proto: u8,
    pub tos: u8,
    pub ttl: u8,
    /// Link-layer flags, plus BROADCAST/MULTICAST for IP-level
    /// broadcast and multicast destinations.
    pub flags: NetBufFlags,
    /// The IP header and up to 8 bytes of payload, for quoting in an
    /// ICMP error.
    pub quote: NetBuf,
}

/// What the IPv6 layer tells an upper-layer protocol about a received
/// packet.
#[derive(Debug)]
pub struct Ip6Rx {
    pub netif: NetifId,
    pub src: Ipv6Addr,
    pub dst: Ipv6Addr,
    pub nh: u8,
    pub hop_limit: u8,
    pub traffic_class: u8,
    pub flags: NetBufFlags,
    /// Offset, in `quote`, of the Next Header field naming this
    /// protocol.
    pub nh_offset: usize,
    /// The packet as received, headers included, cut to what fits in
    /// an ICMPv6 error.
    pub quote: NetBuf,
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::engine::checksum::pseudo_v4;
    use crate::engine::checksum::verify_netbuf;
    use crate::sys::netbuf::NetBufPool;

    #[test]
    fn prepare_then_finish() {
        let pool = NetBufPool::new(1024);
        let src = Ipv4Addr::from([192, 168, 1, 1]);
        let dst = Ipv4Addr::from([192, 168, 1, 2]);

        // A UDP header and 5 bytes of data, split over two segments.
        let mut pkt = pool.from_slice(&[0x04, 0xD2, 0x00, 0x35, 0, 13]).unwrap();
        pkt.extend_from_slice(&[0, 0, b'h', b'e', b'l', b'l', b'o']).unwrap();

        prepare_csum(&mut pkt, 6).unwrap();
        let pseudo = pseudo_v4(src, dst, PROTO_UDP, 13);
        finish_csum(&mut pkt, CsumFinish { offset: 6 }, pseudo, PROTO_UDP)
            .unwrap();

        assert!(verify_netbuf(&pkt, pseudo_v4(src, dst, PROTO_UDP, 13)));
        assert_ne!(&pkt.to_vec()[6..8], &[0, 0]);
    }
}
