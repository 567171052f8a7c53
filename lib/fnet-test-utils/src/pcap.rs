// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Routines for encoding packet captures.
//!
//! The stack hands its drivers bare IP datagrams, so captures use the
//! raw-IP link type.

use pcap_parser::Linktype;
use pcap_parser::ToVec;
use pcap_parser::pcap;
use pcap_parser::pcap::LegacyPcapBlock;
use pcap_parser::pcap::PcapHeader;

fn header() -> PcapHeader {
    PcapHeader {
        magic_number: 0xa1b2c3d4,
        version_major: 2,
        version_minor: 4,
        thiszone: 0,
        sigfigs: 0,
        snaplen: 65535,
        network: Linktype::RAW,
    }
}

fn block(bytes: &[u8], idx: u32) -> Vec<u8> {
    let mut block = LegacyPcapBlock {
        ts_sec: 7777,
        ts_usec: idx,
        caplen: bytes.len() as u32,
        origlen: bytes.len() as u32,
        data: bytes,
    };

    block.to_vec().unwrap()
}

/// Encode a whole capture in memory.
pub fn capture_bytes<'a>(pkts: impl IntoIterator<Item = &'a [u8]>) -> Vec<u8> {
    let mut out = header().to_vec().unwrap();
    for (i, p) in pkts.into_iter().enumerate() {
        out.extend_from_slice(&block(p, i as u32));
    }
    out
}

/// Split a capture back into its datagrams.
pub fn read_capture(mut bytes: &[u8]) -> Vec<Vec<u8>> {
    let (rest, hdr) = match pcap::parse_pcap_header(bytes) {
        Ok(v) => v,
        Err(e) => panic!("failed to get header: {e:?}"),
    };
    assert_eq!(hdr.network, Linktype::RAW);
    bytes = rest;

    let mut out = Vec::new();
    while !bytes.is_empty() {
        match pcap::parse_pcap_frame(bytes) {
            Ok((rest, block)) => {
                // We always want access to the entire packet.
                assert_eq!(block.origlen, block.caplen);
                out.push(block.data.to_vec());
                bytes = rest;
            }

            Err(e) => panic!("failed to get next block: {e:?}"),
        }
    }

    out
}
