// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The IPv6 extension header pipeline.
//!
//! [`process()`] looks up the handler for the current Next Header
//! value and runs it, over and over, until a handler stops the packet
//! or the value names something that is not an extension header, at
//! which point the packet goes to transport dispatch. Each handler
//! either consumes its header and moves the context past it
//! ([`ExtAction::Continue`]), or disposes of the packet, sending any
//! ICMPv6 error itself ([`ExtAction::Stop`]).

use super::v6::FragHdr;
use super::v6::IPV6_NEXT_HDR_OFF;
use super::v6::IPV6_PAYLOAD_LEN_OFF;
use super::v6::Ip6FragKey;
use super::v6::Ip6FragMeta;
use super::v6::Ipv6Hdr;
use crate::engine::icmp::v6::Icmp6Err;
use crate::engine::icmp::v6::icmp6_error;
use crate::engine::netif::NetifId;
use crate::engine::reasm::Fragment;
use crate::engine::stack::Stack;
use crate::sys::netbuf::NetBuf;
use crate::sys::netbuf::NetBufFlags;
use fnet_api::PROTO_DSTOPTS;
use fnet_api::PROTO_FRAGMENT;
use fnet_api::PROTO_HOPOPTS;
use fnet_api::PROTO_NONE;
use fnet_api::PROTO_ROUTING;

/// The most extension headers walked for one packet.
pub const EXT_HDR_MAX: usize = 16;

pub const OPT_PAD1: u8 = 0x00;
pub const OPT_PADN: u8 = 0x01;
pub const OPT_ROUTER_ALERT: u8 = 0x05;

/// Parameter Problem codes.
pub const PARAM_ERR_HDR_FIELD: u8 = 0;
pub const PARAM_UNRECOGNIZED_NH: u8 = 1;
pub const PARAM_UNRECOGNIZED_OPT: u8 = 2;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ExtAction {
    Continue,
    Stop,
    Transport,
}

/// A packet moving through the pipeline.
///
/// `pkt` holds the whole packet from the fixed header on. `off` is the
/// start of the header named by `nh`, and `nh_off` the offset of the
/// byte holding `nh`, which is where a Parameter Problem points if
/// nobody recognizes it.
#[derive(Debug)]
pub struct ExtCtx {
    pub netif: NetifId,
    pub flags: NetBufFlags,
    pub hdr: Ipv6Hdr,
    pub pkt: NetBuf,
    pub off: usize,
    pub nh: u8,
    pub nh_off: usize,
    /// No extension header has been consumed yet.
    pub first: bool,
}

impl ExtCtx {
    pub fn new(
        netif: NetifId,
        flags: NetBufFlags,
        hdr: Ipv6Hdr,
        pkt: NetBuf,
    ) -> Self {
        Self {
            netif,
            flags,
            nh: hdr.next_hdr,
            hdr,
            pkt,
            off: Ipv6Hdr::SIZE,
            nh_off: IPV6_NEXT_HDR_OFF,
            first: true,
        }
    }

    /// Step over the `len`-byte header at `off`.
    fn advance(&mut self, len: usize) -> ExtAction {
        let Some(nh) = self.pkt.byte_at(self.off) else {
            return ExtAction::Stop;
        };

        self.nh_off = self.off;
        self.nh = nh;
        self.off += len;
        self.first = false;
        ExtAction::Continue
    }

    /// The length of an options or routing header at `off`, if the
    /// packet holds all of it.
    fn ext_len(&self) -> Option<usize> {
        let words = self.pkt.byte_at(self.off + 1)?;
        let len = (usize::from(words) + 1) * 8;
        (self.off + len <= self.pkt.len()).then_some(len)
    }
}

type ExtHandler = fn(&mut Stack, &mut ExtCtx) -> ExtAction;

static EXT_HANDLERS: [(u8, ExtHandler); 5] = [
    (PROTO_HOPOPTS, hop_by_hop),
    (PROTO_DSTOPTS, dst_opts),
    (PROTO_ROUTING, routing),
    (PROTO_FRAGMENT, fragment),
    (PROTO_NONE, no_next),
];

fn handler_for(nh: u8) -> Option<ExtHandler> {
    EXT_HANDLERS.iter().find(|(n, _)| *n == nh).map(|(_, h)| *h)
}

/// Is `nh` one of the extension headers the pipeline knows?
pub fn is_ext_hdr(nh: u8) -> bool {
    handler_for(nh).is_some()
}

/// Run the pipeline over `ctx` until the packet is stopped or reaches
/// its upper-layer header.
pub fn process(stack: &mut Stack, ctx: &mut ExtCtx) -> ExtAction {
    for _ in 0..EXT_HDR_MAX {
        let Some(handler) = handler_for(ctx.nh) else {
            return ExtAction::Transport;
        };

        match handler(stack, ctx) {
            ExtAction::Continue => {}
            action => return action,
        }
    }

    crate::engine::dbg!("ip6: too many extension headers");
    stack.stats.drop_ext_hdr += 1;
    ExtAction::Stop
}

fn malformed(stack: &mut Stack, what: &str) -> ExtAction {
    crate::engine::dbg!("ip6: malformed {} header", what);
    stack.stats.drop_ext_hdr += 1;
    ExtAction::Stop
}

fn param_problem(
    stack: &mut Stack,
    ctx: &ExtCtx,
    code: u8,
    pointer: usize,
) -> ExtAction {
    stack.stats.drop_ext_hdr += 1;
    let err = Icmp6Err::ParamProblem { code, pointer: pointer as u32 };
    icmp6_error(stack, ctx.netif, ctx.flags, &ctx.pkt, err);
    ExtAction::Stop
}

fn hop_by_hop(stack: &mut Stack, ctx: &mut ExtCtx) -> ExtAction {
    if !ctx.first {
        crate::engine::dbg!("ip6: hop-by-hop options after another header");
        return param_problem(stack, ctx, PARAM_UNRECOGNIZED_NH, ctx.nh_off);
    }

    options(stack, ctx)
}

fn dst_opts(stack: &mut Stack, ctx: &mut ExtCtx) -> ExtAction {
    options(stack, ctx)
}

/// Walk the TLV options of a Hop-by-Hop or Destination Options header.
///
/// The two high bits of an unrecognized option's type say what to do:
/// 00 skip it, 01 drop silently, 10 drop and send a Parameter Problem,
/// 11 the same but only when the destination is not multicast.
fn options(stack: &mut Stack, ctx: &mut ExtCtx) -> ExtAction {
    let Some(len) = ctx.ext_len() else {
        return malformed(stack, "options");
    };

    let end = ctx.off + len;
    let mut pos = ctx.off + 2;

    while pos < end {
        let Some(typ) = ctx.pkt.byte_at(pos) else {
            return malformed(stack, "options");
        };

        if typ == OPT_PAD1 {
            pos += 1;
            continue;
        }

        let Some(olen) = ctx.pkt.byte_at(pos + 1) else {
            return malformed(stack, "options");
        };
        let next = pos + 2 + usize::from(olen);
        if next > end {
            return malformed(stack, "options");
        }

        if typ != OPT_PADN && typ != OPT_ROUTER_ALERT {
            match typ >> 6 {
                0b00 => {}

                0b01 => {
                    crate::engine::dbg!("ip6: unknown option {:#x}, dropped", typ);
                    stack.stats.drop_ext_hdr += 1;
                    return ExtAction::Stop;
                }

                0b10 => {
                    return param_problem(
                        stack,
                        ctx,
                        PARAM_UNRECOGNIZED_OPT,
                        pos,
                    );
                }

                _ => {
                    if ctx.hdr.dst.is_multicast() {
                        stack.stats.drop_ext_hdr += 1;
                        return ExtAction::Stop;
                    }
                    return param_problem(
                        stack,
                        ctx,
                        PARAM_UNRECOGNIZED_OPT,
                        pos,
                    );
                }
            }
        }

        pos = next;
    }

    ctx.advance(len)
}

/// Hosts only accept a Routing header with no segments left.
fn routing(stack: &mut Stack, ctx: &mut ExtCtx) -> ExtAction {
    let Some(len) = ctx.ext_len() else {
        return malformed(stack, "routing");
    };

    match ctx.pkt.byte_at(ctx.off + 3) {
        Some(0) => ctx.advance(len),
        Some(_) => {
            param_problem(stack, ctx, PARAM_ERR_HDR_FIELD, ctx.off + 2)
        }
        None => malformed(stack, "routing"),
    }
}

fn fragment(stack: &mut Stack, ctx: &mut ExtCtx) -> ExtAction {
    let mut bytes = [0u8; FragHdr::SIZE];
    if ctx.pkt.copy_out(ctx.off, &mut bytes).is_err() {
        return malformed(stack, "fragment");
    }
    let Ok(fh) = FragHdr::parse(&bytes) else {
        return malformed(stack, "fragment");
    };

    let data_off = ctx.off + FragHdr::SIZE;
    let data_len = ctx.pkt.len() - data_off;

    if fh.more && data_len % 8 != 0 {
        crate::engine::dbg!("ip6: fragment length {} not a multiple of 8", data_len);
        return param_problem(
            stack,
            ctx,
            PARAM_ERR_HDR_FIELD,
            IPV6_PAYLOAD_LEN_OFF,
        );
    }

    if fh.offset_bytes() + data_len > usize::from(u16::MAX) {
        return param_problem(stack, ctx, PARAM_ERR_HDR_FIELD, ctx.off + 2);
    }

    // An atomic fragment is a whole packet.
    if !fh.more && fh.frag_off == 0 {
        return ctx.advance(FragHdr::SIZE);
    }

    if !stack.cfg.fragmentation {
        crate::engine::dbg!("ip6: fragment dropped, reassembly disabled");
        stack.stats.drop_too_big += 1;
        return ExtAction::Stop;
    }

    stack.stats.frag_in += 1;
    let mut data = core::mem::replace(&mut ctx.pkt, stack.pool.empty());
    if data.trim_front(data_off).is_err() {
        return malformed(stack, "fragment");
    }

    let key = Ip6FragKey {
        ident: fh.ident,
        nh: fh.next_hdr,
        src: ctx.hdr.src,
        dst: ctx.hdr.dst,
    };
    let meta = Ip6FragMeta {
        hdr: ctx.hdr.clone(),
        netif: ctx.netif,
        flags: ctx.flags,
    };
    let frag = Fragment { offset: fh.offset_bytes(), more: fh.more, data };

    let done = match stack.ip6_reasm.insert(key, meta, frag) {
        Ok(Some(done)) => done,
        Ok(None) => return ExtAction::Stop,
        Err(e) => {
            crate::engine::dbg!("ip6: reassembly failed: {}", e);
            stack.stats.reasm_fail += 1;
            return ExtAction::Stop;
        }
    };

    stack.stats.reasm_ok += 1;
    let mut hdr = done.meta.hdr;
    let mut pkt = done.data;
    hdr.next_hdr = key.nh;
    hdr.payload_len = pkt.len() as u16;
    match pkt.prepend(Ipv6Hdr::SIZE) {
        Ok(bytes) => hdr.emit(bytes),
        Err(_) => {
            stack.stats.drop_nomem += 1;
            return ExtAction::Stop;
        }
    }

    ctx.flags = done.meta.flags;
    ctx.hdr = hdr;
    ctx.pkt = pkt;
    ctx.off = Ipv6Hdr::SIZE;
    ctx.nh = key.nh;
    ctx.nh_off = IPV6_NEXT_HDR_OFF;
    ctx.first = false;
    ExtAction::Continue
}

fn no_next(_stack: &mut Stack, _ctx: &mut ExtCtx) -> ExtAction {
    ExtAction::Stop
}

/// Find the upper-layer protocol and its offset in a raw IPv6 packet,
/// such as the one quoted in an ICMPv6 error. Non-first fragments have
/// no upper-layer header.
pub fn upper_layer(pkt: &[u8]) -> Option<(u8, usize)> {
    let mut nh = *pkt.get(IPV6_NEXT_HDR_OFF)?;
    let mut off = Ipv6Hdr::SIZE;

    for _ in 0..EXT_HDR_MAX {
        match nh {
            PROTO_HOPOPTS | PROTO_DSTOPTS | PROTO_ROUTING => {
                let len = (usize::from(*pkt.get(off + 1)?) + 1) * 8;
                nh = *pkt.get(off)?;
                off += len;
            }

            PROTO_FRAGMENT => {
                let fh = FragHdr::parse(pkt.get(off..)?).ok()?;
                if fh.frag_off != 0 {
                    return None;
                }
                nh = fh.next_hdr;
                off += FragHdr::SIZE;
            }

            PROTO_NONE => return None,

            _ => return Some((nh, off)),
        }
    }

    None
}

#[cfg(test)]
mod test {
    use super::*;
    use fnet_api::PROTO_UDP;

    #[test]
    fn handler_table() {
        for nh in [0, 43, 44, 59, 60] {
            assert!(is_ext_hdr(nh), "{nh}");
        }
        for nh in [6, 17, 58] {
            assert!(!is_ext_hdr(nh), "{nh}");
        }
    }

    #[test]
    fn upper_layer_walks_chain() {
        let mut pkt = vec![0u8; 40];
        pkt[0] = 0x60;
        pkt[6] = PROTO_HOPOPTS;
        // Hop-by-Hop, 8 bytes, PadN.
        pkt.extend_from_slice(&[PROTO_DSTOPTS, 0, 1, 4, 0, 0, 0, 0]);
        // Destination Options, 16 bytes.
        pkt.extend_from_slice(&[PROTO_FRAGMENT, 1, 1, 12]);
        pkt.extend_from_slice(&[0; 12]);
        // First fragment.
        pkt.extend_from_slice(&[PROTO_UDP, 0, 0, 1, 0, 0, 0, 9]);
        pkt.extend_from_slice(&[0; 8]);

        assert_eq!(upper_layer(&pkt), Some((PROTO_UDP, 72)));

        // Not the first fragment.
        pkt[66] = 0x01;
        assert_eq!(upper_layer(&pkt), None);

        // Truncated.
        assert_eq!(upper_layer(&pkt[..44]), None);
    }
}
