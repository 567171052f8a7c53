// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! RFC 3484 source address selection.

use crate::engine::netif::Ip6AddrState;
use crate::engine::netif::Ip6IfAddr;
use crate::engine::netif::NetifId;
use fnet_api::Ipv6Addr;

pub const SCOPE_IF_LOCAL: u8 = 0x1;
pub const SCOPE_LINK_LOCAL: u8 = 0x2;
pub const SCOPE_SITE_LOCAL: u8 = 0x5;
pub const SCOPE_GLOBAL: u8 = 0xE;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PolicyEntry {
    pub prefix: Ipv6Addr,
    pub prefix_len: u8,
    pub precedence: u8,
    pub label: u8,
}

/// The default policy table of RFC 3484 §2.1.
pub static POLICY_TABLE: [PolicyEntry; 5] = [
    PolicyEntry {
        prefix: Ipv6Addr::from_const([0, 0, 0, 0, 0, 0, 0, 1]),
        prefix_len: 128,
        precedence: 50,
        label: 0,
    },
    PolicyEntry {
        prefix: Ipv6Addr::ANY_ADDR,
        prefix_len: 0,
        precedence: 40,
        label: 1,
    },
    PolicyEntry {
        prefix: Ipv6Addr::from_const([0x2002, 0, 0, 0, 0, 0, 0, 0]),
        prefix_len: 16,
        precedence: 30,
        label: 2,
    },
    PolicyEntry {
        prefix: Ipv6Addr::ANY_ADDR,
        prefix_len: 96,
        precedence: 20,
        label: 3,
    },
    PolicyEntry {
        prefix: Ipv6Addr::from_const([0, 0, 0, 0, 0, 0xFFFF, 0, 0]),
        prefix_len: 96,
        precedence: 10,
        label: 4,
    },
];

/// The entry whose prefix is the longest match for `addr`.
pub fn policy_lookup(addr: &Ipv6Addr) -> &'static PolicyEntry {
    let mut best = &POLICY_TABLE[1];

    for e in POLICY_TABLE.iter() {
        if e.prefix_len > best.prefix_len
            && addr.has_prefix(&e.prefix, e.prefix_len)
        {
            best = e;
        }
    }

    best
}

/// The scope of `addr`, using the multicast scope field for multicast
/// addresses.
pub fn scope(addr: &Ipv6Addr) -> u8 {
    if let Some(s) = addr.multicast_scope() {
        return s;
    }

    if addr.is_loopback() || addr.is_link_local() {
        SCOPE_LINK_LOCAL
    } else if addr.is_site_local() {
        SCOPE_SITE_LOCAL
    } else {
        SCOPE_GLOBAL
    }
}

/// A source address candidate and the interface it belongs to.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Candidate {
    pub addr: Ip6IfAddr,
    pub netif: NetifId,
}

/// Should `a` be preferred over `b` as the source for `dst`?
///
/// Rules 1, 2, 3, 5, 6 and 8 of RFC 3484 §5, in order. Rules 4 (home
/// addresses) and 7 (temporary addresses) do not apply here.
fn prefer(a: &Candidate, b: &Candidate, dst: &Ipv6Addr, out: Option<NetifId>) -> bool {
    let (sa, sb) = (&a.addr, &b.addr);

    // Rule 1: the destination itself.
    if sa.addr == *dst {
        return true;
    }
    if sb.addr == *dst {
        return false;
    }

    // Rule 2: appropriate scope.
    let (sca, scb, scd) = (scope(&sa.addr), scope(&sb.addr), scope(dst));
    if sca < scb {
        return sca >= scd;
    }
    if scb < sca {
        return scb < scd;
    }

    // Rule 3: avoid deprecated addresses.
    let (da, db) = (
        sa.state == Ip6AddrState::Deprecated,
        sb.state == Ip6AddrState::Deprecated,
    );
    if da != db {
        return db;
    }

    // Rule 5: the outgoing interface.
    if let Some(o) = out {
        if (a.netif == o) != (b.netif == o) {
            return a.netif == o;
        }
    }

    // Rule 6: matching label.
    let ld = policy_lookup(dst).label;
    let (la, lb) = (policy_lookup(&sa.addr).label, policy_lookup(&sb.addr).label);
    if (la == ld) != (lb == ld) {
        return la == ld;
    }

    // Rule 8: longest matching prefix.
    sa.addr.common_prefix_len(dst) > sb.addr.common_prefix_len(dst)
}

/// Choose the best source address for `dst` among `cands`. Ties keep
/// the earlier candidate.
pub fn select_src_addr(
    cands: &[Candidate],
    out: Option<NetifId>,
    dst: Ipv6Addr,
) -> Option<Ipv6Addr> {
    let mut iter = cands.iter();
    let mut best = iter.next()?;

    for c in iter {
        if prefer(c, best, &dst, out) {
            best = c;
        }
    }

    Some(best.addr.addr)
}
