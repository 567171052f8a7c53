// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The FNET IP core.
//!
//! An IPv4/IPv6 datagram engine for small targets: a netbuf pool, an
//! interrupt-safe input queue drained from a deferred context,
//! reassembly and fragmentation, routing over a flat interface list,
//! RFC 3484 source address selection, an IPv6 extension header
//! pipeline, and dispatch to upper-layer protocols through a
//! registry. ICMP, ICMPv6 and IGMP are built in; everything above
//! them plugs in as a [`engine::prot::ProtoHandler`].
//!
//! All state lives in a [`engine::stack::Stack`]; there are no
//! globals, so several stacks may coexist (which the tests rely on).

#![cfg_attr(not(feature = "std"), no_std)]
#![allow(clippy::len_without_is_empty)]
#![deny(unreachable_patterns)]
#![deny(unused_must_use)]

#[macro_use]
extern crate alloc;

#[macro_use]
extern crate cfg_if;

// This is needed so that the stat-macro (`#[derive(StatProvider)]`)
// can use fully-qualified type paths.
extern crate self as fnet;

pub use fnet_api as api;

pub mod engine;
#[cfg(any(feature = "std", test))]
pub mod print;
pub mod sys;
