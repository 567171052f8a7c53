// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Common routines for integration tests.

// This type of pedantry is more trouble than it's worth here.
#![allow(dead_code)]

pub mod driver;
pub mod fixture;
pub mod logger;
pub mod pcap;
pub mod pkt;

// Let's make our lives easier and pub use a bunch of stuff.
pub use driver::MockDriver;
pub use fixture::*;
pub use fnet::api::AddrFamily;
pub use fnet::api::Error;
pub use fnet::api::Ipv4Addr;
pub use fnet::api::Ipv6Addr;
pub use fnet::api::PROTO_FRAGMENT;
pub use fnet::api::PROTO_HOPOPTS;
pub use fnet::api::PROTO_ICMP;
pub use fnet::api::PROTO_ICMPV6;
pub use fnet::api::PROTO_IGMP;
pub use fnet::api::PROTO_NONE;
pub use fnet::api::PROTO_UDP;
pub use fnet::api::ProtNotify;
pub use fnet::api::SockType;
pub use fnet::engine::NetifId;
pub use fnet::engine::Stack;
pub use fnet::engine::StackCfg;
pub use fnet::engine::ip::Ip4Out;
pub use fnet::engine::ip::Ip4Rx;
pub use fnet::engine::ip::Ip6Out;
pub use fnet::engine::ip::Ip6Rx;
pub use fnet::engine::netif::Ip6AddrState;
pub use fnet::engine::netif::Ip6IfAddr;
pub use fnet::engine::netif::NetifCfg;
pub use fnet::engine::prot::CtlMsg;
pub use fnet::engine::prot::ProtoHandler;
pub use fnet::sys::netbuf::NetBuf;
pub use fnet::sys::netbuf::NetBufFlags;
pub use pkt::*;
