// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! IP addresses and protocol numbers.
//!
//! Both address types are plain network-order byte arrays. They
//! serialize as their text form, so a configuration file can say
//! `ip4_addr = "192.168.1.10"`.

use core::fmt;
use core::marker::PhantomData;
use core::str::FromStr;
use serde::Deserialize;
use serde::Deserializer;
use serde::Serialize;
use serde::Serializer;
use serde::de;

pub const PROTO_HOPOPTS: u8 = 0;
pub const PROTO_ICMP: u8 = 1;
pub const PROTO_IGMP: u8 = 2;
pub const PROTO_TCP: u8 = 6;
pub const PROTO_UDP: u8 = 17;
pub const PROTO_ROUTING: u8 = 43;
pub const PROTO_FRAGMENT: u8 = 44;
pub const PROTO_ICMPV6: u8 = 58;
pub const PROTO_NONE: u8 = 59;
pub const PROTO_DSTOPTS: u8 = 60;

/// A short name for `proto`, for logs and tables.
pub fn proto_name(proto: u8) -> &'static str {
    match proto {
        PROTO_HOPOPTS => "hopopts",
        PROTO_ICMP => "icmp",
        PROTO_IGMP => "igmp",
        PROTO_TCP => "tcp",
        PROTO_UDP => "udp",
        PROTO_ROUTING => "routing",
        PROTO_FRAGMENT => "fragment",
        PROTO_ICMPV6 => "icmpv6",
        PROTO_NONE => "none",
        PROTO_DSTOPTS => "dstopts",
        _ => "other",
    }
}

/// The text did not hold an address of the expected family.
#[derive(Clone, Copy, Debug, Eq, PartialEq, thiserror::Error)]
#[error("invalid {family} address")]
pub struct AddrParseError {
    family: &'static str,
}

/// An address of either family, as carried in control notifications.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum IpAddr {
    Ip4(Ipv4Addr),
    Ip6(Ipv6Addr),
}

impl IpAddr {
    pub const fn is_multicast(&self) -> bool {
        match self {
            Self::Ip4(a) => a.is_multicast(),
            Self::Ip6(a) => a.is_multicast(),
        }
    }
}

impl From<Ipv4Addr> for IpAddr {
    fn from(a: Ipv4Addr) -> Self {
        Self::Ip4(a)
    }
}

impl From<Ipv6Addr> for IpAddr {
    fn from(a: Ipv6Addr) -> Self {
        Self::Ip6(a)
    }
}

impl fmt::Display for IpAddr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Ip4(a) => write!(f, "{a}"),
            Self::Ip6(a) => write!(f, "{a}"),
        }
    }
}

impl FromStr for IpAddr {
    type Err = AddrParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.contains(':') {
            s.parse().map(Self::Ip6)
        } else {
            s.parse().map(Self::Ip4)
        }
    }
}

/// An IPv4 address.
#[derive(Clone, Copy, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[repr(transparent)]
pub struct Ipv4Addr {
    inner: [u8; 4],
}

impl Ipv4Addr {
    pub const ANY_ADDR: Self = Self::from_const([0, 0, 0, 0]);
    pub const LOCAL_BCAST: Self = Self::from_const([255, 255, 255, 255]);
    pub const LOOPBACK: Self = Self::from_const([127, 0, 0, 1]);
    /// 224.0.0.1, joined by every multicast-capable host.
    pub const ALL_HOSTS: Self = Self::from_const([224, 0, 0, 1]);
    /// 224.0.0.2, the destination of IGMPv2 leaves.
    pub const ALL_ROUTERS: Self = Self::from_const([224, 0, 0, 2]);

    pub const fn from_const(octets: [u8; 4]) -> Self {
        Self { inner: octets }
    }

    pub const fn bytes(&self) -> [u8; 4] {
        self.inner
    }

    const fn bits(&self) -> u32 {
        u32::from_be_bytes(self.inner)
    }

    /// The address with every bit outside `mask` cleared.
    pub const fn masked(&self, mask: Ipv4Addr) -> Self {
        Self { inner: (self.bits() & mask.bits()).to_be_bytes() }
    }

    /// Do `self` and `other` share the network selected by `mask`?
    pub const fn same_subnet(&self, other: Ipv4Addr, mask: Ipv4Addr) -> bool {
        self.bits() & mask.bits() == other.bits() & mask.bits()
    }

    /// The broadcast address of the subnet `self` is on.
    pub const fn directed_broadcast(&self, mask: Ipv4Addr) -> Self {
        Self { inner: (self.bits() | !mask.bits()).to_be_bytes() }
    }

    /// The number of leading one bits, when `self` is used as a
    /// netmask.
    pub const fn netmask_len(&self) -> u32 {
        self.bits().leading_ones()
    }

    pub const fn is_multicast(&self) -> bool {
        self.inner[0] >> 4 == 0xE
    }

    pub const fn is_loopback(&self) -> bool {
        self.inner[0] == 127
    }

    pub const fn is_unspecified(&self) -> bool {
        self.bits() == 0
    }

    pub const fn is_limited_broadcast(&self) -> bool {
        self.bits() == u32::MAX
    }

    /// In 240.0.0.0/4 but not the limited broadcast address.
    pub const fn is_reserved(&self) -> bool {
        self.inner[0] >= 240 && !self.is_limited_broadcast()
    }
}

impl From<[u8; 4]> for Ipv4Addr {
    fn from(octets: [u8; 4]) -> Self {
        Self::from_const(octets)
    }
}

impl From<Ipv4Addr> for [u8; 4] {
    fn from(a: Ipv4Addr) -> Self {
        a.inner
    }
}

impl From<u32> for Ipv4Addr {
    fn from(bits: u32) -> Self {
        Self::from_const(bits.to_be_bytes())
    }
}

impl From<Ipv4Addr> for u32 {
    fn from(a: Ipv4Addr) -> Self {
        a.bits()
    }
}

impl From<core::net::Ipv4Addr> for Ipv4Addr {
    fn from(a: core::net::Ipv4Addr) -> Self {
        Self::from_const(a.octets())
    }
}

impl From<Ipv4Addr> for core::net::Ipv4Addr {
    fn from(a: Ipv4Addr) -> Self {
        Self::from(a.inner)
    }
}

impl From<smoltcp::wire::Ipv4Address> for Ipv4Addr {
    fn from(a: smoltcp::wire::Ipv4Address) -> Self {
        Self::from_const(a.0)
    }
}

impl From<Ipv4Addr> for smoltcp::wire::Ipv4Address {
    fn from(a: Ipv4Addr) -> Self {
        Self(a.inner)
    }
}

impl FromStr for Ipv4Addr {
    type Err = AddrParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<core::net::Ipv4Addr>()
            .map(Self::from)
            .map_err(|_| AddrParseError { family: "IPv4" })
    }
}

impl fmt::Display for Ipv4Addr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let [a, b, c, d] = self.inner;
        write!(f, "{a}.{b}.{c}.{d}")
    }
}

impl fmt::Debug for Ipv4Addr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// An IPv6 address.
#[derive(Clone, Copy, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[repr(transparent)]
pub struct Ipv6Addr {
    inner: [u8; 16],
}

impl Ipv6Addr {
    pub const ANY_ADDR: Self = Self { inner: [0; 16] };
    pub const LOOPBACK: Self = Self::from_const([0, 0, 0, 0, 0, 0, 0, 1]);
    /// ff01::1
    pub const ALL_NODES_IF_LOCAL: Self =
        Self::from_const([0xff01, 0, 0, 0, 0, 0, 0, 1]);
    /// ff02::1
    pub const ALL_NODES: Self = Self::from_const([0xff02, 0, 0, 0, 0, 0, 0, 1]);
    /// ff02::2
    pub const ALL_ROUTERS: Self =
        Self::from_const([0xff02, 0, 0, 0, 0, 0, 0, 2]);

    /// Build an address from its eight 16-bit groups.
    pub const fn from_const(groups: [u16; 8]) -> Self {
        let mut inner = [0u8; 16];
        let mut i = 0;
        while i < 8 {
            let [hi, lo] = groups[i].to_be_bytes();
            inner[2 * i] = hi;
            inner[2 * i + 1] = lo;
            i += 1;
        }
        Self { inner }
    }

    pub const fn bytes(&self) -> [u8; 16] {
        self.inner
    }

    const fn bits(&self) -> u128 {
        u128::from_be_bytes(self.inner)
    }

    /// The solicited-node group for `self`: ff02::1:ff00:0/104 plus
    /// the low 24 bits of the address (RFC 4291, 2.7.1).
    pub const fn solicited_node_multicast(&self) -> Self {
        let mut inner = Self::from_const([0xff02, 0, 0, 0, 0, 1, 0xff00, 0]).inner;
        inner[13] = self.inner[13];
        inner[14] = self.inner[14];
        inner[15] = self.inner[15];
        Self { inner }
    }

    pub const fn is_multicast(&self) -> bool {
        self.inner[0] == 0xff
    }

    pub const fn is_unspecified(&self) -> bool {
        self.bits() == 0
    }

    pub const fn is_loopback(&self) -> bool {
        self.bits() == 1
    }

    /// fe80::/10
    pub const fn is_link_local(&self) -> bool {
        self.inner[0] == 0xfe && self.inner[1] & 0xc0 == 0x80
    }

    /// fec0::/10. Deprecated as an address block, but still a scope
    /// for source selection.
    pub const fn is_site_local(&self) -> bool {
        self.inner[0] == 0xfe && self.inner[1] & 0xc0 == 0xc0
    }

    /// The 4-bit scope field of a multicast address.
    pub const fn multicast_scope(&self) -> Option<u8> {
        if self.is_multicast() { Some(self.inner[1] & 0x0f) } else { None }
    }

    /// How many leading bits `self` and `other` share.
    pub const fn common_prefix_len(&self, other: &Ipv6Addr) -> u8 {
        (self.bits() ^ other.bits()).leading_zeros() as u8
    }

    /// Is `self` within `prefix/len`?
    pub const fn has_prefix(&self, prefix: &Ipv6Addr, len: u8) -> bool {
        self.common_prefix_len(prefix) >= len
    }
}

impl From<[u8; 16]> for Ipv6Addr {
    fn from(inner: [u8; 16]) -> Self {
        Self { inner }
    }
}

impl From<[u16; 8]> for Ipv6Addr {
    fn from(groups: [u16; 8]) -> Self {
        Self::from_const(groups)
    }
}

impl From<u128> for Ipv6Addr {
    fn from(bits: u128) -> Self {
        Self { inner: bits.to_be_bytes() }
    }
}

impl From<Ipv6Addr> for u128 {
    fn from(a: Ipv6Addr) -> Self {
        a.bits()
    }
}

impl From<core::net::Ipv6Addr> for Ipv6Addr {
    fn from(a: core::net::Ipv6Addr) -> Self {
        Self { inner: a.octets() }
    }
}

impl From<Ipv6Addr> for core::net::Ipv6Addr {
    fn from(a: Ipv6Addr) -> Self {
        Self::from(a.inner)
    }
}

impl From<smoltcp::wire::Ipv6Address> for Ipv6Addr {
    fn from(a: smoltcp::wire::Ipv6Address) -> Self {
        Self { inner: a.0 }
    }
}

impl From<Ipv6Addr> for smoltcp::wire::Ipv6Address {
    fn from(a: Ipv6Addr) -> Self {
        Self(a.inner)
    }
}

impl FromStr for Ipv6Addr {
    type Err = AddrParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<core::net::Ipv6Addr>()
            .map(Self::from)
            .map_err(|_| AddrParseError { family: "IPv6" })
    }
}

impl fmt::Display for Ipv6Addr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", core::net::Ipv6Addr::from(self.inner))
    }
}

impl fmt::Debug for Ipv6Addr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

macro_rules! serde_as_text {
    ($ty:ty) => {
        impl Serialize for $ty {
            fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
                s.collect_str(self)
            }
        }

        impl<'de> Deserialize<'de> for $ty {
            fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
                d.deserialize_str(TextVisitor(PhantomData))
            }
        }
    };
}

serde_as_text!(Ipv4Addr);
serde_as_text!(Ipv6Addr);

struct TextVisitor<T>(PhantomData<T>);

impl<T> de::Visitor<'_> for TextVisitor<T>
where
    T: FromStr<Err = AddrParseError>,
{
    type Value = T;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "an IP address in text form")
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<T, E> {
        v.parse().map_err(E::custom)
    }
}
