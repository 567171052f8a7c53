// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Socket-facing identifiers: address families, socket types and the
//! IP-level socket options with their C ABI value layouts.

use super::err::Error;
use super::ip::Ipv4Addr;
use super::ip::Ipv6Addr;
use serde::Deserialize;
use serde::Serialize;

/// An address family, as used for protocol registration.
///
/// `Supported` is the union of both families: a protocol registered
/// with it serves IPv4 and IPv6 alike.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub enum AddrFamily {
    Inet = 1,
    Inet6 = 2,
    Supported = 3,
}

impl AddrFamily {
    /// Does `self` cover `other`?
    pub fn includes(&self, other: AddrFamily) -> bool {
        (*self as u8) & (other as u8) == (other as u8)
    }

    /// Do `self` and `other` share a family?
    pub fn overlaps(&self, other: AddrFamily) -> bool {
        (*self as u8) & (other as u8) != 0
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub enum SockType {
    Unspec = 0,
    Stream = 1,
    Dgram = 2,
    Raw = 3,
}

pub const IPPROTO_IP: i32 = 0;
pub const IPPROTO_IPV6: i32 = 41;

pub const IP_TOS: i32 = 3;
pub const IP_TTL: i32 = 4;
pub const IP_MULTICAST_TTL: i32 = 10;
pub const IP_ADD_MEMBERSHIP: i32 = 12;
pub const IP_DROP_MEMBERSHIP: i32 = 13;

pub const IPV6_UNICAST_HOPS: i32 = 4;
pub const IPV6_MULTICAST_HOPS: i32 = 10;
pub const IPV6_JOIN_GROUP: i32 = 12;
pub const IPV6_LEAVE_GROUP: i32 = 13;

/// Options at the `IPPROTO_IP` level.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum IpOpt {
    Tos,
    Ttl,
    MulticastTtl,
    AddMembership,
    DropMembership,
}

impl TryFrom<i32> for IpOpt {
    type Error = Error;

    fn try_from(name: i32) -> Result<Self, Self::Error> {
        match name {
            IP_TOS => Ok(Self::Tos),
            IP_TTL => Ok(Self::Ttl),
            IP_MULTICAST_TTL => Ok(Self::MulticastTtl),
            IP_ADD_MEMBERSHIP => Ok(Self::AddMembership),
            IP_DROP_MEMBERSHIP => Ok(Self::DropMembership),
            _ => Err(Error::NoProtoOpt),
        }
    }
}

/// Options at the `IPPROTO_IPV6` level.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Ip6Opt {
    UnicastHops,
    MulticastHops,
    JoinGroup,
    LeaveGroup,
}

impl TryFrom<i32> for Ip6Opt {
    type Error = Error;

    fn try_from(name: i32) -> Result<Self, Self::Error> {
        match name {
            IPV6_UNICAST_HOPS => Ok(Self::UnicastHops),
            IPV6_MULTICAST_HOPS => Ok(Self::MulticastHops),
            IPV6_JOIN_GROUP => Ok(Self::JoinGroup),
            IPV6_LEAVE_GROUP => Ok(Self::LeaveGroup),
            _ => Err(Error::NoProtoOpt),
        }
    }
}

/// Decode an `int`-sized option value.
pub fn opt_int(val: &[u8]) -> Result<i32, Error> {
    let bytes: [u8; 4] = val.try_into().map_err(|_| Error::Inval)?;
    Ok(i32::from_ne_bytes(bytes))
}

/// `struct ip_mreq`: group address followed by the interface index.
/// An index of zero selects the default interface.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct IpMreq {
    pub multiaddr: Ipv4Addr,
    pub interface: u32,
}

impl IpMreq {
    pub const SIZE: usize = 8;

    pub fn from_bytes(val: &[u8]) -> Result<Self, Error> {
        if val.len() != Self::SIZE {
            return Err(Error::Inval);
        }

        let multiaddr = Ipv4Addr::from([val[0], val[1], val[2], val[3]]);
        let interface = u32::from_ne_bytes([val[4], val[5], val[6], val[7]]);
        Ok(Self { multiaddr, interface })
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[..4].copy_from_slice(&self.multiaddr.bytes());
        out[4..].copy_from_slice(&self.interface.to_ne_bytes());
        out
    }
}

/// `struct ipv6_mreq`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Ipv6Mreq {
    pub multiaddr: Ipv6Addr,
    pub interface: u32,
}

impl Ipv6Mreq {
    pub const SIZE: usize = 20;

    pub fn from_bytes(val: &[u8]) -> Result<Self, Error> {
        if val.len() != Self::SIZE {
            return Err(Error::Inval);
        }

        let mut addr = [0u8; 16];
        addr.copy_from_slice(&val[..16]);
        let interface =
            u32::from_ne_bytes([val[16], val[17], val[18], val[19]]);
        Ok(Self { multiaddr: Ipv6Addr::from(addr), interface })
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[..16].copy_from_slice(&self.multiaddr.bytes());
        out[16..].copy_from_slice(&self.interface.to_ne_bytes());
        out
    }
}
