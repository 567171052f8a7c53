// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The stack-wide error type.
//!
//! Every fallible operation that reaches a caller outside the IP core
//! reports one of these. The values of [`Error::to_errno()`] follow
//! the BSD socket numbering so that a C shim can hand them straight to
//! an application.

use serde::Deserialize;
use serde::Serialize;

pub const FNET_ERR_NOMEM: i32 = 12;
pub const FNET_ERR_INVAL: i32 = 22;
pub const FNET_ERR_DESTADDRREQ: i32 = 39;
pub const FNET_ERR_MSGSIZE: i32 = 40;
pub const FNET_ERR_NOPROTOOPT: i32 = 42;
pub const FNET_ERR_NOPROTOCOL: i32 = 43;
pub const FNET_ERR_AFNOSUPPORT: i32 = 47;
pub const FNET_ERR_ADDRINUSE: i32 = 48;
pub const FNET_ERR_ADDRNOTAVAIL: i32 = 49;
pub const FNET_ERR_NETUNREACH: i32 = 51;
pub const FNET_ERR_HOSTUNREACH: i32 = 65;
pub const FNET_ERR_IPDISABLED: i32 = 80;

#[derive(
    Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize, thiserror::Error,
)]
pub enum Error {
    #[error("out of buffer memory")]
    NoMem,

    #[error("message too long")]
    MsgSize,

    #[error("network unreachable")]
    NetUnreach,

    #[error("host unreachable")]
    HostUnreach,

    #[error("destination address required")]
    DestAddrReq,

    #[error("IP is disabled on the interface")]
    IpDisabled,

    #[error("invalid argument")]
    Inval,

    #[error("address already in use")]
    AddrInUse,

    #[error("address not available")]
    AddrNotAvail,

    #[error("protocol option not available")]
    NoProtoOpt,

    #[error("address family not supported")]
    AfNoSupport,

    #[error("protocol not registered")]
    NoProtocol,
}

impl Error {
    /// Return the negative errno value for this error.
    pub fn to_errno(&self) -> i32 {
        let code = match self {
            Self::NoMem => FNET_ERR_NOMEM,
            Self::MsgSize => FNET_ERR_MSGSIZE,
            Self::NetUnreach => FNET_ERR_NETUNREACH,
            Self::HostUnreach => FNET_ERR_HOSTUNREACH,
            Self::DestAddrReq => FNET_ERR_DESTADDRREQ,
            Self::IpDisabled => FNET_ERR_IPDISABLED,
            Self::Inval => FNET_ERR_INVAL,
            Self::AddrInUse => FNET_ERR_ADDRINUSE,
            Self::AddrNotAvail => FNET_ERR_ADDRNOTAVAIL,
            Self::NoProtoOpt => FNET_ERR_NOPROTOOPT,
            Self::AfNoSupport => FNET_ERR_AFNOSUPPORT,
            Self::NoProtocol => FNET_ERR_NOPROTOCOL,
        };

        -code
    }
}
