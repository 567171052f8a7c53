// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

use core::fmt;
use core::fmt::Display;
use serde::Deserialize;
use serde::Serialize;

/// An asynchronous notification, derived from a received ICMP/ICMPv6
/// error, about a datagram this host sent earlier.
///
/// The IP core hands these to the `control_input` of the protocol that
/// owns the quoted datagram. What the protocol does with it (abort a
/// connection, shrink a segment size, ignore it) is its own business.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum ProtNotify {
    NetUnreach,
    HostUnreach,
    ProtoUnreach,
    PortUnreach,
    SrcFail,
    MsgSize,
    TimxceedIntrans,
    TimxceedReass,
    ParamProb,
    Quench,
}

impl ProtNotify {
    /// Hard errors terminate a connection outright; soft errors are
    /// only remembered.
    pub fn is_hard(&self) -> bool {
        matches!(
            self,
            Self::ProtoUnreach | Self::PortUnreach | Self::MsgSize
        )
    }
}

impl Display for ProtNotify {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            Self::NetUnreach => "net unreachable",
            Self::HostUnreach => "host unreachable",
            Self::ProtoUnreach => "protocol unreachable",
            Self::PortUnreach => "port unreachable",
            Self::SrcFail => "source route failed",
            Self::MsgSize => "message size",
            Self::TimxceedIntrans => "ttl exceeded in transit",
            Self::TimxceedReass => "reassembly time exceeded",
            Self::ParamProb => "parameter problem",
            Self::Quench => "source quench",
        };

        write!(f, "{s}")
    }
}
