// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The datagram engine.
//!
//! Everything that touches packets lives under this namespace. The
//! [`stack::Stack`] ties the pieces together; the other modules are
//! organised by protocol.
pub mod checksum;
pub mod icmp;
pub mod igmp;
pub mod ip;
pub mod mcast;
pub mod netif;
pub mod prot;
pub mod queue;
pub mod reasm;
pub mod sockopt;
pub mod stack;

pub use netif::NetifId;
pub use stack::Stack;
pub use stack::StackCfg;

/// The `log` target used for every message the engine emits.
pub const LOG_TARGET: &str = "fnet";

cfg_if! {
    if #[cfg(feature = "std")] {
        #[macro_export]
        macro_rules! dbg_macro {
            ($s:tt) => {
                ::log::debug!(target: "fnet", $s)
            };
            ($s:tt, $($arg:tt)*) => {
                ::log::debug!(target: "fnet", $s, $($arg)*)
            };
        }

        #[macro_export]
        macro_rules! err_macro {
            ($s:tt) => {
                ::log::warn!(target: "fnet", $s)
            };
            ($s:tt, $($arg:tt)*) => {
                ::log::warn!(target: "fnet", $s, $($arg)*)
            };
        }
    } else {
        // Per-datagram chatter is compiled out of release firmware.
        #[macro_export]
        macro_rules! dbg_macro {
            ($s:tt) => {
                if cfg!(debug_assertions) {
                    ::log::debug!(target: "fnet", $s)
                }
            };
            ($s:tt, $($arg:tt)*) => {
                if cfg!(debug_assertions) {
                    ::log::debug!(target: "fnet", $s, $($arg)*)
                }
            };
        }

        #[macro_export]
        macro_rules! err_macro {
            ($s:tt) => {
                ::log::warn!(target: "fnet", $s)
            };
            ($s:tt, $($arg:tt)*) => {
                ::log::warn!(target: "fnet", $s, $($arg)*)
            };
        }
    }
}

pub use dbg_macro as dbg;
pub use err_macro as err;
