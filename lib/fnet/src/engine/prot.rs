// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The protocol registry and upper-layer dispatch.
//!
//! Every protocol above IP registers under an (address family, socket
//! type, protocol number) key. ICMP, ICMPv6 and IGMP are built in and
//! live in the registry like anybody else, so that a user handler
//! cannot take their numbers. Everything else is a boxed
//! [`ProtoHandler`].
//!
//! Handlers registered with [`SockType::Raw`] are taps: they see a
//! copy of every accepted datagram carrying their protocol number (or
//! every datagram, for protocol 0) before normal dispatch, and cannot
//! affect it.

use super::icmp;
use super::igmp;
use super::ip::Ip4Rx;
use super::ip::Ip6Rx;
use super::ip::ext::PARAM_UNRECOGNIZED_NH;
use super::stack::Stack;
use crate::sys::netbuf::NetBuf;
use alloc::boxed::Box;
use fnet_api::AddrFamily;
use fnet_api::Error;
use fnet_api::IpAddr;
use fnet_api::PROTO_ICMP;
use fnet_api::PROTO_ICMPV6;
use fnet_api::PROTO_IGMP;
use fnet_api::ProtNotify;
use fnet_api::SockType;

/// An ICMP-sourced notification about a datagram we sent.
#[derive(Clone, Copy, Debug)]
pub struct CtlMsg<'a> {
    pub notify: ProtNotify,
    /// Source and destination of the datagram the error is about,
    /// that is, our address and the peer's.
    pub src: IpAddr,
    pub dst: IpAddr,
    pub proto: u8,
    /// The next-hop MTU, for `MsgSize`.
    pub mtu: Option<u32>,
    /// The quoted upper-layer header, as much of it as came back.
    pub quoted: &'a [u8],
}

/// An upper-layer protocol.
///
/// Input methods own the packet, which starts at the upper-layer
/// header. They are given the stack so that they can answer.
pub trait ProtoHandler: Send {
    fn family(&self) -> AddrFamily;
    fn sock_type(&self) -> SockType;
    fn protocol(&self) -> u8;
    fn name(&self) -> &'static str;

    fn input_ip4(&mut self, _stack: &mut Stack, _rx: &Ip4Rx, _pkt: NetBuf) {}
    fn input_ip6(&mut self, _stack: &mut Stack, _rx: &Ip6Rx, _pkt: NetBuf) {}
    fn raw_input_ip4(&mut self, _rx: &Ip4Rx, _pkt: &NetBuf) {}
    fn raw_input_ip6(&mut self, _rx: &Ip6Rx, _pkt: &NetBuf) {}
    fn control_input(&mut self, _msg: &CtlMsg<'_>) {}
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ProtoId(usize);

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Builtin {
    Icmp4,
    Icmp6,
    Igmp,
}

enum Slot {
    Builtin(Builtin),
    /// `None` while the handler is running.
    User(Option<Box<dyn ProtoHandler>>),
}

struct Registered {
    family: AddrFamily,
    sock_type: SockType,
    protocol: u8,
    name: &'static str,
    slot: Slot,
}

pub struct ProtoRegistry {
    entries: alloc::vec::Vec<Registered>,
}

impl ProtoRegistry {
    pub(crate) fn with_builtins() -> Self {
        let builtins = [
            (AddrFamily::Inet, PROTO_ICMP, "icmp", Builtin::Icmp4),
            (AddrFamily::Inet6, PROTO_ICMPV6, "icmp6", Builtin::Icmp6),
            (AddrFamily::Inet, PROTO_IGMP, "igmp", Builtin::Igmp),
        ];

        let entries = builtins
            .into_iter()
            .map(|(family, protocol, name, b)| Registered {
                family,
                sock_type: SockType::Dgram,
                protocol,
                name,
                slot: Slot::Builtin(b),
            })
            .collect();

        Self { entries }
    }

    fn conflicts(&self, family: AddrFamily, ty: SockType, proto: u8) -> bool {
        self.entries.iter().any(|e| {
            e.family.overlaps(family) && e.sock_type == ty && e.protocol == proto
        })
    }

    /// Add a handler. Each (family, type, protocol) key may be taken
    /// once; families overlap when either is [`AddrFamily::Supported`].
    pub fn register(
        &mut self,
        h: Box<dyn ProtoHandler>,
    ) -> Result<ProtoId, Error> {
        let (family, ty, proto) = (h.family(), h.sock_type(), h.protocol());

        if ty == SockType::Unspec {
            return Err(Error::Inval);
        }

        if self.conflicts(family, ty, proto) {
            return Err(Error::AddrInUse);
        }

        self.entries.push(Registered {
            family,
            sock_type: ty,
            protocol: proto,
            name: h.name(),
            slot: Slot::User(Some(h)),
        });
        Ok(ProtoId(self.entries.len() - 1))
    }

    /// Find the handler for `protocol` in `family`. [`SockType::Unspec`]
    /// matches any type but raw.
    pub fn find(
        &self,
        family: AddrFamily,
        ty: SockType,
        protocol: u8,
    ) -> Option<ProtoId> {
        self.entries
            .iter()
            .position(|e| {
                e.family.includes(family)
                    && e.protocol == protocol
                    && match ty {
                        SockType::Unspec => e.sock_type != SockType::Raw,
                        ty => e.sock_type == ty,
                    }
            })
            .map(ProtoId)
    }

    /// Every raw tap for `protocol` in `family`.
    pub fn find_raw(
        &self,
        family: AddrFamily,
        protocol: u8,
    ) -> impl Iterator<Item = ProtoId> + '_ {
        self.entries
            .iter()
            .enumerate()
            .filter(move |(_, e)| {
                e.sock_type == SockType::Raw
                    && e.family.includes(family)
                    && (e.protocol == protocol || e.protocol == 0)
            })
            .map(|(i, _)| ProtoId(i))
    }

    pub fn name(&self, id: ProtoId) -> Option<&'static str> {
        self.entries.get(id.0).map(|e| e.name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn builtin(&self, id: ProtoId) -> Option<Builtin> {
        match self.entries.get(id.0)?.slot {
            Slot::Builtin(b) => Some(b),
            Slot::User(_) => None,
        }
    }

    fn take(&mut self, id: ProtoId) -> Option<Box<dyn ProtoHandler>> {
        match &mut self.entries.get_mut(id.0)?.slot {
            Slot::User(h) => h.take(),
            Slot::Builtin(_) => None,
        }
    }

    fn restore(&mut self, id: ProtoId, h: Box<dyn ProtoHandler>) {
        if let Some(Registered { slot: Slot::User(s), .. }) =
            self.entries.get_mut(id.0)
        {
            *s = Some(h);
        }
    }
}

impl Stack {
    /// Register an upper-layer protocol.
    pub fn register_proto(
        &mut self,
        h: Box<dyn ProtoHandler>,
    ) -> Result<ProtoId, Error> {
        let id = self.protos.register(h)?;
        crate::engine::dbg!(
            "registered protocol {}",
            self.protos.name(id).unwrap_or("?")
        );
        Ok(id)
    }

    /// Run `f` with the user handler `id` lent out of the registry, so
    /// that the handler may call back into the stack.
    ///
    /// A handler re-entered from its own callback is skipped.
    fn with_user<R>(
        &mut self,
        id: ProtoId,
        f: impl FnOnce(&mut Self, &mut dyn ProtoHandler) -> R,
    ) -> Option<R> {
        let mut h = self.protos.take(id)?;
        let r = f(self, &mut *h);
        self.protos.restore(id, h);
        Some(r)
    }

    /// Deliver a received IPv4 payload.
    pub(crate) fn ip4_dispatch(&mut self, rx: Ip4Rx, pkt: NetBuf) {
        let taps: alloc::vec::Vec<ProtoId> =
            self.protos.find_raw(AddrFamily::Inet, rx.proto).collect();
        for id in taps {
            self.with_user(id, |_, h| h.raw_input_ip4(&rx, &pkt));
        }

        let id = self.protos.find(AddrFamily::Inet, SockType::Unspec, rx.proto);
        match id.map(|id| (id, self.protos.builtin(id))) {
            Some((_, Some(Builtin::Icmp4))) => icmp::v4::input(self, rx, pkt),
            Some((_, Some(Builtin::Igmp))) => igmp::input(self, rx, pkt),
            Some((id, None)) => {
                self.with_user(id, |stack, h| h.input_ip4(stack, &rx, pkt));
            }

            Some((_, Some(Builtin::Icmp6))) | None => {
                crate::engine::dbg!("ip4: no protocol {} from {}", rx.proto, rx.src);
                self.stats.drop_no_proto += 1;
                drop(pkt);
                icmp::v4::icmp4_error(
                    self,
                    rx.netif,
                    rx.flags,
                    &rx.quote,
                    icmp::v4::Icmp4Err::ProtoUnreach,
                );
            }
        }
    }

    /// Deliver a received IPv6 payload.
    pub(crate) fn ip6_dispatch(&mut self, rx: Ip6Rx, pkt: NetBuf) {
        let taps: alloc::vec::Vec<ProtoId> =
            self.protos.find_raw(AddrFamily::Inet6, rx.nh).collect();
        for id in taps {
            self.with_user(id, |_, h| h.raw_input_ip6(&rx, &pkt));
        }

        let id = self.protos.find(AddrFamily::Inet6, SockType::Unspec, rx.nh);
        match id.map(|id| (id, self.protos.builtin(id))) {
            Some((_, Some(Builtin::Icmp6))) => icmp::v6::input(self, rx, pkt),
            Some((id, None)) => {
                self.with_user(id, |stack, h| h.input_ip6(stack, &rx, pkt));
            }

            Some((_, Some(Builtin::Icmp4 | Builtin::Igmp))) | None => {
                crate::engine::dbg!("ip6: no protocol {} from {}", rx.nh, rx.src);
                self.stats.drop_no_proto += 1;
                drop(pkt);
                icmp::v6::icmp6_error(
                    self,
                    rx.netif,
                    rx.flags,
                    &rx.quote,
                    icmp::v6::Icmp6Err::ParamProblem {
                        code: PARAM_UNRECOGNIZED_NH,
                        pointer: rx.nh_offset as u32,
                    },
                );
            }
        }
    }

    /// Hand an ICMP-derived notification to the protocol that owns
    /// the quoted datagram. Raw taps for that protocol hear it too.
    pub fn notify_control(&mut self, family: AddrFamily, msg: &CtlMsg<'_>) {
        let taps: alloc::vec::Vec<ProtoId> =
            self.protos.find_raw(family, msg.proto).collect();
        for id in taps {
            self.with_user(id, |_, h| h.control_input(msg));
        }

        if let Some(id) = self.protos.find(family, SockType::Unspec, msg.proto) {
            crate::engine::dbg!("notify protocol {}: {}", msg.proto, msg.notify);
            self.with_user(id, |_, h| h.control_input(msg));
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use alloc::vec::Vec;
    use fnet_api::PROTO_UDP;

    struct Dummy(AddrFamily, SockType, u8);

    impl ProtoHandler for Dummy {
        fn family(&self) -> AddrFamily {
            self.0
        }

        fn sock_type(&self) -> SockType {
            self.1
        }

        fn protocol(&self) -> u8 {
            self.2
        }

        fn name(&self) -> &'static str {
            "dummy"
        }
    }

    fn dummy(f: AddrFamily, t: SockType, p: u8) -> Box<dyn ProtoHandler> {
        Box::new(Dummy(f, t, p))
    }

    #[test]
    fn builtins_present() {
        let reg = ProtoRegistry::with_builtins();
        let icmp = reg.find(AddrFamily::Inet, SockType::Unspec, PROTO_ICMP);
        assert_eq!(icmp.and_then(|id| reg.builtin(id)), Some(Builtin::Icmp4));
        let icmp6 = reg.find(AddrFamily::Inet6, SockType::Unspec, PROTO_ICMPV6);
        assert_eq!(icmp6.and_then(|id| reg.builtin(id)), Some(Builtin::Icmp6));
        assert!(reg.find(AddrFamily::Inet6, SockType::Unspec, PROTO_ICMP).is_none());
    }

    #[test]
    fn one_handler_per_key() {
        let mut reg = ProtoRegistry::with_builtins();
        let udp = reg
            .register(dummy(AddrFamily::Supported, SockType::Dgram, PROTO_UDP))
            .unwrap();

        assert_eq!(
            reg.register(dummy(AddrFamily::Inet, SockType::Dgram, PROTO_UDP))
                .err(),
            Some(Error::AddrInUse)
        );
        assert_eq!(
            reg.register(dummy(AddrFamily::Inet, SockType::Dgram, PROTO_ICMP))
                .err(),
            Some(Error::AddrInUse)
        );
        assert_eq!(
            reg.register(dummy(AddrFamily::Inet, SockType::Unspec, 99)).err(),
            Some(Error::Inval)
        );

        // A raw tap on the same number is a different key.
        let raw = reg
            .register(dummy(AddrFamily::Inet, SockType::Raw, PROTO_UDP))
            .unwrap();
        assert_eq!(reg.find(AddrFamily::Inet6, SockType::Unspec, PROTO_UDP), Some(udp));
        assert_eq!(reg.find(AddrFamily::Inet, SockType::Raw, PROTO_UDP), Some(raw));
        assert_eq!(
            reg.find_raw(AddrFamily::Inet, PROTO_UDP).collect::<Vec<_>>(),
            vec![raw]
        );
        assert_eq!(reg.find_raw(AddrFamily::Inet6, PROTO_UDP).count(), 0);
    }

    #[test]
    fn wildcard_raw_tap() {
        let mut reg = ProtoRegistry::with_builtins();
        let any = reg
            .register(dummy(AddrFamily::Inet, SockType::Raw, 0))
            .unwrap();
        assert_eq!(reg.find_raw(AddrFamily::Inet, 200).collect::<Vec<_>>(), vec![any]);
        assert_eq!(reg.name(any), Some("dummy"));
    }
}
