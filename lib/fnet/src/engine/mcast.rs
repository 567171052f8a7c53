// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Multicast group membership.
//!
//! The stack owns one [`McastTable`] per IP version. An entry records
//! a (group, interface) pair and how many sockets joined it. Sockets
//! do not own entries; they hold a [`McastHandle`], a slot index plus
//! the generation of the entry it was issued for, so a stale handle
//! can never release somebody else's membership.

use super::netif::NetifId;
use fnet_api::Error;

/// The number of (group, interface) memberships per IP version.
pub const MCAST_MAX: usize = 10;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct McastHandle {
    idx: u16,
    epoch: u16,
}

#[derive(Clone, Copy, Debug)]
struct Entry<A> {
    group: A,
    netif: NetifId,
    refs: u32,
}

/// A fixed-size, refcounted membership table.
#[derive(Debug)]
pub struct McastTable<A, const N: usize> {
    slots: [Option<Entry<A>>; N],
    epochs: [u16; N],
}

impl<A: Copy + PartialEq, const N: usize> Default for McastTable<A, N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A: Copy + PartialEq, const N: usize> McastTable<A, N> {
    pub fn new() -> Self {
        Self { slots: [const { None }; N], epochs: [0; N] }
    }

    fn handle(&self, idx: usize) -> McastHandle {
        McastHandle { idx: idx as u16, epoch: self.epochs[idx] }
    }

    /// Add a reference to `group` on `netif`.
    ///
    /// The returned flag is true when this created the membership,
    /// meaning the caller must program the link layer and announce
    /// it.
    pub fn join(
        &mut self,
        group: A,
        netif: NetifId,
    ) -> Result<(McastHandle, bool), Error> {
        if let Some(idx) = self.position(group, netif) {
            if let Some(e) = self.slots[idx].as_mut() {
                e.refs += 1;
            }
            return Ok((self.handle(idx), false));
        }

        let idx = self
            .slots
            .iter()
            .position(Option::is_none)
            .ok_or(Error::AddrInUse)?;
        self.slots[idx] = Some(Entry { group, netif, refs: 1 });
        Ok((self.handle(idx), true))
    }

    /// Drop the reference `h` stands for.
    ///
    /// Returns the group and interface when that was the last
    /// reference, meaning the caller must undo what the first join
    /// did.
    pub fn leave(
        &mut self,
        h: McastHandle,
    ) -> Result<Option<(A, NetifId)>, Error> {
        let idx = usize::from(h.idx);
        if idx >= N || self.epochs[idx] != h.epoch {
            return Err(Error::AddrNotAvail);
        }

        let Some(e) = self.slots[idx].as_mut() else {
            return Err(Error::AddrNotAvail);
        };

        e.refs -= 1;
        if e.refs > 0 {
            return Ok(None);
        }

        let gone = (e.group, e.netif);
        self.slots[idx] = None;
        self.epochs[idx] = self.epochs[idx].wrapping_add(1);
        Ok(Some(gone))
    }

    fn position(&self, group: A, netif: NetifId) -> Option<usize> {
        self.slots.iter().position(|s| {
            s.as_ref().is_some_and(|e| e.group == group && e.netif == netif)
        })
    }

    /// The handle for an existing membership.
    pub fn find(&self, group: A, netif: NetifId) -> Option<McastHandle> {
        self.position(group, netif).map(|idx| self.handle(idx))
    }

    pub fn contains(&self, group: A, netif: NetifId) -> bool {
        self.position(group, netif).is_some()
    }

    /// Every membership as (group, interface, reference count).
    pub fn iter(&self) -> impl Iterator<Item = (A, NetifId, u32)> + '_ {
        self.slots.iter().flatten().map(|e| (e.group, e.netif, e.refs))
    }

    pub fn len(&self) -> usize {
        self.slots.iter().flatten().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Forget every membership, returning them so the caller can undo
    /// the link-layer side.
    pub fn clear(&mut self) -> alloc::vec::Vec<(A, NetifId)> {
        let mut out = alloc::vec::Vec::new();

        for (slot, epoch) in self.slots.iter_mut().zip(self.epochs.iter_mut()) {
            if let Some(e) = slot.take() {
                out.push((e.group, e.netif));
                *epoch = epoch.wrapping_add(1);
            }
        }

        out
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use alloc::vec::Vec;
    use fnet_api::Ipv4Addr;

    const G1: Ipv4Addr = Ipv4Addr::from_const([239, 1, 1, 1]);
    const G2: Ipv4Addr = Ipv4Addr::from_const([239, 1, 1, 2]);

    #[test]
    fn refcounting() {
        let mut t = McastTable::<Ipv4Addr, 4>::new();
        let eth = NetifId::new(2);

        let (h1, first) = t.join(G1, eth).unwrap();
        assert!(first);
        let (h2, first) = t.join(G1, eth).unwrap();
        assert!(!first);
        assert_eq!(h1, h2);
        assert_eq!(t.iter().collect::<Vec<_>>(), vec![(G1, eth, 2)]);

        assert_eq!(t.leave(h1), Ok(None));
        assert_eq!(t.leave(h2), Ok(Some((G1, eth))));
        assert!(t.is_empty());
    }

    #[test]
    fn stale_handle_rejected() {
        let mut t = McastTable::<Ipv4Addr, 4>::new();
        let eth = NetifId::new(2);

        let (old, _) = t.join(G1, eth).unwrap();
        t.leave(old).unwrap();
        // Same slot, new generation.
        let (new, _) = t.join(G2, eth).unwrap();
        assert_ne!(old, new);
        assert_eq!(t.leave(old), Err(Error::AddrNotAvail));
        assert!(t.contains(G2, eth));
    }

    #[test]
    fn full_table() {
        let mut t = McastTable::<Ipv4Addr, 2>::new();
        t.join(G1, NetifId::new(2)).unwrap();
        t.join(G1, NetifId::new(3)).unwrap();
        assert_eq!(t.join(G2, NetifId::new(2)), Err(Error::AddrInUse));
        // An existing membership can still gain references.
        assert!(t.join(G1, NetifId::new(3)).is_ok());

        let gone = t.clear();
        assert_eq!(gone.len(), 2);
        assert!(t.is_empty());
    }
}
