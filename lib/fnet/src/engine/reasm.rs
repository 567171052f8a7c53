// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Fragment reassembly, shared by IPv4 and IPv6.
//!
//! A [`ReasmTable`] holds one entry per datagram being reassembled,
//! keyed by whatever identifies a datagram for the IP version in
//! question (`K`), plus some version-specific metadata (`M`) taken
//! from the zero-offset fragment. Each entry keeps its fragments in
//! offset order with no overlap.
//!
//! # Overlap
//!
//! Where fragments overlap, the bytes of the fragment with the lower
//! offset are kept, whichever arrived first; for equal offsets the
//! fragment already held wins. A new fragment is trimmed at the front
//! against its predecessor and any held successors it overlaps are
//! trimmed at the front or dropped.
//!
//! # Expiry
//!
//! Every entry starts with a TTL counted in timer ticks. Each call to
//! [`ReasmTable::tick()`] decrements it; at zero the entry is removed
//! and handed back as [`Expired`] so that the caller can report it.

use crate::sys::netbuf::NetBuf;
use crate::sys::netbuf::NetBufError;
use alloc::vec::Vec;
use core::fmt;
use core::fmt::Display;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ReasmError {
    /// The fragment would extend the datagram past the size limit.
    /// The whole entry has been discarded.
    TooBig,
    /// No room for another datagram.
    Full,
    Buf(NetBufError),
}

impl From<NetBufError> for ReasmError {
    fn from(e: NetBufError) -> Self {
        Self::Buf(e)
    }
}

impl Display for ReasmError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::TooBig => write!(f, "reassembled datagram too big"),
            Self::Full => write!(f, "reassembly table full"),
            Self::Buf(e) => write!(f, "{e}"),
        }
    }
}

/// One received piece of a datagram.
#[derive(Debug)]
pub struct Fragment {
    /// Byte offset of `data` in the original payload.
    pub offset: usize,
    /// More fragments follow this one.
    pub more: bool,
    /// The fragment's payload, with the IP header stripped.
    pub data: NetBuf,
}

/// A completed datagram payload.
#[derive(Debug)]
pub struct Reassembled<M> {
    pub meta: M,
    pub data: NetBuf,
}

/// A datagram whose reassembly timed out.
#[derive(Debug)]
pub struct Expired<K, M> {
    pub key: K,
    pub meta: M,
    /// The zero-offset fragment's payload, if it had arrived.
    pub first: Option<NetBuf>,
}

#[derive(Debug)]
struct FragNode {
    offset: usize,
    data: NetBuf,
}

impl FragNode {
    fn end(&self) -> usize {
        self.offset + self.data.len()
    }
}

#[derive(Debug)]
struct Entry<K, M> {
    key: K,
    meta: M,
    ttl: u32,
    /// Known once the last fragment has arrived.
    total: Option<usize>,
    frags: Vec<FragNode>,
}

impl<K, M> Entry<K, M> {
    fn is_complete(&self) -> bool {
        let Some(total) = self.total else {
            return false;
        };

        let mut expect = 0;
        for f in &self.frags {
            if f.offset > expect {
                return false;
            }
            expect = expect.max(f.end());
            if expect >= total {
                return true;
            }
        }

        false
    }

    fn into_expired(self) -> Expired<K, M> {
        let first =
            self.frags.into_iter().find(|f| f.offset == 0).map(|f| f.data);
        Expired { key: self.key, meta: self.meta, first }
    }
}

#[derive(Debug)]
pub struct ReasmTable<K, M> {
    slots: Vec<Option<Entry<K, M>>>,
    ttl: u32,
    max_len: usize,
    limit: usize,
}

impl<K, M> ReasmTable<K, M>
where
    K: Copy + PartialEq,
{
    /// A table allowing `limit` concurrent datagrams of up to
    /// `max_len` payload bytes, each living for `ttl` ticks.
    pub fn new(ttl: u32, max_len: usize, limit: usize) -> Self {
        Self { slots: Vec::new(), ttl: ttl.max(1), max_len, limit }
    }

    fn position(&self, key: &K) -> Option<usize> {
        self.slots
            .iter()
            .position(|s| s.as_ref().is_some_and(|e| e.key == *key))
    }

    fn create(&mut self, key: K, meta: M) -> Result<usize, ReasmError> {
        let entry = Entry {
            key,
            meta,
            ttl: self.ttl,
            total: None,
            frags: Vec::new(),
        };

        if let Some(i) = self.slots.iter().position(Option::is_none) {
            self.slots[i] = Some(entry);
            return Ok(i);
        }

        if self.slots.len() >= self.limit {
            return Err(ReasmError::Full);
        }

        self.slots.push(Some(entry));
        Ok(self.slots.len() - 1)
    }

    /// Add `frag` to the datagram identified by `key`.
    ///
    /// `meta` is kept if this is the datagram's first fragment or if
    /// `frag` is the zero-offset fragment; otherwise it is dropped.
    /// Returns the payload once every byte up to the last fragment is
    /// present.
    pub fn insert(
        &mut self,
        key: K,
        meta: M,
        frag: Fragment,
    ) -> Result<Option<Reassembled<M>>, ReasmError> {
        let Fragment { mut offset, more, mut data } = frag;
        let end = offset + data.len();

        if end > self.max_len {
            if let Some(i) = self.position(&key) {
                self.slots[i] = None;
            }
            return Err(ReasmError::TooBig);
        }

        let idx = match self.position(&key) {
            Some(i) => {
                if offset == 0 {
                    if let Some(e) = self.slots[i].as_mut() {
                        e.meta = meta;
                    }
                }
                i
            }

            None => self.create(key, meta)?,
        };

        let Some(entry) = self.slots[idx].as_mut() else {
            return Ok(None);
        };

        if !more {
            entry.total = Some(end);
        }

        let frags = &mut entry.frags;
        let pos = frags.partition_point(|f| f.offset <= offset);
        let mut covered = data.is_empty();

        if pos > 0 && !covered {
            let prev_end = frags[pos - 1].end();
            if prev_end >= end {
                covered = true;
            } else if prev_end > offset {
                data.trim_front(prev_end - offset)?;
                offset = prev_end;
            }
        }

        if !covered {
            while pos < frags.len() && frags[pos].offset < end {
                if frags[pos].end() <= end {
                    frags.remove(pos);
                } else {
                    let cut = end - frags[pos].offset;
                    frags[pos].data.trim_front(cut)?;
                    frags[pos].offset = end;
                    break;
                }
            }

            frags.insert(pos, FragNode { offset, data });
        }

        if !entry.is_complete() {
            return Ok(None);
        }

        let Some(entry) = self.slots[idx].take() else {
            return Ok(None);
        };
        let total = entry.total.unwrap_or(0);
        let mut frags = entry.frags.into_iter();
        let Some(first) = frags.next() else {
            return Ok(None);
        };

        let mut out = first.data;
        for f in frags {
            out.append(f.data);
        }
        out.truncate(total);

        Ok(Some(Reassembled { meta: entry.meta, data: out }))
    }

    /// Advance the clock by one tick, removing and returning every
    /// entry whose TTL ran out.
    pub fn tick(&mut self) -> Vec<Expired<K, M>> {
        let mut out = Vec::new();

        for slot in self.slots.iter_mut() {
            let expired = match slot {
                Some(e) => {
                    e.ttl = e.ttl.saturating_sub(1);
                    e.ttl == 0
                }

                None => false,
            };

            if expired {
                if let Some(e) = slot.take() {
                    out.push(e.into_expired());
                }
            }
        }

        out
    }

    /// The number of datagrams being reassembled.
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The number of fragments held across all datagrams.
    pub fn frags_held(&self) -> usize {
        self.slots.iter().flatten().map(|e| e.frags.len()).sum()
    }

    /// Drop every entry and the fragments it holds.
    pub fn clear(&mut self) {
        self.slots.clear();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::sys::netbuf::NetBufPool;

    fn frag(pool: &NetBufPool, data: &[u8], offset: usize, more: bool) -> Fragment {
        Fragment { offset, more, data: pool.from_slice(&data[offset..]).unwrap() }
    }

    fn piece(
        pool: &NetBufPool,
        data: &[u8],
        range: core::ops::Range<usize>,
        more: bool,
    ) -> Fragment {
        Fragment {
            offset: range.start,
            more,
            data: pool.from_slice(&data[range]).unwrap(),
        }
    }

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn in_order_and_reverse() {
        let pool = NetBufPool::new(8192);
        let data = payload(300);

        for rev in [false, true] {
            let mut t: ReasmTable<u16, &str> = ReasmTable::new(4, 1000, 4);
            let mut pieces = vec![
                piece(&pool, &data, 0..104, true),
                piece(&pool, &data, 104..208, true),
                piece(&pool, &data, 208..300, false),
            ];
            if rev {
                pieces.reverse();
            }

            let mut done = None;
            for p in pieces {
                assert!(done.is_none());
                done = t.insert(7, "m", p).unwrap();
            }

            let r = done.unwrap();
            assert_eq!(r.data.to_vec(), data);
            assert_eq!(r.meta, "m");
            assert!(t.is_empty());
        }

        assert_eq!(pool.in_use(), 0);
    }

    #[test]
    fn lower_offset_wins() {
        let pool = NetBufPool::new(8192);
        let a = [0xAAu8; 100];
        let b = [0xBBu8; 100];

        // Lower offset first, then a later overlapping final piece.
        let mut t: ReasmTable<u16, ()> = ReasmTable::new(4, 1000, 4);
        t.insert(1, (), Fragment { offset: 0, more: true, data: pool.from_slice(&a).unwrap() })
            .unwrap();
        let r = t
            .insert(1, (), Fragment { offset: 50, more: false, data: pool.from_slice(&b).unwrap() })
            .unwrap()
            .unwrap();
        let v = r.data.to_vec();
        assert_eq!(v.len(), 150);
        assert!(v[..100].iter().all(|&x| x == 0xAA));
        assert!(v[100..].iter().all(|&x| x == 0xBB));

        // Same thing, other arrival order.
        let mut t: ReasmTable<u16, ()> = ReasmTable::new(4, 1000, 4);
        t.insert(1, (), Fragment { offset: 50, more: false, data: pool.from_slice(&b).unwrap() })
            .unwrap();
        let r = t
            .insert(1, (), Fragment { offset: 0, more: true, data: pool.from_slice(&a).unwrap() })
            .unwrap()
            .unwrap();
        assert_eq!(r.data.to_vec(), v);
    }

    #[test]
    fn covered_fragments_are_replaced() {
        let pool = NetBufPool::new(8192);
        let data = payload(64);
        let mut t: ReasmTable<u16, ()> = ReasmTable::new(4, 1000, 4);

        t.insert(1, (), piece(&pool, &data, 16..24, true)).unwrap();
        t.insert(1, (), piece(&pool, &data, 24..32, true)).unwrap();
        assert_eq!(t.frags_held(), 2);
        // Covers both held pieces.
        t.insert(1, (), piece(&pool, &data, 8..40, true)).unwrap();
        assert_eq!(t.frags_held(), 1);
        // A duplicate is ignored.
        t.insert(1, (), piece(&pool, &data, 8..40, true)).unwrap();
        assert_eq!(t.frags_held(), 1);

        t.insert(1, (), piece(&pool, &data, 0..8, true)).unwrap();
        let r = t.insert(1, (), frag(&pool, &data, 40, false)).unwrap().unwrap();
        assert_eq!(r.data.to_vec(), data);
    }

    #[test]
    fn gap_expires() {
        let pool = NetBufPool::new(8192);
        let data = payload(200);
        let mut t: ReasmTable<u16, u8> = ReasmTable::new(3, 1000, 4);

        t.insert(9, 1, piece(&pool, &data, 0..80, true)).unwrap();
        assert!(t.insert(9, 2, piece(&pool, &data, 160..200, false)).unwrap().is_none());
        assert_eq!(t.len(), 1);

        assert!(t.tick().is_empty());
        assert!(t.tick().is_empty());
        let exp = t.tick();
        assert_eq!(exp.len(), 1);
        assert_eq!(exp[0].key, 9);
        // The zero-offset fragment's metadata is the one kept.
        assert_eq!(exp[0].meta, 1);
        assert_eq!(exp[0].first.as_ref().unwrap().len(), 80);
        assert!(t.is_empty());
        drop(exp);
        assert_eq!(pool.in_use(), 0);
    }

    #[test]
    fn expiry_without_first_fragment() {
        let pool = NetBufPool::new(8192);
        let data = payload(200);
        let mut t: ReasmTable<u16, ()> = ReasmTable::new(1, 1000, 4);
        t.insert(3, (), piece(&pool, &data, 80..160, true)).unwrap();
        let exp = t.tick();
        assert!(exp[0].first.is_none());
    }

    #[test]
    fn limits() {
        let pool = NetBufPool::new(8192);
        let data = payload(200);
        let mut t: ReasmTable<u16, ()> = ReasmTable::new(4, 150, 2);

        t.insert(1, (), piece(&pool, &data, 0..8, true)).unwrap();
        assert_eq!(
            t.insert(1, (), piece(&pool, &data, 100..160, true)).unwrap_err(),
            ReasmError::TooBig
        );
        // The whole datagram was discarded.
        assert!(t.is_empty());

        t.insert(1, (), piece(&pool, &data, 0..8, true)).unwrap();
        t.insert(2, (), piece(&pool, &data, 0..8, true)).unwrap();
        assert_eq!(
            t.insert(3, (), piece(&pool, &data, 0..8, true)).unwrap_err(),
            ReasmError::Full
        );

        t.clear();
        assert_eq!(pool.in_use(), 0);
    }
}
