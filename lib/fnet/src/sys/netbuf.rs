// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Packet buffers.
//!
//! A [`NetBuf`] is one logical packet spread over a chain of
//! segments. Each segment owns a contiguous block with room in front
//! of the valid data (headroom) so that headers can be prepended
//! without copying the payload. Packets are joined, split and trimmed
//! by moving whole segments around; bytes are only copied when an
//! operation cuts through the middle of a segment or when the caller
//! asks for a contiguous prefix with [`NetBuf::pullup()`].
//!
//! Every segment is charged against the [`NetBufPool`] it came from,
//! and the charge is returned when the segment is dropped. A packet is
//! freed by dropping it; whoever holds it last frees it. The pool
//! enforces a fixed byte budget, which is what bounds the memory an
//! embedded stack may use for packets.

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::fmt::Display;
use core::sync::atomic::AtomicUsize;
use core::sync::atomic::Ordering;

bitflags::bitflags! {
    /// Per-packet flags carried alongside the data.
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    pub struct NetBufFlags: u8 {
        /// The frame arrived as a link-layer broadcast.
        const BROADCAST = 0x01;
        /// The frame arrived as a link-layer multicast.
        const MULTICAST = 0x02;
        /// Hardware verified the IPv4 header checksum.
        const IP4_CSUM_OK = 0x04;
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum NetBufError {
    /// The pool budget is exhausted.
    NoMem,
    /// The packet holds fewer bytes than the operation needs.
    TooShort { need: usize, have: usize },
}

impl Display for NetBufError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::NoMem => write!(f, "netbuf pool exhausted"),
            Self::TooShort { need, have } => {
                write!(f, "netbuf too short: need {need}, have {have}")
            }
        }
    }
}

impl From<NetBufError> for fnet_api::Error {
    fn from(e: NetBufError) -> Self {
        match e {
            NetBufError::NoMem => Self::NoMem,
            NetBufError::TooShort { .. } => Self::Inval,
        }
    }
}

struct PoolInner {
    capacity: usize,
    used: AtomicUsize,
    high_water: AtomicUsize,
    failures: AtomicUsize,
}

/// A byte-budgeted arena for packet memory.
///
/// The handle is cheap to clone; all clones share one budget.
#[derive(Clone)]
pub struct NetBufPool {
    inner: Arc<PoolInner>,
}

impl fmt::Debug for NetBufPool {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("NetBufPool")
            .field("capacity", &self.capacity())
            .field("in_use", &self.in_use())
            .finish()
    }
}

impl NetBufPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                capacity,
                used: AtomicUsize::new(0),
                high_water: AtomicUsize::new(0),
                failures: AtomicUsize::new(0),
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Bytes currently charged to live segments.
    pub fn in_use(&self) -> usize {
        self.inner.used.load(Ordering::Acquire)
    }

    pub fn high_water(&self) -> usize {
        self.inner.high_water.load(Ordering::Relaxed)
    }

    /// Number of allocations refused for lack of budget.
    pub fn failures(&self) -> usize {
        self.inner.failures.load(Ordering::Relaxed)
    }

    fn reserve(&self, bytes: usize) -> Result<Lease, NetBufError> {
        let used = &self.inner.used;
        let mut cur = used.load(Ordering::Relaxed);

        loop {
            let next = match cur.checked_add(bytes) {
                Some(n) if n <= self.inner.capacity => n,
                _ => {
                    self.inner.failures.fetch_add(1, Ordering::Relaxed);
                    return Err(NetBufError::NoMem);
                }
            };

            match used.compare_exchange_weak(
                cur,
                next,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    self.inner.high_water.fetch_max(next, Ordering::Relaxed);
                    return Ok(Lease { pool: self.inner.clone(), bytes });
                }

                Err(actual) => cur = actual,
            }
        }
    }

    fn seg(&self, headroom: usize, len: usize) -> Result<Seg, NetBufError> {
        let size = headroom + len;
        let lease = self.reserve(size)?;
        Ok(Seg {
            data: vec![0u8; size].into_boxed_slice(),
            start: headroom,
            end: size,
            _lease: lease,
        })
    }

    /// A packet with no data, to be built up with
    /// [`NetBuf::append()`] and [`NetBuf::prepend()`].
    pub fn empty(&self) -> NetBuf {
        NetBuf {
            pool: self.clone(),
            segs: VecDeque::new(),
            total: 0,
            flags: NetBufFlags::empty(),
        }
    }

    /// Allocate a zeroed, single-segment packet of `len` bytes.
    pub fn alloc(&self, len: usize) -> Result<NetBuf, NetBufError> {
        self.alloc_with_headroom(0, len)
    }

    /// Allocate a zeroed, single-segment packet of `len` bytes with
    /// `headroom` bytes reserved in front for later prepends.
    pub fn alloc_with_headroom(
        &self,
        headroom: usize,
        len: usize,
    ) -> Result<NetBuf, NetBufError> {
        let seg = self.seg(headroom, len)?;
        let mut nb = self.empty();
        nb.push_seg(seg);
        Ok(nb)
    }

    /// Allocate a packet holding a copy of `data`.
    pub fn from_slice(&self, data: &[u8]) -> Result<NetBuf, NetBufError> {
        self.from_slice_with_headroom(0, data)
    }

    pub fn from_slice_with_headroom(
        &self,
        headroom: usize,
        data: &[u8],
    ) -> Result<NetBuf, NetBufError> {
        let mut seg = self.seg(headroom, data.len())?;
        seg.bytes_mut().copy_from_slice(data);
        let mut nb = self.empty();
        nb.push_seg(seg);
        Ok(nb)
    }
}

/// A charge against a pool, returned on drop.
struct Lease {
    pool: Arc<PoolInner>,
    bytes: usize,
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.pool.used.fetch_sub(self.bytes, Ordering::AcqRel);
    }
}

struct Seg {
    data: Box<[u8]>,
    start: usize,
    end: usize,
    _lease: Lease,
}

impl Seg {
    fn len(&self) -> usize {
        self.end - self.start
    }

    fn bytes(&self) -> &[u8] {
        &self.data[self.start..self.end]
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data[self.start..self.end]
    }
}

/// One logical packet: a chain of segments.
///
/// The cached total length always equals the sum of the segment
/// lengths; every mutator maintains it.
pub struct NetBuf {
    pool: NetBufPool,
    segs: VecDeque<Seg>,
    total: usize,
    flags: NetBufFlags,
}

impl fmt::Debug for NetBuf {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("NetBuf")
            .field("len", &self.total)
            .field("segs", &self.segs.len())
            .field("flags", &self.flags)
            .finish()
    }
}

impl NetBuf {
    fn push_seg(&mut self, seg: Seg) {
        self.total += seg.len();
        self.segs.push_back(seg);
    }

    #[inline]
    fn check_len(&self) {
        debug_assert_eq!(
            self.total,
            self.segs.iter().map(Seg::len).sum::<usize>()
        );
    }

    fn too_short(&self, need: usize) -> Result<(), NetBufError> {
        if need > self.total {
            return Err(NetBufError::TooShort { need, have: self.total });
        }

        Ok(())
    }

    /// Total number of bytes in the packet.
    pub fn len(&self) -> usize {
        self.total
    }

    pub fn is_empty(&self) -> bool {
        self.total == 0
    }

    pub fn seg_count(&self) -> usize {
        self.segs.len()
    }

    /// Iterate the data of each segment in order.
    pub fn segs(&self) -> impl Iterator<Item = &[u8]> {
        self.segs.iter().map(Seg::bytes)
    }

    pub fn flags(&self) -> NetBufFlags {
        self.flags
    }

    pub fn set_flags(&mut self, flags: NetBufFlags) {
        self.flags = flags;
    }

    pub fn flags_mut(&mut self) -> &mut NetBufFlags {
        &mut self.flags
    }

    pub fn pool(&self) -> &NetBufPool {
        &self.pool
    }

    /// Grow the packet by `n` bytes at the front and return them.
    ///
    /// The first segment's headroom is used when it is large enough;
    /// otherwise a new segment is chained in front.
    pub fn prepend(&mut self, n: usize) -> Result<&mut [u8], NetBufError> {
        let fits = self.segs.front().is_some_and(|s| s.start >= n);

        if fits {
            self.segs[0].start -= n;
        } else {
            let seg = self.pool.seg(0, n)?;
            self.segs.push_front(seg);
        }

        self.total += n;
        self.check_len();
        let s = &mut self.segs[0];
        Ok(&mut s.data[s.start..s.start + n])
    }

    pub fn prepend_bytes(&mut self, bytes: &[u8]) -> Result<(), NetBufError> {
        self.prepend(bytes.len())?.copy_from_slice(bytes);
        Ok(())
    }

    /// Concatenate `other` onto the end of `self`. No data is copied.
    pub fn append(&mut self, mut other: NetBuf) {
        self.total += other.total;
        other.total = 0;
        self.segs.append(&mut other.segs);
        self.check_len();
    }

    /// Append a copy of `data` as a new segment.
    pub fn extend_from_slice(
        &mut self,
        data: &[u8],
    ) -> Result<(), NetBufError> {
        let mut seg = self.pool.seg(0, data.len())?;
        seg.bytes_mut().copy_from_slice(data);
        self.push_seg(seg);
        Ok(())
    }

    /// Remove `n` bytes from the front of the packet.
    pub fn trim_front(&mut self, n: usize) -> Result<(), NetBufError> {
        self.too_short(n)?;
        let mut left = n;

        while left > 0 {
            let Some(front) = self.segs.front_mut() else { break };
            let len = front.len();

            if len <= left {
                left -= len;
                self.segs.pop_front();
            } else {
                front.start += left;
                left = 0;
            }
        }

        self.total -= n;
        self.check_len();
        Ok(())
    }

    /// Shorten the packet to `len` bytes. Does nothing if the packet
    /// is already that short.
    pub fn truncate(&mut self, len: usize) {
        if len >= self.total {
            return;
        }

        let mut keep = len;
        let mut idx = 0;

        while idx < self.segs.len() {
            let seg = &mut self.segs[idx];
            let seg_len = seg.len();
            idx += 1;

            if keep <= seg_len {
                seg.end = seg.start + keep;
                break;
            }

            keep -= seg_len;
        }

        self.segs.truncate(idx);
        while self.segs.back().is_some_and(|s| s.len() == 0) {
            self.segs.pop_back();
        }
        self.total = len;
        self.check_len();
    }

    /// Split the packet at `at`: `self` keeps `[0, at)` and the
    /// returned packet holds `[at, len)`.
    ///
    /// Whole segments are moved; only a segment straddling `at` has
    /// its tail copied. On failure `self` is unchanged.
    pub fn split_off(&mut self, at: usize) -> Result<NetBuf, NetBufError> {
        self.too_short(at)?;
        let mut tail = self.pool.empty();
        tail.flags = self.flags;

        let mut off = at;
        let mut idx = 0;
        while idx < self.segs.len() {
            let len = self.segs[idx].len();
            if off < len {
                break;
            }
            off -= len;
            idx += 1;
        }

        if idx < self.segs.len() && off > 0 {
            let part_len = self.segs[idx].len() - off;
            let mut seg = self.pool.seg(0, part_len)?;
            seg.bytes_mut().copy_from_slice(&self.segs[idx].bytes()[off..]);
            let cut = &mut self.segs[idx];
            cut.end = cut.start + off;
            tail.push_seg(seg);
            idx += 1;
        }

        for seg in self.segs.split_off(idx) {
            tail.push_seg(seg);
        }

        self.total = at;
        self.check_len();
        tail.check_len();
        Ok(tail)
    }

    /// Make the first `n` bytes contiguous and return them.
    ///
    /// If the first segment is too short, its data and as many
    /// following bytes as needed are copied into a fresh segment that
    /// keeps the original headroom.
    pub fn pullup(&mut self, n: usize) -> Result<&mut [u8], NetBufError> {
        self.too_short(n)?;

        let first_len = self.segs.front().map_or(0, Seg::len);
        if first_len < n {
            let headroom = self.segs.front().map_or(0, |s| s.start);
            let mut seg = self.pool.seg(headroom, n)?;
            self.copy_out(0, seg.bytes_mut())?;
            self.trim_front(n)?;
            self.segs.push_front(seg);
            self.total += n;
            self.check_len();
        }

        if n == 0 {
            return Ok(&mut []);
        }

        Ok(&mut self.segs[0].bytes_mut()[..n])
    }

    /// The first segment's data; empty for an empty packet.
    pub fn front(&self) -> &[u8] {
        self.segs.front().map_or(&[][..], Seg::bytes)
    }

    /// Copy `dst.len()` bytes starting at `off` into `dst`.
    pub fn copy_out(
        &self,
        off: usize,
        dst: &mut [u8],
    ) -> Result<(), NetBufError> {
        self.too_short(off + dst.len())?;
        let mut skip = off;
        let mut pos = 0;

        for seg in self.segs() {
            if pos == dst.len() {
                break;
            }

            if skip >= seg.len() {
                skip -= seg.len();
                continue;
            }

            let avail = &seg[skip..];
            skip = 0;
            let n = avail.len().min(dst.len() - pos);
            dst[pos..pos + n].copy_from_slice(&avail[..n]);
            pos += n;
        }

        Ok(())
    }

    /// Overwrite the bytes at `off` with `src`.
    pub fn copy_in(&mut self, off: usize, src: &[u8]) -> Result<(), NetBufError> {
        self.too_short(off + src.len())?;
        let mut skip = off;
        let mut pos = 0;

        for seg in self.segs.iter_mut() {
            if pos == src.len() {
                break;
            }

            let data = seg.bytes_mut();
            if skip >= data.len() {
                skip -= data.len();
                continue;
            }

            let avail = &mut data[skip..];
            skip = 0;
            let n = avail.len().min(src.len() - pos);
            avail[..n].copy_from_slice(&src[pos..pos + n]);
            pos += n;
        }

        Ok(())
    }

    /// Return the byte at `off`, if there is one.
    pub fn byte_at(&self, off: usize) -> Option<u8> {
        let mut b = [0u8; 1];
        self.copy_out(off, &mut b).ok()?;
        Some(b[0])
    }

    /// Copy `[off, off + len)` into a new packet with `headroom`
    /// reserved in front.
    pub fn copy_range(
        &self,
        headroom: usize,
        off: usize,
        len: usize,
    ) -> Result<NetBuf, NetBufError> {
        self.too_short(off + len)?;
        let mut nb = self.pool.alloc_with_headroom(headroom, len)?;
        self.copy_out(off, &mut nb.segs[0].bytes_mut()[..])?;
        nb.flags = self.flags;
        Ok(nb)
    }

    /// Copy the whole packet into one fresh segment.
    pub fn try_clone(&self) -> Result<NetBuf, NetBufError> {
        self.copy_range(0, 0, self.total)
    }

    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.total);
        for seg in self.segs() {
            out.extend_from_slice(seg);
        }
        out
    }
}
