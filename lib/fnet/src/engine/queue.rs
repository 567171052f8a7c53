// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The hand-off between the receive ISR and the deferred context.
//!
//! Link drivers call [`InputHandle::ip4_input()`] or
//! [`InputHandle::ip6_input()`] from interrupt context. The packet is
//! appended to a byte-bounded [`InputQueue`] under an [`IsrLock`] and
//! the soft interrupt is raised. Later, the main loop calls
//! [`Stack::poll()`], which drains every queued packet before
//! returning.
//!
//! [`Stack::poll()`]: crate::engine::stack::Stack::poll

use super::netif::NetifId;
use crate::sys::netbuf::NetBuf;
use crate::sys::sync::IrqControl;
use crate::sys::sync::IsrLock;
use alloc::collections::VecDeque;
use alloc::sync::Arc;
use core::sync::atomic::AtomicBool;
use core::sync::atomic::AtomicU64;
use core::sync::atomic::Ordering;
use fnet_api::Error;

/// Something that wakes the deferred context.
///
/// An RTOS port posts an event flag here; a bare-metal superloop can
/// pass `None` to [`Stack::new()`] and just call [`Stack::poll()`]
/// every time around.
///
/// [`Stack::new()`]: crate::engine::stack::Stack::new
/// [`Stack::poll()`]: crate::engine::stack::Stack::poll
pub trait EventSignal: Send + Sync {
    fn raise(&self);
}

/// A one-shot pending flag: raised from interrupt context, taken by
/// the deferred context.
#[derive(Debug, Default)]
pub struct SoftIrq {
    pending: AtomicBool,
}

impl SoftIrq {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        self.pending.store(true, Ordering::Release);
    }

    /// Clear the flag, returning whether it was set.
    pub fn take(&self) -> bool {
        self.pending.swap(false, Ordering::AcqRel)
    }
}

impl EventSignal for SoftIrq {
    fn raise(&self) {
        SoftIrq::raise(self);
    }
}

#[derive(Default)]
struct QueueInner {
    pkts: VecDeque<(NetifId, NetBuf)>,
    bytes: usize,
}

/// A FIFO of received packets bounded by total byte count.
pub struct InputQueue {
    inner: IsrLock<QueueInner>,
    limit: usize,
    drops: AtomicU64,
}

impl InputQueue {
    pub fn new(irq: Arc<dyn IrqControl>, limit: usize) -> Self {
        Self {
            inner: IsrLock::new(irq, QueueInner::default()),
            limit,
            drops: AtomicU64::new(0),
        }
    }

    /// Append `pkt` received on `netif`.
    ///
    /// If the byte budget would be exceeded the packet is dropped and
    /// `NoMem` returned.
    pub fn enqueue(&self, netif: NetifId, pkt: NetBuf) -> Result<(), Error> {
        let len = pkt.len();
        let rejected = {
            let mut q = self.inner.lock();
            if q.bytes + len > self.limit {
                Some(pkt)
            } else {
                q.bytes += len;
                q.pkts.push_back((netif, pkt));
                None
            }
        };

        // The rejected packet is freed outside the critical section.
        if rejected.is_some() {
            self.drops.fetch_add(1, Ordering::Relaxed);
            return Err(Error::NoMem);
        }

        Ok(())
    }

    /// Pop the oldest packet.
    pub fn dequeue(&self) -> Option<(NetifId, NetBuf)> {
        let mut q = self.inner.lock();
        let (netif, pkt) = q.pkts.pop_front()?;
        q.bytes -= pkt.len();
        Some((netif, pkt))
    }

    /// Free every queued packet, returning how many there were.
    pub fn drain(&self) -> usize {
        let pkts = {
            let mut q = self.inner.lock();
            q.bytes = 0;
            core::mem::take(&mut q.pkts)
        };

        pkts.len()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().pkts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes currently queued.
    pub fn bytes(&self) -> usize {
        self.inner.lock().bytes
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Packets refused for lack of budget since creation.
    pub fn drops(&self) -> u64 {
        self.drops.load(Ordering::Relaxed)
    }
}

/// The driver-facing side of a stack: cheap to clone, safe to use from
/// interrupt context.
#[derive(Clone)]
pub struct InputHandle {
    ip4: Arc<InputQueue>,
    ip6: Arc<InputQueue>,
    soft: Arc<SoftIrq>,
    event: Option<Arc<dyn EventSignal>>,
}

impl InputHandle {
    pub(crate) fn new(
        ip4: Arc<InputQueue>,
        ip6: Arc<InputQueue>,
        soft: Arc<SoftIrq>,
        event: Option<Arc<dyn EventSignal>>,
    ) -> Self {
        Self { ip4, ip6, soft, event }
    }

    fn kick(&self) {
        self.soft.raise();
        if let Some(ev) = &self.event {
            ev.raise();
        }
    }

    /// Queue an IPv4 packet received on `netif`. Dropped silently when
    /// the queue is full.
    pub fn ip4_input(&self, netif: NetifId, pkt: NetBuf) {
        match self.ip4.enqueue(netif, pkt) {
            Ok(()) => self.kick(),
            Err(_) => super::dbg!("ip4 input queue full"),
        }
    }

    /// Queue an IPv6 packet received on `netif`. Dropped silently when
    /// the queue is full.
    pub fn ip6_input(&self, netif: NetifId, pkt: NetBuf) {
        match self.ip6.enqueue(netif, pkt) {
            Ok(()) => self.kick(),
            Err(_) => super::dbg!("ip6 input queue full"),
        }
    }
}
