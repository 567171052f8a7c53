// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! A link driver that records what the stack asks of it.

use fnet::api::Error;
use fnet::api::Ipv4Addr;
use fnet::api::Ipv6Addr;
use fnet::engine::netif::NetifDriver;
use fnet::sys::netbuf::NetBuf;
use std::sync::Arc;
use std::sync::Mutex;

#[derive(Debug, Default)]
pub struct Capture {
    pub ip4: Vec<(Ipv4Addr, Vec<u8>)>,
    pub ip6: Vec<(Ipv6Addr, Vec<u8>)>,
    pub joins4: Vec<Ipv4Addr>,
    pub leaves4: Vec<Ipv4Addr>,
    pub joins6: Vec<Ipv6Addr>,
    pub leaves6: Vec<Ipv6Addr>,
    /// Refuse output with this error.
    pub fail: Option<Error>,
}

/// A capturing driver. Clones share one capture, so the test keeps a
/// clone after handing the driver to the stack.
#[derive(Clone, Debug, Default)]
pub struct MockDriver {
    cap: Arc<Mutex<Capture>>,
}

impl MockDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take every IPv4 datagram sent so far, with its next hop.
    pub fn take_ip4(&self) -> Vec<(Ipv4Addr, Vec<u8>)> {
        std::mem::take(&mut self.cap.lock().unwrap().ip4)
    }

    /// Take every IPv6 packet sent so far, with its destination.
    pub fn take_ip6(&self) -> Vec<(Ipv6Addr, Vec<u8>)> {
        std::mem::take(&mut self.cap.lock().unwrap().ip6)
    }

    pub fn joins4(&self) -> Vec<Ipv4Addr> {
        self.cap.lock().unwrap().joins4.clone()
    }

    pub fn leaves4(&self) -> Vec<Ipv4Addr> {
        self.cap.lock().unwrap().leaves4.clone()
    }

    pub fn joins6(&self) -> Vec<Ipv6Addr> {
        self.cap.lock().unwrap().joins6.clone()
    }

    pub fn leaves6(&self) -> Vec<Ipv6Addr> {
        self.cap.lock().unwrap().leaves6.clone()
    }

    pub fn set_fail(&self, fail: Option<Error>) {
        self.cap.lock().unwrap().fail = fail;
    }
}

impl NetifDriver for MockDriver {
    fn output_ip4(&mut self, next_hop: Ipv4Addr, pkt: NetBuf) -> Result<(), Error> {
        let mut cap = self.cap.lock().unwrap();
        if let Some(e) = cap.fail {
            return Err(e);
        }
        cap.ip4.push((next_hop, pkt.to_vec()));
        Ok(())
    }

    fn output_ip6(&mut self, dst: Ipv6Addr, pkt: NetBuf) -> Result<(), Error> {
        let mut cap = self.cap.lock().unwrap();
        if let Some(e) = cap.fail {
            return Err(e);
        }
        cap.ip6.push((dst, pkt.to_vec()));
        Ok(())
    }

    fn multicast_join4(&mut self, group: Ipv4Addr) {
        self.cap.lock().unwrap().joins4.push(group);
    }

    fn multicast_leave4(&mut self, group: Ipv4Addr) {
        self.cap.lock().unwrap().leaves4.push(group);
    }

    fn multicast_join6(&mut self, group: Ipv6Addr) {
        self.cap.lock().unwrap().joins6.push(group);
    }

    fn multicast_leave6(&mut self, group: Ipv6Addr) {
        self.cap.lock().unwrap().leaves6.push(group);
    }
}
