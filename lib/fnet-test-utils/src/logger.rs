// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! A stderr logger for the `fnet` target.
//!
//! Off unless `FNET_LOG` is set in the environment; `FNET_LOG=debug`
//! shows every drop reason the engine records.

use log::Level;
use log::LevelFilter;
use log::Metadata;
use log::Record;
use std::sync::Once;

static LOGGER: StderrLogger = StderrLogger;
static INIT: Once = Once::new();

struct StderrLogger;

impl log::Log for StderrLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= Level::Debug
            && metadata.target() == fnet::engine::LOG_TARGET
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            eprintln!("[{}] {}", record.level(), record.args());
        }
    }

    fn flush(&self) {}
}

/// Install the logger once per process.
pub fn init() {
    INIT.call_once(|| {
        let level = match std::env::var("FNET_LOG").as_deref() {
            Ok("debug") => LevelFilter::Debug,
            Ok(_) => LevelFilter::Warn,
            Err(_) => LevelFilter::Off,
        };

        if log::set_logger(&LOGGER).is_ok() {
            log::set_max_level(level);
        }
    });
}
