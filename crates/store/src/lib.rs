// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Shared state & command bus abstraction over an external key/value store.
//!
//! `Store` is the only way any agent talks to the rest of the system:
//! telemetry, device configuration, and cross-agent coordination all flow
//! through plain keys, timeseries keys, and pub/sub channels backed by a
//! Redis-compatible server (with the RedisTimeSeries module loaded).

pub mod calibration;
pub mod error;
pub mod keys;
pub mod schema;
mod store;

pub use error::StoreError;
pub use store::{now_millis, ReadValue, Store};
