// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Reusable serial instrument-agent runtime (`spec.md` §4.1).
//!
//! Concrete instruments (the resistance bridge, the PID controller, the
//! current/heat-switch microcontroller, the HEMT bias monitor) implement
//! [`runtime::Instrument`] and hand themselves to [`runtime::run`].

pub mod bridge;
pub mod current;
pub mod error;
pub mod hemt;
pub mod mainframe;
pub mod pid;
pub mod runtime;
pub mod serial;

pub use error::Error;
pub use runtime::{AgentConfig, Instrument, MonitoredRead};
pub use serial::SerialChannel;
