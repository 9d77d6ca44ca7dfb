// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Per-process CLI configuration (`SPEC_FULL.md` §2.3): flags with
//! `CRYO_`-prefixed env fallbacks, matching `MuxConfig`'s
//! `--host`/`COOP_MUX_HOST` pattern.

use std::path::PathBuf;
use std::time::Duration;

/// Shared configuration for the four serial instrument agents.
#[derive(Debug, Clone, clap::Args)]
pub struct AgentArgs {
    /// Serial device path, e.g. `/dev/ttyUSB0`.
    #[arg(long, env = "CRYO_PORT")]
    pub port: String,

    /// Serial baud rate.
    #[arg(long, default_value_t = 9600, env = "CRYO_BAUD_RATE")]
    pub baud_rate: u32,

    /// Per-query serial timeout in milliseconds.
    #[arg(long, default_value_t = 500, env = "CRYO_SERIAL_TIMEOUT_MS")]
    pub serial_timeout_ms: u64,

    /// Monitor loop poll interval in milliseconds.
    #[arg(long, default_value_t = 1000, env = "CRYO_MONITOR_INTERVAL_MS")]
    pub monitor_interval_ms: u64,

    /// Store connection URL, e.g. `redis://127.0.0.1:6379`.
    #[arg(long, default_value = "redis://127.0.0.1:6379", env = "CRYO_STORE_URL")]
    pub store_url: String,
}

impl From<AgentArgs> for cryo_instrument::AgentConfig {
    fn from(args: AgentArgs) -> Self {
        cryo_instrument::AgentConfig {
            port: args.port,
            baud_rate: args.baud_rate,
            serial_timeout: Duration::from_millis(args.serial_timeout_ms),
            monitor_interval: Duration::from_millis(args.monitor_interval_ms),
            store_url: args.store_url,
        }
    }
}

/// Configuration for the magnet cooldown state machine process.
#[derive(Debug, Clone, clap::Args)]
pub struct MagnetArgs {
    /// Store connection URL.
    #[arg(long, default_value = "redis://127.0.0.1:6379", env = "CRYO_STORE_URL")]
    pub store_url: String,

    /// State machine tick interval in milliseconds (`sim960Agent.py`'s
    /// `LOOP_INTERVAL`).
    #[arg(long, default_value_t = 1000, env = "CRYO_MAGNET_TICK_INTERVAL_MS")]
    pub tick_interval_ms: u64,

    /// Quench detector poll interval in milliseconds (`quenchAgent.py`'s
    /// `LOOP_INTERVAL`).
    #[arg(long, default_value_t = 100, env = "CRYO_QUENCH_POLL_INTERVAL_MS")]
    pub quench_poll_interval_ms: u64,

    /// Use the residual-fit quench detector instead of the default
    /// debounced-slope detector (`spec.md` §9: "only one should be active
    /// in a deployment").
    #[arg(long, env = "CRYO_RESIDUAL_DETECTOR")]
    pub residual_detector: bool,

    /// Rolling window size for the slope detector.
    #[arg(long, default_value_t = 30, env = "CRYO_QUENCH_NPOINTS")]
    pub quench_npoints: usize,

    /// Fastest allowed commanded ramp/deramp rate, in amps/second.
    #[arg(long, default_value_t = 0.005, env = "CRYO_MAX_CURRENT_SLOPE")]
    pub max_current_slope: f64,

    /// Device temperature (K) at or below which PID regulation may engage.
    #[arg(long, default_value_t = 0.5, env = "CRYO_MAX_REGULATE_TEMP")]
    pub max_regulate_temp: f64,

    /// Path to the persisted-state resume file.
    #[arg(long, default_value = "./magnetstate.txt", env = "CRYO_MAGNET_STATEFILE")]
    pub statefile: PathBuf,
}
