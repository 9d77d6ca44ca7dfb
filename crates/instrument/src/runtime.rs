// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The reusable instrument-agent runtime: identity handshake (+ mainframe
//! walk), initialization callback, monitor loop, and command listener
//! (`spec.md` §4.1).
//!
//! Any instrument plugs in by implementing [`Instrument`]; `run` then drives
//! the full lifecycle the way every agent in the original source repeats by
//! hand (`sim921Agent.py`, `sim960Agent.py`, `currentduinoAgent.py`).

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use cryo_store::schema::Command;
use cryo_store::{keys, ReadValue, Store};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::Error;
use crate::mainframe;
use crate::serial::SerialChannel;

/// One polled quantity for the monitor loop: a human label and a fallible read.
pub struct MonitoredRead {
    pub label: &'static str,
    pub key: String,
}

/// The behavior a concrete instrument (bridge, PID, currentduino, HEMT)
/// plugs into the shared runtime.
#[async_trait]
pub trait Instrument: Send + Sync {
    /// Canonical device name, e.g. `"sim921"`; also the schema key prefix
    /// and the expected `*IDN?` model string.
    fn device(&self) -> &'static str;

    /// Whether this instrument sits behind a SIM900 mainframe.
    fn behind_mainframe(&self) -> bool {
        false
    }

    /// Connect and perform this instrument's identification handshake
    /// (`spec.md` §4.1). SIM-style instruments delegate to
    /// [`crate::mainframe::connect_and_identify`]; simpler microcontrollers
    /// implement their own lighter-weight version query.
    async fn identify(&self, channel: &SerialChannel) -> Result<mainframe::Identity, Error>;

    /// Settings this agent owns: subscribed on the command bus and pulled
    /// during initialization.
    fn owned_settings(&self) -> &'static [&'static str];

    /// Any additional command topics beyond `owned_settings` (e.g. a
    /// composite setting spanning multiple devices).
    fn extra_command_topics(&self) -> &'static [&'static str] {
        &[]
    }

    /// Apply an already-validated command to the instrument: send the wire
    /// string(s) and perform any composite/derived sends. Returns any extra
    /// store writes the application observed beyond the setting's own key
    /// (e.g. the currentduino's confirmed heat-switch position landing in
    /// `status:heatswitch` rather than in the setting key itself).
    async fn apply(&self, channel: &SerialChannel, cmd: &Command) -> Result<Vec<(String, String)>, Error>;

    /// Settings blocked in the given magnet state (`spec.md` §4.3).
    fn blocked_in_state(&self, _state: &str) -> &'static [&'static str] {
        &[]
    }

    /// Re-read a setting's current value directly from the hardware, used
    /// for the read-back that keeps the store in sync when a command is
    /// blocked (`spec.md` §4.3: "trigger a settings read-back so the store
    /// tracks the unchanged hardware value").
    async fn read_setting(&self, channel: &SerialChannel, setting: &str) -> Result<String, Error>;

    /// Quantities to poll on the monitor loop.
    fn monitored_reads(&self) -> Vec<MonitoredRead> {
        Vec::new()
    }

    /// Store keys among `monitored_reads` that the monitor loop writes as
    /// timeseries samples rather than plain keys (`spec.md` §2: "Bias-monitor
    /// agent ... writes timeseries"). Declared via `create_ts` before the
    /// monitor loop starts.
    fn timeseries_keys(&self) -> Vec<String> {
        Vec::new()
    }

    /// Perform one read from the instrument, returning the store key/value
    /// pairs it produced (more than one for a single batched query such as
    /// the HEMT monitor's). A `None` substitutes for a per-read I/O error
    /// (`spec.md` §4.1 monitor loop: "substituting null on per-read I/O error").
    async fn poll(&self, channel: &SerialChannel, read: &MonitoredRead) -> Option<Vec<(String, String)>>;
}

/// Static configuration for one agent process.
pub struct AgentConfig {
    pub port: String,
    pub baud_rate: u32,
    pub serial_timeout: Duration,
    pub monitor_interval: Duration,
    pub store_url: String,
}

/// Run an instrument agent to completion (or until `shutdown` fires).
///
/// Mirrors the five steps every `*Agent.py` performs at module scope:
/// connect, identify (+ mainframe walk), initialize settings, then run the
/// monitor loop and command listener concurrently.
pub async fn run(instrument: impl Instrument + 'static, config: AgentConfig, shutdown: CancellationToken) -> Result<(), Error> {
    let device = instrument.device();
    let store = Store::connect(&config.store_url).await?;
    let channel = SerialChannel::open(&config.port, config.baud_rate, config.serial_timeout);

    let identity = match instrument.identify(&channel).await {
        Ok(identity) => identity,
        Err(e) => {
            store
                .store(&[
                    (keys::device_status(device, "model").as_str(), ""),
                    (keys::device_status(device, "firmware").as_str(), ""),
                    (keys::device_status(device, "sn").as_str(), ""),
                    (keys::device_status(device, "status").as_str(), &format!("Error {e}")),
                ])
                .await?;
            return Err(e);
        }
    };
    info!(device, model = %identity.model, firmware = %identity.firmware, "instrument identified");

    store
        .store(&[
            (keys::device_status(device, "model").as_str(), &identity.model),
            (keys::device_status(device, "firmware").as_str(), &identity.firmware),
            (keys::device_status(device, "sn").as_str(), &identity.serial_number),
            (keys::device_status(device, "status").as_str(), "OK"),
        ])
        .await?;

    let ts_keys = instrument.timeseries_keys();
    if !ts_keys.is_empty() {
        let refs: Vec<&str> = ts_keys.iter().map(String::as_str).collect();
        store.create_ts(&refs).await?;
    }

    initialize_settings(&instrument, &store, &channel).await?;

    let monitor = monitor_loop(&instrument, &store, &channel, config.monitor_interval, shutdown.clone());
    let listener = command_listener(&instrument, &store, &channel, shutdown.clone());

    tokio::select! {
        res = monitor => res?,
        res = listener => res?,
        _ = shutdown.cancelled() => {}
    }

    if instrument.behind_mainframe() {
        mainframe::exit_mainframe(&channel).await?;
    }
    Ok(())
}

/// Pull every owned setting from the store and send it, in declaration
/// order (`spec.md` §5 "settings are applied in schema declaration order").
/// A missing setting is fatal (`spec.md` §4.1 initialization callback).
async fn initialize_settings(instrument: &(impl Instrument + ?Sized), store: &Store, channel: &SerialChannel) -> Result<(), Error> {
    for &setting in instrument.owned_settings() {
        let found = store.read(&[setting], true).await?;
        let Some((_, value)) = found.into_iter().next() else {
            continue;
        };
        let raw = match value {
            ReadValue::Plain(v) => v,
            ReadValue::Timeseries { value, .. } => value.to_string(),
        };
        let cmd = Command::new(setting, &raw)?;
        let extra = instrument.apply(channel, &cmd).await?;
        let extra_pairs: Vec<(&str, &str)> = extra.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
        if !extra_pairs.is_empty() {
            store.store(&extra_pairs).await?;
        }
        debug!(setting, value = %raw, "applied initial setting");
    }
    Ok(())
}

async fn monitor_loop(
    instrument: &(impl Instrument + ?Sized),
    store: &Store,
    channel: &SerialChannel,
    interval: Duration,
    shutdown: CancellationToken,
) -> Result<(), Error> {
    let reads = instrument.monitored_reads();
    if reads.is_empty() {
        shutdown.cancelled().await;
        return Ok(());
    }
    let ts_keys: HashSet<String> = instrument.timeseries_keys().into_iter().collect();
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            _ = ticker.tick() => {}
        }
        let mut samples = Vec::with_capacity(reads.len());
        for read in &reads {
            if let Some(batch) = instrument.poll(channel, read).await {
                samples.extend(batch);
            }
        }
        let mut plain_pairs = Vec::with_capacity(samples.len());
        for (key, value) in &samples {
            if ts_keys.contains(key) {
                match value.parse::<f64>() {
                    Ok(v) => {
                        if let Err(e) = store.store_ts(key, v).await {
                            warn!(err = %e, key, "monitor loop timeseries write failed");
                        }
                    }
                    Err(_) => warn!(key, value, "timeseries sample not numeric, dropped"),
                }
            } else {
                plain_pairs.push((key.as_str(), value.as_str()));
            }
        }
        if !plain_pairs.is_empty() {
            if let Err(e) = store.store(&plain_pairs).await {
                warn!(err = %e, "monitor loop store write failed");
            }
        }
    }
}

async fn command_listener(
    instrument: &(impl Instrument + ?Sized),
    store: &Store,
    channel: &SerialChannel,
    shutdown: CancellationToken,
) -> Result<(), Error> {
    let device = instrument.device();
    let topics: HashSet<String> = instrument
        .owned_settings()
        .iter()
        .chain(instrument.extra_command_topics())
        .map(|t| keys::command_topic(t))
        .collect();
    if topics.is_empty() {
        shutdown.cancelled().await;
        return Ok(());
    }

    let channels: Vec<String> = topics.into_iter().collect();
    let mut deliveries = std::pin::pin!(store.listen(channels).await?);

    loop {
        use futures_util::StreamExt;
        let delivery = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            d = deliveries.next() => d,
        };
        let Some(delivery) = delivery else { return Ok(()) };
        let Some(setting) = keys::strip_command_prefix(&delivery.channel) else { continue };

        let cmd = match Command::new(setting, &delivery.payload) {
            Ok(cmd) => cmd,
            Err(e) => {
                warn!(setting, value = %delivery.payload, err = %e, "rejected command");
                continue;
            }
        };

        let magnet_state = current_magnet_state(store).await;
        if instrument.blocked_in_state(&magnet_state).contains(&setting) {
            warn!(setting, state = %magnet_state, "command blocked in current magnet state");
            match instrument.read_setting(channel, setting).await {
                Ok(actual) => {
                    if let Err(e) = store.store(&[(setting, &actual)]).await {
                        warn!(setting, err = %e, "block-list read-back store write failed");
                    }
                }
                Err(e) => warn!(setting, err = %e, "block-list read-back failed"),
            }
            continue;
        }

        let outcome = instrument.apply(channel, &cmd).await;
        match outcome {
            Ok(extra) => {
                if let Err(e) = store.store(&[(setting, &cmd.value)]).await {
                    warn!(setting, err = %e, "command echo store write failed");
                }
                let extra_pairs: Vec<(&str, &str)> = extra.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
                if !extra_pairs.is_empty() {
                    if let Err(e) = store.store(&extra_pairs).await {
                        warn!(setting, err = %e, "command extra-writes store write failed");
                    }
                }
                if let Err(e) = store.store(&[(keys::device_status(device, "status").as_str(), "OK")]).await {
                    warn!(setting, err = %e, "device status store write failed");
                }
            }
            Err(e) => {
                warn!(setting, err = %e, "command apply failed");
                if let Err(store_err) = store
                    .store(&[(keys::device_status(device, "status").as_str(), &format!("Error {e}"))])
                    .await
                {
                    warn!(setting, err = %store_err, "device error status store write failed");
                }
            }
        }
    }
}

/// Read the magnet state machine's current state, defaulting to empty (not
/// blocked) when unavailable — a missing magnet agent must not wedge every
/// other agent's command listener.
async fn current_magnet_state(store: &Store) -> String {
    match store.read(&[keys::status("magnet", "state").as_str()], false).await {
        Ok(found) => found
            .into_iter()
            .next()
            .map(|(_, v)| match v {
                ReadValue::Plain(s) => s,
                ReadValue::Timeseries { value, .. } => value.to_string(),
            })
            .unwrap_or_default(),
        Err(_) => String::new(),
    }
}
