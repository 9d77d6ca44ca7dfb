// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Process wiring for the magnet controller binary: connects the store,
//! builds the [`Machine`], and drives its tick loop, quench-detector poll
//! loop, and external command listener concurrently (`spec.md` §4.2 "the
//! `__main__` tick loop", §6 "Command topics").
//!
//! Mirrors `sim960Agent.py`'s module-scope wiring: a `LOOP_INTERVAL`-paced
//! `next()` call, a `redis.listen` dispatch loop over the fixed command set
//! plus `event:quenching`, and `quenchAgent.py`'s own separate polling loop
//! feeding the detector — kept here as two independent `tokio::select!`
//! branches rather than two processes, since both already share one store
//! connection and one `Machine`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use cryo_store::{keys, Store};
use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::Error;
use crate::io::{MagnetIo, StoreIo, CURRENT_KEY};
use crate::machine::{Machine, MagnetConfig};
use crate::quench::{QuenchDetector, ResidualDetector, Sample, SlopeDetector};

pub const MAGNET_DEVICE: &str = "magnet";

/// How far back to look when seeding the quench detector from history at
/// startup (`quenchAgent.py`'s `MAX_STARTUP_LAG_TIME_SECONDS`).
const MAX_STARTUP_LAG_SECS: i64 = 600;

/// Which quench detector a deployment runs (`spec.md` §9: "only one should
/// be active in a deployment — surface as config").
#[derive(Debug, Clone, Copy)]
pub enum QuenchDetectorKind {
    Slope { npoints: usize },
    Residual,
}

fn build_detector(kind: QuenchDetectorKind, max_current_slope: f64) -> Box<dyn QuenchDetector> {
    match kind {
        QuenchDetectorKind::Slope { npoints } => Box::new(SlopeDetector::new(npoints, max_current_slope)),
        QuenchDetectorKind::Residual => Box::new(ResidualDetector::new()),
    }
}

pub struct RuntimeConfig {
    pub store_url: String,
    pub magnet: MagnetConfig,
    pub quench_poll_interval: Duration,
    pub quench_detector: QuenchDetectorKind,
}

/// Run the magnet controller to completion (or until `shutdown` fires).
pub async fn run(config: RuntimeConfig, shutdown: CancellationToken) -> Result<(), Error> {
    let store = Store::connect(&config.store_url).await?;
    let io = Arc::new(StoreIo::new(store.clone()));
    let machine = Arc::new(Machine::new(Arc::clone(&io), config.magnet.clone()).await);

    write_status(&store, machine.state().await).await;

    let tick = tick_loop(Arc::clone(&machine), &store, config.magnet.loop_interval, shutdown.clone());
    let quench = quench_loop(Arc::clone(&io), &store, config.quench_poll_interval, config.quench_detector, config.magnet.max_current_slope, shutdown.clone());
    let listener = command_listener(Arc::clone(&machine), &store, shutdown.clone());

    tokio::select! {
        res = tick => res,
        res = quench => res,
        res = listener => res,
        _ = shutdown.cancelled() => Ok(()),
    }
}

async fn write_status(store: &Store, state: crate::state::MagnetState) {
    if let Err(err) = store.store(&[(keys::status(MAGNET_DEVICE, "state").as_str(), state.as_str())]).await {
        warn!(%err, "failed to publish magnet state to store");
    }
}

async fn tick_loop<IO: MagnetIo + 'static>(machine: Arc<Machine<IO>>, store: &Store, interval: Duration, shutdown: CancellationToken) -> Result<(), Error> {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            _ = ticker.tick() => {}
        }
        machine.tick().await;
        write_status(store, machine.state().await).await;
    }
}

/// Polls the magnet current and feeds the configured quench detector,
/// publishing `event:quenching` the moment it fires (`spec.md` §4.4 step 5).
/// The actual `off` transition happens through [`command_listener`]'s own
/// subscription to that same topic, matching `sim960Agent.py`'s uniform
/// dispatch loop rather than calling `trigger_quench` from two places.
async fn quench_loop<IO: MagnetIo>(
    io: Arc<IO>,
    store: &Store,
    interval: Duration,
    detector_kind: QuenchDetectorKind,
    max_current_slope: f64,
    shutdown: CancellationToken,
) -> Result<(), Error> {
    let mut detector = build_detector(detector_kind, max_current_slope);
    seed_detector_from_history(store, detector.as_mut()).await;
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            _ = ticker.tick() => {}
        }
        let Ok(current_a) = io.read_current().await else { continue };
        let t_ms = cryo_store::now_millis();
        if detector.update(Sample { t_ms, current_a }) {
            info!(current_a, "quench detected");
            if let Err(err) = store.publish(&keys::event_topic("quenching"), &t_ms.to_string(), None).await {
                warn!(%err, "failed to publish event:quenching");
            }
        }
    }
}

/// Pre-loads the detector's window from recent history so a restarted
/// controller doesn't start blind (`quenchAgent.py`'s `initialize_data`,
/// which seeds via `redis.pcr_range` over the last
/// `MAX_STARTUP_LAG_TIME_SECONDS`).
async fn seed_detector_from_history(store: &Store, detector: &mut dyn QuenchDetector) {
    let now_ms = cryo_store::now_millis();
    let from_ms = now_ms - MAX_STARTUP_LAG_SECS * 1000;
    match store.range(CURRENT_KEY, from_ms, now_ms).await {
        Ok(samples) => {
            for (t_ms, current_a) in samples {
                detector.update(Sample { t_ms, current_a });
            }
        }
        Err(err) => warn!(%err, "failed to seed quench detector from history"),
    }
}

/// The external trigger listener: `get-cold`, `abort-cooldown`,
/// `be-cold-at`, `cancel-scheduled-cooldown`, and `event:quenching`
/// (`spec.md` §6 "Command topics").
async fn command_listener<IO: MagnetIo + 'static>(machine: Arc<Machine<IO>>, store: &Store, shutdown: CancellationToken) -> Result<(), Error> {
    let channels = vec![
        keys::command_topic("get-cold"),
        keys::command_topic("abort-cooldown"),
        keys::command_topic("be-cold-at"),
        keys::command_topic("cancel-scheduled-cooldown"),
        keys::event_topic("quenching"),
    ];
    let mut deliveries = std::pin::pin!(store.listen(channels).await?);

    loop {
        let delivery = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            d = deliveries.next() => d,
        };
        let Some(delivery) = delivery else { return Ok(()) };

        if delivery.channel == keys::command_topic("get-cold") {
            machine.trigger_start().await;
        } else if delivery.channel == keys::command_topic("abort-cooldown") {
            machine.trigger_abort().await;
        } else if delivery.channel == keys::command_topic("cancel-scheduled-cooldown") {
            machine.cancel_scheduled_cooldown().await;
        } else if delivery.channel == keys::command_topic("be-cold-at") {
            match delivery.payload.trim().parse::<u64>() {
                Ok(epoch_secs) => {
                    let target = unix_epoch_to_instant(epoch_secs);
                    if let Err(err) = machine.schedule_cooldown(target).await {
                        warn!(%err, "be-cold-at rejected");
                    }
                }
                Err(err) => warn!(%err, payload = %delivery.payload, "malformed be-cold-at payload"),
            }
        } else if delivery.channel == keys::event_topic("quenching") {
            machine.trigger_quench().await;
        }
    }
}

/// Converts a UNIX-epoch-seconds payload into a monotonic [`Instant`] by
/// measuring its offset from wall-clock now, since `schedule_cooldown`
/// works in monotonic time (`spec.md` §6: "payload: UNIX epoch seconds").
fn unix_epoch_to_instant(epoch_secs: u64) -> Instant {
    let now_wall = std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap_or_default().as_secs();
    let now = Instant::now();
    if epoch_secs >= now_wall {
        now + Duration::from_secs(epoch_secs - now_wall)
    } else {
        now.checked_sub(Duration::from_secs(now_wall - epoch_secs)).unwrap_or(now)
    }
}
