// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The SIM960 PID analog controller agent.
//!
//! Grounded on `devices.py`'s `SIM960` class: `MMON?` reports the input
//! monitor voltage fed from the bridge, `OMON?` reports the output voltage
//! (manual `MOUT` or closed-loop `P(e + I·∫e + D·de/dt) + offset`).

use cryo_store::schema::Command;

use crate::error::Error;
use crate::mainframe;
use crate::runtime::{Instrument, MonitoredRead};
use crate::serial::SerialChannel;

const OWNED_SETTINGS: &[&str] = &[
    "device-settings:sim960:vout-min-limit",
    "device-settings:sim960:vout-max-limit",
    "device-settings:sim960:pid-p:enabled",
    "device-settings:sim960:pid-i:enabled",
    "device-settings:sim960:pid-d:enabled",
    "device-settings:sim960:pid-offset:enabled",
    "device-settings:sim960:pid-p:value",
    "device-settings:sim960:pid-i:value",
    "device-settings:sim960:pid-d:value",
    "device-settings:sim960:pid-offset:value",
    "device-settings:sim960:vin-setpoint-mode",
    "device-settings:sim960:vin-setpoint",
    "device-settings:sim960:vin-setpoint-slew-enable",
    "device-settings:sim960:vin-setpoint-slew-rate",
];

/// The SIM960 agent. The magnet state machine drives this agent's setpoint
/// and mode directly through the command bus, same as any other caller.
#[derive(Default)]
pub struct Pid;

impl Pid {
    pub fn new() -> Self {
        Self
    }

    /// Whether the controller is currently in closed-loop (PID) mode —
    /// `vin-setpoint-mode == internal` with P, I, or D enabled
    /// (`spec.md` §4.2 `regulating`/`cooling` guards reference this).
    pub async fn closed_loop(&self, channel: &SerialChannel) -> Result<bool, Error> {
        let p = channel.query("PCTL?").await?;
        let i = channel.query("ICTL?").await?;
        let d = channel.query("DCTL?").await?;
        Ok(p == "1" || i == "1" || d == "1")
    }
}

#[async_trait::async_trait]
impl Instrument for Pid {
    fn device(&self) -> &'static str {
        "sim960"
    }

    fn behind_mainframe(&self) -> bool {
        true
    }

    async fn identify(&self, channel: &SerialChannel) -> Result<mainframe::Identity, Error> {
        mainframe::connect_and_identify(channel, "SIM960").await
    }

    fn owned_settings(&self) -> &'static [&'static str] {
        OWNED_SETTINGS
    }

    fn blocked_in_state(&self, state: &str) -> &'static [&'static str] {
        match state {
            "regulating" => &["device-settings:sim960:vin-setpoint"],
            "ramping" | "soaking" | "cooling" | "deramping" => &[
                "device-settings:sim960:pid-p:enabled",
                "device-settings:sim960:pid-i:enabled",
                "device-settings:sim960:pid-d:enabled",
            ],
            _ => &[],
        }
    }

    async fn apply(&self, channel: &SerialChannel, cmd: &Command) -> Result<Vec<(String, String)>, Error> {
        channel.send(cmd.wire_string()).await?;
        Ok(Vec::new())
    }

    async fn read_setting(&self, channel: &SerialChannel, setting: &str) -> Result<String, Error> {
        let query = match setting {
            "device-settings:sim960:vout-min-limit" => "LLIM?",
            "device-settings:sim960:vout-max-limit" => "ULIM?",
            "device-settings:sim960:pid-p:enabled" => "PCTL?",
            "device-settings:sim960:pid-i:enabled" => "ICTL?",
            "device-settings:sim960:pid-d:enabled" => "DCTL?",
            "device-settings:sim960:pid-offset:enabled" => "OCTL?",
            "device-settings:sim960:pid-p:value" => "GAIN?",
            "device-settings:sim960:pid-i:value" => "INTG?",
            "device-settings:sim960:pid-d:value" => "DERV?",
            "device-settings:sim960:pid-offset:value" => "OFST?",
            "device-settings:sim960:vin-setpoint-mode" => "INPT?",
            "device-settings:sim960:vin-setpoint" => "SETP?",
            "device-settings:sim960:vin-setpoint-slew-enable" => "RAMP?",
            "device-settings:sim960:vin-setpoint-slew-rate" => "RATE?",
            other => return Err(Error::Protocol(format!("no read-back query for {other:?}"))),
        };
        channel.query(query).await
    }

    fn monitored_reads(&self) -> Vec<MonitoredRead> {
        vec![
            MonitoredRead { label: "input-voltage", key: "status:magnet:input-voltage".to_owned() },
            MonitoredRead { label: "output-voltage", key: "status:magnet:output-voltage".to_owned() },
        ]
    }

    async fn poll(&self, channel: &SerialChannel, read: &MonitoredRead) -> Option<Vec<(String, String)>> {
        let value = match read.label {
            "input-voltage" => channel.query("MMON?").await.ok()?,
            "output-voltage" => channel.query("OMON?").await.ok()?,
            _ => return None,
        };
        Some(vec![(read.key.clone(), value)])
    }
}
