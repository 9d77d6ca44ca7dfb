// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The SIM921 AC resistance bridge agent.
//!
//! Grounded on `devices.py`'s `SIM921` class: `_simspecificconnect` enforces
//! `ATEM 0` (resistance-scaled output) and `EXON 1` (excitation on) before
//! any other operation, `TVAL?`/`RVAL?` read temperature/resistance, and
//! `output_voltage` branches on `AMAN?` between manual (`AOUT?`) and scaled
//! (`VOHM?` × `RDEV?`) output modes.

use cryo_store::calibration::{Curve, CurveType};
use cryo_store::schema::Command;

use crate::error::Error;
use crate::mainframe;
use crate::runtime::{Instrument, MonitoredRead};
use crate::serial::SerialChannel;

const OWNED_SETTINGS: &[&str] = &[
    "device-settings:sim921:resistance-range",
    "device-settings:sim921:excitation-value",
    "device-settings:sim921:excitation-mode",
    "device-settings:sim921:time-constant",
    "device-settings:sim921:temp-slope",
    "device-settings:sim921:resistance-slope",
    "device-settings:sim921:curve-number",
];

const EXTRA_TOPICS: &[&str] = &["device-settings:mkidarray:regulating-temp"];

/// MKID array temperature, also the magnet state machine's device-temp
/// input and a `quenchAgent.py` `TS_KEYS` member.
const TEMPERATURE_KEY: &str = "status:temps:mkidarray:temp";

/// The SIM921 agent. Carries the currently-loaded calibration curve so the
/// composite regulating-temperature command (handled jointly with the
/// PID agent) can convert a target temperature to a resistance setpoint.
pub struct Bridge {
    pub curve: Curve,
}

impl Bridge {
    pub fn new(curve: Curve) -> Self {
        Self { curve }
    }

    /// Verify the mandatory post-connect device state (`spec.md` §4.1
    /// initialization is schema-driven; this is instrument-specific
    /// hardware safety state the original enforces before anything else).
    pub async fn verify_connect_state(&self, channel: &SerialChannel) -> Result<(), Error> {
        channel.send("ATEM 0").await?;
        let atem = channel.query("ATEM?").await?;
        if atem != "0" {
            return Err(Error::Protocol(format!(
                "ATEM=0 failed, got {atem:?}; voltage scale must be resistance-proportional"
            )));
        }

        channel.send("EXON 1").await?;
        let exon = channel.query("EXON?").await?;
        if exon != "1" {
            return Err(Error::Protocol(format!("EXON=1 failed, got {exon:?}; excitation must be enabled")));
        }
        Ok(())
    }

    /// Load a calibration curve onto the bridge (`devices.py`'s
    /// `_load_calibration_curve`), an engineering operation outside normal
    /// settings reconciliation.
    pub async fn load_curve(&self, channel: &SerialChannel, curve_num: u8, curve_type: CurveType, name: &str) -> Result<(), Error> {
        for cmd in self.curve.load_sequence(curve_num, curve_type, name)? {
            channel.send(&cmd).await?;
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl Instrument for Bridge {
    fn device(&self) -> &'static str {
        "sim921"
    }

    fn behind_mainframe(&self) -> bool {
        true
    }

    async fn identify(&self, channel: &SerialChannel) -> Result<mainframe::Identity, Error> {
        mainframe::connect_and_identify(channel, "SIM921").await
    }

    fn owned_settings(&self) -> &'static [&'static str] {
        OWNED_SETTINGS
    }

    fn extra_command_topics(&self) -> &'static [&'static str] {
        EXTRA_TOPICS
    }

    fn blocked_in_state(&self, state: &str) -> &'static [&'static str] {
        match state {
            "regulating" => &["device-settings:sim921:curve-number"],
            _ => &[],
        }
    }

    async fn apply(&self, channel: &SerialChannel, cmd: &Command) -> Result<Vec<(String, String)>, Error> {
        if cmd.setting == "device-settings:mkidarray:regulating-temp" {
            let temp: f64 = cmd.value.parse().map_err(|_| Error::Protocol(format!("non-numeric temperature {:?}", cmd.value)))?;
            let resistance = self.curve.temperature_to_resistance(temp);
            channel.send(&format!("RSET {resistance}")).await?;
            return Ok(Vec::new());
        }
        channel.send(cmd.wire_string()).await?;
        Ok(Vec::new())
    }

    async fn read_setting(&self, channel: &SerialChannel, setting: &str) -> Result<String, Error> {
        let query = match setting {
            "device-settings:sim921:resistance-range" => "RANG?",
            "device-settings:sim921:excitation-value" => "EXCI?",
            "device-settings:sim921:excitation-mode" => "MODE?",
            "device-settings:sim921:time-constant" => "TIME?",
            "device-settings:sim921:temp-slope" => "TSLP?",
            "device-settings:sim921:resistance-slope" => "RSLP?",
            "device-settings:sim921:curve-number" => "CURV?",
            other => return Err(Error::Protocol(format!("no read-back query for {other:?}"))),
        };
        channel.query(query).await
    }

    fn monitored_reads(&self) -> Vec<MonitoredRead> {
        vec![
            MonitoredRead { label: "temperature", key: TEMPERATURE_KEY.to_owned() },
            MonitoredRead { label: "resistance", key: "status:temps:mkidarray:resistance".to_owned() },
            MonitoredRead { label: "output-voltage", key: "status:temps:sim921:output-voltage".to_owned() },
        ]
    }

    fn timeseries_keys(&self) -> Vec<String> {
        vec![TEMPERATURE_KEY.to_owned()]
    }

    async fn poll(&self, channel: &SerialChannel, read: &MonitoredRead) -> Option<Vec<(String, String)>> {
        let value = match read.label {
            "temperature" => channel.query("TVAL?").await.ok()?,
            "resistance" => channel.query("RVAL?").await.ok()?,
            "output-voltage" => {
                let manual = channel.query("AMAN?").await.ok()?;
                if manual == "1" {
                    channel.query("AOUT?").await.ok()?
                } else {
                    let vohm: f64 = channel.query("VOHM?").await.ok()?.parse().ok()?;
                    let rdev: f64 = channel.query("RDEV?").await.ok()?.parse().ok()?;
                    (vohm * rdev).to_string()
                }
            }
            _ => return None,
        };
        Some(vec![(read.key.clone(), value)])
    }
}
