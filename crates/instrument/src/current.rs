// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The currentduino agent: magnet heat-switch actuator and high-current-board
//! current monitor.
//!
//! Grounded on `currentduinoAgent.py`'s `Currentduino` class. Unlike the SIM
//! rack instruments this microcontroller has no `*IDN?`-equivalent — the
//! original leaves firmware identification as an unfinished TODO
//! (`store_firmware(redis)` is called with a missing argument in its own
//! `__main__` block) — so [`Currentduino::identify`] substitutes a liveness
//! probe (one current reading) for a manufacturer/model handshake.

use cryo_store::schema::Command;

use crate::error::Error;
use crate::mainframe::Identity;
use crate::runtime::{Instrument, MonitoredRead};
use crate::serial::SerialChannel;

/// Values for the R1/R2 resistors in the magnet current measuring voltage
/// divider on the PIPER HighCurrent Boost board.
const R1: f64 = 11790.0;
const R2: f64 = 11690.0;

const HEATSWITCH_SETTING: &str = "device-settings:currentduino:heatswitch";
const HIGHCURRENTBOARD_SETTING: &str = "device-settings:currentduino:highcurrentboard";

const OWNED_SETTINGS: &[&str] = &[HEATSWITCH_SETTING, HIGHCURRENTBOARD_SETTING];

/// Magnet current, also the quench detector's input timeseries
/// (`quenchAgent.py`'s `TS_KEYS`).
const CURRENT_KEY: &str = "status:highcurrentboard:current";

/// The currentduino agent.
#[derive(Default)]
pub struct Currentduino;

impl Currentduino {
    pub fn new() -> Self {
        Self
    }

    /// Read the current ADC and convert to amps (`Currentduino.get_current_data`/`parse`).
    pub async fn read_current(&self, channel: &SerialChannel) -> Result<f64, Error> {
        let response = channel.query_raw("?").await?;
        let raw_value: f64 = response
            .split(' ')
            .next()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| Error::Protocol(format!("couldn't parse current reading from {response:?}")))?;
        Ok(raw_value * (5.0 / 1023.0) * ((R1 + R2) / R2))
    }

    /// Move the heat switch and confirm via echo (`open_heat_switch`/`close_heat_switch`).
    /// Returns the observed position: `"open"`, `"close"`, or `"unknown"` when
    /// the Arduino's echo doesn't match the token sent.
    pub async fn move_heatswitch(&self, channel: &SerialChannel, open: bool) -> Result<&'static str, Error> {
        let token = if open { "o" } else { "c" };
        let confirm = channel.query_raw(token).await?;
        if confirm == token {
            Ok(if open { "open" } else { "close" })
        } else {
            Ok("unknown")
        }
    }
}

#[async_trait::async_trait]
impl Instrument for Currentduino {
    fn device(&self) -> &'static str {
        "currentduino"
    }

    async fn identify(&self, channel: &SerialChannel) -> Result<Identity, Error> {
        self.read_current(channel).await?;
        Ok(Identity {
            manufacturer: String::new(),
            model: "currentduino".to_owned(),
            serial_number: String::new(),
            firmware: "unknown".to_owned(),
        })
    }

    fn owned_settings(&self) -> &'static [&'static str] {
        OWNED_SETTINGS
    }

    async fn apply(&self, channel: &SerialChannel, cmd: &Command) -> Result<Vec<(String, String)>, Error> {
        match cmd.setting.as_str() {
            HEATSWITCH_SETTING => {
                let open = match cmd.value.as_str() {
                    "open" => true,
                    "close" => false,
                    other => return Err(Error::Protocol(format!("unexpected heatswitch value {other:?}"))),
                };
                let position = self.move_heatswitch(channel, open).await?;
                if position == "unknown" {
                    return Err(Error::Protocol("heat switch echo did not confirm move".to_owned()));
                }
                Ok(vec![("status:heatswitch".to_owned(), position.to_owned())])
            }
            // Not wired to a hardware command in the original: this setting
            // only gates whether the board's current readings are trusted
            // upstream, so accepting it is a pure store write.
            HIGHCURRENTBOARD_SETTING => Ok(Vec::new()),
            other => Err(Error::Protocol(format!("currentduino has no setting {other:?}"))),
        }
    }

    async fn read_setting(&self, _channel: &SerialChannel, setting: &str) -> Result<String, Error> {
        Err(Error::Protocol(format!("{setting} has no hardware read-back on currentduino")))
    }

    fn monitored_reads(&self) -> Vec<MonitoredRead> {
        vec![MonitoredRead { label: "current", key: CURRENT_KEY.to_owned() }]
    }

    fn timeseries_keys(&self) -> Vec<String> {
        vec![CURRENT_KEY.to_owned()]
    }

    async fn poll(&self, channel: &SerialChannel, read: &MonitoredRead) -> Option<Vec<(String, String)>> {
        match read.label {
            "current" => {
                let current = self.read_current(channel).await.ok()?;
                Some(vec![(read.key.clone(), current.to_string())])
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn voltage_divider_constants_match_original_board() {
        assert_eq!(R1, 11790.0);
        assert_eq!(R2, 11690.0);
    }
}
