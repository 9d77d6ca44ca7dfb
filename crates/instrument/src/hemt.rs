// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The HEMT bias-monitor agent.
//!
//! Grounded on `hemttempAgent.py`'s `Hemtduino`: a single `'h'` query returns
//! one line of 15 space-separated ADC readings, one
//! (gate-voltage-bias, drain-current-bias, drain-voltage-bias) triple per
//! feedline, ordered feedline 5 down to feedline 1
//! (`[f"status:feedline{5-i}:hemt:{j}" for i in range(5) for j in HEMT_VALUES]`).
//! A leaf agent: it owns no settings and accepts no commands.

use cryo_store::schema::Command;

use crate::error::Error;
use crate::mainframe::Identity;
use crate::runtime::{Instrument, MonitoredRead};
use crate::serial::SerialChannel;

const HEMT_VALUES: [&str; 3] = ["gate-voltage-bias", "drain-current-bias", "drain-voltage-bias"];

fn keys() -> Vec<String> {
    (0..5)
        .flat_map(|i| {
            let feedline = 5 - i;
            HEMT_VALUES.iter().map(move |v| format!("status:feedline{feedline}:hemt:{v}"))
        })
        .collect()
}

/// Scale one raw ADC reading. Every third value (index 0, 3, 6, ...) is a
/// gate-voltage-bias reading centered at 2.5V; the rest are plain 0-5V
/// dividers (`format_message`).
fn scale(index: usize, raw: f64) -> f64 {
    if index % 3 == 0 {
        2.0 * ((raw * (5.0 / 1023.0)) - 2.5)
    } else {
        raw * (5.0 / 1023.0)
    }
}

/// The HEMT agent.
#[derive(Default)]
pub struct Hemt;

impl Hemt {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait::async_trait]
impl Instrument for Hemt {
    fn device(&self) -> &'static str {
        "hemtduino"
    }

    async fn identify(&self, channel: &SerialChannel) -> Result<Identity, Error> {
        channel.query_raw("h").await?;
        Ok(Identity {
            manufacturer: String::new(),
            model: "hemtduino".to_owned(),
            serial_number: String::new(),
            firmware: "unknown".to_owned(),
        })
    }

    fn owned_settings(&self) -> &'static [&'static str] {
        &[]
    }

    async fn apply(&self, _channel: &SerialChannel, cmd: &Command) -> Result<Vec<(String, String)>, Error> {
        Err(Error::Protocol(format!("hemtduino accepts no commands, got {:?}", cmd.setting)))
    }

    async fn read_setting(&self, _channel: &SerialChannel, setting: &str) -> Result<String, Error> {
        Err(Error::Protocol(format!("{setting} has no hardware read-back on hemtduino")))
    }

    fn monitored_reads(&self) -> Vec<MonitoredRead> {
        vec![MonitoredRead { label: "bias", key: String::new() }]
    }

    fn timeseries_keys(&self) -> Vec<String> {
        keys()
    }

    async fn poll(&self, channel: &SerialChannel, read: &MonitoredRead) -> Option<Vec<(String, String)>> {
        if read.label != "bias" {
            return None;
        }
        let response = channel.query_raw("h").await.ok()?;
        let values: Vec<f64> = response.split(' ').filter(|s| !s.is_empty()).map(str::parse).collect::<Result<_, _>>().ok()?;
        let keys = keys();
        if values.len() != keys.len() {
            return None;
        }
        Some(
            values
                .into_iter()
                .enumerate()
                .map(|(i, raw)| (keys[i].clone(), scale(i, raw).to_string()))
                .collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_run_feedline_five_down_to_one() {
        let k = keys();
        assert_eq!(k.first().unwrap(), "status:feedline5:hemt:gate-voltage-bias");
        assert_eq!(k.last().unwrap(), "status:feedline1:hemt:drain-voltage-bias");
        assert_eq!(k.len(), 15);
    }

    #[test]
    fn gate_voltage_bias_is_centered_at_zero_for_midscale_reading() {
        // midscale ADC (511.5) maps to ~2.5V input, so the centered gate
        // bias should land near zero.
        assert!(scale(0, 511.5).abs() < 0.01);
    }

    #[test]
    fn drain_values_are_plain_zero_to_five_volt_scale() {
        assert!((scale(1, 1023.0) - 5.0).abs() < 1e-9);
    }
}
