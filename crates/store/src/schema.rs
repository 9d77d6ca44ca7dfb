// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The process-wide, read-only setting schema (`spec.md` §3) and the
//! `Command` object derived from it.
//!
//! Entries are grounded on the original `picturec` schema referenced by
//! `devices.py`'s `COMMAND_DICT` and the field list in `piccDirector.py`'s
//! `FIELD_KEYS`. The exact wire mnemonics are a deployment detail (`spec.md`
//! §1: "the bit-level serial command dictionary ... is data, not design");
//! what matters structurally is the shape — an ordered enum mapping or a
//! closed numeric interval per setting.

use crate::error::SchemaError;

/// The value specification for one schema entry.
#[derive(Debug, Clone, Copy)]
pub enum ValueSpec {
    /// Ordered mapping from human value to wire token.
    Enumerated(&'static [(&'static str, &'static str)]),
    /// Closed numeric interval `[lo, hi]`.
    Interval(f64, f64),
}

/// One row of the setting schema.
#[derive(Debug, Clone, Copy)]
pub struct SchemaEntry {
    /// Canonical dotted-colon setting name.
    pub key: &'static str,
    /// On-wire command prefix (empty string if the instrument takes a bare token).
    pub command: &'static str,
    pub spec: ValueSpec,
}

impl SchemaEntry {
    fn contains(&self, value: &str) -> bool {
        match self.spec {
            ValueSpec::Enumerated(map) => map.iter().any(|(human, _)| *human == value),
            ValueSpec::Interval(lo, hi) => {
                value.parse::<f64>().is_ok_and(|v| v >= lo && v <= hi)
            }
        }
    }
}

macro_rules! enumerated {
    ($($human:expr => $wire:expr),+ $(,)?) => {
        ValueSpec::Enumerated(&[$(($human, $wire)),+])
    };
}

/// The fixed schema table. Declared as static data per Design Note 9 (no
/// dynamic instrument dispatch needed beyond the tagged `Instrument` enum).
pub static SCHEMA: &[SchemaEntry] = &[
    // -- SIM921 AC resistance bridge ----------------------------------------
    SchemaEntry {
        key: "device-settings:sim921:resistance-range",
        command: "RANG",
        spec: enumerated! {
            "20mOhm" => "0", "200mOhm" => "1", "2Ohm" => "2", "20Ohm" => "3",
            "200Ohm" => "4", "2kOhm" => "5", "20kOhm" => "6", "200kOhm" => "7",
        },
    },
    SchemaEntry {
        key: "device-settings:sim921:excitation-value",
        command: "EXCI",
        spec: enumerated! {
            "3uV" => "0", "10uV" => "1", "30uV" => "2", "100uV" => "3",
            "300uV" => "4", "1mV" => "5", "3mV" => "6", "10mV" => "7",
        },
    },
    SchemaEntry {
        key: "device-settings:sim921:excitation-mode",
        command: "MODE",
        spec: enumerated! { "voltage" => "0", "current" => "1" },
    },
    SchemaEntry {
        key: "device-settings:sim921:time-constant",
        command: "TIME",
        spec: enumerated! { "1ms" => "0", "3ms" => "1", "10ms" => "2", "30ms" => "3",
                             "100ms" => "4", "300ms" => "5", "1s" => "6", "3s" => "7" },
    },
    SchemaEntry {
        key: "device-settings:sim921:temp-slope",
        command: "TSLP",
        spec: ValueSpec::Interval(-10.0, 10.0),
    },
    SchemaEntry {
        key: "device-settings:sim921:resistance-slope",
        command: "RSLP",
        spec: ValueSpec::Interval(-10.0, 10.0),
    },
    SchemaEntry {
        key: "device-settings:sim921:curve-number",
        command: "CURV",
        spec: enumerated! { "1" => "1", "2" => "2", "3" => "3" },
    },
    // -- SIM960 PID analog controller ----------------------------------------
    SchemaEntry {
        key: "device-settings:sim960:vout-min-limit",
        command: "LLIM",
        spec: ValueSpec::Interval(-10.0, 10.0),
    },
    SchemaEntry {
        key: "device-settings:sim960:vout-max-limit",
        command: "ULIM",
        spec: ValueSpec::Interval(-10.0, 10.0),
    },
    SchemaEntry {
        key: "device-settings:sim960:pid-p:enabled",
        command: "PCTL",
        spec: enumerated! { "on" => "1", "off" => "0" },
    },
    SchemaEntry {
        key: "device-settings:sim960:pid-i:enabled",
        command: "ICTL",
        spec: enumerated! { "on" => "1", "off" => "0" },
    },
    SchemaEntry {
        key: "device-settings:sim960:pid-d:enabled",
        command: "DCTL",
        spec: enumerated! { "on" => "1", "off" => "0" },
    },
    SchemaEntry {
        key: "device-settings:sim960:pid-offset:enabled",
        command: "OCTL",
        spec: enumerated! { "on" => "1", "off" => "0" },
    },
    SchemaEntry {
        key: "device-settings:sim960:pid-p:value",
        command: "GAIN",
        spec: ValueSpec::Interval(-1000.0, 1000.0),
    },
    SchemaEntry {
        key: "device-settings:sim960:pid-i:value",
        command: "INTG",
        spec: ValueSpec::Interval(-1000.0, 1000.0),
    },
    SchemaEntry {
        key: "device-settings:sim960:pid-d:value",
        command: "DERV",
        spec: ValueSpec::Interval(-1000.0, 1000.0),
    },
    SchemaEntry {
        key: "device-settings:sim960:pid-offset:value",
        command: "OFST",
        spec: ValueSpec::Interval(-10.0, 10.0),
    },
    SchemaEntry {
        key: "device-settings:sim960:vin-setpoint-mode",
        command: "INPT",
        spec: enumerated! { "internal" => "0", "external" => "1" },
    },
    SchemaEntry {
        key: "device-settings:sim960:vin-setpoint",
        command: "SETP",
        spec: ValueSpec::Interval(-10.0, 10.0),
    },
    SchemaEntry {
        key: "device-settings:sim960:vin-setpoint-slew-enable",
        command: "RAMP",
        spec: enumerated! { "on" => "1", "off" => "0" },
    },
    SchemaEntry {
        key: "device-settings:sim960:vin-setpoint-slew-rate",
        command: "RATE",
        spec: ValueSpec::Interval(0.0, 10.0),
    },
    // -- currentduino (current ADC + heat switch) ----------------------------
    SchemaEntry {
        key: "device-settings:currentduino:heatswitch",
        command: "",
        spec: enumerated! { "open" => "o", "close" => "c" },
    },
    SchemaEntry {
        key: "device-settings:currentduino:highcurrentboard",
        command: "",
        spec: enumerated! { "on" => "1", "off" => "0" },
    },
    // -- composite setting (bridge + PID, §4.1, §9 Open Question) -----------
    SchemaEntry {
        key: "device-settings:mkidarray:regulating-temp",
        command: "COMPOSITE",
        spec: ValueSpec::Interval(0.05, 1.0),
    },
];

/// Look up a setting by its canonical key.
pub fn lookup(key: &str) -> Option<&'static SchemaEntry> {
    SCHEMA.iter().find(|e| e.key == key)
}

/// A validated `(setting, value)` command (`spec.md` §3 Command object).
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub setting: String,
    pub value: String,
    wire: String,
}

impl Command {
    /// Construct and validate a command against the schema.
    ///
    /// Fails with `InvalidSetting` if the key is unknown, `InvalidValue` if
    /// the value is not a member of the mapping or interval.
    pub fn new(setting: &str, value: &str) -> Result<Self, SchemaError> {
        let entry =
            lookup(setting).ok_or_else(|| SchemaError::InvalidSetting(setting.to_owned()))?;
        if !entry.contains(value) {
            return Err(SchemaError::InvalidValue {
                setting: setting.to_owned(),
                value: value.to_owned(),
            });
        }
        let wire = format_wire(entry, value);
        Ok(Self { setting: setting.to_owned(), value: value.to_owned(), wire })
    }

    /// Always true for a constructed `Command` — validity is an invariant
    /// of construction, not a post-hoc check (`spec.md` §3 derived field).
    pub fn valid(&self) -> bool {
        true
    }

    /// The on-wire string to send to the instrument.
    pub fn wire_string(&self) -> &str {
        &self.wire
    }
}

fn format_wire(entry: &SchemaEntry, value: &str) -> String {
    let token = match entry.spec {
        ValueSpec::Enumerated(map) => map
            .iter()
            .find(|(human, _)| *human == value)
            .map(|(_, wire)| *wire)
            .unwrap_or(value),
        ValueSpec::Interval(..) => value,
    };
    if entry.command.is_empty() {
        token.to_owned()
    } else {
        format!("{} {}", entry.command, token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_setting_is_rejected() {
        let err = Command::new("device-settings:sim921:not-a-thing", "1").unwrap_err();
        assert!(matches!(err, SchemaError::InvalidSetting(_)));
    }

    #[test]
    fn out_of_interval_value_is_rejected() {
        let err = Command::new("device-settings:sim960:vin-setpoint", "99").unwrap_err();
        assert!(matches!(err, SchemaError::InvalidValue { .. }));
    }

    #[test]
    fn interval_boundary_is_accepted() {
        let cmd = Command::new("device-settings:sim960:vin-setpoint", "10").unwrap();
        assert!(cmd.valid());
        assert_eq!(cmd.wire_string(), "SETP 10");
    }

    #[test]
    fn enumerated_value_maps_to_wire_token() {
        let cmd = Command::new("device-settings:sim921:resistance-range", "20kOhm").unwrap();
        assert_eq!(cmd.wire_string(), "RANG 6");
    }

    #[test]
    fn bare_token_setting_has_no_prefix() {
        let cmd = Command::new("device-settings:currentduino:heatswitch", "open").unwrap();
        assert_eq!(cmd.wire_string(), "o");
    }

    #[test]
    fn invalid_enumerated_value_is_rejected() {
        let err = Command::new("device-settings:currentduino:heatswitch", "sideways").unwrap_err();
        assert!(matches!(err, SchemaError::InvalidValue { .. }));
    }

    #[test]
    fn round_trip_schema_validate_wire_format_is_stable() {
        for entry in SCHEMA {
            let sample = match entry.spec {
                ValueSpec::Enumerated(map) => map[0].0.to_owned(),
                ValueSpec::Interval(lo, _) => lo.to_string(),
            };
            let cmd = Command::new(entry.key, &sample).expect("sample value must validate");
            assert_eq!(cmd.setting, entry.key);
            assert_eq!(cmd.value, sample);
        }
    }
}
