// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The `MagnetIo` capability set (`spec.md` §9 Design Note: "inject the IO
//! helpers into the state machine as a capability set"; `SPEC_FULL.md` §4.2).
//!
//! All guards and state-entry actions in [`crate::machine`] consume only
//! this trait, never the store directly, so tests substitute
//! [`FakeIo`] for a real store round trip.

use async_trait::async_trait;
use cryo_store::{keys, ReadValue, Store};

use crate::error::IoError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PidMode {
    Manual,
    Pid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeatSwitchPosition {
    Open,
    Closed,
}

impl HeatSwitchPosition {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "open" => Some(HeatSwitchPosition::Open),
            "close" | "closed" => Some(HeatSwitchPosition::Closed),
            _ => None,
        }
    }
}

/// The capability surface the state machine needs, independent of how it is
/// realized (`spec.md` §9 Design Note 9.1).
#[async_trait]
pub trait MagnetIo: Send + Sync {
    async fn command_setpoint(&self, amps: f64) -> Result<(), IoError>;
    async fn command_mode(&self, mode: PidMode) -> Result<(), IoError>;
    async fn command_heatswitch(&self, pos: HeatSwitchPosition) -> Result<(), IoError>;
    async fn read_heatswitch(&self) -> Result<HeatSwitchPosition, IoError>;
    async fn read_device_temp(&self) -> Result<f64, IoError>;
    async fn read_current(&self) -> Result<f64, IoError>;
    async fn read_setpoint(&self) -> Result<f64, IoError>;
    async fn in_pid_mode(&self) -> Result<bool, IoError>;

    /// A store-backed cooldown tunable (ramp-rate, soak-current, ...). These
    /// four settings "don't really follow the schema pattern" per the
    /// original's own comment (`sim960Agent.py`'s `RAMP_SLOPE_KEY` et al.):
    /// they gate the state machine's own behavior rather than driving the
    /// device directly, so they are read as plain store keys rather than
    /// routed through `cryo_store::schema`.
    async fn read_tunable(&self, key: &str) -> Result<f64, IoError>;
    async fn write_tunable(&self, key: &str, value: f64) -> Result<(), IoError>;
}

async fn read_plain(store: &Store, key: &str) -> Result<String, IoError> {
    let found = store.read(&[key], true).await?;
    match found.into_iter().next() {
        Some((_, ReadValue::Plain(v))) => Ok(v),
        Some((_, ReadValue::Timeseries { value, .. })) => Ok(value.to_string()),
        None => Err(IoError::Missing(key.to_owned())),
    }
}

async fn read_f64(store: &Store, key: &str) -> Result<f64, IoError> {
    let raw = read_plain(store, key).await?;
    raw.parse().map_err(|_| IoError::Malformed { key: key.to_owned(), detail: format!("not a float: {raw:?}") })
}

/// Setting keys the state machine drives directly.
pub const HEATSWITCH_SETTING: &str = "device-settings:currentduino:heatswitch";
pub const HEATSWITCH_STATUS_KEY: &str = "status:heatswitch";
pub const SETPOINT_SETTING: &str = "device-settings:sim960:vin-setpoint";
pub const PID_P_ENABLE: &str = "device-settings:sim960:pid-p:enabled";
pub const PID_I_ENABLE: &str = "device-settings:sim960:pid-i:enabled";
pub const PID_D_ENABLE: &str = "device-settings:sim960:pid-d:enabled";
pub const DEVICE_TEMP_KEY: &str = "status:temps:mkidarray:temp";
pub const CURRENT_KEY: &str = "status:highcurrentboard:current";

/// Production `MagnetIo`, driving the same store every instrument agent
/// uses (`spec.md` §4.5). Commands are published on the instrument's own
/// command channel so the normal command-listener/schema-validation path
/// (`cryo_instrument::runtime::command_listener`) applies and writes the
/// value back, rather than the controller writing the device setting
/// directly — the magnet controller is just another command-bus client.
pub struct StoreIo {
    store: Store,
}

impl StoreIo {
    pub fn new(store: Store) -> Self {
        Self { store }
    }
}

#[async_trait]
impl MagnetIo for StoreIo {
    async fn command_setpoint(&self, amps: f64) -> Result<(), IoError> {
        self.store.publish(&keys::command_topic(SETPOINT_SETTING), &amps.to_string(), None).await?;
        Ok(())
    }

    async fn command_mode(&self, mode: PidMode) -> Result<(), IoError> {
        let (p, i, d) = match mode {
            PidMode::Pid => ("on", "on", "off"),
            PidMode::Manual => ("off", "off", "off"),
        };
        self.store.publish(&keys::command_topic(PID_P_ENABLE), p, None).await?;
        self.store.publish(&keys::command_topic(PID_I_ENABLE), i, None).await?;
        self.store.publish(&keys::command_topic(PID_D_ENABLE), d, None).await?;
        Ok(())
    }

    async fn command_heatswitch(&self, pos: HeatSwitchPosition) -> Result<(), IoError> {
        let value = match pos {
            HeatSwitchPosition::Open => "open",
            HeatSwitchPosition::Closed => "close",
        };
        self.store.publish(&keys::command_topic(HEATSWITCH_SETTING), value, None).await?;
        Ok(())
    }

    async fn read_heatswitch(&self) -> Result<HeatSwitchPosition, IoError> {
        let raw = read_plain(&self.store, HEATSWITCH_STATUS_KEY).await?;
        HeatSwitchPosition::parse(&raw).ok_or_else(|| IoError::Malformed {
            key: HEATSWITCH_STATUS_KEY.to_owned(),
            detail: format!("unrecognized heat switch position {raw:?}"),
        })
    }

    async fn read_device_temp(&self) -> Result<f64, IoError> {
        read_f64(&self.store, DEVICE_TEMP_KEY).await
    }

    async fn read_current(&self) -> Result<f64, IoError> {
        read_f64(&self.store, CURRENT_KEY).await
    }

    async fn read_setpoint(&self) -> Result<f64, IoError> {
        read_f64(&self.store, SETPOINT_SETTING).await
    }

    async fn in_pid_mode(&self) -> Result<bool, IoError> {
        let p = read_plain(&self.store, PID_P_ENABLE).await?;
        let i = read_plain(&self.store, PID_I_ENABLE).await?;
        let d = read_plain(&self.store, PID_D_ENABLE).await?;
        Ok(p == "on" || i == "on" || d == "on")
    }

    async fn read_tunable(&self, key: &str) -> Result<f64, IoError> {
        read_f64(&self.store, key).await
    }

    async fn write_tunable(&self, key: &str, value: f64) -> Result<(), IoError> {
        self.store.store(&[(key, &value.to_string())]).await?;
        Ok(())
    }
}

#[cfg(test)]
pub mod fake {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use super::*;

    /// In-memory `MagnetIo` for state machine and scenario tests
    /// (`SPEC_FULL.md` §2.5: "in-memory fakes behind the capability-set
    /// traits ... not a real tty/TCP socket").
    #[derive(Default)]
    pub struct FakeIo {
        pub setpoint: Mutex<f64>,
        pub mode: Mutex<PidMode>,
        pub heatswitch: Mutex<HeatSwitchPosition>,
        pub device_temp: Mutex<f64>,
        pub current: Mutex<f64>,
        pub tunables: Mutex<HashMap<String, f64>>,
        pub setpoint_commands: Mutex<Vec<f64>>,
        pub heatswitch_commands: Mutex<Vec<HeatSwitchPosition>>,
    }

    impl Default for PidMode {
        fn default() -> Self {
            PidMode::Manual
        }
    }

    impl Default for HeatSwitchPosition {
        fn default() -> Self {
            HeatSwitchPosition::Open
        }
    }

    impl FakeIo {
        pub fn with_tunables(pairs: &[(&str, f64)]) -> Self {
            let mut tunables = HashMap::new();
            for (k, v) in pairs {
                tunables.insert((*k).to_owned(), *v);
            }
            Self { tunables: Mutex::new(tunables), ..Default::default() }
        }
    }

    #[async_trait]
    impl MagnetIo for FakeIo {
        async fn command_setpoint(&self, amps: f64) -> Result<(), IoError> {
            *self.setpoint.lock().expect("lock poisoned") = amps;
            self.setpoint_commands.lock().expect("lock poisoned").push(amps);
            Ok(())
        }

        async fn command_mode(&self, mode: PidMode) -> Result<(), IoError> {
            *self.mode.lock().expect("lock poisoned") = mode;
            Ok(())
        }

        async fn command_heatswitch(&self, pos: HeatSwitchPosition) -> Result<(), IoError> {
            *self.heatswitch.lock().expect("lock poisoned") = pos;
            self.heatswitch_commands.lock().expect("lock poisoned").push(pos);
            Ok(())
        }

        async fn read_heatswitch(&self) -> Result<HeatSwitchPosition, IoError> {
            Ok(*self.heatswitch.lock().expect("lock poisoned"))
        }

        async fn read_device_temp(&self) -> Result<f64, IoError> {
            Ok(*self.device_temp.lock().expect("lock poisoned"))
        }

        async fn read_current(&self) -> Result<f64, IoError> {
            Ok(*self.current.lock().expect("lock poisoned"))
        }

        async fn read_setpoint(&self) -> Result<f64, IoError> {
            Ok(*self.setpoint.lock().expect("lock poisoned"))
        }

        async fn in_pid_mode(&self) -> Result<bool, IoError> {
            Ok(*self.mode.lock().expect("lock poisoned") == PidMode::Pid)
        }

        async fn read_tunable(&self, key: &str) -> Result<f64, IoError> {
            self.tunables.lock().expect("lock poisoned").get(key).copied().ok_or_else(|| IoError::Missing(key.to_owned()))
        }

        async fn write_tunable(&self, key: &str, value: f64) -> Result<(), IoError> {
            self.tunables.lock().expect("lock poisoned").insert(key.to_owned(), value);
            Ok(())
        }
    }
}
