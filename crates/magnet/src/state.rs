// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The magnet cooldown state enum and its persisted-state file
//! (`spec.md` §3 "Magnet state", §6 "Persisted state file").

use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

/// One of the eight cooldown states (`spec.md` §4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MagnetState {
    Off,
    HsClosing,
    Ramping,
    Soaking,
    HsOpening,
    Cooling,
    Regulating,
    Deramping,
}

impl MagnetState {
    pub fn as_str(self) -> &'static str {
        match self {
            MagnetState::Off => "off",
            MagnetState::HsClosing => "hs_closing",
            MagnetState::Ramping => "ramping",
            MagnetState::Soaking => "soaking",
            MagnetState::HsOpening => "hs_opening",
            MagnetState::Cooling => "cooling",
            MagnetState::Regulating => "regulating",
            MagnetState::Deramping => "deramping",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "off" => MagnetState::Off,
            "hs_closing" => MagnetState::HsClosing,
            "ramping" => MagnetState::Ramping,
            "soaking" => MagnetState::Soaking,
            "hs_opening" => MagnetState::HsOpening,
            "cooling" => MagnetState::Cooling,
            "regulating" => MagnetState::Regulating,
            "deramping" => MagnetState::Deramping,
            _ => return None,
        })
    }
}

/// Write `<unix_epoch_seconds>: <state_name>` to `path`, matching
/// `sim960Agent.py`'s `write_persisted_state`. A write failure is logged and
/// swallowed — the persisted file is a resume hint, not a correctness
/// requirement.
pub fn write_persisted_state(path: &Path, state: MagnetState) {
    let now = SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or_default();
    let contents = format!("{now}: {}", state.as_str());
    if let Err(err) = std::fs::write(path, contents) {
        tracing::warn!(?path, %err, "unable to write persisted magnet state");
    }
}

/// Read back the persisted state. Absent file, I/O error, or unparseable
/// contents all default to `deramping` (`spec.md` §6: "Absent or malformed
/// ⇒ initial state defaults to `deramping`").
pub fn load_persisted_state(path: &Path) -> MagnetState {
    let Ok(contents) = std::fs::read_to_string(path) else {
        return MagnetState::Deramping;
    };
    contents
        .split_once(':')
        .and_then(|(_, state)| MagnetState::parse(state.trim()))
        .unwrap_or(MagnetState::Deramping)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_file() -> anyhow::Result<()> {
        let dir = std::env::temp_dir().join(format!("cryo-magnet-state-test-{:?}", std::thread::current().id()));
        write_persisted_state(&dir, MagnetState::Soaking);
        assert_eq!(load_persisted_state(&dir), MagnetState::Soaking);
        std::fs::remove_file(&dir)?;
        Ok(())
    }

    #[test]
    fn missing_file_defaults_to_deramping() {
        let path = Path::new("/nonexistent/definitely-not-a-file");
        assert_eq!(load_persisted_state(path), MagnetState::Deramping);
    }

    #[test]
    fn malformed_contents_default_to_deramping() -> anyhow::Result<()> {
        let dir = std::env::temp_dir().join(format!("cryo-magnet-state-malformed-{:?}", std::thread::current().id()));
        std::fs::write(&dir, "not a valid line")?;
        assert_eq!(load_persisted_state(&dir), MagnetState::Deramping);
        std::fs::remove_file(&dir)?;
        Ok(())
    }

    #[test]
    fn all_states_round_trip_through_as_str_and_parse() {
        for state in [
            MagnetState::Off,
            MagnetState::HsClosing,
            MagnetState::Ramping,
            MagnetState::Soaking,
            MagnetState::HsOpening,
            MagnetState::Cooling,
            MagnetState::Regulating,
            MagnetState::Deramping,
        ] {
            assert_eq!(MagnetState::parse(state.as_str()), Some(state));
        }
    }
}
