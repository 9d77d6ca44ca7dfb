// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The state-dependent command block table (`spec.md` §4.3).
//!
//! Grounded on `sim960Agent.py`'s `BLOCKS` defaultdict, whose one
//! populated entry (referenced in its own comment and in `spec.md`
//! Scenario 4) blocks manual setpoint changes while `regulating`. The
//! per-instrument `Instrument::blocked_in_state` implementations
//! (`cryo_instrument::pid::Pid`, `cryo_instrument::bridge::Bridge`) are the
//! actual enforcement point inside each agent's command listener; this
//! table is the canonical source they are grounded on, kept here so the
//! magnet crate and the instrument crate agree on one authority.

use std::collections::{HashMap, HashSet};

use crate::io::SETPOINT_SETTING;
use crate::state::MagnetState;

/// Build the block table once at startup (`SPEC_FULL.md` §4.3).
pub fn block_table() -> HashMap<MagnetState, HashSet<&'static str>> {
    let mut table = HashMap::new();
    table.insert(MagnetState::Regulating, HashSet::from([SETPOINT_SETTING]));
    table
}

/// Whether `setting` is blocked while the machine is in `state`.
pub fn is_blocked(table: &HashMap<MagnetState, HashSet<&'static str>>, state: MagnetState, setting: &str) -> bool {
    table.get(&state).is_some_and(|blocked| blocked.contains(setting))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn setpoint_is_blocked_only_while_regulating() {
        let table = block_table();
        assert!(is_blocked(&table, MagnetState::Regulating, SETPOINT_SETTING));
        assert!(!is_blocked(&table, MagnetState::Ramping, SETPOINT_SETTING));
        assert!(!is_blocked(&table, MagnetState::Off, SETPOINT_SETTING));
    }
}
