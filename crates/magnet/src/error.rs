// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Error taxonomy for the magnet-controller crate (`spec.md` §7).

use thiserror::Error;

/// A failure performing one `MagnetIo` capability operation.
#[derive(Debug, Error)]
pub enum IoError {
    #[error("store error: {0}")]
    Store(#[from] cryo_store::StoreError),

    #[error("malformed value for {key:?}: {detail}")]
    Malformed { key: String, detail: String },

    #[error("required key {0:?} missing from store")]
    Missing(String),
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("magnet io error: {0}")]
    Io(#[from] IoError),

    #[error("store error: {0}")]
    Store(#[from] cryo_store::StoreError),

    #[error("command forbidden in state {state}: {setting}")]
    State { state: String, setting: String },

    #[error("cooldown cannot be scheduled from state {0}")]
    InvalidScheduleState(String),

    #[error("requested cold-by time is before the minimum time needed to cool")]
    TimeTravel,
}
