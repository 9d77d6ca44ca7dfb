// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Error taxonomy for serial instrument agents (`spec.md` §7).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("transport error talking to {port}: {source}")]
    Transport { port: String, source: serialport::Error },

    #[error("serial worker channel closed")]
    WorkerGone,

    #[error("malformed response to well-formed query: {0:?}")]
    Protocol(String),

    #[error("identity mismatch: expected manufacturer {expected_manufacturer:?} model {expected_model:?}, got {got:?}")]
    IdentityMismatch { expected_manufacturer: String, expected_model: String, got: String },

    #[error("{model} not found in any mainframe slot")]
    NotPresent { model: String },

    #[error("mainframe not present (expected SIM900 at slot-select time)")]
    NoMainframe,

    #[error("store error: {0}")]
    Store(#[from] cryo_store::StoreError),

    #[error("schema error: {0}")]
    Schema(#[from] cryo_store::error::SchemaError),

    #[error("calibration error: {0}")]
    Calibration(#[from] cryo_store::calibration::CalibrationError),
}
