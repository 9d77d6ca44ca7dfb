// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Error taxonomy for the store crate (`spec.md` §7, `StoreError` and `SchemaError`).

use thiserror::Error;

/// Failures talking to the external key/value store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store connectivity lost: {0}")]
    Connection(#[from] redis::RedisError),

    #[error("key not present in store: {0}")]
    Missing(String),

    #[error("timeseries write to undeclared key {0:?}")]
    UndeclaredTimeseries(String),

    #[error("malformed timeseries response for {key}: {detail}")]
    MalformedTimeseries { key: String, detail: String },
}

/// User-originated bad command (`spec.md` §7 `SchemaError`).
#[derive(Debug, Error, Clone, PartialEq)]
pub enum SchemaError {
    #[error("unknown setting {0:?}")]
    InvalidSetting(String),

    #[error("value {value} is not valid for setting {setting:?}")]
    InvalidValue { setting: String, value: String },
}
