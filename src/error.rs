// Symphonia
// Copyright (c) 2019-2022 The Project Symphonia Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The `error` module defines the common error type used across the stage framework.

use std::error::Error as StdError;
use std::fmt;
use std::result;

/// `StageError` enumerates every way a stage call can fail: bad construction-time configuration,
/// a per-call contract violation, or a state-exchange (serialize/deserialize) mismatch.
///
/// None of these are retried internally, and none corrupt existing stage state: validation always
/// happens before any mutation.
#[derive(Debug)]
pub enum StageError {
    /// Invalid configuration supplied at construction (negative threshold, zero window, `alpha`
    /// out of `(0, 1]`, etc). No partial stage is ever created.
    Config(String),
    /// A per-call contract violation: wrong channel count for a stage that fixes it, or a call to
    /// `process` on a stage that declares itself resizing.
    Contract(String),
    /// A serialized payload disagrees with the stage's own configuration, or fails a cross-field
    /// validation (e.g. a restored running sum that doesn't match its window contents).
    StateMismatch(String),
}

impl fmt::Display for StageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StageError::Config(msg) => write!(f, "invalid stage configuration: {}", msg),
            StageError::Contract(msg) => write!(f, "stage contract violation: {}", msg),
            StageError::StateMismatch(msg) => write!(f, "state exchange failed: {}", msg),
        }
    }
}

impl StdError for StageError {}

pub type Result<T> = result::Result<T, StageError>;

/// Convenience function to create a configuration error.
pub fn config_error<T>(msg: impl Into<String>) -> Result<T> {
    Err(StageError::Config(msg.into()))
}

/// Convenience function to create a contract error.
pub fn contract_error<T>(msg: impl Into<String>) -> Result<T> {
    Err(StageError::Contract(msg.into()))
}

/// Convenience function to create a state-exchange error.
pub fn state_error<T>(msg: impl Into<String>) -> Result<T> {
    Err(StageError::StateMismatch(msg.into()))
}
