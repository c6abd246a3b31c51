// SPDX-FileCopyrightText: 2026 Stan Grams <sjg@haxx.space>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Error taxonomy for device exchanges.
//!
//! A response timeout is deliberately not an error: getters yield `Ok(None)`
//! when the device stays silent (off, asleep, or the command produces no
//! reply). Errors are reserved for streams that fail, responses that arrive
//! but do not parse, and arguments rejected before any I/O.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("serial port error: {0}")]
    Serial(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Response present but its body does not match the expected shape.
    /// Distinct from "no response", which is `Ok(None)` at the call site.
    #[error("unparseable {command} response: {body:?}")]
    Decode { command: String, body: String },

    /// Argument rejected locally, before anything went to the wire.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl DeviceError {
    pub fn decode(command: &str, body: &str) -> Self {
        Self::Decode {
            command: command.to_string(),
            body: body.to_string(),
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }

    /// True for malformed-response errors, false for stream-level failures.
    pub fn is_decode(&self) -> bool {
        matches!(self, Self::Decode { .. })
    }
}

pub type DeviceResult<T> = Result<T, DeviceError>;
