// SPDX-FileCopyrightText: 2026 Stan Grams <sjg@haxx.space>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Code tables shared by both devices.
//!
//! The KPA500 and KAT500 use the same 11-entry band-number table and the
//! same baud-rate table. Both are closed sets: a wire code outside the
//! table is a decode error, never a silently wrapped value.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{DeviceError, DeviceResult};

/// Amateur bands addressable on the band-number (`BN`) command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Band {
    B160m,
    B80m,
    B60m,
    B40m,
    B30m,
    B20m,
    B17m,
    B15m,
    B12m,
    B10m,
    B6m,
}

impl Band {
    pub const ALL: [Band; 11] = [
        Band::B160m,
        Band::B80m,
        Band::B60m,
        Band::B40m,
        Band::B30m,
        Band::B20m,
        Band::B17m,
        Band::B15m,
        Band::B12m,
        Band::B10m,
        Band::B6m,
    ];

    pub fn code(self) -> u8 {
        match self {
            Band::B160m => 0,
            Band::B80m => 1,
            Band::B60m => 2,
            Band::B40m => 3,
            Band::B30m => 4,
            Band::B20m => 5,
            Band::B17m => 6,
            Band::B15m => 7,
            Band::B12m => 8,
            Band::B10m => 9,
            Band::B6m => 10,
        }
    }

    pub fn from_code(code: u8) -> Option<Band> {
        Band::ALL.get(code as usize).copied()
    }

    /// Two-digit zero-padded encoding used on the wire.
    pub fn wire(self) -> String {
        format!("{:02}", self.code())
    }

    /// Decode a band-number response body.
    pub fn decode(command: &str, body: &str) -> DeviceResult<Band> {
        body.parse::<u8>()
            .ok()
            .and_then(Band::from_code)
            .ok_or_else(|| DeviceError::decode(command, body))
    }

    pub fn label(self) -> &'static str {
        match self {
            Band::B160m => "160m",
            Band::B80m => "80m",
            Band::B60m => "60m",
            Band::B40m => "40m",
            Band::B30m => "30m",
            Band::B20m => "20m",
            Band::B17m => "17m",
            Band::B15m => "15m",
            Band::B12m => "12m",
            Band::B10m => "10m",
            Band::B6m => "6m",
        }
    }
}

impl fmt::Display for Band {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Serial baud-rate settings shared by both devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BaudRate {
    Baud4800,
    Baud9600,
    Baud19200,
    Baud38400,
}

impl BaudRate {
    pub fn code(self) -> u8 {
        match self {
            BaudRate::Baud4800 => 0,
            BaudRate::Baud9600 => 1,
            BaudRate::Baud19200 => 2,
            BaudRate::Baud38400 => 3,
        }
    }

    pub fn from_code(code: u8) -> Option<BaudRate> {
        match code {
            0 => Some(BaudRate::Baud4800),
            1 => Some(BaudRate::Baud9600),
            2 => Some(BaudRate::Baud19200),
            3 => Some(BaudRate::Baud38400),
            _ => None,
        }
    }

    pub fn decode(command: &str, body: &str) -> DeviceResult<BaudRate> {
        body.parse::<u8>()
            .ok()
            .and_then(BaudRate::from_code)
            .ok_or_else(|| DeviceError::decode(command, body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_band_round_trip() {
        for band in Band::ALL {
            assert_eq!(Band::decode("BN", &band.wire()).unwrap(), band);
        }
    }

    #[test]
    fn test_band_rejects_out_of_table_codes() {
        for body in ["11", "42", "99"] {
            let err = Band::decode("BN", body).unwrap_err();
            assert!(err.is_decode(), "code {} must not wrap around", body);
        }
    }

    #[test]
    fn test_band_rejects_garbage() {
        assert!(Band::decode("BN", "x7").unwrap_err().is_decode());
        assert!(Band::decode("BN", "").unwrap_err().is_decode());
    }

    #[test]
    fn test_band_wire_is_zero_padded() {
        assert_eq!(Band::B160m.wire(), "00");
        assert_eq!(Band::B20m.wire(), "05");
        assert_eq!(Band::B6m.wire(), "10");
    }

    #[test]
    fn test_baud_rate_round_trip() {
        for code in 0..=3 {
            let rate = BaudRate::from_code(code).unwrap();
            assert_eq!(rate.code(), code);
        }
        assert!(BaudRate::from_code(4).is_none());
    }
}
