// SPDX-FileCopyrightText: 2026 Stan Grams <sjg@haxx.space>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Combined state snapshot for the amplifier/tuner pair.
//!
//! The snapshot is replaced wholesale on every poll or control result, and
//! the replacement is what gets handed to the listener; nothing mutates a
//! published snapshot in place.

use serde::Serialize;

use kombo_core::Band;
use kombo_kat500::{Antenna, TunerFault, TunerMode};
use kombo_kpa500::{AmpFault, OperatingMode};

/// Amplifier side of the snapshot.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AmpStatus {
    pub powered_on: bool,
    pub operating_mode: Option<OperatingMode>,
    pub band: Option<Band>,
    pub power_watts: u16,
    pub swr: f32,
    pub temperature: Option<i16>,
    pub voltage: Option<f32>,
    pub current: Option<f32>,
    pub fault: Option<AmpFault>,
}

impl Default for AmpStatus {
    fn default() -> Self {
        Self {
            powered_on: false,
            operating_mode: None,
            band: None,
            power_watts: 0,
            swr: 1.0,
            temperature: None,
            voltage: None,
            current: None,
            fault: None,
        }
    }
}

/// Tuner side of the snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TunerStatus {
    pub powered_on: bool,
    pub mode: Option<TunerMode>,
    pub antenna: Option<Antenna>,
    pub vswr: Option<f32>,
    pub vswr_bypass: Option<f32>,
    pub forward_voltage: Option<u16>,
    pub reflected_voltage: Option<u16>,
    pub fault: Option<TunerFault>,
    pub tuning: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ComboState {
    pub amp_connected: bool,
    pub tuner_connected: bool,
    /// Derived: true iff every connected device reports itself powered on.
    /// With a single device configured, that device's flag is authoritative.
    pub powered_on: bool,
    pub amp: AmpStatus,
    pub tuner: TunerStatus,
}

impl ComboState {
    /// Recompute the combined power flag from the per-device flags.
    pub fn recompute_power(&mut self) {
        let mut any_connected = false;
        let mut all_powered = true;
        if self.amp_connected {
            any_connected = true;
            all_powered &= self.amp.powered_on;
        }
        if self.tuner_connected {
            any_connected = true;
            all_powered &= self.tuner.powered_on;
        }
        self.powered_on = any_connected && all_powered;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_combined_power_requires_every_connected_device() {
        let mut state = ComboState {
            amp_connected: true,
            tuner_connected: true,
            ..Default::default()
        };
        state.amp.powered_on = true;
        state.tuner.powered_on = false;
        state.recompute_power();
        assert!(!state.powered_on);

        state.tuner.powered_on = true;
        state.recompute_power();
        assert!(state.powered_on);
    }

    #[test]
    fn test_single_device_power_is_authoritative() {
        let mut state = ComboState {
            amp_connected: true,
            ..Default::default()
        };
        state.amp.powered_on = true;
        // Tuner not configured; its (off) flag must not veto.
        state.recompute_power();
        assert!(state.powered_on);
    }

    #[test]
    fn test_no_connected_devices_means_no_power() {
        let mut state = ComboState::default();
        state.amp.powered_on = true;
        state.recompute_power();
        assert!(!state.powered_on);
    }
}
