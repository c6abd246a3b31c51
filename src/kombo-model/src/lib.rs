// SPDX-FileCopyrightText: 2026 Stan Grams <sjg@haxx.space>
//
// SPDX-License-Identifier: BSD-2-Clause

pub mod model;
pub mod state;

pub use model::{ComboConfig, ComboModel};
pub use state::{AmpStatus, ComboState, TunerStatus};
