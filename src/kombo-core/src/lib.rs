// SPDX-FileCopyrightText: 2026 Stan Grams <sjg@haxx.space>
//
// SPDX-License-Identifier: BSD-2-Clause

pub mod codes;
pub mod error;
pub mod line;
pub mod observer;
pub mod policies;

pub use codes::{Band, BaudRate};
pub use error::{DeviceError, DeviceResult};
pub use line::LineProtocol;
pub use observer::Notifier;
pub use policies::{FixedDelay, TunerPollPolicy};
