// SPDX-FileCopyrightText: 2026 Stan Grams <sjg@haxx.space>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Configuration file support for kombod.
//!
//! Config is loaded from `kombo.toml`. Search order:
//! 1. Path given via `--config`
//! 2. `./kombo.toml`
//!
//! Every field has a default, and CLI arguments override the file.

use std::path::Path;

use serde::{Deserialize, Serialize};

pub type ConfigResult<T> = Result<T, Box<dyn std::error::Error>>;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KombodConfig {
    /// Serial port for the KPA500 amplifier.
    pub amp_port: Option<String>,
    /// Serial port for the KAT500 tuner.
    pub tuner_port: Option<String>,
    /// Baud rate used on both ports.
    pub baud: u32,
    /// Fast poll interval driving the amplifier, in milliseconds.
    pub poll_interval_ms: u64,
    /// Slow background poll interval for the tuner, in seconds.
    pub tuner_interval_secs: u64,
}

impl Default for KombodConfig {
    fn default() -> Self {
        Self {
            amp_port: None,
            tuner_port: None,
            baud: 38400,
            poll_interval_ms: 250,
            tuner_interval_secs: 30,
        }
    }
}

impl KombodConfig {
    pub fn load(path: Option<&Path>) -> ConfigResult<Self> {
        match path {
            Some(path) => Self::from_file(path),
            None => {
                let default_path = Path::new("kombo.toml");
                if default_path.exists() {
                    Self::from_file(default_path)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    fn from_file(path: &Path) -> ConfigResult<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| format!("cannot read {}: {}", path.display(), e))?;
        let config = toml::from_str(&raw)
            .map_err(|e| format!("cannot parse {}: {}", path.display(), e))?;
        Ok(config)
    }
}
