// SPDX-FileCopyrightText: 2026 Stan Grams <sjg@haxx.space>
//
// SPDX-License-Identifier: BSD-2-Clause

//! kombod - headless control/monitor daemon for a KPA500/KAT500 pair.
//!
//! Connects to whichever devices are configured, prints state transitions
//! (or JSON lines with `--json`) as the poll loop publishes them, and runs
//! until Ctrl-C. The `full-tune` subcommand powers the pair on if needed,
//! triggers a tune cycle, and can wait for it to finish.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::signal;
use tokio::sync::mpsc;
use tokio::time;
use tracing::{error, info, warn};

use kombo_kat500::TunerFault;
use kombo_kpa500::OperatingMode;
use kombo_model::{ComboConfig, ComboModel, ComboState};
use tokio_serial::SerialStream;

mod config;

use crate::config::KombodConfig;

type DynResult<T> = Result<T, Box<dyn std::error::Error>>;

/// Poll the tuner at least this often while waiting on a tune to finish.
const TUNE_WAIT_INTERVAL: Duration = Duration::from_secs(5);

const PKG_DESCRIPTION: &str = concat!(env!("CARGO_PKG_NAME"), " - ", env!("CARGO_PKG_DESCRIPTION"));

#[derive(Debug, Parser)]
#[command(version = env!("CARGO_PKG_VERSION"), about = PKG_DESCRIPTION)]
struct Cli {
    /// Serial port for the KPA500 amplifier
    #[arg(long = "amp-port")]
    amp_port: Option<String>,
    /// Serial port for the KAT500 tuner
    #[arg(long = "tuner-port")]
    tuner_port: Option<String>,
    /// Baud rate for both ports
    #[arg(short = 'b', long)]
    baud: Option<u32>,
    /// Amplifier poll interval in milliseconds
    #[arg(long = "poll-interval")]
    poll_interval_ms: Option<u64>,
    /// Tuner background poll interval in seconds
    #[arg(long = "tuner-interval")]
    tuner_interval_secs: Option<u64>,
    /// Path to a kombo.toml config file
    #[arg(short = 'c', long)]
    config: Option<PathBuf>,
    /// Emit every state change as a JSON line instead of a summary
    #[arg(long)]
    json: bool,
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Trigger a full tune cycle
    FullTune {
        /// Block until the tuner reports the tune finished
        #[arg(long)]
        wait: bool,
    },
}

#[tokio::main]
async fn main() -> DynResult<()> {
    init_tracing();

    let cli = Cli::parse();
    let mut config = KombodConfig::load(cli.config.as_deref())?;
    if cli.amp_port.is_some() {
        config.amp_port = cli.amp_port.clone();
    }
    if cli.tuner_port.is_some() {
        config.tuner_port = cli.tuner_port.clone();
    }
    if let Some(baud) = cli.baud {
        config.baud = baud;
    }
    if let Some(interval) = cli.poll_interval_ms {
        config.poll_interval_ms = interval;
    }
    if let Some(interval) = cli.tuner_interval_secs {
        config.tuner_interval_secs = interval;
    }

    if config.amp_port.is_none() && config.tuner_port.is_none() {
        return Err("at least one of --amp-port / --tuner-port must be configured".into());
    }

    let mut tuner_interval = Duration::from_secs(config.tuner_interval_secs);
    if matches!(&cli.command, Some(Command::FullTune { wait: true })) {
        // Tune completion is observed through polling; do not let a long
        // background interval stretch the wait.
        tuner_interval = tuner_interval.min(TUNE_WAIT_INTERVAL);
    }

    let model = ComboModel::new(ComboConfig {
        amp_poll_interval: Duration::from_millis(config.poll_interval_ms),
        tuner_poll_interval: tuner_interval,
    });

    // The listener must stay cheap, so it only enqueues; a separate task
    // does the printing.
    let (state_tx, state_rx) = mpsc::unbounded_channel::<ComboState>();
    model.subscribe(move |state| {
        let _ = state_tx.send(state.clone());
    });
    tokio::spawn(print_states(state_rx, cli.json));

    info!(
        "Connecting (amp: {}, tuner: {}, {} baud)",
        config.amp_port.as_deref().unwrap_or("-"),
        config.tuner_port.as_deref().unwrap_or("-"),
        config.baud
    );
    let connected = model
        .connect(
            config.amp_port.as_deref(),
            config.tuner_port.as_deref(),
            config.baud,
        )
        .await;
    if !connected {
        error!("No device connected; nothing to poll");
        std::process::exit(1);
    }
    let state = model.state();
    info!(
        "Connected (amp: {}, tuner: {}, power: {})",
        if state.amp_connected { "yes" } else { "no" },
        if state.tuner_connected { "yes" } else { "no" },
        if state.powered_on { "on" } else { "off" }
    );

    match cli.command {
        Some(Command::FullTune { wait }) => {
            let result = run_full_tune(&model, wait).await;
            model.disconnect().await;
            result?;
        }
        None => {
            model.start_polling();
            info!("Polling started; Ctrl-C to exit");
            signal::ctrl_c().await?;
            info!("Ctrl-C received, shutting down");
            model.disconnect().await;
        }
    }

    Ok(())
}

fn init_tracing() {
    // Uses default formatting and RUST_LOG if available.
    tracing_subscriber::fmt().with_target(false).init();
}

async fn run_full_tune(model: &ComboModel<SerialStream>, wait: bool) -> DynResult<()> {
    if !model.state().powered_on {
        info!("Devices are off; powering on");
        if !model.power_on().await {
            return Err("failed to power on both devices".into());
        }
    }

    if !model.full_tune().await {
        return Err("full tune did not start".into());
    }
    info!("Full tune started");

    if wait {
        model.start_polling();
        loop {
            time::sleep(Duration::from_millis(500)).await;
            let state = model.state();
            if !state.tuner.tuning {
                match state.tuner.vswr {
                    Some(vswr) => info!("Tune complete, VSWR {:.2}", vswr),
                    None => info!("Tune complete"),
                }
                if let Some(fault) = state.tuner.fault {
                    if fault != TunerFault::None {
                        warn!("Tuner fault: {:?}", fault);
                    }
                }
                break;
            }
        }
        model.stop_polling().await;
    }
    Ok(())
}

/// Print each distinct snapshot the model publishes.
async fn print_states(mut state_rx: mpsc::UnboundedReceiver<ComboState>, json: bool) {
    let mut last: Option<ComboState> = None;
    while let Some(state) = state_rx.recv().await {
        if last.as_ref() == Some(&state) {
            continue;
        }
        if json {
            match serde_json::to_string(&state) {
                Ok(line) => println!("{}", line),
                Err(e) => error!("snapshot serialization failed: {}", e),
            }
        } else {
            println!("{}", summarize(&state));
        }
        last = Some(state);
    }
}

fn summarize(state: &ComboState) -> String {
    let amp = if !state.amp_connected {
        "amp --".to_string()
    } else if !state.amp.powered_on {
        "amp off".to_string()
    } else {
        format!(
            "amp on {} {} {}W swr {:.1}{}",
            match state.amp.operating_mode {
                Some(OperatingMode::Standby) => "standby",
                Some(OperatingMode::Operate) => "operate",
                None => "?",
            },
            state
                .amp
                .band
                .map(|band| band.label())
                .unwrap_or("?"),
            state.amp.power_watts,
            state.amp.swr,
            match state.amp.fault {
                Some(fault) if fault.code() != 0 => format!(" FAULT {:?}", fault),
                _ => String::new(),
            }
        )
    };

    let tuner = if !state.tuner_connected {
        "tuner --".to_string()
    } else if !state.tuner.powered_on {
        "tuner off".to_string()
    } else {
        format!(
            "tuner on {}{}{}{}",
            match state.tuner.mode {
                Some(mode) => format!("{:?} ", mode).to_lowercase(),
                None => String::new(),
            },
            match state.tuner.antenna {
                Some(antenna) => format!("ant{} ", antenna.code()),
                None => String::new(),
            },
            match state.tuner.vswr {
                Some(vswr) => format!("vswr {:.2}", vswr),
                None => "vswr -".to_string(),
            },
            if state.tuner.tuning { " TUNING" } else { "" }
        )
    };

    format!("{} | {}", amp, tuner)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summarize_disconnected() {
        let state = ComboState::default();
        assert_eq!(summarize(&state), "amp -- | tuner --");
    }

    #[test]
    fn test_summarize_powered_pair() {
        let mut state = ComboState {
            amp_connected: true,
            tuner_connected: true,
            ..Default::default()
        };
        state.amp.powered_on = true;
        state.amp.operating_mode = Some(OperatingMode::Operate);
        state.amp.band = Some(kombo_core::Band::B20m);
        state.amp.power_watts = 420;
        state.amp.swr = 1.5;
        state.tuner.powered_on = true;
        state.tuner.mode = Some(kombo_kat500::TunerMode::Auto);
        state.tuner.antenna = Some(kombo_kat500::Antenna::Ant1);
        state.tuner.vswr = Some(1.22);
        state.recompute_power();

        assert_eq!(
            summarize(&state),
            "amp on operate 20m 420W swr 1.5 | tuner on auto ant1 vswr 1.22"
        );
    }
}
