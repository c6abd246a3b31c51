// SPDX-FileCopyrightText: 2026 Stan Grams <sjg@haxx.space>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Polling state machine driving the amplifier/tuner pair.
//!
//! One recurring task refreshes the amplifier at a fast rate and the tuner
//! only when its slow background interval has elapsed or amplifier SWR
//! shows RF flowing. Control operations run on the caller's task; all I/O
//! for one device serializes behind that device's exchange lock, and the
//! snapshot is replaced read-modify-publish under a state lock so the poll
//! loop and control operations never publish from stale reads.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, sleep, Instant};
use tracing::{debug, warn};

use kombo_core::{Band, DeviceResult, Notifier, TunerPollPolicy};
use kombo_kat500::{Antenna, Kat500, TunerFault, TunerMode};
use kombo_kpa500::{AmpFault, Kpa500, OperatingMode, PowerSwr, VoltageCurrent};

use crate::state::ComboState;

const FULL_TUNE_ATTEMPTS: u32 = 3;
const FULL_TUNE_RETRY_DELAY: Duration = Duration::from_millis(250);

/// Poll cadence for the device pair.
#[derive(Debug, Clone)]
pub struct ComboConfig {
    /// Fast interval driving the amplifier refresh.
    pub amp_poll_interval: Duration,
    /// Slow background interval for the tuner while no RF is flowing.
    pub tuner_poll_interval: Duration,
}

impl Default for ComboConfig {
    fn default() -> Self {
        Self {
            amp_poll_interval: Duration::from_millis(250),
            tuner_poll_interval: Duration::from_secs(30),
        }
    }
}

struct Inner<S> {
    amp: Mutex<Option<Arc<Kpa500<S>>>>,
    tuner: Mutex<Option<Arc<Kat500<S>>>>,
    state: Mutex<ComboState>,
    notifier: Notifier<ComboState>,
    tuner_poll: TunerPollPolicy,
    last_tuner_poll: Mutex<Option<Instant>>,
    amp_poll_interval: Duration,
}

impl<S> Inner<S> {
    fn amp(&self) -> Option<Arc<Kpa500<S>>> {
        self.amp.lock().clone()
    }

    fn tuner(&self) -> Option<Arc<Kat500<S>>> {
        self.tuner.lock().clone()
    }

    /// Replace the snapshot under the state lock, then deliver the
    /// replacement to the listener.
    fn publish(&self, mutate: impl FnOnce(&mut ComboState)) -> ComboState {
        let snapshot = {
            let mut state = self.state.lock();
            mutate(&mut state);
            state.recompute_power();
            state.clone()
        };
        self.notifier.notify(&snapshot);
        snapshot
    }
}

struct PollHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

pub struct ComboModel<S> {
    inner: Arc<Inner<S>>,
    poll: Mutex<Option<PollHandle>>,
}

impl ComboModel<tokio_serial::SerialStream> {
    /// Connect whichever ports are configured, independently: one port
    /// failing to open does not abort the other. Returns true when at
    /// least one device connected; the snapshot's connection flags say
    /// which.
    pub async fn connect(
        &self,
        amp_port: Option<&str>,
        tuner_port: Option<&str>,
        baud: u32,
    ) -> bool {
        let amp = match amp_port {
            Some(port) => match Kpa500::connect(port, baud).await {
                Ok(amp) => Some(amp),
                Err(e) => {
                    warn!("KPA500 connect on {} failed: {}", port, e);
                    None
                }
            },
            None => None,
        };
        let tuner = match tuner_port {
            Some(port) => match Kat500::connect(port, baud).await {
                Ok(tuner) => Some(tuner),
                Err(e) => {
                    warn!("KAT500 connect on {} failed: {}", port, e);
                    None
                }
            },
            None => None,
        };
        self.attach(amp, tuner).await
    }
}

impl<S> ComboModel<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(config: ComboConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                amp: Mutex::new(None),
                tuner: Mutex::new(None),
                state: Mutex::new(ComboState::default()),
                notifier: Notifier::new(),
                tuner_poll: TunerPollPolicy::new(config.tuner_poll_interval),
                last_tuner_poll: Mutex::new(None),
                amp_poll_interval: config.amp_poll_interval,
            }),
            poll: Mutex::new(None),
        }
    }

    /// Register the snapshot listener, replacing any previous one. The
    /// listener runs synchronously on whichever task publishes and must
    /// not call back into the model.
    pub fn subscribe(&self, listener: impl Fn(&ComboState) + Send + Sync + 'static) {
        self.inner.notifier.subscribe(listener);
    }

    pub fn state(&self) -> ComboState {
        self.inner.state.lock().clone()
    }

    /// Install already-open device clients and run the connect protocol:
    /// reconcile combined power so both units track together, enable the
    /// tuner's idle sleep, and take one immediate tuner poll when it comes
    /// up powered.
    pub async fn attach(&self, amp: Option<Kpa500<S>>, tuner: Option<Kat500<S>>) -> bool {
        let amp = amp.map(Arc::new);
        let tuner = tuner.map(Arc::new);
        *self.inner.amp.lock() = amp.clone();
        *self.inner.tuner.lock() = tuner.clone();

        let mut amp_powered = match &amp {
            Some(amp) => match amp.is_powered_on() {
                Some(powered) => powered,
                None => amp.detect_power_state().await.unwrap_or(false),
            },
            None => false,
        };
        let mut tuner_powered = match &tuner {
            Some(tuner) => {
                let _ = tuner.wake().await;
                matches!(tuner.get_power_state().await, Ok(Some(true)))
            }
            None => false,
        };

        // Bring both to the same power state when exactly one came up on.
        if let (Some(amp_client), Some(tuner_client)) = (&amp, &tuner) {
            if amp_powered && !tuner_powered {
                let _ = tuner_client.wake().await;
                match tuner_client.power_on().await {
                    Ok(true) => tuner_powered = true,
                    Ok(false) => warn!("KAT500 power-on during connect was not confirmed"),
                    Err(e) => warn!("KAT500 power-on during connect failed: {}", e),
                }
            } else if tuner_powered && !amp_powered {
                match amp_client.power_on().await {
                    Ok(true) => amp_powered = true,
                    Ok(false) => warn!("KPA500 power-on during connect was not confirmed"),
                    Err(e) => warn!("KPA500 power-on during connect failed: {}", e),
                }
            }
        }

        // Non-fatal: the tuner works without its sleep mode, it just burns
        // more power.
        if let Some(tuner_client) = &tuner {
            match tuner_client.set_sleep_enabled(true).await {
                Ok(true) => {}
                Ok(false) => warn!("KAT500 sleep setting could not be verified"),
                Err(e) => warn!("KAT500 sleep setting failed: {}", e),
            }
        }

        let tuner_update = match (&tuner, tuner_powered) {
            (Some(tuner_client), true) => {
                let update = poll_tuner(tuner_client).await;
                *self.inner.last_tuner_poll.lock() = Some(Instant::now());
                Some(update)
            }
            _ => None,
        };

        let amp_connected = amp.is_some();
        let tuner_connected = tuner.is_some();
        self.inner.publish(|state| {
            state.amp_connected = amp_connected;
            state.tuner_connected = tuner_connected;
            state.amp.powered_on = amp_connected && amp_powered;
            state.tuner.powered_on = tuner_connected && tuner_powered;
            if let Some(update) = &tuner_update {
                merge_tuner(state, update);
            }
        });

        amp_connected || tuner_connected
    }

    /// Start the recurring poll task. Idempotent.
    pub fn start_polling(&self) {
        let mut poll = self.poll.lock();
        if poll.is_some() {
            return;
        }
        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(run_poll_loop(self.inner.clone(), shutdown_rx));
        *poll = Some(PollHandle { shutdown, task });
    }

    /// Stop the poll task, cancelling any in-flight wait promptly.
    pub async fn stop_polling(&self) {
        let handle = self.poll.lock().take();
        if let Some(handle) = handle {
            let _ = handle.shutdown.send(true);
            let _ = handle.task.await;
        }
    }

    pub async fn disconnect(&self) {
        self.stop_polling().await;
        *self.inner.amp.lock() = None;
        *self.inner.tuner.lock() = None;
        *self.inner.last_tuner_poll.lock() = None;
        self.inner.publish(|state| *state = ComboState::default());
    }

    // Control operations. All of them publish an updated snapshot only on
    // device-confirmed success.

    /// Power both configured devices on. Combined success requires every
    /// configured device to confirm; the snapshot reflects whichever
    /// devices did change.
    pub async fn power_on(&self) -> bool {
        let amp = self.inner.amp();
        let tuner = self.inner.tuner();
        if amp.is_none() && tuner.is_none() {
            return false;
        }

        let mut all_ok = true;
        let mut amp_on = None;
        let mut tuner_on = None;

        if let Some(amp) = amp {
            match amp.power_on().await {
                Ok(true) => amp_on = Some(true),
                Ok(false) => {
                    warn!("KPA500 power-on was not confirmed");
                    all_ok = false;
                }
                Err(e) => {
                    warn!("KPA500 power-on failed: {}", e);
                    all_ok = false;
                }
            }
        }
        if let Some(tuner) = tuner {
            let _ = tuner.wake().await;
            match tuner.power_on().await {
                Ok(true) => tuner_on = Some(true),
                Ok(false) => {
                    warn!("KAT500 power-on was not confirmed");
                    all_ok = false;
                }
                Err(e) => {
                    warn!("KAT500 power-on failed: {}", e);
                    all_ok = false;
                }
            }
        }

        if amp_on.is_some() || tuner_on.is_some() {
            self.inner.publish(|state| {
                if let Some(on) = amp_on {
                    state.amp.powered_on = on;
                }
                if let Some(on) = tuner_on {
                    state.tuner.powered_on = on;
                }
            });
        }
        all_ok
    }

    /// Power both devices down. The amplifier is forced to standby first:
    /// power is never removed while it is armed to transmit.
    pub async fn power_off(&self) -> bool {
        let amp = self.inner.amp();
        let tuner = self.inner.tuner();
        if amp.is_none() && tuner.is_none() {
            return false;
        }

        let mut all_ok = true;
        let mut amp_off = None;
        let mut tuner_off = None;

        if let Some(amp) = amp {
            let standby = matches!(amp.set_standby().await, Ok(true));
            if standby {
                match amp.power_off().await {
                    Ok(true) => amp_off = Some(true),
                    Ok(false) => {
                        warn!("KPA500 power-off was not confirmed");
                        all_ok = false;
                    }
                    Err(e) => {
                        warn!("KPA500 power-off failed: {}", e);
                        all_ok = false;
                    }
                }
            } else {
                warn!("KPA500 power-off skipped: standby was not confirmed");
                all_ok = false;
            }
        }
        if let Some(tuner) = tuner {
            let _ = tuner.wake().await;
            match tuner.power_off().await {
                Ok(true) => tuner_off = Some(true),
                Ok(false) => {
                    warn!("KAT500 power-off was not confirmed");
                    all_ok = false;
                }
                Err(e) => {
                    warn!("KAT500 power-off failed: {}", e);
                    all_ok = false;
                }
            }
        }

        if amp_off.is_some() || tuner_off.is_some() {
            self.inner.publish(|state| {
                if amp_off == Some(true) {
                    state.amp.powered_on = false;
                    state.amp.operating_mode = Some(OperatingMode::Standby);
                }
                if tuner_off == Some(true) {
                    state.tuner.powered_on = false;
                }
            });
        }
        all_ok
    }

    pub async fn toggle_power(&self) -> bool {
        if self.state().powered_on {
            self.power_off().await
        } else {
            self.power_on().await
        }
    }

    pub async fn set_operating_mode(&self, mode: OperatingMode) -> bool {
        if !self.state().powered_on {
            return false;
        }
        let Some(amp) = self.inner.amp() else {
            return false;
        };
        match amp.set_operating_mode(mode).await {
            Ok(true) => {
                self.inner.publish(|state| state.amp.operating_mode = Some(mode));
                true
            }
            Ok(false) => false,
            Err(e) => {
                warn!("KPA500 mode change failed: {}", e);
                false
            }
        }
    }

    pub async fn set_standby(&self) -> bool {
        self.set_operating_mode(OperatingMode::Standby).await
    }

    pub async fn set_operate(&self) -> bool {
        self.set_operating_mode(OperatingMode::Operate).await
    }

    pub async fn set_band(&self, band: Band) -> bool {
        if !self.state().powered_on {
            return false;
        }
        let Some(amp) = self.inner.amp() else {
            return false;
        };
        match amp.set_band(band).await {
            Ok(true) => {
                self.inner.publish(|state| state.amp.band = Some(band));
                true
            }
            Ok(false) => false,
            Err(e) => {
                warn!("KPA500 band change failed: {}", e);
                false
            }
        }
    }

    pub async fn clear_amp_fault(&self) -> bool {
        if !self.state().powered_on {
            return false;
        }
        let Some(amp) = self.inner.amp() else {
            return false;
        };
        match amp.clear_fault().await {
            Ok(true) => {
                self.inner
                    .publish(|state| state.amp.fault = Some(AmpFault::None));
                true
            }
            Ok(false) => false,
            Err(e) => {
                warn!("KPA500 fault clear failed: {}", e);
                false
            }
        }
    }

    pub async fn clear_tuner_fault(&self) -> bool {
        if !self.state().powered_on {
            return false;
        }
        let Some(tuner) = self.inner.tuner() else {
            return false;
        };
        let _ = tuner.wake().await;
        match tuner.clear_fault().await {
            Ok(true) => {
                self.inner
                    .publish(|state| state.tuner.fault = Some(TunerFault::None));
                true
            }
            Ok(false) => false,
            Err(e) => {
                warn!("KAT500 fault clear failed: {}", e);
                false
            }
        }
    }

    pub async fn set_tuner_mode(&self, mode: TunerMode) -> bool {
        if !self.state().powered_on {
            return false;
        }
        let Some(tuner) = self.inner.tuner() else {
            return false;
        };
        let _ = tuner.wake().await;
        match tuner.set_mode(mode).await {
            Ok(true) => {
                self.inner.publish(|state| state.tuner.mode = Some(mode));
                true
            }
            Ok(false) => false,
            Err(e) => {
                warn!("KAT500 mode change failed: {}", e);
                false
            }
        }
    }

    pub async fn set_antenna(&self, antenna: Antenna) -> bool {
        if !self.state().powered_on {
            return false;
        }
        let Some(tuner) = self.inner.tuner() else {
            return false;
        };
        let _ = tuner.wake().await;
        match tuner.set_antenna(antenna).await {
            Ok(true) => {
                self.inner
                    .publish(|state| state.tuner.antenna = Some(antenna));
                true
            }
            Ok(false) => false,
            Err(e) => {
                warn!("KAT500 antenna change failed: {}", e);
                false
            }
        }
    }

    /// Trigger a full tune cycle.
    ///
    /// The amplifier must confirm standby before anything is sent to the
    /// tuner: a tune must never coincide with RF from the amplifier. The
    /// tuner's trigger can be silently missed while its relay network is
    /// mid-settle, so the trigger is attempted a few times. Success sets
    /// the tuning flag immediately; completion is observed later through
    /// normal polling of the tune-in-progress field.
    pub async fn full_tune(&self) -> bool {
        if !self.state().powered_on {
            return false;
        }
        if let Some(amp) = self.inner.amp() {
            match amp.set_standby().await {
                Ok(true) => {
                    self.inner
                        .publish(|state| state.amp.operating_mode = Some(OperatingMode::Standby));
                }
                Ok(false) | Err(_) => {
                    warn!("full tune aborted: KPA500 standby was not confirmed");
                    return false;
                }
            }
        }
        let Some(tuner) = self.inner.tuner() else {
            return false;
        };
        let _ = tuner.wake().await;
        for attempt in 0..FULL_TUNE_ATTEMPTS {
            match tuner.full_tune().await {
                Ok(true) => {
                    self.inner.publish(|state| state.tuner.tuning = true);
                    return true;
                }
                Ok(false) => debug!("full tune attempt {} was not confirmed", attempt + 1),
                Err(e) => warn!("full tune attempt {} failed: {}", attempt + 1, e),
            }
            if attempt + 1 < FULL_TUNE_ATTEMPTS {
                sleep(FULL_TUNE_RETRY_DELAY).await;
            }
        }
        false
    }
}

async fn run_poll_loop<S>(inner: Arc<Inner<S>>, mut shutdown: watch::Receiver<bool>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let mut tick = time::interval(inner.amp_poll_interval);
    tick.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = tick.tick() => poll_once(&inner).await,
            _ = shutdown.changed() => break,
        }
    }
    debug!("poll loop stopped");
}

/// One poll iteration: always the amplifier, the tuner only when due, and
/// an unconditional snapshot publish at the end.
async fn poll_once<S>(inner: &Inner<S>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let amp_update = match inner.amp() {
        Some(amp) => Some(poll_amp(&amp).await),
        None => None,
    };
    // Fresh SWR decides whether RF is flowing; with no amplifier the
    // background interval alone gates the tuner.
    let amp_swr = amp_update
        .as_ref()
        .and_then(|update| update.power_swr.map(|reading| reading.swr));

    let tuner_update = match inner.tuner() {
        Some(tuner) => {
            let last_poll = *inner.last_tuner_poll.lock();
            if inner.tuner_poll.should_poll(last_poll, amp_swr) {
                let update = poll_tuner(&tuner).await;
                *inner.last_tuner_poll.lock() = Some(Instant::now());
                Some(update)
            } else {
                None
            }
        }
        None => None,
    };

    inner.publish(|state| {
        if let Some(update) = &amp_update {
            merge_amp(state, update);
        }
        if let Some(update) = &tuner_update {
            merge_tuner(state, update);
        }
    });
}

#[derive(Default)]
struct AmpPoll {
    powered: Option<bool>,
    operating_mode: Option<OperatingMode>,
    band: Option<Band>,
    power_swr: Option<PowerSwr>,
    temperature: Option<i16>,
    voltage_current: Option<VoltageCurrent>,
    fault: Option<AmpFault>,
}

async fn poll_amp<S>(amp: &Kpa500<S>) -> AmpPoll
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut update = AmpPoll {
        powered: field("KPA500", "power state", amp.get_power_state().await),
        ..Default::default()
    };
    // Silent or off: probing the remaining fields would cost a timeout
    // each for nothing.
    if update.powered != Some(true) {
        return update;
    }
    update.operating_mode = field("KPA500", "operating mode", amp.get_operating_mode().await);
    update.band = field("KPA500", "band", amp.get_band().await);
    update.power_swr = field("KPA500", "power/SWR", amp.get_power_swr().await);
    update.temperature = field("KPA500", "temperature", amp.get_temperature().await);
    update.voltage_current = field("KPA500", "voltage/current", amp.get_voltage_current().await);
    update.fault = field("KPA500", "fault", amp.get_fault().await);
    update
}

fn merge_amp(state: &mut ComboState, update: &AmpPoll) {
    if update.powered != Some(true) {
        state.amp.powered_on = false;
        return;
    }
    state.amp.powered_on = true;
    // Always-refreshed fields take the poll result as-is; an absent
    // primary reading means no RF is flowing.
    state.amp.operating_mode = update.operating_mode;
    state.amp.fault = update.fault;
    match update.power_swr {
        Some(reading) => {
            state.amp.power_watts = reading.watts;
            state.amp.swr = reading.swr;
        }
        None => {
            state.amp.power_watts = 0;
            state.amp.swr = TunerPollPolicy::IDLE_SWR;
        }
    }
    // The rest keep their last known good value across an absent read.
    if update.band.is_some() {
        state.amp.band = update.band;
    }
    if update.temperature.is_some() {
        state.amp.temperature = update.temperature;
    }
    if let Some(reading) = update.voltage_current {
        state.amp.voltage = Some(reading.volts);
        state.amp.current = Some(reading.amps);
    }
}

#[derive(Default)]
struct TunerPoll {
    powered: Option<bool>,
    mode: Option<TunerMode>,
    antenna: Option<Antenna>,
    vswr: Option<f32>,
    vswr_bypass: Option<f32>,
    forward_voltage: Option<u16>,
    reflected_voltage: Option<u16>,
    fault: Option<TunerFault>,
    tuning: Option<bool>,
}

async fn poll_tuner<S>(tuner: &Kat500<S>) -> TunerPoll
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let awake = match tuner.wake().await {
        Ok(awake) => awake,
        Err(e) => {
            warn!("KAT500 wake failed: {}", e);
            false
        }
    };
    if !awake {
        // Ten unanswered pings; the tuner is off, not merely asleep.
        return TunerPoll::default();
    }

    let mut update = TunerPoll {
        powered: field("KAT500", "power state", tuner.get_power_state().await),
        ..Default::default()
    };
    if update.powered != Some(true) {
        return update;
    }
    update.mode = field("KAT500", "mode", tuner.get_mode().await);
    update.antenna = field("KAT500", "antenna", tuner.get_antenna().await);
    update.vswr = field("KAT500", "VSWR", tuner.get_vswr().await);
    update.vswr_bypass = field("KAT500", "bypass VSWR", tuner.get_vswr_bypass().await);
    update.forward_voltage = field("KAT500", "forward voltage", tuner.get_forward_voltage().await);
    update.reflected_voltage = field(
        "KAT500",
        "reflected voltage",
        tuner.get_reflected_voltage().await,
    );
    update.fault = field("KAT500", "fault", tuner.get_fault().await);
    update.tuning = match tuner.is_tuning().await {
        Ok(tuning) => Some(tuning),
        Err(e) => {
            warn!("KAT500 tune status read failed: {}", e);
            None
        }
    };
    update
}

fn merge_tuner(state: &mut ComboState, update: &TunerPoll) {
    if update.powered != Some(true) {
        state.tuner.powered_on = false;
        state.tuner.tuning = false;
        return;
    }
    state.tuner.powered_on = true;
    state.tuner.mode = update.mode;
    state.tuner.fault = update.fault;
    state.tuner.vswr = update.vswr;
    state.tuner.tuning = update.tuning.unwrap_or(false);
    if update.antenna.is_some() {
        state.tuner.antenna = update.antenna;
    }
    if update.vswr_bypass.is_some() {
        state.tuner.vswr_bypass = update.vswr_bypass;
    }
    if update.forward_voltage.is_some() {
        state.tuner.forward_voltage = update.forward_voltage;
    }
    if update.reflected_voltage.is_some() {
        state.tuner.reflected_voltage = update.reflected_voltage;
    }
}

fn field<T>(device: &str, name: &str, result: DeviceResult<Option<T>>) -> Option<T> {
    match result {
        Ok(value) => value,
        Err(e) => {
            warn!("{} {} read failed: {}", device, name, e);
            None
        }
    }
}
