// SPDX-FileCopyrightText: 2026 Stan Grams <sjg@haxx.space>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Command client for the Elecraft KAT500 automatic antenna tuner.
//!
//! The KAT500 frames exchanges as `<CMD><DATA>;` with no prefix and echoes
//! an accepted set on the same exchange, so setters verify against that
//! echo. The tuner drops into a low-power sleep when idle and ignores
//! framed commands until pinged awake; callers are expected to [`wake`]
//! before any operation, which costs a single ping when it is already up.
//!
//! [`wake`]: Kat500::wake

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::sleep;
use tokio_serial::SerialPortBuilderExt;

use kombo_core::line::LineProtocol;
use kombo_core::{Band, BaudRate, DeviceError, DeviceResult, FixedDelay};

pub const DEFAULT_BAUD: u32 = 38400;

const RESPONSE_TIMEOUT: Duration = Duration::from_millis(100);

const WAKE_ATTEMPTS: u32 = 10;
const WAKE_INTERVAL: Duration = Duration::from_millis(100);

/// Tuner operating mode (`MD`), encoded as single letters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TunerMode {
    Bypass,
    Manual,
    Auto,
}

impl TunerMode {
    pub fn wire(self) -> &'static str {
        match self {
            TunerMode::Bypass => "B",
            TunerMode::Manual => "M",
            TunerMode::Auto => "A",
        }
    }

    fn decode(body: &str) -> DeviceResult<Self> {
        match body {
            "B" => Ok(TunerMode::Bypass),
            "M" => Ok(TunerMode::Manual),
            "A" => Ok(TunerMode::Auto),
            _ => Err(DeviceError::decode("MD", body)),
        }
    }
}

/// Antenna selection (`AN`), 1-3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Antenna {
    Ant1,
    Ant2,
    Ant3,
}

impl Antenna {
    pub fn code(self) -> u8 {
        match self {
            Antenna::Ant1 => 1,
            Antenna::Ant2 => 2,
            Antenna::Ant3 => 3,
        }
    }

    pub fn from_code(code: u8) -> Option<Antenna> {
        match code {
            1 => Some(Antenna::Ant1),
            2 => Some(Antenna::Ant2),
            3 => Some(Antenna::Ant3),
            _ => None,
        }
    }

    fn decode(body: &str) -> DeviceResult<Self> {
        body.parse::<u8>()
            .ok()
            .and_then(Antenna::from_code)
            .ok_or_else(|| DeviceError::decode("AN", body))
    }
}

/// Tuner fault codes (`FLT`), a closed 0-3 table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TunerFault {
    None,
    NoMatch,
    PowerAboveDesignLimit,
    PowerAboveRelaySwitchLimit,
}

impl TunerFault {
    pub const ALL: [TunerFault; 4] = [
        TunerFault::None,
        TunerFault::NoMatch,
        TunerFault::PowerAboveDesignLimit,
        TunerFault::PowerAboveRelaySwitchLimit,
    ];

    pub fn code(self) -> u8 {
        Self::ALL
            .iter()
            .position(|fault| *fault == self)
            .unwrap_or(0) as u8
    }

    pub fn from_code(code: u8) -> Option<TunerFault> {
        Self::ALL.get(code as usize).copied()
    }

    fn decode(body: &str) -> DeviceResult<Self> {
        body.parse::<u8>()
            .ok()
            .and_then(TunerFault::from_code)
            .ok_or_else(|| DeviceError::decode("FLT", body))
    }
}

/// Tuner network topology (`SIDE`): which side of the LC network faces the
/// transmitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NetworkSide {
    Transmitter,
    Antenna,
}

impl NetworkSide {
    pub fn wire(self) -> &'static str {
        match self {
            NetworkSide::Transmitter => "T",
            NetworkSide::Antenna => "A",
        }
    }

    fn decode(body: &str) -> DeviceResult<Self> {
        match body {
            "T" => Ok(NetworkSide::Transmitter),
            "A" => Ok(NetworkSide::Antenna),
            _ => Err(DeviceError::decode("SIDE", body)),
        }
    }
}

/// Bypass relay state (`BYP`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BypassState {
    NotBypassed,
    Bypassed,
}

impl BypassState {
    pub fn wire(self) -> &'static str {
        match self {
            BypassState::NotBypassed => "N",
            BypassState::Bypassed => "B",
        }
    }

    fn decode(body: &str) -> DeviceResult<Self> {
        match body {
            "N" => Ok(BypassState::NotBypassed),
            "B" => Ok(BypassState::Bypassed),
            _ => Err(DeviceError::decode("BYP", body)),
        }
    }
}

/// Per-band SWR threshold family (`ST`): which decision the threshold
/// gates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThresholdKind {
    AutoTune,
    Bypass,
    KeyInterrupt,
}

impl ThresholdKind {
    fn letter(self) -> char {
        match self {
            ThresholdKind::AutoTune => 'A',
            ThresholdKind::Bypass => 'B',
            ThresholdKind::KeyInterrupt => 'K',
        }
    }
}

pub struct Kat500<S> {
    line: LineProtocol<S>,
}

impl Kat500<tokio_serial::SerialStream> {
    pub async fn connect(path: &str, baud: u32) -> DeviceResult<Self> {
        let stream = tokio_serial::new(path, baud)
            .open_native_async()
            .map_err(|e| DeviceError::Serial(e.to_string()))?;
        Ok(Self::from_stream(stream))
    }
}

impl<S> Kat500<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn from_stream(stream: S) -> Self {
        Self::with_timing(stream, RESPONSE_TIMEOUT, FixedDelay::default())
    }

    pub fn with_timing(stream: S, response_timeout: Duration, retry: FixedDelay) -> Self {
        Self {
            line: LineProtocol::new(stream, None, response_timeout, retry, "KAT500"),
        }
    }

    /// Ping until the tuner answers, waking it from its idle sleep.
    ///
    /// Idempotent: a tuner that is already awake answers the first ping and
    /// nothing else is sent.
    pub async fn wake(&self) -> DeviceResult<bool> {
        for attempt in 0..WAKE_ATTEMPTS {
            if self.line.ping().await? {
                return Ok(true);
            }
            if attempt + 1 < WAKE_ATTEMPTS {
                sleep(WAKE_INTERVAL).await;
            }
        }
        Ok(false)
    }

    pub async fn ping(&self) -> DeviceResult<bool> {
        self.line.ping().await
    }

    // Power control

    pub async fn get_power_state(&self) -> DeviceResult<Option<bool>> {
        self.decode_field("PS", |body| parse_bool("PS", body)).await
    }

    pub async fn set_power_state(&self, on: bool) -> DeviceResult<bool> {
        self.line.set_echo("PS", if on { "1" } else { "0" }).await
    }

    pub async fn power_on(&self) -> DeviceResult<bool> {
        self.set_power_state(true).await
    }

    pub async fn power_off(&self) -> DeviceResult<bool> {
        self.set_power_state(false).await
    }

    /// Power state the tuner assumes at startup (`PSI`).
    pub async fn get_initial_power_state(&self) -> DeviceResult<Option<bool>> {
        self.decode_field("PSI", |body| parse_bool("PSI", body)).await
    }

    pub async fn set_initial_power_state(&self, on: bool) -> DeviceResult<bool> {
        self.line.set_echo("PSI", if on { "1" } else { "0" }).await
    }

    // Mode

    pub async fn get_mode(&self) -> DeviceResult<Option<TunerMode>> {
        self.decode_field("MD", TunerMode::decode).await
    }

    pub async fn set_mode(&self, mode: TunerMode) -> DeviceResult<bool> {
        self.line.set_echo("MD", mode.wire()).await
    }

    pub async fn set_bypass_mode(&self) -> DeviceResult<bool> {
        self.set_mode(TunerMode::Bypass).await
    }

    pub async fn set_manual_mode(&self) -> DeviceResult<bool> {
        self.set_mode(TunerMode::Manual).await
    }

    pub async fn set_auto_mode(&self) -> DeviceResult<bool> {
        self.set_mode(TunerMode::Auto).await
    }

    // Band

    pub async fn get_band(&self) -> DeviceResult<Option<Band>> {
        self.decode_field("BN", |body| Band::decode("BN", body)).await
    }

    pub async fn set_band(&self, band: Band) -> DeviceResult<bool> {
        self.line.set_echo("BN", &band.wire()).await
    }

    // Antenna

    pub async fn get_antenna(&self) -> DeviceResult<Option<Antenna>> {
        self.decode_field("AN", Antenna::decode).await
    }

    pub async fn set_antenna(&self, antenna: Antenna) -> DeviceResult<bool> {
        self.line.set_echo("AN", &antenna.code().to_string()).await
    }

    /// Advance to the next enabled antenna, like a front-panel ANT press.
    pub async fn next_antenna(&self) -> DeviceResult<bool> {
        Ok(self.line.send("AN", "0").await?.is_some())
    }

    /// Preferred antenna for a band: 0 = last used, 1-3 = fixed choice.
    pub async fn get_antenna_preference(&self, band: Band) -> DeviceResult<Option<u8>> {
        match self.line.send("AP", &band.wire()).await? {
            Some(body) => {
                // Reply shape: APbba
                let digit = body
                    .strip_prefix("AP")
                    .and_then(|rest| rest.chars().last())
                    .and_then(|ch| ch.to_digit(10))
                    .ok_or_else(|| DeviceError::decode("AP", &body))?;
                Ok(Some(digit as u8))
            }
            None => Ok(None),
        }
    }

    pub async fn set_antenna_preference(&self, band: Band, antenna: u8) -> DeviceResult<bool> {
        if antenna > 3 {
            return Err(DeviceError::invalid("antenna preference must be 0-3"));
        }
        let data = format!("{}{}", band.wire(), antenna);
        let expected = format!("AP{data}");
        let response = self.line.send("AP", &data).await?;
        Ok(response.as_deref() == Some(expected.as_str()))
    }

    pub async fn get_antenna_enabled(
        &self,
        band: Band,
        antenna: Antenna,
    ) -> DeviceResult<Option<bool>> {
        let data = format!("{}{}", band.wire(), antenna.code());
        match self.line.send("AE", &data).await? {
            Some(body) if body.starts_with("AE") => match body.chars().last() {
                Some('1') => Ok(Some(true)),
                Some('0') => Ok(Some(false)),
                _ => Err(DeviceError::decode("AE", &body)),
            },
            Some(body) => Err(DeviceError::decode("AE", &body)),
            None => Ok(None),
        }
    }

    pub async fn set_antenna_enabled(
        &self,
        band: Band,
        antenna: Antenna,
        enabled: bool,
    ) -> DeviceResult<bool> {
        let data = format!(
            "{}{}{}",
            band.wire(),
            antenna.code(),
            if enabled { "1" } else { "0" }
        );
        let expected = format!("AE{data}");
        let response = self.line.send("AE", &data).await?;
        Ok(response.as_deref() == Some(expected.as_str()))
    }

    // Bypass relay

    pub async fn get_bypass(&self) -> DeviceResult<Option<BypassState>> {
        self.decode_field("BYP", BypassState::decode).await
    }

    pub async fn set_bypass(&self, state: BypassState) -> DeviceResult<bool> {
        self.line.set_echo("BYP", state.wire()).await
    }

    // Tuning

    /// Start a tune, like a front-panel TUNE press, and confirm via the
    /// tuning-in-progress flag.
    pub async fn tune(&self) -> DeviceResult<bool> {
        self.line.send("T", "").await?;
        self.is_tuning().await
    }

    /// Start a full tune (search for best match) and confirm it started.
    pub async fn full_tune(&self) -> DeviceResult<bool> {
        self.line.send("FT", "").await?;
        self.is_tuning().await
    }

    pub async fn is_tuning(&self) -> DeviceResult<bool> {
        Ok(self.get_field("TP").await?.as_deref() == Some("1"))
    }

    /// Memory-recall tune at `frequency_khz`, or at the last transmit
    /// frequency when `None`.
    pub async fn memory_tune(&self, frequency_khz: Option<u32>) -> DeviceResult<bool> {
        let data = match frequency_khz {
            Some(khz) => format!(" {khz}"),
            None => String::new(),
        };
        Ok(self.line.send("MT", &data).await?.is_some())
    }

    /// Recall tuner settings for a frequency without transmitting.
    pub async fn set_frequency(&self, frequency_khz: u32) -> DeviceResult<bool> {
        Ok(self
            .line
            .send("F", &format!(" {frequency_khz}"))
            .await?
            .is_some())
    }

    /// Last transmit frequency in kHz.
    pub async fn get_frequency(&self) -> DeviceResult<Option<u32>> {
        self.decode_field("F", |body| parse_num("F", body)).await
    }

    /// Save current tuner settings to memory.
    pub async fn save_memory(&self, frequency_khz: Option<u32>) -> DeviceResult<bool> {
        let data = match frequency_khz {
            Some(khz) => format!(" {khz}"),
            None => String::new(),
        };
        Ok(self.line.send("SM", &data).await?.is_some())
    }

    // Network topology and raw relay state

    pub async fn get_side(&self) -> DeviceResult<Option<NetworkSide>> {
        self.decode_field("SIDE", NetworkSide::decode).await
    }

    pub async fn set_side(&self, side: NetworkSide) -> DeviceResult<bool> {
        self.line.set_echo("SIDE", side.wire()).await
    }

    /// Inductor relay states as a hex mask.
    pub async fn get_inductors(&self) -> DeviceResult<Option<u8>> {
        self.decode_field("L", |body| parse_hex("L", body)).await
    }

    pub async fn set_inductors(&self, mask: u8) -> DeviceResult<bool> {
        self.line.set_echo("L", &format!("{mask:02X}")).await
    }

    /// Capacitor relay states as a hex mask.
    pub async fn get_capacitors(&self) -> DeviceResult<Option<u8>> {
        self.decode_field("C", |body| parse_hex("C", body)).await
    }

    pub async fn set_capacitors(&self, mask: u8) -> DeviceResult<bool> {
        self.line.set_echo("C", &format!("{mask:02X}")).await
    }

    // Faults

    pub async fn get_fault(&self) -> DeviceResult<Option<TunerFault>> {
        self.decode_field("FLT", TunerFault::decode).await
    }

    pub async fn clear_fault(&self) -> DeviceResult<bool> {
        Ok(self.line.send("FLTC", "").await?.is_some())
    }

    // VSWR and coupler readings

    pub async fn get_vswr(&self) -> DeviceResult<Option<f32>> {
        self.decode_field("VSWR", |body| parse_num("VSWR", body)).await
    }

    /// VSWR measured with the tuner network out of circuit.
    pub async fn get_vswr_bypass(&self) -> DeviceResult<Option<f32>> {
        self.decode_field("VSWRB", |body| parse_num("VSWRB", body))
            .await
    }

    /// Forward coupler voltage as an ADC count (0-4095).
    pub async fn get_forward_voltage(&self) -> DeviceResult<Option<u16>> {
        self.decode_field("VFWD", |body| parse_num("VFWD", body)).await
    }

    /// Reflected coupler voltage as an ADC count (0-4095).
    pub async fn get_reflected_voltage(&self) -> DeviceResult<Option<u16>> {
        self.decode_field("VRFL", |body| parse_num("VRFL", body)).await
    }

    // Per-band SWR thresholds

    pub async fn get_threshold(&self, band: Band, kind: ThresholdKind) -> DeviceResult<Option<f32>> {
        let data = format!("{}{}", band.wire(), kind.letter());
        match self.line.send("ST", &data).await? {
            Some(body) if body.starts_with("ST") => {
                // Reply shape: STbbAn.nn
                let value = body
                    .get(5..)
                    .and_then(|digits| digits.parse::<f32>().ok())
                    .ok_or_else(|| DeviceError::decode("ST", &body))?;
                Ok(Some(value))
            }
            Some(body) => Err(DeviceError::decode("ST", &body)),
            None => Ok(None),
        }
    }

    pub async fn set_threshold(
        &self,
        band: Band,
        kind: ThresholdKind,
        vswr: f32,
    ) -> DeviceResult<bool> {
        if kind == ThresholdKind::AutoTune && vswr < 1.5 {
            return Err(DeviceError::invalid("auto-tune threshold minimum is 1.5"));
        }
        let data = format!("{}{}{:.2}", band.wire(), kind.letter(), vswr);
        Ok(self.line.send("ST", &data).await?.is_some())
    }

    // Amplifier key interrupt

    /// Power threshold in watts above which the tuner opens the amplifier
    /// key line.
    pub async fn get_amp_key_interrupt_power(&self) -> DeviceResult<Option<u16>> {
        match self.get_field("AKIP").await? {
            Some(body) => {
                let watts = body
                    .trim()
                    .split('W')
                    .next()
                    .and_then(|digits| digits.trim().parse::<u16>().ok())
                    .ok_or_else(|| DeviceError::decode("AKIP", &body))?;
                Ok(Some(watts))
            }
            None => Ok(None),
        }
    }

    pub async fn set_amp_key_interrupt_power(&self, watts: u16) -> DeviceResult<bool> {
        Ok(self.line.send("AKIP", &format!(" {watts}")).await?.is_some())
    }

    /// Whether the amplifier key line is currently interrupted.
    pub async fn get_amp_key_interrupt(&self) -> DeviceResult<Option<bool>> {
        self.decode_field("AMPI", |body| parse_bool("AMPI", body)).await
    }

    pub async fn set_amp_key_interrupt(&self, interrupted: bool) -> DeviceResult<bool> {
        self.line
            .set_echo("AMPI", if interrupted { "1" } else { "0" })
            .await
    }

    // Attenuator

    pub async fn get_attenuator(&self) -> DeviceResult<Option<bool>> {
        self.decode_field("ATTN", |body| parse_bool("ATTN", body)).await
    }

    pub async fn set_attenuator(&self, enabled: bool) -> DeviceResult<bool> {
        self.line
            .set_echo("ATTN", if enabled { "1" } else { "0" })
            .await
    }

    // Memory maintenance

    /// Erase frequency memories for a band; antenna 0 erases all three.
    pub async fn erase_memory(&self, band: Band, antenna: u8) -> DeviceResult<bool> {
        if antenna > 3 {
            return Err(DeviceError::invalid("antenna must be 0-3"));
        }
        let data = format!("{}{}", band.wire(), antenna);
        Ok(self.line.send("EM", &data).await?.is_some())
    }

    /// Erase every configuration and frequency memory.
    pub async fn erase_all_memory(&self) -> DeviceResult<bool> {
        Ok(self.line.send("EEINIT", "").await?.is_some())
    }

    // Memory-recall tune settings

    pub async fn get_auto_memory_tune(&self) -> DeviceResult<Option<bool>> {
        self.decode_field("MTA", |body| parse_bool("MTA", body)).await
    }

    pub async fn set_auto_memory_tune(&self, enabled: bool) -> DeviceResult<bool> {
        self.line
            .set_echo("MTA", if enabled { "1" } else { "0" })
            .await
    }

    pub async fn get_manual_memory_tune(&self) -> DeviceResult<Option<bool>> {
        self.decode_field("MTM", |body| parse_bool("MTM", body)).await
    }

    pub async fn set_manual_memory_tune(&self, enabled: bool) -> DeviceResult<bool> {
        self.line
            .set_echo("MTM", if enabled { "1" } else { "0" })
            .await
    }

    // Sleep setting

    pub async fn get_sleep_enabled(&self) -> DeviceResult<Option<bool>> {
        self.decode_field("SL", |body| parse_bool("SL", body)).await
    }

    pub async fn set_sleep_enabled(&self, enabled: bool) -> DeviceResult<bool> {
        self.line
            .set_echo("SL", if enabled { "1" } else { "0" })
            .await
    }

    // Device information

    pub async fn get_serial_number(&self) -> DeviceResult<Option<String>> {
        Ok(self
            .get_field("SN")
            .await?
            .map(|body| body.trim().to_string()))
    }

    pub async fn get_firmware_version(&self) -> DeviceResult<Option<String>> {
        self.get_field("RV").await
    }

    pub async fn identify(&self) -> DeviceResult<Option<String>> {
        self.get_field("I").await
    }

    // Baud rate

    pub async fn get_baud_rate(&self) -> DeviceResult<Option<BaudRate>> {
        self.decode_field("BR", |body| BaudRate::decode("BR", body))
            .await
    }

    pub async fn set_baud_rate(&self, rate: BaudRate) -> DeviceResult<bool> {
        self.line.set_echo("BR", &rate.code().to_string()).await
    }

    /// Reset the microcontroller, optionally saving state to EEPROM first.
    pub async fn reset(&self, save_state: bool) -> DeviceResult<bool> {
        Ok(self
            .line
            .send("RST", if save_state { "1" } else { "0" })
            .await?
            .is_some())
    }

    async fn get_field(&self, command: &str) -> DeviceResult<Option<String>> {
        Ok(self.line.get(command).await?.filter(|body| !body.is_empty()))
    }

    async fn decode_field<T>(
        &self,
        command: &str,
        decode: impl Fn(&str) -> DeviceResult<T>,
    ) -> DeviceResult<Option<T>> {
        match self.get_field(command).await? {
            Some(body) => decode(&body).map(Some),
            None => Ok(None),
        }
    }
}

fn parse_bool(command: &str, body: &str) -> DeviceResult<bool> {
    match body {
        "0" => Ok(false),
        "1" => Ok(true),
        _ => Err(DeviceError::decode(command, body)),
    }
}

fn parse_num<T: std::str::FromStr>(command: &str, body: &str) -> DeviceResult<T> {
    body.trim()
        .parse()
        .map_err(|_| DeviceError::decode(command, body))
}

fn parse_hex(command: &str, body: &str) -> DeviceResult<u8> {
    u8::from_str_radix(body.trim(), 16).map_err(|_| DeviceError::decode(command, body))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    use super::*;

    fn tuner(stream: DuplexStream) -> Kat500<DuplexStream> {
        Kat500::with_timing(
            stream,
            Duration::from_millis(100),
            FixedDelay::new(3, Duration::from_millis(10)),
        )
    }

    async fn read_request(stream: &mut DuplexStream) -> Option<String> {
        let mut buf = Vec::new();
        loop {
            let mut byte = [0u8; 1];
            if stream.read_exact(&mut byte).await.is_err() {
                return None;
            }
            if byte[0] == b';' {
                break;
            }
            buf.push(byte[0]);
        }
        Some(String::from_utf8_lossy(&buf).to_string())
    }

    fn scripted_device(mut device: DuplexStream, replies: Vec<&'static [u8]>) {
        tokio::spawn(async move {
            for reply in replies {
                if read_request(&mut device).await.is_none() {
                    return;
                }
                if !reply.is_empty() {
                    device.write_all(reply).await.unwrap();
                }
            }
            std::future::pending::<()>().await;
        });
    }

    #[tokio::test(start_paused = true)]
    async fn test_wake_costs_one_ping_when_awake() {
        let (client, mut device) = tokio::io::duplex(256);
        let kat = tuner(client);
        let pings = Arc::new(AtomicU32::new(0));
        let seen = pings.clone();

        tokio::spawn(async move {
            let mut byte = [0u8; 1];
            while device.read_exact(&mut byte).await.is_ok() {
                seen.fetch_add(1, Ordering::SeqCst);
                device.write_all(b";").await.unwrap();
            }
        });

        assert!(kat.wake().await.unwrap());
        assert_eq!(pings.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wake_gives_up_after_ten_pings() {
        let (client, mut device) = tokio::io::duplex(256);
        let kat = tuner(client);
        let pings = Arc::new(AtomicU32::new(0));
        let seen = pings.clone();

        tokio::spawn(async move {
            let mut byte = [0u8; 1];
            while device.read_exact(&mut byte).await.is_ok() {
                seen.fetch_add(1, Ordering::SeqCst);
            }
        });

        assert!(!kat.wake().await.unwrap());
        assert_eq!(pings.load(Ordering::SeqCst), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_mode_verifies_against_echo() {
        let (client, mut device) = tokio::io::duplex(256);
        let kat = tuner(client);

        tokio::spawn(async move {
            assert_eq!(read_request(&mut device).await.as_deref(), Some("MDA"));
            device.write_all(b"MDA;").await.unwrap();
        });

        assert!(kat.set_mode(TunerMode::Auto).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_mode_rejects_unknown_letter() {
        let (client, device) = tokio::io::duplex(256);
        let kat = tuner(client);
        scripted_device(device, vec![b"MDB;", b"MDX;"]);

        assert_eq!(kat.get_mode().await.unwrap(), Some(TunerMode::Bypass));
        assert!(kat.get_mode().await.unwrap_err().is_decode());
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_tune_confirms_via_tuning_flag() {
        let (client, device) = tokio::io::duplex(256);
        let kat = tuner(client);
        // FT draws no reply; the TP probe confirms.
        scripted_device(device, vec![b"", b"TP1;", b"", b"TP0;"]);

        assert!(kat.full_tune().await.unwrap());
        assert!(!kat.full_tune().await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_memory_tune_uses_leading_space_encoding() {
        let (client, mut device) = tokio::io::duplex(256);
        let kat = tuner(client);

        tokio::spawn(async move {
            assert_eq!(read_request(&mut device).await.as_deref(), Some("MT 14200"));
            device.write_all(b"MT;").await.unwrap();
            assert_eq!(read_request(&mut device).await.as_deref(), Some("F 7100"));
            device.write_all(b"F;").await.unwrap();
            assert_eq!(read_request(&mut device).await.as_deref(), Some("MT"));
            device.write_all(b"MT;").await.unwrap();
        });

        assert!(kat.memory_tune(Some(14200)).await.unwrap());
        assert!(kat.set_frequency(7100).await.unwrap());
        assert!(kat.memory_tune(None).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_relay_masks_are_two_digit_hex() {
        let (client, mut device) = tokio::io::duplex(256);
        let kat = tuner(client);

        tokio::spawn(async move {
            assert_eq!(read_request(&mut device).await.as_deref(), Some("L"));
            device.write_all(b"L3F;").await.unwrap();
            assert_eq!(read_request(&mut device).await.as_deref(), Some("C0A"));
            device.write_all(b"C0A;").await.unwrap();
        });

        assert_eq!(kat.get_inductors().await.unwrap(), Some(0x3F));
        assert!(kat.set_capacitors(0x0A).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_threshold_get_parses_fixed_offset() {
        let (client, mut device) = tokio::io::duplex(256);
        let kat = tuner(client);

        tokio::spawn(async move {
            assert_eq!(read_request(&mut device).await.as_deref(), Some("ST05A"));
            device.write_all(b"ST05A1.80;").await.unwrap();
        });

        let vswr = kat
            .get_threshold(Band::B20m, ThresholdKind::AutoTune)
            .await
            .unwrap()
            .unwrap();
        assert!((vswr - 1.8).abs() < 0.001);
    }

    #[tokio::test(start_paused = true)]
    async fn test_auto_tune_threshold_validated_locally() {
        let (client, mut device) = tokio::io::duplex(256);
        let kat = tuner(client);

        let err = kat
            .set_threshold(Band::B20m, ThresholdKind::AutoTune, 1.4)
            .await
            .unwrap_err();
        assert!(matches!(err, DeviceError::InvalidArgument(_)));

        // Bypass thresholds have no minimum and do reach the wire.
        tokio::spawn(async move {
            assert_eq!(
                read_request(&mut device).await.as_deref(),
                Some("ST05B1.40")
            );
            device.write_all(b"ST05B1.40;").await.unwrap();
        });
        assert!(kat
            .set_threshold(Band::B20m, ThresholdKind::Bypass, 1.4)
            .await
            .unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_antenna_preference_round_trip() {
        let (client, mut device) = tokio::io::duplex(256);
        let kat = tuner(client);

        tokio::spawn(async move {
            assert_eq!(read_request(&mut device).await.as_deref(), Some("AP03"));
            device.write_all(b"AP032;").await.unwrap();
            assert_eq!(read_request(&mut device).await.as_deref(), Some("AP031"));
            device.write_all(b"AP031;").await.unwrap();
        });

        assert_eq!(
            kat.get_antenna_preference(Band::B40m).await.unwrap(),
            Some(2)
        );
        assert!(kat.set_antenna_preference(Band::B40m, 1).await.unwrap());
        assert!(matches!(
            kat.set_antenna_preference(Band::B40m, 4).await.unwrap_err(),
            DeviceError::InvalidArgument(_)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_tuner_fault_closed_table() {
        let (client, device) = tokio::io::duplex(256);
        let kat = tuner(client);
        scripted_device(device, vec![b"FLT1;", b"FLT4;"]);

        assert_eq!(kat.get_fault().await.unwrap(), Some(TunerFault::NoMatch));
        assert!(kat.get_fault().await.unwrap_err().is_decode());

        for fault in TunerFault::ALL {
            assert_eq!(TunerFault::from_code(fault.code()), Some(fault));
        }
        assert!(TunerFault::from_code(4).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_amp_key_interrupt_power_strips_watt_suffix() {
        let (client, device) = tokio::io::duplex(256);
        let kat = tuner(client);
        scripted_device(device, vec![b"AKIP 600W;"]);

        assert_eq!(kat.get_amp_key_interrupt_power().await.unwrap(), Some(600));
    }

    #[tokio::test(start_paused = true)]
    async fn test_vswr_absent_when_asleep() {
        let (client, _device) = tokio::io::duplex(256);
        let kat = tuner(client);

        assert_eq!(kat.get_vswr().await.unwrap(), None);
    }
}
