// SPDX-FileCopyrightText: 2026 Stan Grams <sjg@haxx.space>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Command client for the Elecraft KPA500 amplifier.
//!
//! The KPA500 frames every exchange as `^<CMD><DATA>;` and never
//! acknowledges a set command, so every setter here verifies by reading the
//! value back on a separate exchange. When the amplifier sits in its
//! low-power bootloader it ignores framed commands entirely and accepts
//! only a single raw `P` wake byte.

use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::sleep;
use tokio_serial::SerialPortBuilderExt;

use kombo_core::line::LineProtocol;
use kombo_core::{Band, BaudRate, DeviceError, DeviceResult, FixedDelay};

pub const DEFAULT_BAUD: u32 = 38400;

const RESPONSE_TIMEOUT: Duration = Duration::from_secs(1);
const POWER_DETECT_TIMEOUT: Duration = Duration::from_millis(500);

/// Raw byte that brings the amplifier out of bootloader mode.
const WAKE_BYTE: u8 = b'P';
const WAKE_POLL_ATTEMPTS: u32 = 12;
const WAKE_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Standby/operate state (`OS`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperatingMode {
    Standby,
    Operate,
}

impl OperatingMode {
    fn wire(self) -> &'static str {
        match self {
            OperatingMode::Standby => "0",
            OperatingMode::Operate => "1",
        }
    }

    fn decode(body: &str) -> DeviceResult<Self> {
        match body {
            "0" => Ok(OperatingMode::Standby),
            "1" => Ok(OperatingMode::Operate),
            _ => Err(DeviceError::decode("OS", body)),
        }
    }
}

/// Minimum fan speed setting (`FC`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FanSpeed {
    Low,
    Medium,
    High,
}

impl FanSpeed {
    fn wire(self) -> &'static str {
        match self {
            FanSpeed::Low => "0",
            FanSpeed::Medium => "1",
            FanSpeed::High => "2",
        }
    }

    fn decode(body: &str) -> DeviceResult<Self> {
        match body {
            "0" => Ok(FanSpeed::Low),
            "1" => Ok(FanSpeed::Medium),
            "2" => Ok(FanSpeed::High),
            _ => Err(DeviceError::decode("FC", body)),
        }
    }
}

/// Amplifier fault codes (`FL`), a closed 0-10 table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AmpFault {
    None,
    Current,
    Temperature,
    Voltage,
    Swr,
    Overdrive,
    BiasTimeout,
    Power,
    Keying,
    BandError,
    PaCommunication,
}

impl AmpFault {
    pub const ALL: [AmpFault; 11] = [
        AmpFault::None,
        AmpFault::Current,
        AmpFault::Temperature,
        AmpFault::Voltage,
        AmpFault::Swr,
        AmpFault::Overdrive,
        AmpFault::BiasTimeout,
        AmpFault::Power,
        AmpFault::Keying,
        AmpFault::BandError,
        AmpFault::PaCommunication,
    ];

    pub fn code(self) -> u8 {
        Self::ALL
            .iter()
            .position(|fault| *fault == self)
            .unwrap_or(0) as u8
    }

    pub fn from_code(code: u8) -> Option<AmpFault> {
        Self::ALL.get(code as usize).copied()
    }

    fn decode(body: &str) -> DeviceResult<Self> {
        body.parse::<u8>()
            .ok()
            .and_then(AmpFault::from_code)
            .ok_or_else(|| DeviceError::decode("FL", body))
    }
}

/// Radio interface selection (`XI`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RadioInterface {
    Rs232,
    Aux,
}

impl RadioInterface {
    fn wire(self) -> &'static str {
        match self {
            RadioInterface::Rs232 => "0",
            RadioInterface::Aux => "1",
        }
    }

    fn decode(body: &str) -> DeviceResult<Self> {
        match body {
            "0" => Ok(RadioInterface::Rs232),
            "1" => Ok(RadioInterface::Aux),
            _ => Err(DeviceError::decode("XI", body)),
        }
    }
}

/// Single `WS` reading packing output power and SWR.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PowerSwr {
    pub watts: u16,
    pub swr: f32,
}

/// Single `VI` reading packing PA voltage and current.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VoltageCurrent {
    pub volts: f32,
    pub amps: f32,
}

pub struct Kpa500<S> {
    line: LineProtocol<S>,
    /// Result of the last power-state detection: `Some(true)` when the
    /// firmware answered, `Some(false)` for bootloader mode, `None` before
    /// the first probe.
    powered_on: Mutex<Option<bool>>,
}

impl Kpa500<tokio_serial::SerialStream> {
    /// Open the serial port and probe which power state the amplifier is in.
    pub async fn connect(path: &str, baud: u32) -> DeviceResult<Self> {
        let stream = tokio_serial::new(path, baud)
            .open_native_async()
            .map_err(|e| DeviceError::Serial(e.to_string()))?;
        let amp = Self::from_stream(stream);
        amp.detect_power_state().await?;
        Ok(amp)
    }
}

impl<S> Kpa500<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn from_stream(stream: S) -> Self {
        Self::with_timing(stream, RESPONSE_TIMEOUT, FixedDelay::default())
    }

    pub fn with_timing(stream: S, response_timeout: Duration, retry: FixedDelay) -> Self {
        Self {
            line: LineProtocol::new(stream, Some('^'), response_timeout, retry, "KPA500"),
            powered_on: Mutex::new(None),
        }
    }

    /// Probe whether the amplifier firmware is up or the unit is sitting in
    /// its bootloader. The firmware answers `ON` with `ON0`/`ON1`; the
    /// bootloader stays silent or echoes the bare command.
    pub async fn detect_power_state(&self) -> DeviceResult<bool> {
        let response = self
            .line
            .send_with_timeout("ON", "", POWER_DETECT_TIMEOUT)
            .await?;
        let powered = matches!(response.as_deref(), Some("ON0") | Some("ON1"));
        *self.powered_on.lock() = Some(powered);
        Ok(powered)
    }

    /// Cached result of the last power-state detection.
    pub fn is_powered_on(&self) -> Option<bool> {
        *self.powered_on.lock()
    }

    // Power control

    pub async fn get_power_state(&self) -> DeviceResult<Option<bool>> {
        match self.get_field("ON").await? {
            Some(body) => parse_bool("ON", &body).map(Some),
            None => Ok(None),
        }
    }

    pub async fn set_power_state(&self, on: bool) -> DeviceResult<bool> {
        let accepted = self
            .line
            .set_readback("ON", if on { "1" } else { "0" })
            .await?;
        if accepted {
            *self.powered_on.lock() = Some(on);
        }
        Ok(accepted)
    }

    /// Turn the amplifier on.
    ///
    /// When the firmware is already up this is a normal verified set. From
    /// the bootloader only the raw wake byte is accepted: send it once,
    /// then poll the power-state query until the firmware comes up or the
    /// attempt budget runs out.
    pub async fn power_on(&self) -> DeviceResult<bool> {
        if self.is_powered_on() == Some(true) {
            return self.set_power_state(true).await;
        }

        self.line.write_raw(&[WAKE_BYTE]).await?;
        for _ in 0..WAKE_POLL_ATTEMPTS {
            sleep(WAKE_POLL_INTERVAL).await;
            let response = self
                .line
                .send_with_timeout("ON", "", WAKE_POLL_INTERVAL)
                .await?;
            if response.as_deref().is_some_and(|r| r.starts_with("ON")) {
                *self.powered_on.lock() = Some(true);
                return Ok(true);
            }
        }
        Ok(false)
    }

    pub async fn power_off(&self) -> DeviceResult<bool> {
        self.set_power_state(false).await
    }

    // Operating mode

    pub async fn get_operating_mode(&self) -> DeviceResult<Option<OperatingMode>> {
        self.decode_field("OS", OperatingMode::decode).await
    }

    pub async fn set_operating_mode(&self, mode: OperatingMode) -> DeviceResult<bool> {
        self.line.set_readback("OS", mode.wire()).await
    }

    pub async fn set_standby(&self) -> DeviceResult<bool> {
        self.set_operating_mode(OperatingMode::Standby).await
    }

    pub async fn set_operate(&self) -> DeviceResult<bool> {
        self.set_operating_mode(OperatingMode::Operate).await
    }

    // Band

    pub async fn get_band(&self) -> DeviceResult<Option<Band>> {
        self.decode_field("BN", |body| Band::decode("BN", body)).await
    }

    pub async fn set_band(&self, band: Band) -> DeviceResult<bool> {
        self.line.set_readback("BN", &band.wire()).await
    }

    // ALC threshold

    pub async fn get_alc(&self) -> DeviceResult<Option<u16>> {
        self.decode_field("AL", |body| parse_num("AL", body)).await
    }

    pub async fn set_alc(&self, value: u16) -> DeviceResult<bool> {
        if value > 210 {
            return Err(DeviceError::invalid("ALC threshold must be 0-210"));
        }
        self.line.set_readback("AL", &format!("{value:03}")).await
    }

    // Fan

    pub async fn get_fan_speed(&self) -> DeviceResult<Option<FanSpeed>> {
        self.decode_field("FC", FanSpeed::decode).await
    }

    pub async fn set_fan_speed(&self, speed: FanSpeed) -> DeviceResult<bool> {
        self.line.set_readback("FC", speed.wire()).await
    }

    // Speaker

    pub async fn get_speaker(&self) -> DeviceResult<Option<bool>> {
        self.decode_field("SP", |body| parse_bool("SP", body)).await
    }

    pub async fn set_speaker(&self, enabled: bool) -> DeviceResult<bool> {
        self.line
            .set_readback("SP", if enabled { "1" } else { "0" })
            .await
    }

    // T/R delay

    pub async fn get_tr_delay(&self) -> DeviceResult<Option<u8>> {
        self.decode_field("TR", |body| parse_num("TR", body)).await
    }

    pub async fn set_tr_delay(&self, delay_ms: u8) -> DeviceResult<bool> {
        if delay_ms > 50 {
            return Err(DeviceError::invalid("T/R delay must be 0-50 ms"));
        }
        self.line.set_readback("TR", &format!("{delay_ms:02}")).await
    }

    // Faults

    pub async fn get_fault(&self) -> DeviceResult<Option<AmpFault>> {
        self.decode_field("FL", AmpFault::decode).await
    }

    pub async fn clear_fault(&self) -> DeviceResult<bool> {
        Ok(self.line.send("FL", "C").await?.is_some())
    }

    // Readings

    /// Current output power and SWR, packed into one fixed-width reading:
    /// 4-digit watts followed by 2-digit SWR x 10.
    pub async fn get_power_swr(&self) -> DeviceResult<Option<PowerSwr>> {
        self.decode_field("WS", |body| {
            let watts = body
                .get(..4)
                .and_then(|digits| digits.parse::<u16>().ok())
                .ok_or_else(|| DeviceError::decode("WS", body))?;
            let swr_raw = body
                .get(4..)
                .and_then(|digits| digits.parse::<u16>().ok())
                .ok_or_else(|| DeviceError::decode("WS", body))?;
            Ok(PowerSwr {
                watts,
                swr: f32::from(swr_raw) / 10.0,
            })
        })
        .await
    }

    /// PA heatsink temperature in degrees Celsius.
    pub async fn get_temperature(&self) -> DeviceResult<Option<i16>> {
        self.decode_field("TM", |body| parse_num("TM", body)).await
    }

    /// PA voltage and current, fixed-width: 3-digit volts x 10 followed by
    /// 2-digit amps x 10.
    pub async fn get_voltage_current(&self) -> DeviceResult<Option<VoltageCurrent>> {
        self.decode_field("VI", |body| {
            let volts_raw = body
                .get(..3)
                .and_then(|digits| digits.parse::<u16>().ok())
                .ok_or_else(|| DeviceError::decode("VI", body))?;
            let amps_raw = body
                .get(3..)
                .and_then(|digits| digits.parse::<u16>().ok())
                .ok_or_else(|| DeviceError::decode("VI", body))?;
            Ok(VoltageCurrent {
                volts: f32::from(volts_raw) / 10.0,
                amps: f32::from(amps_raw) / 10.0,
            })
        })
        .await
    }

    // Device information

    pub async fn get_serial_number(&self) -> DeviceResult<Option<String>> {
        self.get_field("SN").await
    }

    pub async fn get_firmware_version(&self) -> DeviceResult<Option<String>> {
        self.get_field("RVM").await
    }

    // Baud rates

    pub async fn get_pc_baud_rate(&self) -> DeviceResult<Option<BaudRate>> {
        self.decode_field("BRP", |body| BaudRate::decode("BRP", body))
            .await
    }

    pub async fn set_pc_baud_rate(&self, rate: BaudRate) -> DeviceResult<bool> {
        self.line.set_readback("BRP", &rate.code().to_string()).await
    }

    pub async fn get_xcvr_baud_rate(&self) -> DeviceResult<Option<BaudRate>> {
        self.decode_field("BRX", |body| BaudRate::decode("BRX", body))
            .await
    }

    pub async fn set_xcvr_baud_rate(&self, rate: BaudRate) -> DeviceResult<bool> {
        self.line.set_readback("BRX", &rate.code().to_string()).await
    }

    // Radio interface

    pub async fn get_radio_interface(&self) -> DeviceResult<Option<RadioInterface>> {
        self.decode_field("XI", RadioInterface::decode).await
    }

    pub async fn set_radio_interface(&self, interface: RadioInterface) -> DeviceResult<bool> {
        self.line.set_readback("XI", interface.wire()).await
    }

    // Standby on band change

    pub async fn get_standby_on_band_change(&self) -> DeviceResult<Option<bool>> {
        self.decode_field("BC", |body| parse_bool("BC", body)).await
    }

    pub async fn set_standby_on_band_change(&self, enabled: bool) -> DeviceResult<bool> {
        self.line
            .set_readback("BC", if enabled { "1" } else { "0" })
            .await
    }

    pub async fn ping(&self) -> DeviceResult<bool> {
        self.line.ping().await
    }

    /// Get a field's data portion, treating an echo-only reply (empty data)
    /// the same as no reply.
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

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex as StdMutex};

    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    use super::*;

    fn amp(stream: DuplexStream) -> Kpa500<DuplexStream> {
        Kpa500::with_timing(
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

    /// Serve scripted replies: each request is answered with the next one.
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
            // Keep the stream open so later exchanges time out instead of
            // erroring on EOF.
            std::future::pending::<()>().await;
        });
    }

    #[tokio::test(start_paused = true)]
    async fn test_detect_power_state_on_responses() {
        for (reply, expected) in [(b"^ON1;".as_slice(), true), (b"^ON0;", true)] {
            let (client, device) = tokio::io::duplex(256);
            let kpa = amp(client);
            scripted_device(device, vec![reply]);

            assert_eq!(kpa.detect_power_state().await.unwrap(), expected);
            assert_eq!(kpa.is_powered_on(), Some(expected));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_detect_power_state_bare_echo_means_bootloader() {
        let (client, device) = tokio::io::duplex(256);
        let kpa = amp(client);
        scripted_device(device, vec![b"^ON;"]);

        assert!(!kpa.detect_power_state().await.unwrap());
        assert_eq!(kpa.is_powered_on(), Some(false));
    }

    #[tokio::test(start_paused = true)]
    async fn test_detect_power_state_silence_means_bootloader() {
        let (client, _device) = tokio::io::duplex(256);
        let kpa = amp(client);

        assert!(!kpa.detect_power_state().await.unwrap());
        assert_eq!(kpa.is_powered_on(), Some(false));
    }

    #[tokio::test(start_paused = true)]
    async fn test_bootloader_power_on_gives_up_after_budget() {
        let (client, mut device) = tokio::io::duplex(1024);
        let kpa = amp(client);

        let written = Arc::new(StdMutex::new(Vec::new()));
        let sink = written.clone();
        tokio::spawn(async move {
            let mut buf = [0u8; 64];
            while let Ok(n) = device.read(&mut buf).await {
                if n == 0 {
                    break;
                }
                sink.lock().unwrap().extend_from_slice(&buf[..n]);
            }
        });

        assert!(!kpa.power_on().await.unwrap());

        tokio::time::sleep(Duration::from_millis(20)).await;
        let mut expected = b"P".to_vec();
        for _ in 0..12 {
            expected.extend_from_slice(b"^ON;");
        }
        assert_eq!(*written.lock().unwrap(), expected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bootloader_power_on_succeeds_once_firmware_answers() {
        let (client, mut device) = tokio::io::duplex(256);
        let kpa = amp(client);

        tokio::spawn(async move {
            // Swallow the raw wake byte.
            let mut byte = [0u8; 1];
            device.read_exact(&mut byte).await.unwrap();
            assert_eq!(byte[0], b'P');
            // Silent for two polls, then the firmware comes up.
            read_request(&mut device).await;
            read_request(&mut device).await;
            read_request(&mut device).await;
            device.write_all(b"^ON1;").await.unwrap();
            std::future::pending::<()>().await;
        });

        assert!(kpa.power_on().await.unwrap());
        assert_eq!(kpa.is_powered_on(), Some(true));
    }

    #[tokio::test(start_paused = true)]
    async fn test_power_on_when_already_up_uses_verified_set() {
        let (client, mut device) = tokio::io::duplex(256);
        let kpa = amp(client);

        tokio::spawn(async move {
            assert_eq!(read_request(&mut device).await.as_deref(), Some("^ON1"));
            assert_eq!(read_request(&mut device).await.as_deref(), Some("^ON"));
            device.write_all(b"^ON1;").await.unwrap();
        });

        *kpa.powered_on.lock() = Some(true);
        assert!(kpa.power_on().await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_band_retries_until_readback_matches() {
        let (client, mut device) = tokio::io::duplex(256);
        let kpa = amp(client);

        tokio::spawn(async move {
            // First attempt reads back the old band, second sticks.
            assert_eq!(read_request(&mut device).await.as_deref(), Some("^BN05"));
            read_request(&mut device).await;
            device.write_all(b"^BN03;").await.unwrap();
            assert_eq!(read_request(&mut device).await.as_deref(), Some("^BN05"));
            read_request(&mut device).await;
            device.write_all(b"^BN05;").await.unwrap();
        });

        assert!(kpa.set_band(Band::B20m).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_band_rejects_unknown_code() {
        let (client, device) = tokio::io::duplex(256);
        let kpa = amp(client);
        scripted_device(device, vec![b"^BN11;"]);

        assert!(kpa.get_band().await.unwrap_err().is_decode());
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_power_swr_fixed_offsets() {
        let (client, device) = tokio::io::duplex(256);
        let kpa = amp(client);
        scripted_device(device, vec![b"^WS042015;"]);

        let reading = kpa.get_power_swr().await.unwrap().unwrap();
        assert_eq!(reading.watts, 420);
        assert!((reading.swr - 1.5).abs() < f32::EPSILON);
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_voltage_current_fixed_offsets() {
        let (client, device) = tokio::io::duplex(256);
        let kpa = amp(client);
        scripted_device(device, vec![b"^VI53821;"]);

        let reading = kpa.get_voltage_current().await.unwrap().unwrap();
        assert!((reading.volts - 53.8).abs() < 0.01);
        assert!((reading.amps - 2.1).abs() < 0.01);
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_fault_decodes_closed_table() {
        let (client, device) = tokio::io::duplex(256);
        let kpa = amp(client);
        scripted_device(device, vec![b"^FL4;", b"^FL11;"]);

        assert_eq!(kpa.get_fault().await.unwrap(), Some(AmpFault::Swr));
        assert!(kpa.get_fault().await.unwrap_err().is_decode());
    }

    #[tokio::test(start_paused = true)]
    async fn test_fault_round_trip() {
        for fault in AmpFault::ALL {
            assert_eq!(AmpFault::from_code(fault.code()), Some(fault));
        }
        assert!(AmpFault::from_code(11).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_alc_rejects_out_of_range_locally() {
        let (client, mut device) = tokio::io::duplex(256);
        let kpa = amp(client);

        let err = kpa.set_alc(211).await.unwrap_err();
        assert!(matches!(err, DeviceError::InvalidArgument(_)));

        // Nothing may have gone to the wire.
        let mut byte = [0u8; 1];
        drop(kpa);
        assert_eq!(device.read(&mut byte).await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_fault_accepts_any_reply() {
        let (client, device) = tokio::io::duplex(256);
        let kpa = amp(client);
        scripted_device(device, vec![b"^FLC;"]);

        assert!(kpa.clear_fault().await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_power_state_absent_vs_decode() {
        let (client, device) = tokio::io::duplex(256);
        let kpa = amp(client);
        scripted_device(device, vec![b"", b"^ONX;"]);

        assert_eq!(kpa.get_power_state().await.unwrap(), None);
        assert!(kpa.get_power_state().await.unwrap_err().is_decode());
    }
}
