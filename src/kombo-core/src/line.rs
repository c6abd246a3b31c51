// SPDX-FileCopyrightText: 2026 Stan Grams <sjg@haxx.space>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Request/response framing over a `;`-terminated ASCII byte stream.
//!
//! Both devices speak short command/response exchanges closed by `;` and
//! neither supports multiple outstanding requests, so every exchange holds
//! the stream lock for the full write-then-read cycle: a poll loop and a
//! control call may interleave requests but never bytes.
//!
//! Response timeouts are not errors. A silent device is off, asleep, or was
//! sent a command that produces no reply; all of those surface as `Ok(None)`.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio::time::{sleep, timeout};
use tracing::debug;

use crate::error::DeviceResult;
use crate::policies::FixedDelay;

/// Terminator closing every request and response on both devices.
pub const TERMINATOR: u8 = b';';

/// Bound on each best-effort read while draining stale bytes.
const DRAIN_READ_TIMEOUT: Duration = Duration::from_millis(10);

pub struct LineProtocol<S> {
    stream: Mutex<S>,
    /// Prefix the device puts before every framed exchange (`^` on the
    /// KPA500); prepended to requests and stripped from replies.
    prefix: Option<char>,
    timeout: Duration,
    retry: FixedDelay,
    /// Device label used in wire-level log lines.
    label: &'static str,
}

impl<S> LineProtocol<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(
        stream: S,
        prefix: Option<char>,
        response_timeout: Duration,
        retry: FixedDelay,
        label: &'static str,
    ) -> Self {
        Self {
            stream: Mutex::new(stream),
            prefix,
            timeout: response_timeout,
            retry,
            label,
        }
    }

    pub fn response_timeout(&self) -> Duration {
        self.timeout
    }

    pub fn retry(&self) -> FixedDelay {
        self.retry
    }

    /// Send `command ++ data` and wait for a reply with the default timeout.
    pub async fn send(&self, command: &str, data: &str) -> DeviceResult<Option<String>> {
        self.exchange(command, data, self.timeout, true).await
    }

    /// Send and wait with an explicit per-exchange timeout.
    pub async fn send_with_timeout(
        &self,
        command: &str,
        data: &str,
        wait: Duration,
    ) -> DeviceResult<Option<String>> {
        self.exchange(command, data, wait, true).await
    }

    /// Fire-and-forget send, for commands that never reply.
    pub async fn send_no_response(&self, command: &str, data: &str) -> DeviceResult<()> {
        self.exchange(command, data, self.timeout, false).await?;
        Ok(())
    }

    /// Send a GET command and return the data portion of the reply.
    ///
    /// Devices omit the command-name echo on some replies; those are passed
    /// through unmodified.
    pub async fn get(&self, command: &str) -> DeviceResult<Option<String>> {
        let response = self.send(command, "").await?;
        Ok(response.map(|body| match body.strip_prefix(command) {
            Some(rest) => rest.to_string(),
            None => body,
        }))
    }

    /// Set-verify for a device that echoes the accepted command on the same
    /// exchange. Retries with a fixed delay and stops on the first match;
    /// exhausted attempts return `Ok(false)`.
    pub async fn set_echo(&self, command: &str, data: &str) -> DeviceResult<bool> {
        let expected = format!("{command}{data}");
        for attempt in 0..self.retry.attempts() {
            let response = self.send(command, data).await?;
            if response.as_deref() == Some(expected.as_str()) {
                return Ok(true);
            }
            if attempt + 1 < self.retry.attempts() {
                sleep(self.retry.delay()).await;
            }
        }
        Ok(false)
    }

    /// Set-verify for a device that never acknowledges the set exchange:
    /// fire the set, then read the value back on a separate exchange and
    /// compare. Same retry contract as [`set_echo`](Self::set_echo).
    pub async fn set_readback(&self, command: &str, data: &str) -> DeviceResult<bool> {
        for attempt in 0..self.retry.attempts() {
            self.exchange(command, data, self.timeout, false).await?;
            if self.get(command).await?.as_deref() == Some(data) {
                return Ok(true);
            }
            if attempt + 1 < self.retry.attempts() {
                sleep(self.retry.delay()).await;
            }
        }
        Ok(false)
    }

    /// Write a bare terminator and wait for the one-byte reply. Doubles as
    /// the wake stimulus for a sleeping KAT500.
    pub async fn ping(&self) -> DeviceResult<bool> {
        let mut stream = self.stream.lock().await;
        stream.write_all(&[TERMINATOR]).await?;
        stream.flush().await?;
        let mut byte = [0u8; 1];
        match timeout(self.timeout, stream.read(&mut byte)).await {
            Ok(Ok(n)) => Ok(n == 1 && byte[0] == TERMINATOR),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Ok(false),
        }
    }

    /// Write bytes with no framing at all, for wake sequences that bypass
    /// the command protocol.
    pub async fn write_raw(&self, bytes: &[u8]) -> DeviceResult<()> {
        let mut stream = self.stream.lock().await;
        stream.write_all(bytes).await?;
        stream.flush().await?;
        Ok(())
    }

    async fn exchange(
        &self,
        command: &str,
        data: &str,
        wait: Duration,
        expect_response: bool,
    ) -> DeviceResult<Option<String>> {
        let mut frame = String::new();
        if let Some(prefix) = self.prefix {
            frame.push(prefix);
        }
        frame.push_str(command);
        frame.push_str(data);
        frame.push(TERMINATOR as char);

        let mut stream = self.stream.lock().await;
        Self::drain(&mut stream).await;

        debug!("{} TX: {}", self.label, frame);
        stream.write_all(frame.as_bytes()).await?;
        stream.flush().await?;

        if !expect_response {
            return Ok(None);
        }

        match Self::read_frame(&mut stream, wait).await? {
            Some(raw) => {
                debug!("{} RX: {};", self.label, raw);
                Ok(Some(self.strip_prefix(raw)))
            }
            None => {
                debug!("{} RX: <timeout>", self.label);
                Ok(None)
            }
        }
    }

    /// Discard bytes a device pushed since the last exchange, so stale or
    /// unsolicited output cannot be mistaken for this exchange's reply.
    async fn drain(stream: &mut S) {
        let mut buf = [0u8; 64];
        while let Ok(Ok(n)) = timeout(DRAIN_READ_TIMEOUT, stream.read(&mut buf)).await {
            if n == 0 {
                break;
            }
        }
    }

    async fn read_frame(stream: &mut S, wait: Duration) -> DeviceResult<Option<String>> {
        let mut buf = Vec::new();
        let collect = async {
            loop {
                let mut byte = [0u8; 1];
                stream.read_exact(&mut byte).await?;
                if byte[0] == TERMINATOR {
                    return Ok::<(), std::io::Error>(());
                }
                buf.push(byte[0]);
            }
        };
        match timeout(wait, collect).await {
            Ok(Ok(())) => Ok(Some(String::from_utf8_lossy(&buf).trim().to_string())),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Ok(None),
        }
    }

    fn strip_prefix(&self, body: String) -> String {
        match self.prefix {
            Some(prefix) => match body.strip_prefix(prefix) {
                Some(rest) => rest.to_string(),
                None => body,
            },
            None => body,
        }
    }
}
