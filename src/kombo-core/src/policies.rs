// SPDX-FileCopyrightText: 2026 Stan Grams <sjg@haxx.space>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Operational policies for retry and polling behavior.
//!
//! Attempt counts and delays are policy knobs, not protocol requirements;
//! they are grouped here so callers configure them in one place.

use std::time::Duration;

use tokio::time::Instant;

/// Fixed retry policy driving set-verify loops.
///
/// Both devices drop characters on noisy links and neither acknowledges a
/// set reliably, so every setter re-sends and re-checks up to `attempts`
/// times with a constant delay between attempts.
#[derive(Debug, Clone, Copy)]
pub struct FixedDelay {
    attempts: u32,
    delay: Duration,
}

impl FixedDelay {
    pub fn new(attempts: u32, delay: Duration) -> Self {
        Self { attempts, delay }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }
}

impl Default for FixedDelay {
    fn default() -> Self {
        Self::new(3, Duration::from_millis(100))
    }
}

/// Decides whether a poll tick that refreshed the amplifier should also
/// refresh the tuner.
///
/// The tuner sleeps when idle, and waking it on every fast tick would
/// defeat that, so it is only polled on a slow background interval —
/// unless amplifier SWR rises above the idle baseline, which means RF is
/// flowing and the tuner must track the fast rate until the carrier drops.
#[derive(Debug, Clone, Copy)]
pub struct TunerPollPolicy {
    background_interval: Duration,
}

impl TunerPollPolicy {
    /// SWR reported by the amplifier when no RF is flowing.
    pub const IDLE_SWR: f32 = 1.0;

    pub fn new(background_interval: Duration) -> Self {
        Self {
            background_interval,
        }
    }

    pub fn background_interval(&self) -> Duration {
        self.background_interval
    }

    /// `last_poll` of `None` means the tuner has never been polled.
    pub fn should_poll(&self, last_poll: Option<Instant>, amp_swr: Option<f32>) -> bool {
        if amp_swr.is_some_and(|swr| swr > Self::IDLE_SWR) {
            return true;
        }
        match last_poll {
            Some(at) => at.elapsed() >= self.background_interval,
            None => true,
        }
    }
}

impl Default for TunerPollPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_delay_defaults() {
        let policy = FixedDelay::default();
        assert_eq!(policy.attempts(), 3);
        assert_eq!(policy.delay(), Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_tuner_poll_waits_for_background_interval() {
        let policy = TunerPollPolicy::new(Duration::from_secs(30));
        let polled_at = Instant::now();

        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(!policy.should_poll(Some(polled_at), Some(1.0)));

        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(policy.should_poll(Some(polled_at), Some(1.0)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_tuner_poll_forced_by_high_swr() {
        let policy = TunerPollPolicy::new(Duration::from_secs(30));
        let polled_at = Instant::now();

        // Interval not elapsed, but RF is flowing.
        assert!(policy.should_poll(Some(polled_at), Some(1.6)));
        // Exactly at the idle baseline does not count as transmission.
        assert!(!policy.should_poll(Some(polled_at), Some(1.0)));
        // Unknown SWR (amplifier absent) gates on the interval alone.
        assert!(!policy.should_poll(Some(polled_at), None));
    }

    #[test]
    fn test_tuner_poll_when_never_polled() {
        let policy = TunerPollPolicy::default();
        assert!(policy.should_poll(None, None));
    }
}
