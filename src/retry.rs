// HANDOFF: Coordinated Service Migration between Cache Replicas on an Emulated Testbed
// Copyright (C) 2024-2025 Roland Schmid <roschmi@ethz.ch> and Tibor Schneider <sctibor@ethz.ch>
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.
//! Exponential backoff for control-plane calls that fail because the device is not ready yet.

use std::{fmt::Display, future::Future, time::Duration};

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use handoff_utils::serde::duration_secs;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Backoff {
    /// Delay before the first retry.
    #[serde(with = "duration_secs")]
    pub initial: Duration,
    /// Upper bound for a single delay.
    #[serde(with = "duration_secs")]
    pub max: Duration,
    pub factor: f64,
    /// Total number of attempts, including the first one.
    pub max_attempts: usize,
    /// Relative random jitter added to each delay, in `[0, 1]`.
    #[serde(default)]
    pub jitter: f64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(100),
            max: Duration::from_secs(2),
            factor: 2.0,
            max_attempts: 8,
            jitter: 0.1,
        }
    }
}

impl Backoff {
    /// Backoff that never retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Delay after the failed attempt `attempt` (starting at 0), without jitter.
    pub fn delay(&self, attempt: usize) -> Duration {
        let scale = self.factor.max(1.0).powi(attempt.min(i32::MAX as usize) as i32);
        let secs = self.initial.as_secs_f64() * scale;
        if secs >= self.max.as_secs_f64() {
            self.max
        } else {
            Duration::from_secs_f64(secs)
        }
    }

    fn jittered(&self, delay: Duration) -> Duration {
        if self.jitter <= 0.0 {
            return delay;
        }
        let extra = rand::thread_rng().gen_range(0.0..=self.jitter.min(1.0));
        delay.mul_f64(1.0 + extra)
    }

    /// Run `op` until it succeeds, fails with an error for which `retryable` returns false, or
    /// the attempts are exhausted. The last error is returned. Cancelling `cancel` ends the wait
    /// before the next attempt, but never interrupts a running attempt.
    pub async fn retry<T, E, F, Fut, R>(
        &self,
        what: &str,
        cancel: &CancellationToken,
        retryable: R,
        mut op: F,
    ) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        R: Fn(&E) -> bool,
        E: Display,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(x) => return Ok(x),
                Err(e) if retryable(&e) && attempt + 1 < self.max_attempts => {
                    let delay = self.jittered(self.delay(attempt));
                    log::debug!(
                        "{what} failed (attempt {}/{}): {e}. Retrying in {delay:?}",
                        attempt + 1,
                        self.max_attempts
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.cancelled() => {
                            log::debug!("{what} cancelled while waiting for the next attempt");
                            return Err(e);
                        }
                    }
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
