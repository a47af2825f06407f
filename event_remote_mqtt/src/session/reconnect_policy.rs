// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Reconnect policies for a [`MqttSession`](crate::session::MqttSession).

use std::time::Duration;

use rand::Rng;

use crate::error::ConnectionError;

/// Trait defining interface for reconnect policies.
pub trait ReconnectPolicy: Send + Sync {
    /// Get the next reconnect delay.
    /// Returns None if no reconnect should be attempted.
    fn next_reconnect_delay(&self, prev_attempts: u32, error: &ConnectionError)
        -> Option<Duration>;
}

/// A reconnect policy that exponentially backs off the delay between
/// reconnect attempts, with jitter to spread out simultaneous reconnects.
#[derive(Clone)]
pub struct ExponentialBackoffWithJitter {
    /// The delay before the first reconnect attempt.
    pub base_delay: Duration,
    /// The longest possible time to wait between reconnect attempts.
    pub max_wait: Duration,
    /// The max number of reconnect attempts before giving up.
    pub max_reconnect_attempts: Option<u32>,
}

impl ExponentialBackoffWithJitter {
    fn calculate_delay(&self, prev_attempts: u32) -> Duration {
        let exponent = prev_attempts.min(16);
        let interval = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(exponent))
            .min(self.max_wait);

        // Jitter subtracts up to 10% of the delay so that multiple clients
        // do not reconnect at the same instant
        let jitter_multiplier = rand::thread_rng().gen_range(0.90..=1.0);
        interval.mul_f64(jitter_multiplier)
    }
}

impl Default for ExponentialBackoffWithJitter {
    /// Indefinite reconnect, starting at 250ms with a max wait of 60 seconds.
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(250),
            max_wait: Duration::from_secs(60),
            max_reconnect_attempts: None,
        }
    }
}

impl ReconnectPolicy for ExponentialBackoffWithJitter {
    fn next_reconnect_delay(
        &self,
        prev_attempts: u32,
        _error: &ConnectionError,
    ) -> Option<Duration> {
        if let Some(max_attempts) = self.max_reconnect_attempts {
            if prev_attempts >= max_attempts {
                return None;
            }
        }
        Some(self.calculate_delay(prev_attempts))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dummy_error() -> ConnectionError {
        ConnectionError::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "connection reset",
        ))
    }

    #[test]
    fn delay_grows_and_caps() {
        let policy = ExponentialBackoffWithJitter {
            base_delay: Duration::from_millis(100),
            max_wait: Duration::from_secs(2),
            max_reconnect_attempts: None,
        };

        let first = policy.next_reconnect_delay(0, &dummy_error()).unwrap();
        assert!(first <= Duration::from_millis(100));
        assert!(first >= Duration::from_millis(90));

        let later = policy.next_reconnect_delay(3, &dummy_error()).unwrap();
        assert!(later > first);

        // Large attempt counts cap at the max wait
        let capped = policy.next_reconnect_delay(30, &dummy_error()).unwrap();
        assert!(capped <= Duration::from_secs(2));
        assert!(capped >= Duration::from_millis(1800));
    }

    #[test]
    fn attempts_are_bounded() {
        let policy = ExponentialBackoffWithJitter {
            base_delay: Duration::from_millis(100),
            max_wait: Duration::from_secs(2),
            max_reconnect_attempts: Some(3),
        };
        assert!(policy.next_reconnect_delay(2, &dummy_error()).is_some());
        assert!(policy.next_reconnect_delay(3, &dummy_error()).is_none());
    }
}
