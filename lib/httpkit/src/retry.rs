// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Retry policy for upload requests.
//!
//! The core never sleeps or schedules; it only answers the two questions a
//! transport loop asks after a failed request: should this response be
//! retried, and how long to wait. The server's own `Retry-After` family of
//! headers, when present, overrides the computed backoff.

/// Retriable status codes: request timeout, throttling, and the transient
/// 5xx family.
pub fn should_retry_status(status: u16) -> bool {
    matches!(status, 408 | 429 | 500 | 502 | 503 | 504)
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay_ms: u32,
    pub max_delay_ms: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 4,
            base_delay_ms: 4000,
            max_delay_ms: 120_000,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (0-based): exponential doubling
    /// of the base, clamped to the maximum. A server-provided
    /// `retry_after_ms` wins outright (still clamped).
    pub fn delay_ms(&self, attempt: u32, retry_after_ms: Option<u32>) -> u32 {
        if let Some(ms) = retry_after_ms {
            return ms.min(self.max_delay_ms);
        }
        let doubled = match 1u32.checked_shl(attempt) {
            Some(factor) => self.base_delay_ms.saturating_mul(factor),
            None => u32::MAX,
        };
        doubled.min(self.max_delay_ms)
    }

    /// Whether to retry after `status`, and the delay to wait first.
    /// `attempt` counts completed tries, starting at 0.
    pub fn next_delay(
        &self,
        attempt: u32,
        status: u16,
        retry_after_ms: Option<u32>,
    ) -> Option<u32> {
        if attempt >= self.max_retries || !should_retry_status(status) {
            return None;
        }
        Some(self.delay_ms(attempt, retry_after_ms))
    }
}

/// Recognizes the retry-after header family, returning the wait in
/// milliseconds. `Retry-After` carries seconds; the `-ms` variants carry
/// milliseconds. Matching is case-insensitive.
pub fn parse_retry_after(name: &str, value: &str) -> Option<u32> {
    let value: u32 = value.trim().parse().ok()?;
    if name.eq_ignore_ascii_case("retry-after-ms")
        || name.eq_ignore_ascii_case("x-ms-retry-after-ms")
    {
        Some(value)
    } else if name.eq_ignore_ascii_case("retry-after") {
        value.checked_mul(1000)
    } else {
        None
    }
}
