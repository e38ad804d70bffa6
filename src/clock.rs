//! Time sources.
//!
//! Every stage reads "now" through a [`Clock`], so the batching window and
//! the OCR poll cycle can be driven deterministically in tests.

use std::sync::Mutex;

use chrono::TimeDelta;

use crate::prelude::*;

/// A source of the current time, plus a way to wait for a later one.
#[async_trait]
pub trait Clock: Send + Sync + 'static {
    /// The current time.
    fn now(&self) -> DateTime<Utc>;

    /// Wait until `deadline`. Returns immediately if it has already passed.
    async fn sleep_until(&self, deadline: DateTime<Utc>);
}

/// The wall clock.
#[derive(Debug, Default)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn sleep_until(&self, deadline: DateTime<Utc>) {
        if let Ok(delay) = (deadline - Utc::now()).to_std() {
            tokio::time::sleep(delay).await;
        }
    }
}

/// A clock that only moves when told to. Sleeping jumps straight to the
/// deadline.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    /// Start at `start`.
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// Move forward by `delta`.
    pub fn advance(&self, delta: TimeDelta) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += delta;
    }

    /// Move to `at`, if it is later than the current time.
    pub fn advance_to(&self, at: DateTime<Utc>) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        if at > *now {
            *now = at;
        }
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn sleep_until(&self, deadline: DateTime<Utc>) {
        self.advance_to(deadline);
    }
}

/// Convert fractional seconds from configuration into a [`TimeDelta`].
pub fn seconds(secs: f64) -> TimeDelta {
    TimeDelta::milliseconds((secs * 1000.0).round() as i64)
}
