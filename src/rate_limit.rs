//! Request budgets for the OCR engine and the classifier.
//!
//! A budget is written `<requests>/<unit>`, such as `10/s`, `600/min` or
//! `5000/h`, both on the command line and in the config file. Budgets are
//! enforced with a token bucket that starts full and refills one token at a
//! time, so a burst is allowed but a long run settles at the stated rate.

use std::{fmt, str::FromStr, time::Duration};

use leaky_bucket::RateLimiter;

use crate::prelude::*;

/// The shortest refill interval we hand to the limiter.
const MIN_REFILL_INTERVAL: Duration = Duration::from_millis(1);

/// The time unit a budget is measured over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BudgetUnit {
    Second,
    Minute,
    Hour,
}

impl BudgetUnit {
    fn duration(self) -> Duration {
        match self {
            BudgetUnit::Second => Duration::from_secs(1),
            BudgetUnit::Minute => Duration::from_secs(60),
            BudgetUnit::Hour => Duration::from_secs(60 * 60),
        }
    }

    fn suffix(self) -> &'static str {
        match self {
            BudgetUnit::Second => "s",
            BudgetUnit::Minute => "m",
            BudgetUnit::Hour => "h",
        }
    }

    fn from_suffix(suffix: &str) -> Option<Self> {
        match suffix.trim() {
            "s" | "sec" | "second" => Some(BudgetUnit::Second),
            "m" | "min" | "minute" => Some(BudgetUnit::Minute),
            "h" | "hr" | "hour" => Some(BudgetUnit::Hour),
            _ => None,
        }
    }
}

/// How many requests an API may receive per [`BudgetUnit`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(try_from = "String", into = "String")]
pub struct RateLimit {
    /// Requests allowed per unit. Never zero.
    requests: u32,
    unit: BudgetUnit,
}

impl RateLimit {
    /// A budget of `requests` per second, clamped to at least one.
    pub fn per_second(requests: usize) -> Self {
        Self {
            requests: u32::try_from(requests.max(1)).unwrap_or(u32::MAX),
            unit: BudgetUnit::Second,
        }
    }

    /// How often one token comes back, and how many come back at once when
    /// that would be faster than [`MIN_REFILL_INTERVAL`].
    fn refill_schedule(&self) -> (Duration, usize) {
        let period = self.unit.duration();
        let interval = (period / self.requests).max(MIN_REFILL_INTERVAL);
        let per_interval =
            u128::from(self.requests) * interval.as_nanos() / period.as_nanos();
        (interval, usize::try_from(per_interval.max(1)).unwrap_or(usize::MAX))
    }

    /// Build a limiter enforcing this budget.
    pub fn limiter(&self) -> RateLimiter {
        let (interval, refill) = self.refill_schedule();
        let capacity = self.requests as usize;
        RateLimiter::builder()
            .initial(capacity)
            .max(capacity)
            .refill(refill)
            .interval(interval)
            .build()
    }
}

impl fmt::Display for RateLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.requests, self.unit.suffix())
    }
}

impl FromStr for RateLimit {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let (requests, unit) = s
            .split_once('/')
            .ok_or_else(|| anyhow!("rate limit {s:?} should look like \"10/s\""))?;
        let requests = requests
            .trim()
            .parse::<u32>()
            .with_context(|| format!("bad request count in rate limit {s:?}"))?;
        if requests == 0 {
            return Err(anyhow!("rate limit {s:?} would never allow a request"));
        }
        let unit = BudgetUnit::from_suffix(unit).ok_or_else(|| {
            anyhow!("unknown unit in rate limit {s:?} (expected s, m or h)")
        })?;
        Ok(Self { requests, unit })
    }
}

impl TryFrom<String> for RateLimit {
    type Error = anyhow::Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<RateLimit> for String {
    fn from(limit: RateLimit) -> Self {
        limit.to_string()
    }
}
