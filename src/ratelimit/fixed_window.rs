//! Fixed-window quota.
//!
//! The first request in a window creates a counter that expires when the
//! window ends; every request increments it, and requests beyond the limit
//! are told how long the window has left.

use serde::{Deserialize, Serialize};

use super::algorithm::QuotaAlgorithm;
use crate::error::{LimiterError, Result, StoreError};
use crate::store::{arg, KeySpace, Procedure, StoredValue, MAX_TTL_MS};

/// Sentinel window length that disables a rule.
pub const DISABLED_WINDOW_MS: i64 = -1;

/// Atomic fixed-window procedure. Arguments: `limit`, `window_ms`.
pub static FIXED_WINDOW: Procedure = Procedure {
    name: "fixed_window",
    version: 1,
    source: include_str!("../../lua/fixed_window.lua"),
    native: evaluate,
};

fn evaluate(space: &mut KeySpace<'_>, args: &[i64]) -> std::result::Result<i64, StoreError> {
    let limit = arg(args, 0)?;
    let window_ms = arg(args, 1)?;

    let current = match space.value() {
        None => 1,
        Some(StoredValue::Counter(n)) => n + 1,
        Some(_) => {
            return Err(StoreError::Script(
                "WRONGTYPE key holds a non-counter value".to_string(),
            ))
        }
    };
    space.set(StoredValue::Counter(current));
    if current == 1 {
        space.pexpire(window_ms);
    }

    if current <= limit {
        Ok(0)
    } else {
        Ok(space.pttl())
    }
}

/// Window length as independently configurable components.
///
/// Each component accepts `-1` or any non-negative value. A component of `-1`
/// disables the rule; otherwise the window is the sum in milliseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowSpec {
    #[serde(default)]
    pub milliseconds: i64,
    #[serde(default)]
    pub seconds: i64,
    #[serde(default)]
    pub minutes: i64,
    #[serde(default)]
    pub hours: i64,
}

impl WindowSpec {
    pub fn milliseconds(milliseconds: i64) -> Self {
        Self {
            milliseconds,
            ..Self::default()
        }
    }

    pub fn seconds(seconds: i64) -> Self {
        Self {
            seconds,
            ..Self::default()
        }
    }

    pub fn minutes(minutes: i64) -> Self {
        Self {
            minutes,
            ..Self::default()
        }
    }

    pub fn hours(hours: i64) -> Self {
        Self {
            hours,
            ..Self::default()
        }
    }

    /// A window that disables the rule.
    pub fn disabled() -> Self {
        Self::milliseconds(DISABLED_WINDOW_MS)
    }

    /// Whether any component carries the disabling sentinel.
    pub fn is_disabled(&self) -> bool {
        [self.milliseconds, self.seconds, self.minutes, self.hours].contains(&DISABLED_WINDOW_MS)
    }

    /// Window length in milliseconds, or [`DISABLED_WINDOW_MS`] when disabled.
    pub fn total_ms(&self) -> Result<i64> {
        let components = [
            ("milliseconds", self.milliseconds, 1),
            ("seconds", self.seconds, 1_000),
            ("minutes", self.minutes, 60_000),
            ("hours", self.hours, 3_600_000),
        ];

        for (name, value, _) in components {
            if value < -1 {
                return Err(LimiterError::InvalidRuleParameter(format!(
                    "{} must be >= -1, got {}",
                    name, value
                )));
            }
        }
        if self.is_disabled() {
            return Ok(DISABLED_WINDOW_MS);
        }

        let mut total: i64 = 0;
        for (name, value, scale) in components {
            total = value
                .checked_mul(scale)
                .and_then(|ms| total.checked_add(ms))
                .ok_or_else(|| {
                    LimiterError::InvalidRuleParameter(format!("{} overflows the window", name))
                })?;
        }
        Ok(total)
    }
}

/// Fixed-window algorithm parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixedWindow {
    times: i64,
    window_ms: i64,
}

impl FixedWindow {
    /// Allow `times` requests per `window`.
    ///
    /// A `times` of zero blocks every request for the whole window. A window
    /// of zero opens a fresh, already expired window on every request, so it
    /// never blocks. Windows longer than [`MAX_TTL_MS`] are rejected.
    pub fn new(times: i64, window: WindowSpec) -> Result<Self> {
        if times < 0 {
            return Err(LimiterError::InvalidRuleParameter(format!(
                "times must be >= 0, got {}",
                times
            )));
        }
        let window_ms = window.total_ms()?;
        if window_ms > MAX_TTL_MS {
            return Err(LimiterError::InvalidRuleParameter(format!(
                "window must not exceed {}ms, got {}ms",
                MAX_TTL_MS, window_ms
            )));
        }
        Ok(Self { times, window_ms })
    }

    /// Requests allowed per window.
    pub fn times(&self) -> i64 {
        self.times
    }

    /// Window length in milliseconds.
    pub fn window_ms(&self) -> i64 {
        self.window_ms
    }
}

impl QuotaAlgorithm for FixedWindow {
    fn procedure(&self) -> &'static Procedure {
        &FIXED_WINDOW
    }

    fn arguments(&self) -> Vec<i64> {
        vec![self.times, self.window_ms]
    }

    fn is_disabled(&self) -> bool {
        self.window_ms == DISABLED_WINDOW_MS
    }
}
