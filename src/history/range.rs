use std::borrow::Cow;
use std::fmt;
use std::str::FromStr;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::TelemetryError;
use crate::metrics::WorkflowProfile;
use crate::types::Millis;

const HOUR_MS: u64 = 60 * 60 * 1000;

/// Lookback window selected by a range token.
///
/// The tokens `1h`, `6h`, `24h`, `7d` and `all` are part of the query wire
/// contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TimeRange {
    #[serde(rename = "1h")]
    LastHour,
    #[serde(rename = "6h")]
    LastSixHours,
    #[serde(rename = "24h")]
    LastDay,
    #[serde(rename = "7d")]
    LastWeek,
    #[serde(rename = "all")]
    All,
}

impl TimeRange {
    pub const ALL: [TimeRange; 5] = [
        TimeRange::LastHour,
        TimeRange::LastSixHours,
        TimeRange::LastDay,
        TimeRange::LastWeek,
        TimeRange::All,
    ];

    pub fn token(&self) -> &'static str {
        match self {
            TimeRange::LastHour => "1h",
            TimeRange::LastSixHours => "6h",
            TimeRange::LastDay => "24h",
            TimeRange::LastWeek => "7d",
            TimeRange::All => "all",
        }
    }

    /// Window length in milliseconds; `None` for an unbounded window
    pub fn duration_ms(&self) -> Option<u64> {
        match self {
            TimeRange::LastHour => Some(HOUR_MS),
            TimeRange::LastSixHours => Some(6 * HOUR_MS),
            TimeRange::LastDay => Some(24 * HOUR_MS),
            TimeRange::LastWeek => Some(7 * 24 * HOUR_MS),
            TimeRange::All => None,
        }
    }

    pub fn from_token(token: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|range| range.token() == token)
    }
}

impl fmt::Display for TimeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.token())
    }
}

impl FromStr for TimeRange {
    type Err = TelemetryError;

    fn from_str(token: &str) -> Result<Self, Self::Err> {
        Self::from_token(token).ok_or_else(|| TelemetryError::InvalidRange {
            token: token.to_string(),
        })
    }
}

/// Anything that can be placed on the history time axis
pub trait Timestamped {
    fn start_time(&self) -> Millis;
}

impl Timestamped for WorkflowProfile {
    fn start_time(&self) -> Millis {
        self.start_time
    }
}

/// Keep the entries that started strictly after `now - range`, in order.
///
/// `TimeRange::All` borrows the input unchanged.
pub fn filter_by_time_range<T>(history: &[T], range: TimeRange, now: Millis) -> Cow<'_, [T]>
where
    T: Timestamped + Clone,
{
    match range.duration_ms() {
        None => Cow::Borrowed(history),
        Some(duration) => {
            let cutoff = now as i128 - duration as i128;
            Cow::Owned(
                history
                    .iter()
                    .filter(|entry| entry.start_time() as i128 > cutoff)
                    .cloned()
                    .collect(),
            )
        }
    }
}

/// Filter by a wire token.
///
/// An unrecognized token is a fail-safe: it yields an empty result and a
/// warning instead of an error. Callers that want the error parse the token
/// with [`TimeRange::from_str`] and use [`filter_by_time_range`].
pub fn filter_by_range<'a, T>(history: &'a [T], token: &str, now: Millis) -> Cow<'a, [T]>
where
    T: Timestamped + Clone,
{
    match TimeRange::from_token(token) {
        Some(range) => filter_by_time_range(history, range, now),
        None => {
            warn!(%token, "Unrecognized time range, returning an empty history");
            Cow::Owned(Vec::new())
        }
    }
}
