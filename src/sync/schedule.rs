//! Tick cadence and hour/minute allow-lists

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Timelike};
use serde::{Deserialize, Deserializer};

use crate::config::ScheduleConfig;
use crate::error::{RelayError, Result};

/// Spellings of an allow-list that permits every value
const ALWAYS: &[&str] = &["", "*", ".", "all", "every", "each"];

/// Permitted hours or minutes. Empty means "always".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AllowList(Vec<u32>);

impl AllowList {
    pub fn always() -> Self {
        Self(Vec::new())
    }

    pub fn new(mut values: Vec<u32>) -> Self {
        values.sort_unstable();
        values.dedup();
        Self(values)
    }

    pub fn is_always(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, value: u32) -> bool {
        self.is_always() || self.0.binary_search(&value).is_ok()
    }

    pub fn values(&self) -> &[u32] {
        &self.0
    }

    /// Reject values above `max`
    pub fn validate(&self, max: u32, what: &str) -> Result<()> {
        match self.0.iter().find(|v| **v > max) {
            Some(v) => Err(RelayError::Config(format!(
                "{} value {} out of range 0-{}",
                what, v, max
            ))),
            None => Ok(()),
        }
    }
}

impl FromStr for AllowList {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        if ALWAYS.contains(&trimmed.to_ascii_lowercase().as_str()) {
            return Ok(Self::always());
        }
        let values = trimmed
            .split(',')
            .map(|part| {
                part.trim().parse::<u32>().map_err(|_| {
                    RelayError::Config(format!("invalid allow-list entry '{}'", part.trim()))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::new(values))
    }
}

impl fmt::Display for AllowList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_always() {
            return f.write_str("*");
        }
        let joined: Vec<String> = self.0.iter().map(|v| v.to_string()).collect();
        f.write_str(&joined.join(","))
    }
}

impl<'de> Deserialize<'de> for AllowList {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            List(Vec<u32>),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::List(values) => Ok(AllowList::new(values)),
            Raw::Text(text) => text.parse().map_err(serde::de::Error::custom),
        }
    }
}

/// When ticks may run
#[derive(Debug, Clone)]
pub struct Schedule {
    interval: Duration,
    hours: AllowList,
    minutes: AllowList,
}

impl Schedule {
    pub fn new(interval: Duration, hours: AllowList, minutes: AllowList) -> Self {
        Self {
            interval: interval.max(Duration::from_secs(1)),
            hours,
            minutes,
        }
    }

    /// Every `interval`, at any hour and minute
    pub fn every(interval: Duration) -> Self {
        Self::new(interval, AllowList::always(), AllowList::always())
    }

    pub fn from_config(config: &ScheduleConfig) -> Self {
        Self::new(
            Duration::from_secs(config.interval_secs),
            config.hours.clone(),
            config.minutes.clone(),
        )
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// True when either allow-list restricts the schedule
    pub fn is_gated(&self) -> bool {
        !self.hours.is_always() || !self.minutes.is_always()
    }

    /// Whether the allow-lists permit a tick at `now`
    pub fn permits<T: Timelike>(&self, now: &T) -> bool {
        self.hours.contains(now.hour()) && self.minutes.contains(now.minute())
    }

    /// Wall-clock minute identifying a tick slot, when minutes are restricted.
    /// A slot runs at most once.
    pub fn slot<Tz: TimeZone>(&self, now: &DateTime<Tz>) -> Option<i64> {
        if self.minutes.is_always() {
            None
        } else {
            Some(now.timestamp().div_euclid(60))
        }
    }

    /// Remainder of the interval after `elapsed`
    pub fn remaining(&self, elapsed: Duration) -> Duration {
        self.interval.saturating_sub(elapsed)
    }

    /// How long the loop sleeps before re-checking.
    ///
    /// `since_last_tick` is `None` before the first tick has run.
    pub fn next_wait<Tz: TimeZone>(
        &self,
        since_last_tick: Option<Duration>,
        now: &DateTime<Tz>,
    ) -> Duration {
        let remaining = since_last_tick.map_or(Duration::ZERO, |e| self.remaining(e));
        if self.is_gated() && remaining.is_zero() {
            until_next_minute(now)
        } else {
            remaining
        }
    }
}

fn until_next_minute<Tz: TimeZone>(now: &DateTime<Tz>) -> Duration {
    let into_minute = Duration::new(
        u64::from(now.second()),
        now.nanosecond().min(999_999_999),
    );
    Duration::from_secs(60).saturating_sub(into_minute) + Duration::from_millis(5)
}
