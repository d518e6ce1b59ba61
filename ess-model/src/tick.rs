use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Campaign-wide reference instant, fixed at startup and second-aligned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Basetime(DateTime<Utc>);

impl Basetime {
    /// Truncates the sub-second component of `now`, matching the Python
    /// reference which never carries microseconds into tick arithmetic.
    pub fn new(now: DateTime<Utc>) -> Self {
        let truncated = now - chrono::Duration::microseconds(now.timestamp_subsec_micros() as i64);
        Self(truncated)
    }

    pub fn now() -> Self {
        Self::new(Utc::now())
    }

    pub fn as_datetime(&self) -> DateTime<Utc> {
        self.0
    }

    pub fn plus(&self, offset: TickOffset) -> DateTime<Utc> {
        self.0 + chrono::Duration::seconds(offset.0)
    }

    /// `ceil((instant - basetime).seconds)`, the scheduler's `delta0`.
    pub fn ceil_seconds_since(&self, instant: DateTime<Utc>) -> i64 {
        let delta = instant - self.0;
        let secs = delta.num_seconds();
        let subsec_nanos = (delta - chrono::Duration::seconds(secs)).num_nanoseconds().unwrap_or(0);
        if subsec_nanos > 0 { secs + 1 } else { secs }
    }
}

/// Integer seconds relative to a [`Basetime`]. Signed so that decompiled or
/// negative-duration arithmetic in the chamber compiler can be checked
/// rather than silently wrapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TickOffset(pub i64);

impl TickOffset {
    pub fn new(seconds: i64) -> Self {
        Self(seconds)
    }
}

impl std::ops::Add<i64> for TickOffset {
    type Output = TickOffset;
    fn add(self, rhs: i64) -> TickOffset {
        TickOffset(self.0 + rhs)
    }
}

/// Opaque payload carried by a ticker; the scheduler never inspects it.
pub type TickDetail = serde_json::Value;

/// A published snapshot: every listener for a given tick observes the same
/// `(timestamp, flags)` pair and never mutates it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TickEvent {
    pub timestamp: DateTime<Utc>,
    pub flags: HashMap<String, TickDetail>,
}

impl TickEvent {
    pub fn empty(timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            flags: HashMap::new(),
        }
    }

    pub fn has_flag(&self, name: &str) -> bool {
        self.flags.contains_key(name)
    }

    pub fn into_shared(self) -> Arc<TickEvent> {
        Arc::new(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basetime_truncates_subseconds() {
        let now = DateTime::parse_from_rfc3339("2020-01-01T00:00:00.512Z")
            .unwrap()
            .with_timezone(&Utc);
        let bt = Basetime::new(now);
        assert_eq!(bt.as_datetime().timestamp_subsec_micros(), 0);
    }

    #[test]
    fn ceil_seconds_since_rounds_up_partial_seconds() {
        let bt = Basetime::new(DateTime::parse_from_rfc3339("2020-01-01T00:00:00Z").unwrap().with_timezone(&Utc));
        let later = bt.as_datetime() + chrono::Duration::milliseconds(1500);
        assert_eq!(bt.ceil_seconds_since(later), 2);
        let exact = bt.as_datetime() + chrono::Duration::seconds(5);
        assert_eq!(bt.ceil_seconds_since(exact), 5);
    }
}
