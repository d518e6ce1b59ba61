//! Ticker sources: the four kinds from the scheduler contract, each a
//! sealed implementation of [`ess_contracts::ticker::Ticker`].

use ess_contracts::ticker::Ticker;
use ess_model::tick::{TickDetail, TickOffset};

/// `(interval, count?, offset)` — yields `offset, offset+interval, ...`
/// either `count` times or forever.
pub struct PeriodicSource {
    interval: i64,
    remaining: Option<u64>,
    next: i64,
}

impl PeriodicSource {
    pub fn new(interval: i64, count: Option<u64>) -> Self {
        Self {
            interval,
            remaining: count,
            next: 0,
        }
    }

    pub fn starting_at(interval: i64, count: Option<u64>, offset: i64) -> Self {
        Self {
            interval,
            remaining: count,
            next: offset,
        }
    }
}

impl Ticker for PeriodicSource {
    fn next(&mut self) -> Option<(TickOffset, TickDetail)> {
        if let Some(remaining) = self.remaining {
            if remaining == 0 {
                return None;
            }
            self.remaining = Some(remaining - 1);
        }
        let offset = self.next;
        self.next += self.interval;
        Some((TickOffset(offset), TickDetail::Null))
    }
}

pub struct PointEntry {
    pub offset: i64,
    pub detail: TickDetail,
}

/// A list of `(time, detail)` pairs, optionally injecting a monotone index
/// under `index_key` into each emitted detail object.
pub struct PointSource {
    entries: std::vec::IntoIter<PointEntry>,
    index_key: Option<String>,
    next_index: u64,
}

impl PointSource {
    pub fn new(entries: Vec<PointEntry>, index_key: Option<String>) -> Self {
        Self {
            entries: entries.into_iter(),
            index_key,
            next_index: 0,
        }
    }
}

impl Ticker for PointSource {
    fn next(&mut self) -> Option<(TickOffset, TickDetail)> {
        let entry = self.entries.next()?;
        let mut detail = entry.detail;
        if let Some(key) = &self.index_key {
            if let TickDetail::Object(map) = &mut detail {
                map.insert(key.clone(), serde_json::json!(self.next_index));
            } else {
                let mut map = serde_json::Map::new();
                map.insert(key.clone(), serde_json::json!(self.next_index));
                detail = TickDetail::Object(map);
            }
        }
        self.next_index += 1;
        Some((TickOffset(entry.offset), detail))
    }
}

/// A bare list of offsets sharing one detail shape, with the same optional
/// monotone-index behavior as `PointSource`.
pub struct ListSource {
    inner: PointSource,
}

impl ListSource {
    pub fn new(offsets: Vec<i64>, index_key: Option<String>) -> Self {
        let entries = offsets
            .into_iter()
            .map(|offset| PointEntry {
                offset,
                detail: TickDetail::Null,
            })
            .collect();
        Self {
            inner: PointSource::new(entries, index_key),
        }
    }
}

impl Ticker for ListSource {
    fn next(&mut self) -> Option<(TickOffset, TickDetail)> {
        self.inner.next()
    }
}

/// Yields a single `(offset, detail)` then is exhausted.
pub struct OneShotSource {
    value: Option<(TickOffset, TickDetail)>,
}

impl OneShotSource {
    pub fn new(offset: TickOffset, detail: TickDetail) -> Self {
        Self {
            value: Some((offset, detail)),
        }
    }

    /// `offset = ceil((timestamp - basetime).seconds) + delay`.
    pub fn after_timestamp(basetime: &ess_model::tick::Basetime, timestamp: chrono::DateTime<chrono::Utc>, delay: i64, detail: TickDetail) -> Self {
        let offset = basetime.ceil_seconds_since(timestamp) + delay;
        Self::new(TickOffset(offset), detail)
    }

    pub fn after_delay(delay: i64, detail: TickDetail) -> Self {
        Self::new(TickOffset(delay), detail)
    }
}

impl Ticker for OneShotSource {
    fn next(&mut self) -> Option<(TickOffset, TickDetail)> {
        self.value.take()
    }
}

/// Sealed dispatch over the four ticker kinds; the scheduler holds these
/// behind a flag-name-keyed map rather than `Box<dyn Ticker>` so tests can
/// match on the concrete kind when needed.
pub enum TickerSource {
    Periodic(PeriodicSource),
    Point(PointSource),
    List(ListSource),
    OneShot(OneShotSource),
}

impl TickerSource {
    pub fn next(&mut self) -> Option<(TickOffset, TickDetail)> {
        match self {
            TickerSource::Periodic(s) => s.next(),
            TickerSource::Point(s) => s.next(),
            TickerSource::List(s) => s.next(),
            TickerSource::OneShot(s) => s.next(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn periodic_respects_count() {
        let mut s = PeriodicSource::new(10, Some(2));
        assert_eq!(s.next().unwrap().0, TickOffset(0));
        assert_eq!(s.next().unwrap().0, TickOffset(10));
        assert!(s.next().is_none());
    }

    #[test]
    fn point_source_injects_monotone_index() {
        let entries = vec![
            PointEntry { offset: 5, detail: TickDetail::Null },
            PointEntry { offset: 15, detail: TickDetail::Null },
        ];
        let mut s = PointSource::new(entries, Some("idx".to_string()));
        let (_, d0) = s.next().unwrap();
        let (_, d1) = s.next().unwrap();
        assert_eq!(d0["idx"], serde_json::json!(0));
        assert_eq!(d1["idx"], serde_json::json!(1));
    }

    #[test]
    fn one_shot_yields_once() {
        let mut s = OneShotSource::after_delay(42, TickDetail::Null);
        assert_eq!(s.next().unwrap().0, TickOffset(42));
        assert!(s.next().is_none());
    }
}
