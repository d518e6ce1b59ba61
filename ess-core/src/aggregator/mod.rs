//! Time-windowed record aggregator, grounded line-by-line on `logger.py`'s
//! `DataLogger.run`/`add_handler`: a single consumer task owning a
//! `timestamp -> {fields, deadline}` map and a forest of shared filter
//! chains feeding an ordered list of sink handlers.

mod chain;

pub use chain::FilterChain;

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use ess_contracts::sink::Sink;
use ess_model::error::{EssError, Result};
use ess_model::record::PartialRecord;
use tokio::sync::mpsc;
use tokio::time::{interval, Duration};
use tracing::{error, warn};

const DEFAULT_FLUSH_POLL: Duration = Duration::from_millis(200);

struct PendingEntry {
    fields: PartialRecord,
    deadline: DateTime<Utc>,
}

struct Handler {
    uubnum: Option<u32>,
    chain_key: String,
    sink: Box<dyn Sink>,
}

/// Single-consumer aggregator task. Not `Clone`; callers interact through
/// the `mpsc::Sender<PartialRecord>` returned by [`Aggregator::spawn`].
pub struct Aggregator {
    pending: HashMap<DateTime<Utc>, PendingEntry>,
    last_flushed: Option<DateTime<Utc>>,
    default_timeout: chrono::Duration,
    chains: HashMap<String, FilterChain>,
    handlers: Vec<Handler>,
    rx: mpsc::Receiver<PartialRecord>,
    remove_rx: mpsc::Receiver<u32>,
}

impl Aggregator {
    pub fn new(default_timeout_secs: i64, rx: mpsc::Receiver<PartialRecord>, remove_rx: mpsc::Receiver<u32>) -> Self {
        Self {
            pending: HashMap::new(),
            last_flushed: None,
            default_timeout: chrono::Duration::seconds(default_timeout_secs),
            chains: HashMap::new(),
            handlers: Vec::new(),
            rx,
            remove_rx,
        }
    }

    /// Returns the record-submission sender, a UUB-removal sender (so a
    /// running evaluator task can drop a UUB's handlers without reaching
    /// into the aggregator's private state, mirroring `removeUUB` calling
    /// into each subsystem it owns), and the not-yet-running aggregator.
    pub fn spawn(default_timeout_secs: i64) -> (mpsc::Sender<PartialRecord>, mpsc::Sender<u32>, Aggregator) {
        let (tx, rx) = mpsc::channel(1024);
        let (remove_tx, remove_rx) = mpsc::channel(16);
        (tx, remove_tx, Self::new(default_timeout_secs, rx, remove_rx))
    }

    /// Registers a filter chain under `key`, optionally built on top of an
    /// already-registered `parent_key`. Later handler registrations refer
    /// to chains by `key`.
    pub fn register_chain(&mut self, key: impl Into<String>, parent_key: Option<String>, chain: FilterChain) {
        let mut chain = chain;
        chain.parent_key = parent_key;
        self.chains.insert(key.into(), chain);
    }

    pub fn register_handler(&mut self, chain_key: impl Into<String>, uubnum: Option<u32>, sink: Box<dyn Sink>) {
        self.handlers.push(Handler {
            uubnum,
            chain_key: chain_key.into(),
            sink,
        });
    }

    /// Removes every handler tagged with `uubnum`, then garbage-collects
    /// any filter chain no handler references any more (including chains
    /// referenced only as a now-unreferenced chain's parent).
    pub fn remove_uub(&mut self, uubnum: u32) {
        self.handlers.retain(|h| h.uubnum != Some(uubnum));
        self.gc_chains();
    }

    fn gc_chains(&mut self) {
        loop {
            let mut referenced: std::collections::HashSet<String> =
                self.handlers.iter().map(|h| h.chain_key.clone()).collect();
            let mut changed = true;
            while changed {
                changed = false;
                for (key, chain) in &self.chains {
                    if referenced.contains(key) {
                        if let Some(parent) = &chain.parent_key {
                            if referenced.insert(parent.clone()) {
                                changed = true;
                            }
                        }
                    }
                }
            }
            let before = self.chains.len();
            self.chains.retain(|k, _| referenced.contains(k));
            if self.chains.len() == before {
                break;
            }
        }
    }

    /// Drives the consumer loop until the channel closes. Merges incoming
    /// records and flushes on a fixed poll interval, matching the single
    /// consumer task in the source.
    pub async fn run(mut self) {
        let mut ticker = interval(DEFAULT_FLUSH_POLL);
        loop {
            tokio::select! {
                maybe_uubnum = self.remove_rx.recv() => {
                    if let Some(uubnum) = maybe_uubnum {
                        self.remove_uub(uubnum);
                    }
                }
                maybe_record = self.rx.recv() => {
                    match maybe_record {
                        Some(record) => {
                            if let Err(err) = self.merge(record) {
                                warn!(error = %err, "discarding record");
                            }
                        }
                        None => {
                            self.flush_ready(Utc::now() + chrono::Duration::days(3650)).await;
                            return;
                        }
                    }
                }
                _ = ticker.tick() => {
                    self.flush_ready(Utc::now()).await;
                }
            }
        }
    }

    fn merge(&mut self, mut record: PartialRecord) -> Result<()> {
        let timestamp = record
            .take_timestamp()
            .ok_or_else(|| EssError::Invariant("record missing timestamp field".to_string()))?;

        if let Some(last) = self.last_flushed {
            if timestamp <= last {
                return Err(EssError::Transient {
                    transport: "aggregator".to_string(),
                    message: format!("stale record at {timestamp}, already flushed through {last}"),
                });
            }
        }

        let tout = record
            .take_log_timeout()
            .map(chrono::Duration::seconds)
            .filter(|custom| *custom > self.default_timeout)
            .unwrap_or(self.default_timeout);
        let mut deadline = timestamp + tout;

        // clamp: a newer timestamp's deadline can never be earlier than an
        // older still-pending timestamp's deadline, so flush stays monotone
        for (ts, entry) in self.pending.iter() {
            if *ts < timestamp && entry.deadline > deadline {
                deadline = entry.deadline;
            }
        }

        // the reverse direction: this timestamp may be older than an
        // already-pending one whose deadline elapses sooner. Raise that
        // pending entry's deadline too, or it would flush out of order.
        for (ts, entry) in self.pending.iter_mut() {
            if *ts > timestamp && entry.deadline < deadline {
                entry.deadline = deadline;
            }
        }

        match self.pending.get_mut(&timestamp) {
            Some(entry) => {
                for (k, v) in record.fields {
                    entry.fields.insert(k, v);
                }
                if deadline > entry.deadline {
                    entry.deadline = deadline;
                }
            }
            None => {
                self.pending.insert(timestamp, PendingEntry { fields: record, deadline });
            }
        }

        Ok(())
    }

    async fn flush_ready(&mut self, now: DateTime<Utc>) {
        let mut ready: Vec<DateTime<Utc>> = self
            .pending
            .iter()
            .filter(|(_, e)| e.deadline <= now)
            .map(|(ts, _)| *ts)
            .collect();
        ready.sort();

        for ts in ready {
            if let Some(entry) = self.pending.remove(&ts) {
                self.last_flushed = Some(ts);
                self.dispatch(ts, entry.fields).await;
            }
        }
    }

    async fn dispatch(&mut self, timestamp: DateTime<Utc>, fields: PartialRecord) {
        let mut computed: HashMap<String, PartialRecord> = HashMap::new();
        let chain_keys: Vec<String> = self.chains.keys().cloned().collect();
        let mut order = Vec::new();
        let mut visiting = std::collections::HashSet::new();
        for key in &chain_keys {
            Self::topo_visit(key, &self.chains, &mut order, &mut visiting);
        }

        for key in &order {
            let chain = &self.chains[key];
            let base = match &chain.parent_key {
                Some(parent) => computed.get(parent).cloned().unwrap_or_else(|| fields.clone()),
                None => fields.clone(),
            };
            let result = chain.apply(base);
            computed.insert(key.clone(), result);
        }

        for handler in &mut self.handlers {
            let record = computed
                .get(&handler.chain_key)
                .cloned()
                .unwrap_or_else(|| fields.clone());
            let full = record.into_full(timestamp);
            if let Err(err) = handler.sink.write_rec(&full.into_partial()).await {
                error!(sink = handler.sink.label(), error = %err, "sink write failed");
            }
        }
    }

    /// Parent-before-child ordering over the chain forest via a simple
    /// post-order DFS (parents visited first).
    fn topo_visit(key: &str, chains: &HashMap<String, FilterChain>, order: &mut Vec<String>, visiting: &mut std::collections::HashSet<String>) {
        if order.iter().any(|k| k == key) || !chains.contains_key(key) {
            return;
        }
        if !visiting.insert(key.to_string()) {
            return; // cycle guard; chains are a forest by construction
        }
        if let Some(parent) = chains[key].parent_key.clone() {
            Self::topo_visit(&parent, chains, order, visiting);
        }
        order.push(key.to_string());
    }
}

/// Shared, copy-on-write snapshot of channels data processors have flagged
/// invalid, published by the aggregator and read by workers/filters.
/// Grounded on the source's cross-task `invalid_channels` dict; modeled
/// here as a single owner publishing `Arc` snapshots rather than a shared
/// lock, per the redesign note for process-wide mutable state.
#[derive(Clone, Default)]
pub struct InvalidChannels(Arc<std::collections::HashSet<String>>);

impl InvalidChannels {
    pub fn contains(&self, channel: &str) -> bool {
        self.0.contains(channel)
    }

    pub fn with_added(&self, channel: impl Into<String>) -> Self {
        let mut next = (*self.0).clone();
        next.insert(channel.into());
        Self(Arc::new(next))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct CollectingSink {
        label: String,
        received: Arc<Mutex<Vec<PartialRecord>>>,
    }

    #[async_trait]
    impl Sink for CollectingSink {
        fn label(&self) -> &str {
            &self.label
        }

        async fn write_rec(&mut self, record: &PartialRecord) -> Result<()> {
            self.received.lock().unwrap().push(record.clone());
            Ok(())
        }
    }

    #[tokio::test]
    async fn three_partials_merge_and_flush_at_deadline() {
        let (tx, rx) = mpsc::channel(16);
        let (_remove_tx, remove_rx) = mpsc::channel(16);
        let mut agg = Aggregator::new(10, rx, remove_rx);
        let received = Arc::new(Mutex::new(Vec::new()));
        agg.register_chain("root", None, FilterChain::new(vec![]));
        agg.register_handler(
            "root",
            None,
            Box::new(CollectingSink {
                label: "test".to_string(),
                received: received.clone(),
            }),
        );

        let t = Utc::now();
        let mut r1 = PartialRecord::with_timestamp(t);
        r1.insert("a", 1.0);
        let mut r2 = PartialRecord::with_timestamp(t);
        r2.insert("b", 2.0);
        let mut r3 = PartialRecord::with_timestamp(t);
        r3.insert("c", 3.0);

        agg.merge(r1).unwrap();
        agg.merge(r2).unwrap();
        agg.merge(r3).unwrap();
        drop(tx);

        // not yet due
        agg.flush_ready(t + chrono::Duration::seconds(5)).await;
        assert!(received.lock().unwrap().is_empty());

        agg.flush_ready(t + chrono::Duration::seconds(10)).await;
        let got = received.lock().unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].fields["a"].as_f64(), Some(1.0));
        assert_eq!(got[0].fields["b"].as_f64(), Some(2.0));
        assert_eq!(got[0].fields["c"].as_f64(), Some(3.0));
    }

    #[tokio::test]
    async fn stale_record_after_flush_is_dropped() {
        let (_tx, rx) = mpsc::channel(16);
        let (_remove_tx, remove_rx) = mpsc::channel(16);
        let mut agg = Aggregator::new(10, rx, remove_rx);

        let t = Utc::now();
        let mut r1 = PartialRecord::with_timestamp(t);
        r1.insert("a", 1.0);
        agg.merge(r1).unwrap();
        agg.flush_ready(t + chrono::Duration::seconds(10)).await;

        let mut late = PartialRecord::with_timestamp(t);
        late.insert("a", 99.0);
        let err = agg.merge(late).unwrap_err();
        assert!(matches!(err, EssError::Transient { .. }));
    }
}
