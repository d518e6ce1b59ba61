//! Broadcast tick scheduler, grounded line-by-line on `timer.py`'s
//! `Timer.run` loop and on the "one producer, many read-only listeners"
//! broadcast shape of `ConnectionManager` in
//! `ferrex-server/src/infra/websocket/manager.rs`.

mod source;

pub use source::{ListSource, OneShotSource, PeriodicSource, PointEntry, PointSource, TickerSource};

use std::collections::HashMap;
use std::sync::Arc;

use ess_model::tick::{Basetime, TickDetail, TickEvent, TickOffset};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{Duration, Instant};
use tracing::{error, warn};

/// Sentinel flag name that drains the registry and stops the scheduler.
pub const STOP_FLAG: &str = "stop";

const COARSE_SLEEP_THRESHOLD: Duration = Duration::from_secs(2);
const IDLE_SLEEP: Duration = Duration::from_millis(200);
const IMMEDIATE_EPSILON_SECONDS: i64 = 1;

struct TickerState {
    source: TickerSource,
    next_offset: TickOffset,
    next_detail: TickDetail,
}

enum Command {
    AddTicker {
        name: String,
        source: TickerSource,
        offset: TickOffset,
    },
    DelTicker {
        name: String,
    },
    AddImmediate {
        name: String,
        detail: TickDetail,
    },
    ReplaceTicker {
        name: String,
        source: TickerSource,
        offset: TickOffset,
    },
    Stop,
}

/// Handle used by producers (config loaders, the chamber compiler, the
/// evaluator) to register tickers. Cloning is cheap; the scheduler task
/// itself owns no public mutable state.
#[derive(Clone)]
pub struct SchedulerHandle {
    cmd_tx: mpsc::Sender<Command>,
    tick_tx: broadcast::Sender<Arc<TickEvent>>,
}

impl SchedulerHandle {
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<TickEvent>> {
        self.tick_tx.subscribe()
    }

    /// Clones the underlying broadcast sender, for callers building their own
    /// tick-subscribing context rather than subscribing through this handle.
    pub fn tick_sender(&self) -> broadcast::Sender<Arc<TickEvent>> {
        self.tick_tx.clone()
    }

    pub async fn add_ticker(&self, name: impl Into<String>, source: TickerSource, offset: TickOffset) {
        let _ = self
            .cmd_tx
            .send(Command::AddTicker {
                name: name.into(),
                source,
                offset,
            })
            .await;
    }

    pub async fn del_ticker(&self, name: impl Into<String>) {
        let _ = self.cmd_tx.send(Command::DelTicker { name: name.into() }).await;
    }

    pub async fn add_immediate(&self, name: impl Into<String>, detail: TickDetail) {
        let _ = self
            .cmd_tx
            .send(Command::AddImmediate {
                name: name.into(),
                detail,
            })
            .await;
    }

    pub async fn replace_ticker(&self, name: impl Into<String>, source: TickerSource, offset: TickOffset) {
        let _ = self
            .cmd_tx
            .send(Command::ReplaceTicker {
                name: name.into(),
                source,
                offset,
            })
            .await;
    }

    pub async fn stop(&self) {
        let _ = self.cmd_tx.send(Command::Stop).await;
    }
}

/// Owns `(basetime, ticker_map, pending_immediates)` and runs the event
/// loop on its own Tokio task.
pub struct Scheduler {
    basetime: Basetime,
    tickers: HashMap<String, TickerState>,
    immediates: Vec<(String, TickDetail)>,
    cmd_rx: mpsc::Receiver<Command>,
    tick_tx: broadcast::Sender<Arc<TickEvent>>,
    stopped: bool,
}

impl Scheduler {
    pub fn spawn(basetime: Basetime) -> (SchedulerHandle, tokio::task::JoinHandle<()>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(256);
        let (tick_tx, _) = broadcast::channel(256);
        let handle = SchedulerHandle {
            cmd_tx,
            tick_tx: tick_tx.clone(),
        };
        let scheduler = Scheduler {
            basetime,
            tickers: HashMap::new(),
            immediates: Vec::new(),
            cmd_rx,
            tick_tx,
            stopped: false,
        };
        let join = tokio::spawn(scheduler.run());
        (handle, join)
    }

    async fn run(mut self) {
        while !self.stopped {
            self.drain_commands().await;

            let delta0 = self.basetime.ceil_seconds_since(chrono::Utc::now()) + IMMEDIATE_EPSILON_SECONDS;

            if self.tickers.is_empty() && self.immediates.is_empty() {
                tokio::time::sleep(IDLE_SLEEP).await;
                continue;
            }

            let mut fire = self.tickers.values().map(|t| t.next_offset.0).min();
            if !self.immediates.is_empty() {
                fire = Some(fire.map_or(delta0, |f| f.min(delta0)));
            }
            let Some(fire) = fire else {
                tokio::time::sleep(IDLE_SLEEP).await;
                continue;
            };

            let mut flags: HashMap<String, TickDetail> = HashMap::new();
            let mut exhausted = Vec::new();
            for (name, state) in self.tickers.iter_mut() {
                if state.next_offset.0 == fire {
                    flags.insert(name.clone(), state.next_detail.clone());
                    match state.source.next() {
                        Some((offset, detail)) => {
                            state.next_offset = offset;
                            state.next_detail = detail;
                        }
                        None => exhausted.push(name.clone()),
                    }
                }
            }
            for name in exhausted {
                self.tickers.remove(&name);
            }

            if fire >= delta0 {
                let mut deferred = Vec::new();
                for (name, detail) in self.immediates.drain(..) {
                    if flags.contains_key(&name) {
                        deferred.push((name, detail));
                    } else {
                        flags.insert(name, detail);
                    }
                }
                self.immediates = deferred;
            }

            self.sleep_until(fire).await;

            let timestamp = self.basetime.plus(TickOffset(fire));
            let has_stop = flags.contains_key(STOP_FLAG);
            let event = Arc::new(TickEvent { timestamp, flags });
            let _ = self.tick_tx.send(event);

            if has_stop {
                self.tickers.clear();
                self.immediates.clear();
                self.stopped = true;
            }
        }
    }

    async fn sleep_until(&self, fire: i64) {
        let target = self.basetime.plus(TickOffset(fire));
        let now = chrono::Utc::now();
        let remaining = target - now;
        let Ok(remaining_std) = remaining.to_std() else {
            return; // already passed
        };
        if remaining_std > COARSE_SLEEP_THRESHOLD {
            tokio::time::sleep(remaining_std - COARSE_SLEEP_THRESHOLD).await;
        }
        let now = chrono::Utc::now();
        let fine_remaining = target - now;
        if let Ok(fine_std) = fine_remaining.to_std() {
            tokio::time::sleep(fine_std).await;
        }
    }

    async fn drain_commands(&mut self) {
        while let Ok(cmd) = self.cmd_rx.try_recv() {
            match cmd {
                Command::AddTicker { name, mut source, offset } => {
                    if self.tickers.contains_key(&name) {
                        error!(ticker = %name, "duplicate ticker registration ignored");
                        continue;
                    }
                    let Some((first_offset, first_detail)) = source.next() else {
                        warn!(ticker = %name, "ticker source exhausted before first tick, not installed");
                        continue;
                    };
                    let _ = offset;
                    self.tickers.insert(
                        name,
                        TickerState {
                            source,
                            next_offset: first_offset,
                            next_detail: first_detail,
                        },
                    );
                }
                Command::DelTicker { name } => {
                    self.tickers.remove(&name);
                }
                Command::AddImmediate { name, detail } => {
                    self.immediates.push((name, detail));
                }
                Command::ReplaceTicker { name, source, offset } => {
                    self.tickers.remove(&name);
                    self.install_skipping_past(name, source, offset);
                }
                Command::Stop => {
                    let mut flags = HashMap::new();
                    flags.insert(STOP_FLAG.to_string(), TickDetail::Null);
                    let event = Arc::new(TickEvent {
                        timestamp: chrono::Utc::now(),
                        flags,
                    });
                    let _ = self.tick_tx.send(event);
                    self.tickers.clear();
                    self.immediates.clear();
                    self.stopped = true;
                }
            }
        }
    }

    fn install_skipping_past(&mut self, name: String, mut source: TickerSource, _offset: TickOffset) {
        let now_offset = self.basetime.ceil_seconds_since(chrono::Utc::now());
        loop {
            match source.next() {
                Some((offset, detail)) => {
                    if offset.0 >= now_offset {
                        self.tickers.insert(
                            name,
                            TickerState {
                                source,
                                next_offset: offset,
                                next_detail: detail,
                            },
                        );
                        return;
                    }
                }
                None => {
                    warn!(ticker = %name, "replacement ticker exhausted while skipping past offsets, not installed");
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use source::PeriodicSource;

    #[tokio::test(start_paused = true)]
    async fn periodic_ticker_emits_at_expected_offsets() {
        let basetime = Basetime::new(chrono::Utc::now());
        let (handle, _join) = Scheduler::spawn(basetime);
        let mut rx = handle.subscribe();

        handle
            .add_ticker(
                "meas.thp",
                TickerSource::Periodic(PeriodicSource::new(30, Some(3))),
                TickOffset(0),
            )
            .await;

        for expected_offset in [0, 30, 60] {
            let event = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
            assert!(event.has_flag("meas.thp"));
            let elapsed = event.timestamp - basetime.as_datetime();
            assert_eq!(elapsed.num_seconds(), expected_offset);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn immediate_during_firing_tick_defers_to_next() {
        let basetime = Basetime::new(chrono::Utc::now());
        let (handle, _join) = Scheduler::spawn(basetime);
        let mut rx = handle.subscribe();

        handle
            .add_ticker(
                "meas.thp",
                TickerSource::Periodic(PeriodicSource::new(30, Some(2))),
                TickOffset(0),
            )
            .await;

        let first = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
        assert!(first.has_flag("meas.thp"));

        handle.add_immediate("meas.thp", serde_json::json!("X")).await;

        let second = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
        // immediate collided with the periodic tick's own name at the next
        // fire, so it must not appear until the tick after that
        assert!(second.has_flag("meas.thp"));
        let elapsed = second.timestamp - basetime.as_datetime();
        assert_eq!(elapsed.num_seconds(), 30);
    }
}
