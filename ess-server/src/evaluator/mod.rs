//! UUB fleet supervision: internal serial-number verification, plug-order
//! detection, and controlled removal, grounded on `Evaluator` in
//! `original_source/evaluator.py`.

pub mod order;
pub mod remove;
pub mod serial;

use std::collections::HashMap;
use std::sync::Arc;

use ess_contracts::power_control::PowerControlDriver;
use ess_core::scheduler::STOP_FLAG;
use ess_model::error::Result;
use tokio::sync::{mpsc, Mutex, Notify};
use tracing::warn;

pub use remove::RemovalChannels;
pub use serial::{IsnReport, IsnSeverity};

use crate::workers::WorkerContext;

/// Shared abort signal: any task holding a clone can check
/// `is_triggered()` or await `notified()`, matching `ess.critical_error`
/// setting `self.abort` and waking every thread blocked on `timer.evt`.
#[derive(Clone)]
pub struct CriticalError {
    notify: Arc<Notify>,
    triggered: Arc<std::sync::atomic::AtomicBool>,
}

impl Default for CriticalError {
    fn default() -> Self {
        Self {
            notify: Arc::new(Notify::new()),
            triggered: Arc::new(std::sync::atomic::AtomicBool::new(false)),
        }
    }
}

impl CriticalError {
    pub fn trigger(&self) {
        self.triggered.store(true, std::sync::atomic::Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_triggered(&self) -> bool {
        self.triggered.load(std::sync::atomic::Ordering::SeqCst)
    }

    pub async fn notified(&self) {
        self.notify.notified().await;
    }
}

/// Known internal serial numbers by UUB number, as loaded from the
/// campaign database (`ctx.internalSNs`).
pub type DbIsnTable = HashMap<u32, String>;

/// Per-UUB internal-serial-number readout, as reported by the UUB worker
/// (`uubtsc.internalSN`): `Ok(Some(isn))` read, `Ok(None)` not live,
/// `Err(_)` an I2C read failure.
pub type LiveIsnTable = HashMap<u32, std::result::Result<Option<String>, ()>>;

pub struct Evaluator<P> {
    uubnums: Vec<Option<u32>>,
    db_isn: DbIsnTable,
    live_isn: Arc<Mutex<LiveIsnTable>>,
    pc: Arc<Mutex<P>>,
    critical_error: CriticalError,
    removal: RemovalChannels,
    transcript_tx: mpsc::Sender<String>,
}

impl<P: PowerControlDriver + 'static> Evaluator<P> {
    pub fn new(
        uubnums: Vec<Option<u32>>,
        db_isn: DbIsnTable,
        live_isn: Arc<Mutex<LiveIsnTable>>,
        pc: Arc<Mutex<P>>,
        critical_error: CriticalError,
        removal: RemovalChannels,
        transcript_tx: mpsc::Sender<String>,
    ) -> Self {
        Self {
            uubnums,
            db_isn,
            live_isn,
            pc,
            critical_error,
            removal,
            transcript_tx,
        }
    }

    /// Drives the per-tick `eval` namespace: `checkISN`, `orderUUB` and
    /// `removeUUB` sub-flags, matching `Evaluator.run`'s flag dispatch.
    pub async fn run(mut self, ctx: WorkerContext) -> Result<()> {
        let mut rx = ctx.subscribe();
        let mut order_tasks: Vec<tokio::task::JoinHandle<()>> = Vec::new();
        loop {
            let event = match rx.recv().await {
                Ok(event) => event,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "evaluator lagged behind tick broadcast");
                    continue;
                }
            };

            order_tasks.retain(|h| !h.is_finished());

            if event.has_flag(STOP_FLAG) {
                break;
            }

            let Some(serde_json::Value::Object(eval_flags)) = event.flags.get("eval") else {
                continue;
            };

            if let Some(severity_val) = eval_flags.get("checkISN") {
                let severity = IsnSeverity::from_json(severity_val);
                let report = self.check_isn(severity).await;
                self.write_report(&report).await;
                if report.should_abort {
                    self.critical_error.trigger();
                }
            }

            if let Some(order_val) = eval_flags.get("orderUUB") {
                let abort = order_val.as_bool().unwrap_or(true);
                let uubnums = self.uubnums.clone();
                let pc = Arc::clone(&self.pc);
                let critical_error = self.critical_error.clone();
                let transcript_tx = self.transcript_tx.clone();
                order_tasks.push(tokio::spawn(async move {
                    match order::order_uub(&uubnums, pc).await {
                        Ok(detected) => {
                            if detected != uubnums {
                                let _ = transcript_tx
                                    .send(format!(
                                        "Incorrect UUB numbers. Detected UUBs: {:?}.",
                                        detected
                                    ))
                                    .await;
                                if abort {
                                    critical_error.trigger();
                                }
                            }
                        }
                        Err(err) => warn!(error = %err, "orderUUB check failed"),
                    }
                }));
            }

            if let Some(serde_json::Value::Array(remove_list)) = eval_flags.get("removeUUB") {
                for uubnum in remove_list.iter().filter_map(|v| v.as_u64()) {
                    self.removal.remove(uubnum as u32).await;
                }
            }

            if let Some(message) = eval_flags.get("message").and_then(|v| v.as_str()) {
                let _ = self.transcript_tx.send(message.to_string()).await;
            }
        }
        for task in order_tasks {
            let _ = task.await;
        }
        Ok(())
    }

    async fn check_isn(&self, severity: IsnSeverity) -> IsnReport {
        let live = self.live_isn.lock().await;
        serial::check_isn(&self.uubnums, &self.db_isn, &live, severity)
    }

    async fn write_report(&self, report: &IsnReport) {
        for line in &report.lines {
            let _ = self.transcript_tx.send(line.clone()).await;
        }
    }
}
