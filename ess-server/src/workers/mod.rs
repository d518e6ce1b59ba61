//! Instrument workers: one `tokio::spawn`ed task per device, each holding a
//! `broadcast::Receiver<Arc<TickEvent>>` and an `mpsc::Sender` into the
//! response queue, grounded on the worker/consumer shape of
//! `ferrex-server/src/transcoding/worker.rs`.

pub mod afg;
pub mod bme;
pub mod chamber;
pub mod mdo;
pub mod power;
pub mod psu;
pub mod uub;

use std::sync::Arc;

use ess_model::record::PartialRecord;
use ess_model::tick::TickEvent;
use tokio::sync::{broadcast, mpsc};

/// Everything a worker needs to subscribe to ticks and publish results.
/// Cloning is cheap; every worker task gets its own subscription.
#[derive(Clone)]
pub struct WorkerContext {
    pub tick_tx: broadcast::Sender<Arc<TickEvent>>,
    pub response_tx: mpsc::Sender<PartialRecord>,
}

impl WorkerContext {
    pub fn new(tick_tx: broadcast::Sender<Arc<TickEvent>>, response_tx: mpsc::Sender<PartialRecord>) -> Self {
        Self { tick_tx, response_tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<TickEvent>> {
        self.tick_tx.subscribe()
    }
}
