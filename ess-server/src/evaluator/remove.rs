//! Controlled UUB removal, grounded on `ESS.removeUUB` in
//! `original_source/ess.py`: the source reaches directly into each
//! subsystem's `uubnums2del` list and joins the UUB's own thread. Each
//! subsystem here instead owns a small `mpsc::Sender<u32>` the evaluator
//! notifies, so removal never has to reach into another task's private
//! state (the aggregator's handler table, the chamber relay map, the UUB
//! HTTP poller) — every long-running worker already `select!`s its tick
//! broadcast, and a removal channel is just one more branch.

use tokio::sync::mpsc;
use tracing::warn;

/// One removal-notification sender per subsystem that needs to stop
/// acting on a UUB once it's pulled from the campaign: the power-control
/// relay bank, the aggregator's handler table, and any per-UUB worker
/// task (UUB HTTP poller, telnet console) that holds its own sender.
#[derive(Clone, Default)]
pub struct RemovalChannels {
    senders: Vec<mpsc::Sender<u32>>,
}

impl RemovalChannels {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_subsystem(mut self, tx: mpsc::Sender<u32>) -> Self {
        self.senders.push(tx);
        self
    }

    /// Notifies every registered subsystem that `uubnum` is being removed.
    /// A subsystem whose channel is closed is skipped with a warning
    /// rather than aborting the whole removal, matching the source's
    /// best-effort `uubnums2del.append` calls (no subsystem blocks
    /// another's cleanup).
    pub async fn remove(&self, uubnum: u32) {
        for tx in &self.senders {
            if tx.send(uubnum).await.is_err() {
                warn!(uubnum, "removal channel closed for a subsystem, skipping");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn remove_notifies_every_registered_subsystem() {
        let (tx1, mut rx1) = mpsc::channel(4);
        let (tx2, mut rx2) = mpsc::channel(4);
        let channels = RemovalChannels::new().with_subsystem(tx1).with_subsystem(tx2);

        channels.remove(42).await;

        assert_eq!(rx1.recv().await, Some(42));
        assert_eq!(rx2.recv().await, Some(42));
    }
}
