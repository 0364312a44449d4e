//! Outbound message lanes
//!
//! Replies and notifications go on an unbounded lane and are never dropped;
//! their rate is bounded by commands and peer events. KLV records go on a
//! bounded lane and are dropped, and counted, once the writer falls behind.
//! Neither lane ever makes the control loop wait.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::warn;

use super::protocol::OutboundMessage;

/// How often to log dropped KLV records (every N drops)
const DROP_LOG_INTERVAL: u64 = 100;

pub fn outbound_channel(bulk_capacity: usize) -> (OutboundSender, OutboundReceiver) {
    let (control_tx, control_rx) = mpsc::unbounded_channel();
    let (bulk_tx, bulk_rx) = mpsc::channel(bulk_capacity);
    (
        OutboundSender {
            control: control_tx,
            bulk: bulk_tx,
            dropped: Arc::new(AtomicU64::new(0)),
        },
        OutboundReceiver {
            control: control_rx,
            bulk: bulk_rx,
        },
    )
}

#[derive(Debug, Clone)]
pub struct OutboundSender {
    control: mpsc::UnboundedSender<OutboundMessage>,
    bulk: mpsc::Sender<OutboundMessage>,
    dropped: Arc<AtomicU64>,
}

impl OutboundSender {
    /// Queue `message` without waiting; false if it was dropped or the writer is gone
    pub fn send(&self, message: OutboundMessage) -> bool {
        if !message.is_bulk() {
            return self.control.send(message).is_ok();
        }

        match self.bulk.try_send(message) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if dropped % DROP_LOG_INTERVAL == 1 {
                    warn!(dropped, "Control channel writer behind, dropping KLV records");
                }
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// KLV records dropped so far
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Writer end; replies are served before queued KLV records
#[derive(Debug)]
pub struct OutboundReceiver {
    control: mpsc::UnboundedReceiver<OutboundMessage>,
    bulk: mpsc::Receiver<OutboundMessage>,
}

impl OutboundReceiver {
    /// Next message, or `None` once every sender is gone and both lanes are drained
    pub async fn recv(&mut self) -> Option<OutboundMessage> {
        tokio::select! {
            biased;
            Some(message) = self.control.recv() => Some(message),
            Some(message) = self.bulk.recv() => Some(message),
            else => None,
        }
    }
}
