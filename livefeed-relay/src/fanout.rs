use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use dashmap::DashMap;
use livefeed_core::ViewerId;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// How often to log per-viewer drop warnings (every N drops)
const DROP_LOG_INTERVAL: u64 = 100;

struct Branch {
    queue: mpsc::Sender<Bytes>,
    dropped: AtomicU64,
}

/// Per-viewer delivery queues fed from the routing point.
///
/// Delivery never waits: a full queue loses the packet, a closed queue
/// removes its branch.
#[derive(Default)]
pub struct FanOut {
    branches: DashMap<ViewerId, Branch>,
}

impl FanOut {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if an existing branch for `id` was replaced
    pub fn attach(&self, id: ViewerId, queue: mpsc::Sender<Bytes>) -> bool {
        self.branches
            .insert(
                id,
                Branch {
                    queue,
                    dropped: AtomicU64::new(0),
                },
            )
            .is_some()
    }

    pub fn detach(&self, id: &ViewerId) -> bool {
        self.branches.remove(id).is_some()
    }

    pub fn len(&self) -> usize {
        self.branches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.branches.is_empty()
    }

    pub fn clear(&self) {
        self.branches.clear();
    }

    /// Packets dropped so far for `id`
    pub fn dropped(&self, id: &ViewerId) -> Option<u64> {
        self.branches
            .get(id)
            .map(|branch| branch.dropped.load(Ordering::Relaxed))
    }

    /// Offer `packet` to every branch; returns how many accepted it
    pub fn deliver(&self, packet: &Bytes) -> usize {
        let mut delivered = 0;
        let mut closed = Vec::new();

        for branch in self.branches.iter() {
            match branch.queue.try_send(packet.clone()) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    let dropped = branch.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                    if dropped % DROP_LOG_INTERVAL == 0 {
                        warn!(client_id = %branch.key(), dropped, "Viewer queue full, dropping packets");
                    }
                }
                Err(mpsc::error::TrySendError::Closed(_)) => closed.push(branch.key().clone()),
            }
        }

        for id in closed {
            debug!(client_id = %id, "Viewer queue closed, removing branch");
            self.branches.remove(&id);
        }
        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delivers_to_every_branch() {
        let fanout = FanOut::new();
        let (tx_a, mut rx_a) = mpsc::channel(4);
        let (tx_b, mut rx_b) = mpsc::channel(4);
        assert!(!fanout.attach(ViewerId::from("a"), tx_a));
        assert!(!fanout.attach(ViewerId::from("b"), tx_b));

        assert_eq!(fanout.deliver(&Bytes::from_static(b"pkt")), 2);
        assert_eq!(rx_a.try_recv().unwrap(), Bytes::from_static(b"pkt"));
        assert_eq!(rx_b.try_recv().unwrap(), Bytes::from_static(b"pkt"));
    }

    #[test]
    fn test_full_queue_drops_without_blocking_others() {
        let fanout = FanOut::new();
        let (slow_tx, _slow_rx) = mpsc::channel(1);
        let (fast_tx, mut fast_rx) = mpsc::channel(8);
        fanout.attach(ViewerId::from("slow"), slow_tx);
        fanout.attach(ViewerId::from("fast"), fast_tx);

        for _ in 0..3 {
            fanout.deliver(&Bytes::from_static(b"pkt"));
        }

        assert_eq!(fanout.dropped(&ViewerId::from("slow")), Some(2));
        assert_eq!(fanout.dropped(&ViewerId::from("fast")), Some(0));
        let mut received = 0;
        while fast_rx.try_recv().is_ok() {
            received += 1;
        }
        assert_eq!(received, 3);
    }

    #[test]
    fn test_closed_queue_removes_branch() {
        let fanout = FanOut::new();
        let (tx, rx) = mpsc::channel(1);
        fanout.attach(ViewerId::from("gone"), tx);
        drop(rx);

        assert_eq!(fanout.deliver(&Bytes::from_static(b"pkt")), 0);
        assert!(fanout.is_empty());
    }

    #[test]
    fn test_attach_replaces_and_detach_removes() {
        let fanout = FanOut::new();
        let (tx, _rx) = mpsc::channel(1);
        fanout.attach(ViewerId::from("a"), tx.clone());
        assert!(fanout.attach(ViewerId::from("a"), tx));
        assert_eq!(fanout.len(), 1);

        assert!(fanout.detach(&ViewerId::from("a")));
        assert!(!fanout.detach(&ViewerId::from("a")));
    }
}
