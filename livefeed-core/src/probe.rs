//! Buffer-arrival probe on the ingest branch
//!
//! The probe is the only piece of failover state touched from media threads.
//! Every operation is a plain atomic load or store; the control loop reads a
//! [`ProbeSnapshot`] and makes the actual switching decision.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;
use tokio::time::Instant;

/// Sentinel for "no timestamp recorded"
const UNSET: u64 = 0;

/// Timestamps observed by the probe, in milliseconds since the probe origin
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeSnapshot {
    pub last_buffer_ms: Option<u64>,
    pub resume_start_ms: Option<u64>,
}

/// Lock-free arrival recorder shared between media threads and the control loop
#[derive(Debug)]
pub struct IngestProbe {
    origin: Instant,
    resume_threshold_ms: u64,
    armed: AtomicBool,
    on_ingest: AtomicBool,
    last_buffer_ms: AtomicU64,
    resume_start_ms: AtomicU64,
    notify: Notify,
}

impl IngestProbe {
    pub fn new(resume_threshold_ms: u64) -> Arc<Self> {
        Arc::new(Self {
            origin: Instant::now(),
            resume_threshold_ms,
            armed: AtomicBool::new(false),
            on_ingest: AtomicBool::new(false),
            last_buffer_ms: AtomicU64::new(UNSET),
            resume_start_ms: AtomicU64::new(UNSET),
            notify: Notify::new(),
        })
    }

    /// Milliseconds since the probe was created; never returns the sentinel
    pub fn now_ms(&self) -> u64 {
        u64::try_from(self.origin.elapsed().as_millis())
            .unwrap_or(u64::MAX)
            .saturating_add(1)
    }

    /// Record one buffer arriving on the ingest branch now
    pub fn record(&self) {
        self.record_at(self.now_ms());
    }

    /// Record one buffer arriving at `now_ms`
    pub fn record_at(&self, now_ms: u64) {
        if !self.armed.load(Ordering::Acquire) {
            return;
        }

        let previous = self.last_buffer_ms.swap(now_ms, Ordering::AcqRel);
        if self.on_ingest.load(Ordering::Acquire) {
            return;
        }

        let window_start = self.resume_start_ms.load(Ordering::Acquire);
        let gap = previous != UNSET && now_ms.saturating_sub(previous) > self.resume_threshold_ms;
        if window_start == UNSET || gap {
            self.resume_start_ms.store(now_ms, Ordering::Release);
        }
        self.notify.notify_one();
    }

    /// Start accepting arrivals; called once the ingest input is registered
    pub fn arm(&self) {
        self.armed.store(true, Ordering::Release);
    }

    /// Stop accepting arrivals and forget all timestamps
    pub fn disarm(&self) {
        self.armed.store(false, Ordering::Release);
        self.last_buffer_ms.store(UNSET, Ordering::Release);
        self.resume_start_ms.store(UNSET, Ordering::Release);
    }

    pub fn is_armed(&self) -> bool {
        self.armed.load(Ordering::Acquire)
    }

    /// Mirror the active branch; clears the resume window on every flip
    pub fn set_on_ingest(&self, on_ingest: bool) {
        self.on_ingest.store(on_ingest, Ordering::Release);
        self.resume_start_ms.store(UNSET, Ordering::Release);
    }

    pub fn snapshot(&self) -> ProbeSnapshot {
        ProbeSnapshot {
            last_buffer_ms: non_sentinel(self.last_buffer_ms.load(Ordering::Acquire)),
            resume_start_ms: non_sentinel(self.resume_start_ms.load(Ordering::Acquire)),
        }
    }

    /// Wait until an arrival has been recorded while on fallback
    pub async fn notified(&self) {
        self.notify.notified().await;
    }
}

fn non_sentinel(value: u64) -> Option<u64> {
    (value != UNSET).then_some(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unarmed_probe_ignores_arrivals() {
        let probe = IngestProbe::new(100);
        probe.record_at(10);
        assert_eq!(probe.snapshot().last_buffer_ms, None);
        assert_eq!(probe.snapshot().resume_start_ms, None);
    }

    #[test]
    fn test_window_starts_at_first_arrival() {
        let probe = IngestProbe::new(100);
        probe.arm();
        probe.record_at(10);
        probe.record_at(50);
        let snapshot = probe.snapshot();
        assert_eq!(snapshot.last_buffer_ms, Some(50));
        assert_eq!(snapshot.resume_start_ms, Some(10));
    }

    #[test]
    fn test_gap_restarts_window() {
        let probe = IngestProbe::new(100);
        probe.arm();
        probe.record_at(10);
        probe.record_at(60);
        probe.record_at(300);
        assert_eq!(probe.snapshot().resume_start_ms, Some(300));
    }

    #[test]
    fn test_no_window_while_on_ingest() {
        let probe = IngestProbe::new(100);
        probe.arm();
        probe.set_on_ingest(true);
        probe.record_at(10);
        let snapshot = probe.snapshot();
        assert_eq!(snapshot.last_buffer_ms, Some(10));
        assert_eq!(snapshot.resume_start_ms, None);
    }

    #[test]
    fn test_flip_clears_window() {
        let probe = IngestProbe::new(100);
        probe.arm();
        probe.record_at(10);
        probe.set_on_ingest(false);
        assert_eq!(probe.snapshot().resume_start_ms, None);
    }

    #[test]
    fn test_disarm_forgets_timestamps() {
        let probe = IngestProbe::new(100);
        probe.arm();
        probe.record_at(10);
        probe.disarm();
        assert!(!probe.is_armed());
        assert_eq!(
            probe.snapshot(),
            ProbeSnapshot {
                last_buffer_ms: None,
                resume_start_ms: None
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_now_ms_follows_tokio_clock() {
        let probe = IngestProbe::new(100);
        let before = probe.now_ms();
        tokio::time::advance(std::time::Duration::from_millis(250)).await;
        assert_eq!(probe.now_ms() - before, 250);
    }
}
