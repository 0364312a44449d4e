//! Input-failover decision logic
//!
//! [`FailoverController`] owns no timers and no I/O. The control loop feeds it
//! probe snapshots and clock readings and applies whatever switch it returns
//! to the routing point.

use tracing::{debug, info, warn};

use crate::config::FailoverConfig;
use crate::probe::ProbeSnapshot;
use crate::types::SourceBranch;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailoverState {
    OnFallback,
    OnIngest,
}

impl FailoverState {
    #[must_use]
    pub const fn branch(self) -> SourceBranch {
        match self {
            Self::OnFallback => SourceBranch::Fallback,
            Self::OnIngest => SourceBranch::Ingest,
        }
    }
}

#[derive(Debug)]
pub struct FailoverController {
    state: FailoverState,
    ingest_registered: bool,
    watchdog_timeout_ms: u64,
    resume_threshold_ms: u64,
}

impl FailoverController {
    pub fn new(config: &FailoverConfig) -> Self {
        Self {
            state: FailoverState::OnFallback,
            ingest_registered: false,
            watchdog_timeout_ms: config.watchdog_timeout_ms,
            resume_threshold_ms: config.resume_threshold_ms,
        }
    }

    #[must_use]
    pub const fn state(&self) -> FailoverState {
        self.state
    }

    #[must_use]
    pub const fn active(&self) -> SourceBranch {
        self.state.branch()
    }

    #[must_use]
    pub const fn is_ingest_registered(&self) -> bool {
        self.ingest_registered
    }

    /// The ingest input is now registered at the routing point; it stays so
    /// until [`reset`](Self::reset)
    pub fn mark_ingest_registered(&mut self) {
        self.ingest_registered = true;
    }

    /// Check the resume condition after an ingest arrival
    pub fn on_arrival(&mut self, snapshot: ProbeSnapshot) -> Option<SourceBranch> {
        if self.state != FailoverState::OnFallback || !self.ingest_registered {
            return None;
        }
        let (Some(start), Some(last)) = (snapshot.resume_start_ms, snapshot.last_buffer_ms) else {
            return None;
        };

        let window = last.saturating_sub(start);
        if window >= self.resume_threshold_ms {
            info!(window_ms = window, "Ingest stable, resuming live source");
            return self.switch(FailoverState::OnIngest);
        }
        debug!(window_ms = window, "Ingest resume window growing");
        None
    }

    /// Periodic watchdog check
    pub fn on_tick(&mut self, snapshot: ProbeSnapshot, now_ms: u64) -> Option<SourceBranch> {
        if self.state != FailoverState::OnIngest {
            return None;
        }
        let elapsed = snapshot
            .last_buffer_ms
            .map_or(u64::MAX, |last| now_ms.saturating_sub(last));

        if elapsed > self.watchdog_timeout_ms {
            warn!(elapsed_ms = elapsed, "Ingest silent, switching to fallback");
            return self.switch(FailoverState::OnFallback);
        }
        None
    }

    /// Unrecoverable error on an ingest-side stage; bypasses the timing check
    pub fn on_ingest_error(&mut self) -> Option<SourceBranch> {
        if self.state != FailoverState::OnIngest {
            return None;
        }
        self.switch(FailoverState::OnFallback)
    }

    /// Return to the initial state for a fresh graph
    pub fn reset(&mut self) {
        self.state = FailoverState::OnFallback;
        self.ingest_registered = false;
    }

    fn switch(&mut self, next: FailoverState) -> Option<SourceBranch> {
        if self.state == next {
            return None;
        }
        self.state = next;
        info!(active = %next.branch(), "Active source changed");
        Some(next.branch())
    }
}
