//! In-place reconfiguration of the ingest source

use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::HotSwapConfig;
use crate::error::Result;
use crate::graph::MediaGraph;
use crate::types::SourceSpec;

/// Pending forced-resync request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResyncTicket {
    token: u64,
    retried: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResyncOutcome {
    /// A newer hot-swap superseded this ticket
    Stale,
    Requested,
    /// Graph not running yet; check again after another settle delay
    Retry(ResyncTicket),
    GaveUp,
}

#[derive(Debug)]
pub struct HotSwapController {
    settle_delay: Duration,
    token: u64,
}

impl HotSwapController {
    pub fn new(config: &HotSwapConfig) -> Self {
        Self {
            settle_delay: config.settle_delay(),
            token: 0,
        }
    }

    #[must_use]
    pub const fn settle_delay(&self) -> Duration {
        self.settle_delay
    }

    /// Reconfigure the ingest source and hand back the resync to schedule
    pub fn begin(&mut self, graph: &mut dyn MediaGraph, spec: &SourceSpec) -> Result<ResyncTicket> {
        graph.reconfigure_ingest(spec)?;
        self.token += 1;
        info!(
            token = self.token,
            source_type = %spec.source_type,
            port = spec.source_config.port,
            "Ingest source hot-swapped"
        );
        Ok(ResyncTicket {
            token: self.token,
            retried: false,
        })
    }

    /// Invalidate every outstanding ticket
    pub fn cancel(&mut self) {
        self.token += 1;
    }

    pub fn on_resync_due(
        &mut self,
        graph: Option<&mut (dyn MediaGraph + 'static)>,
        ticket: ResyncTicket,
    ) -> ResyncOutcome {
        if ticket.token != self.token {
            debug!(token = ticket.token, current = self.token, "Ignoring stale resync");
            return ResyncOutcome::Stale;
        }

        match graph {
            Some(graph) if graph.is_running() => match graph.force_resync() {
                Ok(()) => {
                    info!(token = ticket.token, "Forced resync requested");
                    ResyncOutcome::Requested
                }
                Err(e) => {
                    warn!(token = ticket.token, error = %e, "Forced resync failed");
                    ResyncOutcome::GaveUp
                }
            },
            _ if !ticket.retried => {
                debug!(token = ticket.token, "Graph not running, retrying resync once");
                ResyncOutcome::Retry(ResyncTicket {
                    token: ticket.token,
                    retried: true,
                })
            }
            _ => {
                warn!(token = ticket.token, "Graph still not running, resync skipped");
                ResyncOutcome::GaveUp
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::FakeGraph;

    fn controller() -> HotSwapController {
        HotSwapController::new(&HotSwapConfig::default())
    }

    #[test]
    fn test_begin_reconfigures_ingest() {
        let (mut graph, state) = FakeGraph::new();
        let mut hotswap = controller();

        hotswap.begin(&mut graph, &SourceSpec::udp(6000)).unwrap();
        assert_eq!(state.lock().reconfigured, vec![SourceSpec::udp(6000)]);
        assert_eq!(hotswap.settle_delay(), Duration::from_millis(1000));
    }

    #[test]
    fn test_resync_when_running() {
        let (mut graph, state) = FakeGraph::new();
        let mut hotswap = controller();

        let ticket = hotswap.begin(&mut graph, &SourceSpec::udp(6000)).unwrap();
        assert_eq!(
            hotswap.on_resync_due(Some(&mut graph), ticket),
            ResyncOutcome::Requested
        );
        assert_eq!(state.lock().resyncs, 1);
    }

    #[test]
    fn test_not_running_retries_exactly_once() {
        let (mut graph, state) = FakeGraph::new();
        let mut hotswap = controller();

        let ticket = hotswap.begin(&mut graph, &SourceSpec::udp(6000)).unwrap();
        state.lock().running = false;

        let ResyncOutcome::Retry(retry) = hotswap.on_resync_due(Some(&mut graph), ticket) else {
            panic!("expected a retry");
        };
        assert_eq!(
            hotswap.on_resync_due(Some(&mut graph), retry),
            ResyncOutcome::GaveUp
        );
        assert_eq!(state.lock().resyncs, 0);
    }

    #[test]
    fn test_retry_succeeds_once_running() {
        let (mut graph, state) = FakeGraph::new();
        let mut hotswap = controller();

        let ticket = hotswap.begin(&mut graph, &SourceSpec::udp(6000)).unwrap();
        let ResyncOutcome::Retry(retry) = hotswap.on_resync_due(None, ticket) else {
            panic!("expected a retry");
        };
        assert_eq!(
            hotswap.on_resync_due(Some(&mut graph), retry),
            ResyncOutcome::Requested
        );
        assert_eq!(state.lock().resyncs, 1);
    }

    #[test]
    fn test_superseded_ticket_is_stale() {
        let (mut graph, state) = FakeGraph::new();
        let mut hotswap = controller();

        let first = hotswap.begin(&mut graph, &SourceSpec::udp(6000)).unwrap();
        let second = hotswap.begin(&mut graph, &SourceSpec::udp(6001)).unwrap();

        assert_eq!(hotswap.on_resync_due(Some(&mut graph), first), ResyncOutcome::Stale);
        assert_eq!(
            hotswap.on_resync_due(Some(&mut graph), second),
            ResyncOutcome::Requested
        );
        assert_eq!(state.lock().resyncs, 1);

        hotswap.cancel();
        assert_eq!(hotswap.on_resync_due(Some(&mut graph), second), ResyncOutcome::Stale);
    }
}
