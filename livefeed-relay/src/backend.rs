use async_trait::async_trait;
use livefeed_core::config::RelayConfig;
use livefeed_core::graph::{GraphBackend, GraphEventSender, MediaGraph};
use livefeed_core::{Result, SourceSpec};

use crate::graph::RelayGraph;

/// Builds a [`RelayGraph`] per pipeline start
#[derive(Debug, Clone)]
pub struct RelayBackend {
    config: RelayConfig,
}

impl RelayBackend {
    pub fn new(config: RelayConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl GraphBackend for RelayBackend {
    async fn build(&self, spec: &SourceSpec, events: GraphEventSender) -> Result<Box<dyn MediaGraph>> {
        let graph = RelayGraph::bind(&self.config, spec, events)?;
        Ok(Box::new(graph))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use livefeed_core::graph::{graph_event_channel, GraphEvent, GraphState};

    #[tokio::test]
    async fn test_build_starts_running_graph() {
        let backend = RelayBackend::new(RelayConfig {
            bind_host: "127.0.0.1".to_string(),
            fallback_port: 0,
            ..RelayConfig::default()
        });
        let (events, mut rx) = graph_event_channel(8);

        let mut graph = backend
            .build(&SourceSpec::udp(0), events.with_epoch(3))
            .await
            .unwrap();
        assert!(graph.is_running());

        let envelope = rx.recv().await.unwrap();
        assert_eq!(envelope.epoch, 3);
        assert_eq!(envelope.event, GraphEvent::StateChanged(GraphState::Running));

        graph.shutdown();
        assert!(!graph.is_running());
    }

    #[tokio::test]
    async fn test_port_conflict_fails_build() {
        let taken = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let port = taken.local_addr().unwrap().port();
        let backend = RelayBackend::new(RelayConfig {
            bind_host: "127.0.0.1".to_string(),
            fallback_port: 0,
            ..RelayConfig::default()
        });
        let (events, _rx) = graph_event_channel(8);

        let result = backend
            .build(&SourceSpec::udp(port), events.with_epoch(1))
            .await;
        assert!(result.is_err());
    }
}
