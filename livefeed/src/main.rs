use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use livefeed_core::control::ControlChannel;
use livefeed_core::{logging, Config, Engine};
use livefeed_relay::RelayBackend;
use livefeed_rtc::RtcPeerFactory;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "livefeed")]
#[command(about = "Resilient live video bridge with WebRTC fan-out", long_about = None)]
struct Args {
    /// Unix socket of the supervising control process
    #[arg(env = "LIVEFEED_IPC_SOCKET")]
    ipc_socket_path: PathBuf,

    /// Configuration file (YAML); missing files are skipped
    #[arg(long, env = "LIVEFEED_CONFIG_PATH", default_value = "livefeed.yaml")]
    config: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // 1. Load configuration
    let config = Config::load(Some(&args.config))
        .with_context(|| format!("Failed to load configuration from {}", args.config))?;

    // 2. Validate configuration (fail fast on misconfigurations)
    if let Err(errors) = config.validate() {
        for e in &errors {
            eprintln!("Config validation error: {e}");
        }
        return Err(anyhow::anyhow!(
            "Configuration validation failed with {} error(s)",
            errors.len()
        ));
    }

    // 3. Initialize logging
    logging::init_logging(&config.logging)?;
    info!(socket = %args.ipc_socket_path.display(), "livefeed starting");

    // 4. Connect to the control process
    let channel = ControlChannel::connect(&args.ipc_socket_path, &config.control)
        .await
        .with_context(|| format!("Failed to connect to {}", args.ipc_socket_path.display()))?;
    let ControlChannel {
        inbound,
        outbound,
        tasks,
    } = channel;

    // 5. Media graph backend and peer factory
    let backend = Arc::new(RelayBackend::new(config.relay.clone()));
    let peers = Arc::new(RtcPeerFactory::new(&config.webrtc)?);
    let engine = Engine::new(config, backend, peers);

    // 6. Run until the control channel closes, a fatal error, or a signal
    let result = tokio::select! {
        result = engine.run(inbound, outbound) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, shutting down");
            Ok(())
        }
    };

    // Flush whatever the control loop queued before exiting
    tasks.finish().await;

    match result {
        Ok(()) => {
            info!("livefeed stopped");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "livefeed terminated");
            Err(e.into())
        }
    }
}
