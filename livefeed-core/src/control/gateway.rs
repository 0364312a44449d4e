use std::path::Path;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, info, warn};

use super::codec::ControlCodec;
use super::outbound::{outbound_channel, OutboundReceiver, OutboundSender};
use super::protocol::InboundMessage;
use crate::config::ControlConfig;
use crate::error::Result;

/// Capacity of the parsed inbound command queue
const INBOUND_CHANNEL_CAPACITY: usize = 256;

/// Both directions of the control channel, detached from the socket.
///
/// `inbound` yields `None` once the peer closes the channel. Dropping every
/// clone of `outbound` lets the writer flush and exit.
pub struct ControlChannel {
    pub inbound: mpsc::Receiver<InboundMessage>,
    pub outbound: OutboundSender,
    pub tasks: GatewayTasks,
}

/// Reader and writer tasks of a control channel
pub struct GatewayTasks {
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl GatewayTasks {
    /// Wait for queued outbound messages to be written, then stop reading
    pub async fn finish(self) {
        if let Err(e) = self.writer.await {
            warn!(error = %e, "Control writer task failed");
        }
        self.reader.abort();
    }
}

impl ControlChannel {
    /// Connect to the control process listening on a Unix socket
    pub async fn connect(path: impl AsRef<Path>, config: &ControlConfig) -> Result<Self> {
        let path = path.as_ref();
        let stream = UnixStream::connect(path).await?;
        info!(path = %path.display(), "Connected to control channel");
        let (reader, writer) = stream.into_split();
        Ok(Self::spawn(reader, writer, config))
    }

    /// Start the gateway on an already connected transport
    pub fn spawn<R, W>(reader: R, writer: W, config: &ControlConfig) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CHANNEL_CAPACITY);
        let (outbound_tx, outbound_rx) = outbound_channel(config.outbound_capacity);

        let reader = tokio::spawn(read_loop(
            FramedRead::new(reader, ControlCodec::new(config.max_line_length)),
            inbound_tx,
        ));
        let writer = tokio::spawn(write_loop(
            FramedWrite::new(writer, ControlCodec::new(config.max_line_length)),
            outbound_rx,
        ));

        Self {
            inbound: inbound_rx,
            outbound: outbound_tx,
            tasks: GatewayTasks { reader, writer },
        }
    }
}

async fn read_loop<R>(mut lines: FramedRead<R, ControlCodec>, inbound: mpsc::Sender<InboundMessage>)
where
    R: AsyncRead + Unpin,
{
    while let Some(frame) = lines.next().await {
        match frame {
            Ok(message) => {
                if inbound.send(message).await.is_err() {
                    debug!("Control loop gone, stopping reader");
                    return;
                }
            }
            Err(e) => {
                warn!(error = %e, "Control channel read failed");
                break;
            }
        }
    }
    info!("Control channel closed by peer");
}

async fn write_loop<W>(mut sink: FramedWrite<W, ControlCodec>, mut outbound: OutboundReceiver)
where
    W: AsyncWrite + Unpin,
{
    while let Some(message) = outbound.recv().await {
        if let Err(e) = sink.send(message).await {
            warn!(error = %e, "Control channel write failed");
            return;
        }
    }
    if let Err(e) = sink.close().await {
        debug!(error = %e, "Control channel close failed");
    }
}
