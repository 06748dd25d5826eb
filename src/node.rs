use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncRead;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::crypto::NodeKey;
use crate::explorer::{ChainHandle, ExplorerMessage};
use crate::metrics;
use crate::peer::{PeerError, PeerSession, SyncSettings};
use crate::protocol::{read_frame, write_frame, Message};

/// Keeps one outbound connection to the configured peer alive.
pub struct Node {
    peer: String,
    connect_timeout: Duration,
    reconnect_delay: Duration,
    settings: SyncSettings,
    chain: ChainHandle,
    key: Arc<NodeKey>,
    messages: Option<mpsc::UnboundedSender<ExplorerMessage>>,
}

impl Node {
    pub fn new(
        cfg: &Config,
        chain: ChainHandle,
        key: Arc<NodeKey>,
        messages: Option<mpsc::UnboundedSender<ExplorerMessage>>,
    ) -> Result<Self> {
        Ok(Self {
            peer: cfg.node.peer.clone(),
            connect_timeout: Duration::from_secs(cfg.node.connect_timeout_secs),
            reconnect_delay: Duration::from_secs(cfg.node.reconnect_delay_secs),
            settings: SyncSettings::from_config(cfg)?,
            chain,
            key,
            messages,
        })
    }

    fn publish(&self, message: ExplorerMessage) {
        if let Some(tx) = &self.messages {
            let _ = tx.send(message);
        }
    }

    /// Connects, syncs and reconnects until shutdown. Returns an error only
    /// when ingestion hit a fatal inconsistency.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        let mut first = true;
        loop {
            if !first {
                metrics::PEER_RECONNECTS.inc();
            }
            first = false;

            let result = tokio::select! {
                r = self.connect_once() => r,
                _ = shutdown.recv() => {
                    info!("node worker shutting down");
                    return Ok(());
                }
            };
            match result {
                Err(e) if e.is_fatal() => {
                    error!("🛑 halting ingestion: {e}");
                    return Err(e.into());
                }
                Err(e) => warn!("connection to {} ended: {e}", self.peer),
                Ok(()) => info!("connection to {} closed", self.peer),
            }

            tokio::select! {
                _ = tokio::time::sleep(self.reconnect_delay) => {}
                _ = shutdown.recv() => return Ok(()),
            }
        }
    }

    async fn connect_once(&self) -> Result<(), PeerError> {
        let stream = match tokio::time::timeout(self.connect_timeout, TcpStream::connect(&self.peer)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                self.publish(ExplorerMessage::NodeConnectError(e.to_string()));
                return Err(e.into());
            }
            Err(_) => {
                let e = std::io::Error::new(std::io::ErrorKind::TimedOut, "connect timed out");
                self.publish(ExplorerMessage::NodeConnectError(e.to_string()));
                return Err(e.into());
            }
        };
        info!("🔗 connected to {}", self.peer);
        self.publish(ExplorerMessage::NodeConnected);

        let (mut reader, mut writer) = stream.into_split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        let writer_task = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                if let Err(e) = write_frame(&mut writer, &message).await {
                    warn!("write of {} failed: {e}", message.name());
                    break;
                }
            }
        });

        let mut session = PeerSession::new(self.chain.clone(), tx, self.settings.clone(), self.key.clone());
        let result = drive(&mut session, &mut reader).await;
        drop(session);
        writer_task.abort();

        let reason = match &result {
            Ok(()) => "closed".to_string(),
            Err(e) => e.to_string(),
        };
        self.publish(ExplorerMessage::NodeDisconnected(reason));
        result
    }
}

/// Feeds frames from `reader` into `session` until either side fails.
pub async fn drive<R: AsyncRead + Unpin>(session: &mut PeerSession, reader: &mut R) -> Result<(), PeerError> {
    session.start()?;
    loop {
        let message = read_frame(reader).await?;
        debug!("received {}", message.name());
        session.handle_message(message).await?;
    }
}
