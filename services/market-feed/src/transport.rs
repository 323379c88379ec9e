//! Transport boundary and the upstream WebSocket adapter
//!
//! The engine never touches a socket. It emits `TransportCommand`s and
//! consumes `TransportEvent`s, each tagged with the connection epoch it
//! belongs to. `WsTransport` is the production implementation of the other
//! side; tests drive the same boundary with plain channels.

use anyhow::{anyhow, Context};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::error::FeedError;
use crate::events::WireCommand;
use crate::handle::Inbound;

/// Instruction from the engine to the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportCommand {
    /// Open a new physical connection; any older one is abandoned.
    Open { epoch: u64, authenticated: bool },
    Send { epoch: u64, command: WireCommand },
    Close { epoch: u64 },
}

impl TransportCommand {
    pub fn epoch(&self) -> u64 {
        match self {
            TransportCommand::Open { epoch, .. }
            | TransportCommand::Send { epoch, .. }
            | TransportCommand::Close { epoch } => *epoch,
        }
    }
}

/// Notification from the transport to the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Opened { epoch: u64 },
    Authenticated { epoch: u64 },
    Message { epoch: u64, text: String },
    /// Closed, failed to open, or dropped.
    Closed { epoch: u64 },
}

/// Delivers transport events into the engine's inbound queue.
#[derive(Debug, Clone)]
pub struct TransportSink {
    inbound: mpsc::Sender<Inbound>,
}

impl TransportSink {
    pub(crate) fn new(inbound: mpsc::Sender<Inbound>) -> Self {
        Self { inbound }
    }

    /// Waits while the inbound queue is full.
    pub async fn deliver(&self, event: TransportEvent) -> Result<(), FeedError> {
        self.inbound
            .send(Inbound::Transport(event))
            .await
            .map_err(|_| FeedError::Shutdown)
    }
}

/// The transport's end of the boundary.
#[derive(Debug)]
pub struct TransportLink {
    pub commands: mpsc::UnboundedReceiver<TransportCommand>,
    pub sink: TransportSink,
}

struct ActiveConnection {
    epoch: u64,
    outgoing: mpsc::UnboundedSender<String>,
    task: JoinHandle<()>,
}

/// Upstream ranger connection over `tokio-tungstenite`.
#[derive(Debug, Clone)]
pub struct WsTransport {
    url: String,
    auth_token: Option<String>,
}

impl WsTransport {
    pub fn new(url: impl Into<String>, auth_token: Option<String>) -> Self {
        Self {
            url: url.into(),
            auth_token,
        }
    }

    /// Serve engine commands until the engine goes away.
    pub async fn run(self, mut link: TransportLink) {
        let mut active: Option<ActiveConnection> = None;

        while let Some(command) = link.commands.recv().await {
            match command {
                TransportCommand::Open {
                    epoch,
                    authenticated,
                } => {
                    if let Some(old) = active.take() {
                        old.task.abort();
                    }
                    let (outgoing, queued) = mpsc::unbounded_channel();
                    let task = tokio::spawn(connection_task(
                        self.clone(),
                        epoch,
                        authenticated,
                        queued,
                        link.sink.clone(),
                    ));
                    active = Some(ActiveConnection {
                        epoch,
                        outgoing,
                        task,
                    });
                }
                TransportCommand::Send { epoch, command } => match &active {
                    Some(conn) if conn.epoch == epoch => {
                        if conn.outgoing.send(command.to_json()).is_err() {
                            debug!(epoch, "Connection task gone, command dropped");
                        }
                    }
                    _ => debug!(epoch, "Command for superseded epoch dropped"),
                },
                TransportCommand::Close { epoch } => {
                    if active.as_ref().is_some_and(|conn| conn.epoch == epoch) {
                        if let Some(conn) = active.take() {
                            conn.task.abort();
                            info!(epoch, "Upstream connection closed");
                        }
                    }
                }
            }
        }

        if let Some(conn) = active.take() {
            conn.task.abort();
        }
    }
}

async fn connection_task(
    transport: WsTransport,
    epoch: u64,
    authenticated: bool,
    queued: mpsc::UnboundedReceiver<String>,
    sink: TransportSink,
) {
    if let Err(e) = stream(&transport, epoch, authenticated, queued, &sink).await {
        warn!(epoch, error = %e, "Upstream connection failed");
    }
    // The engine ignores this if the epoch was already superseded
    let _ = sink.deliver(TransportEvent::Closed { epoch }).await;
}

async fn stream(
    transport: &WsTransport,
    epoch: u64,
    authenticated: bool,
    mut queued: mpsc::UnboundedReceiver<String>,
    sink: &TransportSink,
) -> anyhow::Result<()> {
    let mut request = transport
        .url
        .as_str()
        .into_client_request()
        .context("Failed to build websocket request")?;

    if authenticated {
        let token = transport
            .auth_token
            .as_deref()
            .ok_or_else(|| anyhow!("authenticated connection requires auth_token"))?;
        request
            .headers_mut()
            .insert(AUTHORIZATION, format!("Bearer {}", token).parse::<HeaderValue>()?);
    }

    let (ws, response) = connect_async(request)
        .await
        .context("Failed to connect to upstream")?;
    info!(epoch, status = %response.status(), "Upstream connected");

    sink.deliver(TransportEvent::Opened { epoch }).await?;
    if authenticated {
        // Credentials ride on the handshake; an accepted upgrade means authenticated
        sink.deliver(TransportEvent::Authenticated { epoch }).await?;
    }

    let (mut write, mut read) = ws.split();
    loop {
        tokio::select! {
            outgoing = queued.recv() => match outgoing {
                Some(text) => write.send(Message::Text(text)).await?,
                None => {
                    let _ = write.send(Message::Close(None)).await;
                    return Ok(());
                }
            },
            incoming = read.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    sink.deliver(TransportEvent::Message { epoch, text }).await?;
                }
                Some(Ok(Message::Close(frame))) => {
                    info!(epoch, ?frame, "Upstream closed the connection");
                    return Ok(());
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e.into()),
                None => return Ok(()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use types::ids::MarketId;

    #[test]
    fn test_command_epoch() {
        let send = TransportCommand::Send {
            epoch: 4,
            command: WireCommand::RequestSnapshot {
                market: MarketId::new("btcusd"),
                channel: crate::events::Channel::Depth,
            },
        };
        assert_eq!(send.epoch(), 4);
        assert_eq!(TransportCommand::Close { epoch: 9 }.epoch(), 9);
    }

    #[tokio::test]
    async fn test_unreachable_upstream_reports_closed() {
        let (inbound_tx, mut inbound_rx) = mpsc::channel(8);
        let (command_tx, commands) = mpsc::unbounded_channel();
        let link = TransportLink {
            commands,
            sink: TransportSink::new(inbound_tx),
        };
        let transport = WsTransport::new("ws://127.0.0.1:1/ranger", None);
        let task = tokio::spawn(transport.run(link));

        command_tx
            .send(TransportCommand::Open {
                epoch: 1,
                authenticated: false,
            })
            .unwrap();

        match inbound_rx.recv().await {
            Some(Inbound::Transport(TransportEvent::Closed { epoch })) => assert_eq!(epoch, 1),
            other => panic!("Expected Closed, got {:?}", other),
        }

        drop(command_tx);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_authenticated_without_token_fails() {
        let (inbound_tx, mut inbound_rx) = mpsc::channel(8);
        let (_, queued) = mpsc::unbounded_channel();
        let transport = WsTransport::new("ws://127.0.0.1:1/ranger", None);

        connection_task(transport, 2, true, queued, TransportSink::new(inbound_tx)).await;
        assert!(matches!(
            inbound_rx.recv().await,
            Some(Inbound::Transport(TransportEvent::Closed { epoch: 2 }))
        ));
    }
}
