//! Async front-end: the worker task and the handles callers hold
//!
//! One tokio task owns the `FeedCore`. Caller commands and transport events
//! share a single bounded inbound queue, so every mutation is serialized in
//! arrival order. Reconnect retries and grace-period evictions are driven
//! by a `sleep_until` on the core's next deadline.
//!
//! Published state goes out through a `watch` channel: readers always see
//! the latest version and may skip intermediate ones under load. Listener
//! callbacks run on their own tasks and never stall the worker.

use std::collections::BTreeSet;
use std::future::pending;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info};
use types::ids::MarketId;
use types::market::MarketTable;

use crate::config::FeedConfig;
use crate::engine::{Command, FeedCore};
use crate::error::FeedError;
use crate::events::Channel;
use crate::metrics::FeedMetrics;
use crate::reconnect::{ConnectOptions, ConnectionState};
use crate::snapshot::{FeedSnapshot, PublishedState};
use crate::transport::{TransportCommand, TransportEvent, TransportLink, TransportSink};

#[derive(Debug)]
pub(crate) struct Request {
    command: Command,
    reply: oneshot::Sender<Result<(), FeedError>>,
}

/// Everything the worker consumes, in one queue.
#[derive(Debug)]
pub(crate) enum Inbound {
    Request(Request),
    Transport(TransportEvent),
}

/// Entry point: builds the core and spawns its worker.
pub struct FeedEngine;

impl FeedEngine {
    /// Spawn the worker on the current tokio runtime.
    ///
    /// Returns the caller handle and the transport's end of the boundary.
    pub fn spawn(config: FeedConfig) -> Result<(FeedHandle, TransportLink), FeedError> {
        config.validate()?;
        let markets = MarketTable::from_markets(config.markets.clone())
            .map_err(|e| FeedError::Config(e.to_string()))?;
        let markets = Arc::new(markets);
        let metrics = Arc::new(FeedMetrics::new());

        let core = FeedCore::new(&config, markets.clone(), metrics.clone());
        let (inbound_tx, inbound_rx) = mpsc::channel(config.inbound_capacity);
        let (transport_tx, transport_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(core.published());

        tokio::spawn(run(core, inbound_rx, transport_tx, state_tx));

        let handle = FeedHandle {
            inbound: inbound_tx.clone(),
            state: state_rx,
            markets,
            metrics,
        };
        let link = TransportLink {
            commands: transport_rx,
            sink: TransportSink::new(inbound_tx),
        };
        Ok((handle, link))
    }
}

fn unix_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

async fn sleep_until_opt(deadline: Option<std::time::Instant>) {
    match deadline {
        Some(at) => sleep_until(Instant::from_std(at)).await,
        None => pending().await,
    }
}

async fn run(
    mut core: FeedCore,
    mut inbound: mpsc::Receiver<Inbound>,
    transport: mpsc::UnboundedSender<TransportCommand>,
    state: watch::Sender<Arc<PublishedState>>,
) {
    info!("Feed worker started");

    loop {
        let deadline = core.next_deadline();
        let mut reply = None;

        tokio::select! {
            message = inbound.recv() => match message {
                Some(Inbound::Request(request)) => {
                    let result = core.execute(request.command, Instant::now().into_std());
                    reply = Some((request.reply, result));
                }
                Some(Inbound::Transport(event)) => {
                    core.on_transport(event, Instant::now().into_std(), unix_millis());
                }
                None => {
                    debug!("All handles dropped");
                    core.shutdown();
                }
            },
            _ = sleep_until_opt(deadline) => {
                core.on_timer(Instant::now().into_std());
            }
        }

        for command in core.take_commands() {
            if transport.send(command).is_err() {
                debug!("Transport gone, command dropped");
            }
        }
        if let Some(published) = core.publish() {
            state.send_replace(published);
        }
        // Reply after publishing so a completed command is visible to readers
        if let Some((reply, result)) = reply {
            let _ = reply.send(result);
        }
        if core.is_shut_down() {
            break;
        }
    }

    info!(version = core.version(), "Feed worker stopped");
}

/// Cloneable caller handle.
#[derive(Debug, Clone)]
pub struct FeedHandle {
    inbound: mpsc::Sender<Inbound>,
    state: watch::Receiver<Arc<PublishedState>>,
    markets: Arc<MarketTable>,
    metrics: Arc<FeedMetrics>,
}

impl FeedHandle {
    async fn request(&self, command: Command) -> Result<(), FeedError> {
        let (reply, response) = oneshot::channel();
        self.inbound
            .send(Inbound::Request(Request { command, reply }))
            .await
            .map_err(|_| FeedError::Shutdown)?;
        response.await.map_err(|_| FeedError::Shutdown)?
    }

    fn validate(&self, market: &MarketId) -> Result<(), FeedError> {
        if self.markets.contains(market) {
            Ok(())
        } else {
            Err(FeedError::InvalidMarket(market.clone()))
        }
    }

    /// Start the connection; no-op while connecting or connected.
    pub async fn connect(&self, options: ConnectOptions) -> Result<(), FeedError> {
        self.request(Command::Connect(options)).await
    }

    pub async fn disconnect(&self) -> Result<(), FeedError> {
        self.request(Command::Disconnect).await
    }

    pub async fn subscribe(
        &self,
        market: &MarketId,
        channels: impl IntoIterator<Item = Channel>,
    ) -> Result<(), FeedError> {
        self.validate(market)?;
        self.request(Command::Subscribe {
            market: market.clone(),
            channels: channels.into_iter().collect::<BTreeSet<_>>(),
        })
        .await
    }

    pub async fn unsubscribe(
        &self,
        market: &MarketId,
        channels: impl IntoIterator<Item = Channel>,
    ) -> Result<(), FeedError> {
        self.validate(market)?;
        self.request(Command::Unsubscribe {
            market: market.clone(),
            channels: channels.into_iter().collect::<BTreeSet<_>>(),
        })
        .await
    }

    pub async fn reset(&self, market: &MarketId) -> Result<(), FeedError> {
        self.validate(market)?;
        self.request(Command::Reset {
            market: market.clone(),
        })
        .await
    }

    /// Close the connection and stop the worker. Later commands fail with
    /// `FeedError::Shutdown`; published state stays readable.
    pub async fn shutdown(&self) -> Result<(), FeedError> {
        self.request(Command::Shutdown).await
    }

    /// Latest published state for a market. Never blocks on the worker.
    pub fn get_snapshot(&self, market: &MarketId) -> FeedSnapshot {
        self.state.borrow().snapshot(market)
    }

    pub fn published(&self) -> Arc<PublishedState> {
        self.state.borrow().clone()
    }

    pub fn version(&self) -> u64 {
        self.state.borrow().version
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.state.borrow().connection_state
    }

    /// Invoke `listener` after each published version bump.
    ///
    /// Runs on its own task; intermediate versions may be coalesced but the
    /// latest is always delivered. Dropping the handle unregisters.
    pub fn on_update<F>(&self, mut listener: F) -> ListenerHandle
    where
        F: FnMut(Arc<PublishedState>) + Send + 'static,
    {
        let mut updates = self.state.clone();
        let _ = updates.borrow_and_update();

        let task = tokio::spawn(async move {
            while updates.changed().await.is_ok() {
                let published = updates.borrow_and_update().clone();
                listener(published);
            }
        });
        ListenerHandle { task }
    }

    /// Raw receiver for callers that prefer to await changes themselves.
    pub fn updates(&self) -> watch::Receiver<Arc<PublishedState>> {
        self.state.clone()
    }

    pub fn metrics(&self) -> Arc<FeedMetrics> {
        self.metrics.clone()
    }

    pub fn markets(&self) -> &MarketTable {
        &self.markets
    }
}

/// Registration returned by `FeedHandle::on_update`.
#[must_use = "dropping the handle unregisters the listener"]
#[derive(Debug)]
pub struct ListenerHandle {
    task: JoinHandle<()>,
}

impl ListenerHandle {
    pub fn unsubscribe(self) {
        drop(self);
    }

    pub fn is_active(&self) -> bool {
        !self.task.is_finished()
    }
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}
