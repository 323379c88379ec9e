//! Feed engine core
//!
//! `FeedCore` is the single owner of every store, the sequencer, the
//! subscription state and the connection controller. It performs no I/O and
//! never blocks: callers hand it commands, transport events and timer ticks,
//! then drain the queued `TransportCommand`s and publish.
//!
//! Frame routing:
//!
//! ```text
//! raw text ─▶ epoch check ─▶ parse ─▶ subscribed? ─▶ Sequencer ─┬─▶ DepthStore
//!                                                               ├─▶ TradeTape
//!                                                               └─▶ TickerCache
//! ```

use std::collections::BTreeSet;
use std::mem;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, warn};
use types::ids::MarketId;
use types::market::MarketTable;

use crate::config::FeedConfig;
use crate::depth::{BufferOutcome, BufferedDiff, DepthSnapshot, DepthStore, PriceLevel};
use crate::error::FeedError;
use crate::events::{Channel, FeedFrame, FramePayload, ResyncRequest, TickerPayload, WireCommand};
use crate::metrics::FeedMetrics;
use crate::reconnect::{ConnectOptions, ConnectionState, ReconnectController};
use crate::sequencer::{SequenceCheck, Sequencer};
use crate::snapshot::{compute_checksum, FeedSnapshot, MarketView, PublishedState};
use crate::subscription::SubscriptionManager;
use crate::ticker::{Ticker, TickerCache, TickerUpdate};
use crate::trades::{Trade, TradeTape};
use crate::transport::{TransportCommand, TransportEvent};

/// Caller commands, executed in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Connect(ConnectOptions),
    Disconnect,
    Subscribe {
        market: MarketId,
        channels: BTreeSet<Channel>,
    },
    Unsubscribe {
        market: MarketId,
        channels: BTreeSet<Channel>,
    },
    Reset {
        market: MarketId,
    },
    Shutdown,
}

/// Why a frame had no effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Belongs to a superseded connection.
    StaleEpoch,
    /// Current epoch, but the connection is not open yet.
    NotConnected,
    Malformed,
    /// Channel not in the desired subscription state.
    Unsubscribed,
    Duplicate,
    /// The diff buffer overflowed; parked diffs were discarded.
    BufferOverflow,
}

/// What ingesting one frame did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    Applied,
    /// Depth diff parked until the next snapshot.
    Buffered,
    /// Sequence gap; a resync was started. The frame's own data may still
    /// have been applied (trades, ticker).
    Gap,
    Dropped(DropReason),
}

pub struct FeedCore {
    markets: Arc<MarketTable>,
    sequencer: Sequencer,
    depth: DepthStore,
    trades: TradeTape,
    tickers: TickerCache,
    subscriptions: SubscriptionManager,
    controller: ReconnectController,
    metrics: Arc<FeedMetrics>,
    outbox: Vec<TransportCommand>,
    version: u64,
    dirty: BTreeSet<MarketId>,
    state_changed: bool,
    shut_down: bool,
    published: Arc<PublishedState>,
}

impl FeedCore {
    pub fn new(config: &FeedConfig, markets: Arc<MarketTable>, metrics: Arc<FeedMetrics>) -> Self {
        info!(
            markets = markets.len(),
            trade_capacity = config.trade_capacity,
            diff_buffer_capacity = config.diff_buffer_capacity,
            eviction_grace_ms = config.eviction_grace_ms,
            "FeedCore initialized"
        );

        Self {
            subscriptions: SubscriptionManager::new(markets.clone(), config.eviction_grace()),
            markets,
            sequencer: Sequencer::new(),
            depth: DepthStore::new(config.diff_buffer_capacity),
            trades: TradeTape::new(config.trade_capacity),
            tickers: TickerCache::new(),
            controller: ReconnectController::new(config.backoff.clone()),
            metrics,
            outbox: Vec::new(),
            version: 0,
            dirty: BTreeSet::new(),
            state_changed: false,
            shut_down: false,
            published: Arc::new(PublishedState::initial()),
        }
    }

    // ---------------------------------------------------------------------
    // Commands
    // ---------------------------------------------------------------------

    pub fn execute(&mut self, command: Command, now: Instant) -> Result<(), FeedError> {
        if self.shut_down {
            return Err(FeedError::Shutdown);
        }
        match command {
            Command::Connect(options) => {
                self.connect(options);
                Ok(())
            }
            Command::Disconnect => {
                self.disconnect();
                Ok(())
            }
            Command::Subscribe { market, channels } => self.subscribe(&market, &channels),
            Command::Unsubscribe { market, channels } => {
                self.unsubscribe(&market, &channels, now)
            }
            Command::Reset { market } => self.reset(&market),
            Command::Shutdown => {
                self.shutdown();
                Ok(())
            }
        }
    }

    /// Idempotent while connecting or connected.
    pub fn connect(&mut self, options: ConnectOptions) {
        if let Some(epoch) = self.controller.connect(options) {
            self.outbox.push(TransportCommand::Open {
                epoch,
                authenticated: options.authenticated,
            });
            self.state_changed = true;
        }
    }

    /// Tear down the connection. Stored values stay readable, flagged stale.
    pub fn disconnect(&mut self) {
        if let Some(epoch) = self.controller.disconnect() {
            self.outbox.push(TransportCommand::Close { epoch });
            self.connection_lost();
            self.state_changed = true;
        }
    }

    pub fn shutdown(&mut self) {
        self.disconnect();
        self.shut_down = true;
        info!("Feed engine shutting down");
    }

    pub fn subscribe(
        &mut self,
        market: &MarketId,
        channels: &BTreeSet<Channel>,
    ) -> Result<(), FeedError> {
        let outcome = self.subscriptions.subscribe(market, channels)?;

        if channels.contains(&Channel::Depth) {
            self.depth.track(market);
        }
        if !outcome.retained.is_empty() {
            info!(%market, channels = ?outcome.retained, "Resubscribed within grace period, data retained");
        }
        let changed = outcome.command.is_some() || !outcome.retained.is_empty();
        if let Some(command) = outcome.command {
            self.send(command);
        }
        if changed {
            self.dirty.insert(market.clone());
        }
        Ok(())
    }

    pub fn unsubscribe(
        &mut self,
        market: &MarketId,
        channels: &BTreeSet<Channel>,
        now: Instant,
    ) -> Result<(), FeedError> {
        let Some(command) = self.subscriptions.unsubscribe(market, channels, now)? else {
            return Ok(());
        };

        if let WireCommand::Unsubscribe { channels, .. } = &command {
            for channel in channels {
                self.controller.mark_resynced(market, *channel);
            }
        }
        self.send(command);
        self.dirty.insert(market.clone());
        self.state_changed = true;
        Ok(())
    }

    /// Drop all local state for a market and request fresh snapshots.
    pub fn reset(&mut self, market: &MarketId) -> Result<(), FeedError> {
        if !self.markets.contains(market) {
            return Err(FeedError::InvalidMarket(market.clone()));
        }

        self.depth.clear(market);
        self.trades.remove(market);
        self.tickers.remove(market);
        for channel in Channel::ALL {
            self.sequencer.clear(market, channel);
            self.controller.mark_resynced(market, channel);
        }
        info!(%market, "Market reset");

        for channel in self.subscriptions.channels(market) {
            self.request_snapshot(market, channel);
        }
        self.dirty.insert(market.clone());
        self.state_changed = true;
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Transport
    // ---------------------------------------------------------------------

    pub fn on_transport(&mut self, event: TransportEvent, now: Instant, received_at_ms: i64) {
        match event {
            TransportEvent::Opened { epoch } => {
                if let Some(state) = self.controller.on_opened(epoch) {
                    self.state_changed = true;
                    if state == ConnectionState::Subscribed {
                        self.replay_subscriptions();
                    }
                } else {
                    debug!(epoch, "Ignoring open for superseded epoch");
                }
            }
            TransportEvent::Authenticated { epoch } => {
                if self.controller.on_authenticated(epoch) {
                    self.state_changed = true;
                    self.replay_subscriptions();
                    // Gaps seen before auth could not request snapshots yet
                    for (market, channel) in self.controller.degraded_channels() {
                        self.request_snapshot(&market, channel);
                    }
                }
            }
            TransportEvent::Message { epoch, text } => {
                self.ingest(epoch, &text, received_at_ms);
            }
            TransportEvent::Closed { epoch } => {
                if self.controller.on_closed(epoch, now).is_some() {
                    self.connection_lost();
                    self.state_changed = true;
                } else {
                    debug!(epoch, "Ignoring close for superseded epoch");
                }
            }
        }
    }

    /// Every connection loss invalidates sequencing; books keep their levels
    /// but wait for a fresh snapshot.
    fn connection_lost(&mut self) {
        self.sequencer.clear_all();
        self.depth.mark_all_stale();
        self.mark_all_dirty();
    }

    fn replay_subscriptions(&mut self) {
        let commands = self.subscriptions.replay();
        info!(
            epoch = self.controller.epoch(),
            markets = commands.len(),
            "Replaying subscriptions"
        );
        for command in commands {
            self.send(command);
        }
    }

    /// Queue a wire command. Returns `false` if the connection is not ready.
    fn send(&mut self, command: WireCommand) -> bool {
        if !self.controller.is_ready() {
            debug!(market = %command.market(), "Connection not ready, command not sent");
            return false;
        }
        self.outbox.push(TransportCommand::Send {
            epoch: self.controller.epoch(),
            command,
        });
        true
    }

    fn request_snapshot(&mut self, market: &MarketId, channel: Channel) {
        let sent = self.send(WireCommand::RequestSnapshot {
            market: market.clone(),
            channel,
        });
        if sent {
            self.metrics.record_resync_request();
            info!(%market, %channel, "Requesting snapshot");
        }
    }

    fn begin_resync(&mut self, gap: ResyncRequest) {
        warn!(
            market = %gap.market,
            channel = %gap.channel,
            expected = gap.expected,
            received = gap.received,
            missing = gap.gap_size(),
            "Sequence gap, resyncing"
        );
        self.metrics.record_gap();
        self.controller.mark_degraded(&gap.market, gap.channel);
        self.state_changed = true;
        self.request_snapshot(&gap.market, gap.channel);
    }

    // ---------------------------------------------------------------------
    // Ingestion
    // ---------------------------------------------------------------------

    /// Apply one raw frame received on connection `epoch`.
    pub fn ingest(&mut self, epoch: u64, raw: &str, received_at_ms: i64) -> IngestOutcome {
        let started = Instant::now();

        if epoch != self.controller.epoch() {
            self.metrics.record_stale_epoch();
            debug!(epoch, current = self.controller.epoch(), "Frame from stale epoch dropped");
            return IngestOutcome::Dropped(DropReason::StaleEpoch);
        }
        if !self.controller.accepts(epoch) {
            debug!(epoch, state = ?self.controller.state(), "Frame before open dropped");
            return IngestOutcome::Dropped(DropReason::NotConnected);
        }

        let frame = match FeedFrame::parse(raw) {
            Ok(frame) => frame,
            Err(e) => {
                self.metrics.record_malformed();
                warn!(epoch, error = %e, "Malformed frame dropped");
                return IngestOutcome::Dropped(DropReason::Malformed);
            }
        };

        if !self.subscriptions.is_subscribed(&frame.market, frame.channel) {
            debug!(market = %frame.market, channel = %frame.channel, "Frame for unsubscribed channel dropped");
            return IngestOutcome::Dropped(DropReason::Unsubscribed);
        }

        debug!(
            market = %frame.market,
            channel = %frame.channel,
            sequence = frame.sequence,
            event = frame.event_type_label(),
            "Frame received"
        );

        let FeedFrame {
            market,
            sequence,
            payload,
            ..
        } = frame;

        let outcome = match payload {
            FramePayload::DepthSnapshot {
                bids,
                asks,
                timestamp,
            } => self.on_depth_snapshot(
                &market,
                sequence,
                bids,
                asks,
                timestamp.unwrap_or(received_at_ms),
            ),
            FramePayload::DepthUpdate { changes, timestamp } => self.on_depth_update(
                &market,
                BufferedDiff {
                    sequence,
                    changes,
                    timestamp: timestamp.unwrap_or(received_at_ms),
                },
            ),
            FramePayload::TradesSnapshot(trades) => self.on_trades_snapshot(&market, sequence, trades),
            FramePayload::Trade(trade) => self.on_trade(&market, sequence, trade),
            FramePayload::Ticker(payload) => {
                self.on_ticker(&market, sequence, payload, received_at_ms)
            }
        };

        self.metrics
            .record_ingested(started.elapsed().as_nanos() as u64);
        outcome
    }

    fn on_depth_snapshot(
        &mut self,
        market: &MarketId,
        sequence: u64,
        bids: Vec<PriceLevel>,
        asks: Vec<PriceLevel>,
        last_updated: i64,
    ) -> IngestOutcome {
        let replay = self.depth.apply_snapshot(DepthSnapshot {
            market: market.clone(),
            bids,
            asks,
            sequence,
            last_updated,
        });
        self.sequencer.reset(market, Channel::Depth, sequence);
        self.dirty.insert(market.clone());

        let mut pending = replay.into_iter();
        while let Some(diff) = pending.next() {
            match self.sequencer.check(market, Channel::Depth, diff.sequence) {
                SequenceCheck::Accept => {
                    self.depth
                        .apply_changes(market, &diff.changes, diff.sequence, diff.timestamp);
                }
                SequenceCheck::Duplicate => self.metrics.record_duplicate(),
                SequenceCheck::Gap(gap) => {
                    // The snapshot does not bridge the parked diffs; keep them
                    // for the next one.
                    self.depth.mark_stale(market);
                    for parked in std::iter::once(diff).chain(pending.by_ref()) {
                        self.park_diff(market, parked);
                    }
                    self.begin_resync(gap);
                    return IngestOutcome::Gap;
                }
            }
        }

        self.controller.mark_resynced(market, Channel::Depth);
        self.state_changed = true;
        IngestOutcome::Applied
    }

    fn on_depth_update(&mut self, market: &MarketId, diff: BufferedDiff) -> IngestOutcome {
        if !self.depth.is_live(market) {
            return self.park_diff(market, diff);
        }

        match self.sequencer.check(market, Channel::Depth, diff.sequence) {
            SequenceCheck::Accept => {
                self.depth
                    .apply_changes(market, &diff.changes, diff.sequence, diff.timestamp);
                self.dirty.insert(market.clone());
                IngestOutcome::Applied
            }
            SequenceCheck::Duplicate => {
                self.metrics.record_duplicate();
                IngestOutcome::Dropped(DropReason::Duplicate)
            }
            SequenceCheck::Gap(gap) => {
                self.depth.mark_stale(market);
                self.park_diff(market, diff);
                self.begin_resync(gap);
                self.dirty.insert(market.clone());
                IngestOutcome::Gap
            }
        }
    }

    fn park_diff(&mut self, market: &MarketId, diff: BufferedDiff) -> IngestOutcome {
        match self.depth.buffer_diff(market, diff) {
            BufferOutcome::Buffered => IngestOutcome::Buffered,
            BufferOutcome::Overflow { dropped } => {
                self.metrics.record_buffer_overflow();
                warn!(%market, dropped, "Forcing depth resync after buffer overflow");
                self.controller.mark_degraded(market, Channel::Depth);
                self.state_changed = true;
                self.request_snapshot(market, Channel::Depth);
                IngestOutcome::Dropped(DropReason::BufferOverflow)
            }
        }
    }

    fn on_trades_snapshot(
        &mut self,
        market: &MarketId,
        sequence: u64,
        trades: Vec<Trade>,
    ) -> IngestOutcome {
        info!(%market, sequence, trades = trades.len(), "Trades snapshot applied");
        self.trades.replace(market, trades);
        self.sequencer.reset(market, Channel::Trades, sequence);
        self.controller.mark_resynced(market, Channel::Trades);
        self.dirty.insert(market.clone());
        self.state_changed = true;
        IngestOutcome::Applied
    }

    fn on_trade(&mut self, market: &MarketId, sequence: u64, trade: Trade) -> IngestOutcome {
        match self.sequencer.check(market, Channel::Trades, sequence) {
            SequenceCheck::Accept => {
                self.trades.push(market, trade);
                self.dirty.insert(market.clone());
                IngestOutcome::Applied
            }
            SequenceCheck::Duplicate => {
                self.metrics.record_duplicate();
                IngestOutcome::Dropped(DropReason::Duplicate)
            }
            SequenceCheck::Gap(gap) => {
                // A print is real even if earlier ones were lost
                self.trades.push(market, trade);
                self.sequencer.reset(market, Channel::Trades, sequence);
                self.begin_resync(gap);
                self.dirty.insert(market.clone());
                IngestOutcome::Gap
            }
        }
    }

    fn on_ticker(
        &mut self,
        market: &MarketId,
        sequence: u64,
        payload: TickerPayload,
        received_at_ms: i64,
    ) -> IngestOutcome {
        let first = self
            .sequencer
            .last_sequence(market, Channel::Ticker)
            .is_none();
        let ticker = Ticker {
            last: payload.last,
            high: payload.high,
            low: payload.low,
            volume: payload.volume,
            sequence,
            timestamp: payload.timestamp.unwrap_or(received_at_ms),
        };

        match self.sequencer.check(market, Channel::Ticker, sequence) {
            SequenceCheck::Duplicate => {
                self.metrics.record_duplicate();
                return IngestOutcome::Dropped(DropReason::Duplicate);
            }
            SequenceCheck::Gap(gap) => {
                // Tickers are whole records; a gap loses nothing worth a resync
                self.metrics.record_gap();
                debug!(%market, missing = gap.gap_size(), "Ticker gap tolerated");
                self.sequencer.reset(market, Channel::Ticker, sequence);
            }
            SequenceCheck::Accept => {}
        }

        if first {
            self.tickers.replace(market, ticker);
        } else if self.tickers.update(market, ticker) == TickerUpdate::Duplicate {
            self.metrics.record_duplicate();
            return IngestOutcome::Dropped(DropReason::Duplicate);
        }
        self.dirty.insert(market.clone());
        IngestOutcome::Applied
    }

    // ---------------------------------------------------------------------
    // Timers
    // ---------------------------------------------------------------------

    /// Fire due reconnect retries and grace-period evictions.
    pub fn on_timer(&mut self, now: Instant) {
        if let Some(epoch) = self.controller.retry_due(now) {
            self.metrics.record_reconnect_attempt();
            self.outbox.push(TransportCommand::Open {
                epoch,
                authenticated: self.controller.options().authenticated,
            });
            self.state_changed = true;
        }

        for (market, channel) in self.subscriptions.take_expired(now) {
            self.evict(&market, channel);
        }
    }

    fn evict(&mut self, market: &MarketId, channel: Channel) {
        match channel {
            Channel::Depth => {
                self.depth.remove(market);
            }
            Channel::Trades => {
                self.trades.remove(market);
            }
            Channel::Ticker => {
                self.tickers.remove(market);
            }
        }
        self.sequencer.clear(market, channel);
        self.controller.mark_resynced(market, channel);
        self.metrics.record_eviction();
        info!(%market, %channel, "Evicted after grace period");
        self.dirty.insert(market.clone());
    }

    /// Earliest instant `on_timer` has work to do.
    pub fn next_deadline(&self) -> Option<Instant> {
        match (
            self.controller.next_retry_at(),
            self.subscriptions.next_eviction(),
        ) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    // ---------------------------------------------------------------------
    // Output
    // ---------------------------------------------------------------------

    /// Drain queued transport commands.
    pub fn take_commands(&mut self) -> Vec<TransportCommand> {
        mem::take(&mut self.outbox)
    }

    fn mark_all_dirty(&mut self) {
        let tracked: Vec<MarketId> = self
            .subscriptions
            .desired()
            .keys()
            .chain(self.published.markets.keys())
            .cloned()
            .collect();
        self.dirty.extend(tracked);
    }

    fn is_retained(&self, market: &MarketId) -> bool {
        Channel::ALL
            .iter()
            .any(|channel| self.subscriptions.is_retained(market, *channel))
    }

    fn is_resyncing(&self, market: &MarketId) -> bool {
        self.controller.is_degraded(market)
            || (self.subscriptions.is_subscribed(market, Channel::Depth)
                && !self.depth.is_live(market))
    }

    fn build_view(&self, market: &MarketId) -> MarketView {
        let depth = self
            .depth
            .snapshot(market)
            .unwrap_or_else(|| DepthSnapshot::empty(market.clone()));
        let checksum = compute_checksum(&depth);

        MarketView {
            book_status: self.depth.status(market),
            trades: self.trades.snapshot(market),
            ticker: self.tickers.snapshot(market),
            channels: self.subscriptions.channels(market),
            resyncing: self.is_resyncing(market),
            depth,
            checksum,
        }
    }

    /// Publish a new version if anything changed since the last one.
    pub fn publish(&mut self) -> Option<Arc<PublishedState>> {
        if self.dirty.is_empty() && !self.state_changed {
            return None;
        }
        if self.state_changed {
            // Degraded marks and connection state feed every market's stale flag
            self.mark_all_dirty();
        }

        let mut markets = self.published.markets.clone();
        for market in mem::take(&mut self.dirty) {
            if self.is_retained(&market) {
                markets.insert(market.clone(), Arc::new(self.build_view(&market)));
            } else {
                markets.remove(&market);
            }
        }

        self.version += 1;
        self.state_changed = false;
        self.published = Arc::new(PublishedState {
            version: self.version,
            connection_state: self.controller.state(),
            epoch: self.controller.epoch(),
            markets,
        });
        self.metrics.record_published();
        debug!(version = self.version, "Published");

        Some(self.published.clone())
    }

    pub fn published(&self) -> Arc<PublishedState> {
        self.published.clone()
    }

    /// Last published snapshot for a market.
    pub fn snapshot(&self, market: &MarketId) -> FeedSnapshot {
        self.published.snapshot(market)
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.controller.state()
    }

    pub fn epoch(&self) -> u64 {
        self.controller.epoch()
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down
    }

    pub fn metrics(&self) -> &Arc<FeedMetrics> {
        &self.metrics
    }

    pub fn markets(&self) -> &Arc<MarketTable> {
        &self.markets
    }
}
