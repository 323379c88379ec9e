//! Connection lifecycle state machine
//!
//! ```text
//!  Disconnected ──connect──▶ Connecting ──opened──▶ Authenticating ──authenticated──┐
//!       ▲  ▲                     │                        (authenticated only)      │
//!       │  └──backoff retry──────┘ opened (public)                                  ▼
//!       │                        └──────────────────────────────────────────▶ Subscribed ◀─┐
//!       │                                                                        │  gap    │ resynced
//!       └──────────── closed / disconnect (from any state) ──────────────  Degraded ───────┘
//! ```
//!
//! Every physical connection attempt gets a fresh epoch. Transport events and
//! frames carrying any other epoch belong to a superseded connection and are
//! discarded. A manual `disconnect` is terminal until the next `connect`.

use std::collections::BTreeSet;
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use types::ids::MarketId;

use crate::config::BackoffConfig;
use crate::events::Channel;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Authenticating,
    Subscribed,
    /// Connected, but one or more (market, channel) pairs await a resync.
    Degraded,
}

impl ConnectionState {
    /// Frames are applied in these states.
    pub fn accepts_frames(&self) -> bool {
        matches!(
            self,
            ConnectionState::Authenticating | ConnectionState::Subscribed | ConnectionState::Degraded
        )
    }

    /// Wire commands can be sent in these states.
    pub fn is_ready(&self) -> bool {
        matches!(self, ConnectionState::Subscribed | ConnectionState::Degraded)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ConnectOptions {
    pub authenticated: bool,
}

/// Jittered exponential backoff.
#[derive(Debug)]
pub struct Backoff {
    config: BackoffConfig,
    rng: StdRng,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self { config, rng }
    }

    /// Un-jittered delay before retry number `attempt` (0-based).
    pub fn ceiling(&self, attempt: u32) -> Duration {
        let exp = attempt.min(i32::MAX as u32) as i32;
        let raw = self.config.base_ms as f64 * self.config.factor.powi(exp);
        Duration::from_millis(raw.min(self.config.cap_ms as f64) as u64)
    }

    /// Delay before retry number `attempt`, jitter applied after the cap.
    pub fn delay(&mut self, attempt: u32) -> Duration {
        let ceiling = self.ceiling(attempt).as_millis() as f64;
        let jitter = self.config.jitter;
        let factor = if jitter > 0.0 {
            1.0 + self.rng.gen_range(-jitter..=jitter)
        } else {
            1.0
        };
        Duration::from_millis((ceiling * factor).round() as u64)
    }
}

/// Owns the connection state, the epoch counter and the retry schedule.
#[derive(Debug)]
pub struct ReconnectController {
    state: ConnectionState,
    epoch: u64,
    options: ConnectOptions,
    /// Set by `disconnect`, cleared by `connect`.
    manual_stop: bool,
    /// Consecutive failed attempts since the last successful open.
    attempt: u32,
    retry_at: Option<Instant>,
    degraded: BTreeSet<(MarketId, Channel)>,
    backoff: Backoff,
}

impl ReconnectController {
    pub fn new(backoff: BackoffConfig) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            epoch: 0,
            options: ConnectOptions::default(),
            manual_stop: true,
            attempt: 0,
            retry_at: None,
            degraded: BTreeSet::new(),
            backoff: Backoff::new(backoff),
        }
    }

    fn begin_attempt(&mut self) -> u64 {
        self.epoch += 1;
        self.state = ConnectionState::Connecting;
        self.retry_at = None;
        self.epoch
    }

    /// Start connecting. Returns the new epoch, or `None` if a connection is
    /// already in progress or established.
    pub fn connect(&mut self, options: ConnectOptions) -> Option<u64> {
        if self.state != ConnectionState::Disconnected {
            debug!(state = ?self.state, epoch = self.epoch, "Connect ignored, already active");
            return None;
        }
        self.options = options;
        self.manual_stop = false;
        self.attempt = 0;
        let epoch = self.begin_attempt();
        info!(epoch, authenticated = options.authenticated, "Connecting");
        Some(epoch)
    }

    /// Transport opened. Returns the new state when the event is current.
    pub fn on_opened(&mut self, epoch: u64) -> Option<ConnectionState> {
        if epoch != self.epoch || self.state != ConnectionState::Connecting {
            return None;
        }
        self.attempt = 0;
        self.state = if self.options.authenticated {
            ConnectionState::Authenticating
        } else {
            ConnectionState::Subscribed
        };
        info!(epoch, state = ?self.state, "Connection opened");
        Some(self.state)
    }

    /// Authentication confirmed. Returns `true` on the transition out of
    /// `Authenticating`; gaps seen meanwhile land the connection in `Degraded`.
    pub fn on_authenticated(&mut self, epoch: u64) -> bool {
        if epoch != self.epoch || self.state != ConnectionState::Authenticating {
            return false;
        }
        self.state = if self.degraded.is_empty() {
            ConnectionState::Subscribed
        } else {
            ConnectionState::Degraded
        };
        info!(epoch, state = ?self.state, "Connection authenticated");
        true
    }

    /// Transport closed or failed. Returns `Some(retry_at)` when a retry was scheduled.
    ///
    /// Ignored for stale epochs and after a manual disconnect.
    pub fn on_closed(&mut self, epoch: u64, now: Instant) -> Option<Instant> {
        if epoch != self.epoch || self.state == ConnectionState::Disconnected {
            return None;
        }
        self.state = ConnectionState::Disconnected;
        self.degraded.clear();

        let delay = self.backoff.delay(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        let retry_at = now + delay;
        self.retry_at = Some(retry_at);
        warn!(
            epoch,
            attempt = self.attempt,
            delay_ms = delay.as_millis() as u64,
            "Connection lost, retry scheduled"
        );
        Some(retry_at)
    }

    /// Fire a due retry. Returns the new epoch.
    pub fn retry_due(&mut self, now: Instant) -> Option<u64> {
        match self.retry_at {
            Some(at) if at <= now && !self.manual_stop => {
                let epoch = self.begin_attempt();
                info!(epoch, attempt = self.attempt, "Reconnecting");
                Some(epoch)
            }
            _ => None,
        }
    }

    /// Stop and stay stopped until `connect`. Returns the epoch whose
    /// transport should be closed, if one was active.
    pub fn disconnect(&mut self) -> Option<u64> {
        self.manual_stop = true;
        self.retry_at = None;
        self.degraded.clear();
        if self.state == ConnectionState::Disconnected {
            return None;
        }
        self.state = ConnectionState::Disconnected;
        info!(epoch = self.epoch, "Disconnected");
        Some(self.epoch)
    }

    /// Whether a frame from `epoch` may be applied.
    pub fn accepts(&self, epoch: u64) -> bool {
        epoch == self.epoch && self.state.accepts_frames()
    }

    pub fn is_ready(&self) -> bool {
        self.state.is_ready()
    }

    /// Record a gap on (market, channel). Returns `true` if newly degraded.
    pub fn mark_degraded(&mut self, market: &MarketId, channel: Channel) -> bool {
        let inserted = self.degraded.insert((market.clone(), channel));
        if self.state == ConnectionState::Subscribed {
            self.state = ConnectionState::Degraded;
            warn!(%market, %channel, epoch = self.epoch, "Feed degraded");
        }
        inserted
    }

    /// A resync completed for (market, channel).
    pub fn mark_resynced(&mut self, market: &MarketId, channel: Channel) {
        if self.degraded.remove(&(market.clone(), channel))
            && self.degraded.is_empty()
            && self.state == ConnectionState::Degraded
        {
            self.state = ConnectionState::Subscribed;
            info!(epoch = self.epoch, "All markets resynced");
        }
    }

    pub fn is_degraded(&self, market: &MarketId) -> bool {
        self.degraded.iter().any(|(m, _)| m == market)
    }

    /// Channels still waiting on a snapshot.
    pub fn degraded_channels(&self) -> Vec<(MarketId, Channel)> {
        self.degraded.iter().cloned().collect()
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn options(&self) -> ConnectOptions {
        self.options
    }

    pub fn next_retry_at(&self) -> Option<Instant> {
        self.retry_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_jitter() -> BackoffConfig {
        BackoffConfig {
            jitter: 0.0,
            ..BackoffConfig::default()
        }
    }

    #[test]
    fn test_backoff_ceiling_caps() {
        let backoff = Backoff::new(no_jitter());
        assert_eq!(backoff.ceiling(0), Duration::from_secs(1));
        assert_eq!(backoff.ceiling(1), Duration::from_secs(2));
        assert_eq!(backoff.ceiling(4), Duration::from_secs(16));
        assert_eq!(backoff.ceiling(5), Duration::from_secs(30));
        assert_eq!(backoff.ceiling(500), Duration::from_secs(30));
    }

    #[test]
    fn test_backoff_jitter_bounds() {
        let mut backoff = Backoff::new(BackoffConfig {
            seed: Some(42),
            ..BackoffConfig::default()
        });
        for attempt in 0..20 {
            let ceiling = backoff.ceiling(attempt).as_millis() as f64;
            let delay = backoff.delay(attempt).as_millis() as f64;
            assert!(delay >= (ceiling * 0.8).floor(), "{} < 0.8 * {}", delay, ceiling);
            assert!(delay <= (ceiling * 1.2).ceil(), "{} > 1.2 * {}", delay, ceiling);
        }
    }

    #[test]
    fn test_public_connect_lifecycle() {
        let mut ctl = ReconnectController::new(no_jitter());
        assert_eq!(ctl.state(), ConnectionState::Disconnected);

        let epoch = ctl.connect(ConnectOptions::default()).unwrap();
        assert_eq!(epoch, 1);
        assert_eq!(ctl.connect(ConnectOptions::default()), None);
        assert!(!ctl.accepts(epoch));

        assert_eq!(ctl.on_opened(epoch), Some(ConnectionState::Subscribed));
        assert!(ctl.accepts(epoch));
        assert!(!ctl.accepts(epoch + 1));
    }

    #[test]
    fn test_authenticated_connect() {
        let mut ctl = ReconnectController::new(no_jitter());
        let epoch = ctl
            .connect(ConnectOptions {
                authenticated: true,
            })
            .unwrap();

        assert_eq!(ctl.on_opened(epoch), Some(ConnectionState::Authenticating));
        assert!(!ctl.is_ready());
        assert!(ctl.on_authenticated(epoch));
        assert_eq!(ctl.state(), ConnectionState::Subscribed);
        assert!(!ctl.on_authenticated(epoch));
    }

    #[test]
    fn test_gap_while_authenticating_lands_in_degraded() {
        let mut ctl = ReconnectController::new(no_jitter());
        let epoch = ctl
            .connect(ConnectOptions {
                authenticated: true,
            })
            .unwrap();
        ctl.on_opened(epoch);
        let btc = MarketId::new("btcusd");

        assert!(ctl.mark_degraded(&btc, Channel::Trades));
        assert_eq!(ctl.state(), ConnectionState::Authenticating);

        assert!(ctl.on_authenticated(epoch));
        assert_eq!(ctl.state(), ConnectionState::Degraded);
        assert!(ctl.is_ready());

        ctl.mark_resynced(&btc, Channel::Trades);
        assert_eq!(ctl.state(), ConnectionState::Subscribed);
    }

    #[test]
    fn test_close_schedules_backoff_retry() {
        let mut ctl = ReconnectController::new(no_jitter());
        let now = Instant::now();
        let epoch = ctl.connect(ConnectOptions::default()).unwrap();
        ctl.on_opened(epoch);

        let retry_at = ctl.on_closed(epoch, now).unwrap();
        assert_eq!(retry_at, now + Duration::from_secs(1));
        assert_eq!(ctl.state(), ConnectionState::Disconnected);

        assert_eq!(ctl.retry_due(now), None);
        let next = ctl.retry_due(retry_at).unwrap();
        assert_eq!(next, epoch + 1);
        assert_eq!(ctl.state(), ConnectionState::Connecting);

        // Failed attempt: backoff grows
        let retry_at = ctl.on_closed(next, retry_at).unwrap();
        assert_eq!(ctl.next_retry_at(), Some(retry_at));
        let third = ctl.retry_due(retry_at).unwrap();
        assert_eq!(ctl.on_closed(third, retry_at), Some(retry_at + Duration::from_secs(4)));
    }

    #[test]
    fn test_stale_epoch_events_ignored() {
        let mut ctl = ReconnectController::new(no_jitter());
        let now = Instant::now();
        let old = ctl.connect(ConnectOptions::default()).unwrap();
        ctl.on_opened(old);
        ctl.on_closed(old, now);
        let current = ctl.retry_due(now + Duration::from_secs(1)).unwrap();

        assert_eq!(ctl.on_opened(old), None);
        assert_eq!(ctl.on_closed(old, now), None);
        assert_eq!(ctl.state(), ConnectionState::Connecting);
        assert_eq!(ctl.on_opened(current), Some(ConnectionState::Subscribed));
    }

    #[test]
    fn test_manual_disconnect_is_terminal() {
        let mut ctl = ReconnectController::new(no_jitter());
        let now = Instant::now();
        let epoch = ctl.connect(ConnectOptions::default()).unwrap();
        ctl.on_opened(epoch);

        assert_eq!(ctl.disconnect(), Some(epoch));
        assert_eq!(ctl.epoch(), epoch);
        // The transport's close confirmation does not schedule a retry
        assert_eq!(ctl.on_closed(epoch, now), None);
        assert_eq!(ctl.retry_due(now + Duration::from_secs(60)), None);
        assert_eq!(ctl.disconnect(), None);

        assert_eq!(ctl.connect(ConnectOptions::default()), Some(epoch + 1));
    }

    #[test]
    fn test_disconnect_cancels_pending_retry() {
        let mut ctl = ReconnectController::new(no_jitter());
        let now = Instant::now();
        let epoch = ctl.connect(ConnectOptions::default()).unwrap();
        ctl.on_closed(epoch, now);
        assert!(ctl.next_retry_at().is_some());

        assert_eq!(ctl.disconnect(), None);
        assert!(ctl.next_retry_at().is_none());
        assert_eq!(ctl.retry_due(now + Duration::from_secs(60)), None);
    }

    #[test]
    fn test_degraded_round_trip() {
        let mut ctl = ReconnectController::new(no_jitter());
        let epoch = ctl.connect(ConnectOptions::default()).unwrap();
        ctl.on_opened(epoch);
        let btc = MarketId::new("btcusd");
        let eth = MarketId::new("ethbtc");

        assert!(ctl.mark_degraded(&btc, Channel::Depth));
        assert!(ctl.mark_degraded(&eth, Channel::Trades));
        assert!(!ctl.mark_degraded(&btc, Channel::Depth));
        assert_eq!(ctl.state(), ConnectionState::Degraded);
        assert!(ctl.accepts(epoch));

        ctl.mark_resynced(&btc, Channel::Depth);
        assert_eq!(ctl.state(), ConnectionState::Degraded);
        assert!(!ctl.is_degraded(&btc));
        assert_eq!(ctl.degraded_channels(), vec![(eth.clone(), Channel::Trades)]);

        ctl.mark_resynced(&eth, Channel::Trades);
        assert_eq!(ctl.state(), ConnectionState::Subscribed);
    }
}
