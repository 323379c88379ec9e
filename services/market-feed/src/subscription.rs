//! Desired subscription state
//!
//! Tracks which channels the caller wants for each market. This is
//! process-wide intent, not connection state: it survives reconnects and is
//! replayed in full on every new connection.
//!
//! Dropped channels are not forgotten immediately. Their data stays in the
//! stores for a grace period so a quick resubscribe (a UI re-render, say)
//! finds the previous state intact.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info};
use types::ids::MarketId;
use types::market::MarketTable;

use crate::error::FeedError;
use crate::events::{Channel, WireCommand};

/// Result of a subscribe call.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SubscribeOutcome {
    /// Wire command for channels that were not already wanted.
    pub command: Option<WireCommand>,
    /// Channels revived from the eviction grace period (data retained).
    pub retained: BTreeSet<Channel>,
}

/// Desired-state registry with delayed eviction.
#[derive(Debug)]
pub struct SubscriptionManager {
    markets: Arc<MarketTable>,
    desired: BTreeMap<MarketId, BTreeSet<Channel>>,
    /// (market, channel) → eviction deadline.
    pending_eviction: BTreeMap<(MarketId, Channel), Instant>,
    grace: Duration,
}

impl SubscriptionManager {
    pub fn new(markets: Arc<MarketTable>, grace: Duration) -> Self {
        Self {
            markets,
            desired: BTreeMap::new(),
            pending_eviction: BTreeMap::new(),
            grace,
        }
    }

    fn validate(&self, market: &MarketId) -> Result<(), FeedError> {
        if self.markets.contains(market) {
            Ok(())
        } else {
            Err(FeedError::InvalidMarket(market.clone()))
        }
    }

    /// Merge channels into the desired set (idempotent union).
    pub fn subscribe(
        &mut self,
        market: &MarketId,
        channels: &BTreeSet<Channel>,
    ) -> Result<SubscribeOutcome, FeedError> {
        self.validate(market)?;

        let mut outcome = SubscribeOutcome::default();
        if channels.is_empty() {
            return Ok(outcome);
        }

        let wanted = self.desired.entry(market.clone()).or_default();
        let added: BTreeSet<Channel> = channels.difference(wanted).copied().collect();
        wanted.extend(added.iter().copied());

        for channel in &added {
            if self
                .pending_eviction
                .remove(&(market.clone(), *channel))
                .is_some()
            {
                outcome.retained.insert(*channel);
            }
        }

        if !added.is_empty() {
            info!(%market, channels = ?added, "Subscribed");
            outcome.command = Some(WireCommand::Subscribe {
                market: market.clone(),
                channels: added,
            });
        }

        Ok(outcome)
    }

    /// Remove channels; schedules their data for eviction after the grace period.
    ///
    /// A market whose channel set becomes empty leaves the desired state.
    pub fn unsubscribe(
        &mut self,
        market: &MarketId,
        channels: &BTreeSet<Channel>,
        now: Instant,
    ) -> Result<Option<WireCommand>, FeedError> {
        self.validate(market)?;

        let Some(wanted) = self.desired.get_mut(market) else {
            return Ok(None);
        };

        let removed: BTreeSet<Channel> = wanted.intersection(channels).copied().collect();
        if removed.is_empty() {
            return Ok(None);
        }
        wanted.retain(|c| !removed.contains(c));
        if wanted.is_empty() {
            self.desired.remove(market);
        }

        let deadline = now + self.grace;
        for channel in &removed {
            self.pending_eviction
                .insert((market.clone(), *channel), deadline);
        }

        info!(%market, channels = ?removed, grace_ms = self.grace.as_millis() as u64, "Unsubscribed");
        Ok(Some(WireCommand::Unsubscribe {
            market: market.clone(),
            channels: removed,
        }))
    }

    /// Subscribe commands for the entire desired state (sent on every connect).
    pub fn replay(&self) -> Vec<WireCommand> {
        self.desired
            .iter()
            .map(|(market, channels)| WireCommand::Subscribe {
                market: market.clone(),
                channels: channels.clone(),
            })
            .collect()
    }

    /// Pop every (market, channel) whose grace period has run out.
    pub fn take_expired(&mut self, now: Instant) -> Vec<(MarketId, Channel)> {
        let expired: Vec<(MarketId, Channel)> = self
            .pending_eviction
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(key, _)| key.clone())
            .collect();

        for key in &expired {
            self.pending_eviction.remove(key);
            debug!(market = %key.0, channel = %key.1, "Grace period expired");
        }
        expired
    }

    /// Earliest pending eviction deadline.
    pub fn next_eviction(&self) -> Option<Instant> {
        self.pending_eviction.values().min().copied()
    }

    pub fn is_subscribed(&self, market: &MarketId, channel: Channel) -> bool {
        self.desired
            .get(market)
            .is_some_and(|channels| channels.contains(&channel))
    }

    /// Whether a channel's data is still held (subscribed or in grace).
    pub fn is_retained(&self, market: &MarketId, channel: Channel) -> bool {
        self.is_subscribed(market, channel)
            || self
                .pending_eviction
                .contains_key(&(market.clone(), channel))
    }

    pub fn channels(&self, market: &MarketId) -> BTreeSet<Channel> {
        self.desired.get(market).cloned().unwrap_or_default()
    }

    /// The full desired state.
    pub fn desired(&self) -> &BTreeMap<MarketId, BTreeSet<Channel>> {
        &self.desired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use types::market::Market;

    fn manager() -> SubscriptionManager {
        let table = MarketTable::from_markets(vec![
            Market::new(MarketId::new("btcusd"), "btc", "usd", 2, 6),
            Market::new(MarketId::new("ethbtc"), "eth", "btc", 6, 4),
        ])
        .unwrap();
        SubscriptionManager::new(Arc::new(table), Duration::from_secs(30))
    }

    fn set(channels: &[Channel]) -> BTreeSet<Channel> {
        channels.iter().copied().collect()
    }

    #[test]
    fn test_subscribe_unknown_market() {
        let mut subs = manager();
        let err = subs
            .subscribe(&MarketId::new("xrpusd"), &set(&[Channel::Depth]))
            .unwrap_err();
        assert_eq!(err, FeedError::InvalidMarket(MarketId::new("xrpusd")));
        assert!(subs.desired().is_empty());
    }

    #[test]
    fn test_subscribe_is_idempotent_union() {
        let mut subs = manager();
        let m = MarketId::new("btcusd");

        let first = subs.subscribe(&m, &set(&[Channel::Depth])).unwrap();
        assert_eq!(
            first.command,
            Some(WireCommand::Subscribe {
                market: m.clone(),
                channels: set(&[Channel::Depth]),
            })
        );

        let again = subs.subscribe(&m, &set(&[Channel::Depth])).unwrap();
        assert!(again.command.is_none());

        let more = subs
            .subscribe(&m, &set(&[Channel::Depth, Channel::Trades]))
            .unwrap();
        assert_eq!(
            more.command,
            Some(WireCommand::Subscribe {
                market: m.clone(),
                channels: set(&[Channel::Trades]),
            })
        );
        assert_eq!(subs.channels(&m), set(&[Channel::Depth, Channel::Trades]));
    }

    #[test]
    fn test_unsubscribe_last_channel_drops_market() {
        let mut subs = manager();
        let m = MarketId::new("btcusd");
        let now = Instant::now();

        subs.subscribe(&m, &set(&[Channel::Depth, Channel::Ticker])).unwrap();
        subs.unsubscribe(&m, &set(&[Channel::Depth]), now).unwrap();
        assert!(subs.desired().contains_key(&m));

        let cmd = subs.unsubscribe(&m, &set(&[Channel::Ticker]), now).unwrap();
        assert!(cmd.is_some());
        assert!(!subs.desired().contains_key(&m));
        assert!(subs.is_retained(&m, Channel::Ticker));

        // Nothing left to remove
        assert!(subs.unsubscribe(&m, &set(&[Channel::Ticker]), now).unwrap().is_none());
    }

    #[test]
    fn test_resubscribe_within_grace_retains() {
        let mut subs = manager();
        let m = MarketId::new("btcusd");
        let now = Instant::now();

        subs.subscribe(&m, &set(&[Channel::Depth])).unwrap();
        subs.unsubscribe(&m, &set(&[Channel::Depth]), now).unwrap();

        let outcome = subs.subscribe(&m, &set(&[Channel::Depth])).unwrap();
        assert_eq!(outcome.retained, set(&[Channel::Depth]));
        assert!(subs.next_eviction().is_none());
        assert!(subs.take_expired(now + Duration::from_secs(60)).is_empty());
    }

    #[test]
    fn test_grace_expiry() {
        let mut subs = manager();
        let m = MarketId::new("btcusd");
        let now = Instant::now();

        subs.subscribe(&m, &set(&[Channel::Depth])).unwrap();
        subs.unsubscribe(&m, &set(&[Channel::Depth]), now).unwrap();
        assert_eq!(subs.next_eviction(), Some(now + Duration::from_secs(30)));

        assert!(subs.take_expired(now + Duration::from_secs(29)).is_empty());
        let expired = subs.take_expired(now + Duration::from_secs(30));
        assert_eq!(expired, vec![(m.clone(), Channel::Depth)]);
        assert!(!subs.is_retained(&m, Channel::Depth));

        let outcome = subs.subscribe(&m, &set(&[Channel::Depth])).unwrap();
        assert!(outcome.retained.is_empty());
    }

    #[test]
    fn test_replay_covers_desired_state() {
        let mut subs = manager();
        subs.subscribe(&MarketId::new("btcusd"), &set(&[Channel::Depth]))
            .unwrap();
        subs.subscribe(
            &MarketId::new("ethbtc"),
            &set(&[Channel::Trades, Channel::Ticker]),
        )
        .unwrap();

        let replay = subs.replay();
        assert_eq!(replay.len(), 2);
        assert_eq!(
            replay[1],
            WireCommand::Subscribe {
                market: MarketId::new("ethbtc"),
                channels: set(&[Channel::Trades, Channel::Ticker]),
            }
        );
    }
}
