//! Per-(market, channel) sequence validation
//!
//! Every inbound frame carries a sequence number scoped to its market and
//! channel. The sequencer classifies each one against the last accepted
//! sequence for that pair:
//! - `Accept`: first frame seen, or exactly `last + 1`
//! - `Duplicate`: `incoming <= last`, dropped without side effects
//! - `Gap`: `incoming > last + 1`, one or more frames were lost
//!
//! A gap never advances the recorded sequence; the caller decides whether
//! to rebase (`reset`) or resync from a snapshot.

use std::collections::BTreeMap;

use tracing::{debug, warn};
use types::ids::MarketId;

use crate::events::{Channel, ResyncRequest};

/// Result of checking one incoming sequence number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SequenceCheck {
    /// In order; the sequence has been recorded.
    Accept,
    /// Already seen; drop the frame.
    Duplicate,
    /// Frames missing between the last accepted and this one.
    Gap(ResyncRequest),
}

/// Tracks the last accepted sequence per (market, channel).
#[derive(Debug, Default)]
pub struct Sequencer {
    last: BTreeMap<(MarketId, Channel), u64>,
}

impl Sequencer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Classify an incoming sequence number.
    pub fn check(&mut self, market: &MarketId, channel: Channel, incoming: u64) -> SequenceCheck {
        let key = (market.clone(), channel);

        match self.last.get(&key).copied() {
            None => {
                self.last.insert(key, incoming);
                debug!(%market, %channel, sequence = incoming, "First sequence recorded");
                SequenceCheck::Accept
            }
            Some(last) if incoming <= last => {
                debug!(
                    %market,
                    %channel,
                    last_sequence = last,
                    received_sequence = incoming,
                    "Dropping duplicate frame"
                );
                SequenceCheck::Duplicate
            }
            Some(last) if incoming == last + 1 => {
                self.last.insert(key, incoming);
                SequenceCheck::Accept
            }
            Some(last) => {
                let request = ResyncRequest {
                    market: market.clone(),
                    channel,
                    expected: last + 1,
                    received: incoming,
                };
                warn!(
                    %market,
                    %channel,
                    expected = request.expected,
                    received = incoming,
                    gap_size = request.gap_size(),
                    "Sequence gap detected"
                );
                SequenceCheck::Gap(request)
            }
        }
    }

    /// Rebase a pair onto a known sequence (after a snapshot or a tolerated gap).
    pub fn reset(&mut self, market: &MarketId, channel: Channel, sequence: u64) {
        self.last.insert((market.clone(), channel), sequence);
    }

    /// Forget a pair; the next frame is treated as the first.
    pub fn clear(&mut self, market: &MarketId, channel: Channel) {
        self.last.remove(&(market.clone(), channel));
    }

    /// Forget every pair (new connection).
    pub fn clear_all(&mut self) {
        self.last.clear();
    }

    /// Last accepted sequence for a pair, if any.
    pub fn last_sequence(&self, market: &MarketId, channel: Channel) -> Option<u64> {
        self.last.get(&(market.clone(), channel)).copied()
    }
}
