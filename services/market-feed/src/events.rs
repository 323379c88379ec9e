//! Wire frames exchanged with the upstream market-data feed
//!
//! Inbound frames are JSON objects shaped as
//! `{market, channel, event, sequence, payload}`. Each (channel, event)
//! pair maps to one `FramePayload` variant; any other combination is a
//! malformed frame.
//!
//! Outbound frames are subscription commands addressed by ranger stream
//! names (`"btcusd.depth"`).

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::json;
use types::ids::MarketId;
use types::numeric::{Price, Quantity};
use types::order::Side;

use crate::depth::{LevelChange, PriceLevel};
use crate::trades::Trade;

/// A feed channel. Sequence numbers are scoped per (market, channel).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    /// Order book depth: snapshots and level diffs
    Depth,
    /// Public trade prints
    Trades,
    /// Last price / 24h statistics
    Ticker,
}

impl Channel {
    pub const ALL: [Channel; 3] = [Channel::Depth, Channel::Trades, Channel::Ticker];

    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Depth => "depth",
            Channel::Trades => "trades",
            Channel::Ticker => "ticker",
        }
    }

    /// Ranger stream name for a market, e.g. `btcusd.depth`
    pub fn stream_name(&self, market: &MarketId) -> String {
        format!("{}.{}", market, self.as_str())
    }

    /// Split a stream name back into (market, channel).
    pub fn parse_stream(stream: &str) -> Result<(MarketId, Channel), ParseError> {
        let invalid = || ParseError::InvalidStream(stream.to_string());
        let (market, channel) = stream.split_once('.').ok_or_else(invalid)?;
        let market = MarketId::try_new(market).map_err(|_| invalid())?;
        Ok((market, channel.parse()?))
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Channel {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "depth" => Ok(Channel::Depth),
            "trades" => Ok(Channel::Trades),
            "ticker" => Ok(Channel::Ticker),
            other => Err(ParseError::UnknownChannel(other.to_string())),
        }
    }
}

/// Errors raised while decoding an inbound frame.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("malformed frame: {0}")]
    Json(String),

    #[error("unknown channel: {0}")]
    UnknownChannel(String),

    #[error("invalid stream name: {0}")]
    InvalidStream(String),

    #[error("event {event} is not valid on channel {channel}")]
    UnexpectedEvent { channel: Channel, event: String },

    #[error("invalid {channel} payload: {reason}")]
    InvalidPayload { channel: Channel, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
enum FrameEvent {
    Snapshot,
    Update,
    Trade,
    Ticker,
}

impl FrameEvent {
    fn as_str(&self) -> &'static str {
        match self {
            FrameEvent::Snapshot => "snapshot",
            FrameEvent::Update => "update",
            FrameEvent::Trade => "trade",
            FrameEvent::Ticker => "ticker",
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawFrame {
    market: MarketId,
    channel: Channel,
    event: FrameEvent,
    sequence: u64,
    #[serde(default)]
    payload: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct LevelsPayload {
    #[serde(default)]
    bids: Vec<(Price, Quantity)>,
    #[serde(default)]
    asks: Vec<(Price, Quantity)>,
    #[serde(default)]
    timestamp: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct TradesPayload {
    trades: Vec<Trade>,
}

/// Ticker fields as delivered on the wire (sequence comes from the frame).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TickerPayload {
    pub last: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub volume: Decimal,
    #[serde(default)]
    pub timestamp: Option<i64>,
}

/// Decoded payload, one variant per valid (channel, event) pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FramePayload {
    DepthSnapshot {
        bids: Vec<PriceLevel>,
        asks: Vec<PriceLevel>,
        timestamp: Option<i64>,
    },
    DepthUpdate {
        changes: Vec<LevelChange>,
        timestamp: Option<i64>,
    },
    TradesSnapshot(Vec<Trade>),
    Trade(Trade),
    Ticker(TickerPayload),
}

/// A validated inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedFrame {
    pub market: MarketId,
    pub channel: Channel,
    pub sequence: u64,
    pub payload: FramePayload,
}

impl FeedFrame {
    /// Decode a raw text frame.
    pub fn parse(raw: &str) -> Result<Self, ParseError> {
        let frame: RawFrame =
            serde_json::from_str(raw).map_err(|e| ParseError::Json(e.to_string()))?;
        let channel = frame.channel;
        let invalid = |e: serde_json::Error| ParseError::InvalidPayload {
            channel,
            reason: e.to_string(),
        };

        let payload = match (channel, frame.event) {
            (Channel::Depth, FrameEvent::Snapshot) => {
                let levels: LevelsPayload =
                    serde_json::from_value(frame.payload).map_err(invalid)?;
                FramePayload::DepthSnapshot {
                    bids: to_levels(levels.bids),
                    asks: to_levels(levels.asks),
                    timestamp: levels.timestamp,
                }
            }
            (Channel::Depth, FrameEvent::Update) => {
                let levels: LevelsPayload =
                    serde_json::from_value(frame.payload).map_err(invalid)?;
                let mut changes = Vec::with_capacity(levels.bids.len() + levels.asks.len());
                for (side, entries) in [(Side::Bid, levels.bids), (Side::Ask, levels.asks)] {
                    changes.extend(entries.into_iter().map(|(price, amount)| LevelChange {
                        side,
                        price,
                        amount,
                    }));
                }
                if changes.is_empty() {
                    return Err(ParseError::InvalidPayload {
                        channel,
                        reason: "update carries no level changes".to_string(),
                    });
                }
                FramePayload::DepthUpdate {
                    changes,
                    timestamp: levels.timestamp,
                }
            }
            (Channel::Trades, FrameEvent::Snapshot) => {
                let trades: TradesPayload =
                    serde_json::from_value(frame.payload).map_err(invalid)?;
                FramePayload::TradesSnapshot(trades.trades)
            }
            (Channel::Trades, FrameEvent::Trade) => {
                FramePayload::Trade(serde_json::from_value(frame.payload).map_err(invalid)?)
            }
            (Channel::Ticker, FrameEvent::Ticker) => {
                FramePayload::Ticker(serde_json::from_value(frame.payload).map_err(invalid)?)
            }
            (channel, event) => {
                return Err(ParseError::UnexpectedEvent {
                    channel,
                    event: event.as_str().to_string(),
                })
            }
        };

        Ok(Self {
            market: frame.market,
            channel,
            sequence: frame.sequence,
            payload,
        })
    }

    /// Get the event type as a string label for logging.
    pub fn event_type_label(&self) -> &'static str {
        match &self.payload {
            FramePayload::DepthSnapshot { .. } => "DepthSnapshot",
            FramePayload::DepthUpdate { .. } => "DepthUpdate",
            FramePayload::TradesSnapshot(_) => "TradesSnapshot",
            FramePayload::Trade(_) => "Trade",
            FramePayload::Ticker(_) => "Ticker",
        }
    }
}

fn to_levels(entries: Vec<(Price, Quantity)>) -> Vec<PriceLevel> {
    entries
        .into_iter()
        .map(|(price, amount)| PriceLevel { price, amount })
        .collect()
}

/// Request for a fresh snapshot after a sequence gap.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResyncRequest {
    pub market: MarketId,
    pub channel: Channel,
    /// Sequence number that was expected next
    pub expected: u64,
    /// Sequence number actually received
    pub received: u64,
}

impl ResyncRequest {
    /// Number of messages missing in this gap.
    pub fn gap_size(&self) -> u64 {
        self.received - self.expected
    }
}

/// Outbound command for the upstream feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireCommand {
    Subscribe {
        market: MarketId,
        channels: BTreeSet<Channel>,
    },
    Unsubscribe {
        market: MarketId,
        channels: BTreeSet<Channel>,
    },
    RequestSnapshot {
        market: MarketId,
        channel: Channel,
    },
}

impl WireCommand {
    pub fn market(&self) -> &MarketId {
        match self {
            WireCommand::Subscribe { market, .. }
            | WireCommand::Unsubscribe { market, .. }
            | WireCommand::RequestSnapshot { market, .. } => market,
        }
    }

    /// Stream names this command addresses.
    pub fn streams(&self) -> Vec<String> {
        match self {
            WireCommand::Subscribe { market, channels }
            | WireCommand::Unsubscribe { market, channels } => {
                channels.iter().map(|c| c.stream_name(market)).collect()
            }
            WireCommand::RequestSnapshot { market, channel } => {
                vec![channel.stream_name(market)]
            }
        }
    }

    /// Serialize for the wire: `{"event": ..., "streams": [...]}`.
    pub fn to_json(&self) -> String {
        let event = match self {
            WireCommand::Subscribe { .. } => "subscribe",
            WireCommand::Unsubscribe { .. } => "unsubscribe",
            WireCommand::RequestSnapshot { .. } => "snapshot",
        };
        json!({ "event": event, "streams": self.streams() }).to_string()
    }
}
