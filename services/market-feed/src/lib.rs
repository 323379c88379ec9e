//! Market Feed Service
//!
//! Keeps a consistent, incrementally updated view of per-market depth,
//! recent trades and tickers from an unreliable push feed:
//! - Per-(market, channel) sequencing with gap and duplicate detection
//! - Depth books rebuilt from snapshots, diffs buffered across resyncs
//! - Bounded trade tapes and whole-record tickers
//! - Subscription intent replayed on every reconnect
//! - Epoch-guarded reconnects with jittered exponential backoff
//! - Versioned, immutable snapshots for readers and listeners
//!
//! # Architecture
//!
//! ```text
//!   Transport (ws)            Callers (API, UI)
//!        │ TransportEvent          │ Command
//!        └──────────┬──────────────┘
//!              ┌────▼────┐
//!              │ inbound │  single bounded queue
//!              └────┬────┘
//!              ┌────▼─────┐      TransportCommand
//!              │ FeedCore │ ───────────────────────▶ Transport
//!              └────┬─────┘
//!     ┌─────────┬───┴─────┬──────────┐
//! ┌───▼───┐ ┌───▼───┐ ┌───▼───┐ ┌────▼───┐
//! │ Depth │ │Trades │ │Ticker │ │Sequence│
//! └───┬───┘ └───┬───┘ └───┬───┘ └────────┘
//!     └─────────┼─────────┘
//!        ┌──────▼───────┐
//!        │PublishedState│ ──watch──▶ get_snapshot / on_update
//!        └──────────────┘
//! ```

pub mod api;
pub mod config;
pub mod depth;
pub mod engine;
pub mod error;
pub mod events;
pub mod handle;
pub mod metrics;
pub mod reconnect;
pub mod sequencer;
pub mod snapshot;
pub mod subscription;
pub mod ticker;
pub mod trades;
pub mod transport;

pub use config::FeedConfig;
pub use error::FeedError;
pub use events::Channel;
pub use handle::{FeedEngine, FeedHandle, ListenerHandle};
pub use reconnect::{ConnectOptions, ConnectionState};
pub use snapshot::{FeedSnapshot, PublishedState};

// Library version
pub const SERVICE_VERSION: &str = "0.1.0";
