//! Determinism tests for the feed core
//!
//! The core is a pure state machine over (command, frame, instant) inputs, so
//! identical inputs must yield identical published state.
//!
//! Tests include:
//! - Dual replay comparison
//! - Diff stream vs. a reference book model
//! - Snapshot round trip into a fresh core
//! - Missing diff simulation

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Instant;

use market_feed::config::FeedConfig;
use market_feed::engine::FeedCore;
use market_feed::metrics::FeedMetrics;
use market_feed::transport::TransportEvent;
use market_feed::{Channel, ConnectOptions, FeedSnapshot};
use proptest::prelude::*;
use types::ids::MarketId;
use types::market::{Market, MarketTable};
use types::numeric::{Price, Quantity};

fn btc() -> MarketId {
    MarketId::new("btcusd")
}

/// A connected core subscribed to btcusd depth, trades and ticker.
fn live_core() -> (FeedCore, u64) {
    let config = FeedConfig {
        markets: vec![Market::new(btc(), "btc", "usd", 2, 6)],
        ..FeedConfig::default()
    };
    let table = MarketTable::from_markets(config.markets.clone()).unwrap();
    let mut core = FeedCore::new(&config, Arc::new(table), Arc::new(FeedMetrics::new()));

    let all: BTreeSet<Channel> = [Channel::Depth, Channel::Trades, Channel::Ticker]
        .into_iter()
        .collect();
    core.subscribe(&btc(), &all).unwrap();
    core.connect(ConnectOptions::default());
    let epoch = core.epoch();
    core.on_transport(TransportEvent::Opened { epoch }, Instant::now(), 0);
    core.take_commands();
    (core, epoch)
}

fn levels(entries: &[(u64, u64)]) -> String {
    let items: Vec<String> = entries
        .iter()
        .map(|(p, a)| format!(r#"["{}","{}"]"#, p, a))
        .collect();
    format!("[{}]", items.join(","))
}

fn depth_snapshot(seq: u64, bids: &[(u64, u64)], asks: &[(u64, u64)]) -> String {
    format!(
        r#"{{"market":"btcusd","channel":"depth","event":"snapshot","sequence":{},"payload":{{"bids":{},"asks":{}}}}}"#,
        seq,
        levels(bids),
        levels(asks)
    )
}

fn depth_update(seq: u64, bid: bool, price: u64, amount: u64) -> String {
    let side = if bid { "bids" } else { "asks" };
    format!(
        r#"{{"market":"btcusd","channel":"depth","event":"update","sequence":{},"payload":{{"{}":{}}}}}"#,
        seq,
        side,
        levels(&[(price, amount)])
    )
}

fn trade(seq: u64, id: u64, price: u64) -> String {
    format!(
        r#"{{"market":"btcusd","channel":"trades","event":"trade","sequence":{},"payload":{{"id":{},"price":"{}","amount":"0.25","side":"sell","timestamp":{}}}}}"#,
        seq,
        id,
        price,
        1708123456000u64 + seq
    )
}

fn ticker(seq: u64, last: u64) -> String {
    format!(
        r#"{{"market":"btcusd","channel":"ticker","event":"ticker","sequence":{},"payload":{{"last":"{}","high":"60","low":"40","volume":"100"}}}}"#,
        seq, last
    )
}

fn whole_levels(snapshot: &FeedSnapshot, bids: bool) -> Vec<(u64, u64)> {
    let side = if bids {
        &snapshot.depth.bids
    } else {
        &snapshot.depth.asks
    };
    side.iter()
        .map(|level| {
            (
                level.price.to_string().parse().unwrap(),
                level.amount.to_string().parse().unwrap(),
            )
        })
        .collect()
}

/// Mixed stream touching every channel, including a duplicate and a ticker gap.
fn scripted_stream() -> Vec<String> {
    let mut frames = vec![depth_snapshot(10, &[(49, 2), (48, 1)], &[(51, 3)])];
    for seq in 11..40u64 {
        frames.push(depth_update(seq, seq % 2 == 0, 40 + seq % 20, seq % 4));
        frames.push(trade(seq, seq, 45 + seq % 10));
        if seq % 5 != 0 {
            frames.push(ticker(seq, 50 + seq % 3));
        }
    }
    frames.push(depth_update(39, true, 47, 9));
    frames
}

#[test]
fn test_dual_replay_produces_identical_state() {
    let frames = scripted_stream();

    let run = || {
        let (mut core, epoch) = live_core();
        for frame in &frames {
            core.ingest(epoch, frame, 0);
        }
        core.publish();
        core.snapshot(&btc())
    };

    let first = run();
    let second = run();

    assert_eq!(first.checksum, second.checksum);
    assert_eq!(first.version, second.version);
    assert_eq!(first.depth, second.depth);
    assert_eq!(first.trades, second.trades);
    assert_eq!(first.ticker, second.ticker);
    assert!(!first.stale);
    assert!(first.verify_checksum());
}

#[test]
fn test_missing_diff_marks_stale_at_last_good_sequence() {
    for missing in 2..8u64 {
        let (mut core, epoch) = live_core();
        core.ingest(epoch, &depth_snapshot(1, &[(45, 1)], &[(55, 1)]), 0);
        for seq in 2..10u64 {
            if seq != missing {
                core.ingest(epoch, &depth_update(seq, true, 40 + seq, 1), 0);
            }
        }
        core.publish();

        let snap = core.snapshot(&btc());
        assert!(snap.stale, "gap at {} not detected", missing);
        assert_eq!(snap.depth.sequence, missing - 1);
    }
}

proptest! {
    #[test]
    fn prop_diff_stream_matches_model(
        changes in prop::collection::vec((any::<bool>(), 1u64..20, 0u64..4), 1..80)
    ) {
        let (mut core, epoch) = live_core();
        core.ingest(epoch, &depth_snapshot(0, &[], &[]), 0);

        let mut bids: BTreeMap<u64, u64> = BTreeMap::new();
        let mut asks: BTreeMap<u64, u64> = BTreeMap::new();
        for (i, (is_bid, offset, amount)) in changes.iter().copied().enumerate() {
            // Bids below 30, asks above 30: never crossed
            let (book, price) = if is_bid {
                (&mut bids, 30 - offset)
            } else {
                (&mut asks, 30 + offset)
            };
            if amount == 0 {
                book.remove(&price);
            } else {
                book.insert(price, amount);
            }
            core.ingest(epoch, &depth_update(i as u64 + 1, is_bid, price, amount), 0);
        }
        core.publish();

        let snap = core.snapshot(&btc());
        let expected_bids: Vec<(u64, u64)> = bids.into_iter().rev().collect();
        let expected_asks: Vec<(u64, u64)> = asks.into_iter().collect();
        prop_assert!(!snap.stale);
        prop_assert_eq!(snap.depth.sequence, changes.len() as u64);
        prop_assert_eq!(whole_levels(&snap, true), expected_bids);
        prop_assert_eq!(whole_levels(&snap, false), expected_asks);
    }

    #[test]
    fn prop_published_depth_round_trips_as_snapshot(
        changes in prop::collection::vec((any::<bool>(), 1u64..20, 0u64..4), 1..60)
    ) {
        let (mut source, epoch) = live_core();
        source.ingest(epoch, &depth_snapshot(0, &[(30, 1)], &[(31, 1)]), 0);
        for (i, (is_bid, offset, amount)) in changes.iter().copied().enumerate() {
            let price = if is_bid { 30 - offset } else { 31 + offset };
            source.ingest(epoch, &depth_update(i as u64 + 1, is_bid, price, amount), 0);
        }
        source.publish();
        let original = source.snapshot(&btc());

        let (mut replica, epoch) = live_core();
        let frame = depth_snapshot(
            original.depth.sequence,
            &whole_levels(&original, true),
            &whole_levels(&original, false),
        );
        replica.ingest(epoch, &frame, 0);
        replica.publish();
        let copy = replica.snapshot(&btc());

        prop_assert_eq!(&copy.depth.bids, &original.depth.bids);
        prop_assert_eq!(&copy.depth.asks, &original.depth.asks);
        prop_assert_eq!(copy.depth.sequence, original.depth.sequence);
        prop_assert_eq!(copy.checksum, original.checksum);
    }
}

#[test]
fn test_whole_levels_helper_reads_decimals() {
    let (mut core, epoch) = live_core();
    core.ingest(epoch, &depth_snapshot(3, &[(49, 2)], &[(51, 7)]), 0);
    core.publish();
    let snap = core.snapshot(&btc());

    assert_eq!(snap.depth.bids[0].price, Price::from_u64(49));
    assert_eq!(snap.depth.asks[0].amount, Quantity::from_u64(7));
    assert_eq!(whole_levels(&snap, false), vec![(51, 7)]);
}
