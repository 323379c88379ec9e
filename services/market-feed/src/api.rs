//! HTTP read API over a running feed engine
//!
//! Read routes serve the last published state without touching the worker;
//! command routes forward to the `FeedHandle`.

use std::collections::{BTreeMap, BTreeSet};

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use types::ids::MarketId;

use crate::depth::{BookStatus, DepthPoint, PriceLevel};
use crate::error::FeedError;
use crate::events::Channel;
use crate::handle::FeedHandle;
use crate::reconnect::{ConnectOptions, ConnectionState};
use crate::snapshot::FeedSnapshot;
use crate::trades::Trade;

const DEFAULT_DEPTH_LIMIT: usize = 50;
const DEFAULT_TRADES_LIMIT: usize = 50;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error(transparent)]
    Feed(#[from] FeedError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let message = self.to_string();
        let (status, code) = match self {
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "BAD_REQUEST"),
            ApiError::Feed(FeedError::InvalidMarket(_)) => (StatusCode::NOT_FOUND, "INVALID_MARKET"),
            ApiError::Feed(FeedError::Shutdown) => (StatusCode::SERVICE_UNAVAILABLE, "SHUTDOWN"),
            ApiError::Feed(FeedError::Config(_)) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "CONFIG_ERROR")
            }
        };

        let body = Json(json!({
            "error": code,
            "message": message
        }));

        (status, body).into_response()
    }
}

pub fn create_router(feed: FeedHandle) -> Router {
    let api_routes = Router::new()
        .route("/markets/{market}/snapshot", get(get_snapshot))
        .route("/markets/{market}/depth", get(get_depth))
        .route("/markets/{market}/trades", get(get_trades))
        .route("/subscriptions", post(subscribe).delete(unsubscribe))
        .route("/connect", post(connect))
        .route("/disconnect", post(disconnect))
        .route("/status", get(status))
        .route("/metrics", get(metrics));

    Router::new()
        .nest("/v1", api_routes)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(feed)
}

fn known_market(feed: &FeedHandle, raw: &str) -> Result<MarketId, ApiError> {
    let market = MarketId::try_new(raw).map_err(|e| ApiError::BadRequest(e.to_string()))?;
    if !feed.markets().contains(&market) {
        return Err(FeedError::InvalidMarket(market).into());
    }
    Ok(market)
}

#[derive(Debug, Deserialize)]
pub struct LimitQuery {
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DepthResponse {
    pub market: MarketId,
    pub version: u64,
    pub sequence: u64,
    pub stale: bool,
    pub bids: Vec<PriceLevel>,
    pub asks: Vec<PriceLevel>,
    pub spread: Option<Decimal>,
    pub mid_price: Option<Decimal>,
    pub last_price: Option<Decimal>,
    /// Accumulated volume per level, for depth charts.
    pub bid_totals: Vec<DepthPoint>,
    pub ask_totals: Vec<DepthPoint>,
    pub max_cumulative_volume: Decimal,
    pub checksum: String,
}

impl DepthResponse {
    fn build(snapshot: FeedSnapshot, limit: usize) -> Self {
        let top = snapshot.depth.top(limit);
        let last_price = snapshot.last_price();
        Self {
            market: snapshot.market,
            version: snapshot.version,
            sequence: top.sequence,
            stale: snapshot.stale,
            spread: top.spread(),
            mid_price: top.mid_price(),
            last_price,
            bid_totals: top.cumulative(types::order::Side::Bid),
            ask_totals: top.cumulative(types::order::Side::Ask),
            max_cumulative_volume: top.max_cumulative_volume(),
            bids: top.bids,
            asks: top.asks,
            checksum: snapshot.checksum,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct SubscriptionRequest {
    pub market: String,
    pub channels: BTreeSet<Channel>,
}

#[derive(Debug, Deserialize)]
pub struct ConnectQuery {
    #[serde(default)]
    pub authenticated: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MarketStatus {
    /// Display name, e.g. "BTC/USD".
    pub pair: String,
    pub channels: BTreeSet<Channel>,
    pub book_status: Option<BookStatus>,
    pub resyncing: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub version: u64,
    pub epoch: u64,
    pub connection_state: ConnectionState,
    pub markets: BTreeMap<MarketId, MarketStatus>,
}

async fn get_snapshot(
    State(feed): State<FeedHandle>,
    Path(market): Path<String>,
) -> Result<Json<FeedSnapshot>, ApiError> {
    let market = known_market(&feed, &market)?;
    Ok(Json(feed.get_snapshot(&market)))
}

async fn get_depth(
    State(feed): State<FeedHandle>,
    Path(market): Path<String>,
    Query(query): Query<LimitQuery>,
) -> Result<Json<DepthResponse>, ApiError> {
    let market = known_market(&feed, &market)?;
    let limit = query.limit.unwrap_or(DEFAULT_DEPTH_LIMIT);
    Ok(Json(DepthResponse::build(feed.get_snapshot(&market), limit)))
}

async fn get_trades(
    State(feed): State<FeedHandle>,
    Path(market): Path<String>,
    Query(query): Query<LimitQuery>,
) -> Result<Json<Vec<Trade>>, ApiError> {
    let market = known_market(&feed, &market)?;
    let limit = query.limit.unwrap_or(DEFAULT_TRADES_LIMIT);
    let snapshot = feed.get_snapshot(&market);
    Ok(Json(snapshot.recent_trades(limit).to_vec()))
}

async fn subscribe(
    State(feed): State<FeedHandle>,
    Json(payload): Json<SubscriptionRequest>,
) -> Result<StatusCode, ApiError> {
    let market = known_market(&feed, &payload.market)?;
    feed.subscribe(&market, payload.channels).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn unsubscribe(
    State(feed): State<FeedHandle>,
    Json(payload): Json<SubscriptionRequest>,
) -> Result<StatusCode, ApiError> {
    let market = known_market(&feed, &payload.market)?;
    feed.unsubscribe(&market, payload.channels).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn connect(
    State(feed): State<FeedHandle>,
    Query(query): Query<ConnectQuery>,
) -> Result<StatusCode, ApiError> {
    feed.connect(ConnectOptions {
        authenticated: query.authenticated,
    })
    .await?;
    Ok(StatusCode::ACCEPTED)
}

async fn disconnect(State(feed): State<FeedHandle>) -> Result<StatusCode, ApiError> {
    feed.disconnect().await?;
    Ok(StatusCode::ACCEPTED)
}

async fn status(State(feed): State<FeedHandle>) -> Json<StatusResponse> {
    let published = feed.published();
    let markets = published
        .markets
        .iter()
        .map(|(id, view)| {
            (
                id.clone(),
                MarketStatus {
                    pair: feed
                        .markets()
                        .get(id)
                        .map(|market| market.display_name())
                        .unwrap_or_else(|| id.to_string()),
                    channels: view.channels.clone(),
                    book_status: view.book_status,
                    resyncing: view.resyncing,
                },
            )
        })
        .collect();

    Json(StatusResponse {
        version: published.version,
        epoch: published.epoch,
        connection_state: published.connection_state,
        markets,
    })
}

async fn metrics(State(feed): State<FeedHandle>) -> Json<BTreeMap<String, u64>> {
    Json(feed.metrics().export())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;
    use types::market::Market;

    use crate::config::FeedConfig;
    use crate::handle::FeedEngine;

    fn feed() -> FeedHandle {
        let config = FeedConfig {
            markets: vec![Market::new(MarketId::new("btcusd"), "btc", "usd", 2, 6)],
            ..FeedConfig::default()
        };
        let (handle, _link) = FeedEngine::spawn(config).unwrap();
        handle
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_snapshot_of_idle_market_is_stale() {
        let app = create_router(feed());
        let response = app
            .oneshot(
                Request::get("/v1/markets/btcusd/snapshot")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["stale"], true);
        assert_eq!(body["connection_state"], "disconnected");
    }

    #[tokio::test]
    async fn test_depth_of_idle_market() {
        let app = create_router(feed());
        let response = app
            .oneshot(
                Request::get("/v1/markets/btcusd/depth?limit=5")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["bids"], json!([]));
        assert!(body["last_price"].is_null());
        assert_eq!(body["max_cumulative_volume"], "0");
    }

    #[tokio::test]
    async fn test_unknown_market_is_not_found() {
        let app = create_router(feed());
        let response = app
            .oneshot(
                Request::get("/v1/markets/xrpusd/depth?limit=5")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_json(response).await["error"], "INVALID_MARKET");
    }

    #[tokio::test]
    async fn test_malformed_market_is_bad_request() {
        let app = create_router(feed());
        let response = app
            .oneshot(
                Request::get("/v1/markets/BTC-USD/trades")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_subscribe_then_status() {
        let feed = feed();
        let app = create_router(feed.clone());

        let response = app
            .clone()
            .oneshot(
                Request::post("/v1/subscriptions")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"market":"btcusd","channels":["depth","trades"]}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let response = app
            .oneshot(Request::get("/v1/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body = body_json(response).await;
        assert_eq!(body["markets"]["btcusd"]["channels"], json!(["depth", "trades"]));
        assert_eq!(body["markets"]["btcusd"]["resyncing"], true);
        assert_eq!(body["markets"]["btcusd"]["pair"], "BTC/USD");
    }

    #[tokio::test]
    async fn test_metrics_route() {
        let app = create_router(feed());
        let response = app
            .oneshot(Request::get("/v1/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["frames_ingested"], 0);
    }
}
