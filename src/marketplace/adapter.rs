//! Marketplace Adapter
//! Mission: one rate-limited HTTP client plus one persistent-stream client
//! per venue, normalising heterogeneous payloads into the canonical model.
//! Reconnect is bounded exponential backoff; a venue that exhausts its
//! attempts is marked unhealthy and skipped upstream.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
use tracing::{debug, error, info, warn};

use crate::marketplace::model::{Listing, ListingStatus};

#[derive(Debug, Clone)]
pub struct VenueConfig {
    pub id: String,
    pub rest_base_url: String,
    pub stream_url: String,
    pub channels: Vec<String>,
    pub requests_per_second: f64,
    /// Primary health probe path, with a configurable fallback (e.g.
    /// `/health` then `/stats`) for venues that rename or retire one.
    pub health_probe_path: String,
    pub health_probe_fallback_path: String,
    pub max_reconnect_attempts: u32,
    pub queue_depth_threshold: usize,
    /// Baseline execution-time risk contributed by this venue (slow
    /// settlement, manual approval, etc.), folded into an opportunity's
    /// execution-risk sub-score.
    pub execution_risk_score: u32,
}

#[derive(Debug, Clone)]
pub enum MarketplaceEvent {
    ListingUpdate(Listing),
    Sale { moment_id: String, price: Decimal, venue_id: String },
    PriceChange { moment_id: String, new_price: Decimal, venue_id: String },
    VolumeUpdate { moment_id: String, volume_24h: Decimal, venue_id: String },
}

/// A simple token bucket sized from `requestsPerSecond`; every outbound
/// call flows through it.
struct TokenBucket {
    capacity: f64,
    tokens: Mutex<(f64, Instant)>,
    refill_per_sec: f64,
}

impl TokenBucket {
    fn new(rate_per_sec: f64) -> Self {
        Self {
            capacity: rate_per_sec.max(1.0),
            tokens: Mutex::new((rate_per_sec.max(1.0), Instant::now())),
            refill_per_sec: rate_per_sec.max(1.0),
        }
    }

    async fn acquire(&self) {
        loop {
            let wait = {
                let mut guard = self.tokens.lock();
                let (tokens, last) = *guard;
                let elapsed = last.elapsed().as_secs_f64();
                let refreshed = (tokens + elapsed * self.refill_per_sec).min(self.capacity);
                if refreshed >= 1.0 {
                    *guard = (refreshed - 1.0, Instant::now());
                    None
                } else {
                    *guard = (refreshed, Instant::now());
                    Some(Duration::from_secs_f64((1.0 - refreshed) / self.refill_per_sec))
                }
            };
            match wait {
                None => return,
                Some(d) => tokio::time::sleep(d).await,
            }
        }
    }
}

pub struct MarketplaceAdapter {
    pub config: VenueConfig,
    http: reqwest::Client,
    bucket: TokenBucket,
    stream_connected: AtomicBool,
    queue_depth: AtomicUsize,
}

impl MarketplaceAdapter {
    pub fn new(config: VenueConfig, http: reqwest::Client) -> Arc<Self> {
        let bucket = TokenBucket::new(config.requests_per_second);
        Arc::new(Self {
            config,
            http,
            bucket,
            stream_connected: AtomicBool::new(false),
            queue_depth: AtomicUsize::new(0),
        })
    }

    pub fn is_healthy(&self) -> bool {
        self.stream_connected.load(Ordering::Relaxed)
            && self.queue_depth.load(Ordering::Relaxed) < self.config.queue_depth_threshold
    }

    pub fn queue_depth(&self) -> usize {
        self.queue_depth.load(Ordering::Relaxed)
    }

    /// Test connection: try the configured probe path, silently fall back
    /// to the secondary path on a non-2xx or transport error.
    pub async fn probe_health(&self) -> bool {
        self.bucket.acquire().await;
        let primary = format!("{}{}", self.config.rest_base_url, self.config.health_probe_path);
        if let Ok(resp) = self.http.get(&primary).send().await {
            if resp.status().is_success() {
                return true;
            }
        }
        let fallback = format!(
            "{}{}",
            self.config.rest_base_url, self.config.health_probe_fallback_path
        );
        matches!(self.http.get(&fallback).send().await, Ok(r) if r.status().is_success())
    }

    /// Bounded retry on transient failures, rate-limited by the bucket.
    pub async fn fetch_active_listings(&self) -> anyhow::Result<Vec<Listing>> {
        let url = format!("{}/listings?status=active", self.config.rest_base_url);
        let mut attempt = 0;
        loop {
            attempt += 1;
            self.bucket.acquire().await;
            match self.http.get(&url).send().await {
                Ok(resp) if resp.status().is_success() => {
                    let body: Value = resp.json().await.unwrap_or(Value::Array(vec![]));
                    let raw_items = body.as_array().cloned().unwrap_or_default();
                    let listings = raw_items
                        .iter()
                        .filter_map(|item| parse_listing(item, &self.config.id))
                        .collect();
                    return Ok(listings);
                }
                Ok(resp) => {
                    anyhow::bail!("listings fetch returned status {}", resp.status());
                }
                Err(err) if attempt < 3 => {
                    warn!(venue = %self.config.id, attempt, error = %err, "transient listings fetch failure, retrying");
                    tokio::time::sleep(Duration::from_millis(200 * attempt as u64)).await;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Open the stream, subscribe to declared channels, dispatch inbound
    /// frames, reconnect with exponential backoff up to the configured
    /// attempt ceiling. On final failure the adapter stays unhealthy.
    pub async fn run_stream(self: Arc<Self>, event_tx: mpsc::UnboundedSender<MarketplaceEvent>) {
        let mut attempt = 0u32;
        loop {
            match self.connect_and_stream(&event_tx).await {
                Ok(()) => {
                    info!(venue = %self.config.id, "marketplace stream closed gracefully");
                    attempt = 0;
                }
                Err(err) => {
                    attempt += 1;
                    self.stream_connected.store(false, Ordering::Relaxed);
                    if attempt > self.config.max_reconnect_attempts {
                        error!(venue = %self.config.id, "stream reconnect attempts exhausted, marking venue offline");
                        return;
                    }
                    let backoff = Duration::from_secs(2u64.saturating_pow(attempt.min(6)));
                    warn!(venue = %self.config.id, attempt, error = %err, backoff_secs = backoff.as_secs(), "stream error, reconnecting");
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }

    async fn connect_and_stream(
        &self,
        event_tx: &mpsc::UnboundedSender<MarketplaceEvent>,
    ) -> anyhow::Result<()> {
        let (ws_stream, _) = connect_async(&self.config.stream_url).await?;
        self.stream_connected.store(true, Ordering::Relaxed);
        let (mut write, mut read) = ws_stream.split();

        for channel in &self.config.channels {
            let sub = serde_json::json!({ "action": "subscribe", "channel": channel });
            write.send(WsMessage::Text(sub.to_string())).await?;
        }

        let mut heartbeat = tokio::time::interval(Duration::from_secs(30));
        loop {
            tokio::select! {
                _ = heartbeat.tick() => {
                    write.send(WsMessage::Ping(Vec::new())).await?;
                }
                frame = read.next() => {
                    let Some(frame) = frame else { return Ok(()) };
                    match frame? {
                        WsMessage::Text(text) => {
                            self.queue_depth.fetch_add(1, Ordering::Relaxed);
                            if let Ok(value) = serde_json::from_str::<Value>(&text) {
                                dispatch_frame(&value, &self.config.id, event_tx);
                            }
                            self.queue_depth.fetch_sub(1, Ordering::Relaxed);
                        }
                        WsMessage::Close(_) => return Ok(()),
                        _ => {}
                    }
                }
            }
        }
    }
}

fn dispatch_frame(value: &Value, venue_id: &str, event_tx: &mpsc::UnboundedSender<MarketplaceEvent>) -> Option<()> {
    let msg_type = value
        .get("type")
        .or_else(|| value.get("messageType"))
        .and_then(|v| v.as_str())
        .unwrap_or("");

    let event = match msg_type {
        "listing_update" => parse_listing(value.get("data").unwrap_or(value), venue_id)
            .map(MarketplaceEvent::ListingUpdate),
        "sale" => {
            let data = value.get("data").unwrap_or(value);
            let moment_id = field_str(data, &["momentId", "moment_id"])?;
            let price = field_decimal(data, &["price", "salePrice", "sale_price"])?;
            Some(MarketplaceEvent::Sale { moment_id, price, venue_id: venue_id.to_string() })
        }
        "price_change" => {
            let data = value.get("data").unwrap_or(value);
            let moment_id = field_str(data, &["momentId", "moment_id"])?;
            let new_price = field_decimal(data, &["newPrice", "new_price", "price"])?;
            Some(MarketplaceEvent::PriceChange { moment_id, new_price, venue_id: venue_id.to_string() })
        }
        "volume_update" => {
            let data = value.get("data").unwrap_or(value);
            let moment_id = field_str(data, &["momentId", "moment_id"])?;
            let volume_24h = field_decimal(data, &["volume24h", "volume_24h"])?;
            Some(MarketplaceEvent::VolumeUpdate { moment_id, volume_24h, venue_id: venue_id.to_string() })
        }
        other => {
            debug!(venue_id, msg_type = other, "unrecognised marketplace frame, dropping");
            None
        }
    };

    if let Some(event) = event {
        let _ = event_tx.send(event);
    }
    Some(())
}

/// Accepts both `field` and `fieldName`/`field_name` keys, per spec's
/// tolerance for heterogeneous payloads.
fn field_str(value: &Value, keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|k| value.get(*k))
        .and_then(|v| v.as_str().map(str::to_string).or_else(|| v.as_i64().map(|n| n.to_string())))
}

fn field_decimal(value: &Value, keys: &[&str]) -> Option<Decimal> {
    let raw = keys.iter().find_map(|k| value.get(*k))?;
    if let Some(n) = raw.as_f64() {
        return Decimal::from_str(&n.to_string()).ok();
    }
    if let Some(s) = raw.as_str() {
        return Decimal::from_str(s).ok();
    }
    None
}

fn field_i64(value: &Value, keys: &[&str], default: i64) -> i64 {
    keys.iter()
        .find_map(|k| value.get(*k))
        .and_then(|v| v.as_i64().or_else(|| v.as_str().and_then(|s| s.parse().ok())))
        .unwrap_or(default)
}

/// Normalise snake_case/camelCase field names and numeric-or-string
/// numbers; missing optional fields default sensibly.
fn parse_listing(value: &Value, venue_id: &str) -> Option<Listing> {
    let id = field_str(value, &["id", "listingId", "listing_id"])?;
    let moment_id = field_str(value, &["momentId", "moment_id"])?;
    let player_id = field_str(value, &["playerId", "player_id"]).unwrap_or_default();
    let player_name = value
        .get("playerName")
        .or_else(|| value.get("player_name"))
        .and_then(|v| v.as_str())
        .unwrap_or("unknown")
        .to_string();
    let moment_type = value
        .get("momentType")
        .or_else(|| value.get("moment_type"))
        .and_then(|v| v.as_str())
        .unwrap_or("moment")
        .to_string();
    let serial_number = field_i64(value, &["serialNumber", "serial_number"], 0);
    let price = field_decimal(value, &["price", "listPrice", "list_price"])?;
    let currency = value
        .get("currency")
        .and_then(|v| v.as_str())
        .unwrap_or("USD")
        .to_string();
    let seller_id = field_str(value, &["sellerId", "seller_id"]).unwrap_or_default();
    let status = match value
        .get("status")
        .and_then(|v| v.as_str())
        .unwrap_or("active")
    {
        "sold" => ListingStatus::Sold,
        "cancelled" | "canceled" => ListingStatus::Cancelled,
        "expired" => ListingStatus::Expired,
        _ => ListingStatus::Active,
    };

    Some(Listing {
        id,
        moment_id,
        player_id,
        player_name,
        moment_type,
        serial_number,
        price,
        currency,
        venue_id: venue_id.to_string(),
        seller_id,
        listed_at: Utc::now(),
        updated_at: Utc::now(),
        status,
    })
}

pub struct VenuePool {
    pub adapters: HashMap<String, Arc<MarketplaceAdapter>>,
}

impl VenuePool {
    pub fn new(adapters: Vec<Arc<MarketplaceAdapter>>) -> Self {
        Self {
            adapters: adapters.into_iter().map(|a| (a.config.id.clone(), a)).collect(),
        }
    }

    pub fn healthy_venues(&self) -> Vec<&Arc<MarketplaceAdapter>> {
        self.adapters.values().filter(|a| a.is_healthy()).collect()
    }
}
