//! Hyperliquid `/info` HTTP client.
//!
//! Pull side of the hybrid tracker: user state, open orders, fills.
//! Wraps every dispatch in a 10 req/s rate window, retries retriable
//! failures with exponential backoff, and trips a circuit breaker after
//! repeated failures so the polling loops fail fast instead of piling up.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use anyhow::Context;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, warn};

const MAX_RETRIES: u32 = 3;
const BASE_DELAY: Duration = Duration::from_secs(1);
const MAX_DELAY: Duration = Duration::from_secs(30);
const MAX_REQUESTS_PER_SECOND: usize = 10;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

// ─────────────────────────────────────────────────────────
// Error taxonomy
// ─────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ApiError {
    /// 4xx or schema mismatch. Never retried.
    #[error("client error ({status}): {body}")]
    Client { status: u16, body: String },
    /// 5xx. Retried with backoff.
    #[error("server error ({status})")]
    Server { status: u16 },
    #[error("request timed out")]
    Timeout,
    #[error("network error: {0}")]
    Network(String),
    /// Circuit breaker tripped; fail fast without issuing HTTP.
    #[error("circuit breaker is open")]
    BreakerOpen,
}

impl ApiError {
    pub fn retriable(&self) -> bool {
        matches!(
            self,
            ApiError::Server { .. } | ApiError::Timeout | ApiError::Network(_)
        )
    }
}

// ─────────────────────────────────────────────────────────
// Circuit breaker
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub recovery_timeout: Duration,
    pub half_open_max_calls: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
            half_open_max_calls: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half_open",
        }
    }
}

#[derive(Debug)]
pub struct CircuitBreaker {
    cfg: BreakerConfig,
    state: BreakerState,
    failure_count: u32,
    last_failure: Option<Instant>,
    half_open_calls: u32,
}

impl CircuitBreaker {
    pub fn new(cfg: BreakerConfig) -> Self {
        Self {
            cfg,
            state: BreakerState::Closed,
            failure_count: 0,
            last_failure: None,
            half_open_calls: 0,
        }
    }

    /// Check-and-reserve: in half-open, each allowed call counts as a probe.
    pub fn can_execute(&mut self) -> bool {
        match self.state {
            BreakerState::Closed => true,
            BreakerState::Open => {
                let recovered = self
                    .last_failure
                    .map(|at| at.elapsed() > self.cfg.recovery_timeout)
                    .unwrap_or(true);
                if recovered {
                    self.state = BreakerState::HalfOpen;
                    self.half_open_calls = 1;
                    true
                } else {
                    false
                }
            }
            BreakerState::HalfOpen => {
                if self.half_open_calls < self.cfg.half_open_max_calls {
                    self.half_open_calls += 1;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn on_success(&mut self) {
        if self.state == BreakerState::HalfOpen {
            self.state = BreakerState::Closed;
        }
        self.failure_count = 0;
        self.half_open_calls = 0;
    }

    pub fn on_failure(&mut self) {
        self.failure_count += 1;
        self.last_failure = Some(Instant::now());
        if self.state == BreakerState::HalfOpen
            || self.failure_count >= self.cfg.failure_threshold
        {
            self.state = BreakerState::Open;
        }
    }

    pub fn state(&self) -> BreakerState {
        self.state
    }
}

// ─────────────────────────────────────────────────────────
// Rate window
// ─────────────────────────────────────────────────────────

/// Sliding one-second window over dispatch timestamps.
#[derive(Debug, Default)]
struct RateWindow {
    stamps: VecDeque<Instant>,
}

impl RateWindow {
    /// Stamp a dispatch; returns how long to sleep first when saturated.
    fn reserve(&mut self, now: Instant) -> Option<Duration> {
        while let Some(front) = self.stamps.front() {
            if now.duration_since(*front) >= Duration::from_secs(1) {
                self.stamps.pop_front();
            } else {
                break;
            }
        }

        let delay = if self.stamps.len() >= MAX_REQUESTS_PER_SECOND {
            self.stamps
                .front()
                .map(|oldest| Duration::from_secs(1).saturating_sub(now.duration_since(*oldest)))
                .filter(|d| !d.is_zero())
        } else {
            None
        };

        self.stamps
            .push_back(now + delay.unwrap_or(Duration::ZERO));
        delay
    }
}

// ─────────────────────────────────────────────────────────
// Wire types
// ─────────────────────────────────────────────────────────

/// One executed trade from `userFills`. Decimal fields arrive as strings.
#[derive(Debug, Clone, Deserialize)]
pub struct Fill {
    #[serde(default)]
    pub coin: String,
    pub px: Decimal,
    pub sz: Decimal,
    #[serde(default)]
    pub side: String,
    #[serde(default)]
    pub oid: u64,
    #[serde(default)]
    pub time: i64,
    #[serde(default)]
    pub dir: Option<String>,
    #[serde(rename = "closedPnl", default)]
    pub closed_pnl: Option<Decimal>,
    #[serde(default)]
    pub fee: Option<Decimal>,
}

impl Fill {
    /// Replay-dedup identity. Distinct partial fills at the same price
    /// differ in `time`; replayed frames do not.
    pub fn dedup_key(&self) -> String {
        format!("{}:{}:{}:{}", self.oid, self.time, self.px, self.sz)
    }

    pub fn is_close(&self) -> bool {
        matches!(self.dir.as_deref(), Some("Close Long") | Some("Close Short"))
    }
}

/// Open-order entries nest the order under `order` on some endpoints and
/// carry `oid` at top level on others; accept both.
pub fn order_oid(entry: &Value) -> Option<u64> {
    entry
        .get("order")
        .and_then(|o| o.get("oid"))
        .or_else(|| entry.get("oid"))
        .and_then(Value::as_u64)
}

/// Partition one `openOrders` result across the requested ids.
pub fn partition_statuses(ids: &[u64], open_orders: &[Value]) -> HashMap<u64, Option<Value>> {
    let mut by_oid: HashMap<u64, Value> = HashMap::new();
    for entry in open_orders {
        if let Some(oid) = order_oid(entry) {
            by_oid.insert(oid, entry.clone());
        }
    }
    ids.iter().map(|id| (*id, by_oid.remove(id))).collect()
}

// ─────────────────────────────────────────────────────────
// Client
// ─────────────────────────────────────────────────────────

#[derive(Debug, Default, Clone)]
pub struct ApiStats {
    pub requests: u64,
    pub retries: u64,
    pub failures: u64,
}

pub struct InfoClient {
    http: reqwest::Client,
    base_url: String,
    breaker: Mutex<CircuitBreaker>,
    window: Mutex<RateWindow>,
    stats: Mutex<ApiStats>,
}

impl InfoClient {
    pub fn new(base_url: &str) -> anyhow::Result<Self> {
        let base = url::Url::parse(base_url).context("invalid exchange base URL")?;
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .context("building HTTP client")?;
        Ok(Self {
            http,
            base_url: base.to_string().trim_end_matches('/').to_string(),
            breaker: Mutex::new(CircuitBreaker::new(BreakerConfig::default())),
            window: Mutex::new(RateWindow::default()),
            stats: Mutex::new(ApiStats::default()),
        })
    }

    /// POST to `/info` with rate limiting, retry, and breaker accounting.
    async fn post_info(&self, body: Value) -> Result<Value, ApiError> {
        if !self.breaker.lock().unwrap().can_execute() {
            warn!("Circuit breaker is open — request blocked");
            return Err(ApiError::BreakerOpen);
        }

        let url = format!("{}/info", self.base_url);
        let mut last_err = ApiError::Network("no attempt made".to_string());

        for attempt in 0..=MAX_RETRIES {
            if attempt > 0 {
                self.stats.lock().unwrap().retries += 1;
            }

            // Never hold the window lock across the sleep.
            let delay = self.window.lock().unwrap().reserve(Instant::now());
            if let Some(delay) = delay {
                sleep(delay).await;
            }

            self.stats.lock().unwrap().requests += 1;
            let result = self.http.post(&url).json(&body).send().await;

            last_err = match result {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        match resp.json::<Value>().await {
                            Ok(value) => {
                                self.breaker.lock().unwrap().on_success();
                                return Ok(value);
                            }
                            // A 200 we cannot parse is a schema problem, not
                            // a transient one.
                            Err(e) => ApiError::Client {
                                status: status.as_u16(),
                                body: format!("unparseable body: {e}"),
                            },
                        }
                    } else if status.is_client_error() {
                        let body = resp.text().await.unwrap_or_default();
                        ApiError::Client {
                            status: status.as_u16(),
                            body,
                        }
                    } else {
                        ApiError::Server {
                            status: status.as_u16(),
                        }
                    }
                }
                Err(e) if e.is_timeout() => ApiError::Timeout,
                Err(e) => ApiError::Network(e.to_string()),
            };

            if !last_err.retriable() {
                break;
            }
            if attempt < MAX_RETRIES {
                let backoff = backoff_delay(attempt);
                debug!(
                    "Retrying /info in {:?} (attempt {}/{}): {}",
                    backoff,
                    attempt + 1,
                    MAX_RETRIES,
                    last_err
                );
                sleep(backoff).await;
            }
        }

        self.breaker.lock().unwrap().on_failure();
        self.stats.lock().unwrap().failures += 1;
        Err(last_err)
    }

    pub async fn user_state(&self, user: &str) -> Result<Value, ApiError> {
        self.post_info(json!({"type": "clearinghouseState", "user": user}))
            .await
    }

    pub async fn open_orders(&self, user: &str) -> Result<Vec<Value>, ApiError> {
        let value = self
            .post_info(json!({"type": "openOrders", "user": user}))
            .await?;
        Ok(value.as_array().cloned().unwrap_or_default())
    }

    pub async fn user_fills(
        &self,
        user: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<Fill>, ApiError> {
        let mut body = json!({"type": "userFills", "user": user});
        if let Some(since) = since {
            body["startTime"] = json!(since.timestamp_millis());
        }
        let value = self.post_info(body).await?;
        let fills = value
            .as_array()
            .map(|entries| {
                entries
                    .iter()
                    .filter_map(|entry| serde_json::from_value::<Fill>(entry.clone()).ok())
                    .collect()
            })
            .unwrap_or_default();
        Ok(fills)
    }

    /// Recent closing fills for one coin, most recent first. Feeds exit
    /// price / realized P&L for position-close notifications.
    pub async fn recent_close_fills(
        &self,
        user: &str,
        coin: &str,
        lookback: chrono::Duration,
    ) -> Result<Vec<Fill>, ApiError> {
        let since = Utc::now() - lookback;
        let mut close_fills: Vec<Fill> = self
            .user_fills(user, Some(since))
            .await?
            .into_iter()
            .filter(|f| f.coin == coin && f.is_close())
            .collect();
        close_fills.sort_by_key(|f| std::cmp::Reverse(f.time));
        debug!(
            "Found {} recent close fills for {} {}",
            close_fills.len(),
            user,
            coin
        );
        Ok(close_fills)
    }

    /// Status of many orders with ONE `openOrders` request, partitioned
    /// locally. `None` means the order is no longer open.
    pub async fn batch_order_statuses(
        &self,
        user: &str,
        ids: &[u64],
    ) -> Result<HashMap<u64, Option<Value>>, ApiError> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }
        let open_orders = self.open_orders(user).await?;
        Ok(partition_statuses(ids, &open_orders))
    }

    pub async fn meta(&self) -> Result<Value, ApiError> {
        self.post_info(json!({"type": "meta"})).await
    }

    pub fn breaker_state(&self) -> BreakerState {
        self.breaker.lock().unwrap().state()
    }

    pub fn statistics(&self) -> Value {
        let stats = self.stats.lock().unwrap().clone();
        json!({
            "requests": stats.requests,
            "retries": stats.retries,
            "failures": stats.failures,
            "circuit_breaker": self.breaker_state().as_str(),
        })
    }
}

fn backoff_delay(attempt: u32) -> Duration {
    let exp = BASE_DELAY.saturating_mul(2u32.saturating_pow(attempt));
    exp.min(MAX_DELAY)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_backoff_doubles_and_caps() {
        assert_eq!(backoff_delay(0), Duration::from_secs(1));
        assert_eq!(backoff_delay(1), Duration::from_secs(2));
        assert_eq!(backoff_delay(2), Duration::from_secs(4));
        assert_eq!(backoff_delay(10), Duration::from_secs(30));
    }

    #[test]
    fn test_error_classes() {
        assert!(!ApiError::Client {
            status: 422,
            body: String::new()
        }
        .retriable());
        assert!(ApiError::Server { status: 502 }.retriable());
        assert!(ApiError::Timeout.retriable());
        assert!(ApiError::Network("reset".into()).retriable());
        assert!(!ApiError::BreakerOpen.retriable());
    }

    #[test]
    fn test_breaker_opens_after_threshold() {
        let mut breaker = CircuitBreaker::new(BreakerConfig::default());
        for _ in 0..5 {
            assert!(breaker.can_execute());
            breaker.on_failure();
        }
        assert_eq!(breaker.state(), BreakerState::Open);
        // 6th call fails fast without issuing HTTP.
        assert!(!breaker.can_execute());
    }

    #[test]
    fn test_breaker_recovery_probes_then_closes() {
        let mut breaker = CircuitBreaker::new(BreakerConfig {
            recovery_timeout: Duration::from_millis(5),
            ..BreakerConfig::default()
        });
        for _ in 0..5 {
            breaker.on_failure();
        }
        assert!(!breaker.can_execute());

        std::thread::sleep(Duration::from_millis(10));
        // One probe allowed after the recovery timeout.
        assert!(breaker.can_execute());
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
        breaker.on_success();
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn test_breaker_half_open_probe_limit() {
        let mut breaker = CircuitBreaker::new(BreakerConfig {
            recovery_timeout: Duration::from_millis(1),
            ..BreakerConfig::default()
        });
        for _ in 0..5 {
            breaker.on_failure();
        }
        std::thread::sleep(Duration::from_millis(5));

        // 3 probes allowed, the 4th is blocked.
        assert!(breaker.can_execute());
        assert!(breaker.can_execute());
        assert!(breaker.can_execute());
        assert!(!breaker.can_execute());

        // Any half-open failure reopens immediately.
        breaker.on_failure();
        assert_eq!(breaker.state(), BreakerState::Open);
    }

    #[test]
    fn test_rate_window_delays_when_saturated() {
        let mut window = RateWindow::default();
        let now = Instant::now();
        for _ in 0..MAX_REQUESTS_PER_SECOND {
            assert!(window.reserve(now).is_none());
        }
        let delay = window.reserve(now);
        assert!(delay.is_some());
        assert!(delay.unwrap() <= Duration::from_secs(1));
    }

    #[test]
    fn test_fill_parses_string_decimals() {
        let fill: Fill = serde_json::from_value(json!({
            "coin": "ETH",
            "px": "2499.5",
            "sz": "1.0",
            "side": "B",
            "oid": 101,
            "time": 1700000000123i64,
            "dir": "Open Long",
            "closedPnl": "0.0",
            "fee": "0.31"
        }))
        .unwrap();
        assert_eq!(fill.px.to_string(), "2499.5");
        assert_eq!(fill.oid, 101);
        assert!(!fill.is_close());
    }

    #[test]
    fn test_partition_statuses_handles_both_shapes() {
        let open = vec![
            json!({"order": {"oid": 1, "coin": "ETH"}, "status": "open"}),
            json!({"oid": 2, "coin": "BTC"}),
        ];
        let map = partition_statuses(&[1, 2, 3], &open);
        assert!(map[&1].is_some());
        assert!(map[&2].is_some());
        assert!(map[&3].is_none());
    }

    #[test]
    fn test_fill_dedup_key_distinguishes_times() {
        let f = |time: i64| Fill {
            coin: "ETH".into(),
            px: Decimal::new(100, 0),
            sz: Decimal::new(5, 1),
            side: "B".into(),
            oid: 201,
            time,
            dir: None,
            closed_pnl: None,
            fee: None,
        };
        assert_ne!(f(1).dedup_key(), f(2).dedup_key());
        assert_eq!(f(1).dedup_key(), f(1).dedup_key());
    }
}
