//! Position reconciler.
//!
//! Consumes per-user account snapshots and diffs them against the previous
//! snapshot to detect implicit position closes (positions the UI closed, or
//! that were liquidated, without any tracked order). Close details come
//! from recent closing fills when available, with the prior snapshot as a
//! fallback. Ongoing positions are checked against the P&L alert ladder;
//! each rung fires once per position lifecycle and every rung re-arms when
//! the position flattens.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::hyperliquid::api::{Fill, InfoClient};
use crate::messages::{NotifyEvent, ReconcilerMsg};

/// Alert rungs in percent; the highest crossed rung fires.
pub const PNL_ALERT_THRESHOLDS: [u32; 3] = [10, 25, 50];
const CLOSE_FILL_LOOKBACK_MINUTES: i64 = 10;
const MARGIN_WARNING_RATIO: f64 = 0.8;

#[derive(Debug, Clone, PartialEq)]
pub struct PositionSnapshot {
    pub net_size: Decimal,
    pub entry_price: Decimal,
    pub unrealized_pnl: Decimal,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CloseDetails {
    pub exit_price: Decimal,
    pub closed_size: Decimal,
    pub realized_pnl: Decimal,
}

// ─────────────────────────────────────────────────────────
// Snapshot parsing
// ─────────────────────────────────────────────────────────

fn parse_decimal(value: &Value) -> Option<Decimal> {
    match value {
        Value::String(s) => s.parse().ok(),
        Value::Number(n) => n.to_string().parse().ok(),
        _ => None,
    }
}

/// Extract `{coin → snapshot}` from a `webData2` payload. Zero-size
/// entries are treated the same as absent ones.
pub fn parse_positions(data: &Value) -> HashMap<String, PositionSnapshot> {
    let positions = data
        .get("clearinghouseState")
        .and_then(|cs| cs.get("assetPositions"))
        .or_else(|| data.get("assetPositions"))
        .and_then(Value::as_array);

    let mut out = HashMap::new();
    let Some(positions) = positions else {
        return out;
    };
    for entry in positions {
        let pos = entry.get("position").unwrap_or(entry);
        let Some(coin) = pos.get("coin").and_then(Value::as_str) else {
            continue;
        };
        let Some(net_size) = pos.get("szi").and_then(parse_decimal) else {
            continue;
        };
        if net_size.is_zero() {
            continue;
        }
        let entry_price = pos
            .get("entryPx")
            .and_then(parse_decimal)
            .unwrap_or(Decimal::ZERO);
        let unrealized_pnl = pos
            .get("unrealizedPnl")
            .and_then(parse_decimal)
            .unwrap_or(Decimal::ZERO);
        out.insert(
            coin.to_string(),
            PositionSnapshot {
                net_size,
                entry_price,
                unrealized_pnl,
            },
        );
    }
    out
}

/// `totalMarginUsed / accountValue` from the snapshot's margin summary.
pub fn margin_ratio(data: &Value) -> Option<f64> {
    let summary = data.get("clearinghouseState")?.get("marginSummary")?;
    let account_value = summary
        .get("accountValue")
        .and_then(parse_decimal)?
        .to_f64()?;
    let margin_used = summary
        .get("totalMarginUsed")
        .and_then(parse_decimal)?
        .to_f64()?;
    if account_value <= 0.0 {
        return None;
    }
    Some(margin_used / account_value)
}

/// Positions present before with nonzero size and gone (or zero) now.
pub fn diff_closed(
    prior: &HashMap<String, PositionSnapshot>,
    current: &HashMap<String, PositionSnapshot>,
) -> Vec<(String, PositionSnapshot)> {
    prior
        .iter()
        .filter(|(coin, snap)| !snap.net_size.is_zero() && !current.contains_key(*coin))
        .map(|(coin, snap)| (coin.clone(), snap.clone()))
        .collect()
}

/// Closure details from the most recent close fill, falling back to the
/// prior snapshot when the fill query came back empty.
pub fn resolve_close(prior: &PositionSnapshot, close_fills: &[Fill]) -> CloseDetails {
    match close_fills.first() {
        Some(fill) => CloseDetails {
            exit_price: fill.px,
            closed_size: fill.sz,
            realized_pnl: fill.closed_pnl.unwrap_or(prior.unrealized_pnl),
        },
        None => CloseDetails {
            exit_price: prior.entry_price,
            closed_size: prior.net_size.abs(),
            realized_pnl: prior.unrealized_pnl,
        },
    }
}

fn same_sign(a: Decimal, b: Decimal) -> bool {
    !a.is_zero() && !b.is_zero() && (a.is_sign_positive() == b.is_sign_positive())
}

// ─────────────────────────────────────────────────────────
// Actor
// ─────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct ReconcilerStats {
    snapshots: u64,
    closes_detected: u64,
    threshold_alerts: u64,
    margin_warnings: u64,
}

pub struct PositionReconciler {
    api: Arc<InfoClient>,
    rx: mpsc::Receiver<ReconcilerMsg>,
    notify_tx: mpsc::Sender<NotifyEvent>,
    /// Last snapshot per user, kept only while the user has a subscriber.
    snapshots: HashMap<String, HashMap<String, PositionSnapshot>>,
    /// Threshold rungs already fired per (user, coin).
    alerted: HashMap<String, HashMap<String, HashSet<u32>>>,
    stats: ReconcilerStats,
}

impl PositionReconciler {
    pub fn new(
        api: Arc<InfoClient>,
        rx: mpsc::Receiver<ReconcilerMsg>,
        notify_tx: mpsc::Sender<NotifyEvent>,
    ) -> Self {
        Self {
            api,
            rx,
            notify_tx,
            snapshots: HashMap::new(),
            alerted: HashMap::new(),
            stats: ReconcilerStats::default(),
        }
    }

    pub async fn run(mut self) {
        info!("🧮 PositionReconciler started");
        while let Some(msg) = self.rx.recv().await {
            match msg {
                ReconcilerMsg::Snapshot { user, data } => {
                    self.handle_snapshot(&user, &data).await;
                }
                ReconcilerMsg::Forget { user } => self.forget(&user),
            }
        }
        info!(
            "🧮 PositionReconciler shutting down | snapshots={} closes={} alerts={}",
            self.stats.snapshots, self.stats.closes_detected, self.stats.threshold_alerts,
        );
    }

    async fn handle_snapshot(&mut self, user: &str, data: &Value) {
        self.stats.snapshots += 1;
        let current = parse_positions(data);

        if let Some(ratio) = margin_ratio(data) {
            if ratio > MARGIN_WARNING_RATIO {
                self.stats.margin_warnings += 1;
                self.send(NotifyEvent::LiquidationWarning {
                    user: user.to_string(),
                    margin_ratio: ratio,
                })
                .await;
            }
        }

        let prior = self.snapshots.get(user).cloned().unwrap_or_default();

        for (coin, prev) in diff_closed(&prior, &current) {
            self.stats.closes_detected += 1;
            let close_fills = match self
                .api
                .recent_close_fills(
                    user,
                    &coin,
                    chrono::Duration::minutes(CLOSE_FILL_LOOKBACK_MINUTES),
                )
                .await
            {
                Ok(fills) => fills,
                Err(e) => {
                    warn!("Close-fill lookup failed for {user} {coin}: {e}");
                    Vec::new()
                }
            };
            let details = resolve_close(&prev, &close_fills);
            info!(
                "Position closed: {} {} exit={} size={} pnl={}",
                user, coin, details.exit_price, details.closed_size, details.realized_pnl,
            );
            // Flattened: the whole alert ladder re-arms.
            self.clear_alerts(user, &coin);
            self.send(NotifyEvent::PositionClosed {
                user: user.to_string(),
                coin,
                exit_price: details.exit_price,
                closed_size: details.closed_size,
                realized_pnl: details.realized_pnl,
            })
            .await;
        }

        let mut threshold_events = Vec::new();
        for (coin, snap) in &current {
            let Some(prev) = prior.get(coin) else {
                continue;
            };
            if !same_sign(prev.net_size, snap.net_size) {
                continue;
            }
            if let Some(event) = self.threshold_event(user, coin, snap) {
                threshold_events.push(event);
            }
        }
        for event in threshold_events {
            self.stats.threshold_alerts += 1;
            self.send(event).await;
        }

        self.snapshots.insert(user.to_string(), current);
    }

    /// Highest crossed rung not yet fired for this (user, coin), if any.
    fn threshold_event(
        &mut self,
        user: &str,
        coin: &str,
        snap: &PositionSnapshot,
    ) -> Option<NotifyEvent> {
        if snap.entry_price <= Decimal::ZERO {
            return None;
        }
        let exposure = (snap.net_size.abs() * snap.entry_price).to_f64()?;
        if exposure <= 0.0 {
            return None;
        }
        let pnl_pct = snap.unrealized_pnl.to_f64()? / exposure * 100.0;

        let crossed = PNL_ALERT_THRESHOLDS
            .iter()
            .rev()
            .find(|t| pnl_pct.abs() >= **t as f64)
            .copied()?;

        let fired = self
            .alerted
            .entry(user.to_string())
            .or_default()
            .entry(coin.to_string())
            .or_default();
        if !fired.insert(crossed) {
            return None;
        }
        debug!("P&L threshold {crossed}% crossed for {user} {coin} ({pnl_pct:.1}%)");
        Some(NotifyEvent::PnlThreshold {
            user: user.to_string(),
            coin: coin.to_string(),
            threshold: crossed,
            pnl_pct,
            unrealized_pnl: snap.unrealized_pnl,
        })
    }

    fn clear_alerts(&mut self, user: &str, coin: &str) {
        if let Some(coins) = self.alerted.get_mut(user) {
            coins.remove(coin);
        }
    }

    fn forget(&mut self, user: &str) {
        self.snapshots.remove(user);
        self.alerted.remove(user);
        debug!("Forgot position state for {user}");
    }

    async fn send(&self, event: NotifyEvent) {
        if self.notify_tx.send(event).await.is_err() {
            warn!("Notifier channel closed — dropping reconciler event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serde_json::json;

    fn snapshot(net: Decimal, entry: Decimal, upnl: Decimal) -> PositionSnapshot {
        PositionSnapshot {
            net_size: net,
            entry_price: entry,
            unrealized_pnl: upnl,
        }
    }

    fn close_fill(px: Decimal, sz: Decimal, pnl: Decimal) -> Fill {
        Fill {
            coin: "ETH".into(),
            px,
            sz,
            side: "A".into(),
            oid: 900,
            time: 1,
            dir: Some("Close Long".into()),
            closed_pnl: Some(pnl),
            fee: None,
        }
    }

    fn reconciler() -> (PositionReconciler, mpsc::Receiver<NotifyEvent>) {
        let (_tx, rx) = mpsc::channel(8);
        let (notify_tx, notify_rx) = mpsc::channel(32);
        let api = Arc::new(InfoClient::new("http://127.0.0.1:1").unwrap());
        (PositionReconciler::new(api, rx, notify_tx), notify_rx)
    }

    #[test]
    fn test_parse_positions_from_webdata2() {
        let data = json!({
            "clearinghouseState": {
                "assetPositions": [
                    {"position": {"coin": "ETH", "szi": "1.5", "entryPx": "2500.0", "unrealizedPnl": "20.0"}},
                    {"position": {"coin": "BTC", "szi": "0", "entryPx": "90000", "unrealizedPnl": "0"}},
                ],
                "marginSummary": {"accountValue": "1000", "totalMarginUsed": "850"}
            }
        });
        let positions = parse_positions(&data);
        assert_eq!(positions.len(), 1);
        assert_eq!(positions["ETH"].net_size, dec!(1.5));
        assert_eq!(positions["ETH"].entry_price, dec!(2500));

        let ratio = margin_ratio(&data).unwrap();
        assert!((ratio - 0.85).abs() < 1e-9);
    }

    #[test]
    fn test_diff_detects_removed_position() {
        let mut prior = HashMap::new();
        prior.insert("ETH".to_string(), snapshot(dec!(1.0), dec!(2500), dec!(20)));
        prior.insert("BTC".to_string(), snapshot(dec!(0.2), dec!(90000), dec!(-5)));

        let mut current = HashMap::new();
        current.insert("BTC".to_string(), snapshot(dec!(0.2), dec!(90000), dec!(-4)));

        let closed = diff_closed(&prior, &current);
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].0, "ETH");
    }

    // S4: close details come from the most recent close fill.
    #[test]
    fn test_resolve_close_prefers_fill() {
        let prior = snapshot(dec!(1.0), dec!(2500), dec!(20));
        let details = resolve_close(&prior, &[close_fill(dec!(2520), dec!(1.0), dec!(20))]);
        assert_eq!(details.exit_price, dec!(2520));
        assert_eq!(details.closed_size, dec!(1.0));
        assert_eq!(details.realized_pnl, dec!(20));
    }

    #[test]
    fn test_resolve_close_fallback_uses_prior_snapshot() {
        let prior = snapshot(dec!(-2.0), dec!(2500), dec!(-13));
        let details = resolve_close(&prior, &[]);
        assert_eq!(details.exit_price, dec!(2500));
        assert_eq!(details.closed_size, dec!(2.0));
        assert_eq!(details.realized_pnl, dec!(-13));
    }

    #[test]
    fn test_threshold_fires_highest_rung_once() {
        let (mut rec, _rx) = reconciler();
        // 30 / (1.0 * 100) = 30% → the 25 rung.
        let snap = snapshot(dec!(1.0), dec!(100), dec!(30));
        match rec.threshold_event("0xaa", "ETH", &snap) {
            Some(NotifyEvent::PnlThreshold { threshold, .. }) => assert_eq!(threshold, 25),
            other => panic!("unexpected: {other:?}"),
        }
        // Same rung again: silent.
        assert!(rec.threshold_event("0xaa", "ETH", &snap).is_none());

        // Deeper move fires the next rung.
        let deeper = snapshot(dec!(1.0), dec!(100), dec!(-60));
        match rec.threshold_event("0xaa", "ETH", &deeper) {
            Some(NotifyEvent::PnlThreshold { threshold, .. }) => assert_eq!(threshold, 50),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_threshold_rearms_after_flatten() {
        let (mut rec, _rx) = reconciler();
        let snap = snapshot(dec!(1.0), dec!(100), dec!(30));
        assert!(rec.threshold_event("0xaa", "ETH", &snap).is_some());
        assert!(rec.threshold_event("0xaa", "ETH", &snap).is_none());

        rec.clear_alerts("0xaa", "ETH");
        assert!(rec.threshold_event("0xaa", "ETH", &snap).is_some());
    }

    #[test]
    fn test_threshold_guards_zero_entry() {
        let (mut rec, _rx) = reconciler();
        let snap = snapshot(dec!(1.0), dec!(0), dec!(1000));
        assert!(rec.threshold_event("0xaa", "ETH", &snap).is_none());
    }

    #[test]
    fn test_forget_drops_user_state() {
        let (mut rec, _rx) = reconciler();
        rec.snapshots.insert("0xaa".to_string(), HashMap::new());
        rec.threshold_event("0xaa", "ETH", &snapshot(dec!(1), dec!(100), dec!(30)));
        rec.forget("0xaa");
        assert!(rec.snapshots.is_empty());
        assert!(rec.alerted.is_empty());
    }

    #[test]
    fn test_same_sign() {
        assert!(same_sign(dec!(1), dec!(2)));
        assert!(same_sign(dec!(-1), dec!(-0.5)));
        assert!(!same_sign(dec!(1), dec!(-1)));
        assert!(!same_sign(dec!(0), dec!(1)));
    }
}
