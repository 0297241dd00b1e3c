//! Hybrid order tracker.
//!
//! Binds two evidence sources into state-machine transitions for the
//! tracked order cohort:
//!   - push: demuxed `userEvents` frames (fills + order status changes),
//!   - pull: batched `/info` polling, used as a fallback when the push
//!     side has gone quiet for longer than `websocket_timeout`.
//!
//! Push fills are correlated to locally minted tracking ids either by the
//! exchange order id or, before that id is known, by (asset, size, recency);
//! on a parameter match the exchange id is bound for future correlation.
//! All tracker and state-machine mutations happen inside this actor, so the
//! polling loop batches queries per user but applies transitions one order
//! at a time.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::assets::AssetCatalog;
use crate::dedup::SeenWindow;
use crate::hyperliquid::api::{order_oid, Fill, InfoClient};
use crate::messages::{NotifyEvent, TrackerCmd};
use crate::tracking::state_machine::{
    EventData, EventSource, OrderContext, OrderEvent, OrderState, OrderStateMachine,
};

const CLEANUP_INTERVAL: Duration = Duration::from_secs(60);
const TERMINAL_RETENTION: chrono::Duration = chrono::Duration::hours(1);
/// Parameter-match correlation only applies to freshly submitted orders.
const CORRELATION_WINDOW: chrono::Duration = chrono::Duration::minutes(5);
const RECENT_EVENT_LIMIT: usize = 10;
/// Fill replay protection across upstream reconnects.
const FILL_DEDUP_TTL: Duration = Duration::from_secs(15 * 60);
const FILL_DEDUP_CAPACITY: usize = 50_000;

// ─────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackingStrategy {
    WebsocketOnly,
    PollingOnly,
    Hybrid,
}

impl TrackingStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            TrackingStrategy::WebsocketOnly => "websocket_only",
            TrackingStrategy::PollingOnly => "polling_only",
            TrackingStrategy::Hybrid => "hybrid",
        }
    }
}

#[derive(Debug, Clone)]
pub struct TrackerConfig {
    pub strategy: TrackingStrategy,
    /// How long one order is followed before the tracker gives up.
    pub tracking_duration: Duration,
    pub polling_interval: Duration,
    /// Push silence after which the polling fallback kicks in (Hybrid).
    pub websocket_timeout: Duration,
    pub max_concurrent_orders: usize,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            strategy: TrackingStrategy::Hybrid,
            tracking_duration: Duration::from_secs(3600),
            polling_interval: Duration::from_secs(15),
            websocket_timeout: Duration::from_secs(45),
            max_concurrent_orders: 500,
        }
    }
}

// ─────────────────────────────────────────────────────────
// Per-order tracking state
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct EventRecord {
    at: DateTime<Utc>,
    source: EventSource,
    summary: String,
}

#[derive(Debug)]
struct TrackedOrder {
    created: Instant,
    last_push: Option<Instant>,
    last_poll: Option<Instant>,
    push_events: u32,
    polls: u32,
    active: bool,
    recent: VecDeque<EventRecord>,
}

impl TrackedOrder {
    fn new() -> Self {
        Self {
            created: Instant::now(),
            last_push: None,
            last_poll: None,
            push_events: 0,
            polls: 0,
            active: true,
            recent: VecDeque::new(),
        }
    }

    fn should_continue(&self, state: OrderState, cfg: &TrackerConfig) -> bool {
        self.active && self.created.elapsed() < cfg.tracking_duration && !state.is_terminal()
    }

    fn use_polling_fallback(&self, cfg: &TrackerConfig) -> bool {
        match cfg.strategy {
            TrackingStrategy::PollingOnly => true,
            TrackingStrategy::WebsocketOnly => false,
            TrackingStrategy::Hybrid => match self.last_push {
                Some(last) => last.elapsed() > cfg.websocket_timeout,
                // No push ever received: fall back once the order has aged
                // past the timeout.
                None => self.created.elapsed() > cfg.websocket_timeout,
            },
        }
    }

    fn record(&mut self, source: EventSource, summary: String) {
        self.recent.push_back(EventRecord {
            at: Utc::now(),
            source,
            summary,
        });
        while self.recent.len() > RECENT_EVENT_LIMIT {
            self.recent.pop_front();
        }
    }
}

// ─────────────────────────────────────────────────────────
// Actor
// ─────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct TrackerStats {
    orders_tracked: u64,
    push_events: u64,
    polls_completed: u64,
    notifications_sent: u64,
    orders_completed: u64,
    invalid_transitions: u64,
    correlations: u64,
}

pub struct HybridTracker {
    cfg: TrackerConfig,
    api: Arc<InfoClient>,
    assets: Arc<AssetCatalog>,
    machine: OrderStateMachine,
    trackers: HashMap<String, TrackedOrder>,
    seen_fills: SeenWindow,
    cmd_rx: mpsc::Receiver<TrackerCmd>,
    notify_tx: mpsc::Sender<NotifyEvent>,
    stats: TrackerStats,
}

impl HybridTracker {
    pub fn new(
        cfg: TrackerConfig,
        api: Arc<InfoClient>,
        assets: Arc<AssetCatalog>,
        cmd_rx: mpsc::Receiver<TrackerCmd>,
        notify_tx: mpsc::Sender<NotifyEvent>,
    ) -> Self {
        Self {
            cfg,
            api,
            assets,
            machine: OrderStateMachine::new(),
            trackers: HashMap::new(),
            seen_fills: SeenWindow::new(FILL_DEDUP_TTL, FILL_DEDUP_CAPACITY),
            cmd_rx,
            notify_tx,
            stats: TrackerStats::default(),
        }
    }

    /// Actor main loop: commands, polling ticks, cleanup ticks.
    pub async fn run(mut self) {
        info!(
            "📊 HybridTracker started | strategy={} poll={:?} ws_timeout={:?} max_orders={}",
            self.cfg.strategy.as_str(),
            self.cfg.polling_interval,
            self.cfg.websocket_timeout,
            self.cfg.max_concurrent_orders,
        );

        let mut poll = tokio::time::interval(self.cfg.polling_interval);
        let mut cleanup = tokio::time::interval(CLEANUP_INTERVAL);

        loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => {
                    match cmd {
                        Some(cmd) => self.handle_cmd(cmd).await,
                        None => break,
                    }
                }
                _ = poll.tick() => self.poll_cycle().await,
                _ = cleanup.tick() => self.cleanup().await,
            }
        }

        info!(
            "📊 HybridTracker shutting down | tracked={} completed={} push={} polls={}",
            self.stats.orders_tracked,
            self.stats.orders_completed,
            self.stats.push_events,
            self.stats.polls_completed,
        );
    }

    async fn handle_cmd(&mut self, cmd: TrackerCmd) {
        match cmd {
            TrackerCmd::Track { context, reply } => {
                let ok = self.track(context);
                let _ = reply.send(ok);
            }
            TrackerCmd::StopTracking {
                tracking_id,
                reason,
                reply,
            } => {
                let ok = self.stop_tracking(&tracking_id, &reason);
                let _ = reply.send(ok);
            }
            TrackerCmd::Push { user, data } => self.handle_push(&user, &data).await,
            TrackerCmd::Details { tracking_id, reply } => {
                let _ = reply.send(self.details(&tracking_id));
            }
            TrackerCmd::Stats { reply } => {
                let _ = reply.send(self.statistics());
            }
        }
    }

    // ─────────────────────────────────────────────────
    // Track / stop
    // ─────────────────────────────────────────────────

    fn track(&mut self, context: OrderContext) -> bool {
        if self.trackers.len() >= self.cfg.max_concurrent_orders {
            warn!(
                "Maximum concurrent orders ({}) reached — rejecting {}",
                self.cfg.max_concurrent_orders, context.tracking_id
            );
            return false;
        }
        let tracking_id = context.tracking_id.clone();
        if self.trackers.contains_key(&tracking_id) {
            warn!("Order {tracking_id} already being tracked");
            return false;
        }
        let user = context.user.clone();
        if !self.machine.create(context) {
            return false;
        }
        // Tracking starts after the signing endpoint has submitted the
        // order, so the Submit transition applies immediately.
        self.machine.apply(
            &tracking_id,
            OrderEvent::Submit,
            EventData::from_source(EventSource::Local),
        );
        self.trackers.insert(tracking_id.clone(), TrackedOrder::new());
        self.stats.orders_tracked += 1;
        info!("Started tracking order {tracking_id} for user {user}");
        true
    }

    fn stop_tracking(&mut self, tracking_id: &str, reason: &str) -> bool {
        match self.trackers.get_mut(tracking_id) {
            Some(tracker) => {
                tracker.active = false;
                info!("Stopped tracking order {tracking_id}: {reason}");
                true
            }
            None => {
                warn!("Order {tracking_id} not being tracked");
                false
            }
        }
    }

    // ─────────────────────────────────────────────────
    // Push evidence
    // ─────────────────────────────────────────────────

    async fn handle_push(&mut self, user: &str, data: &Value) {
        let user = user.to_lowercase();
        let user_orders = self.active_orders_of(&user);
        if user_orders.is_empty() {
            return;
        }
        self.stats.push_events += 1;

        if let Some(fills) = data.get("fills").and_then(Value::as_array) {
            for raw in fills {
                match serde_json::from_value::<Fill>(raw.clone()) {
                    Ok(fill) => self.handle_fill(&user, &fill, &user_orders).await,
                    Err(e) => debug!("Skipping unparseable fill: {e}"),
                }
            }
        }

        for entry in order_entries(data) {
            self.handle_order_status(&entry, &user_orders).await;
        }

        // Push activity feeds the websocket-alive heuristic for every order
        // of this user, matched or not.
        for tracking_id in &user_orders {
            if let Some(tracker) = self.trackers.get_mut(tracking_id) {
                tracker.last_push = Some(Instant::now());
                tracker.push_events += 1;
                tracker.record(EventSource::Push, "user event frame".to_string());
            }
        }
    }

    async fn handle_fill(&mut self, user: &str, fill: &Fill, user_orders: &[String]) {
        if fill.sz <= Decimal::ZERO {
            return;
        }
        if !self
            .seen_fills
            .insert(format!("{user}:{}", fill.dedup_key()))
        {
            debug!("Dedup: skipping replayed fill oid={}", fill.oid);
            return;
        }

        let tracking_id = match self.correlate(fill, user_orders) {
            Some(id) => id,
            None => return,
        };

        let (event, state) = match self.machine.context(&tracking_id) {
            Some(ctx) => {
                let event = if ctx.remaining_size > fill.sz {
                    OrderEvent::PartialFill
                } else {
                    OrderEvent::CompleteFill
                };
                (event, ctx.state)
            }
            None => return,
        };

        // A fill is proof the order made it onto the book; confirm open
        // before a partial fill when the confirmation frame never arrived.
        if event == OrderEvent::PartialFill && state == OrderState::Submitted {
            self.machine.apply(
                &tracking_id,
                OrderEvent::ConfirmOpen,
                EventData::from_source(EventSource::Push),
            );
        }

        if self
            .machine
            .apply(
                &tracking_id,
                event,
                EventData::fill(fill.sz, fill.px, EventSource::Push),
            )
            .is_none()
        {
            self.stats.invalid_transitions += 1;
            return;
        }

        if let Some(tracker) = self.trackers.get_mut(&tracking_id) {
            tracker.record(
                EventSource::Push,
                format!("fill {} @ {}", fill.sz, fill.px),
            );
        }

        let Some(ctx) = self.machine.context(&tracking_id) else {
            return;
        };
        let coin = self.assets.display(ctx.asset_index);
        let event = match event {
            OrderEvent::CompleteFill => NotifyEvent::OrderFilled {
                user: ctx.user.clone(),
                tracking_id: tracking_id.clone(),
                coin,
                is_buy: ctx.is_buy,
                fill_price: fill.px,
                total_filled: ctx.filled_size,
                detection: "websocket",
            },
            _ => NotifyEvent::OrderPartiallyFilled {
                user: ctx.user.clone(),
                tracking_id: tracking_id.clone(),
                coin,
                is_buy: ctx.is_buy,
                fill_price: fill.px,
                fill_size: fill.sz,
                total_filled: ctx.filled_size,
                remaining: ctx.remaining_size,
                size: ctx.size,
            },
        };
        self.notify(event).await;
    }

    /// Resolve a fill to a tracked order. Exchange-id match first; orders
    /// that have not learned their exchange id yet match on (asset, size,
    /// recency) and get the id bound for future correlation.
    fn correlate(&mut self, fill: &Fill, user_orders: &[String]) -> Option<String> {
        let oid = fill.oid.to_string();

        for tracking_id in user_orders {
            if let Some(ctx) = self.machine.context(tracking_id) {
                if ctx.exchange_order_id.as_deref() == Some(oid.as_str()) {
                    return Some(tracking_id.clone());
                }
            }
        }

        let fill_asset = self.assets.index_of(&fill.coin);
        for tracking_id in user_orders {
            let Some(ctx) = self.machine.context(tracking_id) else {
                continue;
            };
            if ctx.exchange_order_id.is_some() {
                continue;
            }
            let asset_matches = fill_asset == Some(ctx.asset_index);
            let size_matches = (fill.sz - ctx.size).abs() < dec!(0.001);
            let fresh = Utc::now() - ctx.submitted_at < CORRELATION_WINDOW;
            if asset_matches && size_matches && fresh {
                if let Some(ctx) = self.machine.context_mut(tracking_id) {
                    ctx.exchange_order_id = Some(oid.clone());
                }
                self.stats.correlations += 1;
                info!("Correlated order {tracking_id} with exchange order id {oid}");
                return Some(tracking_id.clone());
            }
        }

        None
    }

    async fn handle_order_status(&mut self, entry: &Value, user_orders: &[String]) {
        let Some(oid) = order_oid(entry) else {
            return;
        };
        let status = entry
            .get("status")
            .or_else(|| entry.get("order").and_then(|o| o.get("status")))
            .and_then(Value::as_str)
            .unwrap_or("unknown");

        let oid_str = oid.to_string();
        let tracking_id = user_orders.iter().find(|id| {
            self.machine
                .context(id)
                .and_then(|ctx| ctx.exchange_order_id.as_deref())
                == Some(oid_str.as_str())
        });
        let Some(tracking_id) = tracking_id.cloned() else {
            return;
        };

        match status {
            "open" => {
                if matches!(
                    self.machine.state_of(&tracking_id),
                    Some(OrderState::Pending) | Some(OrderState::Submitted)
                ) {
                    self.machine.apply(
                        &tracking_id,
                        OrderEvent::ConfirmOpen,
                        EventData::from_source(EventSource::Push),
                    );
                }
            }
            "cancelled" | "canceled" => {
                let applied = self.machine.apply(
                    &tracking_id,
                    OrderEvent::Cancel,
                    EventData::with_reason("exchange cancelled", EventSource::Push),
                );
                if applied.is_some() {
                    self.notify_cancelled(&tracking_id, "exchange cancelled", "websocket")
                        .await;
                } else {
                    self.stats.invalid_transitions += 1;
                }
            }
            "rejected" => {
                let reason = entry
                    .get("rejectReason")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown")
                    .to_string();
                let applied = self.machine.apply(
                    &tracking_id,
                    OrderEvent::Reject,
                    EventData::with_reason(reason.clone(), EventSource::Push),
                );
                if applied.is_some() {
                    if let Some(ctx) = self.machine.context(&tracking_id) {
                        let event = NotifyEvent::OrderRejected {
                            user: ctx.user.clone(),
                            tracking_id: tracking_id.clone(),
                            coin: self.assets.display(ctx.asset_index),
                            is_buy: ctx.is_buy,
                            price: ctx.price,
                            size: ctx.size,
                            reason,
                        };
                        self.notify(event).await;
                    }
                } else {
                    self.stats.invalid_transitions += 1;
                }
            }
            other => debug!("Ignoring order status {other} for oid {oid}"),
        }
    }

    // ─────────────────────────────────────────────────
    // Polling fallback
    // ─────────────────────────────────────────────────

    async fn poll_cycle(&mut self) {
        // Group due orders by user for batched queries.
        let mut by_user: HashMap<String, Vec<String>> = HashMap::new();
        for (tracking_id, tracker) in &self.trackers {
            let Some(ctx) = self.machine.context(tracking_id) else {
                continue;
            };
            if tracker.should_continue(ctx.state, &self.cfg)
                && tracker.use_polling_fallback(&self.cfg)
            {
                by_user
                    .entry(ctx.user.clone())
                    .or_default()
                    .push(tracking_id.clone());
            }
        }

        for (user, tracking_ids) in by_user {
            self.poll_user(&user, &tracking_ids).await;
        }
    }

    async fn poll_user(&mut self, user: &str, tracking_ids: &[String]) {
        let mut by_oid: HashMap<u64, String> = HashMap::new();
        let mut earliest: Option<DateTime<Utc>> = None;
        for tracking_id in tracking_ids {
            if let Some(ctx) = self.machine.context(tracking_id) {
                if let Some(oid) = ctx
                    .exchange_order_id
                    .as_deref()
                    .and_then(|s| s.parse::<u64>().ok())
                {
                    by_oid.insert(oid, tracking_id.clone());
                    earliest = Some(match earliest {
                        Some(at) => at.min(ctx.submitted_at),
                        None => ctx.submitted_at,
                    });
                }
            }
        }
        if by_oid.is_empty() {
            return;
        }

        let oids: Vec<u64> = by_oid.keys().copied().collect();
        let statuses = match self.api.batch_order_statuses(user, &oids).await {
            Ok(statuses) => statuses,
            Err(e) => {
                warn!("Polling failed for user {user}: {e}");
                return;
            }
        };
        self.stats.polls_completed += 1;

        for tracking_id in by_oid.values() {
            if let Some(tracker) = self.trackers.get_mut(tracking_id) {
                tracker.last_poll = Some(Instant::now());
                tracker.polls += 1;
                tracker.record(EventSource::Poll, "batch status poll".to_string());
            }
        }

        let mut missing: Vec<String> = Vec::new();
        for (oid, status) in &statuses {
            let Some(tracking_id) = by_oid.get(oid) else {
                continue;
            };
            match status {
                Some(_) => {
                    // Still on the book; confirm open if we never saw it.
                    if matches!(
                        self.machine.state_of(tracking_id),
                        Some(OrderState::Pending) | Some(OrderState::Submitted)
                    ) {
                        self.machine.apply(
                            tracking_id,
                            OrderEvent::ConfirmOpen,
                            EventData::from_source(EventSource::Poll),
                        );
                    }
                }
                None => missing.push(tracking_id.clone()),
            }
        }

        if missing.is_empty() {
            return;
        }
        // Missing from open orders: fills since submission decide between
        // a synthetic complete fill and a cancel.
        let fills = match self.api.user_fills(user, earliest).await {
            Ok(fills) => fills,
            Err(e) => {
                warn!("Fill lookup failed for user {user}: {e}");
                return;
            }
        };
        for tracking_id in missing {
            self.resolve_missing(&tracking_id, &fills).await;
        }
    }

    /// The order vanished from open orders; decide what happened to it.
    async fn resolve_missing(&mut self, tracking_id: &str, fills: &[Fill]) {
        let Some(oid) = self
            .machine
            .context(tracking_id)
            .and_then(|ctx| ctx.exchange_order_id.clone())
        else {
            return;
        };

        let matching: Vec<&Fill> = fills
            .iter()
            .filter(|f| f.oid.to_string() == oid)
            .collect();

        if matching.is_empty() {
            let applied = self.machine.apply(
                tracking_id,
                OrderEvent::Cancel,
                EventData::with_reason("not_in_open_orders", EventSource::Poll),
            );
            if applied.is_some() {
                self.notify_cancelled(tracking_id, "not_in_open_orders", "api_poll")
                    .await;
            } else {
                self.stats.invalid_transitions += 1;
            }
            return;
        }

        let total: Decimal = matching.iter().map(|f| f.sz).sum();
        if total <= Decimal::ZERO {
            return;
        }
        let volume: Decimal = matching.iter().map(|f| f.px * f.sz).sum();
        let avg_price = volume / total;

        let applied = self.machine.apply(
            tracking_id,
            OrderEvent::CompleteFill,
            EventData::fill(total, avg_price, EventSource::Poll),
        );
        if applied.is_none() {
            self.stats.invalid_transitions += 1;
            return;
        }
        if let Some(ctx) = self.machine.context(tracking_id) {
            let event = NotifyEvent::OrderFilled {
                user: ctx.user.clone(),
                tracking_id: tracking_id.to_string(),
                coin: self.assets.display(ctx.asset_index),
                is_buy: ctx.is_buy,
                fill_price: avg_price,
                total_filled: ctx.filled_size,
                detection: "api_poll",
            };
            self.notify(event).await;
        }
    }

    // ─────────────────────────────────────────────────
    // Cleanup
    // ─────────────────────────────────────────────────

    async fn cleanup(&mut self) {
        let stale: Vec<String> = self
            .trackers
            .iter()
            .filter(|(tracking_id, tracker)| {
                let state = self
                    .machine
                    .state_of(tracking_id)
                    .unwrap_or(OrderState::Pending);
                !tracker.should_continue(state, &self.cfg)
            })
            .map(|(id, _)| id.clone())
            .collect();

        for tracking_id in &stale {
            let (user, final_state) = self
                .machine
                .context(tracking_id)
                .map(|ctx| (ctx.user.clone(), ctx.state.as_str().to_string()))
                .unwrap_or_else(|| ("unknown".to_string(), "unknown".to_string()));
            let tracker = self.trackers.remove(tracking_id);
            let (push_events, polls) = tracker
                .map(|t| (t.push_events, t.polls))
                .unwrap_or_default();
            self.stats.orders_completed += 1;
            self.notify(NotifyEvent::TrackingCompleted {
                user,
                tracking_id: tracking_id.clone(),
                final_state,
                push_events,
                polls,
            })
            .await;
        }
        if !stale.is_empty() {
            info!("Cleaned up {} completed order trackers", stale.len());
        }

        self.machine.prune_terminal(TERMINAL_RETENTION);
    }

    // ─────────────────────────────────────────────────
    // Plumbing
    // ─────────────────────────────────────────────────

    fn active_orders_of(&self, user: &str) -> Vec<String> {
        self.trackers
            .iter()
            .filter(|(tracking_id, tracker)| {
                tracker.active
                    && self
                        .machine
                        .context(tracking_id)
                        .map(|ctx| ctx.user == user)
                        .unwrap_or(false)
            })
            .map(|(id, _)| id.clone())
            .collect()
    }

    async fn notify_cancelled(&mut self, tracking_id: &str, reason: &str, detection: &'static str) {
        let Some(ctx) = self.machine.context(tracking_id) else {
            return;
        };
        let event = NotifyEvent::OrderCancelled {
            user: ctx.user.clone(),
            tracking_id: tracking_id.to_string(),
            coin: self.assets.display(ctx.asset_index),
            is_buy: ctx.is_buy,
            price: ctx.price,
            size: ctx.size,
            reason: reason.to_string(),
            detection,
        };
        self.notify(event).await;
    }

    async fn notify(&mut self, event: NotifyEvent) {
        self.stats.notifications_sent += 1;
        if self.notify_tx.send(event).await.is_err() {
            warn!("Notifier channel closed — dropping event");
        }
    }

    fn details(&self, tracking_id: &str) -> Option<Value> {
        let tracker = self.trackers.get(tracking_id)?;
        let ctx = self.machine.context(tracking_id)?;
        Some(json!({
            "tracking_id": tracking_id,
            "current_state": ctx.state.as_str(),
            "previous_state": ctx.previous_state.map(OrderState::as_str),
            "user_address": ctx.user,
            "exchange_order_id": ctx.exchange_order_id,
            "is_active": tracker.active,
            "websocket_events_received": tracker.push_events,
            "api_polls_completed": tracker.polls,
            "should_use_polling": tracker.use_polling_fallback(&self.cfg),
            "order_context": {
                "asset_index": ctx.asset_index,
                "coin": self.assets.display(ctx.asset_index),
                "is_buy": ctx.is_buy,
                "price": ctx.price.to_string(),
                "size": ctx.size.to_string(),
                "filled_size": ctx.filled_size.to_string(),
                "remaining_size": ctx.remaining_size.to_string(),
                "avg_fill_price": ctx.avg_fill_price.map(|p| p.to_string()),
                "submitted_at": ctx.submitted_at.to_rfc3339(),
                "last_updated": ctx.last_updated.to_rfc3339(),
            },
            "state_history": ctx.transitions.iter().map(|t| json!({
                "from": t.from.as_str(),
                "to": t.to.as_str(),
                "event": t.event.as_str(),
                "source": t.source.as_str(),
                "at": t.at.to_rfc3339(),
            })).collect::<Vec<_>>(),
            "recent_events": tracker.recent.iter().map(|e| json!({
                "at": e.at.to_rfc3339(),
                "source": e.source.as_str(),
                "summary": e.summary,
            })).collect::<Vec<_>>(),
        }))
    }

    fn statistics(&self) -> Value {
        let active = self.trackers.values().filter(|t| t.active).count();
        json!({
            "orders_tracked": self.stats.orders_tracked,
            "websocket_events_processed": self.stats.push_events,
            "api_polls_completed": self.stats.polls_completed,
            "notifications_sent": self.stats.notifications_sent,
            "orders_completed": self.stats.orders_completed,
            "invalid_transitions": self.stats.invalid_transitions,
            "correlations": self.stats.correlations,
            "active_orders": active,
            "total_orders_in_memory": self.trackers.len(),
            "state_machine": self.machine.statistics(),
            "config": {
                "strategy": self.cfg.strategy.as_str(),
                "polling_interval_seconds": self.cfg.polling_interval.as_secs(),
                "tracking_duration_seconds": self.cfg.tracking_duration.as_secs(),
                "websocket_timeout_seconds": self.cfg.websocket_timeout.as_secs(),
                "max_concurrent_orders": self.cfg.max_concurrent_orders,
            },
        })
    }
}

/// Order-status entries inside a `userEvents` frame: either an `orders`
/// array or a single `order` object.
fn order_entries(data: &Value) -> Vec<Value> {
    if let Some(entries) = data.get("orders").and_then(Value::as_array) {
        return entries.clone();
    }
    if let Some(entry) = data.get("order") {
        return vec![entry.clone()];
    }
    Vec::new()
}
