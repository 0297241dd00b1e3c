//! Channel message types for the actor architecture.
//!
//! Data flow:
//!   downstream client ──RouterCmd──→ Router ──MuxCommand──→ UpstreamMux
//!   UpstreamMux ──UpstreamFrame──→ Router ──TrackerCmd::Push──→ Tracker
//!                                         └─ReconcilerMsg──→ Reconciler
//!   Tracker / Reconciler ──NotifyEvent──→ Notifier ──ChatMessage──→ ChatClient

use rust_decimal::Decimal;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::tracking::state_machine::OrderContext;

pub type ClientId = Uuid;

// ─────────────────────────────────────────────────────────
// Upstream subscriptions (Router → UpstreamMux)
// ─────────────────────────────────────────────────────────

/// One upstream subscription, in typed form.
#[derive(Debug, Clone)]
pub enum Subscription {
    AllMids,
    /// Per-user order/fill event stream (`userEvents`).
    UserEvents { user: String },
    /// Per-user account snapshot stream (`webData2`).
    AccountSnapshot { user: String },
    Candle { coin: String, interval: String },
    /// Client-supplied subscription object, forwarded verbatim.
    Raw(Value),
}

impl Subscription {
    /// The `subscription` payload of a subscribe/unsubscribe frame.
    pub fn payload(&self) -> Value {
        match self {
            Subscription::AllMids => json!({"type": "allMids"}),
            Subscription::UserEvents { user } => {
                json!({"type": "userEvents", "user": user})
            }
            Subscription::AccountSnapshot { user } => {
                json!({"type": "webData2", "user": user})
            }
            Subscription::Candle { coin, interval } => {
                json!({"type": "candle", "coin": coin, "interval": interval})
            }
            Subscription::Raw(value) => value.clone(),
        }
    }

    /// Canonical identity for per-(channel, user) dedup.
    pub fn key(&self) -> String {
        match self {
            Subscription::AllMids => "allMids".to_string(),
            Subscription::UserEvents { user } => format!("userEvents:{user}"),
            Subscription::AccountSnapshot { user } => format!("webData2:{user}"),
            Subscription::Candle { coin, interval } => format!("candle:{coin}:{interval}"),
            Subscription::Raw(value) => format!("raw:{value}"),
        }
    }
}

#[derive(Debug, Clone)]
pub enum MuxCommand {
    Subscribe(Subscription),
    Unsubscribe(Subscription),
}

// ─────────────────────────────────────────────────────────
// Demuxed upstream frames (UpstreamMux → Router)
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub enum UpstreamFrame {
    /// `allMids` — global price tape, broadcast to every client.
    PriceAll(Value),
    /// `webData2` — per-user account snapshot.
    AccountSnapshot { user: String, data: Value },
    /// `userEvents` — per-user fills and order status changes.
    UserEvents { user: String, data: Value },
    /// `subscriptionResponse` — log only.
    SubscriptionAck(Value),
    /// Anything else, forwarded raw.
    Other { channel: String, data: Value },
}

// ─────────────────────────────────────────────────────────
// Router commands (client handlers → Router)
// ─────────────────────────────────────────────────────────

#[derive(Debug)]
pub enum RouterCmd {
    Register {
        client: ClientId,
        tx: mpsc::Sender<String>,
    },
    SubscribeUser {
        client: ClientId,
        user: String,
    },
    UnsubscribeUser {
        client: ClientId,
        user: String,
    },
    SubscribeCandle {
        client: ClientId,
        coin: String,
        interval: String,
    },
    UnsubscribeRaw {
        client: ClientId,
        subscription: Value,
    },
    Disconnect {
        client: ClientId,
    },
}

// ─────────────────────────────────────────────────────────
// Tracker commands (server routes + Router → Tracker)
// ─────────────────────────────────────────────────────────

#[derive(Debug)]
pub enum TrackerCmd {
    /// Register an order the signing endpoint already submitted.
    Track {
        context: OrderContext,
        reply: oneshot::Sender<bool>,
    },
    StopTracking {
        tracking_id: String,
        reason: String,
        reply: oneshot::Sender<bool>,
    },
    /// A demuxed `userEvents` frame for one user.
    Push { user: String, data: Value },
    Details {
        tracking_id: String,
        reply: oneshot::Sender<Option<Value>>,
    },
    Stats {
        reply: oneshot::Sender<Value>,
    },
}

// ─────────────────────────────────────────────────────────
// Reconciler messages (Router → Reconciler)
// ─────────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ReconcilerMsg {
    /// A demuxed `webData2` frame for one user.
    Snapshot { user: String, data: Value },
    /// Last downstream subscriber for this user went away.
    Forget { user: String },
}

// ─────────────────────────────────────────────────────────
// Notification events (Tracker / Reconciler → Notifier)
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub enum NotifyEvent {
    OrderFilled {
        user: String,
        tracking_id: String,
        coin: String,
        is_buy: bool,
        fill_price: Decimal,
        total_filled: Decimal,
        detection: &'static str,
    },
    OrderPartiallyFilled {
        user: String,
        tracking_id: String,
        coin: String,
        is_buy: bool,
        fill_price: Decimal,
        fill_size: Decimal,
        total_filled: Decimal,
        remaining: Decimal,
        size: Decimal,
    },
    OrderCancelled {
        user: String,
        tracking_id: String,
        coin: String,
        is_buy: bool,
        price: Decimal,
        size: Decimal,
        reason: String,
        detection: &'static str,
    },
    OrderRejected {
        user: String,
        tracking_id: String,
        coin: String,
        is_buy: bool,
        price: Decimal,
        size: Decimal,
        reason: String,
    },
    /// Tracker stopped following an order (terminal state or TTL). Log only.
    TrackingCompleted {
        user: String,
        tracking_id: String,
        final_state: String,
        push_events: u32,
        polls: u32,
    },
    PositionClosed {
        user: String,
        coin: String,
        exit_price: Decimal,
        closed_size: Decimal,
        realized_pnl: Decimal,
    },
    PnlThreshold {
        user: String,
        coin: String,
        threshold: u32,
        pnl_pct: f64,
        unrealized_pnl: Decimal,
    },
    LiquidationWarning {
        user: String,
        margin_ratio: f64,
    },
}

impl NotifyEvent {
    pub fn user(&self) -> &str {
        match self {
            NotifyEvent::OrderFilled { user, .. }
            | NotifyEvent::OrderPartiallyFilled { user, .. }
            | NotifyEvent::OrderCancelled { user, .. }
            | NotifyEvent::OrderRejected { user, .. }
            | NotifyEvent::TrackingCompleted { user, .. }
            | NotifyEvent::PositionClosed { user, .. }
            | NotifyEvent::PnlThreshold { user, .. }
            | NotifyEvent::LiquidationWarning { user, .. } => user,
        }
    }

    /// Stable event-kind tag, used in dedup keys and stats.
    pub fn kind(&self) -> &'static str {
        match self {
            NotifyEvent::OrderFilled { .. } => "order_filled",
            NotifyEvent::OrderPartiallyFilled { .. } => "order_partially_filled",
            NotifyEvent::OrderCancelled { .. } => "order_cancelled",
            NotifyEvent::OrderRejected { .. } => "order_rejected",
            NotifyEvent::TrackingCompleted { .. } => "tracking_completed",
            NotifyEvent::PositionClosed { .. } => "position_closed",
            NotifyEvent::PnlThreshold { .. } => "pnl_threshold",
            NotifyEvent::LiquidationWarning { .. } => "liquidation_warning",
        }
    }

    /// Asset the event is about, empty for account-level events.
    pub fn coin(&self) -> &str {
        match self {
            NotifyEvent::OrderFilled { coin, .. }
            | NotifyEvent::OrderPartiallyFilled { coin, .. }
            | NotifyEvent::OrderCancelled { coin, .. }
            | NotifyEvent::OrderRejected { coin, .. }
            | NotifyEvent::PositionClosed { coin, .. }
            | NotifyEvent::PnlThreshold { coin, .. } => coin,
            NotifyEvent::TrackingCompleted { .. } | NotifyEvent::LiquidationWarning { .. } => "",
        }
    }

    /// USD notional used against the per-user minimum, where one applies.
    pub fn notional(&self) -> Option<Decimal> {
        match self {
            NotifyEvent::OrderFilled {
                fill_price,
                total_filled,
                ..
            } => Some(fill_price * total_filled),
            NotifyEvent::OrderPartiallyFilled {
                fill_price,
                fill_size,
                ..
            } => Some(fill_price * fill_size),
            NotifyEvent::OrderCancelled { price, size, .. }
            | NotifyEvent::OrderRejected { price, size, .. } => Some(price * size),
            NotifyEvent::PositionClosed { realized_pnl, .. } => Some(realized_pnl.abs()),
            NotifyEvent::PnlThreshold { unrealized_pnl, .. } => Some(unrealized_pnl.abs()),
            NotifyEvent::TrackingCompleted { .. } | NotifyEvent::LiquidationWarning { .. } => None,
        }
    }
}

// ─────────────────────────────────────────────────────────
// Outbound chat messages (Notifier → ChatClient)
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub chat_id: String,
    pub text: String,
}
