//! Order lifecycle state machine.
//!
//! Pure and synchronous: the transition table is a function, mutations go
//! through [`OrderStateMachine::apply`], and everything async (push frames,
//! polling, notifications) lives in the tracker that owns this machine.
//! Invalid events never transition; they are logged and dropped.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

/// Bounded length of per-order transition history.
const HISTORY_LIMIT: usize = 10;

// ─────────────────────────────────────────────────────────
// States and events
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderState {
    Pending,
    Submitted,
    Open,
    PartiallyFilled,
    Filled,
    Cancelled,
    Rejected,
    Expired,
    Failed,
}

impl OrderState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OrderState::Filled
                | OrderState::Cancelled
                | OrderState::Rejected
                | OrderState::Expired
                | OrderState::Failed
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OrderState::Pending => "pending",
            OrderState::Submitted => "submitted",
            OrderState::Open => "open",
            OrderState::PartiallyFilled => "partially_filled",
            OrderState::Filled => "filled",
            OrderState::Cancelled => "cancelled",
            OrderState::Rejected => "rejected",
            OrderState::Expired => "expired",
            OrderState::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderEvent {
    Submit,
    ConfirmOpen,
    PartialFill,
    CompleteFill,
    Cancel,
    Reject,
    Expire,
    Fail,
}

impl OrderEvent {
    pub fn as_str(self) -> &'static str {
        match self {
            OrderEvent::Submit => "submit",
            OrderEvent::ConfirmOpen => "confirm_open",
            OrderEvent::PartialFill => "partial_fill",
            OrderEvent::CompleteFill => "complete_fill",
            OrderEvent::Cancel => "cancel",
            OrderEvent::Reject => "reject",
            OrderEvent::Expire => "expire",
            OrderEvent::Fail => "fail",
        }
    }
}

/// The transition table. Everything not listed is invalid.
pub fn transition(state: OrderState, event: OrderEvent) -> Option<OrderState> {
    use OrderEvent::*;
    use OrderState::*;

    match (state, event) {
        (Pending, Submit) => Some(Submitted),
        (Pending, Fail) => Some(Failed),

        (Submitted, ConfirmOpen) => Some(Open),
        // Same-tick fill: the first push may already complete the order.
        (Submitted, CompleteFill) => Some(Filled),
        (Submitted, Reject) => Some(Rejected),
        (Submitted, Fail) => Some(Failed),

        (Open, PartialFill) => Some(PartiallyFilled),
        (Open, CompleteFill) => Some(Filled),
        (Open, Cancel) => Some(Cancelled),
        (Open, Expire) => Some(Expired),
        (Open, Reject) => Some(Rejected),

        (PartiallyFilled, PartialFill) => Some(PartiallyFilled),
        (PartiallyFilled, CompleteFill) => Some(Filled),
        (PartiallyFilled, Cancel) => Some(Cancelled),
        (PartiallyFilled, Expire) => Some(Expired),

        // Terminal states have no outgoing transitions.
        _ => None,
    }
}

// ─────────────────────────────────────────────────────────
// Order context
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderType {
    Limit,
    Trigger,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeInForce {
    Gtc,
    Ioc,
    Alo,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventSource {
    Push,
    Poll,
    Local,
}

impl EventSource {
    pub fn as_str(self) -> &'static str {
        match self {
            EventSource::Push => "websocket",
            EventSource::Poll => "api_poll",
            EventSource::Local => "local",
        }
    }
}

/// Data carried alongside an event into the transition.
#[derive(Debug, Clone, Default)]
pub struct EventData {
    pub fill_size: Option<Decimal>,
    pub fill_price: Option<Decimal>,
    pub reason: Option<String>,
    pub source: Option<EventSource>,
}

impl EventData {
    pub fn fill(size: Decimal, price: Decimal, source: EventSource) -> Self {
        Self {
            fill_size: Some(size),
            fill_price: Some(price),
            source: Some(source),
            ..Default::default()
        }
    }

    pub fn with_reason(reason: impl Into<String>, source: EventSource) -> Self {
        Self {
            reason: Some(reason.into()),
            source: Some(source),
            ..Default::default()
        }
    }

    pub fn from_source(source: EventSource) -> Self {
        Self {
            source: Some(source),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone)]
pub struct TransitionRecord {
    pub from: OrderState,
    pub to: OrderState,
    pub event: OrderEvent,
    pub source: EventSource,
    pub at: DateTime<Utc>,
}

/// Everything tracked for one order.
///
/// Invariant: `filled_size + remaining_size == size`, `0 ≤ filled_size ≤ size`.
#[derive(Debug, Clone)]
pub struct OrderContext {
    pub tracking_id: String,
    pub exchange_order_id: Option<String>,
    pub user: String,
    pub asset_index: u32,
    pub is_buy: bool,
    pub price: Decimal,
    pub size: Decimal,
    pub filled_size: Decimal,
    pub remaining_size: Decimal,
    pub order_type: OrderType,
    pub time_in_force: TimeInForce,
    pub submitted_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    pub state: OrderState,
    pub previous_state: Option<OrderState>,
    pub cancel_reason: Option<String>,
    pub reject_reason: Option<String>,
    pub failure_reason: Option<String>,
    pub avg_fill_price: Option<Decimal>,
    pub transitions: VecDeque<TransitionRecord>,
}

impl OrderContext {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        tracking_id: impl Into<String>,
        user: impl Into<String>,
        asset_index: u32,
        is_buy: bool,
        price: Decimal,
        size: Decimal,
        order_type: OrderType,
        time_in_force: TimeInForce,
    ) -> Self {
        let now = Utc::now();
        Self {
            tracking_id: tracking_id.into(),
            exchange_order_id: None,
            user: user.into().to_lowercase(),
            asset_index,
            is_buy,
            price,
            size,
            filled_size: Decimal::ZERO,
            remaining_size: size,
            order_type,
            time_in_force,
            submitted_at: now,
            last_updated: now,
            state: OrderState::Pending,
            previous_state: None,
            cancel_reason: None,
            reject_reason: None,
            failure_reason: None,
            avg_fill_price: None,
            transitions: VecDeque::new(),
        }
    }
}

// ─────────────────────────────────────────────────────────
// State machine
// ─────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct OrderStateMachine {
    orders: HashMap<String, OrderContext>,
}

impl OrderStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new order in `Pending`. Rejects duplicate tracking ids.
    pub fn create(&mut self, context: OrderContext) -> bool {
        if self.orders.contains_key(&context.tracking_id) {
            warn!("Order {} already exists", context.tracking_id);
            return false;
        }
        info!(
            "Created order {} in pending state (user={})",
            context.tracking_id, context.user
        );
        self.orders.insert(context.tracking_id.clone(), context);
        true
    }

    pub fn state_of(&self, tracking_id: &str) -> Option<OrderState> {
        self.orders.get(tracking_id).map(|o| o.state)
    }

    pub fn context(&self, tracking_id: &str) -> Option<&OrderContext> {
        self.orders.get(tracking_id)
    }

    pub fn context_mut(&mut self, tracking_id: &str) -> Option<&mut OrderContext> {
        self.orders.get_mut(tracking_id)
    }

    pub fn remove(&mut self, tracking_id: &str) -> Option<OrderContext> {
        self.orders.remove(tracking_id)
    }

    pub fn len(&self) -> usize {
        self.orders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.orders.is_empty()
    }

    /// Apply an event. Returns `(from, to)` on success, `None` when the
    /// event is invalid in the current state (dropped, not reordered).
    pub fn apply(
        &mut self,
        tracking_id: &str,
        event: OrderEvent,
        data: EventData,
    ) -> Option<(OrderState, OrderState)> {
        let order = match self.orders.get_mut(tracking_id) {
            Some(order) => order,
            None => {
                warn!("Order {} not found", tracking_id);
                return None;
            }
        };

        let from = order.state;
        let to = match transition(from, event) {
            Some(to) => to,
            None => {
                warn!(
                    "Invalid event {} for order {} in state {}",
                    event.as_str(),
                    tracking_id,
                    from.as_str()
                );
                return None;
            }
        };

        match event {
            OrderEvent::PartialFill => {
                let fill = data.fill_size.unwrap_or(Decimal::ZERO);
                order.filled_size = (order.filled_size + fill).min(order.size);
                order.remaining_size = order.size - order.filled_size;
                if let Some(px) = data.fill_price {
                    order.avg_fill_price = Some(px);
                }
            }
            OrderEvent::CompleteFill => {
                order.filled_size = order.size;
                order.remaining_size = Decimal::ZERO;
                if let Some(px) = data.fill_price {
                    order.avg_fill_price = Some(px);
                }
            }
            OrderEvent::Cancel => {
                order.cancel_reason = data.reason.clone();
            }
            OrderEvent::Reject => {
                order.reject_reason = data.reason.clone();
            }
            OrderEvent::Fail => {
                order.failure_reason = data.reason.clone();
            }
            OrderEvent::Submit => {
                order.submitted_at = Utc::now();
            }
            OrderEvent::ConfirmOpen | OrderEvent::Expire => {}
        }

        order.previous_state = Some(from);
        order.state = to;
        order.last_updated = Utc::now();

        order.transitions.push_back(TransitionRecord {
            from,
            to,
            event,
            source: data.source.unwrap_or(EventSource::Local),
            at: order.last_updated,
        });
        while order.transitions.len() > HISTORY_LIMIT {
            order.transitions.pop_front();
        }

        info!(
            "Order {} transitioned {} → {} ({})",
            tracking_id,
            from.as_str(),
            to.as_str(),
            event.as_str()
        );
        Some((from, to))
    }

    /// Drop terminal orders whose last update is older than `max_age`.
    pub fn prune_terminal(&mut self, max_age: Duration) -> usize {
        let cutoff = Utc::now() - max_age;
        let stale: Vec<String> = self
            .orders
            .iter()
            .filter(|(_, o)| o.state.is_terminal() && o.last_updated < cutoff)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &stale {
            self.orders.remove(id);
        }
        if !stale.is_empty() {
            debug!("Pruned {} terminal orders", stale.len());
        }
        stale.len()
    }

    pub fn statistics(&self) -> Value {
        let mut by_state: HashMap<&'static str, usize> = HashMap::new();
        let mut terminal = 0usize;
        for order in self.orders.values() {
            *by_state.entry(order.state.as_str()).or_default() += 1;
            if order.state.is_terminal() {
                terminal += 1;
            }
        }
        json!({
            "total_orders": self.orders.len(),
            "active_orders": self.orders.len() - terminal,
            "terminal_orders": terminal,
            "by_state": by_state,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn ctx(id: &str, size: Decimal) -> OrderContext {
        OrderContext::new(
            id,
            "0xAbC",
            4,
            true,
            dec!(2500),
            size,
            OrderType::Limit,
            TimeInForce::Gtc,
        )
    }

    fn push_fill(size: Decimal, price: Decimal) -> EventData {
        EventData::fill(size, price, EventSource::Push)
    }

    #[test]
    fn test_user_lowercased_on_create() {
        let order = ctx("o1", dec!(1));
        assert_eq!(order.user, "0xabc");
    }

    #[test]
    fn test_happy_path_open_then_fill() {
        let mut sm = OrderStateMachine::new();
        assert!(sm.create(ctx("o1", dec!(1.0))));

        assert!(sm
            .apply("o1", OrderEvent::Submit, EventData::from_source(EventSource::Local))
            .is_some());
        assert!(sm
            .apply("o1", OrderEvent::ConfirmOpen, EventData::from_source(EventSource::Push))
            .is_some());
        let (from, to) = sm
            .apply("o1", OrderEvent::CompleteFill, push_fill(dec!(1.0), dec!(2499)))
            .unwrap();
        assert_eq!(from, OrderState::Open);
        assert_eq!(to, OrderState::Filled);

        let order = sm.context("o1").unwrap();
        assert_eq!(order.filled_size, dec!(1.0));
        assert_eq!(order.remaining_size, dec!(0));
    }

    #[test]
    fn test_immediate_fill_skips_open() {
        let mut sm = OrderStateMachine::new();
        sm.create(ctx("o1", dec!(1.0)));
        sm.apply("o1", OrderEvent::Submit, EventData::default());
        let (from, to) = sm
            .apply("o1", OrderEvent::CompleteFill, push_fill(dec!(1.0), dec!(2499)))
            .unwrap();
        assert_eq!(from, OrderState::Submitted);
        assert_eq!(to, OrderState::Filled);
    }

    #[test]
    fn test_partial_fill_arithmetic_holds_invariant() {
        let mut sm = OrderStateMachine::new();
        sm.create(ctx("o2", dec!(2.0)));
        sm.apply("o2", OrderEvent::Submit, EventData::default());
        sm.apply("o2", OrderEvent::ConfirmOpen, EventData::default());

        sm.apply("o2", OrderEvent::PartialFill, push_fill(dec!(0.5), dec!(100)));
        sm.apply("o2", OrderEvent::PartialFill, push_fill(dec!(0.5), dec!(100)));

        let order = sm.context("o2").unwrap();
        assert_eq!(order.state, OrderState::PartiallyFilled);
        assert_eq!(order.filled_size, dec!(1.0));
        assert_eq!(order.remaining_size, dec!(1.0));
        assert_eq!(order.filled_size + order.remaining_size, order.size);
    }

    #[test]
    fn test_partial_fill_capped_at_size() {
        let mut sm = OrderStateMachine::new();
        sm.create(ctx("o3", dec!(1.0)));
        sm.apply("o3", OrderEvent::Submit, EventData::default());
        sm.apply("o3", OrderEvent::ConfirmOpen, EventData::default());

        sm.apply("o3", OrderEvent::PartialFill, push_fill(dec!(5.0), dec!(10)));
        let order = sm.context("o3").unwrap();
        assert_eq!(order.filled_size, dec!(1.0));
        assert_eq!(order.remaining_size, dec!(0));
    }

    #[test]
    fn test_terminal_states_absorb_everything() {
        let mut sm = OrderStateMachine::new();
        sm.create(ctx("o4", dec!(1.0)));
        sm.apply("o4", OrderEvent::Submit, EventData::default());
        sm.apply(
            "o4",
            OrderEvent::Reject,
            EventData::with_reason("bad price", EventSource::Push),
        );
        assert_eq!(sm.state_of("o4"), Some(OrderState::Rejected));

        for event in [
            OrderEvent::Submit,
            OrderEvent::ConfirmOpen,
            OrderEvent::PartialFill,
            OrderEvent::CompleteFill,
            OrderEvent::Cancel,
            OrderEvent::Expire,
            OrderEvent::Fail,
        ] {
            assert!(sm.apply("o4", event, EventData::default()).is_none());
        }
        assert_eq!(sm.state_of("o4"), Some(OrderState::Rejected));
    }

    #[test]
    fn test_cancel_attaches_reason() {
        let mut sm = OrderStateMachine::new();
        sm.create(ctx("o5", dec!(1.0)));
        sm.apply("o5", OrderEvent::Submit, EventData::default());
        sm.apply("o5", OrderEvent::ConfirmOpen, EventData::default());
        sm.apply(
            "o5",
            OrderEvent::Cancel,
            EventData::with_reason("not_in_open_orders", EventSource::Poll),
        );
        let order = sm.context("o5").unwrap();
        assert_eq!(order.cancel_reason.as_deref(), Some("not_in_open_orders"));
        assert_eq!(order.previous_state, Some(OrderState::Open));
    }

    #[test]
    fn test_history_is_bounded() {
        let mut sm = OrderStateMachine::new();
        sm.create(ctx("o6", dec!(100.0)));
        sm.apply("o6", OrderEvent::Submit, EventData::default());
        sm.apply("o6", OrderEvent::ConfirmOpen, EventData::default());
        for _ in 0..30 {
            sm.apply("o6", OrderEvent::PartialFill, push_fill(dec!(0.1), dec!(1)));
        }
        assert!(sm.context("o6").unwrap().transitions.len() <= HISTORY_LIMIT);
    }

    #[test]
    fn test_prune_terminal_keeps_active() {
        let mut sm = OrderStateMachine::new();
        sm.create(ctx("done", dec!(1.0)));
        sm.apply("done", OrderEvent::Submit, EventData::default());
        sm.apply("done", OrderEvent::CompleteFill, push_fill(dec!(1.0), dec!(1)));
        sm.create(ctx("live", dec!(1.0)));

        // Nothing is older than an hour yet.
        assert_eq!(sm.prune_terminal(Duration::hours(1)), 0);
        // With a zero horizon the filled order goes, the live one stays.
        assert_eq!(sm.prune_terminal(Duration::zero()), 1);
        assert!(sm.context("done").is_none());
        assert!(sm.context("live").is_some());
    }
}
