//! Notification emitter.
//!
//! The single funnel from internal events to chat messages. Per event:
//! resolve the user's chat id (drop silently when unlinked), gate on the
//! user's notification settings and minimum notional, collapse duplicates
//! by `(user, asset, event-kind, time-bucket)` — position closes can be
//! observed by both the tracker and the reconciler — then format and hand
//! off to the chat sender.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::dedup::SeenWindow;
use crate::messages::{ChatMessage, NotifyEvent};
use crate::telegram::{LinkStore, NotificationSettings};

/// Duplicate-observation window for the same logical event.
const DEDUP_BUCKET_SECS: i64 = 60;
const DEDUP_TTL: Duration = Duration::from_secs(10 * 60);
const DEDUP_CAPACITY: usize = 10_000;

#[derive(Debug, Default)]
struct NotifierStats {
    received: u64,
    sent: u64,
    dropped_unlinked: u64,
    dropped_disabled: u64,
    dropped_below_min: u64,
    dropped_duplicate: u64,
}

pub struct Notifier {
    rx: mpsc::Receiver<NotifyEvent>,
    links: Arc<LinkStore>,
    chat_tx: mpsc::Sender<ChatMessage>,
    dedup: SeenWindow,
    stats: NotifierStats,
}

impl Notifier {
    pub fn new(
        rx: mpsc::Receiver<NotifyEvent>,
        links: Arc<LinkStore>,
        chat_tx: mpsc::Sender<ChatMessage>,
    ) -> Self {
        Self {
            rx,
            links,
            chat_tx,
            dedup: SeenWindow::new(DEDUP_TTL, DEDUP_CAPACITY),
            stats: NotifierStats::default(),
        }
    }

    pub async fn run(mut self) {
        info!("🔔 Notifier started");
        while let Some(event) = self.rx.recv().await {
            self.handle(event).await;
        }
        info!(
            "🔔 Notifier shutting down | received={} sent={} unlinked={} disabled={} below_min={} duplicate={}",
            self.stats.received,
            self.stats.sent,
            self.stats.dropped_unlinked,
            self.stats.dropped_disabled,
            self.stats.dropped_below_min,
            self.stats.dropped_duplicate,
        );
    }

    async fn handle(&mut self, event: NotifyEvent) {
        self.stats.received += 1;

        // Lifecycle bookkeeping, not user-facing.
        if let NotifyEvent::TrackingCompleted {
            tracking_id,
            final_state,
            push_events,
            polls,
            ..
        } = &event
        {
            info!(
                "Tracking completed for {tracking_id}: state={final_state} push={push_events} polls={polls}"
            );
            return;
        }

        let user = event.user().to_string();
        let Some(chat_id) = self.links.chat_id_for(&user).await else {
            self.stats.dropped_unlinked += 1;
            debug!("No chat link for {user} — dropping {}", event.kind());
            return;
        };
        let settings = self.links.settings_for(&user).await;

        if !category_enabled(&event, &settings) {
            self.stats.dropped_disabled += 1;
            debug!("{} notifications disabled for {user}", event.kind());
            return;
        }

        if let Some(notional) = event.notional() {
            if notional < settings.min_notification_amount {
                self.stats.dropped_below_min += 1;
                debug!(
                    "Notional {notional} below threshold {} for {user}",
                    settings.min_notification_amount
                );
                return;
            }
        }

        let bucket = Utc::now().timestamp() / DEDUP_BUCKET_SECS;
        let key = format!("{user}:{}:{}:{bucket}", event.coin(), event.kind());
        if !self.dedup.insert(key) {
            self.stats.dropped_duplicate += 1;
            debug!("Duplicate {} for {user} — suppressed", event.kind());
            return;
        }

        let text = format_event(&event);
        if self
            .chat_tx
            .send(ChatMessage { chat_id, text })
            .await
            .is_err()
        {
            warn!("Chat channel closed — dropping notification");
            return;
        }
        self.stats.sent += 1;
    }
}

fn category_enabled(event: &NotifyEvent, settings: &NotificationSettings) -> bool {
    match event {
        NotifyEvent::OrderFilled { .. }
        | NotifyEvent::OrderPartiallyFilled { .. }
        | NotifyEvent::OrderCancelled { .. }
        | NotifyEvent::OrderRejected { .. } => settings.fill_notifications,
        NotifyEvent::PositionClosed { .. } | NotifyEvent::PnlThreshold { .. } => {
            settings.pnl_notifications
        }
        NotifyEvent::LiquidationWarning { .. } => settings.liquidation_warnings,
        NotifyEvent::TrackingCompleted { .. } => false,
    }
}

// ─────────────────────────────────────────────────────────
// Message formatting
// ─────────────────────────────────────────────────────────

fn side(is_buy: bool) -> &'static str {
    if is_buy {
        "Buy 📈"
    } else {
        "Sell 📉"
    }
}

fn timestamp() -> String {
    Utc::now().format("%H:%M:%S UTC").to_string()
}

fn format_event(event: &NotifyEvent) -> String {
    match event {
        NotifyEvent::OrderFilled {
            coin,
            is_buy,
            fill_price,
            total_filled,
            detection,
            ..
        } => format!(
            "✅ *Order Filled!*\n\n🎯 *{coin}/USD {}*\n• Price: ${fill_price}\n• Size: {total_filled} {coin}\n• Detection: {detection}\n\n⏰ {}",
            side(*is_buy),
            timestamp(),
        ),
        NotifyEvent::OrderPartiallyFilled {
            coin,
            is_buy,
            fill_price,
            fill_size,
            total_filled,
            remaining,
            size,
            ..
        } => format!(
            "📊 *Partial Fill*\n\n🎯 *{coin}/USD {}*\n• Fill: {fill_size} @ ${fill_price}\n• Total Filled: {total_filled} / {size}\n• Remaining: {remaining}\n\n⏰ {}",
            side(*is_buy),
            timestamp(),
        ),
        NotifyEvent::OrderCancelled {
            coin,
            is_buy,
            price,
            size,
            reason,
            ..
        } => format!(
            "❌ *Order Cancelled*\n\n🎯 *{coin}/USD {}*\n• Price: ${price}\n• Size: {size}\n• Reason: {reason}\n\n⏰ {}",
            side(*is_buy),
            timestamp(),
        ),
        NotifyEvent::OrderRejected {
            coin,
            is_buy,
            price,
            size,
            reason,
            ..
        } => format!(
            "🚫 *Order Rejected*\n\n🎯 *{coin}/USD {}*\n• Price: ${price}\n• Size: {size}\n• Reason: {reason}\n\n⏰ {}",
            side(*is_buy),
            timestamp(),
        ),
        NotifyEvent::PositionClosed {
            coin,
            exit_price,
            closed_size,
            realized_pnl,
            ..
        } => {
            let mood = if realized_pnl.is_sign_negative() {
                "📉"
            } else {
                "🚀"
            };
            format!(
                "{mood} *Position Closed — {coin}/USD*\n\n• Exit: ${exit_price}\n• Size: {closed_size} {coin}\n• Realized P&L: ${realized_pnl}\n\n⏰ {}",
                timestamp(),
            )
        }
        NotifyEvent::PnlThreshold {
            coin,
            threshold,
            pnl_pct,
            unrealized_pnl,
            ..
        } => {
            let mood = if *pnl_pct < 0.0 { "🔥" } else { "🚀" };
            format!(
                "{mood} *{coin}/USD P&L Alert*\n\n• Move: {pnl_pct:+.1}% (crossed {threshold}%)\n• Unrealized: ${unrealized_pnl}\n\n⏰ {}",
                timestamp(),
            )
        }
        NotifyEvent::LiquidationWarning { margin_ratio, .. } => format!(
            "🚨 *LIQUIDATION WARNING*\n\n⚠️ Margin usage at {:.1}%\n\nYour positions are at risk of liquidation. Consider adding margin or reducing position sizes.\n\n⏰ {}",
            margin_ratio * 100.0,
            timestamp(),
        ),
        NotifyEvent::TrackingCompleted { .. } => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn filled(user: &str, price: rust_decimal::Decimal, size: rust_decimal::Decimal) -> NotifyEvent {
        NotifyEvent::OrderFilled {
            user: user.to_string(),
            tracking_id: "t1".to_string(),
            coin: "ETH".to_string(),
            is_buy: true,
            fill_price: price,
            total_filled: size,
            detection: "websocket",
        }
    }

    async fn notifier_with_link(
        settings: Option<NotificationSettings>,
    ) -> (Notifier, mpsc::Receiver<ChatMessage>) {
        let (_tx, rx) = mpsc::channel(8);
        let (chat_tx, chat_rx) = mpsc::channel(32);
        let links = Arc::new(LinkStore::in_memory());
        links.link("0xaa", "chat-1").await;
        if let Some(settings) = settings {
            links.set_settings("0xaa", settings).await;
        }
        (Notifier::new(rx, links, chat_tx), chat_rx)
    }

    #[tokio::test]
    async fn test_filled_event_reaches_chat() {
        let (mut notifier, mut chat_rx) = notifier_with_link(None).await;
        notifier.handle(filled("0xAA", dec!(2499), dec!(1.0))).await;

        let msg = chat_rx.try_recv().unwrap();
        assert_eq!(msg.chat_id, "chat-1");
        assert!(msg.text.contains("Order Filled"));
        assert!(msg.text.contains("ETH"));
    }

    #[tokio::test]
    async fn test_unlinked_user_dropped_silently() {
        let (mut notifier, mut chat_rx) = notifier_with_link(None).await;
        notifier.handle(filled("0xnobody", dec!(2499), dec!(1.0))).await;
        assert!(chat_rx.try_recv().is_err());
        assert_eq!(notifier.stats.dropped_unlinked, 1);
    }

    // A fill below the minimum notional never produces a chat message.
    #[tokio::test]
    async fn test_minimum_notional_filter() {
        let settings = NotificationSettings {
            min_notification_amount: dec!(100),
            ..NotificationSettings::default()
        };
        let (mut notifier, mut chat_rx) = notifier_with_link(Some(settings)).await;

        // 2 * 30 = 60 < 100 → dropped.
        notifier.handle(filled("0xaa", dec!(30), dec!(2))).await;
        assert!(chat_rx.try_recv().is_err());
        assert_eq!(notifier.stats.dropped_below_min, 1);

        // 2 * 60 = 120 ≥ 100 → sent.
        notifier.handle(filled("0xaa", dec!(60), dec!(2))).await;
        assert!(chat_rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_disabled_category_dropped() {
        let settings = NotificationSettings {
            fill_notifications: false,
            ..NotificationSettings::default()
        };
        let (mut notifier, mut chat_rx) = notifier_with_link(Some(settings)).await;
        notifier.handle(filled("0xaa", dec!(2499), dec!(1.0))).await;
        assert!(chat_rx.try_recv().is_err());
        assert_eq!(notifier.stats.dropped_disabled, 1);
    }

    // The same logical event observed twice in one bucket goes out once —
    // close detection runs in both the tracker and the reconciler.
    #[tokio::test]
    async fn test_duplicate_event_suppressed() {
        let (mut notifier, mut chat_rx) = notifier_with_link(None).await;
        let close = NotifyEvent::PositionClosed {
            user: "0xaa".to_string(),
            coin: "ETH".to_string(),
            exit_price: dec!(2520),
            closed_size: dec!(1.0),
            realized_pnl: dec!(20),
        };
        notifier.handle(close.clone()).await;
        notifier.handle(close).await;

        assert!(chat_rx.try_recv().is_ok());
        assert!(chat_rx.try_recv().is_err());
        assert_eq!(notifier.stats.dropped_duplicate, 1);
    }

    #[tokio::test]
    async fn test_tracking_completed_is_log_only() {
        let (mut notifier, mut chat_rx) = notifier_with_link(None).await;
        notifier
            .handle(NotifyEvent::TrackingCompleted {
                user: "0xaa".to_string(),
                tracking_id: "t9".to_string(),
                final_state: "filled".to_string(),
                push_events: 3,
                polls: 1,
            })
            .await;
        assert!(chat_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_liquidation_warning_respects_setting() {
        let settings = NotificationSettings {
            liquidation_warnings: false,
            ..NotificationSettings::default()
        };
        let (mut notifier, mut chat_rx) = notifier_with_link(Some(settings)).await;
        notifier
            .handle(NotifyEvent::LiquidationWarning {
                user: "0xaa".to_string(),
                margin_ratio: 0.92,
            })
            .await;
        assert!(chat_rx.try_recv().is_err());
    }
}
