//! Upstream WebSocket multiplexer.
//!
//! Exactly one outbound exchange session for the whole process. The actor
//! owns the socket: subscription control arrives on a command channel (only
//! the router sends there), demuxed frames leave on a frame channel. On any
//! disconnect it sleeps and reconnects, then replays `allMids` plus every
//! active subscription — in the order they were first requested, so
//! user-events resubscribes ahead of the account snapshot for each user.
//!
//! The reconnect supervisor is this single task's loop; there is never more
//! than one concurrent connection attempt.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::hyperliquid::frames;
use crate::messages::{MuxCommand, Subscription, UpstreamFrame};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug, Default)]
struct MuxStats {
    connects: u64,
    frames: u64,
    dropped: u64,
}

pub struct UpstreamMux {
    url: String,
    cmd_rx: mpsc::Receiver<MuxCommand>,
    frame_tx: mpsc::Sender<UpstreamFrame>,
    connected: Arc<AtomicBool>,
    /// Active per-user/candle subscriptions in first-requested order.
    /// `allMids` is implicit and always re-sent first.
    active: Vec<Subscription>,
    stats: MuxStats,
}

impl UpstreamMux {
    pub fn new(
        url: String,
        cmd_rx: mpsc::Receiver<MuxCommand>,
        frame_tx: mpsc::Sender<UpstreamFrame>,
        connected: Arc<AtomicBool>,
    ) -> Self {
        Self {
            url,
            cmd_rx,
            frame_tx,
            connected,
            active: Vec::new(),
            stats: MuxStats::default(),
        }
    }

    /// Actor main loop: connect, run one session, reconnect on any exit.
    pub async fn run(mut self) {
        info!("🔗 UpstreamMux started | url={}", self.url);
        loop {
            match self.session().await {
                Ok(()) => info!("🔌 Upstream session closed"),
                Err(e) => warn!("🔌 Upstream session error: {e:?}"),
            }
            self.connected.store(false, Ordering::Release);

            if self.frame_tx.is_closed() {
                info!("🔗 UpstreamMux shutting down (frame channel closed)");
                return;
            }
            info!("⏰ Reconnecting upstream in {RECONNECT_DELAY:?}");
            sleep(RECONNECT_DELAY).await;
        }
    }

    async fn session(&mut self) -> anyhow::Result<()> {
        let connect = tokio::time::timeout(CONNECT_TIMEOUT, connect_async(&self.url)).await;
        let (ws, response) = match connect {
            Ok(Ok(pair)) => pair,
            Ok(Err(e)) => anyhow::bail!("connect error: {e:?}"),
            Err(_) => anyhow::bail!("connect timeout"),
        };
        self.stats.connects += 1;
        self.connected.store(true, Ordering::Release);
        info!(
            "✅ Upstream connected (status={:?}, reconnects={})",
            response.status(),
            self.stats.connects - 1
        );

        let (mut write, mut read) = ws.split();

        for payload in self.replay_payloads() {
            debug!("📊 Subscribing upstream: {payload}");
            write
                .send(Message::Text(sub_frame("subscribe", &payload).to_string()))
                .await?;
        }

        loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => {
                    let cmd = match cmd {
                        Some(cmd) => cmd,
                        None => {
                            // Router gone; close our side and stop.
                            let _ = write.send(Message::Close(None)).await;
                            return Ok(());
                        }
                    };
                    if let Some((method, payload)) = self.apply_command(cmd) {
                        info!("📊 {} upstream: {}", method, payload);
                        write
                            .send(Message::Text(sub_frame(method, &payload).to_string()))
                            .await?;
                    }
                }
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => self.dispatch(&text).await,
                        Some(Ok(Message::Ping(data))) => {
                            let _ = write.send(Message::Pong(data)).await;
                        }
                        Some(Ok(Message::Close(_))) => {
                            warn!("Upstream closed by server");
                            return Ok(());
                        }
                        Some(Err(e)) => anyhow::bail!("read error: {e:?}"),
                        None => return Ok(()),
                        _ => {}
                    }
                }
            }
        }
    }

    /// Update the active set and return the frame to send, if any.
    /// Duplicate subscribes are coalesced here: at most one active
    /// subscription per (channel, user).
    fn apply_command(&mut self, cmd: MuxCommand) -> Option<(&'static str, Value)> {
        match cmd {
            MuxCommand::Subscribe(sub) => {
                let key = sub.key();
                if self.active.iter().any(|s| s.key() == key) {
                    debug!("Duplicate upstream subscription ignored: {key}");
                    return None;
                }
                let payload = sub.payload();
                self.active.push(sub);
                Some(("subscribe", payload))
            }
            MuxCommand::Unsubscribe(sub) => {
                let key = sub.key();
                self.active.retain(|s| s.key() != key);
                Some(("unsubscribe", sub.payload()))
            }
        }
    }

    /// Subscription payloads to (re)issue on every connect.
    fn replay_payloads(&self) -> Vec<Value> {
        let mut payloads = vec![Subscription::AllMids.payload()];
        payloads.extend(self.active.iter().map(Subscription::payload));
        payloads
    }

    async fn dispatch(&mut self, text: &str) {
        let frame = match frames::classify(text) {
            Some(frame) => frame,
            None => {
                self.stats.dropped += 1;
                return;
            }
        };
        self.stats.frames += 1;
        if let UpstreamFrame::SubscriptionAck(ack) = &frame {
            info!("✅ Subscription confirmed: {ack}");
            return;
        }
        if self.frame_tx.send(frame).await.is_err() {
            warn!("Frame channel closed — dropping upstream frame");
        }
    }
}

fn sub_frame(method: &str, payload: &Value) -> Value {
    json!({"method": method, "subscription": payload})
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mux() -> (UpstreamMux, mpsc::Sender<MuxCommand>, mpsc::Receiver<UpstreamFrame>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(16);
        let (frame_tx, frame_rx) = mpsc::channel(16);
        let mux = UpstreamMux::new(
            "wss://example/ws".to_string(),
            cmd_rx,
            frame_tx,
            Arc::new(AtomicBool::new(false)),
        );
        (mux, cmd_tx, frame_rx)
    }

    fn user_events(user: &str) -> Subscription {
        Subscription::UserEvents {
            user: user.to_string(),
        }
    }

    fn account_snapshot(user: &str) -> Subscription {
        Subscription::AccountSnapshot {
            user: user.to_string(),
        }
    }

    #[test]
    fn test_duplicate_subscribe_coalesced() {
        let (mut mux, _tx, _rx) = mux();
        assert!(mux
            .apply_command(MuxCommand::Subscribe(user_events("0xu3")))
            .is_some());
        // Second subscribe for the same (channel, user) sends nothing.
        assert!(mux
            .apply_command(MuxCommand::Subscribe(user_events("0xu3")))
            .is_none());
        assert_eq!(mux.active.len(), 1);
    }

    #[test]
    fn test_unsubscribe_removes_from_replay() {
        let (mut mux, _tx, _rx) = mux();
        mux.apply_command(MuxCommand::Subscribe(user_events("0xu3")));
        mux.apply_command(MuxCommand::Subscribe(account_snapshot("0xu3")));
        assert!(mux
            .apply_command(MuxCommand::Unsubscribe(user_events("0xu3")))
            .is_some());
        assert_eq!(mux.active.len(), 1);
        // Resubscribing after an unsubscribe sends again.
        assert!(mux
            .apply_command(MuxCommand::Subscribe(user_events("0xu3")))
            .is_some());
    }

    #[test]
    fn test_replay_order_allmids_then_user_events_first() {
        let (mut mux, _tx, _rx) = mux();
        // Router subscribes user-events before the account snapshot.
        mux.apply_command(MuxCommand::Subscribe(user_events("0xu3")));
        mux.apply_command(MuxCommand::Subscribe(account_snapshot("0xu3")));

        let payloads = mux.replay_payloads();
        assert_eq!(payloads.len(), 3);
        assert_eq!(payloads[0]["type"], "allMids");
        assert_eq!(payloads[1]["type"], "userEvents");
        assert_eq!(payloads[1]["user"], "0xu3");
        assert_eq!(payloads[2]["type"], "webData2");
        assert_eq!(payloads[2]["user"], "0xu3");
    }

    #[tokio::test]
    async fn test_dispatch_forwards_demuxed_frames() {
        let (mut mux, _tx, mut frame_rx) = mux();
        mux.dispatch(r#"{"channel":"userEvents","data":{"user":"0xAA","fills":[]}}"#)
            .await;
        match frame_rx.try_recv() {
            Ok(UpstreamFrame::UserEvents { user, .. }) => assert_eq!(user, "0xaa"),
            other => panic!("unexpected: {other:?}"),
        }

        // Acks are logged, not forwarded; garbage is dropped.
        mux.dispatch(r#"{"channel":"subscriptionResponse","data":{}}"#).await;
        mux.dispatch("garbage").await;
        assert!(frame_rx.try_recv().is_err());
    }
}
