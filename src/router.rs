//! Subscription router.
//!
//! Registry of downstream clients and the only component that talks to the
//! mux's control channel. Per-user upstream subscriptions are coalesced:
//! the upstream is subscribed exactly once per user while at least one
//! client references that user, and unsubscribed when the last one goes.
//! User-events is always subscribed before the account snapshot — fills
//! are the latency-critical stream.
//!
//! Fan-out never blocks on a slow client: full send buffers get the client
//! evicted on the spot.

use std::collections::{HashMap, HashSet};

use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::messages::{
    ClientId, MuxCommand, ReconcilerMsg, RouterCmd, Subscription, TrackerCmd, UpstreamFrame,
};

#[derive(Debug)]
struct ClientHandle {
    tx: mpsc::Sender<String>,
    user: Option<String>,
    channels: HashSet<&'static str>,
}

#[derive(Debug, Default)]
struct RouterStats {
    frames_routed: u64,
    broadcasts: u64,
    evicted: u64,
}

pub struct SubscriptionRouter {
    cmd_rx: mpsc::Receiver<RouterCmd>,
    frame_rx: mpsc::Receiver<UpstreamFrame>,
    mux_tx: mpsc::Sender<MuxCommand>,
    tracker_tx: mpsc::Sender<TrackerCmd>,
    recon_tx: mpsc::Sender<ReconcilerMsg>,
    clients: HashMap<ClientId, ClientHandle>,
    /// Invariant: `user ∈ subscribed_users ⟺ ∃ client with that user`.
    subscribed_users: HashSet<String>,
    stats: RouterStats,
}

impl SubscriptionRouter {
    pub fn new(
        cmd_rx: mpsc::Receiver<RouterCmd>,
        frame_rx: mpsc::Receiver<UpstreamFrame>,
        mux_tx: mpsc::Sender<MuxCommand>,
        tracker_tx: mpsc::Sender<TrackerCmd>,
        recon_tx: mpsc::Sender<ReconcilerMsg>,
    ) -> Self {
        Self {
            cmd_rx,
            frame_rx,
            mux_tx,
            tracker_tx,
            recon_tx,
            clients: HashMap::new(),
            subscribed_users: HashSet::new(),
            stats: RouterStats::default(),
        }
    }

    pub async fn run(mut self) {
        info!("🔀 SubscriptionRouter started");
        loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => {
                    match cmd {
                        Some(cmd) => self.handle_cmd(cmd).await,
                        None => break,
                    }
                }
                frame = self.frame_rx.recv() => {
                    match frame {
                        Some(frame) => self.handle_frame(frame).await,
                        None => break,
                    }
                }
            }
        }
        info!(
            "🔀 SubscriptionRouter shutting down | routed={} broadcasts={} evicted={}",
            self.stats.frames_routed, self.stats.broadcasts, self.stats.evicted,
        );
    }

    // ─────────────────────────────────────────────────
    // Client commands
    // ─────────────────────────────────────────────────

    async fn handle_cmd(&mut self, cmd: RouterCmd) {
        match cmd {
            RouterCmd::Register { client, tx } => {
                self.clients.insert(
                    client,
                    ClientHandle {
                        tx,
                        user: None,
                        channels: HashSet::new(),
                    },
                );
                info!("📱 Client connected. Total clients: {}", self.clients.len());
            }
            RouterCmd::SubscribeUser { client, user } => {
                self.subscribe_user(client, &user).await;
            }
            RouterCmd::UnsubscribeUser { client, user } => {
                self.unsubscribe_user(client, &user).await;
            }
            RouterCmd::SubscribeCandle {
                client,
                coin,
                interval,
            } => {
                self.send_mux(MuxCommand::Subscribe(Subscription::Candle {
                    coin: coin.clone(),
                    interval: interval.clone(),
                }))
                .await;
                self.send_to(
                    client,
                    json!({
                        "type": "subscription_confirmed",
                        "data": {"coin": coin, "interval": interval, "subscription": "candle"},
                    }),
                )
                .await;
            }
            RouterCmd::UnsubscribeRaw {
                client,
                subscription,
            } => {
                self.send_mux(MuxCommand::Unsubscribe(Subscription::Raw(subscription.clone())))
                    .await;
                self.send_to(
                    client,
                    json!({"type": "unsubscription_confirmed", "data": {"subscription": subscription}}),
                )
                .await;
            }
            RouterCmd::Disconnect { client } => self.disconnect(client).await,
        }
    }

    async fn subscribe_user(&mut self, client: ClientId, user: &str) {
        let user = user.to_lowercase();
        let old = match self.clients.get_mut(&client) {
            Some(handle) => {
                let old = handle.user.replace(user.clone());
                handle.channels.insert("userEvents");
                handle.channels.insert("webData2");
                old
            }
            None => return,
        };

        // A client follows at most one user; switching releases the old one.
        if let Some(old) = old {
            if old != user {
                self.cleanup_for(&old, Some(client)).await;
            }
        }

        if self.subscribed_users.insert(user.clone()) {
            info!("👤 Subscribing upstream for user: {user}");
            // userEvents first: fills must not wait behind snapshots.
            self.send_mux(MuxCommand::Subscribe(Subscription::UserEvents {
                user: user.clone(),
            }))
            .await;
            self.send_mux(MuxCommand::Subscribe(Subscription::AccountSnapshot {
                user: user.clone(),
            }))
            .await;
        }

        self.send_to(
            client,
            json!({
                "type": "subscription_confirmed",
                "data": {"userAddress": user, "subscriptions": ["userEvents", "webData2"]},
            }),
        )
        .await;
    }

    async fn unsubscribe_user(&mut self, client: ClientId, user: &str) {
        let user = user.to_lowercase();
        if let Some(handle) = self.clients.get_mut(&client) {
            if handle.user.as_deref() == Some(user.as_str()) {
                handle.user = None;
                handle.channels.clear();
            }
        }
        self.cleanup_for(&user, Some(client)).await;
        self.send_to(
            client,
            json!({"type": "unsubscription_confirmed", "data": {"userAddress": user}}),
        )
        .await;
    }

    /// Drop the upstream subscriptions for `user` unless some other client
    /// still references them.
    async fn cleanup_for(&mut self, user: &str, excluding: Option<ClientId>) {
        let still_referenced = self.clients.iter().any(|(id, handle)| {
            Some(*id) != excluding && handle.user.as_deref() == Some(user)
        });
        if still_referenced {
            return;
        }
        if !self.subscribed_users.remove(user) {
            return;
        }
        info!("🚫 Unsubscribing upstream for user: {user}");
        self.send_mux(MuxCommand::Unsubscribe(Subscription::UserEvents {
            user: user.to_string(),
        }))
        .await;
        self.send_mux(MuxCommand::Unsubscribe(Subscription::AccountSnapshot {
            user: user.to_string(),
        }))
        .await;
        if self
            .recon_tx
            .send(ReconcilerMsg::Forget {
                user: user.to_string(),
            })
            .await
            .is_err()
        {
            debug!("Reconciler channel closed");
        }
    }

    async fn disconnect(&mut self, client: ClientId) {
        let Some(handle) = self.clients.remove(&client) else {
            return;
        };
        info!(
            "📱 Client disconnected. Total clients: {}",
            self.clients.len()
        );
        if let Some(user) = handle.user {
            self.cleanup_for(&user, Some(client)).await;
        }
    }

    // ─────────────────────────────────────────────────
    // Upstream frame fan-out
    // ─────────────────────────────────────────────────

    async fn handle_frame(&mut self, frame: UpstreamFrame) {
        self.stats.frames_routed += 1;
        match frame {
            UpstreamFrame::PriceAll(data) => {
                self.broadcast(json!({"type": "priceUpdate", "data": data}))
                    .await;
            }
            UpstreamFrame::AccountSnapshot { user, data } => {
                self.deliver_for_user(
                    &user,
                    json!({"type": "userDataUpdate", "data": data.clone()}),
                )
                .await;
                if self
                    .recon_tx
                    .send(ReconcilerMsg::Snapshot { user, data })
                    .await
                    .is_err()
                {
                    debug!("Reconciler channel closed");
                }
            }
            UpstreamFrame::UserEvents { user, data } => {
                self.deliver_for_user(&user, json!({"type": "userEvents", "data": data.clone()}))
                    .await;
                if self
                    .tracker_tx
                    .send(TrackerCmd::Push { user, data })
                    .await
                    .is_err()
                {
                    debug!("Tracker channel closed");
                }
            }
            UpstreamFrame::SubscriptionAck(ack) => {
                info!("✅ Subscription confirmed: {ack}");
            }
            UpstreamFrame::Other { channel, data } => {
                self.broadcast(json!({"type": "hyperliquidMessage", "channel": channel, "data": data}))
                    .await;
            }
        }
    }

    async fn broadcast(&mut self, value: Value) {
        self.stats.broadcasts += 1;
        let targets: Vec<ClientId> = self.clients.keys().copied().collect();
        self.deliver(targets, value.to_string()).await;
    }

    async fn deliver_for_user(&mut self, user: &str, value: Value) {
        let targets: Vec<ClientId> = self
            .clients
            .iter()
            .filter(|(_, handle)| handle.user.as_deref() == Some(user))
            .map(|(id, _)| *id)
            .collect();
        if targets.is_empty() {
            return;
        }
        self.deliver(targets, value.to_string()).await;
    }

    /// Non-blocking fan-out; a full or closed buffer evicts the client.
    async fn deliver(&mut self, targets: Vec<ClientId>, text: String) {
        let mut dead = Vec::new();
        for client in targets {
            if let Some(handle) = self.clients.get(&client) {
                if handle.tx.try_send(text.clone()).is_err() {
                    dead.push(client);
                }
            }
        }
        for client in dead {
            warn!("⚠️ Client send buffer full or closed — evicting");
            self.stats.evicted += 1;
            self.disconnect(client).await;
        }
    }

    async fn send_to(&mut self, client: ClientId, value: Value) {
        if let Some(handle) = self.clients.get(&client) {
            if handle.tx.try_send(value.to_string()).is_err() {
                self.stats.evicted += 1;
                self.disconnect(client).await;
            }
        }
    }

    async fn send_mux(&self, cmd: MuxCommand) {
        if self.mux_tx.send(cmd).await.is_err() {
            warn!("Mux channel closed — upstream command dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    struct Harness {
        router: SubscriptionRouter,
        mux_rx: mpsc::Receiver<MuxCommand>,
        tracker_rx: mpsc::Receiver<TrackerCmd>,
        recon_rx: mpsc::Receiver<ReconcilerMsg>,
    }

    fn make() -> Harness {
        let (_cmd_tx, cmd_rx) = mpsc::channel(16);
        let (_frame_tx, frame_rx) = mpsc::channel(16);
        let (mux_tx, mux_rx) = mpsc::channel(64);
        let (tracker_tx, tracker_rx) = mpsc::channel(64);
        let (recon_tx, recon_rx) = mpsc::channel(64);
        Harness {
            router: SubscriptionRouter::new(cmd_rx, frame_rx, mux_tx, tracker_tx, recon_tx),
            mux_rx,
            tracker_rx,
            recon_rx,
        }
    }

    async fn connect(router: &mut SubscriptionRouter, capacity: usize) -> (ClientId, mpsc::Receiver<String>) {
        let client = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(capacity);
        router.handle_cmd(RouterCmd::Register { client, tx }).await;
        (client, rx)
    }

    fn sub_key(cmd: &MuxCommand) -> (bool, String) {
        match cmd {
            MuxCommand::Subscribe(s) => (true, s.key()),
            MuxCommand::Unsubscribe(s) => (false, s.key()),
        }
    }

    // S5: per-user isolation — each client sees only its own user's frames,
    // and the upstream holds exactly one subscription pair per user.
    #[tokio::test]
    async fn test_fanout_isolation() {
        let mut h = make();
        let (c_a, mut rx_a) = connect(&mut h.router, 8).await;
        let (c_b, mut rx_b) = connect(&mut h.router, 8).await;

        h.router.subscribe_user(c_a, "0xU1").await;
        h.router.subscribe_user(c_b, "0xU2").await;

        // userEvents precedes webData2 for each user.
        let cmds: Vec<(bool, String)> = [
            h.mux_rx.try_recv().unwrap(),
            h.mux_rx.try_recv().unwrap(),
            h.mux_rx.try_recv().unwrap(),
            h.mux_rx.try_recv().unwrap(),
        ]
        .iter()
        .map(sub_key)
        .collect();
        assert_eq!(
            cmds,
            vec![
                (true, "userEvents:0xu1".to_string()),
                (true, "webData2:0xu1".to_string()),
                (true, "userEvents:0xu2".to_string()),
                (true, "webData2:0xu2".to_string()),
            ]
        );
        assert!(h.mux_rx.try_recv().is_err());

        // Drain the confirmation frames.
        rx_a.try_recv().unwrap();
        rx_b.try_recv().unwrap();

        h.router
            .handle_frame(UpstreamFrame::UserEvents {
                user: "0xu1".to_string(),
                data: serde_json::json!({"fills": []}),
            })
            .await;

        let frame = rx_a.try_recv().unwrap();
        assert!(frame.contains("userEvents"));
        assert!(rx_b.try_recv().is_err());

        // The tracker sees the frame too.
        assert!(matches!(
            h.tracker_rx.try_recv().unwrap(),
            TrackerCmd::Push { user, .. } if user == "0xu1"
        ));
    }

    // Subscribing the same user twice is a no-op on the upstream.
    #[tokio::test]
    async fn test_duplicate_subscribe_is_upstream_noop() {
        let mut h = make();
        let (c_a, _rx_a) = connect(&mut h.router, 8).await;
        let (c_b, _rx_b) = connect(&mut h.router, 8).await;

        h.router.subscribe_user(c_a, "0xU1").await;
        assert!(h.mux_rx.try_recv().is_ok());
        assert!(h.mux_rx.try_recv().is_ok());

        h.router.subscribe_user(c_a, "0xU1").await;
        h.router.subscribe_user(c_b, "0xU1").await;
        assert!(h.mux_rx.try_recv().is_err());
        assert_eq!(h.router.subscribed_users.len(), 1);
    }

    // Last subscriber leaving releases the upstream pair and the
    // reconciler's per-user state.
    #[tokio::test]
    async fn test_disconnect_cleans_up_upstream() {
        let mut h = make();
        let (c_a, _rx_a) = connect(&mut h.router, 8).await;
        let (c_b, _rx_b) = connect(&mut h.router, 8).await;
        h.router.subscribe_user(c_a, "0xU1").await;
        h.router.subscribe_user(c_b, "0xU1").await;
        while h.mux_rx.try_recv().is_ok() {}

        // First client leaves: the other still references the user.
        h.router.disconnect(c_a).await;
        assert!(h.mux_rx.try_recv().is_err());
        assert!(h.router.subscribed_users.contains("0xu1"));

        h.router.disconnect(c_b).await;
        let cmds: Vec<(bool, String)> = [
            h.mux_rx.try_recv().unwrap(),
            h.mux_rx.try_recv().unwrap(),
        ]
        .iter()
        .map(sub_key)
        .collect();
        assert_eq!(
            cmds,
            vec![
                (false, "userEvents:0xu1".to_string()),
                (false, "webData2:0xu1".to_string()),
            ]
        );
        assert!(h.router.subscribed_users.is_empty());
        assert!(matches!(
            h.recon_rx.try_recv().unwrap(),
            ReconcilerMsg::Forget { user } if user == "0xu1"
        ));
    }

    // Switching users releases the old subscription pair.
    #[tokio::test]
    async fn test_user_switch_releases_old_user() {
        let mut h = make();
        let (c_a, _rx_a) = connect(&mut h.router, 8).await;
        h.router.subscribe_user(c_a, "0xU1").await;
        while h.mux_rx.try_recv().is_ok() {}

        h.router.subscribe_user(c_a, "0xU2").await;
        let keys: Vec<(bool, String)> = std::iter::from_fn(|| h.mux_rx.try_recv().ok())
            .map(|c| sub_key(&c))
            .collect();
        assert_eq!(
            keys,
            vec![
                (false, "userEvents:0xu1".to_string()),
                (false, "webData2:0xu1".to_string()),
                (true, "userEvents:0xu2".to_string()),
                (true, "webData2:0xu2".to_string()),
            ]
        );
        assert!(h.router.subscribed_users.contains("0xu2"));
        assert!(!h.router.subscribed_users.contains("0xu1"));
    }

    // Price frames go to everyone; account frames also feed the reconciler.
    #[tokio::test]
    async fn test_broadcast_and_reconciler_feed() {
        let mut h = make();
        let (c_a, mut rx_a) = connect(&mut h.router, 8).await;
        let (_c_b, mut rx_b) = connect(&mut h.router, 8).await;
        h.router.subscribe_user(c_a, "0xU1").await;
        rx_a.try_recv().unwrap();

        h.router
            .handle_frame(UpstreamFrame::PriceAll(serde_json::json!({"ETH": "2500"})))
            .await;
        assert!(rx_a.try_recv().unwrap().contains("priceUpdate"));
        assert!(rx_b.try_recv().unwrap().contains("priceUpdate"));

        h.router
            .handle_frame(UpstreamFrame::AccountSnapshot {
                user: "0xu1".to_string(),
                data: serde_json::json!({"clearinghouseState": {}}),
            })
            .await;
        assert!(rx_a.try_recv().unwrap().contains("userDataUpdate"));
        assert!(rx_b.try_recv().is_err());
        assert!(matches!(
            h.recon_rx.try_recv().unwrap(),
            ReconcilerMsg::Snapshot { user, .. } if user == "0xu1"
        ));
    }

    // A slow client never blocks the fan-out; it gets evicted and its
    // subscriptions cleaned up.
    #[tokio::test]
    async fn test_slow_client_evicted() {
        let mut h = make();
        let (c_a, _rx_a) = connect(&mut h.router, 1).await;
        h.router.subscribe_user(c_a, "0xU1").await;
        // Confirmation already fills the single-slot buffer.
        while h.mux_rx.try_recv().is_ok() {}

        h.router
            .handle_frame(UpstreamFrame::PriceAll(serde_json::json!({"tick": 1})))
            .await;

        assert!(h.router.clients.is_empty());
        assert_eq!(h.router.stats.evicted, 1);
        // Upstream subscriptions for its user were released.
        assert!(h.router.subscribed_users.is_empty());
        assert!(h.mux_rx.try_recv().is_ok());
    }
}
