//! Service entry point: load settings, construct the shared clients, wire
//! the actor channels, spawn every long-running loop, then serve HTTP/WS
//! until shutdown. Missing externals (chat token, link store, exchange
//! meta) degrade the matching capability instead of aborting startup.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use hl_relay::assets::AssetCatalog;
use hl_relay::config::Settings;
use hl_relay::hyperliquid::api::InfoClient;
use hl_relay::hyperliquid::ws::UpstreamMux;
use hl_relay::notifier::Notifier;
use hl_relay::reconciler::PositionReconciler;
use hl_relay::router::SubscriptionRouter;
use hl_relay::server::{self, AppState};
use hl_relay::telegram::{ChatClient, LinkStore};
use hl_relay::tracking::tracker::{HybridTracker, TrackerConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    let settings = Settings::from_env();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(settings.log_level.clone()));
    let (writer, _log_guard) = tracing_appender::non_blocking(std::io::stdout());
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .init();

    info!("═══════════════════════════════════════════════════");
    info!("  hl-relay — order tracking & notification sidecar");
    info!("═══════════════════════════════════════════════════");
    info!(
        "Environment: {} | testnet={} | bind={} | api_key_header={} | rate_limit={}/min",
        settings.environment,
        settings.hyperliquid_testnet,
        settings.bind_addr(),
        settings.api_key_header,
        settings.rate_limit_per_minute,
    );
    info!("CORS origins: {:?}", settings.cors_origins);

    let api = Arc::new(InfoClient::new(&settings.hyperliquid_base_url)?);

    // Asset catalog from the exchange meta call; the baked default keeps
    // fill correlation working when the exchange is unreachable at boot.
    let assets = match api.meta().await {
        Ok(meta) => AssetCatalog::from_meta(&meta).unwrap_or_else(AssetCatalog::default_universe),
        Err(e) => {
            warn!("meta call failed ({e}) — using baked asset catalog");
            AssetCatalog::default_universe()
        }
    };
    let assets = Arc::new(assets);

    let links = Arc::new(match &settings.link_store_url {
        Some(url) => LinkStore::over_http(url)?,
        None => {
            warn!("⚠️ LINK_STORE_URL not set — chat links held in memory only");
            LinkStore::in_memory()
        }
    });
    let chat_enabled = settings.telegram_bot_token.is_some();
    if !chat_enabled {
        warn!("⚠️ TELEGRAM_BOT_TOKEN not set — notifications will be dropped");
    }

    // ═══ Channel plumbing ═══
    let (mux_cmd_tx, mux_cmd_rx) = mpsc::channel(64);
    let (frame_tx, frame_rx) = mpsc::channel(1024);
    let (router_cmd_tx, router_cmd_rx) = mpsc::channel(256);
    let (tracker_tx, tracker_rx) = mpsc::channel(256);
    let (recon_tx, recon_rx) = mpsc::channel(256);
    let (notify_tx, notify_rx) = mpsc::channel(256);
    let (chat_tx, chat_rx) = mpsc::channel(256);

    let upstream_connected = Arc::new(AtomicBool::new(false));

    // ═══ Spawn the actors ═══
    let mut handles = Vec::new();

    let mux = UpstreamMux::new(
        settings.hyperliquid_ws_url.clone(),
        mux_cmd_rx,
        frame_tx,
        upstream_connected.clone(),
    );
    handles.push(tokio::spawn(mux.run()));

    let router = SubscriptionRouter::new(
        router_cmd_rx,
        frame_rx,
        mux_cmd_tx,
        tracker_tx.clone(),
        recon_tx,
    );
    handles.push(tokio::spawn(router.run()));

    let tracker = HybridTracker::new(
        TrackerConfig::default(),
        api.clone(),
        assets.clone(),
        tracker_rx,
        notify_tx.clone(),
    );
    handles.push(tokio::spawn(tracker.run()));

    let reconciler = PositionReconciler::new(api.clone(), recon_rx, notify_tx);
    handles.push(tokio::spawn(reconciler.run()));

    let notifier = Notifier::new(notify_rx, links.clone(), chat_tx);
    handles.push(tokio::spawn(notifier.run()));

    let chat = ChatClient::new(settings.telegram_bot_token.clone(), chat_rx)?;
    handles.push(tokio::spawn(chat.run()));

    info!("🚀 Actors spawned — starting server");

    let state = AppState {
        router_tx: router_cmd_tx,
        tracker_tx,
        api,
        upstream_connected,
        chat_enabled,
    };

    tokio::select! {
        result = server::serve(state, &settings) => {
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("🛑 Shutdown signal received");
        }
    }

    for handle in &handles {
        handle.abort();
    }
    for handle in handles {
        let _ = handle.await;
    }
    info!("👋 hl-relay stopped");
    Ok(())
}
