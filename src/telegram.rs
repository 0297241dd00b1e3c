//! Telegram delivery and the user-linkage store.
//!
//! Both are external collaborators: the chat bot API gives no delivery
//! guarantee (dedup is the notifier's job), and the wallet↔chat linkage
//! lives in a separate service. Without a bot token or store URL the
//! process still starts, degraded: messages are dropped and links resolve
//! from an in-memory map.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::Context;
use rust_decimal::Decimal;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

use crate::messages::ChatMessage;

const TELEGRAM_API_BASE: &str = "https://api.telegram.org";
const SEND_TIMEOUT: Duration = Duration::from_secs(10);

// ─────────────────────────────────────────────────────────
// Notification preferences (served by the linkage store)
// ─────────────────────────────────────────────────────────

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct NotificationSettings {
    #[serde(default = "default_true")]
    pub fill_notifications: bool,
    #[serde(default = "default_true")]
    pub pnl_notifications: bool,
    #[serde(default = "default_true")]
    pub liquidation_warnings: bool,
    #[serde(default = "default_true")]
    pub daily_summary: bool,
    /// Minimum USD notional below which nothing is sent.
    #[serde(default)]
    pub min_notification_amount: Decimal,
}

impl Default for NotificationSettings {
    fn default() -> Self {
        Self {
            fill_notifications: true,
            pnl_notifications: true,
            liquidation_warnings: true,
            daily_summary: true,
            min_notification_amount: Decimal::ZERO,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LinkEntry {
    pub chat_id: String,
    #[serde(default)]
    pub settings: Option<NotificationSettings>,
}

// ─────────────────────────────────────────────────────────
// Linkage store client
// ─────────────────────────────────────────────────────────

pub struct LinkStore {
    remote: Option<(reqwest::Client, String)>,
    local: RwLock<HashMap<String, LinkEntry>>,
}

impl LinkStore {
    pub fn over_http(base_url: &str) -> anyhow::Result<Self> {
        let base = url::Url::parse(base_url).context("invalid link-store URL")?;
        let http = reqwest::Client::builder()
            .timeout(SEND_TIMEOUT)
            .build()
            .context("building link-store client")?;
        Ok(Self {
            remote: Some((http, base.to_string().trim_end_matches('/').to_string())),
            local: RwLock::new(HashMap::new()),
        })
    }

    /// Degraded mode: links live only in this process.
    pub fn in_memory() -> Self {
        Self {
            remote: None,
            local: RwLock::new(HashMap::new()),
        }
    }

    pub async fn link(&self, user: &str, chat_id: &str) {
        self.local.write().await.insert(
            user.to_lowercase(),
            LinkEntry {
                chat_id: chat_id.to_string(),
                settings: None,
            },
        );
    }

    pub async fn set_settings(&self, user: &str, settings: NotificationSettings) {
        let mut local = self.local.write().await;
        if let Some(entry) = local.get_mut(&user.to_lowercase()) {
            entry.settings = Some(settings);
        }
    }

    pub async fn chat_id_for(&self, user: &str) -> Option<String> {
        self.entry_for(user).await.map(|e| e.chat_id)
    }

    pub async fn settings_for(&self, user: &str) -> NotificationSettings {
        self.entry_for(user)
            .await
            .and_then(|e| e.settings)
            .unwrap_or_default()
    }

    async fn entry_for(&self, user: &str) -> Option<LinkEntry> {
        let user = user.to_lowercase();
        if let Some(entry) = self.local.read().await.get(&user) {
            return Some(entry.clone());
        }
        let (http, base) = self.remote.as_ref()?;
        let url = format!("{base}/links/{user}");
        match http.get(&url).send().await {
            Ok(resp) if resp.status().is_success() => match resp.json::<LinkEntry>().await {
                Ok(entry) => Some(entry),
                Err(e) => {
                    warn!("Link store returned unparseable entry for {user}: {e}");
                    None
                }
            },
            Ok(resp) => {
                debug!("No link for {user} (status {})", resp.status());
                None
            }
            Err(e) => {
                warn!("Link store lookup failed for {user}: {e}");
                None
            }
        }
    }
}

// ─────────────────────────────────────────────────────────
// Chat sender actor
// ─────────────────────────────────────────────────────────

pub struct ChatClient {
    http: reqwest::Client,
    token: Option<SecretString>,
    rx: mpsc::Receiver<ChatMessage>,
}

impl ChatClient {
    pub fn new(token: Option<SecretString>, rx: mpsc::Receiver<ChatMessage>) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(SEND_TIMEOUT)
            .build()
            .context("building chat client")?;
        Ok(Self { http, token, rx })
    }

    /// Actor main loop. Delivery is best-effort: failures are logged and
    /// the message dropped; retrying is not worth a stale trading alert.
    pub async fn run(mut self) {
        info!(
            "🤖 ChatClient started | enabled={}",
            self.token.is_some()
        );
        let mut sent = 0u64;
        let mut failed = 0u64;

        while let Some(msg) = self.rx.recv().await {
            let Some(token) = &self.token else {
                debug!("Chat disabled — dropping message for {}", msg.chat_id);
                continue;
            };
            match self.send_message(token, &msg).await {
                Ok(()) => {
                    sent += 1;
                    info!("📱 Message sent to {}", msg.chat_id);
                }
                Err(e) => {
                    failed += 1;
                    warn!("Failed to send chat message to {}: {e}", msg.chat_id);
                }
            }
        }
        info!("🤖 ChatClient shutting down | sent={sent} failed={failed}");
    }

    async fn send_message(&self, token: &SecretString, msg: &ChatMessage) -> anyhow::Result<()> {
        let url = format!(
            "{TELEGRAM_API_BASE}/bot{}/sendMessage",
            token.expose_secret()
        );
        let payload = json!({
            "chat_id": msg.chat_id,
            "text": msg.text,
            "parse_mode": "Markdown",
        });
        let resp = self.http.post(&url).json(&payload).send().await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("sendMessage returned {status}: {body}");
        }
        Ok(())
    }
}
