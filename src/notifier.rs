//! Outbound chat alerts and inbound command long-polling against the
//! Telegram Bot API — `sendMessage` for outbound, `getUpdates` long-poll
//! for inbound, using `reqwest` as the HTTP client.
//!
//! The "disabled" state is a capability, not a conditional sprinkled
//! through call sites: when the token or chat id is missing,
//! `Notifier::Disabled` silently swallows every outbound call and the
//! long-poll loop is never started.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const SEND_TIMEOUT: Duration = Duration::from_secs(10);
const POLL_SERVER_TIMEOUT_SECS: u64 = 30;
const POLL_CLIENT_TIMEOUT: Duration = Duration::from_secs(35);
const TRANSPORT_BACKOFF: Duration = Duration::from_secs(15);
const UNKNOWN_ERROR_BACKOFF: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub text: String,
}

pub enum Notifier {
    Enabled(TelegramClient),
    Disabled,
}

impl Notifier {
    pub fn new(token: Option<String>, chat_id: Option<String>) -> Self {
        match (token, chat_id) {
            (Some(token), Some(chat_id)) => Notifier::Enabled(TelegramClient::new(token, chat_id)),
            _ => {
                warn!("chat token or chat id not configured; notifications disabled");
                Notifier::Disabled
            }
        }
    }

    pub async fn send(&self, text: &str) {
        if let Notifier::Enabled(client) = self {
            client.send(text).await;
        }
    }

    pub async fn send_restart_alert(&self, cid: &str, reason: &str, details: &str, timestamp: &str) {
        let text = templates::restart_alert(cid, reason, details, timestamp);
        self.send(&text).await;
    }

    pub async fn send_restart_failure_alert(&self, cid: &str) {
        self.send(&templates::restart_failure(cid)).await;
    }

    pub async fn send_stagnation_alert(&self, pair: (i64, i64), minutes: u64) {
        self.send(&templates::stagnation_alert(pair, minutes)).await;
    }

    pub async fn send_watcher_start_message(&self) {
        self.send(templates::WATCHER_STARTED).await;
    }

    pub async fn send_watcher_stop_message(&self) {
        self.send(templates::WATCHER_STOPPED).await;
    }

    pub async fn send_watcher_error_message(&self, error: &str) {
        self.send(&templates::watcher_error(error)).await;
    }

    pub async fn send_command_response(&self, response: &str) {
        self.send(&templates::command_response(response)).await;
    }

    pub async fn send_help_response(&self) {
        self.send(templates::HELP).await;
    }

    pub async fn send_unknown_command_response(&self) {
        self.send(templates::UNKNOWN_COMMAND).await;
    }

    /// Spawns the long-poll loop if the notifier is enabled. Returns
    /// `None` when disabled — the daemon never opens an HTTP connection in
    /// that case.
    pub fn spawn_update_listener(
        &self,
        stop: CancellationToken,
    ) -> Option<(tokio::task::JoinHandle<()>, mpsc::Receiver<InboundMessage>)> {
        match self {
            Notifier::Enabled(client) => {
                let (tx, rx) = mpsc::channel(64);
                let client = client.clone();
                let handle = tokio::spawn(async move { client.poll_loop(tx, stop).await });
                Some((handle, rx))
            }
            Notifier::Disabled => None,
        }
    }
}

#[derive(Clone)]
pub struct TelegramClient {
    http: reqwest::Client,
    base_url: String,
    chat_id: String,
}

impl TelegramClient {
    fn new(token: String, chat_id: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: format!("https://api.telegram.org/bot{token}"),
            chat_id,
        }
    }

    async fn send(&self, text: &str) {
        let url = format!("{}/sendMessage", self.base_url);
        let payload = serde_json::json!({
            "chat_id": self.chat_id,
            "text": text,
            "parse_mode": "HTML",
        });
        let result = self
            .http
            .post(&url)
            .json(&payload)
            .timeout(SEND_TIMEOUT)
            .send()
            .await
            .and_then(|r| r.error_for_status());

        match result {
            Ok(_) => info!("sent chat notification"),
            Err(e) => error!(error = %e, "could not send chat notification"),
        }
    }

    /// Validates the bot token against `getMe`. HTTP 401 is fatal at
    /// startup; any other error is only a warning.
    pub async fn validate_token(&self) -> Result<(), String> {
        let url = format!("{}/getMe", self.base_url);
        match self.http.get(&url).timeout(Duration::from_secs(10)).send().await {
            Ok(resp) if resp.status().as_u16() == 401 => {
                Err("chat bot token rejected with 401".to_string())
            }
            Ok(resp) => {
                if let Err(e) = resp.error_for_status() {
                    warn!(error = %e, "could not validate chat bot token, continuing anyway");
                } else {
                    info!("chat bot token validated");
                }
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "could not reach chat API to validate token");
                Ok(())
            }
        }
    }

    async fn poll_loop(&self, tx: mpsc::Sender<InboundMessage>, stop: CancellationToken) {
        info!("chat command listener started");
        let mut offset: i64 = 0;

        loop {
            if stop.is_cancelled() {
                break;
            }

            let url = format!("{}/getUpdates", self.base_url);
            let result = tokio::select! {
                _ = stop.cancelled() => break,
                r = self
                    .http
                    .get(&url)
                    .query(&[("offset", offset.to_string()), ("timeout", POLL_SERVER_TIMEOUT_SECS.to_string())])
                    .timeout(POLL_CLIENT_TIMEOUT)
                    .send() => r,
            };

            match result.and_then(|r| r.error_for_status()) {
                Ok(resp) => match resp.json::<serde_json::Value>().await {
                    Ok(body) => {
                        let updates = body["result"].as_array().cloned().unwrap_or_default();
                        for update in updates {
                            if let Some(update_id) = update["update_id"].as_i64() {
                                offset = update_id + 1;
                            }
                            if let Some(text) = update["message"]["text"].as_str() {
                                if tx.send(InboundMessage { text: text.to_string() }).await.is_err() {
                                    return;
                                }
                            }
                        }
                    }
                    Err(e) => {
                        error!(error = %e, "unexpected error decoding chat updates");
                        tokio::select! {
                            _ = stop.cancelled() => break,
                            _ = tokio::time::sleep(UNKNOWN_ERROR_BACKOFF) => {}
                        }
                    }
                },
                Err(e) => {
                    warn!(error = %e, "error polling chat API for updates");
                    tokio::select! {
                        _ = stop.cancelled() => break,
                        _ = tokio::time::sleep(TRANSPORT_BACKOFF) => {}
                    }
                }
            }
        }
        info!("chat command listener stopped");
    }
}

pub mod templates {
    pub const WATCHER_STARTED: &str = "\u{1F7E2} <b>Watcher started.</b>";
    pub const WATCHER_STOPPED: &str = "\u{1F534} <b>Watcher stopped.</b>";
    pub const HELP: &str = concat!(
        "<b>Commands</b>\n",
        "/start &lt;cid&gt; - start a container\n",
        "/stop &lt;cid&gt; - stop a container\n",
        "/restart &lt;cid&gt; - restart a container\n",
        "/logs &lt;cid&gt; [N] - tail N log lines (default 20)\n",
        "/stagnation on|off - toggle stagnation alerts\n",
        "/stagnation_timer &lt;minutes&gt; - set the stagnation threshold\n",
        "/status - show watcher status\n",
        "/help - show this message",
    );
    pub const UNKNOWN_COMMAND: &str = "Unknown command. Send /help for the list of commands.";

    pub fn restart_alert(cid: &str, reason: &str, details: &str, timestamp: &str) -> String {
        format!(
            "\u{26A0}\u{FE0F} <b>Restarting container</b>\nContainer: <code>{cid}</code>\nReason: {reason}\nDetails: {details}\nTime: {timestamp}"
        )
    }

    pub fn restart_failure(cid: &str) -> String {
        format!("\u{274C} <b>Failed to restart container</b> <code>{cid}</code>. It will be retried on the next tick.")
    }

    pub fn stagnation_alert(pair: (i64, i64), minutes: u64) -> String {
        format!(
            "\u{1F6D1} <b>Network stagnation detected.</b>\nMajority state {pair:?} has not advanced for over {minutes} minutes."
        )
    }

    pub fn watcher_error(error: &str) -> String {
        format!("\u{1F525} <b>Unhandled error in the watcher loop:</b> {error}")
    }

    pub fn command_response(response: &str) -> String {
        response.to_string()
    }
}
