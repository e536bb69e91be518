//! Parses and dispatches inbound chat commands.
//!
//! Tokenize on whitespace, lowercase the first token, dispatch on it.
//! `/restart` deliberately does not touch supervisor timers — only a
//! supervisor-driven restart does — so this handler talks to the
//! [`ContainerDriver`] directly and never touches the per-container state
//! table the supervisor owns.

use std::sync::Arc;

use crate::config::{AppConfig, SharedConfig};
use crate::container_driver::{ContainerDriver, ContainerHandle};

const MAX_LOGS_RESPONSE_CHARS: usize = 4000;
const DEFAULT_LOG_LINES: usize = 20;

/// Keeps at most the last `max_chars` characters (not bytes) of `text`.
/// Counts by char, like the teacher's `truncate_str`, so a cut point never
/// lands inside a multi-byte UTF-8 sequence.
fn truncate_to_last_chars(text: &str, max_chars: usize) -> String {
    let char_count = text.chars().count();
    if char_count <= max_chars {
        text.to_string()
    } else {
        let skip = char_count - max_chars;
        text.chars().skip(skip).collect()
    }
}

/// What the caller should send back to the chat service. Help and
/// unknown-command responses get their own templates, so they are
/// distinguished here rather than folded into `Response`.
pub enum CommandOutcome {
    Response(String),
    Help,
    Unknown,
}

pub struct CommandHandler {
    driver: Arc<dyn ContainerDriver>,
    shared: Arc<SharedConfig>,
}

impl CommandHandler {
    pub fn new(driver: Arc<dyn ContainerDriver>, shared: Arc<SharedConfig>) -> Self {
        Self { driver, shared }
    }

    pub async fn handle(&self, text: &str, config: &AppConfig) -> CommandOutcome {
        let parts: Vec<&str> = text.split_whitespace().collect();
        let Some(command) = parts.first() else {
            return CommandOutcome::Unknown;
        };

        match command.to_lowercase().as_str() {
            "/start" => self.lifecycle(parts.get(1), |d, h| async move { d.start(&h).await }, "started").await,
            "/stop" => self.lifecycle(parts.get(1), |d, h| async move { d.stop(&h).await }, "stopped").await,
            "/restart" => self.lifecycle(parts.get(1), |d, h| async move { d.restart(&h).await }, "restarted").await,
            "/logs" => self.logs(&parts).await,
            "/stagnation" => self.stagnation(parts.get(1).copied()),
            "/stagnation_timer" => self.stagnation_timer(parts.get(1).copied()),
            "/status" => self.status(config),
            "/help" => CommandOutcome::Help,
            _ => CommandOutcome::Unknown,
        }
    }

    async fn lifecycle<F, Fut>(&self, cid: Option<&&str>, op: F, verb: &str) -> CommandOutcome
    where
        F: FnOnce(Arc<dyn ContainerDriver>, ContainerHandle) -> Fut,
        Fut: std::future::Future<Output = Result<(), crate::error::DriverError>>,
    {
        let Some(cid) = cid else {
            return CommandOutcome::Response("Missing argument: container id.".to_string());
        };
        let handle = ContainerHandle::new(cid.to_string());
        match op(Arc::clone(&self.driver), handle).await {
            Ok(()) => CommandOutcome::Response(format!("Container '{cid}' {verb}.")),
            Err(crate::error::DriverError::NotFound(_)) => {
                CommandOutcome::Response(format!("Container '{cid}' not found."))
            }
            Err(e) => CommandOutcome::Response(format!("Error: {e}")),
        }
    }

    async fn logs(&self, parts: &[&str]) -> CommandOutcome {
        let Some(cid) = parts.get(1) else {
            return CommandOutcome::Response("Usage: /logs <cid> [N]".to_string());
        };
        let n = match parts.get(2) {
            None => DEFAULT_LOG_LINES,
            Some(raw) => match raw.parse::<usize>() {
                Ok(n) if n > 0 => n,
                _ => return CommandOutcome::Response("N must be a positive integer.".to_string()),
            },
        };

        let handle = ContainerHandle::new(cid.to_string());
        match self.driver.tail_logs(&handle, n).await {
            Ok(text) => CommandOutcome::Response(truncate_to_last_chars(&text, MAX_LOGS_RESPONSE_CHARS)),
            Err(crate::error::DriverError::NotFound(_)) => {
                CommandOutcome::Response(format!("Container '{cid}' not found."))
            }
            Err(e) => CommandOutcome::Response(format!("Error: {e}")),
        }
    }

    fn stagnation(&self, sub: Option<&str>) -> CommandOutcome {
        match sub.map(|s| s.to_lowercase()) {
            Some(s) if s == "on" => {
                self.shared.set_stagnation_alert_enabled(true);
                CommandOutcome::Response("Stagnation alerts have been ENABLED.".to_string())
            }
            Some(s) if s == "off" => {
                self.shared.set_stagnation_alert_enabled(false);
                CommandOutcome::Response("Stagnation alerts have been DISABLED.".to_string())
            }
            Some(other) => CommandOutcome::Response(format!("Unknown sub-command '{other}'. Use 'on' or 'off'.")),
            None => CommandOutcome::Response("Missing sub-command. Use '/stagnation on' or '/stagnation off'.".to_string()),
        }
    }

    fn stagnation_timer(&self, arg: Option<&str>) -> CommandOutcome {
        let Some(arg) = arg else {
            return CommandOutcome::Response("Missing argument. Usage: /stagnation_timer <minutes>".to_string());
        };
        match arg.parse::<u64>() {
            Ok(minutes) if minutes > 0 => {
                self.shared.set_stagnation_threshold_minutes(minutes);
                CommandOutcome::Response(format!("Stagnation timer set to {minutes} minutes."))
            }
            Ok(_) => CommandOutcome::Response("Please provide a positive number of minutes.".to_string()),
            Err(_) => CommandOutcome::Response("Invalid number. Please provide an integer for minutes.".to_string()),
        }
    }

    fn status(&self, config: &AppConfig) -> CommandOutcome {
        let enabled = if self.shared.stagnation_alert_enabled() { "ENABLED" } else { "DISABLED" };
        let threshold = self.shared.stagnation_threshold_minutes();
        let count = config.containers.len();
        CommandOutcome::Response(format!(
            "<b>Watcher Status</b>\n- Monitoring {count} containers.\n- Stagnation Alerts: <b>{enabled}</b>\n- Stagnation Threshold: <b>{threshold} minutes</b>"
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container_driver::fake::{FakeContainer, FakeDriver};
    use std::collections::HashMap;
    use indexmap::IndexSet;

    fn make_config(n: usize) -> AppConfig {
        AppConfig {
            containers: (0..n).map(|i| format!("c{i}")).collect::<IndexSet<_>>(),
            check_interval_seconds: 10,
            tail_lines: 200,
            grace_period_seconds: 30,
            reputation_check_enabled: false,
            reputation_api_base_url: String::new(),
            reputation_check_window: 20,
            reputation_failure_threshold: 5,
            reputation_restart_cooldown_minutes: 30,
            node_addresses: HashMap::new(),
            secrets: crate::config::Secrets {
                telegram_bot_token: None,
                telegram_chat_id: None,
                rpc_url: "http://localhost".to_string(),
            },
        }
    }

    fn make_handler() -> (CommandHandler, Arc<FakeDriver>) {
        let driver = Arc::new(FakeDriver::new());
        let shared = crate::config::SharedConfig::new(true, 30);
        (CommandHandler::new(driver.clone(), shared), driver)
    }

    #[tokio::test]
    async fn start_missing_cid_reports_missing_argument() {
        let (handler, _driver) = make_handler();
        let config = make_config(0);
        match handler.handle("/start", &config).await {
            CommandOutcome::Response(r) => assert!(r.contains("Missing argument")),
            _ => panic!("expected response"),
        }
    }

    #[tokio::test]
    async fn restart_unknown_container_reports_not_found() {
        let (handler, _driver) = make_handler();
        let config = make_config(0);
        match handler.handle("/restart ghost", &config).await {
            CommandOutcome::Response(r) => assert!(r.contains("not found")),
            _ => panic!("expected response"),
        }
    }

    #[tokio::test]
    async fn start_existing_container_reports_started() {
        let (handler, driver) = make_handler();
        driver.set("c0", FakeContainer::stopped());
        let config = make_config(1);
        match handler.handle("/start c0", &config).await {
            CommandOutcome::Response(r) => assert!(r.contains("started")),
            _ => panic!("expected response"),
        }
    }

    #[tokio::test]
    async fn stagnation_on_off_mutates_shared_config() {
        let (handler, _driver) = make_handler();
        let config = make_config(0);
        handler.handle("/stagnation off", &config).await;
        assert!(!handler.shared.stagnation_alert_enabled());
        handler.handle("/stagnation on", &config).await;
        assert!(handler.shared.stagnation_alert_enabled());
    }

    #[tokio::test]
    async fn stagnation_timer_rejects_non_positive() {
        let (handler, _driver) = make_handler();
        let config = make_config(0);
        match handler.handle("/stagnation_timer 0", &config).await {
            CommandOutcome::Response(r) => assert!(r.contains("positive")),
            _ => panic!("expected response"),
        }
        match handler.handle("/stagnation_timer abc", &config).await {
            CommandOutcome::Response(r) => assert!(r.contains("Invalid number")),
            _ => panic!("expected response"),
        }
    }

    #[tokio::test]
    async fn stagnation_timer_updates_threshold() {
        let (handler, _driver) = make_handler();
        let config = make_config(0);
        handler.handle("/stagnation_timer 5", &config).await;
        assert_eq!(handler.shared.stagnation_threshold_minutes(), 5);
    }

    #[tokio::test]
    async fn status_reports_container_count() {
        let (handler, _driver) = make_handler();
        let config = make_config(3);
        match handler.handle("/status", &config).await {
            CommandOutcome::Response(r) => assert!(r.contains('3')),
            _ => panic!("expected response"),
        }
    }

    #[tokio::test]
    async fn help_and_unknown_are_distinguished() {
        let (handler, _driver) = make_handler();
        let config = make_config(0);
        assert!(matches!(handler.handle("/help", &config).await, CommandOutcome::Help));
        assert!(matches!(handler.handle("/bogus", &config).await, CommandOutcome::Unknown));
    }

    #[tokio::test]
    async fn logs_truncates_to_4000_chars() {
        let (handler, driver) = make_handler();
        let long_logs = "x".repeat(5000);
        driver.set("c0", FakeContainer::running(long_logs));
        let config = make_config(1);
        match handler.handle("/logs c0", &config).await {
            CommandOutcome::Response(r) => assert_eq!(r.chars().count(), MAX_LOGS_RESPONSE_CHARS),
            _ => panic!("expected response"),
        }
    }

    // Regression: a cut point landing inside a multi-byte character must
    // not panic, and the kept tail must still be valid UTF-8.
    #[tokio::test]
    async fn logs_truncation_is_char_boundary_safe_with_multibyte_content() {
        let (handler, driver) = make_handler();
        let mut long_logs = "x".repeat(MAX_LOGS_RESPONSE_CHARS - 1);
        long_logs.push_str("\u{e9}\u{1f600}tail"); // accented char + emoji near the cut
        driver.set("c0", FakeContainer::running(long_logs));
        let config = make_config(1);
        match handler.handle("/logs c0", &config).await {
            CommandOutcome::Response(r) => {
                assert_eq!(r.chars().count(), MAX_LOGS_RESPONSE_CHARS);
                assert!(r.ends_with("tail"));
            }
            _ => panic!("expected response"),
        }
    }

    #[test]
    fn truncate_to_last_chars_keeps_tail_and_counts_chars_not_bytes() {
        assert_eq!(truncate_to_last_chars("hello", 10), "hello");
        // 6 chars, the first 3 multi-byte; keeping the last 3 must land on
        // char boundaries, not byte offsets.
        assert_eq!(truncate_to_last_chars("\u{e9}\u{e9}\u{e9}abc", 3), "abc");
    }
}
