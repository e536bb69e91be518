//! The supervision loop: per-container state machine, majority
//! computation, stagnation detection, and the restart pipeline.
//!
//! This is the heart of the watcher: a single `tokio::select!`-driven task
//! that ticks on an interval, gathers one status sample per container,
//! computes the fleet majority, updates the stagnation tracker, then walks
//! the policy ladder and fires restarts through the container driver and
//! the notifier.

use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures_util::FutureExt;
use indexmap::IndexMap;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::{AppConfig, SharedConfig};
use crate::container_driver::{ContainerDriver, ContainerHandle};
use crate::log_parser::{self, SessionPair};
use crate::notifier::Notifier;
use crate::reputation::ReputationProbe;

/// Interval after supervisor start during which symptom- and deviation-
/// based restarts are suppressed. Five minutes is a conservative default
/// that lets a freshly restarted node's container settle before the
/// policy ladder starts counting against it. See DESIGN.md.
pub const WARMUP_SECONDS: i64 = 300;

/// Not configurable; see DESIGN.md.
fn id_lag_threshold() -> ChronoDuration {
    ChronoDuration::minutes(2)
}

const REASON_STATE_DEVIATION: &str = "State Deviation";
const REASON_SESSION_ID_LAG: &str = "Session ID Lag";
const REASON_PYTHON_TRACEBACK: &str = "Python Traceback";
const REASON_PING_FAILURE: &str = "Ping Failure";
const REASON_INACTIVE_NODE: &str = "Inactive Node";
const REASON_REPUTATION_FAILURE: &str = "Reputation Failure";

/// Session state value a node reports once it has concluded a consensus
/// session; used by the "Inactive Node" branch of the policy ladder.
const CONCLUDED_SESSION_STATE: i64 = 6;

#[derive(Debug, Clone, Default)]
pub struct PerContainerState {
    pub state_deviation_start: Option<DateTime<Utc>>,
    pub id_lag_start: Option<DateTime<Utc>>,
    pub warmed_up: bool,
    pub reputation_cooldown_until: Option<DateTime<Utc>>,
}

impl PerContainerState {
    fn clear_timers(&mut self) {
        self.state_deviation_start = None;
        self.id_lag_start = None;
    }
}

#[derive(Debug, Default)]
struct MajorityTracker {
    last_seen_pair: Option<SessionPair>,
    stagnation_start: Option<DateTime<Utc>>,
    alert_sent_for: Option<SessionPair>,
}

/// Per-container result of one tick's status-gather phase. A container
/// whose traceback/ping-fail/reputation symptom already triggered a
/// restart this tick is `Handled` and is excluded from majority
/// computation and the policy ladder.
enum ContainerOutcome {
    Handled,
    Sample {
        handle: Option<ContainerHandle>,
        is_running: bool,
        docker_status: String,
        pair: Option<SessionPair>,
    },
}

pub struct Supervisor {
    config: AppConfig,
    shared: Arc<SharedConfig>,
    driver: Arc<dyn ContainerDriver>,
    notifier: Arc<Notifier>,
    reputation: Option<ReputationProbe>,
    states: IndexMap<String, PerContainerState>,
    majority: MajorityTracker,
    start_time: DateTime<Utc>,
    log_dir: PathBuf,
    event_log_path: PathBuf,
}

impl Supervisor {
    pub fn new(
        config: AppConfig,
        shared: Arc<SharedConfig>,
        driver: Arc<dyn ContainerDriver>,
        notifier: Arc<Notifier>,
        log_dir: PathBuf,
        event_log_path: PathBuf,
    ) -> Self {
        let reputation = if config.reputation_check_enabled {
            Some(ReputationProbe::new(config.reputation_api_base_url.clone()))
        } else {
            None
        };
        let states = config
            .containers
            .iter()
            .map(|name| (name.clone(), PerContainerState::default()))
            .collect();

        std::fs::create_dir_all(&log_dir).ok();

        Self {
            config,
            shared,
            driver,
            notifier,
            reputation,
            states,
            majority: MajorityTracker::default(),
            start_time: Utc::now(),
            log_dir,
            event_log_path,
        }
    }

    /// Runs the supervisor loop until `stop` is cancelled. A tick that
    /// fails wholesale is logged, alerted best-effort, and retried after a
    /// short sleep rather than propagating out.
    pub async fn run(&mut self, stop: CancellationToken) {
        self.notifier.send_watcher_start_message().await;
        let interval = std::time::Duration::from_secs(self.config.check_interval_seconds);

        loop {
            if stop.is_cancelled() {
                break;
            }

            if let Err(panic) = AssertUnwindSafe(self.tick()).catch_unwind().await {
                let message = panic_message(&panic);
                error!(error = %message, "unhandled error in supervisor tick, sleeping and continuing");
                self.notifier.send_watcher_error_message(&message).await;
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = tokio::time::sleep(std::time::Duration::from_secs(10)) => {}
                }
                continue;
            }

            tokio::select! {
                _ = stop.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }

        self.notifier.send_watcher_stop_message().await;
    }

    /// Executes one tick. Public so scenario tests can drive it directly.
    pub async fn tick(&mut self) {
        let now = Utc::now();
        self.apply_warmup_latch(now);

        let mut restarted_this_tick = HashSet::new();
        if self.reputation.is_some() {
            restarted_this_tick = self.run_reputation_sweep(now).await;
        }

        let samples = self.gather_samples(now, &restarted_this_tick).await;

        let running_parsed: Vec<(String, SessionPair)> = samples
            .iter()
            .filter_map(|(name, outcome)| match outcome {
                ContainerOutcome::Sample { is_running: true, pair: Some(pair), .. } => {
                    Some((name.clone(), *pair))
                }
                _ => None,
            })
            .collect();

        if running_parsed.len() < 2 {
            warn!("not enough nodes reporting a valid status to determine a majority");
            return;
        }

        let majority_pair = compute_majority(&running_parsed);
        info!(?majority_pair, "network majority");

        self.update_stagnation(now, majority_pair).await;
        self.evaluate_containers(now, majority_pair, samples).await;
    }

    fn apply_warmup_latch(&mut self, now: DateTime<Utc>) {
        let warmed = (now - self.start_time) >= ChronoDuration::seconds(WARMUP_SECONDS);
        for state in self.states.values_mut() {
            // Monotonic latch: never regresses once true.
            state.warmed_up = state.warmed_up || warmed;
        }
    }

    async fn run_reputation_sweep(&mut self, now: DateTime<Utc>) -> HashSet<String> {
        let mut restarted = HashSet::new();
        let Some(probe) = &self.reputation else { return restarted };

        for name in self.config.containers.clone() {
            let Some(state) = self.states.get(&name) else { continue };
            if let Some(cooldown) = state.reputation_cooldown_until {
                if cooldown > now {
                    continue;
                }
            }
            let Some(address) = self.config.node_addresses.get(&name).cloned() else { continue };

            let Some(failed) = probe.check_node(&address, self.config.reputation_check_window).await else {
                continue;
            };
            if failed < self.config.reputation_failure_threshold {
                continue;
            }
            if !state.warmed_up {
                continue;
            }

            let details = format!(
                "{failed} of the last {} task outcomes failed (threshold {}).",
                self.config.reputation_check_window, self.config.reputation_failure_threshold
            );
            let handle = ContainerHandle::new(name.clone());
            self.restart(handle, &name, REASON_REPUTATION_FAILURE, &details, now).await;
            restarted.insert(name);
        }

        restarted
    }

    async fn gather_samples(
        &mut self,
        now: DateTime<Utc>,
        already_handled: &HashSet<String>,
    ) -> IndexMap<String, ContainerOutcome> {
        let mut samples = IndexMap::new();

        for name in self.config.containers.clone() {
            if already_handled.contains(&name) {
                samples.insert(name, ContainerOutcome::Handled);
                continue;
            }

            let status = match self.driver.list_status(&name).await {
                Ok(status) => status,
                Err(e) => {
                    warn!(container = %name, error = %e, "error fetching container status");
                    samples.insert(
                        name,
                        ContainerOutcome::Sample {
                            handle: None,
                            is_running: false,
                            docker_status: "unknown".to_string(),
                            pair: None,
                        },
                    );
                    continue;
                }
            };

            if !status.is_running {
                samples.insert(
                    name,
                    ContainerOutcome::Sample {
                        handle: Some(status.handle),
                        is_running: false,
                        docker_status: status.docker_status,
                        pair: None,
                    },
                );
                continue;
            }

            let tail = match self.driver.tail_logs(&status.handle, self.config.tail_lines).await {
                Ok(text) => text,
                Err(e) => {
                    warn!(container = %name, error = %e, "error fetching container logs");
                    samples.insert(
                        name,
                        ContainerOutcome::Sample {
                            handle: Some(status.handle),
                            is_running: true,
                            docker_status: status.docker_status,
                            pair: None,
                        },
                    );
                    continue;
                }
            };

            let parsed = log_parser::parse_tail(&tail);
            let warmed_up = self.states.get(&name).map(|s| s.warmed_up).unwrap_or(false);

            if warmed_up && parsed.has_traceback {
                let details = "A traceback was detected in the node's log output, indicating a fatal error.".to_string();
                self.restart(status.handle, &name, REASON_PYTHON_TRACEBACK, &details, now).await;
                samples.insert(name, ContainerOutcome::Handled);
                continue;
            }

            if warmed_up && parsed.ping_failure_count >= 2 {
                let details = format!("{} ping failures found in the recent log tail.", parsed.ping_failure_count);
                self.restart(status.handle, &name, REASON_PING_FAILURE, &details, now).await;
                samples.insert(name, ContainerOutcome::Handled);
                continue;
            }

            samples.insert(
                name,
                ContainerOutcome::Sample {
                    handle: Some(status.handle),
                    is_running: true,
                    docker_status: status.docker_status,
                    pair: parsed.pair,
                },
            );
        }

        samples
    }

    async fn update_stagnation(&mut self, now: DateTime<Utc>, majority_pair: SessionPair) {
        if self.majority.last_seen_pair != Some(majority_pair) {
            info!(?majority_pair, "majority has progressed, resetting stagnation timer");
            self.majority.last_seen_pair = Some(majority_pair);
            self.majority.stagnation_start = None;
            self.majority.alert_sent_for = None;
            return;
        }

        match self.majority.stagnation_start {
            None => {
                self.majority.stagnation_start = Some(now);
                info!(?majority_pair, "stagnation timer started");
            }
            Some(start) => {
                let elapsed = now - start;
                let threshold = ChronoDuration::minutes(self.shared.stagnation_threshold_minutes() as i64);
                if elapsed >= threshold
                    && self.shared.stagnation_alert_enabled()
                    && self.majority.alert_sent_for != Some(majority_pair)
                {
                    warn!(?majority_pair, minutes = elapsed.num_minutes(), "network stagnation detected");
                    self.notifier
                        .send_stagnation_alert((majority_pair.session_id, majority_pair.state), self.shared.stagnation_threshold_minutes())
                        .await;
                    self.majority.alert_sent_for = Some(majority_pair);
                }
            }
        }
    }

    async fn evaluate_containers(
        &mut self,
        now: DateTime<Utc>,
        majority_pair: SessionPair,
        samples: IndexMap<String, ContainerOutcome>,
    ) {
        let grace_period = ChronoDuration::seconds(self.config.grace_period_seconds as i64);

        for (name, outcome) in samples {
            let ContainerOutcome::Sample { handle, is_running, docker_status, pair } = outcome else {
                continue;
            };

            if !is_running {
                if majority_pair.state == CONCLUDED_SESSION_STATE {
                    if let Some(handle) = handle {
                        let details = format!("Node status was '{docker_status}' while majority concluded the session.");
                        self.restart(handle, &name, REASON_INACTIVE_NODE, &details, now).await;
                        continue;
                    }
                }
                warn!(container = %name, status = %docker_status, "container is not running");
                continue;
            }

            let Some(pair) = pair else {
                warn!(container = %name, "could not parse state for running container");
                continue;
            };

            let handle = handle.expect("running container always has a handle");
            let state = self.states.entry(name.clone()).or_default();

            if pair == majority_pair {
                state.clear_timers();
                info!(container = %name, ?pair, "in sync with majority");
                continue;
            }

            if pair.state != majority_pair.state {
                match state.state_deviation_start {
                    None => {
                        state.state_deviation_start = Some(now);
                        warn!(container = %name, state = pair.state, majority_state = majority_pair.state, "state deviation detected, starting grace timer");
                    }
                    Some(start) => {
                        let elapsed = now - start;
                        if elapsed >= grace_period {
                            if state.warmed_up {
                                let details = format!(
                                    "Node state was {} at session {}, majority is at state {} (session {}). Lagged for {}s.",
                                    pair.state, pair.session_id, majority_pair.state, majority_pair.session_id, elapsed.num_seconds()
                                );
                                self.restart(handle, &name, REASON_STATE_DEVIATION, &details, now).await;
                            } else {
                                warn!(container = %name, "state deviation detected but not restarting (still in warm-up)");
                            }
                        } else {
                            info!(container = %name, elapsed = elapsed.num_seconds(), grace = grace_period.num_seconds(), "state deviating within grace period");
                        }
                    }
                }
                continue;
            }

            // state matches majority: id lag, leading, or exact sync (handled above)
            if pair.session_id < majority_pair.session_id {
                match state.id_lag_start {
                    None => {
                        state.id_lag_start = Some(now);
                        warn!(container = %name, session_id = pair.session_id, majority_id = majority_pair.session_id, "session id lag detected, starting timer");
                    }
                    Some(start) => {
                        let elapsed = now - start;
                        if elapsed >= id_lag_threshold() {
                            if state.warmed_up {
                                let details = format!(
                                    "Node stuck at session {} while majority progressed to {}. Lagged for over 2 minutes.",
                                    pair.session_id, majority_pair.session_id
                                );
                                self.restart(handle, &name, REASON_SESSION_ID_LAG, &details, now).await;
                            } else {
                                warn!(container = %name, "session id lag detected but not restarting (still in warm-up)");
                            }
                        } else {
                            info!(container = %name, elapsed = elapsed.num_seconds(), "session id lagging");
                        }
                    }
                }
            } else {
                // Leading id: not a deviation, timers clear same as in-sync.
                state.clear_timers();
                info!(container = %name, ?pair, "ahead of majority id, not a lag");
            }
        }
    }

    /// The restart pipeline: capture logs, append the event log, alert,
    /// clear timers, set cooldown if applicable, then actually restart.
    /// Each step is isolated so a logging/notification failure
    /// never prevents the restart attempt itself.
    async fn restart(&mut self, handle: ContainerHandle, cid: &str, reason: &str, details: &str, now: DateTime<Utc>) {
        let timestamp_str = now.format("%Y%m%dT%H%M%S").to_string();
        let reason_slug = reason.to_lowercase().replace(' ', "_");
        let log_filename = format!("{cid}_{reason_slug}_{timestamp_str}.log");

        warn!(container = %cid, reason, details, "restarting container");

        match self.driver.tail_logs(&handle, 500).await {
            Ok(text) => {
                if let Err(e) = std::fs::write(self.log_dir.join(&log_filename), text) {
                    warn!(container = %cid, error = %e, "failed to write restart log dump");
                }
            }
            Err(e) => warn!(container = %cid, error = %e, "failed to capture logs for restart dump"),
        }

        let event_line = format!(
            "{} | RESTART | Container: {cid} | Reason: {reason} | Details: {details} | Logfile: {log_filename}\n",
            now.to_rfc3339(),
        );
        if let Err(e) = append_event_log(&self.event_log_path, &event_line) {
            warn!(container = %cid, error = %e, "failed to append event log");
        }

        self.notifier
            .send_restart_alert(cid, reason, details, &now.format("%Y-%m-%d %H:%M:%S UTC").to_string())
            .await;

        if let Some(state) = self.states.get_mut(cid) {
            state.clear_timers();
            if reason == REASON_REPUTATION_FAILURE {
                state.reputation_cooldown_until =
                    Some(now + ChronoDuration::minutes(self.config.reputation_restart_cooldown_minutes as i64));
            }
        }

        if let Err(e) = self.driver.restart(&handle).await {
            warn!(container = %cid, error = %e, "restart command failed, will retry next tick");
            self.notifier.send_restart_failure_alert(cid).await;
        } else {
            info!(container = %cid, "restart command sent successfully");
        }
    }

    /// Test-only accessor, kept out of `#[cfg(test)]` so the scenario tests
    /// in `tests/integration_test.rs` (which link this crate as an ordinary
    /// dependency, not under its own `cargo test` cfg) can see it too.
    pub fn state_of(&self, cid: &str) -> Option<&PerContainerState> {
        self.states.get(cid)
    }

    /// Test-only: see [`Supervisor::state_of`].
    pub fn force_warmed_up(&mut self) {
        for s in self.states.values_mut() {
            s.warmed_up = true;
        }
    }

    /// Test-only: see [`Supervisor::state_of`].
    pub fn set_start_time(&mut self, start_time: DateTime<Utc>) {
        self.start_time = start_time;
    }
}

/// Extracts a human-readable message from a caught panic payload. Only
/// SIGINT/SIGTERM should cause orderly shutdown; any other unhandled error
/// in a tick is self-healing — logged, alerted, and retried next tick.
fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn append_event_log(path: &std::path::Path, line: &str) -> std::io::Result<()> {
    use std::io::Write;
    let mut file = std::fs::OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(line.as_bytes())
}

/// Computes the mode of `pairs`, breaking ties by first-encountered order:
/// a tally over containers visited in their configured order, where a
/// candidate only replaces the current leader on a strictly higher count.
fn compute_majority(pairs: &[(String, SessionPair)]) -> SessionPair {
    let mut counts: IndexMap<SessionPair, usize> = IndexMap::new();
    for (_, pair) in pairs {
        *counts.entry(*pair).or_insert(0) += 1;
    }

    let mut best: Option<(SessionPair, usize)> = None;
    for (pair, count) in counts {
        match best {
            None => best = Some((pair, count)),
            Some((_, best_count)) if count > best_count => best = Some((pair, count)),
            _ => {}
        }
    }
    best.expect("pairs is non-empty by caller invariant").0
}
