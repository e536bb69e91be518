//! Reputation probe: queries an external task-outcome API per node and
//! flags containers whose recent failure count crosses a threshold.
//!
//! The HTTP shape follows the same `reqwest` idiom as [`crate::notifier`].

use std::time::Duration;

use serde::Deserialize;
use tracing::{error, warn};

const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Deserialize)]
struct StageOutcome {
    #[serde(default)]
    all_timestamps: Vec<String>,
    #[serde(default)]
    success_timestamps: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct NodeReputation {
    #[serde(default)]
    precommit: Option<StageOutcome>,
    #[serde(default)]
    commit: Option<StageOutcome>,
}

/// Counts, for one stage, how many of the last `window` entries in
/// `all_timestamps` are absent from `success_timestamps`.
fn failed_count(stage: &StageOutcome, window: usize) -> usize {
    let recent_start = stage.all_timestamps.len().saturating_sub(window);
    let recent = &stage.all_timestamps[recent_start..];
    let succeeded: std::collections::HashSet<&str> =
        stage.success_timestamps.iter().map(|s| s.as_str()).collect();
    recent.iter().filter(|ts| !succeeded.contains(ts.as_str())).count()
}

pub struct ReputationProbe {
    http: reqwest::Client,
    base_url: String,
}

impl ReputationProbe {
    pub fn new(base_url: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url,
        }
    }

    /// Checks one node's recent precommit/commit outcomes. Returns the
    /// worst (highest) failed-task count across stages, or `None` if the
    /// node has no data (404) or the request failed.
    pub async fn check_node(&self, address: &str, window: usize) -> Option<usize> {
        let url = format!("{}/{}", self.base_url.trim_end_matches('/'), address);
        let resp = match self.http.get(&url).timeout(PROBE_TIMEOUT).send().await {
            Ok(r) => r,
            Err(e) => {
                warn!(address, error = %e, "reputation probe transport error, skipping node");
                return None;
            }
        };

        if resp.status().as_u16() == 404 {
            return None;
        }
        if !resp.status().is_success() {
            warn!(address, status = %resp.status(), "reputation probe returned non-2xx, skipping node");
            return None;
        }

        let body: NodeReputation = match resp.json().await {
            Ok(b) => b,
            Err(e) => {
                error!(address, error = %e, "failed to decode reputation response, skipping node");
                return None;
            }
        };

        let mut worst = None;
        for stage in [body.precommit.as_ref(), body.commit.as_ref()].into_iter().flatten() {
            let failed = failed_count(stage, window);
            worst = Some(worst.map_or(failed, |w: usize| w.max(failed)));
        }
        worst
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stage(all: &[&str], success: &[&str]) -> StageOutcome {
        StageOutcome {
            all_timestamps: all.iter().map(|s| s.to_string()).collect(),
            success_timestamps: success.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn failed_count_counts_recent_entries_missing_from_success() {
        let all = ["t1", "t2", "t3", "t4", "t5"];
        let success = ["t1", "t3", "t5"];
        let s = stage(&all, &success);
        assert_eq!(failed_count(&s, 5), 2);
    }

    #[test]
    fn failed_count_respects_window_size() {
        let all = ["t1", "t2", "t3", "t4", "t5"];
        let success: [&str; 0] = [];
        let s = stage(&all, &success);
        // Only the last 2 entries are "recent".
        assert_eq!(failed_count(&s, 2), 2);
    }

    #[test]
    fn failed_count_zero_when_all_recent_succeeded() {
        let all = ["t1", "t2", "t3"];
        let success = ["t1", "t2", "t3"];
        let s = stage(&all, &success);
        assert_eq!(failed_count(&s, 3), 0);
    }

    #[test]
    fn scenario_s4_six_of_twenty_fail_crosses_threshold_five() {
        let all: Vec<String> = (0..20).map(|i| format!("t{i}")).collect();
        let success: Vec<String> = (0..14).map(|i| format!("t{i}")).collect(); // 14 succeed, 6 fail
        let s = StageOutcome {
            all_timestamps: all,
            success_timestamps: success,
        };
        let failed = failed_count(&s, 20);
        assert_eq!(failed, 6);
        assert!(failed >= 5);
    }
}
