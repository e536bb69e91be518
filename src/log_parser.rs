//! Scans a container's log tail for the `(session_id, state)` pair and the
//! two fatal symptom patterns.
//!
//! The state line is matched by two decimal-integer capture groups,
//! scanned in reverse so the last match wins; the symptom scan looks for
//! two fixed literal substrings.

use regex::Regex;
use std::sync::LazyLock;

pub const PATTERN_TRACEBACK: &str = "Traceback (most recent call last)";
pub const PATTERN_PING_FAIL: &str = "Ping attempt failed";
const PING_FAIL_TAIL_LINES: usize = 52;

static RE_LOG_STATE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Session\s+(\d+)\s*\|\s*State\s+(\d+)").expect("state regex is valid")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionPair {
    pub session_id: i64,
    pub state: i64,
}

#[derive(Debug, Clone, Default)]
pub struct ParsedTail {
    pub pair: Option<SessionPair>,
    pub has_traceback: bool,
    pub ping_failure_count: usize,
}

/// Parses a raw log tail. Scans lines in reverse for the last
/// `(session_id, state)` match; scans the whole tail for the traceback
/// literal; scans only the last [`PING_FAIL_TAIL_LINES`] lines for ping
/// failures.
pub fn parse_tail(tail: &str) -> ParsedTail {
    let lines: Vec<&str> = tail.lines().collect();

    let pair = lines.iter().rev().find_map(|line| {
        RE_LOG_STATE.captures(line).map(|caps| SessionPair {
            session_id: caps[1].parse().unwrap_or(0),
            state: caps[2].parse().unwrap_or(0),
        })
    });

    let has_traceback = lines.iter().any(|line| line.contains(PATTERN_TRACEBACK));

    let window_start = lines.len().saturating_sub(PING_FAIL_TAIL_LINES);
    let ping_failure_count = lines[window_start..]
        .iter()
        .filter(|line| line.contains(PATTERN_PING_FAIL))
        .count();

    ParsedTail {
        pair,
        has_traceback,
        ping_failure_count,
    }
}
