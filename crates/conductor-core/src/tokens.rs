//! Token usage estimation
//!
//! No reliable counter is exposed by the assistant CLI, so usage is
//! approximated by counting observed response cycles per session inside a
//! rolling window. Deliberately conservative; the thresholds are exposed
//! through config so drift can be tuned rather than fixed.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

use crate::config::TokensConfig;

/// Messages allowed per window, by plan tier.
const TIER_LIMITS: [(&str, i64); 3] = [("pro", 45), ("mid", 225), ("high", 900)];

/// Burst shape treated as one response cycle: quiet at least this long...
const BOUNDARY_IDLE_SECS: f64 = 3.0;
/// ...followed by at least this many fresh lines.
const BOUNDARY_MIN_LINES: usize = 5;

/// Threshold level crossed by the aggregate usage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThresholdLevel {
    Warning,
    Danger,
    Critical,
}

impl ThresholdLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            ThresholdLevel::Warning => "warning",
            ThresholdLevel::Danger => "danger",
            ThresholdLevel::Critical => "critical",
        }
    }
}

/// Snapshot returned by [`TokenEstimator::usage`].
#[derive(Debug, Clone, PartialEq)]
pub struct Usage {
    pub used: i64,
    pub limit: i64,
    pub percentage: u8,
    pub reset_in_seconds: Option<u64>,
    pub tier: String,
}

struct WindowState {
    counts: HashMap<String, i64>,
    window_start: Option<Instant>,
}

/// Counts response cycles against the plan-tier budget.
pub struct TokenEstimator {
    config: TokensConfig,
    state: Mutex<WindowState>,
}

impl TokenEstimator {
    pub fn new(config: TokensConfig) -> Self {
        Self {
            config,
            state: Mutex::new(WindowState {
                counts: HashMap::new(),
                window_start: None,
            }),
        }
    }

    fn window_seconds(&self) -> u64 {
        self.config.window_hours * 3600
    }

    pub fn tier_limit(&self) -> i64 {
        TIER_LIMITS
            .iter()
            .find(|(tier, _)| *tier == self.config.plan_tier)
            .map(|(_, limit)| *limit)
            .unwrap_or(TIER_LIMITS[0].1)
    }

    /// Record one observed response cycle for a session. Resets the
    /// window automatically once it has elapsed.
    pub fn record_response(&self, session_id: &str) {
        let mut state = self.state.lock().unwrap();
        if let Some(start) = state.window_start {
            if start.elapsed().as_secs() >= self.window_seconds() {
                state.counts.clear();
                state.window_start = None;
            }
        }
        *state.counts.entry(session_id.to_string()).or_insert(0) += 1;
        if state.window_start.is_none() {
            state.window_start = Some(Instant::now());
        }
    }

    /// Usage for one session, or the aggregate when `session_id` is None.
    pub fn usage(&self, session_id: Option<&str>) -> Usage {
        let state = self.state.lock().unwrap();
        let limit = self.tier_limit();
        let used = match session_id {
            Some(id) => state.counts.get(id).copied().unwrap_or(0),
            None => state.counts.values().sum(),
        };
        let percentage = if limit > 0 {
            ((used * 100) / limit).min(100) as u8
        } else {
            0
        };
        let reset_in_seconds = state.window_start.map(|start| {
            self.window_seconds()
                .saturating_sub(start.elapsed().as_secs())
        });
        Usage {
            used,
            limit,
            percentage,
            reset_in_seconds,
            tier: self.config.plan_tier.clone(),
        }
    }

    /// Highest threshold crossed by aggregate usage, if any.
    pub fn check_thresholds(&self) -> Option<ThresholdLevel> {
        let pct = self.usage(None).percentage;
        if pct >= self.config.critical_pct {
            Some(ThresholdLevel::Critical)
        } else if pct >= self.config.danger_pct {
            Some(ThresholdLevel::Danger)
        } else if pct >= self.config.warning_pct {
            Some(ThresholdLevel::Warning)
        } else {
            None
        }
    }

    /// Does this idle-then-burst shape look like a finished response?
    /// Undercounts short replies; no better signal is available.
    pub fn detect_message_boundary(idle_seconds: f64, new_line_count: usize) -> bool {
        idle_seconds > BOUNDARY_IDLE_SECS && new_line_count > BOUNDARY_MIN_LINES
    }

    /// Clear all counts and the window start.
    pub fn reset_window(&self) {
        let mut state = self.state.lock().unwrap();
        state.counts.clear();
        state.window_start = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn estimator(tier: &str) -> TokenEstimator {
        TokenEstimator::new(TokensConfig {
            plan_tier: tier.to_string(),
            ..TokensConfig::default()
        })
    }

    #[test]
    fn test_tier_limits() {
        assert_eq!(estimator("pro").tier_limit(), 45);
        assert_eq!(estimator("mid").tier_limit(), 225);
        assert_eq!(estimator("high").tier_limit(), 900);
        // unknown tiers fall back to pro
        assert_eq!(estimator("enterprise").tier_limit(), 45);
    }

    #[test]
    fn test_per_session_and_aggregate_counts() {
        let est = estimator("pro");
        est.record_response("a");
        est.record_response("a");
        est.record_response("b");

        assert_eq!(est.usage(Some("a")).used, 2);
        assert_eq!(est.usage(Some("b")).used, 1);
        assert_eq!(est.usage(None).used, 3);
        assert_eq!(est.usage(Some("missing")).used, 0);
    }

    #[test]
    fn test_percentage_capped_at_100() {
        let est = estimator("pro");
        for _ in 0..60 {
            est.record_response("a");
        }
        assert_eq!(est.usage(None).percentage, 100);
    }

    #[test]
    fn test_thresholds() {
        let est = estimator("pro");
        assert_eq!(est.check_thresholds(), None);

        // 80% of 45 = 36
        for _ in 0..36 {
            est.record_response("a");
        }
        assert_eq!(est.check_thresholds(), Some(ThresholdLevel::Warning));

        for _ in 0..5 {
            est.record_response("a");
        }
        // 41/45 = 91%
        assert_eq!(est.check_thresholds(), Some(ThresholdLevel::Danger));

        for _ in 0..2 {
            est.record_response("a");
        }
        // 43/45 = 95%
        assert_eq!(est.check_thresholds(), Some(ThresholdLevel::Critical));
    }

    #[test]
    fn test_reset_window() {
        let est = estimator("pro");
        est.record_response("a");
        assert!(est.usage(None).reset_in_seconds.is_some());
        est.reset_window();
        assert_eq!(est.usage(None).used, 0);
        assert!(est.usage(None).reset_in_seconds.is_none());
    }

    #[test]
    fn test_message_boundary_heuristic() {
        assert!(TokenEstimator::detect_message_boundary(8.0, 12));
        assert!(!TokenEstimator::detect_message_boundary(1.0, 12));
        assert!(!TokenEstimator::detect_message_boundary(8.0, 3));
        // boundaries are strict
        assert!(!TokenEstimator::detect_message_boundary(3.0, 5));
    }
}
