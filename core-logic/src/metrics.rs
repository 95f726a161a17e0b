use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Point-in-time view of a spam run, relayed to listeners and optionally
/// embedded in the message of outgoing transactions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    pub txs_succeeded: u64,
    pub txs_failed: u64,
    pub bad_branch: u64,
    pub bad_trunk: u64,
    pub bad_trunk_and_branch: u64,
    pub milestone_trunk: u64,
    pub milestone_branch: u64,
    pub tps: f64,
    pub error_rate: f64,
    pub cached_tx: u64,
    pub new_tx: u64,
    pub confirmation_rate: f64,
}

/// Running counters of a spam run. Owned by the metrics router; readers
/// take snapshots through [`Tally::summary`].
#[derive(Debug, Clone, Default)]
pub struct Tally {
    pub succeeded: u64,
    pub failed: u64,
    pub bad_trunk: u64,
    pub bad_branch: u64,
    pub bad_trunk_and_branch: u64,
    pub milestone_trunk: u64,
    pub milestone_branch: u64,
    pub cached: u64,
    pub fetched: u64,
    pub confirmation_rate: f64,
}

impl Tally {
    pub fn tps(&self, elapsed: Duration) -> f64 {
        let secs = elapsed.as_secs_f64();
        if secs > 0.0 {
            self.succeeded as f64 / secs
        } else {
            0.0
        }
    }

    /// Percentage of attempts that succeeded, `None` before the first attempt.
    pub fn success_rate(&self) -> Option<f64> {
        let attempts = self.succeeded + self.failed;
        if attempts == 0 {
            None
        } else {
            Some(100.0 * self.succeeded as f64 / attempts as f64)
        }
    }

    pub fn error_rate(&self) -> f64 {
        self.success_rate().map(|rate| 100.0 - rate).unwrap_or(0.0)
    }

    pub fn summary(&self, elapsed: Duration) -> Summary {
        Summary {
            txs_succeeded: self.succeeded,
            txs_failed: self.failed,
            bad_branch: self.bad_branch,
            bad_trunk: self.bad_trunk,
            bad_trunk_and_branch: self.bad_trunk_and_branch,
            milestone_trunk: self.milestone_trunk,
            milestone_branch: self.milestone_branch,
            tps: self.tps(elapsed),
            error_rate: self.error_rate(),
            cached_tx: self.cached,
            new_tx: self.fetched,
            confirmation_rate: self.confirmation_rate,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_rate_is_zero_without_attempts() {
        let tally = Tally::default();
        assert_eq!(tally.success_rate(), None);
        assert_eq!(tally.error_rate(), 0.0);
        assert_eq!(tally.tps(Duration::ZERO), 0.0);
    }

    #[test]
    fn test_summary_formulas() {
        let tally = Tally {
            succeeded: 3,
            failed: 1,
            bad_trunk: 2,
            bad_branch: 5,
            ..Default::default()
        };

        let summary = tally.summary(Duration::from_secs(2));
        assert_eq!(summary.txs_succeeded, 3);
        assert!((summary.tps - 1.5).abs() < f64::EPSILON);
        assert!((summary.error_rate - 25.0).abs() < 1e-9);
        assert_eq!(summary.bad_trunk, 2);
        assert_eq!(summary.bad_branch, 5);
    }

    #[test]
    fn test_summary_json_field_names() {
        let json = serde_json::to_string(&Summary::default()).unwrap();
        assert!(json.contains("\"txs_succeeded\""));
        assert!(json.contains("\"bad_trunk_and_branch\""));
        assert!(json.contains("\"new_tx\""));
        assert!(json.contains("\"confirmation_rate\""));
    }
}
