//! Grading results.
//!
//! A `Report` lists every registered test case exactly once, in registration
//! order. It is plain data: rendering is up to the caller.

use serde::{Serialize, Serializer};
use std::path::PathBuf;
use std::time::Duration;

use crate::qemu::StopReason;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Passed,
    /// An expectation did not hold.
    Failed,
    /// The test itself broke (harness error, panic, malformed pattern).
    Errored,
}

impl Outcome {
    pub fn label(self) -> &'static str {
        match self {
            Outcome::Passed => "OK",
            Outcome::Failed => "FAIL",
            Outcome::Errored => "ERROR",
        }
    }
}

/// Result of running a single test case.
#[derive(Debug, Clone, Serialize)]
pub struct TestResult {
    pub name: String,
    pub description: String,
    pub weight: u32,
    pub outcome: Outcome,
    /// First failing pattern or error message; `None` when passed.
    pub detail: Option<String>,
    #[serde(rename = "duration_ms", serialize_with = "as_millis")]
    pub duration: Duration,
}

impl TestResult {
    /// Points earned: the full weight or nothing.
    pub fn points(&self) -> u32 {
        match self.outcome {
            Outcome::Passed => self.weight,
            _ => 0,
        }
    }

    pub fn passed(&self) -> bool {
        self.outcome == Outcome::Passed
    }
}

fn as_millis<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
}

/// Outcome of a whole grading session.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Report {
    pub results: Vec<TestResult>,
    /// Set when a configuration or environment error ended the session early.
    pub aborted: Option<String>,
    /// How the emulator run ended, if it ran.
    pub emulator_stop: Option<StopReason>,
    pub saved_log: Option<PathBuf>,
    /// Last lines of captured output, kept when something did not pass.
    pub log_tail: Vec<String>,
}

impl Report {
    pub fn score(&self) -> u32 {
        self.results.iter().map(TestResult::points).sum()
    }

    /// Sum of all registered weights.
    pub fn max_score(&self) -> u32 {
        self.results.iter().map(|r| r.weight).sum()
    }

    pub fn all_passed(&self) -> bool {
        self.aborted.is_none() && self.results.iter().all(TestResult::passed)
    }

    pub fn count(&self, outcome: Outcome) -> usize {
        self.results.iter().filter(|r| r.outcome == outcome).count()
    }

    /// Process exit code: 0 all passed, 1 something failed, 2 session aborted.
    pub fn exit_code(&self) -> i32 {
        if self.aborted.is_some() {
            2
        } else if self.all_passed() {
            0
        } else {
            1
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(weight: u32, outcome: Outcome) -> TestResult {
        TestResult {
            name: "t".into(),
            description: "t".into(),
            weight,
            outcome,
            detail: None,
            duration: Duration::from_millis(1500),
        }
    }

    #[test]
    fn weight_is_all_or_nothing() {
        let report = Report {
            results: vec![
                result(10, Outcome::Passed),
                result(30, Outcome::Failed),
                result(60, Outcome::Errored),
            ],
            ..Report::default()
        };
        assert_eq!(report.score(), 10);
        assert_eq!(report.max_score(), 100);
        assert_eq!(report.exit_code(), 1);
        assert_eq!(report.count(Outcome::Failed), 1);
    }

    #[test]
    fn aborted_session_exits_with_two() {
        let report = Report {
            results: vec![result(10, Outcome::Errored)],
            aborted: Some("environment error".into()),
            ..Report::default()
        };
        assert_eq!(report.exit_code(), 2);
    }

    #[test]
    fn serializes_outcome_and_millis() {
        let json = serde_json::to_value(result(10, Outcome::Passed)).unwrap();
        assert_eq!(json["outcome"], "passed");
        assert_eq!(json["duration_ms"], 1500);
    }

    #[test]
    fn serializes_emulator_stop_as_data() {
        let report = Report {
            results: vec![result(10, Outcome::Passed)],
            emulator_stop: Some(StopReason::Exited(Some(0))),
            ..Report::default()
        };
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["emulator_stop"]["kind"], "exited");
        assert_eq!(json["emulator_stop"]["code"], 0);
    }
}
