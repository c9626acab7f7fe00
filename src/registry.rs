//! Test registry and scorer.
//!
//! Test cases are registered in order and run strictly in that order against
//! one `Runner`. Each case earns its whole weight or nothing. A case that
//! breaks is isolated: it is recorded as errored and the next case runs
//! anyway. Only configuration and environment errors end the session, and
//! even then every remaining case is still reported.

use anyhow::Result;
use std::panic::{self, AssertUnwindSafe};
use std::time::{Duration, Instant};
use tracing::{debug, error};

use crate::error::{AssertionFailure, HarnessError};
use crate::report::{Outcome, Report, TestResult};
use crate::runner::Runner;

/// Lines of captured output kept in the report when something did not pass.
const TAIL_LINES: usize = 20;

pub type Procedure = Box<dyn Fn(&mut Runner) -> Result<()>>;

/// A named, weighted unit of grading logic.
pub struct TestCase {
    pub name: String,
    pub weight: u32,
    pub description: String,
    procedure: Procedure,
}

impl std::fmt::Debug for TestCase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestCase")
            .field("name", &self.name)
            .field("weight", &self.weight)
            .field("description", &self.description)
            .finish_non_exhaustive()
    }
}

/// Ordered collection of test cases.
#[derive(Debug, Default)]
pub struct Registry {
    cases: Vec<TestCase>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a case named after its description (`"print hex"` becomes `print_hex`).
    pub fn register<F>(&mut self, weight: u32, description: &str, procedure: F) -> &mut Self
    where
        F: Fn(&mut Runner) -> Result<()> + 'static,
    {
        self.register_named(&slug(description), weight, description, procedure)
    }

    pub fn register_named<F>(
        &mut self,
        name: &str,
        weight: u32,
        description: &str,
        procedure: F,
    ) -> &mut Self
    where
        F: Fn(&mut Runner) -> Result<()> + 'static,
    {
        self.cases.push(TestCase {
            name: name.to_string(),
            weight,
            description: description.to_string(),
            procedure: Box::new(procedure),
        });
        self
    }

    pub fn cases(&self) -> &[TestCase] {
        &self.cases
    }

    pub fn len(&self) -> usize {
        self.cases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cases.is_empty()
    }

    pub fn max_score(&self) -> u32 {
        self.cases.iter().map(|c| c.weight).sum()
    }

    pub fn run_all(&self, runner: &mut Runner) -> Report {
        self.run_all_with(runner, |_| {})
    }

    /// Run every case in order, calling `on_result` as each one finishes.
    pub fn run_all_with<F>(&self, runner: &mut Runner, mut on_result: F) -> Report
    where
        F: FnMut(&TestResult),
    {
        let mut report = Report::default();

        for case in &self.cases {
            let result = match report.aborted.clone() {
                Some(reason) => TestResult {
                    name: case.name.clone(),
                    description: case.description.clone(),
                    weight: case.weight,
                    outcome: Outcome::Errored,
                    detail: Some(format!("not run, session aborted: {}", reason)),
                    duration: Duration::ZERO,
                },
                None => {
                    let (result, fatal) = run_case(case, runner);
                    if let Some(reason) = fatal {
                        error!(case = %case.name, %reason, "aborting grading session");
                        report.aborted = Some(reason);
                    }
                    result
                }
            };
            on_result(&result);
            report.results.push(result);
        }

        if let Some(outcome) = runner.outcome() {
            report.emulator_stop = Some(outcome.stop.clone());
            if !report.all_passed() {
                report.log_tail = outcome.log.tail(TAIL_LINES);
            }
        }
        report.saved_log = runner.saved_to().map(Into::into);
        report
    }
}

/// Run one case in isolation. The second value is the abort reason when the
/// case hit a fatal harness error.
fn run_case(case: &TestCase, runner: &mut Runner) -> (TestResult, Option<String>) {
    debug!(case = %case.name, weight = case.weight, "running test case");
    let start = Instant::now();
    let ran = panic::catch_unwind(AssertUnwindSafe(|| (case.procedure)(runner)));
    let duration = start.elapsed();

    let (outcome, detail, fatal) = match ran {
        Ok(Ok(())) => (Outcome::Passed, None, None),
        Ok(Err(err)) => classify(err),
        Err(payload) => (
            Outcome::Errored,
            Some(format!("panicked: {}", panic_message(payload.as_ref()))),
            None,
        ),
    };

    let result = TestResult {
        name: case.name.clone(),
        description: case.description.clone(),
        weight: case.weight,
        outcome,
        detail,
        duration,
    };
    (result, fatal)
}

fn classify(err: anyhow::Error) -> (Outcome, Option<String>, Option<String>) {
    if let Some(failure) = err.downcast_ref::<AssertionFailure>() {
        let detail = failure
            .first()
            .map(ToString::to_string)
            .unwrap_or_else(|| failure.to_string());
        return (Outcome::Failed, Some(detail), None);
    }

    let detail = format!("{:#}", err);
    let fatal = err
        .downcast_ref::<HarnessError>()
        .filter(|e| e.is_fatal())
        .map(ToString::to_string);
    (Outcome::Errored, Some(detail), fatal)
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Lowercase identifier from a description.
pub fn slug(description: &str) -> String {
    let mut out = String::with_capacity(description.len());
    for c in description.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
        } else if !out.ends_with('_') && !out.is_empty() {
            out.push('_');
        }
    }
    while out.ends_with('_') {
        out.pop();
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::qemu::StopReason;
    use crate::runner::tests::{artifact, ScriptEmulator};
    use std::time::Duration;

    const KERNEL: &str = "echo '[INFO] 23333 dec -> 0x5b25 hex'; \
                          echo '[INFO] 23333 dec -> 23333 dec'; \
                          echo '[INFO] char: x'; \
                          echo break_point; sleep 30";

    fn runner(img: &tempfile::NamedTempFile, script: &'static str) -> Runner {
        Runner::new(img.path(), Box::new(ScriptEmulator(script)))
            .unwrap()
            .with_breakpoint(&crate::BreakpointSpec::token("break_point"))
            .unwrap()
    }

    fn lab_registry() -> Registry {
        let mut reg = Registry::new();
        reg.register(0, "running ChCore", |r| {
            r.run_qemu(Duration::from_secs(20))?;
            Ok(())
        })
        .register(10, "print hex", |r| r.matches(r"\[INFO\] 23333 dec -> 0x5b25 hex"))
        .register(60, "print misc", |r| {
            r.matches(r"\[INFO\] char: x")?;
            r.matches(r"\[INFO\] pointer: 0xdeadbeef")
        })
        .register(10, "print dec", |r| r.matches(r"\[INFO\] 23333 dec -> 23333 dec"));
        reg
    }

    #[test]
    fn slugs_descriptions() {
        assert_eq!(slug("print hex"), "print_hex");
        assert_eq!(slug("running ChCore"), "running_chcore");
        assert_eq!(slug("  neg pad -02 "), "neg_pad_02");
    }

    #[test]
    fn scores_passed_cases_only() {
        let img = artifact();
        let mut r = runner(&img, KERNEL);
        let reg = lab_registry();
        let report = reg.run_all(&mut r);

        assert_eq!(report.results.len(), reg.len());
        let names: Vec<_> = report.results.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, ["running_chcore", "print_hex", "print_misc", "print_dec"]);

        assert_eq!(report.results[1].outcome, Outcome::Passed);
        assert_eq!(report.results[1].points(), 10);

        // One missing marker voids the whole case.
        assert_eq!(report.results[2].outcome, Outcome::Failed);
        assert_eq!(report.results[2].points(), 0);
        assert_eq!(
            report.results[2].detail.as_deref(),
            Some(r"missing '\[INFO\] pointer: 0xdeadbeef'")
        );

        // Later cases still run and score.
        assert_eq!(report.results[3].outcome, Outcome::Passed);
        assert_eq!(report.score(), 20);
        assert_eq!(report.max_score(), reg.max_score());
        assert_eq!(report.max_score(), 80);
        assert_eq!(report.emulator_stop, Some(StopReason::Breakpoint));
        assert!(!report.log_tail.is_empty());
    }

    #[test]
    fn errored_cases_are_isolated() {
        let img = artifact();
        let mut r = runner(&img, KERNEL);
        let mut reg = Registry::new();
        reg.register(5, "boot", |r| {
            r.run_qemu(Duration::from_secs(20))?;
            Ok(())
        })
        .register(10, "explodes", |_| panic!("kernel output parser blew up"))
        .register(10, "bad regex", |r| r.matches(r"\[INFO"))
        .register(10, "custom error", |_| anyhow::bail!("grader bug"))
        .register(20, "still runs", |r| r.matches("break_point"));

        let report = reg.run_all(&mut r);
        let outcomes: Vec<_> = report.results.iter().map(|r| r.outcome).collect();
        assert_eq!(
            outcomes,
            [
                Outcome::Passed,
                Outcome::Errored,
                Outcome::Errored,
                Outcome::Errored,
                Outcome::Passed
            ]
        );
        assert!(report.results[1].detail.as_deref().unwrap().contains("blew up"));
        assert!(report.results[2].detail.as_deref().unwrap().contains("invalid pattern"));
        assert_eq!(report.score(), 25);
        assert!(report.aborted.is_none());
    }

    #[test]
    fn matching_without_a_run_errors() {
        let img = artifact();
        let mut r = runner(&img, KERNEL);
        let mut reg = Registry::new();
        reg.register(10, "print hex", |r| r.matches("0x5b25"));
        let report = reg.run_all(&mut r);
        assert_eq!(report.results[0].outcome, Outcome::Errored);
        assert!(report.emulator_stop.is_none());
    }

    #[test]
    fn environment_error_aborts_but_reports_every_case() {
        struct Missing;
        impl crate::qemu::Emulator for Missing {
            fn binary(&self) -> &str {
                "/nonexistent/qemu"
            }
            fn command(&self, _: &std::path::Path, _: Option<u16>) -> std::process::Command {
                std::process::Command::new("/nonexistent/qemu")
            }
        }

        let img = artifact();
        let mut r = Runner::new(img.path(), Box::new(Missing)).unwrap();
        let mut reg = Registry::new();
        reg.register(0, "boot", |r| {
            r.run_qemu(Duration::from_secs(5))?;
            Ok(())
        })
        .register(10, "print hex", |r| r.matches("0x5b25"))
        .register(10, "print dec", |r| r.matches("23333"));

        let report = reg.run_all(&mut r);
        assert_eq!(report.results.len(), 3);
        assert!(report.aborted.as_deref().unwrap().contains("environment error"));
        assert!(report
            .results
            .iter()
            .all(|r| r.outcome == Outcome::Errored));
        assert!(report.results[2]
            .detail
            .as_deref()
            .unwrap()
            .starts_with("not run, session aborted"));
        assert_eq!(report.exit_code(), 2);
    }

    #[test]
    fn timeout_keeps_grading_partial_output() {
        let img = artifact();
        let mut r = runner(&img, "echo '[INFO] 23333 dec -> 0x5b25 hex'; sleep 30");
        let mut reg = Registry::new();
        reg.register(0, "boot", |r| {
            let outcome = r.run_qemu(Duration::from_secs(1))?;
            anyhow::ensure!(outcome.timed_out(), "expected a timeout");
            Ok(())
        })
        .register(10, "print hex", |r| r.matches(r"0x5b25 hex"))
        .register(10, "print dec", |r| r.matches(r"23333 dec -> 23333 dec"));

        let report = reg.run_all(&mut r);
        assert_eq!(report.emulator_stop, Some(StopReason::TimedOut));
        assert_eq!(report.results[1].outcome, Outcome::Passed);
        assert_eq!(report.results[2].outcome, Outcome::Failed);
        assert_eq!(report.score(), 10);
    }
}
