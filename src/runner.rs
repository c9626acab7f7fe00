//! Runner: the composition root for one grading session.
//!
//! Owns the artifact, the armed breakpoint and the emulator, runs the
//! emulator at most once, and hands the frozen log to every test case.

use anyhow::Result;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

use crate::breakpoint::{ArmedBreakpoint, BreakpointSpec};
use crate::error::{AssertionFailure, HarnessError};
use crate::log::CapturedLog;
use crate::matcher::{compile, matches, Expectation, Mismatch};
use crate::qemu::{allocate_local_port, CaptureOutcome, Emulator, OutputCapture};

/// One grading session against one artifact.
pub struct Runner {
    artifact: PathBuf,
    breakpoint: Option<ArmedBreakpoint>,
    save: Option<PathBuf>,
    emulator: Box<dyn Emulator>,
    outcome: Option<CaptureOutcome>,
}

impl std::fmt::Debug for Runner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runner")
            .field("artifact", &self.artifact)
            .field("breakpoint", &self.breakpoint)
            .field("save", &self.save)
            .field("emulator", &self.emulator.binary())
            .field("captured", &self.outcome.is_some())
            .finish()
    }
}

impl Runner {
    /// Create a runner for `artifact`.
    ///
    /// Fails with a configuration error if the image is missing or unreadable;
    /// nothing is launched in that case.
    pub fn new(artifact: impl Into<PathBuf>, emulator: Box<dyn Emulator>) -> Result<Self, HarnessError> {
        let artifact = artifact.into();
        check_artifact(&artifact)?;
        Ok(Self {
            artifact,
            breakpoint: None,
            save: None,
            emulator,
            outcome: None,
        })
    }

    /// Stop the emulator as soon as `spec` is observed.
    pub fn with_breakpoint(mut self, spec: &BreakpointSpec) -> Result<Self, HarnessError> {
        self.breakpoint = Some(spec.arm(&self.artifact)?);
        Ok(self)
    }

    /// Write the captured output to `path` once the run finishes.
    pub fn save_to(mut self, path: impl Into<PathBuf>) -> Self {
        self.save = Some(path.into());
        self
    }

    pub fn saved_to(&self) -> Option<&Path> {
        self.save.as_deref()
    }

    /// Boot the artifact and capture its output, at most once per session.
    ///
    /// A timeout is not an error: the outcome is marked timed out and carries
    /// whatever output was produced.
    pub fn run_qemu(&mut self, timeout: Duration) -> Result<&CaptureOutcome, HarnessError> {
        if self.outcome.is_some() {
            return Err(HarnessError::AlreadyCaptured);
        }
        // The artifact may have vanished since the runner was built.
        check_artifact(&self.artifact)?;

        let gdb_port = match self.breakpoint {
            Some(ArmedBreakpoint::Address { .. }) => Some(allocate_local_port().map_err(|source| {
                HarnessError::Environment {
                    binary: self.emulator.binary().to_string(),
                    source,
                }
            })?),
            _ => None,
        };

        let cmd = self.emulator.command(&self.artifact, gdb_port);
        let capture = OutputCapture::new(self.breakpoint.clone(), gdb_port);
        let outcome = capture.run(cmd, self.emulator.binary(), timeout)?;
        if outcome.log.is_empty() {
            warn!(stop = %outcome.stop, "emulator produced no output");
        }
        if outcome.timed_out() {
            warn!(timeout_secs = timeout.as_secs(), "emulator did not stop before the timeout");
        }
        let outcome = self.outcome.insert(outcome);

        if let Some(path) = &self.save {
            let mut text = outcome.log.text().to_string();
            text.push('\n');
            std::fs::write(path, text).map_err(|source| HarnessError::Io {
                path: path.clone(),
                source,
            })?;
            info!(path = %path.display(), "emulator output saved");
        }
        Ok(outcome)
    }

    /// Outcome of the run, if it happened.
    pub fn outcome(&self) -> Option<&CaptureOutcome> {
        self.outcome.as_ref()
    }

    /// The frozen captured log.
    pub fn log(&self) -> Result<&CapturedLog, HarnessError> {
        self.outcome
            .as_ref()
            .map(|o| &o.log)
            .ok_or(HarnessError::NotCaptured)
    }

    /// Assert that `pattern` occurs in the captured output.
    pub fn matches(&self, pattern: &str) -> Result<()> {
        let log = self.log()?;
        let re = compile(pattern)?;
        if !matches(log, &re) {
            return Err(AssertionFailure {
                mismatches: vec![Mismatch::Missing(pattern.to_string())],
            }
            .into());
        }
        Ok(())
    }

    /// Assert a whole expectation: every required pattern present, no
    /// forbidden pattern present.
    pub fn expect(&self, expectation: &Expectation) -> Result<()> {
        let mismatches = expectation.evaluate(self.log()?);
        if mismatches.is_empty() {
            Ok(())
        } else {
            Err(AssertionFailure { mismatches }.into())
        }
    }
}

fn check_artifact(path: &Path) -> Result<(), HarnessError> {
    let meta = std::fs::metadata(path).map_err(|e| {
        HarnessError::config(format!("artifact {} is not accessible: {}", path.display(), e))
    })?;
    if !meta.is_file() {
        return Err(HarnessError::config(format!(
            "artifact {} is not a regular file",
            path.display()
        )));
    }
    std::fs::File::open(path).map_err(|e| {
        HarnessError::config(format!("artifact {} is not readable: {}", path.display(), e))
    })?;
    Ok(())
}
