//! Error taxonomy for a grading session.
//!
//! `HarnessError` covers everything the harness itself can get wrong.
//! Configuration and environment errors are fatal for the whole session;
//! the rest are scoped to the test case that triggered them.
//! `AssertionFailure` is the only error that marks a case as *failed*
//! rather than *errored*.

use std::path::PathBuf;
use thiserror::Error;

use crate::matcher::Mismatch;

#[derive(Debug, Error)]
pub enum HarnessError {
    /// Bad artifact path or malformed breakpoint. Raised before any process starts.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The emulator binary could not be launched.
    #[error("environment error: cannot launch emulator `{binary}`: {source}")]
    Environment {
        binary: String,
        #[source]
        source: std::io::Error,
    },

    #[error("emulator output was already captured for this session")]
    AlreadyCaptured,

    #[error("emulator has not been run yet, there is no output to match against")]
    NotCaptured,

    #[error("invalid pattern `{pattern}`: {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl HarnessError {
    pub fn config(msg: impl Into<String>) -> Self {
        HarnessError::Configuration(msg.into())
    }

    /// Fatal errors abort the session: there is nothing left to grade.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            HarnessError::Configuration(_) | HarnessError::Environment { .. }
        )
    }
}

/// An expected pattern did not match (or a forbidden one did).
#[derive(Debug, Error)]
#[error("{}", describe(.mismatches))]
pub struct AssertionFailure {
    pub mismatches: Vec<Mismatch>,
}

impl AssertionFailure {
    /// The first mismatch, which is what the report shows.
    pub fn first(&self) -> Option<&Mismatch> {
        self.mismatches.first()
    }
}

fn describe(mismatches: &[Mismatch]) -> String {
    match mismatches {
        [] => "assertion failed".to_string(),
        [only] => only.to_string(),
        [first, rest @ ..] => format!("{} (and {} more)", first, rest.len()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_classification() {
        assert!(HarnessError::config("missing image").is_fatal());
        let env = HarnessError::Environment {
            binary: "qemu-system-aarch64".into(),
            source: std::io::Error::from(std::io::ErrorKind::NotFound),
        };
        assert!(env.is_fatal());
        assert!(!HarnessError::NotCaptured.is_fatal());
        assert!(!HarnessError::AlreadyCaptured.is_fatal());
    }

    #[test]
    fn assertion_message_names_first_pattern() {
        let failure = AssertionFailure {
            mismatches: vec![
                Mismatch::Missing("a".into()),
                Mismatch::Missing("b".into()),
            ],
        };
        assert_eq!(failure.to_string(), "missing 'a' (and 1 more)");
    }
}
