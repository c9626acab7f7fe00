//! Pattern matching over captured output.
//!
//! Expected output is a set of stable textual markers, so matching is a plain
//! regex search over the whole log. Nothing is consumed: the same log can be
//! checked against any number of patterns, overlapping or not.

use regex::{Regex, RegexBuilder};
use std::fmt;

use crate::error::HarnessError;
use crate::log::CapturedLog;

/// Compile a pattern the way every expectation is compiled.
///
/// Multi-line mode makes `^` and `$` anchor at line boundaries when a pattern
/// uses them; unanchored patterns match anywhere.
pub fn compile(pattern: &str) -> Result<Regex, HarnessError> {
    RegexBuilder::new(pattern)
        .multi_line(true)
        .build()
        .map_err(|source| HarnessError::InvalidPattern {
            pattern: pattern.to_string(),
            source,
        })
}

/// Whether `pattern` occurs anywhere in the log.
pub fn matches(log: &CapturedLog, pattern: &Regex) -> bool {
    pattern.is_match(log.text())
}

/// One reason an expectation did not hold.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mismatch {
    /// A required pattern never appeared.
    Missing(String),
    /// A forbidden pattern appeared on the given line.
    Unexpected { pattern: String, line: String },
}

impl fmt::Display for Mismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mismatch::Missing(pattern) => write!(f, "missing '{}'", pattern),
            Mismatch::Unexpected { pattern, line } => {
                write!(f, "unexpected '{}' in line: {}", pattern, line)
            }
        }
    }
}

/// Required and forbidden patterns checked together against one log.
#[derive(Debug, Clone, Default)]
pub struct Expectation {
    required: Vec<Regex>,
    forbidden: Vec<Regex>,
}

impl Expectation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from pattern strings, failing on the first malformed one.
    pub fn from_patterns<S: AsRef<str>>(required: &[S], forbidden: &[S]) -> Result<Self, HarnessError> {
        let mut exp = Self::new();
        for p in required {
            exp = exp.require(p.as_ref())?;
        }
        for p in forbidden {
            exp = exp.forbid(p.as_ref())?;
        }
        Ok(exp)
    }

    pub fn require(mut self, pattern: &str) -> Result<Self, HarnessError> {
        self.required.push(compile(pattern)?);
        Ok(self)
    }

    pub fn forbid(mut self, pattern: &str) -> Result<Self, HarnessError> {
        self.forbidden.push(compile(pattern)?);
        Ok(self)
    }

    pub fn is_empty(&self) -> bool {
        self.required.is_empty() && self.forbidden.is_empty()
    }

    /// All mismatches, required patterns first, in declaration order.
    pub fn evaluate(&self, log: &CapturedLog) -> Vec<Mismatch> {
        let mut out: Vec<Mismatch> = self
            .required
            .iter()
            .filter(|re| !matches(log, re))
            .map(|re| Mismatch::Missing(re.as_str().to_string()))
            .collect();

        for re in &self.forbidden {
            if let Some(line) = log.lines().iter().find(|l| re.is_match(l)) {
                out.push(Mismatch::Unexpected {
                    pattern: re.as_str().to_string(),
                    line: line.clone(),
                });
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn log(lines: &[&str]) -> CapturedLog {
        lines.iter().map(|l| l.to_string()).collect()
    }

    #[test]
    fn finds_marker_anywhere() {
        let log = log(&["boot ok", "[INFO] 23333 dec -> 0x5b25 hex", "done"]);
        let re = compile(r"\[INFO\] 23333 dec -> 0x5b25 hex").unwrap();
        assert!(matches(&log, &re));
        // Matching twice gives the same answer.
        assert!(matches(&log, &re));
    }

    #[test]
    fn case_sensitive() {
        let log = log(&["[INFO] char: x"]);
        assert!(!matches(&log, &compile(r"\[info\] char: x").unwrap()));
    }

    #[test]
    fn dollar_anchors_at_line_end() {
        let log = log(&["[INFO] padding right: 1  $", "[INFO] padding right: 1  #"]);
        assert!(matches(&log, &compile(r"\[INFO\] padding right: 1  \$").unwrap()));
        assert!(matches(&log, &compile(r"right: 1  #$").unwrap()));
        assert!(!matches(&log, &compile(r"right: 1  \$$\n\[INFO\] nothing").unwrap()));
    }

    #[test]
    fn overlapping_patterns_both_match() {
        let log = log(&["[INFO] neg INT_MIN: -2147483648"]);
        assert!(matches(&log, &compile("INT_MIN: -2147").unwrap()));
        assert!(matches(&log, &compile("-2147483648").unwrap()));
    }

    #[test]
    fn malformed_pattern_is_reported() {
        let err = compile(r"\[INFO").unwrap_err();
        assert!(matches!(err, HarnessError::InvalidPattern { .. }));
    }

    #[test]
    fn expectation_reports_missing_and_forbidden() {
        let log = log(&["[INFO] long: -1", "panic: oops"]);
        let exp = Expectation::from_patterns(
            &[r"\[INFO\] long: -1", r"\[INFO\] pointer: 0xdeadbeef"],
            &["panic"],
        )
        .unwrap();
        let mismatches = exp.evaluate(&log);
        assert_eq!(
            mismatches,
            vec![
                Mismatch::Missing(r"\[INFO\] pointer: 0xdeadbeef".into()),
                Mismatch::Unexpected {
                    pattern: "panic".into(),
                    line: "panic: oops".into()
                },
            ]
        );
    }

    #[test]
    fn empty_log_matches_nothing() {
        let log = log(&[]);
        assert!(Expectation::new().require("x").unwrap().evaluate(&log).len() == 1);
    }
}
