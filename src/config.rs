//! Suite files.
//!
//! A suite is the declarative description of one assignment's grading: which
//! image to boot, how to boot it, when to stop, and the weighted expectations
//! to check. It is read from TOML; relative paths are resolved against the
//! directory containing the suite file.
//!
//! Environment overrides:
//! - `GRADE_QEMU` replaces `emulator.binary`
//! - `GRADE_TIMEOUT` replaces the default run timeout (seconds)

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::breakpoint::BreakpointSpec;
use crate::matcher::Expectation;
use crate::registry::Registry;

const ENV_QEMU: &str = "GRADE_QEMU";
const ENV_TIMEOUT: &str = "GRADE_TIMEOUT";
/// Longest run a suite may ask for: one day.
const MAX_TIMEOUT_SECS: u64 = 24 * 60 * 60;

fn default_binary() -> String {
    "qemu-system-aarch64".to_string()
}

fn default_timeout() -> u64 {
    30
}

/// How to launch the emulator.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EmulatorConfig {
    #[serde(default = "default_binary")]
    pub binary: String,
    pub machine: Option<String>,
    pub cpu: Option<String>,
    pub memory: Option<String>,
    pub append: Option<String>,
    /// Extra arguments passed through verbatim.
    #[serde(default)]
    pub args: Vec<String>,
}

impl Default for EmulatorConfig {
    fn default() -> Self {
        Self {
            binary: default_binary(),
            machine: None,
            cpu: None,
            memory: None,
            append: None,
            args: Vec::new(),
        }
    }
}

/// One `[[test]]` entry.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TestSpec {
    /// Defaults to a slug of the description.
    pub name: Option<String>,
    pub weight: u32,
    pub description: String,
    /// Boot the emulator in this test, with this timeout in seconds.
    /// `true` uses the suite's default timeout.
    pub run_qemu: Option<RunQemu>,
    /// Patterns that must appear in the output.
    #[serde(default)]
    pub patterns: Vec<String>,
    /// Patterns that must not appear.
    #[serde(default)]
    pub forbidden: Vec<String>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(untagged)]
pub enum RunQemu {
    Enabled(bool),
    Seconds(u64),
}

/// A whole suite file.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SuiteConfig {
    pub artifact: PathBuf,
    /// Where to save the captured output.
    pub save: Option<PathBuf>,
    pub breakpoint: Option<BreakpointSpec>,
    #[serde(default)]
    pub emulator: EmulatorConfig,
    /// Default run timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    #[serde(default, rename = "test")]
    pub tests: Vec<TestSpec>,
}

impl SuiteConfig {
    /// Load a suite file and apply environment overrides.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Reading suite {}", path.display()))?;
        let mut suite = Self::parse(&text)
            .with_context(|| format!("Parsing suite {}", path.display()))?;
        if let Some(base) = path.parent() {
            suite.resolve_paths(base);
        }
        suite.apply_env()?;
        Ok(suite)
    }

    pub fn parse(text: &str) -> Result<Self> {
        let suite: Self = toml::from_str(text)?;
        suite.validate()?;
        Ok(suite)
    }

    fn validate(&self) -> Result<()> {
        if self.tests.is_empty() {
            bail!("suite declares no [[test]] entries");
        }
        let boots = self.tests.iter().filter(|t| t.boots()).count();
        if boots > 1 {
            bail!("only one test may set run_qemu, found {}", boots);
        }
        check_timeout(self.timeout, "timeout")?;
        for test in &self.tests {
            if let Some(RunQemu::Seconds(secs)) = test.run_qemu {
                check_timeout(secs, &format!("run_qemu of '{}'", test.description))?;
            }
        }
        Ok(())
    }

    fn resolve_paths(&mut self, base: &Path) {
        if self.artifact.is_relative() {
            self.artifact = base.join(&self.artifact);
        }
        if let Some(save) = &self.save {
            if save.is_relative() {
                self.save = Some(base.join(save));
            }
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(binary) = std::env::var(ENV_QEMU) {
            if !binary.trim().is_empty() {
                self.emulator.binary = binary;
            }
        }
        if let Ok(raw) = std::env::var(ENV_TIMEOUT) {
            self.timeout = raw
                .trim()
                .parse()
                .with_context(|| format!("{} must be a number of seconds, got '{}'", ENV_TIMEOUT, raw))?;
            check_timeout(self.timeout, ENV_TIMEOUT)?;
        }
        Ok(())
    }

    /// Build the registry declared by the `[[test]]` entries.
    ///
    /// Patterns are compiled when the case runs, so a malformed pattern
    /// errors that case alone.
    pub fn registry(&self) -> Registry {
        let mut reg = Registry::new();
        for spec in &self.tests {
            let timeout = spec.timeout(self.timeout);
            let patterns = spec.patterns.clone();
            let forbidden = spec.forbidden.clone();
            let procedure = move |r: &mut crate::Runner| -> Result<()> {
                if let Some(t) = timeout {
                    r.run_qemu(t)?;
                }
                let expectation = Expectation::from_patterns(&patterns, &forbidden)?;
                if !expectation.is_empty() {
                    r.expect(&expectation)?;
                }
                Ok(())
            };
            match &spec.name {
                Some(name) => reg.register_named(name, spec.weight, &spec.description, procedure),
                None => reg.register(spec.weight, &spec.description, procedure),
            };
        }
        reg
    }
}

fn check_timeout(secs: u64, what: &str) -> Result<()> {
    if secs == 0 || secs > MAX_TIMEOUT_SECS {
        bail!(
            "{} must be between 1 and {} seconds, got {}",
            what,
            MAX_TIMEOUT_SECS,
            secs
        );
    }
    Ok(())
}

impl TestSpec {
    fn boots(&self) -> bool {
        !matches!(self.run_qemu, None | Some(RunQemu::Enabled(false)))
    }

    fn timeout(&self, default_secs: u64) -> Option<Duration> {
        match self.run_qemu? {
            RunQemu::Enabled(false) => None,
            RunQemu::Enabled(true) => Some(Duration::from_secs(default_secs)),
            RunQemu::Seconds(s) => Some(Duration::from_secs(s)),
        }
    }
}
