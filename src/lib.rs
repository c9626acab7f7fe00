//! Grading harness for kernel coursework.
//!
//! Boots a student kernel under QEMU, captures its console output, and scores
//! it against weighted regex expectations:
//! - `qemu` - emulator command line, output capture, gdbstub client
//! - `breakpoint` - early-stop markers (console token or kernel symbol)
//! - `matcher` - regex expectations over the captured log
//! - `registry` / `report` - ordered, weighted test cases and their results
//! - `runner` - one grading session: artifact + breakpoint + emulator
//! - `config` - TOML suite files for the `grade` binary
//!
//! A test file registers cases and hands them a runner:
//!
//! ```no_run
//! use kernel_grader::{BreakpointSpec, QemuEmulator, Registry, Runner};
//! use kernel_grader::config::EmulatorConfig;
//! use std::time::Duration;
//!
//! # fn main() -> anyhow::Result<()> {
//! let mut runner = Runner::new("build/kernel.img", Box::new(QemuEmulator::new(EmulatorConfig::default())))?
//!     .with_breakpoint(&BreakpointSpec::symbol("break_point"))?
//!     .save_to("chcore.out");
//!
//! let mut tests = Registry::new();
//! tests
//!     .register(0, "running ChCore", |r| {
//!         r.run_qemu(Duration::from_secs(30))?;
//!         Ok(())
//!     })
//!     .register(10, "print hex", |r| r.matches(r"\[INFO\] 23333 dec -> 0x5b25 hex"));
//!
//! let report = tests.run_all(&mut runner);
//! println!("Score: {}/{}", report.score(), report.max_score());
//! # Ok(())
//! # }
//! ```

pub mod breakpoint;
pub mod config;
pub mod error;
pub mod log;
pub mod matcher;
pub mod qemu;
pub mod registry;
pub mod report;
pub mod runner;

// Re-export commonly used items
pub use breakpoint::BreakpointSpec;
pub use config::SuiteConfig;
pub use error::{AssertionFailure, HarnessError};
pub use log::CapturedLog;
pub use matcher::{Expectation, Mismatch};
pub use qemu::{CaptureOutcome, Emulator, QemuEmulator, StopReason};
pub use registry::{Registry, TestCase};
pub use report::{Outcome, Report, TestResult};
pub use runner::Runner;
