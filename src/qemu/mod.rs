//! QEMU infrastructure for grading runs.
//!
//! Provides the command builder, the output capture loop and the gdbstub
//! client used for symbol breakpoints.

mod ansi;
mod builder;
pub mod capture;
pub mod gdb;

pub use ansi::clean_console_line;
pub use builder::QemuBuilder;
pub use capture::{CaptureOutcome, OutputCapture, StopReason};

use std::net::TcpListener;
use std::path::Path;
use std::process::Command;

use crate::config::EmulatorConfig;

/// Something that can boot an artifact and print its console to stdout.
///
/// The returned command must pipe stdout and stderr and run in its own
/// process group; `QemuBuilder::build_captured` does both.
pub trait Emulator {
    /// Name used in environment errors.
    fn binary(&self) -> &str;

    /// Command that boots `artifact`. With `gdb_port` set the guest must
    /// start halted behind a gdbstub on that port.
    fn command(&self, artifact: &Path, gdb_port: Option<u16>) -> Command;
}

/// QEMU configured from the suite's `[emulator]` table.
#[derive(Debug, Clone)]
pub struct QemuEmulator {
    config: EmulatorConfig,
}

impl QemuEmulator {
    pub fn new(config: EmulatorConfig) -> Self {
        Self { config }
    }

    fn builder(&self) -> QemuBuilder {
        let c = &self.config;
        let mut b = QemuBuilder::new().binary(&c.binary);
        if let Some(machine) = &c.machine {
            b = b.machine(machine);
        }
        if let Some(cpu) = &c.cpu {
            b = b.cpu(cpu);
        }
        if let Some(memory) = &c.memory {
            b = b.memory(memory);
        }
        if let Some(append) = &c.append {
            b = b.append(append);
        }
        b.nographic().serial_stdio().no_reboot().args(c.args.iter().cloned())
    }
}

impl Emulator for QemuEmulator {
    fn binary(&self) -> &str {
        &self.config.binary
    }

    fn command(&self, artifact: &Path, gdb_port: Option<u16>) -> Command {
        let mut b = self.builder().kernel(artifact.to_path_buf());
        if let Some(port) = gdb_port {
            b = b.gdb_halted(port);
        }
        b.build_captured()
    }
}

/// Pick a free localhost port for the gdbstub.
pub fn allocate_local_port() -> std::io::Result<u16> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    let port = listener.local_addr()?.port();
    drop(listener);
    Ok(port)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qemu_emulator_boots_artifact_with_stub() {
        let config = EmulatorConfig {
            binary: "qemu-system-aarch64".into(),
            machine: Some("raspi3b".into()),
            ..EmulatorConfig::default()
        };
        let cmd = QemuEmulator::new(config).command(Path::new("kernel.img"), Some(1234));
        let args: Vec<String> = cmd
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert!(args.windows(2).any(|w| w == ["-kernel", "kernel.img"]));
        assert!(args.windows(2).any(|w| w == ["-machine", "raspi3b"]));
        assert!(args.contains(&"-S".to_string()));
        assert!(args.contains(&"-no-reboot".to_string()));
    }

    #[test]
    fn allocates_nonzero_port() {
        assert_ne!(allocate_local_port().unwrap(), 0);
    }
}
