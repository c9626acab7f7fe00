//! QEMU command builder for kernel grading runs.

use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{Command, Stdio};

/// Builder for QEMU commands - consolidates common configuration patterns.
#[derive(Debug, Clone, Default)]
pub struct QemuBuilder {
    binary: Option<String>,
    machine: Option<String>,
    cpu: Option<String>,
    memory: Option<String>,
    kernel: Option<PathBuf>,
    append: Option<String>,
    gdb_port: Option<u16>,
    halted: bool,
    nographic: bool,
    serial_stdio: bool,
    no_reboot: bool,
    extra: Vec<String>,
}

impl QemuBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Emulator binary (default: qemu-system-aarch64)
    pub fn binary(mut self, binary: &str) -> Self {
        self.binary = Some(binary.to_string());
        self
    }

    /// Machine model (e.g., "raspi3b", "virt")
    pub fn machine(mut self, machine: &str) -> Self {
        self.machine = Some(machine.to_string());
        self
    }

    pub fn cpu(mut self, cpu: &str) -> Self {
        self.cpu = Some(cpu.to_string());
        self
    }

    /// Set memory size (e.g., "512M", "1G")
    pub fn memory(mut self, mem: &str) -> Self {
        self.memory = Some(mem.to_string());
        self
    }

    /// Kernel image loaded with `-kernel`
    pub fn kernel(mut self, path: PathBuf) -> Self {
        self.kernel = Some(path);
        self
    }

    /// Kernel command line arguments
    pub fn append(mut self, args: &str) -> Self {
        self.append = Some(args.to_string());
        self
    }

    /// Expose a GDB stub on localhost:`port` and hold the CPU at reset until
    /// a debugger continues it.
    pub fn gdb_halted(mut self, port: u16) -> Self {
        self.gdb_port = Some(port);
        self.halted = true;
        self
    }

    /// Disable graphics
    pub fn nographic(mut self) -> Self {
        self.nographic = true;
        self
    }

    /// Route the guest serial port to stdio
    pub fn serial_stdio(mut self) -> Self {
        self.serial_stdio = true;
        self
    }

    /// Exit instead of rebooting when the guest resets
    pub fn no_reboot(mut self) -> Self {
        self.no_reboot = true;
        self
    }

    /// Extra arguments appended verbatim
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.extra.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn binary_name(&self) -> &str {
        self.binary.as_deref().unwrap_or("qemu-system-aarch64")
    }

    /// Build the command with output piped for capture.
    ///
    /// The child gets its own process group so the whole tree can be
    /// signalled on stop.
    pub fn build_captured(self) -> Command {
        let mut cmd = self.build_base();
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0);
        cmd
    }

    fn build_base(self) -> Command {
        let mut cmd = Command::new(self.binary_name());

        if let Some(machine) = &self.machine {
            cmd.args(["-machine", machine]);
        }
        if let Some(cpu) = &self.cpu {
            cmd.args(["-cpu", cpu]);
        }
        if let Some(mem) = &self.memory {
            cmd.args(["-m", mem]);
        }

        if let Some(kernel) = &self.kernel {
            cmd.arg("-kernel").arg(kernel);
        }
        if let Some(append) = &self.append {
            cmd.args(["-append", append]);
        }

        if self.nographic {
            cmd.arg("-nographic");
        }
        if self.serial_stdio {
            // With -nographic the serial port is already muxed onto stdio.
            if !self.nographic {
                cmd.args(["-serial", "stdio"]);
            }
            cmd.args(["-monitor", "none"]);
        }
        if self.no_reboot {
            cmd.arg("-no-reboot");
        }

        if let Some(port) = self.gdb_port {
            cmd.args(["-gdb", &format!("tcp:127.0.0.1:{}", port)]);
        }
        if self.halted {
            cmd.arg("-S");
        }

        cmd.args(&self.extra);
        cmd
    }
}
