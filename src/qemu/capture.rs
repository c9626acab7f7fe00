//! Output capture for a single emulator run.
//!
//! Spawns the emulator, streams its stdout and stderr into one channel and
//! waits on that channel against a hard deadline. Every way a run can end
//! feeds the same loop:
//!
//! - the emulator exits and both pipes close,
//! - a token breakpoint shows up in console output, even before the line ends,
//! - the gdbstub reports the guest stopped at a symbol breakpoint,
//! - the deadline passes.
//!
//! Whatever ends the run, the emulator's process group is terminated and
//! reaped before `run` returns.

use std::fmt;
use std::io::{ErrorKind, Read};
use std::process::{Child, Command, ExitStatus};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info, warn};

use super::ansi::clean_console_line;
use super::gdb::{GdbClient, StopReply};
use crate::breakpoint::{ArmedBreakpoint, Monitor};
use crate::error::HarnessError;
use crate::log::{CapturedLog, LogBuffer};

/// Grace period between SIGTERM and SIGKILL.
const TERM_GRACE: Duration = Duration::from_millis(500);
/// Upper bound on collecting output that was in flight when the run stopped.
const DRAIN_LIMIT: Duration = Duration::from_secs(1);
const POLL: Duration = Duration::from_millis(100);
const READ_CHUNK: usize = 4096;

/// Why a run ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "code", rename_all = "snake_case")]
pub enum StopReason {
    /// The emulator exited on its own.
    Exited(Option<i32>),
    /// The emulator closed both output streams but kept running, so the
    /// harness terminated it.
    OutputClosed,
    /// The breakpoint was observed and the emulator was stopped early.
    Breakpoint,
    /// The deadline passed; the log holds partial output.
    TimedOut,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::Exited(Some(code)) => write!(f, "exited with status {}", code),
            StopReason::Exited(None) => write!(f, "exited on a signal"),
            StopReason::OutputClosed => write!(f, "closed its output, stopped by the harness"),
            StopReason::Breakpoint => write!(f, "stopped at breakpoint"),
            StopReason::TimedOut => write!(f, "timed out"),
        }
    }
}

/// Result of a capture. Never an error: a timeout still carries its log.
#[derive(Debug, Clone)]
pub struct CaptureOutcome {
    pub log: CapturedLog,
    pub stop: StopReason,
    pub elapsed: Duration,
}

impl CaptureOutcome {
    pub fn timed_out(&self) -> bool {
        self.stop == StopReason::TimedOut
    }
}

enum Event {
    Line(String),
    /// Unterminated tail of a stream, resent whole each time it grows.
    Partial(String),
    Closed,
    DebuggerStop(StopReply),
    DebuggerLost(String),
}

/// Kills the process group if dropped before an orderly stop.
struct ChildGuard {
    child: Option<Child>,
}

impl ChildGuard {
    fn try_wait(&mut self) -> Option<ExitStatus> {
        self.child.as_mut().and_then(|c| c.try_wait().ok().flatten())
    }

    /// Terminate (if still running) and reap.
    fn stop(&mut self) -> Option<ExitStatus> {
        let mut child = self.child.take()?;
        if let Ok(Some(status)) = child.try_wait() {
            // Leader is gone; anything it left in the group goes too.
            signal_group(&child, libc::SIGKILL);
            return Some(status);
        }

        signal_group(&child, libc::SIGTERM);
        let grace = Instant::now() + TERM_GRACE;
        while Instant::now() < grace {
            if let Ok(Some(status)) = child.try_wait() {
                return Some(status);
            }
            std::thread::sleep(Duration::from_millis(20));
        }

        signal_group(&child, libc::SIGKILL);
        let _ = child.kill();
        child.wait().ok()
    }
}

impl Drop for ChildGuard {
    fn drop(&mut self) {
        if self.child.is_some() {
            self.stop();
        }
    }
}

fn signal_group(child: &Child, sig: libc::c_int) {
    // The child leads its own process group (see QemuBuilder::build_captured).
    let pgid = child.id() as libc::pid_t;
    // SAFETY: kill(2) with a negative pid only sends a signal; no memory is touched.
    unsafe {
        libc::kill(-pgid, sig);
    }
}

/// Runs one emulator process and collects its console output.
pub struct OutputCapture {
    breakpoint: Option<ArmedBreakpoint>,
    gdb_port: Option<u16>,
}

impl OutputCapture {
    pub fn new(breakpoint: Option<ArmedBreakpoint>, gdb_port: Option<u16>) -> Self {
        Self {
            breakpoint,
            gdb_port,
        }
    }

    /// Spawn `cmd` and capture its output until it stops or `timeout` passes.
    ///
    /// `binary` names the emulator in environment errors.
    pub fn run(
        &self,
        mut cmd: Command,
        binary: &str,
        timeout: Duration,
    ) -> Result<CaptureOutcome, HarnessError> {
        let start = Instant::now();
        let deadline = start.checked_add(timeout).ok_or_else(|| {
            HarnessError::config(format!("timeout of {}s is out of range", timeout.as_secs()))
        })?;

        let mut child = cmd.spawn().map_err(|source| HarnessError::Environment {
            binary: binary.to_string(),
            source,
        })?;
        info!(pid = child.id(), binary, timeout_secs = timeout.as_secs_f64(), "emulator started");

        let (tx, rx) = mpsc::channel();
        let mut open_streams = 0;
        if let Some(stdout) = child.stdout.take() {
            spawn_reader(stdout, tx.clone());
            open_streams += 1;
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_reader(stderr, tx.clone());
            open_streams += 1;
        }
        let mut guard = ChildGuard { child: Some(child) };

        if let (Some(ArmedBreakpoint::Address { symbol, addr }), Some(port)) =
            (&self.breakpoint, self.gdb_port)
        {
            spawn_debugger(port, *addr, symbol.clone(), deadline, tx.clone());
        }
        drop(tx);

        let mut monitor = Monitor::new(self.breakpoint.as_ref());
        let mut buf = LogBuffer::new();

        let stop = loop {
            let now = Instant::now();
            if now >= deadline {
                warn!(lines = buf.len(), "emulator timed out, keeping partial output");
                break StopReason::TimedOut;
            }

            match rx.recv_timeout((deadline - now).min(POLL)) {
                Ok(Event::Line(line)) => {
                    let hit = monitor.observe(&line);
                    buf.push(line);
                    if hit {
                        info!("breakpoint token observed");
                        break StopReason::Breakpoint;
                    }
                }
                Ok(Event::Partial(tail)) => {
                    // A marker printed without a newline still stops the run.
                    if monitor.observe(&tail) {
                        buf.push(tail);
                        info!("breakpoint token observed");
                        break StopReason::Breakpoint;
                    }
                }
                Ok(Event::Closed) => {
                    open_streams -= 1;
                    if open_streams == 0 {
                        break settle(&mut guard);
                    }
                }
                Ok(Event::DebuggerStop(StopReply::Signal(sig))) => {
                    info!(signal = sig, "guest stopped at breakpoint");
                    break StopReason::Breakpoint;
                }
                Ok(Event::DebuggerStop(StopReply::Exited)) => {
                    debug!("gdbstub reported target exit");
                }
                Ok(Event::DebuggerLost(reason)) => {
                    // Without the stub the run can still end by exit or timeout.
                    warn!(%reason, "lost gdbstub connection");
                }
                Err(RecvTimeoutError::Timeout) => {
                    if let Some(status) = guard.try_wait() {
                        // Exited but something else still holds the pipes.
                        guard.stop();
                        break StopReason::Exited(status.code());
                    }
                }
                Err(RecvTimeoutError::Disconnected) => break settle(&mut guard),
            }
        };

        guard.stop();
        // A token stop ends the log at the marker line. Every other stop
        // collects what the guest printed before it halted or exited.
        if !monitor.hit() {
            drain(&rx, &mut buf, open_streams);
        }

        let elapsed = start.elapsed();
        info!(?stop, lines = buf.len(), elapsed_ms = elapsed.as_millis() as u64, "capture finished");
        Ok(CaptureOutcome {
            log: buf.freeze(),
            stop,
            elapsed,
        })
    }
}

/// Both streams closed: give the emulator a moment to exit on its own,
/// otherwise it is the harness that ends it.
fn settle(guard: &mut ChildGuard) -> StopReason {
    let until = Instant::now() + POLL;
    loop {
        if let Some(status) = guard.try_wait() {
            guard.stop();
            debug!(?status, "emulator exited");
            return StopReason::Exited(status.code());
        }
        if Instant::now() >= until {
            break;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    let status = guard.stop();
    warn!(?status, "emulator closed its output but kept running, stopped it");
    StopReason::OutputClosed
}

fn decode(bytes: &[u8]) -> String {
    clean_console_line(&String::from_utf8_lossy(bytes))
}

/// Stream raw chunks so an unterminated tail is visible as soon as it
/// arrives. Complete lines go out as `Line`, the pending tail as `Partial`.
fn spawn_reader<R: Read + Send + 'static>(mut stream: R, tx: Sender<Event>) {
    std::thread::spawn(move || {
        let mut chunk = [0u8; READ_CHUNK];
        let mut pending: Vec<u8> = Vec::new();
        loop {
            let n = match stream.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(_) => break,
            };
            pending.extend_from_slice(&chunk[..n]);
            while let Some(pos) = pending.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = pending.drain(..=pos).collect();
                if tx.send(Event::Line(decode(&line[..pos]))).is_err() {
                    return;
                }
            }
            if !pending.is_empty() && tx.send(Event::Partial(decode(&pending))).is_err() {
                return;
            }
        }
        if !pending.is_empty() {
            let _ = tx.send(Event::Line(decode(&pending)));
        }
        let _ = tx.send(Event::Closed);
    });
}

fn spawn_debugger(port: u16, addr: u64, symbol: String, deadline: Instant, tx: Sender<Event>) {
    std::thread::spawn(move || {
        let result = (|| -> std::io::Result<StopReply> {
            let mut gdb = GdbClient::connect(port, deadline)?;
            gdb.set_read_timeout(Some(Duration::from_secs(5)))?;
            gdb.insert_breakpoint(addr, 4)?;
            debug!(%symbol, addr = %format!("{:#x}", addr), "breakpoint armed");
            gdb.resume()?;
            gdb.set_read_timeout(None)?;
            gdb.wait_stop()
        })();

        let event = match result {
            Ok(stop) => Event::DebuggerStop(stop),
            Err(e) => Event::DebuggerLost(e.to_string()),
        };
        let _ = tx.send(event);
    });
}

/// Collect lines already in flight, bounded by `DRAIN_LIMIT`.
fn drain(rx: &Receiver<Event>, buf: &mut LogBuffer, mut open_streams: usize) {
    let until = Instant::now() + DRAIN_LIMIT;
    while open_streams > 0 {
        let now = Instant::now();
        if now >= until {
            break;
        }
        match rx.recv_timeout(until - now) {
            Ok(Event::Line(line)) => buf.push(line),
            Ok(Event::Closed) => open_streams -= 1,
            Ok(_) => {}
            Err(_) => break,
        }
    }
}
