//! Breakpoint monitor.
//!
//! A breakpoint marks "everything of interest has happened". Once it is
//! observed the capture stops the emulator instead of waiting out the timeout.
//! Two kinds are supported:
//!
//! - `Token`: a literal string in the console output.
//! - `Symbol`: a kernel symbol, resolved from the ELF artifact and armed
//!   through QEMU's gdbstub.

use goblin::elf::Elf;
use serde::Deserialize;
use std::path::Path;

use crate::error::HarnessError;

/// Marker the harness watches for.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BreakpointSpec {
    Token(String),
    Symbol(String),
}

impl BreakpointSpec {
    pub fn token(text: &str) -> Self {
        BreakpointSpec::Token(text.to_string())
    }

    pub fn symbol(name: &str) -> Self {
        BreakpointSpec::Symbol(name.to_string())
    }

    pub fn validate(&self) -> Result<(), HarnessError> {
        let (kind, value) = match self {
            BreakpointSpec::Token(t) => ("token", t),
            BreakpointSpec::Symbol(s) => ("symbol", s),
        };
        if value.trim().is_empty() {
            return Err(HarnessError::config(format!("empty breakpoint {}", kind)));
        }
        Ok(())
    }

    /// Resolve into something the capture can act on.
    ///
    /// Symbols are looked up in the artifact now, so a missing symbol fails
    /// the session before the emulator is launched.
    pub fn arm(&self, artifact: &Path) -> Result<ArmedBreakpoint, HarnessError> {
        self.validate()?;
        match self {
            BreakpointSpec::Token(t) => Ok(ArmedBreakpoint::Token(t.clone())),
            BreakpointSpec::Symbol(name) => {
                let bytes = std::fs::read(artifact).map_err(|e| {
                    HarnessError::config(format!("cannot read {}: {}", artifact.display(), e))
                })?;
                let addr = resolve_symbol(&bytes, name)?.ok_or_else(|| {
                    HarnessError::config(format!(
                        "symbol `{}` not found in {}",
                        name,
                        artifact.display()
                    ))
                })?;
                Ok(ArmedBreakpoint::Address {
                    symbol: name.clone(),
                    addr,
                })
            }
        }
    }
}

impl std::fmt::Display for BreakpointSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BreakpointSpec::Token(t) => write!(f, "token {:?}", t),
            BreakpointSpec::Symbol(s) => write!(f, "symbol {}", s),
        }
    }
}

/// A breakpoint ready to be watched during a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArmedBreakpoint {
    Token(String),
    Address { symbol: String, addr: u64 },
}

/// Look up a symbol's value in an ELF image.
///
/// Returns `Ok(None)` when the image parses but has no such symbol.
pub fn resolve_symbol(image: &[u8], name: &str) -> Result<Option<u64>, HarnessError> {
    let elf = Elf::parse(image)
        .map_err(|e| HarnessError::config(format!("artifact is not an ELF image: {}", e)))?;

    let from_table = |syms: &goblin::elf::sym::Symtab, strtab: &goblin::strtab::Strtab| {
        syms.iter()
            .find(|sym| sym.st_value != 0 && strtab.get_at(sym.st_name) == Some(name))
            .map(|sym| sym.st_value)
    };

    Ok(from_table(&elf.syms, &elf.strtab).or_else(|| from_table(&elf.dynsyms, &elf.dynstrtab)))
}

/// Watches console lines for a token breakpoint.
#[derive(Debug, Default)]
pub struct Monitor {
    token: Option<String>,
    hit: bool,
}

impl Monitor {
    pub fn new(armed: Option<&ArmedBreakpoint>) -> Self {
        let token = match armed {
            Some(ArmedBreakpoint::Token(t)) => Some(t.clone()),
            _ => None,
        };
        Self { token, hit: false }
    }

    /// Feed one line, or the unterminated tail of one. Returns true exactly once,
    /// on the first text carrying the token.
    pub fn observe(&mut self, line: &str) -> bool {
        if self.hit {
            return false;
        }
        match &self.token {
            Some(t) if line.contains(t.as_str()) => {
                self.hit = true;
                true
            }
            _ => false,
        }
    }

    pub fn hit(&self) -> bool {
        self.hit
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_specs_are_rejected() {
        assert!(BreakpointSpec::token("").validate().unwrap_err().is_fatal());
        assert!(BreakpointSpec::symbol("  ").validate().is_err());
        assert!(BreakpointSpec::symbol("break_point").validate().is_ok());
    }

    #[test]
    fn monitor_fires_once() {
        let armed = BreakpointSpec::token("break_point").arm(Path::new("unused")).unwrap();
        let mut mon = Monitor::new(Some(&armed));
        assert!(!mon.observe("[INFO] booting"));
        assert!(mon.observe("reached break_point"));
        assert!(!mon.observe("break_point again"));
        assert!(mon.hit());
    }

    #[test]
    fn monitor_without_token_never_fires() {
        let armed = ArmedBreakpoint::Address {
            symbol: "break_point".into(),
            addr: 0x1000,
        };
        let mut mon = Monitor::new(Some(&armed));
        assert!(!mon.observe("break_point"));
    }

    #[test]
    fn non_elf_artifact_is_a_configuration_error() {
        let err = resolve_symbol(b"definitely not elf", "main").unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn resolves_symbol_in_running_test_binary() {
        let exe = std::env::current_exe().unwrap();
        let bytes = std::fs::read(exe).unwrap();
        let addr = resolve_symbol(&bytes, "main").unwrap();
        assert!(addr.is_some());
        assert_eq!(resolve_symbol(&bytes, "no_such_symbol_here_42").unwrap(), None);
    }

    #[test]
    fn missing_symbol_fails_arming() {
        let exe = std::env::current_exe().unwrap();
        let err = BreakpointSpec::symbol("no_such_symbol_here_42")
            .arm(&exe)
            .unwrap_err();
        assert!(matches!(err, HarnessError::Configuration(_)));
    }
}
