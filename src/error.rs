//! The debugger's error taxonomy (spec §7).
//!
//! Trace-line parse errors and per-DIE DWARF resolution failures are
//! recovered locally (logged and skipped) and never surface as
//! [`DebuggerError`] values. Everything else a command can fail with is one
//! of these variants; the REPL boundary catches them, prints a message, and
//! keeps prompting. Only [`DebuggerError::SessionCreation`] and
//! [`DebuggerError::Dwarf`] are fatal (exit code 2), raised during startup
//! before the REPL loop begins.
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DebuggerError {
    #[error("no such pc: 0x{0:x}")]
    NoSuchPc(u64),

    #[error("no such register: {0}")]
    NoSuchRegister(String),

    #[error("no such hart: {0}")]
    NoSuchHart(usize),

    #[error("address 0x{address:x} is not aligned for a {size}-byte access")]
    MisalignedAddress { address: u64, size: u8 },

    #[error("no source line corresponds to pc 0x{0:x}")]
    NoSuchLine(u64),

    #[error("no pc info for {path}:{line}")]
    NoPcInfo { path: String, line: u64 },

    #[error("failed to create session: {0}")]
    SessionCreation(anyhow::Error),

    #[error("dwarf error: {0}")]
    Dwarf(anyhow::Error),

    #[error("unsupported command: {0}")]
    Unsupported(String),
}
