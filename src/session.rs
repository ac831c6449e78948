//! The multi-hart debug session (spec §4.F): breakpoint set, active-hart
//! selection, and the single-hart/round-robin run loops.
use std::collections::HashSet;
use std::io::BufReader;
use std::path::Path;

use anyhow::{Context, Result};

use crate::error::DebuggerError;
use crate::hart::Hart;
use crate::trace;

/// Normalizes the asymmetric `Option` polarity of the source model's
/// `run`/`run_all` (spec §9 item 2): both operations now return this enum,
/// and callers no longer need to remember which one means "hit" for which
/// function.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunOutcome {
    /// Execution halted at a breakpoint, just before the matching event
    /// was committed. Carries the id of the hart that hit it.
    Breakpoint(u64),
    /// The trace was exhausted before any breakpoint was hit. Carries the
    /// id of the hart whose trace ran out (the active hart for `run`, the
    /// last hart examined for `run_all`).
    Exhausted(u64),
}

pub struct DebugSession {
    harts: Vec<Hart>,
    breakpoints: HashSet<u64>,
    active_hart: usize,
}

impl DebugSession {
    /// Discovers and ingests every hart trace file under `trace_dir`,
    /// sorted lexicographically (spec §6); hart index is position in that
    /// sorted order. Fails with `SessionCreationError` if the directory is
    /// missing or yields no trace files.
    pub fn new(trace_dir: &Path) -> Result<Self, DebuggerError> {
        Self::try_new(trace_dir).map_err(DebuggerError::SessionCreation)
    }

    fn try_new(trace_dir: &Path) -> Result<Self> {
        let paths = trace::discover_trace_files(trace_dir)
            .with_context(|| format!("failed to scan trace directory {}", trace_dir.display()))?;

        if paths.is_empty() {
            return Err(anyhow::anyhow!(
                "trace directory {} contains no trace files",
                trace_dir.display()
            ));
        }

        let mut harts = Vec::with_capacity(paths.len());
        for (hart_id, path) in paths.iter().enumerate() {
            let file = std::fs::File::open(path)
                .with_context(|| format!("failed to open trace file {}", path.display()))?;
            let trace_name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.display().to_string());

            let hart = Hart::new(BufReader::new(file), trace_name, hart_id as u64)?;
            harts.push(hart);
        }

        Ok(Self {
            harts,
            breakpoints: HashSet::new(),
            active_hart: 0,
        })
    }

    pub fn harts(&self) -> &[Hart] {
        &self.harts
    }

    pub fn active_hart_index(&self) -> usize {
        self.active_hart
    }

    pub fn active_hart(&self) -> &Hart {
        &self.harts[self.active_hart]
    }

    pub fn active_hart_mut(&mut self) -> &mut Hart {
        &mut self.harts[self.active_hart]
    }

    pub fn set_active_hart(&mut self, index: usize) -> Result<(), DebuggerError> {
        if index >= self.harts.len() {
            return Err(DebuggerError::NoSuchHart(index));
        }
        self.active_hart = index;
        Ok(())
    }

    pub fn add_breakpoint(&mut self, addr: u64) {
        self.breakpoints.insert(addr);
    }

    /// Returns whether a breakpoint was actually present (and removed).
    pub fn remove_breakpoint(&mut self, addr: u64) -> bool {
        self.breakpoints.remove(&addr)
    }

    pub fn breakpoints(&self) -> &HashSet<u64> {
        &self.breakpoints
    }

    /// Steps the active hart forward, checking its committed pc against
    /// the breakpoint set before each step, until that pc is a breakpoint
    /// or the trace is exhausted. Because the check happens before
    /// stepping, the halt leaves the hart's pc sitting exactly at the
    /// breakpoint address rather than past it.
    pub fn run(&mut self) -> RunOutcome {
        let hart_id = self.harts[self.active_hart].hart_id();

        loop {
            let hart = &mut self.harts[self.active_hart];
            if self.breakpoints.contains(&hart.read_pc()) {
                return RunOutcome::Breakpoint(hart_id);
            }
            if !hart.step_forward() {
                return RunOutcome::Exhausted(hart_id);
            }
        }
    }

    /// Steps every hart forward by one event per round, fixed round-robin
    /// order, independent of each event's `time` field (spec §5 — this is
    /// not a timestamp merge). After each hart's step, its new pc is
    /// checked against the breakpoint set; the first hit returns
    /// immediately. If a full round steps no hart forward, every trace is
    /// exhausted and the loop returns `Exhausted` for the last hart
    /// examined.
    pub fn run_all(&mut self) -> RunOutcome {
        loop {
            let mut any_stepped = false;
            let mut last_hart_id = 0;

            for hart in self.harts.iter_mut() {
                last_hart_id = hart.hart_id();
                let stepped = hart.step_forward();
                any_stepped |= stepped;

                if stepped && self.breakpoints.contains(&hart.read_pc()) {
                    return RunOutcome::Breakpoint(hart.hart_id());
                }
            }

            if !any_stepped {
                return RunOutcome::Exhausted(last_hart_id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    const SAMPLE_TRACE: &str = "\
1 2 N 0 0 4
2 2 N 4 0 8 x3=ff
3 2 N 8 0 c
4 2 N c 0 10 x3=fe
5 2 N 10 0 14
";

    fn session_with_one_hart() -> (tempfile::TempDir, DebugSession) {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("hart0_trace_log"), SAMPLE_TRACE).unwrap();
        let session = DebugSession::new(dir.path()).unwrap();
        (dir, session)
    }

    #[test]
    fn test_session_creation_fails_on_empty_directory() {
        let dir = tempfile::tempdir().unwrap();
        assert!(DebugSession::new(dir.path()).is_err());
    }

    #[test]
    fn test_set_active_hart_out_of_range() {
        let (_dir, mut session) = session_with_one_hart();
        assert!(session.set_active_hart(1).is_err());
        assert!(session.set_active_hart(0).is_ok());
    }

    #[test]
    fn test_add_remove_breakpoint_roundtrip() {
        let (_dir, mut session) = session_with_one_hart();
        session.add_breakpoint(0x08);
        assert!(session.remove_breakpoint(0x08));
        assert!(!session.remove_breakpoint(0x08));
    }

    #[test]
    fn test_run_halts_at_breakpoint_address() {
        let (_dir, mut session) = session_with_one_hart();
        session.add_breakpoint(0x08);
        session.add_breakpoint(0x10);

        let outcome = session.run();
        assert_eq!(outcome, RunOutcome::Breakpoint(0));
        assert_eq!(session.active_hart().read_pc(), 0x08);

        // A further step_forward carries on past the breakpoint.
        session.active_hart_mut().step_forward();
        assert_eq!(session.active_hart().read_pc(), 0x0c);
    }

    #[test]
    fn test_run_exhausts_without_breakpoint() {
        let (_dir, mut session) = session_with_one_hart();
        let outcome = session.run();
        assert_eq!(outcome, RunOutcome::Exhausted(0));
        assert_eq!(session.active_hart().read_pc(), 0x10);
    }

    #[test]
    fn test_run_all_round_robin_hits_breakpoint() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a_trace_log"), SAMPLE_TRACE).unwrap();
        fs::write(dir.path().join("b_trace_log"), SAMPLE_TRACE).unwrap();
        let mut session = DebugSession::new(dir.path()).unwrap();

        session.add_breakpoint(0x04);
        let outcome = session.run_all();
        assert_eq!(outcome, RunOutcome::Breakpoint(0));
    }

    #[test]
    fn test_run_all_exhausted_when_no_breakpoint_hit() {
        let (_dir, mut session) = session_with_one_hart();
        let outcome = session.run_all();
        assert_eq!(outcome, RunOutcome::Exhausted(0));
    }
}
