//! The command dispatcher (spec §4.G/§6): a synchronous REPL over stdin
//! that drives a [`DebugSession`] and a [`DebugInfoProvider`].
//!
//! This is a scope-edge component — spec.md describes it only through the
//! interface it must present, since the interesting algorithms live in
//! `hart`, `session`, and `dwarf`. The dispatcher itself does no decoding
//! or stepping logic; it parses a verb, calls the matching session/
//! debug-info method, and formats the result.
use std::io::{self, BufRead, Write};

use anyhow::Result;

use crate::dwarf::{self, DebugInfoProvider, VariableLocation};
use crate::error::DebuggerError;
use crate::session::{DebugSession, RunOutcome};

pub struct Repl {
    session: DebugSession,
    debug_info: DebugInfoProvider,
}

fn parse_addr(text: &str) -> Result<u64> {
    match text.strip_prefix("0x") {
        Some(hex) => Ok(u64::from_str_radix(hex, 16)?),
        None => Ok(text.parse::<u64>()?),
    }
}

impl Repl {
    pub fn new(session: DebugSession, debug_info: DebugInfoProvider) -> Self {
        Self { session, debug_info }
    }

    /// Runs the `>`-prompted read-eval-print loop until `exit` or EOF.
    /// Every other failure is caught here, printed to stderr, and the
    /// prompt resumes (spec §7).
    pub fn run(&mut self) -> Result<()> {
        let stdin = io::stdin();
        let mut stdout = io::stdout();

        loop {
            print!("> ");
            stdout.flush()?;

            let mut line = String::new();
            if stdin.lock().read_line(&mut line)? == 0 {
                break;
            }

            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if line == "exit" {
                break;
            }

            if let Err(e) = self.dispatch(line) {
                eprintln!("error: {}", e);
            }
        }

        Ok(())
    }

    fn dispatch(&mut self, line: &str) -> Result<()> {
        let mut parts = line.splitn(2, char::is_whitespace);
        let verb = parts.next().unwrap_or("");
        let args = parts.next().unwrap_or("").trim();

        match verb {
            "reg" => self.cmd_reg(args),
            "hart" => self.cmd_hart(args),
            "step" | "s" => self.cmd_step(),
            "step_back" | "sb" => self.cmd_step_back(),
            "run-till" | "rt" => self.cmd_run_till(args),
            "bp" => self.cmd_breakpoint(args, true),
            "rbp" => self.cmd_breakpoint(args, false),
            "resume" | "run" => self.cmd_resume(args),
            "line" | "l" => self.cmd_line(args),
            "variables" => self.cmd_variables(),
            _ => Err(DebuggerError::Unsupported(verb.to_string()).into()),
        }
    }

    fn cmd_reg(&self, args: &str) -> Result<()> {
        let hart = self.session.active_hart();

        if args.is_empty() {
            for (name, value) in hart.get_all_regs() {
                println!("{}=0x{:x}", name, value);
            }
        } else {
            let value = hart.read_register_by_name(args)?;
            println!("{}=0x{:x}", args, value);
        }

        Ok(())
    }

    fn cmd_hart(&mut self, args: &str) -> Result<()> {
        if args.is_empty() {
            for (i, hart) in self.session.harts().iter().enumerate() {
                let marker = if i == self.session.active_hart_index() {
                    "*"
                } else {
                    " "
                };
                println!("{}{} {}", marker, i, hart.description());
            }
        } else {
            let index: usize = args.parse()?;
            self.session.set_active_hart(index)?;
        }

        Ok(())
    }

    fn cmd_step(&mut self) -> Result<()> {
        self.session.active_hart_mut().step_forward();
        Ok(())
    }

    fn cmd_step_back(&mut self) -> Result<()> {
        self.session.active_hart_mut().step_back();
        Ok(())
    }

    fn cmd_run_till(&mut self, args: &str) -> Result<()> {
        let addr = parse_addr(args)?;
        self.session.active_hart_mut().set_state_pc(addr)?;
        Ok(())
    }

    fn resolve_breakpoint_addrs(&self, args: &str) -> Result<Vec<u64>> {
        if args.contains(':') {
            let spec = dwarf::parse_line_spec(args)?;
            Ok(self.debug_info.get_pc_by_line(&spec)?)
        } else {
            Ok(vec![parse_addr(args)?])
        }
    }

    fn cmd_breakpoint(&mut self, args: &str, add: bool) -> Result<()> {
        let addrs = self.resolve_breakpoint_addrs(args)?;

        for addr in addrs {
            if add {
                self.session.add_breakpoint(addr);
                println!("breakpoint set at 0x{:x}", addr);
            } else {
                let removed = self.session.remove_breakpoint(addr);
                println!(
                    "breakpoint at 0x{:x} {}",
                    addr,
                    if removed { "removed" } else { "was not set" }
                );
            }
        }

        Ok(())
    }

    fn cmd_resume(&mut self, args: &str) -> Result<()> {
        let outcome = if args.is_empty() {
            self.session.run_all()
        } else {
            let index: usize = args.parse()?;
            self.session.set_active_hart(index)?;
            self.session.run()
        };

        match outcome {
            RunOutcome::Breakpoint(hart_id) => println!("hart {} hit a breakpoint", hart_id),
            RunOutcome::Exhausted(hart_id) => println!("hart {} exhausted its trace", hart_id),
        }

        Ok(())
    }

    fn cmd_line(&self, args: &str) -> Result<()> {
        let pc = if args.is_empty() {
            self.session.active_hart().read_pc()
        } else {
            parse_addr(args)?
        };

        let line = self.debug_info.get_line_by_pc(pc)?;
        println!("{}:{}:{}", line.path, line.line, line.column);

        Ok(())
    }

    fn cmd_variables(&self) -> Result<()> {
        let hart = self.session.active_hart();
        let pc = hart.read_pc();
        let stack_pointer = hart.read_register_by_index(2)?;

        for var in self.debug_info.get_available_variables(pc) {
            let addr = match var.location {
                VariableLocation::Memory(addr) => Some(addr),
                VariableLocation::FrameOffset(offset) => {
                    Some((stack_pointer as i64).wrapping_add(offset) as u64)
                }
                VariableLocation::Register(_) => None,
            };

            match addr {
                Some(addr) => println!(
                    "{}: {} (size {}) @ 0x{:x}",
                    var.name, var.type_name, var.byte_size, addr
                ),
                None => println!("{}: {} (size {}) in register", var.name, var.type_name, var.byte_size),
            }
        }

        Ok(())
    }
}

