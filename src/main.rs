use std::path::PathBuf;
use std::process;

use clap::{App, Arg};

mod decode;
mod dwarf;
mod error;
mod hart;
mod repl;
mod session;
mod trace;

use dwarf::DebugInfoProvider;
use error::DebuggerError;
use repl::Repl;
use session::DebugSession;

fn app<'a, 'b>() -> App<'a, 'b> {
    App::new(env!("CARGO_PKG_NAME"))
        .version(env!("CARGO_PKG_VERSION"))
        .about(env!("CARGO_PKG_DESCRIPTION"))
        .arg(
            Arg::with_name("trace-dir")
                .help("Directory containing one trace_log file per hart")
                .required(true)
                .index(1),
        )
        .arg(
            Arg::with_name("elf-path")
                .help("The ELF binary the traces were produced from")
                .required(true)
                .index(2),
        )
        .arg(
            Arg::with_name("path-prefix")
                .help("Normalizes DWARF source paths to the rightmost occurrence of this prefix")
                .short("p")
                .long("path-prefix")
                .takes_value(true),
        )
}

/// Builds the session and debug-info provider. Failures here are the only
/// ones that terminate the process (spec §7): a missing/empty trace
/// directory or an unreadable ELF/DWARF file.
fn initialize(trace_dir: &PathBuf, elf_path: &PathBuf, path_prefix: Option<&str>) -> Result<(DebugSession, DebugInfoProvider), DebuggerError> {
    log::debug!("creating session from trace directory {}", trace_dir.display());
    let session = DebugSession::new(trace_dir)?;

    log::debug!("loading debug info from {}", elf_path.display());
    let debug_info = DebugInfoProvider::new(elf_path, path_prefix).map_err(DebuggerError::Dwarf)?;

    Ok((session, debug_info))
}

fn main() {
    env_logger::init();

    let matches = app().get_matches();
    let trace_dir = PathBuf::from(matches.value_of("trace-dir").unwrap());
    let elf_path = PathBuf::from(matches.value_of("elf-path").unwrap());
    let path_prefix = matches.value_of("path-prefix");

    let (session, debug_info) = match initialize(&trace_dir, &elf_path, path_prefix) {
        Ok(pair) => pair,
        Err(e) => {
            eprintln!("Fatal: {:#}", e);
            process::exit(2);
        }
    };

    let mut repl = Repl::new(session, debug_info);
    if let Err(e) = repl.run() {
        eprintln!("Fatal: {:#}", e);
        process::exit(1);
    }
}
