//! Trace line lexing (spec §4.B/§6) and trace-directory discovery.
//!
//! A trace file is one line per retired instruction. `TraceLine` is the
//! immediate parse of that grammar; `hart::TraceEvent` (built from a
//! sequence of `TraceLine`s during ingestion) is the model the rest of the
//! debugger actually consumes.
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};

use crate::hart::{RegType, RegisterDescriptor};

/// One parsed line of a trace file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TraceLine {
    pub time: u64,
    pub rsv1: i32,
    pub rsv2: char,
    pub cur_pc: u64,
    pub instr: u32,
    pub next_pc: u64,
    pub update: Option<(RegisterDescriptor, u64)>,
}

/// Parses one non-comment, non-blank trace line.
///
/// Grammar (spec §6):
/// `<ws>* time rsv1 rsv2 cur_pc instr next_pc [ ("x"|"f")idx"="val ]`
/// with `cur_pc`/`instr`/`next_pc`/`val` hex without a `0x` prefix.
pub fn parse_line(line: &str) -> Result<TraceLine> {
    let mut fields = line.split_whitespace();

    let time = fields
        .next()
        .ok_or_else(|| anyhow!("missing time field"))?
        .parse::<u64>()?;
    let rsv1 = fields
        .next()
        .ok_or_else(|| anyhow!("missing rsv1 field"))?
        .parse::<i32>()?;
    let rsv2_field = fields.next().ok_or_else(|| anyhow!("missing rsv2 field"))?;
    if rsv2_field.chars().count() != 1 {
        return Err(anyhow!("rsv2 field {:?} is not a single character", rsv2_field));
    }
    let rsv2 = rsv2_field.chars().next().unwrap();

    let cur_pc = u64::from_str_radix(
        fields.next().ok_or_else(|| anyhow!("missing cur_pc field"))?,
        16,
    )?;
    let instr = u32::from_str_radix(
        fields.next().ok_or_else(|| anyhow!("missing instr field"))?,
        16,
    )?;
    let next_pc = u64::from_str_radix(
        fields.next().ok_or_else(|| anyhow!("missing next_pc field"))?,
        16,
    )?;

    let update = match fields.next() {
        Some(update_field) => Some(parse_update(update_field)?),
        None => None,
    };

    Ok(TraceLine {
        time,
        rsv1,
        rsv2,
        cur_pc,
        instr,
        next_pc,
        update,
    })
}

fn parse_update(field: &str) -> Result<(RegisterDescriptor, u64)> {
    let mut chars = field.chars();
    let kind_char = chars
        .next()
        .ok_or_else(|| anyhow!("empty register update field"))?;
    let kind = match kind_char {
        'x' => RegType::Int,
        'f' => RegType::Float,
        other => return Err(anyhow!("unknown register update kind: {:?}", other)),
    };

    let rest = chars.as_str();
    let eq_pos = rest
        .find('=')
        .ok_or_else(|| anyhow!("register update field {:?} missing '='", field))?;

    let index: usize = rest[..eq_pos].parse()?;
    let value = u64::from_str_radix(&rest[eq_pos + 1..], 16)?;

    Ok((RegisterDescriptor { kind, index }, value))
}

/// Returns every hart trace file under `dir`, sorted lexicographically so
/// that a file's position in the result is its hart index.
///
/// A regular file is selected when its name contains `trace_log` and does
/// not contain `csr`.
pub fn discover_trace_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut paths = vec![];

    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        if !file_type.is_file() {
            continue;
        }

        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.contains("trace_log") && !name.contains("csr") {
            paths.push(entry.path());
        }
    }

    paths.sort();

    Ok(paths)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_line_with_update() {
        let line = "                1221           3 N 0000000002000348 00000193 000000000200034c x3=0000000000000000";
        let parsed = parse_line(line).unwrap();

        assert_eq!(parsed.time, 1221);
        assert_eq!(parsed.rsv1, 3);
        assert_eq!(parsed.rsv2, 'N');
        assert_eq!(parsed.cur_pc, 0x2000348);
        assert_eq!(parsed.instr, 0x193);
        assert_eq!(parsed.next_pc, 0x200034c);
        assert_eq!(
            parsed.update,
            Some((
                RegisterDescriptor {
                    kind: RegType::Int,
                    index: 3
                },
                0
            ))
        );
    }

    #[test]
    fn test_parse_line_without_update() {
        let line = "                2698           0 N 00000000020004c0 0000100f 00000000020004c4";
        let parsed = parse_line(line).unwrap();

        assert_eq!(parsed.time, 2698);
        assert_eq!(parsed.rsv1, 0);
        assert_eq!(parsed.rsv2, 'N');
        assert_eq!(parsed.cur_pc, 0x20004c0);
        assert_eq!(parsed.instr, 0x100f);
        assert_eq!(parsed.next_pc, 0x20004c4);
        assert_eq!(parsed.update, None);
    }

    #[test]
    fn test_malformed_line_is_an_error() {
        assert!(parse_line("not a trace line").is_err());
    }

    #[test]
    fn test_discover_trace_files_filters_and_sorts() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["b_trace_log", "a_trace_log", "csr_trace_log", "unrelated.txt"] {
            fs::write(dir.path().join(name), "").unwrap();
        }

        let found = discover_trace_files(dir.path()).unwrap();
        let names: Vec<_> = found
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();

        assert_eq!(names, vec!["a_trace_log", "b_trace_log"]);
    }
}
