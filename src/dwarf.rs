//! The debug-info provider (spec §4.E): PC↔source-line maps and
//! on-demand variable-location resolution, built from an ELF binary's
//! DWARF sections.
use std::collections::HashMap;
use std::path::Path;
use std::rc::Rc;

use anyhow::{anyhow, Context, Result};
use gimli::{
    AttributeValue, DebuggingInformationEntry, Dwarf, EndianRcSlice, Reader, RunTimeEndian, Unit,
    UnitOffset,
};
use object::{Object, ObjectSection};

use crate::error::DebuggerError;

type R = EndianRcSlice<RunTimeEndian>;

/// `SIZE_MAX`-equivalent sentinel for a variable whose size couldn't be
/// resolved (spec §4.E item 3).
pub const UNKNOWN_SIZE: u64 = u64::MAX;

/// A `(path, line, column)` key. The `line→[addr]` map is keyed on the
/// normalized form (`column` pinned to `0`); `addr→line` values retain the
/// real column.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SourceLine {
    pub path: String,
    pub line: u64,
    pub column: u64,
}

impl SourceLine {
    pub fn normalized(&self) -> SourceLine {
        SourceLine {
            path: self.path.clone(),
            line: self.line,
            column: 0,
        }
    }
}

/// A resolved DWARF location expression.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VariableLocation {
    Memory(u64),
    Register(u64),
    FrameOffset(i64),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VariableInfo {
    pub name: String,
    pub type_name: String,
    pub byte_size: u64,
    pub location: VariableLocation,
}

/// Owns the ELF file's parsed DWARF sections (backed by reference-counted
/// owned buffers, so the provider never borrows from a live file handle)
/// and the line tables derived from them. Move-only: there is no `Clone`
/// impl, matching the source model's non-copyable resource contract.
pub struct DebugInfoProvider {
    dwarf: Dwarf<R>,
    line_to_addrs: HashMap<SourceLine, Vec<u64>>,
    addr_to_line: HashMap<u64, SourceLine>,
}

fn load_section(object: &object::File, endian: RunTimeEndian, id: gimli::SectionId) -> Result<R> {
    let data = match object.section_by_name(id.name()) {
        Some(section) => section.uncompressed_data()?.into_owned(),
        None => Vec::new(),
    };
    Ok(EndianRcSlice::new(Rc::from(data.into_boxed_slice()), endian))
}

/// Rewrites `path` by finding the rightmost occurrence of `prefix` and
/// keeping everything from there onward. A missing prefix leaves the path
/// untouched.
fn apply_prefix(path: String, prefix: Option<&str>) -> String {
    match prefix {
        Some(prefix) if !prefix.is_empty() => match path.rfind(prefix) {
            Some(idx) => path[idx..].to_string(),
            None => path,
        },
        _ => path,
    }
}

impl DebugInfoProvider {
    pub fn new(elf_path: &Path, prefix: Option<&str>) -> Result<Self> {
        let buffer = std::fs::read(elf_path)
            .with_context(|| format!("failed to read ELF file {}", elf_path.display()))?;
        let object = object::File::parse(&*buffer)
            .with_context(|| format!("failed to parse ELF file {}", elf_path.display()))?;
        let endian = if object.is_little_endian() {
            RunTimeEndian::Little
        } else {
            RunTimeEndian::Big
        };

        let dwarf = Dwarf::load(|id| load_section(&object, endian, id))
            .context("failed to load DWARF sections")?;

        let mut provider = Self {
            dwarf,
            line_to_addrs: HashMap::new(),
            addr_to_line: HashMap::new(),
        };
        provider.build_line_tables(prefix)?;

        Ok(provider)
    }

    fn build_line_tables(&mut self, prefix: Option<&str>) -> Result<()> {
        let mut units = self.dwarf.units();
        while let Some(header) = units.next()? {
            let unit = match self.dwarf.unit(header) {
                Ok(unit) => unit,
                Err(e) => {
                    log::warn!("skipping unreadable compilation unit: {}", e);
                    continue;
                }
            };

            let program = match unit.line_program.clone() {
                Some(program) => program,
                None => continue,
            };

            let mut rows = program.rows();
            while let Some((header, row)) = rows.next_row()? {
                if row.end_sequence() {
                    continue;
                }

                let file = match row.file(header) {
                    Some(file) => file,
                    None => continue,
                };

                let path = apply_prefix(self.file_path(&unit, header, file), prefix);
                let line = row.line().map(|l| l.get()).unwrap_or(0);
                let column = match row.column() {
                    gimli::ColumnType::LeftEdge => 0,
                    gimli::ColumnType::Column(c) => c.get(),
                };
                let addr = row.address();

                let full = SourceLine { path, line, column };
                self.addr_to_line.insert(addr, full.clone());
                self.line_to_addrs
                    .entry(full.normalized())
                    .or_insert_with(Vec::new)
                    .push(addr);
            }
        }

        Ok(())
    }

    fn file_path(
        &self,
        unit: &Unit<R>,
        header: &gimli::LineProgramHeader<R>,
        file: &gimli::FileEntry<R>,
    ) -> String {
        let mut path = String::new();

        if let Some(dir) = file.directory(header) {
            if let Ok(dir_name) = self.dwarf.attr_string(unit, dir) {
                if let Ok(dir_name) = dir_name.to_string_lossy() {
                    path.push_str(&dir_name);
                    path.push('/');
                }
            }
        }

        if let Ok(name) = self.dwarf.attr_string(unit, file.path_name()) {
            if let Ok(name) = name.to_string_lossy() {
                path.push_str(&name);
            }
        }

        path
    }

    pub fn get_line_by_pc(&self, pc: u64) -> Result<SourceLine, DebuggerError> {
        self.addr_to_line
            .get(&pc)
            .cloned()
            .ok_or(DebuggerError::NoSuchLine(pc))
    }

    pub fn get_pc_by_line(&self, spec: &SourceLine) -> Result<Vec<u64>, DebuggerError> {
        let key = spec.normalized();
        self.line_to_addrs
            .get(&key)
            .cloned()
            .ok_or_else(|| DebuggerError::NoPcInfo {
                path: key.path.clone(),
                line: key.line,
            })
    }

    /// Re-walks every compilation unit looking for `variable`/
    /// `formal_parameter` DIEs whose enclosing lexical scope contains `pc`.
    /// Failures resolving an individual variable are swallowed; the
    /// variable is simply omitted (spec §4.E item 3).
    pub fn get_available_variables(&self, pc: u64) -> Vec<VariableInfo> {
        let mut variables = vec![];
        let mut units = self.dwarf.units();

        loop {
            let header = match units.next() {
                Ok(Some(header)) => header,
                Ok(None) => break,
                Err(e) => {
                    log::warn!("error iterating compilation units: {}", e);
                    break;
                }
            };

            let unit = match self.dwarf.unit(header) {
                Ok(unit) => unit,
                Err(e) => {
                    log::warn!("skipping unreadable compilation unit: {}", e);
                    continue;
                }
            };

            self.walk_unit_variables(&unit, pc, &mut variables);
        }

        variables
    }

    fn walk_unit_variables(&self, unit: &Unit<R>, pc: u64, out: &mut Vec<VariableInfo>) {
        let mut entries = unit.entries();
        let mut depth: isize = 0;
        // (depth at which this scope was pushed, [low, high))
        let mut scope_stack: Vec<(isize, u64, u64)> = vec![];

        loop {
            let (delta, entry) = match entries.next_dfs() {
                Ok(Some(pair)) => pair,
                Ok(None) => break,
                Err(e) => {
                    log::warn!("error walking DIE tree: {}", e);
                    break;
                }
            };
            depth += delta;

            while let Some(&(scope_depth, _, _)) = scope_stack.last() {
                if scope_depth >= depth {
                    scope_stack.pop();
                } else {
                    break;
                }
            }

            match entry.tag() {
                gimli::DW_TAG_subprogram
                | gimli::DW_TAG_lexical_block
                | gimli::DW_TAG_inlined_subroutine => {
                    if let Some((low, high)) = self.scope_range(entry) {
                        scope_stack.push((depth, low, high));
                    }
                }
                gimli::DW_TAG_variable | gimli::DW_TAG_formal_parameter => {
                    let in_scope = scope_stack.iter().any(|&(_, low, high)| pc >= low && pc < high);
                    if in_scope {
                        if let Some(info) = self.resolve_variable(unit, entry) {
                            out.push(info);
                        }
                    }
                }
                _ => {}
            }
        }
    }

    fn scope_range(&self, entry: &DebuggingInformationEntry<R>) -> Option<(u64, u64)> {
        let low = match entry.attr_value(gimli::DW_AT_low_pc).ok()?? {
            AttributeValue::Addr(addr) => addr,
            _ => return None,
        };

        let high = match entry.attr_value(gimli::DW_AT_high_pc).ok()?? {
            AttributeValue::Addr(addr) => addr,
            AttributeValue::Udata(offset) => low + offset,
            AttributeValue::Data1(offset) => low + offset as u64,
            AttributeValue::Data2(offset) => low + offset as u64,
            AttributeValue::Data4(offset) => low + offset as u64,
            AttributeValue::Data8(offset) => low + offset,
            _ => return None,
        };

        Some((low, high))
    }

    fn resolve_variable(&self, unit: &Unit<R>, entry: &DebuggingInformationEntry<R>) -> Option<VariableInfo> {
        let name = match self.attr_name(unit, entry, gimli::DW_AT_name) {
            Some(name) => name,
            None => {
                log::warn!("skipping variable at {:?}: missing DW_AT_name", entry.offset());
                return None;
            }
        };
        let (type_name, byte_size) = match entry.attr_value(gimli::DW_AT_type) {
            Ok(Some(AttributeValue::UnitRef(offset))) => self.resolve_type(unit, offset),
            _ => {
                log::warn!("variable {:?}: unresolvable DW_AT_type form, using unknown", name);
                ("unknown".to_string(), UNKNOWN_SIZE)
            }
        };
        let location = self.resolve_location(unit.encoding(), entry)?;

        Some(VariableInfo {
            name,
            type_name,
            byte_size,
            location,
        })
    }

    /// Follows `DW_AT_type` through `typedef` chains, prefixing `"const "`
    /// for `const` qualifiers, and reads `DW_AT_byte_size` at the terminal
    /// base type.
    fn resolve_type(&self, unit: &Unit<R>, offset: UnitOffset) -> (String, u64) {
        let mut current = offset;
        let mut prefix = String::new();

        loop {
            let entry = match unit.entry(current) {
                Ok(entry) => entry,
                Err(_) => return (format!("{}unknown", prefix), UNKNOWN_SIZE),
            };

            match entry.tag() {
                gimli::DW_TAG_const_type => {
                    prefix.push_str("const ");
                    match self.referenced_type(&entry) {
                        Some(next) => {
                            current = next;
                            continue;
                        }
                        None => return (format!("{}void", prefix), 0),
                    }
                }
                gimli::DW_TAG_typedef => match self.referenced_type(&entry) {
                    Some(next) => {
                        current = next;
                        continue;
                    }
                    None => return (format!("{}unknown", prefix), UNKNOWN_SIZE),
                },
                _ => {
                    let name = self
                        .attr_name(unit, &entry, gimli::DW_AT_name)
                        .unwrap_or_else(|| "unknown".to_string());
                    let size = match entry.attr_value(gimli::DW_AT_byte_size) {
                        Ok(Some(AttributeValue::Udata(size))) => size,
                        _ => UNKNOWN_SIZE,
                    };
                    return (format!("{}{}", prefix, name), size);
                }
            }
        }
    }

    fn referenced_type(&self, entry: &DebuggingInformationEntry<R>) -> Option<UnitOffset> {
        match entry.attr_value(gimli::DW_AT_type).ok()?? {
            AttributeValue::UnitRef(offset) => Some(offset),
            _ => None,
        }
    }

    fn attr_name(
        &self,
        unit: &Unit<R>,
        entry: &DebuggingInformationEntry<R>,
        attr: gimli::DwAt,
    ) -> Option<String> {
        let value = entry.attr_value(attr).ok()??;
        let raw = self.dwarf.attr_string(unit, value).ok()?;
        raw.to_string_lossy().ok().map(|s| s.into_owned())
    }

    /// Decodes the DWARF location expression attached to a variable DIE.
    /// Only `DW_OP_addr` and `DW_OP_fbreg` are understood; any other
    /// expression fails this single variable without being fatal.
    fn resolve_location(
        &self,
        encoding: gimli::Encoding,
        entry: &DebuggingInformationEntry<R>,
    ) -> Option<VariableLocation> {
        let value = match entry.attr_value(gimli::DW_AT_location) {
            Ok(Some(value)) => value,
            Ok(None) => {
                log::warn!("skipping variable at {:?}: no DW_AT_location attribute", entry.offset());
                return None;
            }
            Err(e) => {
                log::warn!(
                    "skipping variable at {:?}: failed to read DW_AT_location: {}",
                    entry.offset(),
                    e
                );
                return None;
            }
        };
        let expr = match value {
            AttributeValue::Exprloc(expr) => expr,
            _ => {
                log::warn!(
                    "skipping variable at {:?}: DW_AT_location is not an exprloc",
                    entry.offset()
                );
                return None;
            }
        };

        let mut ops = expr.operations(encoding);
        match ops.next() {
            Ok(Some(gimli::Operation::Address { address })) => Some(VariableLocation::Memory(address)),
            Ok(Some(gimli::Operation::FrameOffset { offset })) => Some(VariableLocation::FrameOffset(offset)),
            Ok(Some(_)) => {
                log::warn!(
                    "skipping variable at {:?}: unsupported location expression op",
                    entry.offset()
                );
                None
            }
            Ok(None) => {
                log::warn!("skipping variable at {:?}: empty location expression", entry.offset());
                None
            }
            Err(e) => {
                log::warn!(
                    "skipping variable at {:?}: failed to decode location expression: {}",
                    entry.offset(),
                    e
                );
                None
            }
        }
    }
}

impl std::fmt::Debug for DebugInfoProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DebugInfoProvider")
            .field("lines_indexed", &self.addr_to_line.len())
            .finish()
    }
}

/// Parses a `<path>:<line>` or `<path>:<line>:<column>` command-line spec
/// into a `SourceLine` with the column forced to `0` for lookup, per
/// `get_pc_by_line`'s contract.
pub fn parse_line_spec(spec: &str) -> Result<SourceLine> {
    let segments: Vec<&str> = spec.split(':').collect();
    let (path, line_part) = match segments.as_slice() {
        [path, line] => (*path, *line),
        [path, line, _column] => (*path, *line),
        _ => {
            return Err(anyhow!(
                "line spec {:?} must be <path>:<line> or <path>:<line>:<column>",
                spec
            ))
        }
    };

    let line = line_part
        .parse::<u64>()
        .with_context(|| format!("invalid line number in {:?}", spec))?;

    Ok(SourceLine {
        path: path.to_string(),
        line,
        column: 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_prefix_keeps_rightmost_match() {
        let path = "/build/tmp/src/project/src/main.c".to_string();
        let rewritten = apply_prefix(path, Some("src/"));
        assert_eq!(rewritten, "src/project/src/main.c".to_string());
    }

    #[test]
    fn test_apply_prefix_no_match_is_noop() {
        let path = "/build/tmp/main.c".to_string();
        let rewritten = apply_prefix(path.clone(), Some("nonexistent/"));
        assert_eq!(rewritten, path);
    }

    #[test]
    fn test_parse_line_spec() {
        let spec = parse_line_spec("src/main.c:42").unwrap();
        assert_eq!(spec.path, "src/main.c");
        assert_eq!(spec.line, 42);
        assert_eq!(spec.column, 0);
    }

    #[test]
    fn test_parse_line_spec_with_column() {
        let spec = parse_line_spec("a.c:10:5").unwrap();
        assert_eq!(spec.path, "a.c");
        assert_eq!(spec.line, 10);
        assert_eq!(spec.column, 0);
    }

    #[test]
    fn test_parse_line_spec_rejects_too_many_segments() {
        assert!(parse_line_spec("a.c:10:5:extra").is_err());
    }

    #[test]
    fn test_normalized_pins_column_zero() {
        let spec = SourceLine {
            path: "a.c".to_string(),
            line: 10,
            column: 3,
        };
        assert_eq!(spec.normalized().column, 0);
    }
}
