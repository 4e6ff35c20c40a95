//! Memory traces
//!
//! One operation per line:
//! `i 0xADDR` fetches an instruction, `r 0xADDR` loads a word and
//! `w 0xADDR VALUE` stores one. Blank lines and `#` comments are skipped.

use log::info;

use crate::error::SimulatorResult;
use crate::error::TraceError;
use crate::memory::cache::CacheHistory;
use crate::memory::MemoryHierarchy;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operation {
    Fetch(u32),
    Load(u32),
    Store(u32, u32),
}

/// Totals of one trace replay
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RunStats {
    pub operations: u64,
    /// Calls made to the hierarchy, stalled ones included
    pub driver_calls: u64,
    pub stat_cycles: u64,
    pub icache: CacheHistory,
    pub dcache: CacheHistory,
}

fn parse_error(line: usize, reason: impl Into<String>) -> TraceError {
    TraceError::ParseError {
        line,
        reason: reason.into(),
    }
}

fn parse_hex(line: usize, field: &str) -> Result<u32, TraceError> {
    let digits = field.strip_prefix("0x").ok_or_else(|| {
        parse_error(line, format!("expected hexadecimal starting with '0x', got '{field}'"))
    })?;
    u32::from_str_radix(digits, 16)
        .map_err(|_| parse_error(line, format!("invalid hexadecimal '{field}'")))
}

fn parse_value(line: usize, field: &str) -> Result<u32, TraceError> {
    if field.starts_with("0x") {
        return parse_hex(line, field);
    }
    field
        .parse()
        .map_err(|_| parse_error(line, format!("invalid value '{field}'")))
}

/// Parse trace text into operations
pub fn parse_operations(content: &str) -> Result<Vec<Operation>, TraceError> {
    let mut operations = Vec::new();

    for (line_num, line) in content.lines().enumerate() {
        let line_num = line_num + 1;
        let line = line.split('#').next().unwrap_or("").trim();
        if line.is_empty() {
            continue;
        }

        let parts: Vec<&str> = line.split_whitespace().collect();
        let operation = match parts.as_slice() {
            ["i", address] => Operation::Fetch(parse_hex(line_num, address)?),
            ["r", address] => Operation::Load(parse_hex(line_num, address)?),
            ["w", address, value] => Operation::Store(
                parse_hex(line_num, address)?,
                parse_value(line_num, value)?,
            ),
            [op, ..] if !["i", "r", "w"].contains(op) => {
                return Err(parse_error(
                    line_num,
                    format!("invalid operation '{op}': expected 'i', 'r' or 'w'"),
                ))
            }
            _ => {
                return Err(parse_error(
                    line_num,
                    "expected 'i|r ADDRESS' or 'w ADDRESS VALUE'",
                ))
            }
        };
        operations.push(operation);
    }

    Ok(operations)
}

/// Fetch operations from the trace file
pub fn fetch_operations(trace_path: &str) -> SimulatorResult<Vec<Operation>> {
    let content = std::fs::read_to_string(trace_path)?;
    Ok(parse_operations(&content)?)
}

/// Drive every operation through the hierarchy, re-issuing each
/// request until it completes
pub fn replay(mem: &mut MemoryHierarchy, operations: &[Operation]) -> RunStats {
    let mut stats = RunStats::default();

    for operation in operations {
        loop {
            stats.driver_calls += 1;
            let done = match *operation {
                Operation::Fetch(address) => mem.fetch(address).is_some(),
                Operation::Load(address) => mem.load(address).is_some(),
                Operation::Store(address, value) => mem.store(address, value),
            };
            if done {
                break;
            }
        }
        stats.operations += 1;
    }

    stats.stat_cycles = mem.history.stat_cycles;
    stats.icache = mem.icache.history;
    stats.dcache = mem.dcache.history;
    info!(
        "replayed {} operations in {} calls, {} miss cycles",
        stats.operations, stats.driver_calls, stats.stat_cycles
    );
    stats
}

/// Run a trace file through the hierarchy
pub fn run_trace(mem: &mut MemoryHierarchy, trace_path: &str) -> SimulatorResult<RunStats> {
    let operations = fetch_operations(trace_path)?;
    Ok(replay(mem, &operations))
}
