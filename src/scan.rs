//! A finite-state scanner for satisfiability-query logs.
//!
//! The solver log interleaves instruction-group headers, disassembly text,
//! per-position taint queries, optional model dumps, and solve results, with
//! plenty of surrounding chatter. [`QueryLogScanner`] walks the log line by
//! line and yields one [`InstructionTaintRecord`] per delimiter-terminated
//! instruction group. Lines that match no pattern expected in the current
//! state are skipped; that tolerance is intentional.

use crate::error::Error;
use crate::log::*;
use crate::taint::{InstructionTaintRecord, RecordedQuery, TaintValue, TaintWidth};

use std::collections::BTreeMap;
use std::io::BufRead;

use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    /// Instruction-group header, e.g. `**** 12 (0x08048000) ****`.
    static ref HEADER: Regex = Regex::new(r"^\*{4,}\s+(\d+)\s+\(.*\)\s*\*+$").unwrap();
    /// Run delimiter: a line of stars only. Flushes the current group.
    static ref DELIMITER: Regex = Regex::new(r"^\*+$").unwrap();
    /// Query/result separator: a line of dashes only.
    static ref SEPARATOR: Regex = Regex::new(r"^-+$").unwrap();
    /// Taint query, capturing the position and the register/memory key.
    static ref QUERY: Regex = Regex::new(r"^// Query for .+\[(\d+)\] of (.+)$").unwrap();
    /// Solve result, capturing the raw result code.
    static ref RESULT: Regex = Regex::new(r"^Solve result: (.+)$").unwrap();
}

/// Options for one scan over a query log.
///
/// A byte-level seek into the log is stream setup and happens before the
/// reader is handed over; seeking past the end of the stream simply yields an
/// empty sequence of records.
#[derive(Debug, Clone)]
pub struct ScanOptions {
    pub width: TaintWidth,
    /// Leading lines to discard before any state transition is attempted.
    pub skip_lines: u64,
    /// Stop after this many records, even if input remains.
    pub max_records: Option<u64>,
    /// Record each query/result pair on the emitted record.
    pub echo_queries: bool,
    /// Also record model text printed between `Model:` and the result.
    pub echo_model: bool,
}

impl Default for ScanOptions {
    fn default() -> Self {
        ScanOptions {
            width: TaintWidth::Bytewise,
            skip_lines: 0,
            max_records: None,
            echo_queries: false,
            echo_model: false,
        }
    }
}

/// The scanner's position in the query grammar.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScanState {
    /// Looking for the next instruction-group header.
    SeekHeader,
    /// Header seen; the next line is either disassembly or a separator.
    AwaitDisassembly,
    /// Disassembly captured; waiting for its closing separator.
    AwaitSeparator,
    /// Inside a group, expecting the next query line.
    AwaitQuery,
    /// Query captured; expecting `Model:` or the solve result.
    AwaitResultOrModel,
    /// Accumulating model text until the solve result arrives.
    AwaitModel,
    /// Result consumed; expecting the separator before the next query.
    AwaitPostResult,
}

/// A query whose result has not arrived yet.
struct PendingQuery {
    pos: u32,
    key: String,
    query: String,
    model: String,
}

enum Step {
    Continue,
    Emit(InstructionTaintRecord),
    Fail(Error),
}

/// Lazily turns a query log into [`InstructionTaintRecord`]s.
///
/// Iterator items are `Result`s: a malformed solve result surfaces as an
/// error for that group, after which the scanner has already resynchronized
/// and can keep producing later records.
pub struct QueryLogScanner<R: BufRead> {
    lines: std::io::Lines<R>,
    opts: ScanOptions,
    state: ScanState,
    line_no: u64,
    emitted: u64,
    index: u64,
    disassembly: Option<String>,
    taints: BTreeMap<String, TaintValue>,
    queries: Vec<RecordedQuery>,
    pending: Option<PendingQuery>,
}

impl<R: BufRead> QueryLogScanner<R> {
    pub fn new(reader: R, opts: ScanOptions) -> Self {
        QueryLogScanner {
            lines: reader.lines(),
            opts,
            state: ScanState::SeekHeader,
            line_no: 0,
            emitted: 0,
            index: 0,
            disassembly: None,
            taints: BTreeMap::new(),
            queries: Vec::new(),
            pending: None,
        }
    }

    /// Drop everything accumulated for the in-progress group.
    fn reset_group(&mut self) {
        self.disassembly = None;
        self.taints.clear();
        self.queries.clear();
        self.pending = None;
    }

    /// Emit the in-progress group as a record, if any queries landed.
    fn flush(&mut self) -> Option<InstructionTaintRecord> {
        self.pending = None;
        let disassembly = self.disassembly.take();
        let queries = std::mem::take(&mut self.queries);
        if self.taints.is_empty() {
            return None;
        }
        let record = InstructionTaintRecord {
            index: self.index,
            disassembly,
            taints: std::mem::take(&mut self.taints),
            queries,
        };
        trace!(
            "Finalized instruction taint group";
            "index" => record.index,
            "keys" => record.taints.len()
        );
        Some(record)
    }

    fn finish_query(&mut self, result: &str) -> Step {
        let pending = match self.pending.take() {
            Some(p) => p,
            // States that reach here always hold a pending query; treat a
            // stray result as chatter otherwise.
            None => return Step::Continue,
        };
        let tainted = match result.chars().next() {
            Some('I') => true,
            Some('V') => false,
            _ => {
                warn!(
                    "Malformed solve result";
                    "line" => self.line_no,
                    "code" => result
                );
                self.reset_group();
                self.state = ScanState::SeekHeader;
                return Step::Fail(Error::MalformedResult {
                    line: self.line_no,
                    code: result.to_owned(),
                });
            }
        };
        let value = self
            .taints
            .entry(pending.key)
            .or_insert_with(|| TaintValue::clean(self.opts.width));
        if let Err(e) = value.set(pending.pos, tainted) {
            self.reset_group();
            self.state = ScanState::SeekHeader;
            return Step::Fail(e);
        }
        if self.opts.echo_queries || self.opts.echo_model {
            self.queries.push(RecordedQuery {
                query: pending.query,
                result: result.to_owned(),
                model: (self.opts.echo_model && !pending.model.is_empty())
                    .then(|| pending.model),
            });
        }
        self.state = ScanState::AwaitPostResult;
        Step::Continue
    }

    fn step(&mut self, line: &str) -> Step {
        // The run delimiter flushes from any state.
        if DELIMITER.is_match(line) {
            self.state = ScanState::SeekHeader;
            return match self.flush() {
                Some(record) => Step::Emit(record),
                None => Step::Continue,
            };
        }
        match self.state {
            ScanState::SeekHeader => {
                if let Some(caps) = HEADER.captures(line) {
                    if let Ok(index) = caps[1].parse() {
                        self.index = index;
                        self.state = ScanState::AwaitDisassembly;
                    }
                }
            }
            ScanState::AwaitDisassembly => {
                if SEPARATOR.is_match(line) {
                    self.state = ScanState::AwaitQuery;
                } else {
                    self.disassembly = Some(line.trim().to_owned());
                    self.state = ScanState::AwaitSeparator;
                }
            }
            ScanState::AwaitSeparator => {
                if SEPARATOR.is_match(line) {
                    self.state = ScanState::AwaitQuery;
                }
            }
            ScanState::AwaitQuery => {
                if let Some(caps) = QUERY.captures(line) {
                    // Absurdly large positions are caught by TaintValue::set.
                    let pos = caps[1].parse().unwrap_or(u32::MAX);
                    self.pending = Some(PendingQuery {
                        pos,
                        key: caps[2].to_owned(),
                        query: line.trim().to_owned(),
                        model: String::new(),
                    });
                    self.state = ScanState::AwaitResultOrModel;
                }
            }
            ScanState::AwaitResultOrModel => {
                if line == "Model:" {
                    self.state = ScanState::AwaitModel;
                } else if let Some(caps) = RESULT.captures(line) {
                    return self.finish_query(&caps[1]);
                }
            }
            ScanState::AwaitModel => {
                if let Some(caps) = RESULT.captures(line) {
                    return self.finish_query(&caps[1]);
                } else if let Some(pending) = self.pending.as_mut() {
                    pending.model.push_str("  ");
                    pending.model.push_str(line);
                    pending.model.push('\n');
                }
            }
            ScanState::AwaitPostResult => {
                if SEPARATOR.is_match(line) {
                    self.state = ScanState::AwaitQuery;
                }
            }
        }
        Step::Continue
    }
}

impl<R: BufRead> Iterator for QueryLogScanner<R> {
    type Item = Result<InstructionTaintRecord, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(max) = self.opts.max_records {
            if self.emitted >= max {
                return None;
            }
        }
        loop {
            let line = match self.lines.next() {
                // A trailing group with no closing delimiter is dropped.
                None => return None,
                Some(Err(e)) => return Some(Err(e.into())),
                Some(Ok(line)) => line,
            };
            self.line_no += 1;
            if self.line_no <= self.opts.skip_lines {
                continue;
            }
            match self.step(&line) {
                Step::Continue => {}
                Step::Emit(record) => {
                    self.emitted += 1;
                    return Some(Ok(record));
                }
                Step::Fail(e) => return Some(Err(e)),
            }
        }
    }
}
