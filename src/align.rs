//! Cross-validation of a simulation taint trace against a reference trace.
//!
//! The simulation side is a stream of discrete `TAINT:` entries; the
//! reference side is scanned lazily, one entry at a time, and only ever
//! advances. Reference entries seen while looking for a match are parked in
//! a history buffer so the two streams may disagree about relative order.
//! With a retention window configured, parked entries that fall too far
//! behind the simulation stream are evicted instead of accumulating for the
//! life of the run.

use crate::error::Error;
use crate::log::*;
use crate::regmap;
use crate::taint;

use std::collections::BTreeMap;
use std::io::{BufRead, Write};

use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    /// Simulation-trace memory operand entry: index, address, value.
    static ref SIM_MEMORY: Regex = Regex::new(
        r"^TAINT: \((\d+)\) .+mem:\?u32\[(0x[0-9A-Fa-f]+):u32.*\]:u32.*->\s+(\S+)\s*$"
    )
    .unwrap();
    /// Simulation-trace register entry: index, raw key, value.
    static ref SIM_REGISTER: Regex =
        Regex::new(r"^TAINT: \((\d+)\) (\S+):.+->\s+(.+)$").unwrap();
    /// Reference-trace entry: index, key, value.
    static ref REF_TAINT: Regex =
        Regex::new(r"^TAINT: \((\d+)\) [0-9A-Fa-f]+ : (\S+) .* -> (\S+) .*$").unwrap();
}

/// Options for one alignment run.
#[derive(Debug, Clone)]
pub struct AlignOptions {
    /// Also report matching pairs and compare all-clean values.
    pub verbose: bool,
    /// Compare entries whose simulation value is the all-clean sentinel.
    /// Off by default: always-clean slots are not interesting divergences.
    pub compare_clean: bool,
    /// Retention window, in instructions, for buffered reference entries.
    /// `None` keeps every unmatched entry for the life of the run.
    pub history_window: Option<u64>,
}

impl Default for AlignOptions {
    fn default() -> Self {
        AlignOptions {
            verbose: false,
            compare_clean: false,
            history_window: None,
        }
    }
}

/// Counters for one alignment run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AlignStats {
    /// Simulation entries compared against a reference value.
    pub compared: u64,
    /// Compared pairs whose values differed.
    pub diverged: u64,
    /// Simulation `TAINT:` lines skipped as unparseable or unresolvable.
    pub skipped: u64,
    /// Simulation entries with no reference counterpart before exhaustion.
    pub unmatched: u64,
    /// Buffered reference entries evicted by the retention window.
    pub evicted: u64,
}

/// One discrete `(index, key, value)` entry, canonical key form.
#[derive(Debug, Clone, PartialEq, Eq)]
struct TraceEntry {
    index: u64,
    key: String,
    value: String,
}

fn parse_sim_line(line: &str) -> Option<TraceEntry> {
    // Memory operands first: the register grammar would otherwise capture a
    // meaningless prefix of the IL memory expression.
    if let Some(caps) = SIM_MEMORY.captures(line) {
        let addr = u64::from_str_radix(caps[2].trim_start_matches("0x"), 16).ok()?;
        return Some(TraceEntry {
            index: caps[1].parse().ok()?,
            key: regmap::memory_key(addr),
            value: caps[3].to_owned(),
        });
    }
    let caps = SIM_REGISTER.captures(line)?;
    Some(TraceEntry {
        index: caps[1].parse().ok()?,
        key: regmap::resolve_simulation(&caps[2])?,
        value: caps[3].trim().to_owned(),
    })
}

/// Lazy scan over the reference trace, emitting canonical-key entries.
struct RefScanner<R: BufRead> {
    lines: std::io::Lines<R>,
}

impl<R: BufRead> RefScanner<R> {
    fn next_entry(&mut self) -> Result<Option<TraceEntry>, Error> {
        for line in self.lines.by_ref() {
            let line = line?;
            let caps = match REF_TAINT.captures(line.trim()) {
                Some(caps) => caps,
                None => continue,
            };
            let index = match caps[1].parse() {
                Ok(index) => index,
                Err(_) => continue,
            };
            match regmap::resolve_reference(&caps[2]) {
                Some(key) => {
                    return Ok(Some(TraceEntry {
                        index,
                        key,
                        value: caps[3].to_owned(),
                    }))
                }
                None => {
                    warn!(
                        "Unresolved reference-trace key";
                        "index" => index,
                        "key" => &caps[2]
                    );
                }
            }
        }
        Ok(None)
    }
}

/// Merges the two taint streams and reports divergences to the output sink.
pub struct Aligner<R: BufRead> {
    reference: RefScanner<R>,
    history: BTreeMap<u64, BTreeMap<String, String>>,
    opts: AlignOptions,
    stats: AlignStats,
    exhausted: bool,
}

impl<R: BufRead> Aligner<R> {
    pub fn new(reference: R, opts: AlignOptions) -> Self {
        Aligner {
            reference: RefScanner {
                lines: reference.lines(),
            },
            history: BTreeMap::new(),
            opts,
            stats: AlignStats::default(),
            exhausted: false,
        }
    }

    /// Drive the alignment: one pass over the simulation stream, advancing
    /// the reference stream only as far as needed. Returns the run counters.
    pub fn run<S: BufRead, W: Write>(
        mut self,
        simulation: S,
        out: &mut W,
    ) -> Result<AlignStats, Error> {
        for line in simulation.lines() {
            let line = line?;
            let trimmed = line.trim();
            if !trimmed.starts_with("TAINT:") {
                continue;
            }
            match parse_sim_line(trimmed) {
                Some(entry) => self.check_entry(&entry, out)?,
                None => {
                    self.stats.skipped += 1;
                    warn!("Unresolved simulation entry"; "line" => trimmed);
                    writeln!(out, "SKIPPED: {}", line)?;
                }
            }
        }
        let leftover: usize = self.history.values().map(BTreeMap::len).sum();
        if leftover > 0 {
            info!(
                "Reference entries never consumed by the simulation trace";
                "count" => leftover
            );
        }
        debug!(
            "Alignment finished";
            "compared" => self.stats.compared,
            "diverged" => self.stats.diverged,
            "skipped" => self.stats.skipped,
            "unmatched" => self.stats.unmatched,
            "evicted" => self.stats.evicted
        );
        Ok(self.stats)
    }

    fn check_entry<W: Write>(&mut self, entry: &TraceEntry, out: &mut W) -> Result<(), Error> {
        self.evict_stale(entry.index);
        let reference = match self.take_buffered(entry) {
            Some(value) => value,
            None => match self.scan_for(entry)? {
                Some(value) => value,
                None => {
                    self.stats.unmatched += 1;
                    warn!(
                        "No reference entry for simulation entry";
                        "index" => entry.index,
                        "key" => %entry.key,
                        "value" => %entry.value
                    );
                    return Ok(());
                }
            },
        };
        if taint::is_clean_hex(&entry.value) && !self.opts.compare_clean && !self.opts.verbose {
            return Ok(());
        }
        self.stats.compared += 1;
        if entry.value == reference {
            if self.opts.verbose {
                writeln!(
                    out,
                    "({}) {} : {}  ==  {}",
                    entry.index, entry.key, entry.value, reference
                )?;
            }
            return Ok(());
        }
        self.stats.diverged += 1;
        match taint::xor_popcount(&entry.value, &reference) {
            Some(popcount) => writeln!(
                out,
                "({}) {} : {} <> {} XOR = {}",
                entry.index, entry.key, entry.value, reference, popcount
            )?,
            None => {
                warn!(
                    "Divergent pair with non-numeric taint value";
                    "index" => entry.index,
                    "key" => %entry.key
                );
                writeln!(
                    out,
                    "({}) {} : {} <> {}",
                    entry.index, entry.key, entry.value, reference
                )?;
            }
        }
        Ok(())
    }

    /// Consume a previously buffered reference value for this entry, if any.
    fn take_buffered(&mut self, entry: &TraceEntry) -> Option<String> {
        let regs = self.history.get_mut(&entry.index)?;
        let value = regs.remove(&entry.key)?;
        if regs.is_empty() {
            self.history.remove(&entry.index);
        }
        Some(value)
    }

    /// Advance the reference stream until this entry's counterpart shows up,
    /// parking every other entry seen on the way. The scan position is never
    /// rewound between simulation entries.
    fn scan_for(&mut self, entry: &TraceEntry) -> Result<Option<String>, Error> {
        if self.exhausted {
            return Ok(None);
        }
        while let Some(seen) = self.reference.next_entry()? {
            if seen.index == entry.index && seen.key == entry.key {
                return Ok(Some(seen.value));
            }
            self.history
                .entry(seen.index)
                .or_default()
                .insert(seen.key, seen.value);
        }
        self.exhausted = true;
        Ok(None)
    }

    fn evict_stale(&mut self, current: u64) {
        let window = match self.opts.history_window {
            Some(window) => window,
            None => return,
        };
        let cutoff = current.saturating_sub(window);
        let stale: Vec<u64> = self.history.range(..cutoff).map(|(&index, _)| index).collect();
        for index in stale {
            let regs = self.history.remove(&index).unwrap_or_default();
            self.stats.evicted += regs.len() as u64;
            debug!(
                "Evicted stale reference entries";
                "index" => index,
                "count" => regs.len()
            );
        }
    }
}
