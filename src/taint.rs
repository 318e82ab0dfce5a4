//! Fixed-width taint values and the per-instruction records built from them.
//!
//! A taint value tracks either 32 individual bits or 4 whole bytes of one
//! 32-bit machine word. The query-log scanner records one position per
//! satisfiability query; position 0 always lands in the least significant
//! digit group of the canonical hexadecimal form.

use std::collections::BTreeMap;

use crate::error::Error;

/// Granularity of taint tracking for one value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaintWidth {
    /// 32 independently tracked bits.
    Bitwise,
    /// 4 independently tracked bytes, each fully tainted or fully clean.
    Bytewise,
}

impl TaintWidth {
    /// Number of addressable positions at this width.
    pub fn positions(self) -> u32 {
        match self {
            TaintWidth::Bitwise => 32,
            TaintWidth::Bytewise => 4,
        }
    }
}

/// One register's (or memory operand's) taint for one instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaintValue {
    width: TaintWidth,
    flags: u32,
}

impl TaintValue {
    /// A value with every position clean.
    pub fn clean(width: TaintWidth) -> Self {
        TaintValue { width, flags: 0 }
    }

    /// Mark position `pos` tainted or clean. Positions outside the tracked
    /// width are rejected, never clamped.
    pub fn set(&mut self, pos: u32, tainted: bool) -> Result<(), Error> {
        if pos >= self.width.positions() {
            return Err(Error::PositionOutOfRange {
                pos,
                width: self.width,
            });
        }
        if tainted {
            self.flags |= 1 << pos;
        } else {
            self.flags &= !(1 << pos);
        }
        Ok(())
    }

    pub fn is_clean(&self) -> bool {
        self.flags == 0
    }

    /// Canonical 8-hex-digit form, `0x` prefixed.
    ///
    /// Bitwise values render lowercase with bit `p` of the number holding
    /// position `p`. Bytewise values render byte 3 down to byte 0, each set
    /// flag as `FF` and each clear flag as `00`, matching the summary format
    /// the downstream comparison consumes.
    pub fn to_hex(&self) -> String {
        match self.width {
            TaintWidth::Bitwise => format!("0x{:08x}", self.flags),
            TaintWidth::Bytewise => {
                let mut s = String::from("0x");
                for pos in (0..4).rev() {
                    s.push_str(if self.flags & (1 << pos) != 0 { "FF" } else { "00" });
                }
                s
            }
        }
    }
}

/// One echoed query, kept only when echoing is requested.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedQuery {
    /// The `// Query for ...` line, trimmed.
    pub query: String,
    /// The raw solve-result code.
    pub result: String,
    /// Accumulated model text, if a model was printed and requested.
    pub model: Option<String>,
}

/// The finalized taint state of one instruction: everything accumulated
/// between one header line and the closing run delimiter. Immutable once
/// emitted by the scanner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstructionTaintRecord {
    /// Instruction index from the group header. Non-decreasing within one
    /// conforming stream.
    pub index: u64,
    /// Disassembly text printed under the header, when present.
    pub disassembly: Option<String>,
    /// Register or memory key to finalized taint, keyed deterministically.
    pub taints: BTreeMap<String, TaintValue>,
    /// Echoed queries, empty unless echoing was enabled.
    pub queries: Vec<RecordedQuery>,
}

/// Parse a canonical `0x`-prefixed 32-bit hex string.
pub fn parse_hex32(s: &str) -> Option<u32> {
    let digits = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X"))?;
    u32::from_str_radix(digits, 16).ok()
}

/// Whether a canonical taint string is the all-clean sentinel.
pub fn is_clean_hex(s: &str) -> bool {
    parse_hex32(s) == Some(0)
}

/// Number of differing bits between two canonical taint strings, or `None`
/// if either fails to parse as 32-bit hex.
pub fn xor_popcount(a: &str, b: &str) -> Option<u32> {
    Some((parse_hex32(a)? ^ parse_hex32(b)?).count_ones())
}
