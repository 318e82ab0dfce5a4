//! Errors surfaced by the codec and the query-log scanner.
//!
//! Unresolved register keys and simulation entries that never find a
//! reference counterpart are deliberately _not_ errors; they are reported as
//! diagnostics and counted in [`AlignStats`](crate::align::AlignStats).

use crate::taint::TaintWidth;

/// Errors returned by this crate.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// A solve-result code that begins with neither `I` (invariant) nor `V`
    /// (variant). The scanner abandons the current instruction group and
    /// resynchronizes, so the caller may choose to skip or to halt.
    #[error("malformed solve result {code:?} at line {line}")]
    MalformedResult { line: u64, code: String },

    /// A query named a position outside the tracked width. Never clamped.
    #[error("taint position {pos} out of range for {width:?} tracking")]
    PositionOutOfRange { pos: u32, width: TaintWidth },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
