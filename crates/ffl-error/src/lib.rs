#![forbid(unsafe_code)]
//! Error types for the flash slot-chain filer.
//!
//! Two-layer model: `ParseError` in `ffl-types` covers on-media format
//! violations detected during byte parsing; `FlashError` (this crate)
//! is the user-facing type returned by the region primitives, the
//! allocator, and the catalog. This crate is intentionally independent
//! of `ffl-types` to avoid cyclic dependencies — the
//! `ParseError → FlashError` conversion lives in `ffl-core`, which
//! depends on both.
//!
//! Recovery policy per variant:
//!
//! - `NotFound` — normal negative result (lookup miss, or the
//!   allocator cannot satisfy a size request). Recoverable.
//! - `Corruption` — a chain walk left the region bounds, landed off
//!   page alignment, or exceeded the cycle bound. Aborts the
//!   operation; the chain is never auto-repaired.
//! - `ProgramIllegal` — the requested byte transition would need to
//!   set bits, which flash cannot do without an erase. The primitive
//!   refuses the write instead of programming a wrong value.
//! - `VerifyFailed` — post-program read-back mismatch. Fatal for that
//!   attempt; never retried automatically, because retrying over
//!   partially-programmed flash cannot flip committed bits back.
//! - `BoundsExceeded` — rejected before any hardware operation.

use thiserror::Error;

/// Unified error type for all filer operations.
#[derive(Debug, Error)]
pub enum FlashError {
    /// Host I/O error from a file-backed region (wraps `std::io::Error`).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Name or index lookup miss, or no free run satisfies a request.
    #[error("not found: {0}")]
    NotFound(String),

    /// The slot chain is structurally invalid at a known offset.
    #[error("corrupt chain at offset {offset:#x}: {detail}")]
    Corruption { offset: u32, detail: String },

    /// A program request would require setting bits (1-bits not present
    /// in the current byte). An erase must happen first.
    #[error("program not bit-clear-reachable at offset {offset:#x}")]
    ProgramIllegal { offset: u32 },

    /// Post-program read-back did not match the requested bytes.
    #[error("program verification failed at offset {offset:#x}")]
    VerifyFailed { offset: u32 },

    /// A requested range falls outside the region.
    #[error("range out of bounds: offset={offset:#x} len={len} region_len={region_len}")]
    BoundsExceeded {
        offset: u32,
        len: u32,
        region_len: u32,
    },

    /// Header deserialization failure surfaced with context.
    #[error("parse error: {0}")]
    Parse(String),

    /// Structurally invalid request or region geometry (bad commit
    /// kind, over-long name, region length off erase-block alignment).
    #[error("invalid format: {0}")]
    Format(String),
}

impl FlashError {
    /// True for the recoverable negative result; everything else aborts
    /// the operation that produced it.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// Result alias using `FlashError`.
pub type Result<T> = std::result::Result<T, FlashError>;
