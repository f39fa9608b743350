//! Error taxonomy for the translator and JIT cache.
//!
//! Guest-visible faults are delivered through `ExceptionSink`, not through
//! `Result` — a guest fault is not a host error. `DbtError` exists for the
//! two kinds that are: an impossible encoding reaching the translator (a
//! translator bug) and a host resource failure allocating executable
//! memory. Reservation loss is not represented here at all; it is a
//! `bool` returned straight to the guest's `stwcx` via CR.EQ.

use thiserror::Error;

/// Errors the translator or JIT cache can surface to their caller.
///
/// Both variants are fatal: the propagation policy is that guest faults
/// recover locally (the emitted body exits, the dispatcher re-enters at
/// the new PC) while these do not.
#[derive(Debug, Error)]
pub enum DbtError {
    /// The translator was handed a bit pattern that decodes to nothing
    /// valid for its ISA — not merely unemitted (that goes through the
    /// interpreter fallback), but invalid. Corresponds to `throwInstr`.
    #[error("invalid encoding {raw:#010x} at pc {pc:#010x}")]
    InvalidEncoding { raw: u32, pc: u32 },

    /// Allocating or protecting an executable JIT page failed.
    #[error("failed to allocate executable JIT page: {0}")]
    HostAlloc(#[from] std::io::Error),
}
