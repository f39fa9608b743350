//! ARM A32 and Thumb guest state, interpreter fallback, and x86-64 JIT
//! translators (§4.2, §4.3).
//!
//! Module layout mirrors the original's own method grouping
//! (`ARMCodeGenerator`'s private methods) rather than inventing a new
//! split: `shifter` (operand 2), `flags` (NZCV folding), `dataproc` (the
//! 16 ALU opcodes), `loadstore` (single and multiple), `branch`,
//! `status` (MRS/MSR), `cond` (condition-code prologue). `a32`/`thumb`
//! are the two top-level decoders that dispatch into the rest.

pub mod a32;
mod branch;
pub mod cond;
mod dataproc;
mod flags;
pub mod helpers;
pub mod interp;
mod loadstore;
mod shifter;
pub mod state;
mod status;
pub mod thumb;

pub use helpers::ArmContext;
pub use state::{ArmCore, Bank, Cp15, Mode};
