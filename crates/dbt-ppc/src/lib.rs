//! PowerPC guest state, reservation semantics, interpreter fallback, and
//! x86-64 JIT translator (§4.4).
//!
//! Module layout mirrors `dbt-arm`'s split: `state` (the flat `PpcCore`
//! record), `reservation` (the cross-core `lwarx`/`stwcx.` lock, §5),
//! `cond`/`branch` (the `bc` BO-bit/CTR gating ring and the branch forms
//! built on top of it), `fastops` (the small set of opcodes §4.4 requires
//! to be fast-emitted rather than routed to the interpreter), `ppc` (the
//! top-level decode tree and trampoline-table compiler), `helpers` (the
//! `loadMemory`/`storeMemory`/`executeInstr`/... runtime entry points),
//! `interp` (the full fallback interpreter, also the determinism oracle
//! of §8).

mod branch;
mod fastops;
pub mod helpers;
pub mod interp;
pub mod ppc;
pub mod reservation;
pub mod state;

pub mod cond;

pub use helpers::PpcContext;
pub use reservation::Reservation;
pub use state::{convert_spr, Fpr, PpcCore};
