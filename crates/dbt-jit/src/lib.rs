//! Per-core JIT cache, page-granular invalidation, and the fetch/
//! translate/execute dispatch loop (§3, §4.6).
//!
//! This is where `dbt-arm` and `dbt-ppc`'s translators, `dbt-mmu`'s page
//! walkers, and `dbt-x86-emit`'s executable pages all come together: a
//! `GuestProcessor` (`ArmMachine`/`PpcMachine`) owns one core's guest
//! state plus the JIT caches that remember what's already been compiled
//! for it, and `step()` is the one entry point an outer scheduler calls
//! in a loop.

mod cache;
pub mod config;

pub mod arm;
pub mod ppc;

pub use arm::ArmMachine;
pub use cache::JitCache;
pub use config::JitConfig;
pub use ppc::PpcMachine;
