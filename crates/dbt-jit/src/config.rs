//! Policy knobs the spec leaves as implementation choices (§9
//! "Executable-memory portability", §3 "2^20 ... pairs").
//!
//! Not a config-file format — the teacher has no config crate and
//! nothing in the external interface calls for one. Just a plain struct
//! a `GuestProcessor` embedding this crate constructs once and threads
//! through `ArmMachine::new`/`PpcMachine::new`.

/// Construction-time policy for a JIT cache plus its executable-memory
/// strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JitConfig {
    /// When `true`, compiled frames are mapped W^X (`ExecutableBlock::
    /// new_dual_mapped`) instead of a single RWX mapping — for hosts
    /// that refuse to hand out RWX pages (§9).
    pub executable_pages_use_dual_mapping: bool,
    /// `log2` of the per-(core, ISA) JIT cache's slot count, indexed by
    /// `guest_phys >> 12` (§3 "2^20 ... pairs"). Default 20 covers the
    /// entire 32-bit physical address space losslessly; tests shrink it
    /// to keep the backing `Vec` small.
    pub jit_cache_capacity_log2: u8,
    /// Upper bound on one compiled frame's byte size, guarding the §9
    /// invariant `body_start - trampoline_slot_end <= 2^31`. The default
    /// is generous relative to a 32 KiB worst-case frame (§4.6's "the
    /// smallest fixed cell that can reach anywhere inside a 32 KiB
    /// buffer") without approaching the real 2 GiB limit.
    pub max_block_bytes: u32,
}

impl Default for JitConfig {
    fn default() -> Self {
        JitConfig {
            executable_pages_use_dual_mapping: false,
            jit_cache_capacity_log2: 20,
            max_block_bytes: 16 * 1024 * 1024,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_matches_spec_defaults() {
        let config = JitConfig::default();
        assert!(!config.executable_pages_use_dual_mapping);
        assert_eq!(config.jit_cache_capacity_log2, 20);
    }
}
