//! Per-(core, ISA) JIT cache (§3 "JIT cache", §4.6).
//!
//! Grounded directly on `original_source/src/cpu/jit.h`'s `table[0x100000]`
//! / `sizes[0x100000]` pair: a null slot means "not yet compiled," indexed
//! by `guest_phys >> 12`. Here the two parallel arrays collapse into one
//! `Vec<Option<ExecutableBlock>>` — `ExecutableBlock` already carries its
//! own length, so there is nothing left for a second array to hold.

use dbt_x86_emit::ExecutableBlock;

/// A direct-indexed table of compiled frames, one per guest physical
/// page. Capacity is a runtime choice (`JitConfig::jit_cache_capacity_log2`)
/// rather than the original's fixed `2^20`, so tests can afford a cache
/// sized for a handful of pages instead of the whole address space.
pub struct JitCache {
    slots: Vec<Option<ExecutableBlock>>,
    mask: usize,
}

impl JitCache {
    #[must_use]
    pub fn new(capacity_log2: u8) -> Self {
        let capacity = 1usize << capacity_log2;
        let slots = (0..capacity).map(|_| None).collect();
        JitCache { slots, mask: capacity - 1 }
    }

    fn index(&self, guest_phys: u32) -> usize {
        ((guest_phys >> 12) as usize) & self.mask
    }

    /// Looks up the compiled frame covering `guest_phys`, if any.
    #[must_use]
    pub fn lookup(&self, guest_phys: u32) -> Option<&ExecutableBlock> {
        self.slots[self.index(guest_phys)].as_ref()
    }

    /// Installs a freshly compiled frame, replacing whatever (if
    /// anything) previously occupied its slot.
    pub fn install(&mut self, guest_phys: u32, block: ExecutableBlock) {
        let index = self.index(guest_phys);
        self.slots[index] = Some(block);
    }

    /// `invalidateBlock(addr)`: releases the one frame covering
    /// `guest_phys`, nulling its slot.
    pub fn invalidate_block(&mut self, guest_phys: u32) {
        let index = self.index(guest_phys);
        self.slots[index] = None;
    }

    /// `invalidate()`: releases every compiled frame for this (core, ISA).
    pub fn invalidate(&mut self) {
        for slot in &mut self.slots {
            *slot = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn fresh_cache_has_no_compiled_frames() {
        let cache = JitCache::new(4);
        assert!(cache.lookup(0x8000_0000).is_none());
    }

    #[test]
    fn install_then_lookup_finds_the_same_frame() {
        let mut cache = JitCache::new(4);
        let block = ExecutableBlock::new_rwx(&[0xC3]).expect("mmap should succeed in tests");
        let ptr = block.as_ptr();
        cache.install(0x1000, block);
        assert_eq!(cache.lookup(0x1000).map(ExecutableBlock::as_ptr), Some(ptr));
    }

    #[test]
    fn invalidate_block_clears_only_its_own_slot() {
        let mut cache = JitCache::new(4);
        cache.install(0x1000, ExecutableBlock::new_rwx(&[0xC3]).expect("mmap should succeed"));
        cache.install(0x2000, ExecutableBlock::new_rwx(&[0xC3]).expect("mmap should succeed"));
        cache.invalidate_block(0x1000);
        assert!(cache.lookup(0x1000).is_none());
        assert!(cache.lookup(0x2000).is_some());
    }

    #[test]
    fn invalidate_clears_every_slot() {
        let mut cache = JitCache::new(4);
        cache.install(0x1000, ExecutableBlock::new_rwx(&[0xC3]).expect("mmap should succeed"));
        cache.invalidate();
        assert!(cache.lookup(0x1000).is_none());
    }

    #[test]
    fn small_capacity_aliases_distant_pages() {
        // Capacity 1 means every page index collapses onto slot 0 — not a
        // correctness concern (a compile-on-miss at the aliased address
        // just recompiles), only relevant for tests that pick a tiny
        // capacity deliberately.
        let mut cache = JitCache::new(0);
        cache.install(0x0000, ExecutableBlock::new_rwx(&[0xC3]).expect("mmap should succeed"));
        assert!(cache.lookup(0x1000).is_some());
    }

    proptest! {
        /// `index()` never escapes the backing `Vec`, for any capacity this
        /// crate can be configured with and any guest physical address a
        /// fetch can produce.
        #[test]
        fn index_always_stays_in_bounds(capacity_log2 in 0u8..=20, guest_phys in any::<u32>()) {
            let cache = JitCache::new(capacity_log2);
            prop_assert!(cache.index(guest_phys) < cache.slots.len());
        }
    }
}
