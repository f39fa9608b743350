//! ARM-A32/Thumb `GuestProcessor` (§4.6 "`execute(pc)`"): binds
//! `dbt-arm`'s two translators to a pair of `JitCache`s and drives the
//! fetch/translate/compile/dispatch loop `step()` exposes to the outer
//! scheduler (§6 "Fetch/execute cycle").

use dbt_arm::a32::HelperTable;
use dbt_arm::{helpers, a32, thumb, ArmContext, ArmCore, Mode};
use dbt_core::{CoreId, DbtError, ExceptionKind, ExceptionSink, MemoryBackend};
use dbt_mmu::{AccessType, MmuFault};
use dbt_x86_emit::{Emitter, ExecutableBlock, Register};

use crate::cache::JitCache;
use crate::config::JitConfig;

/// Owns one ARM core's guest state plus its two per-ISA JIT caches
/// (A32 and Thumb share `ArmCore` but never share a compiled frame,
/// since the same physical page can only ever be decoded one way at a
/// time by the real CPU).
///
/// `#[repr(C)]` with `context` as the first field: the `P` pointer
/// emitted code is handed (`context.as_p()`, which is itself the address
/// of `context.core`) is therefore numerically identical to the address
/// of the whole `ArmMachine`, the same identity trick `dbt-arm::helpers`
/// uses one level down. This lets `invalidate_icache` below recover the
/// caches from the same `P` ordinary bodies only ever use for `ArmCore`
/// field access.
#[repr(C)]
pub struct ArmMachine<'a> {
    context: ArmContext<'a>,
    config: JitConfig,
    a32_cache: JitCache,
    thumb_cache: JitCache,
    helpers: HelperTable,
}

impl<'a> ArmMachine<'a> {
    #[must_use]
    pub fn new(
        memory: &'a mut dyn MemoryBackend,
        exceptions: &'a mut dyn ExceptionSink,
        config: JitConfig,
    ) -> Self {
        let helpers = HelperTable {
            load_u8: helpers::load_memory_u8 as usize as u64,
            load_u16: helpers::load_memory_u16 as usize as u64,
            load_u32: helpers::load_memory_u32 as usize as u64,
            store_u8: helpers::store_memory_u8 as usize as u64,
            store_u16: helpers::store_memory_u16 as usize as u64,
            store_u32: helpers::store_memory_u32 as usize as u64,
            store_long: helpers::store_long as usize as u64,
            execute_instr: helpers::execute_instr as usize as u64,
            throw_instr: helpers::throw_instr as usize as u64,
            undefined_exception: helpers::undefined_exception as usize as u64,
            software_interrupt: helpers::software_interrupt as usize as u64,
            change_mode: helpers::change_mode as usize as u64,
            write_mode_regs: helpers::write_mode_regs as usize as u64,
            read_mode_regs: helpers::read_mode_regs as usize as u64,
            invalidate_icache: invalidate_icache as usize as u64,
        };
        ArmMachine {
            context: ArmContext::new(memory, exceptions),
            a32_cache: JitCache::new(config.jit_cache_capacity_log2),
            thumb_cache: JitCache::new(config.jit_cache_capacity_log2),
            helpers,
            config,
        }
    }

    #[must_use]
    pub fn core(&self) -> &ArmCore {
        &self.context.core
    }

    #[must_use]
    pub fn core_mut(&mut self) -> &mut ArmCore {
        &mut self.context.core
    }

    /// `invalidate()`: releases every compiled A32 and Thumb frame.
    pub fn invalidate(&mut self) {
        self.a32_cache.invalidate();
        self.thumb_cache.invalidate();
    }

    /// `invalidateBlock(addr)`: releases the one frame covering
    /// `guest_phys`, in both ISAs — the physical page could in principle
    /// have been compiled under either decoding.
    pub fn invalidate_block(&mut self, guest_phys: u32) {
        self.a32_cache.invalidate_block(guest_phys);
        self.thumb_cache.invalidate_block(guest_phys);
    }

    /// `step(core)` (§6): fetch, translate, compile-on-miss, and execute
    /// exactly one guest instruction at the current PC.
    ///
    /// # Errors
    /// Returns `Err` only for the two fatal kinds (§7.3, §7.4): an
    /// impossible encoding reaching the JIT, or a host mmap failure.
    /// Guest-visible faults are delivered through the exception sink and
    /// this returns `Ok(())` — the caller re-enters at the vectored PC.
    pub fn step(&mut self) -> Result<(), DbtError> {
        let pc = self.context.core.regs[ArmCore::PC];
        let thumb = self.context.core.flag(ArmCore::T_BIT);
        let supervisor = self.context.core.mode() != Mode::User;

        let phys = match self.context.mmu.translate(
            &mut *self.context.memory,
            pc,
            AccessType::Instruction,
            supervisor,
        ) {
            Ok(phys) => phys,
            Err(fault) => {
                self.deliver_fetch_fault(fault);
                return Ok(());
            }
        };

        let instr_size: u32 = if thumb { 2 } else { 4 };
        let page_base = phys & !0xFFF;
        let slot = ((phys & 0xFFF) / instr_size) as usize;

        let (block_ptr, cell_bytes) = if thumb {
            (self.ensure_compiled_thumb(page_base)?, thumb::TRAMPOLINE_CELL_BYTES)
        } else {
            (self.ensure_compiled_a32(page_base)?, a32::TRAMPOLINE_CELL_BYTES)
        };

        // §4.6 step 4: pre-advance PC before entering the body; a branch
        // body overwrites this with its own computed target, everything
        // else relies on it already being set for fall-through.
        self.context.core.regs[ArmCore::PC] = pc.wrapping_add(instr_size);

        // SAFETY: `block_ptr` points at a just-looked-up or just-compiled
        // trampoline table with at least `slot + 1` cells, each a 5-byte
        // `JMP rel32` into a body compiled by `a32`/`thumb::compile_page`
        // for this exact `HelperTable`; `context.as_p()` is the `P`
        // pointer those bodies expect.
        unsafe {
            let entry = block_ptr.add(slot * cell_bytes);
            let entry: unsafe extern "C" fn(*mut ArmCore) = std::mem::transmute(entry);
            entry(self.context.as_p());
        }
        Ok(())
    }

    fn ensure_compiled_a32(&mut self, page_base: u32) -> Result<*const u8, DbtError> {
        if let Some(block) = self.a32_cache.lookup(page_base) {
            return Ok(block.as_ptr());
        }
        let mut words = [0u32; a32::SLOTS_PER_PAGE];
        for (i, word) in words.iter_mut().enumerate() {
            *word = self.context.memory.read_u32(page_base.wrapping_add((i as u32) * 4));
        }
        let mut emitter = Emitter::new();
        let size = a32::compile_page(&mut emitter, Register::Rdi, page_base, &words, &self.helpers);
        debug_assert!((size as u32) <= self.config.max_block_bytes);
        log::debug!("compiled ARM-A32 frame at {page_base:#010x} ({size} bytes)");
        let block = self.new_block(emitter.bytes())?;
        let ptr = block.as_ptr();
        self.a32_cache.install(page_base, block);
        Ok(ptr)
    }

    fn ensure_compiled_thumb(&mut self, page_base: u32) -> Result<*const u8, DbtError> {
        if let Some(block) = self.thumb_cache.lookup(page_base) {
            return Ok(block.as_ptr());
        }
        let mut halfwords = [0u16; thumb::SLOTS_PER_PAGE];
        for (i, halfword) in halfwords.iter_mut().enumerate() {
            *halfword = self.context.memory.read_u16(page_base.wrapping_add((i as u32) * 2));
        }
        let mut emitter = Emitter::new();
        let size = thumb::compile_page(&mut emitter, Register::Rdi, page_base, &halfwords, &self.helpers);
        debug_assert!((size as u32) <= self.config.max_block_bytes);
        log::debug!("compiled ARM-Thumb frame at {page_base:#010x} ({size} bytes)");
        let block = self.new_block(emitter.bytes())?;
        let ptr = block.as_ptr();
        self.thumb_cache.install(page_base, block);
        Ok(ptr)
    }

    fn new_block(&self, code: &[u8]) -> Result<ExecutableBlock, DbtError> {
        if self.config.executable_pages_use_dual_mapping {
            ExecutableBlock::new_dual_mapped(code).map_err(DbtError::HostAlloc)
        } else {
            ExecutableBlock::new_rwx(code).map_err(DbtError::HostAlloc)
        }
    }

    fn deliver_fetch_fault(&mut self, fault: MmuFault) {
        let kind = match fault {
            MmuFault::Arm { .. } => ExceptionKind::PrefetchAbort,
            MmuFault::Ppc { .. } => unreachable!("ARM MMU never produces a PPC fault"),
        };
        self.context.exceptions.trigger_exception(CoreId::Arm, kind);
    }

    /// # Safety
    /// `p` must have been produced by `context.as_p()` on a still-live
    /// `ArmMachine`.
    unsafe fn from_p<'b>(p: *mut ArmCore) -> &'b mut ArmMachine<'a> {
        &mut *p.cast::<ArmMachine<'a>>()
    }
}

/// `invalidateICache` — MCR p15, 0, Rd, c7, c5, 0 (§4.6 "Invalidation").
/// The coprocessor write is recognized by `dbt_arm::a32`'s decoder; this
/// is the concrete implementation wired into the `HelperTable` at
/// construction, the one place in this crate that owns both JIT caches.
///
/// # Safety
/// `p` must be the live `P` pointer of an `ArmMachine` built by `new`.
unsafe extern "C" fn invalidate_icache(p: *mut ArmCore) {
    let machine = ArmMachine::from_p(p);
    log::debug!("ARM MCR cache-invalidate-all: clearing both JIT caches");
    machine.invalidate();
}

#[cfg(test)]
mod tests {
    use super::*;
    use dbt_core::FlatMemory;

    struct NullSink;
    impl ExceptionSink for NullSink {
        fn trigger_exception(&mut self, _core: CoreId, _kind: ExceptionKind) {}
    }

    #[test]
    fn context_is_the_first_field_so_p_aliases_the_whole_machine() {
        assert_eq!(memoffset::offset_of!(ArmMachine<'static>, context), 0);
    }

    #[test]
    fn mov_immediate_runs_and_advances_pc() {
        let mut mem = FlatMemory::new(0x1000);
        mem.write_u32(0, 0xE3A0_0005); // MOV R0, #5
        let mut sink = NullSink;
        let mut machine = ArmMachine::new(&mut mem, &mut sink, JitConfig::default());
        machine.step().expect("step should succeed");
        assert_eq!(machine.core().regs[0], 5);
        assert_eq!(machine.core().regs[ArmCore::PC], 4);
    }

    #[test]
    fn second_dispatch_to_the_same_page_hits_the_cache() {
        let mut mem = FlatMemory::new(0x1000);
        mem.write_u32(0, 0xE3A0_0005); // MOV R0, #5
        mem.write_u32(4, 0xE3A0_1007); // MOV R1, #7
        let mut sink = NullSink;
        let mut machine = ArmMachine::new(&mut mem, &mut sink, JitConfig::default());
        machine.step().expect("first step should succeed");
        machine.step().expect("second step should succeed");
        assert_eq!(machine.core().regs[0], 5);
        assert_eq!(machine.core().regs[1], 7);
        assert_eq!(machine.core().regs[ArmCore::PC], 8);
    }

    #[test]
    fn invalidate_block_forces_a_recompile() {
        let mut mem = FlatMemory::new(0x1000);
        mem.write_u32(0, 0xE3A0_0005); // MOV R0, #5
        let mut sink = NullSink;
        let mut machine = ArmMachine::new(&mut mem, &mut sink, JitConfig::default());
        machine.step().expect("step should succeed");
        assert!(machine.a32_cache.lookup(0).is_some());
        machine.invalidate_block(0);
        assert!(machine.a32_cache.lookup(0).is_none());
    }
}
