//! PowerPC `GuestProcessor` (§4.6 "`execute(pc)`"): binds `dbt-ppc`'s
//! single translator to one `JitCache` and drives the fetch/translate/
//! compile/dispatch loop `step()` exposes to the outer scheduler.
//!
//! One `PpcMachine` per core — all three PPC cores share a `Reservation`
//! (§5) but never a JIT cache, since each compiles its own frames
//! against its own `P` pointer.

use std::sync::Arc;

use dbt_core::{CoreId, DbtError, ExceptionKind, ExceptionSink, MemoryBackend};
use dbt_mmu::AccessType;
use dbt_ppc::ppc::HelperTable;
use dbt_ppc::{helpers, ppc, PpcContext, PpcCore, Reservation};
use dbt_x86_emit::{Emitter, ExecutableBlock, Register};

use crate::cache::JitCache;
use crate::config::JitConfig;

/// Owns one PowerPC core's guest state plus its JIT cache.
///
/// `context` is this struct's first field, the same identity trick
/// `ArmMachine` uses — but, like `PpcContext` itself, this struct is not
/// `#[repr(C)]`: none of `PpcMachine`'s other fields are ever addressed
/// by offset from emitted code, only `context.core`'s are, so the plain
/// declaration-order layout `PpcContext` already relies on is enough.
pub struct PpcMachine<'a> {
    context: PpcContext<'a>,
    config: JitConfig,
    cache: JitCache,
    helpers: HelperTable,
    core_number: u8,
}

impl<'a> PpcMachine<'a> {
    #[must_use]
    pub fn new(
        memory: &'a mut dyn MemoryBackend,
        exceptions: &'a mut dyn ExceptionSink,
        reservation: Arc<Reservation>,
        core_number: u8,
        config: JitConfig,
    ) -> Self {
        let helper_table = HelperTable {
            load_u8: helpers::load_memory_u8 as usize as u64,
            load_u16: helpers::load_memory_u16 as usize as u64,
            load_u32: helpers::load_memory_u32 as usize as u64,
            store_u8: helpers::store_memory_u8 as usize as u64,
            store_u16: helpers::store_memory_u16 as usize as u64,
            store_u32: helpers::store_memory_u32 as usize as u64,
            store_long: helpers::store_long as usize as u64,
            load_fpr: helpers::load_fpr as usize as u64,
            store_fpr: helpers::store_fpr as usize as u64,
            execute_instr: helpers::execute_instr as usize as u64,
            throw_instr: helpers::throw_instr as usize as u64,
            undefined_exception: helpers::undefined_exception as usize as u64,
            software_interrupt: helpers::software_interrupt as usize as u64,
            invalidate_icache: invalidate_icache as usize as u64,
        };
        PpcMachine {
            context: PpcContext::new(memory, exceptions, reservation, core_number),
            cache: JitCache::new(config.jit_cache_capacity_log2),
            helpers: helper_table,
            core_number,
            config,
        }
    }

    #[must_use]
    pub fn core(&self) -> &PpcCore {
        &self.context.core
    }

    #[must_use]
    pub fn core_mut(&mut self) -> &mut PpcCore {
        &mut self.context.core
    }

    /// `invalidate()`: releases every compiled frame for this core.
    pub fn invalidate(&mut self) {
        self.cache.invalidate();
    }

    /// `invalidateBlock(addr)`: releases the one frame covering
    /// `guest_phys`.
    pub fn invalidate_block(&mut self, guest_phys: u32) {
        self.cache.invalidate_block(guest_phys);
    }

    fn core_id(&self) -> CoreId {
        CoreId::Ppc(self.core_number)
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
        let pc = self.context.core.pc;
        let supervisor = self.context.core.supervisor();
        let translation_enabled = self.context.core.msr & PpcCore::MSR_IR != 0;

        let phys = match self.context.mmu.translate(
            &mut *self.context.memory,
            pc,
            AccessType::Instruction,
            supervisor,
            translation_enabled,
        ) {
            Ok(phys) => phys,
            Err(fault) => {
                self.deliver_fetch_fault(fault);
                return Ok(());
            }
        };

        let page_base = phys & !0xFFF;
        let slot = ((phys & 0xFFF) / 4) as usize;
        let block_ptr = self.ensure_compiled(page_base)?;

        // §4.6 step 4: pre-advance PC before entering the body; a branch
        // body overwrites this with its own computed target.
        self.context.core.pc = pc.wrapping_add(4);

        // SAFETY: `block_ptr` points at a just-looked-up or just-compiled
        // trampoline table with at least `slot + 1` cells, each a 5-byte
        // `JMP rel32` into a body compiled by `ppc::compile_page` for this
        // exact `HelperTable`; `context.as_p()` is the `P` pointer those
        // bodies expect.
        unsafe {
            let entry = block_ptr.add(slot * ppc::TRAMPOLINE_CELL_BYTES);
            let entry: unsafe extern "C" fn(*mut PpcCore) = std::mem::transmute(entry);
            entry(self.context.as_p());
        }
        Ok(())
    }

    fn ensure_compiled(&mut self, page_base: u32) -> Result<*const u8, DbtError> {
        if let Some(block) = self.cache.lookup(page_base) {
            return Ok(block.as_ptr());
        }
        let mut words = [0u32; ppc::SLOTS_PER_PAGE];
        for (i, word) in words.iter_mut().enumerate() {
            *word = self.context.memory.read_u32(page_base.wrapping_add((i as u32) * 4));
        }
        let mut emitter = Emitter::new();
        let size = ppc::compile_page(&mut emitter, Register::Rdi, page_base, &words, &self.helpers);
        debug_assert!((size as u32) <= self.config.max_block_bytes);
        log::debug!("compiled PowerPC frame at {page_base:#010x} ({size} bytes)");
        let block = self.new_block(emitter.bytes())?;
        let ptr = block.as_ptr();
        self.cache.install(page_base, block);
        Ok(ptr)
    }

    fn new_block(&self, code: &[u8]) -> Result<ExecutableBlock, DbtError> {
        if self.config.executable_pages_use_dual_mapping {
            ExecutableBlock::new_dual_mapped(code).map_err(DbtError::HostAlloc)
        } else {
            ExecutableBlock::new_rwx(code).map_err(DbtError::HostAlloc)
        }
    }

    fn deliver_fetch_fault(&mut self, fault: dbt_mmu::MmuFault) {
        let kind = match fault {
            dbt_mmu::MmuFault::Ppc { .. } => ExceptionKind::Isi,
            dbt_mmu::MmuFault::Arm { .. } => unreachable!("PPC MMU never produces an ARM fault"),
        };
        let core_id = self.core_id();
        self.context.core.trigger_exception(self.context.exceptions, core_id, kind);
    }

    /// # Safety
    /// `p` must have been produced by `context.as_p()` on a still-live
    /// `PpcMachine`.
    unsafe fn from_p<'b>(p: *mut PpcCore) -> &'b mut PpcMachine<'a> {
        &mut *p.cast::<PpcMachine<'a>>()
    }
}

/// `invalidateICache(ea)` — `icbi`'s JIT-visible effect (§4.6
/// "Invalidation"). `emit_icbi` in `dbt_ppc::ppc` computes the effective
/// address and passes it here in RSI; this translates it the same way
/// any other data access would and drops the one frame it covers.
///
/// A translation miss on the probe address has no guest-visible effect —
/// real hardware's `icbi` is documented to be a no-op if the address
/// isn't actually mapped, so this silently skips the invalidation rather
/// than raising a fault the instruction itself never would.
///
/// # Safety
/// `p` must be the live `P` pointer of a `PpcMachine` built by `new`.
unsafe extern "C" fn invalidate_icache(p: *mut PpcCore, ea: u32) {
    let machine = PpcMachine::from_p(p);
    let supervisor = machine.context.core.supervisor();
    let translation_enabled = machine.context.core.msr & PpcCore::MSR_DR != 0;
    let outcome = machine.context.mmu.translate(
        &mut *machine.context.memory,
        ea,
        AccessType::DataRead,
        supervisor,
        translation_enabled,
    );
    if let Ok(phys) = outcome {
        log::debug!("icbi: invalidating frame at {phys:#010x}");
        machine.cache.invalidate_block(phys);
    }
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
        assert_eq!(memoffset::offset_of!(PpcMachine<'static>, context), 0);
    }

    #[test]
    fn addi_runs_and_advances_pc() {
        let mut mem = FlatMemory::new(0x1000);
        let addi = (14u32 << 26) | (3 << 21) | (0 << 16) | 5; // addi r3, r0, 5
        mem.write_u32(0, addi);
        let mut sink = NullSink;
        let mut machine =
            PpcMachine::new(&mut mem, &mut sink, Arc::new(Reservation::new()), 0, JitConfig::default());
        machine.step().expect("step should succeed");
        assert_eq!(machine.core().regs[3], 5);
        assert_eq!(machine.core().pc, 4);
    }

    #[test]
    fn second_dispatch_to_the_same_page_hits_the_cache() {
        let mut mem = FlatMemory::new(0x1000);
        let addi_r3 = (14u32 << 26) | (3 << 21) | (0 << 16) | 5; // addi r3, r0, 5
        let addi_r4 = (14u32 << 26) | (4 << 21) | (0 << 16) | 7; // addi r4, r0, 7
        mem.write_u32(0, addi_r3);
        mem.write_u32(4, addi_r4);
        let mut sink = NullSink;
        let mut machine =
            PpcMachine::new(&mut mem, &mut sink, Arc::new(Reservation::new()), 0, JitConfig::default());
        machine.step().expect("first step should succeed");
        machine.step().expect("second step should succeed");
        assert_eq!(machine.core().regs[3], 5);
        assert_eq!(machine.core().regs[4], 7);
        assert_eq!(machine.core().pc, 8);
    }

    #[test]
    fn invalidate_block_forces_a_recompile() {
        let mut mem = FlatMemory::new(0x1000);
        let addi = (14u32 << 26) | (3 << 21) | (0 << 16) | 5;
        mem.write_u32(0, addi);
        let mut sink = NullSink;
        let mut machine =
            PpcMachine::new(&mut mem, &mut sink, Arc::new(Reservation::new()), 0, JitConfig::default());
        machine.step().expect("step should succeed");
        assert!(machine.cache.lookup(0).is_some());
        machine.invalidate_block(0);
        assert!(machine.cache.lookup(0).is_none());
    }
}
