//! Runtime helpers callable from emitted code (§6), plus the context
//! they operate on.
//!
//! Emitted bodies only ever address `P + offset` into the fields of
//! `ArmCore` (see `state::ArmCore::reg_offset` and friends) — they know
//! nothing about memory, MMU, or exception delivery. `ArmContext` wraps
//! `ArmCore` together with the rest of what a helper needs, with `core`
//! pinned as its first field so a `P` pointer handed to emitted code and
//! a pointer to the whole `ArmContext` are one and the same address.
//! Every helper recovers the rest of the context with a raw-pointer
//! cast back through that identity. This is the same trick the original
//! relies on implicitly (`P` is the enclosing `ARMProcessor*`, `core` one
//! of its members) — made explicit here since Rust has no base-class
//! pointer arithmetic to lean on.

use dbt_core::{DbtError, ExceptionKind, ExceptionSink, MemoryBackend};
use dbt_mmu::{ArmMmu, MmuFault};

use crate::state::{ArmCore, Mode};

/// Everything a helper function needs, addressed through the same `P`
/// pointer the emitted code uses for `core`'s fields.
#[repr(C)]
pub struct ArmContext<'a> {
    pub core: ArmCore,
    pub mmu: ArmMmu,
    pub memory: &'a mut dyn MemoryBackend,
    pub exceptions: &'a mut dyn ExceptionSink,
}

impl<'a> ArmContext<'a> {
    #[must_use]
    pub fn new(
        memory: &'a mut dyn MemoryBackend,
        exceptions: &'a mut dyn ExceptionSink,
    ) -> Self {
        ArmContext { core: ArmCore::new(), mmu: ArmMmu::new(), memory, exceptions }
    }

    /// The `P` pointer emitted code is handed: the address of `core`,
    /// which — because `core` is the first field of a `repr(C)` struct —
    /// is numerically identical to the address of `self`.
    pub fn as_p(&mut self) -> *mut ArmCore {
        std::ptr::addr_of_mut!(self.core)
    }

    /// # Safety
    /// `p` must have been produced by `as_p` on a still-live `ArmContext`
    /// with the same lifetime as claimed here.
    unsafe fn from_p<'b>(p: *mut ArmCore) -> &'b mut ArmContext<'a> {
        &mut *p.cast::<ArmContext<'a>>()
    }

    fn is_supervisor(&self) -> bool {
        self.core.mode() != Mode::User
    }

    fn deliver_fault(&mut self, fault: MmuFault) {
        let kind = match fault {
            MmuFault::Arm { prefetch: true, .. } => ExceptionKind::PrefetchAbort,
            MmuFault::Arm { prefetch: false, .. } => ExceptionKind::DataAbort,
            MmuFault::Ppc { .. } => unreachable!("ARM context never produces a PPC fault"),
        };
        self.exceptions.trigger_exception(dbt_core::CoreId::Arm, kind);
    }
}

/// `loadMemory<u8>`.
///
/// # Safety
/// `p` must be the live `P` pointer of an `ArmContext` built by `new`.
pub unsafe extern "C" fn load_memory_u8(p: *mut ArmCore, addr: u32, out: *mut u32) -> bool {
    load_memory(p, addr, out, dbt_mmu::AccessType::DataRead, |ctx, a| {
        u32::from(ctx.memory.read_u8(a))
    })
}

/// `loadMemory<u16>`.
///
/// # Safety
/// See `load_memory_u8`.
pub unsafe extern "C" fn load_memory_u16(p: *mut ArmCore, addr: u32, out: *mut u32) -> bool {
    load_memory(p, addr, out, dbt_mmu::AccessType::DataRead, |ctx, a| {
        u32::from(ctx.memory.read_u16(a))
    })
}

/// `loadMemory<u32>`.
///
/// # Safety
/// See `load_memory_u8`.
pub unsafe extern "C" fn load_memory_u32(p: *mut ArmCore, addr: u32, out: *mut u32) -> bool {
    load_memory(p, addr, out, dbt_mmu::AccessType::DataRead, |ctx, a| ctx.memory.read_u32(a))
}

unsafe fn load_memory(
    p: *mut ArmCore,
    addr: u32,
    out: *mut u32,
    access: dbt_mmu::AccessType,
    read: impl FnOnce(&mut ArmContext<'_>, u32) -> u32,
) -> bool {
    let ctx = ArmContext::from_p(p);
    let supervisor = ctx.is_supervisor();
    let outcome = ctx.mmu.translate(&mut *ctx.memory, addr, access, supervisor);
    match outcome {
        Ok(paddr) => {
            *out = read(ctx, paddr);
            true
        }
        Err(fault) => {
            ctx.deliver_fault(fault);
            false
        }
    }
}

/// `storeMemory<u8>`.
///
/// # Safety
/// See `load_memory_u8`.
pub unsafe extern "C" fn store_memory_u8(p: *mut ArmCore, addr: u32, value: u32) -> bool {
    store_memory(p, addr, |ctx, a| ctx.memory.write_u8(a, value as u8))
}

/// `storeMemory<u16>`.
///
/// # Safety
/// See `load_memory_u8`.
pub unsafe extern "C" fn store_memory_u16(p: *mut ArmCore, addr: u32, value: u32) -> bool {
    store_memory(p, addr, |ctx, a| ctx.memory.write_u16(a, value as u16))
}

/// `storeMemory<u32>`.
///
/// # Safety
/// See `load_memory_u8`.
pub unsafe extern "C" fn store_memory_u32(p: *mut ArmCore, addr: u32, value: u32) -> bool {
    store_memory(p, addr, |ctx, a| ctx.memory.write_u32(a, value))
}

/// `storeLong` — the 8-byte form used by FPR stores.
///
/// # Safety
/// See `load_memory_u8`.
pub unsafe extern "C" fn store_long(p: *mut ArmCore, addr: u32, value: u64) -> bool {
    store_memory(p, addr, |ctx, a| ctx.memory.write_u64(a, value))
}

unsafe fn store_memory(p: *mut ArmCore, addr: u32, write: impl FnOnce(&mut ArmContext<'_>, u32)) -> bool {
    let ctx = ArmContext::from_p(p);
    let supervisor = ctx.is_supervisor();
    let outcome = ctx.mmu.translate(&mut *ctx.memory, addr, dbt_mmu::AccessType::DataWrite, supervisor);
    match outcome {
        Ok(paddr) => {
            write(ctx, paddr);
            true
        }
        Err(fault) => {
            ctx.deliver_fault(fault);
            false
        }
    }
}

/// `executeInstr` — the interpreter fallback for decoded-but-unemitted
/// opcodes. §8 requires this path and the JIT path to agree bit-for-bit;
/// routing both through the same `crate::interp`/`crate::thumb` oracle is
/// how that invariant is kept, rather than re-deriving semantics here.
/// `CPSR.T`, live on `core` at the moment of the call, picks which of the
/// two 32-/16-bit decoders `raw` belongs to.
///
/// # Safety
/// See `load_memory_u8`.
pub unsafe extern "C" fn execute_instr(p: *mut ArmCore, raw: u32) {
    let ctx = ArmContext::from_p(p);
    if ctx.core.flag(ArmCore::T_BIT) {
        crate::thumb::step(&mut ctx.core, &mut ctx.mmu, &mut *ctx.memory, &mut *ctx.exceptions, raw as u16);
    } else {
        crate::interp::step(&mut ctx.core, &mut ctx.mmu, &mut *ctx.memory, &mut *ctx.exceptions, raw);
    }
}

/// `throwInstr` — an impossible encoding reached the JIT. A translator
/// bug, not a guest bug (§7 kind 3): logs and aborts rather than trying
/// to recover.
///
/// # Safety
/// See `load_memory_u8`.
pub unsafe extern "C" fn throw_instr(_p: *mut ArmCore, raw: u32) -> ! {
    let err = DbtError::InvalidEncoding { raw, pc: 0 };
    log::error!("unreachable ARM encoding reached the JIT: {err}");
    panic!("{err}");
}

/// `undefinedException`.
///
/// # Safety
/// See `load_memory_u8`.
pub unsafe extern "C" fn undefined_exception(p: *mut ArmCore) {
    let ctx = ArmContext::from_p(p);
    ctx.exceptions.trigger_exception(dbt_core::CoreId::Arm, ExceptionKind::UndefinedInstruction);
}

/// `softwareInterrupt`.
///
/// # Safety
/// See `load_memory_u8`.
pub unsafe extern "C" fn software_interrupt(p: *mut ArmCore) {
    let ctx = ArmContext::from_p(p);
    ctx.exceptions.trigger_exception(dbt_core::CoreId::Arm, ExceptionKind::SoftwareInterrupt);
}

/// `changeMode` — exception entry/return: bank the current mode, copy
/// `SPSR` into `CPSR` (the return half only; entry instead sets mode and
/// `SPSR` directly before calling `writeModeRegs`/`readModeRegs` without
/// this helper), then load the new mode's bank.
///
/// # Safety
/// See `load_memory_u8`.
pub unsafe extern "C" fn change_mode(p: *mut ArmCore) {
    let core = &mut *p;
    let old = core.mode();
    core.write_bank(old);
    core.cpsr = core.spsr;
    let new = core.mode();
    core.read_bank(new);
}

/// `writeModeRegs` — banks the mode currently live in `CPSR`, called
/// before `MSR` overwrites the control byte.
///
/// # Safety
/// See `load_memory_u8`.
pub unsafe extern "C" fn write_mode_regs(p: *mut ArmCore) {
    let core = &mut *p;
    let mode = core.mode();
    core.write_bank(mode);
}

/// `readModeRegs` — loads the mode now live in `CPSR`, called after
/// `MSR` has overwritten the control byte.
///
/// # Safety
/// See `load_memory_u8`.
pub unsafe extern "C" fn read_mode_regs(p: *mut ArmCore) {
    let core = &mut *p;
    let mode = core.mode();
    core.read_bank(mode);
}
