//! ARM single and multiple load/store (§4.2).
//!
//! Single-register accesses go through the `loadMemory<T>`/
//! `storeMemory<T>` runtime helpers (never inlined — the MMU walk and
//! fault delivery live in `dbt-mmu`/`dbt-jit`, not in emitted code). A
//! fault is a `false` return: the emitted epilogue `RET`s immediately
//! without writeback, since the helper has already raised the abort.

use dbt_x86_emit::{Emitter, Register};

use crate::state::ArmCore;

/// Width of a single-register load/store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Width {
    Byte,
    Half,
    Word,
}

/// Emits `LDR`/`STR` (immediate or register offset, §4.2). `helper` is
/// the absolute address of `loadMemory<T>`/`storeMemory<T>` for `width`;
/// the caller (`a32`) resolves which helper that is since this module
/// doesn't own the helper table.
#[allow(clippy::too_many_arguments)]
pub fn emit_single(
    e: &mut Emitter,
    p: Register,
    raw: u32,
    helper: u64,
    width: Width,
    is_load: bool,
    offset_value: Register,
    has_offset_value: bool,
) {
    let rn = ((raw >> 16) & 0xF) as usize;
    let rd = ((raw >> 12) & 0xF) as usize;
    let pre_index = (raw >> 24) & 1 != 0;
    let up = (raw >> 23) & 1 != 0;
    let write_back = (raw >> 21) & 1 != 0 || !pre_index;

    // Address = Rn, optionally pre-adjusted.
    e.load_mem32(Register::Rax, p, ArmCore::reg_offset(rn)); // address accumulator
    if has_offset_value && pre_index {
        apply_offset(e, Register::Rax, offset_value, up);
    }

    // Spill P across the helper call (System-V does not preserve it).
    e.push_reg64(p);
    if is_load {
        e.push_reg64(Register::Rax); // keep the address for writeback after the call
        e.mov_reg64(Register::Rsi, Register::Rax); // arg1: addr (Rax itself is untouched by push)
        e.push_reg64(Register::Rax); // scratch out-slot (overwritten by the helper)
        e.lea64(Register::Rdx, Register::Rsp, 0); // arg2: &mut out, pointing at the slot just pushed
        e.call_abs(Register::Rax, helper);
        e.pop_reg64(Register::Rcx); // loaded value (zero/sign-extended to u32 by the helper)
        e.mov_reg64(Register::Rdx, Register::Rax); // save the fault bool before Rax is overwritten below
        e.pop_reg64(Register::Rax); // restore the address used for writeback
    } else {
        e.load_mem32(Register::Rdx, p, ArmCore::reg_offset(rd)); // arg2: value
        e.mov_reg64(Register::Rsi, Register::Rax); // arg1: addr
        e.call_abs(Register::Rax, helper);
        e.mov_reg64(Register::Rdx, Register::Rax); // save the fault bool for the test below
    }
    e.pop_reg64(p);

    // On fault the helper returns false (0) in AL; bail without writeback.
    e.test_reg32(Register::Rdx, Register::Rdx);
    let fault_patch = e.tell();
    e.jump_if_not_zero(0);
    let fault_body = e.tell();
    e.ret();
    let fault_end = e.tell();
    let disp = i8::try_from(fault_end - fault_body).expect("fault-bailout body fits a short jump");
    e.seek(fault_patch);
    e.jump_if_not_zero(disp);
    e.seek(fault_end);

    if is_load {
        e.store_mem32(p, ArmCore::reg_offset(rd), Register::Rcx);
        if rd == ArmCore::PC && width == Width::Word {
            // Load-to-PC-with-exchange: low bit of the loaded value picks
            // Thumb state, and is cleared from PC itself.
            e.bit_test_reg32(Register::Rcx, 0);
            let patch = e.tell();
            e.jump_if_not_carry(0);
            let body = e.tell();
            e.or_mem_imm32(p, ArmCore::cpsr_offset(), 1 << ArmCore::T_BIT);
            e.and_mem_imm32(p, ArmCore::reg_offset(ArmCore::PC), !1u32);
            let end = e.tell();
            let d = i8::try_from(end - body).expect("exchange body fits a short jump");
            e.seek(patch);
            e.jump_if_not_carry(d);
            e.seek(end);
        }
    }

    if has_offset_value && write_back {
        // Recompute the writeback address: post-indexed forms apply the
        // offset only now, pre-indexed forms already applied it above and
        // just store the adjusted accumulator back to Rn.
        if !pre_index {
            e.load_mem32(Register::Rax, p, ArmCore::reg_offset(rn));
            apply_offset(e, Register::Rax, offset_value, up);
        }
        e.store_mem32(p, ArmCore::reg_offset(rn), Register::Rax);
    }
}

fn apply_offset(e: &mut Emitter, addr: Register, offset: Register, up: bool) {
    if up {
        e.add_reg_reg32(addr, offset);
    } else {
        e.sub_reg_reg32(addr, offset);
    }
}

/// Emits `LDM`/`STM` (§4.2). Register list is walked at JIT-compile time
/// (the mask is a compile-time constant from the instruction word), so
/// the body is a straight-line sequence of helper calls, one per set bit,
/// in ascending order for `U=1` and descending for `U=0`.
pub fn emit_multiple(e: &mut Emitter, p: Register, raw: u32, load_helper: u64, store_helper: u64) {
    let rn = ((raw >> 16) & 0xF) as usize;
    let is_load = (raw >> 20) & 1 != 0;
    let write_back = (raw >> 21) & 1 != 0;
    let up = (raw >> 23) & 1 != 0;
    let pre_index = (raw >> 24) & 1 != 0;
    let reg_list = raw & 0xFFFF;

    let count = reg_list.count_ones();
    let mut regs: Vec<usize> = (0..16).filter(|r| reg_list & (1 << r) != 0).collect();
    if !up {
        regs.reverse();
    }

    e.load_mem32(Register::Rax, p, ArmCore::reg_offset(rn)); // running address
    for (i, reg) in regs.iter().enumerate() {
        if pre_index {
            e.add_reg_imm32(Register::Rax, 4);
        }
        e.push_reg64(p);
        e.push_reg64(Register::Rax);
        if is_load {
            e.mov_reg64(Register::Rsi, Register::Rax);
            e.lea64(Register::Rdx, Register::Rsp, 0);
            e.push_reg64(Register::Rax);
            e.call_abs(Register::Rax, load_helper);
            e.pop_reg64(Register::Rcx);
        } else {
            e.load_mem32(Register::Rdx, p, ArmCore::reg_offset(*reg));
            e.mov_reg64(Register::Rsi, Register::Rax);
            e.call_abs(Register::Rax, store_helper);
        }
        e.pop_reg64(Register::Rax);
        e.pop_reg64(p);
        if is_load {
            e.store_mem32(p, ArmCore::reg_offset(*reg), Register::Rcx);
        }
        if !pre_index && i + 1 < regs.len() {
            e.add_reg_imm32(Register::Rax, 4);
        }
    }

    if write_back {
        let rn_off = ArmCore::reg_offset(rn);
        if pre_index == up {
            e.store_mem32(p, rn_off, Register::Rax);
        } else {
            // Post-decrement's running address ends one step short of the
            // final writeback value (the last iteration never advanced
            // it further) — adjust by the remaining step.
            if up {
                e.add_reg_imm32(Register::Rax, 4);
            } else {
                e.sub_reg_imm32(Register::Rax, 4);
            }
            e.store_mem32(p, rn_off, Register::Rax);
        }
    }

    let _ = count;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_load_emits_a_nonempty_body() {
        let mut e = Emitter::new();
        // LDR R0, [R1], #0 post-indexed, offset applied externally as 0
        let raw = 0xE491_0000u32 & 0x0FFF_FFFF;
        emit_single(&mut e, Register::Rdi, raw, 0x1000, Width::Word, true, Register::Rax, false);
        assert!(e.size() > 0);
    }

    #[test]
    fn multiple_with_empty_mask_still_terminates() {
        let mut e = Emitter::new();
        let raw = (1 << 23) | (1 << 16); // U=1, Rn=0, empty reg list
        emit_multiple(&mut e, Register::Rdi, raw, 0x2000, 0x3000);
        assert_eq!(e.size(), 2); // just the initial address load
    }
}
