//! ARM branches (§4.2): `B`/`BL` (PC-relative) and `BX`/`BLX` (register,
//! with Thumb interworking).
//!
//! None of these touch the trampoline table themselves — they just load
//! the new PC into `regs[PC]` and `RET` back to the dispatcher, which
//! reads the updated PC off `P` the same way it does after a fall-through.

use dbt_x86_emit::{Emitter, Register};

use crate::state::ArmCore;

/// `B`/`BL raw.offset24`: target = PC + 4 + (`sign_extend(offset24) << 2`),
/// where PC here is the address of the branch instruction itself (the
/// pipeline's "PC is always +8" convention is already folded into the
/// `+4` since the caller's PC field holds `addr + 4`, not `addr + 8`).
pub fn emit_b(e: &mut Emitter, p: Register, raw: u32, pc: u32, link: bool) {
    let offset24 = raw & 0x00FF_FFFF;
    let signed = ((offset24 << 8) as i32) >> 8; // sign-extend 24 -> 32
    let target = pc.wrapping_add(4).wrapping_add((signed << 2) as u32);

    if link {
        e.mov_imm32(Register::Rax, pc.wrapping_add(4));
        e.store_mem32(p, ArmCore::reg_offset(ArmCore::LR), Register::Rax);
    }
    e.mov_imm32(Register::Rax, target);
    e.store_mem32(p, ArmCore::reg_offset(ArmCore::PC), Register::Rax);
    e.ret();
}

/// `BX`/`BLX reg_form`: target = `Rm` with bit 0 cleared; `CPSR.T` takes
/// `Rm`'s bit 0 before it's cleared. `BLX`'s link (`link`) saves the
/// return address the same way `BL` does.
pub fn emit_bx(e: &mut Emitter, p: Register, raw: u32, pc: u32, link: bool) {
    let rm = (raw & 0xF) as usize;

    if link {
        e.mov_imm32(Register::Rax, pc.wrapping_add(4));
        e.store_mem32(p, ArmCore::reg_offset(ArmCore::LR), Register::Rax);
    }

    e.load_mem32(Register::Rax, p, ArmCore::reg_offset(rm));
    e.bit_test_reg32(Register::Rax, 0);
    let patch = e.tell();
    e.jump_if_not_carry(0);
    let body = e.tell();
    e.or_mem_imm32(p, ArmCore::cpsr_offset(), 1 << ArmCore::T_BIT);
    let end = e.tell();
    let disp = i8::try_from(end - body).expect("BX interworking body fits a short jump");
    e.seek(patch);
    e.jump_if_not_carry(disp);
    e.seek(end);

    e.and_reg_imm32(Register::Rax, !1u32);
    e.store_mem32(p, ArmCore::reg_offset(ArmCore::PC), Register::Rax);
    e.ret();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn b_with_zero_offset_targets_pc_plus_four() {
        let mut e = Emitter::new();
        emit_b(&mut e, Register::Rdi, 0, 0x8000, false);
        assert!(e.size() > 0);
    }

    #[test]
    fn bl_writes_lr_before_pc() {
        let mut e = Emitter::new();
        emit_b(&mut e, Register::Rdi, 0, 0x8000, true);
        assert!(e.size() > 8);
    }

    #[test]
    fn bx_emits_the_interworking_check() {
        let mut e = Emitter::new();
        let raw = 0x1; // Rm = R1
        emit_bx(&mut e, Register::Rdi, raw, 0x8000, false);
        assert!(e.size() > 4);
    }
}
