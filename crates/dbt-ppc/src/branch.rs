//! `b`/`bc` (§4.4 "Branches", the only branch forms the fast-emitted list
//! names — `bclr`/`bcctr` and the CR-logical family route through the
//! interpreter fallback, see `ppc::emit_instruction`).
//!
//! Neither form touches the trampoline table itself: both just store the
//! computed target into `PpcCore::pc` and `RET`, the same contract
//! `dbt-arm::branch` uses.

use dbt_x86_emit::{Emitter, Register};

use crate::cond;
use crate::state::{spr, PpcCore};

/// Sign-extends a `width`-bit field (already left-aligned so its top bit
/// sits at bit 31) by an arithmetic shift. Used for `LI`/`BD`, both of
/// which the ISA stores word-aligned (`<<2` folded into the mask) with a
/// small number of significant bits.
fn sign_extend(shifted: u32, width: u32) -> i32 {
    (shifted as i32) >> (32 - width)
}

/// `b`/`ba`/`bl`/`bla` (opcode 18): target = `LI` (24 bits, word-aligned,
/// sign-extended as a 26-bit field), absolute if `AA` else `pc`-relative;
/// `LK` saves `pc + 4` to `LR` first.
pub fn emit_b(e: &mut Emitter, p: Register, raw: u32, pc: u32) {
    let li = raw & 0x03FF_FFFC;
    let signed = sign_extend(li, 26);
    let absolute = raw & 0b10 != 0;
    let link = raw & 0b1 != 0;

    let target = if absolute { signed as u32 } else { pc.wrapping_add(signed as u32) };

    if link {
        e.mov_imm32(Register::Rax, pc.wrapping_add(4));
        e.store_mem32(p, PpcCore::spr_offset(spr::LR), Register::Rax);
    }
    e.mov_imm32(Register::Rax, target);
    e.store_mem32(p, PpcCore::pc_offset(), Register::Rax);
    e.ret();
}

/// `bc`/`bca`/`bcl`/`bcla` (opcode 16): gated by the `cond` prologue
/// (CTR decrement/test, CR-bit test), then identical target computation
/// to `b` but with a 14-bit `BD` field.
pub fn emit_bc(e: &mut Emitter, p: Register, raw: u32, pc: u32, cr_offset: i32, ctr_offset: i32) {
    let bo = (raw >> 21) & 0x1F;
    let bi = (raw >> 16) & 0x1F;
    cond::emit_prologue(e, p, cr_offset, ctr_offset, bo, bi);

    let bd = raw & 0x0000_FFFC;
    let signed = sign_extend(bd, 16);
    let absolute = raw & 0b10 != 0;
    let link = raw & 0b1 != 0;

    let target = if absolute { signed as u32 } else { pc.wrapping_add(signed as u32) };

    if link {
        e.mov_imm32(Register::Rax, pc.wrapping_add(4));
        e.store_mem32(p, PpcCore::spr_offset(spr::LR), Register::Rax);
    }
    e.mov_imm32(Register::Rax, target);
    e.store_mem32(p, PpcCore::pc_offset(), Register::Rax);
    e.ret();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_branch_targets_pc_plus_offset() {
        let mut e = Emitter::new();
        // b +8 (li field for +8 is 8, AA=0, LK=0)
        emit_b(&mut e, Register::Rdi, 8, 0x1000);
        assert!(e.size() > 0);
    }

    #[test]
    fn absolute_link_branch_writes_lr_before_pc() {
        let mut e = Emitter::new();
        let without_link = {
            let mut e2 = Emitter::new();
            emit_b(&mut e2, Register::Rdi, 8 | 0b10, 0x1000);
            e2.size()
        };
        emit_b(&mut e, Register::Rdi, 8 | 0b11, 0x1000);
        assert!(e.size() > without_link);
    }

    #[test]
    fn bc_always_taken_still_computes_a_target() {
        let mut e = Emitter::new();
        let raw = (0x14 << 21) | (0 << 16) | 8; // BO=always, BD=+8
        emit_bc(&mut e, Register::Rdi, raw, 0x2000, 0, 4);
        assert!(e.size() > 0);
    }
}
