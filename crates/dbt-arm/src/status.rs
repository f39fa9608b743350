//! ARM status-register moves (§4.2): `MRS` (CPSR/SPSR -> Rd) and `MSR`
//! (field-masked write of CPSR/SPSR from an immediate or Rm).
//!
//! `MSR` touching the control byte (and therefore the mode field) of
//! CPSR is the one case a data-processing-shaped instruction needs the
//! same bank swap a mode-changing exception entry/return does. Rather
//! than inline `ArmCore::write_bank`/`read_bank`'s array shuffling into
//! every such site, both are exposed as the `writeModeRegs`/
//! `readModeRegs` runtime helpers named in §6 and called here like any
//! other helper — they take only `P`, deriving "old mode" from the CPSR
//! value still in place before the call and "new mode" from the value
//! just stored before the second call.

use dbt_x86_emit::{Emitter, Register};

use crate::shifter;
use crate::state::ArmCore;

/// Byte-lane field mask for `MSR`'s 4-bit field-select (bits 19:16 of
/// the instruction): bit16=c (control, 7:0), bit17=x (extension, 15:8),
/// bit18=s (status, 23:16), bit19=f (flags, 31:24).
fn field_mask(bits: u32) -> u32 {
    let mut mask = 0u32;
    if bits & 0x1 != 0 {
        mask |= 0x0000_00FF;
    }
    if bits & 0x2 != 0 {
        mask |= 0x0000_FF00;
    }
    if bits & 0x4 != 0 {
        mask |= 0x00FF_0000;
    }
    if bits & 0x8 != 0 {
        mask |= 0xFF00_0000;
    }
    mask
}

/// `MRS Rd, CPSR|SPSR`.
pub fn emit_mrs(e: &mut Emitter, p: Register, raw: u32) {
    let use_spsr = (raw >> 22) & 1 != 0;
    let rd = ((raw >> 12) & 0xF) as usize;
    let offset = if use_spsr { ArmCore::spsr_offset() } else { ArmCore::cpsr_offset() };
    e.load_mem32(Register::Rax, p, offset);
    e.store_mem32(p, ArmCore::reg_offset(rd), Register::Rax);
}

/// `MSR CPSR_fields, #imm|Rm` / `MSR SPSR_fields, #imm|Rm`.
pub fn emit_msr(e: &mut Emitter, p: Register, raw: u32, write_mode_regs: u64, read_mode_regs: u64) {
    let use_spsr = (raw >> 22) & 1 != 0;
    let i_bit = (raw >> 25) & 1 != 0;
    let field_bits = (raw >> 16) & 0xF;
    let mask = field_mask(field_bits);
    let offset = if use_spsr { ArmCore::spsr_offset() } else { ArmCore::cpsr_offset() };

    // Operand value into RAX.
    if i_bit {
        let rotate = (raw >> 8) & 0xF;
        let imm8 = raw & 0xFF;
        let (value, _carry) = shifter::fold_immediate(rotate, imm8);
        e.mov_imm32(Register::Rax, value);
    } else {
        let rm = (raw & 0xF) as usize;
        e.load_mem32(Register::Rax, p, ArmCore::reg_offset(rm));
    }
    e.and_reg_imm32(Register::Rax, mask);

    // new = (old & !mask) | (operand & mask), combined in RDX.
    e.load_mem32(Register::Rdx, p, offset);
    e.and_reg_imm32(Register::Rdx, !mask);
    e.or_reg_reg32(Register::Rdx, Register::Rax);

    let touches_mode = !use_spsr && mask & 0xFF != 0;
    if touches_mode {
        e.push_reg64(p);
        e.push_reg64(Register::Rdx); // new value survives the helper call
        e.call_abs(Register::Rax, write_mode_regs); // banks the *current* mode, read from CPSR as-is
        e.pop_reg64(Register::Rdx);
        e.pop_reg64(p);
    }

    e.store_mem32(p, offset, Register::Rdx);

    if touches_mode {
        e.push_reg64(p);
        e.call_abs(Register::Rax, read_mode_regs); // loads the *new* mode, now live in CPSR
        e.pop_reg64(p);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn field_mask_covers_all_four_bytes() {
        assert_eq!(field_mask(0b1111), 0xFFFF_FFFF);
        assert_eq!(field_mask(0b1000), 0xFF00_0000);
        assert_eq!(field_mask(0b0001), 0x0000_00FF);
    }

    #[test]
    fn mrs_emits_a_load_and_a_store() {
        let mut e = Emitter::new();
        emit_mrs(&mut e, Register::Rdi, (0 << 12) as u32);
        assert!(e.size() > 0);
    }

    #[test]
    fn msr_without_control_byte_skips_the_mode_helpers() {
        let mut e = Emitter::new();
        // MSR CPSR_f, #0 — flags field only, no mode-bank traffic.
        let raw = (1 << 25) | (0b1000 << 16);
        emit_msr(&mut e, Register::Rdi, raw, 0x1000, 0x2000);
        assert!(e.size() > 0);
    }

    #[test]
    fn msr_touching_control_byte_emits_both_helper_calls() {
        let mut e = Emitter::new();
        let raw = (1 << 25) | (0b0001 << 16); // control byte
        let without_helpers = {
            let mut e2 = Emitter::new();
            let flags_only = (1 << 25) | (0b1000 << 16);
            emit_msr(&mut e2, Register::Rdi, flags_only, 0x1000, 0x2000);
            e2.size()
        };
        emit_msr(&mut e, Register::Rdi, raw, 0x1000, 0x2000);
        assert!(e.size() > without_helpers);
    }
}
