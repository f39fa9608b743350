//! ARM data-processing operand 2: the "shifter operand" computation
//! shared by every data-processing instruction (§4.2).
//!
//! Three shapes, each with different compile-time/runtime splits:
//!
//! - *Immediate form* (`I=1`): an 8-bit value rotated by 2x a 4-bit
//!   field, both embedded in the instruction. Fully known at JIT-compile
//!   time, so `fold_immediate` just computes it in Rust and the caller
//!   emits a constant load.
//! - *Register, shift-by-immediate* (`I=0`, bit4=0): the shift amount is
//!   also embedded in the instruction, so only the shifted *value* is a
//!   runtime quantity — `emit_shift_by_imm` emits a fixed-amount host
//!   shift.
//! - *Register, shift-by-register* (`I=0`, bit4=1): the amount lives in a
//!   register and is not known until the body runs. `emit_shift_by_reg`
//!   emits the full boundary-aware sequence (amounts 0, 31, 32, >32 all
//!   behave differently per §8).

use dbt_x86_emit::{Emitter, Register};

use crate::state::ArmCore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShiftKind {
    Lsl,
    Lsr,
    Asr,
    Ror,
}

impl ShiftKind {
    #[must_use]
    pub fn from_bits(bits: u32) -> ShiftKind {
        match bits & 0b11 {
            0 => ShiftKind::Lsl,
            1 => ShiftKind::Lsr,
            2 => ShiftKind::Asr,
            _ => ShiftKind::Ror,
        }
    }
}

/// Computes the 8-bit-rotated immediate operand 2 and its carry-out, both
/// known entirely at JIT-compile time (`rotate` and `imm8` come straight
/// from the instruction word). `rotate` is the raw 4-bit field; the
/// actual rotation is `2 * rotate`.
#[must_use]
pub fn fold_immediate(rotate: u32, imm8: u32) -> (u32, Option<bool>) {
    let amount = (rotate & 0xF) * 2;
    let value = imm8.rotate_right(amount);
    // Per §4.2: carry only updates (to the MSB of the rotated value) when
    // the rotation amount is nonzero. Zero rotation leaves C untouched,
    // signaled here with `None` so the caller knows not to emit anything.
    let carry = if amount == 0 { None } else { Some(value >> 31 != 0) };
    (value, carry)
}

/// Emits a host sequence computing `Rm shift #amount` into `dest`,
/// reading `Rm` from `[p + rm_offset]`. `amount` is a compile-time
/// constant (the instruction's own 5-bit immediate shift field).
///
/// When `update_carry` is set, also writes the shift-out bit to CPSR.C
/// at `cpsr_offset`. The degenerate immediate encodings are handled per
/// §4.2: `LSL #0` is a plain pass-through (no shift, C untouched);
/// `LSR #0`/`ASR #0` mean "shift by 32"; `ROR #0` means RRX (rotate
/// through carry by one).
pub fn emit_shift_by_imm(
    e: &mut Emitter,
    p: Register,
    dest: Register,
    rm_offset: i32,
    kind: ShiftKind,
    amount: u32,
    update_carry: bool,
    cpsr_offset: i32,
) {
    e.load_mem32(dest, p, rm_offset);

    if kind == ShiftKind::Lsl && amount == 0 {
        return; // pass-through, C untouched.
    }

    if kind == ShiftKind::Ror && amount == 0 {
        // RRX: rotate right by one through the current carry flag.
        // Bring CPSR.C into the host carry flag, then `rcr dest, 1`
        // rotates it in as the new top bit; the host CF left behind is
        // the bit shifted out, i.e. the new guest carry.
        e.bit_test_mem32(p, cpsr_offset, ArmCore::C_BIT as u8);
        e.rcr_imm32(dest, 1);
        if update_carry {
            write_carry_from_host_cf(e, p, cpsr_offset);
        }
        return;
    }

    let effective = match kind {
        ShiftKind::Lsl => amount,
        ShiftKind::Lsr | ShiftKind::Asr if amount == 0 => 32,
        _ => amount,
    };

    match kind {
        ShiftKind::Lsl => e.shl_imm32(dest, effective as u8),
        ShiftKind::Lsr => {
            if effective >= 32 {
                if update_carry {
                    // C <- bit 31 of the original value (shifted out on a
                    // 32-bit shift), result is 0.
                    e.bit_test_reg32(dest, 31);
                    write_carry_from_host_cf(e, p, cpsr_offset);
                }
                e.xor_reg_reg32(dest, dest);
                return;
            }
            e.shr_imm32(dest, effective as u8);
        }
        ShiftKind::Asr => {
            if effective >= 32 {
                if update_carry {
                    e.bit_test_reg32(dest, 31);
                    write_carry_from_host_cf(e, p, cpsr_offset);
                }
                e.sar_imm32(dest, 31); // sign-extend fully: all 0 or all 1
                return;
            }
            e.sar_imm32(dest, effective as u8);
        }
        ShiftKind::Ror => e.ror_imm32(dest, (effective % 32) as u8),
    }

    if update_carry {
        write_carry_from_host_cf(e, p, cpsr_offset);
    }
}

/// Emits a host sequence computing `Rm shift Rs` into `dest`, where the
/// shift amount `Rs` is only known at runtime (register-shifted-by-
/// register form, §4.2). Handles the full boundary table: amounts 0, 31,
/// 32, and >32 each behave differently per shift kind.
///
/// `rs_offset` is read into `CL` (the only register the host `shl/shr/
/// sar/ror ..., CL` forms accept), so the caller must not already be
/// depending on `RCX` across this call.
pub fn emit_shift_by_reg(
    e: &mut Emitter,
    p: Register,
    dest: Register,
    rm_offset: i32,
    rs_offset: i32,
    kind: ShiftKind,
    update_carry: bool,
    cpsr_offset: i32,
) {
    e.load_mem32(dest, p, rm_offset);
    e.load_mem32(Register::Rcx, p, rs_offset);
    e.and_reg_imm32(Register::Rcx, 0xFF); // Rs is a full register, low byte is the shift amount

    match kind {
        ShiftKind::Lsl => emit_lsl_by_reg(e, dest, update_carry, p, cpsr_offset),
        ShiftKind::Lsr => emit_lsr_by_reg(e, dest, update_carry, p, cpsr_offset),
        ShiftKind::Asr => emit_asr_by_reg(e, dest, update_carry, p, cpsr_offset),
        ShiftKind::Ror => emit_ror_by_reg(e, dest, update_carry, p, cpsr_offset),
    }
}

/// `amount == 32` and `amount > 32` both leave the result zero for LSL;
/// the host `shl reg, cl` only shifts by `amount % 32`, wrong for those
/// cases, so large amounts are special-cased explicitly rather than
/// trusted to the host's own masking behavior.
fn emit_lsl_by_reg(e: &mut Emitter, dest: Register, update_carry: bool, p: Register, cpsr_offset: i32) {
    let mut exits = Vec::new();

    // amount == 32: C <- bit 0 of the original value, result 0.
    e.compare_imm32(Register::Rcx, 32);
    let at_32_patch = e.tell();
    e.jump_if_not_equal(0);
    let at_32_body_start = e.tell();
    if update_carry {
        e.bit_test_reg32(dest, 0);
        write_carry_from_host_cf(e, p, cpsr_offset);
    }
    e.xor_reg_reg32(dest, dest);
    exits.push(e.tell());
    e.jump_rel(0);
    patch_to_here(e, at_32_patch, at_32_body_start, Emitter::jump_if_not_equal);

    // amount > 32: result 0, C <- 0 (no bit was "shifted out").
    e.compare_imm32(Register::Rcx, 32);
    let gt_32_patch = e.tell();
    e.jump_if_below(0);
    let gt_32_body_start = e.tell();
    if update_carry {
        e.and_mem_imm32(p, cpsr_offset, !(1 << ArmCore::C_BIT));
    }
    e.xor_reg_reg32(dest, dest);
    exits.push(e.tell());
    e.jump_rel(0);
    patch_to_here(e, gt_32_patch, gt_32_body_start, Emitter::jump_if_below);

    // amount in 1..31 (and the amount == 0 no-op, which `shl cl` handles
    // correctly on its own — no result change and C untouched).
    e.compare_imm32(Register::Rcx, 0);
    let zero_patch = e.tell();
    e.jump_if_zero(0);
    let zero_body_start = e.tell();
    // The host `shl reg, cl` itself sets CF to the last bit shifted out
    // for amounts in this range, so no separate derivation is needed.
    e.shl_reg32(dest);
    if update_carry {
        write_carry_from_host_cf(e, p, cpsr_offset);
    }
    patch_to_here(e, zero_patch, zero_body_start, Emitter::jump_if_zero);

    let end = e.tell();
    for exit in exits {
        patch_jmp_to_here(e, exit, end);
    }
}

fn emit_lsr_by_reg(e: &mut Emitter, dest: Register, update_carry: bool, p: Register, cpsr_offset: i32) {
    let mut exits = Vec::new();

    e.compare_imm32(Register::Rcx, 32);
    let eq_patch = e.tell();
    e.jump_if_not_equal(0);
    let eq_body = e.tell();
    if update_carry {
        e.bit_test_reg32(dest, 31);
        write_carry_from_host_cf(e, p, cpsr_offset);
    }
    e.xor_reg_reg32(dest, dest);
    exits.push(e.tell());
    e.jump_rel(0);
    patch_to_here(e, eq_patch, eq_body, Emitter::jump_if_not_equal);

    e.compare_imm32(Register::Rcx, 32);
    let gt_patch = e.tell();
    e.jump_if_below(0);
    let gt_body = e.tell();
    if update_carry {
        e.and_mem_imm32(p, cpsr_offset, !(1 << ArmCore::C_BIT));
    }
    e.xor_reg_reg32(dest, dest);
    exits.push(e.tell());
    e.jump_rel(0);
    patch_to_here(e, gt_patch, gt_body, Emitter::jump_if_below);

    e.compare_imm32(Register::Rcx, 0);
    let zero_patch = e.tell();
    e.jump_if_zero(0);
    let zero_body = e.tell();
    e.shr_reg32(dest);
    if update_carry {
        write_carry_from_host_cf(e, p, cpsr_offset);
    }
    patch_to_here(e, zero_patch, zero_body, Emitter::jump_if_zero);

    let end = e.tell();
    for exit in exits {
        patch_jmp_to_here(e, exit, end);
    }
}

fn emit_asr_by_reg(e: &mut Emitter, dest: Register, update_carry: bool, p: Register, cpsr_offset: i32) {
    // amount >= 32: result is the sign extension of the original value;
    // C <- the sign bit. `sar reg, 31` saturates correctly for any
    // amount >= 32 (the host masks to 0-31, but 31 already saturates).
    e.compare_imm32(Register::Rcx, 32);
    let ge_patch = e.tell();
    e.jump_if_below(0);
    let ge_body = e.tell();
    if update_carry {
        e.bit_test_reg32(dest, 31);
        write_carry_from_host_cf(e, p, cpsr_offset);
    }
    e.sar_imm32(dest, 31);
    let ge_exit = e.tell();
    e.jump_rel(0);
    patch_to_here(e, ge_patch, ge_body, Emitter::jump_if_below);

    e.compare_imm32(Register::Rcx, 0);
    let zero_patch = e.tell();
    e.jump_if_zero(0);
    let zero_body = e.tell();
    e.sar_reg32(dest);
    if update_carry {
        write_carry_from_host_cf(e, p, cpsr_offset);
    }
    patch_to_here(e, zero_patch, zero_body, Emitter::jump_if_zero);

    let end = e.tell();
    patch_jmp_to_here(e, ge_exit, end);
}

fn emit_ror_by_reg(e: &mut Emitter, dest: Register, update_carry: bool, p: Register, cpsr_offset: i32) {
    // The host `ror reg, cl` already takes the amount mod 32 (mod 5 bits
    // actually masked to 31 internally), matching ROR's own "amount mod
    // 32" rule directly — no >=32 special case needed, only amount==0
    // (leave C untouched).
    e.compare_imm32(Register::Rcx, 0);
    let zero_patch = e.tell();
    e.jump_if_zero(0);
    let zero_body = e.tell();
    e.ror_reg32(dest);
    if update_carry {
        write_carry_from_host_cf(e, p, cpsr_offset);
    }
    patch_to_here(e, zero_patch, zero_body, Emitter::jump_if_zero);
}

/// Writes the host carry flag (CF, just set by the preceding shift or
/// bit-test) into CPSR.C. `bts`/`btr` on the CPSR word directly, gated
/// by the host CF, avoids a separate load/modify/store round trip.
fn write_carry_from_host_cf(e: &mut Emitter, p: Register, cpsr_offset: i32) {
    let patch = e.tell();
    e.jump_if_not_carry(0);
    let body = e.tell();
    e.bit_test_set_mem32(p, cpsr_offset, ArmCore::C_BIT as u8);
    let end = e.tell();
    let disp = i8::try_from(end - body).expect("carry-write body fits a short jump");
    e.seek(patch);
    e.jump_if_not_carry(disp);
    e.seek(end);
    // Clear path: CF was 0, so explicitly reset the bit (the `bts` above
    // only ever sets it).
    let clear_patch = e.tell();
    e.jump_if_carry(0);
    let clear_body = e.tell();
    e.bit_test_reset_mem32(p, cpsr_offset, ArmCore::C_BIT as u8);
    let clear_end = e.tell();
    let clear_disp = i8::try_from(clear_end - clear_body).expect("carry-clear body fits a short jump");
    e.seek(clear_patch);
    e.jump_if_carry(clear_disp);
    e.seek(clear_end);
}

fn patch_to_here(e: &mut Emitter, patch: usize, body_start: usize, jcc: impl Fn(&mut Emitter, i8)) {
    let end = e.tell();
    let disp = i8::try_from(end - body_start).expect("shift boundary body fits a short jump");
    e.seek(patch);
    jcc(e, disp);
    e.seek(end);
}

/// Patches an unconditional jump placeholder (emitted via `e.jump_rel(0)`
/// right after a boundary block's body) to land at `target` — the point
/// past every remaining boundary check — so that block's own body is the
/// only one that runs for its amount, instead of falling through into
/// whichever check comes next.
fn patch_jmp_to_here(e: &mut Emitter, patch_at: usize, target: usize) {
    let disp = i8::try_from(target as isize - (patch_at as isize + 2)).expect("shift boundary exit jump fits a short jump");
    let resume = e.tell();
    e.seek(patch_at);
    e.jump_rel(i32::from(disp));
    e.seek(resume);
}

#[cfg(test)]
mod tests {
    use super::*;
    use dbt_x86_emit::ExecutableBlock;

    #[test]
    fn fold_immediate_zero_rotation_leaves_carry_untouched() {
        let (value, carry) = fold_immediate(0, 0xFF);
        assert_eq!(value, 0xFF);
        assert_eq!(carry, None);
    }

    #[test]
    fn fold_immediate_rotates_and_reports_msb_as_carry() {
        let (value, carry) = fold_immediate(1, 0xFF); // rotate right by 2
        assert_eq!(value, 0xFF << 30 | 0x3F);
        assert_eq!(carry, Some(true));
    }

    #[test]
    fn emit_shift_by_imm_lsl_zero_is_pass_through() {
        let mut e = Emitter::new();
        emit_shift_by_imm(&mut e, Register::Rdi, Register::Rax, 0, ShiftKind::Lsl, 0, true, 4);
        // Only the initial load, no shift or carry-write bytes.
        assert_eq!(e.bytes(), [0x8B, 0x07]);
    }

    #[test]
    fn emit_shift_by_imm_ror_zero_is_rrx() {
        let mut e = Emitter::new();
        emit_shift_by_imm(&mut e, Register::Rdi, Register::Rax, 0, ShiftKind::Ror, 0, false, 4);
        assert!(e.size() > 2); // load + bt + rcr at minimum
    }

    /// Builds `Rm kind Rs` against a real `ArmCore`, exercising the actual
    /// emitted machine code rather than just its byte count — the only
    /// way to catch a boundary block that falls through into the next
    /// one instead of exiting past it.
    fn run_reg_shift(kind: ShiftKind, rm: u32, rs: u32) -> (u32, bool) {
        let mut e = Emitter::new();
        let rm_off = ArmCore::reg_offset(0);
        let rs_off = ArmCore::reg_offset(1);
        let cpsr_off = ArmCore::cpsr_offset();
        emit_shift_by_reg(&mut e, Register::Rdi, Register::Rax, rm_off, rs_off, kind, true, cpsr_off);
        e.store_mem32(Register::Rdi, ArmCore::reg_offset(2), Register::Rax);
        e.ret();
        let block = ExecutableBlock::new_rwx(e.bytes()).expect("mmap should succeed in tests");
        let mut core = ArmCore::new();
        core.regs[0] = rm;
        core.regs[1] = rs;
        let f: extern "C" fn(*mut ArmCore) = unsafe { std::mem::transmute(block.as_ptr()) };
        f(&mut core);
        (core.regs[2], core.flag(ArmCore::C_BIT))
    }

    #[test]
    fn lsl_by_reg_amount_32_takes_carry_from_bit_0_not_the_next_block() {
        let (result, carry) = run_reg_shift(ShiftKind::Lsl, 0b11, 32);
        assert_eq!(result, 0);
        assert!(carry); // bit 0 of Rm was 1
    }

    #[test]
    fn lsl_by_reg_amount_above_32_clears_carry() {
        let (result, carry) = run_reg_shift(ShiftKind::Lsl, 0b11, 40);
        assert_eq!(result, 0);
        assert!(!carry);
    }

    #[test]
    fn lsr_by_reg_amount_32_takes_carry_from_bit_31_not_the_next_block() {
        let (result, carry) = run_reg_shift(ShiftKind::Lsr, 0x8000_0000, 32);
        assert_eq!(result, 0);
        assert!(carry); // bit 31 of Rm was 1
    }

    #[test]
    fn lsr_by_reg_amount_above_32_clears_carry() {
        let (result, carry) = run_reg_shift(ShiftKind::Lsr, 0x8000_0000, 40);
        assert_eq!(result, 0);
        assert!(!carry);
    }

    #[test]
    fn asr_by_reg_amount_32_sign_extends_and_sets_carry_from_the_sign_bit() {
        let (result, carry) = run_reg_shift(ShiftKind::Asr, 0x8000_0000, 32);
        assert_eq!(result, 0xFFFF_FFFF);
        assert!(carry);
    }

    #[test]
    fn asr_by_reg_amount_above_32_still_saturates_and_sets_carry() {
        let (result, carry) = run_reg_shift(ShiftKind::Asr, 0x8000_0000, 40);
        assert_eq!(result, 0xFFFF_FFFF);
        assert!(carry);
    }
}
