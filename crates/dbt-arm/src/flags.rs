//! ARM arithmetic flag updates (§4.2 "Arithmetic flag updates").
//!
//! Named after the original's own method list (`generateCarryUpdate`/
//! `generateOverflowUpdate`/`generateOverflowUpdateInv`, see
//! `SPEC_FULL.md`'s Supplemented Features) rather than inlined ad hoc —
//! each is a fixed-size unit the condition-prologue budget depends on.
//!
//! Callers must fold C/V *before* N/Z. `generate_flags_update` probes the
//! result with `bt`/`test`, both of which leave the host's CF/OF from the
//! `add`/`adc`/`sub`/`sbb` undefined — so C/V have to be read off those
//! flags while they're still live. And C/V can't be folded as two
//! sequential single-bit passes either: each pass's own `bts`/`btr`
//! clobbers the *other* flag before the second pass gets to read it.
//! `generate_carry_overflow_update` reads both with a four-way branch on
//! (CF, OF) built entirely out of conditional jumps (which don't touch
//! flags) before committing either bit, so it is the only valid ordering
//! of "carry update" and "overflow update" against a shared live-flags
//! window.

use dbt_x86_emit::{Emitter, Register};

use crate::state::ArmCore;

const C_MASK: u32 = 1 << ArmCore::C_BIT;
const V_MASK: u32 = 1 << ArmCore::V_BIT;

/// Writes N and Z from the 32-bit ALU result sitting in `result`,
/// leaving C and V untouched — the identity `generateFlagsUpdate` must
/// satisfy per `SPEC_FULL.md` §8. Must run *after*
/// `generate_carry_overflow_update` for any opcode that needs both: this
/// function's own `bt`/`test` clobber CF/OF.
pub fn generate_flags_update(e: &mut Emitter, p: Register, cpsr_offset: i32, result: Register) {
    // N <- bit 31 of the result.
    set_bit_from_test(e, p, cpsr_offset, ArmCore::N_BIT as u8, |e| {
        e.bit_test_reg32(result, 31);
    });
    // Z <- result == 0.
    e.test_reg32(result, result);
    set_bit_from_zero_flag(e, p, cpsr_offset, ArmCore::Z_BIT as u8);
}

/// Folds the host CF and OF — just left by the caller's `add`/`adc`/
/// `sub`/`sbb` (SUB-family carry already re-polarized to ARM's
/// "NOT borrow" sense by `dataproc::emit_subtract`'s `cmc` bracketing,
/// so this single implementation serves both ADD/ADC/CMN and
/// SUB/SBC/RSB/RSC/CMP alike; no separate `_inv` form is needed) — into
/// CPSR.C and CPSR.V in one pass. Reads both flags via conditional jumps
/// (which never themselves touch EFLAGS) before writing either bit, so
/// neither write can clobber the other's source flag.
pub fn generate_carry_overflow_update(e: &mut Emitter, p: Register, cpsr_offset: i32) {
    let jc_patch = e.tell();
    e.jump_if_carry(0);

    // CF = 0
    let jo_clear_patch = e.tell();
    e.jump_if_overflow(0);
    // CF=0, OF=0
    write_c_v(e, p, cpsr_offset, false, false);
    let skip_from_00 = e.tell();
    e.jump_rel(0);
    let cf_clear_of_set_start = e.tell();
    patch_cond8(e, jo_clear_patch, cf_clear_of_set_start, Emitter::jump_if_overflow);

    // CF=0, OF=1
    write_c_v(e, p, cpsr_offset, false, true);
    let skip_from_01 = e.tell();
    e.jump_rel(0);
    let cf_set_start = e.tell();
    patch_cond8(e, jc_patch, cf_set_start, Emitter::jump_if_carry);

    // CF = 1
    let jo_set_patch = e.tell();
    e.jump_if_overflow(0);
    // CF=1, OF=0
    write_c_v(e, p, cpsr_offset, true, false);
    let skip_from_10 = e.tell();
    e.jump_rel(0);
    let cf_set_of_set_start = e.tell();
    patch_cond8(e, jo_set_patch, cf_set_of_set_start, Emitter::jump_if_overflow);

    // CF=1, OF=1
    write_c_v(e, p, cpsr_offset, true, true);

    let end = e.tell();
    patch_jmp8(e, skip_from_00, end);
    patch_jmp8(e, skip_from_01, end);
    patch_jmp8(e, skip_from_10, end);
}

/// Clears CPSR bits C and V, then sets whichever of the two `c`/`v`
/// request, via plain memory-immediate AND/OR — safe here because both
/// source flags have already been consumed by the caller's branch.
fn write_c_v(e: &mut Emitter, p: Register, cpsr_offset: i32, c: bool, v: bool) {
    e.and_mem_imm32(p, cpsr_offset, !(C_MASK | V_MASK));
    let set = (if c { C_MASK } else { 0 }) | (if v { V_MASK } else { 0 });
    if set != 0 {
        e.or_mem_imm32(p, cpsr_offset, set);
    }
}

fn set_bit_from_zero_flag(e: &mut Emitter, p: Register, cpsr_offset: i32, bit: u8) {
    set_bit_conditionally(e, p, cpsr_offset, bit, Emitter::jump_if_not_zero, Emitter::jump_if_zero);
}

fn set_bit_from_carry(e: &mut Emitter, p: Register, cpsr_offset: i32, bit: u8) {
    set_bit_conditionally(e, p, cpsr_offset, bit, Emitter::jump_if_not_carry, Emitter::jump_if_carry);
}

fn set_bit_from_test(
    e: &mut Emitter,
    p: Register,
    cpsr_offset: i32,
    bit: u8,
    test: impl FnOnce(&mut Emitter),
) {
    test(e);
    set_bit_from_carry(e, p, cpsr_offset, bit);
}

/// Sets or clears `[p + cpsr_offset]`'s `bit` depending on a host flag
/// that was just computed, without disturbing the other 31 bits.
/// `jcc_if_clear`/`jcc_if_set` are the opposite-sense short jumps for the
/// flag being tested (e.g. `jnc`/`jc` for CF).
fn set_bit_conditionally(
    e: &mut Emitter,
    p: Register,
    cpsr_offset: i32,
    bit: u8,
    jcc_if_clear: impl Fn(&mut Emitter, i8),
    jcc_if_set: impl Fn(&mut Emitter, i8),
) {
    let set_patch = e.tell();
    jcc_if_clear(e, 0);
    let set_body = e.tell();
    e.bit_test_set_mem32(p, cpsr_offset, bit);
    let set_end = e.tell();
    patch(e, set_patch, set_body, set_end, &jcc_if_clear);

    let clear_patch = e.tell();
    jcc_if_set(e, 0);
    let clear_body = e.tell();
    e.bit_test_reset_mem32(p, cpsr_offset, bit);
    let clear_end = e.tell();
    patch(e, clear_patch, clear_body, clear_end, &jcc_if_set);
}

fn patch(e: &mut Emitter, patch_at: usize, body_start: usize, end: usize, jcc: &impl Fn(&mut Emitter, i8)) {
    let disp = i8::try_from(end - body_start).expect("flag-update body fits a short jump");
    e.seek(patch_at);
    jcc(e, disp);
    e.seek(end);
}

/// Patches a two-byte conditional-jump placeholder (emitted at
/// `patch_at` via the same `jcc(e, 0)` pattern as `patch`) to land at
/// `target`, then restores the cursor to `target`.
fn patch_cond8(e: &mut Emitter, patch_at: usize, target: usize, jcc: impl Fn(&mut Emitter, i8)) {
    let disp = i8::try_from(target as isize - (patch_at as isize + 2)).expect("flag-fold branch fits a short jump");
    e.seek(patch_at);
    jcc(e, disp);
    e.seek(target);
}

/// Patches a two-byte unconditional-jump placeholder (emitted via
/// `e.jump_rel(0)`, which always picks the short `EB` form for a
/// zero displacement) to land at `target`.
fn patch_jmp8(e: &mut Emitter, patch_at: usize, target: usize) {
    let disp = i8::try_from(target as isize - (patch_at as isize + 2)).expect("flag-fold exit jump fits a short jump");
    let resume = e.tell();
    e.seek(patch_at);
    e.jump_rel(i32::from(disp));
    e.seek(resume);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_update_emits_both_n_and_z_sequences() {
        let mut e = Emitter::new();
        generate_flags_update(&mut e, Register::Rdi, 4, Register::Rax);
        assert!(e.size() > 8);
    }

    #[test]
    fn carry_overflow_update_emits_a_nonempty_sequence() {
        let mut e = Emitter::new();
        generate_carry_overflow_update(&mut e, Register::Rdi, 4);
        assert!(e.size() > 0);
    }
}
