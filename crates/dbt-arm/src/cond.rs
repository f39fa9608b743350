//! ARM condition-code evaluation and the host condition prologue.
//!
//! `check` is the pure, interpreter-side predicate (also the oracle the
//! JIT prologue must agree with — see the determinism property in
//! `SPEC_FULL.md` §8). `emit_prologue` emits the equivalent host
//! instruction sequence so a jitted body can `RET` early without ever
//! calling back into Rust for the common case.

use dbt_x86_emit::{Emitter, Register};

use crate::state::ArmCore;

/// Evaluate a 4-bit ARM condition field against CPSR's NZCV bits.
/// `cond == 0b1111` (`AL`) is not expected to reach here — callers skip
/// the prologue entirely for `AL`, matching the boundary behavior in
/// `SPEC_FULL.md` §8 ("ARM condition `AL` emits no prologue RET path").
#[must_use]
pub fn check(cpsr: u32, cond: u8) -> bool {
    let n = cpsr & (1 << ArmCore::N_BIT) != 0;
    let z = cpsr & (1 << ArmCore::Z_BIT) != 0;
    let c = cpsr & (1 << ArmCore::C_BIT) != 0;
    let v = cpsr & (1 << ArmCore::V_BIT) != 0;
    match cond {
        0x0 => z,                  // EQ
        0x1 => !z,                 // NE
        0x2 => c,                  // CS/HS
        0x3 => !c,                 // CC/LO
        0x4 => n,                  // MI
        0x5 => !n,                 // PL
        0x6 => v,                  // VS
        0x7 => !v,                 // VC
        0x8 => c && !z,            // HI
        0x9 => !c || z,            // LS
        0xA => n == v,             // GE
        0xB => n != v,             // LT
        0xC => !z && (n == v),     // GT
        0xD => z || (n != v),      // LE
        0xE => true,               // AL
        _ => true,
    }
}

/// Emits a sequence that `RET`s immediately if the condition is false,
/// falling through to the caller's next emitted byte (the instruction
/// body) if true. `p` is the register holding the guest-state pointer,
/// `cpsr_offset` its `[P+offset]` displacement. Passed in rather than
/// hardcoded so tests can emit against a scratch layout without
/// depending on `dbt-arm::state`.
pub fn emit_prologue(e: &mut Emitter, p: Register, cpsr_offset: i32, cond: u8) {
    match cond {
        // Direct or inverted single-flag tests.
        0x0 => ret_unless_mem(e, p, cpsr_offset, ArmCore::Z_BIT as u8, true),
        0x1 => ret_unless_mem(e, p, cpsr_offset, ArmCore::Z_BIT as u8, false),
        0x2 => ret_unless_mem(e, p, cpsr_offset, ArmCore::C_BIT as u8, true),
        0x3 => ret_unless_mem(e, p, cpsr_offset, ArmCore::C_BIT as u8, false),
        0x4 => ret_unless_mem(e, p, cpsr_offset, ArmCore::N_BIT as u8, true),
        0x5 => ret_unless_mem(e, p, cpsr_offset, ArmCore::N_BIT as u8, false),
        0x6 => ret_unless_mem(e, p, cpsr_offset, ArmCore::V_BIT as u8, true),
        0x7 => ret_unless_mem(e, p, cpsr_offset, ArmCore::V_BIT as u8, false),
        // HI: continue iff C=1 AND Z=0 — two independent ret-unless checks.
        0x8 => {
            ret_unless_mem(e, p, cpsr_offset, ArmCore::C_BIT as u8, true);
            ret_unless_mem(e, p, cpsr_offset, ArmCore::Z_BIT as u8, false);
        }
        // LS: continue iff C=0 OR Z=1 — short-circuit on C=0 by skipping
        // the Z check entirely (an OR can't be split into two
        // independent ret-unless blocks the way HI's AND can).
        0x9 => {
            e.bit_test_mem32(p, cpsr_offset, ArmCore::C_BIT as u8);
            skip_forward(e, Emitter::jump_if_not_carry, |e| {
                ret_unless_mem(e, p, cpsr_offset, ArmCore::Z_BIT as u8, true);
            });
        }
        // GE/LT: continue iff N^V is clear/set.
        0xA => emit_n_xor_v(e, p, cpsr_offset, false),
        0xB => emit_n_xor_v(e, p, cpsr_offset, true),
        // GT: continue iff Z=0 AND N^V clear.
        0xC => {
            ret_unless_mem(e, p, cpsr_offset, ArmCore::Z_BIT as u8, false);
            emit_n_xor_v(e, p, cpsr_offset, false);
        }
        // LE: continue iff Z=1 OR N^V set — same short-circuit shape as LS.
        0xD => {
            e.bit_test_mem32(p, cpsr_offset, ArmCore::Z_BIT as u8);
            skip_forward(e, Emitter::jump_if_carry, |e| {
                emit_n_xor_v(e, p, cpsr_offset, true);
            });
        }
        0xE => {} // AL: no prologue at all.
        _ => e.ret(),
    }
}

/// Computes N^V into a scratch register and emits the final ret-unless
/// test, shared by GE/LT and by GT/LE once their Z pre-check passed.
/// CPSR is read into a scratch register, shifted right by 3 so bit 31
/// (N) lands on bit 28 (V)'s position, then XORed with the original so
/// bit 28 of the result is N^V.
fn emit_n_xor_v(e: &mut Emitter, p: Register, cpsr_offset: i32, want_set: bool) {
    e.load_mem32(Register::Rax, p, cpsr_offset);
    e.mov_reg32(Register::Rcx, Register::Rax);
    e.shr_imm32(Register::Rcx, 3);
    e.xor_reg_reg32(Register::Rax, Register::Rcx);
    ret_unless_reg(e, Register::Rax, ArmCore::V_BIT as u8, want_set);
}

/// Emits `bt [P+offset], bit` followed by a single-byte `RET` that only
/// executes when the tested bit does not equal `want_set`. The jump
/// always skips exactly one byte (`ret`'s encoding), so no backpatching
/// is needed here — unlike `skip_forward`, which skips a variable-length
/// body.
fn ret_unless_mem(e: &mut Emitter, p: Register, cpsr_offset: i32, bit: u8, want_set: bool) {
    e.bit_test_mem32(p, cpsr_offset, bit);
    if want_set {
        e.jump_if_carry(1);
    } else {
        e.jump_if_not_carry(1);
    }
    e.ret();
}

fn ret_unless_reg(e: &mut Emitter, reg: Register, bit: u8, want_set: bool) {
    e.bit_test_reg32(reg, bit);
    if want_set {
        e.jump_if_carry(1);
    } else {
        e.jump_if_not_carry(1);
    }
    e.ret();
}

/// Emits a conditional jump (via `jcc`, a short `jump_if_*` method) that
/// skips exactly the bytes `body` writes, falling through into `body`
/// when the jump is not taken. The jump's displacement is measured after
/// the fact and backpatched, since `body`'s emitted length depends on
/// the ModRM displacement form the host addressing picks — it cannot be
/// assumed to be a fixed number of bytes the way `ret_unless_*` can.
fn skip_forward(e: &mut Emitter, jcc: impl Fn(&mut Emitter, i8), body: impl FnOnce(&mut Emitter)) {
    let patch = e.tell();
    jcc(e, 0);
    let after = e.tell();
    body(e);
    let end = e.tell();
    let disp = i8::try_from(end - after).expect("condition prologue body fits a short jump");
    e.seek(patch);
    jcc(e, disp);
    e.seek(end);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cpsr(n: bool, z: bool, c: bool, v: bool) -> u32 {
        let mut bits = 0u32;
        if n {
            bits |= 1 << ArmCore::N_BIT;
        }
        if z {
            bits |= 1 << ArmCore::Z_BIT;
        }
        if c {
            bits |= 1 << ArmCore::C_BIT;
        }
        if v {
            bits |= 1 << ArmCore::V_BIT;
        }
        bits
    }

    #[test]
    fn eq_and_ne_follow_zero_flag() {
        assert!(check(cpsr(false, true, false, false), 0x0));
        assert!(!check(cpsr(false, false, false, false), 0x0));
        assert!(check(cpsr(false, false, false, false), 0x1));
    }

    #[test]
    fn hi_requires_carry_set_and_zero_clear() {
        assert!(check(cpsr(false, false, true, false), 0x8));
        assert!(!check(cpsr(false, true, true, false), 0x8));
        assert!(!check(cpsr(false, false, false, false), 0x8));
    }

    #[test]
    fn ls_is_the_exact_inverse_of_hi() {
        for n in [false, true] {
            for z in [false, true] {
                for c in [false, true] {
                    for v in [false, true] {
                        let flags = cpsr(n, z, c, v);
                        assert_eq!(check(flags, 0x9), !check(flags, 0x8));
                    }
                }
            }
        }
    }

    #[test]
    fn ge_lt_gt_le_follow_n_xor_v_and_zero() {
        // N==V, Z==0 => GE true, LT false, GT true, LE false.
        let flags = cpsr(true, false, false, true);
        assert!(check(flags, 0xA));
        assert!(!check(flags, 0xB));
        assert!(check(flags, 0xC));
        assert!(!check(flags, 0xD));

        // Z==1 => GT false regardless of N/V, LE true.
        let flags_z = cpsr(true, true, false, true);
        assert!(!check(flags_z, 0xC));
        assert!(check(flags_z, 0xD));
    }

    #[test]
    fn al_is_always_true() {
        assert!(check(0, 0xE));
    }

    #[test]
    fn al_prologue_emits_nothing() {
        let mut e = Emitter::new();
        emit_prologue(&mut e, Register::Rdi, 0, 0xE);
        assert_eq!(e.size(), 0);
    }

    #[test]
    fn eq_prologue_tests_the_zero_bit() {
        let mut e = Emitter::new();
        emit_prologue(&mut e, Register::Rdi, 0, 0x0);
        assert!(e.size() > 0);
        assert_eq!(e.bytes()[0], 0x0F); // bt opcode prefix
    }

    #[test]
    fn ls_prologue_is_longer_than_a_single_flag_test() {
        let mut e = Emitter::new();
        emit_prologue(&mut e, Register::Rdi, 0, 0x9);
        // bt + short jcc + (bt + short jcc + ret), strictly more than the
        // 4-byte single-flag form.
        assert!(e.size() > 4);
    }

    #[test]
    fn le_prologue_computes_n_xor_v() {
        let mut e = Emitter::new();
        emit_prologue(&mut e, Register::Rdi, 0, 0xD);
        assert!(e.size() > 4);
    }
}
