//! The small set of opcodes §4.4 requires to be fast-emitted rather than
//! routed through the interpreter: `addi/addis`, the immediate logical
//! family, `rlwimi/rlwinm`, `add`, the byteswapped indexed loads/stores,
//! and the D-form float loads/stores. `b`/`bc` live in `branch.rs`; the
//! no-op family (`sync`/`isync`/`eieio`/`dcbst`/`dcbf`/`dcbi`/`dcbz_l`)
//! needs no emitter at all — `ppc::compile_page` already appends an
//! unconditional `RET` after every body, so the dispatcher just emits
//! nothing for them.
//!
//! Every field this module reads out of `raw` (register numbers, shift
//! amounts, immediates) is a compile-time constant by the time these
//! functions run — the trampoline compiler calls them once per guest
//! word, not once per execution — so there is no runtime decode cost for
//! any of it, the same trick `dbt-arm::shifter::fold_immediate` relies on.

use dbt_x86_emit::{Emitter, Register};

use crate::state::PpcCore;

fn reg_offset(n: u32) -> i32 {
    PpcCore::reg_offset(n as usize)
}

/// Loads `GPR[ra]` into `Rax`, or `mov`s a literal zero if `ra == 0` —
/// PowerPC hardwires `r0` to zero in every base-register position (but not
/// as a destination), so folding this at compile time avoids a dead load.
fn load_ra_or_zero(e: &mut Emitter, p: Register, ra: u32) {
    if ra == 0 {
        e.mov_imm32(Register::Rax, 0);
    } else {
        e.load_mem32(Register::Rax, p, reg_offset(ra));
    }
}

/// `addi`/`addis` (opcodes 14/15, D-form): `rt = (ra == 0 ? 0 : GPR[ra]) +
/// SIMM`, `addis` additionally shifting `SIMM` left 16 before the add.
pub fn emit_addi(e: &mut Emitter, p: Register, raw: u32, shifted: bool) {
    let rt = (raw >> 21) & 0x1F;
    let ra = (raw >> 16) & 0x1F;
    let imm = raw & 0xFFFF;
    let simm = if shifted { imm << 16 } else { (imm as i16) as i32 as u32 };

    if ra == 0 {
        e.mov_imm32(Register::Rax, simm);
    } else {
        e.load_mem32(Register::Rax, p, reg_offset(ra));
        e.add_reg_imm32(Register::Rax, simm);
    }
    e.store_mem32(p, reg_offset(rt), Register::Rax);
}

/// `ori`/`oris`/`xori`/`xoris` (opcodes 24/25/26/27): `ra = rs <op> UIMM`,
/// zero-extended, `*is`'s immediate shifted left 16. Unlike the signed
/// `addi` family these never sign-extend the immediate.
pub fn emit_logical_immediate(e: &mut Emitter, p: Register, raw: u32, xor: bool, shifted: bool) {
    let rs = (raw >> 21) & 0x1F;
    let ra = (raw >> 16) & 0x1F;
    let imm = raw & 0xFFFF;
    let uimm = if shifted { imm << 16 } else { imm };

    e.load_mem32(Register::Rax, p, reg_offset(rs));
    if xor {
        e.xor_reg_imm32(Register::Rax, uimm);
    } else {
        e.or_reg_imm32(Register::Rax, uimm);
    }
    e.store_mem32(p, reg_offset(ra), Register::Rax);
}

/// `andi.`/`andis.` (opcodes 28/29): like the other logical-immediate
/// forms but the `.` is baked into the opcode itself rather than gated by
/// a trailing `Rc` bit, so `cr0` is unconditionally recorded.
pub fn emit_and_immediate_dot(e: &mut Emitter, p: Register, raw: u32, cr_offset: i32, shifted: bool) {
    let rs = (raw >> 21) & 0x1F;
    let ra = (raw >> 16) & 0x1F;
    let imm = raw & 0xFFFF;
    let uimm = if shifted { imm << 16 } else { imm };

    e.load_mem32(Register::Rax, p, reg_offset(rs));
    e.and_reg_imm32(Register::Rax, uimm);
    e.store_mem32(p, reg_offset(ra), Register::Rax);
    record_cr0(e, p, cr_offset, Register::Rax);
}

/// PowerPC's mask-generation primitive (`MASK(mb, me)` in the ISA manual):
/// the set of bits from `mb` to `me` inclusive, bit 0 being the MSB, with
/// the usual wrap-around reading when `mb > me`.
#[must_use]
pub fn mask(mb: u32, me: u32) -> u32 {
    let mb = mb & 31;
    let me = me & 31;
    let begin = if mb == 0 { 0xFFFF_FFFFu32 } else { 0xFFFF_FFFFu32 >> mb };
    let end = if me == 31 { 0xFFFF_FFFFu32 } else { 0xFFFF_FFFFu32 << (31 - me) };
    if mb <= me {
        begin & end
    } else {
        begin | end
    }
}

/// `rlwinm`/`rlwimi` (opcodes 21/20, M-form): rotate `rs` left by `sh`,
/// mask to `[mb, me]`; `rlwimi` additionally merges in the untouched bits
/// of the existing `ra` rather than zeroing them.
pub fn emit_rlw(e: &mut Emitter, p: Register, raw: u32, cr_offset: i32, insert: bool) {
    let rs = (raw >> 21) & 0x1F;
    let ra = (raw >> 16) & 0x1F;
    let sh = ((raw >> 11) & 0x1F) as u8;
    let mb = (raw >> 6) & 0x1F;
    let me = (raw >> 1) & 0x1F;
    let rc = raw & 1 != 0;
    let m = mask(mb, me);

    e.load_mem32(Register::Rax, p, reg_offset(rs));
    if sh != 0 {
        e.rol_imm32(Register::Rax, sh);
    }
    e.and_reg_imm32(Register::Rax, m);
    if insert {
        e.load_mem32(Register::Rdx, p, reg_offset(ra));
        e.and_reg_imm32(Register::Rdx, !m);
        e.or_reg_reg32(Register::Rax, Register::Rdx);
    }
    e.store_mem32(p, reg_offset(ra), Register::Rax);
    if rc {
        record_cr0(e, p, cr_offset, Register::Rax);
    }
}

/// `add` (opcode 31, xo 266, no `OE`): `rd = GPR[ra] + GPR[rb]`. Overflow
/// (`OE`) is left to the interpreter — no fast-emitted caller in the
/// trampoline compiler sets `OE` for this opcode (see `ppc::emit_instruction`).
pub fn emit_add(e: &mut Emitter, p: Register, raw: u32, cr_offset: i32) {
    let rd = (raw >> 21) & 0x1F;
    let ra = (raw >> 16) & 0x1F;
    let rb = (raw >> 11) & 0x1F;
    let rc = raw & 1 != 0;

    e.load_mem32(Register::Rax, p, reg_offset(ra));
    e.load_mem32(Register::Rdx, p, reg_offset(rb));
    e.add_reg_reg32(Register::Rax, Register::Rdx);
    e.store_mem32(p, reg_offset(rd), Register::Rax);
    if rc {
        record_cr0(e, p, cr_offset, Register::Rax);
    }
}

/// Emits `jcc rel8` with a placeholder displacement, runs `body`, then
/// backpatches the jump to land just past it — the same forward-skip
/// shape `dbt-arm::cond::skip_forward` uses for its OR-shaped conditions.
fn skip_forward(e: &mut Emitter, jcc: impl Fn(&mut Emitter, i8), body: impl FnOnce(&mut Emitter)) {
    let patch = e.tell();
    jcc(e, 0);
    let after = e.tell();
    body(e);
    let end = e.tell();
    let disp = i8::try_from(end - after).expect("fastops backpatch body fits a short jump");
    e.seek(patch);
    jcc(e, disp);
    e.seek(end);
}

/// Folds a 32-bit result into `cr0`'s LT/GT/EQ the same way
/// `PpcCore::update_cr0` does interpreted, leaving SO alone. Three
/// independent comparisons against the same result rather than one
/// three-way branch — simpler to backpatch, and the extra `cmp`s are
/// cheap next to the helper calls and MMU walks elsewhere in these bodies.
fn record_cr0(e: &mut Emitter, p: Register, cr_offset: i32, result: Register) {
    e.and_mem_imm32(p, cr_offset, !(PpcCore::LT | PpcCore::GT | PpcCore::EQ));

    e.compare_imm32(result, 0);
    skip_forward(e, Emitter::jump_if_not_sign, |e| {
        e.or_mem_imm32(p, cr_offset, PpcCore::LT);
    });

    e.compare_imm32(result, 0);
    skip_forward(e, Emitter::jump_if_sign, |e| {
        skip_forward(e, Emitter::jump_if_zero, |e| {
            e.or_mem_imm32(p, cr_offset, PpcCore::GT);
        });
    });

    e.compare_imm32(result, 0);
    skip_forward(e, Emitter::jump_if_not_zero, |e| {
        e.or_mem_imm32(p, cr_offset, PpcCore::EQ);
    });
}

/// Emits the shared tail of every memory-helper call: test the returned
/// bool (left in `Rdx` by the caller, since `Rax` gets clobbered restoring
/// the address/value registers first) and `RET` immediately without
/// writeback on a fault, exactly as `dbt-arm::loadstore` does.
fn bail_on_fault(e: &mut Emitter) {
    e.test_reg32(Register::Rdx, Register::Rdx);
    skip_forward(e, Emitter::jump_if_not_zero, Emitter::ret);
}

/// `lwbrx`/`stwbrx` (opcode 31, xo 534/662, X-form): indexed load/store
/// with the byte order flipped relative to every other PowerPC access —
/// `MemoryBackend` always hands back/expects the big-endian guest view, so
/// the fix-up is a single `bswap` around the ordinary helper call.
pub fn emit_lwbrx(e: &mut Emitter, p: Register, raw: u32, load_helper: u64) {
    let rt = (raw >> 21) & 0x1F;
    let ra = (raw >> 16) & 0x1F;
    let rb = (raw >> 11) & 0x1F;

    load_ra_or_zero(e, p, ra);
    e.load_mem32(Register::Rdx, p, reg_offset(rb));
    e.add_reg_reg32(Register::Rax, Register::Rdx);

    e.push_reg64(p);
    e.push_reg64(Register::Rax); // keep the address for the final store
    e.mov_reg64(Register::Rsi, Register::Rax); // arg1: addr
    e.push_reg64(Register::Rax); // scratch out-slot
    e.lea64(Register::Rdx, Register::Rsp, 0); // arg2: &mut out
    e.call_abs(Register::Rax, load_helper);
    e.pop_reg64(Register::Rcx); // loaded value
    e.mov_reg64(Register::Rdx, Register::Rax); // save the fault bool
    e.pop_reg64(Register::Rax); // restore address (unused here, but keeps the stack discipline explicit)
    e.pop_reg64(p);

    bail_on_fault(e);

    e.swap32(Register::Rcx);
    e.store_mem32(p, reg_offset(rt), Register::Rcx);
}

pub fn emit_stwbrx(e: &mut Emitter, p: Register, raw: u32, store_helper: u64) {
    let rs = (raw >> 21) & 0x1F;
    let ra = (raw >> 16) & 0x1F;
    let rb = (raw >> 11) & 0x1F;

    load_ra_or_zero(e, p, ra);
    e.load_mem32(Register::Rdx, p, reg_offset(rb));
    e.add_reg_reg32(Register::Rax, Register::Rdx);

    e.load_mem32(Register::Rdx, p, reg_offset(rs));
    e.swap32(Register::Rdx);

    e.push_reg64(p);
    e.mov_reg64(Register::Rsi, Register::Rax); // arg1: addr
    e.call_abs(Register::Rax, store_helper);
    e.mov_reg64(Register::Rdx, Register::Rax); // save the fault bool
    e.pop_reg64(p);

    bail_on_fault(e);
}

/// `lfs`/`lfd`/`lfsu`/`lfdu`/`stfs`/`stfd`/`stfsu`/`stfdu` (opcodes 48-55,
/// D-form). Neither named helper in the fetch/execute table can carry
/// this: `loadMemory<T>`/`storeMemory<T>` only move 32 bits through their
/// out/value slot, and a single-precision load needs an actual numeric
/// single-to-double conversion on its way into the 64-bit `Fpr` storage,
/// not just a bit reinterpretation — something this integer-only emitter
/// has no instruction for. `load_fpr`/`store_fpr` are this crate's own
/// helpers (see `helpers.rs`, and `DESIGN.md` for why they exist
/// alongside the spec-named table): the conversion and the width happen
/// in the Rust helper body, keyed by the `frt`/`is_double` values the
/// emitted call passes as extra arguments.
#[allow(clippy::too_many_arguments)]
pub fn emit_float_access(
    e: &mut Emitter,
    p: Register,
    raw: u32,
    is_double: bool,
    is_load: bool,
    update: bool,
    load_fpr_helper: u64,
    store_fpr_helper: u64,
) {
    let frt = (raw >> 21) & 0x1F;
    let ra = (raw >> 16) & 0x1F;
    let d = ((raw & 0xFFFF) as i16) as i32 as u32;

    load_ra_or_zero(e, p, ra);
    e.add_reg_imm32(Register::Rax, d);

    if update {
        e.store_mem32(p, reg_offset(ra), Register::Rax);
    }

    e.push_reg64(p);
    e.mov_reg64(Register::Rsi, Register::Rax); // arg1: addr
    e.mov_imm32(Register::Rdx, frt); // arg2: target FPR index
    e.mov_imm32(Register::Rcx, u32::from(is_double)); // arg3: width
    let helper = if is_load { load_fpr_helper } else { store_fpr_helper };
    e.call_abs(Register::Rax, helper);
    e.mov_reg64(Register::Rdx, Register::Rax);
    e.pop_reg64(p);

    bail_on_fault(e);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn addi_with_ra_zero_folds_to_a_literal() {
        let mut e = Emitter::new();
        emit_addi(&mut e, Register::Rdi, (5 << 21) | (0 << 16) | 0x10, false);
        assert!(e.size() > 0);
    }

    #[test]
    fn addis_shifts_the_immediate_left_sixteen() {
        let mut e1 = Emitter::new();
        emit_addi(&mut e1, Register::Rdi, (5 << 21) | (3 << 16) | 1, false);
        let mut e2 = Emitter::new();
        emit_addi(&mut e2, Register::Rdi, (5 << 21) | (3 << 16) | 1, true);
        assert_ne!(e1.bytes(), e2.bytes());
    }

    #[test]
    fn mask_handles_the_non_wrapping_case() {
        assert_eq!(mask(0, 31), 0xFFFF_FFFF);
        assert_eq!(mask(0, 0), 0x8000_0000);
        assert_eq!(mask(31, 31), 1);
    }

    #[test]
    fn mask_handles_the_wrap_around_case() {
        // mb > me: bits [mb..31] union [0..me]
        let m = mask(30, 1);
        assert_eq!(m & 0x8000_0000, 0x8000_0000);
        assert_eq!(m & 1, 1);
        assert_eq!(m & 0x4000_0000, 0); // bit index 1 (me=1) is the last set bit from the low side
    }

    #[test]
    fn rlwinm_clears_bits_outside_the_mask() {
        let mut e = Emitter::new();
        // rlwinm r3, r4, 0, 0, 0 -> ra = rs & 0x8000_0000
        let raw = (4 << 21) | (3 << 16) | (0 << 11) | (0 << 6) | (0 << 1);
        emit_rlw(&mut e, Register::Rdi, raw, 0, false);
        assert!(e.size() > 0);
    }

    #[test]
    fn add_records_cr0_only_when_rc_is_set() {
        let mut without_rc = Emitter::new();
        emit_add(&mut without_rc, Register::Rdi, (3 << 21) | (4 << 16) | (5 << 11), 0);
        let mut with_rc = Emitter::new();
        emit_add(&mut with_rc, Register::Rdi, (3 << 21) | (4 << 16) | (5 << 11) | 1, 0);
        assert!(with_rc.size() > without_rc.size());
    }

    #[test]
    fn lwbrx_emits_a_nonempty_body() {
        let mut e = Emitter::new();
        emit_lwbrx(&mut e, Register::Rdi, (3 << 21) | (0 << 16) | (4 << 11), 0x1000);
        assert!(e.size() > 0);
    }

    #[test]
    fn float_access_emits_a_nonempty_body_for_every_combination() {
        let mut e = Emitter::new();
        emit_float_access(&mut e, Register::Rdi, (1 << 21) | (2 << 16) | 4, true, true, false, 0x1000, 0x2000);
        assert!(e.size() > 0);
    }
}
