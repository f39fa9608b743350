//! The ARM interpreter fallback (§4.2 "Unimplemented / error", §6
//! `executeInstr`) — also the determinism oracle §8 requires the JIT to
//! agree with bit-for-bit. Every opcode family the emitter (`dataproc`,
//! `loadstore`, `branch`, `status`) knows how to JIT is implemented here
//! too, in plain Rust over the same `ArmCore` fields, so the two paths
//! can be compared directly in tests. Opcodes neither side implements
//! raise `UndefinedInstruction` rather than silently doing nothing.
//!
//! `shift_value`/`add_with_flags`/`sub_with_flags` are `pub(crate)`: they
//! are the pure arithmetic kernel of the ISA (shift boundary rules,
//! NZCV-producing add/subtract) and `thumb`'s own interpreter reuses them
//! rather than re-deriving the same boundary cases for the 16-bit
//! encoding of the same operations.

use dbt_core::{CoreId, ExceptionKind, ExceptionSink, MemoryBackend};
use dbt_mmu::{AccessType, ArmMmu, MmuFault};

use crate::cond;
use crate::state::{ArmCore, Mode};

/// Decodes and executes exactly one ARM instruction, updating `core` and
/// (via `mmu`/`memory`) guest memory, raising exceptions through `sink`
/// on fault or trap. Mirrors the JIT's own decode tree closely enough
/// that `dbt-arm`'s property tests can run both over the same random
/// instruction stream and assert equal end states.
pub fn step(
    core: &mut ArmCore,
    mmu: &mut ArmMmu,
    memory: &mut dyn MemoryBackend,
    sink: &mut dyn ExceptionSink,
    raw: u32,
) {
    let cond_bits = (raw >> 28) as u8;
    if cond_bits != 0xE && !cond::check(core.cpsr, cond_bits) {
        return;
    }

    let class = (raw >> 25) & 0x7;
    match class {
        0b000 | 0b001 => data_processing(core, raw),
        0b010 | 0b011 => load_store_single(core, mmu, memory, sink, raw),
        0b100 => load_store_multiple(core, mmu, memory, sink, raw),
        0b101 => branch(core, raw),
        _ => {
            if (raw & 0x0FFF_FFF0) == 0x012F_FF10 {
                branch_exchange(core, raw);
            } else if (raw & 0x0FBF_0FFF) == 0x010F_0000 {
                mrs(core, raw);
            } else if (raw & 0x0DB0_F000) == 0x0120_F000 {
                msr(core, raw);
            } else if (raw & 0x0F00_0000) == 0x0F00_0000 {
                sink.trigger_exception(CoreId::Arm, ExceptionKind::SoftwareInterrupt);
            } else {
                sink.trigger_exception(CoreId::Arm, ExceptionKind::UndefinedInstruction);
            }
        }
    }
}

fn reg(core: &ArmCore, n: usize) -> u32 {
    core.regs[n]
}

fn set_reg(core: &mut ArmCore, n: usize, value: u32) {
    core.regs[n] = value;
}

/// Operand 2 plus its shifter carry-out, computed purely (no host flags
/// to fold back in — this is the value-level twin of `shifter.rs`).
fn operand2(core: &ArmCore, raw: u32) -> (u32, Option<bool>) {
    let i_bit = (raw >> 25) & 1 != 0;
    if i_bit {
        let rotate = (raw >> 8) & 0xF;
        let imm8 = raw & 0xFF;
        return fold_immediate(rotate, imm8);
    }

    let rm = (raw & 0xF) as usize;
    let kind = (raw >> 5) & 0x3;
    let by_register = (raw >> 4) & 1 != 0;
    let value = reg(core, rm);

    let amount = if by_register {
        let rs = ((raw >> 8) & 0xF) as usize;
        reg(core, rs) & 0xFF
    } else {
        (raw >> 7) & 0x1F
    };

    shift_value(value, kind, amount, !by_register, core.flag(ArmCore::C_BIT))
}

fn fold_immediate(rotate: u32, imm8: u32) -> (u32, Option<bool>) {
    let amount = rotate * 2;
    let value = imm8.rotate_right(amount);
    if amount == 0 {
        (value, None)
    } else {
        (value, Some(value >> 31 != 0))
    }
}

/// `is_imm_shift` distinguishes the immediate-shift encodings (where
/// amount 0 has special meaning per opcode) from the register-shift
/// encodings (where amount 0 always means "no shift, carry untouched").
pub(crate) fn shift_value(value: u32, kind: u32, amount: u32, is_imm_shift: bool, carry_in: bool) -> (u32, Option<bool>) {
    match kind {
        0 => {
            // LSL
            if amount == 0 {
                (value, None)
            } else if amount < 32 {
                (value << amount, Some((value >> (32 - amount)) & 1 != 0))
            } else if amount == 32 {
                (0, Some(value & 1 != 0))
            } else {
                (0, Some(false))
            }
        }
        1 => {
            // LSR
            let amount = if is_imm_shift && amount == 0 { 32 } else { amount };
            if amount == 0 {
                (value, None)
            } else if amount < 32 {
                (value >> amount, Some((value >> (amount - 1)) & 1 != 0))
            } else if amount == 32 {
                (0, Some(value >> 31 != 0))
            } else {
                (0, Some(false))
            }
        }
        2 => {
            // ASR
            let amount = if is_imm_shift && amount == 0 { 32 } else { amount };
            let signed = value as i32;
            if amount == 0 {
                (value, None)
            } else if amount < 32 {
                ((signed >> amount) as u32, Some((value >> (amount - 1)) & 1 != 0))
            } else {
                let filled = if signed < 0 { 0xFFFF_FFFF } else { 0 };
                (filled, Some(signed < 0))
            }
        }
        _ => {
            // ROR, or RRX when amount == 0 in the immediate-shift form.
            if amount == 0 {
                if is_imm_shift {
                    let result = (u32::from(carry_in) << 31) | (value >> 1);
                    (result, Some(value & 1 != 0))
                } else {
                    (value, None)
                }
            } else {
                let amount = amount & 0x1F;
                if amount == 0 {
                    (value, Some(value >> 31 != 0))
                } else {
                    (value.rotate_right(amount), Some((value >> (amount - 1)) & 1 != 0))
                }
            }
        }
    }
}

fn data_processing(core: &mut ArmCore, raw: u32) {
    let opcode = (raw >> 21) & 0xF;
    let s = (raw >> 20) & 1 != 0;
    let rn = ((raw >> 16) & 0xF) as usize;
    let rd = ((raw >> 12) & 0xF) as usize;

    let ignores_rn = opcode == 0xD || opcode == 0xF;
    let is_logical = matches!(opcode, 0x0 | 0x1 | 0x8 | 0x9 | 0xC | 0xD | 0xE | 0xF);
    let is_test = matches!(opcode, 0x8 | 0x9 | 0xA | 0xB);

    let (op2, shifter_carry) = operand2(core, raw);
    let n = if ignores_rn { 0 } else { reg(core, rn) };

    let mut carry_out = core.flag(ArmCore::C_BIT);
    let mut overflow_out = core.flag(ArmCore::V_BIT);
    let result: u32 = match opcode {
        0x0 | 0x8 => n & op2,                   // AND/TST
        0x1 | 0x9 => n ^ op2,                   // EOR/TEQ
        0x2 | 0xA => {
            let (r, c, v) = sub_with_flags(n, op2, true);
            carry_out = c;
            overflow_out = v;
            r
        } // SUB/CMP
        0x3 => {
            let (r, c, v) = sub_with_flags(op2, n, true);
            carry_out = c;
            overflow_out = v;
            r
        } // RSB
        0x4 | 0xB => {
            let (r, c, v) = add_with_flags(n, op2, false);
            carry_out = c;
            overflow_out = v;
            r
        } // ADD/CMN
        0x5 => {
            let (r, c, v) = add_with_flags(n, op2, core.flag(ArmCore::C_BIT));
            carry_out = c;
            overflow_out = v;
            r
        } // ADC
        0x6 => {
            let (r, c, v) = sub_with_flags(n, op2, core.flag(ArmCore::C_BIT));
            carry_out = c;
            overflow_out = v;
            r
        } // SBC
        0x7 => {
            let (r, c, v) = sub_with_flags(op2, n, core.flag(ArmCore::C_BIT));
            carry_out = c;
            overflow_out = v;
            r
        } // RSC
        0xC => n | op2,        // ORR
        0xD => op2,            // MOV
        0xE => n & !op2,       // BIC
        _ => !op2,             // MVN
    };

    if s {
        if is_logical {
            if let Some(c) = shifter_carry {
                carry_out = c;
            }
        }
        core.update_nz(result);
        core.set_flag(ArmCore::C_BIT, carry_out);
        core.set_flag(ArmCore::V_BIT, overflow_out);
    }

    if !is_test {
        set_reg(core, rd, result);
        if rd == ArmCore::PC && s {
            let old = core.mode();
            core.write_bank(old);
            core.cpsr = core.spsr;
            let new = core.mode();
            core.read_bank(new);
        }
    }
}

pub(crate) fn add_with_flags(a: u32, b: u32, carry_in: bool) -> (u32, bool, bool) {
    let (r1, c1) = a.overflowing_add(b);
    let (r2, c2) = r1.overflowing_add(u32::from(carry_in));
    let carry = c1 | c2;
    let overflow = ((a ^ r2) & (b ^ r2)) >> 31 != 0;
    (r2, carry, overflow)
}

/// ARM's SUB family presents carry as NOT borrow: `carry_in` is the
/// guest's CPSR.C going in (for SUB/RSB/CMP, the caller always passes
/// `true` — "no borrow requested" — since those opcodes don't read C at
/// all). `diff = a - b - (1 - carry_in)`, computed in `i128` so the
/// borrow-out (`diff < 0`) is exact regardless of wraparound.
pub(crate) fn sub_with_flags(a: u32, b: u32, carry_in: bool) -> (u32, bool, bool) {
    let borrow_in = i128::from(!carry_in);
    let diff = i128::from(a) - i128::from(b) - borrow_in;
    let no_borrow = diff >= 0;
    let result = diff as u32;
    let overflow = ((a ^ b) & (a ^ result)) >> 31 != 0;
    (result, no_borrow, overflow)
}

fn load_store_single(
    core: &mut ArmCore,
    mmu: &mut ArmMmu,
    memory: &mut dyn MemoryBackend,
    sink: &mut dyn ExceptionSink,
    raw: u32,
) {
    let i_bit = (raw >> 25) & 1 != 0;
    let pre_index = (raw >> 24) & 1 != 0;
    let up = (raw >> 23) & 1 != 0;
    let byte = (raw >> 22) & 1 != 0;
    let write_back = (raw >> 21) & 1 != 0 || !pre_index;
    let is_load = (raw >> 20) & 1 != 0;
    let rn = ((raw >> 16) & 0xF) as usize;
    let rd = ((raw >> 12) & 0xF) as usize;

    let offset = if i_bit {
        let (value, _) = operand2(core, raw & !(1 << 25)); // shifter form, S suppressed
        value
    } else {
        raw & 0xFFF
    };

    let mut addr = reg(core, rn);
    if pre_index {
        addr = if up { addr.wrapping_add(offset) } else { addr.wrapping_sub(offset) };
    }

    let supervisor = core.mode() != Mode::User;
    let access = if is_load { AccessType::DataRead } else { AccessType::DataWrite };
    let paddr = match mmu.translate(&mut *memory, addr, access, supervisor) {
        Ok(p) => p,
        Err(fault) => {
            deliver_mmu_fault(sink, fault);
            return;
        }
    };

    if is_load {
        let value = if byte { u32::from(memory.read_u8(paddr)) } else { memory.read_u32(paddr) };
        set_reg(core, rd, value);
        if rd == ArmCore::PC && !byte {
            if value & 1 != 0 {
                core.set_flag(ArmCore::T_BIT, true);
            }
            set_reg(core, ArmCore::PC, value & !1);
        }
    } else {
        let value = reg(core, rd);
        if byte {
            memory.write_u8(paddr, value as u8);
        } else {
            memory.write_u32(paddr, value);
        }
    }

    if write_back {
        let final_addr = if pre_index {
            addr
        } else if up {
            reg(core, rn).wrapping_add(offset)
        } else {
            reg(core, rn).wrapping_sub(offset)
        };
        set_reg(core, rn, final_addr);
    }
}

fn load_store_multiple(
    core: &mut ArmCore,
    mmu: &mut ArmMmu,
    memory: &mut dyn MemoryBackend,
    sink: &mut dyn ExceptionSink,
    raw: u32,
) {
    let pre_index = (raw >> 24) & 1 != 0;
    let up = (raw >> 23) & 1 != 0;
    let write_back = (raw >> 21) & 1 != 0;
    let is_load = (raw >> 20) & 1 != 0;
    let rn = ((raw >> 16) & 0xF) as usize;
    let reg_list = raw & 0xFFFF;

    let mut regs: Vec<usize> = (0..16).filter(|r| reg_list & (1 << r) != 0).collect();
    if !up {
        regs.reverse();
    }

    let mut addr = reg(core, rn);
    let supervisor = core.mode() != Mode::User;
    for r in &regs {
        if pre_index {
            addr = addr.wrapping_add(4);
        }
        let access = if is_load { AccessType::DataRead } else { AccessType::DataWrite };
        let paddr = match mmu.translate(&mut *memory, addr, access, supervisor) {
            Ok(p) => p,
            Err(fault) => {
                deliver_mmu_fault(sink, fault);
                return;
            }
        };
        if is_load {
            let value = memory.read_u32(paddr);
            set_reg(core, *r, value);
        } else {
            memory.write_u32(paddr, reg(core, *r));
        }
        if !pre_index {
            addr = addr.wrapping_add(4);
        }
    }

    if write_back {
        set_reg(core, rn, addr);
    }

    if is_load && reg_list & (1 << ArmCore::PC) != 0 {
        let old = core.mode();
        core.write_bank(old);
        core.cpsr = core.spsr;
        let new = core.mode();
        core.read_bank(new);
    }
}

fn branch(core: &mut ArmCore, raw: u32) {
    let link = (raw >> 24) & 1 != 0;
    let offset24 = raw & 0x00FF_FFFF;
    let signed = ((offset24 << 8) as i32) >> 8;
    let pc = reg(core, ArmCore::PC);
    let target = pc.wrapping_add(4).wrapping_add((signed << 2) as u32);
    if link {
        set_reg(core, ArmCore::LR, pc.wrapping_add(4));
    }
    set_reg(core, ArmCore::PC, target);
}

fn branch_exchange(core: &mut ArmCore, raw: u32) {
    let rm = (raw & 0xF) as usize;
    let target = reg(core, rm);
    core.set_flag(ArmCore::T_BIT, target & 1 != 0);
    set_reg(core, ArmCore::PC, target & !1);
}

fn mrs(core: &mut ArmCore, raw: u32) {
    let use_spsr = (raw >> 22) & 1 != 0;
    let rd = ((raw >> 12) & 0xF) as usize;
    set_reg(core, rd, if use_spsr { core.spsr } else { core.cpsr });
}

fn msr(core: &mut ArmCore, raw: u32) {
    let use_spsr = (raw >> 22) & 1 != 0;
    let i_bit = (raw >> 25) & 1 != 0;
    let field_bits = (raw >> 16) & 0xF;
    let mut mask = 0u32;
    if field_bits & 0x1 != 0 {
        mask |= 0x0000_00FF;
    }
    if field_bits & 0x2 != 0 {
        mask |= 0x0000_FF00;
    }
    if field_bits & 0x4 != 0 {
        mask |= 0x00FF_0000;
    }
    if field_bits & 0x8 != 0 {
        mask |= 0xFF00_0000;
    }

    let operand = if i_bit {
        let rotate = (raw >> 8) & 0xF;
        let imm8 = raw & 0xFF;
        fold_immediate(rotate, imm8).0
    } else {
        reg(core, (raw & 0xF) as usize)
    };

    if use_spsr {
        core.spsr = (core.spsr & !mask) | (operand & mask);
    } else {
        let touches_mode = mask & 0xFF != 0;
        if touches_mode {
            let old = core.mode();
            core.write_bank(old);
        }
        core.cpsr = (core.cpsr & !mask) | (operand & mask);
        if touches_mode {
            let new = core.mode();
            core.read_bank(new);
        }
    }
}

pub(crate) fn deliver_mmu_fault(sink: &mut dyn ExceptionSink, fault: MmuFault) {
    let kind = match fault {
        MmuFault::Arm { prefetch: true, .. } => ExceptionKind::PrefetchAbort,
        MmuFault::Arm { prefetch: false, .. } => ExceptionKind::DataAbort,
        MmuFault::Ppc { .. } => unreachable!("ARM interpreter never produces a PPC fault"),
    };
    sink.trigger_exception(CoreId::Arm, kind);
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
    fn mov_immediate_sets_the_register() {
        let mut core = ArmCore::new();
        let mut mmu = ArmMmu::new();
        let mut mem = FlatMemory::new(0x10);
        let mut sink = NullSink;
        // MOV R0, #5 (AL, I=1, opcode=MOV, S=0)
        let raw = 0xE3A0_0005;
        step(&mut core, &mut mmu, &mut mem, &mut sink, raw);
        assert_eq!(core.regs[0], 5);
    }

    #[test]
    fn add_sets_carry_on_overflow() {
        let mut core = ArmCore::new();
        core.regs[0] = 0xFFFF_FFFF;
        core.regs[1] = 1;
        let mut mmu = ArmMmu::new();
        let mut mem = FlatMemory::new(0x10);
        let mut sink = NullSink;
        // ADDS R2, R0, R1
        let raw = 0xE090_2001;
        step(&mut core, &mut mmu, &mut mem, &mut sink, raw);
        assert_eq!(core.regs[2], 0);
        assert!(core.flag(ArmCore::C_BIT));
        assert!(core.flag(ArmCore::Z_BIT));
    }

    #[test]
    fn branch_targets_pc_plus_eight_equivalent() {
        let mut core = ArmCore::new();
        core.regs[ArmCore::PC] = 0x8000;
        let mut mmu = ArmMmu::new();
        let mut mem = FlatMemory::new(0x10);
        let mut sink = NullSink;
        // B #0
        let raw = 0xEA00_0000;
        step(&mut core, &mut mmu, &mut mem, &mut sink, raw);
        assert_eq!(core.regs[ArmCore::PC], 0x8004);
    }

    #[test]
    fn condition_failure_skips_execution_entirely() {
        let mut core = ArmCore::new();
        core.set_flag(ArmCore::Z_BIT, false);
        let mut mmu = ArmMmu::new();
        let mut mem = FlatMemory::new(0x10);
        let mut sink = NullSink;
        // MOVEQ R0, #5 (cond=EQ, Z clear -> not taken)
        let raw = 0x03A0_0005;
        step(&mut core, &mut mmu, &mut mem, &mut sink, raw);
        assert_eq!(core.regs[0], 0);
    }
}
