//! The Thumb (16-bit) decoder (§4.3): same structure and conventions as
//! `a32` but twice the instruction density, reusing `a32::HelperTable`
//! and several of `a32`'s sibling modules (`cond`, `dataproc::emit_subtract`,
//! `flags`, `shifter`) directly rather than re-deriving their logic for a
//! narrower encoding.
//!
//! A guest page here is 2 KiB of halfwords (`SLOTS_PER_PAGE` = 2048), so
//! the trampoline table is twice as long as `a32`'s for the same guest
//! byte range, at the same fixed 5-byte cell size.

use dbt_core::{CoreId, ExceptionKind, ExceptionSink, MemoryBackend};
use dbt_mmu::{AccessType, ArmMmu};
use dbt_x86_emit::{Emitter, Register};

use crate::a32::HelperTable;
use crate::dataproc;
use crate::flags;
use crate::shifter::{self, ShiftKind};
use crate::state::ArmCore;

/// Number of 16-bit instruction slots per guest page (2 KiB / 2 B).
pub const SLOTS_PER_PAGE: usize = 0x800;
/// Same fixed cell size as `a32` — a near `JMP rel32`.
pub const TRAMPOLINE_CELL_BYTES: usize = 5;
const TRAMPOLINE_TABLE_BYTES: usize = SLOTS_PER_PAGE * TRAMPOLINE_CELL_BYTES;

/// Compiles one 2 KiB guest page of Thumb halfwords into the same
/// trampoline-table-plus-bodies layout `a32::compile_page` produces.
pub fn compile_page(e: &mut Emitter, p: Register, page_base: u32, halfwords: &[u16], helpers: &HelperTable) -> usize {
    debug_assert_eq!(halfwords.len(), SLOTS_PER_PAGE);

    let block_start = e.tell();
    e.seek(block_start + TRAMPOLINE_TABLE_BYTES);

    let mut body_offsets = [0usize; SLOTS_PER_PAGE];
    for (i, &raw) in halfwords.iter().enumerate() {
        body_offsets[i] = e.tell() - block_start;
        let pc = page_base.wrapping_add((i as u32) * 2);
        emit_instruction(e, p, raw, pc, helpers);
    }
    let block_end = e.tell();

    for i in 0..SLOTS_PER_PAGE {
        let cell_start = block_start + i * TRAMPOLINE_CELL_BYTES;
        let rel = (body_offsets[i] as i64 - (cell_start - block_start) as i64 - TRAMPOLINE_CELL_BYTES as i64) as i32;
        e.seek(cell_start);
        e.jump_rel_near(rel);
    }

    e.seek(block_end);
    block_end - block_start
}

/// Cascaded prefix match over the top bits, in the same order §4.3
/// enumerates the formats. Formats not fast-emitted here route through
/// `emit_interpreter_fallback`, same convention as `a32`'s multiply/swap/
/// extra-load-store opcodes.
fn emit_instruction(e: &mut Emitter, p: Register, raw: u16, pc: u32, helpers: &HelperTable) {
    if raw & 0xF800 == 0x1800 {
        emit_add_subtract(e, p, raw);
    } else if raw & 0xE000 == 0x0000 {
        emit_move_shifted_register(e, p, raw);
    } else if raw & 0xE000 == 0x2000 {
        emit_move_compare_add_subtract_immediate(e, p, raw);
    } else if raw & 0xFC00 == 0x4000 {
        emit_alu_operation(e, p, raw);
    } else if raw & 0xFC00 == 0x4400 {
        emit_hi_register_operation_or_bx(e, p, raw, pc);
    } else if raw & 0xF000 == 0xD000 {
        let cond = ((raw >> 8) & 0xF) as u8;
        match cond {
            0xE => emit_undefined(e, p, helpers),
            0xF => emit_swi(e, p, helpers),
            _ => emit_conditional_branch(e, p, raw, pc, cond),
        }
    } else if raw & 0xF800 == 0xE000 {
        emit_unconditional_branch(e, p, raw, pc);
    } else if raw & 0xF000 == 0xF000 {
        emit_long_branch_with_link(e, p, raw, pc);
    } else {
        emit_interpreter_fallback(e, p, raw, helpers);
    }

    // Same dead-code tolerance as `a32::emit_instruction`: branches, SWI,
    // undefined, and the fallback already end in their own `RET`.
    e.ret();
}

fn emit_move_shifted_register(e: &mut Emitter, p: Register, raw: u16) {
    let op = (raw >> 11) & 0x3;
    let offset5 = u32::from((raw >> 6) & 0x1F);
    let rs = usize::from((raw >> 3) & 0x7);
    let rd = usize::from(raw & 0x7);
    let kind = match op {
        0 => ShiftKind::Lsl,
        1 => ShiftKind::Lsr,
        _ => ShiftKind::Asr,
    };

    let cpsr_off = ArmCore::cpsr_offset();
    shifter::emit_shift_by_imm(e, p, Register::Rax, ArmCore::reg_offset(rs), kind, offset5, true, cpsr_off);
    e.store_mem32(p, ArmCore::reg_offset(rd), Register::Rax);
    flags::generate_flags_update(e, p, cpsr_off, Register::Rax);
}

fn emit_add_subtract(e: &mut Emitter, p: Register, raw: u16) {
    let i_bit = (raw >> 10) & 1 != 0;
    let is_sub = (raw >> 9) & 1 != 0;
    let rn_or_imm = usize::from((raw >> 6) & 0x7);
    let rs = usize::from((raw >> 3) & 0x7);
    let rd = usize::from(raw & 0x7);
    let cpsr_off = ArmCore::cpsr_offset();

    e.load_mem32(Register::Rdx, p, ArmCore::reg_offset(rs));
    if i_bit {
        e.mov_imm32(Register::Rax, rn_or_imm as u32);
    } else {
        e.load_mem32(Register::Rax, p, ArmCore::reg_offset(rn_or_imm));
    }

    if is_sub {
        dataproc::emit_subtract(e, p, cpsr_off, Register::Rdx, Register::Rax, false);
    } else {
        e.add_reg_reg32(Register::Rdx, Register::Rax);
    }
    flags::generate_carry_overflow_update(e, p, cpsr_off);
    e.store_mem32(p, ArmCore::reg_offset(rd), Register::Rdx);
    flags::generate_flags_update(e, p, cpsr_off, Register::Rdx);
}

fn emit_move_compare_add_subtract_immediate(e: &mut Emitter, p: Register, raw: u16) {
    let op = (raw >> 11) & 0x3;
    let rd = usize::from((raw >> 8) & 0x7);
    let imm8 = u32::from(raw & 0xFF);
    let cpsr_off = ArmCore::cpsr_offset();
    let rd_off = ArmCore::reg_offset(rd);

    match op {
        0b00 => {
            // MOV: N/Z only, C/V untouched.
            e.mov_imm32(Register::Rax, imm8);
            e.store_mem32(p, rd_off, Register::Rax);
            flags::generate_flags_update(e, p, cpsr_off, Register::Rax);
        }
        0b01 => {
            // CMP: discards the result, keeps the flags.
            e.load_mem32(Register::Rax, p, rd_off);
            e.mov_imm32(Register::Rdx, imm8);
            dataproc::emit_subtract(e, p, cpsr_off, Register::Rax, Register::Rdx, false);
            flags::generate_carry_overflow_update(e, p, cpsr_off);
            flags::generate_flags_update(e, p, cpsr_off, Register::Rax);
        }
        0b10 => {
            e.load_mem32(Register::Rax, p, rd_off);
            e.add_reg_imm32(Register::Rax, imm8);
            flags::generate_carry_overflow_update(e, p, cpsr_off);
            e.store_mem32(p, rd_off, Register::Rax);
            flags::generate_flags_update(e, p, cpsr_off, Register::Rax);
        }
        _ => {
            e.load_mem32(Register::Rax, p, rd_off);
            e.mov_imm32(Register::Rdx, imm8);
            dataproc::emit_subtract(e, p, cpsr_off, Register::Rax, Register::Rdx, false);
            flags::generate_carry_overflow_update(e, p, cpsr_off);
            e.store_mem32(p, rd_off, Register::Rax);
            flags::generate_flags_update(e, p, cpsr_off, Register::Rax);
        }
    }
}

/// The 16-opcode R-R ALU form. Unlike `a32`'s 16 opcodes these never
/// read an immediate and always write back to `Rd` (except the two
/// test-only forms, TST/CMP).
fn emit_alu_operation(e: &mut Emitter, p: Register, raw: u16) {
    let op = (raw >> 6) & 0xF;
    let rs_off = ArmCore::reg_offset(usize::from((raw >> 3) & 0x7));
    let rd_off = ArmCore::reg_offset(usize::from(raw & 0x7));
    let cpsr_off = ArmCore::cpsr_offset();

    match op {
        0x0 => {
            // AND
            e.load_mem32(Register::Rax, p, rd_off);
            e.load_mem32(Register::Rdx, p, rs_off);
            e.and_reg_reg32(Register::Rax, Register::Rdx);
            e.store_mem32(p, rd_off, Register::Rax);
            flags::generate_flags_update(e, p, cpsr_off, Register::Rax);
        }
        0x1 => {
            // EOR
            e.load_mem32(Register::Rax, p, rd_off);
            e.load_mem32(Register::Rdx, p, rs_off);
            e.xor_reg_reg32(Register::Rax, Register::Rdx);
            e.store_mem32(p, rd_off, Register::Rax);
            flags::generate_flags_update(e, p, cpsr_off, Register::Rax);
        }
        0x2 => emit_shift_reg_op(e, p, rd_off, rs_off, ShiftKind::Lsl, cpsr_off),
        0x3 => emit_shift_reg_op(e, p, rd_off, rs_off, ShiftKind::Lsr, cpsr_off),
        0x4 => emit_shift_reg_op(e, p, rd_off, rs_off, ShiftKind::Asr, cpsr_off),
        0x5 => {
            // ADC
            e.load_mem32(Register::Rax, p, rd_off);
            e.load_mem32(Register::Rdx, p, rs_off);
            e.bit_test_mem32(p, cpsr_off, ArmCore::C_BIT as u8);
            e.adc_reg_reg32(Register::Rax, Register::Rdx);
            flags::generate_carry_overflow_update(e, p, cpsr_off);
            e.store_mem32(p, rd_off, Register::Rax);
            flags::generate_flags_update(e, p, cpsr_off, Register::Rax);
        }
        0x6 => {
            // SBC
            e.load_mem32(Register::Rax, p, rd_off);
            e.load_mem32(Register::Rdx, p, rs_off);
            dataproc::emit_subtract(e, p, cpsr_off, Register::Rax, Register::Rdx, true);
            flags::generate_carry_overflow_update(e, p, cpsr_off);
            e.store_mem32(p, rd_off, Register::Rax);
            flags::generate_flags_update(e, p, cpsr_off, Register::Rax);
        }
        0x7 => emit_shift_reg_op(e, p, rd_off, rs_off, ShiftKind::Ror, cpsr_off),
        0x8 => {
            // TST
            e.load_mem32(Register::Rax, p, rd_off);
            e.load_mem32(Register::Rdx, p, rs_off);
            e.and_reg_reg32(Register::Rax, Register::Rdx);
            flags::generate_flags_update(e, p, cpsr_off, Register::Rax);
        }
        0x9 => {
            // NEG: Rd = 0 - Rs
            e.mov_imm32(Register::Rax, 0);
            e.load_mem32(Register::Rdx, p, rs_off);
            dataproc::emit_subtract(e, p, cpsr_off, Register::Rax, Register::Rdx, false);
            flags::generate_carry_overflow_update(e, p, cpsr_off);
            e.store_mem32(p, rd_off, Register::Rax);
            flags::generate_flags_update(e, p, cpsr_off, Register::Rax);
        }
        0xA => {
            // CMP
            e.load_mem32(Register::Rax, p, rd_off);
            e.load_mem32(Register::Rdx, p, rs_off);
            dataproc::emit_subtract(e, p, cpsr_off, Register::Rax, Register::Rdx, false);
            flags::generate_carry_overflow_update(e, p, cpsr_off);
            flags::generate_flags_update(e, p, cpsr_off, Register::Rax);
        }
        0xB => {
            // CMN
            e.load_mem32(Register::Rax, p, rd_off);
            e.load_mem32(Register::Rdx, p, rs_off);
            e.add_reg_reg32(Register::Rax, Register::Rdx);
            flags::generate_carry_overflow_update(e, p, cpsr_off);
            flags::generate_flags_update(e, p, cpsr_off, Register::Rax);
        }
        0xC => {
            // ORR
            e.load_mem32(Register::Rax, p, rd_off);
            e.load_mem32(Register::Rdx, p, rs_off);
            e.or_reg_reg32(Register::Rax, Register::Rdx);
            e.store_mem32(p, rd_off, Register::Rax);
            flags::generate_flags_update(e, p, cpsr_off, Register::Rax);
        }
        0xD => {
            // MUL: low 32 bits only, C/V left alone per ARMv4T.
            e.load_mem32(Register::Rax, p, rd_off);
            e.load_mem32(Register::Rdx, p, rs_off);
            e.mul_reg32(Register::Rdx);
            e.store_mem32(p, rd_off, Register::Rax);
            flags::generate_flags_update(e, p, cpsr_off, Register::Rax);
        }
        0xE => {
            // BIC
            e.load_mem32(Register::Rax, p, rd_off);
            e.load_mem32(Register::Rdx, p, rs_off);
            e.not_reg32(Register::Rdx);
            e.and_reg_reg32(Register::Rax, Register::Rdx);
            e.store_mem32(p, rd_off, Register::Rax);
            flags::generate_flags_update(e, p, cpsr_off, Register::Rax);
        }
        _ => {
            // MVN
            e.load_mem32(Register::Rax, p, rs_off);
            e.not_reg32(Register::Rax);
            e.store_mem32(p, rd_off, Register::Rax);
            flags::generate_flags_update(e, p, cpsr_off, Register::Rax);
        }
    }
}

fn emit_shift_reg_op(e: &mut Emitter, p: Register, rd_off: i32, rs_off: i32, kind: ShiftKind, cpsr_off: i32) {
    shifter::emit_shift_by_reg(e, p, Register::Rax, rd_off, rs_off, kind, true, cpsr_off);
    e.store_mem32(p, rd_off, Register::Rax);
    flags::generate_flags_update(e, p, cpsr_off, Register::Rax);
}

/// High-register ADD/CMP/MOV plus BX/BLX(register). `h1`/`h2` extend the
/// 3-bit register fields to the full 0-15 range, reaching into `SP`/`LR`/
/// `PC` the same way the low-register formats never can.
fn emit_hi_register_operation_or_bx(e: &mut Emitter, p: Register, raw: u16, pc: u32) {
    let op = (raw >> 8) & 0x3;
    let h1 = (raw >> 7) & 1;
    let h2 = (raw >> 6) & 1;
    let rs = usize::from(((raw >> 3) & 0x7) | (h2 << 3));
    let rd = usize::from((raw & 0x7) | (h1 << 3));
    let cpsr_off = ArmCore::cpsr_offset();

    match op {
        0x0 => {
            // ADD
            e.load_mem32(Register::Rax, p, ArmCore::reg_offset(rd));
            e.load_mem32(Register::Rdx, p, ArmCore::reg_offset(rs));
            e.add_reg_reg32(Register::Rax, Register::Rdx);
            if rd == ArmCore::PC {
                e.and_reg_imm32(Register::Rax, !1u32);
            }
            e.store_mem32(p, ArmCore::reg_offset(rd), Register::Rax);
        }
        0x1 => {
            // CMP
            e.load_mem32(Register::Rax, p, ArmCore::reg_offset(rd));
            e.load_mem32(Register::Rdx, p, ArmCore::reg_offset(rs));
            dataproc::emit_subtract(e, p, cpsr_off, Register::Rax, Register::Rdx, false);
            flags::generate_carry_overflow_update(e, p, cpsr_off);
            flags::generate_flags_update(e, p, cpsr_off, Register::Rax);
        }
        0x2 => {
            // MOV
            e.load_mem32(Register::Rax, p, ArmCore::reg_offset(rs));
            if rd == ArmCore::PC {
                e.and_reg_imm32(Register::Rax, !1u32);
            }
            e.store_mem32(p, ArmCore::reg_offset(rd), Register::Rax);
        }
        _ => {
            // BX (h1=0) / BLX (h1=1): h1 also selects whether LR is set.
            if h1 != 0 {
                e.mov_imm32(Register::Rax, (pc.wrapping_add(2)) | 1);
                e.store_mem32(p, ArmCore::reg_offset(ArmCore::LR), Register::Rax);
            }
            e.load_mem32(Register::Rax, p, ArmCore::reg_offset(rs));
            e.bit_test_reg32(Register::Rax, 0);
            let patch = e.tell();
            e.jump_if_not_carry(0);
            let body_start = e.tell();
            e.or_mem_imm32(p, cpsr_off, 1 << ArmCore::T_BIT);
            let body_end = e.tell();
            let disp = i8::try_from(body_end - body_start).expect("T-bit set fits a short jump");
            e.seek(patch);
            e.jump_if_not_carry(disp);
            e.seek(body_end);
            e.and_reg_imm32(Register::Rax, !1u32);
            e.store_mem32(p, ArmCore::reg_offset(ArmCore::PC), Register::Rax);
        }
    }
}

fn emit_conditional_branch(e: &mut Emitter, p: Register, raw: u16, pc: u32, cond: u8) {
    crate::cond::emit_prologue(e, p, ArmCore::cpsr_offset(), cond);
    let offset8 = (raw & 0xFF) as u8;
    let signed = i32::from(offset8 as i8);
    let target = pc.wrapping_add(4).wrapping_add((signed << 1) as u32);
    e.mov_imm32(Register::Rax, target);
    e.store_mem32(p, ArmCore::reg_offset(ArmCore::PC), Register::Rax);
}

fn emit_unconditional_branch(e: &mut Emitter, p: Register, raw: u16, pc: u32) {
    let offset11 = raw & 0x7FF;
    let signed = ((offset11 << 5) as i16 >> 5) as i32;
    let target = pc.wrapping_add(4).wrapping_add((signed << 1) as u32);
    e.mov_imm32(Register::Rax, target);
    e.store_mem32(p, ArmCore::reg_offset(ArmCore::PC), Register::Rax);
}

/// BL as a 2-instruction sequence (§4.3): the first halfword stashes a
/// coarse target into `LR`; the second refines it and saves the return
/// address. `LR` is the scratch register real Thumb hardware uses to
/// carry state between the two halves, so nothing extra needs threading
/// through here beyond `core`'s own registers.
fn emit_long_branch_with_link(e: &mut Emitter, p: Register, raw: u16, pc: u32) {
    let h = (raw >> 11) & 1;
    let off_field = u32::from(raw & 0x7FF);

    if h == 0 {
        let signed = ((off_field << 21) as i32) >> 21;
        let lr = pc.wrapping_add(4).wrapping_add((signed << 12) as u32);
        e.mov_imm32(Register::Rax, lr);
        e.store_mem32(p, ArmCore::reg_offset(ArmCore::LR), Register::Rax);
    } else {
        e.load_mem32(Register::Rax, p, ArmCore::reg_offset(ArmCore::LR));
        e.add_reg_imm32(Register::Rax, off_field << 1);
        e.mov_imm32(Register::Rdx, (pc.wrapping_add(2)) | 1);
        e.store_mem32(p, ArmCore::reg_offset(ArmCore::LR), Register::Rdx);
        e.store_mem32(p, ArmCore::reg_offset(ArmCore::PC), Register::Rax);
    }
}

fn emit_swi(e: &mut Emitter, p: Register, helpers: &HelperTable) {
    e.push_reg64(p);
    e.call_abs(Register::Rax, helpers.software_interrupt);
    e.pop_reg64(p);
}

fn emit_undefined(e: &mut Emitter, p: Register, helpers: &HelperTable) {
    e.push_reg64(p);
    e.call_abs(Register::Rax, helpers.undefined_exception);
    e.pop_reg64(p);
}

/// `mov <instr>, arg2; jmp executeInstr`, the same fallback shape as
/// `a32`'s, zero-extending `raw` into the 32-bit argument slot
/// `execute_instr` expects (`helpers.rs` narrows it back with `as u16`
/// once `CPSR.T` confirms this is a Thumb instruction).
fn emit_interpreter_fallback(e: &mut Emitter, p: Register, raw: u16, helpers: &HelperTable) {
    e.push_reg64(p);
    e.mov_imm32(Register::Rsi, u32::from(raw));
    e.call_abs(Register::Rax, helpers.execute_instr);
    e.pop_reg64(p);
}

// ---------------------------------------------------------------------
// Interpreter (§4.3, §6 `executeInstr`, §8 determinism oracle)
// ---------------------------------------------------------------------

/// Decodes and executes exactly one Thumb instruction. Mirrors the JIT's
/// own dispatch tree; reuses `crate::interp`'s pure arithmetic/shift
/// kernel (`shift_value`, `add_with_flags`, `sub_with_flags`) rather than
/// re-deriving the same boundary cases for the 16-bit encoding.
pub fn step(
    core: &mut ArmCore,
    mmu: &mut ArmMmu,
    memory: &mut dyn MemoryBackend,
    sink: &mut dyn ExceptionSink,
    raw: u16,
) {
    if raw & 0xF800 == 0x1800 {
        add_subtract(core, raw);
    } else if raw & 0xE000 == 0x0000 {
        move_shifted_register(core, raw);
    } else if raw & 0xE000 == 0x2000 {
        move_compare_add_subtract_immediate(core, raw);
    } else if raw & 0xFC00 == 0x4000 {
        alu_operation(core, raw);
    } else if raw & 0xFC00 == 0x4400 {
        hi_register_operation_or_bx(core, raw);
    } else if raw & 0xF800 == 0x4800 {
        pc_relative_load(core, mmu, memory, sink, raw);
    } else if raw & 0xF200 == 0x5000 {
        load_store_register_offset(core, mmu, memory, sink, raw);
    } else if raw & 0xF200 == 0x5200 {
        load_store_sign_extended(core, mmu, memory, sink, raw);
    } else if raw & 0xE000 == 0x6000 {
        load_store_immediate_offset(core, mmu, memory, sink, raw);
    } else if raw & 0xF000 == 0x8000 {
        load_store_halfword(core, mmu, memory, sink, raw);
    } else if raw & 0xF000 == 0x9000 {
        sp_relative_load_store(core, mmu, memory, sink, raw);
    } else if raw & 0xF000 == 0xA000 {
        load_address(core, raw);
    } else if raw & 0xFF00 == 0xB000 {
        add_offset_to_sp(core, raw);
    } else if raw & 0xFE00 == 0xB400 {
        push_registers(core, mmu, memory, sink, raw);
    } else if raw & 0xFE00 == 0xBC00 {
        pop_registers(core, mmu, memory, sink, raw);
    } else if raw & 0xF000 == 0xC000 {
        load_store_multiple(core, mmu, memory, sink, raw);
    } else if raw & 0xF000 == 0xD000 {
        let cond = ((raw >> 8) & 0xF) as u8;
        match cond {
            0xE => sink.trigger_exception(CoreId::Arm, ExceptionKind::UndefinedInstruction),
            0xF => sink.trigger_exception(CoreId::Arm, ExceptionKind::SoftwareInterrupt),
            _ => conditional_branch(core, raw, cond),
        }
    } else if raw & 0xF800 == 0xE000 {
        unconditional_branch(core, raw);
    } else if raw & 0xF000 == 0xF000 {
        long_branch_with_link(core, raw);
    } else {
        sink.trigger_exception(CoreId::Arm, ExceptionKind::UndefinedInstruction);
    }
}

fn move_shifted_register(core: &mut ArmCore, raw: u16) {
    let op = u32::from((raw >> 11) & 0x3);
    let offset5 = u32::from((raw >> 6) & 0x1F);
    let rs = usize::from((raw >> 3) & 0x7);
    let rd = usize::from(raw & 0x7);

    let (result, carry) = crate::interp::shift_value(core.regs[rs], op, offset5, true, core.flag(ArmCore::C_BIT));
    core.regs[rd] = result;
    core.update_nz(result);
    if let Some(c) = carry {
        core.set_flag(ArmCore::C_BIT, c);
    }
}

fn add_subtract(core: &mut ArmCore, raw: u16) {
    let i_bit = (raw >> 10) & 1 != 0;
    let is_sub = (raw >> 9) & 1 != 0;
    let rn_or_imm = u32::from((raw >> 6) & 0x7);
    let rs = usize::from((raw >> 3) & 0x7);
    let rd = usize::from(raw & 0x7);

    let a = core.regs[rs];
    let b = if i_bit { rn_or_imm } else { core.regs[rn_or_imm as usize] };

    let (result, carry, overflow) = if is_sub {
        crate::interp::sub_with_flags(a, b, true)
    } else {
        crate::interp::add_with_flags(a, b, false)
    };
    core.regs[rd] = result;
    core.update_nz(result);
    core.set_flag(ArmCore::C_BIT, carry);
    core.set_flag(ArmCore::V_BIT, overflow);
}

fn move_compare_add_subtract_immediate(core: &mut ArmCore, raw: u16) {
    let op = (raw >> 11) & 0x3;
    let rd = usize::from((raw >> 8) & 0x7);
    let imm8 = u32::from(raw & 0xFF);

    match op {
        0b00 => {
            core.regs[rd] = imm8;
            core.update_nz(imm8);
        }
        0b01 => {
            let (result, carry, overflow) = crate::interp::sub_with_flags(core.regs[rd], imm8, true);
            core.update_nz(result);
            core.set_flag(ArmCore::C_BIT, carry);
            core.set_flag(ArmCore::V_BIT, overflow);
        }
        0b10 => {
            let (result, carry, overflow) = crate::interp::add_with_flags(core.regs[rd], imm8, false);
            core.regs[rd] = result;
            core.update_nz(result);
            core.set_flag(ArmCore::C_BIT, carry);
            core.set_flag(ArmCore::V_BIT, overflow);
        }
        _ => {
            let (result, carry, overflow) = crate::interp::sub_with_flags(core.regs[rd], imm8, true);
            core.regs[rd] = result;
            core.update_nz(result);
            core.set_flag(ArmCore::C_BIT, carry);
            core.set_flag(ArmCore::V_BIT, overflow);
        }
    }
}

fn alu_operation(core: &mut ArmCore, raw: u16) {
    let op = (raw >> 6) & 0xF;
    let rs = usize::from((raw >> 3) & 0x7);
    let rd = usize::from(raw & 0x7);
    let d = core.regs[rd];
    let s = core.regs[rs];

    match op {
        0x0 => {
            let r = d & s;
            core.regs[rd] = r;
            core.update_nz(r);
        }
        0x1 => {
            let r = d ^ s;
            core.regs[rd] = r;
            core.update_nz(r);
        }
        0x2 | 0x3 | 0x4 | 0x7 => {
            let kind = match op {
                0x2 => 0,
                0x3 => 1,
                0x4 => 2,
                _ => 3,
            };
            let (result, carry) = crate::interp::shift_value(d, kind, s & 0xFF, false, core.flag(ArmCore::C_BIT));
            core.regs[rd] = result;
            core.update_nz(result);
            if let Some(c) = carry {
                core.set_flag(ArmCore::C_BIT, c);
            }
        }
        0x5 => {
            let (r, c, v) = crate::interp::add_with_flags(d, s, core.flag(ArmCore::C_BIT));
            core.regs[rd] = r;
            core.update_nz(r);
            core.set_flag(ArmCore::C_BIT, c);
            core.set_flag(ArmCore::V_BIT, v);
        }
        0x6 => {
            let (r, c, v) = crate::interp::sub_with_flags(d, s, core.flag(ArmCore::C_BIT));
            core.regs[rd] = r;
            core.update_nz(r);
            core.set_flag(ArmCore::C_BIT, c);
            core.set_flag(ArmCore::V_BIT, v);
        }
        0x8 => {
            let r = d & s;
            core.update_nz(r);
        }
        0x9 => {
            let (r, c, v) = crate::interp::sub_with_flags(0, s, true);
            core.regs[rd] = r;
            core.update_nz(r);
            core.set_flag(ArmCore::C_BIT, c);
            core.set_flag(ArmCore::V_BIT, v);
        }
        0xA => {
            let (r, c, v) = crate::interp::sub_with_flags(d, s, true);
            core.update_nz(r);
            core.set_flag(ArmCore::C_BIT, c);
            core.set_flag(ArmCore::V_BIT, v);
        }
        0xB => {
            let (r, c, v) = crate::interp::add_with_flags(d, s, false);
            core.update_nz(r);
            core.set_flag(ArmCore::C_BIT, c);
            core.set_flag(ArmCore::V_BIT, v);
        }
        0xC => {
            let r = d | s;
            core.regs[rd] = r;
            core.update_nz(r);
        }
        0xD => {
            // MUL: ARMv4T leaves C meaningless and V untouched.
            let r = d.wrapping_mul(s);
            core.regs[rd] = r;
            core.update_nz(r);
        }
        0xE => {
            let r = d & !s;
            core.regs[rd] = r;
            core.update_nz(r);
        }
        _ => {
            let r = !s;
            core.regs[rd] = r;
            core.update_nz(r);
        }
    }
}

fn hi_register_operation_or_bx(core: &mut ArmCore, raw: u16) {
    let op = (raw >> 8) & 0x3;
    let h1 = u32::from((raw >> 7) & 1);
    let h2 = u32::from((raw >> 6) & 1);
    let rs = usize::from(((raw >> 3) & 0x7) as u32 | (h2 << 3));
    let rd = usize::from((raw & 0x7) as u32 | (h1 << 3));

    match op {
        0x0 => {
            let r = core.regs[rd].wrapping_add(core.regs[rs]);
            core.regs[rd] = if rd == ArmCore::PC { r & !1 } else { r };
        }
        0x1 => {
            let (r, c, v) = crate::interp::sub_with_flags(core.regs[rd], core.regs[rs], true);
            core.update_nz(r);
            core.set_flag(ArmCore::C_BIT, c);
            core.set_flag(ArmCore::V_BIT, v);
        }
        0x2 => {
            let r = core.regs[rs];
            core.regs[rd] = if rd == ArmCore::PC { r & !1 } else { r };
        }
        _ => {
            let target = core.regs[rs];
            if h1 != 0 {
                core.regs[ArmCore::LR] = (core.regs[ArmCore::PC].wrapping_add(2)) | 1;
            }
            core.set_flag(ArmCore::T_BIT, target & 1 != 0);
            core.regs[ArmCore::PC] = target & !1;
        }
    }
}

fn conditional_branch(core: &mut ArmCore, raw: u16, cond: u8) {
    if !crate::cond::check(core.cpsr, cond) {
        return;
    }
    let offset8 = (raw & 0xFF) as u8;
    let signed = i32::from(offset8 as i8);
    let pc = core.regs[ArmCore::PC];
    core.regs[ArmCore::PC] = pc.wrapping_add(4).wrapping_add((signed << 1) as u32);
}

fn unconditional_branch(core: &mut ArmCore, raw: u16) {
    let offset11 = raw & 0x7FF;
    let signed = ((offset11 << 5) as i16 >> 5) as i32;
    let pc = core.regs[ArmCore::PC];
    core.regs[ArmCore::PC] = pc.wrapping_add(4).wrapping_add((signed << 1) as u32);
}

fn long_branch_with_link(core: &mut ArmCore, raw: u16) {
    let h = (raw >> 11) & 1;
    let off_field = u32::from(raw & 0x7FF);
    let pc = core.regs[ArmCore::PC];

    if h == 0 {
        let signed = ((off_field << 21) as i32) >> 21;
        core.regs[ArmCore::LR] = pc.wrapping_add(4).wrapping_add((signed << 12) as u32);
    } else {
        let target = core.regs[ArmCore::LR].wrapping_add(off_field << 1);
        core.regs[ArmCore::LR] = (pc.wrapping_add(2)) | 1;
        core.regs[ArmCore::PC] = target;
    }
}

fn translate(
    core: &ArmCore,
    mmu: &mut ArmMmu,
    memory: &mut dyn MemoryBackend,
    sink: &mut dyn ExceptionSink,
    addr: u32,
    access: AccessType,
) -> Option<u32> {
    let supervisor = core.mode() != crate::state::Mode::User;
    match mmu.translate(&mut *memory, addr, access, supervisor) {
        Ok(paddr) => Some(paddr),
        Err(fault) => {
            crate::interp::deliver_mmu_fault(sink, fault);
            None
        }
    }
}

fn load_word(core: &mut ArmCore, mmu: &mut ArmMmu, memory: &mut dyn MemoryBackend, sink: &mut dyn ExceptionSink, addr: u32, rd: usize) {
    if let Some(paddr) = translate(core, mmu, memory, sink, addr, AccessType::DataRead) {
        core.regs[rd] = memory.read_u32(paddr);
    }
}

fn store_word(core: &mut ArmCore, mmu: &mut ArmMmu, memory: &mut dyn MemoryBackend, sink: &mut dyn ExceptionSink, addr: u32, rd: usize) {
    if let Some(paddr) = translate(core, mmu, memory, sink, addr, AccessType::DataWrite) {
        memory.write_u32(paddr, core.regs[rd]);
    }
}

fn load_byte(core: &mut ArmCore, mmu: &mut ArmMmu, memory: &mut dyn MemoryBackend, sink: &mut dyn ExceptionSink, addr: u32, rd: usize) {
    if let Some(paddr) = translate(core, mmu, memory, sink, addr, AccessType::DataRead) {
        core.regs[rd] = u32::from(memory.read_u8(paddr));
    }
}

fn store_byte(core: &mut ArmCore, mmu: &mut ArmMmu, memory: &mut dyn MemoryBackend, sink: &mut dyn ExceptionSink, addr: u32, rd: usize) {
    if let Some(paddr) = translate(core, mmu, memory, sink, addr, AccessType::DataWrite) {
        memory.write_u8(paddr, core.regs[rd] as u8);
    }
}

fn load_halfword(core: &mut ArmCore, mmu: &mut ArmMmu, memory: &mut dyn MemoryBackend, sink: &mut dyn ExceptionSink, addr: u32, rd: usize) {
    if let Some(paddr) = translate(core, mmu, memory, sink, addr, AccessType::DataRead) {
        core.regs[rd] = u32::from(memory.read_u16(paddr));
    }
}

fn store_halfword(core: &mut ArmCore, mmu: &mut ArmMmu, memory: &mut dyn MemoryBackend, sink: &mut dyn ExceptionSink, addr: u32, rd: usize) {
    if let Some(paddr) = translate(core, mmu, memory, sink, addr, AccessType::DataWrite) {
        memory.write_u16(paddr, core.regs[rd] as u16);
    }
}

fn load_byte_signed(core: &mut ArmCore, mmu: &mut ArmMmu, memory: &mut dyn MemoryBackend, sink: &mut dyn ExceptionSink, addr: u32, rd: usize) {
    if let Some(paddr) = translate(core, mmu, memory, sink, addr, AccessType::DataRead) {
        core.regs[rd] = (memory.read_u8(paddr) as i8) as i32 as u32;
    }
}

fn load_halfword_signed(core: &mut ArmCore, mmu: &mut ArmMmu, memory: &mut dyn MemoryBackend, sink: &mut dyn ExceptionSink, addr: u32, rd: usize) {
    if let Some(paddr) = translate(core, mmu, memory, sink, addr, AccessType::DataRead) {
        core.regs[rd] = (memory.read_u16(paddr) as i16) as i32 as u32;
    }
}

fn pc_relative_load(core: &mut ArmCore, mmu: &mut ArmMmu, memory: &mut dyn MemoryBackend, sink: &mut dyn ExceptionSink, raw: u16) {
    let rd = usize::from((raw >> 8) & 0x7);
    let word8 = u32::from(raw & 0xFF);
    let base = core.regs[ArmCore::PC].wrapping_add(4) & !3;
    load_word(core, mmu, memory, sink, base.wrapping_add(word8 * 4), rd);
}

fn load_store_register_offset(core: &mut ArmCore, mmu: &mut ArmMmu, memory: &mut dyn MemoryBackend, sink: &mut dyn ExceptionSink, raw: u16) {
    let is_load = (raw >> 11) & 1 != 0;
    let byte = (raw >> 10) & 1 != 0;
    let ro = usize::from((raw >> 6) & 0x7);
    let rb = usize::from((raw >> 3) & 0x7);
    let rd = usize::from(raw & 0x7);
    let addr = core.regs[rb].wrapping_add(core.regs[ro]);

    match (is_load, byte) {
        (true, true) => load_byte(core, mmu, memory, sink, addr, rd),
        (true, false) => load_word(core, mmu, memory, sink, addr, rd),
        (false, true) => store_byte(core, mmu, memory, sink, addr, rd),
        (false, false) => store_word(core, mmu, memory, sink, addr, rd),
    }
}

fn load_store_sign_extended(core: &mut ArmCore, mmu: &mut ArmMmu, memory: &mut dyn MemoryBackend, sink: &mut dyn ExceptionSink, raw: u16) {
    let h = (raw >> 11) & 1 != 0;
    let s = (raw >> 10) & 1 != 0;
    let ro = usize::from((raw >> 6) & 0x7);
    let rb = usize::from((raw >> 3) & 0x7);
    let rd = usize::from(raw & 0x7);
    let addr = core.regs[rb].wrapping_add(core.regs[ro]);

    match (s, h) {
        (false, false) => store_halfword(core, mmu, memory, sink, addr, rd),
        (false, true) => load_halfword(core, mmu, memory, sink, addr, rd),
        (true, false) => load_byte_signed(core, mmu, memory, sink, addr, rd),
        (true, true) => load_halfword_signed(core, mmu, memory, sink, addr, rd),
    }
}

fn load_store_immediate_offset(core: &mut ArmCore, mmu: &mut ArmMmu, memory: &mut dyn MemoryBackend, sink: &mut dyn ExceptionSink, raw: u16) {
    let byte = (raw >> 12) & 1 != 0;
    let is_load = (raw >> 11) & 1 != 0;
    let offset5 = u32::from((raw >> 6) & 0x1F);
    let rb = usize::from((raw >> 3) & 0x7);
    let rd = usize::from(raw & 0x7);
    let offset = if byte { offset5 } else { offset5 * 4 };
    let addr = core.regs[rb].wrapping_add(offset);

    match (is_load, byte) {
        (true, true) => load_byte(core, mmu, memory, sink, addr, rd),
        (true, false) => load_word(core, mmu, memory, sink, addr, rd),
        (false, true) => store_byte(core, mmu, memory, sink, addr, rd),
        (false, false) => store_word(core, mmu, memory, sink, addr, rd),
    }
}

fn load_store_halfword(core: &mut ArmCore, mmu: &mut ArmMmu, memory: &mut dyn MemoryBackend, sink: &mut dyn ExceptionSink, raw: u16) {
    let is_load = (raw >> 11) & 1 != 0;
    let offset5 = u32::from((raw >> 6) & 0x1F);
    let rb = usize::from((raw >> 3) & 0x7);
    let rd = usize::from(raw & 0x7);
    let addr = core.regs[rb].wrapping_add(offset5 * 2);
    if is_load {
        load_halfword(core, mmu, memory, sink, addr, rd);
    } else {
        store_halfword(core, mmu, memory, sink, addr, rd);
    }
}

fn sp_relative_load_store(core: &mut ArmCore, mmu: &mut ArmMmu, memory: &mut dyn MemoryBackend, sink: &mut dyn ExceptionSink, raw: u16) {
    let is_load = (raw >> 11) & 1 != 0;
    let rd = usize::from((raw >> 8) & 0x7);
    let word8 = u32::from(raw & 0xFF);
    let addr = core.regs[ArmCore::SP].wrapping_add(word8 * 4);
    if is_load {
        load_word(core, mmu, memory, sink, addr, rd);
    } else {
        store_word(core, mmu, memory, sink, addr, rd);
    }
}

fn load_address(core: &mut ArmCore, raw: u16) {
    let use_sp = (raw >> 11) & 1 != 0;
    let rd = usize::from((raw >> 8) & 0x7);
    let word8 = u32::from(raw & 0xFF);
    let base = if use_sp { core.regs[ArmCore::SP] } else { core.regs[ArmCore::PC].wrapping_add(4) & !3 };
    core.regs[rd] = base.wrapping_add(word8 * 4);
}

fn add_offset_to_sp(core: &mut ArmCore, raw: u16) {
    let negative = (raw >> 7) & 1 != 0;
    let offset = u32::from(raw & 0x7F) * 4;
    core.regs[ArmCore::SP] =
        if negative { core.regs[ArmCore::SP].wrapping_sub(offset) } else { core.regs[ArmCore::SP].wrapping_add(offset) };
}

/// PUSH: stores registers in ascending numeric order (`R0..R7`, then
/// optionally `LR`) at ascending addresses below the pre-decremented SP,
/// matching STMDB's convention for a register list spanning both banks.
fn push_registers(core: &mut ArmCore, mmu: &mut ArmMmu, memory: &mut dyn MemoryBackend, sink: &mut dyn ExceptionSink, raw: u16) {
    let include_lr = (raw >> 8) & 1 != 0;
    let rlist = raw & 0xFF;
    let mut regs: Vec<usize> = (0..8).filter(|n| rlist & (1 << n) != 0).collect();
    if include_lr {
        regs.push(ArmCore::LR);
    }

    let count = regs.len() as u32;
    let mut addr = core.regs[ArmCore::SP].wrapping_sub(count * 4);
    core.regs[ArmCore::SP] = addr;
    for reg in regs {
        store_word(core, mmu, memory, sink, addr, reg);
        addr = addr.wrapping_add(4);
    }
}

fn pop_registers(core: &mut ArmCore, mmu: &mut ArmMmu, memory: &mut dyn MemoryBackend, sink: &mut dyn ExceptionSink, raw: u16) {
    let include_pc = (raw >> 8) & 1 != 0;
    let rlist = raw & 0xFF;
    let regs: Vec<usize> = (0..8).filter(|n| rlist & (1 << n) != 0).collect();

    let mut addr = core.regs[ArmCore::SP];
    for reg in regs {
        load_word(core, mmu, memory, sink, addr, reg);
        addr = addr.wrapping_add(4);
    }
    if include_pc {
        load_word(core, mmu, memory, sink, addr, ArmCore::PC);
        core.regs[ArmCore::PC] &= !1;
        addr = addr.wrapping_add(4);
    }
    core.regs[ArmCore::SP] = addr;
}

fn load_store_multiple(core: &mut ArmCore, mmu: &mut ArmMmu, memory: &mut dyn MemoryBackend, sink: &mut dyn ExceptionSink, raw: u16) {
    let is_load = (raw >> 11) & 1 != 0;
    let rb = usize::from((raw >> 8) & 0x7);
    let rlist = raw & 0xFF;
    let regs: Vec<usize> = (0..8).filter(|n| rlist & (1 << n) != 0).collect();

    let mut addr = core.regs[rb];
    for reg in regs {
        if is_load {
            load_word(core, mmu, memory, sink, addr, reg);
        } else {
            store_word(core, mmu, memory, sink, addr, reg);
        }
        addr = addr.wrapping_add(4);
    }
    core.regs[rb] = addr;
}

#[cfg(test)]
mod tests {
    use super::*;
    use dbt_core::FlatMemory;

    fn helpers() -> HelperTable {
        HelperTable {
            load_u8: 1,
            load_u16: 2,
            load_u32: 3,
            store_u8: 4,
            store_u16: 5,
            store_u32: 6,
            store_long: 7,
            execute_instr: 8,
            throw_instr: 9,
            undefined_exception: 10,
            software_interrupt: 11,
            change_mode: 12,
            write_mode_regs: 13,
            read_mode_regs: 14,
            invalidate_icache: 15,
        }
    }

    struct NullSink;
    impl ExceptionSink for NullSink {
        fn trigger_exception(&mut self, _core: CoreId, _kind: ExceptionKind) {}
    }

    #[test]
    fn move_immediate_sets_register_and_flags() {
        let mut core = ArmCore::new();
        // MOV R0, #5
        let raw = 0x2005u16;
        let mut mmu = ArmMmu::new();
        let mut mem = FlatMemory::new(0x10);
        let mut sink = NullSink;
        step(&mut core, &mut mmu, &mut mem, &mut sink, raw);
        assert_eq!(core.regs[0], 5);
        assert!(!core.flag(ArmCore::Z_BIT));
    }

    #[test]
    fn add_register_sets_carry_on_overflow() {
        let mut core = ArmCore::new();
        core.regs[0] = 0xFFFF_FFFF;
        core.regs[1] = 1;
        // ADD R2, R0, R1 (format 2, register form)
        let raw = 0x1888u16;
        let mut mmu = ArmMmu::new();
        let mut mem = FlatMemory::new(0x10);
        let mut sink = NullSink;
        step(&mut core, &mut mmu, &mut mem, &mut sink, raw);
        assert_eq!(core.regs[2], 0);
        assert!(core.flag(ArmCore::C_BIT));
        assert!(core.flag(ArmCore::Z_BIT));
    }

    #[test]
    fn conditional_branch_skips_when_condition_fails() {
        let mut core = ArmCore::new();
        core.regs[ArmCore::PC] = 0x8000;
        core.set_flag(ArmCore::Z_BIT, false);
        // BEQ with Z clear: not taken
        let raw = 0xD0FFu16;
        let mut mmu = ArmMmu::new();
        let mut mem = FlatMemory::new(0x10);
        let mut sink = NullSink;
        step(&mut core, &mut mmu, &mut mem, &mut sink, raw);
        assert_eq!(core.regs[ArmCore::PC], 0x8000);
    }

    #[test]
    fn long_branch_with_link_two_halfword_sequence() {
        let mut core = ArmCore::new();
        core.regs[ArmCore::PC] = 0x1000;
        let mut mmu = ArmMmu::new();
        let mut mem = FlatMemory::new(0x10);
        let mut sink = NullSink;
        step(&mut core, &mut mmu, &mut mem, &mut sink, 0xF000); // H=0, offset=0
        core.regs[ArmCore::PC] = 0x1002;
        step(&mut core, &mut mmu, &mut mem, &mut sink, 0xF800); // H=1, offset=0
        assert_eq!(core.regs[ArmCore::PC], 0x1004);
        assert_eq!(core.regs[ArmCore::LR], 0x1005);
    }

    #[test]
    fn compiling_a_page_of_nops_produces_a_fixed_size_trampoline() {
        let mut e = Emitter::new();
        let halfwords = [0x46C0u16; SLOTS_PER_PAGE]; // MOV R8, R8 (hi-register no-op)
        let size = compile_page(&mut e, Register::Rdi, 0x1000_0000, &halfwords, &helpers());
        assert!(size >= TRAMPOLINE_TABLE_BYTES);
    }

    #[test]
    fn mov_immediate_compiles_without_panicking() {
        let mut e = Emitter::new();
        let raw = 0x2005u16; // MOV R0, #5
        emit_instruction(&mut e, Register::Rdi, raw, 0x1000, &helpers());
        assert!(e.size() > 0);
    }
}
