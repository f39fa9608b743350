//! Top-level ARM-A32 decode and the trampoline table it compiles into
//! (§3, §4.2). One 4 KiB guest page holds 1024 32-bit instructions, so
//! the trampoline table is 1024 fixed 5-byte `JMP rel32` cells,
//! addressed as `table + 5 * index`, followed by the variable-length
//! emitted bodies — mirroring the original's `offsets[0x400]` plus
//! `X86CodeGenerator` buffer exactly, just with an explicit cell size
//! instead of a separately tracked offset array.

use dbt_x86_emit::{Emitter, Register};

use crate::{branch, cond, dataproc, loadstore, status};

/// Number of 32-bit instruction slots per guest page (4 KiB / 4 B).
pub const SLOTS_PER_PAGE: usize = 0x400;
/// Fixed size of one trampoline cell: a near `JMP rel32` (opcode + disp32).
pub const TRAMPOLINE_CELL_BYTES: usize = 5;
const TRAMPOLINE_TABLE_BYTES: usize = SLOTS_PER_PAGE * TRAMPOLINE_CELL_BYTES;

/// Absolute addresses of the runtime helpers a compiled page's bodies
/// may call into (§6). Resolved once by the JIT cache and threaded
/// through every `compile_page` call — this module owns no helper
/// addresses of its own.
#[derive(Debug, Clone, Copy)]
pub struct HelperTable {
    pub load_u8: u64,
    pub load_u16: u64,
    pub load_u32: u64,
    pub store_u8: u64,
    pub store_u16: u64,
    pub store_u32: u64,
    pub store_long: u64,
    pub execute_instr: u64,
    pub throw_instr: u64,
    pub undefined_exception: u64,
    pub software_interrupt: u64,
    pub change_mode: u64,
    pub write_mode_regs: u64,
    pub read_mode_regs: u64,
    /// `invalidateICache` — a supplement beyond the named helper table
    /// (see `DESIGN.md`): the one coprocessor-15 write this translator
    /// gives JIT-visible meaning to (§4.6 "Invalidation").
    pub invalidate_icache: u64,
}

/// Compiles one 4 KiB guest page (`SLOTS_PER_PAGE` consecutive words,
/// starting at guest physical address `page_base`) into the trampoline
/// table + bodies layout, appended to `e` starting at its current
/// position. Returns the byte length of the whole compiled block.
pub fn compile_page(e: &mut Emitter, p: Register, page_base: u32, words: &[u32], helpers: &HelperTable) -> usize {
    debug_assert_eq!(words.len(), SLOTS_PER_PAGE);

    let block_start = e.tell();
    e.seek(block_start + TRAMPOLINE_TABLE_BYTES); // bodies follow the table

    let mut body_offsets = [0usize; SLOTS_PER_PAGE];
    for (i, &raw) in words.iter().enumerate() {
        body_offsets[i] = e.tell() - block_start;
        let pc = page_base.wrapping_add((i as u32) * 4);
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

/// Emits one instruction's condition-gated body at the current position.
fn emit_instruction(e: &mut Emitter, p: Register, raw: u32, pc: u32, helpers: &HelperTable) {
    let condition = (raw >> 28) as u8;
    if condition != 0xE {
        if condition == 0xF {
            // Unconditional-extension space (BLX/PLD/...): not emitted,
            // route to the interpreter like any other unimplemented form.
            emit_interpreter_fallback(e, p, raw, helpers);
            return;
        }
        cond::emit_prologue(e, p, crate::state::ArmCore::cpsr_offset(), condition);
    }

    let class = (raw >> 25) & 0x7;
    match class {
        0b000 | 0b001 => emit_data_processing_or_extra(e, p, raw, pc, helpers),
        0b010 | 0b011 => emit_load_store(e, p, raw, helpers),
        0b100 => loadstore::emit_multiple(e, p, raw, helpers.load_u32, helpers.store_u32),
        0b101 => {
            let link = (raw >> 24) & 1 != 0;
            branch::emit_b(e, p, raw, pc, link);
        }
        _ => emit_coprocessor_or_swi(e, p, raw, helpers),
    }

    // Every path above either already ended in its own `RET` (branches,
    // BX, SWI, the interpreter fallback) or falls straight off the end of
    // its body (data-processing, MRS/MSR, single/multiple load-store) —
    // this unconditional `RET` closes the latter group. A `RET` appended
    // after a path that already emitted one is simply dead and never
    // reached, at the cost of one byte.
    e.ret();
}

fn emit_data_processing_or_extra(e: &mut Emitter, p: Register, raw: u32, pc: u32, helpers: &HelperTable) {
    // BX: bits[7:4] = 0001; BLX(register): bits[7:4] = 0011. Both share
    // the same bits[27:8] fixed pattern and put Rm in bits[3:0].
    if (raw & 0x0FFF_FFD0) == 0x012F_FF10 {
        let link = (raw & 0xF0) == 0x30;
        branch::emit_bx(e, p, raw, pc, link);
        return;
    }
    if (raw & 0x0FBF_0FFF) == 0x010F_0000 {
        status::emit_mrs(e, p, raw);
        return;
    }
    if (raw & 0x0DB0_F000) == 0x0120_F000 {
        status::emit_msr(e, p, raw, helpers.write_mode_regs, helpers.read_mode_regs);
        return;
    }
    // Multiply, swap, and extra load/store (halfword/signed) forms are
    // not fast-emitted — route to the interpreter, same as any other
    // opcode this translator doesn't special-case (§4.2 "Unimplemented").
    let is_extra_ldst = (raw & 0x0E00_0090) == 0x0000_0090;
    if is_extra_ldst {
        emit_interpreter_fallback(e, p, raw, helpers);
        return;
    }

    dataproc::emit(e, p, raw, helpers.change_mode);
}

fn emit_load_store(e: &mut Emitter, p: Register, raw: u32, helpers: &HelperTable) {
    let byte = (raw >> 22) & 1 != 0;
    let is_load = (raw >> 20) & 1 != 0;
    let width = if byte { loadstore::Width::Byte } else { loadstore::Width::Word };
    let helper = match (is_load, byte) {
        (true, true) => helpers.load_u8,
        (true, false) => helpers.load_u32,
        (false, true) => helpers.store_u8,
        (false, false) => helpers.store_u32,
    };

    let i_bit = (raw >> 25) & 1 != 0;
    if i_bit {
        // Register-offset form: the shift amount is always an immediate
        // shift of Rm, S suppressed — computed like operand 2 but with
        // carry update forced off.
        emit_register_offset_load_store(e, p, raw, helper, is_load, width);
    } else {
        let offset = raw & 0xFFF;
        emit_immediate_offset_load_store(e, p, raw, offset, helper, is_load, width);
    }
}

fn emit_immediate_offset_load_store(
    e: &mut Emitter,
    p: Register,
    raw: u32,
    offset: u32,
    helper: u64,
    is_load: bool,
    width: loadstore::Width,
) {
    e.mov_imm32(Register::Rcx, offset);
    loadstore::emit_single(e, p, raw, helper, width, is_load, Register::Rcx, true);
}

fn emit_register_offset_load_store(
    e: &mut Emitter,
    p: Register,
    raw: u32,
    helper: u64,
    is_load: bool,
    width: loadstore::Width,
) {
    use crate::shifter::{self, ShiftKind};

    let rm = (raw & 0xF) as usize;
    let kind = ShiftKind::from_bits(raw >> 5);
    let amount = (raw >> 7) & 0x1F;
    shifter::emit_shift_by_imm(
        e,
        p,
        Register::Rcx,
        crate::state::ArmCore::reg_offset(rm),
        kind,
        amount,
        false,
        crate::state::ArmCore::cpsr_offset(),
    );
    loadstore::emit_single(e, p, raw, helper, width, is_load, Register::Rcx, true);
}

fn emit_coprocessor_or_swi(e: &mut Emitter, p: Register, raw: u32, helpers: &HelperTable) {
    let is_swi = (raw & 0x0F00_0000) == 0x0F00_0000;
    if is_swi {
        e.push_reg64(p);
        e.call_abs(Register::Rax, helpers.software_interrupt);
        e.pop_reg64(p);
        e.ret();
        return;
    }
    // MCR p15, 0, Rd, c7, c5, 0 — "invalidate entire ICache" (§4.6). The
    // only coprocessor-15 write this translator gives meaning to; every
    // other CDP/MCR/MRC falls through to the interpreter like any other
    // unimplemented form.
    if is_icache_invalidate_all(raw) {
        e.push_reg64(p);
        e.call_abs(Register::Rax, helpers.invalidate_icache);
        e.pop_reg64(p);
        e.ret();
        return;
    }
    emit_interpreter_fallback(e, p, raw, helpers);
}

/// `MCR` (write), `CRn`=7, cp_num=15, `opc2`=0, `CRm`=5 — condition bits
/// excluded from the mask so any guest condition matches.
fn is_icache_invalidate_all(raw: u32) -> bool {
    raw & 0x0F1F_0FFF == 0x0E07_0F15
}

/// `mov <instr>, arg2; jmp executeInstr` (§4.2 "Unimplemented / error").
fn emit_interpreter_fallback(e: &mut Emitter, p: Register, raw: u32, helpers: &HelperTable) {
    e.push_reg64(p);
    e.mov_imm32(Register::Rsi, raw);
    e.call_abs(Register::Rax, helpers.execute_instr);
    e.pop_reg64(p);
    e.ret();
}

#[cfg(test)]
mod tests {
    use super::*;

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

    #[test]
    fn compiling_a_page_of_nops_produces_a_fixed_size_trampoline() {
        let mut e = Emitter::new();
        let words = [0xE320_F000u32; SLOTS_PER_PAGE]; // NOP (MSR-shaped no-op-ish, routed to fallback)
        let size = compile_page(&mut e, Register::Rdi, 0x8000_0000, &words, &helpers());
        assert!(size >= TRAMPOLINE_TABLE_BYTES);
    }

    #[test]
    fn mov_immediate_compiles_without_panicking() {
        let mut e = Emitter::new();
        let raw = 0xE3A0_0005u32; // MOV R0, #5
        emit_instruction(&mut e, Register::Rdi, raw, 0x8000, &helpers());
        assert!(e.size() > 0);
    }

    #[test]
    fn icache_invalidate_pattern_recognizes_any_condition() {
        let raw = 0xEE07_0F15u32; // MCR p15, 0, R0, c7, c5, 0 (AL)
        assert!(is_icache_invalidate_all(raw));
        let conditional = (raw & 0x0FFF_FFFF) | 0x1000_0000; // NE
        assert!(is_icache_invalidate_all(conditional));
    }

    #[test]
    fn icache_invalidate_compiles_to_a_call() {
        let mut e = Emitter::new();
        let raw = 0xEE07_0F15u32;
        emit_instruction(&mut e, Register::Rdi, raw, 0x8000, &helpers());
        assert!(e.size() > 0);
    }
}
