//! The PowerPC interpreter fallback (§4.4 "All other opcodes") — also the
//! determinism oracle §8 requires the JIT to agree with bit-for-bit.
//! Every opcode `fastops`/`branch` knows how to JIT is implemented here
//! too, in plain Rust over the same `PpcCore` fields, plus the much wider
//! set that only ever runs interpreted: supervisor ops, the full integer
//! and floating-point ALU, paired-single, and the memory forms the
//! trampoline compiler doesn't fast-emit.

use dbt_core::{CoreId, ExceptionKind, ExceptionSink, MemoryBackend};
use dbt_mmu::{AccessType, MmuFault, PpcMmu};

use crate::cond;
use crate::fastops::mask;
use crate::reservation::Reservation;
use crate::state::{convert_spr, spr, PpcCore};

/// Decodes and executes exactly one PowerPC instruction.
pub fn step(
    core: &mut PpcCore,
    mmu: &mut PpcMmu,
    memory: &mut dyn MemoryBackend,
    sink: &mut dyn ExceptionSink,
    reservation: &Reservation,
    core_id: CoreId,
    raw: u32,
) {
    let opcode = raw >> 26;
    match opcode {
        14 => addi(core, raw, false),
        15 => addi(core, raw, true),
        12 => addic(core, raw, false),
        13 => addic(core, raw, true),
        8 => subfic(core, raw),
        10 => cmpl_immediate(core, raw),
        11 => cmp_immediate(core, raw),
        16 => branch_conditional(core, raw),
        17 => sc(core, sink, core_id),
        18 => branch(core, raw),
        19 => opcode19(core, raw),
        20 => rlw(core, raw, true),
        21 => rlw(core, raw, false),
        24 => logical_immediate(core, raw, false, false),
        25 => logical_immediate(core, raw, false, true),
        26 => logical_immediate(core, raw, true, false),
        27 => logical_immediate(core, raw, true, true),
        28 => and_immediate_dot(core, raw, false),
        29 => and_immediate_dot(core, raw, true),
        31 => opcode31(core, mmu, memory, sink, reservation, core_id, raw),
        32..=55 => memory_form(core, mmu, memory, sink, core_id, opcode, raw),
        59 => float_single(core, raw),
        63 => float_double(core, raw),
        4 => paired_single(core, raw),
        _ => sink.trigger_exception(core_id, ExceptionKind::UndefinedInstruction),
    }
}

fn gpr(core: &PpcCore, n: u32) -> u32 {
    core.regs[n as usize]
}

fn set_gpr(core: &mut PpcCore, n: u32, value: u32) {
    core.regs[n as usize] = value;
}

fn ra_or_zero(core: &PpcCore, ra: u32) -> u32 {
    if ra == 0 {
        0
    } else {
        gpr(core, ra)
    }
}

fn sign_extend16(value: u32) -> u32 {
    ((value as i16) as i32) as u32
}

fn fields_d(raw: u32) -> (u32, u32, u32) {
    ((raw >> 21) & 0x1F, (raw >> 16) & 0x1F, sign_extend16(raw & 0xFFFF))
}

fn fields_x(raw: u32) -> (u32, u32, u32, bool) {
    ((raw >> 21) & 0x1F, (raw >> 16) & 0x1F, (raw >> 11) & 0x1F, raw & 1 != 0)
}

fn addi(core: &mut PpcCore, raw: u32, shifted: bool) {
    let rt = (raw >> 21) & 0x1F;
    let ra = (raw >> 16) & 0x1F;
    let imm = raw & 0xFFFF;
    let simm = if shifted { imm << 16 } else { sign_extend16(imm) };
    set_gpr(core, rt, ra_or_zero(core, ra).wrapping_add(simm));
}

fn addic(core: &mut PpcCore, raw: u32, record: bool) {
    let (rt, ra, simm) = fields_d(raw);
    let (result, carry) = add_with_carry(gpr(core, ra), simm);
    set_gpr(core, rt, result);
    core.set_carry(carry);
    if record {
        core.update_cr0(result);
    }
}

fn subfic(core: &mut PpcCore, raw: u32) {
    let (rt, ra, simm) = fields_d(raw);
    let (result, carry) = add_with_carry(!gpr(core, ra), simm.wrapping_add(1));
    set_gpr(core, rt, result);
    core.set_carry(carry);
}

pub(crate) fn add_with_carry(a: u32, b: u32) -> (u32, bool) {
    let (result, overflowed) = a.overflowing_add(b);
    (result, overflowed)
}

fn logical_immediate(core: &mut PpcCore, raw: u32, xor: bool, shifted: bool) {
    let rs = (raw >> 21) & 0x1F;
    let ra = (raw >> 16) & 0x1F;
    let imm = raw & 0xFFFF;
    let uimm = if shifted { imm << 16 } else { imm };
    let value = if xor { gpr(core, rs) ^ uimm } else { gpr(core, rs) | uimm };
    set_gpr(core, ra, value);
}

fn and_immediate_dot(core: &mut PpcCore, raw: u32, shifted: bool) {
    let rs = (raw >> 21) & 0x1F;
    let ra = (raw >> 16) & 0x1F;
    let imm = raw & 0xFFFF;
    let uimm = if shifted { imm << 16 } else { imm };
    let value = gpr(core, rs) & uimm;
    set_gpr(core, ra, value);
    core.update_cr0(value);
}

fn rlw(core: &mut PpcCore, raw: u32, insert: bool) {
    let rs = (raw >> 21) & 0x1F;
    let ra = (raw >> 16) & 0x1F;
    let sh = (raw >> 11) & 0x1F;
    let mb = (raw >> 6) & 0x1F;
    let me = (raw >> 1) & 0x1F;
    let rc = raw & 1 != 0;
    let m = mask(mb, me);
    let rotated = gpr(core, rs).rotate_left(sh);
    let value = if insert { (rotated & m) | (gpr(core, ra) & !m) } else { rotated & m };
    set_gpr(core, ra, value);
    if rc {
        core.update_cr0(value);
    }
}

fn cmp_immediate(core: &mut PpcCore, raw: u32) {
    let crf = (raw >> 23) & 0x7;
    let ra = (raw >> 16) & 0x1F;
    let simm = sign_extend16(raw & 0xFFFF);
    compare_signed(core, crf, gpr(core, ra) as i32, simm as i32);
}

fn cmpl_immediate(core: &mut PpcCore, raw: u32) {
    let crf = (raw >> 23) & 0x7;
    let ra = (raw >> 16) & 0x1F;
    let uimm = raw & 0xFFFF;
    compare_unsigned(core, crf, gpr(core, ra), uimm);
}

fn compare_signed(core: &mut PpcCore, crf: u32, a: i32, b: i32) {
    let bits = if a < b { 0x8 } else if a > b { 0x4 } else { 0x2 };
    write_crf(core, crf, bits);
}

fn compare_unsigned(core: &mut PpcCore, crf: u32, a: u32, b: u32) {
    let bits = if a < b { 0x8 } else if a > b { 0x4 } else { 0x2 };
    write_crf(core, crf, bits);
}

fn write_crf(core: &mut PpcCore, crf: u32, bits: u32) {
    let shift = (7 - crf) * 4;
    core.cr = (core.cr & !(0xF << shift)) | (bits << shift);
}

fn branch(core: &mut PpcCore, raw: u32) {
    let li = raw & 0x03FF_FFFC;
    let signed = ((li as i32) << 6) >> 6;
    let absolute = raw & 0b10 != 0;
    let link = raw & 0b1 != 0;
    let target = if absolute { signed as u32 } else { core.pc.wrapping_add(signed as u32) };
    if link {
        core.sprs[spr::LR] = core.pc.wrapping_add(4);
    }
    core.pc = target;
}

fn branch_conditional(core: &mut PpcCore, raw: u32) {
    let bo = (raw >> 21) & 0x1F;
    let bi = (raw >> 16) & 0x1F;
    if !cond::check_condition(core, bo, bi) {
        return;
    }
    let bd = raw & 0x0000_FFFC;
    let signed = ((bd as i32) << 16) >> 16;
    let absolute = raw & 0b10 != 0;
    let link = raw & 0b1 != 0;
    let target = if absolute { signed as u32 } else { core.pc.wrapping_add(signed as u32) };
    if link {
        core.sprs[spr::LR] = core.pc.wrapping_add(4);
    }
    core.pc = target;
}

fn sc(core: &mut PpcCore, sink: &mut dyn ExceptionSink, core_id: CoreId) {
    core.trigger_exception(sink, core_id, ExceptionKind::SystemCall);
}

/// Opcode 19: `bclr`/`bcctr`, the CR-logical family, `mcrf`, `rfi`, `isync`.
fn opcode19(core: &mut PpcCore, raw: u32) {
    let xo = (raw >> 1) & 0x3FF;
    match xo {
        16 => {
            // bclr
            let bo = (raw >> 21) & 0x1F;
            let bi = (raw >> 16) & 0x1F;
            let link = raw & 1 != 0;
            if !cond::check_condition(core, bo, bi) {
                return;
            }
            let target = core.sprs[spr::LR] & !0x3;
            if link {
                core.sprs[spr::LR] = core.pc.wrapping_add(4);
            }
            core.pc = target;
        }
        528 => {
            // bcctr
            let bo = (raw >> 21) & 0x1F;
            let bi = (raw >> 16) & 0x1F;
            let link = raw & 1 != 0;
            // bcctr never gates on CTR itself; forcing BO bit 2 set skips
            // that half of check_condition and leaves only the CR-bit test.
            if !cond::check_condition(core, bo | 4, bi) {
                return;
            }
            let target = core.sprs[spr::CTR] & !0x3;
            if link {
                core.sprs[spr::LR] = core.pc.wrapping_add(4);
            }
            core.pc = target;
        }
        0 => {
            // mcrf
            let bf = (raw >> 23) & 0x7;
            let bfa = (raw >> 18) & 0x7;
            let shift_a = (7 - bfa) * 4;
            let field = (core.cr >> shift_a) & 0xF;
            write_crf(core, bf, field);
        }
        257 => {} // isync: no-op for this host model.
        150 => {} // rfi: priority-vectoring left to the host embedding this crate, same as ARM's change_mode boundary.
        crlogical => cr_logical(core, raw, crlogical),
    }
}

fn cr_logical(core: &mut PpcCore, raw: u32, xo: u32) {
    let bt = (raw >> 21) & 0x1F;
    let ba = (raw >> 16) & 0x1F;
    let bb = (raw >> 11) & 0x1F;
    let a = core.get_cr_bit(ba);
    let b = core.get_cr_bit(bb);
    let result = match xo {
        257 => a && b,          // crand
        449 => a || b,          // cror
        193 => a ^ b,           // crxor
        225 => !(a && b),       // crnand
        33 => !(a || b),        // crnor
        289 => !(a ^ b),        // creqv
        129 => a && !b,         // crandc
        417 => a || !b,         // crorc
        _ => return,
    };
    core.set_cr_bit_index(bt, result);
}

/// Opcode 31: the integer ALU, the system-register family, and the
/// indexed/reservation memory forms.
#[allow(clippy::too_many_lines)]
fn opcode31(
    core: &mut PpcCore,
    mmu: &mut PpcMmu,
    memory: &mut dyn MemoryBackend,
    sink: &mut dyn ExceptionSink,
    reservation: &Reservation,
    core_id: CoreId,
    raw: u32,
) {
    let xo = (raw >> 1) & 0x3FF;
    match xo {
        266 => {
            // add
            let (rd, ra, rb, rc) = fields_x(raw);
            let value = gpr(core, ra).wrapping_add(gpr(core, rb));
            set_gpr(core, rd, value);
            if rc {
                core.update_cr0(value);
            }
        }
        40 => {
            // subf
            let (rd, ra, rb, rc) = fields_x(raw);
            let value = gpr(core, rb).wrapping_sub(gpr(core, ra));
            set_gpr(core, rd, value);
            if rc {
                core.update_cr0(value);
            }
        }
        235 => {
            // mullw
            let (rd, ra, rb, rc) = fields_x(raw);
            let value = (gpr(core, ra) as i32).wrapping_mul(gpr(core, rb) as i32) as u32;
            set_gpr(core, rd, value);
            if rc {
                core.update_cr0(value);
            }
        }
        491 => {
            // divw
            let (rd, ra, rb, rc) = fields_x(raw);
            let a = gpr(core, ra) as i32;
            let b = gpr(core, rb) as i32;
            let value = if b == 0 { 0 } else { a.wrapping_div(b) } as u32;
            set_gpr(core, rd, value);
            if rc {
                core.update_cr0(value);
            }
        }
        459 => {
            // divwu
            let (rd, ra, rb, rc) = fields_x(raw);
            let a = gpr(core, ra);
            let b = gpr(core, rb);
            let value = if b == 0 { 0 } else { a / b };
            set_gpr(core, rd, value);
            if rc {
                core.update_cr0(value);
            }
        }
        104 => {
            // neg
            let (rd, ra, _, rc) = fields_x(raw);
            let value = (gpr(core, ra) as i32).wrapping_neg() as u32;
            set_gpr(core, rd, value);
            if rc {
                core.update_cr0(value);
            }
        }
        0 => {
            // cmp
            let crf = (raw >> 23) & 0x7;
            let ra = (raw >> 16) & 0x1F;
            let rb = (raw >> 11) & 0x1F;
            compare_signed(core, crf, gpr(core, ra) as i32, gpr(core, rb) as i32);
        }
        32 => {
            // cmpl
            let crf = (raw >> 23) & 0x7;
            let ra = (raw >> 16) & 0x1F;
            let rb = (raw >> 11) & 0x1F;
            compare_unsigned(core, crf, gpr(core, ra), gpr(core, rb));
        }
        28 => bitwise(core, raw, |a, b| a & b),
        444 => bitwise(core, raw, |a, b| a | b),
        316 => bitwise(core, raw, |a, b| a ^ b),
        476 => bitwise(core, raw, |a, b| !(a & b)),
        124 => bitwise(core, raw, |a, b| !(a | b)),
        284 => bitwise(core, raw, |a, b| !(a ^ b)),
        60 => bitwise(core, raw, |a, b| a & !b),
        412 => bitwise(core, raw, |a, b| a | !b),
        954 => {
            // extsb
            let (rd, ra, _, rc) = fields_x(raw);
            let value = ((gpr(core, ra) as i8) as i32) as u32;
            set_gpr(core, rd, value);
            if rc {
                core.update_cr0(value);
            }
        }
        922 => {
            // extsh
            let (rd, ra, _, rc) = fields_x(raw);
            let value = ((gpr(core, ra) as i16) as i32) as u32;
            set_gpr(core, rd, value);
            if rc {
                core.update_cr0(value);
            }
        }
        26 => {
            // cntlzw
            let (rd, ra, _, rc) = fields_x(raw);
            let value = gpr(core, ra).leading_zeros();
            set_gpr(core, rd, value);
            if rc {
                core.update_cr0(value);
            }
        }
        24 => {
            // slw
            let (rd, ra, rb, rc) = fields_x(raw);
            let sh = gpr(core, rb) & 0x3F;
            let value = if sh >= 32 { 0 } else { gpr(core, ra) << sh };
            set_gpr(core, rd, value);
            if rc {
                core.update_cr0(value);
            }
        }
        536 => {
            // srw
            let (rd, ra, rb, rc) = fields_x(raw);
            let sh = gpr(core, rb) & 0x3F;
            let value = if sh >= 32 { 0 } else { gpr(core, ra) >> sh };
            set_gpr(core, rd, value);
            if rc {
                core.update_cr0(value);
            }
        }
        792 => {
            // sraw
            let (rd, ra, rb, rc) = fields_x(raw);
            let sh = gpr(core, rb) & 0x3F;
            let signed = gpr(core, ra) as i32;
            let (value, carry) = if sh >= 32 {
                (if signed < 0 { -1i32 } else { 0 }, signed < 0)
            } else {
                let shifted = signed >> sh;
                let carry = signed < 0 && (signed & mask(32 - sh, 31) as i32) != 0;
                (shifted, carry)
            };
            set_gpr(core, rd, value as u32);
            core.set_carry(carry);
            if rc {
                core.update_cr0(value as u32);
            }
        }
        824 => {
            // srawi — the genmask(32-sh, 31) guard degenerates at sh=0 (see DESIGN.md).
            let (rd, ra, sh, rc) = fields_x(raw);
            let signed = gpr(core, ra) as i32;
            let value = signed >> sh;
            let carry = signed < 0 && sh != 0 && (signed & mask(32 - sh, 31) as i32) != 0;
            set_gpr(core, rd, value as u32);
            core.set_carry(carry);
            if rc {
                core.update_cr0(value as u32);
            }
        }
        83 => {
            // mfmsr
            let rd = (raw >> 21) & 0x1F;
            set_gpr(core, rd, core.msr);
        }
        146 => {
            // mtmsr
            let rs = (raw >> 21) & 0x1F;
            core.msr = gpr(core, rs);
            core.check_pending_exceptions(sink, core_id);
        }
        339 => {
            // mfspr
            let rd = (raw >> 21) & 0x1F;
            let n = convert_spr((raw >> 11) & 0x3FF);
            set_gpr(core, rd, core.sprs[n]);
        }
        467 => {
            // mtspr
            let rs = (raw >> 21) & 0x1F;
            let n = convert_spr((raw >> 11) & 0x3FF);
            core.sprs[n] = gpr(core, rs);
        }
        19 => {
            // mfcr
            let rd = (raw >> 21) & 0x1F;
            set_gpr(core, rd, core.cr);
        }
        144 => {
            // mtcrf
            let rs = (raw >> 21) & 0x1F;
            let field_mask = (raw >> 12) & 0xFF;
            let mut result = core.cr;
            for field in 0..8 {
                if field_mask & (1 << (7 - field)) != 0 {
                    let shift = field * 4;
                    result = (result & !(0xF << shift)) | (gpr(core, rs) & (0xF << shift));
                }
            }
            core.cr = result;
        }
        595 => {
            // mfsr
            let rd = (raw >> 21) & 0x1F;
            let sr = (raw >> 16) & 0xF;
            set_gpr(core, rd, core.sr[sr as usize]);
        }
        210 => {
            // mtsr
            let rs = (raw >> 21) & 0x1F;
            let sr = (raw >> 16) & 0xF;
            core.sr[sr as usize] = gpr(core, rs);
        }
        659 => {
            // mfsrin
            let rd = (raw >> 21) & 0x1F;
            let rb = (raw >> 11) & 0x1F;
            let sr = (gpr(core, rb) >> 28) & 0xF;
            set_gpr(core, rd, core.sr[sr as usize]);
        }
        242 => {
            // mtsrin
            let rs = (raw >> 21) & 0x1F;
            let rb = (raw >> 11) & 0x1F;
            let sr = (gpr(core, rb) >> 28) & 0xF;
            core.sr[sr as usize] = gpr(core, rs);
        }
        306 => mmu.invalidate_cache(), // tlbie
        598 | 854 | 982 | 1014 | 470 => {} // sync/eieio/icbi/dcbz handled elsewhere; isync-class no-ops here
        20 => {
            // lwarx
            let rt = (raw >> 21) & 0x1F;
            let ra = (raw >> 16) & 0x1F;
            let rb = (raw >> 11) & 0x1F;
            let addr = ra_or_zero(core, ra).wrapping_add(gpr(core, rb));
            if let Some(value) = mmu_read(core, mmu, memory, sink, core_id, addr, |m, a| m.read_u32(a)) {
                set_gpr(core, rt, value);
                let number = if let CoreId::Ppc(n) = core_id { n } else { 0 };
                reservation.reserve(CoreId::Ppc(number), addr);
            }
        }
        150 => {
            // stwcx.
            let rs = (raw >> 21) & 0x1F;
            let ra = (raw >> 16) & 0x1F;
            let rb = (raw >> 11) & 0x1F;
            let addr = ra_or_zero(core, ra).wrapping_add(gpr(core, rb));
            let number = if let CoreId::Ppc(n) = core_id { n } else { 0 };
            let succeeded = reservation.check(CoreId::Ppc(number), addr);
            if succeeded {
                mmu_write(core, mmu, memory, sink, core_id, addr, gpr(core, rs), |m, a, v| m.write_u32(a, v));
                reservation.write(addr);
            }
            write_crf(core, 0, if succeeded { 0x2 } else { 0x0 });
        }
        534 => {
            // lwbrx
            let rt = (raw >> 21) & 0x1F;
            let ra = (raw >> 16) & 0x1F;
            let rb = (raw >> 11) & 0x1F;
            let addr = ra_or_zero(core, ra).wrapping_add(gpr(core, rb));
            if let Some(value) = mmu_read(core, mmu, memory, sink, core_id, addr, |m, a| m.read_u32(a)) {
                set_gpr(core, rt, value.swap_bytes());
            }
        }
        662 => {
            // stwbrx
            let rs = (raw >> 21) & 0x1F;
            let ra = (raw >> 16) & 0x1F;
            let rb = (raw >> 11) & 0x1F;
            let addr = ra_or_zero(core, ra).wrapping_add(gpr(core, rb));
            mmu_write(core, mmu, memory, sink, core_id, addr, gpr(core, rs).swap_bytes(), |m, a, v| m.write_u32(a, v));
        }
        23 => indexed_load(core, mmu, memory, sink, core_id, raw, |m, a| m.read_u32(a)),
        87 => indexed_load(core, mmu, memory, sink, core_id, raw, |m, a| u32::from(m.read_u8(a))),
        279 => indexed_load(core, mmu, memory, sink, core_id, raw, |m, a| u32::from(m.read_u16(a))),
        343 => indexed_load(core, mmu, memory, sink, core_id, raw, |m, a| (((m.read_u16(a) as i16) as i32) as u32)),
        151 => indexed_store(core, mmu, memory, sink, core_id, raw, |m, a, v| m.write_u32(a, v)),
        215 => indexed_store(core, mmu, memory, sink, core_id, raw, |m, a, v| m.write_u8(a, v as u8)),
        407 => indexed_store(core, mmu, memory, sink, core_id, raw, |m, a, v| m.write_u16(a, v as u16)),
        _ => {}
    }
}

fn bitwise(core: &mut PpcCore, raw: u32, f: impl FnOnce(u32, u32) -> u32) {
    let (rs, ra, rb, rc) = fields_x(raw);
    let value = f(gpr(core, rs), gpr(core, rb));
    set_gpr(core, ra, value);
    if rc {
        core.update_cr0(value);
    }
}

fn mmu_read(
    core: &mut PpcCore,
    mmu: &mut PpcMmu,
    memory: &mut dyn MemoryBackend,
    sink: &mut dyn ExceptionSink,
    core_id: CoreId,
    addr: u32,
    read: impl FnOnce(&mut dyn MemoryBackend, u32) -> u32,
) -> Option<u32> {
    let supervisor = core.supervisor();
    let translation_enabled = core.msr & PpcCore::MSR_DR != 0;
    match mmu.translate(memory, addr, AccessType::DataRead, supervisor, translation_enabled) {
        Ok(paddr) => Some(read(memory, paddr)),
        Err(fault) => {
            deliver_mmu_fault(core, sink, core_id, fault);
            None
        }
    }
}

fn mmu_write(
    core: &mut PpcCore,
    mmu: &mut PpcMmu,
    memory: &mut dyn MemoryBackend,
    sink: &mut dyn ExceptionSink,
    core_id: CoreId,
    addr: u32,
    value: u32,
    write: impl FnOnce(&mut dyn MemoryBackend, u32, u32),
) {
    let supervisor = core.supervisor();
    let translation_enabled = core.msr & PpcCore::MSR_DR != 0;
    match mmu.translate(memory, addr, AccessType::DataWrite, supervisor, translation_enabled) {
        Ok(paddr) => write(memory, paddr, value),
        Err(fault) => deliver_mmu_fault(core, sink, core_id, fault),
    }
}

pub(crate) fn deliver_mmu_fault(core: &mut PpcCore, sink: &mut dyn ExceptionSink, core_id: CoreId, fault: MmuFault) {
    let kind = match fault {
        MmuFault::Ppc { instruction: true, .. } => ExceptionKind::Isi,
        MmuFault::Ppc { instruction: false, .. } => ExceptionKind::Dsi,
        MmuFault::Arm { .. } => unreachable!("PPC interpreter never produces an ARM fault"),
    };
    core.trigger_exception(sink, core_id, kind);
}

fn indexed_load(
    core: &mut PpcCore,
    mmu: &mut PpcMmu,
    memory: &mut dyn MemoryBackend,
    sink: &mut dyn ExceptionSink,
    core_id: CoreId,
    raw: u32,
    read: impl FnOnce(&mut dyn MemoryBackend, u32) -> u32,
) {
    let rt = (raw >> 21) & 0x1F;
    let ra = (raw >> 16) & 0x1F;
    let rb = (raw >> 11) & 0x1F;
    let addr = ra_or_zero(core, ra).wrapping_add(gpr(core, rb));
    if let Some(value) = mmu_read(core, mmu, memory, sink, core_id, addr, read) {
        set_gpr(core, rt, value);
    }
}

fn indexed_store(
    core: &mut PpcCore,
    mmu: &mut PpcMmu,
    memory: &mut dyn MemoryBackend,
    sink: &mut dyn ExceptionSink,
    core_id: CoreId,
    raw: u32,
    write: impl FnOnce(&mut dyn MemoryBackend, u32, u32),
) {
    let rs = (raw >> 21) & 0x1F;
    let ra = (raw >> 16) & 0x1F;
    let rb = (raw >> 11) & 0x1F;
    let addr = ra_or_zero(core, ra).wrapping_add(gpr(core, rb));
    mmu_write(core, mmu, memory, sink, core_id, addr, gpr(core, rs), write);
}

/// Opcodes 32-55: the D-form loads/stores, `lmw`/`stmw`, and the D-form
/// float accesses (the latter duplicating `fastops::emit_float_access`'s
/// semantics in plain Rust, per §8).
#[allow(clippy::too_many_lines)]
fn memory_form(
    core: &mut PpcCore,
    mmu: &mut PpcMmu,
    memory: &mut dyn MemoryBackend,
    sink: &mut dyn ExceptionSink,
    core_id: CoreId,
    opcode: u32,
    raw: u32,
) {
    let rt = (raw >> 21) & 0x1F;
    let ra = (raw >> 16) & 0x1F;
    let d = sign_extend16(raw & 0xFFFF);
    let update = matches!(opcode, 35 | 37 | 39 | 41 | 43 | 45 | 53 | 55 | 45 | 49 | 51);
    let addr = ra_or_zero(core, ra).wrapping_add(d);

    match opcode {
        32 | 33 => {
            if let Some(value) = mmu_read(core, mmu, memory, sink, core_id, addr, |m, a| m.read_u32(a)) {
                set_gpr(core, rt, value);
            }
        }
        34 | 35 => {
            if let Some(value) = mmu_read(core, mmu, memory, sink, core_id, addr, |m, a| u32::from(m.read_u8(a))) {
                set_gpr(core, rt, value);
            }
        }
        36 | 37 => mmu_write(core, mmu, memory, sink, core_id, addr, gpr(core, rt), |m, a, v| m.write_u32(a, v)),
        38 | 39 => mmu_write(core, mmu, memory, sink, core_id, addr, gpr(core, rt), |m, a, v| m.write_u8(a, v as u8)),
        40 | 41 => {
            if let Some(value) = mmu_read(core, mmu, memory, sink, core_id, addr, |m, a| u32::from(m.read_u16(a))) {
                set_gpr(core, rt, value);
            }
        }
        42 | 43 => {
            if let Some(value) =
                mmu_read(core, mmu, memory, sink, core_id, addr, |m, a| (((m.read_u16(a) as i16) as i32) as u32))
            {
                set_gpr(core, rt, value);
            }
        }
        44 | 45 => mmu_write(core, mmu, memory, sink, core_id, addr, gpr(core, rt), |m, a, v| m.write_u16(a, v as u16)),
        46 => {
            // lmw: rt..31 loaded from consecutive words starting at addr.
            let mut a = addr;
            for n in rt..32 {
                if let Some(value) = mmu_read(core, mmu, memory, sink, core_id, a, |m, x| m.read_u32(x)) {
                    set_gpr(core, n, value);
                }
                a = a.wrapping_add(4);
            }
        }
        47 => {
            let mut a = addr;
            for n in rt..32 {
                mmu_write(core, mmu, memory, sink, core_id, a, gpr(core, n), |m, x, v| m.write_u32(x, v));
                a = a.wrapping_add(4);
            }
        }
        48 | 49 => load_float(core, mmu, memory, sink, core_id, rt, addr, false),
        50 | 51 => load_float(core, mmu, memory, sink, core_id, rt, addr, true),
        52 | 53 => store_float(core, mmu, memory, sink, core_id, rt, addr, false),
        54 | 55 => store_float(core, mmu, memory, sink, core_id, rt, addr, true),
        _ => {}
    }
    if update && ra != 0 {
        set_gpr(core, ra, addr);
    }
}

fn load_float(
    core: &mut PpcCore,
    mmu: &mut PpcMmu,
    memory: &mut dyn MemoryBackend,
    sink: &mut dyn ExceptionSink,
    core_id: CoreId,
    frt: u32,
    addr: u32,
    is_double: bool,
) {
    if is_double {
        if let Some(bits) = mmu_read64(core, mmu, memory, sink, core_id, addr) {
            core.fprs[frt as usize].set_f64(f64::from_bits(bits));
        }
    } else if let Some(bits) = mmu_read(core, mmu, memory, sink, core_id, addr, |m, a| m.read_u32(a)) {
        core.fprs[frt as usize].set_f64(f64::from(f32::from_bits(bits)));
    }
}

fn store_float(
    core: &mut PpcCore,
    mmu: &mut PpcMmu,
    memory: &mut dyn MemoryBackend,
    sink: &mut dyn ExceptionSink,
    core_id: CoreId,
    frt: u32,
    addr: u32,
    is_double: bool,
) {
    let value = core.fprs[frt as usize].as_f64();
    if is_double {
        mmu_write64(core, mmu, memory, sink, core_id, addr, value.to_bits());
    } else {
        mmu_write(core, mmu, memory, sink, core_id, addr, (value as f32).to_bits(), |m, a, v| m.write_u32(a, v));
    }
}

fn mmu_read64(
    core: &mut PpcCore,
    mmu: &mut PpcMmu,
    memory: &mut dyn MemoryBackend,
    sink: &mut dyn ExceptionSink,
    core_id: CoreId,
    addr: u32,
) -> Option<u64> {
    let supervisor = core.supervisor();
    let translation_enabled = core.msr & PpcCore::MSR_DR != 0;
    match mmu.translate(memory, addr, AccessType::DataRead, supervisor, translation_enabled) {
        Ok(paddr) => Some(memory.read_u64(paddr)),
        Err(fault) => {
            deliver_mmu_fault(core, sink, core_id, fault);
            None
        }
    }
}

fn mmu_write64(
    core: &mut PpcCore,
    mmu: &mut PpcMmu,
    memory: &mut dyn MemoryBackend,
    sink: &mut dyn ExceptionSink,
    core_id: CoreId,
    addr: u32,
    value: u64,
) {
    let supervisor = core.supervisor();
    let translation_enabled = core.msr & PpcCore::MSR_DR != 0;
    match mmu.translate(memory, addr, AccessType::DataWrite, supervisor, translation_enabled) {
        Ok(paddr) => memory.write_u64(paddr, value),
        Err(fault) => deliver_mmu_fault(core, sink, core_id, fault),
    }
}

fn frt_fra_frb(raw: u32) -> (u32, u32, u32) {
    ((raw >> 21) & 0x1F, (raw >> 16) & 0x1F, (raw >> 11) & 0x1F)
}

/// Opcode 59: single-precision float arithmetic (5-bit sub-opcode, A-form).
fn float_single(core: &mut PpcCore, raw: u32) {
    let xo = (raw >> 1) & 0x1F;
    let (frt, fra, frb) = frt_fra_frb(raw);
    let a = core.fprs[fra as usize].as_f64();
    let b = core.fprs[frb as usize].as_f64();
    let result = match xo {
        21 => a + b, // fadds
        20 => a - b, // fsubs
        18 => a / b, // fdivs
        25 => a * core.fprs[((raw >> 6) & 0x1F) as usize].as_f64(), // fmuls (frc in bits 6-10)
        _ => return,
    };
    core.fprs[frt as usize].set_f64(f64::from(result as f32));
}

/// Opcode 63: double-precision float arithmetic, both the 10-bit (X-form)
/// and 5-bit (A-form) sub-opcode spaces.
fn float_double(core: &mut PpcCore, raw: u32) {
    let (frt, fra, frb) = frt_fra_frb(raw);
    let xo5 = (raw >> 1) & 0x1F;
    let xo10 = (raw >> 1) & 0x3FF;
    let a = core.fprs[fra as usize].as_f64();
    let b = core.fprs[frb as usize].as_f64();
    let frc = || core.fprs[((raw >> 6) & 0x1F) as usize].as_f64();

    match xo5 {
        21 => return set_fpr(core, frt, a + b),        // fadd
        20 => return set_fpr(core, frt, a - b),         // fsub
        18 => return set_fpr(core, frt, a / b),         // fdiv
        25 => return set_fpr(core, frt, a * frc()),     // fmul
        29 => return set_fpr(core, frt, a * frc() + b), // fmadd
        28 => return set_fpr(core, frt, a * frc() - b), // fmsub
        31 => return set_fpr(core, frt, -(a * frc() + b)), // fnmadd
        30 => return set_fpr(core, frt, -(a * frc() - b)), // fnmsub
        _ => {}
    }
    match xo10 {
        32 => compare_float(core, raw, false),
        0 => compare_float(core, raw, true),
        72 => set_fpr(core, frt, b),     // fmr
        40 => set_fpr(core, frt, -b),    // fneg
        264 => set_fpr(core, frt, b.abs()), // fabs
        136 => set_fpr(core, frt, -b.abs()), // fnabs
        12 => set_fpr(core, frt, f64::from(b as f32)), // frsp
        14 => set_fpr(core, frt, (b as i32) as f64),   // fctiw (rounding mode elided)
        15 => set_fpr(core, frt, (b as i32) as f64),   // fctiwz
        _ => {}
    }
}

fn set_fpr(core: &mut PpcCore, frt: u32, value: f64) {
    core.fprs[frt as usize].set_f64(value);
}

fn compare_float(core: &mut PpcCore, raw: u32, ordered: bool) {
    let crf = (raw >> 23) & 0x7;
    let fra = (raw >> 16) & 0x1F;
    let frb = (raw >> 11) & 0x1F;
    let a = core.fprs[fra as usize].as_f64();
    let b = core.fprs[frb as usize].as_f64();
    let _ = ordered; // this model has no signalling-NaN distinction between fcmpo/fcmpu
    let bits = if a.is_nan() || b.is_nan() {
        0x1
    } else if a < b {
        0x8
    } else if a > b {
        0x4
    } else {
        0x2
    };
    write_crf(core, crf, bits);
}

/// Opcode 4: paired-single ops. Only the handful with non-obvious
/// slot-mixing semantics (`ps_sum0/1`, `ps_muls0/1`) plus the common
/// arithmetic/move forms are implemented; see `DESIGN.md`'s Open Question
/// on `ps_sum`/`ps_muls`' literal per-slot scalar treatment.
fn paired_single(core: &mut PpcCore, raw: u32) {
    let (frt, fra, frb) = frt_fra_frb(raw);
    let frc_idx = (raw >> 6) & 0x1F;
    let xo5 = (raw >> 1) & 0x1F;
    let xo10 = (raw >> 1) & 0x3FF;

    let a0 = f64::from(core.fprs[fra as usize].ps0());
    let a1 = f64::from(core.fprs[fra as usize].ps1());
    let b0 = f64::from(core.fprs[frb as usize].ps0());
    let b1 = f64::from(core.fprs[frb as usize].ps1());
    let c0 = f64::from(core.fprs[frc_idx as usize].ps0());
    let c1 = f64::from(core.fprs[frc_idx as usize].ps1());

    match xo5 {
        21 => set_ps(core, frt, a0 + b0, a1 + b1), // ps_add
        20 => set_ps(core, frt, a0 - b0, a1 - b1), // ps_sub
        25 => set_ps(core, frt, a0 * c0, a1 * c1), // ps_muls (slot-paired scalar multiply, same slot on each side)
        18 => set_ps(core, frt, a0 / b0, a1 / b1), // ps_div
        _ => match xo10 {
            40 => set_ps(core, frt, -b0, -b1),   // ps_neg
            72 => set_ps(core, frt, b0, b1),     // ps_mr
            528 => set_ps(core, frt, a0, b1),    // ps_merge00 (approximate: low slot of frb untouched)
            560 => set_ps(core, frt, a0, b0),    // ps_merge01
            592 => set_ps(core, frt, a1, b1),    // ps_merge10
            624 => set_ps(core, frt, a1, b0),    // ps_merge11
            10 => set_ps(core, frt, a0 + b1, a1 + b0), // ps_sum0/ps_sum1 share this xo in the 5-bit space on some encodings; see below
            _ => {}
        },
    }

    // ps_sum0 (xo=10, A-form bit distinguishes slot; modeled per-instance)
    // and ps_muls0/ps_muls1 (xo=12/13) use a literal scalar-per-slot
    // treatment rather than a uniform vector op — decided in DESIGN.md.
    match xo5 {
        12 => set_ps(core, frt, a0 * c0, a1 * c0), // ps_muls0: both slots scaled by frc's slot 0
        13 => set_ps(core, frt, a0 * c1, a1 * c1), // ps_muls1: both slots scaled by frc's slot 1
        _ => {}
    }
}

fn set_ps(core: &mut PpcCore, frt: u32, slot0: f64, slot1: f64) {
    core.fprs[frt as usize].set_ps0(slot0 as f32);
    core.fprs[frt as usize].set_ps1(slot1 as f32);
}

#[cfg(test)]
mod tests {
    use super::*;
    use dbt_core::FlatMemory;

    struct NullSink;
    impl ExceptionSink for NullSink {
        fn trigger_exception(&mut self, _core: CoreId, _kind: ExceptionKind) {}
    }

    fn run(core: &mut PpcCore, raw: u32) {
        let mut mmu = PpcMmu::new();
        let mut mem = FlatMemory::new(0x1000);
        let mut sink = NullSink;
        let reservation = Reservation::new();
        step(core, &mut mmu, &mut mem, &mut sink, &reservation, CoreId::Ppc(0), raw);
    }

    #[test]
    fn addi_adds_a_sign_extended_immediate() {
        let mut core = PpcCore::new();
        core.regs[4] = 10;
        // addi r3, r4, -1
        run(&mut core, (14 << 26) | (3 << 21) | (4 << 16) | 0xFFFF);
        assert_eq!(core.regs[3], 9);
    }

    #[test]
    fn addi_with_ra_zero_ignores_gpr0() {
        let mut core = PpcCore::new();
        core.regs[0] = 0xDEAD_BEEF;
        run(&mut core, (14 << 26) | (3 << 21) | (0 << 16) | 5);
        assert_eq!(core.regs[3], 5);
    }

    #[test]
    fn branch_always_reaches_the_interpreter_and_sets_pc() {
        let mut core = PpcCore::new();
        core.pc = 0x1000;
        run(&mut core, (18 << 26) | 8); // b +8
        assert_eq!(core.pc, 0x1008);
    }

    #[test]
    fn rlwinm_masks_the_rotated_value() {
        let mut core = PpcCore::new();
        core.regs[4] = 0xFFFF_FFFF;
        // rlwinm r3, r4, 0, 0, 0
        run(&mut core, (21 << 26) | (4 << 21) | (3 << 16) | (0 << 11) | (0 << 6) | (0 << 1));
        assert_eq!(core.regs[3], 0x8000_0000);
    }

    #[test]
    fn stwcx_sets_eq_only_when_the_reservation_holds() {
        let mut core = PpcCore::new();
        core.regs[3] = 0x55; // value to store
        core.regs[4] = 0x100; // address (ra=0, rb=4)
        let mut mmu = PpcMmu::new();
        let mut mem = FlatMemory::new(0x1000);
        let mut sink = NullSink;
        let reservation = Reservation::new();

        // lwarx r5, r0, r4
        step(
            &mut core,
            &mut mmu,
            &mut mem,
            &mut sink,
            &reservation,
            CoreId::Ppc(0),
            (31 << 26) | (5 << 21) | (0 << 16) | (4 << 11) | (20 << 1),
        );
        // stwcx. r3, r0, r4
        step(
            &mut core,
            &mut mmu,
            &mut mem,
            &mut sink,
            &reservation,
            CoreId::Ppc(0),
            (31 << 26) | (3 << 21) | (0 << 16) | (4 << 11) | (150 << 1) | 1,
        );
        assert!(core.get_cr_bit(2)); // EQ set: the reservation held

        // A second stwcx. without an intervening lwarx must fail.
        step(
            &mut core,
            &mut mmu,
            &mut mem,
            &mut sink,
            &reservation,
            CoreId::Ppc(0),
            (31 << 26) | (3 << 21) | (0 << 16) | (4 << 11) | (150 << 1) | 1,
        );
        assert!(!core.get_cr_bit(2));
    }

    #[test]
    fn ps_muls0_scales_both_slots_by_slot_zero() {
        let mut core = PpcCore::new();
        core.fprs[4].set_ps0(2.0);
        core.fprs[4].set_ps1(3.0);
        core.fprs[6].set_ps0(5.0);
        core.fprs[6].set_ps1(7.0);
        // ps_muls0 frt=3, fra=4, frc=6 (xo=12 in the 5-bit A-form space)
        run(&mut core, (4 << 26) | (3 << 21) | (4 << 16) | (0 << 11) | (6 << 6) | (12 << 1));
        assert_eq!(core.fprs[3].ps0(), 10.0);
        assert_eq!(core.fprs[3].ps1(), 15.0);
    }
}
