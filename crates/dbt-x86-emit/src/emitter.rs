use crate::Register;

/// A seekable, growable buffer of raw x86-64 bytes.
///
/// `seek`/`tell`/`size` let a caller lay out variable-length bodies first
/// and come back to fill in a fixed-size trampoline table afterwards —
/// writing at a position at or before the current end overwrites bytes in
/// place; writing at the end appends and grows the buffer.
#[derive(Debug, Default)]
pub struct Emitter {
    buf: Vec<u8>,
    pos: usize,
}

impl Emitter {
    #[must_use]
    pub fn new() -> Self {
        Emitter { buf: Vec::new(), pos: 0 }
    }

    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Emitter { buf: Vec::with_capacity(capacity), pos: 0 }
    }

    pub fn seek(&mut self, pos: usize) {
        self.pos = pos;
    }

    #[must_use]
    pub fn tell(&self) -> usize {
        self.pos
    }

    /// Number of bytes written so far (the buffer's current length, not
    /// its allocated capacity).
    #[must_use]
    pub fn size(&self) -> usize {
        self.buf.len()
    }

    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.buf
    }

    /// True if `value`, read as a 32-bit two's-complement displacement,
    /// fits in a signed byte (the short-jump / disp8 fast path).
    #[must_use]
    pub fn is_i8(value: i32) -> bool {
        i8::try_from(value).is_ok()
    }

    fn put(&mut self, bytes: &[u8]) {
        let end = self.pos + bytes.len();
        if end > self.buf.len() {
            self.buf.resize(end, 0);
        }
        self.buf[self.pos..end].copy_from_slice(bytes);
        self.pos = end;
    }

    fn u8(&mut self, value: u8) {
        self.put(&[value]);
    }

    fn u32(&mut self, value: u32) {
        self.put(&value.to_le_bytes());
    }

    fn u64(&mut self, value: u64) {
        self.put(&value.to_le_bytes());
    }

    /// REX.W — selects 64-bit operand size for the instruction that follows.
    fn rex(&mut self) {
        self.u8(0x48);
    }

    /// ModRM + optional SIB + displacement for a memory operand
    /// `[base + offset]`. `reg_bits` is the reg field, already shifted
    /// into bits 5:3.
    ///
    /// Picks the smallest encoding the offset allows: `mod=00` with no
    /// displacement when the offset is zero and `base` isn't RBP (RBP in
    /// the `mod=00` form is the RIP-relative escape, not "no
    /// displacement"), `mod=01` with a one-byte displacement when the
    /// offset fits `i8`, and `mod=10` with a four-byte displacement
    /// otherwise. RSP (and only RSP) always needs a SIB byte to mean
    /// "no index, base = RSP" rather than triggering its own escape.
    fn displace(&mut self, reg_bits: u8, base: Register, offset: i32) {
        let base_bits = base as u8;
        if offset == 0 && base != Register::Rbp {
            self.u8(reg_bits | base_bits);
            if base == Register::Rsp {
                self.u8(0x24);
            }
        } else if Self::is_i8(offset) {
            self.u8(reg_bits | 0x40 | base_bits);
            if base == Register::Rsp {
                self.u8(0x24);
            }
            self.u8(offset as i8 as u8);
        } else {
            self.u8(reg_bits | 0x80 | base_bits);
            if base == Register::Rsp {
                self.u8(0x24);
            }
            self.u32(offset as u32);
        }
    }

    pub fn ret(&mut self) {
        self.u8(0xC3);
    }

    /// `cmc` — flips CF, used to convert a borrow-out into a carry-in (or
    /// back) around `sbb`.
    pub fn flip_carry(&mut self) {
        self.u8(0xF5);
    }

    pub fn push_reg64(&mut self, reg: Register) {
        self.u8(0x50 + reg as u8);
    }

    pub fn pop_reg64(&mut self, reg: Register) {
        self.u8(0x58 + reg as u8);
    }

    pub fn mov_reg32(&mut self, dest: Register, source: Register) {
        self.u8(0x89);
        self.u8(0xC0 | (source as u8) << 3 | dest as u8);
    }

    pub fn mov_reg64(&mut self, dest: Register, source: Register) {
        self.rex();
        self.u8(0x89);
        self.u8(0xC0 | (source as u8) << 3 | dest as u8);
    }

    pub fn mov_imm32(&mut self, dest: Register, value: u32) {
        self.u8(0xB8 + dest as u8);
        self.u32(value);
    }

    pub fn mov_imm64(&mut self, dest: Register, value: u64) {
        self.rex();
        self.u8(0xB8 + dest as u8);
        self.u64(value);
    }

    pub fn load_mem32(&mut self, dest: Register, base: Register, offset: i32) {
        self.u8(0x8B);
        self.displace((dest as u8) << 3, base, offset);
    }

    pub fn load_mem64(&mut self, dest: Register, base: Register, offset: i32) {
        self.rex();
        self.u8(0x8B);
        self.displace((dest as u8) << 3, base, offset);
    }

    pub fn store_mem32(&mut self, base: Register, offset: i32, source: Register) {
        self.u8(0x89);
        self.displace((source as u8) << 3, base, offset);
    }

    pub fn store_mem64(&mut self, base: Register, offset: i32, source: Register) {
        self.rex();
        self.u8(0x89);
        self.displace((source as u8) << 3, base, offset);
    }

    pub fn store_mem_imm32(&mut self, base: Register, offset: i32, value: u32) {
        self.u8(0xC7);
        self.displace(0, base, offset);
        self.u32(value);
    }

    pub fn lea64(&mut self, reg: Register, base: Register, offset: i32) {
        self.rex();
        self.u8(0x8D);
        self.displace((reg as u8) << 3, base, offset);
    }

    /// `bswap` — used to flip endianness between the big-endian guest view
    /// of memory and the host's native little-endian loads/stores.
    pub fn swap32(&mut self, reg: Register) {
        self.u8(0x0F);
        self.u8(0xC8 + reg as u8);
    }

    pub fn add_reg_reg32(&mut self, reg: Register, other: Register) {
        self.u8(0x01);
        self.u8(0xC0 | (other as u8) << 3 | reg as u8);
    }

    pub fn add_reg_imm32(&mut self, reg: Register, value: u32) {
        self.u8(0x81);
        self.u8(0xC0 | reg as u8);
        self.u32(value);
    }

    pub fn add_reg_imm64(&mut self, reg: Register, value: u32) {
        self.rex();
        self.add_reg_imm32(reg, value);
    }

    pub fn add_mem_reg32(&mut self, base: Register, offset: i32, other: Register) {
        self.u8(0x01);
        self.displace((other as u8) << 3, base, offset);
    }

    pub fn add_mem_imm32(&mut self, base: Register, offset: i32, value: u32) {
        self.u8(0x81);
        self.displace(0, base, offset);
        self.u32(value);
    }

    pub fn add_reg_mem32(&mut self, reg: Register, base: Register, offset: i32) {
        self.u8(0x03);
        self.displace((reg as u8) << 3, base, offset);
    }

    pub fn sub_reg_reg32(&mut self, reg: Register, other: Register) {
        self.u8(0x29);
        self.u8(0xC0 | (other as u8) << 3 | reg as u8);
    }

    pub fn sub_reg_imm32(&mut self, reg: Register, value: u32) {
        self.u8(0x81);
        self.u8(0xE8 | reg as u8);
        self.u32(value);
    }

    pub fn sub_reg_imm64(&mut self, reg: Register, value: u32) {
        self.rex();
        self.sub_reg_imm32(reg, value);
    }

    pub fn adc_reg_reg32(&mut self, reg: Register, other: Register) {
        self.u8(0x11);
        self.u8(0xC0 | (other as u8) << 3 | reg as u8);
    }

    pub fn adc_reg_imm32(&mut self, reg: Register, value: u32) {
        self.u8(0x81);
        self.u8(0xD0 | reg as u8);
        self.u32(value);
    }

    pub fn sbb_reg_reg32(&mut self, reg: Register, other: Register) {
        self.u8(0x19);
        self.u8(0xC0 | (other as u8) << 3 | reg as u8);
    }

    pub fn sbb_reg_imm32(&mut self, reg: Register, value: u32) {
        self.u8(0x81);
        self.u8(0xD8 | reg as u8);
        self.u32(value);
    }

    pub fn mul_reg32(&mut self, reg: Register) {
        self.u8(0xF7);
        self.u8(0xE0 | reg as u8);
    }

    pub fn neg_reg32(&mut self, reg: Register) {
        self.u8(0xF7);
        self.u8(0xD8 | reg as u8);
    }

    pub fn dec_mem32(&mut self, base: Register, offset: i32) {
        self.u8(0xFF);
        self.displace(0x08, base, offset);
    }

    pub fn shl_reg32(&mut self, reg: Register) {
        self.u8(0xD3);
        self.u8(0xE0 | reg as u8);
    }

    pub fn shr_reg32(&mut self, reg: Register) {
        self.u8(0xD3);
        self.u8(0xE8 | reg as u8);
    }

    pub fn sar_reg32(&mut self, reg: Register) {
        self.u8(0xD3);
        self.u8(0xF8 | reg as u8);
    }

    pub fn rol_reg32(&mut self, reg: Register) {
        self.u8(0xD3);
        self.u8(0xC0 | reg as u8);
    }

    pub fn ror_reg32(&mut self, reg: Register) {
        self.u8(0xD3);
        self.u8(0xC8 | reg as u8);
    }

    fn shift_imm32(&mut self, reg: Register, bits: u8, modrm_base: u8) {
        if bits == 1 {
            self.u8(0xD1);
            self.u8(modrm_base | reg as u8);
        } else {
            self.u8(0xC1);
            self.u8(modrm_base | reg as u8);
            self.u8(bits);
        }
    }

    pub fn shl_imm32(&mut self, reg: Register, bits: u8) {
        self.shift_imm32(reg, bits, 0xE0);
    }

    pub fn shr_imm32(&mut self, reg: Register, bits: u8) {
        self.shift_imm32(reg, bits, 0xE8);
    }

    pub fn sar_imm32(&mut self, reg: Register, bits: u8) {
        self.shift_imm32(reg, bits, 0xF8);
    }

    pub fn rol_imm32(&mut self, reg: Register, bits: u8) {
        self.shift_imm32(reg, bits, 0xC0);
    }

    pub fn ror_imm32(&mut self, reg: Register, bits: u8) {
        self.shift_imm32(reg, bits, 0xC8);
    }

    pub fn rcr_imm32(&mut self, reg: Register, bits: u8) {
        self.shift_imm32(reg, bits, 0xD8);
    }

    pub fn and_reg_reg32(&mut self, reg: Register, other: Register) {
        self.u8(0x21);
        self.u8(0xC0 | (other as u8) << 3 | reg as u8);
    }

    pub fn and_reg_imm32(&mut self, reg: Register, value: u32) {
        self.u8(0x81);
        self.u8(0xE0 | reg as u8);
        self.u32(value);
    }

    pub fn and_mem_imm32(&mut self, base: Register, offset: i32, value: u32) {
        self.u8(0x81);
        self.displace(0x20, base, offset);
        self.u32(value);
    }

    pub fn or_reg_reg32(&mut self, reg: Register, other: Register) {
        self.u8(0x0B);
        self.u8(0xC0 | (reg as u8) << 3 | other as u8);
    }

    pub fn or_reg_imm32(&mut self, reg: Register, value: u32) {
        self.u8(0x81);
        self.u8(0xC8 | reg as u8);
        self.u32(value);
    }

    pub fn or_mem_reg32(&mut self, base: Register, offset: i32, reg: Register) {
        self.u8(0x09);
        self.displace((reg as u8) << 3, base, offset);
    }

    pub fn or_mem_imm32(&mut self, base: Register, offset: i32, value: u32) {
        self.u8(0x81);
        self.displace(0x08, base, offset);
        self.u32(value);
    }

    pub fn xor_reg_reg32(&mut self, reg: Register, other: Register) {
        self.u8(0x33);
        self.u8(0xC0 | (reg as u8) << 3 | other as u8);
    }

    pub fn xor_reg_imm32(&mut self, reg: Register, value: u32) {
        self.u8(0x81);
        self.u8(0xF0 | reg as u8);
        self.u32(value);
    }

    pub fn not_reg32(&mut self, reg: Register) {
        self.u8(0xF7);
        self.u8(0xD0 | reg as u8);
    }

    /// Absolute indirect call through a materialized 64-bit immediate.
    /// `temp` is clobbered.
    pub fn call_abs(&mut self, temp: Register, addr: u64) {
        self.mov_imm64(temp, addr);
        self.u8(0xFF);
        self.u8(0xD0 | temp as u8);
    }

    /// Relative jump, encoded as the short (`EB`, 1-byte displacement)
    /// form when it fits, else the near (`E9`, 4-byte displacement) form.
    /// `offset` is relative to the byte after the encoded instruction, so
    /// the caller must account for the encoding it is about to pick when
    /// computing it (trampoline cells always use the 5-byte form for this
    /// reason — see `dbt-jit`).
    pub fn jump_rel(&mut self, offset: i32) {
        if Self::is_i8(offset) {
            self.u8(0xEB);
            self.u8(offset as i8 as u8);
        } else {
            self.u8(0xE9);
            self.u32(offset as u32);
        }
    }

    /// Always-near relative jump (`E9`, 4-byte displacement) regardless of
    /// whether `offset` would fit a short form. Trampoline cells need a
    /// fixed 5-byte size so `table + 5*index` stays valid after any cell
    /// is repatched — `jump_rel`'s auto-selection would shrink a
    /// short-reaching cell and desync every later index.
    pub fn jump_rel_near(&mut self, offset: i32) {
        self.u8(0xE9);
        self.u32(offset as u32);
    }

    /// Absolute indirect jump (tail call) through a materialized 64-bit
    /// immediate. `temp` is clobbered.
    pub fn jump_abs(&mut self, temp: Register, addr: u64) {
        self.mov_imm64(temp, addr);
        self.u8(0xFF);
        self.u8(0xE0 | temp as u8);
    }

    pub fn jump_if_carry(&mut self, offset: i8) {
        self.u8(0x72);
        self.u8(offset as u8);
    }

    pub fn jump_if_not_carry(&mut self, offset: i8) {
        self.u8(0x73);
        self.u8(offset as u8);
    }

    pub fn jump_if_overflow(&mut self, offset: i8) {
        self.u8(0x70);
        self.u8(offset as u8);
    }

    pub fn jump_if_not_overflow(&mut self, offset: i8) {
        self.u8(0x71);
        self.u8(offset as u8);
    }

    pub fn jump_if_zero(&mut self, offset: i8) {
        self.u8(0x74);
        self.u8(offset as u8);
    }

    pub fn jump_if_not_zero(&mut self, offset: i8) {
        self.u8(0x75);
        self.u8(offset as u8);
    }

    pub fn jump_if_sign(&mut self, offset: i8) {
        self.u8(0x78);
        self.u8(offset as u8);
    }

    pub fn jump_if_not_sign(&mut self, offset: i8) {
        self.u8(0x79);
        self.u8(offset as u8);
    }

    /// Alias of `jump_if_zero` under the name its callers use when testing
    /// equality rather than a zero result.
    pub fn jump_if_equal(&mut self, offset: i8) {
        self.jump_if_zero(offset);
    }

    pub fn jump_if_not_equal(&mut self, offset: i8) {
        self.jump_if_not_zero(offset);
    }

    /// Alias of `jump_if_carry` under the unsigned-comparison name.
    pub fn jump_if_below(&mut self, offset: i8) {
        self.jump_if_carry(offset);
    }

    pub fn compare_imm32(&mut self, reg: Register, value: u32) {
        if reg == Register::Rax {
            self.u8(0x3D);
            self.u32(value);
        } else {
            self.u8(0x81);
            self.u8(0xF8 | reg as u8);
            self.u32(value);
        }
    }

    pub fn test_reg32(&mut self, a: Register, b: Register) {
        self.u8(0x85);
        self.u8(0xC0 | (b as u8) << 3 | a as u8);
    }

    pub fn bit_test_reg32(&mut self, reg: Register, bit: u8) {
        self.u8(0x0F);
        self.u8(0xBA);
        self.u8(0xE0 | reg as u8);
        self.u8(bit);
    }

    pub fn bit_test_mem32(&mut self, base: Register, offset: i32, bit: u8) {
        self.u8(0x0F);
        self.u8(0xBA);
        self.displace(0x20, base, offset);
        self.u8(bit);
    }

    pub fn bit_test_set_mem32(&mut self, base: Register, offset: i32, bit: u8) {
        self.u8(0x0F);
        self.u8(0xBA);
        self.displace(0x28, base, offset);
        self.u8(bit);
    }

    pub fn bit_test_reset_mem32(&mut self, base: Register, offset: i32, bit: u8) {
        self.u8(0x0F);
        self.u8(0xBA);
        self.displace(0x30, base, offset);
        self.u8(bit);
    }

    pub fn bit_test_reset_reg32(&mut self, reg: Register, bit: u8) {
        self.u8(0x0F);
        self.u8(0xBA);
        self.u8(0xF0 | reg as u8);
        self.u8(bit);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ret_is_one_byte() {
        let mut e = Emitter::new();
        e.ret();
        assert_eq!(e.bytes(), [0xC3]);
    }

    #[test]
    fn mov_imm32_matches_expected_bytes() {
        let mut e = Emitter::new();
        e.mov_imm32(Register::Rax, 0x1234_5678);
        assert_eq!(e.bytes(), [0xB8, 0x78, 0x56, 0x34, 0x12]);
    }

    #[test]
    fn mov_imm64_has_rex_prefix_and_eight_byte_immediate() {
        let mut e = Emitter::new();
        e.mov_imm64(Register::Rdi, 0x0102_0304_0506_0708);
        assert_eq!(
            e.bytes(),
            [0x48, 0xBF, 0x08, 0x07, 0x06, 0x05, 0x04, 0x03, 0x02, 0x01]
        );
    }

    #[test]
    fn displace_uses_no_displacement_form_for_zero_offset() {
        let mut e = Emitter::new();
        e.load_mem32(Register::Rax, Register::Rdi, 0);
        // 8B /r, modrm = 00 000 111 (RAX <- [RDI])
        assert_eq!(e.bytes(), [0x8B, 0x07]);
    }

    #[test]
    fn displace_uses_disp8_form_in_range() {
        let mut e = Emitter::new();
        e.load_mem32(Register::Rax, Register::Rdi, 0x10);
        assert_eq!(e.bytes(), [0x8B, 0x47, 0x10]);
    }

    #[test]
    fn displace_uses_disp32_form_out_of_range() {
        let mut e = Emitter::new();
        e.load_mem32(Register::Rax, Register::Rdi, 0x1000);
        assert_eq!(e.bytes(), [0x8B, 0x87, 0x00, 0x10, 0x00, 0x00]);
    }

    #[test]
    fn displace_forces_disp8_for_rbp_base_even_at_zero_offset() {
        let mut e = Emitter::new();
        e.load_mem32(Register::Rax, Register::Rbp, 0);
        assert_eq!(e.bytes(), [0x8B, 0x45, 0x00]);
    }

    #[test]
    fn displace_emits_sib_byte_for_rsp_base() {
        let mut e = Emitter::new();
        e.load_mem32(Register::Rax, Register::Rsp, 0);
        assert_eq!(e.bytes(), [0x8B, 0x04, 0x24]);
    }

    #[test]
    fn seek_overwrites_in_place_without_growing() {
        let mut e = Emitter::new();
        e.ret();
        e.ret();
        let len_before = e.size();
        e.seek(0);
        e.u8(0x90);
        assert_eq!(e.size(), len_before);
        assert_eq!(e.bytes(), [0x90, 0xC3]);
    }

    #[test]
    fn jump_rel_picks_short_form_when_it_fits() {
        let mut e = Emitter::new();
        e.jump_rel(5);
        assert_eq!(e.bytes(), [0xEB, 0x05]);
    }

    #[test]
    fn jump_rel_picks_near_form_when_too_far() {
        let mut e = Emitter::new();
        e.jump_rel(0x1000);
        assert_eq!(e.bytes(), [0xE9, 0x00, 0x10, 0x00, 0x00]);
    }

    #[test]
    fn jump_rel_near_always_uses_the_five_byte_form() {
        let mut e = Emitter::new();
        e.jump_rel_near(2);
        assert_eq!(e.bytes(), [0xE9, 0x02, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn compare_imm32_has_rax_special_case() {
        let mut e = Emitter::new();
        e.compare_imm32(Register::Rax, 5);
        assert_eq!(e.bytes(), [0x3D, 0x05, 0x00, 0x00, 0x00]);

        let mut e2 = Emitter::new();
        e2.compare_imm32(Register::Rcx, 5);
        assert_eq!(e2.bytes(), [0x81, 0xF9, 0x05, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn shift_by_one_uses_shorter_encoding() {
        let mut e = Emitter::new();
        e.shl_imm32(Register::Rax, 1);
        assert_eq!(e.bytes(), [0xD1, 0xE0]);

        let mut e2 = Emitter::new();
        e2.shl_imm32(Register::Rax, 4);
        assert_eq!(e2.bytes(), [0xC1, 0xE0, 0x04]);
    }

    #[test]
    fn store_mem64_carries_a_rex_w_prefix() {
        let mut e = Emitter::new();
        e.store_mem64(Register::Rdi, 0x10, Register::Rax);
        // REX.W 89 /r, modrm = 01 000 111 ([RDI+0x10] <- RAX)
        assert_eq!(e.bytes(), [0x48, 0x89, 0x47, 0x10]);
    }
}
