//! Low-level x86_64 byte-emission primitives.
//!
//! Every primitive here is trivial. The contract that matters is the one in
//! [`Encoder::begin_inst`]: callers must reserve the maximum possible byte
//! length of an instruction exactly once, before writing any of its bytes,
//! so that no primitive ever triggers a reallocation mid-instruction. The
//! only failure mode below that reservation is the underlying allocator, and
//! it surfaces as [`EmitError::OutOfMemory`].

use crate::error::EmitResult;
use crate::rex::{self, RexBits};
use crate::sink::CodeSink;

/// A thin wrapper around a [`CodeSink`] exposing x86_64 byte-level
/// primitives. Holds no state of its own beyond the borrow.
pub struct Encoder<'a, S: CodeSink> {
    sink: &'a mut S,
}

impl<'a, S: CodeSink> Encoder<'a, S> {
    pub fn new(sink: &'a mut S) -> Self {
        Self { sink }
    }

    /// Reserve room for one whole instruction. Must be called exactly once,
    /// before any other primitive, with the maximum possible byte length of
    /// the instruction about to be emitted.
    pub fn begin_inst(&mut self, max_len: usize) -> EmitResult<()> {
        self.sink.reserve(max_len)
    }

    #[must_use]
    pub fn current_offset(&self) -> usize {
        self.sink.current_offset()
    }

    /// Emit a REX prefix iff `bits` requires one.
    pub fn rex(&mut self, bits: RexBits) {
        if bits.is_needed() {
            self.sink.put1(bits.byte());
        }
    }

    pub fn opcode_1byte(&mut self, opcode: u8) {
        self.sink.put1(opcode);
    }

    pub fn opcode_2byte(&mut self, opcode: u8) {
        self.sink.put1(0x0f);
        self.sink.put1(opcode);
    }

    /// `opc | (reg & 0b111)`, e.g. `PUSH reg`, `POP reg`, `MOV r, imm`.
    pub fn opcode_with_reg(&mut self, opcode: u8, reg_low3: u8) {
        self.sink.put1(opcode | (reg_low3 & 0b111));
    }

    /// mod=11 (direct register addressing).
    pub fn modrm_direct(&mut self, reg_field: u8, rm: u8) {
        self.sink
            .put1(rex::encode_modrm(rex::MOD_DIRECT, reg_field, rm));
    }

    /// mod=00 (`[rm]`, no displacement). Callers must route rbp/r13 through
    /// `modrm_indirect_disp8` instead, since that rm encoding is reserved
    /// for RIP-relative addressing at mod=00.
    pub fn modrm_indirect_disp0(&mut self, reg_field: u8, rm: u8) {
        debug_assert_ne!(rm & 0b111, 0b101, "rbp/r13 require disp8 at mod=00");
        self.sink
            .put1(rex::encode_modrm(rex::MOD_INDIRECT, reg_field, rm));
    }

    /// mod=01 (`[rm + disp8]`); caller writes the displacement separately.
    pub fn modrm_indirect_disp8(&mut self, reg_field: u8, rm: u8) {
        self.sink
            .put1(rex::encode_modrm(rex::MOD_DISP8, reg_field, rm));
    }

    /// mod=10 (`[rm + disp32]`); caller writes the displacement separately.
    pub fn modrm_indirect_disp32(&mut self, reg_field: u8, rm: u8) {
        self.sink
            .put1(rex::encode_modrm(rex::MOD_DISP32, reg_field, rm));
    }

    /// mod=00, rm=100 (SIB follows, no displacement).
    pub fn modrm_sib_disp0(&mut self, reg_field: u8) {
        self.sink
            .put1(rex::encode_modrm(rex::MOD_INDIRECT, reg_field, rex::RM_SIB));
    }

    /// mod=01, rm=100 (SIB follows, disp8 trails it).
    pub fn modrm_sib_disp8(&mut self, reg_field: u8) {
        self.sink
            .put1(rex::encode_modrm(rex::MOD_DISP8, reg_field, rex::RM_SIB));
    }

    /// mod=10, rm=100 (SIB follows, disp32 trails it).
    pub fn modrm_sib_disp32(&mut self, reg_field: u8) {
        self.sink
            .put1(rex::encode_modrm(rex::MOD_DISP32, reg_field, rex::RM_SIB));
    }

    /// mod=00, rm=101 (`[rip + disp32]`); disp32 trails.
    pub fn modrm_rip_disp32(&mut self, reg_field: u8) {
        self.sink
            .put1(rex::encode_modrm(rex::MOD_INDIRECT, reg_field, rex::RM_RIP));
    }

    /// `scale*index + base`.
    pub fn sib(&mut self, scale: u8, index: u8, base: u8) {
        self.sink.put1(rex::encode_sib(scale, index, base));
    }

    /// The disp32-only SIB encoding: scale=00, index=100 (no index), base=101.
    pub fn sib_disp32_only(&mut self) {
        self.sink.put1(rex::encode_sib(0b00, 0b100, 0b101));
    }

    pub fn imm8(&mut self, value: u8) {
        self.sink.put1(value);
    }

    pub fn imm16(&mut self, value: u16) {
        self.sink.put2(value);
    }

    pub fn imm32(&mut self, value: u32) {
        self.sink.put4(value);
    }

    pub fn imm64(&mut self, value: u64) {
        self.sink.put8(value);
    }

    pub fn disp8(&mut self, value: i8) {
        self.sink.put1(value as u8);
    }

    pub fn disp32(&mut self, value: i32) {
        self.sink.put4(value as u32);
    }
}

/// Classify a 32-bit value by the smallest signed width (i8 ⊂ i16 ⊂ i32) it
/// fits in. Used everywhere the spec calls for "narrow the immediate by
/// range" (push-imm, scale-dst arithmetic, MOVABS).
#[must_use]
pub fn narrowest_width(value: i64) -> u8 {
    if i8::try_from(value).is_ok() {
        1
    } else if i16::try_from(value).is_ok() {
        2
    } else if i32::try_from(value).is_ok() {
        4
    } else {
        8
    }
}

/// Choose disp0/disp8/disp32 the way `lea`/arithmetic indirect forms do:
/// zero folds away entirely, otherwise the smallest of disp8/disp32.
#[must_use]
pub fn narrowest_disp(value: i32) -> DispWidth {
    if value == 0 {
        DispWidth::Disp0
    } else if i8::try_from(value).is_ok() {
        DispWidth::Disp8
    } else {
        DispWidth::Disp32
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DispWidth {
    Disp0,
    Disp8,
    Disp32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn narrowest_width_picks_the_smallest_fitting_signed_size() {
        assert_eq!(narrowest_width(0), 1);
        assert_eq!(narrowest_width(127), 1);
        assert_eq!(narrowest_width(128), 2);
        assert_eq!(narrowest_width(32767), 2);
        assert_eq!(narrowest_width(32768), 4);
        assert_eq!(narrowest_width(i64::from(i32::MAX)), 4);
        assert_eq!(narrowest_width(i64::from(i32::MAX) + 1), 8);
    }

    #[test]
    fn narrowest_disp_folds_zero_to_disp0() {
        assert_eq!(narrowest_disp(0), DispWidth::Disp0);
        assert_eq!(narrowest_disp(127), DispWidth::Disp8);
        assert_eq!(narrowest_disp(-128), DispWidth::Disp8);
        assert_eq!(narrowest_disp(128), DispWidth::Disp32);
    }

    #[test]
    fn basic_encoding_sequence_matches_mov_rax_1() {
        let mut buf: Vec<u8> = vec![];
        {
            let mut enc = Encoder::new(&mut buf);
            enc.begin_inst(7).unwrap();
            enc.rex(RexBits::for_modrm(true, false, false));
            enc.opcode_1byte(0xc7);
            enc.modrm_direct(0, 0);
            enc.imm32(1);
        }
        assert_eq!(buf, vec![0x48, 0xc7, 0xc0, 0x01, 0x00, 0x00, 0x00]);
    }
}
