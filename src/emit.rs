//! The single-pass emit driver: walks MIR, dispatches per tag to a
//! form-specific routine, and fixes up branch displacements once every
//! instruction's offset is known.
//!
//! Per-instruction dispatch never touches anything outside the current
//! [`Inst`]; all cross-instruction state (relocations, the offset map, the
//! debug-line cursor) lives on [`Emitter`] itself and is threaded through
//! explicitly rather than captured in closures, so the dispatch table below
//! reads the same way regardless of which form is being emitted.

use crate::encoder::{narrowest_width, DispWidth, Encoder};
use crate::error::{EmitError, EmitResult, SourceLoc};
use crate::mir::{ArithForm, ArithOp, Inst, Mir, Tag};
use crate::opcodes::{arith_opcodes, cond_opcodes, downshift_for_8bit, mi_opcode};
use crate::reloc::{BranchReloc, DebugInfoSink, LinkerBackend, LinkerReloc, RelocKind, RelocSink};
use crate::rex::RexBits;
use crate::sink::CodeSink;
use log::trace;

/// The low-3-bits encoding shared by RBP and R13: the one register id that
/// can't be addressed with a zero displacement (mod=00, rm=101 means
/// RIP-relative instead), so it forces a minimum of disp8.
const RBP_OR_R13: u8 = 0b101;

/// Choose the smallest ModR/M displacement width that represents `disp`
/// faithfully, folding in the RBP/R13 disp0 restriction.
fn disp_form(rm_low3: u8, disp: i32) -> DispWidth {
    let width = crate::encoder::narrowest_disp(disp);
    if rm_low3 == RBP_OR_R13 && width == DispWidth::Disp0 {
        DispWidth::Disp8
    } else {
        width
    }
}

fn disp_len(form: DispWidth) -> usize {
    match form {
        DispWidth::Disp0 => 0,
        DispWidth::Disp8 => 1,
        DispWidth::Disp32 => 4,
    }
}

fn write_indirect<S: CodeSink>(
    enc: &mut Encoder<'_, S>,
    reg_field: u8,
    rm_low3: u8,
    form: DispWidth,
    disp: i32,
) {
    match form {
        DispWidth::Disp0 => enc.modrm_indirect_disp0(reg_field, rm_low3),
        DispWidth::Disp8 => {
            enc.modrm_indirect_disp8(reg_field, rm_low3);
            enc.disp8(disp as i8);
        }
        DispWidth::Disp32 => {
            enc.modrm_indirect_disp32(reg_field, rm_low3);
            enc.disp32(disp);
        }
    }
}

/// The result of a complete emission pass: the MIR-index-to-byte-offset
/// mapping, handed back in case the caller wants it for its own diagnostics
/// (stack maps, exception tables) after this crate is done with it.
#[derive(Debug, Default)]
pub struct EmitOutput {
    pub code_offset_mapping: Vec<u32>,
}

/// Owns every piece of state one declaration's emission needs: the
/// relocation list, the offset map, and the debug-line cursor. Confined to a
/// single thread and a single declaration; nothing here is `Send`-checked
/// because nothing is shared across instances.
pub struct Emitter<'a> {
    mir: &'a Mir,
    loc: SourceLoc,
    linker: &'a mut dyn RelocSink,
    debug: &'a mut dyn DebugInfoSink,
    backend: LinkerBackend,
    code_offset_mapping: Vec<u32>,
    relocs: Vec<BranchReloc>,
    prev_di_line: u32,
    prev_di_column: u32,
    prev_di_pc: u32,
}

impl<'a> Emitter<'a> {
    pub fn new(
        mir: &'a Mir,
        linker: &'a mut dyn RelocSink,
        debug: &'a mut dyn DebugInfoSink,
        backend: LinkerBackend,
        loc: SourceLoc,
    ) -> Self {
        Self {
            mir,
            loc,
            linker,
            debug,
            backend,
            code_offset_mapping: Vec::with_capacity(mir.insts.len()),
            relocs: Vec::new(),
            prev_di_line: 0,
            prev_di_column: 0,
            prev_di_pc: 0,
        }
    }

    /// Forward a prologue-end marker and remember it as the debug cursor.
    pub fn mark_prologue_end(&mut self, pc: u32) {
        self.debug.prologue_end(pc);
        self.prev_di_pc = pc;
    }

    pub fn mark_epilogue_begin(&mut self, pc: u32) {
        self.debug.epilogue_begin(pc);
        self.prev_di_pc = pc;
    }

    pub fn mark_line(&mut self, pc: u32, line: u32, column: u32) {
        self.debug.line(pc, line, column);
        self.prev_di_line = line;
        self.prev_di_column = column;
        self.prev_di_pc = pc;
    }

    /// Emit every instruction in the MIR, then resolve relocations. The
    /// common case; callers that need to interleave debug markers between
    /// specific instructions should drive [`Emitter::emit_one`] and
    /// [`Emitter::finish`] directly instead.
    pub fn emit_all<S: CodeSink>(&mut self, sink: &mut S) -> EmitResult<EmitOutput> {
        for idx in 0..self.mir.insts.len() as u32 {
            self.emit_one(sink, idx)?;
        }
        self.finish(sink)
    }

    /// Emit the instruction at `idx`, recording its starting offset first.
    /// `idx` must equal the number of instructions emitted so far: the
    /// offset map is built monotonically, matching the single-pass walk the
    /// fixup law in [`Emitter::finish`] relies on.
    pub fn emit_one<S: CodeSink>(&mut self, sink: &mut S, idx: u32) -> EmitResult<()> {
        debug_assert_eq!(self.code_offset_mapping.len(), idx as usize);
        let inst = self.mir.insts[idx as usize];
        let offset = u32::try_from(sink.current_offset()).expect("code offset fits u32");
        trace!("mir[{idx}]: {:?} at offset {offset}", inst.tag);
        self.code_offset_mapping.push(offset);
        self.dispatch(sink, &inst)
    }

    /// Resolve every recorded branch relocation against the offset map and
    /// patch its displacement in place.
    pub fn finish<S: CodeSink>(&mut self, sink: &mut S) -> EmitResult<EmitOutput> {
        for reloc in &self.relocs {
            let target_offset = *self
                .code_offset_mapping
                .get(reloc.target as usize)
                .ok_or_else(|| EmitError::missing_reloc_target(self.loc, reloc.target))?;
            let disp = i64::from(target_offset) - (reloc.source as i64 + i64::from(reloc.length));
            let disp32 =
                i32::try_from(disp).map_err(|_| EmitError::displacement_overflow(self.loc, disp))?;
            trace!(
                "reloc: target mir[{}] at offset {target_offset}, patching disp32={disp32} at {}",
                reloc.target, reloc.offset
            );
            sink.patch4_at(reloc.offset as usize, disp32 as u32);
        }
        Ok(EmitOutput {
            code_offset_mapping: std::mem::take(&mut self.code_offset_mapping),
        })
    }

    fn dispatch<S: CodeSink>(&mut self, sink: &mut S, inst: &Inst) -> EmitResult<()> {
        if let Some((op, form)) = inst.tag.arith() {
            return match form {
                ArithForm::Plain => self.emit_arith_plain(sink, inst, op),
                ArithForm::ScaleSrc => self.emit_arith_scale_src(sink, inst, op),
                ArithForm::ScaleDst => self.emit_arith_scale_dst(sink, inst, op),
                ArithForm::ScaleImm => self.emit_arith_scale_imm(sink, inst, op),
            };
        }
        match inst.tag {
            Tag::Lea => self.emit_lea(sink, inst),
            Tag::LeaRip => self.emit_lea_rip(sink, inst),
            Tag::Movabs => self.emit_movabs(sink, inst),
            Tag::Push => self.emit_push(sink, inst),
            Tag::Pop => self.emit_pop(sink, inst),
            Tag::Ret => self.emit_ret(sink, inst),
            Tag::Jmp => self.emit_jmp_call(sink, inst, true),
            Tag::Call => self.emit_jmp_call(sink, inst, false),
            Tag::CallExtern => self.emit_call_extern(sink, inst),
            Tag::JccSigned | Tag::JccUnsigned | Tag::JccEq => self.emit_jcc(sink, inst),
            Tag::SetccSigned | Tag::SetccUnsigned | Tag::SetccEq => self.emit_setcc(sink, inst),
            Tag::Syscall => self.emit_syscall(sink),
            Tag::Test => self.emit_test(sink, inst),
            Tag::Int3 => self.emit_int3(sink),
            Tag::ImulComplex => self.emit_imul_complex(sink, inst),
            _ => unreachable!("every non-arithmetic tag is matched above"),
        }
    }

    fn emit_arith_plain<S: CodeSink>(
        &mut self,
        sink: &mut S,
        inst: &Inst,
        op: ArithOp,
    ) -> EmitResult<()> {
        let reg1 = inst.reg1();
        let reg2 = inst.reg2();
        let flags = inst.flags();
        let opcodes = arith_opcodes(op);
        let mut enc = Encoder::new(sink);
        match flags {
            0b00 => {
                let w = reg1.size() == 64;
                let eight = reg1.size() == 8;
                if reg2.is_none() {
                    let opcode = if eight {
                        downshift_for_8bit(mi_opcode(op))
                    } else {
                        mi_opcode(op)
                    };
                    let rex = RexBits::for_modrm(w, false, reg1.is_extended());
                    enc.begin_inst(7)?;
                    enc.rex(rex);
                    enc.opcode_1byte(opcode);
                    enc.modrm_direct(opcodes.mi_ext, reg1.low_id());
                    enc.imm32(inst.imm() as u32);
                } else {
                    let opcode = if eight {
                        downshift_for_8bit(opcodes.rm)
                    } else {
                        opcodes.rm
                    };
                    let rex = RexBits::for_modrm(w, reg1.is_extended(), reg2.is_extended());
                    enc.begin_inst(3)?;
                    enc.rex(rex);
                    enc.opcode_1byte(opcode);
                    enc.modrm_direct(reg1.low_id(), reg2.low_id());
                }
            }
            0b01 => {
                let w = reg1.size() == 64;
                let eight = reg1.size() == 8;
                let opcode = if eight {
                    downshift_for_8bit(opcodes.rm)
                } else {
                    opcodes.rm
                };
                if reg2.is_none() {
                    let rex = RexBits::for_modrm(w, reg1.is_extended(), false);
                    enc.begin_inst(1 + 3 + 4)?;
                    enc.rex(rex);
                    enc.opcode_1byte(opcode);
                    enc.modrm_sib_disp0(reg1.low_id());
                    enc.sib_disp32_only();
                    enc.disp32(inst.imm());
                } else {
                    let disp = inst.imm();
                    let form = disp_form(reg2.low_id(), disp);
                    let rex = RexBits::for_modrm(w, reg1.is_extended(), reg2.is_extended());
                    enc.begin_inst(1 + 2 + disp_len(form))?;
                    enc.rex(rex);
                    enc.opcode_1byte(opcode);
                    write_indirect(&mut enc, reg1.low_id(), reg2.low_id(), form, disp);
                }
            }
            0b10 => {
                if reg2.is_none() {
                    // No register operand carries an operand width here;
                    // the destination is pure memory. Default to 32-bit,
                    // matching the common spill/restore case.
                    let opcode = mi_opcode(op);
                    let rex = RexBits::for_modrm(false, false, reg1.is_extended());
                    let force_disp8 = reg1.low_id() == RBP_OR_R13;
                    enc.begin_inst(1 + 2 + usize::from(force_disp8) + 4)?;
                    enc.rex(rex);
                    enc.opcode_1byte(opcode);
                    if force_disp8 {
                        enc.modrm_indirect_disp8(opcodes.mi_ext, reg1.low_id());
                        enc.disp8(0);
                    } else {
                        enc.modrm_indirect_disp0(opcodes.mi_ext, reg1.low_id());
                    }
                    enc.imm32(inst.imm() as u32);
                } else {
                    let w = reg2.size() == 64;
                    let eight = reg2.size() == 8;
                    let opcode = if eight {
                        downshift_for_8bit(opcodes.mr)
                    } else {
                        opcodes.mr
                    };
                    let disp = inst.imm();
                    let form = disp_form(reg1.low_id(), disp);
                    let rex = RexBits::for_modrm(w, reg2.is_extended(), reg1.is_extended());
                    enc.begin_inst(1 + 2 + disp_len(form))?;
                    enc.rex(rex);
                    enc.opcode_1byte(opcode);
                    write_indirect(&mut enc, reg2.low_id(), reg1.low_id(), form, disp);
                }
            }
            0b11 => {
                let pair = self.mir.extra.imm_pair(inst.payload());
                let opcode = mi_opcode(op);
                let rex = RexBits::for_modrm(false, false, reg1.is_extended());
                let form = disp_form(reg1.low_id(), pair.dest_off);
                enc.begin_inst(1 + 2 + disp_len(form) + 4)?;
                enc.rex(rex);
                enc.opcode_1byte(opcode);
                write_indirect(&mut enc, opcodes.mi_ext, reg1.low_id(), form, pair.dest_off);
                enc.imm32(pair.operand as u32);
            }
            _ => unreachable!("flags is 2 bits"),
        }
        Ok(())
    }

    fn emit_arith_scale_src<S: CodeSink>(
        &mut self,
        sink: &mut S,
        inst: &Inst,
        op: ArithOp,
    ) -> EmitResult<()> {
        let reg1 = inst.reg1();
        let reg2 = inst.reg2();
        let scale = inst.flags();
        let disp = inst.imm();
        let w = reg1.size() == 64;
        let opcode = if reg1.size() == 8 {
            downshift_for_8bit(arith_opcodes(op).rm)
        } else {
            arith_opcodes(op).rm
        };
        let use_disp8 = i8::try_from(disp).is_ok();
        let rex = RexBits::for_sib(w, reg1.is_extended(), false, reg2.is_extended());
        let mut enc = Encoder::new(sink);
        enc.begin_inst(1 + 3 + if use_disp8 { 1 } else { 4 })?;
        enc.rex(rex);
        enc.opcode_1byte(opcode);
        if use_disp8 {
            enc.modrm_sib_disp8(reg1.low_id());
            enc.sib(scale, 0b001, reg2.low_id());
            enc.disp8(disp as i8);
        } else {
            enc.modrm_sib_disp32(reg1.low_id());
            enc.sib(scale, 0b001, reg2.low_id());
            enc.disp32(disp);
        }
        Ok(())
    }

    fn emit_arith_scale_dst<S: CodeSink>(
        &mut self,
        sink: &mut S,
        inst: &Inst,
        op: ArithOp,
    ) -> EmitResult<()> {
        let reg1 = inst.reg1();
        let reg2 = inst.reg2();
        let scale = inst.flags();
        let mut enc = Encoder::new(sink);
        if reg2.is_none() {
            let imm = inst.imm();
            let width = narrowest_width(i64::from(imm));
            let opcode = arith_opcodes(op).mi_ext;
            let rex = RexBits::for_sib(false, false, false, reg1.is_extended());
            let force_disp8 = reg1.low_id() == RBP_OR_R13;
            enc.begin_inst(1 + 3 + usize::from(force_disp8) + usize::from(width))?;
            enc.rex(rex);
            enc.opcode_1byte(mi_opcode(op));
            if force_disp8 {
                enc.modrm_sib_disp8(opcode);
                enc.sib(scale, 0b000, reg1.low_id());
                enc.disp8(0);
            } else {
                enc.modrm_sib_disp0(opcode);
                enc.sib(scale, 0b000, reg1.low_id());
            }
            match width {
                1 => enc.imm8(imm as u8),
                2 => enc.imm16(imm as u16),
                _ => enc.imm32(imm as u32),
            }
        } else {
            let w = reg2.size() == 64;
            let opcode = if reg2.size() == 8 {
                downshift_for_8bit(arith_opcodes(op).mr)
            } else {
                arith_opcodes(op).mr
            };
            let rex = RexBits::for_sib(w, reg2.is_extended(), false, reg1.is_extended());
            enc.begin_inst(1 + 3 + 4)?;
            enc.rex(rex);
            enc.opcode_1byte(opcode);
            enc.modrm_sib_disp32(reg2.low_id());
            enc.sib(scale, 0b000, reg1.low_id());
            enc.disp32(inst.imm());
        }
        Ok(())
    }

    fn emit_arith_scale_imm<S: CodeSink>(
        &mut self,
        sink: &mut S,
        inst: &Inst,
        op: ArithOp,
    ) -> EmitResult<()> {
        let reg1 = inst.reg1();
        let scale = inst.flags();
        let pair = self.mir.extra.imm_pair(inst.payload());
        let use_disp8 = i8::try_from(pair.dest_off).is_ok();
        let rex = RexBits::for_sib(false, false, false, reg1.is_extended());
        let ext = arith_opcodes(op).mi_ext;
        let mut enc = Encoder::new(sink);
        enc.begin_inst(1 + 3 + if use_disp8 { 1 } else { 4 } + 4)?;
        enc.rex(rex);
        enc.opcode_1byte(mi_opcode(op));
        if use_disp8 {
            enc.modrm_sib_disp8(ext);
            enc.sib(scale, 0b000, reg1.low_id());
            enc.disp8(pair.dest_off as i8);
        } else {
            enc.modrm_sib_disp32(ext);
            enc.sib(scale, 0b000, reg1.low_id());
            enc.disp32(pair.dest_off);
        }
        enc.imm32(pair.operand as u32);
        Ok(())
    }

    fn emit_lea<S: CodeSink>(&mut self, sink: &mut S, inst: &Inst) -> EmitResult<()> {
        if inst.flags() != 0b01 {
            return Err(EmitError::unimplemented(
                self.loc,
                "lea addressing form other than base+disp",
            ));
        }
        let reg1 = inst.reg1();
        let reg2 = inst.reg2();
        let disp = inst.imm();
        let w = reg1.size() == 64;
        let form = disp_form(reg2.low_id(), disp);
        let rex = RexBits::for_modrm(w, reg1.is_extended(), reg2.is_extended());
        let mut enc = Encoder::new(sink);
        enc.begin_inst(1 + 2 + disp_len(form))?;
        enc.rex(rex);
        enc.opcode_1byte(0x8D);
        write_indirect(&mut enc, reg1.low_id(), reg2.low_id(), form, disp);
        Ok(())
    }

    fn emit_lea_rip<S: CodeSink>(&mut self, sink: &mut S, inst: &Inst) -> EmitResult<()> {
        let reg1 = inst.reg1();
        let w = reg1.size() == 64;
        let rex = RexBits::for_modrm(w, reg1.is_extended(), false);
        let mut enc = Encoder::new(sink);
        let start = enc.current_offset();
        enc.begin_inst(7)?;
        enc.rex(rex);
        enc.opcode_1byte(0x8D);
        enc.modrm_rip_disp32(reg1.low_id());
        if inst.flags() & 1 == 0 {
            let end_before_disp = enc.current_offset();
            let total_len = i32::try_from(end_before_disp - start + 4)
                .expect("lea instruction length fits i32");
            enc.disp32(inst.imm() - total_len);
        } else {
            if self.backend != LinkerBackend::MachO {
                return Err(EmitError::unsupported_linker_backend(
                    self.loc,
                    "non-Mach-O",
                ));
            }
            let offset = u32::try_from(enc.current_offset()).expect("code offset fits u32");
            enc.disp32(0);
            self.linker.relocate(LinkerReloc {
                offset,
                target: inst.payload(),
                addend: 0,
                pcrel: true,
                length: 2,
                kind: RelocKind::Got,
            });
        }
        Ok(())
    }

    fn emit_movabs<S: CodeSink>(&mut self, sink: &mut S, inst: &Inst) -> EmitResult<()> {
        let reg1 = inst.reg1();
        let reg2 = inst.reg2();
        let mut enc = Encoder::new(sink);
        if inst.flags() == 0 {
            if reg1.size() == 64 {
                let value = self.mir.extra.imm64(inst.payload()).decode();
                let rex = RexBits::for_opcode_reg(true, reg1.is_extended());
                enc.begin_inst(10)?;
                enc.rex(rex);
                enc.opcode_with_reg(0xB8, reg1.low_id());
                enc.imm64(value);
            } else {
                let value = i64::from(inst.imm());
                let width = narrowest_width(value);
                let base = if reg1.size() == 8 { 0xB0 } else { 0xB8 };
                let rex = RexBits::for_opcode_reg(false, reg1.is_extended());
                enc.begin_inst(2 + usize::from(width))?;
                enc.rex(rex);
                enc.opcode_with_reg(base, reg1.low_id());
                match width {
                    1 => enc.imm8(value as u8),
                    2 => enc.imm16(value as u16),
                    _ => enc.imm32(value as u32),
                }
            }
            return Ok(());
        }
        if reg1.is_none() {
            let reg = reg2;
            let opcode = if reg.size() == 8 { 0xA2 } else { 0xA3 };
            let rex = RexBits::for_opcode_reg(reg.size() == 64, false);
            if reg.size() == 64 {
                let addr = self.mir.extra.imm64(inst.payload()).decode();
                enc.begin_inst(10)?;
                enc.rex(rex);
                enc.opcode_1byte(opcode);
                enc.imm64(addr);
            } else {
                enc.begin_inst(6)?;
                enc.rex(rex);
                enc.opcode_1byte(opcode);
                enc.imm32(inst.imm() as u32);
            }
        } else {
            let reg = reg1;
            let opcode = if reg.size() == 8 { 0xA0 } else { 0xA1 };
            let rex = RexBits::for_opcode_reg(reg.size() == 64, false);
            if reg.size() == 64 {
                let addr = self.mir.extra.imm64(inst.payload()).decode();
                enc.begin_inst(10)?;
                enc.rex(rex);
                enc.opcode_1byte(opcode);
                enc.imm64(addr);
            } else {
                enc.begin_inst(6)?;
                enc.rex(rex);
                enc.opcode_1byte(opcode);
                enc.imm32(inst.imm() as u32);
            }
        }
        Ok(())
    }

    fn emit_push<S: CodeSink>(&mut self, sink: &mut S, inst: &Inst) -> EmitResult<()> {
        let reg1 = inst.reg1();
        let mut enc = Encoder::new(sink);
        match inst.flags() {
            0b00 => {
                let rex = RexBits::for_opcode_reg(false, reg1.is_extended());
                enc.begin_inst(2)?;
                enc.rex(rex);
                enc.opcode_with_reg(0x50, reg1.low_id());
            }
            0b01 => {
                let disp = inst.imm();
                let form = disp_form(reg1.low_id(), disp);
                let rex = RexBits::for_modrm(false, false, reg1.is_extended());
                enc.begin_inst(1 + 2 + disp_len(form))?;
                enc.rex(rex);
                enc.opcode_1byte(0xFF);
                write_indirect(&mut enc, 6, reg1.low_id(), form, disp);
            }
            0b10 => {
                let imm = inst.imm();
                if i8::try_from(imm).is_ok() {
                    enc.begin_inst(2)?;
                    enc.opcode_1byte(0x6A);
                    enc.imm8(imm as u8);
                } else {
                    enc.begin_inst(5)?;
                    enc.opcode_1byte(0x68);
                    enc.imm32(imm as u32);
                }
            }
            _ => return Err(EmitError::unimplemented(self.loc, "push flags=0b11")),
        }
        Ok(())
    }

    fn emit_pop<S: CodeSink>(&mut self, sink: &mut S, inst: &Inst) -> EmitResult<()> {
        let reg1 = inst.reg1();
        let mut enc = Encoder::new(sink);
        match inst.flags() {
            0b00 => {
                let rex = RexBits::for_opcode_reg(false, reg1.is_extended());
                enc.begin_inst(2)?;
                enc.rex(rex);
                enc.opcode_with_reg(0x58, reg1.low_id());
            }
            0b01 => {
                let disp = inst.imm();
                let form = disp_form(reg1.low_id(), disp);
                let rex = RexBits::for_modrm(false, false, reg1.is_extended());
                enc.begin_inst(1 + 2 + disp_len(form))?;
                enc.rex(rex);
                enc.opcode_1byte(0x8F);
                write_indirect(&mut enc, 0, reg1.low_id(), form, disp);
            }
            _ => return Err(EmitError::unimplemented(self.loc, "pop flags=0b10/0b11")),
        }
        Ok(())
    }

    fn emit_ret<S: CodeSink>(&mut self, sink: &mut S, inst: &Inst) -> EmitResult<()> {
        let mut enc = Encoder::new(sink);
        match inst.flags() {
            0b00 => {
                enc.begin_inst(3)?;
                enc.opcode_1byte(0xCA);
                enc.imm16(inst.imm() as u16);
            }
            0b01 => {
                enc.begin_inst(1)?;
                enc.opcode_1byte(0xCB);
            }
            0b10 => {
                enc.begin_inst(3)?;
                enc.opcode_1byte(0xC2);
                enc.imm16(inst.imm() as u16);
            }
            0b11 => {
                enc.begin_inst(1)?;
                enc.opcode_1byte(0xC3);
            }
            _ => unreachable!("flags is 2 bits"),
        }
        Ok(())
    }

    fn emit_jmp_call<S: CodeSink>(
        &mut self,
        sink: &mut S,
        inst: &Inst,
        is_jmp: bool,
    ) -> EmitResult<()> {
        let reg1 = inst.reg1();
        let mut enc = Encoder::new(sink);
        if inst.flags() & 1 == 0 {
            let start = enc.current_offset();
            enc.begin_inst(5)?;
            enc.opcode_1byte(if is_jmp { 0xE9 } else { 0xE8 });
            let disp_offset = enc.current_offset();
            enc.disp32(0);
            self.relocs.push(BranchReloc {
                source: start as u64,
                target: inst.target(),
                offset: disp_offset as u64,
                length: 5,
            });
        } else if reg1.is_none() {
            let ext = if is_jmp { 4 } else { 2 };
            enc.begin_inst(7)?;
            enc.rex(RexBits::none());
            enc.opcode_1byte(0xFF);
            enc.modrm_sib_disp0(ext);
            enc.sib_disp32_only();
            enc.disp32(inst.imm());
        } else {
            let ext = if is_jmp { 4 } else { 2 };
            let rex = RexBits::for_modrm(false, false, reg1.is_extended());
            enc.begin_inst(3)?;
            enc.rex(rex);
            enc.opcode_1byte(0xFF);
            enc.modrm_direct(ext, reg1.low_id());
        }
        Ok(())
    }

    fn emit_jcc<S: CodeSink>(&mut self, sink: &mut S, inst: &Inst) -> EmitResult<()> {
        let cond = inst
            .tag
            .condition(inst.flags())
            .expect("a Jcc* tag always yields a condition");
        let opcode = cond_opcodes(cond).jcc;
        let mut enc = Encoder::new(sink);
        let start = enc.current_offset();
        enc.begin_inst(6)?;
        enc.opcode_2byte(opcode);
        let disp_offset = enc.current_offset();
        enc.disp32(0);
        self.relocs.push(BranchReloc {
            source: start as u64,
            target: inst.target(),
            offset: disp_offset as u64,
            length: 6,
        });
        Ok(())
    }

    fn emit_setcc<S: CodeSink>(&mut self, sink: &mut S, inst: &Inst) -> EmitResult<()> {
        let cond = inst
            .tag
            .condition(inst.flags())
            .expect("a Setcc* tag always yields a condition");
        let opcode = cond_opcodes(cond).setcc;
        let reg1 = inst.reg1();
        // REX.W=1 here is unusual (setcc only ever writes a byte register)
        // but matches the form this tag is specified to produce.
        let rex = RexBits::for_modrm(true, false, reg1.is_extended());
        let mut enc = Encoder::new(sink);
        enc.begin_inst(4)?;
        enc.rex(rex);
        enc.opcode_2byte(opcode);
        enc.modrm_direct(0, reg1.low_id());
        Ok(())
    }

    fn emit_syscall<S: CodeSink>(&mut self, sink: &mut S) -> EmitResult<()> {
        let mut enc = Encoder::new(sink);
        enc.begin_inst(2)?;
        enc.opcode_2byte(0x05);
        Ok(())
    }

    fn emit_int3<S: CodeSink>(&mut self, sink: &mut S) -> EmitResult<()> {
        let mut enc = Encoder::new(sink);
        enc.begin_inst(1)?;
        enc.opcode_1byte(0xCC);
        Ok(())
    }

    fn emit_test<S: CodeSink>(&mut self, sink: &mut S, inst: &Inst) -> EmitResult<()> {
        let reg1 = inst.reg1();
        if !inst.reg2().is_none() {
            return Err(EmitError::unimplemented(self.loc, "test r/m, r"));
        }
        let imm = inst.imm();
        let w = reg1.size() == 64;
        let eight = reg1.size() == 8;
        let imm_len = if eight { 1 } else { 4 };
        let rex = RexBits::for_modrm(w, false, reg1.is_extended());
        let mut enc = Encoder::new(sink);
        if reg1.low_id() == 0 {
            let opcode = if eight { 0xA8 } else { 0xA9 };
            enc.begin_inst(2 + imm_len)?;
            enc.rex(rex);
            enc.opcode_1byte(opcode);
        } else {
            let opcode = if eight { 0xF6 } else { 0xF7 };
            enc.begin_inst(3 + imm_len)?;
            enc.rex(rex);
            enc.opcode_1byte(opcode);
            enc.modrm_direct(0, reg1.low_id());
        }
        if eight {
            enc.imm8(imm as u8);
        } else {
            enc.imm32(imm as u32);
        }
        Ok(())
    }

    fn emit_call_extern<S: CodeSink>(&mut self, sink: &mut S, inst: &Inst) -> EmitResult<()> {
        if self.backend != LinkerBackend::MachO {
            return Err(EmitError::unsupported_linker_backend(
                self.loc,
                "non-Mach-O",
            ));
        }
        let mut enc = Encoder::new(sink);
        enc.begin_inst(5)?;
        enc.opcode_1byte(0xE8);
        let offset = u32::try_from(enc.current_offset()).expect("code offset fits u32");
        enc.disp32(0);
        self.linker.relocate(LinkerReloc {
            offset,
            target: inst.extern_fn(),
            addend: 0,
            pcrel: true,
            length: 2,
            kind: RelocKind::Branch,
        });
        Ok(())
    }

    fn emit_imul_complex<S: CodeSink>(&mut self, sink: &mut S, inst: &Inst) -> EmitResult<()> {
        let reg1 = inst.reg1();
        let reg2 = inst.reg2();
        let w = reg1.size() == 64;
        let rex = RexBits::for_modrm(w, reg1.is_extended(), reg2.is_extended());
        let mut enc = Encoder::new(sink);
        match inst.flags() {
            0b00 => {
                enc.begin_inst(4)?;
                enc.rex(rex);
                enc.opcode_2byte(0xAF);
                enc.modrm_direct(reg1.low_id(), reg2.low_id());
            }
            0b10 => {
                let imm = inst.imm();
                if i8::try_from(imm).is_ok() {
                    enc.begin_inst(4)?;
                    enc.rex(rex);
                    enc.opcode_1byte(0x6B);
                    enc.modrm_direct(reg1.low_id(), reg2.low_id());
                    enc.imm8(imm as u8);
                } else {
                    enc.begin_inst(7)?;
                    enc.rex(rex);
                    enc.opcode_1byte(0x69);
                    enc.modrm_direct(reg1.low_id(), reg2.low_id());
                    enc.imm32(imm as u32);
                }
            }
            _ => {
                return Err(EmitError::unimplemented(
                    self.loc,
                    "imul flags other than plain/with-immediate",
                ))
            }
        }
        Ok(())
    }
}

/// Convenience one-shot entry point: emit every instruction in `mir` and
/// resolve relocations. Equivalent to `Emitter::new(..).emit_all(sink)`.
pub fn emit<S: CodeSink>(
    mir: &Mir,
    sink: &mut S,
    linker: &mut dyn RelocSink,
    debug: &mut dyn DebugInfoSink,
    backend: LinkerBackend,
    loc: SourceLoc,
) -> EmitResult<EmitOutput> {
    Emitter::new(mir, linker, debug, backend, loc).emit_all(sink)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reg::Register;
    use crate::reloc::{NullDebugInfoSink, NullRelocSink};

    fn emit_single(mir: &Mir) -> Vec<u8> {
        let mut code = Vec::new();
        let mut linker = NullRelocSink;
        let mut debug = NullDebugInfoSink;
        emit(
            mir,
            &mut code,
            &mut linker,
            &mut debug,
            LinkerBackend::MachO,
            SourceLoc::default(),
        )
        .unwrap();
        code
    }

    #[test]
    fn mov_rax_1_matches_spec_scenario() {
        let mut mir = Mir::new();
        mir.push(Inst::new(Tag::Mov, Register::rax, Register::none, 0b00, 1));
        assert_eq!(
            emit_single(&mir),
            vec![0x48, 0xC7, 0xC0, 0x01, 0x00, 0x00, 0x00]
        );
    }

    #[test]
    fn push_rbp_matches_spec_scenario() {
        let mut mir = Mir::new();
        mir.push(Inst::new(Tag::Push, Register::rbp, Register::none, 0b00, 0));
        assert_eq!(emit_single(&mir), vec![0x55]);
    }

    #[test]
    fn sub_rsp_16_matches_spec_scenario() {
        let mut mir = Mir::new();
        mir.push(Inst::new(Tag::Sub, Register::rsp, Register::none, 0b00, 16));
        assert_eq!(
            emit_single(&mir),
            vec![0x48, 0x81, 0xEC, 0x10, 0x00, 0x00, 0x00]
        );
    }

    #[test]
    fn bare_ret_matches_spec_scenario() {
        let mut mir = Mir::new();
        mir.push(Inst::new(Tag::Ret, Register::none, Register::none, 0b11, 0));
        assert_eq!(emit_single(&mir), vec![0xC3]);
    }

    #[test]
    fn movabs_64bit_immediate_matches_spec_scenario() {
        let mut mir = Mir::new();
        let idx = mir.extra.push_imm64(0x1122_3344_5566_7788);
        mir.push(Inst::new(
            Tag::Movabs,
            Register::rbx,
            Register::none,
            0b00,
            idx,
        ));
        assert_eq!(
            emit_single(&mir),
            vec![0x48, 0xBB, 0x88, 0x77, 0x66, 0x55, 0x44, 0x33, 0x22, 0x11]
        );
    }

    #[test]
    fn forward_jump_fixup_follows_the_displacement_law() {
        let mut mir = Mir::new();
        let jmp_idx = mir.push(Inst::new(Tag::Jmp, Register::none, Register::none, 0b00, 0));
        mir.push(Inst::new(Tag::Ret, Register::none, Register::none, 0b11, 0));
        mir.insts[jmp_idx as usize] = Inst::new(Tag::Jmp, Register::none, Register::none, 0b00, 1);

        let mut code = Vec::new();
        let mut linker = NullRelocSink;
        let mut debug = NullDebugInfoSink;
        let output = emit(
            &mir,
            &mut code,
            &mut linker,
            &mut debug,
            LinkerBackend::MachO,
            SourceLoc::default(),
        )
        .unwrap();

        assert_eq!(code, vec![0xE9, 0x00, 0x00, 0x00, 0x00, 0xC3]);
        let disp = i32::from_le_bytes(code[1..5].try_into().unwrap());
        assert_eq!(disp, output.code_offset_mapping[1] as i32 - 5);
    }

    #[test]
    fn call_extern_records_branch_relocation() {
        use crate::reloc::RecordingRelocSink;
        let mut mir = Mir::new();
        mir.push(Inst::new(
            Tag::CallExtern,
            Register::none,
            Register::none,
            0,
            7,
        ));
        let mut code = Vec::new();
        let mut linker = RecordingRelocSink::default();
        let mut debug = NullDebugInfoSink;
        emit(
            &mir,
            &mut code,
            &mut linker,
            &mut debug,
            LinkerBackend::MachO,
            SourceLoc::default(),
        )
        .unwrap();
        assert_eq!(code[0], 0xE8);
        assert_eq!(linker.0.len(), 1);
        assert_eq!(linker.0[0].target, 7);
        assert_eq!(linker.0[0].kind, RelocKind::Branch);
    }

    #[test]
    fn call_extern_fails_closed_on_unsupported_backend() {
        let mut mir = Mir::new();
        mir.push(Inst::new(
            Tag::CallExtern,
            Register::none,
            Register::none,
            0,
            1,
        ));
        let mut code = Vec::new();
        let mut linker = NullRelocSink;
        let mut debug = NullDebugInfoSink;
        let err = emit(
            &mir,
            &mut code,
            &mut linker,
            &mut debug,
            LinkerBackend::Unsupported,
            SourceLoc::default(),
        )
        .unwrap_err();
        assert!(matches!(err, EmitError::EmitFail { .. }));
    }

    #[test]
    fn test_rax_imm_uses_short_encoding() {
        let mut mir = Mir::new();
        mir.push(Inst::new(Tag::Test, Register::rax, Register::none, 0, 0xff));
        assert_eq!(
            emit_single(&mir),
            vec![0x48, 0xA9, 0xFF, 0x00, 0x00, 0x00]
        );
    }

    #[test]
    fn test_register_form_is_not_yet_implemented() {
        let mut mir = Mir::new();
        mir.push(Inst::new(Tag::Test, Register::rax, Register::rcx, 0, 0));
        let mut code = Vec::new();
        let mut linker = NullRelocSink;
        let mut debug = NullDebugInfoSink;
        let err = emit(
            &mir,
            &mut code,
            &mut linker,
            &mut debug,
            LinkerBackend::MachO,
            SourceLoc::default(),
        )
        .unwrap_err();
        assert!(matches!(err, EmitError::EmitFail { .. }));
    }

    #[test]
    fn int3_and_syscall_are_fixed_bytes() {
        let mut mir = Mir::new();
        mir.push(Inst::new(Tag::Int3, Register::none, Register::none, 0, 0));
        mir.push(Inst::new(Tag::Syscall, Register::none, Register::none, 0, 0));
        assert_eq!(emit_single(&mir), vec![0xCC, 0x0F, 0x05]);
    }

    #[test]
    fn lea_with_rbp_base_forces_disp8() {
        let mut mir = Mir::new();
        mir.push(Inst::new(Tag::Lea, Register::rax, Register::rbp, 0b01, 0));
        assert_eq!(emit_single(&mir), vec![0x48, 0x8D, 0x45, 0x00]);
    }
}
