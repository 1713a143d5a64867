//! End-to-end coverage of the `mir -> emit -> bytes` pipeline through the
//! crate's public API only: no `#[cfg(test)]` internals, matching how
//! instruction-level encoding checks live in this corpus's own
//! `tests/` directories rather than its unit modules.

use x64_mir_emit::{
    emit, DebugInfoSink, EmitError, Inst, LinkerBackend, LinkerReloc, Mir, NullDebugInfoSink,
    NullRelocSink, RecordingRelocSink, Register, RelocKind, SourceLoc, Tag,
};

fn init() {
    let _ = env_logger::try_init();
}

#[test]
fn function_prologue_then_epilogue_is_a_contiguous_byte_stream() {
    init();
    let mut mir = Mir::new();
    mir.push(Inst::new(Tag::Push, Register::rbp, Register::none, 0b00, 0));
    mir.push(Inst::new(Tag::Mov, Register::rbp, Register::rsp, 0b00, 0));
    mir.push(Inst::new(Tag::Sub, Register::rsp, Register::none, 0b00, 32));
    mir.push(Inst::new(Tag::Mov, Register::rax, Register::none, 0b00, 0));
    mir.push(Inst::new(Tag::Pop, Register::rbp, Register::none, 0b00, 0));
    mir.push(Inst::new(Tag::Ret, Register::none, Register::none, 0b11, 0));

    let mut code = Vec::new();
    let mut linker = NullRelocSink;
    let mut debug = NullDebugInfoSink;
    let output = emit(
        &mir,
        &mut code,
        &mut linker,
        &mut debug,
        LinkerBackend::MachO,
        SourceLoc { line: 1, column: 1 },
    )
    .expect("a straight-line function body always emits cleanly");

    assert_eq!(output.code_offset_mapping.len(), mir.insts.len());
    assert_eq!(output.code_offset_mapping[0], 0);
    // push rbp is one byte; every later offset must have advanced past it.
    assert_eq!(output.code_offset_mapping[1], 1);
    assert!(code.ends_with(&[0x5D, 0xC3]));
}

#[test]
fn backward_branch_reuses_an_already_known_offset() {
    init();
    let mut mir = Mir::new();
    let loop_top = mir.push(Inst::new(
        Tag::Sub,
        Register::rcx,
        Register::none,
        0b00,
        1,
    ));
    mir.push(Inst::new(
        Tag::JccEq,
        Register::none,
        Register::none,
        0b01, // flags&1 == 1 selects "Ne" within the JccEq family
        loop_top,
    ));
    mir.push(Inst::new(Tag::Ret, Register::none, Register::none, 0b11, 0));

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

    let jcc_disp_offset = output.code_offset_mapping[1] + 2;
    let disp = i32::from_le_bytes(
        code[jcc_disp_offset as usize..jcc_disp_offset as usize + 4]
            .try_into()
            .unwrap(),
    );
    let source = output.code_offset_mapping[1] as i64;
    let length = 6i64;
    let target = output.code_offset_mapping[0] as i64;
    assert_eq!(i64::from(disp), target - (source + length));
    assert!(disp < 0, "a branch back to loop_top has a negative displacement");
}

#[test]
fn lea_rip_with_got_relocation_is_forwarded_not_patched_locally() {
    init();
    let mut mir = Mir::new();
    mir.push(Inst::new(
        Tag::LeaRip,
        Register::rdi,
        Register::none,
        0b01, // flags&1 == 1: GOT relocation path
        42,   // symbol index, forwarded verbatim as LinkerReloc::target
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

    assert_eq!(linker.0.len(), 1);
    let reloc: LinkerReloc = linker.0[0];
    assert_eq!(reloc.kind, RelocKind::Got);
    assert_eq!(reloc.target, 42);
    assert!(reloc.pcrel);
    // the disp32 field was left zeroed for the linker to fill in, not patched.
    assert_eq!(&code[code.len() - 4..], &[0, 0, 0, 0]);
}

#[test]
fn lea_rip_on_an_unsupported_backend_fails_closed_with_no_relocation_recorded() {
    init();
    let mut mir = Mir::new();
    mir.push(Inst::new(
        Tag::LeaRip,
        Register::rdi,
        Register::none,
        0b01,
        0,
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
        SourceLoc { line: 3, column: 9 },
    )
    .unwrap_err();

    assert!(matches!(err, EmitError::EmitFail { .. }));
}

#[derive(Default)]
struct RecordingDebugInfo {
    prologue_ends: Vec<u32>,
    epilogue_begins: Vec<u32>,
    lines: Vec<(u32, u32, u32)>,
}

impl DebugInfoSink for RecordingDebugInfo {
    fn prologue_end(&mut self, pc: u32) {
        self.prologue_ends.push(pc);
    }

    fn epilogue_begin(&mut self, pc: u32) {
        self.epilogue_begins.push(pc);
    }

    fn line(&mut self, pc: u32, line: u32, column: u32) {
        self.lines.push((pc, line, column));
    }
}

#[test]
fn debug_markers_interleave_with_manual_emit_one_driving() {
    init();
    let mut mir = Mir::new();
    mir.push(Inst::new(Tag::Push, Register::rbp, Register::none, 0b00, 0));
    mir.push(Inst::new(Tag::Mov, Register::rax, Register::none, 0b00, 7));
    mir.push(Inst::new(Tag::Pop, Register::rbp, Register::none, 0b00, 0));
    mir.push(Inst::new(Tag::Ret, Register::none, Register::none, 0b11, 0));

    let mut code = Vec::new();
    let mut linker = NullRelocSink;
    let mut debug = RecordingDebugInfo::default();
    let mut emitter = x64_mir_emit::Emitter::new(
        &mir,
        &mut linker,
        &mut debug,
        LinkerBackend::MachO,
        SourceLoc::default(),
    );

    emitter.emit_one(&mut code, 0).unwrap();
    emitter.mark_prologue_end(code.len() as u32);
    emitter.emit_one(&mut code, 1).unwrap();
    emitter.mark_line(code.len() as u32, 10, 5);
    emitter.emit_one(&mut code, 2).unwrap();
    emitter.mark_epilogue_begin(code.len() as u32);
    emitter.emit_one(&mut code, 3).unwrap();
    emitter.finish(&mut code).unwrap();

    assert_eq!(debug.prologue_ends, vec![1]);
    assert_eq!(debug.lines, vec![(8, 10, 5)]);
    assert_eq!(debug.epilogue_begins.len(), 1);
    assert_eq!(code, vec![0x55, 0x48, 0xC7, 0xC0, 0x07, 0x00, 0x00, 0x00, 0x5D, 0xC3]);
}

#[test]
fn out_of_memory_is_reported_by_a_reservation_that_always_fails() {
    init();

    struct RefusingSink;

    impl x64_mir_emit::CodeSink for RefusingSink {
        fn reserve(&mut self, _additional: usize) -> Result<(), EmitError> {
            Err(EmitError::OutOfMemory)
        }
        fn put1(&mut self, _byte: u8) {
            unreachable!("reserve always fails first");
        }
        fn put2(&mut self, _value: u16) {
            unreachable!("reserve always fails first");
        }
        fn put4(&mut self, _value: u32) {
            unreachable!("reserve always fails first");
        }
        fn put8(&mut self, _value: u64) {
            unreachable!("reserve always fails first");
        }
        fn current_offset(&self) -> usize {
            0
        }
        fn patch4_at(&mut self, _offset: usize, _value: u32) {
            unreachable!("no relocations are recorded before the reservation fails");
        }
    }

    let mut mir = Mir::new();
    mir.push(Inst::new(Tag::Ret, Register::none, Register::none, 0b11, 0));

    let mut sink = RefusingSink;
    let mut linker = NullRelocSink;
    let mut debug = NullDebugInfoSink;
    let err = emit(
        &mir,
        &mut sink,
        &mut linker,
        &mut debug,
        LinkerBackend::MachO,
        SourceLoc::default(),
    )
    .unwrap_err();

    assert!(matches!(err, EmitError::OutOfMemory));
}
