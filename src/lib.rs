//! x86_64 machine-code emission core: lowers a compact columnar Machine IR
//! into raw instruction bytes, resolving intra-function branch
//! displacements and forwarding external relocations to a linker backend.
//!
//! The two halves of this crate mirror the two halves of the problem:
//! [`mir`] is the data model the rest of the compiler produces, and
//! [`emit`] is the single-pass driver that turns it into bytes. Everything
//! else ([`reg`], [`rex`], [`encoder`], [`opcodes`]) is plumbing the driver
//! leans on.

pub mod encoder;
pub mod emit;
pub mod error;
pub mod mir;
pub mod opcodes;
pub mod reg;
pub mod reloc;
pub mod rex;
pub mod sink;

pub use emit::{emit, EmitOutput, Emitter};
pub use error::{EmitError, EmitResult, SourceLoc};
pub use mir::{ArithForm, ArithOp, Condition, Extra, ImmPair, Imm64, Inst, Mir, Tag};
pub use reg::Register;
pub use reloc::{
    DebugInfoSink, LinkerBackend, LinkerReloc, NullDebugInfoSink, NullRelocSink, RecordingRelocSink,
    RelocKind, RelocSink,
};
pub use sink::CodeSink;
