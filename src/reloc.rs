//! Relocations: intra-function branch fixups resolved by this crate, and
//! external relocation requests forwarded to the linker backend.

/// An intra-function branch relocation, recorded while walking MIR and
/// resolved against `code_offset_mapping` once every instruction has been
/// emitted.
#[derive(Copy, Clone, Debug)]
pub struct BranchReloc {
    /// Byte offset where this instruction's bytes start.
    pub source: u64,
    /// The MIR index the branch targets.
    pub target: u32,
    /// Byte offset of the 32-bit displacement field to patch.
    pub offset: u64,
    /// Total byte length of the branch instruction (5 for `jmp`/`call`
    /// relative, 6 for conditional jumps).
    pub length: u8,
}

/// What kind of external relocation request this is.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RelocKind {
    /// A relative call/branch to an external symbol.
    Branch,
    /// A RIP-relative load of a GOT entry.
    Got,
}

/// A relocation request forwarded to the linker backend: this crate never
/// patches these bytes itself (they stay zero in the code buffer).
#[derive(Copy, Clone, Debug)]
pub struct LinkerReloc {
    /// Byte offset of the disp32 field to eventually patch.
    pub offset: u32,
    /// Global symbol index (branch) or local GOT entry index (got).
    pub target: u32,
    pub addend: i32,
    pub pcrel: bool,
    /// `log2` of the field width in bytes; always 2 (4-byte field) here.
    pub length: u8,
    pub kind: RelocKind,
}

/// Receives [`LinkerReloc`] requests. The object-file writer / linker
/// backend implements this; this crate only produces requests, it never
/// resolves them.
pub trait RelocSink {
    fn relocate(&mut self, reloc: LinkerReloc);
}

/// A no-op sink, useful for tests and for declarations that never reference
/// external symbols or GOT entries.
#[derive(Default)]
pub struct NullRelocSink;

impl RelocSink for NullRelocSink {
    fn relocate(&mut self, _reloc: LinkerReloc) {}
}

/// A sink that records every request it receives, for tests.
#[derive(Default)]
pub struct RecordingRelocSink(pub Vec<LinkerReloc>);

impl RelocSink for RecordingRelocSink {
    fn relocate(&mut self, reloc: LinkerReloc) {
        self.0.push(reloc);
    }
}

/// Which object-file backend is writing out these relocations. Only
/// Mach-O is wired today; any other backend is a diagnosed failure at the
/// point a relocation is about to be forwarded.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LinkerBackend {
    MachO,
    Unsupported,
}

/// Debug-line markers the emitter forwards, each stamped with the current
/// byte offset. The emitter does not interpret these itself; it only
/// tracks `prev_line`/`prev_column`/`prev_pc` so the sink can compute
/// deltas if it wants to.
pub trait DebugInfoSink {
    fn prologue_end(&mut self, pc: u32);
    fn epilogue_begin(&mut self, pc: u32);
    fn line(&mut self, pc: u32, line: u32, column: u32);
}

#[derive(Default)]
pub struct NullDebugInfoSink;

impl DebugInfoSink for NullDebugInfoSink {
    fn prologue_end(&mut self, _pc: u32) {}
    fn epilogue_begin(&mut self, _pc: u32) {}
    fn line(&mut self, _pc: u32, _line: u32, _column: u32) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_sink_preserves_insertion_order() {
        let mut sink = RecordingRelocSink::default();
        sink.relocate(LinkerReloc {
            offset: 1,
            target: 10,
            addend: 0,
            pcrel: true,
            length: 2,
            kind: RelocKind::Branch,
        });
        sink.relocate(LinkerReloc {
            offset: 2,
            target: 20,
            addend: 0,
            pcrel: true,
            length: 2,
            kind: RelocKind::Got,
        });
        assert_eq!(sink.0.len(), 2);
        assert_eq!(sink.0[0].target, 10);
        assert_eq!(sink.0[1].kind, RelocKind::Got);
    }
}
