//! The byte sink the emitter writes into.
//!
//! [`CodeSink`] is the seam between this crate and its caller: the caller
//! owns the output buffer (and its allocator) for the duration of one
//! declaration's emission. The only primitive the emitter actually depends
//! on beyond raw appends is [`CodeSink::reserve`], which every instruction
//! must call exactly once before writing any of its bytes — see
//! [`crate::encoder::Encoder`].

/// An append-only destination for emitted machine code.
pub trait CodeSink {
    /// Reserve room for `additional` more bytes without reallocating.
    ///
    /// Implementations must propagate allocation failure rather than abort
    /// the process, since one failed declaration should not bring down an
    /// entire compilation.
    fn reserve(&mut self, additional: usize) -> Result<(), crate::error::EmitError>;

    /// Append one byte.
    fn put1(&mut self, byte: u8);

    /// Append two bytes, little-endian.
    fn put2(&mut self, value: u16);

    /// Append four bytes, little-endian.
    fn put4(&mut self, value: u32);

    /// Append eight bytes, little-endian.
    fn put8(&mut self, value: u64);

    /// The number of bytes written so far.
    fn current_offset(&self) -> usize;

    /// Overwrite the four bytes at `offset` with `value`, little-endian.
    ///
    /// Used only by relocation fixup, which patches previously-emitted
    /// branch displacements once all instruction offsets are known.
    fn patch4_at(&mut self, offset: usize, value: u32);
}

/// The default [`CodeSink`]: a plain growable byte buffer.
impl CodeSink for Vec<u8> {
    fn reserve(&mut self, additional: usize) -> Result<(), crate::error::EmitError> {
        self.try_reserve(additional)
            .map_err(|_| crate::error::EmitError::OutOfMemory)
    }

    fn put1(&mut self, byte: u8) {
        self.push(byte);
    }

    fn put2(&mut self, value: u16) {
        self.extend_from_slice(&value.to_le_bytes());
    }

    fn put4(&mut self, value: u32) {
        self.extend_from_slice(&value.to_le_bytes());
    }

    fn put8(&mut self, value: u64) {
        self.extend_from_slice(&value.to_le_bytes());
    }

    fn current_offset(&self) -> usize {
        self.len()
    }

    fn patch4_at(&mut self, offset: usize, value: u32) {
        self[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }
}
