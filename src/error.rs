//! Error kinds produced while emitting one declaration.
//!
//! Every error here is terminal for the declaration being emitted: nothing
//! in this crate retries. The caller is expected to surface `EmitError` as a
//! user-visible diagnostic attached to the declaration's source location.

use thiserror::Error;

/// A source location a diagnostic can be attached to, supplied by the
/// caller (the driver owns line/column tracking; this crate only forwards
/// it into error messages).
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct SourceLoc {
    pub line: u32,
    pub column: u32,
}

impl std::fmt::Display for SourceLoc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.line, self.column)
    }
}

/// Errors raised while lowering MIR into bytes.
#[derive(Debug, Error)]
pub enum EmitError {
    /// A buffer growth failed. Propagated unchanged; never retried.
    #[error("out of memory while emitting code")]
    OutOfMemory,

    /// Everything else: unknown tag, unimplemented encoding variant, a
    /// missing relocation target, or an oversized branch displacement.
    /// Carries a message and the declaration-level source location it
    /// should be attached to.
    #[error("{loc}: {message}")]
    EmitFail { message: String, loc: SourceLoc },
}

impl EmitError {
    pub(crate) fn fail(loc: SourceLoc, message: impl Into<String>) -> Self {
        EmitError::EmitFail {
            message: message.into(),
            loc,
        }
    }

    pub(crate) fn unimplemented(loc: SourceLoc, what: &str) -> Self {
        Self::fail(loc, format!("not yet implemented: {what}"))
    }

    pub(crate) fn missing_reloc_target(loc: SourceLoc, target: u32) -> Self {
        Self::fail(
            loc,
            format!("relocation target mir index {target} was never emitted"),
        )
    }

    pub(crate) fn displacement_overflow(loc: SourceLoc, disp: i64) -> Self {
        Self::fail(
            loc,
            format!("branch displacement {disp} does not fit in i32"),
        )
    }

    pub(crate) fn unsupported_linker_backend(loc: SourceLoc, name: &str) -> Self {
        Self::fail(loc, format!("unsupported linker backend: {name}"))
    }
}

pub type EmitResult<T> = Result<T, EmitError>;
