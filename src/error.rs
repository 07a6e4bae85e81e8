//! Engine error types
//!
//! Mirrors the split the teacher draws between a small set of structured,
//! matchable failure tags that cross the OPS boundary ([`ErrorKind`]) and the
//! richer error the embedder ultimately observes from `compile`/`run`
//! ([`EngineError`]), which also carries the traceback built while unwinding.

use std::fmt;

use thiserror::Error;

use crate::frame::SourceLine;

/// Engine-internal error tag. Every OPS operation that can fail reports one
/// of these; they map 1:1 onto host exception classes at the embedder
/// boundary.
///
/// `IterationStopped` is not really an error — it's the iterator-exhausted
/// sentinel `iter_next` returns — but it travels through the same channel as
/// everything else since the Evaluator must special-case it the same way it
/// special-cases a real failure (branch on the pending-error slot).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ErrorKind {
    /// Argument binding failed: too few/many positional args, duplicate
    /// keyword, missing required argument, or wrong arity for an unpack
    /// target.
    BadArgument,
    /// `get_attr`/`set_attr`/`del_attr` on a name the object doesn't have.
    AttributeMissing,
    /// `get_item`/`set_item`/`del_item` on a dict-like object with a missing
    /// key.
    KeyMissing,
    /// `get_item`/`set_item`/`del_item` on a sequence with an out-of-range
    /// index.
    IndexOutOfRange,
    /// An OPS operation is not supported on its operand types.
    TypeMismatch,
    /// Zero division, overflow, or another arithmetic failure.
    ArithmeticError,
    /// Sentinel returned by `iter_next` instead of a value: the iterator is
    /// exhausted. Not catchable as a user exception class of its own; it
    /// only ever reaches `FOR_ITER`.
    IterationStopped,
    /// Propagated from a `RAISE` opcode, or from host code re-entering the
    /// engine and itself raising.
    UserRaised,
    /// An engine invariant was violated. Never catchable by user code;
    /// aborts the engine rather than being swallowed.
    Internal,
}

impl ErrorKind {
    /// `true` for the one tag that is a control-flow sentinel rather than an
    /// observable user error.
    pub const fn is_iteration_stopped(self) -> bool {
        matches!(self, Self::IterationStopped)
    }

    /// `true` for the one tag user code must never be able to catch.
    pub const fn is_internal(self) -> bool {
        matches!(self, Self::Internal)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::BadArgument => "bad argument",
            Self::AttributeMissing => "attribute missing",
            Self::KeyMissing => "key missing",
            Self::IndexOutOfRange => "index out of range",
            Self::TypeMismatch => "type mismatch",
            Self::ArithmeticError => "arithmetic error",
            Self::IterationStopped => "iteration stopped",
            Self::UserRaised => "user raised",
            Self::Internal => "internal engine error",
        };
        f.write_str(s)
    }
}

/// One frame's contribution to a traceback: the call site, innermost first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceEntry {
    /// Human-readable name of the function owning the frame, if the code
    /// object carries one.
    pub function: String,
    /// Source line active in that frame when it contributed to the
    /// traceback (the raise site, the call site, or the handler site).
    pub line: SourceLine,
}

/// Richer error surfaced to the embedder from `compile`/`run`, once
/// unwinding has exhausted every engine Frame.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{kind}: {message}")]
pub struct EngineError {
    /// The engine-internal tag, preserved for `From`/matching by embedders.
    pub kind: ErrorKind,
    /// Human-readable message, built the same way the host runtime would
    /// format the equivalent exception.
    pub message: String,
    /// Traceback, innermost frame first.
    pub traceback: Vec<TraceEntry>,
}

impl EngineError {
    /// Construct a bare error with no traceback yet attached. The Evaluator
    /// pushes [`TraceEntry`] values onto `traceback` as the error unwinds
    /// through each Frame.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            traceback: Vec::new(),
        }
    }

    /// Push a contributing frame onto the traceback. Called by the Evaluator
    /// on every Frame the error unwinds through that found no handler.
    pub fn with_frame(mut self, function: impl Into<String>, line: SourceLine) -> Self {
        self.traceback.push(TraceEntry {
            function: function.into(),
            line,
        });
        self
    }
}

/// Errors the Compiler can report. Distinct from [`EngineError`] because
/// compilation failures are about malformed input (a code object that
/// violates a RegCode invariant), not about executing the program it
/// describes.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CompileError {
    /// A register index appears that is `>=` the RegCode's register count.
    #[error("register r{index} out of bounds (register file has {count} slots)")]
    RegisterOutOfBounds {
        /// Offending register index.
        index: u32,
        /// Size of the register file it should have fit in.
        count: u32,
    },
    /// A jump target does not land on the start of a valid instruction.
    #[error("jump target {offset} is not a valid instruction boundary")]
    BadJumpTarget {
        /// The invalid byte offset.
        offset: u32,
    },
    /// An exception table entry has `start >= end`, or an unreachable
    /// handler.
    #[error("malformed exception table entry: start={start} end={end} handler={handler}")]
    BadExceptionEntry {
        /// Entry's start offset.
        start: u32,
        /// Entry's end offset.
        end: u32,
        /// Entry's handler offset.
        handler: u32,
    },
    /// The host code object itself is malformed (truncated instruction
    /// stream, out-of-range constant/name index, etc).
    #[error("malformed host code object: {0}")]
    MalformedCodeObject(String),
    /// An instruction referenced a stack depth the abstract stack simulator
    /// never populated (join-point mismatch between predecessors).
    #[error("unresolved stack slot at depth {depth} entering block {block}")]
    UnresolvedStackSlot {
        /// Stack depth with no canonical register mapping.
        depth: u32,
        /// Basic block id where the mismatch was detected.
        block: u32,
    },
}

/// Result alias used throughout OPS and the Evaluator: operations that fail
/// report an [`ErrorKind`] rather than unwinding through `?`, since the
/// Evaluator must drive its own block-stack-aware unwind instead of Rust's.
pub type HostResult<T> = Result<T, ErrorKind>;

/// Result alias for the Compiler.
pub type CompileResult<T> = Result<T, CompileError>;

/// Result alias for embedder-facing engine entry points.
pub type EngineResult<T> = Result<T, EngineError>;
