//! Per-call execution state: the register file, block stack, and the other
//! bookkeeping the Evaluator threads through one invocation of RegCode.

use crate::opcode::Reg;
use crate::regcode::RegCode;
use std::fmt;
use std::sync::Arc;

/// Opaque identity key for a host code object, used by the Call Bridge cache
/// to recognize "we've already compiled this." The embedder is responsible
/// for making this stable and unique for the lifetime of the code object
/// (typically the host's own pointer or interned id).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CodeId(pub u64);

impl fmt::Display for CodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "code#{:x}", self.0)
    }
}

/// A source line number, carried through compilation for traceback
/// reporting. `0` means "unknown."
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct SourceLine(pub u32);

impl fmt::Display for SourceLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 == 0 {
            f.write_str("<unknown>")
        } else {
            write!(f, "line {}", self.0)
        }
    }
}

/// One entry of the block stack, mirroring the host's own
/// `SETUP_LOOP`/`SETUP_EXCEPT`/`SETUP_FINALLY`/`SETUP_WITH` model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockEntry {
    /// A loop body. `BREAK_LOOP` jumps to `end`; `CONTINUE_LOOP` jumps to a
    /// target supplied by the instruction itself, not stored here.
    Loop {
        /// Byte offset just past the loop, where `BREAK_LOOP` resumes.
        end: u32,
        /// Shadow-stack depth at the point this entry was pushed, restored
        /// on unwind.
        stack_depth: u16,
    },
    /// An active `try`/`except`. Unwinding resumes at `handler` with the
    /// pending error visible to the handler block.
    Except {
        /// Byte offset of the handler's first instruction.
        handler: u32,
        /// Shadow-stack depth at the point this entry was pushed, restored
        /// on unwind.
        stack_depth: u16,
    },
    /// An active `try`/`finally`. Unwinding (whether from a raise, a
    /// `BREAK_LOOP`, or a `RETURN`) resumes at `handler`, which re-raises or
    /// re-executes the interrupted control transfer once the finally body
    /// completes.
    Finally {
        /// Byte offset of the finally body's first instruction.
        handler: u32,
        /// Shadow-stack depth at the point this entry was pushed, restored
        /// on unwind.
        stack_depth: u16,
    },
    /// An active `with` block. `manager` names the register holding the
    /// context manager, so `__exit__` can be invoked on unwind without the
    /// block stack itself needing a host handle.
    With {
        /// Byte offset of the `__exit__` call sequence.
        handler: u32,
        /// Register holding the context manager.
        manager: Reg,
        /// Shadow-stack depth at the point this entry was pushed, restored
        /// on unwind.
        stack_depth: u16,
    },
}

impl BlockEntry {
    /// The byte offset control resumes at when this entry is taken during
    /// unwind (as opposed to falling off the end normally).
    pub const fn handler(&self) -> u32 {
        match self {
            Self::Loop { end, .. } => *end,
            Self::Except { handler, .. } | Self::Finally { handler, .. } | Self::With { handler, .. } => *handler,
        }
    }

    /// Shadow-stack depth to restore when this entry is taken during
    /// unwind.
    pub const fn stack_depth(&self) -> u16 {
        match self {
            Self::Loop { stack_depth, .. }
            | Self::Except { stack_depth, .. }
            | Self::Finally { stack_depth, .. }
            | Self::With { stack_depth, .. } => *stack_depth,
        }
    }

    /// `true` if this entry catches a raised exception (an `Except` or
    /// `Finally` entry; a `Loop` or `With` entry does not by itself).
    pub const fn catches_exceptions(&self) -> bool {
        matches!(self, Self::Except { .. } | Self::Finally { .. })
    }
}

/// Per-call execution state. One `Frame` exists per active invocation of a
/// RegCode body; generators keep their `Frame` alive on the heap across
/// `YIELD_VALUE` suspension instead of it living only on a native call stack.
pub struct Frame<H> {
    /// The RegCode this frame is executing.
    pub code: Arc<RegCode>,
    /// Register file. Sized to `code.register_count` at frame construction.
    pub registers: Vec<H>,
    /// Closure cell slots, shared with any nested closures created from this
    /// frame's `MAKE_CLOSURE`. Allocated eagerly at frame entry.
    pub cells: Vec<H>,
    /// Auxiliary push/pop stack for opcodes whose result arity isn't fixed
    /// at compile time (multi-value unpacking, slice bound assembly). Not
    /// the value stack the Compiler eliminated — this is a small, local
    /// scratch area, typically empty between instructions.
    pub shadow_stack: Vec<H>,
    /// Active block-stack entries, innermost last.
    pub block_stack: Vec<BlockEntry>,
    /// Byte offset of the next instruction to execute.
    pub ip: u32,
    /// The globals mapping (host dict-like object).
    pub globals: H,
    /// The builtins mapping, consulted by `LOAD_GLOBAL` when `globals`
    /// doesn't have the name.
    pub builtins: Option<H>,
    /// An optional separate locals mapping, used only for the exec-style
    /// namespaces spec.md's External Interfaces describe; ordinary function
    /// frames use `registers` as locals storage and leave this `None`.
    pub locals: Option<H>,
    /// Pending error, set by a failing OPS operation or `RAISE` and cleared
    /// by the nearest enclosing handler that catches it.
    pub pending_error: Option<H>,
    /// Human-readable name of the function this frame is executing, for
    /// traceback construction. Empty if the code object carries none.
    pub function_name: String,
    /// Per-opcode and instruction counters, compiled in only behind the
    /// `profile` feature.
    #[cfg(feature = "profile")]
    pub profile: crate::profiler::FrameProfile,
}

impl<H> Frame<H> {
    /// Construct a fresh frame ready to execute `code` from its first
    /// instruction. `registers` must already be sized and filled by the Call
    /// Bridge's argument-binding step before the Evaluator takes over.
    pub fn new(
        code: Arc<RegCode>,
        registers: Vec<H>,
        cells: Vec<H>,
        globals: H,
        builtins: Option<H>,
        function_name: String,
    ) -> Self {
        Self {
            code,
            registers,
            cells,
            shadow_stack: Vec::new(),
            block_stack: Vec::new(),
            ip: 0,
            globals,
            builtins,
            locals: None,
            pending_error: None,
            function_name,
            #[cfg(feature = "profile")]
            profile: crate::profiler::FrameProfile::default(),
        }
    }

    /// Current source line, looked up from the code object's line table for
    /// the active `ip`. Falls back to `SourceLine(0)` if the table has no
    /// entry covering it (should not happen for well-formed RegCode, but the
    /// traceback path must not panic on it).
    pub fn current_line(&self) -> SourceLine {
        self.code.line_for_offset(self.ip)
    }
}

impl<H: fmt::Debug> fmt::Debug for Frame<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("function_name", &self.function_name)
            .field("ip", &self.ip)
            .field("registers", &self.registers.len())
            .field("block_stack", &self.block_stack)
            .finish()
    }
}
