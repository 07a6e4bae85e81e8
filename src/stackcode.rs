//! Stack bytecode: the Compiler's input format.
//!
//! This is the host language's own pre-compiled representation — a linear
//! stream of stack-manipulating operations, exactly as the host's own
//! compiler would have produced from source text. The engine never parses
//! source; it only ever receives already-compiled `StackCode`.

use std::sync::Arc;

use num_bigint::BigInt;

use crate::frame::SourceLine;
use crate::regcode::Arity;

/// One stack-bytecode constant. Kept separate from [`crate::regcode::Constant`]
/// because the Compiler's constant folding pass can introduce *new* constants
/// (e.g. folding `2 + 2` into `4`) that never appeared in the host's own pool.
#[derive(Debug, Clone, PartialEq)]
pub enum StackConstant {
    /// The host's `None`/unit singleton.
    None,
    /// A boolean literal.
    Bool(bool),
    /// A fixed-width integer literal.
    Int(i64),
    /// An arbitrary-precision integer literal.
    BigInt(BigInt),
    /// A floating point literal.
    Float(f64),
    /// A string literal.
    Str(String),
    /// A nested, not-yet-compiled function body.
    Code(Arc<StackCode>),
}

/// One stack-bytecode instruction. Operands reference the enclosing
/// [`StackCode`]'s constant/name pools by index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StackOp {
    /// Push `constants[idx]`.
    LoadConst(u32),
    /// Push `locals[slot]`.
    LoadFast(u32),
    /// Pop and store into `locals[slot]`.
    StoreFast(u32),
    /// Push `globals[names[idx]]` (falling back to builtins).
    LoadGlobal(u32),
    /// Pop and store into `globals[names[idx]]`.
    StoreGlobal(u32),
    /// Push `cells[idx]`.
    LoadDeref(u32),
    /// Pop and store into `cells[idx]`.
    StoreDeref(u32),
    /// Duplicate the top of stack.
    DupTop,
    /// Discard the top of stack.
    PopTop,
    /// Swap the top two stack entries.
    RotTwo,
    /// Pop one value off the shadow stack, pushing it onto the abstract
    /// stack. Used to pull the exception handle `raise` transfers onto the
    /// shadow stack back into a handler's own stack for `exc-match`/binding.
    PopShadow,
    /// Pop `b, a`; push `a OP b` for the named binary operator (`"+"`,
    /// `"-"`, `"*"`, `"/"`, `"//"`, `"%"`, `"**"`, `"&"`, `"|"`, `"^"`,
    /// `"<<"`, `">>"`, `"<"`, `"<="`, `">"`, `">="`, `"=="`, `"!="`,
    /// `"in"`, `"is"`, `"is not"`, `"not in"`).
    BinaryOp(&'static str),
    /// Pop `b, a`; push the in-place form of the named operator (`"+"`
    /// meaning `a += b`, with the same `a OP b` semantics as [`BinaryOp`]
    /// when the host has no true in-place mutation).
    InplaceOp(&'static str),
    /// Pop `a`; push `-a`.
    UnaryNegate,
    /// Pop `a`; push `bool(a)`.
    UnaryNot,
    /// Pop `b, a`; push `a[b]`.
    BinarySubscr,
    /// Pop `value, key, obj`; store `obj[key] = value`.
    StoreSubscr,
    /// Pop `key, obj`; delete `obj[key]`.
    DeleteSubscr,
    /// Pop `obj`; push `getattr(obj, names[idx])`.
    LoadAttr(u32),
    /// Pop `value, obj`; `setattr(obj, names[idx], value)`.
    StoreAttr(u32),
    /// Pop `n` items; push a sequence built from them, in order.
    BuildSequence(u32),
    /// Pop `2 * n` items (alternating key, value); push a mapping.
    BuildMapping(u32),
    /// Pop `obj`; push its `n` unpacked elements, in reverse order (so a
    /// following sequence of `StoreFast`s consumes them left to right).
    UnpackSequence(u32),
    /// Pop `obj`; push `iter(obj)`.
    GetIter,
    /// Peek the iterator on top of stack; push `next(iterator)`, or jump by
    /// `target` (absolute instruction index) and pop the iterator if exhausted.
    ForIter(u32),
    /// Unconditional jump to the absolute instruction index.
    JumpAbsolute(u32),
    /// Pop `a`; jump to the absolute offset if `a` is falsy.
    PopJumpIfFalse(u32),
    /// Pop `a`; jump to the absolute offset if `a` is truthy.
    PopJumpIfTrue(u32),
    /// Push a `LOOP` block entry whose `BREAK_LOOP` target is the absolute
    /// offset.
    SetupLoop(u32),
    /// Push an `EXCEPT` block entry whose handler is the absolute offset.
    SetupExcept(u32),
    /// Push a `FINALLY` block entry whose handler is the absolute offset.
    SetupFinally(u32),
    /// Pop `manager`; push a `WITH` block entry whose `__exit__` sequence is
    /// the absolute offset.
    SetupWith(u32),
    /// Pop the innermost block-stack entry.
    PopBlock,
    /// Break out of the innermost loop.
    BreakLoop,
    /// Continue the innermost loop at the absolute offset.
    ContinueLoop(u32),
    /// Pop `exc` (or re-raise the active exception if the stack is empty at
    /// this depth) and raise it.
    RaiseVarargs,
    /// Clear the pending exception and resume normal control flow.
    EndExcept,
    /// Pop the exception handle on top of stack; push whether it matches the
    /// host exception class `names[idx]`.
    ExcMatch(u32),
    /// Pop `n` arguments (in call order) and the callable beneath them; push
    /// the result.
    CallFunction(u32),
    /// Pop, in order, the callable, `n_positional` positional arguments, and
    /// one value per name in `kwname_tables[kwnames_idx]`; push the result.
    CallFunctionKw {
        /// Count of positional arguments beneath the keyword values.
        n_positional: u32,
        /// Index into `kwname_tables` of this call's keyword-argument name
        /// list.
        kwnames_idx: u32,
    },
    /// Pop, in order, the callable, `n_positional` positional arguments, and
    /// a trailing `*args` iterable; push the result.
    CallFunctionVar(u32),
    /// Pop, in order, the callable, `n_positional` positional arguments,
    /// one value per name in `kwname_tables[kwnames_idx]`, a trailing
    /// `*args` iterable, and a trailing `**kwargs` mapping; push the result.
    CallFunctionVarKw {
        /// Count of positional arguments beneath the keyword values.
        n_positional: u32,
        /// Index into `kwname_tables` of this call's keyword-argument name
        /// list.
        kwnames_idx: u32,
    },
    /// Pop `code_const_idx`'s nested code constant and `n_cells` captured
    /// cell indices (naming cells of *this* frame); push the resulting
    /// closure.
    MakeClosure {
        /// Index into `constants` of the nested [`StackCode`] to close over.
        code_const_idx: u32,
        /// Indices into this frame's own cell slots to capture, in order.
        captures: Vec<u32>,
    },
    /// Pop `value`; suspend this frame, yielding it to the caller.
    YieldValue,
    /// Pop `value`; return it to the caller, ending this frame.
    ReturnValue,
    /// No operation — used for alignment and as a jump target placeholder.
    Nop,
}

/// A stack-bytecode function body, exactly as the host's own compiler would
/// hand it to the engine's `compile` entry point.
#[derive(Debug, Clone, PartialEq)]
pub struct StackCode {
    /// Human-readable name (for tracebacks and disassembly).
    pub name: String,
    /// Linear instruction stream, indexed by position for jump targets.
    pub instructions: Vec<StackOp>,
    /// Constant pool.
    pub constants: Vec<StackConstant>,
    /// Name pool (attribute/global names).
    pub names: Vec<String>,
    /// Keyword-argument name lists, indexed by `CallFunctionKw`'s and
    /// `CallFunctionVarKw`'s `kwnames_idx`. Kept separate from `names`
    /// since a call site needs an ordered *list* of names, not a single one.
    pub kwname_tables: Vec<Vec<String>>,
    /// Number of local variable slots `LoadFast`/`StoreFast` address.
    pub local_count: u32,
    /// Number of cell slots this body's nested closures capture.
    pub cell_count: u32,
    /// Number of cells this body itself captures from its defining frame.
    pub free_var_count: u32,
    /// Calling convention.
    pub arity: Arity,
    /// Source line active for each instruction, by index; same length as
    /// `instructions`.
    pub lines: Vec<SourceLine>,
}
