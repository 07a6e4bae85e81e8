//! `RegCode`: the Compiler's output and the Evaluator's input.
//!
//! A `RegCode` is a fully self-contained, validated register-machine body:
//! its instruction stream, constant pool, name pool, and the argument/cell
//! layout the Call Bridge needs to bind a call into a fresh [`Frame`].

use std::sync::Arc;

use num_bigint::BigInt;

use crate::error::{CompileError, CompileResult};
use crate::frame::SourceLine;
use crate::opcode::Instruction;

/// One entry of the constant pool. Mirrors the host's own constant kinds;
/// `Code` nests a fully compiled child `RegCode` for `MAKE_CLOSURE`'s code
/// operand so closures don't need a second round-trip through the Call
/// Bridge's cache to find their body.
#[derive(Debug, Clone, PartialEq)]
pub enum Constant {
    /// The host's `None`/unit singleton.
    None,
    /// A boolean literal.
    Bool(bool),
    /// A fixed-width integer literal.
    Int(i64),
    /// An arbitrary-precision integer literal (the bignum-add scenario
    /// requires this; `10**50 + 200` does not fit in 64 bits).
    BigInt(BigInt),
    /// A floating point literal.
    Float(f64),
    /// A string literal.
    Str(String),
    /// A nested, already-compiled function body (used by `MAKE_CLOSURE`).
    Code(Arc<RegCode>),
}

/// A line-table entry: instructions at byte offsets `[start, end)` map to
/// `line`. Entries are sorted by `start` and the ranges are contiguous and
/// non-overlapping by construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineEntry {
    /// Start of the covered byte range, inclusive.
    pub start: u32,
    /// End of the covered byte range, exclusive.
    pub end: u32,
    /// Source line active for instructions in this range.
    pub line: SourceLine,
}

/// A compiled exception-table entry, produced by the blocks pass as a
/// validation summary of the `SETUP_EXCEPT`/`SETUP_FINALLY` instructions it
/// emitted. The Evaluator itself consults the live block stack at runtime,
/// not this table; this table exists so `RegCode::validate` can check
/// exception-handling invariants (ordering, reachability) independently of
/// whether the dispatch loop happens to exercise every path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExceptionEntry {
    /// Start of the protected byte range, inclusive.
    pub start: u32,
    /// End of the protected byte range, exclusive.
    pub end: u32,
    /// Byte offset of the handler.
    pub handler: u32,
    /// Shadow-stack depth in effect when this entry's `SETUP_EXCEPT`/
    /// `SETUP_FINALLY` ran, to be restored on entry to the handler. Sourced
    /// from the same abstract-stack depth the blocks pass already proved
    /// agrees at both the fallthrough and the handler target.
    pub stack_depth: u32,
}

/// Calling-convention metadata the Call Bridge needs to bind a call's
/// positional/keyword/default/`*args`/`**kwargs` arguments into the callee's
/// register file before handing control to the Evaluator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Arity {
    /// Count of named positional-or-keyword parameters.
    pub positional: u32,
    /// Names of the `positional` parameters, in declared order — lets the
    /// Call Bridge match an incoming keyword argument to its positional
    /// slot.
    pub param_names: Vec<String>,
    /// Count of trailing parameters (counted from the end of `positional`)
    /// that have default values; their defaults live in the constant pool in
    /// the same trailing order.
    pub defaults: u32,
    /// `true` if the function accepts a trailing `*args`.
    pub has_varargs: bool,
    /// `true` if the function accepts a trailing `**kwargs`.
    pub has_varkwargs: bool,
}

impl Arity {
    /// Register index of the `*args` tuple, if present.
    pub const fn varargs_register(&self) -> Option<u32> {
        if self.has_varargs {
            Some(self.positional)
        } else {
            None
        }
    }

    /// Register index of the `**kwargs` dict, if present.
    pub const fn varkwargs_register(&self) -> Option<u32> {
        if self.has_varkwargs {
            Some(self.positional + self.has_varargs as u32)
        } else {
            None
        }
    }
}

/// A fully compiled, validated register-machine function body.
#[derive(Debug, Clone)]
pub struct RegCode {
    /// Human-readable name, for tracebacks and disassembly. Empty for
    /// anonymous bodies (lambdas, module-level code).
    pub name: String,
    /// Encoded instruction stream, decoded instruction-at-a-time by
    /// [`Instruction::decode`].
    pub instructions: Vec<u8>,
    /// Size of the register file this body needs.
    pub register_count: u32,
    /// Number of cell slots this body's own nested closures capture from it
    /// (i.e. variables of *this* frame that an inner `MAKE_CLOSURE`
    /// references). Allocated eagerly at frame entry.
    pub cell_count: u32,
    /// Number of cells *this* body itself captures from its defining frame,
    /// i.e. the arity `MAKE_CLOSURE` expects when constructing an instance
    /// of this body — consumed as the `free_var_count` stack-depth
    /// registers immediately below the closure result.
    pub free_var_count: u32,
    /// Constant pool, indexed by `LOAD_CONST`'s immediate and by
    /// `Arity::defaults`'s trailing default values.
    pub constants: Vec<Constant>,
    /// Name pool (attribute/global names), indexed by the `#imm` operand of
    /// name-bearing opcodes.
    pub names: Vec<String>,
    /// Keyword-argument name lists, indexed by `CALL_KW`/`CALL_VAR_KW`'s
    /// `#imm` operand.
    pub kwname_tables: Vec<Vec<String>>,
    /// Calling convention.
    pub arity: Arity,
    /// Source line table, sorted by `start`.
    pub lines: Vec<LineEntry>,
    /// Compiled exception-table summary (see [`ExceptionEntry`]).
    pub exception_table: Vec<ExceptionEntry>,
    /// `true` if this body contains a `YIELD_VALUE`, making it a generator
    /// function: calling it suspends a fresh frame and hands the caller a
    /// generator object instead of running it to completion.
    pub is_generator: bool,
}

impl RegCode {
    /// Look up the source line active at `offset`, or `SourceLine(0)` if no
    /// entry covers it.
    pub fn line_for_offset(&self, offset: u32) -> SourceLine {
        match self.lines.binary_search_by(|entry| {
            if offset < entry.start {
                std::cmp::Ordering::Greater
            } else if offset >= entry.end {
                std::cmp::Ordering::Less
            } else {
                std::cmp::Ordering::Equal
            }
        }) {
            Ok(index) => self.lines[index].line,
            Err(_) => SourceLine(0),
        }
    }

    /// Iterate over the decoded instruction stream as `(offset, Instruction)`
    /// pairs, in the order they appear in the byte stream (not execution
    /// order).
    pub fn disassemble(&self) -> impl Iterator<Item = (u32, Instruction)> + '_ {
        let mut offset = 0usize;
        std::iter::from_fn(move || {
            let (instr, next) = Instruction::decode(&self.instructions, offset)?;
            let at = offset as u32;
            offset = next;
            Some((at, instr))
        })
    }

    /// Check every structural invariant a well-formed `RegCode` must satisfy.
    /// Run once at the end of compilation (under `debug_assertions`) and
    /// unconditionally before the Call Bridge caches the result, since a
    /// cached body that violates one of these could corrupt every later
    /// call that hits the cache.
    pub fn validate(&self) -> CompileResult<()> {
        self.validate_registers()?;
        self.validate_jump_targets()?;
        self.validate_exception_table()?;
        Ok(())
    }

    fn validate_registers(&self) -> CompileResult<()> {
        for (_, instr) in self.disassemble() {
            for reg in [instr.rd(), instr.ra(), instr.rb()] {
                if reg as u32 >= self.register_count {
                    return Err(CompileError::RegisterOutOfBounds {
                        index: reg as u32,
                        count: self.register_count,
                    });
                }
            }
        }
        Ok(())
    }

    fn validate_jump_targets(&self) -> CompileResult<()> {
        let valid_offsets: std::collections::HashSet<u32> =
            self.disassemble().map(|(offset, _)| offset).collect();
        let len = self.instructions.len() as u32;

        let check = |target: u32| -> CompileResult<()> {
            if target != len && !valid_offsets.contains(&target) {
                return Err(CompileError::BadJumpTarget { offset: target });
            }
            Ok(())
        };

        for (offset, instr) in self.disassemble() {
            use crate::opcode::OperandShape;
            match instr.op().shape() {
                OperandShape::Jump | OperandShape::RegJump => {
                    let target = (offset as i64 + instr.encoded_len() as i64 + instr.imm() as i64) as u32;
                    check(target)?;
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn validate_exception_table(&self) -> CompileResult<()> {
        let len = self.instructions.len() as u32;
        let valid_offsets: std::collections::HashSet<u32> =
            self.disassemble().map(|(offset, _)| offset).collect();

        for entry in &self.exception_table {
            if entry.start >= entry.end || entry.end > len {
                return Err(CompileError::BadExceptionEntry {
                    start: entry.start,
                    end: entry.end,
                    handler: entry.handler,
                });
            }
            if !valid_offsets.contains(&entry.handler) {
                return Err(CompileError::BadExceptionEntry {
                    start: entry.start,
                    end: entry.end,
                    handler: entry.handler,
                });
            }
            if entry.stack_depth > u16::MAX as u32 {
                // BlockEntry::stack_depth stores this as u16 at runtime; a
                // wider value here could never be restored faithfully.
                return Err(CompileError::BadExceptionEntry {
                    start: entry.start,
                    end: entry.end,
                    handler: entry.handler,
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::opcode::Opcode;

    fn empty_body(instructions: Vec<u8>, register_count: u32) -> RegCode {
        RegCode {
            name: "test".into(),
            instructions,
            register_count,
            cell_count: 0,
            free_var_count: 0,
            constants: Vec::new(),
            names: Vec::new(),
            kwname_tables: Vec::new(),
            arity: Arity {
                positional: 0,
                param_names: Vec::new(),
                defaults: 0,
                has_varargs: false,
                has_varkwargs: false,
            },
            lines: Vec::new(),
            exception_table: Vec::new(),
            is_generator: false,
        }
    }

    #[test]
    fn rejects_out_of_bounds_register() {
        let mut bytes = Vec::new();
        Instruction::reg3(Opcode::Add, 5, 0, 1).encode(&mut bytes);
        let code = empty_body(bytes, 2);
        assert!(matches!(
            code.validate(),
            Err(CompileError::RegisterOutOfBounds { index: 5, count: 2 })
        ));
    }

    #[test]
    fn accepts_well_formed_body() {
        let mut bytes = Vec::new();
        Instruction::reg3(Opcode::Add, 0, 0, 1).encode(&mut bytes);
        Instruction::reg1(Opcode::Return, 0).encode(&mut bytes);
        let code = empty_body(bytes, 2);
        assert!(code.validate().is_ok());
    }

    #[test]
    fn rejects_misaligned_jump_target() {
        let mut bytes = Vec::new();
        Instruction::jump(Opcode::Jump, 1).encode(&mut bytes);
        let code = empty_body(bytes, 0);
        assert!(matches!(code.validate(), Err(CompileError::BadJumpTarget { .. })));
    }
}
