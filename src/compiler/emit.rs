//! Stage 6: encode a [`LoweredBody`] to bytes, fix up jump offsets, and
//! assemble the final [`RegCode`].
//!
//! Every opcode's encoded length is fixed by its shape regardless of operand
//! values, so this runs in two passes: first compute each instruction's byte
//! offset by walking the (now final) instruction list once, then rewrite
//! every jump-bearing instruction's placeholder target — a `StackOp` index,
//! stamped in by [`super::lower`] — into a real offset relative to the byte
//! just past the jump instruction itself.

use crate::error::{CompileError, CompileResult};
use crate::frame::SourceLine;
use crate::opcode::{Instruction, OperandShape};
use crate::regcode::{Constant, ExceptionEntry, LineEntry, RegCode};
use crate::stackcode::{StackCode, StackConstant};

use super::lower::LoweredBody;
use super::OptimizeOptions;

/// Assemble `lowered` (produced from `code`) into a validated [`RegCode`].
/// Nested code constants are compiled with the same `opts` as their parent.
pub fn assemble(code: &StackCode, lowered: LoweredBody, opts: OptimizeOptions) -> CompileResult<RegCode> {
    let LoweredBody {
        mut instructions,
        stackop_to_instr,
        register_count,
        mut constants,
        exception_depths,
    } = lowered;

    // Byte offset of every instruction, using each instruction's *final*
    // shape (optimization may have swapped an instruction for a
    // differently-shaped one, e.g. folding ADD into LOAD_CONST).
    let mut offsets = Vec::with_capacity(instructions.len() + 1);
    let mut cursor = 0u32;
    for instr in &instructions {
        offsets.push(cursor);
        cursor += instr.encoded_len() as u32;
    }
    offsets.push(cursor);
    let total_len = cursor;

    // Map each source StackOp index to the byte offset its first lowered
    // instruction landed at, for resolving jump targets.
    let stackop_byte_offset = |stackop_index: usize| -> u32 {
        let instr_index = stackop_to_instr[stackop_index];
        offsets[instr_index]
    };

    let mut exception_table = Vec::new();
    let depth_by_instr: std::collections::HashMap<usize, u32> = exception_depths
        .into_iter()
        .map(|(stackop_index, depth)| (stackop_to_instr[stackop_index], depth))
        .collect();

    for (i, instr) in instructions.iter_mut().enumerate() {
        let shape = instr.op().shape();
        if !matches!(shape, OperandShape::Jump | OperandShape::RegJump | OperandShape::Reg2Jump) {
            continue;
        }
        let target_stackop = instr.imm() as usize;
        if target_stackop > code.instructions.len() {
            return Err(CompileError::BadJumpTarget {
                offset: target_stackop as u32,
            });
        }
        let target_byte = stackop_byte_offset(target_stackop);
        let this_offset = offsets[i];
        let after_this = this_offset + instr.encoded_len() as u32;
        let relative = target_byte as i64 - after_this as i64;

        if matches!(instr.op(), crate::opcode::Opcode::SetupExcept | crate::opcode::Opcode::SetupFinally) {
            let stack_depth = depth_by_instr.get(&i).copied().unwrap_or(0);
            exception_table.push(ExceptionEntry {
                start: after_this,
                end: target_byte,
                handler: target_byte,
                stack_depth,
            });
        }

        *instr = match shape {
            OperandShape::Jump => Instruction::jump(instr.op(), relative as i32),
            OperandShape::RegJump => Instruction::reg_jump(instr.op(), instr.rd(), relative as i32),
            OperandShape::Reg2Jump => Instruction::reg2_jump(instr.op(), instr.rd(), instr.ra(), relative as i32),
            _ => unreachable!(),
        };
    }

    let mut bytes = Vec::with_capacity(total_len as usize);
    for instr in &instructions {
        instr.encode(&mut bytes);
    }

    for (idx, c) in code.constants.iter().enumerate() {
        if let StackConstant::Code(nested) = c {
            let nested_regcode = super::compile(nested, opts)?;
            constants[idx] = Constant::Code(nested_regcode);
        }
    }

    let lines = build_line_table(code, &stackop_to_instr, &offsets);
    let is_generator = instructions.iter().any(|i| i.op() == crate::opcode::Opcode::YieldValue);

    Ok(RegCode {
        name: code.name.clone(),
        instructions: bytes,
        register_count,
        cell_count: code.cell_count,
        free_var_count: code.free_var_count,
        constants,
        names: code.names.clone(),
        kwname_tables: code.kwname_tables.clone(),
        arity: code.arity.clone(),
        lines,
        exception_table,
        is_generator,
    })
}

/// Merge consecutive instructions sharing the same source line into
/// [`LineEntry`] ranges. `stackop_to_instr[i]..stackop_to_instr[i+1]` are the
/// (possibly several, possibly zero) instructions `code.instructions[i]`
/// lowered to; every one of them inherits `code.lines[i]`.
fn build_line_table(code: &StackCode, stackop_to_instr: &[usize], offsets: &[u32]) -> Vec<LineEntry> {
    let mut lines = Vec::new();
    let mut current: Option<(u32, SourceLine)> = None;

    for (i, line) in code.lines.iter().enumerate() {
        let instr_start = stackop_to_instr[i];
        let instr_end = stackop_to_instr[i + 1];
        if instr_start == instr_end {
            // This StackOp lowered to nothing (e.g. POP_TOP) — it doesn't
            // own any bytes, so it can't start or extend a line range.
            continue;
        }
        let byte_start = offsets[instr_start];

        match current {
            Some((_, current_line)) if current_line == *line => {}
            Some((start, current_line)) => {
                lines.push(LineEntry {
                    start,
                    end: byte_start,
                    line: current_line,
                });
                current = Some((byte_start, *line));
            }
            None => current = Some((byte_start, *line)),
        }
    }

    if let Some((start, line)) = current {
        lines.push(LineEntry {
            start,
            end: offsets[offsets.len() - 1],
            line,
        });
    }

    lines
}
