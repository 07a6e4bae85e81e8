//! Stages 3–4: lower stack bytecode into register-machine instructions
//! under the depth table [`blocks::analyze_depths`](super::blocks::analyze_depths)
//! already validated.
//!
//! Stack slot at depth `d` is always register `local_count + d` — the
//! "canonical depth-to-register mapping" that makes every join point
//! automatically consistent, since [`blocks::analyze_depths`] already
//! proved every predecessor agrees on `d` there.

use crate::error::{CompileError, CompileResult};
use crate::opcode::{Instruction, Opcode, Reg};
use crate::regcode::Constant;
use crate::stackcode::{StackCode, StackConstant, StackOp};

use super::blocks::DepthTable;

/// Lowered, not-yet-encoded instruction list plus the metadata `emit`
/// needs to finish the job: the register file size, and a map from each
/// source `StackOp` index to the first [`Instruction`] it produced (jump
/// targets in the source always name a `StackOp` index, and must be
/// retargeted to that instruction's eventual byte offset).
pub struct LoweredBody {
    /// One or more instructions per source `StackOp`, in source order.
    pub instructions: Vec<Instruction>,
    /// `stackop_index -> first instruction index` this stack op lowered to.
    /// Has `code.instructions.len() + 1` entries; the last entry is the
    /// lowered body's own length, for jump targets at the function's end.
    pub stackop_to_instr: Vec<usize>,
    /// Size of the register file this body needs (locals plus the deepest
    /// stack usage observed).
    pub register_count: u32,
    /// Constants this body materialized, in [`Constant`] form, append-only
    /// so earlier `LOAD_CONST` indices stay valid after later stages append
    /// folded constants.
    pub constants: Vec<Constant>,
    /// `(stackop_index, stack_depth)` for every `SetupExcept`/`SetupFinally`
    /// op, in source order. `emit::assemble` consumes this, paired up with
    /// the jump-fixup pass that already resolves that same op's handler
    /// target, to fill in `ExceptionEntry::stack_depth`.
    pub exception_depths: Vec<(usize, u32)>,
}

fn reg_at(local_count: u32, depth: u32) -> Reg {
    (local_count + depth) as Reg
}

fn binary_opcode(name: &str) -> Opcode {
    match name {
        "+" => Opcode::Add,
        "-" => Opcode::Sub,
        "*" => Opcode::Mul,
        "/" => Opcode::Div,
        "//" => Opcode::FloorDiv,
        "%" => Opcode::Mod,
        "**" => Opcode::Pow,
        "&" => Opcode::BitAnd,
        "|" => Opcode::BitOr,
        "^" => Opcode::BitXor,
        "<<" => Opcode::LShift,
        ">>" => Opcode::RShift,
        "<" => Opcode::CmpLt,
        "<=" => Opcode::CmpLe,
        ">" => Opcode::CmpGt,
        ">=" => Opcode::CmpGe,
        "==" => Opcode::CmpEq,
        "!=" => Opcode::CmpNe,
        "in" => Opcode::Contains,
        "is" => Opcode::CmpIs,
        "is not" => Opcode::CmpIsNot,
        "not in" => Opcode::NotIn,
        other => unreachable!("unknown operator {other:?} should have been rejected by stackops::validate"),
    }
}

const INPLACE_OPERATORS: &[&str] = &["+", "-", "*", "/", "//", "%", "**", "&", "|", "^", "<<", ">>"];

fn inplace_tag(name: &str) -> i32 {
    INPLACE_OPERATORS
        .iter()
        .position(|candidate| *candidate == name)
        .expect("unknown in-place operator should have been rejected by stackops::validate") as i32
}

/// Decode an [`InplaceOp`](StackOp::InplaceOp) tag back to its operator, for
/// the Evaluator.
pub fn inplace_operator(tag: i32) -> &'static str {
    INPLACE_OPERATORS[tag as usize]
}

fn lower_constant(c: &StackConstant) -> Constant {
    match c {
        StackConstant::None => Constant::None,
        StackConstant::Bool(b) => Constant::Bool(*b),
        StackConstant::Int(i) => Constant::Int(*i),
        StackConstant::BigInt(b) => Constant::BigInt(b.clone()),
        StackConstant::Float(f) => Constant::Float(*f),
        StackConstant::Str(s) => Constant::Str(s.clone()),
        StackConstant::Code(_) => {
            // Nested code objects are compiled eagerly, as part of compiling
            // their parent, the same way a host compiler nests already-
            // compiled code objects in its own constant pool; see
            // `compiler::emit::assemble`'s handling of `StackConstant::Code`.
            unreachable!("nested code constants are lowered in emit::assemble, not here")
        }
    }
}

/// Run stage 3–4 over `code` using the already-validated `depths` table.
pub fn lower(code: &StackCode, depths: &DepthTable) -> CompileResult<LoweredBody> {
    let local_count = code.local_count;
    let mut out = Vec::with_capacity(code.instructions.len());
    let mut stackop_to_instr = Vec::with_capacity(code.instructions.len() + 1);
    let mut constants: Vec<Constant> = code.constants.iter().map(lower_constant).collect();
    let mut exception_depths: Vec<(usize, u32)> = Vec::new();
    // Preserve a slot for every nested code constant too, filled in by
    // `emit::assemble` once it has compiled them; reserve `None` here so
    // indices line up with `code.constants`.
    for (idx, c) in code.constants.iter().enumerate() {
        if matches!(c, StackConstant::Code(_)) {
            constants[idx] = Constant::None;
        }
    }

    for (i, op) in code.instructions.iter().enumerate() {
        stackop_to_instr.push(out.len());
        let d = depths.depth_before[i];

        match op {
            StackOp::LoadConst(idx) => out.push(Instruction::reg1_imm(Opcode::LoadConst, reg_at(local_count, d), *idx as i32)),
            StackOp::LoadFast(idx) => out.push(Instruction::reg1_imm(Opcode::LoadFast, reg_at(local_count, d), *idx as i32)),
            StackOp::StoreFast(idx) => {
                out.push(Instruction::reg1_imm(Opcode::StoreFast, reg_at(local_count, d - 1), *idx as i32))
            }
            StackOp::LoadGlobal(idx) => {
                out.push(Instruction::reg1_imm(Opcode::LoadGlobal, reg_at(local_count, d), *idx as i32))
            }
            StackOp::StoreGlobal(idx) => {
                out.push(Instruction::reg1_imm(Opcode::StoreGlobal, reg_at(local_count, d - 1), *idx as i32))
            }
            StackOp::LoadDeref(idx) => {
                out.push(Instruction::reg1_imm(Opcode::LoadDeref, reg_at(local_count, d), *idx as i32))
            }
            StackOp::StoreDeref(idx) => {
                out.push(Instruction::reg1_imm(Opcode::StoreDeref, reg_at(local_count, d - 1), *idx as i32))
            }
            StackOp::DupTop => {
                let src = reg_at(local_count, d - 1);
                let dst = reg_at(local_count, d);
                out.push(Instruction::reg2(Opcode::Move, dst, src));
            }
            StackOp::PopTop => {
                // No instruction: the slot simply stops being addressed.
                // Its handle is released the next time something writes
                // this register (every register write decrefs the value it
                // overwrites first).
            }
            StackOp::RotTwo => {
                let top = reg_at(local_count, d - 1);
                let second = reg_at(local_count, d - 2);
                out.push(Instruction::reg2(Opcode::Swap, top, second));
            }
            StackOp::PopShadow => {
                let dst = reg_at(local_count, d);
                out.push(Instruction::reg1(Opcode::PopShadow, dst));
            }
            StackOp::BinaryOp(name) => {
                let a = reg_at(local_count, d - 2);
                let b = reg_at(local_count, d - 1);
                // CONTAINS/NOT_IN read `rd <- rb in/not in ra` (element rb,
                // container ra), the reverse of every other binary op's
                // `rd <- ra OP rb`, so `a in b`/`a not in b` need the
                // container in `ra` and the element in `rb`.
                if *name == "in" || *name == "not in" {
                    out.push(Instruction::reg3(binary_opcode(name), a, b, a));
                } else {
                    out.push(Instruction::reg3(binary_opcode(name), a, a, b));
                }
            }
            StackOp::InplaceOp(name) => {
                let a = reg_at(local_count, d - 2);
                let b = reg_at(local_count, d - 1);
                out.push(Instruction::reg2_imm(Opcode::InplaceOp, a, b, inplace_tag(name)));
            }
            StackOp::UnaryNegate => {
                let a = reg_at(local_count, d - 1);
                out.push(Instruction::reg2(Opcode::Neg, a, a));
            }
            StackOp::UnaryNot => {
                let a = reg_at(local_count, d - 1);
                out.push(Instruction::reg2(Opcode::Not, a, a));
            }
            StackOp::BinarySubscr => {
                let obj = reg_at(local_count, d - 2);
                let key = reg_at(local_count, d - 1);
                out.push(Instruction::reg3(Opcode::GetItem, obj, obj, key));
            }
            StackOp::StoreSubscr => {
                let obj = reg_at(local_count, d - 3);
                let key = reg_at(local_count, d - 2);
                let value = reg_at(local_count, d - 1);
                out.push(Instruction::reg3(Opcode::SetItem, obj, key, value));
            }
            StackOp::DeleteSubscr => {
                let obj = reg_at(local_count, d - 2);
                let key = reg_at(local_count, d - 1);
                out.push(Instruction::reg2(Opcode::DelItem, obj, key));
            }
            StackOp::LoadAttr(idx) => {
                let obj = reg_at(local_count, d - 1);
                out.push(Instruction::reg2_imm(Opcode::GetAttr, obj, obj, *idx as i32));
            }
            StackOp::StoreAttr(idx) => {
                let obj = reg_at(local_count, d - 2);
                let value = reg_at(local_count, d - 1);
                out.push(Instruction::reg2_imm(Opcode::SetAttr, obj, value, *idx as i32));
            }
            StackOp::BuildSequence(n) => {
                let base = reg_at(local_count, d - n);
                out.push(Instruction::reg1_imm(Opcode::BuildSequence, base, *n as i32));
            }
            StackOp::BuildMapping(n) => {
                let base = reg_at(local_count, d - 2 * n);
                out.push(Instruction::reg1_imm(Opcode::BuildMapping, base, *n as i32));
            }
            StackOp::UnpackSequence(n) => {
                let seq = reg_at(local_count, d - 1);
                let dest_base = reg_at(local_count, d - 1);
                out.push(Instruction::reg2_imm(Opcode::UnpackSequence, seq, dest_base, *n as i32));
            }
            StackOp::GetIter => {
                let obj = reg_at(local_count, d - 1);
                out.push(Instruction::reg2(Opcode::GetIter, obj, obj));
            }
            StackOp::ForIter(target) => {
                let iterator = reg_at(local_count, d - 1);
                let value = reg_at(local_count, d);
                out.push(Instruction::reg2_jump(Opcode::ForIter, value, iterator, *target as i32));
            }
            StackOp::JumpAbsolute(target) => out.push(Instruction::jump(Opcode::Jump, *target as i32)),
            StackOp::PopJumpIfFalse(target) => {
                let test = reg_at(local_count, d - 1);
                out.push(Instruction::reg_jump(Opcode::JumpIfFalse, test, *target as i32));
            }
            StackOp::PopJumpIfTrue(target) => {
                let test = reg_at(local_count, d - 1);
                out.push(Instruction::reg_jump(Opcode::JumpIfTrue, test, *target as i32));
            }
            StackOp::SetupLoop(target) => out.push(Instruction::jump(Opcode::SetupLoop, *target as i32)),
            StackOp::SetupExcept(target) => {
                exception_depths.push((i, d));
                out.push(Instruction::jump(Opcode::SetupExcept, *target as i32));
            }
            StackOp::SetupFinally(target) => {
                exception_depths.push((i, d));
                out.push(Instruction::jump(Opcode::SetupFinally, *target as i32));
            }
            StackOp::SetupWith(target) => {
                let manager = reg_at(local_count, d - 1);
                out.push(Instruction::reg_jump(Opcode::SetupWith, manager, *target as i32));
            }
            StackOp::PopBlock => out.push(Instruction::nop(Opcode::PopBlock)),
            StackOp::BreakLoop => out.push(Instruction::nop(Opcode::BreakLoop)),
            StackOp::ContinueLoop(target) => out.push(Instruction::jump(Opcode::ContinueLoop, *target as i32)),
            StackOp::RaiseVarargs => {
                if d == 0 {
                    // Re-raise: no exception value on the abstract stack at
                    // all, so materialize `none` in a scratch register above
                    // the deepest slot this body ever uses and raise that —
                    // RAISE treats a `none` operand as "re-raise the pending
                    // exception".
                    let scratch = reg_at(local_count, depths.max_depth);
                    out.push(Instruction::reg1(Opcode::LoadNone, scratch));
                    out.push(Instruction::reg1(Opcode::Raise, scratch));
                } else {
                    let exc = reg_at(local_count, d - 1);
                    out.push(Instruction::reg1(Opcode::Raise, exc));
                }
            }
            StackOp::EndExcept => out.push(Instruction::nop(Opcode::EndExcept)),
            StackOp::ExcMatch(idx) => {
                let reg = reg_at(local_count, d - 1);
                out.push(Instruction::reg2_imm(Opcode::ExcMatch, reg, reg, *idx as i32));
            }
            StackOp::CallFunction(n) => {
                let callable = reg_at(local_count, d - n - 1);
                out.push(Instruction::reg1_imm(Opcode::Call, callable, *n as i32));
            }
            StackOp::CallFunctionKw { n_positional, kwnames_idx } => {
                let kwc = code.kwname_tables[*kwnames_idx as usize].len() as u32;
                let callable = reg_at(local_count, d - n_positional - kwc - 1);
                out.push(Instruction::reg2_imm(
                    Opcode::CallKw,
                    callable,
                    *n_positional as Reg,
                    *kwnames_idx as i32,
                ));
            }
            StackOp::CallFunctionVar(n_positional) => {
                let callable = reg_at(local_count, d - n_positional - 1 - 1);
                out.push(Instruction::reg1_imm(Opcode::CallVar, callable, *n_positional as i32));
            }
            StackOp::CallFunctionVarKw { n_positional, kwnames_idx } => {
                let kwc = code.kwname_tables[*kwnames_idx as usize].len() as u32;
                let callable = reg_at(local_count, d - n_positional - kwc - 2 - 1);
                out.push(Instruction::reg2_imm(
                    Opcode::CallVarKw,
                    callable,
                    *n_positional as Reg,
                    *kwnames_idx as i32,
                ));
            }
            StackOp::MakeClosure { code_const_idx, captures } => {
                let start_depth = d - captures.len() as u32;
                for (offset, cell_idx) in captures.iter().enumerate() {
                    let dst = reg_at(local_count, start_depth + offset as u32);
                    out.push(Instruction::reg1_imm(Opcode::LoadDeref, dst, *cell_idx as i32));
                }
                let dst = reg_at(local_count, start_depth);
                out.push(Instruction::reg1_imm(Opcode::MakeClosure, dst, *code_const_idx as i32));
            }
            StackOp::YieldValue => {
                let value = reg_at(local_count, d - 1);
                out.push(Instruction::reg1(Opcode::YieldValue, value));
            }
            StackOp::ReturnValue => {
                let value = reg_at(local_count, d.saturating_sub(1));
                out.push(Instruction::reg1(Opcode::Return, value));
            }
            StackOp::Nop => out.push(Instruction::nop(Opcode::Nop)),
        }
    }
    stackop_to_instr.push(out.len());

    let register_count = local_count + depths.max_depth + 1;
    if register_count as usize > Reg::MAX as usize {
        return Err(CompileError::MalformedCodeObject(format!(
            "register file size {register_count} exceeds the {}-register addressing limit",
            Reg::MAX
        )));
    }

    Ok(LoweredBody {
        instructions: out,
        stackop_to_instr,
        register_count,
        constants,
        exception_depths,
    })
}
