//! Stage 1: validate a raw [`StackCode`] body before the rest of the
//! pipeline trusts its indices.

use crate::error::{CompileError, CompileResult};
use crate::stackcode::{StackCode, StackOp};

/// Check every index a [`StackOp`] carries (constant pool, name pool, local
/// slot, jump target) against the bounds of the body that owns it.
pub fn validate(code: &StackCode) -> CompileResult<()> {
    let len = code.instructions.len() as u32;

    let check_jump = |target: u32| -> CompileResult<()> {
        if target > len {
            return Err(CompileError::MalformedCodeObject(format!(
                "jump target {target} past end of body (len {len})"
            )));
        }
        Ok(())
    };
    let check_const = |idx: u32| -> CompileResult<()> {
        if idx as usize >= code.constants.len() {
            return Err(CompileError::MalformedCodeObject(format!(
                "constant index {idx} out of bounds ({} constants)",
                code.constants.len()
            )));
        }
        Ok(())
    };
    let check_name = |idx: u32| -> CompileResult<()> {
        if idx as usize >= code.names.len() {
            return Err(CompileError::MalformedCodeObject(format!(
                "name index {idx} out of bounds ({} names)",
                code.names.len()
            )));
        }
        Ok(())
    };
    let check_local = |idx: u32| -> CompileResult<()> {
        if idx >= code.local_count {
            return Err(CompileError::MalformedCodeObject(format!(
                "local slot {idx} out of bounds ({} locals)",
                code.local_count
            )));
        }
        Ok(())
    };
    let check_cell = |idx: u32| -> CompileResult<()> {
        if idx >= code.cell_count {
            return Err(CompileError::MalformedCodeObject(format!(
                "cell slot {idx} out of bounds ({} cells)",
                code.cell_count
            )));
        }
        Ok(())
    };
    let check_kwnames = |idx: u32| -> CompileResult<()> {
        if idx as usize >= code.kwname_tables.len() {
            return Err(CompileError::MalformedCodeObject(format!(
                "kwnames index {idx} out of bounds ({} kwname tables)",
                code.kwname_tables.len()
            )));
        }
        Ok(())
    };

    if code.lines.len() != code.instructions.len() {
        return Err(CompileError::MalformedCodeObject(format!(
            "line table length {} does not match instruction count {}",
            code.lines.len(),
            code.instructions.len()
        )));
    }

    for op in &code.instructions {
        match op {
            StackOp::LoadConst(idx) => check_const(*idx)?,
            StackOp::LoadFast(idx) | StackOp::StoreFast(idx) => check_local(*idx)?,
            StackOp::LoadGlobal(idx) | StackOp::StoreGlobal(idx) => check_name(*idx)?,
            StackOp::LoadDeref(idx) | StackOp::StoreDeref(idx) => check_cell(*idx)?,
            StackOp::LoadAttr(idx) | StackOp::StoreAttr(idx) => check_name(*idx)?,
            StackOp::ForIter(target)
            | StackOp::JumpAbsolute(target)
            | StackOp::PopJumpIfFalse(target)
            | StackOp::PopJumpIfTrue(target)
            | StackOp::SetupLoop(target)
            | StackOp::SetupExcept(target)
            | StackOp::SetupFinally(target)
            | StackOp::SetupWith(target)
            | StackOp::ContinueLoop(target) => check_jump(*target)?,
            StackOp::MakeClosure { code_const_idx, captures } => {
                check_const(*code_const_idx)?;
                for cell in captures {
                    check_cell(*cell)?;
                }
            }
            StackOp::BinaryOp(name) | StackOp::InplaceOp(name) => {
                if !is_known_operator(name) {
                    return Err(CompileError::MalformedCodeObject(format!("unknown operator {name:?}")));
                }
            }
            StackOp::ExcMatch(idx) => check_name(*idx)?,
            StackOp::CallFunctionKw { kwnames_idx, .. } | StackOp::CallFunctionVarKw { kwnames_idx, .. } => {
                check_kwnames(*kwnames_idx)?
            }
            StackOp::DupTop
            | StackOp::PopTop
            | StackOp::RotTwo
            | StackOp::PopShadow
            | StackOp::UnaryNegate
            | StackOp::UnaryNot
            | StackOp::BinarySubscr
            | StackOp::StoreSubscr
            | StackOp::DeleteSubscr
            | StackOp::BuildSequence(_)
            | StackOp::BuildMapping(_)
            | StackOp::UnpackSequence(_)
            | StackOp::GetIter
            | StackOp::PopBlock
            | StackOp::BreakLoop
            | StackOp::RaiseVarargs
            | StackOp::EndExcept
            | StackOp::CallFunction(_)
            | StackOp::CallFunctionVar(_)
            | StackOp::YieldValue
            | StackOp::ReturnValue
            | StackOp::Nop => {}
        }
    }

    Ok(())
}

const KNOWN_OPERATORS: &[&str] = &[
    "+", "-", "*", "/", "//", "%", "**", "&", "|", "^", "<<", ">>", "<", "<=", ">", ">=", "==", "!=", "in", "is",
    "is not", "not in",
];

fn is_known_operator(name: &str) -> bool {
    KNOWN_OPERATORS.contains(&name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::SourceLine;
    use crate::regcode::Arity;

    fn code_with(instructions: Vec<StackOp>) -> StackCode {
        let lines = vec![SourceLine(1); instructions.len()];
        StackCode {
            name: "test".into(),
            instructions,
            constants: Vec::new(),
            names: Vec::new(),
            kwname_tables: Vec::new(),
            local_count: 0,
            cell_count: 0,
            free_var_count: 0,
            arity: Arity {
                positional: 0,
                param_names: Vec::new(),
                defaults: 0,
                has_varargs: false,
                has_varkwargs: false,
            },
            lines,
        }
    }

    #[test]
    fn rejects_out_of_bounds_const() {
        let code = code_with(vec![StackOp::LoadConst(0)]);
        assert!(validate(&code).is_err());
    }

    #[test]
    fn accepts_empty_body() {
        let code = code_with(vec![]);
        assert!(validate(&code).is_ok());
    }

    #[test]
    fn rejects_unknown_operator() {
        let code = code_with(vec![StackOp::BinaryOp("~~")]);
        assert!(validate(&code).is_err());
    }
}
