//! Stage 2: abstract stack simulation.
//!
//! Host bytecode is structured (it came from a real compiler, not hand-
//! assembled), so a single forward pass suffices: walk the body once,
//! track the current depth, and record the depth expected at every jump
//! target. When a later instruction disagrees with a depth an earlier
//! instruction already recorded for the same target, that's a malformed
//! body — the two predecessors can't agree on a canonical depth-to-register
//! mapping for the join point.

use crate::error::{CompileError, CompileResult};
use crate::stackcode::{StackCode, StackOp};

/// One active `Setup*` entry while the forward pass walks the body,
/// structurally nested the same way the block stack is at runtime.
struct PendingBlock {
    is_loop: bool,
    target: u32,
}

/// Per-instruction depth table produced by the forward pass, plus the
/// largest depth seen (used to size the register file).
pub struct DepthTable {
    /// Stack depth in effect *before* each instruction executes. Indexed by
    /// instruction position.
    pub depth_before: Vec<u32>,
    /// Largest depth reached anywhere in the body.
    pub max_depth: u32,
}

/// Run the forward depth simulation over `code`, validating that every join
/// point agrees on a single depth.
pub fn analyze_depths(code: &StackCode) -> CompileResult<DepthTable> {
    let len = code.instructions.len();
    let mut expected: Vec<Option<u32>> = vec![None; len + 1];
    expected[0] = Some(0);

    let mut max_depth = 0u32;
    let mut pending: Vec<PendingBlock> = Vec::new();

    let mut record = |expected: &mut Vec<Option<u32>>, at: u32, depth: u32, from: usize| -> CompileResult<()> {
        match expected.get(at as usize).copied().flatten() {
            Some(existing) if existing != depth => Err(CompileError::UnresolvedStackSlot {
                depth,
                block: from as u32,
            }),
            _ => {
                expected[at as usize] = Some(depth);
                Ok(())
            }
        }
    };

    for (i, op) in code.instructions.iter().enumerate() {
        let depth = expected[i].unwrap_or(0);
        max_depth = max_depth.max(depth);

        let fallthrough = i as u32 + 1;
        match op {
            StackOp::LoadConst(_)
            | StackOp::LoadFast(_)
            | StackOp::LoadGlobal(_)
            | StackOp::LoadDeref(_)
            | StackOp::DupTop => {
                record(&mut expected, fallthrough, depth + 1, i)?;
            }
            StackOp::StoreFast(_) | StackOp::StoreGlobal(_) | StackOp::StoreDeref(_) | StackOp::PopTop => {
                record(&mut expected, fallthrough, depth.saturating_sub(1), i)?;
            }
            StackOp::RotTwo
            | StackOp::UnaryNegate
            | StackOp::UnaryNot
            | StackOp::LoadAttr(_)
            | StackOp::GetIter
            | StackOp::Nop
            | StackOp::PopBlock
            | StackOp::EndExcept
            | StackOp::ExcMatch(_) => {
                record(&mut expected, fallthrough, depth, i)?;
            }
            StackOp::PopShadow => {
                record(&mut expected, fallthrough, depth + 1, i)?;
            }
            StackOp::BinaryOp(_) | StackOp::InplaceOp(_) | StackOp::BinarySubscr => {
                record(&mut expected, fallthrough, depth.saturating_sub(1), i)?;
            }
            StackOp::StoreSubscr => {
                record(&mut expected, fallthrough, depth.saturating_sub(3), i)?;
            }
            StackOp::DeleteSubscr | StackOp::StoreAttr(_) => {
                record(&mut expected, fallthrough, depth.saturating_sub(2), i)?;
            }
            StackOp::BuildSequence(n) => {
                record(&mut expected, fallthrough, depth.saturating_sub(*n) + 1, i)?;
            }
            StackOp::BuildMapping(n) => {
                record(&mut expected, fallthrough, depth.saturating_sub(2 * n) + 1, i)?;
            }
            StackOp::UnpackSequence(n) => {
                record(&mut expected, fallthrough, depth.saturating_sub(1) + n, i)?;
            }
            StackOp::ForIter(target) => {
                record(&mut expected, fallthrough, depth + 1, i)?;
                record(&mut expected, *target, depth.saturating_sub(1), i)?;
            }
            StackOp::JumpAbsolute(target) => {
                record(&mut expected, *target, depth, i)?;
            }
            StackOp::PopJumpIfFalse(target) | StackOp::PopJumpIfTrue(target) => {
                let after = depth.saturating_sub(1);
                record(&mut expected, fallthrough, after, i)?;
                record(&mut expected, *target, after, i)?;
            }
            StackOp::SetupLoop(target) => {
                record(&mut expected, fallthrough, depth, i)?;
                record(&mut expected, *target, depth, i)?;
                pending.push(PendingBlock {
                    is_loop: true,
                    target: *target,
                });
            }
            StackOp::SetupExcept(target) | StackOp::SetupFinally(target) => {
                record(&mut expected, fallthrough, depth, i)?;
                record(&mut expected, *target, depth, i)?;
                pending.push(PendingBlock {
                    is_loop: false,
                    target: *target,
                });
            }
            StackOp::SetupWith(target) => {
                let after = depth.saturating_sub(1);
                record(&mut expected, fallthrough, after, i)?;
                record(&mut expected, *target, after, i)?;
                pending.push(PendingBlock {
                    is_loop: false,
                    target: *target,
                });
            }
            StackOp::ContinueLoop(target) => {
                record(&mut expected, *target, depth, i)?;
            }
            StackOp::BreakLoop => {
                let loop_target = pending
                    .iter()
                    .rev()
                    .find(|b| b.is_loop)
                    .map(|b| b.target)
                    .ok_or_else(|| CompileError::MalformedCodeObject("BREAK_LOOP outside a loop".into()))?;
                record(&mut expected, loop_target, depth, i)?;
            }
            StackOp::RaiseVarargs | StackOp::ReturnValue => {
                // No static successor: control leaves this body (or unwinds
                // to whatever handler the runtime block stack finds).
            }
            StackOp::CallFunction(n) => {
                record(&mut expected, fallthrough, depth.saturating_sub(n + 1) + 1, i)?;
            }
            StackOp::CallFunctionKw { n_positional, kwnames_idx } => {
                let kwc = code.kwname_tables[*kwnames_idx as usize].len() as u32;
                record(&mut expected, fallthrough, depth.saturating_sub(n_positional + kwc + 1) + 1, i)?;
            }
            StackOp::CallFunctionVar(n_positional) => {
                record(&mut expected, fallthrough, depth.saturating_sub(n_positional + 1 + 1) + 1, i)?;
            }
            StackOp::CallFunctionVarKw { n_positional, kwnames_idx } => {
                let kwc = code.kwname_tables[*kwnames_idx as usize].len() as u32;
                record(&mut expected, fallthrough, depth.saturating_sub(n_positional + kwc + 2 + 1) + 1, i)?;
            }
            StackOp::MakeClosure { captures, .. } => {
                record(
                    &mut expected,
                    fallthrough,
                    depth.saturating_sub(captures.len() as u32) + 1,
                    i,
                )?;
            }
            StackOp::YieldValue => {
                record(&mut expected, fallthrough, depth.saturating_sub(1), i)?;
            }
        }

        if matches!(op, StackOp::PopBlock) {
            pending.pop();
        }
    }

    let depth_before = expected[..len]
        .iter()
        .enumerate()
        .map(|(i, d)| d.unwrap_or_else(|| {
            tracing::trace!(index = i, "unreachable instruction, defaulting depth to 0");
            0
        }))
        .collect();

    Ok(DepthTable { depth_before, max_depth })
}
