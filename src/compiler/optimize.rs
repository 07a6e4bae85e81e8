//! Stage 5: peephole and dataflow passes over a [`LoweredBody`], each run to
//! a fixed point. Every pass is conservative: when in doubt it leaves the
//! instruction alone rather than risk changing behavior.

use crate::opcode::{Instruction, Opcode, Reg};
use crate::regcode::Constant;

use super::lower::LoweredBody;
use super::OptimizeOptions;

/// Run every enabled pass in `opts` until none of them change anything, or
/// `MAX_ROUNDS` is hit (a body that hasn't converged by then almost
/// certainly won't; this is a safety valve, not an expected exit).
const MAX_ROUNDS: u32 = 16;

pub fn run_to_fixed_point(body: &mut LoweredBody, opts: OptimizeOptions) {
    for round in 0..MAX_ROUNDS {
        let mut changed = false;
        if opts.constant_folding {
            changed |= constant_folding::run(body);
        }
        if opts.copy_propagation {
            changed |= copy_propagation::run(body);
        }
        if opts.dead_store_elimination {
            changed |= dead_store_elimination::run(body);
        }
        if opts.peephole {
            changed |= peephole::run(body);
        }
        if opts.block_coalescing {
            changed |= block_coalescing::run(body);
        }
        if !changed {
            tracing::trace!(round, "optimizer reached a fixed point");
            break;
        }
    }
}

/// Opcodes whose `rd` write has no observable side effect beyond the value
/// landing in the register (no refcount surprises, no control transfer) —
/// the set copy propagation and dead store elimination are allowed to touch.
fn writes_only_rd(op: Opcode) -> bool {
    matches!(
        op,
        Opcode::Move
            | Opcode::LoadConst
            | Opcode::LoadFast
            | Opcode::LoadGlobal
            | Opcode::LoadDeref
            | Opcode::LoadNone
            | Opcode::Add
            | Opcode::Sub
            | Opcode::Mul
            | Opcode::Div
            | Opcode::FloorDiv
            | Opcode::Mod
            | Opcode::Pow
            | Opcode::Neg
            | Opcode::BitAnd
            | Opcode::BitOr
            | Opcode::BitXor
            | Opcode::LShift
            | Opcode::RShift
            | Opcode::CmpEq
            | Opcode::CmpNe
            | Opcode::CmpLt
            | Opcode::CmpLe
            | Opcode::CmpGt
            | Opcode::CmpGe
            | Opcode::Contains
            | Opcode::Not
            | Opcode::CmpIs
            | Opcode::CmpIsNot
            | Opcode::NotIn
            | Opcode::ExcMatch
            | Opcode::GetAttr
            | Opcode::GetItem
            | Opcode::GetSlice
            | Opcode::GetIter
    )
}

mod copy_propagation {
    use super::*;

    /// Fold `MOVE rd, ra` chains: if `ra` was itself the destination of an
    /// unconsumed `MOVE`, rewrite this instruction to read straight from the
    /// original source. Conservative: stops tracking a register the moment
    /// anything else writes to it.
    pub fn run(body: &mut LoweredBody) -> bool {
        let mut changed = false;
        let mut source_of: Vec<Option<Reg>> = vec![None; body.register_count as usize];

        for instr in &mut body.instructions {
            if instr.op() == Opcode::Move {
                let ra = instr.ra();
                if let Some(original) = source_of[ra as usize] {
                    if original != instr.rd() {
                        *instr = Instruction::reg2(Opcode::Move, instr.rd(), original);
                        changed = true;
                    }
                }
                source_of[instr.rd() as usize] = Some(source_of[ra as usize].unwrap_or(ra));
            } else if writes_only_rd(instr.op()) {
                source_of[instr.rd() as usize] = None;
            } else {
                // Conservatively invalidate every tracked register touched by
                // an instruction we don't otherwise understand the write set
                // of (calls, unpacks, closures, item/attr stores).
                for reg in touched_registers(instr) {
                    source_of[reg as usize] = None;
                }
            }
        }
        changed
    }
}

mod dead_store_elimination {
    use super::*;

    /// Blank a `MOVE`/load whose destination register is never read before
    /// being overwritten again, and whose only effect is a refcount bump on
    /// a value nothing observes. Scoped to straight-line runs between
    /// control-flow instructions, since a jump can make "never read again"
    /// false from the jump target. Blanked instructions become `NOP` in
    /// place rather than being removed, so every earlier index recorded in
    /// [`LoweredBody::stackop_to_instr`] stays valid.
    pub fn run(body: &mut LoweredBody) -> bool {
        let mut changed = false;
        let len = body.instructions.len();

        for i in 0..len {
            let instr = body.instructions[i];
            if !writes_only_rd(instr.op()) || instr.op() == Opcode::Move {
                continue;
            }
            let rd = instr.rd();
            let mut j = i + 1;
            let mut dead = false;
            while j < len {
                let next = body.instructions[j];
                if is_control_flow(next.op()) {
                    break;
                }
                if reads_register(&next, rd) {
                    break;
                }
                if writes_only_rd(next.op()) && next.rd() == rd {
                    dead = true;
                    break;
                }
                j += 1;
            }
            if dead {
                body.instructions[i] = Instruction::nop(Opcode::Nop);
                changed = true;
            }
        }
        changed
    }
}

mod constant_folding {
    use super::*;

    /// Fold `LOAD_CONST a; LOAD_CONST b; ADD/SUB/MUL rd, a, b` sequences over
    /// fixed-width integer constants into a single `LOAD_CONST`. Floats,
    /// bignums, strings and anything that could raise (division) are left
    /// alone: division-by-zero must still surface at run time through the
    /// host, not vanish at compile time.
    pub fn run(body: &mut LoweredBody) -> bool {
        let mut changed = false;
        let mut const_of: Vec<Option<i64>> = vec![None; body.register_count as usize];

        let mut i = 0;
        while i < body.instructions.len() {
            let instr = body.instructions[i];
            match instr.op() {
                Opcode::LoadConst => {
                    const_of[instr.rd() as usize] = body
                        .constants
                        .get(instr.imm() as usize)
                        .and_then(|c| if let Constant::Int(v) = c { Some(*v) } else { None });
                }
                Opcode::Add | Opcode::Sub | Opcode::Mul => {
                    let a = const_of[instr.ra() as usize];
                    let b = const_of[instr.rb() as usize];
                    if let (Some(a), Some(b)) = (a, b) {
                        let folded = match instr.op() {
                            Opcode::Add => a.checked_add(b),
                            Opcode::Sub => a.checked_sub(b),
                            Opcode::Mul => a.checked_mul(b),
                            _ => unreachable!(),
                        };
                        if let Some(folded) = folded {
                            let idx = body.constants.len() as u32;
                            body.constants.push(Constant::Int(folded));
                            body.instructions[i] = Instruction::reg1_imm(Opcode::LoadConst, instr.rd(), idx as i32);
                            const_of[instr.rd() as usize] = Some(folded);
                            changed = true;
                        } else {
                            const_of[instr.rd() as usize] = None;
                        }
                    } else {
                        const_of[instr.rd() as usize] = None;
                    }
                }
                op if writes_only_rd(op) => const_of[instr.rd() as usize] = None,
                _ => {
                    for reg in touched_registers(&instr) {
                        const_of[reg as usize] = None;
                    }
                }
            }
            i += 1;
        }
        changed
    }
}

mod peephole {
    use super::*;

    /// Fuse `NOT rd, ra` immediately followed by `JUMP_IF_FALSE`/
    /// `JUMP_IF_TRUE rd, off` when `rd` is dead after the branch: the NOT's
    /// only purpose was to flip which way the branch goes, so test `ra`
    /// directly with the opposite branch sense and drop the NOT.
    pub fn run(body: &mut LoweredBody) -> bool {
        let mut changed = false;
        let len = body.instructions.len();
        let mut i = 0;
        while i + 1 < len {
            let not_instr = body.instructions[i];
            let branch = body.instructions[i + 1];
            if not_instr.op() == Opcode::Not {
                let rd = not_instr.rd();
                let flipped = match branch.op() {
                    Opcode::JumpIfFalse if branch.rd() == rd => Some(Opcode::JumpIfTrue),
                    Opcode::JumpIfTrue if branch.rd() == rd => Some(Opcode::JumpIfFalse),
                    _ => None,
                };
                if let Some(flipped_op) = flipped {
                    let source = not_instr.ra();
                    body.instructions[i] = Instruction::nop(Opcode::Nop);
                    body.instructions[i + 1] = Instruction::reg_jump(flipped_op, source, branch.imm());
                    changed = true;
                    i += 2;
                    continue;
                }
            }
            i += 1;
        }
        changed
    }
}

mod block_coalescing {
    use super::*;

    /// Drop an unconditional `JUMP` whose target is the very next
    /// instruction — a no-op once jump targets resolve, but still worth
    /// removing before `emit` fixes up offsets so a shrunk body doesn't
    /// carry a dead relative jump through to the final bytecode.
    pub fn run(body: &mut LoweredBody) -> bool {
        let mut changed = false;
        for i in 0..body.instructions.len() {
            let instr = body.instructions[i];
            if instr.op() != Opcode::Jump {
                continue;
            }
            let target_stackop = instr.imm() as usize;
            let Some(&target_instr) = body.stackop_to_instr.get(target_stackop) else {
                continue;
            };
            if target_instr == i + 1 {
                body.instructions[i] = Instruction::nop(Opcode::Nop);
                changed = true;
            }
        }
        changed
    }
}

fn is_control_flow(op: Opcode) -> bool {
    matches!(
        op,
        Opcode::Jump
            | Opcode::JumpIfFalse
            | Opcode::JumpIfTrue
            | Opcode::ForIter
            | Opcode::SetupLoop
            | Opcode::SetupExcept
            | Opcode::SetupFinally
            | Opcode::SetupWith
            | Opcode::PopBlock
            | Opcode::BreakLoop
            | Opcode::ContinueLoop
            | Opcode::Raise
            | Opcode::EndExcept
            | Opcode::Call
            | Opcode::CallKw
            | Opcode::CallVar
            | Opcode::CallVarKw
            | Opcode::PopShadow
            | Opcode::YieldValue
            | Opcode::Return
    )
}

fn reads_register(instr: &Instruction, reg: Reg) -> bool {
    match instr.op().shape() {
        crate::opcode::OperandShape::Reg3 => instr.ra() == reg || instr.rb() == reg,
        crate::opcode::OperandShape::Reg2 | crate::opcode::OperandShape::Reg2Imm | crate::opcode::OperandShape::Reg2Jump => {
            instr.ra() == reg
                || (matches!(instr.op(), Opcode::SetAttr | Opcode::InplaceOp | Opcode::Call) && instr.rd() == reg)
        }
        crate::opcode::OperandShape::Reg1 => instr.ra() == reg,
        crate::opcode::OperandShape::RegJump => instr.rd() == reg,
        _ => false,
    }
}

fn touched_registers(instr: &Instruction) -> Vec<Reg> {
    use crate::opcode::OperandShape::*;
    match instr.op().shape() {
        Reg3 => vec![instr.rd(), instr.ra(), instr.rb()],
        Reg2 | Reg2Imm | Reg2Jump => vec![instr.rd(), instr.ra()],
        Reg1 | Reg1Imm | Reg1Count => vec![instr.rd().max(instr.ra())],
        RegJump => vec![instr.rd()],
        Jump | Nop => vec![],
    }
}
