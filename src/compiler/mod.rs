//! The Compiler: turns host [`StackCode`](crate::stackcode::StackCode) into
//! a validated [`RegCode`](crate::regcode::RegCode).
//!
//! The six-stage pipeline spec.md describes is realized as five submodules
//! sharing one per-body walk:
//!
//! 1. [`stackops`] — bounds-check the raw stack bytecode (constant/name/
//!    local indices, jump targets) before anything else touches it.
//! 2. [`blocks`] — compute each instruction's successor edges and, from
//!    them, the abstract stack depth at every instruction, rejecting bodies
//!    whose predecessors disagree about the depth at a join point.
//! 3–4. [`lower`] — re-walk the body with the validated depth table,
//!    emitting register-machine [`Instruction`](crate::opcode::Instruction)s
//!    under the canonical depth-to-register mapping (stack slot at depth
//!    `d` is always register `locals + d`).
//! 5. [`optimize`] — copy propagation, dead store elimination, constant
//!    folding, peephole fusion, and block coalescing, each run to a fixed
//!    point over the lowered instruction list.
//! 6. [`emit`] — encode the final instruction list to bytes, fix up jump
//!    offsets, and assemble the [`RegCode`].

mod blocks;
mod emit;
mod lower;
mod optimize;
mod stackops;

use std::sync::Arc;

use crate::error::CompileResult;
use crate::regcode::RegCode;
use crate::stackcode::StackCode;

pub(crate) use lower::inplace_operator;

/// Controls which optimization passes [`compile`] runs. Embedders that want
/// to inspect unoptimized RegCode (for test fixtures, or to isolate a
/// miscompile to a specific pass) can disable them individually.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct OptimizeOptions {
    /// Run copy propagation.
    pub copy_propagation: bool,
    /// Run dead store elimination.
    pub dead_store_elimination: bool,
    /// Run constant folding.
    pub constant_folding: bool,
    /// Run peephole fusion (compare immediately followed by a conditional
    /// jump on its result).
    pub peephole: bool,
    /// Run block coalescing (drop an unconditional jump straight to the
    /// following instruction).
    pub block_coalescing: bool,
}

impl Default for OptimizeOptions {
    fn default() -> Self {
        Self {
            copy_propagation: true,
            dead_store_elimination: true,
            constant_folding: true,
            peephole: true,
            block_coalescing: true,
        }
    }
}

impl OptimizeOptions {
    /// All passes disabled — useful for tests asserting on pre-optimization
    /// shape.
    pub const fn none() -> Self {
        Self {
            copy_propagation: false,
            dead_store_elimination: false,
            constant_folding: false,
            peephole: false,
            block_coalescing: false,
        }
    }
}

/// Compile `code` into a validated [`RegCode`], running the full pipeline.
#[tracing::instrument(level = "debug", skip_all, fields(name = %code.name))]
pub fn compile(code: &StackCode, opts: OptimizeOptions) -> CompileResult<Arc<RegCode>> {
    stackops::validate(code)?;
    let depths = blocks::analyze_depths(code)?;
    let mut lowered = lower::lower(code, &depths)?;
    optimize::run_to_fixed_point(&mut lowered, opts);
    let regcode = emit::assemble(code, lowered, opts)?;
    regcode.validate()?;
    tracing::debug!(
        instructions = regcode.instructions.len(),
        registers = regcode.register_count,
        "compiled code object"
    );
    Ok(Arc::new(regcode))
}
