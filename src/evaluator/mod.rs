//! The Evaluator: runs compiled [`RegCode`](crate::regcode::RegCode) against
//! a [`Host`]'s object model.
//!
//! Mirrors the split the teacher draws between a dispatch loop
//! ([`dispatch`]) and exception/control-flow unwinding ([`unwind`]): one big
//! per-opcode match fetches operands and calls into the `Host`, and any
//! [`ErrorKind`] it reports is handed to the block stack to resolve rather
//! than propagated with `?` past this frame.
//!
//! **Ownership convention.** Every `Host` constructor method (`none`,
//! `bool_value`, `make_int`, `get_attr`, `get_item`, `build_sequence`, ...)
//! returns a freshly owned reference each call. Duplicating an *existing*
//! register's content into a second register or a host container — `MOVE`,
//! `LOAD_FAST`, a call argument, a `BUILD_SEQUENCE` element — is the only
//! case that needs an explicit `incref`, since the original register keeps
//! its own reference too. A register holds exactly one owned reference from
//! the moment it's written until it's next overwritten or the frame is
//! released; nothing else in this module decrefs it in between, matching
//! `Host::decref`'s own documented contract.

mod dispatch;
mod unwind;

use crate::callbridge::CallBridge;
use crate::error::{ErrorKind, HostResult, TraceEntry};
use crate::frame::Frame;
use crate::host::Host;
use crate::opcode::Instruction;
use crate::regcode::Constant;

pub(crate) use dispatch::step;

/// What a frame did when it stopped running.
pub enum Completion<H> {
    /// Ran to completion (`RETURN`), handing back its result.
    Return(H),
    /// Suspended at a `YIELD_VALUE`, handing back the yielded value. The
    /// frame itself stays parked in the Call Bridge's generator table,
    /// keyed by the `state_id` its wrapper handle carries.
    Yield(H),
}

fn describe(kind: ErrorKind) -> (&'static str, &'static str) {
    match kind {
        ErrorKind::BadArgument => ("TypeError", "bad argument"),
        ErrorKind::AttributeMissing => ("AttributeError", "attribute missing"),
        ErrorKind::KeyMissing => ("KeyError", "key missing"),
        ErrorKind::IndexOutOfRange => ("IndexError", "index out of range"),
        ErrorKind::TypeMismatch => ("TypeError", "unsupported operand type"),
        ErrorKind::ArithmeticError => ("ArithmeticError", "arithmetic error"),
        ErrorKind::IterationStopped => ("StopIteration", "iteration stopped"),
        ErrorKind::UserRaised => ("Exception", "raised"),
        ErrorKind::Internal => ("RuntimeError", "internal engine error"),
    }
}

/// Decref every register, cell, and shadow-stack entry this frame still
/// owns. Called at every exit path (`RETURN`, an escaping exception) except
/// suspension, since a suspended generator frame keeps its state alive in
/// the Call Bridge's table. Any handle that must survive past this call
/// (a return value, a propagating exception) must already have been
/// `incref`'d once by the caller before invoking this.
fn release_frame<H: Host>(host: &mut H, frame: &mut Frame<H::Handle>) {
    for r in frame.registers.drain(..) {
        host.decref(r);
    }
    for c in frame.cells.drain(..) {
        host.decref(c);
    }
    for s in frame.shadow_stack.drain(..) {
        host.decref(s);
    }
}

/// Materialize a constant-pool entry into a host handle. Shared by
/// `LOAD_CONST` and the Call Bridge's default-argument binding.
pub(crate) fn materialize_constant<H: Host>(host: &mut H, c: &Constant) -> HostResult<H::Handle> {
    Ok(match c {
        Constant::None => host.none(),
        Constant::Bool(b) => host.bool_value(*b),
        Constant::Int(i) => host.make_int(*i),
        Constant::BigInt(b) => host.make_bigint(b),
        Constant::Float(f) => host.make_float(*f),
        Constant::Str(s) => host.make_string(s)?,
        Constant::Code(_) => return Err(ErrorKind::Internal),
    })
}

/// Run `frame` from its current `ip` until it returns, yields, or an
/// unhandled exception escapes it. `traceback` accumulates one
/// [`TraceEntry`] per frame the error unwinds through without being caught,
/// innermost first, for the embedder-facing `EngineError` the top-level
/// entry point eventually builds.
#[tracing::instrument(level = "debug", skip_all, fields(function = %frame.function_name))]
pub fn run_frame<H: Host>(
    host: &mut H,
    bridge: &CallBridge<H>,
    frame: &mut Frame<H::Handle>,
    traceback: &mut Vec<TraceEntry>,
) -> HostResult<Completion<H::Handle>> {
    loop {
        let Some((instr, next_ip)) = Instruction::decode(&frame.code.instructions, frame.ip as usize) else {
            return Err(ErrorKind::Internal);
        };

        tracing::trace!(ip = frame.ip, op = ?instr.op(), "dispatch");

        #[cfg(feature = "profile")]
        frame.profile.record(instr.op());

        match step(host, bridge, frame, instr, next_ip as u32, traceback) {
            Ok(dispatch::Step::Continue) => continue,
            Ok(dispatch::Step::Return(v)) => {
                host.incref(v);
                tracing::debug!(function = %frame.function_name, "frame returned");
                #[cfg(feature = "profile")]
                bridge.record_frame_profile(&frame.function_name, &frame.profile);
                release_frame(host, frame);
                return Ok(Completion::Return(v));
            }
            Ok(dispatch::Step::Yield(v)) => {
                host.incref(v);
                return Ok(Completion::Yield(v));
            }
            Err(kind) => {
                if frame.pending_error.is_none() {
                    let (class, message) = describe(kind);
                    frame.pending_error = Some(host.make_exception(class, message));
                }
                let handled = !kind.is_internal() && unwind::raise(host, frame, kind);
                if handled {
                    continue;
                }
                tracing::debug!(function = %frame.function_name, ?kind, "frame unwinding with an unhandled error");
                traceback.push(TraceEntry {
                    function: frame.function_name.clone(),
                    line: frame.current_line(),
                });
                if let Some(exc) = frame.pending_error {
                    host.incref(exc);
                }
                #[cfg(feature = "profile")]
                bridge.record_frame_profile(&frame.function_name, &frame.profile);
                release_frame(host, frame);
                return Err(kind);
            }
        }
    }
}
