//! The per-opcode dispatch step: decode one instruction's operands, call
//! into the `Host`, and advance or branch the frame's `ip`.
//!
//! One call to [`step`] executes exactly one instruction. Control-flow
//! opcodes (`JUMP`, `CALL`, `BREAK_LOOP`, ...) mutate `frame.ip` themselves;
//! everything else falls through to the already-computed `next_ip`.

use crate::callbridge::CallBridge;
use crate::error::{ErrorKind, HostResult, TraceEntry};
use crate::frame::{BlockEntry, Frame};
use crate::host::Host;
use crate::opcode::{Instruction, Opcode, Reg};
use crate::regcode::Constant;

use super::materialize_constant;

/// Outcome of one dispatched instruction.
pub(super) enum Step<H> {
    /// Ordinary instruction; `frame.ip` already points at the next one.
    Continue,
    /// `RETURN` — frame is done, hand `H` back to the caller.
    Return(H),
    /// `YIELD_VALUE` — frame is suspended, hand `H` back to the caller.
    Yield(H),
}

fn reg<H: Host>(frame: &Frame<H::Handle>, r: Reg) -> H::Handle {
    frame.registers[r as usize]
}

fn set_reg<H: Host>(host: &mut H, frame: &mut Frame<H::Handle>, r: Reg, value: H::Handle) {
    let old = frame.registers[r as usize];
    frame.registers[r as usize] = value;
    host.decref(old);
}

fn jump_target(next_ip: u32, imm: i32) -> u32 {
    (next_ip as i64 + imm as i64) as u32
}

fn arith<H: Host>(
    host: &mut H,
    frame: &mut Frame<H::Handle>,
    instr: Instruction,
    f: fn(&mut H, H::Handle, H::Handle) -> HostResult<H::Handle>,
) -> HostResult<()> {
    let a = reg::<H>(frame, instr.ra());
    let b = reg::<H>(frame, instr.rb());
    let v = f(host, a, b)?;
    set_reg(host, frame, instr.rd(), v);
    Ok(())
}

fn compare<H: Host>(
    host: &mut H,
    frame: &mut Frame<H::Handle>,
    instr: Instruction,
    f: fn(&mut H, H::Handle, H::Handle) -> HostResult<bool>,
) -> HostResult<()> {
    let a = reg::<H>(frame, instr.ra());
    let b = reg::<H>(frame, instr.rb());
    let result = f(host, a, b)?;
    let v = host.bool_value(result);
    set_reg(host, frame, instr.rd(), v);
    Ok(())
}

/// Pop one shadow-stack slot for `GET_SLICE`'s optional bounds: `none`
/// decodes to `None`, anything else to `Some`.
fn pop_optional<H: Host>(host: &mut H, frame: &mut Frame<H::Handle>) -> HostResult<Option<H::Handle>> {
    let v = frame.shadow_stack.pop().ok_or(ErrorKind::Internal)?;
    let none = host.none();
    let is_none = host.is_same(v, none);
    host.decref(none);
    if is_none {
        host.decref(v);
        Ok(None)
    } else {
        Ok(Some(v))
    }
}

fn is_same_result<H: Host>(host: &mut H, a: H::Handle, b: H::Handle) -> HostResult<bool> {
    Ok(host.is_same(a, b))
}

fn is_not_same_result<H: Host>(host: &mut H, a: H::Handle, b: H::Handle) -> HostResult<bool> {
    Ok(host.is_not_same(a, b))
}

/// Materialize every value `*args`/a `CALL_VAR`-style splat register yields,
/// fully draining its iterator up front since the callee's arity isn't known
/// until the callable itself resolves.
fn splat_sequence<H: Host>(host: &mut H, seq: H::Handle) -> HostResult<Vec<H::Handle>> {
    let iter = host.get_iter(seq)?;
    let mut items = Vec::new();
    loop {
        match host.iter_next(iter) {
            Ok(v) => items.push(v),
            Err(e) if e.is_iteration_stopped() => break,
            Err(e) => {
                host.decref(iter);
                for v in items {
                    host.decref(v);
                }
                return Err(e);
            }
        }
    }
    host.decref(iter);
    Ok(items)
}

pub(super) fn step<H: Host>(
    host: &mut H,
    bridge: &CallBridge<H>,
    frame: &mut Frame<H::Handle>,
    instr: Instruction,
    next_ip: u32,
    traceback: &mut Vec<TraceEntry>,
) -> HostResult<Step<H::Handle>> {
    frame.ip = next_ip;

    match instr.op() {
        Opcode::Nop => {}
        Opcode::PopBlock => {
            frame.block_stack.pop();
        }
        Opcode::PopShadow => {
            let v = frame.shadow_stack.pop().ok_or(ErrorKind::Internal)?;
            set_reg(host, frame, instr.ra(), v);
        }

        Opcode::Move => {
            let v = reg::<H>(frame, instr.ra());
            host.incref(v);
            set_reg(host, frame, instr.rd(), v);
        }
        Opcode::LoadConst => {
            let c = &frame.code.constants[instr.imm() as usize];
            let v = materialize_constant(host, c)?;
            set_reg(host, frame, instr.rd(), v);
        }
        Opcode::LoadFast => {
            let v = reg::<H>(frame, instr.imm() as Reg);
            host.incref(v);
            set_reg(host, frame, instr.rd(), v);
        }
        Opcode::StoreFast => {
            let v = reg::<H>(frame, instr.rd());
            host.incref(v);
            set_reg(host, frame, instr.imm() as Reg, v);
        }
        Opcode::LoadGlobal => {
            let name = &frame.code.names[instr.imm() as usize];
            let v = match host.dict_get(frame.globals, name) {
                Ok(v) => v,
                Err(ErrorKind::KeyMissing) => match frame.builtins {
                    Some(builtins) => host.dict_get(builtins, name)?,
                    None => return Err(ErrorKind::KeyMissing),
                },
                Err(e) => return Err(e),
            };
            set_reg(host, frame, instr.rd(), v);
        }
        Opcode::StoreGlobal => {
            let name = &frame.code.names[instr.imm() as usize];
            let v = reg::<H>(frame, instr.rd());
            host.incref(v);
            host.dict_set(frame.globals, name, v)?;
        }
        Opcode::LoadDeref => {
            let v = frame.cells[instr.imm() as usize];
            host.incref(v);
            set_reg(host, frame, instr.rd(), v);
        }
        Opcode::StoreDeref => {
            let v = reg::<H>(frame, instr.rd());
            host.incref(v);
            let old = frame.cells[instr.imm() as usize];
            frame.cells[instr.imm() as usize] = v;
            host.decref(old);
        }
        Opcode::LoadNone => {
            let v = host.none();
            set_reg(host, frame, instr.ra(), v);
        }
        Opcode::Swap => {
            frame.registers.swap(instr.rd() as usize, instr.ra() as usize);
        }

        Opcode::Add => arith(host, frame, instr, H::add)?,
        Opcode::Sub => arith(host, frame, instr, H::sub)?,
        Opcode::Mul => arith(host, frame, instr, H::mul)?,
        Opcode::Div => arith(host, frame, instr, H::div)?,
        Opcode::FloorDiv => arith(host, frame, instr, H::floor_div)?,
        Opcode::Mod => arith(host, frame, instr, H::modulo)?,
        Opcode::Pow => arith(host, frame, instr, H::pow)?,
        Opcode::BitAnd => arith(host, frame, instr, H::bit_and)?,
        Opcode::BitOr => arith(host, frame, instr, H::bit_or)?,
        Opcode::BitXor => arith(host, frame, instr, H::bit_xor)?,
        Opcode::LShift => arith(host, frame, instr, H::lshift)?,
        Opcode::RShift => arith(host, frame, instr, H::rshift)?,
        Opcode::Neg => {
            let a = reg::<H>(frame, instr.ra());
            let v = host.negate(a)?;
            set_reg(host, frame, instr.rd(), v);
        }
        Opcode::Not => {
            let a = reg::<H>(frame, instr.ra());
            let truthy = host.is_truthy(a)?;
            let v = host.bool_value(!truthy);
            set_reg(host, frame, instr.rd(), v);
        }
        Opcode::InplaceOp => {
            let a = reg::<H>(frame, instr.rd());
            let b = reg::<H>(frame, instr.ra());
            let op = crate::compiler::inplace_operator(instr.imm());
            let v = host.inplace(op, a, b)?;
            set_reg(host, frame, instr.rd(), v);
        }
        Opcode::CmpEq => compare(host, frame, instr, H::eq)?,
        Opcode::CmpNe => compare(host, frame, instr, H::ne)?,
        Opcode::CmpLt => compare(host, frame, instr, H::lt)?,
        Opcode::CmpLe => compare(host, frame, instr, H::le)?,
        Opcode::CmpGt => compare(host, frame, instr, H::gt)?,
        Opcode::CmpGe => compare(host, frame, instr, H::ge)?,
        Opcode::Contains => compare(host, frame, instr, H::contains)?,
        Opcode::CmpIs => compare(host, frame, instr, is_same_result)?,
        Opcode::CmpIsNot => compare(host, frame, instr, is_not_same_result)?,
        Opcode::NotIn => compare(host, frame, instr, H::not_contains)?,

        Opcode::GetAttr => {
            let obj = reg::<H>(frame, instr.ra());
            let name = &frame.code.names[instr.imm() as usize];
            let v = host.get_attr(obj, name)?;
            set_reg(host, frame, instr.rd(), v);
        }
        Opcode::SetAttr => {
            let obj = reg::<H>(frame, instr.rd());
            let value = reg::<H>(frame, instr.ra());
            let name = &frame.code.names[instr.imm() as usize];
            host.incref(value);
            host.set_attr(obj, name, value)?;
        }
        Opcode::GetItem => {
            let obj = reg::<H>(frame, instr.ra());
            let key = reg::<H>(frame, instr.rb());
            let v = host.get_item(obj, key)?;
            set_reg(host, frame, instr.rd(), v);
        }
        Opcode::SetItem => {
            let obj = reg::<H>(frame, instr.rd());
            let key = reg::<H>(frame, instr.ra());
            let value = reg::<H>(frame, instr.rb());
            host.incref(key);
            host.incref(value);
            host.set_item(obj, key, value)?;
        }
        Opcode::DelItem => {
            let obj = reg::<H>(frame, instr.rd());
            let key = reg::<H>(frame, instr.ra());
            host.del_item(obj, key)?;
        }
        Opcode::GetSlice => {
            let obj = reg::<H>(frame, instr.ra());
            // Bounds were pushed start, stop, step (possibly `none` for an
            // omitted bound) and are consumed here in reverse.
            let step = pop_optional(host, frame)?;
            let stop = pop_optional(host, frame)?;
            let start = pop_optional(host, frame)?;
            let v = host.get_slice(obj, start, stop, step)?;
            for bound in [start, stop, step].into_iter().flatten() {
                host.decref(bound);
            }
            set_reg(host, frame, instr.rd(), v);
        }

        Opcode::GetIter => {
            let obj = reg::<H>(frame, instr.ra());
            let it = host.get_iter(obj)?;
            set_reg(host, frame, instr.rd(), it);
        }
        Opcode::ForIter => {
            let iterator = reg::<H>(frame, instr.ra());
            match bridge.iter_next(host, frame, iterator, traceback)? {
                Some(v) => set_reg(host, frame, instr.rd(), v),
                None => {
                    let none = host.none();
                    set_reg(host, frame, instr.ra(), none);
                    frame.ip = jump_target(next_ip, instr.imm());
                }
            }
        }

        Opcode::BuildSequence => {
            let base = instr.rd();
            let n = instr.imm() as usize;
            let mut items = Vec::with_capacity(n);
            for i in 0..n {
                let v = reg::<H>(frame, base + i as Reg);
                host.incref(v);
                items.push(v);
            }
            let seq = host.build_sequence(&items)?;
            set_reg(host, frame, base, seq);
        }
        Opcode::BuildMapping => {
            let base = instr.rd();
            let n = instr.imm() as usize;
            let mut items = Vec::with_capacity(n);
            for i in 0..n {
                let key = reg::<H>(frame, base + (2 * i) as Reg);
                let value = reg::<H>(frame, base + (2 * i + 1) as Reg);
                host.incref(key);
                host.incref(value);
                items.push((key, value));
            }
            let mapping = host.build_mapping(&items)?;
            set_reg(host, frame, base, mapping);
        }
        Opcode::UnpackSequence => {
            let seq = reg::<H>(frame, instr.rd());
            let n = instr.imm() as usize;
            let dest_base = instr.ra();
            let values = host.unpack_sequence(seq, n)?;
            for (i, v) in values.into_iter().enumerate() {
                set_reg(host, frame, dest_base + i as Reg, v);
            }
        }
        Opcode::MakeClosure => {
            let dst = instr.rd();
            let idx = instr.imm() as usize;
            let nested = match &frame.code.constants[idx] {
                Constant::Code(rc) => rc.clone(),
                _ => return Err(ErrorKind::Internal),
            };
            let n = nested.free_var_count;
            let mut cells = Vec::with_capacity(n as usize);
            for i in 0..n {
                let v = reg::<H>(frame, dst + i as Reg);
                host.incref(v);
                cells.push(v);
            }
            let closure = host.make_closure(nested, cells);
            set_reg(host, frame, dst, closure);
        }

        Opcode::Jump => frame.ip = jump_target(next_ip, instr.imm()),
        Opcode::JumpIfFalse => {
            let v = reg::<H>(frame, instr.rd());
            if !host.is_truthy(v)? {
                frame.ip = jump_target(next_ip, instr.imm());
            }
        }
        Opcode::JumpIfTrue => {
            let v = reg::<H>(frame, instr.rd());
            if host.is_truthy(v)? {
                frame.ip = jump_target(next_ip, instr.imm());
            }
        }

        Opcode::SetupLoop => {
            let end = jump_target(next_ip, instr.imm());
            frame.block_stack.push(BlockEntry::Loop {
                end,
                stack_depth: frame.shadow_stack.len() as u16,
            });
        }
        Opcode::SetupExcept => {
            let handler = jump_target(next_ip, instr.imm());
            frame.block_stack.push(BlockEntry::Except {
                handler,
                stack_depth: frame.shadow_stack.len() as u16,
            });
        }
        Opcode::SetupFinally => {
            let handler = jump_target(next_ip, instr.imm());
            frame.block_stack.push(BlockEntry::Finally {
                handler,
                stack_depth: frame.shadow_stack.len() as u16,
            });
        }
        Opcode::SetupWith => {
            let handler = jump_target(next_ip, instr.imm());
            frame.block_stack.push(BlockEntry::With {
                handler,
                manager: instr.rd(),
                stack_depth: frame.shadow_stack.len() as u16,
            });
        }
        Opcode::BreakLoop => loop {
            match frame.block_stack.pop() {
                Some(BlockEntry::Loop { end, stack_depth }) => {
                    for v in frame.shadow_stack.drain(stack_depth as usize..) {
                        host.decref(v);
                    }
                    frame.ip = end;
                    break;
                }
                Some(_) => continue,
                None => return Err(ErrorKind::Internal),
            }
        },
        Opcode::ContinueLoop => {
            let target = jump_target(next_ip, instr.imm());
            loop {
                match frame.block_stack.last() {
                    Some(BlockEntry::Loop { .. }) => break,
                    Some(_) => {
                        frame.block_stack.pop();
                    }
                    None => return Err(ErrorKind::Internal),
                }
            }
            frame.ip = target;
        }
        Opcode::Raise => {
            let operand = reg::<H>(frame, instr.ra());
            let none = host.none();
            let is_reraise = host.is_same(operand, none);
            host.decref(none);
            if is_reraise {
                if frame.pending_error.is_none() {
                    return Err(ErrorKind::Internal);
                }
            } else {
                host.incref(operand);
                if let Some(old) = frame.pending_error.replace(operand) {
                    host.decref(old);
                }
            }
            return Err(ErrorKind::UserRaised);
        }
        Opcode::EndExcept => {
            if let Some(exc) = frame.pending_error.take() {
                host.decref(exc);
            }
        }
        Opcode::ExcMatch => {
            let exc = reg::<H>(frame, instr.ra());
            let name = &frame.code.names[instr.imm() as usize];
            let matches = host.exception_matches(exc, name);
            let v = host.bool_value(matches);
            set_reg(host, frame, instr.rd(), v);
        }

        Opcode::Call => {
            let base = instr.rd();
            let argc = instr.imm() as usize;
            let callable = reg::<H>(frame, base);
            let args: Vec<H::Handle> = (1..=argc as Reg).map(|i| reg::<H>(frame, base + i)).collect();
            let outcome = bridge.call(host, frame, callable, &args, &[], traceback)?;
            let result = match outcome {
                crate::callbridge::CallOutcome::Value(v) => v,
                crate::callbridge::CallOutcome::Generator(v) => v,
            };
            set_reg(host, frame, base, result);
        }
        Opcode::CallKw => {
            let base = instr.rd();
            let n_positional = instr.ra() as usize;
            let kwnames_idx = instr.imm() as usize;
            let kwnames = frame.code.kwname_tables[kwnames_idx].clone();
            let callable = reg::<H>(frame, base);
            let args: Vec<H::Handle> = (1..=n_positional as Reg).map(|i| reg::<H>(frame, base + i)).collect();
            let kwargs: Vec<(&str, H::Handle)> = kwnames
                .iter()
                .enumerate()
                .map(|(i, name)| (name.as_str(), reg::<H>(frame, base + 1 + n_positional as Reg + i as Reg)))
                .collect();
            let outcome = bridge.call(host, frame, callable, &args, &kwargs, traceback)?;
            let result = match outcome {
                crate::callbridge::CallOutcome::Value(v) => v,
                crate::callbridge::CallOutcome::Generator(v) => v,
            };
            set_reg(host, frame, base, result);
        }
        Opcode::CallVar => {
            let base = instr.rd();
            let n_positional = instr.imm() as usize;
            let callable = reg::<H>(frame, base);
            let mut args: Vec<H::Handle> = (1..=n_positional as Reg).map(|i| reg::<H>(frame, base + i)).collect();
            let splat_reg = base + 1 + n_positional as Reg;
            let splat_src = reg::<H>(frame, splat_reg);
            let extra_args = splat_sequence(host, splat_src)?;
            args.extend_from_slice(&extra_args);
            let outcome = bridge.call(host, frame, callable, &args, &[], traceback)?;
            let result = match outcome {
                crate::callbridge::CallOutcome::Value(v) => v,
                crate::callbridge::CallOutcome::Generator(v) => v,
            };
            for v in extra_args {
                host.decref(v);
            }
            set_reg(host, frame, base, result);
        }
        Opcode::CallVarKw => {
            let base = instr.rd();
            let n_positional = instr.ra() as usize;
            let kwnames_idx = instr.imm() as usize;
            let kwnames = frame.code.kwname_tables[kwnames_idx].clone();
            let kwc = kwnames.len();
            let callable = reg::<H>(frame, base);
            let mut args: Vec<H::Handle> = (1..=n_positional as Reg).map(|i| reg::<H>(frame, base + i)).collect();
            let mut kwargs: Vec<(&str, H::Handle)> = kwnames
                .iter()
                .enumerate()
                .map(|(i, name)| (name.as_str(), reg::<H>(frame, base + 1 + n_positional as Reg + i as Reg)))
                .collect();

            let var_args_reg = base + 1 + n_positional as Reg + kwc as Reg;
            let var_kwargs_reg = var_args_reg + 1;
            let splat_src = reg::<H>(frame, var_args_reg);
            let extra_args = splat_sequence(host, splat_src)?;
            args.extend_from_slice(&extra_args);

            let mapping = reg::<H>(frame, var_kwargs_reg);
            let extra_pairs = host.mapping_items(mapping)?;
            let mut extra_names = Vec::with_capacity(extra_pairs.len());
            for (key, _) in &extra_pairs {
                extra_names.push(host.to_display_string(*key)?);
                host.decref(*key);
            }
            for (name, (_, value)) in extra_names.iter().zip(extra_pairs.iter()) {
                kwargs.push((name.as_str(), *value));
            }

            let outcome = bridge.call(host, frame, callable, &args, &kwargs, traceback)?;
            let result = match outcome {
                crate::callbridge::CallOutcome::Value(v) => v,
                crate::callbridge::CallOutcome::Generator(v) => v,
            };
            for v in extra_args {
                host.decref(v);
            }
            for (_, value) in extra_pairs {
                host.decref(value);
            }
            set_reg(host, frame, base, result);
        }
        Opcode::YieldValue => {
            let v = reg::<H>(frame, instr.ra());
            return Ok(Step::Yield(v));
        }
        Opcode::Return => {
            let v = reg::<H>(frame, instr.ra());
            return Ok(Step::Return(v));
        }
    }

    Ok(Step::Continue)
}
