//! The Call Bridge: turns a `CALL`/`FOR_ITER` on an engine-compiled callable
//! into a recursive [`evaluator::run_frame`](crate::evaluator::run_frame)
//! invocation, owning the pieces that live across more than one call —
//! the RegCode compilation cache and the suspended-generator table.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::compiler::OptimizeOptions;
use crate::error::{ErrorKind, HostResult, TraceEntry};
use crate::evaluator::{self, materialize_constant, Completion};
use crate::frame::{CodeId, Frame};
use crate::host::Host;
use crate::regcode::RegCode;

/// What calling a callable produced.
pub enum CallOutcome<H> {
    /// An ordinary return value.
    Value(H),
    /// A freshly created generator object, suspended before its first
    /// instruction; the caller hands this straight to `GET_ITER`.
    Generator(H),
}

/// Owns the RegCode cache and suspended generator frames a running program
/// accumulates across calls. One `CallBridge` is shared by every `Frame` in
/// a single top-level `Engine::run`.
pub struct CallBridge<H: Host> {
    cache: Mutex<HashMap<CodeId, Arc<RegCode>>>,
    cache_capacity: usize,
    generators: Mutex<HashMap<u64, Frame<H::Handle>>>,
    next_generator_id: AtomicU64,
    opts: OptimizeOptions,
    #[cfg(feature = "profile")]
    profiler: Mutex<crate::profiler::Profiler>,
}

impl<H: Host> CallBridge<H> {
    /// Construct an empty bridge, compiling with `opts`, caching at most
    /// `cache_capacity` compiled bodies at a time.
    pub fn new(opts: OptimizeOptions, cache_capacity: usize) -> Self {
        Self {
            cache: Mutex::new(HashMap::new()),
            cache_capacity,
            generators: Mutex::new(HashMap::new()),
            next_generator_id: AtomicU64::new(0),
            opts,
            #[cfg(feature = "profile")]
            profiler: Mutex::new(crate::profiler::Profiler::default()),
        }
    }

    /// Fold one completed frame's counters into this bridge's aggregate
    /// profiler. A no-op unless the `profile` feature is enabled.
    #[cfg(feature = "profile")]
    pub(crate) fn record_frame_profile(&self, function_name: &str, frame: &crate::profiler::FrameProfile) {
        self.profiler.lock().expect("profiler poisoned").merge(function_name, frame);
    }

    /// Snapshot of every counter this bridge has accumulated so far.
    #[cfg(feature = "profile")]
    pub fn profiler(&self) -> crate::profiler::Profiler {
        self.profiler.lock().expect("profiler poisoned").clone()
    }

    /// Return `callable`'s already-compiled RegCode directly if it carries
    /// one (a `MAKE_CLOSURE` result), else compile its stack bytecode or
    /// return the cached RegCode from an earlier call with the same
    /// [`CodeId`].
    pub(crate) fn resolve(&self, host: &mut H, callable: H::Handle) -> HostResult<Arc<RegCode>> {
        if let Some(regcode) = host.compiled_regcode(callable) {
            return Ok(regcode);
        }
        let id = host.code_id(callable);
        if let Some(regcode) = self.cache.lock().expect("regcode cache poisoned").get(&id) {
            return Ok(regcode.clone());
        }
        let stack_code = host.stack_code(callable);
        let regcode = crate::compiler::compile(&stack_code, self.opts).map_err(|_| ErrorKind::Internal)?;
        let mut cache = self.cache.lock().expect("regcode cache poisoned");
        if cache.len() >= self.cache_capacity {
            if let Some(evict) = cache.keys().next().copied() {
                cache.remove(&evict);
            }
        }
        cache.insert(id, regcode.clone());
        Ok(regcode)
    }

    /// Build the fresh register file a call into `regcode` needs: positional
    /// `args` bound in order, `kwargs` matched by name to the remaining
    /// parameter slots (or collected into `**kwargs` / rejected), unfilled
    /// trailing slots taken from their default constants, and `*args`/
    /// `**kwargs` packed if the callee accepts them.
    pub(crate) fn bind_args(
        &self,
        host: &mut H,
        regcode: &RegCode,
        args: &[H::Handle],
        kwargs: &[(&str, H::Handle)],
    ) -> HostResult<Vec<H::Handle>> {
        let arity = &regcode.arity;
        let positional = arity.positional as usize;
        let defaults = arity.defaults as usize;

        if args.len() > positional && !arity.has_varargs {
            return Err(ErrorKind::BadArgument);
        }

        let mut registers = Vec::with_capacity(regcode.register_count as usize);
        for _ in 0..regcode.register_count {
            registers.push(host.none());
        }

        let mut filled = vec![false; positional];
        let bound = args.len().min(positional);
        for (i, arg) in args.iter().take(bound).enumerate() {
            host.incref(*arg);
            let slot = std::mem::replace(&mut registers[i], *arg);
            host.decref(slot);
            filled[i] = true;
        }

        let mut extra_kwargs: Vec<(H::Handle, H::Handle)> = Vec::new();
        for &(name, value) in kwargs {
            match arity.param_names.iter().position(|p| p == name) {
                Some(i) if i < positional => {
                    if filled[i] {
                        return Err(ErrorKind::BadArgument);
                    }
                    host.incref(value);
                    let slot = std::mem::replace(&mut registers[i], value);
                    host.decref(slot);
                    filled[i] = true;
                }
                _ => {
                    if !arity.has_varkwargs {
                        return Err(ErrorKind::BadArgument);
                    }
                    let key = host.make_string(name)?;
                    host.incref(value);
                    extra_kwargs.push((key, value));
                }
            }
        }

        let defaults_start = positional - defaults;
        for i in 0..positional {
            if filled[i] {
                continue;
            }
            if i < defaults_start {
                return Err(ErrorKind::BadArgument);
            }
            let k = i - defaults_start;
            let const_index = regcode.constants.len() - defaults + k;
            let v = materialize_constant(host, &regcode.constants[const_index])?;
            let slot = std::mem::replace(&mut registers[i], v);
            host.decref(slot);
        }

        if let Some(va_reg) = arity.varargs_register() {
            let extra = if args.len() > positional { &args[positional..] } else { &[][..] };
            for v in extra {
                host.incref(*v);
            }
            let tuple = host.build_sequence(extra)?;
            let slot = std::mem::replace(&mut registers[va_reg as usize], tuple);
            host.decref(slot);
        }
        if let Some(vk_reg) = arity.varkwargs_register() {
            let mapping = host.build_mapping(&extra_kwargs)?;
            let slot = std::mem::replace(&mut registers[vk_reg as usize], mapping);
            host.decref(slot);
        }

        Ok(registers)
    }

    /// Build the fresh cell array a call into `regcode` needs: `callable`'s
    /// captured free variables occupy the first `free_var_count` slots (each
    /// duplicated with an `incref`, since the closure object keeps its own
    /// copy for any later call); the remaining `cell_count - free_var_count`
    /// slots — this frame's own cell-stored locals, not yet assigned — start
    /// unbound.
    pub(crate) fn bind_cells(&self, host: &mut H, regcode: &RegCode, callable: H::Handle) -> Vec<H::Handle> {
        let mut cells = Vec::with_capacity(regcode.cell_count as usize);
        for v in host.closure_cells(callable) {
            host.incref(v);
            cells.push(v);
        }
        while cells.len() < regcode.cell_count as usize {
            cells.push(host.none());
        }
        cells
    }

    /// Invoke `callable(*args, **kwargs)`. Non-engine callables (builtins,
    /// host-native functions) dispatch straight to [`Host::call_host`]. Engine-compiled
    /// callables bind a fresh `Frame` and either run it to completion or, for
    /// a generator function, park it in the generator table and hand back a
    /// wrapper object instead of running it at all.
    ///
    /// On a nested failure, the inner frame's `pending_error` (already
    /// incref'd once by [`evaluator::run_frame`]) is transferred onto
    /// `caller_frame.pending_error`, so the caller's own block stack sees it
    /// exactly as if it had raised directly.
    pub fn call(
        &self,
        host: &mut H,
        caller_frame: &mut Frame<H::Handle>,
        callable: H::Handle,
        args: &[H::Handle],
        kwargs: &[(&str, H::Handle)],
        traceback: &mut Vec<TraceEntry>,
    ) -> HostResult<CallOutcome<H::Handle>> {
        if !host.is_engine_callable(callable) {
            let value = host.call_host(callable, args, kwargs)?;
            return Ok(CallOutcome::Value(value));
        }

        let regcode = self.resolve(host, callable)?;
        let registers = self.bind_args(host, &regcode, args, kwargs)?;
        let cells = self.bind_cells(host, &regcode, callable);
        let globals = host.callable_globals(callable);
        let builtins = host.builtins();
        let function_name = regcode.name.clone();

        let mut frame = Frame::new(regcode.clone(), registers, cells, globals, builtins, function_name);

        if regcode.is_generator {
            let id = self.next_generator_id.fetch_add(1, Ordering::Relaxed);
            self.generators
                .lock()
                .expect("generator table poisoned")
                .insert(id, frame);
            return Ok(CallOutcome::Generator(host.make_generator(id)));
        }

        match evaluator::run_frame(host, self, &mut frame, traceback) {
            Ok(Completion::Return(v)) => Ok(CallOutcome::Value(v)),
            Ok(Completion::Yield(_)) => Err(ErrorKind::Internal),
            Err(kind) => {
                if let Some(exc) = frame.pending_error {
                    if let Some(old) = caller_frame.pending_error.replace(exc) {
                        host.decref(old);
                    }
                }
                Err(kind)
            }
        }
    }

    /// Advance an iterator one step. Engine generator wrappers resume their
    /// parked `Frame`; anything else defers to [`Host::iter_next`], folding
    /// its `IterationStopped` sentinel into `Ok(None)`.
    pub fn iter_next(
        &self,
        host: &mut H,
        caller_frame: &mut Frame<H::Handle>,
        iterator: H::Handle,
        traceback: &mut Vec<TraceEntry>,
    ) -> HostResult<Option<H::Handle>> {
        if let Some(id) = host.generator_state_id(iterator) {
            let mut frame = self
                .generators
                .lock()
                .expect("generator table poisoned")
                .remove(&id)
                .ok_or(ErrorKind::Internal)?;

            return match evaluator::run_frame(host, self, &mut frame, traceback) {
                Ok(Completion::Yield(v)) => {
                    self.generators
                        .lock()
                        .expect("generator table poisoned")
                        .insert(id, frame);
                    Ok(Some(v))
                }
                Ok(Completion::Return(v)) => {
                    host.decref(v);
                    Ok(None)
                }
                Err(kind) => {
                    if let Some(exc) = frame.pending_error {
                        if let Some(old) = caller_frame.pending_error.replace(exc) {
                            host.decref(old);
                        }
                    }
                    Err(kind)
                }
            };
        }

        match host.iter_next(iterator) {
            Ok(v) => Ok(Some(v)),
            Err(e) if e.is_iteration_stopped() => Ok(None),
            Err(e) => Err(e),
        }
    }
}

impl<H: Host> Default for CallBridge<H> {
    fn default() -> Self {
        Self::new(OptimizeOptions::default(), crate::config::EngineConfig::default().regcode_cache_capacity())
    }
}
