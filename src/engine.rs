//! The embedder-facing facade: compile host [`StackCode`] and run it to
//! completion, producing an [`EngineError`] instead of a bare [`ErrorKind`]
//! once an exception has escaped every frame.

use std::sync::Arc;

use crate::callbridge::CallBridge;
use crate::compiler::OptimizeOptions;
use crate::config::EngineConfig;
use crate::error::{CompileResult, EngineError, EngineResult, ErrorKind};
use crate::evaluator::{self, Completion};
use crate::frame::Frame;
use crate::host::Host;
use crate::regcode::RegCode;
use crate::stackcode::StackCode;

fn describe_message(kind: ErrorKind) -> String {
    kind.to_string()
}

/// Owns the [`CallBridge`] a program's calls and generators accumulate state
/// in. One `Engine` is typically constructed once per embedding and reused
/// across every top-level `run`.
pub struct Engine<H: Host> {
    bridge: CallBridge<H>,
    config: EngineConfig,
}

impl<H: Host> Engine<H> {
    /// Construct an engine with the default configuration.
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    /// Construct an engine running the given optimization passes, with an
    /// otherwise-default configuration.
    pub fn with_options(opts: OptimizeOptions) -> Self {
        Self::with_config(EngineConfig::default().with_optimize_options(opts))
    }

    /// Construct an engine with a fully specified configuration.
    pub fn with_config(config: EngineConfig) -> Self {
        Self {
            bridge: CallBridge::new(config.optimize(), config.regcode_cache_capacity()),
            config,
        }
    }

    /// Compile `code`, sharing this engine's optimization options.
    pub fn compile(&self, code: &StackCode) -> CompileResult<Arc<RegCode>> {
        crate::compiler::compile(code, self.config.optimize())
    }

    /// Snapshot of every per-opcode and per-frame counter accumulated across
    /// every frame this engine's bridge has run to completion so far.
    #[cfg(feature = "profile")]
    pub fn profiler(&self) -> crate::profiler::Profiler {
        self.bridge.profiler()
    }

    /// Run `regcode` from its first instruction to completion, binding
    /// `args`/`kwargs` as its positional and keyword arguments. A generator's
    /// top-level body runs until its first suspension only if `regcode` is
    /// not itself a generator function — a bare script body is never a
    /// generator.
    pub fn run(
        &self,
        host: &mut H,
        regcode: &Arc<RegCode>,
        args: &[H::Handle],
        kwargs: &[(&str, H::Handle)],
        globals: H::Handle,
        builtins: Option<H::Handle>,
    ) -> EngineResult<H::Handle> {
        if regcode.register_count > self.config.max_register_count() {
            return Err(EngineError::new(ErrorKind::Internal, describe_message(ErrorKind::Internal)));
        }

        let registers = self
            .bridge
            .bind_args(host, regcode, args, kwargs)
            .map_err(|kind| EngineError::new(kind, describe_message(kind)))?;

        let mut cells = Vec::with_capacity(regcode.cell_count as usize);
        for _ in 0..regcode.cell_count {
            cells.push(host.none());
        }

        let function_name = regcode.name.clone();
        let mut frame = Frame::new(regcode.clone(), registers, cells, globals, builtins, function_name);
        let mut traceback = Vec::new();

        match evaluator::run_frame(host, &self.bridge, &mut frame, &mut traceback) {
            Ok(Completion::Return(v)) => Ok(v),
            Ok(Completion::Yield(v)) => {
                // A bare top-level body containing YIELD_VALUE is a
                // malformed entry point — the host should have called it as
                // a generator-producing callable instead. Release it rather
                // than leak it and report the same way as any other
                // internal invariant violation.
                host.decref(v);
                Err(EngineError::new(ErrorKind::Internal, describe_message(ErrorKind::Internal)))
            }
            Err(kind) => {
                let message = match frame.pending_error.take() {
                    Some(exc) => {
                        let rendered = host.to_display_string(exc).unwrap_or_else(|_| describe_message(kind));
                        host.decref(exc);
                        rendered
                    }
                    None => describe_message(kind),
                };
                let mut err = EngineError::new(kind, message);
                err.traceback = traceback;
                Err(err)
            }
        }
    }
}

impl<H: Host> Default for Engine<H> {
    fn default() -> Self {
        Self::new()
    }
}

/// A host-callable produced by [`Engine::wrap`]. Invoking it routes the call
/// through [`Engine::run`] — host re-entry for a native function that needs
/// to call back into engine-compiled code without going through a `CALL`
/// opcode of its own.
pub struct WrappedCallable<'e, H: Host> {
    engine: &'e Engine<H>,
    callable: H::Handle,
}

impl<'e, H: Host> WrappedCallable<'e, H> {
    /// Invoke the wrapped callable with `args`/`kwargs`, bound exactly as a
    /// `CALL_KW` would bind them.
    pub fn call(&self, host: &mut H, args: &[H::Handle], kwargs: &[(&str, H::Handle)]) -> crate::error::HostResult<H::Handle> {
        let regcode = self.engine.bridge.resolve(host, self.callable)?;
        let globals = host.callable_globals(self.callable);
        let builtins = host.builtins();
        self.engine
            .run(host, &regcode, args, kwargs, globals, builtins)
            .map_err(|err| err.kind)
    }
}

impl<H: Host> Engine<H> {
    /// Returns a host-callable that, when invoked, routes through [`Engine::run`]:
    /// the decorator a host-native function uses to call back into
    /// `callable` (already engine-compiled) as ordinary reentrant execution
    /// rather than reaching into the Call Bridge's cache directly.
    pub fn wrap(&self, callable: H::Handle) -> WrappedCallable<'_, H> {
        WrappedCallable { engine: self, callable }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::harness::ScriptHost;

    #[test]
    fn default_config_runs_a_fixture_to_completion() {
        let engine: Engine<ScriptHost> = Engine::new();
        let code = crate::harness::fixture("add").unwrap();
        let regcode = engine.compile(&code).unwrap();

        let mut host = ScriptHost::new();
        let a = host.make_int(1);
        let b = host.make_int(2);
        let globals = host.globals();
        let builtins = Some(host.builtins_handle());

        let result = engine.run(&mut host, &regcode, &[a, b], &[], globals, builtins).unwrap();
        assert_eq!(host.expect_int(result), 3);
        host.decref(result);
    }

    #[test]
    fn a_register_file_over_the_configured_ceiling_is_rejected() {
        let config = EngineConfig::default().with_max_register_count(0);
        let engine: Engine<ScriptHost> = Engine::with_config(config);
        let code = crate::harness::fixture("add").unwrap();
        let regcode = engine.compile(&code).unwrap();
        assert!(regcode.register_count > 0, "fixture is expected to need at least one register");

        let mut host = ScriptHost::new();
        let a = host.make_int(1);
        let b = host.make_int(2);
        let globals = host.globals();
        let builtins = Some(host.builtins_handle());

        let err = engine.run(&mut host, &regcode, &[a, b], &[], globals, builtins).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Internal);
    }
}
