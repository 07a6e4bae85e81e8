//! Object Protocol Shim (OPS)
//!
//! When this trait is implemented, the engine has everything it needs to
//! execute RegCode against the host's own object model: every arithmetic,
//! comparison, container, attribute, and call operation is a method the
//! embedder supplies, identically named to the host runtime's own number/
//! object protocol (`add` ~ `PyNumber_Add`, `get_item` ~ `PyObject_GetItem`,
//! and so on) so that implementing `Host` is a matter of forwarding to
//! whatever the host already has.

use std::fmt;
use std::sync::Arc;

use crate::error::{ErrorKind, HostResult};
use crate::frame::CodeId;
use crate::stackcode::StackCode;

/// A handle the engine holds opaquely and never inspects. The embedder's
/// `Handle` is typically a reference-counted pointer or interned index into
/// the host's own object table; the engine only ever copies it, compares it
/// for identity (`is_same`), and hands it back through `incref`/`decref`.
pub trait Handle: Copy + fmt::Debug {}

impl<T> Handle for T where T: Copy + fmt::Debug {}

/// Everything the Evaluator needs from the embedding host runtime.
///
/// Every operation that can fail reports an [`ErrorKind`] through
/// [`HostResult`] rather than a Rust error: the Evaluator treats OPS failures
/// as engine exceptions and drives its own block-stack unwind, not a native
/// `?`-propagated one.
pub trait Host {
    /// Opaque object handle type. The engine never constructs or destructs
    /// values of this type directly — only through `Host` methods.
    type Handle: Handle;

    // ---- reference counting -------------------------------------------

    /// Increment the refcount on `handle`. Called whenever the engine
    /// duplicates a handle into a second register or container slot.
    fn incref(&mut self, handle: Self::Handle);

    /// Decrement the refcount on `handle`, releasing it if it reaches zero.
    /// Called whenever a register, cell, or container slot holding `handle`
    /// is overwritten or goes out of scope.
    fn decref(&mut self, handle: Self::Handle);

    /// Identity comparison (`is` in the host's own terms), independent of
    /// `eq`/`ne`.
    fn is_same(&self, a: Self::Handle, b: Self::Handle) -> bool;

    // ---- singletons -----------------------------------------------------

    /// The host's `None`/`null`/unit singleton.
    fn none(&mut self) -> Self::Handle;

    /// The host's boolean singleton for `value`.
    fn bool_value(&mut self, value: bool) -> Self::Handle;

    /// Host truthiness test (`bool()` in the host's own terms).
    fn is_truthy(&mut self, handle: Self::Handle) -> HostResult<bool>;

    // ---- constant materialization -----------------------------------------

    /// Materialize a fixed-width integer constant.
    fn make_int(&mut self, value: i64) -> Self::Handle;
    /// Materialize an arbitrary-precision integer constant (the bignum-add
    /// scenario needs this for literals past 64 bits).
    fn make_bigint(&mut self, value: &num_bigint::BigInt) -> Self::Handle;
    /// Materialize a floating point constant.
    fn make_float(&mut self, value: f64) -> Self::Handle;

    // ---- arithmetic (PyNumber_* family) ---------------------------------

    /// Binary `+`.
    fn add(&mut self, a: Self::Handle, b: Self::Handle) -> HostResult<Self::Handle>;
    /// Binary `-`.
    fn sub(&mut self, a: Self::Handle, b: Self::Handle) -> HostResult<Self::Handle>;
    /// Binary `*`.
    fn mul(&mut self, a: Self::Handle, b: Self::Handle) -> HostResult<Self::Handle>;
    /// True division `/`.
    fn div(&mut self, a: Self::Handle, b: Self::Handle) -> HostResult<Self::Handle>;
    /// Floor division `//`.
    fn floor_div(&mut self, a: Self::Handle, b: Self::Handle) -> HostResult<Self::Handle>;
    /// Modulo `%`.
    fn modulo(&mut self, a: Self::Handle, b: Self::Handle) -> HostResult<Self::Handle>;
    /// Power `**`.
    fn pow(&mut self, a: Self::Handle, b: Self::Handle) -> HostResult<Self::Handle>;
    /// Unary `-`.
    fn negate(&mut self, a: Self::Handle) -> HostResult<Self::Handle>;
    /// Bitwise `&`.
    fn bit_and(&mut self, a: Self::Handle, b: Self::Handle) -> HostResult<Self::Handle>;
    /// Bitwise `|`.
    fn bit_or(&mut self, a: Self::Handle, b: Self::Handle) -> HostResult<Self::Handle>;
    /// Bitwise `^`.
    fn bit_xor(&mut self, a: Self::Handle, b: Self::Handle) -> HostResult<Self::Handle>;
    /// Left shift `<<`.
    fn lshift(&mut self, a: Self::Handle, b: Self::Handle) -> HostResult<Self::Handle>;
    /// Right shift `>>`.
    fn rshift(&mut self, a: Self::Handle, b: Self::Handle) -> HostResult<Self::Handle>;

    /// In-place variant of an arithmetic/bitwise op, e.g. `+=`. `op` names
    /// the base operation (`"add"`, `"sub"`, ...) the host should attempt to
    /// mutate in place before falling back to the non-inplace form.
    fn inplace(&mut self, op: &str, a: Self::Handle, b: Self::Handle) -> HostResult<Self::Handle>;

    // ---- comparisons ------------------------------------------------------

    /// `==`.
    fn eq(&mut self, a: Self::Handle, b: Self::Handle) -> HostResult<bool>;
    /// `!=`.
    fn ne(&mut self, a: Self::Handle, b: Self::Handle) -> HostResult<bool>;
    /// `<`.
    fn lt(&mut self, a: Self::Handle, b: Self::Handle) -> HostResult<bool>;
    /// `<=`.
    fn le(&mut self, a: Self::Handle, b: Self::Handle) -> HostResult<bool>;
    /// `>`.
    fn gt(&mut self, a: Self::Handle, b: Self::Handle) -> HostResult<bool>;
    /// `>=`.
    fn ge(&mut self, a: Self::Handle, b: Self::Handle) -> HostResult<bool>;
    /// Containment test, `b in a`.
    fn contains(&mut self, a: Self::Handle, b: Self::Handle) -> HostResult<bool>;
    /// Negated containment, `b not in a`. Default: negate [`Host::contains`].
    fn not_contains(&mut self, a: Self::Handle, b: Self::Handle) -> HostResult<bool> {
        Ok(!self.contains(a, b)?)
    }
    /// Negated identity, `a is not b`. Default: negate [`Host::is_same`].
    fn is_not_same(&self, a: Self::Handle, b: Self::Handle) -> bool {
        !self.is_same(a, b)
    }

    // ---- attributes ---------------------------------------------------

    /// `getattr(obj, name)`.
    fn get_attr(&mut self, obj: Self::Handle, name: &str) -> HostResult<Self::Handle>;
    /// `setattr(obj, name, value)`.
    fn set_attr(&mut self, obj: Self::Handle, name: &str, value: Self::Handle) -> HostResult<()>;
    /// `delattr(obj, name)`.
    fn del_attr(&mut self, obj: Self::Handle, name: &str) -> HostResult<()>;

    // ---- containers -----------------------------------------------------

    /// `obj[key]`.
    fn get_item(&mut self, obj: Self::Handle, key: Self::Handle) -> HostResult<Self::Handle>;
    /// `obj[key] = value`.
    fn set_item(&mut self, obj: Self::Handle, key: Self::Handle, value: Self::Handle) -> HostResult<()>;
    /// `del obj[key]`.
    fn del_item(&mut self, obj: Self::Handle, key: Self::Handle) -> HostResult<()>;
    /// Slice read, `obj[start:stop:step]`; any bound may be absent.
    fn get_slice(
        &mut self,
        obj: Self::Handle,
        start: Option<Self::Handle>,
        stop: Option<Self::Handle>,
        step: Option<Self::Handle>,
    ) -> HostResult<Self::Handle>;

    // ---- iteration ------------------------------------------------------

    /// `iter(obj)`.
    fn get_iter(&mut self, obj: Self::Handle) -> HostResult<Self::Handle>;
    /// `next(iterator)`. Returns `Err(ErrorKind::IterationStopped)` when the
    /// iterator is exhausted, which is not a user-catchable exception class
    /// of its own — only `FOR_ITER` inspects it.
    fn iter_next(&mut self, iterator: Self::Handle) -> HostResult<Self::Handle>;

    // ---- building sequences/mappings --------------------------------------

    /// Build a tuple/list-shaped sequence from `items`, in order.
    fn build_sequence(&mut self, items: &[Self::Handle]) -> HostResult<Self::Handle>;
    /// Build a mapping from alternating key/value pairs in `items`
    /// (`items.len()` is always even).
    fn build_mapping(&mut self, items: &[(Self::Handle, Self::Handle)]) -> HostResult<Self::Handle>;
    /// Unpack `obj` into exactly `count` values (a fixed-arity destructure,
    /// `a, b, c = obj`). Arity mismatch is a `BadArgument`.
    fn unpack_sequence(&mut self, obj: Self::Handle, count: usize) -> HostResult<Vec<Self::Handle>>;
    /// Enumerate `mapping`'s key/value pairs, the inverse of
    /// [`Host::build_mapping`] — used to unpack a `**kwargs` splat whose size
    /// isn't known until run time.
    fn mapping_items(&mut self, mapping: Self::Handle) -> HostResult<Vec<(Self::Handle, Self::Handle)>>;

    // ---- strings / constants ----------------------------------------------

    /// Intern or otherwise materialize a string constant for formatting and
    /// attribute/key lookups that need an owned handle.
    fn make_string(&mut self, value: &str) -> HostResult<Self::Handle>;
    /// Format `handle` the way the host's own `str()` would.
    fn to_display_string(&mut self, handle: Self::Handle) -> HostResult<String>;

    // ---- globals / builtins dict protocol ----------------------------------

    /// `globals[name]`, falling back to `builtins[name]` exactly as the host
    /// runtime's own `LOAD_GLOBAL` would.
    fn dict_get(&mut self, dict: Self::Handle, name: &str) -> HostResult<Self::Handle>;
    /// `dict[name] = value`.
    fn dict_set(&mut self, dict: Self::Handle, name: &str, value: Self::Handle) -> HostResult<()>;
    /// `name in dict`.
    fn dict_contains(&mut self, dict: Self::Handle, name: &str) -> HostResult<bool>;

    // ---- calls / construction ----------------------------------------------

    /// Invoke `callable(*args, **kwargs)` where `callable` is *not* itself
    /// engine-compiled RegCode (a builtin, a host-native function, a bound
    /// method implemented in the host). Engine-compiled callables are
    /// instead recursed into directly by the Call Bridge.
    fn call_host(
        &mut self,
        callable: Self::Handle,
        args: &[Self::Handle],
        kwargs: &[(&str, Self::Handle)],
    ) -> HostResult<Self::Handle>;

    /// `true` if `callable` is engine-compiled RegCode the Call Bridge should
    /// recurse into directly, rather than dispatching back through
    /// `call_host`.
    fn is_engine_callable(&mut self, callable: Self::Handle) -> bool;

    /// Identity the RegCode cache keys on, for an engine-compiled callable.
    /// Only meaningful when [`Host::is_engine_callable`] returned `true`.
    fn code_id(&mut self, callable: Self::Handle) -> CodeId;

    /// Fetch the host's own pre-compiled stack bytecode for `callable`, for
    /// the Call Bridge to run through [`crate::compiler::compile`] on a
    /// cache miss. Only meaningful when [`Host::is_engine_callable`]
    /// returned `true`; the Call Bridge calls this at most once per distinct
    /// `code_id`.
    fn stack_code(&mut self, callable: Self::Handle) -> Arc<StackCode>;

    /// `callable`'s captured free variables, in `RegCode::free_var_count`
    /// order — the Call Bridge copies these into the first `free_var_count`
    /// slots of the fresh `Frame::cells` array it prepares for a call; the
    /// remaining `cell_count - free_var_count` slots start unbound. Returns
    /// an empty vec for callables with no free variables.
    fn closure_cells(&mut self, callable: Self::Handle) -> Vec<Self::Handle>;

    /// Construct a host-visible callable wrapping `code` and the `cells` it
    /// captured from its defining frame (`MAKE_CLOSURE`'s runtime effect).
    /// The Call Bridge recognizes the result via `is_engine_callable` on any
    /// later `CALL`.
    fn make_closure(&mut self, code: Arc<crate::regcode::RegCode>, cells: Vec<Self::Handle>) -> Self::Handle;

    /// If `callable` already carries compiled [`RegCode`](crate::regcode::RegCode)
    /// — as a `MAKE_CLOSURE` result does, never having had a host-language
    /// code object of its own — return it directly and skip `stack_code`
    /// entirely. Only meaningful when [`Host::is_engine_callable`] returned
    /// `true`. Default `None`, the right answer for any callable backed by a
    /// genuine host code object still awaiting first compilation.
    fn compiled_regcode(&mut self, callable: Self::Handle) -> Option<Arc<crate::regcode::RegCode>> {
        let _ = callable;
        None
    }

    /// The globals mapping `callable` closes over. A fresh `Frame` for a
    /// call needs this since a callable may be defined in, and read globals
    /// from, a different module than its caller.
    fn callable_globals(&mut self, callable: Self::Handle) -> Self::Handle;

    /// The single builtins mapping consulted by `LOAD_GLOBAL` fallback
    /// across every frame. `None` if this host doesn't model a separate
    /// builtins namespace.
    fn builtins(&mut self) -> Option<Self::Handle>;

    /// Construct `class(*args, **kwargs)`.
    fn construct(
        &mut self,
        class: Self::Handle,
        args: &[Self::Handle],
        kwargs: &[(&str, Self::Handle)],
    ) -> HostResult<Self::Handle>;

    // ---- error channel ------------------------------------------------------

    /// Raise `exc` as the host would for a `RAISE` opcode or a propagating
    /// OPS failure; returns the [`ErrorKind`] tag the Evaluator should carry
    /// on its pending-error slot.
    fn raise(&mut self, exc: Self::Handle) -> ErrorKind;

    /// Build and raise a host exception of the given class name
    /// (`"TypeError"`, `"KeyError"`, ...) with `message`, returning the
    /// handle to the constructed exception object so it can be stored on
    /// the pending-error slot and re-raised or caught.
    fn make_exception(&mut self, class_name: &str, message: &str) -> Self::Handle;

    /// `true` if `exc` is an instance of the host exception class named
    /// `class_name`, used by exception-table matching in `EXCEPT` handlers.
    fn exception_matches(&mut self, exc: Self::Handle, class_name: &str) -> bool;

    // ---- generators -----------------------------------------------------

    /// Wrap an engine-owned suspended generator frame (identified by
    /// `state_id`, a key into the engine's own generator table) in a
    /// host-visible iterable object, the way the host's own generator
    /// objects wrap a suspended frame.
    fn make_generator(&mut self, state_id: u64) -> Self::Handle;

    /// If `handle` is one of this engine's own generator wrappers (from
    /// [`Host::make_generator`]), the `state_id` it wraps. `get_iter` and
    /// `iter_next` never see these directly — the Call Bridge intercepts
    /// them first and resumes the suspended frame itself — but the host
    /// still needs to recognize its own wrapper for `is`-identity and
    /// `repr()`.
    fn generator_state_id(&mut self, handle: Self::Handle) -> Option<u64>;
}
