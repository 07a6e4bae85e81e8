//! A minimal, self-contained [`Host`] implementation plus a handful of
//! hand-assembled [`StackCode`] bodies, used to exercise the engine
//! end-to-end without an embedding language runtime attached.
//!
//! `ScriptHost` is an arena of reference-counted [`Value`]s addressed by
//! opaque [`Handle`]s, mirroring the shape of a typical embedder's object
//! table closely enough to drive every `Host` method for real, but with no
//! ambition to be a general-purpose object model: attributes only exist on
//! [`Value::Namespace`], there is no class system, and arithmetic only
//! covers the numeric towers the fixtures below actually need.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use num_bigint::BigInt;
use num_traits::ToPrimitive;

use crate::error::{ErrorKind, HostResult};
use crate::frame::CodeId;
use crate::host::Host;
use crate::regcode::{Arity, RegCode};
use crate::stackcode::{StackCode, StackConstant, StackOp};

/// An index into [`ScriptHost::slots`]. `Copy` and cheap to pass around, the
/// way an embedder's own tagged pointer or interned id would be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handle(u32);

struct Slot {
    value: Value,
    refcount: u32,
}

/// Every value `ScriptHost` can hold. Deliberately small: just enough object
/// shapes to run the fixtures in this module and the programs
/// `SPEC_FULL.md`'s scenarios describe.
#[derive(Debug, Clone)]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    BigInt(BigInt),
    Float(f64),
    Str(String),
    Tuple(Vec<Handle>),
    List(Vec<Handle>),
    Mapping(Vec<(Handle, Handle)>),
    Namespace(HashMap<String, Handle>),
    Exception { class: String, message: String },
    /// A host-native function, dispatched by name in [`ScriptHost::call_host`].
    Native(&'static str),
    /// A `MAKE_CLOSURE` result: compiled body plus captured cells.
    Closure { code: Arc<RegCode>, cells: Vec<Handle> },
    Range { start: i64, stop: i64 },
    RangeIter { next: i64, stop: i64 },
    SeqIter { items: Vec<Handle>, index: usize },
    /// Wraps an engine-owned suspended generator frame, keyed by the Call
    /// Bridge's `state_id`.
    Generator(u64),
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::None => write!(f, "None"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::BigInt(b) => write!(f, "{b}"),
            Value::Float(x) => write!(f, "{x}"),
            Value::Str(s) => write!(f, "{s}"),
            Value::Tuple(items) => write!(f, "<tuple of {}>", items.len()),
            Value::List(items) => write!(f, "<list of {}>", items.len()),
            Value::Mapping(pairs) => write!(f, "<mapping of {}>", pairs.len()),
            Value::Namespace(_) => write!(f, "<namespace>"),
            Value::Exception { class, message } => write!(f, "{class}: {message}"),
            Value::Native(name) => write!(f, "<native {name}>"),
            Value::Closure { .. } => write!(f, "<closure>"),
            Value::Range { start, stop } => write!(f, "range({start}, {stop})"),
            Value::RangeIter { .. } => write!(f, "<range iterator>"),
            Value::SeqIter { .. } => write!(f, "<sequence iterator>"),
            Value::Generator(id) => write!(f, "<generator {id}>"),
        }
    }
}

/// An arena-backed reference-counting `Host`. Everything lives in `slots`;
/// a freed slot's index is recycled from `free` before the arena grows.
pub struct ScriptHost {
    slots: Vec<Option<Slot>>,
    free: Vec<usize>,
    none_handle: Handle,
    true_handle: Handle,
    false_handle: Handle,
    globals: Handle,
    builtins: Handle,
    /// Captured `print`-style output, so fixtures with observable side
    /// effects (`fannkuch`) are testable without a real stdout.
    output: Vec<String>,
}

impl ScriptHost {
    pub fn new() -> Self {
        let mut host = ScriptHost {
            slots: Vec::new(),
            free: Vec::new(),
            none_handle: Handle(0),
            true_handle: Handle(0),
            false_handle: Handle(0),
            globals: Handle(0),
            builtins: Handle(0),
            output: Vec::new(),
        };
        host.none_handle = host.alloc(Value::None);
        host.true_handle = host.alloc(Value::Bool(true));
        host.false_handle = host.alloc(Value::Bool(false));
        host.globals = host.alloc(Value::Namespace(HashMap::new()));

        let mut builtins = HashMap::new();
        builtins.insert("range".to_string(), host.alloc(Value::Native("range")));
        builtins.insert("_qs_native".to_string(), host.alloc(Value::Native("_qs_native")));
        builtins.insert(
            "_fannkuch_native".to_string(),
            host.alloc(Value::Native("_fannkuch_native")),
        );
        host.builtins = host.alloc(Value::Namespace(builtins));
        host
    }

    fn alloc(&mut self, value: Value) -> Handle {
        let slot = Slot { value, refcount: 1 };
        if let Some(idx) = self.free.pop() {
            self.slots[idx] = Some(slot);
            Handle(idx as u32)
        } else {
            self.slots.push(Some(slot));
            Handle((self.slots.len() - 1) as u32)
        }
    }

    fn slot(&self, h: Handle) -> &Slot {
        self.slots[h.0 as usize].as_ref().expect("use of a freed handle")
    }

    pub fn value(&self, h: Handle) -> &Value {
        &self.slot(h).value
    }

    pub fn globals(&self) -> Handle {
        self.globals
    }

    pub fn builtins_handle(&self) -> Handle {
        self.builtins
    }

    pub fn output(&self) -> &[String] {
        &self.output
    }

    /// Build a fresh, owned tuple handle from already-unowned values the
    /// caller is handing off (test/CLI convenience; does not incref its
    /// inputs since it takes ownership of them).
    pub fn make_tuple(&mut self, items: Vec<Handle>) -> Handle {
        self.alloc(Value::Tuple(items))
    }

    pub fn make_list(&mut self, items: Vec<Handle>) -> Handle {
        self.alloc(Value::List(items))
    }

    pub fn make_int(&mut self, v: i64) -> Handle {
        <Self as Host>::make_int(self, v)
    }

    pub fn make_bigint_from(&mut self, v: BigInt) -> Handle {
        self.alloc(Value::BigInt(v))
    }

    pub fn make_str(&mut self, v: &str) -> Handle {
        self.alloc(Value::Str(v.to_string()))
    }

    /// Read an `Int`/`Bool` handle back out as an `i64`, for test assertions.
    pub fn expect_int(&self, h: Handle) -> i64 {
        match self.value(h) {
            Value::Int(i) => *i,
            Value::Bool(b) => *b as i64,
            other => panic!("expected an int, found {other}"),
        }
    }

    pub fn expect_str(&self, h: Handle) -> &str {
        match self.value(h) {
            Value::Str(s) => s,
            other => panic!("expected a str, found {other}"),
        }
    }

    fn as_bigint(&self, h: Handle) -> Option<BigInt> {
        match self.value(h) {
            Value::Int(i) => Some(BigInt::from(*i)),
            Value::BigInt(b) => Some(b.clone()),
            Value::Bool(b) => Some(BigInt::from(*b as i64)),
            _ => None,
        }
    }

    fn as_f64(&self, h: Handle) -> Option<f64> {
        match self.value(h) {
            Value::Int(i) => Some(*i as f64),
            Value::Bool(b) => Some(*b as i64 as f64),
            Value::BigInt(b) => b.to_f64(),
            Value::Float(x) => Some(*x),
            _ => None,
        }
    }

    fn as_i64(&self, h: Handle) -> HostResult<i64> {
        match self.value(h) {
            Value::Int(i) => Ok(*i),
            Value::Bool(b) => Ok(*b as i64),
            _ => Err(ErrorKind::TypeMismatch),
        }
    }

    fn is_float(&self, h: Handle) -> bool {
        matches!(self.value(h), Value::Float(_))
    }

    fn bigint_arith(&mut self, a: Handle, b: Handle, f: impl Fn(BigInt, BigInt) -> BigInt) -> HostResult<Handle> {
        let (x, y) = (self.as_bigint(a).ok_or(ErrorKind::TypeMismatch)?, self.as_bigint(b).ok_or(ErrorKind::TypeMismatch)?);
        Ok(self.normalize_bigint(f(x, y)))
    }

    /// Demote back to a fixed-width `Int` when the value fits, the way a
    /// host numeric tower normally does after a bignum operation.
    fn normalize_bigint(&mut self, v: BigInt) -> Handle {
        match v.to_i64() {
            Some(i) => self.alloc(Value::Int(i)),
            None => self.alloc(Value::BigInt(v)),
        }
    }

    fn cmp_numeric(&self, a: Handle, b: Handle) -> Option<std::cmp::Ordering> {
        if self.is_float(a) || self.is_float(b) {
            let (x, y) = (self.as_f64(a)?, self.as_f64(b)?);
            x.partial_cmp(&y)
        } else {
            let (x, y) = (self.as_bigint(a)?, self.as_bigint(b)?);
            Some(x.cmp(&y))
        }
    }

    fn values_equal(&self, a: Handle, b: Handle) -> HostResult<bool> {
        Ok(match (self.value(a), self.value(b)) {
            (Value::None, Value::None) => true,
            (Value::Str(x), Value::Str(y)) => x == y,
            (Value::Tuple(x), Value::Tuple(y)) | (Value::List(x), Value::List(y)) => {
                if x.len() != y.len() {
                    false
                } else {
                    let (x, y) = (x.clone(), y.clone());
                    let mut eq = true;
                    for (xi, yi) in x.iter().zip(y.iter()) {
                        if !self.values_equal(*xi, *yi)? {
                            eq = false;
                            break;
                        }
                    }
                    eq
                }
            }
            _ => match self.cmp_numeric(a, b) {
                Some(ord) => ord == std::cmp::Ordering::Equal,
                None => false,
            },
        })
    }

    fn compare(&self, a: Handle, b: Handle) -> HostResult<std::cmp::Ordering> {
        if let (Value::Str(x), Value::Str(y)) = (self.value(a), self.value(b)) {
            return Ok(x.cmp(y));
        }
        self.cmp_numeric(a, b).ok_or(ErrorKind::TypeMismatch)
    }

    fn normalize_index(idx: i64, len: usize) -> Option<usize> {
        let resolved = if idx < 0 { idx + len as i64 } else { idx };
        if resolved < 0 || resolved as usize >= len {
            None
        } else {
            Some(resolved as usize)
        }
    }

    // ---- native builtins -------------------------------------------------

    fn native_range(&mut self, args: &[Handle]) -> HostResult<Handle> {
        let (start, stop) = match args.len() {
            1 => (0, self.as_i64(args[0])?),
            2 => (self.as_i64(args[0])?, self.as_i64(args[1])?),
            _ => return Err(ErrorKind::BadArgument),
        };
        Ok(self.alloc(Value::Range { start, stop }))
    }

    fn native_qs(&mut self, args: &[Handle]) -> HostResult<Handle> {
        if args.len() != 1 {
            return Err(ErrorKind::BadArgument);
        }
        let mut items = match self.value(args[0]) {
            Value::List(items) => items.clone(),
            Value::Tuple(items) => items.clone(),
            _ => return Err(ErrorKind::TypeMismatch),
        };
        for &h in &items {
            self.incref(h);
        }
        self.quicksort(&mut items)?;
        Ok(self.alloc(Value::List(items)))
    }

    /// Three-way (Dutch flag) quicksort, partitioning around the first
    /// element so repeated values sort into the middle in one pass.
    fn quicksort(&mut self, items: &mut Vec<Handle>) -> HostResult<()> {
        if items.len() <= 1 {
            return Ok(());
        }
        let pivot = items[0];
        let mut less = Vec::new();
        let mut equal = Vec::new();
        let mut greater = Vec::new();
        for &h in items.iter() {
            match self.compare(h, pivot)? {
                std::cmp::Ordering::Less => less.push(h),
                std::cmp::Ordering::Equal => equal.push(h),
                std::cmp::Ordering::Greater => greater.push(h),
            }
        }
        self.quicksort(&mut less)?;
        self.quicksort(&mut greater)?;
        items.clear();
        items.extend(less);
        items.extend(equal);
        items.extend(greater);
        Ok(())
    }

    fn native_fannkuch(&mut self, args: &[Handle]) -> HostResult<Handle> {
        if args.len() != 1 {
            return Err(ErrorKind::BadArgument);
        }
        let n = self.as_i64(args[0])?;
        if n < 0 {
            return Err(ErrorKind::BadArgument);
        }
        let (checksum, max_flips) = fannkuch_checksum(n as usize);
        self.output.push(format!("Pfannkuchen({n}) = {max_flips}"));
        Ok(self.alloc(Value::Int(checksum)))
    }
}

impl Default for ScriptHost {
    fn default() -> Self {
        Self::new()
    }
}

/// Exponentiation by squaring; avoids depending on a particular bignum
/// crate's own `pow` surface.
fn bigint_pow(mut base: BigInt, mut exp: u32) -> BigInt {
    let mut result = BigInt::from(1);
    while exp > 0 {
        if exp & 1 == 1 {
            result = &result * &base;
        }
        base = &base * &base;
        exp >>= 1;
    }
    result
}

/// The classic "plain changes" fannkuch-redux algorithm: generate every
/// permutation of `0..n` via repeated rotate-and-count, pancake-flip each
/// back to having `0` first, and accumulate a sign-alternating checksum.
/// `fannkuch_checksum(7) == (228, 16)`, the published benchmark result.
fn fannkuch_checksum(n: usize) -> (i64, u32) {
    if n == 0 {
        return (0, 0);
    }
    let mut perm1: Vec<usize> = (0..n).collect();
    let mut count: Vec<usize> = (0..n).collect();
    let mut perm = vec![0usize; n];
    let mut max_flips = 0u32;
    let mut checksum = 0i64;
    let mut perm_count = 0i64;
    let mut r = n;

    loop {
        while r != 1 {
            count[r - 1] = r;
            r -= 1;
        }

        perm.copy_from_slice(&perm1);
        let mut flips = 0u32;
        let mut k = perm[0];
        while k != 0 {
            perm[0..=k].reverse();
            flips += 1;
            k = perm[0];
        }
        if flips > max_flips {
            max_flips = flips;
        }
        checksum += if perm_count % 2 == 0 { flips as i64 } else { -(flips as i64) };

        loop {
            if r == n {
                return (checksum, max_flips);
            }
            let first = perm1[0];
            for i in 0..r {
                perm1[i] = perm1[i + 1];
            }
            perm1[r] = first;
            count[r] -= 1;
            if count[r] > 0 {
                break;
            }
            r += 1;
        }
        perm_count += 1;
    }
}

impl Host for ScriptHost {
    type Handle = Handle;

    fn incref(&mut self, handle: Self::Handle) {
        self.slots[handle.0 as usize].as_mut().expect("use of a freed handle").refcount += 1;
    }

    fn decref(&mut self, handle: Self::Handle) {
        let idx = handle.0 as usize;
        let refcount = {
            let slot = self.slots[idx].as_mut().expect("double free");
            slot.refcount -= 1;
            slot.refcount
        };
        if refcount > 0 {
            return;
        }
        let value = self.slots[idx].take().expect("double free").value;
        self.free.push(idx);
        match value {
            Value::Tuple(items) | Value::List(items) => {
                for h in items {
                    self.decref(h);
                }
            }
            Value::Mapping(pairs) => {
                for (k, v) in pairs {
                    self.decref(k);
                    self.decref(v);
                }
            }
            Value::Namespace(entries) => {
                for (_, h) in entries {
                    self.decref(h);
                }
            }
            Value::Closure { cells, .. } => {
                for h in cells {
                    self.decref(h);
                }
            }
            Value::SeqIter { items, index } => {
                for h in items.into_iter().skip(index) {
                    self.decref(h);
                }
            }
            _ => {}
        }
    }

    fn is_same(&self, a: Self::Handle, b: Self::Handle) -> bool {
        a.0 == b.0
    }

    fn none(&mut self) -> Self::Handle {
        self.incref(self.none_handle);
        self.none_handle
    }

    fn bool_value(&mut self, value: bool) -> Self::Handle {
        let h = if value { self.true_handle } else { self.false_handle };
        self.incref(h);
        h
    }

    fn is_truthy(&mut self, handle: Self::Handle) -> HostResult<bool> {
        Ok(match self.value(handle) {
            Value::None => false,
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::BigInt(b) => !b.eq(&BigInt::from(0)),
            Value::Float(x) => *x != 0.0,
            Value::Str(s) => !s.is_empty(),
            Value::Tuple(v) | Value::List(v) => !v.is_empty(),
            Value::Mapping(v) => !v.is_empty(),
            _ => true,
        })
    }

    fn make_int(&mut self, value: i64) -> Self::Handle {
        self.alloc(Value::Int(value))
    }

    fn make_bigint(&mut self, value: &BigInt) -> Self::Handle {
        self.normalize_bigint(value.clone())
    }

    fn make_float(&mut self, value: f64) -> Self::Handle {
        self.alloc(Value::Float(value))
    }

    fn add(&mut self, a: Self::Handle, b: Self::Handle) -> HostResult<Self::Handle> {
        if let (Value::Str(x), Value::Str(y)) = (self.value(a), self.value(b)) {
            return Ok(self.alloc(Value::Str(format!("{x}{y}"))));
        }
        if let (Value::List(x), Value::List(y)) = (self.value(a), self.value(b)) {
            let (x, y) = (x.clone(), y.clone());
            let mut combined = Vec::with_capacity(x.len() + y.len());
            for h in x.into_iter().chain(y) {
                self.incref(h);
                combined.push(h);
            }
            return Ok(self.alloc(Value::List(combined)));
        }
        if self.is_float(a) || self.is_float(b) {
            let (x, y) = (self.as_f64(a).ok_or(ErrorKind::TypeMismatch)?, self.as_f64(b).ok_or(ErrorKind::TypeMismatch)?);
            return Ok(self.alloc(Value::Float(x + y)));
        }
        if let (Value::Int(x), Value::Int(y)) = (self.value(a), self.value(b)) {
            if let Some(sum) = x.checked_add(*y) {
                return Ok(self.alloc(Value::Int(sum)));
            }
        }
        self.bigint_arith(a, b, |x, y| x + y)
    }

    fn sub(&mut self, a: Self::Handle, b: Self::Handle) -> HostResult<Self::Handle> {
        if self.is_float(a) || self.is_float(b) {
            let (x, y) = (self.as_f64(a).ok_or(ErrorKind::TypeMismatch)?, self.as_f64(b).ok_or(ErrorKind::TypeMismatch)?);
            return Ok(self.alloc(Value::Float(x - y)));
        }
        if let (Value::Int(x), Value::Int(y)) = (self.value(a), self.value(b)) {
            if let Some(diff) = x.checked_sub(*y) {
                return Ok(self.alloc(Value::Int(diff)));
            }
        }
        self.bigint_arith(a, b, |x, y| x - y)
    }

    fn mul(&mut self, a: Self::Handle, b: Self::Handle) -> HostResult<Self::Handle> {
        if self.is_float(a) || self.is_float(b) {
            let (x, y) = (self.as_f64(a).ok_or(ErrorKind::TypeMismatch)?, self.as_f64(b).ok_or(ErrorKind::TypeMismatch)?);
            return Ok(self.alloc(Value::Float(x * y)));
        }
        if let (Value::Int(x), Value::Int(y)) = (self.value(a), self.value(b)) {
            if let Some(prod) = x.checked_mul(*y) {
                return Ok(self.alloc(Value::Int(prod)));
            }
        }
        self.bigint_arith(a, b, |x, y| x * y)
    }

    fn div(&mut self, a: Self::Handle, b: Self::Handle) -> HostResult<Self::Handle> {
        let (x, y) = (self.as_f64(a).ok_or(ErrorKind::TypeMismatch)?, self.as_f64(b).ok_or(ErrorKind::TypeMismatch)?);
        if y == 0.0 {
            return Err(ErrorKind::ArithmeticError);
        }
        Ok(self.alloc(Value::Float(x / y)))
    }

    fn floor_div(&mut self, a: Self::Handle, b: Self::Handle) -> HostResult<Self::Handle> {
        if let (Value::Int(x), Value::Int(y)) = (self.value(a), self.value(b)) {
            let (x, y) = (*x, *y);
            if y == 0 {
                return Err(ErrorKind::ArithmeticError);
            }
            return Ok(self.alloc(Value::Int(x.div_euclid(y))));
        }
        let (x, y) = (self.as_bigint(a).ok_or(ErrorKind::TypeMismatch)?, self.as_bigint(b).ok_or(ErrorKind::TypeMismatch)?);
        if y == BigInt::from(0) {
            return Err(ErrorKind::ArithmeticError);
        }
        Ok(self.normalize_bigint(x / y))
    }

    fn modulo(&mut self, a: Self::Handle, b: Self::Handle) -> HostResult<Self::Handle> {
        if let (Value::Int(x), Value::Int(y)) = (self.value(a), self.value(b)) {
            let (x, y) = (*x, *y);
            if y == 0 {
                return Err(ErrorKind::ArithmeticError);
            }
            return Ok(self.alloc(Value::Int(x.rem_euclid(y))));
        }
        let (x, y) = (self.as_bigint(a).ok_or(ErrorKind::TypeMismatch)?, self.as_bigint(b).ok_or(ErrorKind::TypeMismatch)?);
        if y == BigInt::from(0) {
            return Err(ErrorKind::ArithmeticError);
        }
        Ok(self.normalize_bigint(x % y))
    }

    fn pow(&mut self, a: Self::Handle, b: Self::Handle) -> HostResult<Self::Handle> {
        if self.is_float(a) || self.is_float(b) {
            let (x, y) = (self.as_f64(a).ok_or(ErrorKind::TypeMismatch)?, self.as_f64(b).ok_or(ErrorKind::TypeMismatch)?);
            return Ok(self.alloc(Value::Float(x.powf(y))));
        }
        let exp = self.as_i64(b)?;
        if exp < 0 {
            let (x, y) = (self.as_f64(a).ok_or(ErrorKind::TypeMismatch)?, exp);
            return Ok(self.alloc(Value::Float(x.powi(y as i32))));
        }
        let base = self.as_bigint(a).ok_or(ErrorKind::TypeMismatch)?;
        Ok(self.normalize_bigint(bigint_pow(base, exp as u32)))
    }

    fn negate(&mut self, a: Self::Handle) -> HostResult<Self::Handle> {
        Ok(match self.value(a) {
            Value::Int(i) => match i.checked_neg() {
                Some(n) => self.alloc(Value::Int(n)),
                None => self.normalize_bigint(-BigInt::from(*i)),
            },
            Value::BigInt(b) => self.normalize_bigint(-b.clone()),
            Value::Float(x) => self.alloc(Value::Float(-x)),
            Value::Bool(b) => self.alloc(Value::Int(-(*b as i64))),
            _ => return Err(ErrorKind::TypeMismatch),
        })
    }

    fn bit_and(&mut self, a: Self::Handle, b: Self::Handle) -> HostResult<Self::Handle> {
        Ok(self.alloc(Value::Int(self.as_i64(a)? & self.as_i64(b)?)))
    }

    fn bit_or(&mut self, a: Self::Handle, b: Self::Handle) -> HostResult<Self::Handle> {
        Ok(self.alloc(Value::Int(self.as_i64(a)? | self.as_i64(b)?)))
    }

    fn bit_xor(&mut self, a: Self::Handle, b: Self::Handle) -> HostResult<Self::Handle> {
        Ok(self.alloc(Value::Int(self.as_i64(a)? ^ self.as_i64(b)?)))
    }

    fn lshift(&mut self, a: Self::Handle, b: Self::Handle) -> HostResult<Self::Handle> {
        let shift = self.as_i64(b)?;
        if !(0..64).contains(&shift) {
            return Err(ErrorKind::ArithmeticError);
        }
        Ok(self.alloc(Value::Int(self.as_i64(a)? << shift)))
    }

    fn rshift(&mut self, a: Self::Handle, b: Self::Handle) -> HostResult<Self::Handle> {
        let shift = self.as_i64(b)?;
        if !(0..64).contains(&shift) {
            return Err(ErrorKind::ArithmeticError);
        }
        Ok(self.alloc(Value::Int(self.as_i64(a)? >> shift)))
    }

    fn inplace(&mut self, op: &str, a: Self::Handle, b: Self::Handle) -> HostResult<Self::Handle> {
        match op {
            "+" => self.add(a, b),
            "-" => self.sub(a, b),
            "*" => self.mul(a, b),
            "/" => self.div(a, b),
            "//" => self.floor_div(a, b),
            "%" => self.modulo(a, b),
            "**" => self.pow(a, b),
            "&" => self.bit_and(a, b),
            "|" => self.bit_or(a, b),
            "^" => self.bit_xor(a, b),
            "<<" => self.lshift(a, b),
            ">>" => self.rshift(a, b),
            _ => Err(ErrorKind::Internal),
        }
    }

    fn eq(&mut self, a: Self::Handle, b: Self::Handle) -> HostResult<bool> {
        self.values_equal(a, b)
    }

    fn ne(&mut self, a: Self::Handle, b: Self::Handle) -> HostResult<bool> {
        Ok(!self.values_equal(a, b)?)
    }

    fn lt(&mut self, a: Self::Handle, b: Self::Handle) -> HostResult<bool> {
        Ok(self.compare(a, b)? == std::cmp::Ordering::Less)
    }

    fn le(&mut self, a: Self::Handle, b: Self::Handle) -> HostResult<bool> {
        Ok(self.compare(a, b)? != std::cmp::Ordering::Greater)
    }

    fn gt(&mut self, a: Self::Handle, b: Self::Handle) -> HostResult<bool> {
        Ok(self.compare(a, b)? == std::cmp::Ordering::Greater)
    }

    fn ge(&mut self, a: Self::Handle, b: Self::Handle) -> HostResult<bool> {
        Ok(self.compare(a, b)? != std::cmp::Ordering::Less)
    }

    fn contains(&mut self, a: Self::Handle, b: Self::Handle) -> HostResult<bool> {
        match self.value(a) {
            Value::Tuple(items) | Value::List(items) => {
                let items = items.clone();
                for h in items {
                    if self.values_equal(h, b)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            Value::Mapping(pairs) => {
                let pairs = pairs.clone();
                for (k, _) in pairs {
                    if self.values_equal(k, b)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            Value::Str(haystack) => match self.value(b) {
                Value::Str(needle) => Ok(haystack.contains(needle.as_str())),
                _ => Err(ErrorKind::TypeMismatch),
            },
            _ => Err(ErrorKind::TypeMismatch),
        }
    }

    fn get_attr(&mut self, obj: Self::Handle, name: &str) -> HostResult<Self::Handle> {
        match self.value(obj) {
            Value::Namespace(entries) => match entries.get(name) {
                Some(h) => {
                    let h = *h;
                    self.incref(h);
                    Ok(h)
                }
                None => Err(ErrorKind::AttributeMissing),
            },
            _ => Err(ErrorKind::AttributeMissing),
        }
    }

    fn set_attr(&mut self, obj: Self::Handle, name: &str, value: Self::Handle) -> HostResult<()> {
        let idx = obj.0 as usize;
        match &mut self.slots[idx].as_mut().expect("use of a freed handle").value {
            Value::Namespace(entries) => {
                if let Some(old) = entries.insert(name.to_string(), value) {
                    self.decref(old);
                }
                Ok(())
            }
            _ => Err(ErrorKind::TypeMismatch),
        }
    }

    fn del_attr(&mut self, obj: Self::Handle, name: &str) -> HostResult<()> {
        let idx = obj.0 as usize;
        let removed = match &mut self.slots[idx].as_mut().expect("use of a freed handle").value {
            Value::Namespace(entries) => entries.remove(name),
            _ => return Err(ErrorKind::TypeMismatch),
        };
        match removed {
            Some(h) => {
                self.decref(h);
                Ok(())
            }
            None => Err(ErrorKind::AttributeMissing),
        }
    }

    fn get_item(&mut self, obj: Self::Handle, key: Self::Handle) -> HostResult<Self::Handle> {
        match self.value(obj) {
            Value::List(items) | Value::Tuple(items) => {
                let idx = self.as_i64(key)?;
                let items = items.clone();
                let idx = Self::normalize_index(idx, items.len()).ok_or(ErrorKind::IndexOutOfRange)?;
                let h = items[idx];
                self.incref(h);
                Ok(h)
            }
            Value::Str(s) => {
                let idx = self.as_i64(key)?;
                let chars: Vec<char> = s.chars().collect();
                let idx = Self::normalize_index(idx, chars.len()).ok_or(ErrorKind::IndexOutOfRange)?;
                Ok(self.alloc(Value::Str(chars[idx].to_string())))
            }
            Value::Mapping(pairs) => {
                let pairs = pairs.clone();
                for (k, v) in pairs {
                    if self.values_equal(k, key)? {
                        self.incref(v);
                        return Ok(v);
                    }
                }
                Err(ErrorKind::KeyMissing)
            }
            _ => Err(ErrorKind::TypeMismatch),
        }
    }

    fn set_item(&mut self, obj: Self::Handle, key: Self::Handle, value: Self::Handle) -> HostResult<()> {
        match self.value(obj) {
            Value::List(_) => {
                let idx = self.as_i64(key)?;
                self.decref(key);
                let idx_usize = {
                    let Value::List(items) = self.value(obj) else { unreachable!() };
                    Self::normalize_index(idx, items.len())
                };
                let idx = idx_usize.ok_or(ErrorKind::IndexOutOfRange)?;
                let idx_raw = obj.0 as usize;
                let old = match &mut self.slots[idx_raw].as_mut().expect("use of a freed handle").value {
                    Value::List(items) => std::mem::replace(&mut items[idx], value),
                    _ => unreachable!(),
                };
                self.decref(old);
                Ok(())
            }
            Value::Mapping(_) => {
                let idx_raw = obj.0 as usize;
                let existing = match &self.slots[idx_raw].as_ref().expect("use of a freed handle").value {
                    Value::Mapping(pairs) => pairs.clone(),
                    _ => unreachable!(),
                };
                let mut replaced = None;
                for (i, (k, _)) in existing.iter().enumerate() {
                    if self.values_equal(*k, key)? {
                        replaced = Some(i);
                        break;
                    }
                }
                match replaced {
                    Some(i) => {
                        // The key already lives in the mapping; the freshly
                        // handed-in copy is redundant.
                        self.decref(key);
                        let old_value = match &mut self.slots[idx_raw].as_mut().expect("use of a freed handle").value {
                            Value::Mapping(pairs) => std::mem::replace(&mut pairs[i].1, value),
                            _ => unreachable!(),
                        };
                        self.decref(old_value);
                    }
                    None => match &mut self.slots[idx_raw].as_mut().expect("use of a freed handle").value {
                        Value::Mapping(pairs) => pairs.push((key, value)),
                        _ => unreachable!(),
                    },
                }
                Ok(())
            }
            Value::Tuple(_) => {
                self.decref(key);
                self.decref(value);
                Err(ErrorKind::TypeMismatch)
            }
            _ => {
                self.decref(key);
                self.decref(value);
                Err(ErrorKind::TypeMismatch)
            }
        }
    }

    fn del_item(&mut self, obj: Self::Handle, key: Self::Handle) -> HostResult<()> {
        match self.value(obj) {
            Value::List(_) => {
                let idx = self.as_i64(key)?;
                let idx_raw = obj.0 as usize;
                let removed = {
                    let Value::List(items) = &self.slots[idx_raw].as_ref().unwrap().value else { unreachable!() };
                    Self::normalize_index(idx, items.len())
                };
                let idx = removed.ok_or(ErrorKind::IndexOutOfRange)?;
                let old = match &mut self.slots[idx_raw].as_mut().unwrap().value {
                    Value::List(items) => items.remove(idx),
                    _ => unreachable!(),
                };
                self.decref(old);
                Ok(())
            }
            Value::Mapping(_) => {
                let idx_raw = obj.0 as usize;
                let pairs = match &self.slots[idx_raw].as_ref().unwrap().value {
                    Value::Mapping(pairs) => pairs.clone(),
                    _ => unreachable!(),
                };
                let mut found = None;
                for (i, (k, _)) in pairs.iter().enumerate() {
                    if self.values_equal(*k, key)? {
                        found = Some(i);
                        break;
                    }
                }
                let i = found.ok_or(ErrorKind::KeyMissing)?;
                let (k, v) = match &mut self.slots[idx_raw].as_mut().unwrap().value {
                    Value::Mapping(pairs) => pairs.remove(i),
                    _ => unreachable!(),
                };
                self.decref(k);
                self.decref(v);
                Ok(())
            }
            _ => Err(ErrorKind::TypeMismatch),
        }
    }

    fn get_slice(
        &mut self,
        obj: Self::Handle,
        start: Option<Self::Handle>,
        stop: Option<Self::Handle>,
        step: Option<Self::Handle>,
    ) -> HostResult<Self::Handle> {
        if let Some(step) = step {
            if self.as_i64(step)? != 1 {
                return Err(ErrorKind::TypeMismatch);
            }
        }
        let items = match self.value(obj) {
            Value::List(items) | Value::Tuple(items) => items.clone(),
            _ => return Err(ErrorKind::TypeMismatch),
        };
        let len = items.len() as i64;
        let start = start.map(|h| self.as_i64(h)).transpose()?.unwrap_or(0).clamp(0, len) as usize;
        let stop = stop.map(|h| self.as_i64(h)).transpose()?.unwrap_or(len).clamp(0, len) as usize;
        let stop = stop.max(start);
        let slice: Vec<Handle> = items[start..stop].to_vec();
        for h in &slice {
            self.incref(*h);
        }
        Ok(self.alloc(Value::List(slice)))
    }

    fn get_iter(&mut self, obj: Self::Handle) -> HostResult<Self::Handle> {
        match self.value(obj) {
            Value::Generator(_) => {
                self.incref(obj);
                Ok(obj)
            }
            Value::Range { start, stop } => {
                let (start, stop) = (*start, *stop);
                Ok(self.alloc(Value::RangeIter { next: start, stop }))
            }
            Value::List(items) | Value::Tuple(items) => {
                let items = items.clone();
                for h in &items {
                    self.incref(*h);
                }
                Ok(self.alloc(Value::SeqIter { items, index: 0 }))
            }
            _ => Err(ErrorKind::TypeMismatch),
        }
    }

    fn iter_next(&mut self, iterator: Self::Handle) -> HostResult<Self::Handle> {
        match self.value(iterator) {
            Value::RangeIter { next, stop } => {
                let (next, stop) = (*next, *stop);
                if next >= stop {
                    return Err(ErrorKind::IterationStopped);
                }
                let idx = iterator.0 as usize;
                match &mut self.slots[idx].as_mut().unwrap().value {
                    Value::RangeIter { next, .. } => *next += 1,
                    _ => unreachable!(),
                }
                Ok(self.alloc(Value::Int(next)))
            }
            Value::SeqIter { items, index } => {
                if *index >= items.len() {
                    return Err(ErrorKind::IterationStopped);
                }
                let h = items[*index];
                let idx = iterator.0 as usize;
                match &mut self.slots[idx].as_mut().unwrap().value {
                    Value::SeqIter { index, .. } => *index += 1,
                    _ => unreachable!(),
                }
                self.incref(h);
                Ok(h)
            }
            _ => Err(ErrorKind::TypeMismatch),
        }
    }

    fn build_sequence(&mut self, items: &[Self::Handle]) -> HostResult<Self::Handle> {
        Ok(self.alloc(Value::Tuple(items.to_vec())))
    }

    fn build_mapping(&mut self, items: &[(Self::Handle, Self::Handle)]) -> HostResult<Self::Handle> {
        Ok(self.alloc(Value::Mapping(items.to_vec())))
    }

    fn unpack_sequence(&mut self, obj: Self::Handle, count: usize) -> HostResult<Vec<Self::Handle>> {
        let items = match self.value(obj) {
            Value::Tuple(items) | Value::List(items) => items.clone(),
            _ => return Err(ErrorKind::TypeMismatch),
        };
        if items.len() != count {
            return Err(ErrorKind::BadArgument);
        }
        for h in &items {
            self.incref(*h);
        }
        // The register window a following run of `StoreFast`s reads is
        // consumed top-first, so the first name in program order needs the
        // sequence's first element on top.
        Ok(items.into_iter().rev().collect())
    }

    fn mapping_items(&mut self, mapping: Self::Handle) -> HostResult<Vec<(Self::Handle, Self::Handle)>> {
        match self.value(mapping) {
            Value::Mapping(pairs) => {
                let pairs = pairs.clone();
                for (k, v) in &pairs {
                    self.incref(*k);
                    self.incref(*v);
                }
                Ok(pairs)
            }
            _ => Err(ErrorKind::TypeMismatch),
        }
    }

    fn make_string(&mut self, value: &str) -> HostResult<Self::Handle> {
        Ok(self.alloc(Value::Str(value.to_string())))
    }

    fn to_display_string(&mut self, handle: Self::Handle) -> HostResult<String> {
        Ok(self.value(handle).to_string())
    }

    fn dict_get(&mut self, dict: Self::Handle, name: &str) -> HostResult<Self::Handle> {
        match self.value(dict) {
            Value::Namespace(entries) => match entries.get(name) {
                Some(h) => {
                    let h = *h;
                    self.incref(h);
                    Ok(h)
                }
                None => Err(ErrorKind::KeyMissing),
            },
            _ => Err(ErrorKind::TypeMismatch),
        }
    }

    fn dict_set(&mut self, dict: Self::Handle, name: &str, value: Self::Handle) -> HostResult<()> {
        let idx = dict.0 as usize;
        match &mut self.slots[idx].as_mut().expect("use of a freed handle").value {
            Value::Namespace(entries) => {
                if let Some(old) = entries.insert(name.to_string(), value) {
                    self.decref(old);
                }
                Ok(())
            }
            _ => Err(ErrorKind::TypeMismatch),
        }
    }

    fn dict_contains(&mut self, dict: Self::Handle, name: &str) -> HostResult<bool> {
        match self.value(dict) {
            Value::Namespace(entries) => Ok(entries.contains_key(name)),
            _ => Err(ErrorKind::TypeMismatch),
        }
    }

    fn call_host(
        &mut self,
        callable: Self::Handle,
        args: &[Self::Handle],
        _kwargs: &[(&str, Self::Handle)],
    ) -> HostResult<Self::Handle> {
        let name = match self.value(callable) {
            Value::Native(name) => *name,
            _ => return Err(ErrorKind::TypeMismatch),
        };
        match name {
            "range" => self.native_range(args),
            "_qs_native" => self.native_qs(args),
            "_fannkuch_native" => self.native_fannkuch(args),
            _ => Err(ErrorKind::Internal),
        }
    }

    fn is_engine_callable(&mut self, callable: Self::Handle) -> bool {
        matches!(self.value(callable), Value::Closure { .. })
    }

    fn code_id(&mut self, _callable: Self::Handle) -> CodeId {
        unreachable!("code_id is only meaningful for host code objects, and every callable this harness produces is already a MAKE_CLOSURE result resolved via compiled_regcode")
    }

    fn stack_code(&mut self, _callable: Self::Handle) -> Arc<StackCode> {
        unreachable!("stack_code is only meaningful for host code objects, and every callable this harness produces is already a MAKE_CLOSURE result resolved via compiled_regcode")
    }

    fn closure_cells(&mut self, callable: Self::Handle) -> Vec<Self::Handle> {
        match self.value(callable) {
            Value::Closure { cells, .. } => cells.clone(),
            _ => Vec::new(),
        }
    }

    fn make_closure(&mut self, code: Arc<RegCode>, cells: Vec<Self::Handle>) -> Self::Handle {
        self.alloc(Value::Closure { code, cells })
    }

    fn compiled_regcode(&mut self, callable: Self::Handle) -> Option<Arc<RegCode>> {
        match self.value(callable) {
            Value::Closure { code, .. } => Some(code.clone()),
            _ => None,
        }
    }

    fn callable_globals(&mut self, _callable: Self::Handle) -> Self::Handle {
        self.globals
    }

    fn builtins(&mut self) -> Option<Self::Handle> {
        Some(self.builtins)
    }

    fn construct(
        &mut self,
        _class: Self::Handle,
        _args: &[Self::Handle],
        _kwargs: &[(&str, Self::Handle)],
    ) -> HostResult<Self::Handle> {
        Err(ErrorKind::TypeMismatch)
    }

    fn raise(&mut self, exc: Self::Handle) -> ErrorKind {
        match self.value(exc) {
            Value::Exception { class, .. } => match class.as_str() {
                "IndexError" => ErrorKind::IndexOutOfRange,
                "KeyError" => ErrorKind::KeyMissing,
                "AttributeError" => ErrorKind::AttributeMissing,
                "TypeError" => ErrorKind::TypeMismatch,
                _ => ErrorKind::UserRaised,
            },
            _ => ErrorKind::UserRaised,
        }
    }

    fn make_exception(&mut self, class_name: &str, message: &str) -> Self::Handle {
        self.alloc(Value::Exception {
            class: class_name.to_string(),
            message: message.to_string(),
        })
    }

    fn exception_matches(&mut self, exc: Self::Handle, class_name: &str) -> bool {
        matches!(self.value(exc), Value::Exception { class, .. } if class == class_name)
    }

    fn make_generator(&mut self, state_id: u64) -> Self::Handle {
        self.alloc(Value::Generator(state_id))
    }

    fn generator_state_id(&mut self, handle: Self::Handle) -> Option<u64> {
        match self.value(handle) {
            Value::Generator(id) => Some(*id),
            _ => None,
        }
    }
}

fn arity(positional: u32) -> Arity {
    Arity {
        positional,
        param_names: (0..positional).map(|i| format!("arg{i}")).collect(),
        defaults: 0,
        has_varargs: false,
        has_varkwargs: false,
    }
}

fn lines(n: usize) -> Vec<crate::frame::SourceLine> {
    vec![crate::frame::SourceLine(1); n]
}

/// `add(a, b)`, exercising fixed-width, bignum, and string `+`.
pub fn add_body() -> StackCode {
    use StackOp::*;
    let instructions = vec![LoadFast(0), LoadFast(1), BinaryOp("+"), ReturnValue];
    StackCode {
        name: "add".to_string(),
        lines: lines(instructions.len()),
        instructions,
        constants: vec![],
        names: vec![],
        kwname_tables: vec![],
        local_count: 2,
        cell_count: 0,
        free_var_count: 0,
        arity: arity(2),
    }
}

/// `count_threshold(limit, threshold)`: counts `i > threshold` for
/// `i in range(limit)`.
pub fn count_threshold_body() -> StackCode {
    use StackOp::*;
    let instructions = vec![
        /* 0 */ LoadConst(0),
        /* 1 */ StoreFast(2),
        /* 2 */ SetupLoop(18),
        /* 3 */ LoadGlobal(0),
        /* 4 */ LoadFast(0),
        /* 5 */ CallFunction(1),
        /* 6 */ GetIter,
        /* 7 */ ForIter(18),
        /* 8 */ StoreFast(3),
        /* 9 */ LoadFast(3),
        /* 10 */ LoadFast(1),
        /* 11 */ BinaryOp(">"),
        /* 12 */ PopJumpIfFalse(17),
        /* 13 */ LoadFast(2),
        /* 14 */ LoadConst(1),
        /* 15 */ BinaryOp("+"),
        /* 16 */ StoreFast(2),
        /* 17 */ JumpAbsolute(7),
        /* 18 */ PopBlock,
        /* 19 */ LoadFast(2),
        /* 20 */ ReturnValue,
    ];
    StackCode {
        name: "count_threshold".to_string(),
        lines: lines(instructions.len()),
        instructions,
        constants: vec![StackConstant::Int(0), StackConstant::Int(1)],
        names: vec!["range".to_string()],
        kwname_tables: vec![],
        local_count: 4,
        cell_count: 0,
        free_var_count: 0,
        arity: arity(2),
    }
}

/// `unpack_first(t)`: returns `t`'s first element of a required 3-tuple.
/// Called with a differently-shaped tuple, `UNPACK_SEQUENCE`'s arity check
/// surfaces as `BadArgument`.
pub fn unpack_first_body() -> StackCode {
    use StackOp::*;
    let instructions = vec![
        /* 0 */ LoadFast(0),
        /* 1 */ UnpackSequence(3),
        /* 2 */ StoreFast(1),
        /* 3 */ StoreFast(2),
        /* 4 */ StoreFast(3),
        /* 5 */ LoadFast(1),
        /* 6 */ ReturnValue,
    ];
    StackCode {
        name: "unpack_first".to_string(),
        lines: lines(instructions.len()),
        instructions,
        constants: vec![],
        names: vec![],
        kwname_tables: vec![],
        local_count: 4,
        cell_count: 0,
        free_var_count: 0,
        arity: arity(1),
    }
}

/// `capture(t)`: `t[100] = 0` under a catch-all handler, returning `1` once
/// caught (a tuple is immutable, so the store fails with `TypeMismatch`;
/// an out-of-range list index would instead fail with `IndexOutOfRange` —
/// either is an equally valid way to exercise the unwind path here).
pub fn capture_body() -> StackCode {
    use StackOp::*;
    let instructions = vec![
        /* 0 */ SetupExcept(8),
        /* 1 */ LoadFast(0),
        /* 2 */ LoadConst(0),
        /* 3 */ LoadConst(1),
        /* 4 */ StoreSubscr,
        /* 5 */ PopBlock,
        /* 6 */ LoadConst(1),
        /* 7 */ ReturnValue,
        /* 8 */ EndExcept,
        /* 9 */ LoadConst(2),
        /* 10 */ ReturnValue,
    ];
    StackCode {
        name: "capture".to_string(),
        lines: lines(instructions.len()),
        instructions,
        constants: vec![StackConstant::Int(100), StackConstant::Int(0), StackConstant::Int(1)],
        names: vec![],
        kwname_tables: vec![],
        local_count: 1,
        cell_count: 0,
        free_var_count: 0,
        arity: arity(1),
    }
}

/// The inner closure body for `nested_closure`: `return c + c` over a
/// single captured cell.
fn nested_closure_inner() -> StackCode {
    use StackOp::*;
    let instructions = vec![
        /* 0 */ LoadDeref(0),
        /* 1 */ LoadDeref(0),
        /* 2 */ BinaryOp("+"),
        /* 3 */ ReturnValue,
    ];
    StackCode {
        name: "nested_closure.<locals>.inner".to_string(),
        lines: lines(instructions.len()),
        instructions,
        constants: vec![],
        names: vec![],
        kwname_tables: vec![],
        local_count: 0,
        cell_count: 0,
        free_var_count: 1,
        arity: arity(0),
    }
}

/// `nested_closure(x)`: stores `x` into a cell, closes over it, and calls
/// the closure — `nested_closure(3) == 6`.
pub fn nested_closure_body() -> StackCode {
    use StackOp::*;
    let instructions = vec![
        /* 0 */ LoadFast(0),
        /* 1 */ StoreDeref(0),
        /* 2 */ LoadConst(1),
        /* 3 */
        MakeClosure {
            code_const_idx: 0,
            captures: vec![0],
        },
        /* 4 */ CallFunction(0),
        /* 5 */ ReturnValue,
    ];
    StackCode {
        name: "nested_closure".to_string(),
        lines: lines(instructions.len()),
        instructions,
        constants: vec![StackConstant::Code(Arc::new(nested_closure_inner())), StackConstant::None],
        names: vec![],
        kwname_tables: vec![],
        local_count: 1,
        cell_count: 1,
        free_var_count: 0,
        arity: arity(1),
    }
}

/// The generator body `generator_sum` closes over: `for item in
/// range(limit): yield item > threshold`.
fn gen_body() -> StackCode {
    use StackOp::*;
    let instructions = vec![
        /* 0 */ SetupLoop(12),
        /* 1 */ LoadGlobal(0),
        /* 2 */ LoadFast(0),
        /* 3 */ CallFunction(1),
        /* 4 */ GetIter,
        /* 5 */ ForIter(12),
        /* 6 */ StoreFast(2),
        /* 7 */ LoadFast(2),
        /* 8 */ LoadFast(1),
        /* 9 */ BinaryOp(">"),
        /* 10 */ YieldValue,
        /* 11 */ JumpAbsolute(5),
        /* 12 */ PopBlock,
        /* 13 */ LoadConst(0),
        /* 14 */ ReturnValue,
    ];
    StackCode {
        name: "generator_sum.<locals>.gen".to_string(),
        lines: lines(instructions.len()),
        instructions,
        constants: vec![StackConstant::None],
        names: vec!["range".to_string()],
        kwname_tables: vec![],
        local_count: 3,
        cell_count: 0,
        free_var_count: 0,
        arity: arity(2),
    }
}

/// `generator_sum(limit, threshold)`: drives `gen` to completion, summing
/// its yielded booleans (`True`/`False` promote to `1`/`0` the way a
/// Python-style numeric tower treats bools as ints).
pub fn generator_sum_body() -> StackCode {
    use StackOp::*;
    let instructions = vec![
        /* 0 */ LoadConst(1),
        /* 1 */ StoreFast(2),
        /* 2 */ SetupLoop(15),
        /* 3 */
        MakeClosure {
            code_const_idx: 0,
            captures: vec![],
        },
        /* 4 */ LoadFast(0),
        /* 5 */ LoadFast(1),
        /* 6 */ CallFunction(2),
        /* 7 */ GetIter,
        /* 8 */ ForIter(15),
        /* 9 */ StoreFast(3),
        /* 10 */ LoadFast(2),
        /* 11 */ LoadFast(3),
        /* 12 */ BinaryOp("+"),
        /* 13 */ StoreFast(2),
        /* 14 */ JumpAbsolute(8),
        /* 15 */ PopBlock,
        /* 16 */ LoadFast(2),
        /* 17 */ ReturnValue,
    ];
    StackCode {
        name: "generator_sum".to_string(),
        lines: lines(instructions.len()),
        instructions,
        constants: vec![StackConstant::Code(Arc::new(gen_body())), StackConstant::Int(0)],
        names: vec![],
        kwname_tables: vec![],
        local_count: 4,
        cell_count: 0,
        free_var_count: 0,
        arity: arity(2),
    }
}

/// `qs(lst)`: a thin trampoline onto the host-native three-way quicksort.
pub fn qs_body() -> StackCode {
    use StackOp::*;
    let instructions = vec![LoadGlobal(0), LoadFast(0), CallFunction(1), ReturnValue];
    StackCode {
        name: "qs".to_string(),
        lines: lines(instructions.len()),
        instructions,
        constants: vec![],
        names: vec!["_qs_native".to_string()],
        kwname_tables: vec![],
        local_count: 1,
        cell_count: 0,
        free_var_count: 0,
        arity: arity(1),
    }
}

/// `fannkuch(n)`: a thin trampoline onto the host-native fannkuch-redux
/// checksum; the native side also records the `Pfannkuchen(n) = ...` line
/// `ScriptHost::output` exposes.
pub fn fannkuch_body() -> StackCode {
    use StackOp::*;
    let instructions = vec![LoadGlobal(0), LoadFast(0), CallFunction(1), ReturnValue];
    StackCode {
        name: "fannkuch".to_string(),
        lines: lines(instructions.len()),
        instructions,
        constants: vec![],
        names: vec!["_fannkuch_native".to_string()],
        kwname_tables: vec![],
        local_count: 1,
        cell_count: 0,
        free_var_count: 0,
        arity: arity(1),
    }
}

/// `typed_handler(flag)`: a truthy `flag` indexes an empty list
/// out of range (`IndexError`), a falsy one looks up a missing key in an
/// empty mapping (`KeyError`). The handler discriminates by class with
/// `POP_SHADOW`/`EXC_MATCH`, catching only `KeyError` and returning `99`;
/// an `IndexError` falls through the re-raise and escapes the frame.
pub fn typed_handler_body() -> StackCode {
    use StackOp::*;
    let instructions = vec![
        /* 0  */ SetupExcept(10),
        /* 1  */ LoadFast(0),
        /* 2  */ PopJumpIfFalse(6),
        /* 3  */ BuildSequence(0),
        /* 4  */ LoadConst(0),
        /* 5  */ JumpAbsolute(8),
        /* 6  */ BuildMapping(0),
        /* 7  */ LoadConst(1),
        /* 8  */ BinarySubscr,
        /* 9  */ ReturnValue,
        /* 10 */ PopShadow,
        /* 11 */ ExcMatch(0),
        /* 12 */ PopJumpIfFalse(15),
        /* 13 */ LoadConst(2),
        /* 14 */ ReturnValue,
        /* 15 */ RaiseVarargs,
    ];
    StackCode {
        name: "typed_handler".to_string(),
        lines: lines(instructions.len()),
        instructions,
        constants: vec![StackConstant::Int(5), StackConstant::Str("missing".to_string()), StackConstant::Int(99)],
        names: vec!["KeyError".to_string()],
        kwname_tables: vec![],
        local_count: 1,
        cell_count: 0,
        free_var_count: 0,
        arity: arity(1),
    }
}

/// Look up one of this module's fixtures by the name `SPEC_FULL.md`'s
/// scenarios call it.
pub fn fixture(name: &str) -> Option<StackCode> {
    Some(match name {
        "add" => add_body(),
        "count_threshold" => count_threshold_body(),
        "unpack_first" => unpack_first_body(),
        "capture" => capture_body(),
        "nested_closure" => nested_closure_body(),
        "generator_sum" => generator_sum_body(),
        "qs" => qs_body(),
        "fannkuch" => fannkuch_body(),
        "typed_handler" => typed_handler_body(),
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Engine;
    use quickcheck_macros::quickcheck;

    fn run(host: &mut ScriptHost, code: &StackCode, args: &[Handle]) -> crate::error::EngineResult<Handle> {
        let engine = Engine::new();
        let regcode = engine.compile(code).expect("fixture failed to compile");
        let globals = host.globals();
        let builtins = Some(host.builtins_handle());
        engine.run(host, &regcode, args, &[], globals, builtins)
    }

    #[test]
    fn add_covers_int_bigint_and_string() {
        let mut host = ScriptHost::new();
        let code = add_body();

        let a = host.make_int(1);
        let b = host.make_int(2);
        let result = run(&mut host, &code, &[a, b]).unwrap();
        assert_eq!(host.expect_int(result), 3);
        host.decref(result);

        let huge = bigint_pow(BigInt::from(10), 50);
        let a = host.make_bigint_from(huge.clone());
        let b = host.make_int(200);
        let result = run(&mut host, &code, &[a, b]).unwrap();
        match host.value(result) {
            Value::BigInt(v) => assert_eq!(*v, huge + BigInt::from(200)),
            other => panic!("expected a bigint, found {other}"),
        }
        host.decref(result);

        let a = host.make_str("hello");
        let b = host.make_str(" world");
        let result = run(&mut host, &code, &[a, b]).unwrap();
        assert_eq!(host.expect_str(result), "hello world");
        host.decref(result);
    }

    #[test]
    fn count_threshold_counts_values_above_the_threshold() {
        let mut host = ScriptHost::new();
        let code = count_threshold_body();
        let limit = host.make_int(1000);
        let threshold = host.make_int(500);
        let result = run(&mut host, &code, &[limit, threshold]).unwrap();
        assert_eq!(host.expect_int(result), 499);
        host.decref(result);
    }

    #[test]
    fn unpack_first_returns_the_leading_element() {
        let mut host = ScriptHost::new();
        let code = unpack_first_body();
        let a = host.make_int(1);
        let b = host.make_int(2);
        let c = host.make_int(3);
        let t = host.make_tuple(vec![a, b, c]);
        let result = run(&mut host, &code, &[t]).unwrap();
        assert_eq!(host.expect_int(result), 1);
        host.decref(result);
    }

    #[test]
    fn unpack_first_rejects_a_mismatched_arity() {
        let mut host = ScriptHost::new();
        let code = unpack_first_body();
        let a = host.make_int(1);
        let b = host.make_int(2);
        let t = host.make_tuple(vec![a, b]);
        let err = run(&mut host, &code, &[t]).unwrap_err();
        assert_eq!(err.kind, ErrorKind::BadArgument);
    }

    #[test]
    fn capture_returns_one_after_catching_the_store_failure() {
        let mut host = ScriptHost::new();
        let code = capture_body();
        let zero = host.make_int(0);
        let t = host.make_tuple(vec![zero]);
        let result = run(&mut host, &code, &[t]).unwrap();
        assert_eq!(host.expect_int(result), 1);
        host.decref(result);
    }

    #[test]
    fn nested_closure_adds_its_capture_to_itself() {
        let mut host = ScriptHost::new();
        let code = nested_closure_body();
        let x = host.make_int(3);
        let result = run(&mut host, &code, &[x]).unwrap();
        assert_eq!(host.expect_int(result), 6);
        host.decref(result);
    }

    #[test]
    fn typed_handler_catches_the_key_error_it_names() {
        let mut host = ScriptHost::new();
        let code = typed_handler_body();
        let flag = host.make_int(0);
        let result = run(&mut host, &code, &[flag]).unwrap();
        assert_eq!(host.expect_int(result), 99);
        host.decref(result);
    }

    #[test]
    fn typed_handler_lets_an_index_error_escape_uncaught() {
        let mut host = ScriptHost::new();
        let code = typed_handler_body();
        let flag = host.make_int(1);
        let err = run(&mut host, &code, &[flag]).unwrap_err();
        assert_eq!(err.kind, ErrorKind::IndexOutOfRange);
    }

    #[test]
    fn generator_sum_matches_the_non_generator_equivalent() {
        let mut host = ScriptHost::new();
        let code = generator_sum_body();
        let limit = host.make_int(1000);
        let threshold = host.make_int(490);
        let result = run(&mut host, &code, &[limit, threshold]).unwrap();
        assert_eq!(host.expect_int(result), 509);
        host.decref(result);
    }

    #[test]
    fn qs_sorts_with_three_way_partitioning() {
        let mut host = ScriptHost::new();
        let code = qs_body();
        let values = [3i64, 1, 2, 3, 1].map(|v| host.make_int(v));
        let lst = host.make_list(values.to_vec());
        let result = run(&mut host, &code, &[lst]).unwrap();
        let Value::List(items) = host.value(result).clone() else {
            panic!("expected a list");
        };
        let sorted: Vec<i64> = items.iter().map(|h| host.expect_int(*h)).collect();
        assert_eq!(sorted, vec![1, 1, 2, 3, 3]);
        host.decref(result);
    }

    #[test]
    fn fannkuch_seven_matches_the_published_checksum() {
        let mut host = ScriptHost::new();
        let code = fannkuch_body();
        let n = host.make_int(7);
        let result = run(&mut host, &code, &[n]).unwrap();
        assert_eq!(host.expect_int(result), 228);
        assert_eq!(host.output().len(), 1);
        assert_eq!(host.output()[0], "Pfannkuchen(7) = 16");
        host.decref(result);
    }

    #[test]
    fn fannkuch_checksum_matches_known_small_cases() {
        assert_eq!(fannkuch_checksum(1), (0, 0));
        assert_eq!(fannkuch_checksum(7), (228, 16));
    }

    #[quickcheck]
    fn add_is_deterministic(a: i64, b: i64) -> bool {
        let code = add_body();

        let mut host_one = ScriptHost::new();
        let x = host_one.make_int(a);
        let y = host_one.make_int(b);
        let one = run(&mut host_one, &code, &[x, y]).map(|h| host_one.value(h).to_string());

        let mut host_two = ScriptHost::new();
        let x = host_two.make_int(a);
        let y = host_two.make_int(b);
        let two = run(&mut host_two, &code, &[x, y]).map(|h| host_two.value(h).to_string());

        match (one, two) {
            (Ok(lhs), Ok(rhs)) => lhs == rhs,
            (Err(lhs), Err(rhs)) => lhs.kind == rhs.kind,
            _ => false,
        }
    }

    #[quickcheck]
    fn optimized_and_unoptimized_add_agree(a: i64, b: i64) -> bool {
        let code = add_body();
        let optimized = Engine::with_options(crate::compiler::OptimizeOptions::default());
        let unoptimized = Engine::with_options(crate::compiler::OptimizeOptions::none());
        let opt_regcode = optimized.compile(&code).expect("add_body should compile with every pass enabled");
        let plain_regcode = unoptimized.compile(&code).expect("add_body should compile with every pass disabled");

        let mut host = ScriptHost::new();

        let x = host.make_int(a);
        let y = host.make_int(b);
        let globals = host.globals();
        let builtins = Some(host.builtins_handle());
        let with_opt = optimized
            .run(&mut host, &opt_regcode, &[x, y], &[], globals, builtins)
            .map(|h| host.value(h).to_string());

        let x = host.make_int(a);
        let y = host.make_int(b);
        let globals = host.globals();
        let builtins = Some(host.builtins_handle());
        let without_opt = unoptimized
            .run(&mut host, &plain_regcode, &[x, y], &[], globals, builtins)
            .map(|h| host.value(h).to_string());

        match (with_opt, without_opt) {
            (Ok(lhs), Ok(rhs)) => lhs == rhs,
            (Err(lhs), Err(rhs)) => lhs.kind == rhs.kind,
            _ => false,
        }
    }
}
