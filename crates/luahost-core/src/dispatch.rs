//! The trampoline between guest proxies and host callables.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;

use mlua::{Function, Lua, MultiValue, Value};
use tracing::trace;

use crate::bridge;
use crate::error::{BridgeError, Result};
use crate::panic::{call_trapped, find_fault};
use crate::registry::SharedRegistry;
use crate::slots::{CallbackId, StructId};
use crate::value::{ForeignValue, GuestFunction};

/// What a host callable sees of the state that invoked it.
///
/// Calls made through the context re-enter the same guest and share the
/// execution budget of the call that is already running.
pub struct CallContext<'a> {
    lua: &'a Lua,
    registry: SharedRegistry,
}

impl<'a> CallContext<'a> {
    pub(crate) fn new(lua: &'a Lua, registry: SharedRegistry) -> Self {
        Self { lua, registry }
    }

    pub fn lua(&self) -> &Lua {
        self.lua
    }

    pub fn call(&self, f: &GuestFunction, args: Vec<ForeignValue>) -> Result<Vec<ForeignValue>> {
        let func: Function = self.lua.registry_value(&f.0)?;
        self.call_function(func, args)
    }

    pub fn call_global(&self, name: &str, args: Vec<ForeignValue>) -> Result<Vec<ForeignValue>> {
        let func = global_function(self.lua, name)?;
        self.call_function(func, args)
    }

    fn call_function(&self, func: Function, args: Vec<ForeignValue>) -> Result<Vec<ForeignValue>> {
        let args = bridge::to_guest_multi(self.lua, args)?;
        // Guest errors stay raw so the outermost boundary classifies them once.
        let out = call_trapped(self.lua, &func, args)
            .map_err(|e| find_fault(&e).unwrap_or(BridgeError::Lua(e)))?;
        bridge::from_guest_multi(self.lua, out)
    }

    pub fn register_callback<F>(&self, f: F) -> CallbackId
    where
        F: Fn(&CallContext<'_>, CallArgs) -> Result<Vec<ForeignValue>> + 'static,
    {
        self.registry.register_callback(Rc::new(f))
    }

    pub fn unregister_callback(&self, id: CallbackId) -> bool {
        self.registry.unregister_callback(id)
    }
}

pub(crate) fn global_function(lua: &Lua, name: &str) -> Result<Function> {
    match lua.globals().raw_get::<Value>(name)? {
        Value::Function(f) => Ok(f),
        _ => Err(BridgeError::NotCallable(name.to_string())),
    }
}

/// Arguments of one guest-to-host call. Positions are 1-based, as in
/// guest error messages.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CallArgs {
    values: Vec<ForeignValue>,
}

impl CallArgs {
    pub fn new(values: Vec<ForeignValue>) -> Self {
        Self { values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn get(&self, position: usize) -> Option<&ForeignValue> {
        position.checked_sub(1).and_then(|i| self.values.get(i))
    }

    pub fn iter(&self) -> impl Iterator<Item = &ForeignValue> {
        self.values.iter()
    }

    pub fn into_vec(self) -> Vec<ForeignValue> {
        self.values
    }

    pub fn integer(&self, position: usize) -> Result<i64> {
        self.opt_integer(position)?
            .ok_or_else(|| self.expected(position, "integer"))
    }

    pub fn number(&self, position: usize) -> Result<f64> {
        self.opt_number(position)?
            .ok_or_else(|| self.expected(position, "number"))
    }

    pub fn string(&self, position: usize) -> Result<String> {
        self.opt_string(position)?
            .ok_or_else(|| self.expected(position, "string"))
    }

    pub fn boolean(&self, position: usize) -> Result<bool> {
        match self.get(position) {
            Some(ForeignValue::Boolean(b)) => Ok(*b),
            _ => Err(self.expected(position, "boolean")),
        }
    }

    pub fn opt_integer(&self, position: usize) -> Result<Option<i64>> {
        match self.get(position) {
            None | Some(ForeignValue::None) => Ok(None),
            Some(ForeignValue::Number(n)) if n.fract() != 0.0 => Err(BridgeError::bad_argument(
                position,
                "number has no integer representation",
            )),
            Some(v) => v
                .as_integer()
                .map(Some)
                .ok_or_else(|| self.expected(position, "integer")),
        }
    }

    pub fn opt_number(&self, position: usize) -> Result<Option<f64>> {
        match self.get(position) {
            None | Some(ForeignValue::None) => Ok(None),
            Some(v) => v
                .as_number()
                .map(Some)
                .ok_or_else(|| self.expected(position, "number")),
        }
    }

    /// Numbers are accepted and formatted, as the guest's own string
    /// functions do.
    pub fn opt_string(&self, position: usize) -> Result<Option<String>> {
        match self.get(position) {
            None | Some(ForeignValue::None) => Ok(None),
            Some(ForeignValue::String(s)) => Ok(Some(s.clone())),
            Some(ForeignValue::Bytes(b)) => Ok(Some(String::from_utf8_lossy(b).into_owned())),
            Some(v @ (ForeignValue::Integer(_) | ForeignValue::Number(_))) => Ok(Some(v.to_string())),
            Some(_) => Err(self.expected(position, "string")),
        }
    }

    fn expected(&self, position: usize, what: &str) -> BridgeError {
        let got = match self.get(position) {
            None => "no value",
            Some(ForeignValue::None) => "nil",
            Some(v) => v.tag().as_str(),
        };
        BridgeError::bad_argument(position, format!("{what} expected, got {got}"))
    }
}

impl From<Vec<ForeignValue>> for CallArgs {
    fn from(values: Vec<ForeignValue>) -> Self {
        Self::new(values)
    }
}

/// Runs the callable bound to `id` with guest arguments.
pub(crate) fn invoke(lua: &Lua, id: CallbackId, args: MultiValue) -> mlua::Result<MultiValue> {
    let registry = SharedRegistry::of(lua)?;
    // Cloned out so the registry is free while the callable runs.
    let f = registry.resolve_callback(id).map_err(raise)?;
    let args = bridge::from_guest_multi(lua, args).map_err(raise)?;
    trace!(%id, argc = args.len(), "dispatching callback");

    let ctx = CallContext::new(lua, registry);
    let out = guarded(|| f(&ctx, CallArgs::new(args))).map_err(raise)?;
    bridge::to_guest_multi(lua, out).map_err(raise)
}

/// Runs `method` on the object bound to `id`. A leading `self` proxy is
/// dropped so both `obj.m(...)` and `obj:m(...)` work.
pub(crate) fn invoke_method(
    lua: &Lua,
    id: StructId,
    method: &str,
    args: MultiValue,
) -> mlua::Result<MultiValue> {
    let registry = SharedRegistry::of(lua)?;
    let obj = registry.resolve_struct(id).map_err(raise)?;

    let mut args = bridge::from_guest_multi(lua, args).map_err(raise)?;
    if matches!(args.first(), Some(ForeignValue::Struct(this)) if *this == id) {
        args.remove(0);
    }
    trace!(%id, method, argc = args.len(), "dispatching method");

    let ctx = CallContext::new(lua, registry);
    let out = guarded(|| {
        let mut obj = obj.try_borrow_mut().map_err(|_| BridgeError::StructBusy(id))?;
        obj.call(&ctx, method, CallArgs::new(args))
    })
    .map_err(raise)?;
    bridge::to_guest_multi(lua, out).map_err(raise)
}

/// Runs host code, turning a panic into [`BridgeError::HostPanic`].
pub(crate) fn guarded<R>(f: impl FnOnce() -> Result<R>) -> Result<R> {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(payload) => Err(BridgeError::HostPanic(panic_message(payload.as_ref()))),
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Converts a bridge error into something the guest can raise. Raw guest
/// errors pass through untouched.
pub(crate) fn raise(err: BridgeError) -> mlua::Error {
    match err {
        BridgeError::Lua(inner) => inner,
        other => mlua::Error::external(other),
    }
}
