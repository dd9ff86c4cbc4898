//! Error classification at the boundary, the panic handler, and the
//! mediated `pcall` that keeps guest code from swallowing fatal faults.

use std::fmt;
use std::sync::Arc;

use mlua::{Function, Lua, MultiValue, RegistryKey, StdLib, Table, Value};
use tracing::{debug, warn};

use crate::bridge;
use crate::dispatch::{guarded, CallArgs, CallContext};
use crate::error::{BridgeError, GuestPanic};
use crate::registry::SharedRegistry;
use crate::value::ForeignValue;

const XPCALL: &str = "luahost.xpcall";
const MESSAGE_HANDLER: &str = "luahost.msgh";
const TRACEBACK: &str = "luahost.traceback";

/// A guest error object that is not a string. The value itself stays in
/// the registry so the panic handler receives it rather than its text.
#[derive(Debug, Clone)]
pub(crate) struct Thrown {
    message: String,
    value: Arc<RegistryKey>,
}

impl fmt::Display for Thrown {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for Thrown {}

/// Keeps private copies of `xpcall` and `debug.traceback` for
/// [`call_trapped`], then drops the debug library again. Must run before the
/// globals are stripped.
pub(crate) fn install_trap(lua: &Lua) -> mlua::Result<()> {
    let globals = lua.globals();
    lua.load_std_libs(StdLib::DEBUG)?;
    let debug_lib: Table = globals.raw_get("debug")?;
    lua.set_named_registry_value(TRACEBACK, debug_lib.raw_get::<Function>("traceback")?)?;
    globals.raw_set("debug", Value::Nil)?;
    if let Some(loaded) = lua.named_registry_value::<Option<Table>>("_LOADED")? {
        loaded.raw_set("debug", Value::Nil)?;
    }

    lua.set_named_registry_value(XPCALL, globals.raw_get::<Function>("xpcall")?)?;
    lua.set_named_registry_value(MESSAGE_HANDLER, lua.create_function(message_handler)?)
}

/// Calls `f` so that a non-string error object reaches the host intact,
/// as a [`Thrown`] fault, instead of being flattened to text.
pub(crate) fn call_trapped(lua: &Lua, f: &Function, args: MultiValue) -> mlua::Result<MultiValue> {
    let xpcall = lua.named_registry_value::<Option<Function>>(XPCALL)?;
    let handler = lua.named_registry_value::<Option<Function>>(MESSAGE_HANDLER)?;
    let (Some(xpcall), Some(handler)) = (xpcall, handler) else {
        return f.call(args);
    };

    let (ok, mut rest): (bool, MultiValue) = xpcall.call((f.clone(), handler, args))?;
    if ok {
        return Ok(rest);
    }
    Err(match rest.pop_front().unwrap_or(Value::Nil) {
        Value::Error(e) => *e,
        Value::String(s) => mlua::Error::RuntimeError(s.to_string_lossy()),
        other => mlua::Error::RuntimeError(format!("{other:?}")),
    })
}

fn message_handler(lua: &Lua, err: Value) -> mlua::Result<Value> {
    let traceback = lua.named_registry_value::<Option<Function>>(TRACEBACK)?;
    // level 2 skips this handler and starts at the raising frame
    let trace = |msg: Value| -> mlua::Result<Value> {
        match &traceback {
            Some(tb) => tb.call((msg, 2)),
            None => Ok(msg),
        }
    };
    match err {
        Value::Error(_) => Ok(err),
        Value::String(_) | Value::Integer(_) | Value::Number(_) => trace(err),
        other => {
            let message = trace(Value::String(lua.create_string(thrown_message(&other))?))?;
            let thrown = Thrown {
                message: message.to_string()?,
                value: Arc::new(lua.create_registry_value(other)?),
            };
            Ok(Value::Error(Box::new(mlua::Error::external(thrown))))
        }
    }
}

fn thrown_message(value: &Value) -> String {
    let tostring = match value {
        Value::Table(t) => t
            .metatable()
            .and_then(|mt| mt.raw_get::<Function>("__tostring").ok()),
        _ => None,
    };
    tostring
        .and_then(|f| f.call::<String>(value.clone()).ok())
        .unwrap_or_else(|| format!("(error object is a {} value)", value.type_name()))
}

/// The error object behind `err`, when the guest raised something other
/// than a string.
pub(crate) fn thrown_value(lua: &Lua, err: &mlua::Error) -> Option<ForeignValue> {
    let mlua::Error::ExternalError(e) = root_cause(err) else {
        return None;
    };
    let thrown = e.as_ref().downcast_ref::<Thrown>()?;
    let value = lua.registry_value::<Value>(&thrown.value).ok()?;
    bridge::from_guest(lua, value, 0).ok()
}

/// Digs a bridge fault out of whatever wrapping the guest put around it.
pub(crate) fn find_fault(err: &mlua::Error) -> Option<BridgeError> {
    match err {
        mlua::Error::ExternalError(e) => e.as_ref().downcast_ref::<BridgeError>().cloned(),
        mlua::Error::CallbackError { cause, .. } => find_fault(cause),
        mlua::Error::WithContext { cause, .. } => find_fault(cause),
        _ => None,
    }
}

fn root_cause(err: &mlua::Error) -> &mlua::Error {
    match err {
        mlua::Error::CallbackError { cause, .. } | mlua::Error::WithContext { cause, .. } => {
            root_cause(cause)
        }
        other => other,
    }
}

/// Maps an error that escaped the guest onto the host taxonomy.
/// The panic handler is not consulted here; see [`handle`].
pub(crate) fn classify(err: mlua::Error) -> BridgeError {
    if let Some(fault) = find_fault(&err) {
        return fault;
    }
    match root_cause(&err) {
        mlua::Error::SyntaxError { message, .. } => {
            let parsed = GuestPanic::parse(message);
            BridgeError::Compile {
                chunk: parsed.location.map(|l| l.chunk).unwrap_or_default(),
                message: message.clone(),
            }
        }
        mlua::Error::MemoryError(message) => BridgeError::Allocation(message.clone()),
        _ => BridgeError::Panic(Box::new(guest_panic(&err))),
    }
}

fn guest_panic(err: &mlua::Error) -> GuestPanic {
    match err {
        mlua::Error::CallbackError { traceback, cause } => {
            let mut panic = guest_panic(cause);
            if panic.traceback.is_empty() {
                panic.traceback = GuestPanic::parse(traceback).traceback;
            }
            panic
        }
        mlua::Error::WithContext { cause, .. } => guest_panic(cause),
        mlua::Error::RuntimeError(message) => GuestPanic::parse(message),
        other => GuestPanic::parse(&other.to_string()),
    }
}

/// Runs the installed panic handler, once, with the current payload and
/// records its result as the new one. Without a handler the payload is kept:
/// `Error(message)` for string errors, the converted object otherwise.
pub(crate) fn handle(lua: &Lua, registry: &SharedRegistry, mut panic: GuestPanic) -> GuestPanic {
    let Some(id) = registry.panic_handler() else {
        return panic;
    };
    debug!(handler = %id, message = %panic.message, "running panic handler");

    let ctx = CallContext::new(lua, registry.clone());
    let args = CallArgs::new(vec![panic.payload.clone()]);
    let result = registry
        .resolve_callback(id)
        .and_then(|f| guarded(|| f(&ctx, args)));

    panic.payload = match result {
        Ok(out) => out.into_iter().next().unwrap_or_default(),
        Err(e) => {
            warn!(handler = %id, error = %e, "panic handler failed");
            ForeignValue::Error(e.to_string())
        }
    };
    panic.handled = true;
    panic
}

const MEDIATED_PCALL: &str = r#"
local raw_pcall, raw_xpcall, uncatchable = ...
local error = error

local function rethrow(ok, ...)
  if not ok and uncatchable((...)) then
    error((...), 0)
  end
  return ok, ...
end

local function pcall(f, ...)
  return rethrow(raw_pcall(f, ...))
end

local function xpcall(f, handler, ...)
  return rethrow(raw_xpcall(f, function(e)
    if uncatchable(e) then
      return e
    end
    return handler(e)
  end, ...))
end

return pcall, xpcall
"#;

fn is_uncatchable(value: &Value) -> bool {
    match value {
        Value::Error(e) => find_fault(e).is_some_and(|f| f.is_uncatchable()),
        _ => false,
    }
}

/// Moves `pcall`/`xpcall` to `unsafe_pcall`/`unsafe_xpcall` and installs
/// wrappers that re-raise execution limit and host panic faults.
/// Calling it again rebuilds the wrappers around the same raw functions.
pub(crate) fn install_mediated_pcall(lua: &Lua) -> mlua::Result<()> {
    let globals = lua.globals();
    let raw = |unsafe_name: &str, name: &str| -> mlua::Result<Value> {
        match globals.raw_get::<Value>(unsafe_name)? {
            Value::Nil => globals.raw_get(name),
            found => Ok(found),
        }
    };
    let raw_pcall = raw("unsafe_pcall", "pcall")?;
    let raw_xpcall = raw("unsafe_xpcall", "xpcall")?;
    if raw_pcall.is_nil() || raw_xpcall.is_nil() {
        return Err(mlua::Error::runtime(
            "pcall is not available; install the base library first",
        ));
    }

    let uncatchable = lua.create_function(|_, v: Value| Ok(is_uncatchable(&v)))?;
    let (pcall, xpcall): (Function, Function) = lua
        .load(MEDIATED_PCALL)
        .set_name("=luahost.pcall")
        .call((raw_pcall.clone(), raw_xpcall.clone(), uncatchable))?;

    globals.raw_set("unsafe_pcall", raw_pcall)?;
    globals.raw_set("unsafe_xpcall", raw_xpcall)?;
    globals.raw_set("pcall", pcall)?;
    globals.raw_set("xpcall", xpcall)?;
    Ok(())
}
