//! Standard library subsets a host opts into one by one.

use std::fmt;
use std::str::FromStr;

use mlua::{Function, Lua, StdLib, Table, Value, Variadic};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::dispatch::raise;
use crate::error::BridgeError;
use crate::limits;

const BASE_SNAPSHOT: &str = "luahost.base";

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Library {
    Base,
    Bit32,
    Coroutine,
    Debug,
    Io,
    Math,
    Os,
    Package,
    String,
    Table,
}

impl Library {
    pub const ALL: [Library; 10] = [
        Library::Base,
        Library::Bit32,
        Library::Coroutine,
        Library::Debug,
        Library::Io,
        Library::Math,
        Library::Os,
        Library::Package,
        Library::String,
        Library::Table,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Library::Base => "base",
            Library::Bit32 => "bit32",
            Library::Coroutine => "coroutine",
            Library::Debug => "debug",
            Library::Io => "io",
            Library::Math => "math",
            Library::Os => "os",
            Library::Package => "package",
            Library::String => "string",
            Library::Table => "table",
        }
    }

    /// Libraries that can reach outside the sandbox.
    pub fn is_unsafe(&self) -> bool {
        matches!(self, Library::Debug | Library::Io | Library::Os | Library::Package)
    }

    fn std_lib(&self) -> Option<StdLib> {
        match self {
            Library::Coroutine => Some(StdLib::COROUTINE),
            Library::Debug => Some(StdLib::DEBUG),
            Library::Io => Some(StdLib::IO),
            Library::Math => Some(StdLib::MATH),
            Library::Os => Some(StdLib::OS),
            Library::Package => Some(StdLib::PACKAGE),
            Library::String => Some(StdLib::STRING),
            Library::Table => Some(StdLib::TABLE),
            Library::Base | Library::Bit32 => None,
        }
    }
}

impl fmt::Display for Library {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Library {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Library::ALL
            .into_iter()
            .find(|lib| lib.name() == s.trim())
            .ok_or_else(|| BridgeError::Config(format!("unknown library '{s}'")))
    }
}

/// Guest-facing loaders that refuse precompiled chunks. Hosts load bytecode
/// through `State::load` only, where the interpreter policy applies.
const TEXT_LOADERS: &str = r##"
local raw_load, raw_loadfile, select, error = ...

local function load(chunk, name, mode, ...)
  if select("#", ...) > 0 then
    return raw_load(chunk, name, "t", ...)
  end
  return raw_load(chunk, name, "t")
end

local function loadfile(file, mode, ...)
  if select("#", ...) > 0 then
    return raw_loadfile(file, "t", ...)
  end
  return raw_loadfile(file, "t")
end

local function dofile(file)
  local f, err = raw_loadfile(file, "t")
  if not f then
    error(err, 0)
  end
  return f()
end

return load, loadfile, dofile
"##;

/// Routes every switch between coroutines through the budget hook, which
/// the interpreter only keeps on one thread at a time.
const COROUTINE_HANDOFF: &str = r#"
local co, enter, leave, type, error = ...
local create, status = co.create, co.status
local raw_resume, raw_close = co.resume, co.close

local function back(...)
  leave()
  return ...
end

local function resume(thread, ...)
  enter(thread)
  return back(raw_resume(thread, ...))
end

local function close(thread)
  enter(thread)
  return back(raw_close(thread))
end

local function finish(thread, ok, ...)
  if ok then
    return ...
  end
  local err = ...
  if status(thread) == "dead" then
    local closed, closing = close(thread)
    if not closed then
      err = closing
    end
  end
  if type(err) == "string" then
    error(err, 2)
  end
  error(err, 0)
end

co.resume = resume
co.close = close
co.wrap = function(f)
  local thread = create(f)
  return function(...)
    return finish(thread, resume(thread, ...))
  end
end
"#;

/// Moves every global of a fresh state into a registry snapshot, leaving
/// the guest with an empty environment until `base` is installed.
pub(crate) fn strip_base(lua: &Lua) -> mlua::Result<()> {
    let globals = lua.globals();
    let snapshot = lua.create_table()?;
    let mut keys = Vec::new();
    for pair in globals.pairs::<Value, Value>() {
        let (k, v) = pair?;
        snapshot.raw_set(k.clone(), v)?;
        keys.push(k);
    }
    for k in keys {
        globals.raw_set(k, Value::Nil)?;
    }

    let (load, loadfile, dofile) = lua
        .load(TEXT_LOADERS)
        .set_name("=luahost.load")
        .call::<(Function, Function, Function)>((
            snapshot.raw_get::<Value>("load")?,
            snapshot.raw_get::<Value>("loadfile")?,
            snapshot.raw_get::<Value>("select")?,
            snapshot.raw_get::<Value>("error")?,
        ))?;
    snapshot.raw_set("load", load)?;
    snapshot.raw_set("loadfile", loadfile)?;
    snapshot.raw_set("dofile", dofile)?;
    lua.set_named_registry_value(BASE_SNAPSHOT, snapshot)
}

/// Binds `lib` into the globals, building it afresh so a reinstall undoes
/// whatever the guest did to the previous copy.
pub(crate) fn install(lua: &Lua, lib: Library) -> mlua::Result<()> {
    match lib {
        Library::Base => {
            let snapshot: Table = lua.named_registry_value(BASE_SNAPSHOT)?;
            let globals = lua.globals();
            for pair in snapshot.pairs::<Value, Value>() {
                let (k, v) = pair?;
                globals.raw_set(k, v)?;
            }
        }
        Library::Bit32 => {
            let table = bit32_table(lua)?;
            lua.globals().raw_set("bit32", table.clone())?;
            if let Some(loaded) = loaded_table(lua)? {
                loaded.raw_set("bit32", table)?;
            }
        }
        other => {
            if let Some(std) = other.std_lib() {
                // the opener is skipped for anything already loaded
                if let Some(loaded) = loaded_table(lua)? {
                    loaded.raw_set(other.name(), Value::Nil)?;
                }
                lua.load_std_libs(std)?;
            }
            if other == Library::Coroutine {
                guard_coroutines(lua)?;
            }
        }
    }
    debug!(library = %lib, "library installed");
    Ok(())
}

fn loaded_table(lua: &Lua) -> mlua::Result<Option<Table>> {
    lua.named_registry_value::<Option<Table>>("_LOADED")
}

fn guard_coroutines(lua: &Lua) -> mlua::Result<()> {
    let co: Table = lua.globals().raw_get("coroutine")?;
    let base = lua
        .named_registry_value::<Option<Table>>(BASE_SNAPSHOT)?
        .unwrap_or_else(|| lua.globals());
    let enter = lua.create_function(|lua, thread: Value| {
        if let Value::Thread(thread) = thread {
            limits::follow(lua, Some(&thread));
        }
        Ok(())
    })?;
    let leave = lua.create_function(|lua, ()| {
        limits::follow(lua, None);
        Ok(())
    })?;
    lua.load(COROUTINE_HANDOFF)
        .set_name("=luahost.coroutine")
        .call::<()>((
            co,
            enter,
            leave,
            base.raw_get::<Value>("type")?,
            base.raw_get::<Value>("error")?,
        ))
}

fn bit32_table(lua: &Lua) -> mlua::Result<Table> {
    let t = lua.create_table()?;

    t.set(
        "band",
        lua.create_function(|_, xs: Variadic<i64>| Ok(bit32::band(&xs)))?,
    )?;
    t.set(
        "bor",
        lua.create_function(|_, xs: Variadic<i64>| Ok(bit32::bor(&xs)))?,
    )?;
    t.set(
        "bxor",
        lua.create_function(|_, xs: Variadic<i64>| Ok(bit32::bxor(&xs)))?,
    )?;
    t.set(
        "btest",
        lua.create_function(|_, xs: Variadic<i64>| Ok(bit32::band(&xs) != 0))?,
    )?;
    t.set("bnot", lua.create_function(|_, x: i64| Ok(bit32::bnot(x)))?)?;
    t.set(
        "lshift",
        lua.create_function(|_, (x, n): (i64, i64)| Ok(bit32::lshift(x, n)))?,
    )?;
    t.set(
        "rshift",
        lua.create_function(|_, (x, n): (i64, i64)| Ok(bit32::rshift(x, n)))?,
    )?;
    t.set(
        "arshift",
        lua.create_function(|_, (x, n): (i64, i64)| Ok(bit32::arshift(x, n)))?,
    )?;
    t.set(
        "lrotate",
        lua.create_function(|_, (x, n): (i64, i64)| Ok(bit32::lrotate(x, n)))?,
    )?;
    t.set(
        "rrotate",
        lua.create_function(|_, (x, n): (i64, i64)| Ok(bit32::lrotate(x, n.wrapping_neg())))?,
    )?;
    t.set(
        "extract",
        lua.create_function(|_, (x, field, width): (i64, i64, Option<i64>)| {
            bit32::extract(x, field, width.unwrap_or(1)).map_err(raise)
        })?,
    )?;
    t.set(
        "replace",
        lua.create_function(
            |_, (x, v, field, width): (i64, i64, i64, Option<i64>)| {
                bit32::replace(x, v, field, width.unwrap_or(1)).map_err(raise)
            },
        )?,
    )?;
    Ok(t)
}

/// Lua 5.2 `bit32` semantics: operands are reduced modulo 2^32 and results
/// are unsigned 32-bit values.
mod bit32 {
    use crate::error::{BridgeError, Result};

    fn u(x: i64) -> u32 {
        x as u32
    }

    fn out(x: u32) -> i64 {
        i64::from(x)
    }

    pub(super) fn band(xs: &[i64]) -> i64 {
        out(xs.iter().fold(u32::MAX, |acc, &x| acc & u(x)))
    }

    pub(super) fn bor(xs: &[i64]) -> i64 {
        out(xs.iter().fold(0, |acc, &x| acc | u(x)))
    }

    pub(super) fn bxor(xs: &[i64]) -> i64 {
        out(xs.iter().fold(0, |acc, &x| acc ^ u(x)))
    }

    pub(super) fn bnot(x: i64) -> i64 {
        out(!u(x))
    }

    pub(super) fn lshift(x: i64, n: i64) -> i64 {
        if n < 0 {
            return rshift(x, n.saturating_neg());
        }
        if n >= 32 {
            return 0;
        }
        out(u(x) << n)
    }

    pub(super) fn rshift(x: i64, n: i64) -> i64 {
        if n < 0 {
            return lshift(x, n.saturating_neg());
        }
        if n >= 32 {
            return 0;
        }
        out(u(x) >> n)
    }

    pub(super) fn arshift(x: i64, n: i64) -> i64 {
        if n < 0 {
            return lshift(x, n.saturating_neg());
        }
        let x = u(x) as i32;
        out((x >> n.min(31)) as u32)
    }

    pub(super) fn lrotate(x: i64, n: i64) -> i64 {
        out(u(x).rotate_left(n.rem_euclid(32) as u32))
    }

    fn field_mask(field: i64, width: i64) -> Result<(u32, u32)> {
        if field < 0 {
            return Err(BridgeError::bad_argument(2, "field cannot be negative"));
        }
        if width <= 0 {
            return Err(BridgeError::bad_argument(3, "width must be positive"));
        }
        if field + width > 32 {
            return Err(BridgeError::bad_argument(2, "trying to access non-existent bits"));
        }
        let mask = if width == 32 { u32::MAX } else { (1_u32 << width) - 1 };
        Ok((field as u32, mask))
    }

    pub(super) fn extract(x: i64, field: i64, width: i64) -> Result<i64> {
        let (field, mask) = field_mask(field, width)?;
        Ok(out((u(x) >> field) & mask))
    }

    pub(super) fn replace(x: i64, v: i64, field: i64, width: i64) -> Result<i64> {
        let (field, mask) = field_mask(field, width)?;
        let cleared = u(x) & !(mask << field);
        Ok(out(cleared | ((u(v) & mask) << field)))
    }

}
