//! Conversions between guest values and [`ForeignValue`], and the userdata
//! proxies that stand in for host callables and objects inside the guest.

use std::sync::Arc;

use mlua::{AnyUserData, Lua, MetaMethod, MultiValue, UserData, UserDataMethods, Value};

use crate::dispatch::{self, raise};
use crate::error::{BridgeError, Result};
use crate::registry::SharedRegistry;
use crate::slots::{CallbackId, StructId};
use crate::value::{ForeignValue, GuestFunction};

/// Guest tables nested deeper than this are rejected instead of converted.
pub const MAX_DEPTH: usize = 64;

/// Guest-visible stand-in for a host callable. Holds only the id; the
/// callable is looked up again on every call.
#[derive(Clone, Copy, Debug)]
pub(crate) struct CallableProxy {
    pub(crate) id: CallbackId,
}

impl UserData for CallableProxy {
    fn add_methods<M: UserDataMethods<Self>>(methods: &mut M) {
        methods.add_meta_method(MetaMethod::Call, |lua, this, args: MultiValue| {
            dispatch::invoke(lua, this.id, args)
        });
        methods.add_meta_method(MetaMethod::Eq, |_, this, other: AnyUserData| {
            Ok(other
                .borrow::<CallableProxy>()
                .map(|o| o.id == this.id)
                .unwrap_or(false))
        });
        methods.add_meta_method(MetaMethod::ToString, |_, this, ()| Ok(this.id.to_string()));
    }
}

/// Guest-visible stand-in for a host object.
#[derive(Clone, Copy, Debug)]
pub(crate) struct StructProxy {
    pub(crate) id: StructId,
}

impl UserData for StructProxy {
    fn add_methods<M: UserDataMethods<Self>>(methods: &mut M) {
        methods.add_meta_method(MetaMethod::Index, |lua, this, key: String| {
            let id = this.id;
            let obj = SharedRegistry::of(lua)?.resolve_struct(id).map_err(raise)?;
            let obj = obj.try_borrow().map_err(|_| raise(BridgeError::StructBusy(id)))?;

            let is_method =
                dispatch::guarded(|| Ok(obj.methods().contains(&key.as_str()))).map_err(raise)?;
            if is_method {
                let method = lua.create_function(move |lua, args: MultiValue| {
                    dispatch::invoke_method(lua, id, &key, args)
                })?;
                return Ok(Value::Function(method));
            }
            match dispatch::guarded(|| Ok(obj.get(&key))).map_err(raise)? {
                Some(v) => to_guest(lua, v).map_err(raise),
                None => Ok(Value::Nil),
            }
        });
        methods.add_meta_method(
            MetaMethod::NewIndex,
            |lua, this, (key, value): (String, Value)| {
                let value = from_guest(lua, value, 0).map_err(raise)?;
                let obj = SharedRegistry::of(lua)?
                    .resolve_struct(this.id)
                    .map_err(raise)?;
                let mut obj = obj
                    .try_borrow_mut()
                    .map_err(|_| raise(BridgeError::StructBusy(this.id)))?;
                dispatch::guarded(|| obj.set(&key, value)).map_err(raise)
            },
        );
        methods.add_meta_method(MetaMethod::Eq, |_, this, other: AnyUserData| {
            Ok(other
                .borrow::<StructProxy>()
                .map(|o| o.id == this.id)
                .unwrap_or(false))
        });
        methods.add_meta_method(MetaMethod::ToString, |_, this, ()| Ok(this.id.to_string()));
    }
}

pub(crate) fn callback_id_of(value: &Value) -> Option<CallbackId> {
    match value {
        Value::UserData(ud) => ud.borrow::<CallableProxy>().ok().map(|p| p.id),
        _ => None,
    }
}

pub(crate) fn struct_id_of(value: &Value) -> Option<StructId> {
    match value {
        Value::UserData(ud) => ud.borrow::<StructProxy>().ok().map(|p| p.id),
        _ => None,
    }
}

pub(crate) fn describe(value: &Value) -> String {
    match value {
        Value::UserData(_) => "foreign userdata".to_string(),
        other => other.type_name().to_string(),
    }
}

pub(crate) fn to_guest(lua: &Lua, value: ForeignValue) -> Result<Value> {
    let value = match value {
        ForeignValue::None => Value::Nil,
        ForeignValue::Boolean(b) => Value::Boolean(b),
        ForeignValue::Integer(i) => Value::Integer(i),
        ForeignValue::Number(n) => Value::Number(n),
        ForeignValue::String(s) | ForeignValue::Error(s) => Value::String(lua.create_string(s)?),
        ForeignValue::Bytes(b) => Value::String(lua.create_string(b)?),
        ForeignValue::Table(pairs) => {
            let table = lua.create_table_with_capacity(0, pairs.len())?;
            for (k, v) in pairs {
                if k.is_none() {
                    return Err(BridgeError::Unsupported("nil table key".into()));
                }
                table.raw_set(to_guest(lua, k)?, to_guest(lua, v)?)?;
            }
            Value::Table(table)
        }
        ForeignValue::Callback(id) => Value::UserData(lua.create_userdata(CallableProxy { id })?),
        ForeignValue::Struct(id) => Value::UserData(lua.create_userdata(StructProxy { id })?),
        ForeignValue::Function(f) => lua.registry_value(&f.0)?,
    };
    Ok(value)
}

pub(crate) fn from_guest(lua: &Lua, value: Value, depth: usize) -> Result<ForeignValue> {
    let value = match value {
        Value::Nil => ForeignValue::None,
        Value::Boolean(b) => ForeignValue::Boolean(b),
        Value::Integer(i) => ForeignValue::Integer(i),
        Value::Number(n) => ForeignValue::Number(n),
        Value::String(s) => match s.to_str() {
            Ok(text) => ForeignValue::String((*text).to_owned()),
            Err(_) => ForeignValue::Bytes(s.as_bytes().to_vec()),
        },
        Value::Table(table) => {
            if depth >= MAX_DEPTH {
                return Err(BridgeError::TooDeep(MAX_DEPTH));
            }
            let mut pairs = Vec::new();
            for pair in table.pairs::<Value, Value>() {
                let (k, v) = pair?;
                pairs.push((from_guest(lua, k, depth + 1)?, from_guest(lua, v, depth + 1)?));
            }
            ForeignValue::Table(pairs)
        }
        Value::Function(f) => ForeignValue::Function(GuestFunction(Arc::new(
            lua.create_registry_value(f)?,
        ))),
        Value::UserData(ud) => {
            if let Ok(p) = ud.borrow::<CallableProxy>() {
                ForeignValue::Callback(p.id)
            } else if let Ok(p) = ud.borrow::<StructProxy>() {
                ForeignValue::Struct(p.id)
            } else {
                return Err(BridgeError::Unsupported("userdata".into()));
            }
        }
        Value::Error(e) => ForeignValue::Error(e.to_string()),
        other => return Err(BridgeError::Unsupported(other.type_name().to_string())),
    };
    Ok(value)
}

pub(crate) fn to_guest_multi(lua: &Lua, values: Vec<ForeignValue>) -> Result<MultiValue> {
    values.into_iter().map(|v| to_guest(lua, v)).collect()
}

pub(crate) fn from_guest_multi(lua: &Lua, values: MultiValue) -> Result<Vec<ForeignValue>> {
    values.into_iter().map(|v| from_guest(lua, v, 0)).collect()
}
