//! Tagged foreign values: the only shape in which data crosses the boundary.

use std::fmt;
use std::sync::Arc;

use mlua::RegistryKey;
use serde_json::{Map, Number, Value as Json};

use crate::slots::{CallbackId, StructId};

/// Which variant a [`ForeignValue`] holds. `None` means "no value".
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TypeTag {
    None,
    Boolean,
    Integer,
    Number,
    String,
    Bytes,
    Table,
    Callback,
    Struct,
    Function,
    Error,
}

impl TypeTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            TypeTag::None => "none",
            TypeTag::Boolean => "boolean",
            TypeTag::Integer => "integer",
            TypeTag::Number => "number",
            TypeTag::String => "string",
            TypeTag::Bytes => "bytes",
            TypeTag::Table => "table",
            TypeTag::Callback => "callback",
            TypeTag::Struct => "struct",
            TypeTag::Function => "function",
            TypeTag::Error => "error",
        }
    }
}

impl fmt::Display for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A guest function held by the host. It stays alive in the Lua registry
/// for as long as any clone of this handle exists.
#[derive(Clone)]
pub struct GuestFunction(pub(crate) Arc<RegistryKey>);

impl PartialEq for GuestFunction {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for GuestFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("GuestFunction(..)")
    }
}

/// A host-side value passed into or received from the guest.
#[derive(Clone, Debug, Default, PartialEq)]
pub enum ForeignValue {
    #[default]
    None,
    Boolean(bool),
    Integer(i64),
    Number(f64),
    String(String),
    /// Guest string that is not valid UTF-8.
    Bytes(Vec<u8>),
    /// Key/value pairs of a guest table, in traversal order.
    Table(Vec<(ForeignValue, ForeignValue)>),
    Callback(CallbackId),
    Struct(StructId),
    Function(GuestFunction),
    /// Error payload produced by the panic bridge.
    Error(String),
}

impl ForeignValue {
    pub fn tag(&self) -> TypeTag {
        match self {
            ForeignValue::None => TypeTag::None,
            ForeignValue::Boolean(_) => TypeTag::Boolean,
            ForeignValue::Integer(_) => TypeTag::Integer,
            ForeignValue::Number(_) => TypeTag::Number,
            ForeignValue::String(_) => TypeTag::String,
            ForeignValue::Bytes(_) => TypeTag::Bytes,
            ForeignValue::Table(_) => TypeTag::Table,
            ForeignValue::Callback(_) => TypeTag::Callback,
            ForeignValue::Struct(_) => TypeTag::Struct,
            ForeignValue::Function(_) => TypeTag::Function,
            ForeignValue::Error(_) => TypeTag::Error,
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, ForeignValue::None)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ForeignValue::String(s) | ForeignValue::Error(s) => Some(s),
            _ => None,
        }
    }

    /// Integers as-is, floats only when they have an exact integer value.
    pub fn as_integer(&self) -> Option<i64> {
        match *self {
            ForeignValue::Integer(n) => Some(n),
            ForeignValue::Number(n) if n.fract() == 0.0 && n.is_finite() => {
                let i = n as i64;
                (i as f64 == n).then_some(i)
            }
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match *self {
            ForeignValue::Integer(n) => Some(n as f64),
            ForeignValue::Number(n) => Some(n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match *self {
            ForeignValue::Boolean(b) => Some(b),
            _ => None,
        }
    }

    /// Lua truthiness: everything except `None` and `false`.
    pub fn truthy(&self) -> bool {
        !matches!(self, ForeignValue::None | ForeignValue::Boolean(false))
    }

    /// Value stored under `key` in a `Table`.
    pub fn field(&self, key: &str) -> Option<&ForeignValue> {
        match self {
            ForeignValue::Table(pairs) => pairs
                .iter()
                .find(|(k, _)| k.as_str() == Some(key))
                .map(|(_, v)| v),
            _ => None,
        }
    }

    /// Builds a sequence table (`{[1] = a, [2] = b, ...}`).
    pub fn list(items: impl IntoIterator<Item = ForeignValue>) -> Self {
        ForeignValue::Table(
            items
                .into_iter()
                .enumerate()
                .map(|(i, v)| (ForeignValue::Integer(i as i64 + 1), v))
                .collect(),
        )
    }

    pub fn from_json(json: &Json) -> Self {
        match json {
            Json::Null => ForeignValue::None,
            Json::Bool(b) => ForeignValue::Boolean(*b),
            Json::Number(n) => match n.as_i64() {
                Some(i) => ForeignValue::Integer(i),
                None => ForeignValue::Number(n.as_f64().unwrap_or(f64::NAN)),
            },
            Json::String(s) => ForeignValue::String(s.clone()),
            Json::Array(items) => ForeignValue::list(items.iter().map(ForeignValue::from_json)),
            Json::Object(map) => ForeignValue::Table(
                map.iter()
                    .map(|(k, v)| (ForeignValue::String(k.clone()), ForeignValue::from_json(v)))
                    .collect(),
            ),
        }
    }

    /// JSON rendering. Sequence tables become arrays, other tables objects
    /// keyed by the display form of their keys; handles render as strings.
    pub fn to_json(&self) -> Json {
        match self {
            ForeignValue::None => Json::Null,
            ForeignValue::Boolean(b) => Json::Bool(*b),
            ForeignValue::Integer(i) => Json::Number((*i).into()),
            ForeignValue::Number(n) => Number::from_f64(*n).map(Json::Number).unwrap_or(Json::Null),
            ForeignValue::String(s) => Json::String(s.clone()),
            ForeignValue::Bytes(b) => Json::String(String::from_utf8_lossy(b).into_owned()),
            ForeignValue::Table(pairs) => {
                if is_sequence(pairs) {
                    let mut items: Vec<(i64, Json)> = pairs
                        .iter()
                        .filter_map(|(k, v)| k.as_integer().map(|i| (i, v.to_json())))
                        .collect();
                    items.sort_by_key(|(i, _)| *i);
                    Json::Array(items.into_iter().map(|(_, v)| v).collect())
                } else {
                    let mut map = Map::new();
                    for (k, v) in pairs {
                        map.insert(k.to_string(), v.to_json());
                    }
                    Json::Object(map)
                }
            }
            other => Json::String(other.to_string()),
        }
    }
}

fn is_sequence(pairs: &[(ForeignValue, ForeignValue)]) -> bool {
    if pairs.is_empty() {
        return false;
    }
    let mut keys: Vec<i64> = Vec::with_capacity(pairs.len());
    for (k, _) in pairs {
        match k {
            ForeignValue::Integer(i) => keys.push(*i),
            _ => return false,
        }
    }
    keys.sort_unstable();
    keys.iter().enumerate().all(|(i, k)| *k == i as i64 + 1)
}

impl fmt::Display for ForeignValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ForeignValue::None => f.write_str("nil"),
            ForeignValue::Boolean(b) => write!(f, "{b}"),
            ForeignValue::Integer(i) => write!(f, "{i}"),
            ForeignValue::Number(n) => write!(f, "{n}"),
            ForeignValue::String(s) => f.write_str(s),
            ForeignValue::Bytes(b) => f.write_str(&String::from_utf8_lossy(b)),
            ForeignValue::Table(pairs) => write!(f, "table({} entries)", pairs.len()),
            ForeignValue::Callback(id) => write!(f, "{id}"),
            ForeignValue::Struct(id) => write!(f, "{id}"),
            ForeignValue::Function(_) => f.write_str("function"),
            ForeignValue::Error(msg) => write!(f, "error: {msg}"),
        }
    }
}

impl From<bool> for ForeignValue {
    fn from(b: bool) -> Self {
        ForeignValue::Boolean(b)
    }
}

impl From<i64> for ForeignValue {
    fn from(i: i64) -> Self {
        ForeignValue::Integer(i)
    }
}

impl From<f64> for ForeignValue {
    fn from(n: f64) -> Self {
        ForeignValue::Number(n)
    }
}

impl From<&str> for ForeignValue {
    fn from(s: &str) -> Self {
        ForeignValue::String(s.to_string())
    }
}

impl From<String> for ForeignValue {
    fn from(s: String) -> Self {
        ForeignValue::String(s)
    }
}

impl From<CallbackId> for ForeignValue {
    fn from(id: CallbackId) -> Self {
        ForeignValue::Callback(id)
    }
}

impl From<StructId> for ForeignValue {
    fn from(id: StructId) -> Self {
        ForeignValue::Struct(id)
    }
}

impl<T: Into<ForeignValue>> From<Option<T>> for ForeignValue {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or_default()
    }
}
