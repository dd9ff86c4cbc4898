//! Host objects exposed to the guest through struct proxies.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value as Json;

use crate::dispatch::{CallArgs, CallContext};
use crate::error::{BridgeError, Result};
use crate::value::ForeignValue;

/// A host value the guest can read, write and call methods on by name.
///
/// `proxy.field` calls [`get`](HostObject::get), `proxy.field = v` calls
/// [`set`](HostObject::set) and `proxy:name(...)` calls
/// [`call`](HostObject::call) for any name listed by
/// [`methods`](HostObject::methods).
pub trait HostObject {
    fn type_name(&self) -> &str;

    fn get(&self, field: &str) -> Option<ForeignValue>;

    fn set(&mut self, field: &str, value: ForeignValue) -> Result<()> {
        let _ = value;
        Err(BridgeError::NoSuchField {
            type_name: self.type_name().to_string(),
            field: field.to_string(),
        })
    }

    fn methods(&self) -> &[&'static str] {
        &[]
    }

    fn call(
        &mut self,
        ctx: &CallContext<'_>,
        method: &str,
        args: CallArgs,
    ) -> Result<Vec<ForeignValue>> {
        let _ = (ctx, args);
        Err(BridgeError::NoSuchMethod {
            type_name: self.type_name().to_string(),
            method: method.to_string(),
        })
    }
}

/// Exposes the public fields of any serde type, read and written through
/// its JSON representation.
#[derive(Clone, Debug)]
pub struct SerdeObject<T> {
    inner: T,
    type_name: String,
}

impl<T> SerdeObject<T>
where
    T: Serialize + DeserializeOwned,
{
    pub fn new(inner: T) -> Self {
        let full = std::any::type_name::<T>();
        let type_name = full.rsplit("::").next().unwrap_or(full).to_string();
        Self { inner, type_name }
    }

    pub fn inner(&self) -> &T {
        &self.inner
    }

    pub fn into_inner(self) -> T {
        self.inner
    }

    fn fields(&self) -> Option<serde_json::Map<String, Json>> {
        match serde_json::to_value(&self.inner) {
            Ok(Json::Object(map)) => Some(map),
            _ => None,
        }
    }
}

impl<T> HostObject for SerdeObject<T>
where
    T: Serialize + DeserializeOwned,
{
    fn type_name(&self) -> &str {
        &self.type_name
    }

    fn get(&self, field: &str) -> Option<ForeignValue> {
        self.fields()?.get(field).map(ForeignValue::from_json)
    }

    fn set(&mut self, field: &str, value: ForeignValue) -> Result<()> {
        let mut fields = self.fields().ok_or_else(|| BridgeError::NoSuchField {
            type_name: self.type_name.clone(),
            field: field.to_string(),
        })?;
        if !fields.contains_key(field) {
            return Err(BridgeError::NoSuchField {
                type_name: self.type_name.clone(),
                field: field.to_string(),
            });
        }
        fields.insert(field.to_string(), value.to_json());
        self.inner = serde_json::from_value(Json::Object(fields)).map_err(|e| {
            BridgeError::bad_argument(3, format!("cannot assign {}.{field}: {e}", self.type_name))
        })?;
        Ok(())
    }
}
