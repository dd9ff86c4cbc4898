//! Host-side bookkeeping attached to every state: callbacks, objects and the
//! panic handler, all addressed by generation-checked ids.

use std::cell::RefCell;
use std::rc::Rc;

use mlua::Lua;

use crate::dispatch::{CallArgs, CallContext};
use crate::error::{BridgeError, Result};
use crate::object::HostObject;
use crate::slots::{CallbackId, Slots, StructId};
use crate::value::ForeignValue;

/// A host callable the guest can invoke through a proxy.
pub type HostFn = Rc<dyn Fn(&CallContext<'_>, CallArgs) -> Result<Vec<ForeignValue>>>;

pub(crate) type SharedObject = Rc<RefCell<Box<dyn HostObject>>>;

/// Wraps a closure as a [`HostFn`].
pub fn host_fn<F>(f: F) -> HostFn
where
    F: Fn(&CallContext<'_>, CallArgs) -> Result<Vec<ForeignValue>> + 'static,
{
    Rc::new(f)
}

#[derive(Default)]
struct HostRegistry {
    callbacks: Slots<HostFn>,
    structs: Slots<SharedObject>,
    panic_handler: Option<CallbackId>,
}

/// Cheap handle to one state's registry. The state keeps one copy and the
/// guest runtime keeps another in its app data, where the trampoline finds it.
///
/// Lookups clone the entry out and release the borrow before anything is
/// invoked, so callbacks may register, unregister or re-enter freely.
#[derive(Clone, Default)]
pub(crate) struct SharedRegistry(Rc<RefCell<HostRegistry>>);

impl SharedRegistry {
    pub(crate) fn of(lua: &Lua) -> mlua::Result<SharedRegistry> {
        lua.app_data_ref::<SharedRegistry>()
            .map(|r| r.clone())
            .ok_or_else(|| mlua::Error::runtime("luahost: state has no host registry"))
    }

    pub(crate) fn register_callback(&self, f: HostFn) -> CallbackId {
        CallbackId::from(self.0.borrow_mut().callbacks.insert(f))
    }

    pub(crate) fn unregister_callback(&self, id: CallbackId) -> bool {
        let mut inner = self.0.borrow_mut();
        if inner.panic_handler == Some(id) {
            inner.panic_handler = None;
        }
        inner.callbacks.remove(id.key()).is_some()
    }

    pub(crate) fn resolve_callback(&self, id: CallbackId) -> Result<HostFn> {
        self.0
            .borrow()
            .callbacks
            .get(id.key())
            .cloned()
            .ok_or(BridgeError::UnresolvedCallback(id))
    }

    pub(crate) fn has_callback(&self, id: CallbackId) -> bool {
        self.0.borrow().callbacks.contains(id.key())
    }

    pub(crate) fn register_struct(&self, obj: Box<dyn HostObject>) -> StructId {
        let obj = Rc::new(RefCell::new(obj));
        StructId::from(self.0.borrow_mut().structs.insert(obj))
    }

    pub(crate) fn unregister_struct(&self, id: StructId) -> bool {
        self.0.borrow_mut().structs.remove(id.key()).is_some()
    }

    pub(crate) fn resolve_struct(&self, id: StructId) -> Result<SharedObject> {
        self.0
            .borrow()
            .structs
            .get(id.key())
            .cloned()
            .ok_or(BridgeError::UnresolvedStruct(id))
    }

    pub(crate) fn has_struct(&self, id: StructId) -> bool {
        self.0.borrow().structs.contains(id.key())
    }

    /// Returns the handler that was installed before.
    pub(crate) fn set_panic_handler(&self, id: Option<CallbackId>) -> Option<CallbackId> {
        std::mem::replace(&mut self.0.borrow_mut().panic_handler, id)
    }

    pub(crate) fn panic_handler(&self) -> Option<CallbackId> {
        self.0.borrow().panic_handler
    }

    pub(crate) fn callback_count(&self) -> usize {
        self.0.borrow().callbacks.len()
    }

    pub(crate) fn struct_count(&self) -> usize {
        self.0.borrow().structs.len()
    }

    /// Revokes every id at once.
    pub(crate) fn clear(&self) {
        let mut inner = self.0.borrow_mut();
        inner.callbacks.clear();
        inner.structs.clear();
        inner.panic_handler = None;
    }
}
