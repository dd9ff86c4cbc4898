//! Interpreter states and the handle table that owns them.

use std::cell::{Cell, RefCell};
use std::collections::BTreeSet;
use std::fs;
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::rc::Rc;

use mlua::{Function, Lua, LuaOptions, MultiValue, StdLib, Table, Value};
use tracing::debug;

use crate::bridge::{self, describe};
use crate::chunk::{self, Chunk};
use crate::config::Config;
use crate::dispatch::{self, global_function, panic_message, raise, CallArgs, CallContext};
use crate::error::{BridgeError, Result};
use crate::libs::{self, Library};
use crate::limits::{self, Allocator, ExecutionLimit};
use crate::object::HostObject;
use crate::panic::{self as guest_panic, classify};
use crate::registry::{HostFn, SharedRegistry};
use crate::slots::{CallbackId, Slots, StateHandle, StructId};
use crate::value::{ForeignValue, GuestFunction};

/// One embedded interpreter plus the host-side tables bound to it.
///
/// A state is neither `Send` nor `Sync`: it is driven by one thread at a
/// time, and threads that need a guest build their own. Dropping or
/// [closing](State::close) the state revokes every id it issued.
pub struct State {
    lua: Lua,
    registry: SharedRegistry,
    limit: ExecutionLimit,
    allocator: Cell<Allocator>,
    installed: RefCell<BTreeSet<Library>>,
    pcall_hidden: Cell<bool>,
    depth: Cell<u32>,
}

impl State {
    /// Creates a bare state: no globals at all until libraries are installed.
    pub fn new(allocator: Option<Allocator>) -> Result<State> {
        // SAFETY: the unsafe constructor unlocks the debug library and binary
        // chunks. The guest's `load`, `loadfile` and `dofile` are text-only,
        // so bytecode enters through `load_chunk` alone; `debug` and `package`
        // (whose C searcher loads native code) need an explicit install.
        let lua = unsafe { Lua::unsafe_new_with(StdLib::NONE, LuaOptions::new()) };
        guest_panic::install_trap(&lua)?;
        libs::strip_base(&lua)?;

        let registry = SharedRegistry::default();
        lua.set_app_data(registry.clone());

        let state = State {
            lua,
            registry,
            limit: ExecutionLimit::default(),
            allocator: Cell::new(Allocator::System),
            installed: RefCell::new(BTreeSet::new()),
            pcall_hidden: Cell::new(false),
            depth: Cell::new(0),
        };
        if let Some(allocator) = allocator {
            state.set_allocator(allocator)?;
        }
        debug!("state created");
        Ok(state)
    }

    /// Builds a state with the allocator, budget and libraries `config` names.
    pub fn from_config(config: &Config) -> Result<State> {
        config.validate()?;
        let state = State::new(config.memory_limit.map(Allocator::limited))?;
        state.set_hook_interval(config.hook_interval);
        state.set_execution_limit(config.execution_limit.unwrap_or(0));
        for lib in &config.libraries {
            state.install(*lib)?;
        }
        if config.hide_pcall {
            state.hide_pcall()?;
        }
        Ok(state)
    }

    /// Destroys the state. Ids it issued stop resolving.
    pub fn close(self) {
        self.registry.clear();
        debug!("state closed");
    }

    pub fn lua(&self) -> &Lua {
        &self.lua
    }

    // ---- resources ----------------------------------------------------------

    pub fn set_allocator(&self, allocator: Allocator) -> Result<()> {
        allocator.apply(&self.lua)?;
        self.allocator.set(allocator);
        Ok(())
    }

    pub fn allocator(&self) -> Allocator {
        self.allocator.get()
    }

    pub fn used_memory(&self) -> usize {
        self.lua.used_memory()
    }

    /// Instruction budget for each top-level entry; `0` clears it.
    pub fn set_execution_limit(&self, limit: u32) {
        self.limit.set(&self.lua, limit);
        debug!(limit, "execution limit set");
    }

    pub fn execution_limit(&self) -> Option<u32> {
        self.limit.get()
    }

    pub fn set_hook_interval(&self, interval: u32) {
        self.limit.set_interval(interval);
    }

    pub fn hook_interval(&self) -> u32 {
        self.limit.interval()
    }

    // ---- host registrations -------------------------------------------------

    pub fn register_callback<F>(&self, f: F) -> CallbackId
    where
        F: Fn(&CallContext<'_>, CallArgs) -> Result<Vec<ForeignValue>> + 'static,
    {
        let id = self.registry.register_callback(Rc::new(f));
        debug!(%id, "callback registered");
        id
    }

    pub fn unregister_callback(&self, id: CallbackId) -> bool {
        self.registry.unregister_callback(id)
    }

    pub fn register_struct(&self, obj: impl HostObject + 'static) -> StructId {
        let id = self.registry.register_struct(Box::new(obj));
        debug!(%id, "struct registered");
        id
    }

    pub fn unregister_struct(&self, id: StructId) -> bool {
        self.registry.unregister_struct(id)
    }

    /// Gives the host direct access to a registered object.
    pub fn with_struct<R>(&self, id: StructId, f: impl FnOnce(&mut dyn HostObject) -> R) -> Result<R> {
        let obj = self.registry.resolve_struct(id)?;
        let mut obj = obj.try_borrow_mut().map_err(|_| BridgeError::StructBusy(id))?;
        Ok(f(obj.as_mut()))
    }

    pub fn callback_count(&self) -> usize {
        self.registry.callback_count()
    }

    pub fn struct_count(&self) -> usize {
        self.registry.struct_count()
    }

    // ---- value bridge -------------------------------------------------------

    /// A guest proxy that dispatches to the callable behind `id`.
    pub fn push_callable(&self, id: CallbackId) -> Result<Value> {
        if !self.registry.has_callback(id) {
            return Err(BridgeError::UnresolvedCallback(id));
        }
        bridge::to_guest(&self.lua, ForeignValue::Callback(id))
    }

    pub fn push_struct(&self, id: StructId) -> Result<Value> {
        if !self.registry.has_struct(id) {
            return Err(BridgeError::UnresolvedStruct(id));
        }
        bridge::to_guest(&self.lua, ForeignValue::Struct(id))
    }

    /// Wraps a callable proxy in a plain guest function, for code that
    /// checks `type(f) == "function"`.
    pub fn push_callback(&self, proxy: &Value) -> Result<Function> {
        let id = self.to_callback_id(proxy)?;
        self.bind(id)
    }

    pub fn to_callback_id(&self, value: &Value) -> Result<CallbackId> {
        bridge::callback_id_of(value).ok_or_else(|| BridgeError::NotAProxy {
            expected: "callable",
            got: describe(value),
        })
    }

    pub fn to_struct_id(&self, value: &Value) -> Result<StructId> {
        bridge::struct_id_of(value).ok_or_else(|| BridgeError::NotAProxy {
            expected: "struct",
            got: describe(value),
        })
    }

    pub fn is_callable(&self, value: &Value) -> bool {
        bridge::callback_id_of(value).is_some()
    }

    pub fn is_struct(&self, value: &Value) -> bool {
        bridge::struct_id_of(value).is_some()
    }

    pub fn to_foreign(&self, value: Value) -> Result<ForeignValue> {
        bridge::from_guest(&self.lua, value, 0)
    }

    pub fn to_guest(&self, value: ForeignValue) -> Result<Value> {
        bridge::to_guest(&self.lua, value)
    }

    fn bind(&self, id: CallbackId) -> Result<Function> {
        let f = self
            .lua
            .create_function(move |lua, args: MultiValue| dispatch::invoke(lua, id, args))?;
        Ok(f)
    }

    /// Registers `f` and binds it to the global `name`.
    pub fn register<F>(&self, name: &str, f: F) -> Result<CallbackId>
    where
        F: Fn(&CallContext<'_>, CallArgs) -> Result<Vec<ForeignValue>> + 'static,
    {
        let id = self.register_callback(f);
        self.lua.globals().raw_set(name, self.bind(id)?)?;
        Ok(id)
    }

    /// Binds a module table to the global `name`, also visible to `require`
    /// when the package library is installed.
    pub fn register_library<'n>(
        &self,
        name: &str,
        funcs: impl IntoIterator<Item = (&'n str, HostFn)>,
    ) -> Result<Vec<CallbackId>> {
        let module = self.lua.create_table()?;
        let mut ids = Vec::new();
        for (field, f) in funcs {
            let id = self.registry.register_callback(f);
            module.raw_set(field, self.bind(id)?)?;
            ids.push(id);
        }
        self.lua.globals().raw_set(name, module.clone())?;
        if let Some(loaded) = self.package_loaded()? {
            loaded.raw_set(name, module)?;
        }
        debug!(library = name, functions = ids.len(), "host library registered");
        Ok(ids)
    }

    fn package_loaded(&self) -> Result<Option<Table>> {
        let Value::Table(package) = self.lua.globals().raw_get::<Value>("package")? else {
            return Ok(None);
        };
        match package.raw_get::<Value>("loaded")? {
            Value::Table(loaded) => Ok(Some(loaded)),
            _ => Ok(None),
        }
    }

    pub fn set_global(&self, name: &str, value: ForeignValue) -> Result<()> {
        let value = self.to_guest(value)?;
        self.lua.globals().raw_set(name, value)?;
        Ok(())
    }

    pub fn global(&self, name: &str) -> Result<ForeignValue> {
        let value: Value = self.lua.globals().raw_get(name)?;
        self.to_foreign(value)
    }

    // ---- panics and protected calls -----------------------------------------

    /// Installs the callable run once for every guest panic that reaches
    /// the host; `None` uninstalls. Returns the previous handler.
    pub fn install_panic_handler(&self, handler: Option<CallbackId>) -> Result<Option<CallbackId>> {
        if let Some(id) = handler {
            if !self.registry.has_callback(id) {
                return Err(BridgeError::UnresolvedCallback(id));
            }
        }
        Ok(self.registry.set_panic_handler(handler))
    }

    /// Runs host code that drives the guest. The one place where panics are
    /// caught, guest errors classified and the panic handler consulted.
    ///
    /// The outermost call arms a fresh execution budget and drops it on the
    /// way out; nested calls share it.
    pub fn protected_call<R>(&self, f: impl FnOnce(&Lua) -> mlua::Result<R>) -> Result<R> {
        let outermost = self.depth.get() == 0;
        if outermost {
            self.limit.arm(&self.lua);
        }
        self.depth.set(self.depth.get() + 1);
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| f(&self.lua)));
        self.depth.set(self.depth.get() - 1);
        if outermost {
            // a spent budget hooks every instruction; host-side Lua must not trip it
            limits::disarm(&self.lua);
        }

        match outcome {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(self.fail(err)),
            Err(payload) => Err(BridgeError::HostPanic(panic_message(payload.as_ref()))),
        }
    }

    fn fail(&self, err: mlua::Error) -> BridgeError {
        let thrown = guest_panic::thrown_value(&self.lua, &err);
        match classify(err) {
            BridgeError::Panic(mut p) => {
                if let Some(value) = thrown {
                    p.payload = value;
                }
                BridgeError::Panic(Box::new(guest_panic::handle(&self.lua, &self.registry, *p)))
            }
            other => other,
        }
    }

    // ---- libraries ----------------------------------------------------------

    /// Installs `lib`, overwriting its bindings if it is already present.
    pub fn install(&self, lib: Library) -> Result<()> {
        libs::install(&self.lua, lib).map_err(classify)?;
        self.installed.borrow_mut().insert(lib);
        if lib == Library::Base && self.pcall_hidden.get() {
            guest_panic::install_mediated_pcall(&self.lua).map_err(classify)?;
        }
        Ok(())
    }

    pub fn install_base(&self) -> Result<()> {
        self.install(Library::Base)
    }

    pub fn install_io(&self) -> Result<()> {
        self.install(Library::Io)
    }

    pub fn install_math(&self) -> Result<()> {
        self.install(Library::Math)
    }

    pub fn install_package(&self) -> Result<()> {
        self.install(Library::Package)
    }

    pub fn install_string(&self) -> Result<()> {
        self.install(Library::String)
    }

    pub fn install_table(&self) -> Result<()> {
        self.install(Library::Table)
    }

    pub fn install_os(&self) -> Result<()> {
        self.install(Library::Os)
    }

    pub fn install_coroutine(&self) -> Result<()> {
        self.install(Library::Coroutine)
    }

    pub fn install_debug(&self) -> Result<()> {
        self.install(Library::Debug)
    }

    pub fn install_bit32(&self) -> Result<()> {
        self.install(Library::Bit32)
    }

    /// Replaces `pcall`/`xpcall` with versions that cannot catch execution
    /// limit or host panic faults. The originals stay reachable as
    /// `unsafe_pcall`/`unsafe_xpcall`.
    pub fn hide_pcall(&self) -> Result<()> {
        if !self.installed.borrow().contains(&Library::Base) {
            return Err(BridgeError::MissingLibrary(Library::Base));
        }
        guest_panic::install_mediated_pcall(&self.lua).map_err(classify)?;
        self.pcall_hidden.set(true);
        debug!("pcall hidden");
        Ok(())
    }

    pub fn installed_libraries(&self) -> Vec<Library> {
        self.installed.borrow().iter().copied().collect()
    }

    // ---- chunks -------------------------------------------------------------

    /// Compiles text or bytecode under `name`, which guest errors report.
    pub fn load_chunk(&self, source: &[u8], name: &str) -> Result<Chunk> {
        Chunk::load(&self.lua, source, name)
    }

    pub fn dump_chunk(&self, chunk: &Chunk, strip: bool) -> Result<Vec<u8>> {
        chunk.dump(strip)
    }

    pub fn dump_function(&self, function: &GuestFunction, strip: bool) -> Result<Vec<u8>> {
        let f: Function = self.lua.registry_value(&function.0)?;
        chunk::dump_function(&f, "function", strip)
    }

    pub fn exec_chunk(&self, chunk: &Chunk, args: Vec<ForeignValue>) -> Result<Vec<ForeignValue>> {
        self.call(chunk.function().clone(), args)
    }

    pub fn do_string(&self, source: &str, name: &str) -> Result<Vec<ForeignValue>> {
        let chunk = self.load_chunk(source.as_bytes(), name)?;
        self.exec_chunk(&chunk, Vec::new())
    }

    /// Loads and runs a file, named after its file name in errors.
    pub fn do_file(&self, path: impl AsRef<Path>) -> Result<Vec<ForeignValue>> {
        let path = path.as_ref();
        let source = fs::read(path)
            .map_err(|e| BridgeError::io(format!("reading {}", path.display()), e))?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        let chunk = self.load_chunk(chunk::skip_shebang(&source), &name)?;
        self.exec_chunk(&chunk, Vec::new())
    }

    pub fn call_global(&self, name: &str, args: Vec<ForeignValue>) -> Result<Vec<ForeignValue>> {
        let f = global_function(&self.lua, name)?;
        self.call(f, args)
    }

    pub fn call_function(
        &self,
        function: &GuestFunction,
        args: Vec<ForeignValue>,
    ) -> Result<Vec<ForeignValue>> {
        let f: Function = self.lua.registry_value(&function.0)?;
        self.call(f, args)
    }

    fn call(&self, f: Function, args: Vec<ForeignValue>) -> Result<Vec<ForeignValue>> {
        self.protected_call(|lua| {
            let args = bridge::to_guest_multi(lua, args).map_err(raise)?;
            let out = guest_panic::call_trapped(lua, &f, args)?;
            bridge::from_guest_multi(lua, out).map_err(raise)
        })
    }
}

/// Owns states behind checked handles. A handle stops resolving once its
/// state is destroyed, and never resolves to a later state.
#[derive(Default)]
pub struct StateRegistry {
    states: Slots<State>,
}

impl StateRegistry {
    pub fn new() -> Self {
        Self {
            states: Slots::new(),
        }
    }

    pub fn create(&mut self, allocator: Option<Allocator>) -> Result<StateHandle> {
        let state = State::new(allocator)?;
        Ok(self.adopt(state))
    }

    pub fn adopt(&mut self, state: State) -> StateHandle {
        let handle = StateHandle::from(self.states.insert(state));
        debug!(%handle, "state adopted");
        handle
    }

    /// Destroys the state; a second destroy of the same handle fails.
    pub fn destroy(&mut self, handle: StateHandle) -> Result<()> {
        let state = self
            .states
            .remove(handle.key())
            .ok_or(BridgeError::StaleState(handle))?;
        state.close();
        Ok(())
    }

    pub fn get(&self, handle: StateHandle) -> Result<&State> {
        self.states
            .get(handle.key())
            .ok_or(BridgeError::StaleState(handle))
    }

    pub fn set_allocator(&self, handle: StateHandle, allocator: Allocator) -> Result<()> {
        self.get(handle)?.set_allocator(allocator)
    }

    pub fn set_execution_limit(&self, handle: StateHandle, limit: u32) -> Result<()> {
        self.get(handle)?.set_execution_limit(limit);
        Ok(())
    }

    pub fn contains(&self, handle: StateHandle) -> bool {
        self.states.contains(handle.key())
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}
