//! Boundary layer between a Rust host and an embedded Lua 5.4 interpreter.
//!
//! The host owns [`State`]s, registers callables and objects under integer
//! ids, opts into standard libraries one at a time, and gets every guest
//! failure back as a [`BridgeError`].

// STATES
pub mod state;
pub use state::{State, StateRegistry};

// Values crossing the boundary
pub mod value;
pub use value::{ForeignValue, GuestFunction, TypeTag};
mod bridge;
pub use bridge::MAX_DEPTH;

// Ids + host tables
pub mod slots;
pub use slots::{CallbackId, SlotKey, StateHandle, StructId};
mod registry;
pub use registry::{host_fn, HostFn};
pub mod object;
pub use object::{HostObject, SerdeObject};

// Dispatch
pub mod dispatch;
pub use dispatch::{CallArgs, CallContext};

// Errors + panics
pub mod error;
pub use error::{BridgeError, GuestPanic, Result, SourceLocation};
mod panic;

// Libraries, chunks, limits
pub mod libs;
pub use libs::Library;
pub mod chunk;
pub use chunk::Chunk;
pub mod limits;
pub use limits::{Allocator, DEFAULT_HOOK_INTERVAL};

pub mod config;
pub use config::Config;

/// Version reported to guest scripts.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
