//! Errors observable by the host.

use std::fmt;
use std::sync::{Arc, OnceLock};

use regex::Regex;
use thiserror::Error;

use crate::libs::Library;
use crate::slots::{CallbackId, StateHandle, StructId};
use crate::value::ForeignValue;

pub type Result<T, E = BridgeError> = std::result::Result<T, E>;

/// Every failure a boundary operation can report.
///
/// The type is `Clone + Send + Sync` so it can be raised inside the guest as
/// an external error and recovered unchanged once it unwinds back out.
#[derive(Clone, Debug, Error)]
pub enum BridgeError {
    #[error("syntax error: {message}")]
    Compile { chunk: String, message: String },

    #[error("no such callback: {0}")]
    UnresolvedCallback(CallbackId),

    #[error("no such struct: {0}")]
    UnresolvedStruct(StructId),

    #[error("state {0} is closed or was never issued")]
    StaleState(StateHandle),

    #[error("expected a {expected} proxy, got {got}")]
    NotAProxy { expected: &'static str, got: String },

    #[error("execution limit of {limit} instructions exceeded")]
    LimitExceeded { limit: u32 },

    #[error("not enough memory: {0}")]
    Allocation(String),

    #[error("{0}")]
    Panic(Box<GuestPanic>),

    #[error("host callback panicked: {0}")]
    HostPanic(String),

    #[error("'{0}' is not a function")]
    NotCallable(String),

    #[error("library '{0}' must be installed first")]
    MissingLibrary(Library),

    #[error("bad argument #{position} ({message})")]
    BadArgument { position: usize, message: String },

    #[error("{type_name} has no field '{field}'")]
    NoSuchField { type_name: String, field: String },

    #[error("{type_name} has no method '{method}'")]
    NoSuchMethod { type_name: String, method: String },

    #[error("{0} is already in use")]
    StructBusy(StructId),

    #[error("cannot convert guest {0} value")]
    Unsupported(String),

    #[error("value nesting deeper than {0} levels")]
    TooDeep(usize),

    #[error("unable to dump '{0}': not a Lua function")]
    Dump(String),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: Arc<std::io::Error>,
    },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Lua(#[from] mlua::Error),
}

impl BridgeError {
    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        BridgeError::Io {
            context: context.into(),
            source: Arc::new(source),
        }
    }

    pub fn bad_argument(position: usize, message: impl Into<String>) -> Self {
        BridgeError::BadArgument {
            position,
            message: message.into(),
        }
    }

    /// Faults guest code may not swallow with `pcall`.
    pub fn is_uncatchable(&self) -> bool {
        matches!(self, BridgeError::LimitExceeded { .. } | BridgeError::HostPanic(_))
    }

    pub fn as_panic(&self) -> Option<&GuestPanic> {
        match self {
            BridgeError::Panic(p) => Some(p),
            _ => None,
        }
    }
}

/// Where in guest source an error was raised.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SourceLocation {
    pub chunk: String,
    pub line: u32,
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.chunk, self.line)
    }
}

/// A guest error that reached the boundary uncaught.
#[derive(Clone, Debug)]
pub struct GuestPanic {
    /// Error message with the location prefix and traceback removed.
    pub message: String,
    pub location: Option<SourceLocation>,
    pub traceback: Vec<String>,
    /// What the panic handler returned, or the default `Error(message)`.
    pub payload: ForeignValue,
    pub handled: bool,
}

impl GuestPanic {
    /// Splits a raw Lua error string (`chunk:line: msg\nstack traceback:...`).
    pub fn parse(raw: &str) -> Self {
        let (head, trace) = match raw.split_once("\nstack traceback:") {
            Some((head, trace)) => (head, Some(trace)),
            None => (raw, None),
        };
        let traceback = trace
            .map(|t| {
                t.lines()
                    .map(str::trim)
                    .filter(|l| !l.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        let head = head.trim_end();
        let (location, message) = match location_re().captures(head) {
            Some(caps) => {
                let line = caps["line"].parse().unwrap_or(0);
                let location = SourceLocation {
                    chunk: caps["chunk"].to_string(),
                    line,
                };
                (Some(location), caps["msg"].to_string())
            }
            None => (None, head.to_string()),
        };

        GuestPanic {
            payload: ForeignValue::Error(message.clone()),
            message,
            location,
            traceback,
            handled: false,
        }
    }
}

impl fmt::Display for GuestPanic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.location {
            Some(loc) => write!(f, "{loc}: {}", self.message),
            None => f.write_str(&self.message),
        }
    }
}

fn location_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        // "runtime error: " is what mlua prefixes when it formats a RuntimeError
        Regex::new(r"(?s)^(?:runtime error: )?(?P<chunk>[^:\n]+):(?P<line>\d+): (?P<msg>.*)$")
            .expect("static regex")
    })
}
