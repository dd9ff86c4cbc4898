use mlua::{Function, Lua};

use crate::error::{BridgeError, Result};
use crate::panic::classify;

/// A compiled guest function and the name it reports in errors.
#[derive(Clone, Debug)]
pub struct Chunk {
    name: String,
    function: Function,
}

impl Chunk {
    /// Compiles text or precompiled bytecode. Nothing runs and nothing is
    /// bound in the guest.
    pub(crate) fn load(lua: &Lua, source: &[u8], name: &str) -> Result<Chunk> {
        let function = lua
            .load(source)
            .set_name(format!("={name}"))
            .into_function()
            .map_err(|e| match classify(e) {
                BridgeError::Compile { message, .. } => BridgeError::Compile {
                    chunk: name.to_string(),
                    message,
                },
                other => other,
            })?;
        Ok(Chunk {
            name: name.to_string(),
            function,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn function(&self) -> &Function {
        &self.function
    }

    pub(crate) fn dump(&self, strip: bool) -> Result<Vec<u8>> {
        dump_function(&self.function, &self.name, strip)
    }
}

pub(crate) fn dump_function(function: &Function, name: &str, strip: bool) -> Result<Vec<u8>> {
    let bytes = function.dump(strip);
    // host functions have no bytecode
    if bytes.is_empty() {
        return Err(BridgeError::Dump(name.to_string()));
    }
    Ok(bytes)
}

/// Blanks a leading `#!` line, keeping the newline so line numbers hold.
pub fn skip_shebang(source: &[u8]) -> &[u8] {
    if source.first() != Some(&b'#') {
        return source;
    }
    match source.iter().position(|&b| b == b'\n') {
        Some(end) => &source[end..],
        None => &[],
    }
}
