//! Sandbox configuration, read from `config.lua` or `config.yaml`.

use std::fs;
use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use mlua::{Lua, LuaOptions, LuaSerdeExt, StdLib, Value};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{BridgeError, Result};
use crate::libs::Library;
use crate::limits::{ExecutionLimit, DEFAULT_HOOK_INTERVAL};
use crate::panic::classify;

/// Instructions `config.lua` may run before it is abandoned.
const CONFIG_EXECUTION_LIMIT: u32 = 1_000_000;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub libraries: Vec<Library>,
    /// Instructions per top-level call; unset means unlimited.
    pub execution_limit: Option<u32>,
    pub hook_interval: u32,
    /// Allocator ceiling in bytes.
    pub memory_limit: Option<usize>,
    pub hide_pcall: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            libraries: vec![
                Library::Base,
                Library::Coroutine,
                Library::Math,
                Library::String,
                Library::Table,
            ],
            execution_limit: None,
            hook_interval: DEFAULT_HOOK_INTERVAL,
            memory_limit: None,
            hide_pcall: false,
        }
    }
}

impl Config {
    /// Reads a `.lua` or `.yaml`/`.yml` file and validates it.
    pub fn load(path: &Path) -> Result<Config> {
        let text = fs::read_to_string(path)
            .map_err(|e| BridgeError::io(format!("reading {}", path.display()), e))?;
        let config = match path.extension().and_then(|e| e.to_str()) {
            Some("lua") => Self::from_lua(&text)?,
            Some("yaml" | "yml") => Self::from_yaml(&text)?,
            _ => {
                return Err(BridgeError::Config(format!(
                    "{}: expected a .lua or .yaml file",
                    path.display()
                )))
            }
        };
        config.validate()?;
        debug!(path = %path.display(), "config loaded");
        Ok(config)
    }

    /// Evaluates `source` in an empty state; it must return a table.
    pub fn from_lua(source: &str) -> Result<Config> {
        let lua = Lua::new_with(StdLib::NONE, LuaOptions::new())?;
        let budget = ExecutionLimit::default();
        budget.set(&lua, CONFIG_EXECUTION_LIMIT);
        budget.arm(&lua);
        let value: Value = lua
            .load(source)
            .set_name("=config")
            .eval()
            .map_err(|e| match classify(e) {
                BridgeError::LimitExceeded { limit } => BridgeError::Config(format!(
                    "config.lua did not finish within {limit} instructions"
                )),
                other => other,
            })?;
        if !value.is_table() {
            return Err(BridgeError::Config(format!(
                "config.lua must return a table, got {}",
                value.type_name()
            )));
        }
        lua.from_value(value)
            .map_err(|e| BridgeError::Config(e.to_string()))
    }

    pub fn from_yaml(text: &str) -> Result<Config> {
        serde_yaml::from_str(text).map_err(|e| BridgeError::Config(e.to_string()))
    }

    pub fn validate(&self) -> Result<()> {
        if self.hook_interval == 0 {
            return Err(BridgeError::Config("hook_interval must be positive".into()));
        }
        if self.memory_limit == Some(0) {
            return Err(BridgeError::Config(
                "memory_limit must be positive; leave it unset for no limit".into(),
            ));
        }
        if self.hide_pcall && !self.libraries.contains(&Library::Base) {
            return Err(BridgeError::Config(
                "hide_pcall needs the base library".into(),
            ));
        }
        Ok(())
    }

    /// The first existing `config.lua`/`config.yaml` in the user config dir.
    pub fn default_path() -> Option<PathBuf> {
        let dirs = ProjectDirs::from("dev", "luahost", "luahost")?;
        ["config.lua", "config.yaml", "config.yml"]
            .iter()
            .map(|name| dirs.config_dir().join(name))
            .find(|p| p.exists())
    }

    /// User config if present; defaults when missing or broken.
    pub fn load_default() -> Config {
        let Some(path) = Self::default_path() else {
            return Config::default();
        };
        match Self::load(&path) {
            Ok(config) => config,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "ignoring broken config");
                Config::default()
            }
        }
    }
}
