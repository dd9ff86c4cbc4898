//! Plugin host: a sandboxed state with a `host` library, and plugins loaded
//! from a directory of `*.lua` files.

use std::cell::RefCell;
use std::fs;
use std::io::{self, Write};
use std::path::Path;
use std::rc::Rc;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use luahost_core::{
    host_fn, BridgeError, CallArgs, Config, ForeignValue, Library, State, VERSION,
};
use mlua::Table;
use tracing::{debug, error, info, trace, warn};
use walkdir::WalkDir;

type Sink = Rc<RefCell<Box<dyn Write>>>;

pub struct PluginHost {
    state: State,
    plugins: Vec<String>,
}

impl PluginHost {
    /// Host whose `host.print` writes to stdout.
    pub fn new(config: &Config) -> Result<Self> {
        Self::with_output(config, Box::new(io::stdout()))
    }

    pub fn with_output(config: &Config, out: Box<dyn Write>) -> Result<Self> {
        let state = State::from_config(config).context("creating plugin state")?;
        install_host_library(&state, Rc::new(RefCell::new(out)))?;
        Ok(Self {
            state,
            plugins: Vec::new(),
        })
    }

    pub fn state(&self) -> &State {
        &self.state
    }

    pub fn into_state(self) -> State {
        self.state
    }

    /// Names of the plugins loaded so far, in load order.
    pub fn plugins(&self) -> &[String] {
        &self.plugins
    }

    /// Loads every `*.lua` file directly inside `dir`, in file name order.
    /// Each becomes `require`-able under its stem (when the package library
    /// is installed) and runs once.
    pub fn load_plugins(&mut self, dir: &Path) -> Result<usize> {
        if !dir.is_dir() {
            bail!("plugin directory {} does not exist", dir.display());
        }
        let mut count = 0;
        for entry in WalkDir::new(dir)
            .min_depth(1)
            .max_depth(1)
            .sort_by_file_name()
        {
            let entry = entry.with_context(|| format!("reading {}", dir.display()))?;
            let path = entry.path();
            if !entry.file_type().is_file() || path.extension().and_then(|e| e.to_str()) != Some("lua") {
                trace!(path = %path.display(), "skipping non-plugin file");
                continue;
            }
            self.load_plugin(path)?;
            count += 1;
        }
        info!(count, dir = %dir.display(), "plugins loaded");
        Ok(count)
    }

    pub fn load_plugin(&mut self, path: &Path) -> Result<()> {
        let name = path
            .file_stem()
            .and_then(|s| s.to_str())
            .with_context(|| format!("plugin {} has no usable name", path.display()))?
            .to_string();
        let source = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
        let file_name = format!("{name}.lua");
        let chunk = self
            .state
            .load_chunk(&source, &file_name)
            .with_context(|| format!("compiling plugin {file_name}"))?;

        if self.state.installed_libraries().contains(&Library::Package) {
            let package: Table = self.state.lua().globals().get("package")?;
            let preload: Table = package.get("preload")?;
            preload.set(name.as_str(), chunk.function().clone())?;
            self.state
                .call_global("require", vec![name.clone().into()])
                .with_context(|| format!("running plugin {file_name}"))?;
        } else {
            self.state
                .exec_chunk(&chunk, vec![name.clone().into()])
                .with_context(|| format!("running plugin {file_name}"))?;
        }
        debug!(plugin = %name, "plugin loaded");
        self.plugins.push(name);
        Ok(())
    }
}

fn install_host_library(state: &State, out: Sink) -> Result<()> {
    let print = host_fn(move |_, args| {
        let line = args
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("\t");
        writeln!(out.borrow_mut(), "[host] {line}")
            .map_err(|e| BridgeError::Io {
                context: "host.print".into(),
                source: Arc::new(e),
            })?;
        Ok(Vec::new())
    });

    let log = host_fn(|_, args: CallArgs| {
        let level = args.string(1)?;
        let msg = args.string(2)?;
        match level.as_str() {
            "trace" => trace!(target: "luahost::guest", "{msg}"),
            "debug" => debug!(target: "luahost::guest", "{msg}"),
            "info" => info!(target: "luahost::guest", "{msg}"),
            "warn" => warn!(target: "luahost::guest", "{msg}"),
            "error" => error!(target: "luahost::guest", "{msg}"),
            other => {
                return Err(BridgeError::bad_argument(
                    1,
                    format!("unknown log level '{other}'"),
                ))
            }
        }
        Ok(Vec::new())
    });

    let version = host_fn(|_, _| Ok(vec![ForeignValue::from(VERSION)]));

    state
        .register_library("host", [("print", print), ("log", log), ("version", version)])
        .context("registering host library")?;
    Ok(())
}
