use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use luahost_core::{chunk::skip_shebang, Config, ForeignValue, Library, State};
use luahost_plugin::PluginHost;
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(version, about)]
struct Cli {
    /// Sandbox config (.lua or .yaml); defaults to the user config dir
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Run a script; extra arguments are passed as `...`
    Run {
        file: PathBuf,
        #[command(flatten)]
        sandbox: Sandbox,
        #[arg(trailing_var_arg = true)]
        args: Vec<String>,
    },
    /// Run a snippet given on the command line
    Eval {
        code: String,
        #[command(flatten)]
        sandbox: Sandbox,
    },
    /// Precompile a script to bytecode
    Compile {
        file: PathBuf,
        #[arg(short, long)]
        output: PathBuf,
        /// Drop debug information
        #[arg(long)]
        strip: bool,
    },
    /// Syntax-check a script without running it
    Check { file: PathBuf },
    /// List installable libraries
    Libs,
}

/// Per-run overrides of the loaded config.
#[derive(Args, Clone, Debug, Default)]
struct Sandbox {
    /// Instruction budget (0 = unlimited)
    #[arg(long)]
    limit: Option<u32>,
    /// Allocator ceiling in bytes
    #[arg(long)]
    memory: Option<usize>,
    #[arg(long, value_delimiter = ',')]
    libs: Option<Vec<Library>>,
    /// Directory of plugins to load first
    #[arg(long)]
    plugins: Option<PathBuf>,
    #[arg(long)]
    hide_pcall: bool,
    /// Print results as JSON
    #[arg(long)]
    json: bool,
}

impl Sandbox {
    fn apply(&self, base: &Config) -> Config {
        let mut cfg = base.clone();
        if let Some(limit) = self.limit {
            cfg.execution_limit = (limit > 0).then_some(limit);
        }
        if let Some(memory) = self.memory {
            cfg.memory_limit = Some(memory);
        }
        if let Some(libs) = &self.libs {
            cfg.libraries = libs.clone();
        }
        if self.hide_pcall {
            cfg.hide_pcall = true;
        }
        cfg
    }

    fn host(&self, base: &Config) -> Result<PluginHost> {
        let cfg = self.apply(base);
        debug!(?cfg, "sandbox");
        let mut host = PluginHost::new(&cfg)?;
        if let Some(dir) = &self.plugins {
            host.load_plugins(dir)?;
        }
        Ok(host)
    }
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let cfg = match &cli.config {
        Some(path) => Config::load(path).with_context(|| format!("loading {}", path.display()))?,
        None => Config::load_default(),
    };

    match cli.command {
        Cmd::Run {
            file,
            sandbox,
            args,
        } => {
            let host = sandbox.host(&cfg)?;
            let state = host.state();
            let chunk = load(state, &file)?;
            let args = args.into_iter().map(ForeignValue::from).collect();
            let out = state.exec_chunk(&chunk, args)?;
            print_results(&out, sandbox.json)?;
        }
        Cmd::Eval { code, sandbox } => {
            let host = sandbox.host(&cfg)?;
            let out = host.state().do_string(&code, "eval")?;
            print_results(&out, sandbox.json)?;
        }
        Cmd::Compile {
            file,
            output,
            strip,
        } => {
            let state = State::new(None)?;
            let chunk = load(&state, &file)?;
            let bytes = state.dump_chunk(&chunk, strip)?;
            fs::write(&output, &bytes).with_context(|| format!("writing {}", output.display()))?;
            println!("Wrote {} bytes to {}", bytes.len(), output.display());
        }
        Cmd::Check { file } => {
            let state = State::new(None)?;
            load(&state, &file)?;
            println!("{}: ok", file.display());
        }
        Cmd::Libs => {
            for lib in Library::ALL {
                let mut notes = Vec::new();
                if cfg.libraries.contains(&lib) {
                    notes.push("enabled");
                }
                if lib.is_unsafe() {
                    notes.push("unsafe");
                }
                println!("{:<10} {}", lib.name(), notes.join(", "));
            }
        }
    }
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load(state: &State, file: &Path) -> Result<luahost_core::Chunk> {
    let source = fs::read(file).with_context(|| format!("reading {}", file.display()))?;
    let name = file
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| file.display().to_string());
    Ok(state.load_chunk(skip_shebang(&source), &name)?)
}

fn print_results(values: &[ForeignValue], json: bool) -> Result<()> {
    if json {
        let arr = serde_json::Value::Array(values.iter().map(ForeignValue::to_json).collect());
        println!("{}", serde_json::to_string_pretty(&arr)?);
    } else {
        for v in values {
            println!("{v}");
        }
    }
    Ok(())
}
