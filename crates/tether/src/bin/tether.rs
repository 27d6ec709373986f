use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tether::host::{self, ConsoleLog};
use tether::{Bridge, BridgeConfig, Engine, GuestModule, INTRINSICS, Linker};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "tether", about = "Host/guest value bridge for WebAssembly guests")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show a module's bridge imports and exports and how they resolve.
    Inspect {
        /// Path to a .wasm or .wat file.
        file: PathBuf,
        /// Bridge configuration (TOML).
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Instantiate a guest against the sample host and drive its event loop.
    Run {
        /// Path to a .wasm or .wat file.
        file: PathBuf,
        /// Bridge configuration (TOML).
        #[arg(long)]
        config: Option<PathBuf>,
        /// Virtual milliseconds of timers to run after start.
        #[arg(long, default_value_t = 0)]
        ticks: u64,
        /// Export to call after start, taking no arguments.
        #[arg(long)]
        call: Option<String>,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Inspect { file, config } => inspect(file, config),
        Command::Run {
            file,
            config,
            ticks,
            call,
        } => {
            let runtime = tokio::runtime::Builder::new_current_thread().build()?;
            runtime.block_on(run(file, config, ticks, call))
        }
    }
}

fn engine(config: Option<PathBuf>) -> anyhow::Result<Engine> {
    let config = match config {
        Some(path) => BridgeConfig::load(path)?,
        None => BridgeConfig::default(),
    };
    Engine::new(config)
}

fn inspect(file: PathBuf, config: Option<PathBuf>) -> anyhow::Result<()> {
    let engine = engine(config)?;
    let module = GuestModule::from_file(&engine, &file)?;
    let mut linker = Linker::new(&engine);
    host::register_defaults(&mut linker);
    let names = &engine.config().imports;

    println!("imports:");
    for import in module.abi().imports_from(&names.intrinsics) {
        let status = if INTRINSICS.contains(&import.name.as_str()) {
            "intrinsic"
        } else {
            "unknown intrinsic"
        };
        println!("  {}::{}  [{status}]", import.module, import.name);
    }
    for import in module.abi().imports_from(&names.host) {
        let sig = import.signature.clone().unwrap_or_default();
        let status = match linker.get(&import.name) {
            Some(cap) if cap.signature() == sig => {
                if cap.fallible { "fallible" } else { "ok" }
            }
            Some(cap) => {
                println!("  {}::{} {sig}  [expected {}]", import.module, import.name, cap.signature());
                continue;
            }
            None => "missing",
        };
        println!("  {}::{} {sig}  [{status}]", import.module, import.name);
    }
    for import in &module.abi().imports {
        if import.module != names.intrinsics && import.module != names.host {
            println!("  {}::{}  [unresolvable module]", import.module, import.name);
        }
    }

    println!("exports:");
    let mut exports: Vec<_> = module.abi().exports.values().collect();
    exports.sort_by(|a, b| a.name.cmp(&b.name));
    for export in exports {
        match &export.signature {
            Some(sig) => println!("  {} {sig}", export.name),
            None => println!("  {} ({:?})", export.name, export.kind),
        }
    }
    if let Err(err) = module.check_exports(&engine.config().exports) {
        println!("error: {err}");
    }
    Ok(())
}

async fn run(file: PathBuf, config: Option<PathBuf>, ticks: u64, call: Option<String>) -> anyhow::Result<()> {
    let engine = engine(config)?;
    let mut linker = Linker::new(&engine);
    host::register_defaults(&mut linker);

    let mut bridge = Bridge::new(&engine, linker);
    bridge.init(file).await?;
    if let Some(name) = call {
        bridge.call::<(), ()>(&name, ())?;
    }
    bridge.run_microtasks()?;
    let fired = bridge.run_timers(Duration::from_millis(ticks))?;

    let printed = bridge.extension::<ConsoleLog>().map_or(0, |log| log.entries.len());
    println!(
        "ran {fired} timers, {printed} console messages, {} live handles, {} pending timers",
        bridge.heap().live_count(),
        bridge.events().pending_timers()
    );
    Ok(())
}
