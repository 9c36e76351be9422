//! FTL command-line interface.

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use serde_json::{Map, Value};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use ftl::automation::AutomationContext;
use ftl::dispatch::ArgumentConfig;
use ftl::events::{NdjsonSink, NullSink, SharedSink, TextSink};
use ftl::gate::{default_cache_dir, GateBuildConfig, GateBuilder};
use ftl::inventory::Inventory;

#[derive(Parser)]
#[command(name = "ftl", version, about = "Fleet automation through persistent gates")]
struct Cli {
    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a module against a target (host or group)
    Run {
        /// Inventory file
        #[arg(short, long)]
        inventory: Option<PathBuf>,

        /// State file for dynamic hosts
        #[arg(short, long)]
        state: Option<PathBuf>,

        /// Module search directory (repeatable)
        #[arg(short = 'M', long = "module-dir")]
        module_dirs: Vec<PathBuf>,

        /// Module to run
        #[arg(short, long)]
        module: String,

        /// Module argument key=value (repeatable)
        #[arg(short, long = "arg")]
        args: Vec<String>,

        /// Concurrent hosts
        #[arg(long, default_value_t = 10)]
        forks: usize,

        /// Event stream format: none, text, or ndjson
        #[arg(long, default_value = "text")]
        events: String,

        /// Allow destructive commands
        #[arg(long)]
        allow_destructive: bool,

        /// Per-module timeout in seconds
        #[arg(long)]
        timeout: Option<u64>,

        /// Host or group to target
        target: String,
    },

    /// Build a gate archive and print its path and hash
    BuildGate {
        /// Module to include (repeatable)
        #[arg(short, long = "module")]
        modules: Vec<String>,

        /// Read module names from a file, one per line
        #[arg(short = 'f', long)]
        from_modules_file: Option<PathBuf>,

        /// Module search directory (repeatable)
        #[arg(short = 'M', long = "module-dir")]
        module_dirs: Vec<PathBuf>,

        /// Requirements file (repeatable)
        #[arg(short, long = "requirements")]
        requirements: Vec<PathBuf>,

        /// Target interpreter
        #[arg(short = 'I', long, default_value = "/usr/bin/python3")]
        interpreter: String,

        /// Cache directory for built gates
        #[arg(short, long)]
        cache_dir: Option<PathBuf>,
    },

    /// List inventory hosts and groups
    Inventory {
        /// Inventory file
        #[arg(short, long)]
        inventory: PathBuf,

        /// Emit JSON instead of text
        #[arg(long)]
        json: bool,
    },
}

fn init_logging(verbose: bool, debug: bool) {
    let filter = if debug {
        EnvFilter::new("debug")
    } else if verbose {
        EnvFilter::new("info")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Parse `key=value` pairs; values that parse as JSON keep their type.
fn parse_args(pairs: &[String]) -> anyhow::Result<Map<String, Value>> {
    let mut map = Map::new();
    for pair in pairs {
        let (key, value) = pair
            .split_once('=')
            .with_context(|| format!("argument '{pair}' is not key=value"))?;
        let value = serde_json::from_str(value)
            .unwrap_or_else(|_| Value::String(value.to_string()));
        map.insert(key.to_string(), value);
    }
    Ok(map)
}

fn make_sink(kind: &str) -> anyhow::Result<SharedSink> {
    Ok(match kind {
        "none" => Arc::new(NullSink),
        "text" => Arc::new(TextSink::stderr()),
        "ndjson" => Arc::new(NdjsonSink::stdout()),
        other => anyhow::bail!("unknown event format '{other}' (use none, text, or ndjson)"),
    })
}

async fn cmd_run(
    inventory: Option<PathBuf>,
    state: Option<PathBuf>,
    module_dirs: Vec<PathBuf>,
    module: String,
    args: Vec<String>,
    forks: usize,
    events: String,
    allow_destructive: bool,
    timeout: Option<u64>,
    target: String,
) -> anyhow::Result<i32> {
    let module_args = parse_args(&args)?;

    let mut builder = AutomationContext::builder()
        .forks(forks)
        .allow_destructive(allow_destructive)
        .sink(make_sink(&events)?);
    if let Some(path) = inventory {
        builder = builder.inventory_file(path);
    }
    if let Some(path) = state {
        builder = builder.state_file(path);
    }
    for dir in module_dirs {
        builder = builder.module_dir(dir);
    }
    if let Some(secs) = timeout {
        builder = builder.module_timeout(std::time::Duration::from_secs(secs));
    }

    let ctx = match builder.build() {
        Ok(ctx) => ctx,
        Err(e) => {
            eprintln!("error: {e}");
            return Ok(e.exit_code().max(2));
        }
    };

    let mut config = ArgumentConfig::new();
    for (k, v) in module_args {
        config.module_args.insert(k, v.into());
    }

    let run = ctx.run_module(&target, &module, config);
    let interrupted = tokio::select! {
        results = run => {
            match results {
                Ok(results) => {
                    for result in &results {
                        let status = match (result.success, result.changed) {
                            (true, true) => "changed",
                            (true, false) => "ok",
                            (false, _) => "failed",
                        };
                        println!(
                            "{} | {} | {}",
                            result.host,
                            status,
                            serde_json::to_string(&result.output)?
                        );
                        if let Some(error) = &result.error {
                            println!("{} | error: {}", result.host, error);
                        }
                    }
                }
                Err(e) => {
                    eprintln!("error: {e}");
                    let _ = ctx.close().await;
                    return Ok(e.exit_code());
                }
            }
            false
        }
        _ = tokio::signal::ctrl_c() => true,
    };

    let summary = ctx.close().await;
    if interrupted {
        return Ok(130);
    }

    match summary {
        Ok(summary) => {
            eprintln!(
                "total={} ok={} failed={} in {:.2}s",
                summary.total,
                summary.successful,
                summary.failed,
                summary.duration.as_secs_f64()
            );
            Ok(if summary.failed > 0 { 1 } else { 0 })
        }
        Err(e) => {
            eprintln!("warning: {e}");
            Ok(1)
        }
    }
}

fn cmd_build_gate(
    mut modules: Vec<String>,
    from_modules_file: Option<PathBuf>,
    module_dirs: Vec<PathBuf>,
    requirements: Vec<PathBuf>,
    interpreter: String,
    cache_dir: Option<PathBuf>,
) -> anyhow::Result<i32> {
    if let Some(path) = from_modules_file {
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("modules file not found: {}", path.display()))?;
        modules.extend(
            text.lines()
                .map(str::trim)
                .filter(|l| !l.is_empty() && !l.starts_with('#'))
                .map(str::to_string),
        );
    }
    if modules.is_empty() {
        eprintln!("error: no modules specified (use -m or -f)");
        return Ok(2);
    }

    // Deduplicate preserving order.
    let mut seen = std::collections::HashSet::new();
    modules.retain(|m| seen.insert(m.clone()));

    let mut dependencies = Vec::new();
    for path in requirements {
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("requirements file not found: {}", path.display()))?;
        dependencies.extend(
            text.lines()
                .filter(|l| !l.is_empty() && !l.starts_with('#'))
                .map(str::to_string),
        );
    }

    let config = GateBuildConfig {
        modules,
        module_dirs,
        dependencies,
        interpreter,
    };
    let builder = GateBuilder::new(cache_dir.unwrap_or_else(default_cache_dir));
    let gate = builder.build(&config)?;

    println!("Gate: {}", gate.path.display());
    println!("Hash: {}", gate.hash);
    Ok(0)
}

fn cmd_inventory(inventory: PathBuf, json: bool) -> anyhow::Result<i32> {
    let inv = match Inventory::from_file(&inventory) {
        Ok(inv) => inv,
        Err(e) => {
            eprintln!("error: {e}");
            return Ok(2);
        }
    };

    if json {
        let doc = serde_json::json!({
            "hosts": inv.hosts().map(|h| &h.name).collect::<Vec<_>>(),
            "groups": inv.groups().map(|g| &g.name).collect::<Vec<_>>(),
        });
        println!("{}", serde_json::to_string_pretty(&doc)?);
    } else {
        for group in inv.groups() {
            println!("{}:", group.name);
            for host in &group.hosts {
                println!("  {host}");
            }
        }
    }
    Ok(0)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.debug);

    let code = match cli.command {
        Command::Run {
            inventory,
            state,
            module_dirs,
            module,
            args,
            forks,
            events,
            allow_destructive,
            timeout,
            target,
        } => {
            cmd_run(
                inventory,
                state,
                module_dirs,
                module,
                args,
                forks,
                events,
                allow_destructive,
                timeout,
                target,
            )
            .await?
        }
        Command::BuildGate {
            modules,
            from_modules_file,
            module_dirs,
            requirements,
            interpreter,
            cache_dir,
        } => cmd_build_gate(
            modules,
            from_modules_file,
            module_dirs,
            requirements,
            interpreter,
            cache_dir,
        )?,
        Command::Inventory { inventory, json } => cmd_inventory(inventory, json)?,
    };

    std::process::exit(code);
}
