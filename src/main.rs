use std::{path::PathBuf, process, sync::Arc, time::Duration};

use anyhow::bail;
use clap::{Args, Parser, Subcommand};
use tokio::task::spawn_blocking;
use tracing::{error, info};
use wiseflow::{
    config::WiseflowConfig,
    logger::{Telemetry, init_tracing},
    manager::{PluginManager, WiseflowContext},
    plugin::{Event, EventType},
    schema::write_schema,
    watcher::PluginWatcher,
};

#[derive(Parser, Debug)]
#[command(name = "wiseflow", about = "Wiseflow plugin runtime", version)]
struct Cli {
    #[command(flatten)]
    common: CommonArgs,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Load and start every plugin, run until Ctrl-C
    Run,

    /// List discoverable plugins
    List,

    /// Run the load checks for one plugin without starting it
    Check { name: String },

    /// Emit JSON-Schema for plugin manifests and the runtime config
    Schema {
        #[arg(long, default_value = "schemas")]
        out: PathBuf,
    },
}

#[derive(Args, Debug)]
struct CommonArgs {
    /// Overrides WISEFLOW_PLUGIN_DIR
    #[arg(long, global = true)]
    plugin_dir: Option<PathBuf>,

    /// Overrides WISEFLOW_LOG_LEVEL (error, warn, info, debug, trace)
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// OpenTelemetry endpoint (e.g. http://localhost:4318)
    #[arg(long, global = true)]
    otel_endpoint: Option<String>,
}

fn load_config(args: &CommonArgs) -> WiseflowConfig {
    let mut config = WiseflowConfig::from_env();
    if let Some(dir) = &args.plugin_dir {
        config.plugin_dir = dir.clone();
    }
    if let Some(level) = &args.log_level {
        config.log_level = level.clone();
    }
    if args.otel_endpoint.is_some() {
        config.otel_endpoint = args.otel_endpoint.clone();
    }
    config
}

fn start_tracing(config: &WiseflowConfig, name: &str) -> anyhow::Result<Telemetry> {
    init_tracing(
        &config.log_dir,
        &format!("{name}.log"),
        &format!("{name}-events.json"),
        &config.log_level,
        config.otel_endpoint.as_deref(),
    )
}

#[tokio::main(flavor = "multi_thread", worker_threads = 4)]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli.common);

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            let telemetry = start_tracing(&config, "wiseflow")?;
            let result = run(config).await;
            if let Err(e) = &result {
                error!("wiseflow stopped with an error: {e:#}");
            }
            telemetry.shutdown();
            result
        }
        Commands::List => {
            let telemetry = start_tracing(&config, "wiseflow-cli")?;
            let manager = PluginManager::new(WiseflowContext::new(config))?;
            for name in manager.discover_plugins() {
                println!("{name}");
            }
            telemetry.shutdown();
            Ok(())
        }
        Commands::Check { name } => {
            let telemetry = start_tracing(&config, "wiseflow-cli")?;
            let manager = PluginManager::new(WiseflowContext::new(config))?;
            manager.discover_plugins();
            let outcome = match manager.load_plugin(&name) {
                Some(class) => {
                    println!("✅ {} {} ({}) passed every load check", class.name, class.metadata.version, class.kind);
                    Ok(())
                }
                None => {
                    let reason = manager.plugin_error(&name).unwrap_or_else(|| "unknown error".into());
                    println!("❌ {name}: {reason}");
                    Err(reason)
                }
            };
            telemetry.shutdown();
            if outcome.is_err() {
                process::exit(1);
            }
            Ok(())
        }
        Commands::Schema { out } => {
            for path in write_schema(&out)? {
                println!("{}", path.display());
            }
            Ok(())
        }
    }
}

async fn run(config: WiseflowConfig) -> anyhow::Result<()> {
    let ctx = WiseflowContext::new(config);
    let manager = Arc::new(PluginManager::new(ctx.clone())?);
    info!("wiseflow starting, plugins from {}", ctx.config.plugin_dir.display());
    ctx.bus
        .publish_sync(Event::empty(EventType::SystemStartup).with_source("wiseflow"))?;

    // 1) load and start
    let m = manager.clone();
    let loaded = match spawn_blocking(move || m.load_all_plugins()).await? {
        Ok(loaded) => loaded,
        Err(e) => bail!("could not load plugins: {e}"),
    };
    let m = manager.clone();
    let started = spawn_blocking(move || m.initialize_all_plugins()).await?;
    for (name, ok) in &started {
        if *ok {
            println!("✅ {name}");
        } else {
            let reason = manager.plugin_error(name).unwrap_or_default();
            println!("❌ {name}: {reason}");
        }
    }
    info!(loaded = loaded.len(), started = started.values().filter(|ok| **ok).count(), "plugins ready");

    // 2) hot reload
    let watcher = if ctx.config.hot_reload {
        match PluginWatcher::start(manager.clone(), Duration::from_secs(2)).await {
            Ok(w) => Some(w),
            Err(e) => {
                error!("hot reload disabled: {e:#}");
                None
            }
        }
    } else {
        None
    };

    println!("wiseflow running; press Ctrl-C to exit");
    tokio::signal::ctrl_c().await?;
    println!("\nShutting down…");

    // 3) stop
    if let Some(w) = watcher {
        w.shutdown();
    }
    let m = manager.clone();
    let stopped = spawn_blocking(move || m.shutdown_all_plugins()).await?;
    info!(stopped = stopped.len(), "plugins shut down");
    ctx.bus
        .publish_sync(Event::empty(EventType::SystemShutdown).with_source("wiseflow"))?;
    println!("Goodbye!");
    Ok(())
}
