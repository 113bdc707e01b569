use campus_sync::{config::Config, logging, Runtime};
use clap::Parser;
use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "campus-sync")]
#[command(about = "Offline-tolerant sync agent for the campus information system")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/campus-sync/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Context identifier that selects which feature modules to load
  #[arg(long, default_value = "default")]
  context: String,

  /// Run one reconciliation pass, print the sync status as JSON and exit
  #[arg(long)]
  once: bool,

  /// Also log to stderr
  #[arg(short, long)]
  verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  let _log_guard = logging::init(&logging::default_log_dir()?, args.verbose)?;

  // Load configuration
  let config = Config::load(args.config.as_deref())?;

  let runtime = Runtime::new(config)?;
  let report = runtime.start(&args.context).await;
  if !report.failed.is_empty() {
    info!(failed = ?report.failed, "some modules are unavailable");
  }

  if args.once {
    runtime.sync().force_sync_all().await;
    let status = serde_json::to_string_pretty(&runtime.sync().sync_status())
      .map_err(|e| eyre!("Failed to encode sync status: {}", e))?;
    println!("{}", status);
    runtime.shutdown();
    return Ok(());
  }

  runtime.set_foreground(true);
  tokio::signal::ctrl_c()
    .await
    .map_err(|e| eyre!("Failed to listen for Ctrl-C: {}", e))?;

  runtime.shutdown();
  Ok(())
}
