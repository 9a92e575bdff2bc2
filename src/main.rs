use clap::{Parser, Subcommand};
use color_eyre::Result;
use offline_engine::config::Config;
use offline_engine::db::Database;
use offline_engine::event::ControlMessage;
use offline_engine::http::HttpFetcher;
use offline_engine::notify::{NotificationCenter, WindowRegistry};
use offline_engine::{CacheEngine, Collaborators, EngineEvent, EventBus};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::task::JoinHandle;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "offline-engine")]
#[command(about = "Offline cache and background sync engine")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/offline-engine/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// SQLite database path (overrides the config file)
  #[arg(long)]
  database: Option<PathBuf>,

  /// Also write logs to daily files in this directory
  #[arg(long)]
  log_dir: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Read JSON events from stdin, one per line, and print each outcome
  Run,
  /// Install a generation and activate it if nothing else is active
  Install {
    #[arg(short, long)]
    generation: Option<u32>,
    /// Activate immediately even if a previous generation is active
    #[arg(long)]
    adopt: bool,
  },
  /// Replay queued operations for a reconnect tag (e.g. sync-orders)
  Sync { tag: String },
  /// Print generation, partitions and queue status
  Status,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _log_guard = offline_engine::logging::init(args.log_dir.as_deref())?;

  // Load configuration
  let config = Config::load(args.config.as_deref())?;

  // Override database if specified on command line
  let config = if let Some(database) = args.database {
    Config {
      database: Some(database),
      ..config
    }
  } else {
    config
  };

  let engine = Arc::new(build_engine(config)?);

  match args.command {
    Command::Run => run(engine).await,
    Command::Install { generation, adopt } => {
      let generation = generation.unwrap_or(engine.config().generation);
      let report = engine.install(generation).await?;
      print_json(&json!({ "installed": report }));
      if adopt && report.activation.is_none() {
        let reply = engine.message(ControlMessage::AdoptNow)?;
        print_json(&json!({ "adopted": reply }));
      }
      Ok(())
    }
    Command::Sync { tag } => {
      let report = engine.sync(&tag).await?;
      print_json(&json!({ "drained": report }));
      Ok(())
    }
    Command::Status => {
      let version = engine.message(ControlMessage::GetVersion)?;
      let queue = engine.message(ControlMessage::QueueStatus)?;
      print_json(&json!({
        "version": version,
        "queue": queue,
        "partitions": engine.list_partitions()?,
        "dead_letters": engine.queue().dead_letters()?,
      }));
      Ok(())
    }
  }
}

fn build_engine(config: Config) -> Result<CacheEngine> {
  let db = Database::open(config.database.as_deref())?;
  let fetcher = Arc::new(HttpFetcher::new(
    config.origin_url()?,
    Config::get_api_token(),
    config.network.connect_timeout(),
  )?);

  CacheEngine::new(
    config,
    db,
    Collaborators {
      fetcher,
      replayer: None,
      notifier: Arc::new(NotificationCenter::new()),
      windows: Arc::new(WindowRegistry::new()),
    },
  )
}

/// Host bridge over stdin/stdout. Events run concurrently; each output line
/// carries the input line number it answers.
async fn run(engine: Arc<CacheEngine>) -> Result<()> {
  let periodic = engine
    .config()
    .sync
    .periodic_secs
    .filter(|secs| *secs > 0)
    .map(|secs| engine.queue().clone().spawn_periodic(Duration::from_secs(secs)));

  let (bus, _loop) = EventBus::start(Arc::clone(&engine));
  let mut lines = BufReader::new(tokio::io::stdin()).lines();
  let mut in_flight = Vec::new();
  let mut seq = 0u64;

  info!("engine ready, reading events from stdin");
  while let Some(line) = lines.next_line().await? {
    seq += 1;
    if line.trim().is_empty() {
      continue;
    }

    let event: EngineEvent = match serde_json::from_str(&line) {
      Ok(event) => event,
      Err(e) => {
        warn!(seq, error = %e, "unparseable event");
        print_json(&json!({ "seq": seq, "error": format!("invalid event: {}", e) }));
        continue;
      }
    };

    let bus = bus.clone();
    in_flight.push(tokio::spawn(async move {
      match bus.send(event).await {
        Ok(outcome) => print_json(&json!({ "seq": seq, "ok": outcome })),
        Err(e) => print_json(&json!({ "seq": seq, "error": e.to_string() })),
      }
    }));
  }

  for task in in_flight {
    join_event_task(task).await;
  }
  if let Some(periodic) = periodic {
    periodic.abort();
  }
  Ok(())
}

/// Wait for an event task. Returns false, after logging, if it panicked or
/// was cancelled.
async fn join_event_task(task: JoinHandle<()>) -> bool {
  match task.await {
    Ok(()) => true,
    Err(e) => {
      warn!(error = %e, "event task failed");
      false
    }
  }
}

fn print_json(value: &serde_json::Value) {
  println!("{}", value);
}
