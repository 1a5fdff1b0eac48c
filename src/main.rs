use std::collections::HashMap;
use std::io::{self, Read};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use fuschia_host_http::HttpJsonSource;
use fuschia_source::{
  CursorStore, EventSink, JsonLinesSink, RunReport, RunTrigger, SourceRunner, WebhookRequest,
};
use fuschia_source_config::HttpSourceDef;
use fuschia_store::SqliteKvStore;

mod server;

/// Fuschia sources - poll or receive upstream events and emit each one once
#[derive(Parser)]
#[command(name = "fuschia")]
#[command(version, about, long_about = None)]
struct Cli {
  /// Path to the data directory (default: ~/.fuschia)
  #[arg(long, global = true)]
  data_dir: Option<PathBuf>,

  #[command(subcommand)]
  command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
  /// Run one polling cycle for a source
  Poll {
    /// Path to the source definition (JSON)
    source_file: PathBuf,
  },

  /// Process one webhook delivery read from stdin
  Webhook {
    /// Path to the source definition (JSON)
    source_file: PathBuf,
  },

  /// Inspect or reset persisted source state
  Cursor {
    #[command(subcommand)]
    action: CursorAction,
  },

  /// Record or clear the provider webhook registration of a source
  Push {
    #[command(subcommand)]
    action: PushAction,
  },

  /// Serve webhooks and poll sources on their timers
  Serve {
    /// Paths to source definitions (JSON)
    #[arg(required = true)]
    source_files: Vec<PathBuf>,

    /// Address to listen on
    #[arg(long, default_value = "127.0.0.1:8080")]
    listen: SocketAddr,
  },
}

#[derive(Subcommand)]
enum CursorAction {
  /// Print the cursor, dedup window and any unfinished polling walk
  Show { source_file: PathBuf },

  /// Forget the cursor, dedup window and unfinished walk; the next run is a first run
  Reset { source_file: PathBuf },
}

#[derive(Subcommand)]
enum PushAction {
  /// Mark push delivery active; timer ticks stop polling
  Register {
    source_file: PathBuf,

    /// Provider-side identifier of the webhook
    #[arg(long)]
    webhook_id: String,
  },

  /// Mark push delivery gone; timer ticks poll again
  Unregister { source_file: PathBuf },
}

fn main() -> Result<()> {
  init_tracing();

  let cli = Cli::parse();

  let data_dir = match cli.data_dir {
    Some(dir) => dir,
    None => dirs::home_dir()
      .context("could not determine home directory")?
      .join(".fuschia"),
  };

  let Some(command) = cli.command else {
    println!("fuschia - use --help to see available commands");
    return Ok(());
  };

  let rt = tokio::runtime::Runtime::new()?;
  rt.block_on(async {
    match command {
      Commands::Poll { source_file } => poll(source_file, data_dir).await,
      Commands::Webhook { source_file } => webhook(source_file, data_dir).await,
      Commands::Cursor { action } => cursor(action, data_dir).await,
      Commands::Push { action } => push(action, data_dir).await,
      Commands::Serve {
        source_files,
        listen,
      } => serve(source_files, listen, data_dir).await,
    }
  })
}

/// Logs go to stderr; stdout carries emitted events.
fn init_tracing() {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
    .with_writer(io::stderr)
    .init();
}

async fn load_source(source_file: &Path) -> Result<HttpJsonSource> {
  let content = tokio::fs::read_to_string(source_file)
    .await
    .with_context(|| format!("failed to read source file: {}", source_file.display()))?;

  let def: HttpSourceDef = serde_json::from_str(&content)
    .with_context(|| format!("failed to parse source file: {}", source_file.display()))?;

  HttpJsonSource::new(def)
    .with_context(|| format!("invalid source definition: {}", source_file.display()))
}

async fn open_store(data_dir: &Path) -> Result<SqliteKvStore> {
  tokio::fs::create_dir_all(data_dir)
    .await
    .with_context(|| format!("failed to create data directory: {}", data_dir.display()))?;

  let db_path = data_dir.join("sources.db");
  SqliteKvStore::open(&db_path)
    .await
    .with_context(|| format!("failed to open state database: {}", db_path.display()))
}

fn stdout_sink() -> Arc<dyn EventSink> {
  Arc::new(JsonLinesSink::new(io::stdout()))
}

fn print_report(report: &RunReport) -> Result<()> {
  eprintln!("{}", serde_json::to_string_pretty(report)?);
  Ok(())
}

async fn poll(source_file: PathBuf, data_dir: PathBuf) -> Result<()> {
  let source = load_source(&source_file).await?;
  let store = open_store(&data_dir).await?;
  let runner = SourceRunner::new(Arc::new(source), store.clone(), stdout_sink());

  let report = runner
    .run_once(RunTrigger::Tick)
    .await
    .with_context(|| format!("polling run failed for '{}'", runner.source_id()))?;
  print_report(&report)?;

  store.close().await;
  Ok(())
}

async fn webhook(source_file: PathBuf, data_dir: PathBuf) -> Result<()> {
  let source = load_source(&source_file).await?;
  let store = open_store(&data_dir).await?;
  let runner = SourceRunner::new(Arc::new(source), store.clone(), stdout_sink());

  let body = read_body_from_stdin()?;
  let request = WebhookRequest::json(format!("/sources/{}/webhook", runner.source_id()), body);

  let (response, report) = runner.run_webhook(&request).await;
  eprintln!("Webhook response: {} {}", response.status, response.body);

  let Some(report) = report else {
    bail!("webhook delivery rejected: {}", response.body);
  };
  let report = report.with_context(|| format!("webhook run failed for '{}'", runner.source_id()))?;
  print_report(&report)?;

  store.close().await;
  Ok(())
}

async fn cursor(action: CursorAction, data_dir: PathBuf) -> Result<()> {
  let (source_file, reset) = match action {
    CursorAction::Show { source_file } => (source_file, false),
    CursorAction::Reset { source_file } => (source_file, true),
  };

  let source = load_source(&source_file).await?;
  let config = &source.definition().source;
  let store = open_store(&data_dir).await?;
  let state = CursorStore::new(store.clone(), config.source_id.clone());

  if reset {
    state.reset().await?;
    eprintln!("Reset state of source '{}'", config.source_id);
  } else {
    let cursor = state.read_cursor().await?;
    let push = state.read_push().await?;
    let backlog = state.read_backlog().await?;
    let recent = state.read_recent_keys(config.dedupe_window).await?;

    let output = json!({
      "source_id": config.source_id,
      "cursor": cursor,
      "push": push,
      "backlog": backlog,
      "recent_keys": recent.records(),
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
  }

  store.close().await;
  Ok(())
}

async fn push(action: PushAction, data_dir: PathBuf) -> Result<()> {
  let source_file = match &action {
    PushAction::Register { source_file, .. } | PushAction::Unregister { source_file } => {
      source_file.clone()
    }
  };

  let source = load_source(&source_file).await?;
  let store = open_store(&data_dir).await?;
  let runner = SourceRunner::new(Arc::new(source), store.clone(), stdout_sink());

  match action {
    PushAction::Register { webhook_id, .. } => {
      runner.register_push(webhook_id).await?;
      eprintln!("Push delivery registered for '{}'", runner.source_id());
    }
    PushAction::Unregister { .. } => {
      runner.unregister_push().await?;
      eprintln!("Push delivery unregistered for '{}'", runner.source_id());
    }
  }

  store.close().await;
  Ok(())
}

async fn serve(source_files: Vec<PathBuf>, listen: SocketAddr, data_dir: PathBuf) -> Result<()> {
  let store = open_store(&data_dir).await?;
  let sink = stdout_sink();
  let cancel = CancellationToken::new();

  let mut handles = HashMap::new();
  let mut runners = Vec::new();
  for source_file in &source_files {
    let source = load_source(source_file).await?;
    let runner = SourceRunner::new(Arc::new(source), store.clone(), sink.clone());
    let source_id = runner.source_id().to_string();

    if handles.insert(source_id.clone(), runner.handle()).is_some() {
      bail!("duplicate source_id '{source_id}' in {}", source_file.display());
    }
    runners.push(runner);
  }

  let tasks: Vec<_> = runners
    .into_iter()
    .map(|runner| tokio::spawn(runner.start(cancel.child_token())))
    .collect();

  let listener = tokio::net::TcpListener::bind(listen)
    .await
    .with_context(|| format!("failed to listen on {listen}"))?;
  info!(addr = %listen, sources = handles.len(), "listening for webhooks");

  let app = server::build_router(server::AppState::new(handles));
  let shutdown = cancel.clone();
  axum::serve(listener, app)
    .with_graceful_shutdown(async move {
      if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for shutdown signal");
      }
      info!("shutting down");
      shutdown.cancel();
    })
    .await
    .context("server error")?;

  cancel.cancel();
  for task in tasks {
    match task.await {
      Ok(Ok(())) => {}
      Ok(Err(e)) => warn!(error = %e, "source runner stopped with error"),
      Err(e) => warn!(error = %e, "source runner panicked"),
    }
  }

  store.close().await;
  Ok(())
}

fn read_body_from_stdin() -> Result<String> {
  use std::io::IsTerminal;

  if io::stdin().is_terminal() {
    // No stdin pipe, empty delivery
    return Ok(String::new());
  }

  let mut input = String::new();
  io::stdin()
    .read_to_string(&mut input)
    .context("failed to read webhook body from stdin")?;
  Ok(input)
}
