//! `parley`, a line-oriented console client for the Parley chat engine.
//!
//! # Usage
//!
//! ```
//! parley --user ada --name Ada
//! parley --config ~/.config/parley/parley.toml
//! ```
//!
//! Type `/help` once running.

mod app;
mod printer;
mod settings;

use std::path::PathBuf;

use anyhow::{Context as _, Result};
use app::{App, Command};
use clap::Parser;
use parley_engine::Engine;
use parley_store_sqlite::SqliteStore;
use settings::{ClientConfig, expand_tilde};
use tokio::io::{AsyncBufReadExt as _, BufReader};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

// ─── CLI args ─────────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "parley", version, about = "Console client for Parley chat")]
struct Args {
  /// Path to a TOML config file.
  #[arg(short, long, value_name = "FILE", default_value = "parley.toml")]
  config: PathBuf,

  /// SQLite database shared by every client on this machine.
  #[arg(long, env = "PARLEY_DB")]
  store: Option<PathBuf>,

  /// User id to sign in as.
  #[arg(long, env = "PARLEY_UID")]
  user: Option<String>,

  /// Display name used when the profile is first created.
  #[arg(long)]
  name: Option<String>,

  #[arg(long)]
  email: Option<String>,
}

// ─── Entry point ──────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter(
      EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy(),
    )
    .with_writer(std::io::stderr)
    .init();

  let args = Args::parse();

  // CLI flags override the config file and environment.
  let mut cfg = ClientConfig::load(&args.config)?;
  if let Some(store) = args.store {
    cfg.store_path = store;
  }
  if let Some(user) = args.user {
    cfg.user.id = Some(user);
  }
  if let Some(name) = args.name {
    cfg.user.name = Some(name);
  }
  if let Some(email) = args.email {
    cfg.user.email = Some(email);
  }
  let identity = cfg.identity()?;

  let store_path = expand_tilde(&cfg.store_path);
  let store = SqliteStore::open(&store_path)
    .await
    .with_context(|| format!("failed to open store at {store_path:?}"))?;

  let engine = Engine::new(store, cfg.engine.clone());
  let printer = printer::spawn(engine.clone());
  engine
    .start(identity)
    .await
    .context("failed to start session")?;
  println!("signed in; /help lists commands");

  let result = run(App::new(engine.clone())).await;

  engine.stop().await;
  printer.abort();
  result
}

/// Read commands from stdin until `/quit`, end of input or Ctrl-C. Command
/// errors are printed and the loop continues.
async fn run(mut app: App<SqliteStore>) -> Result<()> {
  let mut lines = BufReader::new(tokio::io::stdin()).lines();
  loop {
    let line = tokio::select! {
      line = lines.next_line() => line.context("failed to read stdin")?,
      _ = tokio::signal::ctrl_c() => None,
    };
    let Some(line) = line else {
      return Ok(());
    };

    let command = match Command::parse(&line) {
      Ok(Some(command)) => command,
      Ok(None) => continue,
      Err(e) => {
        eprintln!("{e}");
        continue;
      }
    };
    match app.handle(command).await {
      Ok(true) => {}
      Ok(false) => return Ok(()),
      Err(e) => eprintln!("error: {e:#}"),
    }
  }
}
