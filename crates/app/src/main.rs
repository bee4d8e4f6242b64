use std::path::PathBuf;

use clap::Parser;
use snafu::{ResultExt, Snafu};
use tokio::io::BufReader;
use tracing_subscriber::EnvFilter;

use lexi::app::{AppError, AppOverrides, LexiApp};
use lexi::repl::Repl;
use lexi::settings::SettingsStore;

#[derive(Parser)]
#[command(name = "lexi")]
#[command(about = "Ask general questions about your legal rights")]
#[command(version)]
struct Args {
    /// Settings file (defaults to <config dir>/lexi/settings.json)
    #[arg(long)]
    config: Option<PathBuf>,

    /// SQLite database holding the chat history
    #[arg(long)]
    database: Option<PathBuf>,

    /// Jurisdiction to use for this and later sessions, e.g. "Ontario, Canada"
    #[arg(long)]
    jurisdiction: Option<String>,
}

#[derive(Debug, Snafu)]
enum MainError {
    #[snafu(display("failed to start lexi"))]
    Startup { source: AppError },
    #[snafu(display("terminal i/o failed"))]
    Terminal { source: std::io::Error },
}

#[snafu::report]
#[tokio::main]
async fn main() -> Result<(), MainError> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let settings_store = match args.config {
        Some(path) => SettingsStore::new(path),
        None => SettingsStore::load(),
    };
    tracing::debug!("using settings from {:?}", settings_store.config_path());

    let overrides = AppOverrides {
        database: args.database,
        jurisdiction: args.jurisdiction,
    };
    let app = LexiApp::build(settings_store.settings(), overrides)
        .await
        .context(StartupSnafu)?;

    let mut repl = Repl::new(app, BufReader::new(tokio::io::stdin()), tokio::io::stdout());
    repl.run().await.context(TerminalSnafu)?;
    Ok(())
}
