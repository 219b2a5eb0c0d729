use abridger::config::Config;
use abridger::server::{self, AppState};
use abridger::services::epub;
use abridger::services::ledger::ProgressLedger;
use abridger::services::llm::LLMClient;
use abridger::services::pipeline::Pipeline;
use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing_subscriber::{EnvFilter, fmt};

/// Abridge an EPUB with a local or remote LLM.
#[derive(Parser, Debug)]
#[command(name = "abridger")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// JSON configuration file (chunk sizes, prompts, LLM settings)
    #[arg(long, global = true, env = "ABRIDGER_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Summarize one e-book, resuming from the progress file if present
    Run {
        /// Input EPUB
        #[arg(long, short)]
        input: PathBuf,

        /// Output EPUB
        #[arg(long, short, default_value = "book_summary.epub")]
        output: PathBuf,

        /// Progress file used to resume interrupted runs
        #[arg(long, default_value = "progress.json")]
        progress: PathBuf,
    },

    /// Serve the upload/download HTTP API
    Serve {
        #[arg(long, default_value = "0.0.0.0:3000")]
        addr: String,

        /// Directory holding uploaded books, progress files and results
        #[arg(long, default_value = "./jobs")]
        work_dir: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Run {
            input,
            output,
            progress,
        } => run(config, input, output, progress).await,
        Commands::Serve { addr, work_dir } => serve(config, addr, work_dir).await,
    }
}

async fn connect(config: &Config) -> Result<LLMClient> {
    let client = LLMClient::new(&config.llm)?;
    client.probe().await.with_context(|| {
        format!(
            "cannot reach the LLM at {}; make sure the server is running and the model is loaded",
            config.llm.api_url
        )
    })?;
    Ok(client)
}

async fn run(config: Config, input: PathBuf, output: PathBuf, progress: PathBuf) -> Result<()> {
    if !input.exists() {
        bail!("input file not found at '{}'", input.display());
    }
    let oracle = connect(&config).await?;
    let book = epub::read_book(&input)?;

    let ledger = ProgressLedger::new(progress);
    let result = Pipeline::new(&config, &oracle, &ledger)
        .run(&book.chapters)
        .await?;

    epub::write_book(&output, &book.metadata, &result.chapters, &book.resources)?;
    tracing::info!(
        output = %output.display(),
        chapters = result.chapters.len(),
        dropped_chunks = result.summary.dropped_chunks,
        condensations = result.summary.condensations,
        "Summarization complete"
    );
    Ok(())
}

async fn serve(config: Config, addr: String, work_dir: PathBuf) -> Result<()> {
    let oracle = Arc::new(connect(&config).await?);
    std::fs::create_dir_all(&work_dir)
        .with_context(|| format!("creating work directory {}", work_dir.display()))?;

    let app = server::router(AppState::new(config, oracle, work_dir));

    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("Listening on {}", listener.local_addr()?);
    axum::serve(listener, app).await?;

    Ok(())
}
