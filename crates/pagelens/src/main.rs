//! Ask a question about a scanned document and print the answer.
//!
//! Reads the API key from the `OPENROUTER_KEY` environment variable.
//!
//! # Examples
//!
//! ```sh
//! # Basic question against a document with its page rasters
//! pagelens --document survey.md --pages-dir pages/ \
//!   --query "Where does ventilation riser VR-1 terminate?"
//!
//! # Retrieval mode with a transcript and a custom model
//! pagelens --document survey.md --pages-dir pages/ \
//!   --query "What size is the riser?" \
//!   --mode retrieval --model anthropic/claude-sonnet-4 \
//!   --transcript run.jsonl
//! ```

use clap::Parser;
use pagelens::prelude::*;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;

/// Ask a question about a scanned document and print the answer.
///
/// Reads the API key from the OPENROUTER_KEY environment variable.
#[derive(Parser)]
#[command(name = "pagelens")]
struct Cli {
    // ── Inputs ─────────────────────────────────────────────────
    /// Path to the document text (with fenced image catalog blocks)
    #[arg(long)]
    document: PathBuf,

    /// Directory holding the page rasters the catalog refers to
    #[arg(long)]
    pages_dir: PathBuf,

    /// The question to answer
    #[arg(long)]
    query: String,

    // ── Model selection ────────────────────────────────────────
    /// Model to use
    #[arg(long, default_value = "anthropic/claude-sonnet-4")]
    model: String,

    /// Context mode to start in: "full" or "retrieval"
    #[arg(long, default_value = "full")]
    mode: String,

    // ── Run control ────────────────────────────────────────────
    /// Maximum orchestration steps before aborting
    #[arg(long, default_value_t = 10)]
    max_steps: u32,

    /// Maximum tokens per model response
    #[arg(long, default_value_t = 1024)]
    max_tokens: u32,

    /// Scratch directory for the image cache (defaults to a temp dir)
    #[arg(long)]
    scratch_dir: Option<PathBuf>,

    /// Append the conversation transcript to this JSONL file
    #[arg(long)]
    transcript: Option<PathBuf>,

    /// Verbose logging (debug level)
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let level = if cli.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    if let Err(e) = run(cli).await {
        eprintln!("error: {e}");
        process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), String> {
    // Missing credentials fail here, before any run starts.
    let api_key = std::env::var("OPENROUTER_KEY")
        .map_err(|_| "OPENROUTER_KEY is not set; export your OpenRouter API key".to_string())?;
    let model = ModelClient::new(api_key)?;

    let start_mode = match cli.mode.as_str() {
        "full" => ContextMode::FullDocument,
        "retrieval" => ContextMode::Retrieval,
        other => return Err(format!("unknown mode '{other}' (use \"full\" or \"retrieval\")")),
    };

    let document_text = std::fs::read_to_string(&cli.document)
        .map_err(|e| format!("failed to read document {}: {e}", cli.document.display()))?;
    let index = DocumentIndex::build(&document_text, pagelens::index::DEFAULT_MAX_CHUNK_CHARS);

    let scratch = cli
        .scratch_dir
        .unwrap_or_else(|| std::env::temp_dir().join("pagelens-cache"));
    let fetcher = Arc::new(DirectoryFetcher::new(&cli.pages_dir));
    let cache = PageCache::new(scratch, fetcher)?;

    let store: Box<dyn TranscriptStore> = match cli.transcript {
        Some(path) => Box::new(JsonlStore::open(path)?),
        None => Box::new(NoopStore),
    };

    let config = RunConfig::new(&cli.model)
        .with_max_steps(cli.max_steps)
        .with_negotiation(NegotiationSettings {
            start_mode,
            ..NegotiationSettings::default()
        });
    let config = RunConfig {
        max_tokens: cli.max_tokens,
        ..config
    };

    // Wire Ctrl-C to cooperative cancellation.
    let cancel = CancelToken::new();
    let mut ctx = RunContext::new().with_cancel(cancel.clone());
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel();
        }
    });

    let outcome = Orchestrator::new(&model, &index, &cache, store.as_ref(), config)
        .with_event_handler(&LoggingHandler)
        .run(&cli.query, &mut ctx)
        .await?;

    match outcome.state {
        RunState::Done => {
            println!("{}", outcome.answer.unwrap_or_default());
            println!(
                "\n--- {} steps | {} prompt + {} completion tokens ---",
                outcome.steps_used, outcome.total_prompt_tokens, outcome.total_completion_tokens
            );
            Ok(())
        }
        _ => Err(outcome
            .abort_reason
            .unwrap_or_else(|| "run ended without an answer".to_string())),
    }
}
