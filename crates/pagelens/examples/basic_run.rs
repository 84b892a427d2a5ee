//! Minimal run example — build an index, wire a page directory, ask one
//! question, and print the answer.
//!
//! # Usage
//!
//! ```bash
//! OPENROUTER_KEY=sk-... cargo run --example basic_run
//! ```

use pagelens::prelude::*;
use std::sync::Arc;

const DOCUMENT: &str = r#"# Plant room survey

The ventilation riser VR-1 serves levels 1 through 6 and terminates in the
roof penthouse.

```image
{"path": "page_003.png", "page": 3, "summary": "Ventilation riser diagram",
 "description": "Section through the riser shaft", "ocr_text": "VR-1 600x400"}
```
"#;

#[tokio::main]
async fn main() -> Result<(), String> {
    // 1. Create the model client.
    let api_key = std::env::var("OPENROUTER_KEY")
        .map_err(|_| "Set OPENROUTER_KEY env var to your OpenRouter API key")?;
    let model = ModelClient::new(api_key)?;

    // 2. Build the retrieval index from the document text.
    let index = DocumentIndex::build(DOCUMENT, 1600);

    // 3. Wire the page cache to a directory of scanned page rasters.
    let fetcher = Arc::new(DirectoryFetcher::new("pages"));
    let cache = PageCache::new(std::env::temp_dir().join("pagelens-example"), fetcher)?;

    // 4. Run one query through the orchestrator.
    let config = RunConfig::new("anthropic/claude-sonnet-4").with_max_steps(8);
    let store = NoopStore;
    let mut ctx = RunContext::new();

    let outcome = Orchestrator::new(&model, &index, &cache, &store, config)
        .with_event_handler(&LoggingHandler)
        .run("Where does ventilation riser VR-1 terminate?", &mut ctx)
        .await?;

    // 5. Print results.
    match outcome.answer {
        Some(answer) => println!("\n{answer}"),
        None => println!(
            "\nNo answer: {}",
            outcome.abort_reason.as_deref().unwrap_or("unknown")
        ),
    }
    println!(
        "\n--- {} steps | {} prompt + {} completion tokens ---",
        outcome.steps_used, outcome.total_prompt_tokens, outcome.total_completion_tokens
    );

    Ok(())
}
