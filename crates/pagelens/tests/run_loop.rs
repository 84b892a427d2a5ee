//! End-to-end orchestrator loop tests with a scripted model endpoint and an
//! in-memory page fetcher.

use pagelens::prelude::*;
use std::collections::VecDeque;
use std::io::Cursor;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

// ── Test doubles ───────────────────────────────────────────────────

/// Model endpoint that replays a fixed script of responses.
struct ScriptedModel {
    responses: Mutex<VecDeque<String>>,
    calls: AtomicU32,
}

impl ScriptedModel {
    fn new(responses: &[&str]) -> Self {
        Self {
            responses: Mutex::new(responses.iter().map(|r| r.to_string()).collect()),
            calls: AtomicU32::new(0),
        }
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl ModelEndpoint for ScriptedModel {
    fn complete(&self, _request: &ChatRequest) -> ModelFuture<'_> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let next = self
            .responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| "Script exhausted; final answer.".to_string());
        Box::pin(async move {
            Ok(ChatCompletion {
                content: Some(next),
                usage: Some(UsageInfo {
                    prompt_tokens: Some(100),
                    completion_tokens: Some(20),
                    total_tokens: Some(120),
                }),
                finish_reason: Some("stop".to_string()),
            })
        })
    }
}

/// Fetcher that serves generated PNGs and counts source hits.
struct PageFetcher {
    calls: AtomicU32,
}

impl PageFetcher {
    fn new() -> Self {
        Self {
            calls: AtomicU32::new(0),
        }
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl SourceFetcher for PageFetcher {
    fn fetch(&self, _locator: &str) -> FetchFuture<'_> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Box::pin(async move {
            let img = image::DynamicImage::ImageRgba8(image::RgbaImage::from_pixel(
                1200,
                900,
                image::Rgba([40, 90, 160, 255]),
            ));
            let mut buf = Vec::new();
            img.write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)
                .unwrap();
            Ok(buf)
        })
    }
}

/// Event handler that records a compact label per event, in order.
#[derive(Default)]
struct Recorder {
    labels: Mutex<Vec<String>>,
}

impl Recorder {
    fn labels(&self) -> Vec<String> {
        self.labels.lock().unwrap().clone()
    }

    fn contains(&self, prefix: &str) -> bool {
        self.labels().iter().any(|l| l.starts_with(prefix))
    }
}

impl EventHandler for Recorder {
    fn on_event(&self, event: &RunEvent<'_>) {
        let label = match event {
            RunEvent::StepStart { step, .. } => format!("step:{step}"),
            RunEvent::AssistantMessage(_) => "assistant".to_string(),
            RunEvent::BaseImageDelivered { id, .. } => format!("base:{id}"),
            RunEvent::ZoomDelivered { id, .. } => format!("zoom:{id}"),
            RunEvent::DocumentsRequested { names, .. } => format!("docs:{}", names.join("+")),
            RunEvent::Warning(text) => format!("warn:{text}"),
            RunEvent::TokenUsage { .. } => "usage".to_string(),
            RunEvent::Finished { .. } => "finished".to_string(),
            RunEvent::Errored(_) => "errored".to_string(),
        };
        self.labels.lock().unwrap().push(label);
    }
}

// ── Fixture ────────────────────────────────────────────────────────

const DOC: &str = r#"# Mechanical survey

The ventilation riser VR-1 serves levels 1 through 6.

```image
{"path": "pages/img_42.png", "page": 3, "summary": "Ventilation riser diagram", "description": "Section through the riser shaft", "ocr_text": "VR-1 600x400"}
```

```image
{"path": "pages/img_7.png", "page": 5, "summary": "Pump schedule", "ocr_text": "P-1 P-2 P-3"}
```

Fire dampers are fitted at each floor penetration.
"#;

struct Fixture {
    index: DocumentIndex,
    cache: PageCache,
    fetcher: Arc<PageFetcher>,
    _dir: tempfile::TempDir,
}

fn fixture() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let fetcher = Arc::new(PageFetcher::new());
    let cache = PageCache::new(dir.path().join("cache"), fetcher.clone()).unwrap();
    Fixture {
        index: DocumentIndex::build(DOC, 1600),
        cache,
        fetcher,
        _dir: dir,
    }
}

fn config() -> RunConfig {
    RunConfig::new("test-model").with_max_steps(6)
}

// ── Tests ──────────────────────────────────────────────────────────

#[tokio::test]
async fn final_answer_on_first_step() {
    let fx = fixture();
    let model = ScriptedModel::new(&["The riser terminates in the roof penthouse."]);
    let recorder = Recorder::default();
    let mut ctx = RunContext::new();

    let outcome = Orchestrator::new(&model, &fx.index, &fx.cache, &NoopStore, config())
        .with_event_handler(&recorder)
        .run("Where does VR-1 terminate?", &mut ctx)
        .await
        .unwrap();

    assert_eq!(outcome.state, RunState::Done);
    assert_eq!(
        outcome.answer.as_deref(),
        Some("The riser terminates in the roof penthouse.")
    );
    assert_eq!(outcome.steps_used, 1);
    assert_eq!(outcome.total_prompt_tokens, 100);
    assert!(recorder.contains("finished"));

    // The rolling memory absorbed the exchange for later runs.
    let memory = ctx.memory.as_deref().unwrap();
    assert!(memory.contains("Where does VR-1 terminate?"));
    assert!(memory.contains("roof penthouse"));
}

#[tokio::test]
async fn image_request_then_answer() {
    let fx = fixture();
    let model = ScriptedModel::new(&[
        "I should look at the diagram.\n\nSHOW_IMAGES: img_42",
        "VR-1 is a 600x400 duct.",
    ]);
    let recorder = Recorder::default();
    let mut ctx = RunContext::new();

    let outcome = Orchestrator::new(&model, &fx.index, &fx.cache, &NoopStore, config())
        .with_event_handler(&recorder)
        .run("What size is VR-1?", &mut ctx)
        .await
        .unwrap();

    assert_eq!(outcome.state, RunState::Done);
    assert_eq!(outcome.steps_used, 2);
    assert_eq!(fx.fetcher.calls(), 1);
    assert!(ctx.sent_images.contains("img_42"));

    let labels = recorder.labels();
    let base_pos = labels.iter().position(|l| l == "base:img_42").unwrap();
    let done_pos = labels.iter().position(|l| l == "finished").unwrap();
    assert!(base_pos < done_pos);
}

#[tokio::test]
async fn zoom_for_unseen_id_delivers_base_first() {
    let fx = fixture();
    let model = ScriptedModel::new(&[
        "ZOOM: img_42 [0.25, 0.25, 0.75, 0.75] | check the duct label",
        "The label reads VR-1.",
    ]);
    let recorder = Recorder::default();
    let mut ctx = RunContext::new();

    let outcome = Orchestrator::new(&model, &fx.index, &fx.cache, &NoopStore, config())
        .with_event_handler(&recorder)
        .run("What does the duct label read?", &mut ctx)
        .await
        .unwrap();

    assert_eq!(outcome.state, RunState::Done);
    let labels = recorder.labels();
    let base_pos = labels.iter().position(|l| l == "base:img_42").unwrap();
    let zoom_pos = labels.iter().position(|l| l == "zoom:img_42").unwrap();
    assert!(
        base_pos < zoom_pos,
        "base image must precede the zoom crop: {labels:?}"
    );
    // One source fetch serves both the base and the zoom.
    assert_eq!(fx.fetcher.calls(), 1);
}

#[tokio::test]
async fn full_frame_zoom_rejected_with_warning() {
    let fx = fixture();
    let model = ScriptedModel::new(&[
        "SHOW_IMAGES: img_42",
        "ZOOM: img_42 [0.0, 0.0, 1.0, 1.0]",
        "Final answer without the zoom.",
    ]);
    let recorder = Recorder::default();
    let mut ctx = RunContext::new();

    let outcome = Orchestrator::new(&model, &fx.index, &fx.cache, &NoopStore, config())
        .with_event_handler(&recorder)
        .run("Show me everything.", &mut ctx)
        .await
        .unwrap();

    assert_eq!(outcome.state, RunState::Done);
    assert!(recorder.labels().iter().any(|l| l.contains("whole image")));
    assert!(!recorder.contains("zoom:"));
}

#[tokio::test]
async fn coordinate_free_zoom_rejected_with_warning() {
    let fx = fixture();
    let model = ScriptedModel::new(&[
        "SHOW_IMAGES: img_42",
        "ZOOM: img_42",
        "Done.",
    ]);
    let recorder = Recorder::default();
    let mut ctx = RunContext::new();

    let outcome = Orchestrator::new(&model, &fx.index, &fx.cache, &NoopStore, config())
        .with_event_handler(&recorder)
        .run("Zoom somewhere.", &mut ctx)
        .await
        .unwrap();

    assert_eq!(outcome.state, RunState::Done);
    assert!(
        recorder
            .labels()
            .iter()
            .any(|l| l.contains("no usable coordinates"))
    );
    assert!(!recorder.contains("zoom:"));
}

#[tokio::test]
async fn missing_image_id_warns_and_continues() {
    let fx = fixture();
    let model = ScriptedModel::new(&["SHOW_IMAGES: img_99", "Answering without it."]);
    let recorder = Recorder::default();
    let mut ctx = RunContext::new();

    let outcome = Orchestrator::new(&model, &fx.index, &fx.cache, &NoopStore, config())
        .with_event_handler(&recorder)
        .run("What is on img_99?", &mut ctx)
        .await
        .unwrap();

    assert_eq!(outcome.state, RunState::Done);
    assert!(
        recorder
            .labels()
            .iter()
            .any(|l| l.contains("not in the catalog"))
    );
    assert_eq!(fx.fetcher.calls(), 0);
}

#[tokio::test]
async fn document_request_is_reported_and_loop_continues() {
    let fx = fixture();
    let model = ScriptedModel::new(&[
        "REQUEST_DOCUMENTS: electrical schedule | need the submains",
        "Answering with what is available.",
    ]);
    let recorder = Recorder::default();
    let mut ctx = RunContext::new();

    let outcome = Orchestrator::new(&model, &fx.index, &fx.cache, &NoopStore, config())
        .with_event_handler(&recorder)
        .run("What feeds the submains?", &mut ctx)
        .await
        .unwrap();

    assert_eq!(outcome.state, RunState::Done);
    assert!(recorder.contains("docs:electrical schedule"));
}

#[tokio::test]
async fn step_limit_aborts_with_descriptive_error() {
    let fx = fixture();
    // The model never answers; every step requests the same image.
    let model = ScriptedModel::new(&[
        "SHOW_IMAGES: img_42",
        "SHOW_IMAGES: img_7",
        "SHOW_IMAGES: img_42",
    ]);
    let recorder = Recorder::default();
    let mut ctx = RunContext::new();

    let outcome = Orchestrator::new(
        &model,
        &fx.index,
        &fx.cache,
        &NoopStore,
        config().with_max_steps(3),
    )
    .with_event_handler(&recorder)
    .run("Loop forever.", &mut ctx)
    .await
    .unwrap();

    assert_eq!(outcome.state, RunState::Aborted);
    assert!(outcome.abort_reason.unwrap().contains("step limit"));
    assert_eq!(outcome.steps_used, 3);
    assert!(recorder.contains("errored"));
    // Repeated requests for img_42 still hit the source only once.
    assert_eq!(fx.fetcher.calls(), 2);
}

#[tokio::test]
async fn cancellation_before_start_issues_no_model_calls() {
    let fx = fixture();
    let model = ScriptedModel::new(&["Never sent."]);
    let recorder = Recorder::default();
    let cancel = CancelToken::new();
    cancel.cancel();
    let mut ctx = RunContext::new().with_cancel(cancel);

    let outcome = Orchestrator::new(&model, &fx.index, &fx.cache, &NoopStore, config())
        .with_event_handler(&recorder)
        .run("Anything.", &mut ctx)
        .await
        .unwrap();

    assert_eq!(outcome.state, RunState::Aborted);
    assert!(outcome.abort_reason.unwrap().contains("cancelled"));
    assert_eq!(model.calls(), 0);
}

#[tokio::test]
async fn empty_document_set_aborts_at_start() {
    let dir = tempfile::tempdir().unwrap();
    let fetcher = Arc::new(PageFetcher::new());
    let cache = PageCache::new(dir.path().join("cache"), fetcher).unwrap();
    let index = DocumentIndex::build("", 1600);
    let model = ScriptedModel::new(&["Never sent."]);
    let recorder = Recorder::default();
    let mut ctx = RunContext::new();

    let outcome = Orchestrator::new(&model, &index, &cache, &NoopStore, config())
        .with_event_handler(&recorder)
        .run("Anything.", &mut ctx)
        .await
        .unwrap();

    assert_eq!(outcome.state, RunState::Aborted);
    assert!(outcome.abort_reason.unwrap().contains("empty document set"));
    assert_eq!(model.calls(), 0);
    assert!(recorder.contains("errored"));
}

#[tokio::test]
async fn transcript_records_every_turn() {
    let fx = fixture();
    let dir = tempfile::tempdir().unwrap();
    let store = JsonlStore::open(dir.path().join("run.jsonl")).unwrap();
    let model = ScriptedModel::new(&["SHOW_IMAGES: img_42", "Answer."]);
    let mut ctx = RunContext::new();

    Orchestrator::new(&model, &fx.index, &fx.cache, &store, config())
        .run("What size is VR-1?", &mut ctx)
        .await
        .unwrap();

    let content = std::fs::read_to_string(store.path()).unwrap();
    let roles: Vec<String> = content
        .lines()
        .map(|line| {
            serde_json::from_str::<serde_json::Value>(line).unwrap()["role"]
                .as_str()
                .unwrap()
                .to_string()
        })
        .collect();
    // query, assistant tool request, image result, final answer.
    assert_eq!(roles, vec!["user", "assistant", "user", "assistant"]);
    // The image-result turn carries the delivered artifact path.
    assert!(content.contains("img_42"));
}
