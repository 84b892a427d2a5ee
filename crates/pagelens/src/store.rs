//! Durable-store collaborator seams: transcript persistence and object
//! storage.
//!
//! The orchestrator calls out after each user and assistant turn to persist
//! role, content, and produced image artifacts. Persistence failures are
//! logged and never block the loop. Object storage hands back time-limited
//! URLs for display only — zoom computation always runs against the local
//! cache, never a stored copy.

use crate::context::Turn;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::debug;

// ── Transcript store ───────────────────────────────────────────────

/// A turn as persisted to the durable store.
#[derive(Debug, Serialize)]
pub struct PersistedTurn<'a> {
    pub timestamp: DateTime<Utc>,
    pub role: String,
    pub text: &'a str,
    pub image_paths: Vec<String>,
}

impl<'a> PersistedTurn<'a> {
    pub fn from_turn(turn: &'a Turn) -> Self {
        Self {
            timestamp: Utc::now(),
            role: turn.role.to_string(),
            text: &turn.text,
            image_paths: turn
                .images
                .iter()
                .map(|img| img.path.display().to_string())
                .collect(),
        }
    }
}

/// Chat/message persistence collaborator.
pub trait TranscriptStore: Send + Sync {
    fn persist_turn(&self, turn: &PersistedTurn<'_>) -> Result<(), String>;
}

/// Store that drops everything. Useful for tests and one-shot CLI runs.
pub struct NoopStore;

impl TranscriptStore for NoopStore {
    fn persist_turn(&self, _turn: &PersistedTurn<'_>) -> Result<(), String> {
        Ok(())
    }
}

/// Append-only JSONL transcript file.
pub struct JsonlStore {
    path: PathBuf,
    file: Mutex<std::fs::File>,
}

impl JsonlStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, String> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| format!("failed to create transcript dir: {e}"))?;
        }
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| format!("failed to open transcript {}: {e}", path.display()))?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl TranscriptStore for JsonlStore {
    fn persist_turn(&self, turn: &PersistedTurn<'_>) -> Result<(), String> {
        let line =
            serde_json::to_string(turn).map_err(|e| format!("failed to serialize turn: {e}"))?;
        let mut file = self
            .file
            .lock()
            .map_err(|_| "transcript file mutex poisoned".to_string())?;
        writeln!(file, "{line}").map_err(|e| format!("failed to append turn: {e}"))?;
        debug!("Persisted {} turn ({} chars)", turn.role, turn.text.len());
        Ok(())
    }
}

// ── Object store ───────────────────────────────────────────────────

/// A stored object addressable through a time-limited URL.
#[derive(Debug, Clone)]
pub struct StoredObject {
    pub url: String,
    pub expires_at: DateTime<Utc>,
}

/// Object-storage collaborator for uploading cached images.
pub trait ObjectStore: Send + Sync {
    fn upload(&self, path: &Path) -> Result<StoredObject, String>;
}

/// Filesystem-backed object store producing `file://` URLs with an expiry
/// query parameter in place of a real signature.
pub struct LocalObjectStore {
    root: PathBuf,
    ttl: chrono::Duration,
}

impl LocalObjectStore {
    pub fn new(root: impl Into<PathBuf>, ttl: chrono::Duration) -> Result<Self, String> {
        let root = root.into();
        std::fs::create_dir_all(&root)
            .map_err(|e| format!("failed to create object store dir: {e}"))?;
        Ok(Self { root, ttl })
    }
}

impl ObjectStore for LocalObjectStore {
    fn upload(&self, path: &Path) -> Result<StoredObject, String> {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| format!("object path has no file name: {}", path.display()))?;
        let dest = self.root.join(name);
        std::fs::copy(path, &dest)
            .map_err(|e| format!("failed to copy object {}: {e}", path.display()))?;
        let expires_at = Utc::now() + self.ttl;
        Ok(StoredObject {
            url: format!(
                "file://{}?expires={}",
                dest.display(),
                expires_at.timestamp()
            ),
            expires_at,
        })
    }
}
