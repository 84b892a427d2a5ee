//! Retrieval index: image catalog, text chunks, and the substring scorer.
//!
//! Built once from a document's text representation and read-only thereafter.
//! Fenced ` ```image ` blocks describe page images and become
//! [`ImageCatalogEntry`] values; the remaining text is split into
//! paragraph-aware [`TextChunk`]s under a character budget. Both sides are
//! queried with the same scorer ([`score`]): lower-cased alphanumeric query
//! tokens matched as substrings, a fixed hit weight plus a capped frequency
//! bonus per token.

use serde::Deserialize;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use tracing::{debug, warn};

/// Default maximum characters per text chunk.
pub const DEFAULT_MAX_CHUNK_CHARS: usize = 1600;

/// Score added for each query token found in the candidate text.
const TOKEN_HIT_WEIGHT: u32 = 12;

/// Cap on the per-token frequency bonus.
const FREQUENCY_BONUS_CAP: u32 = 10;

/// Minimum token length considered by the scorer.
const MIN_TOKEN_LEN: usize = 3;

// ── Catalog ────────────────────────────────────────────────────────

/// A structured description of one document image, keyed by a stable id
/// derived from the referenced asset's path.
#[derive(Debug, Clone)]
pub struct ImageCatalogEntry {
    pub id: String,
    pub page: Option<u32>,
    pub source_locator: String,
    pub summary: String,
    pub description: String,
    pub ocr_text: String,
    pub key_entities: Vec<String>,
}

impl ImageCatalogEntry {
    /// The concatenated text the scorer sees for this entry.
    fn searchable_text(&self) -> String {
        let mut text = String::with_capacity(
            self.summary.len() + self.description.len() + self.ocr_text.len() + 32,
        );
        text.push_str(&self.summary);
        text.push(' ');
        text.push_str(&self.description);
        text.push(' ');
        text.push_str(&self.ocr_text);
        for entity in &self.key_entities {
            text.push(' ');
            text.push_str(entity);
        }
        text
    }

    /// One-line catalog listing shown to the model in retrieval mode.
    pub fn listing_line(&self) -> String {
        match self.page {
            Some(p) => format!("- {} (page {}): {}", self.id, p, self.summary),
            None => format!("- {}: {}", self.id, self.summary),
        }
    }
}

/// JSON body of a fenced `image` block.
#[derive(Deserialize)]
struct CatalogBlock {
    path: String,
    #[serde(default)]
    page: Option<u32>,
    #[serde(default)]
    summary: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    ocr_text: String,
    #[serde(default)]
    key_entities: Vec<String>,
}

/// An ordered text chunk. Ids follow insertion order and are significant
/// for citation stability.
#[derive(Debug, Clone)]
pub struct TextChunk {
    pub id: String,
    pub text: String,
}

// ── Index ──────────────────────────────────────────────────────────

/// Searchable catalog of image descriptors and text chunks for one document
/// snapshot. Built once, read-only, shared by all steps of a run.
#[derive(Debug, Default)]
pub struct DocumentIndex {
    images: Vec<ImageCatalogEntry>,
    by_id: HashMap<String, usize>,
    chunks: Vec<TextChunk>,
    /// Document text with the catalog blocks stripped, for full-document mode.
    body: String,
}

impl DocumentIndex {
    /// Build an index from raw document text.
    ///
    /// Fenced `image` blocks that fail to parse are skipped with a warning;
    /// a bad block never aborts the whole build.
    pub fn build(text: &str, max_chunk_chars: usize) -> Self {
        let (blocks, body) = extract_image_blocks(text);

        let mut images: Vec<ImageCatalogEntry> = Vec::new();
        let mut by_id: HashMap<String, usize> = HashMap::new();

        for raw in blocks {
            let block: CatalogBlock = match serde_json::from_str(&raw) {
                Ok(b) => b,
                Err(e) => {
                    warn!("Skipping malformed image catalog block: {e}");
                    continue;
                }
            };
            let mut id = derive_image_id(&block.path);
            if by_id.contains_key(&id) {
                id = format!("{id}_{}", short_path_hash(&block.path));
            }
            if by_id.contains_key(&id) {
                warn!("Duplicate catalog id {id} after disambiguation; skipping block");
                continue;
            }
            by_id.insert(id.clone(), images.len());
            images.push(ImageCatalogEntry {
                id,
                page: block.page,
                source_locator: block.path,
                summary: block.summary,
                description: block.description,
                ocr_text: block.ocr_text,
                key_entities: block.key_entities,
            });
        }

        let chunks = chunk_paragraphs(&body, max_chunk_chars);
        debug!(
            "Index built: {} image(s), {} chunk(s), {} body chars",
            images.len(),
            chunks.len(),
            body.len()
        );

        Self {
            images,
            by_id,
            chunks,
            body,
        }
    }

    /// Whether the index holds neither images nor text.
    pub fn is_empty(&self) -> bool {
        self.images.is_empty() && self.chunks.is_empty()
    }

    /// Look up a catalog entry by id.
    pub fn image(&self, id: &str) -> Option<&ImageCatalogEntry> {
        self.by_id.get(id).map(|&i| &self.images[i])
    }

    /// All catalog entries in insertion order.
    pub fn images(&self) -> &[ImageCatalogEntry] {
        &self.images
    }

    /// All text chunks in insertion order.
    pub fn chunks(&self) -> &[TextChunk] {
        &self.chunks
    }

    /// The document text with catalog blocks stripped.
    pub fn body(&self) -> &str {
        &self.body
    }

    /// Top-k text chunks by query score. Zero-score chunks are excluded;
    /// ties keep insertion order.
    pub fn retrieve_text_chunks(&self, query: &str, top_k: usize) -> Vec<&TextChunk> {
        rank_by_score(self.chunks.iter(), |c| score(&c.text, query), top_k)
    }

    /// Top-k image catalog entries by query score over summary, description,
    /// OCR text, and entities.
    pub fn retrieve_image_candidates(&self, query: &str, top_k: usize) -> Vec<&ImageCatalogEntry> {
        rank_by_score(
            self.images.iter(),
            |e| score(&e.searchable_text(), query),
            top_k,
        )
    }
}

/// Rank candidates by descending score, dropping zero scores. The sort is
/// stable so equal scores keep their original order.
fn rank_by_score<'a, T, I, F>(candidates: I, score_fn: F, top_k: usize) -> Vec<&'a T>
where
    I: Iterator<Item = &'a T>,
    F: Fn(&T) -> u32,
{
    let mut scored: Vec<(u32, &T)> = candidates
        .map(|c| (score_fn(c), c))
        .filter(|(s, _)| *s > 0)
        .collect();
    scored.sort_by(|a, b| b.0.cmp(&a.0));
    scored.into_iter().take(top_k).map(|(_, c)| c).collect()
}

// ── Scoring ────────────────────────────────────────────────────────

/// Score a candidate text against a query.
///
/// The query is tokenized into lower-cased alphanumeric tokens of length ≥ 3,
/// deduplicated with order preserved. Each token present as a substring of
/// the lower-cased candidate adds a fixed weight plus a frequency bonus
/// capped at 10 occurrences.
pub fn score(text: &str, query: &str) -> u32 {
    let haystack = text.to_lowercase();
    let mut total = 0u32;
    for token in query_tokens(query) {
        let occurrences = count_occurrences(&haystack, &token) as u32;
        if occurrences > 0 {
            total += TOKEN_HIT_WEIGHT + occurrences.min(FREQUENCY_BONUS_CAP);
        }
    }
    total
}

/// Lower-cased alphanumeric query tokens of length ≥ 3, deduplicated,
/// order preserved.
fn query_tokens(query: &str) -> Vec<String> {
    let mut seen: Vec<String> = Vec::new();
    for token in query
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.chars().count() >= MIN_TOKEN_LEN)
    {
        if !seen.iter().any(|s| s == token) {
            seen.push(token.to_string());
        }
    }
    seen
}

/// Count non-overlapping occurrences of `needle` in `haystack`.
fn count_occurrences(haystack: &str, needle: &str) -> usize {
    if needle.is_empty() {
        return 0;
    }
    haystack.matches(needle).count()
}

// ── Building blocks ────────────────────────────────────────────────

/// Extract fenced `image` blocks, returning their raw JSON bodies and the
/// document text with those blocks removed.
fn extract_image_blocks(text: &str) -> (Vec<String>, String) {
    let mut blocks = Vec::new();
    let mut body = String::with_capacity(text.len());
    let mut current: Option<String> = None;

    for line in text.lines() {
        let trimmed = line.trim();
        if current.is_some() {
            if trimmed == "```" {
                blocks.push(current.take().unwrap_or_default());
            } else if let Some(block) = current.as_mut() {
                block.push_str(line);
                block.push('\n');
            }
        } else if trimmed == "```image" {
            current = Some(String::new());
        } else {
            body.push_str(line);
            body.push('\n');
        }
    }

    // An unterminated block runs to end of input; treat it as a block so a
    // missing closing fence doesn't leak raw JSON into the chunk text.
    if let Some(block) = current {
        blocks.push(block);
    }

    (blocks, body)
}

/// Derive a stable image id from the asset path: the lower-cased file stem
/// with non-alphanumerics mapped to underscores.
fn derive_image_id(path: &str) -> String {
    let file_name = path.rsplit(['/', '\\']).next().unwrap_or(path);
    let stem = file_name
        .rsplit_once('.')
        .map_or(file_name, |(stem, _ext)| stem);
    let id: String = stem
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '_' })
        .collect();
    if id.is_empty() { "img".to_string() } else { id }
}

/// Short deterministic hex digest of a path, for id collision disambiguation.
fn short_path_hash(path: &str) -> String {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    path.hash(&mut hasher);
    format!("{:06x}", hasher.finish() & 0xff_ffff)
}

/// Split text into paragraphs on blank lines, then greedily pack consecutive
/// paragraphs into chunks not exceeding `max_chars`. A chunk is flushed when
/// the next paragraph would overflow it; a single oversized paragraph becomes
/// its own chunk.
fn chunk_paragraphs(body: &str, max_chars: usize) -> Vec<TextChunk> {
    let paragraphs: Vec<String> = body
        .split("\n\n")
        .map(|p| p.trim())
        .filter(|p| !p.is_empty())
        .map(|p| p.to_string())
        .collect();

    let mut chunks: Vec<TextChunk> = Vec::new();
    let mut current = String::new();

    let mut flush = |current: &mut String, chunks: &mut Vec<TextChunk>| {
        if !current.is_empty() {
            chunks.push(TextChunk {
                id: format!("chunk_{:03}", chunks.len() + 1),
                text: std::mem::take(current),
            });
        }
    };

    for para in paragraphs {
        let projected = if current.is_empty() {
            para.len()
        } else {
            current.len() + 2 + para.len()
        };
        if projected > max_chars && !current.is_empty() {
            flush(&mut current, &mut chunks);
        }
        if current.is_empty() {
            current = para;
        } else {
            current.push_str("\n\n");
            current.push_str(&para);
        }
    }
    flush(&mut current, &mut chunks);

    chunks
}
