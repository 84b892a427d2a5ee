//! Disk-backed page image cache and zoom engine.
//!
//! The [`PageCache`] is an owned component constructed with an explicit
//! scratch directory, so multiple runs or test harnesses can use isolated
//! caches without interference. Its core invariant: **an id is fetched from
//! its source at most once per process lifetime**. Entries are write-once;
//! the id→entry map inserts under a mutex so concurrent runs cannot race a
//! duplicate fetch-and-write for the same id.
//!
//! `fetch_base` produces the base image shown to the model — downscaled to a
//! preview when the source exceeds the preview side limit, with a description
//! string that states the real-vs-displayed size relationship. `zoom` crops a
//! region out of the cached full-resolution raster; crops above the output
//! ceiling are downscaled and marked as zoom previews.

use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView};
use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// Default longest side for base-image previews.
pub const DEFAULT_MAX_PREVIEW_SIDE: u32 = 2000;

/// Fixed ceiling on the longest side of a zoom crop before it is
/// downscaled into a zoom preview.
pub const ZOOM_OUTPUT_CEILING: u32 = 2000;

/// Fraction of each axis above which a zoom region counts as the full frame.
const FULL_FRAME_TOLERANCE: f64 = 0.99;

// ── Source fetcher seam ────────────────────────────────────────────

/// Boxed future returned by [`SourceFetcher::fetch`].
pub type FetchFuture<'a> = Pin<Box<dyn Future<Output = Result<Vec<u8>, String>> + Send + 'a>>;

/// External renderer/fetcher that resolves a source locator to raw raster
/// bytes. Failures are reported upstream as missing ids, never as run aborts.
///
/// Implementations that cross a network must bound their fetch time and
/// retry transient failures themselves; the loop treats whatever error
/// surfaces here as final for that id.
pub trait SourceFetcher: Send + Sync {
    fn fetch(&self, locator: &str) -> FetchFuture<'_>;
}

/// Fetcher that reads page rasters from a directory, treating the locator as
/// a relative path.
pub struct DirectoryFetcher {
    root: PathBuf,
}

impl DirectoryFetcher {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl SourceFetcher for DirectoryFetcher {
    fn fetch(&self, locator: &str) -> FetchFuture<'_> {
        let path = self.root.join(locator);
        Box::pin(async move {
            tokio::fs::read(&path)
                .await
                .map_err(|e| format!("failed to read source {}: {e}", path.display()))
        })
    }
}

// ── Cache types ────────────────────────────────────────────────────

/// One cached page image. Created on first fetch, never mutated.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub id: String,
    pub full_path: PathBuf,
    /// Full-resolution pixel dimensions.
    pub width: u32,
    pub height: u32,
    pub preview_path: Option<PathBuf>,
    pub preview_scale: Option<f64>,
}

/// The base image delivered for an id: the preview when one exists,
/// otherwise the full-resolution raster.
#[derive(Debug, Clone)]
pub struct BaseImage {
    pub id: String,
    /// The file to display/transmit.
    pub path: PathBuf,
    /// Full-resolution dimensions (not the displayed dimensions).
    pub width: u32,
    pub height: u32,
    /// States the real-vs-displayed size relationship; the model reads this
    /// to know whether detail may be missing.
    pub description: String,
}

/// A persisted zoom crop.
#[derive(Debug, Clone)]
pub struct ZoomCrop {
    pub id: String,
    pub path: PathBuf,
    /// The clamped pixel region `[x1, y1, x2, y2]` the crop was taken from.
    pub region_px: [u32; 4],
    /// Output dimensions after any preview downscale.
    pub width: u32,
    pub height: u32,
    pub description: String,
}

/// A zoom region, either normalized to `[0, 1]` or in raw pixels.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ZoomRegion {
    Normalized([f64; 4]),
    Pixel([u32; 4]),
}

impl ZoomRegion {
    /// Whether the region covers ≥ 99 % of the image in both axes — a
    /// "show me the base image" request in disguise, which callers reject.
    pub fn is_full_frame(&self, width: u32, height: u32) -> bool {
        match *self {
            ZoomRegion::Normalized([x1, y1, x2, y2]) => {
                let w = (x2.min(1.0) - x1.max(0.0)).max(0.0);
                let h = (y2.min(1.0) - y1.max(0.0)).max(0.0);
                w >= FULL_FRAME_TOLERANCE && h >= FULL_FRAME_TOLERANCE
            }
            ZoomRegion::Pixel([x1, y1, x2, y2]) => {
                if width == 0 || height == 0 {
                    return true;
                }
                let w = x2.min(width).saturating_sub(x1) as f64 / width as f64;
                let h = y2.min(height).saturating_sub(y1) as f64 / height as f64;
                w >= FULL_FRAME_TOLERANCE && h >= FULL_FRAME_TOLERANCE
            }
        }
    }
}

// ── PageCache ──────────────────────────────────────────────────────

/// Disk-backed image cache keyed by stable ids, with an injected scratch
/// root. Layout under the root: `full/<id>.png`, `preview/<id>.png`,
/// `zoom/<id>_<n>.png`.
pub struct PageCache {
    root: PathBuf,
    fetcher: Arc<dyn SourceFetcher>,
    entries: Mutex<HashMap<String, CacheEntry>>,
    zoom_seq: AtomicU32,
}

impl PageCache {
    /// Create a cache rooted at `root`, creating the directory layout.
    pub fn new(root: impl Into<PathBuf>, fetcher: Arc<dyn SourceFetcher>) -> Result<Self, String> {
        let root = root.into();
        for sub in ["full", "preview", "zoom"] {
            std::fs::create_dir_all(root.join(sub))
                .map_err(|e| format!("failed to create cache dir {}: {e}", root.display()))?;
        }
        Ok(Self {
            root,
            fetcher,
            entries: Mutex::new(HashMap::new()),
            zoom_seq: AtomicU32::new(0),
        })
    }

    /// The cache entry for an id, if it was fetched in this process.
    pub fn entry(&self, id: &str) -> Option<CacheEntry> {
        self.entries
            .lock()
            .map(|map| map.get(id).cloned())
            .unwrap_or_default()
    }

    fn full_path(&self, id: &str) -> PathBuf {
        self.root.join("full").join(format!("{id}.png"))
    }

    fn preview_path(&self, id: &str) -> PathBuf {
        self.root.join("preview").join(format!("{id}.png"))
    }

    /// Fetch the base image for `id`, serving from memory or disk when
    /// possible. The source fetcher is invoked at most once per id per
    /// process lifetime.
    pub async fn fetch_base(
        &self,
        id: &str,
        source_locator: &str,
        max_preview_side: u32,
    ) -> Result<BaseImage, String> {
        // Memory hit: nothing to do.
        if let Some(entry) = self.entry(id) {
            debug!("Cache memory hit for {id}");
            return Ok(base_image_for(&entry));
        }

        // Disk hit: a previous process fetched this id; rebuild the entry
        // without touching the source.
        let full_path = self.full_path(id);
        if full_path.exists() {
            debug!("Cache disk hit for {id}");
            let (width, height) = image::image_dimensions(&full_path)
                .map_err(|e| format!("failed to read cached image {id}: {e}"))?;
            let entry = self.entry_from_disk(id, full_path, width, height, max_preview_side);
            return Ok(base_image_for(&self.insert_entry(entry)));
        }

        // Miss: fetch from the source, decode, persist, derive the preview.
        info!("Fetching source for {id} ({source_locator})");
        let bytes = self.fetcher.fetch(source_locator).await?;
        let decoded = image::load_from_memory(&bytes)
            .map_err(|e| format!("failed to decode image for {id}: {e}"))?;
        let (width, height) = decoded.dimensions();

        decoded
            .save(&full_path)
            .map_err(|e| format!("failed to persist full image for {id}: {e}"))?;

        let (preview_path, preview_scale) =
            self.derive_preview(id, &decoded, width, height, max_preview_side)?;

        let entry = CacheEntry {
            id: id.to_string(),
            full_path,
            width,
            height,
            preview_path,
            preview_scale,
        };
        Ok(base_image_for(&self.insert_entry(entry)))
    }

    /// Crop a region out of the cached full-resolution raster for `id`.
    ///
    /// Requires a prior `fetch_base` for the id. The region is clamped to the
    /// image bounds; a clamped width or height of zero is a failure. Crops
    /// whose longest side exceeds [`ZOOM_OUTPUT_CEILING`] are downscaled and
    /// marked as zoom previews.
    pub fn zoom(&self, id: &str, region: ZoomRegion) -> Result<ZoomCrop, String> {
        let entry = self
            .entry(id)
            .ok_or_else(|| format!("zoom requested for {id}, which has not been fetched"))?;

        let [x1, y1, x2, y2] = clamp_region(region, entry.width, entry.height);
        let (crop_w, crop_h) = (x2.saturating_sub(x1), y2.saturating_sub(y1));
        if crop_w == 0 || crop_h == 0 {
            return Err(format!(
                "zoom region for {id} has no area after clamping to {}x{}",
                entry.width, entry.height
            ));
        }

        let full = image::open(&entry.full_path)
            .map_err(|e| format!("failed to open cached image {id}: {e}"))?;
        let crop = full.crop_imm(x1, y1, crop_w, crop_h);

        let seq = self.zoom_seq.fetch_add(1, Ordering::SeqCst);
        let out_path = self.root.join("zoom").join(format!("{id}_{seq}.png"));

        let longer = crop_w.max(crop_h);
        let (output, description) = if longer > ZOOM_OUTPUT_CEILING {
            let factor = longer as f64 / ZOOM_OUTPUT_CEILING as f64;
            let (out_w, out_h) = scaled_dims(crop_w, crop_h, factor);
            let scaled = crop.resize_exact(out_w, out_h, FilterType::Triangle);
            let description = format!(
                "zoom preview, factor {factor:.1}x (crop {crop_w}x{crop_h} from {}x{}); zoom further for native detail",
                entry.width, entry.height
            );
            (scaled, description)
        } else {
            let description = format!(
                "native crop {crop_w}x{crop_h} from {}x{}",
                entry.width, entry.height
            );
            (crop, description)
        };

        let (out_w, out_h) = output.dimensions();
        output
            .save(&out_path)
            .map_err(|e| format!("failed to persist zoom crop for {id}: {e}"))?;
        debug!("Zoom {id} [{x1},{y1},{x2},{y2}] -> {out_w}x{out_h}");

        Ok(ZoomCrop {
            id: id.to_string(),
            path: out_path,
            region_px: [x1, y1, x2, y2],
            width: out_w,
            height: out_h,
            description,
        })
    }

    /// Rebuild an entry from files already on disk.
    fn entry_from_disk(
        &self,
        id: &str,
        full_path: PathBuf,
        width: u32,
        height: u32,
        max_preview_side: u32,
    ) -> CacheEntry {
        let preview_path = self.preview_path(id);
        let (preview_path, preview_scale) = if preview_path.exists() {
            let longer = width.max(height);
            (
                Some(preview_path),
                Some(longer as f64 / max_preview_side as f64),
            )
        } else {
            (None, None)
        };
        CacheEntry {
            id: id.to_string(),
            full_path,
            width,
            height,
            preview_path,
            preview_scale,
        }
    }

    /// Generate and persist a preview when the image exceeds the side limit.
    fn derive_preview(
        &self,
        id: &str,
        decoded: &DynamicImage,
        width: u32,
        height: u32,
        max_preview_side: u32,
    ) -> Result<(Option<PathBuf>, Option<f64>), String> {
        let longer = width.max(height);
        if longer <= max_preview_side {
            return Ok((None, None));
        }
        let factor = longer as f64 / max_preview_side as f64;
        let (out_w, out_h) = scaled_dims(width, height, factor);
        let preview = decoded.resize_exact(out_w, out_h, FilterType::Triangle);
        let path = self.preview_path(id);
        preview
            .save(&path)
            .map_err(|e| format!("failed to persist preview for {id}: {e}"))?;
        Ok((Some(path), Some(factor)))
    }

    /// Insert under the map mutex. If another run inserted the same id while
    /// we were fetching, keep the existing entry — the disk state is keyed by
    /// id and identical.
    fn insert_entry(&self, entry: CacheEntry) -> CacheEntry {
        match self.entries.lock() {
            Ok(mut map) => map.entry(entry.id.clone()).or_insert(entry).clone(),
            Err(poisoned) => {
                warn!("Cache map mutex poisoned; recovering");
                let mut map = poisoned.into_inner();
                map.entry(entry.id.clone()).or_insert(entry).clone()
            }
        }
    }
}

/// The displayed file + description contract for an entry.
fn base_image_for(entry: &CacheEntry) -> BaseImage {
    match (&entry.preview_path, entry.preview_scale) {
        (Some(preview), Some(scale)) => BaseImage {
            id: entry.id.clone(),
            path: preview.clone(),
            width: entry.width,
            height: entry.height,
            description: format!(
                "scaled preview, factor {scale:.1}x (full resolution {}x{}); zoom in for detail",
                entry.width, entry.height
            ),
        },
        _ => BaseImage {
            id: entry.id.clone(),
            path: entry.full_path.clone(),
            width: entry.width,
            height: entry.height,
            description: format!("full resolution {}x{}", entry.width, entry.height),
        },
    }
}

/// Convert a region to pixels against the full-resolution dimensions and
/// clamp it to the image bounds.
fn clamp_region(region: ZoomRegion, width: u32, height: u32) -> [u32; 4] {
    match region {
        ZoomRegion::Normalized([x1, y1, x2, y2]) => [
            ((x1.clamp(0.0, 1.0)) * width as f64).round() as u32,
            ((y1.clamp(0.0, 1.0)) * height as f64).round() as u32,
            ((x2.clamp(0.0, 1.0)) * width as f64).round() as u32,
            ((y2.clamp(0.0, 1.0)) * height as f64).round() as u32,
        ],
        ZoomRegion::Pixel([x1, y1, x2, y2]) => {
            [x1.min(width), y1.min(height), x2.min(width), y2.min(height)]
        }
    }
}

/// Downscale dimensions by a uniform factor, never below 1 px.
fn scaled_dims(width: u32, height: u32, factor: f64) -> (u32, u32) {
    (
        ((width as f64 / factor).round() as u32).max(1),
        ((height as f64 / factor).round() as u32).max(1),
    )
}
