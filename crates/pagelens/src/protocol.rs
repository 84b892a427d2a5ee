//! Tool-call protocol parser for raw model output.
//!
//! The model signals requests with line-oriented commands embedded in its
//! response text:
//!
//! ```text
//! REQUEST_DOCUMENTS: electrical schedule, riser diagram | need the submains
//! SHOW_IMAGES: img_42, img_7
//! ZOOM: img_42 [0.2, 0.3, 0.6, 0.7] | read the serial plate
//! ```
//!
//! A response with no command lines is a final answer. Detection order is
//! fixed — document request, then image request, then zoom request(s) — and
//! exactly one primary category is authoritative per response. One response
//! may carry several `ZOOM` lines; each is returned independently and in
//! order of appearance. Classification happens before text cleanup, so
//! malformed command fragments are stripped from the human-visible prose
//! rather than shown as answer text.

use crate::cache::ZoomRegion;
use regex::Regex;
use std::sync::OnceLock;
use tracing::debug;

/// Raster extensions stripped from requested ids before catalog lookup.
/// The catalog derives ids from asset file stems, so models sometimes echo
/// the extension back.
const STRIPPED_EXTENSIONS: [&str; 4] = [".png", ".jpg", ".jpeg", ".webp"];

// ── Tool calls ─────────────────────────────────────────────────────

/// A structured request extracted from model output. Closed variant —
/// resolution sites match exhaustively, so adding a tool kind is a
/// compile-time-checked change.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolCall {
    /// Deliver the base images for these catalog ids.
    RequestImages { ids: Vec<String> },
    /// Crop a region out of a previously shown image. `region` is `None`
    /// when the model supplied no coordinates or unparseable ones.
    Zoom {
        image_id: String,
        region: Option<ZoomRegion>,
        reason: Option<String>,
    },
    /// Ask the user for additional documents not in this run.
    RequestDocuments {
        names: Vec<String>,
        reason: Option<String>,
    },
    /// The response is the final answer; no tool resolution needed.
    FinalAnswer { text: String },
}

/// The single authoritative interpretation of one model response.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedResponse {
    /// The calls to resolve, in order: exactly one non-zoom call, or one or
    /// more zoom calls.
    pub calls: Vec<ToolCall>,
    /// Prose with all command lines removed; safe to show a user.
    pub visible_text: String,
}

impl ParsedResponse {
    /// Whether this response is a final answer.
    pub fn is_final(&self) -> bool {
        matches!(self.calls.first(), Some(ToolCall::FinalAnswer { .. }))
    }
}

fn doc_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?im)^\s*REQUEST_DOCUMENTS\s*:\s*(.+)$").unwrap())
}

fn images_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?im)^\s*SHOW_IMAGES\s*:\s*(.+)$").unwrap())
}

fn zoom_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?im)^\s*ZOOM\s*:\s*([^\s\[\|]+)\s*(?:\[([^\]]*)\])?\s*(?:\|\s*(.*\S))?\s*$")
            .unwrap()
    })
}

fn command_line_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?im)^\s*(?:REQUEST_DOCUMENTS|SHOW_IMAGES|ZOOM)\s*:.*$").unwrap()
    })
}

/// Parse raw model output into its authoritative tool interpretation.
pub fn parse(raw: &str) -> ParsedResponse {
    // Classify first; strip command lines from the visible prose second.
    if let Some(caps) = doc_re().captures(raw) {
        let (names, reason) = split_list_and_reason(&caps[1]);
        debug!("Parsed document request: {names:?}");
        return ParsedResponse {
            calls: vec![ToolCall::RequestDocuments { names, reason }],
            visible_text: cleaned(raw),
        };
    }

    let mut ids: Vec<String> = Vec::new();
    for caps in images_re().captures_iter(raw) {
        let (line_ids, _reason) = split_list_and_reason(&caps[1]);
        for id in line_ids {
            let id = normalize_id(&id);
            if !ids.contains(&id) {
                ids.push(id);
            }
        }
    }
    if !ids.is_empty() {
        debug!("Parsed image request: {ids:?}");
        return ParsedResponse {
            calls: vec![ToolCall::RequestImages { ids }],
            visible_text: cleaned(raw),
        };
    }

    let zooms: Vec<ToolCall> = zoom_re()
        .captures_iter(raw)
        .map(|caps| ToolCall::Zoom {
            image_id: normalize_id(caps[1].trim()),
            region: caps.get(2).and_then(|m| parse_region(m.as_str())),
            reason: caps.get(3).map(|m| m.as_str().trim().to_string()),
        })
        .collect();
    if !zooms.is_empty() {
        debug!("Parsed {} zoom request(s)", zooms.len());
        return ParsedResponse {
            calls: zooms,
            visible_text: cleaned(raw),
        };
    }

    let text = raw.trim().to_string();
    ParsedResponse {
        calls: vec![ToolCall::FinalAnswer { text: text.clone() }],
        visible_text: text,
    }
}

/// Split `a, b, c | reason` into the item list and the optional reason.
fn split_list_and_reason(payload: &str) -> (Vec<String>, Option<String>) {
    let (list, reason) = match payload.split_once('|') {
        Some((list, reason)) => (list, Some(reason.trim().to_string()).filter(|r| !r.is_empty())),
        None => (payload, None),
    };
    let items = list
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();
    (items, reason)
}

/// Normalize a requested id: strip a trailing raster extension and lower-case
/// to match catalog-derived ids.
fn normalize_id(id: &str) -> String {
    let mut id = id.to_lowercase();
    for ext in STRIPPED_EXTENSIONS {
        if id.ends_with(ext) {
            id.truncate(id.len() - ext.len());
            break;
        }
    }
    id
}

/// Parse `x1, y1, x2, y2` into a region. Values all within `[0, 1]` read as
/// normalized coordinates, anything larger as pixels. Malformed payloads
/// yield `None` — the caller reports that back to the model.
fn parse_region(payload: &str) -> Option<ZoomRegion> {
    let values: Vec<f64> = payload
        .split(',')
        .map(|v| v.trim().parse::<f64>())
        .collect::<Result<_, _>>()
        .ok()?;
    if values.len() != 4 {
        return None;
    }
    let coords = [values[0], values[1], values[2], values[3]];
    if coords.iter().all(|&v| (0.0..=1.0).contains(&v)) {
        Some(ZoomRegion::Normalized(coords))
    } else {
        Some(ZoomRegion::Pixel(coords.map(|v| v.max(0.0).round() as u32)))
    }
}

/// Remove command lines from the prose and tidy the leftover whitespace.
fn cleaned(raw: &str) -> String {
    let stripped = command_line_re().replace_all(raw, "");
    let mut out = String::with_capacity(stripped.len());
    let mut blank_run = 0usize;
    for line in stripped.lines() {
        if line.trim().is_empty() {
            blank_run += 1;
            if blank_run > 1 {
                continue;
            }
        } else {
            blank_run = 0;
        }
        out.push_str(line);
        out.push('\n');
    }
    out.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_text_is_final_answer() {
        let parsed = parse("The riser terminates at the roof penthouse.");
        assert!(parsed.is_final());
        assert_eq!(
            parsed.visible_text,
            "The riser terminates at the roof penthouse."
        );
    }

    #[test]
    fn image_request_with_prose() {
        let parsed = parse(
            "I need to see the diagrams first.\n\nSHOW_IMAGES: img_42, img_7\n\nThen I can answer.",
        );
        assert_eq!(
            parsed.calls,
            vec![ToolCall::RequestImages {
                ids: vec!["img_42".into(), "img_7".into()]
            }]
        );
        assert!(parsed.visible_text.contains("I need to see the diagrams"));
        assert!(!parsed.visible_text.contains("SHOW_IMAGES"));
    }

    #[test]
    fn extension_suffixes_stripped() {
        let parsed = parse("SHOW_IMAGES: img_42.png, plan_2.JPG, img_42");
        assert_eq!(
            parsed.calls,
            vec![ToolCall::RequestImages {
                ids: vec!["img_42".into(), "plan_2".into()]
            }]
        );
    }

    #[test]
    fn zoom_with_normalized_coords_and_reason() {
        let parsed = parse("ZOOM: img_42 [0.2, 0.3, 0.6, 0.7] | read the serial plate");
        assert_eq!(
            parsed.calls,
            vec![ToolCall::Zoom {
                image_id: "img_42".into(),
                region: Some(ZoomRegion::Normalized([0.2, 0.3, 0.6, 0.7])),
                reason: Some("read the serial plate".into()),
            }]
        );
    }

    #[test]
    fn zoom_with_pixel_coords() {
        let parsed = parse("ZOOM: img_7.png [100, 50, 900, 700]");
        assert_eq!(
            parsed.calls,
            vec![ToolCall::Zoom {
                image_id: "img_7".into(),
                region: Some(ZoomRegion::Pixel([100, 50, 900, 700])),
                reason: None,
            }]
        );
    }

    #[test]
    fn multiple_zooms_kept_in_order() {
        let parsed = parse(
            "Checking two spots.\nZOOM: img_1 [0.0, 0.0, 0.5, 0.5]\nZOOM: img_2 [0.5, 0.5, 1.0, 1.0] | legend",
        );
        assert_eq!(parsed.calls.len(), 2);
        match (&parsed.calls[0], &parsed.calls[1]) {
            (
                ToolCall::Zoom { image_id: a, .. },
                ToolCall::Zoom {
                    image_id: b,
                    reason,
                    ..
                },
            ) => {
                assert_eq!(a, "img_1");
                assert_eq!(b, "img_2");
                assert_eq!(reason.as_deref(), Some("legend"));
            }
            other => panic!("expected two zooms, got {other:?}"),
        }
    }

    #[test]
    fn zoom_without_coords_has_no_region() {
        let parsed = parse("ZOOM: img_42");
        assert_eq!(
            parsed.calls,
            vec![ToolCall::Zoom {
                image_id: "img_42".into(),
                region: None,
                reason: None,
            }]
        );
    }

    #[test]
    fn malformed_coords_yield_no_region() {
        let parsed = parse("ZOOM: img_42 [0.2, wide, 0.6, 0.7]");
        match &parsed.calls[0] {
            ToolCall::Zoom { region, .. } => assert!(region.is_none()),
            other => panic!("expected zoom, got {other:?}"),
        }

        let parsed = parse("ZOOM: img_42 [0.2, 0.3, 0.6]");
        match &parsed.calls[0] {
            ToolCall::Zoom { region, .. } => assert!(region.is_none()),
            other => panic!("expected zoom, got {other:?}"),
        }
    }

    #[test]
    fn document_request_takes_precedence() {
        let parsed = parse(
            "REQUEST_DOCUMENTS: electrical schedule, riser diagram | need the submains\nZOOM: img_1 [0.1, 0.1, 0.5, 0.5]",
        );
        assert_eq!(
            parsed.calls,
            vec![ToolCall::RequestDocuments {
                names: vec!["electrical schedule".into(), "riser diagram".into()],
                reason: Some("need the submains".into()),
            }]
        );
        // The non-authoritative zoom line is still scrubbed from the prose.
        assert!(!parsed.visible_text.contains("ZOOM"));
    }

    #[test]
    fn image_request_takes_precedence_over_zoom() {
        let parsed = parse("SHOW_IMAGES: img_1\nZOOM: img_1 [0.1, 0.1, 0.5, 0.5]");
        assert!(matches!(parsed.calls[0], ToolCall::RequestImages { .. }));
        assert_eq!(parsed.calls.len(), 1);
    }

    #[test]
    fn command_keyword_is_case_insensitive() {
        let parsed = parse("show_images: img_3");
        assert_eq!(
            parsed.calls,
            vec![ToolCall::RequestImages {
                ids: vec!["img_3".into()]
            }]
        );
    }

    #[test]
    fn cleanup_collapses_blank_runs() {
        let parsed = parse("Before.\n\nSHOW_IMAGES: img_1\n\n\nAfter.");
        assert_eq!(parsed.visible_text, "Before.\n\nAfter.");
    }

    #[test]
    fn malformed_command_never_shown_as_prose() {
        // A garbled SHOW_IMAGES line with no ids parses as an empty request,
        // falls through to final answer, but the fragment is still removed
        // when another category classifies the response.
        let parsed = parse("ZOOM: img_1 [0.1, 0.1, 0.4, 0.4]\nSHOW_IMAGES:   ");
        // The empty image list cannot be authoritative; zooms win.
        assert!(matches!(parsed.calls[0], ToolCall::Zoom { .. }));
        assert!(!parsed.visible_text.contains("SHOW_IMAGES"));
    }
}
