//! Progressive image frames for image-generation tools.
//!
//! Each completed `partial_image_b64` part becomes one frame. The ordered
//! frame list a tool exposes as its output is recomputed from the part map
//! on every update, so arrival order never affects the result.

use base64::Engine as _;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use tracing::warn;

/// One progressive-image frame, ordered by its part index.
#[derive(Debug, Clone, Serialize)]
pub struct ImageFrame {
    pub id: String,
    pub src: String,
    pub status: String,
    pub output_index: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub revised_prompt: Option<String>,
}

/// Provider-reported metadata for one tool's image output.
#[derive(Debug, Clone, Default)]
pub struct ImageMeta {
    pub format: Option<String>,
    pub revised_prompt: Option<String>,
}

/// Frames and metadata per canonical tool id.
#[derive(Debug, Default)]
pub struct ImageAssembler {
    frames: HashMap<String, BTreeMap<u64, ImageFrame>>,
    meta: HashMap<String, ImageMeta>,
}

impl ImageAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the provider-reported output format (`png`, `jpeg`, ...).
    /// First report wins.
    pub fn set_format(&mut self, tool_id: &str, format: &str) {
        let meta = self.meta.entry(tool_id.to_string()).or_default();
        if meta.format.is_none() {
            meta.format = Some(format.to_string());
        }
    }

    pub fn set_revised_prompt(&mut self, tool_id: &str, prompt: &str) {
        let meta = self.meta.entry(tool_id.to_string()).or_default();
        if meta.revised_prompt.is_none() {
            meta.revised_prompt = Some(prompt.to_string());
        }
    }

    /// Store the reassembled payload for one part and return the tool's full
    /// frame list, sorted by part index.
    pub fn push_frame(
        &mut self,
        tool_id: &str,
        part_index: u64,
        encoding: Option<&str>,
        data: String,
        default_format: &str,
    ) -> Value {
        let meta = self.meta.entry(tool_id.to_string()).or_default().clone();
        let format = meta.format.as_deref().unwrap_or(default_format);
        let src = frame_src(encoding, &data, format);
        let frame = ImageFrame {
            id: format!("{}-{}", tool_id, part_index),
            src,
            status: "completed".to_string(),
            output_index: part_index,
            revised_prompt: meta.revised_prompt,
        };
        self.frames
            .entry(tool_id.to_string())
            .or_default()
            .insert(part_index, frame);
        self.frame_list(tool_id)
    }

    /// The ordered frame list for `tool_id`, or `Null` when none exist.
    pub fn frame_list(&self, tool_id: &str) -> Value {
        match self.frames.get(tool_id) {
            Some(parts) if !parts.is_empty() => {
                serde_json::to_value(parts.values().collect::<Vec<_>>()).unwrap_or(Value::Null)
            }
            _ => Value::Null,
        }
    }

    pub fn has_frames(&self, tool_id: &str) -> bool {
        self.frames.get(tool_id).is_some_and(|p| !p.is_empty())
    }

    /// Move all frames and metadata accumulated under `loser` onto `winner`,
    /// preferring the winner's entries where both exist.
    pub fn merge_ids(&mut self, winner: &str, loser: &str) {
        if let Some(lost_frames) = self.frames.remove(loser) {
            let target = self.frames.entry(winner.to_string()).or_default();
            for (part, frame) in lost_frames {
                target.entry(part).or_insert(frame);
            }
        }
        if let Some(lost_meta) = self.meta.remove(loser) {
            let meta = self.meta.entry(winner.to_string()).or_default();
            if meta.format.is_none() {
                meta.format = lost_meta.format;
            }
            if meta.revised_prompt.is_none() {
                meta.revised_prompt = lost_meta.revised_prompt;
            }
        }
    }
}

/// Build a frame's `src`: base64 payloads become a data URL with the tool's
/// mime type, anything else passes through as raw text.
fn frame_src(encoding: Option<&str>, data: &str, format: &str) -> String {
    match encoding {
        Some("base64") | None => {
            if base64::engine::general_purpose::STANDARD.decode(data).is_ok() {
                format!("data:{};base64,{}", mime_for(format), data)
            } else {
                warn!("image part is not valid base64, passing through as text");
                data.to_string()
            }
        }
        _ => data.to_string(),
    }
}

fn mime_for(format: &str) -> String {
    match format {
        "png" => "image/png".to_string(),
        "jpg" | "jpeg" => "image/jpeg".to_string(),
        "webp" => "image/webp".to_string(),
        "gif" => "image/gif".to_string(),
        other => format!("image/{}", other),
    }
}
