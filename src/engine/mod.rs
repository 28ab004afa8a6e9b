//! The trace reduction engine.
//!
//! [`TraceSession`] owns everything downstream of the frame parser for one
//! stream: identity resolution, chunk reassembly, image frames, the tool map
//! and its auxiliary buffers, and the snapshot channel. It is a synchronous
//! reducer: events are applied one at a time in arrival order, and logical
//! out-of-order delivery (state accumulated under a pre-alias id) is absorbed
//! by merge-on-bind rather than by buffering events.

pub mod chunks;
pub mod identity;
pub mod images;
pub mod snapshot;
pub mod state;

use bytes::Bytes;
use chrono::Utc;
use futures::{Stream, StreamExt};
use serde_json::{json, Value};
use std::collections::HashMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::protocol::{self, ChunkTarget, ProtocolEvent, StatusPayload};
use crate::sse;

use chunks::ChunkStore;
use identity::IdentityMap;
use images::ImageAssembler;
use snapshot::{Snapshot, SnapshotEmitter};
use state::{classify_provider_status, ProviderStatus, ToolPatch, ToolState, ToolStatus};

/// Map an `output_item.added` item type to the tool type it is a placeholder
/// for. Unknown item types get no placeholder row.
fn placeholder_tool_type(item_type: &str) -> Option<&'static str> {
    match item_type {
        "web_search_call" => Some("web_search"),
        "file_search_call" => Some("file_search"),
        "code_interpreter_call" => Some("code_interpreter"),
        "image_generation_call" => Some("image_generation"),
        "mcp_call" => Some("mcp"),
        "function_call" | "custom_tool_call" => Some("function"),
        _ => None,
    }
}

/// One stream session's reducer state.
///
/// Constructed per stream, discarded at stream end. Single logical writer:
/// in a multi-threaded host, confine the session to one owner.
pub struct TraceSession {
    session_id: String,
    default_image_format: String,
    identity: IdentityMap,
    chunks: ChunkStore,
    images: ImageAssembler,
    tools: HashMap<String, ToolState>,
    args_text: HashMap<String, String>,
    code_text: HashMap<String, String>,
    first_seen: HashMap<String, i64>,
    seq: HashMap<String, u64>,
    next_seq: u64,
    emitter: SnapshotEmitter,
}

impl TraceSession {
    pub fn new(config: &Config) -> Self {
        Self {
            session_id: Uuid::new_v4().to_string(),
            default_image_format: config.default_image_format.clone(),
            identity: IdentityMap::new(),
            chunks: ChunkStore::new(),
            images: ImageAssembler::new(),
            tools: HashMap::new(),
            args_text: HashMap::new(),
            code_text: HashMap::new(),
            first_seen: HashMap::new(),
            seq: HashMap::new(),
            next_seq: 0,
            emitter: SnapshotEmitter::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.session_id
    }

    /// Subscribe to per-mutation snapshots. One consumer per session; a
    /// later call replaces the previous receiver.
    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<Snapshot> {
        self.emitter.subscribe()
    }

    /// Drive the session from a byte stream until it ends or `cancel` fires.
    pub async fn consume<S>(&mut self, bytes: S, cancel: CancellationToken)
    where
        S: Stream<Item = Bytes>,
    {
        let frames = sse::frames(bytes, cancel);
        tokio::pin!(frames);
        while let Some(frame) = frames.next().await {
            self.apply(protocol::decode_frame(&frame));
        }
        debug!(
            "session {} finished: {} tools, {} pending chunk targets",
            self.session_id,
            self.tools.len(),
            self.chunks.pending()
        );
    }

    /// Apply one decoded event. Never fails; malformed or unknown input has
    /// already been degraded to data by the decoder.
    pub fn apply(&mut self, event: ProtocolEvent) {
        let ts = event.server_timestamp();
        match event {
            ProtocolEvent::ToolStatus {
                item_id,
                tool_call_id,
                output_index,
                tool_name,
                tool_type,
                server_label,
                tool,
                ..
            } => {
                let Some(id) = self.primary_id(item_id.as_deref(), tool_call_id.as_deref(), ts)
                else {
                    debug!("tool.status without item_id or tool_call_id, ignoring");
                    return;
                };
                self.reduce_status(
                    &id,
                    tool_type.as_deref(),
                    tool_name.as_deref(),
                    server_label.as_deref(),
                    output_index,
                    &tool,
                );
            }

            ProtocolEvent::ToolArgumentsDelta {
                item_id,
                tool_call_id,
                tool_name,
                delta,
                ..
            } => {
                let Some(id) = self.primary_id(item_id.as_deref(), tool_call_id.as_deref(), ts)
                else {
                    return;
                };
                let text = {
                    let buf = self.args_text.entry(id.clone()).or_default();
                    buf.push_str(&delta);
                    buf.clone()
                };
                self.upsert(
                    &id,
                    ToolPatch {
                        name: tool_name,
                        status: Some(ToolStatus::InputStreaming),
                        input: Some(json!({ "arguments_text": text })),
                        replace_input: true,
                        ..Default::default()
                    },
                );
            }

            ProtocolEvent::ToolArgumentsDone {
                item_id,
                tool_call_id,
                tool_name,
                arguments_text,
                arguments_json,
                ..
            } => {
                let Some(id) = self.primary_id(item_id.as_deref(), tool_call_id.as_deref(), ts)
                else {
                    return;
                };
                let text = {
                    let buf = self.args_text.entry(id.clone()).or_default();
                    if let Some(text) = arguments_text {
                        *buf = text;
                    }
                    buf.clone()
                };
                let parsed = arguments_json
                    .or_else(|| serde_json::from_str(&text).ok())
                    .filter(|v| !v.is_null());
                let mut input = json!({ "arguments_text": text });
                if let Some(parsed) = parsed {
                    input["arguments_json"] = parsed;
                }
                self.upsert(
                    &id,
                    ToolPatch {
                        name: tool_name,
                        status: Some(ToolStatus::InputAvailable),
                        input: Some(input),
                        replace_input: true,
                        ..Default::default()
                    },
                );
            }

            ProtocolEvent::ToolCodeDelta {
                item_id,
                tool_call_id,
                delta,
                ..
            } => {
                let Some(id) = self.primary_id(item_id.as_deref(), tool_call_id.as_deref(), ts)
                else {
                    return;
                };
                let code = {
                    let buf = self.code_text.entry(id.clone()).or_default();
                    buf.push_str(&delta);
                    buf.clone()
                };
                self.upsert(
                    &id,
                    ToolPatch {
                        status: Some(ToolStatus::InputStreaming),
                        input: Some(json!({ "code": code })),
                        replace_input: true,
                        ..Default::default()
                    },
                );
            }

            ProtocolEvent::ToolCodeDone {
                item_id,
                tool_call_id,
                code,
                ..
            } => {
                let Some(id) = self.primary_id(item_id.as_deref(), tool_call_id.as_deref(), ts)
                else {
                    return;
                };
                let code = {
                    let buf = self.code_text.entry(id.clone()).or_default();
                    if let Some(code) = code {
                        *buf = code;
                    }
                    buf.clone()
                };
                self.upsert(
                    &id,
                    ToolPatch {
                        status: Some(ToolStatus::InputAvailable),
                        input: Some(json!({ "code": code })),
                        replace_input: true,
                        ..Default::default()
                    },
                );
            }

            ProtocolEvent::ToolOutput {
                item_id,
                tool_call_id,
                output,
                ..
            } => {
                let Some(id) = self.primary_id(item_id.as_deref(), tool_call_id.as_deref(), ts)
                else {
                    return;
                };
                self.upsert(
                    &id,
                    ToolPatch {
                        status: Some(ToolStatus::OutputAvailable),
                        output: Some(output),
                        replace_output: true,
                        ..Default::default()
                    },
                );
            }

            ProtocolEvent::ToolApproval {
                item_id,
                tool_call_id,
                approved,
                reason,
                approval_request_id,
                ..
            } => {
                let Some(id) = self.primary_id(item_id.as_deref(), tool_call_id.as_deref(), ts)
                else {
                    return;
                };
                let mut output = json!({ "approved": approved });
                if let Some(reason) = reason {
                    output["reason"] = json!(reason);
                }
                if let Some(request_id) = approval_request_id {
                    output["approval_request_id"] = json!(request_id);
                }
                self.upsert(
                    &id,
                    ToolPatch {
                        status: Some(ToolStatus::OutputAvailable),
                        output: Some(output),
                        replace_output: true,
                        ..Default::default()
                    },
                );
            }

            ProtocolEvent::OutputItemAdded {
                item_id,
                item_type,
                output_index,
                ..
            } => {
                self.note_seen_raw(&item_id, ts);
                self.ensure_placeholder_for_output_item(&item_id, &item_type, output_index);
            }

            ProtocolEvent::ChunkDelta {
                target,
                encoding,
                chunk_index,
                data,
                ..
            } => {
                self.note_seen_raw(&target.entity_id, ts);
                self.chunks
                    .apply_delta(&target, encoding.as_deref(), chunk_index, &data);
            }

            ProtocolEvent::ChunkDone { target, .. } => {
                self.finish_chunk(&target, ts);
            }

            ProtocolEvent::Error { message, reason, .. } => {
                warn!(
                    "stream error event: {} ({})",
                    message.as_deref().unwrap_or("unspecified"),
                    reason.as_deref().unwrap_or("no reason")
                );
            }

            ProtocolEvent::RawResponse { .. }
            | ProtocolEvent::Lifecycle { .. }
            | ProtocolEvent::AgentUpdate { .. }
            | ProtocolEvent::Usage { .. } => {
                debug!("passthrough event, no tool reduction");
            }

            ProtocolEvent::Unknown => {
                debug!("ignoring unknown event kind");
            }
        }
    }

    /// Materialize a placeholder row for an output item before any real tool
    /// event arrives, so the UI can show the slot immediately. Never
    /// overwrites an already-known `output_index`.
    pub fn ensure_placeholder_for_output_item(
        &mut self,
        item_id: &str,
        item_type: &str,
        output_index: Option<u64>,
    ) {
        let Some(tool_type) = placeholder_tool_type(item_type) else {
            debug!("output item type {} has no tool placeholder", item_type);
            return;
        };
        let id = self.identity.canonicalize(item_id);
        self.note_seen_raw(&id, None);
        // Function-family placeholders leave `name` unset: the real function
        // name arrives with the first arguments event and must be able to
        // land in the first-non-null slot.
        let name = (tool_type != "function").then(|| tool_type.to_string());
        self.upsert(
            &id,
            ToolPatch {
                name,
                output_index,
                status: Some(ToolStatus::InputStreaming),
                ..Default::default()
            },
        );
    }

    /// All tool states, sorted by `output_index` ascending with unindexed
    /// rows last, ties broken by insertion order. A fresh `Vec` per call.
    pub fn tools_sorted(&self) -> Snapshot {
        let rows = self
            .tools
            .iter()
            .map(|(id, row)| (self.seq.get(id).copied().unwrap_or(u64::MAX), row.clone()))
            .collect();
        snapshot::sorted(rows)
    }

    /// One tool's state, looked up through identity resolution.
    pub fn tool_by_id(&self, id: &str) -> Option<&ToolState> {
        self.tools.get(&self.identity.resolve(id))
    }

    /// Epoch-ms timestamp of the first event that referenced `id`.
    pub fn first_seen_ms(&self, id: &str) -> Option<i64> {
        self.first_seen.get(&self.identity.resolve(id)).copied()
    }

    // ------------------------------------------------------------------
    // internals

    /// Resolve the event's canonical id, binding item id to tool-call id
    /// when both are present (the tool-call id's root wins the merge).
    fn primary_id(
        &mut self,
        item_id: Option<&str>,
        tool_call_id: Option<&str>,
        ts: Option<i64>,
    ) -> Option<String> {
        let id = match (tool_call_id, item_id) {
            (Some(tc), Some(it)) => {
                self.bind(it, tc);
                self.identity.canonicalize(tc)
            }
            (Some(tc), None) => self.identity.canonicalize(tc),
            (None, Some(it)) => self.identity.canonicalize(it),
            (None, None) => return None,
        };
        self.note_seen_raw(&id, ts);
        Some(id)
    }

    /// Bind `alias` to `canonical`, migrating the tool record and every
    /// auxiliary buffer from the losing root to the winning one. The
    /// winner's existing values are preferred throughout.
    fn bind(&mut self, alias: &str, canonical: &str) {
        let Some((winner, loser)) = self.identity.bind_alias(alias, canonical) else {
            return;
        };
        debug!("merging tool identity {} into {}", loser, winner);

        if let Some(lost_row) = self.tools.remove(&loser) {
            match self.tools.get_mut(&winner) {
                Some(row) => row.absorb(lost_row),
                None => {
                    let mut row = lost_row;
                    row.id = winner.clone();
                    self.tools.insert(winner.clone(), row);
                }
            }
        }
        if let Some(text) = self.args_text.remove(&loser) {
            self.args_text.entry(winner.clone()).or_insert(text);
        }
        if let Some(code) = self.code_text.remove(&loser) {
            self.code_text.entry(winner.clone()).or_insert(code);
        }
        self.images.merge_ids(&winner, &loser);
        if let Some(seen) = self.first_seen.remove(&loser) {
            let entry = self.first_seen.entry(winner.clone()).or_insert(seen);
            *entry = (*entry).min(seen);
        }
        if let Some(seq) = self.seq.remove(&loser) {
            let entry = self.seq.entry(winner.clone()).or_insert(seq);
            *entry = (*entry).min(seq);
        }
    }

    fn note_seen_raw(&mut self, id: &str, ts: Option<i64>) {
        let id = self.identity.canonicalize(id);
        self.first_seen
            .entry(id)
            .or_insert_with(|| ts.unwrap_or_else(|| Utc::now().timestamp_millis()));
    }

    /// Load or default-construct the row for a canonical id, merge the patch
    /// into it, and hand the subscriber a fresh snapshot.
    fn upsert(&mut self, id: &str, patch: ToolPatch) {
        if !self.tools.contains_key(id) {
            let seq = self.next_seq;
            self.next_seq += 1;
            self.seq.insert(id.to_string(), seq);
            self.tools.insert(id.to_string(), ToolState::new(id));
        }
        if let Some(row) = self.tools.get_mut(id) {
            row.apply(patch);
        }
        let snapshot = self.tools_sorted();
        self.emitter.emit(snapshot);
    }

    /// Reduce a `tool.status` event: map the provider-native status onto the
    /// lattice and populate input/output with a shape appropriate for the
    /// tool type. Anything that is not a known provider-hosted type is
    /// treated as an MCP tool.
    fn reduce_status(
        &mut self,
        id: &str,
        tool_type: Option<&str>,
        tool_name: Option<&str>,
        server_label: Option<&str>,
        output_index: Option<u64>,
        payload: &StatusPayload,
    ) {
        let provider_status = classify_provider_status(&payload.status);
        let data = &payload.data;

        let name: Option<String>;
        let mut input: Option<Value> = None;
        let mut output: Option<Value> = None;

        match tool_type {
            Some("web_search") => {
                name = Some(tool_name.unwrap_or("web_search").to_string());
                if let Some(query) = get_str(data, &["query"]) {
                    input = Some(json!({ "query": query }));
                } else if let Some(action) = data.get("action") {
                    input = Some(action.clone());
                }
                if provider_status == ProviderStatus::Completed {
                    output = Some(
                        data.get("results")
                            .cloned()
                            .unwrap_or_else(|| json!({ "status": "completed" })),
                    );
                }
            }
            Some("file_search") => {
                name = Some(tool_name.unwrap_or("file_search").to_string());
                if let Some(queries) = data.get("queries") {
                    input = Some(json!({ "queries": queries }));
                } else if let Some(query) = get_str(data, &["query"]) {
                    input = Some(json!({ "queries": [query] }));
                }
                if provider_status == ProviderStatus::Completed {
                    output = Some(
                        data.get("results")
                            .cloned()
                            .unwrap_or_else(|| json!({ "status": "completed" })),
                    );
                }
            }
            Some("code_interpreter") => {
                name = Some(tool_name.unwrap_or("code_interpreter").to_string());
                let code = get_str(data, &["code"])
                    .map(str::to_string)
                    .or_else(|| self.code_text.get(id).cloned());
                if let Some(code) = code {
                    input = Some(json!({ "code": code }));
                }
                if provider_status == ProviderStatus::Completed {
                    output = Some(
                        data.get("outputs")
                            .or_else(|| data.get("results"))
                            .cloned()
                            .unwrap_or_else(|| json!({ "status": "completed" })),
                    );
                }
            }
            Some("image_generation") => {
                name = Some("image_generation".to_string());
                if let Some(format) = get_str(data, &["output_format", "format"]) {
                    self.images.set_format(id, format);
                }
                if let Some(prompt) = get_str(data, &["revised_prompt"]) {
                    self.images.set_revised_prompt(id, prompt);
                }
                if let Some(prompt) = get_str(data, &["prompt"]) {
                    input = Some(json!({ "prompt": prompt }));
                }
                if provider_status == ProviderStatus::Completed {
                    if self.images.has_frames(id) {
                        // The last partial frame is already the full image.
                        output = Some(self.images.frame_list(id));
                    } else if let Some(result) = get_str(data, &["result"]) {
                        let format = self.default_image_format.clone();
                        output = Some(self.images.push_frame(
                            id,
                            0,
                            Some("base64"),
                            result.to_string(),
                            &format,
                        ));
                    }
                }
            }
            Some("function") => {
                name = tool_name.map(str::to_string);
                input = arguments_input(data.get("arguments"), self.args_text.get(id));
                if provider_status == ProviderStatus::Completed {
                    output = data.get("output").or_else(|| data.get("result")).cloned();
                }
            }
            other => {
                // MCP (explicit "mcp" or any unrecognized type).
                name = match (server_label, tool_name) {
                    (Some(label), Some(tool)) => Some(format!("mcp__{}__{}", label, tool)),
                    (_, Some(tool)) => Some(tool.to_string()),
                    _ => other.map(str::to_string),
                };
                input = arguments_input(data.get("arguments"), self.args_text.get(id));
                if provider_status == ProviderStatus::Completed {
                    output = data.get("output").or_else(|| data.get("result")).cloned();
                }
            }
        }

        let (status, error_text) = match provider_status {
            ProviderStatus::Completed => (ToolStatus::OutputAvailable, None),
            ProviderStatus::Failed => {
                let error = get_str(data, &["error"])
                    .map(str::to_string)
                    .or_else(|| data.get("error").map(|v| v.to_string()))
                    .unwrap_or_else(|| format!("tool reported status `{}`", payload.status));
                (ToolStatus::OutputError, Some(error))
            }
            ProviderStatus::Working => {
                if input.is_some() {
                    (ToolStatus::InputAvailable, None)
                } else {
                    (ToolStatus::InputStreaming, None)
                }
            }
        };

        let replace_output = output.is_some();
        self.upsert(
            id,
            ToolPatch {
                name,
                output_index,
                status: Some(status),
                input,
                output,
                error_text,
                replace_input: true,
                replace_output,
            },
        );
    }

    /// Route a completed chunk. Only `partial_image_b64` on a tool call has
    /// a consumer today; other fields are consumed and dropped so a future
    /// producer cannot leak accumulators.
    fn finish_chunk(&mut self, target: &ChunkTarget, ts: Option<i64>) {
        let Some(chunk) = self.chunks.take(target) else {
            return;
        };
        if target.entity_kind == "tool_call" && target.field == "partial_image_b64" {
            let id = self.identity.canonicalize(&target.entity_id);
            self.note_seen_raw(&id, ts);
            let part = target.part_index.unwrap_or(0);
            let format = self.default_image_format.clone();
            let frames =
                self.images
                    .push_frame(&id, part, chunk.encoding.as_deref(), chunk.data, &format);
            self.upsert(
                &id,
                ToolPatch {
                    name: Some("image_generation".to_string()),
                    status: Some(ToolStatus::OutputAvailable),
                    output: Some(frames),
                    replace_output: true,
                    ..Default::default()
                },
            );
        } else {
            debug!(
                "completed chunk for unrouted field {}/{} dropped",
                target.entity_kind, target.field
            );
        }
    }
}

impl Default for TraceSession {
    fn default() -> Self {
        Self::new(&Config::default())
    }
}

/// First string value among `keys`.
fn get_str<'a>(data: &'a HashMap<String, Value>, keys: &[&str]) -> Option<&'a str> {
    keys.iter().find_map(|key| data.get(*key)?.as_str())
}

/// Build the `{arguments_text, arguments_json}` input shape from a raw
/// payload field or the accumulated delta buffer.
fn arguments_input(raw: Option<&Value>, accumulated: Option<&String>) -> Option<Value> {
    let text = match raw {
        Some(Value::String(s)) => Some(s.clone()),
        Some(Value::Null) | None => accumulated.cloned().filter(|t| !t.is_empty()),
        Some(other) => return Some(json!({ "arguments_json": other.clone() })),
    }?;
    let mut input = json!({ "arguments_text": text });
    if let Ok(parsed) = serde_json::from_str::<Value>(&text) {
        if !parsed.is_null() {
            input["arguments_json"] = parsed;
        }
    }
    Some(input)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> TraceSession {
        TraceSession::default()
    }

    fn apply_json(session: &mut TraceSession, event: Value) {
        session.apply(serde_json::from_value(event).expect("valid test event"));
    }

    fn image_part(session: &mut TraceSession, tool_call_id: &str, part: u64, data: &str) {
        apply_json(
            session,
            json!({
                "kind": "chunk.delta",
                "target": {
                    "entity_kind": "tool_call",
                    "entity_id": tool_call_id,
                    "field": "partial_image_b64",
                    "part_index": part
                },
                "encoding": "base64",
                "chunk_index": 0,
                "data": data
            }),
        );
        apply_json(
            session,
            json!({
                "kind": "chunk.done",
                "target": {
                    "entity_kind": "tool_call",
                    "entity_id": tool_call_id,
                    "field": "partial_image_b64",
                    "part_index": part
                }
            }),
        );
    }

    #[test]
    fn test_simple_function_call_scenario() {
        let mut session = session();

        apply_json(
            &mut session,
            json!({
                "kind": "output_item.added",
                "item_id": "it1",
                "item_type": "function_call",
                "output_index": 0
            }),
        );
        let row = session.tool_by_id("it1").expect("placeholder row");
        assert_eq!(row.id, "it1");
        assert_eq!(row.status, ToolStatus::InputStreaming);
        assert_eq!(row.output_index, Some(0));
        assert_eq!(row.name, None);

        apply_json(
            &mut session,
            json!({
                "kind": "tool.arguments.delta",
                "item_id": "it1",
                "tool_call_id": "tc1",
                "tool_name": "lookup",
                "delta": "{\"q\":"
            }),
        );
        let tools = session.tools_sorted();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].id, "tc1");
        assert_eq!(tools[0].name.as_deref(), Some("lookup"));
        assert_eq!(tools[0].output_index, Some(0));
        assert_eq!(
            tools[0].input.as_ref().unwrap()["arguments_text"],
            "{\"q\":"
        );

        apply_json(
            &mut session,
            json!({
                "kind": "tool.arguments.done",
                "item_id": "it1",
                "tool_call_id": "tc1",
                "tool_name": "lookup",
                "arguments_text": "{\"q\":\"x\"}",
                "arguments_json": {"q": "x"}
            }),
        );
        let row = session.tool_by_id("tc1").unwrap();
        assert_eq!(row.status, ToolStatus::InputAvailable);
        assert_eq!(row.input.as_ref().unwrap()["arguments_json"]["q"], "x");

        apply_json(
            &mut session,
            json!({
                "kind": "tool.output",
                "tool_call_id": "tc1",
                "output": {"result": 42}
            }),
        );
        let row = session.tool_by_id("it1").expect("resolvable via old id");
        assert_eq!(row.status, ToolStatus::OutputAvailable);
        assert_eq!(row.output.as_ref().unwrap()["result"], 42);
    }

    #[test]
    fn test_progressive_image_scenario() {
        let mut session = session();
        for part in 0..3u64 {
            image_part(&mut session, "img1", part, "QUFB");
        }
        let row = session.tool_by_id("img1").unwrap();
        assert_eq!(row.name.as_deref(), Some("image_generation"));
        assert_eq!(row.status, ToolStatus::OutputAvailable);
        let frames = row.output.as_ref().unwrap().as_array().unwrap();
        assert_eq!(frames.len(), 3);
    }

    #[test]
    fn test_image_parts_out_of_order_end_up_sorted() {
        let mut session = session();
        for part in [2u64, 0, 1] {
            image_part(&mut session, "img1", part, "QUFB");
        }
        let row = session.tool_by_id("img1").unwrap();
        let frames = row.output.as_ref().unwrap().as_array().unwrap();
        let indices: Vec<u64> = frames
            .iter()
            .map(|f| f["output_index"].as_u64().unwrap())
            .collect();
        assert_eq!(indices, [0, 1, 2]);
    }

    #[test]
    fn test_state_accumulated_before_alias_survives_the_bind() {
        let mut session = session();
        // Arguments stream in under the item id only.
        apply_json(
            &mut session,
            json!({
                "kind": "tool.arguments.delta",
                "item_id": "it9",
                "delta": "{\"city\":"
            }),
        );
        assert!(session.tool_by_id("it9").is_some());

        // The stable tool-call id appears later; both must converge.
        apply_json(
            &mut session,
            json!({
                "kind": "tool.arguments.done",
                "item_id": "it9",
                "tool_call_id": "tc9",
                "arguments_text": "{\"city\":\"Oslo\"}"
            }),
        );
        let tools = session.tools_sorted();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].id, "tc9");
        assert_eq!(
            tools[0].input.as_ref().unwrap()["arguments_json"]["city"],
            "Oslo"
        );
        assert!(session.tool_by_id("it9").is_some());
    }

    #[test]
    fn test_status_never_regresses() {
        let mut session = session();
        apply_json(
            &mut session,
            json!({
                "kind": "tool.output",
                "tool_call_id": "tc1",
                "output": {"done": true}
            }),
        );
        apply_json(
            &mut session,
            json!({
                "kind": "tool.status",
                "tool_call_id": "tc1",
                "tool_type": "web_search",
                "tool": {"status": "in_progress"}
            }),
        );
        assert_eq!(
            session.tool_by_id("tc1").unwrap().status,
            ToolStatus::OutputAvailable
        );
    }

    #[test]
    fn test_web_search_status_shapes() {
        let mut session = session();
        apply_json(
            &mut session,
            json!({
                "kind": "tool.status",
                "tool_call_id": "ws1",
                "tool_type": "web_search",
                "tool": {"status": "searching", "query": "rust sse parser"}
            }),
        );
        let row = session.tool_by_id("ws1").unwrap();
        assert_eq!(row.status, ToolStatus::InputAvailable);
        assert_eq!(row.input.as_ref().unwrap()["query"], "rust sse parser");

        apply_json(
            &mut session,
            json!({
                "kind": "tool.status",
                "tool_call_id": "ws1",
                "tool_type": "web_search",
                "tool": {
                    "status": "completed",
                    "query": "rust sse parser",
                    "results": [{"url": "https://example.com"}]
                }
            }),
        );
        let row = session.tool_by_id("ws1").unwrap();
        assert_eq!(row.status, ToolStatus::OutputAvailable);
        assert_eq!(
            row.output.as_ref().unwrap()[0]["url"],
            "https://example.com"
        );
    }

    #[test]
    fn test_failed_provider_status_sets_error_text() {
        let mut session = session();
        apply_json(
            &mut session,
            json!({
                "kind": "tool.status",
                "tool_call_id": "ws1",
                "tool_type": "web_search",
                "tool": {"status": "failed", "error": "quota exceeded"}
            }),
        );
        let row = session.tool_by_id("ws1").unwrap();
        assert_eq!(row.status, ToolStatus::OutputError);
        assert_eq!(row.error_text.as_deref(), Some("quota exceeded"));
    }

    #[test]
    fn test_mcp_tools_get_composite_names() {
        let mut session = session();
        apply_json(
            &mut session,
            json!({
                "kind": "tool.status",
                "tool_call_id": "mc1",
                "tool_type": "mcp",
                "tool_name": "restart",
                "server_label": "deploy",
                "tool": {"status": "in_progress", "arguments": "{\"service\":\"api\"}"}
            }),
        );
        let row = session.tool_by_id("mc1").unwrap();
        assert_eq!(row.name.as_deref(), Some("mcp__deploy__restart"));
        assert_eq!(row.status, ToolStatus::InputAvailable);
        assert_eq!(
            row.input.as_ref().unwrap()["arguments_json"]["service"],
            "api"
        );
    }

    #[test]
    fn test_placeholder_does_not_clobber_known_output_index() {
        let mut session = session();
        apply_json(
            &mut session,
            json!({
                "kind": "tool.status",
                "item_id": "it3",
                "output_index": 5,
                "tool_type": "web_search",
                "tool": {"status": "in_progress"}
            }),
        );
        session.ensure_placeholder_for_output_item("it3", "web_search_call", Some(2));
        assert_eq!(session.tool_by_id("it3").unwrap().output_index, Some(5));
    }

    #[test]
    fn test_unknown_item_type_creates_no_row() {
        let mut session = session();
        session.ensure_placeholder_for_output_item("it1", "reasoning", Some(0));
        assert!(session.tools_sorted().is_empty());
    }

    #[test]
    fn test_passthrough_and_unknown_kinds_touch_nothing() {
        let mut session = session();
        let mut rx = session.subscribe();
        for event in [
            json!({"kind": "usage", "input_tokens": 12}),
            json!({"kind": "lifecycle", "phase": "turn.started"}),
            json!({"kind": "error", "message": "upstream hiccup"}),
            json!({"kind": "future.kind", "whatever": true}),
        ] {
            apply_json(&mut session, event);
        }
        assert!(session.tools_sorted().is_empty());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_one_snapshot_per_tool_mutation() {
        let mut session = session();
        let mut rx = session.subscribe();

        apply_json(
            &mut session,
            json!({
                "kind": "output_item.added",
                "item_id": "it1",
                "item_type": "image_generation_call",
                "output_index": 0
            }),
        );
        // Chunk deltas only touch an accumulator: no snapshot.
        apply_json(
            &mut session,
            json!({
                "kind": "chunk.delta",
                "target": {
                    "entity_kind": "tool_call",
                    "entity_id": "it1",
                    "field": "partial_image_b64",
                    "part_index": 0
                },
                "encoding": "base64",
                "data": "QUFB"
            }),
        );
        apply_json(
            &mut session,
            json!({
                "kind": "chunk.done",
                "target": {
                    "entity_kind": "tool_call",
                    "entity_id": "it1",
                    "field": "partial_image_b64",
                    "part_index": 0
                }
            }),
        );

        assert_eq!(rx.try_recv().unwrap().len(), 1); // placeholder
        let after_image = rx.try_recv().unwrap(); // completed frame
        assert_eq!(after_image[0].status, ToolStatus::OutputAvailable);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_duplicate_chunk_done_is_silent() {
        let mut session = session();
        image_part(&mut session, "img1", 0, "QUFB");
        let before = session.tools_sorted();
        apply_json(
            &mut session,
            json!({
                "kind": "chunk.done",
                "target": {
                    "entity_kind": "tool_call",
                    "entity_id": "img1",
                    "field": "partial_image_b64",
                    "part_index": 0
                }
            }),
        );
        assert_eq!(session.tools_sorted(), before);
    }

    #[test]
    fn test_approval_records_structured_output() {
        let mut session = session();
        apply_json(
            &mut session,
            json!({
                "kind": "tool.approval",
                "tool_call_id": "tc1",
                "approved": false,
                "reason": "touches production",
                "approval_request_id": "req-7"
            }),
        );
        let row = session.tool_by_id("tc1").unwrap();
        assert_eq!(row.status, ToolStatus::OutputAvailable);
        let output = row.output.as_ref().unwrap();
        assert_eq!(output["approved"], false);
        assert_eq!(output["reason"], "touches production");
        assert_eq!(output["approval_request_id"], "req-7");
    }

    #[test]
    fn test_code_interpreter_accumulates_source() {
        let mut session = session();
        apply_json(
            &mut session,
            json!({
                "kind": "tool.code.delta",
                "tool_call_id": "ci1",
                "delta": "import csv\n"
            }),
        );
        apply_json(
            &mut session,
            json!({
                "kind": "tool.code.delta",
                "tool_call_id": "ci1",
                "delta": "print(42)"
            }),
        );
        apply_json(
            &mut session,
            json!({"kind": "tool.code.done", "tool_call_id": "ci1"}),
        );
        let row = session.tool_by_id("ci1").unwrap();
        assert_eq!(row.status, ToolStatus::InputAvailable);
        assert_eq!(
            row.input.as_ref().unwrap()["code"],
            "import csv\nprint(42)"
        );
    }

    #[test]
    fn test_first_seen_uses_earliest_reference_across_merge() {
        let mut session = session();
        apply_json(
            &mut session,
            json!({
                "kind": "tool.arguments.delta",
                "item_id": "it1",
                "server_timestamp": 1000,
                "delta": "{"
            }),
        );
        apply_json(
            &mut session,
            json!({
                "kind": "tool.arguments.done",
                "item_id": "it1",
                "tool_call_id": "tc1",
                "server_timestamp": 2000,
                "arguments_text": "{}"
            }),
        );
        assert_eq!(session.first_seen_ms("tc1"), Some(1000));
        assert_eq!(session.first_seen_ms("it1"), Some(1000));
    }

    #[test]
    fn test_snapshot_ordering_indexed_then_insertion() {
        let mut session = session();
        apply_json(
            &mut session,
            json!({
                "kind": "tool.arguments.delta",
                "tool_call_id": "unindexed",
                "delta": "{}"
            }),
        );
        apply_json(
            &mut session,
            json!({
                "kind": "output_item.added",
                "item_id": "second",
                "item_type": "web_search_call",
                "output_index": 1
            }),
        );
        apply_json(
            &mut session,
            json!({
                "kind": "output_item.added",
                "item_id": "first",
                "item_type": "web_search_call",
                "output_index": 0
            }),
        );
        let ids: Vec<String> = session
            .tools_sorted()
            .into_iter()
            .map(|row| row.id)
            .collect();
        assert_eq!(ids, ["first", "second", "unindexed"]);
    }

    #[tokio::test]
    async fn test_consume_drives_the_full_pipeline() {
        let events = [
            r#"{"kind":"output_item.added","item_id":"it1","item_type":"web_search_call","output_index":0}"#,
            r#"{"kind":"tool.status","item_id":"it1","tool_call_id":"ws1","tool_type":"web_search","tool":{"status":"completed","query":"rust","results":[]}}"#,
            "{broken json",
            r#"{"kind":"usage","output_tokens":9}"#,
        ];
        let text: String = events.iter().map(|e| format!("data: {}\n\n", e)).collect();
        let chunks: Vec<Bytes> = text
            .as_bytes()
            .chunks(7)
            .map(Bytes::copy_from_slice)
            .collect();

        let mut session = TraceSession::default();
        session
            .consume(futures::stream::iter(chunks), CancellationToken::new())
            .await;

        let tools = session.tools_sorted();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].id, "ws1");
        assert_eq!(tools[0].status, ToolStatus::OutputAvailable);
        assert_eq!(tools[0].output_index, Some(0));
    }
}
