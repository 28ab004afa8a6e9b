//! Wire protocol for agent execution traces.
//!
//! Each dispatched SSE frame carries one JSON object with a required `kind`
//! discriminator. The set of kinds is closed; anything else decodes to
//! [`ProtocolEvent::Unknown`] and is ignored downstream. Malformed JSON
//! degrades to an `error`-kind event carrying the raw text; decoding never
//! fails outright.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use tracing::warn;

use crate::sse::SseFrame;

/// Key of one chunked payload stream: which entity, which field of it, and
/// (for multi-part payloads) which part.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChunkTarget {
    pub entity_kind: String,
    pub entity_id: String,
    pub field: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub part_index: Option<u64>,
}

/// The `tool` sub-object of a `tool.status` event: a provider-native status
/// string plus whatever type-specific fields the provider attached.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusPayload {
    pub status: String,
    #[serde(flatten)]
    pub data: HashMap<String, Value>,
}

/// Decoded trace events, discriminated by `kind`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum ProtocolEvent {
    #[serde(rename = "tool.status")]
    ToolStatus {
        #[serde(default)]
        item_id: Option<String>,
        #[serde(default)]
        tool_call_id: Option<String>,
        #[serde(default)]
        output_index: Option<u64>,
        #[serde(default)]
        server_timestamp: Option<i64>,
        #[serde(default)]
        tool_name: Option<String>,
        #[serde(default)]
        tool_type: Option<String>,
        #[serde(default)]
        server_label: Option<String>,
        tool: StatusPayload,
    },

    #[serde(rename = "tool.arguments.delta")]
    ToolArgumentsDelta {
        #[serde(default)]
        item_id: Option<String>,
        #[serde(default)]
        tool_call_id: Option<String>,
        #[serde(default)]
        server_timestamp: Option<i64>,
        #[serde(default)]
        tool_name: Option<String>,
        delta: String,
    },

    #[serde(rename = "tool.arguments.done")]
    ToolArgumentsDone {
        #[serde(default)]
        item_id: Option<String>,
        #[serde(default)]
        tool_call_id: Option<String>,
        #[serde(default)]
        server_timestamp: Option<i64>,
        #[serde(default)]
        tool_name: Option<String>,
        #[serde(default)]
        arguments_text: Option<String>,
        #[serde(default)]
        arguments_json: Option<Value>,
    },

    #[serde(rename = "tool.code.delta")]
    ToolCodeDelta {
        #[serde(default)]
        item_id: Option<String>,
        #[serde(default)]
        tool_call_id: Option<String>,
        #[serde(default)]
        server_timestamp: Option<i64>,
        delta: String,
    },

    #[serde(rename = "tool.code.done")]
    ToolCodeDone {
        #[serde(default)]
        item_id: Option<String>,
        #[serde(default)]
        tool_call_id: Option<String>,
        #[serde(default)]
        server_timestamp: Option<i64>,
        #[serde(default)]
        code: Option<String>,
    },

    #[serde(rename = "tool.output")]
    ToolOutput {
        #[serde(default)]
        item_id: Option<String>,
        #[serde(default)]
        tool_call_id: Option<String>,
        #[serde(default)]
        server_timestamp: Option<i64>,
        output: Value,
    },

    #[serde(rename = "tool.approval")]
    ToolApproval {
        #[serde(default)]
        item_id: Option<String>,
        #[serde(default)]
        tool_call_id: Option<String>,
        #[serde(default)]
        server_timestamp: Option<i64>,
        approved: bool,
        #[serde(default)]
        reason: Option<String>,
        #[serde(default)]
        approval_request_id: Option<String>,
    },

    #[serde(rename = "chunk.delta")]
    ChunkDelta {
        target: ChunkTarget,
        #[serde(default)]
        encoding: Option<String>,
        #[serde(default)]
        chunk_index: Option<u64>,
        #[serde(default)]
        server_timestamp: Option<i64>,
        data: String,
    },

    #[serde(rename = "chunk.done")]
    ChunkDone {
        target: ChunkTarget,
        #[serde(default)]
        server_timestamp: Option<i64>,
    },

    #[serde(rename = "output_item.added")]
    OutputItemAdded {
        item_id: String,
        item_type: String,
        #[serde(default)]
        output_index: Option<u64>,
        #[serde(default)]
        server_timestamp: Option<i64>,
    },

    // Passthrough kinds: carried for observability, bypass tool reduction.
    #[serde(rename = "raw_response")]
    RawResponse {
        #[serde(flatten)]
        data: HashMap<String, Value>,
    },

    #[serde(rename = "lifecycle")]
    Lifecycle {
        #[serde(flatten)]
        data: HashMap<String, Value>,
    },

    #[serde(rename = "agent_update")]
    AgentUpdate {
        #[serde(flatten)]
        data: HashMap<String, Value>,
    },

    #[serde(rename = "usage")]
    Usage {
        #[serde(flatten)]
        data: HashMap<String, Value>,
    },

    #[serde(rename = "error")]
    Error {
        #[serde(default)]
        message: Option<String>,
        #[serde(default)]
        reason: Option<String>,
        #[serde(default)]
        raw: Option<String>,
    },

    // Catch-all for unknown kinds; forward-compatible.
    #[serde(other)]
    Unknown,
}

impl ProtocolEvent {
    /// Server timestamp in epoch milliseconds, if the event carried one.
    pub fn server_timestamp(&self) -> Option<i64> {
        match self {
            ProtocolEvent::ToolStatus { server_timestamp, .. }
            | ProtocolEvent::ToolArgumentsDelta { server_timestamp, .. }
            | ProtocolEvent::ToolArgumentsDone { server_timestamp, .. }
            | ProtocolEvent::ToolCodeDelta { server_timestamp, .. }
            | ProtocolEvent::ToolCodeDone { server_timestamp, .. }
            | ProtocolEvent::ToolOutput { server_timestamp, .. }
            | ProtocolEvent::ToolApproval { server_timestamp, .. }
            | ProtocolEvent::ChunkDelta { server_timestamp, .. }
            | ProtocolEvent::ChunkDone { server_timestamp, .. }
            | ProtocolEvent::OutputItemAdded { server_timestamp, .. } => *server_timestamp,
            _ => None,
        }
    }

    /// True for kinds that never touch tool state.
    pub fn is_passthrough(&self) -> bool {
        matches!(
            self,
            ProtocolEvent::RawResponse { .. }
                | ProtocolEvent::Lifecycle { .. }
                | ProtocolEvent::AgentUpdate { .. }
                | ProtocolEvent::Usage { .. }
                | ProtocolEvent::Error { .. }
        )
    }
}

/// Decode a frame's data into a [`ProtocolEvent`].
///
/// Malformed payloads are surfaced as an `error`-kind event rather than an
/// `Err`, so a bad frame never terminates the stream.
pub fn decode_frame(frame: &SseFrame) -> ProtocolEvent {
    match serde_json::from_str::<ProtocolEvent>(&frame.data) {
        Ok(event) => event,
        Err(e) => {
            warn!(
                "failed to decode stream event: {} - data: {}",
                e,
                if frame.data.len() > 200 {
                    format!("{}...", frame.data.chars().take(200).collect::<String>())
                } else {
                    frame.data.clone()
                }
            );
            ProtocolEvent::Error {
                message: Some(format!("malformed event payload: {}", e)),
                reason: Some("decode_failure".to_string()),
                raw: Some(frame.data.clone()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(data: &str) -> SseFrame {
        SseFrame {
            data: data.to_string(),
            event: None,
            id: None,
            retry: None,
        }
    }

    #[test]
    fn test_decode_tool_status() {
        let event = decode_frame(&frame(
            r#"{"kind":"tool.status","tool_call_id":"tc1","tool_type":"web_search","tool":{"status":"searching","query":"rust sse"}}"#,
        ));
        match event {
            ProtocolEvent::ToolStatus {
                tool_call_id,
                tool_type,
                tool,
                ..
            } => {
                assert_eq!(tool_call_id.as_deref(), Some("tc1"));
                assert_eq!(tool_type.as_deref(), Some("web_search"));
                assert_eq!(tool.status, "searching");
                assert_eq!(tool.data["query"], "rust sse");
            }
            other => panic!("expected ToolStatus, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_chunk_delta_with_target() {
        let event = decode_frame(&frame(
            r#"{"kind":"chunk.delta","target":{"entity_kind":"tool_call","entity_id":"tc1","field":"partial_image_b64","part_index":2},"encoding":"base64","chunk_index":0,"data":"aGVsbG8="}"#,
        ));
        match event {
            ProtocolEvent::ChunkDelta {
                target,
                encoding,
                chunk_index,
                data,
                ..
            } => {
                assert_eq!(target.part_index, Some(2));
                assert_eq!(encoding.as_deref(), Some("base64"));
                assert_eq!(chunk_index, Some(0));
                assert_eq!(data, "aGVsbG8=");
            }
            other => panic!("expected ChunkDelta, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_output_item_added() {
        let event = decode_frame(&frame(
            r#"{"kind":"output_item.added","item_id":"it1","item_type":"function_call","output_index":0}"#,
        ));
        match event {
            ProtocolEvent::OutputItemAdded {
                item_id,
                item_type,
                output_index,
                ..
            } => {
                assert_eq!(item_id, "it1");
                assert_eq!(item_type, "function_call");
                assert_eq!(output_index, Some(0));
            }
            other => panic!("expected OutputItemAdded, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_kind_is_tolerated() {
        let event = decode_frame(&frame(r#"{"kind":"telemetry.v2","payload":{}}"#));
        assert!(matches!(event, ProtocolEvent::Unknown));
    }

    #[test]
    fn test_malformed_json_degrades_to_error_event() {
        let event = decode_frame(&frame("{not json"));
        match event {
            ProtocolEvent::Error { reason, raw, .. } => {
                assert_eq!(reason.as_deref(), Some("decode_failure"));
                assert_eq!(raw.as_deref(), Some("{not json"));
            }
            other => panic!("expected Error, got {:?}", other),
        }
    }

    #[test]
    fn test_passthrough_kinds() {
        for data in [
            r#"{"kind":"raw_response","data":{}}"#,
            r#"{"kind":"lifecycle","phase":"turn.started"}"#,
            r#"{"kind":"agent_update","name":"researcher"}"#,
            r#"{"kind":"usage","input_tokens":10}"#,
            r#"{"kind":"error","message":"boom"}"#,
        ] {
            assert!(decode_frame(&frame(data)).is_passthrough(), "{}", data);
        }
        assert!(!decode_frame(&frame(
            r#"{"kind":"tool.output","tool_call_id":"t","output":1}"#
        ))
        .is_passthrough());
    }
}
