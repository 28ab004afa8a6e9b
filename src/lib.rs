//! # toolscope
//!
//! Live reconstruction of AI agent tool activity from SSE execution traces.
//!
//! A backend streams an agent's execution trace as server-sent events: text
//! deltas, tool invocations, multi-part image payloads. toolscope reduces
//! that stream into a single, stable, monotonically-advancing snapshot of
//! what every tool is doing right now, tolerating out-of-order delivery,
//! transient identifiers, and partial chunks along the way.
//!
//! ## Pipeline
//!
//! ```text
//! bytes ──▶ sse::frames ──▶ protocol::decode_frame ──▶ TraceSession::apply
//!                                                            │
//!                                              sorted tool snapshots ──▶ subscriber
//! ```
//!
//! Data flows one direction only; no component calls back upstream. The
//! reducer is synchronous per event and replayable: feeding the same event
//! sequence always produces the same snapshots.
//!
//! ## Modules
//! - `sse`: incremental SSE framing and the cancellable frame stream
//! - `protocol`: the wire event union and its never-failing decoder
//! - `engine`: identity resolution, chunk reassembly, tool-state reduction
//! - `config`: environment-based configuration

pub mod config;
pub mod engine;
pub mod protocol;
pub mod sse;

pub use config::{Config, ConfigError};
pub use engine::snapshot::Snapshot;
pub use engine::state::{ToolState, ToolStatus};
pub use engine::TraceSession;
pub use protocol::{decode_frame, ChunkTarget, ProtocolEvent};
pub use sse::{frames, FrameParser, SseFrame};
