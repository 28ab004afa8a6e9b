//! Per-tool state and the status lattice.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Lifecycle status of one tool call, ordered by completeness.
///
/// The declaration order is the lattice rank: merges may only move rightward.
/// `OutputError` sits above `OutputAvailable` so a terminal failure reported
/// after partial output still surfaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ToolStatus {
    InputStreaming,
    InputAvailable,
    OutputAvailable,
    OutputError,
}

impl ToolStatus {
    /// Lattice join: never regress to a less complete status.
    pub fn upgrade(self, incoming: ToolStatus) -> ToolStatus {
        self.max(incoming)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ToolStatus::OutputAvailable | ToolStatus::OutputError)
    }
}

impl std::fmt::Display for ToolStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ToolStatus::InputStreaming => "input-streaming",
            ToolStatus::InputAvailable => "input-available",
            ToolStatus::OutputAvailable => "output-available",
            ToolStatus::OutputError => "output-error",
        };
        write!(f, "{}", s)
    }
}

/// Classification of a provider-native status string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderStatus {
    /// Still producing input or executing.
    Working,
    /// Finished successfully.
    Completed,
    /// Finished unsuccessfully (`failed`, `incomplete`).
    Failed,
}

/// Map a provider-native status string onto the three classes the reducer
/// cares about. Unrecognized statuses behave like the pre-output group.
pub fn classify_provider_status(status: &str) -> ProviderStatus {
    match status {
        "completed" => ProviderStatus::Completed,
        "failed" | "incomplete" => ProviderStatus::Failed,
        _ => ProviderStatus::Working,
    }
}

/// Snapshot row for one tool call, keyed by its canonical id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolState {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_index: Option<u64>,
    pub status: ToolStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_text: Option<String>,
}

impl ToolState {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
            output_index: None,
            status: ToolStatus::InputStreaming,
            input: None,
            output: None,
            error_text: None,
        }
    }

    /// Merge the patch field-by-field: first non-null wins unless the patch
    /// explicitly overrides; status always goes through the lattice.
    pub fn apply(&mut self, patch: ToolPatch) {
        if self.name.is_none() {
            self.name = patch.name;
        }
        if self.output_index.is_none() {
            self.output_index = patch.output_index;
        }
        if patch.input.is_some() && (patch.replace_input || self.input.is_none()) {
            self.input = patch.input;
        }
        if patch.output.is_some() && (patch.replace_output || self.output.is_none()) {
            self.output = patch.output;
        }
        if self.error_text.is_none() {
            self.error_text = patch.error_text;
        }
        if let Some(status) = patch.status {
            self.status = self.status.upgrade(status);
        }
    }

    /// Fold another record for the same logical call into this one, keeping
    /// this record's fields where both are present. Used on alias merges,
    /// where `self` belongs to the winning canonical id.
    pub fn absorb(&mut self, other: ToolState) {
        if self.name.is_none() {
            self.name = other.name;
        }
        if self.output_index.is_none() {
            self.output_index = other.output_index;
        }
        if self.input.is_none() {
            self.input = other.input;
        }
        if self.output.is_none() {
            self.output = other.output;
        }
        if self.error_text.is_none() {
            self.error_text = other.error_text;
        }
        self.status = self.status.upgrade(other.status);
    }
}

/// One reduction step's effect on a tool record.
#[derive(Debug, Default, Clone)]
pub struct ToolPatch {
    pub name: Option<String>,
    pub output_index: Option<u64>,
    pub status: Option<ToolStatus>,
    pub input: Option<Value>,
    pub output: Option<Value>,
    pub error_text: Option<String>,
    /// Accumulating fields (argument/code text, frame lists) rewrite their
    /// slot on every step instead of first-wins.
    pub replace_input: bool,
    pub replace_output: bool,
}
