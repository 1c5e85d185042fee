//! Tool invocation parts.
//!
//! A tool call reaches the server as a stream of parts sharing a `call_id`:
//! one carrying the input, later ones carrying output or an error, often
//! duplicated by retries. The same [`ToolPart`] shape is used for a single
//! fragment and for the canonical record that merging produces.
//!
//! ## ToolKind
//!
//! Each tool the assistant knows has its own variant. Untyped (dynamic) calls
//! carry an optional name, and anything unrecognized is kept verbatim in
//! [`ToolKind::Unknown`] so it survives persistence unchanged.

use std::borrow::Cow;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum::EnumString;

/// Which tool a part belongs to.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ToolKind {
    ReadRange,
    UpdateCell,
    ExplainFormula,
    /// The user-facing confirmation prompt; its output is a grant.
    ConfirmAction,
    DeleteThread,
    SendInvites,
    /// An untyped call whose name may arrive in a later fragment.
    Dynamic { name: Option<String> },
    Unknown(String),
}

impl ToolKind {
    /// Wire form: `readRange`, `dynamic`, `dynamic:<name>`, or the raw string.
    pub fn as_type_str(&self) -> Cow<'_, str> {
        match self {
            ToolKind::ReadRange => Cow::Borrowed("readRange"),
            ToolKind::UpdateCell => Cow::Borrowed("updateCell"),
            ToolKind::ExplainFormula => Cow::Borrowed("explainFormula"),
            ToolKind::ConfirmAction => Cow::Borrowed("confirmAction"),
            ToolKind::DeleteThread => Cow::Borrowed("deleteThread"),
            ToolKind::SendInvites => Cow::Borrowed("sendInvites"),
            ToolKind::Dynamic { name: None } => Cow::Borrowed("dynamic"),
            ToolKind::Dynamic { name: Some(name) } => Cow::Owned(format!("dynamic:{name}")),
            ToolKind::Unknown(raw) => Cow::Borrowed(raw),
        }
    }

    pub fn from_type_str(s: &str) -> Self {
        match s {
            "readRange" => ToolKind::ReadRange,
            "updateCell" => ToolKind::UpdateCell,
            "explainFormula" => ToolKind::ExplainFormula,
            "confirmAction" => ToolKind::ConfirmAction,
            "deleteThread" => ToolKind::DeleteThread,
            "sendInvites" => ToolKind::SendInvites,
            "dynamic" => ToolKind::Dynamic { name: None },
            other => match other.strip_prefix("dynamic:") {
                Some(name) if !name.is_empty() => ToolKind::Dynamic {
                    name: Some(name.to_string()),
                },
                _ => ToolKind::Unknown(other.to_string()),
            },
        }
    }

    /// Tools that change state outside the conversation and need a grant.
    pub fn is_mutating(&self) -> bool {
        matches!(
            self,
            ToolKind::UpdateCell | ToolKind::DeleteThread | ToolKind::SendInvites
        )
    }

    pub fn is_dynamic(&self) -> bool {
        matches!(self, ToolKind::Dynamic { .. })
    }
}

impl fmt::Display for ToolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_type_str())
    }
}

impl From<String> for ToolKind {
    fn from(s: String) -> Self {
        ToolKind::from_type_str(&s)
    }
}

impl From<ToolKind> for String {
    fn from(kind: ToolKind) -> Self {
        kind.as_type_str().into_owned()
    }
}

/// Lifecycle state of a tool call.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Default, EnumString)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case", ascii_case_insensitive)]
pub enum ToolState {
    InputStreaming,
    #[default]
    InputAvailable,
    ApprovalRequested,
    ApprovalResponded,
    OutputStreaming,
    OutputAvailable,
    #[strum(serialize = "output-denied", serialize = "denied")]
    OutputDenied,
    #[strum(serialize = "output-error", serialize = "error")]
    OutputError,
    /// Any state this build does not know about.
    #[serde(other)]
    #[strum(disabled)]
    Other,
}

impl ToolState {
    /// Parse from string (case-insensitive); unknown values map to `Other`.
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Self {
        <Self as FromStr>::from_str(s).unwrap_or(ToolState::Other)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ToolState::InputStreaming => "input-streaming",
            ToolState::InputAvailable => "input-available",
            ToolState::ApprovalRequested => "approval-requested",
            ToolState::ApprovalResponded => "approval-responded",
            ToolState::OutputStreaming => "output-streaming",
            ToolState::OutputAvailable => "output-available",
            ToolState::OutputDenied => "output-denied",
            ToolState::OutputError => "output-error",
            ToolState::Other => "other",
        }
    }

    /// Merge precedence; a higher value carries more information.
    pub fn precedence(&self) -> u8 {
        match self {
            ToolState::OutputError => 6,
            ToolState::OutputDenied => 5,
            ToolState::OutputAvailable => 4,
            ToolState::OutputStreaming => 3,
            ToolState::InputAvailable => 2,
            ToolState::InputStreaming => 1,
            ToolState::ApprovalRequested | ToolState::ApprovalResponded | ToolState::Other => 0,
        }
    }

    pub fn is_input_state(&self) -> bool {
        matches!(self, ToolState::InputStreaming | ToolState::InputAvailable)
    }

    pub fn is_output_state(&self) -> bool {
        matches!(
            self,
            ToolState::OutputStreaming
                | ToolState::OutputAvailable
                | ToolState::OutputDenied
                | ToolState::OutputError
        )
    }
}

impl fmt::Display for ToolState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a single fragment contributes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FragmentKind {
    Input,
    Output,
    Error,
}

/// One tool invocation: a fragment on the way in, a canonical record after
/// reconciliation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolPart {
    pub call_id: String,
    pub tool: ToolKind,
    #[serde(default)]
    pub state: ToolState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_text: Option<String>,
}

impl ToolPart {
    fn bare(call_id: impl Into<String>, tool: ToolKind, state: ToolState) -> Self {
        Self {
            call_id: call_id.into(),
            tool,
            state,
            input: None,
            output: None,
            error_text: None,
        }
    }

    /// A fragment carrying the call's input.
    pub fn input(call_id: impl Into<String>, tool: ToolKind, input: Value) -> Self {
        Self {
            input: Some(input),
            ..Self::bare(call_id, tool, ToolState::InputAvailable)
        }
    }

    /// A fragment carrying the call's output.
    pub fn output(call_id: impl Into<String>, tool: ToolKind, output: Value) -> Self {
        Self {
            output: Some(output),
            ..Self::bare(call_id, tool, ToolState::OutputAvailable)
        }
    }

    /// A fragment carrying a failure.
    pub fn error(call_id: impl Into<String>, tool: ToolKind, error_text: impl Into<String>) -> Self {
        Self {
            error_text: Some(error_text.into()),
            ..Self::bare(call_id, tool, ToolState::OutputError)
        }
    }

    pub fn with_state(mut self, state: ToolState) -> Self {
        self.state = state;
        self
    }

    pub fn fragment_kind(&self) -> FragmentKind {
        if self.error_text.is_some() {
            FragmentKind::Error
        } else if self.output.is_some() {
            FragmentKind::Output
        } else {
            FragmentKind::Input
        }
    }

    /// The id with surrounding whitespace removed; `None` when blank.
    pub fn call_key(&self) -> Option<&str> {
        let key = self.call_id.trim();
        (!key.is_empty()).then_some(key)
    }
}
