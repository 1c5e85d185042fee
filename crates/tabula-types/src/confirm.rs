//! Confirmation requests and grants.
//!
//! A mutating tool proposes an [`ActionPayload`]; the client shows the prompt
//! and answers with a [`ConfirmationGrant`] naming the same action and
//! payload. The grant is carried back through the turn as the output of a
//! `confirmAction` tool call, where the server matches it field for field.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum::EnumString;

use crate::value::CellValue;

/// Actions that require an explicit grant.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, EnumString)]
#[serde(rename_all = "camelCase")]
#[strum(serialize_all = "camelCase")]
pub enum ConfirmAction {
    UpdateCell,
    DeleteThread,
    SendInvites,
}

impl ConfirmAction {
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        <Self as FromStr>::from_str(s).ok()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConfirmAction::UpdateCell => "updateCell",
            ConfirmAction::DeleteThread => "deleteThread",
            ConfirmAction::SendInvites => "sendInvites",
        }
    }
}

impl fmt::Display for ConfirmAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpdateCellPayload {
    pub sheet: String,
    pub cell: String,
    pub value: CellValue,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct DeleteThreadPayload {
    pub thread_id: String,
}

/// Recipients in the order they were shown to the user.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SendInvitesPayload {
    pub emails: Vec<String>,
}

/// The exact thing a user is asked to approve, typed per action.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ActionPayload {
    UpdateCell(UpdateCellPayload),
    DeleteThread(DeleteThreadPayload),
    SendInvites(SendInvitesPayload),
}

impl ActionPayload {
    pub fn action(&self) -> ConfirmAction {
        match self {
            ActionPayload::UpdateCell(_) => ConfirmAction::UpdateCell,
            ActionPayload::DeleteThread(_) => ConfirmAction::DeleteThread,
            ActionPayload::SendInvites(_) => ConfirmAction::SendInvites,
        }
    }

    /// Decode `value` as the payload for `action`.
    ///
    /// Unknown or missing fields are errors, so a payload only decodes when
    /// its shape matches the action exactly.
    pub fn from_value(action: ConfirmAction, value: &Value) -> serde_json::Result<Self> {
        Ok(match action {
            ConfirmAction::UpdateCell => {
                ActionPayload::UpdateCell(UpdateCellPayload::deserialize(value)?)
            }
            ConfirmAction::DeleteThread => {
                ActionPayload::DeleteThread(DeleteThreadPayload::deserialize(value)?)
            }
            ConfirmAction::SendInvites => {
                ActionPayload::SendInvites(SendInvitesPayload::deserialize(value)?)
            }
        })
    }

    pub fn to_value(&self) -> Value {
        // Plain structs of strings and scalars; serialization cannot fail.
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

impl From<UpdateCellPayload> for ActionPayload {
    fn from(p: UpdateCellPayload) -> Self {
        ActionPayload::UpdateCell(p)
    }
}

impl From<DeleteThreadPayload> for ActionPayload {
    fn from(p: DeleteThreadPayload) -> Self {
        ActionPayload::DeleteThread(p)
    }
}

impl From<SendInvitesPayload> for ActionPayload {
    fn from(p: SendInvitesPayload) -> Self {
        ActionPayload::SendInvites(p)
    }
}

/// What the assistant asks the user to approve. Never persisted on its own.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ConfirmationRequest {
    pub action: ConfirmAction,
    pub payload: ActionPayload,
    pub prompt: String,
}

impl ConfirmationRequest {
    pub fn new(payload: impl Into<ActionPayload>, prompt: impl Into<String>) -> Self {
        let payload = payload.into();
        Self {
            action: payload.action(),
            payload,
            prompt: prompt.into(),
        }
    }
}

/// The user's answer to a [`ConfirmationRequest`].
///
/// `payload` stays as raw JSON until it is matched against an expected
/// payload; `approved` means nothing on its own.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConfirmationGrant {
    pub approved: bool,
    pub token: String,
    pub action: ConfirmAction,
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl ConfirmationGrant {
    pub fn approve(token: impl Into<String>, payload: &ActionPayload) -> Self {
        Self {
            approved: true,
            token: token.into(),
            action: payload.action(),
            payload: payload.to_value(),
            reason: None,
        }
    }

    pub fn deny(token: impl Into<String>, payload: &ActionPayload, reason: Option<String>) -> Self {
        Self {
            approved: false,
            reason,
            ..Self::approve(token, payload)
        }
    }

    /// True when this grant names exactly `expected`.
    pub fn matches(&self, expected: &ActionPayload) -> bool {
        self.action == expected.action()
            && ActionPayload::from_value(self.action, &self.payload)
                .is_ok_and(|decoded| &decoded == expected)
    }
}
