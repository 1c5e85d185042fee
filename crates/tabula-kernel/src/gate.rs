//! Confirmation gate for mutating tools.
//!
//! Before a tool changes anything outside the conversation it must find, in
//! the current turn, a grant from the user that names the same action and an
//! identical payload. An approved grant is then spent in the
//! [`ConfirmationLedger`] so a replayed turn cannot run the mutation twice.
//!
//! Grants travel as the output of `confirmAction` tool calls. When several
//! match, the one that appears last in the turn wins, so a user who first
//! declines and then approves (or the reverse) gets their latest answer.

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use tabula_types::{
    ActionPayload, ConfirmAction, ConfirmationGrant, ConfirmationRequest, Message, ToolKind,
};

use crate::clock::Clock;
use crate::ledger::ConfirmationLedger;
use crate::loose_json;

/// Why a mutation was refused.
#[derive(Debug, Error)]
pub enum ConfirmationError {
    /// No grant in the turn names this action and payload.
    #[error("{action} needs the user's confirmation before it can run")]
    MissingConfirmation { action: ConfirmAction },

    /// The latest matching grant says no.
    #[error("the user declined {action}{}", .reason.as_deref().map(|r| format!(": {r}")).unwrap_or_default())]
    ConfirmationDenied {
        action: ConfirmAction,
        reason: Option<String>,
    },

    /// The grant's token was spent by an earlier request.
    #[error("confirmation {token} for {action} has already been used")]
    ConfirmationAlreadyUsed { token: String, action: ConfirmAction },

    #[error("confirmation ledger error: {0}")]
    Ledger(#[from] rusqlite::Error),
}

/// Find the grant in `history` that matches `expected`, latest first.
///
/// Only `confirmAction` parts with an output are considered. Outputs that
/// arrive as text are decoded leniently; anything that still does not decode
/// as a grant is ignored.
pub fn find_grant<'a, I>(history: I, expected: &ActionPayload) -> Option<ConfirmationGrant>
where
    I: IntoIterator<Item = &'a Message>,
{
    let mut found = None;
    for part in history.into_iter().flat_map(Message::tool_parts) {
        if part.tool != ToolKind::ConfirmAction {
            continue;
        }
        let Some(output) = part.output.as_ref() else {
            continue;
        };
        let grant = match serde_json::from_value::<ConfirmationGrant>(
            loose_json::normalize_output(output),
        ) {
            Ok(grant) => grant,
            Err(e) => {
                debug!(call_id = %part.call_id, "ignoring undecodable confirmation output: {e}");
                continue;
            }
        };
        if grant.matches(expected) {
            found = Some(grant);
        }
    }
    found
}

/// Checks grants against a turn and spends their tokens.
pub struct ConfirmationGate {
    ledger: Arc<ConfirmationLedger>,
    clock: Arc<dyn Clock>,
}

impl ConfirmationGate {
    pub fn new(ledger: Arc<ConfirmationLedger>, clock: Arc<dyn Clock>) -> Self {
        Self { ledger, clock }
    }

    pub fn ledger(&self) -> &ConfirmationLedger {
        &self.ledger
    }

    /// Build the prompt shown to the user for `payload`.
    pub fn request_for(&self, payload: impl Into<ActionPayload>) -> ConfirmationRequest {
        let payload = payload.into();
        let prompt = match &payload {
            ActionPayload::UpdateCell(p) => {
                format!("Set {}!{} to {}?", p.sheet, p.cell.trim().to_ascii_uppercase(), p.value)
            }
            ActionPayload::DeleteThread(p) => format!("Delete thread {}?", p.thread_id),
            ActionPayload::SendInvites(p) => format!("Send invites to {}?", p.emails.join(", ")),
        };
        ConfirmationRequest::new(payload, prompt)
    }

    /// Require an approved grant for `expected` in `history`.
    ///
    /// Pure with respect to the ledger: nothing is consumed.
    pub fn assert_confirmed(
        &self,
        history: &[Message],
        expected: &ActionPayload,
    ) -> Result<ConfirmationGrant, ConfirmationError> {
        let action = expected.action();
        let grant = find_grant(history, expected)
            .ok_or(ConfirmationError::MissingConfirmation { action })?;
        if !grant.approved {
            return Err(ConfirmationError::ConfirmationDenied {
                action,
                reason: grant.reason,
            });
        }
        Ok(grant)
    }

    /// Spend `token`. Returns `true` on first use only.
    pub fn consume_once(
        &self,
        token: &str,
        action: ConfirmAction,
        payload_snapshot: &serde_json::Value,
    ) -> Result<bool, ConfirmationError> {
        Ok(self
            .ledger
            .try_consume(token, action, payload_snapshot, self.clock.now_millis())?)
    }

    /// [`assert_confirmed`](Self::assert_confirmed), then spend the token.
    ///
    /// On success the caller may run the mutation exactly once. A token is
    /// spent even if the mutation later fails.
    #[instrument(skip(self, history, expected), fields(action = %expected.action()))]
    pub fn assert_confirmed_and_consume(
        &self,
        history: &[Message],
        expected: &ActionPayload,
    ) -> Result<ConfirmationGrant, ConfirmationError> {
        let grant = match self.assert_confirmed(history, expected) {
            Ok(grant) => grant,
            Err(e) => {
                info!("mutation refused: {e}");
                return Err(e);
            }
        };
        if !self.consume_once(&grant.token, grant.action, &grant.payload)? {
            warn!(token = %grant.token, "confirmation replayed");
            return Err(ConfirmationError::ConfirmationAlreadyUsed {
                token: grant.token,
                action: grant.action,
            });
        }
        debug!(token = %grant.token, "confirmation accepted");
        Ok(grant)
    }
}
