//! The kernel: one handle over the workbook, the gate and the turn store.
//!
//! Read-only tools go straight to the [`DocumentStore`]. Mutating tools take
//! the current turn, pass the [`ConfirmationGate`] (which spends the grant's
//! token), and only then touch anything.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{info, instrument};

use tabula_types::{
    ActionPayload, AddressError, CellValue, ConfirmationRequest, DeleteThreadPayload, Message,
    SendInvitesPayload, UpdateCellPayload, parse_cell,
};

use crate::clock::{Clock, SystemClock};
use crate::config::{ConfigError, TabulaConfig};
use crate::conversation_db::{ConversationError, ConversationStore, UpsertSummary};
use crate::document::{CellUpdate, DocumentError, DocumentStore};
use crate::gate::{ConfirmationError, ConfirmationGate};
use crate::ledger::ConfirmationLedger;

#[derive(Debug, Error)]
pub enum KernelError {
    #[error(transparent)]
    Address(#[from] AddressError),
    #[error(transparent)]
    Document(#[from] DocumentError),
    #[error(transparent)]
    Confirmation(#[from] ConfirmationError),
    #[error(transparent)]
    Conversation(#[from] ConversationError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("invite delivery failed: {0}")]
    InviteDelivery(#[source] anyhow::Error),
}

pub type KernelResult<T> = Result<T, KernelError>;

/// How a refused mutation should be reported back to the assistant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmationOutcome {
    /// Ask the user first.
    NeedsConfirmation,
    /// The user said no; do not retry.
    Declined,
    /// This grant already did its work.
    AlreadyHandled,
}

impl ConfirmationOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConfirmationOutcome::NeedsConfirmation => "needs-confirmation",
            ConfirmationOutcome::Declined => "declined",
            ConfirmationOutcome::AlreadyHandled => "already-handled",
        }
    }
}

impl KernelError {
    /// The confirmation outcome, when this is a gate refusal.
    pub fn confirmation_outcome(&self) -> Option<ConfirmationOutcome> {
        match self {
            KernelError::Confirmation(ConfirmationError::MissingConfirmation { .. }) => {
                Some(ConfirmationOutcome::NeedsConfirmation)
            }
            KernelError::Confirmation(ConfirmationError::ConfirmationDenied { .. }) => {
                Some(ConfirmationOutcome::Declined)
            }
            KernelError::Confirmation(ConfirmationError::ConfirmationAlreadyUsed { .. }) => {
                Some(ConfirmationOutcome::AlreadyHandled)
            }
            _ => None,
        }
    }

    /// True for errors caused by the request rather than the system.
    pub fn is_client_error(&self) -> bool {
        match self {
            KernelError::Address(_) => true,
            KernelError::Document(e) => matches!(
                e,
                DocumentError::UnsupportedSheet { .. }
                    | DocumentError::NoFormulaPresent(_)
                    | DocumentError::NonFiniteNumber(_)
                    | DocumentError::Address(_)
            ),
            KernelError::Conversation(e) => {
                matches!(e, ConversationError::MessageConversationMismatch { .. })
            }
            _ => self.confirmation_outcome().is_some(),
        }
    }
}

/// Delivers invitations once a `sendInvites` grant has been spent.
#[async_trait]
pub trait InviteSink: Send + Sync {
    async fn send_invites(&self, emails: &[String]) -> anyhow::Result<()>;
}

pub struct Kernel {
    documents: DocumentStore,
    gate: ConfirmationGate,
    conversations: ConversationStore,
}

impl Kernel {
    /// Open everything named by `config`, creating the workbook if needed.
    ///
    /// The ledger and the turns share one SQLite file.
    pub fn open(config: &TabulaConfig) -> KernelResult<Self> {
        if let Some(dir) = config.database_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir).map_err(|source| DocumentError::DocumentWriteFailed {
                path: dir.to_path_buf(),
                source,
            })?;
        }
        let documents = DocumentStore::open(config);
        documents.create_if_missing()?;

        let ledger = ConfirmationLedger::open(&config.database_path)
            .map_err(ConfirmationError::from)?;
        let conversations = ConversationStore::open(&config.database_path)
            .map_err(ConversationError::from)?;

        info!(
            document = %config.document_path.display(),
            database = %config.database_path.display(),
            sheet = %config.sheet,
            "kernel opened"
        );
        Ok(Self::from_parts(
            documents,
            ledger,
            conversations,
            Arc::new(SystemClock),
        ))
    }

    /// Assemble a kernel from open stores. `clock` stamps both ledger rows
    /// and generated message times, replacing any clock `conversations` had.
    pub fn from_parts(
        documents: DocumentStore,
        ledger: ConfirmationLedger,
        conversations: ConversationStore,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            documents,
            gate: ConfirmationGate::new(Arc::new(ledger), clock.clone()),
            conversations: conversations.with_clock(clock),
        }
    }

    pub fn documents(&self) -> &DocumentStore {
        &self.documents
    }

    pub fn gate(&self) -> &ConfirmationGate {
        &self.gate
    }

    pub fn conversations(&self) -> &ConversationStore {
        &self.conversations
    }

    pub fn read_range(&self, sheet: &str, range: &str) -> KernelResult<Vec<Vec<CellValue>>> {
        Ok(self.documents.read_range(sheet, range)?)
    }

    pub fn explain_formula(&self, sheet: &str, cell: &str) -> KernelResult<String> {
        Ok(self.documents.explain_formula(sheet, cell)?)
    }

    /// The prompt to show before running `payload`.
    pub fn propose(&self, payload: impl Into<ActionPayload>) -> ConfirmationRequest {
        self.gate.request_for(payload)
    }

    /// Write one cell, given a grant for exactly this payload in `turn`.
    ///
    /// The target is validated before the grant is spent, so a malformed
    /// request leaves the token usable.
    #[instrument(skip(self, turn, payload), fields(cell = %payload.cell))]
    pub async fn update_cell(
        &self,
        turn: &[Message],
        payload: UpdateCellPayload,
    ) -> KernelResult<CellUpdate> {
        self.documents.check_sheet(&payload.sheet)?;
        self.documents.check_value(&payload.value)?;
        parse_cell(&payload.cell)?;

        let expected = ActionPayload::from(payload.clone());
        self.gate.assert_confirmed_and_consume(turn, &expected)?;

        let update = self
            .documents
            .update_cell(&payload.sheet, &payload.cell, payload.value)
            .await?;
        info!(cell = %update.cell, "cell updated");
        Ok(update)
    }

    /// Delete a conversation thread, given a grant in `turn`.
    #[instrument(skip(self, turn))]
    pub fn delete_thread(&self, turn: &[Message], thread_id: &str) -> KernelResult<usize> {
        let expected = ActionPayload::from(DeleteThreadPayload {
            thread_id: thread_id.to_string(),
        });
        self.gate.assert_confirmed_and_consume(turn, &expected)?;
        let removed = self.conversations.delete_conversation(thread_id)?;
        info!(removed, "thread deleted");
        Ok(removed)
    }

    /// Send invitations, given a grant naming the same recipients in the
    /// same order.
    #[instrument(skip(self, turn, emails, sink), fields(recipients = emails.len()))]
    pub async fn send_invites(
        &self,
        turn: &[Message],
        emails: Vec<String>,
        sink: &dyn InviteSink,
    ) -> KernelResult<()> {
        let expected = ActionPayload::from(SendInvitesPayload {
            emails: emails.clone(),
        });
        self.gate.assert_confirmed_and_consume(turn, &expected)?;
        sink.send_invites(&emails)
            .await
            .map_err(KernelError::InviteDelivery)?;
        info!("invites sent");
        Ok(())
    }

    /// Persist a finished turn.
    pub fn persist_turn(
        &self,
        conversation_id: &str,
        messages: &[Message],
    ) -> KernelResult<UpsertSummary> {
        Ok(self.conversations.upsert_turns(conversation_id, messages)?)
    }

    pub fn load_turns(&self, conversation_id: &str) -> KernelResult<Vec<Message>> {
        Ok(self.conversations.load_turns(conversation_id)?)
    }
}
