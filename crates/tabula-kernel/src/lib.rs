//! # tabula-kernel
//!
//! The mutation core behind tabula's spreadsheet assistant.
//!
//! A kernel owns:
//! - one workbook file with a single sheet, changed only through a FIFO
//!   single-writer slot and atomic renames ([`DocumentStore`])
//! - a gate that refuses mutations the user has not approved for the exact
//!   payload, and spends each approval once ([`ConfirmationGate`],
//!   [`ConfirmationLedger`])
//! - the conversation history, stored with tool-call fragments already
//!   merged ([`ConversationStore`], [`reconcile()`])

pub mod atomic;
pub mod clock;
pub mod config;
pub mod conversation_db;
pub mod document;
pub mod gate;
pub mod kernel;
pub mod ledger;
pub mod loose_json;
pub mod reconcile;
pub mod writer;

pub use clock::{Clock, ManualClock, MonotonicStamps, SystemClock};
pub use config::{ConfigError, TabulaConfig};
pub use conversation_db::{ConversationError, ConversationStore, UpsertSummary};
pub use document::{CellUpdate, Document, DocumentError, DocumentStore, Sheet, StoredCell};
pub use gate::{ConfirmationError, ConfirmationGate, find_grant};
pub use kernel::{ConfirmationOutcome, InviteSink, Kernel, KernelError, KernelResult};
pub use ledger::{ConfirmationLedger, ConsumedConfirmation};
pub use reconcile::{reconcile, reconcile_messages};
pub use writer::SingleWriter;
