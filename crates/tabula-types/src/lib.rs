//! Shared types for Tabula.
//!
//! This is the leaf crate: A1 coordinates, cell values, conversation messages
//! with their tool parts, and the confirmation request/grant shapes. It has
//! **no internal tabula dependencies** and does no I/O.
//!
//! # Key Types
//!
//! |-------------------------|------------------------------------------------|
//! | Type                    | Purpose                                        |
//! |-------------------------|------------------------------------------------|
//! | [`CellAddress`]         | One cell, 1-indexed, bounds-checked            |
//! | [`CellRange`]           | Normalized inclusive rectangle                 |
//! | [`CellValue`]           | string / number / boolean / null               |
//! | [`ToolPart`]            | Tool call fragment or canonical record         |
//! | [`Message`]             | Conversation message with ordered parts        |
//! | [`ActionPayload`]       | Typed payload a user is asked to approve       |
//! | [`ConfirmationGrant`]   | The user's answer, matched field for field     |
//! |-------------------------|------------------------------------------------|

pub mod address;
pub mod confirm;
pub mod message;
pub mod tool;
pub mod value;

pub use address::{
    AddressError, CellAddress, CellRange, DEFAULT_MAX_CELLS, MAX_COLS, MAX_ROWS, RangeMention,
    column_letters_to_number, column_number_to_letters, format_cell, format_range,
    normalize_range, parse_cell, parse_mention, parse_range, selection_to_range,
};
pub use confirm::{
    ActionPayload, ConfirmAction, ConfirmationGrant, ConfirmationRequest, DeleteThreadPayload,
    SendInvitesPayload, UpdateCellPayload,
};
pub use message::{Message, MessagePart, Role};
pub use tool::{FragmentKind, ToolKind, ToolPart, ToolState};
pub use value::CellValue;

/// Current time as Unix milliseconds.
pub fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
