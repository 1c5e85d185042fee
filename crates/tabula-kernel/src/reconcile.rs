//! Collapse tool-call fragments into one canonical part per call.
//!
//! Streaming and retries deliver a call as several parts with the same
//! `call_id`. Reconciliation folds them into the first fragment's slot,
//! keeping the most informative state and filling payload fields that are
//! still empty. Text and reasoning parts keep their positions.
//!
//! The common case is a message that is already canonical, so the input is
//! returned borrowed when nothing changes.

use std::borrow::Cow;
use std::collections::HashMap;

use tracing::trace;

use tabula_types::{Message, MessagePart, ToolKind, ToolPart, ToolState};

enum Slot {
    Keep(usize),
    Call(usize),
}

/// Reconcile one message's parts.
pub fn reconcile(parts: &[MessagePart]) -> Cow<'_, [MessagePart]> {
    let mut slots = Vec::with_capacity(parts.len());
    let mut calls: Vec<ToolPart> = Vec::new();
    let mut by_key: HashMap<&str, usize> = HashMap::new();
    let mut changed = false;

    for (idx, part) in parts.iter().enumerate() {
        let MessagePart::Tool(tool) = part else {
            slots.push(Slot::Keep(idx));
            continue;
        };
        let Some(key) = tool.call_key() else {
            trace!("dropping tool part with blank call id");
            changed = true;
            continue;
        };
        match by_key.get(key) {
            Some(&existing) => {
                merge_into(&mut calls[existing], tool);
                changed = true;
            }
            None => {
                by_key.insert(key, calls.len());
                slots.push(Slot::Call(calls.len()));
                calls.push(tool.clone());
            }
        }
    }

    for call in &mut calls {
        changed |= coerce_state(call);
    }

    if !changed {
        return Cow::Borrowed(parts);
    }

    let mut calls: Vec<Option<ToolPart>> = calls.into_iter().map(Some).collect();
    let merged = slots
        .into_iter()
        .filter_map(|slot| match slot {
            Slot::Keep(idx) => Some(parts[idx].clone()),
            Slot::Call(idx) => calls[idx].take().map(MessagePart::Tool),
        })
        .collect();
    Cow::Owned(merged)
}

/// Reconcile every message, cloning only when some message changed.
pub fn reconcile_messages(messages: &[Message]) -> Cow<'_, [Message]> {
    let mut out: Option<Vec<Message>> = None;
    for (idx, msg) in messages.iter().enumerate() {
        if let Cow::Owned(parts) = reconcile(&msg.parts) {
            let out = out.get_or_insert_with(|| messages[..idx].to_vec());
            out.push(Message {
                parts,
                ..msg.clone()
            });
        } else if let Some(out) = out.as_mut() {
            out.push(msg.clone());
        }
    }
    match out {
        Some(out) => Cow::Owned(out),
        None => Cow::Borrowed(messages),
    }
}

fn merge_into(canonical: &mut ToolPart, fragment: &ToolPart) {
    if fragment.state.precedence() > canonical.state.precedence() {
        canonical.state = fragment.state;
    }
    if canonical.input.is_none() {
        canonical.input.clone_from(&fragment.input);
    }
    if canonical.output.is_none() {
        canonical.output.clone_from(&fragment.output);
    }
    if canonical.error_text.is_none() {
        canonical.error_text.clone_from(&fragment.error_text);
    }
    if let ToolKind::Dynamic { name: Some(name) } = &fragment.tool {
        if let ToolKind::Dynamic { name: slot } = &mut canonical.tool {
            slot.get_or_insert_with(|| name.clone());
        }
    }
}

/// Make the state agree with the payload. Returns `true` if it changed.
///
/// Failure states legitimately carry no output and are left alone.
fn coerce_state(part: &mut ToolPart) -> bool {
    if part.error_text.is_some()
        || matches!(part.state, ToolState::OutputError | ToolState::OutputDenied)
    {
        return false;
    }
    let target = match (&part.input, &part.output) {
        (None, Some(_)) if !part.state.is_output_state() => ToolState::OutputAvailable,
        (Some(_), None) if !part.state.is_input_state() => ToolState::InputAvailable,
        _ => return false,
    };
    trace!(call_id = %part.call_id, from = %part.state, to = %target, "coercing tool state");
    part.state = target;
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn tool(part: ToolPart) -> MessagePart {
        MessagePart::Tool(part)
    }

    #[test]
    fn test_canonical_input_is_borrowed() {
        let parts = vec![
            MessagePart::text("reading"),
            tool(ToolPart::input("c1", ToolKind::ReadRange, json!({"range": "A1:B2"}))),
            tool(ToolPart::output("c2", ToolKind::ReadRange, json!([[1]]))),
        ];
        assert!(matches!(reconcile(&parts), Cow::Borrowed(_)));
    }

    #[test]
    fn test_fragments_merge_into_first_slot() {
        let parts = vec![
            tool(ToolPart::input("c1", ToolKind::UpdateCell, json!({"cell": "A1"}))),
            MessagePart::text("done"),
            tool(ToolPart::output("c1", ToolKind::UpdateCell, json!({"ok": true}))),
        ];
        let merged = reconcile(&parts);
        assert_eq!(merged.len(), 2);

        let call = merged[0].as_tool().unwrap();
        assert_eq!(call.state, ToolState::OutputAvailable);
        assert_eq!(call.input, Some(json!({"cell": "A1"})));
        assert_eq!(call.output, Some(json!({"ok": true})));
        assert_eq!(merged[1], MessagePart::text("done"));
    }

    #[test]
    fn test_error_beats_output_and_earlier_payload_wins() {
        let parts = vec![
            tool(ToolPart::output("c1", ToolKind::ReadRange, json!("first"))),
            tool(ToolPart::error("c1", ToolKind::ReadRange, "boom")),
            tool(ToolPart::output("c1", ToolKind::ReadRange, json!("retry"))),
        ];
        let merged = reconcile(&parts);
        let call = merged[0].as_tool().unwrap();
        assert_eq!(merged.len(), 1);
        assert_eq!(call.state, ToolState::OutputError);
        assert_eq!(call.output, Some(json!("first")));
        assert_eq!(call.error_text.as_deref(), Some("boom"));
    }

    #[test]
    fn test_call_ids_are_trimmed_and_blank_ids_dropped() {
        let parts = vec![
            tool(ToolPart::input(" c1 ", ToolKind::ReadRange, json!({}))),
            tool(ToolPart::output("c1", ToolKind::ReadRange, json!([]))),
            tool(ToolPart::input("   ", ToolKind::ReadRange, json!({}))),
        ];
        let merged = reconcile(&parts);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].as_tool().unwrap().call_id, " c1 ");
    }

    #[test]
    fn test_single_fragment_state_is_coerced() {
        let parts = vec![tool(
            ToolPart::output("c1", ToolKind::ExplainFormula, json!("=SUM(A1:A3)"))
                .with_state(ToolState::InputAvailable),
        )];
        let merged = reconcile(&parts);
        assert!(matches!(merged, Cow::Owned(_)));
        assert_eq!(merged[0].as_tool().unwrap().state, ToolState::OutputAvailable);

        let parts = vec![tool(
            ToolPart::input("c2", ToolKind::ReadRange, json!({}))
                .with_state(ToolState::OutputStreaming),
        )];
        assert_eq!(reconcile(&parts)[0].as_tool().unwrap().state, ToolState::InputAvailable);
    }

    #[test]
    fn test_dynamic_name_is_filled_from_later_fragment() {
        let parts = vec![
            tool(ToolPart::input("d1", ToolKind::Dynamic { name: None }, json!({}))),
            tool(ToolPart::output(
                "d1",
                ToolKind::Dynamic {
                    name: Some("lookup".into()),
                },
                json!(1),
            )),
        ];
        let merged = reconcile(&parts);
        assert_eq!(
            merged[0].as_tool().unwrap().tool,
            ToolKind::Dynamic {
                name: Some("lookup".into())
            }
        );
    }

    #[test]
    fn test_reconcile_is_idempotent() {
        let parts = vec![
            tool(ToolPart::input("c1", ToolKind::SendInvites, json!({"emails": []}))),
            tool(ToolPart::output("c1", ToolKind::SendInvites, json!({"sent": 0}))),
            tool(ToolPart::error("c2", ToolKind::ReadRange, "bad range")),
        ];
        let once = reconcile(&parts).into_owned();
        assert!(matches!(reconcile(&once), Cow::Borrowed(_)));
    }

    #[test]
    fn test_messages_clone_only_when_needed() {
        let clean = vec![Message::user_text("m1", "hi"), Message::user_text("m2", "there")];
        assert!(matches!(reconcile_messages(&clean), Cow::Borrowed(_)));

        let mut messy = clean.clone();
        messy.push(Message::new(
            "m3",
            tabula_types::Role::Assistant,
            vec![
                tool(ToolPart::input("c1", ToolKind::ReadRange, json!({}))),
                tool(ToolPart::output("c1", ToolKind::ReadRange, json!([]))),
            ],
        ));
        let out = reconcile_messages(&messy);
        assert_eq!(out.len(), 3);
        assert_eq!(out[0], clean[0]);
        assert_eq!(out[2].parts.len(), 1);
    }
}
