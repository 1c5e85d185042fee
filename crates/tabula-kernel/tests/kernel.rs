//! End-to-end tests through the `Kernel` handle.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;

use tabula_kernel::{
    ConfirmationLedger, ConfirmationOutcome, ConversationStore, DocumentStore, InviteSink, Kernel,
    KernelError, ManualClock, TabulaConfig,
};
use tabula_types::{
    ActionPayload, CellValue, ConfirmationGrant, DeleteThreadPayload, Message, MessagePart, Role,
    SendInvitesPayload, ToolKind, ToolPart, UpdateCellPayload,
};

fn kernel_in(dir: &std::path::Path) -> Kernel {
    let documents = DocumentStore::new(dir.join("book.json"), "Sheet1", 1_000);
    documents.create_if_missing().unwrap();
    Kernel::from_parts(
        documents,
        ConfirmationLedger::in_memory().unwrap(),
        ConversationStore::in_memory().unwrap(),
        Arc::new(ManualClock::new(1_000)),
    )
}

fn update(cell: &str, value: CellValue) -> UpdateCellPayload {
    UpdateCellPayload {
        sheet: "Sheet1".into(),
        cell: cell.into(),
        value,
    }
}

/// A turn whose last message carries `grant` as a confirmAction output.
fn turn_with(grant: ConfirmationGrant) -> Vec<Message> {
    vec![
        Message::user_text("u1", "please do it"),
        Message::new(
            "a1",
            Role::Assistant,
            vec![MessagePart::Tool(ToolPart::output(
                format!("confirm-{}", grant.token),
                ToolKind::ConfirmAction,
                serde_json::to_value(&grant).unwrap(),
            ))],
        ),
    ]
}

fn approved_turn(token: &str, payload: impl Into<ActionPayload>) -> Vec<Message> {
    turn_with(ConfirmationGrant::approve(token, &payload.into()))
}

#[derive(Default)]
struct RecordingSink {
    sent: Mutex<Vec<Vec<String>>>,
}

#[async_trait]
impl InviteSink for RecordingSink {
    async fn send_invites(&self, emails: &[String]) -> anyhow::Result<()> {
        self.sent.lock().push(emails.to_vec());
        Ok(())
    }
}

struct FailingSink;

#[async_trait]
impl InviteSink for FailingSink {
    async fn send_invites(&self, _emails: &[String]) -> anyhow::Result<()> {
        anyhow::bail!("smtp unavailable")
    }
}

#[tokio::test]
async fn confirmed_update_is_written() {
    let dir = tempfile::tempdir().unwrap();
    let kernel = kernel_in(dir.path());
    let payload = update("C3", CellValue::from("=A1*2"));
    let turn = approved_turn("tok-1", payload.clone());

    let result = kernel.update_cell(&turn, payload).await.unwrap();
    assert_eq!(result.cell, "C3");
    assert_eq!(kernel.explain_formula("Sheet1", "c3").unwrap(), "=A1*2");
    assert_eq!(
        kernel.read_range("Sheet1", "C3").unwrap(),
        vec![vec![CellValue::from(0.0)]]
    );
}

#[tokio::test]
async fn replayed_grant_is_already_handled() {
    let dir = tempfile::tempdir().unwrap();
    let kernel = kernel_in(dir.path());
    let payload = update("A1", CellValue::from(1.0));
    let turn = approved_turn("tok-1", payload.clone());

    kernel.update_cell(&turn, payload.clone()).await.unwrap();
    // Someone edits A1 out of band; the replay must not overwrite it.
    let mut doc = kernel.documents().load().unwrap();
    kernel
        .documents()
        .write_cell(&mut doc, "Sheet1", "A1", &CellValue::from(99.0))
        .unwrap();
    kernel.documents().save(&doc).unwrap();

    let err = kernel.update_cell(&turn, payload).await.unwrap_err();
    assert_eq!(err.confirmation_outcome(), Some(ConfirmationOutcome::AlreadyHandled));
    assert_eq!(
        kernel.read_range("Sheet1", "A1").unwrap(),
        vec![vec![CellValue::from(99.0)]]
    );
}

#[tokio::test]
async fn missing_and_declined_are_distinguished() {
    let dir = tempfile::tempdir().unwrap();
    let kernel = kernel_in(dir.path());
    let payload = update("B1", CellValue::from(true));

    let err = kernel
        .update_cell(&[Message::user_text("u1", "set B1")], payload.clone())
        .await
        .unwrap_err();
    assert_eq!(err.confirmation_outcome(), Some(ConfirmationOutcome::NeedsConfirmation));
    assert!(err.is_client_error());

    let denied = ConfirmationGrant::deny("tok", &payload.clone().into(), Some("no".into()));
    let err = kernel.update_cell(&turn_with(denied), payload).await.unwrap_err();
    assert_eq!(err.confirmation_outcome(), Some(ConfirmationOutcome::Declined));

    assert_eq!(
        kernel.read_range("Sheet1", "B1").unwrap(),
        vec![vec![CellValue::Null]]
    );
    assert!(kernel.gate().ledger().is_empty().unwrap());
}

#[tokio::test]
async fn grant_for_different_value_does_not_authorize() {
    let dir = tempfile::tempdir().unwrap();
    let kernel = kernel_in(dir.path());
    let turn = approved_turn("tok", update("A1", CellValue::from(1.0)));

    let err = kernel
        .update_cell(&turn, update("A1", CellValue::from(2.0)))
        .await
        .unwrap_err();
    assert_eq!(err.confirmation_outcome(), Some(ConfirmationOutcome::NeedsConfirmation));
}

#[tokio::test]
async fn invalid_target_keeps_token_unspent() {
    let dir = tempfile::tempdir().unwrap();
    let kernel = kernel_in(dir.path());

    let bad = update("A0", CellValue::from(1.0));
    let err = kernel
        .update_cell(&approved_turn("tok", bad.clone()), bad)
        .await
        .unwrap_err();
    assert!(matches!(err, KernelError::Address(_)));

    let other_sheet = UpdateCellPayload {
        sheet: "Sheet2".into(),
        ..update("A1", CellValue::from(1.0))
    };
    let err = kernel
        .update_cell(&approved_turn("tok", other_sheet.clone()), other_sheet)
        .await
        .unwrap_err();
    assert!(err.is_client_error());
    assert!(!kernel.gate().ledger().is_consumed("tok").unwrap());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_updates_all_land() {
    let dir = tempfile::tempdir().unwrap();
    let kernel = Arc::new(kernel_in(dir.path()));

    let mut handles = Vec::new();
    for row in 1..=20u32 {
        let kernel = kernel.clone();
        handles.push(tokio::spawn(async move {
            let payload = update(&format!("A{row}"), CellValue::from(row as f64));
            let turn = approved_turn(&format!("tok-{row}"), payload.clone());
            kernel.update_cell(&turn, payload).await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let column: Vec<CellValue> = kernel
        .read_range("Sheet1", "A1:A20")
        .unwrap()
        .into_iter()
        .flatten()
        .collect();
    let expected: Vec<CellValue> = (1..=20).map(|n| CellValue::from(n as f64)).collect();
    assert_eq!(column, expected);
    assert_eq!(kernel.documents().writer().completed(), 20);
    assert_eq!(kernel.gate().ledger().len().unwrap(), 20);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn shared_grant_succeeds_once_under_contention() {
    let dir = tempfile::tempdir().unwrap();
    let kernel = Arc::new(kernel_in(dir.path()));
    let payload = update("B2", CellValue::from(7.0));
    let turn = Arc::new(approved_turn("tok-shared", payload.clone()));

    let mut handles = Vec::new();
    for _ in 0..8 {
        let kernel = kernel.clone();
        let turn = turn.clone();
        let payload = payload.clone();
        handles.push(tokio::spawn(async move { kernel.update_cell(&turn, payload).await }));
    }

    let mut written = 0;
    let mut replayed = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(update) => {
                assert_eq!(update.cell, "B2");
                written += 1;
            }
            Err(e) => {
                assert_eq!(e.confirmation_outcome(), Some(ConfirmationOutcome::AlreadyHandled));
                replayed += 1;
            }
        }
    }
    assert_eq!((written, replayed), (1, 7));
    assert_eq!(kernel.gate().ledger().len().unwrap(), 1);
    assert_eq!(kernel.documents().writer().completed(), 1);
}

#[tokio::test]
async fn non_finite_value_keeps_token_unspent() {
    let dir = tempfile::tempdir().unwrap();
    let kernel = kernel_in(dir.path());
    let payload = update("A1", CellValue::Number(f64::NAN));

    let err = kernel
        .update_cell(&approved_turn("tok", payload.clone()), payload)
        .await
        .unwrap_err();
    assert!(err.is_client_error());
    assert!(!kernel.gate().ledger().is_consumed("tok").unwrap());
    assert_eq!(
        kernel.read_range("Sheet1", "A1").unwrap(),
        vec![vec![CellValue::Null]]
    );
}

#[tokio::test]
async fn delete_thread_requires_grant() {
    let dir = tempfile::tempdir().unwrap();
    let kernel = kernel_in(dir.path());
    kernel
        .persist_turn("th-1", &[Message::user_text("m1", "hello")])
        .unwrap();

    let err = kernel.delete_thread(&[], "th-1").unwrap_err();
    assert_eq!(err.confirmation_outcome(), Some(ConfirmationOutcome::NeedsConfirmation));

    let turn = approved_turn(
        "tok",
        DeleteThreadPayload {
            thread_id: "th-1".into(),
        },
    );
    assert_eq!(kernel.delete_thread(&turn, "th-1").unwrap(), 1);
    assert!(kernel.load_turns("th-1").unwrap().is_empty());
}

#[tokio::test]
async fn send_invites_matches_recipient_order() {
    let dir = tempfile::tempdir().unwrap();
    let kernel = kernel_in(dir.path());
    let sink = RecordingSink::default();
    let emails = vec!["a@x.io".to_string(), "b@x.io".to_string()];
    let turn = approved_turn(
        "tok",
        SendInvitesPayload {
            emails: emails.clone(),
        },
    );

    let reversed: Vec<String> = emails.iter().rev().cloned().collect();
    let err = kernel.send_invites(&turn, reversed, &sink).await.unwrap_err();
    assert_eq!(err.confirmation_outcome(), Some(ConfirmationOutcome::NeedsConfirmation));
    assert!(sink.sent.lock().is_empty());

    kernel.send_invites(&turn, emails.clone(), &sink).await.unwrap();
    assert_eq!(*sink.sent.lock(), vec![emails]);
}

#[tokio::test]
async fn failed_delivery_still_spends_token() {
    let dir = tempfile::tempdir().unwrap();
    let kernel = kernel_in(dir.path());
    let emails = vec!["a@x.io".to_string()];
    let turn = approved_turn(
        "tok",
        SendInvitesPayload {
            emails: emails.clone(),
        },
    );

    let err = kernel
        .send_invites(&turn, emails.clone(), &FailingSink)
        .await
        .unwrap_err();
    assert!(matches!(err, KernelError::InviteDelivery(_)));

    let err = kernel
        .send_invites(&turn, emails, &RecordingSink::default())
        .await
        .unwrap_err();
    assert_eq!(err.confirmation_outcome(), Some(ConfirmationOutcome::AlreadyHandled));
}

#[test]
fn persisted_turns_keep_first_timestamp() {
    let dir = tempfile::tempdir().unwrap();
    let kernel = kernel_in(dir.path());
    let first = Message::user_text("m1", "hi").with_created_at(42);
    kernel.persist_turn("c1", &[first]).unwrap();

    let reply = Message::new(
        "m2",
        Role::Assistant,
        vec![
            ToolPart::input("r1", ToolKind::ReadRange, json!({"range": "A1"})).into(),
            ToolPart::output("r1", ToolKind::ReadRange, json!([[null]])).into(),
        ],
    );
    let resent = Message::user_text("m1", "hi (edited)").with_created_at(9_999);
    let summary = kernel.persist_turn("c1", &[resent, reply]).unwrap();
    assert_eq!((summary.inserted, summary.updated), (1, 1));

    let loaded = kernel.load_turns("c1").unwrap();
    assert_eq!(loaded[0].id, "m1");
    assert_eq!(loaded[0].created_at, Some(42));
    assert_eq!(loaded[1].tool_parts().count(), 1);
}

#[test]
fn kernel_clock_stamps_messages_and_ledger() {
    let dir = tempfile::tempdir().unwrap();
    let kernel = kernel_in(dir.path());
    kernel
        .persist_turn("c1", &[Message::user_text("m1", "hi")])
        .unwrap();
    assert_eq!(kernel.load_turns("c1").unwrap()[0].created_at, Some(1_000));

    let turn = approved_turn(
        "tok",
        DeleteThreadPayload {
            thread_id: "c1".into(),
        },
    );
    kernel.delete_thread(&turn, "c1").unwrap();
    assert_eq!(kernel.gate().ledger().get("tok").unwrap().unwrap().consumed_at, 1_000);
}

#[test]
fn open_from_config_creates_files() {
    let dir = tempfile::tempdir().unwrap();
    let config = TabulaConfig {
        document_path: dir.path().join("data/book.json"),
        database_path: dir.path().join("data/tabula.db"),
        sheet: "Budget".into(),
        max_read_cells: 4,
    };
    let kernel = Kernel::open(&config).unwrap();
    assert!(config.document_path.exists());
    assert_eq!(kernel.documents().sheet_name(), "Budget");

    let err = kernel.read_range("Budget", "A1:C3").unwrap_err();
    assert!(err.is_client_error());
    assert_eq!(
        kernel.read_range("Budget", "A1:B2").unwrap(),
        vec![vec![CellValue::Null; 2]; 2]
    );
}
