// Conversation store contract tests: idempotent apply, counterpart
// resolution, receipt effects, monotonic status, tombstoning, and the
// group ownership rules. The store is a pure state machine, so none of
// these need a socket.

mod common;
use common::setup_logging;

use wavechat::models::{
    Attachment, DeliveryStatus, Group, GroupMember, GroupRole, Message, PresenceState,
    TOMBSTONE_TEXT,
};
use wavechat::sync::store::{ConversationStore, StoreEffect};

fn incoming(id: &str, from: &str, text: &str) -> Message {
    let mut msg = Message::new(
        id.to_string(),
        from.to_string(),
        "me".to_string(),
        text.to_string(),
        1_700_000_000_000,
    );
    msg.status = DeliveryStatus::Delivered;
    msg
}

fn group_fixture(created_by: &str) -> Group {
    Group {
        id: "g1".to_string(),
        name: "Test Group".to_string(),
        description: None,
        avatar_url: None,
        created_by: created_by.to_string(),
        members: vec![
            GroupMember {
                user_id: "me".to_string(),
                display_name: "Me".to_string(),
                role: GroupRole::Member,
                status: PresenceState::Online,
            },
            GroupMember {
                user_id: "c1".to_string(),
                display_name: "C1".to_string(),
                role: GroupRole::Admin,
                status: PresenceState::Online,
            },
        ],
    }
}

#[test]
fn add_message_is_idempotent_by_id() {
    setup_logging();
    let mut store = ConversationStore::new("me");

    let first = store.add_message(incoming("m1", "c1", "hello"));
    assert!(first.added);
    assert_eq!(first.conversation_id, "c1");

    let second = store.add_message(incoming("m1", "c1", "hello"));
    assert!(!second.added);
    assert!(second.effects.is_empty());

    assert_eq!(store.conversation("c1").unwrap().messages.len(), 1);
}

#[test]
fn counterpart_is_resolved_relative_to_local_user() {
    let mut store = ConversationStore::new("me");

    // Incoming: the conversation is keyed by the sender.
    let result = store.add_message(incoming("m1", "c1", "hi"));
    assert_eq!(result.conversation_id, "c1");

    // Outgoing: keyed by the recipient.
    let out = store.begin_outgoing("c2", "hello there", None);
    assert_eq!(out.recipient_id, "c2");
    assert!(store.conversation("c2").unwrap().contains_message(&out.id));

    // Group traffic is keyed by the group id, not either participant.
    store.upsert_group(group_fixture("c1"));
    let mut group_msg = incoming("m2", "c1", "to the group");
    group_msg.recipient_id = "g1".to_string();
    let result = store.add_message(group_msg);
    assert_eq!(result.conversation_id, "g1");
    assert!(store.conversation("g1").unwrap().is_group);
}

#[test]
fn optimistic_send_reconciles_with_server_echo() {
    let mut store = ConversationStore::new("me");

    let optimistic = store.begin_outgoing("c1", "hi", None);
    assert_eq!(optimistic.status, DeliveryStatus::Sent);

    // The server confirms by echoing the same logical message back.
    let mut echo = Message::new(
        optimistic.id.clone(),
        "me".to_string(),
        "c1".to_string(),
        "hi".to_string(),
        optimistic.timestamp,
    );
    echo.status = DeliveryStatus::Sent;
    let result = store.add_message(echo);

    assert!(!result.added, "echo must reconcile, not duplicate");
    assert_eq!(store.conversation("c1").unwrap().messages.len(), 1);
}

#[test]
fn incoming_message_marks_unread_unless_active_and_visible() {
    let mut store = ConversationStore::new("me");

    // Not active: unread flag, delivery receipt only.
    let result = store.add_message(incoming("m1", "c1", "one"));
    assert_eq!(
        result.effects,
        vec![StoreEffect::SendDeliveryReceipt {
            to: "c1".to_string(),
            message_id: "m1".to_string(),
        }]
    );
    assert!(store.conversation("c1").unwrap().is_unread);

    // Active and visible: read immediately, receipt emitted for it.
    store.set_active("c1");
    let result = store.add_message(incoming("m2", "c1", "two"));
    assert!(result.effects.contains(&StoreEffect::SendReadReceipt {
        to: "c1".to_string(),
        message_id: "m2".to_string(),
    }));
    let conv = store.conversation("c1").unwrap();
    assert!(!conv.is_unread);
    assert_eq!(conv.last_read_message_id.as_deref(), Some("m2"));

    // Active but hidden behaves like inactive.
    store.set_visibility(false);
    let result = store.add_message(incoming("m3", "c1", "three"));
    assert!(!result
        .effects
        .iter()
        .any(|e| matches!(e, StoreEffect::SendReadReceipt { .. })));
    assert!(store.conversation("c1").unwrap().is_unread);
}

#[test]
fn set_active_reads_newest_unread_only() {
    let mut store = ConversationStore::new("me");
    store.add_message(incoming("m1", "c1", "one"));
    store.add_message(incoming("m2", "c1", "two"));
    store.add_message(incoming("m3", "c1", "three"));

    let effects = store.set_active("c1");
    let receipts: Vec<_> = effects
        .iter()
        .filter(|e| matches!(e, StoreEffect::SendReadReceipt { .. }))
        .collect();
    assert_eq!(receipts.len(), 1, "one receipt for the newest unread only");
    assert_eq!(
        receipts[0],
        &StoreEffect::SendReadReceipt {
            to: "c1".to_string(),
            message_id: "m3".to_string(),
        }
    );

    let conv = store.conversation("c1").unwrap();
    assert!(!conv.is_unread);
    assert!(conv.messages.iter().all(|m| m.status == DeliveryStatus::Read));
}

#[test]
fn set_active_on_unseen_conversation_requests_history() {
    let mut store = ConversationStore::new("me");
    let effects = store.set_active("c9");
    assert_eq!(
        effects,
        vec![StoreEffect::FetchHistory {
            conversation_id: "c9".to_string(),
        }]
    );
    assert!(store.conversation("c9").unwrap().messages.is_empty());
    assert_eq!(store.active(), Some("c9"));
}

#[test]
fn status_updates_are_monotonic() {
    let mut store = ConversationStore::new("me");
    let msg = store.begin_outgoing("c1", "hi", None);

    assert!(store.update_status(&msg.id, DeliveryStatus::Delivered).is_some());
    assert!(store.update_status(&msg.id, DeliveryStatus::Read).is_some());

    // Regression is rejected; the message stays read.
    assert!(store.update_status(&msg.id, DeliveryStatus::Delivered).is_none());
    let conv = store.conversation("c1").unwrap();
    assert_eq!(conv.messages[0].status, DeliveryStatus::Read);

    // Failed always overwrites.
    assert!(store.update_status(&msg.id, DeliveryStatus::Failed).is_some());
}

#[test]
fn reactions_are_a_set() {
    let mut store = ConversationStore::new("me");
    store.add_message(incoming("m1", "c1", "react"));

    assert!(store.apply_reaction("m1", "u1", "👍", true).is_some());
    // Duplicate add is a no-op.
    assert!(store.apply_reaction("m1", "u1", "👍", true).is_none());
    // Removing a pair that was never added is a no-op.
    assert!(store.apply_reaction("m1", "u2", "🎉", false).is_none());
    assert!(store.apply_reaction("m1", "u1", "👍", false).is_some());

    let conv = store.conversation("c1").unwrap();
    assert!(conv.messages[0].reactions.is_empty());
}

#[test]
fn delete_tombstones_regardless_of_origin() {
    let mut store = ConversationStore::new("me");
    let mut msg = incoming("m1", "c1", "sensitive");
    msg.attachments.push(Attachment {
        url: "https://blobs.example.com/f.pdf".to_string(),
        name: "f.pdf".to_string(),
        size: 100,
        mime_type: "application/pdf".to_string(),
    });
    store.add_message(msg);

    let (_, deleted) = store.apply_delete("m1", 1_700_000_001_000).unwrap();
    assert!(deleted.is_deleted);
    assert_eq!(deleted.text, TOMBSTONE_TEXT);
    assert!(deleted.attachments.is_empty());

    // Locally-initiated delete of an outgoing message behaves identically.
    let out = store.begin_outgoing("c1", "oops", None);
    let (_, deleted) = store.apply_delete(&out.id, 1_700_000_002_000).unwrap();
    assert!(deleted.is_deleted);
    assert_eq!(deleted.text, TOMBSTONE_TEXT);

    // Edits cannot resurrect a tombstone.
    assert!(store.apply_edit("m1", "back from the dead", 1_700_000_003_000).is_none());
}

#[test]
fn edit_updates_text_and_flags() {
    let mut store = ConversationStore::new("me");
    store.add_message(incoming("m1", "c1", "typo"));

    let (_, edited) = store.apply_edit("m1", "fixed", 1_700_000_001_000).unwrap();
    assert_eq!(edited.text, "fixed");
    assert!(edited.is_edited);
    assert_eq!(edited.edited_at, Some(1_700_000_001_000));
}

#[test]
fn delete_conversation_clears_active_reference() {
    let mut store = ConversationStore::new("me");
    store.add_message(incoming("m1", "c1", "hi"));
    store.set_active("c1");

    assert!(store.delete_conversation("c1"));
    assert!(store.active().is_none());
    assert!(store.conversation("c1").is_none());
    // Deleting again is a no-op.
    assert!(!store.delete_conversation("c1"));
}

#[test]
fn conversation_flags() {
    let mut store = ConversationStore::new("me");
    store.add_message(incoming("m1", "c1", "hi"));
    store.set_active("c1");

    assert!(store.pin_conversation("c1", true));
    assert!(store.conversation("c1").unwrap().is_pinned);

    assert!(store.mark_conversation_unread("c1"));
    assert!(store.conversation("c1").unwrap().is_unread);

    // Unknown conversations are not created implicitly by flag mutation.
    assert!(!store.pin_conversation("nope", true));
}

#[test]
fn only_the_creator_may_delete_a_group() {
    let mut store = ConversationStore::new("me");
    store.upsert_group(group_fixture("c1"));

    assert!(store.delete_group("g1").is_err());
    assert!(store.group("g1").is_some());

    // Any member may leave; the conversation and metadata go away locally.
    store.leave_group("g1").unwrap();
    assert!(store.group("g1").is_none());
    assert!(store.conversation("g1").is_none());

    // Creator-owned group deletes cleanly.
    store.upsert_group(group_fixture("me"));
    store.delete_group("g1").unwrap();
    assert!(store.group("g1").is_none());
}

#[test]
fn presence_joins_onto_headers_and_members() {
    let mut store = ConversationStore::new("me");
    store.add_message(incoming("m1", "c1", "hi"));
    store.upsert_group(group_fixture("c1"));

    store.set_peer_status("c1", PresenceState::Away);
    assert_eq!(
        store.conversation("c1").unwrap().peer_status,
        PresenceState::Away
    );
    let member = store.group("g1").unwrap().member("c1").unwrap();
    assert_eq!(member.status, PresenceState::Away);
}

#[test]
fn snapshot_round_trips_shells_and_groups() {
    let mut store = ConversationStore::new("me");
    store.add_message(incoming("m1", "c1", "hi"));
    store.pin_conversation("c1", true);
    store.upsert_group(group_fixture("me"));

    let snapshot = store.snapshot();
    assert_eq!(snapshot.conversations.len(), 2);
    assert_eq!(snapshot.groups.len(), 1);

    let mut rehydrated = ConversationStore::new("me");
    rehydrated.rehydrate(&snapshot);

    let conv = rehydrated.conversation("c1").unwrap();
    assert!(conv.is_pinned);
    // Message bodies are intentionally not persisted.
    assert!(conv.messages.is_empty());
    assert!(rehydrated.group("g1").is_some());
    assert!(rehydrated.conversation("g1").unwrap().is_group);
}
