// Protocol codec tests: defensive decoding, alias resolution order, and
// the encode/decode loopback symmetry.

mod common;
use common::setup_logging;

use serde_json::json;
use wavechat::models::{DeliveryStatus, Message, PresenceState};
use wavechat::sync::codec::{
    self, decode_frame, frame_to_text, Decoded, ReactionAction, WireEvent,
};
use wavechat::sync::SyncError;

fn decode(value: serde_json::Value) -> Decoded {
    decode_frame(&value.to_string()).expect("decode should not error")
}

fn expect_event(value: serde_json::Value) -> WireEvent {
    match decode(value) {
        Decoded::Event(event) => event,
        other => panic!("expected an event, got {:?}", other),
    }
}

#[test]
fn keepalive_literals_are_benign() {
    setup_logging();
    assert_eq!(decode_frame("ping").unwrap(), Decoded::Keepalive);
    assert_eq!(decode_frame("pong").unwrap(), Decoded::Keepalive);
    assert_eq!(decode_frame("  ping  ").unwrap(), Decoded::Keepalive);
}

#[test]
fn non_json_noise_is_ignored_not_an_error() {
    assert_eq!(decode_frame("not json at all").unwrap(), Decoded::Ignored);
    assert_eq!(decode_frame("<xml/>").unwrap(), Decoded::Ignored);
    // JSON scalars are noise too, just well-formed noise.
    assert_eq!(decode_frame("42").unwrap(), Decoded::Ignored);
}

#[test]
fn json_without_type_discriminator_is_malformed() {
    let err = decode_frame(r#"{"from":"c1","payload":{}}"#).unwrap_err();
    assert!(matches!(err, SyncError::Protocol(_)));

    let err = decode_frame(r#"{"type":"telepathy","payload":{}}"#).unwrap_err();
    assert!(matches!(err, SyncError::Protocol(_)));
}

#[test]
fn sender_aliases_resolve_in_precedence_order() {
    // Envelope `from` beats any payload alias.
    let event = expect_event(json!({
        "type": "message",
        "from": "envelope",
        "to": "me",
        "payload": {"id": "m1", "sender": "payload", "text": "hi"}
    }));
    match event {
        WireEvent::Message { from, .. } => assert_eq!(from, "envelope"),
        other => panic!("unexpected event {:?}", other),
    }

    // Within the payload, earlier aliases win.
    let event = expect_event(json!({
        "type": "message",
        "to": "me",
        "payload": {"id": "m1", "sender": "first", "senderId": "second", "text": "hi"}
    }));
    match event {
        WireEvent::Message { from, .. } => assert_eq!(from, "first"),
        other => panic!("unexpected event {:?}", other),
    }
}

#[test]
fn historical_field_variants_decode() {
    let event = expect_event(json!({
        "type": "message",
        "payload": {
            "msgId": "m7",
            "senderId": "c1",
            "receiverId": "me",
            "content": "legacy shape",
            "sent_at": "1700000000123",
        }
    }));
    assert_eq!(
        event,
        WireEvent::Message {
            id: "m7".to_string(),
            from: "c1".to_string(),
            to: "me".to_string(),
            text: "legacy shape".to_string(),
            timestamp: 1_700_000_000_123,
            attachments: Vec::new(),
            reply_to: None,
        }
    );
}

#[test]
fn events_with_unknown_parties_are_dropped() {
    // No sender anywhere: dropped, not applied under a wrong key.
    let decoded = decode(json!({
        "type": "message",
        "to": "me",
        "payload": {"id": "m1", "text": "orphan"}
    }));
    assert!(matches!(decoded, Decoded::Dropped { .. }));

    let decoded = decode(json!({
        "type": "message",
        "from": "c1",
        "payload": {"id": "m1", "text": "no recipient"}
    }));
    assert!(matches!(decoded, Decoded::Dropped { .. }));

    let decoded = decode(json!({
        "type": "presence",
        "payload": {"state": "online"}
    }));
    assert!(matches!(decoded, Decoded::Dropped { .. }));
}

#[test]
fn status_and_receipt_events_decode() {
    let event = expect_event(json!({
        "type": "status",
        "payload": {"id": "m1", "status": "delivered"}
    }));
    assert_eq!(
        event,
        WireEvent::Status {
            message_id: "m1".to_string(),
            status: DeliveryStatus::Delivered,
        }
    );

    let event = expect_event(json!({
        "type": "read_receipt",
        "from": "c1",
        "payload": {"id": "m1"}
    }));
    assert_eq!(
        event,
        WireEvent::ReadReceipt {
            message_id: "m1".to_string(),
            from: "c1".to_string(),
        }
    );

    // A status outside the known set is dropped, not guessed at.
    let decoded = decode(json!({
        "type": "status",
        "payload": {"id": "m1", "status": "teleported"}
    }));
    assert!(matches!(decoded, Decoded::Dropped { .. }));
}

#[test]
fn bare_typing_frames_mean_started_typing() {
    let event = expect_event(json!({
        "type": "typing",
        "from": "c1",
        "to": "me",
        "payload": {}
    }));
    assert_eq!(
        event,
        WireEvent::Typing {
            from: "c1".to_string(),
            to: "me".to_string(),
            is_typing: true,
        }
    );
}

#[test]
fn message_loopback_round_trip() {
    let mut msg = Message::new(
        "m1".to_string(),
        "me".to_string(),
        "c1".to_string(),
        "hello".to_string(),
        1_700_000_000_000,
    );
    msg.attachments.push(wavechat::models::Attachment {
        url: "https://blobs.example.com/x.png".to_string(),
        name: "x.png".to_string(),
        size: 12,
        mime_type: "image/png".to_string(),
    });

    let frame = codec::encode_message("me", &msg);
    let text = frame_to_text(&frame).unwrap();
    let event = match decode_frame(&text).unwrap() {
        Decoded::Event(event) => event,
        other => panic!("expected event, got {:?}", other),
    };

    assert_eq!(
        event,
        WireEvent::Message {
            id: "m1".to_string(),
            from: "me".to_string(),
            to: "c1".to_string(),
            text: "hello".to_string(),
            timestamp: 1_700_000_000_000,
            attachments: msg.attachments.clone(),
            reply_to: None,
        }
    );
}

#[test]
fn reply_round_trip_keeps_the_reference() {
    let mut msg = Message::new(
        "m2".to_string(),
        "me".to_string(),
        "c1".to_string(),
        "agreed".to_string(),
        1_700_000_000_500,
    );
    msg.reply_to = Some("m1".to_string());

    let frame = codec::encode_message("me", &msg);
    assert_eq!(frame.kind, "reply");

    let text = frame_to_text(&frame).unwrap();
    match decode_frame(&text).unwrap() {
        Decoded::Event(WireEvent::Message { id, reply_to, .. }) => {
            assert_eq!(id, "m2");
            assert_eq!(reply_to.as_deref(), Some("m1"));
        }
        other => panic!("expected message event, got {:?}", other),
    }
}

#[test]
fn intent_encoders_round_trip() {
    // Typing
    let text = frame_to_text(&codec::encode_typing("me", "c1", false)).unwrap();
    assert_eq!(
        decode_frame(&text).unwrap(),
        Decoded::Event(WireEvent::Typing {
            from: "me".to_string(),
            to: "c1".to_string(),
            is_typing: false,
        })
    );

    // Reaction
    let text = frame_to_text(&codec::encode_reaction(
        "me",
        "c1",
        "m1",
        "👍",
        ReactionAction::Add,
    ))
    .unwrap();
    assert_eq!(
        decode_frame(&text).unwrap(),
        Decoded::Event(WireEvent::Reaction {
            message_id: "m1".to_string(),
            from: "me".to_string(),
            emoji: "👍".to_string(),
            action: ReactionAction::Add,
        })
    );

    // Read receipt
    let text = frame_to_text(&codec::encode_read_receipt("me", "c1", "m1")).unwrap();
    assert_eq!(
        decode_frame(&text).unwrap(),
        Decoded::Event(WireEvent::ReadReceipt {
            message_id: "m1".to_string(),
            from: "me".to_string(),
        })
    );

    // Presence
    let text = frame_to_text(&codec::encode_presence("me", PresenceState::Away)).unwrap();
    assert_eq!(
        decode_frame(&text).unwrap(),
        Decoded::Event(WireEvent::Presence {
            user_id: "me".to_string(),
            state: PresenceState::Away,
        })
    );

    // Edit
    let text = frame_to_text(&codec::encode_edit("me", "c1", "m1", "fixed", 1_700_000_001_000))
        .unwrap();
    assert_eq!(
        decode_frame(&text).unwrap(),
        Decoded::Event(WireEvent::Edit {
            message_id: "m1".to_string(),
            text: "fixed".to_string(),
            edited_at: 1_700_000_001_000,
        })
    );

    // Delete
    let text = frame_to_text(&codec::encode_delete("me", "c1", "m1", 1_700_000_002_000)).unwrap();
    assert_eq!(
        decode_frame(&text).unwrap(),
        Decoded::Event(WireEvent::Delete {
            message_id: "m1".to_string(),
            deleted_at: 1_700_000_002_000,
        })
    );
}

#[test]
fn server_error_event_decodes_with_fallback_text() {
    let event = expect_event(json!({
        "type": "error",
        "payload": {"reason": "rate limited"}
    }));
    assert_eq!(
        event,
        WireEvent::ServerError {
            message: "rate limited".to_string(),
        }
    );

    let event = expect_event(json!({"type": "error", "payload": {}}));
    assert_eq!(
        event,
        WireEvent::ServerError {
            message: "unknown server error".to_string(),
        }
    );
}
