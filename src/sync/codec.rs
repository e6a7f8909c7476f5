// Wire protocol codec: raw websocket text frames <-> canonical events.
//
// Frames are JSON objects `{type, from, to, payload}`. Keepalives are the
// bare literals "ping"/"pong", not JSON. Decoding is defensive: noise is
// ignored, structural problems are reported through the error channel, and
// events that cannot be attributed to a known sender or recipient are
// dropped rather than applied under the wrong conversation key.

use lazy_static::lazy_static;
use log::debug;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;

use super::error::SyncError;
use crate::models::{Attachment, DeliveryStatus, Message, PresenceState};
use crate::utils::now_millis;

pub const KEEPALIVE_PING: &str = "ping";
pub const KEEPALIVE_PONG: &str = "pong";

/// Sentinel produced when no alias yields a usable id.
pub const UNKNOWN_SENTINEL: &str = "unknown";

// Ordered alias tables for fields whose names drifted across server
// versions. Resolution tries each alias in order; first non-empty match
// wins. The `from`/`to` envelope fields take precedence over payload
// aliases.
pub const SENDER_ALIASES: &[&str] = &["from", "sender", "senderId", "sender_id", "userId", "user_id"];
pub const RECIPIENT_ALIASES: &[&str] = &["to", "recipient", "receiverId", "receiver_id", "groupId", "group_id"];
pub const MESSAGE_ID_ALIASES: &[&str] = &["id", "messageId", "message_id", "msgId"];
pub const TEXT_ALIASES: &[&str] = &["text", "content", "body", "message"];
pub const TIMESTAMP_ALIASES: &[&str] = &["timestamp", "time", "sentAt", "sent_at"];
pub const REPLY_TO_ALIASES: &[&str] = &["reply_to", "replyTo", "inReplyTo"];
pub const EMOJI_ALIASES: &[&str] = &["emoji", "reaction"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Message,
    Typing,
    Status,
    DeliveryReceipt,
    ReadReceipt,
    Presence,
    Reaction,
    Reply,
    Edit,
    Delete,
    Error,
}

lazy_static! {
    /// Wire tag -> event kind. The closed set of frame types this client
    /// understands; anything else is malformed.
    static ref EVENT_KINDS: HashMap<&'static str, EventKind> = {
        let mut kinds = HashMap::new();
        kinds.insert("message", EventKind::Message);
        kinds.insert("typing", EventKind::Typing);
        kinds.insert("status", EventKind::Status);
        kinds.insert("delivery_receipt", EventKind::DeliveryReceipt);
        kinds.insert("read_receipt", EventKind::ReadReceipt);
        kinds.insert("presence", EventKind::Presence);
        kinds.insert("reaction", EventKind::Reaction);
        kinds.insert("reply", EventKind::Reply);
        kinds.insert("edit", EventKind::Edit);
        kinds.insert("delete", EventKind::Delete);
        kinds.insert("error", EventKind::Error);
        kinds
    };
}

/// The envelope every non-keepalive frame travels in.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WireFrame {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    #[serde(default)]
    pub payload: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReactionAction {
    Add,
    Remove,
}

impl ReactionAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReactionAction::Add => "add",
            ReactionAction::Remove => "remove",
        }
    }
}

/// Canonical decoded event, one variant per wire kind. `reply` frames decode
/// to `Message` with `reply_to` populated; the separate tag is historical.
#[derive(Debug, Clone, PartialEq)]
pub enum WireEvent {
    Message {
        id: String,
        from: String,
        to: String,
        text: String,
        timestamp: u64,
        attachments: Vec<Attachment>,
        reply_to: Option<String>,
    },
    Typing {
        from: String,
        to: String,
        is_typing: bool,
    },
    Status {
        message_id: String,
        status: DeliveryStatus,
    },
    DeliveryReceipt {
        message_id: String,
        from: String,
    },
    ReadReceipt {
        message_id: String,
        from: String,
    },
    Presence {
        user_id: String,
        state: PresenceState,
    },
    Reaction {
        message_id: String,
        from: String,
        emoji: String,
        action: ReactionAction,
    },
    Edit {
        message_id: String,
        text: String,
        edited_at: u64,
    },
    Delete {
        message_id: String,
        deleted_at: u64,
    },
    ServerError {
        message: String,
    },
}

/// Outcome of decoding one raw frame. Only `Event` reaches the stores;
/// everything else is benign or already reported.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    Event(WireEvent),
    /// Bare "ping"/"pong" literal.
    Keepalive,
    /// Non-JSON noise; ignored without comment.
    Ignored,
    /// Structurally valid but unattributable; not applied.
    Dropped { reason: String },
}

/// Pick the first alias that resolves to a non-empty string.
fn string_alias(payload: &Value, aliases: &[&str]) -> Option<String> {
    for alias in aliases {
        if let Some(text) = payload.get(alias).and_then(Value::as_str) {
            if !text.is_empty() {
                return Some(text.to_string());
            }
        }
    }
    None
}

/// Pick the first alias that resolves to an integer, accepting numeric
/// strings from older servers.
fn u64_alias(payload: &Value, aliases: &[&str]) -> Option<u64> {
    for alias in aliases {
        match payload.get(alias) {
            Some(Value::Number(n)) => {
                if let Some(v) = n.as_u64() {
                    return Some(v);
                }
            }
            Some(Value::String(s)) => {
                if let Ok(v) = s.parse::<u64>() {
                    return Some(v);
                }
            }
            _ => {}
        }
    }
    None
}

fn bool_alias(payload: &Value, aliases: &[&str]) -> Option<bool> {
    for alias in aliases {
        if let Some(v) = payload.get(alias).and_then(Value::as_bool) {
            return Some(v);
        }
    }
    None
}

/// Sender id: envelope `from` first, then payload aliases, then sentinel.
fn resolve_sender(frame: &WireFrame) -> String {
    if let Some(from) = frame.from.as_deref() {
        if !from.is_empty() {
            return from.to_string();
        }
    }
    string_alias(&frame.payload, SENDER_ALIASES).unwrap_or_else(|| UNKNOWN_SENTINEL.to_string())
}

/// Recipient id: envelope `to` first, then payload aliases, then sentinel.
fn resolve_recipient(frame: &WireFrame) -> String {
    if let Some(to) = frame.to.as_deref() {
        if !to.is_empty() {
            return to.to_string();
        }
    }
    string_alias(&frame.payload, RECIPIENT_ALIASES).unwrap_or_else(|| UNKNOWN_SENTINEL.to_string())
}

fn attachments_from(payload: &Value) -> Vec<Attachment> {
    payload
        .get("attachments")
        .cloned()
        .and_then(|v| serde_json::from_value::<Vec<Attachment>>(v).ok())
        .unwrap_or_default()
}

fn dropped(reason: impl Into<String>) -> Decoded {
    let reason = reason.into();
    debug!("Dropping wire event: {}", reason);
    Decoded::Dropped { reason }
}

/// Decode one raw text frame.
///
/// Errors carry `SyncError::Protocol` and are meant for the error-observer
/// channel; they must never propagate out of the socket callback as a panic.
pub fn decode_frame(raw: &str) -> Result<Decoded, SyncError> {
    let trimmed = raw.trim();

    if trimmed == KEEPALIVE_PING || trimmed == KEEPALIVE_PONG {
        return Ok(Decoded::Keepalive);
    }

    let frame: WireFrame = match serde_json::from_str::<Value>(trimmed) {
        Err(_) => {
            debug!("Ignoring non-JSON frame ({} bytes)", trimmed.len());
            return Ok(Decoded::Ignored);
        }
        Ok(value) => {
            if !value.is_object() {
                return Ok(Decoded::Ignored);
            }
            if value.get("type").and_then(Value::as_str).is_none() {
                return Err(SyncError::Protocol(
                    "frame is missing the 'type' discriminator".to_string(),
                ));
            }
            match serde_json::from_value(value) {
                Ok(frame) => frame,
                Err(e) => return Err(SyncError::Protocol(format!("bad frame shape: {}", e))),
            }
        }
    };

    let kind = match EVENT_KINDS.get(frame.kind.as_str()) {
        Some(kind) => *kind,
        None => {
            return Err(SyncError::Protocol(format!(
                "unknown event type '{}'",
                frame.kind
            )))
        }
    };

    let payload = &frame.payload;
    let event = match kind {
        EventKind::Message | EventKind::Reply => {
            let from = resolve_sender(&frame);
            let to = resolve_recipient(&frame);
            if from == UNKNOWN_SENTINEL {
                return Ok(dropped("message with unknown sender"));
            }
            if to == UNKNOWN_SENTINEL {
                return Ok(dropped("message with unknown recipient"));
            }
            let id = match string_alias(payload, MESSAGE_ID_ALIASES) {
                Some(id) => id,
                None => return Ok(dropped("message without an id")),
            };
            WireEvent::Message {
                id,
                from,
                to,
                text: string_alias(payload, TEXT_ALIASES).unwrap_or_default(),
                timestamp: u64_alias(payload, TIMESTAMP_ALIASES).unwrap_or_else(now_millis),
                attachments: attachments_from(payload),
                reply_to: string_alias(payload, REPLY_TO_ALIASES),
            }
        }
        EventKind::Typing => {
            let from = resolve_sender(&frame);
            if from == UNKNOWN_SENTINEL {
                return Ok(dropped("typing signal with unknown sender"));
            }
            WireEvent::Typing {
                from,
                to: resolve_recipient(&frame),
                // Older servers sent bare typing frames with no flag; those
                // always meant "started typing".
                is_typing: bool_alias(payload, &["isTyping", "is_typing", "typing"]).unwrap_or(true),
            }
        }
        EventKind::Status => {
            let message_id = match string_alias(payload, MESSAGE_ID_ALIASES) {
                Some(id) => id,
                None => return Ok(dropped("status event without a message id")),
            };
            let status = match payload
                .get("status")
                .and_then(Value::as_str)
                .and_then(DeliveryStatus::from_wire)
            {
                Some(status) => status,
                None => return Ok(dropped("status event with an unknown status")),
            };
            WireEvent::Status { message_id, status }
        }
        EventKind::DeliveryReceipt => {
            let message_id = match string_alias(payload, MESSAGE_ID_ALIASES) {
                Some(id) => id,
                None => return Ok(dropped("delivery receipt without a message id")),
            };
            WireEvent::DeliveryReceipt {
                message_id,
                from: resolve_sender(&frame),
            }
        }
        EventKind::ReadReceipt => {
            let message_id = match string_alias(payload, MESSAGE_ID_ALIASES) {
                Some(id) => id,
                None => return Ok(dropped("read receipt without a message id")),
            };
            WireEvent::ReadReceipt {
                message_id,
                from: resolve_sender(&frame),
            }
        }
        EventKind::Presence => {
            let user_id = resolve_sender(&frame);
            if user_id == UNKNOWN_SENTINEL {
                return Ok(dropped("presence event with unknown user"));
            }
            let state = match payload
                .get("state")
                .and_then(Value::as_str)
                .and_then(PresenceState::from_wire)
            {
                Some(state) => state,
                None => return Ok(dropped("presence event with an unknown state")),
            };
            WireEvent::Presence { user_id, state }
        }
        EventKind::Reaction => {
            let from = resolve_sender(&frame);
            if from == UNKNOWN_SENTINEL {
                return Ok(dropped("reaction with unknown sender"));
            }
            let message_id = match string_alias(payload, MESSAGE_ID_ALIASES) {
                Some(id) => id,
                None => return Ok(dropped("reaction without a message id")),
            };
            let emoji = match string_alias(payload, EMOJI_ALIASES) {
                Some(emoji) => emoji,
                None => return Ok(dropped("reaction without an emoji")),
            };
            let action = match payload.get("action").and_then(Value::as_str) {
                Some("remove") => ReactionAction::Remove,
                _ => ReactionAction::Add,
            };
            WireEvent::Reaction {
                message_id,
                from,
                emoji,
                action,
            }
        }
        EventKind::Edit => {
            let message_id = match string_alias(payload, MESSAGE_ID_ALIASES) {
                Some(id) => id,
                None => return Ok(dropped("edit without a message id")),
            };
            let text = match string_alias(payload, TEXT_ALIASES) {
                Some(text) => text,
                None => return Ok(dropped("edit without replacement text")),
            };
            WireEvent::Edit {
                message_id,
                text,
                edited_at: u64_alias(payload, &["editedAt", "edited_at"])
                    .or_else(|| u64_alias(payload, TIMESTAMP_ALIASES))
                    .unwrap_or_else(now_millis),
            }
        }
        EventKind::Delete => {
            let message_id = match string_alias(payload, MESSAGE_ID_ALIASES) {
                Some(id) => id,
                None => return Ok(dropped("delete without a message id")),
            };
            WireEvent::Delete {
                message_id,
                deleted_at: u64_alias(payload, &["deletedAt", "deleted_at"])
                    .or_else(|| u64_alias(payload, TIMESTAMP_ALIASES))
                    .unwrap_or_else(now_millis),
            }
        }
        EventKind::Error => WireEvent::ServerError {
            message: string_alias(payload, &["message", "error", "reason", "text"])
                .unwrap_or_else(|| "unknown server error".to_string()),
        },
    };

    Ok(Decoded::Event(event))
}

// Encoders. Local intents serialize into the same envelope the decoder
// consumes, so a self-sent frame round-trips to the original event.

pub fn encode_message(from: &str, msg: &Message) -> WireFrame {
    let mut payload = json!({
        "id": msg.id,
        "text": msg.text,
        "timestamp": msg.timestamp,
        "attachments": msg.attachments,
    });
    if let Some(reply_to) = &msg.reply_to {
        payload["reply_to"] = json!(reply_to);
    }
    WireFrame {
        kind: if msg.reply_to.is_some() { "reply" } else { "message" }.to_string(),
        from: Some(from.to_string()),
        to: Some(msg.recipient_id.clone()),
        payload,
    }
}

pub fn encode_typing(from: &str, to: &str, is_typing: bool) -> WireFrame {
    WireFrame {
        kind: "typing".to_string(),
        from: Some(from.to_string()),
        to: Some(to.to_string()),
        payload: json!({ "isTyping": is_typing }),
    }
}

pub fn encode_delivery_receipt(from: &str, to: &str, message_id: &str) -> WireFrame {
    WireFrame {
        kind: "delivery_receipt".to_string(),
        from: Some(from.to_string()),
        to: Some(to.to_string()),
        payload: json!({ "id": message_id }),
    }
}

pub fn encode_read_receipt(from: &str, to: &str, message_id: &str) -> WireFrame {
    WireFrame {
        kind: "read_receipt".to_string(),
        from: Some(from.to_string()),
        to: Some(to.to_string()),
        payload: json!({ "id": message_id }),
    }
}

pub fn encode_reaction(
    from: &str,
    to: &str,
    message_id: &str,
    emoji: &str,
    action: ReactionAction,
) -> WireFrame {
    WireFrame {
        kind: "reaction".to_string(),
        from: Some(from.to_string()),
        to: Some(to.to_string()),
        payload: json!({ "id": message_id, "emoji": emoji, "action": action.as_str() }),
    }
}

pub fn encode_edit(from: &str, to: &str, message_id: &str, text: &str, edited_at: u64) -> WireFrame {
    WireFrame {
        kind: "edit".to_string(),
        from: Some(from.to_string()),
        to: Some(to.to_string()),
        payload: json!({ "id": message_id, "text": text, "editedAt": edited_at }),
    }
}

pub fn encode_delete(from: &str, to: &str, message_id: &str, deleted_at: u64) -> WireFrame {
    WireFrame {
        kind: "delete".to_string(),
        from: Some(from.to_string()),
        to: Some(to.to_string()),
        payload: json!({ "id": message_id, "deletedAt": deleted_at }),
    }
}

pub fn encode_presence(from: &str, state: PresenceState) -> WireFrame {
    WireFrame {
        kind: "presence".to_string(),
        from: Some(from.to_string()),
        to: None,
        payload: json!({ "state": state.as_str() }),
    }
}

pub fn frame_to_text(frame: &WireFrame) -> Result<String, SyncError> {
    serde_json::to_string(frame).map_err(|e| SyncError::Protocol(format!("encode failed: {}", e)))
}
