use serde::{Deserialize, Serialize};

/// Placeholder text substituted for the body of a deleted message.
pub const TOMBSTONE_TEXT: &str = "This message was deleted";

#[derive(Debug, Clone, PartialEq)]
pub struct Contact {
    pub id: String,
    pub name: String,
    pub status: PresenceState,
}

/// Coarse availability of a user, distinct from connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceState {
    Online,
    Away,
    Offline,
}

impl PresenceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PresenceState::Online => "online",
            PresenceState::Away => "away",
            PresenceState::Offline => "offline",
        }
    }

    pub fn from_wire(value: &str) -> Option<Self> {
        match value {
            "online" => Some(PresenceState::Online),
            "away" => Some(PresenceState::Away),
            "offline" => Some(PresenceState::Offline),
            _ => None,
        }
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Sending,   // Local message not yet handed to the connection
    Sent,      // Accepted for transmission
    Delivered, // Reached the recipient's device
    Read,      // Read by the recipient
    Failed,    // Transmission or upload failed
}

impl DeliveryStatus {
    fn rank(&self) -> u8 {
        match self {
            DeliveryStatus::Sending => 0,
            DeliveryStatus::Sent => 1,
            DeliveryStatus::Delivered => 2,
            DeliveryStatus::Read => 3,
            DeliveryStatus::Failed => 4,
        }
    }

    /// Whether a status update from `self` to `next` is allowed.
    ///
    /// Status is monotonic for a given observer: sent -> delivered -> read.
    /// `Read` and `Failed` may always overwrite; a regression such as
    /// read -> delivered is rejected.
    pub fn can_transition(&self, next: DeliveryStatus) -> bool {
        if matches!(next, DeliveryStatus::Read | DeliveryStatus::Failed) {
            return true;
        }
        next.rank() > self.rank()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Sending => "sending",
            DeliveryStatus::Sent => "sent",
            DeliveryStatus::Delivered => "delivered",
            DeliveryStatus::Read => "read",
            DeliveryStatus::Failed => "failed",
        }
    }

    pub fn from_wire(value: &str) -> Option<Self> {
        match value {
            "sending" => Some(DeliveryStatus::Sending),
            "sent" => Some(DeliveryStatus::Sent),
            "stored" | "delivered" => Some(DeliveryStatus::Delivered),
            "read" => Some(DeliveryStatus::Read),
            "failed" => Some(DeliveryStatus::Failed),
            _ => None,
        }
    }
}

/// Upload result returned by the external blob store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    pub url: String,
    pub name: String,
    pub size: u64,
    #[serde(rename = "type")]
    pub mime_type: String,
}

/// One reaction on a message. Reactions form a set keyed by (user_id, emoji).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reaction {
    pub user_id: String,
    pub emoji: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub sender_id: String,
    /// Contact id the message was addressed to, or the group id.
    pub recipient_id: String,
    pub text: String,
    /// Milliseconds since the epoch.
    pub timestamp: u64,
    pub status: DeliveryStatus,
    pub attachments: Vec<Attachment>,
    pub reply_to: Option<String>,
    pub is_edited: bool,
    pub edited_at: Option<u64>,
    pub is_deleted: bool,
    pub deleted_at: Option<u64>,
    pub reactions: Vec<Reaction>,
}

impl Message {
    pub fn new(
        id: String,
        sender_id: String,
        recipient_id: String,
        text: String,
        timestamp: u64,
    ) -> Self {
        Message {
            id,
            sender_id,
            recipient_id,
            text,
            timestamp,
            status: DeliveryStatus::Sending,
            attachments: Vec::new(),
            reply_to: None,
            is_edited: false,
            edited_at: None,
            is_deleted: false,
            deleted_at: None,
            reactions: Vec::new(),
        }
    }

    /// Apply a confirmed edit over the local record.
    pub fn apply_edit(&mut self, text: String, edited_at: u64) {
        if self.is_deleted {
            return;
        }
        self.text = text;
        self.is_edited = true;
        self.edited_at = Some(edited_at);
    }

    /// Turn the message into its tombstone state: text replaced with the
    /// fixed placeholder, attachments cleared, deletion flagged.
    pub fn tombstone(&mut self, deleted_at: u64) {
        self.text = TOMBSTONE_TEXT.to_string();
        self.attachments.clear();
        self.is_deleted = true;
        self.deleted_at = Some(deleted_at);
    }

    /// Add a reaction; adding an existing (user, emoji) pair is a no-op.
    /// Returns true if the set changed.
    pub fn add_reaction(&mut self, user_id: &str, emoji: &str) -> bool {
        if self
            .reactions
            .iter()
            .any(|r| r.user_id == user_id && r.emoji == emoji)
        {
            return false;
        }
        self.reactions.push(Reaction {
            user_id: user_id.to_string(),
            emoji: emoji.to_string(),
        });
        true
    }

    /// Remove a reaction; removing a non-existent pair is a no-op.
    /// Returns true if the set changed.
    pub fn remove_reaction(&mut self, user_id: &str, emoji: &str) -> bool {
        let before = self.reactions.len();
        self.reactions
            .retain(|r| !(r.user_id == user_id && r.emoji == emoji));
        self.reactions.len() != before
    }
}

/// A direct or group conversation. Exactly one exists per counterpart,
/// created lazily on first reference and removed only by explicit
/// delete/leave.
#[derive(Debug, Clone)]
pub struct Conversation {
    /// Counterpart contact id, or the group id for group chats.
    pub id: String,
    pub is_group: bool,
    /// Append-ordered by arrival, not necessarily by timestamp.
    pub messages: Vec<Message>,
    pub is_pinned: bool,
    pub is_unread: bool,
    pub last_read_message_id: Option<String>,
    pub peer_status: PresenceState,
}

impl Conversation {
    pub fn new(id: String, is_group: bool) -> Self {
        Conversation {
            id,
            is_group,
            messages: Vec::new(),
            is_pinned: false,
            is_unread: false,
            last_read_message_id: None,
            peer_status: PresenceState::Offline,
        }
    }

    pub fn contains_message(&self, id: &str) -> bool {
        self.messages.iter().any(|m| m.id == id)
    }

    pub fn message_mut(&mut self, id: &str) -> Option<&mut Message> {
        self.messages.iter_mut().find(|m| m.id == id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupRole {
    Admin,
    Member,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupMember {
    pub user_id: String,
    pub display_name: String,
    pub role: GroupRole,
    #[serde(default = "offline_status")]
    pub status: PresenceState,
}

fn offline_status() -> PresenceState {
    PresenceState::Offline
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Group {
    pub id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    pub created_by: String,
    pub members: Vec<GroupMember>,
}

impl Group {
    pub fn member(&self, user_id: &str) -> Option<&GroupMember> {
        self.members.iter().find(|m| m.user_id == user_id)
    }

    pub fn is_member(&self, user_id: &str) -> bool {
        self.member(user_id).is_some()
    }
}
