// The authoritative in-memory conversation model. Pure state machine:
// mutations return StoreEffects for the client layer to encode and
// transmit, so every contract here is testable without a socket.

use anyhow::{anyhow, Result};
use log::{debug, info, warn};
use std::collections::HashMap;

use crate::cache::{CacheSnapshot, ConversationShell};
use crate::models::{Conversation, DeliveryStatus, Group, Message, PresenceState};
use crate::utils::{client_message_id, now_millis};

/// Side effects a store mutation asks the client layer to perform.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreEffect {
    /// Acknowledge receipt of an incoming message to its conversation.
    SendDeliveryReceipt { to: String, message_id: String },
    /// Tell the counterpart the newest unread message has been read.
    SendReadReceipt { to: String, message_id: String },
    /// A conversation shell was created with no history; fetch it.
    FetchHistory { conversation_id: String },
}

/// Result of `add_message`: whether anything changed and what to transmit.
#[derive(Debug, Clone, PartialEq)]
pub struct AddMessageResult {
    pub added: bool,
    pub conversation_id: String,
    pub effects: Vec<StoreEffect>,
}

pub struct ConversationStore {
    local_user_id: String,
    conversations: HashMap<String, Conversation>,
    groups: HashMap<String, Group>,
    active: Option<String>,
    /// Whether the page/window is currently visible; gates immediate read
    /// receipts for the active conversation.
    visible: bool,
}

impl ConversationStore {
    pub fn new(local_user_id: impl Into<String>) -> Self {
        ConversationStore {
            local_user_id: local_user_id.into(),
            conversations: HashMap::new(),
            groups: HashMap::new(),
            active: None,
            visible: true,
        }
    }

    pub fn local_user_id(&self) -> &str {
        &self.local_user_id
    }

    pub fn active(&self) -> Option<&str> {
        self.active.as_deref()
    }

    pub fn set_visibility(&mut self, visible: bool) {
        self.visible = visible;
    }

    pub fn conversation(&self, id: &str) -> Option<&Conversation> {
        self.conversations.get(id)
    }

    pub fn conversations(&self) -> impl Iterator<Item = &Conversation> {
        self.conversations.values()
    }

    pub fn group(&self, id: &str) -> Option<&Group> {
        self.groups.get(id)
    }

    /// Canonical counterpart rule: the conversation key is whichever of
    /// sender/recipient is not the local user, or the group id when the
    /// recipient names a known group. Returns (key, is_group).
    pub fn conversation_key_for(&self, sender_id: &str, recipient_id: &str) -> (String, bool) {
        let recipient_is_group = self.groups.contains_key(recipient_id)
            || self
                .conversations
                .get(recipient_id)
                .map_or(false, |c| c.is_group);
        if recipient_is_group {
            (recipient_id.to_string(), true)
        } else if sender_id == self.local_user_id {
            (recipient_id.to_string(), false)
        } else {
            (sender_id.to_string(), false)
        }
    }

    fn conversation_entry(&mut self, id: &str, is_group: bool) -> &mut Conversation {
        self.conversations
            .entry(id.to_string())
            .or_insert_with(|| {
                debug!("Creating conversation shell for {}", id);
                Conversation::new(id.to_string(), is_group)
            })
    }

    /// Mark a conversation as the one currently viewed.
    ///
    /// An unseen id gets an empty shell plus a FetchHistory effect. Unread
    /// incoming messages are marked read locally and a single read receipt
    /// is emitted for the newest one only.
    pub fn set_active(&mut self, id: &str) -> Vec<StoreEffect> {
        let mut effects = Vec::new();

        if !self.conversations.contains_key(id) {
            let is_group = self.groups.contains_key(id);
            self.conversation_entry(id, is_group);
            effects.push(StoreEffect::FetchHistory {
                conversation_id: id.to_string(),
            });
        }

        self.active = Some(id.to_string());

        let local_user = self.local_user_id.clone();
        let conv = match self.conversations.get_mut(id) {
            Some(conv) => conv,
            // The shell was created above; nothing to do if it vanished.
            None => return effects,
        };
        if conv.is_unread {
            let mut newest_unread: Option<String> = None;
            for msg in conv.messages.iter_mut() {
                if msg.sender_id != local_user && msg.status != DeliveryStatus::Read {
                    msg.status = DeliveryStatus::Read;
                    newest_unread = Some(msg.id.clone());
                }
            }
            if let Some(message_id) = newest_unread {
                conv.last_read_message_id = Some(message_id.clone());
                effects.push(StoreEffect::SendReadReceipt {
                    to: id.to_string(),
                    message_id,
                });
            }
            conv.is_unread = false;
        }

        effects
    }

    pub fn clear_active(&mut self) {
        self.active = None;
    }

    /// Apply a message to its conversation. Idempotent by id: a message
    /// already present is never appended twice, which is also how the
    /// optimistic copy reconciles against the server confirmation.
    pub fn add_message(&mut self, mut msg: Message) -> AddMessageResult {
        let incoming = msg.sender_id != self.local_user_id;
        let (key, is_group) = self.conversation_key_for(&msg.sender_id, &msg.recipient_id);
        let is_active = self.active.as_deref() == Some(key.as_str());
        let visible = self.visible;

        let conv = self.conversation_entry(&key, is_group);
        if conv.contains_message(&msg.id) {
            debug!("Ignoring duplicate message {} in {}", msg.id, key);
            return AddMessageResult {
                added: false,
                conversation_id: key,
                effects: Vec::new(),
            };
        }

        let mut effects = Vec::new();
        if incoming {
            effects.push(StoreEffect::SendDeliveryReceipt {
                to: key.clone(),
                message_id: msg.id.clone(),
            });
            if is_active && visible {
                msg.status = DeliveryStatus::Read;
                conv.last_read_message_id = Some(msg.id.clone());
                effects.push(StoreEffect::SendReadReceipt {
                    to: key.clone(),
                    message_id: msg.id.clone(),
                });
            } else {
                conv.is_unread = true;
            }
        }

        conv.messages.push(msg);
        AddMessageResult {
            added: true,
            conversation_id: key,
            effects,
        }
    }

    /// Optimistic local send: append immediately with a client-generated id
    /// and `Sent` status. Attachment upload never blocks this step.
    pub fn begin_outgoing(
        &mut self,
        to: &str,
        text: impl Into<String>,
        reply_to: Option<String>,
    ) -> Message {
        let (key, is_group) = self.conversation_key_for(&self.local_user_id, to);
        let mut msg = Message::new(
            client_message_id(),
            self.local_user_id.clone(),
            key.clone(),
            text.into(),
            now_millis(),
        );
        msg.status = DeliveryStatus::Sent;
        msg.reply_to = reply_to;

        let conv = self.conversation_entry(&key, is_group);
        conv.messages.push(msg.clone());
        msg
    }

    fn find_message_mut(&mut self, message_id: &str) -> Option<(String, &mut Message)> {
        for (id, conv) in self.conversations.iter_mut() {
            if let Some(msg) = conv.message_mut(message_id) {
                return Some((id.clone(), msg));
            }
        }
        None
    }

    /// Monotonic status update. Returns the touched (conversation id,
    /// message) when the status actually changed.
    pub fn update_status(
        &mut self,
        message_id: &str,
        status: DeliveryStatus,
    ) -> Option<(String, Message)> {
        let (conv_id, msg) = self.find_message_mut(message_id)?;
        if !msg.status.can_transition(status) {
            debug!(
                "Rejecting status regression {} -> {} on {}",
                msg.status.as_str(),
                status.as_str(),
                message_id
            );
            return None;
        }
        if msg.status == status {
            return None;
        }
        info!(
            "Message {} status {} -> {}",
            message_id,
            msg.status.as_str(),
            status.as_str()
        );
        msg.status = status;
        Some((conv_id, msg.clone()))
    }

    /// Idempotent reaction set update.
    pub fn apply_reaction(
        &mut self,
        message_id: &str,
        user_id: &str,
        emoji: &str,
        add: bool,
    ) -> Option<(String, Message)> {
        let (conv_id, msg) = self.find_message_mut(message_id)?;
        let changed = if add {
            msg.add_reaction(user_id, emoji)
        } else {
            msg.remove_reaction(user_id, emoji)
        };
        if changed {
            Some((conv_id, msg.clone()))
        } else {
            None
        }
    }

    /// Attach the uploaded blob descriptors to an optimistic message once
    /// the external store confirms them.
    pub fn set_attachments(
        &mut self,
        message_id: &str,
        attachments: Vec<crate::models::Attachment>,
    ) -> Option<(String, Message)> {
        let (conv_id, msg) = self.find_message_mut(message_id)?;
        if msg.is_deleted {
            return None;
        }
        msg.attachments = attachments;
        Some((conv_id, msg.clone()))
    }

    /// Apply a confirmed edit over the local record, regardless of whether
    /// the edit originated locally or remotely.
    pub fn apply_edit(
        &mut self,
        message_id: &str,
        text: &str,
        edited_at: u64,
    ) -> Option<(String, Message)> {
        let (conv_id, msg) = self.find_message_mut(message_id)?;
        if msg.is_deleted {
            debug!("Ignoring edit of deleted message {}", message_id);
            return None;
        }
        msg.apply_edit(text.to_string(), edited_at);
        Some((conv_id, msg.clone()))
    }

    /// Apply a confirmed delete: tombstone text, cleared attachments.
    pub fn apply_delete(&mut self, message_id: &str, deleted_at: u64) -> Option<(String, Message)> {
        let (conv_id, msg) = self.find_message_mut(message_id)?;
        msg.tombstone(deleted_at);
        Some((conv_id, msg.clone()))
    }

    pub fn pin_conversation(&mut self, id: &str, pinned: bool) -> bool {
        match self.conversations.get_mut(id) {
            Some(conv) => {
                conv.is_pinned = pinned;
                true
            }
            None => false,
        }
    }

    pub fn mark_conversation_unread(&mut self, id: &str) -> bool {
        match self.conversations.get_mut(id) {
            Some(conv) => {
                conv.is_unread = true;
                true
            }
            None => false,
        }
    }

    /// Remove a conversation entirely; clears the active reference if it
    /// pointed there.
    pub fn delete_conversation(&mut self, id: &str) -> bool {
        let removed = self.conversations.remove(id).is_some();
        if removed && self.active.as_deref() == Some(id) {
            self.active = None;
        }
        removed
    }

    /// Join a remote presence update onto conversation headers and group
    /// member lists.
    pub fn set_peer_status(&mut self, user_id: &str, state: PresenceState) {
        if let Some(conv) = self.conversations.get_mut(user_id) {
            if !conv.is_group {
                conv.peer_status = state;
            }
        }
        for group in self.groups.values_mut() {
            for member in group.members.iter_mut() {
                if member.user_id == user_id {
                    member.status = state;
                }
            }
        }
    }

    // Group operations. Metadata lives in a separate table keyed by group
    // id; the conversation itself is keyed the same way.

    pub fn upsert_group(&mut self, group: Group) {
        let id = group.id.clone();
        self.groups.insert(id.clone(), group);
        self.conversation_entry(&id, true);
    }

    /// Any member may leave: drops the membership, the metadata, and the
    /// local conversation.
    pub fn leave_group(&mut self, group_id: &str) -> Result<()> {
        let group = self
            .groups
            .get_mut(group_id)
            .ok_or_else(|| anyhow!("unknown group '{}'", group_id))?;
        if !group.is_member(&self.local_user_id) {
            return Err(anyhow!("not a member of group '{}'", group_id));
        }
        let local_user = self.local_user_id.clone();
        group.members.retain(|m| m.user_id != local_user);
        self.groups.remove(group_id);
        self.delete_conversation(group_id);
        info!("Left group {}", group_id);
        Ok(())
    }

    /// Only the creator may delete a group outright.
    pub fn delete_group(&mut self, group_id: &str) -> Result<()> {
        let group = self
            .groups
            .get(group_id)
            .ok_or_else(|| anyhow!("unknown group '{}'", group_id))?;
        if group.created_by != self.local_user_id {
            warn!(
                "Refusing group delete: {} is not the creator of {}",
                self.local_user_id, group_id
            );
            return Err(anyhow!("only the group creator may delete '{}'", group_id));
        }
        self.groups.remove(group_id);
        self.delete_conversation(group_id);
        info!("Deleted group {}", group_id);
        Ok(())
    }

    // Session cache: shells plus group metadata, no message bodies.

    pub fn snapshot(&self) -> CacheSnapshot {
        CacheSnapshot {
            conversations: self
                .conversations
                .values()
                .map(|c| ConversationShell {
                    id: c.id.clone(),
                    is_group: c.is_group,
                    is_pinned: c.is_pinned,
                    is_unread: c.is_unread,
                    last_read_message_id: c.last_read_message_id.clone(),
                })
                .collect(),
            groups: self.groups.values().cloned().collect(),
        }
    }

    pub fn rehydrate(&mut self, snapshot: &CacheSnapshot) {
        for group in &snapshot.groups {
            self.groups.insert(group.id.clone(), group.clone());
        }
        for shell in &snapshot.conversations {
            self.conversations
                .entry(shell.id.clone())
                .or_insert_with(|| Conversation::from_shell(shell));
        }
    }
}
