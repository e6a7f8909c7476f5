// Typing indicators. Remote signals are ephemeral: they light up per
// conversation and expire on their own if the peer never sends the stop
// signal. The local side is gated so repeated keystrokes do not resend an
// unchanged flag.

use std::collections::HashMap;
use std::time::{Duration, Instant};

pub struct TypingTracker {
    expiry: Duration,
    /// conversation id -> (is_typing, last signal seen)
    remote: HashMap<String, (bool, Instant)>,
    /// conversation id -> last flag we put on the wire
    local_sent: HashMap<String, bool>,
}

impl TypingTracker {
    pub fn new(expiry: Duration) -> Self {
        TypingTracker {
            expiry,
            remote: HashMap::new(),
            local_sent: HashMap::new(),
        }
    }

    /// Record a remote typing signal. Returns true if the visible indicator
    /// for the conversation changed.
    pub fn apply_remote(&mut self, conversation_id: &str, is_typing: bool, now: Instant) -> bool {
        let previous = self.is_typing(conversation_id, now);
        self.remote
            .insert(conversation_id.to_string(), (is_typing, now));
        previous != is_typing
    }

    /// Whether the counterpart of a conversation is typing right now.
    /// Stale indicators read as false.
    pub fn is_typing(&self, conversation_id: &str, now: Instant) -> bool {
        match self.remote.get(conversation_id) {
            Some((true, at)) => now.duration_since(*at) < self.expiry,
            _ => false,
        }
    }

    /// Expire stale indicators; returns the conversations whose indicator
    /// just went dark so the UI can be told.
    pub fn sweep(&mut self, now: Instant) -> Vec<String> {
        let expiry = self.expiry;
        let mut expired = Vec::new();
        for (id, (typing, at)) in self.remote.iter_mut() {
            if *typing && now.duration_since(*at) >= expiry {
                *typing = false;
                expired.push(id.clone());
            }
        }
        expired
    }

    /// Gate for the local echo: true when the flag differs from the last
    /// one sent for this conversation.
    pub fn should_send_local(&mut self, conversation_id: &str, is_typing: bool) -> bool {
        if self.local_sent.get(conversation_id) == Some(&is_typing) {
            return false;
        }
        self.local_sent
            .insert(conversation_id.to_string(), is_typing);
        true
    }

    pub fn forget_conversation(&mut self, conversation_id: &str) {
        self.remote.remove(conversation_id);
        self.local_sent.remove(conversation_id);
    }
}
