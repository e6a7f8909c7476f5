// Realtime sync engine for Wavechat.
// This module ties the connection manager, codec, conversation store,
// presence tracker, and typing tracker into one client with an explicit
// initialize/cleanup lifecycle. The UI layer subscribes to updates and
// errors through channels and drives the engine through intent methods.

use anyhow::{anyhow, Result};
use log::{debug, error, info, warn};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub mod codec;
pub mod connection;
pub mod error;
pub mod presence;
pub mod store;
pub mod typing;

pub use codec::{Decoded, ReactionAction, WireEvent, WireFrame};
pub use connection::{ConnectionManager, ConnectionState, ConnectionStatus, ReconnectPolicy};
pub use error::SyncError;
pub use presence::PresenceTracker;
pub use store::{AddMessageResult, ConversationStore, StoreEffect};
pub use typing::TypingTracker;

use crate::auth::{AttachmentStore, AttachmentUpload, TokenProvider};
use crate::cache;
use crate::config::SyncConfig;
use crate::models::{Conversation, DeliveryStatus, Group, Message, PresenceState};
use crate::utils::now_millis;

/// Change notifications delivered to UI subscribers.
#[derive(Debug, Clone)]
pub enum StoreUpdate {
    MessageAdded {
        conversation_id: String,
        message: Message,
    },
    MessageUpdated {
        conversation_id: String,
        message: Message,
    },
    ConversationChanged {
        conversation_id: String,
    },
    ConversationRemoved {
        conversation_id: String,
    },
    /// A conversation shell was created with no history; the outer layer
    /// should fetch it.
    HistoryNeeded {
        conversation_id: String,
    },
    TypingChanged {
        conversation_id: String,
        is_typing: bool,
    },
    PresenceChanged {
        user_id: String,
        state: PresenceState,
    },
}

/// Fan-out list of mpsc senders. Closed subscribers are pruned on the next
/// notify; a full channel is unusual but not fatal.
pub struct SubscriberHub<T> {
    senders: Arc<StdMutex<Vec<mpsc::Sender<T>>>>,
}

impl<T> Clone for SubscriberHub<T> {
    fn clone(&self) -> Self {
        SubscriberHub {
            senders: self.senders.clone(),
        }
    }
}

impl<T: Clone> SubscriberHub<T> {
    pub fn new() -> Self {
        SubscriberHub {
            senders: Arc::new(StdMutex::new(Vec::new())),
        }
    }

    pub fn subscribe(&self) -> mpsc::Receiver<T> {
        let (tx, rx) = mpsc::channel(100);
        self.senders.lock().unwrap().push(tx);
        rx
    }

    pub fn notify(&self, value: T) {
        let mut senders = self.senders.lock().unwrap();
        let mut to_remove = Vec::new();
        for (i, tx) in senders.iter().enumerate() {
            if let Err(e) = tx.try_send(value.clone()) {
                match e {
                    mpsc::error::TrySendError::Closed(_) => to_remove.push(i),
                    mpsc::error::TrySendError::Full(_) => {
                        warn!("Subscriber channel full; dropping notification")
                    }
                }
            }
        }
        for i in to_remove.into_iter().rev() {
            senders.remove(i);
        }
    }
}

impl<T: Clone> Default for SubscriberHub<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// The shared halves of the engine, cloned into background tasks.
#[derive(Clone)]
struct EngineCtx {
    local_user_id: String,
    connection: ConnectionManager,
    store: Arc<StdMutex<ConversationStore>>,
    presence: Arc<StdMutex<PresenceTracker>>,
    typing: Arc<StdMutex<TypingTracker>>,
    uploads: Arc<dyn AttachmentStore>,
    updates: SubscriberHub<StoreUpdate>,
    errors: SubscriberHub<SyncError>,
}

impl EngineCtx {
    async fn transmit(&self, frame: &WireFrame) {
        match codec::frame_to_text(frame) {
            Ok(text) => {
                if let Err(e) = self.connection.send(text).await {
                    warn!("Failed to transmit {} frame: {}", frame.kind, e);
                }
            }
            Err(e) => self.errors.notify(e),
        }
    }

    /// Carry out the side effects a store mutation asked for.
    async fn perform_effects(&self, effects: Vec<StoreEffect>) {
        for effect in effects {
            match effect {
                StoreEffect::SendDeliveryReceipt { to, message_id } => {
                    let frame =
                        codec::encode_delivery_receipt(&self.local_user_id, &to, &message_id);
                    self.transmit(&frame).await;
                }
                StoreEffect::SendReadReceipt { to, message_id } => {
                    let frame = codec::encode_read_receipt(&self.local_user_id, &to, &message_id);
                    self.transmit(&frame).await;
                }
                StoreEffect::FetchHistory { conversation_id } => {
                    self.updates.notify(StoreUpdate::HistoryNeeded { conversation_id });
                }
            }
        }
    }

    async fn broadcast_presence(&self, state: PresenceState) {
        let frame = codec::encode_presence(&self.local_user_id, state);
        self.transmit(&frame).await;
    }

    /// Apply one decoded wire event to the local model. Locks are released
    /// before any transmission.
    async fn apply_event(&self, event: WireEvent) {
        match event {
            WireEvent::Message {
                id,
                from,
                to,
                text,
                timestamp,
                attachments,
                reply_to,
            } => {
                let mut msg = Message::new(id, from, to, text, timestamp);
                // An incoming message has, by arriving, been delivered here.
                msg.status = DeliveryStatus::Delivered;
                msg.attachments = attachments;
                msg.reply_to = reply_to;

                let result = { self.store.lock().unwrap().add_message(msg.clone()) };
                if result.added {
                    let message = self
                        .with_store(|s| {
                            s.conversation(&result.conversation_id)
                                .and_then(|c| c.messages.iter().find(|m| m.id == msg.id).cloned())
                        })
                        .unwrap_or(msg);
                    self.updates.notify(StoreUpdate::MessageAdded {
                        conversation_id: result.conversation_id.clone(),
                        message,
                    });
                }
                self.perform_effects(result.effects).await;
            }
            WireEvent::Typing { from, to, is_typing } => {
                let (conversation_id, changed) = {
                    let store = self.store.lock().unwrap();
                    let (key, _) = store.conversation_key_for(&from, &to);
                    let changed = self
                        .typing
                        .lock()
                        .unwrap()
                        .apply_remote(&key, is_typing, Instant::now());
                    (key, changed)
                };
                if changed {
                    self.updates.notify(StoreUpdate::TypingChanged {
                        conversation_id,
                        is_typing,
                    });
                }
            }
            WireEvent::Status { message_id, status } => {
                self.apply_status(&message_id, status);
            }
            WireEvent::DeliveryReceipt { message_id, .. } => {
                self.apply_status(&message_id, DeliveryStatus::Delivered);
            }
            WireEvent::ReadReceipt { message_id, .. } => {
                self.apply_status(&message_id, DeliveryStatus::Read);
            }
            WireEvent::Presence { user_id, state } => {
                let changed = { self.presence.lock().unwrap().apply_remote(&user_id, state) };
                if changed {
                    self.store.lock().unwrap().set_peer_status(&user_id, state);
                    self.updates
                        .notify(StoreUpdate::PresenceChanged { user_id, state });
                }
            }
            WireEvent::Reaction {
                message_id,
                from,
                emoji,
                action,
            } => {
                let touched = {
                    self.store.lock().unwrap().apply_reaction(
                        &message_id,
                        &from,
                        &emoji,
                        action == ReactionAction::Add,
                    )
                };
                self.notify_touched(touched);
            }
            WireEvent::Edit {
                message_id,
                text,
                edited_at,
            } => {
                let touched = {
                    self.store
                        .lock()
                        .unwrap()
                        .apply_edit(&message_id, &text, edited_at)
                };
                self.notify_touched(touched);
            }
            WireEvent::Delete {
                message_id,
                deleted_at,
            } => {
                let touched = {
                    self.store
                        .lock()
                        .unwrap()
                        .apply_delete(&message_id, deleted_at)
                };
                self.notify_touched(touched);
            }
            WireEvent::ServerError { message } => {
                error!("Server reported an error: {}", message);
                self.errors.notify(SyncError::Application(message));
            }
        }
    }

    fn apply_status(&self, message_id: &str, status: DeliveryStatus) {
        let touched = { self.store.lock().unwrap().update_status(message_id, status) };
        self.notify_touched(touched);
    }

    fn notify_touched(&self, touched: Option<(String, Message)>) {
        if let Some((conversation_id, message)) = touched {
            self.updates.notify(StoreUpdate::MessageUpdated {
                conversation_id,
                message,
            });
        }
    }

    fn with_store<R>(&self, f: impl FnOnce(&ConversationStore) -> R) -> R {
        f(&self.store.lock().unwrap())
    }
}

/// One engine per session. Construct, `initialize()`, use the intent
/// methods, `cleanup()` on teardown.
pub struct ChatClient {
    config: SyncConfig,
    ctx: EngineCtx,
    inbound_rx: StdMutex<Option<mpsc::Receiver<String>>>,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

impl ChatClient {
    pub fn new(
        local_user_id: impl Into<String>,
        config: SyncConfig,
        tokens: Arc<dyn TokenProvider>,
        uploads: Arc<dyn AttachmentStore>,
    ) -> Self {
        let local_user_id = local_user_id.into();
        let errors = SubscriberHub::new();
        let (inbound_tx, inbound_rx) = mpsc::channel(256);
        let connection = ConnectionManager::new(&config, tokens, inbound_tx, errors.clone());

        let ctx = EngineCtx {
            local_user_id: local_user_id.clone(),
            connection,
            store: Arc::new(StdMutex::new(ConversationStore::new(local_user_id.clone()))),
            presence: Arc::new(StdMutex::new(PresenceTracker::new(
                local_user_id,
                &config,
                Instant::now(),
            ))),
            typing: Arc::new(StdMutex::new(TypingTracker::new(config.typing_expiry))),
            uploads,
            updates: SubscriberHub::new(),
            errors,
        };

        ChatClient {
            config,
            ctx,
            inbound_rx: StdMutex::new(Some(inbound_rx)),
            tasks: StdMutex::new(Vec::new()),
        }
    }

    pub fn local_user_id(&self) -> &str {
        &self.ctx.local_user_id
    }

    /// Bring the session up: rehydrate the cache, start the dispatch loop
    /// and timers, and open the connection. Connectivity failures are left
    /// to the reconnect policy; only a missing dispatch channel is fatal.
    pub async fn initialize(&self) -> Result<()> {
        match cache::load_snapshot() {
            Ok(Some(snapshot)) => self.ctx.store.lock().unwrap().rehydrate(&snapshot),
            Ok(None) => debug!("No session cache to rehydrate"),
            Err(e) => warn!("Failed to load session cache: {}", e),
        }

        let inbound_rx = self
            .inbound_rx
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| anyhow!("client already initialized"))?;
        self.spawn_dispatch(inbound_rx);
        self.spawn_ticker();
        self.spawn_health_check();

        if let Err(e) = self.ctx.connection.connect().await {
            // Auth errors have already been surfaced; network errors are
            // being retried with backoff.
            warn!("Initial connect did not complete: {}", e);
        } else {
            let broadcast = {
                self.ctx
                    .presence
                    .lock()
                    .unwrap()
                    .force_broadcast(Instant::now())
            };
            if let Some(state) = broadcast {
                self.ctx.broadcast_presence(state).await;
            }
        }
        info!("Chat client initialized for {}", self.ctx.local_user_id);
        Ok(())
    }

    fn spawn_dispatch(&self, mut inbound_rx: mpsc::Receiver<String>) {
        let ctx = self.ctx.clone();
        let handle = tokio::spawn(async move {
            while let Some(raw) = inbound_rx.recv().await {
                match codec::decode_frame(&raw) {
                    Ok(Decoded::Event(event)) => ctx.apply_event(event).await,
                    Ok(Decoded::Keepalive) | Ok(Decoded::Ignored) => {}
                    Ok(Decoded::Dropped { reason }) => {
                        debug!("Inbound event dropped: {}", reason)
                    }
                    Err(e) => {
                        warn!("{}", e);
                        ctx.errors.notify(e);
                    }
                }
            }
            debug!("Dispatch task ended");
        });
        self.tasks.lock().unwrap().push(handle);
    }

    /// One-second driver for the idle timer, presence refresh, and typing
    /// indicator expiry.
    fn spawn_ticker(&self) {
        let ctx = self.ctx.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(1));
            loop {
                ticker.tick().await;
                let now = Instant::now();

                let broadcast = { ctx.presence.lock().unwrap().tick(now) };
                if let Some(state) = broadcast {
                    if ctx.connection.status().state == ConnectionState::Connected {
                        ctx.broadcast_presence(state).await;
                    }
                }

                let expired = { ctx.typing.lock().unwrap().sweep(now) };
                for conversation_id in expired {
                    ctx.updates.notify(StoreUpdate::TypingChanged {
                        conversation_id,
                        is_typing: false,
                    });
                }
            }
        });
        self.tasks.lock().unwrap().push(handle);
    }

    /// Periodically verify the socket actually answers; a connection that
    /// claims to be open but fails the round-trip is torn down and redialed,
    /// and presence is re-announced afterwards since server-side state is
    /// not trusted across a reconnect.
    fn spawn_health_check(&self) {
        let ctx = self.ctx.clone();
        let interval = self.config.health_check_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if ctx.connection.status().state != ConnectionState::Connected {
                    continue;
                }
                if ctx.connection.test_connection().await {
                    continue;
                }
                if let Err(e) = ctx.connection.force_repair().await {
                    warn!("Connection repair failed: {}", e);
                    continue;
                }
                let broadcast = {
                    ctx.presence
                        .lock()
                        .unwrap()
                        .force_broadcast(Instant::now())
                };
                if let Some(state) = broadcast {
                    ctx.broadcast_presence(state).await;
                }
            }
        });
        self.tasks.lock().unwrap().push(handle);
    }

    // Subscriptions

    pub fn subscribe_updates(&self) -> mpsc::Receiver<StoreUpdate> {
        self.ctx.updates.subscribe()
    }

    pub fn subscribe_errors(&self) -> mpsc::Receiver<SyncError> {
        self.ctx.errors.subscribe()
    }

    // Connection surface

    pub fn connection_status(&self) -> ConnectionStatus {
        self.ctx.connection.status()
    }

    pub async fn connect(&self) -> Result<()> {
        self.ctx.connection.connect().await
    }

    pub async fn disconnect(&self) -> Result<()> {
        self.ctx.connection.disconnect().await
    }

    pub async fn test_connection(&self) -> bool {
        self.ctx.connection.test_connection().await
    }

    // Messaging intents

    /// Optimistic send: the message is appended and announced immediately
    /// with `Sent` status; attachments upload in the background and never
    /// block the pending state.
    pub async fn send_message(
        &self,
        to: &str,
        text: &str,
        attachments: Vec<AttachmentUpload>,
        reply_to: Option<String>,
    ) -> Result<Message> {
        let msg = {
            self.ctx
                .store
                .lock()
                .unwrap()
                .begin_outgoing(to, text, reply_to)
        };
        self.ctx.updates.notify(StoreUpdate::MessageAdded {
            conversation_id: msg.recipient_id.clone(),
            message: msg.clone(),
        });

        if attachments.is_empty() {
            let frame = codec::encode_message(&self.ctx.local_user_id, &msg);
            self.ctx.transmit(&frame).await;
        } else {
            let ctx = self.ctx.clone();
            let pending = msg.clone();
            tokio::spawn(async move {
                Self::upload_and_send(ctx, pending, attachments).await;
            });
        }
        Ok(msg)
    }

    /// Background half of an attachment send. Upload failure aborts the
    /// send and flips the local message to Failed instead of letting it
    /// silently disappear; a result for a conversation that no longer
    /// exists is discarded.
    async fn upload_and_send(ctx: EngineCtx, msg: Message, attachments: Vec<AttachmentUpload>) {
        let mut uploaded = Vec::with_capacity(attachments.len());
        for upload in attachments {
            let name = upload.name.clone();
            match ctx.uploads.upload(upload, None).await {
                Ok(attachment) => uploaded.push(attachment),
                Err(e) => {
                    error!("Attachment upload failed for '{}': {}", name, e);
                    let touched = {
                        ctx.store
                            .lock()
                            .unwrap()
                            .update_status(&msg.id, DeliveryStatus::Failed)
                    };
                    if let Some((conversation_id, message)) = touched {
                        ctx.updates.notify(StoreUpdate::MessageUpdated {
                            conversation_id,
                            message,
                        });
                    }
                    ctx.errors
                        .notify(SyncError::Upload(format!("'{}': {}", name, e)));
                    return;
                }
            }
        }

        let complete = {
            let mut store = ctx.store.lock().unwrap();
            if store.conversation(&msg.recipient_id).is_none() {
                debug!("Discarding upload result; conversation {} is gone", msg.recipient_id);
                return;
            }
            store.set_attachments(&msg.id, uploaded)
        };
        let Some((conversation_id, message)) = complete else {
            debug!("Discarding upload result; message {} is gone", msg.id);
            return;
        };
        ctx.updates.notify(StoreUpdate::MessageUpdated {
            conversation_id,
            message: message.clone(),
        });
        let frame = codec::encode_message(&ctx.local_user_id, &message);
        ctx.transmit(&frame).await;
    }

    pub async fn edit_message(&self, message_id: &str, new_text: &str) -> Result<()> {
        let edited_at = now_millis();
        let touched = {
            self.ctx
                .store
                .lock()
                .unwrap()
                .apply_edit(message_id, new_text, edited_at)
        };
        let (conversation_id, message) =
            touched.ok_or_else(|| anyhow!("no editable message with id '{}'", message_id))?;
        self.ctx.updates.notify(StoreUpdate::MessageUpdated {
            conversation_id: conversation_id.clone(),
            message,
        });
        let frame = codec::encode_edit(
            &self.ctx.local_user_id,
            &conversation_id,
            message_id,
            new_text,
            edited_at,
        );
        self.ctx.transmit(&frame).await;
        Ok(())
    }

    pub async fn delete_message(&self, message_id: &str) -> Result<()> {
        let deleted_at = now_millis();
        let touched = {
            self.ctx
                .store
                .lock()
                .unwrap()
                .apply_delete(message_id, deleted_at)
        };
        let (conversation_id, message) =
            touched.ok_or_else(|| anyhow!("no message with id '{}'", message_id))?;
        self.ctx.updates.notify(StoreUpdate::MessageUpdated {
            conversation_id: conversation_id.clone(),
            message,
        });
        let frame = codec::encode_delete(
            &self.ctx.local_user_id,
            &conversation_id,
            message_id,
            deleted_at,
        );
        self.ctx.transmit(&frame).await;
        Ok(())
    }

    pub async fn react(&self, message_id: &str, emoji: &str, action: ReactionAction) -> Result<()> {
        let local_user = self.ctx.local_user_id.clone();
        let touched = {
            self.ctx.store.lock().unwrap().apply_reaction(
                message_id,
                &local_user,
                emoji,
                action == ReactionAction::Add,
            )
        };
        // An idempotent no-op still succeeds; only a missing message fails.
        let conversation_id = match touched {
            Some((conversation_id, message)) => {
                self.ctx.updates.notify(StoreUpdate::MessageUpdated {
                    conversation_id: conversation_id.clone(),
                    message,
                });
                conversation_id
            }
            None => {
                let known = self
                    .ctx
                    .with_store(|s| s.conversations().any(|c| c.contains_message(message_id)));
                if !known {
                    return Err(anyhow!("no message with id '{}'", message_id));
                }
                return Ok(());
            }
        };
        let frame = codec::encode_reaction(
            &self.ctx.local_user_id,
            &conversation_id,
            message_id,
            emoji,
            action,
        );
        self.ctx.transmit(&frame).await;
        Ok(())
    }

    /// Send a typing signal, gated so an unchanged flag is not resent.
    pub async fn set_typing(&self, conversation_id: &str, is_typing: bool) -> Result<()> {
        let should_send = {
            self.ctx
                .typing
                .lock()
                .unwrap()
                .should_send_local(conversation_id, is_typing)
        };
        if should_send {
            let frame = codec::encode_typing(&self.ctx.local_user_id, conversation_id, is_typing);
            self.ctx.transmit(&frame).await;
        }
        Ok(())
    }

    // Conversation intents

    pub async fn set_active(&self, conversation_id: &str) -> Result<()> {
        let effects = { self.ctx.store.lock().unwrap().set_active(conversation_id) };
        self.ctx.updates.notify(StoreUpdate::ConversationChanged {
            conversation_id: conversation_id.to_string(),
        });
        self.ctx.perform_effects(effects).await;
        Ok(())
    }

    pub fn clear_active(&self) {
        self.ctx.store.lock().unwrap().clear_active();
    }

    /// Page/window visibility, which gates read receipts and forces a
    /// presence transition.
    pub async fn set_visibility(&self, visible: bool) {
        self.ctx.store.lock().unwrap().set_visibility(visible);
        let broadcast = {
            self.ctx
                .presence
                .lock()
                .unwrap()
                .set_visibility(visible, Instant::now())
        };
        if let Some(state) = broadcast {
            self.ctx.broadcast_presence(state).await;
        }
    }

    /// An input event occurred; feeds the idle detector.
    pub async fn note_activity(&self) {
        let broadcast = {
            self.ctx
                .presence
                .lock()
                .unwrap()
                .note_activity(Instant::now())
        };
        if let Some(state) = broadcast {
            self.ctx.broadcast_presence(state).await;
        }
    }

    pub fn pin_conversation(&self, conversation_id: &str, pinned: bool) -> bool {
        let changed = {
            self.ctx
                .store
                .lock()
                .unwrap()
                .pin_conversation(conversation_id, pinned)
        };
        if changed {
            self.ctx.updates.notify(StoreUpdate::ConversationChanged {
                conversation_id: conversation_id.to_string(),
            });
        }
        changed
    }

    pub fn mark_conversation_unread(&self, conversation_id: &str) -> bool {
        let changed = {
            self.ctx
                .store
                .lock()
                .unwrap()
                .mark_conversation_unread(conversation_id)
        };
        if changed {
            self.ctx.updates.notify(StoreUpdate::ConversationChanged {
                conversation_id: conversation_id.to_string(),
            });
        }
        changed
    }

    pub fn delete_conversation(&self, conversation_id: &str) -> bool {
        let removed = {
            self.ctx
                .store
                .lock()
                .unwrap()
                .delete_conversation(conversation_id)
        };
        if removed {
            self.ctx.typing.lock().unwrap().forget_conversation(conversation_id);
            self.ctx.updates.notify(StoreUpdate::ConversationRemoved {
                conversation_id: conversation_id.to_string(),
            });
        }
        removed
    }

    // Group intents

    pub fn create_group(&self, group: Group) {
        let conversation_id = group.id.clone();
        self.ctx.store.lock().unwrap().upsert_group(group);
        self.ctx
            .updates
            .notify(StoreUpdate::ConversationChanged { conversation_id });
    }

    pub fn leave_group(&self, group_id: &str) -> Result<()> {
        self.ctx.store.lock().unwrap().leave_group(group_id)?;
        self.ctx.updates.notify(StoreUpdate::ConversationRemoved {
            conversation_id: group_id.to_string(),
        });
        Ok(())
    }

    pub fn delete_group(&self, group_id: &str) -> Result<()> {
        self.ctx.store.lock().unwrap().delete_group(group_id)?;
        self.ctx.updates.notify(StoreUpdate::ConversationRemoved {
            conversation_id: group_id.to_string(),
        });
        Ok(())
    }

    // Read access

    /// Run a closure against the store without cloning the whole model.
    pub fn with_store<R>(&self, f: impl FnOnce(&ConversationStore) -> R) -> R {
        self.ctx.with_store(f)
    }

    pub fn conversation(&self, id: &str) -> Option<Conversation> {
        self.ctx.with_store(|s| s.conversation(id).cloned())
    }

    pub fn local_presence(&self) -> PresenceState {
        self.ctx.presence.lock().unwrap().local_state()
    }

    pub fn presence_of(&self, user_id: &str) -> PresenceState {
        self.ctx.presence.lock().unwrap().remote(user_id)
    }

    /// Tear the session down: announce OFFLINE, persist the cache, close
    /// the socket, and cancel every timer and in-flight reconnect.
    pub async fn cleanup(&self) {
        let offline = {
            self.ctx
                .presence
                .lock()
                .unwrap()
                .teardown(Instant::now())
        };
        if self.ctx.connection.status().state == ConnectionState::Connected {
            self.ctx.broadcast_presence(offline).await;
        }

        let snapshot = { self.ctx.store.lock().unwrap().snapshot() };
        if let Err(e) = cache::save_snapshot(&snapshot) {
            warn!("Failed to persist session cache: {}", e);
        }

        if let Err(e) = self.ctx.connection.disconnect().await {
            warn!("Disconnect during cleanup failed: {}", e);
        }
        self.ctx.connection.shutdown_tasks();
        for task in self.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
        info!("Chat client cleaned up");
    }
}
