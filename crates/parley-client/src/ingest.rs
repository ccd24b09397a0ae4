//! Push-event ingestion.
//!
//! Raw frames from the transport are decoded, validated and applied to the
//! store in arrival order. Events that reference a message the client has
//! not seen yet are parked in a bounded buffer and replayed once the
//! message shows up, or dropped after a short wait.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use parley_shared::protocol::{InboundEvent, IncomingMessage, ReactionAction};
use parley_shared::types::{DeliveryState, MessageId, UserId};
use parley_store::{DeliveryStateMachine, Message, MessageStore, ReactionAggregator, StoreError};

use crate::config::ClientConfig;
use crate::events::{ClientEvent, EventBus};
use crate::permission::PermissionGate;
use crate::registry::ChatRegistry;

/// What happened to a single inbound frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    Applied,
    /// Already reflected in local state.
    Duplicate,
    /// Parked until its target message arrives.
    Buffered,
    /// Well-formed but inconsistent with local state.
    Rejected,
    /// Undecodable.
    Dropped,
}

// ---------------------------------------------------------------------------
// Out-of-order buffer
// ---------------------------------------------------------------------------

struct PendingEvent {
    event: InboundEvent,
    received_at: Instant,
}

/// FIFO of events waiting for their target message.
pub struct PendingEvents {
    queue: VecDeque<PendingEvent>,
    capacity: usize,
    ttl: Duration,
}

impl PendingEvents {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            queue: VecDeque::new(),
            capacity: capacity.max(1),
            ttl,
        }
    }

    /// Park an event. When full, the oldest entry is evicted and returned.
    fn push(&mut self, event: InboundEvent, now: Instant) -> Option<InboundEvent> {
        let evicted = if self.queue.len() >= self.capacity {
            self.queue.pop_front().map(|p| p.event)
        } else {
            None
        };
        self.queue.push_back(PendingEvent {
            event,
            received_at: now,
        });
        evicted
    }

    /// Remove, in arrival order, every event whose target now exists.
    fn take_ready(&mut self, store: &MessageStore) -> Vec<InboundEvent> {
        if self.queue.is_empty() {
            return Vec::new();
        }
        let mut ready = Vec::new();
        let mut waiting = VecDeque::with_capacity(self.queue.len());
        for pending in self.queue.drain(..) {
            let known = pending
                .event
                .target_message()
                .map_or(true, |id| store.contains(id));
            if known {
                ready.push(pending.event);
            } else {
                waiting.push_back(pending);
            }
        }
        self.queue = waiting;
        ready
    }

    /// Drop entries that waited longer than the ttl.
    fn expire(&mut self, now: Instant) -> Vec<InboundEvent> {
        let ttl = self.ttl;
        let mut expired = Vec::new();
        self.queue.retain(|pending| {
            if now.saturating_duration_since(pending.received_at) > ttl {
                expired.push(pending.event.clone());
                false
            } else {
                true
            }
        });
        expired
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Ingest
// ---------------------------------------------------------------------------

pub struct RealtimeIngest {
    local_user: UserId,
    store: Arc<MessageStore>,
    delivery: DeliveryStateMachine,
    reactions: ReactionAggregator,
    registry: Arc<ChatRegistry>,
    gate: PermissionGate,
    bus: EventBus,
    pending: Mutex<PendingEvents>,
    tick_interval: Duration,
}

impl RealtimeIngest {
    pub fn new(
        config: &ClientConfig,
        store: Arc<MessageStore>,
        registry: Arc<ChatRegistry>,
        gate: PermissionGate,
        bus: EventBus,
    ) -> Self {
        Self {
            local_user: config.user_id.clone(),
            delivery: DeliveryStateMachine::new(store.clone()),
            reactions: ReactionAggregator::new(store.clone()),
            store,
            registry,
            gate,
            bus,
            pending: Mutex::new(PendingEvents::new(
                config.pending_event_capacity,
                config.pending_event_ttl,
            )),
            tick_interval: config.pending_event_tick,
        }
    }

    /// Receive loop for one push connection. Returns when the sender side
    /// closes.
    pub async fn run(&self, mut rx: mpsc::Receiver<String>) {
        let mut ticker = tokio::time::interval(self.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!("Realtime ingest started");

        loop {
            tokio::select! {
                frame = rx.recv() => match frame {
                    Some(raw) => {
                        self.on_event(&raw).await;
                    }
                    None => break,
                },
                _ = ticker.tick() => self.tick(),
            }
        }

        info!(buffered = self.pending_len(), "Realtime ingest stopped");
    }

    /// Decode and apply a single raw frame.
    pub async fn on_event(&self, raw: &str) -> IngestOutcome {
        let event = match InboundEvent::decode(raw) {
            Ok(event) => event,
            Err(e) => {
                warn!(error = %e, "Dropping malformed push event");
                return IngestOutcome::Dropped;
            }
        };

        // Earlier parked events whose target has since appeared (for
        // example through a send acknowledgement) go first.
        self.flush_ready();

        let outcome = self.apply(event).await;
        if outcome == IngestOutcome::Applied {
            self.flush_ready();
        }
        outcome
    }

    /// Replay ready buffered events and expire stale ones.
    pub fn tick(&self) {
        self.tick_at(Instant::now());
    }

    pub fn tick_at(&self, now: Instant) {
        self.flush_ready();
        let expired = self.pending().expire(now);
        for event in expired {
            warn!(
                target_msg = ?event.target_message(),
                chat = ?event.chat_id(),
                "Buffered event expired before its message arrived"
            );
        }
    }

    pub fn pending_len(&self) -> usize {
        self.pending().len()
    }

    fn pending(&self) -> MutexGuard<'_, PendingEvents> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn flush_ready(&self) {
        let ready = self.pending().take_ready(&self.store);
        for event in ready {
            let outcome = self.apply_targeted(event);
            debug!(?outcome, "Replayed buffered event");
        }
    }

    async fn apply(&self, event: InboundEvent) -> IngestOutcome {
        match event {
            InboundEvent::Message(incoming) => self.apply_message(incoming),
            InboundEvent::Presence { user_id, online } => {
                if self.registry.set_online(&user_id, online) {
                    debug!(user = %user_id, online, "Presence changed");
                    self.bus.emit(ClientEvent::PresenceChanged { user_id, online });
                    IngestOutcome::Applied
                } else {
                    IngestOutcome::Duplicate
                }
            }
            InboundEvent::Connection { peer_id } => {
                self.gate.invalidate(&peer_id).await;
                info!(peer = %peer_id, "Connection changed, permission will be re-evaluated");
                self.bus.emit(ClientEvent::PermissionChanged { peer_id });
                IngestOutcome::Applied
            }
            targeted => {
                let Some(target) = targeted.target_message() else {
                    return self.apply_targeted(targeted);
                };
                if self.store.contains(target) {
                    return self.apply_targeted(targeted);
                }
                self.buffer(targeted)
            }
        }
    }

    fn buffer(&self, event: InboundEvent) -> IngestOutcome {
        debug!(
            target_msg = ?event.target_message(),
            chat = ?event.chat_id(),
            "Target message unknown, buffering event"
        );
        let evicted = self.pending().push(event, Instant::now());
        if let Some(evicted) = evicted {
            warn!(
                target_msg = ?evicted.target_message(),
                "Pending event buffer full, evicted oldest entry"
            );
        }
        IngestOutcome::Buffered
    }

    fn apply_message(&self, incoming: IncomingMessage) -> IngestOutcome {
        if incoming.sender_id == self.local_user {
            // Acknowledgement already reconciled this one.
            if self.store.contains(&incoming.message_id) {
                debug!(msg_id = %incoming.message_id, "Echo of confirmed message ignored");
                return IngestOutcome::Duplicate;
            }
            if let Some(provisional_id) = self.pending_echo(&incoming) {
                return self.reconcile_echo(provisional_id, incoming);
            }
        }

        let delivery = if incoming.sender_id == self.local_user {
            DeliveryState::Sent
        } else {
            DeliveryState::Delivered
        };
        let message = Message::from_incoming(incoming, delivery);
        let chat_id = message.chat_id.clone();
        let message_id = message.id.clone();

        if !self.registry.contains(&chat_id) {
            debug!(chat = %chat_id, "Message for unregistered chat");
        }
        if self.store.append(message) {
            self.bus.emit(ClientEvent::NewMessage {
                chat_id,
                message_id,
            });
            IngestOutcome::Applied
        } else {
            IngestOutcome::Duplicate
        }
    }

    /// Placeholder matching a pushed echo of a local send. An explicit
    /// client id is authoritative; content matching is the fallback for
    /// servers that do not echo it.
    fn pending_echo(&self, incoming: &IncomingMessage) -> Option<MessageId> {
        match incoming.client_id {
            Some(client_id) => {
                let id = MessageId::Provisional(client_id);
                self.store.contains(&id).then_some(id)
            }
            None => self.store.find_pending_echo(
                &incoming.chat_id,
                &incoming.sender_id,
                &incoming.content,
                incoming.message_type,
            ),
        }
    }

    fn reconcile_echo(&self, provisional_id: MessageId, incoming: IncomingMessage) -> IngestOutcome {
        let chat_id = incoming.chat_id.clone();
        let message_id = incoming.message_id.clone();
        // Swapped in already `sent`, under the same chat lock as the removal
        // of the placeholder.
        let confirmed = Message::from_incoming(incoming, DeliveryState::Sent);

        if !self.store.replace_provisional(&provisional_id, confirmed) {
            return IngestOutcome::Duplicate;
        }
        info!(msg_id = %provisional_id, final_id = %message_id, "Provisional message confirmed by echo");
        self.bus.emit(ClientEvent::MessageReconciled {
            chat_id: chat_id.clone(),
            provisional_id,
            message_id: message_id.clone(),
        });
        if let Some(state) = self.delivery.state(&message_id) {
            self.bus.emit(ClientEvent::DeliveryChanged {
                chat_id,
                message_id,
                state,
            });
        }
        IngestOutcome::Applied
    }

    /// Reactions, receipts and edits against a message already in the
    /// store.
    fn apply_targeted(&self, event: InboundEvent) -> IngestOutcome {
        if let (Some(target), Some(chat_id)) = (event.target_message(), event.chat_id()) {
            if let Some(owner) = self.store.chat_of(target) {
                if owner != *chat_id {
                    warn!(msg_id = %target, claimed = %chat_id, actual = %owner, "Event chat does not match message, rejected");
                    return IngestOutcome::Rejected;
                }
            }
        }

        match event {
            InboundEvent::Receipt {
                chat_id,
                message_id,
                state,
            } => {
                if self.delivery.state(&message_id) == Some(state) {
                    return IngestOutcome::Duplicate;
                }
                if self.delivery.transition(&message_id, state) {
                    self.bus.emit(ClientEvent::DeliveryChanged {
                        chat_id,
                        message_id,
                        state,
                    });
                    IngestOutcome::Applied
                } else {
                    IngestOutcome::Rejected
                }
            }
            InboundEvent::Reaction {
                chat_id,
                message_id,
                user_id,
                emoji,
                action,
            } => {
                let changed = match action {
                    ReactionAction::Add => self.reactions.add(&message_id, &user_id, &emoji),
                    ReactionAction::Remove => self.reactions.remove(&message_id, &user_id, &emoji),
                };
                match changed {
                    Some(true) => {
                        self.bus.emit(ClientEvent::ReactionChanged {
                            chat_id,
                            message_id,
                        });
                        IngestOutcome::Applied
                    }
                    Some(false) => IngestOutcome::Duplicate,
                    None => IngestOutcome::Rejected,
                }
            }
            InboundEvent::Edit {
                chat_id,
                message_id,
                content,
                timestamp,
            } => match self.store.edit(&message_id, content, timestamp) {
                Ok(_) => {
                    self.bus.emit(ClientEvent::MessageEdited {
                        chat_id,
                        message_id,
                    });
                    IngestOutcome::Applied
                }
                Err(StoreError::EmptyEdit) => {
                    warn!(msg_id = %message_id, "Empty edit rejected");
                    IngestOutcome::Rejected
                }
                Err(e) => {
                    warn!(msg_id = %message_id, error = %e, "Edit rejected");
                    IngestOutcome::Rejected
                }
            },
            other => {
                warn!(event = ?other, "Unexpected event on targeted path");
                IngestOutcome::Rejected
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::FixtureDataSource;
    use parley_shared::types::{ChatId, MessageType};

    struct Harness {
        ingest: RealtimeIngest,
        store: Arc<MessageStore>,
        registry: Arc<ChatRegistry>,
        bus: EventBus,
    }

    fn harness_with(config: ClientConfig) -> Harness {
        let source = Arc::new(FixtureDataSource::new(config.user_id.clone()));
        let store = Arc::new(MessageStore::new());
        let registry = Arc::new(ChatRegistry::new(config.user_id.clone(), store.clone()));
        registry.load_dto(&source.add_direct_chat("c1", "bob"));
        let gate = PermissionGate::new(
            source,
            config.user_id.clone(),
            config.permission_ttl,
            config.permission_timeout,
        );
        let bus = EventBus::new(64);
        let ingest = RealtimeIngest::new(&config, store.clone(), registry.clone(), gate, bus.clone());
        Harness {
            ingest,
            store,
            registry,
            bus,
        }
    }

    fn harness() -> Harness {
        harness_with(ClientConfig {
            user_id: UserId::new("alice"),
            ..ClientConfig::default()
        })
    }

    fn message_frame(id: &str, sender: &str, content: &str) -> String {
        format!(
            r#"{{"type":"message","data":{{"chatId":"c1","messageId":"{id}","senderId":"{sender}","content":"{content}","timestamp":"2024-05-01T10:00:00Z"}}}}"#
        )
    }

    fn receipt_frame(kind: &str, id: &str) -> String {
        format!(r#"{{"type":"{kind}","data":{{"chatId":"c1","messageId":"{id}"}}}}"#)
    }

    fn local_provisional(h: &Harness, content: &str) -> MessageId {
        let m = Message::provisional(
            ChatId::new("c1"),
            UserId::new("alice"),
            content.into(),
            MessageType::Text,
            None,
        );
        let id = m.id.clone();
        h.store.append(m);
        id
    }

    #[tokio::test]
    async fn test_incoming_message_delivered() {
        let h = harness();
        let mut rx = h.bus.subscribe();
        let outcome = h.ingest.on_event(&message_frame("m1", "bob", "hi")).await;
        assert_eq!(outcome, IngestOutcome::Applied);

        let message = h.store.get(&MessageId::server("m1")).unwrap();
        assert_eq!(message.delivery, DeliveryState::Delivered);
        assert!(matches!(rx.recv().await.unwrap(), ClientEvent::NewMessage { .. }));
    }

    #[tokio::test]
    async fn test_duplicate_frame_is_absorbed() {
        let h = harness();
        h.ingest.on_event(&message_frame("m1", "bob", "hi")).await;
        let outcome = h.ingest.on_event(&message_frame("m1", "bob", "hi")).await;
        assert_eq!(outcome, IngestOutcome::Duplicate);
        assert_eq!(h.store.message_count(&ChatId::new("c1")), 1);
    }

    #[tokio::test]
    async fn test_malformed_frames_dropped() {
        let h = harness();
        assert_eq!(h.ingest.on_event("not json").await, IngestOutcome::Dropped);
        assert_eq!(
            h.ingest.on_event(r#"{"type":"bogus","data":{}}"#).await,
            IngestOutcome::Dropped
        );
        assert_eq!(
            h.ingest.on_event(r#"{"type":"message","data":{"chatId":"c1"}}"#).await,
            IngestOutcome::Dropped
        );
    }

    #[tokio::test]
    async fn test_echo_reconciles_by_content() {
        let h = harness();
        let provisional = local_provisional(&h, "hello");

        let outcome = h.ingest.on_event(&message_frame("msg-7", "alice", "hello")).await;
        assert_eq!(outcome, IngestOutcome::Applied);

        let list = h.store.list(&ChatId::new("c1"));
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].id, MessageId::server("msg-7"));
        assert_eq!(list[0].delivery, DeliveryState::Sent);
        assert!(!h.store.contains(&provisional));
    }

    #[tokio::test]
    async fn test_echo_reconciles_by_client_id() {
        let h = harness();
        let _first = local_provisional(&h, "same");
        let second = local_provisional(&h, "same");
        let MessageId::Provisional(uuid) = second.clone() else {
            unreachable!()
        };

        let frame = format!(
            r#"{{"type":"message","data":{{"chatId":"c1","messageId":"msg-9","senderId":"alice","content":"same","timestamp":"2024-05-01T10:00:00Z","clientId":"{uuid}"}}}}"#
        );
        assert_eq!(h.ingest.on_event(&frame).await, IngestOutcome::Applied);
        assert!(!h.store.contains(&second));
        assert_eq!(h.store.message_count(&ChatId::new("c1")), 2);
    }

    #[tokio::test]
    async fn test_echo_after_ack_is_duplicate() {
        let h = harness();
        h.ingest.on_event(&message_frame("msg-1", "alice", "hi")).await;
        let outcome = h.ingest.on_event(&message_frame("msg-1", "alice", "hi")).await;
        assert_eq!(outcome, IngestOutcome::Duplicate);
    }

    #[tokio::test]
    async fn test_receipt_before_message_is_buffered() {
        let h = harness();
        let outcome = h.ingest.on_event(&receipt_frame("read-receipt", "m1")).await;
        assert_eq!(outcome, IngestOutcome::Buffered);
        assert_eq!(h.ingest.pending_len(), 1);

        h.ingest.on_event(&message_frame("m1", "bob", "hi")).await;
        assert_eq!(h.ingest.pending_len(), 0);
        assert_eq!(
            h.store.get(&MessageId::server("m1")).unwrap().delivery,
            DeliveryState::Read
        );
    }

    #[tokio::test]
    async fn test_buffered_event_expires() {
        let h = harness();
        h.ingest.on_event(&receipt_frame("read-receipt", "m1")).await;
        h.ingest
            .tick_at(Instant::now() + ClientConfig::default().pending_event_ttl + Duration::from_millis(1));
        assert_eq!(h.ingest.pending_len(), 0);

        h.ingest.on_event(&message_frame("m1", "bob", "hi")).await;
        assert_eq!(
            h.store.get(&MessageId::server("m1")).unwrap().delivery,
            DeliveryState::Delivered
        );
    }

    #[tokio::test]
    async fn test_buffer_evicts_oldest() {
        let h = harness_with(ClientConfig {
            user_id: UserId::new("alice"),
            pending_event_capacity: 2,
            ..ClientConfig::default()
        });
        for id in ["m1", "m2", "m3"] {
            h.ingest.on_event(&receipt_frame("read-receipt", id)).await;
        }
        assert_eq!(h.ingest.pending_len(), 2);

        h.ingest.on_event(&message_frame("m1", "bob", "a")).await;
        assert_eq!(
            h.store.get(&MessageId::server("m1")).unwrap().delivery,
            DeliveryState::Delivered
        );
        assert_eq!(h.ingest.pending_len(), 2);
    }

    #[tokio::test]
    async fn test_read_receipt_on_sent_rejected() {
        let h = harness();
        h.ingest.on_event(&message_frame("m1", "alice", "hi")).await;
        assert_eq!(
            h.store.get(&MessageId::server("m1")).unwrap().delivery,
            DeliveryState::Sent
        );

        assert_eq!(
            h.ingest.on_event(&receipt_frame("read-receipt", "m1")).await,
            IngestOutcome::Rejected
        );
        assert_eq!(
            h.ingest.on_event(&receipt_frame("delivery-receipt", "m1")).await,
            IngestOutcome::Applied
        );
        assert_eq!(
            h.ingest.on_event(&receipt_frame("read-receipt", "m1")).await,
            IngestOutcome::Applied
        );
        assert_eq!(
            h.ingest.on_event(&receipt_frame("read-receipt", "m1")).await,
            IngestOutcome::Duplicate
        );
    }

    #[tokio::test]
    async fn test_reaction_actions() {
        let h = harness();
        h.ingest.on_event(&message_frame("m1", "bob", "hi")).await;
        let frame = |action: &str| {
            format!(
                r#"{{"type":"reaction","data":{{"chatId":"c1","messageId":"m1","userId":"bob","emoji":"👍","action":"{action}"}}}}"#
            )
        };

        assert_eq!(h.ingest.on_event(&frame("add")).await, IngestOutcome::Applied);
        assert_eq!(h.ingest.on_event(&frame("add")).await, IngestOutcome::Duplicate);
        assert_eq!(h.ingest.on_event(&frame("remove")).await, IngestOutcome::Applied);
        assert!(h
            .store
            .get(&MessageId::server("m1"))
            .unwrap()
            .reactions
            .is_empty());
    }

    #[tokio::test]
    async fn test_redelivered_reaction_without_action_is_idempotent() {
        let h = harness();
        h.ingest.on_event(&message_frame("m1", "bob", "hi")).await;
        let frame = r#"{"type":"reaction","data":{"chatId":"c1","messageId":"m1","userId":"bob","emoji":"👍"}}"#;

        assert_eq!(h.ingest.on_event(frame).await, IngestOutcome::Applied);
        assert_eq!(h.ingest.on_event(frame).await, IngestOutcome::Duplicate);
        let stored = h.store.get(&MessageId::server("m1")).unwrap();
        assert_eq!(stored.reactions.count("👍"), 1);
        assert!(stored.reactions.contains(&UserId::new("bob"), "👍"));
    }

    #[tokio::test]
    async fn test_echo_swaps_in_sent_copy() {
        let h = harness();
        let provisional = local_provisional(&h, "hello");
        let mut rx = h.bus.subscribe();

        let outcome = h.ingest.on_event(&message_frame("m1", "alice", "hello")).await;
        assert_eq!(outcome, IngestOutcome::Applied);
        assert!(!h.store.contains(&provisional));

        let mut states = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let ClientEvent::DeliveryChanged { message_id, state, .. } = event {
                assert_eq!(message_id, MessageId::server("m1"));
                states.push(state);
            }
        }
        assert_eq!(states, vec![DeliveryState::Sent]);

        // Nothing in between for a receipt to trip over.
        assert_eq!(
            h.ingest.on_event(&receipt_frame("delivery-receipt", "m1")).await,
            IngestOutcome::Applied
        );
    }

    #[tokio::test]
    async fn test_mismatched_chat_rejected() {
        let h = harness();
        h.ingest.on_event(&message_frame("m1", "bob", "hi")).await;
        let frame = r#"{"type":"read-receipt","data":{"chatId":"other","messageId":"m1"}}"#;
        assert_eq!(h.ingest.on_event(frame).await, IngestOutcome::Rejected);
    }

    #[tokio::test]
    async fn test_presence_and_edit() {
        let h = harness();
        let presence = r#"{"type":"presence","data":{"userId":"bob","online":true}}"#;
        assert_eq!(h.ingest.on_event(presence).await, IngestOutcome::Applied);
        assert!(h.registry.participant(&UserId::new("bob")).unwrap().online);

        h.ingest.on_event(&message_frame("m1", "bob", "hi")).await;
        let edit = r#"{"type":"message-edit","data":{"chatId":"c1","messageId":"m1","content":"hello"}}"#;
        assert_eq!(h.ingest.on_event(edit).await, IngestOutcome::Applied);
        let message = h.store.get(&MessageId::server("m1")).unwrap();
        assert_eq!(message.content, "hello");
        assert!(message.edited);
    }

    #[tokio::test]
    async fn test_run_consumes_until_closed() {
        let h = harness();
        let (tx, rx) = mpsc::channel(8);
        tx.send(message_frame("m1", "bob", "hi")).await.unwrap();
        tx.send(message_frame("m2", "bob", "there")).await.unwrap();
        drop(tx);

        h.ingest.run(rx).await;
        assert_eq!(h.store.message_count(&ChatId::new("c1")), 2);
    }
}
