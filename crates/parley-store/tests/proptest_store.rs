use std::sync::Arc;

use chrono::{Duration, TimeZone, Utc};
use parley_shared::types::{ChatId, DeliveryState, MessageId, MessageType, UserId};
use parley_store::{DeliveryStateMachine, Message, MessageStore, ReactionAggregator};
use proptest::prelude::*;

// --- Strategies ---

fn arb_state() -> impl Strategy<Value = DeliveryState> {
    prop_oneof![
        Just(DeliveryState::Sending),
        Just(DeliveryState::Sent),
        Just(DeliveryState::Delivered),
        Just(DeliveryState::Read),
        Just(DeliveryState::Failed),
    ]
}

fn arb_message() -> impl Strategy<Value = Message> {
    ("[a-z0-9]{1,8}", "[a-c]", "\\PC{1,40}", 0i64..10_000).prop_map(|(id, chat, content, secs)| {
        let mut m = Message::provisional(
            ChatId::new(chat),
            UserId::new("bob"),
            content,
            MessageType::Text,
            None,
        );
        m.id = MessageId::server(id);
        m.created_at = Utc.timestamp_opt(1_700_000_000, 0).unwrap() + Duration::seconds(secs);
        m.delivery = DeliveryState::Delivered;
        m
    })
}

fn arb_reaction_op() -> impl Strategy<Value = (String, String)> {
    (
        prop_oneof![Just("alice"), Just("bob"), Just("carol")].prop_map(String::from),
        prop_oneof![Just("👍"), Just("❤️"), Just("😂")].prop_map(String::from),
    )
}

fn fresh_message(store: &MessageStore) -> MessageId {
    let m = Message::provisional(
        ChatId::new("c1"),
        UserId::new("alice"),
        "hi".into(),
        MessageType::Text,
        None,
    );
    let id = m.id.clone();
    store.append(m);
    id
}

proptest! {
    // --- Dedup ---

    /// Appending any batch twice leaves one entry per distinct id.
    #[test]
    fn append_is_idempotent(messages in proptest::collection::vec(arb_message(), 1..30)) {
        let store = MessageStore::new();
        for m in &messages {
            store.append(m.clone());
        }
        for m in &messages {
            prop_assert!(!store.append(m.clone()));
        }

        let mut distinct: Vec<_> = messages.iter().map(|m| m.id.clone()).collect();
        distinct.sort();
        distinct.dedup();

        let total: usize = ["a", "b", "c"]
            .iter()
            .map(|c| store.list(&ChatId::new(*c)).len())
            .sum();
        prop_assert_eq!(total, distinct.len());
    }

    /// Listed messages are sorted by (created_at, id).
    #[test]
    fn list_is_totally_ordered(messages in proptest::collection::vec(arb_message(), 1..30)) {
        let store = MessageStore::new();
        for m in messages {
            store.append(m);
        }
        for chat in ["a", "b", "c"] {
            let listed = store.list(&ChatId::new(chat));
            for pair in listed.windows(2) {
                prop_assert!((pair[0].created_at, &pair[0].id) < (pair[1].created_at, &pair[1].id));
            }
        }
    }

    // --- Delivery ---

    /// Observed states only ever move one legal step at a time.
    #[test]
    fn delivery_is_monotonic(requests in proptest::collection::vec(arb_state(), 0..40)) {
        let store = Arc::new(MessageStore::new());
        let id = fresh_message(&store);
        let machine = DeliveryStateMachine::new(store);

        let mut observed = vec![DeliveryState::Sending];
        for to in requests {
            if machine.transition(&id, to) {
                observed.push(to);
            }
        }

        for pair in observed.windows(2) {
            let legal = matches!(
                (pair[0], pair[1]),
                (DeliveryState::Sending, DeliveryState::Sent)
                    | (DeliveryState::Sent, DeliveryState::Delivered)
                    | (DeliveryState::Delivered, DeliveryState::Read)
                    | (DeliveryState::Sending, DeliveryState::Failed)
                    | (DeliveryState::Failed, DeliveryState::Sending)
            );
            prop_assert!(legal, "illegal step {:?} -> {:?}", pair[0], pair[1]);
        }
        prop_assert_eq!(machine.state(&id), observed.last().copied());
    }

    // --- Reactions ---

    /// toggle; toggle restores whatever set existed before.
    #[test]
    fn toggle_twice_restores(
        setup in proptest::collection::vec(arb_reaction_op(), 0..12),
        op in arb_reaction_op(),
    ) {
        let (user, emoji) = op;
        let store = Arc::new(MessageStore::new());
        let id = fresh_message(&store);
        let reactions = ReactionAggregator::new(store);

        for (u, e) in &setup {
            reactions.toggle(&id, &UserId::new(u.as_str()), e);
        }
        let before = reactions.reactions(&id).unwrap();

        let user = UserId::new(user);
        reactions.toggle(&id, &user, &emoji);
        reactions.toggle(&id, &user, &emoji);
        prop_assert_eq!(reactions.reactions(&id).unwrap(), before);
    }
}
