//! Property-based checks for history reconciliation.
//!
//! 1. Output is sorted ascending and never longer than the limit.
//! 2. Feeding the same messages through several sources yields the same
//!    view as one source (copies collapse).
//! 3. Reconciling an already reconciled view changes nothing.
//! 4. Distinct content at the same timestamp is never merged.

use proptest::prelude::*;
use synqx::history::{DedupKey, reconcile, sort_and_truncate};
use synqx_proto::message::{MessageBody, StoredMessage, Timestamp, UserId};

fn message(id: String, millis: u64, text: String) -> StoredMessage {
    StoredMessage {
        id,
        sender_id: UserId::new("alice"),
        recipient_id: UserId::new("bob"),
        body: MessageBody::Text { text },
        timestamp: Timestamp::from_millis(millis),
        delivered: false,
        read: false,
        sender_name: None,
        reply_context: None,
    }
}

/// Messages over a narrow timestamp range so collisions are common.
fn arb_messages() -> impl Strategy<Value = Vec<StoredMessage>> {
    prop::collection::vec(("[a-z0-9]{1,12}", 0u64..40, "[a-d]{1,3}"), 0..40).prop_map(|raw| {
        raw.into_iter()
            .map(|(id, millis, text)| message(id, millis, text))
            .collect()
    })
}

fn keys(messages: &[StoredMessage]) -> Vec<DedupKey> {
    messages.iter().map(DedupKey::of).collect()
}

proptest! {
    #[test]
    fn output_is_sorted_and_bounded(messages in arb_messages(), limit in 0usize..60) {
        let view = reconcile([messages], limit);
        prop_assert!(view.len() <= limit);
        prop_assert!(view.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
    }

    #[test]
    fn copies_across_sources_collapse(messages in arb_messages()) {
        let relabelled: Vec<StoredMessage> = messages
            .iter()
            .cloned()
            .map(|mut m| {
                m.id = format!("local_{}", m.id);
                m
            })
            .collect();
        let single = reconcile([messages.clone()], usize::MAX);
        let tripled = reconcile([messages.clone(), relabelled, messages], usize::MAX);
        prop_assert_eq!(keys(&single), keys(&tripled));
    }

    #[test]
    fn reconcile_is_idempotent(a in arb_messages(), b in arb_messages(), limit in 1usize..60) {
        let once = reconcile([a, b], limit);
        let twice = reconcile([once.clone()], limit);
        prop_assert_eq!(once, twice);
    }

    #[test]
    fn no_key_appears_twice(a in arb_messages(), b in arb_messages()) {
        let view = reconcile([a, b], usize::MAX);
        let mut seen = std::collections::HashSet::new();
        prop_assert!(view.iter().all(|m| seen.insert(DedupKey::of(m))));
    }

    #[test]
    fn same_timestamp_distinct_content_survives(millis in any::<u64>(), x in "[a-m]{1,20}", y in "[n-z]{1,20}") {
        let view = reconcile(
            [vec![message("p1".into(), millis, x.clone())], vec![message("c1".into(), millis, y.clone())]],
            10,
        );
        prop_assert_eq!(view.len(), 2);
        prop_assert_eq!(view[0].body.as_text(), Some(x.as_str()));
        prop_assert_eq!(view[1].body.as_text(), Some(y.as_str()));
    }

    #[test]
    fn fallback_keeps_most_recent(messages in arb_messages(), limit in 0usize..60) {
        let view = sort_and_truncate(messages.clone(), limit);
        prop_assert_eq!(view.len(), messages.len().min(limit));
        let mut sorted = messages;
        sorted.sort_by_key(|m| m.timestamp);
        prop_assert_eq!(&view[..], &sorted[sorted.len() - view.len()..]);
    }
}
