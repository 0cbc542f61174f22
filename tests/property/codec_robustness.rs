//! Property-based checks for the mailbox wire format.
//!
//! 1. Arbitrary text never panics `decode` for either frame direction.
//! 2. Any text message record survives a frame round-trip.
//! 3. Path validation never accepts a segment with a forbidden character.

use proptest::prelude::*;
use synqx_proto::codec;
use synqx_proto::mailbox::{ClientFrame, MailboxValue, ServerFrame};
use synqx_proto::message::{MailboxRecord, MessageBody, Timestamp, UserId};
use synqx_proto::path::MailboxPath;

/// Strategy for user ids that are valid path segments.
fn arb_user_id() -> impl Strategy<Value = UserId> {
    "[A-Za-z0-9_-]{1,28}".prop_map(UserId::new)
}

/// Strategy for text records with arbitrary non-blank content.
fn arb_text_record() -> impl Strategy<Value = MailboxRecord> {
    (
        "[^\x00]{0,256}[a-z][^\x00]{0,256}",
        any::<u64>(),
        arb_user_id(),
        any::<bool>(),
    )
        .prop_map(|(text, millis, sender, delivered)| MailboxRecord {
            body: MessageBody::Text { text },
            timestamp: Timestamp::from_millis(millis),
            sender,
            sender_name: None,
            read: false,
            delivered,
            reply_context: None,
        })
}

proptest! {
    #[test]
    fn arbitrary_text_never_panics_decode(text in ".{0,512}") {
        let _ = codec::decode::<ClientFrame>(&text);
        let _ = codec::decode::<ServerFrame>(&text);
    }

    #[test]
    fn write_frame_round_trips(
        record in arb_text_record(),
        recipient in arb_user_id(),
        id in any::<u64>(),
    ) {
        let path = MailboxPath::pending_entry(&recipient, &record.sender, "k1").unwrap();
        let frame = ClientFrame::Write { id, path, value: MailboxValue::Message(record) };
        let text = codec::encode(&frame).unwrap();
        let decoded: ClientFrame = codec::decode(&text).unwrap();
        prop_assert_eq!(decoded, frame);
    }

    #[test]
    fn forbidden_segments_are_rejected(
        head in "[a-z]{0,8}",
        bad in prop::sample::select(vec!['.', '#', '$', '[', ']']),
        tail in "[a-z]{0,8}",
    ) {
        let segment = format!("{head}{bad}{tail}");
        let path = format!("messages/{segment}");
        prop_assert!(MailboxPath::parse(&path).is_err());
        prop_assert!(MailboxPath::pending_inbox(&UserId::new(segment), &UserId::new("a")).is_err());
    }
}
