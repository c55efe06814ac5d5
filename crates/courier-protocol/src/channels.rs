//! Channel naming for the cross-process pub/sub medium.
//!
//! Names must be bit-exact across processes or cross-process delivery
//! silently fails. Per-subject categories follow `events:<category>:<subject>`;
//! room- and call-scoped signaling use `events:room:<room>` and
//! `events:call:<key>`.
//!
//! Subscriptions use the explicit category list from [`subject_patterns`]
//! rather than a wildcard suffix, so a future channel cannot accidentally
//! match a subject's subscription.

/// New-message notifications for a subject.
#[must_use]
pub fn messages(subject: &str) -> String {
    format!("events:messages:{subject}")
}

/// Reaction updates for a subject.
#[must_use]
pub fn reactions(subject: &str) -> String {
    format!("events:reactions:{subject}")
}

/// Read receipts for a subject.
#[must_use]
pub fn read_receipts(subject: &str) -> String {
    format!("events:read:{subject}")
}

/// Generic notifications for a subject.
#[must_use]
pub fn notifications(subject: &str) -> String {
    format!("events:notify:{subject}")
}

/// Call signaling scoped to a subject, or to a call id when used as the
/// snapshot routing hint.
#[must_use]
pub fn call(key: &str) -> String {
    format!("events:call:{key}")
}

/// Listen-party events scoped to a room.
#[must_use]
pub fn room(room_id: &str) -> String {
    format!("events:room:{room_id}")
}

/// The full set of channels a connected subject subscribes to.
#[must_use]
pub fn subject_patterns(subject: &str) -> Vec<String> {
    vec![
        messages(subject),
        reactions(subject),
        read_receipts(subject),
        notifications(subject),
        call(subject),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_names_are_exact() {
        assert_eq!(messages("u1"), "events:messages:u1");
        assert_eq!(reactions("u1"), "events:reactions:u1");
        assert_eq!(read_receipts("u1"), "events:read:u1");
        assert_eq!(notifications("u1"), "events:notify:u1");
        assert_eq!(call("u1"), "events:call:u1");
        assert_eq!(room("r1"), "events:room:r1");
    }

    #[test]
    fn test_subject_patterns_enumerated() {
        let patterns = subject_patterns("u1");
        assert_eq!(patterns.len(), 5);
        // No wildcard suffixes: every pattern is a literal channel name.
        assert!(patterns.iter().all(|p| !p.contains('*')));
        assert!(patterns.contains(&"events:call:u1".to_string()));
    }
}
