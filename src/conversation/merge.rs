//! Duplicate detection and history reconciliation.

use super::message::Message;
use std::collections::HashSet;
use std::time::Duration;

/// Same message seen twice: equal ids, or the same role and content within
/// `window` of each other.
pub(crate) fn is_duplicate(existing: &Message, candidate: &Message, window: Duration) -> bool {
    if existing.id == candidate.id {
        return true;
    }
    existing.role == candidate.role
        && existing.content == candidate.content
        && within(existing, candidate, window)
}

fn within(a: &Message, b: &Message, window: Duration) -> bool {
    let gap = (a.created_at - b.created_at).num_milliseconds().unsigned_abs();
    u128::from(gap) <= window.as_millis()
}

/// Insert keeping ascending `created_at`. Equal timestamps keep arrival
/// order.
pub(crate) fn insert_sorted(messages: &mut Vec<Message>, message: Message) {
    let index = messages.partition_point(|m| m.created_at <= message.created_at);
    messages.insert(index, message);
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct MergeReport {
    /// Local entries confirmed by a server copy.
    pub matched: usize,
    /// Unconfirmed local entries carried over.
    pub kept: usize,
    /// Local entries the server no longer has.
    pub dropped: usize,
}

/// Reconcile local state with authoritative history.
///
/// Server messages win. A local message matched by a server copy is replaced
/// by it, its metadata carried over. Unmatched local messages survive when
/// they are still in flight, failed, or newer than anything the server
/// returned; anything else was removed upstream and is dropped.
pub(crate) fn merge(
    local: Vec<Message>,
    server: Vec<Message>,
    window: Duration,
) -> (Vec<Message>, MergeReport) {
    let mut seen = HashSet::new();
    let mut merged: Vec<Message> = server
        .into_iter()
        .filter(|m| seen.insert(m.id.clone()))
        .collect();
    let newest_server = merged.iter().map(|m| m.created_at).max();

    let mut report = MergeReport::default();
    let server_len = merged.len();
    let mut claimed = vec![false; server_len];

    for message in local {
        let matched = (0..server_len)
            .find(|&i| !claimed[i] && is_duplicate(&merged[i], &message, window));

        if let Some(index) = matched {
            claimed[index] = true;
            merged[index].metadata.absorb(message.metadata);
            report.matched += 1;
            continue;
        }

        let newer = newest_server.is_none_or(|newest| message.created_at > newest);
        if message.delivery.is_local() || newer {
            merged.push(message);
            report.kept += 1;
        } else {
            report.dropped += 1;
        }
    }

    merged.sort_by_key(|m| m.created_at);
    (merged, report)
}
