//! Deterministic notification ids and record builders

use arbiter_store_client::{NotificationRecord, NotificationType};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Id of a notification derived from an event log.
///
/// Hashes `transactionHash | logIndex | notificationType | account`, so the
/// same log translated twice (by one watch or two) yields the same id.
pub fn event_notification_id(
    tx_hash: &str,
    log_index: u64,
    kind: NotificationType,
    account: &str,
) -> String {
    hash_parts(&[
        &tx_hash.to_lowercase(),
        &log_index.to_string(),
        kind.as_str(),
        &account.to_lowercase(),
    ])
}

/// Id of a stateful notification: one per type, account and subject
/// (a dispute or an arbitrable contract).
pub fn stateful_notification_id(kind: NotificationType, account: &str, subject: &str) -> String {
    hash_parts(&[kind.as_str(), &account.to_lowercase(), &subject.to_lowercase()])
}

fn hash_parts(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            hasher.update(b"|");
        }
        hasher.update(part.as_bytes());
    }
    hex::encode(hasher.finalize())
}

/// Build the record for one recipient of an event
pub fn event_record(
    kind: NotificationType,
    account: &str,
    tx_hash: &str,
    log_index: u64,
    created_at: u64,
    message: String,
    data: Value,
) -> NotificationRecord {
    NotificationRecord {
        id: event_notification_id(tx_hash, log_index, kind, account),
        notification_type: kind,
        account: account.to_lowercase(),
        tx_hash: Some(tx_hash.to_string()),
        log_index: Some(log_index),
        message,
        data,
        read: false,
        created_at,
    }
}

/// Build a stateful (never persisted) record
pub fn stateful_record(
    kind: NotificationType,
    account: &str,
    subject: &str,
    now: u64,
    message: String,
    data: Value,
) -> NotificationRecord {
    NotificationRecord {
        id: stateful_notification_id(kind, account, subject),
        notification_type: kind,
        account: account.to_lowercase(),
        tx_hash: None,
        log_index: None,
        message,
        data,
        read: false,
        created_at: now,
    }
}
