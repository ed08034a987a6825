//! Wire types for the profile store documents

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;

/// Fields the store adds to every document; they must not be written back.
const SERVER_FIELDS: [&str; 2] = ["_id", "_createdAt"];

// ============================================================================
// Notifications
// ============================================================================

/// Fixed vocabulary of notification kinds shared with the client
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotificationType {
    CanActivate,
    CanVote,
    CanRepartition,
    CanExecute,
    CanPayFee,
    DisputeCreated,
    AppealPossible,
    ArbitrationReward,
    TokenShift,
}

impl NotificationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationType::CanActivate => "CAN_ACTIVATE",
            NotificationType::CanVote => "CAN_VOTE",
            NotificationType::CanRepartition => "CAN_REPARTITION",
            NotificationType::CanExecute => "CAN_EXECUTE",
            NotificationType::CanPayFee => "CAN_PAY_FEE",
            NotificationType::DisputeCreated => "DISPUTE_CREATED",
            NotificationType::AppealPossible => "APPEAL_POSSIBLE",
            NotificationType::ArbitrationReward => "ARBITRATION_REWARD",
            NotificationType::TokenShift => "TOKEN_SHIFT",
        }
    }

    /// Stateful kinds are derived from live state and never persisted
    pub fn is_stateful(&self) -> bool {
        matches!(
            self,
            NotificationType::CanActivate
                | NotificationType::CanVote
                | NotificationType::CanRepartition
                | NotificationType::CanExecute
                | NotificationType::CanPayFee
        )
    }
}

impl fmt::Display for NotificationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A notification addressed to one account
///
/// `id` is derived deterministically from the source event (or, for stateful
/// notifications, from the subject), so two records with the same id are the
/// same notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationRecord {
    #[serde(default)]
    pub id: String,
    pub notification_type: NotificationType,
    #[serde(default)]
    pub account: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tx_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_index: Option<u64>,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub read: bool,
    /// Seconds since epoch (block timestamp for event notifications)
    #[serde(default)]
    pub created_at: u64,
}

// ============================================================================
// Profiles
// ============================================================================

/// Reference from a profile to a dispute the account takes part in
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DisputeRef {
    pub arbitrator_address: String,
    pub dispute_id: u64,
    #[serde(default)]
    pub appeal_draws: Vec<Vec<u64>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl DisputeRef {
    pub fn new(arbitrator_address: impl Into<String>, dispute_id: u64) -> Self {
        Self {
            arbitrator_address: arbitrator_address.into(),
            dispute_id,
            appeal_draws: Vec::new(),
            extra: Map::new(),
        }
    }

    pub fn matches(&self, arbitrator_address: &str, dispute_id: u64) -> bool {
        self.dispute_id == dispute_id && self.arbitrator_address.eq_ignore_ascii_case(arbitrator_address)
    }
}

/// Evidence attached to an arbitrable contract
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Evidence {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub url: String,
    /// Milliseconds since epoch
    #[serde(default)]
    pub submitted_at: u64,
}

/// Arbitrable contract as recorded in a party's profile
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContractRecord {
    pub address: String,
    #[serde(default)]
    pub hash_contract: Option<String>,
    #[serde(default)]
    pub party_a: Option<String>,
    #[serde(default)]
    pub party_b: Option<String>,
    #[serde(default)]
    pub arbitrator: Option<String>,
    #[serde(default)]
    pub timeout: Option<u64>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub dispute_id: Option<u64>,
    #[serde(default)]
    pub evidence: Vec<Evidence>,
}

/// The per-account document
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    #[serde(default)]
    pub address: String,
    /// Highest block processed for this account across all watched contracts
    #[serde(default)]
    pub last_block: u64,
    /// Highest block processed per arbitrator contract
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub last_blocks: BTreeMap<String, u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<u64>,
    #[serde(default)]
    pub notifications: Vec<NotificationRecord>,
    #[serde(default)]
    pub disputes: Vec<DisputeRef>,
    #[serde(default)]
    pub contracts: Vec<ContractRecord>,
    /// Unknown fields, preserved across read-modify-write
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl UserProfile {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            ..Default::default()
        }
    }

    /// Drop the store-managed fields so the document can be posted back
    pub fn strip_server_fields(&mut self) {
        for field in SERVER_FIELDS {
            self.extra.remove(field);
        }
    }

    /// Watermark for one arbitrator contract.
    ///
    /// Profiles written before per-contract watermarks existed only carry
    /// `lastBlock`; that value is used until the first per-contract advance.
    pub fn watermark(&self, contract: &str) -> u64 {
        match self.last_blocks.get(&contract.to_lowercase()) {
            Some(block) => *block,
            None if self.last_blocks.is_empty() => self.last_block,
            None => 0,
        }
    }

    /// Advance the watermark for `contract`. Returns false (and changes
    /// nothing) when `block` would not move it forward.
    pub fn advance_watermark(&mut self, contract: &str, block: u64) -> bool {
        let current = self.watermark(contract);
        if block <= current {
            return false;
        }
        self.last_blocks.insert(contract.to_lowercase(), block);
        self.last_block = self.last_block.max(block);
        true
    }

    pub fn has_notification(&self, id: &str) -> bool {
        self.notifications.iter().any(|n| n.id == id)
    }

    pub fn find_notification_mut(
        &mut self,
        tx_hash: &str,
        log_index: u64,
    ) -> Option<&mut NotificationRecord> {
        self.notifications.iter_mut().find(|n| {
            n.log_index == Some(log_index)
                && n.tx_hash.as_deref().is_some_and(|h| h.eq_ignore_ascii_case(tx_hash))
        })
    }

    pub fn dispute(&self, arbitrator_address: &str, dispute_id: u64) -> Option<&DisputeRef> {
        self.disputes
            .iter()
            .find(|d| d.matches(arbitrator_address, dispute_id))
    }

    pub fn contract(&self, address: &str) -> Option<&ContractRecord> {
        self.contracts
            .iter()
            .find(|c| c.address.eq_ignore_ascii_case(address))
    }
}

// ============================================================================
// Disputes
// ============================================================================

/// Shared dispute document stored under the arbitrator
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DisputeRecord {
    #[serde(default)]
    pub dispute_id: u64,
    #[serde(default)]
    pub arbitrator_address: String,
    #[serde(default)]
    pub arbitrable_contract_address: Option<String>,
    #[serde(default)]
    pub party_a: Option<String>,
    #[serde(default)]
    pub party_b: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub status: Option<u8>,
    #[serde(default)]
    pub information: Option<String>,
    #[serde(default)]
    pub justification: Option<String>,
    #[serde(default)]
    pub resolution_options: Vec<Value>,
    #[serde(default)]
    pub appeal_created_at: Vec<u64>,
    #[serde(default)]
    pub appeal_ruled_at: Vec<u64>,
    #[serde(default)]
    pub appeal_deadlines: Vec<u64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A shared dispute document joined with the account's own reference to it
#[derive(Debug, Clone, PartialEq)]
pub struct DisputeData {
    pub record: DisputeRecord,
    pub reference: Option<DisputeRef>,
}

/// Body for `POST {address}/arbitrators/{arbitrator}/disputes/{id}`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DisputeProfileUpdate {
    pub appeal_draws: Vec<Vec<u64>>,
    pub arbitrator_address: String,
    pub dispute_id: u64,
    #[serde(rename = "netPNK", default)]
    pub net_pnk: Option<String>,
}
