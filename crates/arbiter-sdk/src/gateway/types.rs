//! Chain-side value types read through the gateway

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::cmp::Ordering;

/// A loaded contract instance
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContractHandle {
    pub address: String,
}

impl ContractHandle {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into().to_lowercase(),
        }
    }
}

/// An emitted event log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub block_number: u64,
    pub transaction_hash: String,
    pub log_index: u64,
    pub event_name: String,
    /// Decoded event arguments by name
    #[serde(default)]
    pub args: Map<String, Value>,
}

impl LogEntry {
    /// Chain-native ordering key
    pub fn position(&self) -> (u64, u64) {
        (self.block_number, self.log_index)
    }

    /// Identity of the log across overlapping fetches
    pub fn key(&self) -> (String, u64) {
        (self.transaction_hash.to_lowercase(), self.log_index)
    }

    pub fn cmp_position(&self, other: &LogEntry) -> Ordering {
        self.position().cmp(&other.position())
    }

    /// True when every constraint equals the decoded argument of the same name
    pub fn matches_args(&self, constraints: &Map<String, Value>) -> bool {
        constraints.iter().all(|(name, expected)| {
            match (self.args.get(name), expected) {
                (Some(Value::String(a)), Value::String(b)) => a.eq_ignore_ascii_case(b),
                (Some(actual), expected) => actual == expected,
                (None, _) => false,
            }
        })
    }
}

/// Upper bound of a log query
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockTag {
    Number(u64),
    Latest,
}

/// Log query with a resolved block range (inclusive on both ends)
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LogFilter {
    pub event_name: Option<String>,
    pub from_block: u64,
    pub to_block: u64,
    pub args: Map<String, Value>,
}

/// Court period; a session cycles through all five in order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Period {
    Activation,
    Draw,
    Vote,
    Appeal,
    Execution,
}

impl Period {
    pub fn next(self) -> Period {
        match self {
            Period::Activation => Period::Draw,
            Period::Draw => Period::Vote,
            Period::Vote => Period::Appeal,
            Period::Appeal => Period::Execution,
            Period::Execution => Period::Activation,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisputeState {
    Open,
    Resolving,
    Executable,
    Executed,
}

/// Status of an arbitrable two-party contract
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArbitrableStatus {
    NoDispute,
    WaitingPartyA,
    WaitingPartyB,
    DisputeCreated,
    Resolved,
}

/// A juror's token balances, in base units
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JurorAccount {
    pub balance: u128,
    pub at_stake: u128,
    /// Session in which tokens were last activated; 0 if never
    pub last_session: u64,
    /// Activated range in the session's token segment
    pub segment_start: u128,
    pub segment_end: u128,
}

impl JurorAccount {
    pub fn activated(&self) -> u128 {
        self.segment_end.saturating_sub(self.segment_start)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Dispute {
    pub id: u64,
    /// Address of the arbitrable contract that raised the dispute
    pub arbitrated: String,
    pub first_session: u64,
    pub number_of_appeals: u64,
    pub choices: u64,
    pub state: DisputeState,
}

impl Dispute {
    /// Session in which the latest appeal of this dispute is being judged
    pub fn current_session(&self) -> u64 {
        self.first_session + self.number_of_appeals
    }

    /// Active in `session` and not executed yet
    pub fn is_current(&self, session: u64) -> bool {
        self.current_session() == session && self.state != DisputeState::Executed
    }
}

/// Two-party arbitrable contract state
#[derive(Debug, Clone, PartialEq)]
pub struct ArbitrableContract {
    pub address: String,
    pub arbitrator: String,
    pub party_a: String,
    pub party_b: String,
    pub status: ArbitrableStatus,
    pub party_a_fee: u128,
    pub party_b_fee: u128,
    /// Seconds since epoch
    pub last_interaction: u64,
    /// Seconds a party has to pay before losing by timeout
    pub timeout: u64,
    pub arbitrator_extra_data: Vec<u8>,
    pub dispute_id: Option<u64>,
    pub amount: u128,
}

impl ArbitrableContract {
    pub fn is_party(&self, account: &str) -> bool {
        self.party_a.eq_ignore_ascii_case(account) || self.party_b.eq_ignore_ascii_case(account)
    }

    /// The party the contract is waiting on, with the fee it has paid so far
    pub fn awaited_party(&self) -> Option<(&str, u128)> {
        match self.status {
            ArbitrableStatus::WaitingPartyA => Some((&self.party_a, self.party_a_fee)),
            ArbitrableStatus::WaitingPartyB => Some((&self.party_b, self.party_b_fee)),
            _ => None,
        }
    }

    pub fn counterparty(&self, account: &str) -> Option<&str> {
        if self.party_a.eq_ignore_ascii_case(account) {
            Some(&self.party_b)
        } else if self.party_b.eq_ignore_ascii_case(account) {
            Some(&self.party_a)
        } else {
            None
        }
    }

    pub fn fee_deadline(&self) -> u64 {
        self.last_interaction + self.timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn log(block: u64, index: u64) -> LogEntry {
        LogEntry {
            block_number: block,
            transaction_hash: format!("0xT{}", block),
            log_index: index,
            event_name: "TokenShift".into(),
            args: json!({ "_account": "0xAA", "_disputeID": 1 })
                .as_object()
                .cloned()
                .unwrap_or_default(),
        }
    }

    #[test]
    fn test_log_ordering_key() {
        let mut logs = vec![log(5, 1), log(3, 7), log(5, 0)];
        logs.sort_by(|a, b| a.cmp_position(b));
        let positions: Vec<_> = logs.iter().map(LogEntry::position).collect();
        assert_eq!(positions, vec![(3, 7), (5, 0), (5, 1)]);
        assert_eq!(log(5, 1).key(), ("0xt5".to_string(), 1));
    }

    #[test]
    fn test_arg_constraints() {
        let entry = log(1, 0);
        let mut constraints = Map::new();
        constraints.insert("_account".into(), json!("0xaa"));
        assert!(entry.matches_args(&constraints));

        constraints.insert("_disputeID".into(), json!(2));
        assert!(!entry.matches_args(&constraints));

        let mut missing = Map::new();
        missing.insert("_amount".into(), json!("1"));
        assert!(!entry.matches_args(&missing));
    }

    #[test]
    fn test_period_cycle_and_current_dispute() {
        assert_eq!(Period::Execution.next(), Period::Activation);

        let dispute = Dispute {
            id: 0,
            arbitrated: "0xdeal".into(),
            first_session: 2,
            number_of_appeals: 1,
            choices: 2,
            state: DisputeState::Open,
        };
        assert!(dispute.is_current(3));
        assert!(!dispute.is_current(2));
    }
}
