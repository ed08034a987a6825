//! Event log to notification translation
//!
//! | Event               | Recipients                         | Type               |
//! |---------------------|------------------------------------|--------------------|
//! | `DisputeCreation`   | both parties of the arbitrable     | DISPUTE_CREATED    |
//! | `AppealPossible`    | both parties of the disputed deal  | APPEAL_POSSIBLE    |
//! | `ArbitrationReward` | `_account`                         | ARBITRATION_REWARD |
//! | `TokenShift`        | `_account`                         | TOKEN_SHIFT        |
//!
//! Any other event produces nothing. Ids depend only on the log and the
//! recipient, so translating a log twice yields the same records.

use crate::error::{Result, SdkError};
use crate::gateway::{ContractGateway, ContractHandle, LogEntry};
use crate::notification::event_record;
use arbiter_store_client::{NotificationRecord, NotificationType};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::debug;

enum CourtEvent {
    DisputeCreation { dispute_id: u64, arbitrable: String },
    AppealPossible { dispute_id: u64 },
    ArbitrationReward { account: String, dispute_id: u64, amount: u128 },
    TokenShift { account: String, dispute_id: u64, amount: i128 },
}

impl CourtEvent {
    fn decode(log: &LogEntry) -> Result<Option<CourtEvent>> {
        let event = match log.event_name.as_str() {
            "DisputeCreation" => CourtEvent::DisputeCreation {
                dispute_id: arg_u64(log, "_disputeID")?,
                arbitrable: arg_address(log, "_arbitrable")?,
            },
            "AppealPossible" => CourtEvent::AppealPossible {
                dispute_id: arg_u64(log, "_disputeID")?,
            },
            "ArbitrationReward" => CourtEvent::ArbitrationReward {
                account: arg_address(log, "_account")?,
                dispute_id: arg_u64(log, "_disputeID")?,
                amount: arg_int::<u128>(log, "_amount")?,
            },
            "TokenShift" => CourtEvent::TokenShift {
                account: arg_address(log, "_account")?,
                dispute_id: arg_u64(log, "_disputeID")?,
                amount: arg_int::<i128>(log, "_amount")?,
            },
            _ => return Ok(None),
        };
        Ok(Some(event))
    }
}

/// Turns court event logs into notification records
#[derive(Clone)]
pub struct EventNotificationTranslator {
    gateway: Arc<dyn ContractGateway>,
    court: ContractHandle,
}

impl EventNotificationTranslator {
    pub fn new(gateway: Arc<dyn ContractGateway>, court: ContractHandle) -> Self {
        Self { gateway, court }
    }

    /// Translate a batch, keeping log order. Fails on the first log that
    /// cannot be translated.
    pub async fn translate_all(&self, logs: &[LogEntry]) -> Result<Vec<NotificationRecord>> {
        let mut records = Vec::new();
        for log in logs {
            records.extend(self.translate(log).await?);
        }
        Ok(records)
    }

    pub async fn translate(&self, log: &LogEntry) -> Result<Vec<NotificationRecord>> {
        let Some(event) = CourtEvent::decode(log)? else {
            debug!(event = %log.event_name, block = log.block_number, "no notification for event");
            return Ok(Vec::new());
        };

        let created_at = self.gateway.block_timestamp(log.block_number).await?;
        let court = self.court.address.as_str();
        let record = |kind, account: &str, message: String, data: Value| {
            event_record(kind, account, &log.transaction_hash, log.log_index, created_at, message, data)
        };

        let records = match event {
            CourtEvent::DisputeCreation { dispute_id, arbitrable } => {
                let contract = self.gateway.arbitrable(&arbitrable).await?;
                // Gateways may return checksummed addresses
                let party_a = contract.party_a.to_lowercase();
                let party_b = contract.party_b.to_lowercase();
                let sides = [("partyA", &party_a, &party_b), ("partyB", &party_b, &party_a)];
                sides
                    .into_iter()
                    .map(|(role, party, counterparty)| {
                        record(
                            NotificationType::DisputeCreated,
                            party.as_str(),
                            format!("Dispute #{} was created against {}", dispute_id, counterparty),
                            json!({
                                "disputeId": dispute_id,
                                "arbitratorAddress": court,
                                "arbitrableContractAddress": contract.address,
                                "role": role,
                                "counterparty": counterparty,
                            }),
                        )
                    })
                    .collect()
            }
            CourtEvent::AppealPossible { dispute_id } => {
                let dispute = self.gateway.dispute(&self.court, dispute_id).await?;
                let (contract, deadline) = futures::try_join!(
                    self.gateway.arbitrable(&dispute.arbitrated),
                    self.gateway.appeal_deadline(&self.court, dispute_id),
                )?;
                [contract.party_a.to_lowercase(), contract.party_b.to_lowercase()]
                    .into_iter()
                    .map(|party| {
                        record(
                            NotificationType::AppealPossible,
                            party.as_str(),
                            format!("The ruling of dispute #{} can be appealed", dispute_id),
                            json!({
                                "disputeId": dispute_id,
                                "arbitratorAddress": court,
                                "arbitrableContractAddress": contract.address,
                                "appealDeadline": deadline,
                            }),
                        )
                    })
                    .collect()
            }
            CourtEvent::ArbitrationReward { account, dispute_id, amount } => vec![record(
                NotificationType::ArbitrationReward,
                account.as_str(),
                format!("You received {} in arbitration fees for dispute #{}", amount, dispute_id),
                json!({
                    "disputeId": dispute_id,
                    "arbitratorAddress": court,
                    "amount": amount.to_string(),
                }),
            )],
            CourtEvent::TokenShift { account, dispute_id, amount } => vec![record(
                NotificationType::TokenShift,
                account.as_str(),
                if amount >= 0 {
                    format!("You gained {} tokens in dispute #{}", amount, dispute_id)
                } else {
                    format!("You lost {} tokens in dispute #{}", amount.unsigned_abs(), dispute_id)
                },
                json!({
                    "disputeId": dispute_id,
                    "arbitratorAddress": court,
                    "amount": amount.to_string(),
                }),
            )],
        };

        Ok(records)
    }
}

fn arg<'a>(log: &'a LogEntry, name: &str) -> Result<&'a Value> {
    log.args.get(name).ok_or_else(|| {
        SdkError::Validation(format!("{} log is missing argument {}", log.event_name, name))
    })
}

fn mistyped(log: &LogEntry, name: &str, expected: &str) -> SdkError {
    SdkError::Validation(format!(
        "{} log argument {} is not {}",
        log.event_name, name, expected
    ))
}

fn arg_address(log: &LogEntry, name: &str) -> Result<String> {
    match arg(log, name)? {
        Value::String(s) if !s.is_empty() => Ok(s.to_lowercase()),
        _ => Err(mistyped(log, name, "an address")),
    }
}

fn arg_u64(log: &LogEntry, name: &str) -> Result<u64> {
    arg_int::<u64>(log, name)
}

/// Integers arrive as JSON numbers or, when too large, decimal or 0x-hex strings
fn arg_int<T>(log: &LogEntry, name: &str) -> Result<T>
where
    T: TryFrom<i128> + TryFrom<u128> + std::str::FromStr,
{
    let parsed = match arg(log, name)? {
        Value::Number(n) => n
            .as_i64()
            .map(i128::from)
            .or_else(|| n.as_u64().map(i128::from))
            .and_then(|v| <T as TryFrom<i128>>::try_from(v).ok()),
        Value::String(s) => match s.strip_prefix("0x") {
            // Hex words are unsigned; the full u128 range is valid
            Some(hex) => u128::from_str_radix(hex, 16)
                .ok()
                .and_then(|v| <T as TryFrom<u128>>::try_from(v).ok()),
            None => s.parse::<T>().ok(),
        },
        _ => None,
    };
    parsed.ok_or_else(|| mistyped(log, name, "an integer"))
}
