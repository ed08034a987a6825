//! The contract gateway capability.
//!
//! Everything the notification engine knows about the chain comes through
//! [`ContractGateway`]: contract loading, event logs, block timestamps and
//! read-only state getters. Implementations never send transactions from
//! these methods.

use super::types::*;
use async_trait::async_trait;

/// Errors raised by a gateway.
///
/// Cloneable so one failed contract load can be handed to every caller
/// waiting on it.
#[derive(Debug, Clone, thiserror::Error)]
pub enum GatewayError {
    /// Node unreachable or request failed in transit
    #[error("Gateway unavailable: {0}")]
    Unavailable(String),

    /// No contract at the address on this network
    #[error("Contract not deployed: {0}")]
    NotDeployed(String),

    /// Contract exists but could not be instantiated
    #[error("Unable to load contract: {0}")]
    LoadFailed(String),

    /// Call or simulation reverted
    #[error("Reverted: {0}")]
    Reverted(String),

    /// Return data or log could not be decoded
    #[error("Decode error: {0}")]
    Decode(String),
}

pub type GatewayResult<T> = std::result::Result<T, GatewayError>;

/// Read-only access to the arbitrator contract, its arbitrable contracts and
/// the chain they live on.
#[async_trait]
pub trait ContractGateway: Send + Sync {
    // ==================== Chain ====================

    /// Instantiate the contract at `address`
    async fn load_contract(&self, address: &str) -> GatewayResult<ContractHandle>;

    /// Current head block number
    async fn latest_block(&self) -> GatewayResult<u64>;

    /// Logs of `contract` matching `filter`. Order is not guaranteed.
    async fn get_logs(&self, contract: &ContractHandle, filter: &LogFilter) -> GatewayResult<Vec<LogEntry>>;

    /// Block timestamp in seconds since epoch
    async fn block_timestamp(&self, block_number: u64) -> GatewayResult<u64>;

    // ==================== Court state ====================

    async fn period(&self, court: &ContractHandle) -> GatewayResult<Period>;

    async fn session(&self, court: &ContractHandle) -> GatewayResult<u64>;

    async fn juror(&self, court: &ContractHandle, account: &str) -> GatewayResult<JurorAccount>;

    /// Number of disputes ever created; ids are `0..count`
    async fn dispute_count(&self, court: &ContractHandle) -> GatewayResult<u64>;

    async fn dispute(&self, court: &ContractHandle, dispute_id: u64) -> GatewayResult<Dispute>;

    /// Draw numbers assigned to `account` in one appeal of a dispute
    async fn draws(
        &self,
        court: &ContractHandle,
        dispute_id: u64,
        appeal: u64,
        account: &str,
    ) -> GatewayResult<Vec<u64>>;

    async fn has_voted(
        &self,
        court: &ContractHandle,
        dispute_id: u64,
        appeal: u64,
        account: &str,
    ) -> GatewayResult<bool>;

    /// End of the appeal window for the dispute's latest ruling
    async fn appeal_deadline(&self, court: &ContractHandle, dispute_id: u64) -> GatewayResult<u64>;

    async fn arbitration_cost(&self, court: &ContractHandle, extra_data: &[u8]) -> GatewayResult<u128>;

    // ==================== Arbitrable contracts ====================

    async fn arbitrable(&self, address: &str) -> GatewayResult<ArbitrableContract>;
}
