//! In-memory court for tests and local development.
//!
//! Holds one arbitrator contract, its arbitrable contracts, a block counter
//! and an event log. Helpers drive the court through sessions the way the
//! on-chain contract would and emit the matching events.

use super::simulate::ContractAction;
use super::traits::*;
use super::types::*;
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// Timestamp of block 0
pub const GENESIS_TIME: u64 = 1_600_000_000;
/// Seconds between blocks
pub const BLOCK_TIME: u64 = 15;

const DEFAULT_ARBITRATION_COST: u128 = 10_000;

struct CourtState {
    block: u64,
    tx_counter: u64,
    logs: Vec<LogEntry>,
    period: Period,
    session: u64,
    jurors: HashMap<String, JurorAccount>,
    session_activated: u128,
    disputes: Vec<Dispute>,
    draws: HashMap<(u64, u64, String), Vec<u64>>,
    votes: HashSet<(u64, u64, String)>,
    appeal_deadlines: HashMap<u64, u64>,
    arbitrables: HashMap<String, ArbitrableContract>,
    arbitration_cost: u128,
    fail_next: usize,
    latency: Option<Duration>,
    load_calls: usize,
    log_queries: usize,
    state_reads: usize,
}

impl Default for CourtState {
    fn default() -> Self {
        Self {
            block: 0,
            tx_counter: 0,
            logs: Vec::new(),
            period: Period::Activation,
            session: 1,
            jurors: HashMap::new(),
            session_activated: 0,
            disputes: Vec::new(),
            draws: HashMap::new(),
            votes: HashSet::new(),
            appeal_deadlines: HashMap::new(),
            arbitrables: HashMap::new(),
            arbitration_cost: DEFAULT_ARBITRATION_COST,
            fail_next: 0,
            latency: None,
            load_calls: 0,
            log_queries: 0,
            state_reads: 0,
        }
    }
}

impl CourtState {
    fn next_tx_hash(&mut self) -> String {
        self.tx_counter += 1;
        format!("0x{:064x}", self.tx_counter)
    }

    /// Mine a block holding one transaction that emits `event`
    fn emit(&mut self, event: &str, args: Value) -> LogEntry {
        self.block += 1;
        let entry = LogEntry {
            block_number: self.block,
            transaction_hash: self.next_tx_hash(),
            log_index: 0,
            event_name: event.to_string(),
            args: as_args(args),
        };
        self.logs.push(entry.clone());
        entry
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum CallKind {
    Load,
    Logs,
    Read,
}

/// In-memory [`ContractGateway`]
#[derive(Clone)]
pub struct MockCourt {
    address: String,
    state: Arc<Mutex<CourtState>>,
}

impl MockCourt {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into().to_lowercase(),
            state: Arc::new(Mutex::new(CourtState::default())),
        }
    }

    /// Delay every gateway call by `latency`
    pub fn with_latency(self, latency: Duration) -> Self {
        self.state().latency = Some(latency);
        self
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn handle(&self) -> ContractHandle {
        ContractHandle::new(self.address.clone())
    }

    fn state(&self) -> MutexGuard<'_, CourtState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ==================== Instrumentation ====================

    /// Fail the next `n` gateway calls with [`GatewayError::Unavailable`]
    pub fn fail_next(&self, n: usize) {
        self.state().fail_next = n;
    }

    pub fn load_count(&self) -> usize {
        self.state().load_calls
    }

    pub fn log_query_count(&self) -> usize {
        self.state().log_queries
    }

    /// Number of state getter calls (everything except loads, logs and blocks)
    pub fn state_read_count(&self) -> usize {
        self.state().state_reads
    }

    async fn enter(&self, kind: CallKind) -> GatewayResult<()> {
        let latency = {
            let mut state = self.state();
            match kind {
                CallKind::Load => state.load_calls += 1,
                CallKind::Logs => state.log_queries += 1,
                CallKind::Read => state.state_reads += 1,
            }
            state.latency
        };
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        let mut state = self.state();
        if state.fail_next > 0 {
            state.fail_next -= 1;
            return Err(GatewayError::Unavailable("injected failure".into()));
        }
        Ok(())
    }

    // ==================== Chain ====================

    pub fn block_number(&self) -> u64 {
        self.state().block
    }

    /// Mine `n` empty blocks
    pub fn mine(&self, n: u64) -> u64 {
        let mut state = self.state();
        state.block += n;
        state.block
    }

    /// Emit an arbitrary event in a new block
    pub fn emit(&self, event: &str, args: Value) -> LogEntry {
        self.state().emit(event, args)
    }

    pub fn last_log(&self) -> Option<LogEntry> {
        self.state().logs.last().cloned()
    }

    /// Insert a log as-is, e.g. several logs in one block or out of order
    pub fn push_log(&self, entry: LogEntry) {
        let mut state = self.state();
        state.block = state.block.max(entry.block_number);
        state.logs.push(entry);
    }

    // ==================== Court ====================

    pub fn current_period(&self) -> Period {
        self.state().period
    }

    pub fn current_session(&self) -> u64 {
        self.state().session
    }

    pub fn set_period(&self, period: Period) {
        self.state().period = period;
    }

    /// Move to the next period, starting a new session after Execution
    pub fn pass_period(&self) -> Period {
        let mut state = self.state();
        let next = state.period.next();
        if next == Period::Activation {
            state.session += 1;
            state.session_activated = 0;
        }
        state.period = next;
        let session = state.session;
        state.emit("NewPeriod", json!({ "_period": next, "_session": session }));
        next
    }

    pub fn set_arbitration_cost(&self, cost: u128) {
        self.state().arbitration_cost = cost;
    }

    pub fn juror_account(&self, account: &str) -> JurorAccount {
        self.state()
            .jurors
            .get(&account.to_lowercase())
            .cloned()
            .unwrap_or_default()
    }

    /// Action buying `amount` tokens for `account`
    pub fn buy(&self, account: &str, amount: u128) -> BuyTokens {
        BuyTokens {
            court: self.clone(),
            account: account.to_lowercase(),
            amount,
        }
    }

    /// Action activating `amount` of `account`'s tokens for this session
    pub fn activate(&self, account: &str, amount: u128) -> ActivateTokens {
        ActivateTokens {
            court: self.clone(),
            account: account.to_lowercase(),
            amount,
        }
    }

    /// Open a dispute for `arbitrable` and emit `DisputeCreation`
    pub fn create_dispute(&self, arbitrable: &str) -> u64 {
        let mut state = self.state();
        let id = state.disputes.len() as u64;
        // Disputes raised before drawing starts are judged this session
        let first_session = match state.period {
            Period::Activation | Period::Draw => state.session,
            _ => state.session + 1,
        };
        state.disputes.push(Dispute {
            id,
            arbitrated: arbitrable.to_lowercase(),
            first_session,
            number_of_appeals: 0,
            choices: 2,
            state: DisputeState::Open,
        });
        if let Some(contract) = state.arbitrables.get_mut(&arbitrable.to_lowercase()) {
            contract.status = ArbitrableStatus::DisputeCreated;
            contract.dispute_id = Some(id);
        }
        state.emit(
            "DisputeCreation",
            json!({ "_disputeID": id, "_arbitrable": arbitrable }),
        );
        id
    }

    pub fn draw(&self, dispute_id: u64, appeal: u64, account: &str, draws: Vec<u64>) {
        self.state()
            .draws
            .insert((dispute_id, appeal, account.to_lowercase()), draws);
    }

    pub fn vote(&self, dispute_id: u64, appeal: u64, account: &str) {
        self.state()
            .votes
            .insert((dispute_id, appeal, account.to_lowercase()));
    }

    pub fn set_dispute_state(&self, dispute_id: u64, dispute_state: DisputeState) {
        if let Some(dispute) = self.state().disputes.get_mut(dispute_id as usize) {
            dispute.state = dispute_state;
        }
    }

    /// Record an appealable ruling and emit `AppealPossible`
    pub fn appeal_possible(&self, dispute_id: u64, deadline: u64) -> LogEntry {
        let mut state = self.state();
        state.appeal_deadlines.insert(dispute_id, deadline);
        state.emit("AppealPossible", json!({ "_disputeID": dispute_id }))
    }

    pub fn reward(&self, account: &str, dispute_id: u64, amount: u128) -> LogEntry {
        self.state().emit(
            "ArbitrationReward",
            json!({ "_account": account, "_disputeID": dispute_id, "_amount": amount.to_string() }),
        )
    }

    /// Move `amount` tokens to (positive) or from (negative) a juror
    pub fn shift_tokens(&self, account: &str, dispute_id: u64, amount: i128) -> LogEntry {
        let mut state = self.state();
        let juror = state.jurors.entry(account.to_lowercase()).or_default();
        juror.balance = if amount >= 0 {
            juror.balance.saturating_add(amount.unsigned_abs())
        } else {
            juror.balance.saturating_sub(amount.unsigned_abs())
        };
        state.emit(
            "TokenShift",
            json!({ "_account": account, "_disputeID": dispute_id, "_amount": amount.to_string() }),
        )
    }

    // ==================== Arbitrable contracts ====================

    /// Deploy a two-party arbitrable contract with no dispute.
    ///
    /// Party addresses are stored as given, the way a chain returns them.
    pub fn add_arbitrable(&self, address: &str, party_a: &str, party_b: &str, timeout: u64) {
        let mut state = self.state();
        let last_interaction = GENESIS_TIME + state.block * BLOCK_TIME;
        state.arbitrables.insert(
            address.to_lowercase(),
            ArbitrableContract {
                address: address.to_lowercase(),
                arbitrator: self.address.clone(),
                party_a: party_a.to_string(),
                party_b: party_b.to_string(),
                status: ArbitrableStatus::NoDispute,
                party_a_fee: 0,
                party_b_fee: 0,
                last_interaction,
                timeout,
                arbitrator_extra_data: Vec::new(),
                dispute_id: None,
                amount: 0,
            },
        );
    }

    pub fn arbitrable_contract(&self, address: &str) -> Option<ArbitrableContract> {
        self.state().arbitrables.get(&address.to_lowercase()).cloned()
    }

    /// A party pays (part of) the arbitration fee. Once both sides have paid
    /// the full cost the dispute is created.
    pub fn pay_arbitration_fee(&self, arbitrable: &str, party: &str, amount: u128) -> Option<u64> {
        let ready = {
            let mut state = self.state();
            let cost = state.arbitration_cost;
            let now = GENESIS_TIME + state.block * BLOCK_TIME;
            let contract = state.arbitrables.get_mut(&arbitrable.to_lowercase())?;
            if contract.party_a.eq_ignore_ascii_case(party) {
                contract.party_a_fee += amount;
            } else if contract.party_b.eq_ignore_ascii_case(party) {
                contract.party_b_fee += amount;
            } else {
                return None;
            }
            contract.last_interaction = now;

            let a_paid = contract.party_a_fee >= cost;
            let b_paid = contract.party_b_fee >= cost;
            contract.status = match (a_paid, b_paid) {
                (true, true) => ArbitrableStatus::DisputeCreated,
                (true, false) => ArbitrableStatus::WaitingPartyB,
                (false, true) => ArbitrableStatus::WaitingPartyA,
                (false, false) => contract.status,
            };
            a_paid && b_paid
        };

        ready.then(|| self.create_dispute(arbitrable))
    }

    fn arbitrable_at(&self, address: &str) -> GatewayResult<ArbitrableContract> {
        self.state()
            .arbitrables
            .get(&address.to_lowercase())
            .cloned()
            .ok_or_else(|| GatewayError::NotDeployed(address.to_string()))
    }

    fn dispute_at(&self, dispute_id: u64) -> GatewayResult<Dispute> {
        self.state()
            .disputes
            .get(dispute_id as usize)
            .cloned()
            .ok_or_else(|| GatewayError::Reverted(format!("no dispute {}", dispute_id)))
    }
}

fn as_args(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

#[async_trait]
impl ContractGateway for MockCourt {
    async fn load_contract(&self, address: &str) -> GatewayResult<ContractHandle> {
        self.enter(CallKind::Load).await?;
        if !address.eq_ignore_ascii_case(&self.address) {
            return Err(GatewayError::NotDeployed(address.to_string()));
        }
        Ok(self.handle())
    }

    async fn latest_block(&self) -> GatewayResult<u64> {
        self.enter(CallKind::Logs).await?;
        Ok(self.block_number())
    }

    async fn get_logs(&self, contract: &ContractHandle, filter: &LogFilter) -> GatewayResult<Vec<LogEntry>> {
        self.enter(CallKind::Logs).await?;
        if !contract.address.eq_ignore_ascii_case(&self.address) {
            return Ok(Vec::new());
        }
        Ok(self
            .state()
            .logs
            .iter()
            .filter(|log| log.block_number >= filter.from_block && log.block_number <= filter.to_block)
            .filter(|log| filter.event_name.as_ref().map_or(true, |name| &log.event_name == name))
            .filter(|log| log.matches_args(&filter.args))
            .cloned()
            .collect())
    }

    async fn block_timestamp(&self, block_number: u64) -> GatewayResult<u64> {
        self.enter(CallKind::Logs).await?;
        if block_number > self.block_number() {
            return Err(GatewayError::Unavailable(format!("block {} not mined", block_number)));
        }
        Ok(GENESIS_TIME + block_number * BLOCK_TIME)
    }

    async fn period(&self, _court: &ContractHandle) -> GatewayResult<Period> {
        self.enter(CallKind::Read).await?;
        Ok(self.current_period())
    }

    async fn session(&self, _court: &ContractHandle) -> GatewayResult<u64> {
        self.enter(CallKind::Read).await?;
        Ok(self.current_session())
    }

    async fn juror(&self, _court: &ContractHandle, account: &str) -> GatewayResult<JurorAccount> {
        self.enter(CallKind::Read).await?;
        Ok(self.juror_account(account))
    }

    async fn dispute_count(&self, _court: &ContractHandle) -> GatewayResult<u64> {
        self.enter(CallKind::Read).await?;
        Ok(self.state().disputes.len() as u64)
    }

    async fn dispute(&self, _court: &ContractHandle, dispute_id: u64) -> GatewayResult<Dispute> {
        self.enter(CallKind::Read).await?;
        self.dispute_at(dispute_id)
    }

    async fn draws(
        &self,
        _court: &ContractHandle,
        dispute_id: u64,
        appeal: u64,
        account: &str,
    ) -> GatewayResult<Vec<u64>> {
        self.enter(CallKind::Read).await?;
        Ok(self
            .state()
            .draws
            .get(&(dispute_id, appeal, account.to_lowercase()))
            .cloned()
            .unwrap_or_default())
    }

    async fn has_voted(
        &self,
        _court: &ContractHandle,
        dispute_id: u64,
        appeal: u64,
        account: &str,
    ) -> GatewayResult<bool> {
        self.enter(CallKind::Read).await?;
        Ok(self
            .state()
            .votes
            .contains(&(dispute_id, appeal, account.to_lowercase())))
    }

    async fn appeal_deadline(&self, _court: &ContractHandle, dispute_id: u64) -> GatewayResult<u64> {
        self.enter(CallKind::Read).await?;
        self.state()
            .appeal_deadlines
            .get(&dispute_id)
            .copied()
            .ok_or_else(|| GatewayError::Reverted(format!("dispute {} is not appealable", dispute_id)))
    }

    async fn arbitration_cost(&self, _court: &ContractHandle, _extra_data: &[u8]) -> GatewayResult<u128> {
        self.enter(CallKind::Read).await?;
        Ok(self.state().arbitration_cost)
    }

    async fn arbitrable(&self, address: &str) -> GatewayResult<ArbitrableContract> {
        self.enter(CallKind::Read).await?;
        self.arbitrable_at(address)
    }
}

// ============================================================================
// Actions
// ============================================================================

/// Buy court tokens
pub struct BuyTokens {
    court: MockCourt,
    account: String,
    amount: u128,
}

#[async_trait]
impl ContractAction for BuyTokens {
    type Output = String;

    fn name(&self) -> &str {
        "buyTokens"
    }

    async fn simulate(&self) -> GatewayResult<u64> {
        if self.amount == 0 {
            return Err(GatewayError::Reverted("amount must be positive".into()));
        }
        Ok(50_000)
    }

    async fn execute(&self) -> GatewayResult<String> {
        let mut state = self.court.state();
        let juror = state.jurors.entry(self.account.clone()).or_default();
        juror.balance += self.amount;
        Ok(state.next_tx_hash())
    }
}

/// Activate tokens for the current session
pub struct ActivateTokens {
    court: MockCourt,
    account: String,
    amount: u128,
}

impl ActivateTokens {
    fn check(&self, state: &CourtState) -> GatewayResult<()> {
        if state.period != Period::Activation {
            return Err(GatewayError::Reverted("not in activation period".into()));
        }
        let juror = state.jurors.get(&self.account).cloned().unwrap_or_default();
        if juror.last_session == state.session {
            return Err(GatewayError::Reverted("already activated this session".into()));
        }
        if self.amount == 0 || self.amount > juror.balance.saturating_sub(juror.at_stake) {
            return Err(GatewayError::Reverted("insufficient balance".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl ContractAction for ActivateTokens {
    type Output = String;

    fn name(&self) -> &str {
        "activateTokens"
    }

    async fn simulate(&self) -> GatewayResult<u64> {
        self.check(&self.court.state())?;
        Ok(120_000)
    }

    async fn execute(&self) -> GatewayResult<String> {
        let mut state = self.court.state();
        self.check(&state)?;
        let session = state.session;
        let start = state.session_activated;
        state.session_activated += self.amount;
        let juror = state.jurors.entry(self.account.clone()).or_default();
        juror.last_session = session;
        juror.segment_start = start;
        juror.segment_end = start + self.amount;
        Ok(state.next_tx_hash())
    }
}
