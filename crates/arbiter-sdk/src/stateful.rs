//! Stateful notifications
//!
//! Notifications that describe what an account can do right now: activate
//! tokens, vote, pay an arbitration fee, repartition or execute a ruling.
//! They are recomputed from a live state snapshot on every call and never
//! persisted.
//!
//! Each notification type is one rule: an audience, an optional period
//! gate, the parts of the snapshot it needs and a pure predicate. Only the
//! state needed by the rules that pass their gate is read.

use crate::error::Result;
use crate::gateway::{
    ArbitrableContract, ContractGateway, ContractHandle, Dispute, DisputeState, JurorAccount, Period,
};
use crate::notification::stateful_record;
use arbiter_store_client::{NotificationRecord, NotificationType};
use futures::future::try_join_all;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;

// ============================================================================
// Clock
// ============================================================================

/// Source of "now" in unix seconds
pub trait Clock: Send + Sync {
    fn now(&self) -> u64;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default()
    }
}

/// A clock stuck at one instant
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub u64);

impl Clock for FixedClock {
    fn now(&self) -> u64 {
        self.0
    }
}

// ============================================================================
// Snapshot
// ============================================================================

/// A dispute judged in the current session, with the account's view of it
#[derive(Debug, Clone)]
pub struct DisputeView {
    pub dispute: Dispute,
    /// Draw numbers of the account in the current appeal
    pub draws: Vec<u64>,
    pub has_voted: bool,
    /// The disputed contract, when parties were needed
    pub arbitrable: Option<ArbitrableContract>,
}

impl DisputeView {
    fn involves(&self, account: &str) -> bool {
        !self.draws.is_empty()
            || self
                .arbitrable
                .as_ref()
                .is_some_and(|contract| contract.is_party(account))
    }
}

#[derive(Debug, Clone)]
pub struct ArbitrableView {
    pub contract: ArbitrableContract,
    pub arbitration_cost: u128,
}

/// The slice of court state the active rules asked for
#[derive(Debug, Clone)]
pub struct StateSnapshot {
    pub court: String,
    pub period: Period,
    pub session: u64,
    pub juror: Option<JurorAccount>,
    pub disputes: Vec<DisputeView>,
    pub arbitrables: Vec<ArbitrableView>,
}

// ============================================================================
// Rules
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Audience {
    Juror,
    Party,
    Both,
}

impl Audience {
    fn admits(self, include_juror_checks: bool) -> bool {
        match self {
            Audience::Juror => include_juror_checks,
            Audience::Party => !include_juror_checks,
            Audience::Both => true,
        }
    }
}

/// Parts of the snapshot a rule reads
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Needs {
    juror: bool,
    disputes: bool,
    votes: bool,
    dispute_parties: bool,
    arbitrables: bool,
}

impl Needs {
    fn union(self, other: Needs) -> Needs {
        Needs {
            juror: self.juror || other.juror,
            disputes: self.disputes || other.disputes,
            votes: self.votes || other.votes,
            dispute_parties: self.dispute_parties || other.dispute_parties,
            arbitrables: self.arbitrables || other.arbitrables,
        }
    }
}

/// One notification a predicate produced: subject, message and payload
struct Hit {
    subject: String,
    message: String,
    data: Value,
}

struct Rule {
    kind: NotificationType,
    audience: Audience,
    gate: Option<Period>,
    needs: Needs,
    check: fn(&StateSnapshot, &str, u64) -> Vec<Hit>,
}

const RULES: [Rule; 5] = [
    Rule {
        kind: NotificationType::CanActivate,
        audience: Audience::Juror,
        gate: Some(Period::Activation),
        needs: Needs { juror: true, disputes: false, votes: false, dispute_parties: false, arbitrables: false },
        check: can_activate,
    },
    Rule {
        kind: NotificationType::CanVote,
        audience: Audience::Juror,
        gate: Some(Period::Vote),
        needs: Needs { juror: false, disputes: true, votes: true, dispute_parties: false, arbitrables: false },
        check: can_vote,
    },
    Rule {
        kind: NotificationType::CanPayFee,
        audience: Audience::Party,
        gate: None,
        needs: Needs { juror: false, disputes: false, votes: false, dispute_parties: false, arbitrables: true },
        check: can_pay_fee,
    },
    Rule {
        kind: NotificationType::CanRepartition,
        audience: Audience::Both,
        gate: Some(Period::Execution),
        needs: Needs { juror: false, disputes: true, votes: false, dispute_parties: true, arbitrables: false },
        check: can_repartition,
    },
    Rule {
        kind: NotificationType::CanExecute,
        audience: Audience::Both,
        gate: Some(Period::Execution),
        needs: Needs { juror: false, disputes: true, votes: false, dispute_parties: true, arbitrables: false },
        check: can_execute,
    },
];

fn can_activate(state: &StateSnapshot, _account: &str, _now: u64) -> Vec<Hit> {
    match &state.juror {
        Some(juror) if juror.last_session < state.session => vec![Hit {
            subject: format!("{}:{}", state.court, state.session),
            message: format!("You can activate tokens for session {}", state.session),
            data: json!({
                "arbitratorAddress": state.court,
                "session": state.session,
            }),
        }],
        _ => Vec::new(),
    }
}

fn can_vote(state: &StateSnapshot, _account: &str, _now: u64) -> Vec<Hit> {
    state
        .disputes
        .iter()
        .filter(|view| !view.draws.is_empty() && !view.has_voted)
        .map(|view| Hit {
            subject: dispute_subject(state, view),
            message: format!("You have been drawn to vote on dispute #{}", view.dispute.id),
            data: json!({
                "disputeId": view.dispute.id,
                "arbitratorAddress": state.court,
                "appeal": view.dispute.number_of_appeals,
                "votes": view.draws.len(),
            }),
        })
        .collect()
}

fn can_pay_fee(state: &StateSnapshot, account: &str, now: u64) -> Vec<Hit> {
    state
        .arbitrables
        .iter()
        .filter_map(|view| {
            let (party, paid) = view.contract.awaited_party()?;
            if !party.eq_ignore_ascii_case(account) {
                return None;
            }
            let fee_to_pay = view.arbitration_cost.saturating_sub(paid);
            let deadline = view.contract.fee_deadline();
            Some(Hit {
                subject: view.contract.address.clone(),
                message: format!(
                    "Pay {} to take part in the dispute on {}",
                    fee_to_pay, view.contract.address
                ),
                data: json!({
                    "arbitratorAddress": state.court,
                    "arbitrableContractAddress": view.contract.address,
                    "feeToPay": fee_to_pay.to_string(),
                    "deadline": deadline,
                    "expired": now > deadline,
                }),
            })
        })
        .collect()
}

fn can_repartition(state: &StateSnapshot, account: &str, _now: u64) -> Vec<Hit> {
    ruling_hits(state, account, |s| matches!(s, DisputeState::Open | DisputeState::Resolving), "repartition tokens")
}

fn can_execute(state: &StateSnapshot, account: &str, _now: u64) -> Vec<Hit> {
    ruling_hits(state, account, |s| s == DisputeState::Executable, "execute the ruling")
}

fn ruling_hits(
    state: &StateSnapshot,
    account: &str,
    in_state: impl Fn(DisputeState) -> bool,
    action: &str,
) -> Vec<Hit> {
    state
        .disputes
        .iter()
        .filter(|view| in_state(view.dispute.state) && view.involves(account))
        .map(|view| Hit {
            subject: dispute_subject(state, view),
            message: format!("You can {} for dispute #{}", action, view.dispute.id),
            data: json!({
                "disputeId": view.dispute.id,
                "arbitratorAddress": state.court,
                "arbitrableContractAddress": view.dispute.arbitrated,
            }),
        })
        .collect()
}

fn dispute_subject(state: &StateSnapshot, view: &DisputeView) -> String {
    format!("{}:{}", state.court, view.dispute.id)
}

// ============================================================================
// Computer
// ============================================================================

/// Computes the stateful notifications of an account against one court
#[derive(Clone)]
pub struct StatefulNotificationComputer {
    gateway: Arc<dyn ContractGateway>,
    court: ContractHandle,
    arbitrables: Vec<String>,
    clock: Arc<dyn Clock>,
}

impl StatefulNotificationComputer {
    /// `arbitrables` are the contracts whose fee state is inspected for
    /// CAN_PAY_FEE.
    pub fn new(gateway: Arc<dyn ContractGateway>, court: ContractHandle, arbitrables: Vec<String>) -> Self {
        Self {
            gateway,
            court,
            arbitrables: arbitrables.into_iter().map(|a| a.to_lowercase()).collect(),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn arbitrables(&self) -> &[String] {
        &self.arbitrables
    }

    /// Everything `account` can currently act on.
    ///
    /// With `include_juror_checks` the juror rules run, otherwise the party
    /// rules; repartition and execution run either way. Any failed read
    /// fails the whole call.
    pub async fn get_stateful_notifications(
        &self,
        account: &str,
        include_juror_checks: bool,
    ) -> Result<Vec<NotificationRecord>> {
        let account = account.to_lowercase();
        let (period, session) = futures::try_join!(
            self.gateway.period(&self.court),
            self.gateway.session(&self.court),
        )?;

        let active: Vec<&Rule> = RULES
            .iter()
            .filter(|rule| rule.audience.admits(include_juror_checks))
            .filter(|rule| rule.gate.map_or(true, |gate| gate == period))
            .collect();
        if active.is_empty() {
            return Ok(Vec::new());
        }

        let needs = active.iter().fold(Needs::default(), |acc, rule| acc.union(rule.needs));
        let snapshot = self.snapshot(&account, period, session, needs).await?;
        let now = self.clock.now();

        let records: Vec<NotificationRecord> = active
            .iter()
            .flat_map(|rule| {
                (rule.check)(&snapshot, &account, now)
                    .into_iter()
                    .map(|hit| stateful_record(rule.kind, &account, &hit.subject, now, hit.message, hit.data))
            })
            .collect();

        debug!(
            account = %account,
            ?period,
            session,
            rules = active.len(),
            notifications = records.len(),
            "computed stateful notifications"
        );
        Ok(records)
    }

    async fn snapshot(&self, account: &str, period: Period, session: u64, needs: Needs) -> Result<StateSnapshot> {
        let (juror, disputes, arbitrables) = futures::try_join!(
            self.load_juror(account, needs),
            self.load_disputes(account, session, needs),
            self.load_arbitrables(needs),
        )?;
        Ok(StateSnapshot {
            court: self.court.address.clone(),
            period,
            session,
            juror,
            disputes,
            arbitrables,
        })
    }

    async fn load_juror(&self, account: &str, needs: Needs) -> Result<Option<JurorAccount>> {
        if !needs.juror {
            return Ok(None);
        }
        Ok(Some(self.gateway.juror(&self.court, account).await?))
    }

    async fn load_disputes(&self, account: &str, session: u64, needs: Needs) -> Result<Vec<DisputeView>> {
        if !needs.disputes {
            return Ok(Vec::new());
        }
        let count = self.gateway.dispute_count(&self.court).await?;
        let disputes = try_join_all((0..count).map(|id| self.gateway.dispute(&self.court, id))).await?;

        let current = disputes.into_iter().filter(|dispute| dispute.is_current(session));
        Ok(try_join_all(current.map(|dispute| self.load_dispute_view(account, dispute, needs))).await?)
    }

    async fn load_dispute_view(&self, account: &str, dispute: Dispute, needs: Needs) -> Result<DisputeView> {
        let appeal = dispute.number_of_appeals;
        let voted = async {
            if needs.votes {
                self.gateway.has_voted(&self.court, dispute.id, appeal, account).await
            } else {
                Ok(false)
            }
        };
        let arbitrable = async {
            if needs.dispute_parties {
                self.gateway.arbitrable(&dispute.arbitrated).await.map(Some)
            } else {
                Ok(None)
            }
        };
        let (draws, has_voted, arbitrable) = futures::try_join!(
            self.gateway.draws(&self.court, dispute.id, appeal, account),
            voted,
            arbitrable,
        )?;
        Ok(DisputeView { dispute, draws, has_voted, arbitrable })
    }

    async fn load_arbitrables(&self, needs: Needs) -> Result<Vec<ArbitrableView>> {
        if !needs.arbitrables {
            return Ok(Vec::new());
        }
        let views = try_join_all(self.arbitrables.iter().map(|address| async move {
            let contract = self.gateway.arbitrable(address).await?;
            let arbitration_cost = self
                .gateway
                .arbitration_cost(&self.court, &contract.arbitrator_extra_data)
                .await?;
            Ok::<_, crate::gateway::GatewayError>(ArbitrableView { contract, arbitration_cost })
        }))
        .await?;
        Ok(views)
    }
}
