//! Simulate-then-execute wrapping for state-changing contract actions

use super::traits::{GatewayError, GatewayResult};
use async_trait::async_trait;
use tracing::{debug, warn};

/// A state-changing contract call
#[async_trait]
pub trait ContractAction: Send + Sync {
    type Output: Send;

    /// Short name for logs
    fn name(&self) -> &str;

    /// Dry-run the call and return its estimated cost. Fails with
    /// [`GatewayError::Reverted`] when the call would revert.
    async fn simulate(&self) -> GatewayResult<u64>;

    /// Send the call
    async fn execute(&self) -> GatewayResult<Self::Output>;
}

/// An action that is always simulated before it is executed
pub struct Simulated<A> {
    inner: A,
}

/// Wrap `action` so `execute` runs only after a successful simulation
pub fn wrap<A: ContractAction>(action: A) -> Simulated<A> {
    Simulated { inner: action }
}

impl<A> Simulated<A> {
    /// The unwrapped action, for callers that must skip simulation
    pub fn original(&self) -> &A {
        &self.inner
    }

    pub fn into_inner(self) -> A {
        self.inner
    }
}

#[async_trait]
impl<A: ContractAction> ContractAction for Simulated<A> {
    type Output = A::Output;

    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn simulate(&self) -> GatewayResult<u64> {
        self.inner.simulate().await
    }

    async fn execute(&self) -> GatewayResult<A::Output> {
        match self.inner.simulate().await {
            Ok(estimate) => debug!(action = self.inner.name(), estimate, "simulation passed"),
            Err(GatewayError::Reverted(reason)) => {
                warn!(action = self.inner.name(), %reason, "simulation reverted, not executing");
                return Err(GatewayError::Reverted(reason));
            }
            Err(e) => return Err(e),
        }
        self.inner.execute().await
    }
}
