//! Lazy, shared contract loading

use super::traits::{ContractGateway, GatewayError};
use super::types::ContractHandle;
use crate::error::Result;
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

type PendingLoad = Shared<BoxFuture<'static, std::result::Result<ContractHandle, GatewayError>>>;

/// Observable load state of a [`ContractLoader`]
#[derive(Debug, Clone, PartialEq)]
pub enum LoadStatus {
    Unloaded,
    Loading,
    Loaded(ContractHandle),
    Failed(String),
}

enum LoadState {
    Unloaded,
    Loading { generation: u64, pending: PendingLoad },
    Loaded(ContractHandle),
    Failed(GatewayError),
}

struct Inner {
    address: String,
    generation: u64,
    state: LoadState,
}

/// Loads a contract once and hands the same handle to every caller.
///
/// Concurrent [`ContractLoader::load`] calls share a single gateway load. A
/// failed load is remembered until the next `load`, which retries.
pub struct ContractLoader {
    gateway: Arc<dyn ContractGateway>,
    inner: Mutex<Inner>,
}

impl ContractLoader {
    pub fn new(gateway: Arc<dyn ContractGateway>, address: impl Into<String>) -> Self {
        Self {
            gateway,
            inner: Mutex::new(Inner {
                address: address.into(),
                generation: 0,
                state: LoadState::Unloaded,
            }),
        }
    }

    pub async fn address(&self) -> String {
        self.inner.lock().await.address.clone()
    }

    pub async fn status(&self) -> LoadStatus {
        match &self.inner.lock().await.state {
            LoadState::Unloaded => LoadStatus::Unloaded,
            LoadState::Loading { .. } => LoadStatus::Loading,
            LoadState::Loaded(handle) => LoadStatus::Loaded(handle.clone()),
            LoadState::Failed(e) => LoadStatus::Failed(e.to_string()),
        }
    }

    /// Point the loader at another contract. The next `load` starts over.
    pub async fn set_contract_address(&self, address: impl Into<String>) {
        let mut inner = self.inner.lock().await;
        inner.address = address.into();
        inner.generation += 1;
        inner.state = LoadState::Unloaded;
    }

    /// Return the loaded contract, loading it first if needed
    pub async fn load(&self) -> Result<ContractHandle> {
        let (generation, pending) = {
            let mut guard = self.inner.lock().await;
            let inner = &mut *guard;
            match &inner.state {
                LoadState::Loaded(handle) => return Ok(handle.clone()),
                LoadState::Loading { generation, pending } => (*generation, pending.clone()),
                LoadState::Unloaded | LoadState::Failed(_) => {
                    let gateway = self.gateway.clone();
                    let address = inner.address.clone();
                    debug!(%address, "loading contract");
                    let pending = async move { gateway.load_contract(&address).await }
                        .boxed()
                        .shared();
                    let generation = inner.generation;
                    inner.state = LoadState::Loading {
                        generation,
                        pending: pending.clone(),
                    };
                    (generation, pending)
                }
            }
        };

        let result = pending.await;

        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;
        // The address may have changed while we waited; that load is stale.
        if inner.generation == generation && matches!(inner.state, LoadState::Loading { .. }) {
            inner.state = match &result {
                Ok(handle) => LoadState::Loaded(handle.clone()),
                Err(e) => {
                    warn!(address = %inner.address, error = %e, "contract load failed");
                    LoadState::Failed(e.clone())
                }
            };
        }

        Ok(result?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SdkError;
    use crate::gateway::MockCourt;
    use std::time::Duration;

    #[tokio::test]
    async fn test_concurrent_loads_share_one_gateway_call() {
        let court = MockCourt::new("0xcourt").with_latency(Duration::from_millis(20));
        let loader = Arc::new(ContractLoader::new(Arc::new(court.clone()), "0xcourt"));

        let (a, b) = tokio::join!(loader.load(), loader.load());
        assert_eq!(a.unwrap(), b.unwrap());
        assert_eq!(court.load_count(), 1);

        // Already loaded: no further gateway calls
        loader.load().await.unwrap();
        assert_eq!(court.load_count(), 1);
        assert!(matches!(loader.status().await, LoadStatus::Loaded(_)));
    }

    #[tokio::test]
    async fn test_failed_load_is_retried() {
        let court = MockCourt::new("0xcourt");
        court.fail_next(1);
        let loader = ContractLoader::new(Arc::new(court.clone()), "0xcourt");

        let err = loader.load().await.unwrap_err();
        assert!(err.is_transport());
        assert!(matches!(loader.status().await, LoadStatus::Failed(_)));

        let handle = loader.load().await.unwrap();
        assert_eq!(handle.address, "0xcourt");
        assert_eq!(court.load_count(), 2);
    }

    #[tokio::test]
    async fn test_unknown_address_is_not_found() {
        let court = MockCourt::new("0xcourt");
        let loader = ContractLoader::new(Arc::new(court.clone()), "0xelsewhere");

        let err = loader.load().await.unwrap_err();
        assert!(matches!(err, SdkError::NotFound(_)));

        loader.set_contract_address("0xCOURT").await;
        assert_eq!(loader.status().await, LoadStatus::Unloaded);
        assert_eq!(loader.load().await.unwrap().address, "0xcourt");
    }
}
