//! Contract gateway abstraction layer.
//!
//! - `traits`: the read-only [`ContractGateway`] capability
//! - `types`: logs, filters and court state values
//! - `loader`: lazy shared contract loading
//! - `simulate`: simulate-then-execute action wrapping
//! - `mock`: in-memory court for tests

pub mod loader;
pub mod mock;
pub mod simulate;
pub mod traits;
pub mod types;

pub use loader::{ContractLoader, LoadStatus};
pub use mock::MockCourt;
pub use simulate::{wrap, ContractAction, Simulated};
pub use traits::{ContractGateway, GatewayError, GatewayResult};
pub use types::*;
