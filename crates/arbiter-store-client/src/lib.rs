//! Rust client for the arbitration profile store
//!
//! The store holds one JSON document per account (watermarks, notifications,
//! dispute references, contracts) plus shared dispute documents. It offers no
//! transactions, so every profile mutation is funnelled through an ordered
//! [`WriteQueue`].
//!
//! # Example
//!
//! ```rust,no_run
//! use arbiter_store_client::{ProfileStore, QueuePartition, StoreConfig};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = ProfileStore::new(
//!     StoreConfig {
//!         base_url: "http://localhost:8080".into(),
//!         ..Default::default()
//!     },
//!     QueuePartition::PerDocument,
//! )?;
//!
//! store.set_up_user_profile("0xabc").await?;
//! store.update_last_block("0xabc", "0xcourt", 1_200);
//!
//! // Observes the watermark update queued above
//! let unread = store.get_unread_notifications("0xabc").await?;
//! println!("{} unread", unread.len());
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod error;
pub mod queue;
pub mod store;
pub mod types;

// Stateful fake of the store for tests (ours and downstream crates')
#[cfg(any(test, feature = "test-util"))]
pub mod testing;

// Re-export main types
pub use client::{ProfileStoreClient, StoreConfig};
pub use error::{Result, StoreError};
pub use queue::{BodyFuture, QueuePartition, WriteFailure, WriteQueue};
pub use store::ProfileStore;
pub use types::*;
