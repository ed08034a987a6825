//! Arbiter SDK - dispute notifications for arbitration court participants
//!
//! Watches an arbitrator contract for events, turns them into per-account
//! notifications persisted in the profile store, and computes the actions an
//! account can take right now from live contract state.
//!
//! ## Layers
//!
//! - `gateway`: read-only contract access ([`ContractGateway`]), lazy
//!   contract loading, simulate-then-execute actions and an in-memory court
//! - `listener`: log retrieval and polling watch loops
//! - `translator`: event logs to notifications
//! - `stateful`: notifications derived from live state
//! - `service`: the wiring of all of the above for one court
//!
//! ## Example
//!
//! ```rust,no_run
//! use arbiter_sdk::{MockCourt, NotificationService, SdkConfig};
//! use std::sync::Arc;
//!
//! # async fn example() -> arbiter_sdk::Result<()> {
//! let config = SdkConfig::from_file("arbiter.toml")?;
//! let court = MockCourt::new(config.court.address.clone());
//! let service = NotificationService::from_config(Arc::new(court), &config)?;
//!
//! service
//!     .watch_for_events("0xabc", |n| println!("{}: {}", n.notification_type, n.message))
//!     .await?;
//!
//! for n in service.get_stateful_notifications("0xabc", true).await? {
//!     println!("you can: {}", n.notification_type);
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod gateway;
pub mod listener;
pub mod notification;
pub mod service;
pub mod stateful;
pub mod translator;

pub use config::SdkConfig;
pub use error::{Result, SdkError};
pub use gateway::{
    wrap, ContractAction, ContractGateway, ContractHandle, ContractLoader, GatewayError, LoadStatus,
    LogEntry, MockCourt, Simulated,
};
pub use listener::{EventListener, LogSink, WatchHandle, WatchOptions};
pub use service::{NotificationCallback, NotificationService};
pub use stateful::{Clock, FixedClock, StatefulNotificationComputer, SystemClock};
pub use translator::EventNotificationTranslator;

pub use arbiter_store_client::{NotificationRecord, NotificationType};
