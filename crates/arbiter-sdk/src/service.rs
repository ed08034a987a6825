//! Notification service
//!
//! Ties the pieces together for one arbitrator contract: watches court events
//! for an account, turns them into notifications, persists them through the
//! profile store and reports the ones addressed to the account.

use crate::config::SdkConfig;
use crate::error::{Result, SdkError};
use crate::gateway::{ContractGateway, ContractHandle, ContractLoader, LogEntry};
use crate::listener::{EventListener, LogSink, WatchHandle, WatchOptions};
use crate::stateful::{Clock, StatefulNotificationComputer, SystemClock};
use crate::translator::EventNotificationTranslator;
use arbiter_store_client::{DisputeRef, NotificationRecord, ProfileStore, WriteFailure};
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::TryRecvError};
use tracing::{debug, info, warn};

/// Called with every new notification addressed to a watched account
pub type NotificationCallback = Arc<dyn Fn(NotificationRecord) + Send + Sync>;

/// Persists the notifications of one watch
struct ServiceSink {
    account: String,
    court: ContractHandle,
    translator: EventNotificationTranslator,
    store: ProfileStore,
    callback: NotificationCallback,
}

#[async_trait]
impl LogSink for ServiceSink {
    /// A batch counts as processed once its writes have settled. A failed
    /// write fails the tick, so the listener retries the batch and the
    /// watermark stays put; stored records are skipped on the retry.
    async fn on_new_logs(&self, logs: Vec<LogEntry>) -> Result<()> {
        // Translate the whole batch before writing anything, so a bad log
        // fails the tick without a partial write
        let records = self.translator.translate_all(&logs).await?;

        let mut failures = self.store.subscribe_failures();
        let mut recipients = BTreeSet::new();
        let mut delivered = HashSet::new();
        let mut own = Vec::new();
        for record in records {
            if let Some(dispute_id) = record.data["disputeId"].as_u64() {
                self.store
                    .add_dispute_ref(&record.account, DisputeRef::new(self.court.address.clone(), dispute_id));
            }
            if record.account == self.account && delivered.insert(record.id.clone()) {
                own.push(record.clone());
            }
            recipients.insert(record.account.clone());
            self.store.add_notification(record);
        }

        for recipient in &recipients {
            self.store.settled(recipient).await?;
        }
        let failed = self.failed_writes(&mut failures, &recipients);
        if failed > 0 {
            warn!(account = %self.account, failed, "notification writes failed, batch will be retried");
            return Err(SdkError::Transport(format!("{} profile writes failed", failed)));
        }

        debug!(account = %self.account, logs = logs.len(), notifications = own.len(), "processed logs");
        for record in own {
            (self.callback)(record);
        }
        Ok(())
    }

    async fn on_watermark(&self, block: u64) -> Result<()> {
        self.store.update_last_block(&self.account, &self.court.address, block);
        Ok(())
    }
}

impl ServiceSink {
    /// Failures reported since `failures` subscribed for writes under the
    /// profiles of `recipients`. A lagged receiver counts as a failure.
    fn failed_writes(
        &self,
        failures: &mut broadcast::Receiver<WriteFailure>,
        recipients: &BTreeSet<String>,
    ) -> usize {
        let prefixes: Vec<String> = recipients
            .iter()
            .map(|r| format!("{}/", self.store.client().profile_uri(r)))
            .collect();
        let mut failed = 0;
        loop {
            match failures.try_recv() {
                Ok(failure) => {
                    if prefixes.iter().any(|p| failure.uri.starts_with(p.as_str())) {
                        failed += 1;
                    }
                }
                Err(TryRecvError::Lagged(missed)) => failed += missed as usize,
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
            }
        }
        failed
    }
}

/// Notification entry point for one arbitrator contract
pub struct NotificationService {
    gateway: Arc<dyn ContractGateway>,
    loader: ContractLoader,
    store: ProfileStore,
    listener: EventListener,
    arbitrables: Vec<String>,
    options: WatchOptions,
    clock: Arc<dyn Clock>,
    watches: DashMap<String, WatchHandle>,
}

impl NotificationService {
    /// Build the service and its profile store from configuration
    pub fn from_config(gateway: Arc<dyn ContractGateway>, config: &SdkConfig) -> Result<Self> {
        config.validate()?;
        let store = ProfileStore::new(config.store_config(), config.queue.partition)?;
        Self::new(gateway, store, config)
    }

    /// Build the service around an existing store
    pub fn new(gateway: Arc<dyn ContractGateway>, store: ProfileStore, config: &SdkConfig) -> Result<Self> {
        if config.court.address.trim().is_empty() {
            return Err(SdkError::Config("court.address must be set".into()));
        }
        let options = WatchOptions::default()
            .with_poll_interval(config.poll_interval())
            .with_overlap(config.watch.overlap_blocks);

        Ok(Self {
            loader: ContractLoader::new(gateway.clone(), config.court.address.clone()),
            listener: EventListener::new(gateway.clone()),
            gateway,
            store,
            arbitrables: config.court.arbitrable_contracts.clone(),
            options,
            clock: Arc::new(SystemClock),
            watches: DashMap::new(),
        })
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn store(&self) -> &ProfileStore {
        &self.store
    }

    pub fn loader(&self) -> &ContractLoader {
        &self.loader
    }

    /// The arbitrator contract, loaded on first use
    pub async fn court(&self) -> Result<ContractHandle> {
        self.loader.load().await
    }

    /// Accounts with a running watch
    pub fn watching(&self) -> Vec<String> {
        self.watches.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Start watching court events for `account`.
    ///
    /// Creates the account's profile if needed and resumes from its stored
    /// watermark for this court. Every notification produced by the watch is
    /// stored for its recipient; those addressed to `account` are also passed
    /// to `callback`. Watching an account again replaces the previous watch.
    pub async fn watch_for_events<F>(&self, account: &str, callback: F) -> Result<()>
    where
        F: Fn(NotificationRecord) + Send + Sync + 'static,
    {
        let account = account.to_lowercase();
        let court = self.court().await?;
        let profile = self.store.set_up_user_profile(&account).await?;
        let from_block = profile.watermark(&court.address);

        let sink = ServiceSink {
            account: account.clone(),
            court: court.clone(),
            translator: EventNotificationTranslator::new(self.gateway.clone(), court.clone()),
            store: self.store.clone(),
            callback: Arc::new(callback),
        };
        let handle = self
            .listener
            .watch(court, self.options.clone().from_block(from_block), sink);

        if let Some(previous) = self.watches.insert(account.clone(), handle) {
            previous.stop();
        }
        info!(%account, from_block, "watching for events");
        Ok(())
    }

    /// Stop the watch of `account`. Returns false when there was none.
    pub fn stop_watching(&self, account: &str) -> bool {
        match self.watches.remove(&account.to_lowercase()) {
            Some((account, handle)) => {
                handle.stop();
                info!(%account, "stopped watching");
                true
            }
            None => false,
        }
    }

    pub fn stop_all(&self) {
        let accounts = self.watching();
        for account in accounts {
            self.stop_watching(&account);
        }
    }

    /// What `account` can act on right now; see [`StatefulNotificationComputer`]
    pub async fn get_stateful_notifications(
        &self,
        account: &str,
        include_juror_checks: bool,
    ) -> Result<Vec<NotificationRecord>> {
        let court = self.court().await?;
        StatefulNotificationComputer::new(self.gateway.clone(), court, self.arbitrables.clone())
            .with_clock(self.clock.clone())
            .get_stateful_notifications(account, include_juror_checks)
            .await
    }

    /// Stored notifications, after every write already queued
    pub async fn get_notifications(&self, account: &str) -> Result<Vec<NotificationRecord>> {
        Ok(self.store.get_notifications(&account.to_lowercase()).await?)
    }

    pub async fn get_unread_notifications(&self, account: &str) -> Result<Vec<NotificationRecord>> {
        Ok(self.store.get_unread_notifications(&account.to_lowercase()).await?)
    }

    /// Mark the notification produced by `(tx_hash, log_index)` as read.
    /// Fails with `NotFound` when the account has no such notification.
    pub async fn mark_notification_as_read(&self, account: &str, tx_hash: &str, log_index: u64) -> Result<()> {
        let account = account.to_lowercase();
        let exists = self.store.get_notifications(&account).await?.iter().any(|n| {
            n.log_index == Some(log_index)
                && n.tx_hash.as_deref().is_some_and(|tx| tx.eq_ignore_ascii_case(tx_hash))
        });
        if !exists {
            return Err(SdkError::NotFound(format!(
                "{} has no notification {} #{}",
                account, tx_hash, log_index
            )));
        }
        self.store.mark_notification_as_read(&account, tx_hash, log_index, true);
        Ok(())
    }
}
