//! Queued facade over the profile store
//!
//! Every profile mutation goes through the [`WriteQueue`] as a
//! read-modify-write, so overlapping callers never lose each other's updates
//! and reads issued afterwards see them.

use crate::client::{ProfileStoreClient, StoreConfig};
use crate::error::{Result, StoreError};
use crate::queue::{QueuePartition, WriteFailure, WriteQueue};
use crate::types::*;
use reqwest::Method;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::debug;

/// Profile store with ordered writes
#[derive(Clone)]
pub struct ProfileStore {
    client: Arc<ProfileStoreClient>,
    queue: Arc<WriteQueue>,
}

impl ProfileStore {
    pub fn new(config: StoreConfig, partition: QueuePartition) -> Result<Self> {
        Ok(Self::from_client(ProfileStoreClient::new(config)?, partition))
    }

    pub fn from_client(client: ProfileStoreClient, partition: QueuePartition) -> Self {
        let client = Arc::new(client);
        let queue = Arc::new(WriteQueue::new(client.clone(), partition));
        Self { client, queue }
    }

    /// Direct (unqueued) access to the store
    pub fn client(&self) -> &ProfileStoreClient {
        &self.client
    }

    pub fn queue(&self) -> &WriteQueue {
        &self.queue
    }

    pub fn subscribe_failures(&self) -> broadcast::Receiver<WriteFailure> {
        self.queue.subscribe_failures()
    }

    /// Wait until every write already queued for `account` has settled
    pub async fn settled(&self, account: &str) -> Result<()> {
        self.queue.settled(&self.client.profile_uri(account)).await
    }

    // ==================== Queued reads ====================

    /// Read a profile after every write already queued for it
    pub async fn read_user_profile(&self, address: &str) -> Result<Option<UserProfile>> {
        self.queue
            .queue_read_as(&self.client.profile_uri(address))
            .await
    }

    pub async fn get_notifications(&self, account: &str) -> Result<Vec<NotificationRecord>> {
        Ok(self
            .read_user_profile(account)
            .await?
            .map(|p| p.notifications)
            .unwrap_or_default())
    }

    pub async fn get_unread_notifications(&self, account: &str) -> Result<Vec<NotificationRecord>> {
        let mut notifications = self.get_notifications(account).await?;
        notifications.retain(|n| !n.read);
        Ok(notifications)
    }

    /// Net tokens shifted to `account` in one dispute, summed from its
    /// TOKEN_SHIFT notifications. Records are unique by id, so the sum is
    /// stable under duplicate delivery.
    pub async fn net_tokens(&self, account: &str, arbitrator: &str, dispute_id: u64) -> Result<i128> {
        let notifications = self.get_notifications(account).await?;
        let mut total: i128 = 0;
        for n in notifications
            .iter()
            .filter(|n| n.notification_type == NotificationType::TokenShift)
        {
            let same_dispute = n.data["disputeId"].as_u64() == Some(dispute_id)
                && n.data["arbitratorAddress"]
                    .as_str()
                    .is_some_and(|a| a.eq_ignore_ascii_case(arbitrator));
            if !same_dispute {
                continue;
            }
            let amount = n.data["amount"]
                .as_str()
                .and_then(|a| a.parse::<i128>().ok())
                .ok_or_else(|| {
                    StoreError::InvalidResponse(format!("notification {} has no numeric amount", n.id))
                })?;
            total += amount;
        }
        Ok(total)
    }

    // ==================== Queued writes ====================

    /// Overwrite the profile document. No existence check.
    pub fn new_user_profile(&self, profile: UserProfile) {
        let uri = self.client.profile_uri(&profile.address);
        self.queue.queue_write(
            move || async move { Ok(Some(serde_json::to_value(&profile)?)) },
            Method::POST,
            uri,
        );
    }

    /// Return the existing profile, creating an empty one first if needed
    pub async fn set_up_user_profile(&self, address: &str) -> Result<UserProfile> {
        if let Some(profile) = self.read_user_profile(address).await? {
            return Ok(profile);
        }

        debug!(address, "creating empty profile");
        self.new_user_profile(UserProfile::new(address));
        self.read_user_profile(address)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("profile for {} was not created", address)))
    }

    pub fn update_user_profile_session(&self, account: &str, session: u64) {
        self.queue_profile_update(account, move |profile| {
            profile.session = Some(session);
            Ok(true)
        });
    }

    /// Advance the account's watermark for `contract`. Stale values are
    /// dropped so the watermark never moves backwards.
    pub fn update_last_block(&self, account: &str, contract: &str, block: u64) {
        let contract = contract.to_string();
        self.queue_profile_update(account, move |profile| {
            Ok(profile.advance_watermark(&contract, block))
        });
    }

    /// Insert a notification unless a record with the same id already exists
    pub fn add_notification(&self, record: NotificationRecord) {
        let client = self.client.clone();
        let tx_hash = record.tx_hash.clone().unwrap_or_else(|| record.id.clone());
        let uri = client.notification_uri(&record.account, &tx_hash);

        self.queue.queue_write(
            move || async move {
                let existing = client.get_user_profile(&record.account).await?;
                if existing.is_some_and(|p| p.has_notification(&record.id)) {
                    debug!(id = %record.id, account = %record.account, "notification already stored");
                    return Ok(None);
                }
                Ok(Some(serde_json::to_value(&record)?))
            },
            Method::POST,
            uri,
        );
    }

    /// Record that `account` takes part in a dispute, once
    pub fn add_dispute_ref(&self, account: &str, reference: DisputeRef) {
        let client = self.client.clone();
        let address = account.to_string();
        let uri = client.dispute_profile_uri(account, &reference.arbitrator_address, reference.dispute_id);

        self.queue.queue_write(
            move || async move {
                let existing = client.get_user_profile(&address).await?;
                if existing
                    .is_some_and(|p| p.dispute(&reference.arbitrator_address, reference.dispute_id).is_some())
                {
                    return Ok(None);
                }
                let update = DisputeProfileUpdate {
                    appeal_draws: reference.appeal_draws,
                    arbitrator_address: reference.arbitrator_address,
                    dispute_id: reference.dispute_id,
                    net_pnk: None,
                };
                Ok(Some(serde_json::to_value(&update)?))
            },
            Method::POST,
            uri,
        );
    }

    pub fn mark_notification_as_read(&self, account: &str, tx_hash: &str, log_index: u64, read: bool) {
        let tx_hash = tx_hash.to_string();
        self.queue_profile_update(account, move |profile| {
            let notification = profile.find_notification_mut(&tx_hash, log_index).ok_or_else(|| {
                StoreError::NotFound(format!("no notification {} #{}", tx_hash, log_index))
            })?;
            if notification.read == read {
                return Ok(false);
            }
            notification.read = read;
            Ok(true)
        });
    }

    /// Queue a read-modify-write of the whole profile. `mutate` returns
    /// whether anything changed; unchanged profiles are not written.
    fn queue_profile_update<F>(&self, account: &str, mutate: F)
    where
        F: FnOnce(&mut UserProfile) -> Result<bool> + Send + 'static,
    {
        let client = self.client.clone();
        let address = account.to_string();
        let uri = client.profile_uri(account);

        self.queue.queue_write(
            move || async move {
                let mut profile = client
                    .get_user_profile(&address)
                    .await?
                    .unwrap_or_else(|| UserProfile::new(&address));
                if !mutate(&mut profile)? {
                    return Ok(None);
                }
                profile.strip_server_fields();
                if profile.address.is_empty() {
                    profile.address = address;
                }
                Ok(Some(serde_json::to_value(&profile)?))
            },
            Method::POST,
            uri,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeProfileStore;
    use serde_json::json;

    async fn setup() -> (wiremock::MockServer, FakeProfileStore, ProfileStore) {
        let (server, fake) = FakeProfileStore::start().await;
        let store = ProfileStore::new(
            StoreConfig {
                base_url: server.uri(),
                ..Default::default()
            },
            QueuePartition::PerDocument,
        )
        .unwrap();
        (server, fake, store)
    }

    fn record(id: &str, account: &str, tx: &str, log_index: u64) -> NotificationRecord {
        NotificationRecord {
            id: id.to_string(),
            notification_type: NotificationType::DisputeCreated,
            account: account.to_string(),
            tx_hash: Some(tx.to_string()),
            log_index: Some(log_index),
            message: "New dispute".to_string(),
            data: json!({ "disputeId": 0 }),
            read: false,
            created_at: 1_000,
        }
    }

    #[tokio::test]
    async fn test_set_up_user_profile_creates_once() {
        let (_server, fake, store) = setup().await;

        let profile = store.set_up_user_profile("0xaa").await.unwrap();
        assert_eq!(profile.address, "0xaa");
        assert_eq!(profile.last_block, 0);

        store.update_user_profile_session("0xaa", 3);
        let again = store.set_up_user_profile("0xaa").await.unwrap();
        assert_eq!(again.session, Some(3));
        assert!(!fake.server_fields_posted());
    }

    #[tokio::test]
    async fn test_duplicate_notifications_are_stored_once() {
        let (_server, _fake, store) = setup().await;

        // Both inserts are queued before either round-trip settles
        store.add_notification(record("n1", "0xaa", "0xtx", 0));
        store.add_notification(record("n1", "0xaa", "0xtx", 0));
        store.add_notification(record("n2", "0xaa", "0xtx", 1));

        let notifications = store.get_notifications("0xaa").await.unwrap();
        let ids: Vec<_> = notifications.iter().map(|n| n.id.as_str()).collect();
        assert_eq!(ids, vec!["n1", "n2"]);
    }

    #[tokio::test]
    async fn test_last_block_never_moves_backwards() {
        let (_server, _fake, store) = setup().await;

        store.update_last_block("0xaa", "0xcourt", 20);
        store.update_last_block("0xaa", "0xcourt", 15);

        let profile = store.read_user_profile("0xaa").await.unwrap().unwrap();
        assert_eq!(profile.watermark("0xcourt"), 20);
        assert_eq!(profile.last_block, 20);
    }

    #[tokio::test]
    async fn test_mark_notification_as_read() {
        let (_server, _fake, store) = setup().await;

        store.add_notification(record("n1", "0xaa", "0xtx", 0));
        store.add_notification(record("n2", "0xaa", "0xtx", 1));
        store.mark_notification_as_read("0xaa", "0xTX", 0, true);

        let unread = store.get_unread_notifications("0xaa").await.unwrap();
        assert_eq!(unread.len(), 1);
        assert_eq!(unread[0].id, "n2");
    }

    #[tokio::test]
    async fn test_mark_missing_notification_reports_on_side_channel() {
        let (_server, _fake, store) = setup().await;
        let mut failures = store.subscribe_failures();

        store.mark_notification_as_read("0xaa", "0xnope", 4, true);
        store.read_user_profile("0xaa").await.unwrap();

        let failure = failures.recv().await.unwrap();
        assert!(failure.error.contains("0xnope"));
    }

    #[tokio::test]
    async fn test_dispute_refs_and_dispute_data() {
        let (_server, _fake, store) = setup().await;

        store.add_dispute_ref("0xaa", DisputeRef::new("0xcourt", 2));
        store.add_dispute_ref("0xaa", DisputeRef::new("0xcourt", 2));
        let profile = store.read_user_profile("0xaa").await.unwrap().unwrap();
        assert_eq!(profile.disputes.len(), 1);

        store
            .client()
            .update_dispute(&DisputeRecord {
                dispute_id: 2,
                arbitrator_address: "0xcourt".into(),
                title: Some("Late delivery".into()),
                ..Default::default()
            })
            .await
            .unwrap();

        let data = store.client().get_dispute_data("0xcourt", 2, "0xaa").await.unwrap();
        assert_eq!(data.record.title.as_deref(), Some("Late delivery"));
        assert_eq!(data.reference.unwrap().dispute_id, 2);

        let all = store.client().get_disputes_for_user("0xaa").await.unwrap();
        assert_eq!(all.len(), 1);
    }

    #[tokio::test]
    async fn test_contracts_and_evidence() {
        let (_server, _fake, store) = setup().await;
        store.set_up_user_profile("0xaa").await.unwrap();

        let contract = ContractRecord {
            address: "0xdeal".into(),
            hash_contract: Some("hash-1".into()),
            party_b: Some("0xbb".into()),
            ..Default::default()
        };
        store.client().update_contract("0xaa", &contract).await.unwrap();
        store
            .client()
            .add_evidence_contract(
                "0xaa",
                "0xdeal",
                &Evidence {
                    name: "receipt".into(),
                    description: String::new(),
                    url: "https://evidence.test/1".into(),
                    submitted_at: 1,
                },
            )
            .await
            .unwrap();

        let by_hash = store.client().get_contract_by_hash("0xaa", "hash-1").await.unwrap().unwrap();
        assert_eq!(by_hash.party_a.as_deref(), Some("0xaa"));
        let by_address = store.client().get_contract_by_address("0xaa", "0xDEAL").await.unwrap().unwrap();
        assert_eq!(by_address.evidence.len(), 1);

        let missing = store.client().get_contract_by_hash("0xzz", "hash-1").await.unwrap_err();
        assert!(matches!(missing, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_net_tokens_sums_token_shifts() {
        let (_server, _fake, store) = setup().await;

        for (i, amount) in ["1500", "-200", "1500"].iter().enumerate() {
            let mut r = record(&format!("shift-{}", i % 2), "0xjj", "0xtx", i as u64);
            r.notification_type = NotificationType::TokenShift;
            r.data = json!({ "disputeId": 0, "arbitratorAddress": "0xcourt", "amount": amount });
            store.add_notification(r);
        }

        // shift-0 is delivered twice and counted once
        assert_eq!(store.net_tokens("0xjj", "0xCOURT", 0).await.unwrap(), 1300);
    }
}
