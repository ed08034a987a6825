//! HTTP client for the profile store
//!
//! One JSON document per account plus shared dispute documents under
//! `arbitrators/`. Every call here goes straight to the network; use
//! [`crate::ProfileStore`] when a write must be ordered against other writes.

use crate::error::{Result, StoreError};
use crate::types::*;
use reqwest::{header, Client, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

/// Configuration for [`ProfileStoreClient`]
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Base URI of the store, e.g. `https://store.example.com/profiles`
    pub base_url: String,
    /// Optional bearer token
    pub api_key: Option<String>,
    /// Per-request timeout
    pub timeout_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080".to_string(),
            api_key: None,
            timeout_secs: 30,
        }
    }
}

/// HTTP client for the profile store
///
/// # Example
///
/// ```rust,no_run
/// use arbiter_store_client::{ProfileStoreClient, StoreConfig};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let client = ProfileStoreClient::new(StoreConfig {
///     base_url: "http://localhost:8080".into(),
///     ..Default::default()
/// })?;
///
/// if let Some(profile) = client.get_user_profile("0xabc").await? {
///     println!("last block {}", profile.last_block);
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct ProfileStoreClient {
    config: StoreConfig,
    client: Client,
}

impl ProfileStoreClient {
    /// Create a new store client
    pub fn new(config: StoreConfig) -> Result<Self> {
        let mut headers = header::HeaderMap::new();
        if let Some(ref api_key) = config.api_key {
            let value = header::HeaderValue::from_str(&format!("Bearer {}", api_key))
                .map_err(|e| StoreError::InvalidResponse(format!("invalid API key: {}", e)))?;
            headers.insert(header::AUTHORIZATION, value);
        }

        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self { config, client })
    }

    /// Base URI without a trailing slash
    pub fn base_url(&self) -> &str {
        self.config.base_url.trim_end_matches('/')
    }

    // ==================== URIs ====================

    pub fn profile_uri(&self, address: &str) -> String {
        format!("{}/{}", self.base_url(), urlencoding::encode(address))
    }

    pub fn contract_uri(&self, address: &str, contract: &str) -> String {
        format!(
            "{}/contracts/{}",
            self.profile_uri(address),
            urlencoding::encode(contract)
        )
    }

    pub fn evidence_uri(&self, address: &str, contract: &str) -> String {
        format!("{}/evidence", self.contract_uri(address, contract))
    }

    pub fn dispute_uri(&self, arbitrator: &str, dispute_id: u64) -> String {
        format!(
            "{}/arbitrators/{}/disputes/{}",
            self.base_url(),
            urlencoding::encode(arbitrator),
            dispute_id
        )
    }

    pub fn dispute_profile_uri(&self, address: &str, arbitrator: &str, dispute_id: u64) -> String {
        format!(
            "{}/arbitrators/{}/disputes/{}",
            self.profile_uri(address),
            urlencoding::encode(arbitrator),
            dispute_id
        )
    }

    pub fn notification_uri(&self, address: &str, tx_hash: &str) -> String {
        format!(
            "{}/notifications/{}",
            self.profile_uri(address),
            urlencoding::encode(tx_hash)
        )
    }

    // ==================== Raw requests ====================

    /// GET a JSON document. `Ok(None)` when the store has nothing there.
    pub async fn get_json(&self, uri: &str) -> Result<Option<Value>> {
        self.send_json(Method::GET, uri, None).await
    }

    /// Send a request with an optional JSON body and return the response body
    pub async fn send_json(
        &self,
        method: Method,
        uri: &str,
        body: Option<&Value>,
    ) -> Result<Option<Value>> {
        debug!(%method, uri, "store request");

        let mut request = self.client.request(method.clone(), uri);
        if let Some(body) = body {
            request = request
                .header(header::CONTENT_TYPE, "application/json;charset=UTF-8")
                .body(serde_json::to_vec(body)?);
        }

        let response = request.send().await?;
        self.handle_response(response).await
    }

    // ==================== Reads ====================

    pub async fn get_user_profile(&self, address: &str) -> Result<Option<UserProfile>> {
        let uri = self.profile_uri(address);
        decode_opt(self.get_json(&uri).await?)
    }

    pub async fn get_dispute(&self, arbitrator: &str, dispute_id: u64) -> Result<Option<DisputeRecord>> {
        let uri = self.dispute_uri(arbitrator, dispute_id);
        decode_opt(self.get_json(&uri).await?)
    }

    /// Shared dispute document joined with the user's own reference
    pub async fn get_dispute_data(
        &self,
        arbitrator: &str,
        dispute_id: u64,
        user: &str,
    ) -> Result<DisputeData> {
        let profile = self
            .get_user_profile(user)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("no profile for address {}", user)))?;

        let reference = profile.dispute(arbitrator, dispute_id).cloned();
        let record = self
            .get_dispute(arbitrator, dispute_id)
            .await?
            .unwrap_or_else(|| DisputeRecord {
                dispute_id,
                arbitrator_address: arbitrator.to_string(),
                ..Default::default()
            });

        Ok(DisputeData { record, reference })
    }

    pub async fn get_contract_by_hash(&self, user: &str, hash: &str) -> Result<Option<ContractRecord>> {
        let profile = self
            .get_user_profile(user)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("no profile for address {}", user)))?;

        Ok(profile
            .contracts
            .into_iter()
            .find(|c| c.hash_contract.as_deref() == Some(hash)))
    }

    pub async fn get_contract_by_address(
        &self,
        user: &str,
        contract: &str,
    ) -> Result<Option<ContractRecord>> {
        let profile = self
            .get_user_profile(user)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("no profile for address {}", user)))?;

        Ok(profile.contract(contract).cloned())
    }

    /// Every dispute referenced from the user's profile, joined with its
    /// shared document. Disputes the store no longer has are skipped.
    pub async fn get_disputes_for_user(&self, address: &str) -> Result<Vec<DisputeData>> {
        let Some(profile) = self.get_user_profile(address).await? else {
            return Ok(Vec::new());
        };

        let mut disputes = Vec::new();
        for reference in profile.disputes {
            if reference.arbitrator_address.is_empty() {
                continue;
            }
            if let Some(record) = self
                .get_dispute(&reference.arbitrator_address, reference.dispute_id)
                .await?
            {
                disputes.push(DisputeData {
                    record,
                    reference: Some(reference),
                });
            }
        }

        Ok(disputes)
    }

    pub async fn get_last_block(&self, account: &str) -> Result<u64> {
        Ok(self
            .get_user_profile(account)
            .await?
            .map(|p| p.last_block)
            .unwrap_or(0))
    }

    // ==================== Direct writes ====================

    /// Overwrite the whole profile document
    pub async fn post_user_profile(&self, profile: &UserProfile) -> Result<Option<Value>> {
        let uri = self.profile_uri(&profile.address);
        let body = serde_json::to_value(profile)?;
        self.send_json(Method::POST, &uri, Some(&body)).await
    }

    pub async fn update_contract(&self, account: &str, contract: &ContractRecord) -> Result<Option<Value>> {
        let uri = self.contract_uri(account, &contract.address);
        let mut record = contract.clone();
        record.party_a.get_or_insert_with(|| account.to_string());
        let body = serde_json::to_value(&record)?;
        self.send_json(Method::POST, &uri, Some(&body)).await
    }

    pub async fn add_evidence_contract(
        &self,
        account: &str,
        contract: &str,
        evidence: &Evidence,
    ) -> Result<Option<Value>> {
        let uri = self.evidence_uri(account, contract);
        let body = serde_json::to_value(evidence)?;
        self.send_json(Method::POST, &uri, Some(&body)).await
    }

    pub async fn update_dispute_profile(
        &self,
        account: &str,
        update: &DisputeProfileUpdate,
    ) -> Result<Option<Value>> {
        let uri = self.dispute_profile_uri(account, &update.arbitrator_address, update.dispute_id);
        let body = serde_json::to_value(update)?;
        self.send_json(Method::POST, &uri, Some(&body)).await
    }

    pub async fn update_dispute(&self, dispute: &DisputeRecord) -> Result<Option<Value>> {
        let uri = self.dispute_uri(&dispute.arbitrator_address, dispute.dispute_id);
        let body = serde_json::to_value(dispute)?;
        self.send_json(Method::POST, &uri, Some(&body)).await
    }

    /// Append a notification to the recipient's profile. No duplicate check;
    /// see [`crate::ProfileStore::add_notification`] for the idempotent path.
    pub async fn new_notification(&self, record: &NotificationRecord) -> Result<Option<Value>> {
        let tx_hash = record.tx_hash.as_deref().unwrap_or(&record.id);
        let uri = self.notification_uri(&record.account, tx_hash);
        let body = serde_json::to_value(record)?;
        self.send_json(Method::POST, &uri, Some(&body)).await
    }

    // ==================== Helper Methods ====================

    async fn handle_response(&self, response: reqwest::Response) -> Result<Option<Value>> {
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(StoreError::Server {
                status,
                message: body,
            });
        }

        let text = response.text().await?;
        if text.trim().is_empty() {
            return Ok(None);
        }

        match serde_json::from_str::<Value>(&text) {
            Ok(Value::Null) => Ok(None),
            Ok(value) => Ok(Some(value)),
            Err(e) => Err(StoreError::InvalidResponse(format!("malformed JSON body: {}", e))),
        }
    }
}

fn decode_opt<T: DeserializeOwned>(value: Option<Value>) -> Result<Option<T>> {
    match value {
        Some(value) => serde_json::from_value(value)
            .map(Some)
            .map_err(|e| StoreError::InvalidResponse(e.to_string())),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(base: &str) -> ProfileStoreClient {
        ProfileStoreClient::new(StoreConfig {
            base_url: base.to_string(),
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_uris_are_built_from_base() {
        let client = client("http://store.test/profiles/");
        assert_eq!(client.profile_uri("0xaa"), "http://store.test/profiles/0xaa");
        assert_eq!(
            client.evidence_uri("0xaa", "0xcc"),
            "http://store.test/profiles/0xaa/contracts/0xcc/evidence"
        );
        assert_eq!(
            client.dispute_uri("0xcourt", 3),
            "http://store.test/profiles/arbitrators/0xcourt/disputes/3"
        );
        assert_eq!(
            client.dispute_profile_uri("0xaa", "0xcourt", 3),
            "http://store.test/profiles/0xaa/arbitrators/0xcourt/disputes/3"
        );
        assert_eq!(
            client.notification_uri("0xaa", "0xtx"),
            "http://store.test/profiles/0xaa/notifications/0xtx"
        );
    }

    #[test]
    fn test_decode_opt_rejects_malformed_documents() {
        let bad = serde_json::json!({ "lastBlock": "not a number" });
        let err = decode_opt::<UserProfile>(Some(bad)).unwrap_err();
        assert!(matches!(err, StoreError::InvalidResponse(_)));
        assert!(decode_opt::<UserProfile>(None).unwrap().is_none());
    }
}
