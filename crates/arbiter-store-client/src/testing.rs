//! In-memory profile store served over HTTP for tests
//!
//! Mount it on a [`wiremock::MockServer`] and point a [`crate::StoreConfig`]
//! at `server.uri()`. It keeps real state, so read-modify-write sequences
//! behave as they would against the hosted store.

use crate::types::{DisputeRecord, UserProfile};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use wiremock::matchers::any;
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

#[derive(Default)]
struct State {
    profiles: BTreeMap<String, Value>,
    disputes: BTreeMap<(String, u64), Value>,
    requests: Vec<(String, String)>,
    fail_next: usize,
    latency: Duration,
    server_fields_posted: bool,
}

/// Stateful fake of the profile store
#[derive(Clone, Default)]
pub struct FakeProfileStore {
    state: Arc<Mutex<State>>,
}

impl FakeProfileStore {
    /// Start a mock server with a fresh store mounted on every path
    pub async fn start() -> (MockServer, Self) {
        let server = MockServer::start().await;
        let store = Self::default();
        Mock::given(any())
            .respond_with(store.clone())
            .mount(&server)
            .await;
        (server, store)
    }

    fn state(&self) -> MutexGuard<'_, State> {
        // A panicking test thread must not hide the state from the next assertion
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn profile(&self, address: &str) -> Option<UserProfile> {
        let state = self.state();
        let raw = state.profiles.get(&address.to_lowercase())?.clone();
        serde_json::from_value(raw).ok()
    }

    pub fn insert_profile(&self, profile: &UserProfile) {
        if let Ok(value) = serde_json::to_value(profile) {
            self.state()
                .profiles
                .insert(profile.address.to_lowercase(), value);
        }
    }

    /// Seed a raw profile document, e.g. one with legacy or unknown fields
    pub fn insert_raw_profile(&self, address: &str, document: Value) {
        self.state().profiles.insert(address.to_lowercase(), document);
    }

    pub fn dispute(&self, arbitrator: &str, dispute_id: u64) -> Option<DisputeRecord> {
        let state = self.state();
        let raw = state
            .disputes
            .get(&(arbitrator.to_lowercase(), dispute_id))?
            .clone();
        serde_json::from_value(raw).ok()
    }

    /// Answer the next `n` requests with a 500
    pub fn fail_next(&self, n: usize) {
        self.state().fail_next = n;
    }

    /// Delay every response by `latency`. State changes still apply on
    /// arrival, before the caller sees the response.
    pub fn set_latency(&self, latency: Duration) {
        self.state().latency = latency;
    }

    /// Every request seen so far as `(method, path)`
    pub fn requests(&self) -> Vec<(String, String)> {
        self.state().requests.clone()
    }

    pub fn count(&self, method: &str) -> usize {
        self.state()
            .requests
            .iter()
            .filter(|(m, _)| m.eq_ignore_ascii_case(method))
            .count()
    }

    /// Whether any profile POST carried `_id` or `_createdAt`
    pub fn server_fields_posted(&self) -> bool {
        self.state().server_fields_posted
    }

    fn handle(&self, method: &str, segments: &[String], body: Option<Value>) -> ResponseTemplate {
        let mut state = self.state();
        let seg: Vec<&str> = segments.iter().map(String::as_str).collect();

        match (method, seg.as_slice()) {
            ("GET", ["arbitrators", arbitrator, "disputes", id]) => {
                let Ok(id) = id.parse::<u64>() else {
                    return ResponseTemplate::new(400);
                };
                match state.disputes.get(&(arbitrator.to_lowercase(), id)) {
                    Some(doc) => ResponseTemplate::new(200).set_body_json(doc),
                    None => ResponseTemplate::new(404),
                }
            }
            ("POST", ["arbitrators", arbitrator, "disputes", id]) => {
                let (Ok(id), Some(body)) = (id.parse::<u64>(), body) else {
                    return ResponseTemplate::new(400);
                };
                let key = (arbitrator.to_lowercase(), id);
                let doc = state
                    .disputes
                    .entry(key)
                    .or_insert_with(|| json!({}));
                merge(doc, body);
                ResponseTemplate::new(200).set_body_json(doc.clone())
            }
            ("GET", [address]) => match state.profiles.get(&address.to_lowercase()) {
                Some(doc) => {
                    let mut doc = doc.clone();
                    if let Some(obj) = doc.as_object_mut() {
                        obj.insert("_id".into(), json!(format!("doc-{}", address.to_lowercase())));
                        obj.insert("_createdAt".into(), json!("2018-06-01T00:00:00Z"));
                    }
                    ResponseTemplate::new(200).set_body_json(doc)
                }
                None => ResponseTemplate::new(404),
            },
            ("POST", [address]) => {
                let Some(mut body) = body else {
                    return ResponseTemplate::new(400);
                };
                if let Some(obj) = body.as_object_mut() {
                    let had_id = obj.remove("_id").is_some();
                    let had_created = obj.remove("_createdAt").is_some();
                    state.server_fields_posted |= had_id || had_created;
                }
                state.profiles.insert(address.to_lowercase(), body.clone());
                ResponseTemplate::new(201).set_body_json(body)
            }
            ("POST", [address, "notifications", _tx]) => {
                let Some(body) = body else {
                    return ResponseTemplate::new(400);
                };
                let profile = profile_entry(&mut state, address);
                push(profile, "notifications", body.clone());
                ResponseTemplate::new(201).set_body_json(body)
            }
            ("POST", [address, "contracts", contract]) => {
                let Some(mut body) = body else {
                    return ResponseTemplate::new(400);
                };
                if let Some(obj) = body.as_object_mut() {
                    obj.insert("address".into(), json!(contract));
                }
                let profile = profile_entry(&mut state, address);
                let contracts = array(profile, "contracts");
                match contracts.iter_mut().find(|c| same_address(c, contract)) {
                    Some(existing) => merge(existing, body.clone()),
                    None => contracts.push(body.clone()),
                }
                ResponseTemplate::new(201).set_body_json(body)
            }
            ("POST", [address, "contracts", contract, "evidence"]) => {
                let Some(body) = body else {
                    return ResponseTemplate::new(400);
                };
                let profile = profile_entry(&mut state, address);
                let contracts = array(profile, "contracts");
                let Some(existing) = contracts.iter_mut().find(|c| same_address(c, contract)) else {
                    return ResponseTemplate::new(404);
                };
                push(existing, "evidence", body.clone());
                ResponseTemplate::new(201).set_body_json(body)
            }
            ("POST", [address, "arbitrators", arbitrator, "disputes", id]) => {
                let (Ok(id), Some(body)) = (id.parse::<u64>(), body) else {
                    return ResponseTemplate::new(400);
                };
                let profile = profile_entry(&mut state, address);
                let disputes = array(profile, "disputes");
                let found = disputes.iter_mut().find(|d| {
                    d["disputeId"].as_u64() == Some(id)
                        && d["arbitratorAddress"]
                            .as_str()
                            .is_some_and(|a| a.eq_ignore_ascii_case(arbitrator))
                });
                match found {
                    Some(existing) => merge(existing, body.clone()),
                    None => disputes.push(body.clone()),
                }
                ResponseTemplate::new(201).set_body_json(body)
            }
            _ => ResponseTemplate::new(404),
        }
    }
}

impl Respond for FakeProfileStore {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let method = request.method.as_str().to_uppercase();
        let path = request.url.path().to_string();
        let latency = {
            let mut state = self.state();
            state.requests.push((method.clone(), path.clone()));
            if state.fail_next > 0 {
                state.fail_next -= 1;
                return ResponseTemplate::new(500)
                    .set_body_string("injected failure")
                    .set_delay(state.latency);
            }
            state.latency
        };

        let segments: Vec<String> = path
            .split('/')
            .filter(|s| !s.is_empty())
            .map(|s| {
                urlencoding::decode(s)
                    .map(|d| d.into_owned())
                    .unwrap_or_else(|_| s.to_string())
            })
            .collect();

        let body = if request.body.is_empty() {
            None
        } else {
            match serde_json::from_slice::<Value>(&request.body) {
                Ok(body) => Some(body),
                Err(_) => return ResponseTemplate::new(400),
            }
        };

        self.handle(&method, &segments, body).set_delay(latency)
    }
}

fn profile_entry<'a>(state: &'a mut State, address: &str) -> &'a mut Value {
    state
        .profiles
        .entry(address.to_lowercase())
        .or_insert_with(|| json!({ "address": address, "lastBlock": 0 }))
}

fn array<'a>(doc: &'a mut Value, field: &str) -> &'a mut Vec<Value> {
    if !doc.is_object() {
        *doc = Value::Object(Map::new());
    }
    let slot = &mut doc[field];
    if !slot.is_array() {
        *slot = Value::Array(Vec::new());
    }
    match slot {
        Value::Array(items) => items,
        _ => unreachable!("slot was just set to an array"),
    }
}

fn push(doc: &mut Value, field: &str, item: Value) {
    array(doc, field).push(item);
}

fn same_address(doc: &Value, address: &str) -> bool {
    doc["address"]
        .as_str()
        .is_some_and(|a| a.eq_ignore_ascii_case(address))
}

/// Shallow merge of `patch` into `doc`
fn merge(doc: &mut Value, patch: Value) {
    match patch {
        Value::Object(fields) if doc.is_object() => {
            if let Some(target) = doc.as_object_mut() {
                target.extend(fields);
            }
        }
        patch => *doc = patch,
    }
}
