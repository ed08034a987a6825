//! End-to-end notification flow tests
//!
//! Runs the notification service against the in-memory court and the fake
//! profile store:
//! - Stateful notifications following juror actions
//! - Event notifications persisted exactly once across overlapping scans,
//!   including scans that overlap a write still in flight
//! - Independent watches sharing the same events
//! - Ordered profile writes observed by later reads

use arbiter_sdk::gateway::Period;
use arbiter_sdk::{
    wrap, ContractAction, MockCourt, NotificationRecord, NotificationService, NotificationType,
    SdkConfig,
};
use arbiter_store_client::testing::FakeProfileStore;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use wiremock::MockServer;

const TOKEN: u128 = 1_000_000_000_000_000_000;

type Received = Arc<Mutex<Vec<NotificationRecord>>>;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

async fn start(overlap_blocks: u64) -> (MockServer, FakeProfileStore, MockCourt, NotificationService) {
    init_tracing();
    let (server, fake) = FakeProfileStore::start().await;
    let court = MockCourt::new("0xCourt");
    court.add_arbitrable("0xdeal", "0xaa", "0xbb", 3600);

    let config = SdkConfig::from_toml_str(&format!(
        r#"
        [court]
        address = "0xcourt"
        arbitrable_contracts = ["0xdeal"]

        [store]
        base_url = "{}"

        [watch]
        poll_interval_ms = 20
        overlap_blocks = {}
        "#,
        server.uri(),
        overlap_blocks
    ))
    .unwrap();

    let service = NotificationService::from_config(Arc::new(court.clone()), &config).unwrap();
    (server, fake, court, service)
}

fn collector() -> (Received, impl Fn(NotificationRecord) + Send + Sync + 'static) {
    let received: Received = Arc::new(Mutex::new(Vec::new()));
    let sink = received.clone();
    (received, move |record: NotificationRecord| sink.lock().unwrap().push(record))
}

async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    for _ in 0..300 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}

fn notification_posts(fake: &FakeProfileStore) -> usize {
    fake.requests()
        .iter()
        .filter(|(method, path)| method == "POST" && path.contains("/notifications/"))
        .count()
}

// =============================================================================
// Stateful notifications
// =============================================================================

#[tokio::test]
async fn test_activating_tokens_clears_can_activate() {
    let (_server, _fake, court, service) = start(0).await;

    let before = service.get_stateful_notifications("0xjuror", true).await.unwrap();
    assert_eq!(before.len(), 1);
    assert_eq!(before[0].notification_type, NotificationType::CanActivate);

    wrap(court.buy("0xjuror", TOKEN)).execute().await.unwrap();
    wrap(court.activate("0xjuror", TOKEN / 2)).execute().await.unwrap();

    let after = service.get_stateful_notifications("0xjuror", true).await.unwrap();
    assert!(after.is_empty(), "unexpected {:?}", after);
}

#[tokio::test]
async fn test_drawn_juror_can_vote_once() {
    let (_server, _fake, court, service) = start(0).await;
    let id = court.create_dispute("0xdeal");
    court.draw(id, 0, "0xjuror", vec![1]);
    court.pass_period();
    court.pass_period();
    assert_eq!(court.current_period(), Period::Vote);

    let records = service.get_stateful_notifications("0xjuror", true).await.unwrap();
    let votes: Vec<_> = records
        .iter()
        .filter(|r| r.notification_type == NotificationType::CanVote)
        .collect();
    assert_eq!(votes.len(), 1);
    assert_eq!(votes[0].data["disputeId"], id);
}

// =============================================================================
// Event notifications
// =============================================================================

#[tokio::test]
async fn test_dispute_created_is_persisted_once_across_overlapping_scans() {
    let (_server, fake, court, service) = start(10).await;
    let (received, callback) = collector();
    service.watch_for_events("0xaa", callback).await.unwrap();

    court.create_dispute("0xdeal");
    eventually("first delivery", || received.lock().unwrap().len() == 1).await;
    eventually("watermark", || {
        fake.profile("0xaa").map(|p| p.watermark("0xcourt")) == Some(1)
    })
    .await;

    // A fresh watch re-scans the overlap window and sees the log again
    assert!(service.stop_watching("0xaa"));
    let (again, callback) = collector();
    service.watch_for_events("0xaa", callback).await.unwrap();
    eventually("second delivery", || again.lock().unwrap().len() == 1).await;

    let stored_a = service.get_notifications("0xaa").await.unwrap();
    let stored_b = service.get_notifications("0xbb").await.unwrap();
    assert_eq!(stored_a.len(), 1);
    assert_eq!(stored_b.len(), 1);
    assert_eq!(stored_a[0].notification_type, NotificationType::DisputeCreated);
    assert_eq!(stored_b[0].notification_type, NotificationType::DisputeCreated);
    assert_eq!(stored_a[0].id, again.lock().unwrap()[0].id);

    // The second scan found both records already stored and wrote nothing
    assert_eq!(notification_posts(&fake), 2);
    service.stop_all();
}

#[tokio::test]
async fn test_overlapping_scans_before_the_first_write_settles() {
    let (_server, fake, court, service) = start(10).await;
    let (to_a, callback_a) = collector();
    let (to_b, callback_b) = collector();
    service.watch_for_events("0xaa", callback_a).await.unwrap();
    service.watch_for_events("0xbb", callback_b).await.unwrap();

    // Every store round-trip outlasts the poll interval, so both watches
    // queue inserts for both records while the first POST is in flight
    fake.set_latency(Duration::from_millis(40));
    let before = fake.requests().len();
    court.create_dispute("0xdeal");
    eventually("both parties notified", || {
        to_a.lock().unwrap().len() == 1 && to_b.lock().unwrap().len() == 1
    })
    .await;

    // Each watch checked both records for a notification and a dispute ref
    let insert_checks = fake.requests()[before..]
        .iter()
        .filter(|(method, path)| method == "GET" && (path == "/0xaa" || path == "/0xbb"))
        .count();
    assert!(insert_checks >= 8, "only {} profile reads", insert_checks);

    assert_eq!(service.get_notifications("0xaa").await.unwrap().len(), 1);
    assert_eq!(service.get_notifications("0xbb").await.unwrap().len(), 1);
    assert_eq!(notification_posts(&fake), 2);
    service.stop_all();
}

#[tokio::test]
async fn test_checksummed_parties_share_one_profile() {
    let (_server, fake, court, service) = start(0).await;
    court.add_arbitrable("0xmixed", "0xCcCc", "0xDdDd", 3600);
    let (received, callback) = collector();
    service.watch_for_events("0xCcCc", callback).await.unwrap();

    court.create_dispute("0xmixed");
    eventually("delivery", || received.lock().unwrap().len() == 1).await;
    assert_eq!(received.lock().unwrap()[0].account, "0xcccc");
    assert_eq!(received.lock().unwrap()[0].data["counterparty"], "0xdddd");

    let stored = service.get_notifications("0xCCCC").await.unwrap();
    assert_eq!(stored.len(), 1);
    let posted: Vec<String> = fake
        .requests()
        .into_iter()
        .filter(|(method, path)| method == "POST" && path.contains("/notifications/"))
        .map(|(_, path)| path)
        .collect();
    assert_eq!(posted.len(), 2);
    assert!(posted.iter().all(|path| *path == path.to_lowercase()), "{:?}", posted);
    service.stop_all();
}

#[tokio::test]
async fn test_independent_watches_share_events() {
    let (_server, fake, court, service) = start(0).await;
    let (to_a, callback_a) = collector();
    let (to_b, callback_b) = collector();
    service.watch_for_events("0xaa", callback_a).await.unwrap();
    service.watch_for_events("0xbb", callback_b).await.unwrap();

    court.create_dispute("0xdeal");
    eventually("both parties notified", || {
        to_a.lock().unwrap().len() == 1 && to_b.lock().unwrap().len() == 1
    })
    .await;
    // Let a few more ticks run
    tokio::time::sleep(Duration::from_millis(100)).await;

    let to_a = to_a.lock().unwrap().clone();
    let to_b = to_b.lock().unwrap().clone();
    assert_eq!(to_a.len(), 1);
    assert_eq!(to_b.len(), 1);
    assert_eq!(to_a[0].data["counterparty"], "0xbb");
    assert_eq!(to_b[0].data["counterparty"], "0xaa");

    // Each watch queued both records; the store kept one of each
    assert_eq!(service.get_notifications("0xaa").await.unwrap().len(), 1);
    assert_eq!(service.get_notifications("0xbb").await.unwrap().len(), 1);
    assert_eq!(notification_posts(&fake), 2);
    service.stop_all();
}

#[tokio::test]
async fn test_juror_rewards_accumulate_net_tokens() {
    let (_server, _fake, court, service) = start(0).await;
    let (received, callback) = collector();
    service.watch_for_events("0xjuror", callback).await.unwrap();

    let id = court.create_dispute("0xdeal");
    court.shift_tokens("0xjuror", id, 2_000);
    court.shift_tokens("0xjuror", id, -500);
    court.reward("0xjuror", id, 40);
    eventually("juror notifications", || received.lock().unwrap().len() == 3).await;

    let kinds: Vec<_> = received
        .lock()
        .unwrap()
        .iter()
        .map(|r| r.notification_type)
        .collect();
    assert_eq!(
        kinds,
        vec![
            NotificationType::TokenShift,
            NotificationType::TokenShift,
            NotificationType::ArbitrationReward,
        ]
    );

    let store = service.store();
    assert_eq!(store.net_tokens("0xjuror", "0xcourt", id).await.unwrap(), 1_500);
    let profile = store.read_user_profile("0xjuror").await.unwrap().unwrap();
    assert!(profile.dispute("0xcourt", id).is_some());
    service.stop_all();
}

// =============================================================================
// Ordered profile writes
// =============================================================================

#[tokio::test]
async fn test_read_observes_queued_session_update() {
    let (_server, _fake, _court, service) = start(0).await;
    let store = service.store();

    store.set_up_user_profile("0xaa").await.unwrap();
    store.update_user_profile_session("0xaa", 5);
    let profile = store.read_user_profile("0xaa").await.unwrap().unwrap();
    assert_eq!(profile.session, Some(5));
}

#[tokio::test]
async fn test_unread_notifications_after_mark_as_read() {
    let (_server, _fake, court, service) = start(0).await;
    let (received, callback) = collector();
    service.watch_for_events("0xaa", callback).await.unwrap();

    let id = court.create_dispute("0xdeal");
    court.appeal_possible(id, 1_700_000_000);
    eventually("two notifications", || received.lock().unwrap().len() == 2).await;

    let first = received.lock().unwrap()[0].clone();
    service
        .mark_notification_as_read("0xaa", first.tx_hash.as_deref().unwrap(), first.log_index.unwrap())
        .await
        .unwrap();

    let unread = service.get_unread_notifications("0xaa").await.unwrap();
    assert_eq!(unread.len(), 1);
    assert_eq!(unread[0].notification_type, NotificationType::AppealPossible);
    service.stop_all();
}
