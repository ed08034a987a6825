//! Ordered write queue for the profile store
//!
//! Gives read-after-write consistency on top of a store that has none:
//! - Every task for a partition runs strictly after the previous one settled
//! - Writes carry a deferred body producer, so read-modify-write sees the
//!   document as left by every earlier task
//! - Reads queued behind writes observe them
//! - A failed task never stalls or reorders the rest of the queue

use crate::client::ProfileStoreClient;
use crate::error::{Result, StoreError};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::FutureExt;
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, warn};

/// Future returned by a body producer. `Ok(None)` means there is nothing to
/// write and the task settles without a request.
pub type BodyFuture = BoxFuture<'static, Result<Option<Value>>>;

type BodyProducer = Box<dyn FnOnce() -> BodyFuture + Send>;

/// Capacity of the failure side channel before slow subscribers lag
const FAILURE_CHANNEL_CAPACITY: usize = 64;

/// How long a partition lane waits for work before its pump exits
pub const DEFAULT_LANE_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// How tasks are split into independent FIFOs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueuePartition {
    /// One FIFO per top-level store document (account address, or the
    /// shared `arbitrators` tree). Unrelated accounts do not wait on each other.
    #[default]
    PerDocument,
    /// A single FIFO for every task
    Global,
}

/// A fire-and-forget write that failed
#[derive(Debug, Clone)]
pub struct WriteFailure {
    pub verb: Method,
    pub uri: String,
    pub error: String,
}

enum WriteTask {
    Write {
        producer: BodyProducer,
        verb: Method,
        uri: String,
    },
    Read {
        uri: String,
        reply: oneshot::Sender<Result<Option<Value>>>,
    },
    Barrier {
        uri: String,
        reply: oneshot::Sender<()>,
    },
}

impl WriteTask {
    fn uri(&self) -> &str {
        match self {
            WriteTask::Write { uri, .. } | WriteTask::Read { uri, .. } | WriteTask::Barrier { uri, .. } => uri,
        }
    }
}

struct Lane {
    id: u64,
    sender: mpsc::UnboundedSender<WriteTask>,
}

/// Serializes store operations per partition
///
/// Must be used from within a Tokio runtime; each partition is pumped by its
/// own task, spawned on first use. A pump that stays idle for the idle
/// timeout exits and drops its partition, so the number of live lanes
/// follows the recently active documents rather than every one ever seen.
///
/// # Example
///
/// ```rust,ignore
/// let queue = WriteQueue::new(client.clone(), QueuePartition::PerDocument);
///
/// let uri = client.profile_uri("0xabc");
/// let c = client.clone();
/// queue.queue_write(
///     move || async move {
///         let mut profile = c.get_user_profile("0xabc").await?.unwrap_or_default();
///         profile.session = Some(5);
///         Ok(Some(serde_json::to_value(&profile)?))
///     },
///     Method::POST,
///     uri.clone(),
/// );
///
/// // Resolves only after the write above has completed its round-trip
/// let profile = queue.queue_read(&uri).await?;
/// ```
pub struct WriteQueue {
    client: Arc<ProfileStoreClient>,
    partition: QueuePartition,
    lanes: Arc<DashMap<String, Lane>>,
    next_lane: AtomicU64,
    idle_timeout: Duration,
    failures: broadcast::Sender<WriteFailure>,
}

impl WriteQueue {
    pub fn new(client: Arc<ProfileStoreClient>, partition: QueuePartition) -> Self {
        let (failures, _) = broadcast::channel(FAILURE_CHANNEL_CAPACITY);
        Self {
            client,
            partition,
            lanes: Arc::new(DashMap::new()),
            next_lane: AtomicU64::new(0),
            idle_timeout: DEFAULT_LANE_IDLE_TIMEOUT,
            failures,
        }
    }

    /// Retire lanes after `timeout` without work. Applies to lanes started
    /// from now on.
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn partition(&self) -> QueuePartition {
        self.partition
    }

    /// Number of partitions with a live lane
    pub fn active_partitions(&self) -> usize {
        self.lanes.len()
    }

    /// Receive every fire-and-forget write failure from now on
    pub fn subscribe_failures(&self) -> broadcast::Receiver<WriteFailure> {
        self.failures.subscribe()
    }

    /// Append a write to the tail of its partition and return immediately.
    ///
    /// `producer` runs when the task reaches the head of the queue. Failures
    /// are logged and published on [`WriteQueue::subscribe_failures`].
    pub fn queue_write<F, Fut>(&self, producer: F, verb: Method, uri: impl Into<String>)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Option<Value>>> + Send + 'static,
    {
        let producer: BodyProducer = Box::new(move || producer().boxed());
        self.enqueue(WriteTask::Write {
            producer,
            verb,
            uri: uri.into(),
        });
    }

    /// Append a GET to the tail of its partition and wait for it.
    ///
    /// Resolves after every task queued before it in the same partition has
    /// completed. `Ok(None)` when the document does not exist.
    pub async fn queue_read(&self, uri: &str) -> Result<Option<Value>> {
        let (reply, rx) = oneshot::channel();
        self.enqueue(WriteTask::Read {
            uri: uri.to_string(),
            reply,
        });
        rx.await.map_err(|_| StoreError::QueueClosed)?
    }

    /// Resolve once every task queued so far in the partition of `uri` has
    /// settled. Sends no request.
    pub async fn settled(&self, uri: &str) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.enqueue(WriteTask::Barrier {
            uri: uri.to_string(),
            reply,
        });
        rx.await.map_err(|_| StoreError::QueueClosed)
    }

    /// Typed variant of [`WriteQueue::queue_read`]
    pub async fn queue_read_as<T: DeserializeOwned>(&self, uri: &str) -> Result<Option<T>> {
        match self.queue_read(uri).await? {
            Some(value) => serde_json::from_value(value)
                .map(Some)
                .map_err(|e| StoreError::InvalidResponse(e.to_string())),
            None => Ok(None),
        }
    }

    fn partition_key(&self, uri: &str) -> String {
        match self.partition {
            QueuePartition::Global => "*".to_string(),
            QueuePartition::PerDocument => {
                let path = uri.strip_prefix(self.client.base_url()).unwrap_or(uri);
                path.trim_start_matches('/')
                    .split(|c| c == '/' || c == '?')
                    .next()
                    .unwrap_or_default()
                    .to_lowercase()
            }
        }
    }

    fn enqueue(&self, task: WriteTask) {
        let key = self.partition_key(task.uri());
        let mut task = task;

        // Sends happen under the entry lock, which an idle pump takes
        // before it retires. A registered lane only stops if its pump
        // panicked; restart it once.
        for _ in 0..2 {
            let lane = self
                .lanes
                .entry(key.clone())
                .or_insert_with(|| self.spawn_lane(&key));

            match lane.sender.send(task) {
                Ok(()) => return,
                Err(mpsc::error::SendError(returned)) => {
                    let dead = lane.id;
                    drop(lane);
                    warn!(partition = %key, "write queue lane stopped, restarting");
                    self.lanes.remove_if(&key, |_, lane| lane.id == dead);
                    task = returned;
                }
            }
        }

        warn!(partition = %key, uri = task.uri(), "dropping task, write queue lane unavailable");
    }

    fn spawn_lane(&self, key: &str) -> Lane {
        let (sender, mut rx) = mpsc::unbounded_channel::<WriteTask>();
        let id = self.next_lane.fetch_add(1, Ordering::Relaxed);
        let client = self.client.clone();
        let failures = self.failures.clone();
        let lanes = self.lanes.clone();
        let idle_timeout = self.idle_timeout;
        let partition = key.to_string();

        tokio::spawn(async move {
            debug!(%partition, "write queue lane started");
            loop {
                let task = match tokio::time::timeout(idle_timeout, rx.recv()).await {
                    Ok(Some(task)) => task,
                    Ok(None) => break,
                    Err(_) => match retire(&lanes, &partition, id, &mut rx) {
                        Some(task) => task,
                        None => break,
                    },
                };
                run_task(&client, &failures, task).await;
            }
            debug!(%partition, "write queue lane closed");
        });

        Lane { id, sender }
    }
}

/// Unregister an idle lane. Returns the task that raced in instead, if any.
fn retire(
    lanes: &DashMap<String, Lane>,
    partition: &str,
    id: u64,
    rx: &mut mpsc::UnboundedReceiver<WriteTask>,
) -> Option<WriteTask> {
    match lanes.entry(partition.to_string()) {
        Entry::Occupied(entry) if entry.get().id == id => match rx.try_recv() {
            Ok(task) => Some(task),
            Err(_) => {
                entry.remove();
                None
            }
        },
        // Replaced or removed: nobody can reach this channel any more
        _ => rx.try_recv().ok(),
    }
}

async fn run_task(
    client: &ProfileStoreClient,
    failures: &broadcast::Sender<WriteFailure>,
    task: WriteTask,
) {
    match task {
        WriteTask::Write { producer, verb, uri } => {
            let outcome = match producer().await {
                Ok(Some(body)) => client
                    .send_json(verb.clone(), &uri, Some(&body))
                    .await
                    .map(|_| ()),
                Ok(None) => {
                    debug!(%verb, %uri, "queued write skipped, nothing to send");
                    Ok(())
                }
                Err(e) => Err(e),
            };

            if let Err(error) = outcome {
                warn!(%verb, %uri, %error, "queued write failed");
                // No subscribers is fine; the log line above is the record.
                let _ = failures.send(WriteFailure {
                    verb,
                    uri,
                    error: error.to_string(),
                });
            }
        }
        WriteTask::Read { uri, reply } => {
            let result = client.get_json(&uri).await;
            if reply.send(result).is_err() {
                debug!(%uri, "queued read settled after its caller went away");
            }
        }
        WriteTask::Barrier { reply, .. } => {
            let _ = reply.send(());
        }
    }
}
