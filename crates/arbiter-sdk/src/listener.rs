//! Event log retrieval and polling watch loops
//!
//! A watch is a single task that, every poll interval:
//! 1. Resolves the head block and fetches logs in `(watermark - overlap, head]`
//! 2. Drops logs it has already delivered (tracked by transaction hash and log index)
//! 3. Hands the rest to its [`LogSink`] in `(block, log index)` order
//! 4. Advances the watermark to the head
//!
//! Any failure leaves the watermark and the seen-set untouched, so the next
//! tick fetches the same range again (at-least-once delivery).

use crate::error::{Result, SdkError};
use crate::gateway::{BlockTag, ContractGateway, ContractHandle, LogEntry, LogFilter};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Receives the logs of a watch
#[async_trait]
pub trait LogSink: Send + Sync {
    /// New logs, in chain order. An error fails the tick and the same logs are
    /// offered again on the next one.
    async fn on_new_logs(&self, logs: Vec<LogEntry>) -> Result<()>;

    /// The watch has processed every log up to and including `block`
    async fn on_watermark(&self, _block: u64) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl<T: LogSink + ?Sized> LogSink for Arc<T> {
    async fn on_new_logs(&self, logs: Vec<LogEntry>) -> Result<()> {
        (**self).on_new_logs(logs).await
    }

    async fn on_watermark(&self, block: u64) -> Result<()> {
        (**self).on_watermark(block).await
    }
}

#[async_trait]
impl LogSink for mpsc::UnboundedSender<Vec<LogEntry>> {
    async fn on_new_logs(&self, logs: Vec<LogEntry>) -> Result<()> {
        self.send(logs)
            .map_err(|_| SdkError::State("log receiver dropped".into()))
    }
}

/// Watch parameters
#[derive(Debug, Clone)]
pub struct WatchOptions {
    /// Starting watermark; logs at or below it are not fetched
    pub from_block: u64,
    pub poll_interval: Duration,
    /// Blocks below the watermark to fetch again on every tick
    pub overlap_blocks: u64,
    /// Only this event, or all events when `None`
    pub event_name: Option<String>,
    /// Decoded-argument equality constraints
    pub args: Map<String, Value>,
}

impl Default for WatchOptions {
    fn default() -> Self {
        Self {
            from_block: 0,
            poll_interval: Duration::from_millis(1000),
            overlap_blocks: 0,
            event_name: None,
            args: Map::new(),
        }
    }
}

impl WatchOptions {
    pub fn from_block(mut self, block: u64) -> Self {
        self.from_block = block;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_overlap(mut self, blocks: u64) -> Self {
        self.overlap_blocks = blocks;
        self
    }
}

/// Handle to a running watch. Dropping it stops the watch.
pub struct WatchHandle {
    stop: watch::Sender<bool>,
    task: JoinHandle<u64>,
}

impl WatchHandle {
    /// Ask the watch to stop. Takes effect at the start of the next tick; a
    /// fetch already in flight finishes but its logs are not delivered.
    pub fn stop(&self) {
        self.stop.send_replace(true);
    }

    pub fn is_stopped(&self) -> bool {
        *self.stop.borrow()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the watch to end and return its final watermark
    pub async fn join(self) -> Result<u64> {
        let WatchHandle { stop, task } = self;
        let watermark = task
            .await
            .map_err(|e| SdkError::State(format!("watch task failed: {}", e)))?;
        drop(stop);
        Ok(watermark)
    }
}

enum Tick {
    Delivered(usize),
    Discarded,
}

/// Fetches and watches contract event logs
#[derive(Clone)]
pub struct EventListener {
    gateway: Arc<dyn ContractGateway>,
}

impl EventListener {
    pub fn new(gateway: Arc<dyn ContractGateway>) -> Self {
        Self { gateway }
    }

    /// Logs of `contract` in `[from_block, to_block]`, sorted by
    /// `(block, log index)`. Gateway failures are returned, not retried.
    pub async fn get_logs(
        &self,
        contract: &ContractHandle,
        event_name: Option<&str>,
        from_block: u64,
        to_block: BlockTag,
        filter: &Map<String, Value>,
    ) -> Result<Vec<LogEntry>> {
        let to_block = match to_block {
            BlockTag::Number(n) => n,
            BlockTag::Latest => self.gateway.latest_block().await?,
        };
        if from_block > to_block {
            return Ok(Vec::new());
        }

        let query = LogFilter {
            event_name: event_name.map(str::to_string),
            from_block,
            to_block,
            args: filter.clone(),
        };
        let mut logs = self.gateway.get_logs(contract, &query).await?;

        // Gateways may ignore parts of the filter
        logs.retain(|log| {
            (from_block..=to_block).contains(&log.block_number)
                && event_name.map_or(true, |name| log.event_name == name)
                && log.matches_args(filter)
        });
        logs.sort_by(|a, b| a.cmp_position(b));
        Ok(logs)
    }

    /// Start a watch loop on its own task
    pub fn watch<S>(&self, contract: ContractHandle, options: WatchOptions, sink: S) -> WatchHandle
    where
        S: LogSink + 'static,
    {
        let (stop, stop_rx) = watch::channel(false);
        let listener = self.clone();
        let task = tokio::spawn(async move { listener.run_watch(contract, options, sink, stop_rx).await });
        WatchHandle { stop, task }
    }

    async fn run_watch<S: LogSink>(
        &self,
        contract: ContractHandle,
        options: WatchOptions,
        sink: S,
        mut stop_rx: watch::Receiver<bool>,
    ) -> u64 {
        let mut watermark = options.from_block;
        let mut seen: HashMap<(String, u64), u64> = HashMap::new();
        info!(contract = %contract.address, from_block = watermark, "watch started");

        loop {
            if *stop_rx.borrow() {
                break;
            }

            match self
                .tick(&contract, &options, &sink, &stop_rx, &mut watermark, &mut seen)
                .await
            {
                Ok(Tick::Delivered(count)) => {
                    debug!(contract = %contract.address, count, watermark, "watch tick");
                }
                Ok(Tick::Discarded) => {
                    debug!(contract = %contract.address, "stop requested, discarding fetched logs");
                }
                Err(error) => {
                    warn!(contract = %contract.address, watermark, %error, "watch tick failed, retrying");
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(options.poll_interval) => {}
                changed = stop_rx.changed() => {
                    // Handle dropped
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        info!(contract = %contract.address, watermark, "watch stopped");
        watermark
    }

    async fn tick<S: LogSink>(
        &self,
        contract: &ContractHandle,
        options: &WatchOptions,
        sink: &S,
        stop_rx: &watch::Receiver<bool>,
        watermark: &mut u64,
        seen: &mut HashMap<(String, u64), u64>,
    ) -> Result<Tick> {
        let head = self.gateway.latest_block().await?;
        let from_block = watermark.saturating_sub(options.overlap_blocks) + 1;

        let mut fresh = if from_block <= head {
            self.get_logs(
                contract,
                options.event_name.as_deref(),
                from_block,
                BlockTag::Number(head),
                &options.args,
            )
            .await?
        } else {
            Vec::new()
        };

        let mut batch = HashSet::new();
        fresh.retain(|log| !seen.contains_key(&log.key()) && batch.insert(log.key()));

        if *stop_rx.borrow() {
            return Ok(Tick::Discarded);
        }

        let count = fresh.len();
        if !fresh.is_empty() {
            let keys: Vec<_> = fresh.iter().map(|log| (log.key(), log.block_number)).collect();
            sink.on_new_logs(fresh).await?;
            seen.extend(keys);
        }

        if head > *watermark {
            sink.on_watermark(head).await?;
            *watermark = head;
        }

        // Logs at or below this block are never fetched again
        let floor = watermark.saturating_sub(options.overlap_blocks);
        seen.retain(|_, block| *block > floor);

        Ok(Tick::Delivered(count))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::MockCourt;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    const POLL: Duration = Duration::from_millis(100);

    fn entry(block: u64, index: u64, event: &str) -> LogEntry {
        LogEntry {
            block_number: block,
            transaction_hash: format!("0xtx{}", block),
            log_index: index,
            event_name: event.to_string(),
            args: json!({ "_disputeID": block }).as_object().cloned().unwrap_or_default(),
        }
    }

    fn setup() -> (MockCourt, EventListener) {
        let court = MockCourt::new("0xcourt");
        let listener = EventListener::new(Arc::new(court.clone()));
        (court, listener)
    }

    #[tokio::test]
    async fn test_get_logs_sorts_and_filters() {
        let (court, listener) = setup();
        court.push_log(entry(7, 2, "TokenShift"));
        court.push_log(entry(3, 0, "DisputeCreation"));
        court.push_log(entry(7, 0, "TokenShift"));
        court.push_log(entry(9, 0, "NewPeriod"));

        let logs = listener
            .get_logs(&court.handle(), None, 0, BlockTag::Latest, &Map::new())
            .await
            .unwrap();
        let positions: Vec<_> = logs.iter().map(LogEntry::position).collect();
        assert_eq!(positions, vec![(3, 0), (7, 0), (7, 2), (9, 0)]);

        let shifts = listener
            .get_logs(&court.handle(), Some("TokenShift"), 4, BlockTag::Number(8), &Map::new())
            .await
            .unwrap();
        assert_eq!(shifts.len(), 2);

        let mut args = Map::new();
        args.insert("_disputeID".into(), json!(3));
        let filtered = listener
            .get_logs(&court.handle(), None, 0, BlockTag::Latest, &args)
            .await
            .unwrap();
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].event_name, "DisputeCreation");

        let empty = listener
            .get_logs(&court.handle(), None, 10, BlockTag::Number(9), &Map::new())
            .await
            .unwrap();
        assert!(empty.is_empty());
    }

    #[tokio::test]
    async fn test_get_logs_surfaces_gateway_failure() {
        let (court, listener) = setup();
        court.fail_next(1);
        let err = listener
            .get_logs(&court.handle(), None, 0, BlockTag::Latest, &Map::new())
            .await
            .unwrap_err();
        assert!(err.is_transport());
    }

    #[tokio::test(start_paused = true)]
    async fn test_watch_delivers_only_new_logs_in_order() {
        let (court, listener) = setup();
        court.push_log(entry(2, 1, "TokenShift"));
        court.push_log(entry(2, 0, "TokenShift"));

        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = listener.watch(court.handle(), WatchOptions::default().with_poll_interval(POLL), tx);

        let first = rx.recv().await.unwrap();
        assert_eq!(first.iter().map(LogEntry::position).collect::<Vec<_>>(), vec![(2, 0), (2, 1)]);

        court.push_log(entry(5, 0, "AppealPossible"));
        let second = rx.recv().await.unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].block_number, 5);

        handle.stop();
        assert_eq!(handle.join().await.unwrap(), 5);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_overlapping_ranges_are_deduplicated() {
        let (court, listener) = setup();
        court.push_log(entry(1, 0, "TokenShift"));

        let (tx, mut rx) = mpsc::unbounded_channel();
        let options = WatchOptions::default().with_poll_interval(POLL).with_overlap(10);
        let handle = listener.watch(court.handle(), options, tx);

        assert_eq!(rx.recv().await.unwrap().len(), 1);
        court.mine(3);
        court.push_log(entry(4, 0, "TokenShift"));

        let next = rx.recv().await.unwrap();
        assert_eq!(next.len(), 1);
        assert_eq!(next[0].block_number, 4);

        // Several more ticks over the same overlapping window
        tokio::time::sleep(POLL * 5).await;
        handle.stop();
        handle.join().await.unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_tick_keeps_watermark_and_retries() {
        let (court, listener) = setup();
        court.push_log(entry(3, 0, "TokenShift"));
        court.fail_next(1);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = listener.watch(court.handle(), WatchOptions::default().with_poll_interval(POLL), tx);

        let logs = rx.recv().await.unwrap();
        assert_eq!(logs[0].block_number, 3);
        handle.stop();
        assert_eq!(handle.join().await.unwrap(), 3);
    }

    struct FlakySink {
        calls: AtomicUsize,
        delivered: Mutex<Vec<LogEntry>>,
    }

    #[async_trait]
    impl LogSink for FlakySink {
        async fn on_new_logs(&self, logs: Vec<LogEntry>) -> Result<()> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                return Err(SdkError::Transport("store down".into()));
            }
            self.delivered.lock().unwrap().extend(logs);
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_sink_failure_redelivers_the_same_logs() {
        let (court, listener) = setup();
        court.push_log(entry(2, 0, "TokenShift"));

        let sink = Arc::new(FlakySink {
            calls: AtomicUsize::new(0),
            delivered: Mutex::new(Vec::new()),
        });
        let handle = listener.watch(court.handle(), WatchOptions::default().with_poll_interval(POLL), sink.clone());

        tokio::time::sleep(POLL * 3).await;
        handle.stop();
        assert_eq!(handle.join().await.unwrap(), 2);

        assert_eq!(sink.calls.load(Ordering::SeqCst), 2);
        assert_eq!(sink.delivered.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_independent_watches_each_deliver_shared_log() {
        let (court, listener) = setup();
        court.push_log(entry(4, 0, "DisputeCreation"));

        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        let a = listener.watch(court.handle(), WatchOptions::default().with_poll_interval(POLL), tx_a);
        let b = listener.watch(court.handle(), WatchOptions::default().with_poll_interval(POLL), tx_b);

        assert_eq!(rx_a.recv().await.unwrap()[0].key(), rx_b.recv().await.unwrap()[0].key());

        tokio::time::sleep(POLL * 3).await;
        a.stop();
        b.stop();
        a.join().await.unwrap();
        b.join().await.unwrap();
        assert!(rx_a.try_recv().is_err());
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_during_fetch_discards_results() {
        let court = MockCourt::new("0xcourt").with_latency(Duration::from_millis(50));
        let listener = EventListener::new(Arc::new(court.clone()));
        court.push_log(entry(6, 0, "TokenShift"));

        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = listener.watch(court.handle(), WatchOptions::default().with_poll_interval(POLL), tx);

        // First tick is still waiting on the gateway
        tokio::time::sleep(Duration::from_millis(10)).await;
        handle.stop();
        assert!(handle.is_stopped());

        assert_eq!(handle.join().await.unwrap(), 0);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_watch_starts_after_watermark() {
        let (court, listener) = setup();
        court.push_log(entry(3, 0, "TokenShift"));
        court.push_log(entry(8, 0, "TokenShift"));

        let (tx, mut rx) = mpsc::unbounded_channel();
        let options = WatchOptions::default().with_poll_interval(POLL).from_block(3);
        let handle = listener.watch(court.handle(), options, tx);

        let logs = rx.recv().await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].block_number, 8);
        handle.stop();
        handle.join().await.unwrap();
    }
}
