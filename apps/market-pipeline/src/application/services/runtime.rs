//! Pipeline Runtime
//!
//! Background tasks driving a [`Pipeline`]:
//!
//! - **Dispatcher**: drains the drop-oldest tick queue and routes each tick
//!   to the shard owning its symbol without ever waiting on a shard
//! - **Shard workers**: apply ticks for their symbols in arrival order
//! - **Janitor**: closes bars whose bucket ended and sweeps expired
//!   teardowns
//! - **Status relay**: pushes feed state changes to every subscriber
//!
//! ```text
//! connector ──► TickSink ──► [drop-oldest] ──► dispatcher ──┬─► shard 0
//!                                                           ├─► shard 1
//!                                                           └─► shard N
//! ```
//!
//! Reconnects are not queued as markers. Every tick carries the reconnect
//! epoch it arrived in, and the dispatcher turns an epoch change into a gap
//! for each shard ahead of that shard's next tick, so queue overflow can
//! never lose a gap.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::WatchStream;
use tokio_util::sync::CancellationToken;

use super::pipeline::{Pipeline, PipelineStats};
use super::queue::{QueueReceiver, QueueSender, drop_oldest};
use crate::domain::market::Tick;
use crate::domain::streaming::ConnectionState;
use crate::infrastructure::metrics::{self, DropReason};

/// Item carried by the tick queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedTick {
    /// Number of feed reconnects before this tick arrived.
    pub epoch: u64,
    /// The raw tick.
    pub tick: Tick,
}

/// Work item for one shard worker.
#[derive(Debug)]
enum ShardEvent {
    Tick(Tick),
    Gap,
}

/// Producer handle for the tick queue, owned by the feed connector.
///
/// Never blocks: a full queue evicts its oldest tick.
#[derive(Debug, Clone)]
pub struct TickSink {
    tx: QueueSender<QueuedTick>,
    stats: Arc<PipelineStats>,
    epoch: Arc<AtomicU64>,
}

impl TickSink {
    /// Enqueue a tick.
    pub fn tick(&self, tick: Tick) -> bool {
        self.stats.record_received();
        self.tx.push(QueuedTick {
            epoch: self.epoch.load(Ordering::Acquire),
            tick,
        })
    }

    /// Signal a reconnect. Ticks enqueued from now on belong to a new epoch
    /// and start fresh buckets.
    pub fn gap(&self) {
        self.epoch.fetch_add(1, Ordering::AcqRel);
    }

    /// Count frames or ticks that could not be decoded.
    pub fn malformed(&self, count: u64) {
        self.stats.record_drop(DropReason::Malformed, count);
    }

    /// Count a reconnection attempt.
    pub fn reconnect(&self) {
        self.stats.record_reconnect();
    }
}

/// Create the tick queue feeding a pipeline that shares `stats`.
///
/// Overflow is counted as `queue_overflow` drops.
#[must_use]
pub fn tick_queue(
    capacity: usize,
    stats: Arc<PipelineStats>,
) -> (TickSink, QueueReceiver<QueuedTick>) {
    let (tx, rx) = drop_oldest(capacity);
    let overflow = Arc::clone(&stats);
    let rx = rx.on_drop(move |n| {
        tracing::debug!(dropped = n, "Tick queue overflow");
        overflow.record_drop(DropReason::QueueOverflow, n);
    });
    let sink = TickSink {
        tx,
        stats,
        epoch: Arc::new(AtomicU64::new(0)),
    };
    (sink, rx)
}

// =============================================================================
// Configuration
// =============================================================================

/// Runtime task tuning.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Per-shard channel capacity between dispatcher and worker.
    pub shard_queue: usize,
    /// How often to close bars whose bucket has ended.
    pub flush_interval: Duration,
    /// Wall-clock delay after a bucket ends before it is closed without a
    /// newer tick.
    pub close_delay: Duration,
    /// How often to sweep expired teardowns.
    pub sweep_interval: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            shard_queue: 1024,
            flush_interval: Duration::from_secs(1),
            close_delay: Duration::from_secs(2),
            sweep_interval: Duration::from_secs(5),
        }
    }
}

// =============================================================================
// Runtime
// =============================================================================

/// Handles to the running pipeline tasks.
#[derive(Debug)]
pub struct PipelineRuntime {
    handles: Vec<JoinHandle<()>>,
}

impl PipelineRuntime {
    /// Spawn every pipeline task. They stop when `cancel` fires.
    #[must_use]
    pub fn spawn(
        pipeline: Arc<Pipeline>,
        ticks: QueueReceiver<QueuedTick>,
        status: watch::Receiver<ConnectionState>,
        config: &RuntimeConfig,
        cancel: &CancellationToken,
    ) -> Self {
        let mut handles = Vec::with_capacity(pipeline.shard_count() + 3);
        let mut shard_txs = Vec::with_capacity(pipeline.shard_count());

        for index in 0..pipeline.shard_count() {
            let (tx, rx) = mpsc::channel(config.shard_queue.max(1));
            shard_txs.push(tx);
            handles.push(tokio::spawn(run_shard(
                index,
                Arc::clone(&pipeline),
                rx,
                cancel.clone(),
            )));
        }

        handles.push(tokio::spawn(run_dispatcher(
            Dispatcher::new(Arc::clone(&pipeline), shard_txs),
            ticks,
            cancel.clone(),
        )));
        handles.push(tokio::spawn(run_janitor(
            Arc::clone(&pipeline),
            config.clone(),
            cancel.clone(),
        )));
        handles.push(tokio::spawn(run_status_relay(
            pipeline,
            status,
            cancel.clone(),
        )));

        tracing::info!(tasks = handles.len(), "Pipeline runtime started");
        Self { handles }
    }

    /// Wait for every task to finish.
    pub async fn join(self) {
        for handle in self.handles {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Pipeline task failed");
            }
        }
    }
}

/// Routes queued ticks to shard workers.
///
/// A full shard channel drops the tick for that shard only; other shards
/// keep receiving.
#[derive(Debug)]
struct Dispatcher {
    pipeline: Arc<Pipeline>,
    shards: Vec<mpsc::Sender<ShardEvent>>,
    epoch: u64,
    gap_pending: Vec<bool>,
}

impl Dispatcher {
    fn new(pipeline: Arc<Pipeline>, shards: Vec<mpsc::Sender<ShardEvent>>) -> Self {
        let gap_pending = vec![false; shards.len()];
        Self {
            pipeline,
            shards,
            epoch: 0,
            gap_pending,
        }
    }

    /// Route one tick. Returns `false` once its shard worker is gone.
    fn dispatch(&mut self, queued: QueuedTick) -> bool {
        if queued.epoch != self.epoch {
            self.epoch = queued.epoch;
            self.gap_pending.fill(true);
        }

        let index = self.pipeline.shard_index(&queued.tick.symbol);
        if self.gap_pending[index] {
            match self.shards[index].try_send(ShardEvent::Gap) {
                Ok(()) => self.gap_pending[index] = false,
                Err(TrySendError::Full(_)) => {
                    self.shard_full(index);
                    return true;
                }
                Err(TrySendError::Closed(_)) => return false,
            }
        }

        match self.shards[index].try_send(ShardEvent::Tick(queued.tick)) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.shard_full(index);
                true
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    fn shard_full(&self, index: usize) {
        tracing::debug!(shard = index, "Shard queue full, dropping tick");
        self.pipeline
            .stats()
            .record_drop(DropReason::ShardOverflow, 1);
    }
}

async fn run_dispatcher(
    mut dispatcher: Dispatcher,
    mut ticks: QueueReceiver<QueuedTick>,
    cancel: CancellationToken,
) {
    loop {
        let queued = tokio::select! {
            () = cancel.cancelled() => break,
            queued = ticks.recv() => match queued {
                Some(queued) => queued,
                None => break,
            },
        };

        if !dispatcher.dispatch(queued) {
            break;
        }
    }
    tracing::debug!("Tick dispatcher stopped");
}

async fn run_shard(
    index: usize,
    pipeline: Arc<Pipeline>,
    mut events: mpsc::Receiver<ShardEvent>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            () = cancel.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };

        match event {
            ShardEvent::Tick(tick) => pipeline.process_tick(&tick),
            ShardEvent::Gap => pipeline.mark_gap(index),
        }
    }
    tracing::debug!(shard = index, "Shard worker stopped");
}

async fn run_janitor(pipeline: Arc<Pipeline>, config: RuntimeConfig, cancel: CancellationToken) {
    let mut flush = tokio::time::interval(config.flush_interval);
    flush.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut sweep = tokio::time::interval(config.sweep_interval);
    sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let delay_ms = i64::try_from(config.close_delay.as_millis()).unwrap_or(i64::MAX);

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = flush.tick() => {
                let now_ms = Utc::now().timestamp_millis().saturating_sub(delay_ms);
                let closed = pipeline.flush_expired(now_ms);
                if closed > 0 {
                    tracing::debug!(closed, "Closed bars on bucket expiry");
                }
            }
            _ = sweep.tick() => {
                let torn_down = pipeline.sweep(Instant::now());
                if torn_down > 0 {
                    tracing::debug!(torn_down, "Swept idle series");
                }
            }
        }
    }
    tracing::debug!("Janitor stopped");
}

async fn run_status_relay(
    pipeline: Arc<Pipeline>,
    status: watch::Receiver<ConnectionState>,
    cancel: CancellationToken,
) {
    let mut changes = WatchStream::from_changes(status);
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            state = changes.next() => {
                let Some(state) = state else { break };
                metrics::set_feed_state(state);
                pipeline.broadcast_status(state);
            }
        }
    }
    tracing::debug!("Status relay stopped");
}
