//! The feed manager loop and the evaluator worker pool.
//!
//! The manager thread owns the feed: it applies control events in arrival
//! order, buffers subscribed telemetry, and dispatches each topic to a fixed
//! worker shard so packets for one topic are always evaluated in order by a
//! single thread.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use tracing::{debug, error, info, warn};

use crate::engine::eval::Evaluator;
use crate::engine::ControlPlane;
use crate::error::{AutonomicError, AutonomicResult};
use crate::event::{AutonomicEvent, EventKind, EventSink, FeedEvent};
use crate::graph::DependencyIndex;
use crate::packet::{PacketBuffer, TopicId};

/// How often blocked receive loops wake to observe the cancel flag.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Joins a thread, giving up after `grace`. A thread that ignores its cancel
/// flag is reported instead of blocking shutdown forever.
pub(crate) fn join_with_grace(
    name: &str,
    handle: JoinHandle<()>,
    grace: Duration,
) -> AutonomicResult<()> {
    let deadline = Instant::now() + grace;
    while !handle.is_finished() {
        if Instant::now() >= deadline {
            warn!(thread = name, grace_ms = grace.as_millis() as u64, "shutdown grace expired");
            return Err(AutonomicError::ShutdownTimeout {
                thread: name.to_string(),
                grace_ms: grace.as_millis() as u64,
            });
        }
        thread::sleep(Duration::from_millis(5));
    }
    handle
        .join()
        .map_err(|_| AutonomicError::internal(format!("{name} thread panicked")))
}

/// A fixed pool of evaluator threads fed by per-shard bounded queues.
///
/// Topics are assigned to shards by hash, so all packets for a topic land on
/// the same worker and per-topic ordering holds without locks.
pub(crate) struct EvaluatorPool {
    shards: Vec<Sender<TopicId>>,
    workers: Vec<JoinHandle<()>>,
}

impl EvaluatorPool {
    pub(crate) fn start(
        evaluator: Arc<Evaluator>,
        worker_count: usize,
        queue_capacity: usize,
        cancel: Arc<AtomicBool>,
    ) -> AutonomicResult<Self> {
        let worker_count = worker_count.max(1);
        let mut shards = Vec::with_capacity(worker_count);
        let mut workers = Vec::with_capacity(worker_count);

        for idx in 0..worker_count {
            let (tx, rx) = bounded::<TopicId>(queue_capacity);
            let evaluator = Arc::clone(&evaluator);
            let cancel = Arc::clone(&cancel);
            let handle = thread::Builder::new()
                .name(format!("autonomic-eval-{idx}"))
                .spawn(move || evaluator_loop(&evaluator, &rx, &cancel))
                .map_err(|e| AutonomicError::internal(format!("spawn evaluator {idx}: {e}")))?;
            shards.push(tx);
            workers.push(handle);
        }

        Ok(Self { shards, workers })
    }

    /// Dispatches a topic to its shard, blocking while the shard queue is
    /// full so the manager applies backpressure to the feed.
    pub(crate) fn dispatch(&self, topic: TopicId) {
        let shard = shard_for(&topic, self.shards.len());
        if self.shards[shard].send(topic).is_err() {
            debug!(shard, "evaluator shard closed");
        }
    }

    pub(crate) fn shutdown(mut self, grace: Duration) -> AutonomicResult<()> {
        self.shards.clear();
        let mut first_error = None;
        for (idx, handle) in self.workers.drain(..).enumerate() {
            let name = format!("autonomic-eval-{idx}");
            if let Err(err) = join_with_grace(&name, handle, grace) {
                first_error.get_or_insert(err);
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

fn shard_for(topic: &TopicId, shards: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    topic.hash(&mut hasher);
    (hasher.finish() % shards as u64) as usize
}

fn evaluator_loop(evaluator: &Evaluator, topics: &Receiver<TopicId>, cancel: &AtomicBool) {
    loop {
        if cancel.load(Ordering::SeqCst) {
            break;
        }
        match topics.recv_timeout(POLL_INTERVAL) {
            Ok(topic) => evaluator.process_topic(&topic),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
}

/// The manager thread body: drains the feed until cancelled or the feed
/// closes, then shuts the evaluator pool down.
pub(crate) struct ManagerLoop {
    pub(crate) group: String,
    pub(crate) control: Arc<ControlPlane>,
    pub(crate) index: Arc<DependencyIndex>,
    pub(crate) packets: Arc<PacketBuffer>,
    pub(crate) sink: Arc<dyn EventSink>,
    pub(crate) feed: Receiver<FeedEvent>,
    pub(crate) pool: EvaluatorPool,
    pub(crate) cancel: Arc<AtomicBool>,
    pub(crate) shutdown_grace: Duration,
}

impl ManagerLoop {
    pub(crate) fn run(self) {
        info!(group = %self.group, "manager started");

        loop {
            if self.cancel.load(Ordering::SeqCst) {
                break;
            }
            match self.feed.recv_timeout(POLL_INTERVAL) {
                Ok(FeedEvent::Telemetry(packet)) => {
                    let topic = packet.topic();
                    // Subscription checks go to the live index: triggers
                    // created through any control path take effect on the
                    // very next packet.
                    if !self.index.is_subscribed(&topic) {
                        continue;
                    }
                    self.packets.add(topic.clone(), packet);
                    self.pool.dispatch(topic);
                }
                Ok(FeedEvent::Control(event)) => {
                    if let Err(err) = self.control.apply(event) {
                        error!(group = %self.group, %err, "control event rejected");
                        self.sink.publish(AutonomicEvent::group(
                            EventKind::Error,
                            &self.group,
                            err.to_string(),
                        ));
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    info!(group = %self.group, "feed closed");
                    break;
                }
            }
        }

        if let Err(err) = self.pool.shutdown(self.shutdown_grace) {
            error!(group = %self.group, %err, "evaluator pool shutdown failed");
            self.sink.publish(AutonomicEvent::group(
                EventKind::Degraded,
                &self.group,
                err.to_string(),
            ));
        }
        info!(group = %self.group, "manager stopped");
    }
}
