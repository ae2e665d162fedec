//! The group runtime: one manager thread, an evaluator pool, and a reaction
//! engine, stitched together over a single merged feed.
//!
//! A [`GroupRuntime`] owns every thread for one trigger group. Telemetry and
//! control events enter through the feed sender; control can also be applied
//! synchronously through [`GroupRuntime::apply`] when the caller wants the
//! result.

pub mod eval;
pub(crate) mod manager;

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Sender};
use tracing::{error, info};

use crate::actions::{ActionExecutor, CommandTransport, ScriptRunner};
use crate::engine::eval::Evaluator;
use crate::engine::manager::{join_with_grace, EvaluatorPool, ManagerLoop};
use crate::error::{AutonomicError, AutonomicResult};
use crate::event::{
    AutonomicEvent, ControlEvent, EventKind, EventSink, FeedEvent, GroupControl, ReactionControl,
    TriggerControl,
};
use crate::graph::DependencyIndex;
use crate::packet::PacketBuffer;
use crate::reactor::{ReactionEngine, ReactionEngineConfig};

/// Tuning knobs for one group runtime.
#[derive(Debug, Clone)]
pub struct GroupRuntimeConfig {
    /// Group name, carried on lifecycle events.
    pub group: String,
    /// Evaluator and reaction worker threads (each).
    pub worker_count: usize,
    /// Capacity of each internal work queue.
    pub queue_capacity: usize,
    /// Capacity of the merged feed channel.
    pub feed_capacity: usize,
    /// Snooze sweep period.
    pub snooze_poll: Duration,
    /// Per-thread join budget at shutdown.
    pub shutdown_grace: Duration,
}

impl GroupRuntimeConfig {
    #[must_use]
    pub fn new(group: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            worker_count: 3,
            queue_capacity: 1024,
            feed_capacity: 4096,
            snooze_poll: Duration::from_secs(1),
            shutdown_grace: Duration::from_secs(1),
        }
    }
}

impl Default for GroupRuntimeConfig {
    fn default() -> Self {
        Self::new("DEFAULT")
    }
}

/// Applies control events against the index and the reaction engine,
/// publishing a lifecycle event for each accepted change.
pub(crate) struct ControlPlane {
    group: String,
    index: Arc<DependencyIndex>,
    packets: Arc<PacketBuffer>,
    evaluator: Arc<Evaluator>,
    reactions: Arc<ReactionEngine>,
    executor: Arc<ActionExecutor>,
    sink: Arc<dyn EventSink>,
}

impl ControlPlane {
    pub(crate) fn apply(&self, event: ControlEvent) -> AutonomicResult<()> {
        match event {
            ControlEvent::Trigger(control) => self.apply_trigger(control),
            ControlEvent::Reaction(control) => self.apply_reaction(control),
            ControlEvent::Group(control) => self.apply_group(control),
            ControlEvent::Automation { enabled } => {
                self.executor.set_automation_enabled(enabled);
                let kind = if enabled { EventKind::Enabled } else { EventKind::Disabled };
                info!(group = %self.group, enabled, "automation toggled");
                self.sink.publish(AutonomicEvent::group(
                    kind,
                    &self.group,
                    format!("automation {}", if enabled { "enabled" } else { "disabled" }),
                ));
                Ok(())
            }
        }
    }

    fn apply_trigger(&self, control: TriggerControl) -> AutonomicResult<()> {
        match control {
            TriggerControl::Create(def) => {
                let name = def.name.clone();
                let data = serde_json::to_value(&def).ok();
                self.index.add_trigger(def)?;
                self.publish_trigger(EventKind::Created, &name, data);
            }
            TriggerControl::Update(def) => {
                let name = def.name.clone();
                let data = serde_json::to_value(&def).ok();
                let was_true = self.index.update_trigger(def)?;
                if was_true {
                    self.evaluator.refresh_dependents(&name);
                }
                self.publish_trigger(EventKind::Updated, &name, data);
            }
            TriggerControl::Delete { name } => {
                self.index.remove_trigger(&name)?;
                self.publish_trigger(EventKind::Deleted, &name, None);
            }
            TriggerControl::Enable { name } => {
                self.index.enable_trigger(&name)?;
                self.publish_trigger(EventKind::Enabled, &name, None);
            }
            TriggerControl::Disable { name } => {
                let was_true = self.index.disable_trigger(&name)?;
                if was_true {
                    self.evaluator.refresh_dependents(&name);
                }
                self.publish_trigger(EventKind::Disabled, &name, None);
            }
        }
        self.prune_history();
        Ok(())
    }

    fn apply_reaction(&self, control: ReactionControl) -> AutonomicResult<()> {
        match control {
            ReactionControl::Create(def) => {
                let name = def.name.clone();
                let data = serde_json::to_value(&def).ok();
                self.reactions.create(def)?;
                self.publish_reaction(EventKind::Created, &name, data);
            }
            ReactionControl::Update(def) => {
                let name = def.name.clone();
                let data = serde_json::to_value(&def).ok();
                self.reactions.update(def)?;
                self.publish_reaction(EventKind::Updated, &name, data);
            }
            ReactionControl::Delete { name } => {
                self.reactions.delete(&name)?;
                self.publish_reaction(EventKind::Deleted, &name, None);
            }
            ReactionControl::Enable { name } => {
                self.reactions.enable(&name)?;
                self.publish_reaction(EventKind::Enabled, &name, None);
            }
            ReactionControl::Disable { name } => {
                self.reactions.disable(&name)?;
                self.publish_reaction(EventKind::Disabled, &name, None);
            }
            ReactionControl::RunNow { name } => {
                self.reactions.run_now(&name)?;
            }
        }
        Ok(())
    }

    /// Group deletion clears reactions before triggers so no dependency
    /// edge ever dangles.
    fn apply_group(&self, control: GroupControl) -> AutonomicResult<()> {
        match control {
            GroupControl::Created { name } => {
                self.sink
                    .publish(AutonomicEvent::group(EventKind::Created, &name, format!("{name} created")));
            }
            GroupControl::Deleted { name } => {
                self.reactions.clear()?;
                self.index.clear();
                self.prune_history();
                info!(group = %name, "group cleared");
                self.sink
                    .publish(AutonomicEvent::group(EventKind::Deleted, &name, format!("{name} deleted")));
            }
        }
        Ok(())
    }

    /// Drops buffered history for topics no enabled trigger reads anymore.
    /// The subscription set is computed before the buffer lock is taken.
    fn prune_history(&self) {
        let subscribed = self.index.subscriptions();
        self.packets.retain(|topic| subscribed.contains(topic));
    }

    fn publish_trigger(&self, kind: EventKind, name: &str, data: Option<serde_json::Value>) {
        let mut event = AutonomicEvent::trigger(kind, name, format!("{name} {kind}"));
        if let Some(data) = data {
            event = event.with_data(data);
        }
        self.sink.publish(event);
    }

    fn publish_reaction(&self, kind: EventKind, name: &str, data: Option<serde_json::Value>) {
        let mut event = AutonomicEvent::reaction(kind, name, format!("{name} {kind}"));
        if let Some(data) = data {
            event = event.with_data(data);
        }
        self.sink.publish(event);
    }
}

/// All threads and shared state for one trigger group.
pub struct GroupRuntime {
    config: GroupRuntimeConfig,
    index: Arc<DependencyIndex>,
    packets: Arc<PacketBuffer>,
    reactions: Arc<ReactionEngine>,
    executor: Arc<ActionExecutor>,
    control: Arc<ControlPlane>,
    sink: Arc<dyn EventSink>,
    feed_tx: Sender<FeedEvent>,
    cancel: Arc<AtomicBool>,
    manager: Option<JoinHandle<()>>,
}

impl GroupRuntime {
    /// Builds the shared state and spawns every thread: the reaction engine,
    /// the evaluator pool, and the manager that feeds them.
    pub fn start(
        config: GroupRuntimeConfig,
        commands: Arc<dyn CommandTransport>,
        scripts: Arc<dyn ScriptRunner>,
        sink: Arc<dyn EventSink>,
    ) -> AutonomicResult<Self> {
        let index = Arc::new(DependencyIndex::new());
        let packets = Arc::new(PacketBuffer::new());
        let executor = Arc::new(ActionExecutor::new(commands, scripts, Arc::clone(&sink)));
        let cancel = Arc::new(AtomicBool::new(false));

        let reaction_config = ReactionEngineConfig {
            worker_count: config.worker_count,
            queue_capacity: config.queue_capacity,
            snooze_poll: config.snooze_poll,
            shutdown_grace: config.shutdown_grace,
        };
        let reactions = Arc::new(ReactionEngine::start(
            Arc::clone(&index),
            Arc::clone(&executor),
            Arc::clone(&sink),
            &reaction_config,
        )?);

        let evaluator = Arc::new(Evaluator::new(
            Arc::clone(&index),
            Arc::clone(&packets),
            Arc::clone(&sink),
            reactions.transition_sender(),
        ));
        let pool = EvaluatorPool::start(
            Arc::clone(&evaluator),
            config.worker_count,
            config.queue_capacity,
            Arc::clone(&cancel),
        )?;

        let control = Arc::new(ControlPlane {
            group: config.group.clone(),
            index: Arc::clone(&index),
            packets: Arc::clone(&packets),
            evaluator,
            reactions: Arc::clone(&reactions),
            executor: Arc::clone(&executor),
            sink: Arc::clone(&sink),
        });

        let (feed_tx, feed_rx) = bounded::<FeedEvent>(config.feed_capacity);
        let manager_loop = ManagerLoop {
            group: config.group.clone(),
            control: Arc::clone(&control),
            index: Arc::clone(&index),
            packets: Arc::clone(&packets),
            sink: Arc::clone(&sink),
            feed: feed_rx,
            pool,
            cancel: Arc::clone(&cancel),
            shutdown_grace: config.shutdown_grace,
        };
        let group = config.group.clone();
        let manager_sink = Arc::clone(&sink);
        let manager = thread::Builder::new()
            .name("autonomic-manager".to_string())
            .spawn(move || {
                if catch_unwind(AssertUnwindSafe(|| manager_loop.run())).is_err() {
                    error!(group = %group, "manager thread panicked");
                    manager_sink.publish(AutonomicEvent::group(
                        EventKind::Degraded,
                        &group,
                        "manager thread panicked".to_string(),
                    ));
                }
            })
            .map_err(|e| AutonomicError::internal(format!("spawn manager: {e}")))?;

        sink.publish(AutonomicEvent::group(
            EventKind::Created,
            &config.group,
            format!("{} runtime started", config.group),
        ));

        Ok(Self {
            config,
            index,
            packets,
            reactions,
            executor,
            control,
            sink,
            feed_tx,
            cancel,
            manager: Some(manager),
        })
    }

    /// A sender for the merged telemetry + control feed. Clone freely; the
    /// runtime keeps its own copy, so dropping yours does not stop it.
    #[must_use]
    pub fn feed(&self) -> Sender<FeedEvent> {
        self.feed_tx.clone()
    }

    /// Applies a control event synchronously, returning the outcome to the
    /// caller instead of publishing it as an error event.
    pub fn apply(&self, event: ControlEvent) -> AutonomicResult<()> {
        self.control.apply(event)
    }

    /// The trigger dependency index shared with the evaluators.
    #[must_use]
    pub fn index(&self) -> &DependencyIndex {
        &self.index
    }

    /// The reaction engine owned by this runtime.
    #[must_use]
    pub fn reactions(&self) -> &ReactionEngine {
        &self.reactions
    }

    /// The per-topic packet history.
    #[must_use]
    pub fn packets(&self) -> &PacketBuffer {
        &self.packets
    }

    /// Whether gated actions (commands, scripts) currently execute.
    #[must_use]
    pub fn automation_enabled(&self) -> bool {
        self.executor.automation_enabled()
    }

    /// The group name this runtime serves.
    #[must_use]
    pub fn group(&self) -> &str {
        &self.config.group
    }

    /// Stops every thread. The manager joins with a budget covering its own
    /// loop plus the evaluator pool it shuts down on the way out.
    pub fn shutdown(mut self) -> AutonomicResult<()> {
        info!(group = %self.config.group, "shutting down");
        self.cancel.store(true, Ordering::SeqCst);

        let mut first_error = None;
        if let Some(handle) = self.manager.take() {
            let budget = self.config.shutdown_grace * (self.config.worker_count as u32 + 2);
            if let Err(err) = join_with_grace("autonomic-manager", handle, budget) {
                first_error.get_or_insert(err);
            }
        }
        if let Err(err) = self.reactions.shutdown() {
            first_error.get_or_insert(err);
        }

        match first_error {
            Some(err) => {
                self.sink.publish(AutonomicEvent::group(
                    EventKind::Degraded,
                    &self.config.group,
                    err.to_string(),
                ));
                Err(err)
            }
            None => Ok(()),
        }
    }
}

impl Drop for GroupRuntime {
    fn drop(&mut self) {
        // Threads observe the flag even when shutdown() was never called.
        self.cancel.store(true, Ordering::SeqCst);
    }
}
