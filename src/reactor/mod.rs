//! The reaction engine: firing decisions, action workers, snooze manager.
//!
//! Trigger transitions arrive on a channel from the evaluators. A dispatcher
//! thread makes the cheap fire/skip decision per dependent reaction and
//! enqueues run jobs; a pool of action workers executes the (possibly slow)
//! action lists; a snooze manager polls once a second to wake expired
//! reactions, re-firing LEVEL reactions whose triggers are still true.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::{DateTime, Utc};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use tracing::{debug, error, info, warn};

use crate::actions::ActionExecutor;
use crate::engine::manager::join_with_grace;
use crate::error::{ActionError, AutonomicResult, DependencyError};
use crate::event::{AutonomicEvent, EventKind, EventSink};
use crate::graph::DependencyIndex;
use crate::reaction::{ReactionDefinition, ReactionRuntimeState, TriggerLevel};

/// How often blocked loops wake to observe the cancel flag.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Recently requeued snooze expiries remembered for de-duplication.
const REQUEUE_WATCH_LEN: usize = 25;

/// A committed trigger state change, as seen by the reaction engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerTransition {
    /// Name of the trigger that changed.
    pub trigger: String,
    /// The newly committed boolean.
    pub value: bool,
    /// When the change was committed.
    pub time: DateTime<Utc>,
}

impl TriggerTransition {
    /// A transition stamped now.
    #[must_use]
    pub fn new(trigger: impl Into<String>, value: bool) -> Self {
        Self {
            trigger: trigger.into(),
            value,
            time: Utc::now(),
        }
    }
}

/// Tuning knobs for the reaction engine threads.
#[derive(Debug, Clone)]
pub struct ReactionEngineConfig {
    /// Action worker threads.
    pub worker_count: usize,
    /// Capacity of the job and transition queues.
    pub queue_capacity: usize,
    /// Snooze sweep period.
    pub snooze_poll: Duration,
    /// Per-thread join budget at shutdown.
    pub shutdown_grace: Duration,
}

impl Default for ReactionEngineConfig {
    fn default() -> Self {
        Self {
            worker_count: 3,
            queue_capacity: 1024,
            snooze_poll: Duration::from_secs(1),
            shutdown_grace: Duration::from_secs(1),
        }
    }
}

#[derive(Debug)]
struct ReactionJob {
    name: String,
    /// Manual runs bypass the state machine: no snooze afterwards.
    manual: bool,
}

struct ReactionEntry {
    def: ReactionDefinition,
    state: ReactionRuntimeState,
}

/// Remembers which (reaction, deadline) pairs were already requeued so the
/// one-second snooze sweep does not enqueue the same expiry twice while its
/// job is still waiting for a worker.
#[derive(Default)]
struct RequeueGuard {
    watched: VecDeque<String>,
}

impl RequeueGuard {
    /// Returns true the first time a key is offered, false on repeats.
    fn admit(&mut self, reaction: &str, deadline: DateTime<Utc>) -> bool {
        let key = format!("{reaction}@{}", deadline.timestamp_millis());
        if self.watched.contains(&key) {
            return false;
        }
        if self.watched.len() >= REQUEUE_WATCH_LEN {
            self.watched.pop_front();
        }
        self.watched.push_back(key);
        true
    }
}

struct ReactorShared {
    index: Arc<DependencyIndex>,
    executor: Arc<ActionExecutor>,
    sink: Arc<dyn EventSink>,
    reactions: Mutex<HashMap<String, ReactionEntry>>,
    jobs: Sender<ReactionJob>,
}

impl ReactorShared {
    fn registry(&self) -> std::sync::MutexGuard<'_, HashMap<String, ReactionEntry>> {
        self.reactions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Executes a reaction's action list. Each action failure is caught,
    /// logged, and published; remaining actions still run. Non-manual runs
    /// start the snooze window afterwards.
    fn run_reaction(&self, name: &str, manual: bool) {
        let Some(def) = self.registry().get(name).map(|e| e.def.clone()) else {
            debug!(reaction = name, "run requested for unknown reaction");
            return;
        };

        info!(reaction = name, manual, "running reaction");
        let mut event = AutonomicEvent::reaction(EventKind::Run, name, format!("{name} running"));
        if let Ok(data) = serde_json::to_value(&def) {
            event = event.with_data(data);
        }
        self.sink.publish(event);

        for action in &def.actions {
            match self.executor.execute(name, action) {
                Ok(()) => debug!(reaction = name, kind = action.kind(), "action complete"),
                Err(ActionError::AutomationDisabled) => {
                    warn!(reaction = name, kind = action.kind(), "automation disabled, action skipped");
                    self.sink.publish(AutonomicEvent::reaction(
                        EventKind::AutomationDisabled,
                        name,
                        format!("{} action skipped: automation is disabled", action.kind()),
                    ));
                }
                Err(err) => {
                    error!(reaction = name, kind = action.kind(), %err, "action failed");
                    self.sink
                        .publish(AutonomicEvent::reaction(EventKind::Error, name, err.to_string()));
                }
            }
        }

        if manual {
            return;
        }
        let now = Utc::now();
        let mut registry = self.registry();
        if let Some(entry) = registry.get_mut(name) {
            entry.state.sleep(def.snooze_seconds, now);
            if let Some(until) = entry.state.snoozed_until {
                self.sink.publish(AutonomicEvent::reaction(
                    EventKind::Snoozed,
                    name,
                    format!("{name} snoozed until {until}"),
                ));
            }
        }
    }

    /// A LEVEL reaction fires whenever a referenced trigger is already true,
    /// not just on the transition. Checked at create, enable, and update.
    fn level_check(&self, name: &str) {
        let now = Utc::now();
        let fire = {
            let registry = self.registry();
            let Some(entry) = registry.get(name) else {
                return;
            };
            entry.def.level == TriggerLevel::Level
                && entry.state.can_fire(now)
                && entry
                    .def
                    .trigger_refs
                    .iter()
                    .any(|t| self.index.state_of(t).is_some_and(|s| s.enabled && s.value))
        };
        if fire {
            self.enqueue(name, false);
        }
    }

    fn enqueue(&self, name: &str, manual: bool) {
        let job = ReactionJob {
            name: name.to_string(),
            manual,
        };
        if self.jobs.send(job).is_err() {
            warn!(reaction = name, "reaction workers stopped, job dropped");
        }
    }
}

/// Owns the reaction registry and the threads that service it.
pub struct ReactionEngine {
    shared: Arc<ReactorShared>,
    transitions: Sender<TriggerTransition>,
    cancel: Arc<AtomicBool>,
    shutdown_grace: Duration,
    threads: Mutex<Vec<(String, JoinHandle<()>)>>,
}

impl ReactionEngine {
    /// Spawns the dispatcher, the action workers, and the snooze manager.
    pub fn start(
        index: Arc<DependencyIndex>,
        executor: Arc<ActionExecutor>,
        sink: Arc<dyn EventSink>,
        config: &ReactionEngineConfig,
    ) -> AutonomicResult<Self> {
        let (job_tx, job_rx) = bounded::<ReactionJob>(config.queue_capacity);
        let (transition_tx, transition_rx) = bounded::<TriggerTransition>(config.queue_capacity);
        let cancel = Arc::new(AtomicBool::new(false));

        let shared = Arc::new(ReactorShared {
            index,
            executor,
            sink,
            reactions: Mutex::new(HashMap::new()),
            jobs: job_tx,
        });

        let mut threads = Vec::new();

        {
            let shared = Arc::clone(&shared);
            let cancel = Arc::clone(&cancel);
            let handle = thread::Builder::new()
                .name("autonomic-reaction-dispatch".to_string())
                .spawn(move || dispatch_loop(&shared, &transition_rx, &cancel))
                .map_err(|e| crate::error::AutonomicError::internal(format!("spawn dispatcher: {e}")))?;
            threads.push(("autonomic-reaction-dispatch".to_string(), handle));
        }

        for idx in 0..config.worker_count.max(1) {
            let shared = Arc::clone(&shared);
            let jobs = job_rx.clone();
            let cancel = Arc::clone(&cancel);
            let name = format!("autonomic-reaction-{idx}");
            let handle = thread::Builder::new()
                .name(name.clone())
                .spawn(move || worker_loop(&shared, &jobs, &cancel))
                .map_err(|e| crate::error::AutonomicError::internal(format!("spawn worker {idx}: {e}")))?;
            threads.push((name, handle));
        }

        {
            let shared = Arc::clone(&shared);
            let cancel = Arc::clone(&cancel);
            let poll = config.snooze_poll;
            let handle = thread::Builder::new()
                .name("autonomic-snooze".to_string())
                .spawn(move || snooze_loop(&shared, poll, &cancel))
                .map_err(|e| crate::error::AutonomicError::internal(format!("spawn snooze manager: {e}")))?;
            threads.push(("autonomic-snooze".to_string(), handle));
        }

        Ok(Self {
            shared,
            transitions: transition_tx,
            cancel,
            shutdown_grace: config.shutdown_grace,
            threads: Mutex::new(threads),
        })
    }

    /// The channel evaluators publish committed trigger transitions on.
    #[must_use]
    pub fn transition_sender(&self) -> Sender<TriggerTransition> {
        self.transitions.clone()
    }

    /// Registers a reaction and its dependency edges atomically, then runs
    /// the LEVEL check so an already-true trigger fires it immediately.
    pub fn create(&self, def: ReactionDefinition) -> AutonomicResult<()> {
        def.validate()?;
        self.shared.index.add_reaction(&def)?;
        let name = def.name.clone();
        self.shared.registry().insert(
            name.clone(),
            ReactionEntry {
                def,
                state: ReactionRuntimeState::armed(),
            },
        );
        self.shared.level_check(&name);
        Ok(())
    }

    /// Replaces a reaction's definition, preserving its runtime state.
    pub fn update(&self, def: ReactionDefinition) -> AutonomicResult<()> {
        def.validate()?;
        self.shared.index.update_reaction(&def)?;
        let name = def.name.clone();
        {
            let mut registry = self.shared.registry();
            match registry.get_mut(&name) {
                Some(entry) => entry.def = def,
                None => {
                    registry.insert(
                        name.clone(),
                        ReactionEntry {
                            def,
                            state: ReactionRuntimeState::armed(),
                        },
                    );
                }
            }
        }
        self.shared.level_check(&name);
        Ok(())
    }

    /// Unregisters a reaction and releases its dependency edges.
    pub fn delete(&self, name: &str) -> AutonomicResult<()> {
        self.shared.index.remove_reaction(name)?;
        self.shared.registry().remove(name);
        Ok(())
    }

    /// Re-arms a reaction. A snooze window that expired while disabled is
    /// cleared rather than honored.
    pub fn enable(&self, name: &str) -> AutonomicResult<()> {
        let now = Utc::now();
        {
            let mut registry = self.shared.registry();
            let entry = registry
                .get_mut(name)
                .ok_or_else(|| DependencyError::ReactionNotFound { name: name.to_string() })?;
            entry.state.enabled = true;
            if entry.state.snoozed_until.is_some_and(|until| until <= now) {
                entry.state.awaken();
            }
        }
        self.shared.level_check(name);
        Ok(())
    }

    /// Prevents the reaction from firing until re-enabled.
    pub fn disable(&self, name: &str) -> AutonomicResult<()> {
        let mut registry = self.shared.registry();
        let entry = registry
            .get_mut(name)
            .ok_or_else(|| DependencyError::ReactionNotFound { name: name.to_string() })?;
        entry.state.enabled = false;
        Ok(())
    }

    /// Runs the action list once, bypassing snooze and trigger-state checks
    /// and leaving the state machine untouched.
    pub fn run_now(&self, name: &str) -> AutonomicResult<()> {
        if !self.shared.registry().contains_key(name) {
            return Err(DependencyError::ReactionNotFound { name: name.to_string() }.into());
        }
        self.shared.enqueue(name, true);
        Ok(())
    }

    /// Removes every reaction and its edges. Used when the group goes away.
    pub fn clear(&self) -> AutonomicResult<()> {
        for name in self.shared.index.reaction_names() {
            self.shared.index.remove_reaction(&name)?;
        }
        self.shared.registry().clear();
        Ok(())
    }

    /// The registered definition, if any.
    #[must_use]
    pub fn definition_of(&self, name: &str) -> Option<ReactionDefinition> {
        self.shared.registry().get(name).map(|e| e.def.clone())
    }

    /// A copy of the reaction's current runtime state.
    #[must_use]
    pub fn state_of(&self, name: &str) -> Option<ReactionRuntimeState> {
        self.shared.registry().get(name).map(|e| e.state.clone())
    }

    /// Stops all reaction threads, joining each within the grace period.
    pub fn shutdown(&self) -> AutonomicResult<()> {
        self.cancel.store(true, Ordering::SeqCst);
        let threads: Vec<_> = {
            let mut guard = self.threads.lock().unwrap_or_else(PoisonError::into_inner);
            guard.drain(..).collect()
        };
        let mut first_error = None;
        for (name, handle) in threads {
            if let Err(err) = join_with_grace(&name, handle, self.shutdown_grace) {
                first_error.get_or_insert(err);
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// Decides which dependent reactions fire for each committed transition.
/// Both EDGE and LEVEL fire here on a false-to-true transition; the LEVEL
/// extras (fire-on-create, re-fire after snooze) are handled elsewhere.
fn dispatch_loop(shared: &ReactorShared, transitions: &Receiver<TriggerTransition>, cancel: &AtomicBool) {
    loop {
        if cancel.load(Ordering::SeqCst) {
            break;
        }
        let transition = match transitions.recv_timeout(POLL_INTERVAL) {
            Ok(t) => t,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };
        if !transition.value {
            continue;
        }

        let now = Utc::now();
        let dependents = shared.index.dependent_reactions(&transition.trigger);
        let to_fire: Vec<String> = {
            let registry = shared.registry();
            dependents
                .into_iter()
                .filter(|name| registry.get(name).is_some_and(|e| e.state.can_fire(now)))
                .collect()
        };
        for name in to_fire {
            debug!(reaction = %name, trigger = %transition.trigger, "firing");
            shared.enqueue(&name, false);
        }
    }
}

fn worker_loop(shared: &ReactorShared, jobs: &Receiver<ReactionJob>, cancel: &AtomicBool) {
    loop {
        if cancel.load(Ordering::SeqCst) {
            break;
        }
        match jobs.recv_timeout(POLL_INTERVAL) {
            Ok(job) => shared.run_reaction(&job.name, job.manual),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
}

/// Once per poll interval, sweeps snoozed reactions whose deadline passed.
/// A LEVEL reaction with a still-true trigger is requeued (at most once per
/// deadline); anything else is simply awakened.
fn snooze_loop(shared: &ReactorShared, poll: Duration, cancel: &AtomicBool) {
    let ticker = crossbeam_channel::tick(poll);
    let mut guard = RequeueGuard::default();
    loop {
        if cancel.load(Ordering::SeqCst) {
            break;
        }
        if ticker.recv_timeout(POLL_INTERVAL).is_err() {
            continue;
        }

        let now = Utc::now();
        let mut awakened = Vec::new();
        let mut requeued = Vec::new();
        {
            let mut registry = shared.registry();
            for (name, entry) in registry.iter_mut() {
                if !entry.state.enabled {
                    continue;
                }
                let Some(until) = entry.state.snoozed_until else {
                    continue;
                };
                if until > now {
                    continue;
                }

                let still_active = entry.def.level == TriggerLevel::Level
                    && entry
                        .def
                        .trigger_refs
                        .iter()
                        .any(|t| shared.index.state_of(t).is_some_and(|s| s.enabled && s.value));

                if still_active {
                    if guard.admit(name, until) {
                        requeued.push(name.clone());
                    }
                } else {
                    entry.state.awaken();
                    awakened.push(name.clone());
                }
            }
        }

        for name in awakened {
            debug!(reaction = %name, "snooze expired");
            shared.sink.publish(AutonomicEvent::reaction(
                EventKind::Awakened,
                &name,
                format!("{name} awakened"),
            ));
        }
        for name in requeued {
            debug!(reaction = %name, "snooze expired with trigger still true, re-firing");
            shared.enqueue(&name, false);
        }
    }
}
