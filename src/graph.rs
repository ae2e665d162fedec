//! Dependency index: trigger registry, dependents graph, topic subscriptions.
//!
//! The index owns every trigger definition in a group together with its
//! runtime state and its `dependents` set (the composite triggers and
//! reactions that reference it). It also derives the set of telemetry topics
//! the group must subscribe to. All mutations serialize behind one mutex;
//! evaluation-time state commits go through [`DependencyIndex::commit_state`]
//! so the commit rule (no-op on equal value) is enforced in one place.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use chrono::Utc;

use crate::error::{AutonomicError, AutonomicResult, DependencyError};
use crate::packet::TopicId;
use crate::reaction::ReactionDefinition;
use crate::trigger::{TriggerDefinition, TriggerRuntimeState};

#[derive(Debug)]
struct TriggerEntry {
    def: TriggerDefinition,
    state: TriggerRuntimeState,
    /// Names of composite triggers and reactions referencing this trigger,
    /// in registration order.
    dependents: Vec<String>,
    /// Registration order within the group.
    seq: u64,
}

#[derive(Debug, Default)]
struct Inner {
    triggers: HashMap<String, TriggerEntry>,
    /// Reaction name -> referenced trigger names, for dependents bookkeeping.
    reaction_refs: HashMap<String, Vec<String>>,
    next_seq: u64,
}

/// Outcome of committing an evaluated boolean to a trigger's runtime state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    /// New value equals the stored value: no timestamp change, no
    /// notification.
    Unchanged,
    /// State flipped; dependents must now be notified.
    Changed {
        value: bool,
    },
    /// Trigger is unknown or disabled; nothing was written.
    Skipped,
}

/// One trigger's definition, runtime state, and dependents, for inspection.
#[derive(Debug, Clone)]
pub struct TriggerSnapshot {
    pub def: TriggerDefinition,
    pub state: TriggerRuntimeState,
    pub dependents: Vec<String>,
}

/// Bidirectional dependency graph for one trigger group.
#[derive(Debug, Default)]
pub struct DependencyIndex {
    inner: Mutex<Inner>,
}

impl DependencyIndex {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a new trigger.
    ///
    /// Validates the definition, requires every referenced trigger to exist,
    /// and adds this trigger to each referenced trigger's dependents. Leaf
    /// trigger topics join the group subscription set.
    pub fn add_trigger(&self, def: TriggerDefinition) -> AutonomicResult<()> {
        def.validate()?;
        let roots = def.roots();
        let mut inner = self.lock();

        if inner.triggers.contains_key(&def.name) {
            return Err(crate::error::DefinitionError::DuplicateTrigger { name: def.name }.into());
        }
        for root in &roots {
            if !inner.triggers.contains_key(root) {
                return Err(DependencyError::TriggerNotFound { name: root.clone() }.into());
            }
        }

        let name = def.name.clone();
        for root in &roots {
            if let Some(entry) = inner.triggers.get_mut(root) {
                if !entry.dependents.contains(&name) {
                    entry.dependents.push(name.clone());
                }
            }
        }

        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.triggers.insert(
            name,
            TriggerEntry {
                def,
                state: TriggerRuntimeState::armed(),
                dependents: Vec::new(),
                seq,
            },
        );
        Ok(())
    }

    /// Atomically replaces a trigger's definition, preserving its dependents.
    ///
    /// Root edges are rewritten to match the new definition and the runtime
    /// state is re-armed (update is the explicit path for re-enabling an
    /// auto-disabled trigger). Subscription changes take effect on the next
    /// [`subscriptions`](Self::subscriptions) query. Returns whether a stored
    /// true was reset, so the caller can recompute dependents.
    pub fn update_trigger(&self, def: TriggerDefinition) -> AutonomicResult<bool> {
        def.validate()?;
        let new_roots = def.roots();
        let mut inner = self.lock();

        if !inner.triggers.contains_key(&def.name) {
            return Err(DependencyError::TriggerNotFound { name: def.name }.into());
        }
        for root in &new_roots {
            if root == &def.name {
                return Err(crate::error::DefinitionError::InvalidOperand {
                    operator: def.operator.to_string(),
                    reason: format!("trigger {} cannot reference itself", def.name),
                }
                .into());
            }
            if !inner.triggers.contains_key(root) {
                return Err(DependencyError::TriggerNotFound { name: root.clone() }.into());
            }
        }

        let name = def.name.clone();
        let old_roots = inner.triggers[&name].def.roots();
        for root in &old_roots {
            if !new_roots.contains(root) {
                if let Some(entry) = inner.triggers.get_mut(root) {
                    entry.dependents.retain(|d| d != &name);
                }
            }
        }
        for root in &new_roots {
            if let Some(entry) = inner.triggers.get_mut(root) {
                if !entry.dependents.contains(&name) {
                    entry.dependents.push(name.clone());
                }
            }
        }

        let entry = inner
            .triggers
            .get_mut(&name)
            .ok_or_else(|| AutonomicError::internal("trigger vanished during update"))?;
        let was_true = entry.state.value;
        entry.def = def;
        entry.state = TriggerRuntimeState::armed();
        Ok(was_true)
    }

    /// Removes a trigger.
    ///
    /// Fails with [`DependencyError::InUse`] naming the blockers while any
    /// composite trigger or reaction still references it; deletion is
    /// all-or-nothing.
    pub fn remove_trigger(&self, name: &str) -> AutonomicResult<()> {
        let mut inner = self.lock();
        let entry = inner
            .triggers
            .get(name)
            .ok_or_else(|| DependencyError::TriggerNotFound { name: name.to_string() })?;

        if !entry.dependents.is_empty() {
            return Err(DependencyError::InUse {
                name: name.to_string(),
                dependents: entry.dependents.clone(),
            }
            .into());
        }

        let roots = entry.def.roots();
        for root in &roots {
            if let Some(root_entry) = inner.triggers.get_mut(root) {
                root_entry.dependents.retain(|d| d != name);
            }
        }
        inner.triggers.remove(name);
        Ok(())
    }

    /// Re-enables a trigger, re-arming its boolean state.
    pub fn enable_trigger(&self, name: &str) -> AutonomicResult<()> {
        let mut inner = self.lock();
        let entry = inner
            .triggers
            .get_mut(name)
            .ok_or_else(|| DependencyError::TriggerNotFound { name: name.to_string() })?;
        entry.state = TriggerRuntimeState::armed();
        Ok(())
    }

    /// Disables a trigger, forcing its state false.
    ///
    /// Disabled triggers are excluded from evaluation, notification, and the
    /// subscription set, but retained for inspection until deleted. Returns
    /// whether a stored true was knocked down, so the caller can recompute
    /// dependent composites.
    pub fn disable_trigger(&self, name: &str) -> AutonomicResult<bool> {
        let mut inner = self.lock();
        let entry = inner
            .triggers
            .get_mut(name)
            .ok_or_else(|| DependencyError::TriggerNotFound { name: name.to_string() })?;
        let was_true = entry.state.value;
        entry.state.enabled = false;
        entry.state.value = false;
        entry.state.updated_at = Utc::now();
        Ok(was_true)
    }

    /// Auto-disable after an evaluation failure: same effect as
    /// [`disable_trigger`](Self::disable_trigger) but tolerant of a
    /// concurrently deleted trigger.
    pub fn quarantine(&self, name: &str) -> bool {
        self.disable_trigger(name).unwrap_or(false)
    }

    /// Registers a reaction as a dependent of each referenced trigger.
    ///
    /// All-or-nothing: every referenced trigger must exist before any
    /// dependents edge is written.
    pub fn add_reaction(&self, def: &ReactionDefinition) -> AutonomicResult<()> {
        def.validate()?;
        let mut inner = self.lock();

        if inner.reaction_refs.contains_key(&def.name) {
            return Err(crate::error::DefinitionError::DuplicateReaction {
                name: def.name.clone(),
            }
            .into());
        }
        for trigger in &def.trigger_refs {
            if !inner.triggers.contains_key(trigger) {
                return Err(DependencyError::TriggerNotFound {
                    name: trigger.clone(),
                }
                .into());
            }
        }

        for trigger in &def.trigger_refs {
            if let Some(entry) = inner.triggers.get_mut(trigger) {
                if !entry.dependents.contains(&def.name) {
                    entry.dependents.push(def.name.clone());
                }
            }
        }
        inner.reaction_refs.insert(def.name.clone(), def.trigger_refs.clone());
        Ok(())
    }

    /// Rewrites a reaction's dependents edges for an updated definition.
    pub fn update_reaction(&self, def: &ReactionDefinition) -> AutonomicResult<()> {
        def.validate()?;
        let mut inner = self.lock();

        let old_refs = inner
            .reaction_refs
            .get(&def.name)
            .cloned()
            .ok_or_else(|| DependencyError::ReactionNotFound {
                name: def.name.clone(),
            })?;
        for trigger in &def.trigger_refs {
            if !inner.triggers.contains_key(trigger) {
                return Err(DependencyError::TriggerNotFound {
                    name: trigger.clone(),
                }
                .into());
            }
        }

        for trigger in &old_refs {
            if !def.trigger_refs.contains(trigger) {
                if let Some(entry) = inner.triggers.get_mut(trigger) {
                    entry.dependents.retain(|d| d != &def.name);
                }
            }
        }
        for trigger in &def.trigger_refs {
            if let Some(entry) = inner.triggers.get_mut(trigger) {
                if !entry.dependents.contains(&def.name) {
                    entry.dependents.push(def.name.clone());
                }
            }
        }
        inner.reaction_refs.insert(def.name.clone(), def.trigger_refs.clone());
        Ok(())
    }

    /// Unregisters a reaction, removing its dependents edges.
    pub fn remove_reaction(&self, name: &str) -> AutonomicResult<()> {
        let mut inner = self.lock();
        let refs = inner
            .reaction_refs
            .remove(name)
            .ok_or_else(|| DependencyError::ReactionNotFound { name: name.to_string() })?;
        for trigger in &refs {
            if let Some(entry) = inner.triggers.get_mut(trigger) {
                entry.dependents.retain(|d| d != name);
            }
        }
        Ok(())
    }

    /// Enabled triggers subscribed to a topic, in registration order.
    #[must_use]
    pub fn triggers_from(&self, topic: &TopicId) -> Vec<TriggerDefinition> {
        let inner = self.lock();
        let mut matches: Vec<&TriggerEntry> = inner
            .triggers
            .values()
            .filter(|e| e.state.enabled && e.def.topics().contains(topic))
            .collect();
        matches.sort_by_key(|e| e.seq);
        matches.iter().map(|e| e.def.clone()).collect()
    }

    /// The group's required topic subscriptions: the union of topics
    /// referenced by all enabled leaf triggers.
    #[must_use]
    pub fn subscriptions(&self) -> Vec<TopicId> {
        let inner = self.lock();
        let mut entries: Vec<&TriggerEntry> = inner.triggers.values().filter(|e| e.state.enabled).collect();
        entries.sort_by_key(|e| e.seq);
        let mut topics = Vec::new();
        for entry in entries {
            for topic in entry.def.topics() {
                if !topics.contains(&topic) {
                    topics.push(topic);
                }
            }
        }
        topics
    }

    /// Whether any enabled trigger reads from `topic`.
    #[must_use]
    pub fn is_subscribed(&self, topic: &TopicId) -> bool {
        let inner = self.lock();
        inner
            .triggers
            .values()
            .any(|e| e.state.enabled && e.def.topics().contains(topic))
    }

    /// The definition for a trigger, if present.
    #[must_use]
    pub fn definition_of(&self, name: &str) -> Option<TriggerDefinition> {
        self.lock().triggers.get(name).map(|e| e.def.clone())
    }

    /// The committed runtime state for a trigger, if present.
    #[must_use]
    pub fn state_of(&self, name: &str) -> Option<TriggerRuntimeState> {
        self.lock().triggers.get(name).map(|e| e.state.clone())
    }

    /// Dependent composite triggers of a trigger, in registration order.
    #[must_use]
    pub fn dependent_triggers(&self, name: &str) -> Vec<TriggerDefinition> {
        let inner = self.lock();
        let Some(entry) = inner.triggers.get(name) else {
            return Vec::new();
        };
        entry
            .dependents
            .iter()
            .filter_map(|d| inner.triggers.get(d))
            .filter(|e| e.state.enabled)
            .map(|e| e.def.clone())
            .collect()
    }

    /// Dependent reactions of a trigger, in registration order.
    #[must_use]
    pub fn dependent_reactions(&self, name: &str) -> Vec<String> {
        let inner = self.lock();
        let Some(entry) = inner.triggers.get(name) else {
            return Vec::new();
        };
        entry
            .dependents
            .iter()
            .filter(|d| inner.reaction_refs.contains_key(*d))
            .cloned()
            .collect()
    }

    /// Commits an evaluated boolean, enforcing the commit rule.
    ///
    /// An unchanged value is a no-op: no timestamp change and
    /// [`CommitOutcome::Unchanged`] so callers skip notification. A changed
    /// value updates state and timestamp before the caller walks dependents.
    pub fn commit_state(&self, name: &str, value: bool) -> CommitOutcome {
        let mut inner = self.lock();
        let Some(entry) = inner.triggers.get_mut(name) else {
            return CommitOutcome::Skipped;
        };
        if !entry.state.enabled {
            return CommitOutcome::Skipped;
        }
        if entry.state.value == value {
            return CommitOutcome::Unchanged;
        }
        entry.state.value = value;
        entry.state.updated_at = Utc::now();
        CommitOutcome::Changed { value }
    }

    /// Snapshot of every trigger for inspection, in registration order.
    #[must_use]
    pub fn snapshot(&self) -> Vec<TriggerSnapshot> {
        let inner = self.lock();
        let mut entries: Vec<&TriggerEntry> = inner.triggers.values().collect();
        entries.sort_by_key(|e| e.seq);
        entries
            .iter()
            .map(|e| TriggerSnapshot {
                def: e.def.clone(),
                state: e.state.clone(),
                dependents: e.dependents.clone(),
            })
            .collect()
    }

    /// Names of registered reactions.
    #[must_use]
    pub fn reaction_names(&self) -> Vec<String> {
        self.lock().reaction_refs.keys().cloned().collect()
    }

    /// Drops every trigger and reaction edge (group deletion).
    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.triggers.clear();
        inner.reaction_refs.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::ValueField;
    use crate::reaction::{Action, ReactionDefinition, TriggerLevel};
    use crate::trigger::{Operand, Operator};

    fn leaf(name: &str, target: &str, packet: &str) -> TriggerDefinition {
        TriggerDefinition::new(
            name,
            "DEFAULT",
            Operand::item(target, packet, "TEMP", ValueField::Converted),
            Operator::GreaterThan,
            Operand::float(0.0),
        )
    }

    fn composite(name: &str, left: &str, op: Operator, right: &str) -> TriggerDefinition {
        TriggerDefinition::new(name, "DEFAULT", Operand::trigger(left), op, Operand::trigger(right))
    }

    fn reaction(name: &str, refs: &[&str]) -> ReactionDefinition {
        ReactionDefinition::new(
            name,
            refs.iter().map(|s| (*s).to_string()).collect(),
            TriggerLevel::Edge,
            0,
            vec![Action::Notify {
                message: "fired".to_string(),
                severity: "INFO".to_string(),
            }],
        )
    }

    #[test]
    fn test_add_composite_requires_roots() {
        let index = DependencyIndex::new();
        let err = index
            .add_trigger(composite("TRIG3", "TRIG1", Operator::And, "TRIG2"))
            .unwrap_err();
        assert!(err.is_dependency());

        index.add_trigger(leaf("TRIG1", "INST", "ADCS")).unwrap();
        index.add_trigger(leaf("TRIG2", "INST", "HEALTH")).unwrap();
        index
            .add_trigger(composite("TRIG3", "TRIG1", Operator::And, "TRIG2"))
            .unwrap();

        let snap = index.snapshot();
        let trig1 = snap.iter().find(|s| s.def.name == "TRIG1").unwrap();
        assert_eq!(trig1.dependents, vec!["TRIG3".to_string()]);
    }

    #[test]
    fn test_delete_blocked_by_dependents() {
        let index = DependencyIndex::new();
        index.add_trigger(leaf("TRIG1", "INST", "ADCS")).unwrap();
        index.add_trigger(leaf("TRIG2", "INST", "HEALTH")).unwrap();
        index
            .add_trigger(composite("TRIG3", "TRIG1", Operator::Or, "TRIG2"))
            .unwrap();

        let err = index.remove_trigger("TRIG1").unwrap_err();
        let msg = format!("{err}");
        assert!(msg.contains("TRIG3"));

        index.remove_trigger("TRIG3").unwrap();
        index.remove_trigger("TRIG1").unwrap();
        assert!(index.definition_of("TRIG1").is_none());
    }

    #[test]
    fn test_reaction_dependents_block_delete() {
        let index = DependencyIndex::new();
        index.add_trigger(leaf("TRIG1", "INST", "ADCS")).unwrap();
        index.add_reaction(&reaction("REACT1", &["TRIG1"])).unwrap();

        let err = index.remove_trigger("TRIG1").unwrap_err();
        assert!(format!("{err}").contains("REACT1"));
        assert_eq!(index.dependent_reactions("TRIG1"), vec!["REACT1".to_string()]);

        index.remove_reaction("REACT1").unwrap();
        index.remove_trigger("TRIG1").unwrap();
    }

    #[test]
    fn test_reaction_add_is_all_or_nothing() {
        let index = DependencyIndex::new();
        index.add_trigger(leaf("TRIG1", "INST", "ADCS")).unwrap();
        let err = index.add_reaction(&reaction("REACT1", &["TRIG1", "TRIG9"])).unwrap_err();
        assert!(err.is_dependency());
        // No partial edge was written.
        assert!(index.dependent_reactions("TRIG1").is_empty());
        assert!(index.remove_trigger("TRIG1").is_ok());
    }

    #[test]
    fn test_subscription_recompute_on_update() {
        let index = DependencyIndex::new();
        index.add_trigger(leaf("TRIG1", "INST", "ADCS")).unwrap();
        let before = index.subscriptions();
        assert_eq!(before, vec![TopicId::from_parts("INST", "ADCS")]);

        let mut updated = leaf("TRIG1", "INST", "HEALTH");
        updated.created_at = index.definition_of("TRIG1").unwrap().created_at;
        index.update_trigger(updated).unwrap();

        let after = index.subscriptions();
        assert_eq!(after, vec![TopicId::from_parts("INST", "HEALTH")]);
    }

    #[test]
    fn test_disable_removes_subscription_and_forces_false() {
        let index = DependencyIndex::new();
        index.add_trigger(leaf("TRIG1", "INST", "ADCS")).unwrap();
        assert_eq!(index.commit_state("TRIG1", true), CommitOutcome::Changed { value: true });

        index.disable_trigger("TRIG1").unwrap();
        assert!(index.subscriptions().is_empty());
        let state = index.state_of("TRIG1").unwrap();
        assert!(!state.enabled);
        assert!(!state.value);
        assert_eq!(index.commit_state("TRIG1", true), CommitOutcome::Skipped);

        index.enable_trigger("TRIG1").unwrap();
        assert_eq!(index.subscriptions().len(), 1);
    }

    #[test]
    fn test_commit_rule_idempotent() {
        let index = DependencyIndex::new();
        index.add_trigger(leaf("TRIG1", "INST", "ADCS")).unwrap();

        assert_eq!(index.commit_state("TRIG1", false), CommitOutcome::Unchanged);
        assert_eq!(index.commit_state("TRIG1", true), CommitOutcome::Changed { value: true });
        let first_stamp = index.state_of("TRIG1").unwrap().updated_at;
        assert_eq!(index.commit_state("TRIG1", true), CommitOutcome::Unchanged);
        assert_eq!(index.state_of("TRIG1").unwrap().updated_at, first_stamp);
    }

    #[test]
    fn test_triggers_from_registration_order() {
        let index = DependencyIndex::new();
        index.add_trigger(leaf("TRIG2", "INST", "ADCS")).unwrap();
        index.add_trigger(leaf("TRIG1", "INST", "ADCS")).unwrap();
        let names: Vec<String> = index
            .triggers_from(&TopicId::from_parts("INST", "ADCS"))
            .into_iter()
            .map(|d| d.name)
            .collect();
        assert_eq!(names, vec!["TRIG2".to_string(), "TRIG1".to_string()]);
    }
}
