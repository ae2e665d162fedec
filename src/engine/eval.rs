//! The trigger evaluation algorithm.
//!
//! An [`Evaluator`] runs inside each evaluator worker. For every dispatched
//! topic it evaluates the enabled leaf triggers subscribed to that topic,
//! commits changed booleans, and walks the dependents graph: composite
//! triggers are recomputed first, then the reactions referencing each changed
//! trigger are notified through the transition channel. Any evaluation
//! failure disables only the offending trigger and is published as a
//! structured error event.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, RwLock};

use crossbeam_channel::Sender;
use tracing::{debug, error};

use crate::error::EvaluationError;
use crate::event::{AutonomicEvent, EventKind, EventSink};
use crate::graph::{CommitOutcome, DependencyIndex};
use crate::packet::{PacketBuffer, TelemetryPacket, TopicId};
use crate::reactor::TriggerTransition;
use crate::trigger::{Operand, Operator, TriggerDefinition};
use crate::value::OperandValue;

const REGEX_CACHE_MAX: usize = 1024;

static REGEX_CACHE: OnceLock<RwLock<HashMap<String, regex::Regex>>> = OnceLock::new();

fn cached_regex(pattern: &str) -> Result<regex::Regex, EvaluationError> {
    let cache = REGEX_CACHE.get_or_init(|| RwLock::new(HashMap::new()));

    if let Ok(guard) = cache.read() {
        if let Some(re) = guard.get(pattern) {
            return Ok(re.clone());
        }
    }

    let compiled = regex::Regex::new(pattern).map_err(|e| EvaluationError::InvalidRegex {
        pattern: pattern.to_string(),
        reason: e.to_string(),
    })?;

    if let Ok(mut guard) = cache.write() {
        if guard.len() >= REGEX_CACHE_MAX {
            guard.clear();
        }
        guard.insert(pattern.to_string(), compiled.clone());
    }
    Ok(compiled)
}

/// Result of evaluating one leaf trigger against the packet history.
#[derive(Debug)]
enum LeafOutcome {
    /// A boolean to commit.
    Value(bool),
    /// Change operator without enough history: leave state untouched.
    NoTransition,
    /// Evaluation failed; the trigger must be disabled.
    Failed(EvaluationError),
}

/// Evaluates triggers for dispatched topics and fans out state changes.
pub struct Evaluator {
    index: Arc<DependencyIndex>,
    packets: Arc<PacketBuffer>,
    sink: Arc<dyn EventSink>,
    transitions: Sender<TriggerTransition>,
}

impl Evaluator {
    /// Wires an evaluator to the shared state and the reaction channel.
    pub fn new(
        index: Arc<DependencyIndex>,
        packets: Arc<PacketBuffer>,
        sink: Arc<dyn EventSink>,
        transitions: Sender<TriggerTransition>,
    ) -> Self {
        Self {
            index,
            packets,
            sink,
            transitions,
        }
    }

    /// Evaluates every enabled trigger subscribed to `topic`, in
    /// registration order. Per-trigger failures are isolated: a faulty
    /// trigger is disabled and its siblings still evaluate.
    pub fn process_topic(&self, topic: &TopicId) {
        for def in self.index.triggers_from(topic) {
            debug!(trigger = %def.name, %topic, "evaluating");
            match self.evaluate_leaf(&def) {
                LeafOutcome::Value(value) => {
                    let mut path = Vec::new();
                    self.commit_and_fan_out(&def.name, value, &mut path);
                }
                LeafOutcome::NoTransition => {}
                LeafOutcome::Failed(err) => self.disable_with_error(&def.name, &err),
            }
        }
    }

    /// Commits a boolean and, when the state flipped, notifies dependents:
    /// composite triggers are recomputed (and cascade), then dependent
    /// reactions are told about this trigger's transition. `path` carries
    /// the cascade path for cycle detection.
    fn commit_and_fan_out(&self, name: &str, value: bool, path: &mut Vec<String>) {
        let CommitOutcome::Changed { value } = self.index.commit_state(name, value) else {
            return;
        };

        let kind = if value { EventKind::True } else { EventKind::False };
        self.sink
            .publish(AutonomicEvent::trigger(kind, name, format!("{name} is {value}")));

        self.fan_out(name, value, path);
    }

    /// Walks the dependents of `name` after its state changed: composite
    /// triggers are recomputed (and cascade), then the transition is sent
    /// to the reaction channel.
    fn fan_out(&self, name: &str, value: bool, path: &mut Vec<String>) {
        path.push(name.to_string());
        for dependent in self.index.dependent_triggers(name) {
            if path.contains(&dependent.name) {
                let err = EvaluationError::CycleDetected {
                    head: path[0].clone(),
                    name: dependent.name.clone(),
                };
                self.disable_with_error(&dependent.name, &err);
                continue;
            }
            match self.evaluate_composite(&dependent) {
                Ok(composite_value) => self.commit_and_fan_out(&dependent.name, composite_value, path),
                Err(err) => self.disable_with_error(&dependent.name, &err),
            }
        }
        path.pop();

        let transition = TriggerTransition::new(name, value);
        if self.transitions.send(transition).is_err() {
            debug!(trigger = name, "reaction engine not listening for transitions");
        }
    }

    /// Recomputes the composites depending on `name` after its stored state
    /// was forced false outside normal evaluation (disable, update,
    /// quarantine), so a composite is never left holding a stale true.
    pub(crate) fn refresh_dependents(&self, name: &str) {
        let mut path = Vec::new();
        self.fan_out(name, false, &mut path);
    }

    /// Recomputes an AND/OR trigger from the committed states of its roots.
    fn evaluate_composite(&self, def: &TriggerDefinition) -> Result<bool, EvaluationError> {
        // Validation guarantees trigger operands on composite triggers.
        let (Some(left_ref), Some(right_ref)) = (def.left.trigger_ref(), def.right.trigger_ref())
        else {
            return Ok(false);
        };
        let left = self.committed_value(left_ref)?;
        let right = self.committed_value(right_ref)?;
        Ok(match def.operator {
            Operator::And => left && right,
            Operator::Or => left || right,
            // Validation guarantees boolean operators on composite triggers.
            _ => left,
        })
    }

    /// Reads a trigger's committed boolean. Disabled triggers hold a
    /// committed false, which is what we read.
    fn committed_value(&self, name: &str) -> Result<bool, EvaluationError> {
        self.index
            .state_of(name)
            .map(|s| s.value)
            .ok_or_else(|| EvaluationError::UnresolvedTriggerRef {
                name: name.to_string(),
            })
    }

    fn evaluate_leaf(&self, def: &TriggerDefinition) -> LeafOutcome {
        if def.operator.is_change() {
            return self.evaluate_change(def);
        }

        let left = match self.resolve_operand(&def.left, &def.right) {
            Ok(v) => v,
            Err(err) => return LeafOutcome::Failed(err),
        };
        let right = match self.resolve_operand(&def.right, &def.left) {
            Ok(v) => v,
            Err(err) => return LeafOutcome::Failed(err),
        };

        // A missing limit-state label resolves to "no value": the condition
        // is simply not satisfied, not an error.
        let (Some(left), Some(right)) = (left, right) else {
            return LeafOutcome::Value(false);
        };

        match compare(&left, def.operator, &right) {
            Ok(result) => LeafOutcome::Value(result),
            Err(err) => LeafOutcome::Failed(err),
        }
    }

    /// `CHANGES` / `DOES NOT CHANGE`: compares the item's value in the two
    /// most recent packets. Until two samples exist there is no transition.
    fn evaluate_change(&self, def: &TriggerDefinition) -> LeafOutcome {
        let Operand::Item {
            target,
            packet,
            item,
            value_type,
        } = &def.left
        else {
            // Validation guarantees an item operand for change operators.
            return LeafOutcome::NoTransition;
        };
        let topic = TopicId::from_parts(target, packet);

        let Some(previous) = self.packets.previous(&topic) else {
            return LeafOutcome::NoTransition;
        };
        let Some(latest) = self.packets.latest(&topic) else {
            return LeafOutcome::NoTransition;
        };

        let current = match read_item(&latest, target, packet, item, *value_type) {
            Ok(v) => v,
            Err(err) => return LeafOutcome::Failed(err),
        };
        let prior = match read_item(&previous, target, packet, item, *value_type) {
            Ok(v) => v,
            Err(err) => return LeafOutcome::Failed(err),
        };

        let changed = !values_equal(&current, &prior);
        let result = match def.operator {
            Operator::Changes => changed,
            _ => !changed,
        };
        LeafOutcome::Value(result)
    }

    /// Resolves one operand against the latest packet and constants.
    ///
    /// When the other side is a `Limit` constant, an item operand resolves to
    /// the item's current limit-state label; a packet that has not arrived
    /// yet yields no value rather than an error (mirrors reading limits from
    /// an empty buffer).
    fn resolve_operand(
        &self,
        operand: &Operand,
        other: &Operand,
    ) -> Result<Option<OperandValue>, EvaluationError> {
        match operand {
            Operand::Item {
                target,
                packet,
                item,
                value_type,
            } => {
                let against_limit =
                    matches!(other, Operand::Limit { .. }) || *value_type == crate::packet::ValueField::Limit;
                let topic = TopicId::from_parts(target, packet);
                if against_limit {
                    let Some(latest) = self.packets.latest(&topic) else {
                        return Ok(None);
                    };
                    return Ok(latest
                        .limit_state(item)
                        .map(|label| OperandValue::Limit(label.to_string())));
                }
                let latest = self.packets.latest(&topic).ok_or_else(|| EvaluationError::PacketNotFound {
                    target: target.clone(),
                    packet: packet.clone(),
                })?;
                read_item(&latest, target, packet, item, *value_type).map(Some)
            }
            Operand::Float { float } => Ok(Some(OperandValue::Float(*float))),
            Operand::Text { text } => Ok(Some(OperandValue::Text(text.clone()))),
            Operand::Limit { limit } => Ok(Some(OperandValue::Limit(limit.clone()))),
            Operand::Regex { regex } => Ok(Some(OperandValue::Regex(cached_regex(regex)?))),
            Operand::Trigger { trigger } => {
                self.committed_value(trigger).map(|v| Some(OperandValue::Bool(v)))
            }
        }
    }

    /// Catches an evaluation failure: the offending trigger is disabled with
    /// its state forced false, and a structured error event is published.
    /// Nothing propagates; sibling triggers and other topics continue.
    fn disable_with_error(&self, name: &str, err: &EvaluationError) {
        error!(trigger = name, %err, "evaluation failed, disabling trigger");
        let was_true = self.index.quarantine(name);
        self.sink
            .publish(AutonomicEvent::trigger(EventKind::Error, name, err.to_string()));
        if was_true {
            self.refresh_dependents(name);
        }
    }
}

fn read_item(
    packet: &TelemetryPacket,
    target: &str,
    packet_name: &str,
    item: &str,
    field: crate::packet::ValueField,
) -> Result<OperandValue, EvaluationError> {
    packet
        .read(item, field)
        .map(OperandValue::from)
        .ok_or_else(|| EvaluationError::ItemNotFound {
            target: target.to_string(),
            packet: packet_name.to_string(),
            item: item.to_string(),
        })
}

/// Equality across resolved values: numeric when both sides are numeric,
/// text when both are textual, boolean when both are booleans.
fn values_equal(left: &OperandValue, right: &OperandValue) -> bool {
    if let (Some(l), Some(r)) = (left.as_f64(), right.as_f64()) {
        return (l - r).abs() == 0.0;
    }
    if let (Some(l), Some(r)) = (left.as_text(), right.as_text()) {
        return l == r;
    }
    if let (Some(l), Some(r)) = (left.as_bool(), right.as_bool()) {
        return l == r;
    }
    false
}

/// Applies a comparison operator to two resolved operands.
///
/// Equality against a regex constant becomes match / no-match. Ordering
/// operators require both sides numeric; mismatched types are an evaluation
/// failure, not a crash.
fn compare(left: &OperandValue, operator: Operator, right: &OperandValue) -> Result<bool, EvaluationError> {
    if let OperandValue::Regex(re) = right {
        let text = left.as_text().ok_or_else(|| mismatch(left, operator, right))?;
        return match operator {
            Operator::Equal => Ok(re.is_match(text)),
            Operator::NotEqual => Ok(!re.is_match(text)),
            _ => Err(mismatch(left, operator, right)),
        };
    }

    if let (Some(l), Some(r)) = (left.as_f64(), right.as_f64()) {
        return Ok(match operator {
            Operator::GreaterThan => l > r,
            Operator::LessThan => l < r,
            Operator::GreaterOrEqual => l >= r,
            Operator::LessOrEqual => l <= r,
            Operator::Equal => l == r,
            Operator::NotEqual => l != r,
            _ => return Err(mismatch(left, operator, right)),
        });
    }

    match operator {
        Operator::Equal => Ok(values_equal(left, right)),
        Operator::NotEqual => Ok(!values_equal(left, right)),
        _ => Err(mismatch(left, operator, right)),
    }
}

fn mismatch(left: &OperandValue, operator: Operator, right: &OperandValue) -> EvaluationError {
    EvaluationError::TypeMismatch {
        left: left.to_string(),
        operator: operator.to_string(),
        right: right.to_string(),
    }
}
