//! Reaction definitions: trigger references, firing mode, snooze, actions.
//!
//! A reaction executes its action list when a referenced trigger condition is
//! satisfied, subject to edge/level mode and a snooze cooldown.

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::DefinitionError;

/// When a reaction fires relative to trigger-state transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TriggerLevel {
    /// Fires only on a false-to-true transition.
    Edge,
    /// Fires whenever a referenced trigger is (or becomes) true, including
    /// immediately upon creation or re-enable.
    Level,
}

/// One follow-on action in a reaction's ordered action list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    /// Send a command through the unattended (no hazard confirmation) path.
    Command {
        value: String,
    },
    /// Run a script by path through the script transport.
    Script {
        path: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        environment: Option<serde_json::Value>,
    },
    /// Emit a notification onto the shared event stream.
    Notify {
        message: String,
        severity: String,
    },
}

impl Action {
    pub const fn is_gated(&self) -> bool {
        // Command and script execution honor the automation-enabled toggle.
        matches!(self, Self::Command { .. } | Self::Script { .. })
    }

    pub(crate) fn kind(&self) -> &'static str {
        match self {
            Self::Command { .. } => "command",
            Self::Script { .. } => "script",
            Self::Notify { .. } => "notify",
        }
    }
}

/// A named rule executing actions when its trigger condition(s) are satisfied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReactionDefinition {
    pub name: String,
    /// Ordered, duplicate-free list of referenced trigger names.
    pub trigger_refs: Vec<String>,
    pub level: TriggerLevel,
    /// Cooldown after firing, in seconds. Zero disables snoozing.
    pub snooze_seconds: u64,
    pub actions: Vec<Action>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ReactionDefinition {
    /// Creates a definition stamped now. Call [`validate`](Self::validate)
    /// before handing it to the engine.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        trigger_refs: Vec<String>,
        level: TriggerLevel,
        snooze_seconds: u64,
        actions: Vec<Action>,
    ) -> Self {
        let now = Utc::now();
        Self {
            name: name.into(),
            trigger_refs,
            level,
            snooze_seconds,
            actions,
            created_at: now,
            updated_at: now,
        }
    }

    /// Checks structural validity: at least one trigger reference, no
    /// duplicate references, at least one action.
    pub fn validate(&self) -> Result<(), DefinitionError> {
        if self.trigger_refs.is_empty() {
            return Err(DefinitionError::EmptyTriggerRefs);
        }
        for (i, name) in self.trigger_refs.iter().enumerate() {
            if self.trigger_refs[..i].contains(name) {
                return Err(DefinitionError::DuplicateTriggerRef { name: name.clone() });
            }
        }
        if self.actions.is_empty() {
            return Err(DefinitionError::EmptyActions);
        }
        Ok(())
    }
}

impl fmt::Display for ReactionDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// Mutable per-reaction runtime state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReactionRuntimeState {
    pub enabled: bool,
    /// Set while snoozing; cleared lazily once the deadline passes.
    pub snoozed_until: Option<DateTime<Utc>>,
}

impl ReactionRuntimeState {
    #[must_use]
    pub const fn armed() -> Self {
        Self {
            enabled: true,
            snoozed_until: None,
        }
    }

    /// True when enabled and outside any snooze window.
    #[must_use]
    pub fn can_fire(&self, now: DateTime<Utc>) -> bool {
        self.enabled && self.snoozed_until.map_or(true, |until| now >= until)
    }

    /// Starts the snooze window. A zero-second snooze is a no-op.
    pub fn sleep(&mut self, snooze_seconds: u64, now: DateTime<Utc>) {
        if snooze_seconds > 0 {
            self.snoozed_until = Some(now + Duration::seconds(snooze_seconds.min(i64::MAX as u64) as i64));
        }
    }

    /// Clears the snooze window.
    pub fn awaken(&mut self) {
        self.snoozed_until = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn notify() -> Action {
        Action::Notify {
            message: "fired".to_string(),
            severity: "INFO".to_string(),
        }
    }

    #[test]
    fn test_validate_requires_triggers_and_actions() {
        let def = ReactionDefinition::new("REACT1", Vec::new(), TriggerLevel::Edge, 60, vec![notify()]);
        assert!(matches!(def.validate(), Err(DefinitionError::EmptyTriggerRefs)));

        let def = ReactionDefinition::new("REACT1", vec!["TRIG1".to_string()], TriggerLevel::Edge, 60, Vec::new());
        assert!(matches!(def.validate(), Err(DefinitionError::EmptyActions)));

        let def = ReactionDefinition::new(
            "REACT1",
            vec!["TRIG1".to_string(), "TRIG1".to_string()],
            TriggerLevel::Edge,
            60,
            vec![notify()],
        );
        assert!(matches!(def.validate(), Err(DefinitionError::DuplicateTriggerRef { .. })));
    }

    #[test]
    fn test_snooze_window() {
        let now = Utc::now();
        let mut state = ReactionRuntimeState::armed();
        assert!(state.can_fire(now));

        state.sleep(30, now);
        assert!(!state.can_fire(now));
        assert!(state.can_fire(now + Duration::seconds(30)));

        state.awaken();
        assert!(state.can_fire(now));
    }

    #[test]
    fn test_zero_snooze_never_sleeps() {
        let now = Utc::now();
        let mut state = ReactionRuntimeState::armed();
        state.sleep(0, now);
        assert!(state.snoozed_until.is_none());
    }

    #[test]
    fn test_action_serde_shape() {
        let json = serde_json::to_value(Action::Script {
            path: "safe_mode.rb".to_string(),
            environment: None,
        })
        .unwrap();
        assert_eq!(json["type"], "script");
        assert_eq!(json["path"], "safe_mode.rb");

        let level: TriggerLevel = serde_json::from_str("\"LEVEL\"").unwrap();
        assert_eq!(level, TriggerLevel::Level);
    }
}
