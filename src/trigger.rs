//! Trigger definitions: operands, operators, and validation.
//!
//! A trigger is a named boolean condition. Leaf triggers compare a telemetry
//! item, limit state, or sample history against a constant; composite
//! triggers combine two existing triggers with AND/OR. Definitions are
//! validated before they enter the dependency index, so evaluation only ever
//! sees compatible operand/operator combinations (bad regexes are the
//! runtime fallback).

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::DefinitionError;
use crate::packet::{TopicId, ValueField};

/// One side of a trigger condition.
///
/// Serialized keyed by `type`, matching the control-feed payload shape:
/// `{"type": "float", "float": 690000.0}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Operand {
    /// A telemetry item read in a particular form.
    Item {
        target: String,
        packet: String,
        item: String,
        value_type: ValueField,
    },
    /// Numeric constant.
    Float {
        float: f64,
    },
    /// String constant.
    Text {
        text: String,
    },
    /// Regex constant, compiled at evaluation time.
    Regex {
        regex: String,
    },
    /// Limit-state label constant, e.g. `RED` or `YELLOW_LOW`.
    Limit {
        limit: String,
    },
    /// Reference to another trigger's boolean state.
    Trigger {
        trigger: String,
    },
}

impl Operand {
    /// Item operand shorthand.
    #[must_use]
    pub fn item(
        target: impl Into<String>,
        packet: impl Into<String>,
        item: impl Into<String>,
        value_type: ValueField,
    ) -> Self {
        Self::Item {
            target: target.into(),
            packet: packet.into(),
            item: item.into(),
            value_type,
        }
    }

    #[must_use]
    pub const fn float(value: f64) -> Self {
        Self::Float { float: value }
    }

    #[must_use]
    pub fn text(value: impl Into<String>) -> Self {
        Self::Text { text: value.into() }
    }

    #[must_use]
    pub fn regex(pattern: impl Into<String>) -> Self {
        Self::Regex {
            regex: pattern.into(),
        }
    }

    #[must_use]
    pub fn limit(label: impl Into<String>) -> Self {
        Self::Limit {
            limit: label.into(),
        }
    }

    #[must_use]
    pub fn trigger(name: impl Into<String>) -> Self {
        Self::Trigger {
            trigger: name.into(),
        }
    }

    pub const fn is_item(&self) -> bool {
        matches!(self, Self::Item { .. })
    }

    pub const fn is_trigger(&self) -> bool {
        matches!(self, Self::Trigger { .. })
    }

    /// The referenced trigger name, for `Trigger` operands.
    #[must_use]
    pub fn trigger_ref(&self) -> Option<&str> {
        match self {
            Self::Trigger { trigger } => Some(trigger),
            _ => None,
        }
    }

    /// The telemetry topic this operand reads, for `Item` operands.
    #[must_use]
    pub fn topic(&self) -> Option<TopicId> {
        match self {
            Self::Item { target, packet, .. } => Some(TopicId::from_parts(target, packet)),
            _ => None,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Self::Item { .. } => "item",
            Self::Float { .. } => "float",
            Self::Text { .. } => "text",
            Self::Regex { .. } => "regex",
            Self::Limit { .. } => "limit",
            Self::Trigger { .. } => "trigger",
        }
    }
}

/// Trigger comparison, change, and boolean operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operator {
    #[serde(rename = ">")]
    GreaterThan,
    #[serde(rename = "<")]
    LessThan,
    #[serde(rename = ">=")]
    GreaterOrEqual,
    #[serde(rename = "<=")]
    LessOrEqual,
    #[serde(rename = "==")]
    Equal,
    #[serde(rename = "!=")]
    NotEqual,
    #[serde(rename = "CHANGES")]
    Changes,
    #[serde(rename = "DOES NOT CHANGE")]
    DoesNotChange,
    #[serde(rename = "AND")]
    And,
    #[serde(rename = "OR")]
    Or,
}

impl Operator {
    /// Ordering or equality against a resolved value.
    #[must_use]
    pub const fn is_comparison(&self) -> bool {
        matches!(
            self,
            Self::GreaterThan
                | Self::LessThan
                | Self::GreaterOrEqual
                | Self::LessOrEqual
                | Self::Equal
                | Self::NotEqual
        )
    }

    /// Compares the two most recent samples of the left operand.
    #[must_use]
    pub const fn is_change(&self) -> bool {
        matches!(self, Self::Changes | Self::DoesNotChange)
    }

    /// Combines two referenced triggers.
    #[must_use]
    pub const fn is_boolean(&self) -> bool {
        matches!(self, Self::And | Self::Or)
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::GreaterThan => ">",
            Self::LessThan => "<",
            Self::GreaterOrEqual => ">=",
            Self::LessOrEqual => "<=",
            Self::Equal => "==",
            Self::NotEqual => "!=",
            Self::Changes => "CHANGES",
            Self::DoesNotChange => "DOES NOT CHANGE",
            Self::And => "AND",
            Self::Or => "OR",
        };
        write!(f, "{s}")
    }
}

/// A named boolean condition over telemetry, limit state, or other triggers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerDefinition {
    pub name: String,
    pub group: String,
    pub left: Operand,
    pub operator: Operator,
    pub right: Operand,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TriggerDefinition {
    /// Creates a definition stamped now. Call [`validate`](Self::validate)
    /// before handing it to the index.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        group: impl Into<String>,
        left: Operand,
        operator: Operator,
        right: Operand,
    ) -> Self {
        let now = Utc::now();
        Self {
            name: name.into(),
            group: group.into(),
            left,
            operator,
            right,
            created_at: now,
            updated_at: now,
        }
    }

    /// Checks operand/operator compatibility.
    ///
    /// Boolean operators require both operands to be trigger references;
    /// comparison and change operators reject trigger references. Change
    /// operators read only the left operand, which must be a telemetry item.
    /// Regex constants must compile.
    pub fn validate(&self) -> Result<(), DefinitionError> {
        if self.name.is_empty() {
            return Err(DefinitionError::EmptyTriggerName);
        }

        if self.operator.is_boolean() {
            if !self.left.is_trigger() || !self.right.is_trigger() {
                return Err(DefinitionError::InvalidOperand {
                    operator: self.operator.to_string(),
                    reason: format!(
                        "both operands must be trigger references, got {} and {}",
                        self.left.kind(),
                        self.right.kind()
                    ),
                });
            }
            return Ok(());
        }

        if self.left.is_trigger() || self.right.is_trigger() {
            return Err(DefinitionError::InvalidOperator {
                operator: self.operator.to_string(),
                allowed: "[AND, OR]".to_string(),
            });
        }

        if self.operator.is_change() {
            if !self.left.is_item() {
                return Err(DefinitionError::InvalidOperand {
                    operator: self.operator.to_string(),
                    reason: format!("left operand must be an item, got {}", self.left.kind()),
                });
            }
            // The right operand is ignored for change operators.
            return Ok(());
        }

        for operand in [&self.left, &self.right] {
            if let Operand::Regex { regex } = operand {
                regex::Regex::new(regex).map_err(|e| DefinitionError::InvalidRegex {
                    pattern: regex.clone(),
                    reason: e.to_string(),
                })?;
            }
        }

        Ok(())
    }

    /// Names of triggers this definition references.
    #[must_use]
    pub fn roots(&self) -> Vec<String> {
        let mut roots = Vec::new();
        for operand in [&self.left, &self.right] {
            if let Some(name) = operand.trigger_ref() {
                if !roots.iter().any(|r| r == name) {
                    roots.push(name.to_string());
                }
            }
        }
        roots
    }

    /// Telemetry topics this definition reads.
    ///
    /// Change operators only read the left operand, so only its topic counts.
    #[must_use]
    pub fn topics(&self) -> Vec<TopicId> {
        let mut topics = Vec::new();
        let operands: &[&Operand] = if self.operator.is_change() {
            &[&self.left]
        } else {
            &[&self.left, &self.right]
        };
        for operand in operands {
            if let Some(topic) = operand.topic() {
                if !topics.contains(&topic) {
                    topics.push(topic);
                }
            }
        }
        topics
    }

    /// True for triggers combining other triggers.
    #[must_use]
    pub const fn is_composite(&self) -> bool {
        self.operator.is_boolean()
    }
}

impl fmt::Display for TriggerDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.group, self.name)
    }
}

/// Mutable per-trigger runtime state, committed by the evaluator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerRuntimeState {
    /// Most recently committed boolean value.
    pub value: bool,
    /// False when user-disabled or auto-disabled after an evaluation error.
    pub enabled: bool,
    pub updated_at: DateTime<Utc>,
}

impl TriggerRuntimeState {
    #[must_use]
    pub fn armed() -> Self {
        Self {
            value: false,
            enabled: true,
            updated_at: Utc::now(),
        }
    }
}
