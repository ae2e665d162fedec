//! Error types for the autonomic rule engine.
//!
//! All errors are strongly typed using thiserror. Control-plane errors
//! (`DefinitionError`, `DependencyError`) are rejected synchronously and never
//! enter the dependency index. Runtime errors (`EvaluationError`,
//! `ActionError`) are recovered locally and surfaced as structured events,
//! never propagated into the telemetry feed.

use thiserror::Error;

/// Errors raised while validating a trigger or reaction definition.
///
/// These are rejected at create/update time, before any index mutation.
#[derive(Debug, Error)]
pub enum DefinitionError {
    #[error("Trigger name cannot be empty")]
    EmptyTriggerName,

    #[error("Existing trigger found: {name}")]
    DuplicateTrigger {
        name: String,
    },

    #[error("Existing reaction found: {name}")]
    DuplicateReaction {
        name: String,
    },

    #[error("Invalid operator '{operator}', must be one of {allowed}")]
    InvalidOperator {
        operator: String,
        allowed: String,
    },

    #[error("Invalid operand for operator '{operator}': {reason}")]
    InvalidOperand {
        operator: String,
        reason: String,
    },

    #[error("Invalid regex '{pattern}': {reason}")]
    InvalidRegex {
        pattern: String,
        reason: String,
    },

    #[error("Reaction must reference at least one trigger")]
    EmptyTriggerRefs,

    #[error("Duplicate trigger reference '{name}' in reaction")]
    DuplicateTriggerRef {
        name: String,
    },

    #[error("Reaction must contain at least one action")]
    EmptyActions,
}

/// Errors raised by dependency bookkeeping in the index.
#[derive(Debug, Error)]
pub enum DependencyError {
    #[error("Trigger not found: {name}")]
    TriggerNotFound {
        name: String,
    },

    #[error("Reaction not found: {name}")]
    ReactionNotFound {
        name: String,
    },

    #[error("Failed to delete {name} due to dependents: {dependents:?}")]
    InUse {
        name: String,
        dependents: Vec<String>,
    },
}

/// Errors raised during trigger evaluation.
///
/// Any of these disables only the offending trigger; evaluation of all other
/// triggers and topics continues unaffected.
#[derive(Debug, Error)]
pub enum EvaluationError {
    #[error("Packet {target} {packet} not found")]
    PacketNotFound {
        target: String,
        packet: String,
    },

    #[error("Item {target} {packet} {item} not found")]
    ItemNotFound {
        target: String,
        packet: String,
        item: String,
    },

    #[error("Invalid regex '{pattern}': {reason}")]
    InvalidRegex {
        pattern: String,
        reason: String,
    },

    #[error("Invalid evaluate: ({left} {operator} {right})")]
    TypeMismatch {
        left: String,
        operator: String,
        right: String,
    },

    #[error("Loop detected from {head} -> {name}")]
    CycleDetected {
        head: String,
        name: String,
    },

    #[error("Trigger reference '{name}' has no committed state")]
    UnresolvedTriggerRef {
        name: String,
    },
}

/// Errors raised while executing a reaction action.
///
/// Recovered per action; remaining actions and reactions proceed.
#[derive(Debug, Error)]
pub enum ActionError {
    #[error("Command failed: {message}")]
    CommandFailed {
        message: String,
    },

    #[error("Script '{path}' failed with status {status}")]
    ScriptFailed {
        path: String,
        status: u16,
    },

    #[error("Script transport failed: {message}")]
    ScriptTransport {
        message: String,
    },

    #[error("Automation is disabled")]
    AutomationDisabled,
}

/// Top-level error type for the autonomic engine.
#[derive(Debug, Error)]
pub enum AutonomicError {
    #[error("Definition error: {0}")]
    Definition(#[from] DefinitionError),

    #[error("Dependency error: {0}")]
    Dependency(#[from] DependencyError),

    #[error("Evaluation error: {0}")]
    Evaluation(#[from] EvaluationError),

    #[error("Action error: {0}")]
    Action(#[from] ActionError),

    #[error("Shutdown timed out after {grace_ms}ms: {thread}")]
    ShutdownTimeout {
        thread: String,
        grace_ms: u64,
    },

    #[error("Internal error: {message}")]
    Internal {
        message: String,
    },
}

impl AutonomicError {
    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns true if this is a definition error.
    #[must_use]
    pub const fn is_definition(&self) -> bool {
        matches!(self, Self::Definition(_))
    }

    /// Returns true if this is a dependency error.
    #[must_use]
    pub const fn is_dependency(&self) -> bool {
        matches!(self, Self::Dependency(_))
    }
}

/// Result type alias for autonomic operations.
pub type AutonomicResult<T> = Result<T, AutonomicError>;
