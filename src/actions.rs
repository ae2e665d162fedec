//! Action execution: transport seams and the automation gate.
//!
//! Commands and scripts leave the engine through the [`CommandTransport`]
//! and [`ScriptRunner`] traits so deployments can wire real transports while
//! tests use the in-memory implementations. Gated actions honor the
//! engine-wide automation toggle; notifications always go through.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crate::error::ActionError;
use crate::event::{AutonomicEvent, EventKind, EventSink};
use crate::reaction::Action;

/// Outbound command path. Reaction commands skip hazard confirmation: they
/// run unattended, so the transport must not prompt.
pub trait CommandTransport: Send + Sync {
    /// Sends one command string, returning once it is accepted downstream.
    fn send_no_hazard(&self, command: &str) -> Result<(), ActionError>;
}

/// Outbound script path. `initiator` names the reaction that requested the
/// run so the script environment can carry provenance.
pub trait ScriptRunner: Send + Sync {
    /// Starts the script at `path` with the supplied environment.
    fn run(
        &self,
        path: &str,
        environment: Option<&serde_json::Value>,
        initiator: &str,
    ) -> Result<(), ActionError>;
}

/// Runs a reaction's actions against the configured transports.
///
/// The automation toggle gates commands and scripts only; a disabled
/// automation still emits notifications.
pub struct ActionExecutor {
    commands: Arc<dyn CommandTransport>,
    scripts: Arc<dyn ScriptRunner>,
    sink: Arc<dyn EventSink>,
    automation_enabled: AtomicBool,
}

impl ActionExecutor {
    /// An executor with automation initially enabled.
    pub fn new(
        commands: Arc<dyn CommandTransport>,
        scripts: Arc<dyn ScriptRunner>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            commands,
            scripts,
            sink,
            automation_enabled: AtomicBool::new(true),
        }
    }

    /// Flips the engine-wide automation gate.
    pub fn set_automation_enabled(&self, enabled: bool) {
        self.automation_enabled.store(enabled, Ordering::SeqCst);
    }

    /// Whether gated actions currently execute.
    #[must_use]
    pub fn automation_enabled(&self) -> bool {
        self.automation_enabled.load(Ordering::SeqCst)
    }

    /// Executes one action on behalf of `reaction`.
    ///
    /// Returns [`ActionError::AutomationDisabled`] for a gated action while
    /// automation is off; the caller decides how to report it.
    pub fn execute(&self, reaction: &str, action: &Action) -> Result<(), ActionError> {
        if action.is_gated() && !self.automation_enabled() {
            return Err(ActionError::AutomationDisabled);
        }
        match action {
            Action::Command { value } => self.commands.send_no_hazard(value),
            Action::Script { path, environment } => {
                self.scripts.run(path, environment.as_ref(), reaction)
            }
            Action::Notify { message, severity } => {
                self.sink.publish(
                    AutonomicEvent::reaction(EventKind::Notify, reaction, message.clone())
                        .with_severity(severity.clone()),
                );
                Ok(())
            }
        }
    }
}

/// Records commands instead of sending them. Intended for tests and dry runs.
#[derive(Debug, Default)]
pub struct InMemoryCommandTransport {
    sent: Mutex<Vec<String>>,
}

impl InMemoryCommandTransport {
    /// An empty transport.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every command sent so far, in order.
    #[must_use]
    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl CommandTransport for InMemoryCommandTransport {
    fn send_no_hazard(&self, command: &str) -> Result<(), ActionError> {
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(command.to_string());
        Ok(())
    }
}

/// Records script runs instead of launching them. Paths marked with
/// [`fail_path`](Self::fail_path) report a failed run.
#[derive(Debug, Default)]
pub struct InMemoryScriptRunner {
    runs: Mutex<Vec<String>>,
    failing: Mutex<HashSet<String>>,
}

impl InMemoryScriptRunner {
    /// An empty runner.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every script path run so far, in order.
    #[must_use]
    pub fn runs(&self) -> Vec<String> {
        self.runs.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Marks a path so subsequent runs of it report failure.
    pub fn fail_path(&self, path: impl Into<String>) {
        self.failing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(path.into());
    }
}

impl ScriptRunner for InMemoryScriptRunner {
    fn run(
        &self,
        path: &str,
        _environment: Option<&serde_json::Value>,
        _initiator: &str,
    ) -> Result<(), ActionError> {
        if self
            .failing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(path)
        {
            return Err(ActionError::ScriptFailed {
                path: path.to_string(),
                status: 1,
            });
        }
        self.runs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(path.to_string());
        Ok(())
    }
}
