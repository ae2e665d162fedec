//! # Autonomic - A rule engine for live telemetry
//!
//! Autonomic watches a stream of decommutated telemetry packets, evaluates
//! named boolean triggers against them, and fires reactions (commands,
//! scripts, notifications) when trigger conditions are satisfied.
//!
//! ## Core Concepts
//!
//! - **Trigger**: A named boolean condition over packet items, constants, or
//!   other triggers (`AND`/`OR` composition)
//! - **Reaction**: An ordered action list bound to one or more triggers,
//!   with edge/level firing semantics and a snooze cooldown
//! - **Group**: An isolation boundary; one [`GroupRuntime`] owns the
//!   threads, state, and feed for its triggers and reactions
//! - **Feed**: A single merged channel of telemetry packets and
//!   control-plane events, applied in arrival order
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use autonomic::{
//!     ChannelEventSink, ControlEvent, FeedEvent, GroupRuntime, GroupRuntimeConfig,
//!     InMemoryCommandTransport, InMemoryScriptRunner, Operand, Operator,
//!     TriggerControl, TriggerDefinition, ValueField,
//! };
//!
//! let (sink, events) = ChannelEventSink::pair(1024);
//! let runtime = GroupRuntime::start(
//!     GroupRuntimeConfig::new("DEFAULT"),
//!     Arc::new(InMemoryCommandTransport::new()),
//!     Arc::new(InMemoryScriptRunner::new()),
//!     Arc::new(sink),
//! )?;
//!
//! let trigger = TriggerDefinition::new(
//!     "TRIG1",
//!     "DEFAULT",
//!     Operand::item("INST", "HEALTH_STATUS", "TEMP1", ValueField::Converted),
//!     Operator::GreaterThan,
//!     Operand::float(50.0),
//! );
//! runtime.apply(ControlEvent::Trigger(TriggerControl::Create(trigger)))?;
//!
//! // Producers push packets through the feed sender.
//! let feed = runtime.feed();
//! # autonomic::AutonomicResult::Ok(())
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]

// Core types
pub mod error;
pub mod event;
pub mod packet;
pub mod reaction;
pub mod trigger;
pub mod value;

// State and execution
pub mod actions;
pub mod engine;
pub mod graph;
pub mod reactor;

// Re-export primary types at crate root for convenience
pub use actions::{
    ActionExecutor, CommandTransport, InMemoryCommandTransport, InMemoryScriptRunner, ScriptRunner,
};
pub use engine::{GroupRuntime, GroupRuntimeConfig};
pub use error::{
    ActionError, AutonomicError, AutonomicResult, DefinitionError, DependencyError, EvaluationError,
};
pub use event::{
    AutonomicEvent, ChannelEventSink, ControlEvent, EventClass, EventKind, EventSink, FeedEvent,
    GroupControl, ReactionControl, TriggerControl,
};
pub use graph::{CommitOutcome, DependencyIndex, TriggerSnapshot};
pub use packet::{PacketBuffer, PacketItem, TelemetryPacket, TopicId, ValueField};
pub use reaction::{Action, ReactionDefinition, ReactionRuntimeState, TriggerLevel};
pub use reactor::{ReactionEngine, ReactionEngineConfig, TriggerTransition};
pub use trigger::{Operand, Operator, TriggerDefinition, TriggerRuntimeState};
pub use value::{OperandValue, TelemetryValue};
