//! End-to-end tests driving a full group runtime through its merged feed.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::Receiver;

use autonomic::{
    Action, AutonomicEvent, ChannelEventSink, CommandTransport, ControlEvent, EventKind, FeedEvent,
    GroupControl, GroupRuntime, GroupRuntimeConfig, InMemoryCommandTransport, InMemoryScriptRunner,
    Operand, Operator, PacketItem, ReactionControl, ReactionDefinition, ScriptRunner,
    TelemetryPacket, TelemetryValue, TriggerControl, TriggerDefinition, TriggerLevel, ValueField,
};

struct Harness {
    runtime: GroupRuntime,
    commands: Arc<InMemoryCommandTransport>,
    scripts: Arc<InMemoryScriptRunner>,
    events: Receiver<AutonomicEvent>,
}

fn start() -> Harness {
    start_with(GroupRuntimeConfig::new("DEFAULT"))
}

fn start_with(mut config: GroupRuntimeConfig) -> Harness {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    // Fast snooze sweeps keep the timing-sensitive tests short.
    config.snooze_poll = Duration::from_millis(50);
    let commands = Arc::new(InMemoryCommandTransport::new());
    let scripts = Arc::new(InMemoryScriptRunner::new());
    let (sink, events) = ChannelEventSink::pair(4096);
    let runtime = GroupRuntime::start(
        config,
        Arc::clone(&commands) as Arc<dyn CommandTransport>,
        Arc::clone(&scripts) as Arc<dyn ScriptRunner>,
        Arc::new(sink),
    )
    .unwrap();
    Harness {
        runtime,
        commands,
        scripts,
        events,
    }
}

fn health_packet(temp1: f64, temp2: f64) -> TelemetryPacket {
    TelemetryPacket::new("INST", "HEALTH_STATUS")
        .with_item("TEMP1", PacketItem::raw(TelemetryValue::Float(temp1)))
        .with_item("TEMP2", PacketItem::raw(TelemetryValue::Float(temp2)))
}

fn temp_trigger(name: &str, item: &str, operator: Operator, threshold: f64) -> TriggerDefinition {
    TriggerDefinition::new(
        name,
        "DEFAULT",
        Operand::item("INST", "HEALTH_STATUS", item, ValueField::Converted),
        operator,
        Operand::float(threshold),
    )
}

fn composite_trigger(name: &str, left: &str, operator: Operator, right: &str) -> TriggerDefinition {
    TriggerDefinition::new(
        name,
        "DEFAULT",
        Operand::trigger(left),
        operator,
        Operand::trigger(right),
    )
}

fn notify_reaction(name: &str, trigger: &str, level: TriggerLevel, snooze: u64) -> ReactionDefinition {
    ReactionDefinition::new(
        name,
        vec![trigger.to_string()],
        level,
        snooze,
        vec![Action::Command {
            value: format!("{name} FIRED"),
        }],
    )
}

fn wait_for<F: Fn() -> bool>(what: &str, condition: F) {
    for _ in 0..250 {
        if condition() {
            return;
        }
        thread::sleep(Duration::from_millis(20));
    }
    panic!("timed out waiting for {what}");
}

#[test]
fn test_trigger_state_commits_once_per_transition() {
    let h = start();
    h.runtime
        .apply(ControlEvent::Trigger(TriggerControl::Create(temp_trigger(
            "TRIG1",
            "TEMP1",
            Operator::GreaterThan,
            50.0,
        ))))
        .unwrap();

    let feed = h.runtime.feed();
    feed.send(FeedEvent::Telemetry(health_packet(60.0, 0.0))).unwrap();
    wait_for("TRIG1 true", || {
        h.runtime.index().state_of("TRIG1").is_some_and(|s| s.value)
    });

    // An identical sample commits nothing new.
    feed.send(FeedEvent::Telemetry(health_packet(61.0, 0.0))).unwrap();
    feed.send(FeedEvent::Telemetry(health_packet(40.0, 0.0))).unwrap();
    wait_for("TRIG1 false", || {
        h.runtime.index().state_of("TRIG1").is_some_and(|s| !s.value)
    });
    // Let the event publishes settle before draining the sink.
    thread::sleep(Duration::from_millis(100));

    let kinds: Vec<EventKind> = h
        .events
        .try_iter()
        .filter(|e| e.name == "TRIG1" && matches!(e.kind, EventKind::True | EventKind::False))
        .map(|e| e.kind)
        .collect();
    assert_eq!(kinds, vec![EventKind::True, EventKind::False]);

    h.runtime.shutdown().unwrap();
}

#[test]
fn test_control_and_telemetry_apply_in_feed_order() {
    let h = start();
    let feed = h.runtime.feed();

    // Trigger creation rides the same feed as the packet that satisfies it.
    feed.send(FeedEvent::Control(ControlEvent::Trigger(TriggerControl::Create(
        temp_trigger("TRIG1", "TEMP1", Operator::LessThan, 0.0),
    ))))
    .unwrap();
    feed.send(FeedEvent::Telemetry(health_packet(-5.0, 0.0))).unwrap();

    wait_for("TRIG1 true", || {
        h.runtime.index().state_of("TRIG1").is_some_and(|s| s.value)
    });
    h.runtime.shutdown().unwrap();
}

#[test]
fn test_trigger_created_after_startup_sees_next_packet() {
    let h = start();
    // Let the manager run well past startup before the trigger exists, so
    // the subscription is established entirely through the synchronous path.
    thread::sleep(Duration::from_millis(200));
    h.runtime
        .apply(ControlEvent::Trigger(TriggerControl::Create(temp_trigger(
            "TRIG1",
            "TEMP1",
            Operator::GreaterThan,
            50.0,
        ))))
        .unwrap();

    h.runtime
        .feed()
        .send(FeedEvent::Telemetry(health_packet(60.0, 0.0)))
        .unwrap();
    wait_for("TRIG1 true", || {
        h.runtime.index().state_of("TRIG1").is_some_and(|s| s.value)
    });
    h.runtime.shutdown().unwrap();
}

#[test]
fn test_disabling_a_root_recomputes_composites() {
    let h = start();
    for def in [
        temp_trigger("TRIG1", "TEMP1", Operator::GreaterThan, 0.0),
        temp_trigger("TRIG2", "TEMP2", Operator::GreaterThan, 0.0),
    ] {
        h.runtime
            .apply(ControlEvent::Trigger(TriggerControl::Create(def)))
            .unwrap();
    }
    h.runtime
        .apply(ControlEvent::Trigger(TriggerControl::Create(composite_trigger(
            "TRIG3",
            "TRIG1",
            Operator::Or,
            "TRIG2",
        ))))
        .unwrap();

    h.runtime
        .feed()
        .send(FeedEvent::Telemetry(health_packet(1.0, 0.0)))
        .unwrap();
    wait_for("TRIG3 true", || {
        h.runtime.index().state_of("TRIG3").is_some_and(|s| s.value)
    });

    // Disabling TRIG1 forces it false; TRIG3 must follow, not hold a
    // stale true.
    h.runtime
        .apply(ControlEvent::Trigger(TriggerControl::Disable {
            name: "TRIG1".to_string(),
        }))
        .unwrap();
    assert!(h.runtime.index().state_of("TRIG3").is_some_and(|s| !s.value));

    h.runtime.shutdown().unwrap();
}

#[test]
fn test_deleting_last_subscriber_drops_packet_history() {
    let h = start();
    h.runtime
        .apply(ControlEvent::Trigger(TriggerControl::Create(temp_trigger(
            "TRIG1",
            "TEMP1",
            Operator::GreaterThan,
            0.0,
        ))))
        .unwrap();

    h.runtime
        .feed()
        .send(FeedEvent::Telemetry(health_packet(1.0, 0.0)))
        .unwrap();
    wait_for("TRIG1 true", || {
        h.runtime.index().state_of("TRIG1").is_some_and(|s| s.value)
    });

    let topic = health_packet(0.0, 0.0).topic();
    assert!(h.runtime.packets().latest(&topic).is_some());

    h.runtime
        .apply(ControlEvent::Trigger(TriggerControl::Delete {
            name: "TRIG1".to_string(),
        }))
        .unwrap();
    assert!(h.runtime.packets().latest(&topic).is_none());

    h.runtime.shutdown().unwrap();
}

#[test]
fn test_composite_triggers_cascade_before_reactions() {
    let h = start();
    for def in [
        temp_trigger("TRIG1", "TEMP1", Operator::GreaterThan, 0.0),
        temp_trigger("TRIG2", "TEMP2", Operator::GreaterThan, 0.0),
    ] {
        h.runtime
            .apply(ControlEvent::Trigger(TriggerControl::Create(def)))
            .unwrap();
    }
    h.runtime
        .apply(ControlEvent::Trigger(TriggerControl::Create(composite_trigger(
            "TRIG3",
            "TRIG1",
            Operator::And,
            "TRIG2",
        ))))
        .unwrap();
    h.runtime
        .apply(ControlEvent::Reaction(ReactionControl::Create(notify_reaction(
            "REACT3",
            "TRIG3",
            TriggerLevel::Edge,
            0,
        ))))
        .unwrap();

    let feed = h.runtime.feed();
    feed.send(FeedEvent::Telemetry(health_packet(1.0, 0.0))).unwrap();
    feed.send(FeedEvent::Telemetry(health_packet(1.0, 1.0))).unwrap();

    wait_for("composite true", || {
        h.runtime.index().state_of("TRIG3").is_some_and(|s| s.value)
    });
    wait_for("reaction fired", || h.commands.sent().len() == 1);

    feed.send(FeedEvent::Telemetry(health_packet(1.0, -1.0))).unwrap();
    wait_for("composite false", || {
        h.runtime.index().state_of("TRIG3").is_some_and(|s| !s.value)
    });

    h.runtime.shutdown().unwrap();
}

#[test]
fn test_trigger_deletion_blocked_while_referenced() {
    let h = start();
    h.runtime
        .apply(ControlEvent::Trigger(TriggerControl::Create(temp_trigger(
            "TRIG1",
            "TEMP1",
            Operator::GreaterThan,
            0.0,
        ))))
        .unwrap();
    h.runtime
        .apply(ControlEvent::Reaction(ReactionControl::Create(notify_reaction(
            "REACT1",
            "TRIG1",
            TriggerLevel::Edge,
            0,
        ))))
        .unwrap();

    let err = h
        .runtime
        .apply(ControlEvent::Trigger(TriggerControl::Delete {
            name: "TRIG1".to_string(),
        }))
        .unwrap_err();
    assert!(err.to_string().contains("REACT1"));

    // Dropping the reaction unblocks the trigger.
    h.runtime
        .apply(ControlEvent::Reaction(ReactionControl::Delete {
            name: "REACT1".to_string(),
        }))
        .unwrap();
    h.runtime
        .apply(ControlEvent::Trigger(TriggerControl::Delete {
            name: "TRIG1".to_string(),
        }))
        .unwrap();

    h.runtime.shutdown().unwrap();
}

#[test]
fn test_faulty_trigger_disabled_without_harming_siblings() {
    let h = start();
    // TRIG1 compares a numeric item against a regex, which fails at
    // evaluation time. TRIG2 is healthy.
    h.runtime
        .apply(ControlEvent::Trigger(TriggerControl::Create(TriggerDefinition::new(
            "TRIG1",
            "DEFAULT",
            Operand::item("INST", "HEALTH_STATUS", "TEMP1", ValueField::Converted),
            Operator::Equal,
            Operand::regex("^SAFE$"),
        ))))
        .unwrap();
    h.runtime
        .apply(ControlEvent::Trigger(TriggerControl::Create(temp_trigger(
            "TRIG2",
            "TEMP2",
            Operator::GreaterThan,
            0.0,
        ))))
        .unwrap();

    let feed = h.runtime.feed();
    feed.send(FeedEvent::Telemetry(health_packet(1.0, 1.0))).unwrap();

    wait_for("TRIG1 quarantined", || {
        h.runtime.index().state_of("TRIG1").is_some_and(|s| !s.enabled)
    });
    wait_for("TRIG2 still evaluates", || {
        h.runtime.index().state_of("TRIG2").is_some_and(|s| s.value)
    });
    assert!(h.events.try_iter().any(|e| e.name == "TRIG1" && e.kind == EventKind::Error));

    // Explicit re-enable re-arms the trigger.
    h.runtime
        .apply(ControlEvent::Trigger(TriggerControl::Enable {
            name: "TRIG1".to_string(),
        }))
        .unwrap();
    assert!(h.runtime.index().state_of("TRIG1").is_some_and(|s| s.enabled));

    h.runtime.shutdown().unwrap();
}

#[test]
fn test_level_reaction_refires_after_snooze_while_edge_does_not() {
    let h = start();
    h.runtime
        .apply(ControlEvent::Trigger(TriggerControl::Create(temp_trigger(
            "TRIG1",
            "TEMP1",
            Operator::GreaterThan,
            0.0,
        ))))
        .unwrap();
    h.runtime
        .apply(ControlEvent::Reaction(ReactionControl::Create(notify_reaction(
            "LEVEL1",
            "TRIG1",
            TriggerLevel::Level,
            1,
        ))))
        .unwrap();
    h.runtime
        .apply(ControlEvent::Reaction(ReactionControl::Create(notify_reaction(
            "EDGE1",
            "TRIG1",
            TriggerLevel::Edge,
            1,
        ))))
        .unwrap();

    let feed = h.runtime.feed();
    feed.send(FeedEvent::Telemetry(health_packet(5.0, 0.0))).unwrap();

    wait_for("both fired once", || {
        let sent = h.commands.sent();
        sent.contains(&"LEVEL1 FIRED".to_string()) && sent.contains(&"EDGE1 FIRED".to_string())
    });

    // Trigger stays true across the snooze window: only LEVEL1 re-fires.
    wait_for("level re-fire", || {
        h.commands.sent().iter().filter(|c| c.as_str() == "LEVEL1 FIRED").count() >= 2
    });
    assert_eq!(
        h.commands.sent().iter().filter(|c| c.as_str() == "EDGE1 FIRED").count(),
        1
    );

    h.runtime.shutdown().unwrap();
}

#[test]
fn test_automation_toggle_gates_commands_and_scripts() {
    let h = start();
    h.runtime
        .apply(ControlEvent::Trigger(TriggerControl::Create(temp_trigger(
            "TRIG1",
            "TEMP1",
            Operator::GreaterThan,
            0.0,
        ))))
        .unwrap();
    h.runtime
        .apply(ControlEvent::Reaction(ReactionControl::Create(ReactionDefinition::new(
            "REACT1",
            vec!["TRIG1".to_string()],
            TriggerLevel::Edge,
            0,
            vec![
                Action::Command {
                    value: "INST SAFE_MODE".to_string(),
                },
                Action::Script {
                    path: "procedures/safe.rb".to_string(),
                    environment: None,
                },
                Action::Notify {
                    message: "went safe".to_string(),
                    severity: "WARN".to_string(),
                },
            ],
        ))))
        .unwrap();

    h.runtime
        .apply(ControlEvent::Automation { enabled: false })
        .unwrap();
    assert!(!h.runtime.automation_enabled());

    let feed = h.runtime.feed();
    feed.send(FeedEvent::Telemetry(health_packet(5.0, 0.0))).unwrap();

    // The notify still lands; the gated actions are skipped.
    wait_for("notify published", || {
        let mut seen = false;
        for event in h.events.try_iter() {
            if event.kind == EventKind::Notify && event.message == "went safe" {
                seen = true;
            }
        }
        seen
    });
    assert!(h.commands.sent().is_empty());
    assert!(h.scripts.runs().is_empty());

    h.runtime.shutdown().unwrap();
}

#[test]
fn test_run_now_bypasses_disabled_state() {
    let h = start();
    h.runtime
        .apply(ControlEvent::Trigger(TriggerControl::Create(temp_trigger(
            "TRIG1",
            "TEMP1",
            Operator::GreaterThan,
            0.0,
        ))))
        .unwrap();
    h.runtime
        .apply(ControlEvent::Reaction(ReactionControl::Create(notify_reaction(
            "REACT1",
            "TRIG1",
            TriggerLevel::Edge,
            60,
        ))))
        .unwrap();
    h.runtime
        .apply(ControlEvent::Reaction(ReactionControl::Disable {
            name: "REACT1".to_string(),
        }))
        .unwrap();

    h.runtime
        .apply(ControlEvent::Reaction(ReactionControl::RunNow {
            name: "REACT1".to_string(),
        }))
        .unwrap();
    wait_for("manual run", || h.commands.sent().len() == 1);
    // Manual runs never start the snooze window.
    assert!(h
        .runtime
        .reactions()
        .state_of("REACT1")
        .is_some_and(|s| s.snoozed_until.is_none()));

    h.runtime.shutdown().unwrap();
}

#[test]
fn test_group_delete_clears_reactions_then_triggers() {
    let h = start();
    h.runtime
        .apply(ControlEvent::Trigger(TriggerControl::Create(temp_trigger(
            "TRIG1",
            "TEMP1",
            Operator::GreaterThan,
            0.0,
        ))))
        .unwrap();
    h.runtime
        .apply(ControlEvent::Reaction(ReactionControl::Create(notify_reaction(
            "REACT1",
            "TRIG1",
            TriggerLevel::Edge,
            0,
        ))))
        .unwrap();

    h.runtime
        .apply(ControlEvent::Group(GroupControl::Deleted {
            name: "DEFAULT".to_string(),
        }))
        .unwrap();

    assert!(h.runtime.index().definition_of("TRIG1").is_none());
    assert!(h.runtime.reactions().definition_of("REACT1").is_none());
    assert!(h.runtime.index().subscriptions().is_empty());

    h.runtime.shutdown().unwrap();
}

#[test]
fn test_shutdown_terminates_within_grace() {
    let h = start();
    h.runtime
        .apply(ControlEvent::Trigger(TriggerControl::Create(temp_trigger(
            "TRIG1",
            "TEMP1",
            Operator::GreaterThan,
            0.0,
        ))))
        .unwrap();
    let feed = h.runtime.feed();
    for i in 0..50 {
        feed.send(FeedEvent::Telemetry(health_packet(f64::from(i), 0.0)))
            .unwrap();
    }
    // Clean shutdown even with work in flight and the feed sender alive.
    h.runtime.shutdown().unwrap();
}
