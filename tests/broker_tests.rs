use hvsbus::config::ConfigError;
use hvsbus::telemetry::PRIORITY_AVAILABILITY;
use hvsbus::*;

fn agent_from_json(json: &str) -> EmulatorAgent {
    let config = EmulatorConfig::from_json(json).unwrap();
    let mut agent = EmulatorAgent::new(config, 0).unwrap();
    agent.start(Ok(()), 0);
    agent
}

#[test]
fn test_custom_module_topic() {
    let mut agent = agent_from_json(r#"{ "broker": { "module_topic": "garage/hvs/" } }"#);
    let mut broker = MemoryBroker::new();
    agent.on_broker_connected(&mut broker).unwrap();

    assert_eq!(
        broker.subscriptions(),
        ["master/heartbeat", "garage/hvs/+/+/set", "garage/hvs/+/+/reset", "garage/hvs/restart"]
    );

    agent.handle_broker_message("garage/hvs/battery/temp/set", "31.5", 0);
    assert_eq!(agent.registry().get("battery/temp"), Some(31.5));

    // Topics already relative to the module are accepted too.
    agent.handle_broker_message("battery/temp/reset", "", 0);
    assert_eq!(agent.registry().get("battery/temp"), Some(12.0));

    agent.drain_telemetry(&mut broker);
    assert_eq!(broker.published()[0].topic, "garage/hvs/available");
}

#[test]
fn test_announcements_on_connect() {
    let mut agent = agent_from_json(r#"{ "broker": { "hostname": "pack1", "drain_budget": 8 } }"#);
    let mut broker = MemoryBroker::new();
    agent.on_broker_connected(&mut broker).unwrap();

    assert_eq!(agent.queue().peek_highest().unwrap().priority, PRIORITY_AVAILABILITY);
    assert_eq!(agent.drain_telemetry(&mut broker), 3);

    let published = broker.take_published();
    assert_eq!(published[0].topic, "pack1/available");
    assert_eq!(published[1].topic, "pack1/hostname");
    assert_eq!(published[1].payload, "pack1");
    assert_eq!(published[2].topic, "pack1/module_topic");
    assert_eq!(published[2].payload, "pack1/");
    assert!(published.iter().all(|m| m.retain));
}

#[test]
fn test_drain_budget_limits_each_call() {
    let mut agent = agent_from_json(r#"{ "broker": { "drain_budget": 2 } }"#);
    let mut broker = MemoryBroker::new();
    for i in 0..5 {
        agent.log(format!("line {i}"));
    }

    assert_eq!(agent.drain_telemetry(&mut broker), 2);
    assert_eq!(agent.drain_telemetry(&mut broker), 2);
    assert_eq!(agent.drain_telemetry(&mut broker), 1);
    assert_eq!(agent.drain_telemetry(&mut broker), 0);

    let payloads: Vec<_> = broker.published().iter().map(|m| m.payload.as_str()).collect();
    assert_eq!(payloads, ["line 0", "line 1", "line 2", "line 3", "line 4"]);
}

#[test]
fn test_small_queue_keeps_availability() {
    let mut agent = agent_from_json(r#"{ "broker": { "queue_capacity": 4 } }"#);
    let mut bus = SimulatedBus::new();
    let mut broker = MemoryBroker::new();
    agent.on_broker_connected(&mut broker).unwrap();

    // Four limit fields into one free slot.
    agent.poll(&mut bus, 0).unwrap();
    assert_eq!(agent.queue().len(), 4);
    assert_eq!(agent.queue().get_stats().total_dropped, 3);

    agent.drain_telemetry(&mut broker);
    assert_eq!(broker.published()[0].topic, "hvsbus/available");
}

#[test]
fn test_disconnected_broker_keeps_backlog() {
    let mut agent = agent_from_json("{}");
    let mut bus = SimulatedBus::new();
    let mut broker = MemoryBroker::new();
    broker.set_connected(false);

    assert!(matches!(
        agent.on_broker_connected(&mut broker),
        Err(AgentError::Broker(BrokerError::Disconnected))
    ));

    agent.poll(&mut bus, 0).unwrap();
    let backlog = agent.queue().len();
    assert_eq!(agent.drain_telemetry(&mut broker), 0);
    assert_eq!(agent.queue().len(), backlog);
}

#[test]
fn test_agent_validates_hand_built_config() {
    let mut config = EmulatorConfig::default();
    config.scheduler.handshake_attempts = 0;
    assert!(matches!(
        EmulatorAgent::new(config, 0),
        Err(AgentError::Config(ConfigError::Invalid(_)))
    ));
}

#[test]
fn test_invalid_configs_rejected() {
    for json in [
        r#"{ "battery": { "modules": 0 } }"#,
        r#"{ "broker": { "queue_capacity": 0 } }"#,
        r#"{ "broker": { "drain_budget": 0 } }"#,
        r#"{ "scheduler": { "limits_interval_ms": 0 } }"#,
    ] {
        assert!(matches!(EmulatorConfig::from_json(json), Err(ConfigError::Invalid(_))));
    }
}
