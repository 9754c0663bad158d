use crate::bus::{Broker, BrokerError, BusError, CanBus};
use crate::config::{ConfigError, EmulatorConfig};
use crate::handshake::HandshakeHandler;
use crate::registry::ValueRegistry;
use crate::safety::{HeartbeatStatus, SafetyMonitor};
use crate::scheduler::{FrameCategory, FrameScheduler};
use crate::telemetry::{
    EnqueueOutcome, QueuedTelemetryMessage, TelemetryQueue, PRIORITY_AVAILABILITY, PRIORITY_INFO,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Upper bound on inbound frames handled per poll so a chatty bus cannot
/// starve the periodic frames.
const MAX_FRAMES_PER_POLL: usize = 32;

const SET_SUFFIX: &str = "/set";
const RESET_SUFFIX: &str = "/reset";
const RESTART_TOPIC: &str = "restart";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RestartReason {
    BusInitFailed,
    HeartbeatLost,
    Requested,
}

impl core::fmt::Display for RestartReason {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            RestartReason::BusInitFailed => write!(f, "bus driver failed to initialise"),
            RestartReason::HeartbeatLost => write!(f, "master heartbeat timeout"),
            RestartReason::Requested => write!(f, "restart requested"),
        }
    }
}

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("restart required: {0}")]
    RestartRequired(RestartReason),
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("broker error: {0}")]
    Broker(#[from] BrokerError),
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AgentState {
    pub running: bool,
    pub bus_ready: bool,
    pub uptime_ms: u64,
    pub frames_received: u32,
    pub broker_messages: u32,
    pub messages_published: u32,
    pub publish_failures: u32,
    pub rx_overflows: u32,
    pub restart_reason: Option<RestartReason>,
    pub last_error: Option<String>,
}

/// What an inbound broker message did.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum BrokerAction {
    Set { key: String, value: f32 },
    Reset { key: String },
    Heartbeat,
    Restart,
    /// `/set` whose payload was not a float.
    Rejected { key: String },
    Ignored,
}

#[derive(Debug, Clone, Default)]
pub struct PollReport {
    pub frames_received: usize,
    pub fired: heapless::Vec<FrameCategory, 4>,
}

/// The emulation engine: owns the battery state and every component, and is
/// driven by one cooperative loop calling [`EmulatorAgent::poll`] and
/// [`EmulatorAgent::drain_telemetry`].
pub struct EmulatorAgent {
    config: EmulatorConfig,
    module_topic: String,

    registry: ValueRegistry,
    scheduler: FrameScheduler,
    handshake: HandshakeHandler,
    safety: SafetyMonitor,
    queue: TelemetryQueue,

    state: AgentState,
    start_ms: u64,
}

impl EmulatorAgent {
    pub fn new(config: EmulatorConfig, now_ms: u64) -> Result<Self, AgentError> {
        config.validate()?;

        Ok(Self {
            module_topic: config.broker.resolved_module_topic(),
            registry: ValueRegistry::new(&config.battery),
            scheduler: FrameScheduler::new(&config.scheduler, now_ms),
            handshake: HandshakeHandler::new(&config.battery, &config.scheduler),
            safety: SafetyMonitor::new(&config.safety, now_ms),
            queue: TelemetryQueue::new(config.broker.queue_capacity),
            state: AgentState::default(),
            start_ms: now_ms,
            config,
        })
    }

    /// Record the outcome of bringing up the bus driver. A failed driver is
    /// not retried; the agent goes quiet and asks for a restart once the
    /// grace period has passed.
    pub fn start(&mut self, bus_init: Result<(), BusError>, now_ms: u64) {
        self.state.running = true;
        self.start_ms = now_ms;

        match bus_init {
            Ok(()) => {
                self.state.bus_ready = true;
                info!(
                    cells = self.registry.state().cell_count(),
                    module_topic = %self.module_topic,
                    "battery emulator started"
                );
            }
            Err(e) => {
                self.state.bus_ready = false;
                self.state.last_error = Some(format!("bus init failed: {e}"));
                error!(error = %e, "error initialising CAN driver");
                self.log("Error Initializing CAN driver...");
            }
        }
    }

    pub fn stop(&mut self) {
        self.state.running = false;
        info!("battery emulator stopping");
    }

    /// One iteration of the control loop: drain inbound frames, then fire any
    /// due periodic frames.
    pub fn poll<B: CanBus + ?Sized>(&mut self, bus: &mut B, now_ms: u64) -> Result<PollReport, AgentError> {
        self.state.uptime_ms = now_ms.saturating_sub(self.start_ms);

        if let Some(reason) = self.state.restart_reason {
            return Err(AgentError::RestartRequired(reason));
        }

        if !self.state.bus_ready {
            if self.state.uptime_ms >= self.config.safety.init_failure_grace_ms {
                return Err(self.request_restart(RestartReason::BusInitFailed));
            }
            return Ok(PollReport::default());
        }

        if self.safety.status(now_ms) == HeartbeatStatus::Lost {
            self.log("master heartbeat timeout - restarting!");
            return Err(self.request_restart(RestartReason::HeartbeatLost));
        }

        let frames_received = self.receive_frames(bus);

        let fired = self.scheduler.poll(
            now_ms,
            bus,
            self.registry.state_mut(),
            &mut self.safety,
            &mut self.queue,
        );

        Ok(PollReport { frames_received, fired })
    }

    fn receive_frames<B: CanBus + ?Sized>(&mut self, bus: &mut B) -> usize {
        let mut received = 0;
        while received < MAX_FRAMES_PER_POLL {
            match bus.receive() {
                Ok(frame) => {
                    received += 1;
                    self.state.frames_received = self.state.frames_received.saturating_add(1);
                    self.handshake.handle_frame(&frame, bus, &mut self.queue);
                }
                Err(nb::Error::WouldBlock) => break,
                Err(nb::Error::Other(e)) => {
                    warn!(error = %e, "error receiving frame");
                    break;
                }
            }
        }

        if bus.take_overflow() {
            self.state.rx_overflows = self.state.rx_overflows.saturating_add(1);
            warn!("CAN receive buffer overflow");
            self.log("buffer overflow!");
        }

        received
    }

    /// Inbound broker delivery. `topic` may carry the module prefix.
    pub fn handle_broker_message(&mut self, topic: &str, payload: &str, now_ms: u64) -> BrokerAction {
        self.state.broker_messages = self.state.broker_messages.saturating_add(1);
        let topic = topic.strip_prefix(self.module_topic.as_str()).unwrap_or(topic);

        if topic == self.config.broker.heartbeat_topic {
            self.safety.record_heartbeat(now_ms);
            debug!("master heartbeat");
            return BrokerAction::Heartbeat;
        }

        if topic == RESTART_TOPIC {
            self.log("restart requested - restarting!");
            self.request_restart(RestartReason::Requested);
            return BrokerAction::Restart;
        }

        if let Some(key) = topic.strip_suffix(SET_SUFFIX) {
            let Some(value) = parse_set_payload(payload) else {
                self.log(format!("failed to parse {payload} of topic {topic}."));
                return BrokerAction::Rejected { key: key.into() };
            };
            if self.registry.set(key, value) {
                info!(key, value, "value set");
                return BrokerAction::Set { key: key.into(), value };
            }
            return BrokerAction::Ignored;
        }

        if let Some(key) = topic.strip_suffix(RESET_SUFFIX) {
            if self.registry.reset(key) {
                info!(key, "value reset");
                return BrokerAction::Reset { key: key.into() };
            }
            return BrokerAction::Ignored;
        }

        BrokerAction::Ignored
    }

    /// Announce ourselves and subscribe after a broker session comes up.
    pub fn on_broker_connected<Br: Broker + ?Sized>(&mut self, broker: &mut Br) -> Result<(), AgentError> {
        self.queue.enqueue(QueuedTelemetryMessage::new("available", "online", true, PRIORITY_AVAILABILITY));
        self.queue.enqueue(QueuedTelemetryMessage::new(
            "hostname",
            self.config.broker.hostname.clone(),
            true,
            PRIORITY_INFO,
        ));
        self.queue.enqueue(QueuedTelemetryMessage::new(
            "module_topic",
            self.module_topic.clone(),
            true,
            PRIORITY_INFO,
        ));

        for topic in self.subscriptions() {
            broker.subscribe(&topic)?;
        }
        info!("broker session established");
        Ok(())
    }

    /// Topics to subscribe to. The heartbeat topic is absolute, the rest sit
    /// under the module prefix.
    pub fn subscriptions(&self) -> Vec<String> {
        vec![
            self.config.broker.heartbeat_topic.clone(),
            format!("{}+/+{SET_SUFFIX}", self.module_topic),
            format!("{}+/+{RESET_SUFFIX}", self.module_topic),
            format!("{}{RESTART_TOPIC}", self.module_topic),
        ]
    }

    /// Hand up to the configured budget of queued messages to the broker.
    /// Messages the broker refuses are dropped.
    pub fn drain_telemetry<Br: Broker + ?Sized>(&mut self, broker: &mut Br) -> usize {
        self.publish_queued(broker, self.config.broker.drain_budget)
    }

    /// Publish everything still queued, ignoring the per-call budget. Called
    /// on the way out after [`AgentError::RestartRequired`] so the restart
    /// reason reaches the broker before the process goes away.
    pub fn flush_telemetry<Br: Broker + ?Sized>(&mut self, broker: &mut Br) -> usize {
        let flushed = self.publish_queued(broker, usize::MAX);
        if !self.queue.is_empty() {
            warn!(left = self.queue.len(), "telemetry left unpublished");
        }
        flushed
    }

    fn publish_queued<Br: Broker + ?Sized>(&mut self, broker: &mut Br, limit: usize) -> usize {
        let mut published = 0;
        while published < limit && broker.is_connected() {
            let Some(message) = self.queue.dequeue_highest() else {
                break;
            };
            let topic = format!("{}{}", self.module_topic, message.topic);
            match broker.publish(&topic, &message.payload, message.retain) {
                Ok(()) => {
                    published += 1;
                    self.state.messages_published = self.state.messages_published.saturating_add(1);
                }
                Err(e) => {
                    self.state.publish_failures = self.state.publish_failures.saturating_add(1);
                    warn!(topic = %topic, error = %e, "publish failed, message dropped");
                    break;
                }
            }
        }
        published
    }

    /// Diagnostic line on the `log` topic.
    pub fn log(&mut self, line: impl Into<String>) -> EnqueueOutcome {
        let line = line.into();
        info!(target: "hvsbus::log", "{line}");
        self.queue.enqueue(QueuedTelemetryMessage::log(line))
    }

    fn request_restart(&mut self, reason: RestartReason) -> AgentError {
        if self.state.restart_reason.is_none() {
            error!(%reason, "requesting process restart");
            self.state.restart_reason = Some(reason);
        }
        AgentError::RestartRequired(reason)
    }

    pub fn get_state(&self) -> &AgentState {
        &self.state
    }

    pub fn registry(&self) -> &ValueRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut ValueRegistry {
        &mut self.registry
    }

    pub fn queue(&self) -> &TelemetryQueue {
        &self.queue
    }

    pub fn queue_mut(&mut self) -> &mut TelemetryQueue {
        &mut self.queue
    }

    pub fn scheduler(&self) -> &FrameScheduler {
        &self.scheduler
    }

    pub fn handshake(&self) -> &HandshakeHandler {
        &self.handshake
    }

    pub fn safety(&self) -> &SafetyMonitor {
        &self.safety
    }

    pub fn module_topic(&self) -> &str {
        &self.module_topic
    }

    pub fn config(&self) -> &EmulatorConfig {
        &self.config
    }
}

/// Leading whitespace is skipped and the rest must be a complete float. An
/// empty payload reads as zero; whitespace alone or trailing text does not
/// parse.
fn parse_set_payload(payload: &str) -> Option<f32> {
    if payload.is_empty() {
        return Some(0.0);
    }
    payload.trim_start().parse().ok()
}
