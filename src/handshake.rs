use crate::bus::{send_logged, CanBus};
use crate::codec::format_value;
use crate::config::{BatteryConfig, SchedulerConfig};
use crate::protocol::{decode_inbound, init_sequence, CanFrame, HostName, InboundMessage, INIT_SEQUENCE_LEN};
use crate::telemetry::{QueuedTelemetryMessage, TelemetryQueue, PRIORITY_TELEMETRY};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, warn};

pub const TOPIC_INVERTER_TYPE: &str = "inverter/type";
pub const TOPIC_INVERTER_VOLTAGE: &str = "inverter/battery_voltage";
pub const TOPIC_INVERTER_CURRENT: &str = "inverter/battery_current";
pub const TOPIC_INVERTER_TEMPERATURE: &str = "inverter/temperature";
pub const TOPIC_INVERTER_SOC: &str = "inverter/soc";
pub const TOPIC_INVERTER_TIMESTAMP: &str = "inverter/timestamp";

/// Result of one identification sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct InitReport {
    pub frames_sent: u8,
    pub frames_abandoned: u8,
    pub attempts: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct HandshakeStats {
    pub identification_requests: u32,
    pub init_frames_abandoned: u32,
    pub inverter_frames_decoded: u32,
    pub frames_ignored: u32,
}

/// Answers the host controller's discovery traffic and turns its telemetry
/// frames into broker messages.
#[derive(Debug)]
pub struct HandshakeHandler {
    init_frames: [CanFrame; INIT_SEQUENCE_LEN],
    max_attempts: u8,
    retry_delay: Duration,
    host_name: Option<HostName>,
    stats: HandshakeStats,
}

impl HandshakeHandler {
    pub fn new(battery: &BatteryConfig, scheduler: &SchedulerConfig) -> Self {
        Self {
            init_frames: init_sequence(battery),
            max_attempts: scheduler.handshake_attempts.max(1),
            retry_delay: Duration::from_millis(scheduler.handshake_retry_delay_ms),
            host_name: None,
            stats: HandshakeStats::default(),
        }
    }

    /// Route one inbound frame. Anything that does not decode is dropped.
    pub fn handle_frame<B: CanBus + ?Sized>(
        &mut self,
        frame: &CanFrame,
        bus: &mut B,
        queue: &mut TelemetryQueue,
    ) -> Option<InboundMessage> {
        debug!(frame = %frame.hex(), "recv");

        let Some(message) = decode_inbound(frame) else {
            self.stats.frames_ignored = self.stats.frames_ignored.saturating_add(1);
            return None;
        };

        match &message {
            InboundMessage::HostName(name) => {
                if self.host_name.as_ref() != Some(name) {
                    info!(host = %name, "host controller identified itself");
                }
                self.host_name = Some(*name);
                queue.enqueue(QueuedTelemetryMessage::new(
                    TOPIC_INVERTER_TYPE,
                    name.as_str(),
                    true,
                    PRIORITY_TELEMETRY,
                ));
            }
            InboundMessage::IdentificationRequest => {
                self.stats.identification_requests = self.stats.identification_requests.saturating_add(1);
                queue.enqueue(QueuedTelemetryMessage::log("sending initMessages!"));
                self.send_init_sequence(bus, queue);
            }
            InboundMessage::InverterBattery {
                voltage,
                current,
                temperature,
            } => {
                self.stats.inverter_frames_decoded = self.stats.inverter_frames_decoded.saturating_add(1);
                queue.enqueue(QueuedTelemetryMessage::telemetry(TOPIC_INVERTER_VOLTAGE, format_value(*voltage)));
                queue.enqueue(QueuedTelemetryMessage::telemetry(TOPIC_INVERTER_CURRENT, format_value(*current)));
                queue.enqueue(QueuedTelemetryMessage::telemetry(
                    TOPIC_INVERTER_TEMPERATURE,
                    format_value(*temperature),
                ));
            }
            InboundMessage::InverterSoc(soc) => {
                self.stats.inverter_frames_decoded = self.stats.inverter_frames_decoded.saturating_add(1);
                queue.enqueue(QueuedTelemetryMessage::telemetry(TOPIC_INVERTER_SOC, format_value(*soc)));
            }
            InboundMessage::InverterTimestamp(timestamp) => {
                self.stats.inverter_frames_decoded = self.stats.inverter_frames_decoded.saturating_add(1);
                queue.enqueue(QueuedTelemetryMessage::telemetry(
                    TOPIC_INVERTER_TIMESTAMP,
                    timestamp.to_string(),
                ));
            }
        }

        Some(message)
    }

    /// Transmit the seven identification frames in order. Each frame gets a
    /// bounded number of attempts; a frame that never goes out is skipped and
    /// the sequence carries on.
    pub fn send_init_sequence<B: CanBus + ?Sized>(&mut self, bus: &mut B, queue: &mut TelemetryQueue) -> InitReport {
        let mut report = InitReport::default();

        for frame in &self.init_frames {
            let mut delivered = false;
            for attempt in 1..=self.max_attempts {
                report.attempts += 1;
                if send_logged(bus, frame, queue) {
                    delivered = true;
                    break;
                }
                if attempt < self.max_attempts && !self.retry_delay.is_zero() {
                    bus.retry_pause(self.retry_delay);
                }
            }

            if delivered {
                report.frames_sent += 1;
            } else {
                report.frames_abandoned += 1;
                warn!(frame = %frame.hex(), attempts = self.max_attempts, "init frame abandoned");
            }
        }

        self.stats.init_frames_abandoned =
            self.stats.init_frames_abandoned.saturating_add(u32::from(report.frames_abandoned));
        report
    }

    pub fn host_name(&self) -> Option<&str> {
        self.host_name.as_ref().map(HostName::as_str)
    }

    pub fn get_stats(&self) -> &HandshakeStats {
        &self.stats
    }
}
