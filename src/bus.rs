//! Boundaries to the external collaborators: the CAN transceiver and the
//! message broker. The emulator core only ever talks to these traits.

use crate::protocol::CanFrame;
use crate::telemetry::{QueuedTelemetryMessage, TelemetryQueue};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum BusError {
    #[error("get tx buffer timeout")]
    TxBufferTimeout,
    #[error("send message timeout")]
    SendTimeout,
    #[error("bus driver not running")]
    NotRunning,
    #[error("unknown bus error")]
    Other,
}

/// Frame-level CAN driver.
pub trait CanBus {
    /// Transmit one frame. The driver bounds its own wait.
    fn send(&mut self, frame: &CanFrame) -> Result<(), BusError>;

    /// Non-blocking poll for an inbound frame; `WouldBlock` when none is pending.
    fn receive(&mut self) -> nb::Result<CanFrame, BusError>;

    /// Returns and clears the receive-overflow flag.
    fn take_overflow(&mut self) -> bool;

    /// Back off between send retries. Blocking drivers sleep; buses that
    /// share a thread with other work override this with something cheaper.
    fn retry_pause(&mut self, delay: Duration) {
        std::thread::sleep(delay);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BrokerError {
    #[error("broker not connected")]
    Disconnected,
    #[error("publish to {topic} failed: {reason}")]
    Publish { topic: String, reason: String },
}

/// Message broker session, as seen from the emulator.
pub trait Broker {
    fn is_connected(&self) -> bool;

    fn publish(&mut self, topic: &str, payload: &str, retain: bool) -> Result<(), BrokerError>;

    fn subscribe(&mut self, topic: &str) -> Result<(), BrokerError>;
}

/// Send a frame, logging the outcome. Transport failures are reported once
/// on the log topic and otherwise swallowed; the caller decides on retries.
pub fn send_logged<B: CanBus + ?Sized>(
    bus: &mut B,
    frame: &CanFrame,
    queue: &mut TelemetryQueue,
) -> bool {
    match bus.send(frame) {
        Ok(()) => {
            debug!(frame = %frame.hex(), "send");
            true
        }
        Err(e) => {
            warn!(frame = %frame.hex(), error = %e, "error sending frame");
            queue.enqueue(QueuedTelemetryMessage::log(format!("Error sending - {e}!")));
            false
        }
    }
}
