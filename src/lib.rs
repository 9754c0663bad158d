//! # HVS Battery Bus Emulator
//!
//! Emulates a high-voltage battery pack on the CAN bus of a solar inverter.
//! The emulator answers the inverter's discovery handshake, transmits the
//! periodic limits/info/state/alarm frames from a live battery state, and
//! mirrors everything it sends onto an MQTT-style broker where remote
//! operators can override any value.
//!
//! ## Quick Start
//!
//! ```rust
//! use hvsbus::{EmulatorAgent, EmulatorConfig, MemoryBroker, SimulatedBus};
//!
//! let mut agent = EmulatorAgent::new(EmulatorConfig::default(), 0).unwrap();
//! agent.start(Ok(()), 0);
//!
//! let mut bus = SimulatedBus::new();
//! let mut broker = MemoryBroker::new();
//! agent.on_broker_connected(&mut broker).unwrap();
//!
//! // One loop iteration: frames in, due frames out, one message to the broker.
//! agent.poll(&mut bus, 0).unwrap();
//! agent.drain_telemetry(&mut broker);
//!
//! agent.handle_broker_message("hvsbus/battery/soc/set", "80", 10);
//! assert_eq!(agent.registry().get("battery/soc"), Some(80.0));
//! ```
//!
//! ## Architecture
//!
//! - [`agent`] - Orchestrator driven by the cooperative main loop
//! - [`protocol`] - HVS frame layouts and inbound decoding
//! - [`scheduler`] - Periodic frame timers
//! - [`handshake`] - Discovery/identification responder
//! - [`safety`] - Master heartbeat watchdog
//! - [`registry`] - Topic-addressable battery values
//! - [`telemetry`] - Bounded priority queue toward the broker
//! - [`bus`] - CAN and broker collaborator traits
//! - [`sim`] - In-memory bus, inverter and broker

#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_wrap)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::must_use_candidate)]

extern crate alloc;

pub mod agent;
pub mod battery;
pub mod bus;
pub mod codec;
pub mod config;
pub mod handshake;
pub mod protocol;
pub mod registry;
pub mod safety;
pub mod scheduler;
pub mod sim;
pub mod telemetry;

// Re-export main public types for convenience
pub use agent::{AgentError, BrokerAction, EmulatorAgent, RestartReason};
pub use battery::{BatteryField, BatteryState};
pub use bus::{Broker, BrokerError, BusError, CanBus};
pub use config::EmulatorConfig;
pub use protocol::{CanFrame, InboundMessage};
pub use sim::{MemoryBroker, SimulatedBus, SimulatedInverter};
pub use telemetry::{QueuedTelemetryMessage, TelemetryQueue};
