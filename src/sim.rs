//! In-memory collaborators for the simulator binary and tests: a virtual CAN
//! bus with failure injection, a simulated host controller that speaks on it,
//! and a broker that records what it was given.

use crate::bus::{Broker, BrokerError, BusError, CanBus};
use crate::codec::encode;
use crate::protocol::{
    CanFrame, ID_DISCOVERY, ID_INVERTER_BATTERY, ID_INVERTER_SOC, ID_INVERTER_TIME, MAX_PAYLOAD,
};
use alloc::collections::VecDeque;
use std::time::Duration;

#[derive(Debug, Default)]
pub struct SimulatedBus {
    sent: Vec<CanFrame>,
    inbound: VecDeque<CanFrame>,
    attempts: usize,
    fail_remaining: usize,
    failure: Option<BusError>,
    overflow: bool,
    paused: Duration,
}

impl SimulatedBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` sends fail with a send timeout.
    pub fn fail_next_sends(&mut self, count: usize) {
        self.fail_remaining = count;
    }

    /// Make every send fail with `error` until cleared with `None`.
    pub fn set_failure(&mut self, error: Option<BusError>) {
        self.failure = error;
    }

    pub fn inject(&mut self, frame: CanFrame) {
        self.inbound.push_back(frame);
    }

    pub fn set_overflow(&mut self) {
        self.overflow = true;
    }

    /// Frames that were transmitted successfully, in order.
    pub fn sent(&self) -> &[CanFrame] {
        &self.sent
    }

    /// Every send call, successful or not.
    pub fn attempts(&self) -> usize {
        self.attempts
    }

    /// Total retry back-off requested so far. Never actually slept.
    pub fn paused(&self) -> Duration {
        self.paused
    }

    pub fn pending_inbound(&self) -> usize {
        self.inbound.len()
    }

    pub fn clear_sent(&mut self) {
        self.sent.clear();
        self.attempts = 0;
    }
}

impl CanBus for SimulatedBus {
    fn send(&mut self, frame: &CanFrame) -> Result<(), BusError> {
        self.attempts += 1;
        if let Some(error) = self.failure {
            return Err(error);
        }
        if self.fail_remaining > 0 {
            self.fail_remaining -= 1;
            return Err(BusError::SendTimeout);
        }
        self.sent.push(frame.clone());
        Ok(())
    }

    fn receive(&mut self) -> nb::Result<CanFrame, BusError> {
        self.inbound.pop_front().ok_or(nb::Error::WouldBlock)
    }

    fn take_overflow(&mut self) -> bool {
        core::mem::take(&mut self.overflow)
    }

    fn retry_pause(&mut self, delay: Duration) {
        self.paused += delay;
    }
}

/// A host controller on the other end of the bus. Announces itself, asks for
/// identification until it has seen the init sequence, then reports its own
/// view of the battery periodically.
#[derive(Debug)]
pub struct SimulatedInverter {
    name: String,
    identified: bool,
    last_report_ms: Option<u64>,
    report_interval_ms: u64,
    battery_voltage: f32,
    battery_current: f32,
    temperature: f32,
    soc_percent: f32,
    unix_time: u32,
}

impl SimulatedInverter {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            identified: false,
            last_report_ms: None,
            report_interval_ms: 5_000,
            battery_voltage: 215.0,
            battery_current: 4.3,
            temperature: 22.0,
            soc_percent: 50.0,
            unix_time: 1_700_000_000,
        }
    }

    /// Feed the host's frames onto `bus` and look at what the battery sent.
    pub fn step(&mut self, now_ms: u64, bus: &mut SimulatedBus) {
        if !self.identified {
            let init_seen = bus
                .sent()
                .iter()
                .any(|frame| frame.id == crate::protocol::ID_INIT_MODEL);
            if init_seen {
                self.identified = true;
            } else if bus.pending_inbound() == 0 {
                bus.inject(self.name_frame());
                bus.inject(frame(ID_DISCOVERY, &[0x01, 0, 0, 0, 0, 0, 0, 0]));
            }
        }

        let due = self
            .last_report_ms
            .is_none_or(|last| now_ms.saturating_sub(last) >= self.report_interval_ms);
        if !due {
            return;
        }
        self.last_report_ms = Some(now_ms);
        self.unix_time = self.unix_time.wrapping_add((self.report_interval_ms / 1000) as u32);

        let mut data = [0u8; MAX_PAYLOAD];
        encode(&mut data, 0, (self.battery_voltage * 10.0) as u16);
        encode(&mut data, 2, (self.battery_current * 10.0) as u16);
        encode(&mut data, 4, (self.temperature * 10.0) as u16);
        bus.inject(frame(ID_INVERTER_BATTERY, &data[..6]));

        let mut soc = [0u8; 2];
        encode(&mut soc, 0, (self.soc_percent * 10.0) as u16);
        bus.inject(frame(ID_INVERTER_SOC, &soc));

        let mut time = [0u8; 4];
        encode(&mut time, 0, self.unix_time);
        bus.inject(frame(ID_INVERTER_TIME, &time));
    }

    pub fn is_identified(&self) -> bool {
        self.identified
    }

    fn name_frame(&self) -> CanFrame {
        let mut data = [0u8; MAX_PAYLOAD];
        let name = self.name.as_bytes();
        let len = name.len().min(MAX_PAYLOAD - 1);
        data[1..=len].copy_from_slice(&name[..len]);
        frame(ID_DISCOVERY, &data)
    }
}

fn frame(id: u16, payload: &[u8]) -> CanFrame {
    // Identifiers and lengths here are fixed and valid.
    CanFrame::new(id, payload).unwrap_or_else(|_| CanFrame {
        id,
        data: heapless::Vec::new(),
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub topic: String,
    pub payload: String,
    pub retain: bool,
}

/// Broker that keeps everything in memory.
#[derive(Debug)]
pub struct MemoryBroker {
    connected: bool,
    published: Vec<PublishedMessage>,
    subscriptions: Vec<String>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            connected: true,
            published: Vec::new(),
            subscriptions: Vec::new(),
        }
    }

    pub fn set_connected(&mut self, connected: bool) {
        self.connected = connected;
    }

    pub fn published(&self) -> &[PublishedMessage] {
        &self.published
    }

    pub fn take_published(&mut self) -> Vec<PublishedMessage> {
        core::mem::take(&mut self.published)
    }

    pub fn subscriptions(&self) -> &[String] {
        &self.subscriptions
    }

    pub fn find(&self, topic: &str) -> Option<&PublishedMessage> {
        self.published.iter().rev().find(|m| m.topic == topic)
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl Broker for MemoryBroker {
    fn is_connected(&self) -> bool {
        self.connected
    }

    fn publish(&mut self, topic: &str, payload: &str, retain: bool) -> Result<(), BrokerError> {
        if !self.connected {
            return Err(BrokerError::Disconnected);
        }
        self.published.push(PublishedMessage {
            topic: topic.into(),
            payload: payload.into(),
            retain,
        });
        Ok(())
    }

    fn subscribe(&mut self, topic: &str) -> Result<(), BrokerError> {
        if !self.connected {
            return Err(BrokerError::Disconnected);
        }
        self.subscriptions.push(topic.into());
        Ok(())
    }
}
