use crate::config::SafetyConfig;
use crate::protocol::Limits;
use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HeartbeatStatus {
    Alive,
    /// Heartbeat missing long enough to zero the current limits.
    Degraded,
    /// Heartbeat missing long enough that the process should restart.
    Lost,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SafetyState {
    pub last_heartbeat_ms: u64,
    pub heartbeats_received: u32,
    pub degraded_transmissions: u32,
}

/// Watches the supervisory controller's heartbeat and degrades the limits
/// that go on the wire when it goes quiet.
///
/// The override only touches the outgoing [`Limits`]; the live battery state
/// is never modified, so the next heartbeat restores normal limits at once.
#[derive(Debug)]
pub struct SafetyMonitor {
    state: SafetyState,
    heartbeat_timeout_ms: u64,
    restart_timeout_ms: u64,
}

impl SafetyMonitor {
    /// `now_ms` counts as the first heartbeat so a fresh start is not degraded.
    pub fn new(config: &SafetyConfig, now_ms: u64) -> Self {
        Self {
            state: SafetyState {
                last_heartbeat_ms: now_ms,
                ..SafetyState::default()
            },
            heartbeat_timeout_ms: config.heartbeat_timeout_ms,
            restart_timeout_ms: config.restart_timeout_ms,
        }
    }

    pub fn record_heartbeat(&mut self, now_ms: u64) {
        self.state.last_heartbeat_ms = now_ms;
        self.state.heartbeats_received = self.state.heartbeats_received.saturating_add(1);
    }

    pub fn status(&self, now_ms: u64) -> HeartbeatStatus {
        let silence = now_ms.saturating_sub(self.state.last_heartbeat_ms);
        if silence >= self.restart_timeout_ms {
            HeartbeatStatus::Lost
        } else if silence >= self.heartbeat_timeout_ms {
            HeartbeatStatus::Degraded
        } else {
            HeartbeatStatus::Alive
        }
    }

    pub fn is_timed_out(&self, now_ms: u64) -> bool {
        self.status(now_ms) != HeartbeatStatus::Alive
    }

    /// Limits for one transmission. Returns the limits to encode and whether
    /// the override kicked in.
    pub fn apply(&mut self, limits: Limits, now_ms: u64) -> (Limits, bool) {
        if !self.is_timed_out(now_ms) {
            return (limits, false);
        }

        self.state.degraded_transmissions = self.state.degraded_transmissions.saturating_add(1);
        warn!(
            silence_ms = now_ms.saturating_sub(self.state.last_heartbeat_ms),
            "master heartbeat missed, zeroing current limits"
        );

        let degraded = Limits {
            discharge_current_max: 0.0,
            charge_current_max: 0.0,
            ..limits
        };
        (degraded, true)
    }

    pub fn get_state(&self) -> &SafetyState {
        &self.state
    }
}
