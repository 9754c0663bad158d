use crate::battery::{BatteryField, BatteryState};
use crate::bus::{send_logged, CanBus};
use crate::codec::format_value;
use crate::config::SchedulerConfig;
use crate::protocol::{
    alarm_frame, battery_info_frame, cell_info_frame, limits_frame, state_frame, CanFrame, Limits,
};
use crate::safety::SafetyMonitor;
use crate::telemetry::{QueuedTelemetryMessage, TelemetryQueue};
use serde::{Deserialize, Serialize};

/// First-firing offsets so categories don't all hit the bus on the same tick.
const STAGGER_OFFSETS_MS: [u64; 4] = [0, 333, 667, 1000];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FrameCategory {
    /// 0x110
    Limits,
    /// 0x210 then 0x1D0
    Info,
    /// 0x150
    State,
    /// 0x190
    Alarm,
}

impl FrameCategory {
    pub const ALL: [FrameCategory; 4] = [
        FrameCategory::Limits,
        FrameCategory::Info,
        FrameCategory::State,
        FrameCategory::Alarm,
    ];

    fn index(self) -> usize {
        match self {
            FrameCategory::Limits => 0,
            FrameCategory::Info => 1,
            FrameCategory::State => 2,
            FrameCategory::Alarm => 3,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct FrameTimer {
    interval_ms: u64,
    first_due_ms: u64,
    last_fire_ms: Option<u64>,
}

impl FrameTimer {
    fn is_due(&self, now_ms: u64) -> bool {
        match self.last_fire_ms {
            Some(last) => now_ms.saturating_sub(last) >= self.interval_ms,
            None => now_ms >= self.first_due_ms,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SchedulerStats {
    pub frames_sent: u32,
    pub send_failures: u32,
    pub degraded_limit_frames: u32,
    pub fired: [u32; 4],
}

/// Drives the periodic HVS frames from the live battery state.
#[derive(Debug)]
pub struct FrameScheduler {
    timers: [FrameTimer; 4],
    stats: SchedulerStats,
}

impl FrameScheduler {
    pub fn new(config: &SchedulerConfig, start_ms: u64) -> Self {
        let intervals = [
            config.limits_interval_ms,
            config.info_interval_ms,
            config.state_interval_ms,
            config.alarm_interval_ms,
        ];
        let timers = core::array::from_fn(|i| FrameTimer {
            interval_ms: intervals[i],
            first_due_ms: start_ms + STAGGER_OFFSETS_MS[i],
            last_fire_ms: None,
        });
        Self {
            timers,
            stats: SchedulerStats::default(),
        }
    }

    pub fn is_due(&self, category: FrameCategory, now_ms: u64) -> bool {
        self.timers[category.index()].is_due(now_ms)
    }

    /// Fire every category whose timer is due. Returns the categories fired.
    pub fn poll<B: CanBus + ?Sized>(
        &mut self,
        now_ms: u64,
        bus: &mut B,
        state: &mut BatteryState,
        safety: &mut SafetyMonitor,
        queue: &mut TelemetryQueue,
    ) -> heapless::Vec<FrameCategory, 4> {
        let mut fired = heapless::Vec::new();
        for category in FrameCategory::ALL {
            if self.is_due(category, now_ms) {
                self.fire(category, now_ms, bus, state, safety, queue);
                let _ = fired.push(category);
            }
        }
        fired
    }

    /// Send one category immediately and restart its timer.
    pub fn fire<B: CanBus + ?Sized>(
        &mut self,
        category: FrameCategory,
        now_ms: u64,
        bus: &mut B,
        state: &mut BatteryState,
        safety: &mut SafetyMonitor,
        queue: &mut TelemetryQueue,
    ) {
        self.timers[category.index()].last_fire_ms = Some(now_ms);
        let fired = &mut self.stats.fired[category.index()];
        *fired = fired.saturating_add(1);

        match category {
            FrameCategory::Limits => self.send_limits(now_ms, bus, state, safety, queue),
            FrameCategory::Info => {
                self.send_and_publish(
                    bus,
                    &cell_info_frame(state),
                    &[
                        (BatteryField::CellTempMax, state.cell_temp_max),
                        (BatteryField::CellTempMin, state.cell_temp_min),
                    ],
                    queue,
                );
                self.send_and_publish(
                    bus,
                    &battery_info_frame(state),
                    &[
                        (BatteryField::Voltage, state.voltage),
                        (BatteryField::Current, state.current),
                        (BatteryField::Temperature, state.temperature),
                    ],
                    queue,
                );
            }
            FrameCategory::State => {
                state.recompute_remaining_capacity();
                self.send_and_publish(
                    bus,
                    &state_frame(state),
                    &[
                        (BatteryField::SocPercent, state.soc_percent),
                        (BatteryField::SohPercent, state.soh_percent),
                        (BatteryField::RemainingCapacityAh, state.remaining_capacity_ah),
                        (BatteryField::FullCapacityAh, state.full_capacity_ah),
                    ],
                    queue,
                );
            }
            FrameCategory::Alarm => {
                self.send_and_publish(bus, &alarm_frame(), &[], queue);
            }
        }
    }

    fn send_limits<B: CanBus + ?Sized>(
        &mut self,
        now_ms: u64,
        bus: &mut B,
        state: &BatteryState,
        safety: &mut SafetyMonitor,
        queue: &mut TelemetryQueue,
    ) {
        let (limits, degraded) = safety.apply(Limits::from_state(state), now_ms);
        if degraded {
            self.stats.degraded_limit_frames = self.stats.degraded_limit_frames.saturating_add(1);
            queue.enqueue(QueuedTelemetryMessage::log("Master Heartbeat missed!"));
        }

        self.send_and_publish(
            bus,
            &limits_frame(&limits),
            &[
                (BatteryField::LimitVoltageMax, limits.voltage_max),
                (BatteryField::LimitVoltageMin, limits.voltage_min),
                (BatteryField::LimitDischargeCurrentMax, limits.discharge_current_max),
                (BatteryField::LimitChargeCurrentMax, limits.charge_current_max),
            ],
            queue,
        );
    }

    /// Telemetry for a frame is only published once the frame made it out.
    fn send_and_publish<B: CanBus + ?Sized>(
        &mut self,
        bus: &mut B,
        frame: &CanFrame,
        published: &[(BatteryField, f32)],
        queue: &mut TelemetryQueue,
    ) -> bool {
        if !send_logged(bus, frame, queue) {
            self.stats.send_failures = self.stats.send_failures.saturating_add(1);
            return false;
        }
        self.stats.frames_sent = self.stats.frames_sent.saturating_add(1);
        for &(field, value) in published {
            queue.enqueue(QueuedTelemetryMessage::telemetry(field.topic(), format_value(value)));
        }
        true
    }

    pub fn get_stats(&self) -> &SchedulerStats {
        &self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BatteryConfig, SafetyConfig};
    use crate::protocol::{ID_ALARM, ID_BATTERY_INFO, ID_CELL_INFO, ID_LIMITS, ID_STATE};
    use crate::sim::SimulatedBus;

    struct Fixture {
        scheduler: FrameScheduler,
        bus: SimulatedBus,
        state: BatteryState,
        safety: SafetyMonitor,
        queue: TelemetryQueue,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                scheduler: FrameScheduler::new(&SchedulerConfig::default(), 0),
                bus: SimulatedBus::new(),
                state: BatteryState::new(&BatteryConfig::default()),
                safety: SafetyMonitor::new(&SafetyConfig::default(), 0),
                queue: TelemetryQueue::new(64),
            }
        }

        fn poll(&mut self, now_ms: u64) -> heapless::Vec<FrameCategory, 4> {
            self.scheduler.poll(
                now_ms,
                &mut self.bus,
                &mut self.state,
                &mut self.safety,
                &mut self.queue,
            )
        }
    }

    #[test]
    fn test_first_firings_are_staggered() {
        let mut fx = Fixture::new();
        assert_eq!(fx.poll(0).as_slice(), &[FrameCategory::Limits]);
        assert!(fx.poll(332).is_empty());
        assert_eq!(fx.poll(333).as_slice(), &[FrameCategory::Info]);
        assert_eq!(fx.poll(667).as_slice(), &[FrameCategory::State]);
        assert_eq!(fx.poll(1000).as_slice(), &[FrameCategory::Alarm]);

        let ids: alloc::vec::Vec<u16> = fx.bus.sent().iter().map(|f| f.id).collect();
        assert_eq!(ids, [ID_LIMITS, ID_CELL_INFO, ID_BATTERY_INFO, ID_STATE, ID_ALARM]);
    }

    #[test]
    fn test_intervals_measured_from_last_fire() {
        let mut fx = Fixture::new();
        fx.poll(0);
        assert!(!fx.scheduler.is_due(FrameCategory::Limits, 1_999));
        assert!(fx.scheduler.is_due(FrameCategory::Limits, 2_000));

        fx.poll(2_500);
        assert!(!fx.scheduler.is_due(FrameCategory::Limits, 4_000));
        assert!(fx.scheduler.is_due(FrameCategory::Limits, 4_500));
    }

    #[test]
    fn test_success_publishes_fields_at_priority_zero() {
        let mut fx = Fixture::new();
        fx.scheduler.fire(
            FrameCategory::Info,
            0,
            &mut fx.bus,
            &mut fx.state,
            &mut fx.safety,
            &mut fx.queue,
        );
        assert_eq!(fx.queue.len(), 5);
        assert!(fx.queue.iter().all(|m| m.priority == 0 && !m.retain));
        assert!(fx.queue.iter().any(|m| m.topic == "battery/temp" && m.payload == "12.00"));
    }

    #[test]
    fn test_failed_send_publishes_nothing() {
        let mut fx = Fixture::new();
        fx.bus.fail_next_sends(1);
        fx.poll(0);
        assert_eq!(fx.scheduler.get_stats().send_failures, 1);
        assert!(fx.queue.iter().all(|m| m.topic == "log"));
        assert_eq!(fx.queue.len(), 1);
    }

    #[test]
    fn test_state_frame_recomputes_capacity() {
        let mut fx = Fixture::new();
        fx.state.soc_percent = 50.0;
        fx.state.full_capacity_ah = 160.0;
        fx.state.remaining_capacity_ah = 1.0;
        fx.scheduler.fire(
            FrameCategory::State,
            0,
            &mut fx.bus,
            &mut fx.state,
            &mut fx.safety,
            &mut fx.queue,
        );
        assert_eq!(fx.state.remaining_capacity_ah, 80.0);
        let frame = fx.bus.sent().last().unwrap();
        assert_eq!(&frame.data[4..6], &[0x03, 0x20]);
    }

    #[test]
    fn test_heartbeat_timeout_zeroes_transmitted_currents_only() {
        let mut fx = Fixture::new();
        fx.scheduler.fire(
            FrameCategory::Limits,
            60_000,
            &mut fx.bus,
            &mut fx.state,
            &mut fx.safety,
            &mut fx.queue,
        );
        let frame = fx.bus.sent().last().unwrap();
        assert_eq!(frame.id, ID_LIMITS);
        assert_eq!(&frame.data[4..], &[0, 0, 0, 0]);
        assert_eq!(fx.state.limit_charge_current_max, 25.6);
        assert_eq!(fx.state.limit_discharge_current_max, 25.6);
        assert_eq!(fx.scheduler.get_stats().degraded_limit_frames, 1);
        assert!(fx.queue.iter().any(|m| m.topic == "log" && m.priority == 10));
    }

    #[test]
    fn test_alarm_failure_not_retried() {
        let mut fx = Fixture::new();
        fx.bus.fail_next_sends(1);
        fx.scheduler.fire(
            FrameCategory::Alarm,
            0,
            &mut fx.bus,
            &mut fx.state,
            &mut fx.safety,
            &mut fx.queue,
        );
        assert_eq!(fx.bus.attempts(), 1);
        assert!(fx.bus.sent().is_empty());
    }

    #[test]
    fn test_stats_saturate() {
        let mut fx = Fixture::new();
        fx.scheduler.stats.frames_sent = u32::MAX;
        fx.scheduler.stats.fired = [u32::MAX; 4];
        fx.poll(0);
        assert_eq!(fx.scheduler.get_stats().frames_sent, u32::MAX);
        assert_eq!(fx.scheduler.get_stats().fired, [u32::MAX; 4]);

        fx.bus.fail_next_sends(1);
        fx.scheduler.stats.send_failures = u32::MAX;
        fx.scheduler.fire(
            FrameCategory::Alarm,
            1_000,
            &mut fx.bus,
            &mut fx.state,
            &mut fx.safety,
            &mut fx.queue,
        );
        assert_eq!(fx.bus.attempts(), 2);
        assert_eq!(fx.scheduler.get_stats().send_failures, u32::MAX);
    }
}
