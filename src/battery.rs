use crate::config::BatteryConfig;
use serde::{Deserialize, Serialize};

/// Live state of the emulated pack, in engineering units.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatteryState {
    cell_count: u16,

    pub limit_voltage_max: f32,
    pub limit_voltage_min: f32,
    pub limit_discharge_current_max: f32,
    pub limit_charge_current_max: f32,

    pub voltage: f32,
    pub current: f32,
    pub temperature: f32,

    pub cell_temp_max: f32,
    pub cell_temp_min: f32,

    pub soc_percent: f32,
    pub soh_percent: f32,
    pub remaining_capacity_ah: f32,
    pub full_capacity_ah: f32,
}

/// One addressable field of [`BatteryState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BatteryField {
    LimitVoltageMax,
    LimitVoltageMin,
    LimitDischargeCurrentMax,
    LimitChargeCurrentMax,
    Voltage,
    Current,
    Temperature,
    CellTempMax,
    CellTempMin,
    SocPercent,
    SohPercent,
    RemainingCapacityAh,
    FullCapacityAh,
}

pub const FIELD_COUNT: usize = 13;

impl BatteryField {
    pub const ALL: [BatteryField; FIELD_COUNT] = [
        BatteryField::LimitVoltageMax,
        BatteryField::LimitVoltageMin,
        BatteryField::LimitDischargeCurrentMax,
        BatteryField::LimitChargeCurrentMax,
        BatteryField::Voltage,
        BatteryField::Current,
        BatteryField::Temperature,
        BatteryField::CellTempMax,
        BatteryField::CellTempMin,
        BatteryField::SocPercent,
        BatteryField::SohPercent,
        BatteryField::RemainingCapacityAh,
        BatteryField::FullCapacityAh,
    ];

    /// Telemetry topic, relative to the module prefix.
    pub fn topic(self) -> &'static str {
        match self {
            BatteryField::LimitVoltageMax => "limits/max_voltage",
            BatteryField::LimitVoltageMin => "limits/min_voltage",
            BatteryField::LimitDischargeCurrentMax => "limits/max_discharge_current",
            BatteryField::LimitChargeCurrentMax => "limits/max_charge_current",
            BatteryField::Voltage => "battery/voltage",
            BatteryField::Current => "battery/current",
            BatteryField::Temperature => "battery/temp",
            BatteryField::CellTempMax => "battery/max_cell_temp",
            BatteryField::CellTempMin => "battery/min_cell_temp",
            BatteryField::SocPercent => "battery/soc",
            BatteryField::SohPercent => "battery/soh",
            BatteryField::RemainingCapacityAh => "battery/remaining_capacity_ah",
            BatteryField::FullCapacityAh => "battery/full_capacity_ah",
        }
    }

    pub fn from_topic(topic: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|field| field.topic() == topic)
    }
}

impl BatteryState {
    /// Power-on state for the configured pack.
    pub fn new(config: &BatteryConfig) -> Self {
        let mut state = Self {
            cell_count: config.cell_count(),
            limit_voltage_max: 0.0,
            limit_voltage_min: 0.0,
            limit_discharge_current_max: 0.0,
            limit_charge_current_max: 0.0,
            voltage: 0.0,
            current: 0.0,
            temperature: 0.0,
            cell_temp_max: 0.0,
            cell_temp_min: 0.0,
            soc_percent: 0.0,
            soh_percent: 0.0,
            remaining_capacity_ah: 0.0,
            full_capacity_ah: 0.0,
        };
        for field in BatteryField::ALL {
            state.set(field, Self::default_for(config, field));
        }
        state
    }

    pub fn default_for(config: &BatteryConfig, field: BatteryField) -> f32 {
        let cells = f32::from(config.cell_count());
        match field {
            BatteryField::LimitVoltageMax => config.max_cell_voltage * cells,
            BatteryField::LimitVoltageMin => config.min_cell_voltage * cells,
            BatteryField::LimitDischargeCurrentMax | BatteryField::LimitChargeCurrentMax => {
                config.max_current
            }
            BatteryField::Voltage => config.default_cell_voltage * cells,
            BatteryField::Current => 0.0,
            BatteryField::Temperature => 12.0,
            BatteryField::CellTempMax => 13.0,
            BatteryField::CellTempMin => 11.0,
            BatteryField::SocPercent => 50.0,
            BatteryField::SohPercent => 100.0,
            BatteryField::RemainingCapacityAh => 80.0,
            BatteryField::FullCapacityAh => 160.0,
        }
    }

    pub fn cell_count(&self) -> u16 {
        self.cell_count
    }

    pub fn get(&self, field: BatteryField) -> f32 {
        match field {
            BatteryField::LimitVoltageMax => self.limit_voltage_max,
            BatteryField::LimitVoltageMin => self.limit_voltage_min,
            BatteryField::LimitDischargeCurrentMax => self.limit_discharge_current_max,
            BatteryField::LimitChargeCurrentMax => self.limit_charge_current_max,
            BatteryField::Voltage => self.voltage,
            BatteryField::Current => self.current,
            BatteryField::Temperature => self.temperature,
            BatteryField::CellTempMax => self.cell_temp_max,
            BatteryField::CellTempMin => self.cell_temp_min,
            BatteryField::SocPercent => self.soc_percent,
            BatteryField::SohPercent => self.soh_percent,
            BatteryField::RemainingCapacityAh => self.remaining_capacity_ah,
            BatteryField::FullCapacityAh => self.full_capacity_ah,
        }
    }

    pub fn set(&mut self, field: BatteryField, value: f32) {
        let slot = match field {
            BatteryField::LimitVoltageMax => &mut self.limit_voltage_max,
            BatteryField::LimitVoltageMin => &mut self.limit_voltage_min,
            BatteryField::LimitDischargeCurrentMax => &mut self.limit_discharge_current_max,
            BatteryField::LimitChargeCurrentMax => &mut self.limit_charge_current_max,
            BatteryField::Voltage => &mut self.voltage,
            BatteryField::Current => &mut self.current,
            BatteryField::Temperature => &mut self.temperature,
            BatteryField::CellTempMax => &mut self.cell_temp_max,
            BatteryField::CellTempMin => &mut self.cell_temp_min,
            BatteryField::SocPercent => &mut self.soc_percent,
            BatteryField::SohPercent => &mut self.soh_percent,
            BatteryField::RemainingCapacityAh => &mut self.remaining_capacity_ah,
            BatteryField::FullCapacityAh => &mut self.full_capacity_ah,
        };
        *slot = value;
    }

    /// Derive remaining capacity from state of charge. Runs every state-frame cycle.
    pub fn recompute_remaining_capacity(&mut self) {
        self.remaining_capacity_ah = self.soc_percent / 100.0 * self.full_capacity_ah;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_power_on_defaults() {
        let state = BatteryState::new(&BatteryConfig::default());
        assert_eq!(state.cell_count(), 64);
        assert!((state.limit_voltage_max - 230.4).abs() < 1e-3);
        assert!((state.limit_voltage_min - 179.2).abs() < 1e-3);
        assert!((state.voltage - 211.2).abs() < 1e-3);
        assert_eq!(state.limit_charge_current_max, 25.6);
        assert_eq!(state.soc_percent, 50.0);
        assert_eq!(state.full_capacity_ah, 160.0);
    }

    #[test]
    fn test_remaining_capacity_follows_soc() {
        let mut state = BatteryState::new(&BatteryConfig::default());
        state.soc_percent = 50.0;
        state.full_capacity_ah = 160.0;
        state.remaining_capacity_ah = 0.0;
        state.recompute_remaining_capacity();
        assert_eq!(state.remaining_capacity_ah, 80.0);
    }

    #[test]
    fn test_topics_are_unique_and_resolvable() {
        for field in BatteryField::ALL {
            assert_eq!(BatteryField::from_topic(field.topic()), Some(field));
        }
        assert_eq!(BatteryField::from_topic("battery/unknown"), None);
    }

    #[test]
    fn test_get_set_round_trip() {
        let mut state = BatteryState::new(&BatteryConfig::default());
        for (i, field) in BatteryField::ALL.into_iter().enumerate() {
            state.set(field, i as f32);
        }
        for (i, field) in BatteryField::ALL.into_iter().enumerate() {
            assert_eq!(state.get(field), i as f32);
        }
    }
}
