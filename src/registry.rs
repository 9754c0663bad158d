//! Name-keyed access to the live battery state.
//!
//! The registry owns the [`BatteryState`] and a fixed table of bindings, one
//! per settable topic. Remote `set` overwrites a field with whatever float was
//! received; there is deliberately no range check here, so a negative capacity
//! or an absurd current limit is accepted as-is. `reset` restores the power-on
//! default captured at construction.

use crate::battery::{BatteryField, BatteryState, FIELD_COUNT};
use crate::config::BatteryConfig;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ValueBinding {
    pub field: BatteryField,
    pub default_value: f32,
}

impl ValueBinding {
    pub fn topic(&self) -> &'static str {
        self.field.topic()
    }
}

#[derive(Debug, Clone)]
pub struct ValueRegistry {
    state: BatteryState,
    bindings: [ValueBinding; FIELD_COUNT],
}

impl ValueRegistry {
    pub fn new(config: &BatteryConfig) -> Self {
        let bindings = BatteryField::ALL.map(|field| ValueBinding {
            field,
            default_value: BatteryState::default_for(config, field),
        });
        Self {
            state: BatteryState::new(config),
            bindings,
        }
    }

    fn binding(&self, name: &str) -> Option<&ValueBinding> {
        self.bindings.iter().find(|binding| binding.topic() == name)
    }

    pub fn get(&self, name: &str) -> Option<f32> {
        self.binding(name).map(|binding| self.state.get(binding.field))
    }

    /// Overwrite a live value. Unknown names are ignored; returns whether a
    /// binding matched.
    pub fn set(&mut self, name: &str, value: f32) -> bool {
        match self.binding(name).copied() {
            Some(binding) => {
                self.state.set(binding.field, value);
                true
            }
            None => false,
        }
    }

    /// Restore a live value to its power-on default.
    pub fn reset(&mut self, name: &str) -> bool {
        match self.binding(name).copied() {
            Some(binding) => {
                self.state.set(binding.field, binding.default_value);
                true
            }
            None => false,
        }
    }

    pub fn bindings(&self) -> &[ValueBinding] {
        &self.bindings
    }

    pub fn state(&self) -> &BatteryState {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut BatteryState {
        &mut self.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> ValueRegistry {
        ValueRegistry::new(&BatteryConfig::default())
    }

    #[test]
    fn test_one_binding_per_topic() {
        let registry = registry();
        assert_eq!(registry.bindings().len(), 13);
        for binding in registry.bindings() {
            let matches = registry
                .bindings()
                .iter()
                .filter(|other| other.topic() == binding.topic())
                .count();
            assert_eq!(matches, 1);
        }
    }

    #[test]
    fn test_set_then_reset() {
        let mut registry = registry();
        assert!(registry.set("battery/soc", 87.5));
        assert_eq!(registry.get("battery/soc"), Some(87.5));
        assert_eq!(registry.state().soc_percent, 87.5);

        assert!(registry.reset("battery/soc"));
        assert_eq!(registry.get("battery/soc"), Some(50.0));
    }

    #[test]
    fn test_set_accepts_out_of_range_values() {
        let mut registry = registry();
        assert!(registry.set("battery/full_capacity_ah", -10.0));
        assert_eq!(registry.state().full_capacity_ah, -10.0);
    }

    #[test]
    fn test_unknown_names_ignored() {
        let mut registry = registry();
        let before = registry.state().clone();
        assert!(!registry.set("battery/cell_voltage", 3.3));
        assert!(!registry.reset("limits"));
        assert_eq!(registry.get("nope"), None);
        assert_eq!(registry.state(), &before);
    }

    #[test]
    fn test_reset_limit_uses_pack_defaults() {
        let mut registry = registry();
        registry.set("limits/max_charge_current", 0.0);
        registry.reset("limits/max_charge_current");
        assert_eq!(registry.get("limits/max_charge_current"), Some(25.6));
    }
}
