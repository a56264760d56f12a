//! Fault probability configuration

use super::faults;
use std::collections::HashMap;

/// Per-fault probabilities plus a global on/off switch
#[derive(Debug, Clone)]
pub struct FaultConfig {
    pub enabled: bool,
    probabilities: HashMap<&'static str, f64>,
}

impl Default for FaultConfig {
    /// Enabled, with no configured per-fault probabilities. Explicit
    /// probabilities passed to `buggify!` still apply.
    fn default() -> Self {
        FaultConfig::new()
    }
}

impl FaultConfig {
    pub fn new() -> Self {
        FaultConfig {
            enabled: true,
            probabilities: HashMap::new(),
        }
    }

    /// All faults off, including explicit-probability checks
    pub fn disabled() -> Self {
        FaultConfig {
            enabled: false,
            probabilities: HashMap::new(),
        }
    }

    pub fn with(mut self, fault_id: &'static str, probability: f64) -> Self {
        debug_assert!(
            faults::ALL_FAULTS.contains(&fault_id),
            "Precondition: unknown fault id {}",
            fault_id
        );
        self.probabilities
            .insert(fault_id, probability.clamp(0.0, 1.0));
        self
    }

    /// Configured probability, 0.0 when disabled or unset
    pub fn get(&self, fault_id: &str) -> f64 {
        if !self.enabled {
            return 0.0;
        }
        self.probabilities.get(fault_id).copied().unwrap_or(0.0)
    }
}
