//! Engine configuration.
//!
//! Plain serde data with defaults for every field, so partial documents
//! (RON, TOML, JSON) load cleanly. Amounts are `f64` here and converted to
//! fixed point when the engine applies the configuration.

use crate::balance::BalancePolicy;
use crate::converter::ProcessSettings;
use crate::fixed::{Fixed64, Ticks, f64_to_fixed64};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Reasons a configuration is rejected.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
    #[error("quality variance must be within [0, 1), got {0}")]
    QualityVariance(f64),
    #[error("default capacity must be positive and finite, got {0}")]
    DefaultCapacity(f64),
}

/// Tunables of a [`FlowEngine`](crate::engine::FlowEngine).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Ticks between optimization runs.
    pub optimization_interval: Ticks,
    /// Ticks between processing ticks.
    pub processing_interval: Ticks,
    pub cache_ttl: Ticks,
    /// Active node count above which balancing is offloaded.
    pub batch_size: usize,
    pub offload_enabled: bool,
    pub offload_timeout_ms: u64,
    pub transfer_history_capacity: usize,
    pub completed_process_capacity: usize,
    /// Per-kind event buffer capacity.
    pub event_buffer_capacity: usize,
    /// Maximum relative deviation of the per-input quality factor.
    pub quality_variance: f64,
    pub rng_seed: u64,
    /// Capacity of output resource types created on converters.
    pub default_capacity: f64,
    /// Duration of recipes synthesized by `set_conversion_rate`.
    pub default_conversion_duration: Ticks,
    /// Fill idle converter slots before each optimization.
    pub auto_fill_converters: bool,
    /// Fail chain executions whose current step stays queued longer.
    pub chain_step_timeout: Option<Ticks>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            optimization_interval: 5000,
            processing_interval: 1000,
            cache_ttl: 5000,
            batch_size: 100,
            offload_enabled: false,
            offload_timeout_ms: 250,
            transfer_history_capacity: 1000,
            completed_process_capacity: 100,
            event_buffer_capacity: 1024,
            quality_variance: 0.1,
            rng_seed: 0x5EED,
            default_capacity: 10_000.0,
            default_conversion_duration: 1000,
            auto_fill_converters: true,
            chain_step_timeout: None,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("optimization_interval", self.optimization_interval),
            ("processing_interval", self.processing_interval),
            ("offload_timeout_ms", self.offload_timeout_ms),
            ("default_conversion_duration", self.default_conversion_duration),
            ("transfer_history_capacity", self.transfer_history_capacity as u64),
            ("completed_process_capacity", self.completed_process_capacity as u64),
            ("event_buffer_capacity", self.event_buffer_capacity as u64),
        ];
        if let Some(&(name, _)) = positive.iter().find(|(_, v)| *v == 0) {
            return Err(ConfigError::Zero(name));
        }
        if !(0.0..1.0).contains(&self.quality_variance) {
            return Err(ConfigError::QualityVariance(self.quality_variance));
        }
        if !self.default_capacity.is_finite()
            || self.default_capacity <= 0.0
            || self.default_capacity > f64::from(i32::MAX)
        {
            return Err(ConfigError::DefaultCapacity(self.default_capacity));
        }
        Ok(())
    }

    pub fn offload_timeout(&self) -> Duration {
        Duration::from_millis(self.offload_timeout_ms)
    }

    pub fn balance_policy(&self) -> BalancePolicy {
        BalancePolicy {
            offload_enabled: self.offload_enabled,
            batch_size: self.batch_size,
        }
    }

    pub fn process_settings(&self) -> ProcessSettings {
        ProcessSettings {
            quality_variance: f64_to_fixed64(self.quality_variance),
            default_capacity: f64_to_fixed64(self.default_capacity),
        }
    }

    pub fn default_capacity_fixed(&self) -> Fixed64 {
        f64_to_fixed64(self.default_capacity)
    }
}
