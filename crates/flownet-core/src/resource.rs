//! Per-node resource stock and flow rates.

use crate::fixed::Fixed64;
use serde::{Deserialize, Serialize};

/// Stock and flow rates of one resource type held by one node.
///
/// `capacity` is an alias of `max`. The invariant `min <= current <= max`
/// holds for every state stored in the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceState {
    pub current: Fixed64,
    pub min: Fixed64,
    pub max: Fixed64,
    /// Units produced per tick.
    pub production: Fixed64,
    /// Units consumed per tick.
    pub consumption: Fixed64,
}

impl Default for ResourceState {
    fn default() -> Self {
        Self {
            current: Fixed64::ZERO,
            min: Fixed64::ZERO,
            max: Fixed64::ZERO,
            production: Fixed64::ZERO,
            consumption: Fixed64::ZERO,
        }
    }
}

impl ResourceState {
    /// An empty state with the given capacity.
    pub fn with_capacity(max: Fixed64) -> Self {
        Self {
            max,
            ..Self::default()
        }
    }

    /// A stock of `current` units in a store of size `max`.
    pub fn stocked(current: Fixed64, max: Fixed64) -> Self {
        Self {
            current,
            max,
            ..Self::default()
        }
    }

    pub fn with_production(mut self, production: Fixed64) -> Self {
        self.production = production;
        self
    }

    pub fn with_consumption(mut self, consumption: Fixed64) -> Self {
        self.consumption = consumption;
        self
    }

    pub fn capacity(&self) -> Fixed64 {
        self.max
    }

    /// Whether `min <= current <= max` holds and rates are non-negative.
    pub fn is_valid(&self) -> bool {
        self.min <= self.current
            && self.current <= self.max
            && self.production >= Fixed64::ZERO
            && self.consumption >= Fixed64::ZERO
    }

    /// Units that can be removed without dropping below `min`.
    pub fn spare(&self) -> Fixed64 {
        (self.current - self.min).max(Fixed64::ZERO)
    }

    /// Units that can be added without exceeding `max`.
    pub fn headroom(&self) -> Fixed64 {
        (self.max - self.current).max(Fixed64::ZERO)
    }

    /// Add up to `amount`, capped at `max`. Returns the amount actually added.
    pub fn add(&mut self, amount: Fixed64) -> Fixed64 {
        let added = amount.max(Fixed64::ZERO).min(self.headroom());
        self.current += added;
        added
    }

    /// Remove exactly `amount`, or nothing when the stock above `min` is
    /// insufficient. Returns whether the removal happened.
    pub fn take(&mut self, amount: Fixed64) -> bool {
        if amount < Fixed64::ZERO || self.spare() < amount {
            return false;
        }
        self.current -= amount;
        true
    }

    /// Apply a signed delta, clamping the result into `[min, max]`.
    /// Returns the new current value.
    pub fn apply_delta(&mut self, delta: Fixed64) -> Fixed64 {
        self.current = self
            .current
            .saturating_add(delta)
            .clamp(self.min, self.max.max(self.min));
        self.current
    }

    /// Fold another node's state into an aggregate.
    pub(crate) fn accumulate(&mut self, other: &ResourceState) {
        self.current = self.current.saturating_add(other.current);
        self.min = self.min.saturating_add(other.min);
        self.max = self.max.saturating_add(other.max);
        self.production = self.production.saturating_add(other.production);
        self.consumption = self.consumption.saturating_add(other.consumption);
    }
}
