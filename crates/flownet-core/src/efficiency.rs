//! Per-process efficiency.
//!
//! Efficiency is a product of multipliers folded in a fixed order, so the
//! same converter, recipe and seed always produce the same value. The result
//! is clamped to `[MIN_EFFICIENCY, MAX_EFFICIENCY]` and frozen on the process.

use crate::fixed::{Fixed64, saturating_sum};
use crate::graph::FlowNode;
use crate::recipe::ConversionRecipe;
use crate::rng::SimRng;

pub const MIN_EFFICIENCY: Fixed64 = Fixed64::lit("0.1");
pub const MAX_EFFICIENCY: Fixed64 = Fixed64::lit("5");

/// Bonus per technology tier.
pub const TIER_BONUS: Fixed64 = Fixed64::lit("0.05");

const STRESS_HIGH: Fixed64 = Fixed64::lit("0.9");
const STRESS_LOW: Fixed64 = Fixed64::lit("0.5");
const STRESS_PENALTY: Fixed64 = Fixed64::lit("0.9");
const STRESS_BONUS: Fixed64 = Fixed64::lit("1.1");
const STRESS_MIN: Fixed64 = Fixed64::lit("0.7");
const STRESS_MAX: Fixed64 = Fixed64::lit("1.3");
const MIN_PRODUCTION: Fixed64 = Fixed64::lit("0.001");

/// Network-stress multiplier derived from the converter's own resource
/// utilization (total consumption over total production).
pub fn stress_factor(node: &FlowNode) -> Fixed64 {
    let consumption = saturating_sum(node.resources.values().map(|s| s.consumption));
    let production = saturating_sum(node.resources.values().map(|s| s.production)).max(MIN_PRODUCTION);
    let utilization = consumption.saturating_div(production);

    let factor = if utilization > STRESS_HIGH {
        STRESS_PENALTY
    } else if utilization < STRESS_LOW {
        STRESS_BONUS
    } else {
        Fixed64::ONE
    };
    factor.clamp(STRESS_MIN, STRESS_MAX)
}

/// `1 + tier * TIER_BONUS`.
pub fn tier_bonus(tier: u32) -> Fixed64 {
    Fixed64::ONE.saturating_add(TIER_BONUS.saturating_mul_int(tier as i64))
}

/// Compute the efficiency of a new process of `recipe` on `converter`.
///
/// Draws one quality factor per recipe input from `rng`.
pub fn process_efficiency(
    converter: &FlowNode,
    recipe: &ConversionRecipe,
    rng: &mut SimRng,
    quality_variance: Fixed64,
) -> Fixed64 {
    let config = converter.converter.as_ref();
    let mut efficiency = converter.efficiency.unwrap_or(Fixed64::ONE);
    efficiency = efficiency.saturating_mul(recipe.base_efficiency);

    if let Some(modifiers) = config.map(|c| &c.modifiers) {
        if let Some(global) = modifiers.global {
            efficiency = efficiency.saturating_mul(global);
        }
        if let Some(&per_recipe) = modifiers.recipes.get(&recipe.id) {
            efficiency = efficiency.saturating_mul(per_recipe);
        }
        for input in &recipe.inputs {
            if let Some(&per_resource) = modifiers.resources.get(&input.resource) {
                efficiency = efficiency.saturating_mul(per_resource);
            }
        }
    }

    for _ in &recipe.inputs {
        efficiency = efficiency.saturating_mul(rng.quality_factor(quality_variance));
    }

    let tier = config.map(|c| c.tier).unwrap_or(0);
    efficiency = efficiency.saturating_mul(tier_bonus(tier));
    efficiency = efficiency.saturating_mul(stress_factor(converter));

    efficiency.clamp(MIN_EFFICIENCY, MAX_EFFICIENCY)
}
