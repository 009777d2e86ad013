//! Shared test helpers for integration tests and benchmarks.
//!
//! Gated behind `#[cfg(any(test, feature = "test-utils"))]` so these helpers
//! are available in unit tests, integration tests, and benchmarks (via the
//! `test-utils` feature).

use crate::config::EngineConfig;
use crate::engine::FlowEngine;
use crate::fixed::Fixed64;
use crate::graph::{ConverterConfig, FlowConnection, FlowNode, NodeKind};
use crate::id::*;
use crate::recipe::ConversionRecipe;
use crate::resource::ResourceState;

// ===========================================================================
// Fixed-point helper
// ===========================================================================

pub fn fixed(v: f64) -> Fixed64 {
    Fixed64::from_num(v)
}

/// `|a - b| <= 2^-20`.
pub fn approx(a: Fixed64, b: Fixed64) -> bool {
    (a - b).abs() <= Fixed64::from_bits(1 << 12)
}

// ===========================================================================
// Resource types
// ===========================================================================

pub fn energy() -> ResourceType {
    ResourceType::from("energy")
}
pub fn minerals() -> ResourceType {
    ResourceType::from("minerals")
}
pub fn ore() -> ResourceType {
    ResourceType::from("ore")
}
pub fn metal() -> ResourceType {
    ResourceType::from("metal")
}
pub fn alloy() -> ResourceType {
    ResourceType::from("alloy")
}
pub fn water() -> ResourceType {
    ResourceType::from("water")
}

// ===========================================================================
// Engine
// ===========================================================================

/// Default configuration with no quality variance, so conversions are exact.
pub fn deterministic_config() -> EngineConfig {
    EngineConfig {
        quality_variance: 0.0,
        ..EngineConfig::default()
    }
}

pub fn test_engine() -> FlowEngine {
    // deterministic_config() is always valid.
    FlowEngine::new(deterministic_config()).unwrap()
}

// ===========================================================================
// Node builders
// ===========================================================================

pub fn producer(id: &str, resource: ResourceType, stock: f64, capacity: f64, production: f64) -> FlowNode {
    FlowNode::new(id, NodeKind::Producer).with_resource(
        resource,
        ResourceState::stocked(fixed(stock), fixed(capacity)).with_production(fixed(production)),
    )
}

pub fn consumer(id: &str, resource: ResourceType, capacity: f64, consumption: f64) -> FlowNode {
    FlowNode::new(id, NodeKind::Consumer).with_resource(
        resource,
        ResourceState::with_capacity(fixed(capacity)).with_consumption(fixed(consumption)),
    )
}

pub fn storage(id: &str, resource: ResourceType, stock: f64, capacity: f64) -> FlowNode {
    FlowNode::new(id, NodeKind::Storage)
        .with_resource(resource, ResourceState::stocked(fixed(stock), fixed(capacity)))
}

/// A converter holding `stock` of each listed input, one process slot.
pub fn converter(id: &str, inputs: &[(ResourceType, f64)], capacity: f64) -> FlowNode {
    inputs.iter().fold(
        FlowNode::new(id, NodeKind::Converter).with_converter(ConverterConfig::default()),
        |node, (resource, stock)| {
            node.with_resource(resource.clone(), ResourceState::stocked(fixed(*stock), fixed(capacity)))
        },
    )
}

pub fn link(id: &str, source: &str, target: &str, resource: ResourceType, max_rate: f64) -> FlowConnection {
    FlowConnection::new(id, source, target, [resource], fixed(max_rate))
}

// ===========================================================================
// Recipes
// ===========================================================================

/// `inputs -> outputs` over `duration` ticks with base efficiency 1.
pub fn recipe(id: &str, duration: u64, inputs: &[(ResourceType, f64)], outputs: &[(ResourceType, f64)]) -> ConversionRecipe {
    let recipe = inputs
        .iter()
        .fold(ConversionRecipe::new(id, duration), |r, (res, amt)| r.input(res.clone(), fixed(*amt)));
    outputs
        .iter()
        .fold(recipe, |r, (res, amt)| r.output(res.clone(), fixed(*amt)))
}
