//! Flownet Core -- a resource flow network and conversion engine.
//!
//! Nodes hold typed resource stocks and are joined by directed, rate-limited
//! connections. Converter nodes run timed recipes that turn inputs into
//! outputs, chains sequence recipes across converters, and a periodic
//! optimizer rebalances connection rates toward demand.
//!
//! # Scheduling
//!
//! [`engine::FlowEngine::advance`] drives two fixed-interval loops:
//!
//! 1. **Commands** -- Apply operations submitted through the command queue.
//! 2. **Processing** -- Land due transfers, advance conversion processes,
//!    route completions to chains, retry queued chain steps.
//! 3. **Optimization** -- Fill idle converters, snapshot the graph, balance
//!    supply against need, write connection rates and transfer history.
//! 4. **Delivery** -- Hand buffered events to listeners.
//!
//! # Key Types
//!
//! - [`engine::FlowEngine`] -- Composition root and public API.
//! - [`graph::GraphStore`] -- Nodes and connections with referential integrity.
//! - [`cache::ResourceStateCache`] -- TTL cache of per-type aggregates.
//! - [`converter::ProcessEngine`] -- Conversion process lifecycle.
//! - [`chain::ChainOrchestrator`] -- Multi-step recipe chains.
//! - [`optimizer::FlowOptimizer`] -- Rate rebalancing, optionally offloaded
//!   to a worker thread through [`balance::OffloadedBalancer`].
//! - [`event::EventBus`] -- Typed, buffered, prioritized events.
//! - [`fixed::Fixed64`] -- Q32.32 fixed-point type for deterministic math.

pub mod balance;
pub mod cache;
pub mod chain;
pub mod command_queue;
pub mod config;
pub mod converter;
pub mod dirty;
pub mod efficiency;
pub mod engine;
pub mod event;
pub mod fixed;
pub mod graph;
pub mod history;
pub mod id;
pub mod optimizer;
pub mod recipe;
pub mod resource;
pub mod rng;
pub mod tech;
pub mod transfer;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
