//! The flow engine: composition root of the resource network.
//!
//! # Architecture
//!
//! `FlowEngine` owns:
//! - A [`GraphStore`] (nodes, connections, referential integrity)
//! - A [`ResourceStateCache`] of per-type aggregates
//! - A [`RecipeRegistry`], [`ProcessEngine`] and [`ChainOrchestrator`]
//! - A [`FlowOptimizer`] with its balancing strategies
//! - A [`TransferQueue`] of explicit transfers in transit and a bounded
//!   transfer history
//! - An [`EventBus`] and a [`CommandQueue`]
//!
//! # Scheduling
//!
//! Two loops run on independent fixed intervals: processing (advance
//! conversions, land due transfers, retry queued chain steps) and
//! optimization (fill idle converters, rebalance connection rates). Each
//! `advance(dt)` call:
//! 1. applies queued commands
//! 2. runs every processing tick and optimization that falls due within
//!    `dt`, in chronological order (processing first on a tie)
//! 3. delivers buffered events to listeners

use crate::cache::{CacheStats, ResourceStateCache};
use crate::chain::{ChainError, ChainExecution, ChainOrchestrator, ConversionChain};
use crate::command_queue::{Command, CommandQueue, CommandSender};
use crate::config::{ConfigError, EngineConfig};
use crate::converter::{ConversionError, ConversionProcess, ProcessContext, ProcessEngine};
use crate::event::{Event, EventBus, EventFilter, EventKind, Listener, ListenerPriority};
use crate::fixed::{Fixed64, Ticks, saturating_sum};
use crate::graph::{FlowConnection, FlowNode, GraphError, GraphStore, NodeKind, RemovedNode};
use crate::history::{RingBuffer, TransferHistory, TransferOrigin, TransferRecord};
use crate::id::*;
use crate::optimizer::{FlowOptimizer, OptimizationResult, OptimizeContext};
use crate::recipe::{ConversionRecipe, RecipeError, RecipeRegistry};
use crate::resource::ResourceState;
use crate::tech::{AllUnlocked, TechnologyGate};
use crate::transfer::{InFlightTransfer, TransferQueue};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Any error an engine operation can report.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Graph(#[from] GraphError),
    #[error(transparent)]
    Recipe(#[from] RecipeError),
    #[error(transparent)]
    Conversion(#[from] ConversionError),
    #[error(transparent)]
    Chain(#[from] ChainError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// What one `advance` call did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AdvanceResult {
    pub processing_ticks: u32,
    pub optimizations: u32,
    pub commands_applied: usize,
    pub commands_failed: usize,
    pub processes_completed: usize,
    pub transfers_delivered: usize,
    pub events_delivered: usize,
}

/// Borrow the pieces a process operation needs, leaving the process engine
/// and chain orchestrator free for a separate mutable borrow.
macro_rules! process_ctx {
    ($engine:ident) => {
        ProcessContext {
            graph: &mut $engine.graph,
            recipes: &$engine.recipes,
            tech: $engine.tech.as_ref(),
            events: &mut $engine.events,
            now: $engine.now,
        }
    };
}

// ---------------------------------------------------------------------------
// FlowEngine
// ---------------------------------------------------------------------------

pub struct FlowEngine {
    config: EngineConfig,
    now: Ticks,
    next_processing: Ticks,
    next_optimization: Ticks,

    graph: GraphStore,
    cache: ResourceStateCache,
    recipes: RecipeRegistry,
    processes: ProcessEngine,
    chains: ChainOrchestrator,
    optimizer: FlowOptimizer,
    transfers: TransferQueue,
    history: TransferHistory,
    events: EventBus,
    tech: Box<dyn TechnologyGate>,
    commands: CommandQueue,
}

impl std::fmt::Debug for FlowEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowEngine")
            .field("now", &self.now)
            .field("nodes", &self.graph.node_count())
            .field("connections", &self.graph.connection_count())
            .field("recipes", &self.recipes.len())
            .field("active_processes", &self.processes.active().len())
            .finish_non_exhaustive()
    }
}

impl Default for FlowEngine {
    fn default() -> Self {
        Self::build(EngineConfig::default())
    }
}

impl FlowEngine {
    /// Create an engine. The configuration is validated first.
    pub fn new(config: EngineConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self::build(config))
    }

    fn build(config: EngineConfig) -> Self {
        Self {
            now: 0,
            next_processing: config.processing_interval,
            next_optimization: config.optimization_interval,
            graph: GraphStore::new(),
            cache: ResourceStateCache::new(config.cache_ttl),
            recipes: RecipeRegistry::new(),
            processes: ProcessEngine::new(
                config.completed_process_capacity,
                config.rng_seed,
                config.process_settings(),
            ),
            chains: ChainOrchestrator::new(config.chain_step_timeout),
            optimizer: FlowOptimizer::new(config.balance_policy(), config.offload_timeout()),
            transfers: TransferQueue::new(),
            history: RingBuffer::new(config.transfer_history_capacity),
            events: EventBus::new(config.event_buffer_capacity),
            tech: Box::new(AllUnlocked),
            commands: CommandQueue::with_max_history(256),
            config,
        }
    }

    /// Replace the technology predicate used to gate recipes.
    pub fn set_technology_gate(&mut self, gate: impl TechnologyGate + 'static) {
        self.tech = Box::new(gate);
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Apply a new configuration. Invalid configurations are rejected with
    /// nothing changed. The RNG seed and event buffer capacity only take
    /// effect at construction.
    pub fn set_config(&mut self, config: EngineConfig) -> Result<(), ConfigError> {
        config.validate()?;
        if config.processing_interval != self.config.processing_interval {
            self.next_processing = self.now.saturating_add(config.processing_interval);
        }
        if config.optimization_interval != self.config.optimization_interval {
            self.next_optimization = self.now.saturating_add(config.optimization_interval);
        }
        self.cache.set_ttl(config.cache_ttl);
        self.optimizer
            .configure(config.balance_policy(), config.offload_timeout());
        self.processes.set_settings(config.process_settings());
        self.processes
            .set_history_capacity(config.completed_process_capacity);
        self.chains.set_step_timeout(config.chain_step_timeout);
        self.history.resize(config.transfer_history_capacity);
        self.config = config;
        Ok(())
    }

    /// Current simulated time.
    pub fn now(&self) -> Ticks {
        self.now
    }

    // -----------------------------------------------------------------------
    // Scheduling
    // -----------------------------------------------------------------------

    /// Move the clock forward by `dt` ticks, running everything that falls due.
    pub fn advance(&mut self, dt: Ticks) -> AdvanceResult {
        let mut result = AdvanceResult::default();

        for command in self.commands.drain(self.now) {
            match self.apply_command(command) {
                Ok(()) => result.commands_applied += 1,
                Err(err) => {
                    warn!(%err, "queued command failed");
                    result.commands_failed += 1;
                }
            }
        }

        let target = self.now.saturating_add(dt);
        loop {
            let due = self.next_processing.min(self.next_optimization);
            if due > target {
                break;
            }
            self.now = due;
            if self.next_processing <= self.next_optimization {
                let (completed, delivered) = self.run_processing(self.config.processing_interval);
                result.processing_ticks += 1;
                result.processes_completed += completed;
                result.transfers_delivered += delivered;
                self.next_processing = self.next_processing.saturating_add(self.config.processing_interval);
            } else {
                self.optimize_flows();
                result.optimizations += 1;
                self.next_optimization = self
                    .next_optimization
                    .saturating_add(self.config.optimization_interval);
            }
        }
        self.now = target;

        result.events_delivered = self.events.deliver();
        result
    }

    /// Run one processing tick of `dt` ticks at the current time: land due
    /// transfers, advance processes, route completions to chains and retry
    /// queued chain steps. Returns the number of completed processes.
    pub fn process_tick(&mut self, dt: Ticks) -> usize {
        self.run_processing(dt).0
    }

    fn run_processing(&mut self, dt: Ticks) -> (usize, usize) {
        let delivered = self.deliver_due_transfers();

        let completed = {
            let mut ctx = process_ctx!(self);
            self.processes.advance(&mut ctx, dt)
        };
        self.route_notices();
        {
            let mut ctx = process_ctx!(self);
            self.chains.retry_queued(&mut ctx, &mut self.processes);
        }
        self.route_notices();
        self.cache.sync_with(&mut self.graph);
        (completed, delivered)
    }

    /// Run one optimization now. While a run is in flight the previous
    /// result is returned instead.
    pub fn optimize_flows(&mut self) -> Arc<OptimizationResult> {
        if self.optimizer.is_in_flight() {
            return self.optimizer.last_result();
        }

        let started = {
            let mut ctx = process_ctx!(self);
            self.chains.retry_queued(&mut ctx, &mut self.processes);
            if self.config.auto_fill_converters {
                self.processes.fill_idle_converters(&mut ctx).len()
            } else {
                0
            }
        };
        self.route_notices();

        let mut ctx = OptimizeContext {
            graph: &mut self.graph,
            recipes: &self.recipes,
            history: &mut self.history,
            events: &mut self.events,
            now: self.now,
        };
        let result = self.optimizer.optimize(&mut ctx, started);
        self.cache.sync_with(&mut self.graph);
        result
    }

    /// Hand process completions and cancellations to the chain orchestrator.
    fn route_notices(&mut self) {
        loop {
            let notices = self.processes.take_notices();
            if notices.is_empty() {
                break;
            }
            let mut ctx = process_ctx!(self);
            for notice in &notices {
                self.chains
                    .handle_notice(&mut ctx, &mut self.processes, notice);
            }
        }
    }

    // -----------------------------------------------------------------------
    // Commands
    // -----------------------------------------------------------------------

    /// A handle other threads can use to submit commands.
    pub fn command_sender(&self) -> CommandSender {
        self.commands.sender()
    }

    /// Queue a command for the next `advance`.
    pub fn queue_command(&mut self, command: Command) {
        self.commands.push(command);
    }

    /// Applied commands, most recent last.
    pub fn command_history(&self) -> &[(Ticks, Command)] {
        self.commands.history()
    }

    fn apply_command(&mut self, command: Command) -> Result<(), EngineError> {
        match command {
            Command::RegisterNode(node) => self.register_node(node)?,
            Command::UnregisterNode(id) => {
                self.unregister_node(id.as_str())?;
            }
            Command::RegisterConnection(conn) => self.register_connection(conn)?,
            Command::UnregisterConnection(id) => {
                self.unregister_connection(id.as_str())?;
            }
            Command::CreateFlow {
                source,
                target,
                amounts,
            } => {
                self.create_flow(source.as_str(), target.as_str(), &amounts)?;
            }
            Command::UpdateResourceAmount { node, resource, delta } => {
                self.update_resource_amount(node.as_str(), &resource, delta)?;
            }
            Command::SetNodeActive { node, active } => self.set_node_active(node.as_str(), active)?,
            Command::SetConnectionActive { connection, active } => {
                self.set_connection_active(connection.as_str(), active)?
            }
            Command::RegisterRecipe(recipe) => self.register_recipe(recipe)?,
            Command::RegisterChain(chain) => self.register_chain(chain)?,
            Command::StartChain {
                chain,
                initial_converter,
            } => {
                self.start_chain(chain.as_str(), initial_converter.as_ref().map(NodeId::as_str))?;
            }
            Command::SetConversionRate { source, target, rate } => {
                self.set_conversion_rate(&source, &target, rate)?;
            }
            Command::StartProcess { converter, recipe } => {
                self.start_process(converter.as_str(), recipe.as_str())?;
            }
            Command::CancelProcess(id) => {
                self.cancel_process(id);
            }
            Command::CancelChain(id) => {
                self.cancel_chain(id)?;
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Graph
    // -----------------------------------------------------------------------

    pub fn register_node(&mut self, node: FlowNode) -> Result<(), GraphError> {
        let id = node.id.clone();
        let kind = node.kind;
        if let Err(err) = self.graph.register_node(node) {
            warn!(node = %id, %err, "node registration rejected");
            return Err(err);
        }
        debug!(node = %id, ?kind, "node registered");
        self.events.emit(Event::NodeRegistered {
            node: id,
            kind,
            tick: self.now,
        });
        Ok(())
    }

    /// Remove a node, every connection touching it, and (for converters)
    /// every process it was running.
    pub fn unregister_node(&mut self, id: &str) -> Result<RemovedNode, GraphError> {
        let removed = self.graph.unregister_node(id).inspect_err(|err| {
            warn!(node = id, %err, "node unregistration failed");
        })?;

        if removed.node.is_converter() {
            let cancelled = self.processes.cancel_for_converter(id, self.now);
            if cancelled > 0 {
                debug!(node = id, cancelled, "processes cancelled with their converter");
            }
            self.route_notices();
        }

        for conn in &removed.connections {
            self.events.emit(Event::ConnectionUnregistered {
                connection: conn.id.clone(),
                tick: self.now,
            });
        }
        debug!(node = id, connections = removed.connections.len(), "node unregistered");
        self.events.emit(Event::NodeUnregistered {
            node: removed.node.id.clone(),
            removed_connections: removed.connections.iter().map(|c| c.id.clone()).collect(),
            tick: self.now,
        });
        Ok(removed)
    }

    pub fn register_connection(&mut self, conn: FlowConnection) -> Result<(), GraphError> {
        let (id, source, target) = (conn.id.clone(), conn.source.clone(), conn.target.clone());
        if let Err(err) = self.graph.register_connection(conn) {
            warn!(connection = %id, %err, "connection registration rejected");
            return Err(err);
        }
        debug!(connection = %id, %source, %target, "connection registered");
        self.events.emit(Event::ConnectionRegistered {
            connection: id,
            source,
            target,
            tick: self.now,
        });
        Ok(())
    }

    pub fn unregister_connection(&mut self, id: &str) -> Result<FlowConnection, GraphError> {
        let conn = self.graph.unregister_connection(id).inspect_err(|err| {
            warn!(connection = id, %err, "connection unregistration failed");
        })?;
        self.events.emit(Event::ConnectionUnregistered {
            connection: conn.id.clone(),
            tick: self.now,
        });
        Ok(conn)
    }

    /// Connect `source` to `target` for the given per-type amounts, creating
    /// missing endpoints: a missing source becomes a producer stocked with
    /// the amounts, a missing target a consumer consuming them. The
    /// connection id is `"{source}->{target}"`, suffixed when taken, and its
    /// max rate is the sum of the amounts.
    pub fn create_flow(
        &mut self,
        source: &str,
        target: &str,
        amounts: &[(ResourceType, Fixed64)],
    ) -> Result<ConnectionId, GraphError> {
        if source.trim().is_empty() || target.trim().is_empty() {
            return Err(GraphError::MissingId("node"));
        }
        let id = self.free_connection_id(source, target);
        if amounts.is_empty() {
            return Err(GraphError::NoResourceTypes(id));
        }
        if amounts.iter().any(|(_, amount)| *amount <= Fixed64::ZERO) {
            return Err(GraphError::NonPositiveRate(id));
        }
        if let Some(existing) = self.graph.get_node(source)
            && let Some((missing, _)) = amounts.iter().find(|(r, _)| !existing.resources.contains_key(r))
        {
            return Err(GraphError::ResourceNotCarried {
                connection: id,
                source_node: existing.id.clone(),
                resource: missing.clone(),
            });
        }

        let capacity = self.config.default_capacity_fixed();
        let mut created = Vec::new();
        if !self.graph.contains_node(source) {
            let node = amounts.iter().fold(FlowNode::new(source, NodeKind::Producer), |node, (r, a)| {
                node.with_resource(r.clone(), ResourceState::stocked(*a, capacity.max(*a)))
            });
            self.register_node(node)?;
            created.push(source);
        }
        if !self.graph.contains_node(target) {
            let node = amounts.iter().fold(FlowNode::new(target, NodeKind::Consumer), |node, (r, a)| {
                node.with_resource(
                    r.clone(),
                    ResourceState::with_capacity(capacity.max(*a)).with_consumption(*a),
                )
            });
            if let Err(err) = self.register_node(node) {
                self.rollback_nodes(&created);
                return Err(err);
            }
            created.push(target);
        }

        let conn = FlowConnection::new(
            id.clone(),
            source,
            target,
            amounts.iter().map(|(r, _)| r.clone()),
            saturating_sum(amounts.iter().map(|(_, a)| *a)),
        );
        if let Err(err) = self.register_connection(conn) {
            self.rollback_nodes(&created);
            return Err(err);
        }
        Ok(id)
    }

    fn free_connection_id(&self, source: &str, target: &str) -> ConnectionId {
        let base = format!("{source}->{target}");
        let mut candidate = base.clone();
        let mut n = 2;
        while self.graph.contains_connection(&candidate) {
            candidate = format!("{base}#{n}");
            n += 1;
        }
        ConnectionId::new(candidate)
    }

    fn rollback_nodes(&mut self, created: &[&str]) {
        for id in created {
            if let Err(err) = self.unregister_node(id) {
                warn!(node = id, %err, "rollback of placeholder node failed");
            }
        }
    }

    pub fn set_node_active(&mut self, id: &str, active: bool) -> Result<(), GraphError> {
        self.graph.set_node_active(id, active)
    }

    pub fn set_connection_active(&mut self, id: &str, active: bool) -> Result<(), GraphError> {
        self.graph.set_connection_active(id, active)
    }

    // -----------------------------------------------------------------------
    // Resource operations
    // -----------------------------------------------------------------------

    /// Apply a signed delta, clamped into `[min, max]`. Returns the new amount.
    pub fn update_resource_amount(
        &mut self,
        node: &str,
        resource: &ResourceType,
        delta: Fixed64,
    ) -> Result<Fixed64, GraphError> {
        let (current, change) = self
            .graph
            .update_resource(node, resource, |state| {
                let before = state.current;
                let after = state.apply_delta(delta);
                (after, after - before)
            })
            .inspect_err(|err| warn!(node, %resource, %err, "resource update failed"))?;
        self.emit_resource_updated(node, resource, change, current);
        Ok(current)
    }

    /// Add up to `amount`, capped at the resource's max. Returns the amount
    /// actually added.
    pub fn add_resources(
        &mut self,
        node: &str,
        resource: &ResourceType,
        amount: Fixed64,
    ) -> Result<Fixed64, GraphError> {
        let (added, current) = self
            .graph
            .update_resource(node, resource, |state| (state.add(amount), state.current))?;
        self.emit_resource_updated(node, resource, added, current);
        Ok(added)
    }

    /// Remove exactly `amount`, or nothing if the stock above `min` is short.
    pub fn consume_resources(
        &mut self,
        node: &str,
        resource: &ResourceType,
        amount: Fixed64,
    ) -> Result<(), GraphError> {
        let outcome = self.graph.update_resource(node, resource, |state| {
            if state.take(amount) {
                Ok(state.current)
            } else {
                Err(state.spare())
            }
        })?;
        match outcome {
            Ok(current) => {
                self.emit_resource_updated(node, resource, -amount, current);
                Ok(())
            }
            Err(available) => Err(GraphError::InsufficientResources {
                node: NodeId::from(node),
                resource: resource.clone(),
                requested: amount,
                available,
            }),
        }
    }

    /// Take `amount` from the connection's source now and deliver it to the
    /// target after `ceil(distance / bandwidth)` ticks. Returns the arrival
    /// tick. Zero-latency transfers land immediately.
    pub fn transfer_resources(
        &mut self,
        connection: &str,
        resource: &ResourceType,
        amount: Fixed64,
    ) -> Result<Ticks, GraphError> {
        let conn = self
            .graph
            .get_connection(connection)
            .cloned()
            .ok_or_else(|| GraphError::ConnectionNotFound(ConnectionId::from(connection)))?;
        if !conn.carries(resource) {
            return Err(GraphError::ResourceNotCarried {
                connection: conn.id,
                source_node: conn.source,
                resource: resource.clone(),
            });
        }
        self.consume_resources(conn.source.as_str(), resource, amount)?;

        let arrives_at = self
            .transfers
            .dispatch(&conn, resource.clone(), amount, self.now)
            .arrives_at;
        if arrives_at <= self.now {
            self.deliver_due_transfers();
        }
        Ok(arrives_at)
    }

    fn deliver_due_transfers(&mut self) -> usize {
        let due = self.transfers.take_due(self.now);
        let count = due.len();
        for transfer in due {
            self.deliver(transfer);
        }
        count
    }

    fn deliver(&mut self, transfer: InFlightTransfer) {
        let capacity = self.config.default_capacity_fixed();
        let Some(node) = self.graph.get_node(transfer.target.as_str()) else {
            warn!(
                node = %transfer.target,
                resource = %transfer.resource,
                amount = %transfer.amount,
                "transfer target vanished in flight; amount lost"
            );
            return;
        };
        if !node.resources.contains_key(&transfer.resource)
            && let Err(err) = self.graph.insert_resource(
                transfer.target.as_str(),
                transfer.resource.clone(),
                ResourceState::with_capacity(capacity),
            )
        {
            warn!(node = %transfer.target, %err, "could not open resource on transfer target");
            return;
        }

        match self.add_resources(transfer.target.as_str(), &transfer.resource, transfer.amount) {
            Ok(added) if added < transfer.amount => {
                debug!(node = %transfer.target, amount = %transfer.amount, %added, "transfer capped at capacity")
            }
            Ok(_) => {}
            Err(err) => {
                warn!(node = %transfer.target, %err, "transfer delivery failed");
                return;
            }
        }

        let record = TransferRecord {
            resource: transfer.resource,
            source: transfer.source,
            target: transfer.target,
            amount: transfer.amount,
            timestamp: self.now,
            connection: Some(transfer.connection),
            origin: TransferOrigin::Delivered,
        };
        self.history.push(record.clone());
        self.events.emit(Event::ResourceTransferred { transfer: record });
    }

    fn emit_resource_updated(&mut self, node: &str, resource: &ResourceType, delta: Fixed64, current: Fixed64) {
        self.events.emit(Event::ResourceUpdated {
            node: NodeId::from(node),
            resource: resource.clone(),
            delta,
            current,
            tick: self.now,
        });
    }

    // -----------------------------------------------------------------------
    // Recipes, processes, chains
    // -----------------------------------------------------------------------

    pub fn register_recipe(&mut self, recipe: ConversionRecipe) -> Result<(), RecipeError> {
        let id = recipe.id.clone();
        match self.recipes.register(recipe) {
            Ok(_) => {
                debug!(recipe = %id, "recipe registered");
                Ok(())
            }
            Err(err) => {
                warn!(recipe = %id, %err, "recipe registration rejected");
                Err(err)
            }
        }
    }

    /// Register (or replace) the recipe turning one `source` into `rate`
    /// `target`. Returns the synthesized recipe id.
    pub fn set_conversion_rate(
        &mut self,
        source: &ResourceType,
        target: &ResourceType,
        rate: Fixed64,
    ) -> Result<RecipeId, RecipeError> {
        let recipe = self.recipes.set_conversion_rate(
            source,
            target,
            rate,
            self.config.default_conversion_duration,
        )?;
        Ok(recipe.id.clone())
    }

    /// Start a process explicitly. Failures are also published as
    /// `ConversionFailed`.
    pub fn start_process(&mut self, converter: &str, recipe: &str) -> Result<ProcessId, ConversionError> {
        let mut ctx = process_ctx!(self);
        let result = self.processes.start(&mut ctx, converter, recipe);
        if let Err(err) = &result {
            warn!(converter, recipe, %err, "conversion could not start");
            self.events.emit(Event::ConversionFailed {
                converter: NodeId::from(converter),
                recipe: RecipeId::from(recipe),
                reason: err.to_string(),
                tick: self.now,
            });
        }
        result
    }

    pub fn pause_process(&mut self, id: ProcessId) -> bool {
        self.processes.pause(id)
    }

    pub fn resume_process(&mut self, id: ProcessId) -> bool {
        self.processes.resume(id)
    }

    /// Cancel a process. Idempotent; a chain step it backed is requeued.
    pub fn cancel_process(&mut self, id: ProcessId) -> bool {
        let cancelled = self.processes.cancel(&mut self.graph, id, self.now);
        self.route_notices();
        cancelled
    }

    pub fn register_chain(&mut self, chain: ConversionChain) -> Result<(), ChainError> {
        self.chains.register_chain(chain)
    }

    pub fn start_chain(&mut self, chain: &str, initial_converter: Option<&str>) -> Result<ExecutionId, ChainError> {
        let mut ctx = process_ctx!(self);
        self.chains
            .start(&mut ctx, &mut self.processes, chain, initial_converter)
    }

    pub fn pause_chain(&mut self, id: ExecutionId) -> Result<bool, ChainError> {
        self.chains.pause(&mut self.processes, id)
    }

    pub fn resume_chain(&mut self, id: ExecutionId) -> Result<bool, ChainError> {
        self.chains.resume(&mut self.processes, id)
    }

    pub fn cancel_chain(&mut self, id: ExecutionId) -> Result<bool, ChainError> {
        let cancelled = {
            let mut ctx = process_ctx!(self);
            self.chains.cancel(&mut ctx, &mut self.processes, id)
        };
        self.route_notices();
        cancelled
    }

    // -----------------------------------------------------------------------
    // Events
    // -----------------------------------------------------------------------

    pub fn subscribe(&mut self, kind: EventKind, listener: Listener) {
        self.events.subscribe(kind, listener);
    }

    pub fn subscribe_filtered(
        &mut self,
        kind: EventKind,
        priority: ListenerPriority,
        filter: Option<EventFilter>,
        listener: Listener,
    ) {
        self.events.subscribe_filtered(kind, priority, filter, listener);
    }

    pub fn suppress_event(&mut self, kind: EventKind) {
        self.events.suppress(kind);
    }

    /// Deliver buffered events now instead of at the end of `advance`.
    pub fn deliver_events(&mut self) -> usize {
        self.events.deliver()
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.events
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub fn graph(&self) -> &GraphStore {
        &self.graph
    }

    pub fn get_node(&self, id: &str) -> Option<&FlowNode> {
        self.graph.get_node(id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &FlowNode> {
        self.graph.nodes()
    }

    pub fn get_connection(&self, id: &str) -> Option<&FlowConnection> {
        self.graph.get_connection(id)
    }

    pub fn connections(&self) -> impl Iterator<Item = &FlowConnection> {
        self.graph.connections()
    }

    pub fn node_connections(&self, id: &str) -> Vec<&FlowConnection> {
        self.graph.node_connections(id)
    }

    /// Network-wide aggregate for one type, read through the cache.
    pub fn resource_state(&mut self, resource: &ResourceType) -> Option<ResourceState> {
        self.cache.sync_with(&mut self.graph);
        self.cache.get_state(resource, self.now, &self.graph)
    }

    /// Available amount of every resource type held by an active node.
    pub fn all_resource_states(&mut self) -> BTreeMap<ResourceType, Fixed64> {
        self.cache.sync_with(&mut self.graph);
        let mut states = BTreeMap::new();
        for resource in self.graph.resource_types() {
            if let Some(state) = self.cache.get_state(&resource, self.now, &self.graph) {
                states.insert(resource, state.current);
            }
        }
        states
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn all_conversion_recipes(&self) -> Vec<Arc<ConversionRecipe>> {
        self.recipes.iter().cloned().collect()
    }

    pub fn recipe(&self, id: &str) -> Option<&Arc<ConversionRecipe>> {
        self.recipes.get(id)
    }

    pub fn chain(&self, id: &str) -> Option<&Arc<ConversionChain>> {
        self.chains.chain(id)
    }

    pub fn chain_executions(&self) -> impl Iterator<Item = &ChainExecution> {
        self.chains.executions()
    }

    pub fn chain_execution(&self, id: ExecutionId) -> Option<&ChainExecution> {
        self.chains.execution(id)
    }

    /// A live or recently finished process.
    pub fn process(&self, id: ProcessId) -> Option<&ConversionProcess> {
        self.processes.get(id)
    }

    pub fn active_processes(&self) -> &[ConversionProcess] {
        self.processes.active()
    }

    pub fn completed_processes(&self) -> &RingBuffer<ConversionProcess> {
        self.processes.history()
    }

    pub fn transfer_history(&self) -> &TransferHistory {
        &self.history
    }

    pub fn in_flight_transfers(&self) -> &[InFlightTransfer] {
        self.transfers.pending()
    }

    pub fn last_optimization(&self) -> Arc<OptimizationResult> {
        self.optimizer.last_result()
    }

    /// Times offloaded balancing failed and the local path stood in.
    pub fn offload_fallbacks(&self) -> u64 {
        self.optimizer.fallback_count()
    }
}
