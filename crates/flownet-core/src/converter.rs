//! The converter/process engine.
//!
//! Starts conversion processes on converter nodes, advances their progress
//! on every processing tick, and completes them by crediting recipe outputs
//! to the converter. Processes advance in queue (start) order.

use crate::efficiency::process_efficiency;
use crate::event::{Event, EventBus};
use crate::fixed::{Fixed64, Ticks, ticks_to_fixed};
use crate::graph::GraphStore;
use crate::history::RingBuffer;
use crate::id::*;
use crate::recipe::{ConversionRecipe, RecipeRegistry};
use crate::resource::ResourceState;
use crate::rng::SimRng;
use crate::tech::TechnologyGate;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Progress at or above `1 - COMPLETION_EPSILON` counts as complete.
pub const COMPLETION_EPSILON: Fixed64 = Fixed64::from_bits(1 << 12);

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Broad class of a conversion failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// The request names something that does not exist or cannot do the job.
    Validation,
    /// The converter is full or short on inputs.
    Capacity,
    /// A technology prerequisite is not met.
    Prerequisite,
    /// The converter exists but is not in a usable state.
    Consistency,
}

/// Reasons a conversion process cannot start.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConversionError {
    #[error("unknown converter {0}")]
    UnknownConverter(NodeId),
    #[error("node {0} is not a converter")]
    NotAConverter(NodeId),
    #[error("converter {0} is inactive")]
    ConverterInactive(NodeId),
    #[error("unknown recipe {0}")]
    UnknownRecipe(RecipeId),
    #[error("converter {converter} does not support recipe {recipe}")]
    UnsupportedRecipe { converter: NodeId, recipe: RecipeId },
    #[error("converter {converter} is at its limit of {limit} concurrent processes")]
    AtCapacity { converter: NodeId, limit: u32 },
    #[error("recipe {recipe} requires technology {technology}")]
    TechnologyLocked { recipe: RecipeId, technology: TechId },
    #[error("converter {converter} has {available} {resource}, recipe needs {required}")]
    InsufficientInputs {
        converter: NodeId,
        resource: ResourceType,
        required: Fixed64,
        available: Fixed64,
    },
}

impl ConversionError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            ConversionError::UnknownConverter(_)
            | ConversionError::NotAConverter(_)
            | ConversionError::UnknownRecipe(_)
            | ConversionError::UnsupportedRecipe { .. } => ErrorCategory::Validation,
            ConversionError::AtCapacity { .. } | ConversionError::InsufficientInputs { .. } => {
                ErrorCategory::Capacity
            }
            ConversionError::TechnologyLocked { .. } => ErrorCategory::Prerequisite,
            ConversionError::ConverterInactive(_) => ErrorCategory::Consistency,
        }
    }

    /// Whether retrying later can never succeed.
    pub fn is_permanent(&self) -> bool {
        self.category() == ErrorCategory::Validation
    }
}

// ---------------------------------------------------------------------------
// Process data
// ---------------------------------------------------------------------------

/// Lifecycle of a conversion process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProcessState {
    Running,
    Paused,
    Completed,
    Cancelled,
}

/// One running instance of a recipe on a converter.
#[derive(Debug, Clone, PartialEq)]
pub struct ConversionProcess {
    pub id: ProcessId,
    pub converter: NodeId,
    /// The recipe as it was when the process started.
    pub recipe: Arc<ConversionRecipe>,
    pub progress: Fixed64,
    /// Frozen at start.
    pub efficiency: Fixed64,
    pub state: ProcessState,
    pub started_at: Ticks,
    pub ended_at: Option<Ticks>,
}

impl ConversionProcess {
    pub fn recipe_id(&self) -> &RecipeId {
        &self.recipe.id
    }

    pub fn is_paused(&self) -> bool {
        self.state == ProcessState::Paused
    }

    /// Running or paused.
    pub fn is_live(&self) -> bool {
        matches!(self.state, ProcessState::Running | ProcessState::Paused)
    }
}

/// What happened to a process, for whoever sequences work on top of it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessNotice {
    Completed { process: ProcessId, converter: NodeId },
    Cancelled { process: ProcessId, converter: NodeId },
}

/// Borrowed engine state a process operation needs.
pub struct ProcessContext<'a> {
    pub graph: &'a mut GraphStore,
    pub recipes: &'a RecipeRegistry,
    pub tech: &'a dyn TechnologyGate,
    pub events: &'a mut EventBus,
    pub now: Ticks,
}

/// Tunables copied from the engine configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessSettings {
    pub quality_variance: Fixed64,
    /// Capacity given to an output type a converter did not hold yet.
    pub default_capacity: Fixed64,
}

impl Default for ProcessSettings {
    fn default() -> Self {
        Self {
            quality_variance: Fixed64::lit("0.1"),
            default_capacity: Fixed64::lit("10000"),
        }
    }
}

// ---------------------------------------------------------------------------
// ProcessEngine
// ---------------------------------------------------------------------------

/// Owns the processing queue and the completed-process history.
#[derive(Debug)]
pub struct ProcessEngine {
    processes: Vec<ConversionProcess>,
    completed: RingBuffer<ConversionProcess>,
    notices: Vec<ProcessNotice>,
    next_id: u64,
    rng: SimRng,
    settings: ProcessSettings,
}

impl ProcessEngine {
    pub fn new(history_capacity: usize, seed: u64, settings: ProcessSettings) -> Self {
        Self {
            processes: Vec::new(),
            completed: RingBuffer::new(history_capacity),
            notices: Vec::new(),
            next_id: 0,
            rng: SimRng::new(seed),
            settings,
        }
    }

    pub fn settings(&self) -> ProcessSettings {
        self.settings
    }

    pub fn set_settings(&mut self, settings: ProcessSettings) {
        self.settings = settings;
    }

    pub fn set_history_capacity(&mut self, capacity: usize) {
        self.completed.resize(capacity);
    }

    /// Start `recipe` on `converter`.
    ///
    /// All checks run before anything is mutated; on success the recipe
    /// inputs are deducted together and a `ConversionStarted` event is
    /// emitted.
    pub fn start(
        &mut self,
        ctx: &mut ProcessContext<'_>,
        converter: &str,
        recipe: &str,
    ) -> Result<ProcessId, ConversionError> {
        let node = ctx
            .graph
            .get_node(converter)
            .ok_or_else(|| ConversionError::UnknownConverter(NodeId::from(converter)))?;
        if !node.is_converter() {
            return Err(ConversionError::NotAConverter(node.id.clone()));
        }
        if !node.active {
            return Err(ConversionError::ConverterInactive(node.id.clone()));
        }
        let recipe = ctx
            .recipes
            .get(recipe)
            .cloned()
            .ok_or_else(|| ConversionError::UnknownRecipe(RecipeId::from(recipe)))?;

        let config = node.converter.clone().unwrap_or_default();
        if !config.supports(&recipe.id) {
            return Err(ConversionError::UnsupportedRecipe {
                converter: node.id.clone(),
                recipe: recipe.id.clone(),
            });
        }
        if !config.has_free_slot() {
            return Err(ConversionError::AtCapacity {
                converter: node.id.clone(),
                limit: config.max_concurrent_processes,
            });
        }
        if let Some(tech) = &recipe.required_technology
            && !ctx.tech.is_unlocked(tech)
        {
            return Err(ConversionError::TechnologyLocked {
                recipe: recipe.id.clone(),
                technology: tech.clone(),
            });
        }

        let required = required_inputs(&recipe);
        for (resource, &amount) in &required {
            let available = node
                .resources
                .get(resource)
                .map(ResourceState::spare)
                .unwrap_or(Fixed64::ZERO);
            if available < amount {
                return Err(ConversionError::InsufficientInputs {
                    converter: node.id.clone(),
                    resource: resource.clone(),
                    required: amount,
                    available,
                });
            }
        }

        let efficiency =
            process_efficiency(node, &recipe, &mut self.rng, self.settings.quality_variance);
        let id = ProcessId(self.next_id);
        self.next_id += 1;

        let Some(node) = ctx.graph.node_mut(converter) else {
            return Err(ConversionError::UnknownConverter(NodeId::from(converter)));
        };
        for (resource, &amount) in &required {
            if let Some(state) = node.resources.get_mut(resource) {
                state.take(amount);
            }
        }
        if let Some(config) = node.converter.as_mut() {
            config.active_processes.push(id);
        }
        let converter_id = node.id.clone();
        ctx.graph.mark_resources_dirty(required.keys());

        debug!(%id, converter = %converter_id, recipe = %recipe.id, %efficiency, "conversion started");
        ctx.events.emit(Event::ConversionStarted {
            process: id,
            converter: converter_id.clone(),
            recipe: recipe.id.clone(),
            efficiency,
            tick: ctx.now,
        });
        self.processes.push(ConversionProcess {
            id,
            converter: converter_id,
            recipe,
            progress: Fixed64::ZERO,
            efficiency,
            state: ProcessState::Running,
            started_at: ctx.now,
            ended_at: None,
        });
        Ok(id)
    }

    /// Advance every running process by `dt` ticks and complete those that
    /// reach full progress. Returns the number completed.
    pub fn advance(&mut self, ctx: &mut ProcessContext<'_>, dt: Ticks) -> usize {
        let done_at = Fixed64::ONE - COMPLETION_EPSILON;
        let elapsed = ticks_to_fixed(dt);

        for process in self.processes.iter_mut().filter(|p| p.state == ProcessState::Running) {
            let fraction = elapsed.saturating_div(ticks_to_fixed(process.recipe.duration));
            process.progress = process
                .progress
                .saturating_add(fraction.saturating_mul(process.efficiency));
        }

        let (done, running): (Vec<_>, Vec<_>) = std::mem::take(&mut self.processes)
            .into_iter()
            .partition(|p| p.state == ProcessState::Running && p.progress >= done_at);
        self.processes = running;

        let completed = done.len();
        for process in done {
            self.complete(ctx, process);
        }
        completed
    }

    fn complete(&mut self, ctx: &mut ProcessContext<'_>, mut process: ConversionProcess) {
        process.progress = Fixed64::ONE;
        process.state = ProcessState::Completed;
        process.ended_at = Some(ctx.now);

        let outputs: Vec<(ResourceType, Fixed64)> = process
            .recipe
            .outputs
            .iter()
            .map(|e| (e.resource.clone(), e.amount.saturating_mul(process.efficiency)))
            .collect();

        match ctx.graph.node_mut(process.converter.as_str()) {
            Some(node) => {
                for (resource, amount) in &outputs {
                    let state = node
                        .resources
                        .entry(resource.clone())
                        .or_insert_with(|| ResourceState::with_capacity(self.settings.default_capacity));
                    let added = state.add(*amount);
                    if added < *amount {
                        debug!(process = %process.id, %resource, %amount, %added, "output capped at capacity");
                    }
                }
                if let Some(config) = node.converter.as_mut() {
                    config.active_processes.retain(|&p| p != process.id);
                }
                ctx.graph.mark_resources_dirty(outputs.iter().map(|(r, _)| r));
            }
            None => warn!(
                process = %process.id,
                converter = %process.converter,
                "converter vanished before completion; outputs dropped"
            ),
        }

        debug!(process = %process.id, converter = %process.converter, "conversion completed");
        ctx.events.emit(Event::ConversionCompleted {
            process: process.id,
            converter: process.converter.clone(),
            recipe: process.recipe.id.clone(),
            outputs,
            tick: ctx.now,
        });
        self.notices.push(ProcessNotice::Completed {
            process: process.id,
            converter: process.converter.clone(),
        });
        self.completed.push(process);
    }

    /// Pause a running process. Returns `false` if it is not running.
    pub fn pause(&mut self, id: ProcessId) -> bool {
        match self.processes.iter_mut().find(|p| p.id == id) {
            Some(p) if p.state == ProcessState::Running => {
                p.state = ProcessState::Paused;
                true
            }
            _ => false,
        }
    }

    /// Resume a paused process. Returns `false` if it is not paused.
    pub fn resume(&mut self, id: ProcessId) -> bool {
        match self.processes.iter_mut().find(|p| p.id == id) {
            Some(p) if p.state == ProcessState::Paused => {
                p.state = ProcessState::Running;
                true
            }
            _ => false,
        }
    }

    /// Cancel a live process. Consumed inputs are not refunded. Cancelling
    /// a finished or unknown process is a no-op returning `false`.
    pub fn cancel(&mut self, graph: &mut GraphStore, id: ProcessId, now: Ticks) -> bool {
        let Some(idx) = self.processes.iter().position(|p| p.id == id) else {
            return false;
        };
        let process = self.processes.remove(idx);
        if let Some(config) = graph
            .node_mut(process.converter.as_str())
            .and_then(|n| n.converter.as_mut())
        {
            config.active_processes.retain(|&p| p != id);
        }
        self.retire_cancelled(process, now);
        true
    }

    /// Cancel every live process of a converter that has left the graph.
    pub fn cancel_for_converter(&mut self, converter: &str, now: Ticks) -> usize {
        let (gone, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.processes)
            .into_iter()
            .partition(|p| p.converter.as_str() == converter);
        self.processes = kept;
        let count = gone.len();
        for process in gone {
            self.retire_cancelled(process, now);
        }
        count
    }

    fn retire_cancelled(&mut self, mut process: ConversionProcess, now: Ticks) {
        process.state = ProcessState::Cancelled;
        process.ended_at = Some(now);
        debug!(process = %process.id, converter = %process.converter, "conversion cancelled");
        self.notices.push(ProcessNotice::Cancelled {
            process: process.id,
            converter: process.converter.clone(),
        });
        self.completed.push(process);
    }

    /// Start processes on every active converter with free slots, taking the
    /// first startable candidate recipe each time until the converter is
    /// full or nothing can start. Returns the started process ids.
    pub fn fill_idle_converters(&mut self, ctx: &mut ProcessContext<'_>) -> Vec<ProcessId> {
        let candidates: Vec<(NodeId, Vec<RecipeId>)> = ctx
            .graph
            .converters()
            .filter(|n| n.converter.as_ref().is_none_or(|c| c.has_free_slot()))
            .map(|n| {
                let recipes = match n.converter.as_ref() {
                    Some(c) if !c.supported_recipes.is_empty() => c.supported_recipes.clone(),
                    _ => ctx.recipes.iter().map(|r| r.id.clone()).collect(),
                };
                (n.id.clone(), recipes)
            })
            .collect();

        let mut started = Vec::new();
        for (converter, recipes) in candidates {
            loop {
                let next = recipes
                    .iter()
                    .find_map(|recipe| self.start(ctx, converter.as_str(), recipe.as_str()).ok());
                match next {
                    Some(id) => started.push(id),
                    None => break,
                }
            }
        }
        started
    }

    /// Drain the completion/cancellation notices recorded since the last call.
    pub fn take_notices(&mut self) -> Vec<ProcessNotice> {
        std::mem::take(&mut self.notices)
    }

    pub fn get(&self, id: ProcessId) -> Option<&ConversionProcess> {
        self.processes
            .iter()
            .find(|p| p.id == id)
            .or_else(|| self.completed.iter().find(|p| p.id == id))
    }

    /// Running and paused processes, in queue order.
    pub fn active(&self) -> &[ConversionProcess] {
        &self.processes
    }

    /// Completed and cancelled processes, oldest first.
    pub fn history(&self) -> &RingBuffer<ConversionProcess> {
        &self.completed
    }
}

/// Recipe inputs summed per resource type.
fn required_inputs(recipe: &ConversionRecipe) -> BTreeMap<ResourceType, Fixed64> {
    let mut required = BTreeMap::new();
    for entry in &recipe.inputs {
        let total: &mut Fixed64 = required.entry(entry.resource.clone()).or_default();
        *total = total.saturating_add(entry.amount);
    }
    required
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventKind;
    use crate::graph::{ConverterConfig, FlowNode, NodeKind};
    use crate::tech::{AllUnlocked, UnlockedTechnologies};

    fn fixed(v: f64) -> Fixed64 {
        Fixed64::from_num(v)
    }

    fn neutral() -> ProcessSettings {
        ProcessSettings {
            quality_variance: Fixed64::ZERO,
            default_capacity: fixed(1000.0),
        }
    }

    struct Fixture {
        graph: GraphStore,
        recipes: RecipeRegistry,
        events: EventBus,
        engine: ProcessEngine,
    }

    impl Fixture {
        fn new(ore: f64, slots: u32) -> Self {
            let mut graph = GraphStore::new();
            graph
                .register_node(
                    FlowNode::new("forge", NodeKind::Converter)
                        .with_resource("ore", ResourceState::stocked(fixed(ore), fixed(100.0)))
                        // Utilization 0.7 keeps the stress factor neutral.
                        .with_resource(
                            "energy",
                            ResourceState::stocked(fixed(10.0), fixed(100.0))
                                .with_production(fixed(10.0))
                                .with_consumption(fixed(7.0)),
                        )
                        .with_converter(ConverterConfig::with_capacity(slots)),
                )
                .unwrap();
            let mut recipes = RecipeRegistry::new();
            recipes
                .register(
                    ConversionRecipe::new("smelt", 1000)
                        .input("ore", fixed(10.0))
                        .output("metal", fixed(5.0)),
                )
                .unwrap();
            Self {
                graph,
                recipes,
                events: EventBus::new(64),
                engine: ProcessEngine::new(16, 1, neutral()),
            }
        }

        fn run<R>(&mut self, now: Ticks, f: impl FnOnce(&mut ProcessEngine, &mut ProcessContext<'_>) -> R) -> R {
            let mut ctx = ProcessContext {
                graph: &mut self.graph,
                recipes: &self.recipes,
                tech: &AllUnlocked,
                events: &mut self.events,
                now,
            };
            f(&mut self.engine, &mut ctx)
        }

        fn stock(&self, resource: &str) -> Option<Fixed64> {
            self.graph
                .get_node("forge")
                .and_then(|n| n.resource(resource))
                .map(|s| s.current)
        }
    }

    #[test]
    fn start_deducts_inputs_and_tracks_process() {
        let mut fx = Fixture::new(50.0, 1);
        let id = fx.run(0, |e, ctx| e.start(ctx, "forge", "smelt")).unwrap();

        assert_eq!(fx.stock("ore"), Some(fixed(40.0)));
        let node = fx.graph.get_node("forge").unwrap();
        assert_eq!(node.converter.as_ref().unwrap().active_processes, vec![id]);
        assert_eq!(fx.engine.get(id).unwrap().efficiency, Fixed64::ONE);
        assert_eq!(fx.events.buffered_count(EventKind::ConversionStarted), 1);
    }

    #[test]
    fn insufficient_inputs_leave_pool_unchanged() {
        let mut fx = Fixture::new(5.0, 1);
        let err = fx.run(0, |e, ctx| e.start(ctx, "forge", "smelt")).unwrap_err();
        assert!(matches!(err, ConversionError::InsufficientInputs { .. }));
        assert_eq!(err.category(), ErrorCategory::Capacity);
        assert!(!err.is_permanent());
        assert_eq!(fx.stock("ore"), Some(fixed(5.0)));
        assert!(fx.engine.active().is_empty());
    }

    #[test]
    fn capacity_limit_is_enforced() {
        let mut fx = Fixture::new(50.0, 1);
        fx.run(0, |e, ctx| e.start(ctx, "forge", "smelt")).unwrap();
        let err = fx.run(0, |e, ctx| e.start(ctx, "forge", "smelt")).unwrap_err();
        assert_eq!(
            err,
            ConversionError::AtCapacity {
                converter: NodeId::from("forge"),
                limit: 1
            }
        );
        assert_eq!(fx.stock("ore"), Some(fixed(40.0)));
    }

    #[test]
    fn unknown_names_are_permanent() {
        let mut fx = Fixture::new(50.0, 1);
        let err = fx.run(0, |e, ctx| e.start(ctx, "ghost", "smelt")).unwrap_err();
        assert!(err.is_permanent());
        let err = fx.run(0, |e, ctx| e.start(ctx, "forge", "nope")).unwrap_err();
        assert_eq!(err, ConversionError::UnknownRecipe(RecipeId::from("nope")));
        assert!(err.is_permanent());
    }

    #[test]
    fn locked_technology_blocks_start() {
        let mut fx = Fixture::new(50.0, 1);
        fx.recipes
            .register(
                ConversionRecipe::new("alloy", 1000)
                    .input("ore", fixed(1.0))
                    .output("alloy", fixed(1.0))
                    .requiring("metallurgy"),
            )
            .unwrap();
        let gate = UnlockedTechnologies::new();
        let mut ctx = ProcessContext {
            graph: &mut fx.graph,
            recipes: &fx.recipes,
            tech: &gate,
            events: &mut fx.events,
            now: 0,
        };
        let err = fx.engine.start(&mut ctx, "forge", "alloy").unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Prerequisite);
        assert_eq!(fx.stock("ore"), Some(fixed(50.0)));
    }

    #[test]
    fn process_completes_after_duration_and_credits_outputs() {
        let mut fx = Fixture::new(50.0, 1);
        let id = fx.run(0, |e, ctx| e.start(ctx, "forge", "smelt")).unwrap();

        assert_eq!(fx.run(500, |e, ctx| e.advance(ctx, 500)), 0);
        assert_eq!(fx.stock("metal"), None);
        assert_eq!(fx.run(1000, |e, ctx| e.advance(ctx, 500)), 1);

        assert_eq!(fx.stock("metal"), Some(fixed(5.0)));
        let done = fx.engine.get(id).unwrap();
        assert_eq!(done.state, ProcessState::Completed);
        assert_eq!(done.ended_at, Some(1000));
        assert!(fx.engine.active().is_empty());
        assert!(fx.graph.get_node("forge").unwrap().converter.as_ref().unwrap().active_processes.is_empty());
        assert_eq!(
            fx.engine.take_notices(),
            vec![ProcessNotice::Completed {
                process: id,
                converter: NodeId::from("forge")
            }]
        );
    }

    #[test]
    fn paused_processes_do_not_progress() {
        let mut fx = Fixture::new(50.0, 1);
        let id = fx.run(0, |e, ctx| e.start(ctx, "forge", "smelt")).unwrap();
        assert!(fx.engine.pause(id));
        assert!(!fx.engine.pause(id));
        fx.run(2000, |e, ctx| e.advance(ctx, 2000));
        assert_eq!(fx.engine.get(id).unwrap().progress, Fixed64::ZERO);

        assert!(fx.engine.resume(id));
        fx.run(3000, |e, ctx| e.advance(ctx, 1000));
        assert_eq!(fx.engine.get(id).unwrap().state, ProcessState::Completed);
    }

    #[test]
    fn cancel_is_idempotent_and_frees_slot() {
        let mut fx = Fixture::new(50.0, 1);
        let id = fx.run(0, |e, ctx| e.start(ctx, "forge", "smelt")).unwrap();
        assert!(fx.engine.cancel(&mut fx.graph, id, 10));
        assert!(!fx.engine.cancel(&mut fx.graph, id, 11));

        assert_eq!(fx.engine.get(id).unwrap().state, ProcessState::Cancelled);
        // No refund.
        assert_eq!(fx.stock("ore"), Some(fixed(40.0)));
        assert!(fx.run(20, |e, ctx| e.start(ctx, "forge", "smelt")).is_ok());
    }

    #[test]
    fn fill_starts_until_slots_or_inputs_run_out() {
        let mut fx = Fixture::new(25.0, 3);
        let started = fx.run(0, |e, ctx| e.fill_idle_converters(ctx));
        // 25 ore covers two runs of 10.
        assert_eq!(started.len(), 2);
        assert_eq!(fx.stock("ore"), Some(fixed(5.0)));
    }

    #[test]
    fn new_output_type_gets_default_capacity() {
        let mut fx = Fixture::new(50.0, 1);
        fx.run(0, |e, ctx| e.start(ctx, "forge", "smelt")).unwrap();
        fx.run(1000, |e, ctx| e.advance(ctx, 1000));
        let metal = *fx.graph.get_node("forge").unwrap().resource("metal").unwrap();
        assert_eq!(metal.max, fixed(1000.0));
    }
}
