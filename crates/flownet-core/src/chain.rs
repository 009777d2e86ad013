//! Multi-step conversion chains.
//!
//! A chain is an ordered list of recipes. Each execution runs the steps one
//! after another: a step may only start once the previous one completed.
//! A step waits in `Queued` until some converter can take it; only a
//! failure that waiting can never fix (unknown recipe, unusable initial
//! converter, step timeout) fails the execution.

use crate::converter::{ProcessContext, ProcessEngine, ProcessNotice};
use crate::event::Event;
use crate::fixed::{Fixed64, Ticks};
use crate::id::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, info};

/// Errors from chain registration and execution control.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChainError {
    #[error("chain id is missing")]
    MissingId,
    #[error("chain {0} has no steps")]
    EmptyChain(ChainId),
    #[error("chain {0} is already registered")]
    Duplicate(ChainId),
    #[error("unknown chain {0}")]
    UnknownChain(ChainId),
    #[error("unknown chain execution {0}")]
    UnknownExecution(ExecutionId),
    #[error("unknown initial converter {0}")]
    UnknownConverter(NodeId),
}

/// An immutable chain definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversionChain {
    pub id: ChainId,
    pub steps: Vec<RecipeId>,
}

impl ConversionChain {
    pub fn new(id: impl Into<ChainId>, steps: impl IntoIterator<Item = RecipeId>) -> Self {
        Self {
            id: id.into(),
            steps: steps.into_iter().collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StepState {
    Queued,
    InProgress,
    Completed,
    Failed,
}

/// Audit record of one step of one execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainStepStatus {
    pub recipe: RecipeId,
    pub converter: Option<NodeId>,
    pub process: Option<ProcessId>,
    pub state: StepState,
    pub started_at: Option<Ticks>,
    pub ended_at: Option<Ticks>,
    /// Failed start attempts while queued.
    pub attempts: u32,
    /// When the step became eligible to start.
    pub queued_since: Option<Ticks>,
}

impl ChainStepStatus {
    fn queued(recipe: RecipeId) -> Self {
        Self {
            recipe,
            converter: None,
            process: None,
            state: StepState::Queued,
            started_at: None,
            ended_at: None,
            attempts: 0,
            queued_since: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExecutionState {
    Active,
    Completed,
    Failed,
}

/// Status of one execution of a chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainExecution {
    pub id: ExecutionId,
    pub chain: ChainId,
    /// Index of the next step to start. Equals the step count once the
    /// last step has started.
    pub current_step: usize,
    pub steps: Vec<ChainStepStatus>,
    /// Completed steps over total steps.
    pub progress: Fixed64,
    pub state: ExecutionState,
    pub paused: bool,
    pub error: Option<String>,
    pub initial_converter: Option<NodeId>,
    pub started_at: Ticks,
    pub ended_at: Option<Ticks>,
}

impl ChainExecution {
    pub fn is_active(&self) -> bool {
        self.state == ExecutionState::Active
    }

    pub fn is_completed(&self) -> bool {
        self.state == ExecutionState::Completed
    }

    pub fn is_failed(&self) -> bool {
        self.state == ExecutionState::Failed
    }

    pub fn completed_steps(&self) -> usize {
        self.steps
            .iter()
            .filter(|s| s.state == StepState::Completed)
            .count()
    }

    /// The queued step that may start now, if any.
    fn startable_step(&self) -> Option<usize> {
        if !self.is_active() || self.paused {
            return None;
        }
        let idx = self.current_step;
        let step = self.steps.get(idx)?;
        let previous_done = idx == 0 || self.steps[idx - 1].state == StepState::Completed;
        (step.state == StepState::Queued && previous_done).then_some(idx)
    }

    fn fail(&mut self, ctx: &mut ProcessContext<'_>, reason: String) {
        self.state = ExecutionState::Failed;
        self.ended_at = Some(ctx.now);
        let current = self.current_step;
        for (idx, step) in self.steps.iter_mut().enumerate() {
            let interrupted = step.state == StepState::InProgress
                || (idx == current && step.state == StepState::Queued);
            if interrupted {
                step.state = StepState::Failed;
                step.ended_at = Some(ctx.now);
            }
        }
        info!(execution = %self.id, chain = %self.chain, %reason, "chain failed");
        ctx.events.emit(Event::ChainFailed {
            chain: self.chain.clone(),
            execution: self.id,
            reason: reason.clone(),
            tick: ctx.now,
        });
        self.error = Some(reason);
    }
}

/// Owns chain definitions and their executions.
#[derive(Debug, Default)]
pub struct ChainOrchestrator {
    chains: BTreeMap<ChainId, Arc<ConversionChain>>,
    executions: BTreeMap<ExecutionId, ChainExecution>,
    /// Process -> (execution, step index) for in-progress steps.
    by_process: HashMap<ProcessId, (ExecutionId, usize)>,
    next_execution: u64,
    step_timeout: Option<Ticks>,
}

impl ChainOrchestrator {
    pub fn new(step_timeout: Option<Ticks>) -> Self {
        Self {
            step_timeout,
            ..Self::default()
        }
    }

    pub fn set_step_timeout(&mut self, timeout: Option<Ticks>) {
        self.step_timeout = timeout;
    }

    pub fn register_chain(&mut self, chain: ConversionChain) -> Result<(), ChainError> {
        if chain.id.is_blank() {
            return Err(ChainError::MissingId);
        }
        if chain.steps.is_empty() {
            return Err(ChainError::EmptyChain(chain.id));
        }
        if self.chains.contains_key(&chain.id) {
            return Err(ChainError::Duplicate(chain.id));
        }
        self.chains.insert(chain.id.clone(), Arc::new(chain));
        Ok(())
    }

    /// Create an execution of `chain` and try to start its first step.
    pub fn start(
        &mut self,
        ctx: &mut ProcessContext<'_>,
        processes: &mut ProcessEngine,
        chain: &str,
        initial_converter: Option<&str>,
    ) -> Result<ExecutionId, ChainError> {
        let definition = self
            .chains
            .get(chain)
            .cloned()
            .ok_or_else(|| ChainError::UnknownChain(ChainId::from(chain)))?;
        if let Some(converter) = initial_converter
            && !ctx.graph.contains_node(converter)
        {
            return Err(ChainError::UnknownConverter(NodeId::from(converter)));
        }

        let id = ExecutionId(self.next_execution);
        self.next_execution += 1;
        let mut steps: Vec<ChainStepStatus> = definition
            .steps
            .iter()
            .cloned()
            .map(ChainStepStatus::queued)
            .collect();
        steps[0].queued_since = Some(ctx.now);

        self.executions.insert(
            id,
            ChainExecution {
                id,
                chain: definition.id.clone(),
                current_step: 0,
                steps,
                progress: Fixed64::ZERO,
                state: ExecutionState::Active,
                paused: false,
                error: None,
                initial_converter: initial_converter.map(NodeId::from),
                started_at: ctx.now,
                ended_at: None,
            },
        );
        debug!(execution = %id, chain = %definition.id, "chain started");
        self.attempt(ctx, processes, id);
        Ok(id)
    }

    /// Try to start the current step of an execution.
    fn attempt(&mut self, ctx: &mut ProcessContext<'_>, processes: &mut ProcessEngine, id: ExecutionId) {
        let Some(exec) = self.executions.get_mut(&id) else {
            return;
        };
        let Some(idx) = exec.startable_step() else {
            return;
        };
        let recipe = exec.steps[idx].recipe.clone();
        if !ctx.recipes.contains(recipe.as_str()) {
            exec.fail(ctx, format!("step {idx}: unknown recipe {recipe}"));
            return;
        }

        if idx == 0
            && let Some(initial) = &exec.initial_converter
            && !ctx.graph.contains_node(initial.as_str())
        {
            debug!(execution = %id, %initial, "initial converter gone; discovering converters");
            exec.initial_converter = None;
        }

        let candidates: Vec<NodeId> = match (&exec.initial_converter, idx) {
            (Some(initial), 0) => vec![initial.clone()],
            _ => ctx
                .graph
                .converters()
                .filter(|n| {
                    n.converter
                        .as_ref()
                        .is_some_and(|c| c.supports(&recipe) && c.has_free_slot())
                })
                .map(|n| n.id.clone())
                .collect(),
        };

        for converter in candidates {
            match processes.start(ctx, converter.as_str(), recipe.as_str()) {
                Ok(process) => {
                    let step = &mut exec.steps[idx];
                    step.state = StepState::InProgress;
                    step.converter = Some(converter);
                    step.process = Some(process);
                    step.started_at = Some(ctx.now);
                    exec.current_step = idx + 1;
                    self.by_process.insert(process, (id, idx));
                    return;
                }
                Err(err) if err.is_permanent() => {
                    ctx.events.emit(Event::ConversionFailed {
                        converter: converter.clone(),
                        recipe: recipe.clone(),
                        reason: err.to_string(),
                        tick: ctx.now,
                    });
                    exec.fail(ctx, format!("step {idx}: {err}"));
                    return;
                }
                Err(err) => {
                    debug!(execution = %id, step = idx, %converter, %err, "chain step still queued");
                }
            }
        }
        exec.steps[idx].attempts += 1;
    }

    /// Retry every queued step, failing those past the step timeout.
    pub fn retry_queued(&mut self, ctx: &mut ProcessContext<'_>, processes: &mut ProcessEngine) {
        let ready: Vec<ExecutionId> = self
            .executions
            .values()
            .filter(|e| e.startable_step().is_some())
            .map(|e| e.id)
            .collect();

        for id in ready {
            if let Some(timeout) = self.step_timeout
                && let Some(exec) = self.executions.get_mut(&id)
            {
                let waited = exec.steps[exec.current_step]
                    .queued_since
                    .map(|since| ctx.now.saturating_sub(since))
                    .unwrap_or(0);
                if waited > timeout {
                    let step = exec.current_step;
                    exec.fail(ctx, format!("step {step} queued for {waited} ticks"));
                    continue;
                }
            }
            self.attempt(ctx, processes, id);
        }
    }

    /// React to a process finishing or being cancelled.
    pub fn handle_notice(
        &mut self,
        ctx: &mut ProcessContext<'_>,
        processes: &mut ProcessEngine,
        notice: &ProcessNotice,
    ) {
        let process = match notice {
            ProcessNotice::Completed { process, .. } | ProcessNotice::Cancelled { process, .. } => *process,
        };
        let Some((id, idx)) = self.by_process.remove(&process) else {
            return;
        };
        let Some(exec) = self.executions.get_mut(&id) else {
            return;
        };
        if !exec.is_active() {
            return;
        }

        match notice {
            ProcessNotice::Completed { .. } => {
                let step = &mut exec.steps[idx];
                step.state = StepState::Completed;
                step.ended_at = Some(ctx.now);

                let total = exec.steps.len();
                let done = exec.completed_steps();
                exec.progress = Fixed64::from_num(done) / Fixed64::from_num(total);

                if done == total {
                    exec.state = ExecutionState::Completed;
                    exec.ended_at = Some(ctx.now);
                    info!(execution = %id, chain = %exec.chain, "chain completed");
                    ctx.events.emit(Event::ChainCompleted {
                        chain: exec.chain.clone(),
                        execution: id,
                        tick: ctx.now,
                    });
                    return;
                }
                if let Some(next) = exec.steps.get_mut(idx + 1) {
                    next.queued_since = Some(ctx.now);
                }
                self.attempt(ctx, processes, id);
            }
            ProcessNotice::Cancelled { converter, .. } => {
                debug!(execution = %id, step = idx, %converter, "chain step process cancelled; requeued");
                let step = &mut exec.steps[idx];
                step.state = StepState::Queued;
                step.process = None;
                step.converter = None;
                step.started_at = None;
                step.queued_since = Some(ctx.now);
                exec.current_step = idx;
            }
        }
    }

    /// Pause an active execution and every process it has in flight.
    /// Returns `false` if it was not running.
    pub fn pause(&mut self, processes: &mut ProcessEngine, id: ExecutionId) -> Result<bool, ChainError> {
        let exec = self
            .executions
            .get_mut(&id)
            .ok_or(ChainError::UnknownExecution(id))?;
        if !exec.is_active() || exec.paused {
            return Ok(false);
        }
        exec.paused = true;
        for process in in_flight(exec) {
            processes.pause(process);
        }
        Ok(true)
    }

    pub fn resume(&mut self, processes: &mut ProcessEngine, id: ExecutionId) -> Result<bool, ChainError> {
        let exec = self
            .executions
            .get_mut(&id)
            .ok_or(ChainError::UnknownExecution(id))?;
        if !exec.is_active() || !exec.paused {
            return Ok(false);
        }
        exec.paused = false;
        for process in in_flight(exec) {
            processes.resume(process);
        }
        Ok(true)
    }

    /// Cancel an execution: in-flight processes are cancelled and the
    /// execution fails with a cancellation reason. Cancelling a finished
    /// execution is a no-op returning `false`.
    pub fn cancel(
        &mut self,
        ctx: &mut ProcessContext<'_>,
        processes: &mut ProcessEngine,
        id: ExecutionId,
    ) -> Result<bool, ChainError> {
        let exec = self
            .executions
            .get_mut(&id)
            .ok_or(ChainError::UnknownExecution(id))?;
        if !exec.is_active() {
            return Ok(false);
        }
        let running = in_flight(exec);
        exec.fail(ctx, "cancelled".to_string());
        for process in running {
            self.by_process.remove(&process);
            processes.cancel(ctx.graph, process, ctx.now);
        }
        Ok(true)
    }

    pub fn chain(&self, id: &str) -> Option<&Arc<ConversionChain>> {
        self.chains.get(id)
    }

    /// Chain definitions sorted by id.
    pub fn chains(&self) -> impl Iterator<Item = &Arc<ConversionChain>> {
        self.chains.values()
    }

    pub fn execution(&self, id: ExecutionId) -> Option<&ChainExecution> {
        self.executions.get(&id)
    }

    /// Every execution, in start order.
    pub fn executions(&self) -> impl Iterator<Item = &ChainExecution> {
        self.executions.values()
    }
}

fn in_flight(exec: &ChainExecution) -> Vec<ProcessId> {
    exec.steps
        .iter()
        .filter(|s| s.state == StepState::InProgress)
        .filter_map(|s| s.process)
        .collect()
}
