//! Flow balancing: the pure allocation routine and the strategies that run it.
//!
//! The optimizer captures a [`FlowSnapshot`] of the active network and hands
//! it to a [`Balancer`]. [`LocalBalancer`] runs [`balance_snapshot`] on the
//! calling thread; [`OffloadedBalancer`] ships the bitcode-encoded snapshot
//! to a dedicated worker thread and waits with a hard timeout.
//! [`FallbackBalancer`] wraps a primary strategy and re-runs the local path
//! whenever the primary fails, so offload problems never reach the caller.

use crate::fixed::{Fixed64, Ticks};
use crate::graph::{GraphStore, NodeKind};
use crate::id::*;
use crate::recipe::RecipeRegistry;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};

/// A type is a bottleneck when demand exceeds availability by this factor.
pub const BOTTLENECK_FACTOR: Fixed64 = Fixed64::lit("1.1");
/// A type is underutilized when availability exceeds demand by this factor.
pub const UNDERUTILIZED_FACTOR: Fixed64 = Fixed64::lit("1.5");

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Failures of a balancing strategy. Never surfaced past the fallback.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BalanceError {
    #[error("snapshot encoding failed: {0}")]
    Encode(String),
    #[error("outcome decoding failed: {0}")]
    Decode(String),
    #[error("offload worker is unavailable")]
    WorkerUnavailable,
    #[error("offload worker did not answer within {0:?}")]
    Timeout(Duration),
    #[error("offload worker stopped")]
    WorkerCrashed,
}

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

/// What one active node can give and needs, per resource type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSnapshot {
    pub id: NodeId,
    pub kind: NodeKind,
    pub supply: BTreeMap<ResourceType, Fixed64>,
    pub need: BTreeMap<ResourceType, Fixed64>,
}

/// An active connection between two active nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionSnapshot {
    pub id: ConnectionId,
    pub source: NodeId,
    pub target: NodeId,
    pub resource_types: Vec<ResourceType>,
    pub max_rate: Fixed64,
    pub priority: i32,
    /// Registration position, the priority tie-breaker.
    pub order: usize,
}

/// Everything the balancing routine reads. Self-contained so it can be
/// encoded and balanced on another thread.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowSnapshot {
    pub nodes: Vec<NodeSnapshot>,
    pub connections: Vec<ConnectionSnapshot>,
    pub timestamp: Ticks,
}

impl FlowSnapshot {
    /// Capture the active part of the graph.
    ///
    /// Supply: producers offer their spare stock plus one tick of
    /// production, storages their spare stock, converters the spare stock of
    /// types none of their recipes consume. Need: consumers and converters
    /// need their consumption rate; converters additionally need the largest
    /// input shortfall over the recipes they can run.
    pub fn capture(graph: &GraphStore, recipes: &RecipeRegistry, timestamp: Ticks) -> Self {
        let mut nodes = Vec::new();
        for node in graph.nodes().filter(|n| n.active) {
            let mut supply = BTreeMap::new();
            let mut need = BTreeMap::new();

            let runnable: Vec<_> = match node.converter.as_ref() {
                Some(config) if node.is_converter() => recipes
                    .iter()
                    .filter(|r| config.supports(&r.id))
                    .collect(),
                _ => Vec::new(),
            };

            for (resource, state) in &node.resources {
                let offered = match node.kind {
                    NodeKind::Producer => state.spare().saturating_add(state.production),
                    NodeKind::Storage => state.spare(),
                    NodeKind::Converter if !runnable.iter().any(|r| r.consumes(resource)) => state.spare(),
                    NodeKind::Converter | NodeKind::Consumer => Fixed64::ZERO,
                };
                if offered > Fixed64::ZERO {
                    supply.insert(resource.clone(), offered);
                }
                if matches!(node.kind, NodeKind::Consumer | NodeKind::Converter)
                    && state.consumption > Fixed64::ZERO
                {
                    need.insert(resource.clone(), state.consumption);
                }
            }

            let mut shortfall: BTreeMap<ResourceType, Fixed64> = BTreeMap::new();
            for recipe in &runnable {
                for input in &recipe.inputs {
                    let have = node
                        .resources
                        .get(&input.resource)
                        .map(|s| s.spare())
                        .unwrap_or(Fixed64::ZERO);
                    let missing = (input.amount - have).max(Fixed64::ZERO);
                    let entry = shortfall.entry(input.resource.clone()).or_default();
                    *entry = (*entry).max(missing);
                }
            }
            for (resource, missing) in shortfall {
                if missing > Fixed64::ZERO {
                    let entry = need.entry(resource).or_default();
                    *entry = entry.saturating_add(missing);
                }
            }

            nodes.push(NodeSnapshot {
                id: node.id.clone(),
                kind: node.kind,
                supply,
                need,
            });
        }

        let active: BTreeSet<&str> = nodes.iter().map(|n| n.id.as_str()).collect();
        let connections = graph
            .connections()
            .enumerate()
            .filter(|(_, c)| {
                c.active && active.contains(c.source.as_str()) && active.contains(c.target.as_str())
            })
            .map(|(order, c)| ConnectionSnapshot {
                id: c.id.clone(),
                source: c.source.clone(),
                target: c.target.clone(),
                resource_types: c.resource_types.clone(),
                max_rate: c.max_rate,
                priority: c.priority,
                order,
            })
            .collect();

        Self {
            nodes,
            connections,
            timestamp,
        }
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }
}

// ---------------------------------------------------------------------------
// Outcome
// ---------------------------------------------------------------------------

/// One positive per-type allocation on a connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedTransfer {
    pub connection: ConnectionId,
    pub resource: ResourceType,
    pub source: NodeId,
    pub target: NodeId,
    pub amount: Fixed64,
}

/// Result of balancing one snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceOutcome {
    /// New `current_rate` of every snapshot connection, in service order.
    pub rates: Vec<(ConnectionId, Fixed64)>,
    pub transfers: Vec<PlannedTransfer>,
    pub bottlenecks: Vec<ResourceType>,
    pub underutilized: Vec<ResourceType>,
    pub availability: BTreeMap<ResourceType, Fixed64>,
    pub demand: BTreeMap<ResourceType, Fixed64>,
}

/// Allocate connection rates for a snapshot.
///
/// Connections are serviced by descending priority, ties in registration
/// order. Each carried type draws from the shared pool of that type and
/// from the source's own supply; a connection's `max_rate` is shared by all
/// the types it carries. When supply covers the target's remaining need the
/// connection gets `min(max_rate, need)`, otherwise `max_rate * avail / need`
/// capped at what is available.
pub fn balance_snapshot(snapshot: &FlowSnapshot) -> BalanceOutcome {
    let mut availability: BTreeMap<ResourceType, Fixed64> = BTreeMap::new();
    let mut demand: BTreeMap<ResourceType, Fixed64> = BTreeMap::new();
    let mut supply_left: HashMap<(&str, &ResourceType), Fixed64> = HashMap::new();
    let mut need_left: HashMap<(&str, &ResourceType), Fixed64> = HashMap::new();

    for node in &snapshot.nodes {
        for (resource, &amount) in &node.supply {
            let total = availability.entry(resource.clone()).or_default();
            *total = total.saturating_add(amount);
            supply_left.insert((node.id.as_str(), resource), amount);
        }
        for (resource, &amount) in &node.need {
            let total = demand.entry(resource.clone()).or_default();
            *total = total.saturating_add(amount);
            need_left.insert((node.id.as_str(), resource), amount);
        }
    }

    let types: BTreeSet<&ResourceType> = availability.keys().chain(demand.keys()).collect();
    let mut bottlenecks = Vec::new();
    let mut underutilized = Vec::new();
    for resource in types {
        let avail = availability.get(resource).copied().unwrap_or(Fixed64::ZERO);
        let wanted = demand.get(resource).copied().unwrap_or(Fixed64::ZERO);
        if wanted > avail.saturating_mul(BOTTLENECK_FACTOR) {
            bottlenecks.push(resource.clone());
        } else if avail > wanted.saturating_mul(UNDERUTILIZED_FACTOR) {
            underutilized.push(resource.clone());
        }
    }

    let mut order: Vec<&ConnectionSnapshot> = snapshot.connections.iter().collect();
    order.sort_by_key(|c| (std::cmp::Reverse(c.priority), c.order));

    let mut pool = availability.clone();
    let mut rates = Vec::with_capacity(order.len());
    let mut transfers = Vec::new();

    for conn in order {
        let mut budget = conn.max_rate;
        let mut total_rate = Fixed64::ZERO;

        for resource in &conn.resource_types {
            let pooled = pool.get(resource).copied().unwrap_or(Fixed64::ZERO);
            let offered = supply_left
                .get(&(conn.source.as_str(), resource))
                .copied()
                .unwrap_or(Fixed64::ZERO);
            let avail = pooled.min(offered);
            let wanted = need_left
                .get(&(conn.target.as_str(), resource))
                .copied()
                .unwrap_or(Fixed64::ZERO);

            let rate = allocate(budget, avail, wanted);
            if rate <= Fixed64::ZERO {
                continue;
            }

            if let Some(p) = pool.get_mut(resource) {
                *p -= rate;
            }
            if let Some(s) = supply_left.get_mut(&(conn.source.as_str(), resource)) {
                *s -= rate;
            }
            if let Some(n) = need_left.get_mut(&(conn.target.as_str(), resource)) {
                *n -= rate;
            }
            budget -= rate;
            total_rate += rate;
            transfers.push(PlannedTransfer {
                connection: conn.id.clone(),
                resource: resource.clone(),
                source: conn.source.clone(),
                target: conn.target.clone(),
                amount: rate,
            });
        }
        rates.push((conn.id.clone(), total_rate));
    }

    BalanceOutcome {
        rates,
        transfers,
        bottlenecks,
        underutilized,
        availability,
        demand,
    }
}

/// Rate for one type on one connection.
fn allocate(budget: Fixed64, avail: Fixed64, wanted: Fixed64) -> Fixed64 {
    if budget <= Fixed64::ZERO || avail <= Fixed64::ZERO || wanted <= Fixed64::ZERO {
        return Fixed64::ZERO;
    }
    if avail >= wanted {
        return budget.min(wanted);
    }
    let rationed = budget
        .checked_mul(avail)
        .and_then(|scaled| scaled.checked_div(wanted))
        .unwrap_or_else(|| budget.saturating_mul(avail.saturating_div(wanted)));
    rationed.min(avail)
}

// ---------------------------------------------------------------------------
// Strategies
// ---------------------------------------------------------------------------

/// A way of turning a snapshot into an outcome.
pub trait Balancer: Send {
    fn name(&self) -> &'static str;
    fn balance(&mut self, snapshot: &FlowSnapshot) -> Result<BalanceOutcome, BalanceError>;
}

/// Balances on the calling thread. Never fails.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalBalancer;

impl Balancer for LocalBalancer {
    fn name(&self) -> &'static str {
        "local"
    }

    fn balance(&mut self, snapshot: &FlowSnapshot) -> Result<BalanceOutcome, BalanceError> {
        Ok(balance_snapshot(snapshot))
    }
}

type Job = (u64, Vec<u8>);
type JobResult = (u64, Result<Vec<u8>, BalanceError>);

/// Balances on a dedicated worker thread.
///
/// Snapshots and outcomes cross the thread boundary bitcode-encoded. Each
/// job carries a sequence number so a late answer to a timed-out job is
/// discarded instead of being taken for the current one.
#[derive(Debug)]
pub struct OffloadedBalancer {
    jobs: Option<mpsc::Sender<Job>>,
    results: mpsc::Receiver<JobResult>,
    worker: Option<thread::JoinHandle<()>>,
    timeout: Duration,
    next_job: u64,
}

impl OffloadedBalancer {
    /// Spawn the worker thread.
    pub fn spawn(timeout: Duration) -> Result<Self, BalanceError> {
        let (job_tx, job_rx) = mpsc::channel::<Job>();
        let (result_tx, result_rx) = mpsc::channel::<JobResult>();

        let worker = thread::Builder::new()
            .name("flownet-balancer".to_string())
            .spawn(move || {
                while let Ok((id, bytes)) = job_rx.recv() {
                    let result = bitcode::deserialize::<FlowSnapshot>(&bytes)
                        .map_err(|err| BalanceError::Decode(err.to_string()))
                        .and_then(|snapshot| {
                            bitcode::serialize(&balance_snapshot(&snapshot))
                                .map_err(|err| BalanceError::Encode(err.to_string()))
                        });
                    if result_tx.send((id, result)).is_err() {
                        break;
                    }
                }
            })
            .map_err(|_| BalanceError::WorkerUnavailable)?;

        Ok(Self {
            jobs: Some(job_tx),
            results: result_rx,
            worker: Some(worker),
            timeout,
            next_job: 0,
        })
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }
}

impl Balancer for OffloadedBalancer {
    fn name(&self) -> &'static str {
        "offloaded"
    }

    fn balance(&mut self, snapshot: &FlowSnapshot) -> Result<BalanceOutcome, BalanceError> {
        let jobs = self.jobs.as_ref().ok_or(BalanceError::WorkerUnavailable)?;
        let bytes = bitcode::serialize(snapshot).map_err(|err| BalanceError::Encode(err.to_string()))?;

        let id = self.next_job;
        self.next_job += 1;
        jobs.send((id, bytes)).map_err(|_| BalanceError::WorkerCrashed)?;

        loop {
            match self.results.recv_timeout(self.timeout) {
                Ok((answered, result)) if answered == id => {
                    let encoded = result?;
                    return bitcode::deserialize(&encoded)
                        .map_err(|err| BalanceError::Decode(err.to_string()));
                }
                Ok((stale, _)) => debug!(job = stale, "discarding stale offload result"),
                Err(mpsc::RecvTimeoutError::Timeout) => return Err(BalanceError::Timeout(self.timeout)),
                Err(mpsc::RecvTimeoutError::Disconnected) => return Err(BalanceError::WorkerCrashed),
            }
        }
    }
}

impl Drop for OffloadedBalancer {
    fn drop(&mut self) {
        // Closing the job channel ends the worker loop.
        self.jobs.take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

/// Runs `primary`, and on any error logs a warning and balances locally.
#[derive(Debug)]
pub struct FallbackBalancer<B> {
    primary: B,
    fallback: LocalBalancer,
    fallbacks: u64,
}

impl<B: Balancer> FallbackBalancer<B> {
    pub fn new(primary: B) -> Self {
        Self {
            primary,
            fallback: LocalBalancer,
            fallbacks: 0,
        }
    }

    /// How many times the local fallback had to run.
    pub fn fallback_count(&self) -> u64 {
        self.fallbacks
    }

    pub fn primary(&self) -> &B {
        &self.primary
    }

    pub fn primary_mut(&mut self) -> &mut B {
        &mut self.primary
    }
}

impl<B: Balancer> Balancer for FallbackBalancer<B> {
    fn name(&self) -> &'static str {
        self.primary.name()
    }

    fn balance(&mut self, snapshot: &FlowSnapshot) -> Result<BalanceOutcome, BalanceError> {
        match self.primary.balance(snapshot) {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                warn!(strategy = self.primary.name(), %err, "balancing failed, falling back to local");
                self.fallbacks += 1;
                self.fallback.balance(snapshot)
            }
        }
    }
}

/// Chooses between local and offloaded balancing by graph size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BalancePolicy {
    pub offload_enabled: bool,
    /// Offload only when the active node count exceeds this.
    pub batch_size: usize,
}

impl BalancePolicy {
    pub fn should_offload(&self, snapshot: &FlowSnapshot) -> bool {
        self.offload_enabled && snapshot.node_count() > self.batch_size
    }
}
