//! The flow optimizer: periodic, reentrancy-guarded balancing of connection
//! rates.
//!
//! Each run captures a snapshot, balances it (locally, or on the offload
//! worker for large graphs), persists the new `current_rate` of every
//! connection, records one transfer per positive per-type allocation and
//! publishes `OptimizationCompleted`. The optimizer never touches node
//! resource state.

use crate::balance::{
    BalanceOutcome, BalancePolicy, Balancer, FallbackBalancer, FlowSnapshot, LocalBalancer, OffloadedBalancer,
    balance_snapshot,
};
use crate::event::{Event, EventBus};
use crate::fixed::{Fixed64, Ticks};
use crate::graph::{FlowConnection, GraphStore};
use crate::history::{TransferHistory, TransferOrigin, TransferRecord};
use crate::id::{ConnectionId, ResourceType};
use crate::recipe::RecipeRegistry;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Aggregate figures of one optimization run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OptimizationMetrics {
    /// Wall-clock time the run took.
    pub elapsed: Duration,
    pub nodes_processed: usize,
    pub connections_processed: usize,
    pub transfers_generated: usize,
    pub bottleneck_count: usize,
    pub underutilized_count: usize,
    /// Processes started on idle converters before balancing.
    pub converters_started: usize,
    pub offloaded: bool,
}

/// Everything one optimization run produced.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OptimizationResult {
    pub transfers: Vec<TransferRecord>,
    pub updated_connections: Vec<FlowConnection>,
    pub bottlenecks: Vec<ResourceType>,
    pub underutilized: Vec<ResourceType>,
    pub metrics: OptimizationMetrics,
    pub timestamp: Ticks,
}

/// Borrowed engine state an optimization run needs.
pub struct OptimizeContext<'a> {
    pub graph: &'a mut GraphStore,
    pub recipes: &'a RecipeRegistry,
    pub history: &'a mut TransferHistory,
    pub events: &'a mut EventBus,
    pub now: Ticks,
}

/// Holds the in-flight flag for one run and clears it on drop, so a run
/// that unwinds does not leave the optimizer locked.
struct InFlightGuard(Arc<AtomicBool>);

impl InFlightGuard {
    /// `None` when a run already holds the flag.
    fn enter(flag: &Arc<AtomicBool>) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(Arc::clone(flag)))
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Runs balancing and keeps the last result.
#[derive(Debug)]
pub struct FlowOptimizer {
    in_flight: Arc<AtomicBool>,
    last: Arc<OptimizationResult>,
    policy: BalancePolicy,
    offload_timeout: Duration,
    local: LocalBalancer,
    offloaded: Option<FallbackBalancer<OffloadedBalancer>>,
    runs: u64,
}

impl FlowOptimizer {
    pub fn new(policy: BalancePolicy, offload_timeout: Duration) -> Self {
        Self {
            in_flight: Arc::new(AtomicBool::new(false)),
            last: Arc::new(OptimizationResult::default()),
            policy,
            offload_timeout,
            local: LocalBalancer,
            offloaded: None,
            runs: 0,
        }
    }

    /// Replace the policy. Disabling offload stops the worker thread.
    pub fn configure(&mut self, policy: BalancePolicy, offload_timeout: Duration) {
        self.policy = policy;
        self.offload_timeout = offload_timeout;
        if !policy.offload_enabled {
            self.offloaded = None;
        } else if let Some(balancer) = self.offloaded.as_mut() {
            balancer.primary_mut().set_timeout(offload_timeout);
        }
    }

    pub fn policy(&self) -> BalancePolicy {
        self.policy
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    #[cfg(test)]
    pub(crate) fn set_in_flight(&mut self, in_flight: bool) {
        self.in_flight.store(in_flight, Ordering::Release);
    }

    /// The most recent result (an empty one before the first run).
    pub fn last_result(&self) -> Arc<OptimizationResult> {
        Arc::clone(&self.last)
    }

    /// Number of completed runs.
    pub fn runs(&self) -> u64 {
        self.runs
    }

    /// Times the offload path failed and local balancing stood in.
    pub fn fallback_count(&self) -> u64 {
        self.offloaded.as_ref().map_or(0, |b| b.fallback_count())
    }

    /// Run one optimization. A call made while a run is in flight returns
    /// the previous result unchanged.
    pub fn optimize(&mut self, ctx: &mut OptimizeContext<'_>, converters_started: usize) -> Arc<OptimizationResult> {
        let Some(guard) = InFlightGuard::enter(&self.in_flight) else {
            debug!("optimization already in flight; returning cached result");
            return self.last_result();
        };
        let result = Arc::new(self.run(ctx, converters_started));
        drop(guard);

        self.runs += 1;
        self.last = Arc::clone(&result);
        result
    }

    fn run(&mut self, ctx: &mut OptimizeContext<'_>, converters_started: usize) -> OptimizationResult {
        let started = Instant::now();
        let snapshot = FlowSnapshot::capture(ctx.graph, ctx.recipes, ctx.now);
        let (outcome, offloaded) = self.balance(&snapshot);

        let mut updated_connections = Vec::with_capacity(outcome.rates.len());
        let balanced: HashSet<&ConnectionId> = outcome.rates.iter().map(|(id, _)| id).collect();
        for (id, rate) in &outcome.rates {
            if ctx.graph.set_connection_rate(id.as_str(), *rate)
                && let Some(conn) = ctx.graph.get_connection(id.as_str())
            {
                updated_connections.push(conn.clone());
            }
        }
        // Connections left out of the snapshot carry nothing this round.
        let idle: Vec<ConnectionId> = ctx
            .graph
            .connections()
            .filter(|c| !balanced.contains(&c.id) && c.current_rate != Fixed64::ZERO)
            .map(|c| c.id.clone())
            .collect();
        for id in idle {
            ctx.graph.set_connection_rate(id.as_str(), Fixed64::ZERO);
            if let Some(conn) = ctx.graph.get_connection(id.as_str()) {
                updated_connections.push(conn.clone());
            }
        }

        let transfers: Vec<TransferRecord> = outcome
            .transfers
            .iter()
            .map(|t| TransferRecord {
                resource: t.resource.clone(),
                source: t.source.clone(),
                target: t.target.clone(),
                amount: t.amount,
                timestamp: ctx.now,
                connection: Some(t.connection.clone()),
                origin: TransferOrigin::Optimized,
            })
            .collect();
        for record in &transfers {
            ctx.history.push(record.clone());
            ctx.events.emit(Event::ResourceTransferred {
                transfer: record.clone(),
            });
        }

        let metrics = OptimizationMetrics {
            elapsed: started.elapsed(),
            nodes_processed: snapshot.nodes.len(),
            connections_processed: snapshot.connections.len(),
            transfers_generated: transfers.len(),
            bottleneck_count: outcome.bottlenecks.len(),
            underutilized_count: outcome.underutilized.len(),
            converters_started,
            offloaded,
        };
        info!(
            nodes = metrics.nodes_processed,
            connections = metrics.connections_processed,
            transfers = metrics.transfers_generated,
            bottlenecks = metrics.bottleneck_count,
            underutilized = metrics.underutilized_count,
            offloaded,
            "flow optimization complete"
        );
        ctx.events.emit(Event::OptimizationCompleted {
            metrics,
            tick: ctx.now,
        });

        OptimizationResult {
            transfers,
            updated_connections,
            bottlenecks: outcome.bottlenecks,
            underutilized: outcome.underutilized,
            metrics,
            timestamp: ctx.now,
        }
    }

    /// Pick a strategy for this snapshot and run it. Returns whether the
    /// offload worker produced the outcome.
    fn balance(&mut self, snapshot: &FlowSnapshot) -> (BalanceOutcome, bool) {
        if self.policy.should_offload(snapshot) {
            if self.offloaded.is_none() {
                match OffloadedBalancer::spawn(self.offload_timeout) {
                    Ok(balancer) => self.offloaded = Some(FallbackBalancer::new(balancer)),
                    Err(err) => warn!(%err, "offload worker could not start; balancing locally"),
                }
            }
            if let Some(balancer) = self.offloaded.as_mut() {
                let before = balancer.fallback_count();
                match balancer.balance(snapshot) {
                    Ok(outcome) => return (outcome, balancer.fallback_count() == before),
                    Err(err) => warn!(%err, "offload fallback failed; balancing locally"),
                }
            }
        }
        match self.local.balance(snapshot) {
            Ok(outcome) => (outcome, false),
            Err(_) => (balance_snapshot(snapshot), false),
        }
    }
}
