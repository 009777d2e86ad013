//! Explicit resource transfers in transit along a connection.

use crate::fixed::{Fixed64, Ticks, ceil_to_ticks};
use crate::graph::FlowConnection;
use crate::id::{ConnectionId, NodeId, ResourceType};

/// A transfer that left its source and has not reached its target yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InFlightTransfer {
    pub connection: ConnectionId,
    pub resource: ResourceType,
    pub source: NodeId,
    pub target: NodeId,
    pub amount: Fixed64,
    pub sent_at: Ticks,
    pub arrives_at: Ticks,
    seq: u64,
}

/// Ticks a transfer spends on `conn`: `ceil(distance / bandwidth)`.
pub fn transit_latency(conn: &FlowConnection) -> Ticks {
    if conn.distance <= Fixed64::ZERO || conn.bandwidth <= Fixed64::ZERO {
        return 0;
    }
    ceil_to_ticks(conn.distance.saturating_div(conn.bandwidth))
}

/// Pending transfers ordered by arrival, then by send order.
#[derive(Debug, Default)]
pub struct TransferQueue {
    pending: Vec<InFlightTransfer>,
    next_seq: u64,
}

impl TransferQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Put `amount` of `resource` on the road along `conn`.
    pub fn dispatch(
        &mut self,
        conn: &FlowConnection,
        resource: ResourceType,
        amount: Fixed64,
        now: Ticks,
    ) -> &InFlightTransfer {
        let transfer = InFlightTransfer {
            connection: conn.id.clone(),
            resource,
            source: conn.source.clone(),
            target: conn.target.clone(),
            amount,
            sent_at: now,
            arrives_at: now.saturating_add(transit_latency(conn)),
            seq: self.next_seq,
        };
        self.next_seq += 1;
        let at = self
            .pending
            .partition_point(|t| (t.arrives_at, t.seq) <= (transfer.arrives_at, transfer.seq));
        self.pending.insert(at, transfer);
        &self.pending[at]
    }

    /// Remove and return every transfer due by `now`, in arrival order.
    pub fn take_due(&mut self, now: Ticks) -> Vec<InFlightTransfer> {
        let due = self.pending.partition_point(|t| t.arrives_at <= now);
        self.pending.drain(..due).collect()
    }

    pub fn pending(&self) -> &[InFlightTransfer] {
        &self.pending
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
