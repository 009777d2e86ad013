//! Typed events published toward the rest of the application.
//!
//! Events are emitted synchronously by the engine and queued per kind until
//! the next delivery. Queued events are delivered in batch to passive
//! listeners at the end of every `advance` call (or on an explicit
//! `deliver`). Delivery is fire-and-forget: listeners cannot fail the
//! emitting operation. The pending queues are unbounded; only the history
//! of delivered events kept for inspection is a bounded ring buffer.
//!
//! Event kinds can be suppressed via [`EventBus::suppress`]; suppressed
//! events are never queued.

use crate::fixed::{Fixed64, Ticks};
use crate::graph::NodeKind;
use crate::history::{RingBuffer, TransferRecord};
use crate::id::*;
use crate::optimizer::OptimizationMetrics;

// ---------------------------------------------------------------------------
// Event types
// ---------------------------------------------------------------------------

/// An engine event. Every variant carries the tick at which it occurred.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    // -- Graph --
    NodeRegistered {
        node: NodeId,
        kind: NodeKind,
        tick: Ticks,
    },
    NodeUnregistered {
        node: NodeId,
        /// Connections removed along with the node.
        removed_connections: Vec<ConnectionId>,
        tick: Ticks,
    },
    ConnectionRegistered {
        connection: ConnectionId,
        source: NodeId,
        target: NodeId,
        tick: Ticks,
    },
    ConnectionUnregistered {
        connection: ConnectionId,
        tick: Ticks,
    },

    // -- Resources --
    ResourceUpdated {
        node: NodeId,
        resource: ResourceType,
        delta: Fixed64,
        current: Fixed64,
        tick: Ticks,
    },
    ResourceTransferred {
        transfer: TransferRecord,
    },

    // -- Conversion --
    ConversionStarted {
        process: ProcessId,
        converter: NodeId,
        recipe: RecipeId,
        efficiency: Fixed64,
        tick: Ticks,
    },
    ConversionCompleted {
        process: ProcessId,
        converter: NodeId,
        recipe: RecipeId,
        outputs: Vec<(ResourceType, Fixed64)>,
        tick: Ticks,
    },
    ConversionFailed {
        converter: NodeId,
        recipe: RecipeId,
        reason: String,
        tick: Ticks,
    },

    // -- Chains --
    ChainCompleted {
        chain: ChainId,
        execution: ExecutionId,
        tick: Ticks,
    },
    ChainFailed {
        chain: ChainId,
        execution: ExecutionId,
        reason: String,
        tick: Ticks,
    },

    // -- Optimizer --
    OptimizationCompleted {
        metrics: OptimizationMetrics,
        tick: Ticks,
    },
}

/// Discriminant tag for event types, used for suppression and subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    NodeRegistered,
    NodeUnregistered,
    ConnectionRegistered,
    ConnectionUnregistered,
    ResourceUpdated,
    ResourceTransferred,
    ConversionStarted,
    ConversionCompleted,
    ConversionFailed,
    ChainCompleted,
    ChainFailed,
    OptimizationCompleted,
}

/// Total number of event kinds.
const EVENT_KIND_COUNT: usize = 12;

impl Event {
    /// Get the discriminant kind for this event.
    pub fn kind(&self) -> EventKind {
        match self {
            Event::NodeRegistered { .. } => EventKind::NodeRegistered,
            Event::NodeUnregistered { .. } => EventKind::NodeUnregistered,
            Event::ConnectionRegistered { .. } => EventKind::ConnectionRegistered,
            Event::ConnectionUnregistered { .. } => EventKind::ConnectionUnregistered,
            Event::ResourceUpdated { .. } => EventKind::ResourceUpdated,
            Event::ResourceTransferred { .. } => EventKind::ResourceTransferred,
            Event::ConversionStarted { .. } => EventKind::ConversionStarted,
            Event::ConversionCompleted { .. } => EventKind::ConversionCompleted,
            Event::ConversionFailed { .. } => EventKind::ConversionFailed,
            Event::ChainCompleted { .. } => EventKind::ChainCompleted,
            Event::ChainFailed { .. } => EventKind::ChainFailed,
            Event::OptimizationCompleted { .. } => EventKind::OptimizationCompleted,
        }
    }

    /// The tick at which the event occurred.
    pub fn tick(&self) -> Ticks {
        match self {
            Event::ResourceTransferred { transfer } => transfer.timestamp,
            Event::NodeRegistered { tick, .. }
            | Event::NodeUnregistered { tick, .. }
            | Event::ConnectionRegistered { tick, .. }
            | Event::ConnectionUnregistered { tick, .. }
            | Event::ResourceUpdated { tick, .. }
            | Event::ConversionStarted { tick, .. }
            | Event::ConversionCompleted { tick, .. }
            | Event::ConversionFailed { tick, .. }
            | Event::ChainCompleted { tick, .. }
            | Event::ChainFailed { tick, .. }
            | Event::OptimizationCompleted { tick, .. } => *tick,
        }
    }
}

impl EventKind {
    /// Every kind, in discriminant order.
    pub const ALL: [EventKind; EVENT_KIND_COUNT] = [
        EventKind::NodeRegistered,
        EventKind::NodeUnregistered,
        EventKind::ConnectionRegistered,
        EventKind::ConnectionUnregistered,
        EventKind::ResourceUpdated,
        EventKind::ResourceTransferred,
        EventKind::ConversionStarted,
        EventKind::ConversionCompleted,
        EventKind::ConversionFailed,
        EventKind::ChainCompleted,
        EventKind::ChainFailed,
        EventKind::OptimizationCompleted,
    ];

    /// Convert to usize index for array lookups.
    fn index(self) -> usize {
        self as usize
    }
}

// ---------------------------------------------------------------------------
// Subscribers
// ---------------------------------------------------------------------------

/// A passive listener receives events read-only.
pub type Listener = Box<dyn FnMut(&Event) + Send>;

/// Optional predicate that filters events for a listener.
pub type EventFilter = Box<dyn Fn(&Event) -> bool + Send>;

/// Priority level for listeners. Lower priorities run first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ListenerPriority {
    Pre = 0,
    Normal = 1,
    Post = 2,
}

struct ListenerEntry {
    listener: Listener,
    priority: ListenerPriority,
    filter: Option<EventFilter>,
    insertion_order: u64,
}

impl std::fmt::Debug for ListenerEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerEntry")
            .field("priority", &self.priority)
            .field("filtered", &self.filter.is_some())
            .field("insertion_order", &self.insertion_order)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

/// Holds the pending queue and delivered history per event kind, listener
/// lists, and suppression flags.
pub struct EventBus {
    pending: [Vec<Event>; EVENT_KIND_COUNT],
    recent: [Option<RingBuffer<Event>>; EVENT_KIND_COUNT],
    suppressed: [bool; EVENT_KIND_COUNT],
    listeners: [Vec<ListenerEntry>; EVENT_KIND_COUNT],
    /// Lifetime emit counters, kept even when buffers are cleared.
    emitted: [u64; EVENT_KIND_COUNT],
    default_capacity: usize,
    next_insertion_order: u64,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("suppressed", &self.suppressed)
            .field("emitted", &self.emitted)
            .field("default_capacity", &self.default_capacity)
            .finish_non_exhaustive()
    }
}

impl EventBus {
    /// Create a new event bus with the given buffer capacity per kind.
    pub fn new(default_capacity: usize) -> Self {
        Self {
            pending: std::array::from_fn(|_| Vec::new()),
            recent: Default::default(),
            suppressed: [false; EVENT_KIND_COUNT],
            listeners: std::array::from_fn(|_| Vec::new()),
            emitted: [0; EVENT_KIND_COUNT],
            default_capacity,
            next_insertion_order: 0,
        }
    }

    /// Suppress an event kind. Its pending events are dropped and future
    /// events of that kind are discarded.
    pub fn suppress(&mut self, kind: EventKind) {
        self.suppressed[kind.index()] = true;
        self.pending[kind.index()].clear();
    }

    /// Re-enable a previously suppressed kind.
    pub fn unsuppress(&mut self, kind: EventKind) {
        self.suppressed[kind.index()] = false;
    }

    pub fn is_suppressed(&self, kind: EventKind) -> bool {
        self.suppressed[kind.index()]
    }

    /// Queue an event for the next delivery. No-ops if the kind is suppressed.
    pub fn emit(&mut self, event: Event) {
        let idx = event.kind().index();
        if self.suppressed[idx] {
            return;
        }
        self.emitted[idx] += 1;
        self.pending[idx].push(event);
    }

    /// Register a listener with normal priority and no filter.
    pub fn subscribe(&mut self, kind: EventKind, listener: Listener) {
        self.subscribe_filtered(kind, ListenerPriority::Normal, None, listener);
    }

    /// Register a listener with explicit priority and optional filter.
    pub fn subscribe_filtered(
        &mut self,
        kind: EventKind,
        priority: ListenerPriority,
        filter: Option<EventFilter>,
        listener: Listener,
    ) {
        let order = self.next_insertion_order;
        self.next_insertion_order += 1;
        let list = &mut self.listeners[kind.index()];
        list.push(ListenerEntry {
            listener,
            priority,
            filter,
            insertion_order: order,
        });
        list.sort_by_key(|entry| (entry.priority, entry.insertion_order));
    }

    /// Deliver every pending event to listeners, oldest first within a kind,
    /// and move it into the kind's delivered history. Returns the number of
    /// events delivered.
    pub fn deliver(&mut self) -> usize {
        let mut delivered = 0;
        let capacity = self.default_capacity;
        for idx in 0..EVENT_KIND_COUNT {
            if self.pending[idx].is_empty() {
                continue;
            }
            let events = std::mem::take(&mut self.pending[idx]);
            delivered += events.len();

            for entry in &mut self.listeners[idx] {
                for event in &events {
                    if let Some(ref filter) = entry.filter
                        && !filter(event)
                    {
                        continue;
                    }
                    (entry.listener)(event);
                }
            }

            let history = self.recent[idx].get_or_insert_with(|| RingBuffer::new(capacity));
            for event in events {
                history.push(event);
            }
        }
        delivered
    }

    /// The most recently delivered events of a kind, bounded by the bus
    /// capacity.
    pub fn recent(&self, kind: EventKind) -> Option<&RingBuffer<Event>> {
        self.recent[kind.index()].as_ref()
    }

    /// Number of events of a kind waiting for delivery.
    pub fn buffered_count(&self, kind: EventKind) -> usize {
        self.pending[kind.index()].len()
    }

    /// Total events of a kind emitted since creation.
    pub fn total_emitted(&self, kind: EventKind) -> u64 {
        self.emitted[kind.index()]
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn registered(node: &str, tick: Ticks) -> Event {
        Event::NodeRegistered {
            node: NodeId::from(node),
            kind: NodeKind::Producer,
            tick,
        }
    }

    #[test]
    fn emit_buffers_per_kind() {
        let mut bus = EventBus::new(16);
        bus.emit(registered("a", 1));
        bus.emit(registered("b", 2));
        bus.emit(Event::ConnectionUnregistered {
            connection: ConnectionId::from("x"),
            tick: 3,
        });

        assert_eq!(bus.buffered_count(EventKind::NodeRegistered), 2);
        assert_eq!(bus.buffered_count(EventKind::ConnectionUnregistered), 1);
        assert_eq!(bus.buffered_count(EventKind::ConversionStarted), 0);
    }

    #[test]
    fn suppressed_kinds_are_dropped() {
        let mut bus = EventBus::new(16);
        bus.suppress(EventKind::NodeRegistered);
        bus.emit(registered("a", 1));
        assert_eq!(bus.buffered_count(EventKind::NodeRegistered), 0);
        assert_eq!(bus.total_emitted(EventKind::NodeRegistered), 0);

        bus.unsuppress(EventKind::NodeRegistered);
        bus.emit(registered("a", 2));
        assert_eq!(bus.buffered_count(EventKind::NodeRegistered), 1);
    }

    #[test]
    fn listeners_run_by_priority_then_registration() {
        let mut bus = EventBus::new(16);
        let order = Arc::new(Mutex::new(Vec::new()));

        for (label, priority) in [
            ('A', ListenerPriority::Normal),
            ('B', ListenerPriority::Pre),
            ('C', ListenerPriority::Normal),
        ] {
            let order = order.clone();
            bus.subscribe_filtered(
                EventKind::NodeRegistered,
                priority,
                None,
                Box::new(move |_| order.lock().unwrap().push(label)),
            );
        }

        bus.emit(registered("a", 1));
        assert_eq!(bus.deliver(), 1);
        assert_eq!(*order.lock().unwrap(), vec!['B', 'A', 'C']);
    }

    #[test]
    fn filters_skip_events() {
        let mut bus = EventBus::new(16);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        bus.subscribe_filtered(
            EventKind::NodeRegistered,
            ListenerPriority::Normal,
            Some(Box::new(|e| e.tick() > 1)),
            Box::new(move |e| sink.lock().unwrap().push(e.tick())),
        );

        bus.emit(registered("a", 1));
        bus.emit(registered("b", 2));
        bus.deliver();
        assert_eq!(*seen.lock().unwrap(), vec![2]);
    }

    #[test]
    fn delivery_clears_pending_but_not_counters() {
        let mut bus = EventBus::new(2);
        for tick in 0..5 {
            bus.emit(registered("a", tick));
        }
        assert_eq!(bus.buffered_count(EventKind::NodeRegistered), 5);
        assert_eq!(bus.deliver(), 5);
        assert_eq!(bus.buffered_count(EventKind::NodeRegistered), 0);
        assert_eq!(bus.total_emitted(EventKind::NodeRegistered), 5);
    }

    #[test]
    fn events_beyond_capacity_are_all_delivered() {
        let mut bus = EventBus::new(4);
        let count = Arc::new(Mutex::new(0usize));
        let sink = count.clone();
        bus.subscribe(
            EventKind::NodeRegistered,
            Box::new(move |_| *sink.lock().unwrap() += 1),
        );

        for tick in 0..10 {
            bus.emit(registered("a", tick));
        }
        assert_eq!(bus.deliver(), 10);
        assert_eq!(*count.lock().unwrap(), 10);

        // Only the delivered history is bounded.
        let recent = bus.recent(EventKind::NodeRegistered).unwrap();
        assert_eq!(recent.len(), 4);
        assert_eq!(recent.latest().map(Event::tick), Some(9));
    }

    #[test]
    fn kind_index_matches_all_table() {
        for (i, kind) in EventKind::ALL.iter().enumerate() {
            assert_eq!(kind.index(), i);
        }
    }
}
