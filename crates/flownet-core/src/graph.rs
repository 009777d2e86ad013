//! The graph store: nodes, connections, and their referential integrity.
//!
//! Nodes and connections live in `SlotMap`s keyed by internal keys, with a
//! string-id index for callers and a `SecondaryMap` of adjacency lists per
//! node. Registration order is tracked separately so the optimizer can break
//! priority ties deterministically.

use crate::dirty::DirtyTracker;
use crate::fixed::Fixed64;
use crate::id::*;
use crate::resource::ResourceState;
use serde::{Deserialize, Serialize};
use slotmap::{SecondaryMap, SlotMap};
use std::collections::{BTreeMap, HashMap};

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors that can occur during graph operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GraphError {
    #[error("{0} id is missing")]
    MissingId(&'static str),
    #[error("node {0} declares no resources")]
    EmptyResources(NodeId),
    #[error("node {0} is already registered")]
    DuplicateNode(NodeId),
    #[error("connection {0} is already registered")]
    DuplicateConnection(ConnectionId),
    #[error("node not found: {0}")]
    NodeNotFound(NodeId),
    #[error("connection not found: {0}")]
    ConnectionNotFound(ConnectionId),
    #[error("connection {connection} references missing node {node}")]
    EndpointMissing {
        connection: ConnectionId,
        node: NodeId,
    },
    #[error("connection {0} carries no resource types")]
    NoResourceTypes(ConnectionId),
    #[error("connection {connection}: source {source_node} does not carry {resource}")]
    ResourceNotCarried {
        connection: ConnectionId,
        source_node: NodeId,
        resource: ResourceType,
    },
    #[error("connection {0} must have a positive max rate")]
    NonPositiveRate(ConnectionId),
    #[error("connection {0} must have a positive bandwidth")]
    NonPositiveBandwidth(ConnectionId),
    #[error("node {node} has no {resource} resource")]
    ResourceMissing { node: NodeId, resource: ResourceType },
    #[error("node {node} has {available} {resource}, {requested} requested")]
    InsufficientResources {
        node: NodeId,
        resource: ResourceType,
        requested: Fixed64,
        available: Fixed64,
    },
    #[error("node {node}: {resource} violates min <= current <= max")]
    InvalidResourceState { node: NodeId, resource: ResourceType },
}

// ---------------------------------------------------------------------------
// Node data
// ---------------------------------------------------------------------------

/// The role a node plays in the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeKind {
    Producer,
    Consumer,
    Storage,
    Converter,
}

/// Multipliers applied on top of a converter's base efficiency.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EfficiencyModifiers {
    /// Applied to every recipe the converter runs.
    pub global: Option<Fixed64>,
    /// Applied only when running the keyed recipe.
    pub recipes: BTreeMap<RecipeId, Fixed64>,
    /// Applied once per recipe input of the keyed type.
    pub resources: BTreeMap<ResourceType, Fixed64>,
}

/// Converter-specific configuration and process bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConverterConfig {
    pub max_concurrent_processes: u32,
    pub modifiers: EfficiencyModifiers,
    /// Technology tier; each tier adds 5% efficiency.
    pub tier: u32,
    /// Recipes this converter can run. Empty means every registered recipe.
    pub supported_recipes: Vec<RecipeId>,
    /// Processes currently running (or paused) on this converter.
    pub active_processes: Vec<ProcessId>,
}

impl Default for ConverterConfig {
    fn default() -> Self {
        Self {
            max_concurrent_processes: 1,
            modifiers: EfficiencyModifiers::default(),
            tier: 0,
            supported_recipes: Vec::new(),
            active_processes: Vec::new(),
        }
    }
}

impl ConverterConfig {
    pub fn with_capacity(max_concurrent_processes: u32) -> Self {
        Self {
            max_concurrent_processes,
            ..Self::default()
        }
    }

    pub fn supporting(mut self, recipes: impl IntoIterator<Item = RecipeId>) -> Self {
        self.supported_recipes = recipes.into_iter().collect();
        self
    }

    pub fn with_tier(mut self, tier: u32) -> Self {
        self.tier = tier;
        self
    }

    /// Whether another process may start on this converter.
    pub fn has_free_slot(&self) -> bool {
        (self.active_processes.len() as u32) < self.max_concurrent_processes
    }

    /// Whether this converter may run the recipe.
    pub fn supports(&self, recipe: &RecipeId) -> bool {
        self.supported_recipes.is_empty() || self.supported_recipes.contains(recipe)
    }
}

/// A participant in the resource graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowNode {
    pub id: NodeId,
    pub kind: NodeKind,
    pub resources: BTreeMap<ResourceType, ResourceState>,
    #[serde(default = "default_true")]
    pub active: bool,
    /// Base efficiency multiplier. Only converters use it; defaults to 1.
    #[serde(default)]
    pub efficiency: Option<Fixed64>,
    #[serde(default)]
    pub converter: Option<ConverterConfig>,
}

fn default_true() -> bool {
    true
}

impl FlowNode {
    pub fn new(id: impl Into<NodeId>, kind: NodeKind) -> Self {
        Self {
            id: id.into(),
            kind,
            resources: BTreeMap::new(),
            active: true,
            efficiency: None,
            converter: None,
        }
    }

    pub fn with_resource(mut self, resource: impl Into<ResourceType>, state: ResourceState) -> Self {
        self.resources.insert(resource.into(), state);
        self
    }

    pub fn with_converter(mut self, config: ConverterConfig) -> Self {
        self.converter = Some(config);
        self
    }

    pub fn with_efficiency(mut self, efficiency: Fixed64) -> Self {
        self.efficiency = Some(efficiency);
        self
    }

    pub fn resource(&self, resource: &str) -> Option<&ResourceState> {
        self.resources.get(resource)
    }

    pub fn is_converter(&self) -> bool {
        self.kind == NodeKind::Converter
    }
}

// ---------------------------------------------------------------------------
// Connection data
// ---------------------------------------------------------------------------

/// A directed, rate-limited, priority-ordered edge between two nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowConnection {
    pub id: ConnectionId,
    pub source: NodeId,
    pub target: NodeId,
    pub resource_types: Vec<ResourceType>,
    pub max_rate: Fixed64,
    /// Assigned by the optimizer; reset to zero on registration.
    #[serde(default)]
    pub current_rate: Fixed64,
    /// Higher priorities are serviced first.
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "default_true")]
    pub active: bool,
    /// Travel distance used to delay explicit transfers.
    #[serde(default)]
    pub distance: Fixed64,
    /// Distance covered per tick by explicit transfers.
    #[serde(default = "default_bandwidth")]
    pub bandwidth: Fixed64,
}

fn default_bandwidth() -> Fixed64 {
    Fixed64::ONE
}

impl FlowConnection {
    pub fn new(
        id: impl Into<ConnectionId>,
        source: impl Into<NodeId>,
        target: impl Into<NodeId>,
        resource_types: impl IntoIterator<Item = ResourceType>,
        max_rate: Fixed64,
    ) -> Self {
        Self {
            id: id.into(),
            source: source.into(),
            target: target.into(),
            resource_types: resource_types.into_iter().collect(),
            max_rate,
            current_rate: Fixed64::ZERO,
            priority: 0,
            active: true,
            distance: Fixed64::ZERO,
            bandwidth: Fixed64::ONE,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_distance(mut self, distance: Fixed64, bandwidth: Fixed64) -> Self {
        self.distance = distance;
        self.bandwidth = bandwidth;
        self
    }

    pub fn carries(&self, resource: &ResourceType) -> bool {
        self.resource_types.contains(resource)
    }
}

/// Adjacency lists for a single node.
#[derive(Debug, Clone, Default)]
struct NodeAdjacency {
    /// Connections whose target is this node.
    inputs: Vec<ConnectionKey>,
    /// Connections whose source is this node.
    outputs: Vec<ConnectionKey>,
}

/// A node removed from the store together with the connections it took along.
#[derive(Debug, Clone)]
pub struct RemovedNode {
    pub node: FlowNode,
    pub connections: Vec<FlowConnection>,
}

// ---------------------------------------------------------------------------
// GraphStore
// ---------------------------------------------------------------------------

/// Owns every node and connection of the resource network.
#[derive(Debug, Default)]
pub struct GraphStore {
    nodes: SlotMap<NodeKey, FlowNode>,
    connections: SlotMap<ConnectionKey, FlowConnection>,
    adjacency: SecondaryMap<NodeKey, NodeAdjacency>,
    node_index: HashMap<NodeId, NodeKey>,
    connection_index: HashMap<ConnectionId, ConnectionKey>,
    /// Registration order, used for deterministic iteration.
    node_order: Vec<NodeKey>,
    connection_order: Vec<ConnectionKey>,
    dirty: DirtyTracker,
}

impl GraphStore {
    /// Create a new, empty graph store.
    pub fn new() -> Self {
        Self::default()
    }

    // -----------------------------------------------------------------------
    // Registration
    // -----------------------------------------------------------------------

    /// Register a node. Nothing is mutated when validation fails.
    pub fn register_node(&mut self, mut node: FlowNode) -> Result<(), GraphError> {
        if node.id.is_blank() {
            return Err(GraphError::MissingId("node"));
        }
        if node.resources.is_empty() {
            return Err(GraphError::EmptyResources(node.id));
        }
        if self.node_index.contains_key(&node.id) {
            return Err(GraphError::DuplicateNode(node.id));
        }
        if let Some((resource, _)) = node.resources.iter().find(|(_, s)| !s.is_valid()) {
            return Err(GraphError::InvalidResourceState {
                node: node.id.clone(),
                resource: resource.clone(),
            });
        }
        if node.kind == NodeKind::Converter && node.converter.is_none() {
            node.converter = Some(ConverterConfig::default());
        }

        self.dirty.mark_types(node.resources.keys());
        let id = node.id.clone();
        let key = self.nodes.insert(node);
        self.adjacency.insert(key, NodeAdjacency::default());
        self.node_index.insert(id, key);
        self.node_order.push(key);
        Ok(())
    }

    /// Remove a node and every connection that touches it.
    pub fn unregister_node(&mut self, id: &str) -> Result<RemovedNode, GraphError> {
        let key = self
            .node_index
            .get(id)
            .copied()
            .ok_or_else(|| GraphError::NodeNotFound(NodeId::from(id)))?;

        let touching: Vec<ConnectionKey> = self
            .adjacency
            .get(key)
            .map(|adj| adj.inputs.iter().chain(adj.outputs.iter()).copied().collect())
            .unwrap_or_default();

        let mut connections = Vec::with_capacity(touching.len());
        for conn_key in touching {
            if let Some(conn) = self.remove_connection_by_key(conn_key) {
                connections.push(conn);
            }
        }

        self.adjacency.remove(key);
        self.node_index.remove(id);
        self.node_order.retain(|&k| k != key);
        let node = self
            .nodes
            .remove(key)
            .ok_or_else(|| GraphError::NodeNotFound(NodeId::from(id)))?;
        self.dirty.mark_types(node.resources.keys());

        Ok(RemovedNode { node, connections })
    }

    /// Register a connection between two existing nodes.
    pub fn register_connection(&mut self, mut conn: FlowConnection) -> Result<(), GraphError> {
        if conn.id.is_blank() {
            return Err(GraphError::MissingId("connection"));
        }
        if self.connection_index.contains_key(&conn.id) {
            return Err(GraphError::DuplicateConnection(conn.id));
        }
        if conn.resource_types.is_empty() {
            return Err(GraphError::NoResourceTypes(conn.id));
        }
        if conn.max_rate <= Fixed64::ZERO {
            return Err(GraphError::NonPositiveRate(conn.id));
        }
        if conn.bandwidth <= Fixed64::ZERO {
            return Err(GraphError::NonPositiveBandwidth(conn.id));
        }

        let source_key = self.endpoint_key(&conn.id, &conn.source)?;
        let target_key = self.endpoint_key(&conn.id, &conn.target)?;

        let source = &self.nodes[source_key];
        if let Some(missing) = conn
            .resource_types
            .iter()
            .find(|r| !source.resources.contains_key(*r))
        {
            return Err(GraphError::ResourceNotCarried {
                connection: conn.id.clone(),
                source_node: conn.source.clone(),
                resource: missing.clone(),
            });
        }

        conn.current_rate = Fixed64::ZERO;
        self.dirty.mark_types(conn.resource_types.iter());
        let id = conn.id.clone();
        let key = self.connections.insert(conn);

        if let Some(adj) = self.adjacency.get_mut(source_key) {
            adj.outputs.push(key);
        }
        if let Some(adj) = self.adjacency.get_mut(target_key) {
            adj.inputs.push(key);
        }
        self.connection_index.insert(id, key);
        self.connection_order.push(key);
        Ok(())
    }

    /// Remove a connection.
    pub fn unregister_connection(&mut self, id: &str) -> Result<FlowConnection, GraphError> {
        let key = self
            .connection_index
            .get(id)
            .copied()
            .ok_or_else(|| GraphError::ConnectionNotFound(ConnectionId::from(id)))?;
        self.remove_connection_by_key(key)
            .ok_or_else(|| GraphError::ConnectionNotFound(ConnectionId::from(id)))
    }

    fn endpoint_key(&self, connection: &ConnectionId, node: &NodeId) -> Result<NodeKey, GraphError> {
        self.node_index
            .get(node)
            .copied()
            .ok_or_else(|| GraphError::EndpointMissing {
                connection: connection.clone(),
                node: node.clone(),
            })
    }

    fn remove_connection_by_key(&mut self, key: ConnectionKey) -> Option<FlowConnection> {
        let conn = self.connections.remove(key)?;
        if let Some(&source) = self.node_index.get(&conn.source)
            && let Some(adj) = self.adjacency.get_mut(source)
        {
            adj.outputs.retain(|&k| k != key);
        }
        if let Some(&target) = self.node_index.get(&conn.target)
            && let Some(adj) = self.adjacency.get_mut(target)
        {
            adj.inputs.retain(|&k| k != key);
        }
        self.connection_index.remove(&conn.id);
        self.connection_order.retain(|&k| k != key);
        self.dirty.mark_types(conn.resource_types.iter());
        Some(conn)
    }

    // -----------------------------------------------------------------------
    // Controlled mutation
    // -----------------------------------------------------------------------

    /// Run `f` against one resource of one node and mark the type dirty.
    pub fn update_resource<R>(
        &mut self,
        node: &str,
        resource: &ResourceType,
        f: impl FnOnce(&mut ResourceState) -> R,
    ) -> Result<R, GraphError> {
        let key = self
            .node_index
            .get(node)
            .copied()
            .ok_or_else(|| GraphError::NodeNotFound(NodeId::from(node)))?;
        let state = self.nodes[key]
            .resources
            .get_mut(resource)
            .ok_or_else(|| GraphError::ResourceMissing {
                node: NodeId::from(node),
                resource: resource.clone(),
            })?;
        let out = f(state);
        self.dirty.mark_type(resource);
        Ok(out)
    }

    /// Add a resource type to an existing node. Does nothing if the node
    /// already holds that type.
    pub fn insert_resource(
        &mut self,
        node: &str,
        resource: ResourceType,
        state: ResourceState,
    ) -> Result<(), GraphError> {
        let key = self
            .node_index
            .get(node)
            .copied()
            .ok_or_else(|| GraphError::NodeNotFound(NodeId::from(node)))?;
        if !state.is_valid() {
            return Err(GraphError::InvalidResourceState {
                node: NodeId::from(node),
                resource,
            });
        }
        self.dirty.mark_type(&resource);
        self.nodes[key].resources.entry(resource).or_insert(state);
        Ok(())
    }

    pub fn set_node_active(&mut self, id: &str, active: bool) -> Result<(), GraphError> {
        let node = self
            .node_mut(id)
            .ok_or_else(|| GraphError::NodeNotFound(NodeId::from(id)))?;
        node.active = active;
        let types: Vec<ResourceType> = node.resources.keys().cloned().collect();
        self.dirty.mark_types(types.iter());
        Ok(())
    }

    pub fn set_connection_active(&mut self, id: &str, active: bool) -> Result<(), GraphError> {
        let key = self
            .connection_index
            .get(id)
            .copied()
            .ok_or_else(|| GraphError::ConnectionNotFound(ConnectionId::from(id)))?;
        let conn = &mut self.connections[key];
        conn.active = active;
        if !active {
            conn.current_rate = Fixed64::ZERO;
        }
        Ok(())
    }

    /// Persist an optimizer-assigned rate. Not a topology change.
    pub(crate) fn set_connection_rate(&mut self, id: &str, rate: Fixed64) -> bool {
        match self.connection_index.get(id) {
            Some(&key) => {
                self.connections[key].current_rate = rate;
                true
            }
            None => false,
        }
    }

    /// Mutable node access for the process engine. Callers that touch
    /// `resources` must follow up with [`GraphStore::mark_resources_dirty`].
    pub(crate) fn node_mut(&mut self, id: &str) -> Option<&mut FlowNode> {
        let key = self.node_index.get(id).copied()?;
        self.nodes.get_mut(key)
    }

    pub(crate) fn mark_resources_dirty<'a>(
        &mut self,
        resources: impl IntoIterator<Item = &'a ResourceType>,
    ) {
        self.dirty.mark_types(resources);
    }

    /// Drain the set of resource types changed since the last call.
    pub fn take_dirty_types(&mut self) -> std::collections::BTreeSet<ResourceType> {
        self.dirty.take_dirty_types()
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub fn get_node(&self, id: &str) -> Option<&FlowNode> {
        self.node_index.get(id).and_then(|&k| self.nodes.get(k))
    }

    pub fn get_connection(&self, id: &str) -> Option<&FlowConnection> {
        self.connection_index
            .get(id)
            .and_then(|&k| self.connections.get(k))
    }

    /// All nodes in registration order.
    pub fn nodes(&self) -> impl Iterator<Item = &FlowNode> {
        self.node_order.iter().filter_map(|&k| self.nodes.get(k))
    }

    /// All connections in registration order.
    pub fn connections(&self) -> impl Iterator<Item = &FlowConnection> {
        self.connection_order
            .iter()
            .filter_map(|&k| self.connections.get(k))
    }

    /// Every connection that has the node as source or target: outgoing
    /// first, then incoming, each in registration order.
    pub fn node_connections(&self, id: &str) -> Vec<&FlowConnection> {
        let Some(adj) = self.node_index.get(id).and_then(|&k| self.adjacency.get(k)) else {
            return Vec::new();
        };
        adj.outputs
            .iter()
            .chain(adj.inputs.iter())
            .filter_map(|&k| self.connections.get(k))
            .collect()
    }

    /// Active converter nodes in registration order.
    pub fn converters(&self) -> impl Iterator<Item = &FlowNode> {
        self.nodes().filter(|n| n.active && n.is_converter())
    }

    pub fn contains_node(&self, id: &str) -> bool {
        self.node_index.contains_key(id)
    }

    pub fn contains_connection(&self, id: &str) -> bool {
        self.connection_index.contains_key(id)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Every resource type held by at least one node, sorted.
    pub fn resource_types(&self) -> Vec<ResourceType> {
        let mut types: Vec<ResourceType> = self
            .nodes
            .values()
            .flat_map(|n| n.resources.keys().cloned())
            .collect();
        types.sort();
        types.dedup();
        types
    }

    /// Sum the states of every active node holding `resource`, or `None` if
    /// no node holds it.
    pub fn aggregate_resource(&self, resource: &ResourceType) -> Option<ResourceState> {
        let mut total: Option<ResourceState> = None;
        for node in self.nodes.values().filter(|n| n.active) {
            if let Some(state) = node.resources.get(resource) {
                total.get_or_insert_with(ResourceState::default).accumulate(state);
            }
        }
        total
    }
}
