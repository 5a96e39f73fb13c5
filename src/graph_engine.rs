//! Logical graph layer over the storage engine
//!
//! Adds the property-predicate language, remote placeholder nodes for edges
//! whose target lives on another shard, and the bounded-hop neighbourhood
//! search with its query-scoped visited-set bookkeeping.

use anyhow::Result;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::path::Path;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::graph_storage::GraphStorage;
use crate::property_codec::{PropertyMap, PropertyValue};
use crate::types::{EdgeId, NodeId};

/// Property key marking a node as a placeholder for a record on another shard.
pub const REMOTE_NODE_FLAG: &str = "remote_node";
/// Property key carrying the composite id of the true remote target.
pub const REMOTE_NODE_ID: &str = "remote_node_id";

/// A continuation handed back to the orchestrator: the composite id of a
/// remote neighbour and the hop budget left when the frontier reached it.
pub type RemoteContinuation = (String, u32);

/// Engine tuning knobs.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// How long an unreleased visited set survives before lazy eviction.
    /// Release via `clear_visited` remains the contract; the TTL only bounds
    /// leaks from clients that never issue it.
    pub visited_ttl: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            visited_ttl: Duration::from_secs(600),
        }
    }
}

/// A node as returned to callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeView {
    pub node_id: NodeId,
    pub props: PropertyMap,
}

/// An edge as returned to callers, optionally with inflated endpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeView {
    pub id: EdgeId,
    pub fnid: NodeId,
    pub tnid: NodeId,
    pub props: PropertyMap,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_node: Option<NodeView>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_node: Option<NodeView>,
}

/// Where a new edge should point.
#[derive(Debug, Clone)]
pub enum EdgeTarget {
    /// A node on this shard.
    Local(NodeId),
    /// A node on another shard: a local placeholder node is created to keep
    /// the adjacency structure uniform, tagged with the composite id.
    Remote { id: String, props: PropertyMap },
}

/// Conjunction of typed predicate clauses over a property map.
///
/// The wire form is a mapping from clause name to operand; unknown clause
/// names are rejected during deserialization.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PropertyFilter {
    /// Keys that must be absent.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub negative_props: Vec<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub equal_props: BTreeMap<String, PropertyValue>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub not_equal_props: BTreeMap<String, PropertyValue>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub less_props: BTreeMap<String, PropertyValue>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub less_or_equal_props: BTreeMap<String, PropertyValue>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub greater_props: BTreeMap<String, PropertyValue>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub greater_or_equal_props: BTreeMap<String, PropertyValue>,
}

impl PropertyFilter {
    pub fn is_empty(&self) -> bool {
        self.negative_props.is_empty()
            && self.equal_props.is_empty()
            && self.not_equal_props.is_empty()
            && self.less_props.is_empty()
            && self.less_or_equal_props.is_empty()
            && self.greater_props.is_empty()
            && self.greater_or_equal_props.is_empty()
    }

    /// Evaluate the conjunction against a property map.
    ///
    /// An empty property map fails every predicate, including the empty one;
    /// callers that want "no filtering" must not call this at all.
    pub fn matches(&self, props: &PropertyMap) -> bool {
        if props.is_empty() {
            return false;
        }
        if self
            .negative_props
            .iter()
            .any(|key| props.contains_key(key))
        {
            return false;
        }
        if !self
            .not_equal_props
            .iter()
            .all(|(k, want)| props.get(k).map_or(false, |have| !values_equal(have, want)))
        {
            return false;
        }
        clause_holds(props, &self.equal_props, |o| o == Ordering::Equal)
            && clause_holds(props, &self.less_props, |o| o == Ordering::Less)
            && clause_holds(props, &self.less_or_equal_props, |o| o != Ordering::Greater)
            && clause_holds(props, &self.greater_props, |o| o == Ordering::Greater)
            && clause_holds(props, &self.greater_or_equal_props, |o| o != Ordering::Less)
    }
}

fn clause_holds(
    props: &PropertyMap,
    operands: &BTreeMap<String, PropertyValue>,
    accept: impl Fn(Ordering) -> bool,
) -> bool {
    operands.iter().all(|(key, want)| {
        props
            .get(key)
            .and_then(|have| compare_values(have, want))
            .map_or(false, &accept)
    })
}

/// Ordering between two property values. Numeric variants compare through
/// `f64`; any other cross-type pair is incomparable.
fn compare_values(a: &PropertyValue, b: &PropertyValue) -> Option<Ordering> {
    match (a, b) {
        (PropertyValue::Text(x), PropertyValue::Text(y)) => Some(x.cmp(y)),
        (PropertyValue::Bool(x), PropertyValue::Bool(y)) => Some(x.cmp(y)),
        _ => as_f64(a)?.partial_cmp(&as_f64(b)?),
    }
}

fn values_equal(a: &PropertyValue, b: &PropertyValue) -> bool {
    compare_values(a, b) == Some(Ordering::Equal)
}

fn as_f64(v: &PropertyValue) -> Option<f64> {
    match v {
        PropertyValue::Int(i) => Some(f64::from(*i)),
        PropertyValue::Uint(u) => Some(f64::from(*u)),
        PropertyValue::Float(f) => Some(f64::from(*f)),
        _ => None,
    }
}

/// The composite id of the true target when `props` belongs to a remote
/// placeholder node.
pub fn remote_target(props: &PropertyMap) -> Option<&str> {
    match (props.get(REMOTE_NODE_FLAG), props.get(REMOTE_NODE_ID)) {
        (Some(PropertyValue::Bool(true)), Some(PropertyValue::Text(id))) => Some(id),
        _ => None,
    }
}

struct VisitedEntry {
    nodes: HashSet<NodeId>,
    touched: Instant,
}

/// The per-shard graph engine.
pub struct GraphEngine {
    storage: GraphStorage,
    visited: Mutex<HashMap<String, VisitedEntry>>,
    visited_ttl: Duration,
}

impl GraphEngine {
    pub fn open(base: impl AsRef<Path>) -> Result<Self> {
        Self::with_config(base, EngineConfig::default())
    }

    pub fn with_config(base: impl AsRef<Path>, config: EngineConfig) -> Result<Self> {
        Ok(Self {
            storage: GraphStorage::open(base)?,
            visited: Mutex::new(HashMap::new()),
            visited_ttl: config.visited_ttl,
        })
    }

    /// Flush the underlying storage files.
    pub fn flush(&self) -> Result<()> {
        self.storage.flush()
    }

    // --- nodes ------------------------------------------------------------

    pub fn create_node(&mut self, props: PropertyMap) -> Result<NodeId> {
        self.storage.create_node(&props)
    }

    pub fn get_node(&self, node_id: NodeId) -> Result<Option<NodeView>> {
        Ok(self
            .storage
            .get_node(node_id)?
            .map(|props| NodeView { node_id, props }))
    }

    pub fn delete_node(&mut self, node_id: NodeId) -> Result<()> {
        self.storage.delete_node(node_id)
    }

    /// Scan all live nodes and keep the ones the filter accepts.
    pub fn find_nodes(&self, filter: &PropertyFilter) -> Result<Vec<NodeView>> {
        let mut matches = Vec::new();
        for node_id in self.storage.node_ids()? {
            let node_id = node_id?;
            if let Some(props) = self.storage.get_node(node_id)? {
                if filter.matches(&props) {
                    matches.push(NodeView { node_id, props });
                }
            }
        }
        Ok(matches)
    }

    // --- edges ------------------------------------------------------------

    /// Create an edge from `from` to a local or remote target.
    ///
    /// Edge properties are stored through an intermediate property node, so
    /// the storage codec stays uniform for nodes and edges. Returns `None`
    /// when an endpoint does not exist on this shard.
    pub fn create_edge(
        &mut self,
        from: NodeId,
        props: PropertyMap,
        target: EdgeTarget,
    ) -> Result<Option<EdgeId>> {
        if self.storage.get_node(from)?.is_none() {
            return Ok(None);
        }
        let to = match target {
            EdgeTarget::Local(to) => {
                if self.storage.get_node(to)?.is_none() {
                    return Ok(None);
                }
                to
            }
            EdgeTarget::Remote {
                id,
                props: mut remote_props,
            } => {
                remote_props.insert(REMOTE_NODE_ID.to_string(), PropertyValue::Text(id));
                remote_props.insert(REMOTE_NODE_FLAG.to_string(), PropertyValue::Bool(true));
                self.storage.create_node(&remote_props)?
            }
        };
        let props_node = self.storage.create_node(&props)?;
        let edge = self.storage.create_edge(from, to, props_node)?;
        Ok(Some(edge))
    }

    pub fn get_edge(
        &self,
        edge_id: EdgeId,
        with_from: bool,
        with_to: bool,
    ) -> Result<Option<EdgeView>> {
        let Some(record) = self.storage.get_edge(edge_id)? else {
            return Ok(None);
        };
        let from_node = if with_from {
            self.get_node(record.from)?
        } else {
            None
        };
        let to_node = if with_to {
            self.get_node(record.to)?
        } else {
            None
        };
        Ok(Some(EdgeView {
            id: edge_id,
            fnid: record.from,
            tnid: record.to,
            props: record.props,
            from_node,
            to_node,
        }))
    }

    pub fn delete_edge(&mut self, edge_id: EdgeId) -> Result<()> {
        self.storage.remove_edge(edge_id)
    }

    /// All edges leaving `node_id`, target endpoints inflated, optionally
    /// filtered on edge properties.
    pub fn get_edges_from(
        &self,
        node_id: NodeId,
        filter: Option<&PropertyFilter>,
    ) -> Result<Vec<EdgeView>> {
        if self.storage.get_node(node_id)?.is_none() {
            return Ok(Vec::new());
        }
        let mut matches = Vec::new();
        for edge_id in self.storage.edges_from(node_id)? {
            if let Some(edge) = self.get_edge(edge_id?, false, true)? {
                if filter.map_or(true, |f| f.matches(&edge.props)) {
                    matches.push(edge);
                }
            }
        }
        Ok(matches)
    }

    /// All edges arriving at `node_id`, source endpoints inflated.
    pub fn get_edges_to(
        &self,
        node_id: NodeId,
        filter: Option<&PropertyFilter>,
    ) -> Result<Vec<EdgeView>> {
        if self.storage.get_node(node_id)?.is_none() {
            return Ok(Vec::new());
        }
        let mut matches = Vec::new();
        for edge_id in self.storage.edges_to(node_id)? {
            if let Some(edge) = self.get_edge(edge_id?, true, false)? {
                if filter.map_or(true, |f| f.matches(&edge.props)) {
                    matches.push(edge);
                }
            }
        }
        Ok(matches)
    }

    /// Scan all live edges and keep the ones the filter accepts.
    pub fn find_edges(&self, filter: &PropertyFilter) -> Result<Vec<EdgeView>> {
        let mut matches = Vec::new();
        for edge_id in self.storage.edge_ids()? {
            if let Some(edge) = self.get_edge(edge_id?, false, false)? {
                if filter.matches(&edge.props) {
                    matches.push(edge);
                }
            }
        }
        Ok(matches)
    }

    // --- neighbourhood search --------------------------------------------

    /// Breadth-bounded search over outgoing edges from `start`.
    ///
    /// Returns the deduplicated local matches (the start node included) and
    /// a continuation per frontier edge whose target is a remote placeholder.
    /// The visited set is scoped by `query_id` and persists across calls
    /// until the orchestrator issues [`GraphEngine::clear_visited`].
    pub fn find_neighbours(
        &self,
        start: NodeId,
        hops: u32,
        query_id: &str,
        node_filter: Option<&PropertyFilter>,
        edge_filter: Option<&PropertyFilter>,
    ) -> Result<(Vec<NodeView>, Vec<RemoteContinuation>)> {
        if hops == 0 {
            return Ok((Vec::new(), Vec::new()));
        }
        let Some(start_node) = self.get_node(start)? else {
            return Ok((Vec::new(), Vec::new()));
        };

        self.mark_visited(query_id, start);
        let mut neighbours = vec![start_node];
        let mut remote_nodes = Vec::new();
        let mut queue = VecDeque::from([(start, hops)]);

        while let Some((current, hops_left)) = queue.pop_front() {
            if hops_left == 0 {
                break;
            }
            for edge in self.get_edges_from(current, edge_filter)? {
                let Some(target_node) = edge.to_node else {
                    continue;
                };
                if !self.mark_visited(query_id, edge.tnid) {
                    continue;
                }
                if let Some(filter) = node_filter {
                    if !filter.matches(&target_node.props) {
                        continue;
                    }
                }
                if let Some(remote_id) = remote_target(&target_node.props) {
                    remote_nodes.push((remote_id.to_string(), hops_left - 1));
                } else {
                    queue.push_back((edge.tnid, hops_left - 1));
                    neighbours.push(target_node);
                }
            }
        }

        debug!(
            start = %start,
            hops,
            query_id,
            matched = neighbours.len(),
            remote = remote_nodes.len(),
            "neighbourhood search finished"
        );
        Ok((neighbours, remote_nodes))
    }

    /// Release the visited set for a query id. Releasing an unknown id is a
    /// no-op.
    pub fn clear_visited(&self, query_id: &str) {
        self.visited.lock().remove(query_id);
    }

    /// Number of query ids currently holding visited state.
    pub fn visited_query_count(&self) -> usize {
        self.visited.lock().len()
    }

    /// Record `node_id` in the query's visited set, evicting sets whose TTL
    /// lapsed. Returns whether the node was newly marked.
    fn mark_visited(&self, query_id: &str, node_id: NodeId) -> bool {
        let mut visited = self.visited.lock();
        let now = Instant::now();
        let ttl = self.visited_ttl;
        visited.retain(|_, entry| now.duration_since(entry.touched) < ttl);

        let entry = visited
            .entry(query_id.to_string())
            .or_insert_with(|| VisitedEntry {
                nodes: HashSet::new(),
                touched: now,
            });
        entry.touched = now;
        entry.nodes.insert(node_id)
    }
}
