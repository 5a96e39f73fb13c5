//! Multi-shard orchestrator
//!
//! Composes shard servers behind the composite `<endpoint>$<local-id>`
//! namespace: routes single-record operations to the owning shard, fans
//! whole-graph scans out to every worker in parallel, and drives the
//! multi-shard neighbourhood traversal by following remote continuations
//! until no frontier remains.

use futures::future::join_all;
use rand::Rng;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

use crate::graph_engine::{remote_target, EdgeView, PropertyFilter, RemoteContinuation};
use crate::http_server::{
    AddEdgeResponse, AddNodeResponse, EdgesResponse, GetEdgeResponse, GetNodeResponse,
    NeighboursResponse, NodesResponse,
};
use crate::property_codec::PropertyMap;
use crate::types::RemoteId;

/// What to do when a shard RPC fails during a fan-out read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerFailure {
    /// Log the failure and merge the partial result (reference behaviour).
    DropContribution,
    /// Surface the first peer error to the caller.
    Fail,
}

/// Orchestrator tuning knobs.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// How many randomly-placed attempts `add_node` makes before giving up.
    pub placement_attempts: usize,
    /// Partial-result policy for fan-out reads.
    pub peer_failure: PeerFailure,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            placement_attempts: 3,
            peer_failure: PeerFailure::DropContribution,
        }
    }
}

/// Typed orchestrator errors.
#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("no graph workers alive")]
    NoWorkersAlive,
    #[error("worker {worker} is not part of this cluster")]
    UnknownWorker { worker: String },
    #[error("could not place node after {attempts} attempts")]
    PlacementFailed { attempts: usize },
    #[error("worker {worker} could not create the edge (missing endpoint)")]
    EdgeCreationFailed { worker: String },
    #[error("worker {worker} request failed: {source}")]
    PeerUnreachable {
        worker: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("worker {worker} rejected {path} with status {status}")]
    PeerRejected {
        worker: String,
        path: String,
        status: StatusCode,
    },
    #[error("invalid composite id {0:?}")]
    BadCompositeId(String),
}

pub type ClusterResult<T> = Result<T, ClusterError>;

/// A node with its id in composite form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterNode {
    pub node_id: String,
    pub props: PropertyMap,
}

/// An edge with all ids in composite form and endpoints inflated where the
/// shard inflated them. A remote placeholder target is chased to its home
/// shard, so `to_node` carries the real record when it is reachable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterEdge {
    pub id: String,
    pub fnid: String,
    pub tnid: String,
    pub props: PropertyMap,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_node: Option<ClusterNode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_node: Option<ClusterNode>,
}

/// Client for a set of shard servers.
pub struct Cluster {
    client: Client,
    workers: Vec<String>,
    config: ClusterConfig,
}

impl Cluster {
    /// Probe every endpoint and keep the ones that answer the liveness
    /// check. Fails only when no worker is alive.
    pub async fn connect(endpoints: Vec<String>, config: ClusterConfig) -> ClusterResult<Self> {
        let client = Client::new();

        let probes = endpoints.into_iter().map(|worker| {
            let client = client.clone();
            async move {
                match client.get(format!("{worker}/ping")).send().await {
                    Ok(resp) if resp.status() == StatusCode::OK => Some(worker),
                    Ok(resp) => {
                        warn!("worker {} failed liveness probe: {}", worker, resp.status());
                        None
                    }
                    Err(e) => {
                        warn!("worker {} did not respond: {}", worker, e);
                        None
                    }
                }
            }
        });

        let workers: Vec<String> = join_all(probes).await.into_iter().flatten().collect();
        if workers.is_empty() {
            return Err(ClusterError::NoWorkersAlive);
        }
        Ok(Self {
            client,
            workers,
            config,
        })
    }

    /// Endpoints that answered the liveness probe at connect time.
    pub fn workers(&self) -> &[String] {
        &self.workers
    }

    fn has_worker(&self, endpoint: &str) -> bool {
        self.workers.iter().any(|w| w == endpoint)
    }

    fn parse_id(&self, id: &str) -> ClusterResult<RemoteId> {
        RemoteId::parse(id).map_err(|_| ClusterError::BadCompositeId(id.to_string()))
    }

    // --- node operations --------------------------------------------------

    /// Place a node on a uniformly random worker, retrying up to the
    /// configured attempt budget.
    pub async fn add_node(&self, props: &PropertyMap) -> ClusterResult<String> {
        for _ in 0..self.config.placement_attempts {
            let worker = {
                let idx = rand::thread_rng().gen_range(0..self.workers.len());
                self.workers[idx].clone()
            };

            let response = self
                .client
                .post(format!("{worker}/addNode"))
                .json(&serde_json::json!({ "props": props }))
                .send()
                .await;

            match response {
                Ok(resp) if resp.status() == StatusCode::OK => {
                    match resp.json::<AddNodeResponse>().await {
                        Ok(body) => return Ok(format!("{worker}${}", body.node_id)),
                        Err(e) => warn!("could not decode addNode response from {}: {}", worker, e),
                    }
                }
                Ok(resp) => warn!("could not add node to {}: {}", worker, resp.status()),
                Err(e) => warn!("could not add node to {}: {}", worker, e),
            }
        }
        Err(ClusterError::PlacementFailed {
            attempts: self.config.placement_attempts,
        })
    }

    /// Fetch a node by composite id. An endpoint unknown to this cluster
    /// yields a null lookup, not an error.
    pub async fn get_node(&self, node_id: &str) -> ClusterResult<Option<ClusterNode>> {
        let remote = self.parse_id(node_id)?;
        if !self.has_worker(remote.endpoint()) {
            return Ok(None);
        }
        let worker = remote.endpoint();

        let body: GetNodeResponse = self
            .get_json(
                worker,
                "/getNode",
                &[("node_id", remote.local().to_string())],
            )
            .await?;
        Ok(body.node.map(|node| ClusterNode {
            node_id: format!("{worker}${}", node.node_id),
            props: node.props,
        }))
    }

    /// Delete a node by composite id. Unknown endpoints are a no-op.
    pub async fn delete_node(&self, node_id: &str) -> ClusterResult<()> {
        let remote = self.parse_id(node_id)?;
        if !self.has_worker(remote.endpoint()) {
            return Ok(());
        }
        self.delete_checked(
            remote.endpoint(),
            "/deleteNode",
            &[("node_id", remote.local().to_string())],
        )
        .await
    }

    // --- edge operations --------------------------------------------------

    /// Create an edge between two composite ids. The edge lives on the
    /// `from` shard; a cross-shard target is carried as a remote placeholder
    /// there.
    pub async fn add_edge(
        &self,
        from_node: &str,
        to_node: &str,
        props: &PropertyMap,
    ) -> ClusterResult<String> {
        let from = self.parse_id(from_node)?;
        let to = self.parse_id(to_node)?;
        for endpoint in [from.endpoint(), to.endpoint()] {
            if !self.has_worker(endpoint) {
                return Err(ClusterError::UnknownWorker {
                    worker: endpoint.to_string(),
                });
            }
        }

        let worker = from.endpoint();
        let mut body = serde_json::json!({
            "props": props,
            "from_node": from.local(),
        });
        if from.endpoint() == to.endpoint() {
            body["to_node"] = to.local().into();
        } else {
            body["to_node_remote"] = to_node.into();
        }

        let response = self
            .client
            .post(format!("{worker}/addEdge"))
            .json(&body)
            .send()
            .await
            .map_err(|e| self.unreachable(worker, e))?;
        if response.status() != StatusCode::OK {
            return Err(ClusterError::PeerRejected {
                worker: worker.to_string(),
                path: "/addEdge".to_string(),
                status: response.status(),
            });
        }

        let body: AddEdgeResponse = response
            .json()
            .await
            .map_err(|e| self.unreachable(worker, e))?;
        match body.edge_id {
            Some(edge_id) => Ok(format!("{worker}${edge_id}")),
            None => Err(ClusterError::EdgeCreationFailed {
                worker: worker.to_string(),
            }),
        }
    }

    /// Fetch an edge by composite id with both endpoints inflated.
    pub async fn get_edge(&self, edge_id: &str) -> ClusterResult<Option<ClusterEdge>> {
        let remote = self.parse_id(edge_id)?;
        if !self.has_worker(remote.endpoint()) {
            return Ok(None);
        }
        let worker = remote.endpoint();

        let body: GetEdgeResponse = self
            .get_json(
                worker,
                "/getEdge",
                &[("edge_id", remote.local().to_string())],
            )
            .await?;
        match body.edge {
            Some(edge) => Ok(Some(self.rewrite_edge(edge, worker).await?)),
            None => Ok(None),
        }
    }

    /// Delete an edge by composite id. Unknown endpoints are a no-op.
    pub async fn delete_edge(&self, edge_id: &str) -> ClusterResult<()> {
        let remote = self.parse_id(edge_id)?;
        if !self.has_worker(remote.endpoint()) {
            return Ok(());
        }
        self.delete_checked(
            remote.endpoint(),
            "/deleteEdge",
            &[("edge_id", remote.local().to_string())],
        )
        .await
    }

    /// Outgoing edges of a node, optionally filtered on edge properties.
    pub async fn get_edges_from(
        &self,
        node_id: &str,
        filter: Option<&PropertyFilter>,
    ) -> ClusterResult<Vec<ClusterEdge>> {
        self.adjacent_edges(node_id, filter, "/getEdgesFrom").await
    }

    /// Incoming edges of a node, optionally filtered on edge properties.
    pub async fn get_edges_to(
        &self,
        node_id: &str,
        filter: Option<&PropertyFilter>,
    ) -> ClusterResult<Vec<ClusterEdge>> {
        self.adjacent_edges(node_id, filter, "/getEdgesTo").await
    }

    async fn adjacent_edges(
        &self,
        node_id: &str,
        filter: Option<&PropertyFilter>,
        path: &'static str,
    ) -> ClusterResult<Vec<ClusterEdge>> {
        let remote = self.parse_id(node_id)?;
        if !self.has_worker(remote.endpoint()) {
            return Ok(Vec::new());
        }
        let worker = remote.endpoint();

        let mut query = vec![("node_id", remote.local().to_string())];
        if let Some(filter) = filter {
            query.push(("props", encode_filter(filter)));
        }

        let body: EdgesResponse = self.get_json(worker, path, &query).await?;
        let mut edges = Vec::with_capacity(body.edges.len());
        for edge in body.edges {
            edges.push(self.rewrite_edge(edge, worker).await?);
        }
        Ok(edges)
    }

    // --- fan-out scans ----------------------------------------------------

    /// Scan every worker for nodes matching the predicate and merge the
    /// contributions. Peer failures follow the configured policy.
    pub async fn find_nodes(&self, filter: &PropertyFilter) -> ClusterResult<Vec<ClusterNode>> {
        let encoded = encode_filter(filter);
        let scans = self.workers.iter().map(|worker| {
            let encoded = encoded.clone();
            async move {
                let body: NodesResponse = self
                    .get_json(worker, "/findNodes", &[("props", encoded)])
                    .await?;
                let nodes = body
                    .nodes
                    .into_iter()
                    .map(|node| ClusterNode {
                        node_id: format!("{worker}${}", node.node_id),
                        props: node.props,
                    })
                    .collect::<Vec<_>>();
                Ok::<_, ClusterError>(nodes)
            }
        });

        let mut merged = Vec::new();
        for result in join_all(scans).await {
            match result {
                Ok(mut nodes) => merged.append(&mut nodes),
                Err(e) => self.handle_peer_failure(e)?,
            }
        }
        Ok(merged)
    }

    /// Scan every worker for edges matching the predicate.
    pub async fn find_edges(&self, filter: &PropertyFilter) -> ClusterResult<Vec<ClusterEdge>> {
        let encoded = encode_filter(filter);
        let scans = self.workers.iter().map(|worker| {
            let encoded = encoded.clone();
            async move {
                let body: EdgesResponse = self
                    .get_json(worker, "/findEdges", &[("props", encoded)])
                    .await?;
                Ok::<_, ClusterError>((worker.as_str(), body.edges))
            }
        });

        let mut merged = Vec::new();
        for result in join_all(scans).await {
            match result {
                Ok((worker, edges)) => {
                    for edge in edges {
                        merged.push(self.rewrite_edge(edge, worker).await?);
                    }
                }
                Err(e) => self.handle_peer_failure(e)?,
            }
        }
        Ok(merged)
    }

    // --- multi-shard traversal -------------------------------------------

    /// Bounded-hop neighbourhood search across the whole cluster.
    ///
    /// Generates a fresh query id, repeatedly fans the per-shard search out
    /// over the remote continuations, deduplicates by composite id, and
    /// releases the visited state on every worker before returning.
    pub async fn find_neighbours(
        &self,
        start: &str,
        hops: u32,
        node_filter: Option<&PropertyFilter>,
        edge_filter: Option<&PropertyFilter>,
    ) -> ClusterResult<Vec<ClusterNode>> {
        let query_id = Uuid::new_v4().simple().to_string();
        let mut frontier = vec![(start.to_string(), hops)];
        let mut collected: HashMap<String, ClusterNode> = HashMap::new();

        while !frontier.is_empty() {
            let round = join_all(frontier.iter().map(|(node_id, hops_left)| {
                self.shard_neighbours(node_id, *hops_left, &query_id, node_filter, edge_filter)
            }))
            .await;

            frontier = Vec::new();
            for result in round {
                let (neighbours, remote_nodes) = match result {
                    Ok(contribution) => contribution,
                    Err(e) => {
                        if self.config.peer_failure == PeerFailure::Fail {
                            self.clear_visited(&query_id).await;
                            return Err(e);
                        }
                        warn!("dropping neighbourhood contribution: {}", e);
                        continue;
                    }
                };

                for node in neighbours {
                    collected.insert(node.node_id.clone(), node);
                }
                for (remote_id, hops_left) in remote_nodes {
                    if collected.contains_key(&remote_id) {
                        continue;
                    }
                    match self.get_node(&remote_id).await {
                        Ok(Some(node)) => {
                            collected.insert(remote_id.clone(), node);
                        }
                        Ok(None) => {}
                        Err(e) => {
                            if self.config.peer_failure == PeerFailure::Fail {
                                self.clear_visited(&query_id).await;
                                return Err(e);
                            }
                            warn!("dropping remote neighbour {}: {}", remote_id, e);
                            continue;
                        }
                    }
                    if hops_left > 0 {
                        frontier.push((remote_id, hops_left));
                    }
                }
            }
        }

        self.clear_visited(&query_id).await;
        Ok(collected.into_values().collect())
    }

    async fn shard_neighbours(
        &self,
        node_id: &str,
        hops: u32,
        query_id: &str,
        node_filter: Option<&PropertyFilter>,
        edge_filter: Option<&PropertyFilter>,
    ) -> ClusterResult<(Vec<ClusterNode>, Vec<RemoteContinuation>)> {
        let remote = self.parse_id(node_id)?;
        if !self.has_worker(remote.endpoint()) {
            return Ok((Vec::new(), Vec::new()));
        }
        let worker = remote.endpoint();

        let mut query = vec![
            ("node_id", remote.local().to_string()),
            ("hops", hops.to_string()),
            ("query_id", query_id.to_string()),
        ];
        if let Some(filter) = node_filter {
            query.push(("node_props", encode_filter(filter)));
        }
        if let Some(filter) = edge_filter {
            query.push(("edge_props", encode_filter(filter)));
        }

        let body: NeighboursResponse = self.get_json(worker, "/findNeighbours", &query).await?;
        let neighbours = body
            .neighbours
            .into_iter()
            .map(|node| ClusterNode {
                node_id: format!("{worker}${}", node.node_id),
                props: node.props,
            })
            .collect();
        Ok((neighbours, body.remote_nodes))
    }

    /// Release the visited state for a query id on every worker. Failures
    /// are logged; there is nothing useful to do about them here.
    async fn clear_visited(&self, query_id: &str) {
        let releases = self.workers.iter().map(|worker| async move {
            let result = self
                .client
                .put(format!("{worker}/clearVisitedNodes"))
                .query(&[("query_id", query_id)])
                .send()
                .await;
            match result {
                Ok(resp) if resp.status() == StatusCode::OK => {}
                Ok(resp) => warn!(
                    "could not clear visited nodes on {}: {}",
                    worker,
                    resp.status()
                ),
                Err(e) => warn!("could not clear visited nodes on {}: {}", worker, e),
            }
        });
        join_all(releases).await;
    }

    // --- plumbing ---------------------------------------------------------

    /// Rewrite a shard-local edge into composite form, chasing a remote
    /// placeholder target to its home shard.
    async fn rewrite_edge(&self, edge: EdgeView, worker: &str) -> ClusterResult<ClusterEdge> {
        let id = format!("{worker}${}", edge.id);
        let fnid = format!("{worker}${}", edge.fnid);
        let from_node = edge.from_node.map(|node| ClusterNode {
            node_id: format!("{worker}${}", node.node_id),
            props: node.props,
        });

        let (tnid, to_node) = match edge.to_node {
            Some(node) => {
                if let Some(remote_id) = remote_target(&node.props) {
                    let remote_id = remote_id.to_string();
                    let resolved = self.get_node(&remote_id).await?;
                    (remote_id, resolved)
                } else {
                    let composite = format!("{worker}${}", node.node_id);
                    (
                        composite.clone(),
                        Some(ClusterNode {
                            node_id: composite,
                            props: node.props,
                        }),
                    )
                }
            }
            None => (format!("{worker}${}", edge.tnid), None),
        };

        Ok(ClusterEdge {
            id,
            fnid,
            tnid,
            props: edge.props,
            from_node,
            to_node,
        })
    }

    fn handle_peer_failure(&self, e: ClusterError) -> ClusterResult<()> {
        match self.config.peer_failure {
            PeerFailure::Fail => Err(e),
            PeerFailure::DropContribution => {
                warn!("dropping shard contribution: {}", e);
                Ok(())
            }
        }
    }

    fn unreachable(&self, worker: &str, source: reqwest::Error) -> ClusterError {
        ClusterError::PeerUnreachable {
            worker: worker.to_string(),
            source,
        }
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        worker: &str,
        path: &'static str,
        query: &[(&str, String)],
    ) -> ClusterResult<T> {
        let response = self
            .client
            .get(format!("{worker}{path}"))
            .query(query)
            .send()
            .await
            .map_err(|e| self.unreachable(worker, e))?;
        if response.status() != StatusCode::OK {
            return Err(ClusterError::PeerRejected {
                worker: worker.to_string(),
                path: path.to_string(),
                status: response.status(),
            });
        }
        response.json().await.map_err(|e| self.unreachable(worker, e))
    }

    async fn delete_checked(
        &self,
        worker: &str,
        path: &'static str,
        query: &[(&str, String)],
    ) -> ClusterResult<()> {
        let response = self
            .client
            .delete(format!("{worker}{path}"))
            .query(query)
            .send()
            .await
            .map_err(|e| self.unreachable(worker, e))?;
        if response.status() != StatusCode::OK {
            return Err(ClusterError::PeerRejected {
                worker: worker.to_string(),
                path: path.to_string(),
                status: response.status(),
            });
        }
        Ok(())
    }
}

fn encode_filter(filter: &PropertyFilter) -> String {
    serde_json::to_string(filter).unwrap_or_else(|_| "{}".to_string())
}
