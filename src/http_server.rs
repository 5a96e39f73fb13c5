// HTTP REST API Server Implementation
// Exposes the per-shard graph engine operations as JSON endpoints

use anyhow::Result;
use axum::{
    extract::{DefaultBodyLimit, Query as AxumQuery, State},
    http::StatusCode,
    response::Json,
    routing::{delete, get, post, put},
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tokio::{net::TcpListener, sync::RwLock};
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};

use crate::graph_engine::{
    EdgeTarget, EdgeView, GraphEngine, NodeView, PropertyFilter, RemoteContinuation,
};
use crate::http_types::{AckResponse, ErrorResponse};
use crate::observability::{get_metrics, with_trace_id};
use crate::property_codec::PropertyMap;
use crate::types::{EdgeId, NodeId};

// Property payloads are small; this bound exists to reject junk early.
const MAX_REQUEST_SIZE: usize = 16 * 1024 * 1024; // 16MB

// Global server start time for uptime tracking
static SERVER_START_TIME: once_cell::sync::Lazy<Instant> = once_cell::sync::Lazy::new(Instant::now);

type HandlerError = (StatusCode, Json<ErrorResponse>);

/// Application state shared across handlers
///
/// The engine sits behind a reader-writer lock: readers may run together,
/// but writes must be exclusive because file growth remaps the region.
#[derive(Clone)]
pub struct AppState {
    engine: Arc<RwLock<GraphEngine>>,
}

/// Request body for node creation
#[derive(Debug, Deserialize)]
pub struct AddNodeRequest {
    pub props: PropertyMap,
}

/// Request body for edge creation. Exactly one of `to_node` and
/// `to_node_remote` must be supplied.
#[derive(Debug, Deserialize)]
pub struct AddEdgeRequest {
    pub props: PropertyMap,
    pub from_node: Option<u32>,
    pub to_node: Option<u32>,
    pub to_node_remote: Option<String>,
    #[serde(default)]
    pub remote_props: PropertyMap,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AddNodeResponse {
    pub node_id: NodeId,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GetNodeResponse {
    pub node: Option<NodeView>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AddEdgeResponse {
    pub edge_id: Option<EdgeId>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GetEdgeResponse {
    pub edge: Option<EdgeView>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct EdgesResponse {
    pub edges: Vec<EdgeView>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct NodesResponse {
    pub nodes: Vec<NodeView>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct NeighboursResponse {
    pub neighbours: Vec<NodeView>,
    pub remote_nodes: Vec<RemoteContinuation>,
}

/// Liveness probe response
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_seconds: u64,
}

/// Query parameters naming a node
#[derive(Debug, Deserialize)]
pub struct NodeIdParams {
    pub node_id: Option<u32>,
}

/// Query parameters naming an edge
#[derive(Debug, Deserialize)]
pub struct EdgeIdParams {
    pub edge_id: Option<u32>,
}

/// Query parameters for adjacency listings; `props` is a URL-encoded JSON
/// predicate document.
#[derive(Debug, Deserialize)]
pub struct EdgeListParams {
    pub node_id: Option<u32>,
    pub props: Option<String>,
}

/// Query parameters for whole-shard scans
#[derive(Debug, Deserialize)]
pub struct FindParams {
    pub props: Option<String>,
}

/// Query parameters for the bounded-hop neighbourhood search
#[derive(Debug, Deserialize)]
pub struct NeighbourParams {
    pub node_id: Option<u32>,
    pub hops: Option<u32>,
    pub query_id: Option<String>,
    pub node_props: Option<String>,
    pub edge_props: Option<String>,
}

/// Query parameters for visited-set release
#[derive(Debug, Deserialize)]
pub struct QueryIdParams {
    pub query_id: Option<String>,
}

/// Create the shard HTTP router with all routes configured
pub fn create_server(engine: Arc<RwLock<GraphEngine>>) -> Router {
    let state = AppState { engine };

    Router::new()
        .route("/ping", get(ping))
        .route("/addNode", post(add_node))
        .route("/getNode", get(get_node))
        .route("/deleteNode", delete(delete_node))
        .route("/addEdge", post(add_edge))
        .route("/getEdge", get(get_edge))
        .route("/deleteEdge", delete(delete_edge))
        .route("/getEdgesFrom", get(get_edges_from))
        .route("/getEdgesTo", get(get_edges_to))
        .route("/findNodes", get(find_nodes))
        .route("/findEdges", get(find_edges))
        .route("/findNeighbours", get(find_neighbours))
        .route("/clearVisitedNodes", put(clear_visited_nodes))
        // Monitoring
        .route("/metrics", get(metrics))
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(DefaultBodyLimit::max(MAX_REQUEST_SIZE))
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
}

/// Start the shard HTTP server on the specified port
pub async fn start_server(engine: Arc<RwLock<GraphEngine>>, port: u16) -> Result<()> {
    let app = create_server(engine);
    let listener = TcpListener::bind(&format!("0.0.0.0:{port}")).await?;

    info!("shardgraph shard server starting on port {}", port);
    axum::serve(listener, app).await?;

    Ok(())
}

fn bad_input(message: impl Into<String>) -> HandlerError {
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorResponse::bad_input(message)),
    )
}

/// Engine failures reaching a handler are invariant violations; bad input
/// and unknown ids were already dealt with by this point.
fn storage_error(e: anyhow::Error) -> HandlerError {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorResponse::invariant_violation(e.to_string())),
    )
}

/// Parse an optional predicate parameter. An absent or empty predicate means
/// "no filtering" for adjacency listings.
fn parse_optional_filter(raw: Option<&str>) -> Result<Option<PropertyFilter>, HandlerError> {
    match raw {
        None => Ok(None),
        Some(s) => match serde_json::from_str::<PropertyFilter>(s) {
            Ok(filter) if filter.is_empty() => Ok(None),
            Ok(filter) => Ok(Some(filter)),
            Err(e) => Err(bad_input(format!("invalid predicate: {e}"))),
        },
    }
}

/// Parse the predicate for whole-shard scans, where even the empty predicate
/// is applied (and so rejects records with no properties).
fn parse_scan_filter(raw: Option<&str>) -> Result<PropertyFilter, HandlerError> {
    match raw {
        None => Ok(PropertyFilter::default()),
        Some(s) => serde_json::from_str::<PropertyFilter>(s)
            .map_err(|e| bad_input(format!("invalid predicate: {e}"))),
    }
}

/// Counter snapshot for monitoring
async fn metrics() -> Json<serde_json::Value> {
    Json(get_metrics())
}

/// Liveness probe
async fn ping() -> Json<HealthResponse> {
    let uptime_seconds = SERVER_START_TIME.elapsed().as_secs();

    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds,
    })
}

/// Create a node from a property map
async fn add_node(
    State(state): State<AppState>,
    Json(request): Json<AddNodeRequest>,
) -> Result<Json<AddNodeResponse>, HandlerError> {
    if request.props.is_empty() {
        return Err(bad_input("no properties provided"));
    }

    let result = with_trace_id("add_node", async move {
        let mut engine = state.engine.write().await;
        engine.create_node(request.props)
    })
    .await;

    match result {
        Ok(node_id) => Ok(Json(AddNodeResponse { node_id })),
        Err(e) => {
            warn!("Failed to create node: {}", e);
            Err(storage_error(e))
        }
    }
}

/// Fetch a node by id; unknown ids answer with a null node
async fn get_node(
    State(state): State<AppState>,
    AxumQuery(params): AxumQuery<NodeIdParams>,
) -> Result<Json<GetNodeResponse>, HandlerError> {
    let Some(node_id) = params.node_id else {
        return Err(bad_input("node_id was not provided"));
    };

    let result = with_trace_id("get_node", async move {
        let engine = state.engine.read().await;
        engine.get_node(NodeId::new(node_id))
    })
    .await;

    match result {
        Ok(node) => Ok(Json(GetNodeResponse { node })),
        Err(e) => {
            warn!("Failed to get node {}: {}", node_id, e);
            Err(storage_error(e))
        }
    }
}

/// Delete a node; its edges are left in place
async fn delete_node(
    State(state): State<AppState>,
    AxumQuery(params): AxumQuery<NodeIdParams>,
) -> Result<Json<AckResponse>, HandlerError> {
    let Some(node_id) = params.node_id else {
        return Err(bad_input("node_id was not provided"));
    };

    let result = with_trace_id("delete_node", async move {
        let mut engine = state.engine.write().await;
        engine.delete_node(NodeId::new(node_id))
    })
    .await;

    match result {
        Ok(()) => Ok(Json(AckResponse::ok())),
        Err(e) => {
            warn!("Failed to delete node {}: {}", node_id, e);
            Err(storage_error(e))
        }
    }
}

/// Create an edge to a local node or to a remote placeholder
async fn add_edge(
    State(state): State<AppState>,
    Json(request): Json<AddEdgeRequest>,
) -> Result<Json<AddEdgeResponse>, HandlerError> {
    if request.props.is_empty() {
        return Err(bad_input("no properties provided"));
    }
    let Some(from_node) = request.from_node else {
        return Err(bad_input("from_node was not provided"));
    };

    let target = match (request.to_node, request.to_node_remote) {
        (Some(to), None) => EdgeTarget::Local(NodeId::new(to)),
        (None, Some(id)) => EdgeTarget::Remote {
            id,
            props: request.remote_props,
        },
        _ => {
            return Err(bad_input(
                "exactly one of to_node and to_node_remote must be provided",
            ));
        }
    };

    let result = with_trace_id("add_edge", async move {
        let mut engine = state.engine.write().await;
        engine.create_edge(NodeId::new(from_node), request.props, target)
    })
    .await;

    match result {
        Ok(edge_id) => Ok(Json(AddEdgeResponse { edge_id })),
        Err(e) => {
            warn!("Failed to create edge from {}: {}", from_node, e);
            Err(storage_error(e))
        }
    }
}

/// Fetch an edge by id with both endpoints inflated
async fn get_edge(
    State(state): State<AppState>,
    AxumQuery(params): AxumQuery<EdgeIdParams>,
) -> Result<Json<GetEdgeResponse>, HandlerError> {
    let Some(edge_id) = params.edge_id else {
        return Err(bad_input("edge_id was not provided"));
    };

    let result = with_trace_id("get_edge", async move {
        let engine = state.engine.read().await;
        engine.get_edge(EdgeId::new(edge_id), true, true)
    })
    .await;

    match result {
        Ok(edge) => Ok(Json(GetEdgeResponse { edge })),
        Err(e) => {
            warn!("Failed to get edge {}: {}", edge_id, e);
            Err(storage_error(e))
        }
    }
}

/// Unlink and tombstone an edge
async fn delete_edge(
    State(state): State<AppState>,
    AxumQuery(params): AxumQuery<EdgeIdParams>,
) -> Result<Json<AckResponse>, HandlerError> {
    let Some(edge_id) = params.edge_id else {
        return Err(bad_input("edge_id was not provided"));
    };

    let result = with_trace_id("delete_edge", async move {
        let mut engine = state.engine.write().await;
        engine.delete_edge(EdgeId::new(edge_id))
    })
    .await;

    match result {
        Ok(()) => Ok(Json(AckResponse::ok())),
        Err(e) => {
            warn!("Failed to delete edge {}: {}", edge_id, e);
            Err(storage_error(e))
        }
    }
}

/// Outgoing edges of a node, optionally filtered on edge properties
async fn get_edges_from(
    State(state): State<AppState>,
    AxumQuery(params): AxumQuery<EdgeListParams>,
) -> Result<Json<EdgesResponse>, HandlerError> {
    let Some(node_id) = params.node_id else {
        return Err(bad_input("node_id was not provided"));
    };
    let filter = parse_optional_filter(params.props.as_deref())?;

    let result = with_trace_id("get_edges_from", async move {
        let engine = state.engine.read().await;
        engine.get_edges_from(NodeId::new(node_id), filter.as_ref())
    })
    .await;

    match result {
        Ok(edges) => Ok(Json(EdgesResponse { edges })),
        Err(e) => {
            warn!("Failed to list edges from {}: {}", node_id, e);
            Err(storage_error(e))
        }
    }
}

/// Incoming edges of a node, optionally filtered on edge properties
async fn get_edges_to(
    State(state): State<AppState>,
    AxumQuery(params): AxumQuery<EdgeListParams>,
) -> Result<Json<EdgesResponse>, HandlerError> {
    let Some(node_id) = params.node_id else {
        return Err(bad_input("node_id was not provided"));
    };
    let filter = parse_optional_filter(params.props.as_deref())?;

    let result = with_trace_id("get_edges_to", async move {
        let engine = state.engine.read().await;
        engine.get_edges_to(NodeId::new(node_id), filter.as_ref())
    })
    .await;

    match result {
        Ok(edges) => Ok(Json(EdgesResponse { edges })),
        Err(e) => {
            warn!("Failed to list edges to {}: {}", node_id, e);
            Err(storage_error(e))
        }
    }
}

/// Scan all live nodes for predicate matches
async fn find_nodes(
    State(state): State<AppState>,
    AxumQuery(params): AxumQuery<FindParams>,
) -> Result<Json<NodesResponse>, HandlerError> {
    let filter = parse_scan_filter(params.props.as_deref())?;

    let result = with_trace_id("find_nodes", async move {
        let engine = state.engine.read().await;
        engine.find_nodes(&filter)
    })
    .await;

    match result {
        Ok(nodes) => Ok(Json(NodesResponse { nodes })),
        Err(e) => {
            warn!("Failed to scan nodes: {}", e);
            Err(storage_error(e))
        }
    }
}

/// Scan all live edges for predicate matches
async fn find_edges(
    State(state): State<AppState>,
    AxumQuery(params): AxumQuery<FindParams>,
) -> Result<Json<EdgesResponse>, HandlerError> {
    let filter = parse_scan_filter(params.props.as_deref())?;

    let result = with_trace_id("find_edges", async move {
        let engine = state.engine.read().await;
        engine.find_edges(&filter)
    })
    .await;

    match result {
        Ok(edges) => Ok(Json(EdgesResponse { edges })),
        Err(e) => {
            warn!("Failed to scan edges: {}", e);
            Err(storage_error(e))
        }
    }
}

/// Bounded-hop neighbourhood search over outgoing edges
async fn find_neighbours(
    State(state): State<AppState>,
    AxumQuery(params): AxumQuery<NeighbourParams>,
) -> Result<Json<NeighboursResponse>, HandlerError> {
    let Some(node_id) = params.node_id else {
        return Err(bad_input("node_id was not provided"));
    };
    let query_id = match params.query_id {
        Some(ref q) if !q.is_empty() => q.clone(),
        _ => return Err(bad_input("query_id was not provided")),
    };
    let hops = params.hops.unwrap_or(0);
    let node_filter = parse_optional_filter(params.node_props.as_deref())?;
    let edge_filter = parse_optional_filter(params.edge_props.as_deref())?;

    let result = with_trace_id("find_neighbours", async move {
        let engine = state.engine.read().await;
        engine.find_neighbours(
            NodeId::new(node_id),
            hops,
            &query_id,
            node_filter.as_ref(),
            edge_filter.as_ref(),
        )
    })
    .await;

    match result {
        Ok((neighbours, remote_nodes)) => Ok(Json(NeighboursResponse {
            neighbours,
            remote_nodes,
        })),
        Err(e) => {
            warn!("Failed neighbourhood search from {}: {}", node_id, e);
            Err(storage_error(e))
        }
    }
}

/// Release the visited set held for a query id
async fn clear_visited_nodes(
    State(state): State<AppState>,
    AxumQuery(params): AxumQuery<QueryIdParams>,
) -> Result<Json<AckResponse>, HandlerError> {
    let query_id = match params.query_id {
        Some(ref q) if !q.is_empty() => q.clone(),
        _ => return Err(bad_input("query_id was not provided")),
    };

    let engine = state.engine.read().await;
    engine.clear_visited(&query_id);
    Ok(Json(AckResponse::ok()))
}
