// Shardgraph - A Sharded Property-Graph Database
// Root library module

pub mod cluster;
pub mod graph_engine;
pub mod graph_storage;
pub mod http_server;
pub mod http_types;
pub mod mapped_file;
pub mod observability;
pub mod property_codec;
pub mod types;

// Re-export key types
pub use observability::{
    get_metrics, init_logging, init_logging_at, log_operation, record_metric, with_trace_id,
    LogLevel, MetricType, Operation,
};

pub use types::{EdgeId, NodeId, RemoteId};

pub use property_codec::{pack_record, read_record_at, CodecError, PropertyMap, PropertyValue};

pub use mapped_file::{MappedFile, FILE_UNIT};

pub use graph_storage::{AdjacencyWalk, Direction, EdgeRecord, GraphStorage, StorageError};

pub use graph_engine::{
    remote_target, EdgeTarget, EdgeView, EngineConfig, GraphEngine, NodeView, PropertyFilter,
    RemoteContinuation, REMOTE_NODE_FLAG, REMOTE_NODE_ID,
};

// Re-export the shard HTTP server
pub use http_server::{create_server, start_server};
pub use http_types::{AckResponse, ErrorKind, ErrorResponse};

// Re-export the multi-shard orchestrator
pub use cluster::{
    Cluster, ClusterConfig, ClusterEdge, ClusterError, ClusterNode, ClusterResult, PeerFailure,
};
