// Identifier types for nodes, edges and cross-shard references.
// These are thin validated wrappers: the raw representation is part of the
// on-disk format (32-bit big-endian), so the newtypes stay transparent for
// serde while keeping the sentinel handling in one place.

use anyhow::{ensure, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a node within a single shard.
///
/// Allocated monotonically from 1; `0` is the sentinel meaning "none" and is
/// never handed out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(u32);

impl NodeId {
    /// The reserved sentinel id.
    pub const NONE: NodeId = NodeId(0);

    pub fn new(raw: u32) -> Self {
        Self(raw)
    }

    pub fn as_u32(&self) -> u32 {
        self.0
    }

    pub fn is_none(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of an edge within a single shard. Same allocation and sentinel
/// rules as [`NodeId`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EdgeId(u32);

impl EdgeId {
    pub const NONE: EdgeId = EdgeId(0);

    pub fn new(raw: u32) -> Self {
        Self(raw)
    }

    pub fn as_u32(&self) -> u32 {
        self.0
    }

    pub fn is_none(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for EdgeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A cross-shard identifier of the form `<endpoint>$<local-id>`.
///
/// The endpoint is the base URL of the shard that owns the record; the local
/// part is the shard-scoped numeric id. The same composite form is used for
/// node and edge ids, so the local part is kept raw and converted through
/// [`RemoteId::node_id`] / [`RemoteId::edge_id`] at the call site.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RemoteId {
    endpoint: String,
    local: u32,
}

impl RemoteId {
    pub fn new(endpoint: impl Into<String>, local: u32) -> Self {
        Self {
            endpoint: endpoint.into(),
            local,
        }
    }

    /// Parse a composite id. The local part is everything after the last `$`,
    /// which keeps endpoint URLs free to contain any other character.
    pub fn parse(s: &str) -> Result<Self> {
        let (endpoint, local) = s
            .rsplit_once('$')
            .ok_or_else(|| anyhow::anyhow!("composite id {s:?} is missing the '$' separator"))?;
        ensure!(
            !endpoint.is_empty(),
            "composite id {s:?} has an empty endpoint"
        );
        let local = local
            .parse::<u32>()
            .map_err(|_| anyhow::anyhow!("composite id {s:?} has a non-numeric local part"))?;
        Ok(Self {
            endpoint: endpoint.to_string(),
            local,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn local(&self) -> u32 {
        self.local
    }

    pub fn node_id(&self) -> NodeId {
        NodeId::new(self.local)
    }

    pub fn edge_id(&self) -> EdgeId {
        EdgeId::new(self.local)
    }
}

impl fmt::Display for RemoteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}${}", self.endpoint, self.local)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sentinel_ids() {
        assert!(NodeId::NONE.is_none());
        assert!(EdgeId::NONE.is_none());
        assert!(!NodeId::new(1).is_none());
    }

    #[test]
    fn test_remote_id_roundtrip() {
        let id = RemoteId::parse("http://localhost:8081$42").unwrap();
        assert_eq!(id.endpoint(), "http://localhost:8081");
        assert_eq!(id.local(), 42);
        assert_eq!(id.to_string(), "http://localhost:8081$42");
    }

    #[test]
    fn test_remote_id_rejects_malformed_input() {
        assert!(RemoteId::parse("no-separator").is_err());
        assert!(RemoteId::parse("$7").is_err());
        assert!(RemoteId::parse("http://host$abc").is_err());
    }

    #[test]
    fn test_node_id_serializes_as_bare_number() {
        let json = serde_json::to_string(&NodeId::new(7)).unwrap();
        assert_eq!(json, "7");
        let back: NodeId = serde_json::from_str("7").unwrap();
        assert_eq!(back, NodeId::new(7));
    }
}
