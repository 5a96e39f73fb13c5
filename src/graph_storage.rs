//! Single-shard graph storage engine
//!
//! Persists nodes and edges across three memory-mapped files:
//!
//! - `<base>.properties` — variable-length property records, append-mostly
//! - `<base>.node_ids` — fixed 12-byte slots: property-record address plus
//!   the heads of the outgoing and incoming adjacency lists
//! - `<base>.edges` — fixed 28-byte slots: endpoints, the four doubly-linked
//!   sibling pointers, and the property-record address
//!
//! Each file starts with a 4-byte big-endian counter allocating the next id
//! (or next free property address). Id `0` is the sentinel for "none", so
//! slot 0 of the fixed-size files is never used and the counter can live
//! inside it. Records and slots are never reclaimed: deletion zeroes the
//! slot entry and leaves the bytes behind.

use anyhow::Result;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

use crate::mapped_file::MappedFile;
use crate::property_codec::{pack_record, read_record_at, PropertyMap};
use crate::types::{EdgeId, NodeId};

const SIZE_U32: usize = 4;
const NODE_SLOT_SIZE: usize = 3 * SIZE_U32;
const EDGE_SLOT_SIZE: usize = 7 * SIZE_U32;

/// First id handed out by the node and edge counters.
const FIRST_ID: u32 = 1;
/// First free property address: just past the 4-byte allocation header.
const FIRST_PROPERTY_ADDR: u32 = SIZE_U32 as u32;

// Edge slot field indices, each field a big-endian u32.
const F_FROM: usize = 0;
const F_TO: usize = 1;
const F_PREV_OUT: usize = 2;
const F_NEXT_OUT: usize = 3;
const F_PREV_IN: usize = 4;
const F_NEXT_IN: usize = 5;
const F_PROPS: usize = 6;

const PROPERTIES_FILE: &str = "properties";
const NODE_IDS_FILE: &str = "node_ids";
const EDGES_FILE: &str = "edges";

/// Fatal invariant violations raised by the storage layer.
///
/// These are never retried or converted downward: a slot the engine itself
/// allocated must stay readable, and an adjacency list must terminate.
/// Codec failures ([`crate::property_codec::CodecError`]) sit in the same
/// taxonomy and propagate alongside these.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("read past end of {file} (offset {offset}, wanted {wanted} bytes)")]
    ShortRead {
        file: &'static str,
        offset: usize,
        wanted: usize,
    },
    #[error("adjacency walk from node {0} did not terminate")]
    UnterminatedWalk(NodeId),
}

/// Which adjacency list of a node to follow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Outgoing,
    Incoming,
}

/// A decoded edge slot together with its property map.
#[derive(Debug, Clone, PartialEq)]
pub struct EdgeRecord {
    pub id: EdgeId,
    pub from: NodeId,
    pub to: NodeId,
    pub props: PropertyMap,
}

/// The memory-mapped storage engine for one shard.
///
/// Single-writer: all mutating methods take `&mut self`, and callers must
/// also exclude readers during writes because growth remaps the region and
/// list splicing transiently leaves the siblings inconsistent.
pub struct GraphStorage {
    properties: MappedFile,
    node_ids: MappedFile,
    edges: MappedFile,
}

impl GraphStorage {
    /// Open (or create) the three storage files sharing the prefix `base`.
    pub fn open(base: impl AsRef<Path>) -> Result<Self> {
        let base = base.as_ref();
        let (properties, fresh_properties) = MappedFile::open(storage_path(base, PROPERTIES_FILE))?;
        let (node_ids, fresh_nodes) = MappedFile::open(storage_path(base, NODE_IDS_FILE))?;
        let (edges, fresh_edges) = MappedFile::open(storage_path(base, EDGES_FILE))?;

        let mut storage = Self {
            properties,
            node_ids,
            edges,
        };

        if fresh_properties || fresh_nodes || fresh_edges {
            storage.set_free_addr(FIRST_PROPERTY_ADDR)?;
            storage.set_next_node_id(FIRST_ID)?;
            storage.set_next_edge_id(FIRST_ID)?;
            debug!(base = %base.display(), "initialised empty graph store");
        }

        Ok(storage)
    }

    /// Flush all three mapped regions back to their files.
    pub fn flush(&self) -> Result<()> {
        self.properties.flush()?;
        self.node_ids.flush()?;
        self.edges.flush()
    }

    // --- allocation counters ---------------------------------------------

    fn next_free_addr(&self) -> Result<u32> {
        read_u32(&self.properties, PROPERTIES_FILE, 0)
    }

    fn set_free_addr(&mut self, addr: u32) -> Result<()> {
        self.properties.write_at(0, &addr.to_be_bytes())
    }

    fn next_node_id(&self) -> Result<u32> {
        read_u32(&self.node_ids, NODE_IDS_FILE, 0)
    }

    fn set_next_node_id(&mut self, id: u32) -> Result<()> {
        self.node_ids.write_at(0, &id.to_be_bytes())
    }

    fn next_edge_id(&self) -> Result<u32> {
        read_u32(&self.edges, EDGES_FILE, 0)
    }

    fn set_next_edge_id(&mut self, id: u32) -> Result<()> {
        self.edges.write_at(0, &id.to_be_bytes())
    }

    // --- node operations --------------------------------------------------

    /// Append a property record and claim a fresh node slot for it.
    pub fn create_node(&mut self, props: &PropertyMap) -> Result<NodeId> {
        let raw = self.next_node_id()?;
        let nid = NodeId::new(raw);
        let addr = self.next_free_addr()?;

        let packed = pack_record(props);
        self.properties.write_at(addr as usize, &packed)?;
        self.set_free_addr(addr + packed.len() as u32)?;
        self.set_next_node_id(raw + 1)?;

        self.write_node_slot(nid, addr, EdgeId::NONE, EdgeId::NONE)?;
        Ok(nid)
    }

    /// Fetch a node's property map, or `None` for unknown or deleted ids.
    pub fn get_node(&self, nid: NodeId) -> Result<Option<PropertyMap>> {
        if nid.is_none() || nid.as_u32() >= self.next_node_id()? {
            return Ok(None);
        }
        let addr = self.node_prop_addr(nid)?;
        if addr == 0 {
            return Ok(None);
        }
        let (props, _) = read_record_at(self.properties.bytes(), addr as usize)?;
        Ok(Some(props))
    }

    /// Replace a node's properties. Overwrites in place when the packed
    /// length is unchanged, otherwise appends a fresh record and redirects
    /// the slot, abandoning the old bytes. Returns `false` for unknown ids.
    pub fn update_node(&mut self, nid: NodeId, props: &PropertyMap) -> Result<bool> {
        if nid.is_none() || nid.as_u32() >= self.next_node_id()? {
            return Ok(false);
        }
        let addr = self.node_prop_addr(nid)?;
        if addr == 0 {
            return Ok(false);
        }

        let (_, old_len) = read_record_at(self.properties.bytes(), addr as usize)?;
        let packed = pack_record(props);
        if packed.len() as u32 == old_len {
            self.properties.write_at(addr as usize, &packed)?;
        } else {
            let new_addr = self.next_free_addr()?;
            self.properties.write_at(new_addr as usize, &packed)?;
            self.set_free_addr(new_addr + packed.len() as u32)?;
            self.node_ids
                .write_at(node_slot_offset(nid), &new_addr.to_be_bytes())?;
        }
        Ok(true)
    }

    /// Delete a node by zeroing its slot. Its edges are left as they are.
    pub fn delete_node(&mut self, nid: NodeId) -> Result<()> {
        if nid.is_none() || nid.as_u32() >= self.next_node_id()? {
            return Ok(());
        }
        self.write_node_slot(nid, 0, EdgeId::NONE, EdgeId::NONE)
    }

    /// Enumerate live node ids: a linear scan over the allocated range,
    /// filtering slots whose property address was zeroed.
    pub fn node_ids(&self) -> Result<impl Iterator<Item = Result<NodeId>> + '_> {
        let limit = self.next_node_id()?;
        Ok((FIRST_ID..limit).filter_map(move |raw| {
            let nid = NodeId::new(raw);
            match self.node_prop_addr(nid) {
                Ok(0) => None,
                Ok(_) => Some(Ok(nid)),
                Err(e) => Some(Err(e)),
            }
        }))
    }

    // --- edge operations --------------------------------------------------

    /// Append a fresh edge record and splice it at the head of both
    /// adjacency lists (outgoing of `from`, incoming of `to`).
    ///
    /// Edge properties reuse the node record format: `props_node` is the
    /// intermediate node carrying them, and its resolved property-record
    /// address is what lands in the slot. Self-loops and parallel edges are
    /// permitted.
    pub fn create_edge(&mut self, from: NodeId, to: NodeId, props_node: NodeId) -> Result<EdgeId> {
        let raw = self.next_edge_id()?;
        let eid = EdgeId::new(raw);
        let props_addr = self.node_prop_addr(props_node)?;

        // Map the new slot before any sibling points at it.
        self.edges
            .ensure_len(edge_slot_offset(eid) + EDGE_SLOT_SIZE)?;

        let first_out = self.first_edge(from, Direction::Outgoing)?;
        let next_out = if first_out.is_none() {
            EdgeId::NONE
        } else {
            self.set_edge_field(first_out, F_PREV_OUT, raw)?;
            first_out
        };
        self.set_first_edge(from, Direction::Outgoing, eid)?;

        let first_in = self.first_edge(to, Direction::Incoming)?;
        let next_in = if first_in.is_none() {
            EdgeId::NONE
        } else {
            self.set_edge_field(first_in, F_PREV_IN, raw)?;
            first_in
        };
        self.set_first_edge(to, Direction::Incoming, eid)?;

        let mut slot = [0u8; EDGE_SLOT_SIZE];
        for (field, value) in [
            (F_FROM, from.as_u32()),
            (F_TO, to.as_u32()),
            (F_PREV_OUT, 0),
            (F_NEXT_OUT, next_out.as_u32()),
            (F_PREV_IN, 0),
            (F_NEXT_IN, next_in.as_u32()),
            (F_PROPS, props_addr),
        ] {
            slot[field * SIZE_U32..(field + 1) * SIZE_U32].copy_from_slice(&value.to_be_bytes());
        }
        self.edges.write_at(edge_slot_offset(eid), &slot)?;
        self.set_next_edge_id(raw + 1)?;
        Ok(eid)
    }

    /// Fetch an edge record, or `None` for unknown or removed ids.
    pub fn get_edge(&self, eid: EdgeId) -> Result<Option<EdgeRecord>> {
        if eid.is_none() || eid.as_u32() >= self.next_edge_id()? {
            return Ok(None);
        }
        let from = self.edge_field(eid, F_FROM)?;
        if from == 0 {
            return Ok(None);
        }
        let to = self.edge_field(eid, F_TO)?;
        let props_addr = self.edge_field(eid, F_PROPS)?;
        let (props, _) = read_record_at(self.properties.bytes(), props_addr as usize)?;
        Ok(Some(EdgeRecord {
            id: eid,
            from: NodeId::new(from),
            to: NodeId::new(to),
            props,
        }))
    }

    /// Unlink an edge from both adjacency lists and zero its `from` field.
    /// The slot is never reused. Removing an unknown or already-removed edge
    /// is a no-op.
    pub fn remove_edge(&mut self, eid: EdgeId) -> Result<()> {
        if eid.is_none() || eid.as_u32() >= self.next_edge_id()? {
            return Ok(());
        }
        let from = NodeId::new(self.edge_field(eid, F_FROM)?);
        if from.is_none() {
            return Ok(());
        }
        let to = NodeId::new(self.edge_field(eid, F_TO)?);

        self.unlink(eid, from, Direction::Outgoing)?;
        self.unlink(eid, to, Direction::Incoming)?;
        self.set_edge_field(eid, F_FROM, 0)
    }

    fn unlink(&mut self, eid: EdgeId, node: NodeId, dir: Direction) -> Result<()> {
        let (f_prev, f_next) = sibling_fields(dir);
        let next = EdgeId::new(self.edge_field(eid, f_next)?);
        if self.first_edge(node, dir)? == eid {
            self.set_first_edge(node, dir, next)?;
            if !next.is_none() {
                self.set_edge_field(next, f_prev, 0)?;
            }
        } else {
            let prev = EdgeId::new(self.edge_field(eid, f_prev)?);
            if !prev.is_none() {
                self.set_edge_field(prev, f_next, next.as_u32())?;
            }
            if !next.is_none() {
                self.set_edge_field(next, f_prev, prev.as_u32())?;
            }
        }
        Ok(())
    }

    /// Walk the outgoing adjacency list of `nid`, yielding edge ids lazily.
    pub fn edges_from(&self, nid: NodeId) -> Result<AdjacencyWalk<'_>> {
        self.adjacency(nid, Direction::Outgoing)
    }

    /// Walk the incoming adjacency list of `nid`.
    pub fn edges_to(&self, nid: NodeId) -> Result<AdjacencyWalk<'_>> {
        self.adjacency(nid, Direction::Incoming)
    }

    fn adjacency(&self, nid: NodeId, dir: Direction) -> Result<AdjacencyWalk<'_>> {
        let head = if nid.is_none() || nid.as_u32() >= self.next_node_id()? {
            EdgeId::NONE
        } else {
            self.first_edge(nid, dir)?
        };
        Ok(AdjacencyWalk {
            storage: self,
            origin: nid,
            dir,
            cur: head,
            remaining: self.next_edge_id()? as u64,
        })
    }

    /// Enumerate live edge ids, filtering removed slots.
    pub fn edge_ids(&self) -> Result<impl Iterator<Item = Result<EdgeId>> + '_> {
        let limit = self.next_edge_id()?;
        Ok((FIRST_ID..limit).filter_map(move |raw| {
            let eid = EdgeId::new(raw);
            match self.edge_field(eid, F_FROM) {
                Ok(0) => None,
                Ok(_) => Some(Ok(eid)),
                Err(e) => Some(Err(e)),
            }
        }))
    }

    // --- slot plumbing ----------------------------------------------------

    fn write_node_slot(
        &mut self,
        nid: NodeId,
        prop_addr: u32,
        first_out: EdgeId,
        first_in: EdgeId,
    ) -> Result<()> {
        let mut slot = [0u8; NODE_SLOT_SIZE];
        slot[0..4].copy_from_slice(&prop_addr.to_be_bytes());
        slot[4..8].copy_from_slice(&first_out.as_u32().to_be_bytes());
        slot[8..12].copy_from_slice(&first_in.as_u32().to_be_bytes());
        self.node_ids.write_at(node_slot_offset(nid), &slot)
    }

    fn node_prop_addr(&self, nid: NodeId) -> Result<u32> {
        read_u32(&self.node_ids, NODE_IDS_FILE, node_slot_offset(nid))
    }

    fn first_edge(&self, nid: NodeId, dir: Direction) -> Result<EdgeId> {
        let offset = node_slot_offset(nid) + head_offset(dir);
        Ok(EdgeId::new(read_u32(&self.node_ids, NODE_IDS_FILE, offset)?))
    }

    fn set_first_edge(&mut self, nid: NodeId, dir: Direction, eid: EdgeId) -> Result<()> {
        let offset = node_slot_offset(nid) + head_offset(dir);
        self.node_ids.write_at(offset, &eid.as_u32().to_be_bytes())
    }

    fn edge_field(&self, eid: EdgeId, field: usize) -> Result<u32> {
        read_u32(
            &self.edges,
            EDGES_FILE,
            edge_slot_offset(eid) + field * SIZE_U32,
        )
    }

    fn set_edge_field(&mut self, eid: EdgeId, field: usize, value: u32) -> Result<()> {
        self.edges.write_at(
            edge_slot_offset(eid) + field * SIZE_U32,
            &value.to_be_bytes(),
        )
    }
}

/// Lazy, restartable walk over one adjacency list. End of list is the
/// sentinel `0`; a walk longer than the allocated edge count means the
/// sibling pointers form a cycle and surfaces as a fatal storage error.
pub struct AdjacencyWalk<'a> {
    storage: &'a GraphStorage,
    origin: NodeId,
    dir: Direction,
    cur: EdgeId,
    remaining: u64,
}

impl Iterator for AdjacencyWalk<'_> {
    type Item = Result<EdgeId>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cur.is_none() {
            return None;
        }
        if self.remaining == 0 {
            self.cur = EdgeId::NONE;
            return Some(Err(StorageError::UnterminatedWalk(self.origin).into()));
        }
        self.remaining -= 1;

        let eid = self.cur;
        let (_, f_next) = sibling_fields(self.dir);
        match self.storage.edge_field(eid, f_next) {
            Ok(next) => {
                self.cur = EdgeId::new(next);
                Some(Ok(eid))
            }
            Err(e) => {
                self.cur = EdgeId::NONE;
                Some(Err(e))
            }
        }
    }
}

fn storage_path(base: &Path, ext: &str) -> PathBuf {
    let mut os = base.as_os_str().to_os_string();
    os.push(".");
    os.push(ext);
    PathBuf::from(os)
}

fn node_slot_offset(nid: NodeId) -> usize {
    nid.as_u32() as usize * NODE_SLOT_SIZE
}

fn edge_slot_offset(eid: EdgeId) -> usize {
    eid.as_u32() as usize * EDGE_SLOT_SIZE
}

fn head_offset(dir: Direction) -> usize {
    match dir {
        Direction::Outgoing => SIZE_U32,
        Direction::Incoming => 2 * SIZE_U32,
    }
}

fn sibling_fields(dir: Direction) -> (usize, usize) {
    match dir {
        Direction::Outgoing => (F_PREV_OUT, F_NEXT_OUT),
        Direction::Incoming => (F_PREV_IN, F_NEXT_IN),
    }
}

fn read_u32(file: &MappedFile, name: &'static str, offset: usize) -> Result<u32> {
    let bytes = file
        .slice(offset, SIZE_U32)
        .ok_or(StorageError::ShortRead {
            file: name,
            offset,
            wanted: SIZE_U32,
        })?;
    Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::property_codec::PropertyValue;
    use tempfile::TempDir;

    fn props(pairs: &[(&str, PropertyValue)]) -> PropertyMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn open_storage(dir: &TempDir) -> GraphStorage {
        GraphStorage::open(dir.path().join("db")).unwrap()
    }

    #[test]
    fn test_ids_allocate_from_one() {
        let dir = TempDir::new().unwrap();
        let mut storage = open_storage(&dir);
        let a = storage
            .create_node(&props(&[("k", PropertyValue::Int(1))]))
            .unwrap();
        let b = storage
            .create_node(&props(&[("k", PropertyValue::Int(2))]))
            .unwrap();
        assert_eq!(a, NodeId::new(1));
        assert_eq!(b, NodeId::new(2));
    }

    #[test]
    fn test_get_unknown_ids_are_none() {
        let dir = TempDir::new().unwrap();
        let storage = open_storage(&dir);
        assert!(storage.get_node(NodeId::new(99)).unwrap().is_none());
        assert!(storage.get_node(NodeId::NONE).unwrap().is_none());
        assert!(storage.get_edge(EdgeId::new(99)).unwrap().is_none());
    }

    #[test]
    fn test_edges_splice_at_head() {
        let dir = TempDir::new().unwrap();
        let mut storage = open_storage(&dir);
        let a = storage
            .create_node(&props(&[("n", PropertyValue::Text("a".into()))]))
            .unwrap();
        let b = storage
            .create_node(&props(&[("n", PropertyValue::Text("b".into()))]))
            .unwrap();
        let p = storage
            .create_node(&props(&[("w", PropertyValue::Int(1))]))
            .unwrap();

        let e1 = storage.create_edge(a, b, p).unwrap();
        let e2 = storage.create_edge(a, b, p).unwrap();

        let out: Vec<EdgeId> = storage
            .edges_from(a)
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        // Newest edge sits at the head of the list.
        assert_eq!(out, vec![e2, e1]);

        let inc: Vec<EdgeId> = storage.edges_to(b).unwrap().collect::<Result<_>>().unwrap();
        assert_eq!(inc, vec![e2, e1]);
    }

    #[test]
    fn test_removed_edge_slot_is_never_reused() {
        let dir = TempDir::new().unwrap();
        let mut storage = open_storage(&dir);
        let a = storage
            .create_node(&props(&[("n", PropertyValue::Int(1))]))
            .unwrap();
        let p = storage
            .create_node(&props(&[("w", PropertyValue::Int(1))]))
            .unwrap();

        let e1 = storage.create_edge(a, a, p).unwrap();
        storage.remove_edge(e1).unwrap();
        let e2 = storage.create_edge(a, a, p).unwrap();

        assert_ne!(e1, e2);
        assert!(storage.get_edge(e1).unwrap().is_none());
        // Double removal stays a no-op.
        storage.remove_edge(e1).unwrap();
        assert!(storage.get_edge(e2).unwrap().is_some());
    }

    #[test]
    fn test_reopen_preserves_counters_and_data() {
        let dir = TempDir::new().unwrap();
        let base = dir.path().join("db");
        let a;
        {
            let mut storage = GraphStorage::open(&base).unwrap();
            a = storage
                .create_node(&props(&[("name", PropertyValue::Text("first".into()))]))
                .unwrap();
            storage.flush().unwrap();
        }
        let mut storage = GraphStorage::open(&base).unwrap();
        let fetched = storage.get_node(a).unwrap().unwrap();
        assert_eq!(
            fetched.get("name"),
            Some(&PropertyValue::Text("first".into()))
        );
        let b = storage
            .create_node(&props(&[("k", PropertyValue::Int(2))]))
            .unwrap();
        assert_eq!(b.as_u32(), a.as_u32() + 1);
    }
}
