// Graph Engine Integration Tests
// Predicate filtering, remote placeholder edges and the bounded-hop
// neighbourhood search with its visited-set contract.

use anyhow::Result;
use pretty_assertions::assert_eq;
use shardgraph::{
    EdgeTarget, GraphEngine, NodeId, PropertyFilter, PropertyMap, PropertyValue, REMOTE_NODE_FLAG,
    REMOTE_NODE_ID,
};
use std::collections::HashSet;
use tempfile::TempDir;

fn props(pairs: &[(&str, PropertyValue)]) -> PropertyMap {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

fn open_engine(dir: &TempDir) -> GraphEngine {
    GraphEngine::open(dir.path().join("db")).expect("Failed to open engine")
}

fn filter_json(json: &str) -> PropertyFilter {
    serde_json::from_str(json).expect("filter should parse")
}

/// Build a chain a -> b -> c -> d with labelled nodes, returning the ids.
fn build_chain(engine: &mut GraphEngine) -> Vec<NodeId> {
    let labels = ["a", "b", "c", "d"];
    let ids: Vec<NodeId> = labels
        .iter()
        .map(|l| {
            engine
                .create_node(props(&[
                    ("name", PropertyValue::Text(l.to_string())),
                    ("label", PropertyValue::Text("user".into())),
                ]))
                .unwrap()
        })
        .collect();
    for pair in ids.windows(2) {
        engine
            .create_edge(
                pair[0],
                props(&[("kind", PropertyValue::Text("next".into()))]),
                EdgeTarget::Local(pair[1]),
            )
            .unwrap()
            .expect("edge endpoints exist");
    }
    ids
}

#[test]
fn test_find_nodes_applies_predicate() -> Result<()> {
    let dir = TempDir::new()?;
    let mut engine = open_engine(&dir);

    let user = engine.create_node(props(&[
        ("label", PropertyValue::Text("user".into())),
        ("age", PropertyValue::Int(30)),
    ]))?;
    let _admin = engine.create_node(props(&[
        ("label", PropertyValue::Text("admin".into())),
        ("age", PropertyValue::Int(50)),
    ]))?;
    let _empty = engine.create_node(PropertyMap::new())?;

    let matches = engine.find_nodes(&filter_json(r#"{"equal_props": {"label": "user"}}"#))?;
    assert_eq!(matches.len(), 1);
    assert_eq!(matches[0].node_id, user);

    // The empty predicate matches every record with at least one property;
    // the node with no properties is rejected even by it.
    let all = engine.find_nodes(&PropertyFilter::default())?;
    let ids: HashSet<NodeId> = all.iter().map(|n| n.node_id).collect();
    assert!(ids.contains(&user));
    assert_eq!(all.len(), 2);

    let range = engine.find_nodes(&filter_json(r#"{"greater_props": {"age": 40}}"#))?;
    assert_eq!(range.len(), 1);
    assert_eq!(
        range[0].props.get("label"),
        Some(&PropertyValue::Text("admin".into()))
    );
    Ok(())
}

#[test]
fn test_find_edges_and_adjacency_filters() -> Result<()> {
    let dir = TempDir::new()?;
    let mut engine = open_engine(&dir);

    let a = engine.create_node(props(&[("name", PropertyValue::Text("a".into()))]))?;
    let b = engine.create_node(props(&[("name", PropertyValue::Text("b".into()))]))?;

    let heavy = engine
        .create_edge(
            a,
            props(&[("weight", PropertyValue::Int(10))]),
            EdgeTarget::Local(b),
        )?
        .unwrap();
    let _light = engine
        .create_edge(
            a,
            props(&[("weight", PropertyValue::Int(1))]),
            EdgeTarget::Local(b),
        )?
        .unwrap();

    let filter = filter_json(r#"{"greater_or_equal_props": {"weight": 5}}"#);

    let from_a = engine.get_edges_from(a, Some(&filter))?;
    assert_eq!(from_a.len(), 1);
    assert_eq!(from_a[0].id, heavy);
    // The target endpoint is inlined for outgoing listings.
    assert_eq!(from_a[0].to_node.as_ref().unwrap().node_id, b);
    assert!(from_a[0].from_node.is_none());

    let to_b = engine.get_edges_to(b, Some(&filter))?;
    assert_eq!(to_b.len(), 1);
    // The source endpoint is inlined for incoming listings.
    assert_eq!(to_b[0].from_node.as_ref().unwrap().node_id, a);

    let scanned = engine.find_edges(&filter)?;
    assert_eq!(scanned.len(), 1);
    assert_eq!(scanned[0].id, heavy);

    // Without a filter both parallel edges come back.
    assert_eq!(engine.get_edges_from(a, None)?.len(), 2);
    Ok(())
}

#[test]
fn test_create_edge_rejects_missing_endpoints() -> Result<()> {
    let dir = TempDir::new()?;
    let mut engine = open_engine(&dir);

    let a = engine.create_node(props(&[("name", PropertyValue::Text("a".into()))]))?;

    let missing_to = engine.create_edge(
        a,
        props(&[("k", PropertyValue::Int(1))]),
        EdgeTarget::Local(NodeId::new(99)),
    )?;
    assert!(missing_to.is_none());

    let missing_from = engine.create_edge(
        NodeId::new(99),
        props(&[("k", PropertyValue::Int(1))]),
        EdgeTarget::Local(a),
    )?;
    assert!(missing_from.is_none());
    Ok(())
}

#[test]
fn test_remote_edge_creates_placeholder_node() -> Result<()> {
    let dir = TempDir::new()?;
    let mut engine = open_engine(&dir);

    let a = engine.create_node(props(&[("name", PropertyValue::Text("a".into()))]))?;
    let edge = engine
        .create_edge(
            a,
            props(&[("kind", PropertyValue::Text("link".into()))]),
            EdgeTarget::Remote {
                id: "http://other-shard$7".to_string(),
                props: props(&[("hint", PropertyValue::Text("cached".into()))]),
            },
        )?
        .expect("edge should be created");

    let fetched = engine.get_edge(edge, true, true)?.unwrap();
    let placeholder = fetched.to_node.unwrap();
    assert_eq!(
        placeholder.props.get(REMOTE_NODE_FLAG),
        Some(&PropertyValue::Bool(true))
    );
    assert_eq!(
        placeholder.props.get(REMOTE_NODE_ID),
        Some(&PropertyValue::Text("http://other-shard$7".into()))
    );
    // Extra placeholder properties ride along.
    assert_eq!(
        placeholder.props.get("hint"),
        Some(&PropertyValue::Text("cached".into()))
    );
    Ok(())
}

#[test]
fn test_find_neighbours_respects_hop_budget() -> Result<()> {
    let dir = TempDir::new()?;
    let mut engine = open_engine(&dir);
    let ids = build_chain(&mut engine);

    let (neighbours, remote) = engine.find_neighbours(ids[0], 2, "q1", None, None)?;
    let found: HashSet<NodeId> = neighbours.iter().map(|n| n.node_id).collect();
    assert_eq!(found, HashSet::from([ids[0], ids[1], ids[2]]));
    assert!(remote.is_empty());

    // Zero hops yields nothing at all.
    let (none, _) = engine.find_neighbours(ids[0], 0, "q2", None, None)?;
    assert!(none.is_empty());
    Ok(())
}

#[test]
fn test_find_neighbours_applies_node_and_edge_filters() -> Result<()> {
    let dir = TempDir::new()?;
    let mut engine = open_engine(&dir);

    let a = engine.create_node(props(&[("label", PropertyValue::Text("user".into()))]))?;
    let b = engine.create_node(props(&[("label", PropertyValue::Text("user".into()))]))?;
    let c = engine.create_node(props(&[("label", PropertyValue::Text("bot".into()))]))?;
    for target in [b, c] {
        engine
            .create_edge(
                a,
                props(&[("kind", PropertyValue::Text("follows".into()))]),
                EdgeTarget::Local(target),
            )?
            .unwrap();
    }
    let d = engine.create_node(props(&[("label", PropertyValue::Text("user".into()))]))?;
    engine
        .create_edge(
            a,
            props(&[("kind", PropertyValue::Text("blocks".into()))]),
            EdgeTarget::Local(d),
        )?
        .unwrap();

    let node_filter = filter_json(r#"{"equal_props": {"label": "user"}}"#);
    let edge_filter = filter_json(r#"{"equal_props": {"kind": "follows"}}"#);
    let (neighbours, _) =
        engine.find_neighbours(a, 2, "q1", Some(&node_filter), Some(&edge_filter))?;

    let found: HashSet<NodeId> = neighbours.iter().map(|n| n.node_id).collect();
    // c fails the node filter, d is behind a filtered-out edge.
    assert_eq!(found, HashSet::from([a, b]));
    Ok(())
}

#[test]
fn test_find_neighbours_emits_remote_continuations() -> Result<()> {
    let dir = TempDir::new()?;
    let mut engine = open_engine(&dir);

    let a = engine.create_node(props(&[("name", PropertyValue::Text("a".into()))]))?;
    engine
        .create_edge(
            a,
            props(&[("kind", PropertyValue::Text("link".into()))]),
            EdgeTarget::Remote {
                id: "http://other-shard$3".to_string(),
                props: PropertyMap::new(),
            },
        )?
        .unwrap();

    let (neighbours, remote) = engine.find_neighbours(a, 3, "q1", None, None)?;

    // The placeholder is not descended into; it becomes a continuation with
    // the decremented hop budget.
    assert_eq!(remote, vec![("http://other-shard$3".to_string(), 2)]);
    let found: HashSet<NodeId> = neighbours.iter().map(|n| n.node_id).collect();
    assert_eq!(found, HashSet::from([a]));
    Ok(())
}

#[test]
fn test_visited_state_persists_until_cleared() -> Result<()> {
    let dir = TempDir::new()?;
    let mut engine = open_engine(&dir);
    let ids = build_chain(&mut engine);

    let (first, _) = engine.find_neighbours(ids[0], 3, "q1", None, None)?;
    assert_eq!(first.len(), 4);
    assert_eq!(engine.visited_query_count(), 1);

    // The same query id sees everything as already visited.
    let (second, _) = engine.find_neighbours(ids[0], 3, "q1", None, None)?;
    let found: Vec<NodeId> = second.iter().map(|n| n.node_id).collect();
    assert_eq!(found, vec![ids[0]]);

    // An independent query id is unaffected.
    let (other, _) = engine.find_neighbours(ids[0], 3, "q2", None, None)?;
    assert_eq!(other.len(), 4);

    // Releasing makes the original id behave fresh again.
    engine.clear_visited("q1");
    let (fresh, _) = engine.find_neighbours(ids[0], 3, "q1", None, None)?;
    assert_eq!(fresh.len(), 4);

    // Double release is a no-op.
    engine.clear_visited("q1");
    engine.clear_visited("q1");
    Ok(())
}

#[test]
fn test_visited_state_is_evicted_after_ttl() -> Result<()> {
    use shardgraph::EngineConfig;
    use std::time::Duration;

    let dir = TempDir::new()?;
    let mut engine = GraphEngine::with_config(
        dir.path().join("db"),
        EngineConfig {
            visited_ttl: Duration::from_millis(50),
        },
    )?;
    let ids = build_chain(&mut engine);

    engine.find_neighbours(ids[0], 3, "leaked", None, None)?;
    assert_eq!(engine.visited_query_count(), 1);

    std::thread::sleep(Duration::from_millis(80));

    // The next traversal evicts the lapsed entry and behaves fresh even for
    // the leaked query id.
    let (fresh, _) = engine.find_neighbours(ids[0], 3, "leaked", None, None)?;
    assert_eq!(fresh.len(), 4);
    assert_eq!(engine.visited_query_count(), 1);
    Ok(())
}
