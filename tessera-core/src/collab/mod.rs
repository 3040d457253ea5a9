//! Replicated canvas document backed by a Yrs `Doc`.
//!
//! Two root maps hold the graph: `nodes` (node id → node record) and
//! `edges` (edge id → edge record). Each record is stored as a nested
//! `Any` map so coordinates stay numeric on the wire.
//!
//! Every mutation runs in a single transaction and returns the encoded
//! update to broadcast. Observers receive the full materialized sequence
//! once per transaction, and only for the kind that changed.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde_json::Value;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Any, Doc, Map, MapRef, Out, ReadTxn, StateVector, Transact, TransactionMut, Update};

use crate::{normalize, CanvasGraph, Edge, GraphElement, Node};

const NODES_MAP: &str = "nodes";
const EDGES_MAP: &str = "edges";

/// Errors raised by document operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CollabError {
    #[error("Yrs error: {0}")]
    YrsError(String),
    #[error("Serialization error: {0}")]
    SerializationError(String),
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
}

impl From<yrs::encoding::read::Error> for CollabError {
    fn from(e: yrs::encoding::read::Error) -> Self {
        CollabError::YrsError(e.to_string())
    }
}

/// Which parts of the graph a transaction touched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DocumentChange {
    pub nodes_changed: bool,
    pub edges_changed: bool,
}

impl DocumentChange {
    pub fn any(&self) -> bool {
        self.nodes_changed || self.edges_changed
    }
}

/// Result of a first-sync seeding attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum SeedOutcome {
    /// The document was empty and now holds the initial graph.
    Seeded(Vec<u8>),
    /// Another replica got there first; nothing was written.
    AlreadyPopulated,
    /// The supplied initial graph was empty.
    NothingToSeed,
}

/// Handle returned by `observe_*`, used to unregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

type NodeObserver = Box<dyn Fn(&[Node]) + Send + Sync>;
type EdgeObserver = Box<dyn Fn(&[Edge]) + Send + Sync>;

/// The converging node/edge graph for one project session.
pub struct CanvasDocument {
    doc: Doc,
    nodes_map: MapRef,
    edges_map: MapRef,
    /// Id-sorted view, refreshed after every transaction.
    materialized: CanvasGraph,
    node_observers: Vec<(ObserverId, NodeObserver)>,
    edge_observers: Vec<(ObserverId, EdgeObserver)>,
    next_observer: u64,
}

impl std::fmt::Debug for CanvasDocument {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CanvasDocument")
            .field("nodes", &self.materialized.nodes.len())
            .field("edges", &self.materialized.edges.len())
            .field("observers", &(self.node_observers.len() + self.edge_observers.len()))
            .finish()
    }
}

impl Default for CanvasDocument {
    fn default() -> Self {
        Self::new()
    }
}

impl CanvasDocument {
    pub fn new() -> Self {
        let doc = Doc::new();
        let nodes_map = doc.get_or_insert_map(NODES_MAP);
        let edges_map = doc.get_or_insert_map(EDGES_MAP);
        Self {
            doc,
            nodes_map,
            edges_map,
            materialized: CanvasGraph::default(),
            node_observers: Vec::new(),
            edge_observers: Vec::new(),
            next_observer: 0,
        }
    }

    // ─── Reads ────────────────────────────────────────────────────────

    pub fn nodes(&self) -> &[Node] {
        &self.materialized.nodes
    }

    pub fn edges(&self) -> &[Edge] {
        &self.materialized.edges
    }

    pub fn graph(&self) -> CanvasGraph {
        self.materialized.clone()
    }

    pub fn is_empty(&self) -> bool {
        self.materialized.is_empty()
    }

    // ─── Local mutations ──────────────────────────────────────────────

    /// Replace the whole node set atomically.
    ///
    /// Returns the update to broadcast, or `None` if nothing changed.
    pub fn replace_nodes(&mut self, nodes: &[Node]) -> Result<Option<Vec<u8>>, CollabError> {
        self.replace(Some(nodes), None)
    }

    /// Replace the whole edge set atomically.
    pub fn replace_edges(&mut self, edges: &[Edge]) -> Result<Option<Vec<u8>>, CollabError> {
        self.replace(None, Some(edges))
    }

    /// Replace nodes and edges together in one transaction.
    pub fn replace_graph(&mut self, graph: &CanvasGraph) -> Result<Option<Vec<u8>>, CollabError> {
        self.replace(Some(&graph.nodes), Some(&graph.edges))
    }

    fn replace(
        &mut self,
        nodes: Option<&[Node]>,
        edges: Option<&[Edge]>,
    ) -> Result<Option<Vec<u8>>, CollabError> {
        if let Some(nodes) = nodes {
            validate_all(nodes)?;
        }
        if let Some(edges) = edges {
            validate_all(edges)?;
        }

        let (update, touched) = {
            let mut txn = self.doc.transact_mut();
            let mut touched = 0usize;
            if let Some(nodes) = nodes {
                touched += replace_entries(&self.nodes_map, &mut txn, nodes)?;
            }
            if let Some(edges) = edges {
                touched += replace_entries(&self.edges_map, &mut txn, edges)?;
            }
            (txn.encode_update_v1(), touched)
        };

        if touched == 0 {
            return Ok(None);
        }
        self.refresh_and_notify();
        Ok(Some(update))
    }

    /// Seed an empty document from the loader's initial graph.
    ///
    /// Emptiness is checked inside the seeding transaction. Two replicas that
    /// race here write identical values under identical keys, so the merge
    /// collapses to a single seed.
    pub fn seed_if_empty(&mut self, initial: &CanvasGraph) -> Result<SeedOutcome, CollabError> {
        if initial.is_empty() {
            return Ok(SeedOutcome::NothingToSeed);
        }
        validate_all(&initial.nodes)?;
        validate_all(&initial.edges)?;

        let update = {
            let mut txn = self.doc.transact_mut();
            if self.nodes_map.len(&txn) > 0 || self.edges_map.len(&txn) > 0 {
                return Ok(SeedOutcome::AlreadyPopulated);
            }
            replace_entries(&self.nodes_map, &mut txn, &initial.nodes)?;
            replace_entries(&self.edges_map, &mut txn, &initial.edges)?;
            txn.encode_update_v1()
        };

        log::debug!(
            "Seeded document with {} nodes, {} edges",
            initial.nodes.len(),
            initial.edges.len()
        );
        self.refresh_and_notify();
        Ok(SeedOutcome::Seeded(update))
    }

    // ─── Remote merges ────────────────────────────────────────────────

    /// Merge an update produced by another replica.
    pub fn apply_remote_update(&mut self, update: &[u8]) -> Result<DocumentChange, CollabError> {
        let update = Update::decode_v1(update)?;
        {
            let mut txn = self.doc.transact_mut();
            txn.apply_update(update)
                .map_err(|e| CollabError::YrsError(e.to_string()))?;
        }
        Ok(self.refresh_and_notify())
    }

    /// Encoded state vector for the first step of the sync handshake.
    pub fn state_vector(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.state_vector().encode_v1()
    }

    /// Everything this replica has that `remote_state_vector` lacks.
    pub fn diff_since(&self, remote_state_vector: &[u8]) -> Result<Vec<u8>, CollabError> {
        let remote_sv = StateVector::decode_v1(remote_state_vector)?;
        let txn = self.doc.transact();
        Ok(txn.encode_diff_v1(&remote_sv))
    }

    /// Full document state as a single update.
    pub fn encode_state(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    // ─── Observers ────────────────────────────────────────────────────

    pub fn observe_nodes<F>(&mut self, callback: F) -> ObserverId
    where
        F: Fn(&[Node]) + Send + Sync + 'static,
    {
        let id = self.allocate_observer();
        self.node_observers.push((id, Box::new(callback)));
        id
    }

    pub fn observe_edges<F>(&mut self, callback: F) -> ObserverId
    where
        F: Fn(&[Edge]) + Send + Sync + 'static,
    {
        let id = self.allocate_observer();
        self.edge_observers.push((id, Box::new(callback)));
        id
    }

    /// Returns `false` if the id was not registered.
    pub fn unobserve(&mut self, id: ObserverId) -> bool {
        let before = self.node_observers.len() + self.edge_observers.len();
        self.node_observers.retain(|(oid, _)| *oid != id);
        self.edge_observers.retain(|(oid, _)| *oid != id);
        before != self.node_observers.len() + self.edge_observers.len()
    }

    pub fn clear_observers(&mut self) {
        self.node_observers.clear();
        self.edge_observers.clear();
    }

    pub fn observer_count(&self) -> usize {
        self.node_observers.len() + self.edge_observers.len()
    }

    /// Push the current materialized graph to every observer, changed or not.
    pub fn publish(&self) {
        for (_, observer) in &self.node_observers {
            observer(&self.materialized.nodes);
        }
        for (_, observer) in &self.edge_observers {
            observer(&self.materialized.edges);
        }
    }

    fn allocate_observer(&mut self) -> ObserverId {
        self.next_observer += 1;
        ObserverId(self.next_observer)
    }

    // ─── Materialization ──────────────────────────────────────────────

    fn refresh_and_notify(&mut self) -> DocumentChange {
        let (nodes, edges) = {
            let txn = self.doc.transact();
            (
                read_entries::<Node, _>(&self.nodes_map, &txn),
                read_entries::<Edge, _>(&self.edges_map, &txn),
            )
        };

        let change = DocumentChange {
            nodes_changed: nodes != self.materialized.nodes,
            edges_changed: edges != self.materialized.edges,
        };
        self.materialized = CanvasGraph { nodes, edges };

        if change.nodes_changed {
            for (_, observer) in &self.node_observers {
                observer(&self.materialized.nodes);
            }
        }
        if change.edges_changed {
            for (_, observer) in &self.edge_observers {
                observer(&self.materialized.edges);
            }
        }
        change
    }
}

fn validate_all<T: GraphElement>(items: &[T]) -> Result<(), CollabError> {
    items
        .iter()
        .try_for_each(|item| item.validate().map_err(CollabError::InvalidOperation))
}

/// Make `map` hold exactly `items`. Returns the number of keys written or removed.
fn replace_entries<T: GraphElement>(
    map: &MapRef,
    txn: &mut TransactionMut,
    items: &[T],
) -> Result<usize, CollabError> {
    let wanted: BTreeMap<&str, &T> = items.iter().map(|item| (item.id(), item)).collect();

    let existing: Vec<String> = map.keys(&*txn).map(|k| k.to_string()).collect();
    let mut touched = 0;

    for key in existing {
        if !wanted.contains_key(key.as_str()) {
            map.remove(txn, &key);
            touched += 1;
        }
    }

    for (id, item) in wanted {
        let current = map.get(&*txn, id).and_then(|out| decode_entry::<T>(id, out));
        if current.as_ref() == Some(item) {
            continue;
        }
        let value = serde_json::to_value(item)
            .map_err(|e| CollabError::SerializationError(e.to_string()))?;
        map.insert(txn, id.to_string(), json_to_any(&value));
        touched += 1;
    }

    Ok(touched)
}

/// Decode every entry of `map`, skipping records that fail to parse.
fn read_entries<T: GraphElement, R: ReadTxn>(map: &MapRef, txn: &R) -> Vec<T> {
    let keys: Vec<String> = map.keys(txn).map(|k| k.to_string()).collect();
    let items: Vec<T> = keys
        .iter()
        .filter_map(|key| map.get(txn, key).and_then(|out| decode_entry(key, out)))
        .collect();
    normalize(&items)
}

fn decode_entry<T: GraphElement>(key: &str, out: Out) -> Option<T> {
    let Out::Any(any) = out else {
        log::warn!("Ignoring non-scalar entry under key {key}");
        return None;
    };
    match serde_json::from_value::<T>(any_to_json(&any)) {
        Ok(item) if item.id() == key => Some(item),
        Ok(_) => {
            log::warn!("Ignoring entry whose id does not match key {key}");
            None
        }
        Err(e) => {
            log::warn!("Ignoring malformed entry {key}: {e}");
            None
        }
    }
}

// ─── JSON ⇄ Any ────────────────────────────────────────────────────────

fn json_to_any(value: &Value) -> Any {
    match value {
        Value::Null => Any::Null,
        Value::Bool(b) => Any::Bool(*b),
        Value::Number(n) => match n.as_i64() {
            Some(i) if !n.is_f64() => Any::BigInt(i),
            _ => Any::Number(n.as_f64().unwrap_or_default()),
        },
        Value::String(s) => Any::String(Arc::from(s.as_str())),
        Value::Array(items) => {
            let items: Vec<Any> = items.iter().map(json_to_any).collect();
            Any::Array(items.into())
        }
        Value::Object(fields) => {
            let map: HashMap<String, Any> = fields
                .iter()
                .map(|(k, v)| (k.clone(), json_to_any(v)))
                .collect();
            Any::Map(Arc::new(map))
        }
    }
}

fn any_to_json(any: &Any) -> Value {
    match any {
        Any::Null | Any::Undefined => Value::Null,
        Any::Bool(b) => Value::Bool(*b),
        Any::Number(n) => serde_json::Number::from_f64(*n)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        Any::BigInt(i) => Value::from(*i),
        Any::String(s) => Value::String(s.to_string()),
        Any::Buffer(bytes) => Value::Array(bytes.iter().map(|b| Value::from(*b)).collect()),
        Any::Array(items) => Value::Array(items.iter().map(any_to_json).collect()),
        Any::Map(fields) => Value::Object(
            fields
                .iter()
                .map(|(k, v)| (k.clone(), any_to_json(v)))
                .collect(),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn node(id: &str, x: f64, y: f64) -> Node {
        Node::new(id, "default", x, y)
    }

    fn ids(nodes: &[Node]) -> Vec<&str> {
        nodes.iter().map(|n| n.id.as_str()).collect()
    }

    #[test]
    fn test_initialization() {
        let doc = CanvasDocument::new();
        assert!(doc.is_empty());
        assert_eq!(doc.observer_count(), 0);
    }

    #[test]
    fn test_local_replace_generates_delta() {
        let mut doc = CanvasDocument::new();
        let delta = doc.replace_nodes(&[node("n1", 0.0, 0.0)]).unwrap();
        assert!(delta.is_some());
        assert_eq!(ids(doc.nodes()), vec!["n1"]);
    }

    #[test]
    fn test_replace_unchanged_returns_none() {
        let mut doc = CanvasDocument::new();
        let nodes = vec![node("n1", 0.0, 0.0)];
        doc.replace_nodes(&nodes).unwrap();
        assert!(doc.replace_nodes(&nodes).unwrap().is_none());
    }

    #[test]
    fn test_replace_removes_missing_ids() {
        let mut doc = CanvasDocument::new();
        doc.replace_nodes(&[node("a", 0.0, 0.0), node("b", 1.0, 1.0)]).unwrap();
        doc.replace_nodes(&[node("b", 2.0, 2.0)]).unwrap();
        assert_eq!(ids(doc.nodes()), vec!["b"]);
        assert_eq!(doc.nodes()[0].position.x, 2.0);
    }

    #[test]
    fn test_non_finite_position_is_rejected() {
        let mut doc = CanvasDocument::new();
        doc.replace_nodes(&[node("n1", 0.0, 0.0)]).unwrap();

        let err = doc
            .replace_nodes(&[node("n1", 0.0, 0.0), node("n2", f64::NAN, 1.0)])
            .unwrap_err();
        assert!(matches!(err, CollabError::InvalidOperation(_)));
        // Nothing from the rejected batch was written.
        assert_eq!(ids(doc.nodes()), vec!["n1"]);

        let bad_seed = CanvasGraph::new(vec![node("s1", f64::INFINITY, 0.0)], Vec::new());
        assert!(CanvasDocument::new().seed_if_empty(&bad_seed).is_err());
    }

    #[test]
    fn test_nested_data_survives_roundtrip() {
        let mut doc = CanvasDocument::new();
        let data = json!({ "label": "Prompt", "tags": ["a", "b"], "meta": { "weight": 3, "ratio": 0.5 } });
        doc.replace_nodes(&[node("n1", 12.5, -4.0).with_data(data.clone())]).unwrap();

        let mut replica = CanvasDocument::new();
        replica.apply_remote_update(&doc.encode_state()).unwrap();
        assert_eq!(replica.nodes()[0].data, data);
        assert_eq!(replica.nodes()[0].position.x, 12.5);
        assert_eq!(replica.nodes()[0].position.y, -4.0);
    }

    #[test]
    fn test_apply_remote_update_convergence() {
        let mut doc1 = CanvasDocument::new();
        let mut doc2 = CanvasDocument::new();

        let delta = doc1.replace_nodes(&[node("n1", 10.0, 10.0)]).unwrap().unwrap();
        let change = doc2.apply_remote_update(&delta).unwrap();

        assert!(change.nodes_changed);
        assert!(!change.edges_changed);
        assert_eq!(doc1.nodes(), doc2.nodes());
    }

    #[test]
    fn test_convergence_independent_of_delivery_order() {
        let mut a = CanvasDocument::new();
        let mut b = CanvasDocument::new();
        let mut c = CanvasDocument::new();

        let d1 = a.replace_nodes(&[node("n1", 0.0, 0.0)]).unwrap().unwrap();
        let d2 = b.replace_nodes(&[node("n2", 5.0, 5.0)]).unwrap().unwrap();
        let d3 = c
            .replace_edges(&[Edge::new("e1", "n1", "n2")])
            .unwrap()
            .unwrap();

        // a: d2, d3 ; b: d3, d1 ; c: d1, d2 (and a duplicate)
        a.apply_remote_update(&d2).unwrap();
        a.apply_remote_update(&d3).unwrap();
        b.apply_remote_update(&d3).unwrap();
        b.apply_remote_update(&d1).unwrap();
        c.apply_remote_update(&d2).unwrap();
        c.apply_remote_update(&d1).unwrap();
        c.apply_remote_update(&d1).unwrap();

        assert_eq!(a.graph(), b.graph());
        assert_eq!(b.graph(), c.graph());
        assert_eq!(ids(a.nodes()), vec!["n1", "n2"]);
        assert_eq!(a.edges().len(), 1);
    }

    #[test]
    fn test_concurrent_replace_of_same_node_converges() {
        let mut a = CanvasDocument::new();
        let mut b = CanvasDocument::new();
        let base = a.replace_nodes(&[node("n1", 0.0, 0.0)]).unwrap().unwrap();
        b.apply_remote_update(&base).unwrap();

        let da = a.replace_nodes(&[node("n1", 100.0, 0.0)]).unwrap().unwrap();
        let db = b.replace_nodes(&[node("n1", 0.0, 100.0)]).unwrap().unwrap();
        a.apply_remote_update(&db).unwrap();
        b.apply_remote_update(&da).unwrap();

        assert_eq!(a.graph(), b.graph());
        assert_eq!(a.nodes().len(), 1);
    }

    #[test]
    fn test_seed_if_empty_once() {
        let initial = CanvasGraph::new(vec![node("n1", 0.0, 0.0)], Vec::new());
        let mut doc = CanvasDocument::new();

        assert!(matches!(doc.seed_if_empty(&initial).unwrap(), SeedOutcome::Seeded(_)));
        assert_eq!(doc.seed_if_empty(&initial).unwrap(), SeedOutcome::AlreadyPopulated);
        assert_eq!(ids(doc.nodes()), vec!["n1"]);
    }

    #[test]
    fn test_seed_with_empty_initial_is_noop() {
        let mut doc = CanvasDocument::new();
        assert_eq!(
            doc.seed_if_empty(&CanvasGraph::default()).unwrap(),
            SeedOutcome::NothingToSeed
        );
        assert!(doc.is_empty());
    }

    #[test]
    fn test_racing_seeds_collapse() {
        let initial = CanvasGraph::new(
            vec![node("n1", 0.0, 0.0), node("n2", 3.0, 4.0)],
            vec![Edge::new("e1", "n1", "n2")],
        );

        let mut single = CanvasDocument::new();
        single.seed_if_empty(&initial).unwrap();

        let mut a = CanvasDocument::new();
        let mut b = CanvasDocument::new();
        let SeedOutcome::Seeded(ua) = a.seed_if_empty(&initial).unwrap() else {
            panic!("a should seed");
        };
        let SeedOutcome::Seeded(ub) = b.seed_if_empty(&initial).unwrap() else {
            panic!("b should seed");
        };
        a.apply_remote_update(&ub).unwrap();
        b.apply_remote_update(&ua).unwrap();

        assert_eq!(a.graph(), b.graph());
        assert_eq!(a.graph(), single.graph());
        assert_eq!(a.nodes().len(), 2);
    }

    #[test]
    fn test_observer_receives_full_sequence_once_per_txn() {
        let mut doc = CanvasDocument::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::new(Mutex::new(Vec::new()));

        let c = calls.clone();
        let s = seen.clone();
        doc.observe_nodes(move |nodes| {
            c.fetch_add(1, Ordering::SeqCst);
            *s.lock().unwrap() = nodes.iter().map(|n| n.id.clone()).collect();
        });

        doc.replace_nodes(&[node("a", 0.0, 0.0), node("b", 0.0, 0.0), node("c", 0.0, 0.0)])
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(*seen.lock().unwrap(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_observer_not_fired_for_other_kind() {
        let mut doc = CanvasDocument::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        doc.observe_nodes(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        doc.replace_edges(&[Edge::new("e1", "a", "b")]).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_observer_fires_on_remote_merge() {
        let mut source = CanvasDocument::new();
        let mut doc = CanvasDocument::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        doc.observe_edges(move |edges| {
            assert_eq!(edges.len(), 1);
            c.fetch_add(1, Ordering::SeqCst);
        });

        let delta = source
            .replace_edges(&[Edge::new("e1", "a", "b")])
            .unwrap()
            .unwrap();
        doc.apply_remote_update(&delta).unwrap();
        // Re-delivery changes nothing and stays silent.
        doc.apply_remote_update(&delta).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unobserve_and_clear() {
        let mut doc = CanvasDocument::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let c1 = calls.clone();
        let c2 = calls.clone();
        let first = doc.observe_nodes(move |_| {
            c1.fetch_add(1, Ordering::SeqCst);
        });
        doc.observe_edges(move |_| {
            c2.fetch_add(1, Ordering::SeqCst);
        });

        assert!(doc.unobserve(first));
        assert!(!doc.unobserve(first));
        doc.clear_observers();
        doc.replace_graph(&CanvasGraph::new(
            vec![node("a", 0.0, 0.0)],
            vec![Edge::new("e", "a", "a")],
        ))
        .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_publish_pushes_current_graph() {
        let mut doc = CanvasDocument::new();
        doc.replace_nodes(&[node("n1", 0.0, 0.0)]).unwrap();

        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = seen.clone();
        doc.observe_nodes(move |nodes| {
            sink.lock().unwrap().push(nodes.len());
        });

        doc.publish();
        doc.publish();
        assert_eq!(*seen.lock().unwrap(), vec![1, 1]);
    }

    #[test]
    fn test_state_vector_diff_sync() {
        let mut a = CanvasDocument::new();
        let mut b = CanvasDocument::new();
        a.replace_nodes(&[node("n1", 0.0, 0.0)]).unwrap();
        b.replace_nodes(&[node("n2", 0.0, 0.0)]).unwrap();

        let for_b = a.diff_since(&b.state_vector()).unwrap();
        let for_a = b.diff_since(&a.state_vector()).unwrap();
        b.apply_remote_update(&for_b).unwrap();
        a.apply_remote_update(&for_a).unwrap();

        assert_eq!(ids(a.nodes()), vec!["n1", "n2"]);
        assert_eq!(a.graph(), b.graph());
    }

    #[test]
    fn test_apply_garbage_update_fails() {
        let mut doc = CanvasDocument::new();
        assert!(doc.apply_remote_update(&[0xFF, 0xFE, 0xFD]).is_err());
        assert!(doc.is_empty());
    }
}
