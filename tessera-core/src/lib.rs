use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub mod collab;

#[derive(Clone, Copy, Serialize, Deserialize, Debug, Default, PartialEq)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

impl Position {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// A canvas node. `data` is opaque to the sync layer.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct Node {
    pub id: String,
    #[serde(rename = "type")]
    pub node_type: String,
    pub position: Position,
    #[serde(default)]
    pub data: Value,
}

impl Node {
    pub fn new(id: impl Into<String>, node_type: impl Into<String>, x: f64, y: f64) -> Self {
        Self {
            id: id.into(),
            node_type: node_type.into(),
            position: Position::new(x, y),
            data: Value::Null,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }
}

#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct Edge {
    pub id: String,
    pub source: String,
    pub target: String,
    #[serde(default)]
    pub data: Value,
}

impl Edge {
    pub fn new(id: impl Into<String>, source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            source: source.into(),
            target: target.into(),
            data: Value::Null,
        }
    }
}

/// Anything stored in the replicated graph under its own id.
pub trait GraphElement: Clone + PartialEq + Serialize + DeserializeOwned {
    fn id(&self) -> &str;

    /// Reject values that would not survive a write and read back.
    fn validate(&self) -> Result<(), String> {
        Ok(())
    }
}

impl GraphElement for Node {
    fn id(&self) -> &str {
        &self.id
    }

    fn validate(&self) -> Result<(), String> {
        if self.position.x.is_finite() && self.position.y.is_finite() {
            Ok(())
        } else {
            Err(format!("node {} has a non-finite position", self.id))
        }
    }
}

impl GraphElement for Edge {
    fn id(&self) -> &str {
        &self.id
    }
}

/// Materialized `{nodes, edges}` exchanged with the canvas layer.
#[derive(Clone, Serialize, Deserialize, Debug, Default, PartialEq)]
pub struct CanvasGraph {
    #[serde(default)]
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub edges: Vec<Edge>,
}

impl CanvasGraph {
    pub fn new(nodes: Vec<Node>, edges: Vec<Edge>) -> Self {
        Self { nodes, edges }
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty() && self.edges.is_empty()
    }

    /// Id-sorted copy with duplicate ids collapsed (last one wins).
    ///
    /// Two graphs holding the same elements compare equal after normalizing,
    /// whatever order they were produced in.
    pub fn normalized(&self) -> CanvasGraph {
        CanvasGraph {
            nodes: normalize(&self.nodes),
            edges: normalize(&self.edges),
        }
    }
}

/// Sort by id, keeping the last occurrence of each id.
pub fn normalize<T: GraphElement>(items: &[T]) -> Vec<T> {
    let mut by_id = std::collections::BTreeMap::new();
    for item in items {
        by_id.insert(item.id().to_string(), item.clone());
    }
    by_id.into_values().collect()
}
