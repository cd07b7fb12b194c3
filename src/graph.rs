// src/graph.rs

//! Typed DAG of nodes and edges layered over the chunk store
//!
//! Nodes are small integer handles into a flat arena, so reachability and
//! cycle checks are plain index traversals with no ownership cycles. Edges
//! are ordered (parent, child, label) triples kept in insertion order;
//! enumeration follows authoring order, never name order. The graph is
//! acyclic at all times: an `add_edge` that would close a cycle is rejected
//! before anything is mutated.

use crate::chunk::ChunkId;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Index of a node in the bundle's graph table
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct NodeId(pub u32);

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "node#{}", self.0)
    }
}

/// The root node every bundle graph starts with
pub const ROOT: NodeId = NodeId(0);

/// A scalar or chunk-reference property value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PropertyValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    /// Reference into the bundle's chunk table
    Chunk(ChunkId),
}

impl PropertyValue {
    /// The referenced chunk, when this property is a chunk reference
    pub fn as_chunk(&self) -> Option<ChunkId> {
        match self {
            Self::Chunk(id) => Some(*id),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }
}

/// A labeled directed edge to a child node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeRecord {
    pub child: NodeId,
    pub label: String,
}

/// One entry in the persisted graph table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    /// Closed type tag matched by processing code ("root", "dir", "file", ...)
    pub type_tag: String,
    /// Named properties in insertion order
    #[serde(default)]
    pub properties: Vec<(String, PropertyValue)>,
    /// Outgoing edges in insertion order
    #[serde(default)]
    pub edges: Vec<EdgeRecord>,
}

impl NodeRecord {
    fn new(type_tag: impl Into<String>) -> Self {
        Self {
            type_tag: type_tag.into(),
            properties: Vec::new(),
            edges: Vec::new(),
        }
    }
}

/// In-memory node/edge arena backing a bundle
#[derive(Debug, Clone, PartialEq)]
pub struct GraphIndex {
    nodes: Vec<NodeRecord>,
}

impl Default for GraphIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl GraphIndex {
    /// Create a graph containing only the root node
    pub fn new() -> Self {
        Self {
            nodes: vec![NodeRecord::new("root")],
        }
    }

    /// Reassemble a graph from its persisted table (bundle open path)
    pub fn from_nodes(nodes: Vec<NodeRecord>) -> Result<Self> {
        if nodes.is_empty() {
            return Err(Error::Format("graph table has no root node".to_string()));
        }
        let graph = Self { nodes };
        for (idx, node) in graph.nodes.iter().enumerate() {
            for edge in &node.edges {
                if edge.child.0 as usize >= graph.nodes.len() {
                    return Err(Error::Format(format!(
                        "node {} has dangling edge to {}",
                        idx, edge.child
                    )));
                }
            }
        }
        Ok(graph)
    }

    /// Allocate a new node with the given type tag
    pub fn create_node(&mut self, type_tag: impl Into<String>) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(NodeRecord::new(type_tag));
        id
    }

    /// The record for a node
    pub fn node(&self, id: NodeId) -> Result<&NodeRecord> {
        self.nodes
            .get(id.0 as usize)
            .ok_or_else(|| Error::NotFound(id.to_string()))
    }

    fn node_mut(&mut self, id: NodeId) -> Result<&mut NodeRecord> {
        self.nodes
            .get_mut(id.0 as usize)
            .ok_or_else(|| Error::NotFound(id.to_string()))
    }

    /// Number of nodes, including the root
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// The persisted graph table, in id order
    pub fn nodes(&self) -> &[NodeRecord] {
        &self.nodes
    }

    /// Mutable access to the table for format upgrades
    pub(crate) fn nodes_mut(&mut self) -> &mut [NodeRecord] {
        &mut self.nodes
    }

    /// Insert a labeled edge from `parent` to `child`
    ///
    /// Fails with [`Error::CycleDetected`] when `parent` is reachable from
    /// `child`; the graph is unchanged on failure. Inserting an edge that
    /// already exists with the same label is a no-op.
    pub fn add_edge(&mut self, parent: NodeId, child: NodeId, label: impl Into<String>) -> Result<()> {
        let label = label.into();
        self.node(child)?;
        let parent_node = self.node(parent)?;
        if parent_node
            .edges
            .iter()
            .any(|e| e.child == child && e.label == label)
        {
            return Ok(());
        }

        // Reachability check before mutation: child -> ... -> parent closes a cycle
        if parent == child || self.reachable(child, parent) {
            return Err(Error::CycleDetected(format!(
                "edge {} -[{}]-> {} would close a cycle",
                parent, label, child
            )));
        }

        self.node_mut(parent)?.edges.push(EdgeRecord { child, label });
        Ok(())
    }

    /// Remove the edge from `parent` with the given label and child
    pub fn remove_edge(&mut self, parent: NodeId, child: NodeId, label: &str) -> Result<bool> {
        let node = self.node_mut(parent)?;
        let before = node.edges.len();
        node.edges
            .retain(|e| !(e.child == child && e.label == label));
        Ok(node.edges.len() != before)
    }

    /// Depth-first reachability from `from` to `to`
    fn reachable(&self, from: NodeId, to: NodeId) -> bool {
        if from == to {
            return true;
        }
        let mut seen = HashSet::new();
        let mut stack = vec![from];
        while let Some(current) = stack.pop() {
            if !seen.insert(current) {
                continue;
            }
            if let Some(node) = self.nodes.get(current.0 as usize) {
                for edge in &node.edges {
                    if edge.child == to {
                        return true;
                    }
                    stack.push(edge.child);
                }
            }
        }
        false
    }

    /// Set (or replace) a named property on a node
    pub fn set_property(
        &mut self,
        node: NodeId,
        key: impl Into<String>,
        value: PropertyValue,
    ) -> Result<()> {
        let key = key.into();
        let record = self.node_mut(node)?;
        if let Some(slot) = record.properties.iter_mut().find(|(k, _)| *k == key) {
            slot.1 = value;
        } else {
            record.properties.push((key, value));
        }
        Ok(())
    }

    /// Look up a property by name
    pub fn property(&self, node: NodeId, key: &str) -> Result<Option<&PropertyValue>> {
        Ok(self
            .node(node)?
            .properties
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v))
    }

    /// Children of a node as (label, child) pairs, in insertion order
    pub fn children(&self, node: NodeId) -> Result<impl Iterator<Item = (&str, NodeId)>> {
        Ok(self
            .node(node)?
            .edges
            .iter()
            .map(|e| (e.label.as_str(), e.child)))
    }

    /// First child reached via an edge with the given label
    pub fn child_by_label(&self, node: NodeId, label: &str) -> Result<Option<NodeId>> {
        Ok(self
            .node(node)?
            .edges
            .iter()
            .find(|e| e.label == label)
            .map(|e| e.child))
    }

    /// Walk a slash-separated path of edge labels from `from`
    pub fn resolve_path(&self, from: NodeId, path: &str) -> Result<NodeId> {
        let mut current = from;
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            current = self.child_by_label(current, segment)?.ok_or_else(|| {
                Error::PathNotFound(format!("{} (missing segment '{}')", path, segment))
            })?;
        }
        Ok(current)
    }

    /// Every chunk referenced by any node property
    pub fn referenced_chunks(&self) -> HashSet<ChunkId> {
        let mut live = HashSet::new();
        for node in &self.nodes {
            for (_, value) in &node.properties {
                if let Some(chunk) = value.as_chunk() {
                    live.insert(chunk);
                }
            }
        }
        live
    }

    /// Rewrite chunk references after a chunk-store sweep
    ///
    /// `remap[old] = Some(new)` for surviving chunks. A referenced chunk that
    /// was swept indicates the live set was computed from a different graph,
    /// which is a caller bug surfaced as [`Error::Format`].
    pub fn remap_chunks(&mut self, remap: &[Option<ChunkId>]) -> Result<()> {
        for (idx, node) in self.nodes.iter_mut().enumerate() {
            for (key, value) in &mut node.properties {
                if let PropertyValue::Chunk(id) = value {
                    match remap.get(id.0 as usize).copied().flatten() {
                        Some(new_id) => *id = new_id,
                        None => {
                            return Err(Error::Format(format!(
                                "node {} property '{}' references swept {}",
                                idx, key, id
                            )));
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Full structural validation: in-range references and acyclicity
    ///
    /// `chunk_count` is the size of the bundle's chunk table; every chunk
    /// reference must fall inside it. Used by deep verification.
    pub fn validate(&self, chunk_count: usize) -> Result<()> {
        for (idx, node) in self.nodes.iter().enumerate() {
            for edge in &node.edges {
                if edge.child.0 as usize >= self.nodes.len() {
                    return Err(Error::Format(format!(
                        "node {} has dangling edge to {}",
                        idx, edge.child
                    )));
                }
            }
            for (key, value) in &node.properties {
                if let Some(chunk) = value.as_chunk()
                    && chunk.0 as usize >= chunk_count
                {
                    return Err(Error::Format(format!(
                        "node {} property '{}' references missing {}",
                        idx, key, chunk
                    )));
                }
            }
        }

        // Kahn's algorithm; leftover nodes mean a cycle
        let mut indegree = vec![0usize; self.nodes.len()];
        for node in &self.nodes {
            for edge in &node.edges {
                indegree[edge.child.0 as usize] += 1;
            }
        }
        let mut queue: Vec<usize> = indegree
            .iter()
            .enumerate()
            .filter(|&(_, &d)| d == 0)
            .map(|(i, _)| i)
            .collect();
        let mut visited = 0usize;
        while let Some(idx) = queue.pop() {
            visited += 1;
            for edge in &self.nodes[idx].edges {
                let child = edge.child.0 as usize;
                indegree[child] -= 1;
                if indegree[child] == 0 {
                    queue.push(child);
                }
            }
        }
        if visited != self.nodes.len() {
            return Err(Error::CycleDetected(format!(
                "{} node(s) participate in a cycle",
                self.nodes.len() - visited
            )));
        }
        Ok(())
    }
}
