//! Per-group node/edge/attribute store shared by all connection handlers.
//!
//! Locking: the registry (group map + node attributes) has one lock, each
//! group has its own. Every path takes the registry lock first and then
//! group locks in name order, never the other way around.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use tokio::sync::Mutex;

use crate::error::GraphError;
use crate::snapshot::{EdgeSnapshot, GraphSnapshot, GroupSnapshot, Rgba, VertexSnapshot};

/// Attribute seeded on every new node.
pub const ID_ATTRIBUTE: &str = "id";

// ─── Node attributes ────────────────────────────────────────────

/// Insertion-ordered attribute map of one node, plus its last completion
/// color. Both are replayed onto vertices materialized later.
#[derive(Debug, Clone, Default)]
struct Attributes {
    entries: Vec<(String, String)>,
    color: Option<Rgba>,
}

impl Attributes {
    fn seeded(id: &str) -> Self {
        Self {
            entries: vec![(ID_ATTRIBUTE.to_string(), id.to_string())],
            color: None,
        }
    }

    fn set(&mut self, name: &str, value: String) {
        match self.entries.iter_mut().find(|(k, _)| k == name) {
            Some((_, v)) => *v = value,
            None => self.entries.push((name.to_string(), value)),
        }
    }

    fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// `name: value` pairs joined by `", "`.
    fn label(&self) -> String {
        self.entries
            .iter()
            .map(|(k, v)| format!("{k}: {v}"))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

// ─── Group graph ────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct Vertex {
    id: String,
    label: String,
    color: Option<Rgba>,
}

/// Arena of vertices addressed by index, plus the pending edge queue.
#[derive(Debug, Default)]
struct GroupGraph {
    vertices: Vec<Vertex>,
    index: HashMap<String, usize>,
    pending_edges: Vec<EdgeSnapshot>,
}

impl GroupGraph {
    fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    fn materialize(&mut self, id: &str, label: String, color: Option<Rgba>) {
        if self.contains(id) {
            return;
        }
        self.index.insert(id.to_string(), self.vertices.len());
        self.vertices.push(Vertex {
            id: id.to_string(),
            label,
            color,
        });
    }

    fn vertex_mut(&mut self, id: &str) -> Option<&mut Vertex> {
        let idx = *self.index.get(id)?;
        self.vertices.get_mut(idx)
    }

    fn drain(&mut self) -> GroupSnapshot {
        GroupSnapshot {
            vertices: self
                .vertices
                .iter()
                .map(|v| VertexSnapshot {
                    id: v.id.clone(),
                    label: v.label.clone(),
                    color: v.color,
                })
                .collect(),
            edges: std::mem::take(&mut self.pending_edges),
        }
    }
}

type SharedGroup = Arc<Mutex<GroupGraph>>;

#[derive(Debug, Default)]
struct Registry {
    groups: BTreeMap<String, SharedGroup>,
    nodes: HashMap<String, Attributes>,
}

// ─── GraphModel ─────────────────────────────────────────────────

/// Thread-safe store of groups, nodes and queued edges.
#[derive(Debug, Default)]
pub struct GraphModel {
    registry: Mutex<Registry>,
    snapshot_seq: AtomicU64,
}

impl GraphModel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the group if absent. Returns `true` if it was created.
    ///
    /// A new group starts empty; known nodes join it the next time they are
    /// referenced through [`GraphModel::ensure_node`].
    pub async fn ensure_group(&self, name: &str) -> bool {
        let mut registry = self.registry.lock().await;
        if registry.groups.contains_key(name) {
            return false;
        }
        registry
            .groups
            .insert(name.to_string(), Arc::new(Mutex::new(GroupGraph::default())));
        tracing::info!(group = %name, "group created");
        true
    }

    /// Register the node if new and materialize it in every existing group
    /// that does not contain it yet. Returns `true` if the node was new.
    pub async fn ensure_node(&self, id: &str) -> bool {
        let mut registry = self.registry.lock().await;
        let is_new = !registry.nodes.contains_key(id);
        let attrs = registry
            .nodes
            .entry(id.to_string())
            .or_insert_with(|| Attributes::seeded(id));
        let (label, color) = (attrs.label(), attrs.color);
        for group in registry.groups.values() {
            group.lock().await.materialize(id, label.clone(), color);
        }
        if is_new {
            tracing::debug!(id = %id, "node registered");
        }
        is_new
    }

    /// Overwrite one attribute and relabel the node in every group holding it.
    ///
    /// An unknown node gets an attribute map but is not materialized anywhere.
    pub async fn set_attribute(&self, id: &str, name: &str, value: impl Into<String>) {
        let mut registry = self.registry.lock().await;
        let attrs = registry
            .nodes
            .entry(id.to_string())
            .or_insert_with(|| Attributes::seeded(id));
        attrs.set(name, value.into());
        let label = attrs.label();
        for group in registry.groups.values() {
            if let Some(vertex) = group.lock().await.vertex_mut(id) {
                vertex.label.clone_from(&label);
            }
        }
    }

    pub async fn attribute(&self, id: &str, name: &str) -> Option<String> {
        let registry = self.registry.lock().await;
        registry
            .nodes
            .get(id)
            .and_then(|a| a.get(name))
            .map(str::to_string)
    }

    /// Queue one observed communication in `group`. Both endpoints must
    /// already be materialized there.
    pub async fn queue_edge(&self, group: &str, from: &str, to: &str) -> Result<(), GraphError> {
        let shared = {
            let registry = self.registry.lock().await;
            registry
                .groups
                .get(group)
                .cloned()
                .ok_or_else(|| GraphError::UnknownGroup(group.to_string()))?
        };
        let mut graph = shared.lock().await;
        let lookup = |node: &str| {
            graph
                .index
                .get(node)
                .copied()
                .ok_or_else(|| GraphError::NodeNotMaterialized {
                    group: group.to_string(),
                    node: node.to_string(),
                })
        };
        let edge = EdgeSnapshot {
            from: lookup(from)?,
            to: lookup(to)?,
        };
        graph.pending_edges.push(edge);
        Ok(())
    }

    /// Color the node by completion fraction in every group holding it.
    /// The color sticks to the node and carries over into groups it joins later.
    pub async fn set_completion_color(&self, id: &str, fraction: f64) {
        let color = Rgba::completion(fraction);
        let mut registry = self.registry.lock().await;
        registry
            .nodes
            .entry(id.to_string())
            .or_insert_with(|| Attributes::seeded(id))
            .color = Some(color);
        for group in registry.groups.values() {
            if let Some(vertex) = group.lock().await.vertex_mut(id) {
                vertex.color = Some(color);
            }
        }
    }

    /// Deep copy of every group, draining each group's pending edges.
    ///
    /// The registry lock is held across all groups so the copy is consistent.
    pub async fn snapshot(&self) -> GraphSnapshot {
        let registry = self.registry.lock().await;
        let mut groups = BTreeMap::new();
        for (name, group) in &registry.groups {
            groups.insert(name.clone(), group.lock().await.drain());
        }
        GraphSnapshot {
            sequence: self.snapshot_seq.fetch_add(1, Ordering::Relaxed),
            taken_at: Utc::now(),
            groups,
        }
    }

    pub async fn group_names(&self) -> Vec<String> {
        self.registry.lock().await.groups.keys().cloned().collect()
    }

    pub async fn node_count(&self) -> usize {
        self.registry.lock().await.nodes.len()
    }
}
