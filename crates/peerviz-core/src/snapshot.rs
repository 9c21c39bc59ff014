//! Immutable point-in-time copies of the graph model, handed to renderers.

use std::collections::BTreeMap;
use std::f64::consts::PI;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Channel intensity shared by the red and green ends of the completion gradient.
const COMPLETION_INTENSITY: f32 = 0.640625;
const COMPLETION_ALPHA: f32 = 0.9;

/// RGBA color with channels in `[0.0, 1.0]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Rgba(pub [f32; 4]);

impl Rgba {
    /// Red at 0.0, green at 1.0, linear in between. Out-of-range input is clamped.
    pub fn completion(fraction: f64) -> Self {
        let f = if fraction.is_nan() {
            0.0
        } else {
            fraction.clamp(0.0, 1.0) as f32
        };
        Self([
            (1.0 - f) * COMPLETION_INTENSITY,
            f * COMPLETION_INTENSITY,
            0.0,
            COMPLETION_ALPHA,
        ])
    }
}

/// One node as materialized inside one group.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VertexSnapshot {
    pub id: String,
    pub label: String,
    pub color: Option<Rgba>,
}

/// Directed edge between two vertex indices of the same group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EdgeSnapshot {
    pub from: usize,
    pub to: usize,
}

/// A group's vertices and the edges observed since the previous snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct GroupSnapshot {
    pub vertices: Vec<VertexSnapshot>,
    pub edges: Vec<EdgeSnapshot>,
}

impl GroupSnapshot {
    pub fn vertex(&self, id: &str) -> Option<&VertexSnapshot> {
        self.vertices.iter().find(|v| v.id == id)
    }

    /// Edges resolved to node identifiers.
    pub fn edge_ids(&self) -> Vec<(&str, &str)> {
        self.edges
            .iter()
            .filter_map(|e| {
                let from = self.vertices.get(e.from)?;
                let to = self.vertices.get(e.to)?;
                Some((from.id.as_str(), to.id.as_str()))
            })
            .collect()
    }

    /// Spread vertices evenly over a circle, pushing the right half further
    /// right and the left half further left so the two halves separate.
    pub fn ring_layout(&self, radius: f64) -> Vec<(f64, f64)> {
        let total = self.vertices.len();
        match total {
            0 => Vec::new(),
            1 => vec![(1.0, 1.0)],
            _ => (0..total)
                .map(|n| {
                    let rads = 2.0 * PI / total as f64 * n as f64;
                    let x = radius * rads.cos();
                    let y = radius * rads.sin();
                    let shift = if x > 0.0 { radius } else { -radius };
                    (x + 0.2 * shift, y)
                })
                .collect(),
        }
    }
}

/// All groups at one instant. Keys are group names.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GraphSnapshot {
    pub sequence: u64,
    pub taken_at: DateTime<Utc>,
    pub groups: BTreeMap<String, GroupSnapshot>,
}

impl GraphSnapshot {
    pub fn group(&self, name: &str) -> Option<&GroupSnapshot> {
        self.groups.get(name)
    }

    pub fn edge_count(&self) -> usize {
        self.groups.values().map(|g| g.edges.len()).sum()
    }
}
