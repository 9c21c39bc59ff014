//! Renderer seam: where published snapshots go.

use std::io::Write;

use peerviz_core::GraphSnapshot;

/// Consumer of periodic graph snapshots (a window, a log, a file).
pub trait SnapshotSink: Send {
    fn publish(&mut self, snapshot: &GraphSnapshot);

    /// Called once after the last snapshot, when the experiment ends.
    fn finish(&mut self) {}
}

impl<S: SnapshotSink + ?Sized> SnapshotSink for Box<S> {
    fn publish(&mut self, snapshot: &GraphSnapshot) {
        (**self).publish(snapshot);
    }

    fn finish(&mut self) {
        (**self).finish();
    }
}

/// Logs a per-group summary of each snapshot.
#[derive(Debug, Default)]
pub struct LogSink;

impl SnapshotSink for LogSink {
    fn publish(&mut self, snapshot: &GraphSnapshot) {
        for (name, group) in &snapshot.groups {
            if group.edges.is_empty() {
                tracing::trace!(seq = snapshot.sequence, group = %name, vertices = group.vertices.len(), "snapshot");
            } else {
                tracing::debug!(
                    seq = snapshot.sequence,
                    group = %name,
                    vertices = group.vertices.len(),
                    new_edges = group.edges.len(),
                    "snapshot"
                );
            }
        }
    }

    fn finish(&mut self) {
        tracing::info!("snapshot publishing stopped");
    }
}

/// Writes every snapshot as one JSON object per line.
#[derive(Debug)]
pub struct JsonLinesSink<W> {
    out: W,
}

impl<W: Write + Send> JsonLinesSink<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    fn write_line(&mut self, snapshot: &GraphSnapshot) -> std::io::Result<()> {
        serde_json::to_writer(&mut self.out, snapshot)?;
        self.out.write_all(b"\n")?;
        self.out.flush()
    }
}

impl<W: Write + Send> SnapshotSink for JsonLinesSink<W> {
    fn publish(&mut self, snapshot: &GraphSnapshot) {
        if let Err(e) = self.write_line(snapshot) {
            tracing::warn!(seq = snapshot.sequence, error = %e, "failed to write snapshot");
        }
    }
}
