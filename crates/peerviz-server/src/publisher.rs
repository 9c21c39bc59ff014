//! Snapshot publisher: drains the graph model on a fixed cadence and hands
//! each copy to the renderer sink until the server shuts down.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;

use peerviz_core::GraphModel;

use crate::sink::SnapshotSink;

pub struct SnapshotPublisher<S> {
    model: Arc<GraphModel>,
    sink: S,
    period: Duration,
    shutdown: CancellationToken,
}

impl<S: SnapshotSink> SnapshotPublisher<S> {
    /// `period` must be non-zero.
    pub fn new(
        model: Arc<GraphModel>,
        sink: S,
        period: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            model,
            sink,
            period,
            shutdown,
        }
    }

    /// Publish until `shutdown` is cancelled, then publish one final
    /// snapshot so the last edge delta reaches the sink. Returns the sink.
    pub async fn run(mut self) -> S {
        let mut ticker = interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let snapshot = self.model.snapshot().await;
                    self.sink.publish(&snapshot);
                }
            }
        }

        let last = self.model.snapshot().await;
        self.sink.publish(&last);
        self.sink.finish();
        self.sink
    }
}
