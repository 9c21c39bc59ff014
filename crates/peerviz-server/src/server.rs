use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use peerviz_core::{END_ACK, EndBarrier, Event, EventCodec, GraphModel, NO_GROUP_SENTINEL};

use crate::config::ServerConfig;
use crate::error::ServerError;

/// Back-off after a failed `accept` so a persistent error does not spin.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

// ---------------------------------------------------------------------------
// Experiment state
// ---------------------------------------------------------------------------

/// State shared by every connection handler for one experiment run.
#[derive(Debug)]
pub struct ExperimentState {
    model: Arc<GraphModel>,
    barrier: EndBarrier,
    /// Cancelled once the server closes, for any reason.
    shutdown: CancellationToken,
    torn_down: AtomicBool,
    teardowns: AtomicUsize,
}

impl ExperimentState {
    fn new() -> Self {
        Self {
            model: Arc::new(GraphModel::new()),
            barrier: EndBarrier::new(),
            shutdown: CancellationToken::new(),
            torn_down: AtomicBool::new(false),
            teardowns: AtomicUsize::new(0),
        }
    }

    async fn register(&self, id: &str) {
        self.model.ensure_node(id).await;
        self.barrier.register(id).await;
    }

    async fn on_connect(&self, id: &str, group: &str) {
        if group == NO_GROUP_SENTINEL {
            tracing::trace!(id = %id, "ignoring join of sentinel group");
            return;
        }
        self.model.ensure_group(group).await;
        self.register(id).await;
    }

    async fn on_communicate(&self, from: &str, to: &str, group: &str) {
        if group == NO_GROUP_SENTINEL {
            tracing::trace!(from = %from, to = %to, "ignoring communication in sentinel group");
            return;
        }
        // A group first seen through traffic is created here so its
        // endpoints can be materialized before the edge is queued.
        self.model.ensure_group(group).await;
        self.register(from).await;
        self.register(to).await;
        if let Err(e) = self.model.queue_edge(group, from, to).await {
            tracing::warn!(error = %e, "edge dropped");
        }
    }

    async fn on_progress(&self, id: &str, target_name: &str, received: f64, target: f64) {
        self.register(id).await;
        self.model
            .set_attribute(id, target_name, format!("{received}/{target}"))
            .await;
        self.model
            .set_completion_color(id, received / target)
            .await;
    }

    /// Stop accepting and signal the publisher. Runs at most once.
    fn teardown(&self) {
        if self.torn_down.swap(true, Ordering::AcqRel) {
            return;
        }
        self.teardowns.fetch_add(1, Ordering::AcqRel);
        tracing::info!("experiment finished, tearing down");
        self.shutdown.cancel();
    }
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

/// Cloneable view of a running server.
#[derive(Debug, Clone)]
pub struct ServerHandle {
    state: Arc<ExperimentState>,
}

impl ServerHandle {
    pub fn model(&self) -> Arc<GraphModel> {
        Arc::clone(&self.state.model)
    }

    pub fn barrier(&self) -> &EndBarrier {
        &self.state.barrier
    }

    /// Token cancelled when the server closes.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.state.shutdown.clone()
    }

    /// Stop accepting connections and release the listening socket.
    /// Idempotent.
    pub fn close(&self) {
        if !self.state.shutdown.is_cancelled() {
            tracing::info!("server close requested");
        }
        self.state.shutdown.cancel();
    }

    pub fn is_open(&self) -> bool {
        !self.state.shutdown.is_cancelled()
    }

    /// How many times the end-of-experiment teardown has fired (0 or 1).
    pub fn teardown_count(&self) -> usize {
        self.state.teardowns.load(Ordering::Acquire)
    }
}

// ---------------------------------------------------------------------------
// AggregationServer
// ---------------------------------------------------------------------------

/// TCP listener feeding every participant's events into one experiment.
///
/// Protocol: `;`-terminated ASCII events (see [`peerviz_core::codec`]),
/// one connection per participant, `OK` written back after `END`.
pub struct AggregationServer {
    listener: TcpListener,
    state: Arc<ExperimentState>,
    tracker: TaskTracker,
}

impl AggregationServer {
    /// Bind the listening socket. Binding failure is the only fatal error.
    pub async fn open(config: &ServerConfig) -> Result<Self, ServerError> {
        let addr = config.socket_addr();
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ServerError::Bind { addr, source })?;
        Ok(Self {
            listener,
            state: Arc::new(ExperimentState::new()),
            tracker: TaskTracker::new(),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            state: Arc::clone(&self.state),
        }
    }

    /// Accept connections until closed, then wait for every open
    /// connection handler to finish.
    pub async fn run(self) {
        let Self {
            listener,
            state,
            tracker,
        } = self;

        match listener.local_addr() {
            Ok(addr) => tracing::info!(%addr, "aggregation server listening"),
            Err(e) => tracing::warn!(error = %e, "aggregation server listening on unknown address"),
        }

        loop {
            tokio::select! {
                _ = state.shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let state = Arc::clone(&state);
                        tracker.spawn(async move {
                            if let Err(e) = handle_connection(stream, peer, state).await {
                                tracing::debug!(%peer, error = %e, "connection closed with error");
                            }
                        });
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "accept failed");
                        tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                    }
                },
            }
        }

        drop(listener);
        tracing::info!(connections = tracker.len(), "listener closed, draining connections");
        tracker.close();
        tracker.wait().await;
        tracing::info!("aggregation server stopped");
    }
}

// ---------------------------------------------------------------------------
// Per-connection handler
// ---------------------------------------------------------------------------

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    state: Arc<ExperimentState>,
) -> std::io::Result<()> {
    let (reader, writer) = stream.into_split();
    let mut events = FramedRead::new(reader, EventCodec::new());

    tracing::debug!(%peer, "participant connected");

    loop {
        let item = tokio::select! {
            _ = state.shutdown.cancelled() => {
                tracing::debug!(%peer, "server closed, dropping connection");
                return Ok(());
            }
            item = events.next() => item,
        };

        let event = match item {
            None => {
                tracing::debug!(%peer, "participant disconnected (EOF)");
                return Ok(());
            }
            Some(Err(e)) => return Err(e),
            Some(Ok(Err(e))) => {
                tracing::warn!(%peer, error = %e, "dropping malformed event");
                continue;
            }
            Some(Ok(Ok(event))) => event,
        };

        match event {
            Event::Connect { id, group } => state.on_connect(&id, &group).await,
            Event::Communicate { from, to, group } => {
                state.on_communicate(&from, &to, &group).await
            }
            Event::Progress {
                id,
                target_name,
                received,
                target,
            } => state.on_progress(&id, &target_name, received, target).await,
            Event::End { id } => return finish_participant(&id, peer, writer, &state).await,
        }
    }
}

/// Hold the participant at the end barrier, acknowledge, and tear down.
async fn finish_participant(
    id: &str,
    peer: SocketAddr,
    mut writer: OwnedWriteHalf,
    state: &ExperimentState,
) -> std::io::Result<()> {
    tracing::info!(%peer, id = %id, "participant waiting at end barrier");

    // Release wins over shutdown: a participant released by the barrier
    // still gets its acknowledgement after teardown has cancelled the token.
    let outcome = tokio::select! {
        biased;
        outcome = state.barrier.request_end(id) => outcome,
        _ = state.shutdown.cancelled() => {
            tracing::info!(%peer, id = %id, "server closed before end barrier released");
            return Ok(());
        }
    };
    tracing::debug!(%peer, id = %id, ?outcome, "end barrier passed");

    let acked = async {
        writer.write_all(END_ACK).await?;
        writer.shutdown().await
    }
    .await;
    state.teardown();
    acked
}
