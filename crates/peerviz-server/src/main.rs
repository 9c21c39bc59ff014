//! peerviz: observer process for a peer-to-peer experiment.
//! Listens for participant events, keeps the live group graph, publishes
//! snapshots, and exits once every participant has asked to end.

use clap::Parser;

use peerviz_server::{AggregationServer, JsonLinesSink, LogSink, SnapshotPublisher, SnapshotSink};

mod cli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = cli::Cli::parse();

    let filter = std::env::var("PEERVIZ_LOG")
        .or_else(|_| std::env::var("RUST_LOG"))
        .unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(filter))
        .with_writer(std::io::stderr)
        .init();

    let config = args.server_config();
    let server = AggregationServer::open(&config).await?;
    let handle = server.handle();
    tracing::info!(addr = %server.local_addr()?, "peerviz online");

    let sink: Box<dyn SnapshotSink> = if args.emit_json {
        Box::new(JsonLinesSink::new(std::io::stdout()))
    } else {
        Box::new(LogSink)
    };
    let publisher = SnapshotPublisher::new(
        handle.model(),
        sink,
        config.snapshot_interval,
        handle.shutdown_token(),
    );
    let publisher_task = tokio::spawn(publisher.run());

    let signal_handle = handle.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        signal_handle.close();
    });

    server.run().await;
    publisher_task.await?;

    tracing::info!(teardowns = handle.teardown_count(), "peerviz stopped");
    Ok(())
}

/// Resolves on ctrl-c or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => tracing::info!("received ctrl-c, shutting down"),
                    _ = sigterm.recv() => tracing::info!("received SIGTERM, shutting down"),
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to register SIGTERM handler");
                ctrl_c.await.ok();
                tracing::info!("received ctrl-c, shutting down");
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        tracing::info!("received ctrl-c, shutting down");
    }
}
