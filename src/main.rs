use std::sync::Arc;

use anyhow::Context as _;
use clap::Parser as _;
use pktviz::{
    aggregator::Aggregator,
    api::{self, AppState},
    cli::Cli,
    conf::Conf,
    hub::{BroadcastHub, SubscriberSet},
    source::EventReader,
    stats::{AggregateState, SharedStats},
};
use tokio::{
    net::UnixStream,
    sync::{broadcast, mpsc, Mutex},
    time::timeout,
};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let (conf, _cli) = Conf::new(cli)?;

    tracing_subscriber::fmt()
        .with_max_level(conf.log_level)
        .init();

    info!(
        event.name = "pktviz.starting",
        capture.socket = %conf.capture_socket.display(),
        "starting packet telemetry service"
    );

    // Startup failures here are fatal: no capture stream or no listener
    // means the process must not come up.
    let capture = UnixStream::connect(&conf.capture_socket)
        .await
        .with_context(|| {
            format!(
                "failed to connect to capture socket {}",
                conf.capture_socket.display()
            )
        })?;
    let listener = api::bind(&conf.api).await?;

    let (shutdown_tx, _) = broadcast::channel(4);
    let (events_tx, events_rx) = mpsc::channel(conf.event_channel_capacity);
    let (updates_tx, updates_rx) = mpsc::channel(conf.broadcast_channel_capacity);

    let stats: SharedStats = Arc::new(Mutex::new(AggregateState::new()));
    let subscribers = Arc::new(SubscriberSet::new(conf.subscriber_write_timeout));

    let reader = EventReader::new(capture, events_tx, shutdown_tx.subscribe());
    let aggregator = Aggregator::new(
        events_rx,
        updates_tx,
        stats.clone(),
        conf.rate_window,
        shutdown_tx.subscribe(),
    );
    let hub = BroadcastHub::new(updates_rx, subscribers.clone(), shutdown_tx.subscribe());

    let reader_handle = tokio::spawn(reader.run());
    let aggregator_handle = tokio::spawn(aggregator.run());
    let hub_handle = tokio::spawn(hub.run());

    let state = AppState { stats, subscribers };
    let api_handle = tokio::spawn(api::serve(listener, state, shutdown_tx.subscribe()));

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    info!(
        event.name = "pktviz.shutdown",
        "shutdown signal received, draining workers"
    );
    let _ = shutdown_tx.send(());

    let drained = timeout(conf.shutdown_timeout, async {
        let _ = reader_handle.await;
        let _ = aggregator_handle.await;
        let _ = hub_handle.await;
        match api_handle.await {
            Ok(result) => result.map_err(anyhow::Error::from),
            Err(join_error) => Err(anyhow::Error::from(join_error)),
        }
    })
    .await;

    match drained {
        Ok(result) => result?,
        Err(_) => warn!(
            event.name = "pktviz.shutdown_timeout",
            timeout = ?conf.shutdown_timeout,
            "workers did not drain in time, exiting anyway"
        ),
    }

    info!(event.name = "pktviz.stopped", "shutdown complete");
    Ok(())
}
