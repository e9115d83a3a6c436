//! Application entry point: Potion Monitor.
//!
//! # Startup sequence
//!
//! 1. Initialise logging.
//! 2. Load [`AppConfig`] from disk (returns default on first run).
//! 3. Create the [`tokio`] runtime.
//! 4. Build the sensor (moving-average filter over the simulated probe) and
//!    the voice adapter (transcripts read line by line from stdin).
//! 5. Spawn the delivery connector over [`HttpTransport`].
//! 6. Create the broadcast hub and the integrator, then start the
//!    websocket server.
//! 7. Run the integrator until Ctrl-C, then drain and exit.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use potion_monitor::{
    adapters::{CommandParser, FilteredSensor, SimulatedProbe, TranscriptVoice},
    broadcast::BroadcastHub,
    config::AppConfig,
    delivery::{DeliveryConnector, DeliveryTransport, HttpTransport},
    integrator::SystemIntegrator,
    server::{self, ServerState},
};

/// Buffered transcripts waiting for the next cycle.
const TRANSCRIPT_BUFFER: usize = 32;

fn main() -> anyhow::Result<()> {
    // 1. Logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    log::info!("Potion Monitor starting up");

    // 2. Configuration
    let config = AppConfig::load().unwrap_or_else(|e| {
        log::warn!("Failed to load config ({e}); using defaults");
        AppConfig::default()
    });

    // 3. Tokio runtime
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to create tokio runtime")?;

    let result = rt.block_on(run(config));
    // The stdin reader sits on a blocking thread that never returns by itself.
    rt.shutdown_timeout(Duration::from_secs(1));
    result
}

async fn run(config: AppConfig) -> anyhow::Result<()> {
    let cancel = CancellationToken::new();

    // 4. Adapters
    let sensor = FilteredSensor::new(SimulatedProbe::default(), config.sensor.clone());

    let (transcript_tx, transcript_rx) = mpsc::channel::<String>(TRANSCRIPT_BUFFER);
    tokio::spawn(read_transcripts(transcript_tx));
    let voice = TranscriptVoice::new(transcript_rx, CommandParser::default());

    // 5. Delivery connector
    let http = HttpTransport::from_config(&config.delivery);
    if !http.is_configured() {
        log::warn!(
            "delivery endpoints not fully configured; deliveries will fail until \
             `delivery.sensor_endpoint` and `delivery.command_endpoint` are set"
        );
    }
    let transport: Arc<dyn DeliveryTransport> = Arc::new(http);
    let (connector, reports, delivery_worker) = DeliveryConnector::spawn(
        &config.delivery,
        transport,
        config.integrator.shutdown_grace(),
        cancel.clone(),
    );

    // 6. Broadcast hub, integrator and websocket server
    let hub = Arc::new(BroadcastHub::from_config(&config.broadcast));
    let integrator = SystemIntegrator::new(
        config.integrator.clone(),
        Box::new(sensor),
        Box::new(voice),
        Arc::new(connector),
        reports,
        Arc::clone(&hub),
        cancel.clone(),
    )
    .with_delivery_worker(delivery_worker);

    let listener = TcpListener::bind(&config.broadcast.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.broadcast.bind_addr))?;
    let server_state = ServerState {
        hub,
        commands: integrator.command_sender(),
        snapshots: integrator.subscribe_state(),
    };
    let server = tokio::spawn(server::serve(listener, server_state, cancel.clone()));

    // 7. Run until Ctrl-C
    let shutdown = integrator.shutdown_handle();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => log::info!("Ctrl-C received, shutting down"),
            Err(e) => log::error!("failed to listen for Ctrl-C ({e}); shutting down"),
        }
        shutdown.cancel();
    });

    let final_state = integrator.run().await;
    log::info!(
        "stopped after {} cycle(s) in {} mode",
        final_state.cycle,
        final_state.mode
    );

    match server.await {
        Ok(result) => result?,
        Err(e) => log::error!("server task failed: {e}"),
    }
    Ok(())
}

/// Forward stdin lines to the voice adapter until EOF.
async fn read_transcripts(tx: mpsc::Sender<String>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if tx.send(line).await.is_err() {
                    break;
                }
            }
            Ok(None) => {
                // Keep the source open but silent so voice health stays clean.
                log::info!("stdin closed, no further transcripts");
                tx.closed().await;
                break;
            }
            Err(e) => {
                log::warn!("failed to read transcript from stdin: {e}");
                break;
            }
        }
    }
}
