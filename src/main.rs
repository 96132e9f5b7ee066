use actix::Actor;
use anyhow::Result;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::StreamExt;
use tracing::{debug, error, info, trace, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use voice_device_bridge::config::AppConfig;
use voice_device_bridge::events::{BridgeEvent, EventBus};
use voice_device_bridge::session::server::Shutdown;
use voice_device_bridge::session::BridgeServer;
use voice_device_bridge::state::AppState;

#[actix_web::main]
async fn main() -> Result<()> {
    // .env is optional
    dotenv::dotenv().ok();

    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting voice-device-bridge v{}", env!("CARGO_PKG_VERSION"));
    info!(
        "Configuration loaded: {}:{} (devices on {})",
        config.server.host, config.server.port, config.server.ws_path
    );

    let bus = EventBus::new(config.bridge.event_capacity);
    spawn_event_log(&bus);

    let bridge = BridgeServer::new(&config, bus.clone()).start();
    let app_state = AppState::new(bridge.clone(), config.clone(), bus);

    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    let (server, addrs) = voice_device_bridge::build_server(app_state, &bind_addr)?;
    info!("HTTP server listening on {:?}", addrs);

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    tokio::select! {
        result = server_task => {
            match result {
                Ok(Err(e)) => error!("Server error: {}", e),
                Err(e) => error!("Server task error: {}", e),
                Ok(Ok(())) => {}
            }
        }
        _ = wait_for_shutdown() => {
            info!("Shutdown signal received, closing device sessions...");
            if let Err(e) = bridge.send(Shutdown).await {
                warn!("Bridge already stopped: {}", e);
            }
            server_handle.stop(true).await;
        }
    }

    info!("Server stopped gracefully");
    Ok(())
}

fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "voice_device_bridge=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init()?;

    Ok(())
}

/// Log every bridge event, chunk progress included, until the bus closes.
fn spawn_event_log(bus: &EventBus) {
    let mut events = bus.stream().merge(bus.chunk_stream());

    actix_web::rt::spawn(async move {
        while let Some(item) = events.next().await {
            match item {
                Ok(BridgeEvent::AudioComplete { device_id, stream_id, audio, .. }) => {
                    info!(device_id = %device_id, stream_id = %stream_id, bytes = audio.len(), "Recording ready");
                }
                Ok(BridgeEvent::AudioChunk { device_id, stream_id, chunk_index, bytes }) => {
                    trace!(device_id = %device_id, stream_id = %stream_id, chunk_index, bytes, "Audio chunk");
                }
                Ok(event) => {
                    debug!(event = event.name(), device_id = event.device_id(), "Bridge event");
                }
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    warn!(skipped, "Event log fell behind");
                }
            }
        }
    });
}

async fn wait_for_shutdown() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for SIGINT: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
