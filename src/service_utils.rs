use crate::mqtt_service::MqttService;
use axum::Router;
use std::future::IntoFuture;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Time in-flight requests get to finish once shutdown was requested.
pub const SHUTDOWN_GRACE_PERIOD: Duration = Duration::from_secs(5);

pub fn shutdown_channel() -> (watch::Sender<bool>, watch::Receiver<bool>) {
    watch::channel(false)
}

/// Resolves once the sender flipped to true or went away.
pub async fn shutdown_requested(mut shutdown: watch::Receiver<bool>) {
    while !*shutdown.borrow_and_update() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

/// Start the MQTT service
pub fn start_mqtt_service(
    mqtt_service: Arc<MqttService>,
    shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        mqtt_service.start(shutdown).await;
    })
}

/// Serves `router` until shutdown, then waits at most
/// [`SHUTDOWN_GRACE_PERIOD`] for open requests.
pub fn serve(
    name: &'static str,
    listener: TcpListener,
    router: Router,
    shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        match listener.local_addr() {
            Ok(addr) => info!(server = name, %addr, "listening"),
            Err(e) => warn!(server = name, error = %e, "unable to read listener address"),
        }
        let graceful = shutdown.clone();
        let server = axum::serve(listener, router)
            .with_graceful_shutdown(shutdown_requested(graceful))
            .into_future();
        tokio::pin!(server);

        tokio::select! {
            result = &mut server => {
                if let Err(e) = result {
                    error!(server = name, error = %e, "server failed");
                }
                return;
            }
            _ = shutdown_requested(shutdown) => {}
        }
        match tokio::time::timeout(SHUTDOWN_GRACE_PERIOD, server).await {
            Ok(Ok(())) => info!(server = name, "server stopped"),
            Ok(Err(e)) => error!(server = name, error = %e, "server failed"),
            Err(_) => warn!(server = name, "grace period elapsed, dropping open requests"),
        }
    })
}

/// Waits for ctrl-c or SIGTERM and tells everybody listening on `shutdown`.
pub async fn handle_shutdown(shutdown: watch::Sender<bool>) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to handle termination signal: {:?}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {:?}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("Bridge is shutting down...");
    let _ = shutdown.send(true);
}
