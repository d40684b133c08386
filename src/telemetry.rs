//! Process-wide tracing + metrics init, shared by every binary.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Initialize the tracing subscriber. Safe to call once per process; later
/// calls are a no-op panic-free (guarded by `try_init`'s own idempotency in
/// the EnvFilter path below would panic, so callers must only invoke this
/// from `main`).
pub fn init_tracing(default_directive: &str) {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_directive.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Install the Prometheus recorder and return the exporter handle used by
/// the gateway's `/metrics` route.
pub fn init_metrics() -> metrics_exporter_prometheus::PrometheusHandle {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .install_recorder()
        .expect("failed to install prometheus recorder")
}

/// Resolves on SIGINT or SIGTERM — both invoke the same shutdown path. Pass
/// to `axum::serve(..).with_graceful_shutdown(..)` so the HTTP
/// server stops accepting new requests and drains in-flight ones (grace
/// bounded by the listener's own keep-alive settings) before the binary's
/// `main` proceeds to flush its DB pool and other owned resources.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.ok();
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("shutdown signal received, draining in-flight work");
}
