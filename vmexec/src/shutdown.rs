use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Return a token that is cancelled on SIGINT or SIGTERM.
///
/// Must be called from within a tokio runtime.
pub fn install_shutdown_handler() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();

    tokio::spawn(async move {
        wait_for_signal().await;
        trigger.cancel();
    });

    token
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let (Ok(mut sigterm), Ok(mut sigint)) = (
        signal(SignalKind::terminate()),
        signal(SignalKind::interrupt()),
    ) else {
        warn!("failed to install signal handlers; runs cannot be interrupted cleanly");
        return std::future::pending().await;
    };

    tokio::select! {
        _ = sigterm.recv() => info!("received SIGTERM, cancelling run"),
        _ = sigint.recv() => info!("received SIGINT, cancelling run"),
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("received Ctrl-C, cancelling run");
    } else {
        warn!("failed to install Ctrl-C handler; runs cannot be interrupted cleanly");
        std::future::pending::<()>().await;
    }
}
