use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Waits for SIGTERM or SIGINT (Ctrl-C elsewhere) and cancels `token`.
///
/// Returns early without cancelling when the token is cancelled by someone
/// else first.
pub async fn listen_shutdown(token: CancellationToken) {
    tokio::select! {
        _ = token.cancelled() => {}
        signal = wait_for_signal() => {
            match signal {
                Some(name) => warn!("shutdown signal received: {name}"),
                None => warn!("no shutdown signal handler available, stopping"),
            }
            token.cancel();
        }
    }
}

async fn wait_for_signal() -> Option<&'static str> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let (mut sigterm, mut sigint) = match (
            signal(SignalKind::terminate()),
            signal(SignalKind::interrupt()),
        ) {
            (Ok(term), Ok(int)) => (term, int),
            (Err(err), _) | (_, Err(err)) => {
                warn!("failed to install unix signal handlers: error={err}");
                return ctrl_c().await;
            }
        };

        tokio::select! {
            _ = sigterm.recv() => Some("SIGTERM"),
            _ = sigint.recv() => Some("SIGINT"),
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c().await
    }
}

async fn ctrl_c() -> Option<&'static str> {
    match tokio::signal::ctrl_c().await {
        Ok(()) => Some("SIGINT"),
        Err(err) => {
            warn!("failed to listen for ctrl-c: error={err}");
            None
        }
    }
}
