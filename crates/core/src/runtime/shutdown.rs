use tokio::signal;
use tokio_util::sync::CancellationToken;

/// Manages graceful shutdown via CancellationToken.
/// Listens for SIGTERM and Ctrl+C and cancels the token.
#[derive(Debug)]
pub struct ShutdownGuard {
    token: CancellationToken,
}

impl ShutdownGuard {
    pub fn new() -> Self {
        Self::with_token(CancellationToken::new())
    }

    /// Wrap an existing token, e.g. one owned by an embedding application.
    pub fn with_token(token: CancellationToken) -> Self {
        Self { token }
    }

    /// The cancellation token that all tasks should monitor.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn trigger(&self) {
        self.token.cancel();
    }

    pub fn is_triggered(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Spawn a background task that listens for OS signals and triggers cancellation.
    /// The task ends quietly if the token is cancelled some other way first.
    pub fn spawn_signal_listener(&self) {
        let token = self.token.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => return,
                received = wait_for_signal() => match received {
                    Some(name) => tracing::info!(signal = name, "received signal, initiating shutdown"),
                    None => return,
                },
            }
            token.cancel();
        });
    }
}

impl Default for ShutdownGuard {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(unix)]
async fn wait_for_signal() -> Option<&'static str> {
    let mut sigterm = match signal::unix::signal(signal::unix::SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!(error = %e, "failed to register SIGTERM handler");
            return None;
        }
    };
    tokio::select! {
        _ = sigterm.recv() => Some("SIGTERM"),
        res = signal::ctrl_c() => match res {
            Ok(()) => Some("SIGINT"),
            Err(e) => {
                tracing::warn!(error = %e, "failed to listen for Ctrl+C");
                None
            }
        },
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> Option<&'static str> {
    match signal::ctrl_c().await {
        Ok(()) => Some("Ctrl+C"),
        Err(e) => {
            tracing::warn!(error = %e, "failed to listen for Ctrl+C");
            None
        }
    }
}
