use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

/// Install a handler that cancels the returned token on SIGTERM or SIGINT.
///
/// The runner races this token against device acquisition and the stage
/// command, so an interrupted stage is recorded as failed before exit.
pub fn install_shutdown_handler() -> std::io::Result<CancellationToken> {
    let token = CancellationToken::new();
    let token_clone = token.clone();

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => {
                tracing::warn!("Received SIGTERM, stopping current stage");
            }
            _ = sigint.recv() => {
                tracing::warn!("Received SIGINT, stopping current stage");
            }
        }

        token_clone.cancel();
    });

    Ok(token)
}
