use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

/// Install a handler that cancels the returned token on SIGTERM or SIGINT.
///
/// The upload loop checks the token between steps, so a signal stops it at
/// the next snapshot point rather than mid-submission.
pub fn install_shutdown_handler() -> std::io::Result<CancellationToken> {
    let token = CancellationToken::new();
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    let cancel = token.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => {
                tracing::info!("Received SIGTERM, stopping upload");
            }
            _ = sigint.recv() => {
                tracing::info!("Received SIGINT, stopping upload");
            }
        }
        cancel.cancel();
    });

    Ok(token)
}
