use owo_colors::OwoColorize;
use tokio_util::sync::CancellationToken;

/// Token cancelled when the process is asked to stop: SIGINT (Ctrl+C)
/// or SIGTERM (K8s pod termination). The signal listener is spawned
/// here; clone the token into every loop that must wind down.
pub fn cancel_on_signal() -> CancellationToken {
    let token = CancellationToken::new();
    {
        let token = token.clone();
        tokio::spawn(async move {
            wait_for_signal().await;
            token.cancel();
        });
    }
    token
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sigterm = signal(SignalKind::terminate()).expect("install SIGTERM handler");

        let received = tokio::select! {
            _ = tokio::signal::ctrl_c() => "SIGINT",
            _ = sigterm.recv() => "SIGTERM",
        };
        eprintln!("{}", format!("🛑 {received} received; shutting down").red());
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .expect("install Ctrl+C handler");
        eprintln!("{}", "🛑 Ctrl+C received; shutting down".red());
    }
}
