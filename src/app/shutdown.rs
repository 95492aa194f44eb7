use tokio::signal;
#[cfg(unix)]
use tokio::signal::unix::{SignalKind, signal as unix_signal};
use tokio::sync::watch;
use tracing::{error, info};

/// Why the process is shutting down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    Interrupt,
    Terminate,
    InputClosed,
}

/// Broadcasts the first Ctrl+C or SIGTERM to any number of waiters.
#[derive(Debug, Clone)]
pub struct SignalHandler {
    triggered: watch::Receiver<Option<ShutdownReason>>,
}

impl SignalHandler {
    /// Installs the OS signal listeners on the current runtime.
    pub fn install() -> Self {
        let (tx, rx) = watch::channel(None);
        tokio::spawn(async move {
            let reason = wait_for_signal().await;
            let _ = tx.send(Some(reason));
        });
        Self { triggered: rx }
    }

    pub fn reason(&self) -> Option<ShutdownReason> {
        *self.triggered.borrow()
    }

    /// Resolves once a signal has been received.
    pub async fn wait(&mut self) -> ShutdownReason {
        match self.triggered.wait_for(Option::is_some).await {
            Ok(reason) => (*reason).unwrap_or(ShutdownReason::Interrupt),
            Err(_) => ShutdownReason::Interrupt,
        }
    }
}

#[cfg(unix)]
async fn wait_for_signal() -> ShutdownReason {
    let mut sigterm = match unix_signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(e) => {
            tracing::warn!("Failed to install SIGTERM handler, only Ctrl+C will stop: {}", e);
            return wait_for_ctrl_c().await;
        }
    };

    tokio::select! {
        reason = wait_for_ctrl_c() => reason,
        _ = sigterm.recv() => {
            info!("Received SIGTERM, initiating graceful shutdown");
            ShutdownReason::Terminate
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> ShutdownReason {
    wait_for_ctrl_c().await
}

async fn wait_for_ctrl_c() -> ShutdownReason {
    match signal::ctrl_c().await {
        Ok(()) => info!("Received SIGINT (Ctrl+C), initiating graceful shutdown"),
        Err(err) => {
            error!("Failed to listen for SIGINT: {}", err);
            std::future::pending::<()>().await;
        }
    }
    ShutdownReason::Interrupt
}
