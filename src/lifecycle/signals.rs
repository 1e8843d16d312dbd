//! OS signal handling.
//!
//! The proxy runs under a supervisor. An interactive interrupt (Ctrl-C,
//! SIGINT reaching the whole process group) must not take it down, so that
//! signal is consumed and logged. SIGTERM from the supervisor starts a
//! graceful shutdown.

use tokio::task::JoinHandle;

/// Consume interrupt signals for the rest of the process lifetime.
///
/// The handler is installed before this returns, so an interrupt arriving
/// before the listening task first runs is already swallowed.
#[cfg(unix)]
pub fn ignore_interrupt() -> std::io::Result<JoinHandle<()>> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut interrupts = signal(SignalKind::interrupt())?;
    Ok(tokio::spawn(async move {
        while interrupts.recv().await.is_some() {
            tracing::info!("Interrupt received, ignoring; send SIGTERM to stop");
        }
    }))
}

/// Consume interrupt signals for the rest of the process lifetime.
#[cfg(not(unix))]
pub fn ignore_interrupt() -> std::io::Result<JoinHandle<()>> {
    Ok(tokio::spawn(async {
        loop {
            match tokio::signal::ctrl_c().await {
                Ok(()) => tracing::info!("Interrupt received, ignoring"),
                Err(e) => {
                    tracing::warn!(error = %e, "Cannot listen for interrupt signals");
                    return;
                }
            }
        }
    }))
}

/// Resolve when the supervisor asks the process to stop.
#[cfg(unix)]
pub async fn terminate() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = signal(SignalKind::terminate())?;
    term.recv().await;
    Ok(())
}

/// Resolve when the supervisor asks the process to stop.
#[cfg(not(unix))]
pub async fn terminate() -> std::io::Result<()> {
    std::future::pending().await
}

/// Wait for the signal that should stop the process.
///
/// With `ignore_interrupt` unset, Ctrl-C also stops it.
pub async fn stop_requested(ignore_interrupt: bool) {
    let interrupt = async {
        if ignore_interrupt {
            std::future::pending::<()>().await;
        } else if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "Cannot listen for interrupt signals");
            std::future::pending::<()>().await;
        }
    };

    let term = async {
        if let Err(e) = terminate().await {
            tracing::warn!(error = %e, "Cannot listen for SIGTERM");
            std::future::pending::<()>().await;
        }
    };

    tokio::select! {
        _ = term => tracing::info!("Termination requested"),
        _ = interrupt => tracing::info!("Interrupt received, stopping"),
    }
}
