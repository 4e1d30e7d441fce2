use tokio::sync::watch;

/// Sending side of a cancellation signal.
///
/// The signal is a latch: once `true` it stays `true`.
pub type ShutdownTx = watch::Sender<bool>;

/// Receiving side of a cancellation signal.
pub type ShutdownRx = watch::Receiver<bool>;

/// Creates a cancellation signal in the not cancelled state.
pub fn create_shutdown_channel() -> (ShutdownTx, ShutdownRx) {
    watch::channel(false)
}

/// Requests cancellation. Returns whether this call changed the state.
pub fn trigger_shutdown(tx: &ShutdownTx) -> bool {
    tx.send_if_modified(|cancelled| {
        if *cancelled {
            false
        } else {
            *cancelled = true;
            true
        }
    })
}

pub fn is_shutdown(rx: &ShutdownRx) -> bool {
    *rx.borrow()
}

/// Resolves once cancellation was requested.
///
/// Never resolves when the sender is dropped without cancelling.
pub async fn wait_for_shutdown(rx: &mut ShutdownRx) {
    if rx.wait_for(|cancelled| *cancelled).await.is_err() {
        std::future::pending::<()>().await;
    }
}
