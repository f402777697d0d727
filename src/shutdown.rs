use tokio::sync::broadcast;

/// Listens for the server shutdown signal.
///
/// The signal is sent once, through a `broadcast::Sender` held by the server,
/// and each connection handler keeps its own `Shutdown`. Once the signal has
/// been observed, `is_shutdown` stays true.
#[derive(Debug)]
pub struct Shutdown {
    is_shutdown: bool,
    notify: broadcast::Receiver<()>,
}

impl Shutdown {
    pub(crate) fn new(notify: broadcast::Receiver<()>) -> Shutdown {
        Shutdown {
            is_shutdown: false,
            notify,
        }
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        self.is_shutdown
    }

    /// Wait for the shutdown notice. Dropping the sender counts as one.
    pub(crate) async fn recv(&mut self) {
        if self.is_shutdown {
            return;
        }
        let _ = self.notify.recv().await;
        self.is_shutdown = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn dropping_the_sender_shuts_down() {
        let (tx, _) = broadcast::channel(1);
        let mut shutdown = Shutdown::new(tx.subscribe());
        assert!(!shutdown.is_shutdown());
        drop(tx);
        shutdown.recv().await;
        assert!(shutdown.is_shutdown());
        // Already observed: returns immediately.
        shutdown.recv().await;
    }
}
