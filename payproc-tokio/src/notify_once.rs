use std::sync::Arc;

use tokio::sync::Semaphore;

/// Sends a notification to all consumers *once*. Used as the daemon-wide
/// shutdown signal: the accept loop, every connection task, and the
/// housekeeping task each hold a clone and `select!` on [`NotifyOnce::recv`].
///
/// - Multi-producer and multi-consumer - clone to get another handle.
/// - Every clone observes the signal at-most-once, even clones made before
///   the signal was sent.
/// - It is safe to call [`send`](Self::send) more than once.
///
/// Implemented by closing a zero-permit [`Semaphore`]: `acquire` on a closed
/// semaphore returns immediately with an error, which we treat as "signal
/// received".
#[derive(Debug)]
pub struct NotifyOnce {
    inner: Arc<Semaphore>,
    have_recved: bool,
}

impl NotifyOnce {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Semaphore::new(0)),
            have_recved: false,
        }
    }

    /// Send the signal. Every waiting and future `recv()` call observes it.
    pub fn send(&self) {
        self.inner.close();
    }

    /// Wait for the signal. If this handle has already observed it, this
    /// future never resolves -- clone a fresh handle first if you need to
    /// check again.
    pub async fn recv(&mut self) {
        if self.have_recved {
            std::future::pending::<()>().await;
        } else {
            self.inner
                .acquire()
                .await
                .map_err(|_| ())
                .expect_err("semaphore should only close, never grant permits");
            self.have_recved = true;
        }
    }

    /// [`recv`](Self::recv) but takes ownership, for APIs wanting
    /// `impl Future<Output = ()> + 'static`.
    pub async fn recv_owned(mut self) {
        self.recv().await
    }

    /// Whether the signal has been sent, without consuming it.
    #[must_use]
    pub fn try_recv(&self) -> bool {
        self.inner.is_closed()
    }
}

impl Clone for NotifyOnce {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            have_recved: false,
        }
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use tokio::time;

    use super::*;

    #[test]
    fn multiple_sends_is_ok() {
        let shutdown = NotifyOnce::new();
        shutdown.send();
        shutdown.send();
    }

    #[tokio::test(start_paused = true)]
    async fn every_clone_observes_once() {
        let shutdown1 = NotifyOnce::new();
        let mut shutdown2 = shutdown1.clone();

        time::sleep(Duration::from_secs(1)).await;
        shutdown1.send();

        time::timeout(Duration::from_millis(1), shutdown2.recv())
            .await
            .expect("should resolve immediately after send");

        // A second recv() on the same handle never resolves again.
        let second = time::timeout(Duration::from_millis(1), shutdown2.recv()).await;
        assert!(second.is_err());

        // But a fresh clone taken after the signal still observes it once.
        let mut shutdown3 = shutdown2.clone();
        assert!(shutdown3.try_recv());
        time::timeout(Duration::from_millis(1), shutdown3.recv())
            .await
            .expect("new clones see a past signal once");
    }
}
