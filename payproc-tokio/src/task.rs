use std::{
    borrow::Cow,
    fmt::{self, Display},
    future::Future,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

use futures::stream::{FuturesUnordered, StreamExt};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::notify_once::NotifyOnce;

/// Errors from [`join_and_shutdown`].
#[derive(Debug, Error)]
pub enum Error {
    #[error("task finished prematurely: {name}")]
    PrematureFinish { name: Cow<'static, str> },
    #[error("tasks failed to finish before the shutdown timeout: {hung_tasks:?}")]
    Hung { hung_tasks: Vec<String> },
}

/// Waits for `shutdown`, then waits for every task in `tasks` to finish, up
/// to `shutdown_timeout`. If any task finishes on its own before a shutdown
/// signal arrives, that's treated as a bug (all of payproc's "static" tasks
/// -- the accept loop and the housekeeping loop -- are meant to run for the
/// life of the process) and triggers a shutdown of the rest.
pub async fn try_join_and_shutdown(
    tasks: Vec<PpTask<()>>,
    mut shutdown: NotifyOnce,
    shutdown_timeout: Duration,
) -> Result<(), Error> {
    if tasks.is_empty() {
        shutdown.recv().await;
        return Ok(());
    }

    let mut running = tasks.into_iter().map(PpTask::logged).collect::<FuturesUnordered<_>>();
    let mut result = Ok(());

    loop {
        tokio::select! {
            biased;
            () = shutdown.recv() => break,
            Some(name) = running.next() => {
                result = Err(Error::PrematureFinish { name });
                break shutdown.send();
            }
        }
    }

    let shutdown_timeout_fut = tokio::time::sleep(shutdown_timeout);
    tokio::pin!(shutdown_timeout_fut);

    while !running.is_empty() {
        tokio::select! {
            Some(_name) = running.next() => (),
            () = &mut shutdown_timeout_fut => {
                let hung_tasks = running.iter().map(|t| t.name().to_owned()).collect::<Vec<_>>();
                return Err(Error::Hung { hung_tasks });
            }
        }
    }

    result
}

/// [`try_join_and_shutdown`] but logs the outcome, for call sites that just
/// need an `impl Future<Output = ()> + Send + 'static`.
pub async fn join_and_shutdown(
    name: &str,
    tasks: Vec<PpTask<()>>,
    shutdown: NotifyOnce,
    shutdown_timeout: Duration,
) {
    match try_join_and_shutdown(tasks, shutdown, shutdown_timeout).await {
        Ok(()) => info!("{name} tasks finished"),
        Err(e) => error!("{name} tasks errored: {e}"),
    }
}

/// A thin wrapper around [`tokio::task::JoinHandle`] that propagates panics
/// (instead of silently dropping them) and carries a name for logging.
/// `#[must_use]` nudges every spawn site to either join or explicitly
/// [`detach`](Self::detach) the handle.
#[must_use]
pub struct PpTask<T> {
    task: JoinHandle<T>,
    name: Cow<'static, str>,
}

/// A [`PpTask`] wrapper whose [`Future::Output`] is the task's name, logged
/// at an appropriate level when the task finishes.
pub struct LoggedPpTask<T>(PpTask<T>);

struct TaskOutcome<'a> {
    name: &'a str,
    result: Result<(), &'a tokio::task::JoinError>,
}

impl<T> PpTask<T> {
    #[inline]
    #[allow(clippy::disallowed_methods)]
    pub fn spawn<F>(name: impl Into<Cow<'static, str>>, future: F) -> PpTask<F::Output>
    where
        F: Future<Output = T> + Send + 'static,
        F::Output: Send + 'static,
    {
        let name = name.into();
        debug!("spawning task: {name}");
        PpTask {
            task: tokio::spawn(future),
            name,
        }
    }

    /// Drop the handle, letting the task continue running detached. Prefer
    /// joining; use this only when the caller genuinely never needs the
    /// result (e.g. a one-shot IPN verification after `PPIPNHD` has already
    /// returned `OK` to the client).
    #[inline]
    pub fn detach(self) {
        drop(self)
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    #[inline]
    pub fn logged(self) -> LoggedPpTask<T> {
        LoggedPpTask(self)
    }

    #[inline]
    pub fn abort(&self) {
        self.task.abort();
    }
}

impl<T> Future for PpTask<T> {
    type Output = Result<T, tokio::task::JoinError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let result = match Pin::new(&mut self.task).poll(cx) {
            Poll::Ready(result) => result,
            Poll::Pending => return Poll::Pending,
        };

        match result {
            Ok(val) => Poll::Ready(Ok(val)),
            Err(join_err) => {
                let name = self.name().to_owned();
                match join_err.try_into_panic() {
                    Ok(panic_reason) => {
                        error!("task '{name}' panicked");
                        std::panic::resume_unwind(panic_reason)
                    }
                    Err(join_err) => Poll::Ready(Err(join_err)),
                }
            }
        }
    }
}

impl<T> LoggedPpTask<T> {
    #[inline]
    pub fn name(&self) -> &str {
        self.0.name()
    }
}

impl<T> Future for LoggedPpTask<T> {
    type Output = Cow<'static, str>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.0).poll(cx).map(|result| {
            let outcome = TaskOutcome {
                name: self.name(),
                result: result.as_ref().map(|_| ()),
            };
            match &result {
                Ok(_) => info!("{outcome}"),
                Err(e) if e.is_cancelled() => warn!("{outcome}"),
                Err(_) => error!("{outcome}"),
            }
            self.0.name.clone()
        })
    }
}

impl Display for TaskOutcome<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match &self.result {
            Ok(_) => "finished",
            Err(e) if e.is_cancelled() => "cancelled",
            Err(_) => "panicked",
        };
        write!(f, "task '{}' {label}", self.name)?;
        if let Err(e) = self.result {
            write!(f, ": {e}")?;
        }
        Ok(())
    }
}
