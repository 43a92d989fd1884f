//! Process-wide context: the timer [`Scheduler`] and the background-task
//! reaper.
//!
//! Both are created once by the application and handed to every
//! [`crate::socket::Socket`] and [`crate::reliable_udp::ReliableUdp`] it
//! constructs.  There is no global state.
//!
//! # Reaper
//!
//! Background accept, connect and read tasks are spawned through
//! [`Context::spawn`].  Their join handles go to a single reaper task that
//! periodically joins whichever have finished (normally, by abort, or by
//! panic).  Callers only ever hold an [`AbortHandle`], so tearing a socket
//! down never waits on its background work.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::{AbortHandle, JoinHandle};

use crate::config::REAP_INTERVAL;
use crate::scheduler::Scheduler;

enum Reap {
    Adopt(&'static str, JoinHandle<()>),
    Shutdown(oneshot::Sender<()>),
}

/// Shared handle to the scheduler and reaper.  Cheap to clone.
#[derive(Clone)]
pub struct Context {
    scheduler: Scheduler,
    reap_tx: mpsc::UnboundedSender<Reap>,
    reclaimed: Arc<AtomicUsize>,
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("timers", &self.scheduler.pending())
            .field("reclaimed", &self.reclaimed())
            .finish()
    }
}

impl Context {
    /// Create the context and start the reaper.
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime.
    pub fn new() -> Self {
        let (reap_tx, reap_rx) = mpsc::unbounded_channel();
        let reclaimed = Arc::new(AtomicUsize::new(0));
        tokio::spawn(reaper(reap_rx, Arc::clone(&reclaimed)));
        log::debug!("[reaper] started");
        Self {
            scheduler: Scheduler::new(),
            reap_tx,
            reclaimed,
        }
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Spawn background work whose handle is owned by the reaper.
    ///
    /// If the reaper has already shut down the task is aborted immediately.
    pub fn spawn<F>(&self, name: &'static str, fut: F) -> AbortHandle
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(fut);
        let abort = handle.abort_handle();
        if self.reap_tx.send(Reap::Adopt(name, handle)).is_err() {
            log::warn!("[reaper] not running; aborting {name}");
            abort.abort();
        }
        abort
    }

    /// Number of background tasks joined so far.
    pub fn reclaimed(&self) -> usize {
        self.reclaimed.load(Ordering::Relaxed)
    }

    /// Abort and join every outstanding background task, then stop the
    /// reaper.  Later [`spawn`](Self::spawn) calls abort immediately.
    pub async fn shutdown(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.reap_tx.send(Reap::Shutdown(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
    }
}

async fn reaper(mut rx: mpsc::UnboundedReceiver<Reap>, reclaimed: Arc<AtomicUsize>) {
    let mut live: Vec<(&'static str, JoinHandle<()>)> = Vec::new();
    let mut tick = tokio::time::interval(REAP_INTERVAL);

    let done = loop {
        tokio::select! {
            cmd = rx.recv() => match cmd {
                Some(Reap::Adopt(name, handle)) => live.push((name, handle)),
                Some(Reap::Shutdown(done)) => break Some(done),
                // Every context clone is gone.
                None => break None,
            },
            _ = tick.tick() => {
                let mut i = 0;
                while i < live.len() {
                    if live[i].1.is_finished() {
                        let (name, handle) = live.swap_remove(i);
                        join(name, handle, &reclaimed).await;
                    } else {
                        i += 1;
                    }
                }
            }
        }
    };

    rx.close();
    for (name, handle) in live {
        handle.abort();
        join(name, handle, &reclaimed).await;
    }
    log::debug!("[reaper] stopped");
    if let Some(done) = done {
        let _ = done.send(());
    }
}

async fn join(name: &'static str, handle: JoinHandle<()>, reclaimed: &AtomicUsize) {
    match handle.await {
        Ok(()) => log::trace!("[reaper] joined {name}"),
        Err(e) if e.is_cancelled() => log::trace!("[reaper] joined aborted {name}"),
        Err(e) => log::error!("[reaper] {name} panicked: {e}"),
    }
    reclaimed.fetch_add(1, Ordering::Relaxed);
}
