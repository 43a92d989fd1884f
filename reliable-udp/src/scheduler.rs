//! Cooperative deferred-callback scheduling.
//!
//! A [`Scheduler`] owns the set of pending timers.  Each [`Timer`] is owned
//! by exactly one client; starting it registers an absolute expiry with the
//! scheduler, dropping it removes the registration unconditionally.
//!
//! Nothing here runs on its own execution context.  The control loop calls
//! [`Scheduler::dispatch`], which fires every timer whose expiry has elapsed,
//! in expiry order, synchronously.  Timers are one-shot: a client that wants
//! periodic behaviour calls [`Timer::start`] again from its own callback.
//!
//! ```text
//!   client ──start(delay)──▶ Scheduler { (expiry, id) … } ◀──dispatch(now)── control loop
//!      ▲                                                        │
//!      └──────────────────── fire(id) ──────────────────────────┘
//! ```
//!
//! Several clients can share one scheduler.  A client that owns many timers
//! creates them with [`Scheduler::timer_for`] and an [`Expiries`] mailbox;
//! [`Scheduler::run_due`] then routes each expiry to its owner's mailbox and
//! the owner handles it on its own turn of the loop.
//!
//! Time is [`tokio::time::Instant`] so tests can pause and advance the clock.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;

/// Identity of one [`Timer`] within its scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

#[derive(Debug, Default)]
struct Pending {
    next_id: u64,
    /// Ordered by expiry, ties broken by id (registration order).
    queue: BTreeSet<(Instant, TimerId)>,
    expiry: HashMap<TimerId, Instant>,
    mailboxes: HashMap<TimerId, mpsc::UnboundedSender<TimerId>>,
}

impl Pending {
    fn remove(&mut self, id: TimerId) -> bool {
        match self.expiry.remove(&id) {
            Some(at) => self.queue.remove(&(at, id)),
            None => false,
        }
    }
}

fn lock(inner: &Mutex<Pending>) -> MutexGuard<'_, Pending> {
    inner.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Mailbox receiving the ids of expired timers created with
/// [`Scheduler::timer_for`].
#[derive(Debug)]
pub struct Expiries {
    tx: mpsc::UnboundedSender<TimerId>,
    rx: mpsc::UnboundedReceiver<TimerId>,
}

impl Default for Expiries {
    fn default() -> Self {
        Self::new()
    }
}

impl Expiries {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self { tx, rx }
    }

    /// Next expired timer, if any.
    pub fn try_next(&mut self) -> Option<TimerId> {
        self.rx.try_recv().ok()
    }
}

/// Process-lifetime owner of all pending timers.
///
/// Cheap to clone; clones share the same pending set.
#[derive(Debug, Clone, Default)]
pub struct Scheduler {
    inner: Arc<Mutex<Pending>>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an unarmed timer registered with this scheduler.
    pub fn timer(&self) -> Timer {
        self.new_timer(None)
    }

    /// Create an unarmed timer whose expiries [`run_due`](Self::run_due)
    /// delivers to `expiries`.
    pub fn timer_for(&self, expiries: &Expiries) -> Timer {
        self.new_timer(Some(expiries.tx.clone()))
    }

    fn new_timer(&self, mailbox: Option<mpsc::UnboundedSender<TimerId>>) -> Timer {
        let id = {
            let mut p = lock(&self.inner);
            p.next_id += 1;
            let id = TimerId(p.next_id);
            if let Some(tx) = mailbox {
                p.mailboxes.insert(id, tx);
            }
            id
        };
        Timer {
            id,
            delay: Duration::ZERO,
            scheduler: Arc::downgrade(&self.inner),
        }
    }

    /// Number of armed timers.
    pub fn pending(&self) -> usize {
        lock(&self.inner).queue.len()
    }

    /// Earliest expiry among armed timers.
    pub fn next_expiry(&self) -> Option<Instant> {
        lock(&self.inner).queue.first().map(|(at, _)| *at)
    }

    /// Fire every timer that has expired by `now`, earliest first.
    ///
    /// The due set is fixed when the pass starts.  A timer that is dropped,
    /// stopped or restarted by an earlier callback in the same pass is
    /// skipped.  The scheduler lock is not held while `fire` runs.
    ///
    /// Returns the number of timers fired.
    pub fn dispatch(&self, now: Instant, mut fire: impl FnMut(TimerId)) -> usize {
        let due: Vec<(Instant, TimerId)> = lock(&self.inner)
            .queue
            .iter()
            .take_while(|(at, _)| *at <= now)
            .copied()
            .collect();

        let mut fired = 0;
        for (at, id) in due {
            let still_due = {
                let mut p = lock(&self.inner);
                if p.queue.remove(&(at, id)) {
                    p.expiry.remove(&id);
                    true
                } else {
                    false
                }
            };
            if still_due {
                log::trace!("[sched] fire {id:?}");
                fire(id);
                fired += 1;
            }
        }
        fired
    }

    /// One scheduling pass that posts each expired timer's id to the
    /// mailbox it was created with.  Timers without a mailbox just expire.
    pub fn run_due(&self, now: Instant) -> usize {
        self.dispatch(now, |id| {
            if let Some(tx) = lock(&self.inner).mailboxes.get(&id) {
                let _ = tx.send(id);
            }
        })
    }
}

/// A one-shot timer owned by a single client.
#[derive(Debug)]
pub struct Timer {
    id: TimerId,
    delay: Duration,
    scheduler: Weak<Mutex<Pending>>,
}

impl Timer {
    pub fn id(&self) -> TimerId {
        self.id
    }

    /// Delay used by the most recent successful [`start`](Self::start).
    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Arm (or re-arm) the timer to expire `delay` from now.
    ///
    /// A zero delay is a no-op; any existing registration is left alone.
    pub fn start(&mut self, delay: Duration) {
        self.start_at(Instant::now(), delay);
    }

    /// Like [`start`](Self::start), measuring `delay` from `now`.
    pub fn start_at(&mut self, now: Instant, delay: Duration) {
        if delay.is_zero() {
            return;
        }
        let Some(inner) = self.scheduler.upgrade() else {
            return;
        };
        self.delay = delay;
        let at = now + delay;
        let mut p = lock(&inner);
        p.remove(self.id);
        p.queue.insert((at, self.id));
        p.expiry.insert(self.id, at);
    }

    /// Disarm the timer.  Safe to call when it is not armed.
    pub fn stop(&mut self) {
        if let Some(inner) = self.scheduler.upgrade() {
            lock(&inner).remove(self.id);
        }
    }

    pub fn is_armed(&self) -> bool {
        self.expiry().is_some()
    }

    pub fn expiry(&self) -> Option<Instant> {
        let inner = self.scheduler.upgrade()?;
        let p = lock(&inner);
        p.expiry.get(&self.id).copied()
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        if let Some(inner) = self.scheduler.upgrade() {
            let mut p = lock(&inner);
            p.remove(self.id);
            p.mailboxes.remove(&self.id);
        }
    }
}
