//! A bounded pool of sessions, vending out a [claim]

use crate::claim;
use crate::policy::PoolPolicy;
#[cfg(feature = "probes")]
use crate::probes;
use crate::session::{self, Session, SharedFactory};
use crate::slot::{self, SlotId, Slots};
use crate::status::{AsFailure, Failure, StatusCode, TransportStatus};

use std::collections::VecDeque;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Mutex,
};
use thiserror::Error;
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{event, instrument, Level};

#[derive(Error, Debug)]
pub enum Error {
    #[error("All {max_sessions} sessions are in use; gave up after {waited:?}")]
    Exhausted { max_sessions: usize, waited: Duration },

    #[error("Request for a session was cancelled")]
    Cancelled,

    #[error("Session pool is closing")]
    Terminated,

    #[error("Failed to open a session")]
    Create(#[source] session::Error),

    #[error("Timed out opening a session")]
    CreateTimeout,

    #[error("{outstanding} sessions were not returned within {grace:?}")]
    LeakSuspected { outstanding: usize, grace: Duration },
}

impl Error {
    // Convert to a static string for USDT probes.
    #[cfg_attr(not(feature = "probes"), allow(dead_code))]
    const fn as_str(&self) -> &'static str {
        match self {
            Error::Exhausted { .. } => "Exhausted",
            Error::Cancelled => "Cancelled",
            Error::Terminated => "Terminated",
            Error::Create(_) => "Create",
            Error::CreateTimeout => "CreateTimeout",
            Error::LeakSuspected { .. } => "LeakSuspected",
        }
    }
}

impl AsFailure for Error {
    fn as_failure(&self) -> Failure {
        match self {
            Error::Create(err) => err.as_failure(),
            Error::CreateTimeout => Failure::transport(TransportStatus::DeadlineExceeded),
            Error::Exhausted { .. } => Failure::status(StatusCode::Overloaded),
            Error::Cancelled | Error::Terminated | Error::LeakSuspected { .. } => {
                Failure::default()
            }
        }
    }
}

/// The name of the pool
#[derive(Clone, Debug)]
pub(crate) struct Name(Arc<str>);

impl Name {
    pub(crate) fn new<S: Into<Arc<str>>>(name: S) -> Self {
        Self(name.into())
    }

    pub(crate) fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Name {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// A point-in-time view of the pool.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct Stats {
    /// Slots holding a session, or about to.
    pub live: usize,
    pub creating: usize,
    pub idle: usize,
    pub leased: usize,
    pub closing: usize,

    /// Callers waiting for a session.
    pub waiters: usize,

    /// Sessions opened over the lifetime of the pool.
    pub created: u64,

    /// Sessions closed over the lifetime of the pool.
    pub deleted: u64,
}

// A waiter receives a session directly from a caller returning one, or
// "None" when a slot was freed and it should try again. Dropping the sender
// means the pool is terminating.
type WaiterTx<S> = oneshot::Sender<Option<claim::Handle<S>>>;

// The idle stack and waiter queue share one critical section, so a session
// is never both idle and promised to a waiter. It is never held across I/O.
struct Queues<S: Session> {
    idle: Vec<SlotId>,
    waiters: VecDeque<WaiterTx<S>>,
    terminated: bool,
}

pub(crate) struct PoolInner<S: Session> {
    name: Name,
    factory: SharedFactory<S>,
    policy: PoolPolicy,

    slots: Slots<S>,
    queues: Mutex<Queues<S>>,

    // Notified whenever a slot becomes Empty.
    freed: Notify,

    created: AtomicU64,
    deleted: AtomicU64,
}

// Releases a reserved slot unless the session was opened successfully.
//
// A session which was being opened may already exist on the server, however
// opening it ended (failure, timeout, or the caller going away). It is
// deleted first, and the slot is only released once that is done.
struct Reservation<S: Session> {
    inner: Arc<PoolInner<S>>,
    slot: SlotId,
    session: Option<Arc<S>>,
    armed: bool,
}

impl<S: Session> Reservation<S> {
    fn new(inner: Arc<PoolInner<S>>, slot: SlotId) -> Self {
        Self {
            inner,
            slot,
            session: None,
            armed: true,
        }
    }

    fn disarm(mut self) -> SlotId {
        self.armed = false;
        self.session = None;
        self.slot
    }
}

impl<S: Session> Drop for Reservation<S> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let Some(session) = self.session.take() else {
            self.inner.free_slot(self.slot);
            return;
        };
        let inner = self.inner.clone();
        let slot = self.slot;
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    session.delete().await;
                    inner.free_slot(slot);
                });
            }
            Err(_) => {
                event!(
                    Level::WARN,
                    pool = inner.name.as_str(),
                    slot,
                    "No runtime available to delete unopened session; dropping it"
                );
                inner.free_slot(slot);
            }
        }
    }
}

// A place in the waiter queue.
//
// If the waiting caller gives up after a session was already handed to it,
// dropping this returns that session to the pool. If it gives up after
// being told a slot was freed, the wakeup is passed on.
struct Waiter<S: Session> {
    rx: oneshot::Receiver<Option<claim::Handle<S>>>,
    inner: Arc<PoolInner<S>>,
}

impl<S: Session> Drop for Waiter<S> {
    fn drop(&mut self) {
        self.rx.close();
        match self.rx.try_recv() {
            Ok(Some(handle)) => drop(handle),
            Ok(None) => {
                let mut queues = self.inner.queues.lock().unwrap();
                self.inner.wake_one(&mut queues);
            }
            Err(_) => (),
        }
    }
}

enum Next<S: Session> {
    Idle(SlotId),
    Create(Reservation<S>),
    Wait(Waiter<S>),
}

impl<S: Session> PoolInner<S> {
    fn stats(&self) -> Stats {
        let waiters = {
            let queues = self.queues.lock().unwrap();
            queues.waiters.iter().filter(|tx| !tx.is_closed()).count()
        };
        let census = self.slots.census();
        Stats {
            live: self.slots.live(),
            creating: census.creating,
            idle: census.idle,
            leased: census.leased,
            closing: census.closing,
            waiters,
            created: self.created.load(Ordering::Relaxed),
            deleted: self.deleted.load(Ordering::Relaxed),
        }
    }

    // Tells the oldest waiter which is still listening that a slot was
    // freed.
    fn wake_one(&self, queues: &mut Queues<S>) {
        while let Some(tx) = queues.waiters.pop_front() {
            if tx.send(None).is_ok() {
                return;
            }
        }
    }

    fn free_slot(&self, slot: SlotId) {
        let mut queues = self.queues.lock().unwrap();
        let session = self.slots.free(slot);
        self.wake_one(&mut queues);
        drop(queues);
        drop(session);
        self.freed.notify_waiters();
    }

    // Deletes the session in a slot, then frees the slot.
    //
    // The slot must already be Closing.
    async fn close_slot(&self, slot: SlotId) {
        if let Some(session) = self.slots.session(slot) {
            session.delete().await;
            self.deleted.fetch_add(1, Ordering::Relaxed);
        }
        self.free_slot(slot);
    }

    fn spawn_close(self: &Arc<Self>, slot: SlotId) {
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let inner = self.clone();
                runtime.spawn(async move { inner.close_slot(slot).await });
            }
            Err(_) => {
                event!(
                    Level::WARN,
                    pool = self.name.as_str(),
                    slot,
                    "No runtime available to delete session; dropping it"
                );
                self.free_slot(slot);
            }
        }
    }

    /// Takes a session back from a caller.
    ///
    /// Broken sessions, and sessions returned to a terminating pool, are
    /// deleted. Healthy ones go to the oldest waiter, or onto the idle
    /// stack if nobody is waiting.
    pub(crate) fn return_session(self: &Arc<Self>, slot: SlotId) {
        #[cfg(feature = "probes")]
        probes::handle__returned!(|| (self.name.as_str(), slot as u64));

        let Some(session) = self.slots.session(slot) else {
            return;
        };

        let mut queues = self.queues.lock().unwrap();
        if session.is_broken() || queues.terminated {
            let closing = self.slots.transition(slot, slot::State::Leased, slot::State::Closing);
            drop(queues);
            event!(
                Level::DEBUG,
                pool = self.name.as_str(),
                slot,
                broken = session.is_broken(),
                "Closing returned session"
            );
            if closing {
                self.spawn_close(slot);
            }
            return;
        }

        let mut handle = claim::Handle::new(session, slot, self.clone());
        while let Some(tx) = queues.waiters.pop_front() {
            match tx.send(Some(handle)) {
                Ok(()) => return,
                Err(Some(unsent)) => handle = unsent,
                Err(None) => return,
            }
        }
        handle.disarm();
        self.slots.mark_idle(slot);
        queues.idle.push(slot);
    }

    async fn acquire(
        self: &Arc<Self>,
        cancel: &CancellationToken,
    ) -> Result<claim::Handle<S>, Error> {
        let start = Instant::now();
        let deadline = start + self.policy.create_session_timeout;

        // Callers who were woken, but lost the race for what woke them,
        // keep their place at the front of the queue.
        let mut woken = false;

        loop {
            let next = {
                let mut queues = self.queues.lock().unwrap();
                if queues.terminated {
                    return Err(Error::Terminated);
                }
                if let Some(slot) = queues.idle.pop() {
                    Next::Idle(slot)
                } else if let Some(slot) = self.slots.reserve() {
                    Next::Create(Reservation::new(self.clone(), slot))
                } else {
                    let (tx, rx) = oneshot::channel();
                    if woken {
                        queues.waiters.push_front(tx);
                    } else {
                        queues.waiters.push_back(tx);
                    }
                    Next::Wait(Waiter {
                        rx,
                        inner: self.clone(),
                    })
                }
            };

            match next {
                Next::Idle(slot) => {
                    if !self
                        .slots
                        .transition(slot, slot::State::Idle, slot::State::Leased)
                    {
                        continue;
                    }
                    let Some(session) = self.slots.session(slot) else {
                        continue;
                    };
                    if session.is_broken() {
                        event!(
                            Level::DEBUG,
                            pool = self.name.as_str(),
                            slot,
                            "Idle session is broken; closing it"
                        );
                        // Closed in the background: this caller may give up
                        // before the delete finishes, and the slot must still
                        // be freed.
                        if self
                            .slots
                            .transition(slot, slot::State::Leased, slot::State::Closing)
                        {
                            self.spawn_close(slot);
                        }
                        continue;
                    }
                    return Ok(claim::Handle::new(session, slot, self.clone()));
                }
                Next::Create(reservation) => {
                    return self.create(reservation, cancel).await;
                }
                Next::Wait(mut waiter) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    tokio::select! {
                        biased;
                        result = &mut waiter.rx => match result {
                            Ok(Some(handle)) => return Ok(handle),
                            Ok(None) => woken = true,
                            Err(_) => return Err(Error::Terminated),
                        },
                        _ = cancel.cancelled() => return Err(Error::Cancelled),
                        _ = tokio::time::sleep(remaining) => {
                            return Err(Error::Exhausted {
                                max_sessions: self.slots.capacity(),
                                waited: start.elapsed(),
                            });
                        }
                    }
                }
            }
        }
    }

    async fn create(
        self: &Arc<Self>,
        mut reservation: Reservation<S>,
        cancel: &CancellationToken,
    ) -> Result<claim::Handle<S>, Error> {
        let slot = reservation.slot;
        #[cfg(feature = "probes")]
        probes::session__create__start!(|| (self.name.as_str(), slot as u64));

        let session = Arc::new(self.factory.new_session());
        reservation.session = Some(session.clone());
        let result = tokio::select! {
            result = tokio::time::timeout(
                self.policy.create_session_timeout,
                session.open(),
            ) => match result {
                Ok(Ok(())) => Ok(()),
                Ok(Err(err)) => Err(Error::Create(err)),
                Err(_) => Err(Error::CreateTimeout),
            },
            _ = cancel.cancelled() => Err(Error::Cancelled),
        };

        if let Err(err) = result {
            event!(
                Level::WARN,
                pool = self.name.as_str(),
                slot,
                ?err,
                "Failed to open session"
            );
            #[cfg(feature = "probes")]
            probes::session__create__failed!(|| (self.name.as_str(), slot as u64, err.as_str()));
            drop(reservation);
            return Err(err);
        }

        self.created.fetch_add(1, Ordering::Relaxed);
        self.slots.fill(slot, session.clone());
        let slot = reservation.disarm();

        #[cfg(feature = "probes")]
        probes::session__create__done!(|| (
            self.name.as_str(),
            slot as u64,
            session.id().map(|id| id.to_string()).unwrap_or_default()
        ));
        event!(
            Level::DEBUG,
            pool = self.name.as_str(),
            slot,
            session_id = ?session.id(),
            "Opened session"
        );
        Ok(claim::Handle::new(session, slot, self.clone()))
    }

    // Closes sessions which have been idle for too long, oldest first,
    // without shrinking the pool below its floor.
    fn evict_idle(self: &Arc<Self>) {
        let now = Instant::now();
        let evicted: Vec<SlotId> = {
            let mut queues = self.queues.lock().unwrap();
            if queues.terminated {
                return;
            }
            let mut live = self.slots.live();
            let mut evicted = vec![];

            // The bottom of the idle stack holds the least recently used
            // sessions.
            queues.idle.retain(|&slot| {
                if live <= self.policy.min_sessions
                    || now.duration_since(self.slots.idle_since(slot)) < self.policy.idle_timeout
                    || !self
                        .slots
                        .transition(slot, slot::State::Idle, slot::State::Closing)
                {
                    return true;
                }
                live -= 1;
                evicted.push(slot);
                false
            });
            evicted
        };

        if evicted.is_empty() {
            return;
        }
        event!(
            Level::DEBUG,
            pool = self.name.as_str(),
            count = evicted.len(),
            "Evicting idle sessions"
        );
        for slot in evicted {
            self.spawn_close(slot);
        }
    }

    async fn evict_idle_loop(self: Arc<Self>) {
        if self.policy.idle_check_interval.is_zero() {
            event!(
                Level::WARN,
                pool = self.name.as_str(),
                "Idle check interval is zero; idle sessions will not be evicted"
            );
            return;
        }
        let mut ticker = interval(self.policy.idle_check_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.reset();
        loop {
            ticker.tick().await;
            self.evict_idle();
        }
    }

    async fn wait_for_drain(&self) {
        loop {
            let freed = self.freed.notified();
            tokio::pin!(freed);
            freed.as_mut().enable();
            if self.slots.live() == 0 {
                return;
            }
            freed.await;
        }
    }
}

/// Manages a bounded set of sessions.
pub struct Pool<S: Session> {
    name: Name,
    inner: Arc<PoolInner<S>>,
    evictor: Mutex<Option<JoinHandle<()>>>,
}

/// A wrapper type indicating that the USDT probes could not be registered.
///
/// In this case, no probes will be available in the process. However, similar
/// to `std::sync::PoisonError`, this contains the pool itself. Applications
/// which don't care about a probe registration failure may still get access to
/// the pool
pub struct RegistrationError<S: Session>(Pool<S>);

impl<S: Session> std::fmt::Debug for RegistrationError<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistrationError").finish_non_exhaustive()
    }
}

impl<S: Session> std::fmt::Display for RegistrationError<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        "USDT probe registration failed".fmt(f)
    }
}

impl<S: Session> RegistrationError<S> {
    /// Consume the error and get access to the contained pool.
    pub fn into_inner(self) -> Pool<S> {
        self.0
    }
}

impl<S: Session> Pool<S> {
    /// Creates a new session pool.
    ///
    /// - name: The name of this pool, for instrumentation.
    /// - factory: Creates the unopened sessions the pool opens and hands
    ///   out.
    /// - policy: Bounds the pool, and times its sessions.
    ///
    /// Sessions are opened lazily, as callers ask for them. Must be called
    /// from within a tokio runtime, which runs the idle eviction task.
    ///
    /// ```no_run
    /// use sessorb::policy::{PoolPolicy, SessionConfig};
    /// use sessorb::pool::Pool;
    /// use sessorb::session::AttachedSessionFactory;
    /// use sessorb::transport::SharedTransport;
    /// use std::sync::Arc;
    /// use tokio_util::sync::CancellationToken;
    ///
    /// # async fn demo(transport: SharedTransport) {
    /// let factory = Arc::new(AttachedSessionFactory::new(
    ///     transport,
    ///     SessionConfig::default(),
    /// ));
    /// let pool = Pool::new("my-pool".to_string(), factory, PoolPolicy::default()).unwrap();
    ///
    /// let session = pool.get_session(&CancellationToken::new()).await.unwrap();
    /// let response = session.execute(b"SELECT 1".to_vec(), None).await;
    /// # }
    /// ```
    ///
    /// # DTrace probe registration
    ///
    /// This constructor returns a `Result`, because it attempts to register the
    /// USDT probes it exposes, a fallible process. However, that failure is
    /// extremely unlikely to happen in practice, and so the `Err` variant of
    /// the returned result allows callers to access the constructed `Pool`
    /// anyway.
    ///
    /// Note that if the `"probes"` feature is not enabled, this method is
    /// infallible.
    #[instrument(skip(factory), name = "Pool::new")]
    pub fn new(
        name: String,
        factory: SharedFactory<S>,
        policy: PoolPolicy,
    ) -> Result<Self, RegistrationError<S>> {
        let name = Name::new(name);
        let inner = Arc::new(PoolInner {
            name: name.clone(),
            factory,
            slots: Slots::new(policy.max_sessions),
            policy,
            queues: Mutex::new(Queues {
                idle: vec![],
                waiters: VecDeque::new(),
                terminated: false,
            }),
            freed: Notify::new(),
            created: AtomicU64::new(0),
            deleted: AtomicU64::new(0),
        });
        let evictor = tokio::task::spawn(inner.clone().evict_idle_loop());

        let self_ = Self {
            name,
            inner,
            evictor: Mutex::new(Some(evictor)),
        };
        #[cfg(feature = "probes")]
        match usdt::register_probes() {
            Ok(_) => Ok(self_),
            Err(_) => Err(RegistrationError(self_)),
        }
        #[cfg(not(feature = "probes"))]
        Ok(self_)
    }

    /// Acquires a session from the pool.
    ///
    /// Reuses an idle session if a healthy one exists, otherwise opens a new
    /// one if the pool has room, otherwise waits for a session to be
    /// returned. Waiting is bounded by
    /// [PoolPolicy::create_session_timeout], and ends early if `cancel`
    /// fires or the pool terminates.
    ///
    /// Cancel-safe: if this future is dropped after a session was handed to
    /// it, that session goes back to the pool.
    #[instrument(level = "debug", skip_all, err, name = "Pool::get_session")]
    pub async fn get_session(
        &self,
        cancel: &CancellationToken,
    ) -> Result<claim::Handle<S>, Error> {
        #[cfg(feature = "probes")]
        probes::get__session__start!(|| self.name.as_str());

        let result = self.inner.acquire(cancel).await;

        #[cfg(feature = "probes")]
        match &result {
            Ok(handle) => probes::get__session__done!(|| (
                self.name.as_str(),
                handle.id().map(|id| id.to_string()).unwrap_or_default()
            )),
            Err(e) => probes::get__session__failed!(|| (self.name.as_str(), e.as_str())),
        }
        result
    }

    /// Returns a snapshot of pool-wide stats.
    pub fn stats(&self) -> Stats {
        self.inner.stats()
    }

    /// Terminates the session pool.
    ///
    /// Waiting callers fail with [Error::Terminated], idle sessions are
    /// deleted, and leased sessions are deleted as they come back. If they
    /// do not all come back within [PoolPolicy::terminate_timeout], returns
    /// [Error::LeakSuspected].
    ///
    /// Terminating twice returns [Error::Terminated].
    #[instrument(skip(self), fields(pool = self.name.as_str()), name = "Pool::terminate")]
    pub async fn terminate(&self) -> Result<(), Error> {
        let (idle, waiters) = {
            let mut queues = self.inner.queues.lock().unwrap();
            if queues.terminated {
                return Err(Error::Terminated);
            }
            queues.terminated = true;
            (
                std::mem::take(&mut queues.idle),
                std::mem::take(&mut queues.waiters),
            )
        };
        if let Some(evictor) = self.evictor.lock().unwrap().take() {
            evictor.abort();
        }
        event!(
            Level::INFO,
            idle = idle.len(),
            waiters = waiters.len(),
            "Terminating session pool"
        );
        drop(waiters);

        for slot in idle {
            if self
                .inner
                .slots
                .transition(slot, slot::State::Idle, slot::State::Closing)
            {
                self.inner.spawn_close(slot);
            }
        }

        let grace = self.inner.policy.terminate_timeout;
        if tokio::time::timeout(grace, self.inner.wait_for_drain())
            .await
            .is_err()
        {
            let outstanding = self.inner.slots.live();
            event!(Level::ERROR, outstanding, ?grace, "Sessions leaked past termination");
            return Err(Error::LeakSuspected { outstanding, grace });
        }
        Ok(())
    }
}

impl<S: Session> Drop for Pool<S> {
    fn drop(&mut self) {
        if let Some(handle) = self.evictor.lock().unwrap().take() {
            handle.abort();
        }
    }
}
