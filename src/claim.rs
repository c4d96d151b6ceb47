//! Sessions which are leased from the session pool.

use crate::pool::PoolInner;
use crate::session::Session;
use crate::slot::SlotId;

use derive_where::derive_where;
use std::sync::Arc;

/// A [Session] which is returned to the pool when dropped.
///
/// Note that this type implements [std::ops::Deref] for the generic
/// session type, and generally, clients should transparently use a handle
/// as a session.
///
/// A session observed to be broken when it comes back is deleted rather
/// than reused. Report failures through
/// [Session::on_not_success_status_code] before dropping the handle.
#[derive_where(Debug)]
pub struct Handle<S: Session> {
    #[derive_where(skip)]
    session: Arc<S>,
    slot: SlotId,

    // "None" once the session no longer needs to go back to the pool.
    #[derive_where(skip)]
    pool: Option<Arc<PoolInner<S>>>,
}

impl<S: Session> Handle<S> {
    pub(crate) fn new(session: Arc<S>, slot: SlotId, pool: Arc<PoolInner<S>>) -> Self {
        Self {
            session,
            slot,
            pool: Some(pool),
        }
    }

    pub fn session(&self) -> &Arc<S> {
        &self.session
    }

    /// Returns the session to the pool.
    ///
    /// Equivalent to dropping the handle.
    pub fn close(self) {
        drop(self)
    }

    // Prevents the drop handler from returning the session, for when the
    // pool has already taken it back.
    pub(crate) fn disarm(mut self) {
        self.pool = None;
    }
}

impl<S: Session> std::ops::Deref for Handle<S> {
    type Target = S;
    fn deref(&self) -> &Self::Target {
        &self.session
    }
}

impl<S: Session> Drop for Handle<S> {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.take() {
            pool.return_session(self.slot);
        }
    }
}
