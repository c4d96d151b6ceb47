//! Server-side sessions, and the state machine which keeps them honest.

use crate::endpoint::NodeId;
use crate::policy::SessionConfig;
#[cfg(feature = "probes")]
use crate::probes;
use crate::status::{AsFailure, Failure, StatusCode, TransportStatus};
use crate::transport::{self, CallSettings, Method, Request, Response, SharedTransport};

use async_trait::async_trait;
use futures::StreamExt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tokio::time::Duration;
use tracing::{event, instrument, Level};

#[derive(Error, Debug)]
pub enum Error {
    #[error("Session has already been opened")]
    AlreadyOpened,

    #[error("Session is not attached")]
    NotOpen,

    #[error("Session is broken")]
    Broken,

    #[error("Server returned {status}: {issues:?}")]
    Status {
        status: StatusCode,
        issues: Vec<String>,
    },

    #[error("Server did not return a session id")]
    MissingSessionId,

    #[error("Timed out creating session")]
    CreateTimeout,

    #[error("Attach stream closed before its first message")]
    AttachClosed,

    #[error("Timed out waiting for the first attach message")]
    AttachTimeout,

    #[error(transparent)]
    Transport(#[from] transport::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    fn from_response(response: Response) -> Self {
        Error::Status {
            status: response.status,
            issues: response.issues,
        }
    }

    // Convert to a static string for USDT probes.
    pub(crate) fn as_str(&self) -> &'static str {
        match self {
            Error::AlreadyOpened => "AlreadyOpened",
            Error::NotOpen => "NotOpen",
            Error::Broken => "Broken",
            Error::Status { status, .. } => status.as_str(),
            Error::MissingSessionId => "MissingSessionId",
            Error::CreateTimeout => "CreateTimeout",
            Error::AttachClosed => "AttachClosed",
            Error::AttachTimeout => "AttachTimeout",
            Error::Transport(_) => "Transport",
            Error::Other(_) => "Other",
        }
    }
}

impl AsFailure for Error {
    fn as_failure(&self) -> Failure {
        match self {
            Error::Status { status, .. } => Failure::status(*status),
            Error::Broken => Failure::status(StatusCode::BadSession),
            Error::Transport(err) => err.as_failure(),
            Error::CreateTimeout | Error::AttachTimeout => {
                Failure::transport(TransportStatus::DeadlineExceeded)
            }
            Error::AttachClosed => Failure::transport(TransportStatus::Unavailable),
            Error::AlreadyOpened | Error::NotOpen | Error::MissingSessionId | Error::Other(_) => {
                Failure::default()
            }
        }
    }
}

/// Identifies a session on the server.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Id(Arc<str>);

impl Id {
    pub fn new<S: Into<Arc<str>>>(id: S) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Id {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// The lifecycle of a session.
///
/// Sessions only move forward through these states: once broken, a session
/// is never healthy again.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum State {
    Unopened = 0,
    Opening = 1,
    Attached = 2,
    Broken = 3,
}

impl State {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => State::Unopened,
            1 => State::Opening,
            2 => State::Attached,
            _ => State::Broken,
        }
    }
}

/// The capabilities the pool needs from a session.
#[async_trait]
pub trait Session: Send + Sync + 'static {
    /// The server-assigned id, once the session has been created.
    fn id(&self) -> Option<Id>;

    /// The node hosting this session, once it has been created.
    fn node_id(&self) -> Option<NodeId>;

    fn state(&self) -> State;

    fn is_broken(&self) -> bool {
        self.state() == State::Broken
    }

    /// Reports a non-success status observed while using this session.
    ///
    /// May be called from any task. Statuses which invalidate the session
    /// break it.
    fn on_not_success_status_code(&self, status: StatusCode);

    /// Creates the session on the server and attaches to it.
    async fn open(&self) -> Result<(), Error>;

    /// Deletes the session on the server, best-effort.
    ///
    /// Failures are logged, not returned. Deleting twice is a no-op.
    async fn delete(&self);
}

/// Creates unopened sessions for a pool.
pub trait Factory: Send + Sync + 'static {
    type Session: Session;

    fn new_session(&self) -> Self::Session;
}

pub type SharedFactory<S> = Arc<dyn Factory<Session = S>>;

struct Inner {
    transport: SharedTransport,
    config: SessionConfig,

    id: OnceLock<Id>,
    node_id: OnceLock<NodeId>,
    state: AtomicU8,

    // The task consuming the attach stream, if one was started.
    attach: Mutex<Option<AbortHandle>>,
    deleted: AtomicBool,
}

impl Inner {
    fn state(&self) -> State {
        State::from_u8(self.state.load(Ordering::Acquire))
    }

    fn transition(&self, from: State, to: State) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn id_str(&self) -> &str {
        self.id.get().map(Id::as_str).unwrap_or("")
    }

    // Returns true if this call broke the session.
    fn mark_broken(&self, reason: &str) -> bool {
        let old = State::from_u8(self.state.swap(State::Broken as u8, Ordering::AcqRel));
        if old == State::Broken {
            return false;
        }
        event!(Level::WARN, session_id = self.id_str(), ?old, reason, "Session broken");
        #[cfg(feature = "probes")]
        probes::session__broken!(|| (self.id_str(), reason));
        true
    }

    fn stop_attach(&self) {
        if let Some(handle) = self.attach.lock().unwrap().take() {
            handle.abort();
        }
    }

    fn on_status(&self, status: StatusCode) {
        if status.invalidates_session() {
            self.mark_broken(status.as_str());
        } else if !status.is_success() {
            event!(
                Level::DEBUG,
                session_id = self.id_str(),
                %status,
                "Session observed a non-invalidating status"
            );
        }
    }
}

// Consumes the attach stream of a session.
//
// The outcome of the first message is reported through "first"; afterwards
// every message is checked for statuses which invalidate the session. The
// session breaks when the stream fails or ends.
async fn attach_loop(
    inner: Arc<Inner>,
    id: Id,
    node_id: NodeId,
    first: oneshot::Sender<Result<(), Error>>,
) {
    let settings = CallSettings {
        node_id: Some(node_id),
        timeout: None,
    };
    let stream = inner
        .transport
        .server_stream_call(Method::AttachSession, Request::for_session(id), settings)
        .await;
    let mut stream = match stream {
        Ok(stream) => stream,
        Err(err) => {
            let _ = first.send(Err(err.into()));
            return;
        }
    };

    let first_result = match stream.next().await {
        Some(Ok(response)) if response.status.is_success() => Ok(()),
        Some(Ok(response)) => Err(Error::from_response(response)),
        Some(Err(err)) => Err(err.into()),
        None => Err(Error::AttachClosed),
    };
    let attached = first_result.is_ok();
    let _ = first.send(first_result);
    if !attached {
        return;
    }

    while let Some(message) = stream.next().await {
        match message {
            Ok(response) => {
                inner.on_status(response.status);
                if inner.state() == State::Broken {
                    return;
                }
            }
            Err(err) => {
                event!(Level::DEBUG, session_id = inner.id_str(), ?err, "Attach stream failed");
                inner.mark_broken("Attach stream failed");
                return;
            }
        }
    }
    inner.mark_broken("Attach stream closed");
}

/// A session kept alive by an attach stream.
///
/// Opening issues a create call, then starts a background task consuming the
/// attach stream. The session is open once the first attach message arrives.
/// Dropping the session stops the attach task, but does not delete the
/// session on the server; use [Session::delete] for that.
pub struct AttachedSession {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for AttachedSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttachedSession")
            .field("id", &self.inner.id.get())
            .field("node_id", &self.inner.node_id.get())
            .field("state", &self.inner.state())
            .finish()
    }
}

impl AttachedSession {
    pub fn new(transport: SharedTransport, config: SessionConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                transport,
                config,
                id: OnceLock::new(),
                node_id: OnceLock::new(),
                state: AtomicU8::new(State::Unopened as u8),
                attach: Mutex::new(None),
                deleted: AtomicBool::new(false),
            }),
        }
    }

    async fn create_and_attach(&self) -> Result<(), Error> {
        let inner = &self.inner;
        let settings = CallSettings {
            node_id: None,
            timeout: Some(inner.config.create_timeout),
        };
        let response = tokio::time::timeout(
            inner.config.create_timeout,
            inner
                .transport
                .unary_call(Method::CreateSession, Request::default(), settings),
        )
        .await
        .map_err(|_| Error::CreateTimeout)??;

        if !response.status.is_success() {
            return Err(Error::from_response(response));
        }
        let (Some(id), Some(node_id)) = (response.session_id, response.node_id) else {
            return Err(Error::MissingSessionId);
        };
        let _ = inner.id.set(id.clone());
        let _ = inner.node_id.set(node_id);

        let (tx, rx) = oneshot::channel();
        let task = tokio::task::spawn(attach_loop(inner.clone(), id, node_id, tx));
        *inner.attach.lock().unwrap() = Some(task.abort_handle());

        match tokio::time::timeout(inner.config.attach_timeout, rx).await {
            Ok(Ok(result)) => result?,
            Ok(Err(_)) => return Err(Error::AttachClosed),
            Err(_) => return Err(Error::AttachTimeout),
        }

        // The first message may have been followed by one which broke the
        // session already.
        if !inner.transition(State::Opening, State::Attached) {
            return Err(Error::Broken);
        }
        Ok(())
    }

    /// Runs a query pinned to this session's node.
    ///
    /// Non-success statuses, and transport failures, are reported to the
    /// session before being returned, so a session invalidated by the call
    /// is never reused.
    #[instrument(level = "debug", skip_all, fields(session_id = self.inner.id_str()), err)]
    pub async fn execute(
        &self,
        body: Vec<u8>,
        timeout: Option<Duration>,
    ) -> Result<Response, Error> {
        match self.inner.state() {
            State::Attached => (),
            State::Broken => return Err(Error::Broken),
            State::Unopened | State::Opening => return Err(Error::NotOpen),
        }
        let id = self.inner.id.get().cloned().ok_or(Error::NotOpen)?;

        let request = Request {
            session_id: Some(id),
            body,
        };
        let settings = CallSettings {
            node_id: self.inner.node_id.get().copied(),
            timeout,
        };
        match self
            .inner
            .transport
            .unary_call(Method::ExecuteQuery, request, settings)
            .await
        {
            Ok(response) if response.status.is_success() => Ok(response),
            Ok(response) => {
                self.on_not_success_status_code(response.status);
                Err(Error::from_response(response))
            }
            Err(err) => {
                self.on_not_success_status_code(err.status.into());
                Err(err.into())
            }
        }
    }
}

#[async_trait]
impl Session for AttachedSession {
    fn id(&self) -> Option<Id> {
        self.inner.id.get().cloned()
    }

    fn node_id(&self) -> Option<NodeId> {
        self.inner.node_id.get().copied()
    }

    fn state(&self) -> State {
        self.inner.state()
    }

    fn on_not_success_status_code(&self, status: StatusCode) {
        self.inner.on_status(status);
    }

    #[instrument(level = "debug", skip(self), err, name = "AttachedSession::open")]
    async fn open(&self) -> Result<(), Error> {
        if !self.inner.transition(State::Unopened, State::Opening) {
            return Err(Error::AlreadyOpened);
        }
        let result = self.create_and_attach().await;
        if let Err(err) = &result {
            self.inner.mark_broken(err.as_str());
            self.inner.stop_attach();
        } else {
            event!(
                Level::DEBUG,
                session_id = self.inner.id_str(),
                node_id = ?self.inner.node_id.get(),
                "Session attached"
            );
        }
        result
    }

    async fn delete(&self) {
        if self.inner.deleted.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner
            .state
            .store(State::Broken as u8, Ordering::Release);
        self.inner.stop_attach();

        // Nothing to delete if creation never succeeded.
        let Some(id) = self.inner.id.get().cloned() else {
            return;
        };
        let timeout = self.inner.config.delete_timeout;
        let settings = CallSettings {
            node_id: self.inner.node_id.get().copied(),
            timeout: Some(timeout),
        };
        let result = tokio::time::timeout(
            timeout,
            self.inner.transport.unary_call(
                Method::DeleteSession,
                Request::for_session(id.clone()),
                settings,
            ),
        )
        .await;

        match result {
            Ok(Ok(response)) if response.status.is_success() => {
                event!(Level::DEBUG, session_id = %id, "Session deleted");
            }
            Ok(Ok(response)) => {
                event!(Level::WARN, session_id = %id, status = %response.status, "Session delete failed");
            }
            Ok(Err(err)) => {
                event!(Level::WARN, session_id = %id, ?err, "Session delete failed");
            }
            Err(_) => {
                event!(Level::WARN, session_id = %id, "Session delete timed out");
            }
        }
        #[cfg(feature = "probes")]
        probes::session__deleted!(|| id.as_str());
    }
}

impl Drop for AttachedSession {
    fn drop(&mut self) {
        self.inner.stop_attach();
    }
}

/// Creates [AttachedSession]s over a shared transport.
pub struct AttachedSessionFactory {
    transport: SharedTransport,
    config: SessionConfig,
}

impl AttachedSessionFactory {
    pub fn new(transport: SharedTransport, config: SessionConfig) -> Self {
        Self { transport, config }
    }
}

impl Factory for AttachedSessionFactory {
    type Session = AttachedSession;

    fn new_session(&self) -> AttachedSession {
        AttachedSession::new(self.transport.clone(), self.config.clone())
    }
}
