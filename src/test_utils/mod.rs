//! Utilities to help with testing sessorb

use crate::channel::ChannelFactory;
use crate::endpoint::NodeId;
use crate::session;
use crate::status::{StatusCode, TransportStatus};
use crate::transport::{self, CallSettings, Method, Request, Response, ResponseStream, Transport};

use async_trait::async_trait;
use futures::StreamExt;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use tokio::sync::mpsc;
use tokio::time::Duration;
use tokio_stream::wrappers::UnboundedReceiverStream;

type AttachSender = mpsc::UnboundedSender<Result<Response, transport::Error>>;

/// How the attach stream of newly created sessions behaves.
#[derive(Copy, Clone, Debug)]
pub enum AttachBehavior {
    /// The first message carries this status, and the stream stays open.
    Status(StatusCode),
    /// The stream stays open, but never yields a message.
    Silent,
    /// The stream ends without any message.
    Close,
}

/// An in-memory server which hands out sessions, and lets tests script how
/// they behave.
pub struct TestTransport {
    next_id: AtomicUsize,
    created: AtomicUsize,
    deleted: AtomicUsize,
    open: AtomicUsize,
    max_open: AtomicUsize,
    executed: AtomicUsize,

    create_failure: Mutex<Option<StatusCode>>,
    create_delay: Mutex<Duration>,
    delete_delay: Mutex<Duration>,
    attach: Mutex<AttachBehavior>,
    attach_streams: Mutex<HashMap<session::Id, AttachSender>>,
    deleted_ids: Mutex<Vec<session::Id>>,
    execute_script: Mutex<VecDeque<Result<StatusCode, TransportStatus>>>,
}

impl TestTransport {
    pub fn new() -> Self {
        Self {
            next_id: AtomicUsize::new(1),
            created: AtomicUsize::new(0),
            deleted: AtomicUsize::new(0),
            open: AtomicUsize::new(0),
            max_open: AtomicUsize::new(0),
            executed: AtomicUsize::new(0),
            create_failure: Mutex::new(None),
            create_delay: Mutex::new(Duration::ZERO),
            delete_delay: Mutex::new(Duration::ZERO),
            attach: Mutex::new(AttachBehavior::Status(StatusCode::Success)),
            attach_streams: Mutex::new(HashMap::new()),
            deleted_ids: Mutex::new(vec![]),
            execute_script: Mutex::new(VecDeque::new()),
        }
    }

    /// Sessions created successfully so far.
    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    /// Delete calls received so far.
    pub fn deleted(&self) -> usize {
        self.deleted.load(Ordering::SeqCst)
    }

    pub fn deleted_ids(&self) -> Vec<session::Id> {
        self.deleted_ids.lock().unwrap().clone()
    }

    /// The most sessions which ever existed on the server at once.
    pub fn max_open(&self) -> usize {
        self.max_open.load(Ordering::SeqCst)
    }

    pub fn executed(&self) -> usize {
        self.executed.load(Ordering::SeqCst)
    }

    /// Makes future create calls fail with the given status, or succeed
    /// again with `None`.
    pub fn fail_creates_with(&self, status: Option<StatusCode>) {
        *self.create_failure.lock().unwrap() = status;
    }

    pub fn set_create_delay(&self, delay: Duration) {
        *self.create_delay.lock().unwrap() = delay;
    }

    pub fn set_delete_delay(&self, delay: Duration) {
        *self.delete_delay.lock().unwrap() = delay;
    }

    pub fn set_attach(&self, behavior: AttachBehavior) {
        *self.attach.lock().unwrap() = behavior;
    }

    /// Pushes a message onto a session's attach stream.
    pub fn push(&self, id: &session::Id, status: StatusCode) {
        if let Some(tx) = self.attach_streams.lock().unwrap().get(id) {
            let _ = tx.send(Ok(Response::new(status)));
        }
    }

    /// Ends a session's attach stream.
    pub fn close_attach(&self, id: &session::Id) {
        self.attach_streams.lock().unwrap().remove(id);
    }

    /// Queues the outcomes of upcoming query calls. Unscripted calls
    /// succeed.
    pub fn script_execute<I>(&self, outcomes: I)
    where
        I: IntoIterator<Item = Result<StatusCode, TransportStatus>>,
    {
        self.execute_script.lock().unwrap().extend(outcomes);
    }

    async fn create_session(&self) -> Response {
        let delay = *self.create_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if let Some(status) = *self.create_failure.lock().unwrap() {
            return Response::new(status);
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.created.fetch_add(1, Ordering::SeqCst);
        let open = self.open.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_open.fetch_max(open, Ordering::SeqCst);
        Response::success().with_session(session::Id::new(format!("session-{id}")), NodeId(1))
    }
}

#[async_trait]
impl Transport for TestTransport {
    async fn unary_call(
        &self,
        method: Method,
        request: Request,
        _settings: CallSettings,
    ) -> Result<Response, transport::Error> {
        match method {
            Method::CreateSession => Ok(self.create_session().await),
            Method::DeleteSession => {
                let delay = *self.delete_delay.lock().unwrap();
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                self.deleted.fetch_add(1, Ordering::SeqCst);
                self.open.fetch_sub(1, Ordering::SeqCst);
                if let Some(id) = request.session_id {
                    self.attach_streams.lock().unwrap().remove(&id);
                    self.deleted_ids.lock().unwrap().push(id);
                }
                Ok(Response::success())
            }
            Method::ExecuteQuery => {
                self.executed.fetch_add(1, Ordering::SeqCst);
                let outcome = self
                    .execute_script
                    .lock()
                    .unwrap()
                    .pop_front()
                    .unwrap_or(Ok(StatusCode::Success));
                match outcome {
                    Ok(status) => Ok(Response::new(status)),
                    Err(status) => Err(transport::Error::new(status, "scripted failure")),
                }
            }
            Method::AttachSession => Err(transport::Error::new(
                TransportStatus::Unimplemented,
                "attach is a streaming call",
            )),
        }
    }

    async fn server_stream_call(
        &self,
        method: Method,
        request: Request,
        _settings: CallSettings,
    ) -> Result<ResponseStream, transport::Error> {
        let (Method::AttachSession, Some(id)) = (method, request.session_id) else {
            return Err(transport::Error::new(
                TransportStatus::Unimplemented,
                "only attach streams are supported",
            ));
        };
        let (tx, rx) = mpsc::unbounded_channel();
        match *self.attach.lock().unwrap() {
            AttachBehavior::Status(status) => {
                let _ = tx.send(Ok(Response::new(status)));
                self.attach_streams.lock().unwrap().insert(id, tx);
            }
            AttachBehavior::Silent => {
                self.attach_streams.lock().unwrap().insert(id, tx);
            }
            AttachBehavior::Close => drop(tx),
        }
        Ok(UnboundedReceiverStream::new(rx).boxed())
    }
}

/// A channel factory which counts what it creates and shuts down.
pub struct CountingChannelFactory {
    delay: Duration,
    created: AtomicUsize,
    shut_down: AtomicUsize,
    fail: AtomicBool,
    stall_shutdown: AtomicBool,
}

impl CountingChannelFactory {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            created: AtomicUsize::new(0),
            shut_down: AtomicUsize::new(0),
            fail: AtomicBool::new(false),
            stall_shutdown: AtomicBool::new(false),
        }
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn shut_down(&self) -> usize {
        self.shut_down.load(Ordering::SeqCst)
    }

    pub fn fail_next(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// Makes every shutdown hang forever.
    pub fn stall_shutdown(&self) {
        self.stall_shutdown.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl ChannelFactory for CountingChannelFactory {
    type Channel = String;

    async fn create(&self, endpoint: &str) -> Result<String, anyhow::Error> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.fail.load(Ordering::SeqCst) {
            anyhow::bail!("Refusing to connect to {endpoint}");
        }
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(endpoint.to_string())
    }

    async fn shutdown(&self, _channel: &String) -> Result<(), anyhow::Error> {
        if self.stall_shutdown.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        self.shut_down.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub fn setup_tracing_subscriber() {
    use tracing_subscriber::fmt::format::FmtSpan;
    let _ = tracing_subscriber::fmt()
        .with_thread_names(true)
        .with_span_events(FmtSpan::ENTER)
        .with_max_level(tracing::Level::TRACE)
        .with_test_writer()
        .try_init();
}
