//! The interface the core uses to talk to the server.
//!
//! The wire encoding of requests and responses belongs to the caller; the
//! core only needs to know which method is being called, which session and
//! node it is pinned to, and which status came back.

use crate::endpoint::NodeId;
use crate::session;
use crate::status::{AsFailure, Failure, StatusCode, TransportStatus};

use async_trait::async_trait;
use futures::stream::BoxStream;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// A failure of the transport itself.
#[derive(Error, Debug, Clone)]
#[error("Transport failed with {status:?}: {message}")]
pub struct Error {
    pub status: TransportStatus,
    pub message: String,
}

impl Error {
    pub fn new(status: TransportStatus, message: impl ToString) -> Self {
        Self {
            status,
            message: message.to_string(),
        }
    }
}

impl AsFailure for Error {
    fn as_failure(&self) -> Failure {
        Failure::transport(self.status)
    }
}

/// The server methods used by the session lifecycle.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Method {
    CreateSession,
    AttachSession,
    DeleteSession,
    ExecuteQuery,
}

impl Method {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Method::CreateSession => "CreateSession",
            Method::AttachSession => "AttachSession",
            Method::DeleteSession => "DeleteSession",
            Method::ExecuteQuery => "ExecuteQuery",
        }
    }
}

/// Per-call routing and timing.
#[derive(Clone, Debug, Default)]
pub struct CallSettings {
    /// The node the call must be routed to, if it is pinned to one.
    pub node_id: Option<NodeId>,

    /// How long the call may take. `None` for long-lived streams.
    pub timeout: Option<Duration>,
}

#[derive(Clone, Debug, Default)]
pub struct Request {
    pub session_id: Option<session::Id>,
    pub body: Vec<u8>,
}

impl Request {
    pub fn for_session(session_id: session::Id) -> Self {
        Self {
            session_id: Some(session_id),
            body: Vec::new(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct Response {
    pub status: StatusCode,
    pub session_id: Option<session::Id>,
    pub node_id: Option<NodeId>,
    pub issues: Vec<String>,
    pub body: Vec<u8>,
}

impl Response {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            session_id: None,
            node_id: None,
            issues: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn success() -> Self {
        Self::new(StatusCode::Success)
    }

    pub fn with_session(mut self, session_id: session::Id, node_id: NodeId) -> Self {
        self.session_id = Some(session_id);
        self.node_id = Some(node_id);
        self
    }
}

/// Messages pushed by the server on a streaming call.
pub type ResponseStream = BoxStream<'static, Result<Response, Error>>;

/// Issues unary and server-streaming calls.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn unary_call(
        &self,
        method: Method,
        request: Request,
        settings: CallSettings,
    ) -> Result<Response, Error>;

    async fn server_stream_call(
        &self,
        method: Method,
        request: Request,
        settings: CallSettings,
    ) -> Result<ResponseStream, Error>;
}

pub type SharedTransport = Arc<dyn Transport>;
