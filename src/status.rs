//! Status codes reported by the server and by the transport, and the
//! interface for classifying failures into them.

/// A status code reported by the server, or synthesized on the client when
/// the transport fails.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum StatusCode {
    Success,
    BadRequest,
    Unauthorized,
    InternalError,
    Aborted,
    Unavailable,
    Overloaded,
    SchemeError,
    GenericError,
    Timeout,
    BadSession,
    PreconditionFailed,
    AlreadyExists,
    NotFound,
    SessionExpired,
    Cancelled,
    Undetermined,
    Unsupported,
    SessionBusy,

    // Client-side statuses, derived from transport failures.
    ClientTransportUnknown,
    ClientTransportUnavailable,
    ClientTransportTimeout,
    ClientTransportResourceExhausted,
    ClientTransportUnimplemented,
}

impl StatusCode {
    pub fn is_success(self) -> bool {
        matches!(self, StatusCode::Success)
    }

    /// Returns true if a session which observed this status can no longer
    /// be trusted, and must be deleted rather than reused.
    pub fn invalidates_session(self) -> bool {
        matches!(
            self,
            StatusCode::Cancelled
                | StatusCode::BadSession
                | StatusCode::SessionBusy
                | StatusCode::SessionExpired
                | StatusCode::InternalError
                | StatusCode::ClientTransportTimeout
                | StatusCode::Unavailable
                | StatusCode::ClientTransportUnavailable
        )
    }

    // Convert to a static string for USDT probes and logs.
    pub const fn as_str(&self) -> &'static str {
        match self {
            StatusCode::Success => "Success",
            StatusCode::BadRequest => "BadRequest",
            StatusCode::Unauthorized => "Unauthorized",
            StatusCode::InternalError => "InternalError",
            StatusCode::Aborted => "Aborted",
            StatusCode::Unavailable => "Unavailable",
            StatusCode::Overloaded => "Overloaded",
            StatusCode::SchemeError => "SchemeError",
            StatusCode::GenericError => "GenericError",
            StatusCode::Timeout => "Timeout",
            StatusCode::BadSession => "BadSession",
            StatusCode::PreconditionFailed => "PreconditionFailed",
            StatusCode::AlreadyExists => "AlreadyExists",
            StatusCode::NotFound => "NotFound",
            StatusCode::SessionExpired => "SessionExpired",
            StatusCode::Cancelled => "Cancelled",
            StatusCode::Undetermined => "Undetermined",
            StatusCode::Unsupported => "Unsupported",
            StatusCode::SessionBusy => "SessionBusy",
            StatusCode::ClientTransportUnknown => "ClientTransportUnknown",
            StatusCode::ClientTransportUnavailable => "ClientTransportUnavailable",
            StatusCode::ClientTransportTimeout => "ClientTransportTimeout",
            StatusCode::ClientTransportResourceExhausted => "ClientTransportResourceExhausted",
            StatusCode::ClientTransportUnimplemented => "ClientTransportUnimplemented",
        }
    }
}

impl std::fmt::Display for StatusCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.as_str().fmt(f)
    }
}

/// A failure reported by the transport itself, before any server status
/// could be read.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum TransportStatus {
    Cancelled,
    Unknown,
    DeadlineExceeded,
    ResourceExhausted,
    Unimplemented,
    Internal,
    Unavailable,
}

impl From<TransportStatus> for StatusCode {
    fn from(status: TransportStatus) -> Self {
        match status {
            TransportStatus::Cancelled => StatusCode::Cancelled,
            TransportStatus::Unknown | TransportStatus::Internal => {
                StatusCode::ClientTransportUnknown
            }
            TransportStatus::DeadlineExceeded => StatusCode::ClientTransportTimeout,
            TransportStatus::ResourceExhausted => StatusCode::ClientTransportResourceExhausted,
            TransportStatus::Unimplemented => StatusCode::ClientTransportUnimplemented,
            TransportStatus::Unavailable => StatusCode::ClientTransportUnavailable,
        }
    }
}

/// What is known about a failed call.
///
/// Either half may be missing: a server can fail a call with a status and
/// no transport problem, and a broken transport never yields a server
/// status.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Failure {
    pub status: Option<StatusCode>,
    pub transport: Option<TransportStatus>,
}

impl Failure {
    pub fn status(status: StatusCode) -> Self {
        Self {
            status: Some(status),
            transport: None,
        }
    }

    pub fn transport(transport: TransportStatus) -> Self {
        Self {
            status: None,
            transport: Some(transport),
        }
    }

    /// The single status which best describes this failure, suitable for
    /// reporting to a session.
    pub fn effective_status(&self) -> Option<StatusCode> {
        self.status.or(self.transport.map(StatusCode::from))
    }
}

/// Errors which know which [Failure] they represent.
pub trait AsFailure {
    fn as_failure(&self) -> Failure;
}

/// Translates an operation's error into a [Failure].
///
/// Implemented for closures, and by [StatusClassifier] for any error
/// implementing [AsFailure].
pub trait Classifier<E: ?Sized>: Send + Sync {
    fn classify(&self, err: &E) -> Failure;
}

impl<E, F> Classifier<E> for F
where
    E: ?Sized,
    F: Fn(&E) -> Failure + Send + Sync,
{
    fn classify(&self, err: &E) -> Failure {
        self(err)
    }
}

/// A [Classifier] for the errors produced by this crate.
#[derive(Copy, Clone, Debug, Default)]
pub struct StatusClassifier;

impl<E: AsFailure + ?Sized> Classifier<E> for StatusClassifier {
    fn classify(&self, err: &E) -> Failure {
        err.as_failure()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn transport_failures_map_to_client_statuses() {
        let failure = Failure::transport(TransportStatus::Unavailable);
        assert_eq!(
            failure.effective_status(),
            Some(StatusCode::ClientTransportUnavailable)
        );

        let failure = Failure::transport(TransportStatus::DeadlineExceeded);
        assert_eq!(
            failure.effective_status(),
            Some(StatusCode::ClientTransportTimeout)
        );
        assert!(failure.effective_status().unwrap().invalidates_session());
    }

    #[test]
    fn server_status_wins_over_transport() {
        let failure = Failure {
            status: Some(StatusCode::Overloaded),
            transport: Some(TransportStatus::Unavailable),
        };
        assert_eq!(failure.effective_status(), Some(StatusCode::Overloaded));
        assert_eq!(Failure::default().effective_status(), None);
    }

    #[test]
    fn application_errors_keep_sessions() {
        for status in [
            StatusCode::Success,
            StatusCode::BadRequest,
            StatusCode::SchemeError,
            StatusCode::PreconditionFailed,
            StatusCode::Overloaded,
        ] {
            assert!(!status.invalidates_session(), "{status}");
        }
    }
}
