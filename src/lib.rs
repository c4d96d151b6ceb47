//! sessorb is the resilience core of a database client driver.
//!
//! It keeps a bounded pool of server-side sessions ready for use, tracks
//! which endpoints are healthy, reuses one transport channel per endpoint,
//! and decides, per failed call, whether and how to retry.
//!
//! It uses the following terminology:
//! * Endpoints are server nodes, addressed by host and port, carrying a
//!   priority which is pessimized when calls to them fail.
//! * Channels are transport connections, one per endpoint.
//! * Sessions are server-side handles bound to one node. They are opened
//!   with a create call, kept honest by a long-lived attach stream, and
//!   deleted explicitly.
//!
//! # Usage
//!
//! * The main interface for sessions is [pool::Pool], which hands out
//!   [claim::Handle]s. To construct a pool, supply a [session::Factory],
//!   usually an [session::AttachedSessionFactory] over a
//!   [transport::Transport].
//! * Failed operations are retried by [executor::RetryExecutor], under the
//!   decisions of a [retry::RetryPolicy].
//! * Endpoint selection and channel reuse live in [endpoint::EndpointPool]
//!   and [channel::ChannelPool], combined by [balancer::Balancer].
//!
//! # DTrace probes
//!
//! sessorb contains a number of DTrace USDT probes, which fire as sessions
//! are created, handed out, broken and deleted, and as operations are
//! retried. The full list of probes is:
//!
//! - `get-session-start`: Fires before a caller asks the pool for a session.
//! - `get-session-done`: Fires before a session is returned to the caller.
//! - `get-session-failed`: Fires when the pool cannot provide a session.
//! - `session-create-start`: Fires before the pool opens a new session.
//! - `session-create-done`: Fires after a new session is attached.
//! - `session-create-failed`: Fires when opening a new session fails.
//! - `session-broken`: Fires when a session becomes unusable.
//! - `session-deleted`: Fires after a delete request for a session finishes.
//! - `handle-returned`: Fires when a leased session comes back to the pool.
//! - `endpoint-pessimized`: Fires when an endpoint is marked unhealthy.
//! - `retry-attempt`: Fires when an operation is about to be retried.
//! - `hedge-start`: Fires when a hedged attempt races the primary attempt.
//!
//! The existence of the probes is behind the `"probes"` feature, which is
//! enabled by default. Probes are zero-cost unless they are explicitly
//! enabled, by tracing the program with the `dtrace(1)` command-line tool.
//!
//! Registration of the probes is technically fallible, so
//! [pool::Pool::new] returns a `Result` whose error variant still gives
//! access to the pool.

// Public API
pub mod balancer;
pub mod channel;
pub mod claim;
pub mod endpoint;
pub mod executor;
pub mod policy;
pub mod pool;
pub mod retry;
pub mod session;
pub mod status;
pub mod transport;

// Necessary for implementation
mod backoff;
mod slot;
#[cfg(test)]
mod test_utils;

/// USDT probes for tracing how sessions are pooled and operations retried.
#[cfg(feature = "probes")]
#[usdt::provider(provider = "sessorb")]
mod probes {
    /// Fires right before a caller asks the pool for a session.
    fn get__session__start(pool: &str) {}

    /// Fires when a session is handed to a caller.
    fn get__session__done(pool: &str, session_id: &str) {}

    /// Fires when the pool fails to provide a session, with a string
    /// identifying the reason.
    fn get__session__failed(pool: &str, reason: &str) {}

    /// Fires before the pool opens a brand new session.
    fn session__create__start(pool: &str, slot_id: u64) {}

    /// Fires after a new session is created and attached.
    fn session__create__done(pool: &str, slot_id: u64, session_id: &str) {}

    /// Fires when a new session could not be opened.
    fn session__create__failed(pool: &str, slot_id: u64, reason: &str) {}

    /// Fires when a session transitions into the broken state.
    fn session__broken(session_id: &str, reason: &str) {}

    /// Fires after the delete request for a session completes, successfully
    /// or not.
    fn session__deleted(session_id: &str) {}

    /// Fires when a leased session is returned to the pool.
    fn handle__returned(pool: &str, slot_id: u64) {}

    /// Fires when an endpoint is pessimized.
    fn endpoint__pessimized(endpoint: &str) {}

    /// Fires before a failed operation is retried, with the delay chosen.
    fn retry__attempt(attempt: u32, delay_ms: u64) {}

    /// Fires when a hedged attempt is raced against the primary attempt.
    fn hedge__start(attempt: u32) {}
}
