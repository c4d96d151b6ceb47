//! Configuration options which can alter the behavior of the pool, its
//! sessions, endpoint selection and retries.

use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum Error {
    #[error("Malformed connection string segment: {0:?}")]
    Malformed(String),

    #[error("Unknown connection string key: {0:?}")]
    UnknownKey(String),

    #[error("Invalid value {value:?} for {key}")]
    InvalidValue { key: &'static str, value: String },

    #[error("Invalid policy: {0}")]
    Invalid(String),
}

/// Policy which is applicable to a session pool.
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PoolPolicy {
    /// The maximum number of sessions which can be open at once.
    pub max_sessions: usize,

    /// Idle eviction never shrinks the pool below this many sessions.
    pub min_sessions: usize,

    /// How long a caller may wait for a session, and how long opening a new
    /// session may take.
    pub create_session_timeout: Duration,

    /// Sessions idle for longer than this are closed, down to
    /// [Self::min_sessions].
    pub idle_timeout: Duration,

    /// How often idle sessions are scanned for eviction.
    pub idle_check_interval: Duration,

    /// How long termination waits for leased sessions to be returned.
    pub terminate_timeout: Duration,
}

impl Default for PoolPolicy {
    fn default() -> Self {
        Self {
            max_sessions: 100,
            min_sessions: 5,
            create_session_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(300),
            idle_check_interval: Duration::from_secs(10),
            terminate_timeout: Duration::from_secs(30),
        }
    }
}

/// Timeouts for the session lifecycle calls.
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SessionConfig {
    pub create_timeout: Duration,

    /// How long to wait for the first message of the attach stream.
    pub attach_timeout: Duration,

    pub delete_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            create_timeout: Duration::from_secs(5),
            attach_timeout: Duration::from_secs(5),
            delete_timeout: Duration::from_secs(1),
        }
    }
}

/// Bounds of a jittered exponential backoff.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BackoffSettings {
    pub base: Duration,
    pub cap: Duration,
}

impl BackoffSettings {
    pub const FAST: Self = Self {
        base: Duration::from_millis(10),
        cap: Duration::from_secs(2),
    };

    pub const SLOW: Self = Self {
        base: Duration::from_secs(1),
        cap: Duration::from_secs(30),
    };
}

#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RetryConfig {
    /// Attempts (including the first) after which failures are returned.
    pub max_attempts: u32,

    pub fast: BackoffSettings,
    pub slow: BackoffSettings,

    /// Hedging is never offered before this many attempts have failed.
    pub hedge_min_attempt: u32,

    /// How long a hedged round waits on the primary attempt before racing a
    /// duplicate against it.
    pub hedge_delay: Duration,

    /// Deadline for operations run without an explicit one.
    pub default_deadline: Option<Duration>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            fast: BackoffSettings::FAST,
            slow: BackoffSettings::SLOW,
            hedge_min_attempt: 2,
            hedge_delay: Duration::from_millis(50),
            default_deadline: None,
        }
    }
}

#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct EndpointConfig {
    /// Endpoints in this location are preferred over all others while they
    /// are healthy.
    pub preferred_location: Option<String>,

    /// How long a channel may take to shut down gracefully.
    pub channel_shutdown_timeout: Duration,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            preferred_location: None,
            channel_shutdown_timeout: Duration::from_secs(5),
        }
    }
}

/// All tunables of the driver core.
#[derive(Clone, Debug, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Policy {
    pub pool: PoolPolicy,
    pub session: SessionConfig,
    pub retry: RetryConfig,
    pub endpoint: EndpointConfig,
}

impl Policy {
    /// Parses a `Key=Value;Key=Value` connection string.
    ///
    /// Keys are case-insensitive. Durations are given in (possibly
    /// fractional) seconds. Keys which are not listed below are rejected.
    ///
    /// | Key                    | Field                               |
    /// |------------------------|-------------------------------------|
    /// | `MaxSessionPool`       | [PoolPolicy::max_sessions]          |
    /// | `MinSessionPool`       | [PoolPolicy::min_sessions]          |
    /// | `CreateSessionTimeout` | [PoolPolicy::create_session_timeout]|
    /// | `SessionIdleTimeout`   | [PoolPolicy::idle_timeout]          |
    /// | `DisposeTimeout`       | [PoolPolicy::terminate_timeout]     |
    /// | `MaxRetryAttempts`     | [RetryConfig::max_attempts]         |
    /// | `OperationDeadline`    | [RetryConfig::default_deadline]     |
    /// | `PreferredLocation`    | [EndpointConfig::preferred_location]|
    pub fn from_connection_string(s: &str) -> Result<Self, Error> {
        let mut policy = Policy::default();

        for segment in s.split(';') {
            let segment = segment.trim();
            if segment.is_empty() {
                continue;
            }
            let Some((key, value)) = segment.split_once('=') else {
                return Err(Error::Malformed(segment.to_string()));
            };
            let value = value.trim();

            match key.trim().to_ascii_lowercase().as_str() {
                "maxsessionpool" => policy.pool.max_sessions = parse_count("MaxSessionPool", value)?,
                "minsessionpool" => policy.pool.min_sessions = parse_count("MinSessionPool", value)?,
                "createsessiontimeout" => {
                    policy.pool.create_session_timeout = parse_secs("CreateSessionTimeout", value)?
                }
                "sessionidletimeout" => {
                    policy.pool.idle_timeout = parse_secs("SessionIdleTimeout", value)?
                }
                "disposetimeout" => {
                    policy.pool.terminate_timeout = parse_secs("DisposeTimeout", value)?
                }
                "maxretryattempts" => {
                    policy.retry.max_attempts = value.parse().map_err(|_| Error::InvalidValue {
                        key: "MaxRetryAttempts",
                        value: value.to_string(),
                    })?
                }
                "operationdeadline" => {
                    policy.retry.default_deadline = Some(parse_secs("OperationDeadline", value)?)
                }
                "preferredlocation" => {
                    policy.endpoint.preferred_location =
                        (!value.is_empty()).then(|| value.to_string())
                }
                _ => return Err(Error::UnknownKey(key.trim().to_string())),
            }
        }

        policy.validate()?;
        Ok(policy)
    }

    /// Rejects combinations which cannot produce a working pool.
    pub fn validate(&self) -> Result<(), Error> {
        if self.pool.max_sessions == 0 {
            return Err(Error::Invalid("max_sessions must be greater than 0".into()));
        }
        if self.pool.min_sessions > self.pool.max_sessions {
            return Err(Error::Invalid(format!(
                "min_sessions ({}) must not exceed max_sessions ({})",
                self.pool.min_sessions, self.pool.max_sessions
            )));
        }
        if self.pool.idle_check_interval.is_zero() {
            return Err(Error::Invalid(
                "idle_check_interval must be greater than 0".into(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(Error::Invalid("max_attempts must be at least 1".into()));
        }
        Ok(())
    }
}

fn parse_count(key: &'static str, value: &str) -> Result<usize, Error> {
    value.parse().map_err(|_| Error::InvalidValue {
        key,
        value: value.to_string(),
    })
}

fn parse_secs(key: &'static str, value: &str) -> Result<Duration, Error> {
    value
        .parse::<f64>()
        .ok()
        .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
        .ok_or_else(|| Error::InvalidValue {
            key,
            value: value.to_string(),
        })
}
