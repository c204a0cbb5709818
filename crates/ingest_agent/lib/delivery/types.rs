use std::fmt;
use std::io;

use thiserror::Error;

/// Base interval between delivery retries.
pub const RETRY_INTERVAL_MS: i64 = 60_000;
/// Give-up window for server-side and unknown transport faults.
pub const LONG_RETRY_WINDOW_MS: i64 = 2 * 60 * 60 * 1000;
/// Give-up window for timed-out attempts.
pub const TIMEOUT_RETRY_WINDOW_MS: i64 = 20 * 60 * 1000;
/// Attempt budget for refused or dropped connections.
pub const SHORT_RETRY_ATTEMPTS: u32 = 3;

/// What the underlying cause of a destination fault looked like.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultCause {
    /// The destination could not parse or extract the payload.
    ContentParse,
    Timeout,
    Other,
}

/// Transport-level failure reported by a connector.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportFault {
    #[error("connection refused: {0}")]
    ConnectionRefused(String),
    #[error("timed out: {0}")]
    TimedOut(String),
    /// I/O interrupted for a reason other than a timeout.
    #[error("interrupted: {0}")]
    Interrupted(String),
    #[error("i/o error: {message}")]
    Io {
        kind: Option<io::ErrorKind>,
        message: String,
    },
}

impl From<io::Error> for TransportFault {
    fn from(err: io::Error) -> Self {
        let message = err.to_string();
        match err.kind() {
            io::ErrorKind::ConnectionRefused => Self::ConnectionRefused(message),
            io::ErrorKind::TimedOut => Self::TimedOut(message),
            io::ErrorKind::Interrupted => Self::Interrupted(message),
            kind => Self::Io {
                kind: Some(kind),
                message,
            },
        }
    }
}

/// Raw failure of one delivery attempt, before classification.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeliveryFault {
    /// The caller cancelled the attempt.
    #[error("delivery attempt cancelled")]
    Cancelled,
    /// The destination answered with a structured status code.
    #[error("destination returned status {code}: {message}")]
    Status {
        code: u16,
        message: String,
        cause: Option<FaultCause>,
    },
    #[error(transparent)]
    Transport(#[from] TransportFault),
    /// The destination client failed internally without a status code.
    #[error("destination client failure: {message}")]
    Internal {
        message: String,
        cause: Option<FaultCause>,
    },
    #[error("unrecognized delivery failure: {message}")]
    Unrecognized { message: String },
}

impl DeliveryFault {
    pub fn status(code: u16, message: impl Into<String>) -> Self {
        Self::Status {
            code,
            message: message.into(),
            cause: None,
        }
    }
}

impl From<io::Error> for DeliveryFault {
    fn from(err: io::Error) -> Self {
        Self::Transport(err.into())
    }
}

/// What to do when a retry window closes without a successful attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExhaustionAction {
    /// Abort the enclosing job; the destination is unusable.
    AbortJob,
    /// Give up on this document and let the job continue.
    SkipDocument,
}

/// Scheduling request produced by a retryable failure. Times are epoch milliseconds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryWindow {
    pub next_attempt_at: i64,
    /// No further attempts after this time; `None` means unbounded.
    pub give_up_at: Option<i64>,
    /// Total attempts allowed; `None` means unbounded.
    pub max_attempts: Option<u32>,
    pub on_exhausted: ExhaustionAction,
    pub reason: String,
}

impl RetryWindow {
    /// Whether the scheduler may make another attempt after `attempts_made` attempts.
    pub fn permits_attempt(&self, attempts_made: u32, now_ms: i64) -> bool {
        if self.give_up_at.is_some_and(|deadline| now_ms > deadline) {
            return false;
        }
        self.max_attempts
            .map_or(true, |max_attempts| attempts_made < max_attempts)
    }
}

impl fmt::Display for RetryWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "retry at {}", self.next_attempt_at)?;
        if let Some(deadline) = self.give_up_at {
            write!(f, ", give up after {deadline}")?;
        }
        if let Some(max_attempts) = self.max_attempts {
            write!(f, ", at most {max_attempts} attempts")?;
        }
        write!(f, ": {}", self.reason)
    }
}

/// Classified result of one delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Success,
    PermanentReject { reason: String },
    Retry(RetryWindow),
    Fatal { reason: String },
    Interrupted,
}

impl DeliveryOutcome {
    /// Activity result code recorded for the attempt.
    pub fn result_code(&self, fault: Option<&DeliveryFault>) -> String {
        match (self, fault) {
            (Self::Success, _) => "OK".to_string(),
            (_, Some(DeliveryFault::Status { code, .. })) if *code != 0 => code.to_string(),
            (Self::PermanentReject { .. }, _) => "REJECTED".to_string(),
            (Self::Retry(_), _) => "RETRY".to_string(),
            (Self::Interrupted, _) => "INTERRUPTED".to_string(),
            (Self::Fatal { .. }, _) => "FATAL".to_string(),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::PermanentReject { .. } => "permanent_reject",
            Self::Retry(_) => "retry",
            Self::Fatal { .. } => "fatal",
            Self::Interrupted => "interrupted",
        }
    }
}
