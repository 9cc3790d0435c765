//! Error taxonomy and classification of remote failures.
//!
//! Every failure coming back from the control plane passes through
//! [`classify`] exactly once. The resulting [`ErrorKind`] is the only thing
//! the rest of the engine looks at when deciding whether to retry.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::backoff::Backoff;
use crate::model::NameReason;

/// Closed set of failure categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// The resource does not exist.
    NotFound,
    /// The name is owned by someone else.
    AlreadyExists,
    /// The name is syntactically or semantically invalid.
    InvalidName,
    /// Another operation holds the resource.
    Conflict,
    /// The control plane asked us to slow down.
    Throttled,
    /// Network failure, timeout or server-side hiccup.
    Transient,
    /// Anything else.
    Fatal,
}

impl ErrorKind {
    /// Whether the engine may retry automatically after this kind.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorKind::Conflict | ErrorKind::Throttled | ErrorKind::Transient
        )
    }

    /// Whether the retry budget applies to this kind.
    pub fn is_bounded(self) -> bool {
        matches!(self, ErrorKind::Conflict | ErrorKind::Throttled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::NotFound => "NotFound",
            ErrorKind::AlreadyExists => "AlreadyExists",
            ErrorKind::InvalidName => "InvalidName",
            ErrorKind::Conflict => "Conflict",
            ErrorKind::Throttled => "Throttled",
            ErrorKind::Transient => "Transient",
            ErrorKind::Fatal => "Fatal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A remote failure mapped onto the taxonomy.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {message}")]
pub struct ClassifiedError {
    pub kind: ErrorKind,
    /// HTTP-equivalent status code, when the remote supplied one.
    pub status: Option<u16>,
    pub message: String,
    pub retryable: bool,
    /// Server-suggested delay before trying again.
    pub retry_after: Option<Duration>,
}

impl ClassifiedError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            status: None,
            message: message.into(),
            retryable: kind.is_retryable(),
            retry_after: None,
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Conflict, message)
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transient, message)
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Fatal, message)
    }

    /// The error reported when a pass is cancelled at a suspension point.
    pub fn cancelled() -> Self {
        Self::transient("operation cancelled")
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_retry_after(mut self, retry_after: Option<Duration>) -> Self {
        self.retry_after = retry_after;
        self
    }

    pub fn is_not_found(&self) -> bool {
        self.kind == ErrorKind::NotFound
    }

    /// Delay before the next attempt: the remote hint when there is one,
    /// otherwise the capped exponential delay for `attempt`.
    pub fn suggested_backoff(&self, backoff: &Backoff, attempt: u32) -> Duration {
        match self.retry_after {
            Some(hint) => backoff.clamp(hint),
            None => backoff.delay(attempt),
        }
    }
}

/// Raw failure reported by a control-plane channel, before classification.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteFailure {
    pub status: Option<u16>,
    /// Remote-supplied reason code such as `ResourceNotFound`.
    pub code: Option<String>,
    pub message: String,
    pub retry_after: Option<Duration>,
    /// The request never got a response (connect error, timeout).
    pub network: bool,
}

impl RemoteFailure {
    pub fn http(status: u16, code: Option<String>, message: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            code,
            message: message.into(),
            ..Default::default()
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            network: true,
            ..Default::default()
        }
    }

    pub fn with_retry_after(mut self, retry_after: Option<Duration>) -> Self {
        self.retry_after = retry_after;
        self
    }
}

impl fmt::Display for RemoteFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.status, &self.code) {
            (Some(status), Some(code)) => write!(f, "{status} {code}: {}", self.message),
            (Some(status), None) => write!(f, "{status}: {}", self.message),
            (None, Some(code)) => write!(f, "{code}: {}", self.message),
            (None, None) => f.write_str(&self.message),
        }
    }
}

fn kind_from_code(code: &str) -> Option<ErrorKind> {
    let kind = match code {
        "ResourceNotFound" | "ResourceGroupNotFound" | "NotFound" | "ParentResourceNotFound" => {
            ErrorKind::NotFound
        }
        "AlreadyExists" | "NameAlreadyExists" | "ServerAlreadyExists" => ErrorKind::AlreadyExists,
        "Invalid" | "InvalidName" | "InvalidResourceName" | "InvalidServerName"
        | "AccountNameInvalid" => ErrorKind::InvalidName,
        "Conflict" | "OperationInProgress" | "AnotherOperationInProgress" => ErrorKind::Conflict,
        "TooManyRequests" | "Throttled" | "SubscriptionRequestsThrottled" => ErrorKind::Throttled,
        _ => return None,
    };
    Some(kind)
}

fn kind_from_status(status: u16) -> ErrorKind {
    match status {
        404 => ErrorKind::NotFound,
        409 => ErrorKind::Conflict,
        429 => ErrorKind::Throttled,
        408 | 500 | 502 | 503 | 504 => ErrorKind::Transient,
        _ => ErrorKind::Fatal,
    }
}

/// Map a raw remote failure onto exactly one [`ErrorKind`].
///
/// A recognised reason code wins over the status code.
pub fn classify(failure: &RemoteFailure) -> ClassifiedError {
    let kind = if failure.network {
        ErrorKind::Transient
    } else {
        failure
            .code
            .as_deref()
            .and_then(kind_from_code)
            .or_else(|| failure.status.map(kind_from_status))
            .unwrap_or(ErrorKind::Fatal)
    };

    let mut err =
        ClassifiedError::new(kind, failure.to_string()).with_retry_after(failure.retry_after);
    err.status = failure.status;
    err
}

/// Terminal error for a failed name check, `None` when the name is free.
pub fn classify_name_reason(
    reason: NameReason,
    name: &str,
    detail: Option<&str>,
) -> Option<ClassifiedError> {
    let (kind, what) = match reason {
        NameReason::Available => return None,
        NameReason::AlreadyExists => (ErrorKind::AlreadyExists, "is already in use"),
        NameReason::Invalid => (ErrorKind::InvalidName, "is not a valid name"),
    };
    let message = match detail {
        Some(detail) if !detail.is_empty() => format!("{name} {what}: {detail}"),
        _ => format!("{name} {what}"),
    };
    Some(ClassifiedError::new(kind, message))
}
