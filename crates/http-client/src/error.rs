//! Error handling: a narrow result type carrying a kind and a short
//! message, propagated across task/callback boundaries instead of
//! exceptions.

use std::fmt;

/// The error kinds this crate raises.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    /// Reported synchronously with no side effects: invalid URL, missing
    /// Host when `keep_host_header`, conflicting output targets,
    /// unsupported scheme, invalid proxy dictionary.
    Config,
    /// Classified by phase: connect, write-readiness, TLS-setup,
    /// TLS-handshake, or overall task deadline.
    Timeout,
    /// Malformed chunked framing, malformed response status line, or a
    /// forbidden response field.
    Protocol,
    /// Allocation/buffer pressure; the task is torn down and the
    /// connection is not reused.
    Exhaustion,
    /// TLS or TCP transport failure below the protocol layer.
    Transport,
}

impl Kind {
    /// The client-log `cause` column this kind maps to when no more
    /// specific phase is known.
    pub fn log_cause(self) -> &'static str {
        match self {
            Kind::Config | Kind::Protocol | Kind::Exhaustion | Kind::Transport => "error",
            Kind::Timeout => "tasktimeout",
        }
    }
}

/// A single operation error: a `Kind` plus a short message.
#[derive(Debug, Clone)]
pub struct Error {
    kind: Kind,
    message: String,
}

impl Error {
    pub fn new(kind: Kind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::new(Kind::Config, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(Kind::Timeout, message)
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(Kind::Protocol, message)
    }

    pub fn exhaustion(message: impl Into<String>) -> Self {
        Self::new(Kind::Exhaustion, message)
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(Kind::Transport, message)
    }

    pub fn kind(&self) -> Kind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::transport(e.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for Error {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Error::timeout("operation deadline elapsed")
    }
}

pub type Result<T> = std::result::Result<T, Error>;
