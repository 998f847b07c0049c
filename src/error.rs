//! Error types shared across the daemon.
//!
//! The original design used exceptions carrying reply lines for control
//! flow; here every fallible seam returns [`FtpError`], and the command
//! dispatcher translates the variant into a terminal protocol reply. Errors
//! are recovered at the session boundary: a session never propagates an
//! error into the listener, and the listener never propagates per-session
//! errors globally.

use std::io;

use thiserror::Error;

/// Result alias used by all daemon operations.
pub type FtpResult<T> = Result<T, FtpError>;

/// The error sum type propagated to the command dispatcher.
#[derive(Debug, Error)]
pub enum FtpError {
    /// Malformed command, bad sequence or bad arguments. Mapped onto the
    /// 500/501/503/504 reply the variant carries; the session survives.
    #[error("{message}")]
    Protocol {
        /// Reply code on the 500 line.
        code: u16,
        /// Short single-line human reason.
        message: String,
    },

    /// Authentication failure: wrong password, missing user, concurrent
    /// limit, IP-mask or IDENT mismatch. Always a 530-class reply.
    #[error("{0}")]
    Auth(String),

    /// Authorization or policy denial: capability missing, FXP denied,
    /// ratio insufficient, read-only mount. 550 with the reason.
    #[error("{0}")]
    Denied(String),

    /// Disk full while storing (552).
    #[error("Insufficient storage space")]
    Storage,

    /// Transfer aborted by the client (426 followed by 226).
    #[error("Transfer aborted")]
    Aborted,

    /// A configured timeout expired (421, connection closed).
    #[error("Timeout")]
    Timeout,

    /// The session cancellation signal tripped.
    #[error("Session cancelled")]
    Cancelled,

    /// Underlying socket or disk failure.
    #[error(transparent)]
    Io(#[from] io::Error),

    /// Unexpected internal failure. Logged in detail, the client only
    /// sees a generic 421, and the session closes.
    #[error("Internal error: {0}")]
    Fatal(String),
}

impl FtpError {
    /// Protocol error with an explicit reply code.
    pub fn protocol(code: u16, message: impl Into<String>) -> Self {
        FtpError::Protocol { code, message: message.into() }
    }

    /// 500 Syntax error.
    pub fn syntax(message: impl Into<String>) -> Self {
        FtpError::protocol(500, message)
    }

    /// 501 bad arguments.
    pub fn bad_argument(message: impl Into<String>) -> Self {
        FtpError::protocol(501, message)
    }

    /// 503 bad sequence of commands.
    pub fn bad_sequence(message: impl Into<String>) -> Self {
        FtpError::protocol(503, message)
    }

    /// Policy/authorization denial carrying a short human reason.
    pub fn denied(message: impl Into<String>) -> Self {
        FtpError::Denied(message.into())
    }

    /// The reply code a session should emit for this error.
    pub fn reply_code(&self) -> u16 {
        match self {
            FtpError::Protocol { code, .. } => *code,
            FtpError::Auth(_) => 530,
            FtpError::Denied(_) => 550,
            FtpError::Storage => 552,
            FtpError::Aborted => 426,
            FtpError::Timeout => 421,
            FtpError::Cancelled => 421,
            FtpError::Io(_) => 426,
            FtpError::Fatal(_) => 421,
        }
    }

    /// Whether the session must close after replying.
    pub fn closes_session(&self) -> bool {
        matches!(
            self,
            FtpError::Timeout | FtpError::Cancelled | FtpError::Fatal(_)
        )
    }
}
