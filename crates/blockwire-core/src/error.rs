//! Error taxonomy: fatal session loss vs per-request server errors.

use core::fmt;

use crate::wire::errcode;

/// Why a session stopped being usable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The byte stream failed or reached EOF.
    Io(String),
    /// The peer violated the protocol; the stream position is unrecoverable.
    Protocol(String),
    /// Local shutdown via `close()`.
    Shutdown,
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(detail) => write!(f, "transport failed: {detail}"),
            Self::Protocol(detail) => write!(f, "protocol violation: {detail}"),
            Self::Shutdown => write!(f, "session shut down"),
        }
    }
}

/// An error the server reported for one request. The session stays usable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerError {
    /// errno-shaped code from the wire.
    pub code: u32,
    /// Human-readable detail from an error chunk, if the server sent one.
    pub message: Option<String>,
    /// Failing offset from an ERROR_OFFSET chunk.
    pub offset: Option<u64>,
}

impl ServerError {
    pub fn from_code(code: u32) -> Self {
        Self {
            code,
            message: None,
            offset: None,
        }
    }

    pub fn is_unsupported(&self) -> bool {
        self.code == errcode::NOTSUP
    }

    fn code_name(&self) -> &'static str {
        match self.code {
            errcode::PERM => "EPERM",
            errcode::IO => "EIO",
            errcode::NOMEM => "ENOMEM",
            errcode::INVAL => "EINVAL",
            errcode::NOSPC => "ENOSPC",
            errcode::OVERFLOW => "EOVERFLOW",
            errcode::NOTSUP => "ENOTSUP",
            errcode::SHUTDOWN => "ESHUTDOWN",
            _ => "unknown",
        }
    }
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "server error {} ({})", self.code_name(), self.code)?;
        if let Some(offset) = self.offset {
            write!(f, " at offset {offset}")?;
        }
        if let Some(message) = &self.message {
            write!(f, ": {message}")?;
        }
        Ok(())
    }
}

/// What a command can come back with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The session is dead; recovery requires a new connection.
    Disconnected(DisconnectReason),
    /// This request failed; the session remains usable.
    Server(ServerError),
    /// The export never negotiated the capability this command needs.
    Unsupported,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected(reason) => write!(f, "disconnected: {reason}"),
            Self::Server(e) => write!(f, "{e}"),
            Self::Unsupported => write!(f, "command not supported by this export"),
        }
    }
}

impl std::error::Error for Error {}

impl From<DisconnectReason> for Error {
    fn from(reason: DisconnectReason) -> Self {
        Self::Disconnected(reason)
    }
}

impl From<ServerError> for Error {
    fn from(e: ServerError) -> Self {
        Self::Server(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_error_formats_with_detail() {
        let e = ServerError {
            code: errcode::NOSPC,
            message: Some("thin pool exhausted".into()),
            offset: Some(4096),
        };
        assert_eq!(
            e.to_string(),
            "server error ENOSPC (28) at offset 4096: thin pool exhausted"
        );
    }

    #[test]
    fn unsupported_is_detectable() {
        assert!(ServerError::from_code(errcode::NOTSUP).is_unsupported());
        assert!(!ServerError::from_code(errcode::IO).is_unsupported());
    }
}
