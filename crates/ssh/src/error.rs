//! Error types for SSH sessions and SCP transfers.

/// Errors produced by SSH sessions.
#[derive(Debug, thiserror::Error)]
pub enum SshError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("connection to {host} failed: {reason}")]
    Connect { host: String, reason: String },

    #[error("host key mismatch for {host}: expected {expected}, presented {presented}")]
    HostKeyMismatch {
        host: String,
        expected: String,
        presented: String,
    },

    #[error("authentication failed for {user}@{host}")]
    AuthFailed { user: String, host: String },

    #[error("session closed: {0}")]
    Disconnected(String),

    #[error("channel error: {0}")]
    Channel(String),

    #[error("no such remote file: {0}")]
    NoSuchFile(String),

    #[error("remote error: {0}")]
    Remote(String),

    #[error("scp protocol error: {0}")]
    Protocol(String),

    #[error("invalid key material: {0}")]
    Key(String),

    #[error("operation timed out")]
    Timeout,
}

impl SshError {
    /// Returns `true` when the session itself is unusable, as opposed to a
    /// failure confined to one file or command.
    pub fn is_session_fatal(&self) -> bool {
        matches!(
            self,
            Self::Connect { .. }
                | Self::HostKeyMismatch { .. }
                | Self::AuthFailed { .. }
                | Self::Disconnected(_)
                | Self::Channel(_)
                | Self::Timeout
        )
    }
}

impl From<russh::Error> for SshError {
    fn from(e: russh::Error) -> Self {
        match e {
            russh::Error::Disconnect | russh::Error::SendError | russh::Error::HUP => {
                Self::Disconnected(e.to_string())
            }
            other => Self::Channel(other.to_string()),
        }
    }
}

impl From<russh::keys::Error> for SshError {
    fn from(e: russh::keys::Error) -> Self {
        Self::Key(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn per_file_errors_are_not_session_fatal() {
        assert!(!SshError::NoSuchFile("/x".into()).is_session_fatal());
        assert!(!SshError::Remote("permission denied".into()).is_session_fatal());
        assert!(!SshError::Protocol("bad ack".into()).is_session_fatal());
    }

    #[test]
    fn connection_errors_are_session_fatal() {
        assert!(SshError::Timeout.is_session_fatal());
        assert!(SshError::Disconnected("eof".into()).is_session_fatal());
        assert!(
            SshError::HostKeyMismatch {
                host: "h".into(),
                expected: "a".into(),
                presented: "b".into(),
            }
            .is_session_fatal()
        );
    }
}
