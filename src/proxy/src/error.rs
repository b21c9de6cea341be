use thiserror::Error;

/// Whether the failure may be retried against another backend or is final
/// for the connection that raised it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorType {
    Transient,
    Permanent,
}

#[derive(Debug, Error)]
pub enum ProxyError {
    /// Malformed packet, unexpected reply state, replay divergence at the
    /// framing level. Always fatal for the connection.
    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("authentication to '{server}' failed: {code}, {message}")]
    Auth {
        server: String,
        code: u16,
        message: String,
        transient: bool,
    },

    /// A replayed session command returned a different outcome than the one
    /// recorded for the client.
    #[error("response from '{server}' differs from the expected response to {command}")]
    HistoryMismatch { server: String, command: String },

    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),

    #[error("lifecycle: {0}")]
    Lifecycle(String),
}

impl ProxyError {
    pub fn error_type(&self) -> ErrorType {
        match self {
            ProxyError::Protocol(_) => ErrorType::Permanent,
            ProxyError::Auth { transient, .. } => {
                if *transient {
                    ErrorType::Transient
                } else {
                    ErrorType::Permanent
                }
            }
            ProxyError::HistoryMismatch { .. } => ErrorType::Permanent,
            ProxyError::Io(_) => ErrorType::Transient,
            ProxyError::Lifecycle(_) => ErrorType::Permanent,
        }
    }
}

pub type Result<T> = std::result::Result<T, ProxyError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_types() {
        assert_eq!(
            ProxyError::Protocol("bad header".into()).error_type(),
            ErrorType::Permanent
        );
        assert_eq!(
            ProxyError::Io(std::io::Error::new(std::io::ErrorKind::Other, "x")).error_type(),
            ErrorType::Transient
        );
        let auth = ProxyError::Auth {
            server: "db1".into(),
            code: 1,
            message: "Group change during GTM operation".into(),
            transient: true,
        };
        assert_eq!(auth.error_type(), ErrorType::Transient);
    }
}
