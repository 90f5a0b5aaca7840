use std::time::Duration;

/// Typed error hierarchy for provider gateway operations.
/// Classifies errors as rotatable (switch credential), transient (retry same
/// credential), or terminal.
#[derive(Clone, Debug, thiserror::Error)]
pub enum GatewayError {
    // Fatal, never retried
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("no credential slots configured")]
    NoCredentials,
    #[error("all {attempts} credential slots exhausted, last error: {last}")]
    Exhausted { attempts: usize, last: Box<GatewayError> },

    // Rotatable: the credential is unusable right now
    #[error("rate limited")]
    RateLimited { retry_after: Option<Duration> },
    #[error("provider overloaded")]
    ProviderOverloaded,
    #[error("credential rejected: {0}")]
    CredentialRejected(String),

    // Transient
    #[error("server error {status}: {body}")]
    ServerError { status: u16, body: String },
    #[error("network error: {0}")]
    NetworkError(String),
    #[error("stream interrupted: {0}")]
    StreamInterrupted(String),

    // Operational
    #[error("timeout after {0:?}")]
    Timeout(Duration),
    #[error("cancelled")]
    Cancelled,
}

impl GatewayError {
    /// Rate-limit class: drives cooldown and rotation, never shown to users.
    pub fn is_rate_limit(&self) -> bool {
        matches!(self, Self::RateLimited { .. } | Self::ProviderOverloaded)
    }

    /// Failures that mark the current slot as cooling down and move the cursor.
    pub fn is_rotatable(&self) -> bool {
        self.is_rate_limit() || matches!(self, Self::CredentialRejected(_))
    }

    /// Failures worth retrying on the same slot after a backoff.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::ServerError { .. } | Self::NetworkError(_) | Self::Timeout(_)
        )
    }

    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::InvalidRequest(_) | Self::NoCredentials | Self::Exhausted { .. }
        )
    }

    pub fn suggested_delay(&self) -> Option<Duration> {
        if let Self::RateLimited { retry_after } = self {
            *retry_after
        } else {
            None
        }
    }

    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => "invalid_request",
            Self::NoCredentials => "no_credentials",
            Self::Exhausted { .. } => "exhausted",
            Self::RateLimited { .. } => "rate_limited",
            Self::ProviderOverloaded => "provider_overloaded",
            Self::CredentialRejected(_) => "credential_rejected",
            Self::ServerError { .. } => "server_error",
            Self::NetworkError(_) => "network_error",
            Self::StreamInterrupted(_) => "stream_interrupted",
            Self::Timeout(_) => "timeout",
            Self::Cancelled => "cancelled",
        }
    }

    /// Classify an HTTP status code into the appropriate error variant.
    pub fn from_status(status: u16, body: String, retry_after: Option<Duration>) -> Self {
        match status {
            401 | 403 => Self::CredentialRejected(body),
            400 | 404 => Self::InvalidRequest(body),
            429 => Self::RateLimited { retry_after },
            503 | 529 => Self::ProviderOverloaded,
            500..=599 => Self::ServerError { status, body },
            _ => Self::InvalidRequest(format!("unexpected status {status}: {body}")),
        }
    }
}

/// Failure reported by a persistence backend behind one of the core traits.
#[derive(Debug, thiserror::Error)]
#[error("persistence failed: {0}")]
pub struct PersistenceError(pub String);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rotatable_classification() {
        assert!(GatewayError::RateLimited { retry_after: None }.is_rotatable());
        assert!(GatewayError::ProviderOverloaded.is_rotatable());
        assert!(GatewayError::CredentialRejected("revoked".into()).is_rotatable());
        assert!(!GatewayError::ServerError { status: 500, body: "err".into() }.is_rotatable());
    }

    #[test]
    fn rejected_credential_is_not_rate_limit() {
        let err = GatewayError::CredentialRejected("revoked".into());
        assert!(!err.is_rate_limit());
        assert!(!err.is_fatal());
    }

    #[test]
    fn transient_classification() {
        assert!(GatewayError::ServerError { status: 502, body: "bad gateway".into() }.is_transient());
        assert!(GatewayError::NetworkError("tcp".into()).is_transient());
        assert!(!GatewayError::StreamInterrupted("eof".into()).is_transient());
        assert!(!GatewayError::StreamInterrupted("eof".into()).is_fatal());
    }

    #[test]
    fn fatal_classification() {
        assert!(GatewayError::InvalidRequest("bad".into()).is_fatal());
        assert!(GatewayError::NoCredentials.is_fatal());
        let exhausted = GatewayError::Exhausted {
            attempts: 3,
            last: Box::new(GatewayError::RateLimited { retry_after: None }),
        };
        assert!(exhausted.is_fatal());
        assert!(!exhausted.is_rotatable());
    }

    #[test]
    fn cancelled_is_neither() {
        let cancelled = GatewayError::Cancelled;
        assert!(!cancelled.is_rotatable());
        assert!(!cancelled.is_transient());
        assert!(!cancelled.is_fatal());
    }

    #[test]
    fn suggested_delay_only_for_rate_limit() {
        let rl = GatewayError::RateLimited {
            retry_after: Some(Duration::from_secs(5)),
        };
        assert_eq!(rl.suggested_delay(), Some(Duration::from_secs(5)));
        assert_eq!(GatewayError::ProviderOverloaded.suggested_delay(), None);
    }

    #[test]
    fn from_status_mapping() {
        assert!(matches!(
            GatewayError::from_status(403, "forbidden".into(), None),
            GatewayError::CredentialRejected(_)
        ));
        assert!(GatewayError::from_status(400, "bad request".into(), None).is_fatal());
        let rl = GatewayError::from_status(429, "quota".into(), Some(Duration::from_secs(7)));
        assert_eq!(rl.suggested_delay(), Some(Duration::from_secs(7)));
        assert!(GatewayError::from_status(503, "unavailable".into(), None).is_rate_limit());
        assert!(GatewayError::from_status(500, "internal".into(), None).is_transient());
    }

    #[test]
    fn exhausted_message_includes_last_error() {
        let err = GatewayError::Exhausted {
            attempts: 2,
            last: Box::new(GatewayError::RateLimited { retry_after: None }),
        };
        assert_eq!(err.to_string(), "all 2 credential slots exhausted, last error: rate limited");
        assert_eq!(err.error_kind(), "exhausted");
    }
}
