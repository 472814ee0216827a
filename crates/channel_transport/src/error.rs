use std::time::Duration;

use thiserror::Error;

/// Failure taxonomy every transport maps its vendor errors onto.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("not authorized: {0}")]
    NotAuthorized(String),

    #[error("rate limited: {message}")]
    RateLimited {
        message: String,
        retry_after: Option<Duration>,
    },

    #[error("transient failure: {0}")]
    Transient(String),

    #[error("permanent failure: {0}")]
    Permanent(String),
}

impl TransportError {
    /// Map an HTTP status returned by a vendor API onto the taxonomy.
    pub fn from_status(status: u16, body: impl Into<String>) -> Self {
        let body = body.into();
        match status {
            401 | 403 => TransportError::NotAuthorized(format!("{status}: {body}")),
            429 => TransportError::RateLimited {
                message: format!("{status}: {body}"),
                retry_after: None,
            },
            408 | 500..=599 => TransportError::Transient(format!("{status}: {body}")),
            _ => TransportError::Permanent(format!("{status}: {body}")),
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TransportError::RateLimited { .. } | TransportError::Transient(_)
        )
    }

    pub fn kind(&self) -> &'static str {
        match self {
            TransportError::NotAuthorized(_) => "not_authorized",
            TransportError::RateLimited { .. } => "rate_limited",
            TransportError::Transient(_) => "transient",
            TransportError::Permanent(_) => "permanent",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_map_onto_taxonomy() {
        assert!(matches!(
            TransportError::from_status(401, "bad token"),
            TransportError::NotAuthorized(_)
        ));
        assert!(matches!(
            TransportError::from_status(429, "slow down"),
            TransportError::RateLimited { .. }
        ));
        assert!(TransportError::from_status(503, "").is_retryable());
        assert!(!TransportError::from_status(400, "bad request").is_retryable());
        assert_eq!(TransportError::from_status(404, "").kind(), "permanent");
    }
}
