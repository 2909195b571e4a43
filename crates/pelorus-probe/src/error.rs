use thiserror::Error;

/// Classified probe failures. Retryability drives both the in-client retry
/// loop and the collector's cross-attempt working set.
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("request timed out after {timeout_seconds}s: {detail}")]
    Timeout {
        timeout_seconds: u64,
        detail: String,
    },

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("authentication rejected: {0}")]
    Auth(String),

    #[error("invalid probe configuration: {0}")]
    Config(String),

    #[error("query failed with HTTP {status}: {body}")]
    Http { status: u16, body: String },
}

impl ProbeError {
    /// TIMEOUT and CONNECTION retry; AUTH and CONFIG never do. HTTP retries
    /// on 5xx and 429 only.
    pub fn is_retryable(&self) -> bool {
        match self {
            ProbeError::Timeout { .. } | ProbeError::Connection(_) => true,
            ProbeError::Auth(_) | ProbeError::Config(_) => false,
            ProbeError::Http { status, .. } => *status >= 500 || *status == 429,
        }
    }

    pub fn classify_transport(err: &reqwest::Error, timeout_seconds: u64) -> ProbeError {
        if err.is_timeout() {
            ProbeError::Timeout {
                timeout_seconds,
                detail: err.to_string(),
            }
        } else if err.is_connect() {
            ProbeError::Connection(err.to_string())
        } else {
            ProbeError::Connection(err.to_string())
        }
    }

    pub fn from_status(status: u16, body: String) -> ProbeError {
        match status {
            401 | 403 => ProbeError::Auth(format!("HTTP {status}: {body}")),
            _ => ProbeError::Http { status, body },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryability_follows_the_taxonomy() {
        assert!(ProbeError::Timeout {
            timeout_seconds: 30,
            detail: "deadline".into()
        }
        .is_retryable());
        assert!(ProbeError::Connection("refused".into()).is_retryable());
        assert!(!ProbeError::Auth("401".into()).is_retryable());
        assert!(!ProbeError::Config("no ips".into()).is_retryable());
        assert!(ProbeError::Http {
            status: 503,
            body: String::new()
        }
        .is_retryable());
        assert!(ProbeError::Http {
            status: 429,
            body: String::new()
        }
        .is_retryable());
        assert!(!ProbeError::Http {
            status: 404,
            body: String::new()
        }
        .is_retryable());
    }

    #[test]
    fn auth_statuses_map_to_auth_variant() {
        assert!(matches!(
            ProbeError::from_status(401, "denied".into()),
            ProbeError::Auth(_)
        ));
        assert!(matches!(
            ProbeError::from_status(403, "denied".into()),
            ProbeError::Auth(_)
        ));
        assert!(matches!(
            ProbeError::from_status(500, "oops".into()),
            ProbeError::Http { status: 500, .. }
        ));
    }
}
