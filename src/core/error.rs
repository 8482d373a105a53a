use reqwest::StatusCode;
use thiserror::Error;

/// Failure classification the scheduler dispatches on.
///
/// `Transient` failures re-enter the queue (bounded by `max_retries`);
/// `Permanent` failures stick the catalog entry at `failed` immediately.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("transient: {0}")]
    Transient(String),
    #[error("permanent: {0}")]
    Permanent(String),
}

impl FetchError {
    pub fn is_transient(&self) -> bool {
        matches!(self, FetchError::Transient(_))
    }

    /// Map an HTTP status to the taxonomy: 5xx and 429 are retriable,
    /// every other 4xx is not.
    pub fn from_status(status: StatusCode, url: &str) -> Option<FetchError> {
        if status.is_success() {
            return None;
        }
        if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            Some(FetchError::Transient(format!("http_{} {}", status.as_u16(), url)))
        } else {
            Some(FetchError::Permanent(format!("http_{} {}", status.as_u16(), url)))
        }
    }

    pub fn transient(e: impl std::fmt::Display) -> FetchError {
        FetchError::Transient(e.to_string())
    }

    pub fn permanent(e: impl std::fmt::Display) -> FetchError {
        FetchError::Permanent(e.to_string())
    }
}

/// Integrity violation in one of the embedded stores. Fatal: callers log and
/// exit rather than retry. Detected via `anyhow`'s downcast chain.
#[derive(Debug, Error)]
#[error("store corruption: {0}")]
pub struct CorruptionError(pub String);

/// True when any error in the chain is a [`CorruptionError`].
pub fn is_corruption(err: &anyhow::Error) -> bool {
    err.chain().any(|e| e.is::<CorruptionError>())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_taxonomy() {
        let t = FetchError::from_status(StatusCode::TOO_MANY_REQUESTS, "u").unwrap();
        assert!(t.is_transient());
        let t = FetchError::from_status(StatusCode::BAD_GATEWAY, "u").unwrap();
        assert!(t.is_transient());
        let p = FetchError::from_status(StatusCode::NOT_FOUND, "u").unwrap();
        assert!(!p.is_transient());
        assert!(FetchError::from_status(StatusCode::OK, "u").is_none());
    }

    #[test]
    fn corruption_detected_through_chain() {
        let inner: anyhow::Error = CorruptionError("mixed content hashes".into()).into();
        let wrapped = inner.context("reading chunks");
        assert!(is_corruption(&wrapped));
        assert!(!is_corruption(&anyhow::anyhow!("plain failure")));
    }
}
