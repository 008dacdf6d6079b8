use thiserror::Error;

pub type NetResult<T> = Result<T, NetError>;

/// Transport errors surfaced to the collector.
///
/// `Timeout` and `Connect` are kept distinct from other failures: the track
/// controller treats them as transient network-down (pause, no retry penalty)
/// rather than as download failures.
#[derive(Debug, Error, Clone)]
pub enum NetError {
    #[error("request timed out")]
    Timeout,

    #[error("could not connect")]
    Connect,

    #[error("HTTP {status} for {url}")]
    HttpStatus { status: u16, url: String },

    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    #[error("request cancelled")]
    Cancelled,
}

impl NetError {
    /// True for failures that indicate the network itself is down rather than
    /// a problem with the requested resource.
    #[must_use]
    pub fn is_network_down(&self) -> bool {
        matches!(self, Self::Timeout | Self::Connect)
    }

    /// HTTP status carried by this error, if any.
    #[must_use]
    pub fn http_status(&self) -> Option<u16> {
        match self {
            Self::HttpStatus { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for NetError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            return Self::Timeout;
        }
        if e.is_connect() {
            return Self::Connect;
        }
        Self::Http(format!("{e:#}"))
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case::timeout(NetError::Timeout, true)]
    #[case::connect(NetError::Connect, true)]
    #[case::status_404(NetError::HttpStatus { status: 404, url: "http://a/b".into() }, false)]
    #[case::generic(NetError::Http("boom".into()), false)]
    fn network_down_classification(#[case] error: NetError, #[case] expected: bool) {
        assert_eq!(error.is_network_down(), expected);
    }

    #[rstest]
    fn http_status_accessor() {
        let err = NetError::HttpStatus {
            status: 503,
            url: "http://a/b".into(),
        };
        assert_eq!(err.http_status(), Some(503));
        assert_eq!(NetError::Timeout.http_status(), None);
    }
}
