use http::StatusCode;

/// Error kinds recorded verbatim into the error log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    ConcurrencyLimit,
    BillingError,
    NoAccount,
    UpstreamError,
    ForwardError,
    InvalidRequest,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::ConcurrencyLimit => "concurrency_limit",
            ErrorKind::BillingError => "billing_error",
            ErrorKind::NoAccount => "no_account",
            ErrorKind::UpstreamError => "upstream_error",
            ErrorKind::ForwardError => "forward_error",
            ErrorKind::InvalidRequest => "invalid_request_error",
        }
    }
}

/// Upstream statuses that trigger a switch to another account instead of
/// surfacing to the client.
pub fn is_failover_status(status: u16) -> bool {
    matches!(status, 401 | 403 | 429 | 500 | 502 | 503 | 504 | 529)
}

/// Map the last upstream failure onto the status, client-facing error type,
/// and message returned once failover is exhausted.
pub fn map_upstream_error(status: Option<u16>) -> (StatusCode, &'static str, &'static str) {
    match status {
        Some(401) => (
            StatusCode::BAD_GATEWAY,
            "upstream_error",
            "Upstream authentication failed, please contact administrator",
        ),
        Some(403) => (
            StatusCode::BAD_GATEWAY,
            "upstream_error",
            "Upstream access forbidden, please contact administrator",
        ),
        Some(429) => (
            StatusCode::TOO_MANY_REQUESTS,
            "rate_limit_error",
            "Upstream rate limit exceeded, please retry later",
        ),
        Some(529) => (
            StatusCode::SERVICE_UNAVAILABLE,
            "upstream_error",
            "Upstream service overloaded, please retry later",
        ),
        Some(500) | Some(502) | Some(503) | Some(504) => (
            StatusCode::BAD_GATEWAY,
            "upstream_error",
            "Upstream service temporarily unavailable",
        ),
        _ => (
            StatusCode::BAD_GATEWAY,
            "upstream_error",
            "Upstream request failed",
        ),
    }
}
