#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamErrorKind {
    RateLimited,
    AuthFailed,
    LengthExceeded,
    ServerError,
    TransportError,
    ClientError,
}

impl UpstreamErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpstreamErrorKind::RateLimited => "rate_limited",
            UpstreamErrorKind::AuthFailed => "auth_failed",
            UpstreamErrorKind::LengthExceeded => "length_exceeded",
            UpstreamErrorKind::ServerError => "server_error",
            UpstreamErrorKind::TransportError => "transport_error",
            UpstreamErrorKind::ClientError => "client_error",
        }
    }
}

/// The length ceiling surfaces as a body-level error code, usually on a 400.
pub fn is_length_error(body: &str) -> bool {
    if body.contains("CONTENT_LENGTH_EXCEEDS_THRESHOLD") {
        return true;
    }
    if body.contains("Input is too long") {
        return true;
    }
    let lowered = body.to_lowercase();
    if lowered.contains("too long")
        && (lowered.contains("input") || lowered.contains("content") || lowered.contains("message"))
    {
        return true;
    }
    lowered.contains("context length") || lowered.contains("token limit")
}

pub fn classify(status: u16, body: &str) -> UpstreamErrorKind {
    match status {
        429 => UpstreamErrorKind::RateLimited,
        401 | 403 => UpstreamErrorKind::AuthFailed,
        500..=599 => UpstreamErrorKind::ServerError,
        _ if is_length_error(body) => UpstreamErrorKind::LengthExceeded,
        _ => UpstreamErrorKind::ClientError,
    }
}

/// Retry-After delays occasionally arrive in the body instead of the header.
pub fn parse_retry_delay_secs(body: &str) -> Option<u64> {
    let re = regex::Regex::new(r"(?i)(?:retry after|try again in)\s*(\d+)\s*s").ok()?;
    let caps = re.captures(body)?;
    caps[1].parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification() {
        assert_eq!(classify(429, ""), UpstreamErrorKind::RateLimited);
        assert_eq!(classify(401, ""), UpstreamErrorKind::AuthFailed);
        assert_eq!(classify(403, ""), UpstreamErrorKind::AuthFailed);
        assert_eq!(classify(500, ""), UpstreamErrorKind::ServerError);
        assert_eq!(classify(503, ""), UpstreamErrorKind::ServerError);
        assert_eq!(classify(404, ""), UpstreamErrorKind::ClientError);
    }

    #[test]
    fn length_error_wins_over_generic_client_error() {
        let body = r#"{"message":"CONTENT_LENGTH_EXCEEDS_THRESHOLD"}"#;
        assert_eq!(classify(400, body), UpstreamErrorKind::LengthExceeded);
        assert_eq!(classify(400, "Input is too long"), UpstreamErrorKind::LengthExceeded);
        assert_eq!(classify(400, "bad field"), UpstreamErrorKind::ClientError);
    }

    #[test]
    fn retry_delay_extraction() {
        assert_eq!(parse_retry_delay_secs("Retry after 30 seconds"), Some(30));
        assert_eq!(parse_retry_delay_secs("try again in 5s"), Some(5));
        assert_eq!(parse_retry_delay_secs("no hint here"), None);
    }
}
