//! Caller identity for the run API.
//!
//! Authentication itself happens upstream (a gateway or session layer). The
//! HTTP surface only needs a verified user id per request, supplied through
//! an [`IdentityProvider`].

use axum::http::HeaderMap;

use crate::protocol::UserId;

/// Header carrying the verified user id by default.
pub const USER_ID_HEADER: &str = "x-user-id";

/// Resolves the verified caller of a request.
pub trait IdentityProvider: Send + Sync + 'static {
    /// The caller's user id, or `None` if the request carries no verified
    /// identity.
    fn identify(&self, headers: &HeaderMap) -> Option<UserId>;
}

/// Trusts a numeric user id header set by an authenticating proxy.
///
/// Only deploy this behind a proxy that strips the header from client
/// requests.
#[derive(Debug, Clone)]
pub struct TrustedHeaderIdentity {
    header: String,
}

impl TrustedHeaderIdentity {
    pub fn new(header: impl Into<String>) -> Self {
        Self {
            header: header.into(),
        }
    }
}

impl Default for TrustedHeaderIdentity {
    fn default() -> Self {
        Self::new(USER_ID_HEADER)
    }
}

impl IdentityProvider for TrustedHeaderIdentity {
    fn identify(&self, headers: &HeaderMap) -> Option<UserId> {
        headers
            .get(self.header.as_str())?
            .to_str()
            .ok()?
            .trim()
            .parse()
            .ok()
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn reads_numeric_header() {
        let mut headers = HeaderMap::new();
        headers.insert(USER_ID_HEADER, HeaderValue::from_static(" 42 "));
        assert_eq!(TrustedHeaderIdentity::default().identify(&headers), Some(42));
    }

    #[test]
    fn missing_or_malformed_is_anonymous() {
        let identity = TrustedHeaderIdentity::default();
        assert_eq!(identity.identify(&HeaderMap::new()), None);

        let mut headers = HeaderMap::new();
        headers.insert(USER_ID_HEADER, HeaderValue::from_static("alice"));
        assert_eq!(identity.identify(&headers), None);

        headers.insert(USER_ID_HEADER, HeaderValue::from_static("-1"));
        assert_eq!(identity.identify(&headers), None);
    }

    #[test]
    fn custom_header_name() {
        let identity = TrustedHeaderIdentity::new("x-forwarded-user");
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-user", HeaderValue::from_static("7"));
        headers.insert(USER_ID_HEADER, HeaderValue::from_static("8"));
        assert_eq!(identity.identify(&headers), Some(7));
    }
}
