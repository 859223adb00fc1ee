//! Bearer-token authentication seam.
//!
//! Every authenticated egress path attaches a token obtained through
//! [`AuthProvider`]: the polling transport and the worker platform send
//! it as an HTTP bearer header, and the socket transport presents it in
//! its credential preamble frame. The trait keeps token acquisition out
//! of the transport code: production wires in a real identity
//! integration, tests wire in [`StaticTokenProvider`].
//!
//! Token refresh is the provider's concern. A provider that cannot
//! produce a token returns [`Error::Auth`](crate::Error::Auth), which
//! callers surface instead of retrying indefinitely.

use async_trait::async_trait;

use crate::error::Result;

/// Supplies bearer tokens for outbound requests.
#[async_trait]
pub trait AuthProvider: Send + Sync {
    /// Returns a token valid for the next request.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Auth`](crate::Error::Auth) when no valid token can
    /// be produced.
    async fn bearer_token(&self) -> Result<String>;
}

/// Provider backed by a fixed token.
///
/// Suitable for service-to-service deployments with long-lived tokens and
/// for tests.
#[derive(Clone)]
pub struct StaticTokenProvider {
    token: String,
}

impl std::fmt::Debug for StaticTokenProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticTokenProvider")
            .field("token", &"[REDACTED]")
            .finish()
    }
}

impl StaticTokenProvider {
    /// Creates a provider that always returns `token`.
    #[must_use]
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

#[async_trait]
impl AuthProvider for StaticTokenProvider {
    async fn bearer_token(&self) -> Result<String> {
        Ok(self.token.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn static_provider_returns_its_token() {
        let provider = StaticTokenProvider::new("secret-token");
        let token = provider.bearer_token().await.unwrap();
        assert_eq!(token, "secret-token");
    }

    #[test]
    fn debug_output_redacts_the_token() {
        let provider = StaticTokenProvider::new("super-secret-token");
        let rendered = format!("{provider:?}");
        assert!(!rendered.contains("super-secret-token"));
        assert!(rendered.contains("[REDACTED]"));
    }
}
