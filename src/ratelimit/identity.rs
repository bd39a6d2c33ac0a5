//! Client identification strategies.

use async_trait::async_trait;
use std::net::IpAddr;

/// Header consulted before the peer address.
pub const FORWARDED_FOR: &str = "x-forwarded-for";

/// Identifier used when a request carries neither a forwarded-for header nor a peer address.
pub const ANONYMOUS: &str = "anonymous";

/// The parts of an inbound request the default identifier needs.
pub trait RequestParts {
    /// Look up a header value by case-insensitive name.
    fn header(&self, name: &str) -> Option<&str>;

    /// Network address of the connected peer.
    fn client_addr(&self) -> Option<IpAddr>;
}

/// Minimal request description for hosts without their own request type.
#[derive(Debug, Clone, Default)]
pub struct RequestMeta {
    pub client_addr: Option<IpAddr>,
    pub headers: Vec<(String, String)>,
}

impl RequestMeta {
    pub fn new(client_addr: Option<IpAddr>) -> Self {
        Self {
            client_addr,
            headers: Vec::new(),
        }
    }

    /// Add a header.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

impl RequestParts for RequestMeta {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    fn client_addr(&self) -> Option<IpAddr> {
        self.client_addr
    }
}

/// Resolves the quota identity of a request.
///
/// Implementations must return the same string for the same logical client
/// and must not fail for a well-formed request.
#[async_trait]
pub trait Identifier<R: Sync>: Send + Sync {
    async fn identify(&self, request: &R) -> String;
}

#[async_trait]
impl<R, F> Identifier<R> for F
where
    R: Sync,
    F: Fn(&R) -> String + Send + Sync,
{
    async fn identify(&self, request: &R) -> String {
        self(request)
    }
}

/// First `X-Forwarded-For` entry, else the peer address, else [`ANONYMOUS`].
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultIdentifier;

impl DefaultIdentifier {
    pub fn resolve<R: RequestParts>(request: &R) -> String {
        if let Some(first) = request
            .header(FORWARDED_FOR)
            .and_then(|value| value.split(',').next())
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
        {
            return first.to_string();
        }
        request
            .client_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|| ANONYMOUS.to_string())
    }
}

#[async_trait]
impl<R> Identifier<R> for DefaultIdentifier
where
    R: RequestParts + Sync,
{
    async fn identify(&self, request: &R) -> String {
        Self::resolve(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn peer() -> Option<IpAddr> {
        Some(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 7)))
    }

    #[tokio::test]
    async fn test_uses_peer_address() {
        let request = RequestMeta::new(peer());
        assert_eq!(DefaultIdentifier.identify(&request).await, "10.0.0.7");
    }

    #[tokio::test]
    async fn test_prefers_first_forwarded_entry() {
        let request = RequestMeta::new(peer())
            .with_header("X-Forwarded-For", "203.0.113.9, 10.0.0.1, 10.0.0.2");
        assert_eq!(DefaultIdentifier.identify(&request).await, "203.0.113.9");
    }

    #[tokio::test]
    async fn test_header_lookup_is_case_insensitive() {
        let request = RequestMeta::new(None).with_header("x-FORWARDED-for", "198.51.100.4");
        assert_eq!(DefaultIdentifier.identify(&request).await, "198.51.100.4");
    }

    #[tokio::test]
    async fn test_empty_forwarded_header_falls_back() {
        let request = RequestMeta::new(peer()).with_header("X-Forwarded-For", " ");
        assert_eq!(DefaultIdentifier.identify(&request).await, "10.0.0.7");
    }

    #[tokio::test]
    async fn test_anonymous_without_address() {
        let request = RequestMeta::default();
        assert_eq!(DefaultIdentifier.identify(&request).await, ANONYMOUS);
    }

    #[tokio::test]
    async fn test_closure_identifier() {
        let by_api_key = |request: &RequestMeta| {
            request
                .header("x-api-key")
                .unwrap_or(ANONYMOUS)
                .to_string()
        };
        let request = RequestMeta::new(peer()).with_header("X-Api-Key", "team-a");
        assert_eq!(by_api_key.identify(&request).await, "team-a");
    }
}
