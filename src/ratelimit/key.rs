//! Counter key generation.

use super::identity::ClientId;

/// A key that uniquely identifies one rate limit counter.
///
/// The key is composed of the endpoint path and the resolved client.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RateLimitKey {
    /// The endpoint path the policy was resolved for
    pub endpoint: String,
    /// The resolved caller
    pub client: ClientId,
}

impl RateLimitKey {
    /// Create a new key from an endpoint path and a client.
    pub fn new(endpoint: &str, client: &ClientId) -> Self {
        Self {
            endpoint: endpoint.to_string(),
            client: client.clone(),
        }
    }

    /// Render the key for a store, with a namespace in front.
    pub fn to_store_key(&self, prefix: &str) -> String {
        if prefix.is_empty() {
            self.to_string()
        } else {
            format!("{}:{}", prefix, self)
        }
    }
}

impl std::fmt::Display for RateLimitKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ratelimit:")?;
        write_endpoint(f, &self.endpoint)?;
        write!(f, ":{}", self.client)
    }
}

/// Writes the endpoint with `%` and `:` percent-encoded, so the first bare
/// `:` after it always separates it from the client. Client ids keep their
/// colons (IPv6).
fn write_endpoint(f: &mut std::fmt::Formatter<'_>, endpoint: &str) -> std::fmt::Result {
    for c in endpoint.chars() {
        match c {
            '%' => f.write_str("%25")?,
            ':' => f.write_str("%3A")?,
            c => write!(f, "{}", c)?,
        }
    }
    Ok(())
}
