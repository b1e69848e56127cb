//! Client identity resolution from proxy headers.

use http::HeaderMap;

/// Header set by proxies with the chain of client addresses.
pub const FORWARDED_FOR: &str = "x-forwarded-for";
/// Header set by proxies with the single client address.
pub const REAL_IP: &str = "x-real-ip";

/// Identity used when no proxy header names the caller.
pub const UNKNOWN_CLIENT: &str = "unknown";

/// A per-caller identifier.
///
/// The value is taken from client-controlled headers and is not validated,
/// so it can be spoofed by anyone who reaches the service without a proxy
/// in front of it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientId(String);

impl ClientId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn unknown() -> Self {
        Self(UNKNOWN_CLIENT.to_string())
    }

    /// Resolve the caller from `x-forwarded-for` (first hop), then `x-real-ip`.
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let forwarded = header_str(headers, FORWARDED_FOR)
            .and_then(|value| value.split(',').next())
            .map(str::trim)
            .filter(|ip| !ip.is_empty());

        let real_ip = || {
            header_str(headers, REAL_IP)
                .map(str::trim)
                .filter(|ip| !ip.is_empty())
        };

        match forwarded.or_else(real_ip) {
            Some(ip) => Self::new(ip),
            None => Self::unknown(),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_unknown(&self) -> bool {
        self.0 == UNKNOWN_CLIENT
    }
}

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    fn headers(pairs: &[(&'static str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, HeaderValue::from_str(value).unwrap());
        }
        map
    }

    #[test]
    fn test_first_forwarded_hop_wins() {
        let map = headers(&[
            (FORWARDED_FOR, " 203.0.113.7 , 10.0.0.1, 10.0.0.2"),
            (REAL_IP, "10.0.0.2"),
        ]);
        assert_eq!(ClientId::from_headers(&map).as_str(), "203.0.113.7");
    }

    #[test]
    fn test_real_ip_when_no_forwarded_for() {
        let map = headers(&[(REAL_IP, "198.51.100.4 ")]);
        assert_eq!(ClientId::from_headers(&map).as_str(), "198.51.100.4");
    }

    #[test]
    fn test_empty_forwarded_for_falls_through() {
        let map = headers(&[(FORWARDED_FOR, " , 10.0.0.1"), (REAL_IP, "198.51.100.4")]);
        assert_eq!(ClientId::from_headers(&map).as_str(), "198.51.100.4");
    }

    #[test]
    fn test_unknown_without_headers() {
        let id = ClientId::from_headers(&HeaderMap::new());
        assert!(id.is_unknown());
        assert_eq!(id.to_string(), "unknown");
    }

    #[test]
    fn test_non_utf8_header_is_ignored() {
        let mut map = HeaderMap::new();
        map.insert(FORWARDED_FOR, HeaderValue::from_bytes(&[0xff, 0xfe]).unwrap());
        map.insert(REAL_IP, HeaderValue::from_static("192.0.2.1"));
        assert_eq!(ClientId::from_headers(&map).as_str(), "192.0.2.1");
    }

    #[test]
    fn test_no_format_validation() {
        let map = headers(&[(FORWARDED_FOR, "definitely-not-an-ip")]);
        assert_eq!(ClientId::from_headers(&map).as_str(), "definitely-not-an-ip");
    }
}
