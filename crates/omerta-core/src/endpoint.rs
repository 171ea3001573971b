//! Endpoint parsing and validation
//!
//! Endpoints travel the mesh as `"host:port"` strings (IPv6 hosts
//! bracketed). Validation policy decides which observed endpoints are worth
//! recording: a node on the open Internet should not pollute its endpoint
//! lists with other peers' loopback or RFC 1918 addresses.

use std::net::{IpAddr, SocketAddr};

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};

/// Which observed endpoints to accept into endpoint lists
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointValidationMode {
    /// Reject loopback and private/link-local addresses
    Strict,
    /// Reject only loopback
    Permissive,
    /// Reject only malformed endpoints and port 0
    AllowAll,
}

/// Parse an endpoint string into a socket address
///
/// Rejects anything that is not `ip:port` (IPv6 bracketed) and port 0.
pub fn parse_endpoint(s: &str) -> CoreResult<SocketAddr> {
    let addr: SocketAddr = s
        .parse()
        .map_err(|_| CoreError::MalformedEndpoint(s.to_string()))?;
    if addr.port() == 0 {
        return Err(CoreError::InvalidPort(s.to_string()));
    }
    Ok(addr)
}

/// Format a socket address as an endpoint string (brackets IPv6)
pub fn format_endpoint(addr: &SocketAddr) -> String {
    addr.to_string()
}

/// Split an endpoint into host and port without requiring the host to be
/// an IP literal. Used for bootstrap endpoints, which may be hostnames.
pub fn split_endpoint(s: &str) -> CoreResult<(String, u16)> {
    let (host, port) = if let Some(rest) = s.strip_prefix('[') {
        // Bracketed IPv6: [host]:port
        let end = rest
            .find(']')
            .ok_or_else(|| CoreError::MalformedEndpoint(s.to_string()))?;
        let host = &rest[..end];
        let port = rest[end + 1..]
            .strip_prefix(':')
            .ok_or_else(|| CoreError::MalformedEndpoint(s.to_string()))?;
        (host.to_string(), port)
    } else {
        let idx = s
            .rfind(':')
            .ok_or_else(|| CoreError::MalformedEndpoint(s.to_string()))?;
        (s[..idx].to_string(), &s[idx + 1..])
    };

    let port: u16 = port
        .parse()
        .map_err(|_| CoreError::MalformedEndpoint(s.to_string()))?;
    if port == 0 {
        return Err(CoreError::InvalidPort(s.to_string()));
    }
    if host.is_empty() {
        return Err(CoreError::MalformedEndpoint(s.to_string()));
    }
    Ok((host, port))
}

/// Validate an observed endpoint against a policy
pub fn validate_endpoint(mode: EndpointValidationMode, s: &str) -> CoreResult<()> {
    let addr = parse_endpoint(s)?;
    let ip = addr.ip();

    match mode {
        EndpointValidationMode::AllowAll => Ok(()),
        EndpointValidationMode::Permissive => {
            if ip.is_loopback() {
                Err(CoreError::EndpointRejected(s.to_string()))
            } else {
                Ok(())
            }
        }
        EndpointValidationMode::Strict => {
            if ip.is_loopback() || is_private(&ip) {
                Err(CoreError::EndpointRejected(s.to_string()))
            } else {
                Ok(())
            }
        }
    }
}

fn is_private(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_private() || v4.is_link_local(),
        IpAddr::V6(v6) => {
            let seg = v6.segments();
            // fc00::/7 unique local, fe80::/10 link local
            (seg[0] & 0xfe00) == 0xfc00 || (seg[0] & 0xffc0) == 0xfe80
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_endpoint() {
        assert!(parse_endpoint("192.0.2.1:4800").is_ok());
        assert!(parse_endpoint("[2001:db8::1]:4800").is_ok());
        assert!(parse_endpoint("192.0.2.1").is_err());
        assert!(parse_endpoint("not an endpoint").is_err());
        assert!(parse_endpoint("192.0.2.1:0").is_err());
    }

    #[test]
    fn test_format_endpoint_brackets_ipv6() {
        let v6: SocketAddr = "[2001:db8::1]:9".parse().unwrap();
        assert_eq!(format_endpoint(&v6), "[2001:db8::1]:9");
        let v4: SocketAddr = "192.0.2.1:9".parse().unwrap();
        assert_eq!(format_endpoint(&v4), "192.0.2.1:9");
    }

    #[test]
    fn test_split_endpoint_accepts_hostnames() {
        assert_eq!(
            split_endpoint("bootstrap.example.org:4800").unwrap(),
            ("bootstrap.example.org".to_string(), 4800)
        );
        assert_eq!(
            split_endpoint("[2001:db8::1]:4800").unwrap(),
            ("2001:db8::1".to_string(), 4800)
        );
        assert!(split_endpoint("no-port").is_err());
        assert!(split_endpoint("host:0").is_err());
        assert!(split_endpoint(":4800").is_err());
    }

    #[test]
    fn test_validation_modes() {
        use EndpointValidationMode::*;

        // Loopback: only AllowAll accepts
        assert!(validate_endpoint(Strict, "127.0.0.1:4800").is_err());
        assert!(validate_endpoint(Permissive, "127.0.0.1:4800").is_err());
        assert!(validate_endpoint(AllowAll, "127.0.0.1:4800").is_ok());

        // Private: strict rejects, permissive accepts
        assert!(validate_endpoint(Strict, "10.1.2.3:4800").is_err());
        assert!(validate_endpoint(Strict, "192.168.1.9:4800").is_err());
        assert!(validate_endpoint(Permissive, "10.1.2.3:4800").is_ok());

        // Public: everyone accepts
        assert!(validate_endpoint(Strict, "203.0.113.5:4800").is_ok());

        // Port 0 and garbage: nobody accepts
        assert!(validate_endpoint(AllowAll, "203.0.113.5:0").is_err());
        assert!(validate_endpoint(AllowAll, "garbage").is_err());
    }

    #[test]
    fn test_ipv6_private_ranges() {
        use EndpointValidationMode::Strict;

        assert!(validate_endpoint(Strict, "[fe80::1]:4800").is_err());
        assert!(validate_endpoint(Strict, "[fd12:3456::1]:4800").is_err());
        assert!(validate_endpoint(Strict, "[2001:db8::1]:4800").is_ok());
    }
}
