//! Server addresses and hostname resolution

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{DriverError, Result};

pub const DEFAULT_PORT: u16 = 27017;

/// A `host:port` pair naming one server
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServerAddress {
    host: String,
    port: u16,
}

impl ServerAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into().to_lowercase(),
            port,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Parse `host`, `host:port` or `[v6]:port`
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() {
            return Err(DriverError::InvalidConfiguration("empty server address".into()));
        }

        let (host, port) = if let Some(rest) = s.strip_prefix('[') {
            let (host, tail) = rest.split_once(']').ok_or_else(|| {
                DriverError::InvalidConfiguration(format!("unterminated IPv6 address: {}", s))
            })?;
            match tail.strip_prefix(':') {
                Some(port) => (host, Some(port)),
                None if tail.is_empty() => (host, None),
                None => {
                    return Err(DriverError::InvalidConfiguration(format!(
                        "invalid server address: {}",
                        s
                    )))
                }
            }
        } else {
            match s.rsplit_once(':') {
                Some((host, port)) => (host, Some(port)),
                None => (s, None),
            }
        };

        let port = match port {
            Some(p) => p.parse::<u16>().map_err(|_| {
                DriverError::InvalidConfiguration(format!("invalid port in address: {}", s))
            })?,
            None => DEFAULT_PORT,
        };
        if host.is_empty() {
            return Err(DriverError::InvalidConfiguration(format!("missing host in address: {}", s)));
        }
        Ok(Self::new(host, port))
    }
}

impl FromStr for ServerAddress {
    type Err = DriverError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for ServerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl From<SocketAddr> for ServerAddress {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip().to_string(), addr.port())
    }
}

/// Turns a configured address into connectable endpoints
#[async_trait]
pub trait AddressResolver: Send + Sync {
    async fn resolve(&self, address: &ServerAddress) -> Result<Vec<SocketAddr>>;
}

/// Resolver backed by the runtime's DNS lookup
#[derive(Debug, Default, Clone, Copy)]
pub struct DnsResolver;

#[async_trait]
impl AddressResolver for DnsResolver {
    async fn resolve(&self, address: &ServerAddress) -> Result<Vec<SocketAddr>> {
        let endpoints: Vec<SocketAddr> = tokio::net::lookup_host((address.host(), address.port()))
            .await
            .map_err(|e| DriverError::io(address, 0, e))?
            .collect();
        if endpoints.is_empty() {
            return Err(DriverError::io(
                address,
                0,
                std::io::Error::new(std::io::ErrorKind::NotFound, "hostname resolved to no addresses"),
            ));
        }
        Ok(endpoints)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_forms() {
        assert_eq!(ServerAddress::parse("db1").unwrap(), ServerAddress::new("db1", 27017));
        assert_eq!(ServerAddress::parse("DB1:27018").unwrap(), ServerAddress::new("db1", 27018));
        let v6 = ServerAddress::parse("[::1]:27019").unwrap();
        assert_eq!(v6.host(), "::1");
        assert_eq!(v6.port(), 27019);
        assert_eq!(v6.to_string(), "[::1]:27019");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(ServerAddress::parse("").is_err());
        assert!(ServerAddress::parse("db1:notaport").is_err());
        assert!(ServerAddress::parse(":27017").is_err());
        assert!(ServerAddress::parse("[::1").is_err());
    }

    #[tokio::test]
    async fn test_dns_resolver_localhost() {
        let endpoints = DnsResolver
            .resolve(&ServerAddress::new("127.0.0.1", 27017))
            .await
            .unwrap();
        assert_eq!(endpoints[0].port(), 27017);
        assert!(endpoints[0].ip().is_loopback());
    }
}
