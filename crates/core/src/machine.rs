//! Machine identity: compact ids and the resolvable locations they stand for.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Compact integer handle for a machine in the cluster.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MachineId(u32);

impl MachineId {
    pub fn new(id: u32) -> Self {
        Self(id)
    }

    pub fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for MachineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Network location of a machine (`host[:port]`).
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MachineLocation {
    host: String,
    port: Option<u16>,
}

impl MachineLocation {
    pub fn new(host: impl Into<String>, port: Option<u16>) -> crate::Result<Self> {
        let host = host.into();
        if host.is_empty() || host.contains(['/', '\\', ' ']) {
            return Err(crate::Error::InvalidMachineLocation(host));
        }
        Ok(Self { host, port })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> Option<u16> {
        self.port
    }

    /// Port to connect to, falling back to `default_port` when none was given.
    pub fn port_or(&self, default_port: u16) -> u16 {
        self.port.unwrap_or(default_port)
    }
}

impl fmt::Display for MachineLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.port {
            Some(port) => write!(f, "{}:{}", self.host, port),
            None => f.write_str(&self.host),
        }
    }
}

impl FromStr for MachineLocation {
    type Err = crate::Error;

    /// Accepts `host`, `host:port`, or a URL-ish `scheme://host:port/`.
    fn from_str(s: &str) -> crate::Result<Self> {
        let trimmed = s.trim();
        let without_scheme = trimmed
            .split_once("://")
            .map(|(_, rest)| rest)
            .unwrap_or(trimmed);
        let authority = without_scheme.trim_end_matches('/');
        match authority.rsplit_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse::<u16>()
                    .map_err(|_| crate::Error::InvalidMachineLocation(s.to_string()))?;
                Self::new(host, Some(port))
            }
            None => Self::new(authority, None),
        }
    }
}

impl TryFrom<String> for MachineLocation {
    type Error = crate::Error;

    fn try_from(s: String) -> crate::Result<Self> {
        s.parse()
    }
}

impl From<MachineLocation> for String {
    fn from(m: MachineLocation) -> Self {
        m.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_host_and_port() {
        let loc: MachineLocation = "build-07:7089".parse().unwrap();
        assert_eq!(loc.host(), "build-07");
        assert_eq!(loc.port(), Some(7089));
        assert_eq!(loc.to_string(), "build-07:7089");
    }

    #[test]
    fn test_parse_url_form() {
        let loc: MachineLocation = "grpc://10.0.0.4:7090/".parse().unwrap();
        assert_eq!(loc.host(), "10.0.0.4");
        assert_eq!(loc.port_or(1), 7090);
    }

    #[test]
    fn test_parse_bare_host_uses_default_port() {
        let loc: MachineLocation = "hostA".parse().unwrap();
        assert_eq!(loc.port(), None);
        assert_eq!(loc.port_or(7089), 7089);
    }

    #[test]
    fn test_rejects_garbage() {
        assert!("".parse::<MachineLocation>().is_err());
        assert!("host:notaport".parse::<MachineLocation>().is_err());
    }
}
