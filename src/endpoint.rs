//! Identity and address value types shared across the crate.

use std::fmt;

use serde::{Deserialize, Serialize};
use snafu::{OptionExt, ResultExt, Snafu};
use url::Url;

pub const LOOPBACK_HOST: &str = "127.0.0.1";

#[derive(Debug, Snafu, PartialEq, Eq)]
pub enum ParseError {
    #[snafu(display("Endpoint {:?} has no port.", input))]
    MissingPort { input: String },
    #[snafu(display("Endpoint {:?} has an invalid port: {}.", input, source))]
    InvalidPort {
        input: String,
        source: std::num::ParseIntError,
    },
    #[snafu(display("Endpoint {:?} has an empty host.", input))]
    EmptyHost { input: String },
    #[snafu(display("Invalid URL {:?}: {}.", input, source))]
    InvalidUrl {
        input: String,
        source: url::ParseError,
    },
}

/// Namespace and name of a managed resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceId {
    pub namespace: String,
    pub name: String,
}

impl ResourceId {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    pub fn key(&self, port: u16) -> CacheKey {
        CacheKey {
            resource: self.clone(),
            port,
        }
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Identifies one cached resolution: the resource and its internal port.
///
/// Never derived from the resolved address, so a re-resolution after
/// invalidation lands on the same key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey {
    pub resource: ResourceId,
    pub port: u16,
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.resource, self.port)
    }
}

/// A host and port reachable from the test process.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExternalEndpoint {
    host: String,
    port: u16,
}

impl ExternalEndpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn localhost(port: u16) -> Self {
        Self::new(LOOPBACK_HOST, port)
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub const fn port(&self) -> u16 {
        self.port
    }

    /// Parses `host:port`, accepting `[v6]:port` for IPv6 literals.
    pub fn parse(input: &str) -> Result<Self, ParseError> {
        let (host, port) = input
            .rsplit_once(':')
            .context(MissingPortSnafu { input })?;
        let host = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host);
        if host.is_empty() {
            return EmptyHostSnafu { input }.fail();
        }
        let port = port.parse::<u16>().context(InvalidPortSnafu { input })?;
        Ok(Self::new(host, port))
    }

    /// Extracts host and port from an `http(s)://` URL, using the scheme's
    /// default port when none is given.
    pub fn from_url(input: &str) -> Result<Self, ParseError> {
        let url = Url::parse(input).context(InvalidUrlSnafu { input })?;
        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .context(EmptyHostSnafu { input })?;
        let host = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host);
        let port = url
            .port_or_known_default()
            .context(MissingPortSnafu { input })?;
        Ok(Self::new(host, port))
    }

    pub fn to_url(&self, scheme: &str) -> String {
        format!("{}://{}", scheme, self)
    }
}

impl fmt::Display for ExternalEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&join_host_port(&self.host, self.port))
    }
}

pub fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') {
        // If IPv6 address is used, use a special notation.
        return format!("[{}]:{}", host, port);
    }
    // Use traditional notation for domain names and IPv4 addresses.
    format!("{}:{}", host, port)
}
