// This file is part of the bstore blob store.
//
// For the full copyright and license information, please view the LICENSE
// file that was distributed with this source code.

//! Service URIs: `scheme:endpoint[?query]`.
//!
//! A service names where blobs live and how to reach them. Three schemes
//! are recognised: `bio4` speaks the wire protocol over TCP, `fs` works a
//! store directory tree in place, and `cache4` fronts a `bio4` service
//! with an `fs` cache.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

/// Default peer I/O timeout in seconds.
pub const DEFAULT_TIMEOUT_SECS: u8 = 20;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ServiceError {
    #[error("no colon after scheme")]
    MissingColon,
    #[error("unknown scheme: {0:?}")]
    UnknownScheme(String),
    #[error("bio4 endpoint not host:port: {0:?}")]
    BadBio4Endpoint(String),
    #[error("cache4 endpoint not host:port:/path: {0:?}")]
    BadCache4Endpoint(String),
    #[error("fs endpoint is empty")]
    EmptyFsEndpoint,
    #[error("query arg {0:?}: {1}")]
    BadQueryArg(String, String),
    #[error("unknown query arg: {0:?}")]
    UnknownQueryArg(String),
}

/// Recognised query options.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryArgs {
    /// `tmo=<1..255>`: peer read/write timeout in seconds.
    pub timeout: Option<u8>,
    /// `trust=fs`: skip end-to-end digest verification where the
    /// filesystem is considered authoritative.
    pub trust_fs: bool,
}

impl QueryArgs {
    fn parse(query: &str) -> Result<QueryArgs, ServiceError> {
        let mut args = QueryArgs::default();
        for arg in query.split('&') {
            let (name, value) = arg.split_once('=').unwrap_or((arg, ""));
            match name {
                "tmo" => {
                    let secs: u8 = value.parse().map_err(|_| {
                        ServiceError::BadQueryArg(arg.into(), "not 1..=255 seconds".into())
                    })?;
                    if secs == 0 {
                        return Err(ServiceError::BadQueryArg(
                            arg.into(),
                            "not 1..=255 seconds".into(),
                        ));
                    }
                    args.timeout = Some(secs);
                }
                "trust" => {
                    if value != "fs" {
                        return Err(ServiceError::BadQueryArg(
                            arg.into(),
                            "only trust=fs is recognised".into(),
                        ));
                    }
                    args.trust_fs = true;
                }
                _ => return Err(ServiceError::UnknownQueryArg(arg.into())),
            }
        }
        Ok(args)
    }

    /// The effective peer timeout.
    pub fn timeout_duration(&self) -> Duration {
        Duration::from_secs(u64::from(self.timeout.unwrap_or(DEFAULT_TIMEOUT_SECS)))
    }
}

/// Where a service lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// TCP `host:port`.
    Bio4 { host: String, port: u16 },
    /// A store root directory.
    Fs { root: String },
    /// TCP origin plus a local cache root.
    Cache4 {
        host: String,
        port: u16,
        root: String,
    },
}

/// A parsed service URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceUri {
    pub endpoint: Endpoint,
    pub query: QueryArgs,
}

impl ServiceUri {
    pub fn scheme(&self) -> &'static str {
        match self.endpoint {
            Endpoint::Bio4 { .. } => "bio4",
            Endpoint::Fs { .. } => "fs",
            Endpoint::Cache4 { .. } => "cache4",
        }
    }
}

fn parse_host_port(s: &str) -> Option<(String, u16)> {
    let (host, port) = s.rsplit_once(':')?;
    if host.is_empty() {
        return None;
    }
    let port: u16 = port.parse().ok()?;
    Some((host.into(), port))
}

impl FromStr for ServiceUri {
    type Err = ServiceError;

    fn from_str(s: &str) -> Result<ServiceUri, ServiceError> {
        let (scheme, rest) = s.split_once(':').ok_or(ServiceError::MissingColon)?;
        let (endpoint, query) = match rest.split_once('?') {
            Some((endpoint, query)) => (endpoint, QueryArgs::parse(query)?),
            None => (rest, QueryArgs::default()),
        };

        let endpoint = match scheme {
            "bio4" => {
                let (host, port) = parse_host_port(endpoint)
                    .ok_or_else(|| ServiceError::BadBio4Endpoint(endpoint.into()))?;
                Endpoint::Bio4 { host, port }
            }
            "fs" => {
                if endpoint.is_empty() {
                    return Err(ServiceError::EmptyFsEndpoint);
                }
                Endpoint::Fs {
                    root: endpoint.into(),
                }
            }
            "cache4" => {
                // host:port:/path — the path may itself contain colons
                let mut parts = endpoint.splitn(3, ':');
                match (parts.next(), parts.next(), parts.next()) {
                    (Some(host), Some(port), Some(root))
                        if !host.is_empty() && !root.is_empty() =>
                    {
                        let port: u16 = port.parse().map_err(|_| {
                            ServiceError::BadCache4Endpoint(endpoint.into())
                        })?;
                        Endpoint::Cache4 {
                            host: host.into(),
                            port,
                            root: root.into(),
                        }
                    }
                    _ => return Err(ServiceError::BadCache4Endpoint(endpoint.into())),
                }
            }
            _ => return Err(ServiceError::UnknownScheme(scheme.into())),
        };

        Ok(ServiceUri { endpoint, query })
    }
}

impl fmt::Display for ServiceUri {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.endpoint {
            Endpoint::Bio4 { host, port } => write!(f, "bio4:{host}:{port}"),
            Endpoint::Fs { root } => write!(f, "fs:{root}"),
            Endpoint::Cache4 { host, port, root } => {
                write!(f, "cache4:{host}:{port}:{root}")
            }
        }
    }
}
