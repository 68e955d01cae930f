//! Listen specifications and per-source options

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use crate::error::{Error, Result};

/// Predicate applied to every received record; `true` discards it
///
/// The slice covers exactly the received bytes, so its length is the
/// datagram length.
pub type RejectFn = Arc<dyn Fn(&[u8]) -> bool + Send + Sync>;

/// Where a source gets its records from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenSpec {
    /// One or more local addresses sharing a single port
    Network {
        /// Addresses to bind
        listen: Vec<SocketAddr>,
        /// Peers this source accepts; empty accepts anyone
        accept_from: Vec<IpAddr>,
    },
    /// A datagram socket at a filesystem path
    UnixSocket { path: PathBuf },
    /// A file of fixed-size records, optionally gzip-compressed
    File { path: PathBuf },
}

impl ListenSpec {
    /// Network spec accepting datagrams from any peer
    pub fn network<I>(listen: I) -> Result<Self>
    where
        I: IntoIterator<Item = SocketAddr>,
    {
        Self::network_from(listen, std::iter::empty())
    }

    /// Network spec accepting datagrams only from `accept_from`
    pub fn network_from<I, P>(listen: I, accept_from: P) -> Result<Self>
    where
        I: IntoIterator<Item = SocketAddr>,
        P: IntoIterator<Item = IpAddr>,
    {
        let listen: Vec<SocketAddr> = listen.into_iter().collect();
        if listen.is_empty() {
            return Err(Error::InvalidSpec("listen set is empty".into()));
        }
        let port = listen[0].port();
        if let Some(other) = listen.iter().find(|a| a.port() != port) {
            return Err(Error::InvalidSpec(format!(
                "all listen addresses must share one port ({} vs {})",
                port,
                other.port()
            )));
        }

        Ok(ListenSpec::Network {
            listen,
            accept_from: accept_from.into_iter().collect(),
        })
    }

    pub fn unix_socket(path: impl Into<PathBuf>) -> Self {
        ListenSpec::UnixSocket { path: path.into() }
    }

    pub fn file(path: impl Into<PathBuf>) -> Self {
        ListenSpec::File { path: path.into() }
    }
}

impl fmt::Display for ListenSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListenSpec::Network { listen, .. } => {
                let names: Vec<String> = listen.iter().map(|a| a.to_string()).collect();
                write!(f, "{}", names.join(","))
            }
            ListenSpec::UnixSocket { path } | ListenSpec::File { path } => {
                write!(f, "{}", path.display())
            }
        }
    }
}

/// Per-source construction parameters
#[derive(Clone)]
pub struct SourceOptions {
    /// Maximum bytes per record
    pub item_size: usize,

    /// Consumer-side buffer depth
    pub item_count: usize,

    /// Optional predicate discarding unwanted records
    pub reject: Option<RejectFn>,
}

impl SourceOptions {
    pub fn new(item_size: usize, item_count: usize) -> Self {
        Self {
            item_size,
            item_count,
            reject: None,
        }
    }

    /// Discard records for which `reject` returns true
    pub fn reject<F>(mut self, reject: F) -> Self
    where
        F: Fn(&[u8]) -> bool + Send + Sync + 'static,
    {
        self.reject = Some(Arc::new(reject));
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.item_size == 0 {
            return Err(Error::InvalidSpec("item size must be non-zero".into()));
        }
        if self.item_count == 0 {
            return Err(Error::InvalidSpec("item count must be non-zero".into()));
        }
        Ok(())
    }
}

impl fmt::Debug for SourceOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceOptions")
            .field("item_size", &self.item_size)
            .field("item_count", &self.item_count)
            .field("reject", &self.reject.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_network_spec() {
        let a: SocketAddr = "127.0.0.1:9901".parse().unwrap();
        let b: SocketAddr = "[::1]:9901".parse().unwrap();
        let peer: IpAddr = "10.0.0.1".parse().unwrap();

        let spec = ListenSpec::network_from([a, b], [peer]).unwrap();
        match &spec {
            ListenSpec::Network {
                listen,
                accept_from,
            } => {
                assert_eq!(listen, &vec![a, b]);
                assert_eq!(accept_from, &vec![peer]);
            }
            _ => panic!("expected network spec"),
        }
        assert_eq!(spec.to_string(), "127.0.0.1:9901,[::1]:9901");
    }

    #[test]
    fn test_network_spec_rejects_empty() {
        assert!(matches!(
            ListenSpec::network(Vec::new()),
            Err(Error::InvalidSpec(_))
        ));
    }

    #[test]
    fn test_network_spec_rejects_mixed_ports() {
        let a: SocketAddr = "127.0.0.1:9901".parse().unwrap();
        let b: SocketAddr = "127.0.0.2:9902".parse().unwrap();
        assert!(matches!(
            ListenSpec::network([a, b]),
            Err(Error::InvalidSpec(_))
        ));
    }

    #[test]
    fn test_options() {
        let options = SourceOptions::new(1500, 64).reject(|data| data.len() < 4);
        assert_eq!(options.item_size, 1500);
        assert_eq!(options.item_count, 64);
        let reject = options.reject.as_ref().unwrap();
        assert!(reject(&[1, 2]));
        assert!(!reject(&[1, 2, 3, 4]));
        assert!(options.validate().is_ok());

        assert!(SourceOptions::new(0, 1).validate().is_err());
        assert!(SourceOptions::new(1, 0).validate().is_err());
    }
}
