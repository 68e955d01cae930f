//! Source registry implementation
//!
//! Tracks every live network base so sources with the same listen set share
//! one set of sockets, and keeps the receive buffers of all open sockets
//! sized from one shared budget.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use parking_lot::Mutex;

use super::config::RegistryConfig;
use crate::error::{Error, Result};
use crate::source::{BaseKind, ListenSpec, Source, SourceBase, SourceOptions, SourceShared};

struct RegistryInner {
    /// Live network bases
    bases: Vec<Arc<SourceBase>>,

    /// Sockets bound across all bases
    open_sockets: usize,
}

impl RegistryInner {
    /// Find the base listening on exactly `listen`
    ///
    /// A base sharing only some of the addresses is a conflict.
    fn find(&self, listen: &[SocketAddr]) -> Result<Option<Arc<SourceBase>>> {
        for base in &self.bases {
            let BaseKind::Network { listen: existing } = base.kind() else {
                continue;
            };
            if existing.as_slice() == listen {
                return Ok(Some(Arc::clone(base)));
            }
            if let Some(shared) = listen.iter().find(|addr| existing.contains(addr)) {
                return Err(Error::ConfigConflict(format!(
                    "{} is already part of listen set {}; sources on one address \
                     must use the same listen set",
                    shared,
                    base.name()
                )));
            }
        }
        Ok(None)
    }
}

/// Owner of every shared network base
///
/// Thread-safe via `Mutex`. Create one per application and hand it to
/// [`Source::create`] by `Arc`.
pub struct SourceRegistry {
    inner: Mutex<RegistryInner>,

    /// Configuration
    config: RegistryConfig,
}

impl SourceRegistry {
    /// Create a new source registry with default configuration
    pub fn new() -> Self {
        Self::with_config(RegistryConfig::default())
    }

    /// Create a new source registry with custom configuration
    pub fn with_config(config: RegistryConfig) -> Self {
        Self {
            inner: Mutex::new(RegistryInner {
                bases: Vec::new(),
                open_sockets: 0,
            }),
            config,
        }
    }

    /// Create a registry configured from the environment
    pub fn from_env() -> Self {
        Self::with_config(RegistryConfig::from_env())
    }

    /// Get the registry configuration
    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Shorthand for [`Source::create`]
    pub fn create_source(
        self: &Arc<Self>,
        spec: &ListenSpec,
        options: &SourceOptions,
    ) -> Result<Source> {
        Source::create(self, spec, options)
    }

    /// Number of live network bases
    pub fn base_count(&self) -> usize {
        self.inner.lock().bases.len()
    }

    /// Sockets bound across all network bases
    pub fn open_sockets(&self) -> usize {
        self.inner.lock().open_sockets
    }

    /// Attach a network source, binding a new base if no base listens on
    /// `listen`
    pub(crate) fn create_network(
        self: &Arc<Self>,
        listen: &[SocketAddr],
        accept_from: &[IpAddr],
        options: &SourceOptions,
    ) -> Result<Source> {
        let mut listen = listen.to_vec();
        listen.sort();
        listen.dedup();

        let mut inner = self.inner.lock();

        if let Some(base) = inner.find(&listen)? {
            if base.item_size() != options.item_size || base.item_count() != options.item_count {
                return Err(Error::ConfigConflict(format!(
                    "{} is in use with item size {} and count {} (requested {} and {})",
                    base.name(),
                    base.item_size(),
                    base.item_count(),
                    options.item_size,
                    options.item_count
                )));
            }
            return Source::attach(base, accept_from.to_vec(), options, Some(Arc::clone(self)));
        }

        let base = SourceBase::bind_network(
            &listen,
            options.item_size,
            options.item_count,
            self.config.poll_timeout,
        )?;
        let source = Source::attach(
            Arc::clone(&base),
            accept_from.to_vec(),
            options,
            Some(Arc::clone(self)),
        )
        .inspect_err(|_| base.shutdown())?;

        inner.open_sockets += base.bound();
        inner.bases.push(Arc::clone(&base));

        tracing::info!(
            base = %base.name(),
            port = base.port(),
            sockets = base.bound(),
            bases = inner.bases.len(),
            "Base registered"
        );

        self.rebalance(&inner);
        Ok(source)
    }

    /// Detach a source from a network base, tearing the base down if it
    /// has no sources left
    pub(crate) fn release(&self, base: &Arc<SourceBase>, source: &Arc<SourceShared>) {
        let mut inner = self.inner.lock();

        if base.detach(source) > 0 {
            return;
        }

        base.shutdown();
        inner.bases.retain(|b| !Arc::ptr_eq(b, base));
        inner.open_sockets = inner.open_sockets.saturating_sub(base.bound());

        tracing::info!(
            base = %base.name(),
            bases = inner.bases.len(),
            "Base removed"
        );

        self.rebalance(&inner);
    }

    /// Size every open socket's receive buffer from the shared budget
    fn rebalance(&self, inner: &RegistryInner) {
        if inner.open_sockets == 0 {
            return;
        }
        let size = self.config.socket_buffer_size(inner.open_sockets);

        tracing::debug!(
            open_sockets = inner.open_sockets,
            size = size,
            "Rebalancing socket buffers"
        );

        for base in &inner.bases {
            base.resize_socket_buffers(size);
        }
    }
}

impl Default for SourceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SourceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("SourceRegistry")
            .field("bases", &inner.bases.len())
            .field("open_sockets", &inner.open_sockets)
            .field("config", &self.config)
            .finish()
    }
}
