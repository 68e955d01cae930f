//! Source bases
//!
//! A base owns the OS resources for one listen specification: a set of
//! bound UDP sockets, one UNIX datagram socket, or a replay file. Network
//! and UNIX bases run a reader thread (see [`reader`](super::reader)) that
//! routes datagrams to the sources attached to the base.
//!
//! # Locking
//!
//! `state` guards the routing table and run flags. The reader thread never
//! touches a circular buffer while holding it, and `cond` is the single
//! condition variable used for the start-up handshake, attach
//! notifications, and reader exit.

use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::error::{Error, Result};
use crate::stats::BaseStats;

use super::demux::{PeerConflict, PeerDemux, UnknownPeerLog};
use super::endpoint::{bind_udp, bind_unix, Descriptor, Endpoint};
use super::reader;
use super::replay::{Compression, Replay};
use super::spec::RejectFn;
use super::SourceShared;

/// What kind of resource a base wraps
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum BaseKind {
    Network { listen: Vec<SocketAddr> },
    UnixSocket,
    File,
}

/// Where the reader sends a datagram
pub(crate) enum Routing {
    /// No source attached
    Empty,
    /// One source accepting every peer
    Any(Arc<SourceShared>),
    /// Sources selected by peer address
    Peers(PeerDemux<SourceShared>),
}

impl Routing {
    pub(crate) fn resolve(&self, peer: Option<IpAddr>) -> Option<Arc<SourceShared>> {
        match self {
            Routing::Empty => None,
            Routing::Any(source) => Some(Arc::clone(source)),
            Routing::Peers(demux) => peer.and_then(|p| demux.lookup(p)).cloned(),
        }
    }

    /// Add `source` to the table
    ///
    /// A source accepting any peer needs the table to itself.
    fn claim(&mut self, source: &Arc<SourceShared>, base: &str) -> Result<()> {
        if let Routing::Any(_) = self {
            return Err(Error::ConfigConflict(format!(
                "{} already has a source accepting any peer",
                base
            )));
        }

        if source.accept_from.is_empty() {
            if let Routing::Peers(_) = self {
                return Err(Error::ConfigConflict(format!(
                    "{} is shared by sources with accept-from lists; \
                     a source accepting any peer cannot join",
                    base
                )));
            }
            *self = Routing::Any(Arc::clone(source));
            return Ok(());
        }

        let conflict = |PeerConflict(peer): PeerConflict| {
            Error::ConfigConflict(format!(
                "peer {} on {} is claimed by another source",
                peer, base
            ))
        };

        if let Routing::Peers(demux) = self {
            return demux
                .insert_all(&source.accept_from, source)
                .map_err(conflict);
        }

        let mut demux = PeerDemux::new();
        demux
            .insert_all(&source.accept_from, source)
            .map_err(conflict)?;
        *self = Routing::Peers(demux);
        Ok(())
    }

    fn sources(&self) -> Vec<Arc<SourceShared>> {
        let mut sources: Vec<Arc<SourceShared>> = Vec::new();
        match self {
            Routing::Empty => {}
            Routing::Any(source) => sources.push(Arc::clone(source)),
            Routing::Peers(demux) => {
                for source in demux.targets() {
                    if !sources.iter().any(|s| Arc::ptr_eq(s, source)) {
                        sources.push(Arc::clone(source));
                    }
                }
            }
        }
        sources
    }
}

pub(crate) struct BaseState {
    /// Sources attached to this base
    pub(crate) refcount: usize,
    /// Attached sources that have not been stopped
    pub(crate) active_sources: usize,
    /// Reader finished start-up (successfully or not)
    pub(crate) started: bool,
    pub(crate) running: bool,
    /// Reader should exit
    pub(crate) stop: bool,
    /// A source has attached at least once
    pub(crate) attached: bool,
    pub(crate) routing: Routing,
    pub(crate) unknown_peers: UnknownPeerLog,
}

/// Shared OS-resource owner for one listen specification
pub(crate) struct SourceBase {
    name: String,
    port: u16,
    kind: BaseKind,
    item_size: usize,
    item_count: usize,
    poll_timeout: Duration,
    bound: usize,
    pub(crate) descriptors: Vec<Descriptor>,
    replay: Option<Mutex<Replay>>,
    pub(crate) state: Mutex<BaseState>,
    pub(crate) cond: Condvar,
    thread: Mutex<Option<JoinHandle<()>>>,
    pub(crate) stats: BaseStats,
}

impl SourceBase {
    #[allow(clippy::too_many_arguments)]
    fn new(
        name: String,
        port: u16,
        kind: BaseKind,
        item_size: usize,
        item_count: usize,
        poll_timeout: Duration,
        descriptors: Vec<Descriptor>,
        replay: Option<Replay>,
    ) -> Self {
        Self {
            name,
            port,
            kind,
            item_size,
            item_count,
            poll_timeout,
            bound: descriptors.len(),
            descriptors,
            replay: replay.map(Mutex::new),
            state: Mutex::new(BaseState {
                refcount: 0,
                active_sources: 0,
                started: false,
                running: false,
                stop: false,
                attached: false,
                routing: Routing::Empty,
                unknown_peers: UnknownPeerLog::default(),
            }),
            cond: Condvar::new(),
            thread: Mutex::new(None),
            stats: BaseStats::new(),
        }
    }

    /// Bind every address in `listen` and start the reader thread
    ///
    /// Addresses that fail to bind are skipped; the base fails only if
    /// none of them bind.
    pub(crate) fn bind_network(
        listen: &[SocketAddr],
        item_size: usize,
        item_count: usize,
        poll_timeout: Duration,
    ) -> Result<Arc<Self>> {
        let name = listen
            .iter()
            .map(|a| a.to_string())
            .collect::<Vec<_>>()
            .join(",");

        tracing::debug!(
            base = %name,
            addresses = listen.len(),
            "Attempting to bind addresses"
        );

        let mut descriptors = Vec::with_capacity(listen.len());
        for addr in listen {
            match bind_udp(*addr) {
                Ok(sock) => {
                    tracing::debug!(addr = %addr, "Bound for listening");
                    descriptors.push(Descriptor::new(Endpoint::Udp(sock)));
                }
                Err(e) => {
                    tracing::debug!(addr = %addr, error = %e, "Skipping address: unable to bind");
                }
            }
        }

        if descriptors.is_empty() {
            tracing::error!(base = %name, "Failed to bind any addresses");
            return Err(Error::NoAddressBound(name));
        }

        tracing::debug!(
            base = %name,
            bound = descriptors.len(),
            requested = listen.len(),
            "Bound addresses"
        );

        let port = listen[0].port();
        let kind = BaseKind::Network {
            listen: listen.to_vec(),
        };
        let base = Self::new(
            name,
            port,
            kind,
            item_size,
            item_count,
            poll_timeout,
            descriptors,
            None,
        );
        Self::start(Arc::new(base))
    }

    /// Bind a UNIX datagram socket at `path` and start the reader thread
    pub(crate) fn bind_unix(
        path: &Path,
        item_size: usize,
        item_count: usize,
        poll_timeout: Duration,
    ) -> Result<Arc<Self>> {
        let name = path.display().to_string();
        let sock = bind_unix(path).map_err(|e| {
            tracing::error!(path = %name, error = %e, "Failed to bind UNIX socket");
            Error::Io(e)
        })?;

        let base = Self::new(
            name,
            0,
            BaseKind::UnixSocket,
            item_size,
            item_count,
            poll_timeout,
            vec![Descriptor::new(Endpoint::Unix(sock))],
            None,
        );
        Self::start(Arc::new(base))
    }

    /// Open a replay file; file bases have no thread
    pub(crate) fn open_file(path: &Path, item_size: usize) -> Result<Arc<Self>> {
        let name = path.display().to_string();
        let replay = Replay::open(path).map_err(|e| {
            tracing::error!(path = %name, error = %e, "Unable to open replay file");
            Error::Io(e)
        })?;

        let base = Self::new(
            name,
            0,
            BaseKind::File,
            item_size,
            1,
            Duration::ZERO,
            Vec::new(),
            Some(replay),
        );
        base.state.lock().started = true;
        Ok(Arc::new(base))
    }

    /// Spawn the reader thread and wait until it has finished start-up
    fn start(base: Arc<Self>) -> Result<Arc<Self>> {
        let thread_base = Arc::clone(&base);
        let handle = std::thread::Builder::new()
            .name(format!("flowsource-{}", base.port))
            .spawn(move || reader::run(thread_base))
            .map_err(|e| {
                tracing::warn!(base = %base.name, error = %e, "Unable to spawn reader thread");
                Error::Io(e)
            })?;
        *base.thread.lock() = Some(handle);

        let running = {
            let mut state = base.state.lock();
            while !state.started {
                base.cond.wait(&mut state);
            }
            state.running
        };

        if !running {
            base.shutdown();
            return Err(Error::Allocation);
        }
        Ok(base)
    }

    /// Attach a source, claiming its peers in the routing table
    pub(crate) fn attach(&self, source: &Arc<SourceShared>) -> Result<()> {
        let mut state = self.state.lock();

        // Once every attached source has stopped the reader is draining
        let draining = state.attached && state.active_sources == 0;
        if self.kind != BaseKind::File && (state.stop || !state.running || draining) {
            return Err(Error::BaseStopped(self.name.clone()));
        }

        state.routing.claim(source, &self.name)?;

        state.refcount += 1;
        state.active_sources += 1;
        state.attached = true;
        self.cond.notify_all();
        Ok(())
    }

    /// Remove a source from the routing table; returns the remaining refcount
    pub(crate) fn detach(&self, source: &Arc<SourceShared>) -> usize {
        let mut state = self.state.lock();

        let now_empty = match &mut state.routing {
            Routing::Any(any) => Arc::ptr_eq(any, source),
            Routing::Peers(demux) => {
                demux.remove_all(&source.accept_from, source);
                demux.is_empty()
            }
            Routing::Empty => false,
        };
        if now_empty {
            state.routing = Routing::Empty;
        }

        state.refcount = state.refcount.saturating_sub(1);
        state.refcount
    }

    /// Note that an attached source stopped
    ///
    /// When the last active source stops, blocks until the reader thread
    /// has exited so no write can race the source's buffer shutdown.
    pub(crate) fn source_stopped(&self) {
        let mut state = self.state.lock();
        state.active_sources = state.active_sources.saturating_sub(1);
        if state.active_sources == 0 {
            self.cond.notify_all();
            while state.running {
                self.cond.wait(&mut state);
            }
        }
    }

    /// Stop and join the reader thread, then close every descriptor
    ///
    /// Called once the last source has detached.
    pub(crate) fn shutdown(&self) {
        {
            let mut state = self.state.lock();
            state.stop = true;
            self.cond.notify_all();
            while state.running {
                self.cond.wait(&mut state);
            }
        }

        if let Some(handle) = self.thread.lock().take() {
            if handle.join().is_err() {
                tracing::error!(base = %self.name, "Reader thread panicked");
            }
        }

        for desc in &self.descriptors {
            desc.close();
        }
    }

    /// Read the next accepted record from a replay file into `out`
    pub(crate) fn replay_next(&self, out: &mut [u8], reject: Option<&RejectFn>) -> bool {
        let Some(replay) = &self.replay else {
            return false;
        };
        let mut replay = replay.lock();

        loop {
            if !replay.read_record(out) {
                return false;
            }
            self.stats.datagram_received(out.len());
            if let Some(reject) = reject {
                if reject(out) {
                    self.stats.rejected();
                    continue;
                }
            }
            return true;
        }
    }

    /// Stop the buffers of every attached source
    ///
    /// Used when the reader dies so blocked consumers wake up.
    pub(crate) fn cancel_sources(&self) {
        let sources = self.state.lock().routing.sources();
        for source in sources {
            if let Some(feed) = &source.feed {
                feed.buffer.stop();
            }
        }
    }

    /// Compression of the replay file; `None` for socket bases
    pub(crate) fn compression(&self) -> Option<Compression> {
        self.replay.as_ref().map(|replay| replay.lock().compression())
    }

    pub(crate) fn open_descriptors(&self) -> usize {
        self.descriptors.iter().filter(|d| d.is_open()).count()
    }

    pub(crate) fn local_addrs(&self) -> Vec<SocketAddr> {
        self.descriptors
            .iter()
            .filter_map(|d| d.endpoint().as_ref().and_then(|e| e.local_addr()))
            .collect()
    }

    /// Apply a receive-buffer size to every open descriptor
    pub(crate) fn resize_socket_buffers(&self, size: usize) {
        for desc in &self.descriptors {
            let endpoint = desc.endpoint();
            let Some(endpoint) = endpoint.as_ref() else {
                continue;
            };
            match endpoint.grow_recv_buffer(size) {
                Ok(applied) => {
                    tracing::trace!(base = %self.name, requested = size, applied, "Socket buffer sized")
                }
                Err(e) => {
                    tracing::debug!(base = %self.name, error = %e, "Unable to size socket buffer")
                }
            }
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn port(&self) -> u16 {
        self.port
    }

    pub(crate) fn kind(&self) -> &BaseKind {
        &self.kind
    }

    pub(crate) fn item_size(&self) -> usize {
        self.item_size
    }

    pub(crate) fn item_count(&self) -> usize {
        self.item_count
    }

    pub(crate) fn poll_timeout(&self) -> Duration {
        self.poll_timeout
    }

    /// Number of sockets bound when the base was created
    pub(crate) fn bound(&self) -> usize {
        self.bound
    }

    pub(crate) fn refcount(&self) -> usize {
        self.state.lock().refcount
    }

    #[cfg(test)]
    pub(crate) fn is_running(&self) -> bool {
        self.state.lock().running
    }

    pub(crate) fn stop_requested(&self) -> bool {
        self.state.lock().stop
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::sync::atomic::AtomicBool;

    use super::*;

    fn shared(peers: &[&str]) -> Arc<SourceShared> {
        Arc::new(SourceShared {
            accept_from: peers.iter().map(|p| p.parse().unwrap()).collect(),
            reject: None,
            stopped: AtomicBool::new(false),
            feed: None,
        })
    }

    #[test]
    fn test_claim_any_is_exclusive() {
        let mut routing = Routing::Empty;
        let any = shared(&[]);
        routing.claim(&any, "base").unwrap();
        assert!(Arc::ptr_eq(&routing.resolve(None).unwrap(), &any));

        assert!(matches!(
            routing.claim(&shared(&[]), "base"),
            Err(Error::ConfigConflict(_))
        ));
        assert!(matches!(
            routing.claim(&shared(&["10.0.0.1"]), "base"),
            Err(Error::ConfigConflict(_))
        ));
    }

    #[test]
    fn test_claim_peers() {
        let mut routing = Routing::Empty;
        // Repeated peers in a fresh table are not a conflict
        let a = shared(&["10.0.0.1", "10.0.0.2", "10.0.0.1"]);
        let b = shared(&["10.0.0.3"]);
        routing.claim(&a, "base").unwrap();
        routing.claim(&b, "base").unwrap();

        let peer = |s: &str| Some(s.parse().unwrap());
        assert!(Arc::ptr_eq(&routing.resolve(peer("10.0.0.2")).unwrap(), &a));
        assert!(Arc::ptr_eq(&routing.resolve(peer("10.0.0.3")).unwrap(), &b));
        assert!(routing.resolve(peer("10.0.0.4")).is_none());
        assert!(routing.resolve(None).is_none());
        assert_eq!(routing.sources().len(), 2);

        assert!(matches!(
            routing.claim(&shared(&[]), "base"),
            Err(Error::ConfigConflict(_))
        ));
    }

    #[test]
    fn test_file_base_refcount() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&[1, 2, 3, 4]).unwrap();
        file.flush().unwrap();

        let base = SourceBase::open_file(file.path(), 2).unwrap();
        assert_eq!(*base.kind(), BaseKind::File);
        assert_eq!(base.open_descriptors(), 0);
        assert!(base.local_addrs().is_empty());

        let source = shared(&[]);
        base.attach(&source).unwrap();
        assert_eq!(base.refcount(), 1);

        let mut out = [0u8; 2];
        assert!(base.replay_next(&mut out, None));
        assert_eq!(out, [1, 2]);

        base.source_stopped();
        assert_eq!(base.detach(&source), 0);
        assert!(matches!(base.state.lock().routing, Routing::Empty));
    }

    #[test]
    fn test_network_base_starts_and_shuts_down() {
        let base = SourceBase::bind_network(
            &["127.0.0.1:0".parse().unwrap()],
            64,
            4,
            Duration::from_millis(20),
        )
        .unwrap();
        assert!(base.is_running());
        assert_eq!(base.bound(), 1);
        assert_ne!(base.local_addrs()[0].port(), 0);

        // No source ever attached; shutdown still stops the reader
        base.shutdown();
        assert!(!base.is_running());
        assert_eq!(base.open_descriptors(), 0);

        assert!(matches!(
            base.attach(&shared(&[])),
            Err(Error::BaseStopped(_))
        ));
    }
}
