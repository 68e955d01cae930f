//! Sources and the bases they share
//!
//! A [`Source`] is the consumer's handle: it owns a circular buffer (or,
//! for replay files, a single record) and a reference to the base that
//! feeds it. Several network sources with the same listen set share one
//! base and are told apart by peer address.
//!
//! # Teardown
//!
//! ```text
//!   Source::stop()     mark stopped ─► base.active_sources -= 1
//!                                        │ (last active: wait for reader exit)
//!                                        ▼
//!                                   stop own buffer
//!
//!   Source::destroy()  stop() ─► detach from routing ─► refcount -= 1
//!                                        │ (last reference)
//!                                        ▼
//!                       join reader, close sockets, leave registry
//! ```

mod async_source;
mod base;
mod demux;
mod endpoint;
mod reader;
mod replay;
mod spec;

pub use async_source::AsyncSource;
pub use demux::{PeerConflict, PeerDemux, UnknownPeerLog};
pub use replay::Compression;
pub use spec::{ListenSpec, RejectFn, SourceOptions};

pub(crate) use base::{BaseKind, SourceBase};

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::buffer::{Cancelled, CircularBuffer, Reader, Writer};
use crate::error::{Error, Result};
use crate::registry::SourceRegistry;
use crate::stats::BaseStatsSnapshot;

/// Producer side of a source, driven by the base's reader thread
pub(crate) struct Feed {
    pub(crate) buffer: Arc<CircularBuffer>,
    pub(crate) writer: Mutex<Writer>,
}

/// Per-source state visible to the base
pub(crate) struct SourceShared {
    pub(crate) accept_from: Vec<IpAddr>,
    pub(crate) reject: Option<RejectFn>,
    pub(crate) stopped: AtomicBool,
    /// `None` for replay files
    pub(crate) feed: Option<Feed>,
}

enum Delivery {
    Buffered(Reader),
    Replay(Box<[u8]>),
}

/// Consumer handle for one stream of fixed-size records
pub struct Source {
    base: Arc<SourceBase>,
    shared: Arc<SourceShared>,
    registry: Option<Arc<SourceRegistry>>,
    delivery: Delivery,
    closed: bool,
}

impl Source {
    /// Create a source for `spec`
    ///
    /// Network sources go through `registry` and may share a base with
    /// existing sources. UNIX-socket and file sources get a base of their
    /// own and only take their poll timeout from the registry.
    pub fn create(
        registry: &Arc<SourceRegistry>,
        spec: &ListenSpec,
        options: &SourceOptions,
    ) -> Result<Self> {
        options.validate()?;

        match spec {
            ListenSpec::Network {
                listen,
                accept_from,
            } => registry.create_network(listen, accept_from, options),
            ListenSpec::UnixSocket { path } => {
                let base = SourceBase::bind_unix(
                    path,
                    options.item_size,
                    options.item_count,
                    registry.config().poll_timeout,
                )?;
                Self::attach(Arc::clone(&base), Vec::new(), options, None).inspect_err(|_| {
                    base.shutdown();
                })
            }
            ListenSpec::File { path } => {
                let base = SourceBase::open_file(path, options.item_size)?;
                Self::attach(base, Vec::new(), options, None)
            }
        }
    }

    /// Build a source and attach it to `base`
    pub(crate) fn attach(
        base: Arc<SourceBase>,
        accept_from: Vec<IpAddr>,
        options: &SourceOptions,
        registry: Option<Arc<SourceRegistry>>,
    ) -> Result<Self> {
        let (feed, delivery) = if *base.kind() == BaseKind::File {
            let record = vec![0u8; base.item_size()].into_boxed_slice();
            (None, Delivery::Replay(record))
        } else {
            let buffer = CircularBuffer::new(base.item_size(), base.item_count())?;
            let mut writer = buffer.writer();
            // The reader thread always fills the pending slot
            writer
                .acquire_write_slot()
                .map_err(|Cancelled| Error::Allocation)?;
            let reader = buffer.reader();
            let feed = Feed {
                buffer,
                writer: Mutex::new(writer),
            };
            (Some(feed), Delivery::Buffered(reader))
        };

        let shared = Arc::new(SourceShared {
            accept_from,
            reject: options.reject.clone(),
            stopped: AtomicBool::new(false),
            feed,
        });
        base.attach(&shared)?;

        tracing::debug!(
            base = %base.name(),
            peers = shared.accept_from.len(),
            "Source attached"
        );

        Ok(Self {
            base,
            shared,
            registry,
            delivery,
            closed: false,
        })
    }

    /// Next record, blocking until one is available
    ///
    /// The record is `item_size` bytes; a shorter datagram is zero-padded.
    /// Returns `None` once the source is stopped, its base has died, or a
    /// replay file is exhausted. The record stays valid until the next call.
    pub fn next_record(&mut self) -> Option<&[u8]> {
        match &mut self.delivery {
            Delivery::Buffered(reader) => reader.consume().ok(),
            Delivery::Replay(record) => {
                if self.shared.stopped.load(Ordering::Acquire) {
                    return None;
                }
                if self.base.replay_next(record, self.shared.reject.as_ref()) {
                    Some(&record[..])
                } else {
                    None
                }
            }
        }
    }

    /// Stop delivering records
    ///
    /// Blocks until the base's reader thread has exited if this was its
    /// last active source. Calling it again does nothing.
    pub fn stop(&mut self) {
        self.stop_handle().stop();
    }

    /// Handle that can stop this source from another thread
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            base: Arc::clone(&self.base),
            shared: Arc::clone(&self.shared),
        }
    }

    /// Stop the source and release its base
    ///
    /// When this is the base's last source, its thread is joined and its
    /// sockets are closed before this returns.
    pub fn destroy(mut self) {
        self.close();
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.stop();

        match &self.registry {
            Some(registry) => registry.release(&self.base, &self.shared),
            None => {
                if self.base.detach(&self.shared) == 0 {
                    self.base.shutdown();
                    tracing::debug!(base = %self.base.name(), "Base closed");
                }
            }
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.stopped.load(Ordering::Acquire)
    }

    pub fn item_size(&self) -> usize {
        self.base.item_size()
    }

    /// Name of the base: the listen addresses or the path
    pub fn name(&self) -> &str {
        self.base.name()
    }

    /// Compression detected on a replay file; `None` for sockets
    pub fn compression(&self) -> Option<Compression> {
        self.base.compression()
    }

    /// Addresses the base actually bound, with ephemeral ports resolved
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.base.local_addrs()
    }

    /// Number of sources attached to this source's base
    pub fn attached_sources(&self) -> usize {
        self.base.refcount()
    }

    /// Counters of the base this source is attached to
    pub fn stats(&self) -> BaseStatsSnapshot {
        self.base.stats.snapshot()
    }
}

impl Drop for Source {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Source")
            .field("base", &self.base.name())
            .field("accept_from", &self.shared.accept_from)
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

/// Stops a [`Source`] from any thread
///
/// A consumer blocked in [`Source::next_record`] wakes and gets `None`.
#[derive(Clone)]
pub struct StopHandle {
    base: Arc<SourceBase>,
    shared: Arc<SourceShared>,
}

impl StopHandle {
    pub fn stop(&self) {
        if self.shared.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        self.base.source_stopped();
        if let Some(feed) = &self.shared.feed {
            feed.buffer.stop();
        }
        tracing::debug!(base = %self.base.name(), "Source stopped");
    }
}

impl fmt::Debug for StopHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StopHandle")
            .field("base", &self.base.name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::os::unix::net::UnixDatagram;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    use flate2::write::GzEncoder;

    use super::*;
    use crate::registry::RegistryConfig;

    fn registry() -> Arc<SourceRegistry> {
        Arc::new(SourceRegistry::with_config(
            RegistryConfig::default().poll_timeout(Duration::from_millis(50)),
        ))
    }

    fn replay_file(records: &[[u8; 4]]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        for rec in records {
            file.write_all(rec).unwrap();
        }
        file.flush().unwrap();
        file
    }

    #[test]
    fn test_file_source_replays_records() {
        let file = replay_file(&[[1; 4], [2; 4], [3; 4]]);
        let registry = registry();
        let mut source = Source::create(
            &registry,
            &ListenSpec::file(file.path()),
            &SourceOptions::new(4, 1),
        )
        .unwrap();

        assert_eq!(source.next_record(), Some(&[1u8; 4][..]));
        assert_eq!(source.next_record(), Some(&[2u8; 4][..]));
        assert_eq!(source.next_record(), Some(&[3u8; 4][..]));
        assert_eq!(source.next_record(), None);
        assert_eq!(source.stats().datagrams_received, 3);
        assert_eq!(registry.base_count(), 0);
    }

    #[test]
    fn test_file_source_reject() {
        let file = replay_file(&[[1; 4], [2; 4], [3; 4], [2; 4]]);
        let options = SourceOptions::new(4, 1).reject(|rec| rec[0] == 2);
        let mut source =
            Source::create(&registry(), &ListenSpec::file(file.path()), &options).unwrap();

        assert_eq!(source.next_record(), Some(&[1u8; 4][..]));
        assert_eq!(source.next_record(), Some(&[3u8; 4][..]));
        assert_eq!(source.next_record(), None);
        assert_eq!(source.stats().rejected, 2);
    }

    #[test]
    fn test_gzip_file_source() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let mut encoder = GzEncoder::new(file.reopen().unwrap(), flate2::Compression::fast());
        encoder.write_all(&[5u8; 16]).unwrap();
        encoder.finish().unwrap();

        let mut source = Source::create(
            &registry(),
            &ListenSpec::file(file.path()),
            &SourceOptions::new(8, 4),
        )
        .unwrap();
        assert_eq!(source.compression(), Some(Compression::Gzip));
        assert_eq!(source.next_record(), Some(&[5u8; 8][..]));
        assert_eq!(source.next_record(), Some(&[5u8; 8][..]));
        assert_eq!(source.next_record(), None);
    }

    #[test]
    fn test_stopped_file_source_returns_none() {
        let file = replay_file(&[[1; 4]]);
        let mut source = Source::create(
            &registry(),
            &ListenSpec::file(file.path()),
            &SourceOptions::new(4, 1),
        )
        .unwrap();
        source.stop();
        source.stop();
        assert!(source.is_stopped());
        assert_eq!(source.next_record(), None);
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = Source::create(
            &registry(),
            &ListenSpec::file(dir.path().join("missing")),
            &SourceOptions::new(4, 1),
        )
        .unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn test_invalid_options() {
        let err = Source::create(
            &registry(),
            &ListenSpec::file("/dev/null"),
            &SourceOptions::new(0, 1),
        )
        .unwrap_err();
        assert!(matches!(err, Error::InvalidSpec(_)));
    }

    #[test]
    fn test_unix_source_receives_and_pads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("collector.sock");
        let mut source = Source::create(
            &registry(),
            &ListenSpec::unix_socket(&path),
            &SourceOptions::new(8, 16),
        )
        .unwrap();
        assert_eq!(source.attached_sources(), 1);

        let sender = UnixDatagram::unbound().unwrap();
        sender.send_to(&[9u8; 8], &path).unwrap();
        sender.send_to(&[7u8; 3], &path).unwrap();

        assert_eq!(source.next_record(), Some(&[9u8; 8][..]));
        assert_eq!(source.next_record(), Some(&[7, 7, 7, 0, 0, 0, 0, 0][..]));

        let stats = source.stats();
        assert_eq!(stats.datagrams_received, 2);
        assert_eq!(stats.bytes_received, 11);
        source.destroy();
    }

    #[test]
    fn test_unix_source_reject() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("collector.sock");
        let options = SourceOptions::new(8, 16).reject(|data| data.len() < 4);
        let mut source =
            Source::create(&registry(), &ListenSpec::unix_socket(&path), &options).unwrap();

        let sender = UnixDatagram::unbound().unwrap();
        sender.send_to(&[1u8; 2], &path).unwrap();
        sender.send_to(&[2u8; 6], &path).unwrap();

        assert_eq!(source.next_record(), Some(&[2, 2, 2, 2, 2, 2, 0, 0][..]));
        assert_eq!(source.stats().rejected, 1);
    }

    #[test]
    fn test_stop_handle_wakes_blocked_consumer() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("collector.sock");
        let mut source = Source::create(
            &registry(),
            &ListenSpec::unix_socket(&path),
            &SourceOptions::new(8, 16),
        )
        .unwrap();
        let handle = source.stop_handle();

        let (tx, rx) = mpsc::channel();
        let consumer = thread::spawn(move || {
            let got = source.next_record().map(|r| r.to_vec());
            tx.send(got).unwrap();
            source
        });

        assert!(rx.recv_timeout(Duration::from_millis(150)).is_err());
        handle.stop();
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), None);

        let source = consumer.join().unwrap();
        assert!(source.is_stopped());
        // The last active source stopped, so the reader is gone
        assert!(!source.base.is_running());
    }

    #[test]
    fn test_stop_with_full_buffer_does_not_hang() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("collector.sock");
        let mut source = Source::create(
            &registry(),
            &ListenSpec::unix_socket(&path),
            &SourceOptions::new(50_000, 3),
        )
        .unwrap();

        let sender = UnixDatagram::unbound().unwrap();
        for i in 0..6u8 {
            sender.send_to(&[i; 16], &path).unwrap();
        }
        // Let the reader fill the buffer and block on the next commit
        thread::sleep(Duration::from_millis(200));

        source.stop();
        assert!(!source.base.is_running());
        assert_eq!(source.next_record(), None);
    }

    #[test]
    fn test_destroy_removes_socket_reader() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("collector.sock");
        let source = Source::create(
            &registry(),
            &ListenSpec::unix_socket(&path),
            &SourceOptions::new(8, 16),
        )
        .unwrap();
        let base = Arc::clone(&source.base);
        let shared = Arc::clone(&source.shared);

        source.destroy();
        assert!(!base.is_running());
        assert_eq!(base.refcount(), 0);
        assert_eq!(base.open_descriptors(), 0);
        assert!(shared.stopped.load(Ordering::Acquire));
        assert!(shared.feed.as_ref().unwrap().buffer.is_stopped());
    }

    #[test]
    fn test_reader_failure_wakes_consumer() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("collector.sock");
        let mut source = Source::create(
            &registry(),
            &ListenSpec::unix_socket(&path),
            &SourceOptions::new(8, 16),
        )
        .unwrap();
        let base = Arc::clone(&source.base);

        let (tx, rx) = mpsc::channel();
        let consumer = thread::spawn(move || {
            let got = source.next_record().map(|r| r.to_vec());
            tx.send(got).unwrap();
            source
        });
        assert!(rx.recv_timeout(Duration::from_millis(150)).is_err());

        // Losing the only descriptor is fatal to the reader
        assert!(base.descriptors[0].close());
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), None);

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while base.is_running() && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert!(!base.is_running());

        let source = consumer.join().unwrap();
        assert!(!source.is_stopped());
        assert!(source.shared.feed.as_ref().unwrap().buffer.is_stopped());
    }
}
