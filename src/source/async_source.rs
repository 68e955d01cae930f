//! Async adapter for consumers running on a tokio runtime

use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::task::JoinHandle;

use super::{Source, StopHandle};

/// Wraps a [`Source`] so records can be awaited
///
/// Each read runs on the blocking thread pool and copies the record into a
/// [`Bytes`]. Reads are cancel-safe: if a `next_record` future is dropped,
/// the read in flight is kept and the next call picks up its record.
#[derive(Debug)]
pub struct AsyncSource {
    source: Arc<Mutex<Source>>,
    in_flight: Option<JoinHandle<Option<Bytes>>>,
    stop: StopHandle,
}

impl AsyncSource {
    pub fn new(source: Source) -> Self {
        let stop = source.stop_handle();
        Self {
            source: Arc::new(Mutex::new(source)),
            in_flight: None,
            stop,
        }
    }

    /// Next record, or `None` once the source is stopped or exhausted
    pub async fn next_record(&mut self) -> Option<Bytes> {
        if self.in_flight.is_none() {
            let source = Arc::clone(&self.source);
            self.in_flight = Some(tokio::task::spawn_blocking(move || {
                source.lock().next_record().map(Bytes::copy_from_slice)
            }));
        }
        let task = self.in_flight.as_mut()?;

        let joined = task.await;
        self.in_flight = None;

        match joined {
            Ok(record) => record,
            Err(e) => {
                tracing::error!(error = %e, "Blocking read task failed");
                None
            }
        }
    }

    /// Handle for stopping the source, e.g. from a shutdown task
    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Recover the wrapped source
    ///
    /// Returns `None` while an abandoned read still holds the source; stop
    /// the source first to end such a read.
    pub fn into_inner(self) -> Option<Source> {
        drop(self.in_flight);
        Arc::try_unwrap(self.source).ok().map(Mutex::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::os::unix::net::UnixDatagram;
    use std::time::Duration;

    use super::*;
    use crate::registry::SourceRegistry;
    use crate::source::{ListenSpec, SourceOptions};

    #[tokio::test]
    async fn test_async_file_records() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&[1, 1, 2, 2]).unwrap();
        file.flush().unwrap();

        let registry = Arc::new(SourceRegistry::new());
        let source = Source::create(
            &registry,
            &ListenSpec::file(file.path()),
            &SourceOptions::new(2, 1),
        )
        .unwrap();
        let mut source = AsyncSource::new(source);

        assert_eq!(source.next_record().await, Some(Bytes::from_static(&[1, 1])));
        assert_eq!(source.next_record().await, Some(Bytes::from_static(&[2, 2])));
        assert_eq!(source.next_record().await, None);
        assert!(source.into_inner().is_some());
    }

    #[tokio::test]
    async fn test_async_stop_from_task() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("async.sock");
        let registry = Arc::new(SourceRegistry::new());
        let source = Source::create(
            &registry,
            &ListenSpec::unix_socket(&path),
            &SourceOptions::new(4, 8),
        )
        .unwrap();
        let mut source = AsyncSource::new(source);

        let sender = UnixDatagram::unbound().unwrap();
        sender.send_to(&[3u8; 4], &path).unwrap();
        assert_eq!(source.next_record().await, Some(Bytes::from_static(&[3; 4])));

        let stop = source.stop_handle();
        let stopper = tokio::task::spawn_blocking(move || stop.stop());
        assert_eq!(source.next_record().await, None);
        stopper.await.unwrap();
    }

    #[tokio::test]
    async fn test_cancelled_read_keeps_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("async.sock");
        let registry = Arc::new(SourceRegistry::new());
        let source = Source::create(
            &registry,
            &ListenSpec::unix_socket(&path),
            &SourceOptions::new(4, 8),
        )
        .unwrap();
        let mut source = AsyncSource::new(source);

        let timed_out =
            tokio::time::timeout(Duration::from_millis(50), source.next_record()).await;
        assert!(timed_out.is_err());

        let sender = UnixDatagram::unbound().unwrap();
        sender.send_to(&[1u8; 4], &path).unwrap();
        sender.send_to(&[2u8; 4], &path).unwrap();

        assert_eq!(source.next_record().await, Some(Bytes::from_static(&[1; 4])));
        assert_eq!(source.next_record().await, Some(Bytes::from_static(&[2; 4])));
        assert!(source.into_inner().is_some());
    }

    #[test]
    fn test_block_on_outside_runtime() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&[4, 4, 4]).unwrap();
        file.flush().unwrap();

        let registry = Arc::new(SourceRegistry::new());
        let source = Source::create(
            &registry,
            &ListenSpec::file(file.path()),
            &SourceOptions::new(3, 1),
        )
        .unwrap();

        let rt = tokio::runtime::Runtime::new().unwrap();
        let mut source = AsyncSource::new(source);
        let record = rt.block_on(source.next_record());
        assert_eq!(record, Some(Bytes::from_static(&[4, 4, 4])));

        let stop = source.stop_handle();
        tokio_test::block_on(async move { stop.stop() });
        assert_eq!(rt.block_on(source.next_record()), None);
    }
}
