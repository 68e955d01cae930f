//! Synchronous replay of fixed-size records from a file
//!
//! Gzip input is detected by its magic bytes and decompressed on the fly.

use std::fmt;
use std::fs::File;
use std::io::{self, BufRead, BufReader, Read};
use std::path::{Path, PathBuf};

use flate2::read::MultiGzDecoder;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Compression detected on a replay file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    Gzip,
}

impl Compression {
    /// Detect compression from the leading bytes of a file
    pub fn detect(data: &[u8]) -> Self {
        if data.starts_with(&GZIP_MAGIC) {
            Compression::Gzip
        } else {
            Compression::None
        }
    }
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Compression::None => write!(f, "none"),
            Compression::Gzip => write!(f, "gzip"),
        }
    }
}

/// Open replay file
pub(crate) struct Replay {
    path: PathBuf,
    reader: Box<dyn Read + Send>,
    compression: Compression,
    exhausted: bool,
}

impl Replay {
    pub(crate) fn open(path: &Path) -> io::Result<Self> {
        let mut buffered = BufReader::new(File::open(path)?);
        let compression = Compression::detect(buffered.fill_buf()?);

        let reader: Box<dyn Read + Send> = match compression {
            Compression::Gzip => Box::new(MultiGzDecoder::new(buffered)),
            Compression::None => Box::new(buffered),
        };

        tracing::debug!(
            path = %path.display(),
            compression = %compression,
            "Opened replay file"
        );

        Ok(Self {
            path: path.to_path_buf(),
            reader,
            compression,
            exhausted: false,
        })
    }

    pub(crate) fn compression(&self) -> Compression {
        self.compression
    }

    /// Fill `out` with the next record
    ///
    /// Returns false at end of file, on a short trailing record, or on a
    /// read error; once false, it stays false.
    pub(crate) fn read_record(&mut self, out: &mut [u8]) -> bool {
        if self.exhausted {
            return false;
        }
        match self.reader.read_exact(out) {
            Ok(()) => true,
            Err(e) => {
                if e.kind() != io::ErrorKind::UnexpectedEof {
                    tracing::error!(
                        path = %self.path.display(),
                        error = %e,
                        "Replay read failed"
                    );
                }
                self.exhausted = true;
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use flate2::write::GzEncoder;

    use super::*;

    #[test]
    fn test_detect() {
        assert_eq!(Compression::detect(&[0x1f, 0x8b, 0x08]), Compression::Gzip);
        assert_eq!(Compression::detect(&[0x00, 0x05]), Compression::None);
        assert_eq!(Compression::detect(&[]), Compression::None);
    }

    #[test]
    fn test_plain_records_and_short_tail() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&[1, 1, 1, 1, 2, 2, 2, 2, 3, 3]).unwrap();
        file.flush().unwrap();

        let mut replay = Replay::open(file.path()).unwrap();
        assert_eq!(replay.compression(), Compression::None);

        let mut rec = [0u8; 4];
        assert!(replay.read_record(&mut rec));
        assert_eq!(rec, [1; 4]);
        assert!(replay.read_record(&mut rec));
        assert_eq!(rec, [2; 4]);
        assert!(!replay.read_record(&mut rec));
        assert!(!replay.read_record(&mut rec));
    }

    #[test]
    fn test_gzip_records() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let mut encoder = GzEncoder::new(file.reopen().unwrap(), flate2::Compression::default());
        for i in 0..3u8 {
            encoder.write_all(&[i; 8]).unwrap();
        }
        encoder.finish().unwrap();

        let mut replay = Replay::open(file.path()).unwrap();
        assert_eq!(replay.compression(), Compression::Gzip);

        let mut rec = [0u8; 8];
        for i in 0..3u8 {
            assert!(replay.read_record(&mut rec));
            assert_eq!(rec, [i; 8]);
        }
        assert!(!replay.read_record(&mut rec));
    }

    #[test]
    fn test_empty_file() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let mut replay = Replay::open(file.path()).unwrap();
        let mut rec = [0u8; 4];
        assert!(!replay.read_record(&mut rec));
    }
}
