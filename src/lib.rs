//! Flow-export packet ingestion
//!
//! `flowsource` receives fixed-maximum-size records (NetFlow, IPFIX and
//! similar export packets) over UDP, a UNIX datagram socket, or a replay
//! file, and hands them one at a time to a consumer.
//!
//! Each network or UNIX [`Source`] is fed by a reader thread owned by its
//! base. Sources that listen on the same addresses share a base and are
//! told apart by the sender's address. Records travel through a bounded
//! [`CircularBuffer`], so a slow consumer pushes back on the reader thread
//! instead of growing memory.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use flowsource::{ListenSpec, SourceOptions, SourceRegistry};
//!
//! # fn main() -> flowsource::Result<()> {
//! let registry = Arc::new(SourceRegistry::from_env());
//! let spec = ListenSpec::network_from(
//!     ["0.0.0.0:2055".parse().unwrap()],
//!     ["10.0.0.1".parse().unwrap()],
//! )?;
//! let mut source = registry.create_source(&spec, &SourceOptions::new(1464, 1024))?;
//!
//! while let Some(record) = source.next_record() {
//!     println!("{} bytes", record.len());
//! }
//! source.destroy();
//! # Ok(())
//! # }
//! ```

pub mod buffer;
pub mod error;
pub mod registry;
pub mod source;
pub mod stats;

pub use buffer::{Cancelled, CircularBuffer};
pub use error::{Error, Result};
pub use registry::{RegistryConfig, SourceRegistry};
pub use source::{AsyncSource, ListenSpec, Source, SourceOptions, StopHandle};
pub use stats::BaseStatsSnapshot;
