//! Source registry for shared network bases
//!
//! The registry owns every network base so that sources listening on the
//! same address set share one set of sockets and one reader thread. It
//! also divides a receive-buffer budget among all open sockets.
//!
//! # Architecture
//!
//! ```text
//!                          Arc<SourceRegistry>
//!                     ┌─────────────────────────┐
//!                     │ bases: Vec<             │
//!                     │   SourceBase {          │
//!                     │     sockets,            │
//!                     │     reader thread,      │
//!                     │     routing,            │
//!                     │   }                     │
//!                     │ >                       │
//!                     │ open_sockets            │
//!                     └───────────┬─────────────┘
//!                                 │ reader thread: poll ─► recv ─► demux
//!         ┌───────────────────────┼───────────────────────┐
//!         │                       │                       │
//!         ▼                       ▼                       ▼
//!    [Source A]              [Source B]              [Source C]
//!    peers 10.0.0.1          peers 10.0.0.2          peers 10.0.0.3
//!    buffer.consume()        buffer.consume()        buffer.consume()
//! ```
//!
//! # Socket buffers
//!
//! Whenever a base is added or removed, every open socket's `SO_RCVBUF` is
//! set to `max(minimum, total / open_sockets)`.

pub mod config;
pub mod store;

pub use config::RegistryConfig;
pub use store::SourceRegistry;
