//! Transport-agnostic byte stream engine for line- and frame-oriented
//! device protocol links (point-of-sale and payment terminal links).
//!
//! A [`DeviceStream`] binds one transport adapter (TCP, serial, message
//! bus, or in-memory loopback) to one ordered inbound byte queue and
//! offers timeout-bounded reads, pattern-terminated reads and an optional
//! 7-bit line transform, with identical behavior no matter which medium
//! feeds the queue.

pub mod encoding;
pub mod error;
pub mod queue;
pub mod stream;
pub mod transport;

pub use encoding::Parity;
pub use error::{StreamError, StreamResult};
pub use queue::{ByteQueue, ByteSink};
pub use stream::{DeviceStream, StreamOptions};
pub use transport::{create_transport, Transport, TransportConfig};
