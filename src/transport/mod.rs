// Pluggable transport adapter system
//
// This module defines the `Transport` trait which binds the stream engine
// to one physical or logical medium. New transports can be added by:
// 1. Implementing the Transport trait
// 2. Adding a variant to TransportConfig
// 3. Registering in the factory function
//
// Current implementations:
// - Tcp: raw TCP socket client
// - Serial: serial port link (unix-only)
// - Bus: message-bus link (ZeroMQ SUB/PUB topic pair)
// - Mem: in-memory loopback for tests and simulation
//
// Every adapter is constructed with a `ByteSink` and must push each byte
// its medium delivers, in order, without blocking and without ever
// reading the queue back.

mod bus;
mod mem;
mod tcp;

#[cfg(target_family = "unix")]
mod serial;

use crate::error::StreamResult;
use crate::queue::ByteSink;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use bus::{BusClient, BusTransport, ZmqBusClient};
pub use mem::MemTransport;
pub use tcp::TcpTransport;

#[cfg(target_family = "unix")]
pub use serial::SerialTransport;

/// Configuration for the built-in transport types
///
/// Uses serde's tag attribute for clean JSON serialization and easy
/// extension with new transport types.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum TransportConfig {
    /// TCP socket client
    #[serde(rename = "tcp")]
    Tcp { host: String, port: u16 },

    /// Serial port link (e.g. /dev/ttyUSB0)
    #[cfg(target_family = "unix")]
    #[serde(rename = "serial")]
    Serial {
        port: String,
        baud_rate: u32,
        #[serde(default)]
        data_bits: Option<u8>,
        #[serde(default)]
        stop_bits: Option<u8>,
        /// Line parity: "none", "even" or "odd"
        #[serde(default)]
        parity: Option<String>,
    },

    /// Message bus link: one subscribe topic feeds the inbound queue, one
    /// publish topic carries writes
    #[serde(rename = "bus")]
    Bus {
        /// Endpoint the SUB socket connects to (e.g. "tcp://127.0.0.1:5555")
        sub_endpoint: String,
        /// Endpoint the PUB socket connects to
        pub_endpoint: String,
        sub_topic: String,
        pub_topic: String,
    },

    /// In-memory loopback
    #[serde(rename = "mem")]
    Mem {
        /// Echo sent bytes straight back into the inbound queue
        #[serde(default)]
        echo: bool,
    },
}

/// One physical or logical medium behind a [`DeviceStream`].
///
/// Adapters own their native connection resources and a receive path that
/// pushes inbound bytes into the `ByteSink` they were built with. The
/// core stream engine only ever talks to this trait.
///
/// Behavior while disconnected is adapter-defined and documented per
/// implementation: the TCP adapter auto-connects on `send`, the serial
/// and bus adapters fail with a typed error.
///
/// [`DeviceStream`]: crate::stream::DeviceStream
#[async_trait]
pub trait Transport: Send + Sync {
    /// Short identifier for diagnostics and log lines.
    fn name(&self) -> &'static str;

    /// Live connectivity of the underlying medium. Never cached by the
    /// stream engine.
    fn is_connected(&self) -> bool;

    /// Open the connection and start routing inbound bytes to the sink.
    /// Calling connect while already connected is a no-op.
    async fn connect(&mut self) -> StreamResult<()>;

    /// Stop inbound routing and close the connection. Queued inbound
    /// bytes already pushed are not discarded.
    async fn close(&mut self) -> StreamResult<()>;

    /// Deliver a byte buffer to the medium. Failures are surfaced as
    /// typed errors, never silently dropped, and never retried in a way
    /// that could duplicate the buffer.
    async fn send(&mut self, data: &[u8]) -> StreamResult<()>;

    /// Terminal teardown: close and release owned native resources.
    /// Adapters wrapping an externally-owned client must leave that
    /// client alive here.
    async fn teardown(&mut self) -> StreamResult<()> {
        self.close().await
    }
}

/// Factory function to create a Transport from configuration
///
/// This is where new transport types are registered. To add one:
/// 1. Implement the Transport trait
/// 2. Add a variant to TransportConfig
/// 3. Add a match arm here to construct your transport
pub fn create_transport(config: TransportConfig, sink: ByteSink) -> StreamResult<Box<dyn Transport>> {
    match config {
        TransportConfig::Tcp { host, port } => Ok(Box::new(TcpTransport::new(host, port, sink))),

        #[cfg(target_family = "unix")]
        TransportConfig::Serial {
            port,
            baud_rate,
            data_bits,
            stop_bits,
            parity,
        } => Ok(Box::new(SerialTransport::new(
            port, baud_rate, data_bits, stop_bits, parity, sink,
        )?)),

        TransportConfig::Bus {
            sub_endpoint,
            pub_endpoint,
            sub_topic,
            pub_topic,
        } => Ok(Box::new(BusTransport::owned(
            sub_endpoint,
            pub_endpoint,
            sub_topic,
            pub_topic,
            sink,
        ))),

        TransportConfig::Mem { echo } => Ok(Box::new(MemTransport::new(sink, echo))),
    }
}
