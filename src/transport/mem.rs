// In-memory loopback transport
//
// Stands in for a real medium in tests and simulations: every sent buffer
// is recorded in a shared outbox, and in echo mode the bytes are also
// pushed straight back into the inbound queue.

use super::Transport;
use crate::error::{StreamError, StreamResult};
use crate::queue::ByteSink;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;

pub struct MemTransport {
    sink: ByteSink,
    echo: bool,
    connected: bool,
    outbox: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl MemTransport {
    pub fn new(sink: ByteSink, echo: bool) -> Self {
        Self {
            sink,
            echo,
            connected: false,
            outbox: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Shared handle to the buffers sent through this transport, in send
    /// order. Each `send` call appends one entry.
    pub fn outbox(&self) -> Arc<Mutex<Vec<Vec<u8>>>> {
        Arc::clone(&self.outbox)
    }

    /// Inject bytes as if the medium had delivered them.
    pub fn feed(&self, bytes: &[u8]) {
        self.sink.extend(bytes);
    }
}

#[async_trait]
impl Transport for MemTransport {
    fn name(&self) -> &'static str {
        "mem"
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    async fn connect(&mut self) -> StreamResult<()> {
        self.connected = true;
        Ok(())
    }

    async fn close(&mut self) -> StreamResult<()> {
        self.connected = false;
        Ok(())
    }

    async fn send(&mut self, data: &[u8]) -> StreamResult<()> {
        if !self.connected {
            return Err(StreamError::NotConnected);
        }
        self.outbox.lock().push(data.to_vec());
        if self.echo {
            self.sink.extend(data);
        }
        Ok(())
    }
}
