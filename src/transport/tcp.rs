// TCP socket transport
//
// Connects to a TCP server; a spawned reader task pushes every received
// byte into the inbound queue while the write half carries sends.
//
// Disconnected-write behavior: `send` auto-connects first.

use super::Transport;
use crate::error::{StreamError, StreamResult};
use crate::queue::ByteSink;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

const READ_BUFFER_SIZE: usize = 4096;

pub struct TcpTransport {
    host: String,
    port: u16,
    sink: ByteSink,
    writer: Option<OwnedWriteHalf>,
    connected: Arc<AtomicBool>,
    conn_cancel: CancellationToken,
}

impl TcpTransport {
    pub fn new(host: String, port: u16, sink: ByteSink) -> Self {
        Self {
            host,
            port,
            sink,
            writer: None,
            connected: Arc::new(AtomicBool::new(false)),
            conn_cancel: CancellationToken::new(),
        }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn name(&self) -> &'static str {
        "tcp"
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn connect(&mut self) -> StreamResult<()> {
        if self.is_connected() {
            return Ok(());
        }

        let addr = format!("{}:{}", self.host, self.port);
        info!("connecting to tcp {}", addr);

        let stream = TcpStream::connect(&addr)
            .await
            .map_err(|e| StreamError::Network(format!("TCP connect to {} failed: {}", addr, e)))?;

        let (mut reader, writer) = stream.into_split();
        self.writer = Some(writer);
        self.connected.store(true, Ordering::SeqCst);

        let cancel = CancellationToken::new();
        self.conn_cancel = cancel.clone();

        let sink = self.sink.clone();
        let connected = Arc::clone(&self.connected);
        tokio::spawn(async move {
            let mut buf = [0u8; READ_BUFFER_SIZE];
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    res = reader.read(&mut buf) => match res {
                        Ok(0) => {
                            info!("tcp connection closed by peer");
                            break;
                        }
                        Ok(n) => sink.extend(&buf[..n]),
                        Err(e) => {
                            error!("tcp read error: {}", e);
                            break;
                        }
                    },
                }
            }
            connected.store(false, Ordering::SeqCst);
        });

        info!("tcp connected");
        Ok(())
    }

    async fn close(&mut self) -> StreamResult<()> {
        self.conn_cancel.cancel();
        if let Some(mut writer) = self.writer.take() {
            // Best effort; the peer may already be gone.
            let _ = writer.shutdown().await;
        }
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn send(&mut self, data: &[u8]) -> StreamResult<()> {
        if !self.is_connected() {
            self.connect().await?;
        }

        debug!("tcp send {} bytes: {}", data.len(), hex::encode(data));

        let writer = self.writer.as_mut().ok_or(StreamError::NotConnected)?;
        if let Err(e) = writer.write_all(data).await {
            self.connected.store(false, Ordering::SeqCst);
            return Err(StreamError::Network(format!("TCP send failed: {}", e)));
        }
        Ok(())
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        self.conn_cancel.cancel();
    }
}
