// Serial port transport (Unix-only)
//
// Opens a serial port (e.g. /dev/ttyUSB0, /dev/ttyACM0) with the
// configured line settings; a spawned reader task pushes every received
// byte into the inbound queue.
//
// Disconnected-write behavior: `send` fails with `NotConnected`, no
// auto-connect. Line settings are fixed at construction, so a second
// `connect` on an open port is a no-op.

use super::Transport;
use crate::error::{StreamError, StreamResult};
use crate::queue::ByteSink;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio_serial::{DataBits, Parity, SerialPortBuilderExt, SerialStream, StopBits};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const READ_BUFFER_SIZE: usize = 4096;

pub struct SerialTransport {
    port_name: String,
    baud_rate: u32,
    data_bits: DataBits,
    stop_bits: StopBits,
    parity: Parity,
    sink: ByteSink,
    writer: Option<WriteHalf<SerialStream>>,
    connected: Arc<AtomicBool>,
    conn_cancel: CancellationToken,
}

impl SerialTransport {
    pub fn new(
        port_name: String,
        baud_rate: u32,
        data_bits: Option<u8>,
        stop_bits: Option<u8>,
        parity: Option<String>,
        sink: ByteSink,
    ) -> StreamResult<Self> {
        let data_bits = match data_bits.unwrap_or(8) {
            5 => DataBits::Five,
            6 => DataBits::Six,
            7 => DataBits::Seven,
            8 => DataBits::Eight,
            n => return Err(StreamError::Serial(format!("unsupported data bits: {}", n))),
        };
        let stop_bits = match stop_bits.unwrap_or(1) {
            1 => StopBits::One,
            2 => StopBits::Two,
            n => return Err(StreamError::Serial(format!("unsupported stop bits: {}", n))),
        };
        let parity = match parity.as_deref().unwrap_or("none") {
            "none" => Parity::None,
            "even" => Parity::Even,
            "odd" => Parity::Odd,
            p => return Err(StreamError::Serial(format!("unsupported parity: {}", p))),
        };

        Ok(Self {
            port_name,
            baud_rate,
            data_bits,
            stop_bits,
            parity,
            sink,
            writer: None,
            connected: Arc::new(AtomicBool::new(false)),
            conn_cancel: CancellationToken::new(),
        })
    }

    fn spawn_reader(&mut self, mut reader: ReadHalf<SerialStream>, cancel: CancellationToken) {
        let sink = self.sink.clone();
        let connected = Arc::clone(&self.connected);
        tokio::spawn(async move {
            let mut buf = [0u8; READ_BUFFER_SIZE];
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    res = reader.read(&mut buf) => match res {
                        Ok(0) => {
                            warn!("serial port closed unexpectedly");
                            break;
                        }
                        Ok(n) => sink.extend(&buf[..n]),
                        Err(e) => {
                            error!("serial read error: {}", e);
                            break;
                        }
                    },
                }
            }
            connected.store(false, Ordering::SeqCst);
        });
    }
}

#[async_trait]
impl Transport for SerialTransport {
    fn name(&self) -> &'static str {
        "serial"
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn connect(&mut self) -> StreamResult<()> {
        if self.is_connected() {
            return Ok(());
        }

        info!(
            "opening serial port {} at {} baud",
            self.port_name, self.baud_rate
        );

        let port = tokio_serial::new(&self.port_name, self.baud_rate)
            .data_bits(self.data_bits)
            .stop_bits(self.stop_bits)
            .parity(self.parity)
            .open_native_async()
            .map_err(|e| StreamError::Serial(format!("failed to open port: {}", e)))?;

        let (reader, writer) = tokio::io::split(port);
        self.writer = Some(writer);
        self.connected.store(true, Ordering::SeqCst);

        let cancel = CancellationToken::new();
        self.conn_cancel = cancel.clone();
        self.spawn_reader(reader, cancel);

        info!("serial port opened");
        Ok(())
    }

    async fn close(&mut self) -> StreamResult<()> {
        self.conn_cancel.cancel();
        self.writer = None;
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn send(&mut self, data: &[u8]) -> StreamResult<()> {
        if !self.is_connected() {
            return Err(StreamError::NotConnected);
        }

        debug!("serial send {} bytes: {}", data.len(), hex::encode(data));

        let writer = self.writer.as_mut().ok_or(StreamError::NotConnected)?;
        if let Err(e) = writer.write_all(data).await {
            self.connected.store(false, Ordering::SeqCst);
            return Err(StreamError::Serial(format!("serial send failed: {}", e)));
        }
        Ok(())
    }
}

impl Drop for SerialTransport {
    fn drop(&mut self) {
        self.conn_cancel.cancel();
    }
}
