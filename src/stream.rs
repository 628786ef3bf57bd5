// Core stream engine
//
// `DeviceStream` binds one transport adapter to one inbound byte queue
// and layers the read discipline shared by every device link on top:
// timeout-bounded single/multi-byte reads, pattern-terminated reads, and
// the optional 7-bit line transform. Reads drain the queue; writes bypass
// it and go straight to the adapter.
//
// Concurrency model: any number of transport receive tasks push into the
// queue while at most one logical consumer executes a read. The transport
// handle lives behind an async mutex so connect/close/write transitions
// serialize; interleaving of concurrent reads on one stream is undefined
// and unsupported.

use crate::encoding::{add_parity_in_place, strip_parity, Parity};
use crate::error::{StreamError, StreamResult};
use crate::queue::{ByteQueue, ByteSink};
use crate::transport::{create_transport, Transport, TransportConfig};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex as TokioMutex;
use tokio::time::{timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Initial capacity of a pattern read's accumulation buffer; grows by
/// doubling from here.
const READ_UNTIL_INITIAL_CAPACITY: usize = 256;

/// Stream construction options.
#[derive(Debug, Clone)]
pub struct StreamOptions {
    /// Deadline applied to every read; mutable later via
    /// [`DeviceStream::set_operation_timeout`].
    pub operation_timeout: Duration,
    /// Run the 7-bit line transform on every inbound and outbound byte.
    /// Fixed for the life of the stream.
    pub use_7e1: bool,
    /// Parity marker for outbound bytes when `use_7e1` is set. The
    /// default `None` clears the high bit; `Even` reproduces classic 7E1
    /// framing.
    pub write_parity: Parity,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            operation_timeout: Duration::from_millis(7000),
            use_7e1: false,
            write_parity: Parity::None,
        }
    }
}

/// One logical device connection: a transport adapter plus the shared
/// read/write engine.
///
/// Reads are cooperative suspensions bounded by the operation timeout and
/// an optional [`CancellationToken`]; cancellation and deadline expiry
/// are indistinguishable to the caller. A failed read never returns
/// partial data.
pub struct DeviceStream {
    transport: TokioMutex<Box<dyn Transport>>,
    queue: Arc<ByteQueue>,
    operation_timeout: RwLock<Duration>,
    use_7e1: bool,
    write_parity: Parity,
    closed: AtomicBool,
}

impl DeviceStream {
    /// Build a stream over one of the built-in transports.
    pub fn new(config: TransportConfig, options: StreamOptions) -> StreamResult<Self> {
        let queue = Arc::new(ByteQueue::new());
        let transport = create_transport(config, queue.sink())?;
        Ok(Self::assemble(transport, queue, options))
    }

    /// Build a stream over a custom transport. The closure receives the
    /// push capability the adapter must feed inbound bytes into.
    pub fn with_transport<F>(make_transport: F, options: StreamOptions) -> Self
    where
        F: FnOnce(ByteSink) -> Box<dyn Transport>,
    {
        let queue = Arc::new(ByteQueue::new());
        let transport = make_transport(queue.sink());
        Self::assemble(transport, queue, options)
    }

    fn assemble(
        transport: Box<dyn Transport>,
        queue: Arc<ByteQueue>,
        options: StreamOptions,
    ) -> Self {
        Self {
            transport: TokioMutex::new(transport),
            queue,
            operation_timeout: RwLock::new(options.operation_timeout),
            use_7e1: options.use_7e1,
            write_parity: options.write_parity,
            closed: AtomicBool::new(false),
        }
    }

    // ---------------------------------------------------------------
    // configuration
    // ---------------------------------------------------------------

    /// Timeout applied to reads started after this call returns; reads
    /// already in progress keep their original deadline.
    pub fn operation_timeout(&self) -> Duration {
        *self.operation_timeout.read()
    }

    pub fn set_operation_timeout(&self, timeout: Duration) {
        *self.operation_timeout.write() = timeout;
    }

    /// Whether the 7-bit line transform is active.
    pub fn use_7e1(&self) -> bool {
        self.use_7e1
    }

    // ---------------------------------------------------------------
    // lifecycle
    // ---------------------------------------------------------------

    /// Open the transport. Idempotency while already connected is
    /// adapter-defined (all built-in adapters treat it as a no-op).
    pub async fn connect(&self) -> StreamResult<()> {
        self.ensure_open()?;
        self.transport.lock().await.connect().await
    }

    /// Close the transport. Bytes already queued inbound survive; call
    /// [`flush`](Self::flush) to discard them.
    pub async fn close(&self) -> StreamResult<()> {
        self.transport.lock().await.close().await
    }

    /// Live connectivity of the transport; queried, never cached.
    pub async fn is_connected(&self) -> bool {
        self.transport.lock().await.is_connected()
    }

    /// Adapter name for diagnostics.
    pub async fn transport_name(&self) -> &'static str {
        self.transport.lock().await.name()
    }

    /// Non-blocking probe: is at least one inbound byte queued?
    pub fn available(&self) -> bool {
        self.queue.try_peek().is_some()
    }

    /// Discard all currently queued inbound bytes, in any state.
    pub fn flush(&self) {
        self.queue.flush();
    }

    /// Terminal teardown: release the transport (honoring externally-
    /// owned-client modes) and close the queue. Every later operation
    /// fails with [`StreamError::Closed`].
    pub async fn shutdown(&self) -> StreamResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        let result = self.transport.lock().await.teardown().await;
        self.queue.close();
        result
    }

    fn ensure_open(&self) -> StreamResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StreamError::Closed);
        }
        Ok(())
    }

    // ---------------------------------------------------------------
    // writes
    // ---------------------------------------------------------------

    /// Deliver a byte buffer to the medium, transformed first when 7-bit
    /// mode is on. Bypasses the inbound queue entirely. Behavior while
    /// disconnected is adapter-defined (TCP auto-connects; serial and bus
    /// fail with a typed error). Transport failures are returned, never
    /// swallowed.
    pub async fn write(&self, data: &[u8]) -> StreamResult<()> {
        self.ensure_open()?;
        let mut transport = self.transport.lock().await;
        if self.use_7e1 {
            let mut buf = data.to_vec();
            add_parity_in_place(&mut buf, self.write_parity);
            transport.send(&buf).await
        } else {
            transport.send(data).await
        }
    }

    // ---------------------------------------------------------------
    // reads
    // ---------------------------------------------------------------

    /// Read one byte under the operation timeout.
    pub async fn read_byte(&self) -> StreamResult<u8> {
        self.read_byte_with(&CancellationToken::new()).await
    }

    /// Read one byte; `cancel` aborts the wait early and surfaces as the
    /// same timeout error.
    pub async fn read_byte_with(&self, cancel: &CancellationToken) -> StreamResult<u8> {
        let deadline = Instant::now() + self.operation_timeout();
        self.pop_byte(deadline, cancel).await
    }

    /// Read exactly `n` bytes under one shared operation-timeout deadline.
    ///
    /// `n == 0` resolves immediately without touching the queue. On
    /// timeout with `k < n` bytes collected the partial data is discarded
    /// and the error reports `k` of `n`.
    pub async fn read_exact(&self, n: usize) -> StreamResult<Vec<u8>> {
        self.read_exact_with(n, &CancellationToken::new()).await
    }

    pub async fn read_exact_with(
        &self,
        n: usize,
        cancel: &CancellationToken,
    ) -> StreamResult<Vec<u8>> {
        if n == 0 {
            return Ok(Vec::new());
        }

        let deadline = Instant::now() + self.operation_timeout();

        // Single byte: skip the accumulation loop.
        if n == 1 {
            return Ok(vec![self.pop_byte(deadline, cancel).await?]);
        }

        let mut out = Vec::with_capacity(n);
        while out.len() < n {
            // The deadline is shared by the whole request, never re-armed
            // per byte: a producer stalling after a partial frame is an
            // error, not a reason to hand back a truncated frame.
            match self.pop_byte(deadline, cancel).await {
                Ok(byte) => out.push(byte),
                Err(e) if e.is_timeout() => {
                    return Err(StreamError::Timeout {
                        received: out.len(),
                        requested: n,
                    });
                }
                Err(e) => return Err(e),
            }
        }
        Ok(out)
    }

    /// Read until `pattern` appears as a suffix of the accumulated data,
    /// under the operation timeout. Returns everything read, matched
    /// suffix included; bytes beyond the match stay queued.
    ///
    /// The suffix matcher uses a simplified restart rule (reset to the
    /// pattern head on a miss) rather than a full KMP failure function.
    /// It is exact for the non-self-overlapping delimiters device
    /// protocols use (CR/LF, ETX, single status bytes) but can under-match
    /// when the pattern's prefix overlaps its own suffix: pattern `AAB`
    /// never matches inside input `AAAB`.
    pub async fn read_until(&self, pattern: &[u8]) -> StreamResult<Vec<u8>> {
        self.read_until_with(pattern, self.operation_timeout(), &CancellationToken::new())
            .await
    }

    /// Read until a single delimiter byte.
    pub async fn read_until_byte(&self, delimiter: u8) -> StreamResult<Vec<u8>> {
        self.read_until(&[delimiter]).await
    }

    /// Read until a single delimiter character (UTF-8 encoded).
    pub async fn read_until_char(&self, delimiter: char) -> StreamResult<Vec<u8>> {
        let mut buf = [0u8; 4];
        self.read_until(delimiter.encode_utf8(&mut buf).as_bytes())
            .await
    }

    /// Read until a text delimiter.
    pub async fn read_until_str(&self, delimiter: &str) -> StreamResult<Vec<u8>> {
        self.read_until(delimiter.as_bytes()).await
    }

    /// Pattern read with an explicit timeout covering the entire scan and
    /// a cancellation token. Each byte wait re-arms against the same
    /// per-call deadline.
    pub async fn read_until_with(
        &self,
        pattern: &[u8],
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> StreamResult<Vec<u8>> {
        if pattern.is_empty() {
            return Err(StreamError::EmptyPattern);
        }

        let deadline = Instant::now() + timeout;
        let mut out = Vec::with_capacity(READ_UNTIL_INITIAL_CAPACITY);
        let mut matched = 0usize;

        loop {
            let byte = match self.pop_byte(deadline, cancel).await {
                Ok(byte) => byte,
                Err(e) if e.is_timeout() => {
                    // Consumed bytes are lost, not re-queued.
                    return Err(StreamError::PatternTimeout(out.len()));
                }
                Err(e) => return Err(e),
            };

            out.push(byte);

            if byte == pattern[matched] {
                matched += 1;
                if matched == pattern.len() {
                    debug!("pattern matched after {} bytes", out.len());
                    return Ok(out);
                }
            } else {
                matched = if byte == pattern[0] { 1 } else { 0 };
            }
        }
    }

    /// Pop one byte from the queue under `deadline`, racing cancellation,
    /// and run the inbound transform on it.
    async fn pop_byte(&self, deadline: Instant, cancel: &CancellationToken) -> StreamResult<u8> {
        let popped = tokio::select! {
            _ = cancel.cancelled() => {
                return Err(StreamError::Timeout { received: 0, requested: 1 });
            }
            res = timeout_at(deadline, self.queue.pop()) => res,
        };

        match popped {
            Ok(Ok(byte)) => Ok(if self.use_7e1 {
                strip_parity(byte)
            } else {
                byte
            }),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(StreamError::Timeout {
                received: 0,
                requested: 1,
            }),
        }
    }

    // ---------------------------------------------------------------
    // blocking forms
    // ---------------------------------------------------------------
    //
    // Each runs its async counterpart to completion on the calling
    // context. They must be called from sync code inside a multi-thread
    // tokio runtime (e.g. a spawn_blocking closure).

    pub fn connect_blocking(&self) -> StreamResult<()> {
        block_on(self.connect())
    }

    pub fn close_blocking(&self) -> StreamResult<()> {
        block_on(self.close())
    }

    pub fn write_blocking(&self, data: &[u8]) -> StreamResult<()> {
        block_on(self.write(data))
    }

    pub fn read_byte_blocking(&self) -> StreamResult<u8> {
        block_on(self.read_byte())
    }

    pub fn read_exact_blocking(&self, n: usize) -> StreamResult<Vec<u8>> {
        block_on(self.read_exact(n))
    }

    pub fn read_until_blocking(&self, pattern: &[u8]) -> StreamResult<Vec<u8>> {
        block_on(self.read_until(pattern))
    }
}

impl Drop for DeviceStream {
    fn drop(&mut self) {
        // Wakes any producer-less consumer and turns later pushes into
        // no-ops; transport teardown is shutdown()'s job.
        self.queue.close();
    }
}

fn block_on<F: std::future::Future>(future: F) -> F::Output {
    tokio::task::block_in_place(|| tokio::runtime::Handle::current().block_on(future))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemTransport;
    use parking_lot::Mutex;
    use std::sync::Arc;

    type Outbox = Arc<Mutex<Vec<Vec<u8>>>>;

    fn mem_stream(options: StreamOptions, echo: bool) -> (DeviceStream, ByteSink, Outbox) {
        let mut feeder = None;
        let mut outbox = None;
        let stream = DeviceStream::with_transport(
            |sink| {
                let transport = MemTransport::new(sink.clone(), echo);
                outbox = Some(transport.outbox());
                feeder = Some(sink);
                Box::new(transport)
            },
            options,
        );
        (stream, feeder.unwrap(), outbox.unwrap())
    }

    fn short_timeout() -> StreamOptions {
        StreamOptions {
            operation_timeout: Duration::from_millis(50),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_read_byte_returns_pushed_byte() {
        let (stream, feeder, _) = mem_stream(StreamOptions::default(), false);
        feeder.push(0x42);
        assert_eq!(stream.read_byte().await.unwrap(), 0x42);
    }

    #[tokio::test]
    async fn test_read_byte_times_out_with_progress_context() {
        let (stream, _feeder, _) = mem_stream(short_timeout(), false);
        match stream.read_byte().await {
            Err(StreamError::Timeout {
                received: 0,
                requested: 1,
            }) => {}
            other => panic!("expected timeout, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_read_exact_zero_returns_immediately() {
        // Zero-length reads resolve instantly even with nothing queued.
        let (stream, _feeder, _) = mem_stream(short_timeout(), false);
        assert_eq!(stream.read_exact(0).await.unwrap(), Vec::<u8>::new());
    }

    #[tokio::test]
    async fn test_read_exact_returns_bytes_in_order() {
        let (stream, feeder, _) = mem_stream(StreamOptions::default(), false);
        feeder.extend(&[1, 2, 3, 4, 5]);
        assert_eq!(stream.read_exact(1).await.unwrap(), vec![1]);
        assert_eq!(stream.read_exact(4).await.unwrap(), vec![2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn test_read_exact_partial_times_out_and_discards() {
        let (stream, feeder, _) = mem_stream(short_timeout(), false);
        feeder.extend(&[0xAA, 0xBB, 0xCC]);
        match stream.read_exact(5).await {
            Err(StreamError::Timeout {
                received: 3,
                requested: 5,
            }) => {}
            other => panic!("expected 3/5 timeout, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_read_until_crlf_leaves_remainder_queued() {
        let (stream, feeder, _) = mem_stream(StreamOptions::default(), false);
        feeder.extend(b"OK\r\nextra");

        let framed = stream.read_until(&[0x0D, 0x0A]).await.unwrap();
        assert_eq!(framed, b"OK\r\n");

        assert!(stream.available());
        assert_eq!(stream.read_exact(5).await.unwrap(), b"extra");
    }

    #[tokio::test]
    async fn test_read_until_single_byte_pattern_returns_everything() {
        let (stream, feeder, _) = mem_stream(StreamOptions::default(), false);
        feeder.extend(&[0x01, 0x02, 0x03]);
        assert_eq!(
            stream.read_until_byte(0x03).await.unwrap(),
            vec![0x01, 0x02, 0x03]
        );
    }

    #[tokio::test]
    async fn test_read_until_str_and_char_variants() {
        let (stream, feeder, _) = mem_stream(StreamOptions::default(), false);
        feeder.extend(b"220 ready\r\n> ");
        assert_eq!(stream.read_until_str("\r\n").await.unwrap(), b"220 ready\r\n");
        assert_eq!(stream.read_until_char('>').await.unwrap(), b">");
    }

    #[tokio::test]
    async fn test_read_until_rejects_empty_pattern_before_reading() {
        let (stream, feeder, _) = mem_stream(StreamOptions::default(), false);
        feeder.extend(b"data");
        assert!(matches!(
            stream.read_until(&[]).await,
            Err(StreamError::EmptyPattern)
        ));
        // Queue untouched.
        assert_eq!(stream.read_exact(4).await.unwrap(), b"data");
    }

    #[tokio::test]
    async fn test_read_until_timeout_reports_consumed_count() {
        let (stream, feeder, _) = mem_stream(short_timeout(), false);
        feeder.extend(b"no delimiter here");
        match stream.read_until_byte(0x0A).await {
            Err(StreamError::PatternTimeout(17)) => {}
            other => panic!("expected pattern timeout after 17 bytes, got {:?}", other),
        }
        // Consumed bytes are lost, not re-queued.
        assert!(!stream.available());
    }

    #[tokio::test]
    async fn test_read_until_self_overlapping_pattern_is_not_matched() {
        // Pins the simplified restart rule: pattern AAB over input AAAB
        // under-matches (see read_until docs), so the read times out
        // having consumed all four bytes.
        let (stream, feeder, _) = mem_stream(short_timeout(), false);
        feeder.extend(b"AAAB");
        match stream.read_until(b"AAB").await {
            Err(StreamError::PatternTimeout(4)) => {}
            other => panic!("expected pattern timeout after 4 bytes, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_cancellation_surfaces_as_timeout() {
        let (stream, _feeder, _) = mem_stream(
            StreamOptions {
                operation_timeout: Duration::from_secs(60),
                ..Default::default()
            },
            false,
        );

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });

        let err = stream.read_byte_with(&cancel).await.unwrap_err();
        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn test_operation_timeout_is_consulted_per_read() {
        let (stream, feeder, _) = mem_stream(StreamOptions::default(), false);
        stream.set_operation_timeout(Duration::from_millis(20));
        assert!(stream.read_byte().await.unwrap_err().is_timeout());

        feeder.push(0x55);
        assert_eq!(stream.read_byte().await.unwrap(), 0x55);
    }

    #[tokio::test]
    async fn test_flush_discards_queued_inbound_bytes() {
        let (stream, feeder, _) = mem_stream(StreamOptions::default(), false);
        feeder.extend(&[0u8; 10]);
        assert!(stream.available());
        stream.flush();
        assert!(!stream.available());
    }

    #[tokio::test]
    async fn test_write_7e1_default_marker_clears_high_bit() {
        let (stream, _feeder, outbox) = mem_stream(
            StreamOptions {
                use_7e1: true,
                ..Default::default()
            },
            false,
        );
        stream.connect().await.unwrap();
        stream.write(&[0xFF]).await.unwrap();
        assert_eq!(outbox.lock().as_slice(), [vec![0x7F]]);
    }

    #[tokio::test]
    async fn test_write_without_transform_passes_through() {
        let (stream, _feeder, outbox) = mem_stream(StreamOptions::default(), false);
        stream.connect().await.unwrap();
        stream.write(&[0xFF]).await.unwrap();
        assert_eq!(outbox.lock().as_slice(), [vec![0xFF]]);
    }

    #[tokio::test]
    async fn test_write_7e1_even_marker_sets_parity_bit() {
        let (stream, _feeder, outbox) = mem_stream(
            StreamOptions {
                use_7e1: true,
                write_parity: Parity::Even,
                ..Default::default()
            },
            false,
        );
        stream.connect().await.unwrap();
        stream.write(&[0x41, 0x01]).await.unwrap();
        // 'A' already has an even bit count; 0x01 gains the parity bit.
        assert_eq!(outbox.lock().as_slice(), [vec![0x41, 0x81]]);
    }

    #[tokio::test]
    async fn test_loopback_roundtrip_with_7e1_on_both_ends() {
        let (stream, _feeder, _) = mem_stream(
            StreamOptions {
                use_7e1: true,
                ..Default::default()
            },
            true,
        );
        stream.connect().await.unwrap();
        stream.write(b"SALE 10.00\r").await.unwrap();
        assert_eq!(stream.read_exact(11).await.unwrap(), b"SALE 10.00\r");
    }

    #[tokio::test]
    async fn test_reads_strip_parity_when_7e1_enabled() {
        let (stream, feeder, _) = mem_stream(
            StreamOptions {
                use_7e1: true,
                ..Default::default()
            },
            false,
        );
        // Peer sends with even parity; 'C' = 0x43 has 3 set bits.
        feeder.extend(&[0xC3, 0x41]);
        assert_eq!(stream.read_exact(2).await.unwrap(), b"CA");
    }

    #[tokio::test]
    async fn test_shutdown_is_terminal() {
        let (stream, feeder, _) = mem_stream(short_timeout(), false);
        stream.connect().await.unwrap();
        stream.shutdown().await.unwrap();

        assert!(matches!(stream.read_byte().await, Err(StreamError::Closed)));
        assert!(matches!(stream.write(b"x").await, Err(StreamError::Closed)));
        assert!(matches!(stream.connect().await, Err(StreamError::Closed)));

        // Producer pushes after teardown are silently dropped.
        feeder.push(0x01);
        assert!(!stream.available());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_blocking_forms_run_to_completion() {
        let (stream, feeder, outbox) = mem_stream(StreamOptions::default(), false);
        feeder.extend(b"ACK");

        let result = tokio::task::spawn_blocking(move || {
            stream.connect_blocking()?;
            stream.write_blocking(b"ping")?;
            let bytes = stream.read_exact_blocking(3)?;
            stream.close_blocking()?;
            Ok::<_, StreamError>(bytes)
        })
        .await
        .unwrap()
        .unwrap();

        assert_eq!(result, b"ACK");
        assert_eq!(outbox.lock().as_slice(), [b"ping".to_vec()]);
    }
}
