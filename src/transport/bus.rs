// Message-bus transport (ZeroMQ SUB/PUB)
//
// One subscribe topic feeds the inbound queue, one publish topic carries
// writes. Published messages are two frames: [topic, payload]. Inbound
// routing runs in a spawned task bound to the connect/close transitions,
// so a closed adapter can no longer deliver stale bytes.
//
// The underlying bus client sits behind the `BusClient` trait so
// interchangeable implementations (or an externally-owned client) can be
// selected once at construction. `teardown` disconnects the client only
// when the adapter owns it.
//
// Disconnected-write behavior: `send` fails with `NotConnected`.

use super::Transport;
use crate::error::{StreamError, StreamResult};
use crate::queue::ByteSink;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use zeromq::{PubSocket, Socket, SocketRecv, SocketSend, SubSocket, ZmqMessage};

/// A message-bus client: connect/close lifecycle, topic subscription that
/// routes inbound payload bytes into a [`ByteSink`], and topic publishing.
#[async_trait]
pub trait BusClient: Send + Sync {
    /// Client lifecycle state (not per-message socket health).
    fn is_connected(&self) -> bool;

    /// Open the client. Idempotent; recreates any resources released by a
    /// prior `unsubscribe`.
    async fn connect(&mut self) -> StreamResult<()>;

    /// Disconnect and release the client's own resources.
    async fn close(&mut self) -> StreamResult<()>;

    /// Subscribe to `topic` and push each delivered payload byte, in
    /// order, into `sink` until `unsubscribe`.
    async fn subscribe(&mut self, topic: &str, sink: ByteSink) -> StreamResult<()>;

    /// Stop the routing started by `subscribe`.
    async fn unsubscribe(&mut self, topic: &str) -> StreamResult<()>;

    /// Publish one payload on `topic`.
    async fn publish(&mut self, topic: &str, payload: &[u8]) -> StreamResult<()>;
}

/// [`BusClient`] over zeromq SUB/PUB sockets.
pub struct ZmqBusClient {
    sub_endpoint: String,
    pub_endpoint: String,
    sub_socket: Option<SubSocket>,
    pub_socket: Option<PubSocket>,
    sub_cancel: CancellationToken,
    routing: bool,
    connected: bool,
}

impl ZmqBusClient {
    pub fn new(sub_endpoint: String, pub_endpoint: String) -> Self {
        Self {
            sub_endpoint,
            pub_endpoint,
            sub_socket: None,
            pub_socket: None,
            sub_cancel: CancellationToken::new(),
            routing: false,
            connected: false,
        }
    }
}

#[async_trait]
impl BusClient for ZmqBusClient {
    fn is_connected(&self) -> bool {
        self.connected
    }

    async fn connect(&mut self) -> StreamResult<()> {
        if self.sub_socket.is_none() && !self.routing {
            let mut socket = SubSocket::new();
            socket
                .connect(&self.sub_endpoint)
                .await
                .map_err(|e| StreamError::Bus(format!("SUB connect error: {}", e)))?;
            self.sub_socket = Some(socket);
            info!("bus SUB socket connected to {}", self.sub_endpoint);
        }

        if self.pub_socket.is_none() {
            let mut socket = PubSocket::new();
            socket
                .connect(&self.pub_endpoint)
                .await
                .map_err(|e| StreamError::Bus(format!("PUB connect error: {}", e)))?;
            self.pub_socket = Some(socket);
            info!("bus PUB socket connected to {}", self.pub_endpoint);
        }

        self.connected = true;
        Ok(())
    }

    async fn close(&mut self) -> StreamResult<()> {
        self.sub_cancel.cancel();
        self.routing = false;
        self.sub_socket = None;
        self.pub_socket = None;
        self.connected = false;
        Ok(())
    }

    async fn subscribe(&mut self, topic: &str, sink: ByteSink) -> StreamResult<()> {
        let mut socket = self
            .sub_socket
            .take()
            .ok_or_else(|| StreamError::Bus("SUB socket not connected".to_string()))?;

        socket
            .subscribe(topic)
            .await
            .map_err(|e| StreamError::Bus(format!("subscribe error: {}", e)))?;

        let cancel = CancellationToken::new();
        self.sub_cancel = cancel.clone();
        self.routing = true;

        let topic = topic.to_string();
        tokio::spawn(async move {
            let mut error_count = 0u64;
            loop {
                let msg = tokio::select! {
                    _ = cancel.cancelled() => break,
                    res = socket.recv() => match res {
                        Ok(m) => m,
                        Err(e) => {
                            error_count += 1;
                            error!("bus receive error: {}", e);
                            if error_count > 100 {
                                error!("too many bus errors ({}), stopping routing", error_count);
                                break;
                            }
                            continue;
                        }
                    },
                };
                error_count = 0;

                // First frame is the topic (prefix-filtered by the SUB
                // socket; exact match enforced here), the rest is payload.
                let frames = msg.into_vec();
                let Some(recv_topic) = frames.first() else {
                    continue;
                };
                if recv_topic.as_ref() != topic.as_bytes() {
                    continue;
                }

                for frame in &frames[1..] {
                    debug!(
                        "bus received {} bytes on {}: {}",
                        frame.len(),
                        topic,
                        hex::encode(frame)
                    );
                    sink.extend(frame);
                }
            }
            info!("bus routing for topic {} stopped", topic);
        });

        Ok(())
    }

    async fn unsubscribe(&mut self, _topic: &str) -> StreamResult<()> {
        // Stops the routing task; the SUB socket it owns is dropped with
        // it and recreated on the next connect.
        self.sub_cancel.cancel();
        self.routing = false;
        Ok(())
    }

    async fn publish(&mut self, topic: &str, payload: &[u8]) -> StreamResult<()> {
        let socket = self.pub_socket.as_mut().ok_or(StreamError::NotConnected)?;

        let mut msg = ZmqMessage::from(topic.to_string());
        msg.push_back(payload.to_vec().into());

        socket
            .send(msg)
            .await
            .map_err(|e| StreamError::Bus(format!("publish error: {}", e)))
    }
}

/// Message-bus transport adapter.
pub struct BusTransport {
    client: Box<dyn BusClient>,
    sub_topic: String,
    pub_topic: String,
    sink: ByteSink,
    subscribed: bool,
    dispose_client: bool,
}

impl BusTransport {
    /// Adapter owning its own zeromq client; `teardown` disconnects it.
    pub fn owned(
        sub_endpoint: String,
        pub_endpoint: String,
        sub_topic: String,
        pub_topic: String,
        sink: ByteSink,
    ) -> Self {
        Self::with_client(
            Box::new(ZmqBusClient::new(sub_endpoint, pub_endpoint)),
            sub_topic,
            pub_topic,
            sink,
            true,
        )
    }

    /// Adapter over a caller-provided client. With `dispose_client` false
    /// the client is left connected on `teardown` (externally-owned mode).
    pub fn with_client(
        client: Box<dyn BusClient>,
        sub_topic: String,
        pub_topic: String,
        sink: ByteSink,
        dispose_client: bool,
    ) -> Self {
        Self {
            client,
            sub_topic,
            pub_topic,
            sink,
            subscribed: false,
            dispose_client,
        }
    }
}

#[async_trait]
impl Transport for BusTransport {
    fn name(&self) -> &'static str {
        "bus"
    }

    fn is_connected(&self) -> bool {
        self.client.is_connected()
    }

    async fn connect(&mut self) -> StreamResult<()> {
        self.client.connect().await?;

        if !self.subscribed {
            self.client
                .subscribe(&self.sub_topic, self.sink.clone())
                .await?;
            self.subscribed = true;
            info!("bus subscribed to {}", self.sub_topic);
        }

        Ok(())
    }

    async fn close(&mut self) -> StreamResult<()> {
        if self.subscribed {
            if let Err(e) = self.client.unsubscribe(&self.sub_topic).await {
                warn!("bus unsubscribe failed: {}", e);
            }
            self.subscribed = false;
        }
        Ok(())
    }

    async fn send(&mut self, data: &[u8]) -> StreamResult<()> {
        if !self.client.is_connected() {
            return Err(StreamError::NotConnected);
        }

        debug!(
            "bus publishing {} bytes to {}: {}",
            data.len(),
            self.pub_topic,
            hex::encode(data)
        );

        self.client.publish(&self.pub_topic, data).await
    }

    async fn teardown(&mut self) -> StreamResult<()> {
        self.close().await?;
        if self.dispose_client {
            self.client.close().await?;
        }
        Ok(())
    }
}
