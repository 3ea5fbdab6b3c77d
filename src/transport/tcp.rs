//! TCP broker client
//!
//! Talks to the standalone `syncmesh-broker` over length-prefixed bincode
//! frames. One connection for publishing, one per subscription for
//! consuming. A failed publish reconnects once and retries; a broken
//! consume connection is rebuilt and re-subscribed in the background.

use super::{Broker, Delivery};
use crate::config::BrokerConfig;
use crate::error::{Result, SyncError};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, warn};

/// Frames keep whole serialized models, so allow plenty of headroom
const MAX_FRAME_BYTES: usize = 256 * 1024 * 1024;

/// Frames sent by clients
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) enum ClientFrame {
    /// Connection preamble carrying the credentials
    Hello { user: String, password: String },
    /// Bind the connection's exclusive queue to an exchange
    Subscribe {
        exchange: String,
        patterns: Vec<String>,
    },
    /// Publish a message
    Publish {
        exchange: String,
        routing_key: String,
        body: Vec<u8>,
    },
}

/// Frames sent by the broker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) enum ServerFrame {
    /// A message routed to this connection's queue
    Deliver(Delivery),
}

pub(crate) async fn write_frame<W, T>(writer: &mut W, frame: &T) -> Result<()>
where
    W: AsyncWriteExt + Unpin,
    T: Serialize,
{
    let bytes = bincode::serialize(frame)?;
    let len = bytes.len() as u32;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame; `None` means the peer closed the connection cleanly
pub(crate) async fn read_frame<R, T>(reader: &mut R) -> Result<Option<T>>
where
    R: AsyncReadExt + Unpin,
    T: DeserializeOwned,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_BYTES {
        return Err(SyncError::Protocol(format!(
            "frame of {len} bytes exceeds the frame limit"
        )));
    }
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    let frame = bincode::deserialize(&buf)
        .map_err(|e| SyncError::Protocol(format!("frame failed to decode: {e}")))?;
    Ok(Some(frame))
}

async fn open_connection(config: &BrokerConfig) -> Result<TcpStream> {
    let mut stream = TcpStream::connect((config.hostname.as_str(), config.port))
        .await
        .map_err(|e| {
            SyncError::Transport(format!(
                "broker connect to {}:{} failed: {e}",
                config.hostname, config.port
            ))
        })?;
    write_frame(
        &mut stream,
        &ClientFrame::Hello {
            user: config.user.clone(),
            password: config.password.clone(),
        },
    )
    .await?;
    Ok(stream)
}

async fn open_consumer(
    config: &BrokerConfig,
    exchange: &str,
    patterns: &[String],
) -> Result<TcpStream> {
    let mut stream = open_connection(config).await?;
    write_frame(
        &mut stream,
        &ClientFrame::Subscribe {
            exchange: exchange.to_string(),
            patterns: patterns.to_vec(),
        },
    )
    .await?;
    Ok(stream)
}

/// Broker client speaking the syncmesh frame protocol over TCP
pub struct TcpBroker {
    config: BrokerConfig,
    publisher: Mutex<Option<TcpStream>>,
}

impl TcpBroker {
    /// Create a client and establish the publisher connection
    pub async fn connect(config: BrokerConfig) -> Result<Self> {
        let stream = open_connection(&config).await?;
        debug!(host = %config.hostname, port = config.port, "publisher connection established");
        Ok(TcpBroker {
            config,
            publisher: Mutex::new(Some(stream)),
        })
    }
}

#[async_trait]
impl Broker for TcpBroker {
    async fn publish(&self, exchange: &str, routing_key: &str, body: Vec<u8>) -> Result<()> {
        let frame = ClientFrame::Publish {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            body,
        };
        let mut guard = self.publisher.lock().await;
        if let Some(stream) = guard.as_mut() {
            if write_frame(stream, &frame).await.is_ok() {
                return Ok(());
            }
            warn!("publish connection lost, reconnecting once");
            *guard = None;
        }
        // reconnect once and replay the publish
        let mut stream = open_connection(&self.config).await?;
        write_frame(&mut stream, &frame).await?;
        *guard = Some(stream);
        Ok(())
    }

    async fn subscribe(
        &self,
        exchange: &str,
        patterns: &[String],
    ) -> Result<mpsc::UnboundedReceiver<Delivery>> {
        let mut stream = open_consumer(&self.config, exchange, patterns).await?;
        let (tx, rx) = mpsc::unbounded_channel();
        let config = self.config.clone();
        let exchange = exchange.to_string();
        let patterns = patterns.to_vec();
        tokio::spawn(async move {
            loop {
                match read_frame::<_, ServerFrame>(&mut stream).await {
                    Ok(Some(ServerFrame::Deliver(delivery))) => {
                        if tx.send(delivery).is_err() {
                            return;
                        }
                    }
                    Ok(None) | Err(_) => {
                        warn!(exchange = %exchange, "consume connection lost, re-subscribing");
                        match open_consumer(&config, &exchange, &patterns).await {
                            Ok(rebuilt) => stream = rebuilt,
                            Err(e) => {
                                error!(error = %e, "could not rebuild consume connection");
                                return;
                            }
                        }
                    }
                }
            }
        });
        Ok(rx)
    }
}
