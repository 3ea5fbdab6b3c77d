//! Standalone topic-exchange broker
//!
//! The server side of the frame protocol spoken by [`TcpBroker`]. Exchanges
//! are declared implicitly on first use; every connection that subscribes
//! gets one exclusive queue. The broker holds no durable state: messages in
//! flight are lost when it restarts.

use super::memory::RoutingTable;
use super::tcp::{read_frame, write_frame, ClientFrame, ServerFrame};
use super::Delivery;
use crate::error::{Result, SyncError};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, info, trace};

/// A bound broker ready to accept clients
pub struct BrokerServer {
    listener: TcpListener,
    table: Arc<RoutingTable>,
}

impl BrokerServer {
    /// Bind the broker to an address
    pub async fn bind(addr: &str) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!(addr = %listener.local_addr()?, "broker listening");
        Ok(BrokerServer {
            listener,
            table: Arc::new(RoutingTable::default()),
        })
    }

    /// Address the broker is listening on
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept and serve clients until the task is cancelled
    pub async fn run(self) -> Result<()> {
        loop {
            let (stream, peer) = self.listener.accept().await?;
            let table = Arc::clone(&self.table);
            tokio::spawn(async move {
                if let Err(e) = serve_client(stream, table).await {
                    debug!(peer = %peer, error = %e, "client connection ended");
                }
            });
        }
    }
}

/// Bind and run a broker in one call
pub async fn run_broker(addr: &str) -> Result<()> {
    BrokerServer::bind(addr).await?.run().await
}

async fn serve_client(stream: TcpStream, table: Arc<RoutingTable>) -> Result<()> {
    let (mut reader, writer) = stream.into_split();

    match read_frame::<_, ClientFrame>(&mut reader).await? {
        Some(ClientFrame::Hello { user, .. }) => {
            trace!(user = %user, "client connected");
        }
        Some(_) => {
            return Err(SyncError::Protocol(
                "client spoke before saying hello".to_string(),
            ))
        }
        None => return Ok(()),
    }

    let (tx, rx) = mpsc::unbounded_channel();
    let writer_task = tokio::spawn(write_deliveries(writer, rx));
    let outcome = read_client_frames(&mut reader, table.as_ref(), &tx).await;
    writer_task.abort();
    outcome
}

async fn read_client_frames(
    reader: &mut OwnedReadHalf,
    table: &RoutingTable,
    tx: &mpsc::UnboundedSender<Delivery>,
) -> Result<()> {
    loop {
        match read_frame::<_, ClientFrame>(reader).await? {
            None => return Ok(()),
            Some(ClientFrame::Publish {
                exchange,
                routing_key,
                body,
            }) => table.route(&exchange, &routing_key, body),
            Some(ClientFrame::Subscribe { exchange, patterns }) => {
                table.bind(&exchange, &patterns, tx.clone());
            }
            Some(ClientFrame::Hello { .. }) => {}
        }
    }
}

async fn write_deliveries(
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<Delivery>,
) {
    while let Some(delivery) = rx.recv().await {
        if write_frame(&mut writer, &ServerFrame::Deliver(delivery))
            .await
            .is_err()
        {
            return;
        }
    }
}
