//! Socket I/O for Stratum connections.
//!
//! Each connection gets one tokio task that dials the server (plain TCP or
//! TLS), forwards every chunk it reads to the orchestrator and writes every
//! line the orchestrator hands it. The task knows nothing about JSON; all
//! protocol work happens in [`StratumConnection`] on the orchestrator task.
//!
//! [`StratumConnection`]: crate::streaming::electrum::connection::StratumConnection

use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio_native_tls::TlsConnector;

use crate::error::StratumError;
use crate::streaming::electrum::connection::{Endpoint, Scheme};

/// Identifies one socket session. A URI that reconnects gets a fresh id,
/// so late events from a dead socket can be told apart.
pub type ConnId = u64;

/// Events flowing from socket tasks to the orchestrator.
#[derive(Debug)]
pub enum SocketEvent {
    Connected { conn_id: ConnId },
    Data { conn_id: ConnId, data: Bytes },
    Closed { conn_id: ConnId, error: Option<StratumError> },
}

impl SocketEvent {
    pub fn conn_id(&self) -> ConnId {
        match self {
            SocketEvent::Connected { conn_id }
            | SocketEvent::Data { conn_id, .. }
            | SocketEvent::Closed { conn_id, .. } => *conn_id,
        }
    }
}

/// Opens sockets on behalf of the orchestrator.
///
/// Dropping the returned sender asks the socket task to shut down.
pub trait Connector {
    fn connect(
        &self,
        conn_id: ConnId,
        endpoint: Endpoint,
        events: UnboundedSender<SocketEvent>,
    ) -> UnboundedSender<String>;
}

/// Real network connector.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    connect_timeout: Duration,
}

impl TcpConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Connector for TcpConnector {
    fn connect(
        &self,
        conn_id: ConnId,
        endpoint: Endpoint,
        events: UnboundedSender<SocketEvent>,
    ) -> UnboundedSender<String> {
        let (tx, rx) = mpsc::unbounded_channel();
        let connect_timeout = self.connect_timeout;

        tokio::spawn(async move {
            let result = run_socket(conn_id, &endpoint, connect_timeout, &events, rx).await;
            if let Err(e) = &result {
                log::debug!("[SOCKET] {}:{} ended: {}", endpoint.host, endpoint.port, e);
            }
            let _ = events.send(SocketEvent::Closed {
                conn_id,
                error: result.err(),
            });
        });

        tx
    }
}

async fn run_socket(
    conn_id: ConnId,
    endpoint: &Endpoint,
    connect_timeout: Duration,
    events: &UnboundedSender<SocketEvent>,
    outgoing: UnboundedReceiver<String>,
) -> Result<(), StratumError> {
    let dial = TcpStream::connect((endpoint.host.as_str(), endpoint.port));
    let tcp = tokio::time::timeout(connect_timeout, dial)
        .await
        .map_err(|_| StratumError::Timeout(connect_timeout))??;
    tcp.set_nodelay(true)?;

    match endpoint.scheme {
        Scheme::Plain => {
            log::debug!("[SOCKET] {}:{} tcp connected", endpoint.host, endpoint.port);
            pump(conn_id, tcp, events, outgoing).await
        }
        Scheme::Tls => {
            // Stratum servers overwhelmingly use self-signed certificates.
            // Their answers are cross-checked, not trusted.
            let connector = native_tls::TlsConnector::builder()
                .danger_accept_invalid_certs(true)
                .danger_accept_invalid_hostnames(true)
                .build()?;
            let connector = TlsConnector::from(connector);
            let handshake = connector.connect(&endpoint.host, tcp);
            let tls = tokio::time::timeout(connect_timeout, handshake)
                .await
                .map_err(|_| StratumError::Timeout(connect_timeout))??;
            log::debug!("[SOCKET] {}:{} tls connected", endpoint.host, endpoint.port);
            pump(conn_id, tls, events, outgoing).await
        }
    }
}

/// Shovels bytes both ways until either side gives up.
async fn pump<S>(
    conn_id: ConnId,
    stream: S,
    events: &UnboundedSender<SocketEvent>,
    mut outgoing: UnboundedReceiver<String>,
) -> Result<(), StratumError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if events.send(SocketEvent::Connected { conn_id }).is_err() {
        return Ok(());
    }

    let (mut reader, mut writer) = tokio::io::split(stream);
    let mut buf = BytesMut::with_capacity(16 * 1024);

    loop {
        tokio::select! {
            read = reader.read_buf(&mut buf) => {
                if read? == 0 {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "server closed the connection",
                    )
                    .into());
                }
                let data = buf.split().freeze();
                if events.send(SocketEvent::Data { conn_id, data }).is_err() {
                    return Ok(());
                }
            }
            line = outgoing.recv() => match line {
                Some(line) => {
                    writer.write_all(line.as_bytes()).await?;
                    writer.flush().await?;
                }
                None => {
                    let _ = writer.shutdown().await;
                    return Ok(());
                }
            }
        }
    }
}
