//! Single-use TCP relay for handoff streams.
//!
//! A tunnel binds an ephemeral port, accepts exactly one client, connects to
//! the destination and relays bytes both ways. A client EOF half-closes the
//! destination and replies keep flowing; a destination EOF or error ends both
//! directions at once. The listener is dropped right after the accept,
//! releasing the port.

use std::io;
use std::net::{Ipv4Addr, SocketAddr};

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Bytes read per relay iteration.
const RELAY_CHUNK: usize = 32 * 1024;

/// Errors from tunnel operations.
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("Failed to bind local port: {0}")]
    Bind(#[source] io::Error),

    #[error("Failed to accept client: {0}")]
    Accept(#[source] io::Error),

    #[error("Failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("Tunnel task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Bytes moved in each direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TunnelStats {
    pub client_to_dest: u64,
    pub dest_to_client: u64,
}

type ClosedCallback = Box<dyn FnOnce() + Send + 'static>;

/// Builder for a forwarding tunnel.
pub struct PortForward {
    dest_ip: String,
    dest_port: u16,
    on_client_closed: ClosedCallback,
}

impl PortForward {
    pub fn new(dest_ip: impl Into<String>, dest_port: u16) -> Self {
        Self {
            dest_ip: dest_ip.into(),
            dest_port,
            on_client_closed: Box::new(|| info!("Port forwarding finished")),
        }
    }

    /// Run `callback` when the client closes its sending side.
    pub fn on_client_closed(mut self, callback: impl FnOnce() + Send + 'static) -> Self {
        self.on_client_closed = Box::new(callback);
        self
    }

    /// Bind an ephemeral port on all interfaces and start relaying in the background.
    pub async fn start(self) -> Result<TunnelHandle, TunnelError> {
        let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, 0))
            .await
            .map_err(TunnelError::Bind)?;
        let local_port = listener.local_addr().map_err(TunnelError::Bind)?.port();

        info!(
            local_port,
            dest = %format!("{}:{}", self.dest_ip, self.dest_port),
            "Port forwarding started"
        );

        let task = tokio::spawn(self.run(listener));
        Ok(TunnelHandle { local_port, task })
    }

    async fn run(self, listener: TcpListener) -> Result<TunnelStats, TunnelError> {
        let (client, peer) = listener.accept().await.map_err(TunnelError::Accept)?;
        drop(listener);
        debug!(peer = %peer, "Tunnel client connected");

        let addr = format!("{}:{}", self.dest_ip, self.dest_port);
        let dest = TcpStream::connect(addr.as_str())
            .await
            .map_err(|source| TunnelError::Connect {
                addr: addr.clone(),
                source,
            })?;

        let (client_read, client_write) = client.into_split();
        let (dest_read, dest_write) = dest.into_split();
        let on_client_closed = self.on_client_closed;

        let mut client_to_dest = 0u64;
        let mut dest_to_client = 0u64;
        let (upstream, downstream) = {
            let upstream_count = &mut client_to_dest;
            let upstream = async move {
                let result = relay(client_read, dest_write, upstream_count).await;
                if result.is_ok() {
                    on_client_closed();
                }
                result
            };
            let downstream = relay(dest_read, client_write, &mut dest_to_client);
            tokio::pin!(upstream, downstream);

            let mut upstream_result = None;
            let mut downstream_result = None;
            tokio::select! {
                up = &mut upstream => upstream_result = Some(up),
                down = &mut downstream => downstream_result = Some(down),
            }
            let downstream_result = match downstream_result {
                Some(result) => result,
                None => downstream.await,
            };
            (upstream_result, downstream_result)
        };

        match upstream {
            Some(result) => log_direction("client->dest", result),
            None => debug!(peer = %peer, "Destination closed, dropping client->dest relay"),
        }
        log_direction("dest->client", downstream);

        let stats = TunnelStats {
            client_to_dest,
            dest_to_client,
        };
        debug!(peer = %peer, dest = %addr, ?stats, "Tunnel closed");
        Ok(stats)
    }
}

fn log_direction(direction: &str, result: io::Result<()>) {
    if let Err(e) = result {
        warn!(direction, error = %e, "Tunnel relay ended with error");
    }
}

/// Copy until EOF, then close the write side of `dst`. `total` counts the bytes written.
async fn relay<R, W>(mut src: R, mut dst: W, total: &mut u64) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; RELAY_CHUNK];
    loop {
        let n = src.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        dst.write_all(&buf[..n]).await?;
        *total += n as u64;
    }
    // The peer may already be gone.
    let _ = dst.shutdown().await;
    Ok(())
}

/// A started tunnel.
#[derive(Debug)]
pub struct TunnelHandle {
    local_port: u16,
    task: JoinHandle<Result<TunnelStats, TunnelError>>,
}

impl TunnelHandle {
    /// Port the tunnel listens on.
    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    pub fn local_addr(&self) -> SocketAddr {
        SocketAddr::from((Ipv4Addr::LOCALHOST, self.local_port))
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for both relay directions to finish.
    pub async fn wait(self) -> Result<TunnelStats, TunnelError> {
        self.task.await?
    }

    /// Stop the tunnel without waiting for a client.
    pub fn abort(&self) {
        self.task.abort();
    }
}
