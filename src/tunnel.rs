//! Bidirectional byte tunnel between a client and the backend

use crate::error::TunnelError;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

/// Bytes read per chunk in each direction
pub const PIPE_BUFFER_SIZE: usize = 2048;

/// Default bound on opening the backend connection
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(20);

/// Which direction of a tunnel finished first
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ClientToBackend,
    BackendToClient,
}

/// Outcome of a tunnel that ended without an I/O error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TunnelStats {
    /// Direction whose source reached EOF first
    pub finished: Direction,
    /// Bytes copied in that direction
    pub bytes: u64,
}

/// Copy from `reader` to `writer` until EOF.
///
/// Each chunk is written and flushed before the next read, so a slow destination
/// throttles the source. The writer is shut down when the copy ends, cleanly or not.
pub async fn pipe<R, W>(mut reader: R, mut writer: W) -> std::io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = [0u8; PIPE_BUFFER_SIZE];
    let mut total = 0u64;

    let result: std::io::Result<u64> = async {
        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                return Ok(total);
            }
            writer.write_all(&buf[..n]).await?;
            writer.flush().await?;
            total += n as u64;
        }
    }
    .await;

    let _ = writer.shutdown().await;
    result
}

/// Connect to the backend at `host:port`, bounded by `connect_timeout`
pub async fn connect_backend(
    host: &str,
    port: u16,
    connect_timeout: Duration,
) -> Result<TcpStream, TunnelError> {
    let addr = format!("{}:{}", host, port);
    match tokio::time::timeout(connect_timeout, TcpStream::connect(&addr)).await {
        Ok(Ok(stream)) => {
            let _ = stream.set_nodelay(true);
            Ok(stream)
        }
        Ok(Err(source)) => Err(TunnelError::Connect { addr, source }),
        Err(_) => Err(TunnelError::ConnectTimeout {
            addr,
            timeout: connect_timeout,
        }),
    }
}

/// Stream `client` through to the backend until either side closes.
///
/// The first direction to finish tears the whole tunnel down: both sockets are dropped,
/// which ends the other direction as well. The client connection is always closed when
/// this returns.
pub async fn proxy(
    client: TcpStream,
    host: &str,
    port: u16,
    connect_timeout: Duration,
) -> Result<TunnelStats, TunnelError> {
    let backend = match connect_backend(host, port, connect_timeout).await {
        Ok(stream) => stream,
        Err(e) => {
            drop(client);
            return Err(e);
        }
    };

    splice(client, backend).await
}

/// Run both pipes between two already connected streams
pub async fn splice(client: TcpStream, backend: TcpStream) -> Result<TunnelStats, TunnelError> {
    let (client_read, client_write) = client.into_split();
    let (backend_read, backend_write) = backend.into_split();

    let upstream = pipe(client_read, backend_write);
    let downstream = pipe(backend_read, client_write);

    let (finished, result) = tokio::select! {
        r = upstream => (Direction::ClientToBackend, r),
        r = downstream => (Direction::BackendToClient, r),
    };

    match result {
        Ok(bytes) => {
            debug!(?finished, bytes, "Tunnel closed");
            Ok(TunnelStats { finished, bytes })
        }
        Err(e) => {
            debug!(?finished, error = %e, "Tunnel closed with error");
            Err(TunnelError::Io(e))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn echo_server() -> (u16, tokio::task::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let (mut r, mut w) = stream.split();
                    let _ = tokio::io::copy(&mut r, &mut w).await;
                });
            }
        });
        (port, handle)
    }

    /// Returns a connected (client side, proxy side) pair
    async fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (client.unwrap(), accepted.unwrap().0)
    }

    #[tokio::test]
    async fn test_pipe_copies_until_eof() {
        let (mut tx, rx) = tokio::io::duplex(64);
        let (out, mut out_rx) = tokio::io::duplex(8192);

        let data: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
        let expected = data.clone();

        let writer = tokio::spawn(async move {
            tx.write_all(&data).await.unwrap();
        });

        let copied = pipe(rx, out).await.unwrap();
        writer.await.unwrap();
        assert_eq!(copied, 5000);

        let mut received = Vec::new();
        out_rx.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, expected);
    }

    #[tokio::test]
    async fn test_pipe_shuts_down_writer_on_eof() {
        let (tx, rx) = tokio::io::duplex(64);
        let (out, mut out_rx) = tokio::io::duplex(64);
        drop(tx);

        assert_eq!(pipe(rx, out).await.unwrap(), 0);

        let mut buf = [0u8; 8];
        assert_eq!(out_rx.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_proxy_round_trip() {
        let (port, _server) = echo_server().await;
        let (mut client, proxied) = socket_pair().await;

        let tunnel = tokio::spawn(async move {
            proxy(proxied, "127.0.0.1", port, DEFAULT_CONNECT_TIMEOUT).await
        });

        for message in [&b"PING\n"[..], b"second message", &[0u8, 255, 1, 254]] {
            client.write_all(message).await.unwrap();
            let mut buf = vec![0u8; message.len()];
            client.read_exact(&mut buf).await.unwrap();
            assert_eq!(buf, message);
        }

        drop(client);
        let stats = tunnel.await.unwrap().unwrap();
        assert_eq!(stats.finished, Direction::ClientToBackend);
    }

    #[tokio::test]
    async fn test_proxy_connect_refused_closes_client() {
        // Bind then drop to get a port nobody listens on
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let (mut client, proxied) = socket_pair().await;

        let result = proxy(proxied, "127.0.0.1", port, Duration::from_secs(2)).await;
        assert!(matches!(result, Err(TunnelError::Connect { .. })));

        let mut buf = [0u8; 4];
        let n = client.read(&mut buf).await.unwrap_or(0);
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn test_backend_close_tears_down_client() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            stream.write_all(b"bye").await.unwrap();
            // dropping closes the backend side
        });

        let (mut client, proxied) = socket_pair().await;
        let tunnel = tokio::spawn(async move {
            proxy(proxied, "127.0.0.1", port, DEFAULT_CONNECT_TIMEOUT).await
        });

        let mut received = Vec::new();
        client.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"bye");

        server.await.unwrap();
        let stats = tunnel.await.unwrap().unwrap();
        assert_eq!(stats.finished, Direction::BackendToClient);
        assert_eq!(stats.bytes, 3);
    }
}
