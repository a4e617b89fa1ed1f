//! Framed request/response transport over TCP.
//!
//! dqlite has no pipelining: each request is written as one frame and its
//! response read back before the next request goes out. [`SyncTransport`]
//! drives a blocking `std::net::TcpStream`, [`AsyncTransport`] an asupersync
//! one. Both speak the frames built by `dqlite-wire`.

use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream as StdTcpStream};
use std::pin::Pin;
use std::time::Duration;

use asupersync::io::{AsyncRead, AsyncWrite, ReadBuf};
use asupersync::net::TcpStream;

use dqlite_core::error::{ConnectionError, ConnectionErrorKind, Result};
use dqlite_core::Error;
use dqlite_wire::{HEADER_SIZE, Header, Request, Response, handshake};

use crate::config::resolve_address;

/// Blocking transport.
#[derive(Debug)]
pub struct SyncTransport {
    stream: StdTcpStream,
    peer: SocketAddr,
}

impl SyncTransport {
    /// Dial `address`, trying each resolved socket address in turn, and send
    /// the protocol handshake.
    #[allow(clippy::result_large_err)]
    pub fn dial(
        address: &str,
        connect_timeout: Duration,
        request_timeout: Duration,
    ) -> Result<Self> {
        let mut last_error = None;
        for addr in resolve_address(address)? {
            match StdTcpStream::connect_timeout(&addr, connect_timeout) {
                Ok(stream) => {
                    stream.set_nodelay(true).ok();
                    stream.set_read_timeout(Some(request_timeout))?;
                    stream.set_write_timeout(Some(request_timeout))?;
                    let mut transport = Self { stream, peer: addr };
                    transport.write_all(&handshake())?;
                    return Ok(transport);
                }
                Err(e) => last_error = Some(e),
            }
        }
        Err(connect_failed(address, last_error))
    }

    /// Socket address actually dialed.
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Send one request.
    #[allow(clippy::result_large_err)]
    pub fn send(&mut self, request: &Request) -> Result<()> {
        tracing::trace!(request = request.name(), "dqlite send");
        let frame = request.encode()?;
        self.write_all(&frame)
    }

    /// Read one response.
    #[allow(clippy::result_large_err)]
    pub fn recv(&mut self) -> Result<Response> {
        let mut raw = [0u8; HEADER_SIZE];
        self.stream
            .read_exact(&mut raw)
            .map_err(|e| io_failure("Failed to read message header", e))?;
        let header = Header::from_bytes(&raw);
        let mut body = vec![0u8; header.checked_body_len()?];
        self.stream
            .read_exact(&mut body)
            .map_err(|e| io_failure("Failed to read message body", e))?;
        let response = Response::decode(&header, &body)?;
        tracing::trace!(response = response.name(), "dqlite recv");
        Ok(response)
    }

    /// Send a request and read its response.
    #[allow(clippy::result_large_err)]
    pub fn round_trip(&mut self, request: &Request) -> Result<Response> {
        self.send(request)?;
        self.recv()
    }

    /// Shut down both directions of the socket.
    pub fn shutdown(&self) {
        self.stream.shutdown(std::net::Shutdown::Both).ok();
    }

    #[allow(clippy::result_large_err)]
    fn write_all(&mut self, bytes: &[u8]) -> Result<()> {
        self.stream
            .write_all(bytes)
            .and_then(|()| self.stream.flush())
            .map_err(|e| io_failure("Failed to write message", e))
    }
}

/// Non-blocking transport driven by the asupersync reactor.
pub struct AsyncTransport {
    stream: TcpStream,
    peer: SocketAddr,
}

impl std::fmt::Debug for AsyncTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncTransport")
            .field("peer", &self.peer)
            .finish_non_exhaustive()
    }
}

impl AsyncTransport {
    /// Dial `address` and send the protocol handshake.
    pub async fn dial(address: &str, connect_timeout: Duration) -> Result<Self> {
        let mut last_error = None;
        for addr in resolve_address(address)? {
            match TcpStream::connect_timeout(addr, connect_timeout).await {
                Ok(stream) => {
                    stream.set_nodelay(true).ok();
                    let mut transport = Self { stream, peer: addr };
                    transport.write_all(&handshake()).await?;
                    return Ok(transport);
                }
                Err(e) => last_error = Some(e),
            }
        }
        Err(connect_failed(address, last_error))
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub async fn send(&mut self, request: &Request) -> Result<()> {
        tracing::trace!(request = request.name(), "dqlite send");
        let frame = request.encode()?;
        self.write_all(&frame).await
    }

    pub async fn recv(&mut self) -> Result<Response> {
        let mut raw = [0u8; HEADER_SIZE];
        self.read_exact(&mut raw, "Failed to read message header").await?;
        let header = Header::from_bytes(&raw);
        let mut body = vec![0u8; header.checked_body_len()?];
        self.read_exact(&mut body, "Failed to read message body").await?;
        let response = Response::decode(&header, &body)?;
        tracing::trace!(response = response.name(), "dqlite recv");
        Ok(response)
    }

    pub async fn round_trip(&mut self, request: &Request) -> Result<Response> {
        self.send(request).await?;
        self.recv().await
    }

    async fn read_exact(&mut self, buf: &mut [u8], context: &str) -> Result<()> {
        let stream = &mut self.stream;
        let mut total_read = 0;
        while total_read < buf.len() {
            let mut read_buf = ReadBuf::new(&mut buf[total_read..]);
            match std::future::poll_fn(|cx| Pin::new(&mut *stream).poll_read(cx, &mut read_buf))
                .await
            {
                Ok(()) => {
                    let n = read_buf.filled().len();
                    if n == 0 {
                        return Err(Error::Connection(ConnectionError {
                            kind: ConnectionErrorKind::Disconnected,
                            message: format!("{}: connection closed", context),
                            source: None,
                        }));
                    }
                    total_read += n;
                }
                Err(e) => return Err(io_failure(context, e)),
            }
        }
        Ok(())
    }

    async fn write_all(&mut self, bytes: &[u8]) -> Result<()> {
        let stream = &mut self.stream;
        let mut written = 0;
        while written < bytes.len() {
            let pending = &bytes[written..];
            match std::future::poll_fn(|cx| Pin::new(&mut *stream).poll_write(cx, pending))
                .await
            {
                Ok(0) => {
                    return Err(Error::Connection(ConnectionError {
                        kind: ConnectionErrorKind::Disconnected,
                        message: "Connection closed while writing message".to_string(),
                        source: None,
                    }));
                }
                Ok(n) => written += n,
                Err(e) => return Err(io_failure("Failed to write message", e)),
            }
        }
        std::future::poll_fn(|cx| Pin::new(&mut *stream).poll_flush(cx))
            .await
            .map_err(|e| io_failure("Failed to flush stream", e))
    }
}

/// Map an I/O failure on an established socket.
///
/// Read timeouts surface as `Error::Timeout`; everything else means the
/// socket is gone.
pub(crate) fn io_failure(context: &str, e: io::Error) -> Error {
    match e.kind() {
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => Error::Timeout,
        io::ErrorKind::UnexpectedEof => Error::Connection(ConnectionError {
            kind: ConnectionErrorKind::Disconnected,
            message: format!("{}: connection closed", context),
            source: Some(Box::new(e)),
        }),
        _ => Error::Connection(ConnectionError {
            kind: ConnectionErrorKind::Disconnected,
            message: format!("{}: {}", context, e),
            source: Some(Box::new(e)),
        }),
    }
}

fn connect_failed(address: &str, error: Option<io::Error>) -> Error {
    match error {
        Some(e) => {
            let kind = if e.kind() == io::ErrorKind::ConnectionRefused {
                ConnectionErrorKind::Refused
            } else {
                ConnectionErrorKind::Connect
            };
            Error::Connection(ConnectionError {
                kind,
                message: format!("Failed to connect to {}: {}", address, e),
                source: Some(Box::new(e)),
            })
        }
        None => Error::Connection(ConnectionError {
            kind: ConnectionErrorKind::Connect,
            message: format!("Failed to connect to {}", address),
            source: None,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_failure_mapping() {
        let err = io_failure("read", io::Error::from(io::ErrorKind::TimedOut));
        assert!(matches!(err, Error::Timeout));

        let err = io_failure("read", io::Error::from(io::ErrorKind::UnexpectedEof));
        assert!(matches!(
            err,
            Error::Connection(ConnectionError {
                kind: ConnectionErrorKind::Disconnected,
                ..
            })
        ));
    }

    /// A listener that answers anything with an HTTP error.
    fn http_peer() -> (String, std::thread::JoinHandle<()>) {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let handle = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut handshake = [0u8; 8];
            stream.read_exact(&mut handshake).unwrap();
            stream
                .write_all(b"HTTP/1.1 400 Bad Request\r\nContent-Length: 0\r\n\r\n")
                .unwrap();
        });
        (address, handle)
    }

    #[test]
    fn test_recv_rejects_non_dqlite_peer() {
        let (address, handle) = http_peer();
        let mut transport =
            SyncTransport::dial(&address, Duration::from_secs(1), Duration::from_secs(1)).unwrap();
        let err = transport.round_trip(&Request::Leader).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)), "got {err:?}");
        assert!(err.to_string().contains("exceeds"));
        handle.join().unwrap();
    }

    #[test]
    fn test_async_recv_rejects_non_dqlite_peer() {
        let (address, handle) = http_peer();
        let rt = asupersync::runtime::RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let err = rt.block_on(async {
            let mut transport = AsyncTransport::dial(&address, Duration::from_secs(1))
                .await
                .unwrap();
            transport.round_trip(&Request::Leader).await.unwrap_err()
        });
        assert!(matches!(err, Error::Protocol(_)), "got {err:?}");
        handle.join().unwrap();
    }

    #[test]
    fn test_dial_refused() {
        // Bind then drop to get a port nobody listens on.
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let err = SyncTransport::dial(
            &format!("127.0.0.1:{}", port),
            Duration::from_secs(1),
            Duration::from_secs(1),
        )
        .unwrap_err();
        assert!(err.is_connection_error());
    }
}
