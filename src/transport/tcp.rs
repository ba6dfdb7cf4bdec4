use super::traits::{is_timeout, SlpTransport};
use crate::codec::{peek_length, Message, MessageHeader};
use crate::error::{Result as SlpResult, SlpError};
use log::warn;
use std::io::{ErrorKind, Read, Result, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

const READ_CHUNK: usize = 4096;

/// TCP transport carrying length-framed SLP messages
pub struct TcpTransport {
    stream: TcpStream,
    max_frame: usize,
}

impl TcpTransport {
    /// Largest frame accepted by default (the 24-bit length field maximum).
    pub const MAX_FRAME: usize = 0x00FF_FFFF;

    pub fn new(stream: TcpStream) -> Self {
        TcpTransport { stream, max_frame: Self::MAX_FRAME }
    }

    /// Connect to a remote agent, giving up after `timeout`.
    /// The same timeout then bounds every read and write on the connection.
    pub fn connect(addr: SocketAddr, timeout: Duration) -> Result<Self> {
        let stream = TcpStream::connect_timeout(&addr, timeout)?;
        let transport = TcpTransport::new(stream);
        transport.set_timeout(timeout)?;
        Ok(transport)
    }

    pub fn with_max_frame(mut self, max_frame: usize) -> Self {
        self.max_frame = max_frame.max(MessageHeader::FIXED_LENGTH);
        self
    }

    pub fn set_timeout(&self, timeout: Duration) -> Result<()> {
        let timeout = Some(timeout).filter(|t| !t.is_zero());
        self.stream.set_read_timeout(timeout)?;
        self.stream.set_write_timeout(timeout)
    }

    pub fn peer_addr(&self) -> Result<SocketAddr> {
        self.stream.peer_addr()
    }

    pub fn write_frame(&self, frame: &[u8]) -> Result<()> {
        (&self.stream).write_all(frame)?;
        (&self.stream).flush()
    }

    /// Reads exactly one message frame using the header's length field.
    /// Returns `Ok(None)` on a clean end of stream before any byte was read.
    pub fn read_frame(&self) -> SlpResult<Option<Vec<u8>>> {
        self.read_frame_io().map_err(|e| match e.kind() {
            ErrorKind::InvalidData => SlpError::parse(e.to_string()),
            ErrorKind::UnexpectedEof => SlpError::network("connection closed inside a message"),
            _ if is_timeout(&e) => SlpError::network("timed out waiting for a message"),
            _ => e.into(),
        })
    }

    fn read_frame_io(&self) -> Result<Option<Vec<u8>>> {
        let mut prefix = [0u8; 5];
        let mut filled = 0;
        while filled < prefix.len() {
            match (&self.stream).read(&mut prefix[filled..]) {
                Ok(0) if filled == 0 => return Ok(None),
                Ok(0) => return Err(ErrorKind::UnexpectedEof.into()),
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }

        let length = peek_length(&prefix).unwrap_or(0);
        if length < MessageHeader::FIXED_LENGTH || length > self.max_frame {
            return Err(std::io::Error::new(
                ErrorKind::InvalidData,
                format!("invalid frame length {}", length),
            ));
        }
        // Grow with the bytes that actually arrive, not with the declared length.
        let mut frame = Vec::with_capacity(length.min(READ_CHUNK));
        frame.extend_from_slice(&prefix);
        let body = (length - prefix.len()) as u64;
        if (&self.stream).take(body).read_to_end(&mut frame)? as u64 != body {
            return Err(ErrorKind::UnexpectedEof.into());
        }
        Ok(Some(frame))
    }

    /// Writes a request and reads back exactly one framed reply.
    pub fn exchange(&self, request: &[u8]) -> SlpResult<Vec<u8>> {
        self.write_frame(request)?;
        self.read_frame()?
            .ok_or_else(|| SlpError::network("connection closed before a reply arrived"))
    }

    /// Writes `message` back on this connection.
    pub fn reply(&self, message: &Message) -> SlpResult<()> {
        let bytes = message.encode()?;
        self.write_frame(&bytes)?;
        Ok(())
    }

    pub fn close(&self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

impl SlpTransport for TcpTransport {
    fn send(&self, data: &[u8], _destination: SocketAddr) -> Result<usize> {
        self.write_frame(data)?;
        Ok(data.len())
    }

    fn receive(&self, buffer: &mut [u8], timeout: Duration) -> Result<Option<(usize, SocketAddr)>> {
        self.set_timeout(timeout)?;
        let frame = match self.read_frame_io() {
            Ok(Some(frame)) => frame,
            Ok(None) => return Ok(None),
            Err(e) if is_timeout(&e) => return Ok(None),
            Err(e) => return Err(e),
        };
        if frame.len() > buffer.len() {
            let message = "frame larger than receive buffer";
            return Err(std::io::Error::new(ErrorKind::InvalidData, message));
        }
        buffer[..frame.len()].copy_from_slice(&frame);
        Ok(Some((frame.len(), self.stream.peer_addr()?)))
    }

    fn local_addr(&self) -> Result<SocketAddr> {
        self.stream.local_addr()
    }
}

/// Counts one open server-side connection until dropped.
pub struct ConnectionPermit {
    active: Arc<AtomicUsize>,
}

impl Drop for ConnectionPermit {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// An accepted connection together with its slot in the server's connection budget.
pub struct TcpConnection {
    pub transport: TcpTransport,
    pub peer: SocketAddr,
    pub permit: ConnectionPermit,
}

/// TCP listener handing out at most `max_connections` concurrent connections
pub struct TcpServer {
    listener: TcpListener,
    active: Arc<AtomicUsize>,
    max_connections: usize,
    max_frame: usize,
    loopback_only: bool,
}

impl TcpServer {
    pub fn bind(addr: SocketAddr, max_connections: usize) -> Result<Self> {
        let listener = TcpListener::bind(addr)?;
        Ok(TcpServer {
            listener,
            active: Arc::new(AtomicUsize::new(0)),
            max_connections: max_connections.max(1),
            max_frame: TcpTransport::MAX_FRAME,
            loopback_only: false,
        })
    }

    /// Largest request frame accepted on connections from this listener.
    pub fn with_max_frame(mut self, max_frame: usize) -> Self {
        self.max_frame = max_frame.max(MessageHeader::FIXED_LENGTH);
        self
    }

    /// Drop connections from non-loopback peers right after accept.
    pub fn loopback_only(mut self, enabled: bool) -> Self {
        self.loopback_only = enabled;
        self
    }

    pub fn set_nonblocking(&self, nonblocking: bool) -> Result<()> {
        self.listener.set_nonblocking(nonblocking)
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn connection_count(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Accept one connection (non-blocking if set).
    /// Rejected peers and connections over budget are closed and yield `Ok(None)`.
    pub fn accept(&self) -> Result<Option<TcpConnection>> {
        let (stream, peer) = match self.listener.accept() {
            Ok(accepted) => accepted,
            Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(None),
            Err(e) => return Err(e),
        };
        if self.loopback_only && !peer.ip().is_loopback() {
            warn!("Refusing TCP connection from non-loopback peer {}", peer);
            let _ = stream.shutdown(Shutdown::Both);
            return Ok(None);
        }
        if self.active.fetch_add(1, Ordering::SeqCst) >= self.max_connections {
            self.active.fetch_sub(1, Ordering::SeqCst);
            warn!("Connection limit {} reached, closing {}", self.max_connections, peer);
            let _ = stream.shutdown(Shutdown::Both);
            return Ok(None);
        }
        // Accepted sockets may inherit non-blocking mode from the listener.
        stream.set_nonblocking(false)?;
        Ok(Some(TcpConnection {
            transport: TcpTransport::new(stream).with_max_frame(self.max_frame),
            peer,
            permit: ConnectionPermit { active: Arc::clone(&self.active) },
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{Body, SrvAck};
    use std::thread;

    fn ack_bytes(xid: u16, code: u16) -> Vec<u8> {
        Message::new(MessageHeader::new(xid, "en"), Body::SrvAck(SrvAck { error_code: code }))
            .encode()
            .unwrap()
    }

    fn accept_blocking(server: &TcpServer) -> TcpConnection {
        loop {
            if let Some(conn) = server.accept().unwrap() {
                return conn;
            }
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_tcp_server_creation() {
        let server = TcpServer::bind("127.0.0.1:0".parse().unwrap(), 4).unwrap();
        assert!(server.local_addr().unwrap().port() > 0);
        assert_eq!(server.connection_count(), 0);
    }

    #[test]
    fn test_exchange_reads_one_frame() {
        let server = TcpServer::bind("127.0.0.1:0".parse().unwrap(), 4).unwrap();
        let addr = server.local_addr().unwrap();

        let handle = thread::spawn(move || {
            let conn = accept_blocking(&server);
            let request = conn.transport.read_frame().unwrap().unwrap();
            let message = Message::decode(&request).unwrap();
            conn.transport.reply(&message.ack(0)).unwrap();
        });

        let client = TcpTransport::connect(addr, Duration::from_secs(2)).unwrap();
        let reply = client.exchange(&ack_bytes(42, 0)).unwrap();
        let message = Message::decode(&reply).unwrap();
        assert_eq!(message.xid(), 42);
        handle.join().unwrap();
    }

    #[test]
    fn test_read_frame_rejects_bad_length() {
        let server = TcpServer::bind("127.0.0.1:0".parse().unwrap(), 4).unwrap();
        let addr = server.local_addr().unwrap();
        let handle = thread::spawn(move || {
            let conn = accept_blocking(&server);
            conn.transport.read_frame()
        });

        let client = TcpTransport::connect(addr, Duration::from_secs(2)).unwrap();
        client.write_frame(&[2, 5, 0, 0, 3]).unwrap();
        assert!(matches!(handle.join().unwrap(), Err(SlpError::Parse(_))));
    }

    #[test]
    fn test_server_frame_limit() {
        let server =
            TcpServer::bind("127.0.0.1:0".parse().unwrap(), 4).unwrap().with_max_frame(1024);
        let addr = server.local_addr().unwrap();
        let handle = thread::spawn(move || {
            let conn = accept_blocking(&server);
            conn.transport.read_frame()
        });

        let client = TcpTransport::connect(addr, Duration::from_secs(2)).unwrap();
        // Declares a 2048 byte message, then sends nothing more.
        client.write_frame(&[2, 1, 0, 0x08, 0x00]).unwrap();
        assert!(matches!(handle.join().unwrap(), Err(SlpError::Parse(_))));
    }

    #[test]
    fn test_read_frame_truncated_body() {
        let server = TcpServer::bind("127.0.0.1:0".parse().unwrap(), 4).unwrap();
        let addr = server.local_addr().unwrap();
        let handle = thread::spawn(move || {
            let conn = accept_blocking(&server);
            conn.transport.read_frame()
        });

        let client = TcpTransport::connect(addr, Duration::from_secs(2)).unwrap();
        let bytes = ack_bytes(3, 0);
        client.write_frame(&bytes[..bytes.len() - 1]).unwrap();
        client.close();
        assert!(matches!(handle.join().unwrap(), Err(SlpError::Network(_))));
    }

    #[test]
    fn test_read_frame_clean_close() {
        let server = TcpServer::bind("127.0.0.1:0".parse().unwrap(), 4).unwrap();
        let addr = server.local_addr().unwrap();
        let client = TcpTransport::connect(addr, Duration::from_secs(2)).unwrap();
        let conn = accept_blocking(&server);
        client.close();
        assert!(conn.transport.read_frame().unwrap().is_none());
    }

    #[test]
    fn test_connection_limit() {
        let server = TcpServer::bind("127.0.0.1:0".parse().unwrap(), 1).unwrap();
        let addr = server.local_addr().unwrap();

        let _first = TcpTransport::connect(addr, Duration::from_secs(1)).unwrap();
        let held = accept_blocking(&server);
        assert_eq!(server.connection_count(), 1);

        let _second = TcpTransport::connect(addr, Duration::from_secs(1)).unwrap();
        thread::sleep(Duration::from_millis(50));
        assert!(server.accept().unwrap().is_none());

        drop(held);
        assert_eq!(server.connection_count(), 0);
    }

    #[test]
    fn test_peer_addr() {
        let server = TcpServer::bind("127.0.0.1:0".parse().unwrap(), 4).unwrap();
        let server_addr = server.local_addr().unwrap();
        let client = TcpTransport::connect(server_addr, Duration::from_secs(1)).unwrap();
        assert_eq!(client.peer_addr().unwrap(), server_addr);
    }
}
