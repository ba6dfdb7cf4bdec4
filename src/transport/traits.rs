use std::io::Result;
use std::net::SocketAddr;
use std::time::Duration;

/// Trait representing an SLP datagram channel.
/// Object-safe so agents and the converger can run against mocks.
pub trait SlpTransport: Send + Sync {
    /// Send one datagram to `destination` (unicast or the multicast group).
    fn send(&self, data: &[u8], destination: SocketAddr) -> Result<usize>;

    /// Wait at most `timeout` for one datagram.
    /// Returns `Ok(None)` when the timeout elapses with nothing received.
    fn receive(&self, buffer: &mut [u8], timeout: Duration) -> Result<Option<(usize, SocketAddr)>>;

    fn local_addr(&self) -> Result<SocketAddr>;
}

pub(crate) fn is_timeout(e: &std::io::Error) -> bool {
    matches!(e.kind(), std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut)
}
