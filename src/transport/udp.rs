use super::traits::{is_timeout, SlpTransport};
use crate::codec::MessageHeader;
use log::{debug, warn};
use socket2::{Domain, Protocol, Socket, Type};
use std::io::Result;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::time::{Duration, Instant};

pub struct UdpTransport {
    socket: UdpSocket,
}

impl UdpTransport {
    pub fn new(bind_addr: SocketAddr) -> Result<Self> {
        let socket = UdpSocket::bind(bind_addr)?;
        Ok(UdpTransport { socket })
    }

    /// Binds with address (and on unix, port) reuse so several agents on one
    /// host can share the SLP port and the multicast group.
    pub fn new_multicast(bind_addr: SocketAddr) -> Result<Self> {
        let socket = Socket::new(Domain::for_address(bind_addr), Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        #[cfg(unix)]
        socket.set_reuse_port(true)?;
        socket.bind(&bind_addr.into())?;
        Ok(UdpTransport { socket: socket.into() })
    }

    pub fn try_clone(&self) -> Result<Self> {
        Ok(UdpTransport { socket: self.socket.try_clone()? })
    }

    pub fn join_multicast_v4(&self, group: &Ipv4Addr, interface: &Ipv4Addr) -> Result<()> {
        self.socket.join_multicast_v4(group, interface)
    }

    /// Joins `group`, logging instead of failing on hosts without a multicast route.
    pub fn try_join_multicast_v4(&self, group: &Ipv4Addr, interface: &Ipv4Addr) -> bool {
        match self.join_multicast_v4(group, interface) {
            Ok(()) => true,
            Err(e) => {
                warn!("Could not join multicast group {} on {}: {}", group, interface, e);
                false
            }
        }
    }

    pub fn set_multicast_ttl_v4(&self, ttl: u32) -> Result<()> {
        self.socket.set_multicast_ttl_v4(ttl)
    }

    pub fn set_multicast_loop_v4(&self, enabled: bool) -> Result<()> {
        self.socket.set_multicast_loop_v4(enabled)
    }

    /// Unicast request/reply: sends `data` and waits up to `timeout` for a
    /// datagram whose XID equals `xid`. Replies with other XIDs are discarded.
    pub fn send_and_receive(
        &self,
        data: &[u8],
        destination: SocketAddr,
        xid: u16,
        max_len: usize,
        timeout: Duration,
    ) -> Result<Option<(Vec<u8>, SocketAddr)>> {
        self.send(data, destination)?;
        let deadline = Instant::now() + timeout;
        let mut buf = vec![0u8; max_len];
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            let Some((len, from)) = self.receive(&mut buf, remaining)? else {
                return Ok(None);
            };
            match reply_xid(&buf[..len]) {
                Some(reply) if reply == xid => return Ok(Some((buf[..len].to_vec(), from))),
                other => {
                    debug!(
                        "Discarding datagram from {} with XID {:?}, expected {}",
                        from, other, xid
                    );
                }
            }
        }
    }
}

/// XID of a raw frame, without decoding the rest of it.
pub(crate) fn reply_xid(frame: &[u8]) -> Option<u16> {
    if frame.len() < MessageHeader::FIXED_LENGTH {
        return None;
    }
    Some(u16::from_be_bytes([frame[10], frame[11]]))
}

/// Local address the OS would use to reach `target`. No packet is sent.
pub fn local_ip_towards(target: IpAddr) -> Option<IpAddr> {
    let bind: SocketAddr = match target {
        IpAddr::V4(_) => SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
        IpAddr::V6(_) => SocketAddr::from((std::net::Ipv6Addr::UNSPECIFIED, 0)),
    };
    let socket = UdpSocket::bind(bind).ok()?;
    socket.connect(SocketAddr::new(target, 427)).ok()?;
    socket.local_addr().ok().map(|addr| addr.ip())
}

impl SlpTransport for UdpTransport {
    fn send(&self, data: &[u8], destination: SocketAddr) -> Result<usize> {
        self.socket.send_to(data, destination)
    }

    fn receive(&self, buffer: &mut [u8], timeout: Duration) -> Result<Option<(usize, SocketAddr)>> {
        if timeout.is_zero() {
            return Ok(None);
        }
        self.socket.set_read_timeout(Some(timeout))?;
        match self.socket.recv_from(buffer) {
            Ok(received) => Ok(Some(received)),
            Err(e) if is_timeout(&e) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn local_addr(&self) -> Result<SocketAddr> {
        self.socket.local_addr()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn loopback() -> UdpTransport {
        UdpTransport::new("127.0.0.1:0".parse().unwrap()).unwrap()
    }

    fn frame_with_xid(xid: u16) -> Vec<u8> {
        let mut frame = vec![2, 5, 0, 0, 16, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0];
        frame[10..12].copy_from_slice(&xid.to_be_bytes());
        frame
    }

    #[test]
    fn test_receive_times_out() {
        let udp = loopback();
        let mut buf = [0u8; 64];
        let start = Instant::now();
        let got = udp.receive(&mut buf, Duration::from_millis(50)).unwrap();
        assert!(got.is_none());
        assert!(start.elapsed() >= Duration::from_millis(40));
    }

    #[test]
    fn test_send_receive() {
        let a = loopback();
        let b = loopback();
        a.send(b"ping", b.local_addr().unwrap()).unwrap();
        let mut buf = [0u8; 64];
        let (len, from) = b.receive(&mut buf, Duration::from_secs(1)).unwrap().unwrap();
        assert_eq!(&buf[..len], b"ping");
        assert_eq!(from, a.local_addr().unwrap());
    }

    #[test]
    fn test_send_and_receive_skips_other_xids() {
        let server = loopback();
        let server_addr = server.local_addr().unwrap();
        let handle = thread::spawn(move || {
            let mut buf = [0u8; 64];
            let (_, from) = server.receive(&mut buf, Duration::from_secs(2)).unwrap().unwrap();
            server.send(&frame_with_xid(99), from).unwrap();
            server.send(&frame_with_xid(7), from).unwrap();
        });

        let client = loopback();
        let (reply, from) = client
            .send_and_receive(b"request", server_addr, 7, 1500, Duration::from_secs(2))
            .unwrap()
            .unwrap();
        assert_eq!(reply_xid(&reply), Some(7));
        assert_eq!(from, server_addr);
        handle.join().unwrap();
    }

    #[test]
    fn test_send_and_receive_no_reply() {
        let silent = loopback();
        let client = loopback();
        let target = silent.local_addr().unwrap();
        let got = client
            .send_and_receive(b"request", target, 1, 1500, Duration::from_millis(50))
            .unwrap();
        assert!(got.is_none());
    }

    #[test]
    fn test_local_ip_towards_loopback() {
        let local = local_ip_towards("127.0.0.1".parse().unwrap());
        assert_eq!(local, Some("127.0.0.1".parse().unwrap()));
    }

    #[test]
    fn test_multicast_bind_shares_port() {
        let first = UdpTransport::new_multicast("0.0.0.0:0".parse().unwrap()).unwrap();
        let port = first.local_addr().unwrap().port();
        let second = UdpTransport::new_multicast(SocketAddr::from(([0, 0, 0, 0], port)));
        assert!(second.is_ok());
    }
}
