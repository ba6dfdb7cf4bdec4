use crate::codec::{Body, Message, SrvAck};
use crate::error::{Result, SlpError};
use crate::transport::{TcpTransport, UdpTransport};
use log::trace;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

/// Sends a SrvReg or SrvDeReg and waits for the matching SrvAck.
///
/// A non-zero error code inside the ack is returned as is; callers decide
/// whether it is a failure. Transport failures and timeouts are `Network`
/// errors, a reply that is not an ack is a `Parse` error.
pub trait AckPerformer: Send + Sync {
    fn perform(&self, destination: SocketAddr, message: &Message) -> Result<SrvAck>;
}

fn expect_ack(reply: Message, request: &Message, from: SocketAddr) -> Result<SrvAck> {
    if reply.xid() != request.xid() {
        return Err(SlpError::parse(format!(
            "reply from {} has xid {}, expected {}",
            from,
            reply.xid(),
            request.xid()
        )));
    }
    match reply.body {
        Body::SrvAck(ack) => {
            trace!("Ack from {} xid={} code={}", from, reply.header.xid, ack.error_code);
            Ok(ack)
        }
        other => Err(SlpError::parse(format!(
            "expected SrvAck from {}, got {:?}",
            from,
            other.function()
        ))),
    }
}

pub struct TcpAckPerformer {
    timeout: Duration,
}

impl TcpAckPerformer {
    pub fn new(timeout: Duration) -> Self {
        TcpAckPerformer { timeout }
    }
}

impl AckPerformer for TcpAckPerformer {
    fn perform(&self, destination: SocketAddr, message: &Message) -> Result<SrvAck> {
        let bytes = message.encode()?;
        let transport = TcpTransport::connect(destination, self.timeout)
            .map_err(|e| SlpError::network(format!("cannot connect to {}: {}", destination, e)))?;
        let reply = transport.exchange(&bytes);
        transport.close();
        expect_ack(Message::decode(&reply?)?, message, destination)
    }
}

pub struct UdpAckPerformer {
    timeout: Duration,
    max_len: usize,
}

impl UdpAckPerformer {
    pub fn new(timeout: Duration, max_len: usize) -> Self {
        UdpAckPerformer { timeout, max_len }
    }
}

impl AckPerformer for UdpAckPerformer {
    fn perform(&self, destination: SocketAddr, message: &Message) -> Result<SrvAck> {
        let bytes = message.encode()?;
        let transport = UdpTransport::new(ephemeral_for(destination))?;
        let (reply, from) = transport
            .send_and_receive(&bytes, destination, message.xid(), self.max_len, self.timeout)?
            .ok_or_else(|| {
                SlpError::network(format!(
                    "no acknowledgment from {} within {:?}",
                    destination, self.timeout
                ))
            })?;
        expect_ack(Message::decode(&reply)?, message, from)
    }
}

/// Wildcard address of the same family as `destination`, port 0.
pub(crate) fn ephemeral_for(destination: SocketAddr) -> SocketAddr {
    match destination {
        SocketAddr::V4(_) => SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
        SocketAddr::V6(_) => SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0)),
    }
}
