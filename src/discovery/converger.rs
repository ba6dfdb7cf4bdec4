use crate::codec::{Body, Message};
use crate::error::{Result, SlpError};
use crate::model::{DirectoryAgentInfo, ServiceAgentInfo, ServiceUrl};
use crate::transport::SlpTransport;
use log::{debug, trace};
use std::collections::{HashMap, HashSet};
use std::io::ErrorKind;
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

/// Replies gathered during one convergence window.
///
/// Keyed by the responder's transport address; a later reply from the same
/// responder replaces the earlier one but keeps its first-seen position.
pub struct Convergence<R> {
    order: Vec<IpAddr>,
    replies: HashMap<IpAddr, R>,
}

impl<R> Convergence<R> {
    fn new() -> Self {
        Convergence { order: Vec::new(), replies: HashMap::new() }
    }

    fn record(&mut self, responder: IpAddr, reply: R) {
        if self.replies.insert(responder, reply).is_none() {
            self.order.push(responder);
        }
    }

    pub fn len(&self) -> usize {
        self.replies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.replies.is_empty()
    }

    pub fn into_replies(mut self) -> Vec<R> {
        self.order.iter().filter_map(|ip| self.replies.remove(ip)).collect()
    }

    pub fn into_pairs(mut self) -> Vec<(IpAddr, R)> {
        self.order
            .iter()
            .filter_map(|ip| self.replies.remove(ip).map(|r| (*ip, r)))
            .collect()
    }
}

/// Multicast request/gather: sends a request once and collects every reply
/// that arrives before the timeframe closes.
pub struct Converger<'a> {
    transport: &'a dyn SlpTransport,
    destination: SocketAddr,
    timeframe: Duration,
    max_len: usize,
}

impl<'a> Converger<'a> {
    pub fn new(
        transport: &'a dyn SlpTransport,
        destination: SocketAddr,
        timeframe: Duration,
    ) -> Self {
        Converger { transport, destination, timeframe, max_len: 1500 }
    }

    /// Receive buffer size; larger datagrams are truncated and fail to decode.
    pub fn with_max_len(mut self, max_len: usize) -> Self {
        self.max_len = max_len.max(64);
        self
    }

    /// Runs one convergence window for `request`.
    ///
    /// `accept` sees every decoded reply carrying the request's XID and
    /// returns `None` for replies it does not want. Frames that fail to decode
    /// are dropped. The call always lasts the full timeframe.
    pub fn converge<R, F>(&self, request: &Message, mut accept: F) -> Result<Convergence<R>>
    where
        F: FnMut(Message, SocketAddr) -> Option<R>,
    {
        let bytes = request.encode()?;
        let deadline = Instant::now() + self.timeframe;
        self.transport.send(&bytes, self.destination).map_err(|e| {
            SlpError::network(format!("convergence send to {} failed: {}", self.destination, e))
        })?;
        debug!(
            "Converging {:?} xid={} to {} for {:?}",
            request.function(),
            request.xid(),
            self.destination,
            self.timeframe
        );

        let mut result = Convergence::new();
        let mut buf = vec![0u8; self.max_len];
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            let (len, from) = match self.transport.receive(&mut buf, remaining) {
                Ok(Some(received)) => received,
                Ok(None) => continue,
                // ICMP errors from earlier unicast sends surface here
                Err(e)
                    if matches!(
                        e.kind(),
                        ErrorKind::ConnectionRefused
                            | ErrorKind::ConnectionReset
                            | ErrorKind::Interrupted
                    ) =>
                {
                    continue;
                }
                Err(e) => {
                    return Err(SlpError::network(format!("convergence receive failed: {}", e)));
                }
            };
            let reply = match Message::decode(&buf[..len]) {
                Ok(reply) => reply,
                Err(e) => {
                    debug!("Dropping undecodable reply from {}: {}", from, e);
                    continue;
                }
            };
            if reply.xid() != request.xid() {
                trace!(
                    "Ignoring xid {} from {} while converging xid {}",
                    reply.xid(),
                    from,
                    request.xid()
                );
                continue;
            }
            if let Some(accepted) = accept(reply, from) {
                result.record(from.ip(), accepted);
            }
        }
        debug!("Convergence xid={} finished with {} responder(s)", request.xid(), result.len());
        Ok(result)
    }

    /// Gathers DAAdverts. The DA address comes from the transport, the port
    /// from the advertised URL, falling back to the destination port.
    pub fn converge_da_adverts(&self, request: &Message) -> Result<Vec<DirectoryAgentInfo>> {
        let default_port = self.destination.port();
        let result = self.converge(request, |reply, from| match reply.body {
            Body::DaAdvert(advert) if advert.error_code == 0 => Some(DirectoryAgentInfo {
                address: DirectoryAgentInfo::resolve_address(&advert.url, from.ip(), default_port),
                url: advert.url,
                scopes: advert.scopes,
                attributes: advert.attributes,
                language: reply.header.language,
                boot_timestamp: advert.boot_timestamp,
            }),
            _ => None,
        })?;
        Ok(result.into_replies())
    }

    pub fn converge_sa_adverts(&self, request: &Message) -> Result<Vec<ServiceAgentInfo>> {
        let result = self.converge(request, |reply, from| match reply.body {
            Body::SaAdvert(advert) => Some(ServiceAgentInfo {
                url: advert.url,
                responder: from.ip(),
                scopes: advert.scopes,
                attributes: advert.attributes,
                language: reply.header.language,
            }),
            _ => None,
        })?;
        Ok(result.into_replies())
    }

    /// Gathers SrvRply URL lists and merges them, keeping the first copy of each URL.
    pub fn converge_service_replies(&self, request: &Message) -> Result<Vec<ServiceUrl>> {
        let result = self.converge(request, |reply, _| match reply.body {
            Body::SrvRply(rply) if rply.error_code == 0 => Some(rply.urls),
            _ => None,
        })?;
        Ok(merge_urls(result.into_replies()))
    }
}

pub fn merge_urls(lists: Vec<Vec<ServiceUrl>>) -> Vec<ServiceUrl> {
    let mut seen = HashSet::new();
    lists
        .into_iter()
        .flatten()
        .filter(|url| seen.insert(url.as_str().to_string()))
        .collect()
}
