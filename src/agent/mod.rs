//! # Agent Module
//!
//! The three SLP roles and the pieces they share.
//!
//! ## Key Types
//!
//! - [`ServiceAgent`] - caches local registrations and forwards them to DAs
//! - [`DirectoryAgent`] - accepts registrations from any SA and answers queries
//! - [`UserAgent`] - client facade: find DAs, SAs, services, attributes, types
//! - [`RegistrationForwarder`] - per-DA fan-out of cache mutations
//! - [`AckPerformer`] - SrvReg/SrvDeReg request, SrvAck reply over UDP or TCP

pub mod ack;
pub mod directory_agent;
pub mod forwarder;
pub mod query;
pub mod service_agent;
pub mod user_agent;

pub use ack::{AckPerformer, TcpAckPerformer, UdpAckPerformer};
pub use directory_agent::DirectoryAgent;
pub use forwarder::{
    ForwardEvent, ForwardObserver, ForwardTicket, LoggingObserver, Operation, RegistrationForwarder,
};
pub use service_agent::ServiceAgent;
pub use user_agent::UserAgent;

use crate::codec::{MessageHeader, SrvDeReg, SrvReg};
use crate::model::{Attributes, ServiceInfo};
use crate::transport::local_ip_towards;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

/// Cache entry for a received SrvReg, and whether it is an update.
pub fn registration_entry(header: &MessageHeader, reg: &SrvReg) -> (ServiceInfo, bool) {
    let entry = ServiceInfo::new(
        reg.url.clone(),
        reg.scopes.clone(),
        reg.attributes.clone(),
        header.language.clone(),
    )
    .with_service_type(reg.service_type.clone());
    (entry, !header.fresh)
}

/// Cache entry for a received SrvDeReg. A tag list turns it into an
/// attribute removal; the tags travel as keywords.
pub fn deregistration_entry(header: &MessageHeader, dereg: &SrvDeReg) -> (ServiceInfo, bool) {
    let mut attributes = Attributes::new();
    for tag in &dereg.tags {
        attributes.add(tag, Vec::new());
    }
    let entry = ServiceInfo::new(
        dereg.url.clone(),
        dereg.scopes.clone(),
        attributes,
        header.language.clone(),
    );
    (entry, !dereg.tags.is_empty())
}

/// Addresses a previous-responder list may name us by.
pub(crate) fn local_addresses(bound: IpAddr, multicast_group: Ipv4Addr) -> Vec<IpAddr> {
    let mut local = vec![IpAddr::V4(Ipv4Addr::LOCALHOST)];
    if !bound.is_unspecified() {
        local.push(bound);
    }
    if let Some(ip) = local_ip_towards(IpAddr::V4(multicast_group)) {
        local.push(ip);
    }
    local.sort();
    local.dedup();
    local
}

/// `service:directory-agent://10.0.0.1` style URL; the port is spelled out
/// only when it is not the SLP default.
pub(crate) fn advertised_url(
    service_type: &str,
    listen: SocketAddr,
    multicast_group: Ipv4Addr,
) -> String {
    let ip = if listen.ip().is_unspecified() {
        local_ip_towards(IpAddr::V4(multicast_group)).unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
    } else {
        listen.ip()
    };
    let host = match ip {
        IpAddr::V4(v4) => v4.to_string(),
        IpAddr::V6(v6) => format!("[{}]", v6),
    };
    if listen.port() == crate::DEFAULT_PORT {
        format!("{}://{}", service_type, host)
    } else {
        format!("{}://{}:{}", service_type, host, listen.port())
    }
}
