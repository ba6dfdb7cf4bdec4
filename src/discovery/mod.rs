//! # Discovery Module
//!
//! Multicast convergence and the request messages used to drive it.
//!
//! ## Key Types
//!
//! - [`Converger`] - send once, gather replies for a fixed timeframe
//! - [`Convergence`] - replies keyed by responder, first-seen order

pub mod converger;

pub use converger::{merge_urls, Convergence, Converger};

use crate::codec::{Body, Message, MessageHeader, SrvRqst};
use crate::model::{Scopes, ServiceType};

/// Builds a SrvRqst with the multicast flag set.
pub fn multicast_service_request(
    xid: u16,
    language: &str,
    service_type: &str,
    scopes: &Scopes,
    predicate: &str,
) -> Message {
    let mut header = MessageHeader::new(xid, language);
    header.multicast = true;
    Message::new(
        header,
        Body::SrvRqst(SrvRqst {
            previous_responders: Vec::new(),
            service_type: ServiceType::new(service_type),
            scopes: scopes.clone(),
            predicate: predicate.to_string(),
            spi: String::new(),
        }),
    )
}

pub fn directory_agent_request(xid: u16, language: &str, scopes: &Scopes) -> Message {
    multicast_service_request(xid, language, ServiceType::DIRECTORY_AGENT, scopes, "")
}

pub fn service_agent_request(xid: u16, language: &str, scopes: &Scopes) -> Message {
    multicast_service_request(xid, language, ServiceType::SERVICE_AGENT, scopes, "")
}
