//! # Transport Module
//!
//! UDP (unicast and multicast) and TCP channels for SLP frames.
//! [`SlpTransport`] is the seam the converger and the agents are written against.

pub mod tcp;
pub mod traits;
pub mod udp;

pub use tcp::*;
pub use traits::SlpTransport;
pub use udp::{local_ip_towards, UdpTransport};
