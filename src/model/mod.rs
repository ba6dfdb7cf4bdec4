//! # Domain Model
//!
//! Value types shared by the codec, the cache and the agents.
//!
//! - [`ServiceUrl`] / [`ServiceType`] - advertised URL with lifetime, and its type
//! - [`Scopes`] - case-insensitive scope set
//! - [`Attributes`] - tag/value attribute lists in their RFC 2608 string form
//! - [`Filter`] - LDAPv3 predicates evaluated against attributes
//! - [`ServiceInfo`] - a cached registration

pub mod attributes;
pub mod filter;
pub mod scopes;
pub mod service_info;
pub mod service_url;

pub use attributes::{parse_tag_list, tag_list_to_wire, Attributes};
pub use filter::Filter;
pub use scopes::Scopes;
pub use service_info::{DirectoryAgentInfo, ServiceAgentInfo, ServiceInfo, ServiceKey};
pub use service_url::{ServiceType, ServiceUrl};
