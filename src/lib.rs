pub mod agent;
pub mod cache;
pub mod codec;
pub mod discovery;
pub mod error;
pub mod logging;
pub mod model;
pub mod runtime;
pub mod transport;

/// SLP port for UDP and TCP.
pub const DEFAULT_PORT: u16 = 427;
/// Administratively scoped SLP multicast group.
pub const DEFAULT_MULTICAST_GROUP: &str = "239.255.255.253";

pub use agent::{DirectoryAgent, ServiceAgent, UserAgent};
pub use cache::{CacheResult, ServiceInfoCache};
pub use codec::{Body, Message, MessageHeader};
pub use discovery::Converger;
pub use error::{ErrorCode, Result, SlpError};
pub use model::{Attributes, Filter, Scopes, ServiceInfo, ServiceType, ServiceUrl};
pub use transport::{SlpTransport, TcpTransport, UdpTransport};
pub use runtime::*;
