//! # SLP Codec Module
//!
//! Serialization and deserialization of RFC 2608 (SLPv2) messages.
//!
//! ## Key Types
//!
//! - [`MessageHeader`] - flags, XID and language tag common to all messages
//! - [`Message`] / [`Body`] - one body variant per message type
//! - [`SlpEncode`] / [`SlpDecode`] - traits for wire encoding of fields
//! - [`XidGenerator`] - thread-safe transaction id generation
//!
//! ## Example
//!
//! ```ignore
//! use slp_engine::codec::{Body, Message, MessageHeader, SrvAck};
//!
//! let ack = Message::new(MessageHeader::new(7, "en"), Body::SrvAck(SrvAck { error_code: 0 }));
//! let bytes = ack.encode()?;
//! assert_eq!(Message::decode(&bytes)?, ack);
//! ```

pub mod header;
pub mod message;
pub mod primitives;
pub mod traits;
pub mod xid;

pub use header::{peek_length, FunctionId, MessageHeader};
pub use message::*;
pub use primitives::{WireReader, U24};
pub use traits::{SlpDecode, SlpEncode};
pub use xid::XidGenerator;

use crate::error::Result;

pub fn encode(message: &Message) -> Result<Vec<u8>> {
    message.encode()
}

pub fn decode(bytes: &[u8]) -> Result<Message> {
    Message::decode(bytes)
}
