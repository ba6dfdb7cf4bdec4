use super::primitives::{WireReader, U24};
use super::traits::{SlpDecode, SlpEncode};
use crate::error::{Result, SlpError};

/// Message type byte (RFC 2608 "Function-ID").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FunctionId {
    SrvRqst = 1,
    SrvRply = 2,
    SrvReg = 3,
    SrvDeReg = 4,
    SrvAck = 5,
    AttrRqst = 6,
    AttrRply = 7,
    DaAdvert = 8,
    SrvTypeRqst = 9,
    SrvTypeRply = 10,
    SaAdvert = 11,
}

impl TryFrom<u8> for FunctionId {
    type Error = SlpError;

    fn try_from(v: u8) -> Result<Self> {
        let id = match v {
            1 => FunctionId::SrvRqst,
            2 => FunctionId::SrvRply,
            3 => FunctionId::SrvReg,
            4 => FunctionId::SrvDeReg,
            5 => FunctionId::SrvAck,
            6 => FunctionId::AttrRqst,
            7 => FunctionId::AttrRply,
            8 => FunctionId::DaAdvert,
            9 => FunctionId::SrvTypeRqst,
            10 => FunctionId::SrvTypeRply,
            11 => FunctionId::SaAdvert,
            other => return Err(SlpError::parse(format!("unknown message type {}", other))),
        };
        Ok(id)
    }
}

impl From<FunctionId> for u8 {
    fn from(id: FunctionId) -> u8 {
        id as u8
    }
}

/// RFC 2608 header fields that are not derived from the body.
///
/// Total length is computed on encode and checked on decode, so it is not stored.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageHeader {
    pub overflow: bool,
    pub fresh: bool,
    pub multicast: bool,
    pub xid: u16,
    pub language: String,
}

impl MessageHeader {
    pub const SLP_VERSION: u8 = 2;
    /// Fixed part before the language tag.
    pub const FIXED_LENGTH: usize = 14;

    const OVERFLOW_FLAG: u16 = 0x8000;
    const FRESH_FLAG: u16 = 0x4000;
    const MULTICAST_FLAG: u16 = 0x2000;

    pub fn new(xid: u16, language: impl Into<String>) -> Self {
        MessageHeader {
            xid,
            language: language.into(),
            ..Default::default()
        }
    }

    pub fn flags(&self) -> u16 {
        let mut flags = 0;
        if self.overflow {
            flags |= Self::OVERFLOW_FLAG;
        }
        if self.fresh {
            flags |= Self::FRESH_FLAG;
        }
        if self.multicast {
            flags |= Self::MULTICAST_FLAG;
        }
        flags
    }

    pub fn encoded_len(&self) -> usize {
        Self::FIXED_LENGTH + self.language.len()
    }

    /// Writes the header for a message whose body is `body_len` bytes long.
    pub fn serialize(
        &self,
        function: FunctionId,
        body_len: usize,
        writer: &mut Vec<u8>,
    ) -> Result<()> {
        let total = self.encoded_len() + body_len;
        let total = u32::try_from(total)
            .ok()
            .filter(|t| *t <= U24::MAX)
            .ok_or_else(|| {
                SlpError::encoding(format!("message of {} bytes exceeds 24-bit length", total))
            })?;

        Self::SLP_VERSION.encode(writer)?;
        u8::from(function).encode(writer)?;
        U24(total).encode(writer)?;
        self.flags().encode(writer)?;
        // Extensions are not supported: next-extension offset is always zero.
        U24(0).encode(writer)?;
        self.xid.encode(writer)?;
        self.language.encode(writer)
    }

    /// Parses the header of a complete frame, leaving `reader` at the body.
    pub fn deserialize(
        reader: &mut WireReader<'_>,
        frame_len: usize,
    ) -> Result<(FunctionId, Self)> {
        let version = u8::decode(reader)?;
        if version != Self::SLP_VERSION {
            return Err(SlpError::parse(format!(
                "unsupported SLP version {}, only version {} is supported",
                version,
                Self::SLP_VERSION
            )));
        }
        let function = u8::decode(reader)?;
        let U24(length) = U24::decode(reader)?;
        if length as usize != frame_len {
            return Err(SlpError::parse(format!(
                "expected message length {}, got {} bytes",
                length, frame_len
            )));
        }
        let function = FunctionId::try_from(function)?;
        let flags = u16::decode(reader)?;
        let _next_extension = U24::decode(reader)?;
        let xid = u16::decode(reader)?;
        let language = String::decode(reader)?;

        Ok((
            function,
            MessageHeader {
                overflow: flags & Self::OVERFLOW_FLAG != 0,
                fresh: flags & Self::FRESH_FLAG != 0,
                multicast: flags & Self::MULTICAST_FLAG != 0,
                xid,
                language,
            },
        ))
    }
}

/// Reads the 24-bit total length from the first bytes of a frame, if present.
pub fn peek_length(prefix: &[u8]) -> Option<usize> {
    if prefix.len() < 5 {
        return None;
    }
    Some(u32::from_be_bytes([0, prefix[2], prefix[3], prefix[4]]) as usize)
}
