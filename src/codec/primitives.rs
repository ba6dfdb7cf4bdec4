use super::traits::{SlpDecode, SlpEncode};
use crate::error::{Result, SlpError};

/// Bounds-checked big-endian reader over a received frame.
///
/// Every read past the end of the buffer is reported as a parse error.
pub struct WireReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> WireReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        WireReader { buf, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.remaining() < len {
            return Err(SlpError::parse(format!(
                "truncated message: need {} bytes at offset {}, {} left",
                len,
                self.pos,
                self.remaining()
            )));
        }
        let slice = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    pub fn read<T: SlpDecode>(&mut self) -> Result<T> {
        T::decode(self)
    }
}

macro_rules! impl_primitive {
    ($type:ty, $bytes:expr) => {
        impl SlpEncode for $type {
            fn encode(&self, writer: &mut Vec<u8>) -> Result<()> {
                writer.extend_from_slice(&self.to_be_bytes());
                Ok(())
            }
        }

        impl SlpDecode for $type {
            fn decode(reader: &mut WireReader<'_>) -> Result<Self> {
                let mut buf = [0u8; $bytes];
                buf.copy_from_slice(reader.take($bytes)?);
                Ok(<$type>::from_be_bytes(buf))
            }
        }
    };
}

impl_primitive!(u8, 1);
impl_primitive!(u16, 2);
impl_primitive!(u32, 4);

/// 24-bit unsigned field (message length, extension offset).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct U24(pub u32);

impl U24 {
    pub const MAX: u32 = 0x00FF_FFFF;
}

impl SlpEncode for U24 {
    fn encode(&self, writer: &mut Vec<u8>) -> Result<()> {
        if self.0 > U24::MAX {
            return Err(SlpError::encoding(format!("{} does not fit in 24 bits", self.0)));
        }
        writer.extend_from_slice(&self.0.to_be_bytes()[1..4]);
        Ok(())
    }
}

impl SlpDecode for U24 {
    fn decode(reader: &mut WireReader<'_>) -> Result<Self> {
        let b = reader.take(3)?;
        Ok(U24(u32::from_be_bytes([0, b[0], b[1], b[2]])))
    }
}

// Strings: 16-bit byte length followed by UTF-8 bytes
impl SlpEncode for str {
    fn encode(&self, writer: &mut Vec<u8>) -> Result<()> {
        let len = u16::try_from(self.len()).map_err(|_| {
            SlpError::encoding(format!("string of {} bytes exceeds 65535", self.len()))
        })?;
        len.encode(writer)?;
        writer.extend_from_slice(self.as_bytes());
        Ok(())
    }
}

impl SlpEncode for String {
    fn encode(&self, writer: &mut Vec<u8>) -> Result<()> {
        self.as_str().encode(writer)
    }
}

impl SlpDecode for String {
    fn decode(reader: &mut WireReader<'_>) -> Result<Self> {
        let len = u16::decode(reader)? as usize;
        let bytes = reader.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| SlpError::parse("string is not valid UTF-8"))
    }
}
