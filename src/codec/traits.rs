use super::primitives::WireReader;
use crate::error::Result;

// Types that can be written in RFC 2608 wire format
pub trait SlpEncode {
    fn encode(&self, writer: &mut Vec<u8>) -> Result<()>;
}

// Types that can be read from RFC 2608 wire format
pub trait SlpDecode: Sized {
    fn decode(reader: &mut WireReader<'_>) -> Result<Self>;
}
