use super::header::{FunctionId, MessageHeader};
use super::primitives::WireReader;
use super::traits::{SlpDecode, SlpEncode};
use crate::error::{Result, SlpError};
use crate::model::{parse_tag_list, tag_list_to_wire, Attributes, Scopes, ServiceType, ServiceUrl};

/// A complete SLP message: header plus a type-specific body.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub header: MessageHeader,
    pub body: Body,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Body {
    SrvRqst(SrvRqst),
    SrvRply(SrvRply),
    SrvReg(SrvReg),
    SrvDeReg(SrvDeReg),
    SrvAck(SrvAck),
    AttrRqst(AttrRqst),
    AttrRply(AttrRply),
    DaAdvert(DaAdvert),
    SrvTypeRqst(SrvTypeRqst),
    SrvTypeRply(SrvTypeRply),
    SaAdvert(SaAdvert),
}

impl Body {
    pub fn function(&self) -> FunctionId {
        match self {
            Body::SrvRqst(_) => FunctionId::SrvRqst,
            Body::SrvRply(_) => FunctionId::SrvRply,
            Body::SrvReg(_) => FunctionId::SrvReg,
            Body::SrvDeReg(_) => FunctionId::SrvDeReg,
            Body::SrvAck(_) => FunctionId::SrvAck,
            Body::AttrRqst(_) => FunctionId::AttrRqst,
            Body::AttrRply(_) => FunctionId::AttrRply,
            Body::DaAdvert(_) => FunctionId::DaAdvert,
            Body::SrvTypeRqst(_) => FunctionId::SrvTypeRqst,
            Body::SrvTypeRply(_) => FunctionId::SrvTypeRply,
            Body::SaAdvert(_) => FunctionId::SaAdvert,
        }
    }

    /// Error code of reply messages; `None` for requests.
    pub fn error_code(&self) -> Option<u16> {
        match self {
            Body::SrvRply(b) => Some(b.error_code),
            Body::SrvAck(b) => Some(b.error_code),
            Body::AttrRply(b) => Some(b.error_code),
            Body::DaAdvert(b) => Some(b.error_code),
            Body::SrvTypeRply(b) => Some(b.error_code),
            _ => None,
        }
    }

    fn encode_into(&self, writer: &mut Vec<u8>) -> Result<()> {
        match self {
            Body::SrvRqst(b) => b.encode(writer),
            Body::SrvRply(b) => b.encode(writer),
            Body::SrvReg(b) => b.encode(writer),
            Body::SrvDeReg(b) => b.encode(writer),
            Body::SrvAck(b) => b.encode(writer),
            Body::AttrRqst(b) => b.encode(writer),
            Body::AttrRply(b) => b.encode(writer),
            Body::DaAdvert(b) => b.encode(writer),
            Body::SrvTypeRqst(b) => b.encode(writer),
            Body::SrvTypeRply(b) => b.encode(writer),
            Body::SaAdvert(b) => b.encode(writer),
        }
    }

    fn decode_for(function: FunctionId, reader: &mut WireReader<'_>) -> Result<Body> {
        let body = match function {
            FunctionId::SrvRqst => Body::SrvRqst(reader.read()?),
            FunctionId::SrvRply => Body::SrvRply(reader.read()?),
            FunctionId::SrvReg => Body::SrvReg(reader.read()?),
            FunctionId::SrvDeReg => Body::SrvDeReg(reader.read()?),
            FunctionId::SrvAck => Body::SrvAck(reader.read()?),
            FunctionId::AttrRqst => Body::AttrRqst(reader.read()?),
            FunctionId::AttrRply => Body::AttrRply(reader.read()?),
            FunctionId::DaAdvert => Body::DaAdvert(reader.read()?),
            FunctionId::SrvTypeRqst => Body::SrvTypeRqst(reader.read()?),
            FunctionId::SrvTypeRply => Body::SrvTypeRply(reader.read()?),
            FunctionId::SaAdvert => Body::SaAdvert(reader.read()?),
        };
        Ok(body)
    }
}

impl Message {
    pub fn new(header: MessageHeader, body: Body) -> Self {
        Message { header, body }
    }

    pub fn function(&self) -> FunctionId {
        self.body.function()
    }

    pub fn xid(&self) -> u16 {
        self.header.xid
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut body = Vec::new();
        self.body.encode_into(&mut body)?;
        let mut out = Vec::with_capacity(self.header.encoded_len() + body.len());
        self.header.serialize(self.function(), body.len(), &mut out)?;
        out.extend_from_slice(&body);
        Ok(out)
    }

    pub fn decode(bytes: &[u8]) -> Result<Message> {
        let mut reader = WireReader::new(bytes);
        let (function, header) = MessageHeader::deserialize(&mut reader, bytes.len())?;
        let body = Body::decode_for(function, &mut reader)?;
        Ok(Message { header, body })
    }

    /// Header for a reply to this message: same XID and language, no flags.
    pub fn reply_header(&self) -> MessageHeader {
        MessageHeader::new(self.header.xid, self.header.language.clone())
    }

    pub fn ack(&self, error_code: u16) -> Message {
        Message::new(self.reply_header(), Body::SrvAck(SrvAck { error_code }))
    }
}

fn decode_list(reader: &mut WireReader<'_>) -> Result<Vec<String>> {
    let text = String::decode(reader)?;
    Ok(text
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect())
}

fn decode_attributes(reader: &mut WireReader<'_>) -> Result<Attributes> {
    Attributes::from_wire(&String::decode(reader)?)
}

fn decode_scopes(reader: &mut WireReader<'_>) -> Result<Scopes> {
    Ok(Scopes::from_wire(&String::decode(reader)?))
}

fn encode_auth_count(writer: &mut Vec<u8>) -> Result<()> {
    0u8.encode(writer)
}

fn decode_auth_count(reader: &mut WireReader<'_>) -> Result<()> {
    match u8::decode(reader)? {
        0 => Ok(()),
        n => Err(SlpError::parse(format!(
            "{} authentication blocks present, authentication is not supported",
            n
        ))),
    }
}

// <URL Entry>: reserved, lifetime, URL, auth block count
impl SlpEncode for ServiceUrl {
    fn encode(&self, writer: &mut Vec<u8>) -> Result<()> {
        0u8.encode(writer)?;
        self.lifetime().encode(writer)?;
        self.as_str().encode(writer)?;
        encode_auth_count(writer)
    }
}

impl SlpDecode for ServiceUrl {
    fn decode(reader: &mut WireReader<'_>) -> Result<Self> {
        let _reserved = u8::decode(reader)?;
        let lifetime = u16::decode(reader)?;
        let url = String::decode(reader)?;
        decode_auth_count(reader)?;
        Ok(ServiceUrl::new(url, lifetime))
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SrvRqst {
    pub previous_responders: Vec<String>,
    pub service_type: ServiceType,
    pub scopes: Scopes,
    pub predicate: String,
    pub spi: String,
}

impl SlpEncode for SrvRqst {
    fn encode(&self, writer: &mut Vec<u8>) -> Result<()> {
        self.previous_responders.join(",").encode(writer)?;
        self.service_type.as_str().encode(writer)?;
        self.scopes.to_wire().encode(writer)?;
        self.predicate.encode(writer)?;
        self.spi.encode(writer)
    }
}

impl SlpDecode for SrvRqst {
    fn decode(reader: &mut WireReader<'_>) -> Result<Self> {
        Ok(SrvRqst {
            previous_responders: decode_list(reader)?,
            service_type: ServiceType::new(String::decode(reader)?),
            scopes: decode_scopes(reader)?,
            predicate: String::decode(reader)?,
            spi: String::decode(reader)?,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SrvRply {
    pub error_code: u16,
    pub urls: Vec<ServiceUrl>,
}

impl SlpEncode for SrvRply {
    fn encode(&self, writer: &mut Vec<u8>) -> Result<()> {
        self.error_code.encode(writer)?;
        let count = u16::try_from(self.urls.len()).map_err(|_| {
            SlpError::encoding(format!("{} URL entries exceed 65535", self.urls.len()))
        })?;
        count.encode(writer)?;
        for url in &self.urls {
            url.encode(writer)?;
        }
        Ok(())
    }
}

impl SlpDecode for SrvRply {
    fn decode(reader: &mut WireReader<'_>) -> Result<Self> {
        let error_code = u16::decode(reader)?;
        let count = u16::decode(reader)?;
        let mut urls = Vec::with_capacity(usize::from(count).min(reader.remaining()));
        for _ in 0..count {
            urls.push(ServiceUrl::decode(reader)?);
        }
        Ok(SrvRply { error_code, urls })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SrvReg {
    pub url: ServiceUrl,
    pub service_type: ServiceType,
    pub scopes: Scopes,
    pub attributes: Attributes,
}

impl SlpEncode for SrvReg {
    fn encode(&self, writer: &mut Vec<u8>) -> Result<()> {
        self.url.encode(writer)?;
        self.service_type.as_str().encode(writer)?;
        self.scopes.to_wire().encode(writer)?;
        self.attributes.to_wire().encode(writer)?;
        encode_auth_count(writer)
    }
}

impl SlpDecode for SrvReg {
    fn decode(reader: &mut WireReader<'_>) -> Result<Self> {
        let reg = SrvReg {
            url: ServiceUrl::decode(reader)?,
            service_type: ServiceType::new(String::decode(reader)?),
            scopes: decode_scopes(reader)?,
            attributes: decode_attributes(reader)?,
        };
        decode_auth_count(reader)?;
        Ok(reg)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SrvDeReg {
    pub scopes: Scopes,
    pub url: ServiceUrl,
    /// Non-empty for an update deregistration that only removes these attribute tags.
    pub tags: Vec<String>,
}

impl SlpEncode for SrvDeReg {
    fn encode(&self, writer: &mut Vec<u8>) -> Result<()> {
        self.scopes.to_wire().encode(writer)?;
        self.url.encode(writer)?;
        tag_list_to_wire(&self.tags).encode(writer)
    }
}

impl SlpDecode for SrvDeReg {
    fn decode(reader: &mut WireReader<'_>) -> Result<Self> {
        Ok(SrvDeReg {
            scopes: decode_scopes(reader)?,
            url: ServiceUrl::decode(reader)?,
            tags: parse_tag_list(&String::decode(reader)?),
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SrvAck {
    pub error_code: u16,
}

impl SlpEncode for SrvAck {
    fn encode(&self, writer: &mut Vec<u8>) -> Result<()> {
        self.error_code.encode(writer)
    }
}

impl SlpDecode for SrvAck {
    fn decode(reader: &mut WireReader<'_>) -> Result<Self> {
        Ok(SrvAck { error_code: u16::decode(reader)? })
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AttrRqst {
    pub previous_responders: Vec<String>,
    /// A service URL, or a service type to aggregate attributes over.
    pub url: String,
    pub scopes: Scopes,
    pub tags: Vec<String>,
    pub spi: String,
}

impl SlpEncode for AttrRqst {
    fn encode(&self, writer: &mut Vec<u8>) -> Result<()> {
        self.previous_responders.join(",").encode(writer)?;
        self.url.encode(writer)?;
        self.scopes.to_wire().encode(writer)?;
        tag_list_to_wire(&self.tags).encode(writer)?;
        self.spi.encode(writer)
    }
}

impl SlpDecode for AttrRqst {
    fn decode(reader: &mut WireReader<'_>) -> Result<Self> {
        Ok(AttrRqst {
            previous_responders: decode_list(reader)?,
            url: String::decode(reader)?,
            scopes: decode_scopes(reader)?,
            tags: parse_tag_list(&String::decode(reader)?),
            spi: String::decode(reader)?,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AttrRply {
    pub error_code: u16,
    pub attributes: Attributes,
}

impl SlpEncode for AttrRply {
    fn encode(&self, writer: &mut Vec<u8>) -> Result<()> {
        self.error_code.encode(writer)?;
        self.attributes.to_wire().encode(writer)?;
        encode_auth_count(writer)
    }
}

impl SlpDecode for AttrRply {
    fn decode(reader: &mut WireReader<'_>) -> Result<Self> {
        let error_code = u16::decode(reader)?;
        let attributes = decode_attributes(reader)?;
        decode_auth_count(reader)?;
        Ok(AttrRply { error_code, attributes })
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DaAdvert {
    pub error_code: u16,
    /// Zero announces that the DA is going down.
    pub boot_timestamp: u32,
    pub url: String,
    pub scopes: Scopes,
    pub attributes: Attributes,
    pub spi: String,
}

impl SlpEncode for DaAdvert {
    fn encode(&self, writer: &mut Vec<u8>) -> Result<()> {
        self.error_code.encode(writer)?;
        self.boot_timestamp.encode(writer)?;
        self.url.encode(writer)?;
        self.scopes.to_wire().encode(writer)?;
        self.attributes.to_wire().encode(writer)?;
        self.spi.encode(writer)?;
        encode_auth_count(writer)
    }
}

impl SlpDecode for DaAdvert {
    fn decode(reader: &mut WireReader<'_>) -> Result<Self> {
        let advert = DaAdvert {
            error_code: u16::decode(reader)?,
            boot_timestamp: u32::decode(reader)?,
            url: String::decode(reader)?,
            scopes: decode_scopes(reader)?,
            attributes: decode_attributes(reader)?,
            spi: String::decode(reader)?,
        };
        decode_auth_count(reader)?;
        Ok(advert)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SrvTypeRqst {
    pub previous_responders: Vec<String>,
    /// `None` asks for every naming authority; `Some("")` for IANA only.
    pub naming_authority: Option<String>,
    pub scopes: Scopes,
}

impl SrvTypeRqst {
    const ALL_AUTHORITIES: u16 = 0xFFFF;
}

impl SlpEncode for SrvTypeRqst {
    fn encode(&self, writer: &mut Vec<u8>) -> Result<()> {
        self.previous_responders.join(",").encode(writer)?;
        match &self.naming_authority {
            None => Self::ALL_AUTHORITIES.encode(writer)?,
            Some(na) => {
                if na.len() >= usize::from(Self::ALL_AUTHORITIES) {
                    return Err(SlpError::encoding("naming authority too long"));
                }
                na.encode(writer)?
            }
        }
        self.scopes.to_wire().encode(writer)
    }
}

impl SlpDecode for SrvTypeRqst {
    fn decode(reader: &mut WireReader<'_>) -> Result<Self> {
        let previous_responders = decode_list(reader)?;
        let na_len = u16::decode(reader)?;
        let naming_authority = if na_len == Self::ALL_AUTHORITIES {
            None
        } else {
            let bytes = reader.take(usize::from(na_len))?;
            let authority = String::from_utf8(bytes.to_vec())
                .map_err(|_| SlpError::parse("naming authority is not UTF-8"))?;
            Some(authority)
        };
        Ok(SrvTypeRqst {
            previous_responders,
            naming_authority,
            scopes: decode_scopes(reader)?,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SrvTypeRply {
    pub error_code: u16,
    pub service_types: Vec<ServiceType>,
}

impl SlpEncode for SrvTypeRply {
    fn encode(&self, writer: &mut Vec<u8>) -> Result<()> {
        self.error_code.encode(writer)?;
        let list = self.service_types.iter().map(ServiceType::as_str).collect::<Vec<_>>().join(",");
        list.encode(writer)
    }
}

impl SlpDecode for SrvTypeRply {
    fn decode(reader: &mut WireReader<'_>) -> Result<Self> {
        Ok(SrvTypeRply {
            error_code: u16::decode(reader)?,
            service_types: decode_list(reader)?.into_iter().map(ServiceType::new).collect(),
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SaAdvert {
    pub url: String,
    pub scopes: Scopes,
    pub attributes: Attributes,
}

impl SlpEncode for SaAdvert {
    fn encode(&self, writer: &mut Vec<u8>) -> Result<()> {
        self.url.encode(writer)?;
        self.scopes.to_wire().encode(writer)?;
        self.attributes.to_wire().encode(writer)?;
        encode_auth_count(writer)
    }
}

impl SlpDecode for SaAdvert {
    fn decode(reader: &mut WireReader<'_>) -> Result<Self> {
        let advert = SaAdvert {
            url: String::decode(reader)?,
            scopes: decode_scopes(reader)?,
            attributes: decode_attributes(reader)?,
        };
        decode_auth_count(reader)?;
        Ok(advert)
    }
}
