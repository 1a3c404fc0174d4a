use std::fmt::{Debug, Formatter};

use bytes::Bytes;

use crate::error::{Error, Result};

/// CoAP option number (RFC 7252 section 5.10 plus the Observe and block-wise
/// registrations).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OptionId(pub u16);

impl OptionId {
    pub const IF_MATCH: OptionId = OptionId(1);
    pub const URI_HOST: OptionId = OptionId(3);
    pub const ETAG: OptionId = OptionId(4);
    pub const IF_NONE_MATCH: OptionId = OptionId(5);
    pub const OBSERVE: OptionId = OptionId(6);
    pub const URI_PORT: OptionId = OptionId(7);
    pub const LOCATION_PATH: OptionId = OptionId(8);
    pub const URI_PATH: OptionId = OptionId(11);
    pub const CONTENT_FORMAT: OptionId = OptionId(12);
    pub const MAX_AGE: OptionId = OptionId(14);
    pub const URI_QUERY: OptionId = OptionId(15);
    pub const ACCEPT: OptionId = OptionId(17);
    pub const LOCATION_QUERY: OptionId = OptionId(20);
    pub const BLOCK2: OptionId = OptionId(23);
    pub const BLOCK1: OptionId = OptionId(27);
    pub const SIZE2: OptionId = OptionId(28);
    pub const PROXY_URI: OptionId = OptionId(35);
    pub const PROXY_SCHEME: OptionId = OptionId(39);
    pub const SIZE1: OptionId = OptionId(60);
}

impl Debug for OptionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match *self {
            OptionId::IF_MATCH => "If-Match",
            OptionId::URI_HOST => "Uri-Host",
            OptionId::ETAG => "ETag",
            OptionId::IF_NONE_MATCH => "If-None-Match",
            OptionId::OBSERVE => "Observe",
            OptionId::URI_PORT => "Uri-Port",
            OptionId::LOCATION_PATH => "Location-Path",
            OptionId::URI_PATH => "Uri-Path",
            OptionId::CONTENT_FORMAT => "Content-Format",
            OptionId::MAX_AGE => "Max-Age",
            OptionId::URI_QUERY => "Uri-Query",
            OptionId::ACCEPT => "Accept",
            OptionId::LOCATION_QUERY => "Location-Query",
            OptionId::BLOCK2 => "Block2",
            OptionId::BLOCK1 => "Block1",
            OptionId::SIZE2 => "Size2",
            OptionId::PROXY_URI => "Proxy-Uri",
            OptionId::PROXY_SCHEME => "Proxy-Scheme",
            OptionId::SIZE1 => "Size1",
            _ => return write!(f, "Option({})", self.0),
        };
        write!(f, "{}", name)
    }
}

/// Content format registry values used by the typed accessors.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MediaType(pub u16);

impl MediaType {
    pub const TEXT_PLAIN: MediaType = MediaType(0);
    pub const APP_LINK_FORMAT: MediaType = MediaType(40);
    pub const APP_XML: MediaType = MediaType(41);
    pub const APP_OCTET_STREAM: MediaType = MediaType(42);
    pub const APP_EXI: MediaType = MediaType(47);
    pub const APP_JSON: MediaType = MediaType(50);
    pub const APP_CBOR: MediaType = MediaType(60);
}

/// One option instance. Repeated ids carry multi-value semantics, e.g. one
/// `Uri-Path` option per path segment.
#[derive(Clone, PartialEq, Eq)]
pub struct CoapOption {
    pub id: OptionId,
    pub value: Bytes,
}

impl CoapOption {
    pub fn new(id: OptionId, value: impl Into<Bytes>) -> CoapOption {
        CoapOption { id, value: value.into() }
    }

    /// Big-endian with leading zeroes trimmed; zero encodes to zero bytes.
    pub fn from_u32(id: OptionId, value: u32) -> CoapOption {
        CoapOption { id, value: encode_u32(value) }
    }

    pub fn as_u32(&self) -> Result<u32> {
        decode_u32(&self.value)
    }
}

impl Debug for CoapOption {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}={:02x?}", self.id, self.value.as_ref())
    }
}

pub(crate) fn encode_u32(value: u32) -> Bytes {
    let raw = value.to_be_bytes();
    let skip = raw.iter().take_while(|b| **b == 0).count();
    Bytes::copy_from_slice(&raw[skip..])
}

pub(crate) fn decode_u32(value: &[u8]) -> Result<u32> {
    if value.len() > 4 {
        return Err(Error::MalformedOption);
    }
    let mut result = 0u32;
    for b in value {
        result = result << 8 | *b as u32;
    }
    Ok(result)
}
