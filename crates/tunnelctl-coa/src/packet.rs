//! Dynamic Authorization packet codec
//!
//! ```text
//!  0        1        2                 4
//! +--------+--------+-----------------+
//! |  Code  |   Id   |     Length      |
//! +--------+--------+-----------------+
//! |        Authenticator (16)         |
//! +-----------------------------------+
//! |  Type  | Length |  Value ...      |
//! +--------+--------+-----------------+
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};
use md5::{Digest, Md5};
use std::net::Ipv4Addr;

use crate::error::CoaError;

pub const HEADER_SIZE: usize = 20;
pub const AUTHENTICATOR_SIZE: usize = 16;
pub const MAX_PACKET_SIZE: usize = 4096;
const MAX_ATTRIBUTE_VALUE: usize = 253;

pub const MIKROTIK_VENDOR_ID: u32 = 14988;
const MIKROTIK_RATE_LIMIT: u8 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Code {
    DisconnectRequest = 40,
    DisconnectAck = 41,
    DisconnectNak = 42,
    CoaRequest = 43,
    CoaAck = 44,
    CoaNak = 45,
}

impl Code {
    /// Acknowledgement expected for a request code
    pub fn ack(self) -> Option<Code> {
        match self {
            Code::DisconnectRequest => Some(Code::DisconnectAck),
            Code::CoaRequest => Some(Code::CoaAck),
            _ => None,
        }
    }

    pub fn is_request(self) -> bool {
        matches!(self, Code::DisconnectRequest | Code::CoaRequest)
    }
}

impl TryFrom<u8> for Code {
    type Error = CoaError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            40 => Ok(Code::DisconnectRequest),
            41 => Ok(Code::DisconnectAck),
            42 => Ok(Code::DisconnectNak),
            43 => Ok(Code::CoaRequest),
            44 => Ok(Code::CoaAck),
            45 => Ok(Code::CoaNak),
            _ => Err(CoaError::UnknownCode(value)),
        }
    }
}

/// Attributes this service sends
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attribute {
    UserName(String),
    NasIpAddress(Ipv4Addr),
    SessionTimeout(u32),
    CallingStationId(String),
    AcctSessionId(String),
    /// Vendor-Specific, MikroTik `Mikrotik-Rate-Limit`
    MikrotikRateLimit(String),
    /// Anything else, by type
    Other(u8, Vec<u8>),
}

impl Attribute {
    pub fn type_code(&self) -> u8 {
        match self {
            Attribute::UserName(_) => 1,
            Attribute::NasIpAddress(_) => 4,
            Attribute::SessionTimeout(_) => 27,
            Attribute::CallingStationId(_) => 31,
            Attribute::AcctSessionId(_) => 44,
            Attribute::MikrotikRateLimit(_) => 26,
            Attribute::Other(kind, _) => *kind,
        }
    }

    /// Value bytes as carried after the type and length octets
    pub fn value(&self) -> Vec<u8> {
        match self {
            Attribute::UserName(s)
            | Attribute::CallingStationId(s)
            | Attribute::AcctSessionId(s) => s.as_bytes().to_vec(),
            Attribute::NasIpAddress(addr) => addr.octets().to_vec(),
            Attribute::SessionTimeout(secs) => secs.to_be_bytes().to_vec(),
            Attribute::MikrotikRateLimit(limit) => {
                let mut value = Vec::with_capacity(6 + limit.len());
                value.extend_from_slice(&MIKROTIK_VENDOR_ID.to_be_bytes());
                value.push(MIKROTIK_RATE_LIMIT);
                value.push((limit.len() + 2) as u8);
                value.extend_from_slice(limit.as_bytes());
                value
            }
            Attribute::Other(_, value) => value.clone(),
        }
    }

    fn encode(&self, buf: &mut BytesMut) -> Result<(), CoaError> {
        let value = self.value();
        if value.is_empty() || value.len() > MAX_ATTRIBUTE_VALUE {
            return Err(CoaError::AttributeTooLong {
                attribute: self.type_code(),
                length: value.len(),
            });
        }
        buf.put_u8(self.type_code());
        buf.put_u8((value.len() + 2) as u8);
        buf.put_slice(&value);
        Ok(())
    }

    fn decode(kind: u8, value: &[u8]) -> Self {
        let text = || String::from_utf8_lossy(value).into_owned();
        match (kind, value.len()) {
            (1, _) => Attribute::UserName(text()),
            (4, 4) => Attribute::NasIpAddress(Ipv4Addr::new(value[0], value[1], value[2], value[3])),
            (27, 4) => Attribute::SessionTimeout(u32::from_be_bytes([
                value[0], value[1], value[2], value[3],
            ])),
            (31, _) => Attribute::CallingStationId(text()),
            (44, _) => Attribute::AcctSessionId(text()),
            _ => Attribute::Other(kind, value.to_vec()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub code: Code,
    pub identifier: u8,
    pub authenticator: [u8; AUTHENTICATOR_SIZE],
    pub attributes: Vec<Attribute>,
}

impl Packet {
    pub fn new(code: Code, identifier: u8, attributes: Vec<Attribute>) -> Self {
        Self {
            code,
            identifier,
            authenticator: [0; AUTHENTICATOR_SIZE],
            attributes,
        }
    }

    /// Encode a request and sign it.
    ///
    /// Request Authenticator = MD5(Code + Id + Length + 16 zero octets +
    /// Attributes + Secret). The computed value is stored in `self`.
    pub fn encode_request(&mut self, secret: &[u8]) -> Result<Bytes, CoaError> {
        let mut buf = self.encode_with(&[0; AUTHENTICATOR_SIZE])?;
        self.authenticator = keyed_digest(&buf, secret);
        buf[4..HEADER_SIZE].copy_from_slice(&self.authenticator);
        Ok(buf.freeze())
    }

    fn encode_with(&self, authenticator: &[u8; AUTHENTICATOR_SIZE]) -> Result<BytesMut, CoaError> {
        let mut attributes = BytesMut::new();
        for attribute in &self.attributes {
            attribute.encode(&mut attributes)?;
        }

        let length = HEADER_SIZE + attributes.len();
        if length > MAX_PACKET_SIZE {
            return Err(CoaError::PacketTooLarge(length));
        }

        let mut buf = BytesMut::with_capacity(length);
        buf.put_u8(self.code as u8);
        buf.put_u8(self.identifier);
        buf.put_u16(length as u16);
        buf.put_slice(authenticator);
        buf.put(attributes);
        Ok(buf)
    }

    pub fn decode(mut buf: Bytes) -> Result<Self, CoaError> {
        if buf.len() < HEADER_SIZE {
            return Err(CoaError::Malformed(format!(
                "{} bytes is shorter than the header",
                buf.len()
            )));
        }

        let code = Code::try_from(buf.get_u8())?;
        let identifier = buf.get_u8();
        let length = buf.get_u16() as usize;
        if length < HEADER_SIZE || length > MAX_PACKET_SIZE || length - 4 > buf.remaining() {
            return Err(CoaError::Malformed(format!("invalid length {}", length)));
        }
        let mut authenticator = [0; AUTHENTICATOR_SIZE];
        buf.copy_to_slice(&mut authenticator);

        // Octets past the declared length are padding
        let mut body = buf.split_to(length - HEADER_SIZE);
        let mut attributes = Vec::new();
        while body.has_remaining() {
            if body.remaining() < 2 {
                return Err(CoaError::Malformed("truncated attribute".to_string()));
            }
            let kind = body.get_u8();
            let attr_len = body.get_u8() as usize;
            if attr_len < 2 || attr_len - 2 > body.remaining() {
                return Err(CoaError::Malformed(format!(
                    "attribute {} has invalid length {}",
                    kind, attr_len
                )));
            }
            let value = body.split_to(attr_len - 2);
            attributes.push(Attribute::decode(kind, &value));
        }

        Ok(Self {
            code,
            identifier,
            authenticator,
            attributes,
        })
    }
}

/// Response Authenticator check for a reply datagram.
///
/// Response Authenticator = MD5(Code + Id + Length + Request Authenticator +
/// Attributes + Secret).
pub fn verify_response(
    reply: &[u8],
    request_authenticator: &[u8; AUTHENTICATOR_SIZE],
    secret: &[u8],
) -> bool {
    if reply.len() < HEADER_SIZE {
        return false;
    }
    let length = u16::from_be_bytes([reply[2], reply[3]]) as usize;
    if length < HEADER_SIZE || length > reply.len() {
        return false;
    }

    let mut signed = Vec::with_capacity(length);
    signed.extend_from_slice(&reply[..4]);
    signed.extend_from_slice(request_authenticator);
    signed.extend_from_slice(&reply[HEADER_SIZE..length]);

    keyed_digest(&signed, secret) == reply[4..HEADER_SIZE]
}

/// Sign a reply the way a server would; used by responders in tests and by
/// anything echoing acknowledgements.
pub fn sign_response(
    code: Code,
    identifier: u8,
    attributes: Vec<Attribute>,
    request_authenticator: &[u8; AUTHENTICATOR_SIZE],
    secret: &[u8],
) -> Result<Bytes, CoaError> {
    let packet = Packet::new(code, identifier, attributes);
    let mut buf = packet.encode_with(request_authenticator)?;
    let digest = keyed_digest(&buf, secret);
    buf[4..HEADER_SIZE].copy_from_slice(&digest);
    Ok(buf.freeze())
}

pub(crate) fn keyed_digest(data: &[u8], secret: &[u8]) -> [u8; AUTHENTICATOR_SIZE] {
    let mut hasher = Md5::new();
    hasher.update(data);
    hasher.update(secret);
    hasher.finalize().into()
}
