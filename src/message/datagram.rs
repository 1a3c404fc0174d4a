use std::fmt::{Debug, Formatter};

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};
use crate::message::code::Code;
use crate::message::options::{Options, PAYLOAD_MARKER};
use crate::message::token::Token;
use crate::message::CoapMessage;

const VERSION: u8 = 1;
const HEADER_LEN: usize = 4;
pub(crate) const MAX_TOKEN_LEN: usize = 8;

/// Message type of the datagram transport (RFC 7252 section 3). Reliable
/// transports have no message type.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageType {
    Confirmable,
    NonConfirmable,
    Acknowledgement,
    Reset,
}

impl MessageType {
    fn from_bits(bits: u8) -> MessageType {
        match bits & 0x03 {
            0 => MessageType::Confirmable,
            1 => MessageType::NonConfirmable,
            2 => MessageType::Acknowledgement,
            _ => MessageType::Reset,
        }
    }

    fn to_bits(self) -> u8 {
        match self {
            MessageType::Confirmable => 0,
            MessageType::NonConfirmable => 1,
            MessageType::Acknowledgement => 2,
            MessageType::Reset => 3,
        }
    }
}

/// A message in the datagram framing: fixed 4-byte header, token, options,
/// optional payload behind the 0xff marker.
#[derive(Clone, PartialEq, Eq)]
pub struct DatagramMessage {
    pub message_type: MessageType,
    pub code: Code,
    pub message_id: u16,
    pub token: Token,
    pub options: Options,
    pub payload: Bytes,
}

impl DatagramMessage {
    pub fn new(message_type: MessageType, code: Code, message_id: u16) -> DatagramMessage {
        DatagramMessage {
            message_type,
            code,
            message_id,
            token: Token::EMPTY,
            options: Options::new(),
            payload: Bytes::new(),
        }
    }

    /// An empty ACK / RST for a received message id.
    pub fn empty(message_type: MessageType, message_id: u16) -> DatagramMessage {
        DatagramMessage::new(message_type, Code::EMPTY, message_id)
    }

    pub fn is_confirmable(&self) -> bool {
        self.message_type == MessageType::Confirmable
    }

    pub fn encoded_len(&self) -> usize {
        let mut len = HEADER_LEN + self.token.len() + self.options.encoded_len();
        if !self.payload.is_empty() {
            len += 1 + self.payload.len();
        }
        len
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(VERSION << 6 | self.message_type.to_bits() << 4 | self.token.len() as u8);
        buf.put_u8(self.code.0);
        buf.put_u16(self.message_id);
        buf.put_slice(self.token.as_bytes());
        self.options.encode(buf);
        if !self.payload.is_empty() {
            buf.put_u8(PAYLOAD_MARKER);
            buf.put_slice(&self.payload);
        }
    }

    /// Encode into a caller-supplied buffer. If the buffer is too small the
    /// required size is reported and nothing is written.
    pub fn encode_to(&self, buf: &mut [u8]) -> Result<usize> {
        let required = self.encoded_len();
        if buf.len() < required {
            return Err(Error::BufferTooSmall { required });
        }
        let mut target = BytesMut::with_capacity(required);
        self.encode(&mut target);
        buf[..required].copy_from_slice(&target);
        Ok(required)
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode(&mut buf);
        buf.freeze()
    }

    /// Decode one datagram. The whole input is the message; a payload marker
    /// followed by no payload is a format error.
    pub fn decode(data: &[u8]) -> Result<DatagramMessage> {
        if data.len() < HEADER_LEN {
            return Err(Error::ShortBuffer);
        }
        if data[0] >> 6 != VERSION {
            return Err(Error::MalformedHeader);
        }
        let message_type = MessageType::from_bits(data[0] >> 4);
        let token_len = (data[0] & 0x0f) as usize;
        if token_len > MAX_TOKEN_LEN {
            return Err(Error::InvalidTokenLength(token_len));
        }
        let code = Code(data[1]);
        let message_id = u16::from_be_bytes([data[2], data[3]]);

        if data.len() < HEADER_LEN + token_len {
            return Err(Error::ShortBuffer);
        }
        let token = Token::new(&data[HEADER_LEN..HEADER_LEN + token_len])?;

        let rest = &data[HEADER_LEN + token_len..];
        let (options, consumed) = Options::decode(rest)?;

        let payload = match rest.get(consumed) {
            None => Bytes::new(),
            Some(&PAYLOAD_MARKER) if rest.len() > consumed + 1 => {
                Bytes::copy_from_slice(&rest[consumed + 1..])
            }
            Some(_) => return Err(Error::MalformedMessage),
        };

        Ok(DatagramMessage {
            message_type,
            code,
            message_id,
            token,
            options,
            payload,
        })
    }
}

impl CoapMessage for DatagramMessage {
    fn code(&self) -> Code {
        self.code
    }

    fn set_code(&mut self, code: Code) {
        self.code = code;
    }

    fn token(&self) -> Token {
        self.token
    }

    fn set_token(&mut self, token: Token) {
        self.token = token;
    }

    fn options(&self) -> &Options {
        &self.options
    }

    fn options_mut(&mut self) -> &mut Options {
        &mut self.options
    }

    fn payload(&self) -> &Bytes {
        &self.payload
    }

    fn set_payload(&mut self, payload: Bytes) {
        self.payload = payload;
    }
}

impl Debug for DatagramMessage {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "DatagramMessage{{{:?} {} mid={:#06x} {:?} {:?} payload={}B}}",
            self.message_type,
            self.code,
            self.message_id,
            self.token,
            self.options,
            self.payload.len()
        )
    }
}
