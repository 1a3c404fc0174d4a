use std::fmt::{Debug, Formatter};

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};
use crate::message::code::Code;
use crate::message::datagram::MAX_TOKEN_LEN;
use crate::message::options::{put_ext, read_ext, split_ext, Options, PAYLOAD_MARKER};
use crate::message::token::Token;
use crate::message::CoapMessage;

/// A message in the streaming framing of RFC 8323: no type, no message id,
/// a variable-length header carrying the combined length of options and
/// payload using the option codec's 13/14 extension scheme.
#[derive(Clone, PartialEq, Eq)]
pub struct StreamingMessage {
    pub code: Code,
    pub token: Token,
    pub options: Options,
    pub payload: Bytes,
}

impl StreamingMessage {
    pub fn new(code: Code) -> StreamingMessage {
        StreamingMessage {
            code,
            token: Token::EMPTY,
            options: Options::new(),
            payload: Bytes::new(),
        }
    }

    /// Length of the frame body: options plus payload marker plus payload.
    fn body_len(&self) -> usize {
        let mut len = self.options.encoded_len();
        if !self.payload.is_empty() {
            len += 1 + self.payload.len();
        }
        len
    }

    pub fn encoded_len(&self) -> usize {
        let (nibble, _) = split_ext(self.body_len());
        let ext = match nibble {
            13 => 1,
            14 => 2,
            _ => 0,
        };
        1 + ext + 1 + self.token.len() + self.body_len()
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        let (len_nibble, len_ext) = split_ext(self.body_len());
        buf.put_u8(len_nibble << 4 | self.token.len() as u8);
        put_ext(buf, len_nibble, len_ext);
        buf.put_u8(self.code.0);
        buf.put_slice(self.token.as_bytes());
        self.options.encode(buf);
        if !self.payload.is_empty() {
            buf.put_u8(PAYLOAD_MARKER);
            buf.put_slice(&self.payload);
        }
    }

    /// Encode into a caller-supplied buffer, reporting the required size
    /// without writing if the buffer is too small.
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

    /// Decode one frame from the start of `data`. Returns the message and the
    /// number of bytes consumed; `ShortBuffer` means the frame is not yet
    /// complete and the caller should read more bytes and retry.
    pub fn decode(data: &[u8]) -> Result<(StreamingMessage, usize)> {
        if data.is_empty() {
            return Err(Error::ShortBuffer);
        }
        let len_nibble = data[0] >> 4;
        let token_len = (data[0] & 0x0f) as usize;
        if len_nibble == 15 {
            return Err(Error::InvalidExtendMarker);
        }
        if token_len > MAX_TOKEN_LEN {
            return Err(Error::InvalidTokenLength(token_len));
        }

        let mut idx = 1;
        let body_len = match read_ext(data, &mut idx, len_nibble) {
            Ok(len) => len,
            // the header extension itself may still be in flight
            Err(Error::OptionTruncated) => return Err(Error::ShortBuffer),
            Err(e) => return Err(e),
        };

        if data.len() < idx + 1 + token_len + body_len {
            return Err(Error::ShortBuffer);
        }
        let code = Code(data[idx]);
        idx += 1;
        let token = Token::new(&data[idx..idx + token_len])?;
        idx += token_len;

        let body = &data[idx..idx + body_len];
        let (options, consumed) = Options::decode(body)?;
        let payload = match body.get(consumed) {
            None => Bytes::new(),
            Some(&PAYLOAD_MARKER) if body.len() > consumed + 1 => {
                Bytes::copy_from_slice(&body[consumed + 1..])
            }
            Some(_) => return Err(Error::MalformedMessage),
        };

        Ok((
            StreamingMessage {
                code,
                token,
                options,
                payload,
            },
            idx + body_len,
        ))
    }
}

impl CoapMessage for StreamingMessage {
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

impl Debug for StreamingMessage {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "StreamingMessage{{{} {:?} {:?} payload={}B}}",
            self.code,
            self.token,
            self.options,
            self.payload.len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::option::MediaType;
    use rstest::rstest;

    // expected byte sequences follow the framing examples of RFC 8323
    #[rstest]
    #[case::empty(StreamingMessage::new(Code::EMPTY), vec![0x00, 0x00])]
    #[case::bare_get(StreamingMessage::new(Code::GET), vec![0x00, 0x01])]
    #[case::payload_only({
        let mut msg = StreamingMessage::new(Code::GET);
        msg.payload = Bytes::from_static(&[0x01]);
        msg
    }, vec![0x20, 0x01, 0xff, 0x01])]
    #[case::token_and_payload({
        let mut msg = StreamingMessage::new(Code::GET);
        msg.token = Token::new(&[0x01, 0x02, 0x03]).unwrap();
        msg.payload = Bytes::from_static(&[0x01]);
        msg
    }, vec![0x23, 0x01, 0x01, 0x02, 0x03, 0xff, 0x01])]
    #[case::with_options({
        let mut msg = StreamingMessage::new(Code::EMPTY);
        msg.token = Token::new(&[0x01, 0x02, 0x03]).unwrap();
        msg.options.set_path("/a/b/c/d/e").unwrap();
        msg.options.set_content_format(MediaType::TEXT_PLAIN);
        msg.payload = Bytes::from_static(&[0x01]);
        msg
    }, vec![0xd3, 0x00, 0x00, 0x01, 0x02, 0x03, 177, 97, 1, 98, 1, 99, 1, 100, 1, 101, 16, 0xff, 0x01])]
    fn test_encode_decode(#[case] msg: StreamingMessage, #[case] encoded: Vec<u8>) {
        assert_eq!(msg.to_bytes().as_ref(), encoded.as_slice());
        assert_eq!(msg.encoded_len(), encoded.len());

        let (decoded, consumed) = StreamingMessage::decode(&encoded).unwrap();
        assert_eq!(consumed, encoded.len());
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_decode_leaves_following_frame() {
        let mut buf = Vec::new();
        let mut first = StreamingMessage::new(Code::CONTENT);
        first.payload = Bytes::from_static(b"x");
        buf.extend_from_slice(&first.to_bytes());
        buf.extend_from_slice(&StreamingMessage::new(Code::PING).to_bytes());

        let (decoded, consumed) = StreamingMessage::decode(&buf).unwrap();
        assert_eq!(decoded, first);

        let (second, _) = StreamingMessage::decode(&buf[consumed..]).unwrap();
        assert_eq!(second.code, Code::PING);
    }

    #[test]
    fn test_decode_incomplete_frame() {
        let mut msg = StreamingMessage::new(Code::CONTENT);
        msg.token = Token::new(&[1, 2]).unwrap();
        msg.payload = Bytes::from_static(b"payload bytes");
        let encoded = msg.to_bytes();

        for cut in 0..encoded.len() {
            assert!(
                matches!(StreamingMessage::decode(&encoded[..cut]), Err(Error::ShortBuffer)),
                "prefix of {} bytes should be short",
                cut
            );
        }
    }

    #[test]
    fn test_large_body_uses_length_extension() {
        let mut msg = StreamingMessage::new(Code::CONTENT);
        msg.payload = Bytes::from(vec![0xab; 600]);
        let encoded = msg.to_bytes();

        // 601 body bytes (marker + payload) need the two-byte extension
        assert_eq!(encoded[0] >> 4, 14);
        let (decoded, consumed) = StreamingMessage::decode(&encoded).unwrap();
        assert_eq!(consumed, encoded.len());
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_decode_reserved_length_nibble() {
        assert!(matches!(
            StreamingMessage::decode(&[0xf0, 0x01]),
            Err(Error::InvalidExtendMarker)
        ));
    }

    #[test]
    fn test_decode_token_length_9() {
        assert!(matches!(
            StreamingMessage::decode(&[0x09, 0x01, 1, 2, 3, 4, 5, 6, 7, 8, 9]),
            Err(Error::InvalidTokenLength(9))
        ));
    }
}
