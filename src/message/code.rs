use std::fmt::{Debug, Display, Formatter};

/// CoAP code, an 8-bit value split into a 3-bit class and 5-bit detail and
/// conventionally written `c.dd` (RFC 7252 section 3).
///
/// Class 0 with non-zero detail is a request method, classes 2/4/5 are
/// responses, class 7 is signalling (reliable transports only, RFC 8323).
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Code(pub u8);

impl Code {
    pub const EMPTY: Code = Code(0);

    // methods
    pub const GET: Code = Code::new(0, 1);
    pub const POST: Code = Code::new(0, 2);
    pub const PUT: Code = Code::new(0, 3);
    pub const DELETE: Code = Code::new(0, 4);

    // success responses
    pub const CREATED: Code = Code::new(2, 1);
    pub const DELETED: Code = Code::new(2, 2);
    pub const VALID: Code = Code::new(2, 3);
    pub const CHANGED: Code = Code::new(2, 4);
    pub const CONTENT: Code = Code::new(2, 5);
    pub const CONTINUE: Code = Code::new(2, 31);

    // client errors
    pub const BAD_REQUEST: Code = Code::new(4, 0);
    pub const UNAUTHORIZED: Code = Code::new(4, 1);
    pub const BAD_OPTION: Code = Code::new(4, 2);
    pub const FORBIDDEN: Code = Code::new(4, 3);
    pub const NOT_FOUND: Code = Code::new(4, 4);
    pub const METHOD_NOT_ALLOWED: Code = Code::new(4, 5);
    pub const NOT_ACCEPTABLE: Code = Code::new(4, 6);
    pub const REQUEST_ENTITY_INCOMPLETE: Code = Code::new(4, 8);
    pub const PRECONDITION_FAILED: Code = Code::new(4, 12);
    pub const REQUEST_ENTITY_TOO_LARGE: Code = Code::new(4, 13);
    pub const UNSUPPORTED_MEDIA_TYPE: Code = Code::new(4, 15);

    // server errors
    pub const INTERNAL_SERVER_ERROR: Code = Code::new(5, 0);
    pub const NOT_IMPLEMENTED: Code = Code::new(5, 1);
    pub const BAD_GATEWAY: Code = Code::new(5, 2);
    pub const SERVICE_UNAVAILABLE: Code = Code::new(5, 3);
    pub const GATEWAY_TIMEOUT: Code = Code::new(5, 4);
    pub const PROXYING_NOT_SUPPORTED: Code = Code::new(5, 5);

    // signalling (streaming transports)
    pub const CSM: Code = Code::new(7, 1);
    pub const PING: Code = Code::new(7, 2);
    pub const PONG: Code = Code::new(7, 3);
    pub const RELEASE: Code = Code::new(7, 4);
    pub const ABORT: Code = Code::new(7, 5);

    pub const fn new(class: u8, detail: u8) -> Code {
        Code(class << 5 | (detail & 0x1f))
    }

    pub const fn class(self) -> u8 {
        self.0 >> 5
    }

    pub const fn detail(self) -> u8 {
        self.0 & 0x1f
    }

    pub fn is_empty(self) -> bool {
        self == Code::EMPTY
    }

    /// A request method: class 0 with non-zero detail.
    pub fn is_request(self) -> bool {
        self.class() == 0 && self.detail() != 0
    }

    pub fn is_response(self) -> bool {
        matches!(self.class(), 2 | 4 | 5)
    }

    pub fn is_signalling(self) -> bool {
        self.class() == 7
    }
}

impl From<u8> for Code {
    fn from(raw: u8) -> Code {
        Code(raw)
    }
}

impl Display for Code {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{:02}", self.class(), self.detail())
    }
}

impl Debug for Code {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Code({})", self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::empty(Code::EMPTY, 0, 0, "0.00")]
    #[case::get(Code::GET, 0, 1, "0.01")]
    #[case::delete(Code::DELETE, 0, 4, "0.04")]
    #[case::content(Code::CONTENT, 2, 5, "2.05")]
    #[case::cont(Code::CONTINUE, 2, 31, "2.31")]
    #[case::not_found(Code::NOT_FOUND, 4, 4, "4.04")]
    #[case::csm(Code::CSM, 7, 1, "7.01")]
    fn test_class_detail(#[case] code: Code, #[case] class: u8, #[case] detail: u8, #[case] display: &str) {
        assert_eq!(code.class(), class);
        assert_eq!(code.detail(), detail);
        assert_eq!(code.to_string(), display);
    }

    #[rstest]
    #[case::get(Code::GET, true, false, false)]
    #[case::put(Code::PUT, true, false, false)]
    #[case::empty(Code::EMPTY, false, false, false)]
    #[case::content(Code::CONTENT, false, true, false)]
    #[case::bad_request(Code::BAD_REQUEST, false, true, false)]
    #[case::internal(Code::INTERNAL_SERVER_ERROR, false, true, false)]
    #[case::ping(Code::PING, false, false, true)]
    fn test_predicates(#[case] code: Code, #[case] request: bool, #[case] response: bool, #[case] signalling: bool) {
        assert_eq!(code.is_request(), request);
        assert_eq!(code.is_response(), response);
        assert_eq!(code.is_signalling(), signalling);
    }

    #[test]
    fn test_raw_values() {
        assert_eq!(Code::GET.0, 1);
        assert_eq!(Code::CONTENT.0, 69);
        assert_eq!(Code::CONTINUE.0, 95);
        assert_eq!(Code::NOT_FOUND.0, 132);
        assert_eq!(Code::CSM.0, 225);
        assert_eq!(Code::PONG.0, 227);
    }
}
