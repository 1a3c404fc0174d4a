use std::fmt::{Debug, Formatter};

use rand::RngCore;

use crate::error::{Error, Result};

/// Length of tokens produced by [`Token::random`].
const DEFAULT_RANDOM_LEN: usize = 4;

/// Exchange identifier of 0-8 bytes (RFC 7252 section 5.3.1). Tokens bind a
/// request to its response(s); for an Observe subscription the token
/// identifies the subscription for its whole lifetime.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Token {
    len: u8,
    bytes: [u8; 8],
}

impl Token {
    pub const EMPTY: Token = Token { len: 0, bytes: [0; 8] };

    pub fn new(value: &[u8]) -> Result<Token> {
        if value.len() > 8 {
            return Err(Error::InvalidTokenLength(value.len()));
        }
        let mut bytes = [0u8; 8];
        bytes[..value.len()].copy_from_slice(value);
        Ok(Token { len: value.len() as u8, bytes })
    }

    /// A fresh token of the 4-byte default length from the thread-local
    /// CSPRNG.
    pub fn random() -> Token {
        Token::random_with_len(DEFAULT_RANDOM_LEN).expect("default token length is in range")
    }

    /// A random token of an explicitly chosen length (1-8 bytes), for
    /// callers that want more collision margin than the default.
    pub fn random_with_len(len: usize) -> Result<Token> {
        if len == 0 || len > 8 {
            return Err(Error::InvalidTokenLength(len));
        }
        let mut bytes = [0u8; 8];
        rand::thread_rng().fill_bytes(&mut bytes[..len]);
        Ok(Token { len: len as u8, bytes })
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }
}

impl Debug for Token {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Token({:02x?})", self.as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bounds() {
        assert!(Token::new(&[]).unwrap().is_empty());
        assert_eq!(Token::new(&[1, 2, 3]).unwrap().as_bytes(), &[1, 2, 3]);
        assert_eq!(Token::new(&[0; 8]).unwrap().len(), 8);
        assert!(matches!(Token::new(&[0; 9]), Err(Error::InvalidTokenLength(9))));
    }

    #[test]
    fn test_random_tokens_differ() {
        let a = Token::random();
        let b = Token::random();
        assert_eq!(a.len(), 4);
        assert_ne!(a, b);
    }

    #[test]
    fn test_random_with_len() {
        assert_eq!(Token::random_with_len(8).unwrap().len(), 8);
        assert!(matches!(Token::random_with_len(0), Err(Error::InvalidTokenLength(0))));
        assert!(matches!(Token::random_with_len(9), Err(Error::InvalidTokenLength(9))));
    }

    #[test]
    fn test_map_key_semantics() {
        let a = Token::new(&[1, 2]).unwrap();
        let b = Token::new(&[1, 2]).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, Token::new(&[1, 2, 0]).unwrap());
    }
}
