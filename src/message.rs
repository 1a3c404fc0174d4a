pub mod code;
pub mod datagram;
pub mod option;
pub mod options;
pub mod streaming;
pub mod token;

use bytes::Bytes;

pub use code::Code;
pub use datagram::{DatagramMessage, MessageType};
pub use option::{CoapOption, MediaType, OptionId};
pub use options::Options;
pub use streaming::StreamingMessage;
pub use token::Token;

/// Common shape of the two framings. Datagram and streaming messages differ
/// structurally (type and message id exist only on datagrams), so they stay
/// two concrete types sharing this trait.
pub trait CoapMessage: Send {
    fn code(&self) -> Code;
    fn set_code(&mut self, code: Code);
    fn token(&self) -> Token;
    fn set_token(&mut self, token: Token);
    fn options(&self) -> &Options;
    fn options_mut(&mut self) -> &mut Options;
    fn payload(&self) -> &Bytes;
    fn set_payload(&mut self, payload: Bytes);
}
