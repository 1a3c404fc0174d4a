use crate::message::Code;

/// Protocol-level errors surfaced to callers of the codec, the sessions and
/// the block-wise coordinator.
///
/// Codec errors never carry partial side effects: a failed decode leaves the
/// input untouched, a failed encode has not written past the end of the
/// target buffer.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The input ends before the declared end of the message. For streaming
    /// transports this means "read more bytes and retry".
    #[error("buffer too short for a complete message")]
    ShortBuffer,

    /// The target buffer cannot hold the encoded message; `required` is the
    /// size that would succeed.
    #[error("target buffer too small, {required} bytes required")]
    BufferTooSmall { required: usize },

    #[error("malformed message header")]
    MalformedHeader,

    #[error("malformed message")]
    MalformedMessage,

    #[error("malformed option")]
    MalformedOption,

    #[error("invalid token length {0}, tokens are 0-8 bytes")]
    InvalidTokenLength(usize),

    #[error("reserved extend marker 15 in option header")]
    InvalidExtendMarker,

    #[error("option value exceeds the remaining message bytes")]
    OptionTruncated,

    #[error("option value out of range for option {0}")]
    InvalidOptionValue(u16),

    #[error("request carries no usable token")]
    InvalidToken,

    #[error("token is already bound to an outstanding exchange")]
    TokenInUse,

    #[error("message id is still bound to an unacknowledged confirmable")]
    MessageIdInUse,

    /// All retransmissions of a confirmable message went unacknowledged.
    #[error("confirmable message timed out after all retransmissions")]
    TransmitTimeout,

    /// The peer answered a confirmable message with Reset.
    #[error("peer reset the exchange")]
    PeerReset,

    #[error("session is closed")]
    ConnectionClosed,

    #[error("request was cancelled")]
    Cancelled,

    #[error("block-wise transfer deadline exceeded")]
    BlockTimeout,

    #[error("block-wise fragment out of order")]
    BlockOutOfOrder,

    #[error("message exceeds the peer's maximum message size")]
    MessageTooLarge,

    /// A handler tried to send a request method code as a response.
    #[error("{0} is not a valid response code")]
    InvalidResponseCode(Code),

    #[error("payload writes require a content format (and vice versa)")]
    MissingContentFormat,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
