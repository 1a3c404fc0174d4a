//! CoAP client and server runtime for UDP (RFC 7252) and reliable byte
//! streams (RFC 8323), with the Observe extension (RFC 7641) and block-wise
//! transfers (RFC 7959).
//!
//! The crate is organised leaf to root:
//! * [`message`]: the wire codec for both framings and the ordered option
//!   list. Pure functions over byte buffers, no I/O.
//! * [`session`]: per-peer protocol state, i.e. message-id allocation and
//!   deduplication, confirmable retransmission, token-indexed response
//!   dispatch and Observe subscriptions.
//! * [`blockwise`]: fragmentation and reassembly of oversize bodies, on
//!   both the client and the server side.
//! * [`client`] / [`server`]: the user-facing request and handler APIs,
//!   uniform across both transports.
//!
//! Sockets, TLS/DTLS handshakes and route tables beyond a plain path map
//! stay outside: the engine only needs framed reads with a peer key and
//! framed writes (see [`transport`]).

pub mod blockwise;
pub mod client;
pub mod config;
pub mod error;
pub mod handler;
pub mod keepalive;
pub mod message;
pub mod pool;
pub mod server;
pub mod session;
pub mod transport;
pub mod writer;

pub use client::{Observation, TcpClient, UdpClient};
pub use config::{TcpConfig, UdpConfig};
pub use error::{Error, Result};
pub use handler::{handler_fn, Handler, Request, Response};
pub use message::{Code, DatagramMessage, MediaType, OptionId, Options, StreamingMessage, Token};
pub use server::{Router, Server};
pub use writer::ResponseWriter;

#[cfg(test)]
mod test {
    use tracing::Level;

    #[ctor::ctor]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_max_level(Level::TRACE)
            .try_init()
            .ok();
    }
}
