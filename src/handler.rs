use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;

use crate::message::{Code, Options, Token};

/// Transport-neutral view of an inbound request, handed to application
/// handlers for both the datagram and the streaming transport.
#[derive(Clone, Debug)]
pub struct Request {
    pub peer: SocketAddr,
    pub code: Code,
    pub token: Token,
    pub options: Options,
    pub payload: Bytes,
    pub(crate) kind: RequestKind,
}

#[derive(Clone, Copy, Debug)]
pub(crate) enum RequestKind {
    Datagram { message_id: u16, confirmable: bool },
    Streaming,
}

impl Request {
    pub fn path(&self) -> String {
        self.options.path()
    }
}

/// Transport-neutral response or notification message. The session converts
/// it into its concrete framing on write.
#[derive(Clone, Debug)]
pub struct Response {
    pub code: Code,
    pub token: Token,
    pub options: Options,
    pub payload: Bytes,
}

impl Response {
    pub fn new(code: Code) -> Response {
        Response {
            code,
            token: Token::EMPTY,
            options: Options::new(),
            payload: Bytes::new(),
        }
    }
}

pub type HandlerFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Application handler: receives the request and a response writer; whatever
/// the handler set when it returns is sent as the reply (an empty ACK for
/// confirmable datagram requests that got none).
pub type Handler = Arc<dyn Fn(Request, crate::writer::ResponseWriter) -> HandlerFuture + Send + Sync>;

/// Adapt an async closure into a [`Handler`].
pub fn handler_fn<F, Fut>(f: F) -> Handler
where
    F: Fn(Request, crate::writer::ResponseWriter) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |req, writer| Box::pin(f(req, writer)))
}
