use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;

use crate::error::{Error, Result};
use crate::handler::{Request, RequestKind, Response};
use crate::message::{Code, MediaType, Options, Token};
use crate::session::datagram::DatagramSession;
use crate::session::streaming::StreamingSession;

#[derive(Clone)]
enum WriterTarget {
    Datagram(Arc<DatagramSession>),
    Streaming(Arc<StreamingSession>),
    Buffered(Arc<BufferedTarget>),
}

/// Interception point for the block-wise middleware: the handler's first
/// response is captured instead of sent, so it can be fragmented. Once
/// drained, later writes (observe-style notifications) pass through to the
/// real writer.
pub(crate) struct BufferedTarget {
    slot: std::sync::Mutex<BufferSlot>,
}

enum BufferSlot {
    Buffering(Option<Response>),
    PassThrough(ResponseWriter),
}

impl BufferedTarget {
    pub fn new() -> Arc<BufferedTarget> {
        Arc::new(BufferedTarget {
            slot: std::sync::Mutex::new(BufferSlot::Buffering(None)),
        })
    }

    /// The captured response, if any; afterwards the target forwards writes
    /// to `real`.
    pub fn take(&self, real: ResponseWriter) -> Option<Response> {
        let mut slot = self.slot.lock().unwrap();
        let captured = match &mut *slot {
            BufferSlot::Buffering(captured) => captured.take(),
            BufferSlot::PassThrough(_) => None,
        };
        *slot = BufferSlot::PassThrough(real);
        captured
    }

    fn store_or_forward(&self, response: Response) -> std::result::Result<(), (ResponseWriter, Response)> {
        let mut slot = self.slot.lock().unwrap();
        match &mut *slot {
            BufferSlot::Buffering(captured) => {
                // the latest write wins while buffering
                *captured = Some(response);
                Ok(())
            }
            BufferSlot::PassThrough(writer) => Err((writer.clone(), response)),
        }
    }
}

/// Handed to application handlers to construct the reply. For Observe the
/// writer can be moved into a long-lived task and used for notifications
/// after the handler returned.
#[derive(Clone)]
pub struct ResponseWriter {
    target: WriterTarget,
    kind: RequestKind,
    request_code: Code,
    token: Token,
    code: Option<Code>,
    content_format: Option<MediaType>,
    written: Arc<AtomicBool>,
}

impl ResponseWriter {
    pub(crate) fn for_datagram(session: Arc<DatagramSession>, request: &Request) -> ResponseWriter {
        ResponseWriter {
            target: WriterTarget::Datagram(session),
            kind: request.kind,
            request_code: request.code,
            token: request.token,
            code: None,
            content_format: None,
            written: Arc::new(AtomicBool::new(false)),
        }
    }

    pub(crate) fn for_streaming(session: Arc<StreamingSession>, request: &Request) -> ResponseWriter {
        ResponseWriter {
            target: WriterTarget::Streaming(session),
            kind: request.kind,
            request_code: request.code,
            token: request.token,
            code: None,
            content_format: None,
            written: Arc::new(AtomicBool::new(false)),
        }
    }

    pub(crate) fn written_flag(&self) -> Arc<AtomicBool> {
        self.written.clone()
    }

    /// A sibling writer for the same exchange that captures into `buffer`
    /// instead of sending. Shares the written flag with this writer.
    pub(crate) fn buffered(&self, buffer: Arc<BufferedTarget>) -> ResponseWriter {
        ResponseWriter {
            target: WriterTarget::Buffered(buffer),
            kind: self.kind,
            request_code: self.request_code,
            token: self.token,
            code: None,
            content_format: None,
            written: self.written.clone(),
        }
    }

    /// Explicit response code; without it `write` derives the code from the
    /// request method.
    pub fn set_code(&mut self, code: Code) {
        self.code = Some(code);
    }

    pub fn set_content_format(&mut self, format: MediaType) {
        self.content_format = Some(format);
    }

    /// Default response code by request method.
    fn derived_code(&self) -> Code {
        match self.code {
            Some(code) => code,
            None => match self.request_code {
                Code::POST => Code::CHANGED,
                Code::PUT => Code::CREATED,
                Code::DELETE => Code::DELETED,
                _ => Code::CONTENT,
            },
        }
    }

    /// Send the response with the given payload. A non-empty payload requires
    /// a content format; a content format without payload is equally a
    /// mistake.
    pub async fn write(&mut self, payload: &[u8]) -> Result<()> {
        if !payload.is_empty() && self.content_format.is_none() {
            return Err(Error::MissingContentFormat);
        }
        if payload.is_empty() && self.content_format.is_some() {
            return Err(Error::MissingContentFormat);
        }

        let mut response = self.new_response(self.derived_code());
        if let Some(format) = self.content_format {
            response.options.set_content_format(format);
        }
        response.payload = Bytes::copy_from_slice(payload);
        self.write_message(response).await
    }

    /// A response skeleton bound to the request's exchange.
    pub fn new_response(&self, code: Code) -> Response {
        Response {
            code,
            token: self.token,
            options: Options::new(),
            payload: Bytes::new(),
        }
    }

    /// Send a fully built response message. Request method codes are not
    /// valid responses.
    pub async fn write_message(&mut self, response: Response) -> Result<()> {
        if response.code.is_request() {
            return Err(Error::InvalidResponseCode(response.code));
        }

        match &self.target {
            // buffered writes leave the written flag to the eventual real
            // write, so piggybacking still works for the forwarded response
            WriterTarget::Buffered(buffer) => match buffer.store_or_forward(response) {
                Ok(()) => Ok(()),
                Err((mut writer, response)) => writer.send_direct(response).await,
            },
            _ => self.send_direct(response).await,
        }
    }

    /// The non-buffered send path. The pass-through writer installed by
    /// `BufferedTarget::take` is always session-backed, so this never
    /// re-enters a buffer.
    async fn send_direct(&mut self, response: Response) -> Result<()> {
        match &self.target {
            WriterTarget::Datagram(session) => {
                let first_write = !self.written.swap(true, Ordering::SeqCst);
                let result = session.send_response(self.kind, response, first_write).await;
                if result.is_err() && first_write {
                    self.written.store(false, Ordering::SeqCst);
                }
                result
            }
            WriterTarget::Streaming(session) => {
                self.written.store(true, Ordering::SeqCst);
                session.send_response(response).await
            }
            WriterTarget::Buffered(_) => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UdpConfig;
    use crate::handler::handler_fn;
    use crate::message::{DatagramMessage, MessageType};
    use crate::pool::WorkerPool;
    use crate::transport::DatagramTransport;
    use async_trait::async_trait;
    use std::net::SocketAddr;
    use std::time::Duration;
    use tokio::time::sleep;

    struct CapturingTransport {
        sent: std::sync::Mutex<Vec<Vec<u8>>>,
    }

    #[async_trait]
    impl DatagramTransport for CapturingTransport {
        async fn recv_from(&self, _buf: &mut [u8]) -> Result<(usize, SocketAddr)> {
            std::future::pending().await
        }

        async fn send_to(&self, buf: &[u8], _to: SocketAddr) -> Result<()> {
            self.sent.lock().unwrap().push(buf.to_vec());
            Ok(())
        }

        fn local_addr(&self) -> Result<SocketAddr> {
            Ok(SocketAddr::from(([127, 0, 0, 1], 0)))
        }
    }

    fn harness(handler: crate::handler::Handler) -> (Arc<DatagramSession>, Arc<CapturingTransport>) {
        let transport = Arc::new(CapturingTransport {
            sent: std::sync::Mutex::new(Vec::new()),
        });
        let session = DatagramSession::new(
            Arc::new(UdpConfig::default()),
            transport.clone(),
            SocketAddr::from(([127, 0, 0, 1], 5683)),
            handler,
            WorkerPool::new(Default::default()),
        );
        (session, transport)
    }

    async fn run_request(session: &Arc<DatagramSession>, code: Code) {
        let mut req = DatagramMessage::new(MessageType::Confirmable, code, 0);
        req.message_id = 0x4242;
        req.token = Token::new(&[1, 2]).unwrap();
        session.process(&req.to_bytes()).await;
        sleep(Duration::from_millis(5)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_default_codes_by_method() {
        for (method, expected) in [
            (Code::GET, Code::CONTENT),
            (Code::POST, Code::CHANGED),
            (Code::PUT, Code::CREATED),
            (Code::DELETE, Code::DELETED),
        ] {
            let handler = handler_fn(move |_req, mut w| async move {
                w.set_content_format(MediaType::TEXT_PLAIN);
                w.write(b"body").await.unwrap();
            });
            let (session, transport) = harness(handler);
            run_request(&session, method).await;

            let reply = DatagramMessage::decode(&transport.sent.lock().unwrap()[0]).unwrap();
            assert_eq!(reply.code, expected, "method {}", method);
            assert_eq!(reply.message_type, MessageType::Acknowledgement);
            assert_eq!(reply.message_id, 0x4242);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_explicit_code_wins() {
        let handler = handler_fn(|_req, mut w| async move {
            w.set_code(Code::NOT_FOUND);
            w.write(b"").await.unwrap();
        });
        let (session, transport) = harness(handler);
        run_request(&session, Code::GET).await;

        let reply = DatagramMessage::decode(&transport.sent.lock().unwrap()[0]).unwrap();
        assert_eq!(reply.code, Code::NOT_FOUND);
        assert!(reply.payload.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_payload_without_content_format_is_rejected() {
        let handler = handler_fn(|_req, mut w| async move {
            assert!(matches!(
                w.write(b"data").await,
                Err(Error::MissingContentFormat)
            ));

            w.set_content_format(MediaType::TEXT_PLAIN);
            assert!(matches!(w.write(b"").await, Err(Error::MissingContentFormat)));
        });
        let (session, transport) = harness(handler);
        run_request(&session, Code::GET).await;

        // nothing was written, so the session falls back to an empty ACK
        let reply = DatagramMessage::decode(&transport.sent.lock().unwrap()[0]).unwrap();
        assert_eq!(reply.code, Code::EMPTY);
        assert_eq!(reply.message_type, MessageType::Acknowledgement);
    }

    #[tokio::test(start_paused = true)]
    async fn test_method_code_is_not_a_response() {
        let handler = handler_fn(|_req, mut w| async move {
            let resp = w.new_response(Code::GET);
            assert!(matches!(
                w.write_message(resp).await,
                Err(Error::InvalidResponseCode(_))
            ));
        });
        let (session, transport) = harness(handler);
        run_request(&session, Code::GET).await;

        let reply = DatagramMessage::decode(&transport.sent.lock().unwrap()[0]).unwrap();
        assert_eq!(reply.code, Code::EMPTY);
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_write_is_a_fresh_nonconfirmable() {
        let handler = handler_fn(|_req, mut w| async move {
            w.set_content_format(MediaType::TEXT_PLAIN);
            w.write(b"first").await.unwrap();
            w.write(b"second").await.unwrap();
        });
        let (session, transport) = harness(handler);
        run_request(&session, Code::GET).await;

        let sent = transport.sent.lock().unwrap().clone();
        let first = DatagramMessage::decode(&sent[0]).unwrap();
        let second = DatagramMessage::decode(&sent[1]).unwrap();
        assert_eq!(first.message_type, MessageType::Acknowledgement);
        assert_eq!(first.message_id, 0x4242);
        assert_eq!(second.message_type, MessageType::NonConfirmable);
        assert_ne!(second.message_id, 0x4242);
        assert_eq!(second.token, first.token);
    }

    #[tokio::test(start_paused = true)]
    async fn test_writer_survives_handler_return_for_notifications() {
        let (released_tx, released_rx) = tokio::sync::oneshot::channel::<()>();
        let released_tx = std::sync::Mutex::new(Some(released_tx));
        let handler = handler_fn(move |_req, mut w| {
            let released = released_tx.lock().unwrap().take();
            async move {
                w.set_content_format(MediaType::TEXT_PLAIN);
                w.write(b"now").await.unwrap();
                // keep pushing after returning, observe-style
                tokio::spawn(async move {
                    let _ = w.write(b"later").await;
                    if let Some(tx) = released {
                        let _ = tx.send(());
                    }
                });
            }
        });
        let (session, transport) = harness(handler);

        run_request(&session, Code::GET).await;
        released_rx.await.unwrap();

        // piggybacked reply plus the late notification, no stray empty ACK
        let sent = transport.sent.lock().unwrap().clone();
        assert_eq!(sent.len(), 2);
        let late = DatagramMessage::decode(&sent[1]).unwrap();
        assert_eq!(late.payload.as_ref(), b"later");
        assert_eq!(late.message_type, MessageType::NonConfirmable);
    }
}
