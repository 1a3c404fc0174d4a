use std::net::SocketAddr;
use std::sync::Arc;

use rustc_hash::FxHashMap;
use tokio::io::{ReadHalf, WriteHalf};
use tokio::sync::{oneshot, Mutex};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::config::TcpConfig;
use crate::error::{Error, Result};
use crate::handler::{Handler, Request, RequestKind, Response};
use crate::message::{Code, OptionId, StreamingMessage, Token};
use crate::pool::WorkerPool;
use crate::session::{NotificationFn, Subscription};
use crate::transport::{split_stream, BoxedStream, FrameReader, FrameWriter};
use crate::writer::ResponseWriter;

/// Signalling option numbers inside a 7.01 CSM (RFC 8323 section 5.3).
const SIG_MAX_MESSAGE_SIZE: OptionId = OptionId(2);
const SIG_BLOCK_WISE_TRANSFER: OptionId = OptionId(4);

/// The peer's Capabilities and Settings announcement.
#[derive(Clone, Copy, Debug, Default)]
pub struct PeerCsm {
    pub max_message_size: Option<u32>,
    pub block_wise_transfer: bool,
}

/// Session over one reliable byte-stream connection. No message types, no
/// message ids, no retransmission; the peer orders its own responses and
/// tokens reassociate them.
pub struct StreamingSession {
    config: Arc<TcpConfig>,
    peer: SocketAddr,
    handler: Handler,
    pool: Arc<WorkerPool>,
    writer: Mutex<FrameWriter<WriteHalf<BoxedStream>>>,
    inner: Mutex<Inner>,
    shutdown: CancellationToken,
}

struct Inner {
    token_waiters: FxHashMap<Token, oneshot::Sender<Result<StreamingMessage>>>,
    subscriptions: FxHashMap<Token, Subscription>,
    peer_csm: Option<PeerCsm>,
    closed: bool,
}

impl StreamingSession {
    /// Wrap an established connection: splits it, spawns the read loop, and
    /// sends our CSM unless signalling is disabled.
    pub fn start(
        config: Arc<TcpConfig>,
        io: BoxedStream,
        peer: SocketAddr,
        handler: Handler,
        pool: Arc<WorkerPool>,
    ) -> Arc<StreamingSession> {
        let (reader, writer) = split_stream(io, config.max_message_size.max(16) * 2);
        let session = Arc::new(StreamingSession {
            config,
            peer,
            handler,
            pool,
            writer: Mutex::new(writer),
            inner: Mutex::new(Inner {
                token_waiters: FxHashMap::default(),
                subscriptions: FxHashMap::default(),
                peer_csm: None,
                closed: false,
            }),
            shutdown: CancellationToken::new(),
        });

        let run = session.clone();
        tokio::spawn(async move { run.read_loop(reader).await });
        session
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn closed_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub async fn is_closed(&self) -> bool {
        self.inner.lock().await.closed
    }

    pub async fn peer_csm(&self) -> Option<PeerCsm> {
        self.inner.lock().await.peer_csm
    }

    async fn read_loop(self: Arc<Self>, mut reader: FrameReader<ReadHalf<BoxedStream>>) {
        if !self.config.disable_signal_messages {
            if let Err(e) = self.send_csm().await {
                warn!("cannot send CSM to {:?}: {}", self.peer, e);
            }
        }

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                frame = reader.read_frame() => match frame {
                    Ok(msg) => self.process(msg).await,
                    Err(e) => {
                        // a broken stream cannot be resynchronised
                        debug!("stream from {:?} ended: {}", self.peer, e);
                        break;
                    }
                },
            }
        }
        self.close().await;
    }

    async fn send_csm(&self) -> Result<()> {
        let mut csm = StreamingMessage::new(Code::CSM);
        csm.options
            .set_u32(SIG_MAX_MESSAGE_SIZE, self.config.max_message_size as u32);
        if self.config.blockwise.enabled {
            csm.options.set_bytes(SIG_BLOCK_WISE_TRANSFER, Vec::new());
        }
        self.write_message(&csm).await
    }

    async fn process(self: &Arc<Self>, msg: StreamingMessage) {
        trace!("received {:?} from {:?}", msg, self.peer);

        if msg.code.is_signalling() {
            self.process_signalling(msg).await;
        } else if msg.code.is_request() {
            self.process_request(msg).await;
        } else if msg.code.is_response() {
            self.process_response(msg).await;
        }
        // empty messages carry no meaning on a reliable transport
    }

    async fn process_signalling(self: &Arc<Self>, msg: StreamingMessage) {
        match msg.code {
            Code::CSM => {
                if self.config.disable_signal_messages {
                    return;
                }
                let csm = PeerCsm {
                    max_message_size: msg.options.get_u32(SIG_MAX_MESSAGE_SIZE),
                    block_wise_transfer: msg.options.has(SIG_BLOCK_WISE_TRANSFER),
                };
                debug!("peer {:?} announced {:?}", self.peer, csm);
                self.inner.lock().await.peer_csm = Some(csm);
            }
            Code::PING => {
                let mut pong = StreamingMessage::new(Code::PONG);
                pong.token = msg.token;
                if let Err(e) = self.write_message(&pong).await {
                    warn!("cannot answer ping from {:?}: {}", self.peer, e);
                }
            }
            Code::PONG => {
                let mut inner = self.inner.lock().await;
                if let Some(waiter) = inner.token_waiters.remove(&msg.token) {
                    let _ = waiter.send(Ok(msg));
                }
            }
            Code::RELEASE => {
                debug!("peer {:?} released the connection", self.peer);
                self.close().await;
            }
            Code::ABORT => {
                warn!("peer {:?} aborted the connection", self.peer);
                self.close().await;
            }
            _ => debug!("ignoring signalling {} from {:?}", msg.code, self.peer),
        }
    }

    async fn process_request(self: &Arc<Self>, msg: StreamingMessage) {
        if self.inner.lock().await.closed {
            return;
        }
        let request = Request {
            peer: self.peer,
            code: msg.code,
            token: msg.token,
            options: msg.options,
            payload: msg.payload,
            kind: RequestKind::Streaming,
        };
        let writer = ResponseWriter::for_streaming(self.clone(), &request);
        let handler = self.handler.clone();
        self.pool.spawn(async move {
            (handler)(request, writer).await;
        });
    }

    async fn process_response(self: &Arc<Self>, msg: StreamingMessage) {
        let mut inner = self.inner.lock().await;

        if let Some(subscription) = inner.subscriptions.get_mut(&msg.token) {
            let observe = msg.options.observe();
            if !subscription.accept(observe, Instant::now()) {
                debug!("dropping out-of-order notification (observe {:?})", observe);
                return;
            }
            let callback = subscription.callback.clone();
            drop(inner);
            let notification = Response {
                code: msg.code,
                token: msg.token,
                options: msg.options,
                payload: msg.payload,
            };
            self.pool.spawn(async move { (callback)(notification) });
            return;
        }

        if let Some(waiter) = inner.token_waiters.remove(&msg.token) {
            let _ = waiter.send(Ok(msg));
            return;
        }
        trace!("response with unknown token {:?}", msg.token);
    }

    /// Send a request and await the response bound to its token. Responses
    /// may arrive out of request order.
    pub async fn do_request(
        &self,
        request: StreamingMessage,
        cancel: &CancellationToken,
    ) -> Result<StreamingMessage> {
        if request.token.is_empty() {
            return Err(Error::InvalidToken);
        }

        let (waiter_tx, waiter_rx) = oneshot::channel();
        {
            let mut inner = self.inner.lock().await;
            if inner.closed {
                return Err(Error::ConnectionClosed);
            }
            if inner.token_waiters.contains_key(&request.token) {
                return Err(Error::TokenInUse);
            }
            inner.token_waiters.insert(request.token, waiter_tx);
        }

        if let Err(e) = self.write_message(&request).await {
            self.inner.lock().await.token_waiters.remove(&request.token);
            return Err(e);
        }

        let result = tokio::select! {
            response = waiter_rx => response.unwrap_or(Err(Error::ConnectionClosed)),
            _ = cancel.cancelled() => Err(Error::Cancelled),
        };
        if matches!(result, Err(Error::Cancelled)) {
            self.inner.lock().await.token_waiters.remove(&request.token);
        }
        result
    }

    /// 7.02 Ping / 7.03 Pong with a fresh token.
    pub async fn ping(&self, cancel: &CancellationToken) -> Result<()> {
        let mut ping = StreamingMessage::new(Code::PING);
        ping.token = Token::random();
        self.do_request(ping, cancel).await.map(|_pong| ())
    }

    pub async fn add_subscription(&self, token: Token, callback: NotificationFn) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.closed {
            return Err(Error::ConnectionClosed);
        }
        if inner.subscriptions.contains_key(&token) {
            return Err(Error::TokenInUse);
        }
        inner.subscriptions.insert(token, Subscription::new(callback));
        Ok(())
    }

    pub async fn remove_subscription(&self, token: Token) {
        self.inner.lock().await.subscriptions.remove(&token);
    }

    /// Frame and send one message, honouring the peer's announced maximum
    /// message size.
    pub async fn write_message(&self, msg: &StreamingMessage) -> Result<()> {
        let len = msg.encoded_len();
        if len > self.config.max_message_size {
            return Err(Error::MessageTooLarge);
        }
        {
            let inner = self.inner.lock().await;
            if inner.closed {
                return Err(Error::ConnectionClosed);
            }
            if let Some(peer_max) = inner.peer_csm.and_then(|c| c.max_message_size) {
                if len > peer_max as usize {
                    return Err(Error::MessageTooLarge);
                }
            }
        }
        trace!("sending {:?} to {:?}", msg, self.peer);
        self.writer.lock().await.write_frame(msg).await
    }

    pub(crate) async fn send_response(&self, response: Response) -> Result<()> {
        let mut msg = StreamingMessage::new(response.code);
        msg.token = response.token;
        msg.options = response.options;
        msg.payload = response.payload;
        self.write_message(&msg).await
    }

    /// Close the session and fail every outstanding waiter with
    /// `ConnectionClosed`.
    pub async fn close(&self) {
        {
            let mut inner = self.inner.lock().await;
            if inner.closed {
                return;
            }
            inner.closed = true;
            for (_, waiter) in inner.token_waiters.drain() {
                let _ = waiter.send(Err(Error::ConnectionClosed));
            }
            inner.subscriptions.clear();
        }
        debug!("closed streaming session with {:?}", self.peer);
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::handler_fn;
    use crate::message::MediaType;
    use bytes::Bytes;
    use std::time::Duration;
    use tokio::time::sleep;

    struct Peer {
        reader: FrameReader<ReadHalf<BoxedStream>>,
        writer: FrameWriter<WriteHalf<BoxedStream>>,
    }

    impl Peer {
        async fn read(&mut self) -> StreamingMessage {
            self.reader.read_frame().await.unwrap()
        }

        async fn write(&mut self, msg: &StreamingMessage) {
            self.writer.write_frame(msg).await.unwrap();
        }
    }

    fn peer_addr() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 5684))
    }

    fn start_session(config: TcpConfig, handler: Handler) -> (Arc<StreamingSession>, Peer) {
        let (ours, theirs) = tokio::io::duplex(64 * 1024);
        let session = StreamingSession::start(
            Arc::new(config),
            Box::new(ours),
            peer_addr(),
            handler,
            WorkerPool::new(Default::default()),
        );
        let (reader, writer) = split_stream(Box::new(theirs) as BoxedStream, 64 * 1024);
        (session, Peer { reader, writer })
    }

    fn noop_handler() -> Handler {
        handler_fn(|_req, _w| async {})
    }

    #[tokio::test(start_paused = true)]
    async fn test_csm_exchange() {
        let (session, mut peer) = start_session(TcpConfig::default(), noop_handler());

        let csm = peer.read().await;
        assert_eq!(csm.code, Code::CSM);
        assert_eq!(csm.options.get_u32(SIG_MAX_MESSAGE_SIZE), Some(64 * 1024));
        // block-wise transfers are off by default on reliable transports
        assert!(!csm.options.has(SIG_BLOCK_WISE_TRANSFER));

        let mut peer_csm = StreamingMessage::new(Code::CSM);
        peer_csm.options.set_u32(SIG_MAX_MESSAGE_SIZE, 2048);
        peer.write(&peer_csm).await;
        sleep(Duration::from_millis(5)).await;

        let recorded = session.peer_csm().await.unwrap();
        assert_eq!(recorded.max_message_size, Some(2048));
        assert!(!recorded.block_wise_transfer);

        // writes above the peer's limit are rejected
        let mut big = StreamingMessage::new(Code::CONTENT);
        big.token = Token::random();
        big.payload = Bytes::from(vec![0u8; 4096]);
        assert!(matches!(
            session.write_message(&big).await,
            Err(Error::MessageTooLarge)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_signal_messages() {
        let config = TcpConfig {
            disable_signal_messages: true,
            ..TcpConfig::default()
        };
        let (session, mut peer) = start_session(config, noop_handler());

        // the peer's CSM is silently ignored
        let mut peer_csm = StreamingMessage::new(Code::CSM);
        peer_csm.options.set_u32(SIG_MAX_MESSAGE_SIZE, 128);
        peer.write(&peer_csm).await;
        sleep(Duration::from_millis(5)).await;
        assert!(session.peer_csm().await.is_none());

        // and no CSM was sent: the first frame the peer sees is our ping
        let ping_session = session.clone();
        tokio::spawn(async move {
            let _ = ping_session.ping(&CancellationToken::new()).await;
        });
        let first = peer.read().await;
        assert_eq!(first.code, Code::PING);
    }

    #[tokio::test(start_paused = true)]
    async fn test_out_of_order_responses_reassociate_by_token() {
        let (session, mut peer) = start_session(TcpConfig::default(), noop_handler());
        let _csm = peer.read().await;

        let mut first = StreamingMessage::new(Code::GET);
        first.token = Token::new(&[1]).unwrap();
        let mut second = StreamingMessage::new(Code::GET);
        second.token = Token::new(&[2]).unwrap();

        let s1 = session.clone();
        let first_pending = tokio::spawn(async move {
            s1.do_request(first, &CancellationToken::new()).await
        });
        let s2 = session.clone();
        let second_pending = tokio::spawn(async move {
            s2.do_request(second, &CancellationToken::new()).await
        });

        let _req1 = peer.read().await;
        let _req2 = peer.read().await;

        // answer in reverse order
        let mut resp2 = StreamingMessage::new(Code::CONTENT);
        resp2.token = Token::new(&[2]).unwrap();
        resp2.payload = Bytes::from_static(b"two");
        peer.write(&resp2).await;

        let mut resp1 = StreamingMessage::new(Code::NOT_FOUND);
        resp1.token = Token::new(&[1]).unwrap();
        peer.write(&resp1).await;

        assert_eq!(first_pending.await.unwrap().unwrap().code, Code::NOT_FOUND);
        assert_eq!(second_pending.await.unwrap().unwrap().payload.as_ref(), b"two");
    }

    #[tokio::test(start_paused = true)]
    async fn test_inbound_ping_answered_with_pong() {
        let (_session, mut peer) = start_session(TcpConfig::default(), noop_handler());
        let _csm = peer.read().await;

        let mut ping = StreamingMessage::new(Code::PING);
        ping.token = Token::new(&[0xaa, 0xbb]).unwrap();
        peer.write(&ping).await;

        let pong = peer.read().await;
        assert_eq!(pong.code, Code::PONG);
        assert_eq!(pong.token, ping.token);
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_dispatched_to_handler() {
        let handler = handler_fn(|req: Request, mut w| async move {
            assert_eq!(req.path(), "echo");
            w.set_content_format(MediaType::TEXT_PLAIN);
            let _ = w.write(&req.payload).await;
        });
        let (_session, mut peer) = start_session(TcpConfig::default(), handler);
        let _csm = peer.read().await;

        let mut req = StreamingMessage::new(Code::POST);
        req.token = Token::new(&[7]).unwrap();
        req.options.set_path("echo").unwrap();
        req.payload = Bytes::from_static(b"hello");
        peer.write(&req).await;

        let resp = peer.read().await;
        assert_eq!(resp.code, Code::CHANGED);
        assert_eq!(resp.token, req.token);
        assert_eq!(resp.payload.as_ref(), b"hello");
    }

    #[tokio::test(start_paused = true)]
    async fn test_peer_disconnect_fails_waiters() {
        let (session, mut peer) = start_session(TcpConfig::default(), noop_handler());
        let _csm = peer.read().await;

        let mut req = StreamingMessage::new(Code::GET);
        req.token = Token::new(&[9]).unwrap();
        let s = session.clone();
        let pending = tokio::spawn(async move {
            s.do_request(req, &CancellationToken::new()).await
        });
        let _req = peer.read().await;

        drop(peer);
        assert!(matches!(pending.await.unwrap(), Err(Error::ConnectionClosed)));
        assert!(session.is_closed().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_closes_session() {
        let (session, mut peer) = start_session(TcpConfig::default(), noop_handler());
        let _csm = peer.read().await;

        peer.write(&StreamingMessage::new(Code::ABORT)).await;
        sleep(Duration::from_millis(5)).await;

        assert!(session.is_closed().await);
        let mut req = StreamingMessage::new(Code::GET);
        req.token = Token::new(&[1]).unwrap();
        assert!(matches!(
            session.do_request(req, &CancellationToken::new()).await,
            Err(Error::ConnectionClosed)
        ));
    }
}
