use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::blockwise::{do_blockwise, BlockValue};
use crate::config::{TcpConfig, UdpConfig};
use crate::error::{Error, Result};
use crate::handler::{handler_fn, Handler, Response};
use crate::keepalive::spawn_keepalive;
use crate::message::{
    Code, CoapMessage, DatagramMessage, MediaType, MessageType, OptionId, StreamingMessage, Token,
};
use crate::pool::WorkerPool;
use crate::session::datagram::DatagramSession;
use crate::session::streaming::StreamingSession;
use crate::transport::{DatagramTransport, UdpTransport};

/// Requests a client did not expect get a 4.04, mirroring the default dial
/// handler of the original stack.
fn default_client_handler() -> Handler {
    handler_fn(|req, mut writer| async move {
        if req.code.is_request() {
            let response = writer.new_response(Code::NOT_FOUND);
            let _ = writer.write_message(response).await;
        }
    })
}

/// A running Observe registration. Cancelling sends the deregistration GET
/// (`Observe: 1`) and removes the subscription.
pub struct Observation {
    cancel_fn: Box<dyn FnOnce() -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>> + Send>,
    pub token: Token,
}

impl Observation {
    pub async fn cancel(self) {
        (self.cancel_fn)().await;
    }
}

/// Client connection over the datagram transport.
pub struct UdpClient {
    session: Arc<DatagramSession>,
    config: Arc<UdpConfig>,
}

impl UdpClient {
    /// Connect to `target` with default configuration.
    pub async fn dial(target: SocketAddr) -> anyhow::Result<UdpClient> {
        Self::dial_with(target, UdpConfig::default(), default_client_handler()).await
    }

    pub async fn dial_with(
        target: SocketAddr,
        config: UdpConfig,
        handler: Handler,
    ) -> anyhow::Result<UdpClient> {
        config.validate()?;
        let config = Arc::new(config);
        let transport: Arc<dyn DatagramTransport> = Arc::new(UdpTransport::connect(target).await?);
        let pool = WorkerPool::new(Default::default());
        let session = DatagramSession::new(config.clone(), transport.clone(), target, handler, pool);

        Self::spawn_read_loop(session.clone(), transport, config.max_message_size);
        spawn_keepalive(config.keepalive.clone(), session.clone());

        Ok(UdpClient { session, config })
    }

    fn spawn_read_loop(
        session: Arc<DatagramSession>,
        transport: Arc<dyn DatagramTransport>,
        max_message_size: usize,
    ) {
        let shutdown = session.closed_token();
        tokio::spawn(async move {
            let mut buf = vec![0u8; max_message_size];
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    received = transport.recv_from(&mut buf) => match received {
                        Ok((n, from)) => {
                            if from == session.peer() {
                                session.process(&buf[..n]).await;
                            } else {
                                debug!("dropping datagram from unexpected peer {:?}", from);
                            }
                        }
                        Err(e) => {
                            warn!("read failed, closing connection: {}", e);
                            session.close().await;
                            return;
                        }
                    },
                }
            }
        });
    }

    fn new_request(&self, code: Code, path: &str) -> Result<DatagramMessage> {
        let mut request = DatagramMessage::new(MessageType::Confirmable, code, 0);
        request.token = Token::random();
        request.options.set_path(path)?;
        Ok(request)
    }

    /// One request/response exchange, block-wise aware.
    pub async fn do_request(
        &self,
        request: DatagramMessage,
        cancel: &CancellationToken,
    ) -> Result<DatagramMessage> {
        do_blockwise(&self.config.blockwise, request, |fragment| {
            self.session.do_request(fragment, cancel)
        })
        .await
    }

    pub async fn get(&self, path: &str, cancel: &CancellationToken) -> Result<DatagramMessage> {
        self.do_request(self.new_request(Code::GET, path)?, cancel).await
    }

    pub async fn post(
        &self,
        path: &str,
        format: MediaType,
        payload: Bytes,
        cancel: &CancellationToken,
    ) -> Result<DatagramMessage> {
        let mut request = self.new_request(Code::POST, path)?;
        request.options.set_content_format(format);
        request.payload = payload;
        self.do_request(request, cancel).await
    }

    pub async fn put(
        &self,
        path: &str,
        format: MediaType,
        payload: Bytes,
        cancel: &CancellationToken,
    ) -> Result<DatagramMessage> {
        let mut request = self.new_request(Code::PUT, path)?;
        request.options.set_content_format(format);
        request.payload = payload;
        self.do_request(request, cancel).await
    }

    pub async fn delete(&self, path: &str, cancel: &CancellationToken) -> Result<DatagramMessage> {
        self.do_request(self.new_request(Code::DELETE, path)?, cancel).await
    }

    pub async fn ping(&self, cancel: &CancellationToken) -> Result<()> {
        self.session.ping(cancel).await
    }

    /// Register for notifications on `path`. The first notification confirms
    /// the registration; all notifications (including the first) reach the
    /// callback in Observe-counter order.
    pub async fn observe(
        &self,
        path: &str,
        callback: impl Fn(Response) + Send + Sync + 'static,
        cancel: &CancellationToken,
    ) -> Result<Observation> {
        let token = Token::random();
        let mut request = self.new_request(Code::GET, path)?;
        request.token = token;
        request.options.set_u32(OptionId::OBSERVE, 0);

        let mut dereg = request.clone();
        dereg.options.set_u32(OptionId::OBSERVE, 1);

        let (first_tx, first_rx) = oneshot::channel();
        let wrapped = observe_callback(self.session.clone(), request.clone(), callback, first_tx);
        self.session.add_subscription(token, wrapped).await?;

        if let Err(e) = self.session.do_notify_request(request, cancel).await {
            self.session.remove_subscription(token).await;
            return Err(e);
        }

        tokio::select! {
            first = first_rx => match first {
                Ok(()) => {}
                Err(_) => return Err(Error::ConnectionClosed),
            },
            _ = cancel.cancelled() => {
                self.session.remove_subscription(token).await;
                return Err(Error::Cancelled);
            }
        }

        let session = self.session.clone();
        Ok(Observation {
            token,
            cancel_fn: Box::new(move || {
                Box::pin(async move {
                    let cancel = CancellationToken::new();
                    if let Err(e) = session.do_notify_request(dereg, &cancel).await {
                        debug!("observe deregistration failed: {}", e);
                    }
                    session.remove_subscription(token).await;
                })
            }),
        })
    }

    pub async fn close(&self) {
        self.session.close().await;
    }
}

/// Wraps a user notification callback with first-response signalling and
/// reassembly of Block2-fragmented notifications. A newer notification
/// invalidates any fetch still in progress.
fn observe_callback(
    session: Arc<DatagramSession>,
    request_template: DatagramMessage,
    callback: impl Fn(Response) + Send + Sync + 'static,
    first_tx: oneshot::Sender<()>,
) -> crate::session::NotificationFn {
    let first = std::sync::Mutex::new(Some(first_tx));
    let generation = Arc::new(AtomicU32::new(0));
    let callback = Arc::new(callback);

    Arc::new(move |notification: Response| {
        if let Some(tx) = first.lock().unwrap().take() {
            let _ = tx.send(());
        }

        // every newer notification supersedes a block-wise fetch that is
        // still in progress for this token
        let my_generation = generation.fetch_add(1, Ordering::SeqCst) + 1;

        let block = notification
            .options
            .get_u32(OptionId::BLOCK2)
            .and_then(|raw| BlockValue::decode(raw).ok());
        match block {
            None => (callback)(notification),
            Some(block) if !block.more => {
                let mut notification = notification;
                notification.options.remove(OptionId::BLOCK2);
                (callback)(notification)
            }
            Some(block) if block.num == 0 => {
                let generation = generation.clone();
                let session = session.clone();
                let callback = callback.clone();
                let template = request_template.clone();
                tokio::spawn(async move {
                    match fetch_remaining_blocks(&session, template, notification, block).await {
                        Ok(assembled) => {
                            if generation.load(Ordering::SeqCst) == my_generation {
                                (callback)(assembled);
                            } else {
                                debug!("dropping superseded block-wise notification");
                            }
                        }
                        Err(e) => debug!("block-wise notification fetch failed: {}", e),
                    }
                });
            }
            Some(_) => debug!("ignoring unsolicited mid-sequence block2 notification"),
        }
    })
}

async fn fetch_remaining_blocks(
    session: &DatagramSession,
    template: DatagramMessage,
    mut notification: Response,
    first: BlockValue,
) -> Result<Response> {
    let mut body = BytesMut::from(notification.payload.as_ref());
    let mut szx = first.szx;
    let token = Token::random();
    let cancel = CancellationToken::new();

    loop {
        let num = (body.len() / szx.size()) as u32;
        let mut continuation = template.clone();
        continuation.token = token;
        continuation.options.remove(OptionId::OBSERVE);
        continuation
            .options
            .set_u32(OptionId::BLOCK2, BlockValue::new(num, false, szx).encode());
        continuation.set_payload(Bytes::new());

        let fragment = session.do_request(continuation, &cancel).await?;
        let Some(block) = fragment
            .options
            .get_u32(OptionId::BLOCK2)
            .and_then(|raw| BlockValue::decode(raw).ok())
        else {
            return Err(Error::BlockOutOfOrder);
        };
        if block.offset() != body.len() {
            return Err(Error::BlockOutOfOrder);
        }
        szx = block.szx;
        body.extend_from_slice(&fragment.payload);

        if !block.more {
            notification.payload = body.freeze();
            notification.options.remove(OptionId::BLOCK2);
            return Ok(notification);
        }
    }
}

/// Client connection over a reliable byte stream.
pub struct TcpClient {
    session: Arc<StreamingSession>,
    config: Arc<TcpConfig>,
}

impl TcpClient {
    pub async fn dial(target: SocketAddr) -> anyhow::Result<TcpClient> {
        Self::dial_with(target, TcpConfig::default(), default_client_handler()).await
    }

    pub async fn dial_with(
        target: SocketAddr,
        config: TcpConfig,
        handler: Handler,
    ) -> anyhow::Result<TcpClient> {
        config.validate()?;
        let stream = TcpStream::connect(target).await?;
        Ok(Self::from_stream(Box::new(stream), target, config, handler))
    }

    /// Run the client over an already-established stream (e.g. a finished
    /// TLS handshake).
    pub fn from_stream(
        stream: crate::transport::BoxedStream,
        peer: SocketAddr,
        config: TcpConfig,
        handler: Handler,
    ) -> TcpClient {
        let config = Arc::new(config);
        let pool = WorkerPool::new(Default::default());
        let session = StreamingSession::start(config.clone(), stream, peer, handler, pool);
        spawn_keepalive(config.keepalive.clone(), session.clone());
        TcpClient { session, config }
    }

    fn new_request(&self, code: Code, path: &str) -> Result<StreamingMessage> {
        let mut request = StreamingMessage::new(code);
        request.token = Token::random();
        request.options.set_path(path)?;
        Ok(request)
    }

    pub async fn do_request(
        &self,
        request: StreamingMessage,
        cancel: &CancellationToken,
    ) -> Result<StreamingMessage> {
        do_blockwise(&self.config.blockwise, request, |fragment| {
            self.session.do_request(fragment, cancel)
        })
        .await
    }

    pub async fn get(&self, path: &str, cancel: &CancellationToken) -> Result<StreamingMessage> {
        self.do_request(self.new_request(Code::GET, path)?, cancel).await
    }

    pub async fn post(
        &self,
        path: &str,
        format: MediaType,
        payload: Bytes,
        cancel: &CancellationToken,
    ) -> Result<StreamingMessage> {
        let mut request = self.new_request(Code::POST, path)?;
        request.options.set_content_format(format);
        request.payload = payload;
        self.do_request(request, cancel).await
    }

    pub async fn put(
        &self,
        path: &str,
        format: MediaType,
        payload: Bytes,
        cancel: &CancellationToken,
    ) -> Result<StreamingMessage> {
        let mut request = self.new_request(Code::PUT, path)?;
        request.options.set_content_format(format);
        request.payload = payload;
        self.do_request(request, cancel).await
    }

    pub async fn delete(&self, path: &str, cancel: &CancellationToken) -> Result<StreamingMessage> {
        self.do_request(self.new_request(Code::DELETE, path)?, cancel).await
    }

    pub async fn ping(&self, cancel: &CancellationToken) -> Result<()> {
        self.session.ping(cancel).await
    }

    /// Observe over the streaming transport; notifications reassociate by
    /// token exactly as on datagrams.
    pub async fn observe(
        &self,
        path: &str,
        callback: impl Fn(Response) + Send + Sync + 'static,
        cancel: &CancellationToken,
    ) -> Result<Observation> {
        let token = Token::random();
        let mut request = self.new_request(Code::GET, path)?;
        request.token = token;
        request.options.set_u32(OptionId::OBSERVE, 0);

        let (first_tx, first_rx) = oneshot::channel::<()>();
        let first = std::sync::Mutex::new(Some(first_tx));
        let callback = Arc::new(callback);
        let forward = callback.clone();
        self.session
            .add_subscription(
                token,
                Arc::new(move |notification: Response| {
                    if let Some(tx) = first.lock().unwrap().take() {
                        let _ = tx.send(());
                    }
                    (forward)(notification);
                }),
            )
            .await?;

        if let Err(e) = self.session.write_message(&request).await {
            self.session.remove_subscription(token).await;
            return Err(e);
        }

        tokio::select! {
            first = first_rx => match first {
                Ok(()) => {}
                Err(_) => return Err(Error::ConnectionClosed),
            },
            _ = cancel.cancelled() => {
                self.session.remove_subscription(token).await;
                return Err(Error::Cancelled);
            }
        }

        let session = self.session.clone();
        let mut dereg = request;
        dereg.options.set_u32(OptionId::OBSERVE, 1);
        Ok(Observation {
            token,
            cancel_fn: Box::new(move || {
                Box::pin(async move {
                    if let Err(e) = session.write_message(&dereg).await {
                        debug!("observe deregistration failed: {}", e);
                    }
                    session.remove_subscription(token).await;
                })
            }),
        })
    }

    pub async fn close(&self) {
        self.session.close().await;
    }
}
