use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use rand::Rng;
use rustc_hash::FxHashMap;
use tokio::sync::{oneshot, Mutex, Notify};
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::config::UdpConfig;
use crate::error::{Error, Result};
use crate::handler::{Handler, Request, RequestKind, Response};
use crate::message::{DatagramMessage, MessageType, Token};
use crate::pool::WorkerPool;
use crate::session::{DedupCache, NotificationFn, Subscription};
use crate::transport::DatagramTransport;
use crate::writer::ResponseWriter;

/// Per-remote-peer session state for the datagram transport: message-id
/// allocation, confirmable retransmission, deduplication, token dispatch and
/// Observe subscriptions.
///
/// The session owns all its maps; the reader loop and the retransmission
/// driver both go through the single session lock.
pub struct DatagramSession {
    config: Arc<UdpConfig>,
    transport: Arc<dyn DatagramTransport>,
    peer: SocketAddr,
    handler: Handler,
    pool: Arc<WorkerPool>,
    inner: Mutex<Inner>,
    retransmit_wakeup: Notify,
    shutdown: CancellationToken,
}

struct Inner {
    next_mid: u16,
    pending: FxHashMap<u16, Pending>,
    deadlines: BinaryHeap<Reverse<(Instant, u16)>>,
    dedup: DedupCache,
    token_waiters: FxHashMap<Token, oneshot::Sender<Result<DatagramMessage>>>,
    subscriptions: FxHashMap<Token, Subscription>,
    closed: bool,
}

/// One of our confirmables awaiting ACK or RST.
struct Pending {
    frame: Bytes,
    /// Exchange to fail when retransmission is exhausted or the peer resets.
    token: Option<Token>,
    /// Pings treat an incoming Reset as proof of life, not as failure.
    reset_ok: bool,
    attempt: u32,
    timeout: Duration,
    deadline: Instant,
    done: Option<oneshot::Sender<Result<()>>>,
}

impl Inner {
    /// Message ids are reused only once their exchange has terminated.
    fn allocate_mid(&mut self) -> Result<u16> {
        for _ in 0..=u16::MAX as u32 {
            let mid = self.next_mid;
            self.next_mid = self.next_mid.wrapping_add(1);
            if !self.pending.contains_key(&mid) {
                return Ok(mid);
            }
        }
        Err(Error::MessageIdInUse)
    }

    fn fail_exchange(&mut self, token: Option<Token>, error: fn() -> Error) {
        if let Some(token) = token {
            if let Some(waiter) = self.token_waiters.remove(&token) {
                let _ = waiter.send(Err(error()));
            }
        }
    }
}

impl DatagramSession {
    pub fn new(
        config: Arc<UdpConfig>,
        transport: Arc<dyn DatagramTransport>,
        peer: SocketAddr,
        handler: Handler,
        pool: Arc<WorkerPool>,
    ) -> Arc<DatagramSession> {
        let dedup = DedupCache::new(config.dedup_capacity, config.exchange_lifetime);
        let session = Arc::new(DatagramSession {
            config,
            transport,
            peer,
            handler,
            pool,
            inner: Mutex::new(Inner {
                next_mid: rand::thread_rng().gen(),
                pending: FxHashMap::default(),
                deadlines: BinaryHeap::new(),
                dedup,
                token_waiters: FxHashMap::default(),
                subscriptions: FxHashMap::default(),
                closed: false,
            }),
            retransmit_wakeup: Notify::new(),
            shutdown: CancellationToken::new(),
        });
        session.spawn_retransmit_driver();
        session
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Cancelled when the session closes; keep-alive and server loops hang
    /// their lifetimes off this.
    pub fn closed_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub async fn is_closed(&self) -> bool {
        self.inner.lock().await.closed
    }

    /// Send a request and wait for the response bound to its token. Completes
    /// when the response arrives, the caller cancels, or the session closes;
    /// for confirmables also when retransmission is exhausted or the peer
    /// resets.
    pub async fn do_request(
        &self,
        mut request: DatagramMessage,
        cancel: &CancellationToken,
    ) -> Result<DatagramMessage> {
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
            request.message_id = inner.allocate_mid()?;
            inner.token_waiters.insert(request.token, waiter_tx);
            if request.is_confirmable() {
                self.register_pending(&mut inner, &request, Some(request.token), false, None);
            }
        }

        if let Err(e) = self.write_message(&request).await {
            self.abandon_exchange(request.token, request.message_id).await;
            return Err(e);
        }

        let result = tokio::select! {
            response = waiter_rx => response.unwrap_or(Err(Error::ConnectionClosed)),
            _ = cancel.cancelled() => Err(Error::Cancelled),
        };
        if matches!(result, Err(Error::Cancelled)) {
            self.abandon_exchange(request.token, request.message_id).await;
        }
        result
    }

    /// CoAP ping: an empty confirmable message. ACK and Reset both count as
    /// proof of life.
    pub async fn ping(&self, cancel: &CancellationToken) -> Result<()> {
        let (done_tx, done_rx) = oneshot::channel();
        let ping = {
            let mut inner = self.inner.lock().await;
            if inner.closed {
                return Err(Error::ConnectionClosed);
            }
            let mid = inner.allocate_mid()?;
            let ping = DatagramMessage::empty(MessageType::Confirmable, mid);
            self.register_pending(&mut inner, &ping, None, true, Some(done_tx));
            ping
        };

        if let Err(e) = self.write_message(&ping).await {
            self.abandon_exchange(Token::EMPTY, ping.message_id).await;
            return Err(e);
        }

        tokio::select! {
            outcome = done_rx => outcome.unwrap_or(Err(Error::ConnectionClosed)),
            _ = cancel.cancelled() => {
                self.abandon_exchange(Token::EMPTY, ping.message_id).await;
                Err(Error::Cancelled)
            }
        }
    }

    /// Send a request whose responses are routed through a subscription
    /// rather than a one-shot waiter (Observe registration and
    /// deregistration). For confirmables, completion means the peer
    /// acknowledged the transmission.
    pub(crate) async fn do_notify_request(
        &self,
        mut request: DatagramMessage,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let (done_tx, done_rx) = oneshot::channel();
        let confirmable = request.is_confirmable();
        {
            let mut inner = self.inner.lock().await;
            if inner.closed {
                return Err(Error::ConnectionClosed);
            }
            request.message_id = inner.allocate_mid()?;
            if confirmable {
                self.register_pending(&mut inner, &request, None, false, Some(done_tx));
            }
        }

        if let Err(e) = self.write_message(&request).await {
            self.abandon_exchange(Token::EMPTY, request.message_id).await;
            return Err(e);
        }
        if !confirmable {
            return Ok(());
        }

        tokio::select! {
            outcome = done_rx => outcome.unwrap_or(Err(Error::ConnectionClosed)),
            _ = cancel.cancelled() => {
                self.abandon_exchange(Token::EMPTY, request.message_id).await;
                Err(Error::Cancelled)
            }
        }
    }

    /// Register an Observe subscription for a token the caller is about to
    /// send an `Observe: 0` request with. Notifications are delivered to the
    /// callback in Observe-counter order; stale ones are dropped.
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

    /// Fire-and-forget write of an already-built message.
    pub async fn write_message(&self, msg: &DatagramMessage) -> Result<()> {
        let frame = msg.to_bytes();
        if frame.len() > self.config.max_message_size {
            return Err(Error::MessageTooLarge);
        }
        trace!("sending {:?} to {:?}", msg, self.peer);
        self.transport.send_to(&frame, self.peer).await
    }

    /// Close the session: every outstanding waiter fails with
    /// `ConnectionClosed`, subscriptions are dropped, the retransmission
    /// driver stops.
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
            for (_, pending) in inner.pending.drain() {
                if let Some(done) = pending.done {
                    let _ = done.send(Err(Error::ConnectionClosed));
                }
            }
            inner.subscriptions.clear();
            inner.deadlines.clear();
        }
        debug!("closed datagram session with {:?}", self.peer);
        self.shutdown.cancel();
    }

    /// Entry point of the reader loop: decode and classify one datagram.
    /// Malformed input is logged and dropped; it never kills the session.
    pub async fn process(self: &Arc<Self>, data: &[u8]) {
        let msg = match DatagramMessage::decode(data) {
            Ok(msg) => msg,
            Err(e) => {
                warn!("dropping malformed datagram from {:?}: {}", self.peer, e);
                return;
            }
        };
        trace!("received {:?} from {:?}", msg, self.peer);

        if msg.code.is_empty() {
            self.process_empty(msg).await;
        } else if msg.code.is_request() {
            self.process_request(msg).await;
        } else if msg.code.is_response() {
            self.process_response(msg).await;
        } else {
            debug!("dropping message with code {} from {:?}", msg.code, self.peer);
        }
    }

    async fn process_empty(self: &Arc<Self>, msg: DatagramMessage) {
        match msg.message_type {
            MessageType::Acknowledgement => self.resolve_pending(msg.message_id, false).await,
            MessageType::Reset => self.resolve_pending(msg.message_id, true).await,
            MessageType::Confirmable => {
                // peer ping
                let reset = DatagramMessage::empty(MessageType::Reset, msg.message_id);
                if let Err(e) = self.write_message(&reset).await {
                    warn!("cannot answer ping from {:?}: {}", self.peer, e);
                }
            }
            MessageType::NonConfirmable => {}
        }
    }

    /// An ACK or RST for one of our confirmables cancels retransmission; RST
    /// additionally fails the exchange.
    async fn resolve_pending(&self, mid: u16, reset: bool) {
        let mut inner = self.inner.lock().await;
        let Some(pending) = inner.pending.remove(&mid) else {
            trace!("ignoring ACK/RST for unknown mid {:#06x}", mid);
            return;
        };

        let outcome = if !reset || pending.reset_ok {
            Ok(())
        } else {
            Err(Error::PeerReset)
        };
        if let Some(done) = pending.done {
            let _ = done.send(outcome);
        }
        if reset && !pending.reset_ok {
            debug!("peer reset exchange for mid {:#06x}", mid);
            inner.fail_exchange(pending.token, || Error::PeerReset);
        }
        self.retransmit_wakeup.notify_one();
    }

    async fn process_request(self: &Arc<Self>, msg: DatagramMessage) {
        let confirmable = msg.is_confirmable();
        {
            let mut inner = self.inner.lock().await;
            if inner.closed {
                return;
            }
            if let Some(cached) = inner.dedup.check_and_record(msg.message_id, Instant::now()) {
                drop(inner);
                debug!("duplicate request mid {:#06x} from {:?}", msg.message_id, self.peer);
                if let Some(reply) = cached {
                    if let Err(e) = self.transport.send_to(&reply, self.peer).await {
                        warn!("cannot resend cached reply: {}", e);
                    }
                }
                return;
            }
        }

        let kind = RequestKind::Datagram {
            message_id: msg.message_id,
            confirmable,
        };
        let request = Request {
            peer: self.peer,
            code: msg.code,
            token: msg.token,
            options: msg.options,
            payload: msg.payload,
            kind,
        };
        let writer = ResponseWriter::for_datagram(self.clone(), &request);
        let written = writer.written_flag();

        let session = self.clone();
        let handler = self.handler.clone();
        let mid = msg.message_id;
        self.pool.spawn(async move {
            (handler)(request, writer).await;
            if confirmable && !written.load(Ordering::SeqCst) {
                session.send_empty_ack(mid).await;
            }
        });
    }

    async fn process_response(self: &Arc<Self>, msg: DatagramMessage) {
        if msg.message_type == MessageType::Acknowledgement {
            // piggybacked response also acknowledges the confirmable
            self.resolve_pending(msg.message_id, false).await;
        }

        let confirmable = msg.is_confirmable();
        let mid = msg.message_id;
        let delivered = self.deliver_response(msg).await;

        if confirmable {
            let reply = if delivered {
                DatagramMessage::empty(MessageType::Acknowledgement, mid)
            } else {
                DatagramMessage::empty(MessageType::Reset, mid)
            };
            if let Err(e) = self.write_message(&reply).await {
                warn!("cannot acknowledge response from {:?}: {}", self.peer, e);
            }
        }
    }

    /// Route a response to its subscription (kept) or one-shot waiter
    /// (removed). Returns whether the token was known.
    async fn deliver_response(&self, msg: DatagramMessage) -> bool {
        let mut inner = self.inner.lock().await;

        if let Some(subscription) = inner.subscriptions.get_mut(&msg.token) {
            let observe = msg.options.observe();
            if !subscription.accept(observe, Instant::now()) {
                debug!("dropping out-of-order notification (observe {:?})", observe);
                return true;
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
            return true;
        }

        if let Some(waiter) = inner.token_waiters.remove(&msg.token) {
            let _ = waiter.send(Ok(msg));
            return true;
        }

        trace!("response with unknown token {:?}", msg.token);
        false
    }

    /// Piggybacked or detached reply on behalf of a handler. The first reply
    /// to a confirmable request reuses its message id as an ACK and is cached
    /// for deduplication; anything later goes out non-confirmable under a
    /// fresh id.
    pub(crate) async fn send_response(
        &self,
        kind: RequestKind,
        response: Response,
        first_write: bool,
    ) -> Result<()> {
        let (message_type, message_id, cache_for) = match kind {
            RequestKind::Datagram {
                message_id,
                confirmable: true,
            } if first_write => (MessageType::Acknowledgement, Some(message_id), Some(message_id)),
            _ => (MessageType::NonConfirmable, None, None),
        };

        let mut msg = DatagramMessage::new(message_type, response.code, 0);
        msg.token = response.token;
        msg.options = response.options;
        msg.payload = response.payload;

        {
            let mut inner = self.inner.lock().await;
            if inner.closed {
                return Err(Error::ConnectionClosed);
            }
            msg.message_id = match message_id {
                Some(mid) => mid,
                None => inner.allocate_mid()?,
            };
            if let Some(mid) = cache_for {
                inner.dedup.store_reply(mid, msg.to_bytes());
            }
        }

        self.write_message(&msg).await
    }

    /// A confirmable request whose handler wrote nothing still gets an empty
    /// ACK, and the ACK is cached for duplicates.
    pub(crate) async fn send_empty_ack(&self, mid: u16) {
        let ack = DatagramMessage::empty(MessageType::Acknowledgement, mid);
        {
            let mut inner = self.inner.lock().await;
            if inner.closed {
                return;
            }
            inner.dedup.store_reply(mid, ack.to_bytes());
        }
        if let Err(e) = self.write_message(&ack).await {
            warn!("cannot send empty ACK to {:?}: {}", self.peer, e);
        }
    }

    fn register_pending(
        &self,
        inner: &mut Inner,
        msg: &DatagramMessage,
        token: Option<Token>,
        reset_ok: bool,
        done: Option<oneshot::Sender<Result<()>>>,
    ) {
        let factor = rand::thread_rng().gen_range(1.0..=self.config.ack_random_factor);
        let timeout = self.config.ack_timeout.mul_f64(factor);
        let deadline = Instant::now() + timeout;

        inner.pending.insert(
            msg.message_id,
            Pending {
                frame: msg.to_bytes(),
                token,
                reset_ok,
                attempt: 0,
                timeout,
                deadline,
                done,
            },
        );
        inner.deadlines.push(Reverse((deadline, msg.message_id)));
        self.retransmit_wakeup.notify_one();
    }

    async fn abandon_exchange(&self, token: Token, mid: u16) {
        let mut inner = self.inner.lock().await;
        inner.token_waiters.remove(&token);
        inner.pending.remove(&mid);
        self.retransmit_wakeup.notify_one();
    }

    fn spawn_retransmit_driver(self: &Arc<Self>) {
        let session = self.clone();
        tokio::spawn(async move { session.retransmit_loop().await });
    }

    /// One driver task per session drains a deadline min-heap; it is woken
    /// whenever `pending` changes.
    async fn retransmit_loop(self: Arc<Self>) {
        loop {
            let next_deadline = {
                let mut inner = self.inner.lock().await;
                loop {
                    match inner.deadlines.peek() {
                        None => break None,
                        Some(&Reverse((deadline, mid))) => {
                            let live = inner
                                .pending
                                .get(&mid)
                                .is_some_and(|p| p.deadline == deadline);
                            if live {
                                break Some(deadline);
                            }
                            inner.deadlines.pop();
                        }
                    }
                }
            };

            match next_deadline {
                None => tokio::select! {
                    _ = self.shutdown.cancelled() => return,
                    _ = self.retransmit_wakeup.notified() => {}
                },
                Some(deadline) => tokio::select! {
                    _ = self.shutdown.cancelled() => return,
                    _ = self.retransmit_wakeup.notified() => {}
                    _ = sleep_until(deadline) => self.handle_due().await,
                },
            }
        }
    }

    async fn handle_due(&self) {
        let now = Instant::now();
        let mut resend = Vec::new();
        {
            let mut inner = self.inner.lock().await;
            while let Some(&Reverse((deadline, mid))) = inner.deadlines.peek() {
                if deadline > now {
                    break;
                }
                inner.deadlines.pop();

                let Some(pending) = inner.pending.get_mut(&mid) else {
                    continue;
                };
                if pending.deadline != deadline {
                    continue;
                }

                if pending.attempt >= self.config.max_retransmit {
                    let pending = inner.pending.remove(&mid).unwrap();
                    debug!("confirmable mid {:#06x} timed out after {} retransmissions", mid, pending.attempt);
                    if let Some(done) = pending.done {
                        let _ = done.send(Err(Error::TransmitTimeout));
                    }
                    inner.fail_exchange(pending.token, || Error::TransmitTimeout);
                    continue;
                }

                pending.attempt += 1;
                pending.timeout *= 2;
                pending.deadline = now + pending.timeout;
                let new_deadline = pending.deadline;
                resend.push((mid, pending.frame.clone()));
                inner.deadlines.push(Reverse((new_deadline, mid)));
            }
        }

        for (mid, frame) in resend {
            debug!("retransmitting confirmable mid {:#06x} to {:?}", mid, self.peer);
            if let Err(e) = self.transport.send_to(&frame, self.peer).await {
                // a failed write fails only this attempt; the timer stays armed
                warn!("retransmission to {:?} failed: {}", self.peer, e);
            }
        }
    }
}
