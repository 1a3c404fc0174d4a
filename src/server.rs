use std::net::SocketAddr;
use std::sync::{Arc, Weak};

use rustc_hash::FxHashMap;
use tokio::net::{lookup_host, TcpListener};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::blockwise::ServerBlockwise;
use crate::config::{TcpConfig, UdpConfig, DEFAULT_PORT, DEFAULT_SECURE_PORT};
use crate::handler::{handler_fn, Handler};
use crate::keepalive::spawn_keepalive;
use crate::message::Code;
use crate::pool::WorkerPool;
use crate::session::datagram::DatagramSession;
use crate::session::streaming::StreamingSession;
use crate::transport::{BoxedStream, DatagramTransport, UdpTransport};

/// Exact path → handler map with a fallback (4.04 by default). Anything more
/// elaborate belongs to the application.
pub struct Router {
    routes: FxHashMap<String, Handler>,
    fallback: Handler,
}

impl Router {
    pub fn new() -> Router {
        Router {
            routes: FxHashMap::default(),
            fallback: handler_fn(|_req, mut writer| async move {
                let response = writer.new_response(Code::NOT_FOUND);
                let _ = writer.write_message(response).await;
            }),
        }
    }

    pub fn handle(&mut self, path: &str, handler: Handler) {
        let path = path.strip_prefix('/').unwrap_or(path);
        self.routes.insert(path.to_string(), handler);
    }

    pub fn set_fallback(&mut self, handler: Handler) {
        self.fallback = handler;
    }

    pub fn into_handler(self) -> Handler {
        let routes = Arc::new(self.routes);
        let fallback = self.fallback;
        handler_fn(move |request, writer| {
            let handler = routes
                .get(&request.path())
                .cloned()
                .unwrap_or_else(|| fallback.clone());
            (handler)(request, writer)
        })
    }
}

impl Default for Router {
    fn default() -> Router {
        Router::new()
    }
}

/// CoAP server over both transports. One reader task per UDP socket with a
/// lazily-populated per-peer session map; one task per accepted stream
/// connection. Handlers run on the shared worker pool.
pub struct Server {
    udp_config: Arc<UdpConfig>,
    tcp_config: Arc<TcpConfig>,
    handler: Handler,
    pool: Arc<WorkerPool>,
    shutdown: CancellationToken,
    streaming_sessions: Mutex<Vec<Weak<StreamingSession>>>,
}

impl Server {
    pub fn new(handler: Handler) -> Arc<Server> {
        Server::with_configs(handler, UdpConfig::default(), TcpConfig::default())
            .expect("default configuration is valid")
    }

    pub fn with_configs(
        handler: Handler,
        udp_config: UdpConfig,
        tcp_config: TcpConfig,
    ) -> anyhow::Result<Arc<Server>> {
        udp_config.validate()?;
        tcp_config.validate()?;
        Ok(Arc::new(Server {
            udp_config: Arc::new(udp_config),
            tcp_config: Arc::new(tcp_config),
            handler,
            pool: WorkerPool::new(Default::default()),
            shutdown: CancellationToken::new(),
            streaming_sessions: Mutex::new(Vec::new()),
        }))
    }

    /// Bind the requested network (`udp`, `udp4`, `udp6`, `udp-mcast`,
    /// `tcp`, `tcp4`, `tcp6`) and serve until shutdown. An empty address
    /// binds the default port on all interfaces. `tcp-tls` connections carry
    /// an external handshake; feed the established stream to
    /// [`Server::serve_stream`] instead.
    pub async fn listen_and_serve(self: Arc<Self>, network: &str, addr: &str) -> anyhow::Result<()> {
        let addr = self.resolve(network, addr).await?;
        match network {
            "udp" | "udp4" | "udp6" => {
                let transport = Arc::new(UdpTransport::bind(addr).await?);
                self.serve_datagram(transport).await
            }
            "udp-mcast" | "udp4-mcast" | "udp6-mcast" => {
                let transport = Arc::new(UdpTransport::bind_multicast(addr, &[]).await?);
                self.serve_datagram(transport).await
            }
            "tcp" | "tcp4" | "tcp6" => {
                let listener = TcpListener::bind(addr).await?;
                self.serve_stream_listener(listener).await
            }
            "tcp-tls" => anyhow::bail!(
                "tcp-tls carries an external handshake; pass the established stream to serve_stream"
            ),
            other => anyhow::bail!("unsupported network {:?}", other),
        }
    }

    async fn resolve(&self, network: &str, addr: &str) -> anyhow::Result<SocketAddr> {
        let default_port = if network.ends_with("-tls") {
            DEFAULT_SECURE_PORT
        } else {
            DEFAULT_PORT
        };
        let addr = if addr.is_empty() {
            format!("0.0.0.0:{}", default_port)
        } else {
            addr.to_string()
        };
        let resolved = lookup_host(&addr)
            .await?
            .next()
            .ok_or_else(|| anyhow::anyhow!("cannot resolve {:?}", addr));
        resolved
    }

    fn datagram_handler(&self) -> Handler {
        if self.udp_config.blockwise.enabled {
            ServerBlockwise::new(self.udp_config.blockwise.clone()).wrap(self.handler.clone())
        } else {
            self.handler.clone()
        }
    }

    fn stream_handler(&self) -> Handler {
        if self.tcp_config.blockwise.enabled {
            ServerBlockwise::new(self.tcp_config.blockwise.clone()).wrap(self.handler.clone())
        } else {
            self.handler.clone()
        }
    }

    /// Serve datagrams from an already-bound transport. Sessions are created
    /// per remote peer key on first contact.
    pub async fn serve_datagram(
        self: &Arc<Self>,
        transport: Arc<dyn DatagramTransport>,
    ) -> anyhow::Result<()> {
        info!("serving CoAP on {:?}", transport.local_addr()?);
        let handler = self.datagram_handler();
        let mut sessions: FxHashMap<SocketAddr, Arc<DatagramSession>> = FxHashMap::default();
        let mut buf = vec![0u8; self.udp_config.max_message_size];

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                received = transport.recv_from(&mut buf) => {
                    let (n, from) = match received {
                        Ok(x) => x,
                        Err(e) => {
                            error!("datagram receive failed: {}", e);
                            continue;
                        }
                    };

                    let mut session = sessions.get(&from).cloned();
                    if let Some(existing) = &session {
                        if existing.is_closed().await {
                            session = None;
                        }
                    }
                    let session = match session {
                        Some(session) => session,
                        None => {
                            debug!("new datagram session for {:?}", from);
                            let session = DatagramSession::new(
                                self.udp_config.clone(),
                                transport.clone(),
                                from,
                                handler.clone(),
                                self.pool.clone(),
                            );
                            sessions.insert(from, session.clone());
                            session
                        }
                    };
                    session.process(&buf[..n]).await;
                }
            }
        }

        for (_, session) in sessions {
            session.close().await;
        }
        Ok(())
    }

    /// Accept loop for stream connections.
    pub async fn serve_stream_listener(self: &Arc<Self>, listener: TcpListener) -> anyhow::Result<()> {
        info!("serving CoAP on {:?}", listener.local_addr()?);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            debug!("accepted stream connection from {:?}", peer);
                            self.serve_stream(Box::new(stream), peer).await;
                        }
                        Err(e) => warn!("accept failed: {}", e),
                    }
                }
            }
        }

        for session in self.streaming_sessions.lock().await.drain(..) {
            if let Some(session) = session.upgrade() {
                session.close().await;
            }
        }
        Ok(())
    }

    /// Run one streaming session over an established connection (plain TCP,
    /// or a stream that already finished its TLS handshake).
    pub async fn serve_stream(self: &Arc<Self>, io: BoxedStream, peer: SocketAddr) -> Arc<StreamingSession> {
        let session = StreamingSession::start(
            self.tcp_config.clone(),
            io,
            peer,
            self.stream_handler(),
            self.pool.clone(),
        );
        spawn_keepalive(self.tcp_config.keepalive.clone(), session.clone());

        let mut sessions = self.streaming_sessions.lock().await;
        sessions.retain(|s| s.upgrade().is_some());
        sessions.push(Arc::downgrade(&session));
        session
    }

    /// Stop all serve loops and close every session.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{TcpClient, UdpClient};
    use crate::handler::{handler_fn, Request, Response};
    use crate::message::{MediaType, OptionId};
    use bytes::Bytes;
    use std::time::Duration;
    use tokio::time::sleep;

    async fn start_udp_server(router: Router) -> (Arc<Server>, SocketAddr) {
        let server = Server::new(router.into_handler());
        let transport = Arc::new(UdpTransport::bind("127.0.0.1:0".parse().unwrap()).await.unwrap());
        let addr = transport.local_addr().unwrap();
        let serve = server.clone();
        tokio::spawn(async move { serve.serve_datagram(transport).await });
        (server, addr)
    }

    async fn start_tcp_server(router: Router) -> (Arc<Server>, SocketAddr) {
        let server = Server::new(router.into_handler());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let serve = server.clone();
        tokio::spawn(async move { serve.serve_stream_listener(listener).await });
        (server, addr)
    }

    fn text_handler(body: &'static str) -> Handler {
        handler_fn(move |_req, mut writer| async move {
            writer.set_content_format(MediaType::TEXT_PLAIN);
            let _ = writer.write(body.as_bytes()).await;
        })
    }

    #[tokio::test]
    async fn test_udp_get_roundtrip() {
        let mut router = Router::new();
        router.handle("a/b", text_handler("ok"));
        let (server, addr) = start_udp_server(router).await;

        let client = UdpClient::dial(addr).await.unwrap();
        let response = client.get("a/b", &CancellationToken::new()).await.unwrap();
        assert_eq!(response.code, Code::CONTENT);
        assert_eq!(response.payload.as_ref(), b"ok");

        // unknown paths fall back to 4.04
        let missing = client.get("nope", &CancellationToken::new()).await.unwrap();
        assert_eq!(missing.code, Code::NOT_FOUND);

        client.close().await;
        server.shutdown();
    }

    #[tokio::test]
    async fn test_udp_ping() {
        let (server, addr) = start_udp_server(Router::new()).await;
        let client = UdpClient::dial(addr).await.unwrap();
        client.ping(&CancellationToken::new()).await.unwrap();
        client.close().await;
        server.shutdown();
    }

    #[tokio::test]
    async fn test_block1_upload() {
        let body = vec![0x5a_u8; 2100];
        let expected = body.clone();
        let mut router = Router::new();
        router.handle(
            "upload",
            handler_fn(move |req: Request, mut writer| {
                let expected = expected.clone();
                async move {
                    // the middleware delivers the fully reassembled body
                    assert_eq!(req.payload.as_ref(), expected.as_slice());
                    assert!(req.options.get_u32(OptionId::BLOCK1).is_none());
                    let _ = writer.write(b"").await;
                }
            }),
        );
        let (server, addr) = start_udp_server(router).await;

        let client = UdpClient::dial(addr).await.unwrap();
        let response = client
            .post(
                "upload",
                MediaType::APP_OCTET_STREAM,
                Bytes::from(body),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(response.code, Code::CHANGED);

        client.close().await;
        server.shutdown();
    }

    #[tokio::test]
    async fn test_block2_download() {
        let body = (0..2500u32).map(|i| (i % 251) as u8).collect::<Vec<_>>();
        let served = body.clone();
        let mut router = Router::new();
        router.handle(
            "big",
            handler_fn(move |_req, mut writer| {
                let served = served.clone();
                async move {
                    writer.set_content_format(MediaType::APP_OCTET_STREAM);
                    let _ = writer.write(&served).await;
                }
            }),
        );
        let (server, addr) = start_udp_server(router).await;

        let client = UdpClient::dial(addr).await.unwrap();
        let response = client.get("big", &CancellationToken::new()).await.unwrap();
        assert_eq!(response.code, Code::CONTENT);
        assert_eq!(response.payload.as_ref(), body.as_slice());
        assert!(response.options.get_u32(OptionId::BLOCK2).is_none());

        client.close().await;
        server.shutdown();
    }

    #[tokio::test]
    async fn test_observe_notifications_in_counter_order() {
        let mut router = Router::new();
        router.handle(
            "temp",
            handler_fn(move |req: Request, mut writer| async move {
                match req.options.observe() {
                    Some(0) => {
                        let mut first = writer.new_response(Code::CONTENT);
                        first.options.set_u32(OptionId::OBSERVE, 5);
                        first.payload = Bytes::from_static(b"21.0");
                        let _ = writer.write_message(first).await;

                        // push two more notifications after returning; the
                        // second one is stale by counter
                        tokio::spawn(async move {
                            for counter in [7u32, 6] {
                                sleep(Duration::from_millis(50)).await;
                                let mut next = writer.new_response(Code::CONTENT);
                                next.options.set_u32(OptionId::OBSERVE, counter);
                                next.payload = Bytes::from(counter.to_string());
                                let _ = writer.write_message(next).await;
                            }
                        });
                    }
                    _ => {
                        let response = writer.new_response(Code::CONTENT);
                        let _ = writer.write_message(response).await;
                    }
                }
            }),
        );
        let (server, addr) = start_udp_server(router).await;

        let client = UdpClient::dial(addr).await.unwrap();
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = seen.clone();
        let observation = client
            .observe(
                "temp",
                move |notification: Response| {
                    if let Some(counter) = notification.options.observe() {
                        sink.lock().unwrap().push(counter);
                    }
                },
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        sleep(Duration::from_millis(300)).await;
        assert_eq!(*seen.lock().unwrap(), vec![5, 7]);

        observation.cancel().await;
        client.close().await;
        server.shutdown();
    }

    #[tokio::test]
    async fn test_tcp_echo_roundtrip() {
        let mut router = Router::new();
        router.handle(
            "echo",
            handler_fn(|req: Request, mut writer| async move {
                writer.set_content_format(MediaType::APP_OCTET_STREAM);
                let _ = writer.write(&req.payload).await;
            }),
        );
        let (server, addr) = start_tcp_server(router).await;

        let client = TcpClient::dial(addr).await.unwrap();
        let response = client
            .post(
                "echo",
                MediaType::APP_OCTET_STREAM,
                Bytes::from_static(b"streamed"),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(response.code, Code::CHANGED);
        assert_eq!(response.payload.as_ref(), b"streamed");

        client.ping(&CancellationToken::new()).await.unwrap();
        client.close().await;
        server.shutdown();
    }

    #[tokio::test]
    async fn test_shutdown_stops_serving() {
        let (server, addr) = start_udp_server(Router::new()).await;
        let client = UdpClient::dial(addr).await.unwrap();
        client.ping(&CancellationToken::new()).await.unwrap();

        server.shutdown();
        sleep(Duration::from_millis(50)).await;

        // the socket is gone, so the ping exhausts retransmission or errors
        let result = tokio::time::timeout(
            Duration::from_secs(1),
            client.ping(&CancellationToken::new()),
        )
        .await;
        assert!(matches!(result, Err(_) | Ok(Err(_))));
        client.close().await;
    }
}
