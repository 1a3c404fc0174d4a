use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use rustc_hash::FxHashMap;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::BlockwiseConfig;
use crate::error::{Error, Result};
use crate::handler::{handler_fn, Handler, Request, Response};
use crate::message::{Code, CoapMessage, OptionId, Token};
use crate::writer::{BufferedTarget, ResponseWriter};

/// Block size exponent: fragments carry `2^(szx+4)` bytes (RFC 7959).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Szx {
    S16 = 0,
    S32 = 1,
    S64 = 2,
    S128 = 3,
    S256 = 4,
    S512 = 5,
    S1024 = 6,
}

impl Szx {
    pub fn size(self) -> usize {
        16 << self as usize
    }

    pub fn raw(self) -> u32 {
        self as u32
    }

    pub fn from_raw(raw: u32) -> Result<Szx> {
        match raw {
            0 => Ok(Szx::S16),
            1 => Ok(Szx::S32),
            2 => Ok(Szx::S64),
            3 => Ok(Szx::S128),
            4 => Ok(Szx::S256),
            5 => Ok(Szx::S512),
            6 => Ok(Szx::S1024),
            _ => Err(Error::MalformedOption),
        }
    }
}

/// Decoded Block1/Block2 option value: `num << 4 | more << 3 | szx`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockValue {
    pub num: u32,
    pub more: bool,
    pub szx: Szx,
}

impl BlockValue {
    /// Block numbers are limited to 20 bits.
    const MAX_NUM: u32 = (1 << 20) - 1;

    pub fn new(num: u32, more: bool, szx: Szx) -> BlockValue {
        BlockValue { num, more, szx }
    }

    pub fn encode(self) -> u32 {
        self.num << 4 | (self.more as u32) << 3 | self.szx.raw()
    }

    pub fn decode(raw: u32) -> Result<BlockValue> {
        let num = raw >> 4;
        if num > Self::MAX_NUM {
            return Err(Error::MalformedOption);
        }
        Ok(BlockValue {
            num,
            more: raw & 0x08 != 0,
            szx: Szx::from_raw(raw & 0x07)?,
        })
    }

    pub fn offset(self) -> usize {
        self.num as usize * self.szx.size()
    }

    fn of(message: &impl CoapMessage, id: OptionId) -> Option<BlockValue> {
        message
            .options()
            .get_u32(id)
            .and_then(|raw| BlockValue::decode(raw).ok())
    }
}

/// Client-side coordinator: splits an oversize request body into Block1
/// fragments, then reassembles a Block2-fragmented response by issuing
/// continuation requests. `do_fn` performs one request/response exchange.
///
/// The whole transfer is bounded by the configured transfer timeout.
pub async fn do_blockwise<M, F, Fut>(config: &BlockwiseConfig, request: M, do_fn: F) -> Result<M>
where
    M: CoapMessage + Clone,
    F: Fn(M) -> Fut,
    Fut: Future<Output = Result<M>>,
{
    if !config.enabled {
        return do_fn(request).await;
    }
    tokio::time::timeout(config.transfer_timeout, async {
        let response = if request.payload().len() > config.szx.size() {
            send_body_in_blocks(config, request.clone(), &do_fn).await?
        } else {
            do_fn(request.clone()).await?
        };
        receive_body_in_blocks(request, response, &do_fn).await
    })
    .await
    .map_err(|_| Error::BlockTimeout)?
}

async fn send_body_in_blocks<M, F, Fut>(config: &BlockwiseConfig, request: M, do_fn: &F) -> Result<M>
where
    M: CoapMessage + Clone,
    F: Fn(M) -> Fut,
    Fut: Future<Output = Result<M>>,
{
    let payload = request.payload().clone();
    let total = payload.len();
    let mut szx = config.szx;
    let mut offset = 0;

    loop {
        let size = szx.size();
        let num = (offset / size) as u32;
        let end = (offset + size).min(total);
        let more = end < total;

        let mut fragment = request.clone();
        fragment
            .options_mut()
            .set_u32(OptionId::BLOCK1, BlockValue::new(num, more, szx).encode());
        if offset == 0 {
            fragment.options_mut().set_u32(OptionId::SIZE1, total as u32);
        }
        fragment.set_payload(payload.slice(offset..end));

        let response = do_fn(fragment).await?;
        if !more {
            return Ok(response);
        }
        if response.code() != Code::CONTINUE {
            // the peer cut the transfer short; its verdict is the response
            return Ok(response);
        }

        // the receiver may demand a smaller block size from the next
        // fragment on
        if let Some(echoed) = BlockValue::of(&response, OptionId::BLOCK1) {
            if echoed.szx < szx {
                debug!("peer renegotiated block size to {:?}", echoed.szx);
                szx = echoed.szx;
            }
        }
        offset = end;
    }
}

async fn receive_body_in_blocks<M, F, Fut>(request: M, mut response: M, do_fn: &F) -> Result<M>
where
    M: CoapMessage + Clone,
    F: Fn(M) -> Fut,
    Fut: Future<Output = Result<M>>,
{
    let Some(first) = BlockValue::of(&response, OptionId::BLOCK2) else {
        return Ok(response);
    };
    if first.num != 0 {
        return Err(Error::BlockOutOfOrder);
    }
    if !first.more {
        response.options_mut().remove(OptionId::BLOCK2);
        return Ok(response);
    }

    let mut body = BytesMut::from(response.payload().as_ref());
    let mut szx = first.szx;

    loop {
        let num = (body.len() / szx.size()) as u32;
        let mut continuation = request.clone();
        continuation.set_payload(Bytes::new());
        continuation.options_mut().remove(OptionId::BLOCK1);
        continuation.options_mut().remove(OptionId::SIZE1);
        continuation
            .options_mut()
            .set_u32(OptionId::BLOCK2, BlockValue::new(num, false, szx).encode());

        let fragment = do_fn(continuation).await?;
        let Some(block) = BlockValue::of(&fragment, OptionId::BLOCK2) else {
            return Err(Error::BlockOutOfOrder);
        };
        if block.offset() != body.len() {
            return Err(Error::BlockOutOfOrder);
        }
        szx = block.szx;
        body.extend_from_slice(fragment.payload());

        if !block.more {
            response.set_payload(body.freeze());
            response.options_mut().remove(OptionId::BLOCK2);
            return Ok(response);
        }
    }
}

/// Server-side coordinator: reassembles Block1 request bodies (answering
/// `2.31 Continue` per fragment), fragments oversize responses with Block2,
/// and serves continuation fetches from a response cache.
///
/// Reassembly state is keyed by `(remote, token)` per direction and
/// discarded after the transfer deadline.
pub struct ServerBlockwise {
    config: BlockwiseConfig,
    assemblies: Mutex<FxHashMap<(SocketAddr, Token), Assembly>>,
    responses: Mutex<FxHashMap<(SocketAddr, Token), CachedBody>>,
}

struct Assembly {
    body: BytesMut,
    deadline: Instant,
}

struct CachedBody {
    response: Response,
    deadline: Instant,
}

enum Disposition {
    /// The request is complete; run the application handler.
    Deliver,
    /// The middleware already replied (Continue, cached block, or an error).
    Handled,
}

impl ServerBlockwise {
    pub fn new(config: BlockwiseConfig) -> Arc<ServerBlockwise> {
        Arc::new(ServerBlockwise {
            config,
            assemblies: Mutex::new(FxHashMap::default()),
            responses: Mutex::new(FxHashMap::default()),
        })
    }

    /// Wrap the application handler with block-wise assembly of inbound
    /// bodies and fragmentation of outbound ones.
    pub fn wrap(self: &Arc<Self>, inner: Handler) -> Handler {
        let coordinator = self.clone();
        handler_fn(move |mut request: Request, mut writer: ResponseWriter| {
            let coordinator = coordinator.clone();
            let inner = inner.clone();
            async move {
                let requested = BlockValue::of_request(&request);
                if let Some(block) = requested {
                    if block.num > 0 && coordinator.serve_cached_block(&request, block, &mut writer).await {
                        return;
                    }
                }

                match coordinator.assemble_request(&mut request, &mut writer).await {
                    Disposition::Handled => return,
                    Disposition::Deliver => {}
                }

                let buffer = BufferedTarget::new();
                let buffered_writer = writer.buffered(buffer.clone());
                (inner)(request.clone(), buffered_writer).await;

                if let Some(response) = buffer.take(writer.clone()) {
                    coordinator
                        .write_response(&request, response, requested, &mut writer)
                        .await;
                }
            }
        })
    }

    async fn assemble_request(&self, request: &mut Request, writer: &mut ResponseWriter) -> Disposition {
        let Some(block) = BlockValue::of_block1(request) else {
            return Disposition::Deliver;
        };
        if !self.config.enabled {
            let _ = writer
                .write_message(writer.new_response(Code::REQUEST_ENTITY_TOO_LARGE))
                .await;
            return Disposition::Handled;
        }

        let key = (request.peer, request.token);
        let now = Instant::now();
        let mut assemblies = self.assemblies.lock().await;
        assemblies.retain(|_, a| a.deadline > now);

        if block.num == 0 {
            // a restarted upload invalidates any stale assembly
            assemblies.insert(
                key,
                Assembly {
                    body: BytesMut::from(request.payload.as_ref()),
                    deadline: now + self.config.transfer_timeout,
                },
            );
        } else {
            let Some(assembly) = assemblies.get_mut(&key) else {
                drop(assemblies);
                debug!("block1 fragment {} without an assembly from {:?}", block.num, request.peer);
                let _ = writer
                    .write_message(writer.new_response(Code::REQUEST_ENTITY_INCOMPLETE))
                    .await;
                return Disposition::Handled;
            };
            if block.offset() != assembly.body.len() {
                assemblies.remove(&key);
                drop(assemblies);
                debug!("out-of-order block1 fragment {} from {:?}", block.num, request.peer);
                let _ = writer
                    .write_message(writer.new_response(Code::REQUEST_ENTITY_INCOMPLETE))
                    .await;
                return Disposition::Handled;
            }
            assembly.body.extend_from_slice(&request.payload);
        }

        if block.more {
            // ack the fragment; echoing a smaller szx renegotiates the size
            let szx = self.config.szx.min(block.szx);
            let mut reply = writer.new_response(Code::CONTINUE);
            reply
                .options
                .set_u32(OptionId::BLOCK1, BlockValue::new(block.num, true, szx).encode());
            let _ = writer.write_message(reply).await;
            return Disposition::Handled;
        }

        let assembly = assemblies.remove(&key).expect("assembly was just touched");
        request.payload = assembly.body.freeze();
        request.options.remove(OptionId::BLOCK1);
        Disposition::Deliver
    }

    /// Send the handler's response, fragmenting when it exceeds one block.
    async fn write_response(
        &self,
        request: &Request,
        response: Response,
        requested: Option<BlockValue>,
        writer: &mut ResponseWriter,
    ) {
        let szx = requested
            .map(|b| b.szx.min(self.config.szx))
            .unwrap_or(self.config.szx);

        if !self.config.enabled || response.payload.len() <= szx.size() {
            if let Err(e) = writer.write_message(response).await {
                warn!("cannot send response to {:?}: {}", request.peer, e);
            }
            return;
        }

        let total = response.payload.len();
        let num = requested.map(|b| b.num).unwrap_or(0);
        let offset = num as usize * szx.size();
        if offset >= total {
            let _ = writer.write_message(writer.new_response(Code::BAD_OPTION)).await;
            return;
        }
        let end = (offset + szx.size()).min(total);
        let more = end < total;

        if more || num == 0 {
            let now = Instant::now();
            let mut responses = self.responses.lock().await;
            responses.retain(|_, c| c.deadline > now);
            responses.insert(
                (request.peer, request.token),
                CachedBody {
                    response: response.clone(),
                    deadline: now + self.config.transfer_timeout,
                },
            );
        }

        let mut fragment = response.clone();
        fragment.payload = response.payload.slice(offset..end);
        fragment
            .options
            .set_u32(OptionId::BLOCK2, BlockValue::new(num, more, szx).encode());
        if num == 0 {
            fragment.options.set_u32(OptionId::SIZE2, total as u32);
        }

        if let Err(e) = writer.write_message(fragment).await {
            warn!("cannot send block2 fragment to {:?}: {}", request.peer, e);
        }
    }

    /// Serve a continuation fetch (Block2 with num > 0) from the response
    /// cache. Returns false when there is nothing cached, in which case the
    /// handler regenerates the response.
    async fn serve_cached_block(
        &self,
        request: &Request,
        block: BlockValue,
        writer: &mut ResponseWriter,
    ) -> bool {
        let now = Instant::now();
        let cached = {
            let mut responses = self.responses.lock().await;
            responses.retain(|_, c| c.deadline > now);
            responses
                .get(&(request.peer, request.token))
                .map(|c| c.response.clone())
        };
        let Some(response) = cached else {
            return false;
        };

        let szx = block.szx.min(self.config.szx);
        let offset = block.num as usize * szx.size();
        let total = response.payload.len();
        if offset >= total {
            let _ = writer.write_message(writer.new_response(Code::BAD_OPTION)).await;
            return true;
        }
        let end = (offset + szx.size()).min(total);
        let more = end < total;

        let mut fragment = response.clone();
        fragment.payload = response.payload.slice(offset..end);
        fragment
            .options
            .set_u32(OptionId::BLOCK2, BlockValue::new(block.num, more, szx).encode());
        let _ = writer.write_message(fragment).await;
        true
    }
}

impl BlockValue {
    fn of_request(request: &Request) -> Option<BlockValue> {
        request
            .options
            .get_u32(OptionId::BLOCK2)
            .and_then(|raw| BlockValue::decode(raw).ok())
    }

    fn of_block1(request: &Request) -> Option<BlockValue> {
        request
            .options
            .get_u32(OptionId::BLOCK1)
            .and_then(|raw| BlockValue::decode(raw).ok())
    }
}
