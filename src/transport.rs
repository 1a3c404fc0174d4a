use std::net::SocketAddr;

use async_trait::async_trait;
use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::UdpSocket;

use crate::error::{Error, Result};
use crate::message::StreamingMessage;

/// Datagram socket facade. The session layer only needs framed reads with a
/// remote peer key and framed writes; everything else about the socket stays
/// outside the protocol engine.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DatagramTransport: Send + Sync {
    async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr)>;

    async fn send_to(&self, buf: &[u8], to: SocketAddr) -> Result<()>;

    fn local_addr(&self) -> Result<SocketAddr>;
}

/// Interface selector for multicast group membership.
#[derive(Clone, Copy, Debug)]
pub enum MulticastInterface {
    V4(std::net::Ipv4Addr),
    V6Index(u32),
}

pub struct UdpTransport {
    socket: UdpSocket,
}

impl UdpTransport {
    pub async fn bind(addr: SocketAddr) -> Result<UdpTransport> {
        Ok(UdpTransport {
            socket: UdpSocket::bind(addr).await?,
        })
    }

    pub async fn connect(addr: SocketAddr) -> Result<UdpTransport> {
        let bind_addr: SocketAddr = if addr.is_ipv4() {
            "0.0.0.0:0".parse().unwrap()
        } else {
            "[::]:0".parse().unwrap()
        };
        let socket = UdpSocket::bind(bind_addr).await?;
        socket.connect(addr).await?;
        Ok(UdpTransport { socket })
    }

    /// Bind a multicast listener and join the group on the given interfaces
    /// (the system-chosen interface when the list is empty). Responses are
    /// always sent unicast via `send_to`.
    pub async fn bind_multicast(
        addr: SocketAddr,
        interfaces: &[MulticastInterface],
    ) -> Result<UdpTransport> {
        let socket = UdpSocket::bind(addr).await?;
        match addr {
            SocketAddr::V4(v4) => {
                let group = *v4.ip();
                if interfaces.is_empty() {
                    socket.join_multicast_v4(group, std::net::Ipv4Addr::UNSPECIFIED)?;
                }
                for interface in interfaces {
                    if let MulticastInterface::V4(local) = interface {
                        socket.join_multicast_v4(group, *local)?;
                    }
                }
            }
            SocketAddr::V6(v6) => {
                let group = *v6.ip();
                if interfaces.is_empty() {
                    socket.join_multicast_v6(&group, 0)?;
                }
                for interface in interfaces {
                    if let MulticastInterface::V6Index(ifidx) = interface {
                        socket.join_multicast_v6(&group, *ifidx)?;
                    }
                }
            }
        }
        Ok(UdpTransport { socket })
    }
}

#[async_trait]
impl DatagramTransport for UdpTransport {
    async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr)> {
        Ok(self.socket.recv_from(buf).await?)
    }

    async fn send_to(&self, buf: &[u8], to: SocketAddr) -> Result<()> {
        self.socket.send_to(buf, to).await?;
        Ok(())
    }

    fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }
}

/// Anything that can carry the streaming framing: a TCP stream or an
/// already-established TLS stream.
pub trait StreamIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> StreamIo for T {}

pub type BoxedStream = Box<dyn StreamIo>;

/// Split a byte stream (TCP, or an already-established TLS stream) into a
/// frame reader and a frame writer for the streaming framing.
pub fn split_stream<S>(io: S, max_frame: usize) -> (FrameReader<ReadHalf<S>>, FrameWriter<WriteHalf<S>>)
where
    S: AsyncRead + AsyncWrite + Send,
{
    let (read, write) = tokio::io::split(io);
    (
        FrameReader {
            io: read,
            buf: BytesMut::with_capacity(4 * 1024),
            max_frame,
        },
        FrameWriter { io: write },
    )
}

pub struct FrameReader<R> {
    io: R,
    buf: BytesMut,
    max_frame: usize,
}

impl<R: AsyncRead + Unpin + Send> FrameReader<R> {
    /// Read one complete frame, buffering partial reads. A cleanly closed
    /// stream and an oversize frame both end the session.
    pub async fn read_frame(&mut self) -> Result<StreamingMessage> {
        loop {
            match StreamingMessage::decode(&self.buf) {
                Ok((msg, consumed)) => {
                    if consumed > self.max_frame {
                        return Err(Error::MessageTooLarge);
                    }
                    self.buf.advance(consumed);
                    return Ok(msg);
                }
                Err(Error::ShortBuffer) => {
                    if self.buf.len() > self.max_frame {
                        return Err(Error::MessageTooLarge);
                    }
                    let n = self.io.read_buf(&mut self.buf).await?;
                    if n == 0 {
                        return Err(Error::ConnectionClosed);
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }
}

pub struct FrameWriter<W> {
    io: W,
}

impl<W: AsyncWrite + Unpin + Send> FrameWriter<W> {
    pub async fn write_frame(&mut self, msg: &StreamingMessage) -> Result<()> {
        self.io.write_all(&msg.to_bytes()).await?;
        self.io.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Code, Token};
    use bytes::Bytes;

    #[tokio::test]
    async fn test_frame_roundtrip_over_duplex() {
        let (client, server) = tokio::io::duplex(256);
        let (mut server_read, _server_write) = split_stream(server, 64 * 1024);
        let (_client_read, mut client_write) = split_stream(client, 64 * 1024);

        let mut msg = StreamingMessage::new(Code::GET);
        msg.token = Token::new(&[7, 7]).unwrap();
        msg.options.set_path("a/b").unwrap();
        client_write.write_frame(&msg).await.unwrap();

        let mut pong = StreamingMessage::new(Code::PONG);
        pong.payload = Bytes::from_static(b"x");
        client_write.write_frame(&pong).await.unwrap();

        assert_eq!(server_read.read_frame().await.unwrap(), msg);
        assert_eq!(server_read.read_frame().await.unwrap(), pong);
    }

    #[tokio::test]
    async fn test_read_frame_reports_closed_stream() {
        let (client, server) = tokio::io::duplex(256);
        let (mut server_read, _server_write) = split_stream(server, 64 * 1024);
        drop(client);

        assert!(matches!(
            server_read.read_frame().await,
            Err(Error::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_read_frame_rejects_oversize() {
        let (client, server) = tokio::io::duplex(4096);
        let (mut server_read, _server_write) = split_stream(server, 16);
        let (_client_read, mut client_write) = split_stream(client, 4096);

        let mut msg = StreamingMessage::new(Code::CONTENT);
        msg.payload = Bytes::from(vec![0u8; 64]);
        client_write.write_frame(&msg).await.unwrap();

        assert!(matches!(
            server_read.read_frame().await,
            Err(Error::MessageTooLarge)
        ));
    }
}
