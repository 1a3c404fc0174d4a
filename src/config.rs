use std::time::Duration;

use anyhow::bail;

use crate::blockwise::Szx;

/// Default unsecured CoAP port (RFC 7252 section 6.1).
pub const DEFAULT_PORT: u16 = 5683;
/// Default secured CoAP port.
pub const DEFAULT_SECURE_PORT: u16 = 5684;

/// Retransmission parameters of RFC 7252 section 4.8 plus the local policy
/// knobs of the datagram transport.
#[derive(Clone, Debug)]
pub struct UdpConfig {
    /// Base timeout before the first retransmission of a confirmable
    /// message. The effective initial timeout is drawn uniformly from
    /// `ack_timeout * [1.0, ack_random_factor]` and doubles on every retry.
    pub ack_timeout: Duration,
    pub ack_random_factor: f64,
    /// Number of retransmissions after the initial transmission.
    pub max_retransmit: u32,

    /// How long a peer message id stays in the deduplication cache
    /// (EXCHANGE_LIFETIME of RFC 7252 section 4.8.2).
    pub exchange_lifetime: Duration,
    /// Upper bound on deduplication entries per session; oldest entries are
    /// evicted first.
    pub dedup_capacity: usize,

    /// Largest datagram accepted from or sent to the peer.
    pub max_message_size: usize,

    pub blockwise: BlockwiseConfig,
    pub keepalive: KeepAliveConfig,
}

impl Default for UdpConfig {
    fn default() -> UdpConfig {
        UdpConfig {
            ack_timeout: Duration::from_secs(2),
            ack_random_factor: 1.5,
            max_retransmit: 4,
            exchange_lifetime: Duration::from_secs(247),
            dedup_capacity: 1024,
            max_message_size: 64 * 1024,
            blockwise: BlockwiseConfig::default(),
            keepalive: KeepAliveConfig::default(),
        }
    }
}

impl UdpConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.ack_random_factor < 1.0 {
            bail!("ack_random_factor must be >= 1.0");
        }
        if self.max_message_size < 16 {
            bail!("max_message_size must be at least one block (16 bytes)");
        }
        Ok(())
    }
}

/// Configuration of the streaming (TCP / TLS) transport.
#[derive(Clone, Debug)]
pub struct TcpConfig {
    /// Largest frame accepted from or sent to the peer; also advertised in
    /// our CSM.
    pub max_message_size: usize,
    /// When set, no CSM is sent on connect and inbound signalling CSMs are
    /// ignored.
    pub disable_signal_messages: bool,

    pub blockwise: BlockwiseConfig,
    pub keepalive: KeepAliveConfig,
}

impl Default for TcpConfig {
    fn default() -> TcpConfig {
        TcpConfig {
            max_message_size: 64 * 1024,
            disable_signal_messages: false,
            // a reliable transport carries large frames natively
            blockwise: BlockwiseConfig {
                enabled: false,
                ..BlockwiseConfig::default()
            },
            keepalive: KeepAliveConfig::default(),
        }
    }
}

impl TcpConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_message_size < 16 {
            bail!("max_message_size must be at least one block (16 bytes)");
        }
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct BlockwiseConfig {
    pub enabled: bool,
    /// Largest fragment size offered to peers.
    pub szx: Szx,
    /// Deadline for one whole block-wise transfer.
    pub transfer_timeout: Duration,
}

impl Default for BlockwiseConfig {
    fn default() -> BlockwiseConfig {
        BlockwiseConfig {
            enabled: true,
            szx: Szx::S1024,
            transfer_timeout: Duration::from_secs(3),
        }
    }
}

#[derive(Clone, Debug)]
pub struct KeepAliveConfig {
    /// Interval between pings; `None` disables keep-alive.
    pub interval: Option<Duration>,
    /// How long to wait for the matching pong (or ACK/RST on datagrams).
    pub timeout: Duration,
    /// Consecutive failures after which the session is closed.
    pub max_failures: u32,
}

impl Default for KeepAliveConfig {
    fn default() -> KeepAliveConfig {
        KeepAliveConfig {
            interval: Some(Duration::from_secs(30)),
            timeout: Duration::from_secs(10),
            max_failures: 3,
        }
    }
}

/// Worker pool policy: concurrency is bounded by worker count, not queue
/// depth, so overload degrades to more in-flight handlers rather than
/// unbounded queueing.
#[derive(Clone, Debug)]
pub struct PoolConfig {
    pub max_workers: u32,
    pub idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> PoolConfig {
        PoolConfig {
            max_workers: 10_000,
            idle_timeout: Duration::from_secs(10),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        UdpConfig::default().validate().unwrap();
        TcpConfig::default().validate().unwrap();
    }

    #[test]
    fn test_validation_rejects_tiny_message_size() {
        let cfg = UdpConfig {
            max_message_size: 8,
            ..UdpConfig::default()
        };
        assert!(cfg.validate().is_err());

        let cfg = TcpConfig {
            max_message_size: 8,
            ..TcpConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_shrinking_random_factor() {
        let cfg = UdpConfig {
            ack_random_factor: 0.5,
            ..UdpConfig::default()
        };
        assert!(cfg.validate().is_err());
    }
}
