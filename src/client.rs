//! # Protocol Clients
//!
//! Minimal endpoints speaking the broker's wire protocol from the outside.
//!
//! - [`Publisher`] sends `PUBLISHER` content packets, one ephemeral socket per
//!   publish.
//! - [`Subscriber`] sends `SUBSCRIBER` requests from a control socket on port
//!   `P` and receives deliveries on `P + delivery_port_offset`, acknowledging
//!   each one as `SUBSCRIBER`.
//!
//! Client requests use the client retry budget (five attempts).

use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::broker::DEFAULT_SUBSCRIBER_PORT_OFFSET;
use crate::cache::{TopicCache, DEFAULT_CONTENT_BOUND};
use crate::protocol::{build_ack, AckKind, DataType, Packet, PacketClass, Value, RECV_BUFFER_LEN};
use crate::sender::{send_reliable, RetryPolicy, SendOutcome, CLIENT_MAX_ATTEMPTS, DEFAULT_ACK_TIMEOUT};
use crate::topic::validate_publish;

const DELIVERY_CHANNEL_CAPACITY: usize = 256;


#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClientConfig {
    pub ack_timeout: Duration,
    pub attempts: u32,
    /// Deliveries arrive on the control port plus this offset.
    pub delivery_port_offset: u16,
    /// Per-topic bound of the subscriber's local content cache.
    pub local_cache_bound: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            ack_timeout: DEFAULT_ACK_TIMEOUT,
            attempts: CLIENT_MAX_ATTEMPTS,
            delivery_port_offset: DEFAULT_SUBSCRIBER_PORT_OFFSET,
            local_cache_bound: DEFAULT_CONTENT_BOUND,
        }
    }
}

impl ClientConfig {
    fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.attempts,
            ack_timeout: self.ack_timeout,
            ..RetryPolicy::client()
        }
    }
}


// ============================================================================
// Publisher
// ============================================================================

#[derive(Debug, Clone)]
pub struct Publisher {
    broker: SocketAddr,
    config: ClientConfig,
}

impl Publisher {
    pub fn new(broker: SocketAddr) -> Self {
        Self::with_config(broker, ClientConfig::default())
    }

    pub fn with_config(broker: SocketAddr, config: ClientConfig) -> Self {
        Self { broker, config }
    }

    /// Publish `value` under `topic`, asking the broker to cache it if `cache`
    /// is set. Wildcard topics and oversized packets are refused locally.
    pub async fn publish(&self, topic: &str, value: impl Into<Value>, cache: bool) -> Result<SendOutcome> {
        let value = value.into();
        validate_publish(topic)?;
        let buffer = Packet::content(PacketClass::Publisher, topic, &value)
            .with_cache(cache)
            .encode()?;

        let local = match self.broker.ip() {
            IpAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
            IpAddr::V6(_) => SocketAddr::new(IpAddr::V6(std::net::Ipv6Addr::UNSPECIFIED), 0),
        };
        let socket = UdpSocket::bind(local).await.context("failed to open publish socket")?;
        let outcome = send_reliable(&socket, self.broker, &buffer, self.config.policy()).await;
        debug!(topic = %topic, value = %value, ?outcome, "publish finished");
        Ok(outcome)
    }
}


// ============================================================================
// Subscriber
// ============================================================================

/// Content received from the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub topic: String,
    pub value: Value,
}

pub struct Subscriber {
    control: Mutex<UdpSocket>,
    broker: SocketAddr,
    config: ClientConfig,
    control_addr: SocketAddr,
    delivery_addr: SocketAddr,
    cache: Arc<RwLock<TopicCache<Value>>>,
    recent: Arc<RwLock<Option<Delivery>>>,
    deliveries: Mutex<mpsc::Receiver<Delivery>>,
    receiver: JoinHandle<()>,
}

impl std::fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscriber")
            .field("broker", &self.broker)
            .field("control_addr", &self.control_addr)
            .field("delivery_addr", &self.delivery_addr)
            .finish()
    }
}

impl Subscriber {
    pub async fn bind(local: &str, broker: SocketAddr) -> Result<Self> {
        Self::bind_with_config(local, broker, ClientConfig::default()).await
    }

    /// Bind the control socket at `local` and the delivery socket next to it.
    pub async fn bind_with_config(local: &str, broker: SocketAddr, config: ClientConfig) -> Result<Self> {
        let local: SocketAddr = local.parse().context("invalid socket address")?;
        let control = UdpSocket::bind(local)
            .await
            .with_context(|| format!("failed to bind control socket on {}", local))?;
        let control_addr = control.local_addr()?;
        let delivery_port = control_addr
            .port()
            .checked_add(config.delivery_port_offset)
            .context("no room for the delivery port")?;
        let delivery_addr = SocketAddr::new(control_addr.ip(), delivery_port);
        let delivery = UdpSocket::bind(delivery_addr)
            .await
            .with_context(|| format!("failed to bind delivery socket on {}", delivery_addr))?;

        let cache = Arc::new(RwLock::new(TopicCache::new(config.local_cache_bound)));
        let recent = Arc::new(RwLock::new(None));
        let (tx, rx) = mpsc::channel(DELIVERY_CHANNEL_CAPACITY);
        let receiver = tokio::spawn(receive_loop(delivery, cache.clone(), recent.clone(), tx));

        debug!(control = %control_addr, delivery = %delivery_addr, broker = %broker, "subscriber bound");

        Ok(Self {
            control: Mutex::new(control),
            broker,
            config,
            control_addr,
            delivery_addr,
            cache,
            recent,
            deliveries: Mutex::new(rx),
            receiver,
        })
    }

    pub fn control_addr(&self) -> SocketAddr {
        self.control_addr
    }

    pub fn delivery_addr(&self) -> SocketAddr {
        self.delivery_addr
    }

    /// Subscribe to `pattern`. Without `cache` the broker only sends what it
    /// currently holds and keeps no subscription.
    pub async fn subscribe(&self, pattern: &str, cache: bool) -> Result<SendOutcome> {
        self.request(DataType::Sub, pattern, cache).await
    }

    pub async fn unsubscribe(&self, pattern: &str) -> Result<SendOutcome> {
        self.request(DataType::Unsub, pattern, false).await
    }

    async fn request(&self, data_type: DataType, pattern: &str, cache: bool) -> Result<SendOutcome> {
        let buffer = Packet::new(PacketClass::Subscriber, data_type, pattern)
            .with_cache(cache)
            .encode()?;
        let control = self.control.lock().await;
        let outcome = send_reliable(&control, self.broker, &buffer, self.config.policy()).await;
        debug!(pattern = %pattern, ?data_type, ?outcome, "subscription request finished");
        Ok(outcome)
    }

    /// Next delivery, or `None` once the subscriber is closed.
    pub async fn recv(&self) -> Option<Delivery> {
        self.deliveries.lock().await.recv().await
    }

    pub async fn recent(&self) -> Option<Delivery> {
        self.recent.read().await.clone()
    }

    /// Locally received content matching `pattern`.
    pub async fn cached(&self, pattern: &str) -> BTreeMap<String, Vec<Value>> {
        self.cache.read().await.get_matching(pattern)
    }

    /// Take everything received so far and clear the local cache.
    pub async fn flush(&self) -> BTreeMap<String, Vec<Value>> {
        let mut cache = self.cache.write().await;
        let content = cache.get_matching("**");
        *cache = TopicCache::new(cache.bound());
        *self.recent.write().await = None;
        content
    }

    /// Stop receiving deliveries.
    pub fn close(&self) {
        self.receiver.abort();
    }
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        self.receiver.abort();
    }
}

async fn receive_loop(
    socket: UdpSocket,
    cache: Arc<RwLock<TopicCache<Value>>>,
    recent: Arc<RwLock<Option<Delivery>>>,
    tx: mpsc::Sender<Delivery>,
) {
    let mut buf = vec![0u8; RECV_BUFFER_LEN];
    loop {
        let (len, from) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(e) => {
                debug!(error = %e, "delivery receive failed");
                continue;
            }
        };
        let raw = &buf[..len];
        let packet = match Packet::decode(raw) {
            Ok(packet) => packet,
            Err(e) => {
                trace!(peer = %from, error = %e, "dropping undecodable delivery");
                continue;
            }
        };

        match build_ack(raw, PacketClass::Subscriber, AckKind::Positive) {
            Ok(ack) => {
                if let Err(e) = socket.send_to(&ack, from).await {
                    debug!(peer = %from, error = %e, "failed to ack delivery");
                }
            }
            Err(e) => trace!(error = %e, "cannot build delivery ack"),
        }

        if !matches!(packet.data_type, DataType::Str | DataType::Int) {
            debug!(peer = %from, data_type = ?packet.data_type, "discarding non-content delivery");
            continue;
        }
        let value = match packet.value() {
            Ok(value) => value,
            Err(e) => {
                warn!(peer = %from, topic = %packet.topic, error = %e, "undecodable delivery payload");
                continue;
            }
        };

        let delivery = Delivery {
            topic: packet.topic,
            value,
        };
        cache.write().await.put(&delivery.topic, Some(delivery.value.clone()));
        *recent.write().await = Some(delivery.clone());
        // Never wait on the reader: the cache and acks must keep up even when
        // nobody calls `recv`.
        if let Err(TrySendError::Full(dropped)) = tx.try_send(delivery) {
            trace!(topic = %dropped.topic, "delivery queue full, skipping recv hand-off");
        }
    }
}
