//! # Broker Node
//!
//! [`Broker`] binds the listening socket, wires the broker core to the
//! dispatcher and runs the receive loop.
//!
//! ```ignore
//! let broker = Broker::bind("127.0.0.1:5000").await?;
//! broker.add_peer("127.0.0.1:5001".parse()?).await?;
//! broker.listen().await?;
//! ```
//!
//! Peers are static: every broker must know every other broker before it
//! starts listening. Each received datagram is handled in its own task,
//! bounded by `max_concurrent_handlers`. Shutting down stops the receive loop
//! only; handlers and sends already running finish on their own.

use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tokio::net::UdpSocket;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn, Instrument};

use crate::broker::{BrokerConfig, BrokerCore, BrokerStats, Ownership, SubscriberRecord};
use crate::dispatcher::Dispatcher;
use crate::protocol::{Value, RECV_BUFFER_LEN};
use crate::sender::UdpCourier;

/// Lowest port accepted in a peer list.
const MIN_PEER_PORT: u16 = 1024;

pub struct Broker {
    socket: Arc<UdpSocket>,
    advertised: SocketAddr,
    dispatcher: Dispatcher<UdpCourier>,
    config: BrokerConfig,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker")
            .field("socket", &self.socket.local_addr())
            .field("advertised", &self.advertised)
            .finish()
    }
}

impl Broker {
    pub async fn bind(addr: &str) -> Result<Self> {
        Self::bind_with_config(addr, BrokerConfig::default()).await
    }

    /// Bind the listening socket. Failing to bind is fatal.
    pub async fn bind_with_config(addr: &str, config: BrokerConfig) -> Result<Self> {
        let addr: SocketAddr = addr.parse().context("invalid socket address")?;
        let socket = UdpSocket::bind(addr)
            .await
            .with_context(|| format!("failed to bind broker socket on {}", addr))?;
        let local_addr = socket.local_addr()?;

        let advertised = config.advertise_addr.unwrap_or(local_addr);
        if advertised.ip().is_unspecified() {
            warn!(addr = %advertised, "advertised address is unspecified; peers cannot reach claimed topics");
        }

        let courier = Arc::new(UdpCourier::new(match local_addr.ip() {
            IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            ip => ip,
        }));
        let core = BrokerCore::spawn(advertised, courier, config.clone());
        let dispatcher = Dispatcher::new(core);

        info!(addr = %local_addr, advertised = %advertised, "broker bound");

        Ok(Self {
            socket: Arc::new(socket),
            advertised,
            dispatcher,
            config,
            listener: Mutex::new(None),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Endpoint announced to peers when this broker claims a topic.
    pub fn advertised_addr(&self) -> SocketAddr {
        self.advertised
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub async fn add_peer(&self, peer: SocketAddr) -> Result<()> {
        if self.is_listening().await {
            warn!(peer = %peer, "peer added after listening started");
        }
        self.dispatcher.core().add_peer(peer).await?;
        Ok(())
    }

    pub async fn add_peers(&self, peers: impl IntoIterator<Item = SocketAddr>) -> Result<()> {
        for peer in peers {
            self.add_peer(peer).await?;
        }
        Ok(())
    }

    pub async fn peers(&self) -> Result<Vec<SocketAddr>> {
        self.dispatcher.core().peers().await
    }

    /// Start the receive loop.
    pub async fn listen(&self) -> Result<()> {
        let mut listener = self.listener.lock().await;
        if listener.as_ref().is_some_and(|h| !h.is_finished()) {
            bail!("broker is already listening");
        }

        let socket = self.socket.clone();
        let dispatcher = self.dispatcher.clone();
        let permits = Arc::new(Semaphore::new(self.config.max_concurrent_handlers.max(1)));

        *listener = Some(tokio::spawn(async move {
            let mut buf = vec![0u8; RECV_BUFFER_LEN];
            loop {
                let permit = match permits.clone().acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => break,
                };
                let (len, from) = match socket.recv_from(&mut buf).await {
                    Ok(received) => received,
                    Err(e) => {
                        debug!(error = %e, "receive failed");
                        continue;
                    }
                };

                let datagram = buf[..len].to_vec();
                let socket = socket.clone();
                let dispatcher = dispatcher.clone();
                let span = tracing::debug_span!("handler", id = %format!("{:04X}", rand::random::<u16>()));
                tokio::spawn(
                    async move {
                        if let Err(e) = dispatcher.handle(&socket, &datagram, from).await {
                            warn!(peer = %from, "packet handling failed: {:?}", e);
                        }
                        drop(permit);
                    }
                    .instrument(span),
                );
            }
        }));

        info!(addr = %self.socket.local_addr()?, "broker listening");
        Ok(())
    }

    pub async fn is_listening(&self) -> bool {
        self.listener
            .lock()
            .await
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    /// Stop receiving. Handlers and sends already in flight are left to finish.
    pub async fn shutdown(&self) {
        if let Some(listener) = self.listener.lock().await.take() {
            listener.abort();
            info!(addr = %self.advertised, "broker stopped listening");
        }
    }

    /// Current ownership of a main topic, without claiming it.
    pub async fn ownership(&self, main_topic: &str) -> Result<Option<Ownership>> {
        self.dispatcher.core().lookup(main_topic).await
    }

    /// Cached content matching `pattern`.
    pub async fn cached(&self, pattern: &str) -> Result<BTreeMap<String, Vec<Value>>> {
        self.dispatcher.core().cached(pattern).await
    }

    pub async fn subscribers(&self, main_topic: &str) -> Result<Vec<SubscriberRecord>> {
        self.dispatcher.core().subscribers(main_topic).await
    }

    pub async fn stats(&self) -> Result<BrokerStats> {
        self.dispatcher.core().stats().await
    }
}


/// Parse a peer list of the form `ip:port@ip:port@...`.
///
/// Hosts must be IPv4 literals or `localhost`; ports must be at least 1024.
pub fn parse_peer_list(list: &str) -> Result<Vec<SocketAddr>> {
    list.split('@')
        .filter(|entry| !entry.trim().is_empty())
        .map(|entry| parse_peer(entry.trim()))
        .collect()
}

fn parse_peer(entry: &str) -> Result<SocketAddr> {
    let (host, port) = entry
        .rsplit_once(':')
        .with_context(|| format!("peer '{}' is not host:port", entry))?;
    let port: u16 = port
        .parse()
        .with_context(|| format!("invalid port in peer '{}'", entry))?;
    if port < MIN_PEER_PORT {
        bail!("port {} in peer '{}' is below {}", port, entry, MIN_PEER_PORT);
    }

    let ip: Ipv4Addr = if host.eq_ignore_ascii_case("localhost") {
        Ipv4Addr::LOCALHOST
    } else {
        host.parse()
            .with_context(|| format!("invalid IPv4 address in peer '{}'", entry))?
    };
    Ok(SocketAddr::new(IpAddr::V4(ip), port))
}
