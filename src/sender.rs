//! # Reliable Send
//!
//! Datagram delivery with acknowledgement and bounded retry. Each attempt
//! sends the full packet and waits up to the ack timeout for a reply; a
//! positive or negative acknowledgement both end the loop. When every attempt
//! is spent the message is abandoned: nothing is retried later and no caller
//! sees an error.
//!
//! Brokers hand outbound packets to a [`Courier`]. The production
//! [`UdpCourier`] opens a dedicated ephemeral socket per message so that
//! replies to concurrent sends never land on the same socket.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tracing::{debug, trace, warn};

use crate::protocol::{verify_ack, AckKind, Packet, PacketClass, RECV_BUFFER_LEN};

/// How long each attempt waits for its acknowledgement.
pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_millis(500);

/// Attempts for broker fan-out, relay and ownership announcements.
pub const BROKER_MAX_ATTEMPTS: u32 = 3;

/// Attempts for client-originated publish and subscribe requests.
pub const CLIENT_MAX_ATTEMPTS: u32 = 5;


#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub ack_timeout: Duration,
    /// Class an acknowledgement must carry to be accepted.
    pub responder: PacketClass,
}

impl RetryPolicy {
    pub fn broker(responder: PacketClass) -> Self {
        Self {
            max_attempts: BROKER_MAX_ATTEMPTS,
            ack_timeout: DEFAULT_ACK_TIMEOUT,
            responder,
        }
    }

    pub fn client() -> Self {
        Self {
            max_attempts: CLIENT_MAX_ATTEMPTS,
            ack_timeout: DEFAULT_ACK_TIMEOUT,
            responder: PacketClass::Broker,
        }
    }
}

/// Result of one reliable send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Positive acknowledgement after `attempts` tries.
    Accepted { attempts: u32 },
    /// Negative acknowledgement: delivered, but refused by the receiver.
    Rejected { attempts: u32 },
    /// No valid acknowledgement within the attempt budget.
    Abandoned,
}

impl SendOutcome {
    pub fn is_delivered(&self) -> bool {
        !matches!(self, Self::Abandoned)
    }

    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted { .. })
    }
}


/// Send `buffer` to `to` from `socket` until it is acknowledged or the
/// attempt budget runs out.
///
/// A reply that fails validation ends the current attempt early.
pub async fn send_reliable(
    socket: &UdpSocket,
    to: SocketAddr,
    buffer: &[u8],
    policy: RetryPolicy,
) -> SendOutcome {
    let mut reply = vec![0u8; RECV_BUFFER_LEN];

    for attempt in 1..=policy.max_attempts {
        if let Err(e) = socket.send_to(buffer, to).await {
            debug!(peer = %to, attempt, error = %e, "send failed");
            continue;
        }

        match timeout(policy.ack_timeout, socket.recv_from(&mut reply)).await {
            Ok(Ok((len, from))) => match verify_ack(buffer, &reply[..len], policy.responder) {
                Some(AckKind::Positive) => {
                    trace!(peer = %to, attempt, "ack received");
                    return SendOutcome::Accepted { attempts: attempt };
                }
                Some(AckKind::Negative) => {
                    debug!(peer = %to, attempt, "negative ack received");
                    return SendOutcome::Rejected { attempts: attempt };
                }
                None => {
                    debug!(
                        peer = %to,
                        from = %from,
                        attempt,
                        reply = %hex::encode(&reply[..len]),
                        "invalid ack"
                    );
                }
            },
            Ok(Err(e)) => {
                debug!(peer = %to, attempt, error = %e, "receive failed");
            }
            Err(_) => {
                trace!(peer = %to, attempt, max = policy.max_attempts, "ack timeout");
            }
        }
    }

    SendOutcome::Abandoned
}


// ============================================================================
// Courier
// ============================================================================

/// Outbound channel used by the broker for every send it originates.
#[async_trait]
pub trait Courier: Send + Sync + 'static {
    async fn deliver(&self, to: SocketAddr, packet: Packet, policy: RetryPolicy) -> SendOutcome;
}

/// Courier backed by one short-lived UDP socket per message.
#[derive(Debug, Clone)]
pub struct UdpCourier {
    bind_ip: IpAddr,
}

impl UdpCourier {
    pub fn new(bind_ip: IpAddr) -> Self {
        Self { bind_ip }
    }
}

impl Default for UdpCourier {
    fn default() -> Self {
        Self::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED))
    }
}

#[async_trait]
impl Courier for UdpCourier {
    async fn deliver(&self, to: SocketAddr, packet: Packet, policy: RetryPolicy) -> SendOutcome {
        let buffer = match packet.encode() {
            Ok(buffer) => buffer,
            Err(e) => {
                warn!(peer = %to, topic = %packet.topic, error = %e, "dropping unencodable packet");
                return SendOutcome::Abandoned;
            }
        };

        let socket = match UdpSocket::bind(SocketAddr::new(self.bind_ip, 0)).await {
            Ok(socket) => socket,
            Err(e) => {
                warn!(peer = %to, error = %e, "failed to open send socket");
                return SendOutcome::Abandoned;
            }
        };

        let outcome = send_reliable(&socket, to, &buffer, policy).await;
        if !outcome.is_delivered() {
            debug!(
                peer = %to,
                topic = %packet.topic,
                data_type = ?packet.data_type,
                attempts = policy.max_attempts,
                "send abandoned"
            );
        }
        outcome
    }
}
