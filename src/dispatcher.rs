//! # Packet Dispatcher
//!
//! Turns one received datagram into broker actions, in two steps:
//!
//! 1. [`Dispatcher::admit`] decodes and validates the datagram and builds the
//!    acknowledgement to return immediately. Undecodable datagrams and stray
//!    acknowledgements are dropped with no reply.
//! 2. [`Dispatcher::process`] resolves topic ownership and either relays the
//!    request to the owning broker once, or serves it from the local caches.
//!
//! Broker-class packets are always acknowledged positively and are served as
//! owner; they are never relayed a second time.

use std::net::SocketAddr;

use tokio::net::UdpSocket;
use tracing::{debug, trace, warn};

use crate::broker::{BrokerCore, Ownership};
use crate::protocol::{build_ack, encode_endpoint, AckKind, DataType, Packet, PacketClass};
use crate::sender::Courier;
use crate::topic::{self, validate_publish, validate_subscribe, Pattern};

/// A datagram that passed validation and still needs processing.
#[derive(Debug, Clone)]
pub struct Admitted {
    pub packet: Packet,
    pub from: SocketAddr,
}

#[derive(Debug, Clone, Default)]
pub struct Admission {
    /// Raw acknowledgement to send back to the datagram's source.
    pub ack: Option<Vec<u8>>,
    pub admitted: Option<Admitted>,
}

impl Admission {
    fn drop_silently() -> Self {
        Self::default()
    }

    fn reply(raw: &[u8], kind: AckKind, admitted: Option<Admitted>) -> Self {
        match build_ack(raw, PacketClass::Broker, kind) {
            Ok(ack) => Self {
                ack: Some(ack),
                admitted,
            },
            Err(e) => {
                trace!(error = %e, "cannot build ack");
                Self::drop_silently()
            }
        }
    }

    fn reject(raw: &[u8]) -> Self {
        Self::reply(raw, AckKind::Negative, None)
    }

    fn accept(raw: &[u8], packet: Packet, from: SocketAddr) -> Self {
        Self::reply(raw, AckKind::Positive, Some(Admitted { packet, from }))
    }
}


pub struct Dispatcher<C: Courier> {
    core: BrokerCore<C>,
    subscriber_port_offset: u16,
}

impl<C: Courier> Clone for Dispatcher<C> {
    fn clone(&self) -> Self {
        Self {
            core: self.core.clone(),
            subscriber_port_offset: self.subscriber_port_offset,
        }
    }
}

impl<C: Courier> Dispatcher<C> {
    pub fn new(core: BrokerCore<C>) -> Self {
        let subscriber_port_offset = core.config().subscriber_port_offset;
        Self {
            core,
            subscriber_port_offset,
        }
    }

    pub fn core(&self) -> &BrokerCore<C> {
        &self.core
    }

    /// Full handling of one datagram: admit, acknowledge from `socket`, then
    /// process.
    pub async fn handle(&self, socket: &UdpSocket, raw: &[u8], from: SocketAddr) -> anyhow::Result<()> {
        let admission = Self::admit(raw, from);
        if let Some(ack) = &admission.ack {
            // The request is still served; the sender's retry will be acked.
            if let Err(e) = socket.send_to(ack, from).await {
                warn!(peer = %from, error = %e, "failed to send ack");
            }
        }
        match admission.admitted {
            Some(admitted) => self.process(admitted).await,
            None => Ok(()),
        }
    }

    /// Validate a datagram and decide its acknowledgement.
    pub fn admit(raw: &[u8], from: SocketAddr) -> Admission {
        let packet = match Packet::decode(raw) {
            Ok(packet) => packet,
            Err(e) => {
                debug!(peer = %from, error = %e, "dropping undecodable datagram");
                trace!(peer = %from, bytes = %hex::encode(raw), "dropped datagram");
                return Admission::drop_silently();
            }
        };
        if packet.data_type.is_ack() {
            trace!(peer = %from, topic = %packet.topic, "ignoring stray ack");
            return Admission::drop_silently();
        }

        match packet.class {
            PacketClass::Broker => match packet.data_type {
                DataType::TopicOwn
                | DataType::BrokerSub
                | DataType::BrokerUnsub
                | DataType::BrokerStr
                | DataType::BrokerInt => Admission::accept(raw, packet, from),
                other => {
                    debug!(peer = %from, data_type = ?other, "unhandled broker packet");
                    Admission::reply(raw, AckKind::Positive, None)
                }
            },
            PacketClass::Subscriber => {
                if !matches!(packet.data_type, DataType::Sub | DataType::Unsub) {
                    debug!(peer = %from, data_type = ?packet.data_type, "subscriber sent non-subscription");
                    return Admission::reject(raw);
                }
                if let Err(reason) = validate_subscribe(&packet.topic) {
                    debug!(peer = %from, topic = %packet.topic, %reason, "subscription refused");
                    return Admission::reject(raw);
                }
                Admission::accept(raw, packet, from)
            }
            PacketClass::Publisher => {
                if !matches!(packet.data_type, DataType::Str | DataType::Int) {
                    debug!(peer = %from, data_type = ?packet.data_type, "publisher sent non-content");
                    return Admission::reject(raw);
                }
                if let Err(reason) = validate_publish(&packet.topic) {
                    debug!(peer = %from, topic = %packet.topic, %reason, "publish refused");
                    return Admission::reject(raw);
                }
                if let Err(e) = packet.value() {
                    debug!(peer = %from, topic = %packet.topic, error = %e, "publish payload refused");
                    return Admission::reject(raw);
                }
                Admission::accept(raw, packet, from)
            }
        }
    }

    pub async fn process(&self, admitted: Admitted) -> anyhow::Result<()> {
        let Admitted { packet, from } = admitted;
        match packet.data_type {
            DataType::TopicOwn => {
                let owner = packet.endpoint()?;
                let Some(main_topic) = topic::main_topic(&packet.topic) else {
                    return Ok(());
                };
                self.core.record_owner(main_topic, owner).await?;
            }
            DataType::BrokerSub | DataType::BrokerUnsub => {
                let origin = packet.endpoint()?;
                let Ok(pattern) = validate_subscribe(&packet.topic) else {
                    debug!(topic = %packet.topic, "ignoring relayed subscription with invalid pattern");
                    return Ok(());
                };
                let Some(subscriber) = self.delivery_endpoint(origin) else {
                    return Ok(());
                };
                self.serve_subscription(packet.data_type == DataType::BrokerSub, pattern, subscriber, packet.cache)
                    .await?;
            }
            DataType::BrokerStr | DataType::BrokerInt => {
                if packet.topic.contains('*') {
                    debug!(topic = %packet.topic, "ignoring relayed publish with wildcard");
                    return Ok(());
                }
                let value = packet.value()?;
                self.core.publish(&packet.topic, value, packet.cache).await?;
            }
            DataType::Sub | DataType::Unsub => {
                let pattern = validate_subscribe(&packet.topic)?;
                let main_topic = pattern.main_topic().unwrap_or_default().to_string();
                if let Ownership::Remote(owner) = self.core.resolve(&main_topic).await? {
                    let relay = self.relay(&packet, encode_endpoint(from)?.to_vec())?;
                    self.core.forward(owner, relay);
                    return Ok(());
                }
                let Some(subscriber) = self.delivery_endpoint(from) else {
                    return Ok(());
                };
                self.serve_subscription(packet.data_type == DataType::Sub, pattern, subscriber, packet.cache)
                    .await?;
            }
            DataType::Str | DataType::Int => {
                let path = validate_publish(&packet.topic)?;
                let main_topic = topic::main_topic(&path).unwrap_or_default().to_string();
                if let Ownership::Remote(owner) = self.core.resolve(&main_topic).await? {
                    let relay = self.relay(&packet, packet.payload.clone())?;
                    self.core.forward(owner, relay);
                    return Ok(());
                }
                let value = packet.value()?;
                let delivered = self.core.publish(&path, value, packet.cache).await?;
                trace!(topic = %path, delivered, "published");
            }
            DataType::PosAck | DataType::NegAck => {}
        }
        Ok(())
    }

    async fn serve_subscription(
        &self,
        subscribe: bool,
        pattern: Pattern,
        subscriber: SocketAddr,
        cache: bool,
    ) -> anyhow::Result<()> {
        if subscribe {
            let sent = self.core.subscribe(pattern, subscriber, cache).await?;
            trace!(subscriber = %subscriber, cached_sent = sent, "subscription served");
        } else {
            self.core.unsubscribe(pattern, subscriber).await?;
        }
        Ok(())
    }

    /// Broker-class copy of a client request for the owning broker.
    fn relay(&self, packet: &Packet, payload: Vec<u8>) -> anyhow::Result<Packet> {
        let data_type = packet
            .data_type
            .relayed()
            .ok_or_else(|| anyhow::anyhow!("{:?} has no relayed form", packet.data_type))?;
        Ok(Packet::new(PacketClass::Broker, data_type, packet.topic.clone())
            .with_cache(packet.cache)
            .with_payload(payload))
    }

    /// Subscribers listen for deliveries next to the port they send from.
    fn delivery_endpoint(&self, origin: SocketAddr) -> Option<SocketAddr> {
        match origin.port().checked_add(self.subscriber_port_offset) {
            Some(port) => Some(SocketAddr::new(origin.ip(), port)),
            None => {
                warn!(origin = %origin, "subscriber port has no room for the delivery offset");
                None
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::tests::{addr, drain, next_sent, RecordingCourier, Sent};
    use crate::broker::BrokerConfig;
    use crate::protocol::{encode_int, verify_ack, Value, CACHE_YES};
    use crate::sender::RetryPolicy;
    use tokio::sync::mpsc;

    const ME: &str = "127.0.0.1:5000";
    const PEER: &str = "127.0.0.1:5001";

    fn dispatcher() -> (Dispatcher<RecordingCourier>, mpsc::UnboundedReceiver<Sent>) {
        let (courier, rx) = RecordingCourier::new();
        let core = BrokerCore::spawn(addr(ME), courier, BrokerConfig::default());
        (Dispatcher::new(core), rx)
    }

    fn raw(packet: Packet) -> Vec<u8> {
        packet.encode().unwrap()
    }

    async fn run(d: &Dispatcher<RecordingCourier>, bytes: &[u8], from: SocketAddr) -> Admission {
        let admission = Dispatcher::<RecordingCourier>::admit(bytes, from);
        if let Some(admitted) = admission.admitted.clone() {
            d.process(admitted).await.unwrap();
        }
        admission
    }

    fn ack_kind(sent: &[u8], admission: &Admission) -> Option<AckKind> {
        verify_ack(sent, admission.ack.as_ref()?, PacketClass::Broker)
    }

    #[test]
    fn undecodable_and_unknown_types_get_no_ack() {
        let from = addr("127.0.0.1:9000");
        let admission = Dispatcher::<RecordingCourier>::admit(&[0x7A, CACHE_YES], from);
        assert!(admission.ack.is_none() && admission.admitted.is_none());

        let unknown_type = [0x75, CACHE_YES, 0x99, 1, b'a'];
        let admission = Dispatcher::<RecordingCourier>::admit(&unknown_type, from);
        assert!(admission.ack.is_none());

        let unknown_class = [0x01, CACHE_YES, 0x20, 1, b'a'];
        let admission = Dispatcher::<RecordingCourier>::admit(&unknown_class, from);
        assert!(admission.ack.is_none());
    }

    #[test]
    fn invalid_requests_are_refused() {
        let from = addr("127.0.0.1:9000");
        let cases = [
            Packet::new(PacketClass::Subscriber, DataType::Sub, "*"),
            Packet::new(PacketClass::Subscriber, DataType::Sub, "/**"),
            Packet::new(PacketClass::Subscriber, DataType::Sub, "a/*/b"),
            Packet::new(PacketClass::Subscriber, DataType::Str, "a"),
            Packet::content(PacketClass::Publisher, "a/*", &Value::Int(1)),
            Packet::new(PacketClass::Publisher, DataType::Sub, "a"),
            Packet::new(PacketClass::Publisher, DataType::Int, "a").with_payload(vec![1, 2, 3, 4, 5]),
        ];
        for packet in cases {
            let bytes = raw(packet.clone());
            let admission = Dispatcher::<RecordingCourier>::admit(&bytes, from);
            assert_eq!(ack_kind(&bytes, &admission), Some(AckKind::Negative), "{:?}", packet);
            assert!(admission.admitted.is_none());
        }
    }

    #[test]
    fn broker_packets_are_always_acked() {
        let from = addr(PEER);
        let bytes = raw(Packet::new(PacketClass::Broker, DataType::Str, "whatever"));
        let admission = Dispatcher::<RecordingCourier>::admit(&bytes, from);
        assert_eq!(ack_kind(&bytes, &admission), Some(AckKind::Positive));
        assert!(admission.admitted.is_none(), "only relay and ownership types are processed");
    }

    #[tokio::test]
    async fn first_subscribe_claims_and_announces() {
        let (d, mut rx) = dispatcher();
        d.core().add_peer(addr(PEER)).await.unwrap();

        let bytes = raw(Packet::new(PacketClass::Subscriber, DataType::Sub, "x").with_cache(true));
        let admission = run(&d, &bytes, addr("127.0.0.1:9000")).await;
        assert_eq!(ack_kind(&bytes, &admission), Some(AckKind::Positive));

        let announce = next_sent(&mut rx).await;
        assert_eq!(announce.to, addr(PEER));
        assert_eq!(announce.packet.data_type, DataType::TopicOwn);
        assert_eq!(announce.packet.endpoint().unwrap(), addr(ME));

        let records = d.core().subscribers("x").await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].endpoint, addr("127.0.0.1:9001"));
    }

    #[tokio::test]
    async fn publish_for_remote_topic_is_forwarded_once() {
        let (d, mut rx) = dispatcher();
        let owner_announce = raw(
            Packet::new(PacketClass::Broker, DataType::TopicOwn, "x")
                .with_cache(true)
                .with_payload(encode_endpoint(addr(PEER)).unwrap().to_vec()),
        );
        run(&d, &owner_announce, addr("127.0.0.1:40000")).await;

        let publish = raw(Packet::content(PacketClass::Publisher, "x/y", &Value::Int(300)).with_cache(true));
        run(&d, &publish, addr("127.0.0.1:9100")).await;

        let relayed = next_sent(&mut rx).await;
        assert_eq!(relayed.to, addr(PEER));
        assert_eq!(relayed.packet.class, PacketClass::Broker);
        assert_eq!(relayed.packet.data_type, DataType::BrokerInt);
        assert!(relayed.packet.cache);
        assert_eq!(relayed.packet.topic, "x/y");
        assert_eq!(relayed.packet.payload, vec![0x01, 0x2C]);
        assert_eq!(relayed.policy, RetryPolicy::broker(PacketClass::Broker));

        assert!(drain(&mut rx).await.is_empty());
        assert!(d.core().cached("x/**").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn subscribe_for_remote_topic_carries_origin() {
        let (d, mut rx) = dispatcher();
        d.core().record_owner("x", addr(PEER)).await.unwrap();

        let sub = raw(Packet::new(PacketClass::Subscriber, DataType::Sub, "x/*").with_cache(true));
        run(&d, &sub, addr("127.0.0.1:9200")).await;

        let relayed = next_sent(&mut rx).await;
        assert_eq!(relayed.packet.data_type, DataType::BrokerSub);
        assert_eq!(relayed.packet.topic, "x/*");
        assert_eq!(relayed.packet.endpoint().unwrap(), addr("127.0.0.1:9200"));
        assert!(d.core().subscribers("x").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn relayed_subscription_is_served_locally() {
        let (d, mut rx) = dispatcher();
        d.core().publish("x/a", Value::from("cached"), true).await.unwrap();

        let relay = raw(
            Packet::new(PacketClass::Broker, DataType::BrokerSub, "x/*")
                .with_cache(true)
                .with_payload(encode_endpoint(addr("10.1.1.1:9300")).unwrap().to_vec()),
        );
        let admission = run(&d, &relay, addr(PEER)).await;
        assert_eq!(ack_kind(&relay, &admission), Some(AckKind::Positive));

        let delivered = next_sent(&mut rx).await;
        assert_eq!(delivered.to, addr("10.1.1.1:9301"));
        assert_eq!(delivered.packet.topic, "x/a");
        assert_eq!(delivered.packet.value().unwrap(), Value::from("cached"));
        assert_eq!(delivered.policy.responder, PacketClass::Subscriber);

        let records = d.core().subscribers("x").await.unwrap();
        assert_eq!(records[0].endpoint, addr("10.1.1.1:9301"));
    }

    #[tokio::test]
    async fn relayed_publish_is_never_forwarded_again() {
        let (d, mut rx) = dispatcher();
        d.core().record_owner("x", addr(PEER)).await.unwrap();

        let relay = raw(
            Packet::new(PacketClass::Broker, DataType::BrokerInt, "x")
                .with_cache(true)
                .with_payload(encode_int(5)),
        );
        run(&d, &relay, addr(PEER)).await;

        assert!(drain(&mut rx).await.is_empty());
        assert_eq!(d.core().cached("x").await.unwrap()["x"], vec![Value::Int(5)]);
    }

    #[tokio::test]
    async fn relayed_wildcard_publish_is_ignored() {
        let (d, _rx) = dispatcher();
        let relay = raw(
            Packet::new(PacketClass::Broker, DataType::BrokerStr, "x/*")
                .with_cache(true)
                .with_payload(b"nope".to_vec()),
        );
        run(&d, &relay, addr(PEER)).await;
        assert!(d.core().cached("x/**").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn duplicate_announcement_keeps_first_owner() {
        let (d, _rx) = dispatcher();
        for peer in [PEER, "127.0.0.1:5002"] {
            let announce = raw(
                Packet::new(PacketClass::Broker, DataType::TopicOwn, "sensors")
                    .with_cache(true)
                    .with_payload(encode_endpoint(addr(peer)).unwrap().to_vec()),
            );
            run(&d, &announce, addr(peer)).await;
        }
        assert_eq!(
            d.core().lookup("sensors").await.unwrap(),
            Some(Ownership::Remote(addr(PEER)))
        );
    }

    #[tokio::test]
    async fn unsubscribe_uses_sender_endpoint() {
        let (d, _rx) = dispatcher();
        let from = addr("127.0.0.1:9400");
        for topic in ["a/x", "a/y"] {
            let sub = raw(Packet::new(PacketClass::Subscriber, DataType::Sub, topic).with_cache(true));
            run(&d, &sub, from).await;
        }
        let unsub = raw(Packet::new(PacketClass::Subscriber, DataType::Unsub, "a/x"));
        run(&d, &unsub, from).await;

        let records = d.core().subscribers("a").await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].patterns, vec!["a/y"]);
    }

    #[test]
    fn oversized_datagram_is_dropped() {
        let mut bytes = raw(Packet::new(PacketClass::Publisher, DataType::Str, "big").with_cache(true));
        bytes.extend_from_slice(&[b'x'; 2000]);
        let admission = Dispatcher::<RecordingCourier>::admit(&bytes, addr("127.0.0.1:9000"));
        assert!(admission.ack.is_none());
        assert!(admission.admitted.is_none());
    }

    #[tokio::test]
    async fn failed_ack_send_still_processes() {
        let (d, _rx) = dispatcher();
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        // An IPv4 socket cannot reach an IPv6 source, so the ack send fails.
        let from = addr("[::1]:9500");
        let publish = raw(Packet::content(PacketClass::Publisher, "t", &Value::Int(7)).with_cache(true));

        d.handle(&socket, &publish, from).await.unwrap();
        assert_eq!(d.core().cached("t").await.unwrap()["t"], vec![Value::Int(7)]);
    }
}
