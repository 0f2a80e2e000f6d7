//! # Broker Core
//!
//! Owns all mutable broker state: the ownership table, the content cache and
//! the subscriber cache. State lives in a single actor task; the cloneable
//! [`BrokerCore`] handle sends it commands. Because the actor processes one
//! command at a time, "check ownership, else claim" is atomic per broker.
//!
//! ## Ownership
//!
//! A main topic is local when either cache already has a top-level node for
//! it, remote when the ownership table names another broker, and otherwise
//! unowned. Resolving an unowned topic claims it: empty nodes are created in
//! both caches and an announcement carrying this broker's endpoint goes to
//! every peer. Announcements received from peers are recorded only for topics
//! with no table entry yet, so the first announcement wins.
//!
//! Two brokers that claim the same topic at the same time each keep their own
//! claim and ignore the other's announcement. That split is not detected.
//!
//! ## Outbound traffic
//!
//! Deliveries, relays and announcements are handed to the [`Courier`] in
//! their own tasks; the actor never waits on the network.

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, trace, warn};

use crate::cache::{TopicCache, DEFAULT_CONTENT_BOUND, DEFAULT_SUBSCRIBER_BOUND};
use crate::protocol::{encode_endpoint, DataType, Packet, PacketClass, Value};
use crate::sender::{Courier, RetryPolicy, BROKER_MAX_ATTEMPTS, DEFAULT_ACK_TIMEOUT};
use crate::topic::{self, Pattern};

/// Default bound on concurrently running packet handlers.
pub const DEFAULT_MAX_CONCURRENT_HANDLERS: usize = 1024;

/// Subscribers receive deliveries on their request port plus this offset.
pub const DEFAULT_SUBSCRIBER_PORT_OFFSET: u16 = 1;

const COMMAND_CHANNEL_CAPACITY: usize = 1000;


#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BrokerConfig {
    pub content_bound: usize,
    pub subscriber_bound: usize,
    pub ack_timeout: Duration,
    pub broker_attempts: u32,
    pub max_concurrent_handlers: usize,
    pub subscriber_port_offset: u16,
    /// Endpoint announced in ownership claims. Defaults to the bound address.
    pub advertise_addr: Option<SocketAddr>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            content_bound: DEFAULT_CONTENT_BOUND,
            subscriber_bound: DEFAULT_SUBSCRIBER_BOUND,
            ack_timeout: DEFAULT_ACK_TIMEOUT,
            broker_attempts: BROKER_MAX_ATTEMPTS,
            max_concurrent_handlers: DEFAULT_MAX_CONCURRENT_HANDLERS,
            subscriber_port_offset: DEFAULT_SUBSCRIBER_PORT_OFFSET,
            advertise_addr: None,
        }
    }
}

impl BrokerConfig {
    pub(crate) fn policy(&self, responder: PacketClass) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.broker_attempts,
            ack_timeout: self.ack_timeout,
            responder,
        }
    }
}


/// Where a main topic is served from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ownership {
    /// Already known to this broker.
    Local,
    /// Unowned until now; this broker just claimed it.
    Claimed,
    /// Owned by another broker.
    Remote(SocketAddr),
}

impl Ownership {
    pub fn is_local(&self) -> bool {
        !matches!(self, Self::Remote(_))
    }
}

/// A subscriber and the patterns it holds under one main topic.
///
/// Records are identified by endpoint alone.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriberRecord {
    pub endpoint: SocketAddr,
    pub patterns: Vec<String>,
}

impl SubscriberRecord {
    pub fn new(endpoint: SocketAddr, pattern: String) -> Self {
        Self {
            endpoint,
            patterns: vec![pattern],
        }
    }

    pub fn add_pattern(&mut self, pattern: String) {
        if !self.patterns.contains(&pattern) {
            self.patterns.push(pattern);
        }
    }

    /// Whether any held pattern matches the concrete topic.
    pub fn wants(&self, topic: &[&str]) -> bool {
        self.patterns
            .iter()
            .filter_map(|p| Pattern::parse(p).ok())
            .any(|p| p.matches_segments(topic))
    }
}

impl PartialEq for SubscriberRecord {
    fn eq(&self, other: &Self) -> bool {
        self.endpoint == other.endpoint
    }
}

impl Eq for SubscriberRecord {}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerStats {
    pub peers: usize,
    /// Main topics this broker serves.
    pub local_topics: usize,
    /// Main topics recorded as owned by a peer.
    pub remote_topics: usize,
    pub subscriber_records: usize,
}


// ============================================================================
// Commands sent from Handle to Actor
// ============================================================================

enum Command {
    AddPeer(SocketAddr, oneshot::Sender<bool>),
    Peers(oneshot::Sender<Vec<SocketAddr>>),
    Resolve(String, oneshot::Sender<Ownership>),
    Lookup(String, oneshot::Sender<Option<Ownership>>),
    RecordOwner(String, SocketAddr, oneshot::Sender<bool>),
    Subscribe {
        pattern: Pattern,
        subscriber: SocketAddr,
        cache: bool,
        reply: oneshot::Sender<usize>,
    },
    Unsubscribe {
        pattern: Pattern,
        subscriber: SocketAddr,
        reply: oneshot::Sender<bool>,
    },
    Publish {
        topic: String,
        value: Value,
        cache: bool,
        reply: oneshot::Sender<usize>,
    },
    Cached(String, oneshot::Sender<BTreeMap<String, Vec<Value>>>),
    Subscribers(String, oneshot::Sender<Vec<SubscriberRecord>>),
    Stats(oneshot::Sender<BrokerStats>),
    Quit,
}


// ============================================================================
// BrokerCore Handle (public API - cheap to clone)
// ============================================================================

pub struct BrokerCore<C: Courier> {
    cmd_tx: mpsc::Sender<Command>,
    courier: Arc<C>,
    config: BrokerConfig,
}

impl<C: Courier> Clone for BrokerCore<C> {
    fn clone(&self) -> Self {
        Self {
            cmd_tx: self.cmd_tx.clone(),
            courier: self.courier.clone(),
            config: self.config.clone(),
        }
    }
}

impl<C: Courier> std::fmt::Debug for BrokerCore<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerCore")
            .field("advertise_addr", &self.config.advertise_addr)
            .finish()
    }
}

fn closed() -> anyhow::Error {
    anyhow::anyhow!("broker actor closed")
}

impl<C: Courier> BrokerCore<C> {
    /// Start the actor. `me` is the endpoint announced when claiming topics.
    pub fn spawn(me: SocketAddr, courier: Arc<C>, config: BrokerConfig) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let actor = BrokerActor::new(me, courier.clone(), config.clone());
        tokio::spawn(actor.run(cmd_rx));
        Self {
            cmd_tx,
            courier,
            config,
        }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    async fn request<T>(&self, cmd: Command, rx: oneshot::Receiver<T>) -> anyhow::Result<T> {
        self.cmd_tx.send(cmd).await.map_err(|_| closed())?;
        rx.await.map_err(|_| closed())
    }

    /// Returns `false` if the peer was already known.
    pub async fn add_peer(&self, peer: SocketAddr) -> anyhow::Result<bool> {
        let (tx, rx) = oneshot::channel();
        self.request(Command::AddPeer(peer, tx), rx).await
    }

    pub async fn peers(&self) -> anyhow::Result<Vec<SocketAddr>> {
        let (tx, rx) = oneshot::channel();
        self.request(Command::Peers(tx), rx).await
    }

    /// Decide who serves `main_topic`, claiming it if nobody does.
    pub async fn resolve(&self, main_topic: &str) -> anyhow::Result<Ownership> {
        let (tx, rx) = oneshot::channel();
        self.request(Command::Resolve(main_topic.to_string(), tx), rx).await
    }

    /// Like [`resolve`](Self::resolve) but never claims. `None` means unowned.
    pub async fn lookup(&self, main_topic: &str) -> anyhow::Result<Option<Ownership>> {
        let (tx, rx) = oneshot::channel();
        self.request(Command::Lookup(main_topic.to_string(), tx), rx).await
    }

    /// Record a peer's ownership announcement. Returns `false` when the topic
    /// already had an owner.
    pub async fn record_owner(&self, main_topic: &str, owner: SocketAddr) -> anyhow::Result<bool> {
        let (tx, rx) = oneshot::channel();
        self.request(Command::RecordOwner(main_topic.to_string(), owner, tx), rx)
            .await
    }

    /// Send cached content matching `pattern` to `subscriber` and, if `cache`
    /// is set, keep the subscription. Returns the number of deliveries queued.
    pub async fn subscribe(
        &self,
        pattern: Pattern,
        subscriber: SocketAddr,
        cache: bool,
    ) -> anyhow::Result<usize> {
        let (reply, rx) = oneshot::channel();
        self.request(
            Command::Subscribe {
                pattern,
                subscriber,
                cache,
                reply,
            },
            rx,
        )
        .await
    }

    /// Returns `true` if the subscriber's record was removed entirely.
    pub async fn unsubscribe(&self, pattern: Pattern, subscriber: SocketAddr) -> anyhow::Result<bool> {
        let (reply, rx) = oneshot::channel();
        self.request(
            Command::Unsubscribe {
                pattern,
                subscriber,
                reply,
            },
            rx,
        )
        .await
    }

    /// Fan `value` out to matching subscribers and cache it if requested.
    /// Returns the number of deliveries queued.
    pub async fn publish(&self, topic: &str, value: Value, cache: bool) -> anyhow::Result<usize> {
        let (reply, rx) = oneshot::channel();
        self.request(
            Command::Publish {
                topic: topic.to_string(),
                value,
                cache,
                reply,
            },
            rx,
        )
        .await
    }

    /// Relay a packet to the owning broker. Fire and forget.
    pub fn forward(&self, owner: SocketAddr, packet: Packet) {
        let courier = self.courier.clone();
        let policy = self.config.policy(PacketClass::Broker);
        debug!(owner = %owner, topic = %packet.topic, data_type = ?packet.data_type, "forwarding to owner");
        tokio::spawn(async move {
            courier.deliver(owner, packet, policy).await;
        });
    }

    pub async fn cached(&self, pattern: &str) -> anyhow::Result<BTreeMap<String, Vec<Value>>> {
        let (tx, rx) = oneshot::channel();
        self.request(Command::Cached(pattern.to_string(), tx), rx).await
    }

    pub async fn subscribers(&self, main_topic: &str) -> anyhow::Result<Vec<SubscriberRecord>> {
        let (tx, rx) = oneshot::channel();
        self.request(Command::Subscribers(main_topic.to_string(), tx), rx)
            .await
    }

    pub async fn stats(&self) -> anyhow::Result<BrokerStats> {
        let (tx, rx) = oneshot::channel();
        self.request(Command::Stats(tx), rx).await
    }

    pub async fn quit(&self) {
        let _ = self.cmd_tx.send(Command::Quit).await;
    }
}


// ============================================================================
// Broker Actor (owns state)
// ============================================================================

struct BrokerActor<C: Courier> {
    me: SocketAddr,
    courier: Arc<C>,
    config: BrokerConfig,
    peers: Vec<SocketAddr>,
    owners: HashMap<String, SocketAddr>,
    content: TopicCache<Value>,
    subscribers: TopicCache<SubscriberRecord>,
}

impl<C: Courier> BrokerActor<C> {
    fn new(me: SocketAddr, courier: Arc<C>, config: BrokerConfig) -> Self {
        Self {
            me,
            courier,
            content: TopicCache::new(config.content_bound),
            subscribers: TopicCache::new(config.subscriber_bound),
            config,
            peers: Vec::new(),
            owners: HashMap::new(),
        }
    }

    async fn run(mut self, mut cmd_rx: mpsc::Receiver<Command>) {
        while let Some(cmd) = cmd_rx.recv().await {
            match cmd {
                Command::AddPeer(peer, reply) => {
                    let _ = reply.send(self.add_peer(peer));
                }
                Command::Peers(reply) => {
                    let _ = reply.send(self.peers.clone());
                }
                Command::Resolve(main_topic, reply) => {
                    let _ = reply.send(self.resolve(&main_topic));
                }
                Command::Lookup(main_topic, reply) => {
                    let _ = reply.send(self.lookup(&main_topic));
                }
                Command::RecordOwner(main_topic, owner, reply) => {
                    let _ = reply.send(self.record_owner(main_topic, owner));
                }
                Command::Subscribe {
                    pattern,
                    subscriber,
                    cache,
                    reply,
                } => {
                    let _ = reply.send(self.subscribe(&pattern, subscriber, cache));
                }
                Command::Unsubscribe {
                    pattern,
                    subscriber,
                    reply,
                } => {
                    let _ = reply.send(self.unsubscribe(&pattern, subscriber));
                }
                Command::Publish {
                    topic,
                    value,
                    cache,
                    reply,
                } => {
                    let _ = reply.send(self.publish(&topic, value, cache));
                }
                Command::Cached(pattern, reply) => {
                    let _ = reply.send(self.content.get_matching(&pattern));
                }
                Command::Subscribers(main_topic, reply) => {
                    let _ = reply.send(self.subscribers.get(&main_topic));
                }
                Command::Stats(reply) => {
                    let _ = reply.send(self.stats());
                }
                Command::Quit => {
                    debug!("broker actor quitting");
                    break;
                }
            }
        }
        trace!("broker actor stopped");
    }

    fn add_peer(&mut self, peer: SocketAddr) -> bool {
        if peer == self.me || self.peers.contains(&peer) {
            return false;
        }
        info!(peer = %peer, "added peer broker");
        self.peers.push(peer);
        true
    }

    fn lookup(&self, main_topic: &str) -> Option<Ownership> {
        if self.content.has_top_level(main_topic) || self.subscribers.has_top_level(main_topic) {
            return Some(Ownership::Local);
        }
        self.owners.get(main_topic).copied().map(Ownership::Remote)
    }

    fn resolve(&mut self, main_topic: &str) -> Ownership {
        if let Some(ownership) = self.lookup(main_topic) {
            return ownership;
        }
        self.claim(main_topic);
        Ownership::Claimed
    }

    fn claim(&mut self, main_topic: &str) {
        self.content.put(main_topic, None);
        self.subscribers.put(main_topic, None);
        info!(topic = %main_topic, peers = self.peers.len(), "claimed topic ownership");

        let endpoint = match encode_endpoint(self.me) {
            Ok(endpoint) => endpoint,
            Err(e) => {
                warn!(topic = %main_topic, error = %e, "cannot announce ownership");
                return;
            }
        };
        let announce = Packet::new(PacketClass::Broker, DataType::TopicOwn, main_topic)
            .with_cache(true)
            .with_payload(endpoint.to_vec());
        for peer in &self.peers {
            self.send(*peer, announce.clone(), PacketClass::Broker);
        }
    }

    fn record_owner(&mut self, main_topic: String, owner: SocketAddr) -> bool {
        if let Some(existing) = self.owners.get(&main_topic) {
            debug!(topic = %main_topic, owner = %existing, ignored = %owner, "owner already recorded");
            return false;
        }
        info!(topic = %main_topic, owner = %owner, "recorded topic owner");
        self.owners.insert(main_topic, owner);
        true
    }

    fn subscribe(&mut self, pattern: &Pattern, subscriber: SocketAddr, cache: bool) -> usize {
        let Some(main_topic) = pattern.main_topic() else {
            return 0;
        };
        let normalized = pattern.to_string();

        let mut deliveries = 0;
        for (path, values) in self.content.get_matching(&normalized) {
            for value in values {
                self.deliver(subscriber, &path, &value);
                deliveries += 1;
            }
        }

        if cache {
            let existing = self
                .subscribers
                .get_mut(main_topic)
                .and_then(|records| records.iter_mut().find(|r| r.endpoint == subscriber));
            match existing {
                Some(record) => record.add_pattern(normalized.clone()),
                None => {
                    self.subscribers
                        .put(main_topic, Some(SubscriberRecord::new(subscriber, normalized.clone())));
                }
            }
            debug!(subscriber = %subscriber, pattern = %normalized, "subscription stored");
        }
        deliveries
    }

    fn unsubscribe(&mut self, pattern: &Pattern, subscriber: SocketAddr) -> bool {
        let Some(main_topic) = pattern.main_topic() else {
            return false;
        };
        let Some(record) = self
            .subscribers
            .get_mut(main_topic)
            .and_then(|records| records.iter_mut().find(|r| r.endpoint == subscriber))
        else {
            return false;
        };

        record.patterns.retain(|p| !pattern.matches(p));
        if !record.patterns.is_empty() {
            debug!(subscriber = %subscriber, remaining = ?record.patterns, "patterns removed");
            return false;
        }

        let probe = SubscriberRecord {
            endpoint: subscriber,
            patterns: Vec::new(),
        };
        self.subscribers.remove_one(main_topic, &probe);
        debug!(subscriber = %subscriber, topic = %main_topic, "subscriber removed");
        true
    }

    fn publish(&mut self, topic: &str, value: Value, cache: bool) -> usize {
        let path = topic::normalize(topic);
        let segs = topic::segments(&path);
        let Some(main_topic) = segs.first() else {
            return 0;
        };

        let targets: Vec<SocketAddr> = self
            .subscribers
            .get(main_topic)
            .into_iter()
            .filter(|record| record.wants(&segs))
            .map(|record| record.endpoint)
            .collect();
        for target in &targets {
            self.deliver(*target, &path, &value);
        }

        if cache {
            self.content.put(&path, Some(value));
        }
        targets.len()
    }

    fn stats(&self) -> BrokerStats {
        let local = self.content.list_top_level_topics();
        let subscriber_records = self
            .subscribers
            .list_top_level_topics()
            .iter()
            .map(|t| self.subscribers.get(t).len())
            .sum::<usize>();
        BrokerStats {
            peers: self.peers.len(),
            local_topics: local.len(),
            remote_topics: self.owners.len(),
            subscriber_records,
        }
    }

    fn deliver(&self, subscriber: SocketAddr, path: &str, value: &Value) {
        let packet = Packet::content(PacketClass::Broker, path, value).with_cache(true);
        self.send(subscriber, packet, PacketClass::Subscriber);
    }

    fn send(&self, to: SocketAddr, packet: Packet, responder: PacketClass) {
        let courier = self.courier.clone();
        let policy = self.config.policy(responder);
        tokio::spawn(async move {
            courier.deliver(to, packet, policy).await;
        });
    }
}


#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use async_trait::async_trait;
    use tokio::time::timeout;

    use crate::sender::SendOutcome;

    #[derive(Debug, Clone)]
    pub(crate) struct Sent {
        pub to: SocketAddr,
        pub packet: Packet,
        pub policy: RetryPolicy,
    }

    /// Courier that records every packet instead of sending it.
    pub(crate) struct RecordingCourier {
        tx: mpsc::UnboundedSender<Sent>,
    }

    impl RecordingCourier {
        pub(crate) fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Sent>) {
            let (tx, rx) = mpsc::unbounded_channel();
            (Arc::new(Self { tx }), rx)
        }
    }

    #[async_trait]
    impl Courier for RecordingCourier {
        async fn deliver(&self, to: SocketAddr, packet: Packet, policy: RetryPolicy) -> SendOutcome {
            let _ = self.tx.send(Sent { to, packet, policy });
            SendOutcome::Accepted { attempts: 1 }
        }
    }

    pub(crate) async fn next_sent(rx: &mut mpsc::UnboundedReceiver<Sent>) -> Sent {
        timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("timed out waiting for send")
            .expect("courier dropped")
    }

    pub(crate) async fn drain(rx: &mut mpsc::UnboundedReceiver<Sent>) -> Vec<Sent> {
        let mut out = Vec::new();
        while let Ok(Some(sent)) = timeout(Duration::from_millis(100), rx.recv()).await {
            out.push(sent);
        }
        out
    }

    pub(crate) fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    fn spawn_core() -> (BrokerCore<RecordingCourier>, mpsc::UnboundedReceiver<Sent>) {
        let (courier, rx) = RecordingCourier::new();
        let core = BrokerCore::spawn(addr("127.0.0.1:5000"), courier, BrokerConfig::default());
        (core, rx)
    }

    fn pattern(s: &str) -> Pattern {
        Pattern::parse(s).unwrap()
    }

    #[test]
    fn config_defaults() {
        let config = BrokerConfig::default();
        assert_eq!(config.content_bound, 8);
        assert_eq!(config.subscriber_bound, 250_000);
        assert_eq!(config.ack_timeout, Duration::from_millis(500));
        assert_eq!(config.broker_attempts, 3);
        assert_eq!(config.subscriber_port_offset, 1);
        assert!(config.advertise_addr.is_none());
    }

    #[test]
    fn subscriber_patterns_deduplicate() {
        let mut record = SubscriberRecord::new(addr("127.0.0.1:7001"), "a/x".into());
        record.add_pattern("a/x".into());
        record.add_pattern("a/y".into());
        assert_eq!(record.patterns, vec!["a/x", "a/y"]);
        assert!(record.wants(&["a", "y"]));
        assert!(!record.wants(&["a", "z"]));
    }

    #[tokio::test]
    async fn claim_announces_to_every_peer() {
        let (core, mut rx) = spawn_core();
        core.add_peer(addr("127.0.0.1:5001")).await.unwrap();
        core.add_peer(addr("127.0.0.1:5002")).await.unwrap();
        assert!(!core.add_peer(addr("127.0.0.1:5002")).await.unwrap());

        assert_eq!(core.resolve("sensors").await.unwrap(), Ownership::Claimed);
        assert_eq!(core.resolve("sensors").await.unwrap(), Ownership::Local);

        let sent = drain(&mut rx).await;
        assert_eq!(sent.len(), 2, "one announcement per peer, once");
        for s in &sent {
            assert_eq!(s.packet.class, PacketClass::Broker);
            assert_eq!(s.packet.data_type, DataType::TopicOwn);
            assert_eq!(s.packet.topic, "sensors");
            assert_eq!(s.packet.endpoint().unwrap(), addr("127.0.0.1:5000"));
            assert_eq!(s.policy.responder, PacketClass::Broker);
            assert_eq!(s.policy.max_attempts, 3);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_resolves_claim_once() {
        let (core, mut rx) = spawn_core();
        let peers = [addr("127.0.0.1:5001"), addr("127.0.0.1:5002")];
        for peer in peers {
            core.add_peer(peer).await.unwrap();
        }

        let handles: Vec<_> = (0..50)
            .map(|_| {
                let core = core.clone();
                tokio::spawn(async move { core.resolve("t").await.unwrap() })
            })
            .collect();
        let mut claimed = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ownership::Claimed => claimed += 1,
                other => assert_eq!(other, Ownership::Local),
            }
        }
        assert_eq!(claimed, 1);

        let sent = drain(&mut rx).await;
        for peer in peers {
            let announces = sent
                .iter()
                .filter(|s| s.to == peer && s.packet.data_type == DataType::TopicOwn)
                .count();
            assert_eq!(announces, 1, "announcements to {}", peer);
        }
    }

    #[tokio::test]
    async fn first_recorded_owner_wins() {
        let (core, _rx) = spawn_core();
        let b1 = addr("127.0.0.1:6001");
        let b2 = addr("127.0.0.1:6002");

        assert!(core.record_owner("sensors", b1).await.unwrap());
        assert!(!core.record_owner("sensors", b2).await.unwrap());
        assert!(!core.record_owner("sensors", b1).await.unwrap());
        assert_eq!(core.resolve("sensors").await.unwrap(), Ownership::Remote(b1));
        assert_eq!(core.lookup("sensors").await.unwrap(), Some(Ownership::Remote(b1)));
        assert_eq!(core.lookup("other").await.unwrap(), None);
    }

    #[tokio::test]
    async fn local_claim_outranks_late_announcement() {
        let (core, _rx) = spawn_core();
        core.resolve("sensors").await.unwrap();
        core.record_owner("sensors", addr("127.0.0.1:6001")).await.unwrap();
        assert_eq!(core.resolve("sensors").await.unwrap(), Ownership::Local);
    }

    #[tokio::test]
    async fn publish_fans_out_and_caches_independently() {
        let (core, mut rx) = spawn_core();
        let sub = addr("127.0.0.1:7001");
        core.resolve("temp").await.unwrap();
        core.subscribe(pattern("temp"), sub, true).await.unwrap();

        assert_eq!(core.publish("temp", Value::from("72F"), true).await.unwrap(), 1);
        assert_eq!(core.publish("temp", Value::from("80F"), false).await.unwrap(), 1);

        let first = next_sent(&mut rx).await;
        let second = next_sent(&mut rx).await;
        let mut values = vec![first.packet.value().unwrap(), second.packet.value().unwrap()];
        values.sort_by_key(|v| v.to_string());
        assert_eq!(values, vec![Value::from("72F"), Value::from("80F")]);
        assert_eq!(first.to, sub);
        assert_eq!(first.packet.class, PacketClass::Broker);
        assert!(first.packet.cache);
        assert_eq!(first.packet.data_type, DataType::Str);
        assert_eq!(first.policy.responder, PacketClass::Subscriber);

        let cached = core.cached("temp").await.unwrap();
        assert_eq!(cached["temp"], vec![Value::from("72F")]);
    }

    #[tokio::test]
    async fn one_shot_subscribe_pulls_without_storing() {
        let (core, mut rx) = spawn_core();
        core.publish("temp/in", Value::Int(21), true).await.unwrap();
        core.publish("temp/out", Value::Int(7), true).await.unwrap();

        let sub = addr("127.0.0.1:7003");
        assert_eq!(core.subscribe(pattern("temp/*"), sub, false).await.unwrap(), 2);
        assert!(core.subscribers("temp").await.unwrap().is_empty());

        let sent = drain(&mut rx).await;
        let mut topics: Vec<String> = sent.iter().map(|s| s.packet.topic.clone()).collect();
        topics.sort();
        assert_eq!(topics, vec!["temp/in", "temp/out"]);
        assert!(sent.iter().all(|s| s.packet.data_type == DataType::Int));
    }

    #[tokio::test]
    async fn unsubscribe_removes_matching_patterns() {
        let (core, _rx) = spawn_core();
        let sub = addr("127.0.0.1:7001");
        core.subscribe(pattern("a/x"), sub, true).await.unwrap();
        core.subscribe(pattern("a/y"), sub, true).await.unwrap();
        core.subscribe(pattern("a/y"), sub, true).await.unwrap();

        let records = core.subscribers("a").await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].patterns, vec!["a/x", "a/y"]);

        assert!(!core.unsubscribe(pattern("a/x"), sub).await.unwrap());
        let records = core.subscribers("a").await.unwrap();
        assert_eq!(records[0].patterns, vec!["a/y"]);

        assert!(core.unsubscribe(pattern("a/*"), sub).await.unwrap());
        assert!(core.subscribers("a").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn subtree_unsubscribe_removes_record() {
        let (core, _rx) = spawn_core();
        let sub = addr("127.0.0.1:7001");
        core.subscribe(pattern("a/x"), sub, true).await.unwrap();
        core.subscribe(pattern("a/y"), sub, true).await.unwrap();
        assert!(core.unsubscribe(pattern("a/**"), sub).await.unwrap());
        assert!(core.subscribers("a").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn wildcard_subscription_matches_descendants_only() {
        let (core, mut rx) = spawn_core();
        let sub = addr("127.0.0.1:7001");
        core.subscribe(pattern("home/*"), sub, true).await.unwrap();

        assert_eq!(core.publish("home", Value::Int(1), false).await.unwrap(), 0);
        assert_eq!(core.publish("home/kitchen", Value::Int(2), false).await.unwrap(), 1);
        assert_eq!(core.publish("home/kitchen/oven", Value::Int(3), false).await.unwrap(), 1);

        let sent = drain(&mut rx).await;
        assert_eq!(sent.len(), 2);
    }

    #[tokio::test]
    async fn stats_reflect_state() {
        let (core, _rx) = spawn_core();
        core.add_peer(addr("127.0.0.1:5001")).await.unwrap();
        core.resolve("a").await.unwrap();
        core.record_owner("b", addr("127.0.0.1:5001")).await.unwrap();
        core.subscribe(pattern("a"), addr("127.0.0.1:7001"), true).await.unwrap();

        let stats = core.stats().await.unwrap();
        assert_eq!(stats.peers, 1);
        assert_eq!(stats.local_topics, 1);
        assert_eq!(stats.remote_topics, 1);
        assert_eq!(stats.subscriber_records, 1);
    }

    #[tokio::test]
    async fn quit_closes_handle() {
        let (core, _rx) = spawn_core();
        core.quit().await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(core.peers().await.is_err());
    }
}
