mod broker;
mod cache;
mod client;
mod dispatcher;
mod node;
mod protocol;
mod sender;
mod topic;

pub use broker::{BrokerConfig, BrokerCore, BrokerStats, Ownership, SubscriberRecord};
pub use cache::TopicCache;
pub use client::{ClientConfig, Delivery, Publisher, Subscriber};
pub use dispatcher::{Admission, Admitted, Dispatcher};
pub use node::{parse_peer_list, Broker};
pub use protocol::{
    build_ack, verify_ack, AckKind, CodecError, DataType, Packet, PacketClass, Value,
};
pub use sender::{send_reliable, Courier, RetryPolicy, SendOutcome, UdpCourier};
pub use topic::{Pattern, TopicRejection};
