//! Events module - the append-only conversation log and its delivery paths
//!
//! Submodules:
//! - [`event`]: the event type, sources and payload kinds
//! - [`store`]: read-only replay over persisted history
//! - [`stream`]: the write path with local synchronous fan-out
//! - [`broker`]: the transport seam for cross-node delivery
//! - [`distributed`]: broker-backed streams and the warm consumer pool

pub mod broker;
pub mod distributed;
pub mod event;
pub mod store;
pub mod stream;

pub use broker::{group_for, topic_for, Broker, BrokerMessage, BrokerReceiver, InMemoryBroker};
pub use distributed::{ConsumerPool, DistributedEventStream};
pub use event::{Event, EventPayload, EventSource, SecurityRisk};
pub use store::{session_exists, EventIter, EventStore, DEFAULT_CACHE_SIZE};
pub use stream::{EventCallback, EventStream, SubscriberKind, SECRET_MASK};
