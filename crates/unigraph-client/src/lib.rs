//! unigraph-client: Live-query and mutation client for a Unigraph store.
//!
//! A [`UnigraphClient`] is constructed once over a [`Transport`] and passed
//! to whatever needs graph access. It provides:
//! - Live queries with per-id callback or channel delivery
//! - One-shot queries and executables with request/response correlation
//! - Object creation and patching with placeholder identifier tracking
//! - Package installation through the shared schema catalog

pub mod client;
mod dispatcher;
pub mod mutations;
pub mod queries;
pub mod subscriptions;
pub mod transport;

pub use client::{ClientError, Result, UnigraphClient};
pub use dispatcher::LinkState;
pub use mutations::{IdentifierMap, ObjectInput, Patch, UpdateOptions};
pub use queries::{type_query, SubscriptionStream};
pub use subscriptions::{DeliveryError, SubscribeOptions, SubscriptionState};
pub use transport::{channel_transport, ChannelTransport, StoreEnd, Transport, TransportError, TransportEvent};
