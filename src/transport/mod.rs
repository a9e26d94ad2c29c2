//! Transport client and the connectors it runs over

pub mod client;
pub mod endpoints;
pub mod link;
pub mod memory;
pub mod websocket;

pub use client::{ConnectionHandle, SubscriptionCallback, TransportClient};
pub use endpoints::{EndpointRotation, RoundRobinEndpoints};
pub use link::{ConnectionState, Connector, Link, LinkEvent};
pub use memory::{MemoryConnector, MemoryLinkHandle};
pub use websocket::WebSocketConnector;
