//! # mightypie-bus
//!
//! Client-side message-bus core for the MightyPie desktop UI.
//!
//! - **Connection**: [`connection::ConnectionManager`] owns the single bus
//!   connection, retries it with [`retry::RetryPolicy`] and publishes a
//!   [`state::ConnectionState`] through a watch channel
//! - **Subscribe**: [`subscriber::SubjectSubscriber`] delivers live messages
//!   to a [`handler::Handler`]; [`subscriber::Subscription`] unsubscribes on drop
//! - **Latest value**: [`durable::DurableConsumerRegistry`] shares one durable
//!   consumer per subject and replays its last value to late joiners
//! - **Publish**: [`publisher::Publisher`] serializes to JSON and sends
//! - **Stream**: [`stream::StreamAdmin`] creates and inspects the events stream
//! - **Bindings**: [`binding::ReactiveBinding`] follows a topic, an enabled
//!   flag and the connection state, re-subscribing as they change
//! - **Transport**: [`transport::Transport`] is the seam to the concrete bus;
//!   [`transport::memory::MemoryBus`] backs tests and the `nats` feature
//!   backs the app
//!
//! [`client::BusClient`] wires all of these to one connection.
//!
//! ## Crate Position
//!
//! Depends on `mightypie-settings`. Used by the UI shell.

#![deny(unsafe_code)]

pub mod binding;
pub mod client;
pub mod connection;
pub mod durable;
pub mod error;
pub mod handler;
pub mod metrics;
pub mod publisher;
pub mod retry;
pub mod state;
pub mod stream;
pub mod subscriber;
pub mod transport;

pub use binding::{BindingKind, BindingStatus, BindingView, Input, ReactiveBinding};
pub use client::BusClient;
pub use connection::ConnectionManager;
pub use durable::{DurableConsumerRegistry, LatestSubscription, durable_key};
pub use error::{BusError, DeliveryError, PublishFailure, Result, TransportError};
pub use handler::{Handler, handler, sync_handler};
pub use publisher::Publisher;
pub use retry::RetryPolicy;
pub use state::ConnectionState;
pub use stream::StreamAdmin;
pub use subscriber::{SubjectSubscriber, Subscription};
pub use transport::memory::MemoryBus;
pub use transport::{
    BusConnection, ConnectParams, LastMessage, ParamsSource, StatusEvent, StreamInfo, StreamSpec,
    Transport,
};
#[cfg(feature = "nats")]
pub use transport::nats::NatsTransport;
