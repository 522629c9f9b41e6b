//! Facade wiring every component to one managed connection.

use std::sync::Arc;

use mightypie_settings::BusSettings;
use serde::Serialize;
use tokio::sync::watch;
use tracing::info;

use crate::binding::{BindingKind, Input, ReactiveBinding};
use crate::connection::ConnectionManager;
use crate::durable::{DurableConsumerRegistry, LatestSubscription};
use crate::error::BusError;
use crate::handler::Handler;
use crate::publisher::Publisher;
use crate::retry::RetryPolicy;
use crate::state::ConnectionState;
use crate::stream::StreamAdmin;
use crate::subscriber::{SubjectSubscriber, Subscription};
use crate::transport::{ParamsSource, Transport};

struct ClientInner {
    connection: Arc<ConnectionManager>,
    subscriber: SubjectSubscriber,
    publisher: Publisher,
    durables: DurableConsumerRegistry,
    streams: StreamAdmin,
    ensure_on_connect: bool,
}

/// The bus client used by the desktop UI. Cloning is cheap and shares state.
#[derive(Clone)]
pub struct BusClient {
    inner: Arc<ClientInner>,
}

impl BusClient {
    /// Client whose connect parameters come from `settings`.
    pub fn new(transport: Arc<dyn Transport>, settings: &BusSettings) -> Self {
        Self::with_params(transport, Arc::new(settings.clone()), settings)
    }

    /// Client with a separate parameter source.
    pub fn with_params(
        transport: Arc<dyn Transport>,
        params: Arc<dyn ParamsSource>,
        settings: &BusSettings,
    ) -> Self {
        let connection = Arc::new(ConnectionManager::new(
            transport,
            params,
            RetryPolicy::from_settings(&settings.retry),
        ));
        Self {
            inner: Arc::new(ClientInner {
                subscriber: SubjectSubscriber::new(Arc::clone(&connection)),
                publisher: Publisher::new(Arc::clone(&connection)),
                durables: DurableConsumerRegistry::new(
                    Arc::clone(&connection),
                    settings.stream.name.clone(),
                    settings.durable.cleanup,
                ),
                streams: StreamAdmin::new(Arc::clone(&connection), settings.stream.clone()),
                ensure_on_connect: settings.stream.ensure_on_connect,
                connection,
            }),
        }
    }

    /// Client backed by a real NATS server.
    #[cfg(feature = "nats")]
    pub fn nats(settings: &BusSettings) -> Self {
        Self::new(Arc::new(crate::transport::nats::NatsTransport::new()), settings)
    }

    /// Connect, then ensure the events stream when configured to.
    pub async fn connect(&self) -> Result<(), BusError> {
        self.inner.connection.connect().await?;
        if self.inner.ensure_on_connect && self.inner.connection.is_connected() {
            let _ = self.inner.streams.ensure_events_stream().await?;
        }
        Ok(())
    }

    /// Drain and close the connection.
    pub async fn disconnect(&self) -> Result<(), BusError> {
        self.inner.connection.disconnect().await?;
        info!("bus client disconnected");
        Ok(())
    }

    /// Current connection state.
    pub fn status(&self) -> ConnectionState {
        self.inner.connection.status()
    }

    /// Receiver notified on connection state changes.
    pub fn watch_status(&self) -> watch::Receiver<ConnectionState> {
        self.inner.connection.watch_status()
    }

    /// Whether the connection is live.
    pub fn is_connected(&self) -> bool {
        self.inner.connection.is_connected()
    }

    /// Most recent connection error.
    pub fn last_error(&self) -> Option<String> {
        self.inner.connection.last_error()
    }

    /// See [`SubjectSubscriber::subscribe`].
    pub async fn subscribe(&self, subject: &str, handler: Handler) -> Result<Subscription, BusError> {
        self.inner.subscriber.subscribe(subject, handler).await
    }

    /// See [`DurableConsumerRegistry::fetch_latest`].
    pub async fn fetch_latest(
        &self,
        subject: &str,
        handler: Handler,
    ) -> Result<LatestSubscription, BusError> {
        self.inner.durables.fetch_latest(subject, handler).await
    }

    /// See [`Publisher::publish`].
    pub async fn publish<T: Serialize + ?Sized>(&self, subject: &str, message: &T) -> Result<(), BusError> {
        self.inner.publisher.publish(subject, message).await
    }

    /// See [`Publisher::publish_raw`].
    pub async fn publish_raw(&self, subject: &str, payload: &str) -> Result<(), BusError> {
        self.inner.publisher.publish_raw(subject, payload).await
    }

    /// Bind a subscription to reactive inputs.
    pub fn bind(
        &self,
        topic: impl Into<Input<String>>,
        handler: Handler,
        enabled: impl Into<Input<bool>>,
        kind: BindingKind,
    ) -> ReactiveBinding {
        ReactiveBinding::bind(self, topic, handler, enabled, kind)
    }

    /// The connection manager.
    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.inner.connection
    }

    /// The durable consumer registry.
    pub fn durables(&self) -> &DurableConsumerRegistry {
        &self.inner.durables
    }

    /// Events stream administration.
    pub fn streams(&self) -> &StreamAdmin {
        &self.inner.streams
    }
}
