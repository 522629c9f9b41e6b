//! NATS backend built on `async-nats` and JetStream.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_nats::jetstream::{self, consumer, stream};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{
    Acker, BusConnection, ConnectParams, DurableConsumer, DurableMessage, DurableSpec,
    LastMessage, RawSubscription, StatusEvent, StreamInfo, StreamSpec, Transport,
};
use crate::error::TransportError;

/// Opens token-authenticated NATS connections.
#[derive(Clone, Debug, Default)]
pub struct NatsTransport;

impl NatsTransport {
    /// New transport.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transport for NatsTransport {
    async fn connect(&self, params: &ConnectParams) -> Result<Arc<dyn BusConnection>, TransportError> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));
        // the client reports Connected on the first connect too
        let dropped = Arc::new(AtomicBool::new(false));
        let reconnect_wait = params.reconnect_time_wait;

        let options = async_nats::ConnectOptions::with_token(params.auth_token.clone())
            .name(&params.client_name)
            .connection_timeout(params.connection_timeout)
            .max_reconnects(params.max_reconnect_attempts as usize)
            .reconnect_delay_callback(move |_attempts| reconnect_wait)
            .event_callback({
                let closed = Arc::clone(&closed);
                move |event| {
                    let tx = events_tx.clone();
                    let closed = Arc::clone(&closed);
                    let dropped = Arc::clone(&dropped);
                    async move {
                        let status = status_for(event, &dropped, &closed);
                        if let Some(status) = status {
                            let _ = tx.send(status);
                        }
                    }
                }
            });

        let client = options
            .connect(params.server_url.as_str())
            .await
            .map_err(|err| TransportError::Connect(err.to_string()))?;
        debug!(server = %params.server_url, "nats client connected");

        Ok(Arc::new(NatsConnection {
            jetstream: jetstream::new(client.clone()),
            client,
            server: params.server_url.clone(),
            events: Mutex::new(Some(events_rx)),
            closed,
        }))
    }
}

/// Translates a client event into a connection status change.
///
/// Only server and client errors move the state to `Error`. Slow consumer and
/// lame duck notices are logged, and draining is the prelude to our own close.
fn status_for(
    event: async_nats::Event,
    dropped: &AtomicBool,
    closed: &AtomicBool,
) -> Option<StatusEvent> {
    match event {
        async_nats::Event::Disconnected => {
            dropped.store(true, Ordering::SeqCst);
            Some(StatusEvent::Disconnect)
        }
        async_nats::Event::Connected => dropped
            .swap(false, Ordering::SeqCst)
            .then_some(StatusEvent::Reconnect),
        async_nats::Event::Closed => {
            closed.store(true, Ordering::SeqCst);
            Some(StatusEvent::Closed)
        }
        async_nats::Event::ServerError(err) => Some(StatusEvent::Error(err.to_string())),
        async_nats::Event::ClientError(err) => Some(StatusEvent::Error(err.to_string())),
        async_nats::Event::Draining => None,
        other => {
            warn!(event = %other, "nats connection notice");
            None
        }
    }
}

struct NatsConnection {
    client: async_nats::Client,
    jetstream: jetstream::Context,
    server: String,
    events: Mutex<Option<mpsc::UnboundedReceiver<StatusEvent>>>,
    closed: Arc<AtomicBool>,
}

impl NatsConnection {
    async fn stream(&self, name: &str) -> Result<stream::Stream, TransportError> {
        self.jetstream
            .get_stream(name)
            .await
            .map_err(|err| TransportError::Stream(err.to_string()))
    }
}

fn info_from(info: &stream::Info) -> StreamInfo {
    StreamInfo {
        name: info.config.name.clone(),
        subjects: info.config.subjects.clone(),
        messages: info.state.messages,
        first_seq: info.state.first_sequence,
        last_seq: info.state.last_sequence,
        bytes: info.state.bytes,
    }
}

#[async_trait]
impl BusConnection for NatsConnection {
    fn server(&self) -> String {
        self.server.clone()
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn status_events(&self) -> Option<mpsc::UnboundedReceiver<StatusEvent>> {
        self.events.lock().take()
    }

    async fn subscribe(&self, subject: &str) -> Result<Box<dyn RawSubscription>, TransportError> {
        let inner = self
            .client
            .subscribe(subject.to_owned())
            .await
            .map_err(|err| TransportError::Subscribe(err.to_string()))?;
        Ok(Box::new(NatsSubscription { inner }))
    }

    async fn publish(&self, subject: &str, payload: Bytes) -> Result<(), TransportError> {
        self.client
            .publish(subject.to_owned(), payload)
            .await
            .map_err(|err| TransportError::Publish(err.to_string()))
    }

    async fn durable_consumer(
        &self,
        spec: &DurableSpec,
    ) -> Result<Box<dyn DurableConsumer>, TransportError> {
        let stream = self
            .stream(&spec.stream)
            .await
            .map_err(|err| TransportError::Consumer(err.to_string()))?;
        let config = consumer::pull::Config {
            durable_name: Some(spec.name.clone()),
            filter_subject: spec.filter_subject.clone(),
            deliver_policy: consumer::DeliverPolicy::LastPerSubject,
            ack_policy: consumer::AckPolicy::Explicit,
            ..Default::default()
        };
        let consumer = stream
            .get_or_create_consumer(&spec.name, config)
            .await
            .map_err(|err| TransportError::Consumer(err.to_string()))?;
        let messages = consumer
            .messages()
            .await
            .map_err(|err| TransportError::Consumer(err.to_string()))?;
        Ok(Box::new(NatsConsumer {
            messages,
            closed: Arc::clone(&self.closed),
        }))
    }

    async fn last_message(
        &self,
        stream: &str,
        subject: &str,
    ) -> Result<Option<LastMessage>, TransportError> {
        let stream = self.stream(stream).await?;
        match stream.get_last_raw_message_by_subject(subject).await {
            Ok(message) => Ok(Some(LastMessage {
                seq: message.sequence,
                payload: message.payload,
            })),
            Err(err) if err.kind() == stream::LastRawMessageErrorKind::NoMessageFound => Ok(None),
            Err(err) => Err(TransportError::Stream(err.to_string())),
        }
    }

    async fn delete_durable(&self, stream: &str, name: &str) -> Result<(), TransportError> {
        let stream = self.stream(stream).await?;
        let _ = stream
            .delete_consumer(name)
            .await
            .map_err(|err| TransportError::Consumer(err.to_string()))?;
        Ok(())
    }

    async fn ensure_stream(&self, spec: &StreamSpec) -> Result<StreamInfo, TransportError> {
        let config = stream::Config {
            name: spec.name.clone(),
            subjects: spec.subjects.clone(),
            max_messages: spec.max_messages,
            max_messages_per_subject: spec.max_messages_per_subject,
            storage: stream::StorageType::File,
            ..Default::default()
        };
        if self.jetstream.get_stream(&spec.name).await.is_ok() {
            let info = self
                .jetstream
                .update_stream(&config)
                .await
                .map_err(|err| TransportError::Stream(err.to_string()))?;
            return Ok(info_from(&info));
        }
        let mut created = self
            .jetstream
            .create_stream(config)
            .await
            .map_err(|err| TransportError::Stream(err.to_string()))?;
        let info = created
            .info()
            .await
            .map_err(|err| TransportError::Stream(err.to_string()))?;
        Ok(info_from(info))
    }

    async fn stream_info(&self, stream: &str) -> Result<StreamInfo, TransportError> {
        let mut stream = self.stream(stream).await?;
        let info = stream
            .info()
            .await
            .map_err(|err| TransportError::Stream(err.to_string()))?;
        Ok(info_from(info))
    }

    async fn purge_stream(&self, stream: &str) -> Result<(), TransportError> {
        let stream = self.stream(stream).await?;
        let _ = stream
            .purge()
            .await
            .map_err(|err| TransportError::Stream(err.to_string()))?;
        Ok(())
    }

    async fn drain(&self) -> Result<(), TransportError> {
        let result = self
            .client
            .drain()
            .await
            .map_err(|err| TransportError::Drain(err.to_string()));
        self.closed.store(true, Ordering::SeqCst);
        result
    }
}

struct NatsSubscription {
    inner: async_nats::Subscriber,
}

#[async_trait]
impl RawSubscription for NatsSubscription {
    async fn next(&mut self) -> Option<Bytes> {
        self.inner.next().await.map(|message| message.payload)
    }

    async fn unsubscribe(mut self: Box<Self>) {
        if let Err(err) = self.inner.unsubscribe().await {
            debug!(error = %err, "unsubscribe failed");
        }
    }
}

struct NatsConsumer {
    messages: consumer::pull::Stream,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl DurableConsumer for NatsConsumer {
    async fn next(&mut self) -> Option<Result<DurableMessage, TransportError>> {
        if self.closed.load(Ordering::SeqCst) {
            return None;
        }
        let message = match self.messages.next().await? {
            Ok(message) => message,
            Err(err) => return Some(Err(TransportError::Consumer(err.to_string()))),
        };
        let seq = match message.info() {
            Ok(info) => info.stream_sequence,
            Err(err) => return Some(Err(TransportError::Consumer(err.to_string()))),
        };
        Some(Ok(DurableMessage::new(
            message.subject.to_string(),
            seq,
            message.payload.clone(),
            Box::new(NatsAcker { message }),
        )))
    }
}

struct NatsAcker {
    message: jetstream::Message,
}

#[async_trait]
impl Acker for NatsAcker {
    async fn ack(self: Box<Self>) -> Result<(), TransportError> {
        self.message
            .ack()
            .await
            .map_err(|err| TransportError::Consumer(err.to_string()))
    }
}
