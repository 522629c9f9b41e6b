//! Plain subject subscriptions with contained per-message failures.

use std::sync::Arc;

use metrics::counter;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::connection::ConnectionManager;
use crate::error::BusError;
use crate::handler::{Handler, decode, deliver, report};
use crate::metrics::BUS_SUBSCRIPTIONS_TOTAL;
use crate::transport::RawSubscription;

/// Subscribes handlers to subjects on the managed connection.
#[derive(Clone)]
pub struct SubjectSubscriber {
    connection: Arc<ConnectionManager>,
}

impl SubjectSubscriber {
    /// Subscriber bound to a connection manager.
    pub fn new(connection: Arc<ConnectionManager>) -> Self {
        Self { connection }
    }

    /// Subscribe `handler` to `subject`.
    ///
    /// Without a live connection this returns an inert [`Subscription`].
    /// Messages are handled one at a time in arrival order.
    pub async fn subscribe(&self, subject: &str, handler: Handler) -> Result<Subscription, BusError> {
        let Some(conn) = self.connection.live_connection() else {
            debug!(subject, "not connected, subscription is inert");
            return Ok(Subscription::noop());
        };

        let raw = conn.subscribe(subject).await.map_err(|err| {
            warn!(subject, error = %err, "subscribe failed");
            BusError::SubscribeFailed {
                subject: subject.to_owned(),
                reason: err.to_string(),
            }
        })?;
        counter!(BUS_SUBSCRIPTIONS_TOTAL).increment(1);
        debug!(subject, "subscribed");

        let cancel = CancellationToken::new();
        let task = tokio::spawn(pump(subject.to_owned(), raw, handler, cancel.clone()));
        Ok(Subscription {
            subject: Some(subject.to_owned()),
            cancel: Some(cancel),
            task: Some(task),
        })
    }
}

async fn pump(
    subject: String,
    mut raw: Box<dyn RawSubscription>,
    handler: Handler,
    cancel: CancellationToken,
) {
    loop {
        let payload = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            payload = raw.next() => payload,
        };
        let Some(payload) = payload else {
            debug!(subject, "subscription ended by transport");
            break;
        };
        match decode(&payload) {
            Ok(text) => deliver(&handler, &subject, text, "subject").await,
            Err(err) => report(&subject, &err),
        }
    }
    raw.unsubscribe().await;
    debug!(subject, "unsubscribed");
}

/// Handle to a subject subscription.
///
/// Dropping the handle unsubscribes.
#[derive(Debug, Default)]
pub struct Subscription {
    subject: Option<String>,
    cancel: Option<CancellationToken>,
    task: Option<JoinHandle<()>>,
}

impl Subscription {
    /// A subscription that receives nothing.
    pub fn noop() -> Self {
        Self::default()
    }

    /// Whether this is an inert subscription.
    pub fn is_noop(&self) -> bool {
        self.cancel.is_none()
    }

    /// Subscribed subject, if any.
    pub fn subject(&self) -> Option<&str> {
        self.subject.as_deref()
    }

    /// Whether messages are still being delivered.
    pub fn is_active(&self) -> bool {
        self.cancel.as_ref().is_some_and(|c| !c.is_cancelled())
            && self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Stop delivery. Idempotent; never fails.
    pub fn unsubscribe(&self) {
        if let Some(cancel) = &self.cancel {
            cancel.cancel();
        }
    }

    /// Stop delivery and wait until the transport subscription is released.
    pub async fn close(mut self) {
        self.unsubscribe();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}
