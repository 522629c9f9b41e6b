//! Shared "latest value plus live updates" feeds over durable consumers.
//!
//! One durable consumer and one delivery loop serve every handler registered
//! for a subject. The loop caches the most recent payload so a handler that
//! joins late receives it immediately, before anything newer.
//!
//! Lock order: entry delivery lock (async), then the registry map, then the
//! entry's handler list. The map and handler locks are never held across an
//! `.await`. A handler may call [`DurableConsumerRegistry::fetch_latest`]
//! for its own subject: the task delivering already holds that feed's
//! delivery lock and does not take it again.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use metrics::counter;
use mightypie_settings::DurableCleanup;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::connection::ConnectionManager;
use crate::error::BusError;
use crate::handler::{Handler, decode, deliver, report};
use crate::metrics::BUS_DURABLE_LOOPS_TOTAL;
use crate::transport::{BusConnection, DurableConsumer, DurableSpec, LastMessage};

/// Durable consumer name for a subject.
///
/// Every character that is not ASCII alphanumeric becomes `_`, then
/// `_durable` is appended. Stable across restarts.
pub fn durable_key(subject: &str) -> String {
    let mut key: String = subject
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    key.push_str("_durable");
    key
}

type Readiness = Shared<BoxFuture<'static, Result<(), String>>>;

tokio::task_local! {
    /// Entries whose delivery lock the current task holds.
    static DELIVERING: Vec<u64>;
}

/// Run `fut` marked as holding the delivery lock of `entry_id`.
async fn delivering<F: Future>(entry_id: u64, fut: F) -> F::Output {
    let mut held = DELIVERING.try_with(Clone::clone).unwrap_or_default();
    held.push(entry_id);
    DELIVERING.scope(held, fut).await
}

fn is_delivering(entry_id: u64) -> bool {
    DELIVERING
        .try_with(|held| held.contains(&entry_id))
        .unwrap_or(false)
}

#[derive(Default)]
struct FeedState {
    handlers: Vec<(u64, Handler)>,
    latest: Option<String>,
}

/// State shared between an entry's delivery loop and its subscriptions.
struct Feed {
    subject: String,
    cancel: CancellationToken,
    /// Serializes fan-out against replay to late joiners.
    delivery: tokio::sync::Mutex<()>,
    state: Mutex<FeedState>,
}

struct Entry {
    id: u64,
    /// Connection epoch the consumer was created on.
    epoch: u64,
    ready: Readiness,
    feed: Arc<Feed>,
}

impl Entry {
    fn usable_on(&self, epoch: u64) -> bool {
        self.epoch == epoch && !self.feed.cancel.is_cancelled()
    }
}

struct RegistryShared {
    connection: Arc<ConnectionManager>,
    stream: String,
    cleanup: DurableCleanup,
    entries: Mutex<HashMap<String, Arc<Entry>>>,
    next_id: AtomicU64,
}

impl RegistryShared {
    fn remove_entry(&self, key: &str, id: u64) -> bool {
        let mut entries = self.entries.lock();
        if entries.get(key).is_some_and(|e| e.id == id) {
            let _ = entries.remove(key);
            true
        } else {
            false
        }
    }
}

/// Deduplicates durable consumers per subject.
#[derive(Clone)]
pub struct DurableConsumerRegistry {
    shared: Arc<RegistryShared>,
}

impl DurableConsumerRegistry {
    /// Registry creating consumers on `stream`.
    pub fn new(
        connection: Arc<ConnectionManager>,
        stream: impl Into<String>,
        cleanup: DurableCleanup,
    ) -> Self {
        Self {
            shared: Arc::new(RegistryShared {
                connection,
                stream: stream.into(),
                cleanup,
                entries: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Register `handler` for the latest value and live updates of `subject`.
    ///
    /// If a value is cached, the handler has already been called with it when
    /// this returns. A handler of this subject may itself call `fetch_latest`
    /// for the same subject, but only from the task that invoked it: a task it
    /// spawns and awaits would wait on the delivery lock that invocation holds.
    pub async fn fetch_latest(
        &self,
        subject: &str,
        handler: Handler,
    ) -> Result<LatestSubscription, BusError> {
        let key = durable_key(subject);
        loop {
            let Some((epoch, conn)) = self.shared.connection.live_handle() else {
                return Err(BusError::SubscribeFailed {
                    subject: subject.to_owned(),
                    reason: "not connected".into(),
                });
            };

            let entry = self.entry_for(&key, subject, epoch, &conn);
            if let Err(reason) = entry.ready.clone().await {
                let _ = self.shared.remove_entry(&key, entry.id);
                warn!(subject, key, error = %reason, "durable consumer setup failed");
                return Err(BusError::SubscribeFailed {
                    subject: subject.to_owned(),
                    reason,
                });
            }

            let _delivery = if is_delivering(entry.id) {
                None
            } else {
                Some(entry.feed.delivery.lock().await)
            };
            let handler_id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
            let current_epoch = self.shared.connection.epoch();
            let cached = {
                let entries = self.shared.entries.lock();
                let current = entries.get(&key).is_some_and(|e| e.id == entry.id);
                if !current || current_epoch.is_none_or(|e| !entry.usable_on(e)) {
                    // torn down or outlived its connection while we waited
                    continue;
                }
                let mut state = entry.feed.state.lock();
                state.handlers.push((handler_id, Arc::clone(&handler)));
                state.latest.clone()
            };
            if let Some(value) = cached {
                delivering(entry.id, deliver(&handler, subject, value, "replay")).await;
            }
            debug!(subject, key, handler_id, "latest handler registered");

            return Ok(LatestSubscription {
                registry: Arc::downgrade(&self.shared),
                key,
                entry_id: entry.id,
                handler_id,
                feed: Arc::clone(&entry.feed),
                done: AtomicBool::new(false),
            });
        }
    }

    fn entry_for(
        &self,
        key: &str,
        subject: &str,
        epoch: u64,
        conn: &Arc<dyn BusConnection>,
    ) -> Arc<Entry> {
        let mut entries = self.shared.entries.lock();
        if let Some(entry) = entries.get(key) {
            if entry.usable_on(epoch) {
                return Arc::clone(entry);
            }
            // consumer belongs to an earlier connection or its loop has ended
            entry.feed.cancel.cancel();
            debug!(subject, key, entry_id = entry.id, "stale durable entry replaced");
            let _ = entries.remove(key);
        }

        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let feed = Arc::new(Feed {
            subject: subject.to_owned(),
            cancel: CancellationToken::new(),
            delivery: tokio::sync::Mutex::new(()),
            state: Mutex::new(FeedState::default()),
        });
        let spec = DurableSpec {
            stream: self.shared.stream.clone(),
            name: key.to_owned(),
            filter_subject: subject.to_owned(),
        };
        let ready = start(
            Arc::clone(conn),
            spec,
            Arc::clone(&feed),
            Arc::downgrade(&self.shared),
            id,
        )
        .boxed()
        .shared();

        let entry = Arc::new(Entry {
            id,
            epoch,
            ready,
            feed,
        });
        let _ = entries.insert(key.to_owned(), Arc::clone(&entry));
        debug!(subject, key, entry_id = id, epoch, "durable entry created");
        entry
    }

    /// Number of live entries.
    pub fn entry_count(&self) -> usize {
        self.shared.entries.lock().len()
    }

    /// Handlers registered for `subject`.
    pub fn handler_count(&self, subject: &str) -> usize {
        self.shared
            .entries
            .lock()
            .get(&durable_key(subject))
            .map_or(0, |e| e.feed.state.lock().handlers.len())
    }

    /// Cached latest payload for `subject`.
    pub fn latest(&self, subject: &str) -> Option<String> {
        self.shared
            .entries
            .lock()
            .get(&durable_key(subject))
            .and_then(|e| e.feed.state.lock().latest.clone())
    }
}

/// Seed the cache from the stream, create or attach the durable consumer,
/// then spawn the delivery loop.
///
/// Seeding covers a durable that already exists: it resumes after its ack
/// floor and would otherwise never hand the stored value to new handlers.
async fn start(
    conn: Arc<dyn BusConnection>,
    spec: DurableSpec,
    feed: Arc<Feed>,
    registry: Weak<RegistryShared>,
    entry_id: u64,
) -> Result<(), String> {
    let floor = match conn.last_message(&spec.stream, &spec.filter_subject).await {
        Ok(Some(last)) => seed(&feed, &last),
        Ok(None) => 0,
        Err(err) => {
            warn!(subject = %feed.subject, error = %err, "stored latest value unavailable");
            0
        }
    };
    let consumer = conn
        .durable_consumer(&spec)
        .await
        .map_err(|err| err.to_string())?;
    counter!(BUS_DURABLE_LOOPS_TOTAL).increment(1);
    info!(subject = %feed.subject, durable = %spec.name, floor, "durable delivery loop started");
    let _ = tokio::spawn(run(consumer, feed, registry, spec.name, entry_id, floor));
    Ok(())
}

/// Cache the stored value. Returns its sequence.
fn seed(feed: &Feed, last: &LastMessage) -> u64 {
    match decode(&last.payload) {
        Ok(text) => feed.state.lock().latest = Some(text),
        Err(err) => report(&feed.subject, &err),
    }
    last.seq
}

/// Messages at or below `floor` are already cached; they are acked, not delivered.
async fn run(
    mut consumer: Box<dyn DurableConsumer>,
    feed: Arc<Feed>,
    registry: Weak<RegistryShared>,
    key: String,
    entry_id: u64,
    floor: u64,
) {
    let subject = feed.subject.clone();
    loop {
        let next = tokio::select! {
            biased;
            () = feed.cancel.cancelled() => {
                debug!(subject, "durable delivery loop cancelled");
                return;
            }
            next = consumer.next() => next,
        };
        let message = match next {
            Some(Ok(message)) => message,
            Some(Err(err)) => {
                warn!(subject, error = %err, "durable consumer error");
                continue;
            }
            None => break,
        };

        let _delivery = feed.delivery.lock().await;
        if feed.cancel.is_cancelled() {
            return;
        }
        if message.seq <= floor {
            debug!(subject, seq = message.seq, "already cached, skipping");
        } else {
            match decode(&message.payload) {
                Ok(text) => {
                    let handlers: Vec<Handler> = {
                        let mut state = feed.state.lock();
                        state.latest = Some(text.clone());
                        state.handlers.iter().map(|(_, h)| Arc::clone(h)).collect()
                    };
                    delivering(entry_id, async {
                        for handler in &handlers {
                            deliver(handler, &subject, text.clone(), "durable").await;
                        }
                    })
                    .await;
                }
                Err(err) => report(&subject, &err),
            }
        }
        // acked even after a decode error so a poison message is not redelivered forever
        if let Err(err) = message.ack().await {
            warn!(subject, error = %err, "ack failed");
        }
    }

    // consumer or connection gone; the next registration starts a fresh entry
    feed.cancel.cancel();
    if let Some(registry) = registry.upgrade() {
        if registry.remove_entry(&key, entry_id) {
            info!(subject, key, "durable consumer ended, entry dropped");
        }
    }
}

/// A handler's registration in a durable feed.
///
/// Call [`cleanup`](Self::cleanup) to unregister. Dropping the handle
/// unregisters as well.
pub struct LatestSubscription {
    registry: Weak<RegistryShared>,
    key: String,
    entry_id: u64,
    handler_id: u64,
    feed: Arc<Feed>,
    done: AtomicBool,
}

impl LatestSubscription {
    /// Subject this handler listens to.
    pub fn subject(&self) -> &str {
        &self.feed.subject
    }

    /// Durable consumer name.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Unregister the handler. Idempotent.
    ///
    /// When it was the last handler the delivery loop stops and the entry is
    /// removed. With [`DurableCleanup::DeleteRemote`] the server-side consumer
    /// is deleted too.
    pub async fn cleanup(&self) {
        let Some(conn) = self.detach() else { return };
        if let Err(err) = conn.delete_durable(&self.stream_name(), &self.key).await {
            warn!(key = %self.key, error = %err, "failed to delete durable consumer");
        } else {
            debug!(key = %self.key, "durable consumer deleted");
        }
    }

    fn stream_name(&self) -> String {
        self.registry
            .upgrade()
            .map(|r| r.stream.clone())
            .unwrap_or_default()
    }

    /// Remove the handler. Returns a connection when the remote durable
    /// should be deleted.
    fn detach(&self) -> Option<Arc<dyn BusConnection>> {
        if self.done.swap(true, Ordering::SeqCst) {
            return None;
        }
        let registry = self.registry.upgrade()?;
        {
            let mut entries = registry.entries.lock();
            {
                let mut state = self.feed.state.lock();
                state.handlers.retain(|(id, _)| *id != self.handler_id);
                if !state.handlers.is_empty() {
                    return None;
                }
                state.latest = None;
            }
            self.feed.cancel.cancel();
            if entries.get(&self.key).is_some_and(|e| e.id == self.entry_id) {
                let _ = entries.remove(&self.key);
            }
        }
        debug!(key = %self.key, "last handler gone, durable entry removed");

        match registry.cleanup {
            DurableCleanup::DeleteRemote => registry.connection.connection(),
            DurableCleanup::RetainRemote => None,
        }
    }
}

impl Drop for LatestSubscription {
    fn drop(&mut self) {
        let Some(conn) = self.detach() else { return };
        let stream = self.stream_name();
        let key = self.key.clone();
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let _ = runtime.spawn(async move {
                if let Err(err) = conn.delete_durable(&stream, &key).await {
                    warn!(key, error = %err, "failed to delete durable consumer");
                }
            });
        }
    }
}
