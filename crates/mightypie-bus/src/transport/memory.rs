//! In-process bus implementing the transport seam.
//!
//! Supports NATS-style subjects (`*` matches one token, `>` the rest), a
//! persisted stream that keeps the last message(s) per subject, and durable
//! consumers whose position survives detaching. Test controls let callers
//! make the server unreachable, fail the next N connects, delay connects,
//! inject status events and close every connection.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tracing::debug;

use super::{
    Acker, BusConnection, ConnectParams, DurableConsumer, DurableMessage, DurableSpec,
    LastMessage, RawSubscription, StatusEvent, StreamInfo, StreamSpec, Transport,
};
use crate::error::TransportError;

// ─────────────────────────────────────────────────────────────────────────────
// Subjects
// ─────────────────────────────────────────────────────────────────────────────

/// Whether `subject` matches `pattern`.
///
/// `*` matches exactly one token, `>` matches one or more trailing tokens.
pub fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut pattern_tokens = pattern.split('.');
    let mut subject_tokens = subject.split('.');
    loop {
        match (pattern_tokens.next(), subject_tokens.next()) {
            (Some(">"), Some(_)) => return true,
            (Some("*"), Some(_)) => {}
            (Some(p), Some(s)) if p == s => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Check subject syntax. Wildcards are only valid for subscriptions.
pub fn validate_subject(subject: &str, allow_wildcards: bool) -> Result<(), String> {
    if subject.is_empty() {
        return Err("subject is empty".into());
    }
    if subject.chars().any(char::is_whitespace) {
        return Err(format!("subject '{subject}' contains whitespace"));
    }
    let tokens: Vec<&str> = subject.split('.').collect();
    let last = tokens.len() - 1;
    for (i, token) in tokens.iter().enumerate() {
        match *token {
            "" => return Err(format!("subject '{subject}' has an empty token")),
            "*" | ">" if !allow_wildcards => {
                return Err(format!("wildcards are not allowed in '{subject}'"));
            }
            ">" if i != last => {
                return Err(format!("'>' must be the last token in '{subject}'"));
            }
            _ => {}
        }
    }
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Shared bus state
// ─────────────────────────────────────────────────────────────────────────────

struct StoredMessage {
    subject: String,
    payload: Bytes,
}

struct MemStream {
    spec: StreamSpec,
    messages: BTreeMap<u64, StoredMessage>,
    last_seq: u64,
    /// Durable name -> highest acked sequence.
    consumers: HashMap<String, u64>,
}

impl MemStream {
    fn new(spec: StreamSpec) -> Self {
        Self {
            spec,
            messages: BTreeMap::new(),
            last_seq: 0,
            consumers: HashMap::new(),
        }
    }

    fn captures(&self, subject: &str) -> bool {
        self.spec
            .subjects
            .iter()
            .any(|pattern| subject_matches(pattern, subject))
    }

    fn append(&mut self, subject: &str, payload: Bytes) {
        self.last_seq += 1;
        let _ = self.messages.insert(
            self.last_seq,
            StoredMessage {
                subject: subject.to_owned(),
                payload,
            },
        );
        self.enforce_limits();
    }

    fn enforce_limits(&mut self) {
        if self.spec.max_messages_per_subject > 0 {
            let limit = self.spec.max_messages_per_subject as usize;
            let mut seen: HashMap<&str, usize> = HashMap::new();
            let mut expired = Vec::new();
            for (seq, message) in self.messages.iter().rev() {
                let count = seen.entry(message.subject.as_str()).or_insert(0);
                *count += 1;
                if *count > limit {
                    expired.push(*seq);
                }
            }
            for seq in expired {
                let _ = self.messages.remove(&seq);
            }
        }
        if self.spec.max_messages > 0 {
            while self.messages.len() > self.spec.max_messages as usize {
                let _ = self.messages.pop_first();
            }
        }
    }

    /// Sequences of the newest message on each subject matching `filter`.
    fn last_per_subject(&self, filter: &str) -> VecDeque<u64> {
        let mut seen = HashSet::new();
        let mut seqs: Vec<u64> = self
            .messages
            .iter()
            .rev()
            .filter(|(_, m)| subject_matches(filter, &m.subject))
            .filter(|(_, m)| seen.insert(m.subject.clone()))
            .map(|(seq, _)| *seq)
            .collect();
        seqs.sort_unstable();
        seqs.into()
    }

    fn info(&self) -> StreamInfo {
        StreamInfo {
            name: self.spec.name.clone(),
            subjects: self.spec.subjects.clone(),
            messages: self.messages.len() as u64,
            first_seq: self
                .messages
                .first_key_value()
                .map_or(self.last_seq + 1, |(seq, _)| *seq),
            last_seq: self.last_seq,
            bytes: self.messages.values().map(|m| m.payload.len() as u64).sum(),
        }
    }
}

struct SubscriberSlot {
    conn_id: u64,
    pattern: String,
    tx: mpsc::UnboundedSender<Bytes>,
}

struct ConnShared {
    id: u64,
    closed: AtomicBool,
    events: Mutex<Option<mpsc::UnboundedSender<StatusEvent>>>,
}

#[derive(Default)]
struct Core {
    next_id: u64,
    connections: HashMap<u64, Arc<ConnShared>>,
    subscribers: HashMap<u64, SubscriberSlot>,
    streams: HashMap<String, MemStream>,
    published: Vec<(String, Bytes)>,
}

impl Core {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn route(&mut self, subject: &str, payload: &Bytes) {
        for slot in self.subscribers.values() {
            if subject_matches(&slot.pattern, subject) {
                let _ = slot.tx.send(payload.clone());
            }
        }
        for stream in self.streams.values_mut() {
            if stream.captures(subject) {
                stream.append(subject, payload.clone());
            }
        }
    }
}

struct BusState {
    core: Mutex<Core>,
    /// Bumped whenever stored messages, consumers or connections change.
    changes: watch::Sender<u64>,
    reachable: AtomicBool,
    failing_connects: AtomicU32,
    connect_attempts: AtomicU32,
    connect_delay: Mutex<Duration>,
    subscribe_delay: Mutex<Duration>,
    fail_drain: AtomicBool,
    fail_subscribes: AtomicBool,
    fail_consumers: AtomicBool,
    durables_created: AtomicU32,
}

impl BusState {
    fn bump(&self) {
        self.changes.send_modify(|v| *v = v.wrapping_add(1));
    }

    fn close(&self, conn: &ConnShared) {
        conn.closed.store(true, Ordering::SeqCst);
        let events = conn.events.lock().take();
        if let Some(tx) = events {
            let _ = tx.send(StatusEvent::Closed);
        }
        {
            let mut core = self.core.lock();
            let _ = core.connections.remove(&conn.id);
            core.subscribers.retain(|_, slot| slot.conn_id != conn.id);
        }
        self.bump();
    }

    fn ensure_stream(&self, spec: &StreamSpec) -> StreamInfo {
        let info = {
            let mut core = self.core.lock();
            let stream = core
                .streams
                .entry(spec.name.clone())
                .or_insert_with(|| MemStream::new(spec.clone()));
            stream.spec = spec.clone();
            stream.enforce_limits();
            stream.info()
        };
        self.bump();
        info
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// MemoryBus
// ─────────────────────────────────────────────────────────────────────────────

/// In-process bus. Cloning shares the same bus.
#[derive(Clone)]
pub struct MemoryBus {
    state: Arc<BusState>,
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBus {
    /// An empty, reachable bus.
    pub fn new() -> Self {
        Self {
            state: Arc::new(BusState {
                core: Mutex::new(Core::default()),
                changes: watch::channel(0).0,
                reachable: AtomicBool::new(true),
                failing_connects: AtomicU32::new(0),
                connect_attempts: AtomicU32::new(0),
                connect_delay: Mutex::new(Duration::ZERO),
                subscribe_delay: Mutex::new(Duration::ZERO),
                fail_drain: AtomicBool::new(false),
                fail_subscribes: AtomicBool::new(false),
                fail_consumers: AtomicBool::new(false),
                durables_created: AtomicU32::new(0),
            }),
        }
    }

    /// Refuse every connect while `false`.
    pub fn set_reachable(&self, reachable: bool) {
        self.state.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Refuse the next `n` connects.
    pub fn fail_next_connects(&self, n: u32) {
        self.state.failing_connects.store(n, Ordering::SeqCst);
    }

    /// Make every connect attempt take `delay` before answering.
    pub fn set_connect_delay(&self, delay: Duration) {
        *self.state.connect_delay.lock() = delay;
    }

    /// Delay every subscribe and consumer setup by `delay`.
    pub fn set_subscribe_delay(&self, delay: Duration) {
        *self.state.subscribe_delay.lock() = delay;
    }

    /// Connect attempts seen so far.
    pub fn connect_attempts(&self) -> u32 {
        self.state.connect_attempts.load(Ordering::SeqCst)
    }

    /// Make `drain` fail while `true`.
    pub fn set_fail_drain(&self, fail: bool) {
        self.state.fail_drain.store(fail, Ordering::SeqCst);
    }

    /// Reject subscriptions while `true`.
    pub fn set_fail_subscribes(&self, fail: bool) {
        self.state.fail_subscribes.store(fail, Ordering::SeqCst);
    }

    /// Reject durable consumer creation while `true`.
    pub fn set_fail_consumers(&self, fail: bool) {
        self.state.fail_consumers.store(fail, Ordering::SeqCst);
    }

    /// Deliver a status event to every open connection.
    pub fn emit(&self, event: &StatusEvent) {
        let connections: Vec<Arc<ConnShared>> =
            self.state.core.lock().connections.values().cloned().collect();
        for conn in connections {
            if let Some(tx) = conn.events.lock().as_ref() {
                let _ = tx.send(event.clone());
            }
        }
    }

    /// Close every open connection from the server side.
    pub fn close_connections(&self) {
        let connections: Vec<Arc<ConnShared>> =
            self.state.core.lock().connections.values().cloned().collect();
        for conn in connections {
            self.state.close(&conn);
        }
    }

    /// Number of open connections.
    pub fn open_connections(&self) -> usize {
        self.state.core.lock().connections.len()
    }

    /// Create or update a stream without going through a connection.
    pub fn ensure_stream(&self, spec: &StreamSpec) -> StreamInfo {
        self.state.ensure_stream(spec)
    }

    /// Publish as another client would.
    pub fn inject(&self, subject: &str, payload: impl Into<Bytes>) {
        let payload = payload.into();
        self.state.core.lock().route(subject, &payload);
        self.state.bump();
    }

    /// Messages published through connections, oldest first.
    pub fn published(&self) -> Vec<(String, String)> {
        self.state
            .core
            .lock()
            .published
            .iter()
            .map(|(subject, payload)| {
                (subject.clone(), String::from_utf8_lossy(payload).into_owned())
            })
            .collect()
    }

    /// Live plain subscriptions.
    pub fn active_subscriptions(&self) -> usize {
        self.state.core.lock().subscribers.len()
    }

    /// Durable consumers created (not re-attached) so far.
    pub fn durables_created(&self) -> u32 {
        self.state.durables_created.load(Ordering::SeqCst)
    }

    /// Whether a durable consumer exists on the stream.
    pub fn durable_exists(&self, stream: &str, name: &str) -> bool {
        self.state
            .core
            .lock()
            .streams
            .get(stream)
            .is_some_and(|s| s.consumers.contains_key(name))
    }

    /// Highest acked sequence of a durable consumer.
    pub fn ack_floor(&self, stream: &str, name: &str) -> Option<u64> {
        self.state
            .core
            .lock()
            .streams
            .get(stream)
            .and_then(|s| s.consumers.get(name).copied())
    }
}

#[async_trait]
impl Transport for MemoryBus {
    async fn connect(&self, params: &ConnectParams) -> Result<Arc<dyn BusConnection>, TransportError> {
        let _ = self.state.connect_attempts.fetch_add(1, Ordering::SeqCst);
        let delay = *self.state.connect_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if !self.state.reachable.load(Ordering::SeqCst) {
            return Err(TransportError::Connect(format!(
                "could not reach {}",
                params.server_url
            )));
        }
        let refused = self
            .state
            .failing_connects
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(TransportError::Connect("connection refused".into()));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let shared = {
            let mut core = self.state.core.lock();
            let shared = Arc::new(ConnShared {
                id: core.next_id(),
                closed: AtomicBool::new(false),
                events: Mutex::new(Some(tx)),
            });
            let _ = core.connections.insert(shared.id, Arc::clone(&shared));
            shared
        };
        debug!(conn_id = shared.id, server = %params.server_url, "memory bus connection opened");

        Ok(Arc::new(MemoryConnection {
            state: Arc::clone(&self.state),
            shared,
            server: params.server_url.clone(),
            events: Mutex::new(Some(rx)),
        }))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Connection
// ─────────────────────────────────────────────────────────────────────────────

struct MemoryConnection {
    state: Arc<BusState>,
    shared: Arc<ConnShared>,
    server: String,
    events: Mutex<Option<mpsc::UnboundedReceiver<StatusEvent>>>,
}

impl MemoryConnection {
    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.shared.closed.load(Ordering::SeqCst) {
            Err(TransportError::Closed)
        } else {
            Ok(())
        }
    }

    async fn setup_delay(&self) {
        let delay = *self.state.subscribe_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }

    fn attach(&self, spec: &DurableSpec) -> Result<MemoryConsumer, TransportError> {
        let mut core = self.state.core.lock();
        let stream = core.streams.get_mut(&spec.stream).ok_or_else(|| {
            TransportError::Consumer(format!("stream '{}' not found", spec.stream))
        })?;
        let (pending, cursor) = if let Some(ack_floor) = stream.consumers.get(&spec.name) {
            (VecDeque::new(), *ack_floor)
        } else {
            let _ = stream.consumers.insert(spec.name.clone(), 0);
            let _ = self.state.durables_created.fetch_add(1, Ordering::SeqCst);
            (stream.last_per_subject(&spec.filter_subject), stream.last_seq)
        };
        Ok(MemoryConsumer {
            state: Arc::clone(&self.state),
            conn: Arc::clone(&self.shared),
            stream: spec.stream.clone(),
            name: spec.name.clone(),
            filter: spec.filter_subject.clone(),
            pending,
            cursor,
            changes: self.state.changes.subscribe(),
        })
    }
}

#[async_trait]
impl BusConnection for MemoryConnection {
    fn server(&self) -> String {
        self.server.clone()
    }

    fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    fn status_events(&self) -> Option<mpsc::UnboundedReceiver<StatusEvent>> {
        self.events.lock().take()
    }

    async fn subscribe(&self, subject: &str) -> Result<Box<dyn RawSubscription>, TransportError> {
        self.setup_delay().await;
        self.ensure_open()?;
        if self.state.fail_subscribes.load(Ordering::SeqCst) {
            return Err(TransportError::Subscribe(format!(
                "permissions violation for subscription to '{subject}'"
            )));
        }
        validate_subject(subject, true).map_err(TransportError::Subscribe)?;

        let (tx, rx) = mpsc::unbounded_channel();
        let id = {
            let mut core = self.state.core.lock();
            let id = core.next_id();
            let _ = core.subscribers.insert(
                id,
                SubscriberSlot {
                    conn_id: self.shared.id,
                    pattern: subject.to_owned(),
                    tx,
                },
            );
            id
        };
        Ok(Box::new(MemorySubscription {
            id,
            state: Arc::clone(&self.state),
            rx,
        }))
    }

    async fn publish(&self, subject: &str, payload: Bytes) -> Result<(), TransportError> {
        self.ensure_open()?;
        validate_subject(subject, false).map_err(TransportError::Publish)?;
        {
            let mut core = self.state.core.lock();
            core.published.push((subject.to_owned(), payload.clone()));
            core.route(subject, &payload);
        }
        self.state.bump();
        Ok(())
    }

    async fn durable_consumer(
        &self,
        spec: &DurableSpec,
    ) -> Result<Box<dyn DurableConsumer>, TransportError> {
        self.setup_delay().await;
        self.ensure_open()?;
        if self.state.fail_consumers.load(Ordering::SeqCst) {
            return Err(TransportError::Consumer(format!(
                "consumer '{}' rejected",
                spec.name
            )));
        }
        validate_subject(&spec.filter_subject, true).map_err(TransportError::Consumer)?;
        let consumer = self.attach(spec)?;
        Ok(Box::new(consumer))
    }

    async fn last_message(
        &self,
        stream: &str,
        subject: &str,
    ) -> Result<Option<LastMessage>, TransportError> {
        self.ensure_open()?;
        let core = self.state.core.lock();
        let stream = core
            .streams
            .get(stream)
            .ok_or_else(|| TransportError::Stream(format!("stream '{stream}' not found")))?;
        Ok(stream
            .messages
            .iter()
            .rev()
            .find(|(_, m)| subject_matches(subject, &m.subject))
            .map(|(seq, m)| LastMessage {
                seq: *seq,
                payload: m.payload.clone(),
            }))
    }

    async fn delete_durable(&self, stream: &str, name: &str) -> Result<(), TransportError> {
        self.ensure_open()?;
        let removed = self
            .state
            .core
            .lock()
            .streams
            .get_mut(stream)
            .and_then(|s| s.consumers.remove(name));
        self.state.bump();
        match removed {
            Some(_) => Ok(()),
            None => Err(TransportError::Consumer(format!(
                "consumer '{name}' not found on '{stream}'"
            ))),
        }
    }

    async fn ensure_stream(&self, spec: &StreamSpec) -> Result<StreamInfo, TransportError> {
        self.ensure_open()?;
        Ok(self.state.ensure_stream(spec))
    }

    async fn stream_info(&self, stream: &str) -> Result<StreamInfo, TransportError> {
        self.ensure_open()?;
        self.state
            .core
            .lock()
            .streams
            .get(stream)
            .map(MemStream::info)
            .ok_or_else(|| TransportError::Stream(format!("stream '{stream}' not found")))
    }

    async fn purge_stream(&self, stream: &str) -> Result<(), TransportError> {
        self.ensure_open()?;
        let purged = match self.state.core.lock().streams.get_mut(stream) {
            Some(s) => {
                s.messages.clear();
                true
            }
            None => false,
        };
        if purged {
            self.state.bump();
            Ok(())
        } else {
            Err(TransportError::Stream(format!("stream '{stream}' not found")))
        }
    }

    async fn drain(&self) -> Result<(), TransportError> {
        if self.state.fail_drain.load(Ordering::SeqCst) {
            return Err(TransportError::Drain("drain timed out".into()));
        }
        self.state.close(&self.shared);
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Subscriptions and consumers
// ─────────────────────────────────────────────────────────────────────────────

struct MemorySubscription {
    id: u64,
    state: Arc<BusState>,
    rx: mpsc::UnboundedReceiver<Bytes>,
}

impl Drop for MemorySubscription {
    fn drop(&mut self) {
        let _ = self.state.core.lock().subscribers.remove(&self.id);
    }
}

#[async_trait]
impl RawSubscription for MemorySubscription {
    async fn next(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }

    async fn unsubscribe(self: Box<Self>) {
        drop(self);
    }
}

enum Step {
    Found(DurableMessage),
    Empty,
    Ended,
}

struct MemoryConsumer {
    state: Arc<BusState>,
    conn: Arc<ConnShared>,
    stream: String,
    name: String,
    filter: String,
    /// Initial last-per-subject messages, delivered before anything newer.
    pending: VecDeque<u64>,
    cursor: u64,
    changes: watch::Receiver<u64>,
}

impl MemoryConsumer {
    fn message(&self, seq: u64, stored: &StoredMessage) -> DurableMessage {
        DurableMessage::new(
            stored.subject.clone(),
            seq,
            stored.payload.clone(),
            Box::new(MemoryAcker {
                state: Arc::clone(&self.state),
                stream: self.stream.clone(),
                name: self.name.clone(),
                seq,
            }),
        )
    }

    fn poll(&mut self) -> Step {
        let core = self.state.core.lock();
        let Some(stream) = core.streams.get(&self.stream) else {
            return Step::Ended;
        };
        if !stream.consumers.contains_key(&self.name) {
            return Step::Ended;
        }
        while let Some(seq) = self.pending.pop_front() {
            if let Some(stored) = stream.messages.get(&seq) {
                return Step::Found(self.message(seq, stored));
            }
        }
        let next = stream
            .messages
            .range(self.cursor + 1..)
            .find(|(_, m)| subject_matches(&self.filter, &m.subject));
        match next {
            Some((&seq, stored)) => {
                self.cursor = seq;
                Step::Found(self.message(seq, stored))
            }
            None => Step::Empty,
        }
    }
}

#[async_trait]
impl DurableConsumer for MemoryConsumer {
    async fn next(&mut self) -> Option<Result<DurableMessage, TransportError>> {
        loop {
            let _ = self.changes.borrow_and_update();
            if self.conn.closed.load(Ordering::SeqCst) {
                return None;
            }
            match self.poll() {
                Step::Found(message) => return Some(Ok(message)),
                Step::Ended => return None,
                Step::Empty => {}
            }
            if self.changes.changed().await.is_err() {
                return None;
            }
        }
    }
}

struct MemoryAcker {
    state: Arc<BusState>,
    stream: String,
    name: String,
    seq: u64,
}

#[async_trait]
impl Acker for MemoryAcker {
    async fn ack(self: Box<Self>) -> Result<(), TransportError> {
        let mut core = self.state.core.lock();
        let floor = core
            .streams
            .get_mut(&self.stream)
            .and_then(|s| s.consumers.get_mut(&self.name))
            .ok_or_else(|| TransportError::Consumer(format!("consumer '{}' not found", self.name)))?;
        *floor = (*floor).max(self.seq);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn params() -> ConnectParams {
        ConnectParams::new("mem://bus", "token")
    }

    fn events_stream() -> StreamSpec {
        StreamSpec {
            name: "EVENTS".into(),
            subjects: vec!["app.>".into()],
            max_messages: 50,
            max_messages_per_subject: 1,
        }
    }

    fn durable(name: &str, filter: &str) -> DurableSpec {
        DurableSpec {
            stream: "EVENTS".into(),
            name: name.into(),
            filter_subject: filter.into(),
        }
    }

    async fn next_payload(consumer: &mut Box<dyn DurableConsumer>) -> String {
        let message = consumer.next().await.unwrap().unwrap();
        let text = String::from_utf8(message.payload.to_vec()).unwrap();
        message.ack().await.unwrap();
        text
    }

    #[test]
    fn wildcard_matching() {
        assert!(subject_matches("a.b.c", "a.b.c"));
        assert!(subject_matches("a.*.c", "a.x.c"));
        assert!(subject_matches("a.>", "a.b"));
        assert!(subject_matches("a.>", "a.b.c.d"));
        assert!(!subject_matches("a.>", "a"));
        assert!(!subject_matches("a.*", "a.b.c"));
        assert!(!subject_matches("a.b", "a.b.c"));
        assert!(!subject_matches("a.b.c", "a.b"));
    }

    #[test]
    fn subject_validation() {
        assert!(validate_subject("mightyPie.events.open", false).is_ok());
        assert!(validate_subject("a.*.>", true).is_ok());
        assert!(validate_subject("", true).is_err());
        assert!(validate_subject("a b", true).is_err());
        assert!(validate_subject("a..b", true).is_err());
        assert!(validate_subject("a.>.b", true).is_err());
        assert!(validate_subject("a.*", false).is_err());
    }

    #[tokio::test]
    async fn publish_reaches_matching_subscribers() {
        let bus = MemoryBus::new();
        let conn = bus.connect(&params()).await.unwrap();
        let mut exact = conn.subscribe("app.window.open").await.unwrap();
        let mut wild = conn.subscribe("app.*.open").await.unwrap();
        let mut other = conn.subscribe("app.menu").await.unwrap();

        conn.publish("app.window.open", Bytes::from_static(b"hi"))
            .await
            .unwrap();

        assert_eq!(exact.next().await.unwrap(), Bytes::from_static(b"hi"));
        assert_eq!(wild.next().await.unwrap(), Bytes::from_static(b"hi"));
        let nothing = tokio::time::timeout(Duration::from_millis(20), other.next()).await;
        assert!(nothing.is_err());
        assert_eq!(bus.published(), vec![("app.window.open".to_string(), "hi".to_string())]);
    }

    #[tokio::test]
    async fn unsubscribe_removes_slot() {
        let bus = MemoryBus::new();
        let conn = bus.connect(&params()).await.unwrap();
        let sub = conn.subscribe("a.b").await.unwrap();
        assert_eq!(bus.active_subscriptions(), 1);
        sub.unsubscribe().await;
        assert_eq!(bus.active_subscriptions(), 0);
    }

    #[tokio::test]
    async fn unreachable_and_refused_connects() {
        let bus = MemoryBus::new();
        bus.set_reachable(false);
        assert_matches!(bus.connect(&params()).await, Err(TransportError::Connect(_)));
        bus.set_reachable(true);
        bus.fail_next_connects(2);
        assert!(bus.connect(&params()).await.is_err());
        assert!(bus.connect(&params()).await.is_err());
        assert!(bus.connect(&params()).await.is_ok());
        assert_eq!(bus.connect_attempts(), 4);
    }

    #[tokio::test]
    async fn closing_ends_subscriptions_and_events() {
        let bus = MemoryBus::new();
        let conn = bus.connect(&params()).await.unwrap();
        let mut events = conn.status_events().unwrap();
        assert!(conn.status_events().is_none());
        let mut sub = conn.subscribe("a.b").await.unwrap();

        bus.emit(&StatusEvent::Disconnect);
        bus.close_connections();

        assert_eq!(events.recv().await, Some(StatusEvent::Disconnect));
        assert_eq!(events.recv().await, Some(StatusEvent::Closed));
        assert_eq!(events.recv().await, None);
        assert!(sub.next().await.is_none());
        assert!(conn.is_closed());
        assert_matches!(
            conn.publish("a.b", Bytes::new()).await,
            Err(TransportError::Closed)
        );
    }

    #[tokio::test]
    async fn stream_keeps_last_message_per_subject() {
        let bus = MemoryBus::new();
        let _ = bus.ensure_stream(&events_stream());
        bus.inject("app.buttons", "v1");
        bus.inject("app.buttons", "v2");
        bus.inject("app.menu", "m1");
        bus.inject("other.subject", "ignored");

        let conn = bus.connect(&params()).await.unwrap();
        let info = conn.stream_info("EVENTS").await.unwrap();
        assert_eq!(info.messages, 2);
        assert_eq!(info.last_seq, 3);
        assert_eq!(info.first_seq, 2);
        assert_eq!(info.bytes, 4);

        conn.purge_stream("EVENTS").await.unwrap();
        let info = conn.stream_info("EVENTS").await.unwrap();
        assert_eq!(info.messages, 0);
        assert_eq!(info.first_seq, 4);
    }

    #[tokio::test]
    async fn new_durable_starts_with_latest_value() {
        let bus = MemoryBus::new();
        let _ = bus.ensure_stream(&events_stream());
        bus.inject("app.buttons", "old");
        bus.inject("app.buttons", "latest");

        let conn = bus.connect(&params()).await.unwrap();
        let mut consumer = conn
            .durable_consumer(&durable("buttons", "app.buttons"))
            .await
            .unwrap();
        assert_eq!(next_payload(&mut consumer).await, "latest");

        bus.inject("app.buttons", "live");
        assert_eq!(next_payload(&mut consumer).await, "live");
        assert_eq!(bus.durables_created(), 1);
        assert_eq!(bus.ack_floor("EVENTS", "buttons"), Some(3));
    }

    #[tokio::test]
    async fn reattached_durable_resumes_after_ack_floor() {
        let bus = MemoryBus::new();
        let _ = bus.ensure_stream(&events_stream());
        bus.inject("app.buttons", "v1");

        let conn = bus.connect(&params()).await.unwrap();
        let spec = durable("buttons", "app.buttons");
        let mut consumer = conn.durable_consumer(&spec).await.unwrap();
        assert_eq!(next_payload(&mut consumer).await, "v1");
        drop(consumer);

        bus.inject("app.buttons", "v2");
        let mut consumer = conn.durable_consumer(&spec).await.unwrap();
        assert_eq!(next_payload(&mut consumer).await, "v2");
        assert_eq!(bus.durables_created(), 1);
    }

    #[tokio::test]
    async fn last_message_reads_newest_on_subject() {
        let bus = MemoryBus::new();
        let _ = bus.ensure_stream(&events_stream());
        bus.inject("app.buttons", "v1");
        bus.inject("app.menu", "m1");
        bus.inject("app.buttons", "v2");

        let conn = bus.connect(&params()).await.unwrap();
        let last = conn.last_message("EVENTS", "app.buttons").await.unwrap().unwrap();
        assert_eq!(last.seq, 3);
        assert_eq!(last.payload, Bytes::from_static(b"v2"));
        assert!(conn.last_message("EVENTS", "app.empty").await.unwrap().is_none());
        assert_matches!(
            conn.last_message("MISSING", "app.buttons").await,
            Err(TransportError::Stream(_))
        );
    }

    #[tokio::test]
    async fn deleting_durable_ends_consumer() {
        let bus = MemoryBus::new();
        let _ = bus.ensure_stream(&events_stream());
        let conn = bus.connect(&params()).await.unwrap();
        let mut consumer = conn
            .durable_consumer(&durable("buttons", "app.buttons"))
            .await
            .unwrap();

        conn.delete_durable("EVENTS", "buttons").await.unwrap();
        assert!(consumer.next().await.is_none());
        assert!(!bus.durable_exists("EVENTS", "buttons"));
        assert!(conn.delete_durable("EVENTS", "buttons").await.is_err());
    }

    #[tokio::test]
    async fn durable_on_missing_stream_fails() {
        let bus = MemoryBus::new();
        let conn = bus.connect(&params()).await.unwrap();
        assert_matches!(
            conn.durable_consumer(&durable("x", "app.x")).await,
            Err(TransportError::Consumer(msg)) if msg.contains("not found")
        );
    }

    #[tokio::test]
    async fn drain_failure_leaves_connection_open() {
        let bus = MemoryBus::new();
        let conn = bus.connect(&params()).await.unwrap();
        bus.set_fail_drain(true);
        assert_matches!(conn.drain().await, Err(TransportError::Drain(_)));
        assert!(!conn.is_closed());
        bus.set_fail_drain(false);
        conn.drain().await.unwrap();
        assert!(conn.is_closed());
        assert_eq!(bus.open_connections(), 0);
    }
}
