//! The single logical bus connection and its lifecycle.
//!
//! [`ConnectionManager`] owns at most one live connection handle. Each handle
//! is tagged with an epoch; the status listener spawned for a handle acts only
//! while its epoch is the active one, so a listener left over from an older
//! handle can never overwrite the state of a newer one.

use std::sync::Arc;

use metrics::counter;
use mightypie_settings::BusSettings;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::BusError;
use crate::metrics::{BUS_CONNECT_ATTEMPTS_TOTAL, BUS_CONNECT_FAILURES_TOTAL, BUS_STATUS_EVENTS_TOTAL};
use crate::retry::RetryPolicy;
use crate::state::ConnectionState;
use crate::transport::{BusConnection, ParamsSource, StatusEvent, Transport};

struct ActiveHandle {
    epoch: u64,
    conn: Arc<dyn BusConnection>,
    listener: CancellationToken,
}

#[derive(Default)]
struct Inner {
    handle: Option<ActiveHandle>,
    next_epoch: u64,
    last_error: Option<String>,
    /// Epoch for which the transport reported an error.
    error_epoch: Option<u64>,
}

impl Inner {
    fn active_epoch(&self) -> Option<u64> {
        self.handle.as_ref().map(|h| h.epoch)
    }

    fn clear_handle(&mut self) -> Option<Arc<dyn BusConnection>> {
        self.handle.take().map(|h| {
            h.listener.cancel();
            h.conn
        })
    }
}

struct Shared {
    inner: Mutex<Inner>,
    status: watch::Sender<ConnectionState>,
}

impl Shared {
    fn set_state(&self, state: ConnectionState) {
        let _ = self.status.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
    }

    fn state(&self) -> ConnectionState {
        *self.status.borrow()
    }
}

/// Puts `connecting` back to `idle` when a connect future is dropped mid-loop,
/// so the next `connect()` starts a fresh loop.
struct ConnectingGuard<'a> {
    shared: &'a Shared,
    armed: bool,
}

impl ConnectingGuard<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for ConnectingGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let inner = self.shared.inner.lock();
        if inner.handle.is_none() && self.shared.state() == ConnectionState::Connecting {
            self.shared.set_state(ConnectionState::Idle);
            debug!("connect cancelled before finishing");
        }
    }
}

/// Owns the connection: connect with bounded retries, drain on disconnect,
/// and track status events from the transport.
pub struct ConnectionManager {
    shared: Arc<Shared>,
    transport: Arc<dyn Transport>,
    params: Arc<dyn ParamsSource>,
    retry: RetryPolicy,
}

impl ConnectionManager {
    /// Create an idle manager.
    pub fn new(
        transport: Arc<dyn Transport>,
        params: Arc<dyn ParamsSource>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner::default()),
                status: watch::channel(ConnectionState::Idle).0,
            }),
            transport,
            params,
            retry,
        }
    }

    /// Create an idle manager reading parameters and retry policy from settings.
    pub fn from_settings(transport: Arc<dyn Transport>, settings: &BusSettings) -> Self {
        Self::new(
            transport,
            Arc::new(settings.clone()),
            RetryPolicy::from_settings(&settings.retry),
        )
    }

    /// Connect, retrying up to the policy's bound.
    ///
    /// Returns immediately if a connection is live or another call is already
    /// connecting.
    pub async fn connect(&self) -> Result<(), BusError> {
        let started = {
            let _inner = self.shared.inner.lock();
            self.shared.status.send_if_modified(|state| {
                if state.is_active() {
                    false
                } else {
                    *state = ConnectionState::Connecting;
                    true
                }
            })
        };
        if !started {
            debug!(state = %self.status(), "connect skipped");
            return Ok(());
        }
        let guard = ConnectingGuard {
            shared: &self.shared,
            armed: true,
        };

        let params = match self.params.connect_params() {
            Ok(params) => params,
            Err(err) => {
                error!(error = %err, "cannot connect");
                self.fail(err.to_string());
                guard.disarm();
                return Err(err);
            }
        };

        let max_retries = self.retry.max_retries;
        let mut last_error = String::new();
        for attempt in 1..=max_retries {
            counter!(BUS_CONNECT_ATTEMPTS_TOTAL).increment(1);
            match tokio::time::timeout(params.connection_timeout, self.transport.connect(&params))
                .await
            {
                Ok(Ok(conn)) => {
                    let epoch = self.install(conn);
                    guard.disarm();
                    info!(server = %params.server_url, attempt, epoch, "connected to bus");
                    return Ok(());
                }
                Ok(Err(err)) => last_error = err.to_string(),
                Err(_) => {
                    last_error = format!(
                        "timed out after {}ms",
                        params.connection_timeout.as_millis()
                    );
                }
            }
            warn!(attempt, max_retries, error = %last_error, "connect attempt failed");
            if attempt < max_retries {
                tokio::time::sleep(self.retry.delay_after(attempt)).await;
            }
        }

        counter!(BUS_CONNECT_FAILURES_TOTAL).increment(1);
        error!(attempts = max_retries, error = %last_error, "giving up on bus connection");
        self.fail(last_error.clone());
        guard.disarm();
        Err(BusError::ConnectFailed {
            attempts: max_retries,
            last_error,
        })
    }

    /// Drain and close the active connection. No-op without one.
    pub async fn disconnect(&self) -> Result<(), BusError> {
        let active = {
            let inner = self.shared.inner.lock();
            inner.handle.as_ref().map(|h| (h.epoch, Arc::clone(&h.conn)))
        };
        let Some((epoch, conn)) = active else {
            debug!("disconnect skipped: no connection");
            return Ok(());
        };

        match conn.drain().await {
            Ok(()) => {
                let mut inner = self.shared.inner.lock();
                if inner.active_epoch() == Some(epoch) {
                    let _ = inner.clear_handle();
                    if self.shared.state() != ConnectionState::Error {
                        self.shared.set_state(ConnectionState::Closed);
                    }
                }
                info!(epoch, "bus connection drained");
                Ok(())
            }
            Err(err) => {
                let message = err.to_string();
                {
                    let mut inner = self.shared.inner.lock();
                    if inner.active_epoch() == Some(epoch) {
                        let _ = inner.clear_handle();
                    }
                    inner.last_error = Some(message.clone());
                    self.shared.set_state(ConnectionState::Error);
                }
                error!(epoch, error = %message, "drain failed");
                Err(BusError::DrainFailed(message))
            }
        }
    }

    /// State is `connected` and the handle is live.
    pub fn is_connected(&self) -> bool {
        let inner = self.shared.inner.lock();
        self.shared.state() == ConnectionState::Connected
            && inner.handle.as_ref().is_some_and(|h| !h.conn.is_closed())
    }

    /// Current state, without blocking.
    pub fn status(&self) -> ConnectionState {
        self.shared.state()
    }

    /// Receiver notified on every state change.
    pub fn watch_status(&self) -> watch::Receiver<ConnectionState> {
        self.shared.status.subscribe()
    }

    /// The active connection handle, if any.
    pub fn connection(&self) -> Option<Arc<dyn BusConnection>> {
        let inner = self.shared.inner.lock();
        inner
            .handle
            .as_ref()
            .filter(|h| !h.conn.is_closed())
            .map(|h| Arc::clone(&h.conn))
    }

    /// The live handle, only while [`is_connected`](Self::is_connected).
    pub(crate) fn live_connection(&self) -> Option<Arc<dyn BusConnection>> {
        self.live_handle().map(|(_, conn)| conn)
    }

    /// Like [`live_connection`](Self::live_connection), paired with the handle's epoch.
    pub(crate) fn live_handle(&self) -> Option<(u64, Arc<dyn BusConnection>)> {
        let inner = self.shared.inner.lock();
        if self.shared.state() != ConnectionState::Connected {
            return None;
        }
        inner
            .handle
            .as_ref()
            .filter(|h| !h.conn.is_closed())
            .map(|h| (h.epoch, Arc::clone(&h.conn)))
    }

    /// Most recent connect, drain or transport error.
    pub fn last_error(&self) -> Option<String> {
        self.shared.inner.lock().last_error.clone()
    }

    /// Epoch of the active handle.
    pub fn epoch(&self) -> Option<u64> {
        self.shared.inner.lock().active_epoch()
    }

    fn fail(&self, message: String) {
        let stale = {
            let mut inner = self.shared.inner.lock();
            let stale = inner.clear_handle();
            inner.last_error = Some(message);
            self.shared.set_state(ConnectionState::Error);
            stale
        };
        if let Some(conn) = stale {
            drain_in_background(conn);
        }
    }

    fn install(&self, conn: Arc<dyn BusConnection>) -> u64 {
        let events = conn.status_events();
        let listener = CancellationToken::new();
        let (epoch, replaced) = {
            let mut inner = self.shared.inner.lock();
            let replaced = inner.clear_handle();
            inner.next_epoch += 1;
            let epoch = inner.next_epoch;
            inner.handle = Some(ActiveHandle {
                epoch,
                conn,
                listener: listener.clone(),
            });
            inner.last_error = None;
            inner.error_epoch = None;
            self.shared.set_state(ConnectionState::Connected);
            (epoch, replaced)
        };
        if let Some(old) = replaced {
            drain_in_background(old);
        }
        if let Some(events) = events {
            let _ = tokio::spawn(listen(Arc::clone(&self.shared), epoch, events, listener));
        }
        epoch
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        if let Some(handle) = self.shared.inner.lock().handle.as_ref() {
            handle.listener.cancel();
        }
    }
}

fn drain_in_background(conn: Arc<dyn BusConnection>) {
    if conn.is_closed() {
        return;
    }
    let _ = tokio::spawn(async move {
        if let Err(err) = conn.drain().await {
            warn!(server = %conn.server(), error = %err, "failed to drain replaced connection");
        }
    });
}

/// Apply status events for one epoch until the stream ends or the epoch goes stale.
async fn listen(
    shared: Arc<Shared>,
    epoch: u64,
    mut events: mpsc::UnboundedReceiver<StatusEvent>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            biased;
            () = cancel.cancelled() => return,
            event = events.recv() => event,
        };
        let Some(event) = event else { break };
        if event == StatusEvent::Closed {
            break;
        }

        let mut inner = shared.inner.lock();
        if inner.active_epoch() != Some(epoch) {
            return;
        }
        match event {
            StatusEvent::Disconnect => {
                counter!(BUS_STATUS_EVENTS_TOTAL, "event" => "disconnect").increment(1);
                warn!(epoch, "bus connection lost, reconnecting");
                shared.set_state(ConnectionState::Reconnecting);
            }
            StatusEvent::Reconnect => {
                counter!(BUS_STATUS_EVENTS_TOTAL, "event" => "reconnect").increment(1);
                info!(epoch, "bus connection re-established");
                shared.set_state(ConnectionState::Connected);
            }
            StatusEvent::Error(message) => {
                counter!(BUS_STATUS_EVENTS_TOTAL, "event" => "error").increment(1);
                error!(epoch, error = %message, "bus connection error");
                inner.last_error = Some(message);
                inner.error_epoch = Some(epoch);
                shared.set_state(ConnectionState::Error);
            }
            StatusEvent::Closed => {}
        }
    }

    let mut inner = shared.inner.lock();
    if inner.active_epoch() == Some(epoch) {
        let _ = inner.clear_handle();
        if inner.error_epoch != Some(epoch) {
            shared.set_state(ConnectionState::Closed);
        }
        info!(epoch, "bus connection closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use assert_matches::assert_matches;
    use tokio::time::Instant;

    use crate::transport::ConnectParams;
    use crate::transport::memory::MemoryBus;

    fn manager(bus: &MemoryBus, retry: RetryPolicy) -> ConnectionManager {
        ConnectionManager::new(
            Arc::new(bus.clone()),
            Arc::new(ConnectParams::new("mem://bus", "token")),
            retry,
        )
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn connect_succeeds_first_try() {
        let bus = MemoryBus::new();
        let mgr = manager(&bus, RetryPolicy::default());
        assert_eq!(mgr.status(), ConnectionState::Idle);

        mgr.connect().await.unwrap();
        assert_eq!(mgr.status(), ConnectionState::Connected);
        assert!(mgr.is_connected());
        assert!(mgr.connection().is_some());
        assert_eq!(mgr.epoch(), Some(1));
        assert_eq!(bus.connect_attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn connect_is_noop_when_connected() {
        let bus = MemoryBus::new();
        let mgr = manager(&bus, RetryPolicy::default());
        mgr.connect().await.unwrap();
        mgr.connect().await.unwrap();
        assert_eq!(bus.connect_attempts(), 1);
        assert_eq!(mgr.epoch(), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn retries_with_fixed_delay_then_gives_up() {
        let bus = MemoryBus::new();
        bus.set_reachable(false);
        let mgr = manager(&bus, RetryPolicy::fixed(3, Duration::from_millis(1000)));

        let started = Instant::now();
        let result = mgr.connect().await;

        assert_matches!(result, Err(BusError::ConnectFailed { attempts: 3, last_error }) if last_error.contains("could not reach"));
        assert_eq!(bus.connect_attempts(), 3);
        // two waits between three attempts
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(2000), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(3000), "{elapsed:?}");
        assert_eq!(mgr.status(), ConnectionState::Error);
        assert!(mgr.connection().is_none());
        assert!(mgr.last_error().unwrap().contains("could not reach"));
    }

    #[tokio::test(start_paused = true)]
    async fn recovers_after_transient_failures() {
        let bus = MemoryBus::new();
        bus.fail_next_connects(2);
        let mgr = manager(&bus, RetryPolicy::fixed(5, Duration::from_millis(500)));

        mgr.connect().await.unwrap();
        assert_eq!(bus.connect_attempts(), 3);
        assert!(mgr.is_connected());
        assert!(mgr.last_error().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn slow_attempts_time_out() {
        let bus = MemoryBus::new();
        bus.set_connect_delay(Duration::from_secs(60));
        let mut params = ConnectParams::new("mem://bus", "token");
        params.connection_timeout = Duration::from_millis(100);
        let mgr = ConnectionManager::new(
            Arc::new(bus.clone()),
            Arc::new(params),
            RetryPolicy::fixed(2, Duration::from_millis(10)),
        );

        assert_matches!(
            mgr.connect().await,
            Err(BusError::ConnectFailed { attempts: 2, last_error }) if last_error.contains("timed out")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_connect_does_not_wedge_state() {
        let bus = MemoryBus::new();
        bus.set_reachable(false);
        let mgr = manager(&bus, RetryPolicy::fixed(5, Duration::from_millis(1000)));

        let cancelled = tokio::time::timeout(Duration::from_millis(500), mgr.connect()).await;
        assert!(cancelled.is_err());
        assert_eq!(mgr.status(), ConnectionState::Idle);
        assert_eq!(bus.connect_attempts(), 1);

        bus.set_reachable(true);
        mgr.connect().await.unwrap();
        assert_eq!(bus.connect_attempts(), 2);
        assert!(mgr.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn missing_config_is_not_retried() {
        let bus = MemoryBus::new();
        let mgr = ConnectionManager::from_settings(Arc::new(bus.clone()), &BusSettings::default());

        assert_matches!(mgr.connect().await, Err(BusError::ConfigMissing(_)));
        assert_eq!(bus.connect_attempts(), 0);
        assert_eq!(mgr.status(), ConnectionState::Error);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_connects_run_one_loop() {
        let bus = MemoryBus::new();
        bus.set_connect_delay(Duration::from_millis(200));
        let mgr = Arc::new(manager(&bus, RetryPolicy::default()));

        let handles: Vec<_> = (0..5)
            .map(|_| {
                let mgr = Arc::clone(&mgr);
                tokio::spawn(async move { mgr.connect().await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(bus.connect_attempts(), 1);
        assert_eq!(bus.open_connections(), 1);
        assert!(mgr.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn status_events_drive_state() {
        let bus = MemoryBus::new();
        let mgr = manager(&bus, RetryPolicy::default());
        mgr.connect().await.unwrap();
        let mut status = mgr.watch_status();

        bus.emit(&StatusEvent::Disconnect);
        status.changed().await.unwrap();
        assert_eq!(*status.borrow_and_update(), ConnectionState::Reconnecting);
        assert!(!mgr.is_connected());

        bus.emit(&StatusEvent::Reconnect);
        status.changed().await.unwrap();
        assert_eq!(*status.borrow_and_update(), ConnectionState::Connected);

        bus.emit(&StatusEvent::Error("authorization violation".into()));
        status.changed().await.unwrap();
        assert_eq!(*status.borrow_and_update(), ConnectionState::Error);
        assert_eq!(mgr.last_error().as_deref(), Some("authorization violation"));
    }

    #[tokio::test(start_paused = true)]
    async fn server_close_sets_closed_and_clears_handle() {
        let bus = MemoryBus::new();
        let mgr = manager(&bus, RetryPolicy::default());
        mgr.connect().await.unwrap();

        bus.close_connections();
        settle().await;

        assert_eq!(mgr.status(), ConnectionState::Closed);
        assert!(mgr.connection().is_none());
        assert!(mgr.epoch().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn close_after_error_keeps_error() {
        let bus = MemoryBus::new();
        let mgr = manager(&bus, RetryPolicy::default());
        mgr.connect().await.unwrap();

        bus.emit(&StatusEvent::Error("stale connection".into()));
        bus.close_connections();
        settle().await;

        assert_eq!(mgr.status(), ConnectionState::Error);
        assert!(mgr.connection().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_drains_and_closes() {
        let bus = MemoryBus::new();
        let mgr = manager(&bus, RetryPolicy::default());
        mgr.connect().await.unwrap();

        mgr.disconnect().await.unwrap();
        settle().await;

        assert_eq!(mgr.status(), ConnectionState::Closed);
        assert!(mgr.connection().is_none());
        assert_eq!(bus.open_connections(), 0);

        // nothing left to drain
        mgr.disconnect().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn drain_failure_sets_error() {
        let bus = MemoryBus::new();
        let mgr = manager(&bus, RetryPolicy::default());
        mgr.connect().await.unwrap();
        bus.set_fail_drain(true);

        assert_matches!(mgr.disconnect().await, Err(BusError::DrainFailed(_)));
        assert_eq!(mgr.status(), ConnectionState::Error);
        assert!(mgr.connection().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_after_close_uses_new_epoch() {
        let bus = MemoryBus::new();
        let mgr = manager(&bus, RetryPolicy::default());
        mgr.connect().await.unwrap();
        mgr.disconnect().await.unwrap();
        mgr.connect().await.unwrap();
        assert_eq!(mgr.epoch(), Some(2));

        // events for the new connection still apply; the old listener is gone
        bus.emit(&StatusEvent::Disconnect);
        settle().await;
        assert_eq!(mgr.status(), ConnectionState::Reconnecting);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_listener_never_writes_state() {
        let bus = MemoryBus::new();
        let mgr = manager(&bus, RetryPolicy::default());
        mgr.connect().await.unwrap();
        let first = mgr.connection().unwrap();

        // an error moves the manager to `error`; connecting again replaces the handle
        bus.emit(&StatusEvent::Error("boom".into()));
        settle().await;
        mgr.connect().await.unwrap();
        assert_eq!(mgr.epoch(), Some(2));
        settle().await;

        // the replaced connection is drained in the background; its listener stays silent
        assert!(first.is_closed());
        assert_eq!(mgr.status(), ConnectionState::Connected);
        assert_eq!(bus.open_connections(), 1);
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn failed_attempts_are_logged() {
        let (logs, _guard) = mightypie_logging::capture_logs();
        let bus = MemoryBus::new();
        bus.set_reachable(false);
        let mgr = manager(&bus, RetryPolicy::fixed(2, Duration::from_millis(10)));
        let _ = mgr.connect().await;

        assert_eq!(logs.count_matching("connect attempt failed"), 2);
        assert!(logs.has_event(tracing::Level::ERROR, "giving up on bus connection"));
    }
}
