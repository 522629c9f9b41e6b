//! Subscriptions tied to a reactive scope.
//!
//! A [`ReactiveBinding`] keeps one subscription alive for as long as its
//! inputs call for it. A driver task re-runs whenever the topic, the enabled
//! flag or the connection state changes. Each run first awaits the previous
//! run's cleanup, so at most one subscription per binding exists at a time.
//!
//! Setup is asynchronous. Every run gets an epoch and a cancellation token.
//! Finishing a run cancels a setup still in flight; a setup that completes
//! after its run was superseded releases what it acquired instead of
//! committing it.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::client::BusClient;
use crate::durable::LatestSubscription;
use crate::handler::Handler;
use crate::state::ConnectionState;
use crate::subscriber::Subscription;

// ─────────────────────────────────────────────────────────────────────────────
// Inputs
// ─────────────────────────────────────────────────────────────────────────────

/// A binding input: a fixed value or a watched one.
#[derive(Clone, Debug)]
pub enum Input<T> {
    /// Never changes.
    Fixed(T),
    /// Re-read on every change notification.
    Watched(watch::Receiver<T>),
}

impl<T: Clone> Input<T> {
    /// Current value, marking it seen.
    fn current(&mut self) -> T {
        match self {
            Self::Fixed(value) => value.clone(),
            Self::Watched(rx) => rx.borrow_and_update().clone(),
        }
    }

    /// Current value without marking it seen.
    fn peek(&self) -> T {
        match self {
            Self::Fixed(value) => value.clone(),
            Self::Watched(rx) => rx.borrow().clone(),
        }
    }

    /// Resolves on the next change. Never resolves for fixed inputs or once
    /// the sender is gone.
    async fn changed(&mut self) {
        match self {
            Self::Fixed(_) => std::future::pending::<()>().await,
            Self::Watched(rx) => watch_changed(rx).await,
        }
    }
}

impl From<String> for Input<String> {
    fn from(value: String) -> Self {
        Self::Fixed(value)
    }
}

impl From<&str> for Input<String> {
    fn from(value: &str) -> Self {
        Self::Fixed(value.to_owned())
    }
}

impl From<watch::Receiver<String>> for Input<String> {
    fn from(rx: watch::Receiver<String>) -> Self {
        Self::Watched(rx)
    }
}

impl From<bool> for Input<bool> {
    fn from(value: bool) -> Self {
        Self::Fixed(value)
    }
}

impl From<watch::Receiver<bool>> for Input<bool> {
    fn from(rx: watch::Receiver<bool>) -> Self {
        Self::Watched(rx)
    }
}

async fn watch_changed<T>(rx: &mut watch::Receiver<T>) {
    if rx.changed().await.is_err() {
        std::future::pending::<()>().await;
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Status
// ─────────────────────────────────────────────────────────────────────────────

/// Which subscription primitive a binding uses.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BindingKind {
    /// Plain subject subscription.
    Subject,
    /// Latest value plus live updates through the durable registry.
    Latest,
}

/// Binding lifecycle as seen by the UI.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BindingStatus {
    /// Disabled, or enabled while the connection is not up.
    #[default]
    Idle,
    /// Setup in flight.
    Subscribing,
    /// Subscription live.
    Subscribed,
    /// Setup failed, or the connection is in error.
    Failed,
    /// The connection went away while setting up.
    Disconnected,
}

/// Status plus the error that caused `Failed`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct BindingView {
    /// Current status.
    pub status: BindingStatus,
    /// Error message, set with [`BindingStatus::Failed`].
    pub error: Option<String>,
}

fn set_view(view: &watch::Sender<BindingView>, status: BindingStatus, error: Option<String>) {
    let next = BindingView { status, error };
    let _ = view.send_if_modified(|current| {
        if *current == next {
            false
        } else {
            *current = next;
            true
        }
    });
}

// ─────────────────────────────────────────────────────────────────────────────
// Runs
// ─────────────────────────────────────────────────────────────────────────────

enum Captured {
    Subject(Subscription),
    Latest(LatestSubscription),
}

impl Captured {
    async fn release(self) {
        match self {
            Self::Subject(sub) => sub.close().await,
            Self::Latest(sub) => sub.cleanup().await,
        }
    }
}

struct Run {
    slot: Arc<Mutex<Option<Captured>>>,
    cancel: CancellationToken,
    setup: Option<JoinHandle<()>>,
}

impl Run {
    /// Invalidate the run and release whatever it acquired.
    async fn finish(mut self, epoch: &AtomicU64) {
        let _ = epoch.fetch_add(1, Ordering::SeqCst);
        self.cancel.cancel();
        if let Some(setup) = self.setup.take() {
            let _ = setup.await;
        }
        let captured = self.slot.lock().take();
        if let Some(captured) = captured {
            captured.release().await;
        }
    }
}

struct Scope {
    client: BusClient,
    handler: Handler,
    kind: BindingKind,
    view: Arc<watch::Sender<BindingView>>,
    epoch: Arc<AtomicU64>,
}

impl Scope {
    fn start(
        &self,
        topic: String,
        enabled: bool,
        watched: Input<bool>,
        state: ConnectionState,
    ) -> Run {
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let slot = Arc::new(Mutex::new(None));
        let idle = Run {
            slot: Arc::clone(&slot),
            cancel: CancellationToken::new(),
            setup: None,
        };

        if !enabled {
            set_view(&self.view, BindingStatus::Idle, None);
            return idle;
        }
        if state != ConnectionState::Connected || !self.client.is_connected() {
            if state == ConnectionState::Error {
                let error = self
                    .client
                    .last_error()
                    .unwrap_or_else(|| "connection error".to_owned());
                set_view(&self.view, BindingStatus::Failed, Some(error));
            } else {
                set_view(&self.view, BindingStatus::Idle, None);
            }
            return idle;
        }

        set_view(&self.view, BindingStatus::Subscribing, None);
        debug!(topic, epoch, kind = ?self.kind, "binding subscribing");
        let setup = tokio::spawn(setup(
            SetupCtx {
                client: self.client.clone(),
                handler: Arc::clone(&self.handler),
                kind: self.kind,
                view: Arc::clone(&self.view),
                current: Arc::clone(&self.epoch),
                enabled: watched,
                slot,
                cancel: idle.cancel.clone(),
            },
            topic,
            epoch,
        ));
        Run {
            setup: Some(setup),
            ..idle
        }
    }
}

struct SetupCtx {
    client: BusClient,
    handler: Handler,
    kind: BindingKind,
    view: Arc<watch::Sender<BindingView>>,
    current: Arc<AtomicU64>,
    enabled: Input<bool>,
    slot: Arc<Mutex<Option<Captured>>>,
    cancel: CancellationToken,
}

async fn setup(ctx: SetupCtx, topic: String, epoch: u64) {
    let handler = Arc::clone(&ctx.handler);
    let acquire = async {
        match ctx.kind {
            BindingKind::Subject => ctx
                .client
                .subscribe(&topic, handler)
                .await
                .map(Captured::Subject),
            BindingKind::Latest => ctx
                .client
                .fetch_latest(&topic, handler)
                .await
                .map(Captured::Latest),
        }
    };
    let result = tokio::select! {
        biased;
        () = ctx.cancel.cancelled() => {
            debug!(topic, epoch, "binding setup cancelled");
            return;
        }
        result = acquire => result,
    };
    let captured = match result {
        Ok(captured) => captured,
        Err(err) => {
            if ctx.current.load(Ordering::SeqCst) == epoch {
                warn!(topic, error = %err, "binding setup failed");
                set_view(&ctx.view, BindingStatus::Failed, Some(err.to_string()));
            }
            return;
        }
    };

    let connected = ctx.client.is_connected();
    if connected && ctx.enabled.peek() {
        let mut slot = ctx.slot.lock();
        if ctx.current.load(Ordering::SeqCst) == epoch {
            *slot = Some(captured);
            set_view(&ctx.view, BindingStatus::Subscribed, None);
            debug!(topic, epoch, "binding subscribed");
            return;
        }
    }

    captured.release().await;
    if ctx.current.load(Ordering::SeqCst) == epoch {
        let status = if connected {
            BindingStatus::Idle
        } else {
            BindingStatus::Disconnected
        };
        set_view(&ctx.view, status, None);
    }
    debug!(topic, epoch, connected, "binding setup discarded");
}

async fn drive(
    scope: Scope,
    mut topic: Input<String>,
    mut enabled: Input<bool>,
    mut status: watch::Receiver<ConnectionState>,
    cancel: CancellationToken,
) {
    let mut run: Option<Run> = None;
    loop {
        if let Some(previous) = run.take() {
            previous.finish(&scope.epoch).await;
        }
        if cancel.is_cancelled() {
            break;
        }

        let state = *status.borrow_and_update();
        let topic_now = topic.current();
        let enabled_now = enabled.current();
        run = Some(scope.start(topic_now, enabled_now, enabled.clone(), state));

        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            () = topic.changed() => {}
            () = enabled.changed() => {}
            () = watch_changed(&mut status) => {}
        }
    }

    if let Some(last) = run.take() {
        last.finish(&scope.epoch).await;
    }
    set_view(&scope.view, BindingStatus::Idle, None);
}

// ─────────────────────────────────────────────────────────────────────────────
// ReactiveBinding
// ─────────────────────────────────────────────────────────────────────────────

/// A subscription that follows its topic, enabled flag and the connection.
///
/// Dropping the binding cancels it; cleanup then finishes in the background.
/// Use [`close`](Self::close) to wait for it.
pub struct ReactiveBinding {
    view: watch::Receiver<BindingView>,
    cancel: CancellationToken,
    driver: Option<JoinHandle<()>>,
}

impl ReactiveBinding {
    /// Start a binding. Must be called inside a tokio runtime.
    pub fn bind(
        client: &BusClient,
        topic: impl Into<Input<String>>,
        handler: Handler,
        enabled: impl Into<Input<bool>>,
        kind: BindingKind,
    ) -> Self {
        let (view_tx, view_rx) = watch::channel(BindingView::default());
        let cancel = CancellationToken::new();
        let scope = Scope {
            client: client.clone(),
            handler,
            kind,
            view: Arc::new(view_tx),
            epoch: Arc::new(AtomicU64::new(0)),
        };
        let driver = tokio::spawn(drive(
            scope,
            topic.into(),
            enabled.into(),
            client.watch_status(),
            cancel.clone(),
        ));
        Self {
            view: view_rx,
            cancel,
            driver: Some(driver),
        }
    }

    /// Status and error.
    pub fn view(&self) -> BindingView {
        self.view.borrow().clone()
    }

    /// Current status.
    pub fn status(&self) -> BindingStatus {
        self.view.borrow().status
    }

    /// Error behind a `Failed` status.
    pub fn error(&self) -> Option<String> {
        self.view.borrow().error.clone()
    }

    /// Wait for the next view change. `false` once the binding has stopped.
    pub async fn changed(&mut self) -> bool {
        self.view.changed().await.is_ok()
    }

    /// Wait until the view satisfies `predicate`.
    pub async fn wait_for(&mut self, mut predicate: impl FnMut(&BindingView) -> bool) -> BindingView {
        let result = self
            .view
            .wait_for(|view| predicate(view))
            .await
            .map(|view| view.clone());
        result.unwrap_or_else(|_| self.view.borrow().clone())
    }

    /// A receiver for the view.
    pub fn watch(&self) -> watch::Receiver<BindingView> {
        self.view.clone()
    }

    /// Tear the binding down and wait for its subscription to be released.
    pub async fn close(mut self) {
        self.cancel.cancel();
        if let Some(driver) = self.driver.take() {
            let _ = driver.await;
        }
    }
}

impl Drop for ReactiveBinding {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
