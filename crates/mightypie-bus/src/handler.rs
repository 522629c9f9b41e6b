//! Message handlers and contained delivery.
//!
//! A [`Handler`] receives each decoded payload. Whatever goes wrong while
//! delivering one message (bad UTF-8, handler error, handler panic) is logged
//! and counted here and never reaches the delivery loop.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use metrics::counter;
use tracing::warn;

use crate::error::DeliveryError;
use crate::metrics::{BUS_DELIVERY_ERRORS_TOTAL, BUS_MESSAGES_DELIVERED_TOTAL};

/// Async message handler. Receives the payload decoded as UTF-8.
pub type Handler = Arc<dyn Fn(String) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Wrap an async closure as a [`Handler`].
pub fn handler<F, Fut>(f: F) -> Handler
where
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(move |payload| f(payload).boxed())
}

/// Wrap a synchronous closure as a [`Handler`].
pub fn sync_handler<F>(f: F) -> Handler
where
    F: Fn(String) -> anyhow::Result<()> + Send + Sync + 'static,
{
    Arc::new(move |payload| futures::future::ready(f(payload)).boxed())
}

pub(crate) fn decode(payload: &[u8]) -> Result<String, DeliveryError> {
    Ok(std::str::from_utf8(payload)?.to_owned())
}

/// Run the handler on one payload, catching errors and panics.
pub(crate) async fn invoke(handler: &Handler, payload: String) -> Result<(), DeliveryError> {
    // the closure itself may panic before returning a future
    let fut = match std::panic::catch_unwind(AssertUnwindSafe(|| handler(payload))) {
        Ok(fut) => fut,
        Err(panic) => return Err(DeliveryError::Panicked(panic_message(panic.as_ref()))),
    };
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(DeliveryError::Handler(e)),
        Err(panic) => Err(DeliveryError::Panicked(panic_message(panic.as_ref()))),
    }
}

/// Invoke and record the outcome. `path` labels the delivery route.
pub(crate) async fn deliver(handler: &Handler, subject: &str, payload: String, path: &'static str) {
    match invoke(handler, payload).await {
        Ok(()) => counter!(BUS_MESSAGES_DELIVERED_TOTAL, "path" => path).increment(1),
        Err(err) => report(subject, &err),
    }
}

pub(crate) fn report(subject: &str, err: &DeliveryError) {
    counter!(BUS_DELIVERY_ERRORS_TOTAL, "kind" => err.kind()).increment(1);
    warn!(subject, kind = err.kind(), error = %err, "message delivery failed");
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use parking_lot::Mutex;

    #[test]
    fn decode_rejects_invalid_utf8() {
        assert_eq!(decode(b"{\"a\":1}").unwrap(), "{\"a\":1}");
        assert_matches!(decode(&[0xc3, 0x28]), Err(DeliveryError::Decode(_)));
    }

    #[tokio::test]
    async fn invoke_passes_payload() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let h = handler(move |payload| {
            let sink = Arc::clone(&sink);
            async move {
                sink.lock().push(payload);
                Ok(())
            }
        });
        invoke(&h, "hello".into()).await.unwrap();
        assert_eq!(*seen.lock(), vec!["hello".to_string()]);
    }

    #[tokio::test]
    async fn invoke_returns_handler_error() {
        let h = sync_handler(|_| Err(anyhow::anyhow!("bad config")));
        assert_matches!(
            invoke(&h, String::new()).await,
            Err(DeliveryError::Handler(e)) if e.to_string() == "bad config"
        );
    }

    #[tokio::test]
    async fn invoke_catches_async_panic() {
        let h = handler(|payload| async move {
            if payload.is_empty() {
                panic!("async boom");
            }
            Ok(())
        });
        assert_matches!(
            invoke(&h, String::new()).await,
            Err(DeliveryError::Panicked(msg)) if msg == "async boom"
        );
    }

    #[tokio::test]
    async fn invoke_catches_sync_panic() {
        let h = sync_handler(|payload| panic!("sync boom: {payload}"));
        assert_matches!(
            invoke(&h, "x".into()).await,
            Err(DeliveryError::Panicked(msg)) if msg == "sync boom: x"
        );
    }

    #[tokio::test(flavor = "current_thread")]
    async fn deliver_logs_failures() {
        let (logs, _guard) = mightypie_logging::capture_logs();
        let h = sync_handler(|_| Err(anyhow::anyhow!("nope")));
        deliver(&h, "app.test", "payload".into(), "subject").await;
        assert!(logs.has_event(tracing::Level::WARN, "message delivery failed"));
        let event = logs
            .events()
            .into_iter()
            .find(|e| e.message.contains("message delivery failed"))
            .unwrap();
        assert_eq!(event.field("subject"), Some("app.test"));
        assert_eq!(event.field("kind"), Some("handler"));
    }
}
