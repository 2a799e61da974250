// ── Concurrent event dispatcher ──
//
// Every stream instance owns one dispatcher. Each event is handed to an
// independent tokio task that invokes the user callback, so a slow
// handler never blocks the engine, the cursor, or later events. Wire
// order is preserved *into* dispatch; completion order is not
// guaranteed -- callers needing in-order handling serialize inside the
// callback.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;

/// Error type user handlers may return.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

type HandlerFn<E> = dyn Fn(E) -> BoxFuture<'static, Result<(), BoxError>> + Send + Sync;

/// What happened to a single handler invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HandlerOutcome {
    /// Handler returned `Ok(())`.
    Ok,
    /// Handler returned an error.
    Failed,
    /// Handler panicked; the panic was contained and logged.
    Panicked,
}

pub(crate) struct Dispatcher<E> {
    handler: Arc<HandlerFn<E>>,
}

impl<E: Send + 'static> Dispatcher<E> {
    /// Wrap a handler whose future yields `()`. Used by the firehose
    /// and Jetstream streams, where handler outcomes carry no protocol
    /// meaning.
    pub(crate) fn from_infallible<H, Fut>(handler: H) -> Self
    where
        H: Fn(E) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self {
            handler: Arc::new(move |event| handler(event).map(|()| Ok(())).boxed()),
        }
    }

    /// Wrap a handler whose outcome matters (Tap ack policy).
    pub(crate) fn from_fallible<H, Fut>(handler: H) -> Self
    where
        H: Fn(E) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        Self {
            handler: Arc::new(move |event| handler(event).boxed()),
        }
    }

    /// Schedule the handler for `event` on its own task, fire-and-forget.
    pub(crate) fn dispatch(&self, event: E) {
        self.dispatch_tracked(event, |_| {});
    }

    /// Schedule the handler and report its outcome to `done` once it
    /// settles. `done` runs on the handler's task, after the handler
    /// returns.
    pub(crate) fn dispatch_tracked(
        &self,
        event: E,
        done: impl FnOnce(HandlerOutcome) + Send + 'static,
    ) {
        let fut = (self.handler)(event);
        tokio::spawn(async move {
            let outcome = match AssertUnwindSafe(fut).catch_unwind().await {
                Ok(Ok(())) => HandlerOutcome::Ok,
                Ok(Err(error)) => {
                    tracing::error!(error = %error, "event handler failed");
                    HandlerOutcome::Failed
                }
                Err(panic) => {
                    tracing::error!(message = panic_message(&panic), "event handler panicked");
                    HandlerOutcome::Panicked
                }
            };
            done(outcome);
        });
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "<non-string panic payload>"
    }
}
