use anyhow::Error as AnyError;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Records the first unrecoverable error of a worker and halts it.
///
/// Cloned handles share state; only the first [`trigger`](Self::trigger)
/// is captured, later ones are returned to the caller untouched.
#[derive(Clone)]
pub struct FatalErrorHandler {
    inner: Arc<FatalInner>,
}

struct FatalInner {
    triggered: AtomicBool,
    halt: CancellationToken,
    captured_error: Mutex<Option<CapturedFatalError>>,
}

#[derive(Clone)]
struct CapturedFatalError {
    inner: Arc<AnyError>,
}

impl CapturedFatalError {
    fn new(inner: AnyError) -> Self {
        Self {
            inner: Arc::new(inner),
        }
    }
}

impl fmt::Debug for CapturedFatalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CapturedFatalError")
            .field(&self.inner)
            .finish()
    }
}

impl fmt::Display for CapturedFatalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self.inner.as_ref(), f)
    }
}

impl std::error::Error for CapturedFatalError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.inner.as_ref().as_ref())
    }
}

impl FatalErrorHandler {
    pub fn new(halt: CancellationToken) -> Self {
        Self {
            inner: Arc::new(FatalInner {
                triggered: AtomicBool::new(false),
                halt,
                captured_error: Mutex::new(None),
            }),
        }
    }

    pub fn trigger(&self, context: &str, error: AnyError) -> AnyError {
        if self.inner.triggered.swap(true, Ordering::SeqCst) {
            return error;
        }

        tracing::error!(
            context,
            error = %error,
            "fatal tunnel error; halting worker"
        );

        let captured = CapturedFatalError::new(error);
        {
            let mut slot = self.inner.captured_error.lock();
            if slot.is_none() {
                *slot = Some(captured.clone());
            }
        }

        self.inner.halt.cancel();
        captured.into()
    }

    pub fn is_triggered(&self) -> bool {
        self.inner.triggered.load(Ordering::SeqCst)
    }

    pub fn error(&self) -> Option<AnyError> {
        self.inner
            .captured_error
            .lock()
            .as_ref()
            .map(|error| error.clone().into())
    }

    /// Resolves once the worker halts, yielding the captured error if the
    /// halt was caused by [`trigger`](Self::trigger).
    pub async fn wait(&self) -> Option<AnyError> {
        self.inner.halt.cancelled().await;
        self.error()
    }
}
