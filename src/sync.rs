#[cfg(feature = "loom")]
pub(crate) use loom::sync;
#[cfg(feature = "loom")]
type Notify = loom::sync::Notify;

#[cfg(not(feature = "loom"))]
pub(crate) use std::sync;
#[cfg(not(feature = "loom"))]
type Notify = tokio::sync::Notify;

/// Locks a mutex, recovering the guard if another thread panicked while holding it. Every
/// critical section in this crate leaves its state consistent before anything that could
/// panic, so the data behind a poisoned lock is still valid.
pub(crate) fn lock<T>(mutex: &sync::Mutex<T>) -> sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// A wake-up primitive shared between a suspended task and whoever resolves its wait.
///
/// Waiting always goes through a [`Listener`] which must be created _before_ the condition
/// being waited on is checked, otherwise a wake-up issued in between could be missed.
pub(crate) struct Signal(Notify);

#[cfg(feature = "loom")]
pub(crate) struct Listener<'a>(&'a Notify);

#[cfg(not(feature = "loom"))]
pub(crate) struct Listener<'a>(tokio::sync::futures::Notified<'a>);

#[cfg(feature = "loom")]
impl Signal {
    pub(crate) fn new() -> Self {
        Self(Notify::new())
    }

    pub(crate) fn notify_one(&self) {
        self.0.notify();
    }

    // loom only ever models a single waiter per signal
    pub(crate) fn notify_waiters(&self) {
        self.0.notify();
    }

    pub(crate) fn listen(&self) -> Listener<'_> {
        Listener(&self.0)
    }
}

#[cfg(feature = "loom")]
impl Listener<'_> {
    pub(crate) async fn wait(self) {
        self.0.wait();
    }
}

#[cfg(not(feature = "loom"))]
impl Signal {
    pub(crate) fn new() -> Self {
        Self(Notify::new())
    }

    /// Wakes the single task waiting on this signal, or stores a permit for it.
    pub(crate) fn notify_one(&self) {
        self.0.notify_one();
    }

    /// Wakes every [`Listener`] created before this call.
    pub(crate) fn notify_waiters(&self) {
        self.0.notify_waiters();
    }

    pub(crate) fn listen(&self) -> Listener<'_> {
        Listener(self.0.notified())
    }
}

#[cfg(not(feature = "loom"))]
impl Listener<'_> {
    pub(crate) async fn wait(self) {
        self.0.await;
    }
}

impl std::fmt::Debug for Signal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signal").finish_non_exhaustive()
    }
}
