//! Completion primitive shared by all Capstan layers.
//!
//! An [`Event`] carries either a value or an error and can be awaited with an
//! optional timeout. It replaces condition-variable style futures: the read
//! pump resolves events from its task, while application tasks wait on them.
//! On a fatal transport failure every outstanding event is failed through
//! [`Event::notify_error`], waking all waiters with the same error.
//!
//! Events are cheaply cloneable handles to shared state, and can be cleared
//! and reused (the key-exchange "done" event goes through set/clear cycles on
//! every rekey).

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;

use crate::error::TransportError;

struct Shared<V, E> {
    state: Mutex<Option<Result<V, E>>>,
    notify: Notify,
    name: &'static str,
}

/// An awaitable completion carrying either a value or an error.
pub struct Event<V, E> {
    shared: Arc<Shared<V, E>>,
}

impl<V, E> Clone for Event<V, E> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<V, E> std::fmt::Debug for Event<V, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Event").field("name", &self.shared.name).finish()
    }
}

impl<V, E> Event<V, E>
where
    V: Clone,
    E: Clone + From<TransportError>,
{
    /// Creates a new unresolved event. The name shows up in `Debug` output.
    pub fn new(name: &'static str) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(None),
                notify: Notify::new(),
                name,
            }),
        }
    }

    /// Resolves the event with a value, waking all waiters.
    pub fn set(&self, value: V) {
        let mut state = self.shared.state.lock().expect("event lock poisoned");
        *state = Some(Ok(value));
        drop(state);
        self.shared.notify.notify_waiters();
    }

    /// Resolves the event with an error, waking all waiters.
    pub fn error(&self, err: E) {
        let mut state = self.shared.state.lock().expect("event lock poisoned");
        *state = Some(Err(err));
        drop(state);
        self.shared.notify.notify_waiters();
    }

    /// Fails the event with a transport error, unless it already holds a value.
    ///
    /// This is the fan-out entry point used when the transport dies.
    pub fn notify_error(&self, err: &TransportError) {
        let mut state = self.shared.state.lock().expect("event lock poisoned");
        if !matches!(*state, Some(Ok(_))) {
            *state = Some(Err(E::from(err.clone())));
        }
        drop(state);
        self.shared.notify.notify_waiters();
    }

    /// Returns the event to the unresolved state.
    pub fn clear(&self) {
        let mut state = self.shared.state.lock().expect("event lock poisoned");
        *state = None;
        drop(state);
        self.shared.notify.notify_waiters();
    }

    /// Whether the event currently holds a value.
    pub fn is_set(&self) -> bool {
        matches!(
            *self.shared.state.lock().expect("event lock poisoned"),
            Some(Ok(_))
        )
    }

    /// Returns the resolution without waiting, if there is one.
    pub fn peek(&self) -> Option<Result<V, E>> {
        self.shared.state.lock().expect("event lock poisoned").clone()
    }

    /// Waits for the event to resolve.
    ///
    /// With `timeout` of `None` this waits indefinitely; otherwise expiry
    /// yields `E::from(TransportError::Timeout)`.
    pub async fn wait(&self, timeout: Option<Duration>) -> Result<V, E> {
        let deadline = timeout.map(|d| tokio::time::Instant::now() + d);
        loop {
            // Register interest before checking state, so a resolution
            // between the check and the await is not missed.
            let notified = self.shared.notify.notified();
            if let Some(result) = self.peek() {
                return result;
            }
            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        return Err(E::from(TransportError::Timeout));
                    }
                }
                None => notified.await,
            }
        }
    }
}
