//! A rendezvous slot holding at most one latest value.
//!
//! The writer skips the write if the slot is already full; the reader
//! blocks (with an optional timeout) until a value arrives. Used for raw
//! frames and for sharpness scalars, so the focus loop and recorder always
//! see the current value rather than an accumulating backlog.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Notify};

use crate::error::{AppResult, MicroscopeError};

struct Slot<T> {
    value: Mutex<Option<T>>,
    notify: Notify,
}

/// Producer handle for a [`SingleSlotChannel`].
pub struct Sender<T> {
    slot: Arc<Slot<T>>,
}

/// Consumer handle for a [`SingleSlotChannel`].
pub struct Receiver<T> {
    slot: Arc<Slot<T>>,
}

/// Creates a connected sender/receiver pair sharing one rendezvous slot.
pub fn single_slot<T>() -> (Sender<T>, Receiver<T>) {
    let slot = Arc::new(Slot { value: Mutex::new(None), notify: Notify::new() });
    (Sender { slot: slot.clone() }, Receiver { slot })
}

impl<T> Sender<T> {
    /// Deposits `value` if the slot is empty; otherwise drops `value` and
    /// returns `false`, signalling that the consumer has not yet caught up.
    pub async fn try_put(&self, value: T) -> bool {
        let mut guard = self.slot.value.lock().await;
        if guard.is_some() {
            false
        } else {
            *guard = Some(value);
            drop(guard);
            self.slot.notify.notify_one();
            true
        }
    }
}

impl<T> Clone for Sender<T> {
    fn clone(&self) -> Self {
        Self { slot: self.slot.clone() }
    }
}

impl<T> Receiver<T> {
    /// Blocks until a value is available, then takes and clears it.
    pub async fn get(&self) -> T {
        loop {
            {
                let mut guard = self.slot.value.lock().await;
                if let Some(value) = guard.take() {
                    return value;
                }
            }
            self.slot.notify.notified().await;
        }
    }

    /// Like [`Self::get`], but aborts with [`MicroscopeError::Timeout`] if no
    /// value arrives within `timeout`. Used by the autofocus controller to
    /// guard against a stalled video pipeline.
    pub async fn get_timeout(&self, timeout: Duration, what: &str) -> AppResult<T> {
        tokio::time::timeout(timeout, self.get())
            .await
            .map_err(|_| MicroscopeError::Timeout(what.to_string()))
    }

    /// Non-blocking peek at whether a value is currently queued, without
    /// consuming it. Used by tests and diagnostics only.
    pub async fn is_empty(&self) -> bool {
        self.slot.value.lock().await.is_none()
    }
}

impl<T> Clone for Receiver<T> {
    fn clone(&self) -> Self {
        Self { slot: self.slot.clone() }
    }
}
