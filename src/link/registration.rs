use chrono::Utc;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::Notify;

use crate::protocol::Request;

/// Identity granted by a parent node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    pub id: u64,
    pub name: String,
    /// Address the parent expects to reach this node on
    pub address: String,
    pub fingerprint: String,
    /// Control address of the parent that granted it
    pub parent: String,
}

impl Registration {
    pub fn alive(&self) -> Request {
        Request::Alive {
            id: self.id,
            name: self.name.clone(),
            fingerprint: self.fingerprint.clone(),
            timestamp: Utc::now(),
        }
    }

    pub fn shutdown_notice(&self) -> Request {
        Request::NotifyShutdown {
            name: self.name.clone(),
            fingerprint: self.fingerprint.clone(),
        }
    }
}

#[derive(Debug, Default)]
struct RegistrationHandleInner {
    current: Mutex<Option<Registration>>,
    change_notify: Notify,
}

/// Shared view of the current registration.
///
/// Cleared whenever the link to the parent is lost, so nothing can act
/// under a stale identity.
#[derive(Debug, Clone, Default)]
pub struct RegistrationHandle {
    inner: Arc<RegistrationHandleInner>,
}

impl RegistrationHandle {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn update(&self, registration: Option<Registration>) {
        *self.inner.current.lock() = registration;
        self.inner.change_notify.notify_waiters();
    }

    /// Drop the current registration, returning it.
    pub fn clear(&self) -> Option<Registration> {
        let previous = self.inner.current.lock().take();
        self.inner.change_notify.notify_waiters();
        previous
    }

    pub fn get(&self) -> Option<Registration> {
        self.inner.current.lock().clone()
    }

    /// Wait until a registration is present and return it.
    pub async fn wait_for_update(&self) -> Registration {
        loop {
            let updated = self.inner.change_notify.notified();
            if let Some(registration) = self.get() {
                return registration;
            }
            updated.await;
        }
    }

    /// Wait until a registration other than `previous` is present.
    pub async fn wait_for_change(&self, previous: &Registration) -> Registration {
        loop {
            let updated = self.inner.change_notify.notified();
            match self.get() {
                Some(current) if current.fingerprint != previous.fingerprint => return current,
                _ => updated.await,
            }
        }
    }
}
