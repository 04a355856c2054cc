//! Externally observable device properties.
//!
//! The worker thread is the only writer. Readers get a cloned snapshot.

use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;

use crate::protocol::constants::NONCE_LEN;

/// Shared, clonable handle to a property set.
#[derive(Debug, Default)]
pub struct PropertyCell<T> {
    inner: Arc<Mutex<T>>,
}

impl<T> Clone for PropertyCell<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Clone> PropertyCell<T> {
    pub fn new(value: T) -> Self {
        Self {
            inner: Arc::new(Mutex::new(value)),
        }
    }

    pub fn snapshot(&self) -> T {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn update<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let mut guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }
}

/// Authentication trust and diagnostic surface.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AuthProperties {
    pub trusted_data_enabled: bool,
    /// Last published verdict; `None` until the first publication.
    pub auth_passed: Option<bool>,
    /// Published only together with a passing verdict.
    pub nonce: Option<[u8; NONCE_LEN]>,
    /// Unix seconds of the last passing publication.
    pub last_publication: Option<i64>,
    /// First nonzero bus status seen. Never cleared.
    pub communication_error: Option<u8>,
    /// First nonzero coprocessor status seen. Never cleared.
    pub coprocessor_error: Option<u16>,
}

impl AuthProperties {
    pub(crate) fn note_communication_error(&mut self, status: u8) -> bool {
        if self.communication_error.is_some() {
            return false;
        }
        self.communication_error = Some(status);
        true
    }

    pub(crate) fn note_coprocessor_error(&mut self, status: u16) -> bool {
        if self.coprocessor_error.is_some() {
            return false;
        }
        self.coprocessor_error = Some(status);
        true
    }
}

/// Firmware updater diagnostic surface.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UpdaterProperties {
    pub communication_error: Option<u8>,
    pub updater_status: Option<u16>,
    pub battery_id: Option<u32>,
}

impl UpdaterProperties {
    /// Drop error reports at the start of an update and after each artifact.
    pub(crate) fn clear_errors(&mut self) {
        self.communication_error = None;
        self.updater_status = None;
    }
}
