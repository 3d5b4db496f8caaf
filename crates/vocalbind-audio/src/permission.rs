//! Microphone permission.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

/// Answer from the platform's microphone permission model
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionStatus {
    Granted,
    Denied,
    /// The user has not answered yet
    Pending,
}

impl PermissionStatus {
    const fn to_u8(self) -> u8 {
        match self {
            Self::Granted => 0,
            Self::Denied => 1,
            Self::Pending => 2,
        }
    }

    const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Granted,
            1 => Self::Denied,
            _ => Self::Pending,
        }
    }
}

/// Queried by the lifecycle before any device is opened.
///
/// Implementations may show a platform prompt; when the answer is not known
/// yet they return [`PermissionStatus::Pending`] and later signal
/// `PlatformEvent::PermissionChanged`.
pub trait PermissionGate: Send {
    fn check_or_request(&self) -> PermissionStatus;
}

impl<F> PermissionGate for F
where
    F: Fn() -> PermissionStatus + Send,
{
    fn check_or_request(&self) -> PermissionStatus {
        self()
    }
}

/// Permission status shared between the platform layer (writer) and the
/// engine (reader)
#[derive(Debug, Clone)]
pub struct SharedPermission {
    status: Arc<AtomicU8>,
}

impl SharedPermission {
    pub fn new(status: PermissionStatus) -> Self {
        Self {
            status: Arc::new(AtomicU8::new(status.to_u8())),
        }
    }

    /// Hosts without a microphone permission model
    pub fn granted() -> Self {
        Self::new(PermissionStatus::Granted)
    }

    /// Record a new answer. Callers follow up with
    /// `PlatformEvent::PermissionChanged` so the engine re-evaluates.
    pub fn set(&self, status: PermissionStatus) {
        self.status.store(status.to_u8(), Ordering::Release);
    }

    pub fn status(&self) -> PermissionStatus {
        PermissionStatus::from_u8(self.status.load(Ordering::Acquire))
    }
}

impl Default for SharedPermission {
    fn default() -> Self {
        Self::granted()
    }
}

impl PermissionGate for SharedPermission {
    fn check_or_request(&self) -> PermissionStatus {
        self.status()
    }
}
