//! Error types for cart reads and coordinated updates.

use thiserror::Error;

use crate::cart::CartId;

/// Failure of a single store command (or batch).
#[derive(Debug, Error)]
pub enum StoreError {
    /// The caller's deadline passed before the command completed.
    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// A string command hit a list key or vice versa.
    #[error("WRONGTYPE operation against key {key} holding the wrong kind of value")]
    WrongType { key: String },

    /// Transport or server error reported by the backend.
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

impl StoreError {
    pub fn is_deadline_exceeded(&self) -> bool {
        matches!(self, Self::DeadlineExceeded)
    }
}

/// Errors surfaced by [`crate::CartReader`] and [`crate::CartUpdater`].
///
/// Variants that can occur after the cart lock was taken carry the outcome of
/// the best-effort release in `release`: `None` means the lock was released
/// (or was never held), `Some` is the error the release itself hit.
#[derive(Debug, Error)]
pub enum CartError {
    #[error("update context carries no deadline; the cart lock expiry cannot be bounded")]
    Configuration,

    #[error("cart id must not be empty")]
    InvalidCartId,

    #[error("error acquiring lock for cart {cart_id}: {source}{}", release_note(.release))]
    LockAcquisition {
        cart_id: CartId,
        #[source]
        source: StoreError,
        release: Option<StoreError>,
    },

    #[error("timed out waiting for lock on cart {cart_id}")]
    LockTimeout { cart_id: CartId },

    #[error("error getting cart {cart_id}: {source}{}", release_note(.release))]
    Read {
        cart_id: CartId,
        #[source]
        source: StoreError,
        release: Option<StoreError>,
    },

    #[error("error decoding cart {cart_id}: {source}{}", release_note(.release))]
    Deserialization {
        cart_id: CartId,
        #[source]
        source: serde_json::Error,
        release: Option<StoreError>,
    },

    #[error("error saving cart {cart_id}: {source}{}", release_note(.release))]
    Commit {
        cart_id: CartId,
        #[source]
        source: StoreError,
        release: Option<StoreError>,
    },
}

impl CartError {
    /// Only a lock timeout is worth retrying, and only with a fresh deadline.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::LockTimeout { .. })
    }

    /// The release failure attached to this error, if any.
    pub fn release_error(&self) -> Option<&StoreError> {
        match self {
            Self::LockAcquisition { release, .. }
            | Self::Read { release, .. }
            | Self::Deserialization { release, .. }
            | Self::Commit { release, .. } => release.as_ref(),
            _ => None,
        }
    }
}

fn release_note(release: &Option<StoreError>) -> String {
    match release {
        Some(err) => format!(" (lock release also failed: {err})"),
        None => String::new(),
    }
}
