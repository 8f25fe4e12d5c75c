//! Error types for the resource-governance layer.
//!
//! Every suspending primitive fails with a [`GovernanceError`] rather than
//! panicking, so handlers can map resource exhaustion to a user-facing
//! "try again later" response.

use thiserror::Error;

/// Errors raised by semaphores, queues, rate limiters, and the backpressure registry.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GovernanceError {
    /// A pending `acquire` waited longer than the semaphore's timeout.
    #[error("Semaphore acquire timeout after {timeout_ms}ms")]
    SemaphoreTimeout {
        /// Name of the semaphore that timed out.
        name: String,
        /// Permit limit of the semaphore.
        max: usize,
        /// Configured timeout in milliseconds.
        timeout_ms: u64,
    },

    /// `add` was called on a queue that is already at capacity.
    #[error("Queue '{name}' is full ({max} items)")]
    QueueFull {
        /// Name of the full queue.
        name: String,
        /// Capacity of the queue.
        max: usize,
    },

    /// A suspending call observed its cancellation token before completing.
    #[error("{resource} wait cancelled")]
    Cancelled {
        /// Name of the resource being waited on.
        resource: String,
    },

    /// A queue name was reused with a different item type.
    #[error("queue '{name}' is already registered with a different item type")]
    QueueTypeMismatch {
        /// The conflicting queue name.
        name: String,
    },

    /// A background timer was started outside of a Tokio runtime.
    #[error("cannot start {component}: no Tokio runtime is running")]
    NoRuntime {
        /// The component whose timer could not be spawned.
        component: &'static str,
    },
}

impl GovernanceError {
    /// `true` for errors that mean "the resource is saturated right now".
    pub fn is_resource_exhausted(&self) -> bool {
        matches!(
            self,
            Self::SemaphoreTimeout { .. } | Self::QueueFull { .. }
        )
    }

    /// Name of the resource involved, when there is one.
    pub fn resource(&self) -> Option<&str> {
        match self {
            Self::SemaphoreTimeout { name, .. }
            | Self::QueueFull { name, .. }
            | Self::QueueTypeMismatch { name } => Some(name),
            Self::Cancelled { resource } => Some(resource),
            Self::NoRuntime { .. } => None,
        }
    }

    /// Capacity limit of the exhausted resource, when known.
    pub fn limit(&self) -> Option<usize> {
        match self {
            Self::SemaphoreTimeout { max, .. } | Self::QueueFull { max, .. } => Some(*max),
            _ => None,
        }
    }
}

/// Convenience alias used throughout the governance modules.
pub type GovernanceResult<T> = Result<T, GovernanceError>;
