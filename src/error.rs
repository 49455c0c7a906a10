//! Error taxonomy (§7).
//!
//! `KernelError` covers facet- and subcluster-manager-level failures.
//! `SyscallError` keeps the spec's explicit two-arm `('ok'|'error', ..)`
//! shape for the vat syscall boundary: a syscall either returns a value or
//! a message, never a richer `KernelError`, so the compromise marker
//! (`VatHandle::mark_compromised`) is set at exactly the one call site that
//! matches the `Err` arm.

use thiserror::Error;

use crate::ids::{EndpointId, KRef, SubclusterId};

pub type KernelResult<T> = Result<T, KernelError>;

/// Top-level kernel error taxonomy, one variant per row of §7.
#[derive(Debug, Error)]
pub enum KernelError {
    #[error("invalid cluster config: {0}")]
    InvalidClusterConfig(String),

    #[error("subcluster {0} not found")]
    SubclusterNotFound(SubclusterId),

    #[error("kernel service {0} is not registered")]
    KernelServiceMissing(String),

    #[error("vat {0} is compromised")]
    VatCompromised(EndpointId),

    #[error("object {0} has been revoked")]
    ObjectRevoked(KRef),

    #[error("syscall failed: {0}")]
    SyscallFailed(String),

    #[error("no savepoint named {0} on the current crank")]
    SavepointMissing(String),

    #[error("crank protocol violation: {0}")]
    CrankProtocol(String),

    #[error("store corruption: {0}")]
    StoreCorruption(String),
}

impl KernelError {
    /// `SavepointMissing`, `CrankProtocol`, and `StoreCorruption` are
    /// programming errors or unrecoverable storage failures (§7): the
    /// scheduler poisons the kernel instead of surfacing them as a
    /// rejected result promise.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            KernelError::SavepointMissing(_)
                | KernelError::CrankProtocol(_)
                | KernelError::StoreCorruption(_)
        )
    }
}

/// The result of executing a vat syscall: `['ok', T]` or `['error', msg]`.
///
/// Kept distinct from `KernelResult` so that callers are forced to thread
/// the two-arm shape all the way out to `VatHandle::apply_syscall`, which is
/// the single place that flips a vat to `Compromised`.
pub type SyscallResult<T> = Result<T, SyscallError>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct SyscallError(pub String);

impl SyscallError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl From<KernelError> for SyscallError {
    fn from(err: KernelError) -> Self {
        SyscallError(err.to_string())
    }
}

/// Persistence-layer failures, private to the store module and converted to
/// `KernelError::StoreCorruption` at the store's public boundary — mirrors
/// `knhk-lockchain::storage::StorageError` wrapping `sled`/serialization
/// errors via `#[from]`.
#[derive(Debug, Error)]
pub(crate) enum StoreError {
    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("malformed value at key {key}: {reason}")]
    MalformedValue { key: String, reason: String },
}

impl From<StoreError> for KernelError {
    fn from(err: StoreError) -> Self {
        KernelError::StoreCorruption(err.to_string())
    }
}
