//! IL error taxonomy.

use thiserror::Error;

pub type IlResult<T> = Result<T, IlError>;

/// Error codes surfaced by the component API and by asynchronous `Error`
/// events.
///
/// Validation and protocol errors are returned synchronously from the call
/// that triggered them; anything discovered while dispatching a queued
/// message is reported through the `Error` event instead.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum IlError {
    #[error("insufficient resources")]
    InsufficientResources,
    #[error("undefined error")]
    Undefined,
    #[error("invalid component name")]
    InvalidComponentName,
    #[error("component not found")]
    ComponentNotFound,
    #[error("bad parameter")]
    BadParameter,
    #[error("not implemented")]
    NotImplemented,
    #[error("buffer underflow")]
    Underflow,
    #[error("buffer overflow")]
    Overflow,
    #[error("invalid state")]
    InvalidState,
    #[error("stream corrupt")]
    StreamCorrupt,
    #[error("ports are not compatible")]
    PortsNotCompatible,
    #[error("same state")]
    SameState,
    #[error("incorrect state transition")]
    IncorrectStateTransition,
    #[error("incorrect state operation")]
    IncorrectStateOperation,
    #[error("unsupported setting")]
    UnsupportedSetting,
    #[error("unsupported index")]
    UnsupportedIndex,
    #[error("bad port index")]
    BadPortIndex,
    #[error("port unpopulated")]
    PortUnpopulated,
    #[error("version mismatch")]
    VersionMismatch,
    #[error("timeout")]
    Timeout,
    #[error("content URI error")]
    ContentUriError,
    #[error("format not detected")]
    FormatNotDetected,
    #[error("component not ready")]
    NotReady,
    #[error("no more indices")]
    NoMore,
    #[error("port is being disabled")]
    PortIsDisabled,
}

impl IlError {
    /// Errors that are part of the normal control flow of the kernel and
    /// must not be propagated as failures (e.g. an empty mark queue).
    pub fn is_benign(self) -> bool {
        matches!(self, IlError::NoMore | IlError::NotReady)
    }
}
