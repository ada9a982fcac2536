// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Status codes shared by every runtime primitive.
//!
//! Errors are modeled as a `thiserror` enum; the raw integer encoding (0 = success, distinct
//! negative codes otherwise) is kept for callers that bridge to an integer-status ABI.

/// Result alias used across the runtime.
pub type Result<T> = core::result::Result<T, Status>;

/// Status delivered to callbacks: `Ok(())` or the reason the wait completed without data.
pub type CallbackStatus = Result<()>;

/// Error taxonomy of the runtime.
#[derive(Debug, Clone, Copy, thiserror::Error, PartialEq, Eq, Hash)]
pub enum Status {
    /// Unexpected internal failure.
    #[error("internal error")]
    Internal,
    /// Operation is not supported by this object.
    #[error("not supported")]
    NotSupported,
    /// A thread or other runtime resource could not be obtained.
    #[error("no resources")]
    NoResources,
    /// Memory reservation failed.
    #[error("no memory")]
    NoMemory,
    /// Invalid argument or argument combination.
    #[error("invalid args")]
    InvalidArgs,
    /// Operation is not applicable to this kind of object.
    #[error("wrong type")]
    WrongType,
    /// Object is in the wrong lifecycle state for the operation.
    #[error("bad state")]
    BadState,
    /// Deadline elapsed.
    #[error("timed out")]
    TimedOut,
    /// Nothing available yet; retry after a wait.
    #[error("should wait")]
    ShouldWait,
    /// Wait was canceled locally (cancel or dispatcher shutdown).
    #[error("canceled")]
    Canceled,
    /// Remote endpoint was closed.
    #[error("peer closed")]
    PeerClosed,
    /// Requested item does not exist.
    #[error("not found")]
    NotFound,
    /// Item already exists.
    #[error("already exists")]
    AlreadyExists,
    /// A registration of this kind is already outstanding.
    #[error("already bound")]
    AlreadyBound,
    /// Target is shutting down and accepts no new registrations.
    #[error("unavailable")]
    Unavailable,
    /// Caller lacks permission for the requested role or object.
    #[error("access denied")]
    AccessDenied,
    /// Value is outside the accepted range.
    #[error("out of range")]
    OutOfRange,
    /// Fixed capacity exhausted.
    #[error("no space")]
    NoSpace,
}

impl Status {
    const TABLE: [(Status, i32); 18] = [
        (Status::Internal, -1),
        (Status::NotSupported, -2),
        (Status::NoResources, -3),
        (Status::NoMemory, -4),
        (Status::InvalidArgs, -10),
        (Status::WrongType, -12),
        (Status::BadState, -20),
        (Status::TimedOut, -21),
        (Status::ShouldWait, -22),
        (Status::Canceled, -23),
        (Status::PeerClosed, -24),
        (Status::NotFound, -25),
        (Status::AlreadyExists, -26),
        (Status::AlreadyBound, -27),
        (Status::Unavailable, -28),
        (Status::AccessDenied, -30),
        (Status::OutOfRange, -40),
        (Status::NoSpace, -54),
    ];

    /// Integer code of this status.
    pub fn into_raw(self) -> i32 {
        Self::TABLE.iter().find(|(status, _)| *status == self).map(|(_, raw)| *raw).unwrap_or(-1)
    }

    /// Decodes a raw code; `0` is success, unknown negative codes map to [`Status::Internal`].
    pub fn from_raw(raw: i32) -> Result<()> {
        if raw == 0 {
            return Ok(());
        }
        Err(Self::TABLE
            .iter()
            .find(|(_, code)| *code == raw)
            .map(|(status, _)| *status)
            .unwrap_or(Status::Internal))
    }
}

/// Encodes a result as a raw integer status.
pub fn raw_status(result: &Result<()>) -> i32 {
    match result {
        Ok(()) => 0,
        Err(status) => status.into_raw(),
    }
}

impl From<nexus_alloc::AllocError> for Status {
    fn from(err: nexus_alloc::AllocError) -> Self {
        match err {
            nexus_alloc::AllocError::BadAlign => Status::InvalidArgs,
            nexus_alloc::AllocError::Overflow | nexus_alloc::AllocError::OutOfMemory => {
                Status::NoMemory
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_codes_match_integer_abi() {
        assert_eq!(Status::BadState.into_raw(), -20);
        assert_eq!(Status::PeerClosed.into_raw(), -24);
        assert_eq!(Status::OutOfRange.into_raw(), -40);
        assert_eq!(raw_status(&Ok(())), 0);
    }

    #[test]
    fn decoding_unknown_code_is_internal() {
        assert_eq!(Status::from_raw(0), Ok(()));
        assert_eq!(Status::from_raw(-27), Err(Status::AlreadyBound));
        assert_eq!(Status::from_raw(-999), Err(Status::Internal));
    }
}
