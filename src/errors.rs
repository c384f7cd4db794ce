//! Typed error kinds the control flow branches on.
//!
//! Most fallible paths return `anyhow::Result` with context; the variants
//! here exist for the few places where the caller must distinguish the
//! failure kind (destroy-when-missing, the git freeze gate, reply
//! timeouts). They are matched with `anyhow` downcasts.

use thiserror::Error;

/// Errors with meaning beyond their message.
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// No runtime container matches the managed name. Success for destroy,
    /// failure for operations that need an existing container.
    #[error("unknown container")]
    UnknownContainer,

    /// A pull was requested while the container is paused.
    #[error("unable to perform pull while the container is frozen")]
    Frozen,

    /// No reply arrived for an outbound request within the deadline.
    #[error("timeout waiting for reply")]
    ReplyTimeout,

    /// The transport died; the supervisor loop should reconnect.
    #[error("connection closed")]
    ConnectionClosed,

    /// Server frame with an unrecognized realm/action combination.
    #[error("unknown message")]
    UnknownMessage,

    /// Action envelope with an unrecognized `type`.
    #[error("invalid action type")]
    InvalidActionType,

    /// Management action with an unrecognized sub-action.
    #[error("invalid management action type")]
    InvalidManagementAction,

    /// Power action with an unrecognized sub-action.
    #[error("unknown power action type")]
    InvalidPowerAction,
}

/// True when `err` is the unknown-container sentinel.
pub fn is_unknown_container(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<SupervisorError>(),
        Some(SupervisorError::UnknownContainer)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_container_downcast() {
        let err = anyhow::Error::from(SupervisorError::UnknownContainer);
        assert!(is_unknown_container(&err));

        let other = anyhow::anyhow!("some other failure");
        assert!(!is_unknown_container(&other));
    }

    #[test]
    fn test_wrapped_sentinel_is_not_matched() {
        // Context wrapping changes the downcast target chain root; the
        // sentinel stays reachable.
        let err = anyhow::Error::from(SupervisorError::UnknownContainer)
            .context("deleting container");
        assert!(is_unknown_container(&err));
    }

    #[test]
    fn test_messages() {
        assert_eq!(
            SupervisorError::ReplyTimeout.to_string(),
            "timeout waiting for reply"
        );
        assert_eq!(
            SupervisorError::UnknownContainer.to_string(),
            "unknown container"
        );
    }
}
