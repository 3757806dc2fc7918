//! Supervisor error type. Separates worker-connectivity failures, which the
//! manager recovers from, from everything else, which it propagates.

use std::io;

/// Errors raised while supervising a worker.
#[derive(thiserror::Error, Debug)]
pub enum SupervisorError {
    /// The worker went away: reset, broken pipe, or the channel hit EOF.
    #[error("worker disconnected: {0}")]
    Disconnected(#[source] io::Error),

    #[error("failed to fork worker: {0}")]
    Fork(#[source] nix::Error),

    #[error("failed to signal worker {pid}: {source}")]
    Signal {
        pid: i32,
        #[source]
        source: nix::Error,
    },

    #[error("IPC error: {0}")]
    Io(#[source] io::Error),

    #[error("lock poisoned")]
    LockPoisoned,
}

impl SupervisorError {
    /// True for the "connection reset"/"broken pipe" class that signals a
    /// dead but not yet reaped worker.
    pub fn is_disconnect(&self) -> bool {
        matches!(self, Self::Disconnected(_))
    }

    /// Machine readable error code
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Disconnected(_) => "WORKER_DISCONNECTED",
            Self::Fork(_) => "FORK_FAILED",
            Self::Signal { .. } => "SIGNAL_FAILED",
            Self::Io(_) => "IPC_ERROR",
            Self::LockPoisoned => "LOCK_POISONED",
        }
    }
}

/// Returns true for I/O error kinds that mean the peer is gone.
pub fn is_disconnect_kind(kind: io::ErrorKind) -> bool {
    matches!(
        kind,
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionAborted
    )
}

impl From<io::Error> for SupervisorError {
    fn from(err: io::Error) -> Self {
        if is_disconnect_kind(err.kind()) {
            Self::Disconnected(err)
        } else {
            Self::Io(err)
        }
    }
}

impl From<nix::Error> for SupervisorError {
    fn from(errno: nix::Error) -> Self {
        io::Error::from(errno).into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reset_and_pipe_are_disconnects() {
        for kind in [io::ErrorKind::ConnectionReset, io::ErrorKind::BrokenPipe, io::ErrorKind::UnexpectedEof] {
            let err = SupervisorError::from(io::Error::new(kind, "gone"));
            assert!(err.is_disconnect(), "{:?} should be a disconnect", kind);
            assert_eq!(err.error_code(), "WORKER_DISCONNECTED");
        }
    }

    #[test]
    fn test_other_io_errors_are_not_disconnects() {
        let err = SupervisorError::from(io::Error::new(io::ErrorKind::PermissionDenied, "nope"));
        assert!(!err.is_disconnect());
        assert_eq!(err.error_code(), "IPC_ERROR");
    }

    #[test]
    fn test_errno_epipe_maps_to_disconnect() {
        let err = SupervisorError::from(nix::errno::Errno::EPIPE);
        assert!(err.is_disconnect());
        let err = SupervisorError::from(nix::errno::Errno::ECONNRESET);
        assert!(err.is_disconnect());
    }

    #[test]
    fn test_lock_poisoned_code() {
        let err = SupervisorError::LockPoisoned;
        assert_eq!(err.to_string(), "lock poisoned");
        assert_eq!(err.error_code(), "LOCK_POISONED");
        assert!(!err.is_disconnect());
    }
}
