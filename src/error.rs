//! Error taxonomy shared by every component of the populator.
//!
//! Adapters, the lease coordinator, the hypervisor client and the task
//! executors all speak this one enum, so the populators can propagate any
//! failure verbatim onto the quit channel.

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    #[error("invalid source disk path: {0}")]
    BadSource(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("ambiguous match: {0}")]
    Ambiguous(String),

    #[error("invalid lease identity {0:?}: must be a DNS-1123 label")]
    InvalidIdentity(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("host {0} reports no usable storage initiators")]
    NoInitiators(String),

    #[error("device {device} not visible on host {host} after {attempts} attempts")]
    DeviceNotVisible {
        device: String,
        host: String,
        attempts: u32,
    },

    #[error("host lease lost: {0}")]
    LeaseLost(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("clone failed (exit code {}): {stderr}", exit_code.as_deref().unwrap_or("none"))]
    CloneFailed {
        exit_code: Option<String>,
        stderr: String,
    },

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl Error {
    /// Only transport hiccups are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_))
    }

    pub fn is_permanent(&self) -> bool {
        !self.is_retryable()
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clone_failed_carries_stderr() {
        let err = Error::CloneFailed {
            exit_code: Some("1".to_string()),
            stderr: "disk full".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("disk full"));
        assert!(msg.contains("exit code 1"));
    }

    #[test]
    fn test_retryable_classification() {
        assert!(Error::Transport("reset".into()).is_retryable());
        assert!(Error::Unauthorized("bad token".into()).is_permanent());
        assert!(Error::Cancelled.is_permanent());
    }
}
