use std::time::Duration;

use jupyter_wire::{CodecError, ReplyError, ReplyStatus};

/// Errors surfaced to callers of the kernel layer.
///
/// `Clone` because a settled [`KernelFuture`](crate::KernelFuture) hands the
/// same error to every holder awaiting it.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum KernelError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("kernel replied {status}: {ename}: {evalue}")]
    Kernel {
        status: ReplyStatus,
        ename: String,
        evalue: String,
        traceback: Vec<String>,
    },

    #[error("kernel restarted before the request completed")]
    KernelRestarted,

    #[error("kernel died before the request completed")]
    KernelDied,

    #[error("kernel is dead; restart it before sending requests")]
    KernelDead,

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("session was shut down")]
    SessionShutdown,

    #[error("request was disposed")]
    Disposed,

    #[error("session has no kernel connection")]
    NotConnected,

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("kernel provider error: {0}")]
    Provider(String),
}

pub type Result<T> = std::result::Result<T, KernelError>;

impl KernelError {
    /// Build the rejection for a reply whose status is not `ok`.
    pub fn from_reply(status: ReplyStatus, error: Option<ReplyError>) -> Self {
        let error = error.unwrap_or_else(|| ReplyError {
            ename: match status {
                ReplyStatus::Abort => "Aborted".to_string(),
                _ => "UnknownError".to_string(),
            },
            evalue: String::new(),
            traceback: Vec::new(),
        });
        KernelError::Kernel {
            status,
            ename: error.ename,
            evalue: error.evalue,
            traceback: error.traceback,
        }
    }

    /// Whether the kernel aborted the request rather than failing it.
    pub fn is_abort(&self) -> bool {
        matches!(
            self,
            KernelError::Kernel {
                status: ReplyStatus::Abort,
                ..
            }
        )
    }
}

impl From<CodecError> for KernelError {
    fn from(err: CodecError) -> Self {
        KernelError::Protocol(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_reply_with_error_fields() {
        let err = KernelError::from_reply(
            ReplyStatus::Error,
            Some(ReplyError {
                ename: "ValueError".into(),
                evalue: "x".into(),
                traceback: vec!["tb".into()],
            }),
        );
        assert_eq!(err.to_string(), "kernel replied error: ValueError: x");
        assert!(!err.is_abort());
    }

    #[test]
    fn test_from_abort_without_fields() {
        let err = KernelError::from_reply(ReplyStatus::Abort, None);
        assert!(err.is_abort());
        match err {
            KernelError::Kernel { ename, .. } => assert_eq!(ename, "Aborted"),
            other => panic!("unexpected error: {:?}", other),
        }
    }
}
