use beacon_core::ErrorKind;
use thiserror::Error;

/// Why a script execution did not produce usable output.
#[derive(Debug, Error)]
pub enum SandboxError {
    /// The wall-clock budget ran out before `run()` returned.
    #[error("execution timed out after {ms}ms")]
    Timeout { ms: u64 },

    /// `run()` returned something that is not a JSON object or array.
    #[error("invalid output: {0}")]
    InvalidOutput(String),

    /// The script threw, failed to parse, or hit a runtime limit.
    #[error("script error: {0}")]
    Script(String),

    /// The caller withdrew the execution before it finished.
    #[error("execution cancelled")]
    Cancelled,

    /// The interpreter itself could not be set up or crashed.
    #[error("sandbox failure: {0}")]
    Fatal(String),
}

impl SandboxError {
    /// Severity class deciding whether the recurrence continues.
    pub fn kind(&self) -> ErrorKind {
        match self {
            SandboxError::Fatal(_) => ErrorKind::Fatal,
            SandboxError::Timeout { .. }
            | SandboxError::InvalidOutput(_)
            | SandboxError::Script(_)
            | SandboxError::Cancelled => ErrorKind::Continue,
        }
    }
}

pub type Result<T> = std::result::Result<T, SandboxError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_sandbox_failures_are_fatal() {
        assert_eq!(SandboxError::Timeout { ms: 10 }.kind(), ErrorKind::Continue);
        assert_eq!(SandboxError::InvalidOutput("x".into()).kind(), ErrorKind::Continue);
        assert_eq!(SandboxError::Script("x".into()).kind(), ErrorKind::Continue);
        assert_eq!(SandboxError::Cancelled.kind(), ErrorKind::Continue);
        assert_eq!(SandboxError::Fatal("x".into()).kind(), ErrorKind::Fatal);
    }

    #[test]
    fn messages_name_the_failure() {
        assert!(SandboxError::Timeout { ms: 250 }
            .to_string()
            .starts_with("execution timed out"));
        assert!(SandboxError::InvalidOutput("eof".into())
            .to_string()
            .starts_with("invalid output"));
    }
}
