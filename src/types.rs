/// Core error types shared by every component of the launcher
use thiserror::Error;

/// Errors surfaced by the isolation pipeline.
///
/// Every variant is machine-distinguishable; `kind()` yields the stable
/// classification string used as the diagnostic prefix on stderr.
#[derive(Error, Debug)]
pub enum IsolateError {
    /// Unrecoverable policy-level issue (explicit capability file missing
    /// or unreadable). Per-line problems are warnings, never this.
    #[error("cannot read capability file: {0}")]
    PolicyParse(String),

    /// The policy references something the host cannot satisfy
    /// (named principal missing, invalid limit).
    #[error("policy violation: {0}")]
    PolicyViolation(String),

    /// Caller lacks the privilege required by the host primitives.
    #[error("insufficient privilege: {0}")]
    Unprivileged(String),

    /// A host primitive that is defined fatal failed.
    #[error("host primitive {primitive} failed: {source}")]
    Primitive {
        primitive: &'static str,
        #[source]
        source: std::io::Error,
    },

    /// Process image replacement failed after attach.
    #[error("payload launch failed: {0}")]
    Launch(String),

    /// External cancellation arrived during provisioning.
    #[error("aborted by signal during provisioning")]
    Aborted,
}

impl IsolateError {
    /// Stable classification name for diagnostics and tests.
    pub fn kind(&self) -> &'static str {
        match self {
            IsolateError::PolicyParse(_) => "PolicyParse",
            IsolateError::PolicyViolation(_) => "PolicyViolation",
            IsolateError::Unprivileged(_) => "Unprivileged",
            IsolateError::Primitive { .. } => "PrimitiveFailed",
            IsolateError::Launch(_) => "LaunchFailed",
            IsolateError::Aborted => "Aborted",
        }
    }

    /// Actionable suggestion appended to the principal diagnostic, when
    /// one exists for the error class.
    pub fn suggestion(&self) -> Option<&'static str> {
        match self {
            IsolateError::Unprivileged(_) => {
                Some("re-run under a privilege-raising wrapper such as doas or sudo")
            }
            _ => None,
        }
    }

    /// Wrap an I/O failure from a named host primitive.
    pub fn primitive(primitive: &'static str, source: std::io::Error) -> Self {
        IsolateError::Primitive { primitive, source }
    }

    /// Wrap an errno from a named host primitive.
    pub fn primitive_errno(primitive: &'static str, errno: nix::errno::Errno) -> Self {
        IsolateError::Primitive {
            primitive,
            source: std::io::Error::from_raw_os_error(errno as i32),
        }
    }
}

/// Result type alias for launcher operations
pub type Result<T> = std::result::Result<T, IsolateError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_are_stable() {
        assert_eq!(IsolateError::PolicyParse(String::new()).kind(), "PolicyParse");
        assert_eq!(IsolateError::Aborted.kind(), "Aborted");
        assert_eq!(
            IsolateError::primitive("bind_mount", std::io::Error::from_raw_os_error(1)).kind(),
            "PrimitiveFailed"
        );
    }

    #[test]
    fn unprivileged_carries_a_suggestion() {
        let err = IsolateError::Unprivileged("isolation requires root".to_string());
        assert!(err.suggestion().unwrap().contains("doas"));
        assert!(IsolateError::Aborted.suggestion().is_none());
    }
}
