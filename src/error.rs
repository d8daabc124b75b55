use thiserror::Error;

/// Failure of an image push.
///
/// Errors are cloneable so that every step handle sharing a failed
/// predecessor observes the same root cause instead of a rewrapped one.
#[derive(Clone, Debug, Eq, PartialEq, Error)]
pub enum PushError {
    #[error("registry {host} requires credentials for scope {scope}")]
    AuthRequired { host: String, scope: String },

    #[error("registry {host} denied access for scope {scope}")]
    AuthInsufficient { host: String, scope: String },

    #[error("giving up after {attempts} attempts, last failure: {last}")]
    NetworkExhausted { attempts: u32, last: String },

    #[error("registry refused request with status {status}: {body}")]
    RegistryRefused { status: u16, body: String },

    #[error("digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },

    #[error("registry rejected manifest media type {media_type} (status {status})")]
    ManifestUnsupported { status: u16, media_type: String },

    #[error("push cancelled")]
    Cancelled,

    #[error("internal error: {0}")]
    Internal(String),
}

impl PushError {
    /// Whether the failure is the cancellation signal rather than a real
    /// error. The top-level call reports any non-cancelled failure in
    /// preference to this one.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, PushError::Cancelled)
    }
}
