/// Terminal status of a partial run and of the public entry points.
///
/// Callers match on the variant to tell a requested stop (`Cancelled`) apart
/// from a genuine compute failure (`KernelFailure`).
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Malformed bounds, unknown names, dtype/shape mismatches, unavailable
    /// inputs, fetches outside the executed range, bad kernel parameters.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Host memory exhaustion or a custom allocator refusing an output.
    #[error("allocation failure: {0}")]
    AllocationFailure(String),

    /// A node's kernel returned an error or panicked.
    #[error("kernel failure in node {node} ({op}): {cause:#}")]
    KernelFailure {
        node: String,
        op: String,
        cause: anyhow::Error,
    },

    /// The cancellation token was observed during the run.
    #[error("run cancelled")]
    Cancelled,

    /// Stream worker or planning failures.
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl Error {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Error::InvalidArgument(msg.into())
    }

    pub fn allocation(msg: impl Into<String>) -> Self {
        Error::AllocationFailure(msg.into())
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }

    pub fn is_invalid_argument(&self) -> bool {
        matches!(self, Error::InvalidArgument(_))
    }

    /// Classify an error raised inside a kernel body.
    ///
    /// Typed invalid-argument reports survive; anything else is attributed to
    /// the failing node.
    pub(crate) fn from_kernel(node: &str, op: &str, err: anyhow::Error) -> Self {
        match err.downcast::<Error>() {
            Ok(Error::InvalidArgument(msg)) => Error::InvalidArgument(msg),
            Ok(other) => Error::KernelFailure {
                node: node.to_string(),
                op: op.to_string(),
                cause: anyhow::Error::new(other),
            },
            Err(cause) => Error::KernelFailure {
                node: node.to_string(),
                op: op.to_string(),
                cause,
            },
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
