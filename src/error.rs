use std::{error::Error, fmt};

/// The hook module's result type.
pub type Result<T> = std::result::Result<T, HookErr>;

/// Failures carried through a `CommFuture` once communication has been launched.
///
/// Cloneable so that every reader of a shared future observes the same error.
#[derive(Debug, Clone, PartialEq)]
pub enum CommErr {
    /// A participant of the collective can no longer be reached.
    PeerUnreachable { rank: usize },
    /// The participants launched incompatible collectives.
    CollectiveMismatch { op: &'static str, detail: String },
    /// The process group was torn down.
    Aborted(String),
    /// The writing end of the future went away without assigning a value.
    Dropped,
    /// The arguments of a collective were rejected before launching.
    InvalidInput(String),
    /// The foreign callback raised.
    ForeignCall(String),
}

impl fmt::Display for CommErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PeerUnreachable { rank } => write!(f, "peer {rank} is unreachable"),
            Self::CollectiveMismatch { op, detail } => {
                write!(f, "collective mismatch in {op}: {detail}")
            }
            Self::Aborted(reason) => write!(f, "process group aborted: {reason}"),
            Self::Dropped => f.write_str("completion dropped before a value was assigned"),
            Self::InvalidInput(detail) => write!(f, "invalid input: {detail}"),
            Self::ForeignCall(detail) => write!(f, "foreign hook raised: {detail}"),
        }
    }
}

impl Error for CommErr {}

/// Errors surfaced to the dispatcher by a communication hook.
#[derive(Debug)]
pub enum HookErr {
    /// The hook could not even launch communication for a bucket.
    Start { bucket: Option<usize>, reason: String },
    /// The asynchronous work failed after launch.
    Communication(CommErr),
    /// The resolved value doesn't match what the bucket expects.
    ResultShape {
        bucket: Option<usize>,
        expected: usize,
        got: usize,
    },
    /// The dispatcher has no gradient storage for a bucket index.
    UnknownBucket(usize),
    /// A hook was registered at the wrong time.
    Registration(&'static str),
}

impl HookErr {
    pub(crate) fn start(reason: impl Into<String>) -> Self {
        Self::Start {
            bucket: None,
            reason: reason.into(),
        }
    }

    pub(crate) fn result_shape(expected: usize, got: usize) -> Self {
        Self::ResultShape {
            bucket: None,
            expected,
            got,
        }
    }

    /// Attaches the dispatcher's bucket index to the error, when it carries one.
    pub(crate) fn in_bucket(self, index: usize) -> Self {
        match self {
            Self::Start { reason, .. } => Self::Start {
                bucket: Some(index),
                reason,
            },
            Self::ResultShape { expected, got, .. } => Self::ResultShape {
                bucket: Some(index),
                expected,
                got,
            },
            other => other,
        }
    }
}

impl fmt::Display for HookErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Start {
                bucket: Some(index),
                reason,
            } => write!(f, "failed to start bucket {index}: {reason}"),
            Self::Start { reason, .. } => write!(f, "failed to start bucket: {reason}"),
            Self::Communication(e) => write!(f, "communication failure: {e}"),
            Self::ResultShape {
                bucket,
                expected,
                got,
            } => {
                if let Some(index) = bucket {
                    write!(f, "result shape mismatch in bucket {index}: ")?;
                } else {
                    f.write_str("result shape mismatch: ")?;
                }
                write!(f, "got {got}, expected {expected}")
            }
            Self::UnknownBucket(index) => write!(f, "no gradients are stored for bucket {index}"),
            Self::Registration(detail) => write!(f, "hook registration: {detail}"),
        }
    }
}

impl Error for HookErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Communication(e) => Some(e),
            _ => None,
        }
    }
}

impl From<CommErr> for HookErr {
    fn from(value: CommErr) -> Self {
        Self::Communication(value)
    }
}
