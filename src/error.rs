//! Error taxonomy for harness invocations
//!
//! Every failure aborts the single invocation it belongs to. Nothing here is
//! retried: a probe that fails to compile or a target that hangs is reported
//! with its kind so the calling test fails with the real cause.

use crate::record::ChildStatus;
use std::io;
use std::time::Duration;
use thiserror::Error;

/// Coarse classification of a [`HarnessError`], for assertions and reports
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Activation,
    Io,
    ChildExecution,
    Timeout,
    Config,
}

#[derive(Debug, Error)]
pub enum HarnessError {
    /// The tracer refused the probe definition (compile or enable failure)
    #[error("probe activation failed: {diagnostic}")]
    Activation { diagnostic: String },

    #[error("i/o failure while {action}: {source}")]
    Io {
        action: &'static str,
        #[source]
        source: io::Error,
    },

    /// The target ran but did not exit cleanly
    #[error("target {status}")]
    ChildExecution { status: ChildStatus },

    /// The tracer and its target were killed after the deadline expired
    #[error("invocation exceeded its {0:?} deadline")]
    Timeout(Duration),

    #[error("invalid harness configuration: {0}")]
    Config(String),
}

impl HarnessError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            HarnessError::Activation { .. } => ErrorKind::Activation,
            HarnessError::Io { .. } => ErrorKind::Io,
            HarnessError::ChildExecution { .. } => ErrorKind::ChildExecution,
            HarnessError::Timeout(_) => ErrorKind::Timeout,
            HarnessError::Config(_) => ErrorKind::Config,
        }
    }

    pub(crate) fn io(action: &'static str) -> impl FnOnce(io::Error) -> HarnessError {
        move |source| HarnessError::Io { action, source }
    }
}

pub type Result<T> = std::result::Result<T, HarnessError>;
