use thiserror::Error;

use super::types::Phase;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub(crate) enum StreamError {
    #[error("cannot {action} while the stream is {phase}")]
    InvalidPhase { action: &'static str, phase: Phase },
}
