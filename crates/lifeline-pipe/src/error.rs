use thiserror::Error;

use crate::ReconnectError;

/// Errors surfaced by [`crate::BackedPipe`].
///
/// Cloneable so every caller joined on one reconnect attempt receives the
/// same outcome.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PipeError {
    #[error("pipe closed")]
    Closed,
    #[error("reconnect failed: {0}")]
    Reconnect(#[from] ReconnectError),
    #[error("reconnect attempt abandoned before completion")]
    Abandoned,
    #[error("replay from {requested} unavailable: oldest retained byte is {oldest}")]
    ReplayUnavailable { requested: u64, oldest: u64 },
    #[error("peer claims sequence {peer} but only {written} bytes were written")]
    InvalidSequence { peer: u64, written: u64 },
    #[error("replay write failed: {0}")]
    Replay(String),
}

impl PipeError {
    /// The pipe can never resume after this error; it closes with it.
    pub fn is_terminal(&self) -> bool {
        matches!(self, PipeError::ReplayUnavailable { .. })
    }
}

pub type Result<T> = std::result::Result<T, PipeError>;
