use std::fmt;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::watch;

use crate::BoxedTransport;

/// Why a [`Reconnector`] could not hand back a transport.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReconnectError {
    #[error("reconnection already in progress")]
    InProgress,
    #[error("stream is shutting down")]
    ShuttingDown,
    #[error("timeout waiting for reconnection response")]
    Timeout,
    #[error("reconnect cancelled")]
    Cancelled,
    #[error("{0}")]
    Transport(String),
}

/// A fresh transport plus the number of bytes its peer has already received.
pub struct Reconnected {
    pub transport: BoxedTransport,
    pub peer_read_seq: u64,
}

impl Reconnected {
    pub fn new(transport: BoxedTransport, peer_read_seq: u64) -> Self {
        Self {
            transport,
            peer_read_seq,
        }
    }
}

impl fmt::Debug for Reconnected {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reconnected")
            .field("peer_read_seq", &self.peer_read_seq)
            .finish_non_exhaustive()
    }
}

/// Read side of a shutdown flag. Resolves once the owner is closing.
#[derive(Debug, Clone)]
pub struct CancelSignal {
    rx: watch::Receiver<bool>,
}

impl CancelSignal {
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Waits until cancelled. Never resolves if the owner went away without
    /// cancelling.
    pub async fn cancelled(&mut self) {
        if self.rx.wait_for(|c| *c).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

impl From<watch::Receiver<bool>> for CancelSignal {
    fn from(rx: watch::Receiver<bool>) -> Self {
        Self { rx }
    }
}

/// Obtains a replacement transport for a [`crate::BackedPipe`].
///
/// `reader_seq` is the number of bytes the pipe has delivered to its
/// consumer; implementations pass it to the remote side so that side can
/// replay what we missed, and return what the remote side reports it has
/// received from us.
///
/// Implementations must return promptly once `cancel` fires.
#[async_trait]
pub trait Reconnector: Send + Sync + 'static {
    async fn reconnect(
        &self,
        cancel: CancelSignal,
        reader_seq: u64,
    ) -> Result<Reconnected, ReconnectError>;
}
