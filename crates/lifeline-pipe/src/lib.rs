//! Sequenced, reconnectable byte pipes.
//!
//! A [`BackedPipe`] carries a byte stream across any number of underlying
//! transports. Every byte written is numbered and retained in a bounded
//! window, so when a transport is replaced the peer can say how far it got
//! and the pipe replays exactly the remainder.
//!
//! Acquiring a replacement transport is delegated to a [`Reconnector`].

mod buffer;
mod error;
mod pipe;
mod reconnector;
mod supervisor;

pub use buffer::RetainedBuffer;
pub use error::{PipeError, Result};
pub use pipe::{BackedPipe, LinkStatus};
pub use reconnector::{CancelSignal, ReconnectError, Reconnected, Reconnector};
pub use supervisor::{BackoffPolicy, Supervisor};

use tokio::io::{AsyncRead, AsyncWrite};

/// Default size of the retained-write window.
pub const DEFAULT_REPLAY_WINDOW_BYTES: usize = 4 * 1024 * 1024;

/// Any bidirectional byte stream that can back a pipe.
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> Transport for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

pub type BoxedTransport = Box<dyn Transport>;
