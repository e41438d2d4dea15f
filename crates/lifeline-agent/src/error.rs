use std::io;

use lifeline_pipe::PipeError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("too many immortal streams")]
    TooManyStreams,
    #[error("stream not found")]
    StreamNotFound,
    #[error("the connection was refused")]
    ConnectionRefused,
    #[error("already connected")]
    AlreadyConnected,
    #[error("stream is closed")]
    Closed,
    #[error("stream already started")]
    AlreadyStarted,
    #[error("timed out waiting for the stream to accept the connection")]
    HandshakeTimeout,
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),
    #[error("dial local service: {0}")]
    Dial(#[source] io::Error),
    #[error(transparent)]
    Pipe(#[from] PipeError),
}

impl Error {
    /// HTTP status the upgrade layer should answer with.
    pub fn status_code(&self) -> u16 {
        match self {
            Error::TooManyStreams => 503,
            Error::StreamNotFound | Error::ConnectionRefused => 404,
            Error::AlreadyConnected | Error::AlreadyStarted => 409,
            Error::Closed | Error::Pipe(PipeError::Closed) => 410,
            Error::HandshakeTimeout => 504,
            Error::HandshakeFailed(_) | Error::Dial(_) | Error::Pipe(_) => 500,
        }
    }

    /// Stable machine-readable code, for logs and error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            Error::TooManyStreams => "too_many_streams",
            Error::StreamNotFound => "not_found",
            Error::ConnectionRefused => "connection_refused",
            Error::AlreadyConnected => "already_connected",
            Error::AlreadyStarted => "already_started",
            Error::Closed | Error::Pipe(PipeError::Closed) => "closed",
            Error::HandshakeTimeout => "timeout",
            Error::HandshakeFailed(_) => "handshake_failed",
            Error::Dial(_) => "dial_failed",
            Error::Pipe(_) => "pipe",
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
