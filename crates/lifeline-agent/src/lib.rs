//! Agent side of immortal streams.
//!
//! The [`Manager`] owns a bounded set of [`Stream`]s. Each stream keeps one
//! connection to a local service open and bridges it onto a
//! [`lifeline_pipe::BackedPipe`]; remote clients come and go through
//! [`Manager::handle_connection`] without the local service noticing.

mod config;
pub mod dialer;
mod error;
mod manager;
pub mod names;
mod stream;
pub mod telemetry;
mod view;

pub use config::Config;
pub use dialer::{Dialer, InternalListener, InternalListeners, LocalDialer, is_connection_refused};
pub use error::{Error, Result};
pub use manager::Manager;
pub use stream::Stream;
pub use view::StreamView;
