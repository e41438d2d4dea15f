use std::time::Duration;

use tokio::{sync::watch, task::JoinHandle};
use tracing::{Instrument, debug, info_span, warn};

use crate::{BackedPipe, LinkStatus, PipeError};

/// Exponential backoff between failed reconnect attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub max: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(500),
            max: Duration::from_secs(30),
        }
    }
}

impl BackoffPolicy {
    pub fn next(&self, current: Duration) -> Duration {
        (current * 2).min(self.max)
    }
}

/// Keeps a pipe attached from the dialing side.
///
/// Whenever the pipe is detached the supervisor calls
/// [`BackedPipe::force_reconnect`], backing off between failures, until it
/// is stopped or the pipe closes.
#[derive(Debug)]
pub struct Supervisor {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl Supervisor {
    pub fn spawn(pipe: BackedPipe, policy: BackoffPolicy) -> Self {
        let (stop, stop_rx) = watch::channel(false);
        let span = info_span!("pipe_supervisor");
        let handle = tokio::spawn(supervise(pipe, policy, stop_rx).instrument(span));
        Self { stop, handle }
    }

    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }

    /// Stops the loop and waits for it to exit. The pipe is left open.
    pub async fn stop(self) {
        self.stop.send_replace(true);
        if let Err(e) = self.handle.await {
            warn!(error = %e, "supervisor task failed");
        }
    }
}

async fn supervise(pipe: BackedPipe, policy: BackoffPolicy, mut stop: watch::Receiver<bool>) {
    let mut backoff = policy.initial;
    let mut link = pipe.subscribe_link();

    loop {
        if pipe.is_closed() {
            break;
        }

        if pipe.connected() {
            tokio::select! {
                _ = wait_detached(&mut link) => continue,
                _ = stopped(&mut stop) => break,
            }
        }

        let attempt = tokio::select! {
            r = pipe.force_reconnect() => r,
            _ = stopped(&mut stop) => break,
        };
        match attempt {
            Ok(()) => {
                backoff = policy.initial;
                continue;
            }
            Err(PipeError::Closed) => break,
            Err(e) if e.is_terminal() => {
                warn!(error = %e, "pipe cannot resume");
                break;
            }
            Err(e) => {
                warn!(error = %e, retry_in_ms = backoff.as_millis() as u64, "reconnect attempt failed");
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(backoff) => {}
            _ = stopped(&mut stop) => break,
        }
        backoff = policy.next(backoff);
    }

    debug!("supervisor exiting");
}

async fn wait_detached(rx: &mut watch::Receiver<LinkStatus>) {
    let _ = rx.wait_for(|l| !l.connected).await.map(|l| *l);
}

async fn stopped(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|s| *s).await.map(|s| *s);
}
