use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lifeline_pipe::{
    BackedPipe, BoxedTransport, CancelSignal, PipeError, ReconnectError, Reconnected, Reconnector,
};
use parking_lot::Mutex;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf},
    sync::{Notify, mpsc, oneshot, watch},
    task::JoinHandle,
    time::Instant,
};
use tracing::{Instrument, Span, debug, info, info_span, warn};
use uuid::Uuid;

use crate::{Config, Error, Result, StreamView};

const COPY_BUF_BYTES: usize = 32 * 1024;

type Response = std::result::Result<Reconnected, ReconnectError>;
type Outcome = lifeline_pipe::Result<()>;

/// A reconnect the pipe is waiting on. Answered once, by a handshake or by
/// shutdown.
struct ReconnectRequest {
    attempt: u64,
    reader_seq: u64,
    respond: oneshot::Sender<Response>,
}

struct StreamState {
    last_connection_at: DateTime<Utc>,
    last_disconnection_at: Option<DateTime<Utc>>,
    connected: bool,
    closed: bool,
    /// Set from the moment the pipe asks for a transport until the reconnect
    /// worker sees the attempt finish.
    handshake_pending: bool,
    pending: Option<ReconnectRequest>,
    /// The handshake that answered the attempt in flight waits here for the
    /// pipe's verdict.
    answered: Option<(u64, oneshot::Sender<Outcome>)>,
    attempt: u64,
}

struct Shared {
    state: Mutex<StreamState>,
    changed: Notify,
    pokes: mpsc::Sender<()>,
    disconnects: mpsc::Sender<()>,
    shutdown: watch::Sender<bool>,
    response_timeout: Duration,
}

impl Shared {
    /// Asks the reconnect worker to look at the stream. Pokes coalesce.
    fn poke(&self) {
        let _ = self.pokes.try_send(());
    }

    fn signal_disconnect(&self) {
        if self.state.lock().closed {
            return;
        }
        let _ = self.disconnects.try_send(());
    }

    fn mark_disconnected(&self, reason: &str) {
        {
            let mut state = self.state.lock();
            if !state.connected {
                return;
            }
            state.connected = false;
            state.last_disconnection_at = Some(Utc::now());
        }
        info!(reason, "stream disconnected");
        self.changed.notify_waiters();
    }

    /// Flips the stream to closed and wakes everything waiting on it. Returns
    /// false if it was already closed.
    fn begin_close(&self) -> bool {
        {
            let mut state = self.state.lock();
            if state.closed {
                return false;
            }
            state.closed = true;
            state.connected = false;
            state.handshake_pending = false;
            state.answered = None;
            if let Some(request) = state.pending.take() {
                let _ = request.respond.send(Err(ReconnectError::ShuttingDown));
            }
        }
        self.shutdown.send_replace(true);
        self.changed.notify_waiters();
        true
    }

    /// Drops the request for `attempt` if nobody took it.
    fn withdraw(&self, attempt: u64) {
        let mut state = self.state.lock();
        if state.pending.as_ref().is_some_and(|r| r.attempt == attempt) {
            state.pending = None;
            state.handshake_pending = false;
            drop(state);
            self.changed.notify_waiters();
        }
    }
}

/// Hands the pipe whatever transport the next handshake brings.
struct StreamReconnector {
    shared: Arc<Shared>,
}

#[async_trait]
impl Reconnector for StreamReconnector {
    async fn reconnect(&self, mut cancel: CancelSignal, reader_seq: u64) -> Response {
        let (respond, response) = oneshot::channel();
        let attempt = {
            let mut state = self.shared.state.lock();
            if state.pending.is_some() {
                return Err(ReconnectError::InProgress);
            }
            if state.closed {
                return Err(ReconnectError::ShuttingDown);
            }
            state.attempt += 1;
            let attempt = state.attempt;
            state.pending = Some(ReconnectRequest {
                attempt,
                reader_seq,
                respond,
            });
            state.handshake_pending = true;
            if state.connected {
                state.connected = false;
                state.last_disconnection_at = Some(Utc::now());
            }
            attempt
        };
        debug!(reader_seq, attempt, "pending reconnect set");
        self.shared.changed.notify_waiters();

        let mut shutdown = self.shared.shutdown.subscribe();
        let outcome = tokio::select! {
            biased;
            r = response => r.unwrap_or(Err(ReconnectError::ShuttingDown)),
            _ = cancel.cancelled() => Err(ReconnectError::Cancelled),
            _ = wait_shutdown(&mut shutdown) => Err(ReconnectError::ShuttingDown),
            _ = tokio::time::sleep(self.shared.response_timeout) => Err(ReconnectError::Timeout),
        };

        match &outcome {
            Ok(r) => debug!(attempt, peer_read_seq = r.peer_read_seq, "reconnect answered"),
            Err(e) => {
                debug!(attempt, error = %e, "reconnect request ended without a transport");
                self.shared.withdraw(attempt);
            }
        }
        outcome
    }
}

/// One immortal stream: a local service connection bridged onto a
/// [`BackedPipe`] that clients attach to and detach from over time.
pub struct Stream {
    id: Uuid,
    name: String,
    port: u16,
    created_at: DateTime<Utc>,
    handshake_timeout: Duration,
    shared: Arc<Shared>,
    pipe: BackedPipe,
    disconnects: Mutex<Option<mpsc::Receiver<()>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    span: Span,
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("port", &self.port)
            .field("pipe", &self.pipe)
            .finish_non_exhaustive()
    }
}

impl Stream {
    /// Builds the stream and its reconnect worker. Must be called inside a
    /// Tokio runtime.
    pub fn new(id: Uuid, name: String, port: u16, config: &Config) -> Self {
        let now = Utc::now();
        let (pokes, pokes_rx) = mpsc::channel(1);
        let (disconnects, disconnects_rx) = mpsc::channel(1);
        let (shutdown, _) = watch::channel(false);

        let shared = Arc::new(Shared {
            state: Mutex::new(StreamState {
                last_connection_at: now,
                last_disconnection_at: None,
                connected: false,
                closed: false,
                handshake_pending: false,
                pending: None,
                answered: None,
                attempt: 0,
            }),
            changed: Notify::new(),
            pokes,
            disconnects,
            shutdown,
            response_timeout: config.reconnect_response_timeout,
        });
        let reconnector = Arc::new(StreamReconnector {
            shared: shared.clone(),
        });
        let pipe = BackedPipe::new(reconnector, config.replay_window_bytes);
        let span = info_span!("stream", stream_id = %id, stream_name = %name, port);

        let worker = tokio::spawn(
            reconnect_worker(shared.clone(), pipe.clone(), pokes_rx).instrument(span.clone()),
        );

        Self {
            id,
            name,
            port,
            created_at: now,
            handshake_timeout: config.handshake_timeout,
            shared,
            pipe,
            disconnects: Mutex::new(Some(disconnects_rx)),
            tasks: Mutex::new(vec![worker]),
            span,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn pipe(&self) -> &BackedPipe {
        &self.pipe
    }

    /// Bridges `local` onto the pipe. Call once.
    pub fn start(&self, local: BoxedTransport) -> Result<()> {
        let disconnects = {
            let mut state = self.shared.state.lock();
            if state.closed {
                return Err(Error::Closed);
            }
            let Some(rx) = self.disconnects.lock().take() else {
                return Err(Error::AlreadyStarted);
            };
            state.last_connection_at = Utc::now();
            state.connected = false;
            rx
        };

        let (local_read, local_write) = tokio::io::split(local);
        let handles = [
            tokio::spawn(
                copy_local_to_pipe(self.shared.clone(), self.pipe.clone(), local_read)
                    .instrument(self.span.clone()),
            ),
            tokio::spawn(
                copy_pipe_to_local(self.shared.clone(), self.pipe.clone(), local_write)
                    .instrument(self.span.clone()),
            ),
            tokio::spawn(
                watch_disconnects(self.shared.clone(), self.pipe.clone(), disconnects)
                    .instrument(self.span.clone()),
            ),
        ];
        self.tasks.lock().extend(handles);

        self.span.in_scope(|| info!("stream started"));
        Ok(())
    }

    /// Offers `conn` as the stream's client transport.
    ///
    /// Waits for the pipe to ask for a transport, nudging it to do so, then
    /// hands `conn` over together with the client's `read_seq`. Returns the
    /// pipe's own read sequence once the transport is attached; the caller
    /// sends that back to the client so it can replay what the agent missed.
    ///
    /// Replayed bytes are written to `conn` before this returns, so any
    /// response header the caller owes the client (the upgrade reply) must
    /// already be on the wire when `conn` is handed over. Only the returned
    /// sequence number can be delivered out of band afterwards.
    pub async fn handle_reconnect(&self, conn: BoxedTransport, read_seq: u64) -> Result<u64> {
        self.handshake(conn, read_seq).instrument(self.span.clone()).await
    }

    async fn handshake(&self, conn: BoxedTransport, read_seq: u64) -> Result<u64> {
        let deadline = Instant::now() + self.handshake_timeout;
        let mut conn = conn;
        debug!(read_seq, "handling reconnection");

        loop {
            let (request, verdict) = self.take_request(deadline).await?;
            let attempt = request.attempt;

            if let Err(returned) = request
                .respond
                .send(Ok(Reconnected::new(conn, read_seq)))
            {
                // The pipe gave up on this attempt before we answered.
                let mut state = self.shared.state.lock();
                if state.answered.as_ref().is_some_and(|(a, _)| *a == attempt) {
                    state.answered = None;
                }
                drop(state);
                conn = match returned {
                    Ok(r) => r.transport,
                    Err(_) => return Err(Error::Closed),
                };
                debug!(attempt, "reconnect request expired; waiting for the next one");
                continue;
            }

            return match tokio::time::timeout_at(deadline, verdict).await {
                Ok(Ok(Ok(()))) => {
                    info!(attempt, reader_seq = request.reader_seq, "client reconnected");
                    Ok(request.reader_seq)
                }
                Ok(Ok(Err(PipeError::Closed))) | Ok(Err(_)) => Err(Error::Closed),
                Ok(Ok(Err(e))) => {
                    warn!(attempt, error = %e, "pipe rejected client transport");
                    Err(Error::HandshakeFailed(e.to_string()))
                }
                Err(_) => Err(Error::HandshakeTimeout),
            };
        }
    }

    /// Waits until the pipe is asking for a transport and claims the request.
    async fn take_request(
        &self,
        deadline: Instant,
    ) -> Result<(ReconnectRequest, oneshot::Receiver<Outcome>)> {
        loop {
            let notified = self.shared.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let waiting_on_client = {
                let mut state = self.shared.state.lock();
                if state.closed {
                    return Err(Error::Closed);
                }
                if let Some(request) = state.pending.take() {
                    let (tx, rx) = oneshot::channel();
                    state.answered = Some((request.attempt, tx));
                    return Ok((request, rx));
                }
                state.connected
            };

            if waiting_on_client {
                debug!("already connected; waiting for reconnect slot");
            }
            self.shared.poke();

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                let state = self.shared.state.lock();
                return Err(if state.closed {
                    Error::Closed
                } else if state.connected {
                    Error::AlreadyConnected
                } else {
                    Error::HandshakeTimeout
                });
            }
        }
    }

    /// Shuts the stream down for good and waits for its tasks. Later calls
    /// are no-ops.
    ///
    /// A stream whose pipe failed for good closes itself; calling this
    /// afterwards still joins its tasks.
    pub async fn close(&self) -> Result<()> {
        self.shared.begin_close();

        let closed = self.pipe.close().await;
        if let Err(e) = &closed {
            self.span
                .in_scope(|| warn!(error = %e, "failed to close backed pipe"));
        }

        let tasks = std::mem::take(&mut *self.tasks.lock());
        if tasks.is_empty() {
            return closed.map_err(Error::from);
        }
        for task in tasks {
            if let Err(e) = task.await {
                self.span.in_scope(|| warn!(error = %e, "stream task failed"));
            }
        }

        self.span.in_scope(|| info!("stream closed"));
        closed.map_err(Error::from)
    }

    pub fn is_connected(&self) -> bool {
        self.shared.state.lock().connected
    }

    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }

    pub fn last_disconnection_at(&self) -> Option<DateTime<Utc>> {
        self.shared.state.lock().last_disconnection_at
    }

    /// Reports that a pump saw its side of the bridge fail. Idempotent.
    pub fn signal_disconnect(&self) {
        self.shared.signal_disconnect();
    }

    pub fn to_view(&self) -> StreamView {
        let state = self.shared.state.lock();
        StreamView {
            id: self.id,
            name: self.name.clone(),
            tcp_port: self.port,
            created_at: self.created_at,
            last_connection_at: state.last_connection_at,
            last_disconnection_at: if state.connected {
                None
            } else {
                state.last_disconnection_at
            },
        }
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        if self.shared.begin_close() {
            self.span.in_scope(|| debug!("stream dropped without close"));
        }
        self.pipe.abort();
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}

/// Sole caller of `force_reconnect`, so a handshake can never race a second
/// attempt that would tear down the transport it just supplied.
async fn reconnect_worker(shared: Arc<Shared>, pipe: BackedPipe, mut pokes: mpsc::Receiver<()>) {
    let mut shutdown = shared.shutdown.subscribe();
    loop {
        tokio::select! {
            poke = pokes.recv() => if poke.is_none() { break },
            _ = wait_shutdown(&mut shutdown) => break,
        }
        while pokes.try_recv().is_ok() {}

        let eligible = {
            let state = shared.state.lock();
            !state.closed
                && !state.handshake_pending
                && (!state.connected || !pipe.connected())
        };
        if !eligible {
            continue;
        }

        let result = pipe.force_reconnect().await;
        let verdict = {
            let mut state = shared.state.lock();
            state.handshake_pending = false;
            if result.is_ok() {
                if pipe.connected() {
                    state.connected = true;
                    state.last_connection_at = Utc::now();
                } else {
                    state.last_disconnection_at = Some(Utc::now());
                }
            }
            state.answered.take().map(|(_, verdict)| verdict)
        };

        // Closed before the verdict goes out, so the handshake's caller
        // already observes it.
        let terminal = matches!(&result, Err(e) if e.is_terminal());
        match &result {
            Err(e) if terminal => {
                warn!(error = %e, "client can no longer be resumed; closing stream");
                shared.begin_close();
            }
            Err(e) => debug!(error = %e, "reconnect attempt failed"),
            Ok(()) => {}
        }
        if let Some(verdict) = verdict {
            let _ = verdict.send(result.clone());
        }
        shared.changed.notify_waiters();
        if terminal {
            break;
        }
    }
    debug!("reconnect worker exiting");
}

async fn copy_local_to_pipe(
    shared: Arc<Shared>,
    pipe: BackedPipe,
    mut local: ReadHalf<BoxedTransport>,
) {
    let mut shutdown = shared.shutdown.subscribe();
    let mut buf = vec![0u8; COPY_BUF_BYTES];
    loop {
        let n = tokio::select! {
            r = local.read(&mut buf) => match r {
                Ok(0) => {
                    debug!("local service closed its side");
                    break;
                }
                Ok(n) => n,
                Err(e) => {
                    debug!(error = %e, "error reading from local service");
                    break;
                }
            },
            _ = wait_shutdown(&mut shutdown) => return,
        };
        if let Err(e) = pipe.write(&buf[..n]).await {
            debug!(error = %e, "pipe stopped accepting local data");
            break;
        }
    }
    shared.signal_disconnect();
}

async fn copy_pipe_to_local(
    shared: Arc<Shared>,
    pipe: BackedPipe,
    mut local: WriteHalf<BoxedTransport>,
) {
    let mut shutdown = shared.shutdown.subscribe();
    let mut buf = vec![0u8; COPY_BUF_BYTES];
    loop {
        let n = match pipe.read(&mut buf).await {
            Ok(n) => n,
            Err(e) => {
                debug!(error = %e, "exiting copy from pipe to local");
                break;
            }
        };
        let written = tokio::select! {
            r = local.write_all(&buf[..n]) => r,
            _ = wait_shutdown(&mut shutdown) => break,
        };
        if let Err(e) = written {
            debug!(error = %e, "error writing to local service");
            shared.signal_disconnect();
            break;
        }
    }
    let _ = local.shutdown().await;
}

async fn watch_disconnects(shared: Arc<Shared>, pipe: BackedPipe, mut signals: mpsc::Receiver<()>) {
    let mut link = pipe.subscribe_link();
    let mut shutdown = shared.shutdown.subscribe();
    loop {
        tokio::select! {
            signal = signals.recv() => {
                if signal.is_none() {
                    break;
                }
                shared.mark_disconnected("bridge i/o ended");
            }
            changed = link.changed() => {
                if changed.is_err() {
                    break;
                }
                let attached = link.borrow_and_update().connected;
                if !attached {
                    shared.mark_disconnected("client transport lost");
                }
            }
            _ = wait_shutdown(&mut shutdown) => break,
        }
    }
}

async fn wait_shutdown(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|s| *s).await.map(|s| *s);
}
