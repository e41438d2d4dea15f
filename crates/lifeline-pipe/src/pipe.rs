use std::{fmt, io, sync::Arc};

use parking_lot::Mutex;
use tokio::{
    io::{AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf},
    sync::{Mutex as AsyncMutex, watch},
};
use tracing::{debug, info, warn};

use crate::{
    BoxedTransport, CancelSignal, PipeError, Reconnected, Reconnector, Result, RetainedBuffer,
};

/// Snapshot of the pipe's attachment to a transport.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkStatus {
    /// Bumped every time a transport is attached.
    pub generation: u64,
    pub connected: bool,
}

struct Attached<T> {
    generation: u64,
    io: T,
}

type Outcome = Option<Result<()>>;

struct PipeState {
    closed: bool,
    /// Why the pipe closed itself, if it did.
    fault: Option<PipeError>,
    read_seq: u64,
    buffer: RetainedBuffer,
    inflight: Option<watch::Receiver<Outcome>>,
}

struct Inner {
    reconnector: Arc<dyn Reconnector>,
    state: Mutex<PipeState>,
    link: watch::Sender<LinkStatus>,
    shutdown: watch::Sender<bool>,
    // Lock order: writer, then reader, then state.
    writer: AsyncMutex<Option<Attached<WriteHalf<BoxedTransport>>>>,
    reader: AsyncMutex<Option<Attached<ReadHalf<BoxedTransport>>>>,
}

/// A byte pipe that survives replacement of its underlying transport.
///
/// Reads and writes park while no transport is attached instead of failing.
/// Written bytes are retained in a window of `replay_window` bytes so they
/// can be replayed to a replacement transport from whatever offset its peer
/// reports.
#[derive(Clone)]
pub struct BackedPipe {
    inner: Arc<Inner>,
}

impl fmt::Debug for BackedPipe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("BackedPipe")
            .field("link", &*self.inner.link.borrow())
            .field("closed", &state.closed)
            .field("read_seq", &state.read_seq)
            .field("write_seq", &state.buffer.write_seq())
            .finish_non_exhaustive()
    }
}

impl PipeState {
    fn closed_error(&self) -> PipeError {
        self.fault.clone().unwrap_or(PipeError::Closed)
    }
}

struct InflightGuard<'a> {
    inner: &'a Inner,
}

impl Drop for InflightGuard<'_> {
    fn drop(&mut self) {
        self.inner.state.lock().inflight = None;
    }
}

impl BackedPipe {
    pub fn new(reconnector: Arc<dyn Reconnector>, replay_window: usize) -> Self {
        let (link, _) = watch::channel(LinkStatus::default());
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                reconnector,
                state: Mutex::new(PipeState {
                    closed: false,
                    fault: None,
                    read_seq: 0,
                    buffer: RetainedBuffer::new(replay_window),
                    inflight: None,
                }),
                link,
                shutdown,
                writer: AsyncMutex::new(None),
                reader: AsyncMutex::new(None),
            }),
        }
    }

    pub fn connected(&self) -> bool {
        self.inner.link.borrow().connected
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    pub fn link(&self) -> LinkStatus {
        *self.inner.link.borrow()
    }

    /// Watch that changes whenever a transport is attached or lost.
    pub fn subscribe_link(&self) -> watch::Receiver<LinkStatus> {
        self.inner.link.subscribe()
    }

    /// Bytes delivered to the consumer so far.
    pub fn read_seq(&self) -> u64 {
        self.inner.state.lock().read_seq
    }

    /// Bytes accepted from the producer so far.
    pub fn write_seq(&self) -> u64 {
        self.inner.state.lock().buffer.write_seq()
    }

    /// Reads from the current transport, parking while detached.
    ///
    /// Transport EOF or failure is never returned; the pipe marks the link
    /// lost and keeps waiting for a replacement. Only closing the pipe ends a
    /// read.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        loop {
            let generation = self.wait_attached().await?;

            let mut slot = self.inner.reader.lock().await;
            let Some(attached) = slot.as_mut().filter(|a| a.generation == generation) else {
                continue;
            };

            let mut link = self.inner.link.subscribe();
            let mut shutdown = self.inner.shutdown.subscribe();
            let outcome = tokio::select! {
                r = attached.io.read(buf) => Some(r),
                _ = wait_severed(&mut link, generation) => None,
                _ = wait_shutdown(&mut shutdown) => return Err(self.closed_error()),
            };

            match outcome {
                Some(Ok(0)) => {
                    drop(slot);
                    self.mark_lost(generation, "transport reached EOF");
                }
                Some(Ok(n)) => {
                    self.inner.state.lock().read_seq += n as u64;
                    return Ok(n);
                }
                Some(Err(e)) => {
                    drop(slot);
                    self.mark_lost(generation, &e.to_string());
                }
                None => {}
            }
        }
    }

    /// Writes all of `data`, parking while detached.
    ///
    /// Once a transport is attached the bytes are retained before being
    /// forwarded, so a forwarding failure still counts as a successful write:
    /// the bytes are replayed after the next reconnect.
    ///
    /// Only the last `replay_window` bytes are retained. If a replacement
    /// transport's peer turns out to be further behind than that, the pipe
    /// closes itself and every pending and later write fails with
    /// [`PipeError::ReplayUnavailable`].
    pub async fn write(&self, data: &[u8]) -> Result<usize> {
        if data.is_empty() {
            return Ok(0);
        }

        loop {
            let generation = self.wait_attached().await?;

            let mut slot = self.inner.writer.lock().await;
            let Some(attached) = slot.as_mut().filter(|a| a.generation == generation) else {
                continue;
            };

            {
                let mut state = self.inner.state.lock();
                if state.closed {
                    return Err(state.closed_error());
                }
                let link = *self.inner.link.borrow();
                if !(link.connected && link.generation == generation) {
                    continue;
                }
                state.buffer.push(data);
            }

            let mut link = self.inner.link.subscribe();
            let mut shutdown = self.inner.shutdown.subscribe();
            let sent = tokio::select! {
                r = write_flush(&mut attached.io, data) => r,
                _ = wait_severed(&mut link, generation) => Ok(()),
                _ = wait_shutdown(&mut shutdown) => Ok(()),
            };
            if let Err(e) = sent {
                drop(slot);
                self.mark_lost(generation, &e.to_string());
            }
            return Ok(data.len());
        }
    }

    /// Replaces the current transport, or joins the replacement already in
    /// flight. Every joined caller receives the same outcome.
    pub async fn force_reconnect(&self) -> Result<()> {
        let (leader, outcome) = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return Err(state.closed_error());
            }
            match &state.inflight {
                Some(rx) => (None, rx.clone()),
                None => {
                    let (tx, rx) = watch::channel(None);
                    state.inflight = Some(rx.clone());
                    (Some(tx), rx)
                }
            }
        };

        let Some(tx) = leader else {
            debug!("joining reconnect already in flight");
            return wait_outcome(outcome).await;
        };

        let guard = InflightGuard { inner: &self.inner };
        let result = self.reconnect_once().await;
        drop(guard);

        match &result {
            Err(e) if e.is_terminal() => {
                warn!(error = %e, "retained window no longer covers the peer; closing pipe");
                self.shut(Some(e.clone()));
                self.release().await;
            }
            Err(e) => debug!(error = %e, "reconnect attempt failed"),
            Ok(()) => {}
        }
        tx.send_replace(Some(result.clone()));
        result
    }

    /// Closes the pipe for good. Blocked readers, writers and any reconnect
    /// in flight fail with [`PipeError::Closed`]. Idempotent.
    pub async fn close(&self) -> Result<()> {
        if self.shut(None) {
            debug!("pipe closed");
        }
        self.release().await;
        Ok(())
    }

    /// Closes the pipe without waiting for the transport halves; they are
    /// released once their current users observe the shutdown.
    pub fn abort(&self) {
        if self.shut(None) {
            debug!("pipe aborted");
        }
    }

    fn shut(&self, fault: Option<PipeError>) -> bool {
        {
            let mut state = self.inner.state.lock();
            if state.closed {
                return false;
            }
            state.closed = true;
            state.fault = fault;
            self.inner
                .link
                .send_if_modified(|l| std::mem::replace(&mut l.connected, false));
        }
        self.inner.shutdown.send_replace(true);
        true
    }

    async fn release(&self) {
        let mut writer = self.inner.writer.lock().await;
        let mut reader = self.inner.reader.lock().await;
        writer.take();
        reader.take();
    }

    fn closed_error(&self) -> PipeError {
        self.inner.state.lock().closed_error()
    }

    async fn reconnect_once(&self) -> Result<()> {
        let reader_seq = self.detach().await;
        debug!(reader_seq, "requesting replacement transport");

        let cancel = CancelSignal::from(self.inner.shutdown.subscribe());
        let mut shutdown = self.inner.shutdown.subscribe();
        let reconnected = tokio::select! {
            r = self.inner.reconnector.reconnect(cancel, reader_seq) => r?,
            _ = wait_shutdown(&mut shutdown) => return Err(self.closed_error()),
        };

        self.attach(reconnected).await
    }

    /// Drops the current transport and returns the read sequence as of the
    /// moment no more reads can land on it.
    async fn detach(&self) -> u64 {
        self.inner
            .link
            .send_if_modified(|l| std::mem::replace(&mut l.connected, false));

        let mut writer = self.inner.writer.lock().await;
        let mut reader = self.inner.reader.lock().await;
        writer.take();
        reader.take();
        self.inner.state.lock().read_seq
    }

    async fn attach(&self, reconnected: Reconnected) -> Result<()> {
        let Reconnected {
            transport,
            peer_read_seq,
        } = reconnected;
        let (read_half, mut write_half) = tokio::io::split(transport);

        let mut writer = self.inner.writer.lock().await;
        let mut reader = self.inner.reader.lock().await;

        let replay = {
            let state = self.inner.state.lock();
            if state.closed {
                return Err(PipeError::Closed);
            }
            state.buffer.replay_from(peer_read_seq)?
        };

        if !replay.is_empty() {
            debug!(peer_read_seq, bytes = replay.len(), "replaying retained bytes");
            let mut shutdown = self.inner.shutdown.subscribe();
            tokio::select! {
                r = write_flush(&mut write_half, &replay) => {
                    r.map_err(|e| PipeError::Replay(e.to_string()))?;
                }
                _ = wait_shutdown(&mut shutdown) => return Err(PipeError::Closed),
            }
        }

        let state = self.inner.state.lock();
        if state.closed {
            return Err(PipeError::Closed);
        }
        let generation = self.inner.link.borrow().generation + 1;
        *writer = Some(Attached {
            generation,
            io: write_half,
        });
        *reader = Some(Attached {
            generation,
            io: read_half,
        });
        self.inner.link.send_replace(LinkStatus {
            generation,
            connected: true,
        });
        drop(state);

        info!(generation, peer_read_seq, "transport attached");
        Ok(())
    }

    async fn wait_attached(&self) -> Result<u64> {
        {
            let state = self.inner.state.lock();
            if state.closed {
                return Err(state.closed_error());
            }
        }
        let mut link = self.inner.link.subscribe();
        let mut shutdown = self.inner.shutdown.subscribe();
        tokio::select! {
            status = wait_connected(&mut link) => status.map(|s| s.generation).ok_or(PipeError::Closed),
            _ = wait_shutdown(&mut shutdown) => Err(self.closed_error()),
        }
    }

    fn mark_lost(&self, generation: u64, reason: &str) {
        let lost = self.inner.link.send_if_modified(|l| {
            if l.connected && l.generation == generation {
                l.connected = false;
                true
            } else {
                false
            }
        });
        if lost {
            warn!(generation, reason, "transport lost");
        }
    }
}

// The helpers below copy out of watch guards so no guard is held across an
// await.

async fn wait_connected(rx: &mut watch::Receiver<LinkStatus>) -> Option<LinkStatus> {
    rx.wait_for(|l| l.connected).await.ok().map(|s| *s)
}

async fn wait_severed(rx: &mut watch::Receiver<LinkStatus>, generation: u64) {
    let _ = rx
        .wait_for(|l| !(l.connected && l.generation == generation))
        .await
        .map(|s| *s);
}

async fn wait_shutdown(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|c| *c).await.map(|c| *c);
}

async fn wait_outcome(mut rx: watch::Receiver<Outcome>) -> Result<()> {
    match rx.wait_for(Option::is_some).await {
        Ok(outcome) => outcome.clone().unwrap_or(Err(PipeError::Abandoned)),
        Err(_) => Err(PipeError::Abandoned),
    }
}

async fn write_flush<W: AsyncWrite + Unpin>(w: &mut W, data: &[u8]) -> io::Result<()> {
    w.write_all(data).await?;
    w.flush().await
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    use async_trait::async_trait;
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt, DuplexStream},
        sync::mpsc,
        time::timeout,
    };

    use super::*;
    use crate::ReconnectError;

    #[derive(Default)]
    struct Counters {
        calls: AtomicUsize,
        inflight: AtomicUsize,
        max_inflight: AtomicUsize,
    }

    struct QueueReconnector {
        queue: AsyncMutex<mpsc::Receiver<Reconnected>>,
        seen: Mutex<Vec<u64>>,
        counters: Counters,
    }

    #[async_trait]
    impl Reconnector for QueueReconnector {
        async fn reconnect(
            &self,
            mut cancel: CancelSignal,
            reader_seq: u64,
        ) -> std::result::Result<Reconnected, ReconnectError> {
            self.counters.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.counters.inflight.fetch_add(1, Ordering::SeqCst) + 1;
            self.counters.max_inflight.fetch_max(now, Ordering::SeqCst);
            self.seen.lock().push(reader_seq);

            let res = tokio::select! {
                next = async { self.queue.lock().await.recv().await } => {
                    next.ok_or_else(|| ReconnectError::Transport("queue closed".to_string()))
                }
                _ = cancel.cancelled() => Err(ReconnectError::Cancelled),
            };

            self.counters.inflight.fetch_sub(1, Ordering::SeqCst);
            res
        }
    }

    fn harness(window: usize) -> (BackedPipe, mpsc::Sender<Reconnected>, Arc<QueueReconnector>) {
        let (tx, rx) = mpsc::channel(8);
        let reconnector = Arc::new(QueueReconnector {
            queue: AsyncMutex::new(rx),
            seen: Mutex::new(Vec::new()),
            counters: Counters::default(),
        });
        let pipe = BackedPipe::new(reconnector.clone(), window);
        (pipe, tx, reconnector)
    }

    async fn offer(tx: &mpsc::Sender<Reconnected>, peer_read_seq: u64) -> DuplexStream {
        let (local, remote) = tokio::io::duplex(64 * 1024);
        tx.send(Reconnected::new(Box::new(local), peer_read_seq))
            .await
            .unwrap();
        remote
    }

    const WAIT: Duration = Duration::from_secs(1);

    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_test_writer()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    }

    #[tokio::test]
    async fn write_parks_until_a_transport_is_attached() {
        let (pipe, tx, _) = harness(1024);

        let writer = {
            let pipe = pipe.clone();
            tokio::spawn(async move { pipe.write(b"hello").await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!writer.is_finished());

        let mut remote = offer(&tx, 0).await;
        pipe.force_reconnect().await.unwrap();
        assert!(pipe.connected());

        let n = timeout(WAIT, writer).await.unwrap().unwrap().unwrap();
        assert_eq!(n, 5);

        let mut got = [0u8; 5];
        remote.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"hello");
        assert_eq!(pipe.write_seq(), 5);
    }

    #[tokio::test]
    async fn read_advances_read_sequence() {
        let (pipe, tx, _) = harness(1024);
        let mut remote = offer(&tx, 0).await;
        pipe.force_reconnect().await.unwrap();

        remote.write_all(b"abc").await.unwrap();
        let mut buf = [0u8; 16];
        let n = timeout(WAIT, pipe.read(&mut buf)).await.unwrap().unwrap();
        assert_eq!(&buf[..n], b"abc");
        assert_eq!(pipe.read_seq(), 3);
    }

    #[tokio::test]
    async fn reconnect_replays_from_peer_offset_without_duplicates() {
        init_tracing();
        let (pipe, tx, reconnector) = harness(1024);
        let mut first = offer(&tx, 0).await;
        pipe.force_reconnect().await.unwrap();

        first.write_all(b"xy").await.unwrap();
        let mut buf = [0u8; 2];
        let mut got = 0;
        while got < buf.len() {
            got += pipe.read(&mut buf[got..]).await.unwrap();
        }
        assert_eq!(&buf, b"xy");

        pipe.write(b"hello world").await.unwrap();
        let mut seen = [0u8; 5];
        first.read_exact(&mut seen).await.unwrap();
        assert_eq!(&seen, b"hello");
        drop(first);

        let mut second = offer(&tx, 5).await;
        pipe.force_reconnect().await.unwrap();
        pipe.write(b" again").await.unwrap();

        let mut rest = [0u8; 12];
        timeout(WAIT, second.read_exact(&mut rest))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&rest, b" world again");

        // The reconnector is told how far the consumer side got.
        assert_eq!(*reconnector.seen.lock(), vec![0, 2]);
    }

    #[tokio::test]
    async fn reconnect_fails_when_offset_left_the_window() {
        init_tracing();
        let (pipe, tx, _) = harness(4);
        let _first = offer(&tx, 0).await;
        pipe.force_reconnect().await.unwrap();
        pipe.write(b"abcdefgh").await.unwrap();

        let _stale = offer(&tx, 1).await;
        let err = pipe.force_reconnect().await.unwrap_err();
        assert_eq!(
            err,
            PipeError::ReplayUnavailable {
                requested: 1,
                oldest: 4
            }
        );
        assert!(!pipe.connected());
        assert!(pipe.is_closed());

        // The loss is final and typed for everyone still using the pipe.
        assert_eq!(pipe.write(b"more").await, Err(err.clone()));
        let mut buf = [0u8; 4];
        assert_eq!(pipe.read(&mut buf).await, Err(err.clone()));
        assert_eq!(pipe.force_reconnect().await, Err(err));
        pipe.close().await.unwrap();
    }

    #[tokio::test]
    async fn window_overflow_fails_parked_writer() {
        let (pipe, tx, _) = harness(4);
        let _first = offer(&tx, 0).await;
        pipe.force_reconnect().await.unwrap();
        pipe.write(b"abcdefgh").await.unwrap();

        // Detach by failing a reconnect, leaving a writer parked.
        let _stale = offer(&tx, 0).await;
        let writer = {
            let pipe = pipe.clone();
            tokio::spawn(async move {
                let mut link = pipe.subscribe_link();
                let _ = link.wait_for(|l| !l.connected).await.map(|l| *l);
                pipe.write(b"late").await
            })
        };
        let err = pipe.force_reconnect().await.unwrap_err();
        assert!(err.is_terminal());
        let res = timeout(WAIT, writer).await.unwrap().unwrap();
        assert_eq!(res, Err(err));
    }

    #[tokio::test]
    async fn abort_unblocks_reader_without_awaiting() {
        let (pipe, _tx, _) = harness(64);
        let reader = {
            let pipe = pipe.clone();
            tokio::spawn(async move {
                let mut buf = [0u8; 8];
                pipe.read(&mut buf).await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        pipe.abort();
        assert!(pipe.is_closed());
        assert_eq!(
            timeout(WAIT, reader).await.unwrap().unwrap(),
            Err(PipeError::Closed)
        );
        pipe.close().await.unwrap();
    }

    #[tokio::test]
    async fn reconnect_rejects_offset_past_write_sequence() {
        let (pipe, tx, _) = harness(64);
        let _remote = offer(&tx, 3).await;
        let err = pipe.force_reconnect().await.unwrap_err();
        assert_eq!(err, PipeError::InvalidSequence { peer: 3, written: 0 });
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_force_reconnect_is_single_flight() {
        init_tracing();
        let (pipe, tx, reconnector) = harness(1024);

        let mut callers = Vec::new();
        for _ in 0..8 {
            let pipe = pipe.clone();
            callers.push(tokio::spawn(async move { pipe.force_reconnect().await }));
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(reconnector.counters.calls.load(Ordering::SeqCst), 1);

        let _remote = offer(&tx, 0).await;
        for caller in callers {
            let res = timeout(WAIT, caller).await.unwrap().unwrap();
            assert_eq!(res, Ok(()));
        }
        assert_eq!(reconnector.counters.max_inflight.load(Ordering::SeqCst), 1);
        assert!(pipe.connected());
    }

    #[tokio::test]
    async fn close_unblocks_readers_and_writers() {
        let (pipe, _tx, _) = harness(1024);

        let reader = {
            let pipe = pipe.clone();
            tokio::spawn(async move {
                let mut buf = [0u8; 8];
                pipe.read(&mut buf).await
            })
        };
        let writer = {
            let pipe = pipe.clone();
            tokio::spawn(async move { pipe.write(b"data").await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        pipe.close().await.unwrap();
        assert_eq!(
            timeout(WAIT, reader).await.unwrap().unwrap(),
            Err(PipeError::Closed)
        );
        assert_eq!(
            timeout(WAIT, writer).await.unwrap().unwrap(),
            Err(PipeError::Closed)
        );

        // Second close is a no-op.
        pipe.close().await.unwrap();
        assert_eq!(pipe.force_reconnect().await, Err(PipeError::Closed));
    }

    #[tokio::test]
    async fn close_cancels_outstanding_reconnect() {
        let (pipe, _tx, _) = harness(1024);
        let attempt = {
            let pipe = pipe.clone();
            tokio::spawn(async move { pipe.force_reconnect().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        pipe.close().await.unwrap();
        let res = timeout(WAIT, attempt).await.unwrap().unwrap();
        assert!(matches!(
            res,
            Err(PipeError::Closed) | Err(PipeError::Reconnect(ReconnectError::Cancelled))
        ));
    }

    #[tokio::test]
    async fn transport_eof_marks_link_lost_but_read_keeps_waiting() {
        let (pipe, tx, _) = harness(1024);
        let remote = offer(&tx, 0).await;
        pipe.force_reconnect().await.unwrap();

        let mut link = pipe.subscribe_link();
        let reader = {
            let pipe = pipe.clone();
            tokio::spawn(async move {
                let mut buf = [0u8; 8];
                pipe.read(&mut buf).await
            })
        };

        drop(remote);
        timeout(WAIT, link.wait_for(|l| !l.connected))
            .await
            .unwrap()
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!reader.is_finished());

        pipe.close().await.unwrap();
        assert_eq!(
            timeout(WAIT, reader).await.unwrap().unwrap(),
            Err(PipeError::Closed)
        );
    }
}
