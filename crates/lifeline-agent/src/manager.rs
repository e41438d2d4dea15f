use std::{collections::HashMap, sync::Arc};

use chrono::{DateTime, Utc};
use lifeline_pipe::BoxedTransport;
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    Config, Error, Result, Stream, StreamView,
    dialer::{Dialer, LocalDialer, is_connection_refused},
    names,
};

/// What eviction needs to know about a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct EvictionCandidate {
    id: Uuid,
    connected: bool,
    last_disconnection_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl EvictionCandidate {
    fn of(stream: &Stream) -> Self {
        Self {
            id: stream.id(),
            connected: stream.is_connected(),
            last_disconnection_at: stream.last_disconnection_at(),
            created_at: stream.created_at(),
        }
    }
}

/// Picks the disconnected stream that has been gone the longest. Streams
/// that never saw a disconnect only go when no other disconnected stream
/// exists; ties fall to the oldest stream.
fn pick_eviction_candidate(
    candidates: impl IntoIterator<Item = EvictionCandidate>,
) -> Option<EvictionCandidate> {
    candidates
        .into_iter()
        .filter(|c| !c.connected)
        .min_by_key(|c| {
            (
                c.last_disconnection_at.is_none(),
                c.last_disconnection_at,
                c.created_at,
            )
        })
}

/// Registry of live immortal streams, bounded by [`Config::max_streams`].
pub struct Manager {
    config: Config,
    dialer: Arc<dyn Dialer>,
    streams: RwLock<HashMap<Uuid, Arc<Stream>>>,
}

impl std::fmt::Debug for Manager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Manager")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Manager {
    pub fn new(config: Config, dialer: Arc<dyn Dialer>) -> Self {
        Self {
            config,
            dialer,
            streams: RwLock::new(HashMap::new()),
        }
    }

    /// Manager that reaches local services through a [`LocalDialer`].
    pub fn local(config: Config) -> (Self, Arc<LocalDialer>) {
        let dialer = Arc::new(LocalDialer::new(config.dial_timeout));
        (Self::new(config, dialer.clone()), dialer)
    }

    pub fn capacity(&self) -> usize {
        self.config.max_streams
    }

    pub async fn len(&self) -> usize {
        self.streams.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.streams.read().await.is_empty()
    }

    /// Dials the service on `port` and wraps the connection in a new stream.
    pub async fn create_stream(&self, port: u16) -> Result<StreamView> {
        let mut streams = self.streams.write().await;
        prune_closed(&mut streams);

        if streams.len() >= self.config.max_streams && !evict_one(&mut streams).await {
            return Err(Error::TooManyStreams);
        }

        let address = format!("localhost:{port}");
        let local = match self.dialer.dial(&address).await {
            Ok(conn) => conn,
            Err(e) if is_connection_refused(&e) => return Err(Error::ConnectionRefused),
            Err(e) => return Err(Error::Dial(e)),
        };

        let id = Uuid::new_v4();
        let stream = Arc::new(Stream::new(id, names::generate(), port, &self.config));
        if let Err(e) = stream.start(local) {
            let _ = stream.close().await;
            return Err(e);
        }

        let view = stream.to_view();
        info!(stream_id = %id, stream_name = %view.name, port, "stream created");
        streams.insert(id, stream);
        Ok(view)
    }

    pub async fn get_stream(&self, id: Uuid) -> Option<Arc<Stream>> {
        self.streams.read().await.get(&id).cloned()
    }

    pub async fn list_streams(&self) -> Vec<StreamView> {
        let mut views: Vec<StreamView> = self
            .streams
            .read()
            .await
            .values()
            .map(|s| s.to_view())
            .collect();
        views.sort_by_key(|v| v.created_at);
        views
    }

    pub async fn delete_stream(&self, id: Uuid) -> Result<()> {
        let mut streams = self.streams.write().await;
        let stream = streams.remove(&id).ok_or(Error::StreamNotFound)?;
        if let Err(e) = stream.close().await {
            warn!(stream_id = %id, error = %e, "failed to close stream");
        }
        info!(stream_id = %id, "stream deleted");
        Ok(())
    }

    /// Closes every stream. Returns the first close error, if any.
    pub async fn close(&self) -> Result<()> {
        let mut streams = self.streams.write().await;
        let mut first_err = None;
        for (id, stream) in streams.drain() {
            if let Err(e) = stream.close().await {
                warn!(stream_id = %id, error = %e, "failed to close stream");
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    /// Routes an upgraded client connection to its stream.
    ///
    /// A stream that closed itself during the handshake, because its client
    /// fell too far behind to be resumed, is dropped from the registry.
    pub async fn handle_connection(
        &self,
        id: Uuid,
        conn: BoxedTransport,
        read_seq: u64,
    ) -> Result<u64> {
        let stream = self.get_stream(id).await.ok_or(Error::StreamNotFound)?;
        let result = stream.handle_reconnect(conn, read_seq).await;

        if stream.is_closed() {
            let mut streams = self.streams.write().await;
            if streams.get(&id).is_some_and(|s| Arc::ptr_eq(s, &stream)) {
                streams.remove(&id);
                info!(stream_id = %id, "removed closed stream");
            }
            drop(streams);
            if let Err(e) = stream.close().await {
                warn!(stream_id = %id, error = %e, "failed to close stream");
            }
        }
        result
    }
}

fn prune_closed(streams: &mut HashMap<Uuid, Arc<Stream>>) {
    streams.retain(|id, stream| {
        let keep = !stream.is_closed();
        if !keep {
            info!(stream_id = %id, "removed closed stream");
        }
        keep
    });
}

async fn evict_one(streams: &mut HashMap<Uuid, Arc<Stream>>) -> bool {
    let Some(victim) = pick_eviction_candidate(streams.values().map(|s| EvictionCandidate::of(s)))
    else {
        return false;
    };
    let Some(stream) = streams.remove(&victim.id) else {
        return false;
    };

    info!(
        stream_id = %victim.id,
        stream_name = %stream.name(),
        disconnected_at = ?victim.last_disconnection_at,
        "evicting oldest disconnected stream"
    );
    if let Err(e) = stream.close().await {
        warn!(stream_id = %victim.id, error = %e, "failed to close evicted stream");
    }
    true
}
