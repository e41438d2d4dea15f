use std::{collections::HashMap, io, sync::Arc, time::Duration};

use async_trait::async_trait;
use lifeline_pipe::BoxedTransport;
use parking_lot::RwLock;
use tokio::{io::DuplexStream, net::TcpStream, sync::mpsc};
use tracing::debug;

const INTERNAL_PIPE_BYTES: usize = 64 * 1024;

/// Opens connections to local services on behalf of the manager.
#[async_trait]
pub trait Dialer: Send + Sync + 'static {
    async fn dial(&self, address: &str) -> io::Result<BoxedTransport>;
}

/// Ports served from inside this process, reachable without touching the
/// network stack.
#[derive(Debug, Default)]
pub struct InternalListeners {
    ports: RwLock<HashMap<u16, mpsc::Sender<DuplexStream>>>,
}

/// Accept side of an in-process port.
#[derive(Debug)]
pub struct InternalListener {
    port: u16,
    rx: mpsc::Receiver<DuplexStream>,
}

impl InternalListener {
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Next inbound connection, or `None` once the registry dropped the port.
    pub async fn accept(&mut self) -> Option<DuplexStream> {
        self.rx.recv().await
    }
}

impl InternalListeners {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serves `port` in-process, replacing any earlier listener for it.
    pub fn listen(&self, port: u16) -> InternalListener {
        let (tx, rx) = mpsc::channel(16);
        self.ports.write().insert(port, tx);
        InternalListener { port, rx }
    }

    pub fn unlisten(&self, port: u16) {
        self.ports.write().remove(&port);
    }

    /// Connects to an in-process listener, if one is serving `port`.
    pub fn connect(&self, port: u16) -> Option<DuplexStream> {
        let tx = self.ports.read().get(&port).cloned()?;
        let (ours, theirs) = tokio::io::duplex(INTERNAL_PIPE_BYTES);
        match tx.try_send(theirs) {
            Ok(()) => Some(ours),
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.ports.write().remove(&port);
                None
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!(port, "internal listener backlog full");
                None
            }
        }
    }
}

/// Dials `localhost`, preferring in-process listeners when one serves the
/// requested port. The host part of the address is ignored.
#[derive(Debug)]
pub struct LocalDialer {
    internal: RwLock<Option<Arc<InternalListeners>>>,
    timeout: Duration,
}

impl LocalDialer {
    pub fn new(timeout: Duration) -> Self {
        Self {
            internal: RwLock::new(None),
            timeout,
        }
    }

    /// Installs (or removes) the in-process listener registry.
    pub fn set_internal(&self, internal: Option<Arc<InternalListeners>>) {
        *self.internal.write() = internal;
        debug!("updated internal listener registry");
    }

    async fn dial_local(&self, port: u16) -> io::Result<TcpStream> {
        let stream = tokio::time::timeout(self.timeout, TcpStream::connect(("localhost", port)))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "dial timed out"))??;
        let _ = stream.set_nodelay(true);
        Ok(stream)
    }
}

#[async_trait]
impl Dialer for LocalDialer {
    async fn dial(&self, address: &str) -> io::Result<BoxedTransport> {
        let port = parse_port(address)?;

        let internal = self.internal.read().clone();
        if let Some(conn) = internal.and_then(|l| l.connect(port)) {
            debug!(port, "connected to internal listener");
            return Ok(Box::new(conn));
        }

        match self.dial_local(port).await {
            Ok(stream) => {
                debug!(port, "local dial succeeded");
                Ok(Box::new(stream))
            }
            Err(e) => {
                debug!(port, error = %e, "local dial failed");
                Err(e)
            }
        }
    }
}

fn parse_port(address: &str) -> io::Result<u16> {
    let (_, port) = address.rsplit_once(':').ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("parse address {address:?}: missing port"),
        )
    })?;
    port.parse::<u16>().map_err(|e| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("parse port {port:?}: {e}"),
        )
    })
}

/// True when `err` means nothing is listening on the target port.
pub fn is_connection_refused(err: &io::Error) -> bool {
    if err.kind() == io::ErrorKind::ConnectionRefused {
        return true;
    }
    let msg = err.to_string();
    msg.contains("connection refused")
        || msg.contains("No connection could be made because the target machine actively refused it")
        || msg.contains("actively refused")
}

#[cfg(test)]
mod tests {
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpListener,
    };

    use super::*;

    #[test]
    fn parses_ports() {
        assert_eq!(parse_port("localhost:22").unwrap(), 22);
        assert_eq!(parse_port("[::1]:8080").unwrap(), 8080);
        assert_eq!(
            parse_port("localhost").unwrap_err().kind(),
            io::ErrorKind::InvalidInput
        );
        assert!(parse_port("localhost:99999").is_err());
    }

    #[test]
    fn classifies_refused_errors() {
        assert!(is_connection_refused(&io::Error::from(
            io::ErrorKind::ConnectionRefused
        )));
        assert!(is_connection_refused(&io::Error::other(
            "dial tcp: connectex: No connection could be made because the target machine actively refused it."
        )));
        assert!(!is_connection_refused(&io::Error::from(
            io::ErrorKind::TimedOut
        )));
    }

    #[tokio::test]
    async fn dials_tcp_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let dialer = LocalDialer::new(Duration::from_secs(5));

        let addr = format!("ignored-host:{port}");
        let (dialed, accepted) = tokio::join!(dialer.dial(&addr), listener.accept());
        let mut dialed = dialed.unwrap();
        let (mut accepted, _) = accepted.unwrap();

        dialed.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        accepted.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[tokio::test]
    async fn refused_when_nothing_listens() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let dialer = LocalDialer::new(Duration::from_secs(5));
        let err = match dialer.dial(&format!("localhost:{port}")).await {
            Ok(_) => panic!("dial should fail"),
            Err(e) => e,
        };
        assert!(is_connection_refused(&err), "{err}");
    }

    #[tokio::test]
    async fn prefers_internal_listener() {
        let internal = Arc::new(InternalListeners::new());
        let mut listener = internal.listen(7);
        let dialer = LocalDialer::new(Duration::from_secs(5));
        dialer.set_internal(Some(internal.clone()));

        let mut conn = dialer.dial("localhost:7").await.unwrap();
        let mut served = listener.accept().await.unwrap();
        conn.write_all(b"hi").await.unwrap();
        let mut buf = [0u8; 2];
        served.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi");

        // A dropped listener no longer short-circuits.
        drop(listener);
        assert!(internal.connect(7).is_none());
        assert!(internal.connect(7).is_none());
    }
}
