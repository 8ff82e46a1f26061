use std::fmt;
use std::io::ErrorKind;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::{Buf, BytesMut};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::NetError;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Notifications delivered to whoever opened the connection. If the
/// receiving end is dropped, events are discarded.
#[derive(Debug)]
pub enum ConnectionEvent {
    /// Every byte available on the stream at the time of the readiness
    /// event, coalesced into one payload. No framing is applied at
    /// this layer; message boundaries belong to the consumer.
    DataReceived(Vec<u8>),
    /// The connection is going away. `error` is `None` for a clean
    /// remote EOF. An explicit `close()` emits no event at all.
    Closed { error: Option<NetError> },
}

enum State {
    /// Constructed but not yet driven. Bytes sent before `open` are
    /// queued here and flushed first once the driver starts.
    Idle { stream: TcpStream, queued: Vec<u8> },
    Open { send_tx: mpsc::UnboundedSender<Vec<u8>> },
    Closed,
}

struct Inner {
    id: u64,
    name: String,
    input_capacity: usize,
    output_capacity: usize,
    cancel: CancellationToken,
    state: Mutex<State>,
}

/// One established byte-stream channel to a peer.
///
/// Cheap to clone, so the server's open set and the chat layer can
/// hold the same connection. A single driver task owns the stream and
/// reacts to readiness events, which keeps per-connection ordering:
/// outbound bytes leave in the exact order they were queued by
/// [`send`](Connection::send), and inbound payloads are delivered in
/// arrival order. Nothing here blocks the caller.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl Connection {
    /// `input_capacity` sizes the read scratch buffer; `output_capacity`
    /// caps how many bytes a single write call may take.
    pub(crate) fn with_capacity(
        stream: TcpStream,
        input_capacity: usize,
        output_capacity: usize,
    ) -> Self {
        let id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
        Self {
            inner: Arc::new(Inner {
                id,
                name: format!("Connection #{}", id),
                input_capacity,
                output_capacity,
                cancel: CancellationToken::new(),
                state: Mutex::new(State::Idle {
                    stream,
                    queued: Vec::new(),
                }),
            }),
        }
    }

    /// Unique per process lifetime.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Human-readable identity, "Connection #<n>".
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn is_open(&self) -> bool {
        matches!(*self.lock_state(), State::Open { .. })
    }

    #[cfg(test)]
    pub(crate) fn input_capacity(&self) -> usize {
        self.inner.input_capacity
    }

    #[cfg(test)]
    pub(crate) fn output_capacity(&self) -> usize {
        self.inner.output_capacity
    }

    /// Start driving the stream, delivering notifications on `events`.
    /// No-op if already open or closed. Must be called within a tokio
    /// runtime; the driver task ends when the connection closes.
    pub fn open(&self, events: mpsc::Sender<ConnectionEvent>) {
        let mut state = self.lock_state();
        match std::mem::replace(&mut *state, State::Closed) {
            State::Idle { stream, queued } => {
                let (send_tx, send_rx) = mpsc::unbounded_channel();
                *state = State::Open { send_tx };
                drop(state);
                tracing::debug!("{} opened", self.name());
                tokio::spawn(drive(self.inner.clone(), stream, queued, send_rx, events));
            }
            other => *state = other,
        }
    }

    /// Silent teardown: the stream is dropped, buffered outbound bytes
    /// are discarded, and no event is emitted. No-op once closed.
    pub fn close(&self) {
        {
            let mut state = self.lock_state();
            if matches!(*state, State::Closed) {
                return;
            }
            *state = State::Closed;
        }
        self.inner.cancel.cancel();
        tracing::debug!("{} closed", self.name());
    }

    /// Queue bytes for delivery and wake the driver, which drains as
    /// much as the stream will currently take. Never blocks and never
    /// drops data while the connection is open. On a closed connection
    /// the data is silently discarded: there is no receiver left to
    /// deliver it to.
    pub fn send(&self, data: impl Into<Vec<u8>>) {
        let data = data.into();
        let mut state = self.lock_state();
        match &mut *state {
            State::Idle { queued, .. } => queued.extend_from_slice(&data),
            State::Open { send_tx } => {
                let _ = send_tx.send(data);
            }
            State::Closed => {}
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, State> {
        self.inner
            .state
            .lock()
            .expect("connection state lock poisoned")
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("name", &self.inner.name)
            .field("open", &self.is_open())
            .finish()
    }
}

enum ReadOutcome {
    StillOpen,
    Eof,
    Failed(std::io::Error),
}

/// Driver task: one readiness loop per connection. The select arms
/// mirror the possible stream events: queued data, readable, writable
/// (only while bytes are pending), and cancellation.
async fn drive(
    inner: Arc<Inner>,
    stream: TcpStream,
    queued: Vec<u8>,
    mut send_rx: mpsc::UnboundedReceiver<Vec<u8>>,
    events: mpsc::Sender<ConnectionEvent>,
) {
    let mut scratch = vec![0u8; inner.input_capacity];
    let mut pending = BytesMut::from(&queued[..]);

    loop {
        tokio::select! {
            _ = inner.cancel.cancelled() => {
                // close() was called; tear down without notifying
                return;
            }
            msg = send_rx.recv() => {
                match msg {
                    Some(data) => {
                        pending.extend_from_slice(&data);
                        if let Err(err) = drain_output(&stream, &mut pending, inner.output_capacity) {
                            close_with_error(&inner, &events, Some(err.into())).await;
                            return;
                        }
                    }
                    // the sender only drops when the handle closed
                    None => return,
                }
            }
            ready = stream.readable() => {
                if let Err(err) = ready {
                    close_with_error(&inner, &events, Some(err.into())).await;
                    return;
                }
                let (data, outcome) = drain_input(&stream, &mut scratch);
                if !data.is_empty() {
                    let _ = events.send(ConnectionEvent::DataReceived(data)).await;
                }
                match outcome {
                    ReadOutcome::StillOpen => {}
                    ReadOutcome::Eof => {
                        close_with_error(&inner, &events, None).await;
                        return;
                    }
                    ReadOutcome::Failed(err) => {
                        close_with_error(&inner, &events, Some(err.into())).await;
                        return;
                    }
                }
            }
            ready = stream.writable(), if !pending.is_empty() => {
                if let Err(err) = ready {
                    close_with_error(&inner, &events, Some(err.into())).await;
                    return;
                }
                if let Err(err) = drain_output(&stream, &mut pending, inner.output_capacity) {
                    close_with_error(&inner, &events, Some(err.into())).await;
                    return;
                }
            }
        }
    }
}

/// Fault or peer-initiated teardown: notify before the stream goes
/// away so the consumer can still read the connection's identity.
/// Emits at most one `Closed` event per connection.
async fn close_with_error(
    inner: &Arc<Inner>,
    events: &mpsc::Sender<ConnectionEvent>,
    error: Option<NetError>,
) {
    {
        let mut state = inner.state.lock().expect("connection state lock poisoned");
        if matches!(*state, State::Closed) {
            return;
        }
        *state = State::Closed;
    }
    match &error {
        Some(err) => tracing::debug!("{} closing: {}", inner.name, err),
        None => tracing::debug!("{} EOF", inner.name),
    }
    let _ = events.send(ConnectionEvent::Closed { error }).await;
    inner.cancel.cancel();
}

/// Read everything currently available, coalescing partial kernel
/// deliveries into one payload. Bytes already read are returned even
/// when the drain ends in EOF or a fault.
fn drain_input(stream: &TcpStream, scratch: &mut [u8]) -> (Vec<u8>, ReadOutcome) {
    let mut data = Vec::new();
    loop {
        match stream.try_read(scratch) {
            Ok(0) => return (data, ReadOutcome::Eof),
            Ok(n) => data.extend_from_slice(&scratch[..n]),
            Err(err) if err.kind() == ErrorKind::WouldBlock => {
                return (data, ReadOutcome::StillOpen)
            }
            Err(err) => return (data, ReadOutcome::Failed(err)),
        }
    }
}

/// Write as many pending bytes as the stream will take, FIFO, at most
/// `cap` per call. A write that accepts zero bytes is a fatal stream
/// fault. `WouldBlock` leaves the remainder for the next readiness
/// event rather than busy-looping.
fn drain_output(stream: &TcpStream, pending: &mut BytesMut, cap: usize) -> std::io::Result<()> {
    while !pending.is_empty() {
        let len = pending.len().min(cap);
        match stream.try_write(&pending[..len]) {
            Ok(0) => {
                return Err(std::io::Error::new(
                    ErrorKind::WriteZero,
                    "stream accepted no bytes",
                ))
            }
            Ok(n) => pending.advance(n),
            Err(err) if err.kind() == ErrorKind::WouldBlock => return Ok(()),
            Err(err) => return Err(err),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::protocol::DEFAULT_BUFFER_CAPACITY;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn default_conn(stream: TcpStream) -> Connection {
        Connection::with_capacity(stream, DEFAULT_BUFFER_CAPACITY, DEFAULT_BUFFER_CAPACITY)
    }

    async fn pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (client, server)
    }

    #[tokio::test]
    async fn sends_arrive_concatenated_in_order() {
        let (local, mut remote) = pair().await;
        // tiny write cap to force many partial drains
        let conn = Connection::with_capacity(local, 64, 8);
        let (tx, _rx) = mpsc::channel(16);
        conn.open(tx);

        let mut expected = Vec::new();
        for i in 0..50u8 {
            let chunk = vec![i; 100];
            expected.extend_from_slice(&chunk);
            conn.send(chunk);
        }

        let mut got = vec![0u8; expected.len()];
        remote.read_exact(&mut got).await.unwrap();
        assert_eq!(got, expected);
        conn.close();
    }

    #[tokio::test]
    async fn open_then_close_is_silent() {
        let (local, _remote) = pair().await;
        let conn = default_conn(local);
        let (tx, mut rx) = mpsc::channel(16);
        conn.open(tx);
        conn.close();
        assert!(!conn.is_open());
        // the driver exits without emitting anything; the channel just ends
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn bytes_queued_before_open_flush_first() {
        let (local, mut remote) = pair().await;
        let conn = default_conn(local);
        conn.send(b"hello ".to_vec());
        assert!(!conn.is_open());

        let (tx, _rx) = mpsc::channel(16);
        conn.open(tx);
        conn.send(b"world".to_vec());

        let mut got = vec![0u8; 11];
        remote.read_exact(&mut got).await.unwrap();
        assert_eq!(&got[..], b"hello world");
    }

    #[tokio::test]
    async fn clean_remote_eof_notifies_exactly_once() {
        let (local, remote) = pair().await;
        let conn = default_conn(local);
        let (tx, mut rx) = mpsc::channel(16);
        conn.open(tx);

        drop(remote);
        match rx.recv().await {
            Some(ConnectionEvent::Closed { error: None }) => {}
            other => panic!("expected clean close, got {:?}", other),
        }
        assert!(rx.recv().await.is_none());
        assert!(!conn.is_open());
    }

    #[tokio::test]
    async fn reset_stream_closes_with_error() {
        let (local, remote) = pair().await;
        remote.set_linger(Some(Duration::ZERO)).unwrap();
        let conn = default_conn(local);
        let (tx, mut rx) = mpsc::channel(16);
        conn.open(tx);

        drop(remote); // RST instead of FIN
        match rx.recv().await {
            Some(ConnectionEvent::Closed { error: Some(_) }) => {}
            other => panic!("expected faulted close, got {:?}", other),
        }
        assert!(rx.recv().await.is_none());
        // faulted connections silently ignore further sends
        conn.send(b"late".to_vec());
        assert!(!conn.is_open());
    }

    #[tokio::test]
    async fn send_after_close_is_discarded() {
        let (local, mut remote) = pair().await;
        let conn = default_conn(local);
        let (tx, _rx) = mpsc::channel(16);
        conn.open(tx);

        conn.send(b"before".to_vec());
        let mut got = vec![0u8; 6];
        remote.read_exact(&mut got).await.unwrap();

        conn.close();
        conn.send(b"after".to_vec());
        conn.close(); // idempotent

        // remote observes EOF, never the discarded payload
        let n = remote.read(&mut got).await.unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn ids_and_names_are_unique() {
        let (a, _keep_a) = pair().await;
        let (b, _keep_b) = pair().await;
        let c1 = default_conn(a);
        let c2 = default_conn(b);
        assert_ne!(c1.id(), c2.id());
        assert_ne!(c1.name(), c2.name());
        assert!(c1.name().starts_with("Connection #"));
    }
}
