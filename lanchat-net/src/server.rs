use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use mdns_sd::ServiceDaemon;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use shared::protocol::{DEFAULT_BUFFER_CAPACITY, DEFAULT_DOMAIN};
use shared::types::{DiscoveredService, ServiceType};

use crate::connection::Connection;
use crate::error::NetError;
use crate::mdns::advertise;

/// Decision callback for inbound connections. Runs on the accept loop,
/// so it must not block.
pub type AcceptDecision = Arc<dyn Fn(&Connection) -> bool + Send + Sync>;

/// Notifications from a [`Server`].
#[derive(Debug)]
pub enum ServerEvent {
    /// The advertisement is confirmed; `name` is the published
    /// instance name.
    Started { name: String },
    /// Publishing failed, or the server was stopped. `error` is `None`
    /// for an explicit `stop()`.
    Stopped { error: Option<NetError> },
    /// An inbound connection passed the accept decision. The receiver
    /// owns opening and observing it; the server keeps a handle in its
    /// open set until `stop()`.
    ConnectionAccepted(Connection),
}

struct Published {
    fullname: String,
    port: u16,
    cancel: CancellationToken,
    accept_task: JoinHandle<()>,
}

/// Publishes this device's own service instance and accepts inbound
/// connections. Owns the set of connections it has accepted or dialed
/// until they are closed by `stop()`.
pub struct Server {
    name: String,
    service_type: ServiceType,
    domain: String,
    daemon: ServiceDaemon,
    events: mpsc::Sender<ServerEvent>,
    accept: AcceptDecision,
    input_capacity: usize,
    output_capacity: usize,
    published: Mutex<Option<Published>>,
    connections: Arc<Mutex<HashMap<u64, Connection>>>,
    publishing: AtomicBool,
    is_started: AtomicBool,
}

impl Server {
    pub fn new(
        name: impl Into<String>,
        service_type: ServiceType,
        daemon: ServiceDaemon,
        events: mpsc::Sender<ServerEvent>,
        accept: AcceptDecision,
    ) -> Self {
        Self {
            name: name.into(),
            service_type,
            domain: DEFAULT_DOMAIN.to_string(),
            daemon,
            events,
            accept,
            input_capacity: DEFAULT_BUFFER_CAPACITY,
            output_capacity: DEFAULT_BUFFER_CAPACITY,
            published: Mutex::new(None),
            connections: Arc::new(Mutex::new(HashMap::new())),
            publishing: AtomicBool::new(false),
            is_started: AtomicBool::new(false),
        }
    }

    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = domain.into();
        self
    }

    /// Buffer sizing for every connection this server constructs:
    /// `input` is the read scratch capacity, `output` caps a single
    /// write call.
    pub fn with_buffer_capacity(mut self, input: usize, output: usize) -> Self {
        self.input_capacity = input;
        self.output_capacity = output;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn service_type(&self) -> &ServiceType {
        &self.service_type
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn is_started(&self) -> bool {
        self.is_started.load(Ordering::SeqCst)
    }

    /// Listening port while published.
    pub fn port(&self) -> Option<u16> {
        self.lock_published().as_ref().map(|p| p.port)
    }

    /// Snapshot of the open set.
    pub fn open_connections(&self) -> Vec<Connection> {
        self.lock_connections().values().cloned().collect()
    }

    /// Bind a listener on an ephemeral port, publish the advertisement
    /// and start accepting. No-op while a publish is in flight or
    /// active. The outcome arrives as `Started` or `Stopped { error }`.
    pub async fn start(&self) {
        if self.publishing.swap(true, Ordering::SeqCst) {
            return;
        }

        let listener = match TcpListener::bind(("0.0.0.0", 0)).await {
            Ok(listener) => listener,
            Err(err) => {
                self.publishing.store(false, Ordering::SeqCst);
                tracing::error!("could not bind listener: {}", err);
                let _ = self
                    .events
                    .send(ServerEvent::Stopped {
                        error: Some(err.into()),
                    })
                    .await;
                return;
            }
        };
        let port = match listener.local_addr() {
            Ok(addr) => addr.port(),
            Err(err) => {
                self.publishing.store(false, Ordering::SeqCst);
                let _ = self
                    .events
                    .send(ServerEvent::Stopped {
                        error: Some(err.into()),
                    })
                    .await;
                return;
            }
        };

        let info = match advertise::register_service(
            &self.daemon,
            &self.name,
            &self.service_type,
            &self.domain,
            port,
        ) {
            Ok(info) => info,
            Err(err) => {
                self.publishing.store(false, Ordering::SeqCst);
                tracing::error!("{} did not publish: {}", self.name, err);
                let _ = self
                    .events
                    .send(ServerEvent::Stopped { error: Some(err) })
                    .await;
                return;
            }
        };

        let cancel = CancellationToken::new();
        let accept_task = tokio::spawn(accept_loop(
            listener,
            self.events.clone(),
            self.accept.clone(),
            self.connections.clone(),
            (self.input_capacity, self.output_capacity),
            cancel.clone(),
        ));
        *self.lock_published() = Some(Published {
            fullname: info.get_fullname().to_string(),
            port,
            cancel,
            accept_task,
        });
        self.is_started.store(true, Ordering::SeqCst);

        let _ = self
            .events
            .send(ServerEvent::Started {
                name: self.name.clone(),
            })
            .await;
    }

    /// Dial a discovered service and retain the new, not-yet-open
    /// connection in the open set. The caller owns opening and
    /// observing it. Tries each resolved address in turn.
    pub async fn create_connection(
        &self,
        service: &DiscoveredService,
    ) -> Result<Connection, NetError> {
        for addr in &service.addresses {
            match TcpStream::connect((*addr, service.port)).await {
                Ok(stream) => {
                    let connection =
                        Connection::with_capacity(stream, self.input_capacity, self.output_capacity);
                    self.lock_connections()
                        .insert(connection.id(), connection.clone());
                    tracing::info!("{} dialed {}", connection.name(), service.fullname);
                    return Ok(connection);
                }
                Err(err) => {
                    tracing::debug!("dial {} via {} failed: {}", service.fullname, addr, err);
                }
            }
        }
        Err(NetError::Unreachable)
    }

    /// Close and evict every connection in the open set, stop
    /// accepting, and withdraw the advertisement. Buffered outbound
    /// data is discarded. No-op when not published; the open set is
    /// empty when this returns.
    pub async fn stop(&self) {
        let Some(published) = self.lock_published().take() else {
            return;
        };
        published.cancel.cancel();
        // wait out an accept that already resolved, so its insert
        // cannot land after the drain below
        if let Err(err) = published.accept_task.await {
            tracing::warn!("accept loop join failed: {}", err);
        }

        let drained: Vec<Connection> = self.lock_connections().drain().map(|(_, c)| c).collect();
        for connection in drained {
            connection.close();
        }

        if let Err(err) = advertise::unregister_service(&self.daemon, &published.fullname) {
            tracing::warn!("unregister {} failed: {}", published.fullname, err);
        }

        self.is_started.store(false, Ordering::SeqCst);
        self.publishing.store(false, Ordering::SeqCst);

        let _ = self.events.send(ServerEvent::Stopped { error: None }).await;
    }

    fn lock_published(&self) -> MutexGuard<'_, Option<Published>> {
        self.published.lock().expect("server state lock poisoned")
    }

    fn lock_connections(&self) -> MutexGuard<'_, HashMap<u64, Connection>> {
        self.connections.lock().expect("open set lock poisoned")
    }
}

/// Accept task: wraps each inbound stream in an unopened connection
/// and asks the decision callback. Declined connections are closed on
/// the spot and never retained.
async fn accept_loop(
    listener: TcpListener,
    events: mpsc::Sender<ServerEvent>,
    accept: AcceptDecision,
    connections: Arc<Mutex<HashMap<u64, Connection>>>,
    (input_capacity, output_capacity): (usize, usize),
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::debug!("accept loop shutting down");
                return;
            }
            incoming = listener.accept() => {
                match incoming {
                    Ok((stream, addr)) => {
                        let connection =
                            Connection::with_capacity(stream, input_capacity, output_capacity);
                        tracing::info!("{} offered from {}", connection.name(), addr);
                        if accept(&connection) {
                            connections
                                .lock()
                                .expect("open set lock poisoned")
                                .insert(connection.id(), connection.clone());
                            if events
                                .send(ServerEvent::ConnectionAccepted(connection))
                                .await
                                .is_err()
                            {
                                return;
                            }
                        } else {
                            tracing::info!("{} refused: {}", connection.name(), NetError::Declined);
                            connection.close();
                        }
                    }
                    Err(err) => {
                        tracing::warn!("accept failed: {}", err);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionEvent;
    use crate::mdns::browser::{BrowserEvent, ServicesBrowser};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::time::{timeout, Duration};

    fn test_daemon() -> Option<ServiceDaemon> {
        match ServiceDaemon::new() {
            Ok(daemon) => Some(daemon),
            Err(err) => {
                eprintln!("skipping: no mdns daemon available: {}", err);
                None
            }
        }
    }

    fn accept_all() -> AcceptDecision {
        Arc::new(|_: &Connection| true)
    }

    fn refuse_all() -> AcceptDecision {
        Arc::new(|_: &Connection| false)
    }

    async fn started(rx: &mut mpsc::Receiver<ServerEvent>) -> String {
        match timeout(Duration::from_secs(5), rx.recv()).await {
            Ok(Some(ServerEvent::Started { name })) => name,
            other => panic!("expected Started, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn accepts_inbound_and_receives_clean_eof() {
        let Some(daemon) = test_daemon() else { return };
        let (tx, mut rx) = mpsc::channel(16);
        let server = Server::new("alice", ServiceType::tcp("lanchat-test"), daemon, tx, accept_all());

        server.start().await;
        assert_eq!(started(&mut rx).await, "alice");
        assert!(server.is_started());

        let port = server.port().unwrap();
        let mut dialer = TcpStream::connect(("127.0.0.1", port)).await.unwrap();

        let offered = match timeout(Duration::from_secs(5), rx.recv()).await {
            Ok(Some(ServerEvent::ConnectionAccepted(connection))) => connection,
            other => panic!("expected ConnectionAccepted, got {:?}", other),
        };
        assert_eq!(server.open_connections().len(), 1);

        let (ctx, mut crx) = mpsc::channel(16);
        offered.open(ctx);

        dialer.write_all(b"hi\n").await.unwrap();
        match timeout(Duration::from_secs(5), crx.recv()).await {
            Ok(Some(ConnectionEvent::DataReceived(data))) => assert_eq!(data, b"hi\n"),
            other => panic!("expected data, got {:?}", other),
        }

        drop(dialer);
        match timeout(Duration::from_secs(5), crx.recv()).await {
            Ok(Some(ConnectionEvent::Closed { error: None })) => {}
            other => panic!("expected clean close, got {:?}", other),
        }
        assert!(crx.recv().await.is_none());

        server.stop().await;
        assert!(server.open_connections().is_empty());
    }

    #[tokio::test]
    async fn declined_connections_are_closed_and_not_retained() {
        let Some(daemon) = test_daemon() else { return };
        let (tx, mut rx) = mpsc::channel(16);
        let server = Server::new("bob", ServiceType::tcp("lanchat-test"), daemon, tx, refuse_all());

        server.start().await;
        started(&mut rx).await;

        let port = server.port().unwrap();
        let mut dialer = TcpStream::connect(("127.0.0.1", port)).await.unwrap();

        // the declined connection is dropped, so the dialer sees EOF
        let mut buf = [0u8; 1];
        let n = timeout(Duration::from_secs(5), dialer.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);
        assert!(server.open_connections().is_empty());

        server.stop().await;
        match timeout(Duration::from_secs(5), rx.recv()).await {
            Ok(Some(ServerEvent::Stopped { error: None })) => {}
            other => panic!("expected Stopped, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn stop_closes_every_open_connection() {
        let Some(daemon) = test_daemon() else { return };
        let (tx, mut rx) = mpsc::channel(16);
        let server = Server::new("carol", ServiceType::tcp("lanchat-test"), daemon, tx, accept_all());

        server.start().await;
        started(&mut rx).await;
        let port = server.port().unwrap();

        let mut dialers = Vec::new();
        let mut accepted = Vec::new();
        for _ in 0..2 {
            dialers.push(TcpStream::connect(("127.0.0.1", port)).await.unwrap());
            match timeout(Duration::from_secs(5), rx.recv()).await {
                Ok(Some(ServerEvent::ConnectionAccepted(connection))) => {
                    let (ctx, _crx) = mpsc::channel(16);
                    connection.open(ctx);
                    accepted.push(connection);
                }
                other => panic!("expected ConnectionAccepted, got {:?}", other),
            }
        }
        assert_eq!(server.open_connections().len(), 2);

        server.stop().await;
        assert!(server.open_connections().is_empty());
        assert!(!server.is_started());
        for connection in &accepted {
            assert!(!connection.is_open());
        }
        for mut dialer in dialers {
            let mut buf = [0u8; 1];
            let n = timeout(Duration::from_secs(5), dialer.read(&mut buf))
                .await
                .unwrap()
                .unwrap();
            assert_eq!(n, 0);
        }
    }

    #[tokio::test]
    async fn stop_waits_for_racing_accepts() {
        let Some(daemon) = test_daemon() else { return };
        let (tx, mut rx) = mpsc::channel(64);
        let server = Server::new("erin", ServiceType::tcp("lanchat-test"), daemon, tx, accept_all());

        server.start().await;
        started(&mut rx).await;
        let port = server.port().unwrap();

        // keep the accept loop busy from another task so an accept can
        // be mid-poll when stop() runs
        let drainer = tokio::spawn(async move { while rx.recv().await.is_some() {} });
        let dialer = tokio::spawn(async move {
            loop {
                match TcpStream::connect(("127.0.0.1", port)).await {
                    Ok(stream) => drop(stream),
                    Err(_) => break, // listener is gone
                }
                tokio::task::yield_now().await;
            }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        server.stop().await;
        // stop joined the accept loop, so no insert can trail the drain
        assert!(server.open_connections().is_empty());
        assert!(!server.is_started());

        timeout(Duration::from_secs(5), dialer).await.unwrap().unwrap();
        drainer.abort();
    }

    #[tokio::test]
    async fn configured_buffer_capacities_reach_connections() {
        let Some(daemon) = test_daemon() else { return };
        let (tx, mut rx) = mpsc::channel(16);
        let server = Server::new("frank", ServiceType::tcp("lanchat-test"), daemon, tx, accept_all())
            .with_buffer_capacity(32, 8);

        server.start().await;
        started(&mut rx).await;
        let port = server.port().unwrap();
        let mut dialer = TcpStream::connect(("127.0.0.1", port)).await.unwrap();

        let accepted = match timeout(Duration::from_secs(5), rx.recv()).await {
            Ok(Some(ServerEvent::ConnectionAccepted(connection))) => connection,
            other => panic!("expected ConnectionAccepted, got {:?}", other),
        };
        assert_eq!(accepted.input_capacity(), 32);
        assert_eq!(accepted.output_capacity(), 8);

        // payloads larger than either capacity still arrive intact
        let (ctx, mut crx) = mpsc::channel(16);
        accepted.open(ctx);
        dialer.write_all(&[7u8; 100]).await.unwrap();
        let mut got = Vec::new();
        while got.len() < 100 {
            match timeout(Duration::from_secs(5), crx.recv()).await {
                Ok(Some(ConnectionEvent::DataReceived(data))) => got.extend(data),
                other => panic!("expected data, got {:?}", other),
            }
        }
        assert_eq!(got, vec![7u8; 100]);

        server.stop().await;
    }

    #[tokio::test]
    async fn start_is_idempotent_while_published() {
        let Some(daemon) = test_daemon() else { return };
        let (tx, mut rx) = mpsc::channel(16);
        let server = Server::new("dave", ServiceType::tcp("lanchat-test"), daemon, tx, accept_all());

        server.start().await;
        started(&mut rx).await;

        server.start().await;
        // the second start is a no-op; nothing else is emitted
        assert!(rx.try_recv().is_err());

        server.stop().await;
        server.stop().await; // no-op when already stopped
        match timeout(Duration::from_secs(5), rx.recv()).await {
            Ok(Some(ServerEvent::Stopped { error: None })) => {}
            other => panic!("expected one Stopped, got {:?}", other),
        }
        assert!(rx.try_recv().is_err());
    }

    /// The full two-device scenario over real multicast: alice
    /// advertises, bob's browser finds her, bob dials, says hi and
    /// hangs up.
    #[tokio::test]
    #[ignore = "requires a multicast-capable network"]
    async fn discovery_dial_and_clean_hangup() {
        let Some(alice_daemon) = test_daemon() else { return };
        let Some(bob_daemon) = test_daemon() else { return };
        let ty = ServiceType::tcp("lanchat-e2e");

        let (stx, mut srx) = mpsc::channel(16);
        let alice = Server::new("alice", ty.clone(), alice_daemon, stx, accept_all());
        alice.start().await;
        started(&mut srx).await;

        let (btx, mut brx) = mpsc::channel(16);
        let browser = ServicesBrowser::new(ty.clone(), bob_daemon.clone(), btx);
        browser.start().await;

        let target = loop {
            match timeout(Duration::from_secs(10), brx.recv()).await {
                Ok(Some(BrowserEvent::ServicesUpdated(services))) => {
                    if let Some(service) = services.into_iter().find(|s| s.instance() == "alice") {
                        break service;
                    }
                }
                other => panic!("expected alice to be discovered, got {:?}", other),
            }
        };

        let (dtx, mut drx) = mpsc::channel(16);
        let bob = Server::new("bob", ty, bob_daemon, dtx, accept_all());
        let outbound = bob.create_connection(&target).await.unwrap();
        let (otx, _orx) = mpsc::channel(16);
        outbound.open(otx);
        outbound.send(b"hi\n".to_vec());

        let inbound = loop {
            match timeout(Duration::from_secs(10), srx.recv()).await {
                Ok(Some(ServerEvent::ConnectionAccepted(connection))) => break connection,
                other => panic!("expected inbound connection, got {:?}", other),
            }
        };
        let (itx, mut irx) = mpsc::channel(16);
        inbound.open(itx);
        match timeout(Duration::from_secs(10), irx.recv()).await {
            Ok(Some(ConnectionEvent::DataReceived(data))) => assert_eq!(data, b"hi\n"),
            other => panic!("expected hi, got {:?}", other),
        }

        outbound.close();
        match timeout(Duration::from_secs(10), irx.recv()).await {
            Ok(Some(ConnectionEvent::Closed { error: None })) => {}
            other => panic!("expected clean close, got {:?}", other),
        }

        browser.stop().await;
        bob.stop().await;
        alice.stop().await;
        let _ = drx.try_recv();
    }
}
