mod config;

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use mdns_sd::ServiceDaemon;
use tokio::io::AsyncBufReadExt;
use tokio::sync::mpsc;

use lanchat_net::{
    BrowserEvent, Connection, ConnectionEvent, Server, ServerEvent, ServicesBrowser,
};
use shared::types::{DiscoveredService, ServiceType};

use crate::config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("lanchat_peerd=info")),
        )
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => Config::load(&path)
            .with_context(|| format!("Failed to load config from {}", path))?,
        None => Config::default(),
    };
    let peer = config.peer;

    tracing::info!("Starting lanchat-peerd as {}", peer.device_name);

    let service_type = ServiceType::tcp(peer.service_name.clone());
    let daemon = ServiceDaemon::new().context("Failed to create mDNS daemon")?;

    let (server_tx, mut server_rx) = mpsc::channel(64);
    let accept_inbound = peer.accept_inbound;
    let server = Server::new(
        peer.device_name.clone(),
        service_type.clone(),
        daemon.clone(),
        server_tx,
        Arc::new(move |_: &Connection| accept_inbound),
    )
    .with_domain(peer.domain.clone())
    .with_buffer_capacity(peer.input_buffer_capacity, peer.output_buffer_capacity);

    let (browser_tx, mut browser_rx) = mpsc::channel(64);
    let browser = ServicesBrowser::new(service_type, daemon.clone(), browser_tx)
        .with_domain(peer.domain.clone());

    browser.start().await;
    server.start().await;

    // per-connection receive pumps funnel into one chat stream
    let (chat_tx, mut chat_rx) = mpsc::channel::<(String, ConnectionEvent)>(64);

    let mut chats: HashMap<u64, Connection> = HashMap::new();
    let mut peers: Vec<DiscoveredService> = Vec::new();

    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    println!("commands: /peers, /connect <instance>, /quit; anything else goes to every open chat");

    loop {
        tokio::select! {
            event = server_rx.recv() => {
                let Some(event) = event else { break };
                match event {
                    ServerEvent::Started { name } => {
                        tracing::info!("advertising as {}", name);
                    }
                    ServerEvent::Stopped { error: Some(err) } => {
                        tracing::error!("server stopped: {}", err);
                        break;
                    }
                    ServerEvent::Stopped { error: None } => {
                        tracing::info!("server stopped");
                    }
                    ServerEvent::ConnectionAccepted(connection) => {
                        println!("* {} connected", connection.name());
                        attach(&mut chats, &chat_tx, connection);
                    }
                }
            }
            event = browser_rx.recv() => {
                let Some(event) = event else { break };
                match event {
                    BrowserEvent::ServicesUpdated(services) => {
                        // each update is the complete set; drop our own advertisement
                        peers = services
                            .into_iter()
                            .filter(|service| service.instance() != peer.device_name)
                            .collect();
                        println!("* {} peer(s) visible", peers.len());
                    }
                    BrowserEvent::Stopped { error } => {
                        match error {
                            Some(err) => tracing::error!("browser stopped: {}", err),
                            None => tracing::info!("browser stopped"),
                        }
                    }
                }
            }
            Some((name, event)) = chat_rx.recv() => {
                match event {
                    ConnectionEvent::DataReceived(data) => {
                        print!("[{}] {}", name, String::from_utf8_lossy(&data));
                    }
                    ConnectionEvent::Closed { error } => {
                        match error {
                            Some(err) => println!("* {} closed: {}", name, err),
                            None => println!("* {} disconnected", name),
                        }
                        chats.retain(|_, connection| connection.name() != name);
                    }
                }
            }
            line = lines.next_line() => {
                let Some(line) = line.context("Failed to read stdin")? else { break };
                if let Some(instance) = line.strip_prefix("/connect ") {
                    connect_to(&server, &peers, instance, &mut chats, &chat_tx).await;
                } else if line == "/peers" {
                    for service in &peers {
                        println!("  {} @ {}:{}", service.instance(), service.hostname, service.port);
                    }
                } else if line == "/quit" {
                    break;
                } else if !line.is_empty() {
                    // newline-terminated text is the chat convention; the
                    // connection itself imposes no framing
                    let payload = format!("{}\n", line).into_bytes();
                    for connection in chats.values() {
                        connection.send(payload.clone());
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                break;
            }
        }
    }

    tracing::info!("Shutting down");

    browser.stop().await;
    server.stop().await;
    if let Err(err) = daemon.shutdown() {
        tracing::error!("Failed to shutdown mDNS daemon: {}", err);
    }

    tracing::info!("Shutdown complete");
    Ok(())
}

/// Open a connection and pump its events into the shared chat channel,
/// tagged with the connection name.
fn attach(
    chats: &mut HashMap<u64, Connection>,
    chat_tx: &mpsc::Sender<(String, ConnectionEvent)>,
    connection: Connection,
) {
    let (tx, mut rx) = mpsc::channel(64);
    connection.open(tx);
    chats.insert(connection.id(), connection.clone());

    let name = connection.name().to_string();
    let chat_tx = chat_tx.clone();
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            if chat_tx.send((name.clone(), event)).await.is_err() {
                break;
            }
        }
    });
}

async fn connect_to(
    server: &Server,
    peers: &[DiscoveredService],
    instance: &str,
    chats: &mut HashMap<u64, Connection>,
    chat_tx: &mpsc::Sender<(String, ConnectionEvent)>,
) {
    let Some(target) = peers.iter().find(|service| service.instance() == instance) else {
        println!("* no such peer: {}", instance);
        return;
    };
    match server.create_connection(target).await {
        Ok(connection) => {
            println!("* dialing {} as {}", target.instance(), connection.name());
            attach(chats, chat_tx, connection);
        }
        Err(err) => {
            println!("* could not reach {}: {}", instance, err);
        }
    }
}
