//! The accepting server channel.

use std::{
    collections::HashSet,
    net::SocketAddr,
    sync::{Arc, Mutex},
    time::Duration,
};

use futures::{StreamExt, stream::FuturesUnordered};
use palisade_amqp::engine::{Engine, EngineConfig};
use palisade_common::{
    events_bus::{EventsBus, EventsRx},
    shutdown::ShutdownChannel,
    task::NodeTask,
    x500::LegalName,
};
use rustls::ServerConfig;
use tokio::{
    net::{TcpListener, TcpStream},
    sync::mpsc,
    time,
};
use tokio_rustls::TlsAcceptor;
use tracing::{error, info, warn};

use crate::{
    ChannelError,
    connection::{Connection, SendRequest},
    events::{ConnectionChange, ReceivedMessage},
    tls::{self, TlsMaterial},
};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone, Debug)]
pub struct PeerServerConfig {
    pub bind_address: SocketAddr,
    /// Peer legal names we will accept. `None` accepts any chain-valid
    /// peer; an empty set accepts no one.
    pub allowed_remote_legal_names: Option<HashSet<LegalName>>,
    /// Log every AMQP frame at INFO.
    pub trace_frames: bool,
}

impl PeerServerConfig {
    pub fn new(bind_address: SocketAddr) -> Self {
        Self {
            bind_address,
            allowed_remote_legal_names: None,
            trace_frames: false,
        }
    }
}

pub struct PeerServer {
    local_addr: SocketAddr,
    on_connection: EventsBus<ConnectionChange>,
    on_receive: EventsBus<ReceivedMessage>,
    shutdown: ShutdownChannel,
    accept_task: Mutex<Option<NodeTask<()>>>,
}

impl PeerServer {
    /// Bind and start accepting inbound peers.
    pub async fn bind(
        material: &TlsMaterial,
        config: PeerServerConfig,
    ) -> Result<Self, ChannelError> {
        let tls_config = Arc::new(tls::server_config(material)?);
        let listener = TcpListener::bind(config.bind_address).await?;
        let local_addr = listener.local_addr()?;
        info!(
            "Peer server for {} listening on {local_addr}",
            material.local_legal_name,
        );

        let on_connection = EventsBus::new();
        let on_receive = EventsBus::new();
        let shutdown = ShutdownChannel::new();
        let acceptor = Acceptor {
            listener,
            tls_config,
            local_legal_name: material.local_legal_name.clone(),
            allowed: config.allowed_remote_legal_names,
            trace_frames: config.trace_frames,
            on_connection: on_connection.clone(),
            on_receive: on_receive.clone(),
            shutdown: shutdown.clone(),
        };
        let accept_task = NodeTask::spawn(
            format!("peer-server-{local_addr}"),
            acceptor.run(),
        );

        Ok(Self {
            local_addr,
            on_connection,
            on_receive,
            shutdown,
            accept_task: Mutex::new(Some(accept_task)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Lifecycle events for every inbound connection.
    pub fn on_connection(&self) -> EventsRx<'_, ConnectionChange> {
        self.on_connection.subscribe()
    }

    /// Authenticated inbound messages from all connected peers.
    pub fn on_receive(&self) -> EventsRx<'_, ReceivedMessage> {
        self.on_receive.subscribe()
    }

    /// Graceful stop: close the accept loop and every live connection,
    /// emitting their disconnect events before returning. Idempotent.
    pub async fn stop(&self) {
        self.shutdown.send();
        let task = self.accept_task.lock().unwrap().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

impl Drop for PeerServer {
    fn drop(&mut self) {
        self.shutdown.send();
    }
}

struct Acceptor {
    listener: TcpListener,
    tls_config: Arc<ServerConfig>,
    local_legal_name: LegalName,
    allowed: Option<HashSet<LegalName>>,
    trace_frames: bool,
    on_connection: EventsBus<ConnectionChange>,
    on_receive: EventsBus<ReceivedMessage>,
    shutdown: ShutdownChannel,
}

impl Acceptor {
    async fn run(self) {
        let mut connections: FuturesUnordered<NodeTask<()>> =
            FuturesUnordered::new();

        loop {
            tokio::select! {
                // Mitigate possible select! race after a shutdown signal
                biased;
                () = self.shutdown.recv() => break,
                Some(_finished) = connections.next() => (),
                accepted = self.listener.accept() => match accepted {
                    Ok((tcp, peer_addr)) => {
                        let handler = ConnectionHandler {
                            tls_config: self.tls_config.clone(),
                            local_legal_name: self.local_legal_name.clone(),
                            allowed: self.allowed.clone(),
                            trace_frames: self.trace_frames,
                            on_connection: self.on_connection.clone(),
                            on_receive: self.on_receive.clone(),
                            shutdown: self.shutdown.clone(),
                        };
                        connections.push(NodeTask::spawn(
                            format!("peer-conn-{peer_addr}"),
                            handler.run(tcp, peer_addr),
                        ));
                    }
                    Err(e) => {
                        warn!("Accept failed: {e}");
                        time::sleep(Duration::from_millis(100)).await;
                    }
                },
            }
        }

        // Stop taking new peers, then wait for the live connections; they
        // observe the same shutdown signal and wind down themselves.
        drop(self.listener);
        while connections.next().await.is_some() {}
    }
}

struct ConnectionHandler {
    tls_config: Arc<ServerConfig>,
    local_legal_name: LegalName,
    allowed: Option<HashSet<LegalName>>,
    trace_frames: bool,
    on_connection: EventsBus<ConnectionChange>,
    on_receive: EventsBus<ReceivedMessage>,
    shutdown: ShutdownChannel,
}

impl ConnectionHandler {
    async fn run(self, tcp: TcpStream, peer_addr: SocketAddr) {
        let disconnected = |addr| ConnectionChange {
            remote_address: addr,
            remote_legal_name: None,
            connected: false,
        };

        if let Err(e) = tcp.set_nodelay(true) {
            warn!("set_nodelay failed for {peer_addr}: {e}");
        }
        let acceptor = TlsAcceptor::from(self.tls_config.clone());
        let stream = match time::timeout(
            HANDSHAKE_TIMEOUT,
            acceptor.accept(tcp),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                error!("TLS handshake with {peer_addr} failed: {e}");
                self.on_connection.notify(disconnected(peer_addr));
                return;
            }
            Err(_elapsed) => {
                error!("TLS handshake with {peer_addr} timed out");
                self.on_connection.notify(disconnected(peer_addr));
                return;
            }
        };

        let remote_legal_name = {
            let (_io, session) = stream.get_ref();
            let cert = session
                .peer_certificates()
                .and_then(|certs| certs.first());
            match cert.map(tls::peer_legal_name) {
                Some(Ok(name)) => name,
                Some(Err(e)) => {
                    error!("Peer at {peer_addr} has an unusable cert: {e}");
                    self.on_connection.notify(disconnected(peer_addr));
                    return;
                }
                None => {
                    error!("Peer at {peer_addr} presented no certificate");
                    self.on_connection.notify(disconnected(peer_addr));
                    return;
                }
            }
        };

        let admitted = match &self.allowed {
            Some(allowed) => allowed.contains(&remote_legal_name),
            None => true,
        };
        if !admitted {
            error!(
                "Refusing peer at {peer_addr}: '{remote_legal_name}' is not \
                 in the allow-list",
            );
            self.on_connection.notify(disconnected(peer_addr));
            return;
        }

        info!("Accepted {remote_legal_name} from {peer_addr}");
        self.on_connection.notify(ConnectionChange {
            remote_address: peer_addr,
            remote_legal_name: Some(remote_legal_name.clone()),
            connected: true,
        });

        let mut engine_cfg = EngineConfig::new(
            true,
            self.local_legal_name.to_string(),
            remote_legal_name.to_string(),
        );
        engine_cfg.trace_frames = self.trace_frames;

        // The server side only receives; hold the sender open so the
        // connection doesn't read it as a shutdown.
        let (_outbound_tx, mut outbound_rx) =
            mpsc::channel::<SendRequest>(1);
        let connection = Connection {
            stream: stream.into(),
            engine: Engine::new(engine_cfg),
            remote_address: peer_addr,
            remote_legal_name,
            on_receive: self.on_receive.clone(),
            shutdown: self.shutdown.clone(),
        };
        let disconnect = connection.run(&mut outbound_rx).await;
        info!("Connection from {peer_addr} ended: {disconnect:?}");
        self.on_connection.notify(disconnected(peer_addr));
    }
}
