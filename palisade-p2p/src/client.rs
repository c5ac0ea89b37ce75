//! The failover client channel.
//!
//! A [`PeerClient`] maintains at most one live connection to one logical
//! peer, walking an ordered list of candidate addresses. TCP-level failures
//! advance to the next candidate under exponential backoff; a drop of an
//! established connection retries the same candidate first, so a transient
//! loss re-homes to the current server before wandering.

use std::{
    collections::HashSet,
    io,
    net::SocketAddr,
    sync::{Arc, Mutex},
    time::Duration,
};

use palisade_amqp::{
    engine::{Engine, EngineConfig},
    message::{DeliveryState, OutboundMessage},
};
use palisade_common::{
    DEFAULT_CHANNEL_SIZE, backoff,
    events_bus::{EventsBus, EventsRx},
    shutdown::ShutdownChannel,
    task::NodeTask,
    x500::LegalName,
};
use rustls::{ClientConfig, pki_types::ServerName};
use thiserror::Error;
use tokio::{
    net::TcpStream,
    sync::{mpsc, mpsc::error::TrySendError, oneshot},
    time,
};
use tokio_rustls::{TlsConnector, TlsStream};
use tracing::{debug, info, warn};

use crate::{
    ChannelError,
    connection::{Connection, Disconnect, SendRequest},
    events::{ConnectionChange, ReceivedMessage},
    tls::{self, TlsMaterial},
};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// The maximum amount of time we'll allow for the TLS handshake.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
enum ConnectError {
    #[error("tcp connect failed: {0}")]
    Tcp(io::Error),
    #[error("TLS handshake failed: {0}")]
    Handshake(io::Error),
    #[error("peer presented no certificate")]
    NoPeerCertificate,
    #[error("peer identity unusable: {0}")]
    Identity(tls::TlsError),
}

#[derive(Clone, Debug)]
pub struct PeerClientConfig {
    /// Candidate addresses for the peer, tried in order. Must be
    /// non-empty.
    pub candidate_addresses: Vec<SocketAddr>,
    /// Peer legal names we will talk to. `None` accepts any chain-valid
    /// peer; an empty set accepts no one.
    pub allowed_remote_legal_names: Option<HashSet<LegalName>>,
    /// Sends beyond this many queued messages fail with backpressure.
    pub outbound_queue: usize,
    /// Log every AMQP frame at INFO.
    pub trace_frames: bool,
}

impl PeerClientConfig {
    pub fn new(candidate_addresses: Vec<SocketAddr>) -> Self {
        Self {
            candidate_addresses,
            allowed_remote_legal_names: None,
            outbound_queue: DEFAULT_CHANNEL_SIZE,
            trace_frames: false,
        }
    }
}

/// Resolves to the message's terminal state. A dropped channel resolves to
/// [`DeliveryState::Failed`].
#[must_use]
pub struct SendReceipt {
    rx: oneshot::Receiver<DeliveryState>,
}

impl SendReceipt {
    pub async fn outcome(self) -> DeliveryState {
        self.rx.await.unwrap_or(DeliveryState::Failed)
    }
}

pub struct PeerClient {
    config: PeerClientConfig,
    tls_config: Arc<ClientConfig>,
    local_legal_name: LegalName,
    on_connection: EventsBus<ConnectionChange>,
    on_receive: EventsBus<ReceivedMessage>,
    outbound_tx: mpsc::Sender<SendRequest>,
    outbound_rx: Mutex<Option<mpsc::Receiver<SendRequest>>>,
    shutdown: ShutdownChannel,
    task: Mutex<Option<NodeTask<()>>>,
}

impl PeerClient {
    /// Build a client channel. No sockets are touched until
    /// [`start`](Self::start).
    pub fn new(
        material: &TlsMaterial,
        config: PeerClientConfig,
    ) -> Result<Self, ChannelError> {
        if config.candidate_addresses.is_empty() {
            return Err(ChannelError::NoCandidateAddresses);
        }
        let tls_config = Arc::new(tls::client_config(material)?);
        let (outbound_tx, outbound_rx) = mpsc::channel(config.outbound_queue);
        Ok(Self {
            config,
            tls_config,
            local_legal_name: material.local_legal_name.clone(),
            on_connection: EventsBus::new(),
            on_receive: EventsBus::new(),
            outbound_tx,
            outbound_rx: Mutex::new(Some(outbound_rx)),
            shutdown: ShutdownChannel::new(),
            task: Mutex::new(None),
        })
    }

    /// Spawn the connect/reconnect loop onto the current runtime. Calling
    /// this more than once has no further effect.
    pub fn start(&self) {
        let Some(outbound_rx) = self.outbound_rx.lock().unwrap().take()
        else {
            return;
        };
        let worker = ClientWorker {
            addresses: self.config.candidate_addresses.clone(),
            allowed: self.config.allowed_remote_legal_names.clone(),
            local_legal_name: self.local_legal_name.clone(),
            tls_config: self.tls_config.clone(),
            trace_frames: self.config.trace_frames,
            on_connection: self.on_connection.clone(),
            on_receive: self.on_receive.clone(),
            shutdown: self.shutdown.clone(),
        };
        let name = format!(
            "peer-client-{}",
            self.config.candidate_addresses[0],
        );
        *self.task.lock().unwrap() =
            Some(NodeTask::spawn(name, worker.run(outbound_rx)));
    }

    /// Lifecycle events. Subscribe before [`start`](Self::start) to observe
    /// the first connection.
    pub fn on_connection(&self) -> EventsRx<'_, ConnectionChange> {
        self.on_connection.subscribe()
    }

    /// Inbound messages from the connected peer.
    pub fn on_receive(&self) -> EventsRx<'_, ReceivedMessage> {
        self.on_receive.subscribe()
    }

    /// Queue a message for the peer. The receipt resolves when the message
    /// reaches a terminal state: `Rejected` if it is misrouted for the live
    /// connection, `Failed` on backpressure or connection loss,
    /// `Acknowledged`/`Rejected` per the peer's disposition otherwise.
    pub fn send(&self, msg: OutboundMessage) -> SendReceipt {
        let (tx, rx) = oneshot::channel();
        if let Err(err) = self.outbound_tx.try_send((msg, tx)) {
            let (_msg, tx) = match err {
                TrySendError::Full(request) => {
                    warn!("Outbound queue is full; failing new message");
                    request
                }
                TrySendError::Closed(request) => request,
            };
            let _ = tx.send(DeliveryState::Failed);
        }
        SendReceipt { rx }
    }

    /// Stop the channel: cancel reconnect timers, close the socket, fail
    /// in-flight messages, emit a final disconnect event. Idempotent. Never
    /// touches the runtime it is running on.
    pub async fn stop(&self) {
        self.shutdown.send();
        let task = self.task.lock().unwrap().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

impl Drop for PeerClient {
    fn drop(&mut self) {
        self.shutdown.send();
    }
}

struct ClientWorker {
    addresses: Vec<SocketAddr>,
    allowed: Option<HashSet<LegalName>>,
    local_legal_name: LegalName,
    tls_config: Arc<ClientConfig>,
    trace_frames: bool,
    on_connection: EventsBus<ConnectionChange>,
    on_receive: EventsBus<ReceivedMessage>,
    shutdown: ShutdownChannel,
}

impl ClientWorker {
    async fn run(self, mut outbound_rx: mpsc::Receiver<SendRequest>) {
        let mut index = 0usize;
        let mut backoff_iter = backoff::get_backoff_iter();

        loop {
            if self.shutdown.try_recv() {
                return;
            }
            let addr = self.addresses[index];

            match self.try_connect(addr).await {
                Ok((stream, remote_legal_name)) => {
                    if !self.is_allowed(&remote_legal_name) {
                        warn!(
                            "Refusing peer at {addr}: '{remote_legal_name}' \
                             is not in the allow-list",
                        );
                        self.notify_disconnected(addr);
                        // Fall through to the failure path; dropping the
                        // stream closes it.
                    } else {
                        backoff_iter = backoff::get_backoff_iter();
                        info!("Connected to {remote_legal_name} at {addr}");
                        self.on_connection.notify(ConnectionChange {
                            remote_address: addr,
                            remote_legal_name: Some(
                                remote_legal_name.clone(),
                            ),
                            connected: true,
                        });

                        let mut engine_cfg = EngineConfig::new(
                            false,
                            self.local_legal_name.to_string(),
                            remote_legal_name.to_string(),
                        );
                        engine_cfg.trace_frames = self.trace_frames;
                        let connection = Connection {
                            stream,
                            engine: Engine::new(engine_cfg),
                            remote_address: addr,
                            remote_legal_name,
                            on_receive: self.on_receive.clone(),
                            shutdown: self.shutdown.clone(),
                        };
                        let disconnect =
                            connection.run(&mut outbound_rx).await;
                        info!("Connection to {addr} ended: {disconnect:?}");
                        self.notify_disconnected(addr);
                        if matches!(disconnect, Disconnect::Shutdown) {
                            return;
                        }
                        // Transient loss: try the same server again before
                        // moving down the list.
                        continue;
                    }
                }
                Err(ConnectError::Tcp(e)) =>
                    debug!("Could not connect to {addr}: {e}"),
                Err(e) => {
                    warn!("Handshake with {addr} failed: {e}");
                    self.notify_disconnected(addr);
                }
            }

            index = (index + 1) % self.addresses.len();
            let wait =
                backoff_iter.next().expect("Backoff iterator is infinite");
            tokio::select! {
                () = time::sleep(wait) => (),
                () = self.shutdown.recv() => return,
            }
        }
    }

    fn is_allowed(&self, name: &LegalName) -> bool {
        match &self.allowed {
            Some(allowed) => allowed.contains(name),
            None => true,
        }
    }

    fn notify_disconnected(&self, addr: SocketAddr) {
        self.on_connection.notify(ConnectionChange {
            remote_address: addr,
            remote_legal_name: None,
            connected: false,
        });
    }

    async fn try_connect(
        &self,
        addr: SocketAddr,
    ) -> Result<(TlsStream<TcpStream>, LegalName), ConnectError> {
        let timed_out =
            || io::Error::from(io::ErrorKind::TimedOut);

        let tcp = time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| ConnectError::Tcp(timed_out()))?
            .map_err(ConnectError::Tcp)?;
        tcp.set_nodelay(true).map_err(ConnectError::Tcp)?;

        let connector = TlsConnector::from(self.tls_config.clone());
        // Our verifier identifies the peer by certificate subject; the SNI
        // value is irrelevant but the API wants one.
        let server_name = ServerName::IpAddress(addr.ip().into());
        let stream = time::timeout(
            HANDSHAKE_TIMEOUT,
            connector.connect(server_name, tcp),
        )
        .await
        .map_err(|_| ConnectError::Handshake(timed_out()))?
        .map_err(ConnectError::Handshake)?;

        let remote_legal_name = {
            let (_io, session) = stream.get_ref();
            let cert = session
                .peer_certificates()
                .and_then(|certs| certs.first())
                .ok_or(ConnectError::NoPeerCertificate)?;
            tls::peer_legal_name(cert).map_err(ConnectError::Identity)?
        };
        Ok((stream.into(), remote_legal_name))
    }
}
