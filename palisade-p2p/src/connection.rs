//! The per-connection event loop.
//!
//! One task owns the TLS stream and the engine for its connection; nothing
//! else ever touches either. The loop multiplexes four inputs - socket
//! reads, application send requests, delivery completions, and protocol
//! timers - and always drains the engine's outbound bytes to the socket
//! before suspending again.

use std::{collections::HashMap, io, net::SocketAddr, time::Instant};

use palisade_amqp::{
    engine::{Engine, EngineEvent},
    message::{DeliveryState, DeliveryTag, OutboundMessage},
};
use palisade_common::{
    DEFAULT_CHANNEL_SIZE, events_bus::EventsBus, shutdown::ShutdownChannel,
    x500::LegalName,
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    sync::{mpsc, oneshot},
};
use tokio_rustls::TlsStream;
use tracing::{debug, warn};

use crate::events::ReceivedMessage;

/// An application message plus the slot its terminal state lands in.
pub(crate) type SendRequest = (OutboundMessage, oneshot::Sender<DeliveryState>);

/// Why a connection ended.
#[derive(Debug)]
pub(crate) enum Disconnect {
    /// Clean close from the remote end.
    PeerClosed,
    /// The engine gave up on the peer.
    Engine(String),
    Io(io::ErrorKind),
    /// Our own channel is stopping.
    Shutdown,
}

enum Wake {
    Shutdown,
    Read(usize),
    ReadClosed,
    ReadErr(io::ErrorKind),
    Send(Box<SendRequest>),
    SendersGone,
    Completion(DeliveryTag, bool),
    Tick,
}

pub(crate) struct Connection {
    pub stream: TlsStream<TcpStream>,
    pub engine: Engine,
    pub remote_address: SocketAddr,
    pub remote_legal_name: LegalName,
    pub on_receive: EventsBus<ReceivedMessage>,
    pub shutdown: ShutdownChannel,
}

impl Connection {
    pub async fn run(
        mut self,
        outbound_rx: &mut mpsc::Receiver<SendRequest>,
    ) -> Disconnect {
        let (completion_tx, mut completion_rx) =
            mpsc::channel::<(DeliveryTag, bool)>(DEFAULT_CHANNEL_SIZE);
        let mut in_flight: HashMap<
            DeliveryTag,
            oneshot::Sender<DeliveryState>,
        > = HashMap::new();
        let mut read_buf = vec![0u8; 16 << 10].into_boxed_slice();
        let mut next_tick = self.engine.tick(Instant::now());
        let mut engine_done: Option<Option<String>> = None;

        let disconnect = loop {
            // Surface whatever the engine produced since last round.
            while let Some(event) = self.engine.next_event() {
                match event {
                    EngineEvent::Opened =>
                        debug!("Link to {} is up", self.remote_legal_name),
                    EngineEvent::Message(delivery) => {
                        self.on_receive.notify(ReceivedMessage::new(
                            delivery.payload,
                            delivery.topic,
                            self.remote_legal_name.clone(),
                            delivery.application_properties,
                            delivery.tag,
                            completion_tx.clone(),
                        ));
                    }
                    EngineEvent::Settled { tag, state } =>
                        if let Some(reply) = in_flight.remove(&tag) {
                            let _ = reply.send(state);
                        },
                    EngineEvent::Closed { error } =>
                        engine_done = Some(error),
                }
            }

            // Put the engine's frames on the wire before suspending.
            let out = self.engine.drain_outbound();
            if !out.is_empty() {
                if let Err(e) = self.stream.write_all(&out).await {
                    break Disconnect::Io(e.kind());
                }
                if let Err(e) = self.stream.flush().await {
                    break Disconnect::Io(e.kind());
                }
            }
            if let Some(error) = engine_done.take() {
                break match error {
                    Some(e) => Disconnect::Engine(e),
                    None => Disconnect::PeerClosed,
                };
            }

            let wake = tokio::select! {
                // Mitigate possible select! race after a shutdown signal
                biased;
                () = self.shutdown.recv() => Wake::Shutdown,
                completion = completion_rx.recv() => match completion {
                    Some((tag, accepted)) => Wake::Completion(tag, accepted),
                    None => unreachable!("We hold a completion_tx"),
                },
                request = outbound_rx.recv(),
                    if self.engine.has_send_capacity() => match request
                {
                    Some(request) => Wake::Send(Box::new(request)),
                    None => Wake::SendersGone,
                },
                read = self.stream.read(&mut read_buf[..]) => match read {
                    Ok(0) => Wake::ReadClosed,
                    Ok(n) => Wake::Read(n),
                    Err(e) => Wake::ReadErr(e.kind()),
                },
                () = tokio::time::sleep_until(
                    tokio::time::Instant::from_std(next_tick),
                ) => Wake::Tick,
            };

            match wake {
                Wake::Shutdown | Wake::SendersGone => {
                    self.engine.close();
                    let out = self.engine.drain_outbound();
                    if !out.is_empty() {
                        let _ = self.stream.write_all(&out).await;
                        let _ = self.stream.flush().await;
                    }
                    break Disconnect::Shutdown;
                }
                Wake::Read(n) => self.engine.feed_inbound(&read_buf[..n]),
                Wake::ReadClosed => break Disconnect::PeerClosed,
                Wake::ReadErr(kind) => break Disconnect::Io(kind),
                Wake::Send(request) => {
                    let (msg, reply) = *request;
                    self.handle_send(msg, reply, &mut in_flight);
                }
                Wake::Completion(tag, accepted) =>
                    self.engine.complete(&tag, accepted),
                Wake::Tick => next_tick = self.engine.tick(Instant::now()),
            }
        };

        // The engine may have settled handles while tearing down.
        while let Some(event) = self.engine.next_event() {
            if let EngineEvent::Settled { tag, state } = event
                && let Some(reply) = in_flight.remove(&tag)
            {
                let _ = reply.send(state);
            }
        }
        // Anything still waiting never got a disposition.
        for (_tag, reply) in in_flight.drain() {
            let _ = reply.send(DeliveryState::Failed);
        }
        disconnect
    }

    /// Check a send request against the connection's authenticated peer
    /// before letting it anywhere near the wire.
    fn handle_send(
        &mut self,
        msg: OutboundMessage,
        reply: oneshot::Sender<DeliveryState>,
        in_flight: &mut HashMap<DeliveryTag, oneshot::Sender<DeliveryState>>,
    ) {
        if msg.destination_address != self.remote_address
            || msg.destination_legal_name != self.remote_legal_name
        {
            warn!(
                "Message misrouted: addressed to {} at {} but this \
                 connection is to {} at {}",
                msg.destination_legal_name,
                msg.destination_address,
                self.remote_legal_name,
                self.remote_address,
            );
            let _ = reply.send(DeliveryState::Rejected);
            return;
        }
        let tag = self.engine.enqueue_send(&msg);
        in_flight.insert(tag, reply);
    }
}
