//! The protocol state machine.
//!
//! One [`Engine`] instance drives exactly one AMQP 1.0 connection: the SASL
//! exchange, one session on channel 0, a sender link and a receiver link,
//! transfers with explicit dispositions, and idle-timeout heartbeats. The
//! engine is sans-io: the owning task feeds it raw bytes, writes out what it
//! drains, calls `tick` when the deadline it returned expires, and consumes
//! the events it queues.

use std::{
    collections::{BTreeMap, VecDeque},
    time::{Duration, Instant},
};

use bytes::{Bytes, BytesMut};
use tracing::{debug, info, warn};

use crate::{
    frames::{
        self, AMQP_PROTO_HEADER, AmqpError, Attach, Begin, Close,
        DeliveryOutcome, Disposition, Flow, Frame, FrameBody,
        MAX_FRAME_SIZE, MessageSections, Open, Performative,
        SASL_PROTO_HEADER, SaslFrame, Transfer,
    },
    message::{
        DeliveryState, DeliveryTag, InboundDelivery, OutboundMessage,
        PropertyValue,
    },
};

/// The idle timeout each end advertises by default.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Credit granted to the peer's sender link. Replenished only as the
/// application completes outstanding deliveries, which is how inbound
/// backpressure propagates to the peer.
const INBOUND_CREDIT_WINDOW: u32 = 64;

/// Session transfer windows. Large relative to the link credit window, so
/// the link credit is the effective throttle.
const SESSION_WINDOW: u32 = 2048;

const SENDER_HANDLE: u32 = 0;
const RECEIVER_HANDLE: u32 = 1;

const SASL_PLAIN: &str = "PLAIN";
/// sasl-outcome codes.
const SASL_CODE_OK: u8 = 0;
const SASL_CODE_AUTH: u8 = 1;

/// Leave room for the frame header and performative around the message
/// sections.
const MAX_MESSAGE_SIZE: usize = (MAX_FRAME_SIZE as usize) - 512;

#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Whether this end accepted the TCP connection.
    pub server_mode: bool,
    /// Our container-id: the local legal name string.
    pub local_identity: String,
    /// The container-id we expect the peer to assert. This comes from the
    /// peer's TLS certificate, so a mismatch means the AMQP layer disagrees
    /// with the authenticated identity.
    pub remote_identity: String,
    pub sasl_user: String,
    pub sasl_password: String,
    /// The idle timeout we advertise in Open.
    pub idle_timeout: Duration,
    /// Log every sent and received frame at INFO.
    pub trace_frames: bool,
}

impl EngineConfig {
    pub fn new(
        server_mode: bool,
        local_identity: impl Into<String>,
        remote_identity: impl Into<String>,
    ) -> Self {
        Self {
            server_mode,
            local_identity: local_identity.into(),
            remote_identity: remote_identity.into(),
            sasl_user: "peer".to_owned(),
            sasl_password: "peer".to_owned(),
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            trace_frames: false,
        }
    }
}

#[derive(Debug)]
pub enum EngineEvent {
    /// Both links are attached; transfers can flow.
    Opened,
    /// An unsettled delivery from the peer; pass its tag to
    /// [`Engine::complete`] once the application has dealt with it.
    Message(InboundDelivery),
    /// An outbound delivery reached a terminal state.
    Settled {
        tag: DeliveryTag,
        state: DeliveryState,
    },
    /// The connection is finished, cleanly or otherwise. Emitted exactly
    /// once.
    Closed { error: Option<String> },
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum ConnState {
    /// Expecting the peer's SASL protocol header.
    SaslHeader,
    /// Client: expecting sasl-mechanisms. Server: expecting sasl-init.
    SaslNegotiate,
    /// SASL done; expecting the peer's AMQP protocol header.
    AmqpHeader,
    /// Headers exchanged; expecting the peer's open.
    OpenExchange,
    /// Opens exchanged; expecting the peer's begin.
    BeginExchange,
    /// Session up; links attaching.
    Attaching,
    Active,
    /// We sent close and are waiting for the peer's.
    Closing,
    Closed,
}

struct PendingSend {
    tag: DeliveryTag,
    sections: MessageSections,
}

pub struct Engine {
    cfg: EngineConfig,
    state: ConnState,
    inbuf: BytesMut,
    outbuf: BytesMut,
    events: VecDeque<EngineEvent>,

    // --- session --- //
    next_outgoing_id: u32,
    next_incoming_id: u32,

    // --- sender link (our outbound deliveries) --- //
    sender_attached: bool,
    /// The peer's handle for its receiver end of our sender link; its flow
    /// frames carry this handle.
    peer_receiver_handle: Option<u32>,
    sender_delivery_count: u32,
    sender_credit: u32,
    next_tag_counter: u64,
    pending_sends: VecDeque<PendingSend>,
    /// delivery-id -> tag for transfers awaiting the peer's disposition.
    unsettled_out: BTreeMap<u32, DeliveryTag>,

    // --- receiver link (inbound deliveries) --- //
    receiver_attached: bool,
    /// The peer's handle for its sender end; its transfers carry this.
    peer_sender_handle: Option<u32>,
    receiver_delivery_count: u32,
    /// tag -> delivery-id for deliveries awaiting `complete`.
    unacked_in: BTreeMap<DeliveryTag, u32>,

    // --- idle timeout --- //
    remote_idle_timeout: Option<Duration>,
    last_received: Option<Instant>,
    last_sent: Option<Instant>,
    rx_activity: bool,
    tx_activity: bool,
}

impl Engine {
    pub fn new(cfg: EngineConfig) -> Self {
        let mut engine = Self {
            cfg,
            state: ConnState::SaslHeader,
            inbuf: BytesMut::new(),
            outbuf: BytesMut::new(),
            events: VecDeque::new(),
            next_outgoing_id: 0,
            next_incoming_id: 0,
            sender_attached: false,
            peer_receiver_handle: None,
            sender_delivery_count: 0,
            sender_credit: 0,
            next_tag_counter: 0,
            pending_sends: VecDeque::new(),
            unsettled_out: BTreeMap::new(),
            receiver_attached: false,
            peer_sender_handle: None,
            receiver_delivery_count: 0,
            unacked_in: BTreeMap::new(),
            remote_idle_timeout: None,
            last_received: None,
            last_sent: None,
            rx_activity: false,
            tx_activity: false,
        };
        if !engine.cfg.server_mode {
            // The client leads the SASL header exchange.
            engine.put_header(&SASL_PROTO_HEADER);
        }
        engine
    }

    pub fn is_closed(&self) -> bool {
        self.state == ConnState::Closed
    }

    /// Supply bytes read from the transport. Protocol violations do not
    /// return an error here; they surface as a [`EngineEvent::Closed`]
    /// event, with any final frames left in the outbound buffer.
    pub fn feed_inbound(&mut self, data: &[u8]) {
        if self.state == ConnState::Closed {
            return;
        }
        self.inbuf.extend_from_slice(data);
        self.rx_activity = true;
        self.process_inbuf();
    }

    /// Frames waiting to be written to the transport.
    pub fn drain_outbound(&mut self) -> Bytes {
        self.outbuf.split().freeze()
    }

    pub fn has_outbound(&self) -> bool {
        !self.outbuf.is_empty()
    }

    /// Pop the next queued event.
    pub fn next_event(&mut self) -> Option<EngineEvent> {
        self.events.pop_front()
    }

    /// Whether the sender link will take another message without growing
    /// its internal queue past a credit window's worth. Callers that hold
    /// their own bounded queue should stop feeding us when this is false,
    /// so backpressure reaches the producer instead of piling up here.
    pub fn has_send_capacity(&self) -> bool {
        self.pending_sends.len() < INBOUND_CREDIT_WINDOW as usize
    }

    /// Hand an application message to the sender link. The returned tag
    /// identifies the delivery in later [`EngineEvent::Settled`] events.
    /// Messages enqueued before the link opens are held and flushed in
    /// order.
    pub fn enqueue_send(&mut self, msg: &OutboundMessage) -> DeliveryTag {
        let tag = DeliveryTag::from_counter(self.next_tag_counter);
        self.next_tag_counter += 1;

        if msg.payload.len() > MAX_MESSAGE_SIZE {
            warn!(
                "Refusing {} byte message; max is {MAX_MESSAGE_SIZE}",
                msg.payload.len(),
            );
            self.events.push_back(EngineEvent::Settled {
                tag: tag.clone(),
                state: DeliveryState::Failed,
            });
            return tag;
        }

        let sections = MessageSections {
            to: Some(msg.destination_legal_name.to_string()),
            subject: Some(msg.topic.clone()),
            application_properties: msg
                .application_properties
                .iter()
                .map(|(k, v)| (k.clone(), v.to_value()))
                .collect(),
            data: msg.payload.clone(),
        };
        self.pending_sends.push_back(PendingSend {
            tag: tag.clone(),
            sections,
        });
        self.flush_sends();
        tag
    }

    /// Accept or reject an inbound delivery, emitting its disposition and
    /// replenishing the peer's credit. Unknown tags are ignored, so calling
    /// this twice is harmless.
    pub fn complete(&mut self, tag: &DeliveryTag, accepted: bool) {
        let Some(delivery_id) = self.unacked_in.remove(tag) else {
            return;
        };
        let state = if accepted {
            DeliveryOutcome::Accepted
        } else {
            DeliveryOutcome::Rejected
        };
        self.send_frame(Frame {
            channel: 0,
            body: FrameBody::Amqp {
                performative: Performative::Disposition(Disposition {
                    role_receiver: true,
                    first: delivery_id,
                    last: Some(delivery_id),
                    settled: Some(true),
                    state: Some(state),
                }),
                payload: Bytes::new(),
            },
        });
        self.send_receiver_flow();
    }

    /// Begin an orderly close. Final frames are left for `drain_outbound`.
    pub fn close(&mut self) {
        match self.state {
            ConnState::Closing | ConnState::Closed => (),
            ConnState::Active
            | ConnState::Attaching
            | ConnState::BeginExchange
            | ConnState::OpenExchange => {
                self.send_close(None);
                self.state = ConnState::Closing;
            }
            // The AMQP layer never came up; there is nothing to say.
            _ => self.finish(None),
        }
    }

    /// Run protocol timers. Call whenever the previously returned deadline
    /// passes; returns the next deadline.
    pub fn tick(&mut self, now: Instant) -> Instant {
        if self.rx_activity {
            self.last_received = Some(now);
            self.rx_activity = false;
        }
        if self.tx_activity {
            self.last_sent = Some(now);
            self.tx_activity = false;
        }
        let last_received = *self.last_received.get_or_insert(now);
        let last_sent = *self.last_sent.get_or_insert(now);

        // Our obligation: keep the wire non-idle from the peer's point of
        // view by emitting heartbeats at half its advertised timeout.
        let mut next = now + self.cfg.idle_timeout;
        if let Some(remote_idle) = self.remote_idle_timeout {
            let interval = remote_idle / 2;
            if self.state == ConnState::Active
                && now.duration_since(last_sent) >= interval
            {
                debug!("Emitting heartbeat");
                self.send_frame(Frame {
                    channel: 0,
                    body: FrameBody::Empty,
                });
                self.last_sent = Some(now);
                next = next.min(now + interval);
            } else {
                next = next.min(last_sent + interval);
            }
        }

        // The peer's obligation: if nothing arrives for twice what we
        // advertised, the connection is dead.
        let rx_deadline = last_received + self.cfg.idle_timeout * 2;
        if self.state == ConnState::Active && now >= rx_deadline {
            self.protocol_error("idle timeout expired");
            return now + self.cfg.idle_timeout;
        }
        next.min(rx_deadline)
    }

    // --- internals --- //

    fn put_header(&mut self, header: &[u8; 8]) {
        self.outbuf.extend_from_slice(header);
        self.tx_activity = true;
    }

    fn send_frame(&mut self, frame: Frame) {
        if self.cfg.trace_frames {
            info!("SENT {:?}", frame.body);
        }
        frames::encode_frame(&frame, &mut self.outbuf);
        self.tx_activity = true;
    }

    fn send_close(&mut self, error: Option<AmqpError>) {
        self.send_frame(Frame {
            channel: 0,
            body: FrameBody::Amqp {
                performative: Performative::Close(Close { error }),
                payload: Bytes::new(),
            },
        });
    }

    /// Tear down after a local protocol violation: notify the peer, fail
    /// everything in flight, and finish.
    fn protocol_error(&mut self, detail: &str) {
        warn!("Engine protocol error: {detail}");
        // Only say goodbye if the AMQP layer is actually up.
        if matches!(
            self.state,
            ConnState::OpenExchange
                | ConnState::BeginExchange
                | ConnState::Attaching
                | ConnState::Active
                | ConnState::Closing,
        ) {
            self.send_close(Some(AmqpError {
                condition: "amqp:connection:framing-error".to_owned(),
                description: Some(detail.to_owned()),
            }));
        }
        self.finish(Some(detail.to_owned()));
    }

    /// Enter the terminal state (exactly once) and fail in-flight sends.
    fn finish(&mut self, error: Option<String>) {
        if self.state == ConnState::Closed {
            return;
        }
        self.state = ConnState::Closed;
        for (_id, tag) in std::mem::take(&mut self.unsettled_out) {
            self.events.push_back(EngineEvent::Settled {
                tag,
                state: DeliveryState::Failed,
            });
        }
        for pending in std::mem::take(&mut self.pending_sends) {
            self.events.push_back(EngineEvent::Settled {
                tag: pending.tag,
                state: DeliveryState::Failed,
            });
        }
        self.unacked_in.clear();
        self.events.push_back(EngineEvent::Closed { error });
    }

    fn process_inbuf(&mut self) {
        loop {
            if self.state == ConnState::Closed {
                return;
            }

            // Protocol headers are raw 8-byte prefixes, not frames.
            if matches!(
                self.state,
                ConnState::SaslHeader | ConnState::AmqpHeader,
            ) {
                if self.inbuf.len() < 8 {
                    return;
                }
                let header: [u8; 8] = self.inbuf.split_to(8)[..]
                    .try_into()
                    .expect("Split to exactly 8 bytes");
                self.handle_header(header);
                continue;
            }

            match frames::decode_frame(&mut self.inbuf) {
                Ok(Some(frame)) => {
                    if self.cfg.trace_frames {
                        info!("RECV {:?}", frame.body);
                    }
                    self.handle_frame(frame);
                }
                Ok(None) => return,
                Err(e) => {
                    self.protocol_error(&format!("frame decode: {e}"));
                    return;
                }
            }
        }
    }

    fn handle_header(&mut self, header: [u8; 8]) {
        match self.state {
            ConnState::SaslHeader if header == SASL_PROTO_HEADER => {
                if self.cfg.server_mode {
                    // Answer with our header and offer PLAIN.
                    self.put_header(&SASL_PROTO_HEADER);
                    self.send_frame(Frame {
                        channel: 0,
                        body: FrameBody::Sasl(SaslFrame::Mechanisms {
                            mechanisms: vec![SASL_PLAIN.to_owned()],
                        }),
                    });
                }
                self.state = ConnState::SaslNegotiate;
            }
            ConnState::AmqpHeader if header == AMQP_PROTO_HEADER => {
                if self.cfg.server_mode {
                    self.put_header(&AMQP_PROTO_HEADER);
                    self.send_open();
                }
                self.state = ConnState::OpenExchange;
            }
            _ => self.protocol_error(&format!(
                "unexpected protocol header {header:02x?} in {:?}",
                self.state,
            )),
        }
    }

    fn send_open(&mut self) {
        let idle_ms = self.cfg.idle_timeout.as_millis() as u32;
        self.send_frame(Frame {
            channel: 0,
            body: FrameBody::Amqp {
                performative: Performative::Open(Open {
                    container_id: self.cfg.local_identity.clone(),
                    max_frame_size: Some(MAX_FRAME_SIZE),
                    channel_max: Some(0),
                    idle_time_out: Some(idle_ms),
                }),
                payload: Bytes::new(),
            },
        });
    }

    fn send_begin(&mut self, remote_channel: Option<u16>) {
        self.send_frame(Frame {
            channel: 0,
            body: FrameBody::Amqp {
                performative: Performative::Begin(Begin {
                    remote_channel,
                    next_outgoing_id: self.next_outgoing_id,
                    incoming_window: SESSION_WINDOW,
                    outgoing_window: SESSION_WINDOW,
                }),
                payload: Bytes::new(),
            },
        });
    }

    fn sender_link_name(&self) -> String {
        format!(
            "{} -> {}",
            self.cfg.local_identity, self.cfg.remote_identity,
        )
    }

    fn receiver_link_name(&self) -> String {
        format!(
            "{} -> {}",
            self.cfg.remote_identity, self.cfg.local_identity,
        )
    }

    /// Attach both of our link endpoints. Only the connection initiator
    /// does this proactively; the acceptor mirrors.
    fn send_attaches(&mut self) {
        self.send_frame(Frame {
            channel: 0,
            body: FrameBody::Amqp {
                performative: Performative::Attach(Attach {
                    name: self.sender_link_name(),
                    handle: SENDER_HANDLE,
                    role_receiver: false,
                    source_address: Some(self.cfg.local_identity.clone()),
                    target_address: Some(self.cfg.remote_identity.clone()),
                    initial_delivery_count: Some(0),
                }),
                payload: Bytes::new(),
            },
        });
        self.send_frame(Frame {
            channel: 0,
            body: FrameBody::Amqp {
                performative: Performative::Attach(Attach {
                    name: self.receiver_link_name(),
                    handle: RECEIVER_HANDLE,
                    role_receiver: true,
                    source_address: Some(self.cfg.remote_identity.clone()),
                    target_address: Some(self.cfg.local_identity.clone()),
                    initial_delivery_count: None,
                }),
                payload: Bytes::new(),
            },
        });
        self.send_receiver_flow();
    }

    /// Grant the peer's sender whatever part of the credit window is not
    /// taken up by deliveries the application has yet to complete.
    fn send_receiver_flow(&mut self) {
        let outstanding = self.unacked_in.len() as u32;
        let credit = INBOUND_CREDIT_WINDOW.saturating_sub(outstanding);
        self.send_frame(Frame {
            channel: 0,
            body: FrameBody::Amqp {
                performative: Performative::Flow(Flow {
                    next_incoming_id: Some(self.next_incoming_id),
                    incoming_window: SESSION_WINDOW,
                    next_outgoing_id: self.next_outgoing_id,
                    outgoing_window: SESSION_WINDOW,
                    handle: Some(RECEIVER_HANDLE),
                    delivery_count: Some(self.receiver_delivery_count),
                    link_credit: Some(credit),
                }),
                payload: Bytes::new(),
            },
        });
    }

    fn flush_sends(&mut self) {
        if self.state != ConnState::Active || !self.sender_attached {
            return;
        }
        while self.sender_credit > 0 {
            let Some(pending) = self.pending_sends.pop_front() else {
                return;
            };
            let delivery_id = self.next_outgoing_id;
            self.next_outgoing_id = self.next_outgoing_id.wrapping_add(1);
            self.sender_delivery_count =
                self.sender_delivery_count.wrapping_add(1);
            self.sender_credit -= 1;
            let tag_bytes = Bytes::copy_from_slice(pending.tag.as_bytes());
            self.unsettled_out.insert(delivery_id, pending.tag);
            let payload = frames::encode_message(&pending.sections);
            self.send_frame(Frame {
                channel: 0,
                body: FrameBody::Amqp {
                    performative: Performative::Transfer(Transfer {
                        handle: SENDER_HANDLE,
                        delivery_id: Some(delivery_id),
                        delivery_tag: Some(tag_bytes),
                        message_format: Some(0),
                        settled: Some(false),
                        more: Some(false),
                    }),
                    payload,
                },
            });
        }
    }

    fn handle_frame(&mut self, frame: Frame) {
        match frame.body {
            // Heartbeats are valid whenever the wire is up.
            FrameBody::Empty => (),
            FrameBody::Sasl(sasl) => self.handle_sasl(sasl),
            FrameBody::Amqp { performative, payload } =>
                self.handle_performative(performative, payload),
        }
    }

    fn handle_sasl(&mut self, sasl: SaslFrame) {
        if self.state != ConnState::SaslNegotiate {
            return self.protocol_error("sasl frame outside negotiation");
        }
        match (self.cfg.server_mode, sasl) {
            (false, SaslFrame::Mechanisms { mechanisms }) => {
                if !mechanisms.iter().any(|m| m == SASL_PLAIN) {
                    return self.protocol_error(
                        "peer does not offer SASL PLAIN",
                    );
                }
                let mut response = BytesMut::new();
                response.extend_from_slice(b"\0");
                response.extend_from_slice(self.cfg.sasl_user.as_bytes());
                response.extend_from_slice(b"\0");
                response
                    .extend_from_slice(self.cfg.sasl_password.as_bytes());
                self.send_frame(Frame {
                    channel: 0,
                    body: FrameBody::Sasl(SaslFrame::Init {
                        mechanism: SASL_PLAIN.to_owned(),
                        initial_response: Some(response.freeze()),
                    }),
                });
            }
            (false, SaslFrame::Outcome { code }) => {
                if code != SASL_CODE_OK {
                    return self.protocol_error(&format!(
                        "sasl authentication failed (code {code})",
                    ));
                }
                self.put_header(&AMQP_PROTO_HEADER);
                self.send_open();
                self.state = ConnState::AmqpHeader;
            }
            (true, SaslFrame::Init { mechanism, initial_response }) => {
                let ok = mechanism == SASL_PLAIN
                    && initial_response
                        .as_deref()
                        .map(|r| self.check_plain(r))
                        .unwrap_or(false);
                let code = if ok { SASL_CODE_OK } else { SASL_CODE_AUTH };
                self.send_frame(Frame {
                    channel: 0,
                    body: FrameBody::Sasl(SaslFrame::Outcome { code }),
                });
                if ok {
                    self.state = ConnState::AmqpHeader;
                } else {
                    self.finish(Some(
                        "peer failed SASL authentication".to_owned(),
                    ));
                }
            }
            (_, other) =>
                self.protocol_error(&format!("unexpected sasl frame {other:?}")),
        }
    }

    /// PLAIN initial response: authzid NUL authcid NUL passwd.
    fn check_plain(&self, response: &[u8]) -> bool {
        let mut parts = response.split(|b| *b == 0);
        let _authzid = parts.next();
        let authcid = parts.next();
        let passwd = parts.next();
        parts.next().is_none()
            && authcid == Some(self.cfg.sasl_user.as_bytes())
            && passwd == Some(self.cfg.sasl_password.as_bytes())
    }

    fn handle_performative(
        &mut self,
        performative: Performative,
        payload: Bytes,
    ) {
        match (self.state, performative) {
            (ConnState::OpenExchange, Performative::Open(open)) =>
                self.handle_open(open),
            (ConnState::BeginExchange, Performative::Begin(begin)) =>
                self.handle_begin(begin),
            (
                ConnState::Attaching | ConnState::Active,
                Performative::Attach(attach),
            ) => self.handle_attach(attach),
            (
                ConnState::Attaching | ConnState::Active,
                Performative::Flow(flow),
            ) => self.handle_flow(flow),
            (ConnState::Active, Performative::Transfer(transfer)) =>
                self.handle_transfer(transfer, payload),
            (ConnState::Active, Performative::Disposition(disp)) =>
                self.handle_disposition(disp),
            (_, Performative::Close(close)) => {
                let error = close
                    .error
                    .map(|e| match e.description {
                        Some(d) => format!("{}: {d}", e.condition),
                        None => e.condition,
                    });
                if self.state != ConnState::Closing {
                    // Peer-initiated close: answer before finishing.
                    self.send_close(None);
                }
                self.finish(error);
            }
            (_, Performative::Detach(detach)) => self.protocol_error(
                &format!("unexpected detach of handle {}", detach.handle),
            ),
            (_, Performative::End(_)) =>
                self.protocol_error("unexpected session end"),
            (state, other) => self.protocol_error(&format!(
                "performative {other:?} invalid in state {state:?}",
            )),
        }
    }

    fn handle_open(&mut self, open: Open) {
        if open.container_id != self.cfg.remote_identity {
            return self.protocol_error(&format!(
                "peer container-id '{}' does not match its authenticated \
                 identity '{}'",
                open.container_id, self.cfg.remote_identity,
            ));
        }
        if let Some(max) = open.max_frame_size
            && max < 512
        {
            return self.protocol_error("peer max-frame-size too small");
        }
        self.remote_idle_timeout = open
            .idle_time_out
            .filter(|ms| *ms > 0)
            .map(|ms| Duration::from_millis(u64::from(ms)));
        if !self.cfg.server_mode {
            self.send_begin(None);
        }
        self.state = ConnState::BeginExchange;
    }

    fn handle_begin(&mut self, begin: Begin) {
        self.next_incoming_id = begin.next_outgoing_id;
        if self.cfg.server_mode {
            self.send_begin(Some(0));
        } else {
            self.send_attaches();
        }
        self.state = ConnState::Attaching;
    }

    fn handle_attach(&mut self, attach: Attach) {
        if attach.role_receiver {
            // The peer's receiver end of our sender link.
            self.peer_receiver_handle = Some(attach.handle);
            if self.cfg.server_mode && !self.sender_attached {
                self.send_frame(Frame {
                    channel: 0,
                    body: FrameBody::Amqp {
                        performative: Performative::Attach(Attach {
                            name: attach.name,
                            handle: SENDER_HANDLE,
                            role_receiver: false,
                            source_address: attach.source_address,
                            target_address: attach.target_address,
                            initial_delivery_count: Some(0),
                        }),
                        payload: Bytes::new(),
                    },
                });
            }
            self.sender_attached = true;
        } else {
            // The peer's sender end of our receiver link.
            self.peer_sender_handle = Some(attach.handle);
            if self.cfg.server_mode && !self.receiver_attached {
                self.send_frame(Frame {
                    channel: 0,
                    body: FrameBody::Amqp {
                        performative: Performative::Attach(Attach {
                            name: attach.name,
                            handle: RECEIVER_HANDLE,
                            role_receiver: true,
                            source_address: attach.source_address,
                            target_address: attach.target_address,
                            initial_delivery_count: None,
                        }),
                        payload: Bytes::new(),
                    },
                });
                self.receiver_attached = true;
                self.send_receiver_flow();
            } else {
                self.receiver_attached = true;
            }
        }

        if self.sender_attached
            && self.receiver_attached
            && self.state != ConnState::Active
        {
            self.state = ConnState::Active;
            debug!("AMQP connection active");
            self.events.push_back(EngineEvent::Opened);
            self.flush_sends();
        }
    }

    fn handle_flow(&mut self, flow: Flow) {
        // Only flows for our sender link change what we can do.
        if flow.handle.is_some()
            && flow.handle == self.peer_receiver_handle
        {
            let delivery_count = flow.delivery_count.unwrap_or(0);
            let credit = flow.link_credit.unwrap_or(0);
            self.sender_credit = delivery_count
                .wrapping_add(credit)
                .wrapping_sub(self.sender_delivery_count);
            self.flush_sends();
        }
    }

    fn handle_transfer(&mut self, transfer: Transfer, payload: Bytes) {
        if Some(transfer.handle) != self.peer_sender_handle {
            return self.protocol_error(&format!(
                "transfer on unknown handle {}",
                transfer.handle,
            ));
        }
        if transfer.more == Some(true) {
            return self
                .protocol_error("multi-frame transfers are not supported");
        }
        let Some(delivery_id) = transfer.delivery_id else {
            return self.protocol_error("transfer without delivery-id");
        };
        if delivery_id != self.next_incoming_id {
            return self.protocol_error(&format!(
                "out-of-order delivery-id {delivery_id}, expected {}",
                self.next_incoming_id,
            ));
        }
        if self.unacked_in.len() as u32 >= INBOUND_CREDIT_WINDOW {
            return self.protocol_error("peer overran its link credit");
        }
        let Some(tag) = transfer.delivery_tag else {
            return self.protocol_error("transfer without delivery-tag");
        };

        self.next_incoming_id = self.next_incoming_id.wrapping_add(1);
        self.receiver_delivery_count =
            self.receiver_delivery_count.wrapping_add(1);

        let sections = match frames::decode_message(payload) {
            Ok(sections) => sections,
            Err(e) =>
                return self.protocol_error(&format!("bad message: {e}")),
        };
        let tag = DeliveryTag(tag);
        self.unacked_in.insert(tag.clone(), delivery_id);

        let application_properties = sections
            .application_properties
            .into_iter()
            .filter_map(|(k, v)| PropertyValue::from_value(v).map(|v| (k, v)))
            .collect();
        self.events.push_back(EngineEvent::Message(InboundDelivery {
            payload: sections.data,
            topic: sections.subject.unwrap_or_default(),
            application_properties,
            tag,
        }));
    }

    fn handle_disposition(&mut self, disp: Disposition) {
        if !disp.role_receiver {
            // We settle inbound deliveries ourselves; a sender-role
            // disposition has nothing for us to do.
            return;
        }
        let last = disp.last.unwrap_or(disp.first);
        for delivery_id in disp.first..=last {
            let Some(tag) = self.unsettled_out.remove(&delivery_id) else {
                continue;
            };
            let state = match disp.state {
                Some(DeliveryOutcome::Accepted) | None =>
                    DeliveryState::Acknowledged,
                Some(
                    DeliveryOutcome::Rejected | DeliveryOutcome::Released,
                ) => DeliveryState::Rejected,
            };
            self.events.push_back(EngineEvent::Settled { tag, state });
        }
    }
}

#[cfg(test)]
mod test {
    use std::collections::BTreeMap;

    use palisade_common::x500::LegalName;

    use super::*;

    fn alice() -> LegalName {
        LegalName::new("Alice Corp", "Madrid", "ES").unwrap()
    }

    fn bob() -> LegalName {
        LegalName::new("Bob Plc", "London", "GB").unwrap()
    }

    fn engine_pair() -> (Engine, Engine) {
        let client = Engine::new(EngineConfig::new(
            false,
            bob().to_string(),
            alice().to_string(),
        ));
        let server = Engine::new(EngineConfig::new(
            true,
            alice().to_string(),
            bob().to_string(),
        ));
        (client, server)
    }

    /// Shuttle bytes between the two engines until both go quiet.
    fn pump(a: &mut Engine, b: &mut Engine) {
        loop {
            let a_out = a.drain_outbound();
            let b_out = b.drain_outbound();
            if a_out.is_empty() && b_out.is_empty() {
                return;
            }
            if !a_out.is_empty() {
                b.feed_inbound(&a_out);
            }
            if !b_out.is_empty() {
                a.feed_inbound(&b_out);
            }
        }
    }

    fn drain_events(engine: &mut Engine) -> Vec<EngineEvent> {
        std::iter::from_fn(|| engine.next_event()).collect()
    }

    fn test_message(payload: &'static [u8]) -> OutboundMessage {
        OutboundMessage {
            payload: Bytes::from_static(payload),
            topic: "p2p.inbound".to_owned(),
            destination_legal_name: alice(),
            destination_address: "127.0.0.1:10005".parse().unwrap(),
            application_properties: BTreeMap::from([(
                "attempt".to_owned(),
                PropertyValue::Long(1),
            )]),
        }
    }

    #[test]
    fn handshake_reaches_active_on_both_ends() {
        let (mut client, mut server) = engine_pair();
        pump(&mut client, &mut server);

        assert!(matches!(
            drain_events(&mut client).as_slice(),
            [EngineEvent::Opened],
        ));
        assert!(matches!(
            drain_events(&mut server).as_slice(),
            [EngineEvent::Opened],
        ));
    }

    #[test]
    fn transfer_and_accept_roundtrip() {
        let (mut client, mut server) = engine_pair();
        pump(&mut client, &mut server);
        drain_events(&mut client);
        drain_events(&mut server);

        let tag = client.enqueue_send(&test_message(b"Test"));
        pump(&mut client, &mut server);

        // Server sees the message with its topic and properties.
        let events = drain_events(&mut server);
        let delivery = match events.as_slice() {
            [EngineEvent::Message(delivery)] => delivery.clone(),
            other => panic!("expected one message event, got {other:?}"),
        };
        assert_eq!(delivery.payload, Bytes::from_static(b"Test"));
        assert_eq!(delivery.topic, "p2p.inbound");
        assert_eq!(
            delivery.application_properties,
            BTreeMap::from([("attempt".to_owned(), PropertyValue::Long(1))]),
        );

        // Accepting emits a disposition which settles the client side.
        server.complete(&delivery.tag, true);
        pump(&mut client, &mut server);
        let events = drain_events(&mut client);
        assert!(matches!(
            events.as_slice(),
            [EngineEvent::Settled { tag: t, state: DeliveryState::Acknowledged }]
                if *t == tag,
        ));
    }

    #[test]
    fn rejected_delivery_settles_rejected() {
        let (mut client, mut server) = engine_pair();
        pump(&mut client, &mut server);
        drain_events(&mut client);
        drain_events(&mut server);

        let tag = client.enqueue_send(&test_message(b"nope"));
        pump(&mut client, &mut server);
        let events = drain_events(&mut server);
        let delivery = match events.as_slice() {
            [EngineEvent::Message(delivery)] => delivery.clone(),
            other => panic!("expected one message event, got {other:?}"),
        };

        server.complete(&delivery.tag, false);
        pump(&mut client, &mut server);
        assert!(matches!(
            drain_events(&mut client).as_slice(),
            [EngineEvent::Settled { tag: t, state: DeliveryState::Rejected }]
                if *t == tag,
        ));
    }

    #[test]
    fn messages_enqueued_before_open_flush_in_order() {
        let (mut client, mut server) = engine_pair();
        let tag1 = client.enqueue_send(&test_message(b"one"));
        let tag2 = client.enqueue_send(&test_message(b"two"));
        assert_ne!(tag1, tag2);

        pump(&mut client, &mut server);
        let events = drain_events(&mut server);
        let payloads = events
            .iter()
            .filter_map(|e| match e {
                EngineEvent::Message(m) => Some(m.payload.clone()),
                _ => None,
            })
            .collect::<Vec<_>>();
        assert_eq!(payloads, vec![
            Bytes::from_static(b"one"),
            Bytes::from_static(b"two"),
        ]);
    }

    #[test]
    fn close_fails_unsettled_deliveries() {
        let (mut client, mut server) = engine_pair();
        pump(&mut client, &mut server);
        drain_events(&mut client);
        drain_events(&mut server);

        let tag = client.enqueue_send(&test_message(b"doomed"));
        // Transfer goes out, but the server is torn down before it
        // dispositions anything.
        pump(&mut client, &mut server);
        drain_events(&mut server);

        client.close();
        server.feed_inbound(&client.drain_outbound());
        client.feed_inbound(&server.drain_outbound());

        let events = drain_events(&mut client);
        assert!(events.iter().any(|e| matches!(
            e,
            EngineEvent::Settled { tag: t, state: DeliveryState::Failed }
                if t == &tag,
        )));
        assert!(events
            .iter()
            .any(|e| matches!(e, EngineEvent::Closed { error: None })));
        assert!(client.is_closed());
    }

    #[test]
    fn wrong_sasl_credentials_are_refused() {
        let mut client_cfg = EngineConfig::new(
            false,
            bob().to_string(),
            alice().to_string(),
        );
        client_cfg.sasl_password = "wrong".to_owned();
        let mut client = Engine::new(client_cfg);
        let mut server = Engine::new(EngineConfig::new(
            true,
            alice().to_string(),
            bob().to_string(),
        ));
        pump(&mut client, &mut server);

        assert!(drain_events(&mut server).iter().any(|e| matches!(
            e,
            EngineEvent::Closed { error: Some(_) },
        )));
        assert!(drain_events(&mut client).iter().any(|e| matches!(
            e,
            EngineEvent::Closed { error: Some(_) },
        )));
    }

    #[test]
    fn container_id_mismatch_is_fatal() {
        // The client expects CHARLIE but the server asserts ALICE.
        let mut client = Engine::new(EngineConfig::new(
            false,
            bob().to_string(),
            "O=Charlie Ltd, L=Paris, C=FR".to_owned(),
        ));
        let mut server = Engine::new(EngineConfig::new(
            true,
            alice().to_string(),
            bob().to_string(),
        ));
        pump(&mut client, &mut server);

        assert!(drain_events(&mut client).iter().any(|e| matches!(
            e,
            EngineEvent::Closed { error: Some(_) },
        )));
    }

    #[test]
    fn credit_window_throttles_sender() {
        let (mut client, mut server) = engine_pair();
        pump(&mut client, &mut server);
        drain_events(&mut client);
        drain_events(&mut server);

        // Exhaust the full credit window plus some.
        let extra = 10usize;
        for _ in 0..(INBOUND_CREDIT_WINDOW as usize + extra) {
            client.enqueue_send(&test_message(b"x"));
        }
        pump(&mut client, &mut server);

        let deliveries = drain_events(&mut server)
            .into_iter()
            .filter_map(|e| match e {
                EngineEvent::Message(m) => Some(m),
                _ => None,
            })
            .collect::<Vec<_>>();
        // Only a window's worth was delivered...
        assert_eq!(deliveries.len(), INBOUND_CREDIT_WINDOW as usize);

        // ...until completions replenish credit and release the rest.
        for delivery in &deliveries {
            server.complete(&delivery.tag, true);
        }
        pump(&mut client, &mut server);
        let released = drain_events(&mut server)
            .into_iter()
            .filter(|e| matches!(e, EngineEvent::Message(_)))
            .count();
        assert_eq!(released, extra);
    }

    #[test]
    fn oversized_message_fails_immediately() {
        let (mut client, _server) = engine_pair();
        let msg = OutboundMessage {
            payload: Bytes::from(vec![0u8; MAX_MESSAGE_SIZE + 1]),
            ..test_message(b"")
        };
        let tag = client.enqueue_send(&msg);
        assert!(matches!(
            drain_events(&mut client).as_slice(),
            [EngineEvent::Settled { tag: t, state: DeliveryState::Failed }]
                if *t == tag,
        ));
    }

    #[test]
    fn heartbeats_keep_the_link_alive_and_silence_kills_it() {
        let (mut client, mut server) = engine_pair();
        pump(&mut client, &mut server);
        drain_events(&mut client);
        drain_events(&mut server);

        let start = Instant::now();
        // First tick latches the handshake activity timestamps.
        client.tick(start);
        assert!(!client.has_outbound());

        // Half the remote idle timeout with nothing sent: heartbeat.
        client.tick(start + DEFAULT_IDLE_TIMEOUT / 2);
        assert!(client.has_outbound());
        server.feed_inbound(&client.drain_outbound());
        assert!(drain_events(&mut server).is_empty());

        // Total silence past twice our advertised timeout: dead.
        client.tick(start + DEFAULT_IDLE_TIMEOUT * 3);
        assert!(drain_events(&mut client).iter().any(|e| matches!(
            e,
            EngineEvent::Closed { error: Some(_) },
        )));
    }
}
