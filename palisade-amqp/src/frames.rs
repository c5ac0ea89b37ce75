//! Frames, performatives, and message sections.
//!
//! Only the fields this engine actually reads or writes are modeled;
//! everything else is encoded as null and ignored on decode, which is what
//! the AMQP 1.0 composite-type rules prescribe for absent trailing fields.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::codec::{self, CodecError, Value};

/// The protocol header opening the plain AMQP layer.
pub const AMQP_PROTO_HEADER: [u8; 8] = *b"AMQP\x00\x01\x00\x00";
/// The protocol header opening the SASL security layer.
pub const SASL_PROTO_HEADER: [u8; 8] = *b"AMQP\x03\x01\x00\x00";

/// The largest frame either end of a palisade link will send or accept.
pub const MAX_FRAME_SIZE: u32 = 1024 * 1024;

const FRAME_HEADER_LEN: usize = 8;
const FRAME_TYPE_AMQP: u8 = 0x00;
const FRAME_TYPE_SASL: u8 = 0x01;

// Performative descriptor codes.
const OPEN: u64 = 0x10;
const BEGIN: u64 = 0x11;
const ATTACH: u64 = 0x12;
const FLOW: u64 = 0x13;
const TRANSFER: u64 = 0x14;
const DISPOSITION: u64 = 0x15;
const DETACH: u64 = 0x16;
const END: u64 = 0x17;
const CLOSE: u64 = 0x18;
const ERROR: u64 = 0x1d;

// Delivery outcome descriptor codes.
const ACCEPTED: u64 = 0x24;
const REJECTED: u64 = 0x25;
const RELEASED: u64 = 0x26;
const MODIFIED: u64 = 0x27;

// Terminus descriptor codes.
const SOURCE: u64 = 0x28;
const TARGET: u64 = 0x29;

// SASL descriptor codes.
const SASL_MECHANISMS: u64 = 0x40;
const SASL_INIT: u64 = 0x41;
const SASL_OUTCOME: u64 = 0x44;

// Message section descriptor codes.
const SECTION_PROPERTIES: u64 = 0x73;
const SECTION_APPLICATION_PROPERTIES: u64 = 0x74;
const SECTION_DATA: u64 = 0x75;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("frame declares size {0}, our maximum is {MAX_FRAME_SIZE}")]
    TooLarge(u32),
    #[error("malformed frame: {0}")]
    Malformed(String),
    #[error("unknown performative descriptor: 0x{0:02x}")]
    UnknownPerformative(u64),
}

#[derive(Clone, Debug, PartialEq)]
pub struct AmqpError {
    pub condition: String,
    pub description: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Open {
    pub container_id: String,
    pub max_frame_size: Option<u32>,
    pub channel_max: Option<u16>,
    /// Milliseconds of inactivity after which *we* may be dropped.
    pub idle_time_out: Option<u32>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Begin {
    pub remote_channel: Option<u16>,
    pub next_outgoing_id: u32,
    pub incoming_window: u32,
    pub outgoing_window: u32,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Attach {
    pub name: String,
    pub handle: u32,
    /// false = we are the sender on this link, true = the receiver.
    pub role_receiver: bool,
    pub source_address: Option<String>,
    pub target_address: Option<String>,
    /// Senders state their starting delivery count.
    pub initial_delivery_count: Option<u32>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Flow {
    pub next_incoming_id: Option<u32>,
    pub incoming_window: u32,
    pub next_outgoing_id: u32,
    pub outgoing_window: u32,
    pub handle: Option<u32>,
    pub delivery_count: Option<u32>,
    pub link_credit: Option<u32>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Transfer {
    pub handle: u32,
    pub delivery_id: Option<u32>,
    pub delivery_tag: Option<Bytes>,
    pub message_format: Option<u32>,
    pub settled: Option<bool>,
    pub more: Option<bool>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum DeliveryOutcome {
    Accepted,
    Rejected,
    Released,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Disposition {
    /// true when sent by the receiving end of a link.
    pub role_receiver: bool,
    pub first: u32,
    pub last: Option<u32>,
    pub settled: Option<bool>,
    pub state: Option<DeliveryOutcome>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Detach {
    pub handle: u32,
    pub closed: Option<bool>,
    pub error: Option<AmqpError>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Close {
    pub error: Option<AmqpError>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Performative {
    Open(Open),
    Begin(Begin),
    Attach(Attach),
    Flow(Flow),
    Transfer(Transfer),
    Disposition(Disposition),
    Detach(Detach),
    End(Option<AmqpError>),
    Close(Close),
}

#[derive(Clone, Debug, PartialEq)]
pub enum SaslFrame {
    Mechanisms {
        mechanisms: Vec<String>,
    },
    Init {
        mechanism: String,
        initial_response: Option<Bytes>,
    },
    Outcome {
        code: u8,
    },
}

#[derive(Clone, Debug, PartialEq)]
pub enum FrameBody {
    Amqp {
        performative: Performative,
        payload: Bytes,
    },
    Sasl(SaslFrame),
    /// A heartbeat.
    Empty,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Frame {
    pub channel: u16,
    pub body: FrameBody,
}

// --- encoding --- //

pub fn encode_frame(frame: &Frame, out: &mut BytesMut) {
    let (frame_type, body) = match &frame.body {
        FrameBody::Empty => (FRAME_TYPE_AMQP, BytesMut::new()),
        FrameBody::Amqp {
            performative,
            payload,
        } => {
            let mut body = BytesMut::new();
            codec::encode(&performative_value(performative), &mut body);
            body.put_slice(payload);
            (FRAME_TYPE_AMQP, body)
        }
        FrameBody::Sasl(sasl) => {
            let mut body = BytesMut::new();
            codec::encode(&sasl_value(sasl), &mut body);
            (FRAME_TYPE_SASL, body)
        }
    };

    out.put_u32((FRAME_HEADER_LEN + body.len()) as u32);
    out.put_u8(2); // doff
    out.put_u8(frame_type);
    out.put_u16(frame.channel);
    out.put_slice(&body);
}

/// Try to split one whole frame off the front of `buf`. Returns `None` when
/// more bytes are needed.
pub fn decode_frame(
    buf: &mut BytesMut,
) -> Result<Option<Frame>, FrameError> {
    if buf.len() < FRAME_HEADER_LEN {
        return Ok(None);
    }
    let size = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
    if size < FRAME_HEADER_LEN as u32 {
        return Err(FrameError::Malformed(format!("frame size {size}")));
    }
    if size > MAX_FRAME_SIZE {
        return Err(FrameError::TooLarge(size));
    }
    if buf.len() < size as usize {
        return Ok(None);
    }

    let mut frame = buf.split_to(size as usize).freeze();
    frame.advance(4);
    let doff = frame.get_u8();
    let frame_type = frame.get_u8();
    let channel = frame.get_u16();
    if doff < 2 {
        return Err(FrameError::Malformed(format!("doff {doff}")));
    }
    let extended_header = (doff as usize) * 4 - FRAME_HEADER_LEN;
    if frame.remaining() < extended_header {
        return Err(FrameError::Malformed("truncated header".to_owned()));
    }
    frame.advance(extended_header);

    if frame.is_empty() {
        return Ok(Some(Frame {
            channel,
            body: FrameBody::Empty,
        }));
    }

    let value = codec::decode(&mut frame)?;
    let body = match frame_type {
        FRAME_TYPE_AMQP => FrameBody::Amqp {
            performative: performative_from_value(value)?,
            payload: frame,
        },
        FRAME_TYPE_SASL => FrameBody::Sasl(sasl_from_value(value)?),
        other =>
            return Err(FrameError::Malformed(format!("frame type {other}"))),
    };
    Ok(Some(Frame { channel, body }))
}

// --- performative <-> value --- //

fn described(code: u64, fields: Vec<Value>) -> Value {
    Value::Described(
        Box::new(Value::ULong(code)),
        Box::new(Value::List(fields)),
    )
}

fn opt_str(s: &Option<String>) -> Value {
    match s {
        Some(s) => Value::String(s.clone()),
        None => Value::Null,
    }
}

fn opt_u32(n: &Option<u32>) -> Value {
    match n {
        Some(n) => Value::UInt(*n),
        None => Value::Null,
    }
}

fn opt_bool(b: &Option<bool>) -> Value {
    match b {
        Some(b) => Value::Bool(*b),
        None => Value::Null,
    }
}

fn error_value(err: &Option<AmqpError>) -> Value {
    match err {
        None => Value::Null,
        Some(err) => described(
            ERROR,
            vec![
                Value::Symbol(err.condition.clone()),
                opt_str(&err.description),
            ],
        ),
    }
}

fn terminus_value(code: u64, address: &Option<String>) -> Value {
    described(code, vec![opt_str(address)])
}

fn outcome_value(outcome: &DeliveryOutcome) -> Value {
    let code = match outcome {
        DeliveryOutcome::Accepted => ACCEPTED,
        DeliveryOutcome::Rejected => REJECTED,
        DeliveryOutcome::Released => RELEASED,
    };
    described(code, Vec::new())
}

fn performative_value(perf: &Performative) -> Value {
    match perf {
        Performative::Open(open) => described(
            OPEN,
            vec![
                Value::String(open.container_id.clone()),
                Value::Null, // hostname
                opt_u32(&open.max_frame_size),
                match open.channel_max {
                    Some(n) => Value::UShort(n),
                    None => Value::Null,
                },
                opt_u32(&open.idle_time_out),
            ],
        ),
        Performative::Begin(begin) => described(
            BEGIN,
            vec![
                match begin.remote_channel {
                    Some(n) => Value::UShort(n),
                    None => Value::Null,
                },
                Value::UInt(begin.next_outgoing_id),
                Value::UInt(begin.incoming_window),
                Value::UInt(begin.outgoing_window),
            ],
        ),
        Performative::Attach(attach) => described(
            ATTACH,
            vec![
                Value::String(attach.name.clone()),
                Value::UInt(attach.handle),
                Value::Bool(attach.role_receiver),
                // snd-settle-mode 0 (unsettled), rcv-settle-mode 0 (first)
                Value::UByte(0),
                Value::UByte(0),
                terminus_value(SOURCE, &attach.source_address),
                terminus_value(TARGET, &attach.target_address),
                Value::Null, // unsettled
                Value::Null, // incomplete-unsettled
                opt_u32(&attach.initial_delivery_count),
            ],
        ),
        Performative::Flow(flow) => described(
            FLOW,
            vec![
                opt_u32(&flow.next_incoming_id),
                Value::UInt(flow.incoming_window),
                Value::UInt(flow.next_outgoing_id),
                Value::UInt(flow.outgoing_window),
                opt_u32(&flow.handle),
                opt_u32(&flow.delivery_count),
                opt_u32(&flow.link_credit),
            ],
        ),
        Performative::Transfer(transfer) => described(
            TRANSFER,
            vec![
                Value::UInt(transfer.handle),
                opt_u32(&transfer.delivery_id),
                match &transfer.delivery_tag {
                    Some(tag) => Value::Binary(tag.clone()),
                    None => Value::Null,
                },
                opt_u32(&transfer.message_format),
                opt_bool(&transfer.settled),
                opt_bool(&transfer.more),
            ],
        ),
        Performative::Disposition(disp) => described(
            DISPOSITION,
            vec![
                Value::Bool(disp.role_receiver),
                Value::UInt(disp.first),
                opt_u32(&disp.last),
                opt_bool(&disp.settled),
                match &disp.state {
                    Some(outcome) => outcome_value(outcome),
                    None => Value::Null,
                },
            ],
        ),
        Performative::Detach(detach) => described(
            DETACH,
            vec![
                Value::UInt(detach.handle),
                opt_bool(&detach.closed),
                error_value(&detach.error),
            ],
        ),
        Performative::End(error) => described(END, vec![error_value(error)]),
        Performative::Close(close) =>
            described(CLOSE, vec![error_value(&close.error)]),
    }
}

/// Reads composite-type fields in order, yielding nulls once the encoded
/// list runs out.
struct Fields(std::vec::IntoIter<Value>);

impl Fields {
    fn from_value(value: Value) -> Result<Self, FrameError> {
        match value {
            Value::List(items) => Ok(Self(items.into_iter())),
            other => Err(FrameError::Malformed(format!(
                "expected field list, found {}",
                other.type_name(),
            ))),
        }
    }

    fn next(&mut self) -> Value {
        self.0.next().unwrap_or(Value::Null)
    }
}

fn split_described(value: Value) -> Result<(u64, Value), FrameError> {
    match value {
        Value::Described(descriptor, described) => match *descriptor {
            Value::ULong(code) => Ok((code, *described)),
            other => Err(FrameError::Malformed(format!(
                "unsupported descriptor type {}",
                other.type_name(),
            ))),
        },
        other => Err(FrameError::Malformed(format!(
            "expected described type, found {}",
            other.type_name(),
        ))),
    }
}

fn error_from_value(value: Value) -> Result<Option<AmqpError>, FrameError> {
    if value == Value::Null {
        return Ok(None);
    }
    let (code, value) = split_described(value)?;
    if code != ERROR {
        return Err(FrameError::Malformed(format!(
            "expected error descriptor, found 0x{code:02x}",
        )));
    }
    let mut fields = Fields::from_value(value)?;
    let condition = fields
        .next()
        .into_opt_symbol()?
        .ok_or_else(|| FrameError::Malformed("error without condition".to_owned()))?;
    let description = fields.next().into_opt_string()?;
    Ok(Some(AmqpError {
        condition,
        description,
    }))
}

fn terminus_address(value: Value) -> Result<Option<String>, FrameError> {
    if value == Value::Null {
        return Ok(None);
    }
    let (_code, value) = split_described(value)?;
    let mut fields = Fields::from_value(value)?;
    Ok(fields.next().into_opt_string()?)
}

fn outcome_from_value(
    value: Value,
) -> Result<Option<DeliveryOutcome>, FrameError> {
    if value == Value::Null {
        return Ok(None);
    }
    let (code, _value) = split_described(value)?;
    match code {
        ACCEPTED => Ok(Some(DeliveryOutcome::Accepted)),
        REJECTED => Ok(Some(DeliveryOutcome::Rejected)),
        RELEASED | MODIFIED => Ok(Some(DeliveryOutcome::Released)),
        other => Err(FrameError::Malformed(format!(
            "unknown delivery state 0x{other:02x}",
        ))),
    }
}

fn performative_from_value(
    value: Value,
) -> Result<Performative, FrameError> {
    let (code, value) = split_described(value)?;
    let mut f = Fields::from_value(value)?;
    let missing =
        |what: &str| FrameError::Malformed(format!("missing {what}"));

    match code {
        OPEN => {
            let container_id = f
                .next()
                .into_opt_string()?
                .ok_or_else(|| missing("container-id"))?;
            let _hostname = f.next();
            Ok(Performative::Open(Open {
                container_id,
                max_frame_size: f.next().into_opt_u32()?,
                channel_max: f.next().into_opt_u16()?,
                idle_time_out: f.next().into_opt_u32()?,
            }))
        }
        BEGIN => Ok(Performative::Begin(Begin {
            remote_channel: f.next().into_opt_u16()?,
            next_outgoing_id: f
                .next()
                .into_opt_u32()?
                .ok_or_else(|| missing("next-outgoing-id"))?,
            incoming_window: f
                .next()
                .into_opt_u32()?
                .ok_or_else(|| missing("incoming-window"))?,
            outgoing_window: f
                .next()
                .into_opt_u32()?
                .ok_or_else(|| missing("outgoing-window"))?,
        })),
        ATTACH => {
            let name =
                f.next().into_opt_string()?.ok_or_else(|| missing("name"))?;
            let handle =
                f.next().into_opt_u32()?.ok_or_else(|| missing("handle"))?;
            let role_receiver = f
                .next()
                .into_opt_bool()?
                .ok_or_else(|| missing("role"))?;
            let _snd_settle_mode = f.next();
            let _rcv_settle_mode = f.next();
            let source_address = terminus_address(f.next())?;
            let target_address = terminus_address(f.next())?;
            let _unsettled = f.next();
            let _incomplete_unsettled = f.next();
            Ok(Performative::Attach(Attach {
                name,
                handle,
                role_receiver,
                source_address,
                target_address,
                initial_delivery_count: f.next().into_opt_u32()?,
            }))
        }
        FLOW => Ok(Performative::Flow(Flow {
            next_incoming_id: f.next().into_opt_u32()?,
            incoming_window: f
                .next()
                .into_opt_u32()?
                .ok_or_else(|| missing("incoming-window"))?,
            next_outgoing_id: f
                .next()
                .into_opt_u32()?
                .ok_or_else(|| missing("next-outgoing-id"))?,
            outgoing_window: f
                .next()
                .into_opt_u32()?
                .ok_or_else(|| missing("outgoing-window"))?,
            handle: f.next().into_opt_u32()?,
            delivery_count: f.next().into_opt_u32()?,
            link_credit: f.next().into_opt_u32()?,
        })),
        TRANSFER => Ok(Performative::Transfer(Transfer {
            handle: f.next().into_opt_u32()?.ok_or_else(|| missing("handle"))?,
            delivery_id: f.next().into_opt_u32()?,
            delivery_tag: f.next().into_opt_binary()?,
            message_format: f.next().into_opt_u32()?,
            settled: f.next().into_opt_bool()?,
            more: f.next().into_opt_bool()?,
        })),
        DISPOSITION => Ok(Performative::Disposition(Disposition {
            role_receiver: f
                .next()
                .into_opt_bool()?
                .ok_or_else(|| missing("role"))?,
            first: f.next().into_opt_u32()?.ok_or_else(|| missing("first"))?,
            last: f.next().into_opt_u32()?,
            settled: f.next().into_opt_bool()?,
            state: outcome_from_value(f.next())?,
        })),
        DETACH => Ok(Performative::Detach(Detach {
            handle: f.next().into_opt_u32()?.ok_or_else(|| missing("handle"))?,
            closed: f.next().into_opt_bool()?,
            error: error_from_value(f.next())?,
        })),
        END => Ok(Performative::End(error_from_value(f.next())?)),
        CLOSE => Ok(Performative::Close(Close {
            error: error_from_value(f.next())?,
        })),
        other => Err(FrameError::UnknownPerformative(other)),
    }
}

// --- sasl <-> value --- //

fn sasl_value(sasl: &SaslFrame) -> Value {
    match sasl {
        SaslFrame::Mechanisms { mechanisms } => {
            let value = if mechanisms.len() == 1 {
                Value::Symbol(mechanisms[0].clone())
            } else {
                Value::List(
                    mechanisms
                        .iter()
                        .map(|m| Value::Symbol(m.clone()))
                        .collect(),
                )
            };
            described(SASL_MECHANISMS, vec![value])
        }
        SaslFrame::Init {
            mechanism,
            initial_response,
        } => described(
            SASL_INIT,
            vec![
                Value::Symbol(mechanism.clone()),
                match initial_response {
                    Some(bytes) => Value::Binary(bytes.clone()),
                    None => Value::Null,
                },
            ],
        ),
        SaslFrame::Outcome { code } =>
            described(SASL_OUTCOME, vec![Value::UByte(*code)]),
    }
}

fn sasl_from_value(value: Value) -> Result<SaslFrame, FrameError> {
    let (code, value) = split_described(value)?;
    let mut f = Fields::from_value(value)?;
    match code {
        SASL_MECHANISMS => {
            let mechanisms = match f.next() {
                Value::Symbol(s) => vec![s],
                Value::List(items) => items
                    .into_iter()
                    .map(|item| {
                        item.into_opt_symbol()?.ok_or_else(|| {
                            FrameError::Malformed(
                                "null mechanism".to_owned(),
                            )
                        })
                    })
                    .collect::<Result<Vec<_>, _>>()?,
                other =>
                    return Err(FrameError::Malformed(format!(
                        "bad mechanisms field: {}",
                        other.type_name(),
                    ))),
            };
            Ok(SaslFrame::Mechanisms { mechanisms })
        }
        SASL_INIT => Ok(SaslFrame::Init {
            mechanism: f.next().into_opt_symbol()?.ok_or_else(|| {
                FrameError::Malformed("init without mechanism".to_owned())
            })?,
            initial_response: f.next().into_opt_binary()?,
        }),
        SASL_OUTCOME => Ok(SaslFrame::Outcome {
            code: f.next().into_opt_u8()?.ok_or_else(|| {
                FrameError::Malformed("outcome without code".to_owned())
            })?,
        }),
        other => Err(FrameError::UnknownPerformative(other)),
    }
}

// --- message sections --- //

/// The sections of a single-frame message, as this engine uses them: the
/// destination in `properties.to`, the topic in `properties.subject`, the
/// scalar application properties, and one binary data section.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MessageSections {
    pub to: Option<String>,
    pub subject: Option<String>,
    pub application_properties: Vec<(String, Value)>,
    pub data: Bytes,
}

pub fn encode_message(msg: &MessageSections) -> Bytes {
    let mut buf = BytesMut::new();
    codec::encode(
        &described(
            SECTION_PROPERTIES,
            vec![
                Value::Null, // message-id
                Value::Null, // user-id
                opt_str(&msg.to),
                opt_str(&msg.subject),
            ],
        ),
        &mut buf,
    );
    if !msg.application_properties.is_empty() {
        let pairs = msg
            .application_properties
            .iter()
            .map(|(k, v)| (Value::String(k.clone()), v.clone()))
            .collect();
        codec::encode(
            &Value::Described(
                Box::new(Value::ULong(SECTION_APPLICATION_PROPERTIES)),
                Box::new(Value::Map(pairs)),
            ),
            &mut buf,
        );
    }
    codec::encode(
        &Value::Described(
            Box::new(Value::ULong(SECTION_DATA)),
            Box::new(Value::Binary(msg.data.clone())),
        ),
        &mut buf,
    );
    buf.freeze()
}

pub fn decode_message(mut payload: Bytes) -> Result<MessageSections, FrameError> {
    let mut msg = MessageSections::default();
    let mut saw_data = false;
    while payload.has_remaining() {
        let (code, value) = split_described(codec::decode(&mut payload)?)?;
        match code {
            SECTION_PROPERTIES => {
                let mut f = Fields::from_value(value)?;
                let _message_id = f.next();
                let _user_id = f.next();
                msg.to = f.next().into_opt_string()?;
                msg.subject = f.next().into_opt_string()?;
            }
            SECTION_APPLICATION_PROPERTIES => match value {
                Value::Map(pairs) => {
                    for (k, v) in pairs {
                        let k = k.into_opt_string()?.ok_or_else(|| {
                            FrameError::Malformed(
                                "non-string application property key"
                                    .to_owned(),
                            )
                        })?;
                        msg.application_properties.push((k, v));
                    }
                }
                other =>
                    return Err(FrameError::Malformed(format!(
                        "application-properties is {}",
                        other.type_name(),
                    ))),
            },
            SECTION_DATA => {
                msg.data = value.into_opt_binary()?.ok_or_else(|| {
                    FrameError::Malformed("data section is not binary".to_owned())
                })?;
                saw_data = true;
            }
            // header, annotations, footer: carried but unused
            _ => (),
        }
    }
    if !saw_data {
        return Err(FrameError::Malformed("message has no data section".to_owned()));
    }
    Ok(msg)
}
