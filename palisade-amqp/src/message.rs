//! Application-level message types.

use std::{collections::BTreeMap, net::SocketAddr};

use bytes::Bytes;
use palisade_common::x500::LegalName;

use crate::codec::Value;

/// Scalar values allowed in application properties.
#[derive(Clone, Debug, PartialEq)]
pub enum PropertyValue {
    Bool(bool),
    Long(i64),
    String(String),
}

impl PropertyValue {
    pub(crate) fn to_value(&self) -> Value {
        match self {
            Self::Bool(b) => Value::Bool(*b),
            Self::Long(n) => Value::Long(*n),
            Self::String(s) => Value::String(s.clone()),
        }
    }

    pub(crate) fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Bool(b) => Some(Self::Bool(b)),
            Value::Long(n) => Some(Self::Long(n)),
            Value::Int(n) => Some(Self::Long(i64::from(n))),
            Value::UByte(n) => Some(Self::Long(i64::from(n))),
            Value::UShort(n) => Some(Self::Long(i64::from(n))),
            Value::UInt(n) => Some(Self::Long(i64::from(n))),
            Value::String(s) => Some(Self::String(s)),
            _ => None,
        }
    }
}

/// The tag stamped on each delivery, unique within one connection.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct DeliveryTag(pub(crate) Bytes);

impl DeliveryTag {
    pub(crate) fn from_counter(counter: u64) -> Self {
        Self(Bytes::copy_from_slice(&counter.to_be_bytes()))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// Terminal state of an outbound message.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum DeliveryState {
    /// The peer accepted the delivery.
    Acknowledged,
    /// The peer rejected or released the delivery, or it was refused
    /// locally before it ever reached the wire.
    Rejected,
    /// The connection ended before a disposition arrived, or the message
    /// could not be queued.
    Failed,
}

/// An application message bound for a specific peer.
#[derive(Clone, Debug)]
pub struct OutboundMessage {
    pub payload: Bytes,
    pub topic: String,
    /// The identity the caller believes it is talking to; the channel
    /// refuses to send if this is not the connection's authenticated peer.
    pub destination_legal_name: LegalName,
    /// Likewise for the transport address.
    pub destination_address: SocketAddr,
    pub application_properties: BTreeMap<String, PropertyValue>,
}

/// A message delivered by the peer, awaiting a local accept/reject via
/// `complete`.
#[derive(Clone, Debug)]
pub struct InboundDelivery {
    pub payload: Bytes,
    pub topic: String,
    pub application_properties: BTreeMap<String, PropertyValue>,
    /// Hand this back to `complete` to emit the disposition.
    pub tag: DeliveryTag,
}
