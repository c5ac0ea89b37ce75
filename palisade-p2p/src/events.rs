//! Channel event types.

use std::{collections::BTreeMap, net::SocketAddr};

use bytes::Bytes;
use palisade_amqp::message::{DeliveryTag, PropertyValue};
use palisade_common::x500::LegalName;
use tokio::sync::mpsc;

/// One edge in a connection's lifecycle, published on a channel's
/// `on_connection` bus. For any endpoint, a `connected: false` event always
/// precedes the next `connected: true`.
#[derive(Clone, Debug)]
pub struct ConnectionChange {
    pub remote_address: SocketAddr,
    /// Present exactly when `connected` is true; taken from the peer
    /// certificate's subject, which the allow-list has already admitted.
    pub remote_legal_name: Option<LegalName>,
    pub connected: bool,
}

/// An authenticated inbound message, published on a channel's `on_receive`
/// bus. The receiver owes the sender a verdict: call [`complete`] once the
/// message has been durably handled (or refused).
///
/// [`complete`]: Self::complete
#[derive(Clone, Debug)]
pub struct ReceivedMessage {
    pub payload: Bytes,
    pub topic: String,
    /// From the connection's authenticated TLS identity, never from the
    /// message itself.
    pub source_legal_name: LegalName,
    pub application_properties: BTreeMap<String, PropertyValue>,
    tag: DeliveryTag,
    completions: mpsc::Sender<(DeliveryTag, bool)>,
}

impl ReceivedMessage {
    pub(crate) fn new(
        payload: Bytes,
        topic: String,
        source_legal_name: LegalName,
        application_properties: BTreeMap<String, PropertyValue>,
        tag: DeliveryTag,
        completions: mpsc::Sender<(DeliveryTag, bool)>,
    ) -> Self {
        Self {
            payload,
            topic,
            source_legal_name,
            application_properties,
            tag,
            completions,
        }
    }

    /// Accept (`true`) or reject (`false`) the delivery. This releases the
    /// sender's handle and returns credit to the link; until it is called
    /// the peer's send window shrinks. Completing twice is harmless, and
    /// completion after the connection died is a no-op.
    pub fn complete(&self, accepted: bool) {
        let _ = self.completions.try_send((self.tag.clone(), accepted));
    }
}
