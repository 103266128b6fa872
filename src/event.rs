//! Events delivered to subscribers

use crate::{headers::AmiHeader, packet::Packet};
use serde::Serialize;

/// An AMI event not consumed by a list action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct AmiEvent {
    packet: Packet,
}

impl AmiEvent {
    /// Wrap a packet classified as an event.
    pub fn new(packet: Packet) -> Self {
        Self { packet }
    }

    /// Event name (`Event` header).
    pub fn name(&self) -> &str {
        self.packet
            .event_name()
            .unwrap_or_default()
    }

    /// Look up a header by exact name.
    pub fn header(&self, name: impl AsRef<str>) -> Option<&str> {
        self.packet
            .header(name)
    }

    /// `ActionID` echoed from the action that caused this event, if any.
    pub fn action_id(&self) -> Option<&str> {
        self.packet
            .action_id()
    }

    /// `Privilege` header (e.g. `call,all`).
    pub fn privilege(&self) -> Option<&str> {
        self.header(AmiHeader::Privilege)
    }

    /// `Channel` header.
    pub fn channel(&self) -> Option<&str> {
        self.header(AmiHeader::Channel)
    }

    /// `Uniqueid` header.
    pub fn uniqueid(&self) -> Option<&str> {
        self.header(AmiHeader::Uniqueid)
    }

    /// The underlying packet.
    pub fn packet(&self) -> &Packet {
        &self.packet
    }

    /// Unwrap into the underlying packet.
    pub fn into_packet(self) -> Packet {
        self.packet
    }
}

impl From<Packet> for AmiEvent {
    fn from(packet: Packet) -> Self {
        Self::new(packet)
    }
}
