//! AMI packets and packet classification

use crate::headers::AmiHeader;
use serde::ser::{Serialize, SerializeMap, Serializer};
use std::collections::HashMap;

/// One AMI packet: the header lines between two blank lines.
///
/// Headers keep arrival order. Names are case-sensitive and a repeated name
/// replaces the earlier value in place, except `Output` whose lines are
/// joined with `\n` by the decoder. Equality ignores order.
#[derive(Debug, Clone, Default)]
pub struct Packet {
    headers: Vec<(String, String)>,
}

impl Packet {
    /// Create an empty packet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a header value by exact name.
    pub fn header(&self, name: impl AsRef<str>) -> Option<&str> {
        let name = name.as_ref();
        self.headers
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// Whether the header is present.
    pub fn contains(&self, name: impl AsRef<str>) -> bool {
        self.header(name)
            .is_some()
    }

    /// Insert or replace a header.
    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self
            .headers
            .iter_mut()
            .find(|(k, _)| *k == name)
        {
            Some(slot) => slot.1 = value,
            None => self
                .headers
                .push((name, value)),
        }
    }

    /// Append to a header, joining with `\n` when it is already present.
    pub fn append_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self
            .headers
            .iter_mut()
            .find(|(k, _)| *k == name)
        {
            Some(slot) => {
                slot.1
                    .push('\n');
                slot.1
                    .push_str(&value);
            }
            None => self
                .headers
                .push((name, value)),
        }
    }

    /// Remove a header, returning its value.
    pub fn remove_header(&mut self, name: impl AsRef<str>) -> Option<String> {
        let name = name.as_ref();
        let pos = self
            .headers
            .iter()
            .position(|(k, _)| k == name)?;
        Some(
            self.headers
                .remove(pos)
                .1,
        )
    }

    /// Headers in arrival order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.headers
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Number of headers.
    pub fn len(&self) -> usize {
        self.headers
            .len()
    }

    /// `true` for the (valid) packet made of a lone blank line.
    pub fn is_empty(&self) -> bool {
        self.headers
            .is_empty()
    }

    /// Classification of this packet.
    pub fn kind(&self) -> PacketKind {
        PacketKind::classify(self)
    }

    /// `ActionID` header.
    pub fn action_id(&self) -> Option<&str> {
        self.header(AmiHeader::ActionId)
    }

    /// `Response` header.
    pub fn response(&self) -> Option<&str> {
        self.header(AmiHeader::Response)
    }

    /// `Event` header.
    pub fn event_name(&self) -> Option<&str> {
        self.header(AmiHeader::Event)
    }

    /// `Message` header.
    pub fn message(&self) -> Option<&str> {
        self.header(AmiHeader::Message)
    }

    /// Copy into an unordered map.
    pub fn to_map(&self) -> HashMap<String, String> {
        self.headers
            .iter()
            .cloned()
            .collect()
    }
}

impl PartialEq for Packet {
    fn eq(&self, other: &Self) -> bool {
        self.len() == other.len()
            && self
                .iter()
                .all(|(k, v)| other.header(k) == Some(v))
    }
}

impl Eq for Packet {}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Packet {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut packet = Packet::new();
        for (k, v) in iter {
            packet.set_header(k, v);
        }
        packet
    }
}

impl Serialize for Packet {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.len()))?;
        for (k, v) in self.iter() {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

/// What a packet is, judged only by its headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    /// Carries a `Response` header.
    Response,
    /// Carries an `Event` header and no `Response`.
    Event,
    /// Neither; dropped by the client.
    Other,
}

impl PacketKind {
    /// `Response` wins over `Event` when both are present.
    pub fn classify(packet: &Packet) -> Self {
        if packet.contains(AmiHeader::Response) {
            PacketKind::Response
        } else if packet.contains(AmiHeader::Event) {
            PacketKind::Event
        } else {
            PacketKind::Other
        }
    }
}
