//! Typed header names and response literals for AMI packets.

/// Error returned when parsing an unrecognized header name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseAmiHeaderError(pub String);

impl std::fmt::Display for ParseAmiHeaderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "unknown AMI header: {}", self.0)
    }
}

impl std::error::Error for ParseAmiHeaderError {}

define_wire_enum! {
    error_type: ParseAmiHeaderError,
    /// Header names with protocol meaning to the client.
    ///
    /// Packet lookups are case-sensitive, so these carry the exact spelling
    /// Asterisk puts on the wire. Use with [`Packet::header()`](crate::Packet::header).
    pub enum AmiHeader {
        Action => "Action",
        ActionId => "ActionID",
        Response => "Response",
        Event => "Event",
        Message => "Message",
        EventList => "EventList",
        ListItems => "ListItems",
        Items => "Items",
        Username => "Username",
        Secret => "Secret",
        Events => "Events",
        Channel => "Channel",
        Uniqueid => "Uniqueid",
        Privilege => "Privilege",
        Value => "Value",
        Variable => "Variable",
        Output => "Output",
    }
}

/// Error returned when parsing an unrecognized `Response` value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseResponseStatusError(pub String);

impl std::fmt::Display for ParseResponseStatusError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "unknown response status: {}", self.0)
    }
}

impl std::error::Error for ParseResponseStatusError {}

define_wire_enum! {
    error_type: ParseResponseStatusError,
    /// Literal values of the `Response` header.
    pub enum ResponseStatus {
        Success => "Success",
        Error => "Error",
        Follows => "Follows",
        Goodbye => "Goodbye",
        Pong => "Pong",
        EventsOn => "Events On",
        EventsOff => "Events Off",
    }
}

impl ResponseStatus {
    /// `true` for every literal except `Error`.
    pub fn is_success(&self) -> bool {
        !matches!(self, ResponseStatus::Error)
    }
}

/// Classify a raw `Response` value. Unknown literals count as failures.
pub(crate) fn response_succeeded(value: &str) -> bool {
    value
        .parse::<ResponseStatus>()
        .map(|s| s.is_success())
        .unwrap_or(false)
}
