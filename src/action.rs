//! Action requests, expected response shapes and result values

use crate::{
    constants::{HEADER_SEPARATOR, LINE_TERMINATOR},
    error::{AmiError, AmiResult},
    headers::AmiHeader,
    packet::Packet,
};
use serde::Serialize;
use std::fmt;
use std::time::Duration;

/// Field names whose values never appear in logs or `Debug` output.
const REDACTED_FIELDS: &[&str] = &["Secret", "Key"];

/// Validate that a user-provided string contains no newline characters.
///
/// AMI packets are line-delimited; embedded newlines would allow injection
/// of arbitrary headers or whole actions.
fn validate_no_newlines(s: &str, context: &str) -> AmiResult<()> {
    if s.contains('\n') || s.contains('\r') {
        return Err(AmiError::protocol_error(format!(
            "{} must not contain newlines",
            context
        )));
    }
    Ok(())
}

/// How a multi-packet list reply is recognized and validated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListSpec {
    /// Event name that closes the list, e.g. `StatusComplete`.
    pub complete_event: String,
    /// When set, only events with this name are collected (their `Event`
    /// header removed) and other events are swallowed. When `None`, every
    /// packet before the terminator is collected verbatim.
    pub item_event: Option<String>,
    /// Terminator header carrying the declared item count.
    pub count_header: Option<String>,
    /// Fail the action when the declared count disagrees with the items.
    pub strict_count: bool,
}

impl ListSpec {
    /// List closed by `complete_event`, accepting every intervening packet.
    pub fn new(complete_event: impl Into<String>) -> Self {
        Self {
            complete_event: complete_event.into(),
            item_event: None,
            count_header: None,
            strict_count: false,
        }
    }

    /// Collect only events named `item_event`.
    pub fn items(mut self, item_event: impl Into<String>) -> Self {
        self.item_event = Some(item_event.into());
        self
    }

    /// Validate against the count in `header` on the terminator.
    pub fn count_header(mut self, header: impl Into<String>) -> Self {
        self.count_header = Some(header.into());
        self
    }

    /// Promote a count mismatch from a warning to an error.
    pub fn strict(mut self) -> Self {
        self.strict_count = true;
        self
    }
}

/// Shape of the result an action produces.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ResponseShape {
    /// Success or failure only.
    #[default]
    Bool,
    /// The value of one named response field.
    Text(String),
    /// Every field of the response.
    Mapping,
    /// A list of event packets; see [`ListSpec`].
    List(ListSpec),
}

impl ResponseShape {
    /// Shorthand for [`ResponseShape::Text`].
    pub fn text(field: impl Into<String>) -> Self {
        ResponseShape::Text(field.into())
    }

    /// `true` for [`ResponseShape::List`].
    pub fn is_list(&self) -> bool {
        matches!(self, ResponseShape::List(_))
    }
}

/// Result of a completed action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum Value {
    /// From [`ResponseShape::Bool`].
    Bool(bool),
    /// From [`ResponseShape::Text`].
    Text(String),
    /// From [`ResponseShape::Mapping`]: the response minus `Response` and `ActionID`.
    Mapping(Packet),
    /// From [`ResponseShape::List`]: item packets in arrival order.
    List(Vec<Packet>),
}

impl Value {
    /// The boolean, if this is [`Value::Bool`].
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// The text, if this is [`Value::Text`].
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    /// The mapping, if this is [`Value::Mapping`].
    pub fn as_mapping(&self) -> Option<&Packet> {
        match self {
            Value::Mapping(p) => Some(p),
            _ => None,
        }
    }

    /// The items, if this is [`Value::List`].
    pub fn as_list(&self) -> Option<&[Packet]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    /// Consume into the items, if this is [`Value::List`].
    pub fn into_list(self) -> Option<Vec<Packet>> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }
}

/// An AMI action: the `Action` header, optional `ActionID`, ordered fields,
/// and the [`ResponseShape`] the caller expects back.
///
/// ```
/// use asterisk_ami_tokio::{Action, ResponseShape};
///
/// let action = Action::new("Getvar")
///     .action_id("17")
///     .field("Variable", "DIALSTATUS")
///     .expect(ResponseShape::text("Value"));
/// let wire = action.to_wire_format().unwrap();
/// assert_eq!(wire, "Action: Getvar\r\nActionID: 17\r\nVariable: DIALSTATUS\r\n\r\n");
/// ```
#[derive(Clone)]
pub struct Action {
    name: String,
    action_id: Option<String>,
    fields: Packet,
    shape: ResponseShape,
    timeout: Option<Duration>,
}

impl Action {
    /// Action named `name`, expecting a [`ResponseShape::Bool`] reply.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            action_id: None,
            fields: Packet::new(),
            shape: ResponseShape::Bool,
            timeout: None,
        }
    }

    /// Add a field; a repeated name replaces the earlier value.
    pub fn field(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields
            .set_header(name, value);
        self
    }

    /// Add a field only when `value` is `Some`.
    pub fn field_opt(self, name: impl Into<String>, value: Option<impl Into<String>>) -> Self {
        match value {
            Some(v) => self.field(name, v),
            None => self,
        }
    }

    /// Set the `ActionID` used to correlate the reply.
    pub fn action_id(mut self, id: impl Into<String>) -> Self {
        self.action_id = Some(id.into());
        self
    }

    /// Set the expected response shape.
    pub fn expect(mut self, shape: ResponseShape) -> Self {
        self.shape = shape;
        self
    }

    /// Override the client's reply timeout for this action.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Value of the `Action` header.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The `ActionID`, if one was set.
    pub fn get_action_id(&self) -> Option<&str> {
        self.action_id
            .as_deref()
    }

    pub(crate) fn set_action_id_if_missing(&mut self, id: impl FnOnce() -> String) {
        if self
            .action_id
            .is_none()
        {
            self.action_id = Some(id());
        }
    }

    /// Action fields, excluding `Action` and `ActionID`.
    pub fn fields(&self) -> &Packet {
        &self.fields
    }

    /// The expected response shape.
    pub fn response_shape(&self) -> &ResponseShape {
        &self.shape
    }

    /// Per-action timeout override.
    pub fn get_timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Validate all user-supplied text, then render the packet.
    pub fn to_wire_format(&self) -> AmiResult<String> {
        validate_no_newlines(&self.name, "action name")?;
        if self
            .name
            .trim()
            .is_empty()
        {
            return Err(AmiError::protocol_error("action name must not be empty"));
        }
        if let Some(id) = &self.action_id {
            validate_no_newlines(id, "ActionID")?;
        }

        let mut wire = String::new();
        push_line(&mut wire, AmiHeader::Action.as_str(), &self.name);
        if let Some(id) = &self.action_id {
            push_line(&mut wire, AmiHeader::ActionId.as_str(), id);
        }
        for (key, value) in self
            .fields
            .iter()
        {
            validate_no_newlines(key, "field name")?;
            validate_no_newlines(value, "field value")?;
            if key.contains(':') {
                return Err(AmiError::protocol_error(format!(
                    "field name {:?} must not contain ':'",
                    key
                )));
            }
            if key == AmiHeader::Action.as_str() || key == AmiHeader::ActionId.as_str() {
                return Err(AmiError::protocol_error(format!(
                    "{} is set by the action itself, not as a field",
                    key
                )));
            }
            push_line(&mut wire, key, value);
        }
        wire.push_str(LINE_TERMINATOR);
        Ok(wire)
    }
}

fn push_line(wire: &mut String, key: &str, value: &str) {
    wire.push_str(key);
    wire.push_str(HEADER_SEPARATOR);
    wire.push_str(value);
    wire.push_str(LINE_TERMINATOR);
}

impl fmt::Debug for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let fields: Vec<(&str, &str)> = self
            .fields
            .iter()
            .map(|(k, v)| {
                if REDACTED_FIELDS.contains(&k) {
                    (k, "[REDACTED]")
                } else {
                    (k, v)
                }
            })
            .collect();
        f.debug_struct("Action")
            .field("name", &self.name)
            .field("action_id", &self.action_id)
            .field("fields", &fields)
            .field("shape", &self.shape)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::AmiParser;

    #[test]
    fn test_wire_format_order() {
        let wire = Action::new("Originate")
            .action_id("abc")
            .field("Channel", "PJSIP/100")
            .field("Exten", "200")
            .field("Context", "default")
            .to_wire_format()
            .unwrap();

        assert_eq!(
            wire,
            "Action: Originate\r\nActionID: abc\r\nChannel: PJSIP/100\r\nExten: 200\r\nContext: default\r\n\r\n"
        );
    }

    #[test]
    fn test_wire_format_without_action_id() {
        let wire = Action::new("Ping")
            .to_wire_format()
            .unwrap();
        assert_eq!(wire, "Action: Ping\r\n\r\n");
    }

    #[test]
    fn test_wire_round_trips_through_parser() {
        let action = Action::new("Setvar")
            .action_id("9")
            .field("Channel", "SIP/100-0001")
            .field("Variable", "FOO")
            .field("Value", "a: b");
        let wire = action
            .to_wire_format()
            .unwrap();

        let mut parser = AmiParser::new();
        parser
            .add_data(wire.as_bytes())
            .unwrap();
        let packet = parser
            .parse_packet()
            .unwrap()
            .unwrap();

        let expected: Packet = [
            ("Action", "Setvar"),
            ("ActionID", "9"),
            ("Channel", "SIP/100-0001"),
            ("Variable", "FOO"),
            ("Value", "a: b"),
        ]
        .into_iter()
        .collect();
        assert_eq!(packet, expected);
    }

    #[test]
    fn test_field_opt() {
        let action = Action::new("Hangup")
            .field("Channel", "SIP/1")
            .field_opt("Cause", None::<&str>)
            .field_opt("Reason", Some("busy"));
        assert_eq!(
            action
                .fields()
                .len(),
            2
        );
        assert_eq!(
            action
                .fields()
                .header("Reason"),
            Some("busy")
        );
    }

    #[test]
    fn test_newline_injection_rejected() {
        assert!(Action::new("Ping\r\nAction: Logoff")
            .to_wire_format()
            .is_err());
        assert!(Action::new("Command")
            .field("Command", "core show channels\r\n\r\nAction: Logoff")
            .to_wire_format()
            .is_err());
        assert!(Action::new("Ping")
            .action_id("1\n2")
            .to_wire_format()
            .is_err());
        assert!(Action::new("Ping")
            .field("Bad\nName", "x")
            .to_wire_format()
            .is_err());
    }

    #[test]
    fn test_reserved_fields_rejected() {
        assert!(Action::new("Ping")
            .field("ActionID", "1")
            .to_wire_format()
            .is_err());
        assert!(Action::new("Ping")
            .field("Action", "Logoff")
            .to_wire_format()
            .is_err());
        assert!(Action::new("Ping")
            .field("A:B", "x")
            .to_wire_format()
            .is_err());
        assert!(Action::new("  ")
            .to_wire_format()
            .is_err());
    }

    #[test]
    fn test_debug_redacts_secret() {
        let login = Action::new("Login")
            .field("Username", "admin")
            .field("Secret", "hunter2");
        let debug_str = format!("{:?}", login);
        assert!(!debug_str.contains("hunter2"));
        assert!(debug_str.contains("REDACTED"));
        assert!(debug_str.contains("admin"));
    }

    #[test]
    fn test_set_action_id_if_missing() {
        let mut a = Action::new("Ping");
        a.set_action_id_if_missing(|| "gen-1".to_string());
        assert_eq!(a.get_action_id(), Some("gen-1"));

        let mut b = Action::new("Ping").action_id("mine");
        b.set_action_id_if_missing(|| "gen-2".to_string());
        assert_eq!(b.get_action_id(), Some("mine"));
    }

    #[test]
    fn test_list_spec_builder() {
        let spec = ListSpec::new("StatusComplete")
            .items("Status")
            .count_header("ListItems")
            .strict();
        assert_eq!(spec.complete_event, "StatusComplete");
        assert_eq!(spec.item_event.as_deref(), Some("Status"));
        assert_eq!(spec.count_header.as_deref(), Some("ListItems"));
        assert!(spec.strict_count);
        assert!(ResponseShape::List(spec).is_list());
        assert!(!ResponseShape::Bool.is_list());
    }

    #[test]
    fn test_value_accessors_and_serialize() {
        assert_eq!(Value::Bool(true).as_bool(), Some(true));
        assert_eq!(Value::Text("x".into()).as_text(), Some("x"));
        assert_eq!(Value::Bool(true).as_text(), None);

        let item: Packet = [("Channel", "SIP/1")]
            .into_iter()
            .collect();
        let list = Value::List(vec![item.clone()]);
        assert_eq!(
            list.as_list()
                .map(|l| l.len()),
            Some(1)
        );
        let json = serde_json::to_value(&list).unwrap();
        assert_eq!(json[0]["Channel"], "SIP/1");
        assert_eq!(list.into_list(), Some(vec![item]));
    }
}
