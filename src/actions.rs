//! Builders for commonly used AMI actions.
//!
//! Each builder only records the fields to send and the reply shape to
//! expect. Anything not covered here can be built with [`Action::new`].
//!
//! ```
//! use asterisk_ami_tokio::{Action, ResponseShape};
//!
//! let status = Action::status(None);
//! assert!(matches!(status.response_shape(), ResponseShape::List(spec) if spec.complete_event == "StatusComplete"));
//!
//! let hangup = Action::hangup("PJSIP/100-00000001", Some(16));
//! assert_eq!(hangup.fields().header("Cause"), Some("16"));
//! ```

use crate::action::{Action, ListSpec, ResponseShape};

/// List closed by `<action>Complete`, collecting `item` events and checking `ListItems`.
fn event_list(complete: &str, item: &str) -> ResponseShape {
    ResponseShape::List(
        ListSpec::new(complete)
            .items(item)
            .count_header("ListItems"),
    )
}

impl Action {
    /// `Login` with a plaintext secret. `events` is `on`, `off` or a class mask.
    pub fn login(username: &str, secret: &str, events: &str) -> Self {
        Action::new("Login")
            .field("Username", username)
            .field("Secret", secret)
            .field("Events", events)
    }

    /// `Logoff`; Asterisk answers `Goodbye` and closes the socket.
    pub fn logoff() -> Self {
        Action::new("Logoff")
    }

    /// `Ping`; answered with `Pong` (or `Success` on older servers).
    pub fn ping() -> Self {
        Action::new("Ping")
    }

    /// `Events`: change the event mask of this session.
    pub fn events(mask: &str) -> Self {
        Action::new("Events").field("EventMask", mask)
    }

    /// `Status` for one channel or all channels.
    pub fn status(channel: Option<&str>) -> Self {
        Action::new("Status")
            .field_opt("Channel", channel)
            .expect(event_list("StatusComplete", "Status"))
    }

    /// `CoreShowChannels`
    pub fn core_show_channels() -> Self {
        Action::new("CoreShowChannels")
            .expect(event_list("CoreShowChannelsComplete", "CoreShowChannel"))
    }

    /// `QueueStatus`; params, members and callers all come back as items.
    pub fn queue_status(queue: Option<&str>) -> Self {
        Action::new("QueueStatus")
            .field_opt("Queue", queue)
            .expect(ResponseShape::List(ListSpec::new("QueueStatusComplete")))
    }

    /// `SIPpeers` (chan_sip)
    pub fn sip_peers() -> Self {
        Action::new("SIPpeers").expect(event_list("PeerlistComplete", "PeerEntry"))
    }

    /// `PJSIPShowEndpoints`
    pub fn pjsip_show_endpoints() -> Self {
        Action::new("PJSIPShowEndpoints")
            .expect(event_list("EndpointListComplete", "EndpointList"))
    }

    /// `Getvar`; the result is the `Value` field. Without a channel, reads a global.
    pub fn getvar(channel: Option<&str>, variable: &str) -> Self {
        Action::new("Getvar")
            .field_opt("Channel", channel)
            .field("Variable", variable)
            .expect(ResponseShape::text("Value"))
    }

    /// `Setvar`. Without a channel, sets a global.
    pub fn setvar(channel: Option<&str>, variable: &str, value: &str) -> Self {
        Action::new("Setvar")
            .field_opt("Channel", channel)
            .field("Variable", variable)
            .field("Value", value)
    }

    /// `Hangup` with an optional Q.850 cause code.
    pub fn hangup(channel: &str, cause: Option<u32>) -> Self {
        Action::new("Hangup")
            .field("Channel", channel)
            .field_opt("Cause", cause.map(|c| c.to_string()))
    }

    /// `Redirect` a channel to a dialplan location.
    pub fn redirect(channel: &str, context: &str, exten: &str, priority: u32) -> Self {
        Action::new("Redirect")
            .field("Channel", channel)
            .field("Context", context)
            .field("Exten", exten)
            .field("Priority", priority.to_string())
    }

    /// `Originate` into a dialplan extension, queued asynchronously by Asterisk.
    ///
    /// The call outcome arrives later as an `OriginateResponse` event carrying
    /// this action's `ActionID`.
    pub fn originate(channel: &str, context: &str, exten: &str, priority: u32) -> Self {
        Action::new("Originate")
            .field("Channel", channel)
            .field("Context", context)
            .field("Exten", exten)
            .field("Priority", priority.to_string())
            .field("Async", "true")
    }

    /// `Command`: run a CLI command. The mapping's `Output` holds every output
    /// line, joined with `\n`.
    pub fn command(command: &str) -> Self {
        Action::new("Command")
            .field("Command", command)
            .expect(ResponseShape::Mapping)
    }

    /// `CoreSettings`
    pub fn core_settings() -> Self {
        Action::new("CoreSettings").expect(ResponseShape::Mapping)
    }

    /// `CoreStatus`
    pub fn core_status() -> Self {
        Action::new("CoreStatus").expect(ResponseShape::Mapping)
    }

    /// `ListCommands`: every action this manager user may send.
    pub fn list_commands() -> Self {
        Action::new("ListCommands").expect(ResponseShape::Mapping)
    }
}
