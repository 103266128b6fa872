//! Packet routing core, independent of any socket
//!
//! The engine classifies each decoded packet, correlates responses and list
//! items to the pending action they belong to, and tells the caller what to
//! do next: deliver a finished result, broadcast an event, or nothing.
//! Results are returned rather than delivered so the connection can release
//! its lock before running callbacks.

use crate::{
    action::{ResponseShape, Value},
    aggregator::ListStep,
    connection::DisconnectReason,
    error::{AmiError, AmiResult},
    headers::{response_succeeded, AmiHeader},
    packet::{Packet, PacketKind},
    registry::{ActionRegistry, CorrelationKey, PendingAction},
};
use tracing::{debug, trace, warn};

/// What the connection must do with a routed packet.
#[derive(Debug)]
pub enum Dispatch {
    /// Deliver `result` to the action.
    Complete(PendingAction, AmiResult<Value>),
    /// Hand the event to subscribers.
    Event(Packet),
    /// Nothing; the packet was consumed or dropped.
    Nothing,
}

/// Classifier + registry + list aggregation.
#[derive(Debug, Default)]
pub struct Engine {
    registry: ActionRegistry,
}

impl Engine {
    /// Engine with an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an action before its packet is written.
    pub fn register(&mut self, action: PendingAction) -> AmiResult<u64> {
        trace!(
            "Registering {} as {}",
            action.action_name(),
            action.key()
        );
        self.registry
            .register(action)
    }

    /// Withdraw a registration (timeout or abandoned caller).
    pub fn cancel(&mut self, key: &CorrelationKey, serial: u64) -> Option<PendingAction> {
        self.registry
            .remove_if(key, serial)
    }

    /// Number of actions awaiting replies.
    pub fn pending_count(&self) -> usize {
        self.registry
            .len()
    }

    /// Route one decoded packet.
    pub fn on_packet(&mut self, packet: Packet) -> Dispatch {
        match packet.kind() {
            PacketKind::Response => self.on_response(packet),
            PacketKind::Event => self.on_event(packet),
            PacketKind::Other => {
                if !packet.is_empty() {
                    debug!("Dropping packet with neither Response nor Event");
                }
                Dispatch::Nothing
            }
        }
    }

    fn on_response(&mut self, packet: Packet) -> Dispatch {
        let action_id = packet
            .action_id()
            .map(str::to_string);
        let action_id = action_id.as_deref();

        let Some(pending) = self
            .registry
            .get_mut(action_id)
        else {
            warn!(
                "Unmatched response {:?} for {}",
                packet
                    .response()
                    .unwrap_or_default(),
                CorrelationKey::from_action_id(action_id)
            );
            return Dispatch::Nothing;
        };

        if let Some(list) = pending.list_mut() {
            return match list.feed(packet) {
                ListStep::Finished(outcome) => {
                    self.complete_list(action_id, outcome.result, outcome.count_mismatch)
                }
                ListStep::Consumed | ListStep::Ignored(_) => Dispatch::Nothing,
            };
        }

        match self
            .registry
            .lookup_and_remove(action_id)
        {
            Some(pending) => {
                let result = resolve_single(pending.shape(), packet);
                debug!(
                    "Completed {} ({}): ok={}",
                    pending.action_name(),
                    pending.key(),
                    result.is_ok()
                );
                Dispatch::Complete(pending, result)
            }
            None => Dispatch::Nothing,
        }
    }

    fn on_event(&mut self, packet: Packet) -> Dispatch {
        let action_id = packet
            .action_id()
            .map(str::to_string);
        let action_id = action_id.as_deref();

        let Some(pending) = self
            .registry
            .get_mut(action_id)
            .filter(|p| p.is_collecting())
        else {
            return Dispatch::Event(packet);
        };
        let unlabeled = action_id.is_none();
        let Some(list) = pending.list_mut() else {
            return Dispatch::Event(packet);
        };

        match list.feed(packet) {
            ListStep::Consumed => Dispatch::Nothing,
            ListStep::Finished(outcome) => {
                self.complete_list(action_id, outcome.result, outcome.count_mismatch)
            }
            // Events without an ActionID cannot be attributed to the list.
            ListStep::Ignored(packet) if unlabeled => Dispatch::Event(packet),
            ListStep::Ignored(packet) => {
                trace!(
                    "Swallowing {:?} inside list",
                    packet
                        .event_name()
                        .unwrap_or_default()
                );
                Dispatch::Nothing
            }
        }
    }

    fn complete_list(
        &mut self,
        action_id: Option<&str>,
        result: AmiResult<Value>,
        mismatch: Option<crate::aggregator::CountMismatch>,
    ) -> Dispatch {
        let Some(pending) = self
            .registry
            .lookup_and_remove(action_id)
        else {
            return Dispatch::Nothing;
        };
        if let Some(m) = mismatch {
            warn!(
                "{} ({}) declared {} list items but {} arrived",
                pending.action_name(),
                pending.key(),
                m.declared,
                m.collected
            );
        }
        debug!(
            "Completed list {} ({}): ok={}",
            pending.action_name(),
            pending.key(),
            result.is_ok()
        );
        Dispatch::Complete(pending, result)
    }

    /// Remove every pending action, pairing each with a transport error.
    pub fn fail_all(&mut self, reason: &DisconnectReason) -> Vec<(PendingAction, AmiResult<Value>)> {
        let drained = self
            .registry
            .drain();
        if !drained.is_empty() {
            debug!(
                "Failing {} pending actions: {}",
                drained.len(),
                reason
            );
        }
        drained
            .into_iter()
            .map(|p| (p, Err(AmiError::Transport(reason.clone()))))
            .collect()
    }
}

/// Turn a single-packet response into the value its shape calls for.
fn resolve_single(shape: &ResponseShape, mut packet: Packet) -> AmiResult<Value> {
    let response = packet
        .response()
        .unwrap_or_default();
    if !response_succeeded(response) {
        return Err(AmiError::ActionFailed {
            response: response.to_string(),
            message: packet
                .message()
                .map(str::to_string),
        });
    }

    match shape {
        ResponseShape::Bool => Ok(Value::Bool(true)),
        ResponseShape::Text(field) => packet
            .header(field)
            .map(|v| Value::Text(v.to_string()))
            .ok_or_else(|| AmiError::MissingField {
                field: field.clone(),
            }),
        ResponseShape::Mapping => {
            packet.remove_header(AmiHeader::Response);
            packet.remove_header(AmiHeader::ActionId);
            Ok(Value::Mapping(packet))
        }
        ResponseShape::List(_) => Err(AmiError::protocol_error(
            "list action resolved as a single response",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{Action, ListSpec};
    use crate::delivery::Delivery;
    use crate::protocol::AmiParser;
    use tokio::sync::oneshot;

    fn packet(pairs: &[(&str, &str)]) -> Packet {
        pairs
            .iter()
            .copied()
            .collect()
    }

    fn register(
        engine: &mut Engine,
        action_id: Option<&str>,
        name: &str,
        shape: ResponseShape,
    ) -> oneshot::Receiver<AmiResult<Value>> {
        let (delivery, rx) = Delivery::awaiting();
        engine
            .register(PendingAction::new(
                CorrelationKey::from_action_id(action_id),
                name,
                shape,
                delivery,
            ))
            .unwrap();
        rx
    }

    fn deliver(dispatch: Dispatch) {
        match dispatch {
            Dispatch::Complete(pending, result) => pending.deliver(result),
            other => panic!("expected Complete, got {:?}", other),
        }
    }

    fn status_shape() -> ResponseShape {
        ResponseShape::List(
            ListSpec::new("StatusComplete")
                .items("Status")
                .count_header("ListItems"),
        )
    }

    #[test]
    fn test_ping_pong_with_action_id() {
        let mut engine = Engine::new();
        let mut rx = register(&mut engine, Some("42"), "Ping", ResponseShape::Bool);

        match engine.on_packet(packet(&[("Response", "Pong"), ("ActionID", "42")])) {
            Dispatch::Complete(pending, result) => {
                assert_eq!(pending.key(), &CorrelationKey::Id("42".into()));
                pending.deliver(result);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(
            rx.try_recv()
                .unwrap()
                .unwrap(),
            Value::Bool(true)
        );
        assert_eq!(engine.pending_count(), 0);
    }

    #[test]
    fn test_error_response_carries_message() {
        let mut engine = Engine::new();
        let mut rx = register(&mut engine, Some("1"), "Hangup", ResponseShape::Bool);
        deliver(engine.on_packet(packet(&[
            ("Response", "Error"),
            ("ActionID", "1"),
            ("Message", "No such channel"),
        ])));

        match rx
            .try_recv()
            .unwrap()
        {
            Err(AmiError::ActionFailed { response, message }) => {
                assert_eq!(response, "Error");
                assert_eq!(message.as_deref(), Some("No such channel"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_text_and_mapping_shapes() {
        let mut engine = Engine::new();
        let mut text = register(&mut engine, Some("t"), "Getvar", ResponseShape::text("Value"));
        let mut missing = register(&mut engine, Some("m"), "Getvar", ResponseShape::text("Value"));
        let mut map = register(&mut engine, Some("s"), "CoreSettings", ResponseShape::Mapping);

        deliver(engine.on_packet(packet(&[
            ("Response", "Success"),
            ("ActionID", "t"),
            ("Variable", "FOO"),
            ("Value", "bar"),
        ])));
        deliver(engine.on_packet(packet(&[("Response", "Success"), ("ActionID", "m")])));
        deliver(engine.on_packet(packet(&[
            ("Response", "Success"),
            ("ActionID", "s"),
            ("AMIversion", "5.0.1"),
        ])));

        assert_eq!(
            text.try_recv()
                .unwrap()
                .unwrap(),
            Value::Text("bar".into())
        );
        assert!(matches!(
            missing
                .try_recv()
                .unwrap(),
            Err(AmiError::MissingField { ref field }) if field == "Value"
        ));
        assert_eq!(
            map.try_recv()
                .unwrap()
                .unwrap(),
            Value::Mapping(packet(&[("AMIversion", "5.0.1")]))
        );
    }

    #[test]
    fn test_command_keeps_every_output_line() {
        let mut engine = Engine::new();
        let action = Action::command("core show uptime").action_id("c1");
        let mut rx = register(
            &mut engine,
            action.get_action_id(),
            action.name(),
            action
                .response_shape()
                .clone(),
        );

        let mut parser = AmiParser::new();
        parser
            .add_data(
                b"Response: Success\r\nActionID: c1\r\nMessage: Command output follows\r\n\
                  Output: System uptime: 1 hour\r\nOutput: Last reload: 5 minutes\r\n\r\n",
            )
            .unwrap();
        let reply = parser
            .parse_packet()
            .unwrap()
            .unwrap();
        deliver(engine.on_packet(reply));

        let value = rx
            .try_recv()
            .unwrap()
            .unwrap();
        let mapping = value
            .as_mapping()
            .unwrap();
        assert_eq!(mapping.message(), Some("Command output follows"));
        assert_eq!(
            mapping
                .header("Output")
                .map(|o| o
                    .lines()
                    .collect::<Vec<_>>()),
            Some(vec!["System uptime: 1 hour", "Last reload: 5 minutes"])
        );
    }

    #[test]
    fn test_status_list_scenario() {
        let mut engine = Engine::new();
        let mut rx = register(&mut engine, Some("s1"), "Status", status_shape());

        assert!(matches!(
            engine.on_packet(packet(&[("Response", "Success"), ("ActionID", "s1")])),
            Dispatch::Nothing
        ));
        assert!(matches!(
            engine.on_packet(packet(&[
                ("Event", "Status"),
                ("ActionID", "s1"),
                ("Channel", "PJSIP/100-00000001"),
            ])),
            Dispatch::Nothing
        ));
        deliver(engine.on_packet(packet(&[
            ("Event", "StatusComplete"),
            ("ActionID", "s1"),
            ("ListItems", "1"),
        ])));

        let items = rx
            .try_recv()
            .unwrap()
            .unwrap()
            .into_list()
            .unwrap();
        assert_eq!(
            items,
            vec![packet(&[("ActionID", "s1"), ("Channel", "PJSIP/100-00000001")])]
        );
        assert_eq!(engine.pending_count(), 0);
    }

    #[test]
    fn test_list_count_mismatch_still_delivers() {
        let mut engine = Engine::new();
        let mut rx = register(&mut engine, Some("s"), "Status", status_shape());
        engine.on_packet(packet(&[("Response", "Success"), ("ActionID", "s")]));
        engine.on_packet(packet(&[("Event", "Status"), ("ActionID", "s")]));
        engine.on_packet(packet(&[("Event", "Status"), ("ActionID", "s")]));
        deliver(engine.on_packet(packet(&[
            ("Event", "StatusComplete"),
            ("ActionID", "s"),
            ("ListItems", "5"),
        ])));

        assert_eq!(
            rx.try_recv()
                .unwrap()
                .unwrap()
                .as_list()
                .map(|l| l.len()),
            Some(2)
        );
    }

    #[test]
    fn test_events_outside_lists_are_broadcast() {
        let mut engine = Engine::new();
        let _rx = register(&mut engine, Some("p"), "Ping", ResponseShape::Bool);

        match engine.on_packet(packet(&[("Event", "Newchannel"), ("Channel", "SIP/1")])) {
            Dispatch::Event(p) => assert_eq!(p.event_name(), Some("Newchannel")),
            other => panic!("unexpected {:?}", other),
        }
        // An event echoing the ActionID of a non-list action is still an event.
        assert!(matches!(
            engine.on_packet(packet(&[("Event", "OriginateResponse"), ("ActionID", "p")])),
            Dispatch::Event(_)
        ));
    }

    #[test]
    fn test_list_items_for_waiting_list_are_broadcast_until_opened() {
        let mut engine = Engine::new();
        let _rx = register(&mut engine, Some("s"), "Status", status_shape());
        assert!(matches!(
            engine.on_packet(packet(&[("Event", "Status"), ("ActionID", "s")])),
            Dispatch::Event(_)
        ));
    }

    #[test]
    fn test_filtered_list_swallows_foreign_events_with_its_id() {
        let mut engine = Engine::new();
        let _rx = register(&mut engine, Some("s"), "Status", status_shape());
        engine.on_packet(packet(&[("Response", "Success"), ("ActionID", "s")]));

        assert!(matches!(
            engine.on_packet(packet(&[("Event", "Other"), ("ActionID", "s")])),
            Dispatch::Nothing
        ));
    }

    #[test]
    fn test_unlabeled_list_lets_unrelated_events_through() {
        let mut engine = Engine::new();
        let mut rx = register(&mut engine, None, "Status", status_shape());
        engine.on_packet(packet(&[("Response", "Success")]));

        assert!(matches!(
            engine.on_packet(packet(&[("Event", "Newchannel")])),
            Dispatch::Event(_)
        ));
        engine.on_packet(packet(&[("Event", "Status"), ("Channel", "A")]));
        deliver(engine.on_packet(packet(&[("Event", "StatusComplete")])));

        assert_eq!(
            rx.try_recv()
                .unwrap()
                .unwrap(),
            Value::List(vec![packet(&[("Channel", "A")])])
        );
    }

    #[test]
    fn test_unlabeled_response_goes_to_unlabeled_action() {
        let mut engine = Engine::new();
        let mut labeled = register(&mut engine, Some("1"), "Ping", ResponseShape::Bool);
        let mut unlabeled = register(&mut engine, None, "Ping", ResponseShape::Bool);

        deliver(engine.on_packet(packet(&[("Response", "Pong")])));

        assert!(unlabeled
            .try_recv()
            .is_ok());
        assert!(labeled
            .try_recv()
            .is_err());
        assert_eq!(engine.pending_count(), 1);
    }

    #[test]
    fn test_at_most_once_delivery() {
        let mut engine = Engine::new();
        let mut rx = register(&mut engine, Some("9"), "Ping", ResponseShape::Bool);

        deliver(engine.on_packet(packet(&[("Response", "Pong"), ("ActionID", "9")])));
        assert!(matches!(
            engine.on_packet(packet(&[("Response", "Pong"), ("ActionID", "9")])),
            Dispatch::Nothing
        ));
        assert!(rx
            .try_recv()
            .is_ok());
    }

    #[test]
    fn test_unmatched_and_other_packets_dropped() {
        let mut engine = Engine::new();
        assert!(matches!(
            engine.on_packet(packet(&[("Response", "Success"), ("ActionID", "nope")])),
            Dispatch::Nothing
        ));
        assert!(matches!(
            engine.on_packet(packet(&[("Foo", "bar")])),
            Dispatch::Nothing
        ));
        assert!(matches!(engine.on_packet(Packet::new()), Dispatch::Nothing));
    }

    #[test]
    fn test_fail_all_drains_with_transport_error() {
        let mut engine = Engine::new();
        let mut a = register(&mut engine, Some("a"), "Ping", ResponseShape::Bool);
        let mut b = register(&mut engine, Some("b"), "Status", status_shape());
        engine.on_packet(packet(&[("Response", "Success"), ("ActionID", "b")]));

        for (pending, result) in engine.fail_all(&DisconnectReason::ConnectionClosed) {
            pending.deliver(result);
        }

        assert_eq!(engine.pending_count(), 0);
        for rx in [&mut a, &mut b] {
            assert!(matches!(
                rx.try_recv()
                    .unwrap(),
                Err(AmiError::Transport(DisconnectReason::ConnectionClosed))
            ));
        }
    }

    #[test]
    fn test_cancel_respects_serial() {
        let mut engine = Engine::new();
        let (delivery, _rx) = Delivery::awaiting();
        let key = CorrelationKey::Id("c".into());
        let serial = engine
            .register(PendingAction::new(
                key.clone(),
                "Ping",
                ResponseShape::Bool,
                delivery,
            ))
            .unwrap();

        assert!(engine
            .cancel(&key, serial + 1)
            .is_none());
        assert!(engine
            .cancel(&key, serial)
            .is_some());
        assert_eq!(engine.pending_count(), 0);
    }
}
