//! Multi-packet list assembly
//!
//! Asterisk has no framing for multi-packet replies. A list action answers
//! `Response: Success`, then sends item events, then a terminator event whose
//! name the action layer supplies in a [`ListSpec`].

use crate::{
    action::{ListSpec, Value},
    error::{AmiError, AmiResult},
    headers::{AmiHeader, ResponseStatus},
    packet::{Packet, PacketKind},
};
use tracing::{debug, trace, warn};

/// Where a list is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListState {
    /// Waiting for the `Response` that opens the list.
    AwaitingInitialResponse,
    /// Collecting item events.
    CollectingItems,
    /// Terminator seen, list delivered.
    Complete,
    /// Initial response was not `Success`.
    Failed,
}

/// Declared and actual item counts that disagree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CountMismatch {
    /// Count from the terminator's count header.
    pub declared: usize,
    /// Items collected.
    pub collected: usize,
}

/// Final result of a list plus any count discrepancy.
#[derive(Debug)]
pub struct ListOutcome {
    /// Value or error to deliver.
    pub result: AmiResult<Value>,
    /// Set when the terminator's count disagreed with the items collected.
    pub count_mismatch: Option<CountMismatch>,
}

/// What happened to one packet fed to the aggregator.
#[derive(Debug)]
pub enum ListStep {
    /// Consumed; the list is still open.
    Consumed,
    /// Not part of this list; handed back to the caller.
    Ignored(Packet),
    /// The list is finished.
    Finished(ListOutcome),
}

/// State machine for one list action.
#[derive(Debug)]
pub struct ListAggregator {
    spec: ListSpec,
    state: ListState,
    items: Vec<Packet>,
}

impl ListAggregator {
    /// Fresh aggregator waiting for the initial response.
    pub fn new(spec: ListSpec) -> Self {
        Self {
            spec,
            state: ListState::AwaitingInitialResponse,
            items: Vec::new(),
        }
    }

    /// Current state.
    pub fn state(&self) -> ListState {
        self.state
    }

    /// `true` while item events are being collected.
    pub fn is_collecting(&self) -> bool {
        self.state == ListState::CollectingItems
    }

    /// Items collected so far.
    pub fn collected(&self) -> usize {
        self.items
            .len()
    }

    /// Feed the next packet that correlates to this list's action.
    pub fn feed(&mut self, packet: Packet) -> ListStep {
        match packet.kind() {
            PacketKind::Response => self.on_response(packet),
            PacketKind::Event => self.on_event(packet),
            PacketKind::Other => {
                debug!("Dropping unclassified packet inside list");
                ListStep::Consumed
            }
        }
    }

    fn on_response(&mut self, packet: Packet) -> ListStep {
        if self.state != ListState::AwaitingInitialResponse {
            warn!(
                "Duplicate response for list ending in {} while {:?}, dropping",
                self.spec
                    .complete_event,
                self.state
            );
            return ListStep::Consumed;
        }

        let response = packet
            .response()
            .unwrap_or_default();
        let opened = response
            .parse::<ResponseStatus>()
            .map(|s| s == ResponseStatus::Success)
            .unwrap_or(false);

        if opened {
            trace!(
                "List opened, waiting for {}",
                self.spec
                    .complete_event
            );
            self.state = ListState::CollectingItems;
            return ListStep::Consumed;
        }

        self.state = ListState::Failed;
        ListStep::Finished(ListOutcome {
            result: Err(AmiError::ActionFailed {
                response: response.to_string(),
                message: packet
                    .message()
                    .map(str::to_string),
            }),
            count_mismatch: None,
        })
    }

    fn on_event(&mut self, mut packet: Packet) -> ListStep {
        if !self.is_collecting() {
            return ListStep::Ignored(packet);
        }

        let name = packet
            .event_name()
            .unwrap_or_default();

        if name == self
            .spec
            .complete_event
        {
            return ListStep::Finished(self.finish(&packet));
        }

        match &self
            .spec
            .item_event
        {
            Some(item_event) if name == item_event.as_str() => {
                packet.remove_header(AmiHeader::Event);
                self.items
                    .push(packet);
                ListStep::Consumed
            }
            Some(_) => ListStep::Ignored(packet),
            None => {
                self.items
                    .push(packet);
                ListStep::Consumed
            }
        }
    }

    fn finish(&mut self, terminator: &Packet) -> ListOutcome {
        self.state = ListState::Complete;
        let items = std::mem::take(&mut self.items);
        let collected = items.len();

        let declared = self
            .spec
            .count_header
            .as_deref()
            .and_then(|h| terminator.header(h))
            .and_then(|raw| match raw
                .trim()
                .parse::<usize>()
            {
                Ok(n) => Some(n),
                Err(_) => {
                    debug!("Ignoring non-numeric list count {:?}", raw);
                    None
                }
            });

        let count_mismatch = declared
            .filter(|d| *d != collected)
            .map(|declared| CountMismatch {
                declared,
                collected,
            });

        let result = match count_mismatch {
            Some(m) if self.spec.strict_count => Err(AmiError::ListCountMismatch {
                declared: m.declared,
                collected: m.collected,
            }),
            _ => Ok(Value::List(items)),
        };

        ListOutcome {
            result,
            count_mismatch,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packet(pairs: &[(&str, &str)]) -> Packet {
        pairs
            .iter()
            .copied()
            .collect()
    }

    fn status_spec() -> ListSpec {
        ListSpec::new("StatusComplete")
            .items("Status")
            .count_header("ListItems")
    }

    fn finished(step: ListStep) -> ListOutcome {
        match step {
            ListStep::Finished(outcome) => outcome,
            other => panic!("expected Finished, got {:?}", other),
        }
    }

    #[test]
    fn test_single_status_item() {
        let mut agg = ListAggregator::new(status_spec());
        assert!(matches!(
            agg.feed(packet(&[("Response", "Success"), ("ActionID", "1")])),
            ListStep::Consumed
        ));
        assert!(agg.is_collecting());

        assert!(matches!(
            agg.feed(packet(&[
                ("Event", "Status"),
                ("ActionID", "1"),
                ("Channel", "SIP/100-0001")
            ])),
            ListStep::Consumed
        ));
        let outcome = finished(agg.feed(packet(&[
            ("Event", "StatusComplete"),
            ("ActionID", "1"),
            ("ListItems", "1"),
        ])));

        assert_eq!(agg.state(), ListState::Complete);
        assert!(outcome
            .count_mismatch
            .is_none());
        let items = outcome
            .result
            .unwrap()
            .into_list()
            .unwrap();
        assert_eq!(
            items,
            vec![packet(&[("ActionID", "1"), ("Channel", "SIP/100-0001")])]
        );
    }

    #[test]
    fn test_items_keep_arrival_order() {
        let mut agg = ListAggregator::new(status_spec());
        agg.feed(packet(&[("Response", "Success")]));
        for n in 0..5 {
            agg.feed(packet(&[("Event", "Status"), ("Seq", &n.to_string())]));
        }
        assert_eq!(agg.collected(), 5);
        let outcome = finished(agg.feed(packet(&[("Event", "StatusComplete"), ("ListItems", "5")])));

        let seqs: Vec<String> = outcome
            .result
            .unwrap()
            .into_list()
            .unwrap()
            .iter()
            .map(|p| {
                p.header("Seq")
                    .unwrap()
                    .to_string()
            })
            .collect();
        assert_eq!(seqs, vec!["0", "1", "2", "3", "4"]);
    }

    #[test]
    fn test_count_mismatch_is_reported_not_fatal() {
        let mut agg = ListAggregator::new(status_spec());
        agg.feed(packet(&[("Response", "Success")]));
        agg.feed(packet(&[("Event", "Status"), ("Channel", "A")]));
        agg.feed(packet(&[("Event", "Status"), ("Channel", "B")]));
        let outcome = finished(agg.feed(packet(&[("Event", "StatusComplete"), ("ListItems", "7")])));

        assert_eq!(
            outcome.count_mismatch,
            Some(CountMismatch {
                declared: 7,
                collected: 2
            })
        );
        assert_eq!(
            outcome
                .result
                .unwrap()
                .as_list()
                .map(|l| l.len()),
            Some(2)
        );
    }

    #[test]
    fn test_strict_count_mismatch_fails() {
        let mut agg = ListAggregator::new(status_spec().strict());
        agg.feed(packet(&[("Response", "Success")]));
        let outcome = finished(agg.feed(packet(&[("Event", "StatusComplete"), ("ListItems", "1")])));
        assert!(matches!(
            outcome.result,
            Err(AmiError::ListCountMismatch {
                declared: 1,
                collected: 0
            })
        ));
    }

    #[test]
    fn test_non_numeric_count_ignored() {
        let mut agg = ListAggregator::new(status_spec().strict());
        agg.feed(packet(&[("Response", "Success")]));
        let outcome = finished(agg.feed(packet(&[("Event", "StatusComplete"), ("ListItems", "many")])));
        assert!(outcome
            .count_mismatch
            .is_none());
        assert!(outcome
            .result
            .is_ok());
    }

    #[test]
    fn test_error_response_fails_immediately() {
        let mut agg = ListAggregator::new(status_spec());
        let outcome = finished(agg.feed(packet(&[
            ("Response", "Error"),
            ("Message", "Permission denied"),
        ])));
        assert_eq!(agg.state(), ListState::Failed);
        match outcome.result {
            Err(AmiError::ActionFailed { response, message }) => {
                assert_eq!(response, "Error");
                assert_eq!(message.as_deref(), Some("Permission denied"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_filter_hands_back_other_events() {
        let mut agg = ListAggregator::new(status_spec());
        agg.feed(packet(&[("Response", "Success")]));
        match agg.feed(packet(&[("Event", "Newchannel")])) {
            ListStep::Ignored(p) => assert_eq!(p.event_name(), Some("Newchannel")),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(agg.collected(), 0);
    }

    #[test]
    fn test_unfiltered_list_keeps_everything_verbatim() {
        let spec = ListSpec::new("QueueStatusComplete").count_header("ListItems");
        let mut agg = ListAggregator::new(spec);
        agg.feed(packet(&[("Response", "Success")]));
        agg.feed(packet(&[("Event", "QueueParams"), ("Queue", "support")]));
        agg.feed(packet(&[("Event", "QueueMember"), ("Name", "PJSIP/100")]));
        let outcome = finished(agg.feed(packet(&[
            ("Event", "QueueStatusComplete"),
            ("EventList", "Complete"),
            ("ListItems", "2"),
        ])));
        assert_eq!(outcome.count_mismatch, None);

        let items = outcome
            .result
            .unwrap()
            .into_list()
            .unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].event_name(), Some("QueueParams"));
        assert_eq!(items[1].event_name(), Some("QueueMember"));
    }

    #[test]
    fn test_duplicate_response_and_unclassified_dropped() {
        let mut agg = ListAggregator::new(status_spec());
        agg.feed(packet(&[("Response", "Success")]));
        assert!(matches!(
            agg.feed(packet(&[("Response", "Error")])),
            ListStep::Consumed
        ));
        assert!(matches!(
            agg.feed(packet(&[("Foo", "bar")])),
            ListStep::Consumed
        ));
        assert!(agg.is_collecting());
        assert_eq!(agg.collected(), 0);
    }

    #[test]
    fn test_event_before_initial_response_is_ignored() {
        let mut agg = ListAggregator::new(status_spec());
        assert!(matches!(
            agg.feed(packet(&[("Event", "Status")])),
            ListStep::Ignored(_)
        ));
        assert_eq!(agg.state(), ListState::AwaitingInitialResponse);
    }
}
