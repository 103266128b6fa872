//! Pending action bookkeeping

use crate::{
    action::ResponseShape,
    aggregator::ListAggregator,
    delivery::Delivery,
    error::{AmiError, AmiResult},
};
use std::collections::HashMap;
use std::fmt;

/// Key a reply is matched on.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CorrelationKey {
    /// The action's `ActionID`.
    Id(String),
    /// The most recent action sent without an `ActionID`.
    Unlabeled,
}

impl CorrelationKey {
    /// Key for an optional `ActionID` value.
    pub fn from_action_id(action_id: Option<&str>) -> Self {
        match action_id {
            Some(id) => CorrelationKey::Id(id.to_string()),
            None => CorrelationKey::Unlabeled,
        }
    }
}

impl fmt::Display for CorrelationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CorrelationKey::Id(id) => f.write_str(id),
            CorrelationKey::Unlabeled => f.write_str("(unlabeled)"),
        }
    }
}

/// One in-flight action awaiting its reply.
#[derive(Debug)]
pub struct PendingAction {
    key: CorrelationKey,
    action_name: String,
    shape: ResponseShape,
    list: Option<ListAggregator>,
    delivery: Delivery,
    serial: u64,
}

impl PendingAction {
    /// A list aggregator is attached when `shape` is a list.
    pub fn new(
        key: CorrelationKey,
        action_name: impl Into<String>,
        shape: ResponseShape,
        delivery: Delivery,
    ) -> Self {
        let list = match &shape {
            ResponseShape::List(spec) => Some(ListAggregator::new(spec.clone())),
            ResponseShape::Bool | ResponseShape::Text(_) | ResponseShape::Mapping => None,
        };
        Self {
            key,
            action_name: action_name.into(),
            shape,
            list,
            delivery,
            serial: 0,
        }
    }

    /// Correlation key.
    pub fn key(&self) -> &CorrelationKey {
        &self.key
    }

    /// Value of the action's `Action` header.
    pub fn action_name(&self) -> &str {
        &self.action_name
    }

    /// Expected response shape.
    pub fn shape(&self) -> &ResponseShape {
        &self.shape
    }

    /// Registration serial assigned by the registry.
    pub fn serial(&self) -> u64 {
        self.serial
    }

    pub(crate) fn list_mut(&mut self) -> Option<&mut ListAggregator> {
        self.list
            .as_mut()
    }

    /// `true` while a list action is collecting items.
    pub fn is_collecting(&self) -> bool {
        self.list
            .as_ref()
            .is_some_and(|l| l.is_collecting())
    }

    /// Consume the action and deliver its result.
    pub fn deliver(self, result: AmiResult<crate::action::Value>) {
        self.delivery
            .deliver(result)
    }
}

/// Correlation key → pending action. At most one action per key.
#[derive(Debug, Default)]
pub struct ActionRegistry {
    pending: HashMap<CorrelationKey, PendingAction>,
    next_serial: u64,
}

impl ActionRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a pending action and return its serial.
    ///
    /// A key collision is rejected and the new action dropped undelivered;
    /// the action already registered keeps its place.
    pub fn register(&mut self, mut action: PendingAction) -> AmiResult<u64> {
        if self
            .pending
            .contains_key(&action.key)
        {
            return Err(AmiError::DuplicateActionId {
                action_id: action
                    .key
                    .to_string(),
            });
        }
        self.next_serial += 1;
        action.serial = self.next_serial;
        let serial = action.serial;
        self.pending
            .insert(
                action
                    .key
                    .clone(),
                action,
            );
        Ok(serial)
    }

    /// Remove the action a packet's `ActionID` (or its absence) points at.
    pub fn lookup_and_remove(&mut self, action_id: Option<&str>) -> Option<PendingAction> {
        self.pending
            .remove(&CorrelationKey::from_action_id(action_id))
    }

    /// Borrow the action a packet's `ActionID` (or its absence) points at.
    pub fn get_mut(&mut self, action_id: Option<&str>) -> Option<&mut PendingAction> {
        self.pending
            .get_mut(&CorrelationKey::from_action_id(action_id))
    }

    /// Remove `key` only if it still holds the registration `serial`.
    pub fn remove_if(&mut self, key: &CorrelationKey, serial: u64) -> Option<PendingAction> {
        match self
            .pending
            .get(key)
        {
            Some(action) if action.serial == serial => self
                .pending
                .remove(key),
            _ => None,
        }
    }

    /// Whether `key` is registered.
    pub fn contains(&self, key: &CorrelationKey) -> bool {
        self.pending
            .contains_key(key)
    }

    /// Remove and return every pending action.
    pub fn drain(&mut self) -> Vec<PendingAction> {
        self.pending
            .drain()
            .map(|(_, action)| action)
            .collect()
    }

    /// Number of pending actions.
    pub fn len(&self) -> usize {
        self.pending
            .len()
    }

    /// `true` when nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.pending
            .is_empty()
    }
}
