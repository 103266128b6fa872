//! Result delivery to the code that sent an action

use crate::{action::Value, error::AmiResult};
use std::fmt;
use tokio::sync::oneshot;
use tracing::debug;

/// Completion callback. Runs on the connection's reader task and must not block.
pub type ActionCallback = Box<dyn FnOnce(AmiResult<Value>) + Send + 'static>;

/// Where a pending action's result goes.
///
/// [`deliver`](Delivery::deliver) consumes the target, so each action's
/// result is handed over at most once.
pub enum Delivery {
    /// A caller awaiting the paired receiver.
    Awaiting(oneshot::Sender<AmiResult<Value>>),
    /// A completion callback.
    Callback(ActionCallback),
}

impl Delivery {
    /// Awaiting delivery plus the receiver to wait on.
    pub fn awaiting() -> (Self, oneshot::Receiver<AmiResult<Value>>) {
        let (tx, rx) = oneshot::channel();
        (Delivery::Awaiting(tx), rx)
    }

    /// Callback delivery.
    pub fn callback<F>(f: F) -> Self
    where
        F: FnOnce(AmiResult<Value>) + Send + 'static,
    {
        Delivery::Callback(Box::new(f))
    }

    /// Hand over the result.
    pub fn deliver(self, result: AmiResult<Value>) {
        match self {
            Delivery::Awaiting(tx) => {
                if tx
                    .send(result)
                    .is_err()
                {
                    debug!("Result receiver dropped before delivery");
                }
            }
            Delivery::Callback(f) => f(result),
        }
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Delivery::Awaiting(_) => write!(f, "Awaiting"),
            Delivery::Callback(_) => write!(f, "Callback"),
        }
    }
}
