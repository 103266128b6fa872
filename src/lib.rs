//! Asterisk Manager Interface (AMI) client for Rust
//!
//! This crate provides an async Rust client for the Asterisk Manager Interface,
//! allowing applications to log in to Asterisk, send actions, and receive events.
//!
//! # Architecture
//!
//! The library uses a split reader/writer design:
//! - [`AmiClient`] (Clone + Send): send actions from any task
//! - [`AmiEventStream`]: receive unsolicited events from a background reader task
//!
//! Replies are matched to actions by `ActionID`. Actions that expect a list
//! (`Status`, `CoreShowChannels`, ...) collect their item events until the
//! terminating `...Complete` event and resolve with every item at once.
//!
//! # Examples
//!
//! ## Sending Actions
//!
//! ```rust,no_run
//! use asterisk_ami_tokio::{Action, AmiClient, AmiError};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), AmiError> {
//!     let (client, _events) = AmiClient::connect("localhost", 5038, "admin", "secret").await?;
//!
//!     client.ping().await?;
//!
//!     let uptime = client.send_action(Action::core_status()).await?;
//!     if let Some(status) = uptime.as_mapping() {
//!         println!("Up since {}", status.header("CoreStartupTime").unwrap_or("?"));
//!     }
//!
//!     let channels = client.send_action(Action::status(None)).await?;
//!     for channel in channels.as_list().unwrap_or_default() {
//!         println!("{}", channel.header("Channel").unwrap_or("?"));
//!     }
//!
//!     client.logoff().await
//! }
//! ```
//!
//! ## Custom Actions
//!
//! Anything without a dedicated builder is assembled from fields; the reply
//! shape says what the result looks like:
//!
//! ```rust
//! use asterisk_ami_tokio::{Action, ListSpec, ResponseShape};
//!
//! let action = Action::new("ConfbridgeList")
//!     .field("Conference", "1234")
//!     .expect(ResponseShape::List(
//!         ListSpec::new("ConfbridgeListComplete").items("ConfbridgeList"),
//!     ));
//!
//! let wire = action.to_wire_format().unwrap();
//! assert!(wire.starts_with("Action: ConfbridgeList\r\n"));
//! assert!(wire.ends_with("\r\n\r\n"));
//! ```
//!
//! ## Event Subscription
//!
//! ```rust,no_run
//! use asterisk_ami_tokio::{AmiClient, AmiConnectOptions};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let options = AmiConnectOptions {
//!         events: "call,system".into(),
//!         ..Default::default()
//!     };
//!     let (_client, mut events) =
//!         AmiClient::connect_with_options("localhost", 5038, "admin", "secret", options).await?;
//!
//!     while let Some(Ok(event)) = events.recv().await {
//!         println!("Received event: {} on {:?}", event.name(), event.channel());
//!     }
//!
//!     Ok(())
//! }
//! ```

#[macro_use]
mod macros;

pub mod action;
pub mod actions;
pub mod aggregator;
pub mod connection;
pub mod constants;
pub mod delivery;
pub mod engine;
pub mod error;
pub mod event;
pub mod headers;
pub mod packet;
pub mod protocol;
pub mod registry;

pub use action::{Action, ListSpec, ResponseShape, Value};
pub use aggregator::{CountMismatch, ListAggregator, ListOutcome, ListState, ListStep};
pub use connection::{
    AmiClient, AmiConnectOptions, AmiEventStream, ConnectionState, DisconnectReason,
    ReconnectPolicy,
};
pub use constants::DEFAULT_AMI_PORT;
pub use delivery::{ActionCallback, Delivery};
pub use engine::{Dispatch, Engine};
pub use error::{AmiError, AmiResult};
pub use event::AmiEvent;
pub use headers::{AmiHeader, ResponseStatus};
pub use packet::{Packet, PacketKind};
pub use protocol::AmiParser;
pub use registry::{ActionRegistry, CorrelationKey, PendingAction};
