//! Core abstractions for the Courier messaging middleware.
//!
//! Courier is a broker-agnostic messaging layer: one typed
//! publish/subscribe façade, concrete transports behind a narrow port,
//! and reliability features composed as broker decorators. This crate
//! holds everything the rest of the workspace builds on:
//!
//! - [`message::Message`] and [`message::Envelope`] — typed messages and
//!   their wire carrier
//! - [`broker::Broker`] / [`broker::Transport`] — the decorator surface
//!   and the transport port
//! - [`base::CoreBroker`] — subscription registry, dispatch and the
//!   serialize→compress→transport publish path
//! - [`serialization`] and [`compression`] — wire codecs
//! - [`config::CourierConfig`] — the nested, eagerly validated options
//!   bundle
//! - [`tenant`] — tenant identity extraction for multi-tenant keying
//!
//! # Example
//!
//! ```rust,ignore
//! use courier_core::base::CoreBroker;
//! use courier_core::broker::BrokerExt;
//! use courier_core::message::Message;
//! use courier_core::options::{PublishOptions, SubscriptionOptions};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Clone, Debug, Serialize, Deserialize)]
//! struct OrderPlaced { order_id: String }
//!
//! impl Message for OrderPlaced {
//!     fn message_type() -> &'static str { "OrderPlaced.v1" }
//! }
//!
//! # async fn example(transport: impl courier_core::broker::Transport) -> Result<(), courier_core::error::BrokerError> {
//! let broker = CoreBroker::new(transport);
//!
//! broker.subscribe::<OrderPlaced, _, _>(
//!     |order, _ctx| async move {
//!         println!("order {}", order.order_id);
//!         Ok(())
//!     },
//!     SubscriptionOptions::default(),
//! ).await?;
//!
//! broker.publish(&OrderPlaced { order_id: "o-1".into() }, PublishOptions::default()).await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod base;
pub mod broker;
pub mod compression;
pub mod config;
pub mod context;
pub mod error;
pub mod message;
pub mod options;
pub mod serialization;
pub mod tenant;

pub use base::CoreBroker;
pub use broker::{Broker, BrokerExt, BrokerFuture, Dispatcher, SubscriptionInfo, Transport};
pub use config::CourierConfig;
pub use context::MessageContext;
pub use error::BrokerError;
pub use message::{Envelope, Message};
pub use options::{PublishOptions, SubscriptionOptions};
pub use serialization::SerializationFormat;
