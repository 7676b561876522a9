#![deny(unsafe_code)]

//! # Overall Example
//! ```rust,ignore
//!
//! use std::sync::Arc;
//! use rmqtt_endpoint::{AttributeConstraint, AttributeType, Endpoint, Result};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!    let endpoint = Endpoint::builder("dev-1").transport(Arc::new(MyTransport::new())).build().await?;
//!
//!    let speed = {
//!        let mut model = endpoint.model();
//!        let pump = model.create_node();
//!        let params = model.add_object(pump, "Params")?;
//!        let speed = model.add_attribute(params, "speed", AttributeType::Integer, AttributeConstraint::Parameter)?;
//!        model.attach_node("Pump", pump)?;
//!        speed
//!    };
//!    endpoint.add_listener(speed, Arc::new(|a: &rmqtt_endpoint::Attribute| println!("{:?}", a.value())))?;
//!    endpoint.announce()?;
//!
//!    endpoint.set_value(speed, 1200)?;
//!    endpoint.close().await
//! }
//!
//! ```

/// Attribute tree
pub mod model; // Endpoint, node, object and attribute arena
pub mod topic; // Topic paths and actions
pub mod transaction; // Grouped attribute writes

/// Connection
pub mod client; // Reconnecting client
pub mod endpoint; // Endpoint orchestrator and worker
pub mod transport; // Transport seam and connect options

/// Wire and storage
pub mod format; // Message format registry and JSON codec
pub mod persistence; // Store of undelivered messages

/// Ambient
pub mod error;
pub mod logger;
pub mod settings;

pub use client::{ClientState, ReconnectClient};
pub use endpoint::{ConnectionState, Endpoint, EndpointBuilder};
pub use error::{EndpointError, Result};
pub use format::{JsonMessageFormat, MessageFormat, MessageFormatRef, MessageFormats};
pub use model::{
    Attribute, AttributeConstraint, AttributeId, AttributeListener, AttributeType, AttributeValue, ContainerId,
    EntityId, Listener, Model, Node, NodeId, Object, ObjectId,
};
pub use persistence::{
    FilePersistence, MemoryPersistence, PendingKind, PendingUpdate, Persistence, PersistenceRef, PersistenceType,
};
pub use settings::{ConfigurationSource, Properties, Settings};
pub use topic::{Action, Topic};
pub use transaction::Transaction;
pub use transport::{
    ConnectOptions, LastWill, PacketId, QoS, TlsOptions, Transport, TransportHandler, TransportHandlerRef,
};

pub use rmqtt_utils as utils;
