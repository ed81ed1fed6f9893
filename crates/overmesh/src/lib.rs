//! Overmesh - software-defined overlay mesh networking
//!
//! Independent edge nodes, each fronting a private subnet, exchange IP
//! packets across the public internet. A central controller never forwards
//! data traffic; it only tells edges about each other and keeps that view
//! current as edges join, leave, or have routes added and removed.
//!
//! # Architecture
//!
//! - **Control plane** (controller): the [`server::RegistryServer`] holds one
//!   long-lived TCP session per edge, and the
//!   [`server::TopologyBroadcaster`] pushes topology deltas driven by a
//!   watched key/value [`store::Store`].
//! - **Data plane** (edge): the [`tun::TunDevice`] emits raw IP packets, the
//!   [`route::RouteTable`] picks the peer link per packet, and the
//!   [`peer::PeerManager`] owns the connect/detect-dead/reconnect lifecycle
//!   of every link. The [`client::EdgeClient`] keeps the edge registered and
//!   applies inbound topology changes.
//!
//! # Protocol
//!
//! All messages share one length-prefixed framing:
//!
//! ```text
//! +----------+----------+----------+----------------------------------+
//! | Ver(1)   | Cmd(1)   | Len(2)   | Payload (JSON, variable)         |
//! +----------+----------+----------+----------------------------------+
//! ```
//!
//! The payload is clear JSON; transport encryption is out of scope and a
//! known limitation of the wire format.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod client;
pub mod config;
pub mod error;
pub mod packet;
pub mod peer;
pub mod protocol;
pub mod route;
pub mod server;
pub mod stat;
pub mod store;
pub mod tun;
pub mod vpc;

pub use client::{EdgeClient, EdgeClientConfig};
pub use config::{ControllerConfig, EdgeConfig, SeedConfig, TunSettings};
pub use error::{MeshError, Result};
pub use packet::Packet;
pub use peer::{
    DataPlaneServer, NoopRoutes, OsRoutes, PeerLink, PeerManager, PeerManagerConfig,
    RouteProgrammer,
};
pub use protocol::{Command, Header, HEADER_SIZE, MAX_BODY_SIZE, PROTOCOL_VERSION};
pub use route::{normalize_cidr, RouteTable};
pub use server::{
    LogStatSink, RegistryConfig, RegistryServer, Session, SessionTable, StatSink,
    TopologyBroadcaster,
};
pub use stat::StatCollector;
pub use store::{
    Edge, EdgeManager, MemStore, Namespace, NamespaceManager, Route, RouteManager, Store,
    StoreEvent, StoreEventKind,
};
pub use tun::{MemTun, TunDevice};
pub use vpc::{vpc_for, NoopVpc, VpcRouter};

#[cfg(target_os = "linux")]
pub use tun::OsTun;
