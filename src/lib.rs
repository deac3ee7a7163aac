//! rkad - a Kademlia distributed hash table
//!
//! This library implements the Kademlia protocol over UDP: a flat 160-bit
//! key space in which every node owns an identifier, stores opaque byte
//! values addressed by SHA-1 digest, and locates the nodes XOR-closest to
//! any target through iterative parallel lookups.
//!
//! # Getting Started
//!
//! ```no_run
//! use rkad::{DhtConfig, Server};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // Bind a node and join the network through a known peer.
//! let mut node = Server::new(DhtConfig::default());
//! node.listen(8468, None).await?;
//! node.bootstrap(&["203.0.113.7:8468".parse()?]).await?;
//!
//! // Write and read values by key.
//! node.set("device-fingerprint", &b"report bytes"[..]).await?;
//! let report = node.get("device-fingerprint").await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Architecture
//!
//! - [`Server`] - facade: bind, bootstrap, get/set, periodic refresh
//! - [`RoutingTable`] - splitting k-bucket peer index
//! - [`Protocol`] - RPC handlers (`ping`, `store`, `find_node`,
//!   `find_value`, plus the `stun`/`punch`/`hole` NAT helpers)
//! - [`Spider`] - iterative α-parallel lookup
//! - [`Storage`] - pluggable TTL value store
//!
//! Inbound datagrams flow transport → protocol → routing/storage; outbound
//! operations start at the server, which runs a spider that issues RPCs
//! through the same transport.

pub mod config;
pub mod constants;
pub mod crawl;
pub mod error;
pub mod heap;
pub mod message;
pub mod node;
pub mod protocol;
pub mod routing;
pub mod rpc;
pub mod server;
pub mod storage;

pub use config::DhtConfig;
pub use crawl::Spider;
pub use error::{KadError, Result};
pub use node::{Distance, Node, NodeId};
pub use protocol::{FindValueReply, Protocol};
pub use routing::RoutingTable;
pub use server::Server;
pub use storage::{MemoryStorage, Storage};
