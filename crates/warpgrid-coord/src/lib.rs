//! warpgrid-coord: the coordination store every WarpGrid host shares.
//!
//! Hosts publish what they serve and watch what they route to through a
//! hierarchical, versioned key/value tree with ephemeral nodes and
//! one-shot watches.
//!
//! # Components
//!
//! - **`Connection`**: the store contract, object-safe so callers hold
//!   an `Arc<dyn Connection>`
//! - **`MemoryStore`**: in-process implementation with session reaping
//! - **`Node`**: typed JSON records carrying their version token
//! - **`listen`**: per-child task supervisor for watched directories

pub mod connection;
pub mod error;
pub mod listen;
pub mod memory;
pub mod node;
pub mod path;

pub use connection::{
    Connection, CreateMode, Event, EventKind, NodeData, Op, Version, Watch, next_event,
};
pub use error::{CoordError, CoordResult};
pub use listen::{Listener, Shutdown, is_shutdown, listen, shutdown_signalled, wait_for_path};
pub use memory::{MemoryConnection, MemoryStore};
pub use node::{Node, create_node, decode, encode, get_node, get_node_w, set_node};
