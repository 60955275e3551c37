//! Runs qconn connections over the network: configuration, logging, and
//! TCP/WebSocket endpoints with a registry of live connections.

pub mod config;
pub mod logging;
pub mod node;
pub mod registry;

pub use config::{LogConfig, NodeConfig, TransportKind};
pub use logging::{init_logging, init_test_logging, LogGuard};
pub use node::{Node, NodeListener};
pub use registry::ConnectionRegistry;
