//! Serial crate: sub-modules.

pub mod types;
pub mod error;
pub mod transport;
pub mod system;
pub mod outbound;
pub mod coalescer;
pub mod expr;
pub mod decode;
pub mod transcript;
pub mod scheduler;
pub mod port_scanner;
pub mod config;
pub mod service;

// Re-export top-level items for convenience.
pub use types::*;
pub use error::*;
pub use service::{EventReceiver, Terminal};
