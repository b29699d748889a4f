pub mod config;
pub mod core;
pub mod server;

// Re-export main components for easy access
pub use crate::config::Config;
pub use crate::core::*;
pub use crate::server::FerrymanServer;
