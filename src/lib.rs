// Re-export needed modules for testing
pub mod auth;
pub mod cache;
pub mod config;
pub mod models;
pub mod sync; // The realtime synchronization engine
pub mod utils;

// Re-export main types for convenience
pub use config::SyncConfig;
pub use models::*;
pub use sync::ChatClient; // Expose the ChatClient directly
