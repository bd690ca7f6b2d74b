// Core modules
pub mod alerts;
pub mod api;
pub mod config;
pub mod error;
pub mod execution;
pub mod indicators;
pub mod marketdata;
pub mod models;
pub mod orderbook;
pub mod perf;
pub mod persistence;
pub mod signal;

// Re-export commonly used types
pub use error::BotError;
pub use models::*;
pub use signal::StrategyProfile;

// Error handling
pub type Result<T> = std::result::Result<T, BotError>;
