// Core modules
pub mod config;
pub mod connector;
pub mod db;
pub mod engine;
pub mod error;
pub mod execution;
pub mod feed;
pub mod indicators;
pub mod ledger;
pub mod market_hours;
pub mod models;
pub mod persistence;
pub mod risk;
pub mod strategy;

// Re-export commonly used types
pub use config::Settings;
pub use engine::{Engine, EngineStatus};
pub use models::*;
pub use strategy::Strategy;

// Error handling
pub type Result<T> = std::result::Result<T, Box<dyn std::error::Error + Send + Sync>>;
