pub mod bootstrap;
pub mod config;
pub mod logging;

pub use config::StreamConfig;
