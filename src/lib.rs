// Public API - the orchestrator session and the capabilities it composes
pub mod config_map;
pub mod export;
pub mod io;
pub mod runner;
pub mod storage;
pub mod telemetry;
pub mod tracking;

// Internal modules
mod config;
