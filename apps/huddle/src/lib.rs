pub mod config;
pub mod error;
pub mod ids;
pub mod media;
pub mod orchestrator;
pub mod peer;
pub mod registry;
pub mod room;
pub mod signaling;
pub mod telemetry;
pub mod view;
