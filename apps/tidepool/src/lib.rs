pub mod chat;
pub mod config;
pub mod media;
pub mod orchestrator;
pub mod peer;
pub mod registry;
pub mod session;
pub mod telemetry;
pub mod transport;

pub use tidepool_proto as proto;
