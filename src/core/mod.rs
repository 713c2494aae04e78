pub mod config;
pub mod connection;
pub mod message_log;
pub mod orchestrator;
pub mod peer_registry;
pub mod pipeline;
pub mod session_store;
pub mod signaling;
