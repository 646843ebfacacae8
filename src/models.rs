pub mod handler_registry;
pub mod message_log;
pub mod peer;
pub mod state;
