/// Wire commands and their payloads
pub mod message;

/// The TCP server and its per-command handlers
pub mod server;
