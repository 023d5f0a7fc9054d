pub mod chat;
pub mod chunks;
pub mod config_cmd;
pub mod plugins;
pub mod runtime;
