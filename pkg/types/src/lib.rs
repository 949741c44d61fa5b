pub mod config;
pub mod lease;
pub mod node;
