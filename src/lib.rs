pub mod config;
pub mod entity;
pub mod error;
pub mod hub;
pub mod registry;
pub mod server;
pub mod session;
pub mod shutdown;

pub type Result<T> = std::result::Result<T, crate::error::RelayError>;
