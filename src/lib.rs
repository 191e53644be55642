pub mod api;
pub mod config;
pub mod connection;
pub mod hub;
pub mod message;
pub mod shutdown;
pub mod supervisor;
