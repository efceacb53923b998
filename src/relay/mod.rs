//! WebSocket relay between the controller and remote agents.

pub mod auth;
pub mod client;
pub mod connection;
pub mod hub;
pub mod protocol;
