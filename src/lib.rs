pub mod agent;
pub mod api;
pub mod cli;
pub mod config;
pub mod database;
pub mod endpoints;
pub mod error;
pub mod matcher;
pub mod orchestrator;
pub mod relay;
pub mod scanner;
pub mod schedules;
pub mod server;
pub mod sources;
